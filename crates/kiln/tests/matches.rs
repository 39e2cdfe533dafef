//! Pattern matching through every lowering strategy.

use kiln::{
    CompileError, Compiler, CompilerConfig, Expr, FaultKind, Lit, MatchArm, Param, Pattern, Ty, UnreachableRows,
    Value,
};

fn int_param(name: &str) -> Param {
    Param::typed(name, Ty::int())
}

fn strategies() -> Vec<(&'static str, CompilerConfig)> {
    let base = CompilerConfig::default();
    vec![
        ("compiled", base.clone()),
        (
            "columnwise",
            CompilerConfig {
                build_columnwise_matches: true,
                ..base.clone()
            },
        ),
        (
            "interpreted",
            CompilerConfig {
                build_interpreted_matches: true,
                ..base.clone()
            },
        ),
        (
            "tables",
            CompilerConfig {
                always_lower_prim_match_tables: true,
                ..base
            },
        ),
    ]
}

/// `match n { 0 -> 10, 1 -> 20, 5 -> 50, 100 -> 7, _ -> n * 2 }`
fn sparse_int_match() -> Expr {
    let n = || Expr::var("n");
    let arms = [(0, 10), (1, 20), (5, 50), (100, 7)]
        .into_iter()
        .map(|(k, v)| MatchArm::new(vec![Pattern::int(k)], Expr::int(v)))
        .chain(std::iter::once(MatchArm::new(
            vec![Pattern::Wildcard],
            Expr::binop("*", n(), Expr::int(2)),
        )))
        .collect();
    Expr::lambda(vec![int_param("n")], Expr::match_(vec![n()], arms))
}

fn sparse_expected(n: i64) -> i64 {
    match n {
        0 => 10,
        1 => 20,
        5 => 50,
        100 => 7,
        _ => n * 2,
    }
}

/// Two columns, overlapping rows, first match wins.
fn two_column_match() -> Expr {
    let row = |x: Pattern, y: Pattern, v: i64| MatchArm::new(vec![x, y], Expr::int(v));
    Expr::lambda(
        vec![int_param("x"), int_param("y")],
        Expr::match_(
            vec![Expr::var("x"), Expr::var("y")],
            vec![
                row(Pattern::int(0), Pattern::Wildcard, 1),
                row(Pattern::Wildcard, Pattern::int(0), 2),
                row(Pattern::int(1), Pattern::int(1), 3),
                row(Pattern::Wildcard, Pattern::Wildcard, 4),
            ],
        ),
    )
}

fn two_column_expected(x: i64, y: i64) -> i64 {
    match (x, y) {
        (0, _) => 1,
        (_, 0) => 2,
        (1, 1) => 3,
        _ => 4,
    }
}

#[test]
fn strategies_agree_on_integer_matches() {
    for (label, config) in strategies() {
        let mut c = Compiler::with_config(config).unwrap();
        let one = c.compile_expr(&sparse_int_match()).unwrap();
        let two = c.compile_expr(&two_column_match()).unwrap();
        for n in (-3..=8).chain([99, 100, 101, i64::MIN, i64::MAX]) {
            assert_eq!(
                c.invoke(one, &[Value::Int(n)]),
                Ok(Value::Int(sparse_expected(n))),
                "{} strategy, n = {}",
                label,
                n
            );
        }
        for x in -1..=2 {
            for y in -1..=2 {
                assert_eq!(
                    c.invoke(two, &[Value::Int(x), Value::Int(y)]),
                    Ok(Value::Int(two_column_expected(x, y))),
                    "{} strategy, ({}, {})",
                    label,
                    x,
                    y
                );
            }
        }
    }
}

#[test]
fn guards_fall_through_to_later_arms() {
    let n = || Expr::var("n");
    let body = Expr::match_(
        vec![n()],
        vec![
            MatchArm::guarded(vec![Pattern::bind("k")], Expr::binop("<", Expr::int(10), Expr::var("k")), Expr::int(1)),
            MatchArm::new(vec![Pattern::int(3)], Expr::int(2)),
            MatchArm::new(vec![Pattern::Wildcard], Expr::int(3)),
        ],
    );
    for (label, config) in strategies() {
        let mut c = Compiler::with_config(config).unwrap();
        let id = c.compile_expr(&Expr::lambda(vec![int_param("n")], body.clone())).unwrap();
        assert_eq!(c.invoke(id, &[Value::Int(11)]), Ok(Value::Int(1)), "{}", label);
        assert_eq!(c.invoke(id, &[Value::Int(3)]), Ok(Value::Int(2)), "{}", label);
        assert_eq!(c.invoke(id, &[Value::Int(10)]), Ok(Value::Int(3)), "{}", label);
    }
}

#[test]
fn tuple_and_as_patterns_bind_components() {
    let mut c = Compiler::new().unwrap();
    let body = Expr::match_(
        vec![Expr::tuple(vec![Expr::var("a"), Expr::var("b")])],
        vec![MatchArm::new(
            vec![Pattern::As(
                "pair".into(),
                Box::new(Pattern::Tuple(vec![Pattern::bind("x"), Pattern::bind("y")])),
            )],
            Expr::binop("-", Expr::var("x"), Expr::var("y")),
        )],
    );
    let id = c
        .compile_expr(&Expr::lambda(vec![int_param("a"), int_param("b")], body))
        .unwrap();
    assert_eq!(c.invoke(id, &[Value::Int(9), Value::Int(4)]), Ok(Value::Int(5)));
}

// ── Variants ───────────────────────────────────────────────────────────

fn define_shape(c: &mut Compiler) {
    c.define_named_type(
        "Shape",
        &[],
        &Ty::variant(vec![("Circle", Ty::int()), ("Square", Ty::int()), ("Dot", Ty::unit())]),
    )
    .unwrap();
}

fn area(shape: Expr) -> Expr {
    let r = || Expr::var("r");
    Expr::match_(
        vec![shape],
        vec![
            MatchArm::new(
                vec![Pattern::ctor("Circle", Some(Pattern::bind("r")))],
                Expr::binop("*", Expr::int(3), Expr::binop("*", r(), r())),
            ),
            MatchArm::new(
                vec![Pattern::ctor("Square", Some(Pattern::bind("r")))],
                Expr::binop("*", r(), r()),
            ),
        ],
    )
}

#[test]
fn constructor_patterns_select_payloads() {
    for (label, config) in strategies() {
        let mut c = Compiler::with_config(config).unwrap();
        define_shape(&mut c);
        let circle = c.compile_expr(&area(Expr::ctor("Circle", Some(Expr::int(2))))).unwrap();
        let square = c.compile_expr(&area(Expr::ctor("Square", Some(Expr::int(5))))).unwrap();
        assert_eq!(c.invoke(circle, &[]), Ok(Value::Int(12)), "{}", label);
        assert_eq!(c.invoke(square, &[]), Ok(Value::Int(25)), "{}", label);
    }
}

#[test]
fn non_exhaustive_match_faults_at_run_time() {
    for (label, config) in strategies() {
        let mut c = Compiler::with_config(config).unwrap();
        define_shape(&mut c);
        let id = c.compile_expr(&area(Expr::ctor("Dot", None))).unwrap();
        assert_eq!(c.invoke(id, &[]), Err(CompileError::MatchFailure), "{}", label);
        // The fault does not outlive the call.
        let ok = c.compile_expr(&area(Expr::ctor("Square", Some(Expr::int(3))))).unwrap();
        assert_eq!(c.invoke(ok, &[]), Ok(Value::Int(9)), "{}", label);
    }
}

/// Four of five constructors, dense enough for a jump table on the tag.
fn define_suit(c: &mut Compiler) {
    let ctors = ["Clubs", "Diamonds", "Hearts", "Spades", "Joker"];
    c.define_named_type(
        "Suit",
        &[],
        &Ty::variant(ctors.iter().map(|n| (*n, Ty::unit())).collect()),
    )
    .unwrap();
}

fn rank(suit: Expr) -> Expr {
    let arms = ["Clubs", "Diamonds", "Hearts", "Spades"]
        .iter()
        .zip(1..)
        .map(|(n, v)| MatchArm::new(vec![Pattern::ctor(*n, None)], Expr::int(v)))
        .collect();
    Expr::match_(vec![suit], arms)
}

#[test]
fn tag_tables_select_and_fail_like_other_strategies() {
    for (label, config) in strategies() {
        let mut c = Compiler::with_config(config).unwrap();
        define_suit(&mut c);
        for (n, v) in ["Clubs", "Diamonds", "Hearts", "Spades"].iter().zip(1..) {
            let id = c.compile_expr(&rank(Expr::ctor(*n, None))).unwrap();
            assert_eq!(c.invoke(id, &[]), Ok(Value::Int(v)), "{} strategy, {}", label, n);
        }
        let joker = c.compile_expr(&rank(Expr::ctor("Joker", None))).unwrap();
        assert_eq!(c.invoke(joker, &[]), Err(CompileError::MatchFailure), "{}", label);
    }
}

// ── Faults inside called functions ─────────────────────────────────────

/// `pair(s) = match s { Circle r -> (r, r) }`, then
/// `match pair(shape) { (a, b) -> a + b }`.
fn sum_of_pair(c: &mut Compiler, shape: Expr) -> kiln::ArtifactId {
    c.define(
        "pair",
        &Expr::lambda(
            vec![Param::typed("s", Ty::con("Shape"))],
            Expr::match_(
                vec![Expr::var("s")],
                vec![MatchArm::new(
                    vec![Pattern::ctor("Circle", Some(Pattern::bind("r")))],
                    Expr::tuple(vec![Expr::var("r"), Expr::var("r")]),
                )],
            ),
        ),
    )
    .unwrap();
    let body = Expr::match_(
        vec![Expr::call("pair", vec![shape])],
        vec![MatchArm::new(
            vec![Pattern::Tuple(vec![Pattern::bind("a"), Pattern::bind("b")])],
            Expr::binop("+", Expr::var("a"), Expr::var("b")),
        )],
    );
    c.compile_expr(&body).unwrap()
}

#[test]
fn match_failure_in_a_callee_stops_the_caller() {
    for inlining in [false, true] {
        for (label, config) in strategies() {
            let mut c = Compiler::with_config(config).unwrap();
            c.set_enable_module_inlining(inlining);
            define_shape(&mut c);
            let dot = sum_of_pair(&mut c, Expr::ctor("Dot", None));
            assert_eq!(c.invoke(dot, &[]), Err(CompileError::MatchFailure), "{} {}", label, inlining);
            let circle = c.compile_expr(&Expr::match_(
                vec![Expr::call("pair", vec![Expr::ctor("Circle", Some(Expr::int(4)))])],
                vec![MatchArm::new(
                    vec![Pattern::Tuple(vec![Pattern::bind("a"), Pattern::bind("b")])],
                    Expr::binop("*", Expr::var("a"), Expr::var("b")),
                )],
            ));
            assert_eq!(c.invoke(circle.unwrap(), &[]), Ok(Value::Int(16)), "{} {}", label, inlining);
        }
    }
}

#[test]
fn index_fault_crosses_two_calls() {
    let mut c = Compiler::new().unwrap();
    c.define(
        "at",
        &Expr::lambda(
            vec![Param::typed("xs", Ty::array(Ty::int())), int_param("i")],
            Expr::call("index", vec![Expr::var("xs"), Expr::var("i")]),
        ),
    )
    .unwrap();
    let xs = Expr::array(vec![Expr::int(1), Expr::int(2), Expr::int(3)]);
    c.define(
        "wrap",
        &Expr::lambda(
            vec![int_param("i")],
            Expr::tuple(vec![Expr::call("at", vec![xs, Expr::var("i")]), Expr::int(10)]),
        ),
    )
    .unwrap();
    let id = c
        .compile_expr(&Expr::lambda(
            vec![int_param("i")],
            Expr::match_(
                vec![Expr::call("wrap", vec![Expr::var("i")])],
                vec![MatchArm::new(
                    vec![Pattern::Tuple(vec![Pattern::bind("a"), Pattern::bind("b")])],
                    Expr::binop("+", Expr::var("a"), Expr::var("b")),
                )],
            ),
        ))
        .unwrap();
    assert_eq!(c.invoke(id, &[Value::Int(1)]), Ok(Value::Int(12)));
    assert_eq!(
        c.invoke(id, &[Value::Int(5)]),
        Err(CompileError::Runtime(FaultKind::IndexOutOfBounds))
    );
    assert_eq!(c.invoke(id, &[Value::Int(2)]), Ok(Value::Int(13)));
}

// ── Reachability ───────────────────────────────────────────────────────

fn shadowed_match() -> Expr {
    Expr::lambda(
        vec![int_param("n")],
        Expr::match_(
            vec![Expr::var("n")],
            vec![
                MatchArm::new(vec![Pattern::Wildcard], Expr::int(1)),
                MatchArm::new(vec![Pattern::int(0)], Expr::int(2)),
                MatchArm::new(vec![Pattern::int(1)], Expr::int(3)),
            ],
        ),
    )
}

#[test]
fn required_reachability_rejects_dead_arms() {
    let mut c = Compiler::new().unwrap();
    c.set_require_match_reachability(true);
    let before = c.show_type_env();
    let err = c.define("shadowed", &shadowed_match()).unwrap_err();
    assert_eq!(err, CompileError::UnreachableClause { arm: 1 });
    assert_eq!(c.show_type_env(), before);
    assert!(!c.has_value_binding("shadowed"));
}

#[test]
fn dead_arms_are_reported_to_the_sink() {
    let mut c = Compiler::new().unwrap();
    let sink = UnreachableRows::default();
    c.set_unreachable_rows_sink(Some(sink.clone()));
    let id = c.compile_expr(&shadowed_match()).unwrap();
    assert_eq!(c.invoke(id, &[Value::Int(0)]), Ok(Value::Int(1)));

    let rows = sink.lock();
    assert_eq!(rows.iter().map(|r| r.arm).collect::<Vec<_>>(), vec![1, 2]);
    assert_eq!(rows[0].pattern, "0");
}

#[test]
fn negative_zero_and_nan_arms_are_dead() {
    let float = |x: f64| Pattern::Lit(Lit::Float(x));
    let body = Expr::match_(
        vec![Expr::var("x")],
        vec![
            MatchArm::new(vec![float(0.0)], Expr::int(1)),
            MatchArm::new(vec![float(-0.0)], Expr::int(2)),
            MatchArm::new(vec![float(f64::NAN)], Expr::int(3)),
            MatchArm::new(vec![Pattern::Wildcard], Expr::int(4)),
        ],
    );
    let f = Expr::lambda(vec![Param::typed("x", Ty::float())], body);

    let mut c = Compiler::new().unwrap();
    let sink = UnreachableRows::default();
    c.set_unreachable_rows_sink(Some(sink.clone()));
    let id = c.compile_expr(&f).unwrap();
    assert_eq!(sink.lock().iter().map(|r| r.arm).collect::<Vec<_>>(), vec![1, 2]);
    assert_eq!(c.invoke(id, &[Value::Float(-0.0)]), Ok(Value::Int(1)));
    assert_eq!(c.invoke(id, &[Value::Float(f64::NAN)]), Ok(Value::Int(4)));

    c.set_require_match_reachability(true);
    assert_eq!(c.compile_expr(&f).unwrap_err(), CompileError::UnreachableClause { arm: 1 });
}
