//! Compiling, calling and releasing artifacts through the `Compiler`.

use kiln::{ArgList, CompileError, Compiler, Expr, Param, Ty, Value};

// ── Helpers ────────────────────────────────────────────────────────────

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn add(l: Expr, r: Expr) -> Expr {
    Expr::binop("+", l, r)
}

fn int_fn(c: &mut Compiler, params: &[&str], body: Expr) -> kiln::ArtifactId {
    let params = params.iter().map(|p| Param::typed(*p, Ty::int())).collect();
    c.compile_expr(&Expr::lambda(params, body)).unwrap()
}

// ── Round trip ─────────────────────────────────────────────────────────

#[test]
fn increment_round_trip() {
    init_tracing();
    let mut c = Compiler::new().unwrap();
    let id = int_fn(&mut c, &["x"], add(Expr::var("x"), Expr::int(1)));
    assert_eq!(c.invoke(id, &[Value::Int(41)]), Ok(Value::Int(42)));

    c.release_machine_code(id).unwrap();
    assert_eq!(c.release_machine_code(id), Err(CompileError::ArtifactReleased(id)));
    assert_eq!(c.invoke(id, &[Value::Int(41)]), Err(CompileError::ArtifactReleased(id)));
}

#[test]
fn typed_function_pointer() {
    let mut c = Compiler::new().unwrap();
    let body = Expr::binop("*", add(Expr::var("x"), Expr::var("y")), Expr::int(2));
    let f = c
        .compile_fn::<extern "C" fn(i64, i64) -> i64>(ArgList::from(["x", "y"]), &body)
        .unwrap();
    // SAFETY: the artifact is live until the end of the test.
    let f = unsafe { f.get() };
    assert_eq!(f(3, 4), 14);
    assert_eq!(f(-1, 1), 0);
}

#[test]
fn typed_arity_must_match_names() {
    let mut c = Compiler::new().unwrap();
    let err = c
        .compile_fn::<extern "C" fn(i64) -> i64>(ArgList::from(["x", "y"]), &Expr::var("x"))
        .unwrap_err();
    assert_eq!(err, CompileError::ArityMismatch { expected: 1, found: 2 });
}

#[test]
fn float_arguments_and_results() {
    let mut c = Compiler::new().unwrap();
    let (id, _) = c
        .unsafe_compile_fn(
            &Ty::float(),
            &ArgList::from(["x"]),
            &[Ty::float()],
            &Expr::binop("*", Expr::var("x"), Expr::float(0.5)),
        )
        .unwrap();
    assert_eq!(c.invoke(id, &[Value::Float(5.0)]), Ok(Value::Float(2.5)));
}

#[test]
fn declared_result_type_is_checked() {
    let mut c = Compiler::new().unwrap();
    let err = c
        .unsafe_compile_fn(&Ty::bool(), &ArgList::from(["x"]), &[Ty::int()], &add(Expr::var("x"), Expr::int(1)))
        .unwrap_err();
    assert!(matches!(err, CompileError::TypeMismatch { .. }), "got {:?}", err);
}

#[test]
fn invoke_checks_argument_count_and_kinds() {
    let mut c = Compiler::new().unwrap();
    let id = int_fn(&mut c, &["x"], Expr::var("x"));
    assert_eq!(
        c.invoke(id, &[]),
        Err(CompileError::ArityMismatch { expected: 1, found: 0 })
    );
    assert!(matches!(
        c.invoke(id, &[Value::Bool(true)]),
        Err(CompileError::TypeMismatch { .. })
    ));
    assert!(matches!(
        c.invoke(id, &[Value::Ptr(0x1000)]),
        Err(CompileError::TypeMismatch { .. })
    ));
}

// ── Definitions ────────────────────────────────────────────────────────

#[test]
fn defined_functions_are_callable() {
    let mut c = Compiler::new().unwrap();
    c.define(
        "inc",
        &Expr::lambda(vec![Param::typed("n", Ty::int())], add(Expr::var("n"), Expr::int(1))),
    )
    .unwrap();
    c.define("base", &Expr::int(40)).unwrap();
    let id = c
        .compile_expr(&Expr::call("inc", vec![Expr::call("inc", vec![Expr::var("base")])]))
        .unwrap();
    assert_eq!(c.invoke(id, &[]), Ok(Value::Int(42)));
    assert_eq!(
        c.define("base", &Expr::int(1)),
        Err(CompileError::DuplicateDefinition {
            what: "value",
            name: "base".into()
        })
    );
}

#[test]
fn recursive_definition() {
    let mut c = Compiler::new().unwrap();
    let n = || Expr::var("n");
    let body = Expr::if_(
        Expr::binop("<=", n(), Expr::int(1)),
        Expr::int(1),
        Expr::binop("*", n(), Expr::call("fact", vec![Expr::binop("-", n(), Expr::int(1))])),
    );
    c.define("fact", &Expr::lambda(vec![Param::typed("n", Ty::int())], body)).unwrap();
    let id = int_fn(&mut c, &["k"], Expr::call("fact", vec![Expr::var("k")]));
    assert_eq!(c.invoke(id, &[Value::Int(5)]), Ok(Value::Int(120)));
}

#[test]
fn generic_definition_is_specialised_on_use() {
    let mut c = Compiler::new().unwrap();
    c.define("twice", &Expr::lam(&["f", "x"], Expr::call("f", vec![Expr::call("f", vec![Expr::var("x")])])))
        .unwrap();
    let (names, _) = c.dump_type_env();
    assert!(names.contains(&"twice".to_string()));
    assert!(!c.has_value_binding("twice@[((Int) -> Int, Int) -> Int]"));

    let inc = Expr::lambda(vec![Param::typed("y", Ty::int())], add(Expr::var("y"), Expr::int(1)));
    let id = c
        .compile_expr(&Expr::call("twice", vec![inc, Expr::int(40)]))
        .unwrap();
    assert_eq!(c.invoke(id, &[]), Ok(Value::Int(42)));
    assert_eq!(c.last_drain_count(), 1);
    assert!(c.has_value_binding("twice@[((Int) -> Int, Int) -> Int]"));
}

#[test]
fn forward_declared_function_faults_until_defined() {
    let mut c = Compiler::new().unwrap();
    let int_to_int = Ty::fun(vec![Ty::int()], Ty::int());
    c.forward_declare("later", &kiln::QualType::mono(int_to_int)).unwrap();
    let id = int_fn(&mut c, &["x"], Expr::call("later", vec![Expr::var("x")]));
    assert!(matches!(c.invoke(id, &[Value::Int(1)]), Err(CompileError::UnboundValue { .. })));

    c.define(
        "later",
        &Expr::lambda(vec![Param::typed("n", Ty::int())], Expr::binop("*", Expr::var("n"), Expr::int(3))),
    )
    .unwrap();
    assert_eq!(c.invoke(id, &[Value::Int(5)]), Ok(Value::Int(15)));
}

#[test]
fn forward_declared_value_cannot_be_compiled() {
    let mut c = Compiler::new().unwrap();
    c.forward_declare("limit", &kiln::QualType::mono(Ty::int())).unwrap();
    let before = c.show_type_env();
    let err = c.compile_expr(&add(Expr::var("limit"), Expr::int(1))).unwrap_err();
    assert_eq!(err, CompileError::UnboundValue { name: "limit".into() });
    assert_eq!(c.show_type_env(), before);
}

// ── Inspection ─────────────────────────────────────────────────────────

#[test]
fn machine_code_and_module_dump() {
    let mut c = Compiler::new().unwrap();
    let bytes = c
        .machine_code_for(&Expr::lambda(vec![Param::typed("x", Ty::int())], Expr::var("x")))
        .unwrap();
    assert!(!bytes.is_empty());
    assert_eq!(c.jit().live_artifacts(), 0);
    let dump = c.dump_module();
    assert!(dump.contains("; unit expr1"), "{}", dump);
    assert!(dump.contains("(released)"), "{}", dump);
}

#[test]
fn inlining_keeps_results() {
    let mut c = Compiler::new().unwrap();
    c.set_enable_module_inlining(true);
    c.define(
        "sq",
        &Expr::lambda(vec![Param::typed("n", Ty::int())], Expr::binop("*", Expr::var("n"), Expr::var("n"))),
    )
    .unwrap();
    let id = int_fn(&mut c, &["x"], add(Expr::call("sq", vec![Expr::var("x")]), Expr::int(1)));
    assert_eq!(c.invoke(id, &[Value::Int(6)]), Ok(Value::Int(37)));
}
