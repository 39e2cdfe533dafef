//! Named types, aliases, foreign types, upcasts and conversion search.

use kiln::{CompileError, Compiler, Expr, ForeignIdentity, Param, Ty, TypeError, Value};

fn point() -> Ty {
    Ty::record(vec![("x", Ty::int()), ("y", Ty::int())])
}

fn names(entries: &[kiln::SearchEntry]) -> Vec<&str> {
    entries.iter().map(|e| e.name.as_str()).collect()
}

// ── Aliases ────────────────────────────────────────────────────────────

#[test]
fn aliases_expand_everywhere() {
    let mut c = Compiler::new().unwrap();
    c.define_type_alias("Point", &[], &point()).unwrap();
    c.define_type_alias("List", &["a"], &Ty::array(Ty::con("a"))).unwrap();
    assert!(c.is_type_alias_name("Point"));
    assert!(!c.is_type_name("Point"));

    let once = c.replace_type_aliases(&Ty::app("List", vec![Ty::con("Point")]));
    assert_eq!(once, Ty::array(point()));
    assert_eq!(c.replace_type_aliases(&once), once);

    let sum = Expr::lambda(
        vec![Param::typed("p", Ty::con("Point"))],
        Expr::binop("+", Expr::field(Expr::var("p"), "x"), Expr::field(Expr::var("p"), "y")),
    );
    let call = Expr::app(sum, vec![Expr::record(vec![("x", Expr::int(2)), ("y", Expr::int(3))])]);
    let id = c.compile_expr(&call).unwrap();
    assert_eq!(c.invoke(id, &[]), Ok(Value::Int(5)));
}

#[test]
fn cyclic_alias_is_rejected() {
    let mut c = Compiler::new().unwrap();
    let err = c
        .define_type_alias("Loop", &[], &Ty::array(Ty::con("Loop")))
        .unwrap_err();
    assert!(matches!(err, CompileError::CyclicAlias { ref name, .. } if name == "Loop"), "{:?}", err);
    assert!(!c.is_type_alias_name("Loop"));
}

// ── Named types ────────────────────────────────────────────────────────

#[test]
fn named_type_redefinition() {
    let mut c = Compiler::new().unwrap();
    let opt = Ty::variant(vec![("None", Ty::unit()), ("Some", Ty::con("a"))]);
    let head = c.define_named_type("Opt", &["a"], &opt).unwrap();
    assert_eq!(c.define_named_type("Opt", &["a"], &opt).unwrap(), head);
    assert!(c.is_type_name("Opt"));
    assert_eq!(c.named_type_representation("Opt"), Some(opt));

    let err = c
        .define_named_type("Opt", &["a"], &Ty::variant(vec![("Nothing", Ty::unit())]))
        .unwrap_err();
    assert_eq!(
        err,
        CompileError::DuplicateDefinition {
            what: "type",
            name: "Opt".into()
        }
    );
}

// ── Foreign types and upcasts ──────────────────────────────────────────

struct Shape {
    _sides: u32,
}

struct Square {
    _base: Shape,
}

struct Unrelated;

#[test]
fn upcasts_follow_registered_edges() {
    let mut c = Compiler::new().unwrap();
    c.add_obj::<Square, Shape>().unwrap();
    let square = c.lift_mono_type::<*const Square>().unwrap();
    let shape = c.lift_mono_type::<*const Shape>().unwrap();
    let other = c.lift_mono_type::<*const Unrelated>().unwrap();

    assert!(c.is_usable_as(&square, &shape));
    assert!(!c.is_usable_as(&shape, &square));
    assert!(!c.is_usable_as(&other, &shape));
    assert!(c.is_usable_as(&other, &other));

    let found = c.search(&square, &shape).unwrap();
    assert_eq!(names(&found), vec!["upcast"]);
    assert!(c.search(&shape, &square).unwrap().is_empty());
}

#[test]
fn foreign_layout_conflicts_are_reported() {
    let mut c = Compiler::new().unwrap();
    let id = || ForeignIdentity::Named("sensor".into());
    let ty = c.opaque_ptr_mono_type(id(), "Sensor", 16, false).unwrap();
    assert_eq!(c.opaque_ptr_mono_type(id(), "Sensor", 16, false).unwrap(), ty);
    assert!(c.opaque_ptr_poly_type(id(), "Sensor", 16, false).unwrap().is_mono());

    let err = c.opaque_ptr_mono_type(id(), "Sensor", 32, false).unwrap_err();
    assert!(matches!(err, CompileError::ForeignTypeConflict { .. }), "{:?}", err);
}

// ── Search ─────────────────────────────────────────────────────────────

#[test]
fn search_is_sorted_and_tracks_new_globals() {
    let mut c = Compiler::new().unwrap();
    let found = c.search(&Ty::int(), &Ty::float()).unwrap();
    assert_eq!(names(&found), vec!["convert", "toFloat"]);
    assert_eq!(names(&c.search(&Ty::int(), &Ty::int()).unwrap())[0], "id");

    c.define(
        "half",
        &Expr::lambda(
            vec![Param::typed("n", Ty::int())],
            Expr::binop("*", Expr::call("toFloat", vec![Expr::var("n")]), Expr::float(0.5)),
        ),
    )
    .unwrap();
    let found = c.search(&Ty::int(), &Ty::float()).unwrap();
    assert_eq!(names(&found), vec!["convert", "half", "toFloat"]);

    // Every entry is a ready-made conversion function.
    let id = c.compile_expr(&Expr::app(found[1].expr.clone(), vec![Expr::int(3)])).unwrap();
    assert_eq!(c.invoke(id, &[]), Ok(Value::Float(1.5)));
}

#[test]
fn repeated_search_hits_the_cache() {
    let mut c = Compiler::new().unwrap();
    let first = c.search(&Ty::char(), &Ty::int()).unwrap();
    let misses = c.search_cache().misses();
    let second = c.search(&Ty::char(), &Ty::int()).unwrap();
    assert_eq!(first, second);
    assert_eq!(c.search_cache().misses(), misses);
    assert!(c.search_cache().hits() >= 1);
    assert_eq!(names(&first), vec!["convert", "ord"]);
}

#[test]
fn search_from_expressions_and_names() {
    let mut c = Compiler::new().unwrap();
    let before = c.show_type_env();
    let found = c
        .search_expr(&Expr::binop("+", Expr::int(1), Expr::int(2)), &Ty::float())
        .unwrap();
    assert_eq!(names(&found), vec!["convert", "toFloat"]);
    assert_eq!(c.show_type_env(), before);

    c.define("count", &Expr::int(4)).unwrap();
    assert_eq!(names(&c.search_name("count", &Ty::int()).unwrap())[0], "id");

    c.define("pick", &Expr::lam(&["x", "y"], Expr::var("x"))).unwrap();
    assert!(matches!(
        c.search_name("pick", &Ty::int()),
        Err(CompileError::TypeMismatch { .. })
    ));
    assert!(matches!(
        c.search_name("missing", &Ty::int()),
        Err(CompileError::Type(TypeError::UnboundVariable { .. }))
    ));
}
