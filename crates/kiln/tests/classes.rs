//! Classes, instances, residual draining and transactional rollback.

use kiln::{
    ClassDecl, CompileError, Compiler, Expr, InstanceDecl, Param, Pred, Ty, TypeError, Value,
};

// ── Helpers ────────────────────────────────────────────────────────────

fn a() -> Ty {
    Ty::con("a")
}

/// `Eq [a]` given `Eq a`: equal lengths and equal first elements.
fn list_eq_instance() -> InstanceDecl {
    let len = |v: &str| Expr::call("length", vec![Expr::var(v)]);
    let first = |v: &str| Expr::call("index", vec![Expr::var(v), Expr::int(0)]);
    let body = Expr::lam(
        &["xs", "ys"],
        Expr::if_(
            Expr::call("int_eq", vec![len("xs"), len("ys")]),
            Expr::if_(
                Expr::call("int_eq", vec![len("xs"), Expr::int(0)]),
                Expr::bool(true),
                Expr::binop("==", first("xs"), first("ys")),
            ),
            Expr::bool(false),
        ),
    );
    InstanceDecl {
        class: "Eq".into(),
        params: vec!["a".into()],
        args: vec![Ty::array(a())],
        context: vec![Pred::new("Eq", vec![a()])],
        members: vec![("==".into(), body)],
    }
}

fn nest(e: Expr, depth: usize) -> Expr {
    (0..depth).fold(e, |inner, _| Expr::array(vec![inner]))
}

fn nested_eq(c: &mut Compiler, depth: usize) -> Value {
    let x = || nest(Expr::var("x"), depth);
    let body = Expr::binop("==", x(), x());
    let id = c
        .compile_expr(&Expr::lambda(vec![Param::typed("x", Ty::int())], body))
        .unwrap();
    c.invoke(id, &[Value::Int(7)]).unwrap()
}

fn one_member_class(name: &str, member: &str, ty: Ty) -> ClassDecl {
    ClassDecl {
        name: name.into(),
        params: vec!["a".into()],
        members: vec![(member.into(), ty)],
    }
}

// ── Draining ───────────────────────────────────────────────────────────

#[test]
fn nested_list_equality_drains_one_residual_per_level() {
    let mut c = Compiler::new().unwrap();
    c.add_instance(list_eq_instance()).unwrap();

    assert_eq!(nested_eq(&mut c, 3), Value::Bool(true));
    assert_eq!(c.last_drain_count(), 3);
    for name in ["==@[[[[Int]]]]", "==@[[[Int]]]", "==@[[Int]]"] {
        assert!(c.has_value_binding(name), "missing {}", name);
    }

    // Specialisations are reused: one more level costs one more residual.
    assert_eq!(nested_eq(&mut c, 4), Value::Bool(true));
    assert_eq!(c.last_drain_count(), 1);
}

#[test]
fn failed_definition_leaves_no_residuals_behind() {
    let mut c = Compiler::new().unwrap();
    c.add_instance(list_eq_instance()).unwrap();
    let before = c.show_type_env();

    let xs = || Expr::var("xs");
    let body = Expr::if_(
        Expr::binop("==", xs(), xs()),
        Expr::call("neg", vec![Expr::bool(true)]),
        Expr::bool(false),
    );
    let err = c
        .define("bad", &Expr::lambda(vec![Param::typed("xs", Ty::array(Ty::int()))], body))
        .unwrap_err();
    assert_eq!(
        err,
        CompileError::NoInstance {
            class: "Neg".into(),
            types: vec![Ty::bool()],
            span: kiln::Span::synthetic(),
        }
    );
    assert_eq!(c.show_type_env(), before);
    assert!(c.type_env().lookup_global("==@[[Int]]").is_none());
    assert!(c.type_env().lookup_global("bad").is_none());
}

#[test]
fn missing_instance_leaves_environment_unchanged() {
    let mut c = Compiler::new().unwrap();
    let before = c.dump_type_env();
    let err = c
        .compile_expr(&Expr::call("neg", vec![Expr::bool(true)]))
        .unwrap_err();
    assert!(matches!(err, CompileError::NoInstance { ref class, .. } if class == "Neg"), "{:?}", err);
    assert_eq!(c.dump_type_env(), before);
    assert!(err.render("neg(true)").contains("E0011"));
}

// ── Resolution ─────────────────────────────────────────────────────────

#[test]
fn most_specific_instance_wins() {
    let mut c = Compiler::new().unwrap();
    c.define_class(one_member_class("Describe", "describe", Ty::fun(vec![a()], Ty::int())))
        .unwrap();
    c.add_instance(InstanceDecl {
        class: "Describe".into(),
        params: vec!["a".into()],
        args: vec![Ty::array(a())],
        context: Vec::new(),
        members: vec![("describe".into(), Expr::lam(&["xs"], Expr::int(1)))],
    })
    .unwrap();
    c.overload(
        "Describe",
        &[Ty::array(Ty::int())],
        Some(Expr::lam(&["xs"], Expr::int(2))),
    )
    .unwrap();

    let ints = c
        .compile_expr(&Expr::call("describe", vec![Expr::array(vec![Expr::int(1)])]))
        .unwrap();
    let bools = c
        .compile_expr(&Expr::call("describe", vec![Expr::array(vec![Expr::bool(true)])]))
        .unwrap();
    assert_eq!(c.invoke(ints, &[]), Ok(Value::Int(2)));
    assert_eq!(c.invoke(bools, &[]), Ok(Value::Int(1)));
}

#[test]
fn unconstrained_member_is_ambiguous() {
    let mut c = Compiler::new().unwrap();
    c.define_class(one_member_class("Default", "def", a())).unwrap();
    c.overload("Default", &[Ty::int()], Some(Expr::int(0))).unwrap();
    c.overload("Default", &[Ty::float()], Some(Expr::float(0.0))).unwrap();

    let err = c.compile_expr(&Expr::var("def")).unwrap_err();
    assert!(matches!(err, CompileError::AmbiguousInstance { ref class, .. } if class == "Default"), "{:?}", err);

    let id = c
        .compile_expr(&Expr::annot(Expr::var("def"), Ty::float()))
        .unwrap();
    assert_eq!(c.invoke(id, &[]), Ok(Value::Float(0.0)));
}

#[test]
fn overload_shorthand_checks_member_count() {
    let mut c = Compiler::new().unwrap();
    c.define_class(one_member_class("Size", "size", Ty::fun(vec![a()], Ty::int())))
        .unwrap();
    let err = c.overload("Size", &[Ty::bool()], None).unwrap_err();
    assert!(matches!(err, CompileError::Type(TypeError::MissingMember { .. })), "{:?}", err);
    let err = c.overload("Ord", &[Ty::unit()], None).unwrap_err();
    assert_eq!(err, CompileError::ArityMismatch { expected: 2, found: 0 });

    c.overload(
        "Size",
        &[Ty::bool()],
        Some(Expr::lam(&["b"], Expr::if_(Expr::var("b"), Expr::int(1), Expr::int(0)))),
    )
    .unwrap();
    let id = c
        .compile_expr(&Expr::call("size", vec![Expr::bool(true)]))
        .unwrap();
    assert_eq!(c.invoke(id, &[]), Ok(Value::Int(1)));
}

#[test]
fn duplicate_instances_and_members_are_rejected() {
    let mut c = Compiler::new().unwrap();
    let err = c
        .overload("Neg", &[Ty::int()], Some(Expr::var("int_neg")))
        .unwrap_err();
    assert!(matches!(err, CompileError::DuplicateDefinition { what: "instance", .. }), "{:?}", err);

    let err = c
        .define_class(one_member_class("Clash", "neg", Ty::fun(vec![a()], a())))
        .unwrap_err();
    assert_eq!(
        err,
        CompileError::DuplicateDefinition {
            what: "global",
            name: "neg".into()
        }
    );
    assert!(c.type_env().lookup_global("neg").is_some());
}

#[test]
fn builtin_conversions() {
    let mut c = Compiler::new().unwrap();
    let body = Expr::annot(Expr::call("convert", vec![Expr::var("n")]), Ty::float());
    let id = c
        .compile_expr(&Expr::lambda(vec![Param::typed("n", Ty::int())], body))
        .unwrap();
    assert_eq!(c.invoke(id, &[Value::Int(3)]), Ok(Value::Float(3.0)));

    let ord = c
        .compile_expr(&Expr::annot(Expr::call("convert", vec![Expr::char('A')]), Ty::int()))
        .unwrap();
    assert_eq!(c.invoke(ord, &[]), Ok(Value::Int(65)));
}

#[test]
fn ill_typed_member_bodies_are_rejected() {
    let mut c = Compiler::new().unwrap();
    let before = c.class_env().instance_count();
    let bools = || vec![Ty::array(Ty::bool())];

    // `==` must be `([Bool], [Bool]) -> Bool`; this returns an Int.
    let err = c
        .add_instance(InstanceDecl::ground(
            "Eq",
            bools(),
            vec![("==".into(), Expr::lam(&["x", "y"], Expr::int(1)))],
        ))
        .unwrap_err();
    assert!(matches!(err, CompileError::TypeMismatch { .. }), "{:?}", err);

    let err = c
        .overload("Eq", &bools(), Some(Expr::lam(&["x"], Expr::int(1))))
        .unwrap_err();
    assert!(
        matches!(err, CompileError::TypeMismatch { .. } | CompileError::Type(_)),
        "{:?}",
        err
    );
    assert_eq!(c.class_env().instance_count(), before);
    assert!(c.class_env().matching("Eq", &bools()).is_empty());

    // A well-typed body for the same head is still accepted afterwards.
    c.overload(
        "Eq",
        &bools(),
        Some(Expr::lam(&["x", "y"], Expr::bool(true))),
    )
    .unwrap();
    assert_eq!(c.class_env().instance_count(), before + 1);
}

#[test]
fn instance_context_goes_through_aliases() {
    let mut c = Compiler::new().unwrap();
    c.define_type_alias("Number", &[], &Ty::int()).unwrap();
    c.define_class(one_member_class("Size", "size", Ty::fun(vec![a()], Ty::int())))
        .unwrap();
    c.add_instance(InstanceDecl {
        class: "Size".into(),
        params: Vec::new(),
        args: vec![Ty::array(Ty::con("Number"))],
        context: vec![Pred::new("Eq", vec![Ty::con("Number")])],
        members: vec![("size".into(), Expr::lam(&["xs"], Expr::call("length", vec![Expr::var("xs")])))],
    })
    .unwrap();
    let inst = &c.class_env().instances("Size")[0];
    assert_eq!(inst.args, vec![Ty::array(Ty::int())]);
    assert_eq!(inst.context[0].args, vec![Ty::int()]);
}
