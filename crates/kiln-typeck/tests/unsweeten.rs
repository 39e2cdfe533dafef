//! End-to-end tests over the public kiln-typeck surface: inference,
//! resolution, residual queueing and diagnostics.

use kiln_common::{ClassDecl, Expr, InstanceDecl, Pred, Span, Ty};
use kiln_typeck::diagnostics::render_diagnostic;
use kiln_typeck::{
    ClassEnv, ForeignTypeGraph, GlobalBinding, GlobalKind, ResidualQueue, TypeEnv, TypeError,
    TypeRegistry, Unsweetener,
};

// ── Helpers ────────────────────────────────────────────────────────────

struct Checker {
    registry: TypeRegistry,
    graph: ForeignTypeGraph,
    env: TypeEnv,
    classes: ClassEnv,
    queue: ResidualQueue,
}

fn eq_ty(t: Ty) -> Ty {
    Ty::fun(vec![t.clone(), t], Ty::bool())
}

impl Checker {
    fn with_eq() -> Self {
        let mut c = Checker {
            registry: TypeRegistry::new(),
            graph: ForeignTypeGraph::new(),
            env: TypeEnv::new(),
            classes: ClassEnv::new(),
            queue: ResidualQueue::new(),
        };
        c.env.bind(
            "int_eq",
            GlobalBinding {
                scheme: kiln_common::Scheme::mono(eq_ty(Ty::int())),
                kind: GlobalKind::Op,
            },
        );
        let eq = ClassDecl {
            name: "Eq".into(),
            params: vec!["a".into()],
            members: vec![("==".into(), eq_ty(Ty::con("a")))],
        };
        for (member, scheme) in c.classes.define_class(eq).unwrap() {
            c.env.bind(
                &member,
                GlobalBinding {
                    scheme,
                    kind: GlobalKind::ClassMember("Eq".into()),
                },
            );
        }
        c.classes
            .add_instance(InstanceDecl::ground(
                "Eq",
                vec![Ty::int()],
                vec![("==".into(), Expr::var("int_eq"))],
            ))
            .unwrap();
        c.classes
            .add_instance(InstanceDecl {
                class: "Eq".into(),
                params: vec!["a".into()],
                args: vec![Ty::array(Ty::con("a"))],
                context: vec![Pred::new("Eq", vec![Ty::con("a")])],
                members: vec![("==".into(), Expr::lam(&["xs", "ys"], Expr::bool(true)))],
            })
            .unwrap();
        c
    }

    fn unsweeten(&mut self, e: &Expr) -> Result<Expr, TypeError> {
        Unsweetener::new(
            &self.registry,
            &self.graph,
            &mut self.env,
            &self.classes,
            &mut self.queue,
        )
        .unsweeten_expression(e)
    }
}

fn nested(depth: usize) -> (Expr, Ty) {
    let mut e = Expr::int(1);
    let mut t = Ty::int();
    for _ in 0..depth {
        e = Expr::array(vec![e]);
        t = Ty::array(t);
    }
    (e, t)
}

// ── Tests ──────────────────────────────────────────────────────────────

#[test]
fn nested_list_equality_queues_one_residual_per_use() {
    let mut c = Checker::with_eq();
    let (value, ty) = nested(3);
    let out = c
        .unsweeten(&Expr::binop("==", value.clone(), value))
        .unwrap();
    assert_eq!(out.ty, Some(Ty::bool()));
    assert_eq!(c.queue.len(), 1);
    let residual = c.queue.pop().unwrap();
    assert_eq!(residual.name, format!("==@[{}]", ty));
    assert_eq!(residual.ty, eq_ty(ty));
}

#[test]
fn context_failure_is_no_instance() {
    let mut c = Checker::with_eq();
    let e = Expr::binop(
        "==",
        Expr::array(vec![Expr::float(1.0)]),
        Expr::array(vec![Expr::float(1.0)]),
    );
    let err = c.unsweeten(&e).unwrap_err();
    match err {
        TypeError::NoInstance { class, args, .. } => {
            assert_eq!(class, "Eq");
            assert_eq!(args, vec![Ty::float()]);
        }
        other => panic!("expected NoInstance, got {other}"),
    }
    assert!(c.queue.is_empty());
}

#[test]
fn every_node_is_ground_after_unsweetening() {
    let mut c = Checker::with_eq();
    // The unused parameter defaults to Unit.
    let out = c
        .unsweeten(&Expr::lam(&["unused"], Expr::int(3)))
        .unwrap();
    assert_eq!(out.ty, Some(Ty::fun(vec![Ty::unit()], Ty::int())));
}

#[test]
fn unbound_variable_diagnostic_names_the_variable() {
    let mut c = Checker::with_eq();
    let src = "y + 1";
    let e = Expr::var("y").at(Span::new(0, 1));
    let err = c.unsweeten(&e).unwrap_err();
    let output = render_diagnostic(&err, src, "test.kiln");
    assert!(output.contains("E0004"), "{output}");
    assert!(output.contains("unbound variable `y`"), "{output}");
    assert!(output.contains("not found in this scope"), "{output}");
}

#[test]
fn mismatch_diagnostic_carries_types() {
    let mut c = Checker::with_eq();
    let src = "if 1 then 2 else 3";
    let e = Expr::if_(
        Expr::int(1).at(Span::new(3, 4)),
        Expr::int(2),
        Expr::int(3),
    );
    let err = c.unsweeten(&e).unwrap_err();
    let output = render_diagnostic(&err, src, "test.kiln");
    assert!(output.contains("E0001"), "{output}");
    assert!(output.contains("expected `Bool`, found `Int`"), "{output}");
}
