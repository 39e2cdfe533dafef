//! Unsweetening: inference followed by class resolution and specialisation.
//!
//! The output of [`Unsweetener::elaborate`] is monomorphic. Every node
//! carries a ground type, class member occurrences name a concrete
//! definition, and generic definitions are referenced through their
//! specialisations. Specialisations that do not exist yet are
//! forward-declared and pushed onto the [`ResidualQueue`]; the caller drains
//! the queue by unsweetening and compiling each residual in turn.

use std::collections::VecDeque;

use rustc_hash::FxHashMap;

use kiln_common::{Expr, ExprKind, MatchArm, Param, Pred, QualType, Span, Ty};

use crate::classes::{member_scheme, ClassEnv, MAX_CONTEXT_DEPTH};
use crate::env::{GlobalKind, TypeEnv};
use crate::error::{ConstraintOrigin, TypeError};
use crate::foreign::ForeignTypeGraph;
use crate::infer::{node_ty, Infer, Inferred};
use crate::registry::TypeRegistry;
use crate::unify::InferCtx;

/// Deepest chain of residuals produced while draining another residual.
pub const MAX_DRAIN_DEPTH: usize = 64;
/// Most residuals one top-level operation may queue.
pub const MAX_RESIDUALS: usize = 4096;

/// A definition manufactured by resolution, still to be compiled.
#[derive(Clone, Debug, PartialEq)]
pub struct Residual {
    pub name: String,
    pub expr: Expr,
    /// The ground type the definition is compiled at.
    pub ty: Ty,
}

#[derive(Debug, Default)]
pub struct ResidualQueue {
    pending: VecDeque<Residual>,
    /// Set while a drain is running; nested producers only enqueue.
    pub draining: bool,
    produced: usize,
}

impl ResidualQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, residual: Residual) -> Result<(), TypeError> {
        if self.produced >= MAX_RESIDUALS {
            return Err(TypeError::DrainLimit {
                name: residual.name,
                limit: MAX_RESIDUALS,
            });
        }
        tracing::debug!(name = %residual.name, ty = %residual.ty, "queued residual");
        self.produced += 1;
        self.pending.push_back(residual);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<Residual> {
        self.pending.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Residuals queued since the last reset.
    pub fn produced(&self) -> usize {
        self.produced
    }

    /// Forget everything, as after a failed operation.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.draining = false;
        self.produced = 0;
    }
}

pub struct Unsweetener<'a> {
    registry: &'a TypeRegistry,
    graph: &'a ForeignTypeGraph,
    env: &'a mut TypeEnv,
    classes: &'a ClassEnv,
    residuals: &'a mut ResidualQueue,
}

impl<'a> Unsweetener<'a> {
    pub fn new(
        registry: &'a TypeRegistry,
        graph: &'a ForeignTypeGraph,
        env: &'a mut TypeEnv,
        classes: &'a ClassEnv,
        residuals: &'a mut ResidualQueue,
    ) -> Self {
        Unsweetener {
            registry,
            graph,
            env,
            classes,
            residuals,
        }
    }

    /// Unsweeten an anonymous expression.
    pub fn unsweeten_expression(&mut self, expr: &Expr) -> Result<Expr, TypeError> {
        let inferred = self.infer_definition(None, expr, None)?;
        self.elaborate(inferred, None)
    }

    /// Unsweeten an expression that may refer to itself by `name`.
    pub fn unsweeten_expression_named(
        &mut self,
        name: &str,
        expr: &Expr,
        expected: Option<&Ty>,
    ) -> Result<Expr, TypeError> {
        let inferred = self.infer_definition(Some(name), expr, expected)?;
        self.elaborate(inferred, Some(name))
    }

    /// Unsweeten a queued residual at its ground type.
    pub fn unsweeten_residual(&mut self, residual: &Residual) -> Result<Expr, TypeError> {
        let inferred = self.infer_definition(None, &residual.expr, Some(&residual.ty))?;
        self.elaborate(inferred, None)
    }

    /// Infer `expr` and improve its predicates, without committing to
    /// monomorphic types. The result may still be generalized.
    pub fn infer_definition(
        &mut self,
        name: Option<&str>,
        expr: &Expr,
        expected: Option<&Ty>,
    ) -> Result<Inferred, TypeError> {
        let _span = tracing::debug_span!("unsweeten", name = name.unwrap_or("<expr>")).entered();
        let mut inferred =
            Infer::new(self.registry, self.graph, self.env, self.classes).run(expr, name, expected)?;
        self.improve(&mut inferred)?;
        Ok(inferred)
    }

    /// Commit every predicate that exactly one instance could satisfy.
    fn improve(&self, inferred: &mut Inferred) -> Result<(), TypeError> {
        loop {
            let mut progress = false;
            for pred in &inferred.preds {
                let pred = inferred.ctx.resolve_pred(pred);
                if pred.args.iter().all(Ty::is_ground) {
                    continue;
                }
                let candidates = self.classes.unifiable(&pred.class, &pred.args);
                if let [(_, inst)] = candidates.as_slice() {
                    let fresh = inferred.ctx.freshen_params(&inst.params);
                    for (head, arg) in inst.args.iter().zip(&pred.args) {
                        inferred.ctx.unify(
                            head.substitute_params(&fresh),
                            arg.clone(),
                            ConstraintOrigin::Builtin,
                        )?;
                    }
                    tracing::trace!(pred = %pred, "improved by unique instance");
                    progress = true;
                }
            }
            if !progress {
                return Ok(());
            }
        }
    }

    /// Reject predicates that no instance, or more than one, could satisfy.
    fn check_preds(&self, inferred: &mut Inferred, span: Span) -> Result<(), TypeError> {
        for pred in &inferred.preds {
            let pred = inferred.ctx.resolve_pred(pred);
            if pred.args.iter().all(Ty::is_ground) {
                continue;
            }
            let candidates = self.classes.unifiable(&pred.class, &pred.args);
            match candidates.len() {
                0 => {
                    return Err(TypeError::NoInstance {
                        class: pred.class.clone(),
                        args: pred.args.clone(),
                        span,
                    })
                }
                1 => {}
                _ => {
                    return Err(TypeError::AmbiguousInstance {
                        class: pred.class.clone(),
                        args: pred.args.clone(),
                        candidates: candidates
                            .iter()
                            .map(|(_, i)| Pred::new(i.class.clone(), i.args.clone()).to_string())
                            .collect(),
                        span,
                    })
                }
            }
        }
        Ok(())
    }

    /// Turn an inferred tree into its monomorphic form.
    ///
    /// `self_name` is left as a plain reference; the caller binds it.
    pub fn elaborate(&mut self, mut inferred: Inferred, self_name: Option<&str>) -> Result<Expr, TypeError> {
        let span = inferred.expr.span;
        self.check_preds(&mut inferred, span)?;
        let mut rewrite = Rewrite {
            ctx: &mut inferred.ctx,
            registry: self.registry,
            env: self.env,
            classes: self.classes,
            residuals: self.residuals,
            locals: Vec::new(),
            self_name,
        };
        rewrite.expr(&inferred.expr)
    }
}

/// The elaboration walk over one inferred tree.
struct Rewrite<'r, 'a> {
    ctx: &'r mut InferCtx,
    registry: &'a TypeRegistry,
    env: &'r mut TypeEnv,
    classes: &'a ClassEnv,
    residuals: &'r mut ResidualQueue,
    /// Names bound inside the tree, innermost last.
    locals: Vec<String>,
    self_name: Option<&'r str>,
}

impl Rewrite<'_, '_> {
    /// Resolve a type fully, defaulting leftover variables to `Unit`.
    fn ground(&mut self, ty: &Ty) -> Result<Ty, TypeError> {
        let resolved = self.ctx.resolve(ty.clone());
        for v in resolved.free_vars() {
            self.ctx.unify(Ty::Var(v), Ty::unit(), ConstraintOrigin::Builtin)?;
        }
        let ground = self.ctx.resolve(resolved);
        Ok(self.registry.replace_type_aliases(&ground))
    }

    fn with_locals<T>(
        &mut self,
        names: impl IntoIterator<Item = String>,
        f: impl FnOnce(&mut Self) -> Result<T, TypeError>,
    ) -> Result<T, TypeError> {
        let depth = self.locals.len();
        self.locals.extend(names);
        let out = f(self);
        self.locals.truncate(depth);
        out
    }

    fn is_local(&self, name: &str) -> bool {
        self.locals.iter().any(|n| n == name) || self.self_name == Some(name)
    }

    fn exprs(&mut self, es: &[Expr]) -> Result<Vec<Expr>, TypeError> {
        es.iter().map(|e| self.expr(e)).collect()
    }

    fn expr(&mut self, e: &Expr) -> Result<Expr, TypeError> {
        let ty = self.ground(&node_ty(e))?;
        let span = e.span;
        let kind = match &e.kind {
            ExprKind::Lit(l) => ExprKind::Lit(l.clone()),
            ExprKind::Var(name) => {
                if self.is_local(name) {
                    ExprKind::Var(name.clone())
                } else {
                    return self.global_occurrence(name, &ty, span, 0);
                }
            }
            ExprKind::App(f, args) => {
                let f = self.expr(f)?;
                ExprKind::App(Box::new(f), self.exprs(args)?)
            }
            ExprKind::Lambda(params, body) => {
                let mut typed = Vec::with_capacity(params.len());
                for p in params {
                    let pty = p.ty.clone().unwrap_or_else(Ty::unit);
                    typed.push(Param::typed(p.name.clone(), self.ground(&pty)?));
                }
                let names = params.iter().map(|p| p.name.clone()).collect::<Vec<_>>();
                let body = self.with_locals(names, |r| r.expr(body))?;
                ExprKind::Lambda(typed, Box::new(body))
            }
            ExprKind::Let(name, value, body) => {
                let value = self.expr(value)?;
                let body = self.with_locals([name.clone()], |r| r.expr(body))?;
                ExprKind::Let(name.clone(), Box::new(value), Box::new(body))
            }
            ExprKind::LetRec(bindings, body) => {
                let names = bindings.iter().map(|(n, _)| n.clone()).collect::<Vec<_>>();
                let (bindings, body) = self.with_locals(names, |r| {
                    let mut out = Vec::with_capacity(bindings.len());
                    for (n, v) in bindings {
                        out.push((n.clone(), r.expr(v)?));
                    }
                    Ok((out, r.expr(body)?))
                })?;
                ExprKind::LetRec(bindings, Box::new(body))
            }
            ExprKind::If(c, t, f) => ExprKind::If(
                Box::new(self.expr(c)?),
                Box::new(self.expr(t)?),
                Box::new(self.expr(f)?),
            ),
            ExprKind::Match(scrutinees, arms) => {
                let scrutinees = self.exprs(scrutinees)?;
                let mut out = Vec::with_capacity(arms.len());
                for arm in arms {
                    let names = arm.patterns.iter().flat_map(|p| p.bound_names()).collect::<Vec<_>>();
                    out.push(self.with_locals(names, |r| {
                        let guard = arm.guard.as_ref().map(|g| r.expr(g)).transpose()?;
                        Ok(MatchArm {
                            patterns: arm.patterns.clone(),
                            guard,
                            body: r.expr(&arm.body)?,
                        })
                    })?);
                }
                ExprKind::Match(scrutinees, out)
            }
            ExprKind::Annot(inner, _) => ExprKind::Annot(Box::new(self.expr(inner)?), ty.clone()),
            ExprKind::Tuple(es) => ExprKind::Tuple(self.exprs(es)?),
            ExprKind::Record(fields) => {
                let mut out = Vec::with_capacity(fields.len());
                for (n, v) in fields {
                    out.push((n.clone(), self.expr(v)?));
                }
                ExprKind::Record(out)
            }
            ExprKind::Field(object, field) => ExprKind::Field(Box::new(self.expr(object)?), field.clone()),
            ExprKind::Ctor(name, payload) => {
                let payload = payload.as_ref().map(|p| self.expr(p).map(Box::new)).transpose()?;
                ExprKind::Ctor(name.clone(), payload)
            }
            ExprKind::Array(es) => ExprKind::Array(self.exprs(es)?),
            ExprKind::Cast(inner, _) => ExprKind::Cast(Box::new(self.expr(inner)?), ty.clone()),
        };
        Ok(Expr {
            kind,
            ty: Some(ty),
            span,
        })
    }

    /// A reference to a global at a ground type.
    fn global_occurrence(&mut self, name: &str, ty: &Ty, span: Span, depth: usize) -> Result<Expr, TypeError> {
        if depth > MAX_CONTEXT_DEPTH {
            return Err(TypeError::DrainLimit {
                name: name.to_string(),
                limit: MAX_CONTEXT_DEPTH,
            });
        }
        let kind = self
            .env
            .lookup_global(name)
            .map(|b| b.kind.clone())
            .ok_or_else(|| TypeError::UnboundVariable {
                name: name.to_string(),
                span,
            })?;
        match kind {
            GlobalKind::ClassMember(class) => self.member_occurrence(&class, name, ty, span, depth),
            GlobalKind::Poly(body) => {
                let specialised = format!("{}@[{}]", name, ty);
                self.residual(specialised, body, ty, span)
            }
            _ => Ok(Expr::var(name).with_ty(ty.clone()).at(span)),
        }
    }

    fn member_occurrence(
        &mut self,
        class_name: &str,
        member: &str,
        ty: &Ty,
        span: Span,
        depth: usize,
    ) -> Result<Expr, TypeError> {
        let class = self.classes.class(class_name).ok_or_else(|| TypeError::UnknownClass {
            name: class_name.to_string(),
        })?;
        let mut scratch = InferCtx::new();
        let (member_ty, preds) = scratch.instantiate(&member_scheme(class, member));
        scratch.unify(member_ty, ty.clone(), ConstraintOrigin::Builtin)?;
        let pred = preds
            .first()
            .map(|p| scratch.resolve_pred(p))
            .ok_or_else(|| TypeError::Internal(format!("member `{}` has no class predicate", member)))?;
        if !pred.args.iter().all(Ty::is_ground) {
            return Err(TypeError::AmbiguousInstance {
                class: pred.class.clone(),
                args: pred.args.clone(),
                candidates: Vec::new(),
                span,
            });
        }
        let resolved = self.classes.resolve(&pred, span)?;
        let body = resolved
            .member(member)
            .cloned()
            .ok_or_else(|| TypeError::MissingMember {
                class: class_name.to_string(),
                member: member.to_string(),
            })?;
        if let ExprKind::Var(target) = &body.kind {
            if self.inlinable(target, ty) {
                tracing::trace!(member, target = %target, "inlined trivial member");
                return self.global_occurrence(target, ty, span, depth + 1);
            }
        }
        let args = pred.args.iter().map(Ty::to_string).collect::<Vec<_>>();
        let name = format!("{}@[{}]", member, args.join(", "));
        self.residual(name, body, ty, span)
    }

    /// Whether `target` names a global that can stand in for a member at `ty`.
    fn inlinable(&self, target: &str, ty: &Ty) -> bool {
        let Some(binding) = self.env.lookup_global(target) else {
            return false;
        };
        match binding.kind {
            GlobalKind::ClassMember(_) | GlobalKind::Poly(_) => true,
            _ => {
                let mut scratch = InferCtx::new();
                let (bty, _) = scratch.instantiate(&binding.scheme);
                let mut imported = FxHashMap::default();
                let ty = scratch.import(ty, &mut imported);
                scratch.try_unify(&bty, &ty)
            }
        }
    }

    /// Reference the residual `name`, queueing it when it does not exist.
    fn residual(&mut self, name: String, expr: Expr, ty: &Ty, span: Span) -> Result<Expr, TypeError> {
        if self.env.lookup_global(&name).is_none() {
            self.env.forward_declare(&name, &QualType::mono(ty.clone()));
            self.residuals.push(Residual {
                name: name.clone(),
                expr,
                ty: ty.clone(),
            })?;
        }
        Ok(Expr::var(name).with_ty(ty.clone()).at(span))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classes::{Instance, TypeClass};
    use crate::env::GlobalBinding;
    use kiln_common::{ClassDecl, InstanceDecl, Scheme};

    struct World {
        registry: TypeRegistry,
        graph: ForeignTypeGraph,
        env: TypeEnv,
        classes: ClassEnv,
        queue: ResidualQueue,
    }

    fn eq_ty(t: Ty) -> Ty {
        Ty::fun(vec![t.clone(), t], Ty::bool())
    }

    impl World {
        fn new() -> Self {
            let mut w = World {
                registry: TypeRegistry::new(),
                graph: ForeignTypeGraph::new(),
                env: TypeEnv::new(),
                classes: ClassEnv::new(),
                queue: ResidualQueue::new(),
            };
            w.env.bind(
                "ieq",
                GlobalBinding {
                    scheme: Scheme::mono(eq_ty(Ty::int())),
                    kind: GlobalKind::Op,
                },
            );
            let class: TypeClass = ClassDecl {
                name: "Eq".into(),
                params: vec!["a".into()],
                members: vec![("==".into(), eq_ty(Ty::con("a")))],
            };
            for (member, scheme) in w.classes.define_class(class).unwrap() {
                w.env.bind(
                    &member,
                    GlobalBinding {
                        scheme,
                        kind: GlobalKind::ClassMember("Eq".into()),
                    },
                );
            }
            w.classes
                .add_instance(InstanceDecl::ground(
                    "Eq",
                    vec![Ty::int()],
                    vec![("==".into(), Expr::var("ieq"))],
                ))
                .unwrap();
            w
        }

        fn add_list_instance(&mut self) {
            let inst: Instance = InstanceDecl {
                class: "Eq".into(),
                params: vec!["a".into()],
                args: vec![Ty::array(Ty::con("a"))],
                context: vec![Pred::new("Eq", vec![Ty::con("a")])],
                members: vec![(
                    "==".into(),
                    Expr::lam(&["xs", "ys"], Expr::bool(true)),
                )],
            };
            self.classes.add_instance(inst).unwrap();
        }

        fn run(&mut self, e: &Expr) -> Result<Expr, TypeError> {
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

    #[test]
    fn trivial_member_body_is_inlined() {
        let mut w = World::new();
        let out = w.run(&Expr::binop("==", Expr::int(1), Expr::int(2))).unwrap();
        let ExprKind::App(f, _) = &out.kind else {
            panic!("expected application, got {}", out);
        };
        assert_eq!(f.kind, ExprKind::Var("ieq".into()));
        assert_eq!(out.ty, Some(Ty::bool()));
        assert!(w.queue.is_empty());
    }

    #[test]
    fn non_trivial_member_body_becomes_residual() {
        let mut w = World::new();
        w.add_list_instance();
        let e = Expr::binop(
            "==",
            Expr::array(vec![Expr::int(1)]),
            Expr::array(vec![Expr::int(1)]),
        );
        let out = w.run(&e).unwrap();
        let ExprKind::App(f, _) = &out.kind else {
            panic!("expected application, got {}", out);
        };
        assert_eq!(f.kind, ExprKind::Var("==@[[Int]]".into()));
        assert_eq!(w.queue.len(), 1);
        assert!(w.env.is_forward_only("==@[[Int]]"));

        // A second use at the same type reuses the declaration.
        w.run(&e).unwrap();
        assert_eq!(w.queue.len(), 1);
    }

    #[test]
    fn missing_instance_is_reported() {
        let mut w = World::new();
        let err = w
            .run(&Expr::binop("==", Expr::float(1.0), Expr::float(2.0)))
            .unwrap_err();
        assert!(matches!(err, TypeError::NoInstance { ref class, .. } if class == "Eq"));
    }

    #[test]
    fn unique_instance_improves_open_predicate() {
        let mut w = World::new();
        // `\x -> x == x` applied to nothing: the only instance fixes `a`.
        let out = w
            .run(&Expr::lam(&["x"], Expr::binop("==", Expr::var("x"), Expr::var("x"))))
            .unwrap();
        assert_eq!(out.ty, Some(Ty::fun(vec![Ty::int()], Ty::bool())));
    }

    #[test]
    fn open_predicate_with_two_instances_is_ambiguous() {
        let mut w = World::new();
        w.add_list_instance();
        let err = w
            .run(&Expr::lam(&["x"], Expr::binop("==", Expr::var("x"), Expr::var("x"))))
            .unwrap_err();
        assert!(matches!(err, TypeError::AmbiguousInstance { .. }));
    }

    #[test]
    fn poly_definitions_specialise_per_type() {
        let mut w = World::new();
        let id = Expr::lam(&["x"], Expr::var("x"));
        w.env.bind(
            "id",
            GlobalBinding {
                scheme: Scheme {
                    vars: vec![kiln_common::TyVar(0)],
                    preds: vec![],
                    ty: Ty::fun(vec![Ty::Var(kiln_common::TyVar(0))], Ty::Var(kiln_common::TyVar(0))),
                },
                kind: GlobalKind::Poly(id),
            },
        );
        w.run(&Expr::tuple(vec![
            Expr::call("id", vec![Expr::int(1)]),
            Expr::call("id", vec![Expr::bool(true)]),
        ]))
        .unwrap();
        assert_eq!(w.queue.len(), 2);
        let names: Vec<String> = std::iter::from_fn(|| w.queue.pop()).map(|r| r.name).collect();
        assert_eq!(names, vec!["id@[(Int) -> Int]", "id@[(Bool) -> Bool]"]);
    }

    #[test]
    fn queue_enforces_residual_limit() {
        let mut q = ResidualQueue::new();
        for i in 0..MAX_RESIDUALS {
            q.push(Residual {
                name: format!("r{}", i),
                expr: Expr::unit(),
                ty: Ty::unit(),
            })
            .unwrap();
        }
        let err = q
            .push(Residual {
                name: "overflow".into(),
                expr: Expr::unit(),
                ty: Ty::unit(),
            })
            .unwrap_err();
        assert!(matches!(err, TypeError::DrainLimit { limit: MAX_RESIDUALS, .. }));
        q.reset();
        assert!(q.is_empty());
        assert_eq!(q.produced(), 0);
    }
}
