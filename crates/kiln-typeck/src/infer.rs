//! Hindley-Milner inference over expression trees.
//!
//! Produces a copy of the input tree with an inference type on every node
//! and collects the class predicates raised by member occurrences. Local
//! `let` bindings are monomorphic; only the definition being inferred is
//! generalized, by the caller, through [`Inferred::generalize`].
//!
//! Field access on a value whose type is still a variable is deferred and
//! retried once the rest of the tree has been inferred.

use kiln_common::{Expr, ExprKind, MatchArm, Param, Pattern, Pred, Scheme, Span, Ty};

use crate::classes::ClassEnv;
use crate::env::{GlobalKind, TypeEnv};
use crate::error::{ConstraintOrigin, TypeError};
use crate::foreign::ForeignTypeGraph;
use crate::registry::TypeRegistry;
use crate::unify::InferCtx;

/// The result of inferring one top-level expression.
pub struct Inferred {
    pub ctx: InferCtx,
    /// The input tree with an inference type on every node.
    pub expr: Expr,
    pub ty: Ty,
    pub preds: Vec<Pred>,
}

impl Inferred {
    /// Generalize the expression type over every variable created during
    /// inference, keeping the predicates that mention them.
    pub fn generalize(&mut self) -> Scheme {
        let ty = self.ty.clone();
        self.ctx.generalize(ty, &self.preds)
    }

    pub fn resolved_ty(&mut self) -> Ty {
        self.ctx.resolve(self.ty.clone())
    }
}

struct DeferredField {
    object: Ty,
    field: String,
    result: Ty,
    span: Span,
}

pub struct Infer<'a> {
    pub ctx: InferCtx,
    registry: &'a TypeRegistry,
    graph: &'a ForeignTypeGraph,
    env: &'a mut TypeEnv,
    classes: &'a ClassEnv,
    /// The definition's own name, visible to its body for recursion.
    self_binding: Option<(String, Ty)>,
    preds: Vec<Pred>,
    deferred: Vec<DeferredField>,
}

/// The type stored on an inferred node.
pub fn node_ty(e: &Expr) -> Ty {
    e.ty.clone().unwrap_or_else(Ty::unit)
}

impl<'a> Infer<'a> {
    pub fn new(
        registry: &'a TypeRegistry,
        graph: &'a ForeignTypeGraph,
        env: &'a mut TypeEnv,
        classes: &'a ClassEnv,
    ) -> Self {
        Infer {
            ctx: InferCtx::new(),
            registry,
            graph,
            env,
            classes,
            self_binding: None,
            preds: Vec::new(),
            deferred: Vec::new(),
        }
    }

    /// Infer a top-level expression. `self_name` makes the expression's
    /// own name visible inside it; `expected` is a declared type the
    /// result must agree with.
    pub fn run(
        mut self,
        expr: &Expr,
        self_name: Option<&str>,
        expected: Option<&Ty>,
    ) -> Result<Inferred, TypeError> {
        self.ctx.enter_level();
        if let Some(name) = self_name {
            let v = self.ctx.fresh_var();
            self.self_binding = Some((name.to_string(), v));
        }
        self.env.clear_locals();
        let result = self.infer_top(expr, expected);
        self.env.clear_locals();
        self.ctx.leave_level();
        let expr = result?;
        let ty = node_ty(&expr);
        Ok(Inferred {
            ctx: self.ctx,
            expr,
            ty,
            preds: self.preds,
        })
    }

    fn infer_top(&mut self, expr: &Expr, expected: Option<&Ty>) -> Result<Expr, TypeError> {
        let mut out = self.infer(expr)?;
        if let Some((_, self_ty)) = self.self_binding.clone() {
            self.ctx
                .unify(self_ty, node_ty(&out), ConstraintOrigin::LetBinding { binding_span: expr.span })?;
        }
        if let Some(expected) = expected {
            let expected = self.registry.expand_aliases(expected)?;
            out = self.coerce(out, &expected, ConstraintOrigin::Signature)?;
        }
        self.resolve_deferred()?;
        Ok(out)
    }

    // ── Expressions ─────────────────────────────────────────────────────

    fn infer(&mut self, e: &Expr) -> Result<Expr, TypeError> {
        let span = e.span;
        let (kind, ty) = match &e.kind {
            ExprKind::Lit(lit) => (ExprKind::Lit(lit.clone()), lit.ty()),

            ExprKind::Var(name) => {
                let ty = self.infer_var(name, span)?;
                (ExprKind::Var(name.clone()), ty)
            }

            ExprKind::App(f, args) => return self.infer_app(f, args, span),

            ExprKind::Lambda(params, body) => {
                self.env.push_scope();
                let result = self.infer_lambda(params, body);
                self.env.pop_scope();
                let (params, body) = result?;
                let ty = Ty::fun(
                    params.iter().map(|p| p.ty.clone().unwrap_or_else(Ty::unit)).collect(),
                    node_ty(&body),
                );
                (ExprKind::Lambda(params, Box::new(body)), ty)
            }

            ExprKind::Let(name, value, body) => {
                let value = self.infer(value)?;
                self.env.push_scope();
                self.env.insert_local(name, node_ty(&value));
                let body = self.infer(body);
                self.env.pop_scope();
                let body = body?;
                let ty = node_ty(&body);
                (ExprKind::Let(name.clone(), Box::new(value), Box::new(body)), ty)
            }

            ExprKind::LetRec(bindings, body) => {
                self.env.push_scope();
                let result = self.infer_letrec(bindings, body);
                self.env.pop_scope();
                let (bindings, body) = result?;
                let ty = node_ty(&body);
                (ExprKind::LetRec(bindings, Box::new(body)), ty)
            }

            ExprKind::If(c, t, f) => {
                let c = self.infer(c)?;
                self.ctx.unify(
                    Ty::bool(),
                    node_ty(&c),
                    ConstraintOrigin::IfCondition { span: c.span },
                )?;
                let t = self.infer(t)?;
                let f = self.infer(f)?;
                let ty = node_ty(&t);
                self.ctx.unify(
                    ty.clone(),
                    node_ty(&f),
                    ConstraintOrigin::IfBranches {
                        then_span: t.span,
                        else_span: f.span,
                    },
                )?;
                (ExprKind::If(Box::new(c), Box::new(t), Box::new(f)), ty)
            }

            ExprKind::Match(scrutinees, arms) => return self.infer_match(scrutinees, arms, span),

            ExprKind::Annot(inner, ann) => {
                let ann = self.registry.expand_aliases(ann)?;
                let inner = self.infer(inner)?;
                let inner = self.coerce(
                    inner,
                    &ann,
                    ConstraintOrigin::Annotation {
                        annotation_span: span,
                    },
                )?;
                (ExprKind::Annot(Box::new(inner), ann.clone()), ann)
            }

            ExprKind::Tuple(elems) => {
                let elems = elems
                    .iter()
                    .map(|x| self.infer(x))
                    .collect::<Result<Vec<_>, _>>()?;
                let ty = Ty::Tuple(elems.iter().map(node_ty).collect());
                (ExprKind::Tuple(elems), ty)
            }

            ExprKind::Record(fields) => {
                let mut out = Vec::with_capacity(fields.len());
                for (name, value) in fields {
                    if out.iter().any(|(n, _): &(String, Expr)| n == name) {
                        return Err(TypeError::DuplicateDefinition {
                            what: "record field",
                            name: name.clone(),
                        });
                    }
                    out.push((name.clone(), self.infer(value)?));
                }
                let ty = Ty::Record(out.iter().map(|(n, v)| (n.clone(), node_ty(v))).collect());
                (ExprKind::Record(out), ty)
            }

            ExprKind::Field(object, field) => {
                let object = self.infer(object)?;
                let ty = match self.field_type(&node_ty(&object), field, span)? {
                    Some(t) => t,
                    None => {
                        let result = self.ctx.fresh_var();
                        self.deferred.push(DeferredField {
                            object: node_ty(&object),
                            field: field.clone(),
                            result: result.clone(),
                            span,
                        });
                        result
                    }
                };
                (ExprKind::Field(Box::new(object), field.clone()), ty)
            }

            ExprKind::Ctor(name, payload) => {
                let (result, payload_ty) = self.instantiate_ctor(name, span)?;
                let payload = match payload {
                    Some(p) => {
                        let p = self.infer(p)?;
                        let p = self.coerce(p, &payload_ty, ConstraintOrigin::Ctor { span })?;
                        Some(Box::new(p))
                    }
                    None => {
                        self.ctx
                            .unify(payload_ty, Ty::unit(), ConstraintOrigin::Ctor { span })?;
                        None
                    }
                };
                (ExprKind::Ctor(name.clone(), payload), result)
            }

            ExprKind::Array(elems) => {
                let elem_ty = self.ctx.fresh_var();
                let mut out = Vec::with_capacity(elems.len());
                for x in elems {
                    let x = self.infer(x)?;
                    let x = self.coerce(x, &elem_ty, ConstraintOrigin::ArrayElem { span })?;
                    out.push(x);
                }
                (ExprKind::Array(out), Ty::array(elem_ty))
            }

            ExprKind::Cast(inner, target) => {
                let target = self.registry.expand_aliases(target)?;
                let inner = self.infer(inner)?;
                let from = self.ctx.resolve(node_ty(&inner));
                match (&from, &target) {
                    (Ty::Var(_), _) => {
                        self.ctx.unify(
                            target.clone(),
                            from.clone(),
                            ConstraintOrigin::Annotation {
                                annotation_span: span,
                            },
                        )?;
                    }
                    _ if from == target => {}
                    (Ty::Opaque(a), Ty::Opaque(b)) if self.graph.is_usable_as(a.id, b.id) => {}
                    _ => {
                        return Err(TypeError::InvalidUpcast {
                            derived: from.to_string(),
                            base: target.to_string(),
                            reason: "no upcast path between these types".into(),
                        })
                    }
                }
                (ExprKind::Cast(Box::new(inner), target.clone()), target)
            }
        };
        Ok(Expr {
            kind,
            ty: Some(ty),
            span,
        })
    }

    fn infer_var(&mut self, name: &str, span: Span) -> Result<Ty, TypeError> {
        if let Some(ty) = self.env.lookup_local(name) {
            return Ok(ty.clone());
        }
        if let Some((self_name, ty)) = &self.self_binding {
            if self_name == name {
                return Ok(ty.clone());
            }
        }
        let binding = self
            .env
            .lookup_global(name)
            .ok_or_else(|| TypeError::UnboundVariable {
                name: name.to_string(),
                span,
            })?;
        if let GlobalKind::ClassMember(class) = &binding.kind {
            if self.classes.class(class).is_none() {
                return Err(TypeError::UnknownClass {
                    name: class.clone(),
                });
            }
        }
        let scheme = binding.scheme.clone();
        let (ty, preds) = self.ctx.instantiate(&scheme);
        self.preds.extend(preds);
        Ok(ty)
    }

    fn infer_app(&mut self, f: &Expr, args: &[Expr], span: Span) -> Result<Expr, TypeError> {
        let f = self.infer(f)?;
        let mut typed_args = Vec::with_capacity(args.len());
        for a in args {
            typed_args.push(self.infer(a)?);
        }
        let callee = self.ctx.shallow_resolve(&node_ty(&f));
        let ret = match callee {
            Ty::Fun(params, ret) => {
                if params.len() != typed_args.len() {
                    return Err(TypeError::ArityMismatch {
                        expected: params.len(),
                        found: typed_args.len(),
                        origin: ConstraintOrigin::Callee { call_site: span },
                    });
                }
                let mut coerced = Vec::with_capacity(typed_args.len());
                for (i, (arg, param)) in typed_args.into_iter().zip(params).enumerate() {
                    coerced.push(self.coerce(
                        arg,
                        &param,
                        ConstraintOrigin::FnArg {
                            call_site: span,
                            arg_idx: i,
                        },
                    )?);
                }
                typed_args = coerced;
                *ret
            }
            other => {
                let ret = self.ctx.fresh_var();
                let expected = Ty::fun(typed_args.iter().map(node_ty).collect(), ret.clone());
                self.ctx
                    .unify(other, expected, ConstraintOrigin::Callee { call_site: span })?;
                ret
            }
        };
        Ok(Expr {
            kind: ExprKind::App(Box::new(f), typed_args),
            ty: Some(ret),
            span,
        })
    }

    fn infer_lambda(&mut self, params: &[Param], body: &Expr) -> Result<(Vec<Param>, Expr), TypeError> {
        let mut typed = Vec::with_capacity(params.len());
        for p in params {
            let ty = match &p.ty {
                Some(t) => self.registry.expand_aliases(t)?,
                None => self.ctx.fresh_var(),
            };
            self.env.insert_local(&p.name, ty.clone());
            typed.push(Param::typed(p.name.clone(), ty));
        }
        let body = self.infer(body)?;
        Ok((typed, body))
    }

    fn infer_letrec(
        &mut self,
        bindings: &[(String, Expr)],
        body: &Expr,
    ) -> Result<(Vec<(String, Expr)>, Expr), TypeError> {
        let vars: Vec<Ty> = bindings.iter().map(|_| self.ctx.fresh_var()).collect();
        for ((name, _), v) in bindings.iter().zip(&vars) {
            self.env.insert_local(name, v.clone());
        }
        let mut out = Vec::with_capacity(bindings.len());
        for ((name, value), v) in bindings.iter().zip(vars) {
            let value = self.infer(value)?;
            self.ctx.unify(
                v,
                node_ty(&value),
                ConstraintOrigin::LetBinding {
                    binding_span: value.span,
                },
            )?;
            out.push((name.clone(), value));
        }
        let body = self.infer(body)?;
        Ok((out, body))
    }

    fn infer_match(&mut self, scrutinees: &[Expr], arms: &[MatchArm], span: Span) -> Result<Expr, TypeError> {
        let scrutinees = scrutinees
            .iter()
            .map(|s| self.infer(s))
            .collect::<Result<Vec<_>, _>>()?;
        let result = self.ctx.fresh_var();
        let mut out = Vec::with_capacity(arms.len());
        for arm in arms {
            if arm.patterns.len() != scrutinees.len() {
                return Err(TypeError::ArityMismatch {
                    expected: scrutinees.len(),
                    found: arm.patterns.len(),
                    origin: ConstraintOrigin::Pattern { span },
                });
            }
            self.env.push_scope();
            let typed = self.infer_arm(arm, &scrutinees, &result, span);
            self.env.pop_scope();
            out.push(typed?);
        }
        Ok(Expr {
            kind: ExprKind::Match(scrutinees, out),
            ty: Some(result),
            span,
        })
    }

    fn infer_arm(
        &mut self,
        arm: &MatchArm,
        scrutinees: &[Expr],
        result: &Ty,
        span: Span,
    ) -> Result<MatchArm, TypeError> {
        for (p, s) in arm.patterns.iter().zip(scrutinees) {
            self.check_pattern(p, &node_ty(s), span)?;
        }
        let guard = match &arm.guard {
            Some(g) => {
                let g = self.infer(g)?;
                self.ctx
                    .unify(Ty::bool(), node_ty(&g), ConstraintOrigin::Guard { span: g.span })?;
                Some(g)
            }
            None => None,
        };
        let body = self.infer(&arm.body)?;
        let body = self.coerce(body, result, ConstraintOrigin::MatchArm { span: arm.body.span })?;
        Ok(MatchArm {
            patterns: arm.patterns.clone(),
            guard,
            body,
        })
    }

    // ── Patterns ────────────────────────────────────────────────────────

    fn check_pattern(&mut self, p: &Pattern, ty: &Ty, span: Span) -> Result<(), TypeError> {
        let origin = || ConstraintOrigin::Pattern { span };
        match p {
            Pattern::Wildcard => Ok(()),
            Pattern::Bind(name) => {
                self.env.insert_local(name, ty.clone());
                Ok(())
            }
            Pattern::Lit(lit) => self.ctx.unify(ty.clone(), lit.ty(), origin()),
            Pattern::Tuple(ps) => {
                let elems: Vec<Ty> = ps.iter().map(|_| self.ctx.fresh_var()).collect();
                self.ctx.unify(ty.clone(), Ty::Tuple(elems.clone()), origin())?;
                for (p, t) in ps.iter().zip(&elems) {
                    self.check_pattern(p, t, span)?;
                }
                Ok(())
            }
            Pattern::Record(fields) => {
                let resolved = self.ctx.resolve(ty.clone());
                if matches!(resolved, Ty::Var(_)) {
                    let field_tys: Vec<(String, Ty)> = fields
                        .iter()
                        .map(|(n, _)| (n.clone(), self.ctx.fresh_var()))
                        .collect();
                    self.ctx.unify(resolved, Ty::Record(field_tys), origin())?;
                }
                for (name, sub) in fields {
                    let fty = self.field_type(ty, name, span)?.ok_or_else(|| {
                        TypeError::UnresolvedField {
                            field: name.clone(),
                            span,
                        }
                    })?;
                    self.check_pattern(sub, &fty, span)?;
                }
                Ok(())
            }
            Pattern::Ctor(name, payload) => {
                let (result, payload_ty) = self.instantiate_ctor(name, span)?;
                self.ctx.unify(ty.clone(), result, origin())?;
                match payload {
                    Some(sub) => self.check_pattern(sub, &payload_ty, span),
                    None => Ok(()),
                }
            }
            Pattern::Array(ps) => {
                let elem = self.ctx.fresh_var();
                self.ctx.unify(ty.clone(), Ty::array(elem.clone()), origin())?;
                for p in ps {
                    self.check_pattern(p, &elem, span)?;
                }
                Ok(())
            }
            Pattern::As(name, inner) => {
                self.env.insert_local(name, ty.clone());
                self.check_pattern(inner, ty, span)
            }
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────────

    /// Unify `expr`'s type with `expected`, inserting an upcast when an
    /// opaque value flows into an ancestor type.
    fn coerce(&mut self, expr: Expr, expected: &Ty, origin: ConstraintOrigin) -> Result<Expr, TypeError> {
        let actual = self.ctx.resolve(node_ty(&expr));
        let target = self.ctx.resolve(expected.clone());
        if let (Ty::Opaque(a), Ty::Opaque(b)) = (&actual, &target) {
            if a != b && self.graph.is_usable_as(a.id, b.id) {
                let span = expr.span;
                return Ok(Expr {
                    kind: ExprKind::Cast(Box::new(expr), target.clone()),
                    ty: Some(target),
                    span,
                });
            }
        }
        self.ctx.unify(expected.clone(), actual, origin)?;
        Ok(expr)
    }

    /// The type of `field` on `object`, or `None` while `object` is unknown.
    fn field_type(&mut self, object: &Ty, field: &str, span: Span) -> Result<Option<Ty>, TypeError> {
        let resolved = self.ctx.resolve(object.clone());
        let structural = self.registry.structural(&resolved);
        match &structural {
            Ty::Var(_) => Ok(None),
            Ty::Record(fields) => fields
                .iter()
                .find(|(n, _)| n == field)
                .map(|(_, t)| Some(t.clone()))
                .ok_or_else(|| TypeError::NoSuchField {
                    ty: resolved.clone(),
                    field: field.to_string(),
                    span,
                }),
            _ => Err(TypeError::NoSuchField {
                ty: resolved,
                field: field.to_string(),
                span,
            }),
        }
    }

    fn instantiate_ctor(&mut self, name: &str, span: Span) -> Result<(Ty, Ty), TypeError> {
        let info = self
            .registry
            .constructor(name)
            .ok_or_else(|| TypeError::UnknownConstructor {
                name: name.to_string(),
                span,
            })?;
        let subst = self.ctx.freshen_params(&info.owner.params);
        let args = info
            .owner
            .params
            .iter()
            .map(|p| subst.get(p).cloned().unwrap_or_else(Ty::unit))
            .collect();
        let result = Ty::app(info.owner.name.clone(), args);
        Ok((result, info.payload.substitute_params(&subst)))
    }

    fn resolve_deferred(&mut self) -> Result<(), TypeError> {
        loop {
            let mut progress = false;
            let pending = std::mem::take(&mut self.deferred);
            for d in pending {
                match self.field_type(&d.object, &d.field, d.span)? {
                    Some(t) => {
                        self.ctx
                            .unify(d.result.clone(), t, ConstraintOrigin::Field { span: d.span })?;
                        progress = true;
                    }
                    None => self.deferred.push(d),
                }
            }
            if self.deferred.is_empty() {
                return Ok(());
            }
            if !progress {
                let d = &self.deferred[0];
                return Err(TypeError::UnresolvedField {
                    field: d.field.clone(),
                    span: d.span,
                });
            }
        }
    }
}
