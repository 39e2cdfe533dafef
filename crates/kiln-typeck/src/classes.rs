//! Type classes and instance resolution.
//!
//! Instances are stored per class. Lookup is structural: an instance head
//! is freshened and unified one-way against the query in a throwaway
//! `InferCtx`, so `Eq [a]` answers `Eq [Int]`.
//!
//! When several instances match, the most specific one wins. Instance A is
//! more specific than B when A's head is a substitution instance of B's and
//! not the other way round. A unique most-specific candidate is selected;
//! incomparable candidates are reported as ambiguous.

use std::fmt;

use rustc_hash::FxHashMap;

use kiln_common::{ClassDecl, Expr, InstanceDecl, Pred, Scheme, Span, Ty, TyVar};

use crate::error::{ConstraintOrigin, TypeError};
use crate::unify::{matches, skolemize, InferCtx};

pub type TypeClass = ClassDecl;
pub type Instance = InstanceDecl;

/// Bound on nested instance-context checks.
pub const MAX_CONTEXT_DEPTH: usize = 64;

/// Render an instance head as `Class T1 T2`.
pub struct InstanceHead<'a>(pub &'a Instance);

impl fmt::Display for InstanceHead<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Pred::new(self.0.class.clone(), self.0.args.clone()))
    }
}

/// A resolved instance with its parameters bound to the query's types.
#[derive(Debug)]
pub struct Resolved<'a> {
    pub instance: &'a Instance,
    pub index: usize,
    pub subst: FxHashMap<String, Ty>,
}

impl Resolved<'_> {
    pub fn member(&self, name: &str) -> Option<&Expr> {
        self.instance
            .members
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, e)| e)
    }
}

#[derive(Clone, Debug, Default)]
pub struct ClassEnv {
    classes: FxHashMap<String, TypeClass>,
    instances: FxHashMap<String, Vec<Instance>>,
    member_class: FxHashMap<String, String>,
}

impl ClassEnv {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Classes ─────────────────────────────────────────────────────────

    /// Register a class. Returns the scheme of each member, ready to be
    /// bound in the environment.
    pub fn define_class(&mut self, class: TypeClass) -> Result<Vec<(String, Scheme)>, TypeError> {
        if self.classes.contains_key(&class.name) {
            return Err(TypeError::DuplicateDefinition {
                what: "class",
                name: class.name.clone(),
            });
        }
        for (member, _) in &class.members {
            if let Some(owner) = self.member_class.get(member) {
                return Err(TypeError::DuplicateDefinition {
                    what: "class member",
                    name: format!("{} (already in `{}`)", member, owner),
                });
            }
        }
        let schemes = class
            .members
            .iter()
            .map(|(m, _)| (m.clone(), member_scheme(&class, m)))
            .collect::<Vec<_>>();
        for (member, _) in &class.members {
            self.member_class.insert(member.clone(), class.name.clone());
        }
        tracing::debug!(class = %class.name, members = class.members.len(), "defined class");
        self.instances.entry(class.name.clone()).or_default();
        self.classes.insert(class.name.clone(), class);
        Ok(schemes)
    }

    pub fn class(&self, name: &str) -> Option<&TypeClass> {
        self.classes.get(name)
    }

    pub fn class_of_member(&self, member: &str) -> Option<&TypeClass> {
        self.classes.get(self.member_class.get(member)?)
    }

    pub fn classes(&self) -> impl Iterator<Item = &TypeClass> {
        self.classes.values()
    }

    pub fn instances(&self, class: &str) -> &[Instance] {
        self.instances.get(class).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn instance_count(&self) -> usize {
        self.instances.values().map(Vec::len).sum()
    }

    // ── Instances ───────────────────────────────────────────────────────

    /// Validate and register an instance.
    pub fn add_instance(&mut self, inst: Instance) -> Result<(), TypeError> {
        let class = self
            .classes
            .get(&inst.class)
            .ok_or_else(|| TypeError::UnknownClass {
                name: inst.class.clone(),
            })?;
        if inst.args.len() != class.params.len() {
            return Err(TypeError::ArityMismatch {
                expected: class.params.len(),
                found: inst.args.len(),
                origin: ConstraintOrigin::Builtin,
            });
        }
        for (member, _) in &class.members {
            if !inst.members.iter().any(|(n, _)| n == member) {
                return Err(TypeError::MissingMember {
                    class: class.name.clone(),
                    member: member.clone(),
                });
            }
        }
        for (member, _) in &inst.members {
            if !class.members.iter().any(|(n, _)| n == member) {
                return Err(TypeError::UnknownMember {
                    class: class.name.clone(),
                    member: member.clone(),
                });
            }
        }
        for ctx_pred in &inst.context {
            if !self.classes.contains_key(&ctx_pred.class) {
                return Err(TypeError::UnknownClass {
                    name: ctx_pred.class.clone(),
                });
            }
        }
        let existing = self.instances.entry(inst.class.clone()).or_default();
        if existing.iter().any(|e| same_head(e, &inst)) {
            return Err(TypeError::DuplicateDefinition {
                what: "instance",
                name: InstanceHead(&inst).to_string(),
            });
        }
        tracing::debug!(instance = %InstanceHead(&inst), "added instance");
        existing.push(inst);
        Ok(())
    }

    /// Instances whose head matches `args` one-way. Variables in `args`
    /// are rigid.
    pub fn matching(&self, class: &str, args: &[Ty]) -> Vec<(usize, &Instance)> {
        self.instances(class)
            .iter()
            .enumerate()
            .filter(|(_, i)| matches(&i.params, &i.args, args))
            .collect()
    }

    /// Instances whose head could unify with `args`, treating variables in
    /// `args` as flexible.
    pub fn unifiable(&self, class: &str, args: &[Ty]) -> Vec<(usize, &Instance)> {
        self.instances(class)
            .iter()
            .enumerate()
            .filter(|(_, i)| {
                let mut ctx = InferCtx::new();
                let subst = ctx.freshen_params(&i.params);
                let mut imported = FxHashMap::default();
                i.args.len() == args.len()
                    && i.args.iter().zip(args).all(|(g, a)| {
                        let g = g.substitute_params(&subst);
                        let a = ctx.import(a, &mut imported);
                        ctx.unify(g, a, ConstraintOrigin::Builtin).is_ok()
                    })
            })
            .collect()
    }

    /// Resolve a predicate over ground types to its most specific instance,
    /// checking the instance context recursively.
    pub fn resolve(&self, pred: &Pred, span: Span) -> Result<Resolved<'_>, TypeError> {
        self.resolve_at(pred, span, 0)
    }

    fn resolve_at(&self, pred: &Pred, span: Span, depth: usize) -> Result<Resolved<'_>, TypeError> {
        if depth > MAX_CONTEXT_DEPTH {
            return Err(TypeError::DrainLimit {
                name: pred.to_string(),
                limit: MAX_CONTEXT_DEPTH,
            });
        }
        if !self.classes.contains_key(&pred.class) {
            return Err(TypeError::UnknownClass {
                name: pred.class.clone(),
            });
        }
        let candidates = self.matching(&pred.class, &pred.args);
        let (index, instance) = most_specific(&candidates).map_err(|tied| {
            if tied.is_empty() {
                TypeError::NoInstance {
                    class: pred.class.clone(),
                    args: pred.args.clone(),
                    span,
                }
            } else {
                TypeError::AmbiguousInstance {
                    class: pred.class.clone(),
                    args: pred.args.clone(),
                    candidates: tied,
                    span,
                }
            }
        })?;
        let subst = instance_subst(instance, &pred.args).ok_or_else(|| {
            TypeError::Internal(format!("instance `{}` matched but did not bind", InstanceHead(instance)))
        })?;
        for ctx_pred in &instance.context {
            let needed = Pred::new(
                ctx_pred.class.clone(),
                ctx_pred.args.iter().map(|a| a.substitute_params(&subst)).collect(),
            );
            self.resolve_at(&needed, span, depth + 1)?;
        }
        tracing::trace!(pred = %pred, instance = %InstanceHead(instance), "resolved instance");
        Ok(Resolved {
            instance,
            index,
            subst,
        })
    }
}

/// The scheme of a class member: `forall params. Class params => ty`.
pub fn member_scheme(class: &TypeClass, member: &str) -> Scheme {
    let vars: Vec<TyVar> = (0..class.params.len() as u32).map(TyVar).collect();
    let subst: FxHashMap<String, Ty> = class
        .params
        .iter()
        .cloned()
        .zip(vars.iter().map(|v| Ty::Var(*v)))
        .collect();
    let ty = class
        .members
        .iter()
        .find(|(n, _)| n == member)
        .map(|(_, t)| t.substitute_params(&subst))
        .unwrap_or_else(Ty::unit);
    Scheme {
        preds: vec![Pred::new(
            class.name.clone(),
            vars.iter().map(|v| Ty::Var(*v)).collect(),
        )],
        vars,
        ty,
    }
}

/// Bind an instance's parameters against concrete arguments.
pub fn instance_subst(inst: &Instance, args: &[Ty]) -> Option<FxHashMap<String, Ty>> {
    if inst.args.len() != args.len() {
        return None;
    }
    let mut ctx = InferCtx::new();
    let fresh = ctx.freshen_params(&inst.params);
    for (g, a) in inst.args.iter().zip(args) {
        ctx.unify(g.substitute_params(&fresh), skolemize(a), ConstraintOrigin::Builtin)
            .ok()?;
    }
    let mut subst = FxHashMap::default();
    for (name, var) in fresh {
        subst.insert(name, ctx.resolve(var));
    }
    Some(subst)
}

/// Whether `a`'s head is a substitution instance of `b`'s.
fn at_least_as_specific(a: &Instance, b: &Instance) -> bool {
    matches(&b.params, &b.args, &a.args)
}

fn same_head(a: &Instance, b: &Instance) -> bool {
    at_least_as_specific(a, b) && at_least_as_specific(b, a)
}

/// Pick the unique most specific candidate. On failure, returns the
/// rendered heads of the tied candidates (empty when there were none).
fn most_specific<'a>(
    candidates: &[(usize, &'a Instance)],
) -> Result<(usize, &'a Instance), Vec<String>> {
    let maximal: Vec<&(usize, &Instance)> = candidates
        .iter()
        .filter(|(_, c)| {
            !candidates.iter().any(|(_, d)| {
                at_least_as_specific(d, c) && !at_least_as_specific(c, d)
            })
        })
        .collect();
    match maximal.as_slice() {
        [(index, inst)] => Ok((*index, *inst)),
        _ => Err(maximal
            .iter()
            .map(|(_, i)| InstanceHead(i).to_string())
            .collect()),
    }
}
