//! Unification engine for Hindley-Milner type inference.
//!
//! Implements unification over `ena`'s union-find table with an occurs
//! check, level-based generalization, scheme instantiation, and
//! snapshots for trial unification.

use ena::unify::{InPlaceUnificationTable, Snapshot};
use rustc_hash::FxHashMap;

use kiln_common::{Pred, Scheme, Ty, TyVar};

use crate::error::{ConstraintOrigin, TypeError};

/// The inference context: owns the unification table and level state.
pub struct InferCtx {
    table: InPlaceUnificationTable<TyVar>,
    /// Current let-nesting level for generalization.
    current_level: u32,
    /// Level at which each type variable was created, indexed by `TyVar.0`.
    var_levels: Vec<u32>,
}

/// Opaque handle for rolling back trial unifications.
pub struct InferSnapshot {
    snapshot: Snapshot<ena::unify::InPlace<TyVar>>,
    levels: usize,
}

impl InferCtx {
    pub fn new() -> Self {
        InferCtx {
            table: InPlaceUnificationTable::new(),
            current_level: 0,
            var_levels: Vec::new(),
        }
    }

    // ── Type Variable Creation ──────────────────────────────────────────

    /// Create a fresh type variable at the current level.
    pub fn fresh_var(&mut self) -> Ty {
        let var = self.table.new_key(None);
        while self.var_levels.len() <= var.0 as usize {
            self.var_levels.push(0);
        }
        self.var_levels[var.0 as usize] = self.current_level;
        Ty::Var(var)
    }

    /// Replace declaration placeholders with fresh variables.
    ///
    /// Returns the substitution so that related types (an instance's
    /// member types, a named type's representation) can be freshened
    /// consistently.
    pub fn freshen_params(&mut self, params: &[String]) -> FxHashMap<String, Ty> {
        params
            .iter()
            .map(|p| (p.clone(), self.fresh_var()))
            .collect()
    }

    /// Bring a type whose variables belong to another context into this one,
    /// giving each distinct foreign variable a fresh local variable.
    pub fn import(&mut self, ty: &Ty, map: &mut FxHashMap<TyVar, Ty>) -> Ty {
        for v in ty.free_vars() {
            if !map.contains_key(&v) {
                let fresh = self.fresh_var();
                map.insert(v, fresh);
            }
        }
        ty.substitute_vars(map)
    }

    // ── Resolution ──────────────────────────────────────────────────────

    /// Resolve a type by following union-find indirection, all the way down.
    pub fn resolve(&mut self, ty: Ty) -> Ty {
        match ty {
            Ty::Var(v) => match self.table.probe_value(v) {
                Some(inner) => self.resolve(inner),
                // Normalize to the root key so that unified-but-unbound
                // variables share one representative.
                None => Ty::Var(self.table.find(v)),
            },
            Ty::App(head, args) => {
                let head = Box::new(self.resolve(*head));
                let args = args.into_iter().map(|a| self.resolve(a)).collect();
                Ty::App(head, args)
            }
            Ty::Fun(params, ret) => {
                let params = params.into_iter().map(|p| self.resolve(p)).collect();
                let ret = Box::new(self.resolve(*ret));
                Ty::Fun(params, ret)
            }
            Ty::Tuple(elems) => Ty::Tuple(elems.into_iter().map(|e| self.resolve(e)).collect()),
            Ty::Record(fields) => Ty::Record(
                fields
                    .into_iter()
                    .map(|(n, t)| (n, self.resolve(t)))
                    .collect(),
            ),
            Ty::Variant(ctors) => Ty::Variant(
                ctors
                    .into_iter()
                    .map(|(n, t)| (n, self.resolve(t)))
                    .collect(),
            ),
            Ty::Array(elem) => Ty::Array(Box::new(self.resolve(*elem))),
            other @ (Ty::Con(_) | Ty::Opaque(_)) => other,
        }
    }

    /// Resolve only the outermost variable indirection.
    pub fn shallow_resolve(&mut self, ty: &Ty) -> Ty {
        match ty {
            Ty::Var(v) => match self.table.probe_value(*v) {
                Some(inner) => self.shallow_resolve(&inner),
                None => Ty::Var(self.table.find(*v)),
            },
            other => other.clone(),
        }
    }

    pub fn resolve_pred(&mut self, pred: &Pred) -> Pred {
        Pred {
            class: pred.class.clone(),
            args: pred.args.iter().map(|a| self.resolve(a.clone())).collect(),
        }
    }

    // ── Occurs Check ────────────────────────────────────────────────────

    /// Check if a type variable occurs anywhere within a type.
    pub fn occurs_in(&mut self, var: TyVar, ty: &Ty) -> bool {
        let resolved = self.resolve(ty.clone());
        let root = self.table.find(var);
        resolved.free_vars().iter().any(|v| *v == root)
    }

    // ── Unification ─────────────────────────────────────────────────────

    /// Unify two types, making them equal.
    pub fn unify(&mut self, a: Ty, b: Ty, origin: ConstraintOrigin) -> Result<(), TypeError> {
        let a = self.shallow_resolve(&a);
        let b = self.shallow_resolve(&b);

        match (a, b) {
            (Ty::Var(v1), Ty::Var(v2)) if v1 == v2 => Ok(()),

            (Ty::Var(v1), Ty::Var(v2)) => {
                // Keep the lower level so generalization never quantifies
                // a variable that escaped into an outer scope.
                let level = self.level_of(v1).min(self.level_of(v2));
                self.table
                    .unify_var_var(v1, v2)
                    .map_err(|_| TypeError::Internal("unifying two unbound vars failed".into()))?;
                let root = self.table.find(v1);
                self.set_level(root, level);
                Ok(())
            }

            (Ty::Var(v), ty) | (ty, Ty::Var(v)) => {
                if self.occurs_in(v, &ty) {
                    return Err(TypeError::InfiniteType {
                        var: v,
                        ty: self.resolve(ty),
                        origin,
                    });
                }
                let level = self.level_of(v);
                self.lower_levels(&ty, level);
                self.table
                    .unify_var_value(v, Some(ty))
                    .map_err(|_| TypeError::Internal("binding a checked var failed".into()))
            }

            (Ty::Con(c1), Ty::Con(c2)) => {
                if c1 == c2 {
                    Ok(())
                } else {
                    Err(TypeError::Mismatch {
                        expected: Ty::Con(c1),
                        found: Ty::Con(c2),
                        origin,
                    })
                }
            }

            (Ty::Opaque(r1), Ty::Opaque(r2)) => {
                if r1 == r2 {
                    Ok(())
                } else {
                    Err(TypeError::Mismatch {
                        expected: Ty::Opaque(r1),
                        found: Ty::Opaque(r2),
                        origin,
                    })
                }
            }

            (Ty::Fun(p1, r1), Ty::Fun(p2, r2)) => {
                if p1.len() != p2.len() {
                    return Err(TypeError::ArityMismatch {
                        expected: p1.len(),
                        found: p2.len(),
                        origin,
                    });
                }
                for (a, b) in p1.into_iter().zip(p2) {
                    self.unify(a, b, origin.clone())?;
                }
                self.unify(*r1, *r2, origin)
            }

            (Ty::App(h1, a1), Ty::App(h2, a2)) => {
                self.unify(*h1, *h2, origin.clone())?;
                self.unify_all(a1, a2, origin)
            }

            (Ty::Tuple(e1), Ty::Tuple(e2)) => self.unify_all(e1, e2, origin),

            (Ty::Array(e1), Ty::Array(e2)) => self.unify(*e1, *e2, origin),

            (Ty::Record(f1), Ty::Record(f2)) | (Ty::Variant(f1), Ty::Variant(f2))
                if labels_match(&f1, &f2) =>
            {
                let (t1, t2): (Vec<Ty>, Vec<Ty>) = f1
                    .into_iter()
                    .zip(f2)
                    .map(|((_, a), (_, b))| (a, b))
                    .unzip();
                self.unify_all(t1, t2, origin)
            }

            (a, b) => Err(TypeError::Mismatch {
                expected: self.resolve(a),
                found: self.resolve(b),
                origin,
            }),
        }
    }

    fn unify_all(&mut self, a: Vec<Ty>, b: Vec<Ty>, origin: ConstraintOrigin) -> Result<(), TypeError> {
        if a.len() != b.len() {
            return Err(TypeError::ArityMismatch {
                expected: a.len(),
                found: b.len(),
                origin,
            });
        }
        for (x, y) in a.into_iter().zip(b) {
            self.unify(x, y, origin.clone())?;
        }
        Ok(())
    }

    /// Try to unify; on failure, undo every binding the attempt made.
    pub fn try_unify(&mut self, a: &Ty, b: &Ty) -> bool {
        let snap = self.snapshot();
        match self.unify(a.clone(), b.clone(), ConstraintOrigin::Builtin) {
            Ok(()) => {
                self.commit(snap);
                true
            }
            Err(_) => {
                self.rollback_to(snap);
                false
            }
        }
    }

    // ── Snapshots ───────────────────────────────────────────────────────

    pub fn snapshot(&mut self) -> InferSnapshot {
        InferSnapshot {
            snapshot: self.table.snapshot(),
            levels: self.var_levels.len(),
        }
    }

    pub fn rollback_to(&mut self, snap: InferSnapshot) {
        self.table.rollback_to(snap.snapshot);
        self.var_levels.truncate(snap.levels);
    }

    pub fn commit(&mut self, snap: InferSnapshot) {
        self.table.commit(snap.snapshot);
    }

    // ── Level Management ────────────────────────────────────────────────

    pub fn enter_level(&mut self) {
        self.current_level += 1;
    }

    pub fn leave_level(&mut self) {
        debug_assert!(self.current_level > 0, "cannot leave level 0");
        self.current_level -= 1;
    }

    pub fn current_level(&self) -> u32 {
        self.current_level
    }

    fn level_of(&self, v: TyVar) -> u32 {
        self.var_levels.get(v.0 as usize).copied().unwrap_or(0)
    }

    fn set_level(&mut self, v: TyVar, level: u32) {
        if let Some(slot) = self.var_levels.get_mut(v.0 as usize) {
            *slot = level;
        }
    }

    fn lower_levels(&mut self, ty: &Ty, level: u32) {
        for v in self.resolve(ty.clone()).free_vars() {
            if self.level_of(v) > level {
                self.set_level(v, level);
            }
        }
    }

    // ── Generalization ──────────────────────────────────────────────────

    /// Generalize a type into a polymorphic scheme.
    ///
    /// Quantifies the variables created at a level deeper than the current
    /// one. Predicates are kept only when they mention a quantified variable.
    pub fn generalize(&mut self, ty: Ty, preds: &[Pred]) -> Scheme {
        let resolved = self.resolve(ty);
        let current = self.current_level;
        let vars: Vec<TyVar> = resolved
            .free_vars()
            .into_iter()
            .filter(|v| self.level_of(*v) > current)
            .collect();
        let mut kept: Vec<Pred> = Vec::new();
        for p in preds {
            let p = self.resolve_pred(p);
            let mentions = p
                .args
                .iter()
                .any(|a| a.free_vars().iter().any(|v| vars.contains(v)));
            if mentions && !kept.contains(&p) {
                kept.push(p);
            }
        }
        Scheme {
            vars,
            preds: kept,
            ty: resolved,
        }
    }

    // ── Instantiation ───────────────────────────────────────────────────

    /// Instantiate a scheme with fresh type variables, returning the type
    /// and the instantiated predicates.
    pub fn instantiate(&mut self, scheme: &Scheme) -> (Ty, Vec<Pred>) {
        if scheme.vars.is_empty() {
            return (scheme.ty.clone(), scheme.preds.clone());
        }
        let subst: FxHashMap<TyVar, Ty> = scheme
            .vars
            .iter()
            .map(|v| (*v, self.fresh_var()))
            .collect();
        let ty = scheme.ty.substitute_vars(&subst);
        let preds = scheme
            .preds
            .iter()
            .map(|p| Pred {
                class: p.class.clone(),
                args: p.args.iter().map(|a| a.substitute_vars(&subst)).collect(),
            })
            .collect();
        (ty, preds)
    }
}

impl Default for InferCtx {
    fn default() -> Self {
        Self::new()
    }
}

fn labels_match(a: &[(String, Ty)], b: &[(String, Ty)]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|((x, _), (y, _))| x == y)
}

/// Turn every inference variable into a distinct rigid constructor so the
/// type can be matched one-way in a throwaway context.
pub fn skolemize(ty: &Ty) -> Ty {
    ty.rewrite(&mut |t| match t {
        Ty::Var(v) => Some(Ty::con(format!("?{}", v.0))),
        _ => None,
    })
}

/// One-way matching: can `general` (with `params` as placeholders) be
/// instantiated to exactly `specific`? Variables in `specific` are rigid.
pub fn matches(params: &[String], general: &[Ty], specific: &[Ty]) -> bool {
    if general.len() != specific.len() {
        return false;
    }
    let mut ctx = InferCtx::new();
    let subst = ctx.freshen_params(params);
    general.iter().zip(specific).all(|(g, s)| {
        let g = g.substitute_params(&subst);
        ctx.unify(g, skolemize(s), ConstraintOrigin::Builtin).is_ok()
    })
}

// ── Tests ──────────────────────────────────────────────────────────────
