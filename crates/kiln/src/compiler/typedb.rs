//! Types as the host sees them: foreign descriptors, named types, aliases,
//! upcasts and coercion search.

use kiln_common::{Expr, Scheme, Span, Ty};
use kiln_typeck::{ForeignIdentity, GlobalKind, SearchEngine, SearchEntry, TypeError};

use super::Compiler;
use crate::error::CompileError;
use crate::lift::Lift;

fn owned(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

impl Compiler {
    // ── Foreign types ───────────────────────────────────────────────────

    /// The opaque type standing for host type `identity`, registered on
    /// first use.
    pub fn opaque_ptr_mono_type(
        &mut self,
        identity: ForeignIdentity,
        name: &str,
        size: usize,
        in_struct: bool,
    ) -> Result<Ty, CompileError> {
        let r = self.registry.register_foreign(identity, name, size, in_struct)?;
        Ok(Ty::Opaque(r))
    }

    pub fn opaque_ptr_poly_type(
        &mut self,
        identity: ForeignIdentity,
        name: &str,
        size: usize,
        in_struct: bool,
    ) -> Result<Scheme, CompileError> {
        let ty = self.opaque_ptr_mono_type(identity, name, size, in_struct)?;
        Ok(self.generalize(&ty))
    }

    /// Quantify the variables of `ty` that no enclosing scope binds.
    pub fn generalize(&self, ty: &Ty) -> Scheme {
        let bound = self.env.free_vars();
        let vars = ty.free_vars().into_iter().filter(|v| !bound.contains(v)).collect();
        Scheme {
            vars,
            preds: Vec::new(),
            ty: ty.clone(),
        }
    }

    pub fn lift_mono_type<T: Lift>(&mut self) -> Result<Ty, CompileError> {
        T::lift(self)
    }

    pub fn lift_type<T: Lift>(&mut self) -> Result<Scheme, CompileError> {
        let ty = T::lift(self)?;
        Ok(self.generalize(&ty))
    }

    /// Let `*const D` values be used where `*const B` is expected.
    pub fn add_obj<D: 'static, B: 'static>(&mut self) -> Result<(), CompileError> {
        let derived = <*const D as Lift>::lift(self)?;
        let base = <*const B as Lift>::lift(self)?;
        self.add_upcast(&derived, &base)
    }

    pub fn add_upcast(&mut self, derived: &Ty, base: &Ty) -> Result<(), CompileError> {
        let (Ty::Opaque(d), Ty::Opaque(b)) = (derived, base) else {
            return Err(CompileError::InvalidUpcast {
                derived: derived.to_string(),
                base: base.to_string(),
                reason: "only foreign types have upcasts".into(),
            });
        };
        self.graph.add_upcast(&self.registry, d.id, b.id)?;
        self.search_cache.clear();
        Ok(())
    }

    pub fn is_usable_as(&self, from: &Ty, to: &Ty) -> bool {
        from == to || self.graph.is_usable_as_ty(from, to)
    }

    // ── Named types and aliases ─────────────────────────────────────────

    /// Register a nominal type. Redefining it with the same representation
    /// returns the same head type.
    pub fn define_named_type(&mut self, name: &str, args: &[&str], repr: &Ty) -> Result<Ty, CompileError> {
        let head = self.registry.define_named_type(name, &owned(args), repr)?;
        tracing::debug!(name, repr = %repr, "defined named type");
        Ok(head)
    }

    pub fn is_type_name(&self, name: &str) -> bool {
        self.registry.is_type_name(name)
    }

    pub fn named_type_representation(&self, name: &str) -> Option<Ty> {
        self.registry.named_type_representation(name)
    }

    pub fn define_type_alias(&mut self, name: &str, args: &[&str], ty: &Ty) -> Result<(), CompileError> {
        self.registry.define_type_alias(name, &owned(args), ty)?;
        self.search_cache.clear();
        Ok(())
    }

    pub fn is_type_alias_name(&self, name: &str) -> bool {
        self.registry.is_type_alias_name(name)
    }

    pub fn replace_type_aliases(&self, ty: &Ty) -> Ty {
        self.registry.replace_type_aliases(ty)
    }

    // ── Search ──────────────────────────────────────────────────────────

    /// One-step conversions from `from` to `to`, sorted by name. Empty when
    /// there is none.
    pub fn search(&mut self, from: &Ty, to: &Ty) -> Result<Vec<SearchEntry>, CompileError> {
        self.transaction("search", |c| {
            let found = SearchEngine::new(&c.registry, &c.graph, &c.env, &c.classes, &mut c.search_cache)
                .search(from, to)?;
            Ok(found)
        })
    }

    /// Search from the type `expr` unsweetens to. The unsweetening leaves
    /// nothing behind.
    pub fn search_expr(&mut self, expr: &Expr, to: &Ty) -> Result<Vec<SearchEntry>, CompileError> {
        let snapshot = self.snapshot();
        let typed = self.unsweetener().unsweeten_expression(expr);
        self.restore(snapshot);
        let from = typed?.ty().cloned().unwrap_or_else(Ty::unit);
        self.search(&from, to)
    }

    pub fn search_name(&mut self, name: &str, to: &Ty) -> Result<Vec<SearchEntry>, CompileError> {
        let binding = self.env.lookup_global(name).ok_or_else(|| TypeError::UnboundVariable {
            name: name.to_string(),
            span: Span::synthetic(),
        })?;
        if !binding.scheme.is_mono() || matches!(binding.kind, GlobalKind::Poly(_) | GlobalKind::ClassMember(_)) {
            return Err(CompileError::TypeMismatch {
                declared: "a monomorphic type".into(),
                inferred: binding.scheme.to_string(),
            });
        }
        let from = binding.scheme.ty.clone();
        self.search(&from, to)
    }

    pub fn search_text(&mut self, expr_text: &str, type_text: &str) -> Result<Vec<SearchEntry>, CompileError> {
        let expr = self.read_expr(expr_text)?;
        let to = self.read_mono_type(type_text)?;
        self.search_expr(&expr, &to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generalize_skips_nothing_at_top_level() {
        let c = crate::Compiler::new().unwrap();
        let ty = Ty::fun(vec![Ty::Var(kiln_common::TyVar(7))], Ty::int());
        let scheme = c.generalize(&ty);
        assert_eq!(scheme.vars, vec![kiln_common::TyVar(7)]);
        assert!(c.generalize(&Ty::int()).is_mono());
    }

    #[test]
    fn upcasts_need_foreign_types() {
        let mut c = crate::Compiler::new().unwrap();
        let err = c.add_upcast(&Ty::int(), &Ty::float()).unwrap_err();
        assert!(matches!(err, CompileError::InvalidUpcast { .. }));
    }
}
