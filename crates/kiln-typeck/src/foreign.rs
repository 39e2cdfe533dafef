//! Upcast relationships among foreign types.
//!
//! Edges go from a derived descriptor to its single base, so each id has at
//! most one outgoing edge and ancestor queries are a walk up the chain.

use rustc_hash::FxHashMap;

use kiln_common::{ForeignId, Ty};

use crate::error::TypeError;
use crate::registry::TypeRegistry;

#[derive(Clone, Debug, Default)]
pub struct ForeignTypeGraph {
    base: FxHashMap<ForeignId, ForeignId>,
}

impl ForeignTypeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `derived -> base`. Re-adding the same edge is a no-op.
    pub fn add_upcast(
        &mut self,
        registry: &TypeRegistry,
        derived: ForeignId,
        base: ForeignId,
    ) -> Result<(), TypeError> {
        let name = |id: ForeignId| {
            registry
                .foreign(id)
                .map(|d| d.name.clone())
                .unwrap_or_else(|| format!("#{}", id.0))
        };
        let invalid = |reason: String| TypeError::InvalidUpcast {
            derived: name(derived),
            base: name(base),
            reason,
        };
        if registry.foreign(derived).is_none() || registry.foreign(base).is_none() {
            return Err(invalid("unregistered foreign type".into()));
        }
        if derived == base {
            return Err(invalid("a type cannot be its own base".into()));
        }
        match self.base.get(&derived) {
            Some(existing) if *existing == base => return Ok(()),
            Some(existing) => {
                return Err(invalid(format!("already derives from `{}`", name(*existing))));
            }
            None => {}
        }
        if self.is_usable_as(base, derived) {
            return Err(invalid("the edge would create a cycle".into()));
        }
        tracing::debug!(derived = %name(derived), base = %name(base), "registered upcast");
        self.base.insert(derived, base);
        Ok(())
    }

    /// Whether a value of `x` may be used where `y` is expected.
    ///
    /// Reflexive. Unrelated pairs are simply `false`.
    pub fn is_usable_as(&self, x: ForeignId, y: ForeignId) -> bool {
        self.ancestors(x).any(|a| a == y)
    }

    /// `x` followed by its bases, nearest first.
    pub fn ancestors(&self, x: ForeignId) -> impl Iterator<Item = ForeignId> + '_ {
        std::iter::successors(Some(x), move |id| self.base.get(id).copied())
    }

    /// Type-level form of [`is_usable_as`]: true only for two opaque types.
    ///
    /// [`is_usable_as`]: ForeignTypeGraph::is_usable_as
    pub fn is_usable_as_ty(&self, from: &Ty, to: &Ty) -> bool {
        match (from, to) {
            (Ty::Opaque(a), Ty::Opaque(b)) => self.is_usable_as(a.id, b.id),
            _ => false,
        }
    }

    pub fn edge_count(&self) -> usize {
        self.base.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ForeignIdentity;

    fn setup() -> (TypeRegistry, ForeignId, ForeignId, ForeignId) {
        let mut reg = TypeRegistry::new();
        let mut add = |n: &str| {
            reg.register_foreign(ForeignIdentity::Named(n.into()), n, 8, false)
                .unwrap()
                .id
        };
        let base = add("Base");
        let derived = add("Derived");
        let other = add("Other");
        (reg, base, derived, other)
    }

    #[test]
    fn derived_is_usable_as_base_but_not_reverse() {
        let (reg, base, derived, other) = setup();
        let mut g = ForeignTypeGraph::new();
        g.add_upcast(&reg, derived, base).unwrap();
        assert!(g.is_usable_as(derived, base));
        assert!(!g.is_usable_as(base, derived));
        assert!(!g.is_usable_as(derived, other));
        assert!(g.is_usable_as(other, other));
    }

    #[test]
    fn ancestors_walk_transitively() {
        let (mut reg, base, derived, _) = setup();
        let leaf = reg
            .register_foreign(ForeignIdentity::Named("Leaf".into()), "Leaf", 8, false)
            .unwrap()
            .id;
        let mut g = ForeignTypeGraph::new();
        g.add_upcast(&reg, derived, base).unwrap();
        g.add_upcast(&reg, leaf, derived).unwrap();
        assert_eq!(g.ancestors(leaf).collect::<Vec<_>>(), vec![leaf, derived, base]);
        assert!(g.is_usable_as(leaf, base));
    }

    #[test]
    fn cycles_and_second_bases_are_rejected() {
        let (reg, base, derived, other) = setup();
        let mut g = ForeignTypeGraph::new();
        g.add_upcast(&reg, derived, base).unwrap();
        assert!(g.add_upcast(&reg, derived, base).is_ok());
        assert!(matches!(
            g.add_upcast(&reg, base, derived),
            Err(TypeError::InvalidUpcast { .. })
        ));
        assert!(matches!(
            g.add_upcast(&reg, derived, other),
            Err(TypeError::InvalidUpcast { .. })
        ));
        assert_eq!(g.edge_count(), 1);
    }
}
