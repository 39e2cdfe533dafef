//! Named types, transparent aliases, and foreign type descriptors.
//!
//! Named types are nominal: unification compares their names, and the
//! representation is consulted only for construction, projection and
//! pattern matching. Aliases are transparent: every other component sees
//! the expanded form. Alias bodies are expanded against existing aliases
//! when defined, and a body that reaches its own name fails with
//! `CyclicAlias` at definition time.

use std::any::TypeId;

use rustc_hash::FxHashMap;

use kiln_common::ty::PRIMITIVES;
use kiln_common::{ForeignId, ForeignRef, Ty};

use crate::error::{ConstraintOrigin, TypeError};

/// A parametric named type.
#[derive(Clone, Debug, PartialEq)]
pub struct NamedTypeDef {
    pub name: String,
    pub params: Vec<String>,
    /// Representation, with parameters as `Con(param)` placeholders.
    pub repr: Ty,
}

impl NamedTypeDef {
    /// The head type, `name<params..>`, with placeholders as arguments.
    pub fn head(&self) -> Ty {
        Ty::app(
            self.name.clone(),
            self.params.iter().map(|p| Ty::con(p.clone())).collect(),
        )
    }

    fn params_subst(&self, args: &[Ty]) -> FxHashMap<String, Ty> {
        self.params.iter().cloned().zip(args.iter().cloned()).collect()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AliasDef {
    pub name: String,
    pub params: Vec<String>,
    pub body: Ty,
}

/// Stable identity of a host type.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ForeignIdentity {
    Rust(TypeId),
    Named(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ForeignDescriptor {
    pub id: ForeignId,
    pub identity: ForeignIdentity,
    pub name: String,
    pub size: usize,
    pub in_struct: bool,
}

impl ForeignDescriptor {
    pub fn as_ref(&self) -> ForeignRef {
        ForeignRef {
            id: self.id,
            name: self.name.clone(),
        }
    }
}

/// Where a constructor name lives.
#[derive(Clone, Debug)]
pub struct CtorInfo<'a> {
    pub owner: &'a NamedTypeDef,
    pub tag: usize,
    /// Payload type with the owner's parameters as placeholders.
    pub payload: &'a Ty,
}

#[derive(Clone, Debug, Default)]
pub struct TypeRegistry {
    named: FxHashMap<String, NamedTypeDef>,
    /// Constructor name -> owning named type.
    ctor_owner: FxHashMap<String, String>,
    aliases: FxHashMap<String, AliasDef>,
    foreign: Vec<ForeignDescriptor>,
    foreign_by_identity: FxHashMap<ForeignIdentity, ForeignId>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Named types ─────────────────────────────────────────────────────

    /// Register a parametric named type and return its head type.
    ///
    /// Redefining a name with an identical representation is a no-op.
    pub fn define_named_type(
        &mut self,
        name: &str,
        params: &[String],
        repr: &Ty,
    ) -> Result<Ty, TypeError> {
        if PRIMITIVES.contains(&name) || self.aliases.contains_key(name) {
            return Err(TypeError::DuplicateDefinition {
                what: "type",
                name: name.to_string(),
            });
        }
        let repr = self.expand_aliases(repr)?;
        let def = NamedTypeDef {
            name: name.to_string(),
            params: params.to_vec(),
            repr,
        };
        if let Some(existing) = self.named.get(name) {
            if *existing == def {
                return Ok(existing.head());
            }
            return Err(TypeError::DuplicateDefinition {
                what: "type",
                name: name.to_string(),
            });
        }
        if let Ty::Variant(ctors) = &def.repr {
            for (ctor, _) in ctors {
                if let Some(owner) = self.ctor_owner.get(ctor) {
                    return Err(TypeError::DuplicateDefinition {
                        what: "constructor",
                        name: format!("{} (already in `{}`)", ctor, owner),
                    });
                }
            }
            for (ctor, _) in ctors {
                self.ctor_owner.insert(ctor.clone(), name.to_string());
            }
        }
        let head = def.head();
        self.named.insert(name.to_string(), def);
        Ok(head)
    }

    /// Whether `name` denotes a named or primitive type.
    pub fn is_type_name(&self, name: &str) -> bool {
        PRIMITIVES.contains(&name) || self.named.contains_key(name)
    }

    pub fn named_type(&self, name: &str) -> Option<&NamedTypeDef> {
        self.named.get(name)
    }

    /// The declared representation, parameters left as placeholders.
    pub fn named_type_representation(&self, name: &str) -> Option<Ty> {
        self.named.get(name).map(|d| d.repr.clone())
    }

    /// The representation of a named type application with its arguments
    /// substituted. `None` for anything that is not a named type.
    pub fn unfold(&self, ty: &Ty) -> Option<Ty> {
        let def = self.named.get(ty.head_name()?)?;
        let args = ty.type_args();
        if args.len() != def.params.len() {
            return None;
        }
        Some(def.repr.substitute_params(&def.params_subst(args)))
    }

    /// Unfold named types until the outermost layer is structural.
    pub fn structural(&self, ty: &Ty) -> Ty {
        let mut current = ty.clone();
        // Recursive named types always put structure between layers, so a
        // short bound is enough to reach it.
        for _ in 0..32 {
            match self.unfold(&current) {
                Some(next) => current = next,
                None => break,
            }
        }
        current
    }

    pub fn constructor(&self, ctor: &str) -> Option<CtorInfo<'_>> {
        let owner = self.named.get(self.ctor_owner.get(ctor)?)?;
        match &owner.repr {
            Ty::Variant(ctors) => ctors
                .iter()
                .enumerate()
                .find(|(_, (n, _))| n == ctor)
                .map(|(tag, (_, payload))| CtorInfo {
                    owner,
                    tag,
                    payload,
                }),
            _ => None,
        }
    }

    pub fn named_types(&self) -> impl Iterator<Item = &NamedTypeDef> {
        self.named.values()
    }

    // ── Aliases ─────────────────────────────────────────────────────────

    pub fn define_type_alias(
        &mut self,
        name: &str,
        params: &[String],
        body: &Ty,
    ) -> Result<(), TypeError> {
        if PRIMITIVES.contains(&name)
            || self.aliases.contains_key(name)
            || self.named.contains_key(name)
        {
            return Err(TypeError::DuplicateDefinition {
                what: "type alias",
                name: name.to_string(),
            });
        }
        if let Some(path) = self.reaches(body, name, &mut vec![name.to_string()]) {
            return Err(TypeError::CyclicAlias {
                name: name.to_string(),
                path,
            });
        }
        let expanded = self.expand_with(body, &mut vec![name.to_string()], params)?;
        self.aliases.insert(
            name.to_string(),
            AliasDef {
                name: name.to_string(),
                params: params.to_vec(),
                body: expanded,
            },
        );
        Ok(())
    }

    pub fn is_type_alias_name(&self, name: &str) -> bool {
        self.aliases.contains_key(name)
    }

    pub fn aliases(&self) -> impl Iterator<Item = &AliasDef> {
        self.aliases.values()
    }

    /// Expand every alias occurrence. Occurrences with the wrong number of
    /// arguments are left in place; use [`expand_aliases`] to reject them.
    ///
    /// [`expand_aliases`]: TypeRegistry::expand_aliases
    pub fn replace_type_aliases(&self, ty: &Ty) -> Ty {
        self.expand_aliases(ty).unwrap_or_else(|_| ty.clone())
    }

    /// Expand every alias occurrence, failing on arity errors or cycles.
    pub fn expand_aliases(&self, ty: &Ty) -> Result<Ty, TypeError> {
        self.expand_with(ty, &mut Vec::new(), &[])
    }

    /// `bound` names declaration parameters in scope, which shadow aliases.
    fn expand_with(
        &self,
        ty: &Ty,
        stack: &mut Vec<String>,
        bound: &[String],
    ) -> Result<Ty, TypeError> {
        let (name, args) = match ty {
            Ty::Con(c) => (c.name.as_str(), &[][..]),
            Ty::App(head, args) => match head.as_ref() {
                Ty::Con(c) => (c.name.as_str(), args.as_slice()),
                _ => return self.expand_children(ty, stack, bound),
            },
            _ => return self.expand_children(ty, stack, bound),
        };
        let alias = match self.aliases.get(name) {
            Some(a) if !bound.iter().any(|b| b == name) => a,
            _ => return self.expand_children(ty, stack, bound),
        };
        if stack.iter().any(|s| s == name) {
            let mut path = stack.clone();
            path.push(name.to_string());
            return Err(TypeError::CyclicAlias {
                name: stack[0].clone(),
                path,
            });
        }
        if args.len() != alias.params.len() {
            return Err(TypeError::ArityMismatch {
                expected: alias.params.len(),
                found: args.len(),
                origin: ConstraintOrigin::Builtin,
            });
        }
        let mut expanded_args = Vec::with_capacity(args.len());
        for a in args {
            expanded_args.push(self.expand_with(a, stack, bound)?);
        }
        let subst: FxHashMap<String, Ty> = alias
            .params
            .iter()
            .cloned()
            .zip(expanded_args)
            .collect();
        let body = alias.body.substitute_params(&subst);
        stack.push(name.to_string());
        let result = self.expand_with(&body, stack, bound);
        stack.pop();
        result
    }

    fn expand_children(
        &self,
        ty: &Ty,
        stack: &mut Vec<String>,
        bound: &[String],
    ) -> Result<Ty, TypeError> {
        let mut err = None;
        let out = ty.rewrite(&mut |t| {
            if std::ptr::eq(t, ty) || err.is_some() {
                return None;
            }
            match self.expand_with(t, stack, bound) {
                Ok(e) => Some(e),
                Err(e) => {
                    err = Some(e);
                    Some(t.clone())
                }
            }
        });
        match err {
            Some(e) => Err(e),
            None => Ok(out),
        }
    }

    /// Path of alias names from the top of `path` to `target`, if any
    /// stored alias body reachable from `ty` mentions `target`.
    fn reaches(&self, ty: &Ty, target: &str, path: &mut Vec<String>) -> Option<Vec<String>> {
        let mut names = Vec::new();
        ty.visit(&mut |t| {
            if let Ty::Con(c) = t {
                names.push(c.name.clone());
            }
        });
        for name in names {
            if name == target {
                let mut p = path.clone();
                p.push(name);
                return Some(p);
            }
            if path.contains(&name) {
                continue;
            }
            if let Some(alias) = self.aliases.get(&name) {
                path.push(name.clone());
                if let Some(p) = self.reaches(&alias.body, target, path) {
                    return Some(p);
                }
                path.pop();
            }
        }
        None
    }

    // ── Foreign descriptors ─────────────────────────────────────────────

    /// Register or fetch the descriptor for a host type.
    pub fn register_foreign(
        &mut self,
        identity: ForeignIdentity,
        name: &str,
        size: usize,
        in_struct: bool,
    ) -> Result<ForeignRef, TypeError> {
        if let Some(id) = self.foreign_by_identity.get(&identity) {
            let existing = &self.foreign[id.0 as usize];
            if existing.size != size || existing.in_struct != in_struct {
                return Err(TypeError::ForeignTypeConflict {
                    name: existing.name.clone(),
                    detail: format!(
                        "registered with size {} (in_struct={}), now size {} (in_struct={})",
                        existing.size, existing.in_struct, size, in_struct
                    ),
                });
            }
            return Ok(existing.as_ref());
        }
        let id = ForeignId(self.foreign.len() as u32);
        let desc = ForeignDescriptor {
            id,
            identity: identity.clone(),
            name: name.to_string(),
            size,
            in_struct,
        };
        let r = desc.as_ref();
        self.foreign.push(desc);
        self.foreign_by_identity.insert(identity, id);
        Ok(r)
    }

    pub fn foreign(&self, id: ForeignId) -> Option<&ForeignDescriptor> {
        self.foreign.get(id.0 as usize)
    }

    pub fn foreign_count(&self) -> usize {
        self.foreign.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(ns: &[&str]) -> Vec<String> {
        ns.iter().map(|s| s.to_string()).collect()
    }

    fn option_repr() -> Ty {
        Ty::variant(vec![("None", Ty::unit()), ("Some", Ty::con("a"))])
    }

    #[test]
    fn named_type_redefinition_is_idempotent() {
        let mut reg = TypeRegistry::new();
        let head = reg.define_named_type("Opt", &names(&["a"]), &option_repr()).unwrap();
        assert_eq!(head, Ty::app("Opt", vec![Ty::con("a")]));
        assert!(reg.define_named_type("Opt", &names(&["a"]), &option_repr()).is_ok());
    }

    #[test]
    fn named_type_redefinition_with_different_structure_fails() {
        let mut reg = TypeRegistry::new();
        reg.define_named_type("Celsius", &[], &Ty::float()).unwrap();
        assert!(matches!(
            reg.define_named_type("Celsius", &[], &Ty::int()),
            Err(TypeError::DuplicateDefinition { .. })
        ));
    }

    #[test]
    fn constructors_are_indexed_with_tags() {
        let mut reg = TypeRegistry::new();
        reg.define_named_type("Opt", &names(&["a"]), &option_repr()).unwrap();
        let info = reg.constructor("Some").unwrap();
        assert_eq!(info.owner.name, "Opt");
        assert_eq!(info.tag, 1);
        assert_eq!(info.payload, &Ty::con("a"));
        assert!(reg.constructor("Nope").is_none());
    }

    #[test]
    fn unfold_substitutes_arguments() {
        let mut reg = TypeRegistry::new();
        reg.define_named_type("Opt", &names(&["a"]), &option_repr()).unwrap();
        let unfolded = reg.unfold(&Ty::app("Opt", vec![Ty::int()])).unwrap();
        assert_eq!(
            unfolded,
            Ty::variant(vec![("None", Ty::unit()), ("Some", Ty::int())])
        );
    }

    #[test]
    fn alias_expansion_is_transparent_and_idempotent() {
        let mut reg = TypeRegistry::new();
        reg.define_type_alias("Pair", &names(&["a"]), &Ty::Tuple(vec![Ty::con("a"), Ty::con("a")]))
            .unwrap();
        reg.define_type_alias("Points", &[], &Ty::array(Ty::app("Pair", vec![Ty::float()])))
            .unwrap();
        let t = Ty::fun(vec![Ty::con("Points")], Ty::int());
        let once = reg.replace_type_aliases(&t);
        assert_eq!(
            once,
            Ty::fun(
                vec![Ty::array(Ty::Tuple(vec![Ty::float(), Ty::float()]))],
                Ty::int()
            )
        );
        assert_eq!(reg.replace_type_aliases(&once), once);
    }

    #[test]
    fn self_referential_alias_is_rejected_at_definition() {
        let mut reg = TypeRegistry::new();
        let err = reg
            .define_type_alias("Loop", &[], &Ty::array(Ty::con("Loop")))
            .unwrap_err();
        assert!(matches!(err, TypeError::CyclicAlias { ref name, .. } if name == "Loop"));
        assert!(!reg.is_type_alias_name("Loop"));
    }

    #[test]
    fn transitive_alias_cycle_is_rejected() {
        let mut reg = TypeRegistry::new();
        // `A` refers to `B` before `B` exists, then `B` closes the loop.
        reg.define_type_alias("A", &[], &Ty::array(Ty::con("B"))).unwrap();
        match reg.define_type_alias("B", &[], &Ty::con("A")) {
            Err(TypeError::CyclicAlias { name, path }) => {
                assert_eq!(name, "B");
                assert_eq!(path, vec!["B", "A", "B"]);
            }
            other => panic!("expected CyclicAlias, got {:?}", other),
        }
    }

    #[test]
    fn alias_arity_is_checked() {
        let mut reg = TypeRegistry::new();
        reg.define_type_alias("Box1", &names(&["a"]), &Ty::array(Ty::con("a"))).unwrap();
        assert!(reg.expand_aliases(&Ty::con("Box1")).is_err());
    }

    #[test]
    fn foreign_registration_is_stable_and_checked() {
        let mut reg = TypeRegistry::new();
        let id = ForeignIdentity::Named("Widget".into());
        let a = reg.register_foreign(id.clone(), "Widget", 16, false).unwrap();
        let b = reg.register_foreign(id.clone(), "Widget", 16, false).unwrap();
        assert_eq!(a, b);
        assert!(matches!(
            reg.register_foreign(id, "Widget", 32, false),
            Err(TypeError::ForeignTypeConflict { .. })
        ));
    }
}
