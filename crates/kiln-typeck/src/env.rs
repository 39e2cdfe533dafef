//! Type environment: global bindings plus a local scope stack.
//!
//! Global bindings carry a [`GlobalKind`] saying how a value is obtained at
//! run time. Every change to the global scope is recorded in an undo log so
//! a failed top-level operation can be rolled back to a mark. Local scopes
//! hold monomorphic types only and are pushed and popped by inference.

use std::fmt;

use rustc_hash::FxHashMap;

use kiln_common::{Expr, QualType, Scheme, Ty, TyVar};

/// How a global name gets its value.
#[derive(Clone, Debug, PartialEq)]
pub enum GlobalKind {
    /// Type known, value not yet supplied.
    Forward,
    /// A compiled definition.
    Value,
    /// A generic definition kept as source, specialised on use.
    Poly(Expr),
    /// A host function or host value cell.
    Extern,
    /// A low-level operation emitted inline.
    Op,
    /// A member of the named class.
    ClassMember(String),
}

impl GlobalKind {
    fn label(&self) -> &'static str {
        match self {
            GlobalKind::Forward => "forward",
            GlobalKind::Value => "value",
            GlobalKind::Poly(_) => "poly",
            GlobalKind::Extern => "extern",
            GlobalKind::Op => "op",
            GlobalKind::ClassMember(_) => "member",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct GlobalBinding {
    pub scheme: Scheme,
    pub kind: GlobalKind,
}

impl GlobalBinding {
    pub fn has_value(&self) -> bool {
        !matches!(self.kind, GlobalKind::Forward)
    }
}

impl fmt::Display for GlobalBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            GlobalKind::ClassMember(class) => write!(f, "{} [{}]", self.scheme, class),
            kind => write!(f, "{} [{}]", self.scheme, kind.label()),
        }
    }
}

/// Rollback position in the global undo log.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EnvMark(usize);

#[derive(Clone, Debug)]
struct Undo {
    name: String,
    previous: Option<GlobalBinding>,
}

#[derive(Clone, Debug, Default)]
pub struct TypeEnv {
    globals: FxHashMap<String, GlobalBinding>,
    /// Definition order, for stable dumps.
    order: Vec<String>,
    undo: Vec<Undo>,
    /// Local scopes, innermost last.
    scopes: Vec<FxHashMap<String, Ty>>,
    /// Bumped on every global change so caches can tell they are stale.
    generation: u64,
}

impl TypeEnv {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Globals ─────────────────────────────────────────────────────────

    pub fn bind(&mut self, name: &str, binding: GlobalBinding) {
        tracing::trace!(name, binding = %binding, "bind global");
        let previous = self.globals.insert(name.to_string(), binding);
        if previous.is_none() {
            self.order.push(name.to_string());
        }
        self.undo.push(Undo {
            name: name.to_string(),
            previous,
        });
        self.generation += 1;
    }

    /// Register a type without a value, so later definitions may refer to
    /// the name before it is supplied.
    pub fn forward_declare(&mut self, name: &str, qt: &QualType) {
        self.bind(
            name,
            GlobalBinding {
                scheme: Scheme {
                    vars: Vec::new(),
                    preds: qt.preds.clone(),
                    ty: qt.ty.clone(),
                },
                kind: GlobalKind::Forward,
            },
        );
    }

    /// Bind a compiled monomorphic value.
    pub fn define(&mut self, name: &str, ty: &Ty) {
        self.bind(
            name,
            GlobalBinding {
                scheme: Scheme::mono(ty.clone()),
                kind: GlobalKind::Value,
            },
        );
    }

    pub fn lookup_global(&self, name: &str) -> Option<&GlobalBinding> {
        self.globals.get(name)
    }

    pub fn has_value_binding(&self, name: &str) -> bool {
        self.globals.get(name).is_some_and(GlobalBinding::has_value)
    }

    pub fn is_forward_only(&self, name: &str) -> bool {
        self.globals
            .get(name)
            .is_some_and(|b| matches!(b.kind, GlobalKind::Forward))
    }

    /// Globals in definition order.
    pub fn globals(&self) -> impl Iterator<Item = (&str, &GlobalBinding)> {
        self.order
            .iter()
            .filter_map(|n| self.globals.get(n).map(|b| (n.as_str(), b)))
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    // ── Undo log ────────────────────────────────────────────────────────

    pub fn mark(&self) -> EnvMark {
        EnvMark(self.undo.len())
    }

    /// Undo every global change made since `mark`.
    pub fn rollback_to(&mut self, mark: EnvMark) {
        while self.undo.len() > mark.0 {
            let Some(entry) = self.undo.pop() else { break };
            match entry.previous {
                Some(prev) => {
                    self.globals.insert(entry.name, prev);
                }
                None => {
                    self.globals.remove(&entry.name);
                    if let Some(pos) = self.order.iter().rposition(|n| *n == entry.name) {
                        self.order.remove(pos);
                    }
                }
            }
        }
        self.generation += 1;
    }

    // ── Locals ──────────────────────────────────────────────────────────

    pub fn push_scope(&mut self) {
        self.scopes.push(FxHashMap::default());
    }

    pub fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    /// Bind a local in the innermost scope.
    pub fn insert_local(&mut self, name: &str, ty: Ty) {
        if self.scopes.is_empty() {
            self.scopes.push(FxHashMap::default());
        }
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string(), ty);
        }
    }

    pub fn lookup_local(&self, name: &str) -> Option<&Ty> {
        self.scopes.iter().rev().find_map(|s| s.get(name))
    }

    pub fn local_depth(&self) -> usize {
        self.scopes.len()
    }

    /// Drop all local scopes, leaving globals intact.
    pub fn clear_locals(&mut self) {
        self.scopes.clear();
    }

    /// Variables free in the local scopes. Generalization must leave these
    /// alone, since the enclosing scope may still constrain them.
    pub fn free_vars(&self) -> Vec<TyVar> {
        let mut out = Vec::new();
        for scope in &self.scopes {
            for ty in scope.values() {
                for v in ty.free_vars() {
                    if !out.contains(&v) {
                        out.push(v);
                    }
                }
            }
        }
        out
    }

    // ── Introspection ───────────────────────────────────────────────────

    /// Names and rendered types, in definition order.
    pub fn dump(&self) -> (Vec<String>, Vec<String>) {
        self.globals()
            .map(|(n, b)| (n.to_string(), b.scheme.to_string()))
            .unzip()
    }

    /// One `name :: type` line per global.
    pub fn show(&self) -> String {
        let mut out = String::new();
        for (name, binding) in self.globals() {
            out.push_str(name);
            out.push_str(" :: ");
            out.push_str(&binding.to_string());
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_declared_name_has_no_value() {
        let mut env = TypeEnv::new();
        env.forward_declare("f", &QualType::mono(Ty::fun(vec![Ty::int()], Ty::int())));
        assert!(env.lookup_global("f").is_some());
        assert!(!env.has_value_binding("f"));
        assert!(env.is_forward_only("f"));
        env.define("f", &Ty::fun(vec![Ty::int()], Ty::int()));
        assert!(env.has_value_binding("f"));
    }

    #[test]
    fn rollback_restores_previous_bindings() {
        let mut env = TypeEnv::new();
        env.define("x", &Ty::int());
        let mark = env.mark();
        env.define("x", &Ty::float());
        env.forward_declare("y", &QualType::mono(Ty::bool()));
        env.rollback_to(mark);
        assert_eq!(env.lookup_global("x").unwrap().scheme.ty, Ty::int());
        assert!(env.lookup_global("y").is_none());
        assert_eq!(env.dump().0, vec!["x".to_string()]);
    }

    #[test]
    fn locals_shadow_outward() {
        let mut env = TypeEnv::new();
        env.push_scope();
        env.insert_local("x", Ty::int());
        env.push_scope();
        env.insert_local("x", Ty::bool());
        assert_eq!(env.lookup_local("x"), Some(&Ty::bool()));
        env.pop_scope();
        assert_eq!(env.lookup_local("x"), Some(&Ty::int()));
        env.pop_scope();
        assert!(env.lookup_local("x").is_none());
    }

    #[test]
    fn show_lists_globals_in_order() {
        let mut env = TypeEnv::new();
        env.define("one", &Ty::int());
        env.forward_declare("two", &QualType::mono(Ty::float()));
        insta::assert_snapshot!(env.show(), @r"
        one :: Int [value]
        two :: Float [forward]
        ");
    }
}
