//! Coercion search: one-step conversions between two monotypes.
//!
//! Candidates come from the identity, the foreign upcast graph, global
//! one-parameter functions and one-member conversion classes. Chained
//! conversions are not explored; a caller wanting `A -> C` through `B`
//! searches twice.

use rustc_hash::FxHashMap;

use kiln_common::{Expr, Param, Span, Ty};

use crate::classes::{member_scheme, ClassEnv};
use crate::env::{GlobalKind, TypeEnv};
use crate::error::{ConstraintOrigin, TypeError};
use crate::foreign::ForeignTypeGraph;
use crate::registry::TypeRegistry;
use crate::unify::InferCtx;

/// One candidate conversion from `source` to `target`.
#[derive(Clone, Debug, PartialEq)]
pub struct SearchEntry {
    pub source: Ty,
    pub target: Ty,
    /// `id`, `upcast`, or the global or member performing the step.
    pub name: String,
    /// The type of `name` as declared.
    pub ty: Ty,
    /// A one-parameter function performing the conversion.
    pub expr: Expr,
}

/// Memoised search results, valid for one environment generation.
#[derive(Clone, Debug, Default)]
pub struct SearchCache {
    entries: FxHashMap<(Ty, Ty), Vec<SearchEntry>>,
    generation: u64,
    hits: u64,
    misses: u64,
}

impl SearchCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            tracing::debug!(entries = self.entries.len(), "search cache cleared");
        }
        self.entries.clear();
    }

    /// Drop everything computed against an older environment.
    fn sync(&mut self, generation: u64) {
        if self.generation != generation {
            self.clear();
            self.generation = generation;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }
}

pub struct SearchEngine<'a> {
    registry: &'a TypeRegistry,
    graph: &'a ForeignTypeGraph,
    env: &'a TypeEnv,
    classes: &'a ClassEnv,
    cache: &'a mut SearchCache,
}

impl<'a> SearchEngine<'a> {
    pub fn new(
        registry: &'a TypeRegistry,
        graph: &'a ForeignTypeGraph,
        env: &'a TypeEnv,
        classes: &'a ClassEnv,
        cache: &'a mut SearchCache,
    ) -> Self {
        SearchEngine {
            registry,
            graph,
            env,
            classes,
            cache,
        }
    }

    /// Every one-step conversion from `from` to `to`. An empty result means
    /// no path exists.
    pub fn search(&mut self, from: &Ty, to: &Ty) -> Result<Vec<SearchEntry>, TypeError> {
        let from = self.registry.expand_aliases(from)?;
        let to = self.registry.expand_aliases(to)?;
        self.cache.sync(self.env.generation());
        let key = (from.clone(), to.clone());
        if let Some(found) = self.cache.entries.get(&key) {
            self.cache.hits += 1;
            tracing::trace!(%from, %to, "search cache hit");
            return Ok(found.clone());
        }
        self.cache.misses += 1;
        tracing::debug!(%from, %to, "search cache miss");
        let entries = self.collect(&from, &to);
        self.cache.entries.insert(key, entries.clone());
        Ok(entries)
    }

    fn collect(&self, from: &Ty, to: &Ty) -> Vec<SearchEntry> {
        let mut out = Vec::new();
        let entry = |name: &str, ty: Ty, body: Expr| SearchEntry {
            source: from.clone(),
            target: to.clone(),
            name: name.to_string(),
            ty,
            expr: Expr::lambda(
                vec![Param::typed("x", from.clone())],
                Expr::annot(body, to.clone()),
            ),
        };
        let arrow = Ty::fun(vec![from.clone()], to.clone());

        if from == to {
            out.push(entry("id", arrow.clone(), Expr::var("x")));
        } else if self.graph.is_usable_as_ty(from, to) {
            out.push(entry("upcast", arrow.clone(), Expr::cast(Expr::var("x"), to.clone())));
        }

        for (name, binding) in self.env.globals() {
            // Specialisations are reachable through the definition they came from.
            if name.contains('@') {
                continue;
            }
            let convertible = match &binding.kind {
                GlobalKind::Value | GlobalKind::Extern | GlobalKind::Op | GlobalKind::Poly(_) => {
                    self.converts(&binding.scheme, &arrow)
                }
                GlobalKind::ClassMember(class) => self.member_converts(class, name, &arrow),
                GlobalKind::Forward => false,
            };
            if convertible {
                out.push(entry(
                    name,
                    binding.scheme.ty.clone(),
                    Expr::call(name, vec![Expr::var("x")]),
                ));
            }
        }

        out.sort_by(|a, b| {
            a.name
                .cmp(&b.name)
                .then_with(|| a.ty.to_string().cmp(&b.ty.to_string()))
        });
        out.dedup_by(|a, b| a.name == b.name && a.ty == b.ty);
        out
    }

    /// Whether an instance of `scheme` is exactly `arrow` with every
    /// predicate satisfiable.
    fn converts(&self, scheme: &kiln_common::Scheme, arrow: &Ty) -> bool {
        let mut ctx = InferCtx::new();
        let (ty, preds) = ctx.instantiate(scheme);
        if !matches!(&ty, Ty::Fun(params, _) if params.len() == 1) {
            return false;
        }
        if ctx.unify(ty, arrow.clone(), ConstraintOrigin::Builtin).is_err() {
            return false;
        }
        preds.iter().all(|p| {
            let p = ctx.resolve_pred(p);
            p.args.iter().all(Ty::is_ground) && self.classes.resolve(&p, Span::synthetic()).is_ok()
        })
    }

    /// Members of one-member classes of shape `a -> b` with an instance at
    /// the searched types.
    fn member_converts(&self, class: &str, member: &str, arrow: &Ty) -> bool {
        let Some(decl) = self.classes.class(class) else {
            return false;
        };
        if decl.members.len() != 1 {
            return false;
        }
        self.converts(&member_scheme(decl, member), arrow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::GlobalBinding;
    use crate::registry::ForeignIdentity;
    use kiln_common::{ClassDecl, InstanceDecl, Scheme};

    fn op(env: &mut TypeEnv, name: &str, ty: Ty) {
        env.bind(
            name,
            GlobalBinding {
                scheme: Scheme::mono(ty),
                kind: GlobalKind::Op,
            },
        );
    }

    fn names(entries: &[SearchEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.name.as_str()).collect()
    }

    #[test]
    fn finds_identity_and_functions_in_name_order() {
        let registry = TypeRegistry::new();
        let graph = ForeignTypeGraph::new();
        let mut env = TypeEnv::new();
        let classes = ClassEnv::new();
        let mut cache = SearchCache::new();
        op(&mut env, "toFloat", Ty::fun(vec![Ty::int()], Ty::float()));
        op(&mut env, "asFloat", Ty::fun(vec![Ty::int()], Ty::float()));
        op(&mut env, "neg", Ty::fun(vec![Ty::int()], Ty::int()));

        let mut engine = SearchEngine::new(&registry, &graph, &env, &classes, &mut cache);
        let found = engine.search(&Ty::int(), &Ty::float()).unwrap();
        assert_eq!(names(&found), vec!["asFloat", "toFloat"]);
        let same = engine.search(&Ty::int(), &Ty::int()).unwrap();
        assert_eq!(names(&same), vec!["id", "neg"]);
        assert!(engine.search(&Ty::bool(), &Ty::char()).unwrap().is_empty());
    }

    #[test]
    fn cache_hits_until_environment_changes() {
        let registry = TypeRegistry::new();
        let graph = ForeignTypeGraph::new();
        let mut env = TypeEnv::new();
        let classes = ClassEnv::new();
        let mut cache = SearchCache::new();
        op(&mut env, "toFloat", Ty::fun(vec![Ty::int()], Ty::float()));

        let first = SearchEngine::new(&registry, &graph, &env, &classes, &mut cache)
            .search(&Ty::int(), &Ty::float())
            .unwrap();
        let second = SearchEngine::new(&registry, &graph, &env, &classes, &mut cache)
            .search(&Ty::int(), &Ty::float())
            .unwrap();
        assert_eq!(first, second);
        assert_eq!((cache.hits(), cache.misses()), (1, 1));

        op(&mut env, "round", Ty::fun(vec![Ty::int()], Ty::float()));
        let third = SearchEngine::new(&registry, &graph, &env, &classes, &mut cache)
            .search(&Ty::int(), &Ty::float())
            .unwrap();
        assert_eq!(names(&third), vec!["round", "toFloat"]);
        assert_eq!(cache.misses(), 2);
    }

    #[test]
    fn polymorphic_and_class_conversions_match() {
        let registry = TypeRegistry::new();
        let graph = ForeignTypeGraph::new();
        let mut env = TypeEnv::new();
        let mut classes = ClassEnv::new();
        let mut cache = SearchCache::new();
        let a = kiln_common::TyVar(0);
        env.bind(
            "singleton",
            GlobalBinding {
                scheme: Scheme {
                    vars: vec![a],
                    preds: vec![],
                    ty: Ty::fun(vec![Ty::Var(a)], Ty::array(Ty::Var(a))),
                },
                kind: GlobalKind::Poly(Expr::lam(&["v"], Expr::array(vec![Expr::var("v")]))),
            },
        );
        let convert = ClassDecl {
            name: "Convert".into(),
            params: vec!["a".into(), "b".into()],
            members: vec![("convert".into(), Ty::fun(vec![Ty::con("a")], Ty::con("b")))],
        };
        for (member, scheme) in classes.define_class(convert).unwrap() {
            env.bind(
                &member,
                GlobalBinding {
                    scheme,
                    kind: GlobalKind::ClassMember("Convert".into()),
                },
            );
        }
        classes
            .add_instance(InstanceDecl::ground(
                "Convert",
                vec![Ty::int(), Ty::array(Ty::int())],
                vec![("convert".into(), Expr::var("singleton"))],
            ))
            .unwrap();

        let mut engine = SearchEngine::new(&registry, &graph, &env, &classes, &mut cache);
        let found = engine.search(&Ty::int(), &Ty::array(Ty::int())).unwrap();
        assert_eq!(names(&found), vec!["convert", "singleton"]);
        assert!(engine.search(&Ty::float(), &Ty::array(Ty::int())).unwrap().is_empty());
        // `convert` has no instance at Float.
        assert_eq!(
            names(&engine.search(&Ty::float(), &Ty::array(Ty::float())).unwrap()),
            vec!["singleton"]
        );
    }

    #[test]
    fn opaque_upcast_is_an_entry() {
        let mut registry = TypeRegistry::new();
        let base = registry
            .register_foreign(ForeignIdentity::Named("Base".into()), "Base", 8, false)
            .unwrap();
        let derived = registry
            .register_foreign(ForeignIdentity::Named("Derived".into()), "Derived", 8, false)
            .unwrap();
        let mut graph = ForeignTypeGraph::new();
        graph.add_upcast(&registry, derived.id, base.id).unwrap();
        let env = TypeEnv::new();
        let classes = ClassEnv::new();
        let mut cache = SearchCache::new();
        let mut engine = SearchEngine::new(&registry, &graph, &env, &classes, &mut cache);
        let found = engine
            .search(&Ty::Opaque(derived.clone()), &Ty::Opaque(base.clone()))
            .unwrap();
        assert_eq!(names(&found), vec!["upcast"]);
        assert!(engine
            .search(&Ty::Opaque(base), &Ty::Opaque(derived))
            .unwrap()
            .is_empty());
    }
}
