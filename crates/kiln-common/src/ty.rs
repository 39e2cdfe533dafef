//! Type representation for the Kiln type system.
//!
//! `Ty` covers both inference types (which may contain `Var`) and
//! monotypes (which never do). Polymorphism lives in [`Scheme`], and
//! type-class obligations ride along as [`Pred`]s in [`QualType`] and
//! `Scheme`.
//!
//! Declarations that take type parameters (named types, aliases, classes,
//! instances) refer to their parameters as `Con(param_name)`. The
//! parameters are replaced with [`Ty::substitute_params`] when the
//! declaration is used.

use std::fmt;

use rustc_hash::FxHashMap;

/// A type variable, identified by a `u32` index into the unification table.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TyVar(pub u32);

/// A type constructor name: a primitive (`Int`), a named type (`Shape`),
/// an alias head, or a declaration parameter placeholder.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TyCon {
    pub name: String,
}

impl TyCon {
    pub fn new(name: impl Into<String>) -> Self {
        TyCon { name: name.into() }
    }
}

impl fmt::Display for TyCon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Index of a foreign type descriptor in the registry arena.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ForeignId(pub u32);

/// Reference to a foreign (host) type.
///
/// Identity is the descriptor id. The name is carried only for display and
/// is excluded from `PartialEq` and `Hash`.
#[derive(Clone, Debug)]
pub struct ForeignRef {
    pub id: ForeignId,
    pub name: String,
}

impl PartialEq for ForeignRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ForeignRef {}

impl std::hash::Hash for ForeignRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// A Kiln type.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Ty {
    /// An inference variable.
    Var(TyVar),
    /// A nullary constructor: primitive, named type without arguments,
    /// or a declaration parameter.
    Con(TyCon),
    /// A named type or alias applied to arguments: `List Int`.
    App(Box<Ty>, Vec<Ty>),
    /// A function type. Application is always saturated.
    Fun(Vec<Ty>, Box<Ty>),
    Tuple(Vec<Ty>),
    /// Labelled fields in declaration order.
    Record(Vec<(String, Ty)>),
    /// Labelled constructors in declaration order. Each carries one
    /// payload type, `Unit` when the constructor takes no argument.
    Variant(Vec<(String, Ty)>),
    Array(Box<Ty>),
    /// An opaque host type registered through the foreign type graph.
    Opaque(ForeignRef),
}

impl Ty {
    pub fn con(name: impl Into<String>) -> Ty {
        Ty::Con(TyCon::new(name))
    }

    pub fn unit() -> Ty {
        Ty::con("Unit")
    }

    pub fn bool() -> Ty {
        Ty::con("Bool")
    }

    pub fn char() -> Ty {
        Ty::con("Char")
    }

    pub fn int() -> Ty {
        Ty::con("Int")
    }

    pub fn float() -> Ty {
        Ty::con("Float")
    }

    pub fn string() -> Ty {
        Ty::array(Ty::char())
    }

    pub fn fun(params: Vec<Ty>, ret: Ty) -> Ty {
        Ty::Fun(params, Box::new(ret))
    }

    pub fn array(elem: Ty) -> Ty {
        Ty::Array(Box::new(elem))
    }

    /// A named type applied to arguments. Nullary applications collapse to
    /// `Con` so that a named type has exactly one representation.
    pub fn app(name: impl Into<String>, args: Vec<Ty>) -> Ty {
        if args.is_empty() {
            Ty::con(name)
        } else {
            Ty::App(Box::new(Ty::con(name)), args)
        }
    }

    pub fn record(fields: Vec<(&str, Ty)>) -> Ty {
        Ty::Record(fields.into_iter().map(|(n, t)| (n.to_string(), t)).collect())
    }

    pub fn variant(ctors: Vec<(&str, Ty)>) -> Ty {
        Ty::Variant(ctors.into_iter().map(|(n, t)| (n.to_string(), t)).collect())
    }

    /// The head constructor name of a named type, `Con` or `App(Con, _)`.
    pub fn head_name(&self) -> Option<&str> {
        match self {
            Ty::Con(c) => Some(&c.name),
            Ty::App(head, _) => match head.as_ref() {
                Ty::Con(c) => Some(&c.name),
                _ => None,
            },
            _ => None,
        }
    }

    /// Arguments of a named type application (empty for `Con`).
    pub fn type_args(&self) -> &[Ty] {
        match self {
            Ty::App(_, args) => args,
            _ => &[],
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Ty::Con(c) if c.name == "Float")
    }

    /// Whether this is one of the built-in scalar types.
    pub fn is_primitive(&self) -> bool {
        matches!(self, Ty::Con(c) if PRIMITIVES.contains(&c.name.as_str()))
    }

    /// Whether the type contains no inference variables.
    pub fn is_ground(&self) -> bool {
        let mut ground = true;
        self.visit(&mut |t| {
            if matches!(t, Ty::Var(_)) {
                ground = false;
            }
        });
        ground
    }

    /// Inference variables in first-occurrence order, without duplicates.
    pub fn free_vars(&self) -> Vec<TyVar> {
        let mut out = Vec::new();
        self.visit(&mut |t| {
            if let Ty::Var(v) = t {
                if !out.contains(v) {
                    out.push(*v);
                }
            }
        });
        out
    }

    /// Whether `name` appears as a constructor anywhere inside the type.
    pub fn mentions_con(&self, name: &str) -> bool {
        let mut found = false;
        self.visit(&mut |t| {
            if let Ty::Con(c) = t {
                if c.name == name {
                    found = true;
                }
            }
        });
        found
    }

    /// Pre-order traversal of every node in the type.
    pub fn visit(&self, f: &mut impl FnMut(&Ty)) {
        f(self);
        match self {
            Ty::Var(_) | Ty::Con(_) | Ty::Opaque(_) => {}
            Ty::App(head, args) => {
                head.visit(f);
                for a in args {
                    a.visit(f);
                }
            }
            Ty::Fun(params, ret) => {
                for p in params {
                    p.visit(f);
                }
                ret.visit(f);
            }
            Ty::Tuple(elems) => {
                for e in elems {
                    e.visit(f);
                }
            }
            Ty::Record(fields) | Ty::Variant(fields) => {
                for (_, t) in fields {
                    t.visit(f);
                }
            }
            Ty::Array(elem) => elem.visit(f),
        }
    }

    /// Rebuild the type bottom-up, giving `f` the chance to replace each
    /// node before its children are visited. `f` returning `None` keeps
    /// the node and descends into it.
    pub fn rewrite(&self, f: &mut impl FnMut(&Ty) -> Option<Ty>) -> Ty {
        if let Some(replaced) = f(self) {
            return replaced;
        }
        match self {
            Ty::Var(_) | Ty::Con(_) | Ty::Opaque(_) => self.clone(),
            Ty::App(head, args) => Ty::App(
                Box::new(head.rewrite(f)),
                args.iter().map(|a| a.rewrite(f)).collect(),
            ),
            Ty::Fun(params, ret) => Ty::Fun(
                params.iter().map(|p| p.rewrite(f)).collect(),
                Box::new(ret.rewrite(f)),
            ),
            Ty::Tuple(elems) => Ty::Tuple(elems.iter().map(|e| e.rewrite(f)).collect()),
            Ty::Record(fields) => Ty::Record(
                fields.iter().map(|(n, t)| (n.clone(), t.rewrite(f))).collect(),
            ),
            Ty::Variant(ctors) => Ty::Variant(
                ctors.iter().map(|(n, t)| (n.clone(), t.rewrite(f))).collect(),
            ),
            Ty::Array(elem) => Ty::Array(Box::new(elem.rewrite(f))),
        }
    }

    /// Replace declaration parameters (`Con(param)`) with concrete types.
    pub fn substitute_params(&self, subst: &FxHashMap<String, Ty>) -> Ty {
        if subst.is_empty() {
            return self.clone();
        }
        self.rewrite(&mut |t| match t {
            Ty::Con(c) => subst.get(&c.name).cloned(),
            _ => None,
        })
    }

    /// Replace inference variables according to `subst`.
    pub fn substitute_vars(&self, subst: &FxHashMap<TyVar, Ty>) -> Ty {
        if subst.is_empty() {
            return self.clone();
        }
        self.rewrite(&mut |t| match t {
            Ty::Var(v) => subst.get(v).cloned(),
            _ => None,
        })
    }
}

/// Names of the built-in scalar types.
pub const PRIMITIVES: &[&str] = &["Unit", "Bool", "Char", "Int", "Float"];

fn write_list<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

impl fmt::Display for Ty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ty::Var(v) => write!(f, "?{}", v.0),
            Ty::Con(c) => write!(f, "{}", c),
            Ty::App(head, args) => {
                write!(f, "{}<", head)?;
                write_list(f, args)?;
                write!(f, ">")
            }
            Ty::Fun(params, ret) => {
                write!(f, "(")?;
                write_list(f, params)?;
                write!(f, ") -> {}", ret)
            }
            Ty::Tuple(elems) => {
                write!(f, "(")?;
                write_list(f, elems)?;
                if elems.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
            Ty::Record(fields) => {
                write!(f, "{{")?;
                for (i, (name, ty)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", name, ty)?;
                }
                write!(f, "}}")
            }
            Ty::Variant(ctors) => {
                write!(f, "|")?;
                for (i, (name, ty)) in ctors.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", name, ty)?;
                }
                write!(f, "|")
            }
            Ty::Array(elem) => write!(f, "[{}]", elem),
            Ty::Opaque(r) => write!(f, "<{}>", r.name),
        }
    }
}

/// A type-class predicate: `Eq Int`, `Convert Int Float`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Pred {
    pub class: String,
    pub args: Vec<Ty>,
}

impl Pred {
    pub fn new(class: impl Into<String>, args: Vec<Ty>) -> Self {
        Pred {
            class: class.into(),
            args,
        }
    }
}

impl fmt::Display for Pred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.class)?;
        for a in &self.args {
            write!(f, " {}", a)?;
        }
        Ok(())
    }
}

/// A type paired with the predicates that must hold for it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QualType {
    pub preds: Vec<Pred>,
    pub ty: Ty,
}

impl QualType {
    pub fn new(preds: Vec<Pred>, ty: Ty) -> Self {
        QualType { preds, ty }
    }

    pub fn mono(ty: Ty) -> Self {
        QualType {
            preds: Vec::new(),
            ty,
        }
    }
}

impl fmt::Display for QualType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.preds.is_empty() {
            write!(f, "(")?;
            write_list(f, &self.preds)?;
            write!(f, ") => ")?;
        }
        write!(f, "{}", self.ty)
    }
}

/// A polymorphic type scheme.
///
/// `forall a. Eq a => (a, [a]) -> Bool` is
/// `Scheme { vars: [a], preds: [Eq a], ty: Fun([a, [a]], Bool) }`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Scheme {
    pub vars: Vec<TyVar>,
    pub preds: Vec<Pred>,
    pub ty: Ty,
}

impl Scheme {
    /// A monomorphic scheme (no quantified variables).
    pub fn mono(ty: Ty) -> Self {
        Scheme {
            vars: Vec::new(),
            preds: Vec::new(),
            ty,
        }
    }

    pub fn is_mono(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn qual_type(&self) -> QualType {
        QualType::new(self.preds.clone(), self.ty.clone())
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.vars.is_empty() {
            write!(f, "forall")?;
            for v in &self.vars {
                write!(f, " ?{}", v.0)?;
            }
            write!(f, ". ")?;
        }
        write!(f, "{}", self.qual_type())
    }
}

// ── ena trait implementations ──────────────────────────────────────────

impl ena::unify::UnifyKey for TyVar {
    type Value = Option<Ty>;

    fn index(&self) -> u32 {
        self.0
    }

    fn from_index(u: u32) -> Self {
        TyVar(u)
    }

    fn tag() -> &'static str {
        "TyVar"
    }
}

impl ena::unify::EqUnifyValue for Ty {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ty_display() {
        assert_eq!(Ty::int().to_string(), "Int");
        assert_eq!(
            Ty::fun(vec![Ty::int(), Ty::float()], Ty::bool()).to_string(),
            "(Int, Float) -> Bool"
        );
        assert_eq!(Ty::app("List", vec![Ty::int()]).to_string(), "List<Int>");
        assert_eq!(Ty::array(Ty::char()).to_string(), "[Char]");
        assert_eq!(
            Ty::record(vec![("x", Ty::int()), ("y", Ty::float())]).to_string(),
            "{x: Int, y: Float}"
        );
        assert_eq!(
            Ty::variant(vec![("None", Ty::unit()), ("Some", Ty::int())]).to_string(),
            "|None: Unit, Some: Int|"
        );
    }

    #[test]
    fn nullary_app_collapses_to_con() {
        assert_eq!(Ty::app("Shape", vec![]), Ty::con("Shape"));
        assert_eq!(Ty::app("Shape", vec![]).head_name(), Some("Shape"));
    }

    #[test]
    fn substitute_params_replaces_placeholders() {
        let body = Ty::fun(vec![Ty::con("a")], Ty::array(Ty::con("a")));
        let mut subst = FxHashMap::default();
        subst.insert("a".to_string(), Ty::int());
        assert_eq!(
            body.substitute_params(&subst),
            Ty::fun(vec![Ty::int()], Ty::array(Ty::int()))
        );
    }

    #[test]
    fn free_vars_are_deduplicated_in_order() {
        let ty = Ty::fun(
            vec![Ty::Var(TyVar(3)), Ty::Var(TyVar(1))],
            Ty::Var(TyVar(3)),
        );
        assert_eq!(ty.free_vars(), vec![TyVar(3), TyVar(1)]);
        assert!(!ty.is_ground());
        assert!(Ty::int().is_ground());
    }

    #[test]
    fn foreign_ref_equality_ignores_name() {
        let a = ForeignRef { id: ForeignId(1), name: "Derived".into() };
        let b = ForeignRef { id: ForeignId(1), name: "alias".into() };
        assert_eq!(Ty::Opaque(a), Ty::Opaque(b));
    }

    #[test]
    fn scheme_display() {
        let a = Ty::Var(TyVar(0));
        let scheme = Scheme {
            vars: vec![TyVar(0)],
            preds: vec![Pred::new("Eq", vec![a.clone()])],
            ty: Ty::fun(vec![a.clone(), a], Ty::bool()),
        };
        insta::assert_snapshot!(scheme.to_string(), @"forall ?0. (Eq ?0) => (?0, ?0) -> Bool");
    }
}
