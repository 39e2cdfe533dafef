//! Expression and pattern trees.
//!
//! The same node kinds are used before and after unsweetening. A sweet
//! tree leaves `ty` empty (except where the author annotated) and may refer
//! to overloaded or polymorphic names. An unsweetened tree has a monotype
//! in `ty` on every node and refers only to monomorphic bindings.

use std::fmt;

use crate::span::Span;
use crate::ty::{Pred, Ty};

/// Literal values.
#[derive(Clone, Debug, PartialEq)]
pub enum Lit {
    Unit,
    Bool(bool),
    Char(char),
    Int(i64),
    Float(f64),
    /// A string literal, typed as `[Char]`.
    Str(String),
}

impl Lit {
    pub fn ty(&self) -> Ty {
        match self {
            Lit::Unit => Ty::unit(),
            Lit::Bool(_) => Ty::bool(),
            Lit::Char(_) => Ty::char(),
            Lit::Int(_) => Ty::int(),
            Lit::Float(_) => Ty::float(),
            Lit::Str(_) => Ty::string(),
        }
    }
}

impl fmt::Display for Lit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lit::Unit => write!(f, "()"),
            Lit::Bool(b) => write!(f, "{}", b),
            Lit::Char(c) => write!(f, "{:?}", c),
            Lit::Int(n) => write!(f, "{}", n),
            Lit::Float(x) => write!(f, "{:?}", x),
            Lit::Str(s) => write!(f, "{:?}", s),
        }
    }
}

/// A lambda parameter with an optional annotation.
#[derive(Clone, Debug, PartialEq)]
pub struct Param {
    pub name: String,
    pub ty: Option<Ty>,
}

impl Param {
    pub fn new(name: impl Into<String>) -> Self {
        Param {
            name: name.into(),
            ty: None,
        }
    }

    pub fn typed(name: impl Into<String>, ty: Ty) -> Self {
        Param {
            name: name.into(),
            ty: Some(ty),
        }
    }
}

/// One clause of a match: a pattern per scrutinee, an optional guard, a body.
#[derive(Clone, Debug, PartialEq)]
pub struct MatchArm {
    pub patterns: Vec<Pattern>,
    pub guard: Option<Expr>,
    pub body: Expr,
}

impl MatchArm {
    pub fn new(patterns: Vec<Pattern>, body: Expr) -> Self {
        MatchArm {
            patterns,
            guard: None,
            body,
        }
    }

    pub fn guarded(patterns: Vec<Pattern>, guard: Expr, body: Expr) -> Self {
        MatchArm {
            patterns,
            guard: Some(guard),
            body,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ExprKind {
    Lit(Lit),
    Var(String),
    /// Saturated application.
    App(Box<Expr>, Vec<Expr>),
    Lambda(Vec<Param>, Box<Expr>),
    /// Monomorphic local binding.
    Let(String, Box<Expr>, Box<Expr>),
    /// Mutually recursive local functions.
    LetRec(Vec<(String, Expr)>, Box<Expr>),
    If(Box<Expr>, Box<Expr>, Box<Expr>),
    Match(Vec<Expr>, Vec<MatchArm>),
    Annot(Box<Expr>, Ty),
    Tuple(Vec<Expr>),
    Record(Vec<(String, Expr)>),
    Field(Box<Expr>, String),
    /// Variant construction. A missing payload means `()`.
    Ctor(String, Option<Box<Expr>>),
    Array(Vec<Expr>),
    /// Representation-preserving conversion to an ancestor foreign type.
    Cast(Box<Expr>, Ty),
}

/// An expression node.
#[derive(Clone, Debug, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub ty: Option<Ty>,
    pub span: Span,
}

impl Expr {
    pub fn new(kind: ExprKind) -> Self {
        Expr {
            kind,
            ty: None,
            span: Span::synthetic(),
        }
    }

    pub fn at(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn with_ty(mut self, ty: Ty) -> Self {
        self.ty = Some(ty);
        self
    }

    /// The node's type. Unsweetened trees always have one.
    pub fn ty(&self) -> Option<&Ty> {
        self.ty.as_ref()
    }

    pub fn lit(lit: Lit) -> Self {
        Expr::new(ExprKind::Lit(lit))
    }

    pub fn unit() -> Self {
        Expr::lit(Lit::Unit)
    }

    pub fn int(n: i64) -> Self {
        Expr::lit(Lit::Int(n))
    }

    pub fn float(x: f64) -> Self {
        Expr::lit(Lit::Float(x))
    }

    pub fn bool(b: bool) -> Self {
        Expr::lit(Lit::Bool(b))
    }

    pub fn char(c: char) -> Self {
        Expr::lit(Lit::Char(c))
    }

    pub fn str(s: impl Into<String>) -> Self {
        Expr::lit(Lit::Str(s.into()))
    }

    pub fn var(name: impl Into<String>) -> Self {
        Expr::new(ExprKind::Var(name.into()))
    }

    pub fn app(f: Expr, args: Vec<Expr>) -> Self {
        Expr::new(ExprKind::App(Box::new(f), args))
    }

    /// Apply a named function: `call("f", [x])` is `f(x)`.
    pub fn call(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::app(Expr::var(name), args)
    }

    pub fn lambda(params: Vec<Param>, body: Expr) -> Self {
        Expr::new(ExprKind::Lambda(params, Box::new(body)))
    }

    /// Lambda over unannotated parameter names.
    pub fn lam(names: &[&str], body: Expr) -> Self {
        Expr::lambda(names.iter().map(|n| Param::new(*n)).collect(), body)
    }

    pub fn let_(name: impl Into<String>, value: Expr, body: Expr) -> Self {
        Expr::new(ExprKind::Let(name.into(), Box::new(value), Box::new(body)))
    }

    pub fn letrec(bindings: Vec<(String, Expr)>, body: Expr) -> Self {
        Expr::new(ExprKind::LetRec(bindings, Box::new(body)))
    }

    pub fn if_(cond: Expr, then: Expr, els: Expr) -> Self {
        Expr::new(ExprKind::If(Box::new(cond), Box::new(then), Box::new(els)))
    }

    pub fn match_(scrutinees: Vec<Expr>, arms: Vec<MatchArm>) -> Self {
        Expr::new(ExprKind::Match(scrutinees, arms))
    }

    pub fn annot(e: Expr, ty: Ty) -> Self {
        Expr::new(ExprKind::Annot(Box::new(e), ty))
    }

    pub fn tuple(elems: Vec<Expr>) -> Self {
        Expr::new(ExprKind::Tuple(elems))
    }

    pub fn record(fields: Vec<(&str, Expr)>) -> Self {
        Expr::new(ExprKind::Record(
            fields.into_iter().map(|(n, e)| (n.to_string(), e)).collect(),
        ))
    }

    pub fn field(e: Expr, name: impl Into<String>) -> Self {
        Expr::new(ExprKind::Field(Box::new(e), name.into()))
    }

    pub fn ctor(name: impl Into<String>, payload: Option<Expr>) -> Self {
        Expr::new(ExprKind::Ctor(name.into(), payload.map(Box::new)))
    }

    pub fn array(elems: Vec<Expr>) -> Self {
        Expr::new(ExprKind::Array(elems))
    }

    pub fn cast(e: Expr, ty: Ty) -> Self {
        Expr::new(ExprKind::Cast(Box::new(e), ty))
    }

    /// Binary operator sugar: `binop("+", a, b)` is `(+)(a, b)`.
    pub fn binop(op: &str, lhs: Expr, rhs: Expr) -> Self {
        Expr::call(op, vec![lhs, rhs])
    }

    pub fn is_lambda(&self) -> bool {
        matches!(self.kind, ExprKind::Lambda(..))
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ExprKind::Lit(lit) => write!(f, "{}", lit),
            ExprKind::Var(name) => write!(f, "{}", name),
            ExprKind::App(func, args) => {
                write!(f, "{}(", func)?;
                write_exprs(f, args)?;
                write!(f, ")")
            }
            ExprKind::Lambda(params, body) => {
                write!(f, "\\")?;
                for (i, p) in params.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    match &p.ty {
                        Some(ty) => write!(f, "({}: {})", p.name, ty)?,
                        None => write!(f, "{}", p.name)?,
                    }
                }
                write!(f, " -> {}", body)
            }
            ExprKind::Let(name, value, body) => {
                write!(f, "let {} = {} in {}", name, value, body)
            }
            ExprKind::LetRec(bindings, body) => {
                write!(f, "letrec ")?;
                for (i, (name, value)) in bindings.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{} = {}", name, value)?;
                }
                write!(f, " in {}", body)
            }
            ExprKind::If(c, t, e) => write!(f, "if {} then {} else {}", c, t, e),
            ExprKind::Match(scrutinees, arms) => {
                write!(f, "match ")?;
                write_exprs(f, scrutinees)?;
                write!(f, " with")?;
                for arm in arms {
                    write!(f, " | ")?;
                    for (i, p) in arm.patterns.iter().enumerate() {
                        if i > 0 {
                            write!(f, " ")?;
                        }
                        write!(f, "{}", p)?;
                    }
                    if let Some(g) = &arm.guard {
                        write!(f, " where {}", g)?;
                    }
                    write!(f, " -> {}", arm.body)?;
                }
                Ok(())
            }
            ExprKind::Annot(e, ty) => write!(f, "({} :: {})", e, ty),
            ExprKind::Tuple(elems) => {
                write!(f, "(")?;
                write_exprs(f, elems)?;
                write!(f, ")")
            }
            ExprKind::Record(fields) => {
                write!(f, "{{")?;
                for (i, (name, e)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{} = {}", name, e)?;
                }
                write!(f, "}}")
            }
            ExprKind::Field(e, name) => write!(f, "{}.{}", e, name),
            ExprKind::Ctor(name, payload) => match payload {
                Some(p) => write!(f, "|{}={}|", name, p),
                None => write!(f, "|{}|", name),
            },
            ExprKind::Array(elems) => {
                write!(f, "[")?;
                write_exprs(f, elems)?;
                write!(f, "]")
            }
            ExprKind::Cast(e, ty) => write!(f, "cast({}, {})", e, ty),
        }
    }
}

fn write_exprs(f: &mut fmt::Formatter<'_>, exprs: &[Expr]) -> fmt::Result {
    for (i, e) in exprs.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", e)?;
    }
    Ok(())
}

/// Match patterns.
#[derive(Clone, Debug, PartialEq)]
pub enum Pattern {
    Wildcard,
    Bind(String),
    Lit(Lit),
    Tuple(Vec<Pattern>),
    Record(Vec<(String, Pattern)>),
    /// Constructor with an optional payload pattern. A missing payload
    /// pattern matches any payload.
    Ctor(String, Option<Box<Pattern>>),
    /// A fixed-length array.
    Array(Vec<Pattern>),
    /// Bind the whole value and continue matching the inner pattern.
    As(String, Box<Pattern>),
}

impl Pattern {
    pub fn bind(name: impl Into<String>) -> Self {
        Pattern::Bind(name.into())
    }

    pub fn int(n: i64) -> Self {
        Pattern::Lit(Lit::Int(n))
    }

    pub fn ctor(name: impl Into<String>, payload: Option<Pattern>) -> Self {
        Pattern::Ctor(name.into(), payload.map(Box::new))
    }

    /// Names bound by this pattern, left to right.
    pub fn bound_names(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_names(&mut out);
        out
    }

    fn collect_names(&self, out: &mut Vec<String>) {
        match self {
            Pattern::Wildcard | Pattern::Lit(_) => {}
            Pattern::Bind(name) => out.push(name.clone()),
            Pattern::Tuple(ps) | Pattern::Array(ps) => {
                for p in ps {
                    p.collect_names(out);
                }
            }
            Pattern::Record(fields) => {
                for (_, p) in fields {
                    p.collect_names(out);
                }
            }
            Pattern::Ctor(_, payload) => {
                if let Some(p) = payload {
                    p.collect_names(out);
                }
            }
            Pattern::As(name, inner) => {
                out.push(name.clone());
                inner.collect_names(out);
            }
        }
    }

    /// Whether the pattern matches every value without testing anything.
    pub fn is_irrefutable_leaf(&self) -> bool {
        matches!(self, Pattern::Wildcard | Pattern::Bind(_))
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Wildcard => write!(f, "_"),
            Pattern::Bind(name) => write!(f, "{}", name),
            Pattern::Lit(lit) => write!(f, "{}", lit),
            Pattern::Tuple(ps) => {
                write!(f, "(")?;
                write_patterns(f, ps)?;
                write!(f, ")")
            }
            Pattern::Record(fields) => {
                write!(f, "{{")?;
                for (i, (name, p)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{} = {}", name, p)?;
                }
                write!(f, "}}")
            }
            Pattern::Ctor(name, payload) => match payload {
                Some(p) => write!(f, "|{}={}|", name, p),
                None => write!(f, "|{}|", name),
            },
            Pattern::Array(ps) => {
                write!(f, "[")?;
                write_patterns(f, ps)?;
                write!(f, "]")
            }
            Pattern::As(name, inner) => write!(f, "{}@{}", name, inner),
        }
    }
}

fn write_patterns(f: &mut fmt::Formatter<'_>, ps: &[Pattern]) -> fmt::Result {
    for (i, p) in ps.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", p)?;
    }
    Ok(())
}

/// A type-class declaration. Member types refer to the class parameters
/// as `Con(param)`.
#[derive(Clone, Debug, PartialEq)]
pub struct ClassDecl {
    pub name: String,
    pub params: Vec<String>,
    pub members: Vec<(String, Ty)>,
}

/// An instance declaration. `args` may mention the placeholders listed in
/// `params`; `context` lists the predicates the instance relies on.
#[derive(Clone, Debug, PartialEq)]
pub struct InstanceDecl {
    pub class: String,
    pub params: Vec<String>,
    pub args: Vec<Ty>,
    pub context: Vec<Pred>,
    pub members: Vec<(String, Expr)>,
}

impl InstanceDecl {
    /// A ground instance with no placeholders or context.
    pub fn ground(class: impl Into<String>, args: Vec<Ty>, members: Vec<(String, Expr)>) -> Self {
        InstanceDecl {
            class: class.into(),
            params: Vec::new(),
            args,
            context: Vec::new(),
            members,
        }
    }
}

/// A top-level item produced by reading a module.
#[derive(Clone, Debug, PartialEq)]
pub enum ModuleItem {
    Define { name: String, expr: Expr },
    TypeAlias { name: String, args: Vec<String>, ty: Ty },
    NamedType { name: String, args: Vec<String>, ty: Ty },
    Class(ClassDecl),
    Instance(InstanceDecl),
}

/// A sequence of top-level items, processed in order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Module {
    pub items: Vec<ModuleItem>,
}
