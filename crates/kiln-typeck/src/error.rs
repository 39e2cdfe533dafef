//! Type error types with provenance tracking.
//!
//! Every unification error carries a `ConstraintOrigin` recording why the
//! two types were required to be equal, so diagnostics can point at the
//! node that introduced the constraint.

use std::fmt;

use kiln_common::{Span, Ty, TyVar};

/// Where a type constraint came from.
#[derive(Clone, Debug, PartialEq)]
pub enum ConstraintOrigin {
    /// Argument `arg_idx` of an application.
    FnArg { call_site: Span, arg_idx: usize },
    /// The callee of an application must be a function.
    Callee { call_site: Span },
    /// A user annotation `e :: T`.
    Annotation { annotation_span: Span },
    /// The condition of an `if` must be `Bool`.
    IfCondition { span: Span },
    /// Both branches of an `if` must agree.
    IfBranches { then_span: Span, else_span: Span },
    /// A pattern must match its scrutinee.
    Pattern { span: Span },
    /// A guard must be `Bool`.
    Guard { span: Span },
    /// All match arm bodies must agree.
    MatchArm { span: Span },
    /// All array elements must agree.
    ArrayElem { span: Span },
    /// A record field projection.
    Field { span: Span },
    /// A constructor payload.
    Ctor { span: Span },
    /// A let or letrec binding.
    LetBinding { binding_span: Span },
    /// A declared compile signature against the inferred expression type.
    Signature,
    /// Internal constraints (instance matching, specialisation).
    Builtin,
}

impl ConstraintOrigin {
    pub fn span(&self) -> Option<Span> {
        match self {
            ConstraintOrigin::FnArg { call_site, .. } | ConstraintOrigin::Callee { call_site } => {
                Some(*call_site)
            }
            ConstraintOrigin::Annotation { annotation_span } => Some(*annotation_span),
            ConstraintOrigin::IfCondition { span }
            | ConstraintOrigin::Pattern { span }
            | ConstraintOrigin::Guard { span }
            | ConstraintOrigin::MatchArm { span }
            | ConstraintOrigin::ArrayElem { span }
            | ConstraintOrigin::Field { span }
            | ConstraintOrigin::Ctor { span } => Some(*span),
            ConstraintOrigin::IfBranches { then_span, else_span } => {
                Some(then_span.merge(*else_span))
            }
            ConstraintOrigin::LetBinding { binding_span } => Some(*binding_span),
            ConstraintOrigin::Signature | ConstraintOrigin::Builtin => None,
        }
    }
}

/// A type error encountered while checking, resolving or registering types.
#[derive(Clone, Debug, PartialEq)]
pub enum TypeError {
    /// Two types that should be equal are not.
    Mismatch {
        expected: Ty,
        found: Ty,
        origin: ConstraintOrigin,
    },
    /// A type variable occurs inside the type it is bound to.
    InfiniteType {
        var: TyVar,
        ty: Ty,
        origin: ConstraintOrigin,
    },
    /// Function, tuple or type application with the wrong number of parts.
    ArityMismatch {
        expected: usize,
        found: usize,
        origin: ConstraintOrigin,
    },
    UnboundVariable { name: String, span: Span },
    /// A global whose type is known but whose value has not been supplied.
    UnboundValue { name: String, span: Span },
    UnknownConstructor { name: String, span: Span },
    UnknownType { name: String },
    NoSuchField { ty: Ty, field: String, span: Span },
    /// Field access on a value whose type never became known.
    UnresolvedField { field: String, span: Span },
    UnknownClass { name: String },
    /// An instance does not define a member its class declares.
    MissingMember { class: String, member: String },
    /// An instance defines a member its class does not declare.
    UnknownMember { class: String, member: String },
    NoInstance {
        class: String,
        args: Vec<Ty>,
        span: Span,
    },
    AmbiguousInstance {
        class: String,
        args: Vec<Ty>,
        candidates: Vec<String>,
        span: Span,
    },
    DuplicateDefinition { what: &'static str, name: String },
    CyclicAlias { name: String, path: Vec<String> },
    /// A foreign type identity registered again with different layout.
    ForeignTypeConflict { name: String, detail: String },
    InvalidUpcast {
        derived: String,
        base: String,
        reason: String,
    },
    /// Residual definition draining ran past its limits.
    DrainLimit { name: String, limit: usize },
    /// Unexpected state inside the checker.
    Internal(String),
}

fn write_tys(f: &mut fmt::Formatter<'_>, tys: &[Ty]) -> fmt::Result {
    for (i, t) in tys.iter().enumerate() {
        if i > 0 {
            write!(f, " ")?;
        }
        write!(f, "{}", t)?;
    }
    Ok(())
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeError::Mismatch { expected, found, .. } => {
                write!(f, "type mismatch: expected `{}`, found `{}`", expected, found)
            }
            TypeError::InfiniteType { var, ty, .. } => {
                write!(f, "infinite type: `?{}` occurs in `{}`", var.0, ty)
            }
            TypeError::ArityMismatch { expected, found, .. } => {
                write!(f, "arity mismatch: expected {}, found {}", expected, found)
            }
            TypeError::UnboundVariable { name, .. } => write!(f, "unbound variable `{}`", name),
            TypeError::UnboundValue { name, .. } => {
                write!(f, "`{}` is declared but has no value", name)
            }
            TypeError::UnknownConstructor { name, .. } => {
                write!(f, "unknown constructor `{}`", name)
            }
            TypeError::UnknownType { name } => write!(f, "unknown type `{}`", name),
            TypeError::NoSuchField { ty, field, .. } => {
                write!(f, "type `{}` has no field `{}`", ty, field)
            }
            TypeError::UnresolvedField { field, .. } => write!(
                f,
                "cannot resolve field `{}` on a value of unknown type; add an annotation",
                field
            ),
            TypeError::UnknownClass { name } => write!(f, "unknown type class `{}`", name),
            TypeError::MissingMember { class, member } => {
                write!(f, "instance of `{}` does not define `{}`", class, member)
            }
            TypeError::UnknownMember { class, member } => {
                write!(f, "`{}` is not a member of `{}`", member, class)
            }
            TypeError::NoInstance { class, args, .. } => {
                write!(f, "no instance of `{} ", class)?;
                write_tys(f, args)?;
                write!(f, "`")
            }
            TypeError::AmbiguousInstance {
                class,
                args,
                candidates,
                ..
            } => {
                write!(f, "ambiguous instance for `{} ", class)?;
                write_tys(f, args)?;
                write!(f, "`: candidates [{}]", candidates.join(", "))
            }
            TypeError::DuplicateDefinition { what, name } => {
                write!(f, "{} `{}` is already defined", what, name)
            }
            TypeError::CyclicAlias { name, path } => {
                write!(f, "type alias `{}` is cyclic: {}", name, path.join(" -> "))
            }
            TypeError::ForeignTypeConflict { name, detail } => {
                write!(f, "foreign type `{}` registered inconsistently: {}", name, detail)
            }
            TypeError::InvalidUpcast {
                derived,
                base,
                reason,
            } => write!(f, "invalid upcast `{}` -> `{}`: {}", derived, base, reason),
            TypeError::DrainLimit { name, limit } => write!(
                f,
                "residual definition `{}` exceeded the draining limit of {}",
                name, limit
            ),
            TypeError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for TypeError {}
