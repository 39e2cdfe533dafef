//! The error every public `Compiler` operation returns.
//!
//! Lower layers keep their own error types (`TypeError`, `LowerError`,
//! `JitError`). They are folded into [`CompileError`] at the facade so a
//! host matches on one taxonomy.

use std::fmt;

use kiln_codegen::{BackendError, LowerError};
use kiln_common::{Span, Ty};
use kiln_jit::{ArtifactId, JitError};
use kiln_rt::FaultKind;
use kiln_typeck::diagnostics::render_diagnostic;
use kiln_typeck::{ConstraintOrigin, TypeError};

#[derive(Clone, Debug, PartialEq)]
pub enum CompileError {
    /// The reader rejected its input.
    Parse { message: String, span: Span },
    /// No reader is installed, or it does not implement `hook`.
    NoReaderConfigured { hook: &'static str },
    Type(TypeError),
    NoInstance {
        class: String,
        types: Vec<Ty>,
        span: Span,
    },
    AmbiguousInstance {
        class: String,
        types: Vec<Ty>,
        candidates: Vec<String>,
        span: Span,
    },
    DuplicateDefinition { what: &'static str, name: String },
    CyclicAlias { name: String, path: Vec<String> },
    /// A global was used before its value was supplied.
    UnboundValue { name: String },
    UnreachableClause { arm: usize },
    /// Compiled code found no match arm for its scrutinee.
    MatchFailure,
    /// A declared signature disagrees with the expression.
    TypeMismatch { declared: String, inferred: String },
    ArityMismatch { expected: usize, found: usize },
    LinkError(String),
    InternalError(String),
    ForeignTypeConflict { name: String, detail: String },
    InvalidUpcast {
        derived: String,
        base: String,
        reason: String,
    },
    ArtifactReleased(ArtifactId),
    /// Any other fault raised by compiled code.
    Runtime(FaultKind),
}

fn join_tys(tys: &[Ty]) -> String {
    tys.iter().map(Ty::to_string).collect::<Vec<_>>().join(" ")
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::Parse { message, .. } => write!(f, "parse error: {}", message),
            CompileError::NoReaderConfigured { hook } => {
                write!(f, "no reader is configured for `{}`", hook)
            }
            CompileError::Type(e) => write!(f, "{}", e),
            CompileError::NoInstance { class, types, .. } => {
                write!(f, "no instance for `{} {}`", class, join_tys(types))
            }
            CompileError::AmbiguousInstance {
                class,
                types,
                candidates,
                ..
            } => {
                write!(f, "ambiguous instance for `{} {}`", class, join_tys(types))?;
                if !candidates.is_empty() {
                    write!(f, ": candidates are {}", candidates.join(", "))?;
                }
                Ok(())
            }
            CompileError::DuplicateDefinition { what, name } => {
                write!(f, "{} `{}` is already defined", what, name)
            }
            CompileError::CyclicAlias { name, path } => {
                write!(f, "type alias `{}` is cyclic: {}", name, path.join(" -> "))
            }
            CompileError::UnboundValue { name } => {
                write!(f, "`{}` is used before it has a value", name)
            }
            CompileError::UnreachableClause { arm } => {
                write!(f, "match arm {} can never be reached", arm)
            }
            CompileError::MatchFailure => write!(f, "no match arm accepted the value"),
            CompileError::TypeMismatch { declared, inferred } => write!(
                f,
                "declared type `{}` does not match inferred type `{}`",
                declared, inferred
            ),
            CompileError::ArityMismatch { expected, found } => {
                write!(f, "expected {} argument(s), found {}", expected, found)
            }
            CompileError::LinkError(msg) => write!(f, "link error: {}", msg),
            CompileError::InternalError(msg) => write!(f, "internal error: {}", msg),
            CompileError::ForeignTypeConflict { name, detail } => {
                write!(f, "foreign type `{}` conflicts with its registration: {}", name, detail)
            }
            CompileError::InvalidUpcast {
                derived,
                base,
                reason,
            } => write!(f, "cannot upcast `{}` to `{}`: {}", derived, base, reason),
            CompileError::ArtifactReleased(id) => write!(f, "{} has already been released", id),
            CompileError::Runtime(kind) => write!(f, "runtime fault: {}", kind),
        }
    }
}

impl std::error::Error for CompileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CompileError::Type(e) => Some(e),
            _ => None,
        }
    }
}

impl CompileError {
    /// Render against the text the failing expression was read from. Type
    /// errors get a labelled report; everything else is one line.
    pub fn render(&self, source: &str) -> String {
        let as_type_error = match self {
            CompileError::Type(e) => Some(e.clone()),
            CompileError::NoInstance { class, types, span } => Some(TypeError::NoInstance {
                class: class.clone(),
                args: types.clone(),
                span: *span,
            }),
            CompileError::AmbiguousInstance {
                class,
                types,
                candidates,
                span,
            } => Some(TypeError::AmbiguousInstance {
                class: class.clone(),
                args: types.clone(),
                candidates: candidates.clone(),
                span: *span,
            }),
            CompileError::CyclicAlias { name, path } => Some(TypeError::CyclicAlias {
                name: name.clone(),
                path: path.clone(),
            }),
            _ => None,
        };
        match as_type_error {
            Some(e) => render_diagnostic(&e, source, "<input>"),
            None => format!("error: {}\n", self),
        }
    }
}

impl From<TypeError> for CompileError {
    fn from(e: TypeError) -> Self {
        match e {
            TypeError::NoInstance { class, args, span } => CompileError::NoInstance {
                class,
                types: args,
                span,
            },
            TypeError::AmbiguousInstance {
                class,
                args,
                candidates,
                span,
            } => CompileError::AmbiguousInstance {
                class,
                types: args,
                candidates,
                span,
            },
            TypeError::DuplicateDefinition { what, name } => {
                CompileError::DuplicateDefinition { what, name }
            }
            TypeError::CyclicAlias { name, path } => CompileError::CyclicAlias { name, path },
            TypeError::UnboundValue { name, .. } => CompileError::UnboundValue { name },
            TypeError::ForeignTypeConflict { name, detail } => {
                CompileError::ForeignTypeConflict { name, detail }
            }
            TypeError::InvalidUpcast {
                derived,
                base,
                reason,
            } => CompileError::InvalidUpcast {
                derived,
                base,
                reason,
            },
            TypeError::Mismatch {
                expected,
                found,
                origin: ConstraintOrigin::Signature,
            } => CompileError::TypeMismatch {
                declared: expected.to_string(),
                inferred: found.to_string(),
            },
            TypeError::DrainLimit { name, limit } => CompileError::InternalError(format!(
                "draining `{}` exceeded the limit of {}",
                name, limit
            )),
            TypeError::Internal(msg) => CompileError::InternalError(msg),
            other => CompileError::Type(other),
        }
    }
}

impl From<LowerError> for CompileError {
    fn from(e: LowerError) -> Self {
        match e {
            LowerError::UnboundValue { name } => CompileError::UnboundValue { name },
            LowerError::UnreachableClause { arm } => CompileError::UnreachableClause { arm },
            LowerError::UnknownGlobal { name } => {
                CompileError::InternalError(format!("`{}` has no runtime binding", name))
            }
            LowerError::Internal(msg) => CompileError::InternalError(msg),
        }
    }
}

impl From<BackendError> for CompileError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::UnknownUnit(_) => CompileError::InternalError(e.to_string()),
            other => CompileError::LinkError(other.to_string()),
        }
    }
}

impl From<JitError> for CompileError {
    fn from(e: JitError) -> Self {
        match e {
            JitError::Backend(b) => b.into(),
            JitError::ArtifactReleased(id) => CompileError::ArtifactReleased(id),
            JitError::UnknownArtifact(id) => {
                CompileError::InternalError(format!("{} does not exist", id))
            }
            JitError::Arity { expected, found } => CompileError::ArityMismatch { expected, found },
            JitError::Fault(FaultKind::MatchFailure) => CompileError::MatchFailure,
            JitError::Fault(FaultKind::UnboundValue) => CompileError::UnboundValue {
                name: "<declared function>".into(),
            },
            JitError::Fault(kind) => CompileError::Runtime(kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_mismatch_becomes_type_mismatch() {
        let e: CompileError = TypeError::Mismatch {
            expected: Ty::int(),
            found: Ty::float(),
            origin: ConstraintOrigin::Signature,
        }
        .into();
        assert_eq!(
            e,
            CompileError::TypeMismatch {
                declared: "Int".into(),
                inferred: "Float".into()
            }
        );
    }

    #[test]
    fn other_mismatches_stay_type_errors() {
        let e: CompileError = TypeError::Mismatch {
            expected: Ty::int(),
            found: Ty::float(),
            origin: ConstraintOrigin::Builtin,
        }
        .into();
        assert!(matches!(e, CompileError::Type(_)));
    }

    #[test]
    fn faults_map_to_their_variants() {
        let e: CompileError = JitError::Fault(FaultKind::MatchFailure).into();
        assert_eq!(e, CompileError::MatchFailure);
        let e: CompileError = JitError::Fault(FaultKind::DivideByZero).into();
        assert_eq!(e, CompileError::Runtime(FaultKind::DivideByZero));
    }

    #[test]
    fn render_uses_diagnostics_for_resolution_errors() {
        let e = CompileError::NoInstance {
            class: "Eq".into(),
            types: vec![Ty::float()],
            span: Span::new(0, 3),
        };
        let out = e.render("a == b");
        assert!(out.contains("E0011"), "{}", out);
        assert_eq!(
            CompileError::MatchFailure.render(""),
            "error: no match arm accepted the value\n"
        );
    }
}
