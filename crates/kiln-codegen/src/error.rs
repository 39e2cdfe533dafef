//! Errors raised while lowering to MIR or compiling MIR to native code.

use std::fmt;

/// Failure inside a native backend.
#[derive(Clone, Debug, PartialEq)]
pub enum BackendError {
    /// The target ISA could not be configured for the host.
    Isa(String),
    /// The backend rejected a function.
    Compile { function: String, message: String },
    /// Finalisation or symbol resolution failed.
    Link(String),
    /// The handle does not name a live unit.
    UnknownUnit(u64),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Isa(msg) => write!(f, "cannot configure target: {}", msg),
            BackendError::Compile { function, message } => {
                write!(f, "backend rejected `{}`: {}", function, message)
            }
            BackendError::Link(msg) => write!(f, "link failed: {}", msg),
            BackendError::UnknownUnit(id) => write!(f, "no compiled unit #{}", id),
        }
    }
}

impl std::error::Error for BackendError {}

/// Failure while lowering an unsweetened expression to MIR.
#[derive(Clone, Debug, PartialEq)]
pub enum LowerError {
    /// A non-function global was read before its value existed.
    UnboundValue { name: String },
    /// A name that is neither local nor known to the resolver.
    UnknownGlobal { name: String },
    /// A match arm no value can reach, with reachability required.
    UnreachableClause { arm: usize },
    /// An expression without a ground type, or a shape lowering cannot handle.
    Internal(String),
}

impl fmt::Display for LowerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LowerError::UnboundValue { name } => {
                write!(f, "`{}` is read before it has a value", name)
            }
            LowerError::UnknownGlobal { name } => write!(f, "unknown global `{}`", name),
            LowerError::UnreachableClause { arm } => {
                write!(f, "match arm {} can never be reached", arm)
            }
            LowerError::Internal(msg) => write!(f, "internal lowering error: {}", msg),
        }
    }
}

impl std::error::Error for LowerError {}
