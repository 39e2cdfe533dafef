use std::fmt;

use kiln_codegen::BackendError;
use kiln_rt::FaultKind;

use crate::ArtifactId;

#[derive(Clone, Debug, PartialEq)]
pub enum JitError {
    Backend(BackendError),
    /// The artifact's code has already been released.
    ArtifactReleased(ArtifactId),
    UnknownArtifact(ArtifactId),
    /// Generated code raised a fault during an invoke.
    Fault(FaultKind),
    /// The argument count does not match the artifact's entry.
    Arity { expected: usize, found: usize },
}

impl fmt::Display for JitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JitError::Backend(e) => write!(f, "{}", e),
            JitError::ArtifactReleased(id) => write!(f, "{} has already been released", id),
            JitError::UnknownArtifact(id) => write!(f, "{} does not exist", id),
            JitError::Fault(kind) => write!(f, "runtime fault: {}", kind),
            JitError::Arity { expected, found } => {
                write!(f, "expected {} argument(s), found {}", expected, found)
            }
        }
    }
}

impl std::error::Error for JitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            JitError::Backend(e) => Some(e),
            _ => None,
        }
    }
}

impl From<BackendError> for JitError {
    fn from(e: BackendError) -> Self {
        JitError::Backend(e)
    }
}
