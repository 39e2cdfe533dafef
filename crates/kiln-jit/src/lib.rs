//! Machine-code ownership for Kiln.
//!
//! A [`JitEngine`] compiles MIR units through a [`kiln_codegen::Backend`],
//! keeps each result as an [`Artifact`] until it is released, and can roll
//! back everything compiled after a [`JitMark`].

mod artifact;
mod engine;
mod error;

pub use artifact::{Artifact, ArtifactId, ArtifactState};
pub use engine::{JitEngine, JitMark};
pub use error::JitError;
pub use kiln_codegen::BackendKind;
