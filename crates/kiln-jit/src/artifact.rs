use std::fmt;

use kiln_codegen::{CompiledUnit, Sig};

/// Handle to one compiled unit.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArtifactId(pub u32);

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "artifact#{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ArtifactState {
    Live,
    Released,
}

impl fmt::Display for ArtifactState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactState::Live => write!(f, "live"),
            ArtifactState::Released => write!(f, "released"),
        }
    }
}

#[derive(Debug)]
pub struct Artifact {
    pub id: ArtifactId,
    pub name: String,
    /// Signature of the entry function.
    pub sig: Sig,
    pub compiled: CompiledUnit,
    pub state: ArtifactState,
}

impl Artifact {
    pub fn is_live(&self) -> bool {
        self.state == ArtifactState::Live
    }

    pub fn code_size(&self) -> usize {
        self.compiled.code_size()
    }
}
