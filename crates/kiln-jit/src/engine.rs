//! The JIT engine: compiles MIR units, hands out their entry points and
//! keeps every unit compiled so far for inspection.

use std::fmt::Write as _;

use kiln_codegen::mir::{propagate_unit_faults, FnBuilder};
use kiln_codegen::{inline_unit, make_backend, Backend, BackendKind, InlineLibrary, MirFunction, MirUnit, Repr, Sig};
use kiln_rt::{clear_fault, take_fault};

use crate::{Artifact, ArtifactId, ArtifactState, JitError};

/// Undo point for [`JitEngine::rollback_to`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct JitMark {
    artifacts: usize,
    module: usize,
    inline_log: usize,
}

pub struct JitEngine {
    backend: Box<dyn Backend>,
    artifacts: Vec<Artifact>,
    /// Every unit compiled, after inlining, in order.
    module: Vec<MirUnit>,
    inline: InlineLibrary,
    /// Previous library entry for each insertion, for rollback.
    inline_log: Vec<(u64, Option<MirFunction>)>,
    inlining: bool,
}

impl JitEngine {
    pub fn new(kind: BackendKind) -> Result<Self, JitError> {
        Ok(Self::with_backend(make_backend(kind)?))
    }

    pub fn with_backend(backend: Box<dyn Backend>) -> Self {
        tracing::debug!(backend = backend.name(), "jit engine ready");
        JitEngine {
            backend,
            artifacts: Vec::new(),
            module: Vec::new(),
            inline: InlineLibrary::new(),
            inline_log: Vec::new(),
            inlining: false,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn inlining(&self) -> bool {
        self.inlining
    }

    pub fn set_inlining(&mut self, enabled: bool) {
        self.inlining = enabled;
    }

    /// Offer `f`, the body behind function slot `slot`, for inlining into
    /// later units. Bodies that are too large or not self-contained are
    /// ignored; any previous body for the slot is forgotten.
    pub fn offer_inline(&mut self, slot: u64, f: &MirFunction) -> bool {
        let previous = self.inline.get(slot).cloned();
        self.inline_log.push((slot, previous));
        self.inline.insert(slot, f.clone())
    }

    /// Compile `unit` and record it as a live artifact. Calls that can
    /// fail are guarded first, so a fault anywhere in the unit surfaces
    /// from [`JitEngine::invoke_raw`].
    pub fn compile(&mut self, mut unit: MirUnit) -> Result<ArtifactId, JitError> {
        if self.inlining {
            inline_unit(&mut unit, &self.inline);
        }
        propagate_unit_faults(&mut unit);
        let sig = unit
            .entry_function()
            .map(MirFunction::sig)
            .unwrap_or(Sig {
                params: Vec::new(),
                ret: Repr::Word,
            });
        let compiled = self.backend.compile(&unit)?;
        let id = ArtifactId(self.artifacts.len() as u32);
        tracing::debug!(%id, unit = %unit.name, bytes = compiled.code_size(), "compiled artifact");
        self.artifacts.push(Artifact {
            id,
            name: unit.name.clone(),
            sig,
            compiled,
            state: ArtifactState::Live,
        });
        self.module.push(unit);
        Ok(id)
    }

    pub fn artifact(&self, id: ArtifactId) -> Result<&Artifact, JitError> {
        self.artifacts
            .get(id.0 as usize)
            .ok_or(JitError::UnknownArtifact(id))
    }

    fn live(&self, id: ArtifactId) -> Result<&Artifact, JitError> {
        let artifact = self.artifact(id)?;
        match artifact.state {
            ArtifactState::Live => Ok(artifact),
            ArtifactState::Released => Err(JitError::ArtifactReleased(id)),
        }
    }

    /// Address of the artifact's C-ABI entry function.
    pub fn entry(&self, id: ArtifactId) -> Result<usize, JitError> {
        Ok(self.live(id)?.compiled.entry)
    }

    /// Call the artifact through its uniform trampoline. Arguments and
    /// result are raw words; floats travel as their bits.
    ///
    /// # Safety
    ///
    /// Every word must be a valid value of the corresponding parameter
    /// type: pointers must point into live Kiln heap values.
    pub unsafe fn invoke_raw(&self, id: ArtifactId, args: &[u64]) -> Result<u64, JitError> {
        let artifact = self.live(id)?;
        if args.len() != artifact.sig.params.len() {
            return Err(JitError::Arity {
                expected: artifact.sig.params.len(),
                found: args.len(),
            });
        }
        let invoke: extern "C" fn(*const u64) -> u64 = std::mem::transmute(artifact.compiled.invoke);
        clear_fault();
        let result = invoke(args.as_ptr());
        match take_fault() {
            Some(kind) => Err(JitError::Fault(kind)),
            None => Ok(result),
        }
    }

    /// Unmap the artifact's code. Releasing twice is an error.
    pub fn release(&mut self, id: ArtifactId) -> Result<(), JitError> {
        let handle = self.live(id)?.compiled.handle;
        self.backend.release(handle)?;
        if let Some(artifact) = self.artifacts.get_mut(id.0 as usize) {
            artifact.state = ArtifactState::Released;
        }
        tracing::debug!(%id, "released artifact");
        Ok(())
    }

    pub fn machine_code(&self, id: ArtifactId) -> Result<Vec<u8>, JitError> {
        let artifact = self.live(id)?;
        Ok(artifact
            .compiled
            .functions
            .iter()
            .flat_map(|f| f.code.iter().copied())
            .collect())
    }

    pub fn mark(&self) -> JitMark {
        JitMark {
            artifacts: self.artifacts.len(),
            module: self.module.len(),
            inline_log: self.inline_log.len(),
        }
    }

    /// Release and forget everything compiled since `mark`.
    pub fn rollback_to(&mut self, mark: JitMark) {
        for artifact in self.artifacts.drain(mark.artifacts..) {
            if artifact.state == ArtifactState::Live {
                if let Err(e) = self.backend.release(artifact.compiled.handle) {
                    tracing::warn!(id = %artifact.id, error = %e, "release during rollback failed");
                }
            }
        }
        self.module.truncate(mark.module);
        while self.inline_log.len() > mark.inline_log {
            let Some((slot, previous)) = self.inline_log.pop() else {
                break;
            };
            match previous {
                Some(f) => {
                    self.inline.insert(slot, f);
                }
                None => self.inline.remove(slot),
            }
        }
    }

    /// Every unit compiled so far.
    pub fn module(&self) -> &[MirUnit] {
        &self.module
    }

    /// A fresh emission cursor for hand-built functions.
    pub fn builder(&self, name: &str, params: &[Repr], ret: Repr) -> FnBuilder {
        FnBuilder::new(name, params, ret)
    }

    pub fn live_artifacts(&self) -> usize {
        self.artifacts
            .iter()
            .filter(|a| a.state == ArtifactState::Live)
            .count()
    }

    /// The accumulated module as text.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (unit, artifact) in self.module.iter().zip(&self.artifacts) {
            let _ = writeln!(out, "; {} ({})", artifact.id, artifact.state);
            out.push_str(&unit.to_string());
        }
        out
    }
}
