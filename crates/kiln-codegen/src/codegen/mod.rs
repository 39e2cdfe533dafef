//! Native backends.
//!
//! A backend turns one [`MirUnit`] into machine code that stays mapped until
//! the unit is released. Cranelift is always available; LLVM is behind the
//! `llvm` feature.

pub mod cranelift;
#[cfg(feature = "llvm")]
pub mod llvm;

use std::fmt;

use crate::error::BackendError;
use crate::mir::MirUnit;

pub use self::cranelift::CraneliftBackend;
#[cfg(feature = "llvm")]
pub use self::llvm::LlvmBackend;

/// Identifies a compiled unit inside the backend that produced it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct UnitHandle(pub u64);

impl fmt::Display for UnitHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit#{}", self.0)
    }
}

/// One function of a compiled unit.
#[derive(Clone, Debug)]
pub struct CompiledFunction {
    pub name: String,
    pub addr: usize,
    /// Machine code, when the backend exposes it.
    pub code: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct CompiledUnit {
    pub handle: UnitHandle,
    /// Address of the entry function, callable with the host C ABI.
    pub entry: usize,
    /// Address of `invoke(args: *const u64) -> u64`.
    pub invoke: usize,
    pub functions: Vec<CompiledFunction>,
}

impl CompiledUnit {
    /// Bytes of machine code across every function.
    pub fn code_size(&self) -> usize {
        self.functions.iter().map(|f| f.code.len()).sum()
    }
}

pub trait Backend {
    fn name(&self) -> &'static str;

    /// Compile and link `unit`. The returned addresses stay valid until
    /// [`Backend::release`] is called with the handle.
    fn compile(&mut self, unit: &MirUnit) -> Result<CompiledUnit, BackendError>;

    /// Unmap a unit's code.
    fn release(&mut self, handle: UnitHandle) -> Result<(), BackendError>;

    /// Units compiled and not yet released.
    fn live_units(&self) -> usize;
}

/// Which native backend to use.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Cranelift,
    Llvm,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Cranelift => write!(f, "cranelift"),
            BackendKind::Llvm => write!(f, "llvm"),
        }
    }
}

/// Construct the backend named by `kind`.
pub fn make_backend(kind: BackendKind) -> Result<Box<dyn Backend>, BackendError> {
    match kind {
        BackendKind::Cranelift => Ok(Box::new(CraneliftBackend::new()?)),
        #[cfg(feature = "llvm")]
        BackendKind::Llvm => Ok(Box::new(LlvmBackend::new()?)),
        #[cfg(not(feature = "llvm"))]
        BackendKind::Llvm => Err(BackendError::Isa(
            "this build does not include the LLVM backend".to_string(),
        )),
    }
}
