//! Lowering and native code generation for Kiln.
//!
//! Unsweetened, fully typed expressions are lowered to a small MIR
//! ([`mir`]), with match expressions compiled by one of four strategies
//! ([`pattern`]). Small definitions can be inlined across units
//! ([`inline`]). A [`codegen::Backend`] then turns each unit into machine
//! code.

pub mod codegen;
pub mod error;
pub mod inline;
pub mod layout;
pub mod lower;
pub mod mir;
pub mod ops;
pub mod pattern;

pub use codegen::{make_backend, Backend, BackendKind, CompiledFunction, CompiledUnit, CraneliftBackend, UnitHandle};
pub use error::{BackendError, LowerError};
pub use inline::{inline_unit, InlineLibrary};
pub use layout::Layouts;
pub use lower::{lower_function, GlobalRef, GlobalResolver};
pub use mir::{MirFunction, MirUnit, Repr, Sig};
pub use ops::{builtin_ops, LowLevelOp};
pub use pattern::{MatchOptions, MatchStrategy, UnreachableRow, UnreachableRows};
