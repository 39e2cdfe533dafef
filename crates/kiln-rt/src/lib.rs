//! Kiln runtime library.
//!
//! Support functions called from JIT-compiled code. Generated code reaches
//! them by absolute address, so nothing here is exported by symbol name.
//!
//! ## Modules
//!
//! - [`region`]: bump allocator owned by one compiler instance
//! - [`fault`]: thread-local fault flag raised by failing code
//! - [`matcher`]: match-table encoding and the row walker
//!
//! ## ABI Contract
//!
//! Every `extern "C"` function here takes and returns 64-bit words. Heap
//! values are pointers to 8-byte words laid out as described by the code
//! generator.

pub mod fault;
pub mod matcher;
pub mod region;

pub use fault::{
    clear_fault, kiln_rt_fault, kiln_rt_fault_pending, kiln_rt_unbound, raise, take_fault, FaultKind,
};
pub use matcher::{kiln_rt_match_rows, Check, CheckKind, MatchTable};
pub use region::{kiln_rt_alloc, GlobalRegion};
