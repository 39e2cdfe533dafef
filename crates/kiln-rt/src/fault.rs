//! Thread-local fault flag.
//!
//! Compiled code never unwinds the native stack. A failing operation
//! records a fault on the current thread and returns a zero value. Callers
//! in compiled code test the flag after every call that can fault and
//! return at once, so the fault reaches the host's entry trampoline. The
//! first fault of a call wins.

use std::cell::Cell;
use std::fmt;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum FaultKind {
    /// No match arm accepted the scrutinee.
    MatchFailure = 1,
    /// A forward-declared global was called before it was defined.
    UnboundValue = 2,
    IndexOutOfBounds = 3,
    DivideByZero = 4,
}

impl FaultKind {
    pub fn code(self) -> u64 {
        self as u64
    }

    pub fn from_code(code: u64) -> Option<FaultKind> {
        match code {
            1 => Some(FaultKind::MatchFailure),
            2 => Some(FaultKind::UnboundValue),
            3 => Some(FaultKind::IndexOutOfBounds),
            4 => Some(FaultKind::DivideByZero),
            _ => None,
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FaultKind::MatchFailure => "no match arm accepted the value",
            FaultKind::UnboundValue => "called a declared function that has no definition",
            FaultKind::IndexOutOfBounds => "array index out of bounds",
            FaultKind::DivideByZero => "integer division by zero",
        };
        f.write_str(text)
    }
}

thread_local! {
    static FAULT: Cell<u64> = const { Cell::new(0) };
}

/// Record `kind` unless a fault is already pending.
pub fn raise(kind: FaultKind) {
    FAULT.with(|f| {
        if f.get() == 0 {
            f.set(kind.code());
        }
    });
}

/// Remove and return the pending fault.
pub fn take_fault() -> Option<FaultKind> {
    FAULT.with(|f| FaultKind::from_code(f.replace(0)))
}

pub fn clear_fault() {
    FAULT.with(|f| f.set(0));
}

/// Raise the fault with the given code. Unknown codes are ignored.
#[no_mangle]
pub extern "C" fn kiln_rt_fault(code: u64) {
    if let Some(kind) = FaultKind::from_code(code) {
        raise(kind);
    }
}

/// Nonzero while a fault is pending. Does not clear it.
#[no_mangle]
pub extern "C" fn kiln_rt_fault_pending() -> u64 {
    FAULT.with(|f| f.get())
}

/// Target of every function slot whose definition has not been compiled.
///
/// Callers pass arguments according to the declared signature; the stub
/// ignores them under the C calling convention.
#[no_mangle]
pub extern "C" fn kiln_rt_unbound() -> i64 {
    raise(FaultKind::UnboundValue);
    0
}
