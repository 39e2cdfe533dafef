use std::ops::Range;

use serde::Serialize;

/// Byte-offset span into source text. Start is inclusive, end is exclusive.
///
/// Expressions built by a host rather than read from text carry
/// [`Span::synthetic`], which renders as the start of the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct Span {
    pub start: u32,
    pub end: u32,
}

impl Span {
    pub fn new(start: u32, end: u32) -> Self {
        debug_assert!(start <= end, "span start ({start}) must be <= end ({end})");
        Self { start, end }
    }

    /// The span given to compiler-synthesized nodes.
    pub fn synthetic() -> Self {
        Self { start: 0, end: 0 }
    }

    pub fn len(&self) -> u32 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Merge two spans into one that covers both.
    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    /// The span as a `usize` range, the form ariadne labels expect.
    pub fn range(&self) -> Range<usize> {
        self.start as usize..self.end as usize
    }
}
