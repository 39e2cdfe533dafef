//! Interpreted pattern matching.
//!
//! A match is serialised into a flat word table that
//! [`kiln_rt_match_rows`] walks at run time. The table is
//!
//! ```text
//! table = [row_count, row_offset_0 .. row_offset_n-1, row..]
//! row   = [check_count, check..]
//! check = [kind, column, path_len, path.., operand]
//! ```
//!
//! A check starts from the scrutinee word in `column` and follows `path`,
//! loading word `i` of the current heap value at each step, before
//! comparing. Row offsets are word indices from the start of the table.
//! Checks within a row are ordered so that a tag test always precedes a
//! load through the payload it guards.

use std::fmt;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum CheckKind {
    /// Word 0 of the heap value equals the operand.
    TagEq = 0,
    /// The word itself equals the operand.
    IntEq = 1,
    /// The word, read as `f64` bits, equals the operand as `f64`.
    FloatEq = 2,
    /// Word 0 of the array equals the operand.
    LenEq = 3,
}

impl CheckKind {
    fn from_word(w: u64) -> Option<CheckKind> {
        match w {
            0 => Some(CheckKind::TagEq),
            1 => Some(CheckKind::IntEq),
            2 => Some(CheckKind::FloatEq),
            3 => Some(CheckKind::LenEq),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Check {
    pub kind: CheckKind,
    pub column: u32,
    pub path: Vec<u32>,
    pub operand: u64,
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}", self.column)?;
        for step in &self.path {
            write!(f, ".{}", step)?;
        }
        let op = match self.kind {
            CheckKind::TagEq => "tag",
            CheckKind::IntEq => "==",
            CheckKind::FloatEq => "==f",
            CheckKind::LenEq => "len",
        };
        if self.kind == CheckKind::FloatEq {
            write!(f, " {} {:?}", op, f64::from_bits(self.operand))
        } else {
            write!(f, " {} {}", op, self.operand as i64)
        }
    }
}

/// Rows of checks, in arm order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MatchTable {
    rows: Vec<Vec<Check>>,
}

impl MatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a row and return its index.
    pub fn push_row(&mut self, checks: Vec<Check>) -> usize {
        self.rows.push(checks);
        self.rows.len() - 1
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn rows(&self) -> &[Vec<Check>] {
        &self.rows
    }

    /// The flat word form read by [`kiln_rt_match_rows`].
    pub fn encode(&self) -> Vec<u64> {
        let mut words = vec![self.rows.len() as u64];
        words.resize(1 + self.rows.len(), 0);
        for (i, row) in self.rows.iter().enumerate() {
            words[1 + i] = words.len() as u64;
            words.push(row.len() as u64);
            for check in row {
                words.push(check.kind as u64);
                words.push(check.column as u64);
                words.push(check.path.len() as u64);
                words.extend(check.path.iter().map(|&s| s as u64));
                words.push(check.operand);
            }
        }
        words
    }
}

impl fmt::Display for MatchTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, row) in self.rows.iter().enumerate() {
            write!(f, "row {}:", i)?;
            if row.is_empty() {
                write!(f, " always")?;
            }
            for (j, check) in row.iter().enumerate() {
                write!(f, "{}{}", if j == 0 { " " } else { ", " }, check)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

unsafe fn row_matches(table: *const u64, offset: usize, columns: *const u64) -> bool {
    let count = *table.add(offset) as usize;
    let mut at = offset + 1;
    for _ in 0..count {
        let Some(kind) = CheckKind::from_word(*table.add(at)) else {
            return false;
        };
        let mut value = *columns.add(*table.add(at + 1) as usize);
        let path_len = *table.add(at + 2) as usize;
        at += 3;
        for _ in 0..path_len {
            value = *(value as *const u64).add(*table.add(at) as usize);
            at += 1;
        }
        let operand = *table.add(at);
        at += 1;
        let ok = match kind {
            CheckKind::TagEq | CheckKind::LenEq => *(value as *const u64) == operand,
            CheckKind::IntEq => value == operand,
            CheckKind::FloatEq => f64::from_bits(value) == f64::from_bits(operand),
        };
        if !ok {
            return false;
        }
    }
    true
}

/// Index of the first row at or after `start` whose checks all pass, or -1.
///
/// # Safety
///
/// `table` must be an encoded [`MatchTable`] and `columns` must hold one
/// word per scrutinee, each a value of the type the table was built for.
#[no_mangle]
pub unsafe extern "C" fn kiln_rt_match_rows(table: *const u64, columns: *const u64, start: u64) -> i64 {
    if table.is_null() {
        return -1;
    }
    let rows = *table as usize;
    for row in start as usize..rows {
        let offset = *table.add(1 + row) as usize;
        if row_matches(table, offset, columns) {
            return row as i64;
        }
    }
    -1
}
