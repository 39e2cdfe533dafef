//! Match compilation.
//!
//! Unsweetened match arms are flattened into rows of [`Pat`]s, one pattern
//! per scrutinee column. Reachability is decided on the rows before any code
//! is emitted, then one of four strategies emits the dispatch:
//!
//! - [`MatchStrategy::Compiled`]: each arm tests its own patterns in order
//! - [`MatchStrategy::ColumnWise`]: a Maranget decision tree
//! - [`MatchStrategy::Table`]: a jump table over one primitive column
//! - [`MatchStrategy::Interpreted`]: a row table walked by the runtime
//!
//! Every strategy selects the same arm with the same bindings. A value no
//! arm accepts reaches a `Fail` terminator raising `MatchFailure`.

pub mod compile;
pub mod interp;
pub mod reach;

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use kiln_common::{Lit, MatchArm, Pattern, Span, Ty};

use crate::error::LowerError;
use crate::layout::{Layouts, ELEMS_OFFSET, PAYLOAD_OFFSET};
use crate::mir::{BinOp, BlockId, FnBuilder, Repr, VarId};

// ── Patterns ────────────────────────────────────────────────────────

/// A constructor a pattern can test for.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Head {
    /// Tuples and records: one constructor, never tested.
    Tuple(usize),
    Unit,
    /// A variant constructor `tag` out of `of`.
    Tag { tag: usize, of: usize },
    Bool(bool),
    Int(i64),
    Char(u32),
    /// Compared as `f64`; stored as bits, with `-0.0` stored as `0.0`.
    Float(u64),
    /// An array of exactly this length.
    Len(usize),
}

impl Head {
    pub fn arity(&self) -> usize {
        match self {
            Head::Tuple(n) | Head::Len(n) => *n,
            Head::Tag { .. } => 1,
            _ => 0,
        }
    }

    /// Whether matching this head needs a run-time test.
    pub fn is_tested(&self) -> bool {
        !matches!(self, Head::Tuple(_) | Head::Unit)
    }

    /// Word offset of child `i` inside the value.
    pub fn child_offset(&self, i: usize) -> i32 {
        match self {
            Head::Tag { .. } => PAYLOAD_OFFSET,
            Head::Len(_) => ELEMS_OFFSET + i as i32,
            _ => i as i32,
        }
    }

    /// The switch key of a head usable in a jump table.
    pub fn table_key(&self) -> Option<i64> {
        match self {
            Head::Tag { tag, .. } => Some(*tag as i64),
            Head::Bool(b) => Some(*b as i64),
            Head::Int(n) => Some(*n),
            Head::Char(c) => Some(*c as i64),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum PatKind {
    Wild,
    Con(Head, Vec<Pat>),
}

/// A type-directed pattern: records are tuples in field order and string
/// literals are arrays of characters.
#[derive(Clone, Debug, PartialEq)]
pub struct Pat {
    pub kind: PatKind,
    /// Names bound to the value at this position.
    pub binds: Vec<String>,
    pub repr: Repr,
}

pub static WILD: Pat = Pat {
    kind: PatKind::Wild,
    binds: Vec::new(),
    repr: Repr::Word,
};

impl Pat {
    fn con(head: Head, children: Vec<Pat>, repr: Repr) -> Pat {
        Pat {
            kind: PatKind::Con(head, children),
            binds: Vec::new(),
            repr,
        }
    }

    pub fn head(&self) -> Option<&Head> {
        match &self.kind {
            PatKind::Con(h, _) => Some(h),
            PatKind::Wild => None,
        }
    }

    pub fn is_wild(&self) -> bool {
        matches!(self.kind, PatKind::Wild)
    }

    /// Whether no value can match: a NaN literal compares unequal to
    /// everything.
    pub fn matches_nothing(&self) -> bool {
        match &self.kind {
            PatKind::Wild => false,
            PatKind::Con(Head::Float(bits), _) => f64::from_bits(*bits).is_nan(),
            PatKind::Con(_, children) => children.iter().any(Pat::matches_nothing),
        }
    }

    /// Build from a source pattern matched against a value of type `ty`.
    pub fn from_pattern(layouts: &Layouts<'_>, pattern: &Pattern, ty: &Ty) -> Result<Pat, LowerError> {
        let repr = layouts.repr(ty);
        let shape_error = || {
            LowerError::Internal(format!("pattern `{}` does not fit type `{}`", pattern, ty))
        };
        Ok(match pattern {
            Pattern::Wildcard => Pat {
                kind: PatKind::Wild,
                binds: Vec::new(),
                repr,
            },
            Pattern::Bind(name) => Pat {
                kind: PatKind::Wild,
                binds: vec![name.clone()],
                repr,
            },
            Pattern::As(name, inner) => {
                let mut p = Pat::from_pattern(layouts, inner, ty)?;
                p.binds.insert(0, name.clone());
                p
            }
            Pattern::Lit(lit) => match lit {
                Lit::Unit => Pat::con(Head::Unit, Vec::new(), repr),
                Lit::Bool(b) => Pat::con(Head::Bool(*b), Vec::new(), repr),
                Lit::Int(n) => Pat::con(Head::Int(*n), Vec::new(), repr),
                Lit::Char(c) => Pat::con(Head::Char(*c as u32), Vec::new(), repr),
                Lit::Float(x) => {
                    let x = if *x == 0.0 { 0.0 } else { *x };
                    Pat::con(Head::Float(x.to_bits()), Vec::new(), repr)
                }
                Lit::Str(s) => {
                    let chars = s
                        .chars()
                        .map(|c| Pat::con(Head::Char(c as u32), Vec::new(), Repr::Word))
                        .collect::<Vec<_>>();
                    Pat::con(Head::Len(chars.len()), chars, repr)
                }
            },
            Pattern::Tuple(ps) => {
                let fields = layouts.fields(ty).ok_or_else(shape_error)?;
                if fields.len() != ps.len() {
                    return Err(shape_error());
                }
                let children = ps
                    .iter()
                    .zip(&fields)
                    .map(|(p, (_, t))| Pat::from_pattern(layouts, p, t))
                    .collect::<Result<Vec<_>, _>>()?;
                Pat::con(Head::Tuple(children.len()), children, repr)
            }
            Pattern::Record(fps) => {
                let fields = layouts.fields(ty).ok_or_else(shape_error)?;
                if let Some((name, _)) = fps
                    .iter()
                    .find(|(n, _)| !fields.iter().any(|(f, _)| f.as_deref() == Some(n.as_str())))
                {
                    return Err(LowerError::Internal(format!("no field `{}` in `{}`", name, ty)));
                }
                let mut children = Vec::with_capacity(fields.len());
                for (fname, fty) in &fields {
                    let sub = fps.iter().find(|(n, _)| Some(n.as_str()) == fname.as_deref());
                    children.push(match sub {
                        Some((_, p)) => Pat::from_pattern(layouts, p, fty)?,
                        None => Pat::from_pattern(layouts, &Pattern::Wildcard, fty)?,
                    });
                }
                Pat::con(Head::Tuple(children.len()), children, repr)
            }
            Pattern::Ctor(name, payload) => {
                let (tag, payload_ty, of) = layouts.ctor(ty, name).ok_or_else(shape_error)?;
                let child = match payload {
                    Some(p) => Pat::from_pattern(layouts, p, &payload_ty)?,
                    None => Pat::from_pattern(layouts, &Pattern::Wildcard, &payload_ty)?,
                };
                Pat::con(Head::Tag { tag, of }, vec![child], repr)
            }
            Pattern::Array(ps) => {
                let elem = layouts.array_elem(ty).ok_or_else(shape_error)?;
                let children = ps
                    .iter()
                    .map(|p| Pat::from_pattern(layouts, p, &elem))
                    .collect::<Result<Vec<_>, _>>()?;
                Pat::con(Head::Len(children.len()), children, repr)
            }
        })
    }

    /// Bindings under this pattern with the path to each.
    fn collect_binds(&self, path: &AccessPath, out: &mut Vec<(String, AccessPath, Repr)>) {
        for name in &self.binds {
            out.push((name.clone(), path.clone(), self.repr));
        }
        if let PatKind::Con(head, children) = &self.kind {
            for (i, child) in children.iter().enumerate() {
                child.collect_binds(&path.child(head.child_offset(i)), out);
            }
        }
    }
}

// ── Access paths ────────────────────────────────────────────────────

/// How to reach a sub-value: start at a scrutinee column and load word
/// `steps[i]` of the current heap value at each step.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AccessPath {
    pub column: usize,
    pub steps: Vec<i32>,
}

impl AccessPath {
    pub fn root(column: usize) -> Self {
        AccessPath {
            column,
            steps: Vec::new(),
        }
    }

    pub fn child(&self, offset: i32) -> Self {
        let mut steps = self.steps.clone();
        steps.push(offset);
        AccessPath {
            column: self.column,
            steps,
        }
    }
}

impl fmt::Display for AccessPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}", self.column)?;
        for s in &self.steps {
            write!(f, ".{}", s)?;
        }
        Ok(())
    }
}

// ── Rows ────────────────────────────────────────────────────────────

/// One arm as a row of column patterns.
#[derive(Clone, Debug, PartialEq)]
pub struct MatchRow {
    /// Index of the arm in the source match.
    pub arm: usize,
    pub pats: Vec<Pat>,
    pub guarded: bool,
}

impl MatchRow {
    pub fn bindings(&self) -> Vec<(String, AccessPath, Repr)> {
        let mut out = Vec::new();
        for (column, pat) in self.pats.iter().enumerate() {
            pat.collect_binds(&AccessPath::root(column), &mut out);
        }
        out
    }
}

/// Flatten `arms` into rows over scrutinees of the given types.
pub fn build_rows(layouts: &Layouts<'_>, arms: &[MatchArm], columns: &[Ty]) -> Result<Vec<MatchRow>, LowerError> {
    arms.iter()
        .enumerate()
        .map(|(i, arm)| {
            if arm.patterns.len() != columns.len() {
                return Err(LowerError::Internal(format!(
                    "arm {} has {} pattern(s) for {} scrutinee(s)",
                    i,
                    arm.patterns.len(),
                    columns.len()
                )));
            }
            let pats = arm
                .patterns
                .iter()
                .zip(columns)
                .map(|(p, t)| Pat::from_pattern(layouts, p, t))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(MatchRow {
                arm: i,
                pats,
                guarded: arm.guard.is_some(),
            })
        })
        .collect()
}

// ── Unreachable rows ────────────────────────────────────────────────

/// An arm dropped because no value can reach it.
#[derive(Clone, Debug, PartialEq)]
pub struct UnreachableRow {
    pub arm: usize,
    /// The arm's patterns, rendered.
    pub pattern: String,
    pub span: Span,
}

pub type UnreachableRows = Arc<Mutex<Vec<UnreachableRow>>>;

// ── Strategy selection ──────────────────────────────────────────────

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MatchStrategy {
    Compiled,
    ColumnWise,
    Table,
    Interpreted,
}

impl fmt::Display for MatchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MatchStrategy::Compiled => "compiled",
            MatchStrategy::ColumnWise => "column-wise",
            MatchStrategy::Table => "table",
            MatchStrategy::Interpreted => "interpreted",
        };
        f.write_str(name)
    }
}

/// Match lowering switches, taken from the compiler configuration.
#[derive(Clone, Debug, Default)]
pub struct MatchOptions {
    pub interpreted: bool,
    pub column_wise: bool,
    pub force_tables: bool,
    pub require_reachability: bool,
    pub unreachable_sink: Option<UnreachableRows>,
}

/// Minimum distinct keys before a table is chosen without being forced.
pub const TABLE_MIN_KEYS: usize = 4;
/// Minimum `keys / (max - min + 1)` before a table is chosen.
pub const TABLE_MIN_DENSITY: f64 = 0.5;

/// Keys of a single-column match whose rows test at most the top-level
/// head. `None` when the rows need nested tests or there is no key.
pub fn table_keys(rows: &[MatchRow]) -> Option<Vec<i64>> {
    let mut keys = Vec::new();
    for row in rows {
        let [pat] = row.pats.as_slice() else {
            return None;
        };
        match &pat.kind {
            PatKind::Wild => {}
            PatKind::Con(head, children) => {
                let key = head.table_key()?;
                if !children.iter().all(Pat::is_wild) {
                    return None;
                }
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }
    }
    if keys.is_empty() {
        None
    } else {
        Some(keys)
    }
}

pub fn choose_strategy(options: &MatchOptions, rows: &[MatchRow]) -> MatchStrategy {
    if options.interpreted {
        return MatchStrategy::Interpreted;
    }
    if options.column_wise {
        return MatchStrategy::ColumnWise;
    }
    if let Some(keys) = table_keys(rows) {
        let primitive = rows.iter().any(|r| {
            matches!(
                r.pats[0].head(),
                Some(Head::Int(_) | Head::Char(_) | Head::Bool(_))
            )
        });
        if options.force_tables && primitive {
            return MatchStrategy::Table;
        }
        if keys.len() >= TABLE_MIN_KEYS {
            let min = keys.iter().copied().min().unwrap_or(0);
            let max = keys.iter().copied().max().unwrap_or(0);
            let span = (max as i128 - min as i128 + 1) as f64;
            if keys.len() as f64 / span >= TABLE_MIN_DENSITY {
                return MatchStrategy::Table;
            }
        }
    }
    MatchStrategy::Compiled
}

// ── Emission ────────────────────────────────────────────────────────

/// What a strategy needs from the function it emits into.
pub trait MatchHost {
    fn builder(&mut self) -> &mut FnBuilder;

    /// Lower the guard of `arm` with its bindings in scope.
    fn lower_guard(&mut self, arm: usize) -> Result<VarId, LowerError>;

    /// Allocate `words` zeroed heap words at run time.
    fn alloc_words(&mut self, words: usize) -> VarId;

    /// Store constant words for the lifetime of the compiler and return
    /// their address.
    fn store_words(&mut self, words: &[u64]) -> u64;
}

/// Where an arm lands once its patterns matched.
#[derive(Clone, Debug)]
pub struct ArmTarget {
    /// Binding variable, path to its value, and representation.
    pub binds: Vec<(VarId, AccessPath, Repr)>,
    pub body: BlockId,
}

/// Everything a strategy emits over.
pub struct MatchSite<'m> {
    pub columns: &'m [VarId],
    pub rows: &'m [MatchRow],
    /// Indexed like `rows`.
    pub targets: &'m [ArmTarget],
}

/// Emit the dispatch for `site` at the current block.
pub fn emit(host: &mut dyn MatchHost, strategy: MatchStrategy, site: &MatchSite<'_>) -> Result<(), LowerError> {
    tracing::debug!(%strategy, rows = site.rows.len(), "lowering match");
    match strategy {
        MatchStrategy::Compiled => compile::emit_sequential(host, site),
        MatchStrategy::ColumnWise => compile::emit_decision_tree(host, site),
        MatchStrategy::Table => compile::emit_table(host, site),
        MatchStrategy::Interpreted => interp::emit_interpreted(host, site),
    }
}

/// Load the value at `path`.
pub(crate) fn load_path(b: &mut FnBuilder, columns: &[VarId], path: &AccessPath, repr: Repr) -> VarId {
    let mut value = columns[path.column];
    let last = path.steps.len();
    for (i, &offset) in path.steps.iter().enumerate() {
        let step_repr = if i + 1 == last { repr } else { Repr::Word };
        value = b.load(value, offset, step_repr);
    }
    value
}

/// A condition variable that is nonzero when the value at `path` has
/// `head`.
pub(crate) fn test_head(b: &mut FnBuilder, columns: &[VarId], path: &AccessPath, head: &Head) -> VarId {
    match head {
        Head::Tag { tag, .. } => {
            let v = load_path(b, columns, path, Repr::Word);
            let t = b.load(v, 0, Repr::Word);
            let k = b.iconst(*tag as i64);
            b.bin(BinOp::Eq, t, k)
        }
        Head::Len(n) => {
            let v = load_path(b, columns, path, Repr::Word);
            let len = b.load(v, 0, Repr::Word);
            let k = b.iconst(*n as i64);
            b.bin(BinOp::Eq, len, k)
        }
        Head::Float(bits) => {
            let v = load_path(b, columns, path, Repr::Float);
            let k = b.fconst(f64::from_bits(*bits));
            b.bin(BinOp::FEq, v, k)
        }
        Head::Bool(_) | Head::Int(_) | Head::Char(_) => {
            let v = load_path(b, columns, path, Repr::Word);
            let k = b.iconst(head.table_key().unwrap_or(0));
            b.bin(BinOp::Eq, v, k)
        }
        Head::Tuple(_) | Head::Unit => b.iconst(1),
    }
}

/// Bind row `row` and enter its body, or `on_guard_fail` when its guard
/// is false.
pub(crate) fn leaf(
    host: &mut dyn MatchHost,
    site: &MatchSite<'_>,
    row: usize,
    on_guard_fail: Option<BlockId>,
) -> Result<(), LowerError> {
    let target = &site.targets[row];
    for (var, path, repr) in &target.binds {
        let b = host.builder();
        let value = load_path(b, site.columns, path, *repr);
        b.mov(*var, value);
    }
    match (site.rows[row].guarded, on_guard_fail) {
        (true, Some(fallback)) => {
            let cond = host.lower_guard(site.rows[row].arm)?;
            host.builder().branch(cond, target.body, fallback);
        }
        (true, None) => {
            return Err(LowerError::Internal(
                "guarded row without a fallback block".to_string(),
            ))
        }
        (false, _) => host.builder().jump(target.body),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_typeck::TypeRegistry;

    fn row(arm: usize, pats: Vec<Pat>) -> MatchRow {
        MatchRow {
            arm,
            pats,
            guarded: false,
        }
    }

    fn int(n: i64) -> Pat {
        Pat::con(Head::Int(n), Vec::new(), Repr::Word)
    }

    #[test]
    fn string_literal_becomes_char_array() {
        let registry = TypeRegistry::new();
        let layouts = Layouts::new(&registry);
        let p = Pat::from_pattern(&layouts, &Pattern::Lit(Lit::Str("ab".into())), &Ty::string()).unwrap();
        assert_eq!(p.head(), Some(&Head::Len(2)));
        let PatKind::Con(_, children) = &p.kind else {
            panic!("expected a constructor pattern");
        };
        assert_eq!(children[1].head(), Some(&Head::Char('b' as u32)));
    }

    #[test]
    fn negative_zero_shares_the_zero_head() {
        let registry = TypeRegistry::new();
        let layouts = Layouts::new(&registry);
        let pat = |x: f64| Pat::from_pattern(&layouts, &Pattern::Lit(Lit::Float(x)), &Ty::float()).unwrap();
        assert_eq!(pat(-0.0), pat(0.0));
        assert!(!pat(0.0).matches_nothing());
        assert!(pat(f64::NAN).matches_nothing());
    }

    #[test]
    fn record_pattern_fills_missing_fields() {
        let registry = TypeRegistry::new();
        let layouts = Layouts::new(&registry);
        let ty = Ty::record(vec![("x", Ty::int()), ("y", Ty::float())]);
        let p = Pattern::Record(vec![("y".into(), Pattern::bind("v"))]);
        let pat = Pat::from_pattern(&layouts, &p, &ty).unwrap();
        let r = row(0, vec![pat]);
        let binds = r.bindings();
        assert_eq!(binds.len(), 1);
        assert_eq!(binds[0].0, "v");
        assert_eq!(binds[0].1.to_string(), "$0.1");
        assert_eq!(binds[0].2, Repr::Float);
    }

    #[test]
    fn dense_keys_pick_a_table() {
        let rows: Vec<MatchRow> = (0..5)
            .map(|i| row(i as usize, vec![int(i)]))
            .chain([row(5, vec![WILD.clone()])])
            .collect();
        assert_eq!(choose_strategy(&MatchOptions::default(), &rows), MatchStrategy::Table);
    }

    #[test]
    fn sparse_keys_stay_compiled_unless_forced() {
        let rows = vec![
            row(0, vec![int(1)]),
            row(1, vec![int(100)]),
            row(2, vec![int(1000)]),
            row(3, vec![int(10000)]),
            row(4, vec![WILD.clone()]),
        ];
        assert_eq!(choose_strategy(&MatchOptions::default(), &rows), MatchStrategy::Compiled);
        let forced = MatchOptions {
            force_tables: true,
            ..MatchOptions::default()
        };
        assert_eq!(choose_strategy(&forced, &rows), MatchStrategy::Table);
    }

    #[test]
    fn interpreted_takes_precedence() {
        let rows = vec![row(0, vec![int(1)])];
        let options = MatchOptions {
            interpreted: true,
            column_wise: true,
            force_tables: true,
            ..MatchOptions::default()
        };
        assert_eq!(choose_strategy(&options, &rows), MatchStrategy::Interpreted);
    }
}
