//! Natively compiled match strategies: sequential arm tests, Maranget
//! decision trees, and jump tables.

use kiln_rt::FaultKind;

use super::{leaf, load_path, test_head, AccessPath, Head, MatchHost, MatchSite, Pat, PatKind, WILD};
use crate::error::LowerError;
use crate::mir::Repr;

// ── Sequential ──────────────────────────────────────────────────────

/// Emit nested tests for `pat`, branching to `fail` on the first miss.
fn test_pattern(
    host: &mut dyn MatchHost,
    site: &MatchSite<'_>,
    path: &AccessPath,
    pat: &Pat,
    fail: crate::mir::BlockId,
) {
    let PatKind::Con(head, children) = &pat.kind else {
        return;
    };
    if head.is_tested() {
        let b = host.builder();
        let cond = test_head(b, site.columns, path, head);
        let ok = b.new_block();
        b.branch(cond, ok, fail);
        b.switch_to(ok);
    }
    for (i, child) in children.iter().enumerate() {
        test_pattern(host, site, &path.child(head.child_offset(i)), child, fail);
    }
}

/// Each row in order: tests, then bindings, guard and body, falling
/// through to the next row on any miss.
pub fn emit_sequential(host: &mut dyn MatchHost, site: &MatchSite<'_>) -> Result<(), LowerError> {
    for (i, row) in site.rows.iter().enumerate() {
        let next = host.builder().new_block();
        for (column, pat) in row.pats.iter().enumerate() {
            test_pattern(host, site, &AccessPath::root(column), pat, next);
        }
        leaf(host, site, i, Some(next))?;
        host.builder().switch_to(next);
    }
    host.builder().fail(FaultKind::MatchFailure);
    Ok(())
}

// ── Decision tree ───────────────────────────────────────────────────

/// A matrix row: the row index into the site, and the remaining
/// (path, pattern) cells.
#[derive(Clone)]
struct TreeRow<'p> {
    row: usize,
    cells: Vec<(AccessPath, &'p Pat)>,
}

/// Replace tuple and unit columns by their children. They never need a
/// test, so expanding them first leaves only real decisions.
fn expand_irrefutable<'p>(rows: &mut [TreeRow<'p>]) {
    loop {
        let Some(first) = rows.first() else {
            return;
        };
        let column = (0..first.cells.len()).find(|&j| {
            rows.iter()
                .any(|r| matches!(r.cells[j].1.head(), Some(Head::Tuple(_) | Head::Unit)))
        });
        let Some(j) = column else {
            return;
        };
        let head = rows
            .iter()
            .find_map(|r| r.cells[j].1.head().cloned())
            .unwrap_or(Head::Unit);
        for r in rows.iter_mut() {
            let (path, pat) = r.cells.remove(j);
            let children: Vec<(AccessPath, &'p Pat)> = match &pat.kind {
                PatKind::Con(_, children) => children
                    .iter()
                    .enumerate()
                    .map(|(i, c)| (path.child(head.child_offset(i)), c))
                    .collect(),
                PatKind::Wild => (0..head.arity())
                    .map(|i| (path.child(head.child_offset(i)), &WILD))
                    .collect(),
            };
            for (k, cell) in children.into_iter().enumerate() {
                r.cells.insert(j + k, cell);
            }
        }
    }
}

fn specialize<'p>(rows: &[TreeRow<'p>], j: usize, head: &Head) -> Vec<TreeRow<'p>> {
    rows.iter()
        .filter_map(|r| {
            let (path, pat) = &r.cells[j];
            let children: Vec<(AccessPath, &'p Pat)> = match &pat.kind {
                PatKind::Con(h, children) if h == head => children
                    .iter()
                    .enumerate()
                    .map(|(i, c)| (path.child(head.child_offset(i)), c))
                    .collect(),
                PatKind::Con(..) => return None,
                PatKind::Wild => (0..head.arity())
                    .map(|i| (path.child(head.child_offset(i)), &WILD))
                    .collect(),
            };
            let mut cells = r.cells[..j].to_vec();
            cells.extend(children);
            cells.extend_from_slice(&r.cells[j + 1..]);
            Some(TreeRow { row: r.row, cells })
        })
        .collect()
}

fn default_rows<'p>(rows: &[TreeRow<'p>], j: usize) -> Vec<TreeRow<'p>> {
    rows.iter()
        .filter(|r| r.cells[j].1.is_wild())
        .map(|r| {
            let mut cells = r.cells.clone();
            cells.remove(j);
            TreeRow { row: r.row, cells }
        })
        .collect()
}

/// Distinct heads in column `j`, in order of first appearance.
fn column_heads(rows: &[TreeRow<'_>], j: usize) -> Vec<Head> {
    let mut heads: Vec<Head> = Vec::new();
    for r in rows {
        if let Some(h) = r.cells[j].1.head() {
            if !heads.contains(h) {
                heads.push(h.clone());
            }
        }
    }
    heads
}

/// The column whose split leaves the fewest rows in total; leftmost on
/// ties.
fn pick_column(rows: &[TreeRow<'_>]) -> Option<usize> {
    let width = rows.first()?.cells.len();
    let mut best: Option<(usize, usize)> = None;
    for j in 0..width {
        let heads = column_heads(rows, j);
        if heads.is_empty() {
            continue;
        }
        let residual: usize = heads.iter().map(|h| specialize(rows, j, h).len()).sum::<usize>()
            + default_rows(rows, j).len();
        if best.map_or(true, |(_, score)| residual < score) {
            best = Some((j, residual));
        }
    }
    best.map(|(j, _)| j)
}

fn emit_tree(host: &mut dyn MatchHost, site: &MatchSite<'_>, mut rows: Vec<TreeRow<'_>>) -> Result<(), LowerError> {
    expand_irrefutable(&mut rows);
    let Some(first) = rows.first() else {
        host.builder().fail(FaultKind::MatchFailure);
        return Ok(());
    };

    if first.cells.iter().all(|(_, p)| p.is_wild()) {
        let row = first.row;
        if site.rows[row].guarded {
            let rest = host.builder().new_block();
            leaf(host, site, row, Some(rest))?;
            host.builder().switch_to(rest);
            return emit_tree(host, site, rows[1..].to_vec());
        }
        return leaf(host, site, row, None);
    }

    let Some(j) = pick_column(&rows) else {
        return Err(LowerError::Internal("decision tree without a test column".into()));
    };
    let path = rows[0].cells[j].0.clone();
    for head in column_heads(&rows, j) {
        let b = host.builder();
        let cond = test_head(b, site.columns, &path, &head);
        let hit = b.new_block();
        let miss = b.new_block();
        b.branch(cond, hit, miss);
        b.switch_to(hit);
        emit_tree(host, site, specialize(&rows, j, &head))?;
        host.builder().switch_to(miss);
    }
    emit_tree(host, site, default_rows(&rows, j))
}

/// A decision tree over all columns. A failed guard continues with the
/// rows below it.
pub fn emit_decision_tree(host: &mut dyn MatchHost, site: &MatchSite<'_>) -> Result<(), LowerError> {
    let rows = site
        .rows
        .iter()
        .enumerate()
        .map(|(i, r)| TreeRow {
            row: i,
            cells: r
                .pats
                .iter()
                .enumerate()
                .map(|(column, p)| (AccessPath::root(column), p))
                .collect(),
        })
        .collect();
    emit_tree(host, site, rows)
}

// ── Jump table ──────────────────────────────────────────────────────

/// Try `candidates` in order, ending in a match failure.
fn emit_chain(host: &mut dyn MatchHost, site: &MatchSite<'_>, candidates: &[usize]) -> Result<(), LowerError> {
    for &row in candidates {
        if !site.rows[row].guarded {
            return leaf(host, site, row, None);
        }
        let next = host.builder().new_block();
        leaf(host, site, row, Some(next))?;
        host.builder().switch_to(next);
    }
    host.builder().fail(FaultKind::MatchFailure);
    Ok(())
}

/// A `Switch` on the single column's value, or its tag for variants.
pub fn emit_table(host: &mut dyn MatchHost, site: &MatchSite<'_>) -> Result<(), LowerError> {
    let keys = super::table_keys(site.rows)
        .ok_or_else(|| LowerError::Internal("match is not table-shaped".into()))?;
    let by_tag = site
        .rows
        .iter()
        .any(|r| matches!(r.pats[0].head(), Some(Head::Tag { .. })));

    let b = host.builder();
    let root = AccessPath::root(0);
    let scrutinee = load_path(b, site.columns, &root, Repr::Word);
    let value = if by_tag { b.load(scrutinee, 0, Repr::Word) } else { scrutinee };

    let mut cases = Vec::with_capacity(keys.len());
    for &key in &keys {
        cases.push((key, b.new_block()));
    }
    let default = b.new_block();
    b.switch(value, cases.clone(), default);

    for (key, block) in cases {
        host.builder().switch_to(block);
        let candidates: Vec<usize> = site
            .rows
            .iter()
            .enumerate()
            .filter(|(_, r)| match r.pats[0].head() {
                Some(h) => h.table_key() == Some(key),
                None => true,
            })
            .map(|(i, _)| i)
            .collect();
        emit_chain(host, site, &candidates)?;
    }

    host.builder().switch_to(default);
    let wild: Vec<usize> = site
        .rows
        .iter()
        .enumerate()
        .filter(|(_, r)| r.pats[0].is_wild())
        .map(|(i, _)| i)
        .collect();
    emit_chain(host, site, &wild)
}
