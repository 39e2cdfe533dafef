//! Reachability and exhaustiveness by pattern usefulness.
//!
//! A row is *useful* against a matrix when some value matches the row but
//! no row of the matrix. An arm is reachable exactly when its row is
//! useful against the unguarded rows above it; a match is exhaustive when
//! an all-wildcard row is not useful against its unguarded rows. A row
//! holding a NaN literal matches nothing and is always unreachable.

use super::{Head, MatchRow, Pat, PatKind, WILD};

type Vector<'p> = Vec<&'p Pat>;

/// Replace the first column by the children of `head`, dropping rows
/// whose first pattern has another head.
fn specialize<'p>(row: &[&'p Pat], head: &Head) -> Option<Vector<'p>> {
    let (first, rest) = row.split_first()?;
    let mut out = match &first.kind {
        PatKind::Wild => vec![&WILD; head.arity()],
        PatKind::Con(h, children) if h == head => children.iter().collect(),
        PatKind::Con(..) => return None,
    };
    out.extend_from_slice(rest);
    Some(out)
}

/// Rows whose first pattern is a wildcard, without that column.
fn default_rows<'p>(matrix: &[Vector<'p>]) -> Vec<Vector<'p>> {
    matrix
        .iter()
        .filter(|r| r.first().is_some_and(|p| p.is_wild()))
        .map(|r| r[1..].to_vec())
        .collect()
}

/// Whether the heads seen cover every constructor of their type.
fn is_complete(heads: &[&Head]) -> bool {
    let Some(first) = heads.first() else {
        return false;
    };
    match first {
        Head::Tuple(_) | Head::Unit => true,
        Head::Bool(_) => {
            heads.contains(&&Head::Bool(true)) && heads.contains(&&Head::Bool(false))
        }
        Head::Tag { of, .. } => {
            let mut tags: Vec<usize> = heads
                .iter()
                .filter_map(|h| match h {
                    Head::Tag { tag, .. } => Some(*tag),
                    _ => None,
                })
                .collect();
            tags.sort_unstable();
            tags.dedup();
            tags.len() == *of
        }
        Head::Int(_) | Head::Char(_) | Head::Float(_) | Head::Len(_) => false,
    }
}

fn useful(matrix: &[Vector<'_>], row: &[&Pat]) -> bool {
    let Some(first) = row.first() else {
        return matrix.is_empty();
    };
    match &first.kind {
        PatKind::Con(head, _) => {
            let sub: Vec<Vector<'_>> = matrix.iter().filter_map(|r| specialize(r, head)).collect();
            specialize(row, head).is_some_and(|q| useful(&sub, &q))
        }
        PatKind::Wild => {
            let mut heads: Vec<&Head> = Vec::new();
            for r in matrix {
                if let Some(h) = r.first().and_then(|p| p.head()) {
                    if !heads.contains(&h) {
                        heads.push(h);
                    }
                }
            }
            if is_complete(&heads) {
                heads.iter().any(|head| {
                    let sub: Vec<Vector<'_>> =
                        matrix.iter().filter_map(|r| specialize(r, head)).collect();
                    specialize(row, head).is_some_and(|q| useful(&sub, &q))
                })
            } else {
                useful(&default_rows(matrix), &row[1..])
            }
        }
    }
}

/// Positions (into `rows`) of rows no value can reach.
pub fn unreachable_rows(rows: &[MatchRow]) -> Vec<usize> {
    let mut above: Vec<Vector<'_>> = Vec::new();
    let mut out = Vec::new();
    for (i, row) in rows.iter().enumerate() {
        if row.pats.iter().any(Pat::matches_nothing) {
            out.push(i);
            continue;
        }
        let vector: Vector<'_> = row.pats.iter().collect();
        if !useful(&above, &vector) {
            out.push(i);
        }
        if !row.guarded {
            above.push(vector);
        }
    }
    out
}

/// Whether every value is caught by some unguarded row.
pub fn is_exhaustive(rows: &[MatchRow], columns: usize) -> bool {
    let matrix: Vec<Vector<'_>> = rows
        .iter()
        .filter(|r| !r.guarded && !r.pats.iter().any(Pat::matches_nothing))
        .map(|r| r.pats.iter().collect())
        .collect();
    let wild: Vector<'_> = vec![&WILD; columns];
    !useful(&matrix, &wild)
}
