//! Interpreted matches: rows are serialised into a [`MatchTable`] and
//! walked by `kiln_rt_match_rows` at run time.

use kiln_rt::{kiln_rt_match_rows, Check, CheckKind, FaultKind, MatchTable};

use super::{leaf, AccessPath, Head, MatchHost, MatchRow, MatchSite, Pat, PatKind};
use crate::error::LowerError;
use crate::mir::{Callee, Repr, Sig};

fn collect_checks(path: &AccessPath, pat: &Pat, out: &mut Vec<Check>) {
    let PatKind::Con(head, children) = &pat.kind else {
        return;
    };
    let check = |kind, operand| Check {
        kind,
        column: path.column as u32,
        path: path.steps.iter().map(|&s| s as u32).collect(),
        operand,
    };
    match head {
        Head::Tag { tag, .. } => out.push(check(CheckKind::TagEq, *tag as u64)),
        Head::Len(n) => out.push(check(CheckKind::LenEq, *n as u64)),
        Head::Float(bits) => out.push(check(CheckKind::FloatEq, *bits)),
        Head::Bool(_) | Head::Int(_) | Head::Char(_) => {
            out.push(check(CheckKind::IntEq, head.table_key().unwrap_or(0) as u64))
        }
        Head::Tuple(_) | Head::Unit => {}
    }
    for (i, child) in children.iter().enumerate() {
        collect_checks(&path.child(head.child_offset(i)), child, out);
    }
}

/// The table for `rows`, one table row per match row.
pub fn build_table(rows: &[MatchRow]) -> MatchTable {
    let mut table = MatchTable::new();
    for row in rows {
        let mut checks = Vec::new();
        for (column, pat) in row.pats.iter().enumerate() {
            collect_checks(&AccessPath::root(column), pat, &mut checks);
        }
        table.push_row(checks);
    }
    table
}

/// Spill the scrutinees, then loop: ask the runtime for the first
/// matching row at or after `start`, dispatch on it, and resume after a
/// row whose guard failed.
pub fn emit_interpreted(host: &mut dyn MatchHost, site: &MatchSite<'_>) -> Result<(), LowerError> {
    let table = build_table(site.rows);
    tracing::trace!(rows = table.row_count(), "match table:\n{}", table);
    let table_addr = host.store_words(&table.encode());

    let spilled = host.alloc_words(site.columns.len().max(1));
    let b = host.builder();
    for (i, &column) in site.columns.iter().enumerate() {
        b.store(spilled, i as i32, column);
    }
    let start = b.new_var(Repr::Word);
    let zero = b.iconst(0);
    b.mov(start, zero);
    let walk = b.new_block();
    b.jump(walk);

    b.switch_to(walk);
    let table_var = b.iconst(table_addr as i64);
    let found = b.call(
        Callee::Addr(kiln_rt_match_rows as usize as u64),
        vec![table_var, spilled, start],
        Sig {
            params: vec![Repr::Word; 3],
            ret: Repr::Word,
        },
    );
    let mut cases = Vec::with_capacity(site.rows.len());
    for i in 0..site.rows.len() {
        cases.push((i as i64, b.new_block()));
    }
    let none = b.new_block();
    b.switch(found, cases.clone(), none);

    for (i, block) in cases {
        let i = i as usize;
        host.builder().switch_to(block);
        if site.rows[i].guarded {
            let resume = host.builder().new_block();
            leaf(host, site, i, Some(resume))?;
            let b = host.builder();
            b.switch_to(resume);
            let next = b.iconst(i as i64 + 1);
            b.mov(start, next);
            b.jump(walk);
        } else {
            leaf(host, site, i, None)?;
        }
    }

    let b = host.builder();
    b.switch_to(none);
    b.fail(FaultKind::MatchFailure);
    Ok(())
}
