//! Cross-definition inlining.
//!
//! Small compiled definitions are kept in an [`InlineLibrary`] keyed by the
//! slot that holds their code. Calls through such a slot are replaced by a
//! copy of the callee's blocks, renumbered into the caller.

use rustc_hash::FxHashMap;

use crate::mir::{Block, BlockId, Callee, Inst, MirFunction, MirUnit, Terminator, VarId};

/// Largest callee, in instructions plus terminators, that is inlined.
pub const INLINE_LIMIT: usize = 24;

#[derive(Default)]
pub struct InlineLibrary {
    bodies: FxHashMap<u64, MirFunction>,
}

impl InlineLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `f`, living behind `slot`, can be copied into other units.
    /// It must be small and must not reference anything local to its own
    /// unit or call itself.
    pub fn eligible(slot: u64, f: &MirFunction) -> bool {
        f.inst_count() <= INLINE_LIMIT
            && !f
                .blocks
                .iter()
                .flat_map(|b| &b.insts)
                .any(|i| matches!(i, Inst::FuncAddr { .. }))
            && f
                .calls()
                .all(|c| !matches!(c, Callee::Func(_)) && *c != Callee::Slot(slot))
    }

    /// Record the body behind `slot`. Returns whether it was accepted.
    pub fn insert(&mut self, slot: u64, f: MirFunction) -> bool {
        if Self::eligible(slot, &f) {
            self.bodies.insert(slot, f);
            true
        } else {
            self.bodies.remove(&slot);
            false
        }
    }

    pub fn remove(&mut self, slot: u64) {
        self.bodies.remove(&slot);
    }

    pub fn get(&self, slot: u64) -> Option<&MirFunction> {
        self.bodies.get(&slot)
    }

    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }
}

/// Inline every eligible call in every function of `unit`.
pub fn inline_unit(unit: &mut MirUnit, library: &InlineLibrary) -> usize {
    let mut total = 0;
    for f in &mut unit.functions {
        total += inline_calls(f, library);
    }
    if total > 0 {
        tracing::debug!(unit = %unit.name, calls = total, "inlined calls");
    }
    total
}

/// Inline calls through library slots in `f`, one level deep: calls
/// inside copied bodies are left alone.
pub fn inline_calls(f: &mut MirFunction, library: &InlineLibrary) -> usize {
    let mut count = 0;
    let mut scan = vec![true; f.blocks.len()];
    let mut bi = 0;
    while bi < f.blocks.len() {
        if !scan[bi] {
            bi += 1;
            continue;
        }
        let site = f.blocks[bi].insts.iter().enumerate().find_map(|(pos, inst)| match inst {
            Inst::Call {
                dest,
                callee: Callee::Slot(slot),
                args,
                ..
            } => library.get(*slot).map(|body| (pos, *dest, args.clone(), body)),
            _ => None,
        });
        let Some((pos, dest, args, body)) = site else {
            bi += 1;
            continue;
        };

        // Split the caller block: everything after the call moves to a
        // continuation block.
        let mut tail = f.blocks[bi].insts.split_off(pos);
        tail.remove(0);
        let cont = BlockId(f.blocks.len() as u32);
        let entry = BlockId(cont.0 + 1);
        let term = std::mem::replace(&mut f.blocks[bi].term, Terminator::Jump(entry));
        f.blocks.push(Block { insts: tail, term });
        scan.push(true);

        let var_base = f.vars.len() as u32;
        f.vars.extend_from_slice(&body.vars);
        let var = |v: VarId| VarId(v.0 + var_base);
        let block = |b: BlockId| BlockId(b.0 + entry.0);

        for (p, a) in body.params.iter().zip(&args) {
            f.blocks[bi].insts.push(Inst::Move { dest: var(*p), src: *a });
        }
        for callee_block in &body.blocks {
            let mut insts: Vec<Inst> = callee_block
                .insts
                .iter()
                .map(|i| i.map_vars(&mut |v| var(v)))
                .collect();
            let term = match &callee_block.term {
                Terminator::Jump(b) => Terminator::Jump(block(*b)),
                Terminator::Branch {
                    cond,
                    then_block,
                    else_block,
                } => Terminator::Branch {
                    cond: var(*cond),
                    then_block: block(*then_block),
                    else_block: block(*else_block),
                },
                Terminator::Switch {
                    value,
                    cases,
                    default,
                } => Terminator::Switch {
                    value: var(*value),
                    cases: cases.iter().map(|(k, b)| (*k, block(*b))).collect(),
                    default: block(*default),
                },
                Terminator::Return(v) => {
                    insts.push(Inst::Move { dest, src: var(*v) });
                    Terminator::Jump(cont)
                }
                Terminator::Fail(kind) => Terminator::Fail(*kind),
                Terminator::Unwind => Terminator::Unwind,
            };
            f.blocks.push(Block { insts, term });
            scan.push(false);
        }
        count += 1;
        bi += 1;
    }
    count
}
