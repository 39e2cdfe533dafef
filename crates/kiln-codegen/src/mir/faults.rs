//! Fault propagation across calls.
//!
//! A callee that fails returns a zero value with its fault pending. After
//! every call that can fail, the caller reads the flag through
//! `kiln_rt_fault_pending` and unwinds when it is set, so no code runs on
//! the callee's placeholder result and the fault reaches the trampoline
//! that entered compiled code.

use kiln_rt::kiln_rt_fault_pending;

use super::{Block, BlockId, Callee, Inst, MirFunction, MirUnit, Repr, Sig, Terminator, VarId};

fn pending_addr() -> u64 {
    kiln_rt_fault_pending as usize as u64
}

/// Whether a call through `callee` can return with a fault pending.
/// Runtime helpers and host functions, reached by address, never fail.
pub fn can_fault(callee: &Callee) -> bool {
    !matches!(callee, Callee::Addr(_))
}

fn is_pending_check(inst: &Inst) -> bool {
    matches!(inst, Inst::Call { callee: Callee::Addr(addr), .. } if *addr == pending_addr())
}

/// Follow every call in `f` that can fail with a check of the fault flag.
/// Calls already followed by a check are left alone. Returns the number
/// of checks added.
pub fn propagate_faults(f: &mut MirFunction) -> usize {
    let mut added = 0;
    let mut exit: Option<BlockId> = None;
    let mut bi = 0;
    while bi < f.blocks.len() {
        let insts = &f.blocks[bi].insts;
        let site = (0..insts.len()).find(|&pos| match &insts[pos] {
            Inst::Call { callee, .. } => {
                can_fault(callee) && !insts.get(pos + 1).is_some_and(is_pending_check)
            }
            _ => false,
        });
        let Some(pos) = site else {
            bi += 1;
            continue;
        };

        // Everything after the call moves to a continuation block.
        let tail = f.blocks[bi].insts.split_off(pos + 1);
        let term = std::mem::replace(&mut f.blocks[bi].term, Terminator::Unwind);
        let cont = BlockId(f.blocks.len() as u32);
        f.blocks.push(Block { insts: tail, term });
        let unwind = *exit.get_or_insert_with(|| {
            f.blocks.push(Block {
                insts: Vec::new(),
                term: Terminator::Unwind,
            });
            BlockId(f.blocks.len() as u32 - 1)
        });

        let flag = VarId(f.vars.len() as u32);
        f.vars.push(Repr::Word);
        let block = &mut f.blocks[bi];
        block.insts.push(Inst::Call {
            dest: flag,
            callee: Callee::Addr(pending_addr()),
            args: Vec::new(),
            sig: Sig {
                params: Vec::new(),
                ret: Repr::Word,
            },
        });
        block.term = Terminator::Branch {
            cond: flag,
            then_block: unwind,
            else_block: cont,
        };
        added += 1;
        bi += 1;
    }
    added
}

/// [`propagate_faults`] over every function of `unit`.
pub fn propagate_unit_faults(unit: &mut MirUnit) -> usize {
    let added: usize = unit.functions.iter_mut().map(propagate_faults).sum();
    if added > 0 {
        tracing::trace!(unit = %unit.name, checks = added, "guarded faulting calls");
    }
    added
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::{BinOp, FnBuilder};

    fn word_sig(params: usize) -> Sig {
        Sig {
            params: vec![Repr::Word; params],
            ret: Repr::Word,
        }
    }

    /// `slot(x) + 1`, then a host call by address.
    fn caller() -> MirFunction {
        let mut b = FnBuilder::new("caller", &[Repr::Word], Repr::Word);
        let x = b.params()[0];
        let y = b.call(Callee::Slot(0x10), vec![x], word_sig(1));
        let one = b.iconst(1);
        let z = b.bin(BinOp::Add, y, one);
        let w = b.call(Callee::Addr(0x20), vec![z], word_sig(1));
        b.ret(w);
        b.finish()
    }

    #[test]
    fn slot_call_is_followed_by_a_check() {
        let mut f = caller();
        assert_eq!(propagate_faults(&mut f), 1);
        assert_eq!(f.blocks.len(), 3);

        let entry = &f.blocks[0];
        assert_eq!(entry.insts.len(), 2);
        assert!(is_pending_check(&entry.insts[1]));
        let Terminator::Branch { then_block, else_block, .. } = &entry.term else {
            panic!("expected a branch, got {}", entry.term);
        };
        assert_eq!(f.blocks[then_block.0 as usize].term, Terminator::Unwind);
        let cont = &f.blocks[else_block.0 as usize];
        assert_eq!(cont.insts.len(), 3);
        assert!(matches!(cont.term, Terminator::Return(_)));
    }

    #[test]
    fn checks_are_added_once() {
        let mut f = caller();
        propagate_faults(&mut f);
        let once = f.clone();
        assert_eq!(propagate_faults(&mut f), 0);
        assert_eq!(f, once);
    }

    #[test]
    fn calls_in_one_block_share_the_exit() {
        let mut b = FnBuilder::new("twice", &[Repr::Word], Repr::Word);
        let x = b.params()[0];
        let y = b.call(Callee::Slot(0x10), vec![x], word_sig(1));
        let z = b.call(Callee::Slot(0x10), vec![y], word_sig(1));
        b.ret(z);
        let mut f = b.finish();
        assert_eq!(propagate_faults(&mut f), 2);
        let unwinds = f.blocks.iter().filter(|b| b.term == Terminator::Unwind).count();
        assert_eq!(unwinds, 1);
    }
}
