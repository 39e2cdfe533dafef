//! Emission cursor for building one [`MirFunction`].

use kiln_rt::FaultKind;

use super::{BinOp, Block, BlockId, Callee, FuncId, Inst, MirFunction, Repr, Sig, Terminator, UnOp, VarId};

/// Appends instructions to the current block of a function under
/// construction.
///
/// Emitting into a block that already has a terminator opens a fresh,
/// unreachable block, so callers never have to track whether the code
/// they are about to emit is live.
pub struct FnBuilder {
    name: String,
    params: Vec<VarId>,
    ret: Repr,
    vars: Vec<Repr>,
    insts: Vec<Vec<Inst>>,
    terms: Vec<Option<Terminator>>,
    current: BlockId,
}

impl FnBuilder {
    pub fn new(name: impl Into<String>, params: &[Repr], ret: Repr) -> Self {
        let mut b = FnBuilder {
            name: name.into(),
            params: Vec::new(),
            ret,
            vars: Vec::new(),
            insts: vec![Vec::new()],
            terms: vec![None],
            current: BlockId(0),
        };
        for &repr in params {
            let v = b.new_var(repr);
            b.params.push(v);
        }
        b
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[VarId] {
        &self.params
    }

    pub fn ret_repr(&self) -> Repr {
        self.ret
    }

    pub fn new_var(&mut self, repr: Repr) -> VarId {
        self.vars.push(repr);
        VarId(self.vars.len() as u32 - 1)
    }

    pub fn repr(&self, v: VarId) -> Repr {
        self.vars.get(v.0 as usize).copied().unwrap_or(Repr::Word)
    }

    pub fn new_block(&mut self) -> BlockId {
        self.insts.push(Vec::new());
        self.terms.push(None);
        BlockId(self.insts.len() as u32 - 1)
    }

    pub fn switch_to(&mut self, block: BlockId) {
        self.current = block;
    }

    pub fn current(&self) -> BlockId {
        self.current
    }

    pub fn is_terminated(&self) -> bool {
        self.terms[self.current.0 as usize].is_some()
    }

    pub fn push(&mut self, inst: Inst) {
        if self.is_terminated() {
            let dead = self.new_block();
            self.switch_to(dead);
        }
        self.insts[self.current.0 as usize].push(inst);
    }

    /// Set the terminator of the current block. A block that is already
    /// terminated keeps its first terminator.
    pub fn terminate(&mut self, term: Terminator) {
        let slot = &mut self.terms[self.current.0 as usize];
        if slot.is_none() {
            *slot = Some(term);
        }
    }

    // ── Instruction helpers ─────────────────────────────────────────

    pub fn iconst(&mut self, value: i64) -> VarId {
        let dest = self.new_var(Repr::Word);
        self.push(Inst::IConst { dest, value });
        dest
    }

    pub fn fconst(&mut self, value: f64) -> VarId {
        let dest = self.new_var(Repr::Float);
        self.push(Inst::FConst { dest, value });
        dest
    }

    /// A zero of the given representation.
    pub fn zero(&mut self, repr: Repr) -> VarId {
        match repr {
            Repr::Word => self.iconst(0),
            Repr::Float => self.fconst(0.0),
        }
    }

    pub fn mov(&mut self, dest: VarId, src: VarId) {
        self.push(Inst::Move { dest, src });
    }

    pub fn bin(&mut self, op: BinOp, lhs: VarId, rhs: VarId) -> VarId {
        let dest = self.new_var(op.result_repr());
        self.push(Inst::Bin { dest, op, lhs, rhs });
        dest
    }

    pub fn un(&mut self, op: UnOp, arg: VarId) -> VarId {
        let dest = self.new_var(op.result_repr());
        self.push(Inst::Un { dest, op, arg });
        dest
    }

    pub fn load(&mut self, base: VarId, offset: i32, repr: Repr) -> VarId {
        let dest = self.new_var(repr);
        self.push(Inst::Load { dest, base, offset });
        dest
    }

    pub fn store(&mut self, base: VarId, offset: i32, value: VarId) {
        self.push(Inst::Store { base, offset, value });
    }

    pub fn load_abs(&mut self, addr: u64, repr: Repr) -> VarId {
        let dest = self.new_var(repr);
        self.push(Inst::LoadAbs { dest, addr });
        dest
    }

    pub fn func_addr(&mut self, func: FuncId) -> VarId {
        let dest = self.new_var(Repr::Word);
        self.push(Inst::FuncAddr { dest, func });
        dest
    }

    pub fn call(&mut self, callee: Callee, args: Vec<VarId>, sig: Sig) -> VarId {
        let dest = self.new_var(sig.ret);
        self.push(Inst::Call { dest, callee, args, sig });
        dest
    }

    // ── Terminator helpers ──────────────────────────────────────────

    pub fn jump(&mut self, target: BlockId) {
        self.terminate(Terminator::Jump(target));
    }

    pub fn branch(&mut self, cond: VarId, then_block: BlockId, else_block: BlockId) {
        self.terminate(Terminator::Branch { cond, then_block, else_block });
    }

    pub fn switch(&mut self, value: VarId, cases: Vec<(i64, BlockId)>, default: BlockId) {
        self.terminate(Terminator::Switch { value, cases, default });
    }

    pub fn ret(&mut self, value: VarId) {
        self.terminate(Terminator::Return(value));
    }

    pub fn fail(&mut self, kind: FaultKind) {
        self.terminate(Terminator::Fail(kind));
    }

    /// Close the function. Blocks never given a terminator are
    /// unreachable and fail if entered.
    pub fn finish(self) -> MirFunction {
        let blocks = self
            .insts
            .into_iter()
            .zip(self.terms)
            .map(|(insts, term)| Block {
                insts,
                term: term.unwrap_or(Terminator::Fail(FaultKind::MatchFailure)),
            })
            .collect();
        MirFunction {
            name: self.name,
            params: self.params,
            ret: self.ret,
            vars: self.vars,
            blocks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_an_increment() {
        let mut b = FnBuilder::new("inc", &[Repr::Word], Repr::Word);
        let x = b.params()[0];
        let one = b.iconst(1);
        let sum = b.bin(BinOp::Add, x, one);
        b.ret(sum);
        let f = b.finish();
        insta::assert_snapshot!(f.to_string(), @r"
        fn inc(v0: i64) -> i64 {
          b0:
            v1 = iconst 1
            v2 = add v0, v1
            ret v2
        }
        ");
    }

    #[test]
    fn emitting_after_a_terminator_opens_a_dead_block() {
        let mut b = FnBuilder::new("f", &[], Repr::Word);
        let z = b.iconst(0);
        b.ret(z);
        let _ = b.iconst(1);
        assert_eq!(b.current(), BlockId(1));
        let f = b.finish();
        assert_eq!(f.blocks.len(), 2);
        assert_eq!(f.blocks[1].term, Terminator::Fail(FaultKind::MatchFailure));
    }

    #[test]
    fn float_ops_produce_float_vars() {
        let mut b = FnBuilder::new("f", &[Repr::Float, Repr::Float], Repr::Float);
        let (x, y) = (b.params()[0], b.params()[1]);
        let s = b.bin(BinOp::FAdd, x, y);
        let c = b.bin(BinOp::FLt, x, y);
        assert_eq!(b.repr(s), Repr::Float);
        assert_eq!(b.repr(c), Repr::Word);
    }
}
