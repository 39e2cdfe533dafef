//! Mid-level IR.
//!
//! A function is a list of basic blocks over mutable virtual variables.
//! Every variable has one of two machine representations: a 64-bit word
//! (integers, booleans, characters, pointers, foreign handles) or a 64-bit
//! float. Backends map variables onto SSA values themselves.
//!
//! Heap values are sequences of words addressed by word offset; see the
//! layout notes in [`crate::layout`].

pub mod builder;
pub mod faults;

use std::fmt;

use kiln_rt::FaultKind;

pub use builder::FnBuilder;
pub use faults::{propagate_faults, propagate_unit_faults};

// ── Identifiers ─────────────────────────────────────────────────────

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub u32);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

/// Index of a function within its [`MirUnit`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(pub u32);

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

// ── Representations and signatures ──────────────────────────────────

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Repr {
    Word,
    Float,
}

impl fmt::Display for Repr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Repr::Word => write!(f, "i64"),
            Repr::Float => write!(f, "f64"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Sig {
    pub params: Vec<Repr>,
    pub ret: Repr,
}

impl fmt::Display for Sig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", p)?;
        }
        write!(f, ") -> {}", self.ret)
    }
}

// ── Instructions ────────────────────────────────────────────────────

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Unsigned less-than, for bounds checks.
    ULt,
    FAdd,
    FSub,
    FMul,
    FDiv,
    FEq,
    FNe,
    FLt,
    FLe,
    FGt,
    FGe,
}

impl BinOp {
    /// Whether the operands are floats.
    pub fn float_operands(self) -> bool {
        matches!(
            self,
            BinOp::FAdd
                | BinOp::FSub
                | BinOp::FMul
                | BinOp::FDiv
                | BinOp::FEq
                | BinOp::FNe
                | BinOp::FLt
                | BinOp::FLe
                | BinOp::FGt
                | BinOp::FGe
        )
    }

    pub fn result_repr(self) -> Repr {
        match self {
            BinOp::FAdd | BinOp::FSub | BinOp::FMul | BinOp::FDiv => Repr::Float,
            _ => Repr::Word,
        }
    }

    fn mnemonic(self) -> &'static str {
        match self {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "mul",
            BinOp::Div => "div",
            BinOp::Rem => "rem",
            BinOp::And => "and",
            BinOp::Or => "or",
            BinOp::Xor => "xor",
            BinOp::Eq => "eq",
            BinOp::Ne => "ne",
            BinOp::Lt => "lt",
            BinOp::Le => "le",
            BinOp::Gt => "gt",
            BinOp::Ge => "ge",
            BinOp::ULt => "ult",
            BinOp::FAdd => "fadd",
            BinOp::FSub => "fsub",
            BinOp::FMul => "fmul",
            BinOp::FDiv => "fdiv",
            BinOp::FEq => "feq",
            BinOp::FNe => "fne",
            BinOp::FLt => "flt",
            BinOp::FLe => "fle",
            BinOp::FGt => "fgt",
            BinOp::FGe => "fge",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    /// `1` when the operand is zero, else `0`.
    Not,
    FNeg,
    IntToFloat,
    /// Truncating, saturating at the integer range.
    FloatToInt,
    BitsToFloat,
    FloatToBits,
}

impl UnOp {
    pub fn result_repr(self) -> Repr {
        match self {
            UnOp::FNeg | UnOp::IntToFloat | UnOp::BitsToFloat => Repr::Float,
            _ => Repr::Word,
        }
    }

    fn mnemonic(self) -> &'static str {
        match self {
            UnOp::Neg => "neg",
            UnOp::Not => "not",
            UnOp::FNeg => "fneg",
            UnOp::IntToFloat => "itof",
            UnOp::FloatToInt => "ftoi",
            UnOp::BitsToFloat => "bits2f",
            UnOp::FloatToBits => "f2bits",
        }
    }
}

/// The target of a call.
#[derive(Clone, Debug, PartialEq)]
pub enum Callee {
    /// A function in the same unit.
    Func(FuncId),
    /// Host code at a fixed address.
    Addr(u64),
    /// The code address currently stored in a slot cell.
    Slot(u64),
    /// A code address held in a variable.
    Value(VarId),
}

impl fmt::Display for Callee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callee::Func(id) => write!(f, "fn{}", id.0),
            Callee::Addr(a) => write!(f, "@{:#x}", a),
            Callee::Slot(a) => write!(f, "slot[{:#x}]", a),
            Callee::Value(v) => write!(f, "*{}", v),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Inst {
    IConst { dest: VarId, value: i64 },
    FConst { dest: VarId, value: f64 },
    Move { dest: VarId, src: VarId },
    Bin { dest: VarId, op: BinOp, lhs: VarId, rhs: VarId },
    Un { dest: VarId, op: UnOp, arg: VarId },
    /// Load word `offset` of the heap value at `base`.
    Load { dest: VarId, base: VarId, offset: i32 },
    Store { base: VarId, offset: i32, value: VarId },
    /// Load the word at a fixed host address.
    LoadAbs { dest: VarId, addr: u64 },
    /// The code address of a function in this unit.
    FuncAddr { dest: VarId, func: FuncId },
    Call { dest: VarId, callee: Callee, args: Vec<VarId>, sig: Sig },
}

impl Inst {
    /// The variable written, if any.
    pub fn dest(&self) -> Option<VarId> {
        match self {
            Inst::IConst { dest, .. }
            | Inst::FConst { dest, .. }
            | Inst::Move { dest, .. }
            | Inst::Bin { dest, .. }
            | Inst::Un { dest, .. }
            | Inst::Load { dest, .. }
            | Inst::LoadAbs { dest, .. }
            | Inst::FuncAddr { dest, .. }
            | Inst::Call { dest, .. } => Some(*dest),
            Inst::Store { .. } => None,
        }
    }

    /// Rename every variable through `f`.
    pub fn map_vars(&self, f: &mut impl FnMut(VarId) -> VarId) -> Inst {
        match self {
            Inst::IConst { dest, value } => Inst::IConst { dest: f(*dest), value: *value },
            Inst::FConst { dest, value } => Inst::FConst { dest: f(*dest), value: *value },
            Inst::Move { dest, src } => Inst::Move { dest: f(*dest), src: f(*src) },
            Inst::Bin { dest, op, lhs, rhs } => Inst::Bin {
                dest: f(*dest),
                op: *op,
                lhs: f(*lhs),
                rhs: f(*rhs),
            },
            Inst::Un { dest, op, arg } => Inst::Un { dest: f(*dest), op: *op, arg: f(*arg) },
            Inst::Load { dest, base, offset } => Inst::Load {
                dest: f(*dest),
                base: f(*base),
                offset: *offset,
            },
            Inst::Store { base, offset, value } => Inst::Store {
                base: f(*base),
                offset: *offset,
                value: f(*value),
            },
            Inst::LoadAbs { dest, addr } => Inst::LoadAbs { dest: f(*dest), addr: *addr },
            Inst::FuncAddr { dest, func } => Inst::FuncAddr { dest: f(*dest), func: *func },
            Inst::Call { dest, callee, args, sig } => Inst::Call {
                dest: f(*dest),
                callee: match callee {
                    Callee::Value(v) => Callee::Value(f(*v)),
                    other => other.clone(),
                },
                args: args.iter().map(|a| f(*a)).collect(),
                sig: sig.clone(),
            },
        }
    }
}

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Inst::IConst { dest, value } => write!(f, "{} = iconst {}", dest, value),
            Inst::FConst { dest, value } => write!(f, "{} = fconst {:?}", dest, value),
            Inst::Move { dest, src } => write!(f, "{} = {}", dest, src),
            Inst::Bin { dest, op, lhs, rhs } => {
                write!(f, "{} = {} {}, {}", dest, op.mnemonic(), lhs, rhs)
            }
            Inst::Un { dest, op, arg } => write!(f, "{} = {} {}", dest, op.mnemonic(), arg),
            Inst::Load { dest, base, offset } => write!(f, "{} = load {}[{}]", dest, base, offset),
            Inst::Store { base, offset, value } => write!(f, "store {}[{}] = {}", base, offset, value),
            Inst::LoadAbs { dest, addr } => write!(f, "{} = load @{:#x}", dest, addr),
            Inst::FuncAddr { dest, func } => write!(f, "{} = addr fn{}", dest, func.0),
            Inst::Call { dest, callee, args, sig } => {
                write!(f, "{} = call {}(", dest, callee)?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", a)?;
                }
                write!(f, ") : {}", sig)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Terminator {
    Jump(BlockId),
    Branch { cond: VarId, then_block: BlockId, else_block: BlockId },
    Switch { value: VarId, cases: Vec<(i64, BlockId)>, default: BlockId },
    Return(VarId),
    /// Raise a fault and return a zero value.
    Fail(FaultKind),
    /// Return a zero value, leaving the pending fault of a callee in place.
    Unwind,
}

impl Terminator {
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::Jump(b) => vec![*b],
            Terminator::Branch { then_block, else_block, .. } => vec![*then_block, *else_block],
            Terminator::Switch { cases, default, .. } => {
                let mut out: Vec<BlockId> = cases.iter().map(|(_, b)| *b).collect();
                out.push(*default);
                out
            }
            Terminator::Return(_) | Terminator::Fail(_) | Terminator::Unwind => Vec::new(),
        }
    }
}

impl fmt::Display for Terminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Terminator::Jump(b) => write!(f, "jump {}", b),
            Terminator::Branch { cond, then_block, else_block } => {
                write!(f, "br {}, {}, {}", cond, then_block, else_block)
            }
            Terminator::Switch { value, cases, default } => {
                write!(f, "switch {} [", value)?;
                for (i, (k, b)) in cases.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{} => {}", k, b)?;
                }
                write!(f, "] else {}", default)
            }
            Terminator::Return(v) => write!(f, "ret {}", v),
            Terminator::Fail(kind) => write!(f, "fail {:?}", kind),
            Terminator::Unwind => write!(f, "unwind"),
        }
    }
}

// ── Functions and units ─────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    pub insts: Vec<Inst>,
    pub term: Terminator,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MirFunction {
    pub name: String,
    pub params: Vec<VarId>,
    pub ret: Repr,
    /// Representation of every variable, indexed by `VarId.0`.
    pub vars: Vec<Repr>,
    /// Blocks indexed by `BlockId.0`; block 0 is the entry.
    pub blocks: Vec<Block>,
}

impl MirFunction {
    pub fn sig(&self) -> Sig {
        Sig {
            params: self.params.iter().map(|p| self.repr(*p)).collect(),
            ret: self.ret,
        }
    }

    pub fn repr(&self, v: VarId) -> Repr {
        self.vars.get(v.0 as usize).copied().unwrap_or(Repr::Word)
    }

    pub fn inst_count(&self) -> usize {
        self.blocks.iter().map(|b| b.insts.len() + 1).sum()
    }

    pub fn calls(&self) -> impl Iterator<Item = &Callee> {
        self.blocks.iter().flat_map(|b| {
            b.insts.iter().filter_map(|i| match i {
                Inst::Call { callee, .. } => Some(callee),
                _ => None,
            })
        })
    }
}

impl fmt::Display for MirFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn {}(", self.name)?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", p, self.repr(*p))?;
        }
        writeln!(f, ") -> {} {{", self.ret)?;
        for (i, block) in self.blocks.iter().enumerate() {
            writeln!(f, "  b{}:", i)?;
            for inst in &block.insts {
                writeln!(f, "    {}", inst)?;
            }
            writeln!(f, "    {}", block.term)?;
        }
        writeln!(f, "}}")
    }
}

/// Everything compiled together: one entry point, its `invoke` trampoline
/// and the lifted functions they reference.
#[derive(Clone, Debug, PartialEq)]
pub struct MirUnit {
    pub name: String,
    pub functions: Vec<MirFunction>,
    pub entry: FuncId,
    pub invoke: FuncId,
}

impl MirUnit {
    pub fn function(&self, id: FuncId) -> Option<&MirFunction> {
        self.functions.get(id.0 as usize)
    }

    pub fn entry_function(&self) -> Option<&MirFunction> {
        self.function(self.entry)
    }
}

impl fmt::Display for MirUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "; unit {}", self.name)?;
        for (i, func) in self.functions.iter().enumerate() {
            write!(f, "; fn{}\n{}", i, func)?;
        }
        Ok(())
    }
}
