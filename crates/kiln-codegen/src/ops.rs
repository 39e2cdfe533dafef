//! Low-level operations emitted inline at their call sites.
//!
//! An op is a named, typed global whose body is a handful of MIR
//! instructions. Arithmetic, comparisons, conversions and array access
//! are all ops; hosts add their own through the compiler facade.

use std::fmt;
use std::sync::Arc;

use kiln_common::{Scheme, Ty, TyVar};
use kiln_rt::FaultKind;

use crate::error::LowerError;
use crate::layout::ELEMS_OFFSET;
use crate::mir::{BinOp, FnBuilder, Repr, UnOp, VarId};

/// An operation lowered directly into the calling function.
pub trait LowLevelOp: Send + Sync {
    fn name(&self) -> &str;

    /// The op's type. Quantified variables may only stand for values that
    /// the op moves around without inspecting.
    fn scheme(&self) -> Scheme;

    /// Emit the op over already-evaluated arguments. `ret` is the
    /// representation the call site expects back.
    fn emit(&self, b: &mut FnBuilder, ret: Repr, args: &[VarId]) -> Result<VarId, LowerError>;
}

impl fmt::Debug for dyn LowLevelOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LowLevelOp({}: {})", self.name(), self.scheme())
    }
}

fn arity_check(name: &str, args: &[VarId], n: usize) -> Result<(), LowerError> {
    if args.len() == n {
        Ok(())
    } else {
        Err(LowerError::Internal(format!(
            "op `{}` takes {} argument(s), got {}",
            name,
            n,
            args.len()
        )))
    }
}

/// A single binary MIR instruction.
pub struct BinaryOp {
    name: String,
    operand: Ty,
    result: Ty,
    op: BinOp,
}

impl BinaryOp {
    pub fn new(name: impl Into<String>, operand: Ty, result: Ty, op: BinOp) -> Self {
        BinaryOp {
            name: name.into(),
            operand,
            result,
            op,
        }
    }
}

impl LowLevelOp for BinaryOp {
    fn name(&self) -> &str {
        &self.name
    }

    fn scheme(&self) -> Scheme {
        Scheme::mono(Ty::fun(
            vec![self.operand.clone(), self.operand.clone()],
            self.result.clone(),
        ))
    }

    fn emit(&self, b: &mut FnBuilder, _ret: Repr, args: &[VarId]) -> Result<VarId, LowerError> {
        arity_check(&self.name, args, 2)?;
        Ok(b.bin(self.op, args[0], args[1]))
    }
}

/// A single unary MIR instruction.
pub struct UnaryOp {
    name: String,
    arg: Ty,
    result: Ty,
    op: Option<UnOp>,
}

impl UnaryOp {
    pub fn new(name: impl Into<String>, arg: Ty, result: Ty, op: UnOp) -> Self {
        UnaryOp {
            name: name.into(),
            arg,
            result,
            op: Some(op),
        }
    }

    /// An op that returns its argument unchanged, for conversions between
    /// types sharing a representation (`Char` to `Int`).
    pub fn identity(name: impl Into<String>, arg: Ty, result: Ty) -> Self {
        UnaryOp {
            name: name.into(),
            arg,
            result,
            op: None,
        }
    }
}

impl LowLevelOp for UnaryOp {
    fn name(&self) -> &str {
        &self.name
    }

    fn scheme(&self) -> Scheme {
        Scheme::mono(Ty::fun(vec![self.arg.clone()], self.result.clone()))
    }

    fn emit(&self, b: &mut FnBuilder, _ret: Repr, args: &[VarId]) -> Result<VarId, LowerError> {
        arity_check(&self.name, args, 1)?;
        Ok(match self.op {
            Some(op) => b.un(op, args[0]),
            None => args[0],
        })
    }
}

/// Signed integer division or remainder. A zero divisor raises
/// `DivideByZero`; `MIN / -1` wraps.
pub struct IntDivision {
    name: String,
    remainder: bool,
}

impl IntDivision {
    pub fn div(name: impl Into<String>) -> Self {
        IntDivision {
            name: name.into(),
            remainder: false,
        }
    }

    pub fn rem(name: impl Into<String>) -> Self {
        IntDivision {
            name: name.into(),
            remainder: true,
        }
    }
}

impl LowLevelOp for IntDivision {
    fn name(&self) -> &str {
        &self.name
    }

    fn scheme(&self) -> Scheme {
        Scheme::mono(Ty::fun(vec![Ty::int(), Ty::int()], Ty::int()))
    }

    fn emit(&self, b: &mut FnBuilder, _ret: Repr, args: &[VarId]) -> Result<VarId, LowerError> {
        arity_check(&self.name, args, 2)?;
        let (lhs, rhs) = (args[0], args[1]);
        let result = b.new_var(Repr::Word);

        let zero = b.iconst(0);
        let is_zero = b.bin(BinOp::Eq, rhs, zero);
        let fail = b.new_block();
        let nonzero = b.new_block();
        b.branch(is_zero, fail, nonzero);
        b.switch_to(fail);
        b.fail(FaultKind::DivideByZero);

        b.switch_to(nonzero);
        let minus_one = b.iconst(-1);
        let is_minus_one = b.bin(BinOp::Eq, rhs, minus_one);
        let negate = b.new_block();
        let divide = b.new_block();
        let join = b.new_block();
        b.branch(is_minus_one, negate, divide);

        b.switch_to(negate);
        let v = if self.remainder { b.iconst(0) } else { b.un(UnOp::Neg, lhs) };
        b.mov(result, v);
        b.jump(join);

        b.switch_to(divide);
        let op = if self.remainder { BinOp::Rem } else { BinOp::Div };
        let v = b.bin(op, lhs, rhs);
        b.mov(result, v);
        b.jump(join);

        b.switch_to(join);
        Ok(result)
    }
}

fn elem_var() -> Ty {
    Ty::Var(TyVar(0))
}

/// `length : [a] -> Int`.
pub struct ArrayLength;

impl LowLevelOp for ArrayLength {
    fn name(&self) -> &str {
        "length"
    }

    fn scheme(&self) -> Scheme {
        Scheme {
            vars: vec![TyVar(0)],
            preds: Vec::new(),
            ty: Ty::fun(vec![Ty::array(elem_var())], Ty::int()),
        }
    }

    fn emit(&self, b: &mut FnBuilder, _ret: Repr, args: &[VarId]) -> Result<VarId, LowerError> {
        arity_check("length", args, 1)?;
        Ok(b.load(args[0], 0, Repr::Word))
    }
}

/// `index : ([a], Int) -> a`, raising `IndexOutOfBounds` outside
/// `0..length`.
pub struct ArrayIndex;

impl LowLevelOp for ArrayIndex {
    fn name(&self) -> &str {
        "index"
    }

    fn scheme(&self) -> Scheme {
        Scheme {
            vars: vec![TyVar(0)],
            preds: Vec::new(),
            ty: Ty::fun(vec![Ty::array(elem_var()), Ty::int()], elem_var()),
        }
    }

    fn emit(&self, b: &mut FnBuilder, ret: Repr, args: &[VarId]) -> Result<VarId, LowerError> {
        arity_check("index", args, 2)?;
        let (array, i) = (args[0], args[1]);
        let len = b.load(array, 0, Repr::Word);
        // Unsigned compare also rejects negative indices.
        let in_bounds = b.bin(BinOp::ULt, i, len);
        let ok = b.new_block();
        let fail = b.new_block();
        b.branch(in_bounds, ok, fail);
        b.switch_to(fail);
        b.fail(FaultKind::IndexOutOfBounds);

        b.switch_to(ok);
        let eight = b.iconst(8);
        let scaled = b.bin(BinOp::Mul, i, eight);
        let addr = b.bin(BinOp::Add, array, scaled);
        Ok(b.load(addr, ELEMS_OFFSET, ret))
    }
}

/// The ops every compiler starts with.
pub fn builtin_ops() -> Vec<Arc<dyn LowLevelOp>> {
    let int = Ty::int;
    let float = Ty::float;
    let mut ops: Vec<Arc<dyn LowLevelOp>> = Vec::new();
    for (name, op) in [
        ("int_add", BinOp::Add),
        ("int_sub", BinOp::Sub),
        ("int_mul", BinOp::Mul),
    ] {
        ops.push(Arc::new(BinaryOp::new(name, int(), int(), op)));
    }
    ops.push(Arc::new(IntDivision::div("int_div")));
    ops.push(Arc::new(IntDivision::rem("int_rem")));
    for (name, op) in [
        ("float_add", BinOp::FAdd),
        ("float_sub", BinOp::FSub),
        ("float_mul", BinOp::FMul),
        ("float_div", BinOp::FDiv),
    ] {
        ops.push(Arc::new(BinaryOp::new(name, float(), float(), op)));
    }
    for (prefix, ty, ops_for) in [
        ("int", int(), [BinOp::Eq, BinOp::Lt, BinOp::Le]),
        ("char", Ty::char(), [BinOp::Eq, BinOp::Lt, BinOp::Le]),
        ("bool", Ty::bool(), [BinOp::Eq, BinOp::Lt, BinOp::Le]),
        ("float", float(), [BinOp::FEq, BinOp::FLt, BinOp::FLe]),
    ] {
        for (suffix, op) in ["eq", "lt", "le"].into_iter().zip(ops_for) {
            ops.push(Arc::new(BinaryOp::new(
                format!("{}_{}", prefix, suffix),
                ty.clone(),
                Ty::bool(),
                op,
            )));
        }
    }
    ops.push(Arc::new(UnaryOp::new("int_neg", int(), int(), UnOp::Neg)));
    ops.push(Arc::new(UnaryOp::new("float_neg", float(), float(), UnOp::FNeg)));
    ops.push(Arc::new(UnaryOp::new("not", Ty::bool(), Ty::bool(), UnOp::Not)));
    ops.push(Arc::new(UnaryOp::new("toFloat", int(), float(), UnOp::IntToFloat)));
    ops.push(Arc::new(UnaryOp::new("toInt", float(), int(), UnOp::FloatToInt)));
    ops.push(Arc::new(UnaryOp::identity("ord", Ty::char(), int())));
    ops.push(Arc::new(ArrayLength));
    ops.push(Arc::new(ArrayIndex));
    ops
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::Terminator;

    #[test]
    fn builtin_names_are_unique() {
        let ops = builtin_ops();
        let mut names: Vec<&str> = ops.iter().map(|o| o.name()).collect();
        let before = names.len();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), before);
        assert!(names.contains(&"toFloat"));
        assert!(names.contains(&"index"));
    }

    #[test]
    fn division_guards_zero() {
        let mut b = FnBuilder::new("div", &[Repr::Word, Repr::Word], Repr::Word);
        let args = b.params().to_vec();
        let q = IntDivision::div("int_div").emit(&mut b, Repr::Word, &args).unwrap();
        b.ret(q);
        let f = b.finish();
        assert!(f
            .blocks
            .iter()
            .any(|blk| blk.term == Terminator::Fail(FaultKind::DivideByZero)));
    }

    #[test]
    fn wrong_arity_is_internal_error() {
        let mut b = FnBuilder::new("f", &[Repr::Word], Repr::Word);
        let args = b.params().to_vec();
        let err = ArrayIndex.emit(&mut b, Repr::Word, &args).unwrap_err();
        assert!(err.to_string().contains("index"));
    }
}
