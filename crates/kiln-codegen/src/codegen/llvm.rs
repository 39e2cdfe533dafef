//! LLVM backend through inkwell's MCJIT execution engine.
//!
//! Every unit gets its own module and execution engine; dropping the engine
//! unmaps the unit. Variables live in entry-block allocas and are promoted
//! by LLVM.

use std::fmt::Display;

use inkwell::basic_block::BasicBlock;
use inkwell::builder::Builder;
use inkwell::context::Context;
use inkwell::execution_engine::ExecutionEngine;
use inkwell::targets::{InitializationConfig, Target};
use inkwell::types::{BasicMetadataTypeEnum, BasicTypeEnum, FunctionType};
use inkwell::values::{BasicMetadataValueEnum, BasicValueEnum, FunctionValue, IntValue, PointerValue};
use inkwell::{AddressSpace, FloatPredicate, IntPredicate, OptimizationLevel};
use rustc_hash::FxHashMap;

use kiln_rt::kiln_rt_fault;

use super::{Backend, CompiledFunction, CompiledUnit, UnitHandle};
use crate::error::BackendError;
use crate::mir::{BinOp, Callee, Inst, MirFunction, MirUnit, Repr, Sig, Terminator, UnOp, VarId};

fn compile_error(function: &str, e: impl Display) -> BackendError {
    BackendError::Compile {
        function: function.to_string(),
        message: e.to_string(),
    }
}

pub struct LlvmBackend {
    /// Shared by every unit; lives as long as the process.
    context: &'static Context,
    units: FxHashMap<u64, ExecutionEngine<'static>>,
    next: u64,
}

impl LlvmBackend {
    pub fn new() -> Result<Self, BackendError> {
        Target::initialize_native(&InitializationConfig::default()).map_err(BackendError::Isa)?;
        ExecutionEngine::link_in_mc_jit();
        Ok(LlvmBackend {
            context: Box::leak(Box::new(Context::create())),
            units: FxHashMap::default(),
            next: 0,
        })
    }
}

impl Backend for LlvmBackend {
    fn name(&self) -> &'static str {
        "llvm"
    }

    fn compile(&mut self, unit: &MirUnit) -> Result<CompiledUnit, BackendError> {
        let context = self.context;
        let module = context.create_module(&unit.name);
        let builder = context.create_builder();

        let symbols: Vec<String> = unit
            .functions
            .iter()
            .enumerate()
            .map(|(i, f)| format!("{}.{}", f.name, i))
            .collect();
        let values: Vec<FunctionValue<'static>> = unit
            .functions
            .iter()
            .zip(&symbols)
            .map(|(f, sym)| module.add_function(sym, fn_type(context, &f.sig()), None))
            .collect();
        for (f, &value) in unit.functions.iter().zip(&values) {
            Emitter {
                context,
                builder: &builder,
                functions: &values,
                f,
                value,
                vars: Vec::new(),
                blocks: Vec::new(),
            }
            .run()
            .map_err(|e| compile_error(&f.name, e))?;
        }
        module
            .verify()
            .map_err(|e| compile_error(&unit.name, e.to_string()))?;

        let engine = module
            .create_jit_execution_engine(OptimizationLevel::Default)
            .map_err(|e| BackendError::Link(e.to_string()))?;
        let mut functions = Vec::with_capacity(symbols.len());
        for (f, sym) in unit.functions.iter().zip(&symbols) {
            let addr = engine
                .get_function_address(sym)
                .map_err(|e| BackendError::Link(format!("{}: {:?}", sym, e)))?;
            functions.push(CompiledFunction {
                name: f.name.clone(),
                addr,
                code: Vec::new(),
            });
        }
        let addr_of = |i: u32| functions.get(i as usize).map(|f| f.addr);
        let (Some(entry), Some(invoke)) = (addr_of(unit.entry.0), addr_of(unit.invoke.0)) else {
            return Err(BackendError::Link(format!("unit `{}` lacks its entry points", unit.name)));
        };

        let handle = UnitHandle(self.next);
        self.next += 1;
        self.units.insert(handle.0, engine);
        tracing::debug!(unit = %unit.name, %handle, "llvm compiled unit");
        Ok(CompiledUnit {
            handle,
            entry,
            invoke,
            functions,
        })
    }

    fn release(&mut self, handle: UnitHandle) -> Result<(), BackendError> {
        self.units
            .remove(&handle.0)
            .map(drop)
            .ok_or(BackendError::UnknownUnit(handle.0))
    }

    fn live_units(&self) -> usize {
        self.units.len()
    }
}

fn basic_type(context: &'static Context, repr: Repr) -> BasicTypeEnum<'static> {
    match repr {
        Repr::Word => context.i64_type().into(),
        Repr::Float => context.f64_type().into(),
    }
}

fn fn_type(context: &'static Context, sig: &Sig) -> FunctionType<'static> {
    let params: Vec<BasicMetadataTypeEnum> = sig.params.iter().map(|&r| basic_type(context, r).into()).collect();
    basic_type(context, sig.ret).fn_type(&params, false)
}

struct Emitter<'e> {
    context: &'static Context,
    builder: &'e Builder<'static>,
    functions: &'e [FunctionValue<'static>],
    f: &'e MirFunction,
    value: FunctionValue<'static>,
    vars: Vec<PointerValue<'static>>,
    blocks: Vec<BasicBlock<'static>>,
}

type Emit<T> = Result<T, String>;

impl Emitter<'_> {
    fn run(mut self) -> Emit<()> {
        let f = self.f;
        let prologue = self.context.append_basic_block(self.value, "entry");
        for i in 0..f.blocks.len() {
            let block = self.context.append_basic_block(self.value, &format!("b{}", i));
            self.blocks.push(block);
        }
        self.builder.position_at_end(prologue);
        for (i, &repr) in f.vars.iter().enumerate() {
            let ty = basic_type(self.context, repr);
            let slot = self.builder.build_alloca(ty, &format!("v{}", i)).map_err(|e| e.to_string())?;
            self.builder.build_store(slot, ty.const_zero()).map_err(|e| e.to_string())?;
            self.vars.push(slot);
        }
        for (p, value) in f.params.iter().zip(self.value.get_param_iter()) {
            self.set(*p, value)?;
        }
        self.builder.build_unconditional_branch(self.blocks[0]).map_err(|e| e.to_string())?;

        for (i, block) in f.blocks.iter().enumerate() {
            self.builder.position_at_end(self.blocks[i]);
            for inst in &block.insts {
                self.inst(inst)?;
            }
            self.terminator(&block.term)?;
        }
        Ok(())
    }

    fn get(&self, v: VarId) -> Emit<BasicValueEnum<'static>> {
        let ty = basic_type(self.context, self.f.repr(v));
        self.builder
            .build_load(ty, self.vars[v.0 as usize], "")
            .map_err(|e| e.to_string())
    }

    fn int(&self, v: VarId) -> Emit<IntValue<'static>> {
        Ok(self.get(v)?.into_int_value())
    }

    fn set(&self, v: VarId, value: BasicValueEnum<'static>) -> Emit<()> {
        self.builder
            .build_store(self.vars[v.0 as usize], value)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    fn word(&self, n: u64) -> IntValue<'static> {
        self.context.i64_type().const_int(n, false)
    }

    /// Pointer to word `offset` of the heap value at address `base`.
    fn address(&self, base: IntValue<'static>, offset: i32) -> Emit<PointerValue<'static>> {
        let i64 = self.context.i64_type();
        let delta = i64.const_int((offset as i64 * 8) as u64, true);
        let addr = self.builder.build_int_add(base, delta, "").map_err(|e| e.to_string())?;
        self.builder
            .build_int_to_ptr(addr, self.context.ptr_type(AddressSpace::default()), "")
            .map_err(|e| e.to_string())
    }

    fn call(&self, callee: &Callee, args: &[VarId], sig: &Sig) -> Emit<BasicValueEnum<'static>> {
        let args = args
            .iter()
            .map(|a| self.get(*a).map(BasicMetadataValueEnum::from))
            .collect::<Emit<Vec<_>>>()?;
        let target = match callee {
            Callee::Func(id) => {
                let site = self
                    .builder
                    .build_call(self.functions[id.0 as usize], &args, "")
                    .map_err(|e| e.to_string())?;
                return site
                    .try_as_basic_value()
                    .basic()
                    .ok_or_else(|| "call produced no value".to_string());
            }
            Callee::Addr(addr) => self.address(self.word(*addr), 0)?,
            Callee::Slot(cell) => {
                let cell = self.address(self.word(*cell), 0)?;
                let code = self
                    .builder
                    .build_load(self.context.i64_type(), cell, "")
                    .map_err(|e| e.to_string())?;
                self.address(code.into_int_value(), 0)?
            }
            Callee::Value(v) => self.address(self.int(*v)?, 0)?,
        };
        let site = self
            .builder
            .build_indirect_call(fn_type(self.context, sig), target, &args, "")
            .map_err(|e| e.to_string())?;
        site.try_as_basic_value()
            .basic()
            .ok_or_else(|| "call produced no value".to_string())
    }

    fn inst(&self, inst: &Inst) -> Emit<()> {
        let b = self.builder;
        let err = |e: inkwell::builder::BuilderError| e.to_string();
        match inst {
            Inst::IConst { dest, value } => self.set(*dest, self.word(*value as u64).into()),
            Inst::FConst { dest, value } => self.set(*dest, self.context.f64_type().const_float(*value).into()),
            Inst::Move { dest, src } => self.set(*dest, self.get(*src)?),
            Inst::Bin { dest, op, lhs, rhs } => {
                let v = self.binary(*op, self.get(*lhs)?, self.get(*rhs)?)?;
                self.set(*dest, v)
            }
            Inst::Un { dest, op, arg } => {
                let a = self.get(*arg)?;
                let i64 = self.context.i64_type();
                let f64 = self.context.f64_type();
                let v: BasicValueEnum = match op {
                    UnOp::Neg => b.build_int_neg(a.into_int_value(), "").map_err(err)?.into(),
                    UnOp::Not => {
                        let zero = self.word(0);
                        let flag = b.build_int_compare(IntPredicate::EQ, a.into_int_value(), zero, "").map_err(err)?;
                        b.build_int_z_extend(flag, i64, "").map_err(err)?.into()
                    }
                    UnOp::FNeg => b.build_float_neg(a.into_float_value(), "").map_err(err)?.into(),
                    UnOp::IntToFloat => b.build_signed_int_to_float(a.into_int_value(), f64, "").map_err(err)?.into(),
                    UnOp::FloatToInt => b.build_float_to_signed_int(a.into_float_value(), i64, "").map_err(err)?.into(),
                    UnOp::BitsToFloat => b.build_bit_cast(a, f64, "").map_err(err)?,
                    UnOp::FloatToBits => b.build_bit_cast(a, i64, "").map_err(err)?,
                };
                self.set(*dest, v)
            }
            Inst::Load { dest, base, offset } => {
                let ptr = self.address(self.int(*base)?, *offset)?;
                let ty = basic_type(self.context, self.f.repr(*dest));
                let v = b.build_load(ty, ptr, "").map_err(err)?;
                self.set(*dest, v)
            }
            Inst::Store { base, offset, value } => {
                let ptr = self.address(self.int(*base)?, *offset)?;
                b.build_store(ptr, self.get(*value)?).map_err(err)?;
                Ok(())
            }
            Inst::LoadAbs { dest, addr } => {
                let ptr = self.address(self.word(*addr), 0)?;
                let ty = basic_type(self.context, self.f.repr(*dest));
                let v = b.build_load(ty, ptr, "").map_err(err)?;
                self.set(*dest, v)
            }
            Inst::FuncAddr { dest, func } => {
                let ptr = self.functions[func.0 as usize].as_global_value().as_pointer_value();
                let v = b.build_ptr_to_int(ptr, self.context.i64_type(), "").map_err(err)?;
                self.set(*dest, v.into())
            }
            Inst::Call { dest, callee, args, sig } => {
                let v = self.call(callee, args, sig)?;
                self.set(*dest, v)
            }
        }
    }

    fn binary(&self, op: BinOp, l: BasicValueEnum<'static>, r: BasicValueEnum<'static>) -> Emit<BasicValueEnum<'static>> {
        let b = self.builder;
        let err = |e: inkwell::builder::BuilderError| e.to_string();
        let i64 = self.context.i64_type();
        if op.float_operands() {
            let (l, r) = (l.into_float_value(), r.into_float_value());
            let predicate = match op {
                BinOp::FAdd => return Ok(b.build_float_add(l, r, "").map_err(err)?.into()),
                BinOp::FSub => return Ok(b.build_float_sub(l, r, "").map_err(err)?.into()),
                BinOp::FMul => return Ok(b.build_float_mul(l, r, "").map_err(err)?.into()),
                BinOp::FDiv => return Ok(b.build_float_div(l, r, "").map_err(err)?.into()),
                BinOp::FEq => FloatPredicate::OEQ,
                BinOp::FNe => FloatPredicate::UNE,
                BinOp::FLt => FloatPredicate::OLT,
                BinOp::FLe => FloatPredicate::OLE,
                BinOp::FGt => FloatPredicate::OGT,
                _ => FloatPredicate::OGE,
            };
            let flag = b.build_float_compare(predicate, l, r, "").map_err(err)?;
            return Ok(b.build_int_z_extend(flag, i64, "").map_err(err)?.into());
        }
        let (l, r) = (l.into_int_value(), r.into_int_value());
        let predicate = match op {
            BinOp::Add => return Ok(b.build_int_add(l, r, "").map_err(err)?.into()),
            BinOp::Sub => return Ok(b.build_int_sub(l, r, "").map_err(err)?.into()),
            BinOp::Mul => return Ok(b.build_int_mul(l, r, "").map_err(err)?.into()),
            BinOp::Div => return Ok(b.build_int_signed_div(l, r, "").map_err(err)?.into()),
            BinOp::Rem => return Ok(b.build_int_signed_rem(l, r, "").map_err(err)?.into()),
            BinOp::And => return Ok(b.build_and(l, r, "").map_err(err)?.into()),
            BinOp::Or => return Ok(b.build_or(l, r, "").map_err(err)?.into()),
            BinOp::Xor => return Ok(b.build_xor(l, r, "").map_err(err)?.into()),
            BinOp::Eq => IntPredicate::EQ,
            BinOp::Ne => IntPredicate::NE,
            BinOp::Lt => IntPredicate::SLT,
            BinOp::Le => IntPredicate::SLE,
            BinOp::Gt => IntPredicate::SGT,
            BinOp::Ge => IntPredicate::SGE,
            BinOp::ULt => IntPredicate::ULT,
            other => return Err(format!("`{}` is not an integer operation", other.mnemonic())),
        };
        let flag = b.build_int_compare(predicate, l, r, "").map_err(err)?;
        Ok(b.build_int_z_extend(flag, i64, "").map_err(err)?.into())
    }

    fn terminator(&self, term: &Terminator) -> Emit<()> {
        let b = self.builder;
        let err = |e: inkwell::builder::BuilderError| e.to_string();
        match term {
            Terminator::Jump(target) => {
                b.build_unconditional_branch(self.blocks[target.0 as usize]).map_err(err)?;
            }
            Terminator::Branch { cond, then_block, else_block } => {
                let flag = b
                    .build_int_compare(IntPredicate::NE, self.int(*cond)?, self.word(0), "")
                    .map_err(err)?;
                b.build_conditional_branch(flag, self.blocks[then_block.0 as usize], self.blocks[else_block.0 as usize])
                    .map_err(err)?;
            }
            Terminator::Switch { value, cases, default } => {
                let cases: Vec<(IntValue, BasicBlock)> = cases
                    .iter()
                    .map(|(k, t)| (self.word(*k as u64), self.blocks[t.0 as usize]))
                    .collect();
                b.build_switch(self.int(*value)?, self.blocks[default.0 as usize], &cases)
                    .map_err(err)?;
            }
            Terminator::Return(v) => {
                b.build_return(Some(&self.get(*v)?)).map_err(err)?;
            }
            Terminator::Fail(kind) => {
                let fault_ty = self
                    .context
                    .void_type()
                    .fn_type(&[self.context.i64_type().into()], false);
                let target = self.address(self.word(kiln_rt_fault as usize as u64), 0)?;
                b.build_indirect_call(fault_ty, target, &[self.word(kind.code()).into()], "")
                    .map_err(err)?;
                let zero = basic_type(self.context, self.f.ret).const_zero();
                b.build_return(Some(&zero)).map_err(err)?;
            }
            Terminator::Unwind => {
                let zero = basic_type(self.context, self.f.ret).const_zero();
                b.build_return(Some(&zero)).map_err(err)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::{FnBuilder, FuncId};

    #[test]
    fn llvm_runs_arithmetic() {
        let mut b = FnBuilder::new("inc", &[Repr::Word], Repr::Word);
        let x = b.params()[0];
        let one = b.iconst(1);
        let y = b.bin(BinOp::Add, x, one);
        b.ret(y);
        let unit = MirUnit {
            name: "test".into(),
            functions: vec![b.finish()],
            entry: FuncId(0),
            invoke: FuncId(0),
        };
        let mut backend = LlvmBackend::new().unwrap();
        let compiled = backend.compile(&unit).unwrap();
        let inc: extern "C" fn(i64) -> i64 = unsafe { std::mem::transmute(compiled.entry) };
        assert_eq!(inc(1), 2);
        backend.release(compiled.handle).unwrap();
    }
}
