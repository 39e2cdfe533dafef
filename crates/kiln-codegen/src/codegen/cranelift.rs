//! Cranelift backend: one `JITModule` per unit, so units can be unmapped
//! independently.

use cranelift_codegen::ir::condcodes::{FloatCC, IntCC};
use cranelift_codegen::ir::{types, AbiParam, Block, Function, InstBuilder, MemFlags, Signature, Type, UserFuncName, Value};
use cranelift_codegen::isa::OwnedTargetIsa;
use cranelift_codegen::settings::{self, Configurable};
use cranelift_codegen::Context;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext, Switch, Variable};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{FuncId as ClifFuncId, Linkage, Module};
use rustc_hash::FxHashMap;

use kiln_rt::kiln_rt_fault;

use super::{Backend, CompiledFunction, CompiledUnit, UnitHandle};
use crate::error::BackendError;
use crate::mir::{BinOp, Callee, Inst, MirFunction, MirUnit, Repr, Sig, Terminator, UnOp, VarId};

const WORD: i32 = 8;

fn host_isa() -> Result<OwnedTargetIsa, BackendError> {
    let mut flags = settings::builder();
    flags
        .set("opt_level", "speed")
        .map_err(|e| BackendError::Isa(e.to_string()))?;
    cranelift_native::builder()
        .map_err(|e| BackendError::Isa(e.to_string()))?
        .finish(settings::Flags::new(flags))
        .map_err(|e| BackendError::Isa(e.to_string()))
}

fn clif_ty(repr: Repr) -> Type {
    match repr {
        Repr::Word => types::I64,
        Repr::Float => types::F64,
    }
}

fn signature(module: &JITModule, sig: &Sig) -> Signature {
    let mut s = module.make_signature();
    s.params.extend(sig.params.iter().map(|&r| AbiParam::new(clif_ty(r))));
    s.returns.push(AbiParam::new(clif_ty(sig.ret)));
    s
}

pub struct CraneliftBackend {
    units: FxHashMap<u64, JITModule>,
    next: u64,
    builder_ctx: FunctionBuilderContext,
}

impl CraneliftBackend {
    pub fn new() -> Result<Self, BackendError> {
        // Fail at construction on hosts Cranelift cannot target.
        host_isa()?;
        Ok(CraneliftBackend {
            units: FxHashMap::default(),
            next: 0,
            builder_ctx: FunctionBuilderContext::new(),
        })
    }

    fn define_all(
        &mut self,
        module: &mut JITModule,
        unit: &MirUnit,
    ) -> Result<(Vec<ClifFuncId>, Vec<Vec<u8>>), BackendError> {
        let mut ids = Vec::with_capacity(unit.functions.len());
        for (i, f) in unit.functions.iter().enumerate() {
            let sig = signature(module, &f.sig());
            let id = module
                .declare_function(&format!("{}.{}", f.name, i), Linkage::Local, &sig)
                .map_err(|e| BackendError::Compile {
                    function: f.name.clone(),
                    message: e.to_string(),
                })?;
            ids.push(id);
        }

        let mut code = Vec::with_capacity(ids.len());
        for (f, &id) in unit.functions.iter().zip(&ids) {
            let mut func = Function::with_name_signature(UserFuncName::user(0, id.as_u32()), signature(module, &f.sig()));
            Translator {
                module: &mut *module,
                ids: &ids,
                f,
                b: FunctionBuilder::new(&mut func, &mut self.builder_ctx),
                vars: Vec::with_capacity(f.vars.len()),
                blocks: Vec::with_capacity(f.blocks.len()),
            }
            .run();

            let mut ctx = Context::for_function(func);
            module
                .define_function(id, &mut ctx)
                .map_err(|e| BackendError::Compile {
                    function: f.name.clone(),
                    message: format!("{:?}", e),
                })?;
            code.push(
                ctx.compiled_code()
                    .map(|c| c.code_buffer().to_vec())
                    .unwrap_or_default(),
            );
        }
        module
            .finalize_definitions()
            .map_err(|e| BackendError::Link(e.to_string()))?;
        Ok((ids, code))
    }
}

impl Backend for CraneliftBackend {
    fn name(&self) -> &'static str {
        "cranelift"
    }

    fn compile(&mut self, unit: &MirUnit) -> Result<CompiledUnit, BackendError> {
        let mut module = JITModule::new(JITBuilder::with_isa(
            host_isa()?,
            cranelift_module::default_libcall_names(),
        ));
        let (ids, code) = match self.define_all(&mut module, unit) {
            Ok(defined) => defined,
            Err(e) => {
                // SAFETY: nothing from this module has been handed out.
                unsafe { module.free_memory() };
                return Err(e);
            }
        };

        let functions: Vec<CompiledFunction> = unit
            .functions
            .iter()
            .zip(&ids)
            .zip(code)
            .map(|((f, &id), code)| CompiledFunction {
                name: f.name.clone(),
                addr: module.get_finalized_function(id) as usize,
                code,
            })
            .collect();
        let addr_of = |i: u32| functions.get(i as usize).map(|f| f.addr);
        let (Some(entry), Some(invoke)) = (addr_of(unit.entry.0), addr_of(unit.invoke.0)) else {
            unsafe { module.free_memory() };
            return Err(BackendError::Link(format!("unit `{}` lacks its entry points", unit.name)));
        };

        let handle = UnitHandle(self.next);
        self.next += 1;
        self.units.insert(handle.0, module);
        tracing::debug!(unit = %unit.name, %handle, functions = functions.len(), "cranelift compiled unit");
        Ok(CompiledUnit {
            handle,
            entry,
            invoke,
            functions,
        })
    }

    fn release(&mut self, handle: UnitHandle) -> Result<(), BackendError> {
        let module = self
            .units
            .remove(&handle.0)
            .ok_or(BackendError::UnknownUnit(handle.0))?;
        // SAFETY: the caller guarantees no code from this unit runs again.
        unsafe { module.free_memory() };
        tracing::debug!(%handle, "cranelift released unit");
        Ok(())
    }

    fn live_units(&self) -> usize {
        self.units.len()
    }
}

impl Drop for CraneliftBackend {
    fn drop(&mut self) {
        for (_, module) in self.units.drain() {
            unsafe { module.free_memory() };
        }
    }
}

// ── MIR to CLIF ─────────────────────────────────────────────────────

struct Translator<'a, 'b> {
    module: &'a mut JITModule,
    ids: &'a [ClifFuncId],
    f: &'a MirFunction,
    b: FunctionBuilder<'b>,
    vars: Vec<Variable>,
    blocks: Vec<Block>,
}

impl Translator<'_, '_> {
    fn run(mut self) {
        let f = self.f;
        let prologue = self.b.create_block();
        self.b.append_block_params_for_function_params(prologue);
        for _ in &f.blocks {
            let block = self.b.create_block();
            self.blocks.push(block);
        }

        self.b.switch_to_block(prologue);
        for &repr in &f.vars {
            let var = self.b.declare_var(clif_ty(repr));
            let zero = self.zero(repr);
            self.b.def_var(var, zero);
            self.vars.push(var);
        }
        let params = self.b.block_params(prologue).to_vec();
        for (p, value) in f.params.iter().zip(params) {
            self.b.def_var(self.vars[p.0 as usize], value);
        }
        self.b.ins().jump(self.blocks[0], &[]);

        for (i, block) in f.blocks.iter().enumerate() {
            self.b.switch_to_block(self.blocks[i]);
            for inst in &block.insts {
                self.inst(inst);
            }
            self.terminator(&block.term);
        }
        self.b.seal_all_blocks();
        self.b.finalize();
    }

    fn zero(&mut self, repr: Repr) -> Value {
        match repr {
            Repr::Word => self.b.ins().iconst(types::I64, 0),
            Repr::Float => self.b.ins().f64const(0.0),
        }
    }

    fn get(&mut self, v: VarId) -> Value {
        self.b.use_var(self.vars[v.0 as usize])
    }

    fn set(&mut self, v: VarId, value: Value) {
        self.b.def_var(self.vars[v.0 as usize], value);
    }

    fn indirect(&mut self, sig: Signature, target: Value, args: &[Value]) -> cranelift_codegen::ir::Inst {
        let sig_ref = self.b.import_signature(sig);
        self.b.ins().call_indirect(sig_ref, target, args)
    }

    fn inst(&mut self, inst: &Inst) {
        match inst {
            Inst::IConst { dest, value } => {
                let v = self.b.ins().iconst(types::I64, *value);
                self.set(*dest, v);
            }
            Inst::FConst { dest, value } => {
                let v = self.b.ins().f64const(*value);
                self.set(*dest, v);
            }
            Inst::Move { dest, src } => {
                let v = self.get(*src);
                self.set(*dest, v);
            }
            Inst::Bin { dest, op, lhs, rhs } => {
                let (a, b) = (self.get(*lhs), self.get(*rhs));
                let v = self.binary(*op, a, b);
                self.set(*dest, v);
            }
            Inst::Un { dest, op, arg } => {
                let a = self.get(*arg);
                let v = self.unary(*op, a);
                self.set(*dest, v);
            }
            Inst::Load { dest, base, offset } => {
                let base = self.get(*base);
                let ty = clif_ty(self.f.repr(*dest));
                let v = self.b.ins().load(ty, MemFlags::trusted(), base, offset * WORD);
                self.set(*dest, v);
            }
            Inst::Store { base, offset, value } => {
                let base = self.get(*base);
                let value = self.get(*value);
                self.b.ins().store(MemFlags::trusted(), value, base, offset * WORD);
            }
            Inst::LoadAbs { dest, addr } => {
                let ptr = self.b.ins().iconst(types::I64, *addr as i64);
                let ty = clif_ty(self.f.repr(*dest));
                let v = self.b.ins().load(ty, MemFlags::trusted(), ptr, 0);
                self.set(*dest, v);
            }
            Inst::FuncAddr { dest, func } => {
                let func_ref = self.module.declare_func_in_func(self.ids[func.0 as usize], self.b.func);
                let v = self.b.ins().func_addr(types::I64, func_ref);
                self.set(*dest, v);
            }
            Inst::Call { dest, callee, args, sig } => {
                let args: Vec<Value> = args.iter().map(|a| self.get(*a)).collect();
                let call = match callee {
                    Callee::Func(id) => {
                        let func_ref = self.module.declare_func_in_func(self.ids[id.0 as usize], self.b.func);
                        self.b.ins().call(func_ref, &args)
                    }
                    Callee::Addr(addr) => {
                        let target = self.b.ins().iconst(types::I64, *addr as i64);
                        let sig = signature(self.module, sig);
                        self.indirect(sig, target, &args)
                    }
                    Callee::Slot(cell) => {
                        let cell = self.b.ins().iconst(types::I64, *cell as i64);
                        let target = self.b.ins().load(types::I64, MemFlags::trusted(), cell, 0);
                        let sig = signature(self.module, sig);
                        self.indirect(sig, target, &args)
                    }
                    Callee::Value(v) => {
                        let target = self.get(*v);
                        let sig = signature(self.module, sig);
                        self.indirect(sig, target, &args)
                    }
                };
                let result = self.b.inst_results(call)[0];
                self.set(*dest, result);
            }
        }
    }

    fn binary(&mut self, op: BinOp, a: Value, b: Value) -> Value {
        match op {
            BinOp::Add => self.b.ins().iadd(a, b),
            BinOp::Sub => self.b.ins().isub(a, b),
            BinOp::Mul => self.b.ins().imul(a, b),
            BinOp::Div => self.b.ins().sdiv(a, b),
            BinOp::Rem => self.b.ins().srem(a, b),
            BinOp::And => self.b.ins().band(a, b),
            BinOp::Or => self.b.ins().bor(a, b),
            BinOp::Xor => self.b.ins().bxor(a, b),
            BinOp::FAdd => self.b.ins().fadd(a, b),
            BinOp::FSub => self.b.ins().fsub(a, b),
            BinOp::FMul => self.b.ins().fmul(a, b),
            BinOp::FDiv => self.b.ins().fdiv(a, b),
            BinOp::Eq => self.icmp(IntCC::Equal, a, b),
            BinOp::Ne => self.icmp(IntCC::NotEqual, a, b),
            BinOp::Lt => self.icmp(IntCC::SignedLessThan, a, b),
            BinOp::Le => self.icmp(IntCC::SignedLessThanOrEqual, a, b),
            BinOp::Gt => self.icmp(IntCC::SignedGreaterThan, a, b),
            BinOp::Ge => self.icmp(IntCC::SignedGreaterThanOrEqual, a, b),
            BinOp::ULt => self.icmp(IntCC::UnsignedLessThan, a, b),
            BinOp::FEq => self.fcmp(FloatCC::Equal, a, b),
            BinOp::FNe => self.fcmp(FloatCC::NotEqual, a, b),
            BinOp::FLt => self.fcmp(FloatCC::LessThan, a, b),
            BinOp::FLe => self.fcmp(FloatCC::LessThanOrEqual, a, b),
            BinOp::FGt => self.fcmp(FloatCC::GreaterThan, a, b),
            BinOp::FGe => self.fcmp(FloatCC::GreaterThanOrEqual, a, b),
        }
    }

    /// Comparisons produce a 0/1 word.
    fn icmp(&mut self, cc: IntCC, a: Value, b: Value) -> Value {
        let flag = self.b.ins().icmp(cc, a, b);
        self.b.ins().uextend(types::I64, flag)
    }

    fn fcmp(&mut self, cc: FloatCC, a: Value, b: Value) -> Value {
        let flag = self.b.ins().fcmp(cc, a, b);
        self.b.ins().uextend(types::I64, flag)
    }

    fn unary(&mut self, op: UnOp, a: Value) -> Value {
        match op {
            UnOp::Neg => self.b.ins().ineg(a),
            UnOp::Not => {
                let flag = self.b.ins().icmp_imm(IntCC::Equal, a, 0);
                self.b.ins().uextend(types::I64, flag)
            }
            UnOp::FNeg => self.b.ins().fneg(a),
            UnOp::IntToFloat => self.b.ins().fcvt_from_sint(types::F64, a),
            UnOp::FloatToInt => self.b.ins().fcvt_to_sint_sat(types::I64, a),
            UnOp::BitsToFloat => self.b.ins().bitcast(types::F64, MemFlags::new(), a),
            UnOp::FloatToBits => self.b.ins().bitcast(types::I64, MemFlags::new(), a),
        }
    }

    fn terminator(&mut self, term: &Terminator) {
        match term {
            Terminator::Jump(target) => {
                self.b.ins().jump(self.blocks[target.0 as usize], &[]);
            }
            Terminator::Branch { cond, then_block, else_block } => {
                let cond = self.get(*cond);
                let (t, e) = (self.blocks[then_block.0 as usize], self.blocks[else_block.0 as usize]);
                self.b.ins().brif(cond, t, &[], e, &[]);
            }
            Terminator::Switch { value, cases, default } => {
                let value = self.get(*value);
                let mut switch = Switch::new();
                for (key, target) in cases {
                    switch.set_entry(*key as u64 as u128, self.blocks[target.0 as usize]);
                }
                switch.emit(&mut self.b, value, self.blocks[default.0 as usize]);
            }
            Terminator::Return(v) => {
                let v = self.get(*v);
                self.b.ins().return_(&[v]);
            }
            Terminator::Fail(kind) => {
                let mut sig = self.module.make_signature();
                sig.params.push(AbiParam::new(types::I64));
                let target = self.b.ins().iconst(types::I64, kiln_rt_fault as usize as i64);
                let code = self.b.ins().iconst(types::I64, kind.code() as i64);
                self.indirect(sig, target, &[code]);
                let ret = self.f.ret;
                let zero = self.zero(ret);
                self.b.ins().return_(&[zero]);
            }
            Terminator::Unwind => {
                let ret = self.f.ret;
                let zero = self.zero(ret);
                self.b.ins().return_(&[zero]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::{FnBuilder, FuncId};
    use kiln_rt::{take_fault, FaultKind};

    fn unit_of(functions: Vec<MirFunction>) -> MirUnit {
        MirUnit {
            name: "test".into(),
            functions,
            entry: FuncId(0),
            invoke: FuncId(0),
        }
    }

    #[test]
    fn compiles_and_runs_arithmetic() {
        let mut b = FnBuilder::new("inc", &[Repr::Word], Repr::Word);
        let x = b.params()[0];
        let one = b.iconst(1);
        let y = b.bin(BinOp::Add, x, one);
        b.ret(y);
        let mut backend = CraneliftBackend::new().unwrap();
        let compiled = backend.compile(&unit_of(vec![b.finish()])).unwrap();
        let inc: extern "C" fn(i64) -> i64 = unsafe { std::mem::transmute(compiled.entry) };
        assert_eq!(inc(41), 42);
        assert!(compiled.code_size() > 0);
        backend.release(compiled.handle).unwrap();
        assert_eq!(backend.live_units(), 0);
    }

    #[test]
    fn switch_dispatches_and_fail_raises() {
        let mut b = FnBuilder::new("pick", &[Repr::Word], Repr::Word);
        let x = b.params()[0];
        let ten = b.new_block();
        let twenty = b.new_block();
        let otherwise = b.new_block();
        b.switch(x, vec![(1, ten), (2, twenty)], otherwise);
        b.switch_to(ten);
        let v = b.iconst(10);
        b.ret(v);
        b.switch_to(twenty);
        let v = b.iconst(20);
        b.ret(v);
        b.switch_to(otherwise);
        b.fail(FaultKind::MatchFailure);

        let mut backend = CraneliftBackend::new().unwrap();
        let compiled = backend.compile(&unit_of(vec![b.finish()])).unwrap();
        let pick: extern "C" fn(i64) -> i64 = unsafe { std::mem::transmute(compiled.entry) };
        assert_eq!(pick(1), 10);
        assert_eq!(pick(2), 20);
        assert_eq!(take_fault(), None);
        assert_eq!(pick(3), 0);
        assert_eq!(take_fault(), Some(FaultKind::MatchFailure));
    }

    #[test]
    fn float_math_and_direct_calls() {
        let mut half = FnBuilder::new("half", &[Repr::Float], Repr::Float);
        let x = half.params()[0];
        let two = half.fconst(2.0);
        let y = half.bin(BinOp::FDiv, x, two);
        half.ret(y);

        let mut entry = FnBuilder::new("entry", &[Repr::Float], Repr::Float);
        let x = entry.params()[0];
        let sig = Sig {
            params: vec![Repr::Float],
            ret: Repr::Float,
        };
        let y = entry.call(Callee::Func(FuncId(1)), vec![x], sig);
        entry.ret(y);

        let mut backend = CraneliftBackend::new().unwrap();
        let compiled = backend
            .compile(&unit_of(vec![entry.finish(), half.finish()]))
            .unwrap();
        let f: extern "C" fn(f64) -> f64 = unsafe { std::mem::transmute(compiled.entry) };
        assert_eq!(f(5.0), 2.5);
    }

    #[test]
    fn releasing_twice_is_an_error() {
        let mut b = FnBuilder::new("zero", &[], Repr::Word);
        let z = b.iconst(0);
        b.ret(z);
        let mut backend = CraneliftBackend::new().unwrap();
        let compiled = backend.compile(&unit_of(vec![b.finish()])).unwrap();
        backend.release(compiled.handle).unwrap();
        assert_eq!(
            backend.release(compiled.handle),
            Err(BackendError::UnknownUnit(compiled.handle.0))
        );
    }
}
