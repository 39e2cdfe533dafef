//! Unsweetened expression to MIR lowering.
//!
//! One call to [`lower_function`] produces one [`MirUnit`]: the entry
//! function with the host C ABI, an `invoke(args) -> word` trampoline, and
//! every function lifted out of the body.
//!
//! Nested lambdas are closure-converted: free locals are captured by value
//! into a `[code, capture..]` block and the lambda body is lifted into a
//! function taking that block as its first parameter. Globals never need
//! capturing; they are reached through the [`GlobalResolver`].

use std::sync::Arc;

use rustc_hash::FxHashMap;

use kiln_common::{Expr, ExprKind, Lit, MatchArm, Param, Pattern, Span, Ty};
use kiln_rt::kiln_rt_alloc;
use kiln_typeck::TypeRegistry;

use crate::error::LowerError;
use crate::layout::{Layouts, ELEMS_OFFSET, PAYLOAD_OFFSET};
use crate::mir::{Callee, FnBuilder, FuncId, MirFunction, MirUnit, Repr, Sig, UnOp, VarId};
use crate::ops::LowLevelOp;
use crate::pattern::{
    self, build_rows, choose_strategy, reach, ArmTarget, MatchHost, MatchOptions, MatchSite,
    UnreachableRow,
};

/// How a global name is reached from generated code.
#[derive(Clone)]
pub enum GlobalRef {
    /// A compiled function: the cell at `addr` holds its code address.
    Slot { addr: u64 },
    /// A value: the cell at `addr` holds it, read on every use.
    Cell { addr: u64 },
    /// A host function at a fixed address.
    Extern { addr: u64 },
    /// Emitted inline.
    Op(Arc<dyn LowLevelOp>),
    /// Declared, but no value exists yet.
    Unbound,
}

/// The compiler state lowering consults.
pub trait GlobalResolver {
    /// How to reach global `name` used at ground type `ty`, or `None` for
    /// an unknown name.
    fn resolve_global(&mut self, name: &str, ty: &Ty) -> Option<GlobalRef>;

    /// Address of the region passed to `kiln_rt_alloc`.
    fn region(&self) -> u64;

    /// Copy constant words into the region and return their address.
    fn store_words(&mut self, words: &[u64]) -> u64;
}

/// Lower a top-level definition or expression.
///
/// A lambda becomes an entry taking its parameters. Any other
/// function-typed expression is eta-expanded. Everything else becomes a
/// thunk with no parameters.
pub fn lower_function(
    registry: &TypeRegistry,
    host: &mut dyn GlobalResolver,
    options: &MatchOptions,
    name: &str,
    expr: &Expr,
) -> Result<MirUnit, LowerError> {
    let ty = expr_ty(expr)?.clone();
    let layouts = Layouts::new(registry);
    let (params, body) = match (&expr.kind, layouts.fun_parts(&ty)) {
        (ExprKind::Lambda(params, body), _) => (params.clone(), (**body).clone()),
        (_, Some((param_tys, ret))) => {
            let params: Vec<Param> = param_tys
                .iter()
                .enumerate()
                .map(|(i, t)| Param::typed(format!("arg{}", i), t.clone()))
                .collect();
            let args = params
                .iter()
                .map(|p| Expr::var(p.name.clone()).with_ty(p.ty.clone().unwrap_or_else(Ty::unit)))
                .collect();
            (params, Expr::app(expr.clone(), args).with_ty(ret).at(expr.span))
        }
        _ => (Vec::new(), expr.clone()),
    };
    tracing::debug!(name, params = params.len(), "lowering definition");

    let mut low = Lowering {
        layouts,
        host,
        options,
        unit: name.to_string(),
        functions: Vec::new(),
        adapters: FxHashMap::default(),
        counter: 0,
    };
    let entry = low.reserve();
    let entry_fn = low.function_body(name.to_string(), &params, &[], &body, false)?;
    low.define(entry, entry_fn);

    let entry_sig = low
        .functions
        .first()
        .and_then(|f| f.as_ref())
        .map(MirFunction::sig)
        .ok_or_else(|| LowerError::Internal("entry function missing".into()))?;
    let invoke = low.reserve();
    let invoke_fn = invoke_trampoline(&format!("{}$invoke", name), entry, &entry_sig);
    low.define(invoke, invoke_fn);

    let functions = low
        .functions
        .into_iter()
        .enumerate()
        .map(|(i, f)| f.ok_or_else(|| LowerError::Internal(format!("function #{} never defined", i))))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(MirUnit {
        name: name.to_string(),
        functions,
        entry,
        invoke,
    })
}

/// `invoke(args: *const word) -> word`: loads each parameter from `args`,
/// calls the entry, and returns floats as their bits.
fn invoke_trampoline(name: &str, entry: FuncId, sig: &Sig) -> MirFunction {
    let mut b = FnBuilder::new(name, &[Repr::Word], Repr::Word);
    let args_ptr = b.params()[0];
    let args = sig
        .params
        .iter()
        .enumerate()
        .map(|(i, &repr)| b.load(args_ptr, i as i32, repr))
        .collect();
    let result = b.call(Callee::Func(entry), args, sig.clone());
    let word = match sig.ret {
        Repr::Float => b.un(UnOp::FloatToBits, result),
        Repr::Word => result,
    };
    b.ret(word);
    b.finish()
}

fn expr_ty(e: &Expr) -> Result<&Ty, LowerError> {
    e.ty
        .as_ref()
        .ok_or_else(|| LowerError::Internal(format!("untyped expression `{}`", e)))
}

// ── Unit-wide state ─────────────────────────────────────────────────

struct Lowering<'a> {
    layouts: Layouts<'a>,
    host: &'a mut dyn GlobalResolver,
    options: &'a MatchOptions,
    unit: String,
    functions: Vec<Option<MirFunction>>,
    /// Closure adapters for globals used as values, by name and type.
    adapters: FxHashMap<(String, Ty), FuncId>,
    counter: usize,
}

impl<'a> Lowering<'a> {
    fn reserve(&mut self) -> FuncId {
        self.functions.push(None);
        FuncId(self.functions.len() as u32 - 1)
    }

    fn define(&mut self, id: FuncId, f: MirFunction) {
        self.functions[id.0 as usize] = Some(f);
    }

    fn fresh_name(&mut self, kind: &str) -> String {
        self.counter += 1;
        format!("{}${}{}", self.unit, kind, self.counter)
    }

    /// Lower a function body. Closures take their environment first and
    /// reload `captures` from it.
    fn function_body(
        &mut self,
        name: String,
        params: &[Param],
        captures: &[(String, Repr)],
        body: &Expr,
        closure: bool,
    ) -> Result<MirFunction, LowerError> {
        let mut reprs = Vec::with_capacity(params.len() + 1);
        if closure {
            reprs.push(Repr::Word);
        }
        for p in params {
            let ty = p
                .ty
                .as_ref()
                .ok_or_else(|| LowerError::Internal(format!("untyped parameter `{}`", p.name)))?;
            reprs.push(self.layouts.repr(ty));
        }
        let ret = self.layouts.repr(expr_ty(body)?);
        let b = FnBuilder::new(name, &reprs, ret);
        let param_vars = b.params().to_vec();
        let mut f = FnLower {
            low: self,
            b,
            scope: Vec::new(),
        };
        let mut vars = param_vars.into_iter();
        if closure {
            let env = vars.next().ok_or_else(|| LowerError::Internal("closure without env".into()))?;
            for (i, (cap, repr)) in captures.iter().enumerate() {
                let v = f.b.load(env, 1 + i as i32, *repr);
                f.scope.push((cap.clone(), v));
            }
        }
        for (p, v) in params.iter().zip(vars) {
            f.scope.push((p.name.clone(), v));
        }
        let result = f.expr(body)?;
        f.b.ret(result);
        Ok(f.b.finish())
    }

    /// A closure function for a global reached through `callee` or `op`.
    fn adapter(&mut self, name: &str, ty: &Ty, target: Target) -> Result<FuncId, LowerError> {
        let key = (name.to_string(), ty.clone());
        if let Some(&id) = self.adapters.get(&key) {
            return Ok(id);
        }
        let sig = self
            .layouts
            .closure_sig(ty)
            .ok_or_else(|| LowerError::Internal(format!("`{}` is not a function", name)))?;
        let id = self.reserve();
        let fn_name = self.fresh_name("adapter");
        let mut b = FnBuilder::new(fn_name, &sig.params, sig.ret);
        let args = b.params()[1..].to_vec();
        let result = match target {
            Target::Call(callee) => {
                let c_sig = Sig {
                    params: sig.params[1..].to_vec(),
                    ret: sig.ret,
                };
                b.call(callee, args, c_sig)
            }
            Target::Op(op) => op.emit(&mut b, sig.ret, &args)?,
        };
        b.ret(result);
        self.define(id, b.finish());
        self.adapters.insert(key, id);
        Ok(id)
    }
}

enum Target {
    Call(Callee),
    Op(Arc<dyn LowLevelOp>),
}

// ── Per-function lowering ───────────────────────────────────────────

struct FnLower<'l, 'a> {
    low: &'l mut Lowering<'a>,
    b: FnBuilder,
    /// Locals in scope, innermost last.
    scope: Vec<(String, VarId)>,
}

impl FnLower<'_, '_> {
    fn lookup(&self, name: &str) -> Option<VarId> {
        self.scope.iter().rev().find(|(n, _)| n == name).map(|(_, v)| *v)
    }

    fn repr(&self, ty: &Ty) -> Repr {
        self.low.layouts.repr(ty)
    }

    /// `kiln_rt_alloc(region, words)`.
    fn alloc(&mut self, words: usize) -> VarId {
        let region = self.b.iconst(self.low.host.region() as i64);
        let n = self.b.iconst(words as i64);
        self.b.call(
            Callee::Addr(kiln_rt_alloc as usize as u64),
            vec![region, n],
            Sig {
                params: vec![Repr::Word, Repr::Word],
                ret: Repr::Word,
            },
        )
    }

    /// A heap block holding `values` at words `0..`.
    fn block_of(&mut self, values: &[VarId]) -> VarId {
        let ptr = self.alloc(values.len().max(1));
        for (i, v) in values.iter().enumerate() {
            self.b.store(ptr, i as i32, *v);
        }
        ptr
    }

    fn exprs(&mut self, es: &[Expr]) -> Result<Vec<VarId>, LowerError> {
        es.iter().map(|e| self.expr(e)).collect()
    }

    fn expr(&mut self, e: &Expr) -> Result<VarId, LowerError> {
        let ty = expr_ty(e)?;
        match &e.kind {
            ExprKind::Lit(lit) => Ok(self.lit(lit)),
            ExprKind::Var(name) => match self.lookup(name) {
                Some(v) => Ok(v),
                None => self.global_value(name, ty),
            },
            ExprKind::App(f, args) => self.app(f, args, ty),
            ExprKind::Lambda(params, body) => self.lambda(params, body),
            ExprKind::Let(name, value, body) => {
                let v = self.expr(value)?;
                self.scope.push((name.clone(), v));
                let out = self.expr(body);
                self.scope.pop();
                out
            }
            ExprKind::LetRec(bindings, body) => self.letrec(bindings, body),
            ExprKind::If(c, t, f) => {
                let cond = self.expr(c)?;
                let repr = self.repr(ty);
                let result = self.b.new_var(repr);
                let then_block = self.b.new_block();
                let else_block = self.b.new_block();
                let join = self.b.new_block();
                self.b.branch(cond, then_block, else_block);
                for (block, arm) in [(then_block, t), (else_block, f)] {
                    self.b.switch_to(block);
                    let v = self.expr(arm)?;
                    self.b.mov(result, v);
                    self.b.jump(join);
                }
                self.b.switch_to(join);
                Ok(result)
            }
            ExprKind::Match(scrutinees, arms) => self.match_(scrutinees, arms, ty, e.span),
            ExprKind::Annot(inner, _) | ExprKind::Cast(inner, _) => self.expr(inner),
            ExprKind::Tuple(es) => {
                let vs = self.exprs(es)?;
                Ok(self.block_of(&vs))
            }
            ExprKind::Record(fields) => {
                let layout = self
                    .low
                    .layouts
                    .fields(ty)
                    .ok_or_else(|| LowerError::Internal(format!("`{}` is not a record", ty)))?;
                let mut vs = Vec::with_capacity(layout.len());
                for (fname, _) in &layout {
                    let value = fields
                        .iter()
                        .find(|(n, _)| Some(n.as_str()) == fname.as_deref())
                        .ok_or_else(|| {
                            LowerError::Internal(format!("record literal lacks field of `{}`", ty))
                        })?;
                    vs.push(self.expr(&value.1)?);
                }
                Ok(self.block_of(&vs))
            }
            ExprKind::Field(object, field) => {
                let object_ty = expr_ty(object)?;
                let (index, field_ty) = self.low.layouts.field(object_ty, field).ok_or_else(|| {
                    LowerError::Internal(format!("no field `{}` in `{}`", field, object_ty))
                })?;
                let base = self.expr(object)?;
                let repr = self.repr(&field_ty);
                Ok(self.b.load(base, index as i32, repr))
            }
            ExprKind::Ctor(name, payload) => {
                let (tag, _, _) = self.low.layouts.ctor(ty, name).ok_or_else(|| {
                    LowerError::Internal(format!("no constructor `{}` in `{}`", name, ty))
                })?;
                let value = match payload {
                    Some(p) => self.expr(p)?,
                    None => self.b.iconst(0),
                };
                let tag = self.b.iconst(tag as i64);
                let ptr = self.alloc(2);
                self.b.store(ptr, 0, tag);
                self.b.store(ptr, PAYLOAD_OFFSET, value);
                Ok(ptr)
            }
            ExprKind::Array(es) => {
                let vs = self.exprs(es)?;
                let len = self.b.iconst(vs.len() as i64);
                let ptr = self.alloc(1 + vs.len());
                self.b.store(ptr, 0, len);
                for (i, v) in vs.iter().enumerate() {
                    self.b.store(ptr, ELEMS_OFFSET + i as i32, *v);
                }
                Ok(ptr)
            }
        }
    }

    fn lit(&mut self, lit: &Lit) -> VarId {
        match lit {
            Lit::Unit => self.b.iconst(0),
            Lit::Bool(v) => self.b.iconst(*v as i64),
            Lit::Char(c) => self.b.iconst(*c as i64),
            Lit::Int(n) => self.b.iconst(*n),
            Lit::Float(x) => self.b.fconst(*x),
            Lit::Str(s) => {
                let mut words = vec![s.chars().count() as u64];
                words.extend(s.chars().map(|c| c as u64));
                let addr = self.low.host.store_words(&words);
                self.b.iconst(addr as i64)
            }
        }
    }

    fn resolve(&mut self, name: &str, ty: &Ty) -> Result<GlobalRef, LowerError> {
        self.low
            .host
            .resolve_global(name, ty)
            .ok_or_else(|| LowerError::UnknownGlobal { name: name.to_string() })
    }

    /// A global used as a value rather than called.
    fn global_value(&mut self, name: &str, ty: &Ty) -> Result<VarId, LowerError> {
        let is_fn = self.low.layouts.is_function(ty);
        let repr = self.repr(ty);
        let target = match self.resolve(name, ty)? {
            GlobalRef::Cell { addr } => return Ok(self.b.load_abs(addr, repr)),
            GlobalRef::Slot { addr } if is_fn => Target::Call(Callee::Slot(addr)),
            GlobalRef::Slot { addr } => return Ok(self.b.load_abs(addr, repr)),
            GlobalRef::Extern { addr } if is_fn => Target::Call(Callee::Addr(addr)),
            GlobalRef::Extern { addr } => return Ok(self.b.iconst(addr as i64)),
            GlobalRef::Op(op) if is_fn => Target::Op(op),
            GlobalRef::Op(op) => return op.emit(&mut self.b, repr, &[]),
            GlobalRef::Unbound => return Err(LowerError::UnboundValue { name: name.to_string() }),
        };
        let adapter = self.low.adapter(name, ty, target)?;
        let code = self.b.func_addr(adapter);
        Ok(self.block_of(&[code]))
    }

    fn app(&mut self, f: &Expr, args: &[Expr], ty: &Ty) -> Result<VarId, LowerError> {
        let fty = expr_ty(f)?;
        if let ExprKind::Var(name) = &f.kind {
            if self.lookup(name).is_none() {
                let callee = match self.resolve(name, fty)? {
                    GlobalRef::Slot { addr } => Some(Callee::Slot(addr)),
                    GlobalRef::Extern { addr } => Some(Callee::Addr(addr)),
                    GlobalRef::Op(op) => {
                        let vs = self.exprs(args)?;
                        let ret = self.repr(ty);
                        return op.emit(&mut self.b, ret, &vs);
                    }
                    GlobalRef::Unbound => {
                        return Err(LowerError::UnboundValue { name: name.clone() })
                    }
                    GlobalRef::Cell { .. } => None,
                };
                if let Some(callee) = callee {
                    let sig = self
                        .low
                        .layouts
                        .c_sig(fty)
                        .ok_or_else(|| LowerError::Internal(format!("`{}` is not a function", name)))?;
                    let vs = self.exprs(args)?;
                    return Ok(self.b.call(callee, vs, sig));
                }
            }
        }
        let sig = self
            .low
            .layouts
            .closure_sig(fty)
            .ok_or_else(|| LowerError::Internal(format!("`{}` is not a function", f)))?;
        let closure = self.expr(f)?;
        let mut vs = vec![closure];
        vs.extend(self.exprs(args)?);
        let code = self.b.load(closure, 0, Repr::Word);
        Ok(self.b.call(Callee::Value(code), vs, sig))
    }

    /// Locals of the current function that `params -> body` refers to.
    fn captures_of(&self, params: &[Param], body: &Expr) -> Vec<(String, VarId)> {
        let mut bound: Vec<String> = params.iter().map(|p| p.name.clone()).collect();
        let mut free = Vec::new();
        free_names(body, &mut bound, &mut free);
        free.into_iter()
            .filter_map(|n| self.lookup(&n).map(|v| (n, v)))
            .collect()
    }

    fn lift(&mut self, params: &[Param], body: &Expr, captures: &[(String, VarId)]) -> Result<FuncId, LowerError> {
        let cap_reprs: Vec<(String, Repr)> = captures
            .iter()
            .map(|(n, v)| (n.clone(), self.b.repr(*v)))
            .collect();
        let id = self.low.reserve();
        let name = self.low.fresh_name("lambda");
        let f = self.low.function_body(name, params, &cap_reprs, body, true)?;
        self.low.define(id, f);
        Ok(id)
    }

    fn lambda(&mut self, params: &[Param], body: &Expr) -> Result<VarId, LowerError> {
        let captures = self.captures_of(params, body);
        let id = self.lift(params, body, &captures)?;
        let code = self.b.func_addr(id);
        let mut words = vec![code];
        words.extend(captures.iter().map(|(_, v)| *v));
        Ok(self.block_of(&words))
    }

    /// Allocate every closure first so siblings can capture each other.
    fn letrec(&mut self, bindings: &[(String, Expr)], body: &Expr) -> Result<VarId, LowerError> {
        let depth = self.scope.len();
        let mut slots = Vec::with_capacity(bindings.len());
        for (name, _) in bindings {
            let v = self.b.new_var(Repr::Word);
            self.scope.push((name.clone(), v));
            slots.push(v);
        }
        let mut lifted = Vec::with_capacity(bindings.len());
        for (name, value) in bindings {
            let ExprKind::Lambda(params, fbody) = &value.kind else {
                return Err(LowerError::Internal(format!(
                    "recursive binding `{}` is not a function",
                    name
                )));
            };
            let captures = self.captures_of(params, fbody);
            let id = self.lift(params, fbody, &captures)?;
            lifted.push((id, captures));
        }
        for (slot, (_, captures)) in slots.iter().zip(&lifted) {
            let ptr = self.alloc(1 + captures.len());
            self.b.mov(*slot, ptr);
        }
        for (slot, (id, captures)) in slots.iter().zip(&lifted) {
            let code = self.b.func_addr(*id);
            self.b.store(*slot, 0, code);
            for (i, (_, v)) in captures.iter().enumerate() {
                self.b.store(*slot, 1 + i as i32, *v);
            }
        }
        let out = self.expr(body);
        self.scope.truncate(depth);
        out
    }

    fn match_(&mut self, scrutinees: &[Expr], arms: &[MatchArm], ty: &Ty, span: Span) -> Result<VarId, LowerError> {
        let columns = self.exprs(scrutinees)?;
        let column_tys = scrutinees
            .iter()
            .map(|s| expr_ty(s).cloned())
            .collect::<Result<Vec<_>, _>>()?;
        let all_rows = build_rows(&self.low.layouts, arms, &column_tys)?;

        let dead = reach::unreachable_rows(&all_rows);
        if let Some(&first) = dead.first() {
            let arm = all_rows[first].arm;
            if self.low.options.require_reachability {
                return Err(LowerError::UnreachableClause { arm });
            }
            tracing::debug!(?dead, "dropping unreachable match arms");
            if let Some(sink) = &self.low.options.unreachable_sink {
                let mut sink = sink.lock();
                for &i in &dead {
                    let arm = all_rows[i].arm;
                    sink.push(UnreachableRow {
                        arm,
                        pattern: render_patterns(&arms[arm].patterns),
                        span: if arms[arm].body.span.is_empty() { span } else { arms[arm].body.span },
                    });
                }
            }
        }
        let rows: Vec<_> = all_rows
            .into_iter()
            .enumerate()
            .filter(|(i, _)| !dead.contains(i))
            .map(|(_, r)| r)
            .collect();
        if !reach::is_exhaustive(&rows, columns.len()) {
            tracing::debug!(arms = rows.len(), "match is not exhaustive; uncovered values fault");
        }

        let mut targets = Vec::with_capacity(rows.len());
        let mut scopes: FxHashMap<usize, Vec<(String, VarId)>> = FxHashMap::default();
        for row in &rows {
            let mut binds = Vec::new();
            let mut names = Vec::new();
            for (name, path, repr) in row.bindings() {
                let v = self.b.new_var(repr);
                names.push((name, v));
                binds.push((v, path, repr));
            }
            scopes.insert(row.arm, names);
            targets.push(ArmTarget {
                binds,
                body: self.b.new_block(),
            });
        }

        let strategy = choose_strategy(self.low.options, &rows);
        let site = MatchSite {
            columns: &columns,
            rows: &rows,
            targets: &targets,
        };
        {
            let mut host = ArmHost {
                lower: self,
                arms,
                scopes: &scopes,
            };
            pattern::emit(&mut host, strategy, &site)?;
        }

        let repr = self.repr(ty);
        let result = self.b.new_var(repr);
        let join = self.b.new_block();
        for (row, target) in rows.iter().zip(&targets) {
            self.b.switch_to(target.body);
            let depth = self.scope.len();
            if let Some(names) = scopes.get(&row.arm) {
                self.scope.extend(names.iter().cloned());
            }
            let v = self.expr(&arms[row.arm].body);
            self.scope.truncate(depth);
            let v = v?;
            self.b.mov(result, v);
            self.b.jump(join);
        }
        self.b.switch_to(join);
        Ok(result)
    }
}

/// Guard lowering for the match strategies.
struct ArmHost<'h, 'l, 'a> {
    lower: &'h mut FnLower<'l, 'a>,
    arms: &'h [MatchArm],
    scopes: &'h FxHashMap<usize, Vec<(String, VarId)>>,
}

impl MatchHost for ArmHost<'_, '_, '_> {
    fn builder(&mut self) -> &mut FnBuilder {
        &mut self.lower.b
    }

    fn lower_guard(&mut self, arm: usize) -> Result<VarId, LowerError> {
        let guard = self.arms[arm]
            .guard
            .as_ref()
            .ok_or_else(|| LowerError::Internal(format!("arm {} has no guard", arm)))?;
        let depth = self.lower.scope.len();
        if let Some(names) = self.scopes.get(&arm) {
            self.lower.scope.extend(names.iter().cloned());
        }
        let out = self.lower.expr(guard);
        self.lower.scope.truncate(depth);
        out
    }

    fn alloc_words(&mut self, words: usize) -> VarId {
        self.lower.alloc(words)
    }

    fn store_words(&mut self, words: &[u64]) -> u64 {
        self.lower.low.host.store_words(words)
    }
}

fn render_patterns(patterns: &[Pattern]) -> String {
    patterns
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Names used in `e` but not bound inside it, in first-use order.
fn free_names(e: &Expr, bound: &mut Vec<String>, out: &mut Vec<String>) {
    match &e.kind {
        ExprKind::Lit(_) => {}
        ExprKind::Var(name) => {
            if !bound.contains(name) && !out.contains(name) {
                out.push(name.clone());
            }
        }
        ExprKind::App(f, args) => {
            free_names(f, bound, out);
            for a in args {
                free_names(a, bound, out);
            }
        }
        ExprKind::Lambda(params, body) => {
            let depth = bound.len();
            bound.extend(params.iter().map(|p| p.name.clone()));
            free_names(body, bound, out);
            bound.truncate(depth);
        }
        ExprKind::Let(name, value, body) => {
            free_names(value, bound, out);
            bound.push(name.clone());
            free_names(body, bound, out);
            bound.pop();
        }
        ExprKind::LetRec(bindings, body) => {
            let depth = bound.len();
            bound.extend(bindings.iter().map(|(n, _)| n.clone()));
            for (_, v) in bindings {
                free_names(v, bound, out);
            }
            free_names(body, bound, out);
            bound.truncate(depth);
        }
        ExprKind::If(c, t, f) => {
            free_names(c, bound, out);
            free_names(t, bound, out);
            free_names(f, bound, out);
        }
        ExprKind::Match(scrutinees, arms) => {
            for s in scrutinees {
                free_names(s, bound, out);
            }
            for arm in arms {
                let depth = bound.len();
                bound.extend(arm.patterns.iter().flat_map(|p| p.bound_names()));
                if let Some(g) = &arm.guard {
                    free_names(g, bound, out);
                }
                free_names(&arm.body, bound, out);
                bound.truncate(depth);
            }
        }
        ExprKind::Annot(inner, _) | ExprKind::Cast(inner, _) | ExprKind::Field(inner, _) => {
            free_names(inner, bound, out)
        }
        ExprKind::Tuple(es) | ExprKind::Array(es) => {
            for x in es {
                free_names(x, bound, out);
            }
        }
        ExprKind::Record(fields) => {
            for (_, x) in fields {
                free_names(x, bound, out);
            }
        }
        ExprKind::Ctor(_, payload) => {
            if let Some(p) = payload {
                free_names(p, bound, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::{Inst, Terminator};
    use crate::ops::builtin_ops;

    /// Resolves the builtin ops and a fixed set of slots.
    struct FakeHost {
        ops: FxHashMap<String, Arc<dyn LowLevelOp>>,
        slots: FxHashMap<String, u64>,
        stored: Vec<Vec<u64>>,
    }

    impl FakeHost {
        fn new() -> Self {
            FakeHost {
                ops: builtin_ops().into_iter().map(|o| (o.name().to_string(), o)).collect(),
                slots: FxHashMap::default(),
                stored: Vec::new(),
            }
        }
    }

    impl GlobalResolver for FakeHost {
        fn resolve_global(&mut self, name: &str, _ty: &Ty) -> Option<GlobalRef> {
            if let Some(op) = self.ops.get(name) {
                return Some(GlobalRef::Op(op.clone()));
            }
            self.slots.get(name).map(|&addr| GlobalRef::Slot { addr })
        }

        fn region(&self) -> u64 {
            0x1000
        }

        fn store_words(&mut self, words: &[u64]) -> u64 {
            self.stored.push(words.to_vec());
            0x2000 + self.stored.len() as u64
        }
    }

    fn typed(e: Expr, ty: Ty) -> Expr {
        e.with_ty(ty)
    }

    fn int_var(name: &str) -> Expr {
        typed(Expr::var(name), Ty::int())
    }

    fn add(a: Expr, b: Expr) -> Expr {
        let op = typed(Expr::var("int_add"), Ty::fun(vec![Ty::int(), Ty::int()], Ty::int()));
        typed(Expr::app(op, vec![a, b]), Ty::int())
    }

    fn lower(expr: &Expr) -> Result<MirUnit, LowerError> {
        let registry = TypeRegistry::new();
        let mut host = FakeHost::new();
        lower_function(&registry, &mut host, &MatchOptions::default(), "f", expr)
    }

    #[test]
    fn increment_lowers_to_one_add() {
        let lam = typed(
            Expr::lambda(vec![Param::typed("x", Ty::int())], add(int_var("x"), typed(Expr::int(1), Ty::int()))),
            Ty::fun(vec![Ty::int()], Ty::int()),
        );
        let unit = lower(&lam).unwrap();
        assert_eq!(unit.functions.len(), 2);
        insta::assert_snapshot!(unit.functions[0].to_string(), @r"
        fn f(v0: i64) -> i64 {
          b0:
            v1 = iconst 1
            v2 = add v0, v1
            ret v2
        }
        ");
        let invoke = unit.function(unit.invoke).unwrap();
        assert!(matches!(
            invoke.blocks[0].insts.last(),
            Some(Inst::Call { callee: Callee::Func(FuncId(0)), .. })
        ));
    }

    #[test]
    fn nested_lambda_captures_free_locals() {
        let inner_ty = Ty::fun(vec![Ty::int()], Ty::int());
        let inner = typed(
            Expr::lambda(vec![Param::typed("y", Ty::int())], add(int_var("x"), int_var("y"))),
            inner_ty.clone(),
        );
        let outer = typed(
            Expr::lambda(vec![Param::typed("x", Ty::int())], inner),
            Ty::fun(vec![Ty::int()], inner_ty),
        );
        let unit = lower(&outer).unwrap();
        // entry, lifted lambda, invoke
        assert_eq!(unit.functions.len(), 3);
        let lifted = &unit.functions[1];
        assert_eq!(lifted.params.len(), 2);
        assert!(matches!(
            lifted.blocks[0].insts[0],
            Inst::Load { offset: 1, .. }
        ));
    }

    #[test]
    fn unknown_global_is_reported() {
        let lam = typed(
            Expr::lambda(vec![Param::typed("x", Ty::int())], int_var("nowhere")),
            Ty::fun(vec![Ty::int()], Ty::int()),
        );
        assert_eq!(
            lower(&lam).unwrap_err(),
            LowerError::UnknownGlobal {
                name: "nowhere".into()
            }
        );
    }

    #[test]
    fn float_thunk_returns_bits_through_invoke() {
        let unit = lower(&typed(Expr::float(2.5), Ty::float())).unwrap();
        let entry = unit.entry_function().unwrap();
        assert!(entry.params.is_empty());
        assert_eq!(entry.ret, Repr::Float);
        let invoke = unit.function(unit.invoke).unwrap();
        assert!(invoke.blocks[0]
            .insts
            .iter()
            .any(|i| matches!(i, Inst::Un { op: UnOp::FloatToBits, .. })));
    }

    #[test]
    fn required_reachability_rejects_subsumed_arm() {
        let scrutinee = int_var("x");
        let m = typed(
            Expr::match_(
                vec![scrutinee],
                vec![
                    MatchArm::new(vec![Pattern::Wildcard], typed(Expr::int(0), Ty::int())),
                    MatchArm::new(vec![Pattern::int(1)], typed(Expr::int(1), Ty::int())),
                ],
            ),
            Ty::int(),
        );
        let lam = typed(
            Expr::lambda(vec![Param::typed("x", Ty::int())], m),
            Ty::fun(vec![Ty::int()], Ty::int()),
        );
        let registry = TypeRegistry::new();
        let mut host = FakeHost::new();
        let options = MatchOptions {
            require_reachability: true,
            ..MatchOptions::default()
        };
        let err = lower_function(&registry, &mut host, &options, "f", &lam).unwrap_err();
        assert_eq!(err, LowerError::UnreachableClause { arm: 1 });

        let sink = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let options = MatchOptions {
            unreachable_sink: Some(sink.clone()),
            ..MatchOptions::default()
        };
        let unit = lower_function(&registry, &mut host, &options, "f", &lam).unwrap();
        assert_eq!(sink.lock().len(), 1);
        assert_eq!(sink.lock()[0].pattern, "1");
        // The surviving wildcard arm needs no test at all.
        let entry = unit.entry_function().unwrap();
        assert!(!entry
            .blocks
            .iter()
            .any(|b| matches!(b.term, Terminator::Branch { .. })));
    }

    #[test]
    fn string_literal_is_stored_once() {
        let registry = TypeRegistry::new();
        let mut host = FakeHost::new();
        let e = typed(Expr::str("hi"), Ty::string());
        lower_function(&registry, &mut host, &MatchOptions::default(), "s", &e).unwrap();
        assert_eq!(host.stored, vec![vec![2, 'h' as u64, 'i' as u64]]);
    }

    #[test]
    fn free_names_skip_bound_ones() {
        let e = Expr::lam(&["a"], Expr::binop("+", Expr::var("a"), Expr::var("b")));
        let mut out = Vec::new();
        free_names(&e, &mut Vec::new(), &mut out);
        assert_eq!(out, vec!["+".to_string(), "b".to_string()]);
    }
}
