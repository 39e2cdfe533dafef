//! Unsweetening, residual draining, linking and invocation.

use std::collections::VecDeque;

use kiln_codegen::{lower_function, Layouts, MirUnit};
use kiln_common::{Expr, ExprKind, MatchArm, Module, ModuleItem, Param, QualType, Ty};
use kiln_jit::{ArtifactId, JitError};
use kiln_typeck::{GlobalBinding, GlobalKind, Residual, TypeError, TypeRegistry, Unsweetener, MAX_DRAIN_DEPTH};

use super::globals::Linker;
use super::{ArtifactSig, Compiler};
use crate::args::ArgList;
use crate::error::CompileError;
use crate::lift::HostFn;
use crate::value::Value;

/// A compiled function, typed as the host function pointer `F`.
#[derive(Debug)]
pub struct CompiledFn<F> {
    id: ArtifactId,
    func: F,
}

impl<F: Copy> CompiledFn<F> {
    pub fn id(&self) -> ArtifactId {
        self.id
    }

    /// # Safety
    ///
    /// The pointer is valid until the artifact is released with
    /// [`Compiler::release_machine_code`] or its compiler is dropped.
    pub unsafe fn get(&self) -> F {
        self.func
    }
}

/// Expand aliases in every type written into `e`.
fn expand_annotations(registry: &TypeRegistry, e: &Expr) -> Result<Expr, TypeError> {
    let each = |es: &[Expr]| -> Result<Vec<Expr>, TypeError> {
        es.iter().map(|e| expand_annotations(registry, e)).collect()
    };
    let boxed = |e: &Expr| expand_annotations(registry, e).map(Box::new);
    let kind = match &e.kind {
        ExprKind::Lit(_) | ExprKind::Var(_) => e.kind.clone(),
        ExprKind::App(f, args) => ExprKind::App(boxed(f)?, each(args)?),
        ExprKind::Lambda(params, body) => {
            let params = params
                .iter()
                .map(|p| {
                    Ok(Param {
                        name: p.name.clone(),
                        ty: p.ty.as_ref().map(|t| registry.expand_aliases(t)).transpose()?,
                    })
                })
                .collect::<Result<Vec<_>, TypeError>>()?;
            ExprKind::Lambda(params, boxed(body)?)
        }
        ExprKind::Let(name, value, body) => ExprKind::Let(name.clone(), boxed(value)?, boxed(body)?),
        ExprKind::LetRec(bindings, body) => {
            let bindings = bindings
                .iter()
                .map(|(n, v)| Ok((n.clone(), expand_annotations(registry, v)?)))
                .collect::<Result<Vec<_>, TypeError>>()?;
            ExprKind::LetRec(bindings, boxed(body)?)
        }
        ExprKind::If(c, t, f) => ExprKind::If(boxed(c)?, boxed(t)?, boxed(f)?),
        ExprKind::Match(scrutinees, arms) => {
            let arms = arms
                .iter()
                .map(|arm| {
                    Ok(MatchArm {
                        patterns: arm.patterns.clone(),
                        guard: arm.guard.as_ref().map(|g| expand_annotations(registry, g)).transpose()?,
                        body: expand_annotations(registry, &arm.body)?,
                    })
                })
                .collect::<Result<Vec<_>, TypeError>>()?;
            ExprKind::Match(each(scrutinees)?, arms)
        }
        ExprKind::Annot(inner, ty) => ExprKind::Annot(boxed(inner)?, registry.expand_aliases(ty)?),
        ExprKind::Tuple(es) => ExprKind::Tuple(each(es)?),
        ExprKind::Record(fields) => ExprKind::Record(
            fields
                .iter()
                .map(|(n, v)| Ok((n.clone(), expand_annotations(registry, v)?)))
                .collect::<Result<Vec<_>, TypeError>>()?,
        ),
        ExprKind::Field(object, field) => ExprKind::Field(boxed(object)?, field.clone()),
        ExprKind::Ctor(name, payload) => {
            ExprKind::Ctor(name.clone(), payload.as_deref().map(boxed).transpose()?)
        }
        ExprKind::Array(es) => ExprKind::Array(each(es)?),
        ExprKind::Cast(inner, ty) => ExprKind::Cast(boxed(inner)?, registry.expand_aliases(ty)?),
    };
    Ok(Expr {
        kind,
        ty: e.ty.clone(),
        span: e.span,
    })
}

impl Compiler {
    pub(super) fn unsweetener(&mut self) -> Unsweetener<'_> {
        Unsweetener::new(
            &self.registry,
            &self.graph,
            &mut self.env,
            &self.classes,
            &mut self.residuals,
        )
    }

    // ── Unsweetening ────────────────────────────────────────────────────

    /// Unsweeten `expr` and compile every residual it needs.
    pub fn unsweeten_expression(&mut self, expr: &Expr) -> Result<Expr, CompileError> {
        self.transaction("unsweeten", |c| {
            let out = c.unsweetener().unsweeten_expression(expr)?;
            c.drain_unqualify_defs()?;
            Ok(out)
        })
    }

    /// As [`unsweeten_expression`], with `name` referring to the expression
    /// itself.
    ///
    /// [`unsweeten_expression`]: Compiler::unsweeten_expression
    pub fn unsweeten_expression_named(&mut self, name: &str, expr: &Expr) -> Result<Expr, CompileError> {
        self.transaction("unsweeten", |c| {
            let out = c.unsweetener().unsweeten_expression_named(name, expr, None)?;
            c.drain_unqualify_defs()?;
            Ok(out)
        })
    }

    /// Expand aliases in annotations, casts and parameter types, then
    /// unsweeten.
    pub fn normalize(&mut self, expr: &Expr) -> Result<Expr, CompileError> {
        let expanded = expand_annotations(&self.registry, expr)?;
        self.unsweeten_expression(&expanded)
    }

    /// Compile and bind every queued residual definition, including those
    /// queued while doing so. Returns how many were bound; zero when a
    /// drain is already running further up the stack.
    pub fn drain_unqualify_defs(&mut self) -> Result<usize, CompileError> {
        if self.residuals.draining || self.residuals.is_empty() {
            return Ok(0);
        }
        self.residuals.draining = true;
        let result = self.drain_queue();
        self.residuals.draining = false;
        let count = result?;
        self.last_drain += count;
        tracing::debug!(count, "drained residuals");
        Ok(count)
    }

    fn drain_queue(&mut self) -> Result<usize, CompileError> {
        let mut pending: VecDeque<(Residual, usize)> = VecDeque::new();
        while let Some(residual) = self.residuals.pop() {
            pending.push_back((residual, 0));
        }
        let mut ready = Vec::new();
        while let Some((residual, depth)) = pending.pop_front() {
            if depth > MAX_DRAIN_DEPTH {
                return Err(CompileError::InternalError(format!(
                    "residual `{}` is nested more than {} deep",
                    residual.name, MAX_DRAIN_DEPTH
                )));
            }
            let expr = {
                let _span = tracing::debug_span!("drain", name = %residual.name, depth).entered();
                self.unsweetener().unsweeten_residual(&residual)?
            };
            while let Some(next) = self.residuals.pop() {
                pending.push_back((next, depth + 1));
            }
            ready.push((residual.name, expr));
        }
        // Later residuals are dependencies of earlier ones.
        let count = ready.len();
        for (name, expr) in ready.into_iter().rev() {
            self.link_definition(&name, &expr)?;
        }
        Ok(count)
    }

    // ── Linking ─────────────────────────────────────────────────────────

    fn lower_and_compile(&mut self, name: &str, expr: &Expr) -> Result<ArtifactId, CompileError> {
        let options = self.config.match_options(self.unreachable_sink.as_ref());
        let unit = {
            let mut linker = Linker {
                registry: &self.registry,
                env: &self.env,
                globals: &mut self.globals,
                ops: &self.ops,
                region: &self.region,
            };
            lower_function(&self.registry, &mut linker, &options, name, expr)?
        };
        self.jit.set_inlining(self.config.enable_module_inlining);
        let id = self.jit.compile(unit)?;
        let ty = expr.ty().cloned().unwrap_or_else(Ty::unit);
        let (params, ret) = Layouts::new(&self.registry)
            .fun_parts(&ty)
            .unwrap_or_else(|| (Vec::new(), ty));
        self.signatures.push(ArtifactSig { params, ret });
        Ok(id)
    }

    /// Compile an unsweetened definition and give `name` its value.
    fn link_definition(&mut self, name: &str, expr: &Expr) -> Result<(), CompileError> {
        let ty = expr
            .ty()
            .cloned()
            .ok_or_else(|| CompileError::InternalError(format!("`{}` reached linking untyped", name)))?;
        let id = self.lower_and_compile(name, expr)?;
        if Layouts::new(&self.registry).is_function(&ty) {
            let code = self.jit.entry(id)? as u64;
            let cell = self.globals.bind_function(name, &self.region, code);
            if self.config.enable_module_inlining {
                let body = self.jit.module().last().and_then(MirUnit::entry_function).cloned();
                if let Some(body) = body {
                    self.jit.offer_inline(cell, &body);
                }
            }
            tracing::debug!(name, %id, "linked function");
        } else {
            // SAFETY: a thunk takes no arguments.
            let word = unsafe { self.jit.invoke_raw(id, &[]) }?;
            self.globals.bind_value(name, &self.region, word);
            tracing::debug!(name, %id, "linked value");
        }
        self.env.define(name, &ty);
        Ok(())
    }

    // ── Definitions ─────────────────────────────────────────────────────

    /// Define global `name`. A generic definition is kept as source and
    /// specialised at each use; anything else is compiled now.
    pub fn define(&mut self, name: &str, expr: &Expr) -> Result<(), CompileError> {
        let _span = tracing::debug_span!("define", name).entered();
        self.transaction("define", |c| c.define_now(name, expr))
    }

    fn define_now(&mut self, name: &str, expr: &Expr) -> Result<(), CompileError> {
        let expected = match self.env.lookup_global(name) {
            Some(b) if b.has_value() => {
                return Err(CompileError::DuplicateDefinition {
                    what: "value",
                    name: name.to_string(),
                })
            }
            Some(b) => Some(b.scheme.ty.clone()),
            None => None,
        };
        let mut inferred = self
            .unsweetener()
            .infer_definition(Some(name), expr, expected.as_ref())?;
        let scheme = inferred.generalize();
        if !scheme.is_mono() {
            tracing::debug!(name, scheme = %scheme, "kept generic");
            self.env.bind(
                name,
                GlobalBinding {
                    scheme,
                    kind: GlobalKind::Poly(expr.clone()),
                },
            );
            self.search_cache.clear();
            return Ok(());
        }
        let elaborated = self.unsweetener().elaborate(inferred, Some(name))?;
        if expected.is_none() {
            let ty = elaborated.ty().cloned().unwrap_or_else(Ty::unit);
            self.env.forward_declare(name, &QualType::mono(ty));
        }
        self.drain_unqualify_defs()?;
        self.link_definition(name, &elaborated)?;
        self.search_cache.clear();
        Ok(())
    }

    pub fn define_text(&mut self, name: &str, text: &str) -> Result<(), CompileError> {
        let expr = self.read_expr(text)?;
        self.define(name, &expr)
    }

    /// Process every item of `module` in order, as one transaction.
    pub fn define_module(&mut self, module: &Module) -> Result<(), CompileError> {
        self.transaction("define_module", |c| {
            for item in &module.items {
                match item {
                    ModuleItem::Define { name, expr } => c.define(name, expr)?,
                    ModuleItem::TypeAlias { name, args, ty } => {
                        let args = args.iter().map(String::as_str).collect::<Vec<_>>();
                        c.define_type_alias(name, &args, ty)?;
                    }
                    ModuleItem::NamedType { name, args, ty } => {
                        let args = args.iter().map(String::as_str).collect::<Vec<_>>();
                        c.define_named_type(name, &args, ty)?;
                    }
                    ModuleItem::Class(class) => c.define_class(class.clone())?,
                    ModuleItem::Instance(inst) => c.add_instance(inst.clone())?,
                }
            }
            Ok(())
        })
    }

    // ── Compilation ─────────────────────────────────────────────────────

    fn compile_anonymous(&mut self, expr: &Expr, expected: Option<&Ty>) -> Result<ArtifactId, CompileError> {
        let inferred = self.unsweetener().infer_definition(None, expr, expected)?;
        let elaborated = self.unsweetener().elaborate(inferred, None)?;
        self.drain_unqualify_defs()?;
        self.anon_count += 1;
        let name = format!("expr{}", self.anon_count);
        self.lower_and_compile(&name, &elaborated)
    }

    /// Compile `expr` on its own. A function compiles to an entry taking
    /// its parameters, anything else to a thunk.
    pub fn compile_expr(&mut self, expr: &Expr) -> Result<ArtifactId, CompileError> {
        self.transaction("compile_expr", |c| c.compile_anonymous(expr, None))
    }

    /// Compile `body` as a function of `names` typed `arg_tys -> ret`.
    /// The returned pointer is a C-ABI entry with that signature.
    pub fn unsafe_compile_fn(
        &mut self,
        ret: &Ty,
        names: &ArgList,
        arg_tys: &[Ty],
        body: &Expr,
    ) -> Result<(ArtifactId, *const u8), CompileError> {
        self.unsafe_compile_fn_ty(&Ty::fun(arg_tys.to_vec(), ret.clone()), names, body)
    }

    pub fn unsafe_compile_fn_ty(
        &mut self,
        fn_ty: &Ty,
        names: &ArgList,
        body: &Expr,
    ) -> Result<(ArtifactId, *const u8), CompileError> {
        self.transaction("compile_fn", |c| {
            let fn_ty = c.registry.expand_aliases(fn_ty)?;
            let Ty::Fun(params, _) = &fn_ty else {
                return Err(CompileError::TypeMismatch {
                    declared: fn_ty.to_string(),
                    inferred: format!("a function of {} argument(s)", names.len()),
                });
            };
            if params.len() != names.len() {
                return Err(CompileError::ArityMismatch {
                    expected: params.len(),
                    found: names.len(),
                });
            }
            let params = names
                .names()
                .iter()
                .zip(params)
                .map(|(n, t)| Param::typed(n.clone(), t.clone()))
                .collect();
            let lambda = Expr::lambda(params, body.clone()).at(body.span);
            let id = c.compile_anonymous(&lambda, Some(&fn_ty))?;
            let entry = c.jit.entry(id)?;
            Ok((id, entry as *const u8))
        })
    }

    pub fn unsafe_compile_fn_text(
        &mut self,
        fn_ty: &Ty,
        names: &ArgList,
        text: &str,
    ) -> Result<(ArtifactId, *const u8), CompileError> {
        let body = self.read_expr(text)?;
        self.unsafe_compile_fn_ty(fn_ty, names, &body)
    }

    /// Compile `body` as the host function type `F`.
    pub fn compile_fn<F: HostFn>(&mut self, names: ArgList, body: &Expr) -> Result<CompiledFn<F>, CompileError> {
        if F::ARITY != names.len() {
            return Err(CompileError::ArityMismatch {
                expected: F::ARITY,
                found: names.len(),
            });
        }
        let fn_ty = F::lift(self)?;
        let (id, entry) = self.unsafe_compile_fn_ty(&fn_ty, &names, body)?;
        // SAFETY: the entry was compiled at the lifted type of `F`.
        let func = unsafe { F::from_addr(entry as usize) };
        Ok(CompiledFn { id, func })
    }

    pub fn compile_to<F: HostFn>(&mut self, names: ArgList, text: &str) -> Result<CompiledFn<F>, CompileError> {
        let body = self.read_expr(text)?;
        self.compile_fn(names, &body)
    }

    /// Free the machine code of `id`. Pointers obtained for it must not be
    /// called afterwards.
    pub fn release_machine_code(&mut self, id: ArtifactId) -> Result<(), CompileError> {
        self.jit.release(id)?;
        Ok(())
    }

    /// Call artifact `id` with primitive arguments.
    pub fn invoke(&self, id: ArtifactId, args: &[Value]) -> Result<Value, CompileError> {
        if args.iter().any(|a| matches!(a, Value::Ptr(_))) {
            return Err(CompileError::TypeMismatch {
                declared: "a primitive argument".into(),
                inferred: "pointer".into(),
            });
        }
        // SAFETY: primitive words are valid at their types.
        unsafe { self.invoke_unchecked(id, args) }
    }

    /// As [`invoke`], also accepting pointer arguments.
    ///
    /// # Safety
    ///
    /// Each `Value::Ptr` must point to a live value of its parameter type.
    ///
    /// [`invoke`]: Compiler::invoke
    pub unsafe fn invoke_unchecked(&self, id: ArtifactId, args: &[Value]) -> Result<Value, CompileError> {
        self.jit.entry(id)?;
        let sig = self
            .signatures
            .get(id.0 as usize)
            .ok_or(JitError::UnknownArtifact(id))?;
        if sig.params.len() != args.len() {
            return Err(CompileError::ArityMismatch {
                expected: sig.params.len(),
                found: args.len(),
            });
        }
        let words = args
            .iter()
            .zip(&sig.params)
            .map(|(v, t)| v.to_word(&self.registry.structural(t)))
            .collect::<Result<Vec<_>, _>>()?;
        let word = self.jit.invoke_raw(id, &words)?;
        Ok(Value::from_word(word, &self.registry.structural(&sig.ret)))
    }

    /// Native bytes `expr` compiles to.
    pub fn machine_code_for(&mut self, expr: &Expr) -> Result<Vec<u8>, CompileError> {
        self.transaction("machine_code_for", |c| {
            let id = c.compile_anonymous(expr, None)?;
            let bytes = c.jit.machine_code(id)?;
            c.jit.release(id)?;
            Ok(bytes)
        })
    }

    pub fn machine_code_for_expr(&mut self, text: &str) -> Result<Vec<u8>, CompileError> {
        let expr = self.read_expr(text)?;
        self.machine_code_for(&expr)
    }
}
