//! Classes, instances and host-supplied globals.

use std::sync::Arc;

use kiln_codegen::LowLevelOp;
use kiln_common::{Expr, InstanceDecl, QualType, Scheme, Ty};
use kiln_typeck::classes::{Instance, TypeClass};
use kiln_typeck::{GlobalBinding, GlobalKind, TypeError};
use rustc_hash::FxHashMap;

use super::globals::GlobalSlot;
use super::Compiler;
use crate::error::CompileError;

impl Compiler {
    fn check_unbound(&self, name: &str) -> Result<(), CompileError> {
        match self.env.lookup_global(name) {
            Some(b) if b.has_value() => Err(CompileError::DuplicateDefinition {
                what: "global",
                name: name.to_string(),
            }),
            _ => Ok(()),
        }
    }

    // ── Classes and instances ───────────────────────────────────────────

    /// Register a class and bind each of its members as a global.
    pub fn define_class(&mut self, class: TypeClass) -> Result<(), CompileError> {
        self.transaction("define_class", |c| {
            for (member, _) in &class.members {
                if c.env.lookup_global(member).is_some() {
                    return Err(CompileError::DuplicateDefinition {
                        what: "global",
                        name: member.clone(),
                    });
                }
            }
            let name = class.name.clone();
            for (member, scheme) in c.classes.define_class(class)? {
                c.env.bind(
                    &member,
                    GlobalBinding {
                        scheme,
                        kind: GlobalKind::ClassMember(name.clone()),
                    },
                );
            }
            c.search_cache.clear();
            Ok(())
        })
    }

    pub fn add_instance(&mut self, mut inst: Instance) -> Result<(), CompileError> {
        self.transaction("add_instance", |c| {
            inst.args = inst
                .args
                .iter()
                .map(|t| c.registry.expand_aliases(t))
                .collect::<Result<_, _>>()?;
            for pred in &mut inst.context {
                pred.args = pred
                    .args
                    .iter()
                    .map(|t| c.registry.expand_aliases(t))
                    .collect::<Result<_, _>>()?;
            }
            tracing::debug!(class = %inst.class, args = inst.args.len(), "adding instance");
            c.classes.add_instance(inst.clone())?;
            c.check_instance_members(&inst)?;
            c.search_cache.clear();
            Ok(())
        })
    }

    /// Infer every member body against the class member type at the
    /// instance's arguments. Instance parameters stay rigid.
    fn check_instance_members(&mut self, inst: &Instance) -> Result<(), CompileError> {
        let class = self.classes.class(&inst.class).cloned().ok_or_else(|| TypeError::UnknownClass {
            name: inst.class.clone(),
        })?;
        let subst: FxHashMap<String, Ty> = class.params.iter().cloned().zip(inst.args.iter().cloned()).collect();
        for (member, body) in &inst.members {
            let Some((_, member_ty)) = class.members.iter().find(|(n, _)| n == member) else {
                continue;
            };
            let expected = member_ty.substitute_params(&subst);
            let _span = tracing::debug_span!("instance_member", member = %member, ty = %expected).entered();
            self.unsweetener().infer_definition(None, body, Some(&expected))?;
        }
        Ok(())
    }

    /// Instance shorthand for classes with at most one member: `body`
    /// implements the member, and must be absent for an empty class.
    pub fn overload(&mut self, class: &str, types: &[Ty], body: Option<Expr>) -> Result<(), CompileError> {
        let decl = self.classes.class(class).ok_or_else(|| TypeError::UnknownClass {
            name: class.to_string(),
        })?;
        let given = usize::from(body.is_some());
        let members = match (decl.members.as_slice(), body) {
            ([], None) => Vec::new(),
            ([(member, _)], Some(body)) => vec![(member.clone(), body)],
            ([(member, _)], None) => {
                return Err(TypeError::MissingMember {
                    class: class.to_string(),
                    member: member.clone(),
                }
                .into())
            }
            (members, _) => {
                return Err(CompileError::ArityMismatch {
                    expected: members.len(),
                    found: given,
                })
            }
        };
        self.add_instance(InstanceDecl::ground(class, types.to_vec(), members))
    }

    pub fn overload_text(&mut self, class: &str, types: &[Ty], text: &str) -> Result<(), CompileError> {
        let body = self.read_expr(text)?;
        self.overload(class, types, Some(body))
    }

    // ── Host values ─────────────────────────────────────────────────────

    /// Bind `name` to the host cell at `addr`. Compiled code reads the cell
    /// on every use, so host writes are seen.
    ///
    /// # Safety
    ///
    /// `addr` must stay valid, and hold a value of `ty`, for as long as
    /// code using `name` may run.
    pub unsafe fn bind_value(&mut self, name: &str, ty: &Ty, addr: *const u64) -> Result<(), CompileError> {
        self.check_unbound(name)?;
        let ty = self.registry.expand_aliases(ty)?;
        self.globals.insert(name, GlobalSlot::HostCell { addr: addr as u64 });
        self.env.bind(
            name,
            GlobalBinding {
                scheme: Scheme::mono(ty),
                kind: GlobalKind::Extern,
            },
        );
        self.search_cache.clear();
        Ok(())
    }

    /// Bind `name` to the host function at `addr`. A forward-declared
    /// function gets its slot filled, so code already compiled against the
    /// declaration calls the host function from now on.
    ///
    /// # Safety
    ///
    /// `addr` must be an `extern "C"` function whose signature matches
    /// `fn_ty`, valid for the life of the compiler.
    pub unsafe fn bind_extern_function(
        &mut self,
        name: &str,
        fn_ty: &Ty,
        addr: *const u8,
    ) -> Result<(), CompileError> {
        self.check_unbound(name)?;
        let fn_ty = self.registry.expand_aliases(fn_ty)?;
        if !matches!(fn_ty, Ty::Fun(..)) {
            return Err(CompileError::TypeMismatch {
                declared: fn_ty.to_string(),
                inferred: "a host function".into(),
            });
        }
        if let Some(forward) = self.env.lookup_global(name) {
            if forward.scheme.ty != fn_ty {
                return Err(CompileError::TypeMismatch {
                    declared: forward.scheme.ty.to_string(),
                    inferred: fn_ty.to_string(),
                });
            }
        }
        match self.globals.get(name) {
            Some(GlobalSlot::Function { .. }) => {
                self.globals.bind_function(name, &self.region, addr as u64);
            }
            _ => self.globals.insert(name, GlobalSlot::Extern { addr: addr as u64 }),
        }
        self.env.bind(
            name,
            GlobalBinding {
                scheme: Scheme::mono(fn_ty),
                kind: GlobalKind::Extern,
            },
        );
        self.search_cache.clear();
        Ok(())
    }

    /// Bind `name` to an operation emitted inline at each use.
    pub fn bind_ll_func(&mut self, name: &str, op: Arc<dyn LowLevelOp>) -> Result<(), CompileError> {
        if self.env.lookup_global(name).is_some() {
            return Err(CompileError::DuplicateDefinition {
                what: "global",
                name: name.to_string(),
            });
        }
        self.env.bind(
            name,
            GlobalBinding {
                scheme: op.scheme(),
                kind: GlobalKind::Op,
            },
        );
        self.ops.insert(name.to_string(), op);
        self.search_cache.clear();
        Ok(())
    }

    /// Declare `name` without a value. Calls compiled before the value is
    /// supplied fault with `UnboundValue`.
    pub fn forward_declare(&mut self, name: &str, qt: &QualType) -> Result<(), CompileError> {
        if self.env.lookup_global(name).is_some() {
            return Err(CompileError::DuplicateDefinition {
                what: "global",
                name: name.to_string(),
            });
        }
        let ty = self.registry.expand_aliases(&qt.ty)?;
        self.env.forward_declare(name, &QualType::new(qt.preds.clone(), ty));
        Ok(())
    }

    pub fn has_value_binding(&self, name: &str) -> bool {
        self.env.has_value_binding(name)
    }
}
