//! Kiln: an embeddable compiler core.
//!
//! A [`Compiler`] takes expression trees built by a host (or by a
//! [`Reader`] the host installs), infers their types, resolves overloaded
//! class members into concrete definitions, lowers pattern matches and
//! compiles the result to native code it can call or hand out as a function
//! pointer.
//!
//! ```no_run
//! use kiln::{ArgList, Compiler, Expr};
//!
//! let mut c = Compiler::new()?;
//! let body = Expr::binop("+", Expr::var("x"), Expr::int(1));
//! let f = c.compile_fn::<extern "C" fn(i64) -> i64>(ArgList::from(["x"]), &body)?;
//! assert_eq!(unsafe { f.get() }(41), 42);
//! # Ok::<(), kiln::CompileError>(())
//! ```

mod args;
mod builtins;
mod compiler;
mod config;
mod error;
mod lift;
mod reader;
mod value;

pub use args::ArgList;
pub use compiler::{CompiledFn, Compiler};
pub use config::CompilerConfig;
pub use error::CompileError;
pub use lift::{HostFn, Lift};
pub use reader::{ReadError, Reader};
pub use value::Value;

pub use kiln_codegen::{BackendKind, LowLevelOp, UnreachableRow, UnreachableRows};
pub use kiln_common::{
    ClassDecl, Expr, InstanceDecl, Lit, MatchArm, Module, ModuleItem, Param, Pattern, Pred,
    QualType, Scheme, Span, Ty,
};
pub use kiln_jit::ArtifactId;
pub use kiln_rt::FaultKind;
pub use kiln_typeck::{ClassEnv, ForeignIdentity, SearchEntry, TypeError, TypeEnv};
