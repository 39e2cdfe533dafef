//! Shared data model for the Kiln compiler.
//!
//! Everything that crosses a crate boundary lives here: source spans, the
//! type representation, and the expression/pattern trees handed to the
//! compiler by a reader or built directly by an embedding host.

pub mod expr;
pub mod span;
pub mod ty;

pub use expr::{
    ClassDecl, Expr, ExprKind, InstanceDecl, Lit, MatchArm, Module, ModuleItem, Param, Pattern,
};
pub use span::Span;
pub use ty::{ForeignId, ForeignRef, Pred, QualType, Scheme, Ty, TyCon, TyVar};
