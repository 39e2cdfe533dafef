//! Kiln type checker and unsweetener.
//!
//! Turns sweet expression trees (polymorphic, under-annotated, using
//! overloaded class members) into monomorphic trees with a type on every
//! node, ready for lowering.
//!
//! # Architecture
//!
//! - [`registry`]: named types, transparent aliases, foreign descriptors
//! - [`foreign`]: upcast graph over foreign descriptors
//! - [`env`]: global bindings with an undo log, local scope stack
//! - [`classes`]: type classes, instances, most-specific resolution
//! - [`unify`]: unification over `ena` with level-based generalization
//! - [`infer`]: HM inference producing a typed tree with deferred fields
//! - [`unsweeten`]: elaboration, instance resolution, residual queue
//! - [`search`]: one-step coercion search and its cache
//! - [`error`] / [`diagnostics`]: type errors and their ariadne rendering

pub mod classes;
pub mod diagnostics;
pub mod env;
pub mod error;
pub mod foreign;
pub mod infer;
pub mod registry;
pub mod search;
pub mod unify;
pub mod unsweeten;

pub use classes::{ClassEnv, Instance, TypeClass};
pub use env::{GlobalBinding, GlobalKind, TypeEnv};
pub use error::{ConstraintOrigin, TypeError};
pub use foreign::ForeignTypeGraph;
pub use registry::{ForeignIdentity, TypeRegistry};
pub use search::{SearchCache, SearchEngine, SearchEntry};
pub use unsweeten::{Residual, ResidualQueue, Unsweetener, MAX_DRAIN_DEPTH, MAX_RESIDUALS};
