//! The pluggable surface-syntax reader.
//!
//! Kiln has no parser of its own. A host installs a [`Reader`] to turn
//! text into modules, expressions and types; every hook it leaves out
//! reports [`ReadError::Unsupported`], which the compiler surfaces as
//! `NoReaderConfigured`.

use kiln_common::{Expr, Module, Span, Ty};

#[derive(Clone, Debug, PartialEq)]
pub enum ReadError {
    /// The reader does not implement this hook.
    Unsupported,
    Syntax { message: String, span: Span },
}

pub trait Reader {
    fn read_module(&mut self, _text: &str) -> Result<Module, ReadError> {
        Err(ReadError::Unsupported)
    }

    /// A single `name = expr` definition.
    fn read_expr_defn(&mut self, _text: &str) -> Result<(String, Expr), ReadError> {
        Err(ReadError::Unsupported)
    }

    fn read_expr(&mut self, _text: &str) -> Result<Expr, ReadError> {
        Err(ReadError::Unsupported)
    }

    fn read_mono_type(&mut self, _text: &str) -> Result<Ty, ReadError> {
        Err(ReadError::Unsupported)
    }
}
