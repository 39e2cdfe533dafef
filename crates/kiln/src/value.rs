use std::fmt;

use kiln_common::Ty;

use crate::error::CompileError;

/// A value passed to or returned from [`Compiler::invoke`].
///
/// [`Compiler::invoke`]: crate::Compiler::invoke
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Value {
    Unit,
    Bool(bool),
    Char(char),
    Int(i64),
    Float(f64),
    /// A heap value or opaque host pointer, passed as its address.
    Ptr(u64),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::Unit => "Unit",
            Value::Bool(_) => "Bool",
            Value::Char(_) => "Char",
            Value::Int(_) => "Int",
            Value::Float(_) => "Float",
            Value::Ptr(_) => "pointer",
        }
    }

    /// The word the generated code expects for a parameter of type `ty`.
    pub(crate) fn to_word(self, ty: &Ty) -> Result<u64, CompileError> {
        let prim = ty.head_name().filter(|_| ty.is_primitive());
        let word = match (self, prim) {
            (Value::Unit, Some("Unit")) => 0,
            (Value::Bool(b), Some("Bool")) => b as u64,
            (Value::Char(c), Some("Char")) => c as u64,
            (Value::Int(n), Some("Int")) => n as u64,
            (Value::Float(x), Some("Float")) => x.to_bits(),
            (Value::Ptr(p), None) => p,
            _ => {
                return Err(CompileError::TypeMismatch {
                    declared: ty.to_string(),
                    inferred: self.kind().to_string(),
                })
            }
        };
        Ok(word)
    }

    /// Read a result word of type `ty`.
    pub(crate) fn from_word(word: u64, ty: &Ty) -> Value {
        match ty.head_name().filter(|_| ty.is_primitive()) {
            Some("Unit") => Value::Unit,
            Some("Bool") => Value::Bool(word & 1 != 0),
            Some("Char") => Value::Char(char::from_u32(word as u32).unwrap_or(char::REPLACEMENT_CHARACTER)),
            Some("Int") => Value::Int(word as i64),
            Some("Float") => Value::Float(f64::from_bits(word)),
            _ => Value::Ptr(word),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unit => write!(f, "()"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Char(c) => write!(f, "{:?}", c),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(x) => write!(f, "{}", x),
            Value::Ptr(p) => write!(f, "0x{:x}", p),
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<char> for Value {
    fn from(c: char) -> Self {
        Value::Char(c)
    }
}
