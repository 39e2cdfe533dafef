//! Value layouts.
//!
//! | Type                          | Repr  | Heap words              |
//! |-------------------------------|-------|-------------------------|
//! | Unit, Bool, Char, Int, Opaque | i64   | none                    |
//! | Float                         | f64   | none                    |
//! | Tuple, Record                 | ptr   | field i at word i       |
//! | Variant                       | ptr   | `[tag, payload]`        |
//! | Array                         | ptr   | `[len, e0, e1, ..]`     |
//! | Function value                | ptr   | `[code, capture0, ..]`  |
//!
//! Named types are laid out as their representation. Record fields are
//! stored in the order the record type declares them.

use kiln_common::Ty;
use kiln_typeck::TypeRegistry;

use crate::mir::{Repr, Sig};

/// Word offset of a variant's payload.
pub const PAYLOAD_OFFSET: i32 = 1;
/// Word offset of an array's first element.
pub const ELEMS_OFFSET: i32 = 1;

/// Structural view of types for lowering.
#[derive(Clone, Copy)]
pub struct Layouts<'a> {
    registry: &'a TypeRegistry,
}

impl<'a> Layouts<'a> {
    pub fn new(registry: &'a TypeRegistry) -> Self {
        Layouts { registry }
    }

    pub fn registry(&self) -> &'a TypeRegistry {
        self.registry
    }

    pub fn structural(&self, ty: &Ty) -> Ty {
        self.registry.structural(ty)
    }

    pub fn repr(&self, ty: &Ty) -> Repr {
        if self.structural(ty).is_float() {
            Repr::Float
        } else {
            Repr::Word
        }
    }

    /// Parameter and result types of a function type.
    pub fn fun_parts(&self, ty: &Ty) -> Option<(Vec<Ty>, Ty)> {
        match self.structural(ty) {
            Ty::Fun(params, ret) => Some((params, *ret)),
            _ => None,
        }
    }

    pub fn is_function(&self, ty: &Ty) -> bool {
        self.fun_parts(ty).is_some()
    }

    /// Signature of a top-level function of type `ty`.
    pub fn c_sig(&self, ty: &Ty) -> Option<Sig> {
        let (params, ret) = self.fun_parts(ty)?;
        Some(Sig {
            params: params.iter().map(|p| self.repr(p)).collect(),
            ret: self.repr(&ret),
        })
    }

    /// Signature of the code pointer of a closure of type `ty`: the
    /// environment comes first.
    pub fn closure_sig(&self, ty: &Ty) -> Option<Sig> {
        let mut sig = self.c_sig(ty)?;
        sig.params.insert(0, Repr::Word);
        Some(sig)
    }

    /// Field types of a tuple or record, in storage order.
    pub fn fields(&self, ty: &Ty) -> Option<Vec<(Option<String>, Ty)>> {
        match self.structural(ty) {
            Ty::Tuple(elems) => Some(elems.into_iter().map(|t| (None, t)).collect()),
            Ty::Record(fields) => Some(fields.into_iter().map(|(n, t)| (Some(n), t)).collect()),
            Ty::Con(c) if c.name == "Unit" => Some(Vec::new()),
            _ => None,
        }
    }

    /// Index and type of a record field.
    pub fn field(&self, ty: &Ty, name: &str) -> Option<(usize, Ty)> {
        match self.structural(ty) {
            Ty::Record(fields) => fields
                .into_iter()
                .enumerate()
                .find(|(_, (n, _))| n == name)
                .map(|(i, (_, t))| (i, t)),
            _ => None,
        }
    }

    /// Constructors of a variant type, in tag order.
    pub fn ctors(&self, ty: &Ty) -> Option<Vec<(String, Ty)>> {
        match self.structural(ty) {
            Ty::Variant(ctors) => Some(ctors),
            _ => None,
        }
    }

    /// Tag, payload type and constructor count of `ctor` in `ty`.
    pub fn ctor(&self, ty: &Ty, ctor: &str) -> Option<(usize, Ty, usize)> {
        let ctors = self.ctors(ty)?;
        let count = ctors.len();
        ctors
            .into_iter()
            .enumerate()
            .find(|(_, (n, _))| n == ctor)
            .map(|(tag, (_, payload))| (tag, payload, count))
    }

    pub fn array_elem(&self, ty: &Ty) -> Option<Ty> {
        match self.structural(ty) {
            Ty::Array(elem) => Some(*elem),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_types_use_their_representation() {
        let mut registry = TypeRegistry::new();
        registry
            .define_named_type(
                "Opt",
                &["a".to_string()],
                &Ty::variant(vec![("None", Ty::unit()), ("Some", Ty::con("a"))]),
            )
            .unwrap();
        let layouts = Layouts::new(&registry);
        let opt = Ty::app("Opt", vec![Ty::float()]);
        assert_eq!(layouts.ctor(&opt, "Some"), Some((1, Ty::float(), 2)));
        assert_eq!(layouts.repr(&opt), Repr::Word);
        assert_eq!(layouts.repr(&Ty::float()), Repr::Float);
    }

    #[test]
    fn closure_signature_prepends_environment() {
        let registry = TypeRegistry::new();
        let layouts = Layouts::new(&registry);
        let ty = Ty::fun(vec![Ty::float()], Ty::int());
        let sig = layouts.closure_sig(&ty).unwrap();
        assert_eq!(sig.params, vec![Repr::Word, Repr::Float]);
        assert_eq!(sig.ret, Repr::Word);
    }

    #[test]
    fn record_fields_keep_declared_order() {
        let registry = TypeRegistry::new();
        let layouts = Layouts::new(&registry);
        let ty = Ty::record(vec![("y", Ty::int()), ("x", Ty::float())]);
        assert_eq!(layouts.field(&ty, "x"), Some((1, Ty::float())));
        assert_eq!(layouts.field(&ty, "z"), None);
    }
}
