//! Host types as Kiln types.
//!
//! Lifting is an explicit registration: the first lift of `*const T`
//! registers `T` as an opaque foreign type keyed by its `TypeId`, and every
//! later lift returns the same descriptor.

use std::any::{type_name, TypeId};

use kiln_common::Ty;
use kiln_typeck::ForeignIdentity;

use crate::compiler::Compiler;
use crate::error::CompileError;

pub trait Lift {
    fn lift(c: &mut Compiler) -> Result<Ty, CompileError>;
}

/// A host function pointer type a compiled artifact can be cast to.
pub trait HostFn: Lift + Copy {
    const ARITY: usize;

    /// # Safety
    ///
    /// `addr` must be the entry of compiled code whose signature matches
    /// `Self`.
    unsafe fn from_addr(addr: usize) -> Self;
}

impl Lift for i64 {
    fn lift(_: &mut Compiler) -> Result<Ty, CompileError> {
        Ok(Ty::int())
    }
}

impl Lift for f64 {
    fn lift(_: &mut Compiler) -> Result<Ty, CompileError> {
        Ok(Ty::float())
    }
}

impl Lift for () {
    fn lift(_: &mut Compiler) -> Result<Ty, CompileError> {
        Ok(Ty::unit())
    }
}

fn opaque<T: 'static>(c: &mut Compiler) -> Result<Ty, CompileError> {
    let full = type_name::<T>();
    let short = full.rsplit("::").next().unwrap_or(full);
    c.opaque_ptr_mono_type(
        ForeignIdentity::Rust(TypeId::of::<T>()),
        short,
        std::mem::size_of::<T>(),
        false,
    )
}

impl<T: 'static> Lift for *const T {
    fn lift(c: &mut Compiler) -> Result<Ty, CompileError> {
        opaque::<T>(c)
    }
}

impl<T: 'static> Lift for *mut T {
    fn lift(c: &mut Compiler) -> Result<Ty, CompileError> {
        opaque::<T>(c)
    }
}

macro_rules! lift_extern_fn {
    ($($arg:ident),*) => {
        impl<R: Lift, $($arg: Lift),*> Lift for extern "C" fn($($arg),*) -> R {
            fn lift(c: &mut Compiler) -> Result<Ty, CompileError> {
                let params: Vec<Ty> = vec![$($arg::lift(c)?),*];
                Ok(Ty::fun(params, R::lift(c)?))
            }
        }

        impl<R: Lift, $($arg: Lift),*> HostFn for extern "C" fn($($arg),*) -> R {
            const ARITY: usize = <[&str]>::len(&[$(stringify!($arg)),*]);

            unsafe fn from_addr(addr: usize) -> Self {
                std::mem::transmute_copy::<usize, Self>(&addr)
            }
        }
    };
}

lift_extern_fn!();
lift_extern_fn!(A);
lift_extern_fn!(A, B);
lift_extern_fn!(A, B, C);
lift_extern_fn!(A, B, C, D);
