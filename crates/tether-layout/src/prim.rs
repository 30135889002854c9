//! Primitive field types that appear in native records.

use std::ffi::c_void;
use std::fmt;
use std::mem::{align_of, size_of};

use bytemuck::Pod;

/// Primitive type of a record field.
///
/// Sizes and alignments are those of the host C compiler: `int` is 32
/// bits, pointers follow the host pointer width.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Prim {
    /// `int`
    I32,
    /// `unsigned`
    U32,
    /// `float`
    F32,
    /// `double`
    F64,
    /// `int64`
    I64,
    /// Any data pointer.
    Ptr,
}

impl Prim {
    /// Size in bytes.
    pub const fn size(self) -> usize {
        match self {
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::F64 | Self::I64 => 8,
            Self::Ptr => size_of::<*mut c_void>(),
        }
    }

    /// Natural alignment in bytes.
    pub const fn align(self) -> usize {
        match self {
            Self::I32 => align_of::<i32>(),
            Self::U32 => align_of::<u32>(),
            Self::F32 => align_of::<f32>(),
            Self::F64 => align_of::<f64>(),
            Self::I64 => align_of::<i64>(),
            Self::Ptr => align_of::<*mut c_void>(),
        }
    }

    /// C-side spelling, used in diagnostics.
    pub const fn name(self) -> &'static str {
        match self {
            Self::I32 => "int",
            Self::U32 => "unsigned",
            Self::F32 => "float",
            Self::F64 => "double",
            Self::I64 => "int64",
            Self::Ptr => "pointer",
        }
    }
}

impl fmt::Display for Prim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A plain-data Rust type that mirrors one [`Prim`].
///
/// Pointers are excluded; they go through the dedicated
/// pointer accessors.
pub trait Scalar: Pod {
    /// The primitive this type reads and writes as.
    const PRIM: Prim;
}

impl Scalar for i32 {
    const PRIM: Prim = Prim::I32;
}

impl Scalar for u32 {
    const PRIM: Prim = Prim::U32;
}

impl Scalar for f32 {
    const PRIM: Prim = Prim::F32;
}

impl Scalar for f64 {
    const PRIM: Prim = Prim::F64;
}

impl Scalar for i64 {
    const PRIM: Prim = Prim::I64;
}
