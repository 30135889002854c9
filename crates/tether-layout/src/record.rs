//! Typed field access over one live native record.

#![allow(unsafe_code)]

use std::ffi::c_void;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;

use tether_core::{InteropError, Result};

use crate::layout::{Field, RecordLayout};
use crate::prim::{Prim, Scalar};
use crate::raw;

/// A native record at a live address, read and written by field name.
///
/// Every access is checked against the layout: unknown names fail with
/// [`InteropError::UnknownField`], accesses through the wrong primitive
/// with [`InteropError::FieldTypeMismatch`], array indices past the field's
/// length with [`InteropError::OutOfRange`]. The address itself is trusted;
/// that trust is established once, by the `unsafe` constructor.
#[derive(Clone, Copy)]
pub struct RawRecord<'a> {
    base: NonNull<u8>,
    layout: &'a RecordLayout,
    _memory: PhantomData<&'a [u8]>,
}

impl<'a> RawRecord<'a> {
    /// Overlay `layout` on `address`.
    ///
    /// # Safety
    ///
    /// `address` must point to a live record of this layout, readable and
    /// writable for its full [`record_size`](RecordLayout::record_size) for
    /// as long as the returned value (or anything followed from it) is
    /// used, and must not be aliased by Rust references.
    pub unsafe fn new(address: NonNull<c_void>, layout: &'a RecordLayout) -> Self {
        Self {
            base: address.cast(),
            layout,
            _memory: PhantomData,
        }
    }

    /// The record's address.
    pub fn address(&self) -> NonNull<c_void> {
        self.base.cast()
    }

    /// The layout this record is read through.
    pub fn layout(&self) -> &'a RecordLayout {
        self.layout
    }

    fn checked(&self, name: &str, prim: Prim, index: usize) -> Result<&'a Field> {
        let field = self.layout.field(name)?;
        if field.prim != prim {
            return Err(InteropError::FieldTypeMismatch {
                field: field.name,
                declared: field.prim.name(),
                requested: prim.name(),
            });
        }
        if index >= field.count {
            return Err(InteropError::OutOfRange {
                index: index as isize,
                len: field.count,
            });
        }
        Ok(field)
    }

    /// Read a scalar field.
    pub fn read<T: Scalar>(&self, name: &str) -> Result<T> {
        self.read_at(name, 0)
    }

    /// Write a scalar field.
    pub fn write<T: Scalar>(&self, name: &str, value: T) -> Result<()> {
        self.write_at(name, 0, value)
    }

    /// Read element `index` of an array field.
    pub fn read_at<T: Scalar>(&self, name: &str, index: usize) -> Result<T> {
        let field = self.checked(name, T::PRIM, index)?;
        // SAFETY: the field lies inside the record (layout invariant) and
        // the record is live (constructor contract).
        Ok(unsafe { raw::load(self.base, field.element_offset(index)) })
    }

    /// Write element `index` of an array field.
    pub fn write_at<T: Scalar>(&self, name: &str, index: usize, value: T) -> Result<()> {
        let field = self.checked(name, T::PRIM, index)?;
        // SAFETY: as for `read_at`.
        unsafe { raw::store(self.base, field.element_offset(index), value) };
        Ok(())
    }

    /// Read a pointer field.
    pub fn read_ptr(&self, name: &str) -> Result<*mut c_void> {
        self.read_ptr_at(name, 0)
    }

    /// Read element `index` of a pointer array field.
    pub fn read_ptr_at(&self, name: &str, index: usize) -> Result<*mut c_void> {
        let field = self.checked(name, Prim::Ptr, index)?;
        // SAFETY: as for `read_at`.
        Ok(unsafe { raw::load_ptr(self.base, field.element_offset(index)) })
    }

    /// Write a pointer field.
    pub fn write_ptr(&self, name: &str, value: *mut c_void) -> Result<()> {
        self.write_ptr_at(name, 0, value)
    }

    /// Write element `index` of a pointer array field.
    pub fn write_ptr_at(&self, name: &str, index: usize, value: *mut c_void) -> Result<()> {
        let field = self.checked(name, Prim::Ptr, index)?;
        // SAFETY: as for `read_at`.
        unsafe { raw::store_ptr(self.base, field.element_offset(index), value) };
        Ok(())
    }

    /// Follow a pointer field to another record. `Ok(None)` for null.
    ///
    /// # Safety
    ///
    /// A non-null pointer in `name` must satisfy the [`RawRecord::new`]
    /// contract for `layout`.
    pub unsafe fn follow<'b>(
        &self,
        name: &str,
        layout: &'b RecordLayout,
    ) -> Result<Option<RawRecord<'b>>> {
        let target = self.read_ptr(name)?;
        // SAFETY: forwarded caller contract.
        Ok(NonNull::new(target).map(|p| unsafe { RawRecord::new(p, layout) }))
    }

    /// Byte size of this record through the layout's size contract.
    pub fn size(&self) -> Result<usize> {
        self.layout.record_size(Some(self))
    }

    fn trailing_slot(&self, index: usize) -> Result<usize> {
        let crate::layout::SizeRule::Trailing {
            base,
            count_field,
            elem,
        } = self.layout.size_rule()
        else {
            return Err(InteropError::OutOfRange {
                index: index as isize,
                len: 0,
            });
        };
        let len = usize::try_from(self.read::<i32>(count_field)?).unwrap_or(0);
        if index >= len {
            return Err(InteropError::OutOfRange {
                index: index as isize,
                len,
            });
        }
        Ok(base + index * elem)
    }

    /// Read element `index` of a pointer-typed trailing array, bounds-checked
    /// against the live count field.
    pub fn trailing_ptr(&self, index: usize) -> Result<*mut c_void> {
        let offset = self.trailing_slot(index)?;
        // SAFETY: `offset` is below `record_size`, inside the live record.
        Ok(unsafe { raw::load_ptr(self.base, offset) })
    }

    /// Write element `index` of a pointer-typed trailing array.
    pub fn set_trailing_ptr(&self, index: usize, value: *mut c_void) -> Result<()> {
        let offset = self.trailing_slot(index)?;
        // SAFETY: as for `trailing_ptr`.
        unsafe { raw::store_ptr(self.base, offset, value) };
        Ok(())
    }
}

impl fmt::Debug for RawRecord<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawRecord")
            .field("layout", &self.layout.name())
            .field("address", &self.base)
            .finish()
    }
}
