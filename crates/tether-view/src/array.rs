//! One-dimensional typed view over foreign memory.

#![allow(unsafe_code)]

use std::ffi::c_void;
use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;
use std::ptr::NonNull;

use bytemuck::Pod;
use tether_core::{ForeignHandle, InteropError, Release, Result, TypedView};
use tether_layout::raw;

/// A foreign address read as an array of `T`.
///
/// Element `i` lives at `address + i * stride`. The view borrows whatever
/// keeps the address alive for `'a` and never frees it.
///
/// The safe constructors borrow their source mutably, so one handle backs
/// at most one live view and a slice from [`as_slice`](Self::as_slice)
/// never sees a write from a sibling view:
///
/// ```compile_fail
/// # use tether_core::HandleBuilder;
/// # use tether_view::ArrayPtr;
/// let mut data = [1i32, 2, 3];
/// let mut handle = unsafe {
///     HandleBuilder::new(data.as_mut_ptr().cast()).byte_size(12).borrowed().unwrap()
/// };
/// let reader = ArrayPtr::<i32>::from_handle(&mut handle).unwrap();
/// let mut writer = ArrayPtr::<i32>::from_handle(&mut handle).unwrap();
/// let slice = reader.as_slice().unwrap();
/// writer.set_checked(0, 99).unwrap();
/// assert_eq!(slice[0], 1);
/// ```
pub struct ArrayPtr<'a, T> {
    base: NonNull<u8>,
    stride: usize,
    len: Option<usize>,
    _borrow: PhantomData<(&'a (), *mut T)>,
}

impl<'a, T: Pod> ArrayPtr<'a, T> {
    /// View `address` as densely packed `T`s.
    ///
    /// Fails with [`InteropError::InvalidArgument`] for a null address.
    ///
    /// # Safety
    ///
    /// `address` must stay valid for `'a`; when `len` is given, the first
    /// `len` elements must be readable and writable. No other view may
    /// write to those elements while this one is alive.
    pub unsafe fn from_raw(address: *mut c_void, len: Option<usize>) -> Result<Self> {
        // SAFETY: forwarded caller contract.
        unsafe { Self::from_raw_strided(address, size_of::<T>(), len) }
    }

    /// View `address` as `T`s spaced `stride` bytes apart.
    ///
    /// # Safety
    ///
    /// As for [`from_raw`](Self::from_raw), with every element at
    /// `address + i * stride` in range.
    pub unsafe fn from_raw_strided(
        address: *mut c_void,
        stride: usize,
        len: Option<usize>,
    ) -> Result<Self> {
        let base = NonNull::new(address.cast::<u8>())
            .ok_or(InteropError::InvalidArgument { what: "null address" })?;
        if stride < size_of::<T>() {
            return Err(InteropError::InvalidArgument {
                what: "stride smaller than the element type",
            });
        }
        Ok(Self {
            base,
            stride,
            len,
            _borrow: PhantomData,
        })
    }

    /// View the memory a handle owns or observes.
    ///
    /// The element count is derived from the handle's reported byte size,
    /// if it has one. Fails with [`InteropError::Disposed`] on a disposed
    /// handle and [`InteropError::Unbound`] on a detached one.
    ///
    /// The handle stays mutably borrowed for `'a`: it can neither be
    /// disposed nor back a second view meanwhile.
    pub fn from_handle<R: Release>(handle: &'a mut ForeignHandle<R>) -> Result<Self> {
        let address = handle.address()?;
        let len = handle.byte_size().map(|bytes| bytes / size_of::<T>().max(1));
        // SAFETY: a live handle's address is valid for its reported byte
        // size, and the exclusive borrow of `handle` rules out both
        // disposal and a second view over the same memory.
        unsafe { Self::from_raw(address.as_ptr(), len) }
    }

    /// Base address.
    pub fn address(&self) -> NonNull<c_void> {
        self.base.cast()
    }

    /// Element count, if known.
    pub fn len(&self) -> Option<usize> {
        self.len
    }

    /// `Some(true)` for a known-empty view.
    pub fn is_empty(&self) -> Option<bool> {
        self.len.map(|n| n == 0)
    }

    /// Read element `i` without bounds checks.
    ///
    /// # Safety
    ///
    /// Element `i` must lie inside the foreign allocation.
    pub unsafe fn get(&self, i: usize) -> T {
        // SAFETY: caller contract.
        unsafe { raw::load(self.base, i * self.stride) }
    }

    /// Write element `i` without bounds checks.
    ///
    /// # Safety
    ///
    /// Element `i` must lie inside the foreign allocation, and no slice
    /// obtained from [`as_slice`](Self::as_slice) may be alive.
    pub unsafe fn set(&self, i: usize, value: T) {
        // SAFETY: caller contract.
        unsafe { raw::store(self.base, i * self.stride, value) }
    }

    fn check(&self, i: usize) -> Result<()> {
        let len = self.len.ok_or(InteropError::UnknownLength)?;
        if i >= len {
            return Err(InteropError::OutOfRange {
                index: i as isize,
                len,
            });
        }
        Ok(())
    }

    /// Bounds-checked read.
    pub fn get_checked(&self, i: usize) -> Result<T> {
        self.check(i)?;
        // SAFETY: `i < len`, and the constructor contract covers `len`.
        Ok(unsafe { self.get(i) })
    }

    /// Bounds-checked write.
    pub fn set_checked(&mut self, i: usize, value: T) -> Result<()> {
        self.check(i)?;
        // SAFETY: as for `get_checked`; `&mut self` excludes live slices.
        unsafe { self.set(i, value) };
        Ok(())
    }

    /// Copy every element out.
    pub fn to_vec(&self) -> Result<Vec<T>> {
        let len = self.len.ok_or(InteropError::UnknownLength)?;
        // SAFETY: every index is below `len`.
        Ok((0..len).map(|i| unsafe { self.get(i) }).collect())
    }

    /// Overwrite the first `src.len()` elements.
    pub fn copy_from(&mut self, src: &[T]) -> Result<()> {
        let len = self.len.ok_or(InteropError::UnknownLength)?;
        if src.len() > len {
            return Err(InteropError::OutOfRange {
                index: len as isize,
                len,
            });
        }
        if self.stride == size_of::<T>() {
            // SAFETY: `src.len() <= len` dense elements are in range, and a
            // Rust slice cannot overlap foreign memory we hold exclusively.
            unsafe { raw::write_bytes(self.base, bytemuck::cast_slice(src)) };
        } else {
            for (i, v) in src.iter().enumerate() {
                // SAFETY: `i < len`.
                unsafe { self.set(i, *v) };
            }
        }
        Ok(())
    }

    /// Borrow the elements as a slice.
    ///
    /// Needs a known length, a dense stride and an address aligned for `T`;
    /// fails with [`InteropError::InvalidArgument`] otherwise.
    pub fn as_slice(&self) -> Result<&[T]> {
        let len = self.len.ok_or(InteropError::UnknownLength)?;
        if self.stride != size_of::<T>() {
            return Err(InteropError::InvalidArgument {
                what: "strided view cannot be borrowed as a slice",
            });
        }
        // SAFETY: `len` dense elements are readable (constructor contract).
        // Writes through this view need `&mut self`, and the constructors
        // exclude sibling views over the same elements.
        let bytes = unsafe { raw::bytes(self.base, len * size_of::<T>()) };
        bytemuck::try_cast_slice(bytes).map_err(|_| InteropError::InvalidArgument {
            what: "address is not aligned for the element type",
        })
    }
}

impl<T: Pod> TypedView for ArrayPtr<'_, T> {
    type Elem = T;

    fn stride(&self) -> usize {
        self.stride
    }

    fn known_len(&self) -> Option<usize> {
        self.len
    }
}

impl<T> fmt::Debug for ArrayPtr<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArrayPtr")
            .field("address", &self.base)
            .field("stride", &self.stride)
            .field("len", &self.len)
            .finish()
    }
}
