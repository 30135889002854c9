//! Unchecked loads and stores into foreign memory.
//!
//! Everything that dereferences a foreign address funnels through the
//! handful of functions here. Callers establish bounds and liveness; these
//! functions only move bytes. All accesses are unaligned so that a
//! mis-laid record produces wrong values rather than a fault.

#![allow(unsafe_code)]

use std::ffi::c_void;
use std::mem::size_of;
use std::ptr::{self, NonNull};

use bytemuck::Pod;

/// Read a `T` at `base + offset`.
///
/// # Safety
///
/// `base + offset .. base + offset + size_of::<T>()` must be readable for
/// the duration of the call.
#[inline]
pub unsafe fn load<T: Pod>(base: NonNull<u8>, offset: usize) -> T {
    // SAFETY: the caller guarantees the byte range is readable.
    let bytes = unsafe {
        std::slice::from_raw_parts(base.as_ptr().add(offset), size_of::<T>())
    };
    bytemuck::pod_read_unaligned(bytes)
}

/// Write `value` at `base + offset`.
///
/// # Safety
///
/// `base + offset .. base + offset + size_of::<T>()` must be writable and
/// not aliased by any live Rust reference.
#[inline]
pub unsafe fn store<T: Pod>(base: NonNull<u8>, offset: usize, value: T) {
    // SAFETY: the caller guarantees the byte range is writable.
    unsafe {
        ptr::copy_nonoverlapping(
            bytemuck::bytes_of(&value).as_ptr(),
            base.as_ptr().add(offset),
            size_of::<T>(),
        )
    };
}

/// Read a pointer field at `base + offset`.
///
/// # Safety
///
/// Same contract as [`load`] for a pointer-sized range.
#[inline]
pub unsafe fn load_ptr(base: NonNull<u8>, offset: usize) -> *mut c_void {
    // SAFETY: forwarded caller contract.
    unsafe { ptr::read_unaligned(base.as_ptr().add(offset).cast::<*mut c_void>()) }
}

/// Write a pointer field at `base + offset`.
///
/// # Safety
///
/// Same contract as [`store`] for a pointer-sized range.
#[inline]
pub unsafe fn store_ptr(base: NonNull<u8>, offset: usize, value: *mut c_void) {
    // SAFETY: forwarded caller contract.
    unsafe { ptr::write_unaligned(base.as_ptr().add(offset).cast::<*mut c_void>(), value) };
}

/// Fill `dst` from foreign memory at `src`.
///
/// # Safety
///
/// `src .. src + dst.len()` must be readable and must not overlap `dst`.
#[inline]
pub unsafe fn read_bytes(src: NonNull<u8>, dst: &mut [u8]) {
    // SAFETY: caller contract; `dst` is an exclusive Rust buffer.
    unsafe { ptr::copy_nonoverlapping(src.as_ptr(), dst.as_mut_ptr(), dst.len()) };
}

/// Copy `src` into foreign memory at `dst`.
///
/// # Safety
///
/// `dst .. dst + src.len()` must be writable and must not overlap `src`.
#[inline]
pub unsafe fn write_bytes(dst: NonNull<u8>, src: &[u8]) {
    // SAFETY: caller contract.
    unsafe { ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), src.len()) };
}

/// View `len` bytes of foreign memory as a Rust slice.
///
/// # Safety
///
/// `base .. base + len` must be readable and not written through any
/// other path for `'a`.
#[inline]
pub unsafe fn bytes<'a>(base: NonNull<u8>, len: usize) -> &'a [u8] {
    // SAFETY: caller contract.
    unsafe { std::slice::from_raw_parts(base.as_ptr(), len) }
}

/// Mutable counterpart of [`bytes`].
///
/// # Safety
///
/// `base .. base + len` must be writable and not accessed through any
/// other path for `'a`.
#[inline]
pub unsafe fn bytes_mut<'a>(base: NonNull<u8>, len: usize) -> &'a mut [u8] {
    // SAFETY: caller contract.
    unsafe { std::slice::from_raw_parts_mut(base.as_ptr(), len) }
}

/// `base + by` as a non-null address.
///
/// # Safety
///
/// `base + by` must stay inside the allocation `base` points into.
#[inline]
pub unsafe fn offset(base: NonNull<u8>, by: usize) -> NonNull<u8> {
    // SAFETY: in-bounds per caller contract, so the sum cannot be null.
    unsafe { NonNull::new_unchecked(base.as_ptr().add(by)) }
}
