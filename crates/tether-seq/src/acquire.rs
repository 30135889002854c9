//! Paired acquisition and release of native allocator objects.

#![allow(unsafe_code)]

use std::ffi::c_void;
use std::fmt;
use std::ptr::NonNull;

use tether_core::{
    check_address, ForeignHandle, HandleBuilder, InteropConfig, InteropError, Release, Result,
};
use tether_layout::{catalog, RawRecord};

use crate::api::NativeSeqApi;

/// Releases a memory storage through `release_storage`.
pub struct StorageRelease<'a, N: ?Sized> {
    native: &'a N,
}

impl<'a, N: NativeSeqApi + ?Sized> StorageRelease<'a, N> {
    /// Pair with `native`'s `release_storage`.
    pub fn new(native: &'a N) -> Self {
        Self { native }
    }
}

impl<N: NativeSeqApi + ?Sized> Release for StorageRelease<'_, N> {
    unsafe fn release(&mut self, address: NonNull<c_void>) {
        let mut storage = address.as_ptr();
        // SAFETY: `address` came from `create_storage` on the same
        // implementation and is released exactly once (handle contract).
        unsafe { self.native.release_storage(&mut storage) };
        if let Some(err) = self.native.take_error() {
            log::warn!("release_storage reported {err}");
        }
    }
}

impl<N: ?Sized> fmt::Debug for StorageRelease<'_, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StorageRelease")
    }
}

/// Releases a sparse matrix through `release_sparse`.
pub struct SparseRelease<'a, N: ?Sized> {
    native: &'a N,
}

impl<'a, N: NativeSeqApi + ?Sized> SparseRelease<'a, N> {
    /// Pair with `native`'s `release_sparse`.
    pub fn new(native: &'a N) -> Self {
        Self { native }
    }
}

impl<N: NativeSeqApi + ?Sized> Release for SparseRelease<'_, N> {
    unsafe fn release(&mut self, address: NonNull<c_void>) {
        let mut mat = address.as_ptr();
        // SAFETY: as for `StorageRelease`.
        unsafe { self.native.release_sparse(&mut mat) };
        if let Some(err) = self.native.take_error() {
            log::warn!("release_sparse reported {err}");
        }
    }
}

impl<N: ?Sized> fmt::Debug for SparseRelease<'_, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SparseRelease")
    }
}

/// Create a memory storage and wrap it in an owning handle.
///
/// A `block_size` of zero asks the native side for its default block. The
/// handle reports the block size the storage header records to the
/// pressure sink, and calls `release_storage` exactly once when disposed.
pub fn open_storage<'a, N>(
    native: &'a N,
    block_size: usize,
    config: InteropConfig,
) -> Result<ForeignHandle<StorageRelease<'a, N>>>
where
    N: NativeSeqApi + ?Sized,
{
    config.validate()?;
    let requested = i32::try_from(block_size).map_err(|_| InteropError::InvalidArgument {
        what: "block size exceeds the native int range",
    })?;
    // SAFETY: `create_storage` takes no pointers.
    let raw = unsafe { native.create_storage(requested) };
    let address = check_address(native, "create_storage", raw)?;
    let mut release = StorageRelease::new(native);
    // SAFETY: a freshly created storage header.
    let actual = unsafe { RawRecord::new(address, catalog::mem_storage()) }
        .read::<i32>("block_size")
        .and_then(|n| {
            usize::try_from(n).map_err(|_| InteropError::LayoutMismatch {
                record: "MemStorage",
                expected: block_size,
                actual: 0,
            })
        });
    let actual = match actual {
        Ok(bytes) => bytes,
        Err(err) => {
            // SAFETY: no handle owns the storage yet, so this is its only
            // release.
            unsafe { release.release(address) };
            return Err(err);
        }
    };
    // SAFETY: `address` is a fresh storage paired with `release_storage`.
    unsafe {
        HandleBuilder::new(address.as_ptr())
            .byte_size(actual)
            .config(config)
            .owned(release)
    }
}
