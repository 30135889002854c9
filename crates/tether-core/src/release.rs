//! Release routines paired with native acquisition calls.
//!
//! Every native acquisition entry point has exactly one matching release
//! entry point. A [`Release`] value is that pairing, carried inside the
//! [`ForeignHandle`](crate::ForeignHandle) that owns the address.

#![allow(unsafe_code)]

use std::ffi::c_void;
use std::fmt;
use std::ptr::NonNull;

/// The native routine that releases an acquired address.
///
/// [`ForeignHandle`](crate::ForeignHandle) calls [`release`](Release::release)
/// at most once per handle, with the address it was acquired with, and
/// never on a handle that does not own its address.
pub trait Release {
    /// Release the foreign resource at `address`.
    ///
    /// # Safety
    ///
    /// `address` must be the live address returned by the paired
    /// acquisition call and must not be dereferenced after this returns.
    unsafe fn release(&mut self, address: NonNull<c_void>);
}

/// Release routine for borrowed addresses: does nothing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NoRelease;

impl Release for NoRelease {
    unsafe fn release(&mut self, _address: NonNull<c_void>) {}
}

/// Adapter for release entry points that take the address by reference
/// and null it out, i.e. `void release(T** ptr)`.
#[derive(Clone, Copy)]
pub struct FnRelease(pub unsafe extern "C" fn(*mut *mut c_void));

impl Release for FnRelease {
    unsafe fn release(&mut self, address: NonNull<c_void>) {
        let mut ptr = address.as_ptr();
        // SAFETY: `ptr` is the live acquired address (caller contract); the
        // callee may null the local copy, which is discarded.
        unsafe { (self.0)(&mut ptr) };
    }
}

impl fmt::Debug for FnRelease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FnRelease({:p})", self.0 as *const ())
    }
}

/// Adapter for `void free(T* ptr)`-style release entry points.
#[derive(Clone, Copy)]
pub struct FnFree(pub unsafe extern "C" fn(*mut c_void));

impl Release for FnFree {
    unsafe fn release(&mut self, address: NonNull<c_void>) {
        // SAFETY: forwarded caller contract.
        unsafe { (self.0)(address.as_ptr()) };
    }
}

impl fmt::Debug for FnFree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FnFree({:p})", self.0 as *const ())
    }
}

/// Closures release through their body. Handy for bindings that need to
/// capture a context pointer alongside the address.
impl<F> Release for F
where
    F: FnMut(NonNull<c_void>),
{
    unsafe fn release(&mut self, address: NonNull<c_void>) {
        self(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static RELEASED_BY_REF: AtomicUsize = AtomicUsize::new(0);
    static FREED: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn release_by_ref(ptr: *mut *mut c_void) {
        RELEASED_BY_REF.fetch_add(1, Ordering::SeqCst);
        // SAFETY: FnRelease passes a pointer to a live local.
        unsafe { *ptr = std::ptr::null_mut() };
    }

    unsafe extern "C" fn free_fn(_ptr: *mut c_void) {
        FREED.fetch_add(1, Ordering::SeqCst);
    }

    fn dummy_address() -> NonNull<c_void> {
        NonNull::<u64>::dangling().cast()
    }

    #[test]
    fn fn_release_forwards_address_by_reference() {
        let mut release = FnRelease(release_by_ref);
        let before = RELEASED_BY_REF.load(Ordering::SeqCst);
        unsafe { release.release(dummy_address()) };
        assert_eq!(RELEASED_BY_REF.load(Ordering::SeqCst), before + 1);
    }

    #[test]
    fn fn_free_forwards_address() {
        let mut release = FnFree(free_fn);
        let before = FREED.load(Ordering::SeqCst);
        unsafe { release.release(dummy_address()) };
        assert_eq!(FREED.load(Ordering::SeqCst), before + 1);
    }

    #[test]
    fn closure_release_sees_the_address() {
        let addr = dummy_address();
        let mut seen = None;
        {
            let mut release = |a: NonNull<c_void>| seen = Some(a);
            unsafe { release.release(addr) };
        }
        assert_eq!(seen, Some(addr));
    }

    #[test]
    fn no_release_is_inert() {
        let mut release = NoRelease;
        unsafe { release.release(dummy_address()) };
    }
}
