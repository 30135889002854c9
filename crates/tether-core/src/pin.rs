//! Scoped pinning of caller-owned buffers for native calls.
//!
//! A [`PinGuard`] holds the exclusive borrow of a buffer for as long as a
//! native call may read or write through its address. Nothing can move or
//! free the buffer while the guard lives, and the guard unpins in `Drop`,
//! which also runs during unwinding.
//!
//! Guards nest: [`PinGuard::nested`] reborrows the outer guard, so the
//! inner guard is always released first.

use std::cell::Cell;
use std::ffi::c_void;
use std::fmt;

thread_local! {
    static ACTIVE_PINS: Cell<usize> = const { Cell::new(0) };
}

/// Number of pin guards alive on the current thread.
pub fn active_pins() -> usize {
    ACTIVE_PINS.with(Cell::get)
}

/// Pin `buffer` for the lifetime of the returned guard.
pub fn pin<T>(buffer: &mut [T]) -> PinGuard<'_, T> {
    PinGuard::enter(buffer)
}

/// Pin a single value for the lifetime of the returned guard.
pub fn pin_value<T>(value: &mut T) -> PinGuard<'_, T> {
    PinGuard::enter(std::slice::from_mut(value))
}

/// Scoped guarantee that a buffer's address is stable.
pub struct PinGuard<'a, T> {
    buffer: &'a mut [T],
    depth: usize,
}

impl<'a, T> PinGuard<'a, T> {
    fn enter(buffer: &'a mut [T]) -> Self {
        let depth = ACTIVE_PINS.with(|c| {
            let d = c.get() + 1;
            c.set(d);
            d
        });
        log::trace!("pinned {:p} ({} elements, depth {depth})", buffer.as_ptr(), buffer.len());
        Self { buffer, depth }
    }

    /// Pin the same buffer again for an inner scope.
    pub fn nested(&mut self) -> PinGuard<'_, T> {
        PinGuard::enter(&mut *self.buffer)
    }

    /// Read-only address of the first element.
    pub fn as_ptr(&self) -> *const T {
        self.buffer.as_ptr()
    }

    /// Writable address of the first element.
    pub fn as_mut_ptr(&mut self) -> *mut T {
        self.buffer.as_mut_ptr()
    }

    /// Address as the untyped pointer native entry points take.
    pub fn address(&mut self) -> *mut c_void {
        self.as_mut_ptr().cast()
    }

    /// Number of elements pinned.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the pinned buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Pinned size in bytes.
    pub fn byte_len(&self) -> usize {
        std::mem::size_of_val(&*self.buffer)
    }

    /// Nesting depth of this guard on the current thread.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// The pinned buffer, for inspecting what a native call wrote.
    pub fn as_slice(&self) -> &[T] {
        &*self.buffer
    }
}

impl<T> Drop for PinGuard<'_, T> {
    fn drop(&mut self) {
        ACTIVE_PINS.with(|c| c.set(c.get().saturating_sub(1)));
        log::trace!("unpinned {:p} (depth {})", self.buffer.as_ptr(), self.depth);
    }
}

impl<T> fmt::Debug for PinGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinGuard")
            .field("address", &self.buffer.as_ptr())
            .field("len", &self.buffer.len())
            .field("depth", &self.depth)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_exposes_stable_address() {
        let mut buf = vec![1.0f32, 2.0, 3.0];
        let expected = buf.as_ptr();
        let mut guard = pin(&mut buf);
        assert_eq!(guard.as_ptr(), expected);
        assert_eq!(guard.address(), expected as *mut c_void);
        assert_eq!(guard.len(), 3);
        assert_eq!(guard.byte_len(), 12);
    }

    #[test]
    fn nested_guards_unpin_lifo() {
        let base = active_pins();
        let mut buf = [0u8; 4];
        let mut outer = pin(&mut buf);
        assert_eq!(active_pins(), base + 1);
        let outer_depth = outer.depth();
        {
            let inner = outer.nested();
            assert_eq!(inner.depth(), outer_depth + 1);
            assert_eq!(active_pins(), base + 2);
        }
        assert_eq!(active_pins(), base + 1);
        drop(outer);
        assert_eq!(active_pins(), base);
    }

    #[test]
    fn unpins_on_unwind() {
        let base = active_pins();
        let result = std::panic::catch_unwind(|| {
            let mut buf = [0u32; 2];
            let _guard = pin(&mut buf);
            panic!("native call failed");
        });
        assert!(result.is_err());
        assert_eq!(active_pins(), base);
    }

    #[test]
    #[allow(unsafe_code)]
    fn writes_through_the_address_are_visible() {
        let mut value = 0i32;
        {
            let mut guard = pin_value(&mut value);
            let ptr = guard.as_mut_ptr();
            // Stand-in for a native out-parameter write.
            unsafe { *ptr = 42 };
            assert_eq!(guard.as_slice(), &[42]);
        }
        assert_eq!(value, 42);
    }
}
