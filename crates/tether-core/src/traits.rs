//! Capability traits shared by every wrapped native object.
//!
//! Wrappers compose these instead of inheriting from a common base: a
//! container view *has a handle*, *is disposable* and *is enumerable*; a
//! typed accessor *is a typed view*.

use crate::error::Result;
use crate::handle::ForeignHandle;
use crate::release::Release;

/// Access to the [`ForeignHandle`] a wrapper is built on.
pub trait HasHandle {
    /// Release routine of the underlying handle.
    type Release: Release;

    /// The handle that owns (or observes) the wrapper's address.
    fn handle(&self) -> &ForeignHandle<Self::Release>;

    /// Shortcut for `self.handle().is_valid()`.
    fn is_valid(&self) -> bool {
        self.handle().is_valid()
    }
}

/// The idempotent disposal transition.
pub trait Disposable {
    /// Run disposal. Returns `true` only for the call that released the
    /// foreign resource; every other call is a no-op returning `false`.
    fn dispose(&mut self) -> bool;

    /// Whether disposal has already run.
    fn is_disposed(&self) -> bool;
}

impl<R: Release> Disposable for ForeignHandle<R> {
    fn dispose(&mut self) -> bool {
        ForeignHandle::dispose(self)
    }

    fn is_disposed(&self) -> bool {
        ForeignHandle::is_disposed(self)
    }
}

/// A typed reinterpretation of foreign memory.
pub trait TypedView {
    /// Element type the memory is read as.
    type Elem;

    /// Size of one element in bytes.
    fn element_size(&self) -> usize {
        std::mem::size_of::<Self::Elem>()
    }

    /// Distance between consecutive elements in bytes.
    fn stride(&self) -> usize {
        self.element_size()
    }

    /// Element count, when the view was built with one.
    fn known_len(&self) -> Option<usize>;
}

/// A native container that can be walked first to last.
pub trait Enumerable {
    /// What one step of the walk yields.
    type Item<'a>
    where
        Self: 'a;

    /// The walk itself.
    type Iter<'a>: Iterator<Item = Self::Item<'a>>
    where
        Self: 'a;

    /// Start a fresh walk. Fails once the container has been released.
    fn elements(&self) -> Result<Self::Iter<'_>>;

    /// Number of elements a full walk yields.
    fn active_count(&self) -> Result<usize>;
}
