//! Views over native sets: sequences with a free list.
//!
//! A set slot is active when its flag word is non-negative; removed slots
//! carry the free flag and are chained through `next_free`. Physical
//! indices (what [`SetView::get`] takes) are stable for the life of an
//! element. Logical positions among active elements are what
//! [`SetView::nth_active`] takes.

#![allow(unsafe_code)]

use std::ffi::c_void;
use std::fmt;
use std::ptr::{self, NonNull};

use bytemuck::Pod;
use tether_core::{
    check_address, check_status, pin, pin_value, Disposable, Enumerable, ForeignHandle,
    HandleBuilder, HasHandle, InteropConfig, InteropError, NoRelease, Release, Result,
};
use tether_layout::{catalog, RawRecord};

use crate::api::NativeSeqApi;
use crate::blocks::{self, SeqHeader};
use crate::node::NodeRef;
use crate::seq::{Scratch, SeqIter};
use crate::view::{self, Binding, EnumerationToken, ViewState};

/// Build a full element buffer: zeroed `prefix` bytes, then `payload`,
/// zero-padded to `elem_size`.
pub(crate) fn staged_element(elem_size: usize, prefix: usize, payload: &[u8]) -> Result<Scratch> {
    let end = prefix
        .checked_add(payload.len())
        .filter(|&end| end <= elem_size)
        .ok_or(InteropError::ElementSizeMismatch {
            expected: elem_size.saturating_sub(prefix),
            actual: payload.len(),
        })?;
    let mut scratch = Scratch::from_elem(0, elem_size);
    scratch[prefix..end].copy_from_slice(payload);
    Ok(scratch)
}

/// Resolve physical `index` in the set at `header`, refusing free slots.
pub(crate) fn lookup<'v>(
    header: &RawRecord<'_>,
    index: isize,
    max_walk: usize,
) -> Result<NodeRef<'v>> {
    let seq = SeqHeader::read(header)?;
    let resolved = seq.normalize(index)?;
    let address = blocks::resolve(&seq, resolved, max_walk)?;
    // SAFETY: `resolve` returns live element addresses; the caller ties
    // `'v` to the borrow of the view that owns `header`.
    let node = unsafe { NodeRef::new(address, resolved, seq.elem_size) };
    if node.is_free()? {
        return Err(InteropError::FreeNode { index });
    }
    Ok(node)
}

pub(crate) fn active_count(header: &RawRecord<'_>) -> Result<usize> {
    usize::try_from(header.read::<i32>("active_count")?)
        .map_err(|_| InteropError::BrokenLink { record: "Set" })
}

/// Add an element through `set_add`, returning the new slot.
///
/// # Safety
///
/// `set` must be a live set header created by `native`.
pub(crate) unsafe fn add_through<'v, N: NativeSeqApi + ?Sized>(
    native: &N,
    set: NonNull<c_void>,
    mut element: Scratch,
) -> Result<NodeRef<'v>> {
    let elem_size = element.len();
    let mut inserted: *mut c_void = ptr::null_mut();
    let status = {
        let mut elem = pin(&mut element);
        let mut out = pin_value(&mut inserted);
        // SAFETY: live header (caller contract); both buffers are pinned
        // for the duration of the call.
        unsafe { native.set_add(set.as_ptr(), elem.address(), out.as_mut_ptr()) }
    };
    let index = check_status(native, "set_add", status)?;
    let address = check_address(native, "set_add", inserted)?;
    // SAFETY: the native call reported the slot it filled.
    Ok(unsafe { NodeRef::new(address.cast(), index as usize, elem_size) })
}

/// A set in native block storage.
pub struct SetView<'n, N: NativeSeqApi + ?Sized, R: Release = NoRelease> {
    native: &'n N,
    binding: Binding<R>,
}

impl<'n, N: NativeSeqApi + ?Sized> SetView<'n, N> {
    /// Create an empty set whose elements carry `payload_size` bytes after
    /// the set element prefix.
    pub fn create<S: Release>(
        native: &'n N,
        storage: &'n ForeignHandle<S>,
        payload_size: usize,
        config: InteropConfig,
    ) -> Result<Self> {
        config.validate()?;
        let prefix = catalog::set_elem().header_size();
        let elem_size = (prefix + payload_size).next_multiple_of(catalog::set_elem().align());
        let elem_size = i32::try_from(elem_size).map_err(|_| InteropError::InvalidArgument {
            what: "element size exceeds the native int range",
        })?;
        let storage = storage.address()?;
        let header_size = catalog::set().header_size() as i32;
        // SAFETY: `storage` is a live storage from the same implementation.
        let raw = unsafe { native.create_set(0, header_size, elem_size, storage.as_ptr()) };
        let address = check_address(native, "create_set", raw)?;
        let mut view = Self::unbound(native, config);
        // SAFETY: the header lives as long as its storage.
        unsafe {
            let handle = HandleBuilder::new(address.as_ptr())
                .byte_size(header_size as usize)
                .borrowed()?;
            view.bind(handle)?;
        }
        Ok(view)
    }

    /// Wrap an existing native set header without owning it.
    ///
    /// # Safety
    ///
    /// `header` must be a live set header that outlives the view.
    pub unsafe fn from_header(native: &'n N, header: *mut c_void) -> Result<Self> {
        let mut view = Self::unbound(native, InteropConfig::new());
        // SAFETY: forwarded caller contract.
        unsafe { view.bind(ForeignHandle::wrap(header)?)? };
        Ok(view)
    }
}

impl<'n, N: NativeSeqApi + ?Sized, R: Release> SetView<'n, N, R> {
    /// A view in the `Uninitialized` state.
    pub fn unbound(native: &'n N, config: InteropConfig) -> Self {
        Self {
            native,
            binding: Binding::unbound("set", view::set_check(), config),
        }
    }

    /// Bind to the set header `handle` points at.
    ///
    /// # Safety
    ///
    /// `handle` must address a live set header created by `native` that
    /// stays valid while the view is bound.
    pub unsafe fn bind(&mut self, handle: ForeignHandle<R>) -> Result<()> {
        // SAFETY: forwarded caller contract.
        unsafe { self.binding.bind(handle) }
    }

    /// Lifecycle state.
    pub fn state(&self) -> ViewState {
        self.binding.state()
    }

    fn max_walk(&self) -> usize {
        self.binding.config().max_block_walk
    }

    /// Number of active elements.
    pub fn active_count(&self) -> Result<usize> {
        active_count(&self.binding.header()?)
    }

    /// Number of slots, active or free.
    pub fn capacity(&self) -> Result<usize> {
        Ok(SeqHeader::read(&self.binding.header()?)?.total)
    }

    /// Size of one slot in bytes, prefix included.
    pub fn elem_size(&self) -> Result<usize> {
        Ok(SeqHeader::read(&self.binding.header()?)?.elem_size)
    }

    /// Bytes available to callers after the set element prefix.
    pub fn payload_size(&self) -> Result<usize> {
        let elem_size = self.elem_size()?;
        let prefix = catalog::set_elem().header_size();
        elem_size
            .checked_sub(prefix)
            .ok_or(InteropError::ElementSizeMismatch {
                expected: prefix,
                actual: elem_size,
            })
    }

    /// Slot at physical `index`; negative indices count from the last slot.
    ///
    /// Fails with [`InteropError::FreeNode`] if the slot is on the free
    /// list and with [`InteropError::OutOfRange`] past the last slot.
    pub fn get(&self, index: isize) -> Result<NodeRef<'_>> {
        lookup(&self.binding.header()?, index, self.max_walk())
    }

    /// The `n`-th active element in enumeration order; `-1` is the last.
    pub fn nth_active(&self, n: isize) -> Result<NodeRef<'_>> {
        let len = self.active_count()?;
        let resolved = if n < 0 { n + len as isize } else { n };
        if resolved < 0 || resolved as usize >= len {
            return Err(InteropError::OutOfRange { index: n, len });
        }
        self.iter()?
            .nth(resolved as usize)
            .unwrap_or(Err(InteropError::BrokenLink { record: "Set" }))
    }

    /// Read the payload of the element at physical `index` as `T`.
    pub fn read_payload<T: Pod>(&self, index: isize) -> Result<T> {
        self.get(index)?
            .read_at(catalog::set_elem().header_size())
    }

    /// Walk active elements in slot order, skipping free slots.
    pub fn iter(&self) -> Result<SetIter<'_>> {
        let header = self.binding.header()?;
        let seq = SeqHeader::read(&header)?;
        let token = self.binding.enter_enumeration()?;
        Ok(SetIter::new(&seq, self.max_walk(), token))
    }

    /// Add an element carrying `payload`, reusing a free slot if one exists.
    pub fn add(&mut self, payload: &[u8]) -> Result<NodeRef<'_>> {
        let elem_size = self.elem_size()?;
        let element = staged_element(elem_size, catalog::set_elem().header_size(), payload)?;
        let header = self.binding.address()?;
        // SAFETY: live, bound set header.
        unsafe { add_through(self.native, header, element) }
    }

    /// Add an element whose payload is `value`.
    pub fn add_value<T: Pod>(&mut self, value: &T) -> Result<NodeRef<'_>> {
        self.add(bytemuck::bytes_of(value))
    }

    /// Free the slot at physical `index`.
    pub fn remove(&mut self, index: isize) -> Result<()> {
        let node = self.get(index)?;
        let physical = node.index() as i32;
        let header = self.binding.address()?;
        // SAFETY: live header, active slot.
        unsafe { self.native.set_remove(header.as_ptr(), physical) };
        if let Some(err) = self.native.take_error() {
            return Err(err.into());
        }
        Ok(())
    }

    /// Enter the terminal `Released` state and dispose the header handle.
    pub fn release(&mut self) -> bool {
        self.binding.release()
    }
}

impl<N: NativeSeqApi + ?Sized, R: Release> Disposable for SetView<'_, N, R> {
    fn dispose(&mut self) -> bool {
        self.release()
    }

    fn is_disposed(&self) -> bool {
        self.state() == ViewState::Released
    }
}

impl<N: NativeSeqApi + ?Sized, R: Release> HasHandle for SetView<'_, N, R> {
    type Release = R;

    fn handle(&self) -> &ForeignHandle<R> {
        self.binding.handle()
    }
}

impl<N: NativeSeqApi + ?Sized, R: Release> Enumerable for SetView<'_, N, R> {
    type Item<'a>
        = Result<NodeRef<'a>>
    where
        Self: 'a;
    type Iter<'a>
        = SetIter<'a>
    where
        Self: 'a;

    fn elements(&self) -> Result<SetIter<'_>> {
        self.iter()
    }

    fn active_count(&self) -> Result<usize> {
        SetView::active_count(self)
    }
}

impl<N: NativeSeqApi + ?Sized, R: Release> fmt::Debug for SetView<'_, N, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SetView")
            .field("binding", &self.binding)
            .finish_non_exhaustive()
    }
}

/// Iterator over the active elements of a set. Free slots are never
/// yielded; each item's [`index`](NodeRef::index) is its physical slot.
pub struct SetIter<'v> {
    inner: SeqIter<'v>,
}

impl<'v> SetIter<'v> {
    pub(crate) fn new(seq: &SeqHeader, max_walk: usize, token: EnumerationToken<'v>) -> Self {
        Self {
            inner: SeqIter::new(seq, max_walk, token),
        }
    }
}

impl<'v> Iterator for SetIter<'v> {
    type Item = Result<NodeRef<'v>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (address, position) = match self.inner.next_raw() {
                Ok(Some(next)) => next,
                Ok(None) => return None,
                Err(e) => return Some(Err(e)),
            };
            // SAFETY: the walk only yields live element addresses.
            let node = unsafe { NodeRef::new(address, position, self.inner.elem_size()) };
            match node.is_free() {
                Ok(true) => continue,
                Ok(false) => return Some(Ok(node)),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

impl fmt::Debug for SetIter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SetIter").field("inner", &self.inner).finish()
    }
}
