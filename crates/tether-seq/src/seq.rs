//! Views over native sequences.

#![allow(unsafe_code)]

use std::ffi::c_void;
use std::fmt;
use std::ptr::NonNull;

use bytemuck::Pod;
use smallvec::SmallVec;
use tether_core::{
    check_address, pin, Disposable, Enumerable, ForeignHandle, HandleBuilder, HasHandle,
    InteropConfig, InteropError, NoRelease, Release, Result,
};
use tether_layout::catalog;

use crate::api::NativeSeqApi;
use crate::blocks::{self, BlockInfo, BlockWalk, SeqHeader};
use crate::node::NodeRef;
use crate::view::{self, Binding, EnumerationToken, ViewState};

/// Element buffers up to this size are staged on the stack.
pub(crate) type Scratch = SmallVec<[u8; 64]>;

/// A sequence in native block storage.
///
/// Index lookup walks the block ring; enumeration visits elements first to
/// last. Insertion and removal go through the native allocator.
pub struct SeqView<'n, N: NativeSeqApi + ?Sized, R: Release = NoRelease> {
    native: &'n N,
    binding: Binding<R>,
}

impl<'n, N: NativeSeqApi + ?Sized> SeqView<'n, N> {
    /// Create an empty sequence of `elem_size`-byte elements in `storage`.
    pub fn create<S: Release>(
        native: &'n N,
        storage: &'n ForeignHandle<S>,
        elem_size: usize,
        config: InteropConfig,
    ) -> Result<Self> {
        config.validate()?;
        let elem_size = i32::try_from(elem_size)
            .ok()
            .filter(|&n| n > 0)
            .ok_or(InteropError::InvalidArgument {
                what: "element size must be a positive int",
            })?;
        let storage = storage.address()?;
        let header_size = catalog::seq().header_size() as i32;
        // SAFETY: `storage` is a live storage from the same implementation.
        let raw = unsafe { native.create_seq(0, header_size, elem_size, storage.as_ptr()) };
        let address = check_address(native, "create_seq", raw)?;
        let mut view = Self::unbound(native, config);
        // SAFETY: a fresh header lives as long as its storage, which the
        // `'n` borrow keeps alive.
        unsafe {
            let handle = HandleBuilder::new(address.as_ptr())
                .byte_size(header_size as usize)
                .borrowed()?;
            view.bind(handle)?;
        }
        Ok(view)
    }

    /// Wrap an existing native sequence header without owning it.
    ///
    /// # Safety
    ///
    /// `header` must be a live sequence header that outlives the view.
    pub unsafe fn from_header(native: &'n N, header: *mut c_void) -> Result<Self> {
        let mut view = Self::unbound(native, InteropConfig::new());
        // SAFETY: forwarded caller contract.
        unsafe { view.bind(ForeignHandle::wrap(header)?)? };
        Ok(view)
    }
}

impl<'n, N: NativeSeqApi + ?Sized, R: Release> SeqView<'n, N, R> {
    /// A view in the `Uninitialized` state.
    pub fn unbound(native: &'n N, config: InteropConfig) -> Self {
        Self {
            native,
            binding: Binding::unbound("sequence", view::seq_check(), config),
        }
    }

    /// Bind to the sequence header `handle` points at.
    ///
    /// # Safety
    ///
    /// `handle` must address a live sequence header created by `native`
    /// that stays valid while the view is bound.
    pub unsafe fn bind(&mut self, handle: ForeignHandle<R>) -> Result<()> {
        // SAFETY: forwarded caller contract.
        unsafe { self.binding.bind(handle) }
    }

    /// Lifecycle state.
    pub fn state(&self) -> ViewState {
        self.binding.state()
    }

    fn seq(&self) -> Result<SeqHeader> {
        SeqHeader::read(&self.binding.header()?)
    }

    /// Number of elements.
    pub fn len(&self) -> Result<usize> {
        Ok(self.seq()?.total)
    }

    /// Whether the sequence holds no elements.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Element size in bytes.
    pub fn elem_size(&self) -> Result<usize> {
        Ok(self.seq()?.elem_size)
    }

    /// Element at `index`; negative indices count from the end.
    pub fn get(&self, index: isize) -> Result<NodeRef<'_>> {
        let seq = self.seq()?;
        let resolved = seq.normalize(index)?;
        let address = blocks::resolve(&seq, resolved, self.binding.config().max_block_walk)?;
        // SAFETY: `resolve` only returns addresses of live elements.
        Ok(unsafe { NodeRef::new(address, resolved, seq.elem_size) })
    }

    /// Read element `index` as `T`.
    pub fn read<T: Pod>(&self, index: isize) -> Result<T> {
        self.get(index)?.read()
    }

    /// Walk every element, first to last.
    pub fn iter(&self) -> Result<SeqIter<'_>> {
        let seq = self.seq()?;
        let token = self.binding.enter_enumeration()?;
        Ok(SeqIter::new(&seq, self.binding.config().max_block_walk, token))
    }

    /// The block directory, in ring order.
    pub fn blocks(&self) -> Result<SmallVec<[BlockInfo; 8]>> {
        let seq = self.seq()?;
        blocks::directory(&seq, self.binding.config().max_block_walk)
    }

    fn staged(&self, element: &[u8]) -> Result<Scratch> {
        let elem_size = self.seq()?.elem_size;
        if element.len() != elem_size {
            return Err(InteropError::ElementSizeMismatch {
                expected: elem_size,
                actual: element.len(),
            });
        }
        Ok(Scratch::from_slice(element))
    }

    /// Append `element`, whose length must equal the element size.
    pub fn push(&mut self, element: &[u8]) -> Result<NodeRef<'_>> {
        let mut scratch = self.staged(element)?;
        let header = self.binding.address()?;
        let raw = {
            let mut pinned = pin(&mut scratch);
            // SAFETY: live header; the pinned buffer holds one element.
            unsafe { self.native.seq_push(header.as_ptr(), pinned.address()) }
        };
        let address = check_address(self.native, "seq_push", raw)?;
        let index = self.len()? - 1;
        // SAFETY: the native call returned the new element's address.
        Ok(unsafe { NodeRef::new(address.cast(), index, element.len()) })
    }

    /// Append a plain value of exactly the element size.
    pub fn push_value<T: Pod>(&mut self, value: &T) -> Result<NodeRef<'_>> {
        self.push(bytemuck::bytes_of(value))
    }

    /// Insert `element` before `before_index`; `len()` appends.
    pub fn insert(&mut self, before_index: isize, element: &[u8]) -> Result<NodeRef<'_>> {
        let mut scratch = self.staged(element)?;
        let len = self.len()?;
        let resolved = if before_index < 0 {
            before_index + len as isize
        } else {
            before_index
        };
        if resolved < 0 || resolved as usize > len {
            return Err(InteropError::OutOfRange {
                index: before_index,
                len,
            });
        }
        let header = self.binding.address()?;
        let raw = {
            let mut pinned = pin(&mut scratch);
            // SAFETY: live header, in-range index, one pinned element.
            unsafe { self.native.seq_insert(header.as_ptr(), resolved as i32, pinned.address()) }
        };
        let address = check_address(self.native, "seq_insert", raw)?;
        // SAFETY: the native call returned the new element's address.
        Ok(unsafe { NodeRef::new(address.cast(), resolved as usize, element.len()) })
    }

    /// Remove the element at `index`; negative indices count from the end.
    pub fn remove(&mut self, index: isize) -> Result<()> {
        let resolved = self.seq()?.normalize(index)?;
        let header = self.binding.address()?;
        // SAFETY: live header, in-range index.
        unsafe { self.native.seq_remove(header.as_ptr(), resolved as i32) };
        if let Some(err) = self.native.take_error() {
            return Err(err.into());
        }
        Ok(())
    }

    /// Copy every element out as `T`.
    pub fn to_vec<T: Pod>(&self) -> Result<Vec<T>> {
        self.iter()?.map(|node| node?.read()).collect()
    }

    /// Enter the terminal `Released` state and dispose the header handle.
    pub fn release(&mut self) -> bool {
        self.binding.release()
    }
}

impl<N: NativeSeqApi + ?Sized, R: Release> Disposable for SeqView<'_, N, R> {
    fn dispose(&mut self) -> bool {
        self.release()
    }

    fn is_disposed(&self) -> bool {
        self.state() == ViewState::Released
    }
}

impl<N: NativeSeqApi + ?Sized, R: Release> HasHandle for SeqView<'_, N, R> {
    type Release = R;

    fn handle(&self) -> &ForeignHandle<R> {
        self.binding.handle()
    }
}

impl<N: NativeSeqApi + ?Sized, R: Release> Enumerable for SeqView<'_, N, R> {
    type Item<'a>
        = Result<NodeRef<'a>>
    where
        Self: 'a;
    type Iter<'a>
        = SeqIter<'a>
    where
        Self: 'a;

    fn elements(&self) -> Result<SeqIter<'_>> {
        self.iter()
    }

    fn active_count(&self) -> Result<usize> {
        self.len()
    }
}

impl<N: NativeSeqApi + ?Sized, R: Release> fmt::Debug for SeqView<'_, N, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeqView")
            .field("binding", &self.binding)
            .finish_non_exhaustive()
    }
}

/// Forward iterator over a sequence.
///
/// Yields `Err` once, and then stops, if the block ring turns out to be
/// inconsistent.
pub struct SeqIter<'v> {
    walk: BlockWalk,
    elem_size: usize,
    position: usize,
    done: bool,
    _token: EnumerationToken<'v>,
}

impl<'v> SeqIter<'v> {
    pub(crate) fn new(seq: &SeqHeader, max_walk: usize, token: EnumerationToken<'v>) -> Self {
        Self {
            walk: BlockWalk::new(seq, max_walk),
            elem_size: seq.elem_size,
            position: 0,
            done: false,
            _token: token,
        }
    }

    /// Next element address and its physical position. After the first
    /// error the walk is over.
    pub(crate) fn next_raw(&mut self) -> Result<Option<(NonNull<u8>, usize)>> {
        if self.done {
            return Ok(None);
        }
        match self.walk.next_address() {
            Ok(Some(address)) => {
                let position = self.position;
                self.position += 1;
                Ok(Some((address, position)))
            }
            Ok(None) => {
                self.done = true;
                Ok(None)
            }
            Err(e) => {
                self.done = true;
                Err(e)
            }
        }
    }

    pub(crate) fn elem_size(&self) -> usize {
        self.elem_size
    }
}

impl<'v> Iterator for SeqIter<'v> {
    type Item = Result<NodeRef<'v>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_raw() {
            // SAFETY: the walk only yields live element addresses.
            Ok(Some((address, position))) => {
                Some(Ok(unsafe { NodeRef::new(address, position, self.elem_size) }))
            }
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

impl fmt::Debug for SeqIter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeqIter")
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}
