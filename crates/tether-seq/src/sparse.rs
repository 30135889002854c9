//! Views over native sparse matrices.
//!
//! A sparse matrix is a hash table of nodes. Each node starts with its
//! hash value and chain link, then holds the element value at
//! `valoffset` and the `dims` indices at `idxoffset`. Nodes live in a
//! set (the heap), so the number of stored elements is the heap's active
//! count.

#![allow(unsafe_code)]

use std::ffi::c_void;
use std::fmt;
use std::mem::size_of;
use std::ptr::NonNull;

use bytemuck::Pod;
use smallvec::SmallVec;
use tether_core::{
    check_address, pin, Disposable, Enumerable, ForeignHandle, HandleBuilder, HasHandle,
    InteropConfig, InteropError, Release, Result,
};
use tether_layout::{catalog, raw, RawRecord};

use crate::acquire::SparseRelease;
use crate::api::NativeSeqApi;
use crate::set;
use crate::view::{self, Binding, EnumerationToken, ViewState};

const PTR: usize = size_of::<*mut c_void>();

type Index = SmallVec<[i32; 8]>;

/// Where values and indices sit inside a node, read once per access.
#[derive(Clone, Copy, Debug)]
struct NodeShape {
    dims: usize,
    valoffset: usize,
    idxoffset: usize,
}

impl NodeShape {
    fn read(header: &RawRecord<'_>) -> Result<Self> {
        let field = |name| {
            header
                .read::<i32>(name)
                .and_then(|v| usize::try_from(v).map_err(|_| broken()))
        };
        let shape = Self {
            dims: field("dims")?,
            valoffset: field("valoffset")?,
            idxoffset: field("idxoffset")?,
        };
        if shape.idxoffset < shape.valoffset {
            return Err(broken());
        }
        Ok(shape)
    }

    fn value_len(&self) -> usize {
        self.idxoffset - self.valoffset
    }
}

fn broken() -> InteropError {
    InteropError::BrokenLink { record: "SparseMat" }
}

fn node_link(node: NonNull<u8>) -> Result<Option<NonNull<u8>>> {
    // SAFETY: nodes reached from the bucket table are live.
    let record = unsafe { RawRecord::new(node.cast(), catalog::sparse_node()) };
    Ok(NonNull::new(record.read_ptr("next")?.cast()))
}

fn node_hash(node: NonNull<u8>) -> Result<u32> {
    // SAFETY: as for `node_link`.
    let record = unsafe { RawRecord::new(node.cast(), catalog::sparse_node()) };
    record.read::<u32>("hashval")
}

/// One stored element of a sparse matrix.
#[derive(Clone, Copy)]
pub struct SparseEntry<'v> {
    node: NonNull<u8>,
    shape: NodeShape,
    _view: std::marker::PhantomData<&'v ()>,
}

impl<'v> SparseEntry<'v> {
    /// Node address.
    pub fn address(&self) -> NonNull<c_void> {
        self.node.cast()
    }

    /// Address of the element value.
    pub fn value_address(&self) -> NonNull<c_void> {
        // SAFETY: `valoffset` lies inside the node.
        unsafe { raw::offset(self.node, self.shape.valoffset).cast() }
    }

    /// The element value as `T`, which may not exceed the value slot.
    pub fn value<T: Pod>(&self) -> Result<T> {
        if size_of::<T>() > self.shape.value_len() {
            return Err(InteropError::ElementSizeMismatch {
                expected: self.shape.value_len(),
                actual: size_of::<T>(),
            });
        }
        // SAFETY: bounds checked above.
        Ok(unsafe { raw::load(self.node, self.shape.valoffset) })
    }

    /// The element's coordinates.
    pub fn index(&self) -> SmallVec<[usize; 8]> {
        (0..self.shape.dims)
            .map(|d| {
                // SAFETY: the node stores `dims` indices at `idxoffset`.
                let i: i32 = unsafe { raw::load(self.node, self.shape.idxoffset + d * 4) };
                i as usize
            })
            .collect()
    }

    /// Stored hash of the coordinates.
    pub fn hashval(&self) -> Result<u32> {
        node_hash(self.node)
    }

    fn matches(&self, idx: &[i32]) -> bool {
        idx.iter().enumerate().all(|(d, &want)| {
            // SAFETY: as for `index`.
            let have: i32 = unsafe { raw::load(self.node, self.shape.idxoffset + d * 4) };
            have == want
        })
    }
}

impl fmt::Debug for SparseEntry<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SparseEntry")
            .field("address", &self.node)
            .field("index", &self.index())
            .finish()
    }
}

/// An n-dimensional sparse matrix owned by the native library.
///
/// Created matrices own their header and release it through
/// `release_sparse` exactly once. Views bound to a borrowed header pick a
/// different `R`.
pub struct SparseView<'n, N: NativeSeqApi + ?Sized, R: Release = SparseRelease<'n, N>> {
    native: &'n N,
    binding: Binding<R>,
}

impl<'n, N: NativeSeqApi + ?Sized> SparseView<'n, N> {
    /// Create an empty matrix of shape `sizes` whose values take
    /// `value_size` bytes.
    pub fn create(
        native: &'n N,
        sizes: &[usize],
        value_size: usize,
        config: InteropConfig,
    ) -> Result<Self> {
        config.validate()?;
        if sizes.is_empty() || sizes.len() > catalog::MAX_DIM {
            return Err(InteropError::InvalidArgument {
                what: "sparse matrices take 1 to 32 dimensions",
            });
        }
        let sizes: Index = sizes
            .iter()
            .map(|&s| i32::try_from(s).ok().filter(|&s| s > 0))
            .collect::<Option<_>>()
            .ok_or(InteropError::InvalidArgument {
                what: "dimension sizes must be positive ints",
            })?;
        let value_size = i32::try_from(value_size)
            .ok()
            .filter(|&v| v > 0)
            .ok_or(InteropError::InvalidArgument {
                what: "value size must be a positive int",
            })?;
        // SAFETY: `sizes` holds `dims` ints for the duration of the call.
        let raw = unsafe { native.create_sparse(sizes.len() as i32, sizes.as_ptr(), value_size) };
        let address = check_address(native, "create_sparse", raw)?;
        // SAFETY: a freshly created header.
        let byte_size = match unsafe { RawRecord::new(address, catalog::sparse()) }.size() {
            Ok(bytes) => bytes,
            Err(err) => {
                // SAFETY: no handle owns the matrix yet, so this is its
                // only release.
                unsafe { SparseRelease::new(native).release(address) };
                return Err(err);
            }
        };
        log::debug!("created {}-d sparse matrix at {address:p} ({byte_size} B)", sizes.len());
        let mut view = Self::unbound(native, config);
        // SAFETY: the matrix is owned by the handle and released through
        // its paired call.
        unsafe {
            let handle = HandleBuilder::new(address.as_ptr())
                .byte_size(byte_size)
                .config(config)
                .owned(SparseRelease::new(native))?;
            view.bind(handle)?;
        }
        Ok(view)
    }
}

impl<'n, N: NativeSeqApi + ?Sized, R: Release> SparseView<'n, N, R> {
    /// A view in the `Uninitialized` state.
    pub fn unbound(native: &'n N, config: InteropConfig) -> Self {
        Self {
            native,
            binding: Binding::unbound("sparse matrix", view::sparse_check(), config),
        }
    }

    /// Bind to the matrix header `handle` points at.
    ///
    /// Besides the signature, checks that `dims` is in `1..=32` and that
    /// the bucket count is a power of two.
    ///
    /// # Safety
    ///
    /// `handle` must address a live sparse matrix header created by
    /// `native` that stays valid while the view is bound.
    pub unsafe fn bind(&mut self, handle: ForeignHandle<R>) -> Result<()> {
        if self.binding.config().validate_layouts && self.binding.state() == ViewState::Uninitialized
        {
            // SAFETY: caller contract.
            let header = unsafe { RawRecord::new(handle.address()?, catalog::sparse()) };
            if catalog::has_magic(header.read::<i32>("type")?, catalog::SPARSE_MAGIC) {
                let dims = header.read::<i32>("dims")?;
                let hashsize = header.read::<i32>("hashsize")?;
                if !(1..=catalog::MAX_DIM as i32).contains(&dims)
                    || hashsize <= 0
                    || !(hashsize as u32).is_power_of_two()
                {
                    log::warn!("sparse header has {dims} dims and {hashsize} buckets");
                    return Err(InteropError::LayoutMismatch {
                        record: "SparseMat",
                        expected: catalog::MAX_DIM,
                        actual: dims.max(0) as usize,
                    });
                }
            }
        }
        // SAFETY: forwarded caller contract.
        unsafe { self.binding.bind(handle) }
    }

    /// Lifecycle state.
    pub fn state(&self) -> ViewState {
        self.binding.state()
    }

    fn shape(&self) -> Result<NodeShape> {
        NodeShape::read(&self.binding.header()?)
    }

    /// Number of dimensions.
    pub fn dims(&self) -> Result<usize> {
        Ok(self.shape()?.dims)
    }

    /// Extent of every dimension.
    pub fn sizes(&self) -> Result<SmallVec<[usize; 8]>> {
        let header = self.binding.header()?;
        let dims = self.shape()?.dims;
        (0..dims)
            .map(|d| {
                let size = header.read_at::<i32>("size", d)?;
                usize::try_from(size).map_err(|_| broken())
            })
            .collect()
    }

    /// Number of hash buckets.
    pub fn hashsize(&self) -> Result<usize> {
        let size = self.binding.header()?.read::<i32>("hashsize")?;
        usize::try_from(size).map_err(|_| broken())
    }

    /// Bytes available to each element value.
    pub fn value_size(&self) -> Result<usize> {
        Ok(self.shape()?.value_len())
    }

    /// Number of stored elements.
    pub fn nnz(&self) -> Result<usize> {
        let header = self.binding.header()?;
        // SAFETY: a matrix's `heap` points at its live node set.
        let heap = unsafe { header.follow("heap", catalog::set()) }?.ok_or_else(broken)?;
        set::active_count(&heap)
    }

    /// Header plus bucket table size in bytes.
    pub fn byte_size(&self) -> Result<usize> {
        self.binding.header()?.size()
    }

    fn checked_index(&self, idx: &[usize]) -> Result<Index> {
        let sizes = self.sizes()?;
        if idx.len() != sizes.len() {
            return Err(InteropError::InvalidArgument {
                what: "index arity does not match the matrix dimensions",
            });
        }
        idx.iter()
            .zip(&sizes)
            .map(|(&i, &len)| {
                if i >= len {
                    Err(InteropError::OutOfRange {
                        index: i as isize,
                        len,
                    })
                } else {
                    Ok(i as i32)
                }
            })
            .collect()
    }

    fn bucket_head(&self, bucket: usize) -> Result<Option<NonNull<u8>>> {
        let header = self.binding.header()?;
        let table = NonNull::new(header.read_ptr("hashtable")?.cast::<u8>()).ok_or_else(broken)?;
        // SAFETY: the table holds `hashsize` pointers and `bucket` is
        // masked (or bounded) by it.
        Ok(NonNull::new(unsafe { raw::load_ptr(table, bucket * PTR) }.cast()))
    }

    fn find(&self, idx: &[i32]) -> Result<Option<SparseEntry<'_>>> {
        let shape = self.shape()?;
        let hash = catalog::sparse_hash(idx);
        let mask = self.hashsize()?.checked_sub(1).ok_or_else(broken)?;
        let bucket = hash as usize & mask;
        let mut budget = self.nnz()? + 1;
        let mut current = self.bucket_head(bucket)?;
        while let Some(node) = current {
            budget = budget.checked_sub(1).ok_or_else(broken)?;
            let entry = SparseEntry {
                node,
                shape,
                _view: std::marker::PhantomData,
            };
            if node_hash(node)? == hash && entry.matches(idx) {
                return Ok(Some(entry));
            }
            current = node_link(node)?;
        }
        Ok(None)
    }

    /// The element at `idx`, if stored.
    ///
    /// Fails with [`InteropError::InvalidArgument`] when `idx` has the
    /// wrong number of coordinates and with [`InteropError::OutOfRange`]
    /// when a coordinate exceeds its dimension.
    pub fn get(&self, idx: &[usize]) -> Result<Option<SparseEntry<'_>>> {
        let idx = self.checked_index(idx)?;
        self.find(&idx)
    }

    /// The value at `idx` as `T`, if stored.
    pub fn read<T: Pod>(&self, idx: &[usize]) -> Result<Option<T>> {
        self.get(idx)?.map(|entry| entry.value()).transpose()
    }

    /// Walk every stored element, bucket by bucket.
    pub fn iter(&self) -> Result<SparseIter<'_>> {
        let shape = self.shape()?;
        let header = self.binding.header()?;
        let table = NonNull::new(header.read_ptr("hashtable")?.cast::<u8>()).ok_or_else(broken)?;
        let buckets = self.hashsize()?;
        let budget = self.nnz()?;
        let token = self.binding.enter_enumeration()?;
        Ok(SparseIter {
            table,
            buckets,
            bucket: 0,
            current: None,
            shape,
            budget,
            done: false,
            _token: token,
        })
    }

    /// Store `value` at `idx`, creating the node if needed.
    pub fn set<T: Pod>(&mut self, idx: &[usize], value: T) -> Result<()> {
        let capacity = self.value_size()?;
        if size_of::<T>() > capacity {
            return Err(InteropError::ElementSizeMismatch {
                expected: capacity,
                actual: size_of::<T>(),
            });
        }
        let mut idx = self.checked_index(idx)?;
        let header = self.binding.address()?;
        let raw = {
            let pinned = pin(&mut idx);
            // SAFETY: live header; `dims` pinned coordinates.
            unsafe { self.native.sparse_ptr(header.as_ptr(), pinned.as_ptr(), 1) }
        };
        let value_at = check_address(self.native, "sparse_ptr", raw)?;
        // SAFETY: the native call returned a value slot of `capacity` bytes.
        unsafe { raw::store(value_at.cast(), 0, value) };
        Ok(())
    }

    /// Remove the element at `idx`; returns whether one was stored.
    pub fn remove(&mut self, idx: &[usize]) -> Result<bool> {
        let mut idx = self.checked_index(idx)?;
        if self.find(&idx)?.is_none() {
            return Ok(false);
        }
        let header = self.binding.address()?;
        {
            let pinned = pin(&mut idx);
            // SAFETY: live header; `dims` pinned coordinates.
            unsafe { self.native.sparse_clear(header.as_ptr(), pinned.as_ptr()) };
        }
        if let Some(err) = self.native.take_error() {
            return Err(err.into());
        }
        Ok(true)
    }

    /// Enter the terminal `Released` state and release the matrix.
    pub fn release(&mut self) -> bool {
        self.binding.release()
    }
}

impl<N: NativeSeqApi + ?Sized, R: Release> Disposable for SparseView<'_, N, R> {
    fn dispose(&mut self) -> bool {
        self.release()
    }

    fn is_disposed(&self) -> bool {
        self.state() == ViewState::Released
    }
}

impl<N: NativeSeqApi + ?Sized, R: Release> HasHandle for SparseView<'_, N, R> {
    type Release = R;

    fn handle(&self) -> &ForeignHandle<R> {
        self.binding.handle()
    }
}

impl<N: NativeSeqApi + ?Sized, R: Release> Enumerable for SparseView<'_, N, R> {
    type Item<'a>
        = Result<SparseEntry<'a>>
    where
        Self: 'a;
    type Iter<'a>
        = SparseIter<'a>
    where
        Self: 'a;

    fn elements(&self) -> Result<SparseIter<'_>> {
        self.iter()
    }

    fn active_count(&self) -> Result<usize> {
        self.nnz()
    }
}

impl<N: NativeSeqApi + ?Sized, R: Release> fmt::Debug for SparseView<'_, N, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SparseView")
            .field("binding", &self.binding)
            .finish_non_exhaustive()
    }
}

/// Iterator over the stored elements of a sparse matrix, in bucket order.
pub struct SparseIter<'v> {
    table: NonNull<u8>,
    buckets: usize,
    bucket: usize,
    current: Option<NonNull<u8>>,
    shape: NodeShape,
    budget: usize,
    done: bool,
    _token: EnumerationToken<'v>,
}

impl SparseIter<'_> {
    fn advance(&mut self) -> Result<Option<NonNull<u8>>> {
        loop {
            if let Some(node) = self.current {
                self.budget = self.budget.checked_sub(1).ok_or_else(broken)?;
                self.current = node_link(node)?;
                return Ok(Some(node));
            }
            if self.bucket == self.buckets {
                return Ok(None);
            }
            // SAFETY: `bucket < hashsize`, inside the table.
            self.current = NonNull::new(unsafe { raw::load_ptr(self.table, self.bucket * PTR) }.cast());
            self.bucket += 1;
        }
    }
}

impl<'v> Iterator for SparseIter<'v> {
    type Item = Result<SparseEntry<'v>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(node)) => Some(Ok(SparseEntry {
                node,
                shape: self.shape,
                _view: std::marker::PhantomData,
            })),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl fmt::Debug for SparseIter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SparseIter")
            .field("bucket", &self.bucket)
            .field("buckets", &self.buckets)
            .finish_non_exhaustive()
    }
}
