//! A heap-backed implementation of the native dynamic-structure API.
//!
//! Every record is allocated zeroed with 16-byte alignment and written
//! through the same layouts the views read, so a view cannot tell the
//! mock from a linked library. Storages own all of their allocations and
//! free them together on `release_storage`. A sparse matrix gets a private
//! storage for its header, bucket table and node heap.
//!
//! Blocks start at 4 elements and double up to 1024. Inserting into a
//! full block splits it, so block sizes are uneven after insertions.

use std::alloc::{self, Layout};
use std::cell::RefCell;
use std::ffi::c_void;
use std::fmt;
use std::mem::size_of;
use std::ptr::{self, NonNull};

use indexmap::IndexMap;
use tether_core::{ErrorChannel, InteropError, NativeError, Status};
use tether_layout::catalog::{
    self, KIND_GRAPH, MAGIC_MASK, SEQ_MAGIC, SET_ELEM_FREE_FLAG, SET_ELEM_IDX_MASK, SET_MAGIC,
    SPARSE_MAGIC, STORAGE_MAGIC,
};
use tether_layout::{raw, RawRecord, RecordLayout};
use tether_seq::NativeSeqApi;

const ALIGN: usize = 16;
const PTR: usize = size_of::<*mut c_void>();
const MIN_BLOCK_ELEMS: usize = 4;
const MAX_BLOCK_ELEMS: usize = 1024;
/// Block size a storage gets when created with a zero block size.
pub const DEFAULT_STORAGE_BLOCK: usize = 65408;

/// Bucket count of sparse matrices unless overridden.
pub const DEFAULT_SPARSE_HASH_SIZE: usize = 1024;

/// A failure inside a mock entry point, reported through the error
/// channel with the entry point's name attached.
#[derive(Debug)]
struct Fault {
    status: Status,
    message: String,
}

impl Fault {
    fn new(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn broken(what: &str) -> Self {
        Self::new(Status::BadMemBlock, format!("{what} link is broken"))
    }

    fn out_of_range(index: i64, len: usize) -> Self {
        Self::new(
            Status::OutOfRange,
            format!("index {index} is out of range for {len} elements"),
        )
    }
}

impl From<InteropError> for Fault {
    fn from(e: InteropError) -> Self {
        Self::new(Status::from(&e), e.to_string())
    }
}

type Op<T> = Result<T, Fault>;

fn record(address: NonNull<u8>, layout: &'static RecordLayout) -> RawRecord<'static> {
    // SAFETY: only called with live mock allocations at least as large as
    // `layout`'s header.
    unsafe { RawRecord::new(address.cast(), layout) }
}

fn ptr_of(address: NonNull<u8>) -> *mut c_void {
    address.as_ptr().cast()
}

fn non_null(address: *mut c_void, what: &str) -> Op<NonNull<u8>> {
    NonNull::new(address.cast::<u8>())
        .ok_or_else(|| Fault::new(Status::NullPtr, format!("{what} is null")))
}

fn link(record: &RawRecord<'_>, field: &str) -> Op<Option<NonNull<u8>>> {
    Ok(NonNull::new(record.read_ptr(field)?.cast()))
}

fn count_of(record: &RawRecord<'_>, field: &str) -> Op<usize> {
    usize::try_from(record.read::<i32>(field)?)
        .map_err(|_| Fault::new(Status::BadMemBlock, format!("negative {field}")))
}

fn offset(base: NonNull<u8>, by: usize) -> NonNull<u8> {
    // SAFETY: every caller stays inside one mock allocation.
    unsafe { raw::offset(base, by) }
}

fn fill(dst: NonNull<u8>, src: *const c_void, len: usize) {
    // SAFETY: `dst` is a mock element of `len` bytes; a non-null `src` is a
    // caller buffer of at least `len` bytes that does not overlap it.
    unsafe {
        if src.is_null() {
            ptr::write_bytes(dst.as_ptr(), 0, len);
        } else {
            ptr::copy_nonoverlapping(src.cast::<u8>(), dst.as_ptr(), len);
        }
    }
}

fn allocate(layout: Layout) -> Op<NonNull<u8>> {
    // SAFETY: `layout` always has a non-zero size.
    NonNull::new(unsafe { alloc::alloc_zeroed(layout) })
        .ok_or_else(|| Fault::new(Status::NoMem, "allocation failed"))
}

struct Storage {
    header: NonNull<u8>,
    allocations: Vec<(NonNull<u8>, Layout)>,
    internal: bool,
}

/// The fields of a sequence header the mock works with.
#[derive(Clone, Copy)]
struct SeqInfo {
    total: usize,
    elem_size: usize,
    first: Option<NonNull<u8>>,
    storage: NonNull<u8>,
}

fn seq_info(seq: NonNull<u8>) -> Op<SeqInfo> {
    let r = record(seq, catalog::seq());
    Ok(SeqInfo {
        total: count_of(&r, "total")?,
        elem_size: count_of(&r, "elem_size")?,
        first: link(&r, "first")?,
        storage: link(&r, "storage")?.ok_or_else(|| Fault::broken("storage"))?,
    })
}

fn block(address: NonNull<u8>) -> RawRecord<'static> {
    record(address, catalog::seq_block())
}

fn next_block(b: NonNull<u8>) -> Op<NonNull<u8>> {
    link(&block(b), "next")?.ok_or_else(|| Fault::broken("block"))
}

fn block_data(b: NonNull<u8>) -> Op<NonNull<u8>> {
    link(&block(b), "data")?.ok_or_else(|| Fault::broken("block data"))
}

/// The sparse header fields, read once per call.
struct SparseInfo {
    dims: usize,
    sizes: Vec<i32>,
    hashsize: usize,
    valoffset: usize,
    idxoffset: usize,
    table: NonNull<u8>,
    heap: NonNull<u8>,
}

fn sparse_info(mat: NonNull<u8>) -> Op<SparseInfo> {
    let r = record(mat, catalog::sparse());
    if !catalog::has_magic(r.read::<i32>("type")?, SPARSE_MAGIC) {
        return Err(Fault::new(Status::BadArg, "not a sparse matrix"));
    }
    let dims = count_of(&r, "dims")?;
    let sizes = (0..dims)
        .map(|d| r.read_at::<i32>("size", d))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(SparseInfo {
        dims,
        sizes,
        hashsize: count_of(&r, "hashsize")?,
        valoffset: count_of(&r, "valoffset")?,
        idxoffset: count_of(&r, "idxoffset")?,
        table: link(&r, "hashtable")?.ok_or_else(|| Fault::broken("hash table"))?,
        heap: link(&r, "heap")?.ok_or_else(|| Fault::broken("node heap"))?,
    })
}

impl SparseInfo {
    fn bucket(&self, hash: u32) -> usize {
        hash as usize & (self.hashsize - 1)
    }

    fn head(&self, bucket: usize) -> Option<NonNull<u8>> {
        // SAFETY: `bucket < hashsize`, inside the table.
        NonNull::new(unsafe { raw::load_ptr(self.table, bucket * PTR) }.cast())
    }

    fn set_head(&self, bucket: usize, node: *mut c_void) {
        // SAFETY: as for `head`.
        unsafe { raw::store_ptr(self.table, bucket * PTR, node) }
    }

    fn coordinate(&self, node: NonNull<u8>, d: usize) -> i32 {
        // SAFETY: nodes hold `dims` indices at `idxoffset`.
        unsafe { raw::load(node, self.idxoffset + d * 4) }
    }

    /// Copy and range-check a caller's index array.
    fn index(&self, idx: *const i32) -> Op<Vec<i32>> {
        if idx.is_null() {
            return Err(Fault::new(Status::NullPtr, "index array is null"));
        }
        // SAFETY: callers pass `dims` ints (entry point contract).
        let idx = unsafe { std::slice::from_raw_parts(idx, self.dims) }.to_vec();
        for (&i, &size) in idx.iter().zip(&self.sizes) {
            if i < 0 || i >= size {
                return Err(Fault::out_of_range(i.into(), size as usize));
            }
        }
        Ok(idx)
    }

    /// The node at `idx` and its chain predecessor.
    fn find(&self, idx: &[i32], hash: u32) -> Op<(Option<NonNull<u8>>, Option<NonNull<u8>>)> {
        let mut prev = None;
        let mut current = self.head(self.bucket(hash));
        while let Some(node) = current {
            let r = record(node, catalog::sparse_node());
            let same = r.read::<u32>("hashval")? == hash
                && idx
                    .iter()
                    .enumerate()
                    .all(|(d, &i)| self.coordinate(node, d) == i);
            if same {
                return Ok((prev, Some(node)));
            }
            prev = Some(node);
            current = link(&r, "next")?;
        }
        Ok((prev, None))
    }
}

struct State {
    /// Live storages by header address. A release of an address missing
    /// here is a double release.
    storages: IndexMap<usize, Storage>,
    block_capacity: IndexMap<usize, usize>,
    /// Sparse matrix header address to its private storage header.
    matrices: IndexMap<usize, NonNull<u8>>,
    sparse_hash_size: usize,
    /// Write a negative bucket count into the next sparse header.
    corrupt_next_sparse: bool,
    pending: Option<NativeError>,
    injected: IndexMap<&'static str, Status>,
    storage_releases: usize,
    sparse_releases: usize,
    double_releases: usize,
}

impl State {
    fn new_storage(&mut self, block_size: usize, internal: bool) -> Op<NonNull<u8>> {
        let layout = Layout::from_size_align(catalog::mem_storage().header_size(), ALIGN)
            .map_err(|_| Fault::new(Status::BadSize, "storage header layout"))?;
        let header = allocate(layout)?;
        let r = record(header, catalog::mem_storage());
        let block_size = i32::try_from(block_size)
            .map_err(|_| Fault::new(Status::BadSize, "block size exceeds int range"))?;
        r.write::<i32>("signature", STORAGE_MAGIC as i32)?;
        r.write::<i32>("block_size", block_size)?;
        r.write::<i32>("free_space", block_size)?;
        self.storages.insert(
            header.as_ptr() as usize,
            Storage {
                header,
                allocations: vec![(header, layout)],
                internal,
            },
        );
        log::trace!("mock storage {header:p} ({block_size} B)");
        Ok(header)
    }

    fn unknown_storage() -> Fault {
        Fault::new(Status::BadArg, "unknown or released storage")
    }

    fn alloc_in(&mut self, storage: NonNull<u8>, size: usize) -> Op<NonNull<u8>> {
        let key = storage.as_ptr() as usize;
        if !self.storages.contains_key(&key) {
            return Err(Self::unknown_storage());
        }
        let layout = Layout::from_size_align(size.max(1), ALIGN)
            .map_err(|_| Fault::new(Status::BadSize, "allocation size overflows"))?;
        let address = allocate(layout)?;
        self.storages
            .get_mut(&key)
            .ok_or_else(Self::unknown_storage)?
            .allocations
            .push((address, layout));
        Ok(address)
    }

    fn free_storage(&mut self, storage: NonNull<u8>) -> Op<()> {
        let removed = self
            .storages
            .swap_remove(&(storage.as_ptr() as usize))
            .ok_or_else(Self::unknown_storage)?;
        for (address, layout) in removed.allocations {
            self.block_capacity.swap_remove(&(address.as_ptr() as usize));
            // SAFETY: allocated with exactly this layout and freed once,
            // since the storage was just removed from the map.
            unsafe { alloc::dealloc(address.as_ptr(), layout) };
        }
        Ok(())
    }

    fn release_storage(&mut self, pp: *mut *mut c_void) -> Op<()> {
        if pp.is_null() {
            return Err(Fault::new(Status::NullPtr, "storage pointer is null"));
        }
        // SAFETY: `pp` is a caller-owned slot.
        let storage = unsafe { *pp };
        let Some(storage) = NonNull::new(storage.cast::<u8>()) else {
            self.double_releases += 1;
            return Ok(());
        };
        if let Err(fault) = self.free_storage(storage) {
            self.double_releases += 1;
            return Err(fault);
        }
        // SAFETY: as above.
        unsafe { *pp = ptr::null_mut() };
        self.storage_releases += 1;
        Ok(())
    }

    fn capacity(&self, b: NonNull<u8>) -> Op<usize> {
        self.block_capacity
            .get(&(b.as_ptr() as usize))
            .copied()
            .ok_or_else(|| Fault::new(Status::BadMemBlock, "unknown block"))
    }

    fn init_seq(
        &mut self,
        storage: NonNull<u8>,
        flags: u32,
        header_size: i32,
        elem_size: i32,
        min_header: usize,
    ) -> Op<NonNull<u8>> {
        let header_size = usize::try_from(header_size)
            .ok()
            .filter(|&h| h >= min_header)
            .ok_or_else(|| Fault::new(Status::BadSize, "header size is too small"))?;
        if elem_size <= 0 {
            return Err(Fault::new(Status::BadSize, "element size must be positive"));
        }
        let header = self.alloc_in(storage, header_size)?;
        let r = record(header, catalog::seq());
        r.write::<i32>("flags", flags as i32)?;
        r.write::<i32>("header_size", header_size as i32)?;
        r.write::<i32>("elem_size", elem_size)?;
        r.write_ptr("storage", ptr_of(storage))?;
        Ok(header)
    }

    fn new_block(&mut self, info: &SeqInfo, capacity: usize) -> Op<NonNull<u8>> {
        let header = catalog::seq_block().header_size();
        let b = self.alloc_in(info.storage, header + capacity * info.elem_size)?;
        block(b).write_ptr("data", ptr_of(offset(b, header)))?;
        self.block_capacity.insert(b.as_ptr() as usize, capacity);
        Ok(b)
    }

    /// Link `b` into the ring after `anchor`, or as the only block.
    fn link_after(&mut self, seq: NonNull<u8>, anchor: Option<NonNull<u8>>, b: NonNull<u8>) -> Op<()> {
        let r = block(b);
        match anchor {
            None => {
                r.write_ptr("prev", ptr_of(b))?;
                r.write_ptr("next", ptr_of(b))?;
                record(seq, catalog::seq()).write_ptr("first", ptr_of(b))?;
            }
            Some(a) => {
                let next = next_block(a)?;
                r.write_ptr("prev", ptr_of(a))?;
                r.write_ptr("next", ptr_of(next))?;
                block(next).write_ptr("prev", ptr_of(b))?;
                block(a).write_ptr("next", ptr_of(b))?;
            }
        }
        Ok(())
    }

    fn unlink_block(&mut self, seq: NonNull<u8>, b: NonNull<u8>) -> Op<()> {
        let header = record(seq, catalog::seq());
        let next = next_block(b)?;
        let prev = link(&block(b), "prev")?.ok_or_else(|| Fault::broken("block"))?;
        if next == b {
            header.write_ptr("first", ptr::null_mut())?;
        } else {
            block(prev).write_ptr("next", ptr_of(next))?;
            block(next).write_ptr("prev", ptr_of(prev))?;
            if link(&header, "first")? == Some(b) {
                header.write_ptr("first", ptr_of(next))?;
            }
        }
        self.block_capacity.swap_remove(&(b.as_ptr() as usize));
        Ok(())
    }

    fn renumber(&self, seq: NonNull<u8>) -> Op<()> {
        let Some(first) = seq_info(seq)?.first else {
            return Ok(());
        };
        let mut current = first;
        let mut start = 0usize;
        loop {
            let r = block(current);
            r.write::<i32>("start_index", start as i32)?;
            start += count_of(&r, "count")?;
            current = next_block(current)?;
            if current == first {
                return Ok(());
            }
        }
    }

    fn set_total(seq: NonNull<u8>, total: usize) -> Op<()> {
        record(seq, catalog::seq()).write::<i32>("total", total as i32)?;
        Ok(())
    }

    /// Block holding element `index`, and the element's offset in it.
    fn locate(seq: NonNull<u8>, index: usize) -> Op<(NonNull<u8>, usize)> {
        let info = seq_info(seq)?;
        if index >= info.total {
            return Err(Fault::out_of_range(index as i64, info.total));
        }
        let mut current = info.first.ok_or_else(|| Fault::broken("first block"))?;
        let mut index = index;
        loop {
            let count = count_of(&block(current), "count")?;
            if index < count {
                return Ok((current, index));
            }
            index -= count;
            current = next_block(current)?;
        }
    }

    fn element(seq: NonNull<u8>, index: usize) -> Op<NonNull<u8>> {
        let (b, at) = Self::locate(seq, index)?;
        Ok(offset(block_data(b)?, at * seq_info(seq)?.elem_size))
    }

    fn push(&mut self, seq: NonNull<u8>, elem: *const c_void) -> Op<NonNull<u8>> {
        let info = seq_info(seq)?;
        let last = match info.first {
            Some(first) => Some(link(&block(first), "prev")?.ok_or_else(|| Fault::broken("block"))?),
            None => None,
        };
        let room = match last {
            Some(last) => count_of(&block(last), "count")? < self.capacity(last)?,
            None => false,
        };
        let target = match last {
            Some(last) if room => last,
            _ => {
                let capacity = match last {
                    Some(last) => (self.capacity(last)? * 2).min(MAX_BLOCK_ELEMS),
                    None => MIN_BLOCK_ELEMS,
                };
                let b = self.new_block(&info, capacity)?;
                self.link_after(seq, last, b)?;
                b
            }
        };
        let r = block(target);
        let count = count_of(&r, "count")?;
        let dst = offset(block_data(target)?, count * info.elem_size);
        fill(dst, elem, info.elem_size);
        r.write::<i32>("count", count as i32 + 1)?;
        Self::set_total(seq, info.total + 1)?;
        self.renumber(seq)?;
        Ok(dst)
    }

    fn insert(&mut self, seq: NonNull<u8>, before: i32, elem: *const c_void) -> Op<NonNull<u8>> {
        let info = seq_info(seq)?;
        let before = usize::try_from(before)
            .ok()
            .filter(|&b| b <= info.total)
            .ok_or_else(|| Fault::out_of_range(before.into(), info.total))?;
        if before == info.total {
            return self.push(seq, elem);
        }
        let (b, at) = Self::locate(seq, before)?;
        let es = info.elem_size;
        let count = count_of(&block(b), "count")?;
        let capacity = self.capacity(b)?;
        let data = block_data(b)?;
        if count == capacity {
            // Split: the tail moves to a new block linked after this one.
            let tail = self.new_block(&info, capacity)?;
            let moved = count - at;
            // SAFETY: both ranges lie inside their blocks and are distinct
            // allocations.
            unsafe {
                ptr::copy_nonoverlapping(
                    offset(data, at * es).as_ptr(),
                    block_data(tail)?.as_ptr(),
                    moved * es,
                )
            };
            block(tail).write::<i32>("count", moved as i32)?;
            self.link_after(seq, Some(b), tail)?;
            block(b).write::<i32>("count", at as i32)?;
            log::trace!("split block {b:p} at {at}, {moved} element(s) moved");
        } else {
            // SAFETY: `count < capacity`, so the shifted range fits.
            unsafe {
                ptr::copy(
                    offset(data, at * es).as_ptr(),
                    offset(data, (at + 1) * es).as_ptr(),
                    (count - at) * es,
                )
            };
        }
        let dst = offset(data, at * es);
        fill(dst, elem, es);
        let r = block(b);
        r.write::<i32>("count", r.read::<i32>("count")? + 1)?;
        Self::set_total(seq, info.total + 1)?;
        self.renumber(seq)?;
        Ok(dst)
    }

    fn remove(&mut self, seq: NonNull<u8>, index: i32) -> Op<()> {
        let info = seq_info(seq)?;
        let index = usize::try_from(index)
            .ok()
            .filter(|&i| i < info.total)
            .ok_or_else(|| Fault::out_of_range(index.into(), info.total))?;
        let (b, at) = Self::locate(seq, index)?;
        let es = info.elem_size;
        let count = count_of(&block(b), "count")?;
        let data = block_data(b)?;
        // SAFETY: the moved range lies inside the block.
        unsafe {
            ptr::copy(
                offset(data, (at + 1) * es).as_ptr(),
                offset(data, at * es).as_ptr(),
                (count - at - 1) * es,
            )
        };
        block(b).write::<i32>("count", count as i32 - 1)?;
        if count == 1 {
            self.unlink_block(seq, b)?;
        }
        Self::set_total(seq, info.total - 1)?;
        self.renumber(seq)
    }

    fn set_add(&mut self, set: NonNull<u8>, elem: *const c_void) -> Op<(i32, NonNull<u8>)> {
        let header = record(set, catalog::set());
        let (node, index) = match link(&header, "free_elems")? {
            Some(node) => {
                let r = record(node, catalog::set_elem());
                let index = r.read::<i32>("flags")? & SET_ELEM_IDX_MASK;
                header.write_ptr("free_elems", r.read_ptr("next_free")?)?;
                (node, index)
            }
            None => {
                let node = self.push(set, ptr::null())?;
                (node, seq_info(set)?.total as i32 - 1)
            }
        };
        fill(node, elem, seq_info(set)?.elem_size);
        record(node, catalog::set_elem()).write::<i32>("flags", index)?;
        header.write::<i32>("active_count", header.read::<i32>("active_count")? + 1)?;
        Ok((index, node))
    }

    fn set_release(&mut self, set: NonNull<u8>, node: NonNull<u8>) -> Op<()> {
        let header = record(set, catalog::set());
        let r = record(node, catalog::set_elem());
        let flags = r.read::<i32>("flags")?;
        if !catalog::is_active(flags) {
            return Err(Fault::new(Status::ObjectNotFound, "element is already free"));
        }
        r.write::<i32>("flags", (flags & SET_ELEM_IDX_MASK) | SET_ELEM_FREE_FLAG)?;
        r.write_ptr("next_free", header.read_ptr("free_elems")?)?;
        header.write_ptr("free_elems", ptr_of(node))?;
        header.write::<i32>("active_count", header.read::<i32>("active_count")? - 1)?;
        Ok(())
    }

    fn set_remove(&mut self, set: NonNull<u8>, index: i32) -> Op<()> {
        let total = seq_info(set)?.total;
        let index = usize::try_from(index)
            .map_err(|_| Fault::out_of_range(index.into(), total))?;
        let node = Self::element(set, index)?;
        self.set_release(set, node)
    }

    fn create_graph(
        &mut self,
        flags: i32,
        header_size: i32,
        vtx_size: i32,
        edge_size: i32,
        storage: NonNull<u8>,
    ) -> Op<NonNull<u8>> {
        if vtx_size < catalog::graph_vtx().header_size() as i32
            || edge_size < catalog::graph_edge().header_size() as i32
        {
            return Err(Fault::new(Status::BadSize, "vertex or edge size is too small"));
        }
        let flags = SET_MAGIC | KIND_GRAPH | (flags as u32 & !MAGIC_MASK);
        let graph = self.init_seq(
            storage,
            flags,
            header_size,
            vtx_size,
            catalog::graph().header_size(),
        )?;
        let set_header = catalog::set().header_size();
        let edges = self.init_seq(storage, SET_MAGIC, set_header as i32, edge_size, set_header)?;
        record(graph, catalog::graph()).write_ptr("edges", ptr_of(edges))?;
        Ok(graph)
    }

    fn vertex(graph: NonNull<u8>, index: i32) -> Op<NonNull<u8>> {
        let total = seq_info(graph)?.total;
        let index = usize::try_from(index)
            .map_err(|_| Fault::out_of_range(index.into(), total))?;
        let v = Self::element(graph, index)?;
        if !catalog::is_active(record(v, catalog::graph_vtx()).read::<i32>("flags")?) {
            return Err(Fault::new(Status::ObjectNotFound, "vertex is free"));
        }
        Ok(v)
    }

    fn edges_of(graph: NonNull<u8>) -> Op<NonNull<u8>> {
        link(&record(graph, catalog::graph()), "edges")?.ok_or_else(|| Fault::broken("edge set"))
    }

    fn side(edge: NonNull<u8>, vertex: NonNull<u8>) -> Op<usize> {
        let r = record(edge, catalog::graph_edge());
        Ok(usize::from(r.read_ptr_at("vtx", 1)? == ptr_of(vertex)))
    }

    fn find_edge(start: NonNull<u8>, end: NonNull<u8>) -> Op<Option<NonNull<u8>>> {
        let mut current = link(&record(start, catalog::graph_vtx()), "first")?;
        while let Some(edge) = current {
            let side = Self::side(edge, start)?;
            let r = record(edge, catalog::graph_edge());
            if r.read_ptr_at("vtx", 1 - side)? == ptr_of(end) {
                return Ok(Some(edge));
            }
            current = NonNull::new(r.read_ptr_at("next", side)?.cast());
        }
        Ok(None)
    }

    fn add_vertex(&mut self, graph: NonNull<u8>, vtx: *const c_void) -> Op<(i32, NonNull<u8>)> {
        let (index, node) = self.set_add(graph, vtx)?;
        record(node, catalog::graph_vtx()).write_ptr("first", ptr::null_mut())?;
        Ok((index, node))
    }

    fn add_edge(
        &mut self,
        graph: NonNull<u8>,
        start: i32,
        end: i32,
        edge: *const c_void,
    ) -> Op<(i32, NonNull<u8>)> {
        if start == end {
            return Err(Fault::new(Status::BadArg, "vertex pointers coincide"));
        }
        let s = Self::vertex(graph, start)?;
        let e = Self::vertex(graph, end)?;
        if let Some(existing) = Self::find_edge(s, e)? {
            return Ok((0, existing));
        }
        let edges = Self::edges_of(graph)?;
        let elem_size = seq_info(edges)?.elem_size;
        let (_, node) = self.set_add(edges, ptr::null())?;
        let layout = catalog::graph_edge();
        let r = record(node, layout);
        match NonNull::new(edge.cast_mut().cast::<u8>()) {
            Some(src) => {
                let prefix = layout.header_size();
                fill(
                    offset(node, prefix),
                    offset(src, prefix).as_ptr().cast::<c_void>(),
                    elem_size - prefix,
                );
                r.write::<f32>("weight", record(src, layout).read::<f32>("weight")?)?;
            }
            None => r.write::<f32>("weight", 1.0)?,
        }
        let (sr, er) = (record(s, catalog::graph_vtx()), record(e, catalog::graph_vtx()));
        r.write_ptr_at("vtx", 0, ptr_of(s))?;
        r.write_ptr_at("vtx", 1, ptr_of(e))?;
        r.write_ptr_at("next", 0, sr.read_ptr("first")?)?;
        r.write_ptr_at("next", 1, er.read_ptr("first")?)?;
        sr.write_ptr("first", ptr_of(node))?;
        er.write_ptr("first", ptr_of(node))?;
        Ok((1, node))
    }

    fn unlink_edge(&mut self, graph: NonNull<u8>, edge: NonNull<u8>) -> Op<()> {
        let r = record(edge, catalog::graph_edge());
        for side in 0..2 {
            let v = non_null(r.read_ptr_at("vtx", side)?, "edge endpoint")?;
            let vr = record(v, catalog::graph_vtx());
            let successor = r.read_ptr_at("next", side)?;
            let mut prev = None;
            let mut current = non_null(vr.read_ptr("first")?, "edge ring")?;
            while current != edge {
                prev = Some(current);
                let s = Self::side(current, v)?;
                let next = record(current, catalog::graph_edge()).read_ptr_at("next", s)?;
                current = non_null(next, "edge ring")?;
            }
            match prev {
                None => vr.write_ptr("first", successor)?,
                Some(p) => {
                    let s = Self::side(p, v)?;
                    record(p, catalog::graph_edge()).write_ptr_at("next", s, successor)?;
                }
            }
        }
        self.set_release(Self::edges_of(graph)?, edge)
    }

    fn remove_edge(&mut self, graph: NonNull<u8>, start: i32, end: i32) -> Op<()> {
        let s = Self::vertex(graph, start)?;
        let e = Self::vertex(graph, end)?;
        match Self::find_edge(s, e)? {
            Some(edge) => self.unlink_edge(graph, edge),
            None => Ok(()),
        }
    }

    fn remove_vertex(&mut self, graph: NonNull<u8>, index: i32) -> Op<i32> {
        let v = Self::vertex(graph, index)?;
        let r = record(v, catalog::graph_vtx());
        let mut removed = 0;
        while let Some(edge) = link(&r, "first")? {
            self.unlink_edge(graph, edge)?;
            removed += 1;
        }
        self.set_release(graph, v)?;
        Ok(removed)
    }

    fn create_sparse(&mut self, dims: i32, sizes: *const i32, value_size: i32) -> Op<NonNull<u8>> {
        let dims = usize::try_from(dims)
            .ok()
            .filter(|d| (1..=catalog::MAX_DIM).contains(d))
            .ok_or_else(|| Fault::new(Status::BadSize, "dimension count out of range"))?;
        if sizes.is_null() {
            return Err(Fault::new(Status::NullPtr, "size array is null"));
        }
        // SAFETY: callers pass `dims` ints.
        let sizes = unsafe { std::slice::from_raw_parts(sizes, dims) }.to_vec();
        if sizes.iter().any(|&s| s <= 0) {
            return Err(Fault::new(Status::BadSize, "dimension sizes must be positive"));
        }
        let value_size = usize::try_from(value_size)
            .ok()
            .filter(|&v| v > 0)
            .ok_or_else(|| Fault::new(Status::BadSize, "value size must be positive"))?;

        let storage = self.new_storage(DEFAULT_STORAGE_BLOCK, true)?;
        let layout = catalog::sparse();
        let hashsize = self.sparse_hash_size;
        let header = self.alloc_in(storage, layout.size_for_count(hashsize))?;
        let valoffset = catalog::sparse_node().header_size();
        let idxoffset = (valoffset + value_size).next_multiple_of(4);
        let node_size = (idxoffset + dims * 4).next_multiple_of(8);
        let set_header = catalog::set().header_size();
        let heap = self.init_seq(
            storage,
            SET_MAGIC,
            set_header as i32,
            node_size as i32,
            set_header,
        )?;

        let r = record(header, layout);
        r.write::<i32>("type", SPARSE_MAGIC as i32)?;
        r.write::<i32>("dims", dims as i32)?;
        r.write::<i32>("hdr_refcount", 1)?;
        r.write_ptr("heap", ptr_of(heap))?;
        let recorded = if std::mem::take(&mut self.corrupt_next_sparse) {
            -1
        } else {
            hashsize as i32
        };
        r.write::<i32>("hashsize", recorded)?;
        r.write::<i32>("valoffset", valoffset as i32)?;
        r.write::<i32>("idxoffset", idxoffset as i32)?;
        for (d, &size) in sizes.iter().enumerate() {
            r.write_at::<i32>("size", d, size)?;
        }
        let table_at = layout
            .trailing_offset()
            .ok_or_else(|| Fault::new(Status::Internal, "sparse layout has no table"))?;
        r.write_ptr("hashtable", ptr_of(offset(header, table_at)))?;
        self.matrices.insert(header.as_ptr() as usize, storage);
        log::trace!("mock sparse matrix {header:p}: {dims} dims, {hashsize} buckets");
        Ok(header)
    }

    fn release_sparse(&mut self, pp: *mut *mut c_void) -> Op<()> {
        if pp.is_null() {
            return Err(Fault::new(Status::NullPtr, "matrix pointer is null"));
        }
        // SAFETY: `pp` is a caller-owned slot.
        let mat = unsafe { *pp };
        if mat.is_null() {
            self.double_releases += 1;
            return Ok(());
        }
        let Some(storage) = self.matrices.swap_remove(&(mat as usize)) else {
            self.double_releases += 1;
            return Err(Fault::new(Status::BadArg, "unknown or released sparse matrix"));
        };
        self.free_storage(storage)?;
        // SAFETY: as above.
        unsafe { *pp = ptr::null_mut() };
        self.sparse_releases += 1;
        Ok(())
    }

    fn sparse_ptr(&mut self, mat: NonNull<u8>, idx: *const i32, create: bool) -> Op<*mut c_void> {
        let info = sparse_info(mat)?;
        let idx = info.index(idx)?;
        let hash = catalog::sparse_hash(&idx);
        if let (_, Some(node)) = info.find(&idx, hash)? {
            return Ok(ptr_of(offset(node, info.valoffset)));
        }
        if !create {
            return Ok(ptr::null_mut());
        }
        let (_, node) = self.set_add(info.heap, ptr::null())?;
        let r = record(node, catalog::sparse_node());
        r.write::<u32>("hashval", hash)?;
        for (d, &i) in idx.iter().enumerate() {
            // SAFETY: the node holds `dims` indices at `idxoffset`.
            unsafe { raw::store(node, info.idxoffset + d * 4, i) };
        }
        let bucket = info.bucket(hash);
        r.write_ptr("next", info.head(bucket).map_or(ptr::null_mut(), ptr_of))?;
        info.set_head(bucket, ptr_of(node));
        Ok(ptr_of(offset(node, info.valoffset)))
    }

    fn sparse_clear(&mut self, mat: NonNull<u8>, idx: *const i32) -> Op<()> {
        let info = sparse_info(mat)?;
        let idx = info.index(idx)?;
        let hash = catalog::sparse_hash(&idx);
        let (prev, Some(node)) = info.find(&idx, hash)? else {
            return Ok(());
        };
        let next = record(node, catalog::sparse_node()).read_ptr("next")?;
        match prev {
            Some(p) => record(p, catalog::sparse_node()).write_ptr("next", next)?,
            None => info.set_head(info.bucket(hash), next),
        }
        self.set_release(info.heap, node)
    }
}

impl Drop for State {
    fn drop(&mut self) {
        let headers: Vec<NonNull<u8>> = self.storages.values().map(|s| s.header).collect();
        for header in headers {
            if let Err(fault) = self.free_storage(header) {
                log::warn!("mock teardown: {}", fault.message);
            }
        }
    }
}

/// In-process stand-in for the native library.
///
/// Single-threaded, like the handles that call into it.
pub struct MockNative {
    state: RefCell<State>,
}

impl MockNative {
    pub fn new() -> Self {
        Self {
            state: RefCell::new(State {
                storages: IndexMap::new(),
                block_capacity: IndexMap::new(),
                matrices: IndexMap::new(),
                sparse_hash_size: DEFAULT_SPARSE_HASH_SIZE,
                corrupt_next_sparse: false,
                pending: None,
                injected: IndexMap::new(),
                storage_releases: 0,
                sparse_releases: 0,
                double_releases: 0,
            }),
        }
    }

    /// Use `buckets` hash buckets for matrices created from now on.
    ///
    /// # Panics
    ///
    /// If `buckets` is not a power of two.
    pub fn with_sparse_hash_size(self, buckets: usize) -> Self {
        assert!(buckets.is_power_of_two(), "bucket count must be a power of two");
        self.state.borrow_mut().sparse_hash_size = buckets;
        self
    }

    /// Make the next `create_sparse` succeed with a header whose bucket
    /// count is negative.
    pub fn corrupt_next_sparse_header(&self) {
        self.state.borrow_mut().corrupt_next_sparse = true;
    }

    /// Make the next call to `function` fail with `status`.
    pub fn fail_next(&self, function: &'static str, status: Status) {
        self.state.borrow_mut().injected.insert(function, status);
    }

    /// Caller-visible storages not yet released.
    pub fn live_storages(&self) -> usize {
        self.state
            .borrow()
            .storages
            .values()
            .filter(|s| !s.internal)
            .count()
    }

    /// Sparse matrices not yet released.
    pub fn live_matrices(&self) -> usize {
        self.state.borrow().matrices.len()
    }

    pub fn storage_releases(&self) -> usize {
        self.state.borrow().storage_releases
    }

    pub fn sparse_releases(&self) -> usize {
        self.state.borrow().sparse_releases
    }

    /// Release calls on an object that was already released or null.
    pub fn double_releases(&self) -> usize {
        self.state.borrow().double_releases
    }

    /// Whether a failure is waiting on the error channel.
    pub fn has_pending_error(&self) -> bool {
        self.state.borrow().pending.is_some()
    }

    /// Run one entry point: clear the channel, honour an injected failure,
    /// and report `op`'s failure through the channel with `sentinel` as
    /// the return value.
    fn call<T>(&self, function: &'static str, sentinel: T, op: impl FnOnce(&mut State) -> Op<T>) -> T {
        let mut state = self.state.borrow_mut();
        state.pending = None;
        if let Some(status) = state.injected.swap_remove(function) {
            log::debug!("{function}: injected {status:?}");
            state.pending = Some(NativeError::new(status.code(), function, "injected failure"));
            return sentinel;
        }
        match op(&mut *state) {
            Ok(value) => value,
            Err(fault) => {
                log::debug!("{function}: {:?}: {}", fault.status, fault.message);
                state.pending = Some(NativeError::new(fault.status.code(), function, fault.message));
                sentinel
            }
        }
    }
}

impl Default for MockNative {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MockNative {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("MockNative")
            .field("storages", &state.storages.len())
            .field("matrices", &state.matrices.len())
            .field("pending", &state.pending)
            .finish_non_exhaustive()
    }
}

impl ErrorChannel for MockNative {
    fn take_error(&self) -> Option<NativeError> {
        self.state.borrow_mut().pending.take()
    }
}

fn write_out(inserted: *mut *mut c_void, node: NonNull<u8>) {
    if !inserted.is_null() {
        // SAFETY: a non-null out-parameter is a caller-owned slot.
        unsafe { *inserted = ptr_of(node) };
    }
}

impl NativeSeqApi for MockNative {
    unsafe fn create_storage(&self, block_size: i32) -> *mut c_void {
        self.call("create_storage", ptr::null_mut(), |st| {
            let size = match usize::try_from(block_size) {
                Ok(0) => DEFAULT_STORAGE_BLOCK,
                Ok(size) => size,
                Err(_) => return Err(Fault::new(Status::BadSize, "negative block size")),
            };
            st.new_storage(size, false).map(ptr_of)
        })
    }

    unsafe fn release_storage(&self, storage: *mut *mut c_void) {
        self.call("release_storage", (), |st| st.release_storage(storage))
    }

    unsafe fn create_seq(
        &self,
        flags: i32,
        header_size: i32,
        elem_size: i32,
        storage: *mut c_void,
    ) -> *mut c_void {
        self.call("create_seq", ptr::null_mut(), |st| {
            let storage = non_null(storage, "storage")?;
            let flags = SEQ_MAGIC | (flags as u32 & !MAGIC_MASK);
            st.init_seq(storage, flags, header_size, elem_size, catalog::seq().header_size())
                .map(ptr_of)
        })
    }

    unsafe fn seq_push(&self, seq: *mut c_void, element: *const c_void) -> *mut c_void {
        self.call("seq_push", ptr::null_mut(), |st| {
            st.push(non_null(seq, "sequence")?, element).map(ptr_of)
        })
    }

    unsafe fn seq_insert(
        &self,
        seq: *mut c_void,
        before_index: i32,
        element: *const c_void,
    ) -> *mut c_void {
        self.call("seq_insert", ptr::null_mut(), |st| {
            st.insert(non_null(seq, "sequence")?, before_index, element)
                .map(ptr_of)
        })
    }

    unsafe fn seq_remove(&self, seq: *mut c_void, index: i32) {
        self.call("seq_remove", (), |st| st.remove(non_null(seq, "sequence")?, index))
    }

    unsafe fn create_set(
        &self,
        flags: i32,
        header_size: i32,
        elem_size: i32,
        storage: *mut c_void,
    ) -> *mut c_void {
        self.call("create_set", ptr::null_mut(), |st| {
            let storage = non_null(storage, "storage")?;
            let prefix = catalog::set_elem().header_size() as i32;
            if elem_size < prefix || elem_size % PTR as i32 != 0 {
                return Err(Fault::new(Status::BadSize, "set element size is too small or unaligned"));
            }
            let flags = SET_MAGIC | (flags as u32 & !MAGIC_MASK);
            st.init_seq(storage, flags, header_size, elem_size, catalog::set().header_size())
                .map(ptr_of)
        })
    }

    unsafe fn set_add(
        &self,
        set: *mut c_void,
        element: *const c_void,
        inserted: *mut *mut c_void,
    ) -> i32 {
        self.call("set_add", -1, |st| {
            let (index, node) = st.set_add(non_null(set, "set")?, element)?;
            write_out(inserted, node);
            Ok(index)
        })
    }

    unsafe fn set_remove(&self, set: *mut c_void, index: i32) {
        self.call("set_remove", (), |st| st.set_remove(non_null(set, "set")?, index))
    }

    unsafe fn create_graph(
        &self,
        flags: i32,
        header_size: i32,
        vtx_size: i32,
        edge_size: i32,
        storage: *mut c_void,
    ) -> *mut c_void {
        self.call("create_graph", ptr::null_mut(), |st| {
            let storage = non_null(storage, "storage")?;
            st.create_graph(flags, header_size, vtx_size, edge_size, storage)
                .map(ptr_of)
        })
    }

    unsafe fn graph_add_vtx(
        &self,
        graph: *mut c_void,
        vtx: *const c_void,
        inserted: *mut *mut c_void,
    ) -> i32 {
        self.call("graph_add_vtx", -1, |st| {
            let (index, node) = st.add_vertex(non_null(graph, "graph")?, vtx)?;
            write_out(inserted, node);
            Ok(index)
        })
    }

    unsafe fn graph_remove_vtx(&self, graph: *mut c_void, index: i32) -> i32 {
        self.call("graph_remove_vtx", -1, |st| {
            st.remove_vertex(non_null(graph, "graph")?, index)
        })
    }

    unsafe fn graph_add_edge(
        &self,
        graph: *mut c_void,
        start: i32,
        end: i32,
        edge: *const c_void,
        inserted: *mut *mut c_void,
    ) -> i32 {
        self.call("graph_add_edge", -1, |st| {
            let (created, node) = st.add_edge(non_null(graph, "graph")?, start, end, edge)?;
            write_out(inserted, node);
            Ok(created)
        })
    }

    unsafe fn graph_remove_edge(&self, graph: *mut c_void, start: i32, end: i32) {
        self.call("graph_remove_edge", (), |st| {
            st.remove_edge(non_null(graph, "graph")?, start, end)
        })
    }

    unsafe fn create_sparse(&self, dims: i32, sizes: *const i32, value_size: i32) -> *mut c_void {
        self.call("create_sparse", ptr::null_mut(), |st| {
            st.create_sparse(dims, sizes, value_size).map(ptr_of)
        })
    }

    unsafe fn release_sparse(&self, mat: *mut *mut c_void) {
        self.call("release_sparse", (), |st| st.release_sparse(mat))
    }

    unsafe fn sparse_ptr(&self, mat: *mut c_void, idx: *const i32, create: i32) -> *mut c_void {
        self.call("sparse_ptr", ptr::null_mut(), |st| {
            st.sparse_ptr(non_null(mat, "sparse matrix")?, idx, create != 0)
        })
    }

    unsafe fn sparse_clear(&self, mat: *mut c_void, idx: *const i32) {
        self.call("sparse_clear", (), |st| {
            st.sparse_clear(non_null(mat, "sparse matrix")?, idx)
        })
    }
}
