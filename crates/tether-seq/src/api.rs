//! The native entry points container views delegate to.
//!
//! Every method mirrors one C entry point: same parameter order, same
//! primitive widths, same failure convention. Address-returning calls
//! signal failure with null, integer-returning calls with a negative
//! value, and `void` calls only through the [`ErrorChannel`]. Callers
//! translate results with [`check_address`](tether_core::check_address)
//! and [`check_status`](tether_core::check_status) immediately after each
//! call.

#![allow(unsafe_code)]

use std::ffi::c_void;

use tether_core::ErrorChannel;

/// The native dynamic-structure API.
///
/// # Safety
///
/// Every pointer argument must be either null where the entry point
/// accepts null, or an address obtained from the same implementation and
/// not yet released. Element buffers must be at least the container's
/// element size.
pub trait NativeSeqApi: ErrorChannel {
    /// `create_storage(block_size)`: a new memory storage. `block_size`
    /// of 0 selects the native default.
    unsafe fn create_storage(&self, block_size: i32) -> *mut c_void;

    /// `release_storage(&storage)`: free a storage and every container in
    /// it, then null `*storage`.
    unsafe fn release_storage(&self, storage: *mut *mut c_void);

    /// `create_seq(flags, header_size, elem_size, storage)`.
    unsafe fn create_seq(
        &self,
        flags: i32,
        header_size: i32,
        elem_size: i32,
        storage: *mut c_void,
    ) -> *mut c_void;

    /// `seq_push(seq, element)`: append, returning the new element's
    /// address. A null `element` appends zeroed bytes.
    unsafe fn seq_push(&self, seq: *mut c_void, element: *const c_void) -> *mut c_void;

    /// `seq_insert(seq, before_index, element)`: insert before
    /// `before_index`, returning the new element's address.
    unsafe fn seq_insert(
        &self,
        seq: *mut c_void,
        before_index: i32,
        element: *const c_void,
    ) -> *mut c_void;

    /// `seq_remove(seq, index)`.
    unsafe fn seq_remove(&self, seq: *mut c_void, index: i32);

    /// `create_set(flags, header_size, elem_size, storage)`.
    unsafe fn create_set(
        &self,
        flags: i32,
        header_size: i32,
        elem_size: i32,
        storage: *mut c_void,
    ) -> *mut c_void;

    /// `set_add(set, element, &inserted)`: occupy a free slot (or append),
    /// returning its index. `inserted` may be null.
    unsafe fn set_add(
        &self,
        set: *mut c_void,
        element: *const c_void,
        inserted: *mut *mut c_void,
    ) -> i32;

    /// `set_remove(set, index)`: put an active slot on the free list.
    unsafe fn set_remove(&self, set: *mut c_void, index: i32);

    /// `create_graph(flags, header_size, vtx_size, edge_size, storage)`.
    unsafe fn create_graph(
        &self,
        flags: i32,
        header_size: i32,
        vtx_size: i32,
        edge_size: i32,
        storage: *mut c_void,
    ) -> *mut c_void;

    /// `graph_add_vtx(graph, vtx, &inserted)`: returns the vertex index.
    unsafe fn graph_add_vtx(
        &self,
        graph: *mut c_void,
        vtx: *const c_void,
        inserted: *mut *mut c_void,
    ) -> i32;

    /// `graph_remove_vtx(graph, index)`: returns the number of incident
    /// edges removed with the vertex.
    unsafe fn graph_remove_vtx(&self, graph: *mut c_void, index: i32) -> i32;

    /// `graph_add_edge(graph, start, end, edge, &inserted)`: 1 if a new
    /// edge was added, 0 if the vertices were already connected.
    unsafe fn graph_add_edge(
        &self,
        graph: *mut c_void,
        start: i32,
        end: i32,
        edge: *const c_void,
        inserted: *mut *mut c_void,
    ) -> i32;

    /// `graph_remove_edge(graph, start, end)`.
    unsafe fn graph_remove_edge(&self, graph: *mut c_void, start: i32, end: i32);

    /// `create_sparse(dims, sizes, value_size)`.
    unsafe fn create_sparse(&self, dims: i32, sizes: *const i32, value_size: i32) -> *mut c_void;

    /// `release_sparse(&mat)`: free a sparse matrix and its node heap, then
    /// null `*mat`.
    unsafe fn release_sparse(&self, mat: *mut *mut c_void);

    /// `sparse_ptr(mat, idx, create)`: the value address of the node at
    /// `idx`, creating a zeroed node when `create` is non-zero. Null when
    /// absent and not created.
    unsafe fn sparse_ptr(&self, mat: *mut c_void, idx: *const i32, create: i32) -> *mut c_void;

    /// `sparse_clear(mat, idx)`: remove the node at `idx`, if present.
    unsafe fn sparse_clear(&self, mat: *mut c_void, idx: *const i32);
}
