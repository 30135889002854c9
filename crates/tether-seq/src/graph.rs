//! Views over native graphs.
//!
//! A graph is a set of vertices whose header also points at a set of
//! edges. Each vertex heads a ring of incident edges: an edge stores both
//! endpoints in `vtx[0..2]` and the next edge around each endpoint in the
//! matching `next[0..2]` slot. Walking the ring of vertex `v` therefore
//! follows `next[1]` when `vtx[1] == v` and `next[0]` otherwise.

#![allow(unsafe_code)]

use std::ffi::c_void;
use std::fmt;
use std::ptr::{self, NonNull};

use smallvec::SmallVec;
use tether_core::{
    check_address, check_status, pin, pin_value, Disposable, Enumerable, ForeignHandle,
    HandleBuilder, HasHandle, InteropConfig, InteropError, NoRelease, Release, Result,
};
use tether_layout::{catalog, RawRecord};

use crate::api::NativeSeqApi;
use crate::blocks::SeqHeader;
use crate::node::NodeRef;
use crate::set::{self, SetIter};
use crate::view::{self, Binding, ViewState};

/// One step of an edge ring: the edge and which endpoint slot the walk
/// entered it through.
#[derive(Clone, Copy, Debug)]
struct Incident {
    edge: NonNull<c_void>,
    side: usize,
}

fn edge_record(edge: NonNull<c_void>) -> RawRecord<'static> {
    // SAFETY: edge addresses come from a live vertex ring, and the graph
    // outlives every walk over it (view borrow).
    unsafe { RawRecord::new(edge, catalog::graph_edge()) }
}

fn vertex_index(vertex: *mut c_void) -> Result<usize> {
    let vertex = NonNull::new(vertex).ok_or(InteropError::BrokenLink { record: "GraphEdge" })?;
    // SAFETY: endpoints of a live edge are live vertices.
    let record = unsafe { RawRecord::new(vertex, catalog::graph_vtx()) };
    let flags = record.read::<i32>("flags")?;
    if !catalog::is_active(flags) {
        return Err(InteropError::BrokenLink { record: "GraphVtx" });
    }
    Ok((flags & catalog::SET_ELEM_IDX_MASK) as usize)
}

/// A graph in native block storage.
pub struct GraphView<'n, N: NativeSeqApi + ?Sized, R: Release = NoRelease> {
    native: &'n N,
    binding: Binding<R>,
}

impl<'n, N: NativeSeqApi + ?Sized> GraphView<'n, N> {
    /// Create an empty graph. Vertices carry `vtx_payload` bytes and edges
    /// `edge_payload` bytes after their link prefixes.
    pub fn create<S: Release>(
        native: &'n N,
        storage: &'n ForeignHandle<S>,
        vtx_payload: usize,
        edge_payload: usize,
        config: InteropConfig,
    ) -> Result<Self> {
        config.validate()?;
        let size_of = |prefix: &tether_layout::RecordLayout, payload: usize| {
            i32::try_from((prefix.header_size() + payload).next_multiple_of(prefix.align())).map_err(
                |_| InteropError::InvalidArgument {
                    what: "element size exceeds the native int range",
                },
            )
        };
        let vtx_size = size_of(catalog::graph_vtx(), vtx_payload)?;
        let edge_size = size_of(catalog::graph_edge(), edge_payload)?;
        let storage = storage.address()?;
        let header_size = catalog::graph().header_size() as i32;
        // SAFETY: `storage` is a live storage from the same implementation.
        let raw = unsafe {
            native.create_graph(0, header_size, vtx_size, edge_size, storage.as_ptr())
        };
        let address = check_address(native, "create_graph", raw)?;
        log::debug!("created graph at {address:p} (vertex {vtx_size} B, edge {edge_size} B)");
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

    /// Wrap an existing native graph header without owning it.
    ///
    /// # Safety
    ///
    /// `header` must be a live graph header that outlives the view.
    pub unsafe fn from_header(native: &'n N, header: *mut c_void) -> Result<Self> {
        let mut view = Self::unbound(native, InteropConfig::new());
        // SAFETY: forwarded caller contract.
        unsafe { view.bind(ForeignHandle::wrap(header)?)? };
        Ok(view)
    }
}

impl<'n, N: NativeSeqApi + ?Sized, R: Release> GraphView<'n, N, R> {
    /// A view in the `Uninitialized` state.
    pub fn unbound(native: &'n N, config: InteropConfig) -> Self {
        Self {
            native,
            binding: Binding::unbound("graph", view::graph_check(), config),
        }
    }

    /// Bind to the graph header `handle` points at.
    ///
    /// # Safety
    ///
    /// `handle` must address a live graph header created by `native` that
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

    fn edge_set(&self) -> Result<RawRecord<'_>> {
        let header = self.binding.header()?;
        // SAFETY: a graph's `edges` field points at its live edge set.
        unsafe { header.follow("edges", catalog::set()) }?
            .ok_or(InteropError::BrokenLink { record: "Graph" })
    }

    /// Number of vertices.
    pub fn vertex_count(&self) -> Result<usize> {
        set::active_count(&self.binding.header()?)
    }

    /// Number of edges.
    pub fn edge_count(&self) -> Result<usize> {
        set::active_count(&self.edge_set()?)
    }

    /// Vertex at physical `index`.
    pub fn vertex(&self, index: isize) -> Result<NodeRef<'_>> {
        set::lookup(&self.binding.header()?, index, self.max_walk())
    }

    /// Read the payload of vertex `index` as `T`.
    pub fn vertex_payload<T: bytemuck::Pod>(&self, index: isize) -> Result<T> {
        self.vertex(index)?
            .read_at(catalog::graph_vtx().header_size())
    }

    /// Walk the active vertices.
    pub fn vertices(&self) -> Result<SetIter<'_>> {
        let seq = SeqHeader::read(&self.binding.header()?)?;
        let token = self.binding.enter_enumeration()?;
        Ok(SetIter::new(&seq, self.max_walk(), token))
    }

    /// Walk the active edges.
    pub fn edges(&self) -> Result<SetIter<'_>> {
        let seq = SeqHeader::read(&self.edge_set()?)?;
        let token = self.binding.enter_enumeration()?;
        Ok(SetIter::new(&seq, self.max_walk(), token))
    }

    /// Every edge around `vertex`, in ring order.
    fn ring(&self, vertex: NodeRef<'_>) -> Result<SmallVec<[Incident; 8]>> {
        let bound = self.edge_count()?;
        let start = vertex.address();
        // SAFETY: `vertex` is a live vertex of this graph.
        let record = unsafe { RawRecord::new(start, catalog::graph_vtx()) };
        let mut current = record.read_ptr("first")?;
        let mut ring = SmallVec::new();
        while let Some(edge) = NonNull::new(current) {
            if ring.len() >= bound {
                log::warn!("edge ring of vertex {} exceeds {bound} edges", vertex.index());
                return Err(InteropError::BrokenLink { record: "GraphEdge" });
            }
            let record = edge_record(edge);
            let side = usize::from(record.read_ptr_at("vtx", 1)? == start.as_ptr());
            ring.push(Incident { edge, side });
            current = record.read_ptr_at("next", side)?;
        }
        Ok(ring)
    }

    /// Number of edges incident to vertex `index`.
    pub fn degree(&self, index: isize) -> Result<usize> {
        Ok(self.ring(self.vertex(index)?)?.len())
    }

    /// Physical indices of the vertices adjacent to vertex `index`, in
    /// ring order.
    pub fn neighbors(&self, index: isize) -> Result<Vec<usize>> {
        self.ring(self.vertex(index)?)?
            .into_iter()
            .map(|step| vertex_index(edge_record(step.edge).read_ptr_at("vtx", 1 - step.side)?))
            .collect()
    }

    fn edge_between(&self, start: isize, end: isize) -> Result<Option<NonNull<c_void>>> {
        let target = self.vertex(end)?.address();
        for step in self.ring(self.vertex(start)?)? {
            let other = edge_record(step.edge).read_ptr_at("vtx", 1 - step.side)?;
            if other == target.as_ptr() {
                return Ok(Some(step.edge));
            }
        }
        Ok(None)
    }

    /// The edge connecting `start` and `end`, in either direction.
    pub fn find_edge(&self, start: isize, end: isize) -> Result<Option<NodeRef<'_>>> {
        let Some(edge) = self.edge_between(start, end)? else {
            return Ok(None);
        };
        let elem_size = SeqHeader::read(&self.edge_set()?)?.elem_size;
        let index = edge_record(edge).read::<i32>("flags")? & catalog::SET_ELEM_IDX_MASK;
        // SAFETY: `edge` was found on a live ring.
        Ok(Some(unsafe { NodeRef::new(edge.cast(), index as usize, elem_size) }))
    }

    /// Weight of the edge between `start` and `end`, if connected.
    pub fn edge_weight(&self, start: isize, end: isize) -> Result<Option<f32>> {
        self.edge_between(start, end)?
            .map(|edge| edge_record(edge).read::<f32>("weight"))
            .transpose()
    }

    /// Add a vertex carrying `payload`.
    pub fn add_vertex(&mut self, payload: &[u8]) -> Result<NodeRef<'_>> {
        let elem_size = SeqHeader::read(&self.binding.header()?)?.elem_size;
        let mut element =
            set::staged_element(elem_size, catalog::graph_vtx().header_size(), payload)?;
        let header = self.binding.address()?;
        let mut inserted: *mut c_void = ptr::null_mut();
        let status = {
            let mut elem = pin(&mut element);
            let mut out = pin_value(&mut inserted);
            // SAFETY: live graph header; buffers pinned across the call.
            unsafe { self.native.graph_add_vtx(header.as_ptr(), elem.address(), out.as_mut_ptr()) }
        };
        let index = check_status(self.native, "graph_add_vtx", status)?;
        let address = check_address(self.native, "graph_add_vtx", inserted)?;
        // SAFETY: the native call reported the slot it filled.
        Ok(unsafe { NodeRef::new(address.cast(), index as usize, elem_size) })
    }

    /// Remove vertex `index` and every edge incident to it, returning the
    /// number of edges removed.
    pub fn remove_vertex(&mut self, index: isize) -> Result<usize> {
        let physical = self.vertex(index)?.index() as i32;
        let header = self.binding.address()?;
        // SAFETY: live header, active vertex.
        let removed = unsafe { self.native.graph_remove_vtx(header.as_ptr(), physical) };
        Ok(check_status(self.native, "graph_remove_vtx", removed)? as usize)
    }

    /// Connect `start` and `end` with an edge of `weight` carrying
    /// `payload`. Returns `false` if they were already connected.
    pub fn add_edge(&mut self, start: isize, end: isize, weight: f32, payload: &[u8]) -> Result<bool> {
        let start = self.vertex(start)?.index() as i32;
        let end = self.vertex(end)?.index() as i32;
        let edge_layout = catalog::graph_edge();
        let elem_size = SeqHeader::read(&self.edge_set()?)?.elem_size;
        let mut element = set::staged_element(elem_size, edge_layout.header_size(), payload)?;
        let weight_at = edge_layout.offset_of("weight")?;
        element[weight_at..weight_at + 4].copy_from_slice(&weight.to_ne_bytes());
        let header = self.binding.address()?;
        let mut inserted: *mut c_void = ptr::null_mut();
        let status = {
            let mut elem = pin(&mut element);
            let mut out = pin_value(&mut inserted);
            // SAFETY: live header, active endpoints, pinned buffers.
            unsafe {
                self.native.graph_add_edge(
                    header.as_ptr(),
                    start,
                    end,
                    elem.address(),
                    out.as_mut_ptr(),
                )
            }
        };
        let created = check_status(self.native, "graph_add_edge", status)? == 1;
        log::trace!("edge {start}-{end}: {}", if created { "added" } else { "exists" });
        Ok(created)
    }

    /// Remove the edge between `start` and `end`. Absent edges are ignored.
    pub fn remove_edge(&mut self, start: isize, end: isize) -> Result<()> {
        let start = self.vertex(start)?.index() as i32;
        let end = self.vertex(end)?.index() as i32;
        let header = self.binding.address()?;
        // SAFETY: live header, active endpoints.
        unsafe { self.native.graph_remove_edge(header.as_ptr(), start, end) };
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

impl<N: NativeSeqApi + ?Sized, R: Release> Disposable for GraphView<'_, N, R> {
    fn dispose(&mut self) -> bool {
        self.release()
    }

    fn is_disposed(&self) -> bool {
        self.state() == ViewState::Released
    }
}

impl<N: NativeSeqApi + ?Sized, R: Release> HasHandle for GraphView<'_, N, R> {
    type Release = R;

    fn handle(&self) -> &ForeignHandle<R> {
        self.binding.handle()
    }
}

impl<N: NativeSeqApi + ?Sized, R: Release> Enumerable for GraphView<'_, N, R> {
    type Item<'a>
        = Result<NodeRef<'a>>
    where
        Self: 'a;
    type Iter<'a>
        = SetIter<'a>
    where
        Self: 'a;

    fn elements(&self) -> Result<SetIter<'_>> {
        self.vertices()
    }

    fn active_count(&self) -> Result<usize> {
        self.vertex_count()
    }
}

impl<N: NativeSeqApi + ?Sized, R: Release> fmt::Debug for GraphView<'_, N, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphView")
            .field("binding", &self.binding)
            .finish_non_exhaustive()
    }
}
