//! The native dynamic-structure records, laid out once per process.
//!
//! Each accessor builds its layout on first use and hands out the same
//! `&'static` descriptor afterwards. Field names follow the native headers.

use std::sync::OnceLock;

use crate::layout::{LayoutBuilder, RecordLayout};
use crate::prim::Prim;

/// High half of a header's `flags` word: the record signature.
pub const MAGIC_MASK: u32 = 0xFFFF_0000;
/// Signature of a sequence header.
pub const SEQ_MAGIC: u32 = 0x4299_0000;
/// Signature of a set header (sets and graphs).
pub const SET_MAGIC: u32 = 0x4298_0000;
/// Signature of a sparse matrix header.
pub const SPARSE_MAGIC: u32 = 0x4244_0000;
/// Signature of a memory storage header.
pub const STORAGE_MAGIC: u32 = 0x4289_0000;
/// Kind bit marking a set as a graph's vertex set.
pub const KIND_GRAPH: u32 = 1 << 12;

/// Set element flag word bit marking a free slot. Free slots have a
/// negative flag word.
pub const SET_ELEM_FREE_FLAG: i32 = i32::MIN;
/// Mask extracting the element index from an active flag word.
pub const SET_ELEM_IDX_MASK: i32 = (1 << 26) - 1;

/// Multiplier of the sparse index hash.
pub const HASHVAL_SCALE: u32 = 33;
/// Maximum number of sparse matrix dimensions.
pub const MAX_DIM: usize = 32;

macro_rules! layout {
    ($(#[$doc:meta])* $fn:ident => $build:expr) => {
        $(#[$doc])*
        pub fn $fn() -> &'static RecordLayout {
            static CELL: OnceLock<RecordLayout> = OnceLock::new();
            CELL.get_or_init(|| $build)
        }
    };
}

layout! {
    /// Memory storage: the block allocator every container lives in.
    mem_storage => LayoutBuilder::new("MemStorage")
        .field("signature", Prim::I32)
        .field("bottom", Prim::Ptr)
        .field("top", Prim::Ptr)
        .field("parent", Prim::Ptr)
        .field("block_size", Prim::I32)
        .field("free_space", Prim::I32)
        .build()
}

layout! {
    /// One block of a sequence's block ring.
    seq_block => LayoutBuilder::new("SeqBlock")
        .field("prev", Prim::Ptr)
        .field("next", Prim::Ptr)
        .field("start_index", Prim::I32)
        .field("count", Prim::I32)
        .field("data", Prim::Ptr)
        .build()
}

layout! {
    /// Sequence header.
    seq => LayoutBuilder::new("Seq")
        .field("flags", Prim::I32)
        .field("header_size", Prim::I32)
        .field("h_prev", Prim::Ptr)
        .field("h_next", Prim::Ptr)
        .field("v_prev", Prim::Ptr)
        .field("v_next", Prim::Ptr)
        .field("total", Prim::I32)
        .field("elem_size", Prim::I32)
        .field("block_max", Prim::Ptr)
        .field("ptr", Prim::Ptr)
        .field("delta_elems", Prim::I32)
        .field("storage", Prim::Ptr)
        .field("free_blocks", Prim::Ptr)
        .field("first", Prim::Ptr)
        .build()
}

layout! {
    /// Prefix shared by every set element.
    set_elem => LayoutBuilder::new("SetElem")
        .field("flags", Prim::I32)
        .field("next_free", Prim::Ptr)
        .build()
}

layout! {
    /// Set header: a sequence plus a free list.
    set => LayoutBuilder::extend("Set", seq())
        .field("free_elems", Prim::Ptr)
        .field("active_count", Prim::I32)
        .build()
}

layout! {
    /// Prefix shared by every graph vertex.
    graph_vtx => LayoutBuilder::new("GraphVtx")
        .field("flags", Prim::I32)
        .field("first", Prim::Ptr)
        .build()
}

layout! {
    /// Prefix shared by every graph edge.
    graph_edge => LayoutBuilder::new("GraphEdge")
        .field("flags", Prim::I32)
        .field("weight", Prim::F32)
        .array("next", Prim::Ptr, 2)
        .array("vtx", Prim::Ptr, 2)
        .build()
}

layout! {
    /// Graph header: the vertex set plus a pointer to the edge set.
    graph => LayoutBuilder::extend("Graph", set())
        .field("edges", Prim::Ptr)
        .build()
}

layout! {
    /// Prefix of every sparse matrix node.
    sparse_node => LayoutBuilder::new("SparseNode")
        .field("hashval", Prim::U32)
        .field("next", Prim::Ptr)
        .build()
}

layout! {
    /// Sparse matrix header, followed by its bucket table of `hashsize`
    /// node pointers.
    sparse => LayoutBuilder::new("SparseMat")
        .field("type", Prim::I32)
        .field("dims", Prim::I32)
        .field("refcount", Prim::Ptr)
        .field("hdr_refcount", Prim::I32)
        .field("heap", Prim::Ptr)
        .field("hashtable", Prim::Ptr)
        .field("hashsize", Prim::I32)
        .field("valoffset", Prim::I32)
        .field("idxoffset", Prim::I32)
        .array("size", Prim::I32, MAX_DIM)
        .trailing("hashsize", Prim::Ptr)
        .build()
}

/// Whether `flags` carries `magic` in its signature half.
pub fn has_magic(flags: i32, magic: u32) -> bool {
    (flags as u32) & MAGIC_MASK == magic
}

/// Whether a set element flag word marks an active element.
pub fn is_active(flags: i32) -> bool {
    flags >= 0
}

/// The sparse index hash: `h = idx[0]; h = h * 33 + idx[i]`, kept
/// non-negative.
pub fn sparse_hash(idx: &[i32]) -> u32 {
    let mut h = idx.first().copied().unwrap_or(0) as u32;
    for &i in idx.iter().skip(1) {
        h = h.wrapping_mul(HASHVAL_SCALE).wrapping_add(i as u32);
    }
    h & i32::MAX as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::SizeRule;

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn sequence_records_match_native_offsets() {
        let b = seq_block();
        assert_eq!(b.offset_of("start_index").unwrap(), 16);
        assert_eq!(b.offset_of("data").unwrap(), 24);
        assert_eq!(b.header_size(), 32);

        let s = seq();
        assert_eq!(s.offset_of("total").unwrap(), 40);
        assert_eq!(s.offset_of("elem_size").unwrap(), 44);
        assert_eq!(s.offset_of("first").unwrap(), 88);
        assert_eq!(s.header_size(), 96);
        assert_eq!(mem_storage().header_size(), 40);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn set_and_graph_extend_the_sequence_header() {
        assert_eq!(set().offset_of("free_elems").unwrap(), 96);
        assert_eq!(set().offset_of("active_count").unwrap(), 104);
        assert_eq!(set().header_size(), 112);
        assert_eq!(graph().offset_of("edges").unwrap(), 112);
        assert_eq!(graph().header_size(), 120);
        assert_eq!(set_elem().header_size(), 16);
        assert_eq!(graph_edge().offset_of("vtx").unwrap(), 24);
        assert_eq!(graph_edge().header_size(), 40);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn sparse_header_has_trailing_buckets() {
        let s = sparse();
        assert_eq!(s.offset_of("hashsize").unwrap(), 40);
        assert_eq!(s.offset_of("size").unwrap(), 52);
        assert_eq!(s.header_size(), 184);
        assert_eq!(
            s.size_rule(),
            SizeRule::Trailing {
                base: 184,
                count_field: "hashsize",
                elem: 8
            }
        );
        assert_eq!(s.size_for_count(16), 184 + 128);
    }

    #[test]
    fn layouts_are_built_once() {
        assert!(std::ptr::eq(seq(), seq()));
    }

    #[test]
    fn signatures() {
        assert!(has_magic(SEQ_MAGIC as i32 | 0x0c, SEQ_MAGIC));
        assert!(!has_magic(SET_MAGIC as i32, SEQ_MAGIC));
        assert!(is_active(5));
        assert!(!is_active(SET_ELEM_FREE_FLAG | 5));
    }

    #[test]
    fn sparse_hash_matches_the_native_recurrence() {
        assert_eq!(sparse_hash(&[3]), 3);
        assert_eq!(sparse_hash(&[1, 2]), 35);
        assert_eq!(sparse_hash(&[1, 2, 3]), 35 * 33 + 3);
        assert!(sparse_hash(&[i32::MAX, i32::MAX, i32::MAX]) <= i32::MAX as u32);
    }
}
