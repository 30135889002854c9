//! Views over native linked containers.
//!
//! The native library stores sequences, sets, graphs and sparse matrices
//! in its own block allocator. This crate never writes a link pointer:
//! it reads the block directory to resolve indices and enumerate, and it
//! delegates every insertion and removal to the native entry points
//! behind [`NativeSeqApi`].
//!
//! ```text
//!            NativeSeqApi (native allocator, error channel)
//!                 ▲              ▲
//!   push/insert/remove     create/release
//!                 │              │
//! SeqView ─┬─ Binding ── ForeignHandle<R> ── header address
//! SetView ─┤     │
//! GraphView┤     ├── ViewState: Uninitialized → Bound ⇄ Enumerating → Released
//! SparseView     │
//!                └── blocks::resolve / BlockWalk ──► NodeRef
//! ```
//!
//! # Index stability
//!
//! An index (and any [`NodeRef`]) is only meaningful while the container
//! is not mutated. Mutating methods take `&mut self`, so the borrow
//! checker retires outstanding node references before a mutation.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(unsafe_code)]

pub mod acquire;
pub mod api;
pub mod blocks;
pub mod graph;
pub mod node;
pub mod seq;
pub mod set;
pub mod sparse;
pub mod view;

pub use acquire::{open_storage, SparseRelease, StorageRelease};
pub use api::NativeSeqApi;
pub use blocks::BlockInfo;
pub use graph::GraphView;
pub use node::NodeRef;
pub use seq::{SeqIter, SeqView};
pub use set::{SetIter, SetView};
pub use sparse::{SparseEntry, SparseIter, SparseView};
pub use view::ViewState;
