//! Native record layouts for the Tether interop layer.
//!
//! Instead of overlaying Rust structs on foreign memory, every native
//! record type is described once by a [`RecordLayout`]: ordered fields with
//! their primitive types and byte offsets, laid out with natural C
//! alignment for the host pointer width. A [`RawRecord`] pairs a layout
//! with a live address and reads or writes fields by name.
//!
//! ```text
//! LayoutBuilder ──build──► RecordLayout ──┐
//!                              │          ├──► RawRecord::read / write
//!                   record_size(live)     │         │
//!                  (one size contract)    │         ▼
//!                                 address ┘    raw::load / raw::store
//! ```
//!
//! The [`raw`] module is the only place in the crate, and the only place
//! the view crates reach into, where foreign memory is dereferenced.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(unsafe_code)]

pub mod catalog;
pub mod layout;
pub mod prim;
pub mod raw;
pub mod record;

pub use layout::{Field, LayoutBuilder, RecordLayout, SizeRule};
pub use prim::{Prim, Scalar};
pub use record::RawRecord;
