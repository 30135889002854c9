//! Typed pointer accessors for the Tether interop layer.
//!
//! [`ArrayPtr`] reinterprets a foreign address as an array of a declared
//! element type; [`ArrayPtr2D`] does the same for two-dimensional data
//! reached through a table of row pointers ([`RowTable`]). Neither copies.
//!
//! Plain `get`/`set` are `unsafe` and unchecked, exactly like indexing
//! the native pointer. When the element count is known the `_checked`
//! variants bounds-check instead and are safe.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(unsafe_code)]

pub mod array;
pub mod array2d;

pub use array::ArrayPtr;
pub use array2d::{ArrayPtr2D, RowTable};
