//! Tether: safe handles, typed views and container walkers over memory
//! owned by a native library.
//!
//! This is the top-level facade crate that re-exports the public API from
//! all Tether sub-crates. For most users, adding `tether` as a single
//! dependency is sufficient.
//!
//! # Quick start
//!
//! ```rust
//! use tether::prelude::*;
//!
//! // Any foreign buffer works; a Rust one stands in for native memory here.
//! let mut samples = vec![0.0f32; 8];
//! let mut view: ArrayPtr<'_, f32> =
//!     unsafe { ArrayPtr::from_raw(samples.as_mut_ptr().cast(), Some(samples.len())) }.unwrap();
//!
//! view.set_checked(3, 1.5).unwrap();
//! assert_eq!(view.get_checked(3).unwrap(), 1.5);
//! assert!(matches!(
//!     view.get_checked(8),
//!     Err(InteropError::OutOfRange { index: 8, len: 8 })
//! ));
//! ```
//!
//! # Modules
//!
//! Each module corresponds to a sub-crate. Use them for types not in the prelude:
//!
//! | Module | Sub-crate | Contents |
//! |--------|-----------|----------|
//! | [`handles`] | `tether-core` | Handles, disposal, pressure hints, pinning, errors, config |
//! | [`layout`] | `tether-layout` | Record layouts, field access, the native record catalogue |
//! | [`view`] | `tether-view` | Typed 1D and 2D pointer views |
//! | [`seq`] | `tether-seq` | Sequence, set, graph and sparse matrix views |

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

/// Handles, disposal and the error channel (`tether-core`).
///
/// [`handles::ForeignHandle`] owns one native address and runs its paired
/// release exactly once. [`handles::InteropConfig`] carries the knobs shared
/// by every view.
pub use tether_core as handles;

/// Record layouts and raw field access (`tether-layout`).
///
/// [`layout::RecordLayout`] describes a native struct; [`layout::RawRecord`]
/// reads and writes its fields by name. The [`layout::catalog`] module
/// describes the container records of the native library.
pub use tether_layout as layout;

/// Typed pointer views (`tether-view`).
pub use tether_view as view;

/// Native linked containers (`tether-seq`).
///
/// [`seq::SeqView`], [`seq::SetView`], [`seq::GraphView`] and
/// [`seq::SparseView`] all sit on the [`seq::NativeSeqApi`] seam.
pub use tether_seq as seq;

/// Common imports for typical Tether usage.
///
/// ```rust
/// use tether::prelude::*;
/// ```
pub mod prelude {
    // Handles and configuration
    pub use tether_core::{
        ForeignHandle, HandleBuilder, InteropConfig, MemoryPressure, NoRelease, Release,
    };

    // Errors
    pub use tether_core::{InteropError, NativeError, Result, Status};

    // Capability traits
    pub use tether_core::{Disposable, Enumerable, HasHandle, TypedView};

    // Pinning
    pub use tether_core::{pin, pin_value};

    // Layout
    pub use tether_layout::{RawRecord, RecordLayout};

    // Views
    pub use tether_view::{ArrayPtr, ArrayPtr2D, RowTable};

    // Containers
    pub use tether_seq::{
        open_storage, GraphView, NativeSeqApi, NodeRef, SeqView, SetView, SparseView, ViewState,
    };
}
