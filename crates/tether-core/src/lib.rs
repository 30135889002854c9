//! Core handle and error types for the Tether interop layer.
//!
//! This is the leaf crate of the workspace. It owns the lifecycle of a
//! single foreign address and everything that has to agree on it:
//!
//! ```text
//! native acquisition ──► HandleBuilder ──► ForeignHandle<R: Release>
//!                            │                   │
//!                            ▼                   ▼
//!                      PressureSink::add   dispose() / Drop
//!                                                │ (at most once)
//!                                                ▼
//!                                     R::release + PressureSink::remove
//! ```
//!
//! # Threading
//!
//! Nothing in this crate spawns threads or takes locks. [`ForeignHandle`]
//! holds a raw pointer and is therefore neither `Send` nor `Sync`; sharing
//! one across threads requires external synchronisation.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod handle;
pub mod pin;
pub mod pressure;
pub mod release;
pub mod status;
pub mod traits;

pub use config::{ConfigError, InteropConfig};
pub use error::{check_address, check_status, ErrorChannel, InteropError, NativeError, Result};
pub use handle::{ForeignHandle, HandleBuilder};
pub use pin::{pin, pin_value, PinGuard};
pub use pressure::{MemoryPressure, PressureSink};
pub use release::{FnFree, FnRelease, NoRelease, Release};
pub use status::Status;
pub use traits::{Disposable, Enumerable, HasHandle, TypedView};
