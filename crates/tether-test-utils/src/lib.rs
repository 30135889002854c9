//! In-process native backend and fixtures for Tether tests.
//!
//! [`MockNative`] implements [`NativeSeqApi`](tether_seq::NativeSeqApi)
//! over real heap memory laid out exactly like the native records, so
//! views are exercised against the same bytes they would read in a linked
//! library. Failures can be injected per entry point, and release counters
//! make the disposal protocol observable.

#![allow(unsafe_code)]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod fixtures;
pub mod mock;

pub use fixtures::{init_logging, storage, Point};
pub use mock::{MockNative, DEFAULT_STORAGE_BLOCK};
