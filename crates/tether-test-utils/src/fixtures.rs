//! Shared setup for view tests.

use bytemuck::{Pod, Zeroable};
use tether_core::{ForeignHandle, InteropConfig};
use tether_seq::{open_storage, StorageRelease};

use crate::mock::MockNative;

/// Route `log` output through the test harness. Safe to call repeatedly.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// An owning storage handle on `native` with the default block size.
///
/// # Panics
///
/// If the mock refuses to create a storage, which only happens when a
/// failure was injected for `create_storage`.
pub fn storage(native: &MockNative) -> ForeignHandle<StorageRelease<'_, MockNative>> {
    open_storage(native, 0, InteropConfig::new()).expect("mock storage")
}

/// A small plain element used across container tests.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}
