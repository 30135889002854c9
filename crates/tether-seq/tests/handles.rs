//! Integration tests: owning handles over native storages.

use std::sync::Arc;

use tether_core::{
    ConfigError, Disposable, HandleBuilder, InteropConfig, InteropError, MemoryPressure, Status,
};
use tether_seq::{
    open_storage, GraphView, NativeSeqApi, SeqView, SetView, SparseView, StorageRelease,
};
use tether_test_utils::{init_logging, MockNative, DEFAULT_STORAGE_BLOCK};

#[test]
fn a_storage_disposed_twice_is_released_once() {
    init_logging();
    let native = MockNative::new();
    let mut handle = open_storage(&native, 0, InteropConfig::new()).unwrap();
    assert_eq!(native.live_storages(), 1);

    assert!(handle.dispose());
    assert!(!handle.dispose());
    assert!(handle.is_disposed());
    assert_eq!(
        handle.address().unwrap_err(),
        InteropError::Disposed { object: "handle" }
    );
    drop(handle);

    assert_eq!(native.storage_releases(), 1);
    assert_eq!(native.double_releases(), 0);
    assert_eq!(native.live_storages(), 0);
}

#[test]
fn dropping_a_storage_releases_it() {
    let native = MockNative::new();
    {
        let _handle = open_storage(&native, 0, InteropConfig::new()).unwrap();
    }
    assert_eq!(native.storage_releases(), 1);
    assert_eq!(native.live_storages(), 0);
}

#[test]
fn pressure_is_attributed_while_the_storage_lives() {
    let native = MockNative::new();
    let sink = Arc::new(MemoryPressure::new(usize::MAX));
    // SAFETY: `create_storage` takes no pointers.
    let raw = unsafe { native.create_storage(1024) };
    assert!(!raw.is_null());

    // SAFETY: a fresh storage paired with `release_storage`.
    let mut handle = unsafe {
        HandleBuilder::new(raw)
            .byte_size(1024)
            .sink(sink.clone())
            .owned(StorageRelease::new(&native))
    }
    .unwrap();
    assert_eq!(sink.outstanding(), 1024);
    assert_eq!(handle.pressure_bytes(), 1024);

    handle.dispose();
    assert_eq!(sink.outstanding(), 0);
    assert_eq!(sink.peak(), 1024);
    assert_eq!(sink.notifications(), 1);
    assert_eq!(handle.pressure_bytes(), 0);
}

#[test]
fn disabled_hints_attribute_nothing() {
    let native = MockNative::new();
    let sink = Arc::new(MemoryPressure::new(usize::MAX));
    let config = InteropConfig {
        pressure_hints: false,
        ..InteropConfig::new()
    };
    // SAFETY: as above.
    let raw = unsafe { native.create_storage(2048) };
    let handle = unsafe {
        HandleBuilder::new(raw)
            .byte_size(2048)
            .sink(sink.clone())
            .config(config)
            .owned(StorageRelease::new(&native))
    }
    .unwrap();

    assert_eq!(handle.byte_size(), Some(2048));
    assert_eq!(sink.outstanding(), 0);
    assert_eq!(sink.notifications(), 0);
}

#[test]
fn failed_acquisition_reports_the_native_status() {
    let native = MockNative::new();
    native.fail_next("create_storage", Status::NoMem);

    match open_storage(&native, 0, InteropConfig::new()) {
        Err(InteropError::Native(e)) => {
            assert_eq!(e.status(), Status::NoMem);
            assert_eq!(e.function, "create_storage");
        }
        other => panic!("expected a native failure, got {other:?}"),
    }
    assert_eq!(native.live_storages(), 0);
    assert!(!native.has_pending_error());

    // The next call succeeds again.
    assert!(open_storage(&native, 0, InteropConfig::new()).is_ok());
}

#[test]
fn oversized_block_requests_never_reach_the_native_side() {
    let native = MockNative::new();
    assert!(matches!(
        open_storage(&native, usize::MAX, InteropConfig::new()),
        Err(InteropError::InvalidArgument { .. })
    ));
    assert_eq!(native.live_storages(), 0);
}

#[test]
fn a_default_block_storage_reports_the_size_the_native_side_chose() {
    let native = MockNative::new();
    let mut handle = open_storage(&native, 0, InteropConfig::new()).unwrap();

    assert_eq!(handle.byte_size(), Some(DEFAULT_STORAGE_BLOCK));
    assert_eq!(handle.pressure_bytes(), DEFAULT_STORAGE_BLOCK);
    assert!(handle.dispose());
    assert_eq!(handle.pressure_bytes(), 0);
}

#[test]
fn an_explicit_block_size_is_read_back_from_the_header() {
    let native = MockNative::new();
    let handle = open_storage(&native, 4096, InteropConfig::new()).unwrap();
    assert_eq!(handle.byte_size(), Some(4096));
}

#[test]
fn an_invalid_config_acquires_nothing() {
    let native = MockNative::new();
    let config = InteropConfig {
        max_block_walk: 0,
        ..InteropConfig::new()
    };
    assert_eq!(
        open_storage(&native, 0, config).unwrap_err(),
        InteropError::Config(ConfigError::ZeroBlockWalk)
    );
    assert_eq!(native.live_storages(), 0);
    assert_eq!(native.storage_releases(), 0);
}

#[test]
fn into_raw_hands_the_release_to_the_caller() {
    let native = MockNative::new();
    let handle = open_storage(&native, 0, InteropConfig::new()).unwrap();

    let mut raw = handle.into_raw();
    assert_eq!(native.storage_releases(), 0);
    assert_eq!(native.live_storages(), 1);

    // SAFETY: `raw` came from `create_storage` and is released once here.
    unsafe { native.release_storage(&mut raw) };
    assert!(raw.is_null());
    assert_eq!(native.storage_releases(), 1);
    assert_eq!(native.double_releases(), 0);
}

fn dispose_all(objects: &mut [&mut dyn Disposable]) -> usize {
    objects.iter_mut().map(|o| o.dispose()).filter(|&disposed| disposed).count()
}

#[test]
fn views_and_handles_share_one_disposal_protocol() {
    let native = MockNative::new();
    let mut storage = open_storage(&native, 0, InteropConfig::new()).unwrap();
    let config = InteropConfig::new();
    let mut seq = SeqView::create(&native, &storage, 4, config).unwrap();
    let mut set = SetView::create(&native, &storage, 8, config).unwrap();
    let mut graph = GraphView::create(&native, &storage, 0, 0, config).unwrap();
    let mut mat = SparseView::create(&native, &[4], 4, config).unwrap();

    let mut views: [&mut dyn Disposable; 4] = [&mut seq, &mut set, &mut graph, &mut mat];
    assert_eq!(dispose_all(&mut views), 4);
    assert_eq!(dispose_all(&mut views), 0);
    assert!(views.iter().all(|v| v.is_disposed()));
    assert_eq!(native.sparse_releases(), 1);
    assert!(seq.len().is_err());

    drop((seq, set, graph));
    assert!(Disposable::dispose(&mut storage));
    assert!(Disposable::is_disposed(&storage));
    assert_eq!(native.storage_releases(), 1);
}
