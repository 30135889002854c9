//! Integration tests: set views, free slots and logical positions.

use tether_core::{Enumerable, ForeignHandle, HasHandle, InteropConfig, InteropError};
use tether_layout::catalog;
use tether_seq::{SeqView, SetView};
use tether_test_utils::{init_logging, storage, MockNative, Point};

#[test]
fn removed_slots_are_free_and_skipped() {
    init_logging();
    let native = MockNative::new();
    let storage = storage(&native);
    let mut set = SetView::create(&native, &storage, 8, InteropConfig::new()).unwrap();
    for i in 0..3 {
        set.add_value(&Point::new(i, i * 10)).unwrap();
    }

    set.remove(1).unwrap();

    assert_eq!(set.active_count().unwrap(), 2);
    assert_eq!(set.capacity().unwrap(), 3);
    assert_eq!(set.get(1).unwrap_err(), InteropError::FreeNode { index: 1 });
    let indices: Vec<usize> = set.iter().unwrap().map(|n| n.unwrap().index()).collect();
    assert_eq!(indices, vec![0, 2]);
    assert_eq!(set.read_payload::<Point>(2).unwrap(), Point::new(2, 20));
}

#[test]
fn freed_slots_are_reused_first() {
    let native = MockNative::new();
    let storage = storage(&native);
    let mut set = SetView::create(&native, &storage, 8, InteropConfig::new()).unwrap();
    for i in 0..4 {
        set.add_value(&Point::new(i, 0)).unwrap();
    }
    set.remove(2).unwrap();

    let reused = set.add_value(&Point::new(7, 7)).unwrap().index();

    assert_eq!(reused, 2);
    assert_eq!(set.capacity().unwrap(), 4);
    assert_eq!(set.read_payload::<Point>(2).unwrap(), Point::new(7, 7));
}

#[test]
fn removing_a_free_slot_twice_fails() {
    let native = MockNative::new();
    let storage = storage(&native);
    let mut set = SetView::create(&native, &storage, 8, InteropConfig::new()).unwrap();
    set.add_value(&Point::new(1, 1)).unwrap();
    set.remove(0).unwrap();
    assert_eq!(set.remove(0).unwrap_err(), InteropError::FreeNode { index: 0 });
}

#[test]
fn negative_logical_positions_count_from_the_last_active() {
    let native = MockNative::new();
    let storage = storage(&native);
    let mut set = SetView::create(&native, &storage, 8, InteropConfig::new()).unwrap();
    for i in 0..6 {
        set.add_value(&Point::new(i, 0)).unwrap();
    }
    set.remove(5).unwrap();
    set.remove(0).unwrap();

    let active = set.active_count().unwrap() as isize;
    assert_eq!(set.nth_active(-1).unwrap(), set.nth_active(active - 1).unwrap());
    assert_eq!(set.nth_active(-1).unwrap().index(), 4);
    assert_eq!(set.nth_active(0).unwrap().index(), 1);
    assert_eq!(
        set.nth_active(active).unwrap_err(),
        InteropError::OutOfRange { index: active, len: 4 }
    );
}

#[test]
fn enumeration_visits_exactly_the_active_elements() {
    let native = MockNative::new();
    let storage = storage(&native);
    let mut set = SetView::create(&native, &storage, 8, InteropConfig::new()).unwrap();
    for i in 0..40 {
        set.add_value(&Point::new(i, -i)).unwrap();
    }
    for i in (0..40).step_by(3) {
        set.remove(i).unwrap();
    }

    let nodes: Vec<_> = set.elements().unwrap().map(Result::unwrap).collect();
    assert_eq!(nodes.len(), Enumerable::active_count(&set).unwrap());
    assert!(nodes.iter().all(|n| !n.is_free().unwrap()));
    assert!(nodes.iter().all(|n| n.index() % 3 != 0));
}

#[test]
fn oversized_payloads_are_rejected_before_the_native_call() {
    let native = MockNative::new();
    let storage = storage(&native);
    let mut set = SetView::create(&native, &storage, 8, InteropConfig::new()).unwrap();
    assert_eq!(set.payload_size().unwrap(), 8);
    assert_eq!(
        set.add(&[0u8; 9]).unwrap_err(),
        InteropError::ElementSizeMismatch {
            expected: 8,
            actual: 9
        }
    );
    assert_eq!(set.active_count().unwrap(), 0);
}

#[test]
fn a_slot_flagged_free_in_native_memory_is_refused() {
    let native = MockNative::new();
    let storage = storage(&native);
    let mut set = SetView::create(&native, &storage, 8, InteropConfig::new()).unwrap();
    for i in 0..3 {
        set.add_value(&Point::new(i, i)).unwrap();
    }

    // Mark slot 1 free without going through the native remove.
    set.get(1)
        .unwrap()
        .write_at(0, catalog::SET_ELEM_FREE_FLAG)
        .unwrap();

    assert_eq!(set.get(1).unwrap_err(), InteropError::FreeNode { index: 1 });
    assert_eq!(
        set.read_payload::<Point>(1).unwrap_err(),
        InteropError::FreeNode { index: 1 }
    );
    assert_eq!(
        set.get(3).unwrap_err(),
        InteropError::OutOfRange { index: 3, len: 3 }
    );
    let indices: Vec<usize> = set.iter().unwrap().map(|n| n.unwrap().index()).collect();
    assert_eq!(indices, vec![0, 2]);
}

#[test]
fn a_slot_smaller_than_the_element_prefix_has_no_payload() {
    let native = MockNative::new();
    let storage = storage(&native);
    let seq = SeqView::create(&native, &storage, 4, InteropConfig::new()).unwrap();
    let unchecked = InteropConfig {
        validate_layouts: false,
        ..InteropConfig::new()
    };

    let mut set: SetView<'_, MockNative> = SetView::unbound(&native, unchecked);
    let handle = unsafe { ForeignHandle::wrap(seq.handle().raw_address()) }.unwrap();
    unsafe { set.bind(handle) }.unwrap();

    assert_eq!(
        set.payload_size().unwrap_err(),
        InteropError::ElementSizeMismatch {
            expected: catalog::set_elem().header_size(),
            actual: 4
        }
    );
}
