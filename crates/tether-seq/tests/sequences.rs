//! Integration tests: sequence views over the in-process backend.
//!
//! Covers index resolution in both walk directions, enumeration order,
//! block splitting on insertion, and the view lifecycle.

use proptest::prelude::*;
use tether_core::{
    ConfigError, Enumerable, ForeignHandle, HasHandle, InteropConfig, InteropError, Status,
};
use tether_seq::{SeqView, SetView, ViewState};
use tether_test_utils::{init_logging, storage, MockNative, Point};

fn count_elements<E: Enumerable>(view: &E) -> usize {
    view.elements().unwrap().count()
}

#[test]
fn removing_the_third_of_five_enumerates_four_in_order() {
    init_logging();
    let native = MockNative::new();
    let storage = storage(&native);
    let mut seq = SeqView::create(&native, &storage, 4, InteropConfig::new()).unwrap();
    for v in 10..15i32 {
        seq.push_value(&v).unwrap();
    }

    seq.remove(2).unwrap();

    assert_eq!(seq.len().unwrap(), 4);
    assert_eq!(seq.to_vec::<i32>().unwrap(), vec![10, 11, 13, 14]);
    assert_eq!(count_elements(&seq), 4);
}

#[test]
fn negative_indices_count_from_the_end() {
    let native = MockNative::new();
    let storage = storage(&native);
    let mut seq = SeqView::create(&native, &storage, 8, InteropConfig::new()).unwrap();
    for i in 0..9 {
        seq.push_value(&Point::new(i, -i)).unwrap();
    }

    let len = seq.len().unwrap() as isize;
    assert_eq!(seq.get(-1).unwrap(), seq.get(len - 1).unwrap());
    assert_eq!(seq.read::<Point>(-1).unwrap(), Point::new(8, -8));
    assert_eq!(seq.read::<Point>(-9).unwrap(), Point::new(0, 0));
}

#[test]
fn out_of_range_indices_are_rejected() {
    let native = MockNative::new();
    let storage = storage(&native);
    let mut seq = SeqView::create(&native, &storage, 4, InteropConfig::new()).unwrap();
    for v in 0..5i32 {
        seq.push_value(&v).unwrap();
    }

    assert_eq!(
        seq.get(5).unwrap_err(),
        InteropError::OutOfRange { index: 5, len: 5 }
    );
    assert_eq!(
        seq.get(-6).unwrap_err(),
        InteropError::OutOfRange { index: -6, len: 5 }
    );
}

#[test]
fn lookups_agree_with_enumeration_across_many_blocks() {
    let native = MockNative::new();
    let storage = storage(&native);
    let mut seq = SeqView::create(&native, &storage, 4, InteropConfig::new()).unwrap();
    for v in 0..300i32 {
        seq.push_value(&v).unwrap();
    }

    let blocks = seq.blocks().unwrap();
    assert!(blocks.len() > 1);
    assert_eq!(blocks.iter().map(|b| b.count).sum::<usize>(), 300);
    let mut start = 0;
    for b in &blocks {
        assert_eq!(b.start_index, start);
        start += b.count as i32;
    }

    // Both halves of the range, so both walk directions are exercised.
    for i in [0isize, 1, 149, 150, 151, 298, 299] {
        assert_eq!(seq.read::<i32>(i).unwrap(), i as i32);
    }
    let enumerated: Vec<i32> = seq.to_vec().unwrap();
    assert_eq!(enumerated, (0..300).collect::<Vec<_>>());
}

#[test]
fn inserting_into_a_full_block_splits_it() {
    let native = MockNative::new();
    let storage = storage(&native);
    let mut seq = SeqView::create(&native, &storage, 4, InteropConfig::new()).unwrap();
    for v in 0..4i32 {
        seq.push_value(&v).unwrap();
    }
    assert_eq!(seq.blocks().unwrap().len(), 1);

    seq.insert(1, &99i32.to_ne_bytes()).unwrap();

    assert_eq!(seq.blocks().unwrap().len(), 2);
    assert_eq!(seq.to_vec::<i32>().unwrap(), vec![0, 99, 1, 2, 3]);
    assert_eq!(seq.read::<i32>(3).unwrap(), 2);

    let len = seq.len().unwrap() as isize;
    seq.insert(len, &7i32.to_ne_bytes()).unwrap();
    assert_eq!(seq.read::<i32>(-1).unwrap(), 7);
    assert!(matches!(
        seq.insert(len + 2, &0i32.to_ne_bytes()),
        Err(InteropError::OutOfRange { .. })
    ));
}

#[test]
fn element_buffers_must_match_the_element_size() {
    let native = MockNative::new();
    let storage = storage(&native);
    let mut seq = SeqView::create(&native, &storage, 4, InteropConfig::new()).unwrap();
    assert_eq!(
        seq.push(&[0u8; 3]).unwrap_err(),
        InteropError::ElementSizeMismatch {
            expected: 4,
            actual: 3
        }
    );
    assert!(seq.is_empty().unwrap());
}

#[test]
fn enumeration_moves_the_view_through_its_states() {
    let native = MockNative::new();
    let storage = storage(&native);
    let mut seq = SeqView::create(&native, &storage, 4, InteropConfig::new()).unwrap();
    seq.push_value(&1i32).unwrap();
    assert_eq!(seq.state(), ViewState::Bound);

    {
        let outer = seq.iter().unwrap();
        assert_eq!(seq.state(), ViewState::Enumerating);
        {
            let inner = seq.iter().unwrap();
            assert_eq!(inner.count(), 1);
        }
        assert_eq!(seq.state(), ViewState::Enumerating);
        assert_eq!(outer.count(), 1);
    }
    assert_eq!(seq.state(), ViewState::Bound);
}

#[test]
fn unbound_and_released_views_refuse_access() {
    let native = MockNative::new();
    let storage = storage(&native);

    let unbound: SeqView<'_, MockNative> = SeqView::unbound(&native, InteropConfig::new());
    assert_eq!(unbound.state(), ViewState::Uninitialized);
    assert_eq!(unbound.len().unwrap_err(), InteropError::Unbound);

    let mut seq = SeqView::create(&native, &storage, 4, InteropConfig::new()).unwrap();
    seq.push_value(&1i32).unwrap();
    assert!(seq.release());
    assert!(!seq.release());
    assert_eq!(seq.state(), ViewState::Released);
    assert_eq!(
        seq.len().unwrap_err(),
        InteropError::Disposed { object: "sequence" }
    );
    assert!(seq.iter().is_err());
    // Headers live in the storage; releasing a view never frees them.
    assert_eq!(native.storage_releases(), 0);
}

#[test]
fn a_second_view_sees_the_same_header() {
    let native = MockNative::new();
    let storage = storage(&native);
    let mut seq = SeqView::create(&native, &storage, 4, InteropConfig::new()).unwrap();
    for v in [3i32, 1, 4] {
        seq.push_value(&v).unwrap();
    }

    let header = seq.handle().raw_address();
    let other = unsafe { SeqView::from_header(&native, header) }.unwrap();
    assert_eq!(other.to_vec::<i32>().unwrap(), vec![3, 1, 4]);
    assert!(!other.handle().owns());
}

#[test]
fn binding_to_the_wrong_record_kind_fails() {
    let native = MockNative::new();
    let storage = storage(&native);
    let set = SetView::create(&native, &storage, 8, InteropConfig::new()).unwrap();

    let err = unsafe { SeqView::from_header(&native, set.handle().raw_address()) }.unwrap_err();
    assert!(matches!(err, InteropError::KindMismatch { record: "Seq", .. }));
}

#[test]
fn binding_under_an_invalid_config_fails() {
    let native = MockNative::new();
    let storage = storage(&native);
    let seq = SeqView::create(&native, &storage, 4, InteropConfig::new()).unwrap();
    let config = InteropConfig {
        max_block_walk: 0,
        ..InteropConfig::new()
    };

    let mut view: SeqView<'_, MockNative> = SeqView::unbound(&native, config);
    let handle = unsafe { ForeignHandle::wrap(seq.handle().raw_address()) }.unwrap();
    assert_eq!(
        unsafe { view.bind(handle) }.unwrap_err(),
        InteropError::Config(ConfigError::ZeroBlockWalk)
    );
    assert_eq!(view.state(), ViewState::Uninitialized);

    assert!(matches!(
        SeqView::create(&native, &storage, 4, config),
        Err(InteropError::Config(_))
    ));
}

#[test]
fn native_failures_surface_with_their_status() {
    let native = MockNative::new();
    let storage = storage(&native);
    let mut seq = SeqView::create(&native, &storage, 4, InteropConfig::new()).unwrap();
    seq.push_value(&1i32).unwrap();

    native.fail_next("seq_push", Status::NoMem);
    match seq.push_value(&2i32) {
        Err(InteropError::Native(e)) => {
            assert_eq!(e.status(), Status::NoMem);
            assert_eq!(e.function, "seq_push");
        }
        other => panic!("expected a native failure, got {other:?}"),
    }
    assert_eq!(seq.len().unwrap(), 1);
    assert!(!native.has_pending_error());
}

#[cfg(not(miri))]
mod proptests {
    use super::*;

    #[derive(Clone, Debug)]
    enum Edit {
        Push(i32),
        Insert(usize, i32),
        Remove(usize),
    }

    fn edit() -> impl Strategy<Value = Edit> {
        prop_oneof![
            any::<i32>().prop_map(Edit::Push),
            (any::<usize>(), any::<i32>()).prop_map(|(at, v)| Edit::Insert(at, v)),
            any::<usize>().prop_map(Edit::Remove),
        ]
    }

    proptest! {
        #[test]
        fn edits_match_a_vec_model(edits in proptest::collection::vec(edit(), 1..200)) {
            let native = MockNative::new();
            let storage = storage(&native);
            let mut seq = SeqView::create(&native, &storage, 4, InteropConfig::new()).unwrap();
            let mut model: Vec<i32> = Vec::new();

            for edit in edits {
                match edit {
                    Edit::Push(v) => {
                        seq.push_value(&v).unwrap();
                        model.push(v);
                    }
                    Edit::Insert(at, v) => {
                        let at = at % (model.len() + 1);
                        seq.insert(at as isize, &v.to_ne_bytes()).unwrap();
                        model.insert(at, v);
                    }
                    Edit::Remove(at) => {
                        if model.is_empty() {
                            prop_assert!(seq.remove(0).is_err());
                            continue;
                        }
                        let at = at % model.len();
                        seq.remove(at as isize).unwrap();
                        model.remove(at);
                    }
                }
            }

            prop_assert_eq!(seq.len().unwrap(), model.len());
            prop_assert_eq!(seq.to_vec::<i32>().unwrap(), model.clone());
            for (i, v) in model.iter().enumerate() {
                prop_assert_eq!(seq.read::<i32>(i as isize).unwrap(), *v);
            }
        }
    }
}
