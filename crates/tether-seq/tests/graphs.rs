//! Integration tests: graph views and edge rings.

use tether_core::{InteropConfig, InteropError, Status};
use tether_layout::catalog;
use tether_seq::GraphView;
use tether_test_utils::{init_logging, storage, MockNative, Point};

fn sorted(mut v: Vec<usize>) -> Vec<usize> {
    v.sort_unstable();
    v
}

#[test]
fn degrees_and_neighbours_follow_the_edge_rings() {
    init_logging();
    let native = MockNative::new();
    let storage = storage(&native);
    let mut graph = GraphView::create(&native, &storage, 8, 0, InteropConfig::new()).unwrap();
    for i in 0..4 {
        graph.add_vertex(bytemuck::bytes_of(&Point::new(i, i))).unwrap();
    }

    assert!(graph.add_edge(0, 1, 1.0, &[]).unwrap());
    assert!(graph.add_edge(0, 2, 2.5, &[]).unwrap());
    assert!(graph.add_edge(2, 3, 1.0, &[]).unwrap());
    // Already connected, in the other direction.
    assert!(!graph.add_edge(1, 0, 9.0, &[]).unwrap());

    assert_eq!(graph.vertex_count().unwrap(), 4);
    assert_eq!(graph.edge_count().unwrap(), 3);
    assert_eq!(graph.degree(0).unwrap(), 2);
    assert_eq!(graph.degree(2).unwrap(), 2);
    assert_eq!(graph.degree(3).unwrap(), 1);
    assert_eq!(sorted(graph.neighbors(0).unwrap()), vec![1, 2]);
    assert_eq!(sorted(graph.neighbors(2).unwrap()), vec![0, 3]);
    assert_eq!(graph.edge_weight(2, 0).unwrap(), Some(2.5));
    assert_eq!(graph.edge_weight(1, 0).unwrap(), Some(1.0));
    assert!(graph.find_edge(1, 3).unwrap().is_none());
    assert_eq!(graph.vertex_payload::<Point>(3).unwrap(), Point::new(3, 3));
}

#[test]
fn removing_edges_and_vertices_updates_the_rings() {
    let native = MockNative::new();
    let storage = storage(&native);
    let mut graph = GraphView::create(&native, &storage, 0, 0, InteropConfig::new()).unwrap();
    for _ in 0..4 {
        graph.add_vertex(&[]).unwrap();
    }
    graph.add_edge(0, 1, 1.0, &[]).unwrap();
    graph.add_edge(0, 2, 1.0, &[]).unwrap();
    graph.add_edge(2, 3, 1.0, &[]).unwrap();

    graph.remove_edge(0, 1).unwrap();
    assert_eq!(graph.degree(0).unwrap(), 1);
    assert_eq!(graph.degree(1).unwrap(), 0);
    assert_eq!(graph.edge_count().unwrap(), 2);
    // Absent edges are ignored.
    graph.remove_edge(0, 1).unwrap();

    assert_eq!(graph.remove_vertex(2).unwrap(), 2);
    assert_eq!(graph.vertex_count().unwrap(), 3);
    assert_eq!(graph.edge_count().unwrap(), 0);
    assert_eq!(graph.degree(0).unwrap(), 0);
    assert_eq!(graph.vertex(2).unwrap_err(), InteropError::FreeNode { index: 2 });
    assert_eq!(graph.vertices().unwrap().count(), 3);
    assert_eq!(graph.edges().unwrap().count(), 0);
}

#[test]
fn self_loops_are_refused_by_the_native_side() {
    let native = MockNative::new();
    let storage = storage(&native);
    let mut graph = GraphView::create(&native, &storage, 0, 0, InteropConfig::new()).unwrap();
    graph.add_vertex(&[]).unwrap();
    graph.add_vertex(&[]).unwrap();

    match graph.add_edge(1, 1, 1.0, &[]) {
        Err(InteropError::Native(e)) => assert_eq!(e.status(), Status::BadArg),
        other => panic!("expected a native failure, got {other:?}"),
    }
    assert_eq!(graph.edge_count().unwrap(), 0);
}

#[test]
fn edge_payloads_travel_with_the_edge() {
    let native = MockNative::new();
    let storage = storage(&native);
    let mut graph = GraphView::create(&native, &storage, 0, 8, InteropConfig::new()).unwrap();
    graph.add_vertex(&[]).unwrap();
    graph.add_vertex(&[]).unwrap();
    graph
        .add_edge(0, 1, 0.5, bytemuck::bytes_of(&Point::new(4, 2)))
        .unwrap();

    let edge = graph.find_edge(0, 1).unwrap().expect("edge");
    let payload_at = catalog::graph_edge().header_size();
    assert_eq!(edge.read_at::<Point>(payload_at).unwrap(), Point::new(4, 2));
    assert_eq!(graph.edge_weight(0, 1).unwrap(), Some(0.5));
}

#[test]
fn a_vertex_flagged_free_in_native_memory_is_refused() {
    let native = MockNative::new();
    let storage = storage(&native);
    let mut graph = GraphView::create(&native, &storage, 8, 0, InteropConfig::new()).unwrap();
    for i in 0..3 {
        graph.add_vertex(bytemuck::bytes_of(&Point::new(i, i))).unwrap();
    }

    graph
        .vertex(2)
        .unwrap()
        .write_at(0, catalog::SET_ELEM_FREE_FLAG)
        .unwrap();

    assert_eq!(graph.vertex(2).unwrap_err(), InteropError::FreeNode { index: 2 });
    assert_eq!(
        graph.vertex_payload::<Point>(2).unwrap_err(),
        InteropError::FreeNode { index: 2 }
    );
    assert_eq!(
        graph.vertex(5).unwrap_err(),
        InteropError::OutOfRange { index: 5, len: 3 }
    );
    assert_eq!(graph.vertices().unwrap().count(), 2);
}
