#![allow(missing_docs)]
#![cfg(not(feature = "loom"))]

mod common;

use ehp::{
    executor::{GraphError, TaskGraph, TaskPool},
    task::TaskInputs,
};
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

fn sum(inputs: &TaskInputs<u32>) -> u32 {
    inputs.iter().map(|(_, value)| *value).sum()
}

#[test]
fn values_flow_along_edges_for_any_thread_count() {
    common::init_tracing();
    for threads in [1, 2, 4] {
        let pool = TaskPool::<u32>::new(threads).unwrap();
        let graph = TaskGraph::new(&pool, "diamond");
        let a = graph.add_task(&[], "a", |_| 1).unwrap();
        let b = graph.add_task(&[], "b", |_| 10).unwrap();
        let c = graph
            .add_task(&[a, b], "c", |inputs| 100 + sum(inputs))
            .unwrap();
        let d = graph.add_task(&[c], "d", |inputs| 1000 + sum(inputs)).unwrap();
        graph.wait();
        assert_eq!(graph.value(c), Some(111), "threads = {threads}");
        assert_eq!(graph.value(d), Some(1111), "threads = {threads}");
        assert!(graph.is_complete());
    }
}

#[test]
fn external_token_gates_dependents() {
    let pool = TaskPool::<u32>::new(2).unwrap();
    let graph = TaskGraph::new(&pool, "external");
    let input = graph.token().unwrap();
    let doubled = graph
        .add_task(&[input], "double", |inputs| sum(inputs) * 2)
        .unwrap();

    assert!(!graph.wait_deadline(Instant::now() + Duration::from_millis(20)));
    assert_eq!(graph.remaining(), 1);

    graph.satisfy(input, 21).unwrap();
    graph.wait();
    assert_eq!(graph.value(doubled), Some(42));
}

#[test]
fn satisfying_twice_keeps_first_value() {
    let pool = TaskPool::<u32>::new(1).unwrap();
    let graph = TaskGraph::new(&pool, "twice");
    let runs = Arc::new(AtomicUsize::new(0));
    let input = graph.token().unwrap();
    let counter = runs.clone();
    let out = graph
        .add_task(&[input], "count", move |inputs| {
            counter.fetch_add(1, Ordering::Relaxed);
            sum(inputs)
        })
        .unwrap();

    graph.satisfy(input, 3).unwrap();
    graph.satisfy(input, 4).unwrap();
    graph.wait();
    assert_eq!(graph.value(input), Some(3));
    assert_eq!(graph.value(out), Some(3));
    assert_eq!(runs.load(Ordering::Relaxed), 1);
}

#[test]
fn pre_met_tokens_and_barriers() {
    let pool = TaskPool::<u32>::new(2).unwrap();
    let graph = TaskGraph::new(&pool, "barrier");
    let seed = graph.token_met(5).unwrap();
    let tiles: Vec<_> = (0..4)
        .map(|tile| {
            graph
                .add_task(&[seed], format!("tile {tile}"), move |inputs| sum(inputs) + tile)
                .unwrap()
        })
        .collect();
    let joined = graph.add_barrier(&tiles, "WaitForMany").unwrap();
    let after = graph.add_task(&[joined], "after", |_| 7).unwrap();
    graph.wait();
    assert!(graph.all_met(&tiles));
    assert_eq!(graph.value(joined), Some(0));
    assert_eq!(graph.value(after), Some(7));
}

#[test]
fn foreign_or_closed_tokens_are_rejected() {
    let pool = TaskPool::<u32>::new(1).unwrap();
    let other = TaskGraph::new(&pool, "other");
    let foreign = other.token().unwrap();
    let graph = TaskGraph::new(&pool, "empty");
    assert_eq!(
        graph.add_task(&[foreign], "bad", |_| 0),
        Err(GraphError::UnknownToken(foreign))
    );

    let handle = other.handle();
    drop(other);
    assert_eq!(handle.token(), Err(GraphError::GraphClosed));
    assert_eq!(handle.satisfy(foreign, 1), Err(GraphError::GraphClosed));
    assert!(handle.is_complete());
    handle.wait();
}

#[test]
fn blocked_graph_defers_ready_tasks() {
    let pool = TaskPool::<u32>::new(1).unwrap();
    let graph = TaskGraph::new(&pool, "blocked");
    graph.block();
    let a = graph.add_task(&[], "a", |_| 1).unwrap();
    assert_eq!(pool.queued(), 0);
    assert!(!pool.run_one());

    let listing = graph.describe();
    assert!(listing.contains("blocked"), "{listing}");
    assert!(listing.contains("ready"), "{listing}");

    graph.unblock();
    assert_eq!(pool.queued(), 1);
    assert!(pool.run_one());
    assert_eq!(graph.value(a), Some(1));
}

#[test]
fn cancel_discards_tasks_that_never_started() {
    let pool = TaskPool::<u32>::new(2).unwrap();
    let graph = TaskGraph::new(&pool, "cancel");
    let input = graph.token().unwrap();
    let a = graph.add_task(&[input], "a", |_| 1).unwrap();
    graph.add_task(&[a], "b", |_| 2).unwrap();
    assert_eq!(graph.cancel(), 2);
    assert_eq!(graph.remaining(), 0);
    graph.wait();

    graph.satisfy(input, 0).unwrap();
    assert_eq!(graph.value(a), None);
}

#[test]
fn panicking_body_publishes_default() {
    let pool = TaskPool::<u32>::new(2).unwrap();
    let graph = TaskGraph::new(&pool, "panics");
    let bad = graph
        .add_task(&[], "bad", |_| -> u32 { panic!("kernel bug") })
        .unwrap();
    let after = graph.add_task(&[bad], "after", |inputs| sum(inputs) + 1).unwrap();
    graph.wait();
    assert_eq!(graph.value(after), Some(1));
}

#[test]
fn readers_of_a_token_are_listed() {
    let pool = TaskPool::<u32>::new(1).unwrap();
    let graph = TaskGraph::new(&pool, "readers");
    let base = graph.token().unwrap();
    let unrelated = graph.add_task(&[], "unrelated", |_| 0).unwrap();
    let first = graph.add_task(&[base], "first", |_| 0).unwrap();
    let second = graph.add_task(&[base, unrelated], "second", |_| 0).unwrap();
    assert_eq!(graph.outputs_consuming(base), vec![first, second]);
}

#[test]
fn dropping_graph_releases_it_from_pool() {
    let pool = TaskPool::<u32>::new(3).unwrap();
    assert_eq!(pool.num_threads(), 3);
    let graph = TaskGraph::new(&pool, "short-lived");
    let input = graph.token().unwrap();
    graph.add_task(&[input], "never", |_| 0).unwrap();
    assert_eq!(pool.live_graphs(), 1);
    drop(graph);
    assert_eq!(pool.live_graphs(), 0);
}
