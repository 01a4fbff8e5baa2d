#![allow(missing_docs)]
#![cfg(feature = "loom")]

use ehp::{
    executor::{TaskGraph, TaskPool},
    task::TaskInputs,
};
use loom::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

/// Explore `f` with at most two preemptions per execution unless
/// `LOOM_MAX_PREEMPTIONS` sets another bound.
fn model<F>(f: F)
where
    F: Fn() + Sync + Send + 'static,
{
    let mut builder = loom::model::Builder::new();
    if builder.preemption_bound.is_none() {
        builder.preemption_bound = Some(2);
    }
    builder.check(f);
}

/// Body that counts its executions and returns `value` plus all inputs.
fn summing(
    runs: &Arc<AtomicUsize>,
    value: u32,
) -> impl FnOnce(&TaskInputs<u32>) -> u32 + Send + 'static {
    let runs = runs.clone();
    move |inputs| {
        runs.fetch_add(1, Ordering::Relaxed);
        value + inputs.iter().map(|(_, input)| *input).sum::<u32>()
    }
}

#[test]
fn loom_diamond_correctness_and_single_exec() {
    model(|| {
        // Graph:
        //   a(1)   b(10)
        //     \    /
        //      c(100)
        //        |
        //      d(1000)
        let pool = TaskPool::<u32>::new(2).unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let graph = TaskGraph::new(&pool, "diamond");
        let a = graph.add_task(&[], "a", summing(&runs, 1)).unwrap();
        let b = graph.add_task(&[], "b", summing(&runs, 10)).unwrap();
        let c = graph.add_task(&[a, b], "c", summing(&runs, 100)).unwrap();
        let d = graph.add_task(&[c], "d", summing(&runs, 1000)).unwrap();

        graph.wait();
        assert_eq!(graph.value(c), Some(111));
        assert_eq!(graph.value(d), Some(1111));
        assert_eq!(runs.load(Ordering::Relaxed), 4);
    });
}

#[test]
fn loom_external_token_races_worker() {
    model(|| {
        let pool = TaskPool::<u32>::new(2).unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let graph = TaskGraph::new(&pool, "external");
        let input = graph.token().unwrap();
        let a = graph.add_task(&[], "a", summing(&runs, 1)).unwrap();
        let sum = graph.add_task(&[input, a], "sum", summing(&runs, 0)).unwrap();

        let handle = graph.handle();
        let feeder = loom::thread::spawn(move || handle.satisfy(input, 41).unwrap());
        graph.wait();
        feeder.join().unwrap();

        assert_eq!(graph.value(sum), Some(42));
        assert_eq!(runs.load(Ordering::Relaxed), 2);
    });
}

#[test]
fn loom_concurrent_satisfy_runs_dependent_once() {
    model(|| {
        // No background workers: the waiting thread runs everything.
        let pool = TaskPool::<u32>::new(1).unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let graph = TaskGraph::new(&pool, "idempotent");
        let input = graph.token().unwrap();
        let out = graph.add_task(&[input], "out", summing(&runs, 1)).unwrap();

        let feeders: Vec<_> = [5, 5]
            .into_iter()
            .map(|value| {
                let handle = graph.handle();
                loom::thread::spawn(move || handle.satisfy(input, value).unwrap())
            })
            .collect();
        graph.wait();
        for feeder in feeders {
            feeder.join().unwrap();
        }

        assert_eq!(graph.value(out), Some(6));
        assert_eq!(runs.load(Ordering::Relaxed), 1);
    });
}
