use crate::{
    arena::Handle,
    executor::{GraphState, PoolShared, PoolState},
    sync::MutexGuard,
    task::{TaskBody, TaskInputs, TaskState, TaskValue},
};
use std::{
    borrow::Cow,
    panic::{self, AssertUnwindSafe},
    time::Instant,
};
use tracing::{error, trace};

/// A task taken off the ready queue, owned by the thread that will run it.
pub(super) struct ClaimedTask<V: TaskValue> {
    graph: Handle<GraphState<V>>,
    task: u32,
    name: Cow<'static, str>,
    body: Option<TaskBody<V>>,
    inputs: TaskInputs<V>,
}

impl<V: TaskValue> PoolState<V> {
    /// Pop queued tasks until one that can still run is found.
    ///
    /// Entries whose graph was dropped or whose task was cancelled are
    /// discarded.
    pub(super) fn claim_next(&mut self) -> Option<ClaimedTask<V>> {
        while let Some(queued) = self.queue.pop_front() {
            if let Some(claimed) = self.claim(queued.graph, queued.task) {
                return Some(claimed);
            }
        }
        None
    }

    /// Move a ready task into the running state, taking its body and a
    /// snapshot of its input values.
    fn claim(&mut self, graph: Handle<GraphState<V>>, task: u32) -> Option<ClaimedTask<V>> {
        let state = self.graphs.get_mut(graph)?;
        let slot = state.tasks.get_mut(task as usize)?;
        if slot.state != TaskState::Ready {
            return None;
        }
        slot.state = TaskState::Running;
        let values = slot
            .inputs
            .iter()
            .map(|&token| {
                let value = state.tokens[token.index()].value.clone();
                debug_assert!(value.is_some(), "PoolState::claim: [1]");
                (token, value.unwrap_or_default())
            })
            .collect();
        Some(ClaimedTask {
            graph,
            task,
            name: slot.name.clone(),
            body: slot.body.take(),
            inputs: TaskInputs { values },
        })
    }

    /// Record the result of a finished task.
    ///
    /// Publishes `value` on the task's output token, queues dependents that
    /// became ready and returns one of them to be run directly by the calling
    /// thread. Also returns how many tasks were queued.
    fn complete(
        &mut self,
        graph: Handle<GraphState<V>>,
        task: u32,
        value: V,
    ) -> (Option<ClaimedTask<V>>, usize) {
        let Some(state) = self.graphs.get_mut(graph) else {
            // Graph was torn down while the body ran.
            return (None, 0);
        };
        let slot = &mut state.tasks[task as usize];
        debug_assert_eq!(slot.state, TaskState::Running, "PoolState::complete: [1]");
        slot.state = TaskState::Done;
        let output = slot.output;
        state.remaining -= 1;

        let mut ready = Vec::new();
        if self.satisfy_token(graph, output, value, &mut ready).is_err() {
            return (None, 0);
        }
        let mut ready = ready.into_iter();
        let continuation = ready.next().and_then(|first| self.claim(graph, first));
        let queued = ready.len();
        self.enqueue(graph, ready);
        (continuation, queued)
    }
}

fn invoke<V: TaskValue>(claimed: ClaimedTask<V>) -> (Handle<GraphState<V>>, u32, V) {
    let ClaimedTask {
        graph,
        task,
        name,
        body,
        inputs,
    } = claimed;
    let value = match body {
        Some(body) => {
            trace!(task = %name, "run task");
            match panic::catch_unwind(AssertUnwindSafe(|| body(&inputs))) {
                Ok(value) => value,
                Err(_) => {
                    error!(task = %name, "task body panicked");
                    V::default()
                }
            }
        }
        // Bodiless tasks only join their inputs.
        None => V::default(),
    };
    (graph, task, value)
}

/// Run `claimed` and every continuation it unlocks with the lock released,
/// returning the reacquired guard.
pub(super) fn run_claimed<'a, V: TaskValue>(
    shared: &'a PoolShared<V>,
    guard: MutexGuard<'a, PoolState<V>>,
    claimed: ClaimedTask<V>,
) -> MutexGuard<'a, PoolState<V>> {
    drop(guard);
    let mut next = claimed;
    loop {
        let (graph, task, value) = invoke(next);
        let mut guard = shared.state.lock();
        let (continuation, queued) = guard.complete(graph, task, value);
        shared.notify_queued(queued);
        shared.task_done.notify_all();
        match continuation {
            Some(claimed) => {
                drop(guard);
                next = claimed;
            }
            None => return guard,
        }
    }
}

pub(super) fn worker_loop<V: TaskValue>(shared: &PoolShared<V>) {
    let mut guard = shared.state.lock();
    loop {
        if guard.shutdown {
            break;
        }
        guard = match guard.claim_next() {
            Some(claimed) => run_claimed(shared, guard, claimed),
            None => shared.work_ready.wait(guard),
        };
    }
}

pub(super) fn run_one<V: TaskValue>(shared: &PoolShared<V>) -> bool {
    let mut guard = shared.state.lock();
    match guard.claim_next() {
        Some(claimed) => {
            drop(run_claimed(shared, guard, claimed));
            true
        }
        None => false,
    }
}

/// Block until every task of `graph` has finished or been cancelled, helping
/// to execute ready tasks of any graph in the meantime.
///
/// Returns `false` if `deadline` passed first. A graph that no longer exists
/// counts as finished.
pub(super) fn wait_graph<V: TaskValue>(
    shared: &PoolShared<V>,
    graph: Handle<GraphState<V>>,
    deadline: Option<Instant>,
) -> bool {
    let mut guard = shared.state.lock();
    loop {
        match guard.graphs.get(graph) {
            Some(state) if state.remaining > 0 => {}
            _ => return true,
        }
        if let Some(claimed) = guard.claim_next() {
            guard = run_claimed(shared, guard, claimed);
            continue;
        }
        match deadline {
            None => guard = shared.task_done.wait(guard),
            Some(deadline) => {
                if Instant::now() >= deadline {
                    return false;
                }
                let (reacquired, _timed_out) = shared.task_done.wait_until(guard, deadline);
                guard = reacquired;
            }
        }
    }
}
