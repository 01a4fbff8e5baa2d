mod execute;
mod graph;

pub use crate::executor::graph::{GraphError, GraphRef, TaskGraph};
use crate::{
    arena::{Arena, Handle},
    sync::{Arc, Condvar, JoinHandle, Mutex, spawn},
    task::{TaskBody, TaskState, TaskValue, Token},
};
use derive_more::Debug;
use std::{borrow::Cow, collections::VecDeque, io};
use tracing::{debug, warn};

/// Bounded worker pool that executes ready tasks of every live task graph.
///
/// Key responsibilities:
/// - Runs `num_threads - 1` background workers. The thread that waits on a
///   graph (or calls [`TaskPool::run_one`]) acts as the last worker, so a pool
///   with a single thread still makes progress.
/// - Keeps one FIFO ready queue shared by all graphs. A task enters the queue
///   once its last unmet input is satisfied.
/// - When a finished task makes exactly one dependent ready, the same thread
///   continues with that dependent without a round trip through the queue.
///
/// All scheduling state lives behind a single lock. Task bodies never run
/// while it is held.
#[must_use]
#[derive(Debug)]
pub struct TaskPool<V: TaskValue> {
    shared: Arc<PoolShared<V>>,
    #[debug(skip)]
    workers: Vec<JoinHandle<()>>,
    num_threads: usize,
}

#[derive(Debug)]
pub(crate) struct PoolShared<V: TaskValue> {
    state: Mutex<PoolState<V>>,
    /// Signalled when tasks are pushed onto the ready queue or on shutdown.
    work_ready: Condvar,
    /// Signalled whenever any task finishes or a graph is torn down.
    task_done: Condvar,
}

#[derive(Debug)]
pub(crate) struct PoolState<V: TaskValue> {
    graphs: Arena<GraphState<V>>,
    queue: VecDeque<QueuedTask<V>>,
    shutdown: bool,
}

#[derive(Debug)]
struct QueuedTask<V: TaskValue> {
    graph: Handle<GraphState<V>>,
    task: u32,
}

/// Per-graph bookkeeping kept inside the pool state.
#[derive(Debug)]
pub(crate) struct GraphState<V: TaskValue> {
    name: String,
    tasks: Vec<TaskSlot<V>>,
    tokens: Vec<TokenSlot<V>>,
    /// Tasks that have neither finished nor been cancelled.
    remaining: usize,
    /// While blocked, ready tasks are parked in `deferred` instead of queued.
    blocked: bool,
    deferred: Vec<u32>,
}

#[derive(Debug)]
struct TaskSlot<V: TaskValue> {
    name: Cow<'static, str>,
    inputs: Vec<Token>,
    output: Token,
    /// Number of inputs that are not met yet.
    inputs_left: usize,
    #[debug(skip)]
    body: Option<TaskBody<V>>,
    state: TaskState,
}

#[derive(Debug)]
struct TokenSlot<V: TaskValue> {
    /// `Some` once the token is met.
    value: Option<V>,
    /// Tasks waiting on this token, one entry per declared input.
    dependents: Vec<u32>,
}

impl<V: TaskValue> TaskPool<V> {
    /// Create a pool that executes tasks on `num_threads` threads in total.
    ///
    /// `num_threads - 1` background workers are spawned; values below one are
    /// treated as one.
    ///
    /// # Errors
    /// If the operating system refuses to spawn a worker thread.
    pub fn new(num_threads: usize) -> io::Result<Self> {
        let num_threads = num_threads.max(1);
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                graphs: Arena::with_capacity(32),
                queue: VecDeque::with_capacity(64),
                shutdown: false,
            }),
            work_ready: Condvar::new(),
            task_done: Condvar::new(),
        });
        let mut pool = Self {
            shared,
            workers: Vec::with_capacity(num_threads - 1),
            num_threads,
        };
        for index in 1..num_threads {
            let shared = pool.shared.clone();
            // On error `pool` is dropped, which joins the workers spawned so far.
            let handle = spawn(format!("ehp-worker-{index}"), move || {
                execute::worker_loop(&shared);
            })?;
            pool.workers.push(handle);
        }
        debug!(num_threads, "task pool started");
        Ok(pool)
    }

    /// Total number of threads that execute tasks, including the waiting
    /// caller.
    #[must_use]
    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Execute one ready task (and any continuation it unlocks) on the
    /// calling thread.
    ///
    /// Returns `false` when the ready queue was empty.
    pub fn run_one(&self) -> bool {
        execute::run_one(&self.shared)
    }

    /// Number of tasks currently waiting in the ready queue.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Number of graphs that have not been dropped yet.
    #[must_use]
    pub fn live_graphs(&self) -> usize {
        self.shared.state.lock().graphs.len()
    }

    pub(crate) fn shared(&self) -> &Arc<PoolShared<V>> {
        &self.shared
    }
}

impl<V: TaskValue> Drop for TaskPool<V> {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            if !state.queue.is_empty() {
                warn!(queued = state.queue.len(), "task pool shut down with queued tasks");
            }
        }
        self.shared.work_ready.notify_all();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("task pool worker panicked");
            }
        }
    }
}

impl<V: TaskValue> PoolState<V> {
    /// Mark `token` of `graph` as met and propagate readiness to its
    /// dependents.
    ///
    /// Newly ready tasks are appended to `ready`. Satisfying a met token is a
    /// no-op.
    fn satisfy_token(
        &mut self,
        graph: Handle<GraphState<V>>,
        token: Token,
        value: V,
        ready: &mut Vec<u32>,
    ) -> Result<(), GraphError> {
        let state = self.graphs.get_mut(graph).ok_or(GraphError::GraphClosed)?;
        let slot = state
            .tokens
            .get_mut(token.index())
            .ok_or(GraphError::UnknownToken(token))?;
        if slot.value.is_some() {
            return Ok(());
        }
        slot.value = Some(value);
        for dependent in core::mem::take(&mut slot.dependents) {
            let task = &mut state.tasks[dependent as usize];
            debug_assert!(task.inputs_left > 0, "PoolState::satisfy_token: [1]");
            task.inputs_left -= 1;
            if task.inputs_left == 0 && task.state == TaskState::Waiting {
                task.state = TaskState::Ready;
                if state.blocked {
                    state.deferred.push(dependent);
                } else {
                    ready.push(dependent);
                }
            }
        }
        Ok(())
    }

    fn enqueue(&mut self, graph: Handle<GraphState<V>>, tasks: impl IntoIterator<Item = u32>) {
        self.queue
            .extend(tasks.into_iter().map(|task| QueuedTask { graph, task }));
    }
}

impl<V: TaskValue> PoolShared<V> {
    /// Wake enough workers for `count` newly queued tasks.
    ///
    /// Threads blocked in a graph wait are woken as well since they execute
    /// queued work too.
    fn notify_queued(&self, count: usize) {
        match count {
            0 => return,
            1 => self.work_ready.notify_one(),
            _ => self.work_ready.notify_all(),
        }
        self.task_done.notify_all();
    }
}
