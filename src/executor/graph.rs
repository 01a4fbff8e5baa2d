use crate::{
    arena::Handle,
    executor::{GraphState, PoolShared, TaskPool, TaskSlot, TokenSlot, execute},
    sync::Arc,
    task::{TaskBody, TaskInputs, TaskState, TaskValue, Token},
};
use core::fmt::Write as _;
use derive_more::{Debug, Deref};
use std::{borrow::Cow, time::Instant};
use thiserror::Error;

/// Error kind for task-graph misuse.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum GraphError {
    /// The token does not belong to this graph.
    #[error("token {0:?} does not belong to this graph")]
    UnknownToken(Token),
    /// The graph has already been dropped.
    #[error("task graph has been closed")]
    GraphClosed,
}

/// Non-owning reference to a task graph living in a [`TaskPool`].
///
/// Cheap to clone and safe to keep after the graph is dropped: operations on
/// a closed graph fail with [`GraphError::GraphClosed`], and waits return
/// immediately.
#[derive(Debug)]
pub struct GraphRef<V: TaskValue> {
    #[debug(skip)]
    shared: Arc<PoolShared<V>>,
    id: Handle<GraphState<V>>,
}

impl<V: TaskValue> Clone for GraphRef<V> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            id: self.id,
        }
    }
}

/// Dynamic directed acyclic graph of tasks connected by dependency tokens.
///
/// Tasks are added incrementally with [`GraphRef::add_task`]: each declares
/// the tokens it consumes and yields the token its body will satisfy. Tokens
/// created with [`GraphRef::token`] are satisfied from outside the graph with
/// [`GraphRef::satisfy`]. Since a task may only consume tokens that already
/// exist, the graph is acyclic by construction.
///
/// Dropping the graph discards tasks that have not started. Callers that need
/// every task to run must [`GraphRef::wait`] first.
#[must_use]
#[derive(Debug, Deref)]
pub struct TaskGraph<V: TaskValue> {
    graph: GraphRef<V>,
}

impl<V: TaskValue> TaskGraph<V> {
    /// Create an empty graph executed by `pool`.
    pub fn new(pool: &TaskPool<V>, name: impl Into<String>) -> Self {
        let shared = pool.shared().clone();
        let id = shared.state.lock().graphs.insert(GraphState {
            name: name.into(),
            tasks: Vec::new(),
            tokens: Vec::new(),
            remaining: 0,
            blocked: false,
            deferred: Vec::new(),
        });
        Self {
            graph: GraphRef { shared, id },
        }
    }

    /// Non-owning reference that stays valid (but inert) after drop.
    pub fn handle(&self) -> GraphRef<V> {
        self.graph.clone()
    }
}

impl<V: TaskValue> Drop for TaskGraph<V> {
    fn drop(&mut self) {
        let GraphRef { shared, id } = &self.graph;
        let removed = shared.state.lock().graphs.remove(*id);
        shared.task_done.notify_all();
        // Pending bodies are dropped here, outside the pool lock.
        drop(removed);
    }
}

impl<V: TaskValue> GraphRef<V> {
    /// Add an external dependency token, satisfied later via
    /// [`GraphRef::satisfy`].
    ///
    /// # Errors
    /// If the graph has been dropped.
    pub fn token(&self) -> Result<Token, GraphError> {
        let mut guard = self.shared.state.lock();
        let state = guard.graphs.get_mut(self.id).ok_or(GraphError::GraphClosed)?;
        Ok(state.new_token(None))
    }

    /// Add a token that is already satisfied with `value`.
    ///
    /// # Errors
    /// If the graph has been dropped.
    pub fn token_met(&self, value: V) -> Result<Token, GraphError> {
        let mut guard = self.shared.state.lock();
        let state = guard.graphs.get_mut(self.id).ok_or(GraphError::GraphClosed)?;
        Ok(state.new_token(Some(value)))
    }

    /// Add a task that runs `body` once every token in `inputs` is met.
    ///
    /// Returns the task's output token, satisfied with the value `body`
    /// returns. A task whose inputs are all met is queued immediately.
    ///
    /// # Errors
    /// If an input token is not from this graph, or the graph has been
    /// dropped.
    pub fn add_task(
        &self,
        inputs: &[Token],
        name: impl Into<Cow<'static, str>>,
        body: impl FnOnce(&TaskInputs<V>) -> V + Send + 'static,
    ) -> Result<Token, GraphError> {
        self.insert_task(inputs, name.into(), Some(Box::new(body)))
    }

    /// Add a task without a body that completes as soon as all `inputs` are
    /// met, joining several tokens into one.
    ///
    /// # Errors
    /// Same as [`GraphRef::add_task`].
    pub fn add_barrier(
        &self,
        inputs: &[Token],
        name: impl Into<Cow<'static, str>>,
    ) -> Result<Token, GraphError> {
        self.insert_task(inputs, name.into(), None)
    }

    fn insert_task(
        &self,
        inputs: &[Token],
        name: Cow<'static, str>,
        body: Option<TaskBody<V>>,
    ) -> Result<Token, GraphError> {
        let mut guard = self.shared.state.lock();
        let state = guard.graphs.get_mut(self.id).ok_or(GraphError::GraphClosed)?;
        if let Some(&unknown) = inputs
            .iter()
            .find(|token| token.index() >= state.tokens.len())
        {
            return Err(GraphError::UnknownToken(unknown));
        }
        let task_idx = u32::try_from(state.tasks.len()).map_err(|_| GraphError::GraphClosed)?;
        let output = state.new_token(None);
        let mut inputs_left = 0;
        for input in inputs {
            let slot = &mut state.tokens[input.index()];
            if slot.value.is_none() {
                slot.dependents.push(task_idx);
                inputs_left += 1;
            }
        }
        let ready = inputs_left == 0;
        state.tasks.push(TaskSlot {
            name,
            inputs: inputs.to_vec(),
            output,
            inputs_left,
            body,
            state: if ready {
                TaskState::Ready
            } else {
                TaskState::Waiting
            },
        });
        state.remaining += 1;
        if ready {
            if state.blocked {
                state.deferred.push(task_idx);
            } else {
                guard.enqueue(self.id, [task_idx]);
                drop(guard);
                self.shared.notify_queued(1);
            }
        }
        Ok(output)
    }

    /// Mark `token` as met with `value`, making dependents whose inputs are
    /// now all met ready.
    ///
    /// Satisfying an already met token is a no-op and keeps the first value.
    /// Ready tasks are only queued here, never run on the calling thread.
    ///
    /// # Errors
    /// If the token is not from this graph, or the graph has been dropped.
    pub fn satisfy(&self, token: Token, value: V) -> Result<(), GraphError> {
        let mut ready = Vec::new();
        let mut guard = self.shared.state.lock();
        guard.satisfy_token(self.id, token, value, &mut ready)?;
        let queued = ready.len();
        guard.enqueue(self.id, ready);
        drop(guard);
        self.shared.notify_queued(queued);
        Ok(())
    }

    /// Whether `token` is met. Unknown tokens and closed graphs report
    /// `false`.
    #[must_use]
    pub fn is_met(&self, token: Token) -> bool {
        self.with_state(|state| {
            state
                .tokens
                .get(token.index())
                .is_some_and(|slot| slot.value.is_some())
        })
        .unwrap_or(false)
    }

    /// Whether every token in `tokens` is met.
    #[must_use]
    pub fn all_met(&self, tokens: &[Token]) -> bool {
        self.with_state(|state| {
            tokens.iter().all(|token| {
                state
                    .tokens
                    .get(token.index())
                    .is_some_and(|slot| slot.value.is_some())
            })
        })
        .unwrap_or(false)
    }

    /// Value a met token was satisfied with.
    #[must_use]
    pub fn value(&self, token: Token) -> Option<V> {
        self.with_state(|state| {
            state
                .tokens
                .get(token.index())
                .and_then(|slot| slot.value.clone())
        })
        .flatten()
    }

    /// Output tokens of every task that consumes `input`.
    ///
    /// Used to build a task that must run only after all readers of a
    /// resource are finished.
    #[must_use]
    pub fn outputs_consuming(&self, input: Token) -> Vec<Token> {
        self.with_state(|state| {
            state
                .tasks
                .iter()
                .filter(|task| task.inputs.contains(&input))
                .map(|task| task.output)
                .collect()
        })
        .unwrap_or_default()
    }

    /// Stop queueing newly ready tasks until [`GraphRef::unblock`].
    pub fn block(&self) {
        let mut guard = self.shared.state.lock();
        if let Some(state) = guard.graphs.get_mut(self.id) {
            state.blocked = true;
        }
    }

    /// Queue every task that became ready while the graph was blocked.
    pub fn unblock(&self) {
        let mut guard = self.shared.state.lock();
        let Some(state) = guard.graphs.get_mut(self.id) else {
            return;
        };
        state.blocked = false;
        let deferred = core::mem::take(&mut state.deferred);
        let queued = deferred.len();
        guard.enqueue(self.id, deferred);
        drop(guard);
        self.shared.notify_queued(queued);
    }

    /// Number of tasks that have neither finished nor been cancelled.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.with_state(|state| state.remaining).unwrap_or(0)
    }

    /// Whether every task has finished (or the graph is closed).
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }

    /// Block until every task has run, executing ready tasks on the calling
    /// thread while waiting.
    ///
    /// Never returns if a task depends on a token nobody satisfies.
    pub fn wait(&self) {
        execute::wait_graph(&self.shared, self.id, None);
    }

    /// Like [`GraphRef::wait`] but gives up at `deadline`.
    ///
    /// Returns `true` if the graph completed.
    #[must_use]
    pub fn wait_deadline(&self, deadline: Instant) -> bool {
        execute::wait_graph(&self.shared, self.id, Some(deadline))
    }

    /// Discard every task that has not started yet.
    ///
    /// Running tasks are unaffected. Returns the number of cancelled tasks.
    pub fn cancel(&self) -> usize {
        let mut discarded = Vec::new();
        {
            let mut guard = self.shared.state.lock();
            let Some(state) = guard.graphs.get_mut(self.id) else {
                return 0;
            };
            for task in &mut state.tasks {
                if matches!(task.state, TaskState::Waiting | TaskState::Ready) {
                    task.state = TaskState::Cancelled;
                    discarded.extend(task.body.take());
                    state.remaining -= 1;
                }
            }
            state.deferred.clear();
        }
        self.shared.task_done.notify_all();
        let cancelled = discarded.len();
        drop(discarded);
        cancelled
    }

    /// Human-readable listing of every task with its state and tokens.
    #[must_use]
    pub fn describe(&self) -> String {
        self.with_state(|state| {
            let mut out = format!(
                "graph {} ({} tasks, {} remaining)\n",
                state.name,
                state.tasks.len(),
                state.remaining
            );
            for (idx, task) in state.tasks.iter().enumerate() {
                let _ = write!(out, "  #{idx:<3} {:<28} {:<9} in:[", task.name, task.state);
                for (n, input) in task.inputs.iter().enumerate() {
                    let met = if state.tokens[input.index()].value.is_some() {
                        "+"
                    } else {
                        "-"
                    };
                    let sep = if n == 0 { "" } else { " " };
                    let _ = write!(out, "{sep}{input:?}{met}");
                }
                let _ = writeln!(out, "] out:{:?}", task.output);
            }
            out
        })
        .unwrap_or_else(|| String::from("graph <closed>\n"))
    }

    fn with_state<R>(&self, f: impl FnOnce(&GraphState<V>) -> R) -> Option<R> {
        let guard = self.shared.state.lock();
        guard.graphs.get(self.id).map(f)
    }
}

impl<V: TaskValue> GraphState<V> {
    fn new_token(&mut self, value: Option<V>) -> Token {
        let token = Token(u32::try_from(self.tokens.len()).unwrap_or(u32::MAX));
        self.tokens.push(TokenSlot {
            value,
            dependents: Vec::new(),
        });
        token
    }
}
