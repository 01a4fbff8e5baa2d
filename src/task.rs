use core::fmt;

/// Value carried by a dependency token.
///
/// Every token is satisfied with a value: external inputs (pictures, temporal
/// buffers) are attached when they arrive, and each task publishes the value
/// its body returns. Tasks without a meaningful result return
/// `Default::default()`.
pub trait TaskValue: Clone + Default + Send + 'static {}

impl<T: Clone + Default + Send + 'static> TaskValue for T {}

/// Body of a task: invoked at most once, after all of its inputs are met.
pub type TaskBody<V> = Box<dyn FnOnce(&TaskInputs<V>) -> V + Send + 'static>;

/// Opaque handle to a dependency token of one task graph.
///
/// Tokens are only meaningful for the graph that created them.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Token(pub(crate) u32);

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

impl Token {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Resolved inputs handed to a task body.
///
/// Holds a snapshot of the value of every token the task declared as input,
/// in declaration order.
#[derive(Debug)]
pub struct TaskInputs<V> {
    pub(crate) values: Vec<(Token, V)>,
}

impl<V> TaskInputs<V> {
    /// Read the value of a declared input token.
    ///
    /// Returns `None` when `token` was not one of the task's inputs.
    #[must_use]
    pub fn read(&self, token: Token) -> Option<&V> {
        self.values
            .iter()
            .find_map(|(input, value)| (*input == token).then_some(value))
    }

    /// Value of the input at `position` in declaration order.
    #[must_use]
    pub fn get(&self, position: usize) -> Option<&V> {
        self.values.get(position).map(|(_, value)| value)
    }

    /// Iterate over all `(token, value)` pairs in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (Token, &V)> {
        self.values.iter().map(|(token, value)| (*token, value))
    }

    /// Number of declared inputs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the task declared no inputs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Lifecycle of a single task inside its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum TaskState {
    /// Some inputs are still unmet.
    #[display("waiting")]
    Waiting,
    /// All inputs met; queued (or deferred while the graph is blocked).
    #[display("ready")]
    Ready,
    /// Body is executing on some thread.
    #[display("running")]
    Running,
    /// Body returned and the output token is met.
    #[display("done")]
    Done,
    /// Discarded before it ever started.
    #[display("cancelled")]
    Cancelled,
}
