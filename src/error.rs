use crate::executor::GraphError;
use thiserror::Error;

/// Status of a failed pipeline operation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PipelineError {
    /// The request is malformed or conflicts with pipeline state, e.g. a
    /// duplicate timestamp.
    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),
    /// A resource is temporarily exhausted. Retrying later succeeds once
    /// output has been consumed; no state was changed.
    #[error("resource temporarily unavailable, try again")]
    Again,
    /// No frame exists for the requested timestamp, or it is not decoded far
    /// enough yet.
    #[error("frame not found")]
    NotFound,
    /// Unrecoverable failure.
    #[error("pipeline error: {0}")]
    Error(String),
}

impl PipelineError {
    /// Whether the same call may succeed later without caller changes.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Again)
    }
}

/// Result of a pipeline operation.
pub type Result<T, E = PipelineError> = core::result::Result<T, E>;

/// Rejected [`PipelineConfig`](crate::config::PipelineConfig).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// At least one thread must execute tasks.
    #[error("num_threads must be at least 1")]
    NoThreads,
    /// At least one frame must be allowed in flight.
    #[error("max_latency must be at least 1")]
    NoLatency,
    /// Minimum latency must leave room for a frame to be delivered.
    #[error("min_latency ({min}) must be below max_latency ({max})")]
    LatencyRange {
        /// Configured minimum latency.
        min: usize,
        /// Configured maximum latency.
        max: usize,
    },
    /// Every plane needs at least one temporal buffer.
    #[error("num_temporal_buffers must be at least 1")]
    NoTemporalBuffers,
    /// The reorder window must hold at least one frame.
    #[error("default_max_reorder must be at least 1")]
    NoReorder,
}

impl From<ConfigError> for PipelineError {
    fn from(_: ConfigError) -> Self {
        Self::InvalidParam("pipeline configuration")
    }
}

impl From<GraphError> for PipelineError {
    fn from(error: GraphError) -> Self {
        Self::Error(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_again_is_retryable() {
        assert!(PipelineError::Again.is_retryable());
        assert!(!PipelineError::NotFound.is_retryable());
        assert!(!PipelineError::InvalidParam("x").is_retryable());
        assert!(!PipelineError::Error("x".into()).is_retryable());
    }
}
