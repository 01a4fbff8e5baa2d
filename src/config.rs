use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::{num::NonZeroUsize, thread};

/// What happens to frames that arrive without usable enhancement data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassthroughMode {
    /// Never decode a frame without enhancement. Bases without enhancement
    /// wait in the pending buffer and the caller is asked to retry once it
    /// is full.
    Disable,
    /// Copy the base picture to the output.
    Allow,
    /// Treat every frame as pass-through, ignoring enhancement data.
    Force,
    /// Like [`PassthroughMode::Allow`], but once the stream has a global
    /// configuration the base is upscaled to the enhanced resolution.
    #[default]
    Scale,
}

/// Tunables of a [`Pipeline`](crate::pipeline::Pipeline).
///
/// Every field has a default, so partial documents deserialize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Threads executing frame tasks, including the caller's thread while it
    /// waits.
    pub num_threads: usize,
    /// Maximum number of frames in the reorder window and in processing
    /// together.
    pub max_latency: usize,
    /// Number of processing frames kept back before output is returned.
    pub min_latency: usize,
    /// Frames held in the reorder window before the earliest is released.
    pub default_max_reorder: usize,
    /// Base pictures buffered while their enhancement data is missing.
    pub enhancement_delay: usize,
    /// Temporal buffers per plane.
    pub num_temporal_buffers: usize,
    /// Handling of frames without enhancement.
    pub passthrough_mode: PassthroughMode,
    /// Use the single-threaded kernels even when a parallel backend is
    /// registered.
    pub force_scalar: bool,
    /// Make every applied residual visible in the output.
    pub highlight_residuals: bool,
    /// Log each frame's task graph at `debug` level before it runs.
    pub show_tasks: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            num_threads: thread::available_parallelism().map_or(1, NonZeroUsize::get),
            max_latency: 32,
            min_latency: 0,
            default_max_reorder: 16,
            enhancement_delay: 0,
            num_temporal_buffers: 1,
            passthrough_mode: PassthroughMode::default(),
            force_scalar: false,
            highlight_residuals: false,
            show_tasks: false,
        }
    }
}

impl PipelineConfig {
    /// Check that the values can drive a pipeline.
    ///
    /// # Errors
    /// On the first field that is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_threads == 0 {
            return Err(ConfigError::NoThreads);
        }
        if self.max_latency == 0 {
            return Err(ConfigError::NoLatency);
        }
        if self.min_latency >= self.max_latency {
            return Err(ConfigError::LatencyRange {
                min: self.min_latency,
                max: self.max_latency,
            });
        }
        if self.num_temporal_buffers == 0 {
            return Err(ConfigError::NoTemporalBuffers);
        }
        if self.default_max_reorder == 0 {
            return Err(ConfigError::NoReorder);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.num_threads >= 1);
        assert_eq!(config.max_latency, 32);
        assert_eq!(config.passthrough_mode, PassthroughMode::Scale);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn validation_rejects_degenerate_values() {
        let base = PipelineConfig::default();
        let cases = [
            (PipelineConfig { num_threads: 0, ..base.clone() }, ConfigError::NoThreads),
            (PipelineConfig { max_latency: 0, ..base.clone() }, ConfigError::NoLatency),
            (
                PipelineConfig {
                    min_latency: 4,
                    max_latency: 4,
                    ..base.clone()
                },
                ConfigError::LatencyRange { min: 4, max: 4 },
            ),
            (
                PipelineConfig {
                    num_temporal_buffers: 0,
                    ..base.clone()
                },
                ConfigError::NoTemporalBuffers,
            ),
            (
                PipelineConfig {
                    default_max_reorder: 0,
                    ..base
                },
                ConfigError::NoReorder,
            ),
        ];
        for (config, expected) in cases {
            assert_eq!(config.validate(), Err(expected));
        }
    }

    #[test]
    fn partial_documents_take_defaults() {
        let config: PipelineConfig = serde_json::from_str(
            r#"{ "max_latency": 4, "passthrough_mode": "force", "show_tasks": true }"#,
        )
        .unwrap();
        assert_eq!(config.max_latency, 4);
        assert_eq!(config.passthrough_mode, PassthroughMode::Force);
        assert!(config.show_tasks);
        assert_eq!(config.default_max_reorder, 16);
        assert_eq!(config.validate(), Ok(()));
    }
}
