//! Scheduling core of a multi-layer video enhancement decoder.
//!
//! A base picture, decoded elsewhere, is upscaled through up to three levels
//! of quality (LOQs) and refined with residuals carried in per-frame
//! enhancement data. This crate schedules that work. It:
//! - Admits enhancement data, base pictures and output buffers
//!   asynchronously, and hands finished output back in timestamp order.
//! - Holds frames in a bounded reorder window before releasing them into
//!   processing, strictly in timestamp order.
//! - Builds one dynamic task graph per frame, whose tasks run on a shared
//!   worker pool as soon as their dependency tokens are met.
//! - Hands temporal prediction buffers from one frame to the next so
//!   consecutive frames overlap without losing prediction state.
//!
//! Key modules:
//! - `pipeline`: the [`Pipeline`] facade and its [`PipelineBuilder`].
//! - `executor`: [`TaskPool`](executor::TaskPool) and
//!   [`TaskGraph`](executor::TaskGraph), the generic dependency-token
//!   scheduler.
//! - `backend`: the [`PixelBackend`] kernel interface, the CPU
//!   implementations and the [`BackendRegistry`].
//! - `enhancement`: the compact enhancement packet format and its parser.
//! - `picture`: shared pictures with independently locked planes.
//!
//! Quick start:
//! 1. Create a [`Pipeline`] from a [`PipelineConfig`], optionally with an
//!    [`EventSink`].
//! 2. Feed it with [`Pipeline::send_enhancement_data`],
//!    [`Pipeline::send_base_picture`] and [`Pipeline::send_output_picture`].
//! 3. Collect results with [`Pipeline::receive_output_picture`] and
//!    [`Pipeline::receive_finished_base_picture`]. Calls that would exceed a
//!    bound return [`PipelineError::Again`] instead of blocking.
//!
//! The library logs through `tracing` and never installs a subscriber.

mod arena;
/// Pixel kernels invoked by frame tasks.
///
/// Defines the [`PixelBackend`] trait, the reference [`CpuBackend`] in
/// scalar and row-parallel flavours, and the [`BackendRegistry`] the
/// pipeline picks its backend from.
pub mod backend;
/// Pipeline configuration.
pub mod config;
/// Enhancement data: stream and frame configuration, residual command
/// buffers and the packet parser.
pub mod enhancement;
/// Error types returned by pipeline operations.
pub mod error;
/// Notifications emitted while the pipeline runs.
pub mod events;
/// The dependency-token task scheduler.
///
/// Contains the worker pool, the per-graph bookkeeping and the execution
/// loop shared by workers and waiting callers.
pub mod executor;
mod frame;
/// Pictures, plane buffers and the plane views handed to kernels.
pub mod picture;
/// The pipeline facade.
pub mod pipeline;
mod reorder;
mod sync;
/// Task values, dependency tokens and the inputs handed to task bodies.
pub mod task;
mod temporal;
/// Timestamps, levels of quality and common aliases.
pub mod types;

pub use crate::{
    backend::{BackendRegistry, BackendTag, CpuBackend, PixelBackend},
    config::{PassthroughMode, PipelineConfig},
    error::{PipelineError, Result},
    events::{Event, EventSink, NullSink},
    frame::DecodeInformation,
    picture::{ColorFormat, Picture, PictureDesc},
    pipeline::{Pipeline, PipelineBuilder},
    types::Timestamp,
};
