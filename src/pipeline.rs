//! The pipeline facade: admission, release, output delivery and teardown.
//!
//! Frames pass through three stages:
//!
//! 1. **Reorder**: created by [`Pipeline::send_enhancement_data`] (or by a
//!    base picture forced through as pass-through) and held in timestamp
//!    order.
//! 2. **Processing**: released from the reorder window; the frame's task
//!    graph is generated and runs on the task pool as its inputs arrive.
//! 3. **Done**: the output-done task has run. [`Pipeline::receive_output_picture`]
//!    hands the output to the caller and retires the frame.
//!
//! Every call is non-blocking except [`Pipeline::receive_output_picture`] and
//! [`Pipeline::synchronize`], which wait at most until the deadline of the
//! frame they wait for. While waiting, the calling thread executes queued
//! tasks.

mod shared;

pub(crate) use crate::pipeline::shared::{Interlocked, Shared};
use crate::{
    backend::{BackendRegistry, BackendTag},
    config::{PassthroughMode, PipelineConfig},
    enhancement::ConfigPool,
    error::{PipelineError, Result},
    events::{Event, EventSink, NullSink},
    executor::{TaskGraph, TaskPool},
    frame::{self, DecodeInformation, Frame, FrameId, FramePlan, FrameState, GraphKind, Resource},
    picture::Picture,
    reorder::ReorderWindow,
    types::{MAX_PLANES, Timestamp, compare_timestamps},
};
use bytes::Bytes;
use core::cmp::Ordering;
use parking_lot::{Condvar, Mutex};
use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, error, trace, warn};

/// Base picture waiting for enhancement data with the same timestamp.
#[derive(Debug)]
struct PendingBase {
    timestamp: Timestamp,
    picture: Picture,
    deadline: Instant,
    user_data: u64,
}

/// Decoder core combining enhancement data with base pictures into output
/// pictures.
///
/// ```
/// use ehp::{ColorFormat, Pipeline, PipelineConfig, Picture, PictureDesc};
///
/// let mut pipeline = Pipeline::new(PipelineConfig {
///     num_threads: 2,
///     ..PipelineConfig::default()
/// })
/// .unwrap();
/// let desc = PictureDesc::new(ColorFormat::Gray8, 8, 4);
///
/// // No enhancement data: the base is copied to the output.
/// pipeline
///     .send_base_picture(1, Picture::new(desc), std::time::Duration::from_secs(1), 0)
///     .unwrap();
/// pipeline.send_output_picture(Picture::new(desc)).unwrap();
/// pipeline.flush(1);
///
/// let (_picture, info) = pipeline.receive_output_picture().unwrap();
/// assert_eq!(info.timestamp, 1);
/// assert!(!info.has_enhancement);
/// ```
#[derive(Debug)]
pub struct Pipeline {
    config: PipelineConfig,
    backend_tag: BackendTag,
    shared: Arc<Shared>,
    reorder: ReorderWindow<FrameId>,
    pending_bases: VecDeque<PendingBase>,
    available_outputs: VecDeque<Picture>,
    configs: ConfigPool,
    /// Timestamp of the most recently released frame.
    previous_timestamp: Option<Timestamp>,
    /// Per plane, the most recently released frame that keeps temporal
    /// state.
    temporal_timestamps: [Option<Timestamp>; MAX_PLANES],
    /// Timestamp of the most recently delivered output picture.
    last_delivered: Option<Timestamp>,
    // Dropped last so workers outlive every graph.
    pool: TaskPool<Resource>,
}

impl Pipeline {
    /// Pipeline with the default backends and no event sink.
    ///
    /// # Errors
    /// [`PipelineError::InvalidParam`] for an invalid configuration,
    /// [`PipelineError::Error`] if worker threads cannot be started.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        PipelineBuilder::new().config(config).build()
    }

    /// Start configuring a pipeline.
    #[must_use]
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    /// Configuration the pipeline runs with.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Tag of the backend executing pixel kernels.
    #[must_use]
    pub fn backend_tag(&self) -> &BackendTag {
        &self.backend_tag
    }

    /// Frames in the reorder window and in processing.
    #[must_use]
    pub fn latency(&self) -> usize {
        self.reorder.len() + self.shared.state.lock().processing.len()
    }

    /// Frames still waiting in the reorder window.
    #[must_use]
    pub fn reorder_len(&self) -> usize {
        self.reorder.len()
    }

    /// Submit the enhancement data of the frame at `timestamp`.
    ///
    /// Parsing happens when the frame leaves the reorder window. Malformed
    /// data turns the frame into a pass-through frame.
    ///
    /// # Errors
    /// [`PipelineError::InvalidParam`] if a frame with this timestamp is
    /// outstanding, [`PipelineError::Again`] if `max_latency` frames are
    /// outstanding.
    pub fn send_enhancement_data(
        &mut self,
        timestamp: Timestamp,
        data: impl Into<Bytes>,
    ) -> Result<()> {
        let data = data.into();
        debug!(timestamp, len = data.len(), "send_enhancement_data");
        if self.shared.find(timestamp).is_some() {
            return Err(PipelineError::InvalidParam("duplicate timestamp"));
        }
        if self.latency() >= self.config.max_latency {
            trace!(timestamp, "latency window full");
            return Err(PipelineError::Again);
        }
        let id = self.create_frame(timestamp, |frame| frame.enhancement = Some(data))?;
        self.reorder.insert(timestamp, id, false);

        let pending = self
            .pending_bases
            .iter()
            .position(|pending| pending.timestamp == timestamp)
            .and_then(|position| self.pending_bases.remove(position));
        if let Some(pending) = pending {
            self.shared
                .attach_base(id, pending.picture, pending.deadline, pending.user_data)?;
            self.reorder.mark_ready_up_to(timestamp);
            self.shared.emit(Event::CanSendBase);
        }
        self.start_ready_frames();
        Ok(())
    }

    /// Submit the base picture of the frame at `timestamp`.
    ///
    /// `timeout` bounds how long [`Pipeline::receive_output_picture`] and
    /// [`Pipeline::synchronize`] wait for this frame. `user_data` is returned
    /// in the frame's [`DecodeInformation`].
    ///
    /// Without enhancement data for `timestamp` the picture waits for up to
    /// `enhancement_delay` further bases; after that the oldest waiting base
    /// is decoded as pass-through.
    ///
    /// # Errors
    /// [`PipelineError::InvalidParam`] if the frame already has a base
    /// picture, [`PipelineError::Again`] if pass-through is disabled or the
    /// latency window is full.
    pub fn send_base_picture(
        &mut self,
        timestamp: Timestamp,
        picture: Picture,
        timeout: Duration,
        user_data: u64,
    ) -> Result<()> {
        debug!(timestamp, picture = picture.id(), user_data, "send_base_picture");
        let deadline = Instant::now() + timeout;
        if let Some(id) = self.shared.find(timestamp) {
            self.shared.attach_base(id, picture, deadline, user_data)?;
            self.shared.emit(Event::CanSendBase);
            self.start_processing(timestamp);
            return Ok(());
        }
        if self
            .pending_bases
            .iter()
            .any(|pending| pending.timestamp == timestamp)
        {
            return Err(PipelineError::InvalidParam("duplicate base picture"));
        }
        let incoming = PendingBase {
            timestamp,
            picture,
            deadline,
            user_data,
        };
        if self.pending_bases.len() < self.config.enhancement_delay {
            trace!(timestamp, pending = self.pending_bases.len() + 1, "base picture pending");
            self.pending_bases.push_back(incoming);
            return Ok(());
        }
        if self.config.passthrough_mode == PassthroughMode::Disable {
            trace!(timestamp, "pending bases full and pass-through disabled");
            return Err(PipelineError::Again);
        }
        if self.latency() >= self.config.max_latency {
            trace!(timestamp, "latency window full");
            return Err(PipelineError::Again);
        }

        let base = match self.pending_bases.pop_front() {
            Some(oldest) => {
                self.pending_bases.push_back(incoming);
                oldest
            }
            None => incoming,
        };
        debug!(timestamp = base.timestamp, "base picture without enhancement, passing through");
        let id = self.create_frame(base.timestamp, |frame| frame.passthrough = true)?;
        self.shared
            .attach_base(id, base.picture, base.deadline, base.user_data)?;
        self.reorder.insert(base.timestamp, id, true);
        self.shared.emit(Event::CanSendBase);
        self.start_ready_frames();
        Ok(())
    }

    /// Offer a picture to write output into.
    ///
    /// Pictures are attached to processing frames in timestamp order and
    /// resized to the frame's output layout.
    ///
    /// # Errors
    /// [`PipelineError::Again`] if `max_latency` pictures are already
    /// waiting.
    pub fn send_output_picture(&mut self, picture: Picture) -> Result<()> {
        trace!(picture = picture.id(), "send_output_picture");
        if self.available_outputs.len() >= self.config.max_latency {
            return Err(PipelineError::Again);
        }
        self.available_outputs.push_back(picture);
        self.connect_output_pictures();
        self.start_ready_frames();
        Ok(())
    }

    /// Take the next finished output picture.
    ///
    /// Pictures come out in timestamp order. If the earliest frame is not
    /// done but has every input it needs, waits for it until its base
    /// picture's deadline, helping to execute tasks meanwhile. Returns `None`
    /// if the earliest frame is still missing input, if fewer than
    /// `min_latency` frames would remain, or on timeout.
    pub fn receive_output_picture(&mut self) -> Option<(Picture, DecodeInformation)> {
        loop {
            let id = self.wait_front()?;
            let Some(frame) = self.retire(id) else {
                continue;
            };
            if frame.late {
                debug!(timestamp = frame.timestamp, "discarding late frame");
                continue;
            }
            let (Some(picture), Some(info)) = (frame.output.clone(), frame.decode_info) else {
                warn!(timestamp = frame.timestamp, "finished frame has no output");
                continue;
            };
            trace!(timestamp = frame.timestamp, picture = picture.id(), "receive_output_picture");
            self.last_delivered = Some(frame.timestamp);
            self.shared.emit(Event::CanSendEnhancement);
            return Some((picture, info));
        }
    }

    /// Take a base picture that no task reads any more.
    pub fn receive_finished_base_picture(&self) -> Option<Picture> {
        self.shared.finished_bases.lock().pop_front()
    }

    /// Release every frame up to and including `timestamp` from the reorder
    /// window.
    pub fn flush(&mut self, timestamp: Timestamp) {
        debug!(timestamp, "flush");
        self.start_processing(timestamp);
    }

    /// Skip every frame up to and including `timestamp` and release them.
    ///
    /// Skipped frames still complete and return their base picture, but the
    /// content of their output picture is unspecified.
    pub fn skip(&mut self, timestamp: Timestamp) {
        debug!(timestamp, "skip");
        {
            let state = self.shared.state.lock();
            for (_, frame) in state.frames.iter() {
                if compare_timestamps(frame.timestamp, timestamp) != Ordering::Greater {
                    frame.set_skip();
                }
            }
        }
        self.start_processing(timestamp);
    }

    /// Wait for every processing frame that can complete on its own.
    ///
    /// With `drop_pending` every outstanding frame is skipped first.
    pub fn synchronize(&mut self, drop_pending: bool) {
        debug!(drop_pending, "synchronize");
        if drop_pending {
            let state = self.shared.state.lock();
            for (_, frame) in state.frames.iter() {
                frame.set_skip();
            }
        }
        self.start_ready_frames();

        let mut index = 0;
        loop {
            let next = {
                let state = self.shared.state.lock();
                let Some(&id) = state.processing.get(index) else {
                    break;
                };
                state.frames.get(id).map(|frame| {
                    (
                        frame.timestamp,
                        frame.can_complete().then(|| frame.handle()),
                        frame.deadline(),
                    )
                })
            };
            index += 1;
            let Some((timestamp, Some(graph), deadline)) = next else {
                continue;
            };
            let deadline = deadline.unwrap_or_else(Instant::now);
            if !graph.wait_deadline(deadline) {
                warn!(timestamp, "synchronize timed out waiting for frame");
            }
        }
    }

    /// Output dimensions of the frame at `timestamp`, releasing it and every
    /// earlier frame from the reorder window.
    ///
    /// # Errors
    /// [`PipelineError::NotFound`] if no such frame is outstanding, or if it
    /// has no configuration while pass-through is disabled.
    /// [`PipelineError::Again`] if the frame has no configuration yet.
    pub fn peek(&mut self, timestamp: Timestamp) -> Result<(u32, u32)> {
        self.start_processing(timestamp);
        let state = self.shared.state.lock();
        let id = state
            .by_timestamp
            .get(&timestamp)
            .copied()
            .ok_or(PipelineError::NotFound)?;
        let frame = state.frames.get(id).ok_or(PipelineError::NotFound)?;
        match (&frame.global, self.config.passthrough_mode) {
            (Some(global), _) => Ok((global.width, global.height)),
            (None, PassthroughMode::Disable) => Err(PipelineError::NotFound),
            (None, _) => Err(PipelineError::Again),
        }
    }

    fn create_frame(
        &self,
        timestamp: Timestamp,
        setup: impl FnOnce(&mut Frame),
    ) -> Result<FrameId> {
        let graph = TaskGraph::new(&self.pool, format!("frame {timestamp}"));
        let base_token = graph.token()?;
        let output_token = graph.token()?;
        let mut frame = Frame::new(timestamp, graph, base_token, output_token);
        setup(&mut frame);
        let mut state = self.shared.state.lock();
        let id = state.frames.insert(frame);
        state.by_timestamp.insert(timestamp, id);
        Ok(id)
    }

    fn start_processing(&mut self, timestamp: Timestamp) {
        self.reorder.mark_ready_up_to(timestamp);
        self.start_ready_frames();
    }

    fn start_ready_frames(&mut self) {
        while let Some((timestamp, id)) = self.reorder.pop_ready() {
            self.start_frame(timestamp, id);
            self.shared.emit(Event::CanSendEnhancement);
        }
        self.connect_output_pictures();
    }

    /// Parse the frame's enhancement data, decide how it is decoded and
    /// generate its task graph.
    fn start_frame(&mut self, timestamp: Timestamp, id: FrameId) {
        let (mut passthrough, enhancement) = {
            let state = self.shared.state.lock();
            let Some(frame) = state.frames.get(id) else {
                return;
            };
            (frame.passthrough, frame.enhancement.clone())
        };
        if self.config.passthrough_mode == PassthroughMode::Force {
            passthrough = true;
        }
        let out_of_order = self
            .previous_timestamp
            .is_some_and(|previous| compare_timestamps(previous, timestamp) == Ordering::Greater);
        let late = out_of_order
            && self
                .last_delivered
                .is_some_and(|delivered| compare_timestamps(timestamp, delivered) != Ordering::Greater);
        if out_of_order {
            debug!(timestamp, previous = ?self.previous_timestamp, late, "frame released out of order");
            passthrough = true;
        }

        let (global, config) = match enhancement {
            Some(data) if !passthrough => match self.configs.insert(timestamp, &data) {
                Ok((global, config)) => (Some(global), config),
                Err(error) => {
                    warn!(timestamp, %error, "invalid enhancement data, passing through");
                    passthrough = true;
                    self.configs.passthrough()
                }
            },
            _ => {
                passthrough = true;
                self.configs.passthrough()
            }
        };
        let kind = match (&global, self.config.passthrough_mode) {
            (Some(_), PassthroughMode::Scale) => GraphKind::Enhancement,
            (Some(_), _) if !passthrough => GraphKind::Enhancement,
            _ => GraphKind::Copy,
        };

        let plan = {
            let mut guard = self.shared.state.lock();
            let Interlocked {
                frames, processing, ..
            } = &mut *guard;
            let Some(frame) = frames.get_mut(id) else {
                return;
            };
            frame.state = FrameState::Processing;
            frame.passthrough = passthrough;
            frame.late = late;
            frame.kind = kind;
            frame.global.clone_from(&global);
            frame.config = Arc::new(config);
            if late {
                frame.set_skip();
            }
            let plan = FramePlan {
                id,
                timestamp,
                graph: frame.handle(),
                base_token: frame.base_token,
                output_token: frame.output_token,
                skip: frame.skip.clone(),
                kind,
                passthrough,
                global,
                config: frame.config.clone(),
                previous: self.temporal_timestamps,
            };
            let position = processing
                .iter()
                .position(|&other| {
                    frames.get(other).is_some_and(|other| {
                        compare_timestamps(other.timestamp, timestamp) == Ordering::Greater
                    })
                })
                .unwrap_or(processing.len());
            processing.insert(position, id);
            plan
        };
        debug!(timestamp, passthrough, late, ?kind, "frame released");

        if let Err(error) = frame::generate(&self.shared, &plan, self.config.show_tasks) {
            error!(timestamp, %error, "task generation failed");
        }
        if late {
            if let Err(error) = plan.graph.satisfy(plan.output_token, Resource::Empty) {
                error!(timestamp, %error, "cannot release late frame");
            }
        }
        self.previous_timestamp = Some(timestamp);
        for (plane, previous) in self.temporal_timestamps.iter_mut().enumerate() {
            if plan.uses_temporal(plane) {
                *previous = Some(timestamp);
            }
        }
    }

    /// Attach waiting output pictures to processing frames in timestamp
    /// order, stopping at the first frame that has no base picture yet.
    fn connect_output_pictures(&mut self) {
        while !self.available_outputs.is_empty() {
            let target = {
                let state = self.shared.state.lock();
                let next = state.processing.iter().find_map(|&id| {
                    let frame = state.frames.get(id)?;
                    (frame.output.is_none() && !frame.late).then_some((id, frame))
                });
                let Some((id, frame)) = next else {
                    break;
                };
                if !frame.has_base() {
                    break;
                }
                let Some(desc) = frame.output_desc() else {
                    break;
                };
                (id, frame.timestamp, desc)
            };
            let (id, timestamp, desc) = target;
            let Some(picture) = self.available_outputs.pop_front() else {
                break;
            };
            picture.set_desc(desc);
            let attached = {
                let mut state = self.shared.state.lock();
                state.frames.get_mut(id).map(|frame| {
                    frame.output = Some(picture.clone());
                    (frame.handle(), frame.output_token)
                })
            };
            let Some((graph, token)) = attached else {
                self.available_outputs.push_front(picture);
                break;
            };
            trace!(timestamp, picture = picture.id(), "output picture attached");
            if let Err(error) = graph.satisfy(token, Resource::Picture(picture)) {
                error!(timestamp, %error, "cannot attach output picture");
            }
            self.shared.emit(Event::CanSendPicture);
        }
    }

    /// Wait until the earliest processing frame is done and take it off the
    /// processing index.
    fn wait_front(&self) -> Option<FrameId> {
        let mut state = self.shared.state.lock();
        loop {
            let &front = state.processing.first()?;
            let Some(frame) = state.frames.get(front) else {
                state.processing.remove(0);
                continue;
            };
            if frame.state == FrameState::Done {
                state.processing.remove(0);
                return Some(front);
            }
            if state.processing.len() <= self.config.min_latency || !frame.can_complete() {
                return None;
            }
            let timestamp = frame.timestamp;
            let deadline = frame.deadline().unwrap_or_else(Instant::now);

            if self.pool.queued() > 0 {
                drop(state);
                self.pool.run_one();
                state = self.shared.state.lock();
                continue;
            }
            trace!(timestamp, "waiting for frame");
            let timed_out = self
                .shared
                .frame_done
                .wait_until(&mut state, deadline)
                .timed_out();
            let done = state
                .frames
                .get(front)
                .is_some_and(|frame| frame.state == FrameState::Done);
            if timed_out && !done {
                warn!(timestamp, "timed out waiting for frame");
                return None;
            }
        }
    }

    /// Let the frame's remaining tasks finish and remove it.
    fn retire(&self, id: FrameId) -> Option<Frame> {
        let graph = self.shared.state.lock().frames.get(id)?.handle();
        graph.wait();
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        let frame = state.frames.remove(id)?;
        if state.by_timestamp.get(&frame.timestamp) == Some(&id) {
            state.by_timestamp.remove(&frame.timestamp);
        }
        state.temporal.forget(id);
        Some(frame)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        debug!(latency = self.latency(), "pipeline shutting down");
        let mut index = 0;
        loop {
            let next = {
                let state = self.shared.state.lock();
                let Some(&id) = state.processing.get(index) else {
                    break;
                };
                state
                    .frames
                    .get(id)
                    .map(|frame| (frame.timestamp, frame.handle(), frame.can_complete()))
            };
            index += 1;
            let Some((timestamp, graph, can_complete)) = next else {
                continue;
            };
            if !can_complete {
                let cancelled = graph.cancel();
                debug!(timestamp, cancelled, "cancelled frame tasks");
            }
            graph.wait();
        }

        self.reorder.drain();
        let frames = {
            let mut guard = self.shared.state.lock();
            let Interlocked {
                frames,
                by_timestamp,
                processing,
                temporal,
            } = &mut *guard;
            for (id, _) in frames.iter() {
                temporal.forget(id);
            }
            debug_assert_eq!(temporal.in_use(), 0);
            processing.clear();
            by_timestamp.clear();
            frames.drain()
        };
        drop(frames);
        self.shared.emit(Event::Exit);
    }
}

/// Configures and creates a [`Pipeline`].
#[derive(Debug)]
#[must_use]
pub struct PipelineBuilder {
    config: PipelineConfig,
    events: Arc<dyn EventSink>,
    registry: BackendRegistry,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineBuilder {
    /// Builder with the default configuration, the CPU backends and no event
    /// sink.
    pub fn new() -> Self {
        Self {
            config: PipelineConfig::default(),
            events: Arc::new(NullSink),
            registry: BackendRegistry::with_cpu(),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Threads executing frame tasks.
    pub fn num_threads(mut self, num_threads: usize) -> Self {
        self.config.num_threads = num_threads;
        self
    }

    /// Maximum outstanding frames.
    pub fn max_latency(mut self, max_latency: usize) -> Self {
        self.config.max_latency = max_latency;
        self
    }

    /// Frames kept back before output is returned.
    pub fn min_latency(mut self, min_latency: usize) -> Self {
        self.config.min_latency = min_latency;
        self
    }

    /// Depth of the reorder window.
    pub fn max_reorder(mut self, max_reorder: usize) -> Self {
        self.config.default_max_reorder = max_reorder;
        self
    }

    /// Base pictures buffered while waiting for enhancement data.
    pub fn enhancement_delay(mut self, enhancement_delay: usize) -> Self {
        self.config.enhancement_delay = enhancement_delay;
        self
    }

    /// Temporal buffers per plane.
    pub fn num_temporal_buffers(mut self, num_temporal_buffers: usize) -> Self {
        self.config.num_temporal_buffers = num_temporal_buffers;
        self
    }

    /// Handling of frames without enhancement.
    pub fn passthrough_mode(mut self, passthrough_mode: PassthroughMode) -> Self {
        self.config.passthrough_mode = passthrough_mode;
        self
    }

    /// Prefer the single-threaded kernels.
    pub fn force_scalar(mut self, force_scalar: bool) -> Self {
        self.config.force_scalar = force_scalar;
        self
    }

    /// Make applied residuals visible.
    pub fn highlight_residuals(mut self, highlight_residuals: bool) -> Self {
        self.config.highlight_residuals = highlight_residuals;
        self
    }

    /// Log every frame's task graph.
    pub fn show_tasks(mut self, show_tasks: bool) -> Self {
        self.config.show_tasks = show_tasks;
        self
    }

    /// Receiver of pipeline events.
    pub fn event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Backends to choose from.
    pub fn backend_registry(mut self, registry: BackendRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Validate the configuration and start the worker threads.
    ///
    /// Emits [`Event::CanSendEnhancement`], [`Event::CanSendBase`] and
    /// [`Event::CanSendPicture`] once ready.
    ///
    /// # Errors
    /// [`PipelineError::InvalidParam`] for an invalid configuration,
    /// [`PipelineError::Error`] if no backend is registered or worker threads
    /// cannot be started.
    pub fn build(self) -> Result<Pipeline> {
        let Self {
            config,
            events,
            registry,
        } = self;
        if let Err(error) = config.validate() {
            warn!(%error, "invalid pipeline configuration");
            return Err(error.into());
        }
        let (backend_tag, backend) = registry
            .select(config.force_scalar)
            .ok_or_else(|| PipelineError::Error("no pixel backend registered".into()))?;
        let pool = TaskPool::new(config.num_threads)
            .map_err(|error| PipelineError::Error(format!("cannot start task pool: {error}")))?;
        let shared = Arc::new(Shared {
            state: Mutex::new(Interlocked::new(
                config.max_latency,
                config.num_temporal_buffers,
            )),
            frame_done: Condvar::new(),
            finished_bases: Mutex::new(VecDeque::new()),
            backend,
            events,
            highlight_residuals: config.highlight_residuals,
        });
        debug!(
            backend = %backend_tag,
            threads = config.num_threads,
            max_latency = config.max_latency,
            max_reorder = config.default_max_reorder,
            "pipeline created"
        );
        for event in [
            Event::CanSendEnhancement,
            Event::CanSendBase,
            Event::CanSendPicture,
        ] {
            shared.emit(event);
        }
        Ok(Pipeline {
            reorder: ReorderWindow::new(config.default_max_reorder),
            config,
            backend_tag,
            shared,
            pending_bases: VecDeque::new(),
            available_outputs: VecDeque::new(),
            configs: ConfigPool::new(),
            previous_timestamp: None,
            temporal_timestamps: [None; MAX_PLANES],
            last_delivered: None,
            pool,
        })
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::{
        enhancement::{GlobalConfig, PacketBuilder},
        picture::{ColorFormat, PictureDesc},
    };

    fn gray(width: u32, height: u32) -> Picture {
        Picture::new(PictureDesc::new(ColorFormat::Gray8, width, height))
    }

    fn pipeline(config: PipelineConfig) -> Pipeline {
        Pipeline::new(config).unwrap()
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        let error = Pipeline::builder().num_threads(0).build().unwrap_err();
        assert_eq!(error, PipelineError::InvalidParam("pipeline configuration"));
    }

    #[test]
    fn empty_registry_is_an_error() {
        let error = Pipeline::builder()
            .backend_registry(BackendRegistry::new())
            .build()
            .unwrap_err();
        assert!(matches!(error, PipelineError::Error(_)));
    }

    #[test]
    fn force_scalar_selects_scalar_backend() {
        let pipeline = pipeline(PipelineConfig {
            num_threads: 1,
            force_scalar: true,
            ..PipelineConfig::default()
        });
        assert_eq!(pipeline.backend_tag(), &BackendTag::Scalar);
    }

    #[test]
    fn pending_base_attaches_to_later_enhancement() {
        let mut pipeline = pipeline(PipelineConfig {
            num_threads: 1,
            enhancement_delay: 2,
            ..PipelineConfig::default()
        });
        let global = GlobalConfig::new(4, 2, ColorFormat::Gray8);
        let base = gray(4, 2);
        pipeline
            .send_base_picture(7, base.clone(), Duration::from_secs(5), 99)
            .unwrap();
        assert_eq!(pipeline.latency(), 0);
        assert_eq!(pipeline.pending_bases.len(), 1);

        pipeline
            .send_enhancement_data(7, PacketBuilder::new().global(global).build())
            .unwrap();
        assert!(pipeline.pending_bases.is_empty());
        pipeline.send_output_picture(gray(1, 1)).unwrap();

        let (picture, info) = pipeline.receive_output_picture().unwrap();
        assert_eq!(info.timestamp, 7);
        assert_eq!(info.user_data, 99);
        assert!(info.has_base && info.has_enhancement);
        assert_eq!((picture.desc().width, picture.desc().height), (4, 2));
        assert_eq!(pipeline.receive_finished_base_picture(), Some(base));
    }

    #[test]
    fn oldest_pending_base_is_forced_through() {
        let mut pipeline = pipeline(PipelineConfig {
            num_threads: 1,
            enhancement_delay: 1,
            passthrough_mode: PassthroughMode::Allow,
            ..PipelineConfig::default()
        });
        let first = gray(2, 2);
        first.fill(0, 9);
        pipeline
            .send_base_picture(1, first, Duration::from_secs(5), 1)
            .unwrap();
        pipeline
            .send_base_picture(2, gray(2, 2), Duration::from_secs(5), 2)
            .unwrap();
        assert_eq!(pipeline.pending_bases.len(), 1);
        assert_eq!(pipeline.pending_bases[0].timestamp, 2);

        pipeline.send_output_picture(gray(2, 2)).unwrap();
        pipeline.flush(1);
        let (picture, info) = pipeline.receive_output_picture().unwrap();
        assert_eq!(info.timestamp, 1);
        assert_eq!(info.user_data, 1);
        assert_eq!(picture.sample(0, 1, 1), Some(9));
    }

    #[test]
    fn disabled_passthrough_asks_to_retry() {
        let mut pipeline = pipeline(PipelineConfig {
            num_threads: 1,
            passthrough_mode: PassthroughMode::Disable,
            ..PipelineConfig::default()
        });
        let result = pipeline.send_base_picture(1, gray(2, 2), Duration::ZERO, 0);
        assert_eq!(result, Err(PipelineError::Again));
        assert_eq!(pipeline.latency(), 0);
    }

    #[test]
    fn second_base_for_a_frame_is_rejected() {
        let mut pipeline = pipeline(PipelineConfig {
            num_threads: 1,
            ..PipelineConfig::default()
        });
        let global = GlobalConfig::new(2, 2, ColorFormat::Gray8);
        pipeline
            .send_enhancement_data(3, PacketBuilder::new().global(global).build())
            .unwrap();
        pipeline
            .send_base_picture(3, gray(2, 2), Duration::from_secs(1), 0)
            .unwrap();
        assert_eq!(
            pipeline.send_base_picture(3, gray(2, 2), Duration::from_secs(1), 0),
            Err(PipelineError::InvalidParam("base picture already sent"))
        );
    }

    #[test]
    fn output_queue_is_bounded() {
        let mut pipeline = pipeline(PipelineConfig {
            num_threads: 1,
            max_latency: 2,
            ..PipelineConfig::default()
        });
        pipeline.send_output_picture(gray(1, 1)).unwrap();
        pipeline.send_output_picture(gray(1, 1)).unwrap();
        assert_eq!(
            pipeline.send_output_picture(gray(1, 1)),
            Err(PipelineError::Again)
        );
    }

    #[test]
    fn output_waits_for_the_earliest_base() {
        let mut pipeline = pipeline(PipelineConfig {
            num_threads: 1,
            ..PipelineConfig::default()
        });
        let global = GlobalConfig::new(2, 2, ColorFormat::Gray8);
        pipeline
            .send_enhancement_data(1, PacketBuilder::new().global(global).build())
            .unwrap();
        pipeline
            .send_enhancement_data(2, PacketBuilder::new().build())
            .unwrap();
        pipeline
            .send_base_picture(2, gray(2, 2), Duration::from_secs(1), 0)
            .unwrap();
        pipeline.send_output_picture(gray(2, 2)).unwrap();

        // Frame 1 has no base yet, so the picture is not given to frame 2.
        assert_eq!(pipeline.available_outputs.len(), 1);
        assert!(pipeline.receive_output_picture().is_none());

        pipeline
            .send_base_picture(1, gray(2, 2), Duration::from_secs(1), 0)
            .unwrap();
        assert!(pipeline.available_outputs.is_empty());
        let (_, info) = pipeline.receive_output_picture().unwrap();
        assert_eq!(info.timestamp, 1);
    }
}
