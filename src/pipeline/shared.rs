use crate::{
    arena::Arena,
    backend::PixelBackend,
    error::{PipelineError, Result},
    events::{Event, EventSink},
    executor::{GraphError, GraphRef},
    frame::{BaseInfo, Frame, FrameId, FrameState, Resource, TemporalUse},
    picture::Picture,
    task::Token,
    temporal::{TemporalGrant, TemporalPool, TemporalRequirement},
    types::{HashMap, Timestamp},
};
use parking_lot::{Condvar, Mutex};
use std::{collections::VecDeque, sync::Arc, time::Instant};
use tracing::{debug, warn};

/// Frame bookkeeping guarded by the pipeline's state lock.
///
/// Lock order: this lock may be held while taking the task pool lock, never
/// the other way round. Picture and plane locks are never held while
/// acquiring it.
#[derive(Debug)]
pub(crate) struct Interlocked {
    pub(crate) frames: Arena<Frame>,
    pub(crate) by_timestamp: HashMap<Timestamp, FrameId>,
    /// Released frames in timestamp order.
    pub(crate) processing: Vec<FrameId>,
    pub(crate) temporal: TemporalPool<FrameId>,
}

impl Interlocked {
    pub(crate) fn new(max_latency: usize, temporal_buffers: usize) -> Self {
        Self {
            frames: Arena::with_capacity(max_latency),
            by_timestamp: HashMap::default(),
            processing: Vec::with_capacity(max_latency),
            temporal: TemporalPool::new(temporal_buffers),
        }
    }
}

/// State reachable from the API thread and from task bodies.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) state: Mutex<Interlocked>,
    /// Signalled whenever a frame reaches [`FrameState::Done`].
    pub(crate) frame_done: Condvar,
    pub(crate) finished_bases: Mutex<VecDeque<Picture>>,
    pub(crate) backend: Arc<dyn PixelBackend>,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) highlight_residuals: bool,
}

impl Shared {
    pub(crate) fn emit(&self, event: Event) {
        self.events.on_event(event);
    }

    pub(crate) fn find(&self, timestamp: Timestamp) -> Option<FrameId> {
        self.state.lock().by_timestamp.get(&timestamp).copied()
    }

    /// Attach a base picture to an existing frame and satisfy its base
    /// token.
    pub(crate) fn attach_base(
        &self,
        id: FrameId,
        picture: Picture,
        deadline: Instant,
        user_data: u64,
    ) -> Result<()> {
        let (graph, token) = {
            let mut state = self.state.lock();
            let frame = state.frames.get_mut(id).ok_or(PipelineError::NotFound)?;
            if frame.base.is_some() {
                return Err(PipelineError::InvalidParam("base picture already sent"));
            }
            frame.base = Some(BaseInfo {
                picture: Some(picture.clone()),
                desc: picture.desc(),
                deadline,
                user_data,
            });
            (frame.handle(), frame.base_token)
        };
        graph.satisfy(token, Resource::Picture(picture))?;
        Ok(())
    }

    /// Register a temporal requirement for `plane` of frame `id` and return
    /// the token its buffer arrives on.
    ///
    /// The token is satisfied right away when an idle buffer matches.
    /// Otherwise it stays unmet until the frame holding the wanted state
    /// releases its buffer.
    pub(crate) fn require_temporal(
        &self,
        id: FrameId,
        graph: &GraphRef<Resource>,
        requirement: TemporalRequirement,
    ) -> Result<Token, GraphError> {
        let token = graph.token()?;
        let (timestamp, grant) = {
            let mut guard = self.state.lock();
            let Interlocked {
                frames, temporal, ..
            } = &mut *guard;
            let frame = frames.get_mut(id).ok_or(GraphError::GraphClosed)?;
            let grant = temporal.acquire(id, &requirement);
            frame.temporal[requirement.plane] = TemporalUse {
                token: Some(token),
                requirement: Some(requirement),
                slot: grant.as_ref().map(|grant| grant.slot),
            };
            (frame.timestamp, grant)
        };
        debug!(
            timestamp,
            plane = requirement.plane,
            wanted = ?requirement.timestamp,
            clear = requirement.clear,
            attached = grant.is_some(),
            "temporal buffer required"
        );
        if let Some(grant) = grant {
            grant.prepare(&requirement);
            graph.satisfy(token, Resource::Plane(grant.buffer))?;
        }
        Ok(token)
    }

    /// Give the temporal buffer of `plane` back to the pool, tagged with the
    /// frame's timestamp, and hand it to the earliest processing frame that
    /// waits for exactly that state.
    pub(crate) fn release_temporal(&self, id: FrameId, plane: usize) {
        let handoff = {
            let mut guard = self.state.lock();
            release_and_hand_over(&mut guard, id, plane)
        };
        let Some(handoff) = handoff else {
            return;
        };
        debug!(
            timestamp = handoff.timestamp,
            plane,
            previous = ?handoff.grant.previous,
            "temporal buffer handed over"
        );
        handoff.grant.prepare(&handoff.requirement);
        if let Err(error) = handoff
            .graph
            .satisfy(handoff.token, Resource::Plane(handoff.grant.buffer))
        {
            warn!(timestamp = handoff.timestamp, plane, %error, "temporal handoff to a closed frame");
        }
    }

    /// Mark frame `id` done and tell the caller.
    pub(crate) fn frame_done(&self, id: FrameId) {
        let finished = {
            let mut state = self.state.lock();
            let Some(frame) = state.frames.get_mut(id) else {
                return;
            };
            frame.state = FrameState::Done;
            let info = frame.describe_decode();
            frame.decode_info = Some(info);
            (frame.output.clone(), info)
        };
        self.frame_done.notify_all();
        debug!(timestamp = finished.1.timestamp, skipped = finished.1.skipped, "frame done");
        if let (Some(picture), info) = finished {
            self.emit(Event::OutputPictureDone(picture, info));
        }
        self.emit(Event::CanReceive);
    }

    /// Return the base picture of frame `id` to the caller once no task
    /// reads it any more.
    pub(crate) fn base_done(&self, id: FrameId) {
        let picture = {
            let mut state = self.state.lock();
            state
                .frames
                .get_mut(id)
                .and_then(|frame| frame.base.as_mut())
                .and_then(|base| base.picture.take())
        };
        if let Some(picture) = picture {
            self.finished_bases.lock().push_back(picture.clone());
            self.emit(Event::BasePictureDone(picture));
        }
    }
}

struct Handoff {
    timestamp: Timestamp,
    graph: GraphRef<Resource>,
    token: Token,
    requirement: TemporalRequirement,
    grant: TemporalGrant,
}

fn release_and_hand_over(state: &mut Interlocked, id: FrameId, plane: usize) -> Option<Handoff> {
    let Interlocked {
        frames,
        processing,
        temporal,
        ..
    } = state;
    let frame = frames.get_mut(id)?;
    let slot = frame.temporal[plane].slot.take()?;
    if !temporal.release(slot, id, frame.timestamp) {
        return None;
    }
    let next = processing.iter().copied().find(|&other| {
        frames.get(other).is_some_and(|candidate| {
            let wanted = candidate.temporal[plane];
            wanted.is_waiting()
                && wanted
                    .requirement
                    .is_some_and(|requirement| temporal.satisfies(slot, &requirement))
        })
    })?;
    let frame = frames.get_mut(next)?;
    let wanted = &mut frame.temporal[plane];
    let (token, requirement) = (wanted.token?, wanted.requirement?);
    wanted.slot = Some(slot);
    Some(Handoff {
        timestamp: frame.timestamp,
        graph: frame.handle(),
        token,
        requirement,
        grant: temporal.hand_over(slot, next),
    })
}
