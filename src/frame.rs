mod tasks;

pub(crate) use crate::frame::tasks::{FramePlan, generate};
use crate::{
    arena::Handle,
    enhancement::{CommandBuffer, FrameConfig, GlobalConfig},
    executor::{GraphRef, TaskGraph},
    picture::{Picture, PictureDesc, SharedPlane},
    task::Token,
    temporal::TemporalRequirement,
    types::{MAX_PLANES, Timestamp},
};
use bytes::Bytes;
use derive_more::Display;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

pub(crate) type FrameId = Handle<Frame>;

/// Value carried by a frame's dependency tokens.
#[derive(Debug, Clone, Default)]
pub(crate) enum Resource {
    /// Completion without a payload.
    #[default]
    Empty,
    Picture(Picture),
    /// A temporal buffer granted to the frame.
    Plane(SharedPlane),
    Commands(Arc<CommandBuffer>),
}

impl Resource {
    pub(crate) fn picture(&self) -> Option<&Picture> {
        match self {
            Self::Picture(picture) => Some(picture),
            _ => None,
        }
    }

    pub(crate) fn plane(&self) -> Option<&SharedPlane> {
        match self {
            Self::Plane(plane) => Some(plane),
            _ => None,
        }
    }

    pub(crate) fn commands(&self) -> Option<&Arc<CommandBuffer>> {
        match self {
            Self::Commands(commands) => Some(commands),
            _ => None,
        }
    }
}

/// Lifecycle of a frame. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub(crate) enum FrameState {
    /// Waiting in the reorder window.
    Reorder,
    /// Released; its task graph is running.
    Processing,
    /// Output is complete.
    Done,
}

/// Which task graph a released frame runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GraphKind {
    /// Upscale cascade, with residuals unless the frame is pass-through.
    Enhancement,
    /// Plane-by-plane copy of the base.
    Copy,
}

/// Metadata returned with every output picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DecodeInformation {
    /// Timestamp of the frame.
    pub timestamp: Timestamp,
    /// A base picture was decoded into the output.
    pub has_base: bool,
    /// Enhancement data was received for the frame.
    pub has_enhancement: bool,
    /// The frame was skipped; output content is unspecified.
    pub skipped: bool,
    /// Residuals were applied.
    pub enhanced: bool,
    /// Width of the base picture.
    pub base_width: u32,
    /// Height of the base picture.
    pub base_height: u32,
    /// Sample depth of the base picture.
    pub base_bitdepth: u8,
    /// Value passed with the base picture.
    pub user_data: u64,
}

/// Base picture attached to a frame.
#[derive(Debug, Clone)]
pub(crate) struct BaseInfo {
    /// Cleared once every task reading it has finished.
    pub(crate) picture: Option<Picture>,
    pub(crate) desc: PictureDesc,
    pub(crate) deadline: Instant,
    pub(crate) user_data: u64,
}

/// Temporal buffer bookkeeping for one plane.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TemporalUse {
    pub(crate) token: Option<Token>,
    pub(crate) requirement: Option<TemporalRequirement>,
    /// Pool slot currently attached to the frame.
    pub(crate) slot: Option<usize>,
}

impl TemporalUse {
    /// Whether a requirement is waiting for a buffer.
    pub(crate) fn is_waiting(&self) -> bool {
        self.requirement.is_some() && self.slot.is_none() && self.token.is_some()
    }
}

/// Per-timestamp unit of decode work.
#[derive(Debug)]
pub(crate) struct Frame {
    pub(crate) timestamp: Timestamp,
    pub(crate) state: FrameState,
    pub(crate) passthrough: bool,
    /// Released after output with a later timestamp was delivered. Runs
    /// without an output picture and is discarded on receive.
    pub(crate) late: bool,
    pub(crate) kind: GraphKind,
    pub(crate) skip: Arc<AtomicBool>,
    pub(crate) graph: TaskGraph<Resource>,
    pub(crate) base_token: Token,
    pub(crate) output_token: Token,
    pub(crate) temporal: [TemporalUse; MAX_PLANES],
    pub(crate) base: Option<BaseInfo>,
    pub(crate) output: Option<Picture>,
    pub(crate) enhancement: Option<Bytes>,
    pub(crate) global: Option<Arc<GlobalConfig>>,
    pub(crate) config: Arc<FrameConfig>,
    pub(crate) decode_info: Option<DecodeInformation>,
}

impl Frame {
    pub(crate) fn new(
        timestamp: Timestamp,
        graph: TaskGraph<Resource>,
        base_token: Token,
        output_token: Token,
    ) -> Self {
        Self {
            timestamp,
            state: FrameState::Reorder,
            passthrough: false,
            late: false,
            kind: GraphKind::Copy,
            skip: Arc::new(AtomicBool::new(false)),
            graph,
            base_token,
            output_token,
            temporal: [TemporalUse::default(); MAX_PLANES],
            base: None,
            output: None,
            enhancement: None,
            global: None,
            config: Arc::new(FrameConfig::passthrough()),
            decode_info: None,
        }
    }

    pub(crate) fn handle(&self) -> GraphRef<Resource> {
        self.graph.handle()
    }

    pub(crate) fn set_skip(&self) {
        self.skip.store(true, Ordering::Release);
    }

    pub(crate) fn is_skipped(&self) -> bool {
        self.skip.load(Ordering::Acquire)
    }

    pub(crate) fn has_base(&self) -> bool {
        self.base.is_some()
    }

    /// Whether the frame will finish without further input from the caller
    /// or from another frame: base, output picture and every temporal buffer
    /// it asked for are in place.
    pub(crate) fn can_complete(&self) -> bool {
        if self.state != FrameState::Processing {
            return false;
        }
        let mut inputs = vec![self.base_token, self.output_token];
        inputs.extend(self.temporal.iter().filter_map(|temporal| temporal.token));
        self.graph.all_met(&inputs)
    }

    /// Deadline of a blocking wait for this frame.
    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.base.as_ref().map(|base| base.deadline)
    }

    /// Layout the output picture gets when attached.
    pub(crate) fn output_desc(&self) -> Option<PictureDesc> {
        match (self.kind, &self.global) {
            (GraphKind::Enhancement, Some(global)) => Some(global.output_desc()),
            _ => self.base.as_ref().map(|base| base.desc),
        }
    }

    /// Decode metadata at completion.
    pub(crate) fn describe_decode(&self) -> DecodeInformation {
        let skipped = self.is_skipped();
        let base = self.base.as_ref();
        DecodeInformation {
            timestamp: self.timestamp,
            has_base: base.is_some(),
            has_enhancement: self.enhancement.is_some(),
            skipped,
            enhanced: !skipped && !self.passthrough && self.config.has_residuals(),
            base_width: base.map_or(0, |base| base.desc.width),
            base_height: base.map_or(0, |base| base.desc.height),
            base_bitdepth: base.map_or(0, |base| base.desc.format.bit_depth()),
            user_data: base.map_or(0, |base| base.user_data),
        }
    }
}
