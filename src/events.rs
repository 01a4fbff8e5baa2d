use crate::{frame::DecodeInformation, picture::Picture};
use core::fmt::Debug;

/// Notification emitted by a pipeline.
///
/// Events may be emitted from worker threads as well as from the thread
/// calling into the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A latency slot is free for enhancement data.
    CanSendEnhancement,
    /// A base picture can be accepted.
    CanSendBase,
    /// An output picture can be accepted.
    CanSendPicture,
    /// An output picture is ready to be received.
    CanReceive,
    /// Every task reading this base picture has finished.
    BasePictureDone(Picture),
    /// This output picture holds a finished frame.
    OutputPictureDone(Picture, DecodeInformation),
    /// The pipeline is shutting down.
    Exit,
}

/// Receiver of pipeline [`Event`]s.
///
/// Implementations must not call back into the pipeline.
pub trait EventSink: Debug + Send + Sync {
    /// Handle one event.
    fn on_event(&self, event: Event);
}

/// Sink that drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn on_event(&self, _event: Event) {}
}
