//! Media collaborators.
//!
//! A media connection is one peer connection towards one peer. It does
//! the offer/answer and ICE work on its own tasks and reports progress as
//! [`crate::events::MediaEvent`]s. The factory behind it is shared by all
//! sessions of a call and is shut down once, when the call ends.

mod rtc;

pub use rtc::{CaptureState, LocalFeed, RtcMediaConnection, RtcMediaFactory};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

use crate::error::Result;
use crate::events::{EventSink, IceCandidate, RoomParameters, SessionDescription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureFormat {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
}

impl Default for CaptureFormat {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            framerate: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone)]
pub struct MediaFrame {
    pub kind: TrackKind,
    pub timestamp: u32,
    pub payload: Bytes,
}

/// Anything that can take decoded or packetized media for display.
pub trait FrameSink: Send + Sync {
    fn on_frame(&self, frame: &MediaFrame);
}

/// A render target whose destination the call controller can swap or
/// clear at any time. Sessions only push into it.
#[derive(Default)]
pub struct ProxySink {
    target: RwLock<Option<Arc<dyn FrameSink>>>,
}

impl ProxySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_target(&self, target: Option<Arc<dyn FrameSink>>) {
        match self.target.write() {
            Ok(mut guard) => *guard = target,
            Err(poisoned) => *poisoned.into_inner() = target,
        }
    }
}

impl FrameSink for ProxySink {
    fn on_frame(&self, frame: &MediaFrame) {
        let target = match self.target.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        if let Some(target) = target {
            target.on_frame(frame);
        }
    }
}

/// Render targets bound to one session for its whole life.
#[derive(Clone)]
pub struct RenderTargets {
    pub local: Arc<dyn FrameSink>,
    pub remote: Arc<dyn FrameSink>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaParameters {
    pub ice_servers: Vec<String>,
    pub capture: CaptureFormat,
    pub audio_enabled: bool,
}

/// Outbound side of one peer connection. Every call returns promptly;
/// results arrive later as media events.
pub trait MediaConnection: Send {
    /// Creates the underlying peer connection for the room just joined.
    fn open(&mut self, room: &RoomParameters) -> Result<()>;
    fn create_offer(&mut self) -> Result<()>;
    fn create_answer(&mut self) -> Result<()>;
    fn set_remote_description(&mut self, sdp: &SessionDescription) -> Result<()>;
    fn add_remote_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<()>;
    fn remove_remote_ice_candidates(&mut self, candidates: &[IceCandidate]) -> Result<()>;
    fn set_video_max_bitrate(&mut self, kbps: u32) -> Result<()>;
    fn start_video_source(&mut self) -> Result<()>;
    fn stop_video_source(&mut self) -> Result<()>;
    fn change_capture_format(&mut self, format: CaptureFormat) -> Result<()>;
    fn set_audio_enabled(&mut self, enabled: bool) -> Result<()>;
    fn close(&mut self);
}

pub trait MediaFactory: Send + Sync {
    fn create(
        &self,
        params: &MediaParameters,
        targets: RenderTargets,
        events: EventSink,
    ) -> anyhow::Result<Box<dyn MediaConnection>>;

    /// Releases the process-wide engine. Called once per call.
    fn shutdown(&self);
}
