//! Events flowing from the signaling and media collaborators into the
//! call control loop.
//!
//! Collaborators run on their own tasks and threads. They never touch
//! session state; they push events into an [`EventSink`] and the control
//! loop applies them one at a time.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_mline_index: Option<u16>,
}

/// What the signaling server tells us when we enter a room.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomParameters {
    pub initiator: bool,
    /// Offer already waiting in the room, if the other end got there first.
    pub offer: Option<SessionDescription>,
    /// Candidates posted to the room before we joined.
    pub candidates: Vec<IceCandidate>,
    pub ice_servers: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum SignalingEvent {
    ConnectedToRoom(RoomParameters),
    RemoteDescription(SessionDescription),
    RemoteIceCandidate(IceCandidate),
    RemoteIceCandidatesRemoved(Vec<IceCandidate>),
    ChannelClose,
    ChannelError(String),
}

#[derive(Debug, Clone)]
pub enum MediaEvent {
    LocalDescription(SessionDescription),
    IceCandidate(IceCandidate),
    IceCandidatesRemoved(Vec<IceCandidate>),
    IceConnected,
    IceDisconnected,
    PeerConnectionClosed,
    PeerConnectionError(String),
}

#[derive(Debug, Clone)]
pub enum CallEvent {
    Signaling { peer_slot: u32, event: SignalingEvent },
    Media { peer_slot: u32, event: MediaEvent },
    NegotiationTimeout { peer_slot: u32 },
}

impl CallEvent {
    pub fn peer_slot(&self) -> u32 {
        match self {
            CallEvent::Signaling { peer_slot, .. }
            | CallEvent::Media { peer_slot, .. }
            | CallEvent::NegotiationTimeout { peer_slot } => *peer_slot,
        }
    }
}

/// Handle a collaborator uses to report events for one peer session.
///
/// Sending never blocks and may happen from any thread. Events sent after
/// the control loop has exited are dropped.
#[derive(Debug, Clone)]
pub struct EventSink {
    peer_slot: u32,
    tx: mpsc::UnboundedSender<CallEvent>,
}

impl EventSink {
    pub fn new(peer_slot: u32, tx: mpsc::UnboundedSender<CallEvent>) -> Self {
        Self { peer_slot, tx }
    }

    pub fn peer_slot(&self) -> u32 {
        self.peer_slot
    }

    pub fn signaling(&self, event: SignalingEvent) {
        self.post(CallEvent::Signaling {
            peer_slot: self.peer_slot,
            event,
        });
    }

    pub fn media(&self, event: MediaEvent) {
        self.post(CallEvent::Media {
            peer_slot: self.peer_slot,
            event,
        });
    }

    pub(crate) fn negotiation_timeout(&self) {
        self.post(CallEvent::NegotiationTimeout {
            peer_slot: self.peer_slot,
        });
    }

    fn post(&self, event: CallEvent) {
        if self.tx.send(event).is_err() {
            trace!(peer = self.peer_slot, "control loop gone, dropping event");
        }
    }
}
