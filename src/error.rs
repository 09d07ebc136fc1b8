use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;
use webrtc::Error as WebRTCError;

use crate::config::ConfigError;

/// Failures while building a call or one of its peer sessions.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("participant slot {slot} is outside 1..={total}")]
    SlotOutOfRange { slot: u32, total: u32 },

    #[error("group of {total} participants exceeds the supported {max}")]
    TooManySlots { total: u32, max: u32 },

    #[error("no peer session could be constructed")]
    NoSessions,

    #[error("signaling client for room {room} failed to construct: {reason}")]
    Signaling { room: String, reason: String },

    #[error("media connection for room {room} failed to construct: {reason}")]
    Media { room: String, reason: String },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Failures of an outbound operation on one peer session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("WebRTC error: {0}")]
    WebRTC(#[from] WebRTCError),

    #[error("WebSocket error: {0}")]
    Ws(#[from] WsError),

    #[error("media connection error: {0}")]
    Media(String),

    #[error("signaling error: {0}")]
    Signaling(String),
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("call control loop has stopped")]
    Closed,
}

pub type Result<T> = std::result::Result<T, SessionError>;
