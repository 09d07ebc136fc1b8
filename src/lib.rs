//! Multi-party mesh calls built from pairwise WebRTC sessions.
//!
//! A group of `K` participants is turned into `K-1` one-to-one sessions per
//! participant, each with its own signaling room and peer connection. The
//! [`Orchestrator`] owns those sessions, runs the single control loop that
//! mutates them, and tears the call down once the last one is gone.

pub mod config;
pub mod error;
pub mod events;
pub mod listener;
pub mod media;
pub mod monitor;
pub mod orchestrator;
pub mod pairing;
pub mod session;
pub mod session_set;
pub mod signaling;

pub use config::{CallConfig, ConfigError};
pub use error::{OrchestratorError, Result, SessionError, SetupError};
pub use listener::CallLifecycleListener;
pub use monitor::{CallMonitor, CallState, CallStatus, PeerStatus};
pub use orchestrator::{CallFactories, CallSummary, Orchestrator, OrchestratorHandle, SetupFailure};
pub use pairing::{peer_rooms, PeerRoom, RoomId};
pub use session::{Session, SessionState};
pub use session_set::{SessionFailure, SessionSet};
