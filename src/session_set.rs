use tracing::warn;

use crate::error::{Result, SessionError};
use crate::media::CaptureFormat;
use crate::pairing::RoomId;
use crate::session::Session;

/// An operation that failed on one member of a broadcast.
#[derive(Debug)]
pub struct SessionFailure {
    pub peer_slot: u32,
    pub room_id: RoomId,
    pub error: SessionError,
}

/// The fixed set of peer sessions of one call, in creation order.
///
/// Membership never changes after construction. Broadcast operations are
/// attempted on every member even when some of them fail.
#[derive(Debug, Default)]
pub struct SessionSet {
    sessions: Vec<Session>,
}

impl SessionSet {
    pub fn new(sessions: Vec<Session>) -> Self {
        Self { sessions }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.iter()
    }

    pub fn get(&self, peer_slot: u32) -> Option<&Session> {
        self.sessions.iter().find(|s| s.peer_slot() == peer_slot)
    }

    pub fn get_mut(&mut self, peer_slot: u32) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| s.peer_slot() == peer_slot)
    }

    pub fn connect_to_all(&mut self) -> Vec<SessionFailure> {
        self.broadcast("connect", Session::start)
    }

    pub fn on_stop(&mut self) -> Vec<SessionFailure> {
        self.broadcast("stop capture", Session::stop)
    }

    pub fn on_start(&mut self) -> Vec<SessionFailure> {
        self.broadcast("resume capture", Session::resume)
    }

    pub fn set_audio_enabled(&mut self, enabled: bool) -> Vec<SessionFailure> {
        self.broadcast("set audio", |s| s.set_audio_enabled(enabled))
    }

    pub fn change_capture_format(&mut self, format: CaptureFormat) -> Vec<SessionFailure> {
        self.broadcast("change capture format", |s| s.change_capture_format(format))
    }

    pub fn disconnect_all(&mut self) {
        for session in &mut self.sessions {
            session.disconnect();
        }
    }

    /// True once every member has reached its terminal state.
    pub fn all_disconnected(&self) -> bool {
        self.sessions.iter().all(Session::is_disconnected)
    }

    fn broadcast<F>(&mut self, op: &'static str, mut f: F) -> Vec<SessionFailure>
    where
        F: FnMut(&mut Session) -> Result<()>,
    {
        let mut failures = Vec::new();
        for session in &mut self.sessions {
            if let Err(error) = f(session) {
                warn!(room = %session.room_id(), op, error = %error, "operation failed on peer session");
                failures.push(SessionFailure {
                    peer_slot: session.peer_slot(),
                    room_id: session.room_id().clone(),
                    error,
                });
            }
        }
        failures
    }
}
