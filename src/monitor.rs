use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

use crate::session::SessionState;
use crate::session_set::SessionSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CallState {
    /// Sessions exist but none has been asked to join yet.
    Idle,
    Connecting,
    /// At least one peer has media flowing.
    Connected,
    /// Every peer session is gone and shared resources are released.
    Ended,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallState::Idle => write!(f, "Idle"),
            CallState::Connecting => write!(f, "Connecting"),
            CallState::Connected => write!(f, "Connected"),
            CallState::Ended => write!(f, "Ended"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerStatus {
    pub peer_slot: u32,
    pub room_id: String,
    pub state: SessionState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallStatus {
    pub state: CallState,
    pub peers: Vec<PeerStatus>,
}

impl Default for CallStatus {
    fn default() -> Self {
        Self {
            state: CallState::Idle,
            peers: Vec::new(),
        }
    }
}

impl CallStatus {
    /// Derives the call-level view from the sessions.
    pub fn from_sessions(sessions: &SessionSet, ended: bool) -> Self {
        let peers: Vec<PeerStatus> = sessions
            .iter()
            .map(|s| PeerStatus {
                peer_slot: s.peer_slot(),
                room_id: s.room_id().to_string(),
                state: s.state(),
            })
            .collect();

        let state = if ended {
            CallState::Ended
        } else if peers.iter().any(|p| p.state == SessionState::Connected) {
            CallState::Connected
        } else if peers
            .iter()
            .any(|p| matches!(p.state, SessionState::Joining | SessionState::Negotiating))
        {
            CallState::Connecting
        } else {
            CallState::Idle
        };

        Self { state, peers }
    }

    pub fn connected_peers(&self) -> usize {
        self.peers
            .iter()
            .filter(|p| p.state == SessionState::Connected)
            .count()
    }
}

/// Publishes call status to any number of observers.
#[derive(Clone)]
pub struct CallMonitor {
    status: Arc<watch::Sender<CallStatus>>,
    receiver: watch::Receiver<CallStatus>,
}

impl Default for CallMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl CallMonitor {
    pub fn new() -> Self {
        let (status, receiver) = watch::channel(CallStatus::default());
        Self {
            status: Arc::new(status),
            receiver,
        }
    }

    /// Replaces the published status, waking observers only on change.
    pub fn publish(&self, next: CallStatus) {
        self.status.send_if_modified(|status| {
            if *status == next {
                false
            } else {
                *status = next;
                true
            }
        });
    }

    pub fn current(&self) -> CallStatus {
        self.receiver.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CallStatus> {
        self.receiver.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(state: CallState) -> CallStatus {
        CallStatus {
            state,
            peers: vec![PeerStatus {
                peer_slot: 1,
                room_id: "room12".to_string(),
                state: SessionState::Joining,
            }],
        }
    }

    #[tokio::test]
    async fn observers_see_changes_only() {
        let monitor = CallMonitor::new();
        let mut rx = monitor.subscribe();

        monitor.publish(status(CallState::Connecting));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().state, CallState::Connecting);

        monitor.publish(status(CallState::Connecting));
        assert!(!rx.has_changed().unwrap());

        monitor.publish(status(CallState::Ended));
        assert!(rx.has_changed().unwrap());
        assert_eq!(monitor.current().state, CallState::Ended);
    }

    #[test]
    fn empty_set_is_idle() {
        let status = CallStatus::from_sessions(&SessionSet::default(), false);
        assert_eq!(status.state, CallState::Idle);
        assert_eq!(status.connected_peers(), 0);
    }
}
