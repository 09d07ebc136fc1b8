use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;

use crate::pairing::RoomId;

/// Call-level notifications raised by peer sessions.
///
/// Implemented once by the call controller. Every method is a one-way
/// notification; the room identifies which peer relationship changed.
pub trait CallLifecycleListener: Send + Sync {
    fn on_connection_established(&self, room: &RoomId);
    fn on_channel_close(&self, room: &RoomId);
    fn on_channel_error(&self, room: &RoomId);
    fn on_ice_disconnected(&self, room: &RoomId);
    fn on_peer_connection_error(&self, room: &RoomId);
}

/// Wraps the controller's listener so a panicking callback is logged and
/// swallowed instead of unwinding through session code.
#[derive(Clone)]
pub struct GuardedListener {
    inner: Arc<dyn CallLifecycleListener>,
}

impl GuardedListener {
    pub fn new(inner: Arc<dyn CallLifecycleListener>) -> Self {
        Self { inner }
    }

    fn deliver(&self, callback: &'static str, room: &RoomId, f: impl FnOnce(&dyn CallLifecycleListener)) {
        let inner = self.inner.as_ref();
        if panic::catch_unwind(AssertUnwindSafe(|| f(inner))).is_err() {
            error!(%room, callback, "call lifecycle listener panicked");
        }
    }
}

impl CallLifecycleListener for GuardedListener {
    fn on_connection_established(&self, room: &RoomId) {
        self.deliver("on_connection_established", room, |l| l.on_connection_established(room));
    }

    fn on_channel_close(&self, room: &RoomId) {
        self.deliver("on_channel_close", room, |l| l.on_channel_close(room));
    }

    fn on_channel_error(&self, room: &RoomId) {
        self.deliver("on_channel_error", room, |l| l.on_channel_error(room));
    }

    fn on_ice_disconnected(&self, room: &RoomId) {
        self.deliver("on_ice_disconnected", room, |l| l.on_ice_disconnected(room));
    }

    fn on_peer_connection_error(&self, room: &RoomId) {
        self.deliver("on_peer_connection_error", room, |l| l.on_peer_connection_error(room));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Exploding {
        calls: AtomicUsize,
    }

    impl CallLifecycleListener for Exploding {
        fn on_connection_established(&self, _room: &RoomId) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
        fn on_channel_close(&self, _room: &RoomId) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            panic!("controller bug");
        }
        fn on_channel_error(&self, _room: &RoomId) {}
        fn on_ice_disconnected(&self, _room: &RoomId) {}
        fn on_peer_connection_error(&self, _room: &RoomId) {}
    }

    #[test]
    fn panics_stay_inside_the_guard() {
        let inner = Arc::new(Exploding::default());
        let guarded = GuardedListener::new(inner.clone());
        let room = RoomId::new("room12");

        guarded.on_channel_close(&room);
        guarded.on_connection_established(&room);

        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }
}
