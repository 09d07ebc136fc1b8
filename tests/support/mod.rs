#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use mesh_call::events::{
    CallEvent, EventSink, IceCandidate, MediaEvent, RoomParameters, SessionDescription, SignalingEvent,
};
use mesh_call::media::{
    CaptureFormat, FrameSink, MediaConnection, MediaFactory, MediaFrame, MediaParameters, RenderTargets,
};
use mesh_call::signaling::{RoomConnectionParameters, SignalingClient, SignalingFactory, SignalingRoute};
use mesh_call::{CallConfig, CallFactories, CallLifecycleListener, PeerRoom, RoomId, SessionError};

/// Shared record of every collaborator call, as `"<peer>:<op>"` entries.
#[derive(Default)]
pub struct Harness {
    pub entries: Mutex<Vec<String>>,
    pub sinks: Mutex<HashMap<u32, EventSink>>,
    pub shutdowns: AtomicUsize,
    pub fail_signaling_create: HashSet<u32>,
    pub fail_media_create: HashSet<u32>,
    pub fail_connect: HashSet<u32>,
    pub fail_audio: HashSet<u32>,
}

impl Harness {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn factories(self: &Arc<Self>) -> CallFactories {
        CallFactories {
            signaling: Arc::new(MockSignalingFactory(self.clone())),
            media: Arc::new(MockMediaFactory(self.clone())),
        }
    }

    pub fn record(&self, peer: u32, op: impl AsRef<str>) {
        self.entries
            .lock()
            .unwrap()
            .push(format!("{}:{}", peer, op.as_ref()));
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    pub fn entries_for(&self, peer: u32) -> Vec<String> {
        let prefix = format!("{}:", peer);
        self.entries()
            .into_iter()
            .filter_map(|e| e.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| e.as_str() == entry).count()
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    /// The sink a collaborator of `peer` would post its events to.
    pub fn sink(&self, peer: u32) -> EventSink {
        self.sinks
            .lock()
            .unwrap()
            .get(&peer)
            .cloned()
            .unwrap_or_else(|| panic!("no collaborators built for peer {}", peer))
    }
}

pub struct MockSignalingFactory(Arc<Harness>);

impl SignalingFactory for MockSignalingFactory {
    fn create(&self, _route: SignalingRoute, events: EventSink) -> anyhow::Result<Box<dyn SignalingClient>> {
        let peer = events.peer_slot();
        if self.0.fail_signaling_create.contains(&peer) {
            return Err(anyhow!("signaling unavailable for peer {}", peer));
        }
        self.0.sinks.lock().unwrap().insert(peer, events);
        Ok(Box::new(MockSignaling {
            peer,
            harness: self.0.clone(),
        }))
    }
}

struct MockSignaling {
    peer: u32,
    harness: Arc<Harness>,
}

impl SignalingClient for MockSignaling {
    fn connect_to_room(&mut self, params: &RoomConnectionParameters) -> mesh_call::Result<()> {
        self.harness.record(self.peer, format!("connect:{}", params.room_id));
        if self.harness.fail_connect.contains(&self.peer) {
            return Err(SessionError::Signaling("room server refused".to_string()));
        }
        Ok(())
    }

    fn send_offer_sdp(&mut self, _sdp: &SessionDescription) -> mesh_call::Result<()> {
        self.harness.record(self.peer, "send-offer");
        Ok(())
    }

    fn send_answer_sdp(&mut self, _sdp: &SessionDescription) -> mesh_call::Result<()> {
        self.harness.record(self.peer, "send-answer");
        Ok(())
    }

    fn send_local_ice_candidate(&mut self, _candidate: &IceCandidate) -> mesh_call::Result<()> {
        self.harness.record(self.peer, "send-candidate");
        Ok(())
    }

    fn send_local_ice_candidate_removals(&mut self, _candidates: &[IceCandidate]) -> mesh_call::Result<()> {
        self.harness.record(self.peer, "send-removals");
        Ok(())
    }

    fn disconnect_from_room(&mut self) {
        self.harness.record(self.peer, "leave");
    }
}

pub struct MockMediaFactory(Arc<Harness>);

impl MediaFactory for MockMediaFactory {
    fn create(
        &self,
        _params: &MediaParameters,
        _targets: RenderTargets,
        events: EventSink,
    ) -> anyhow::Result<Box<dyn MediaConnection>> {
        let peer = events.peer_slot();
        if self.0.fail_media_create.contains(&peer) {
            return Err(anyhow!("no camera for peer {}", peer));
        }
        Ok(Box::new(MockMedia {
            peer,
            harness: self.0.clone(),
        }))
    }

    fn shutdown(&self) {
        self.0.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

struct MockMedia {
    peer: u32,
    harness: Arc<Harness>,
}

impl MockMedia {
    fn ok(&self, op: impl AsRef<str>) -> mesh_call::Result<()> {
        self.harness.record(self.peer, op);
        Ok(())
    }
}

impl MediaConnection for MockMedia {
    fn open(&mut self, _room: &RoomParameters) -> mesh_call::Result<()> {
        self.ok("open")
    }

    fn create_offer(&mut self) -> mesh_call::Result<()> {
        self.ok("offer")
    }

    fn create_answer(&mut self) -> mesh_call::Result<()> {
        self.ok("answer")
    }

    fn set_remote_description(&mut self, _sdp: &SessionDescription) -> mesh_call::Result<()> {
        self.ok("remote-description")
    }

    fn add_remote_ice_candidate(&mut self, _candidate: &IceCandidate) -> mesh_call::Result<()> {
        self.ok("candidate")
    }

    fn remove_remote_ice_candidates(&mut self, _candidates: &[IceCandidate]) -> mesh_call::Result<()> {
        self.ok("remove-candidates")
    }

    fn set_video_max_bitrate(&mut self, kbps: u32) -> mesh_call::Result<()> {
        self.ok(format!("bitrate:{}", kbps))
    }

    fn start_video_source(&mut self) -> mesh_call::Result<()> {
        self.ok("start-video")
    }

    fn stop_video_source(&mut self) -> mesh_call::Result<()> {
        self.ok("stop-video")
    }

    fn change_capture_format(&mut self, format: CaptureFormat) -> mesh_call::Result<()> {
        self.ok(format!("format:{}x{}@{}", format.width, format.height, format.framerate))
    }

    fn set_audio_enabled(&mut self, enabled: bool) -> mesh_call::Result<()> {
        if self.harness.fail_audio.contains(&self.peer) {
            return Err(SessionError::Media("audio track gone".to_string()));
        }
        self.ok(format!("audio:{}", enabled))
    }

    fn close(&mut self) {
        self.harness.record(self.peer, "close");
    }
}

/// Records callbacks as `"<callback>:<room>"`.
#[derive(Default)]
pub struct RecordingListener {
    pub calls: Mutex<Vec<String>>,
    pub panic_on_established: bool,
}

impl RecordingListener {
    fn push(&self, callback: &str, room: &RoomId) {
        self.calls.lock().unwrap().push(format!("{}:{}", callback, room));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, callback: &str) -> usize {
        let prefix = format!("{}:", callback);
        self.calls().iter().filter(|c| c.starts_with(&prefix)).count()
    }
}

impl CallLifecycleListener for RecordingListener {
    fn on_connection_established(&self, room: &RoomId) {
        self.push("established", room);
        if self.panic_on_established {
            panic!("controller bug");
        }
    }

    fn on_channel_close(&self, room: &RoomId) {
        self.push("channel-close", room);
    }

    fn on_channel_error(&self, room: &RoomId) {
        self.push("channel-error", room);
    }

    fn on_ice_disconnected(&self, room: &RoomId) {
        self.push("ice-disconnected", room);
    }

    fn on_peer_connection_error(&self, room: &RoomId) {
        self.push("peer-connection-error", room);
    }
}

struct NullSink;

impl FrameSink for NullSink {
    fn on_frame(&self, _frame: &MediaFrame) {}
}

pub fn targets(_peer: &PeerRoom) -> RenderTargets {
    RenderTargets {
        local: Arc::new(NullSink),
        remote: Arc::new(NullSink),
    }
}

pub fn config(slot: u32, total_slots: u32) -> CallConfig {
    CallConfig {
        room_id: "room".to_string(),
        slot,
        total_slots,
        ..CallConfig::default()
    }
}

pub fn signaling(peer_slot: u32, event: SignalingEvent) -> CallEvent {
    CallEvent::Signaling { peer_slot, event }
}

pub fn media(peer_slot: u32, event: MediaEvent) -> CallEvent {
    CallEvent::Media { peer_slot, event }
}

pub fn joined(initiator: bool) -> SignalingEvent {
    SignalingEvent::ConnectedToRoom(RoomParameters {
        initiator,
        ..RoomParameters::default()
    })
}
