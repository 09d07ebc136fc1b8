//! One peer relationship of a mesh call.
//!
//! A session pairs a signaling client with a media connection for a single
//! remote participant and drives them through
//! `Created -> Joining -> Negotiating -> Connected`, with an edge to
//! `Disconnected` from anywhere. `Disconnected` is terminal: the
//! collaborators are released exactly once and every later operation or
//! event is ignored.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Result, SetupError};
use crate::events::{EventSink, IceCandidate, MediaEvent, RoomParameters, SessionDescription, SignalingEvent};
use crate::listener::CallLifecycleListener;
use crate::media::{CaptureFormat, MediaConnection, MediaFactory, MediaParameters, RenderTargets};
use crate::pairing::{PeerRoom, RoomId};
use crate::signaling::{select_route, RoomConnectionParameters, SignalingClient, SignalingFactory};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Created,
    Joining,
    Negotiating,
    Connected,
    Disconnected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Created => write!(f, "Created"),
            SessionState::Joining => write!(f, "Joining"),
            SessionState::Negotiating => write!(f, "Negotiating"),
            SessionState::Connected => write!(f, "Connected"),
            SessionState::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// Per-call settings every session is built with.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub room_url: String,
    pub loopback: bool,
    /// Screen capture keeps running while the call is in the background.
    pub screencast: bool,
    pub video_max_bitrate_kbps: Option<u32>,
    pub media: MediaParameters,
}

pub struct Session {
    peer_slot: u32,
    room_id: RoomId,
    connection: RoomConnectionParameters,
    signaling: Option<Box<dyn SignalingClient>>,
    media: Option<Box<dyn MediaConnection>>,
    listener: Arc<dyn CallLifecycleListener>,
    targets: RenderTargets,
    room: Option<RoomParameters>,
    state: SessionState,
    ice_connected: bool,
    disconnected: bool,
    screencast: bool,
    video_max_bitrate_kbps: Option<u32>,
    bitrate_applied: bool,
}

impl Session {
    /// Builds both collaborators. Nothing touches the network until
    /// [`Session::start`].
    pub fn create(
        peer: &PeerRoom,
        options: &SessionOptions,
        targets: RenderTargets,
        signaling_factory: &dyn SignalingFactory,
        media_factory: &dyn MediaFactory,
        listener: Arc<dyn CallLifecycleListener>,
        events: EventSink,
    ) -> std::result::Result<Self, SetupError> {
        let route = select_route(&peer.room_id, options.loopback);
        debug!(room = %peer.room_id, ?route, "creating peer session");

        let signaling = signaling_factory
            .create(route, events.clone())
            .map_err(|e| SetupError::Signaling {
                room: peer.room_id.to_string(),
                reason: e.to_string(),
            })?;

        let media = media_factory
            .create(&options.media, targets.clone(), events)
            .map_err(|e| SetupError::Media {
                room: peer.room_id.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            peer_slot: peer.peer_slot,
            room_id: peer.room_id.clone(),
            connection: RoomConnectionParameters {
                room_url: options.room_url.clone(),
                room_id: peer.room_id.clone(),
                loopback: options.loopback,
            },
            signaling: Some(signaling),
            media: Some(media),
            listener,
            targets,
            room: None,
            state: SessionState::Created,
            ice_connected: false,
            disconnected: false,
            screencast: options.screencast,
            video_max_bitrate_kbps: options.video_max_bitrate_kbps,
            bitrate_applied: false,
        })
    }

    pub fn peer_slot(&self) -> u32 {
        self.peer_slot
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_ice_connected(&self) -> bool {
        self.ice_connected
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    pub fn render_targets(&self) -> &RenderTargets {
        &self.targets
    }

    /// Joins the pairwise room.
    pub fn start(&mut self) -> Result<()> {
        let Some(signaling) = self.signaling.as_mut() else {
            warn!(room = %self.room_id, "start on a disconnected session ignored");
            return Ok(());
        };
        if self.state != SessionState::Created {
            debug!(room = %self.room_id, state = %self.state, "session already started");
            return Ok(());
        }

        info!(room = %self.room_id, url = %self.connection.room_url, "joining room");
        match signaling.connect_to_room(&self.connection) {
            Ok(()) => {
                self.state = SessionState::Joining;
                Ok(())
            }
            Err(e) => {
                warn!(room = %self.room_id, error = %e, "could not join room");
                self.disconnect();
                self.listener.on_channel_error(&self.room_id);
                Err(e)
            }
        }
    }

    /// Pauses local video while the call is backgrounded.
    pub fn stop(&mut self) -> Result<()> {
        if self.screencast {
            return Ok(());
        }
        match self.media.as_mut() {
            Some(media) => media.stop_video_source(),
            None => Ok(()),
        }
    }

    pub fn resume(&mut self) -> Result<()> {
        if self.screencast {
            return Ok(());
        }
        match self.media.as_mut() {
            Some(media) => media.start_video_source(),
            None => Ok(()),
        }
    }

    pub fn set_audio_enabled(&mut self, enabled: bool) -> Result<()> {
        match self.media.as_mut() {
            Some(media) => media.set_audio_enabled(enabled),
            None => Ok(()),
        }
    }

    pub fn change_capture_format(&mut self, format: CaptureFormat) -> Result<()> {
        match self.media.as_mut() {
            Some(media) => media.change_capture_format(format),
            None => Ok(()),
        }
    }

    /// Leaves the room and closes the peer connection. Only the first call
    /// does anything.
    pub fn disconnect(&mut self) {
        if self.disconnected {
            return;
        }
        self.disconnected = true;
        self.ice_connected = false;
        self.state = SessionState::Disconnected;

        if let Some(mut signaling) = self.signaling.take() {
            signaling.disconnect_from_room();
        }
        if let Some(mut media) = self.media.take() {
            media.close();
        }
        info!(room = %self.room_id, "peer session disconnected");
    }

    pub fn handle_signaling(&mut self, event: SignalingEvent) {
        if self.disconnected {
            debug!(room = %self.room_id, ?event, "signaling event after disconnect ignored");
            return;
        }

        match event {
            SignalingEvent::ConnectedToRoom(params) => self.on_connected_to_room(params),
            SignalingEvent::RemoteDescription(sdp) => self.on_remote_description(sdp),
            SignalingEvent::RemoteIceCandidate(candidate) => {
                let Some(media) = self.media.as_mut() else {
                    warn!(room = %self.room_id, "remote candidate for a missing peer connection");
                    return;
                };
                if let Err(e) = media.add_remote_ice_candidate(&candidate) {
                    self.fail_media(&e.to_string());
                }
            }
            SignalingEvent::RemoteIceCandidatesRemoved(candidates) => {
                let Some(media) = self.media.as_mut() else {
                    warn!(room = %self.room_id, "candidate removal for a missing peer connection");
                    return;
                };
                if let Err(e) = media.remove_remote_ice_candidates(&candidates) {
                    self.fail_media(&e.to_string());
                }
            }
            SignalingEvent::ChannelClose => {
                info!(room = %self.room_id, "remote end hung up, dropping peer connection");
                self.disconnect();
                self.listener.on_channel_close(&self.room_id);
            }
            SignalingEvent::ChannelError(description) => {
                warn!(room = %self.room_id, %description, "signaling channel error, dropping peer connection");
                self.disconnect();
                self.listener.on_channel_error(&self.room_id);
            }
        }
    }

    pub fn handle_media(&mut self, event: MediaEvent) {
        if self.disconnected {
            debug!(room = %self.room_id, ?event, "media event after disconnect ignored");
            return;
        }

        match event {
            MediaEvent::LocalDescription(sdp) => self.on_local_description(sdp),
            MediaEvent::IceCandidate(candidate) => self.forward_candidate(&candidate),
            MediaEvent::IceCandidatesRemoved(candidates) => self.forward_removals(&candidates),
            MediaEvent::IceConnected => {
                info!(room = %self.room_id, "ICE connected");
                self.ice_connected = true;
                self.state = SessionState::Connected;
                self.listener.on_connection_established(&self.room_id);
            }
            MediaEvent::IceDisconnected => {
                info!(room = %self.room_id, "ICE disconnected");
                self.disconnect();
                self.listener.on_ice_disconnected(&self.room_id);
            }
            MediaEvent::PeerConnectionClosed => {
                debug!(room = %self.room_id, "peer connection closed");
            }
            MediaEvent::PeerConnectionError(description) => self.fail_media(&description),
        }
    }

    /// The call's negotiation deadline passed for this peer.
    pub fn handle_negotiation_timeout(&mut self) {
        if self.disconnected || self.state == SessionState::Connected {
            return;
        }
        warn!(room = %self.room_id, state = %self.state, "peer did not connect in time");
        self.disconnect();
        self.listener.on_channel_error(&self.room_id);
    }

    fn on_connected_to_room(&mut self, params: RoomParameters) {
        let Some(media) = self.media.as_mut() else {
            warn!(room = %self.room_id, "joined room without a peer connection");
            return;
        };
        info!(room = %self.room_id, initiator = params.initiator, "joined room");
        self.state = SessionState::Negotiating;

        let outcome = apply_room(&mut **media, &params);
        self.room = Some(params);
        if let Err(e) = outcome {
            self.fail_media(&e.to_string());
        }
    }

    fn on_remote_description(&mut self, sdp: SessionDescription) {
        let Some(initiator) = self.room.as_ref().map(|room| room.initiator) else {
            warn!(room = %self.room_id, "remote description before joining the room ignored");
            return;
        };
        let Some(media) = self.media.as_mut() else {
            warn!(room = %self.room_id, "remote description for a missing peer connection");
            return;
        };

        let mut outcome = media.set_remote_description(&sdp);
        if outcome.is_ok() && !initiator {
            debug!(room = %self.room_id, "creating answer");
            outcome = media.create_answer();
        }
        if let Err(e) = outcome {
            self.fail_media(&e.to_string());
        }
    }

    fn on_local_description(&mut self, sdp: SessionDescription) {
        let Some(initiator) = self.room.as_ref().map(|room| room.initiator) else {
            warn!(room = %self.room_id, "local description before joining the room dropped");
            return;
        };

        if let Some(signaling) = self.signaling.as_mut() {
            let sent = if initiator {
                signaling.send_offer_sdp(&sdp)
            } else {
                signaling.send_answer_sdp(&sdp)
            };
            if let Err(e) = sent {
                self.fail_signaling(&e.to_string());
                return;
            }
        }

        if let (Some(kbps), false) = (self.video_max_bitrate_kbps, self.bitrate_applied) {
            debug!(room = %self.room_id, kbps, "capping video bitrate");
            self.bitrate_applied = true;
            if let Some(media) = self.media.as_mut() {
                if let Err(e) = media.set_video_max_bitrate(kbps) {
                    warn!(room = %self.room_id, error = %e, "could not cap video bitrate");
                }
            }
        }
    }

    fn forward_candidate(&mut self, candidate: &IceCandidate) {
        if let Some(signaling) = self.signaling.as_mut() {
            if let Err(e) = signaling.send_local_ice_candidate(candidate) {
                self.fail_signaling(&e.to_string());
            }
        }
    }

    fn forward_removals(&mut self, candidates: &[IceCandidate]) {
        if let Some(signaling) = self.signaling.as_mut() {
            if let Err(e) = signaling.send_local_ice_candidate_removals(candidates) {
                self.fail_signaling(&e.to_string());
            }
        }
    }

    fn fail_media(&mut self, description: &str) {
        warn!(room = %self.room_id, %description, "peer connection error");
        self.disconnect();
        self.listener.on_peer_connection_error(&self.room_id);
    }

    fn fail_signaling(&mut self, description: &str) {
        warn!(room = %self.room_id, %description, "signaling send failed");
        self.disconnect();
        self.listener.on_channel_error(&self.room_id);
    }
}

/// Opens the peer connection and kicks off negotiation for a fresh room.
fn apply_room(media: &mut dyn MediaConnection, params: &RoomParameters) -> Result<()> {
    media.open(params)?;
    if params.initiator {
        media.create_offer()?;
    } else if let Some(offer) = &params.offer {
        media.set_remote_description(offer)?;
        media.create_answer()?;
    }
    for candidate in &params.candidates {
        media.add_remote_ice_candidate(candidate)?;
    }
    Ok(())
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("peer_slot", &self.peer_slot)
            .field("room_id", &self.room_id)
            .field("state", &self.state)
            .field("ice_connected", &self.ice_connected)
            .field("disconnected", &self.disconnected)
            .finish()
    }
}
