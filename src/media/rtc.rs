use anyhow::anyhow;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::{
    CaptureFormat, FrameSink, MediaConnection, MediaFactory, MediaFrame, MediaParameters, RenderTargets, TrackKind,
};
use crate::error::{Result, SessionError};
use crate::events::{EventSink, IceCandidate, MediaEvent, RoomParameters, SdpKind, SessionDescription};

/// Capture settings shared between a connection and the capture device.
///
/// The connection only records them. The capture and encoder layer that
/// feeds [`LocalFeed::write`] is expected to read the format and bitrate cap
/// and encode accordingly.
#[derive(Debug)]
pub struct CaptureState {
    video_running: AtomicBool,
    audio_enabled: AtomicBool,
    format: Mutex<CaptureFormat>,
    /// Zero means no cap.
    max_bitrate_kbps: AtomicU32,
}

impl CaptureState {
    fn new(params: &MediaParameters) -> Self {
        Self {
            video_running: AtomicBool::new(true),
            audio_enabled: AtomicBool::new(params.audio_enabled),
            format: Mutex::new(params.capture),
            max_bitrate_kbps: AtomicU32::new(0),
        }
    }

    pub fn is_video_running(&self) -> bool {
        self.video_running.load(Ordering::SeqCst)
    }

    pub fn is_audio_enabled(&self) -> bool {
        self.audio_enabled.load(Ordering::SeqCst)
    }

    pub fn format(&self) -> CaptureFormat {
        *self.format.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn max_bitrate_kbps(&self) -> Option<u32> {
        match self.max_bitrate_kbps.load(Ordering::SeqCst) {
            0 => None,
            kbps => Some(kbps),
        }
    }
}

/// Entry point for locally captured media into one peer connection.
///
/// Mute and pause are enforced here. Format and bitrate are advisory, see
/// [`CaptureState`].
#[derive(Clone)]
pub struct LocalFeed {
    audio: Arc<TrackLocalStaticSample>,
    video: Arc<TrackLocalStaticSample>,
    capture: Arc<CaptureState>,
    preview: Arc<dyn FrameSink>,
}

impl LocalFeed {
    pub fn capture(&self) -> &CaptureState {
        &self.capture
    }

    /// Writes one encoded sample. Returns `false` when the source is
    /// currently muted or paused and the sample was dropped.
    pub async fn write(&self, kind: TrackKind, data: Bytes, duration: Duration) -> anyhow::Result<bool> {
        let track = match kind {
            TrackKind::Audio if !self.capture.is_audio_enabled() => return Ok(false),
            TrackKind::Video if !self.capture.is_video_running() => return Ok(false),
            TrackKind::Audio => &self.audio,
            TrackKind::Video => {
                self.preview.on_frame(&MediaFrame {
                    kind,
                    timestamp: 0,
                    payload: data.clone(),
                });
                &self.video
            }
        };
        track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await?;
        Ok(true)
    }
}

/// Owns the process-wide webrtc API object.
pub struct RtcMediaFactory {
    api: Mutex<Option<Arc<API>>>,
    feeds: Mutex<Vec<LocalFeed>>,
}

impl RtcMediaFactory {
    pub fn new() -> anyhow::Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api: Mutex::new(Some(Arc::new(api))),
            feeds: Mutex::new(Vec::new()),
        })
    }

    /// Feeds of every connection created so far, for fanning one capture
    /// device out to all peers.
    pub fn local_feeds(&self) -> Vec<LocalFeed> {
        self.feeds.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.api.lock().unwrap_or_else(PoisonError::into_inner).is_none()
    }
}

impl MediaFactory for RtcMediaFactory {
    fn create(
        &self,
        params: &MediaParameters,
        targets: RenderTargets,
        events: EventSink,
    ) -> anyhow::Result<Box<dyn MediaConnection>> {
        let api = self
            .api
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| anyhow!("media engine has been shut down"))?;

        let connection = RtcMediaConnection::new(api, params, targets, events)?;
        self.feeds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(connection.local_feed());
        Ok(Box::new(connection))
    }

    fn shutdown(&self) {
        if self.api.lock().unwrap_or_else(PoisonError::into_inner).take().is_some() {
            info!("media engine released");
        }
        self.feeds.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

enum RtcCommand {
    Open(RoomParameters),
    CreateOffer,
    CreateAnswer,
    SetRemoteDescription(SessionDescription),
    AddIceCandidate(IceCandidate),
    Close,
}

/// One peer connection. Operations are queued to a worker task that owns
/// the `RTCPeerConnection`, so they run in the order they were issued.
pub struct RtcMediaConnection {
    commands: mpsc::UnboundedSender<RtcCommand>,
    feed: LocalFeed,
    closed: bool,
}

impl RtcMediaConnection {
    pub fn new(
        api: Arc<API>,
        params: &MediaParameters,
        targets: RenderTargets,
        events: EventSink,
    ) -> anyhow::Result<Self> {
        let runtime = Handle::try_current()?;

        let audio = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            "mesh-call".to_owned(),
        ));
        let video = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            "mesh-call".to_owned(),
        ));

        let feed = LocalFeed {
            audio: audio.clone(),
            video: video.clone(),
            capture: Arc::new(CaptureState::new(params)),
            preview: targets.local.clone(),
        };

        let worker = RtcWorker {
            api,
            ice_servers: params.ice_servers.clone(),
            events,
            remote: targets.remote,
            audio,
            video,
            peer_connection: None,
        };
        let (commands, rx) = mpsc::unbounded_channel();
        runtime.spawn(worker.run(rx));

        Ok(Self {
            commands,
            feed,
            closed: false,
        })
    }

    pub fn local_feed(&self) -> LocalFeed {
        self.feed.clone()
    }

    fn enqueue(&self, command: RtcCommand) -> Result<()> {
        if self.closed {
            return Err(SessionError::Media("peer connection closed".to_string()));
        }
        self.commands
            .send(command)
            .map_err(|_| SessionError::Media("peer connection worker stopped".to_string()))
    }
}

impl MediaConnection for RtcMediaConnection {
    fn open(&mut self, room: &RoomParameters) -> Result<()> {
        self.enqueue(RtcCommand::Open(room.clone()))
    }

    fn create_offer(&mut self) -> Result<()> {
        self.enqueue(RtcCommand::CreateOffer)
    }

    fn create_answer(&mut self) -> Result<()> {
        self.enqueue(RtcCommand::CreateAnswer)
    }

    fn set_remote_description(&mut self, sdp: &SessionDescription) -> Result<()> {
        self.enqueue(RtcCommand::SetRemoteDescription(sdp.clone()))
    }

    fn add_remote_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<()> {
        self.enqueue(RtcCommand::AddIceCandidate(candidate.clone()))
    }

    fn remove_remote_ice_candidates(&mut self, candidates: &[IceCandidate]) -> Result<()> {
        // webrtc-rs cannot withdraw remote candidates; stale ones simply fail their checks.
        debug!(count = candidates.len(), "ignoring remote candidate removal");
        Ok(())
    }

    fn set_video_max_bitrate(&mut self, kbps: u32) -> Result<()> {
        self.feed.capture.max_bitrate_kbps.store(kbps, Ordering::SeqCst);
        Ok(())
    }

    fn start_video_source(&mut self) -> Result<()> {
        self.feed.capture.video_running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop_video_source(&mut self) -> Result<()> {
        self.feed.capture.video_running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn change_capture_format(&mut self, format: CaptureFormat) -> Result<()> {
        *self.feed.capture.format.lock().unwrap_or_else(PoisonError::into_inner) = format;
        Ok(())
    }

    fn set_audio_enabled(&mut self, enabled: bool) -> Result<()> {
        self.feed.capture.audio_enabled.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        let _ = self.commands.send(RtcCommand::Close);
        self.closed = true;
    }
}

struct RtcWorker {
    api: Arc<API>,
    ice_servers: Vec<String>,
    events: EventSink,
    remote: Arc<dyn FrameSink>,
    audio: Arc<TrackLocalStaticSample>,
    video: Arc<TrackLocalStaticSample>,
    peer_connection: Option<Arc<RTCPeerConnection>>,
}

impl RtcWorker {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<RtcCommand>) {
        while let Some(command) = commands.recv().await {
            let closing = matches!(command, RtcCommand::Close);
            if let Err(e) = self.handle(command).await {
                warn!(peer = self.events.peer_slot(), error = %e, "peer connection operation failed");
                if !closing {
                    self.events.media(MediaEvent::PeerConnectionError(e.to_string()));
                }
            }
            if closing {
                break;
            }
        }
        debug!(peer = self.events.peer_slot(), "peer connection worker finished");
    }

    async fn handle(&mut self, command: RtcCommand) -> Result<()> {
        match command {
            RtcCommand::Open(room) => self.open(room).await?,
            RtcCommand::CreateOffer => {
                let pc = self.peer_connection()?;
                let offer = pc.create_offer(None).await?;
                pc.set_local_description(offer.clone()).await?;
                self.events
                    .media(MediaEvent::LocalDescription(SessionDescription::offer(offer.sdp)));
            }
            RtcCommand::CreateAnswer => {
                let pc = self.peer_connection()?;
                let answer = pc.create_answer(None).await?;
                pc.set_local_description(answer.clone()).await?;
                self.events
                    .media(MediaEvent::LocalDescription(SessionDescription::answer(answer.sdp)));
            }
            RtcCommand::SetRemoteDescription(sdp) => {
                let pc = self.peer_connection()?;
                let description = match sdp.kind {
                    SdpKind::Offer => RTCSessionDescription::offer(sdp.sdp)?,
                    SdpKind::Answer => RTCSessionDescription::answer(sdp.sdp)?,
                };
                pc.set_remote_description(description).await?;
            }
            RtcCommand::AddIceCandidate(candidate) => {
                let pc = self.peer_connection()?;
                pc.add_ice_candidate(RTCIceCandidateInit {
                    candidate: candidate.candidate,
                    sdp_mid: candidate.sdp_mid,
                    sdp_mline_index: candidate.sdp_mline_index,
                    username_fragment: None,
                })
                .await?;
            }
            RtcCommand::Close => {
                if let Some(pc) = self.peer_connection.take() {
                    pc.close().await?;
                }
            }
        }
        Ok(())
    }

    fn peer_connection(&self) -> Result<Arc<RTCPeerConnection>> {
        self.peer_connection
            .clone()
            .ok_or_else(|| SessionError::Media("peer connection not open".to_string()))
    }

    async fn open(&mut self, room: RoomParameters) -> Result<()> {
        if self.peer_connection.is_some() {
            return Err(SessionError::Media("peer connection already open".to_string()));
        }

        let mut urls = self.ice_servers.clone();
        for url in room.ice_servers {
            if !urls.contains(&url) {
                urls.push(url);
            }
        }
        let ice_servers = if urls.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls,
                ..Default::default()
            }]
        };

        let pc = Arc::new(
            self.api
                .new_peer_connection(RTCConfiguration {
                    ice_servers,
                    ..Default::default()
                })
                .await?,
        );

        for track in [self.audio.clone(), self.video.clone()] {
            let sender = pc
                .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
            // RTCP has to be drained for the interceptors to keep working.
            tokio::spawn(async move {
                let mut rtcp_buf = vec![0u8; 1500];
                while let Ok((_, _)) = sender.read(&mut rtcp_buf).await {}
            });
        }

        let events = self.events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => events.media(MediaEvent::IceCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    })),
                    Err(e) => warn!(error = %e, "could not serialize local candidate"),
                }
            })
        }));

        let events = self.events.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            debug!(peer = events.peer_slot(), %state, "ICE connection state changed");
            let event = match state {
                RTCIceConnectionState::Connected => Some(MediaEvent::IceConnected),
                RTCIceConnectionState::Disconnected | RTCIceConnectionState::Failed => {
                    Some(MediaEvent::IceDisconnected)
                }
                RTCIceConnectionState::Closed => Some(MediaEvent::PeerConnectionClosed),
                _ => None,
            };
            if let Some(event) = event {
                events.media(event);
            }
            Box::pin(async {})
        }));

        let remote = self.remote.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let remote = remote.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    _ => TrackKind::Video,
                };
                tokio::spawn(async move {
                    while let Ok((packet, _)) = track.read_rtp().await {
                        remote.on_frame(&MediaFrame {
                            kind,
                            timestamp: packet.header.timestamp,
                            payload: packet.payload,
                        });
                    }
                });
            })
        }));

        self.peer_connection = Some(pc);
        Ok(())
    }
}
