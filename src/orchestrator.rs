//! Call-level coordination of all peer sessions.
//!
//! The orchestrator owns every session of the call and is the only code
//! that touches them. Collaborator events and controller commands are both
//! queued, and a single control loop applies them one at a time.

use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::config::CallConfig;
use crate::error::{OrchestratorError, SetupError};
use crate::events::{CallEvent, EventSink};
use crate::listener::{CallLifecycleListener, GuardedListener};
use crate::media::{CaptureFormat, MediaFactory, MediaParameters, RenderTargets};
use crate::monitor::{CallMonitor, CallStatus, PeerStatus};
use crate::pairing::{peer_rooms, PeerRoom, RoomId};
use crate::session::{Session, SessionOptions, SessionState};
use crate::session_set::{SessionFailure, SessionSet};
use crate::signaling::SignalingFactory;

const COMMAND_BUFFER: usize = 32;

/// Collaborator factories shared by every session of a call.
#[derive(Clone)]
pub struct CallFactories {
    pub signaling: Arc<dyn SignalingFactory>,
    pub media: Arc<dyn MediaFactory>,
}

/// A peer whose session could not be built.
#[derive(Debug)]
pub struct SetupFailure {
    pub peer_slot: u32,
    pub room_id: RoomId,
    pub error: SetupError,
}

/// What is left of a call once its control loop returns.
#[derive(Debug)]
pub struct CallSummary {
    pub ever_connected: bool,
    pub setup_failures: Vec<SetupFailure>,
    pub peers: Vec<PeerStatus>,
}

/// Requests from the call controller to the control loop.
#[derive(Debug)]
pub enum CallCommand {
    ConnectToAll {
        respond_to: oneshot::Sender<Vec<SessionFailure>>,
    },
    StopCapture {
        respond_to: oneshot::Sender<Vec<SessionFailure>>,
    },
    ResumeCapture {
        respond_to: oneshot::Sender<Vec<SessionFailure>>,
    },
    SetAudioEnabled {
        enabled: bool,
        respond_to: oneshot::Sender<Vec<SessionFailure>>,
    },
    ChangeCaptureFormat {
        format: CaptureFormat,
        respond_to: oneshot::Sender<Vec<SessionFailure>>,
    },
    HangUp {
        respond_to: oneshot::Sender<()>,
    },
    GetStatus {
        respond_to: oneshot::Sender<CallStatus>,
    },
}

/// Cloneable handle the call controller uses to drive a running call.
#[derive(Clone)]
pub struct OrchestratorHandle {
    sender: mpsc::Sender<CallCommand>,
}

impl OrchestratorHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> CallCommand,
    ) -> Result<T, OrchestratorError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(command(tx))
            .await
            .map_err(|_| OrchestratorError::Closed)?;
        rx.await.map_err(|_| OrchestratorError::Closed)
    }

    pub async fn connect_to_all(&self) -> Result<Vec<SessionFailure>, OrchestratorError> {
        self.request(|respond_to| CallCommand::ConnectToAll { respond_to })
            .await
    }

    pub async fn stop_capture(&self) -> Result<Vec<SessionFailure>, OrchestratorError> {
        self.request(|respond_to| CallCommand::StopCapture { respond_to })
            .await
    }

    pub async fn resume_capture(&self) -> Result<Vec<SessionFailure>, OrchestratorError> {
        self.request(|respond_to| CallCommand::ResumeCapture { respond_to })
            .await
    }

    pub async fn set_audio_enabled(&self, enabled: bool) -> Result<Vec<SessionFailure>, OrchestratorError> {
        self.request(|respond_to| CallCommand::SetAudioEnabled { enabled, respond_to })
            .await
    }

    pub async fn change_capture_format(
        &self,
        format: CaptureFormat,
    ) -> Result<Vec<SessionFailure>, OrchestratorError> {
        self.request(|respond_to| CallCommand::ChangeCaptureFormat { format, respond_to })
            .await
    }

    pub async fn hang_up(&self) -> Result<(), OrchestratorError> {
        self.request(|respond_to| CallCommand::HangUp { respond_to }).await
    }

    pub async fn status(&self) -> Result<CallStatus, OrchestratorError> {
        self.request(|respond_to| CallCommand::GetStatus { respond_to })
            .await
    }

    pub async fn all_disconnected(&self) -> Result<bool, OrchestratorError> {
        let status = self.status().await?;
        Ok(status
            .peers
            .iter()
            .all(|p| p.state == SessionState::Disconnected))
    }
}

pub struct Orchestrator {
    sessions: SessionSet,
    events: mpsc::UnboundedReceiver<CallEvent>,
    event_tx: mpsc::UnboundedSender<CallEvent>,
    commands: mpsc::Receiver<CallCommand>,
    media_factory: Arc<dyn MediaFactory>,
    monitor: CallMonitor,
    setup_failures: Vec<SetupFailure>,
    negotiation_timeout: Option<Duration>,
    ever_connected: bool,
    ended: bool,
}

impl Orchestrator {
    /// Derives the pairwise rooms for this participant and builds one
    /// session per peer.
    ///
    /// A peer whose collaborators fail to construct is left out and
    /// recorded; the call goes ahead with the rest. An out-of-range slot,
    /// or a call where no session could be built, is an error.
    pub fn setup<F>(
        config: &CallConfig,
        factories: CallFactories,
        listener: Arc<dyn CallLifecycleListener>,
        mut render_targets: F,
    ) -> Result<(Self, OrchestratorHandle), SetupError>
    where
        F: FnMut(&PeerRoom) -> RenderTargets,
    {
        config.validate()?;
        let rooms = peer_rooms(&config.room_id, config.slot, config.total_slots)?;

        let listener: Arc<dyn CallLifecycleListener> = Arc::new(GuardedListener::new(listener));
        let options = SessionOptions {
            room_url: config.signaling_url.clone(),
            loopback: config.loopback,
            screencast: config.screencast,
            video_max_bitrate_kbps: config.video_max_bitrate_kbps,
            media: MediaParameters {
                ice_servers: config.ice_servers.clone(),
                capture: config.capture,
                audio_enabled: config.audio_enabled,
            },
        };

        let (event_tx, events) = mpsc::unbounded_channel();
        let mut sessions = Vec::with_capacity(rooms.len());
        let mut setup_failures = Vec::new();

        for peer in &rooms {
            let created = Session::create(
                peer,
                &options,
                render_targets(peer),
                factories.signaling.as_ref(),
                factories.media.as_ref(),
                listener.clone(),
                EventSink::new(peer.peer_slot, event_tx.clone()),
            );
            match created {
                Ok(session) => sessions.push(session),
                Err(error) => {
                    warn!(room = %peer.room_id, error = %error, "peer session setup failed");
                    setup_failures.push(SetupFailure {
                        peer_slot: peer.peer_slot,
                        room_id: peer.room_id.clone(),
                        error,
                    });
                }
            }
        }

        if sessions.is_empty() {
            factories.media.shutdown();
            return Err(SetupError::NoSessions);
        }

        info!(
            room = %config.room_id,
            slot = config.slot,
            peers = sessions.len(),
            failed = setup_failures.len(),
            "mesh call set up"
        );

        let sessions = SessionSet::new(sessions);
        let monitor = CallMonitor::new();
        monitor.publish(CallStatus::from_sessions(&sessions, false));

        let (command_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let orchestrator = Self {
            sessions,
            events,
            event_tx,
            commands,
            media_factory: factories.media,
            monitor,
            setup_failures,
            negotiation_timeout: config.negotiation_timeout(),
            ever_connected: false,
            ended: false,
        };
        Ok((orchestrator, OrchestratorHandle { sender: command_tx }))
    }

    pub fn sessions(&self) -> &SessionSet {
        &self.sessions
    }

    pub fn monitor(&self) -> &CallMonitor {
        &self.monitor
    }

    pub fn setup_failures(&self) -> &[SetupFailure] {
        &self.setup_failures
    }

    pub fn all_disconnected(&self) -> bool {
        self.sessions.all_disconnected()
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn connect_to_all(&mut self) -> Vec<SessionFailure> {
        let failures = self.sessions.connect_to_all();
        if let Some(timeout) = self.negotiation_timeout {
            self.arm_negotiation_timers(timeout);
        }
        self.after_change();
        failures
    }

    pub fn stop_capture(&mut self) -> Vec<SessionFailure> {
        self.sessions.on_stop()
    }

    pub fn resume_capture(&mut self) -> Vec<SessionFailure> {
        self.sessions.on_start()
    }

    pub fn set_audio_enabled(&mut self, enabled: bool) -> Vec<SessionFailure> {
        self.sessions.set_audio_enabled(enabled)
    }

    pub fn change_capture_format(&mut self, format: CaptureFormat) -> Vec<SessionFailure> {
        self.sessions.change_capture_format(format)
    }

    pub fn hang_up(&mut self) {
        info!("hanging up");
        self.sessions.disconnect_all();
        self.after_change();
    }

    /// Applies one collaborator event to its session.
    pub fn dispatch(&mut self, event: CallEvent) {
        let peer_slot = event.peer_slot();
        let Some(session) = self.sessions.get_mut(peer_slot) else {
            warn!(peer = peer_slot, "event for unknown peer dropped");
            return;
        };

        match event {
            CallEvent::Signaling { event, .. } => session.handle_signaling(event),
            CallEvent::Media { event, .. } => session.handle_media(event),
            CallEvent::NegotiationTimeout { .. } => session.handle_negotiation_timeout(),
        }
        if session.is_ice_connected() {
            self.ever_connected = true;
        }
        self.after_change();
    }

    /// Runs the control loop until every session has ended, either through
    /// peer failures or a hang-up.
    pub async fn run(mut self) -> CallSummary {
        while !self.ended {
            tokio::select! {
                Some(event) = self.events.recv() => self.dispatch(event),
                command = self.commands.recv() => match command {
                    Some(command) => self.execute(command),
                    None => {
                        info!("call controller went away");
                        self.hang_up();
                    }
                },
            }
        }
        self.into_summary()
    }

    fn execute(&mut self, command: CallCommand) {
        match command {
            CallCommand::ConnectToAll { respond_to } => {
                let _ = respond_to.send(self.connect_to_all());
            }
            CallCommand::StopCapture { respond_to } => {
                let _ = respond_to.send(self.stop_capture());
            }
            CallCommand::ResumeCapture { respond_to } => {
                let _ = respond_to.send(self.resume_capture());
            }
            CallCommand::SetAudioEnabled { enabled, respond_to } => {
                let _ = respond_to.send(self.set_audio_enabled(enabled));
            }
            CallCommand::ChangeCaptureFormat { format, respond_to } => {
                let _ = respond_to.send(self.change_capture_format(format));
            }
            CallCommand::HangUp { respond_to } => {
                self.hang_up();
                let _ = respond_to.send(());
            }
            CallCommand::GetStatus { respond_to } => {
                let _ = respond_to.send(self.monitor.current());
            }
        }
    }

    fn after_change(&mut self) {
        if !self.ended && self.sessions.all_disconnected() {
            self.end_call();
        }
        self.monitor
            .publish(CallStatus::from_sessions(&self.sessions, self.ended));
    }

    /// Runs once, when the last peer session is gone.
    fn end_call(&mut self) {
        self.ended = true;
        self.sessions.disconnect_all();
        self.media_factory.shutdown();
        if self.ever_connected {
            info!("all peer sessions disconnected, call ended");
        } else {
            warn!("call ended without any peer connecting");
        }
    }

    /// Timers need a runtime. Without one the call runs with no local
    /// deadline.
    fn arm_negotiation_timers(&self, timeout: Duration) {
        let Ok(runtime) = Handle::try_current() else {
            warn!(?timeout, "no async runtime, negotiation timeout not armed");
            return;
        };
        for session in self
            .sessions
            .iter()
            .filter(|s| s.state() == SessionState::Joining)
        {
            let sink = EventSink::new(session.peer_slot(), self.event_tx.clone());
            runtime.spawn(async move {
                tokio::time::sleep(timeout).await;
                sink.negotiation_timeout();
            });
        }
    }

    fn into_summary(self) -> CallSummary {
        CallSummary {
            ever_connected: self.ever_connected,
            peers: CallStatus::from_sessions(&self.sessions, self.ended).peers,
            setup_failures: self.setup_failures,
        }
    }
}
