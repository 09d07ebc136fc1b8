use anyhow::Context;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use mesh_call::media::{FrameSink, MediaFrame, ProxySink, RenderTargets, RtcMediaFactory};
use mesh_call::signaling::DefaultSignalingFactory;
use mesh_call::{
    CallConfig, CallFactories, CallLifecycleListener, CallState, Orchestrator, OrchestratorError,
    OrchestratorHandle, RoomId, SessionFailure,
};

/// Reports lifecycle callbacks to the log.
struct LoggingListener;

impl CallLifecycleListener for LoggingListener {
    fn on_connection_established(&self, room: &RoomId) {
        info!(%room, "peer connected");
    }

    fn on_channel_close(&self, room: &RoomId) {
        info!(%room, "peer left the call");
    }

    fn on_channel_error(&self, room: &RoomId) {
        warn!(%room, "signaling failed for peer");
    }

    fn on_ice_disconnected(&self, room: &RoomId) {
        warn!(%room, "lost media path to peer");
    }

    fn on_peer_connection_error(&self, room: &RoomId) {
        warn!(%room, "peer connection failed");
    }
}

/// Counts rendered frames in place of a video surface.
struct FrameCounter {
    label: String,
    frames: std::sync::atomic::AtomicU64,
}

impl FrameSink for FrameCounter {
    fn on_frame(&self, frame: &MediaFrame) {
        let n = self.frames.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
        if n == 1 {
            info!(sink = %self.label, kind = ?frame.kind, "first frame rendered");
        }
    }
}

fn counter(label: String) -> Arc<dyn FrameSink> {
    Arc::new(FrameCounter {
        label,
        frames: Default::default(),
    })
}

fn report(op: &str, failures: Vec<SessionFailure>) {
    for failure in failures {
        warn!(op, room = %failure.room_id, error = %failure.error, "peer did not apply command");
    }
}

/// Joins every room and applies the initial mic state. The loop may end in
/// between when no peer can be joined.
async fn start(handle: &OrchestratorHandle, audio_enabled: bool) -> Result<(), OrchestratorError> {
    report("connect", handle.connect_to_all().await?);
    report("audio", handle.set_audio_enabled(audio_enabled).await?);
    Ok(())
}

/// Line commands on stdin: `mute`, `unmute`, `stop`, `resume`, `status`,
/// `quit`.
async fn control(handle: OrchestratorHandle) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "mute" => report("mute", handle.set_audio_enabled(false).await?),
            "unmute" => report("unmute", handle.set_audio_enabled(true).await?),
            "stop" => report("stop", handle.stop_capture().await?),
            "resume" => report("resume", handle.resume_capture().await?),
            "status" => {
                let status = handle.status().await?;
                info!(
                    state = %status.state,
                    connected = status.connected_peers(),
                    peers = status.peers.len(),
                    "call status"
                );
            }
            "quit" => {
                handle.hang_up().await?;
                break;
            }
            "" => {}
            other => warn!(command = other, "unknown command"),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "mesh_call=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = CallConfig::from_env().context("reading call configuration")?;
    info!(room = %config.room_id, slot = config.slot, total = config.total_slots, "starting mesh call");

    let media = Arc::new(RtcMediaFactory::new().context("initializing media engine")?);
    let factories = CallFactories {
        signaling: Arc::new(DefaultSignalingFactory),
        media: media.clone(),
    };

    let local_preview = Arc::new(ProxySink::new());
    local_preview.set_target(Some(counter("local".to_string())));
    let mut remote_views: Vec<Arc<ProxySink>> = Vec::new();

    let (orchestrator, handle) = Orchestrator::setup(&config, factories, Arc::new(LoggingListener), |peer| {
        let remote = Arc::new(ProxySink::new());
        remote.set_target(Some(counter(format!("peer-{}", peer.peer_slot))));
        remote_views.push(remote.clone());
        RenderTargets {
            local: local_preview.clone(),
            remote,
        }
    })?;

    for failure in orchestrator.setup_failures() {
        warn!(room = %failure.room_id, error = %failure.error, "peer left out of the call");
    }

    let mut status = orchestrator.monitor().subscribe();
    let call = tokio::spawn(orchestrator.run());

    if let Err(OrchestratorError::Closed) = start(&handle, config.audio_enabled).await {
        info!("call ended while starting");
    }

    let controller = tokio::spawn(control(handle.clone()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, hanging up");
            if handle.hang_up().await.is_err() {
                info!("call already ended");
            }
        }
        _ = status.wait_for(|s| s.state == CallState::Ended) => {}
    }

    let summary = call.await.context("call control loop panicked")?;
    controller.abort();

    local_preview.set_target(None);
    for view in &remote_views {
        view.set_target(None);
    }

    if summary.ever_connected {
        info!(peers = summary.peers.len(), "call finished");
    } else {
        warn!(
            peers = summary.peers.len(),
            setup_failures = summary.setup_failures.len(),
            "call finished without connecting to any peer"
        );
    }
    Ok(())
}
