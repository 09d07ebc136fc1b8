use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use super::{RoomConnectionParameters, SignalingClient};
use crate::error::{Result, SessionError};
use crate::events::{EventSink, IceCandidate, RoomParameters, SessionDescription, SignalingEvent};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum SignalingMessage {
    Join {
        room_id: String,
        client_id: String,
    },
    Joined {
        room_id: String,
        initiator: bool,
        #[serde(default)]
        offer: Option<SessionDescription>,
        #[serde(default)]
        candidates: Vec<IceCandidate>,
        #[serde(default)]
        ice_servers: Vec<String>,
    },
    Offer {
        room_id: String,
        sdp: SessionDescription,
    },
    Answer {
        room_id: String,
        sdp: SessionDescription,
    },
    Candidate {
        room_id: String,
        candidate: IceCandidate,
    },
    RemoveCandidates {
        room_id: String,
        candidates: Vec<IceCandidate>,
    },
    Leave {
        room_id: String,
        client_id: String,
    },
    Bye {
        room_id: String,
    },
    Error {
        message: String,
    },
}

/// Joins a room on the websocket signaling server.
pub struct WebSocketSignalingClient {
    events: EventSink,
    client_id: String,
    room_id: Option<String>,
    outgoing: Option<mpsc::UnboundedSender<SignalingMessage>>,
    closed: Arc<AtomicBool>,
}

impl WebSocketSignalingClient {
    pub fn new(events: EventSink) -> Self {
        Self {
            events,
            client_id: format!("peer-{}", rand::random::<u32>()),
            room_id: None,
            outgoing: None,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn room(&self) -> Result<String> {
        self.room_id
            .clone()
            .ok_or_else(|| SessionError::Signaling("not connected to a room".to_string()))
    }

    fn send(&self, msg: SignalingMessage) -> Result<()> {
        let tx = self
            .outgoing
            .as_ref()
            .ok_or_else(|| SessionError::Signaling("not connected to a room".to_string()))?;
        tx.send(msg)
            .map_err(|e| SessionError::Signaling(format!("Failed to send message: {}", e)))
    }
}

impl SignalingClient for WebSocketSignalingClient {
    fn connect_to_room(&mut self, params: &RoomConnectionParameters) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::Signaling("client already left its room".to_string()));
        }
        if self.outgoing.is_some() {
            return Err(SessionError::Signaling("already connected to a room".to_string()));
        }
        let runtime = Handle::try_current().map_err(|e| SessionError::Signaling(e.to_string()))?;

        let room_id = params.room_id.to_string();
        let join = SignalingMessage::Join {
            room_id: room_id.clone(),
            client_id: self.client_id.clone(),
        };
        let (tx, rx) = mpsc::unbounded_channel();
        runtime.spawn(run_channel(
            params.room_url.clone(),
            join,
            rx,
            self.events.clone(),
            self.closed.clone(),
        ));

        self.room_id = Some(room_id);
        self.outgoing = Some(tx);
        Ok(())
    }

    fn send_offer_sdp(&mut self, sdp: &SessionDescription) -> Result<()> {
        let room_id = self.room()?;
        self.send(SignalingMessage::Offer {
            room_id,
            sdp: sdp.clone(),
        })
    }

    fn send_answer_sdp(&mut self, sdp: &SessionDescription) -> Result<()> {
        let room_id = self.room()?;
        self.send(SignalingMessage::Answer {
            room_id,
            sdp: sdp.clone(),
        })
    }

    fn send_local_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<()> {
        let room_id = self.room()?;
        self.send(SignalingMessage::Candidate {
            room_id,
            candidate: candidate.clone(),
        })
    }

    fn send_local_ice_candidate_removals(&mut self, candidates: &[IceCandidate]) -> Result<()> {
        let room_id = self.room()?;
        self.send(SignalingMessage::RemoveCandidates {
            room_id,
            candidates: candidates.to_vec(),
        })
    }

    fn disconnect_from_room(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Dropping the sender after the leave lets the socket task flush it and close.
        if let (Some(tx), Some(room_id)) = (self.outgoing.take(), self.room_id.take()) {
            let _ = tx.send(SignalingMessage::Leave {
                room_id,
                client_id: self.client_id.clone(),
            });
        }
    }
}

async fn run_channel(
    url: String,
    join: SignalingMessage,
    mut outgoing: mpsc::UnboundedReceiver<SignalingMessage>,
    events: EventSink,
    closed: Arc<AtomicBool>,
) {
    if let Err(e) = drive_channel(&url, join, &mut outgoing, &events, &closed).await {
        warn!(%url, error = %e, "signaling channel failed");
        report(&events, &closed, SignalingEvent::ChannelError(e.to_string()));
    }
}

async fn drive_channel(
    url: &str,
    join: SignalingMessage,
    outgoing: &mut mpsc::UnboundedReceiver<SignalingMessage>,
    events: &EventSink,
    closed: &AtomicBool,
) -> Result<()> {
    let mut pending = Vec::new();
    let connecting = connect_async(url);
    tokio::pin!(connecting);
    let ws_stream = loop {
        tokio::select! {
            connected = &mut connecting => break connected?.0,
            msg = outgoing.recv() => match msg {
                Some(SignalingMessage::Leave { .. }) | None => {
                    debug!(%url, "left before the signaling server answered");
                    return Ok(());
                }
                Some(msg) => pending.push(msg),
            },
        }
    };
    let (mut write, mut read) = ws_stream.split();
    debug!(%url, "signaling socket open");

    write.send(encode(&join)?).await?;
    for msg in &pending {
        write.send(encode(msg)?).await?;
    }

    loop {
        tokio::select! {
            msg = outgoing.recv() => match msg {
                Some(msg) => {
                    write.send(encode(&msg)?).await?;
                }
                None => {
                    let _ = write.close().await;
                    return Ok(());
                }
            },
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<SignalingMessage>(&text) {
                    Ok(signal) => {
                        if !dispatch(signal, events, closed) {
                            return Ok(());
                        }
                    }
                    Err(e) => warn!(error = %e, "ignoring malformed signaling message"),
                },
                Some(Ok(Message::Close(_))) | None => {
                    report(events, closed, SignalingEvent::ChannelClose);
                    return Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(SessionError::Ws(e)),
            },
        }
    }
}

fn encode(msg: &SignalingMessage) -> Result<Message> {
    serde_json::to_string(msg)
        .map(Message::Text)
        .map_err(|e| SessionError::Signaling(format!("Failed to encode message: {}", e)))
}

/// Translates one server message. Returns false once the room is over.
fn dispatch(msg: SignalingMessage, events: &EventSink, closed: &AtomicBool) -> bool {
    let event = match msg {
        SignalingMessage::Joined {
            initiator,
            offer,
            candidates,
            ice_servers,
            ..
        } => SignalingEvent::ConnectedToRoom(RoomParameters {
            initiator,
            offer,
            candidates,
            ice_servers,
        }),
        SignalingMessage::Offer { sdp, .. } | SignalingMessage::Answer { sdp, .. } => {
            SignalingEvent::RemoteDescription(sdp)
        }
        SignalingMessage::Candidate { candidate, .. } => SignalingEvent::RemoteIceCandidate(candidate),
        SignalingMessage::RemoveCandidates { candidates, .. } => {
            SignalingEvent::RemoteIceCandidatesRemoved(candidates)
        }
        SignalingMessage::Bye { .. } => {
            report(events, closed, SignalingEvent::ChannelClose);
            return false;
        }
        SignalingMessage::Error { message } => {
            report(events, closed, SignalingEvent::ChannelError(message));
            return false;
        }
        SignalingMessage::Join { .. } | SignalingMessage::Leave { .. } => return true,
    };
    report(events, closed, event);
    true
}

fn report(events: &EventSink, closed: &AtomicBool, event: SignalingEvent) {
    if !closed.load(Ordering::SeqCst) {
        events.signaling(event);
    }
}
