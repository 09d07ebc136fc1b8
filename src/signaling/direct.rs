//! Point-to-point signaling over a plain TCP connection.
//!
//! Used when the room id is an address. An unspecified address
//! (`0.0.0.0`, `[::]`) means "wait for the peer": this end listens and
//! becomes the initiator once somebody connects. Any other address is
//! dialed, and that end joins the room when the first offer arrives.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{direct_address, RoomConnectionParameters, SignalingClient};
use crate::error::{Result, SessionError};
use crate::events::{EventSink, IceCandidate, RoomParameters, SessionDescription, SignalingEvent};

pub const DEFAULT_DIRECT_PORT: u16 = 8888;

/// One line of JSON on the TCP link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum DirectMessage {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: IceCandidate },
    RemoveCandidates { candidates: Vec<IceCandidate> },
    Bye,
}

pub struct DirectSignalingClient {
    events: EventSink,
    outgoing: Option<mpsc::UnboundedSender<DirectMessage>>,
    closed: Arc<AtomicBool>,
}

impl DirectSignalingClient {
    pub fn new(events: EventSink) -> Self {
        Self {
            events,
            outgoing: None,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn send(&self, msg: DirectMessage) -> Result<()> {
        let tx = self
            .outgoing
            .as_ref()
            .ok_or_else(|| SessionError::Signaling("direct link not open".to_string()))?;
        tx.send(msg)
            .map_err(|e| SessionError::Signaling(format!("Failed to send message: {}", e)))
    }
}

impl SignalingClient for DirectSignalingClient {
    fn connect_to_room(&mut self, params: &RoomConnectionParameters) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::Signaling("client already left its room".to_string()));
        }
        if self.outgoing.is_some() {
            return Err(SessionError::Signaling("direct link already open".to_string()));
        }
        let addr = direct_address(params.room_id.as_str()).ok_or_else(|| {
            SessionError::Signaling(format!("room {} is not an address", params.room_id))
        })?;
        let runtime = Handle::try_current().map_err(|e| SessionError::Signaling(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        runtime.spawn(run_link(addr, rx, self.events.clone(), self.closed.clone()));
        self.outgoing = Some(tx);
        Ok(())
    }

    fn send_offer_sdp(&mut self, sdp: &SessionDescription) -> Result<()> {
        self.send(DirectMessage::Offer { sdp: sdp.sdp.clone() })
    }

    fn send_answer_sdp(&mut self, sdp: &SessionDescription) -> Result<()> {
        self.send(DirectMessage::Answer { sdp: sdp.sdp.clone() })
    }

    fn send_local_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<()> {
        self.send(DirectMessage::Candidate {
            candidate: candidate.clone(),
        })
    }

    fn send_local_ice_candidate_removals(&mut self, candidates: &[IceCandidate]) -> Result<()> {
        self.send(DirectMessage::RemoveCandidates {
            candidates: candidates.to_vec(),
        })
    }

    fn disconnect_from_room(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self.outgoing.take() {
            let _ = tx.send(DirectMessage::Bye);
        }
    }
}

async fn run_link(
    addr: SocketAddr,
    mut outgoing: mpsc::UnboundedReceiver<DirectMessage>,
    events: EventSink,
    closed: Arc<AtomicBool>,
) {
    if let Err(e) = drive_link(addr, &mut outgoing, &events, &closed).await {
        warn!(%addr, error = %e, "direct signaling link failed");
        report(&events, &closed, SignalingEvent::ChannelError(e.to_string()));
    }
}

async fn drive_link(
    addr: SocketAddr,
    outgoing: &mut mpsc::UnboundedReceiver<DirectMessage>,
    events: &EventSink,
    closed: &AtomicBool,
) -> anyhow::Result<()> {
    let listening = addr.ip().is_unspecified();
    let mut pending = Vec::new();
    let stream = if listening {
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "waiting for direct peer");
        let Some((stream, remote)) = unless_left(listener.accept(), outgoing, &mut pending).await? else {
            debug!(%addr, "left before a peer connected");
            return Ok(());
        };
        debug!(%remote, "direct peer connected");
        report(
            events,
            closed,
            SignalingEvent::ConnectedToRoom(RoomParameters {
                initiator: true,
                ..RoomParameters::default()
            }),
        );
        stream
    } else {
        let Some(stream) = unless_left(TcpStream::connect(addr), outgoing, &mut pending).await? else {
            debug!(%addr, "left before the peer answered");
            return Ok(());
        };
        stream
    };

    let (read, mut write) = stream.into_split();
    for msg in pending {
        write_line(&mut write, &msg).await?;
    }
    let mut lines = BufReader::new(read).lines();
    let mut joined = listening;
    // Candidates that show up before the offer ride along with the join.
    let mut early_candidates = Vec::new();

    loop {
        tokio::select! {
            msg = outgoing.recv() => match msg {
                Some(msg) => {
                    write_line(&mut write, &msg).await?;
                    if msg == DirectMessage::Bye {
                        return Ok(());
                    }
                }
                None => return Ok(()),
            },
            line = lines.next_line() => match line? {
                Some(line) => {
                    let msg = match serde_json::from_str::<DirectMessage>(&line) {
                        Ok(msg) => msg,
                        Err(e) => {
                            warn!(error = %e, "ignoring malformed direct message");
                            continue;
                        }
                    };
                    let event = match msg {
                        DirectMessage::Offer { sdp } if !joined => {
                            joined = true;
                            SignalingEvent::ConnectedToRoom(RoomParameters {
                                initiator: false,
                                offer: Some(SessionDescription::offer(sdp)),
                                candidates: std::mem::take(&mut early_candidates),
                                ice_servers: Vec::new(),
                            })
                        }
                        DirectMessage::Offer { sdp } => {
                            SignalingEvent::RemoteDescription(SessionDescription::offer(sdp))
                        }
                        DirectMessage::Answer { sdp } => {
                            SignalingEvent::RemoteDescription(SessionDescription::answer(sdp))
                        }
                        DirectMessage::Candidate { candidate } if !joined => {
                            early_candidates.push(candidate);
                            continue;
                        }
                        DirectMessage::Candidate { candidate } => SignalingEvent::RemoteIceCandidate(candidate),
                        DirectMessage::RemoveCandidates { candidates } => {
                            SignalingEvent::RemoteIceCandidatesRemoved(candidates)
                        }
                        DirectMessage::Bye => {
                            report(events, closed, SignalingEvent::ChannelClose);
                            return Ok(());
                        }
                    };
                    report(events, closed, event);
                }
                None => {
                    report(events, closed, SignalingEvent::ChannelClose);
                    return Ok(());
                }
            },
        }
    }
}

/// Waits for the link to come up, unless the client leaves first. Messages
/// queued in the meantime are collected into `pending`.
async fn unless_left<T>(
    connecting: impl Future<Output = std::io::Result<T>>,
    outgoing: &mut mpsc::UnboundedReceiver<DirectMessage>,
    pending: &mut Vec<DirectMessage>,
) -> anyhow::Result<Option<T>> {
    tokio::pin!(connecting);
    loop {
        tokio::select! {
            result = &mut connecting => return Ok(Some(result?)),
            msg = outgoing.recv() => match msg {
                Some(DirectMessage::Bye) | None => return Ok(None),
                Some(msg) => pending.push(msg),
            },
        }
    }
}

async fn write_line(write: &mut OwnedWriteHalf, msg: &DirectMessage) -> anyhow::Result<()> {
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    write.write_all(line.as_bytes()).await?;
    Ok(())
}

fn report(events: &EventSink, closed: &AtomicBool, event: SignalingEvent) {
    if !closed.load(Ordering::SeqCst) {
        events.signaling(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CallEvent;
    use crate::pairing::RoomId;
    use std::time::Duration;

    #[test]
    fn wire_form() {
        let line = serde_json::to_string(&DirectMessage::RemoveCandidates { candidates: vec![] }).unwrap();
        assert_eq!(line, r#"{"type":"remove-candidates","candidates":[]}"#);
        assert_eq!(serde_json::to_string(&DirectMessage::Bye).unwrap(), r#"{"type":"bye"}"#);
    }

    #[tokio::test]
    async fn dialer_joins_on_first_offer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let peer = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let lines = [
                DirectMessage::Candidate {
                    candidate: IceCandidate {
                        candidate: "candidate:1".to_string(),
                        sdp_mid: Some("0".to_string()),
                        sdp_mline_index: Some(0),
                    },
                },
                DirectMessage::Offer { sdp: "v=0".to_string() },
                DirectMessage::Bye,
            ];
            for msg in lines {
                let mut line = serde_json::to_string(&msg).unwrap();
                line.push('\n');
                stream.write_all(line.as_bytes()).await.unwrap();
            }
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut client = DirectSignalingClient::new(EventSink::new(3, tx));
        client
            .connect_to_room(&RoomConnectionParameters {
                room_url: String::new(),
                room_id: RoomId::new(addr.to_string()),
                loopback: false,
            })
            .unwrap();

        match rx.recv().await.unwrap() {
            CallEvent::Signaling {
                event: SignalingEvent::ConnectedToRoom(params),
                ..
            } => {
                assert!(!params.initiator);
                assert_eq!(params.offer, Some(SessionDescription::offer("v=0")));
                assert_eq!(params.candidates.len(), 1);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(
            rx.recv().await.unwrap(),
            CallEvent::Signaling {
                event: SignalingEvent::ChannelClose,
                ..
            }
        ));

        peer.await.unwrap();
    }

    #[tokio::test]
    async fn leaving_while_listening_frees_the_port() {
        let port = std::net::TcpListener::bind("0.0.0.0:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        let (tx, _rx) = mpsc::unbounded_channel();
        let mut client = DirectSignalingClient::new(EventSink::new(1, tx));
        client
            .connect_to_room(&RoomConnectionParameters {
                room_url: String::new(),
                room_id: RoomId::new(format!("0.0.0.0:{}", port)),
                loopback: false,
            })
            .unwrap();

        let mut bound = false;
        for _ in 0..50 {
            if std::net::TcpListener::bind(("0.0.0.0", port)).is_err() {
                bound = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(bound, "client never started listening");

        client.disconnect_from_room();
        drop(client);

        let mut released = false;
        for _ in 0..50 {
            if std::net::TcpListener::bind(("0.0.0.0", port)).is_ok() {
                released = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(released, "port {} still held after leaving", port);
    }
}
