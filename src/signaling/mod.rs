//! Signaling collaborators.
//!
//! A signaling client joins one pairwise room and carries descriptions and
//! candidates to the peer on the other side. Two transports exist: a
//! websocket relay for named rooms and a direct TCP link when the room
//! name is itself a network address.

mod direct;
mod websocket;

pub use direct::{DirectMessage, DirectSignalingClient, DEFAULT_DIRECT_PORT};
pub use websocket::{SignalingMessage, WebSocketSignalingClient};

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::Result;
use crate::events::{EventSink, IceCandidate, SessionDescription};
use crate::pairing::RoomId;

/// Where and how a session joins its room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomConnectionParameters {
    pub room_url: String,
    pub room_id: RoomId,
    pub loopback: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingRoute {
    /// Through the signaling server at `room_url`.
    Relayed,
    /// Straight to the address spelled by the room id.
    Direct,
}

/// Outbound side of a signaling channel. Inbound traffic is reported as
/// [`crate::events::SignalingEvent`]s through the sink handed over at
/// construction.
///
/// Implementations must not block: network work happens on their own tasks.
pub trait SignalingClient: Send {
    fn connect_to_room(&mut self, params: &RoomConnectionParameters) -> Result<()>;
    fn send_offer_sdp(&mut self, sdp: &SessionDescription) -> Result<()>;
    fn send_answer_sdp(&mut self, sdp: &SessionDescription) -> Result<()>;
    fn send_local_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<()>;
    fn send_local_ice_candidate_removals(&mut self, candidates: &[IceCandidate]) -> Result<()>;
    /// Leaves the room. No events are delivered afterwards.
    fn disconnect_from_room(&mut self);
}

pub trait SignalingFactory: Send + Sync {
    fn create(&self, route: SignalingRoute, events: EventSink) -> anyhow::Result<Box<dyn SignalingClient>>;
}

/// Builds the websocket or TCP client according to the route.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultSignalingFactory;

impl SignalingFactory for DefaultSignalingFactory {
    fn create(&self, route: SignalingRoute, events: EventSink) -> anyhow::Result<Box<dyn SignalingClient>> {
        Ok(match route {
            SignalingRoute::Relayed => Box::new(WebSocketSignalingClient::new(events)),
            SignalingRoute::Direct => Box::new(DirectSignalingClient::new(events)),
        })
    }
}

/// Direct signaling is used only outside loopback mode, and only when the
/// room id reads as an address.
pub fn select_route(room: &RoomId, loopback: bool) -> SignalingRoute {
    if !loopback && direct_address(room.as_str()).is_some() {
        SignalingRoute::Direct
    } else {
        SignalingRoute::Relayed
    }
}

/// Parses `ipv4[:port]`, `[ipv6][:port]` or `localhost[:port]`.
pub fn direct_address(room: &str) -> Option<SocketAddr> {
    let (ip, rest) = if let Some(stripped) = room.strip_prefix('[') {
        let (host, rest) = stripped.split_once(']')?;
        (IpAddr::V6(host.parse::<Ipv6Addr>().ok()?), rest)
    } else {
        let (host, rest) = match room.find(':') {
            Some(idx) => room.split_at(idx),
            None => (room, ""),
        };
        let ip = if host == "localhost" {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            IpAddr::V4(host.parse::<Ipv4Addr>().ok()?)
        };
        (ip, rest)
    };

    let port = match rest {
        "" => DEFAULT_DIRECT_PORT,
        _ => {
            let digits = rest.strip_prefix(':')?;
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            digits.parse::<u16>().ok()?
        }
    };

    Some(SocketAddr::new(ip, port))
}
