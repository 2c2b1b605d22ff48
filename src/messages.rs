//! # Wire Protocol Messages
//!
//! All frames are JSON. Two links carry them:
//!
//! | Link | Frame type | Tag field |
//! |------|------------|-----------|
//! | peer data channel | [`ChannelFrame`] | `action` |
//! | node ↔ rendezvous socket | [`RendezvousMessage`] | `action` |
//!
//! Routed overlay traffic is an [`Envelope`] inside `ChannelFrame::Overlay`.
//! The envelope's addressing, proxy history and kind tag are cleartext so
//! relays can route without verifying; the body is a [`SignedPacket`] holding
//! an [`OverlayMessage`] that only the final recipient unpacks. The body's
//! own tag must equal the cleartext [`MessageKind`] or the envelope is
//! treated as forged.
//!
//! ## Size Limits
//!
//! - `MAX_FRAME_SIZE`: frames longer than this are dropped before parsing
//! - `MAX_PROXIES`: envelopes with longer proxy histories are dropped

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::crypto::SignedPacket;
use crate::identity::{InstanceId, PeerKey};
use crate::ring::{Distance, RingId};

/// Largest frame accepted from a channel or socket (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Longest proxy history an envelope may accumulate.
pub const MAX_PROXIES: usize = 256;

/// Parse a JSON frame, refusing oversized input.
pub fn decode_frame<T: DeserializeOwned>(text: &str) -> anyhow::Result<T> {
    if text.len() > MAX_FRAME_SIZE {
        anyhow::bail!("frame of {} bytes exceeds limit {}", text.len(), MAX_FRAME_SIZE);
    }
    Ok(serde_json::from_str(text)?)
}

pub fn encode_frame<T: Serialize>(frame: &T) -> anyhow::Result<String> {
    Ok(serde_json::to_string(frame)?)
}

// ============================================================================
// Overlay Envelopes
// ============================================================================

/// Cleartext routing tag of an envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    #[serde(rename = "ringring")]
    RingRing,
    #[serde(rename = "webrtc")]
    Signal,
    #[serde(rename = "getflood")]
    GetFlood,
    #[serde(rename = "floodreport")]
    FloodReport,
    #[serde(rename = "findfinger")]
    FindFinger,
    #[serde(rename = "fingercandidate")]
    FingerCandidate,
    #[serde(rename = "findsocket")]
    FindSocket,
    #[serde(rename = "checkforid")]
    CheckForId,
    #[serde(rename = "imhere")]
    ImHere,
    #[serde(rename = "rendezvous.areyouthere")]
    AreYouThere,
    #[serde(rename = "rendezvous.nothere")]
    NotHere,
    #[serde(rename = "rendezvous.proxysignal")]
    ProxySignal,
    #[serde(rename = "rendezvous.signalreceive")]
    SignalReceive,
    #[serde(rename = "dht.put")]
    DhtPut,
    #[serde(rename = "dht.put.ack")]
    DhtPutAck,
    #[serde(rename = "dht.get")]
    DhtGet,
    #[serde(rename = "dht.got")]
    DhtGot,
    #[serde(rename = "app")]
    App,
}

/// Mutually exclusive addressing modes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Addressing {
    /// A specific node id.
    To(RingId),
    /// Whichever live node is closest to a ring position.
    ToClosest(RingId),
}

impl Addressing {
    pub fn target(&self) -> RingId {
        match self {
            Addressing::To(id) | Addressing::ToClosest(id) => *id,
        }
    }
}

/// A routable, signed message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub from: RingId,
    pub from_instance: InstanceId,
    pub to: Addressing,
    pub kind: MessageKind,
    /// Ids that already forwarded this envelope.
    pub proxies: Vec<RingId>,
    /// Route the envelope took on an earlier trip, offered as a hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<RingId>>,
    pub data: SignedPacket,
    #[serde(default)]
    pub retries: u32,
    /// Peer that handed us this envelope. Filled in on receipt, never sent.
    #[serde(skip)]
    pub hop_from: Option<RingId>,
}

/// Connection info a well-placed node hands to a newcomer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapInfo {
    pub flood: Vec<RingId>,
    pub fingers: Vec<RingId>,
}

/// Signed body of an envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "overlay")]
pub enum OverlayMessage {
    #[serde(rename = "ringring")]
    RingRing,
    #[serde(rename = "webrtc")]
    Signal { signal: SignalEnvelope },
    #[serde(rename = "getflood")]
    GetFlood,
    #[serde(rename = "floodreport")]
    FloodReport { flood: Vec<RingId> },
    #[serde(rename = "findfinger")]
    FindFinger { level: usize },
    #[serde(rename = "fingercandidate")]
    FingerCandidate { level: usize },
    #[serde(rename = "findsocket")]
    FindSocket { traveled: Distance },
    #[serde(rename = "checkforid")]
    CheckForId,
    #[serde(rename = "imhere")]
    ImHere,
    #[serde(rename = "rendezvous.areyouthere")]
    AreYouThere { newcomer: PeerKey },
    #[serde(rename = "rendezvous.nothere")]
    NotHere { newcomer: PeerKey, bootstrap: BootstrapInfo },
    /// Ask the recipient to push a signal into its rendezvous socket.
    #[serde(rename = "rendezvous.proxysignal")]
    ProxySignal { relayed: RelayedSignal },
    /// A signal that reached the recipient's proxy through the rendezvous.
    #[serde(rename = "rendezvous.signalreceive")]
    SignalReceive { relayed: RelayedSignal },
    #[serde(rename = "dht.put")]
    DhtPut { request: u64, value: serde_json::Value },
    #[serde(rename = "dht.put.ack")]
    DhtPutAck { request: u64 },
    #[serde(rename = "dht.get")]
    DhtGet { request: u64 },
    #[serde(rename = "dht.got")]
    DhtGot { request: u64, values: BTreeMap<RingId, serde_json::Value> },
    #[serde(rename = "app")]
    App { kind: String, data: serde_json::Value },
}

impl OverlayMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            OverlayMessage::RingRing => MessageKind::RingRing,
            OverlayMessage::Signal { .. } => MessageKind::Signal,
            OverlayMessage::GetFlood => MessageKind::GetFlood,
            OverlayMessage::FloodReport { .. } => MessageKind::FloodReport,
            OverlayMessage::FindFinger { .. } => MessageKind::FindFinger,
            OverlayMessage::FingerCandidate { .. } => MessageKind::FingerCandidate,
            OverlayMessage::FindSocket { .. } => MessageKind::FindSocket,
            OverlayMessage::CheckForId => MessageKind::CheckForId,
            OverlayMessage::ImHere => MessageKind::ImHere,
            OverlayMessage::AreYouThere { .. } => MessageKind::AreYouThere,
            OverlayMessage::NotHere { .. } => MessageKind::NotHere,
            OverlayMessage::ProxySignal { .. } => MessageKind::ProxySignal,
            OverlayMessage::SignalReceive { .. } => MessageKind::SignalReceive,
            OverlayMessage::DhtPut { .. } => MessageKind::DhtPut,
            OverlayMessage::DhtPutAck { .. } => MessageKind::DhtPutAck,
            OverlayMessage::DhtGet { .. } => MessageKind::DhtGet,
            OverlayMessage::DhtGot { .. } => MessageKind::DhtGot,
            OverlayMessage::App { .. } => MessageKind::App,
        }
    }
}

// ============================================================================
// Peer Channel Frames
// ============================================================================

/// Post-open handshake steps.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Handshake {
    /// Answerer accepts the link; carries connect info for a newcomer.
    Accepted { bootstrap: Option<BootstrapInfo> },
    /// Answerer is still on rendezvous probation and must prove it can dial.
    NotAccepted,
    /// Tear this link down and dial me back.
    YouInitiate,
    /// Initiator confirms; both sides are now golden.
    Golden { bootstrap: Option<BootstrapInfo> },
}

/// Everything that crosses an open data channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ChannelFrame {
    MarkUsed,
    MarkUnused,
    #[serde(rename = "byebye")]
    ByeBye,
    Handshake { step: Handshake },
    Overlay { envelope: Envelope },
}

// ============================================================================
// Signaling
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SignalMessage {
    Description(SessionDescription),
    Candidate(String),
}

/// One negotiation message, stamped with the negotiation attempt it belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub timestamp: u64,
    pub initiator: bool,
    pub message: SignalMessage,
}

/// A signal carried by the rendezvous server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayedSignal {
    pub to: RingId,
    pub to_instance: InstanceId,
    pub from: RingId,
    pub from_instance: InstanceId,
    pub signal: SignalEnvelope,
    /// Final recipient when `to` is only relaying for an overlay peer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlay_to: Option<RingId>,
    /// Node whose socket injected this signal on behalf of `from`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_proxy: Option<PeerKey>,
}

// ============================================================================
// Rendezvous Protocol
// ============================================================================

/// Signed body of `bootstrap` and `reconnect`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    pub from: RingId,
    pub from_instance: InstanceId,
}

/// Frames on the node ↔ rendezvous socket.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum RendezvousMessage {
    /// New node asking to be introduced.
    #[serde(rename_all = "camelCase")]
    Bootstrap { verify_id: RingId, packet: SignedPacket },
    /// Known node re-opening its socket.
    #[serde(rename_all = "camelCase")]
    Reconnect { verify_id: RingId, packet: SignedPacket },
    /// Server → introducer: please bring this newcomer into the overlay.
    #[serde(rename_all = "camelCase")]
    Introduce { from: RingId, from_instance: InstanceId },
    /// Node → server: `confirmed` completed a golden handshake with me.
    #[serde(rename_all = "camelCase")]
    Confirm { from: RingId, from_instance: InstanceId, confirmed: RingId },
    /// Server → verified node: probe whether `id` is reachable.
    #[serde(rename = "checkforid")]
    CheckForId { id: RingId },
    /// Server → verified node: walk the ring and reconnect lost sockets.
    #[serde(rename = "findsocket")]
    FindSocket,
    #[serde(rename = "getblock")]
    GetBlock,
    #[serde(rename = "blocktime", rename_all = "camelCase")]
    BlockTime { day: i64, block: u64, time_till_end: u64 },
    /// Server → node: probation expired without a confirmed link.
    #[serde(rename = "badnetwork")]
    BadNetwork,
    #[serde(rename = "byebye")]
    ByeBye,
    Ping,
    Pong,
    Signal { relayed: RelayedSignal },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::pack;
    use crate::identity::LocalIdentity;

    fn sample_envelope(local: &LocalIdentity) -> Envelope {
        let body = OverlayMessage::FindFinger { level: 2 };
        Envelope {
            from: local.id,
            from_instance: local.instance.clone(),
            to: Addressing::ToClosest(RingId::hash_of(b"target")),
            kind: body.kind(),
            proxies: vec![local.id],
            path: None,
            data: pack(&body, &local.keypair).unwrap(),
            retries: 0,
            hop_from: Some(local.id),
        }
    }

    #[test]
    fn channel_frames_use_action_tags() {
        let text = encode_frame(&ChannelFrame::ByeBye).unwrap();
        assert_eq!(text, r#"{"action":"byebye"}"#);
        let text = encode_frame(&ChannelFrame::MarkUnused).unwrap();
        assert_eq!(text, r#"{"action":"markUnused"}"#);
        let step = ChannelFrame::Handshake { step: Handshake::NotAccepted };
        let back: ChannelFrame = decode_frame(&encode_frame(&step).unwrap()).unwrap();
        assert!(matches!(back, ChannelFrame::Handshake { step: Handshake::NotAccepted }));
    }

    #[test]
    fn envelope_hop_is_not_transmitted() {
        let local = LocalIdentity::generate();
        let frame = ChannelFrame::Overlay { envelope: sample_envelope(&local) };
        let text = encode_frame(&frame).unwrap();
        assert!(text.contains(r#""kind":"findfinger""#));
        assert!(text.contains(r#""toClosest""#));
        match decode_frame::<ChannelFrame>(&text).unwrap() {
            ChannelFrame::Overlay { envelope } => {
                assert_eq!(envelope.hop_from, None);
                assert_eq!(envelope.proxies, vec![local.id]);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn overlay_body_tag_matches_kind_names() {
        let body = OverlayMessage::DhtPutAck { request: 7 };
        let text = serde_json::to_string(&body).unwrap();
        let kind_text = serde_json::to_string(&body.kind()).unwrap();
        assert!(text.contains(&format!(r#""overlay":{}"#, kind_text)));
    }

    #[test]
    fn rendezvous_actions_match_protocol_names() {
        let text = encode_frame(&RendezvousMessage::GetBlock).unwrap();
        assert_eq!(text, r#"{"action":"getblock"}"#);
        let text = encode_frame(&RendezvousMessage::CheckForId { id: RingId::ZERO }).unwrap();
        assert!(text.starts_with(r#"{"action":"checkforid""#));
    }

    #[test]
    fn rendezvous_fields_are_camel_case() {
        let local = LocalIdentity::generate();
        let introduce = RendezvousMessage::Introduce {
            from: local.id,
            from_instance: local.instance.clone(),
        };
        let text = encode_frame(&introduce).unwrap();
        assert!(text.contains(r#""fromInstance":"#), "{}", text);
        assert!(!text.contains("from_instance"));
        assert_eq!(decode_frame::<RendezvousMessage>(&text).unwrap(), introduce);

        let time = RendezvousMessage::BlockTime { day: 3, block: 5, time_till_end: 60 };
        let text = encode_frame(&time).unwrap();
        assert!(text.contains(r#""timeTillEnd":60"#), "{}", text);

        let hello = Hello { from: local.id, from_instance: local.instance.clone() };
        let bootstrap = RendezvousMessage::Bootstrap {
            verify_id: local.id,
            packet: pack(&hello, &local.keypair).unwrap(),
        };
        let text = encode_frame(&bootstrap).unwrap();
        assert!(text.contains(r#""verifyId":"#), "{}", text);
    }

    #[test]
    fn oversized_frames_are_refused() {
        let huge = "x".repeat(MAX_FRAME_SIZE + 1);
        assert!(decode_frame::<ChannelFrame>(&huge).is_err());
    }
}
