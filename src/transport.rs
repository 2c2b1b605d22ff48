//! # Peer Transport
//!
//! The overlay never touches NAT traversal itself. It drives an external
//! transport through the [`Transport`] / [`TransportHandle`] contract: create
//! a connection, exchange descriptions and candidates produced by the
//! transport, then send text frames over one ordered, reliable data channel.
//!
//! Everything the transport reports (descriptions to forward, candidates,
//! channel open/message/close, negotiation state) arrives as a
//! [`TransportEvent`] on the node's event channel, tagged with the
//! [`ConnectionToken`] the node chose when creating the connection.
//!
//! ## MemoryTransport
//!
//! [`MemoryNetwork`] is an in-process switchboard implementing the contract
//! for tests and simulations. Descriptions name switchboard endpoints, a link
//! forms when the initiator applies the answer, and messages are delivered
//! in order through the peer's event channel. [`MemoryNetwork::block`] makes
//! every negotiation involving a given id fail, which is how unreachable
//! (badly NATed) peers are simulated.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::trace;

use crate::messages::{SdpKind, SessionDescription};
use crate::ring::RingId;

/// Node-chosen handle for one connection attempt.
pub type ConnectionToken = u64;

/// ICE-equivalent negotiation state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NegotiationState {
    New,
    Checking,
    Connected,
    Failed,
    Closed,
}

impl NegotiationState {
    /// Still working towards a usable link.
    pub fn is_pending(&self) -> bool {
        matches!(self, NegotiationState::New | NegotiationState::Checking)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, NegotiationState::Failed | NegotiationState::Closed)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEventKind {
    /// A description to forward to the peer through the signaler.
    LocalDescription(SessionDescription),
    /// A candidate to forward to the peer through the signaler.
    Candidate(String),
    ChannelOpen,
    ChannelMessage(String),
    ChannelClosed,
    StateChange(NegotiationState),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportEvent {
    pub token: ConnectionToken,
    pub kind: TransportEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Candidate arrived before any remote description was applied.
    NoRemoteDescription,
    /// Description the transport cannot interpret.
    InvalidDescription(String),
    /// The data channel is not open.
    ChannelNotOpen,
    /// The connection was already closed locally.
    Closed,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::NoRemoteDescription => write!(f, "no remote description set"),
            TransportError::InvalidDescription(sdp) => write!(f, "invalid description: {}", sdp),
            TransportError::ChannelNotOpen => write!(f, "data channel is not open"),
            TransportError::Closed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Factory for peer connections.
pub trait Transport: Send + Sync {
    fn create_connection(
        &self,
        token: ConnectionToken,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Box<dyn TransportHandle>;
}

/// One peer connection.
pub trait TransportHandle: Send {
    /// Initiator side: create the data channel and start negotiation. The
    /// offer arrives as a `LocalDescription` event.
    fn open_channel(&mut self) -> Result<(), TransportError>;

    /// Apply the peer's description. Applying an offer produces an answer
    /// as a `LocalDescription` event.
    fn set_remote_description(&mut self, desc: SessionDescription) -> Result<(), TransportError>;

    fn add_candidate(&mut self, candidate: String) -> Result<(), TransportError>;

    fn send(&mut self, text: String) -> Result<(), TransportError>;

    fn close(&mut self);
}

// ============================================================================
// In-Memory Switchboard
// ============================================================================

const OFFER_PREFIX: &str = "memory-offer:";
const ANSWER_PREFIX: &str = "memory-answer:";

type EndpointId = u64;

struct Endpoint {
    owner: RingId,
    token: ConnectionToken,
    events: mpsc::UnboundedSender<TransportEvent>,
    peer: Option<EndpointId>,
    remote_set: bool,
    open: bool,
}

impl Endpoint {
    fn emit(&self, kind: TransportEventKind) {
        let _ = self.events.send(TransportEvent { token: self.token, kind });
    }
}

#[derive(Default)]
struct Switchboard {
    next_endpoint: EndpointId,
    endpoints: HashMap<EndpointId, Endpoint>,
    blocked: HashSet<RingId>,
    delivered: u64,
}

impl Switchboard {
    /// Link two endpoints after the initiator applied the answer.
    fn link(&mut self, initiator: EndpointId, answerer: EndpointId) {
        let answerer_ok = self
            .endpoints
            .get(&answerer)
            .map(|ep| ep.peer == Some(initiator))
            .unwrap_or(false);
        let owners = (
            self.endpoints.get(&initiator).map(|ep| ep.owner),
            self.endpoints.get(&answerer).map(|ep| ep.owner),
        );
        let blocked = match owners {
            (Some(a), Some(b)) => self.blocked.contains(&a) || self.blocked.contains(&b),
            _ => true,
        };
        if !answerer_ok || blocked {
            for ep in [initiator, answerer] {
                if let Some(endpoint) = self.endpoints.get(&ep) {
                    endpoint.emit(TransportEventKind::StateChange(NegotiationState::Failed));
                }
            }
            return;
        }
        for ep in [initiator, answerer] {
            if let Some(endpoint) = self.endpoints.get_mut(&ep) {
                endpoint.open = true;
                endpoint.emit(TransportEventKind::StateChange(NegotiationState::Connected));
                endpoint.emit(TransportEventKind::ChannelOpen);
            }
        }
    }
}

/// Shared in-process network. Clone it into every node of a test.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<Switchboard>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Switchboard> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Transport for the node with id `owner`.
    pub fn transport(&self, owner: RingId) -> Arc<dyn Transport> {
        Arc::new(MemoryTransport {
            network: self.clone(),
            owner,
        })
    }

    /// Make every future negotiation involving `id` fail.
    pub fn block(&self, id: RingId) {
        self.lock().blocked.insert(id);
    }

    pub fn unblock(&self, id: &RingId) {
        self.lock().blocked.remove(id);
    }

    /// Endpoints that have not been closed.
    pub fn live_endpoints(&self) -> usize {
        self.lock().endpoints.len()
    }

    /// Total channel messages delivered so far.
    pub fn delivered(&self) -> u64 {
        self.lock().delivered
    }
}

struct MemoryTransport {
    network: MemoryNetwork,
    owner: RingId,
}

impl Transport for MemoryTransport {
    fn create_connection(
        &self,
        token: ConnectionToken,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Box<dyn TransportHandle> {
        let mut board = self.network.lock();
        let id = board.next_endpoint;
        board.next_endpoint += 1;
        board.endpoints.insert(
            id,
            Endpoint {
                owner: self.owner,
                token,
                events,
                peer: None,
                remote_set: false,
                open: false,
            },
        );
        Box::new(MemoryHandle {
            network: self.network.clone(),
            endpoint: id,
            closed: false,
        })
    }
}

struct MemoryHandle {
    network: MemoryNetwork,
    endpoint: EndpointId,
    closed: bool,
}

impl MemoryHandle {
    fn parse_endpoint(sdp: &str, prefix: &str) -> Option<EndpointId> {
        sdp.strip_prefix(prefix)?.parse().ok()
    }
}

impl TransportHandle for MemoryHandle {
    fn open_channel(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let board = self.network.lock();
        let endpoint = board.endpoints.get(&self.endpoint).ok_or(TransportError::Closed)?;
        endpoint.emit(TransportEventKind::StateChange(NegotiationState::Checking));
        endpoint.emit(TransportEventKind::LocalDescription(SessionDescription {
            kind: SdpKind::Offer,
            sdp: format!("{}{}", OFFER_PREFIX, self.endpoint),
        }));
        endpoint.emit(TransportEventKind::Candidate(format!("memory-candidate:{}", self.endpoint)));
        Ok(())
    }

    fn set_remote_description(&mut self, desc: SessionDescription) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let mut board = self.network.lock();
        match desc.kind {
            SdpKind::Offer => {
                let peer = Self::parse_endpoint(&desc.sdp, OFFER_PREFIX)
                    .ok_or_else(|| TransportError::InvalidDescription(desc.sdp.clone()))?;
                let endpoint = board.endpoints.get_mut(&self.endpoint).ok_or(TransportError::Closed)?;
                endpoint.peer = Some(peer);
                endpoint.remote_set = true;
                endpoint.emit(TransportEventKind::StateChange(NegotiationState::Checking));
                endpoint.emit(TransportEventKind::LocalDescription(SessionDescription {
                    kind: SdpKind::Answer,
                    sdp: format!("{}{}", ANSWER_PREFIX, self.endpoint),
                }));
                endpoint.emit(TransportEventKind::Candidate(format!("memory-candidate:{}", self.endpoint)));
            }
            SdpKind::Answer => {
                let peer = Self::parse_endpoint(&desc.sdp, ANSWER_PREFIX)
                    .ok_or_else(|| TransportError::InvalidDescription(desc.sdp.clone()))?;
                let endpoint = board.endpoints.get_mut(&self.endpoint).ok_or(TransportError::Closed)?;
                endpoint.peer = Some(peer);
                endpoint.remote_set = true;
                board.link(self.endpoint, peer);
            }
        }
        Ok(())
    }

    fn add_candidate(&mut self, candidate: String) -> Result<(), TransportError> {
        let board = self.network.lock();
        let endpoint = board.endpoints.get(&self.endpoint).ok_or(TransportError::Closed)?;
        if !endpoint.remote_set {
            return Err(TransportError::NoRemoteDescription);
        }
        trace!(endpoint = self.endpoint, candidate = %candidate, "candidate applied");
        Ok(())
    }

    fn send(&mut self, text: String) -> Result<(), TransportError> {
        let mut board = self.network.lock();
        let endpoint = board.endpoints.get(&self.endpoint).ok_or(TransportError::Closed)?;
        if !endpoint.open {
            return Err(TransportError::ChannelNotOpen);
        }
        let peer = endpoint.peer.and_then(|p| board.endpoints.get(&p));
        match peer {
            Some(peer) if peer.open => {
                peer.emit(TransportEventKind::ChannelMessage(text));
            }
            _ => return Err(TransportError::ChannelNotOpen),
        }
        board.delivered += 1;
        Ok(())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut board = self.network.lock();
        if let Some(endpoint) = board.endpoints.remove(&self.endpoint) {
            if let Some(peer) = endpoint.peer.and_then(|p| board.endpoints.get_mut(&p)) {
                if peer.peer == Some(self.endpoint) {
                    let was_open = peer.open;
                    peer.open = false;
                    if was_open {
                        peer.emit(TransportEventKind::ChannelClosed);
                    }
                    peer.emit(TransportEventKind::StateChange(NegotiationState::Closed));
                }
            }
        }
    }
}

impl Drop for MemoryHandle {
    fn drop(&mut self) {
        self.close();
    }
}
