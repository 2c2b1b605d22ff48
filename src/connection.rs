//! # Connection Lifecycle
//!
//! One [`Connection`] per remote session, owned by the node's
//! [`ConnectionTable`]. The table wraps the external transport and turns its
//! events and incoming signaling into [`LifecycleEffect`]s the node acts on.
//!
//! ## States
//!
//! ```text
//! signaling ──► open ──► golden
//!     │           │         │
//!     └───────────┴─────────┴──► closed   (failed / timeout / byebye / unused)
//! ```
//!
//! - **signaling**: descriptions and candidates flow through a [`Signaler`];
//!   candidates that beat the remote description are buffered.
//! - **open**: the data channel is up. The answerer replies `accepted`, or
//!   `notaccepted` while it is still on rendezvous probation for a
//!   rendezvous-signaled link. `notaccepted` makes the two sides swap roles
//!   so the probationary node proves it can dial out.
//! - **golden**: the initiator answered `accepted` with `golden`. Only
//!   golden links carry overlay routing.
//!
//! ## Negotiation Attempts
//!
//! Every attempt carries a per-node monotonic timestamp. Signals for a
//! removed attempt are ignored via a bounded dead-timestamp set. When both
//! sides dial each other at once (glare), [`yield_to_id`] picks the side that
//! drops its own attempt and answers instead. Otherwise a newer attempt from
//! the peer supersedes ours.
//!
//! ## Duplicate Identity
//!
//! A link between two sessions of the *same* id never goes golden. The later
//! session enters subordinate mode and routes through the earlier one.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::identity::{now_ms, InstanceId, LocalIdentity, PeerKey};
use crate::messages::{
    decode_frame, encode_frame, BootstrapInfo, ChannelFrame, Envelope, Handshake, SignalEnvelope,
    SignalMessage,
};
use crate::ring::{yield_to_id, RingId};
use crate::transport::{
    ConnectionToken, NegotiationState, Transport, TransportError, TransportEvent,
    TransportEventKind, TransportHandle,
};

/// Path a connection's signaling messages take.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Signaler {
    /// Overlay `webrtc` envelopes, optionally hinted along a known path.
    Overlay { path: Option<Vec<RingId>> },
    /// Our rendezvous socket. `via` names the node whose socket relays for
    /// the peer when the peer has none of its own.
    Rendezvous { via: Option<PeerKey> },
    /// Overlay envelope to `proxy`, which pushes the signal into its own
    /// rendezvous socket.
    OverlayToRendezvous { proxy: RingId },
}

impl Signaler {
    /// Whether signals travel entirely inside the overlay.
    pub fn is_overlay_channel(&self) -> bool {
        matches!(self, Signaler::Overlay { .. })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

pub struct Connection {
    pub key: PeerKey,
    pub token: ConnectionToken,
    pub initiator: bool,
    pub timestamp: u64,
    pub golden: bool,
    pub used: bool,
    pub used_by_peer: bool,
    pub channel: ChannelState,
    pub negotiation: NegotiationState,
    pub signaler: Signaler,
    pub started: Instant,
    pub last_use: Instant,
    remote_description_set: bool,
    pending_candidates: Vec<String>,
    handle: Box<dyn TransportHandle>,
}

impl Connection {
    pub fn is_open(&self) -> bool {
        self.channel == ChannelState::Open
    }

    /// Still negotiating: no channel yet and the transport has not given up.
    pub fn is_negotiating(&self) -> bool {
        self.channel == ChannelState::Connecting && !self.negotiation.is_terminal()
    }

    fn send_frame(&mut self, frame: &ChannelFrame) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ChannelNotOpen);
        }
        let text = encode_frame(frame)
            .map_err(|e| TransportError::InvalidDescription(e.to_string()))?;
        self.handle.send(text)?;
        self.last_use = Instant::now();
        Ok(())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("key", &self.key.to_string())
            .field("initiator", &self.initiator)
            .field("timestamp", &self.timestamp)
            .field("golden", &self.golden)
            .field("channel", &self.channel)
            .field("negotiation", &self.negotiation)
            .finish_non_exhaustive()
    }
}

/// What the node must do after the table changed.
#[derive(Clone, Debug, PartialEq)]
pub enum LifecycleEffect {
    /// Forward a signal to the peer along `signaler`.
    Signal { to: PeerKey, signaler: Signaler, signal: SignalEnvelope },
    /// Membership changed without a promotion or removal.
    Changed,
    /// The link completed its handshake.
    Golden { key: PeerKey, bootstrap: Option<BootstrapInfo>, confirm_via_rendezvous: bool },
    /// A connection is gone.
    Removed { key: PeerKey, was_golden: bool },
    /// We are the later session of our id; route through `controller`.
    EnterSubordinate { controller: PeerKey },
    /// A later session of our id attached to us.
    AddSubordinate { key: PeerKey },
    /// An overlay envelope arrived on a channel.
    Incoming(Envelope),
}

/// Snapshot of one connection for status reporting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionSummary {
    pub key: PeerKey,
    pub initiator: bool,
    pub golden: bool,
    pub open: bool,
}

pub struct ConnectionTable {
    local_id: RingId,
    local_instance: InstanceId,
    transport: Arc<dyn Transport>,
    events: mpsc::UnboundedSender<TransportEvent>,
    by_peer: HashMap<RingId, Connection>,
    by_instance: HashMap<InstanceId, Connection>,
    tokens: HashMap<ConnectionToken, PeerKey>,
    next_token: ConnectionToken,
    last_timestamp: u64,
    /// Removed attempts as (peer, timestamp, we initiated).
    dead_timestamps: LruCache<(RingId, u64, bool), ()>,
    probation: bool,
    connect_info: HashMap<PeerKey, BootstrapInfo>,
}

impl ConnectionTable {
    pub fn new(
        local: &LocalIdentity,
        transport: Arc<dyn Transport>,
        events: mpsc::UnboundedSender<TransportEvent>,
        dead_timestamp_capacity: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(dead_timestamp_capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            local_id: local.id,
            local_instance: local.instance.clone(),
            transport,
            events,
            by_peer: HashMap::new(),
            by_instance: HashMap::new(),
            tokens: HashMap::new(),
            next_token: 1,
            last_timestamp: 0,
            dead_timestamps: LruCache::new(capacity),
            probation: true,
            connect_info: HashMap::new(),
        }
    }

    // ------------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------------

    pub fn get(&self, key: &PeerKey) -> Option<&Connection> {
        if key.id == self.local_id {
            self.by_instance.get(&key.instance)
        } else {
            self.by_peer.get(&key.id)
        }
    }

    fn get_mut(&mut self, key: &PeerKey) -> Option<&mut Connection> {
        if key.id == self.local_id {
            self.by_instance.get_mut(&key.instance)
        } else {
            self.by_peer.get_mut(&key.id)
        }
    }

    pub fn get_by_id(&self, id: &RingId) -> Option<&Connection> {
        self.by_peer.get(id)
    }

    pub fn contains_id(&self, id: &RingId) -> bool {
        self.by_peer.contains_key(id)
    }

    /// Channel to `id` is open.
    pub fn is_open(&self, id: &RingId) -> bool {
        self.by_peer.get(id).map(|c| c.is_open()).unwrap_or(false)
    }

    /// Golden connections with an open channel.
    pub fn open_golden_ids(&self) -> Vec<RingId> {
        self.by_peer
            .values()
            .filter(|c| c.golden && c.is_open())
            .map(|c| c.key.id)
            .collect()
    }

    /// Golden connections, excluding sessions of our own id.
    pub fn golden_ids(&self) -> Vec<RingId> {
        self.by_peer.values().filter(|c| c.golden).map(|c| c.key.id).collect()
    }

    /// Connections that are, or will become, overlay links.
    pub fn pending_or_active_ids(&self) -> Vec<RingId> {
        self.by_peer
            .values()
            .filter(|c| {
                (c.golden || c.signaler.is_overlay_channel()) && c.channel != ChannelState::Closed
            })
            .map(|c| c.key.id)
            .collect()
    }

    pub fn has_negotiating(&self) -> bool {
        self.all().any(|c| c.is_negotiating())
    }

    pub fn last_use(&self, id: &RingId) -> Option<Instant> {
        self.by_peer.get(id).map(|c| c.last_use)
    }

    pub fn len(&self) -> usize {
        self.by_peer.len() + self.by_instance.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn all(&self) -> impl Iterator<Item = &Connection> {
        self.by_peer.values().chain(self.by_instance.values())
    }

    pub fn summaries(&self) -> Vec<ConnectionSummary> {
        self.all()
            .map(|c| ConnectionSummary {
                key: c.key.clone(),
                initiator: c.initiator,
                golden: c.golden,
                open: c.is_open(),
            })
            .collect()
    }

    // ------------------------------------------------------------------------
    // Probation and connect info
    // ------------------------------------------------------------------------

    pub fn probation(&self) -> bool {
        self.probation
    }

    /// Called whenever the rendezvous socket (re)opens.
    pub fn set_probation(&mut self, probation: bool) {
        self.probation = probation;
    }

    /// Remember what to tell `key` once its link is golden.
    pub fn set_connect_info(&mut self, key: PeerKey, info: BootstrapInfo) {
        self.connect_info.insert(key, info);
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    fn next_timestamp(&mut self) -> u64 {
        self.last_timestamp = now_ms().max(self.last_timestamp + 1);
        self.last_timestamp
    }

    /// Begin a connection to `key`. A live connection is marked used instead.
    pub fn start(
        &mut self,
        initiator: bool,
        key: PeerKey,
        signaler: Signaler,
        timestamp: Option<u64>,
    ) -> Vec<LifecycleEffect> {
        if let Some(existing) = self.get_mut(&key) {
            existing.used = true;
            return Vec::new();
        }
        if key.id == self.local_id && key.instance == self.local_instance {
            return Vec::new();
        }
        let timestamp = match timestamp {
            Some(ts) => {
                self.last_timestamp = self.last_timestamp.max(ts);
                ts
            }
            None => self.next_timestamp(),
        };
        let token = self.next_token;
        self.next_token += 1;
        let mut handle = self.transport.create_connection(token, self.events.clone());
        if initiator {
            if let Err(e) = handle.open_channel() {
                warn!(peer = %key, error = %e, "failed to open data channel");
            }
        }
        let now = Instant::now();
        let connection = Connection {
            key: key.clone(),
            token,
            initiator,
            timestamp,
            golden: false,
            used: true,
            used_by_peer: true,
            channel: ChannelState::Connecting,
            negotiation: NegotiationState::New,
            signaler,
            started: now,
            last_use: now,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            handle,
        };
        debug!(peer = %key, initiator, timestamp, "starting connection");
        self.tokens.insert(token, key.clone());
        if key.id == self.local_id {
            self.by_instance.insert(key.instance.clone(), connection);
        } else {
            self.by_peer.insert(key.id, connection);
        }
        vec![LifecycleEffect::Changed]
    }

    /// Whether we give way when both sides dialed at once.
    fn yields_to(&self, key: &PeerKey) -> bool {
        if key.id == self.local_id {
            self.local_instance > key.instance
        } else {
            yield_to_id(self.local_id, key.id)
        }
    }

    /// Apply a signal received from `key` over `signaler`.
    pub fn handle_signal(
        &mut self,
        key: PeerKey,
        signal: SignalEnvelope,
        signaler: Signaler,
    ) -> Vec<LifecycleEffect> {
        if self
            .dead_timestamps
            .contains(&(key.id, signal.timestamp, !signal.initiator))
        {
            trace!(peer = %key, timestamp = signal.timestamp, "signal for dead attempt");
            return Vec::new();
        }
        let mut effects = Vec::new();
        let existing = self
            .get(&key)
            .map(|c| (c.timestamp, c.initiator, c.is_open()));
        match existing {
            None => {
                // Candidates can overtake the offer on multi-hop paths.
                effects.extend(self.start(false, key.clone(), signaler, Some(signal.timestamp)));
            }
            Some((_, true, false)) if signal.initiator => {
                if self.yields_to(&key) {
                    debug!(peer = %key, "glare: yielding to peer offer");
                    effects.extend(self.disconnect(&key));
                    effects.extend(self.start(false, key.clone(), signaler, Some(signal.timestamp)));
                } else {
                    trace!(peer = %key, "glare: keeping our offer");
                    return effects;
                }
            }
            Some((ts, initiator, _)) if ts == signal.timestamp && initiator != signal.initiator => {}
            Some((ts, _, _)) if ts < signal.timestamp && signal.initiator => {
                debug!(peer = %key, old = ts, new = signal.timestamp, "newer attempt supersedes");
                effects.extend(self.disconnect(&key));
                effects.extend(self.start(false, key.clone(), signaler, Some(signal.timestamp)));
            }
            Some(_) => {
                trace!(peer = %key, timestamp = signal.timestamp, "stale signal dropped");
                return effects;
            }
        }

        let Some(conn) = self.get_mut(&key) else {
            return effects;
        };
        if conn.timestamp != signal.timestamp || conn.initiator == signal.initiator {
            return effects;
        }
        match signal.message {
            SignalMessage::Description(desc) => {
                if let Err(e) = conn.handle.set_remote_description(desc) {
                    warn!(peer = %key, error = %e, "failed to apply remote description");
                    return effects;
                }
                conn.remote_description_set = true;
                for candidate in std::mem::take(&mut conn.pending_candidates) {
                    if let Err(e) = conn.handle.add_candidate(candidate) {
                        warn!(peer = %key, error = %e, "failed to add buffered candidate");
                    }
                }
            }
            SignalMessage::Candidate(candidate) => {
                if conn.remote_description_set {
                    if let Err(e) = conn.handle.add_candidate(candidate) {
                        warn!(peer = %key, error = %e, "failed to add candidate");
                    }
                } else {
                    conn.pending_candidates.push(candidate);
                }
            }
        }
        effects
    }

    /// React to a transport callback.
    pub fn handle_transport_event(&mut self, event: TransportEvent) -> Vec<LifecycleEffect> {
        let Some(key) = self.tokens.get(&event.token).cloned() else {
            return Vec::new();
        };
        let Some(conn) = self.get_mut(&key) else {
            return Vec::new();
        };
        if conn.token != event.token {
            return Vec::new();
        }
        match event.kind {
            TransportEventKind::LocalDescription(desc) => vec![LifecycleEffect::Signal {
                to: key,
                signaler: conn.signaler.clone(),
                signal: SignalEnvelope {
                    timestamp: conn.timestamp,
                    initiator: conn.initiator,
                    message: SignalMessage::Description(desc),
                },
            }],
            TransportEventKind::Candidate(candidate) => vec![LifecycleEffect::Signal {
                to: key,
                signaler: conn.signaler.clone(),
                signal: SignalEnvelope {
                    timestamp: conn.timestamp,
                    initiator: conn.initiator,
                    message: SignalMessage::Candidate(candidate),
                },
            }],
            TransportEventKind::StateChange(state) => {
                conn.negotiation = state;
                if state.is_terminal() {
                    debug!(peer = %key, ?state, "negotiation ended");
                    self.disconnect(&key)
                } else {
                    Vec::new()
                }
            }
            TransportEventKind::ChannelOpen => {
                conn.channel = ChannelState::Open;
                conn.last_use = Instant::now();
                self.on_channel_open(key)
            }
            TransportEventKind::ChannelClosed => self.disconnect(&key),
            TransportEventKind::ChannelMessage(text) => {
                conn.last_use = Instant::now();
                match decode_frame::<ChannelFrame>(&text) {
                    Ok(frame) => self.on_frame(key, frame),
                    Err(e) => {
                        warn!(peer = %key, error = %e, "undecodable channel frame");
                        Vec::new()
                    }
                }
            }
        }
    }

    fn on_channel_open(&mut self, key: PeerKey) -> Vec<LifecycleEffect> {
        if key.id == self.local_id {
            return if key.instance > self.local_instance {
                debug!(peer = %key, "later session attached, adding subordinate");
                vec![LifecycleEffect::AddSubordinate { key }]
            } else {
                debug!(peer = %key, "earlier session exists, entering subordinate mode");
                vec![LifecycleEffect::EnterSubordinate { controller: key }]
            };
        }
        let probation = self.probation;
        let info = self.connect_info.get(&key).cloned();
        let Some(conn) = self.get_mut(&key) else {
            return Vec::new();
        };
        if !conn.initiator {
            let step = if probation && !conn.signaler.is_overlay_channel() {
                Handshake::NotAccepted
            } else {
                Handshake::Accepted { bootstrap: info }
            };
            if let Err(e) = conn.send_frame(&ChannelFrame::Handshake { step }) {
                warn!(peer = %key, error = %e, "failed to send handshake");
            }
        }
        vec![LifecycleEffect::Changed]
    }

    fn on_frame(&mut self, key: PeerKey, frame: ChannelFrame) -> Vec<LifecycleEffect> {
        match frame {
            ChannelFrame::MarkUsed => {
                if let Some(conn) = self.get_mut(&key) {
                    conn.used_by_peer = true;
                }
                Vec::new()
            }
            ChannelFrame::MarkUnused => {
                let Some(conn) = self.get_mut(&key) else {
                    return Vec::new();
                };
                conn.used_by_peer = false;
                if !conn.used {
                    debug!(peer = %key, "both sides unused, disconnecting");
                    self.disconnect(&key)
                } else {
                    Vec::new()
                }
            }
            ChannelFrame::ByeBye => self.disconnect(&key),
            ChannelFrame::Handshake { step } => self.on_handshake(key, step),
            ChannelFrame::Overlay { mut envelope } => {
                envelope.hop_from = Some(key.id);
                vec![LifecycleEffect::Incoming(envelope)]
            }
        }
    }

    fn on_handshake(&mut self, key: PeerKey, step: Handshake) -> Vec<LifecycleEffect> {
        let probation = self.probation;
        let Some(conn) = self.get_mut(&key) else {
            return Vec::new();
        };
        let rendezvous_signaled = !conn.signaler.is_overlay_channel();
        match step {
            Handshake::NotAccepted => {
                if !conn.initiator {
                    return Vec::new();
                }
                self.swap_roles(&key)
            }
            Handshake::Accepted { bootstrap } => {
                if !conn.initiator {
                    return Vec::new();
                }
                if rendezvous_signaled && probation {
                    return self.swap_roles(&key);
                }
                conn.golden = true;
                let info = self.connect_info.remove(&key);
                let Some(conn) = self.get_mut(&key) else {
                    return Vec::new();
                };
                if let Err(e) = conn.send_frame(&ChannelFrame::Handshake {
                    step: Handshake::Golden { bootstrap: info },
                }) {
                    warn!(peer = %key, error = %e, "failed to confirm golden");
                }
                debug!(peer = %key, "link golden (initiator)");
                vec![LifecycleEffect::Golden {
                    key,
                    bootstrap,
                    confirm_via_rendezvous: rendezvous_signaled,
                }]
            }
            Handshake::YouInitiate => {
                if conn.initiator {
                    return Vec::new();
                }
                let signaler = conn.signaler.clone();
                self.probation = false;
                debug!(peer = %key, "peer asked us to dial back");
                let mut effects = self.disconnect(&key);
                effects.extend(self.start(true, key, signaler, None));
                effects
            }
            Handshake::Golden { bootstrap } => {
                if conn.initiator || conn.golden {
                    return Vec::new();
                }
                conn.golden = true;
                self.connect_info.remove(&key);
                debug!(peer = %key, "link golden (answerer)");
                vec![LifecycleEffect::Golden {
                    key,
                    bootstrap,
                    confirm_via_rendezvous: rendezvous_signaled,
                }]
            }
        }
    }

    /// We proved we can answer; ask the peer to prove it by dialing us.
    fn swap_roles(&mut self, key: &PeerKey) -> Vec<LifecycleEffect> {
        self.probation = false;
        if let Some(conn) = self.get_mut(key) {
            if let Err(e) = conn.send_frame(&ChannelFrame::Handshake { step: Handshake::YouInitiate }) {
                warn!(peer = %key, error = %e, "failed to send youinitiate");
            }
        }
        debug!(peer = %key, "swapping initiator roles");
        self.disconnect(key)
    }

    /// Close and forget a connection. Always reports the removal.
    pub fn disconnect(&mut self, key: &PeerKey) -> Vec<LifecycleEffect> {
        let removed = if key.id == self.local_id {
            self.by_instance.remove(&key.instance)
        } else {
            self.by_peer.remove(&key.id)
        };
        let Some(mut conn) = removed else {
            return Vec::new();
        };
        self.tokens.remove(&conn.token);
        self.dead_timestamps
            .put((conn.key.id, conn.timestamp, conn.initiator), ());
        conn.channel = ChannelState::Closed;
        conn.handle.close();
        debug!(peer = %conn.key, golden = conn.golden, "connection removed");
        vec![LifecycleEffect::Removed {
            key: conn.key,
            was_golden: conn.golden,
        }]
    }

    pub fn disconnect_id(&mut self, id: &RingId) -> Vec<LifecycleEffect> {
        match self.by_peer.get(id).map(|c| c.key.clone()) {
            Some(key) => self.disconnect(&key),
            None => Vec::new(),
        }
    }

    /// Send `frame` to the connection for `id`.
    pub fn send_frame(&mut self, id: &RingId, frame: &ChannelFrame) -> Result<(), TransportError> {
        let conn = self.by_peer.get_mut(id).ok_or(TransportError::Closed)?;
        conn.send_frame(frame)
    }

    /// Send `frame` to a specific session (used for same-id links).
    pub fn send_frame_to(&mut self, key: &PeerKey, frame: &ChannelFrame) -> Result<(), TransportError> {
        let conn = self.get_mut(key).ok_or(TransportError::Closed)?;
        conn.send_frame(frame)
    }

    /// Protect a connection from pruning, telling the peer if it changed.
    pub fn mark_used(&mut self, id: &RingId) {
        if let Some(conn) = self.by_peer.get_mut(id) {
            if !conn.used {
                conn.used = true;
                if let Err(e) = conn.send_frame(&ChannelFrame::MarkUsed) {
                    trace!(peer = %conn.key, error = %e, "markUsed not sent");
                }
            }
        }
    }

    /// Release a connection. Disconnects at once if the peer is not using it.
    pub fn mark_unused(&mut self, id: &RingId) -> Vec<LifecycleEffect> {
        let Some(conn) = self.by_peer.get_mut(id) else {
            return Vec::new();
        };
        if conn.used_by_peer {
            if conn.used {
                conn.used = false;
                if let Err(e) = conn.send_frame(&ChannelFrame::MarkUnused) {
                    trace!(peer = %conn.key, error = %e, "markUnused not sent");
                }
            }
            Vec::new()
        } else {
            debug!(peer = %conn.key, "unused on both ends, disconnecting");
            let key = conn.key.clone();
            self.disconnect(&key)
        }
    }

    /// Tear down connections still negotiating after `timeout`.
    pub fn expire_negotiations(&mut self, timeout: Duration) -> Vec<LifecycleEffect> {
        let now = Instant::now();
        let expired: Vec<PeerKey> = self
            .all()
            .filter(|c| {
                (c.is_negotiating() && now.duration_since(c.started) > timeout)
                    || c.negotiation.is_terminal()
            })
            .map(|c| c.key.clone())
            .collect();
        let mut effects = Vec::new();
        for key in expired {
            debug!(peer = %key, "negotiation timed out");
            effects.extend(self.disconnect(&key));
        }
        effects
    }

    /// Say goodbye on every channel and close everything.
    pub fn shutdown(&mut self) -> Vec<LifecycleEffect> {
        let keys: Vec<PeerKey> = self.all().map(|c| c.key.clone()).collect();
        let mut effects = Vec::new();
        for key in keys {
            if let Some(conn) = self.get_mut(&key) {
                if let Err(e) = conn.send_frame(&ChannelFrame::ByeBye) {
                    debug!(peer = %key, error = %e, "byebye not sent");
                }
            }
            effects.extend(self.disconnect(&key));
        }
        effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{SdpKind, SessionDescription};
    use crate::transport::MemoryNetwork;

    struct Side {
        local: LocalIdentity,
        table: ConnectionTable,
        rx: mpsc::UnboundedReceiver<TransportEvent>,
    }

    impl Side {
        fn new(network: &MemoryNetwork, local: LocalIdentity) -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            let table = ConnectionTable::new(&local, network.transport(local.id), tx, 64);
            Self { local, table, rx }
        }

        /// Drain transport events, returning outgoing signals and other effects.
        fn pump(&mut self) -> (Vec<SignalEnvelope>, Vec<LifecycleEffect>) {
            let mut signals = Vec::new();
            let mut other = Vec::new();
            while let Ok(event) = self.rx.try_recv() {
                for effect in self.table.handle_transport_event(event) {
                    match effect {
                        LifecycleEffect::Signal { signal, .. } => signals.push(signal),
                        e => other.push(e),
                    }
                }
            }
            (signals, other)
        }
    }

    /// Shuttle signals and frames between two sides until both go quiet.
    fn settle(a: &mut Side, b: &mut Side) -> (Vec<LifecycleEffect>, Vec<LifecycleEffect>) {
        let mut effects_a = Vec::new();
        let mut effects_b = Vec::new();
        for _ in 0..20 {
            let (sig_a, eff_a) = a.pump();
            let (sig_b, eff_b) = b.pump();
            let quiet = sig_a.is_empty() && sig_b.is_empty() && eff_a.is_empty() && eff_b.is_empty();
            effects_a.extend(eff_a);
            effects_b.extend(eff_b);
            for signal in sig_a {
                effects_b.extend(b.table.handle_signal(
                    a.local.key(),
                    signal,
                    Signaler::Rendezvous { via: None },
                ));
            }
            for signal in sig_b {
                effects_a.extend(a.table.handle_signal(
                    b.local.key(),
                    signal,
                    Signaler::Rendezvous { via: None },
                ));
            }
            if quiet {
                break;
            }
        }
        (effects_a, effects_b)
    }

    fn golden(effects: &[LifecycleEffect]) -> bool {
        effects.iter().any(|e| matches!(e, LifecycleEffect::Golden { .. }))
    }

    #[test]
    fn handshake_promotes_both_sides_to_golden() {
        let network = MemoryNetwork::new();
        let mut a = Side::new(&network, LocalIdentity::generate());
        let mut b = Side::new(&network, LocalIdentity::generate());
        a.table.set_probation(false);
        b.table.set_probation(false);

        a.table.start(true, b.local.key(), Signaler::Rendezvous { via: None }, None);
        let (ea, eb) = settle(&mut a, &mut b);
        assert!(golden(&ea), "initiator not golden: {:?}", ea);
        assert!(golden(&eb), "answerer not golden: {:?}", eb);
        assert_eq!(a.table.open_golden_ids(), vec![b.local.id]);
        assert_eq!(b.table.open_golden_ids(), vec![a.local.id]);
    }

    #[test]
    fn probationary_answerer_swaps_roles_then_goes_golden() {
        let network = MemoryNetwork::new();
        let mut a = Side::new(&network, LocalIdentity::generate());
        let mut b = Side::new(&network, LocalIdentity::generate());
        // a is still on probation as well; both must prove themselves
        a.table.start(true, b.local.key(), Signaler::Rendezvous { via: None }, None);
        let (ea, eb) = settle(&mut a, &mut b);
        assert!(golden(&ea) && golden(&eb));
        assert!(!a.table.probation());
        assert!(!b.table.probation());
        // b dialed the final link
        let b_conn = b.table.get(&a.local.key()).unwrap();
        assert!(b_conn.initiator);
    }

    #[test]
    fn overlay_signaled_links_skip_probation() {
        let network = MemoryNetwork::new();
        let mut a = Side::new(&network, LocalIdentity::generate());
        let mut b = Side::new(&network, LocalIdentity::generate());
        a.table.start(true, b.local.key(), Signaler::Overlay { path: None }, None);
        // b learns about the attempt through overlay signals
        let (sig_a, _) = a.pump();
        for signal in sig_a {
            b.table.handle_signal(a.local.key(), signal, Signaler::Overlay { path: None });
        }
        let (ea, eb) = settle(&mut a, &mut b);
        assert!(golden(&ea) && golden(&eb));
        assert!(a.table.get(&b.local.key()).unwrap().initiator);
        assert!(a.table.probation());
    }

    #[test]
    fn glare_resolves_to_a_single_link() {
        let network = MemoryNetwork::new();
        let mut a = Side::new(&network, LocalIdentity::generate());
        let mut b = Side::new(&network, LocalIdentity::generate());
        a.table.set_probation(false);
        b.table.set_probation(false);
        a.table.start(true, b.local.key(), Signaler::Rendezvous { via: None }, None);
        b.table.start(true, a.local.key(), Signaler::Rendezvous { via: None }, None);
        let (ea, eb) = settle(&mut a, &mut b);
        assert!(golden(&ea) && golden(&eb));
        let a_init = a.table.get(&b.local.key()).unwrap().initiator;
        let b_init = b.table.get(&a.local.key()).unwrap().initiator;
        assert_ne!(a_init, b_init, "exactly one side keeps the initiator role");
        let a_yields = yield_to_id(a.local.id, b.local.id);
        assert_eq!(a_init, !a_yields);
    }

    #[test]
    fn candidates_wait_for_remote_description() {
        let network = MemoryNetwork::new();
        let mut a = Side::new(&network, LocalIdentity::generate());
        let mut b = Side::new(&network, LocalIdentity::generate());
        a.table.set_probation(false);
        b.table.set_probation(false);
        a.table.start(true, b.local.key(), Signaler::Rendezvous { via: None }, None);
        let (mut signals, _) = a.pump();
        // deliver the candidate before the offer
        signals.reverse();
        assert!(matches!(signals[0].message, SignalMessage::Candidate(_)));
        for signal in signals {
            b.table.handle_signal(a.local.key(), signal, Signaler::Rendezvous { via: None });
        }
        let (ea, eb) = settle(&mut a, &mut b);
        assert!(golden(&ea) && golden(&eb));
    }

    #[test]
    fn signals_for_dead_attempts_are_ignored() {
        let network = MemoryNetwork::new();
        let mut a = Side::new(&network, LocalIdentity::generate());
        let mut b = Side::new(&network, LocalIdentity::generate());
        a.table.start(true, b.local.key(), Signaler::Rendezvous { via: None }, None);
        let (signals, _) = a.pump();
        let offer = signals[0].clone();
        b.table.handle_signal(a.local.key(), offer.clone(), Signaler::Rendezvous { via: None });
        let removed = b.table.disconnect(&a.local.key());
        assert!(matches!(removed[0], LifecycleEffect::Removed { was_golden: false, .. }));
        let effects = b.table.handle_signal(a.local.key(), offer, Signaler::Rendezvous { via: None });
        assert!(effects.is_empty());
        assert!(b.table.get(&a.local.key()).is_none());
    }

    #[test]
    fn newer_attempt_supersedes_open_connection() {
        let network = MemoryNetwork::new();
        let mut a = Side::new(&network, LocalIdentity::generate());
        let mut b = Side::new(&network, LocalIdentity::generate());
        a.table.set_probation(false);
        b.table.set_probation(false);
        a.table.start(true, b.local.key(), Signaler::Rendezvous { via: None }, None);
        settle(&mut a, &mut b);
        let old_ts = b.table.get(&a.local.key()).unwrap().timestamp;
        let newer = SignalEnvelope {
            timestamp: old_ts + 1000,
            initiator: true,
            message: SignalMessage::Description(SessionDescription {
                kind: SdpKind::Offer,
                sdp: "memory-offer:999".into(),
            }),
        };
        let effects = b.table.handle_signal(a.local.key(), newer, Signaler::Rendezvous { via: None });
        assert!(effects.iter().any(|e| matches!(e, LifecycleEffect::Removed { was_golden: true, .. })));
        assert_eq!(b.table.get(&a.local.key()).unwrap().timestamp, old_ts + 1000);
    }

    #[test]
    fn same_identity_sessions_pick_a_controller() {
        let network = MemoryNetwork::new();
        let first = LocalIdentity::generate();
        let mut second_identity = first.new_instance();
        second_identity.instance.created_ms = first.instance.created_ms + 1;
        let mut a = Side::new(&network, first);
        let mut b = Side::new(&network, second_identity);
        a.table.start(true, b.local.key(), Signaler::Rendezvous { via: None }, None);
        let (ea, eb) = settle(&mut a, &mut b);
        assert!(ea.iter().any(|e| matches!(e, LifecycleEffect::AddSubordinate { .. })));
        assert!(eb.iter().any(|e| matches!(e, LifecycleEffect::EnterSubordinate { .. })));
        assert!(a.table.golden_ids().is_empty());
    }

    #[test]
    fn unused_on_both_ends_disconnects() {
        let network = MemoryNetwork::new();
        let mut a = Side::new(&network, LocalIdentity::generate());
        let mut b = Side::new(&network, LocalIdentity::generate());
        a.table.set_probation(false);
        b.table.set_probation(false);
        a.table.start(true, b.local.key(), Signaler::Rendezvous { via: None }, None);
        settle(&mut a, &mut b);

        assert!(a.table.mark_unused(&b.local.id).is_empty());
        let (_, eb) = settle(&mut a, &mut b);
        assert!(eb.is_empty());
        assert!(!b.table.get(&a.local.key()).unwrap().used_by_peer);

        let effects = b.table.mark_unused(&a.local.id);
        assert!(effects.iter().any(|e| matches!(e, LifecycleEffect::Removed { .. })));
    }

    #[test]
    fn shutdown_closes_links_even_when_byebye_fails() {
        let network = MemoryNetwork::new();
        let mut a = Side::new(&network, LocalIdentity::generate());
        let mut b = Side::new(&network, LocalIdentity::generate());
        a.table.set_probation(false);
        b.table.set_probation(false);
        a.table.start(true, b.local.key(), Signaler::Rendezvous { via: None }, None);
        settle(&mut a, &mut b);

        // b says goodbye over a live channel.
        let before = network.delivered();
        let effects = b.table.shutdown();
        assert_eq!(network.delivered(), before + 1);
        assert!(matches!(effects.as_slice(), [LifecycleEffect::Removed { was_golden: true, .. }]));

        // a has not noticed yet, so its goodbye has nowhere to go.
        let effects = a.table.shutdown();
        assert_eq!(network.delivered(), before + 1);
        assert!(matches!(effects.as_slice(), [LifecycleEffect::Removed { was_golden: true, .. }]));
        assert!(a.table.is_empty());
        assert_eq!(network.live_endpoints(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_negotiations_expire() {
        let network = MemoryNetwork::new();
        let mut a = Side::new(&network, LocalIdentity::generate());
        let b = LocalIdentity::generate();
        a.table.start(true, b.key(), Signaler::Rendezvous { via: None }, None);
        assert!(a.table.expire_negotiations(Duration::from_secs(20)).is_empty());
        tokio::time::advance(Duration::from_secs(21)).await;
        let effects = a.table.expire_negotiations(Duration::from_secs(20));
        assert_eq!(effects.len(), 1);
        assert!(a.table.is_empty());
    }
}
