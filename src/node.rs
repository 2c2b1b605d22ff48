//! # Overlay Node
//!
//! A [`Node`] is the public handle to one overlay participant. All state
//! lives in a private `OverlayActor` that serializes every transition on a
//! single task:
//!
//! ```text
//!   Node handle ──Command──►┐
//!   transport events ──────►├─► OverlayActor ──► ConnectionTable / Topology / DhtStore
//!   rendezvous frames ─────►│
//!   maintenance tick ──────►┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! let network = MemoryNetwork::new();
//! let server = RendezvousServer::spawn(RendezvousConfig::default());
//! let identity = LocalIdentity::generate();
//! let node = Node::spawn(identity.clone(), network.transport(identity.id), OverlayConfig::default());
//! node.connect(Arc::new(server.clone())).await?;
//! node.put("room", json!("hello")).await?;
//! let record = node.get("room").await?;
//! ```
//!
//! ## Message Dispatch
//!
//! Envelopes addressed to us are verified ([`crate::crypto::unpack`]) and
//! their kind tag checked before dispatch; everything else goes to the
//! router. Application payloads surface on [`Node::messages`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::OverlayConfig;
use crate::connection::{ConnectionTable, LifecycleEffect, Signaler};
use crate::crypto::{pack, unpack};
use crate::dht::{hash_key, DhtRecord, DhtReply, DhtRequests, DhtStore};
use crate::identity::{InstanceId, LocalIdentity, PeerKey};
use crate::messages::{
    Addressing, BootstrapInfo, ChannelFrame, Envelope, Hello, OverlayMessage, RelayedSignal,
    RendezvousMessage, SignalEnvelope, MAX_PROXIES,
};
use crate::rendezvous::{BlockTime, Dialer, RendezvousLink};
use crate::ring::{directed_distance, Distance, RingId};
use crate::routing::{
    charge_bounce, matches_address, record_hop, retry_decision, select_next_hop, PendingQueue, RetryDecision,
    RouteView,
};
use crate::topology::{Finger, LinkView, Topology};
use crate::transport::{Transport, TransportEvent};

/// A receiver that can be taken exactly once.
type TakeOnce<T> = tokio::sync::Mutex<Option<mpsc::Receiver<T>>>;

/// Buffered application messages before the oldest are refused.
const MESSAGE_BUFFER: usize = 1024;

/// An application message delivered to this node.
#[derive(Clone, Debug, PartialEq)]
pub struct ReceivedMessage {
    pub from: RingId,
    pub kind: String,
    pub data: Value,
}

/// Snapshot of a node's overlay state.
#[derive(Clone, Debug)]
pub struct NodeStatus {
    pub id: RingId,
    pub instance: InstanceId,
    pub flood: Vec<RingId>,
    pub target_flood: Vec<RingId>,
    pub fingers: Vec<Finger>,
    pub connections: usize,
    pub golden: usize,
    pub pending_envelopes: usize,
    pub dht_records: usize,
    pub rendezvous_connected: bool,
    pub initialized: bool,
    pub bad_network: bool,
    pub probation: bool,
    pub subordinate: bool,
    pub subordinates: usize,
}

impl NodeStatus {
    pub fn flood_is_full(&self, flood_size: usize) -> bool {
        self.flood.len() == flood_size * 2 + 1
    }
}

enum Command {
    Attach {
        link: RendezvousLink,
        dialer: Arc<dyn Dialer>,
        reconnect: bool,
        reply: oneshot::Sender<()>,
    },
    Send {
        to: Addressing,
        kind: String,
        data: Value,
    },
    Put {
        key: String,
        value: Value,
        reply: oneshot::Sender<DhtReply>,
    },
    Get {
        key: String,
        reply: oneshot::Sender<DhtReply>,
    },
    BlockTime {
        reply: oneshot::Sender<BlockTime>,
    },
    Status {
        reply: oneshot::Sender<NodeStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

// ============================================================================
// Node Handle
// ============================================================================

pub struct Node {
    id: RingId,
    instance: InstanceId,
    rpc_timeout: Duration,
    cmd_tx: mpsc::Sender<Command>,
    messages_rx: TakeOnce<ReceivedMessage>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id.short_name())
            .field("instance", &self.instance.short_name())
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Start the node's actor. The node is alone until [`Node::connect`].
    pub fn spawn(identity: LocalIdentity, transport: Arc<dyn Transport>, config: OverlayConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (messages_tx, messages_rx) = mpsc::channel(MESSAGE_BUFFER);
        let id = identity.id;
        let instance = identity.instance.clone();
        let rpc_timeout = config.rpc_timeout;

        let actor = OverlayActor::new(identity, transport, config, messages_tx);
        tokio::spawn(actor.run(cmd_rx));
        info!(id = %id.short_name(), instance = %instance.short_name(), "overlay node started");

        Self {
            id,
            instance,
            rpc_timeout,
            cmd_tx,
            messages_rx: tokio::sync::Mutex::new(Some(messages_rx)),
        }
    }

    pub fn id(&self) -> RingId {
        self.id
    }

    pub fn instance(&self) -> &InstanceId {
        &self.instance
    }

    pub fn key(&self) -> PeerKey {
        PeerKey::new(self.id, self.instance.clone())
    }

    /// Join the network through a rendezvous server as a new node.
    pub async fn connect(&self, dialer: Arc<dyn Dialer>) -> Result<()> {
        self.attach(dialer, false).await
    }

    /// Re-open the rendezvous link of a node that was already in the network.
    pub async fn reconnect(&self, dialer: Arc<dyn Dialer>) -> Result<()> {
        self.attach(dialer, true).await
    }

    async fn attach(&self, dialer: Arc<dyn Dialer>, reconnect: bool) -> Result<()> {
        let link = dialer.dial().await.context("failed to reach rendezvous")?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Attach {
                link,
                dialer,
                reconnect,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("node actor closed"))?;
        reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("node actor closed"))
    }

    /// Send an application message to a specific node.
    pub async fn send(&self, kind: &str, to: RingId, data: Value) -> Result<()> {
        self.send_addressed(Addressing::To(to), kind, data).await
    }

    /// Send an application message to whichever node is closest to `key`.
    pub async fn send_to_closest(&self, kind: &str, key: RingId, data: Value) -> Result<()> {
        self.send_addressed(Addressing::ToClosest(key), kind, data).await
    }

    async fn send_addressed(&self, to: Addressing, kind: &str, data: Value) -> Result<()> {
        self.cmd_tx
            .send(Command::Send {
                to,
                kind: kind.to_string(),
                data,
            })
            .await
            .map_err(|_| anyhow::anyhow!("node actor closed"))
    }

    /// Store `value` under `key`, owned by this node.
    pub async fn put(&self, key: &str, value: Value) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Put {
                key: key.to_string(),
                value,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("node actor closed"))?;
        match self.await_reply(reply_rx, "dht put").await? {
            DhtReply::Stored => Ok(()),
            DhtReply::Values(_) => anyhow::bail!("unexpected reply to dht put"),
        }
    }

    /// Every owner's value under `key`.
    pub async fn get(&self, key: &str) -> Result<DhtRecord> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Get {
                key: key.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("node actor closed"))?;
        match self.await_reply(reply_rx, "dht get").await? {
            DhtReply::Values(values) => Ok(values),
            DhtReply::Stored => anyhow::bail!("unexpected reply to dht get"),
        }
    }

    async fn await_reply<T>(&self, reply_rx: oneshot::Receiver<T>, what: &str) -> Result<T> {
        match tokio::time::timeout(self.rpc_timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => anyhow::bail!("node actor closed during {}", what),
            Err(_) => anyhow::bail!("{} timed out after {:?}", what, self.rpc_timeout),
        }
    }

    /// Network epoch from the rendezvous server.
    pub async fn block_time(&self) -> Result<BlockTime> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::BlockTime { reply: reply_tx })
            .await
            .map_err(|_| anyhow::anyhow!("node actor closed"))?;
        self.await_reply(reply_rx, "getblock").await
    }

    pub async fn status(&self) -> Result<NodeStatus> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Status { reply: reply_tx })
            .await
            .map_err(|_| anyhow::anyhow!("node actor closed"))?;
        reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("node actor closed"))
    }

    pub async fn flood(&self) -> Result<Vec<RingId>> {
        Ok(self.status().await?.flood)
    }

    pub async fn fingers(&self) -> Result<Vec<Finger>> {
        Ok(self.status().await?.fingers)
    }

    /// Application messages addressed to this node. Can be taken once.
    pub async fn messages(&self) -> Result<mpsc::Receiver<ReceivedMessage>> {
        let mut guard = self.messages_rx.lock().await;
        guard.take().context("message receiver already taken")
    }

    /// Say goodbye to every peer and the rendezvous, then stop the actor.
    pub async fn shutdown(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Shutdown { reply: reply_tx })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }
}

// ============================================================================
// Overlay Actor
// ============================================================================

struct OverlayActor {
    local: LocalIdentity,
    config: OverlayConfig,
    connections: ConnectionTable,
    topology: Topology,
    pending: PendingQueue,
    store: DhtStore,
    requests: DhtRequests,
    events_rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    rendezvous_tx: Option<mpsc::UnboundedSender<RendezvousMessage>>,
    rendezvous_rx: Option<mpsc::UnboundedReceiver<RendezvousMessage>>,
    dialer: Option<Arc<dyn Dialer>>,
    redial_tx: mpsc::UnboundedSender<(Result<RendezvousLink>, bool)>,
    redial_rx: Option<mpsc::UnboundedReceiver<(Result<RendezvousLink>, bool)>>,
    redialing: bool,
    messages_tx: mpsc::Sender<ReceivedMessage>,
    block_waiters: Vec<oneshot::Sender<BlockTime>>,
    /// Ids we sent `ringring` to, and when.
    rung: HashMap<RingId, Instant>,
    /// Earlier session of our id that we route through.
    controller: Option<PeerKey>,
    subordinates: HashSet<PeerKey>,
    initialized: bool,
    bad_network: bool,
    shutting_down: bool,
}

async fn next_frame(
    inbound: &mut Option<mpsc::UnboundedReceiver<RendezvousMessage>>,
) -> Option<Option<RendezvousMessage>> {
    match inbound {
        Some(rx) => Some(rx.recv().await),
        None => std::future::pending().await,
    }
}

impl OverlayActor {
    fn new(
        local: LocalIdentity,
        transport: Arc<dyn Transport>,
        config: OverlayConfig,
        messages_tx: mpsc::Sender<ReceivedMessage>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (redial_tx, redial_rx) = mpsc::unbounded_channel();
        let connections = ConnectionTable::new(&local, transport, events_tx, config.dead_timestamp_capacity);
        let topology = Topology::new(local.id, config.flood_size);
        let pending = PendingQueue::new(config.max_pending_envelopes);
        let seed = u64::from(rand::random::<u32>()) << 20;
        Self {
            local,
            config,
            connections,
            topology,
            pending,
            store: DhtStore::new(),
            requests: DhtRequests::starting_after(seed),
            events_rx: Some(events_rx),
            rendezvous_tx: None,
            rendezvous_rx: None,
            dialer: None,
            redial_tx,
            redial_rx: Some(redial_rx),
            redialing: false,
            messages_tx,
            block_waiters: Vec::new(),
            rung: HashMap::new(),
            controller: None,
            subordinates: HashSet::new(),
            initialized: false,
            bad_network: false,
            shutting_down: false,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        let mut maintenance_interval = tokio::time::interval(self.config.maintenance_interval);
        maintenance_interval.tick().await; // Skip initial tick

        let (Some(mut events_rx), Some(mut redial_rx)) = (self.events_rx.take(), self.redial_rx.take()) else {
            return;
        };

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Shutdown { reply }) => {
                            self.close_all();
                            let _ = reply.send(());
                            debug!("overlay actor shutting down");
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd),
                        None => {
                            self.close_all();
                            debug!("overlay actor shutting down");
                            break;
                        }
                    }
                }
                Some(event) = events_rx.recv() => {
                    let effects = self.connections.handle_transport_event(event);
                    self.apply(effects);
                }
                frame = next_frame(&mut self.rendezvous_rx) => {
                    match frame {
                        Some(Some(message)) => self.handle_rendezvous(message),
                        _ => {
                            debug!("rendezvous link closed");
                            self.rendezvous_tx = None;
                            self.rendezvous_rx = None;
                        }
                    }
                }
                Some((result, reconnect)) = redial_rx.recv() => {
                    self.redialing = false;
                    match result {
                        Ok(link) => self.attach_rendezvous(link, reconnect),
                        Err(e) => warn!(error = %e, "rendezvous redial failed"),
                    }
                }
                _ = maintenance_interval.tick() => {
                    self.maintain();
                }
            }
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Attach {
                link,
                dialer,
                reconnect,
                reply,
            } => {
                self.dialer = Some(dialer);
                self.attach_rendezvous(link, reconnect);
                let _ = reply.send(());
            }
            Command::Send { to, kind, data } => {
                self.send_message(to, OverlayMessage::App { kind, data }, None);
            }
            Command::Put { key, value, reply } => self.dht_put(&key, value, reply),
            Command::Get { key, reply } => self.dht_get(&key, reply),
            Command::BlockTime { reply } => {
                self.block_waiters.push(reply);
                if self.block_waiters.len() == 1 {
                    self.send_rendezvous(RendezvousMessage::GetBlock);
                }
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.local.id,
            instance: self.local.instance.clone(),
            flood: self.topology.flood().to_vec(),
            target_flood: self.topology.target_flood().to_vec(),
            fingers: self.topology.fingers().to_vec(),
            connections: self.connections.len(),
            golden: self.connections.golden_ids().len(),
            pending_envelopes: self.pending.len(),
            dht_records: self.store.len(),
            rendezvous_connected: self.rendezvous_tx.is_some(),
            initialized: self.initialized,
            bad_network: self.bad_network,
            probation: self.connections.probation(),
            subordinate: self.controller.is_some(),
            subordinates: self.subordinates.len(),
        }
    }

    fn close_all(&mut self) {
        self.shutting_down = true;
        let effects = self.connections.shutdown();
        self.apply(effects);
        self.send_rendezvous(RendezvousMessage::ByeBye);
        self.rendezvous_tx = None;
        self.rendezvous_rx = None;
    }

    // ------------------------------------------------------------------------
    // Lifecycle effects
    // ------------------------------------------------------------------------

    fn apply(&mut self, effects: Vec<LifecycleEffect>) {
        for effect in effects {
            match effect {
                LifecycleEffect::Signal { to, signaler, signal } => {
                    self.send_signal(to, signaler, signal);
                }
                LifecycleEffect::Changed => self.recompute(),
                LifecycleEffect::Golden {
                    key,
                    bootstrap,
                    confirm_via_rendezvous,
                } => self.on_golden(key, bootstrap, confirm_via_rendezvous),
                LifecycleEffect::Removed { key, was_golden } => self.on_removed(key, was_golden),
                LifecycleEffect::EnterSubordinate { controller } => {
                    info!(controller = %controller, "entering subordinate mode");
                    self.send_rendezvous(RendezvousMessage::ByeBye);
                    self.rendezvous_tx = None;
                    self.rendezvous_rx = None;
                    self.controller = Some(controller);
                    for envelope in self.pending.drain_for_retry(self.local.id) {
                        self.proxy(envelope);
                    }
                }
                LifecycleEffect::AddSubordinate { key } => {
                    info!(subordinate = %key, "added subordinate session");
                    self.subordinates.insert(key);
                }
                LifecycleEffect::Incoming(envelope) => self.on_envelope(envelope),
            }
        }
    }

    fn recompute(&mut self) {
        let golden = self.connections.golden_ids();
        let pending_or_active = self.connections.pending_or_active_ids();
        self.topology.recompute(&golden, &pending_or_active);
    }

    fn on_golden(&mut self, key: PeerKey, bootstrap: Option<BootstrapInfo>, confirm_via_rendezvous: bool) {
        self.recompute();
        if !self.initialized {
            if let Some(info) = bootstrap {
                for id in info.fingers.iter().chain(info.flood.iter()) {
                    self.connect_to(*id, None);
                }
                if info.flood.len() >= self.topology.total_flood_size() {
                    if let (Some(first), Some(last)) = (info.flood.first(), info.flood.last()) {
                        self.send_message(Addressing::To(*first), OverlayMessage::GetFlood, None);
                        self.send_message(Addressing::To(*last), OverlayMessage::GetFlood, None);
                    }
                }
            }
            self.initialized = true;
            info!(peer = %key, "joined overlay");
        } else if !self.topology.is_full() {
            let report: Vec<RingId> = self
                .topology
                .flood()
                .iter()
                .copied()
                .filter(|id| *id != self.local.id && *id != key.id && self.connections.is_open(id))
                .collect();
            let flood = self.topology.target_flood().to_vec();
            for id in report {
                self.send_message(
                    Addressing::To(id),
                    OverlayMessage::FloodReport { flood: flood.clone() },
                    None,
                );
            }
        }
        if confirm_via_rendezvous {
            self.send_rendezvous(RendezvousMessage::Confirm {
                from: self.local.id,
                from_instance: self.local.instance.clone(),
                confirmed: key.id,
            });
        }
        for envelope in self.pending.drain_for_retry(self.local.id) {
            self.proxy(envelope);
        }
    }

    fn on_removed(&mut self, key: PeerKey, was_golden: bool) {
        if key.id == self.local.id {
            self.subordinates.remove(&key);
            if self.controller.as_ref() == Some(&key) {
                self.controller = None;
                if !self.shutting_down {
                    info!("controller session gone, leaving subordinate mode");
                    self.redial(false);
                }
            }
            return;
        }
        let was_full = self.topology.is_full();
        let before = self.topology.flood().to_vec();
        self.recompute();
        if self.shutting_down || !was_golden || !was_full {
            return;
        }
        let (Some(lost), Some(me)) = (
            before.iter().position(|id| *id == key.id),
            before.iter().position(|id| *id == self.local.id),
        ) else {
            return;
        };
        let flood = self.topology.flood();
        let edge = if lost < me { flood.first() } else { flood.last() };
        if let Some(edge) = edge.copied().filter(|edge| *edge != self.local.id) {
            debug!(lost = %key.id.short_name(), edge = %edge.short_name(), "flood member lost, asking edge");
            self.send_message(Addressing::To(edge), OverlayMessage::GetFlood, None);
        }
    }

    fn relayed(&self, target: &PeerKey, overlay_to: Option<RingId>, signal: SignalEnvelope) -> RelayedSignal {
        RelayedSignal {
            to: target.id,
            to_instance: target.instance.clone(),
            from: self.local.id,
            from_instance: self.local.instance.clone(),
            signal,
            overlay_to,
            socket_proxy: None,
        }
    }

    fn send_signal(&mut self, to: PeerKey, signaler: Signaler, signal: SignalEnvelope) {
        match signaler {
            Signaler::Overlay { path } => {
                self.send_message(Addressing::To(to.id), OverlayMessage::Signal { signal }, path);
            }
            Signaler::Rendezvous { via: None } => {
                let relayed = self.relayed(&to, None, signal);
                self.send_rendezvous(RendezvousMessage::Signal { relayed });
            }
            Signaler::Rendezvous { via: Some(proxy) } => {
                // The peer only hears us through another node's socket.
                let relayed = self.relayed(&proxy, Some(to.id), signal);
                self.send_rendezvous(RendezvousMessage::Signal { relayed });
            }
            Signaler::OverlayToRendezvous { proxy } => {
                let relayed = self.relayed(&to, None, signal);
                self.send_message(Addressing::To(proxy), OverlayMessage::ProxySignal { relayed }, None);
            }
        }
    }

    /// Ask `id` to dial us, unless we already have or recently asked for a link.
    fn connect_to(&mut self, id: RingId, path: Option<Vec<RingId>>) {
        if id == self.local.id || self.connections.contains_id(&id) {
            return;
        }
        let now = Instant::now();
        if let Some(at) = self.rung.get(&id) {
            if now.duration_since(*at) < self.config.ring_dedupe {
                return;
            }
        }
        self.rung.insert(id, now);
        trace!(peer = %id.short_name(), "ringring");
        self.send_message(Addressing::To(id), OverlayMessage::RingRing, path);
    }

    fn augment_flood(&mut self, seen: &[RingId]) {
        let connected = self.connections.pending_or_active_ids();
        for id in self.topology.augment_candidates(seen, &connected) {
            self.connect_to(id, None);
        }
    }

    // ------------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------------

    fn send_message(&mut self, to: Addressing, body: OverlayMessage, path: Option<Vec<RingId>>) {
        let data = match pack(&body, &self.local.keypair) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "failed to sign overlay message");
                return;
            }
        };
        let envelope = Envelope {
            from: self.local.id,
            from_instance: self.local.instance.clone(),
            to,
            kind: body.kind(),
            proxies: vec![self.local.id],
            path,
            data,
            retries: 0,
            hop_from: None,
        };
        let local_only = match to {
            Addressing::To(id) => id == self.local.id,
            Addressing::ToClosest(_) => self.controller.is_none() && self.topology.flood().len() <= 1,
        };
        if local_only {
            self.deliver(envelope, body);
        } else {
            self.proxy(envelope);
        }
    }

    fn proxy(&mut self, mut envelope: Envelope) {
        if let Some(controller) = self.controller.clone() {
            let frame = ChannelFrame::Overlay { envelope };
            if let Err(e) = self.connections.send_frame_to(&controller, &frame) {
                trace!(error = %e, "controller link unavailable");
                if let ChannelFrame::Overlay { envelope } = frame {
                    self.requeue(envelope);
                }
            }
            return;
        }

        let seen = envelope.proxies.clone();
        self.augment_flood(&seen);

        let open = self.connections.open_golden_ids();
        let view = RouteView {
            local: self.local.id,
            open: &open,
            flood_full: self.topology.is_full(),
        };
        let Some(next) = select_next_hop(&envelope, &view) else {
            self.requeue(envelope);
            return;
        };
        if !charge_bounce(&mut envelope, next, self.config.max_retries) {
            trace!(kind = ?envelope.kind, retries = envelope.retries, "bounce budget spent");
            self.requeue(envelope);
            return;
        }
        record_hop(&mut envelope, self.local.id, next);
        trace!(kind = ?envelope.kind, next = %next.short_name(), "forwarding envelope");
        let frame = ChannelFrame::Overlay { envelope };
        if let Err(e) = self.connections.send_frame(&next, &frame) {
            debug!(next = %next.short_name(), error = %e, "send failed");
            if let ChannelFrame::Overlay { envelope } = frame {
                self.requeue(envelope);
            }
        }
    }

    fn requeue(&mut self, mut envelope: Envelope) {
        envelope.retries += 1;
        let negotiating = self.connections.has_negotiating();
        let any_open = !self.connections.open_golden_ids().is_empty();
        match retry_decision(envelope.retries, self.config.max_retries, negotiating, any_open) {
            RetryDecision::Requeue => self.pending.push(envelope),
            RetryDecision::Drop => {
                debug!(
                    kind = ?envelope.kind,
                    to = %envelope.to.target().short_name(),
                    proxies = envelope.proxies.len(),
                    retries = envelope.retries,
                    "dropping undeliverable envelope"
                );
            }
        }
    }

    fn on_envelope(&mut self, envelope: Envelope) {
        if envelope.proxies.len() > MAX_PROXIES {
            warn!(from = %envelope.from.short_name(), "proxy history too long, dropping");
            return;
        }
        let open = self.connections.open_golden_ids();
        let view = RouteView {
            local: self.local.id,
            open: &open,
            flood_full: self.topology.is_full(),
        };
        if !matches_address(&envelope, &view) {
            self.proxy(envelope);
            return;
        }
        let body: OverlayMessage = match unpack(&envelope.from, &envelope.data) {
            Ok(body) => body,
            Err(e) => {
                warn!(from = %envelope.from.short_name(), error = %e, "dropping unauthenticated envelope");
                return;
            }
        };
        if body.kind() != envelope.kind {
            warn!(
                from = %envelope.from.short_name(),
                tagged = ?envelope.kind,
                signed = ?body.kind(),
                "envelope kind does not match signed body"
            );
            return;
        }
        self.deliver(envelope, body);
    }

    fn deliver(&mut self, envelope: Envelope, body: OverlayMessage) {
        let from = envelope.from;
        let from_key = PeerKey::new(from, envelope.from_instance.clone());
        trace!(kind = ?envelope.kind, from = %from.short_name(), "envelope arrived");
        match body {
            OverlayMessage::RingRing => {
                let effects = self.connections.start(
                    true,
                    from_key,
                    Signaler::Overlay {
                        path: Some(envelope.proxies),
                    },
                    None,
                );
                self.apply(effects);
            }
            OverlayMessage::Signal { signal } => {
                let effects = self.connections.handle_signal(
                    from_key,
                    signal,
                    Signaler::Overlay {
                        path: Some(envelope.proxies),
                    },
                );
                self.apply(effects);
            }
            OverlayMessage::GetFlood => {
                let flood = self.topology.target_flood().to_vec();
                self.send_message(Addressing::To(from), OverlayMessage::FloodReport { flood }, None);
            }
            OverlayMessage::FloodReport { flood } => self.augment_flood(&flood),
            OverlayMessage::FindFinger { level } => {
                self.send_message(Addressing::To(from), OverlayMessage::FingerCandidate { level }, None);
            }
            OverlayMessage::FingerCandidate { level } => {
                if self.topology.offer_finger(level, from) {
                    debug!(level, finger = %from.short_name(), "finger found");
                    self.connect_to(from, Some(envelope.proxies));
                } else {
                    trace!(level, candidate = %from.short_name(), "finger candidate declined");
                }
            }
            OverlayMessage::FindSocket { traveled } => {
                if self.rendezvous_tx.is_some() {
                    self.send_around(Some(traveled));
                } else {
                    self.redial(true);
                }
            }
            OverlayMessage::CheckForId => {
                self.send_message(Addressing::To(from), OverlayMessage::ImHere, None);
            }
            OverlayMessage::ImHere => {
                debug!(peer = %from.short_name(), "reachable, confirming");
                self.send_rendezvous(RendezvousMessage::Confirm {
                    from: self.local.id,
                    from_instance: self.local.instance.clone(),
                    confirmed: from,
                });
            }
            OverlayMessage::AreYouThere { newcomer } => {
                if envelope.to.target() == self.local.id {
                    let effects = self.connections.start(
                        true,
                        newcomer,
                        Signaler::OverlayToRendezvous { proxy: from },
                        None,
                    );
                    self.apply(effects);
                } else {
                    let bootstrap = BootstrapInfo {
                        flood: self.topology.target_flood().to_vec(),
                        fingers: self.topology.finger_ids(),
                    };
                    self.send_message(
                        Addressing::To(from),
                        OverlayMessage::NotHere { newcomer, bootstrap },
                        None,
                    );
                }
            }
            OverlayMessage::NotHere { newcomer, bootstrap } => {
                self.connections.set_connect_info(newcomer.clone(), bootstrap);
                let effects = self
                    .connections
                    .start(true, newcomer, Signaler::Rendezvous { via: None }, None);
                self.apply(effects);
            }
            OverlayMessage::ProxySignal { mut relayed } => {
                relayed.socket_proxy = Some(self.local.key());
                self.send_rendezvous(RendezvousMessage::Signal { relayed });
            }
            OverlayMessage::SignalReceive { relayed } => {
                let key = PeerKey::new(relayed.from, relayed.from_instance);
                let effects = self.connections.handle_signal(
                    key,
                    relayed.signal,
                    Signaler::OverlayToRendezvous { proxy: from },
                );
                self.apply(effects);
            }
            OverlayMessage::DhtPut { request, value } => {
                self.store.put(envelope.to.target(), from, value);
                self.send_message(Addressing::To(from), OverlayMessage::DhtPutAck { request }, None);
            }
            OverlayMessage::DhtGet { request } => {
                let values = self.store.get(&envelope.to.target());
                self.send_message(Addressing::To(from), OverlayMessage::DhtGot { request, values }, None);
            }
            OverlayMessage::DhtPutAck { request } => {
                if !self.requests.complete(request, DhtReply::Stored) {
                    self.forward_to_subordinates(envelope);
                }
            }
            OverlayMessage::DhtGot { request, values } => {
                if !self.requests.complete(request, DhtReply::Values(values)) {
                    self.forward_to_subordinates(envelope);
                }
            }
            OverlayMessage::App { kind, data } => {
                let message = ReceivedMessage { from, kind, data };
                if let Err(e) = self.messages_tx.try_send(message) {
                    warn!(error = %e, "application message dropped");
                }
            }
        }
    }

    /// Replies for our id that none of our requests match belong to a
    /// later session.
    fn forward_to_subordinates(&mut self, mut envelope: Envelope) {
        if self.subordinates.is_empty() {
            return;
        }
        envelope.hop_from = None;
        let frame = ChannelFrame::Overlay { envelope };
        let subordinates: Vec<PeerKey> = self.subordinates.iter().cloned().collect();
        for key in subordinates {
            if let Err(e) = self.connections.send_frame_to(&key, &frame) {
                trace!(subordinate = %key, error = %e, "forward to subordinate failed");
            }
        }
    }

    /// Pass `findsocket` clockwise, ending after one full turn.
    fn send_around(&mut self, traveled: Option<Distance>) {
        let flood = self.topology.flood();
        let me = flood.iter().position(|id| *id == self.local.id).unwrap_or(0);
        let next = flood[(me + 1) % flood.len()];
        if next == self.local.id {
            return;
        }
        let step = directed_distance(self.local.id, next);
        let total = match traveled {
            Some(traveled) => traveled.checked_add(step),
            None => Some(step),
        };
        match total {
            Some(traveled) => {
                self.send_message(Addressing::To(next), OverlayMessage::FindSocket { traveled }, None);
            }
            None => debug!("findsocket made it around the ring"),
        }
    }

    // ------------------------------------------------------------------------
    // DHT
    // ------------------------------------------------------------------------

    fn dht_put(&mut self, key: &str, value: Value, reply: oneshot::Sender<DhtReply>) {
        let position = hash_key(key);
        if self.controller.is_none() && self.topology.in_flood_range(position) {
            self.store.put(position, self.local.id, value);
            let _ = reply.send(DhtReply::Stored);
            return;
        }
        let request = self.requests.register(reply);
        self.send_message(
            Addressing::ToClosest(position),
            OverlayMessage::DhtPut { request, value },
            None,
        );
    }

    fn dht_get(&mut self, key: &str, reply: oneshot::Sender<DhtReply>) {
        let position = hash_key(key);
        if self.controller.is_none() && self.topology.in_flood_range(position) {
            let _ = reply.send(DhtReply::Values(self.store.get(&position)));
            return;
        }
        let request = self.requests.register(reply);
        self.send_message(Addressing::ToClosest(position), OverlayMessage::DhtGet { request }, None);
    }

    // ------------------------------------------------------------------------
    // Rendezvous link
    // ------------------------------------------------------------------------

    fn attach_rendezvous(&mut self, link: RendezvousLink, reconnect: bool) {
        if self.controller.is_some() {
            debug!("subordinate session, ignoring rendezvous link");
            return;
        }
        self.rendezvous_tx = Some(link.outbound);
        self.rendezvous_rx = Some(link.inbound);
        self.connections.set_probation(true);
        let hello = Hello {
            from: self.local.id,
            from_instance: self.local.instance.clone(),
        };
        let packet = match pack(&hello, &self.local.keypair) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(error = %e, "failed to sign hello");
                return;
            }
        };
        let verify_id = self.local.id;
        let message = if reconnect {
            RendezvousMessage::Reconnect { verify_id, packet }
        } else {
            RendezvousMessage::Bootstrap { verify_id, packet }
        };
        info!(reconnect, "rendezvous link open");
        self.send_rendezvous(message);
        if !self.block_waiters.is_empty() {
            self.send_rendezvous(RendezvousMessage::GetBlock);
        }
    }

    fn send_rendezvous(&mut self, message: RendezvousMessage) {
        let Some(tx) = &self.rendezvous_tx else {
            trace!("no rendezvous link");
            return;
        };
        if tx.send(message).is_err() {
            debug!("rendezvous link gone");
            self.rendezvous_tx = None;
        }
    }

    fn redial(&mut self, reconnect: bool) {
        if self.redialing {
            return;
        }
        let Some(dialer) = self.dialer.clone() else {
            debug!("no dialer to reach rendezvous");
            return;
        };
        self.redialing = true;
        let tx = self.redial_tx.clone();
        tokio::spawn(async move {
            let result = dialer.dial().await;
            let _ = tx.send((result, reconnect));
        });
    }

    fn handle_rendezvous(&mut self, message: RendezvousMessage) {
        match message {
            RendezvousMessage::Introduce { from, from_instance } => {
                let newcomer = PeerKey::new(from, from_instance);
                if from == self.local.id {
                    let effects = self
                        .connections
                        .start(true, newcomer, Signaler::Rendezvous { via: None }, None);
                    self.apply(effects);
                } else {
                    debug!(newcomer = %newcomer, "introducing newcomer");
                    self.send_message(
                        Addressing::ToClosest(from),
                        OverlayMessage::AreYouThere { newcomer },
                        None,
                    );
                }
            }
            RendezvousMessage::CheckForId { id } => {
                self.send_message(Addressing::To(id), OverlayMessage::CheckForId, None);
            }
            RendezvousMessage::FindSocket => self.send_around(None),
            RendezvousMessage::BlockTime {
                day,
                block,
                time_till_end,
            } => {
                let time = BlockTime {
                    day,
                    block,
                    time_till_end,
                };
                for waiter in self.block_waiters.drain(..) {
                    let _ = waiter.send(time);
                }
            }
            RendezvousMessage::BadNetwork => {
                warn!("rendezvous reports bad network, restarting bootstrap");
                self.bad_network = true;
                let stalled: Vec<PeerKey> = self
                    .connections
                    .summaries()
                    .into_iter()
                    .filter(|c| !c.golden)
                    .map(|c| c.key)
                    .collect();
                for key in stalled {
                    let effects = self.connections.disconnect(&key);
                    self.apply(effects);
                }
                let hello = Hello {
                    from: self.local.id,
                    from_instance: self.local.instance.clone(),
                };
                match pack(&hello, &self.local.keypair) {
                    Ok(packet) => self.send_rendezvous(RendezvousMessage::Bootstrap {
                        verify_id: self.local.id,
                        packet,
                    }),
                    Err(e) => warn!(error = %e, "failed to sign hello"),
                }
            }
            RendezvousMessage::Signal { relayed } => match relayed.overlay_to {
                Some(target) => {
                    self.send_message(Addressing::To(target), OverlayMessage::SignalReceive { relayed }, None);
                }
                None => {
                    let key = PeerKey::new(relayed.from, relayed.from_instance);
                    let effects = self.connections.handle_signal(
                        key,
                        relayed.signal,
                        Signaler::Rendezvous {
                            via: relayed.socket_proxy,
                        },
                    );
                    self.apply(effects);
                }
            },
            RendezvousMessage::Ping => self.send_rendezvous(RendezvousMessage::Pong),
            RendezvousMessage::Pong => {}
            RendezvousMessage::ByeBye => {
                debug!("rendezvous said goodbye");
                self.rendezvous_tx = None;
                self.rendezvous_rx = None;
            }
            other => debug!(message = ?other, "unexpected rendezvous frame"),
        }
    }

    // ------------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------------

    fn maintain(&mut self) {
        for envelope in self.pending.drain_for_retry(self.local.id) {
            self.proxy(envelope);
        }
        let pruned = self.requests.prune_abandoned();
        if pruned > 0 {
            debug!(pruned, "forgot timed-out dht requests");
        }
        let now = Instant::now();
        let dedupe = self.config.ring_dedupe;
        self.rung.retain(|_, at| now.duration_since(*at) < dedupe);

        if self.controller.is_some() {
            return;
        }

        let effects = self.connections.expire_negotiations(self.config.connection_timeout);
        self.apply(effects);
        self.recompute();

        let links: Vec<LinkView> = self
            .connections
            .golden_ids()
            .into_iter()
            .filter_map(|id| {
                self.connections.last_use(&id).map(|last_use| LinkView {
                    id,
                    open: self.connections.is_open(&id),
                    last_use,
                })
            })
            .collect();
        let plan = self.topology.maintain(
            &links,
            now,
            self.config.stale_after,
            self.config.retained_extra,
        );
        for (level, ideal) in plan.finger_queries {
            self.send_message(Addressing::ToClosest(ideal), OverlayMessage::FindFinger { level }, None);
        }
        for id in plan.mark_used {
            self.connections.mark_used(&id);
        }
        for id in plan.mark_unused {
            let effects = self.connections.mark_unused(&id);
            self.apply(effects);
        }

        if self.initialized && !self.topology.is_full() {
            let flood = self.topology.flood();
            let mut edges: Vec<RingId> = [flood.first(), flood.last()]
                .into_iter()
                .flatten()
                .copied()
                .filter(|id| *id != self.local.id)
                .collect();
            edges.dedup();
            for edge in edges {
                self.send_message(Addressing::To(edge), OverlayMessage::GetFlood, None);
            }
        }
        trace!(
            flood = self.topology.flood().len(),
            fingers = self.topology.fingers().len(),
            connections = self.connections.len(),
            pending = self.pending.len(),
            "maintenance tick"
        );
    }
}
