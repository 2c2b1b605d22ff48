//! # Rendezvous Admission
//!
//! The rendezvous server is the only fixed point of the network. Nodes keep
//! one socket to it; it introduces newcomers to existing nodes and relays
//! their signaling until a direct link exists.
//!
//! ## Pools
//!
//! | Pool | Holds | Used for |
//! |------|-------|----------|
//! | probation | every new socket | pairing when no verified socket exists |
//! | verified | sockets confirmed by a peer (bounded) | preferred introducers |
//!
//! Both pools hand out sockets round-robin.
//!
//! ## Protocol
//!
//! - `bootstrap`: pair with a verified (else probationary) socket, forward an
//!   `introduce` to it, and record each side as the other's confirmer. If
//!   the newcomer is not confirmed before the probation timeout it receives
//!   `badnetwork`.
//! - `confirm`: a confirmer vouches for a probationary socket, which is
//!   promoted to verified. A full verified pool evicts its oldest entry.
//! - `reconnect`: ask the first verified socket to `checkforid` the node.
//! - A second session of an id already connected is parked as a
//!   subordinate socket and introduced to the first session.
//! - Closing a socket while the verified pool is under capacity asks a
//!   verified node to `findsocket` around the ring.
//!
//! Evicted sockets stay routable for a linger period before being closed.
//!
//! ## Transports
//!
//! In-process nodes attach directly ([`RendezvousServer::attach`]); remote
//! nodes use newline-delimited JSON over TCP ([`serve_tcp`] / [`TcpDialer`]).
//! Both produce a [`RendezvousLink`], and nodes dial through the [`Dialer`]
//! trait.

use std::collections::{HashMap, HashSet};

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::RendezvousConfig;
use crate::crypto::unpack;
use crate::identity::{now_ms, InstanceId, PeerKey};
use crate::messages::{decode_frame, encode_frame, Hello, RelayedSignal, RendezvousMessage};
use crate::ring::RingId;

const MILLIS_PER_DAY: u64 = 24 * 60 * 60 * 1000;
const MILLIS_PER_BLOCK: u64 = 10 * 60 * 1000;
/// Day number the epoch counts from.
const EPOCH_DAY_OFFSET: i64 = 16850;

/// Network epoch: ten-minute blocks within a UTC day.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockTime {
    pub day: i64,
    pub block: u64,
    /// Milliseconds until the next block starts.
    pub time_till_end: u64,
}

pub fn block_time(now_ms: u64) -> BlockTime {
    let day = now_ms / MILLIS_PER_DAY;
    let into_day = now_ms % MILLIS_PER_DAY;
    let block = into_day / MILLIS_PER_BLOCK;
    let next_start = day * MILLIS_PER_DAY + (block + 1) * MILLIS_PER_BLOCK;
    BlockTime {
        day: day as i64 - EPOCH_DAY_OFFSET,
        block,
        time_till_end: next_start - now_ms,
    }
}

impl From<BlockTime> for RendezvousMessage {
    fn from(time: BlockTime) -> Self {
        RendezvousMessage::BlockTime {
            day: time.day,
            block: time.block,
            time_till_end: time.time_till_end,
        }
    }
}

// ============================================================================
// Links and Dialing
// ============================================================================

/// A node's end of a rendezvous socket. Dropping `outbound` closes it.
#[derive(Debug)]
pub struct RendezvousLink {
    pub outbound: mpsc::UnboundedSender<RendezvousMessage>,
    pub inbound: mpsc::UnboundedReceiver<RendezvousMessage>,
}

/// Opens rendezvous links for a node.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self) -> anyhow::Result<RendezvousLink>;
}

#[async_trait]
impl Dialer for RendezvousServer {
    async fn dial(&self) -> anyhow::Result<RendezvousLink> {
        self.attach().await
    }
}

/// Dials a rendezvous server exposed with [`serve_tcp`].
#[derive(Clone, Debug)]
pub struct TcpDialer {
    addr: String,
}

impl TcpDialer {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self) -> anyhow::Result<RendezvousLink> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .with_context(|| format!("failed to connect to rendezvous at {}", self.addr))?;
        let (outbound, mut to_socket) = mpsc::unbounded_channel();
        let (from_socket, inbound) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            if let Err(e) = bridge_lines(stream, &mut to_socket, &from_socket).await {
                debug!(error = %e, "rendezvous tcp link ended");
            }
        });
        Ok(RendezvousLink { outbound, inbound })
    }
}

/// Shuttle newline-delimited JSON frames between a TCP stream and channels.
async fn bridge_lines(
    stream: TcpStream,
    outgoing: &mut mpsc::UnboundedReceiver<RendezvousMessage>,
    incoming: &mpsc::UnboundedSender<RendezvousMessage>,
) -> anyhow::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    return Ok(());
                };
                if line.trim().is_empty() {
                    continue;
                }
                match decode_frame::<RendezvousMessage>(&line) {
                    Ok(message) => {
                        if incoming.send(message).is_err() {
                            return Ok(());
                        }
                    }
                    Err(e) => warn!(error = %e, "undecodable rendezvous frame"),
                }
            }
            message = outgoing.recv() => {
                let Some(message) = message else {
                    return Ok(());
                };
                let mut text = encode_frame(&message)?;
                text.push('\n');
                write.write_all(text.as_bytes()).await?;
            }
        }
    }
}

/// Accept TCP clients forever, attaching each to `server`.
pub async fn serve_tcp(server: RendezvousServer, listener: TcpListener) -> anyhow::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "rendezvous listening");
    }
    loop {
        let (stream, peer) = listener.accept().await.context("accept failed")?;
        let server = server.clone();
        tokio::spawn(async move {
            let link = match server.attach().await {
                Ok(link) => link,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "failed to attach socket");
                    return;
                }
            };
            let RendezvousLink { outbound, mut inbound } = link;
            if let Err(e) = bridge_lines(stream, &mut inbound, &outbound).await {
                debug!(peer = %peer, error = %e, "rendezvous client dropped");
            }
        });
    }
}

// ============================================================================
// Socket Pools
// ============================================================================

pub type SocketId = u64;

/// Round-robin list of sockets.
#[derive(Debug, Default)]
pub struct SocketPool {
    sockets: Vec<SocketId>,
    next_index: usize,
}

impl SocketPool {
    pub fn push(&mut self, socket: SocketId) {
        self.sockets.push(socket);
    }

    pub fn contains(&self, socket: SocketId) -> bool {
        self.sockets.contains(&socket)
    }

    pub fn first(&self) -> Option<SocketId> {
        self.sockets.first().copied()
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SocketId> {
        self.sockets.iter()
    }

    pub fn remove(&mut self, socket: SocketId) -> bool {
        let Some(index) = self.sockets.iter().position(|s| *s == socket) else {
            return false;
        };
        self.sockets.remove(index);
        if self.next_index > index {
            self.next_index -= 1;
        }
        true
    }

    /// Next socket in rotation accepted by `eligible`.
    pub fn get_not<F>(&mut self, mut eligible: F) -> Option<SocketId>
    where
        F: FnMut(SocketId) -> bool,
    {
        for _ in 0..self.sockets.len() {
            if self.next_index >= self.sockets.len() {
                self.next_index = 0;
            }
            let candidate = self.sockets[self.next_index];
            self.next_index += 1;
            if eligible(candidate) {
                return Some(candidate);
            }
        }
        None
    }
}

// ============================================================================
// Server Handle
// ============================================================================

/// Counters reported by [`RendezvousServer::stats`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RendezvousStats {
    pub probation: usize,
    pub verified: usize,
    pub subordinates: usize,
    pub promoted: u64,
    pub timed_out: u64,
    pub sockets: usize,
    pub verified_ids: Vec<RingId>,
}

enum Command {
    Attach {
        reply: oneshot::Sender<(SocketId, mpsc::UnboundedReceiver<RendezvousMessage>)>,
    },
    Frame {
        socket: SocketId,
        message: RendezvousMessage,
    },
    Closed {
        socket: SocketId,
    },
    Stats {
        reply: oneshot::Sender<RendezvousStats>,
    },
    Quit,
}

/// Handle to the rendezvous actor. Cheap to clone.
#[derive(Clone)]
pub struct RendezvousServer {
    cmd_tx: mpsc::Sender<Command>,
}

impl std::fmt::Debug for RendezvousServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RendezvousServer").finish_non_exhaustive()
    }
}

impl RendezvousServer {
    pub fn spawn(config: RendezvousConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(1024);
        let actor = RendezvousActor::new(config);
        tokio::spawn(actor.run(cmd_rx));
        Self { cmd_tx }
    }

    /// Open a new socket, as if a node had connected.
    pub async fn attach(&self) -> anyhow::Result<RendezvousLink> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Attach { reply: reply_tx })
            .await
            .map_err(|_| anyhow::anyhow!("rendezvous actor closed"))?;
        let (socket, inbound) = reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("rendezvous actor closed"))?;

        let (outbound, mut from_node) = mpsc::unbounded_channel();
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            while let Some(message) = from_node.recv().await {
                if cmd_tx.send(Command::Frame { socket, message }).await.is_err() {
                    return;
                }
            }
            let _ = cmd_tx.send(Command::Closed { socket }).await;
        });
        Ok(RendezvousLink { outbound, inbound })
    }

    pub async fn stats(&self) -> anyhow::Result<RendezvousStats> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Stats { reply: reply_tx })
            .await
            .map_err(|_| anyhow::anyhow!("rendezvous actor closed"))?;
        reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("rendezvous actor closed"))
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

// ============================================================================
// Server Actor
// ============================================================================

struct Socket {
    tx: mpsc::UnboundedSender<RendezvousMessage>,
    id: Option<RingId>,
    instance: Option<InstanceId>,
    confirmers: HashSet<RingId>,
    /// Set while a paired bootstrap waits for its confirm.
    probation_deadline: Option<Instant>,
    /// Set once evicted; the socket closes at this instant.
    closing_at: Option<Instant>,
}

impl Socket {
    fn new(tx: mpsc::UnboundedSender<RendezvousMessage>) -> Self {
        Self {
            tx,
            id: None,
            instance: None,
            confirmers: HashSet::new(),
            probation_deadline: None,
            closing_at: None,
        }
    }
}

struct RendezvousActor {
    config: RendezvousConfig,
    sockets: HashMap<SocketId, Socket>,
    next_socket: SocketId,
    socket_map: HashMap<RingId, SocketId>,
    subordinate_map: HashMap<InstanceId, SocketId>,
    probation: SocketPool,
    verified: SocketPool,
    find_more_mode: bool,
    promoted: u64,
    timed_out: u64,
}

impl RendezvousActor {
    fn new(config: RendezvousConfig) -> Self {
        Self {
            config,
            sockets: HashMap::new(),
            next_socket: 1,
            socket_map: HashMap::new(),
            subordinate_map: HashMap::new(),
            probation: SocketPool::default(),
            verified: SocketPool::default(),
            find_more_mode: false,
            promoted: 0,
            timed_out: 0,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        let mut status_interval = tokio::time::interval(self.config.status_interval);
        status_interval.tick().await;
        let sweep_period = (self.config.probation_timeout / 4)
            .clamp(Duration::from_millis(50), Duration::from_secs(1));
        let mut sweep_interval = tokio::time::interval(sweep_period);
        sweep_interval.tick().await;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Attach { reply }) => {
                            let attached = self.attach();
                            let _ = reply.send(attached);
                        }
                        Some(Command::Frame { socket, message }) => {
                            self.handle_frame(socket, message);
                        }
                        Some(Command::Closed { socket }) => {
                            self.on_closed(socket);
                        }
                        Some(Command::Stats { reply }) => {
                            let _ = reply.send(self.stats());
                        }
                        Some(Command::Quit) | None => {
                            debug!("rendezvous actor quitting");
                            break;
                        }
                    }
                }
                _ = status_interval.tick() => {
                    info!(
                        probation = self.probation.len(),
                        verified = self.verified.len(),
                        promoted = self.promoted,
                        timed_out = self.timed_out,
                        "rendezvous status"
                    );
                }
                _ = sweep_interval.tick() => {
                    self.sweep();
                }
            }
        }
    }

    fn stats(&self) -> RendezvousStats {
        RendezvousStats {
            probation: self.probation.len(),
            verified: self.verified.len(),
            subordinates: self.subordinate_map.len(),
            promoted: self.promoted,
            timed_out: self.timed_out,
            sockets: self.sockets.len(),
            verified_ids: self
                .verified
                .iter()
                .filter_map(|s| self.sockets.get(s).and_then(|sock| sock.id))
                .collect(),
        }
    }

    fn attach(&mut self) -> (SocketId, mpsc::UnboundedReceiver<RendezvousMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let socket = self.next_socket;
        self.next_socket += 1;
        self.sockets.insert(socket, Socket::new(tx));
        self.probation.push(socket);
        trace!(socket, "socket attached");
        (socket, rx)
    }

    fn send(&self, socket: SocketId, message: RendezvousMessage) {
        if let Some(sock) = self.sockets.get(&socket) {
            if sock.tx.send(message).is_err() {
                trace!(socket, "send to closed socket");
            }
        }
    }

    fn handle_frame(&mut self, socket: SocketId, message: RendezvousMessage) {
        if !self.sockets.contains_key(&socket) {
            return;
        }
        match message {
            RendezvousMessage::Bootstrap { verify_id, packet } => {
                self.on_hello(socket, verify_id, &packet, false);
            }
            RendezvousMessage::Reconnect { verify_id, packet } => {
                self.on_hello(socket, verify_id, &packet, true);
            }
            RendezvousMessage::Confirm { from, confirmed, .. } => {
                self.on_confirm(socket, from, confirmed);
            }
            RendezvousMessage::GetBlock => {
                self.send(socket, block_time(now_ms()).into());
            }
            RendezvousMessage::Ping => self.send(socket, RendezvousMessage::Pong),
            RendezvousMessage::Pong => {}
            RendezvousMessage::ByeBye => self.on_closed(socket),
            RendezvousMessage::Signal { relayed } => self.route_signal(socket, relayed),
            other => {
                warn!(socket, message = ?other, "unexpected frame, dropping socket");
                self.remove_socket(socket);
            }
        }
    }

    fn on_hello(
        &mut self,
        socket: SocketId,
        verify_id: RingId,
        packet: &crate::crypto::SignedPacket,
        reconnect: bool,
    ) {
        let hello: Hello = match unpack(&verify_id, packet) {
            Ok(hello) => hello,
            Err(e) => {
                warn!(socket, error = %e, "rejected hello");
                self.remove_socket(socket);
                return;
            }
        };
        if hello.from != verify_id {
            warn!(socket, "hello names a different id than it was signed for");
            self.remove_socket(socket);
            return;
        }
        let key = PeerKey::new(hello.from, hello.from_instance);
        if let Some(sock) = self.sockets.get_mut(&socket) {
            sock.id = Some(key.id);
            sock.instance = Some(key.instance.clone());
        }
        let introduce = RendezvousMessage::Introduce {
            from: key.id,
            from_instance: key.instance.clone(),
        };

        let existing = self.socket_map.get(&key.id).copied().filter(|existing| {
            *existing != socket
                && self
                    .sockets
                    .get(existing)
                    .map(|s| s.instance.as_ref() != Some(&key.instance))
                    .unwrap_or(false)
        });
        if let Some(existing) = existing {
            debug!(peer = %key, "id already connected, parking as subordinate");
            self.remove_socket(socket);
            self.subordinate_map.insert(key.instance.clone(), socket);
            self.send(existing, introduce);
            return;
        }
        self.socket_map.insert(key.id, socket);

        if reconnect {
            if !self.verified.is_empty() && self.verified.len() < self.config.max_sockets {
                if let Some(prober) = self.verified.first() {
                    let prober_id = self.sockets.get(&prober).and_then(|s| s.id);
                    if let (Some(prober_id), Some(sock)) = (prober_id, self.sockets.get_mut(&socket)) {
                        sock.confirmers.insert(prober_id);
                    }
                    debug!(peer = %key, "asking verified node to check reconnecting id");
                    self.send(prober, RendezvousMessage::CheckForId { id: key.id });
                }
            }
            return;
        }

        let sockets = &self.sockets;
        let eligible = |candidate: SocketId| {
            candidate != socket
                && sockets
                    .get(&candidate)
                    .map(|s| s.id.is_some() && s.id != Some(key.id) && s.closing_at.is_none())
                    .unwrap_or(false)
        };
        let mut partner = self.verified.get_not(eligible);
        let from_probation = partner.is_none();
        if partner.is_none() {
            partner = self.probation.get_not(eligible);
        }
        let Some(partner) = partner else {
            debug!(peer = %key, "no introducer available yet");
            return;
        };
        let partner_id = self.sockets.get(&partner).and_then(|s| s.id);
        if from_probation {
            if let Some(p) = self.sockets.get_mut(&partner) {
                p.confirmers.insert(key.id);
            }
        }
        let deadline = Instant::now() + self.config.probation_timeout;
        if let Some(sock) = self.sockets.get_mut(&socket) {
            if let Some(partner_id) = partner_id {
                sock.confirmers.insert(partner_id);
            }
            sock.probation_deadline = Some(deadline);
        }
        debug!(peer = %key, introducer = ?partner_id.map(|id| id.short_name()), "pairing newcomer");
        self.send(partner, introduce);
    }

    fn on_confirm(&mut self, socket: SocketId, from: RingId, confirmed: RingId) {
        let Some(sender) = self.sockets.get(&socket).and_then(|s| s.id) else {
            return;
        };
        if sender != from {
            warn!(socket, "confirm claims another sender");
            return;
        }
        let Some(target) = self.socket_map.get(&confirmed).copied() else {
            return;
        };
        let vouched = self
            .sockets
            .get(&target)
            .map(|s| s.confirmers.contains(&from))
            .unwrap_or(false);
        if !self.probation.contains(target) || !vouched {
            return;
        }
        self.probation.remove(target);
        if let Some(sock) = self.sockets.get_mut(&target) {
            sock.probation_deadline = None;
        }
        if self.verified.len() >= self.config.max_sockets {
            if let Some(oldest) = self.verified.first() {
                debug!(socket = oldest, "verified pool full, evicting oldest");
                self.remove_socket(oldest);
            }
        }
        self.verified.push(target);
        self.promoted += 1;
        self.find_more_mode = false;
        debug!(peer = %confirmed.short_name(), by = %from.short_name(), "socket verified");
    }

    /// Pick the socket for a specific session, falling back to whichever
    /// socket currently owns the id.
    fn session_socket(&self, sender: SocketId, id: &RingId, instance: &InstanceId) -> Option<SocketId> {
        let owner = self.socket_map.get(id).copied();
        if let Some(owner) = owner {
            let exact = self.sockets.get(&owner).map(|s| s.instance.as_ref() == Some(instance)).unwrap_or(false);
            if exact && owner != sender {
                return Some(owner);
            }
        }
        if let Some(sub) = self.subordinate_map.get(instance).copied() {
            if sub != sender {
                return Some(sub);
            }
        }
        owner.filter(|owner| *owner != sender)
    }

    fn route_signal(&mut self, socket: SocketId, relayed: RelayedSignal) {
        if self.sockets.get(&socket).and_then(|s| s.id).is_none() {
            warn!(socket, "signal before hello, dropping socket");
            self.remove_socket(socket);
            return;
        }
        match self.session_socket(socket, &relayed.to, &relayed.to_instance) {
            Some(target) => {
                trace!(to = %relayed.to.short_name(), "relaying signal");
                self.send(target, RendezvousMessage::Signal { relayed });
            }
            None => debug!(to = %relayed.to.short_name(), "signal target not connected"),
        }
    }

    /// Take a socket out of rotation and close it after the linger period.
    fn remove_socket(&mut self, socket: SocketId) {
        self.probation.remove(socket);
        self.verified.remove(socket);
        if let Some(sock) = self.sockets.get_mut(&socket) {
            sock.probation_deadline = None;
            if sock.closing_at.is_none() {
                sock.closing_at = Some(Instant::now() + self.config.socket_linger);
            }
        }
    }

    fn forget(&mut self, socket: SocketId) {
        self.probation.remove(socket);
        self.verified.remove(socket);
        if let Some(sock) = self.sockets.remove(&socket) {
            if let Some(id) = sock.id {
                if self.socket_map.get(&id) == Some(&socket) {
                    self.socket_map.remove(&id);
                }
            }
            if let Some(instance) = sock.instance {
                if self.subordinate_map.get(&instance) == Some(&socket) {
                    self.subordinate_map.remove(&instance);
                }
            }
        }
    }

    fn on_closed(&mut self, socket: SocketId) {
        if !self.sockets.contains_key(&socket) {
            return;
        }
        trace!(socket, "socket closed");
        self.forget(socket);
        if !self.find_more_mode && self.below_max_sockets() {
            self.find_more_mode = true;
            if let Some(first) = self.verified.first() {
                debug!("verified pool below capacity, sending findsocket");
                self.send(first, RendezvousMessage::FindSocket);
            }
        }
    }

    fn below_max_sockets(&self) -> bool {
        !self.verified.is_empty() && self.verified.len() < self.config.max_sockets
    }

    fn sweep(&mut self) {
        let now = Instant::now();
        let mut bad = Vec::new();
        let mut expired = Vec::new();
        for (socket, sock) in self.sockets.iter_mut() {
            if let Some(deadline) = sock.probation_deadline {
                if deadline <= now && self.probation.contains(*socket) {
                    sock.probation_deadline = None;
                    bad.push(*socket);
                }
            }
            if let Some(closing_at) = sock.closing_at {
                if closing_at <= now {
                    expired.push(*socket);
                }
            }
        }
        for socket in bad {
            debug!(socket, "probation expired, reporting bad network");
            self.send(socket, RendezvousMessage::BadNetwork);
        }
        for socket in expired {
            self.timed_out += 1;
            self.forget(socket);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_time_counts_ten_minute_blocks() {
        // 2016-02-18T00:25:00Z is day 16849 since the epoch
        let day_start = 16_849 * MILLIS_PER_DAY;
        let time = block_time(day_start + 25 * 60 * 1000);
        assert_eq!(time.day, -1);
        assert_eq!(time.block, 2);
        assert_eq!(time.time_till_end, 5 * 60 * 1000);

        let time = block_time(16_850 * MILLIS_PER_DAY);
        assert_eq!(time.day, 0);
        assert_eq!(time.block, 0);
        assert_eq!(time.time_till_end, MILLIS_PER_BLOCK);
    }

    #[test]
    fn pool_rotates_and_skips_excluded() {
        let mut pool = SocketPool::default();
        for s in [1, 2, 3] {
            pool.push(s);
        }
        assert_eq!(pool.get_not(|s| s != 1), Some(2));
        assert_eq!(pool.get_not(|s| s != 1), Some(3));
        assert_eq!(pool.get_not(|s| s != 1), Some(2));
        assert_eq!(pool.get_not(|_| false), None);
    }

    #[test]
    fn pool_removal_keeps_rotation_position() {
        let mut pool = SocketPool::default();
        for s in [1, 2, 3, 4] {
            pool.push(s);
        }
        assert_eq!(pool.get_not(|_| true), Some(1));
        assert_eq!(pool.get_not(|_| true), Some(2));
        assert!(pool.remove(1));
        assert!(!pool.remove(1));
        assert_eq!(pool.get_not(|_| true), Some(3));
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.first(), Some(2));
    }
}
