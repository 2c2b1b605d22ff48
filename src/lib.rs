//! # Ringmesh - Identity-Authenticated Ring Overlay
//!
//! Ringmesh builds a self-organizing peer-to-peer overlay on top of direct
//! peer connections that are bootstrapped through a rendezvous server:
//!
//! - **Identity**: a node's ring position is the BLAKE3 hash of its Ed25519
//!   public key; every routed message is signed and bound to that id
//! - **Topology**: each node keeps a *flood* of `2F+1` ring neighbors and a
//!   logarithmic set of long-range *fingers*
//! - **Routing**: greedy hop-by-hop forwarding to a node id or to the node
//!   closest to a ring position, with loop prevention and bounded retry
//! - **Admission**: a rendezvous server pairs newcomers with verified nodes
//!   and promotes them once a peer vouches for them
//! - **DHT**: best-effort key/value records merged per owner
//!
//! ## Architecture
//!
//! Stateful components follow the actor pattern:
//! - [`Node`] and [`RendezvousServer`] are cheap handles sending commands
//!   over async channels
//! - Each actor owns all of its mutable state and handles commands,
//!   transport events and timers sequentially on one task
//! - Pure pieces (ring math, flood/finger computation, next-hop selection)
//!   are plain functions and structs the actors call into
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `ring` | 256-bit circular id arithmetic |
//! | `identity` | Keypairs, session instances, local identity |
//! | `crypto` | Signed packets binding payloads to sender ids |
//! | `messages` | Serialization types for every wire protocol |
//! | `transport` | Peer connection contract and in-memory switchboard |
//! | `connection` | Per-peer connection lifecycle and handshake |
//! | `topology` | Flood and finger maintenance |
//! | `routing` | Next-hop selection and pending envelope queue |
//! | `dht` | Per-owner key/value records and request correlation |
//! | `rendezvous` | Admission server, socket pools, dialers |
//! | `config` | Tunables with documented defaults |
//! | `node` | High-level node API and overlay actor |

pub mod config;
mod connection;
mod crypto;
mod dht;
mod identity;
mod messages;
mod node;
mod rendezvous;
mod ring;
mod routing;
mod topology;
mod transport;

pub use config::{OverlayConfig, RendezvousConfig};
pub use connection::{
    ChannelState, Connection, ConnectionSummary, ConnectionTable, LifecycleEffect, Signaler,
};
pub use crypto::{pack, unpack, SignedPacket, UnpackError};
pub use dht::{hash_key, DhtRecord, DhtReply, DhtRequests, DhtStore};
pub use identity::{InstanceId, Keypair, LocalIdentity, PeerKey};
pub use messages::{
    decode_frame, encode_frame, Addressing, BootstrapInfo, ChannelFrame, Envelope, Handshake, Hello,
    MessageKind, OverlayMessage, RelayedSignal, RendezvousMessage, SdpKind, SessionDescription,
    SignalEnvelope, SignalMessage, MAX_FRAME_SIZE, MAX_PROXIES,
};
pub use node::{Node, NodeStatus, ReceivedMessage};
pub use rendezvous::{
    block_time, serve_tcp, BlockTime, Dialer, RendezvousLink, RendezvousServer, RendezvousStats,
    SocketId, SocketPool, TcpDialer,
};
pub use ring::{
    closest, directed_distance, distance, good_enough, half_max_shr, ideal_finger, in_arc,
    yield_to_id, Distance, RingId, HALF_MAX, RING_BITS,
};
pub use routing::{
    charge_bounce, filter_recipient, matches_address, record_hop, retry_decision, select_next_hop, PendingQueue,
    RetryDecision, RouteView,
};
pub use topology::{covering_arc, make_flood, wrap_index, Finger, LinkView, MaintenancePlan, Topology};
pub use transport::{
    ConnectionToken, MemoryNetwork, NegotiationState, Transport, TransportError, TransportEvent,
    TransportEventKind, TransportHandle,
};
