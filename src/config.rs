//! # Configuration
//!
//! Tunables for overlay nodes and the rendezvous server. Defaults match the
//! behaviour of the deployed network; tests shrink the timers.

use std::time::Duration;

/// F: neighbors kept on each side of the local id. The flood holds `2F+1` ids.
pub const DEFAULT_FLOOD_SIZE: usize = 2;

/// Period of the maintenance tick (flood/finger checks, retries, timeouts).
pub const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5);

/// Idle time after which a non-flood, non-finger connection may be pruned.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(60);

/// Idle extra connections kept even when the flood is full.
pub const DEFAULT_RETAINED_EXTRA: usize = 3;

/// Negotiation window before a half-open connection is torn down.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(20);

/// Proxy attempts before an undeliverable envelope may be dropped.
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// Deadline for DHT requests routed to another node.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(60);

/// Window during which a repeated `ringring` to the same id is suppressed.
pub const DEFAULT_RING_DEDUPE: Duration = Duration::from_secs(10);

/// Remembered superseded negotiation timestamps.
pub const DEFAULT_DEAD_TIMESTAMP_CAPACITY: usize = 4096;

/// Pending envelopes held while no route exists.
pub const DEFAULT_MAX_PENDING_ENVELOPES: usize = 1024;

/// Size of the rendezvous verified pool.
pub const DEFAULT_MAX_SOCKETS: usize = 10;

/// Time a bootstrapping socket has to get confirmed before it is told the
/// network looks bad.
pub const DEFAULT_PROBATION_TIMEOUT: Duration = Duration::from_secs(30);

/// How long an evicted socket stays routable before it is closed.
pub const DEFAULT_SOCKET_LINGER: Duration = Duration::from_secs(1200);

/// Interval between rendezvous status log lines.
pub const DEFAULT_STATUS_INTERVAL: Duration = Duration::from_secs(10);

/// Overlay node configuration.
#[derive(Clone, Debug)]
pub struct OverlayConfig {
    /// F - neighbors per side in the flood.
    pub flood_size: usize,
    /// Maintenance tick period.
    pub maintenance_interval: Duration,
    /// Idle window before a spare connection is released.
    pub stale_after: Duration,
    /// Spare connections kept once the flood is full.
    pub retained_extra: usize,
    /// Negotiation deadline for new connections.
    pub connection_timeout: Duration,
    /// Proxy retry ceiling.
    pub max_retries: u32,
    /// DHT request deadline.
    pub rpc_timeout: Duration,
    /// `ringring` suppression window.
    pub ring_dedupe: Duration,
    /// Bound on the dead negotiation timestamp set.
    pub dead_timestamp_capacity: usize,
    /// Bound on envelopes waiting for a route.
    pub max_pending_envelopes: usize,
}

impl OverlayConfig {
    /// `2F+1`.
    pub fn total_flood_size(&self) -> usize {
        self.flood_size * 2 + 1
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            flood_size: DEFAULT_FLOOD_SIZE,
            maintenance_interval: DEFAULT_MAINTENANCE_INTERVAL,
            stale_after: DEFAULT_STALE_AFTER,
            retained_extra: DEFAULT_RETAINED_EXTRA,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            ring_dedupe: DEFAULT_RING_DEDUPE,
            dead_timestamp_capacity: DEFAULT_DEAD_TIMESTAMP_CAPACITY,
            max_pending_envelopes: DEFAULT_MAX_PENDING_ENVELOPES,
        }
    }
}

/// Rendezvous server configuration.
#[derive(Clone, Debug)]
pub struct RendezvousConfig {
    /// Verified pool capacity.
    pub max_sockets: usize,
    /// Deadline for a bootstrapping socket to be confirmed.
    pub probation_timeout: Duration,
    /// Grace period for evicted sockets.
    pub socket_linger: Duration,
    /// Status log period.
    pub status_interval: Duration,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            max_sockets: DEFAULT_MAX_SOCKETS,
            probation_timeout: DEFAULT_PROBATION_TIMEOUT,
            socket_linger: DEFAULT_SOCKET_LINGER,
            status_interval: DEFAULT_STATUS_INTERVAL,
        }
    }
}
