//! # Routing / Proxy Engine
//!
//! Greedy hop-by-hop forwarding over golden links.
//!
//! ## Next-Hop Selection
//!
//! | Addressing | Order tried |
//! |------------|-------------|
//! | `ToClosest(key)` | link closest to `key`, excluding the originator |
//! | `To(id)` | exact link → path hint → repeated closest → back to previous hop (forming networks only) |
//!
//! Every candidate passes [`filter_recipient`]: it must be open, not us and
//! not already in the envelope's `proxies`. The previous-hop fallback is the
//! only choice allowed to revisit a proxy, and only while the flood is still
//! forming. Each such bounce is charged to the envelope's `retries` (see
//! [`charge_bounce`]), so two nodes cannot hand an unroutable envelope back
//! and forth forever.
//!
//! ## Retry
//!
//! Envelopes with no next hop wait in a [`PendingQueue`] and are retried on
//! every maintenance tick and whenever a link goes golden. Past
//! `max_retries`, an envelope is dropped once the network has settled (no
//! negotiation in progress and at least one open link).

use std::collections::VecDeque;

use tracing::warn;

use crate::messages::{Addressing, Envelope};
use crate::ring::{closest, RingId};

/// Link state the router reads.
#[derive(Clone, Copy, Debug)]
pub struct RouteView<'a> {
    pub local: RingId,
    /// Golden links with an open channel.
    pub open: &'a [RingId],
    pub flood_full: bool,
}

impl RouteView<'_> {
    fn is_open(&self, id: &RingId) -> bool {
        self.open.contains(id)
    }
}

/// Whether the envelope is addressed to this node.
///
/// For `ToClosest` this means no open link other than the originator is
/// closer to the key than we are.
pub fn matches_address(envelope: &Envelope, view: &RouteView<'_>) -> bool {
    match envelope.to {
        Addressing::To(id) => id == view.local,
        Addressing::ToClosest(key) => {
            let candidates: Vec<RingId> = view
                .open
                .iter()
                .copied()
                .filter(|id| *id != envelope.from)
                .chain(std::iter::once(view.local))
                .collect();
            closest(key, &candidates) == Some(view.local)
        }
    }
}

/// Accept `candidate` unless a hop is already chosen, the link is not open,
/// it is us, or it already carried this envelope.
pub fn filter_recipient(
    candidate: RingId,
    current: Option<RingId>,
    envelope: &Envelope,
    view: &RouteView<'_>,
) -> Option<RingId> {
    if current.is_some() {
        return current;
    }
    if !view.is_open(&candidate) || candidate == view.local || envelope.proxies.contains(&candidate) {
        return None;
    }
    Some(candidate)
}

/// Pick the next hop for an envelope not addressed to us.
pub fn select_next_hop(envelope: &Envelope, view: &RouteView<'_>) -> Option<RingId> {
    match envelope.to {
        Addressing::ToClosest(key) => {
            let candidates: Vec<RingId> = view
                .open
                .iter()
                .copied()
                .filter(|id| *id != envelope.from && !envelope.proxies.contains(id) && *id != view.local)
                .collect();
            closest(key, &candidates)
        }
        Addressing::To(target) => {
            let mut to = None;
            if view.is_open(&target) {
                to = filter_recipient(target, to, envelope, view);
            }
            if to.is_none() {
                if let Some(path) = &envelope.path {
                    for id in path {
                        to = filter_recipient(*id, to, envelope, view);
                    }
                }
            }
            let mut options: Vec<RingId> = view.open.to_vec();
            while to.is_none() {
                let Some(best) = closest(target, &options) else {
                    break;
                };
                to = filter_recipient(best, to, envelope, view);
                options.retain(|id| *id != best);
            }
            if to.is_none() && !view.flood_full {
                to = envelope.hop_from.filter(|hop| view.is_open(hop) && *hop != view.local);
            }
            to
        }
    }
}

/// Record that `local` forwarded the envelope to `next`.
pub fn record_hop(envelope: &mut Envelope, local: RingId, next: RingId) {
    for id in [local, next] {
        if !envelope.proxies.contains(&id) {
            envelope.proxies.push(id);
        }
    }
}

/// Charge a hop back to the peer that handed us the envelope against its
/// retry budget. Returns false once the budget is spent.
pub fn charge_bounce(envelope: &mut Envelope, next: RingId, max_retries: u32) -> bool {
    if envelope.hop_from != Some(next) {
        return true;
    }
    envelope.retries += 1;
    envelope.retries <= max_retries
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    Requeue,
    Drop,
}

/// Keep retrying until the ceiling, and past it for as long as the network
/// is still changing or we have no link at all.
pub fn retry_decision(retries: u32, max_retries: u32, negotiating: bool, any_open: bool) -> RetryDecision {
    if retries <= max_retries || negotiating || !any_open {
        RetryDecision::Requeue
    } else {
        RetryDecision::Drop
    }
}

/// Envelopes waiting for a route, oldest first.
#[derive(Debug)]
pub struct PendingQueue {
    envelopes: VecDeque<Envelope>,
    capacity: usize,
}

impl PendingQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            envelopes: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, envelope: Envelope) {
        if self.envelopes.len() >= self.capacity {
            if let Some(dropped) = self.envelopes.pop_front() {
                warn!(
                    kind = ?dropped.kind,
                    to = %dropped.to.target().short_name(),
                    "pending queue full, dropping oldest envelope"
                );
            }
        }
        self.envelopes.push_back(envelope);
    }

    /// Take everything for another attempt. Proxy histories restart at
    /// `local` since the links they were built on may have changed.
    pub fn drain_for_retry(&mut self, local: RingId) -> Vec<Envelope> {
        self.envelopes
            .drain(..)
            .map(|mut envelope| {
                envelope.proxies = vec![local];
                envelope.hop_from = None;
                envelope
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.envelopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.envelopes.is_empty()
    }
}
