//! # Topology Maintenance
//!
//! Each node keeps two views of its neighborhood:
//!
//! | View | Built from | Used for |
//! |------|------------|----------|
//! | `flood` | golden connections + self | DHT range, finger growth, pruning |
//! | `target_flood` | golden or pending overlay connections + self | what we report to others (`floodreport`, `nothere`) |
//!
//! plus a finger table of long-range pointers indexed by level.
//!
//! Both floods are rebuilt from scratch on every membership change and
//! swapped in whole. [`Topology::maintain`] runs on the maintenance tick: it
//! sizes the finger table to the flood span, marks dead or empty slots
//! pending (and asks the node to query them), and decides which connections
//! stay in use.
//!
//! ## Finger Sizing
//!
//! With `span` the arc covered by a full flood, the finger table has the
//! length `n` at which `HALF_MAX >> n <= span <= HALF_MAX >> (n - 1)`. Dense
//! networks (short spans) get more fingers. The table is cleared whenever the
//! flood is not full.

use std::collections::HashSet;

use tokio::time::{Duration, Instant};

use crate::ring::{directed_distance, good_enough, half_max_shr, ideal_finger, in_arc, Distance, RingId, RING_BITS};

/// Index `index` into a circular list of length `len`.
pub fn wrap_index(index: isize, len: usize) -> usize {
    if len == 0 {
        return 0;
    }
    index.rem_euclid(len as isize) as usize
}

/// Local id plus `flood_size` neighbors on each side, in ring order starting
/// at the furthest predecessor. Small sets are returned whole, sorted.
pub fn make_flood<I>(local: RingId, ids: I, flood_size: usize) -> Vec<RingId>
where
    I: IntoIterator<Item = RingId>,
{
    let mut sorted: Vec<RingId> = ids.into_iter().chain(std::iter::once(local)).collect();
    sorted.sort();
    sorted.dedup();
    let total = flood_size * 2 + 1;
    if sorted.len() < total {
        return sorted;
    }
    let Ok(me) = sorted.binary_search(&local) else {
        return sorted;
    };
    let me = me as isize;
    let f = flood_size as isize;
    ((me - f)..=(me + f))
        .map(|i| sorted[wrap_index(i, sorted.len())])
        .collect()
}

/// Smallest clockwise arc containing every id: the ring minus the widest
/// gap between ring-adjacent members. Returns `(start, end)`.
pub fn covering_arc(ids: &[RingId]) -> Option<(RingId, RingId)> {
    let mut sorted = ids.to_vec();
    sorted.sort();
    sorted.dedup();
    let n = sorted.len();
    match n {
        0 => None,
        1 => Some((sorted[0], sorted[0])),
        _ => {
            let mut widest = 0;
            let mut widest_gap = RingId::ZERO;
            for i in 0..n {
                let gap = directed_distance(sorted[i], sorted[(i + 1) % n]);
                if gap > widest_gap {
                    widest_gap = gap;
                    widest = i;
                }
            }
            Some((sorted[(widest + 1) % n], sorted[widest]))
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Finger {
    /// Slot waiting for a `fingercandidate`.
    Pending,
    Peer(RingId),
}

impl Finger {
    pub fn peer(&self) -> Option<RingId> {
        match self {
            Finger::Peer(id) => Some(*id),
            Finger::Pending => None,
        }
    }
}

/// One connection as seen by the maintenance pass.
#[derive(Clone, Copy, Debug)]
pub struct LinkView {
    pub id: RingId,
    pub open: bool,
    pub last_use: Instant,
}

/// Side effects the node performs after a maintenance pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MaintenancePlan {
    /// `(level, ideal position)` pairs to send `findfinger` towards.
    pub finger_queries: Vec<(usize, RingId)>,
    pub mark_used: Vec<RingId>,
    pub mark_unused: Vec<RingId>,
}

#[derive(Clone, Debug)]
pub struct Topology {
    local: RingId,
    flood_size: usize,
    flood: Vec<RingId>,
    target_flood: Vec<RingId>,
    fingers: Vec<Finger>,
}

impl Topology {
    pub fn new(local: RingId, flood_size: usize) -> Self {
        Self {
            local,
            flood_size,
            flood: vec![local],
            target_flood: vec![local],
            fingers: Vec::new(),
        }
    }

    pub fn local(&self) -> RingId {
        self.local
    }

    pub fn flood(&self) -> &[RingId] {
        &self.flood
    }

    pub fn target_flood(&self) -> &[RingId] {
        &self.target_flood
    }

    pub fn fingers(&self) -> &[Finger] {
        &self.fingers
    }

    pub fn finger_ids(&self) -> Vec<RingId> {
        self.fingers.iter().filter_map(Finger::peer).collect()
    }

    pub fn total_flood_size(&self) -> usize {
        self.flood_size * 2 + 1
    }

    pub fn is_full(&self) -> bool {
        self.flood.len() == self.total_flood_size()
    }

    pub fn target_is_full(&self) -> bool {
        self.target_flood.len() == self.total_flood_size()
    }

    /// Rebuild both floods from the current connection sets.
    pub fn recompute(&mut self, golden: &[RingId], pending_or_active: &[RingId]) {
        self.flood = make_flood(self.local, golden.iter().copied(), self.flood_size);
        self.target_flood = make_flood(self.local, pending_or_active.iter().copied(), self.flood_size);
        if !self.is_full() {
            self.fingers.clear();
        }
    }

    /// Whether a ring position is ours to store. Always true while the
    /// flood is still forming.
    pub fn in_flood_range(&self, key: RingId) -> bool {
        if !self.is_full() {
            return true;
        }
        match covering_arc(&self.flood) {
            Some((start, end)) => in_arc(start, end, key),
            None => true,
        }
    }

    /// Arc covered by the flood.
    pub fn flood_span(&self) -> Distance {
        covering_arc(&self.flood)
            .map(|(start, end)| directed_distance(start, end))
            .unwrap_or(RingId::ZERO)
    }

    pub fn in_flood(&self, id: &RingId) -> bool {
        self.flood.contains(id)
    }

    pub fn in_target_flood(&self, id: &RingId) -> bool {
        self.target_flood.contains(id)
    }

    pub fn is_finger(&self, id: &RingId) -> bool {
        self.fingers.iter().any(|f| f.peer() == Some(*id))
    }

    /// Ideal flood members we are not connected to yet, from a set of ids
    /// known to be reachable.
    pub fn augment_candidates(&self, seen: &[RingId], connected: &[RingId]) -> Vec<RingId> {
        let ideal = make_flood(
            self.local,
            seen.iter().chain(connected.iter()).copied(),
            self.flood_size,
        );
        ideal
            .into_iter()
            .filter(|id| *id != self.local && !connected.contains(id))
            .collect()
    }

    /// Fill a pending finger slot. Returns `true` when the candidate was taken.
    pub fn offer_finger(&mut self, level: usize, candidate: RingId) -> bool {
        match self.fingers.get(level) {
            Some(Finger::Pending) if candidate != self.local && good_enough(self.local, candidate, level) => {
                self.fingers[level] = Finger::Peer(candidate);
                true
            }
            _ => false,
        }
    }

    /// Periodic maintenance over the currently golden links.
    pub fn maintain(
        &mut self,
        links: &[LinkView],
        now: Instant,
        stale_after: Duration,
        retained_extra: usize,
    ) -> MaintenancePlan {
        let mut plan = MaintenancePlan::default();

        if self.is_full() {
            let span = self.flood_span();
            while self.fingers.len() < RING_BITS && span < half_max_shr(self.fingers.len()) {
                self.fingers.push(Finger::Pending);
            }
            while !self.fingers.is_empty() && span > half_max_shr(self.fingers.len() - 1) {
                self.fingers.pop();
            }
            let open: HashSet<RingId> = links.iter().filter(|l| l.open).map(|l| l.id).collect();
            for (level, finger) in self.fingers.iter_mut().enumerate() {
                let alive = finger.peer().map(|id| open.contains(&id)).unwrap_or(false);
                if !alive {
                    *finger = Finger::Pending;
                    plan.finger_queries.push((level, ideal_finger(self.local, level)));
                }
            }
        } else {
            self.fingers.clear();
        }

        let mut idle: Vec<&LinkView> = Vec::new();
        for link in links {
            if link.id == self.local {
                continue;
            }
            if self.in_flood(&link.id) || self.in_target_flood(&link.id) || self.is_finger(&link.id) {
                plan.mark_used.push(link.id);
            } else if now.duration_since(link.last_use) > stale_after {
                idle.push(link);
            } else {
                plan.mark_used.push(link.id);
            }
        }
        if self.is_full() {
            idle.sort_by(|a, b| b.last_use.cmp(&a.last_use).then(a.id.cmp(&b.id)));
            for (i, link) in idle.into_iter().enumerate() {
                if i < retained_extra {
                    plan.mark_used.push(link.id);
                } else {
                    plan.mark_unused.push(link.id);
                }
            }
        } else {
            plan.mark_used.extend(idle.into_iter().map(|l| l.id));
        }
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(prefix: &str) -> RingId {
        RingId::from_hex(prefix).unwrap()
    }

    fn ids(prefixes: &[&str]) -> Vec<RingId> {
        prefixes.iter().map(|p| id(p)).collect()
    }

    fn full_topology(local: &str, members: &[&str]) -> Topology {
        let mut topology = Topology::new(id(local), 2);
        let golden = ids(members);
        topology.recompute(&golden, &golden);
        topology
    }

    #[test]
    fn wrap_index_handles_negatives() {
        assert_eq!(wrap_index(-1, 7), 6);
        assert_eq!(wrap_index(7, 7), 0);
        assert_eq!(wrap_index(3, 7), 3);
        assert_eq!(wrap_index(-8, 7), 6);
    }

    #[test]
    fn flood_wraps_to_predecessor() {
        let others = ids(&["13", "32", "7b", "aa", "cc", "dd"]);
        let flood = make_flood(id("0f"), others, 1);
        assert_eq!(flood, ids(&["dd", "0f", "13"]));
    }

    #[test]
    fn small_sets_are_returned_whole() {
        let flood = make_flood(id("50"), ids(&["10", "90"]), 2);
        assert_eq!(flood, ids(&["10", "50", "90"]));
        assert_eq!(make_flood(id("50"), Vec::new(), 2), ids(&["50"]));
    }

    #[test]
    fn flood_range_non_wrapping() {
        let topology = full_topology("11", &["01", "22", "33", "ff"]);
        assert!(topology.is_full());
        assert!(topology.in_flood_range(id("02")));
        assert!(!topology.in_flood_range(id("34")));
    }

    #[test]
    fn flood_range_wrapping() {
        let topology = full_topology("ff", &["cc", "11", "22", "33"]);
        assert!(topology.in_flood_range(id("cd")));
        assert!(!topology.in_flood_range(id("cb")));
    }

    #[test]
    fn forming_flood_covers_everything() {
        let topology = full_topology("11", &["22"]);
        assert!(!topology.is_full());
        assert!(topology.in_flood_range(id("34")));
        assert!(topology.in_flood_range(id("f0")));
    }

    #[test]
    fn covering_arc_skips_widest_gap() {
        assert_eq!(covering_arc(&ids(&["01", "11", "22", "33", "ff"])), Some((id("ff"), id("33"))));
        assert_eq!(covering_arc(&[]), None);
    }

    fn links(members: &[&str], now: Instant) -> Vec<LinkView> {
        members
            .iter()
            .map(|p| LinkView { id: id(p), open: true, last_use: now })
            .collect()
    }

    #[test]
    fn dense_flood_grows_fingers_and_queries_them() {
        let members = ["10", "10000001", "10000002", "10000003", "10000004"];
        let mut topology = Topology::new(id("10000002"), 2);
        let golden: Vec<RingId> = ids(&members).into_iter().filter(|i| *i != id("10000002")).collect();
        topology.recompute(&golden, &golden);
        let now = Instant::now();
        let plan = topology.maintain(&links(&members, now), now, Duration::from_secs(60), 3);
        let n = topology.fingers().len();
        assert!(n > 0);
        assert!(topology.fingers().iter().all(|f| *f == Finger::Pending));
        assert_eq!(plan.finger_queries.len(), n);
        assert_eq!(plan.finger_queries[0], (0, ideal_finger(id("10000002"), 0)));
        let span = topology.flood_span();
        assert!(half_max_shr(n) <= span && span <= half_max_shr(n - 1));
    }

    #[test]
    fn maintenance_is_idempotent() {
        let members = ["01", "11", "22", "33", "ff", "80"];
        let mut topology = full_topology("11", &["01", "22", "33", "ff", "80"]);
        let now = Instant::now();
        let view = links(&members, now);
        topology.maintain(&view, now, Duration::from_secs(60), 3);
        let flood = topology.flood().to_vec();
        let fingers = topology.fingers().to_vec();
        topology.maintain(&view, now, Duration::from_secs(60), 3);
        assert_eq!(topology.flood(), flood.as_slice());
        assert_eq!(topology.fingers(), fingers.as_slice());
    }

    #[test]
    fn finger_candidates_must_be_good_enough() {
        let local = id("10");
        let mut topology = Topology::new(local, 2);
        topology.fingers = vec![Finger::Pending];
        let ideal = ideal_finger(local, 0);
        assert!(!topology.offer_finger(0, local));
        assert!(!topology.offer_finger(0, id("20")));
        assert!(topology.offer_finger(0, ideal));
        assert_eq!(topology.finger_ids(), vec![ideal]);
        // filled slots are not replaced
        assert!(!topology.offer_finger(0, ideal.wrapping_add(RingId::from_hex("01").unwrap())));
        assert!(!topology.offer_finger(5, ideal));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_extras_beyond_slack_are_released() {
        let flood_members = ["01", "22", "33", "ff"];
        let extras = ["70", "80", "90", "a0", "b0"];
        let mut all: Vec<&str> = flood_members.to_vec();
        all.extend_from_slice(&extras);
        let mut topology = full_topology("11", &all);
        let start = Instant::now();
        let mut view = links(&all, start);
        tokio::time::advance(Duration::from_secs(120)).await;
        let now = Instant::now();
        // flood members stay busy, extras go idle at staggered times
        for link in view.iter_mut() {
            if flood_members.iter().any(|p| id(p) == link.id) {
                link.last_use = now;
            }
        }
        for (i, link) in view.iter_mut().filter(|l| extras.iter().any(|p| id(p) == l.id)).enumerate() {
            link.last_use = start + Duration::from_secs(i as u64);
        }
        let plan = topology.maintain(&view, now, Duration::from_secs(60), 3);
        assert_eq!(plan.mark_unused.len(), 2);
        assert!(plan.mark_unused.contains(&id("70")));
        assert!(plan.mark_unused.contains(&id("80")));
        for member in flood_members {
            assert!(plan.mark_used.contains(&id(member)));
        }
    }

    #[test]
    fn forming_flood_keeps_everything_and_no_fingers() {
        let mut topology = full_topology("11", &["22"]);
        topology.fingers = vec![Finger::Pending];
        let now = Instant::now();
        let plan = topology.maintain(&links(&["22"], now), now, Duration::from_secs(60), 0);
        assert!(topology.fingers().is_empty());
        assert!(plan.mark_unused.is_empty());
        assert_eq!(plan.mark_used, vec![id("22")]);
    }
}
