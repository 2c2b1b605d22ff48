//! # Distributed Hash Table
//!
//! Best-effort key/value layer on top of closest-node routing.
//!
//! | Operation | Local path | Remote path |
//! |-----------|------------|-------------|
//! | `put(key, value)` | merge into [`DhtStore`] | `dht.put` → `dht.put.ack` |
//! | `get(key)` | read [`DhtStore`] | `dht.get` → `dht.got` |
//!
//! Keys are hashed onto the ring with [`hash_key`]. A node serves a key
//! locally when the hashed position falls in its flood range; otherwise the
//! request is routed to-closest the hashed key and resolves when the reply
//! with the same correlation id arrives.
//!
//! ## Records
//!
//! A record maps owner id → value, so writers never clobber each other. A
//! `null` value is the only form of deletion.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::trace;

use crate::ring::RingId;

/// Values of one key, by owner.
pub type DhtRecord = BTreeMap<RingId, Value>;

/// Ring position of an application key.
pub fn hash_key(key: &str) -> RingId {
    RingId::hash_of(key.as_bytes())
}

#[derive(Debug, Default)]
pub struct DhtStore {
    records: HashMap<RingId, DhtRecord>,
}

impl DhtStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `owner`'s value into the record at `key`.
    pub fn put(&mut self, key: RingId, owner: RingId, value: Value) {
        self.records.entry(key).or_default().insert(owner, value);
    }

    pub fn get(&self, key: &RingId) -> DhtRecord {
        self.records.get(key).cloned().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Result delivered to a waiting caller.
#[derive(Debug, Clone, PartialEq)]
pub enum DhtReply {
    Stored,
    Values(DhtRecord),
}

/// Outstanding remote requests keyed by correlation id.
#[derive(Debug, Default)]
pub struct DhtRequests {
    next_id: u64,
    pending: HashMap<u64, oneshot::Sender<DhtReply>>,
}

impl DhtRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Correlation ids start after `seed`.
    pub fn starting_after(seed: u64) -> Self {
        Self {
            next_id: seed,
            pending: HashMap::new(),
        }
    }

    pub fn register(&mut self, reply: oneshot::Sender<DhtReply>) -> u64 {
        self.next_id = self.next_id.wrapping_add(1);
        self.pending.insert(self.next_id, reply);
        self.next_id
    }

    /// Resolve request `id`. Unknown or abandoned ids are ignored.
    pub fn complete(&mut self, id: u64, reply: DhtReply) -> bool {
        match self.pending.remove(&id) {
            Some(tx) => tx.send(reply).is_ok(),
            None => {
                trace!(request = id, "reply for unknown dht request");
                false
            }
        }
    }

    /// Forget requests whose caller stopped waiting (timed out).
    pub fn prune_abandoned(&mut self) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, tx| !tx.is_closed());
        before - self.pending.len()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn records_merge_by_owner() {
        let mut store = DhtStore::new();
        let key = hash_key("room");
        let alice = RingId::hash_of(b"alice");
        let bob = RingId::hash_of(b"bob");
        store.put(key, alice, json!({"x": 1}));
        store.put(key, bob, json!("hello"));
        store.put(key, alice, json!({"x": 2}));
        let record = store.get(&key);
        assert_eq!(record.len(), 2);
        assert_eq!(record[&alice], json!({"x": 2}));
        assert_eq!(record[&bob], json!("hello"));
        assert!(store.get(&hash_key("other")).is_empty());
    }

    #[test]
    fn null_marks_deletion_without_removing_owner() {
        let mut store = DhtStore::new();
        let key = hash_key("k");
        let owner = RingId::hash_of(b"o");
        store.put(key, owner, json!(1));
        store.put(key, owner, Value::Null);
        assert_eq!(store.get(&key)[&owner], Value::Null);
    }

    #[tokio::test]
    async fn requests_resolve_once() {
        let mut requests = DhtRequests::new();
        let (tx, rx) = oneshot::channel();
        let id = requests.register(tx);
        assert!(requests.complete(id, DhtReply::Stored));
        assert!(!requests.complete(id, DhtReply::Stored));
        assert_eq!(rx.await.unwrap(), DhtReply::Stored);
    }

    #[test]
    fn abandoned_requests_are_pruned() {
        let mut requests = DhtRequests::new();
        let (tx_kept, _rx_kept) = oneshot::channel();
        let (tx_gone, rx_gone) = oneshot::channel();
        let kept = requests.register(tx_kept);
        let gone = requests.register(tx_gone);
        assert_ne!(kept, gone);
        drop(rx_gone);
        assert_eq!(requests.prune_abandoned(), 1);
        assert_eq!(requests.len(), 1);
    }
}
