//! Integration tests for the Node public API.
//!
//! These tests drive nodes through the public handle only, over the
//! in-memory transport and an embedded rendezvous server.

use std::sync::Arc;
use std::time::Duration;

use ringmesh::{
    hash_key, Dialer, LocalIdentity, MemoryNetwork, Node, NodeStatus, OverlayConfig, RendezvousConfig,
    RendezvousServer, RingId,
};
use serde_json::json;
use tokio::time::{sleep, timeout, Instant};

/// Allow time for async operations
const TEST_TIMEOUT: Duration = Duration::from_secs(20);
const SHORT_TIMEOUT: Duration = Duration::from_secs(2);

fn fast_config() -> OverlayConfig {
    OverlayConfig {
        maintenance_interval: Duration::from_millis(100),
        connection_timeout: Duration::from_secs(5),
        ring_dedupe: Duration::from_secs(1),
        rpc_timeout: Duration::from_secs(5),
        ..OverlayConfig::default()
    }
}

fn spawn_node(network: &MemoryNetwork, identity: LocalIdentity) -> Node {
    Node::spawn(identity.clone(), network.transport(identity.id), fast_config())
}

/// Poll a node's status until `done` holds or the deadline passes.
async fn wait_for_status<F>(node: &Node, done: F) -> NodeStatus
where
    F: Fn(&NodeStatus) -> bool,
{
    let deadline = Instant::now() + TEST_TIMEOUT;
    loop {
        let status = node.status().await.expect("status failed");
        if done(&status) {
            return status;
        }
        assert!(Instant::now() < deadline, "condition not reached: {:?}", status);
        sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn node_identity_accessors() {
    let network = MemoryNetwork::new();
    let identity = LocalIdentity::generate();
    let node = spawn_node(&network, identity.clone());

    assert_eq!(node.id(), identity.id);
    assert_eq!(node.instance(), &identity.instance);
    assert_eq!(node.key(), identity.key());
    assert_eq!(node.id().to_hex().len(), 64);
    node.shutdown().await;
}

#[tokio::test]
async fn put_and_get_before_any_peer_resolve_locally() {
    let network = MemoryNetwork::new();
    let node = spawn_node(&network, LocalIdentity::generate());

    timeout(SHORT_TIMEOUT, node.put("greeting", json!({"text": "hello"})))
        .await
        .expect("put timed out")
        .expect("put failed");
    let record = timeout(SHORT_TIMEOUT, node.get("greeting"))
        .await
        .expect("get timed out")
        .expect("get failed");

    assert_eq!(record.len(), 1);
    assert_eq!(record[&node.id()], json!({"text": "hello"}));

    let status = node.status().await.unwrap();
    assert_eq!(status.dht_records, 1);
    node.shutdown().await;
}

#[tokio::test]
async fn messages_receiver_can_be_taken_once() {
    let network = MemoryNetwork::new();
    let node = spawn_node(&network, LocalIdentity::generate());

    let _rx = node.messages().await.expect("first take should succeed");
    assert!(node.messages().await.is_err(), "second take should fail");
    node.shutdown().await;
}

#[tokio::test]
async fn two_nodes_link_through_rendezvous() {
    let network = MemoryNetwork::new();
    let server = RendezvousServer::spawn(RendezvousConfig::default());
    let dialer: Arc<dyn Dialer> = Arc::new(server.clone());

    let first = spawn_node(&network, LocalIdentity::generate());
    let second = spawn_node(&network, LocalIdentity::generate());
    first.connect(dialer.clone()).await.expect("first connect failed");
    second.connect(dialer.clone()).await.expect("second connect failed");

    let status = wait_for_status(&second, |s| s.golden == 1 && s.initialized).await;
    assert!(!status.probation, "dialing back clears probation");
    assert_eq!(status.flood.len(), 2);
    assert!(status.flood.contains(&first.id()));

    let status = wait_for_status(&first, |s| s.golden == 1).await;
    assert!(status.flood.contains(&second.id()));

    // Both sides vouched for each other.
    let deadline = Instant::now() + TEST_TIMEOUT;
    loop {
        let stats = server.stats().await.unwrap();
        if stats.verified == 2 {
            assert_eq!(stats.promoted, 2);
            break;
        }
        assert!(Instant::now() < deadline, "sockets never verified: {:?}", stats);
        sleep(Duration::from_millis(50)).await;
    }

    first.shutdown().await;
    second.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn application_messages_cross_a_link() {
    let network = MemoryNetwork::new();
    let server = RendezvousServer::spawn(RendezvousConfig::default());
    let dialer: Arc<dyn Dialer> = Arc::new(server.clone());

    let sender = spawn_node(&network, LocalIdentity::generate());
    let receiver = spawn_node(&network, LocalIdentity::generate());
    let mut inbox = receiver.messages().await.unwrap();
    sender.connect(dialer.clone()).await.unwrap();
    receiver.connect(dialer.clone()).await.unwrap();
    wait_for_status(&sender, |s| s.golden == 1).await;

    sender
        .send("chat", receiver.id(), json!({"text": "ping"}))
        .await
        .unwrap();
    let message = timeout(TEST_TIMEOUT, inbox.recv())
        .await
        .expect("message not delivered")
        .expect("inbox closed");
    assert_eq!(message.from, sender.id());
    assert_eq!(message.kind, "chat");
    assert_eq!(message.data, json!({"text": "ping"}));

    // The receiver is the closest node to its own id.
    sender
        .send_to_closest("chat", receiver.id(), json!(2))
        .await
        .unwrap();
    let message = timeout(TEST_TIMEOUT, inbox.recv()).await.unwrap().unwrap();
    assert_eq!(message.data, json!(2));

    sender.shutdown().await;
    receiver.shutdown().await;
    server.shutdown().await;
}

/// Wait until no channel message has moved for `window`, returning the total.
async fn wait_for_quiet(network: &MemoryNetwork, window: Duration) -> u64 {
    let deadline = Instant::now() + TEST_TIMEOUT;
    let mut last = network.delivered();
    loop {
        sleep(window).await;
        let now = network.delivered();
        if now == last {
            return now;
        }
        assert!(Instant::now() < deadline, "traffic never settled ({} frames)", now);
        last = now;
    }
}

#[tokio::test]
async fn unroutable_envelope_stops_bouncing() {
    let network = MemoryNetwork::new();
    let server = RendezvousServer::spawn(RendezvousConfig::default());
    let dialer: Arc<dyn Dialer> = Arc::new(server.clone());
    // No maintenance ticks, so every frame on the wire comes from the send.
    let config = OverlayConfig {
        maintenance_interval: Duration::from_secs(3600),
        ..fast_config()
    };

    let first_identity = LocalIdentity::generate();
    let second_identity = LocalIdentity::generate();
    let first = Node::spawn(first_identity.clone(), network.transport(first_identity.id), config.clone());
    let second = Node::spawn(second_identity.clone(), network.transport(second_identity.id), config.clone());
    first.connect(dialer.clone()).await.unwrap();
    second.connect(dialer.clone()).await.unwrap();
    let status = wait_for_status(&first, |s| s.golden == 1).await;
    assert!(!status.flood_is_full(config.flood_size));
    wait_for_status(&second, |s| s.golden == 1).await;

    let window = Duration::from_millis(300);
    let before = wait_for_quiet(&network, window).await;
    first
        .send("chat", RingId::hash_of(b"nobody"), json!("lost"))
        .await
        .unwrap();
    let after = wait_for_quiet(&network, window).await;

    // Each side may hand the envelope back until its retry budget runs out.
    let budget = 2 * (u64::from(config.max_retries) + 2);
    assert!(after > before, "envelope never left the sender");
    assert!(after - before <= budget, "{} frames for one envelope", after - before);
    assert_eq!(first.status().await.unwrap().pending_envelopes, 0);
    assert_eq!(second.status().await.unwrap().pending_envelopes, 0);

    first.shutdown().await;
    second.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn block_time_comes_from_rendezvous() {
    let network = MemoryNetwork::new();
    let server = RendezvousServer::spawn(RendezvousConfig::default());
    let node = spawn_node(&network, LocalIdentity::generate());
    node.connect(Arc::new(server.clone())).await.unwrap();

    let time = timeout(SHORT_TIMEOUT, node.block_time())
        .await
        .expect("block time timed out")
        .expect("block time failed");
    assert!(time.block < 144);
    assert!(time.time_till_end <= 10 * 60 * 1000);
    assert!(time.day > 0);

    node.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn second_session_routes_through_the_first() {
    let network = MemoryNetwork::new();
    let server = RendezvousServer::spawn(RendezvousConfig::default());
    let dialer: Arc<dyn Dialer> = Arc::new(server.clone());

    let first_identity = LocalIdentity::generate();
    let mut second_identity = first_identity.new_instance();
    second_identity.instance.created_ms = first_identity.instance.created_ms + 1;

    let first = spawn_node(&network, first_identity.clone());
    first.connect(dialer.clone()).await.unwrap();
    let second = Node::spawn(
        second_identity.clone(),
        network.transport(second_identity.id),
        fast_config(),
    );
    second.connect(dialer.clone()).await.unwrap();

    let status = wait_for_status(&second, |s| s.subordinate).await;
    assert!(!status.rendezvous_connected);
    wait_for_status(&first, |s| s.subordinates == 1).await;

    // Requests from the later session are answered through the earlier one.
    timeout(TEST_TIMEOUT, second.put("shared", json!(7)))
        .await
        .expect("put timed out")
        .expect("put failed");
    let record = timeout(TEST_TIMEOUT, second.get("shared"))
        .await
        .expect("get timed out")
        .expect("get failed");
    assert_eq!(record[&first_identity.id], json!(7));

    let record = first.get("shared").await.unwrap();
    assert_eq!(record[&first_identity.id], json!(7));

    second.shutdown().await;
    first.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn operations_fail_after_shutdown() {
    let network = MemoryNetwork::new();
    let node = spawn_node(&network, LocalIdentity::generate());
    node.shutdown().await;

    assert!(node.status().await.is_err());
    assert!(node.put("k", json!(1)).await.is_err());
    assert!(node
        .send("chat", RingId::hash_of(b"x"), json!(null))
        .await
        .is_err());
    // Hashing is pure and still usable.
    assert_eq!(hash_key("k"), RingId::hash_of(b"k"));
}
