//! Multi-node integration tests driven entirely through the public API: two or three
//! live `Mesh`/`Node` instances bound to loopback, talking over real UDP sockets.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use omerta_core::{BootstrapPeer, Config, Node, NetworkSecret};
use tokio::sync::oneshot;

fn config(key: [u8; 32], port: u16) -> Config {
    Config {
        encryption_key: key,
        storage_directory: std::env::temp_dir().join(format!("omerta-it-{}", omerta_crypto::random::next_u64_secure())),
        port,
        can_relay: false,
        can_coordinate_hole_punch: false,
        target_relay_count: 2,
        max_relay_count: 8,
        max_relay_sessions: 64,
        keepalive_interval: Duration::from_secs(30),
        connection_timeout: Duration::from_secs(2),
        cache_cleanup_interval: Duration::from_secs(60),
        bootstrap_peers: Vec::new(),
        max_cached_peers: 1024,
        peer_cache_ttl: Duration::from_secs(3600),
        hole_punch_probe_count: 5,
        hole_punch_probe_interval: Duration::from_millis(100),
        hole_punch_timeout: Duration::from_secs(5),
        hole_punch_cooldown: Duration::from_secs(30),
        recent_contact_max_age: Duration::from_secs(120),
        freshness_query_interval: Duration::from_millis(60),
        force_relay_only: false,
        allow_localhost: true,
        stun_servers: Vec::new(),
        ingress_keepalive_interval: Duration::from_secs(15),
        tunnel_idle_timeout: Duration::from_secs(120),
        replay_window_horizon: None,
        gossip_byte_budget: 16 * 1024,
    }
}

async fn rmdir(dir: &std::path::Path) {
    let _ = tokio::fs::remove_dir_all(dir).await;
}

#[tokio::test]
async fn direct_send_invokes_remote_handler_exactly_once() {
    use omerta_core::Mesh;

    let key = [3u8; 32];
    let b_cfg = config(key, 0);
    let b_dir = b_cfg.storage_directory.clone();
    let b = Mesh::new(b_cfg).await.unwrap();
    b.start().await.unwrap();

    let mut a_cfg = config(key, 0);
    a_cfg.bootstrap_peers = vec![BootstrapPeer { peer_id_hex: b.peer_id().to_hex(), endpoint: b.local_addr().unwrap().to_string() }];
    let a_dir = a_cfg.storage_directory.clone();
    let a = Mesh::new(a_cfg).await.unwrap();
    a.start().await.unwrap();

    let count = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = oneshot::channel();
    let tx = std::sync::Mutex::new(Some(tx));
    let count2 = count.clone();
    let a_peer = a.peer_id();
    b.on_channel("app", move |from, payload| {
        assert_eq!(from, a_peer);
        assert_eq!(payload, vec![0x01, 0x02, 0x03]);
        count2.fetch_add(1, Ordering::SeqCst);
        if let Some(tx) = tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
    })
    .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    a.send(&[0x01, 0x02, 0x03], b.peer_id(), "app", deadline).await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), rx).await.unwrap().unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);

    a.stop().await.unwrap();
    b.stop().await.unwrap();
    rmdir(&a_dir).await;
    rmdir(&b_dir).await;
}

#[tokio::test]
async fn relay_forwards_a_message_with_no_direct_path() {
    use omerta_core::Mesh;

    let key = [5u8; 32];
    let mut relay_cfg = config(key, 0);
    relay_cfg.can_relay = true;
    let relay_dir = relay_cfg.storage_directory.clone();
    let relay = Mesh::new(relay_cfg).await.unwrap();
    relay.start().await.unwrap();
    let relay_peer = relay.peer_id();
    let relay_endpoint = BootstrapPeer { peer_id_hex: relay_peer.to_hex(), endpoint: relay.local_addr().unwrap().to_string() };

    let mut b_cfg = config(key, 0);
    b_cfg.bootstrap_peers = vec![relay_endpoint.clone()];
    let b_dir = b_cfg.storage_directory.clone();
    let b = Mesh::new(b_cfg).await.unwrap();
    b.start().await.unwrap();

    // A never learns B's own endpoint (directly or via gossip), so the escalation
    // ladder's direct/hole-punch steps all miss and it falls through to the relay.
    let mut a_cfg = config(key, 0);
    a_cfg.bootstrap_peers = vec![relay_endpoint];
    let a_dir = a_cfg.storage_directory.clone();
    let a = Mesh::new(a_cfg).await.unwrap();
    a.start().await.unwrap();

    // B pings the relay directly so the relay's dispatcher learns B's endpoint the
    // same way it would learn any peer's endpoint from an authenticated packet. A
    // pings the relay too so the relay comes to know A and includes it in its next
    // gossip-announce fanout, teaching A that the relay's `canRelay` flag is set.
    b.ping(relay_peer, true, Duration::from_secs(2)).await.unwrap();
    a.ping(relay_peer, true, Duration::from_secs(2)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let (tx, rx) = oneshot::channel();
    let tx = std::sync::Mutex::new(Some(tx));
    let a_peer = a.peer_id();
    b.on_channel("app", move |from, payload| {
        assert_eq!(from, a_peer);
        assert_eq!(payload, vec![0xFF]);
        if let Some(tx) = tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
    })
    .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    a.send(&[0xFF], b.peer_id(), "app", deadline).await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), rx).await.unwrap().unwrap();

    a.stop().await.unwrap();
    b.stop().await.unwrap();
    relay.stop().await.unwrap();
    rmdir(&a_dir).await;
    rmdir(&b_dir).await;
    rmdir(&relay_dir).await;
}

#[tokio::test]
async fn garbage_datagram_never_reaches_a_channel_handler() {
    use omerta_core::Mesh;

    let key = [9u8; 32];
    let cfg = config(key, 0);
    let dir = cfg.storage_directory.clone();
    let mesh = Mesh::new(cfg).await.unwrap();
    mesh.start().await.unwrap();

    let invoked = Arc::new(AtomicUsize::new(0));
    let invoked2 = invoked.clone();
    mesh.on_channel("app", move |_from, _payload| {
        invoked2.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();

    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(&[0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x02, 0x03], mesh.local_addr().unwrap()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(invoked.load(Ordering::SeqCst), 0);

    mesh.stop().await.unwrap();
    rmdir(&dir).await;
}

#[tokio::test]
async fn cloister_negotiation_agrees_on_a_key_between_two_joined_networks() {
    let parent_key = [21u8; 32];

    let b_cfg = config(parent_key, 0);
    let b_dir = b_cfg.storage_directory.clone();
    let node_b = Node::new(b_cfg);
    let net_id_b = node_b.join_network(NetworkSecret::Key(parent_key)).await.unwrap();
    let mesh_b = node_b.network(&net_id_b).unwrap();

    let mut a_cfg = config(parent_key, 0);
    a_cfg.bootstrap_peers = vec![BootstrapPeer { peer_id_hex: mesh_b.peer_id().to_hex(), endpoint: mesh_b.local_addr().unwrap().to_string() }];
    let a_dir = a_cfg.storage_directory.clone();
    let node_a = Node::new(a_cfg);
    let net_id_a = node_a.join_network(NetworkSecret::Key(parent_key)).await.unwrap();
    let mesh_a = node_a.network(&net_id_a).unwrap();

    assert_eq!(net_id_a, net_id_b);

    let result = mesh_a.negotiate_cloister(mesh_b.peer_id(), "priv".to_string(), Duration::from_secs(2)).await.unwrap();
    assert_eq!(result.shared_with, mesh_b.peer_id());
    assert_eq!(result.network_id_hex.len(), 16);

    node_a.leave_network(&net_id_a).await.unwrap();
    node_b.leave_network(&net_id_b).await.unwrap();
    rmdir(&a_dir).await;
    rmdir(&b_dir).await;
}

#[tokio::test]
async fn invite_link_join_resolves_to_the_same_network_id_as_the_raw_key() {
    let key = [33u8; 32];
    let link = omerta_core::format_invite_link(&key);
    let (_, expected_id) = omerta_crypto::wire::network_id_and_hash(&key);

    let cfg = config([0u8; 32], 0);
    let dir = cfg.storage_directory.clone();
    let node = Node::new(cfg);
    let joined_id = node.join_network(NetworkSecret::InviteLink(link)).await.unwrap();

    assert_eq!(joined_id, expected_id);
    assert_eq!(node.joined_networks(), vec![joined_id.clone()]);

    node.leave_network(&joined_id).await.unwrap();
    assert!(node.joined_networks().is_empty());
    rmdir(&dir).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn back_to_back_messages_on_the_same_channel_are_delivered_in_order() {
    use omerta_core::Mesh;

    let key = [41u8; 32];
    let b_cfg = config(key, 0);
    let b_dir = b_cfg.storage_directory.clone();
    let b = Mesh::new(b_cfg).await.unwrap();
    b.start().await.unwrap();

    let mut a_cfg = config(key, 0);
    a_cfg.bootstrap_peers = vec![BootstrapPeer { peer_id_hex: b.peer_id().to_hex(), endpoint: b.local_addr().unwrap().to_string() }];
    let a_dir = a_cfg.storage_directory.clone();
    let a = Mesh::new(a_cfg).await.unwrap();
    a.start().await.unwrap();

    // The handler itself blocks synchronously rather than spawning further async work,
    // so on a multi-threaded runtime a per-datagram-spawn dispatcher would let the
    // second message's handler run on another worker thread and finish first; the
    // per-(peer, channel) delivery worker this dispatcher actually uses cannot start
    // the second handler call until the first one returns, since both calls happen
    // inline in the same serial loop.
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let order2 = order.clone();
    b.on_channel("app", move |_from, payload| {
        if payload == vec![1] {
            std::thread::sleep(Duration::from_millis(150));
        }
        order2.lock().unwrap().push(payload[0]);
    })
    .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    a.send(&[1], b.peer_id(), "app", deadline).await.unwrap();
    a.send(&[2], b.peer_id(), "app", deadline).await.unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(*order.lock().unwrap(), vec![1, 2]);

    a.stop().await.unwrap();
    b.stop().await.unwrap();
    rmdir(&a_dir).await;
    rmdir(&b_dir).await;
}

#[tokio::test]
async fn coordinator_assisted_hole_punch_establishes_a_direct_path() {
    use omerta_core::{Event, Mesh};

    let key = [51u8; 32];

    let mut coordinator_cfg = config(key, 0);
    coordinator_cfg.can_coordinate_hole_punch = true;
    let coordinator_dir = coordinator_cfg.storage_directory.clone();
    let coordinator = Mesh::new(coordinator_cfg).await.unwrap();
    coordinator.start().await.unwrap();
    let coordinator_peer = coordinator.peer_id();
    let coordinator_endpoint = BootstrapPeer { peer_id_hex: coordinator_peer.to_hex(), endpoint: coordinator.local_addr().unwrap().to_string() };

    let mut target_cfg = config(key, 0);
    target_cfg.bootstrap_peers = vec![coordinator_endpoint.clone()];
    let target_dir = target_cfg.storage_directory.clone();
    let target = Mesh::new(target_cfg).await.unwrap();
    target.start().await.unwrap();

    let mut a_cfg = config(key, 0);
    a_cfg.bootstrap_peers = vec![coordinator_endpoint];
    let a_dir = a_cfg.storage_directory.clone();
    let a = Mesh::new(a_cfg).await.unwrap();
    a.start().await.unwrap();

    // The coordinator learns both ends' endpoints by direct contact; neither end ever
    // contacts the other directly, so A's Endpoint Manager has no fresh direct endpoint
    // or directory-learned endpoint for target and falls through to `HolePunchThen`.
    target.ping(coordinator_peer, true, Duration::from_secs(2)).await.unwrap();
    a.ping(coordinator_peer, true, Duration::from_secs(2)).await.unwrap();

    // Gives the coordinator's gossip loop at least one tick to announce itself (with a
    // known-peers sample covering both ends) to A and target.
    tokio::time::sleep(Duration::from_millis(400)).await;

    let mut a_events = a.events();
    let mut target_events = target.events();

    let (tx, rx) = oneshot::channel();
    let tx = std::sync::Mutex::new(Some(tx));
    let a_peer = a.peer_id();
    target
        .on_channel("app", move |from, payload| {
            assert_eq!(from, a_peer);
            assert_eq!(payload, vec![0x42]);
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(());
            }
        })
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    a.send(&[0x42], target.peer_id(), "app", deadline).await.unwrap();
    tokio::time::timeout(Duration::from_secs(3), rx).await.unwrap().unwrap();

    let target_peer = target.peer_id();
    let saw_started = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Some(Event::HolePunchStarted(p)) = a_events.next().await {
                if p == target_peer {
                    return;
                }
            }
        }
    })
    .await;
    assert!(saw_started.is_ok(), "A never saw HolePunchStarted toward target");

    let saw_succeeded = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match target_events.next().await {
                Some(Event::DirectConnectionEstablished(p, _)) if p == a_peer => return,
                Some(_) => continue,
                None => return,
            }
        }
    })
    .await;
    assert!(saw_succeeded.is_ok(), "target never saw DirectConnectionEstablished with A");

    a.stop().await.unwrap();
    target.stop().await.unwrap();
    coordinator.stop().await.unwrap();
    rmdir(&a_dir).await;
    rmdir(&target_dir).await;
    rmdir(&coordinator_dir).await;
}

#[tokio::test]
async fn invite_link_with_a_foreign_scheme_is_rejected_at_join() {
    let cfg = config([0u8; 32], 0);
    let dir = cfg.storage_directory.clone();
    let node = Node::new(cfg);

    let err = node.join_network(NetworkSecret::InviteLink("https://example.com/not-omerta".to_string())).await;
    assert!(err.is_err());
    assert!(node.joined_networks().is_empty());
    rmdir(&dir).await;
}
