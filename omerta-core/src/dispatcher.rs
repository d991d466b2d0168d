//! Dispatcher (spec.md §4.10): the single receive task. Owns the UDP socket
//! exclusively for reading; nothing else in the node calls `recv_from` on it. Runs
//! every inbound datagram through the eight-step pipeline and hands authenticated
//! payloads off to the Channel Service, never blocking on a handler.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use omerta_crypto::{PeerId, Secret};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::channel::ChannelService;
use crate::codec::{self, DecodedHeader};
use crate::endpoint::Endpoint;
use crate::endpoint_manager::EndpointManager;
use crate::events::{Event, EventPublisher};
use crate::log::Log;
use crate::peer::EndpointSource;
use crate::peer_store::PeerStoreHandle;
use crate::relay::RelayServer;

/// Reserved channels are protocol-internal; applications may not register a handler on
/// one (the node's own startup wiring is the only caller allowed to). Disambiguating
/// concurrent requests to the same peer is the message body's job (each carries a
/// `request_id` or nonce), not the channel name's, so these stay flat names rather than
/// being parameterized per peer.
pub fn is_reserved_channel(channel: &str) -> bool {
    channel.starts_with("mesh-") || channel.starts_with("cloister-") || channel.starts_with("invite-")
}

/// Bounded per-peer replay guard: (messageId) seen within the configured horizon.
/// A `VecDeque` gives FIFO eviction once a peer's set exceeds its cap, satisfying
/// "bounded LRU (>= 1024 per peer)" (SPEC_FULL.md §10 Q2) without needing a full LRU
/// structure, since inbound messageIds are never looked up except for membership.
struct ReplayGuard {
    per_peer: HashMap<PeerId, (HashMap<Vec<u8>, ()>, VecDeque<Vec<u8>>)>,
    cap_per_peer: usize,
}

impl ReplayGuard {
    fn new(cap_per_peer: usize) -> Self {
        Self { per_peer: HashMap::new(), cap_per_peer: cap_per_peer.max(1024) }
    }

    /// Returns `true` if this (peer, messageId) pair is a replay and should be dropped.
    fn check_and_record(&mut self, peer: PeerId, message_id: &[u8]) -> bool {
        let (seen, order) = self.per_peer.entry(peer).or_insert_with(|| (HashMap::new(), VecDeque::new()));
        if seen.contains_key(message_id) {
            return true;
        }
        seen.insert(message_id.to_vec(), ());
        order.push_back(message_id.to_vec());
        while order.len() > self.cap_per_peer {
            if let Some(oldest) = order.pop_front() {
                seen.remove(&oldest);
            }
        }
        false
    }
}

/// A per-(fromPeerId, channel) delivery worker's queue slot, plus when it was last
/// handed work, so idle workers can be pruned.
struct DeliveryWorker {
    tx: mpsc::UnboundedSender<DeliveryItem>,
    last_used: Instant,
}

struct DeliveryItem {
    header: DecodedHeader,
    from_addr: SocketAddr,
}

pub struct Dispatcher {
    socket: Arc<UdpSocket>,
    header_key: Secret<32>,
    payload_key: Secret<32>,
    network_hash: [u8; 8],
    our_peer_id: PeerId,
    peer_store: PeerStoreHandle,
    endpoint_manager: Arc<EndpointManager>,
    channel_service: Arc<ChannelService>,
    relay_server: tokio::sync::Mutex<RelayServer>,
    events: EventPublisher,
    log: Arc<Log>,
    replay_guard: tokio::sync::Mutex<ReplayGuard>,
    /// One serial queue per (fromPeerId, channel) pair, so two messages that arrive in
    /// order on the same pair always have their handlers invoked in that same order,
    /// even though different pairs are delivered fully concurrently (spec.md §5).
    delivery_workers: tokio::sync::Mutex<HashMap<(PeerId, String), DeliveryWorker>>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        socket: Arc<UdpSocket>,
        header_key: Secret<32>,
        payload_key: Secret<32>,
        network_hash: [u8; 8],
        our_peer_id: PeerId,
        peer_store: PeerStoreHandle,
        endpoint_manager: Arc<EndpointManager>,
        channel_service: Arc<ChannelService>,
        relay_server: RelayServer,
        events: EventPublisher,
        log: Arc<Log>,
        replay_window_cap: usize,
    ) -> Self {
        Self {
            socket,
            header_key,
            payload_key,
            network_hash,
            our_peer_id,
            peer_store,
            endpoint_manager,
            channel_service,
            relay_server: tokio::sync::Mutex::new(relay_server),
            events,
            log,
            replay_guard: tokio::sync::Mutex::new(ReplayGuard::new(replay_window_cap)),
            delivery_workers: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Runs the receive loop until the socket errors out or the node is shut down.
    /// Decode-through-forward-decision happens inline here, in strict arrival order;
    /// only the final handler invocation is handed off (to a per-key delivery worker),
    /// so a slow or concurrently-scheduled decrypt can never let a later datagram's
    /// handler run before an earlier one's.
    pub async fn run(self: Arc<Self>) {
        let mut buf = vec![0u8; 65536];
        loop {
            let (n, from) = match self.socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    crate::log_error!(self.log, "dispatcher", "socket recv error, stopping receive loop: {e}");
                    return;
                }
            };
            let datagram = buf[..n].to_vec();
            Arc::clone(&self).handle_datagram(datagram, from).await;
        }
    }

    async fn handle_datagram(self: Arc<Self>, raw: Vec<u8>, from: SocketAddr) {
        // Steps 1-3 (prefix check, header decrypt+verify, networkHash check) happen in
        // `decode_header`, which never even accepts a payload key: it is structurally
        // incapable of decrypting the payload. Steps 5/7 (signature verify, payload
        // decrypt+verify) only run later, in `finish_decode`, and only for packets
        // addressed to us.
        let header = match codec::decode_header(&self.header_key, &self.network_hash, &raw) {
            Ok(h) => h,
            Err(e) => {
                crate::log_trace!(self.log, "dispatcher", "dropped datagram from {from}: {e}");
                return;
            }
        };

        // Step 4: replay guard.
        {
            let mut guard = self.replay_guard.lock().await;
            if guard.check_and_record(header.from_peer_id, &header.message_id) {
                crate::log_trace!(self.log, "dispatcher", "dropped replayed message from {}", header.from_peer_id);
                return;
            }
        }

        // Step 6: forwarding if addressed elsewhere. A relay never authenticates or
        // decrypts the payload of packets it forwards, so forwarded packets never go
        // through `finish_decode` at all; only the header fields already in hand here
        // are used, and the original encrypted bytes are forwarded unchanged.
        if let Some(to) = header.to_peer_id {
            if to != self.our_peer_id {
                self.try_forward(header.from_peer_id, to, &raw).await;
                return;
            }
        }

        self.enqueue_for_delivery(header, from).await;
    }

    /// Queues a header addressed to us onto its (fromPeerId, channel) delivery worker,
    /// spawning one if none exists yet. Enqueueing happens in receive order, so the
    /// worker drains its queue in that same order regardless of how long payload
    /// decrypt or the handler itself takes for any individual item.
    async fn enqueue_for_delivery(self: Arc<Self>, header: DecodedHeader, from: SocketAddr) {
        let key = (header.from_peer_id, header.channel.clone());
        let item = DeliveryItem { header, from_addr: from };

        let mut workers = self.delivery_workers.lock().await;
        if let Some(worker) = workers.get_mut(&key) {
            worker.last_used = Instant::now();
            if worker.tx.send(item).is_ok() {
                return;
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(item);
        workers.insert(key, DeliveryWorker { tx, last_used: Instant::now() });
        drop(workers);

        tokio::spawn(self.run_delivery_worker(rx));
    }

    /// Drains one (fromPeerId, channel) pair's queue strictly in enqueue order: step 7
    /// (payload decrypt+auth), step 5 (signature verify, bundled together in
    /// `finish_decode` since the signature covers the decrypted plaintext), then step 8
    /// (observed-endpoint learning and routing by channel).
    async fn run_delivery_worker(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<DeliveryItem>) {
        while let Some(item) = rx.recv().await {
            let from_addr = item.from_addr;
            let packet = match codec::finish_decode(&self.payload_key, item.header) {
                Ok(p) => p,
                Err(e) => {
                    crate::log_trace!(self.log, "dispatcher", "dropped datagram from {from_addr}: {e}");
                    continue;
                }
            };

            let observed = Endpoint::from_socket_addr(from_addr);
            self.endpoint_manager.note_observed(packet.from_peer_id, observed.clone(), self.our_peer_id).await;
            self.peer_store.upsert_from_authenticated(packet.from_peer_id, observed, EndpointSource::LearnedFromPeer).await;

            self.channel_service.dispatch_inbound(packet.from_peer_id, &packet.channel, packet.payload);
        }
    }

    /// A relay never decrypts the payload of packets it forwards; this only consults
    /// the already-decrypted header (which the dispatcher needed anyway to learn
    /// `toPeerId`) and forwards the original encrypted bytes unchanged.
    async fn try_forward(&self, from_peer_id: PeerId, to: PeerId, raw: &[u8]) {
        let endpoints = self.peer_store.get_endpoints(to).await;
        let Some(target_endpoint) = endpoints.into_iter().next() else {
            crate::log_trace!(self.log, "dispatcher", "no known route to forward toward {to}, dropping");
            return;
        };
        let Some(addr) = target_endpoint.socket_addr() else { return };

        let mut server = self.relay_server.lock().await;
        let session = match server.accept(from_peer_id, to, Instant::now()) {
            Ok(s) => s,
            Err(e) => {
                crate::log_trace!(self.log, "dispatcher", "refusing to forward, relay at capacity: {e}");
                return;
            }
        };
        if server.forward(session, raw.len() as u64, Instant::now()).is_ok() {
            drop(server);
            if self.socket.send_to(raw, addr).await.is_err() {
                self.events.publish(Event::MessageSendFailed(to, "relay forward failed".to_string()));
            }
        }
    }

    /// Prunes delivery workers untouched for longer than `max_idle`. Dropping a
    /// worker's sender lets its task's `rx.recv()` return `None` and exit on its own.
    /// Called periodically from the node's cache-cleanup background task, the same way
    /// relay sessions are swept.
    pub async fn evict_idle_delivery_workers(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let mut workers = self.delivery_workers.lock().await;
        let before = workers.len();
        workers.retain(|_, w| now.saturating_duration_since(w.last_used) <= max_idle);
        before - workers.len()
    }

    pub fn our_network_hash(&self) -> [u8; 8] {
        self.network_hash
    }

    /// Evicts idle relay sessions. Called periodically from the node's cache-cleanup
    /// background task; the relay server has no clock of its own.
    pub async fn evict_idle_relays(&self) -> usize {
        self.relay_server.lock().await.evict_idle(Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_channel_detection() {
        assert!(is_reserved_channel("mesh-ping"));
        assert!(is_reserved_channel("cloister-negotiate"));
        assert!(is_reserved_channel("cloister-response"));
        assert!(is_reserved_channel("invite-final-ack"));
        assert!(!is_reserved_channel("app"));
    }

    #[test]
    fn replay_guard_drops_repeated_message_id() {
        use omerta_crypto::Identity;
        let mut guard = ReplayGuard::new(1024);
        let peer = Identity::generate().peer_id();
        assert!(!guard.check_and_record(peer, b"msg-1"));
        assert!(guard.check_and_record(peer, b"msg-1"));
        assert!(!guard.check_and_record(peer, b"msg-2"));
    }

    #[test]
    fn replay_guard_is_bounded_per_peer() {
        use omerta_crypto::Identity;
        let mut guard = ReplayGuard::new(4);
        let peer = Identity::generate().peer_id();
        for i in 0..10u32 {
            assert!(!guard.check_and_record(peer, &i.to_le_bytes()));
        }
        // The earliest ids were evicted, so they're no longer recognized as replays.
        assert!(!guard.check_and_record(peer, &0u32.to_le_bytes()));
    }
}
