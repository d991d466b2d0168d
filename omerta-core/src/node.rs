//! The public API surface (spec.md §6 / SPEC_FULL.md §7): `Mesh` is one joined
//! network — its own socket, peer store, and dispatcher, per spec.md §3's "each network
//! is an isolated instance of the whole core." `Node` owns the set of networks a process
//! has joined and is what `join_network`/`leave_network` actually operate on.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use omerta_crypto::wire;
use omerta_crypto::{Identity, PeerId, Secret};
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::channel::{ChannelService, Transport};
use crate::cloister::{CloisterRequest, CloisterResponse, CloisterResult, CloisterService, InviteFinalAck, InviteKeyExchangeRequest, InviteKeyExchangeResponse, InvitePayload};
use crate::codec::{self, PacketFields};
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::endpoint::Endpoint;
use crate::endpoint_manager::{EndpointManager, Path};
use crate::error::{Error, Result};
use crate::events::{Event, EventPublisher, EventSubscription};
use crate::gossip::{self, channel_priority, Advertisement, DirectoryHandle};
use crate::holepunch::{Attempt, HolePunchEngine};
use crate::keepalive::KeepaliveTracker;
use crate::log::{Level, Log};
use crate::peer::{EndpointSource, NatType, PeerRecord};
use crate::peer_store::{self, PeerStoreHandle};
use crate::persistence::{self, PersistedNetworkState};
use crate::relay::RelayServer;

const MISSED_PING_THRESHOLD: u32 = 3;
const EXPIRED_PING_THRESHOLD: u32 = 6;
const KEEPALIVE_CYCLE_MAX_PEERS: usize = 16;
const KNOWN_PEERS_SAMPLE_SIZE: usize = 16;
const PONG_SAMPLE_SIZE: usize = 5;
const REPLAY_WINDOW_CAP: usize = 1024;
const EVENT_QUEUE_CAPACITY: usize = 256;

const CH_PING: &str = "mesh-ping";
const CH_PONG: &str = "mesh-pong";
const CH_GOSSIP_ANNOUNCE: &str = "mesh-gossip-announce";
const CH_CLOISTER_NEGOTIATE: &str = "cloister-negotiate";
const CH_CLOISTER_RESPONSE: &str = "cloister-response";
const CH_INVITE_KEY_EXCHANGE_REQUEST: &str = "invite-key-exchange-request";
const CH_INVITE_KEY_EXCHANGE_RESPONSE: &str = "invite-key-exchange-response";
const CH_INVITE_PAYLOAD: &str = "invite-payload";
const CH_INVITE_FINAL_ACK: &str = "invite-final-ack";
const CH_HOLEPUNCH_REQUEST: &str = "mesh-holepunch-request";
const CH_HOLEPUNCH_SCHEDULE: &str = "mesh-holepunch-schedule";
const CH_HOLEPUNCH_PROBE: &str = "mesh-holepunch-probe";

/// Delay between a coordinator scheduling a punch and both ends starting to probe,
/// giving the `PunchSchedule` time to reach both peers (spec.md §4.8 step 1's `t0 = now
/// + δ`).
const HOLEPUNCH_SCHEDULE_DELTA: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PingWire {
    nonce: u64,
    lightweight: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PongWire {
    nonce: u64,
    observed_endpoint: Option<String>,
    known_peers_sample: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GossipAnnounceWire {
    peer_id_hex: String,
    nat_type: u8,
    endpoints: Vec<String>,
    can_relay: bool,
    can_coordinate_hole_punch: bool,
    /// A bounded sample of peers this node itself knows about, so a receiver's
    /// Directory can tell which of our candidates actually have a path to a given
    /// target (spec.md §4.8 step 1's "direct paths to both ends").
    known_peers_hex: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HolePunchRequestWire {
    target_peer_id_hex: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HolePunchScheduleWire {
    initiator_peer_id_hex: String,
    target_peer_id_hex: String,
    coordinator_peer_id_hex: String,
    t0_millis: u64,
    initiator_endpoint: String,
    target_endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HolePunchProbeWire {
    nonce: u64,
}

fn nat_type_to_u8(n: NatType) -> u8 {
    match n {
        NatType::Open => 0,
        NatType::FullCone => 1,
        NatType::RestrictedCone => 2,
        NatType::PortRestricted => 3,
        NatType::Symmetric => 4,
        NatType::Unknown => 5,
    }
}

fn nat_type_from_u8(n: u8) -> NatType {
    match n {
        0 => NatType::Open,
        1 => NatType::FullCone,
        2 => NatType::RestrictedCone,
        3 => NatType::PortRestricted,
        4 => NatType::Symmetric,
        _ => NatType::Unknown,
    }
}

/// What a ping round-trip reports back to the caller.
#[derive(Debug, Clone)]
pub struct PingResult {
    pub rtt: Duration,
    pub your_observed_endpoint: Option<Endpoint>,
    pub learned_peers: Vec<PeerId>,
}

/// Sends real packets over a bound UDP socket. The packet's `toPeerId` is always the
/// logical recipient; the physical destination address differs from it whenever the
/// chosen path relays or hole-punches through a third peer.
struct UdpTransport {
    socket: Arc<UdpSocket>,
    identity: Identity,
    header_key: Secret<32>,
    payload_key: Secret<32>,
    network_hash: [u8; 8],
    endpoint_manager: Arc<EndpointManager>,
    /// Fires `(target, coordinator)` whenever a send chooses `Path::HolePunchThen`, so
    /// the node can kick off an actual punch attempt alongside the relayed-through-
    /// coordinator send this transport already performs.
    punch_trigger: mpsc::UnboundedSender<(PeerId, PeerId)>,
}

impl UdpTransport {
    async fn resolve_addr(&self, peer: PeerId) -> Result<std::net::SocketAddr> {
        self.endpoint_manager
            .peer_store
            .get_endpoints(peer)
            .await
            .into_iter()
            .find_map(|e| e.socket_addr())
            .ok_or(Error::PeerUnreachable)
    }
}

#[async_trait]
impl Transport for UdpTransport {
    /// `HolePunchThen` is sent through the coordinator exactly like a relay hop for the
    /// first datagram; the coordinator's own forwarding plus the Endpoint Manager's
    /// observed-endpoint learning on the next authenticated reply is what lets later
    /// sends upgrade to `Direct` once a hole is actually open.
    async fn send_via(&self, to: PeerId, path: &Path, channel: &str, payload: &[u8]) -> Result<()> {
        let addr = match path {
            Path::Direct(endpoint) => endpoint.socket_addr().ok_or(Error::PeerUnreachable)?,
            Path::Relay(relay) => self.resolve_addr(*relay).await?,
            Path::HolePunchThen(coordinator) => {
                let _ = self.punch_trigger.send((to, *coordinator));
                self.resolve_addr(*coordinator).await?
            }
        };

        let message_id = omerta_crypto::random::next_u64_secure().to_le_bytes();
        let fields = PacketFields {
            from_peer_id: self.identity.peer_id(),
            to_peer_id: Some(to),
            channel,
            hop_count: 0,
            timestamp_ms: now_millis(),
            message_id: &message_id,
            sender_public_key: self.identity.verifying_key().to_bytes(),
            payload,
        };
        let signature = codec::sign_fields(&self.identity, &self.network_hash, &fields);
        let raw = codec::encode(&self.header_key, &self.payload_key, &self.network_hash, &fields, &signature);

        self.socket.send_to(&raw, addr).await.map_err(Error::from)?;
        Ok(())
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

struct PendingCloisterNegotiate {
    peer: PeerId,
    reply: oneshot::Sender<Result<CloisterResult>>,
}

struct PendingInviteShare {
    reply: oneshot::Sender<Result<()>>,
}

/// One joined network: its own socket, store, and dispatcher, exactly as spec.md §3
/// requires. Constructing one binds the UDP socket immediately (so the caller can learn
/// an OS-assigned ephemeral port right away); `start` only spins up background work.
pub struct Mesh {
    identity: Identity,
    config: Config,
    network_id_hex: String,
    network_hash: [u8; 8],
    socket: Arc<UdpSocket>,
    peer_store: PeerStoreHandle,
    directory: DirectoryHandle,
    endpoint_manager: Arc<EndpointManager>,
    channel_service: Arc<ChannelService>,
    dispatcher: Arc<Dispatcher>,
    cloister: Arc<CloisterService>,
    keepalive: Arc<SyncMutex<KeepaliveTracker>>,
    holepunch: Arc<SyncMutex<HolePunchEngine>>,
    /// In-flight punch attempts keyed by the other peer, paired with the `Instant` the
    /// probe burst for that attempt actually started (used to report an approximate
    /// RTT on success, since probes are one-way bursts rather than request/response).
    punch_attempts: Arc<SyncMutex<HashMap<PeerId, (Attempt, Instant)>>>,
    /// Taken and spawned once in `start`; carries `(target, coordinator)` triggers from
    /// [`UdpTransport::send_via`] choosing `Path::HolePunchThen`.
    punch_trigger_rx: SyncMutex<Option<mpsc::UnboundedReceiver<(PeerId, PeerId)>>>,
    header_key: Secret<32>,
    payload_key: Secret<32>,
    events: EventPublisher,
    log: Arc<Log>,
    local_nat_type: SyncMutex<NatType>,
    pending_pings: Arc<SyncMutex<HashMap<(PeerId, u64), oneshot::Sender<PongWire>>>>,
    pending_negotiations: Arc<SyncMutex<HashMap<u64, PendingCloisterNegotiate>>>,
    pending_invite_shares: Arc<SyncMutex<HashMap<u64, PendingInviteShare>>>,
    invite_keys_in_progress: Arc<SyncMutex<HashMap<u64, Secret<32>>>>,
    background: SyncMutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Mesh {
    /// Builds and binds everything a network needs, but does not yet start background
    /// tasks or classify the local NAT; call [`Mesh::start`] for that.
    pub async fn new(config: Config) -> Result<Arc<Mesh>> {
        config.validate()?;
        let log = Log::stderr(Level::Info);

        let (network_hash, network_id_hex) = wire::network_id_and_hash(&config.encryption_key);
        let header_key = wire::derive_header_key(&config.encryption_key);
        let payload_key = wire::payload_key(&config.encryption_key);

        let persisted = persistence::load(&config.storage_directory, &network_id_hex).await?;
        let identity = match &persisted {
            Some(state) => {
                let bytes = hex::decode(&state.identity_secret_hex).map_err(|e| Error::InvalidConfiguration(e.to_string()))?;
                let seed: [u8; 32] = bytes.try_into().map_err(|_| Error::InvalidConfiguration("persisted identity secret is not 32 bytes".into()))?;
                Identity::from_secret_bytes(&seed)
            }
            None => Identity::generate(),
        };
        let our_peer_id = identity.peer_id();

        let socket = Arc::new(UdpSocket::bind(("0.0.0.0", config.port)).await?);

        let peer_store = peer_store::spawn(config.max_cached_peers, config.recent_contact_max_age, log.clone());
        if let Some(state) = &persisted {
            for p in &state.peers {
                let Some(peer_id) = PeerId::from_hex(&p.peer_id_hex) else { continue };
                for ep in &p.endpoints {
                    if let Some(endpoint) = Endpoint::parse(&ep.endpoint) {
                        peer_store.seed_known_endpoint(peer_id, endpoint, EndpointSource::Bootstrap).await;
                    }
                }
            }
        }
        for bp in &config.bootstrap_peers {
            let Some(peer_id) = PeerId::from_hex(&bp.peer_id_hex) else { continue };
            if let Some(endpoint) = Endpoint::parse(&bp.endpoint) {
                peer_store.seed_known_endpoint(peer_id, endpoint, EndpointSource::Bootstrap).await;
            }
        }

        let directory = gossip::spawn_directory_with_interval(log.clone(), config.freshness_query_interval);
        let endpoint_manager = Arc::new(EndpointManager {
            peer_store: peer_store.clone(),
            directory: directory.clone(),
            force_relay_only: config.force_relay_only,
            recent_contact_max_age: config.recent_contact_max_age,
        });

        let events = EventPublisher::new(EVENT_QUEUE_CAPACITY);

        let (punch_trigger_tx, punch_trigger_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(UdpTransport {
            socket: socket.clone(),
            identity: identity.clone(),
            header_key: header_key.clone(),
            payload_key: payload_key.clone(),
            network_hash,
            endpoint_manager: endpoint_manager.clone(),
            punch_trigger: punch_trigger_tx,
        });
        let channel_service = Arc::new(ChannelService::new(endpoint_manager.clone(), transport, log.clone()));

        let relay_server = RelayServer::new(config.max_relay_sessions, config.tunnel_idle_timeout);
        let dispatcher = Arc::new(Dispatcher::new(
            socket.clone(),
            header_key.clone(),
            payload_key.clone(),
            network_hash,
            our_peer_id,
            peer_store.clone(),
            endpoint_manager.clone(),
            channel_service.clone(),
            relay_server,
            events.clone(),
            log.clone(),
            REPLAY_WINDOW_CAP,
        ));

        let cloister = Arc::new(CloisterService::new());
        let keepalive = Arc::new(SyncMutex::new(KeepaliveTracker::new(MISSED_PING_THRESHOLD, EXPIRED_PING_THRESHOLD)));
        let holepunch = Arc::new(SyncMutex::new(HolePunchEngine::new(
            config.hole_punch_probe_count,
            config.hole_punch_probe_interval,
            config.hole_punch_timeout,
            config.hole_punch_cooldown,
        )));
        let punch_attempts = Arc::new(SyncMutex::new(HashMap::new()));

        let pending_pings = Arc::new(SyncMutex::new(HashMap::new()));
        let pending_negotiations = Arc::new(SyncMutex::new(HashMap::new()));
        let pending_invite_shares = Arc::new(SyncMutex::new(HashMap::new()));
        let invite_keys_in_progress = Arc::new(SyncMutex::new(HashMap::new()));

        let mesh = Arc::new(Mesh {
            identity,
            config,
            network_id_hex,
            network_hash,
            socket,
            peer_store,
            directory,
            endpoint_manager,
            channel_service: channel_service.clone(),
            dispatcher,
            cloister: cloister.clone(),
            keepalive: keepalive.clone(),
            holepunch,
            punch_attempts,
            punch_trigger_rx: SyncMutex::new(Some(punch_trigger_rx)),
            header_key,
            payload_key,
            events: events.clone(),
            log: log.clone(),
            local_nat_type: SyncMutex::new(NatType::Unknown),
            pending_pings: pending_pings.clone(),
            pending_negotiations: pending_negotiations.clone(),
            pending_invite_shares: pending_invite_shares.clone(),
            invite_keys_in_progress: invite_keys_in_progress.clone(),
            background: SyncMutex::new(Vec::new()),
            started: AtomicBool::new(false),
        });

        mesh.register_internal_channels();
        Ok(mesh)
    }

    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    pub fn network_id_hex(&self) -> &str {
        &self.network_id_hex
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.socket.local_addr()
    }

    fn register_internal_channels(self: &Arc<Self>) {
        let this = self.clone();
        self.channel_service
            .on_channel(CH_PING, move |from, payload| {
                let this = this.clone();
                tokio::spawn(async move { this.handle_ping(from, payload).await });
            })
            .expect("reserved channel names are always valid");

        let this = self.clone();
        self.channel_service
            .on_channel(CH_PONG, move |from, payload| {
                this.clone().handle_pong(from, payload);
            })
            .expect("reserved channel names are always valid");

        let this = self.clone();
        self.channel_service
            .on_channel(CH_GOSSIP_ANNOUNCE, move |from, payload| {
                let this = this.clone();
                tokio::spawn(async move { this.handle_gossip_announce(from, payload).await });
            })
            .expect("reserved channel names are always valid");

        let this = self.clone();
        self.channel_service
            .on_channel(CH_CLOISTER_NEGOTIATE, move |from, payload| {
                let this = this.clone();
                tokio::spawn(async move { this.handle_cloister_negotiate(from, payload).await });
            })
            .expect("reserved channel names are always valid");

        let this = self.clone();
        self.channel_service
            .on_channel(CH_CLOISTER_RESPONSE, move |from, payload| {
                this.clone().handle_cloister_response(from, payload);
            })
            .expect("reserved channel names are always valid");

        let this = self.clone();
        self.channel_service
            .on_channel(CH_INVITE_KEY_EXCHANGE_REQUEST, move |from, payload| {
                let this = this.clone();
                tokio::spawn(async move { this.handle_invite_key_exchange_request(from, payload).await });
            })
            .expect("reserved channel names are always valid");

        let this = self.clone();
        self.channel_service
            .on_channel(CH_INVITE_KEY_EXCHANGE_RESPONSE, move |from, payload| {
                this.clone().handle_invite_key_exchange_response(from, payload);
            })
            .expect("reserved channel names are always valid");

        let this = self.clone();
        self.channel_service
            .on_channel(CH_INVITE_PAYLOAD, move |from, payload| {
                let this = this.clone();
                tokio::spawn(async move { this.handle_invite_payload(from, payload).await });
            })
            .expect("reserved channel names are always valid");

        let this = self.clone();
        self.channel_service
            .on_channel(CH_INVITE_FINAL_ACK, move |from, payload| {
                this.clone().handle_invite_final_ack(from, payload);
            })
            .expect("reserved channel names are always valid");

        let this = self.clone();
        self.channel_service
            .on_channel(CH_HOLEPUNCH_REQUEST, move |from, payload| {
                let this = this.clone();
                tokio::spawn(async move { this.handle_holepunch_request(from, payload).await });
            })
            .expect("reserved channel names are always valid");

        let this = self.clone();
        self.channel_service
            .on_channel(CH_HOLEPUNCH_SCHEDULE, move |from, payload| {
                let this = this.clone();
                tokio::spawn(async move { this.handle_holepunch_schedule(from, payload).await });
            })
            .expect("reserved channel names are always valid");

        let this = self.clone();
        self.channel_service
            .on_channel(CH_HOLEPUNCH_PROBE, move |from, payload| {
                let this = this.clone();
                tokio::spawn(async move { this.handle_holepunch_probe(from, payload).await });
            })
            .expect("reserved channel names are always valid");
    }

    async fn handle_ping(self: Arc<Self>, from: PeerId, payload: Vec<u8>) {
        let Ok(ping) = serde_json::from_slice::<PingWire>(&payload) else { return };
        let sample = self
            .peer_store
            .all_peers()
            .await
            .into_iter()
            .filter(|r| r.peer_id != from)
            .take(PONG_SAMPLE_SIZE)
            .map(|r| r.peer_id.to_hex())
            .collect();
        let observed = self.peer_store.get_endpoints(from).await.into_iter().next().map(|e| e.as_str().to_string());
        let pong = PongWire { nonce: ping.nonce, observed_endpoint: observed, known_peers_sample: sample };
        if let Ok(bytes) = serde_json::to_vec(&pong) {
            let deadline = Instant::now() + self.config.connection_timeout;
            let _ = self.channel_service.send(&bytes, from, CH_PONG, deadline).await;
        }
        self.keepalive.lock().record_pong(from, Instant::now());
    }

    fn handle_pong(self: Arc<Self>, from: PeerId, payload: Vec<u8>) {
        let Ok(pong) = serde_json::from_slice::<PongWire>(&payload) else { return };
        if let Some(tx) = self.pending_pings.lock().remove(&(from, pong.nonce)) {
            let _ = tx.send(pong);
        }
        self.keepalive.lock().record_pong(from, Instant::now());
    }

    async fn handle_gossip_announce(self: Arc<Self>, from: PeerId, payload: Vec<u8>) {
        let Ok(wire) = serde_json::from_slice::<GossipAnnounceWire>(&payload) else { return };
        let Some(peer_id) = PeerId::from_hex(&wire.peer_id_hex) else { return };
        let endpoints: Vec<Endpoint> = wire.endpoints.iter().filter_map(|s| Endpoint::parse(s)).collect();
        let known_peer_ids: Vec<PeerId> = wire.known_peers_hex.iter().filter_map(|h| PeerId::from_hex(h)).collect();
        let is_new = self.peer_store.get_endpoints(peer_id).await.is_empty();
        self.directory
            .ingest(Advertisement {
                peer_id,
                nat_type: nat_type_from_u8(wire.nat_type),
                endpoints,
                can_relay: wire.can_relay,
                can_coordinate_hole_punch: wire.can_coordinate_hole_punch,
                rtt_from_us: None,
                received_at: Instant::now(),
                known_peer_ids,
            })
            .await;
        self.keepalive.lock().track(from, Instant::now());
        if is_new {
            self.events.publish(Event::PeerDiscovered(peer_id));
        }
    }

    async fn handle_cloister_negotiate(self: Arc<Self>, from: PeerId, payload: Vec<u8>) {
        let Ok(request) = serde_json::from_slice::<CloisterRequest>(&payload) else { return };
        let (response, result) = self.cloister.handle_negotiate_request(from, &request);
        self.events.publish(Event::NetworkJoined(result.network_id_hex.clone()));
        if let Ok(bytes) = serde_json::to_vec(&response) {
            let deadline = Instant::now() + self.config.connection_timeout;
            let _ = self.channel_service.send(&bytes, from, CH_CLOISTER_RESPONSE, deadline).await;
        }
    }

    fn handle_cloister_response(self: Arc<Self>, from: PeerId, payload: Vec<u8>) {
        let Ok(response) = serde_json::from_slice::<CloisterResponse>(&payload) else { return };
        let request_id = response.request_id;
        let outcome = self.cloister.handle_negotiate_response(from, &response);
        if let Some(pending) = self.pending_negotiations.lock().remove(&request_id) {
            let _ = pending.reply.send(outcome);
        }
    }

    async fn handle_invite_key_exchange_request(self: Arc<Self>, from: PeerId, payload: Vec<u8>) {
        let Ok(request) = serde_json::from_slice::<InviteKeyExchangeRequest>(&payload) else { return };
        let (response, invite_key) = self.cloister.handle_invite_key_exchange_request(&request);
        self.invite_keys_in_progress.lock().insert(request.request_id, invite_key);
        if let Ok(bytes) = serde_json::to_vec(&response) {
            let deadline = Instant::now() + self.config.connection_timeout;
            let _ = self.channel_service.send(&bytes, from, CH_INVITE_KEY_EXCHANGE_RESPONSE, deadline).await;
        }
    }

    fn handle_invite_key_exchange_response(self: Arc<Self>, from: PeerId, payload: Vec<u8>) {
        let Ok(response) = serde_json::from_slice::<InviteKeyExchangeResponse>(&payload) else { return };
        let Some(share) = self.pending_invite_key_to_share(response.request_id) else { return };
        let this = self.clone();
        tokio::spawn(async move {
            let invite_payload = this.cloister.handle_invite_key_exchange_response(&response, &share.0, share.1.as_deref());
            if let Ok(invite_payload) = invite_payload {
                if let Ok(bytes) = serde_json::to_vec(&invite_payload) {
                    let deadline = Instant::now() + this.config.connection_timeout;
                    let _ = this.channel_service.send(&bytes, from, CH_INVITE_PAYLOAD, deadline).await;
                }
            }
        });
    }

    fn pending_invite_key_to_share(&self, request_id: u64) -> Option<(Secret<32>, Option<String>)> {
        self.pending_invite_shares.lock().get(&request_id).map(|_| (Secret::new(self.config.encryption_key), None))
    }

    async fn handle_invite_payload(self: Arc<Self>, from: PeerId, payload: Vec<u8>) {
        let Ok(invite_payload) = serde_json::from_slice::<InvitePayload>(&payload) else { return };
        let Some(invite_key) = self.invite_keys_in_progress.lock().remove(&invite_payload.request_id) else { return };
        if let Ok((network_key, ack)) = self.cloister.handle_invite_payload(&invite_key, &invite_payload) {
            let (_, network_id_hex) = wire::network_id_and_hash(network_key.as_bytes());
            self.events.publish(Event::NetworkJoined(network_id_hex));
            if let Ok(bytes) = serde_json::to_vec(&ack) {
                let deadline = Instant::now() + self.config.connection_timeout;
                let _ = self.channel_service.send(&bytes, from, CH_INVITE_FINAL_ACK, deadline).await;
            }
        }
    }

    fn handle_invite_final_ack(self: Arc<Self>, _from: PeerId, payload: Vec<u8>) {
        let Ok(ack) = serde_json::from_slice::<InviteFinalAck>(&payload) else { return };
        if let Some(pending) = self.pending_invite_shares.lock().remove(&ack.request_id) {
            let result = if ack.ok { Ok(()) } else { Err(Error::CloisterRejected("invite final ack reported failure".into())) };
            let _ = pending.reply.send(result);
        }
    }

    /// Asks `coordinator` to schedule a punch with `target` (spec.md §4.8 step 1).
    /// Fire-and-forget: the send chosen by the Endpoint Manager already goes through
    /// `coordinator` as a relay, so a dropped request just means the path stays relayed
    /// until some later send triggers another attempt.
    async fn request_hole_punch(self: Arc<Self>, target: PeerId, coordinator: PeerId) {
        if self.holepunch.lock().in_cooldown(target, Instant::now()) {
            return;
        }
        if self.punch_attempts.lock().contains_key(&target) {
            return;
        }
        let request = HolePunchRequestWire { target_peer_id_hex: target.to_hex() };
        let Ok(bytes) = serde_json::to_vec(&request) else { return };
        let deadline = Instant::now() + self.config.connection_timeout;
        let _ = self.channel_service.send(&bytes, coordinator, CH_HOLEPUNCH_REQUEST, deadline).await;
    }

    /// Coordinator side of spec.md §4.8 step 1-2: refuses either peer it has no known
    /// endpoint for, otherwise forwards the same signed `PunchSchedule` to both ends.
    async fn handle_holepunch_request(self: Arc<Self>, from: PeerId, payload: Vec<u8>) {
        if !self.config.can_coordinate_hole_punch {
            return;
        }
        let Ok(req) = serde_json::from_slice::<HolePunchRequestWire>(&payload) else { return };
        let Some(target) = PeerId::from_hex(&req.target_peer_id_hex) else { return };

        let Some(initiator_endpoint) = self.peer_store.get_endpoints(from).await.into_iter().next() else { return };
        let Some(target_endpoint) = self.peer_store.get_endpoints(target).await.into_iter().next() else { return };

        let schedule = HolePunchScheduleWire {
            initiator_peer_id_hex: from.to_hex(),
            target_peer_id_hex: target.to_hex(),
            coordinator_peer_id_hex: self.identity.peer_id().to_hex(),
            t0_millis: now_millis() + HOLEPUNCH_SCHEDULE_DELTA.as_millis() as u64,
            initiator_endpoint: initiator_endpoint.as_str().to_string(),
            target_endpoint: target_endpoint.as_str().to_string(),
        };
        let Ok(bytes) = serde_json::to_vec(&schedule) else { return };
        let deadline = Instant::now() + self.config.connection_timeout;
        let _ = self.channel_service.send(&bytes, from, CH_HOLEPUNCH_SCHEDULE, deadline).await;
        let _ = self.channel_service.send(&bytes, target, CH_HOLEPUNCH_SCHEDULE, deadline).await;
    }

    /// Received by both the initiator and the target (spec.md §4.8 step 2-3): schedules
    /// a `probeCount`-burst of raw probes toward the other end's observed endpoint at
    /// `t0`, then fails the attempt with a timeout if no probe from the other side ever
    /// arrives back.
    async fn handle_holepunch_schedule(self: Arc<Self>, _from: PeerId, payload: Vec<u8>) {
        let Ok(schedule) = serde_json::from_slice::<HolePunchScheduleWire>(&payload) else { return };
        let Some(initiator) = PeerId::from_hex(&schedule.initiator_peer_id_hex) else { return };
        let Some(target) = PeerId::from_hex(&schedule.target_peer_id_hex) else { return };
        let Some(coordinator) = PeerId::from_hex(&schedule.coordinator_peer_id_hex) else { return };
        let us = self.identity.peer_id();

        let (other, other_endpoint_str) = if us == initiator {
            (target, &schedule.target_endpoint)
        } else if us == target {
            (initiator, &schedule.initiator_endpoint)
        } else {
            return;
        };
        let Some(other_endpoint) = Endpoint::parse(other_endpoint_str) else { return };
        let Some(other_addr) = other_endpoint.socket_addr() else { return };

        if self.punch_attempts.lock().contains_key(&other) {
            return;
        }
        let attempt = {
            let mut engine = self.holepunch.lock();
            match engine.start_attempt(other, coordinator, Instant::now()) {
                Ok(a) => a,
                Err(_) => return,
            }
        };
        let (probe_count, probe_interval) = self.holepunch.lock().probe_plan();
        self.punch_attempts.lock().insert(other, (attempt, Instant::now()));
        self.events.publish(Event::HolePunchStarted(other));

        let delay = Duration::from_millis(schedule.t0_millis.saturating_sub(now_millis()));
        let probes_total = probe_interval.saturating_mul(probe_count as u32);
        let remaining_timeout = self.config.hole_punch_timeout.saturating_sub(probes_total);

        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            for _ in 0..probe_count {
                this.send_holepunch_probe(other, other_addr).await;
                tokio::time::sleep(probe_interval).await;
            }

            tokio::time::sleep(remaining_timeout).await;
            if let Some((mut attempt, _)) = this.punch_attempts.lock().remove(&other) {
                this.holepunch.lock().record_timeout(&mut attempt);
                this.events.publish(Event::HolePunchFailed(other, "timed out".to_string()));
            }
        });
    }

    /// Sends one minimal authenticated probe straight to `addr`, bypassing both the
    /// Endpoint Manager's path selection and the Channel Service's escalation ladder:
    /// the whole point of a probe burst is to hit the other side's observed endpoint
    /// directly, before any path through it has been confirmed to work.
    async fn send_holepunch_probe(&self, to: PeerId, addr: SocketAddr) {
        let probe = HolePunchProbeWire { nonce: omerta_crypto::random::next_u64_secure() };
        let Ok(payload) = serde_json::to_vec(&probe) else { return };
        let message_id = omerta_crypto::random::next_u64_secure().to_le_bytes();
        let fields = PacketFields {
            from_peer_id: self.identity.peer_id(),
            to_peer_id: Some(to),
            channel: CH_HOLEPUNCH_PROBE,
            hop_count: 0,
            timestamp_ms: now_millis(),
            message_id: &message_id,
            sender_public_key: self.identity.verifying_key().to_bytes(),
            payload: &payload,
        };
        let signature = codec::sign_fields(&self.identity, &self.network_hash, &fields);
        let raw = codec::encode(&self.header_key, &self.payload_key, &self.network_hash, &fields, &signature);
        let _ = self.socket.send_to(&raw, addr).await;
    }

    /// First probe to arrive back wins (spec.md §4.8 step 4); `rtt` is measured from
    /// the attempt's scheduled start rather than a true echo round trip, since probes
    /// are a one-way burst, not request/response.
    async fn handle_holepunch_probe(self: Arc<Self>, from: PeerId, payload: Vec<u8>) {
        if serde_json::from_slice::<HolePunchProbeWire>(&payload).is_err() {
            return;
        }
        let Some((mut attempt, started_at)) = self.punch_attempts.lock().remove(&from) else { return };
        let Some(endpoint) = self.peer_store.get_endpoints(from).await.into_iter().next() else { return };
        let rtt = started_at.elapsed();
        self.holepunch.lock().record_success(&mut attempt, endpoint.clone(), rtt);
        self.events.publish(Event::HolePunchSucceeded(from, endpoint.clone()));
        self.events.publish(Event::DirectConnectionEstablished(from, endpoint));
    }

    async fn punch_trigger_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<(PeerId, PeerId)>) {
        while let Some((target, coordinator)) = rx.recv().await {
            let this = self.clone();
            tokio::spawn(async move { this.request_hole_punch(target, coordinator).await });
        }
    }

    /// Starts background work: NAT classification, the dispatcher's receive loop, and
    /// the periodic keepalive/gossip/cache-cleanup cycles.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }

        if !self.config.stun_servers.is_empty() {
            if let Ok(local_addr) = self.socket.local_addr() {
                let nat = crate::nat_detector::classify(&self.socket, &self.config.stun_servers, local_addr, self.config.connection_timeout, &self.log).await;
                *self.local_nat_type.lock() = nat;
                self.events.publish(Event::NatDetected(nat));
            }
        }

        let mut handles = Vec::new();

        let dispatcher = self.dispatcher.clone();
        handles.push(tokio::spawn(async move { dispatcher.run().await }));

        let this = self.clone();
        handles.push(tokio::spawn(async move { this.keepalive_loop().await }));

        let this = self.clone();
        handles.push(tokio::spawn(async move { this.gossip_announce_loop().await }));

        let this = self.clone();
        handles.push(tokio::spawn(async move { this.cache_cleanup_loop().await }));

        if let Some(rx) = self.punch_trigger_rx.lock().take() {
            let this = self.clone();
            handles.push(tokio::spawn(async move { this.punch_trigger_loop(rx).await }));
        }

        *self.background.lock() = handles;
        self.events.publish(Event::Started);
        Ok(())
    }

    async fn keepalive_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.keepalive_interval);
        loop {
            ticker.tick().await;
            let now = Instant::now();
            let targets = self.keepalive.lock().select_cycle(KEEPALIVE_CYCLE_MAX_PEERS, now);
            for peer in targets {
                let this = self.clone();
                tokio::spawn(async move {
                    if this.ping(peer, true, Duration::from_secs(5)).await.is_err() {
                        this.keepalive.lock().record_missed_ping(peer);
                    }
                });
            }
        }
    }

    /// Builds and fans out one Announce per tick under `gossip_byte_budget` (spec.md
    /// §4.6): recipients are ranked by [`channel_priority`] rather than fanned out to
    /// flatly, reusing each peer's `reliability`/`last_contact` as the activity/recency
    /// inputs that formula expects, and the walk stops once the per-tick byte budget
    /// would be exceeded instead of capping at a fixed peer count.
    async fn gossip_announce_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.freshness_query_interval);
        let half_life = Duration::from_secs(60);
        loop {
            ticker.tick().await;
            let nat_type = *self.local_nat_type.lock();
            let peers = self.peer_store.all_peers().await;
            let endpoints: Vec<String> = peers
                .iter()
                .flat_map(|r| r.endpoints.iter())
                .filter(|e| e.authenticated && !e.is_relay)
                .map(|e| e.endpoint.as_str().to_string())
                .take(4)
                .collect();
            let known_peers_hex: Vec<String> = peers.iter().map(|r| r.peer_id.to_hex()).take(KNOWN_PEERS_SAMPLE_SIZE).collect();
            let wire = GossipAnnounceWire {
                peer_id_hex: self.identity.peer_id().to_hex(),
                nat_type: nat_type_to_u8(nat_type),
                endpoints,
                can_relay: self.config.can_relay,
                can_coordinate_hole_punch: self.config.can_coordinate_hole_punch,
                known_peers_hex,
            };
            let Ok(bytes) = serde_json::to_vec(&wire) else { continue };

            let now = Instant::now();
            let mut ranked: Vec<(f64, PeerId)> = peers
                .iter()
                .map(|r| {
                    let age = now.saturating_duration_since(r.last_contact);
                    let is_active_locally = r.endpoints.iter().any(|e| e.authenticated && e.received_within(self.config.recent_contact_max_age, now));
                    (channel_priority(is_active_locally, age, half_life, r.reliability as u64), r.peer_id)
                })
                .collect();
            ranked.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

            let per_message_bytes = bytes.len().max(1);
            let mut budget = self.config.gossip_byte_budget;
            for (_, peer_id) in ranked {
                if budget < per_message_bytes {
                    break;
                }
                budget -= per_message_bytes;
                let this = self.clone();
                let bytes = bytes.clone();
                tokio::spawn(async move {
                    let deadline = Instant::now() + Duration::from_secs(2);
                    let _ = this.channel_service.send(&bytes, peer_id, CH_GOSSIP_ANNOUNCE, deadline).await;
                });
            }
        }
    }

    async fn cache_cleanup_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.cache_cleanup_interval);
        loop {
            ticker.tick().await;
            let now = Instant::now();
            self.peer_store.evict_stale(self.config.peer_cache_ttl).await;
            self.cloister.expire_stale(now);
            self.dispatcher.evict_idle_relays().await;
            self.dispatcher.evict_idle_delivery_workers(self.config.tunnel_idle_timeout).await;
        }
    }

    /// Stops background work and persists identity plus the peer snapshot to disk.
    pub async fn stop(self: &Arc<Self>) -> Result<()> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Err(Error::NotStarted);
        }
        for handle in self.background.lock().drain(..) {
            handle.abort();
        }
        self.persist().await?;
        self.events.publish(Event::Stopped);
        Ok(())
    }

    async fn persist(&self) -> Result<()> {
        let peers = self.peer_store.all_peers().await;
        let state = PersistedNetworkState {
            network_id_hex: self.network_id_hex.clone(),
            identity_secret_hex: hex::encode(self.identity.secret_bytes()),
            peers: persistence::peer_records_to_persisted(&peers),
            membership_note: None,
        };
        persistence::save(&self.config.storage_directory, &state).await
    }

    pub fn on_channel<F>(&self, name: &str, handler: F) -> Result<()>
    where
        F: Fn(PeerId, Vec<u8>) + Send + Sync + 'static,
    {
        if crate::dispatcher::is_reserved_channel(name) {
            return Err(Error::InvalidChannelName(format!("{name} is reserved")));
        }
        self.channel_service.on_channel(name, handler)
    }

    pub fn off_channel(&self, name: &str) {
        self.channel_service.off_channel(name);
    }

    pub async fn send(&self, payload: &[u8], to: PeerId, channel: &str, deadline: Instant) -> Result<()> {
        if crate::dispatcher::is_reserved_channel(channel) {
            return Err(Error::InvalidChannelName(format!("{channel} is reserved")));
        }
        self.channel_service.send(payload, to, channel, deadline).await
    }

    /// Pings `peer` and waits up to `timeout` for a pong, learning its observed view of
    /// our endpoint and a small sample of peers it knows about along the way.
    pub async fn ping(self: &Arc<Self>, peer: PeerId, lightweight: bool, timeout: Duration) -> Result<PingResult> {
        let nonce = omerta_crypto::random::next_u64_secure();
        let (tx, rx) = oneshot::channel();
        self.pending_pings.lock().insert((peer, nonce), tx);
        self.keepalive.lock().track(peer, Instant::now());

        let wire = PingWire { nonce, lightweight };
        let payload = serde_json::to_vec(&wire).map_err(|_| Error::SendFailed)?;
        let sent_at = Instant::now();
        let send_result = self.channel_service.send(&payload, peer, CH_PING, sent_at + timeout).await;
        if send_result.is_err() {
            self.pending_pings.lock().remove(&(peer, nonce));
            return send_result;
        }

        let outcome = tokio::time::timeout(timeout, rx).await;
        self.pending_pings.lock().remove(&(peer, nonce));
        let pong = outcome.map_err(|_| Error::Timeout)?.map_err(|_| Error::Timeout)?;

        Ok(PingResult {
            rtt: sent_at.elapsed(),
            your_observed_endpoint: pong.observed_endpoint.and_then(|s| Endpoint::parse(&s)),
            learned_peers: pong.known_peers_sample.iter().filter_map(|h| PeerId::from_hex(h)).collect(),
        })
    }

    pub async fn known_peers(&self) -> Vec<PeerId> {
        self.peer_store.all_peers().await.into_iter().map(|r| r.peer_id).collect()
    }

    pub async fn known_peers_with_info(&self) -> Vec<PeerRecord> {
        self.peer_store.all_peers().await
    }

    pub fn events(&self) -> EventSubscription {
        self.events.subscribe()
    }

    /// Negotiates a brand new network key with `peer` (spec.md §4.12's first flow). The
    /// responder auto-accepts; this only resolves once its `CloisterResponse` arrives or
    /// `timeout` elapses.
    pub async fn negotiate_cloister(&self, peer: PeerId, network_name: String, timeout: Duration) -> Result<CloisterResult> {
        let request = self.cloister.negotiate_new_network_key(network_name);
        let (tx, rx) = oneshot::channel();
        self.pending_negotiations.lock().insert(request.request_id, PendingCloisterNegotiate { peer, reply: tx });

        let bytes = serde_json::to_vec(&request).map_err(|_| Error::SendFailed)?;
        let deadline = Instant::now() + timeout;
        if let Err(e) = self.channel_service.send(&bytes, peer, CH_CLOISTER_NEGOTIATE, deadline).await {
            self.pending_negotiations.lock().remove(&request.request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            _ => {
                self.pending_negotiations.lock().remove(&request.request_id);
                Err(Error::Timeout)
            }
        }
    }

    /// Shares this Mesh's own network key with `peer` over a fresh invite exchange
    /// (spec.md §4.12's second flow).
    pub async fn share_invite(&self, peer: PeerId, timeout: Duration) -> Result<()> {
        let request = self.cloister.start_invite_share();
        let (tx, rx) = oneshot::channel();
        self.pending_invite_shares.lock().insert(request.request_id, PendingInviteShare { reply: tx });

        let bytes = serde_json::to_vec(&request).map_err(|_| Error::SendFailed)?;
        let deadline = Instant::now() + timeout;
        if let Err(e) = self.channel_service.send(&bytes, peer, CH_INVITE_KEY_EXCHANGE_REQUEST, deadline).await {
            self.pending_invite_shares.lock().remove(&request.request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            _ => {
                self.pending_invite_shares.lock().remove(&request.request_id);
                Err(Error::Timeout)
            }
        }
    }
}

/// How a network key was supplied to [`Node::join_network`].
pub enum NetworkSecret {
    Key([u8; 32]),
    InviteLink(String),
}

const INVITE_LINK_PREFIX: &str = "omerta://invite/";

impl NetworkSecret {
    fn resolve(self) -> Result<[u8; 32]> {
        match self {
            NetworkSecret::Key(k) => Ok(k),
            NetworkSecret::InviteLink(link) => {
                let hex_part = link.strip_prefix(INVITE_LINK_PREFIX).ok_or_else(|| Error::InvalidConfiguration("not an omerta invite link".into()))?;
                let bytes = hex::decode(hex_part).map_err(|e| Error::InvalidConfiguration(e.to_string()))?;
                bytes.try_into().map_err(|_| Error::InvalidConfiguration("invite link does not encode a 32-byte key".into()))
            }
        }
    }
}

pub fn format_invite_link(network_key: &[u8; 32]) -> String {
    format!("{INVITE_LINK_PREFIX}{}", hex::encode(network_key))
}

/// Owns every network a process has joined. Each joined network is a fully isolated
/// [`Mesh`] with its own socket, store, and dispatcher (spec.md §3).
pub struct Node {
    base_config: Config,
    networks: SyncMutex<HashMap<String, Arc<Mesh>>>,
}

impl Node {
    /// `base_config` supplies every option that is shared across networks (storage
    /// directory, bootstrap defaults, STUN servers, tunables); its `encryption_key` is
    /// overwritten per network as networks are joined.
    pub fn new(base_config: Config) -> Self {
        Self { base_config, networks: SyncMutex::new(HashMap::new()) }
    }

    pub async fn join_network(&self, secret: NetworkSecret) -> Result<String> {
        let key = secret.resolve()?;
        let mut config = self.base_config.clone();
        config.encryption_key = key;
        config.validate()?;

        let mesh = Mesh::new(config).await?;
        mesh.start().await?;
        let id = mesh.network_id_hex().to_string();
        self.networks.lock().insert(id.clone(), mesh);
        Ok(id)
    }

    pub async fn leave_network(&self, network_id: &str) -> Result<()> {
        let mesh = self.networks.lock().remove(network_id);
        match mesh {
            Some(mesh) => mesh.stop().await,
            None => Err(Error::PeerNotFound),
        }
    }

    pub fn network(&self, network_id: &str) -> Option<Arc<Mesh>> {
        self.networks.lock().get(network_id).cloned()
    }

    pub fn joined_networks(&self) -> Vec<String> {
        self.networks.lock().keys().cloned().collect()
    }
}
