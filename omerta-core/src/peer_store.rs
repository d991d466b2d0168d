//! Peer Store, as an actor: a single task owns the peer map exclusively and serializes
//! every mutation through its command queue. Reads return owned snapshots, never
//! references into the map, so callers cannot observe a partially-applied mutation
//! (spec.md §5 / SPEC_FULL.md §6).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use omerta_crypto::PeerId;
use tokio::sync::{mpsc, oneshot};

use crate::endpoint::Endpoint;
use crate::log::Log;
use crate::peer::{EndpointSource, NatType, PeerRecord};

enum Command {
    UpsertFromAuthenticated { peer_id: PeerId, endpoint: Endpoint, source: EndpointSource, reply: oneshot::Sender<()> },
    SeedKnownEndpoint { peer_id: PeerId, endpoint: Endpoint, source: EndpointSource, reply: oneshot::Sender<()> },
    GetRankedEndpoints { peer_id: PeerId, reply: oneshot::Sender<Vec<Endpoint>> },
    GetFreshDirectEndpoint { peer_id: PeerId, max_age: Duration, reply: oneshot::Sender<Option<Endpoint>> },
    MarkSendSuccess { peer_id: PeerId, endpoint: Endpoint, rtt: Option<Duration>, reply: oneshot::Sender<()> },
    MarkSendFailure { peer_id: PeerId, endpoint: Endpoint, reply: oneshot::Sender<()> },
    NoteObservedEndpoint { peer_id: PeerId, endpoint: Endpoint, observed_by: PeerId, reply: oneshot::Sender<()> },
    SetNatType { peer_id: PeerId, nat_type: NatType, reply: oneshot::Sender<()> },
    AllPeers { reply: oneshot::Sender<Vec<PeerRecord>> },
    EvictStale { peer_cache_ttl: Duration, reply: oneshot::Sender<usize> },
}

#[derive(Clone)]
pub struct PeerStoreHandle {
    tx: mpsc::Sender<Command>,
}

impl PeerStoreHandle {
    pub async fn upsert_from_authenticated(&self, peer_id: PeerId, endpoint: Endpoint, source: EndpointSource) {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::UpsertFromAuthenticated { peer_id, endpoint, source, reply }).await;
        let _ = rx.await;
    }

    /// Records an endpoint we merely *know about* (persisted state, bootstrap config)
    /// without having exchanged a single authenticated packet with it yet. Unlike
    /// [`Self::upsert_from_authenticated`], this never sets `last_successful_receive`,
    /// so [`Self::get_fresh_direct_endpoint`] won't mistake "configured" for "contacted".
    /// The endpoint is still marked `authenticated` so it remains eligible as a
    /// last-resort candidate once every fresher path has been exhausted.
    pub async fn seed_known_endpoint(&self, peer_id: PeerId, endpoint: Endpoint, source: EndpointSource) {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::SeedKnownEndpoint { peer_id, endpoint, source, reply }).await;
        let _ = rx.await;
    }

    /// Ranked per spec.md §4.3; the caller (Endpoint Manager) is expected to use the
    /// first entry unless it wants to retry the next-best on failure.
    pub async fn get_endpoints(&self, peer_id: PeerId) -> Vec<Endpoint> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::GetRankedEndpoints { peer_id, reply }).await;
        rx.await.unwrap_or_default()
    }

    /// A direct endpoint that succeeded (send or receive) within `max_age` (spec.md
    /// §4.5 step 1). Unlike [`Self::get_endpoints`], this never returns a stale or
    /// never-contacted endpoint, so the Endpoint Manager can tell "known" apart from
    /// "known and recently working".
    pub async fn get_fresh_direct_endpoint(&self, peer_id: PeerId, max_age: Duration) -> Option<Endpoint> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::GetFreshDirectEndpoint { peer_id, max_age, reply }).await;
        rx.await.unwrap_or(None)
    }

    pub async fn mark_send_success(&self, peer_id: PeerId, endpoint: Endpoint, rtt: Option<Duration>) {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::MarkSendSuccess { peer_id, endpoint, rtt, reply }).await;
        let _ = rx.await;
    }

    pub async fn mark_send_failure(&self, peer_id: PeerId, endpoint: Endpoint) {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::MarkSendFailure { peer_id, endpoint, reply }).await;
        let _ = rx.await;
    }

    pub async fn note_observed_endpoint(&self, peer_id: PeerId, endpoint: Endpoint, observed_by: PeerId) {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::NoteObservedEndpoint { peer_id, endpoint, observed_by, reply }).await;
        let _ = rx.await;
    }

    pub async fn set_nat_type(&self, peer_id: PeerId, nat_type: NatType) {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::SetNatType { peer_id, nat_type, reply }).await;
        let _ = rx.await;
    }

    pub async fn all_peers(&self) -> Vec<PeerRecord> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::AllPeers { reply }).await;
        rx.await.unwrap_or_default()
    }

    pub async fn evict_stale(&self, peer_cache_ttl: Duration) -> usize {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::EvictStale { peer_cache_ttl, reply }).await;
        rx.await.unwrap_or(0)
    }
}

struct PeerStoreActor {
    peers: HashMap<PeerId, PeerRecord>,
    max_cached_peers: usize,
    recent_contact_max_age: Duration,
    log: Arc<Log>,
    rx: mpsc::Receiver<Command>,
}

impl PeerStoreActor {
    fn record_mut(&mut self, peer_id: PeerId, now: Instant) -> &mut PeerRecord {
        self.peers.entry(peer_id).or_insert_with(|| PeerRecord::new(peer_id, now))
    }

    /// LRU eviction by `last_contact` when over the configured cap. Called after every
    /// insert that could have grown the map.
    fn enforce_cap(&mut self) {
        while self.peers.len() > self.max_cached_peers {
            if let Some((&oldest, _)) = self.peers.iter().min_by_key(|(_, r)| r.last_contact) {
                self.peers.remove(&oldest);
            } else {
                break;
            }
        }
    }

    async fn run(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            let now = Instant::now();
            match cmd {
                Command::UpsertFromAuthenticated { peer_id, endpoint, source, reply } => {
                    let rec = self.record_mut(peer_id, now);
                    rec.touch(now);
                    let info = rec.upsert_endpoint(endpoint, source);
                    info.authenticated = true;
                    info.last_successful_receive = Some(now);
                    self.enforce_cap();
                    let _ = reply.send(());
                }
                Command::SeedKnownEndpoint { peer_id, endpoint, source, reply } => {
                    let rec = self.record_mut(peer_id, now);
                    rec.touch(now);
                    let info = rec.upsert_endpoint(endpoint, source);
                    info.authenticated = true;
                    self.enforce_cap();
                    let _ = reply.send(());
                }
                Command::GetRankedEndpoints { peer_id, reply } => {
                    let out = self
                        .peers
                        .get(&peer_id)
                        .map(|r| r.ranked_endpoints(self.recent_contact_max_age, now).into_iter().map(|e| e.endpoint.clone()).collect())
                        .unwrap_or_default();
                    let _ = reply.send(out);
                }
                Command::GetFreshDirectEndpoint { peer_id, max_age, reply } => {
                    let out = self.peers.get(&peer_id).and_then(|r| {
                        r.endpoints
                            .iter()
                            .filter(|e| e.authenticated && !e.is_relay && (e.received_within(max_age, now) || e.sent_within(max_age, now)))
                            .min_by_key(|e| e.rtt_sample.unwrap_or(Duration::from_secs(9999)))
                            .map(|e| e.endpoint.clone())
                    });
                    let _ = reply.send(out);
                }
                Command::MarkSendSuccess { peer_id, endpoint, rtt, reply } => {
                    if let Some(rec) = self.peers.get_mut(&peer_id) {
                        rec.touch(now);
                        if let Some(info) = rec.endpoint_mut(&endpoint) {
                            info.last_successful_send = Some(now);
                            info.authenticated = true;
                            if rtt.is_some() {
                                info.rtt_sample = rtt;
                            }
                        }
                    }
                    let _ = reply.send(());
                }
                Command::MarkSendFailure { peer_id, endpoint, reply } => {
                    if let Some(rec) = self.peers.get_mut(&peer_id) {
                        if let Some(info) = rec.endpoint_mut(&endpoint) {
                            info.rtt_sample = None;
                        }
                    }
                    let _ = reply.send(());
                }
                Command::NoteObservedEndpoint { peer_id, endpoint, observed_by, reply } => {
                    let rec = self.record_mut(peer_id, now);
                    let info = rec.upsert_endpoint(endpoint, EndpointSource::Observed);
                    info.observed_by = Some(observed_by);
                    self.enforce_cap();
                    let _ = reply.send(());
                }
                Command::SetNatType { peer_id, nat_type, reply } => {
                    self.record_mut(peer_id, now).nat_type = nat_type;
                    let _ = reply.send(());
                }
                Command::AllPeers { reply } => {
                    let _ = reply.send(self.peers.values().cloned().collect());
                }
                Command::EvictStale { peer_cache_ttl, reply } => {
                    let before = self.peers.len();
                    self.peers.retain(|_, r| now.saturating_duration_since(r.last_contact) <= peer_cache_ttl);
                    let evicted = before - self.peers.len();
                    if evicted > 0 {
                        crate::log_info!(self.log, "peer_store", "evicted {evicted} stale peers");
                    }
                    let _ = reply.send(evicted);
                }
            }
        }
    }
}

pub fn spawn(max_cached_peers: usize, recent_contact_max_age: Duration, log: Arc<Log>) -> PeerStoreHandle {
    let (tx, rx) = mpsc::channel(256);
    let actor = PeerStoreActor { peers: HashMap::new(), max_cached_peers, recent_contact_max_age, log, rx };
    tokio::spawn(actor.run());
    PeerStoreHandle { tx }
}
