//! Gossip & Directory (spec.md §4.6). Two responsibilities live in one actor since they
//! share the same underlying per-peer advertisement table: Announce (periodic signed
//! peer advertisements, priority-weighted propagation) and Directory (answering and
//! issuing `whoHasRecent` queries, rate-limited per (target, requester)).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use omerta_crypto::PeerId;
use tokio::sync::{mpsc, oneshot};

use crate::endpoint::Endpoint;
use crate::log::Log;
use crate::peer::NatType;

/// One channel's contribution to an announcement's propagation priority.
pub fn channel_priority(is_active_locally: bool, age: Duration, half_life: Duration, local_activity_count: u64) -> f64 {
    let active_multiplier = if is_active_locally { 1000.0 } else { 1.0 };
    let decay = 0.5f64.powf(age.as_secs_f64() / half_life.as_secs_f64().max(1.0));
    let activity_boost = 1.0 + (local_activity_count.max(1) as f64).log2();
    active_multiplier * decay * activity_boost
}

#[derive(Debug, Clone)]
pub struct Advertisement {
    pub peer_id: PeerId,
    pub nat_type: NatType,
    pub endpoints: Vec<Endpoint>,
    pub can_relay: bool,
    pub can_coordinate_hole_punch: bool,
    pub rtt_from_us: Option<Duration>,
    pub received_at: Instant,
    /// A bounded sample of peers the announcer itself currently knows (from its own
    /// peer store), carried so `best_coordinator`/`best_relay` can prefer a candidate
    /// that actually has a path to the target, instead of picking purely on RTT.
    pub known_peer_ids: Vec<PeerId>,
}

enum Command {
    Ingest { ad: Advertisement, reply: oneshot::Sender<()> },
    WhoHasRecent { target: PeerId, max_age: Duration, requester: PeerId, reply: oneshot::Sender<Option<Endpoint>> },
    HolePunchViable { target: PeerId, reply: oneshot::Sender<bool> },
    BestCoordinator { target: PeerId, reply: oneshot::Sender<Option<PeerId>> },
    BestRelay { target: PeerId, reply: oneshot::Sender<Option<PeerId>> },
    AnnounceRelayCapacity { peer_id: PeerId, rtt: Duration, reply: oneshot::Sender<()> },
}

#[derive(Clone)]
pub struct DirectoryHandle {
    tx: mpsc::Sender<Command>,
}

impl DirectoryHandle {
    pub async fn ingest(&self, ad: Advertisement) {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::Ingest { ad, reply }).await;
        let _ = rx.await;
    }

    /// Rate-limited to one query per `freshness_query_interval` per (target,
    /// requester) pair; the limiter lives inside the actor so concurrent callers
    /// observe a consistent view.
    pub async fn who_has_recent(&self, target: PeerId, max_age: Duration) -> Option<Endpoint> {
        self.who_has_recent_from(target, max_age, target).await
    }

    pub async fn who_has_recent_from(&self, target: PeerId, max_age: Duration, requester: PeerId) -> Option<Endpoint> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::WhoHasRecent { target, max_age, requester, reply }).await;
        rx.await.ok().flatten()
    }

    pub async fn hole_punch_viable(&self, target: PeerId) -> bool {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::HolePunchViable { target, reply }).await;
        rx.await.unwrap_or(false)
    }

    pub async fn best_coordinator(&self, target: PeerId) -> Option<PeerId> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::BestCoordinator { target, reply }).await;
        rx.await.ok().flatten()
    }

    pub async fn best_relay(&self, target: PeerId) -> Option<PeerId> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::BestRelay { target, reply }).await;
        rx.await.ok().flatten()
    }

    pub async fn announce_relay_capacity(&self, peer_id: PeerId, rtt: Duration) {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::AnnounceRelayCapacity { peer_id, rtt, reply }).await;
        let _ = rx.await;
    }
}

struct DirectoryActor {
    ads: HashMap<PeerId, Advertisement>,
    last_query: HashMap<(PeerId, PeerId), Instant>,
    freshness_query_interval: Duration,
    log: Arc<Log>,
    rx: mpsc::Receiver<Command>,
}

impl DirectoryActor {
    async fn run(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            let now = Instant::now();
            match cmd {
                Command::Ingest { ad, reply } => {
                    self.ads.insert(ad.peer_id, ad);
                    let _ = reply.send(());
                }
                Command::WhoHasRecent { target, max_age, requester, reply } => {
                    let key = (target, requester);
                    let rate_limited = self
                        .last_query
                        .get(&key)
                        .map(|t| now.saturating_duration_since(*t) < self.freshness_query_interval)
                        .unwrap_or(false);
                    if rate_limited {
                        crate::log_trace!(self.log, "gossip", "whoHasRecent rate limited for this (target,requester) pair");
                        let _ = reply.send(None);
                        continue;
                    }
                    self.last_query.insert(key, now);
                    let answer = self.ads.get(&target).filter(|ad| now.saturating_duration_since(ad.received_at) <= max_age).and_then(|ad| ad.endpoints.first().cloned());
                    let _ = reply.send(answer);
                }
                Command::HolePunchViable { target, reply } => {
                    let viable = self.ads.get(&target).map(|ad| ad.nat_type != NatType::Symmetric).unwrap_or(true);
                    let _ = reply.send(viable);
                }
                Command::BestCoordinator { target, reply } => {
                    // spec.md §4.8 step 1: "any peer with direct paths to both ends".
                    // A coordinator that has never heard of the target can't possibly
                    // forward a `PunchSchedule` to it, so this filter is never skipped.
                    let coordinator = self
                        .ads
                        .values()
                        .filter(|ad| ad.can_coordinate_hole_punch && ad.known_peer_ids.contains(&target))
                        .min_by_key(|ad| ad.rtt_from_us.unwrap_or(Duration::from_secs(9999)))
                        .map(|ad| ad.peer_id);
                    let _ = reply.send(coordinator);
                }
                Command::BestRelay { target, reply } => {
                    // Prefer a relay that's already reachable to the target; if gossip
                    // hasn't taught us that about anyone yet, fall back to ranking the
                    // whole capable set by RTT rather than declaring no relay at all
                    // (this is the step-4 fallback-of-last-resort, not a hard protocol
                    // requirement like the coordinator's).
                    let reachable = self
                        .ads
                        .values()
                        .filter(|ad| ad.can_relay && ad.known_peer_ids.contains(&target))
                        .min_by_key(|ad| ad.rtt_from_us.unwrap_or(Duration::from_secs(9999)))
                        .map(|ad| ad.peer_id);
                    let relay = reachable.or_else(|| {
                        self.ads
                            .values()
                            .filter(|ad| ad.can_relay)
                            .min_by_key(|ad| ad.rtt_from_us.unwrap_or(Duration::from_secs(9999)))
                            .map(|ad| ad.peer_id)
                    });
                    let _ = reply.send(relay);
                }
                Command::AnnounceRelayCapacity { peer_id, rtt, reply } => {
                    self.ads.insert(
                        peer_id,
                        Advertisement {
                            peer_id,
                            nat_type: NatType::Unknown,
                            endpoints: Vec::new(),
                            can_relay: true,
                            can_coordinate_hole_punch: false,
                            rtt_from_us: Some(rtt),
                            received_at: now,
                            known_peer_ids: Vec::new(),
                        },
                    );
                    let _ = reply.send(());
                }
            }
        }
    }
}

pub fn spawn_directory(log: Arc<Log>) -> DirectoryHandle {
    spawn_directory_with_interval(log, Duration::from_secs(30))
}

pub fn spawn_directory_with_interval(log: Arc<Log>, freshness_query_interval: Duration) -> DirectoryHandle {
    let (tx, rx) = mpsc::channel(256);
    let actor = DirectoryActor { ads: HashMap::new(), last_query: HashMap::new(), freshness_query_interval, log, rx };
    tokio::spawn(actor.run());
    DirectoryHandle { tx }
}
