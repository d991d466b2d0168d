//! Endpoint Manager: picks a routing path for a target peer per the five-step policy
//! in spec.md §4.5, and owns the "observed endpoint" learning that feeds the Peer
//! Store back from every authenticated inbound packet.

use std::sync::Arc;
use std::time::Duration;

use omerta_crypto::PeerId;

use crate::endpoint::Endpoint;
use crate::gossip::DirectoryHandle;
use crate::peer_store::PeerStoreHandle;

/// The chosen path for an outbound message, per spec.md §9's preference for a sum type
/// over a nullable "relay peer id" field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Path {
    Direct(Endpoint),
    HolePunchThen(PeerId),
    Relay(PeerId),
}

pub struct EndpointManager {
    pub peer_store: PeerStoreHandle,
    pub directory: DirectoryHandle,
    pub force_relay_only: bool,
    pub recent_contact_max_age: Duration,
}

impl EndpointManager {
    /// Implements spec.md §4.5 steps 1-5 in order. Step 2 ("consult the directory, and
    /// if a fresher endpoint is learned, attempt it with an authenticated ping") is
    /// represented here as a directory lookup feeding a direct candidate; the actual
    /// ping and its on-success recording happen in the Channel Service's escalation
    /// ladder, which is the only component allowed to perform network I/O on this
    /// decision's behalf.
    ///
    /// Step 1 only fires for an endpoint that actually succeeded within
    /// `recent_contact_max_age`; a direct endpoint that is merely *known* (bootstrap
    /// config, a stale prior session) but never contacted falls through to directory,
    /// hole-punch, and relay first. It is still tried as a last resort below those,
    /// since otherwise a peer seeded only from bootstrap config with no gossip or relay
    /// path available yet could never make first contact at all.
    pub async fn choose_path(&self, target: PeerId) -> Option<Path> {
        if self.force_relay_only {
            return self.directory.best_relay(target).await.map(Path::Relay);
        }

        if let Some(direct) = self.peer_store.get_fresh_direct_endpoint(target, self.recent_contact_max_age).await {
            return Some(Path::Direct(direct));
        }

        if let Some(learned) = self.directory.who_has_recent(target, self.recent_contact_max_age).await {
            return Some(Path::Direct(learned));
        }

        if self.directory.hole_punch_viable(target).await {
            if let Some(coordinator) = self.directory.best_coordinator(target).await {
                return Some(Path::HolePunchThen(coordinator));
            }
        }

        if let Some(relay) = self.directory.best_relay(target).await {
            return Some(Path::Relay(relay));
        }

        self.peer_store.get_endpoints(target).await.into_iter().next().map(Path::Direct)
    }

    /// Records an endpoint learned passively: every authenticated inbound packet's
    /// source address is a candidate "your endpoint" guess for its sender.
    pub async fn note_observed(&self, sender: PeerId, observed_from: Endpoint, observer: PeerId) {
        self.peer_store.note_observed_endpoint(sender, observed_from, observer).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gossip;
    use crate::log::Log;
    use crate::peer::EndpointSource;
    use crate::peer_store;
    use omerta_crypto::Identity;

    fn log() -> Arc<Log> {
        Log::stderr(crate::log::Level::Error)
    }

    #[tokio::test]
    async fn prefers_known_direct_endpoint_over_everything_else() {
        let peer_store = peer_store::spawn(100, Duration::from_secs(60), log());
        let directory = gossip::spawn_directory(log());
        let target = Identity::generate().peer_id();
        let ep = Endpoint::parse("127.0.0.1:5000").unwrap();
        peer_store.upsert_from_authenticated(target, ep.clone(), EndpointSource::Bootstrap).await;

        let mgr = EndpointManager { peer_store, directory, force_relay_only: false, recent_contact_max_age: Duration::from_secs(60) };
        assert_eq!(mgr.choose_path(target).await, Some(Path::Direct(ep)));
    }

    #[tokio::test]
    async fn a_stale_direct_endpoint_loses_to_a_fresher_directory_lookup() {
        let peer_store = peer_store::spawn(100, Duration::from_secs(60), log());
        let directory = gossip::spawn_directory(log());
        let target = Identity::generate().peer_id();

        // Recorded in the peer store (e.g. a stale prior session), but never actually
        // contacted: no `last_successful_send`/`receive`, so step 1's freshness gate
        // rejects it and the directory-learned endpoint below wins instead.
        peer_store.seed_known_endpoint(target, Endpoint::parse("127.0.0.1:5000").unwrap(), EndpointSource::Bootstrap).await;

        let fresh_ep = Endpoint::parse("127.0.0.1:6000").unwrap();
        directory
            .ingest(gossip::Advertisement {
                peer_id: target,
                nat_type: crate::peer::NatType::Unknown,
                endpoints: vec![fresh_ep.clone()],
                can_relay: false,
                can_coordinate_hole_punch: false,
                rtt_from_us: None,
                received_at: std::time::Instant::now(),
                known_peer_ids: Vec::new(),
            })
            .await;

        let mgr = EndpointManager { peer_store, directory, force_relay_only: false, recent_contact_max_age: Duration::from_secs(60) };
        assert_eq!(mgr.choose_path(target).await, Some(Path::Direct(fresh_ep)));
    }

    #[tokio::test]
    async fn force_relay_only_skips_direct_lookup() {
        let peer_store = peer_store::spawn(100, Duration::from_secs(60), log());
        let directory = gossip::spawn_directory(log());
        let target = Identity::generate().peer_id();
        let ep = Endpoint::parse("127.0.0.1:5000").unwrap();
        peer_store.upsert_from_authenticated(target, ep, EndpointSource::Bootstrap).await;

        let relay = Identity::generate().peer_id();
        directory.announce_relay_capacity(relay, Duration::from_millis(5)).await;

        let mgr = EndpointManager { peer_store, directory, force_relay_only: true, recent_contact_max_age: Duration::from_secs(60) };
        assert_eq!(mgr.choose_path(target).await, Some(Path::Relay(relay)));
    }

    #[tokio::test]
    async fn falls_back_to_relay_when_nothing_else_available() {
        let peer_store = peer_store::spawn(100, Duration::from_secs(60), log());
        let directory = gossip::spawn_directory(log());
        let target = Identity::generate().peer_id();
        let relay = Identity::generate().peer_id();
        directory.announce_relay_capacity(relay, Duration::from_millis(5)).await;

        let mgr = EndpointManager { peer_store, directory, force_relay_only: false, recent_contact_max_age: Duration::from_secs(60) };
        assert_eq!(mgr.choose_path(target).await, Some(Path::Relay(relay)));
    }
}
