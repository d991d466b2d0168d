use std::time::{Duration, Instant};

use omerta_crypto::PeerId;

use crate::endpoint::Endpoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatType {
    Open,
    FullCone,
    RestrictedCone,
    PortRestricted,
    Symmetric,
    Unknown,
}

impl NatType {
    /// Whether a direct hole-punch between two peers of these NAT types is worth
    /// attempting at all (spec.md §4.5 step 3: "neither side symmetric, or one side
    /// open").
    pub fn hole_punch_viable(a: NatType, b: NatType) -> bool {
        if a == NatType::Open || b == NatType::Open {
            return true;
        }
        a != NatType::Symmetric && b != NatType::Symmetric
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointSource {
    Bootstrap,
    Gossip,
    LearnedFromPeer,
    Observed,
}

/// Per-endpoint metadata tracked for a single peer. `last_successful_send`/`receive`
/// are `Instant`s (monotonic) rather than wall-clock timestamps: freshness windows are
/// about elapsed local time, not synchronized clocks.
#[derive(Debug, Clone)]
pub struct EndpointInfo {
    pub endpoint: Endpoint,
    pub is_relay: bool,
    pub observed_by: Option<PeerId>,
    pub last_successful_send: Option<Instant>,
    pub last_successful_receive: Option<Instant>,
    pub rtt_sample: Option<Duration>,
    pub source: EndpointSource,
    /// An endpoint is not send-eligible until authenticated at least once, either by
    /// a signed announcement or a round-trip ping (spec.md §3 invariant).
    pub authenticated: bool,
}

impl EndpointInfo {
    pub fn new(endpoint: Endpoint, source: EndpointSource) -> Self {
        Self {
            endpoint,
            is_relay: false,
            observed_by: None,
            last_successful_send: None,
            last_successful_receive: None,
            rtt_sample: None,
            source,
            authenticated: false,
        }
    }

    pub fn received_within(&self, window: Duration, now: Instant) -> bool {
        self.last_successful_receive.map(|t| now.saturating_duration_since(t) <= window).unwrap_or(false)
    }

    pub fn sent_within(&self, window: Duration, now: Instant) -> bool {
        self.last_successful_send.map(|t| now.saturating_duration_since(t) <= window).unwrap_or(false)
    }
}

/// Everything the Peer Store knows about one peer.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub endpoints: Vec<EndpointInfo>,
    pub nat_type: NatType,
    pub reliability: u32,
    pub last_contact: Instant,
}

impl PeerRecord {
    pub fn new(peer_id: PeerId, now: Instant) -> Self {
        Self { peer_id, endpoints: Vec::new(), nat_type: NatType::Unknown, reliability: 0, last_contact: now }
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_contact = now;
        self.reliability = self.reliability.saturating_add(1);
    }

    pub fn endpoint_mut(&mut self, endpoint: &Endpoint) -> Option<&mut EndpointInfo> {
        self.endpoints.iter_mut().find(|e| &e.endpoint == endpoint)
    }

    pub fn upsert_endpoint(&mut self, endpoint: Endpoint, source: EndpointSource) -> &mut EndpointInfo {
        if let Some(idx) = self.endpoints.iter().position(|e| e.endpoint == endpoint) {
            return &mut self.endpoints[idx];
        }
        self.endpoints.push(EndpointInfo::new(endpoint, source));
        self.endpoints.last_mut().unwrap()
    }

    /// Ranks this peer's endpoints per the four-tier policy in spec.md §4.3. Relay
    /// endpoints are ranked by the caller passing `relay_rtt` in through `is_relay`;
    /// this function only orders what's already recorded.
    pub fn ranked_endpoints(&self, recent_contact_max_age: Duration, now: Instant) -> Vec<&EndpointInfo> {
        let mut tiered: Vec<(u8, Duration, &EndpointInfo)> = self
            .endpoints
            .iter()
            .filter(|e| e.authenticated)
            .map(|e| {
                let tier = if !e.is_relay && e.received_within(recent_contact_max_age, now) {
                    0
                } else if !e.is_relay && e.sent_within(recent_contact_max_age, now) {
                    1
                } else if !e.is_relay && matches!(e.source, EndpointSource::LearnedFromPeer | EndpointSource::Observed) {
                    2
                } else {
                    3
                };
                (tier, e.rtt_sample.unwrap_or(Duration::from_secs(9999)), e)
            })
            .collect();
        tiered.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        tiered.into_iter().map(|(_, _, e)| e).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use omerta_crypto::Identity;

    fn peer_id() -> PeerId {
        Identity::generate().peer_id()
    }

    #[test]
    fn hole_punch_viability() {
        assert!(NatType::hole_punch_viable(NatType::Open, NatType::Symmetric));
        assert!(NatType::hole_punch_viable(NatType::FullCone, NatType::RestrictedCone));
        assert!(!NatType::hole_punch_viable(NatType::Symmetric, NatType::Symmetric));
    }

    #[test]
    fn ranking_prefers_recent_direct_receive_over_everything() {
        let now = Instant::now();
        let mut rec = PeerRecord::new(peer_id(), now);

        let relay_ep = Endpoint::parse("10.0.0.9:4000").unwrap();
        let direct_ep = Endpoint::parse("10.0.0.1:4000").unwrap();

        let relay = rec.upsert_endpoint(relay_ep.clone(), EndpointSource::Gossip);
        relay.is_relay = true;
        relay.authenticated = true;
        relay.last_successful_receive = Some(now);

        let direct = rec.upsert_endpoint(direct_ep.clone(), EndpointSource::Bootstrap);
        direct.authenticated = true;
        direct.last_successful_receive = Some(now);

        let ranked = rec.ranked_endpoints(Duration::from_secs(60), now);
        assert_eq!(ranked[0].endpoint, direct_ep);
        assert_eq!(ranked[1].endpoint, relay_ep);
    }

    #[test]
    fn unauthenticated_endpoints_are_never_ranked() {
        let now = Instant::now();
        let mut rec = PeerRecord::new(peer_id(), now);
        rec.upsert_endpoint(Endpoint::parse("10.0.0.1:4000").unwrap(), EndpointSource::Gossip);
        assert!(rec.ranked_endpoints(Duration::from_secs(60), now).is_empty());
    }
}
