//! Relay Engine (spec.md §4.9): server and client roles. A relay forwards opaque,
//! still-encrypted datagrams between two peers; it never decrypts the payload, only
//! the header fields it already needs to route (the same subset the Dispatcher reads
//! for any forwarded packet).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use omerta_crypto::PeerId;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy)]
pub struct SessionId(pub u64);

struct ServerSession {
    initiator: PeerId,
    target: PeerId,
    last_use: Instant,
    bytes_forwarded: u64,
}

/// Relay server role: accepts sessions up to `max_relay_sessions`, forwards opaque
/// bytes, tears down sessions idle past `tunnel_idle_timeout`.
pub struct RelayServer {
    sessions: HashMap<u64, ServerSession>,
    next_id: u64,
    max_sessions: usize,
    idle_timeout: Duration,
}

impl RelayServer {
    pub fn new(max_sessions: usize, idle_timeout: Duration) -> Self {
        Self { sessions: HashMap::new(), next_id: 0, max_sessions, idle_timeout }
    }

    pub fn accept(&mut self, initiator: PeerId, target: PeerId, now: Instant) -> Result<SessionId> {
        if self.sessions.len() >= self.max_sessions {
            return Err(Error::RelayAtCapacity);
        }
        self.next_id += 1;
        let id = self.next_id;
        self.sessions.insert(id, ServerSession { initiator, target, last_use: now, bytes_forwarded: 0 });
        Ok(SessionId(id))
    }

    /// Forwards `len` opaque bytes for `session`, updating its usage counters. This is
    /// the only operation the server performs on session data — it is never given, and
    /// never needs, the decrypted payload.
    pub fn forward(&mut self, session: SessionId, len: u64, now: Instant) -> Result<()> {
        let s = self.sessions.get_mut(&session.0).ok_or(Error::PeerNotFound)?;
        s.last_use = now;
        s.bytes_forwarded += len;
        Ok(())
    }

    pub fn bytes_forwarded(&self, session: SessionId) -> Option<u64> {
        self.sessions.get(&session.0).map(|s| s.bytes_forwarded)
    }

    pub fn evict_idle(&mut self, now: Instant) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, s| now.saturating_duration_since(s.last_use) <= self.idle_timeout);
        before - self.sessions.len()
    }

    pub fn peers_for(&self, session: SessionId) -> Option<(PeerId, PeerId)> {
        self.sessions.get(&session.0).map(|s| (s.initiator, s.target))
    }
}

struct ClientSession {
    relay: PeerId,
    last_use: Instant,
}

/// Relay client role: tracks which relay a session uses and when it last sent an
/// ingress keepalive, so the caller knows when to refresh it.
pub struct RelayClient {
    sessions: HashMap<u64, ClientSession>,
    next_id: u64,
    ingress_keepalive_interval: Duration,
}

impl RelayClient {
    pub fn new(ingress_keepalive_interval: Duration) -> Self {
        Self { sessions: HashMap::new(), next_id: 0, ingress_keepalive_interval }
    }

    pub fn open(&mut self, relay: PeerId, now: Instant) -> SessionId {
        self.next_id += 1;
        let id = self.next_id;
        self.sessions.insert(id, ClientSession { relay, last_use: now });
        SessionId(id)
    }

    pub fn needs_keepalive(&self, session: SessionId, now: Instant) -> bool {
        self.sessions.get(&session.0).map(|s| now.saturating_duration_since(s.last_use) >= self.ingress_keepalive_interval).unwrap_or(false)
    }

    pub fn record_activity(&mut self, session: SessionId, now: Instant) {
        if let Some(s) = self.sessions.get_mut(&session.0) {
            s.last_use = now;
        }
    }

    pub fn relay_for(&self, session: SessionId) -> Option<PeerId> {
        self.sessions.get(&session.0).map(|s| s.relay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use omerta_crypto::Identity;

    #[test]
    fn server_refuses_beyond_capacity() {
        let mut server = RelayServer::new(1, Duration::from_secs(60));
        let a = Identity::generate().peer_id();
        let b = Identity::generate().peer_id();
        let now = Instant::now();
        assert!(server.accept(a, b, now).is_ok());
        assert!(matches!(server.accept(a, b, now), Err(Error::RelayAtCapacity)));
    }

    #[test]
    fn forwarding_never_needs_plaintext_and_tracks_byte_count() {
        let mut server = RelayServer::new(10, Duration::from_secs(60));
        let a = Identity::generate().peer_id();
        let b = Identity::generate().peer_id();
        let now = Instant::now();
        let session = server.accept(a, b, now).unwrap();
        server.forward(session, 128, now).unwrap();
        server.forward(session, 64, now).unwrap();
        assert_eq!(server.bytes_forwarded(session), Some(192));
    }

    #[test]
    fn idle_sessions_are_evicted() {
        let mut server = RelayServer::new(10, Duration::from_millis(10));
        let a = Identity::generate().peer_id();
        let b = Identity::generate().peer_id();
        let now = Instant::now();
        server.accept(a, b, now).unwrap();
        let evicted = server.evict_idle(now + Duration::from_secs(1));
        assert_eq!(evicted, 1);
    }

    #[test]
    fn client_requests_keepalive_after_interval_elapses() {
        let mut client = RelayClient::new(Duration::from_millis(10));
        let relay = Identity::generate().peer_id();
        let now = Instant::now();
        let session = client.open(relay, now);
        assert!(!client.needs_keepalive(session, now));
        assert!(client.needs_keepalive(session, now + Duration::from_secs(1)));
        client.record_activity(session, now + Duration::from_secs(1));
        assert!(!client.needs_keepalive(session, now + Duration::from_secs(1)));
    }
}
