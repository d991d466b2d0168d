//! Keepalive (spec.md §4.7): preserves NAT mappings with periodic lightweight pings,
//! and tracks per-peer health through a miss counter.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use omerta_crypto::PeerId;
use rand::seq::SliceRandom;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Active,
    Stale,
    Expired,
}

struct Entry {
    consecutive_misses: u32,
    health: Health,
    last_active: Instant,
}

/// Tracks keepalive health for a set of peers. Selection of which peers to ping each
/// cycle is weighted sampling favoring recently active and long-idle entries, matching
/// the two extremes spec.md calls out explicitly: peers worth keeping warm, and peers
/// at risk of going stale from neglect.
pub struct KeepaliveTracker {
    entries: HashMap<PeerId, Entry>,
    missed_threshold: u32,
    expiry_threshold: u32,
}

impl KeepaliveTracker {
    pub fn new(missed_threshold: u32, expiry_threshold: u32) -> Self {
        Self { entries: HashMap::new(), missed_threshold, expiry_threshold }
    }

    pub fn track(&mut self, peer_id: PeerId, now: Instant) {
        self.entries.entry(peer_id).or_insert(Entry { consecutive_misses: 0, health: Health::Active, last_active: now });
    }

    pub fn record_pong(&mut self, peer_id: PeerId, now: Instant) {
        if let Some(e) = self.entries.get_mut(&peer_id) {
            e.consecutive_misses = 0;
            e.health = Health::Active;
            e.last_active = now;
        }
    }

    pub fn record_missed_ping(&mut self, peer_id: PeerId) {
        if let Some(e) = self.entries.get_mut(&peer_id) {
            e.consecutive_misses += 1;
            if e.consecutive_misses >= self.expiry_threshold {
                e.health = Health::Expired;
            } else if e.consecutive_misses >= self.missed_threshold {
                e.health = Health::Stale;
            }
        }
    }

    pub fn health(&self, peer_id: PeerId) -> Option<Health> {
        self.entries.get(&peer_id).map(|e| e.health)
    }

    /// Only `Active`/`Stale` peers are send-eligible; `Expired` peers are removed from
    /// consideration until a fresh announcement (via [`reannounce`]) promotes them back.
    pub fn send_eligible(&self) -> Vec<PeerId> {
        self.entries.iter().filter(|(_, e)| e.health != Health::Expired).map(|(id, _)| *id).collect()
    }

    pub fn reannounce(&mut self, peer_id: PeerId, now: Instant) {
        self.entries.insert(peer_id, Entry { consecutive_misses: 0, health: Health::Active, last_active: now });
    }

    /// Selects up to `max_per_cycle` peers to ping this cycle. Weighting favors peers
    /// with many consecutive misses (need reinforcement) and peers whose `last_active`
    /// is old (long-idle); a small random component prevents starvation of mid-pack
    /// entries when the set is larger than the cap.
    pub fn select_cycle(&self, max_per_cycle: usize, now: Instant) -> Vec<PeerId> {
        let mut candidates: Vec<(PeerId, f64)> = self
            .entries
            .iter()
            .filter(|(_, e)| e.health != Health::Expired)
            .map(|(id, e)| {
                let idle = now.saturating_duration_since(e.last_active).as_secs_f64();
                let weight = idle + (e.consecutive_misses as f64) * 5.0 + 1.0;
                (*id, weight)
            })
            .collect();
        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
        candidates.truncate(max_per_cycle.max(1) * 2);
        candidates.shuffle(&mut rand::thread_rng());
        candidates.into_iter().take(max_per_cycle).map(|(id, _)| id).collect()
    }
}
