//! Hole-Punch Engine (spec.md §4.8): coordinator-assisted simultaneous UDP send.

use std::time::{Duration, Instant};

use omerta_crypto::PeerId;

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct PunchSchedule {
    pub initiator: PeerId,
    pub target: PeerId,
    pub t0: Instant,
    pub initiator_endpoint: Endpoint,
    pub target_endpoint: Endpoint,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded { endpoint: Endpoint, rtt: Duration },
    Failed { both_symmetric: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptState {
    Scheduled,
    Probing,
    Done,
}

pub struct Attempt {
    pub id: u64,
    pub target: PeerId,
    pub coordinator: PeerId,
    pub deadline: Instant,
    state: AttemptState,
}

/// Tracks in-flight hole-punch attempts and the per-peer cooldown imposed after a
/// `BothSymmetric` failure (spec.md §4.8: "no further attempts are made for
/// `holePunchCooldown`").
pub struct HolePunchEngine {
    probe_count: usize,
    probe_interval: Duration,
    timeout: Duration,
    cooldown: Duration,
    next_id: u64,
    cooldowns: std::collections::HashMap<PeerId, Instant>,
}

impl HolePunchEngine {
    pub fn new(probe_count: usize, probe_interval: Duration, timeout: Duration, cooldown: Duration) -> Self {
        Self { probe_count, probe_interval, timeout, cooldown, next_id: 0, cooldowns: std::collections::HashMap::new() }
    }

    pub fn in_cooldown(&self, target: PeerId, now: Instant) -> bool {
        self.cooldowns.get(&target).map(|until| now < *until).unwrap_or(false)
    }

    pub fn start_attempt(&mut self, target: PeerId, coordinator: PeerId, now: Instant) -> Result<Attempt> {
        if self.in_cooldown(target, now) {
            return Err(Error::HolePunchImpossible);
        }
        self.next_id += 1;
        Ok(Attempt { id: self.next_id, target, coordinator, deadline: now + self.timeout, state: AttemptState::Scheduled })
    }

    pub fn probe_plan(&self) -> (usize, Duration) {
        (self.probe_count, self.probe_interval)
    }

    /// Call when both ends report a symmetric NAT: starts the cooldown window and
    /// returns the failure outcome the Endpoint Manager should act on.
    pub fn record_both_symmetric(&mut self, target: PeerId, now: Instant) -> Outcome {
        self.cooldowns.insert(target, now + self.cooldown);
        Outcome::Failed { both_symmetric: true }
    }

    pub fn record_timeout(&mut self, attempt: &mut Attempt) -> Outcome {
        attempt.state = AttemptState::Done;
        Outcome::Failed { both_symmetric: false }
    }

    pub fn record_success(&mut self, attempt: &mut Attempt, endpoint: Endpoint, rtt: Duration) -> Outcome {
        attempt.state = AttemptState::Done;
        Outcome::Succeeded { endpoint, rtt }
    }
}
