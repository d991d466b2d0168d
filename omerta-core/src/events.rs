//! Event Publisher (spec.md §4.13): independent per-subscriber queues, slow consumers
//! never back-pressure the dispatcher. `tokio::sync::broadcast` already has exactly
//! this shape — a bounded ring buffer per receiver that drops the oldest entry (and
//! reports `Lagged` to that one subscriber) rather than blocking the sender.

use std::time::Duration;

use omerta_crypto::PeerId;
use tokio::sync::broadcast;

use crate::endpoint::Endpoint;

#[derive(Debug, Clone)]
pub enum Event {
    Started,
    Stopped,
    NatDetected(crate::peer::NatType),
    PeerDiscovered(PeerId),
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    PeerUnreachable(PeerId),
    RelayConnected(PeerId),
    RelayDisconnected(PeerId),
    HolePunchStarted(PeerId),
    HolePunchSucceeded(PeerId, Endpoint),
    HolePunchFailed(PeerId, String),
    DirectConnectionEstablished(PeerId, Endpoint),
    MessageSendFailed(PeerId, String),
    NetworkJoined(String),
    NetworkLeft(String),
    Warning(String),
    Error(String),
}

#[derive(Clone)]
pub struct EventPublisher {
    tx: broadcast::Sender<Event>,
}

pub struct EventSubscription {
    rx: broadcast::Receiver<Event>,
}

impl EventPublisher {
    pub fn new(capacity_per_subscriber: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity_per_subscriber.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: Event) {
        // No subscribers is not an error: events are fire-and-forget.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription { rx: self.tx.subscribe() }
    }
}

impl EventSubscription {
    /// Returns the next event, skipping forward past any the subscriber lagged behind
    /// on (mirroring "drops oldest if a subscriber's queue exceeds its bound" rather
    /// than surfacing the lag as a user-visible error).
    pub async fn next(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub async fn next_within(&mut self, deadline: Duration) -> Option<Event> {
        tokio::time::timeout(deadline, self.next()).await.ok().flatten()
    }
}
