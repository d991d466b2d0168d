//! Channel Service (spec.md §4.11): handler registry plus the `send` escalation
//! ladder. Handlers run on the worker pool, never on the dispatcher task (spec.md §9).

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use omerta_crypto::PeerId;

use crate::endpoint_manager::{EndpointManager, Path};
use crate::error::{Error, Result};
use crate::log::Log;

pub type Handler = dyn Fn(PeerId, Vec<u8>) + Send + Sync + 'static;

/// Abstracts "actually put these bytes on the wire via this path" so the escalation
/// ladder's backoff/retry logic can be tested without a real socket. The dispatcher's
/// owning node wires a real implementation that encodes through `crate::codec` and
/// writes to the UDP socket.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_via(&self, to: PeerId, path: &Path, channel: &str, payload: &[u8]) -> Result<()>;
}

struct BackoffPolicy {
    initial: Duration,
    multiplier: u32,
    cap: Duration,
}

impl BackoffPolicy {
    fn quick() -> Self {
        Self { initial: Duration::from_millis(100), multiplier: 2, cap: Duration::from_secs(5) }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let scaled = self.initial.saturating_mul(self.multiplier.saturating_pow(attempt));
        scaled.min(self.cap)
    }
}

pub struct ChannelService {
    handlers: DashMap<String, Arc<Handler>>,
    endpoint_manager: Arc<EndpointManager>,
    transport: Arc<dyn Transport>,
    backoff: BackoffPolicy,
    log: Arc<Log>,
}

impl ChannelService {
    pub fn new(endpoint_manager: Arc<EndpointManager>, transport: Arc<dyn Transport>, log: Arc<Log>) -> Self {
        Self { handlers: DashMap::new(), endpoint_manager, transport, backoff: BackoffPolicy::quick(), log }
    }

    pub fn on_channel<F>(&self, name: &str, handler: F) -> Result<()>
    where
        F: Fn(PeerId, Vec<u8>) + Send + Sync + 'static,
    {
        crate::config::Config::validate_channel_name(name)?;
        self.handlers.insert(name.to_string(), Arc::new(handler));
        Ok(())
    }

    pub fn off_channel(&self, name: &str) {
        self.handlers.remove(name);
    }

    /// Routes an inbound payload on `channel` to its registered handler. Invoked from
    /// the dispatcher's per-(fromPeerId, channel) delivery worker (never from the
    /// receive loop itself), so this runs the handler inline: that worker already is
    /// the "never blocks the receive loop" isolation, and calling the handler inline
    /// here is what lets same-(peer, channel) deliveries preserve order.
    pub fn dispatch_inbound(&self, from: PeerId, channel: &str, payload: Vec<u8>) {
        if let Some(handler) = self.handlers.get(channel).map(|h| h.clone()) {
            handler(from, payload);
        } else {
            crate::log_trace!(self.log, "channel", "no handler registered for channel {channel}");
        }
    }

    /// Escalation ladder: direct -> directory lookup -> hole-punch -> relay, with
    /// exponential backoff between attempts. Returns `PeerUnreachable` only once every
    /// path the Endpoint Manager can offer has been tried and the deadline is spent.
    pub async fn send(&self, payload: &[u8], to: PeerId, channel: &str, deadline: Instant) -> Result<()> {
        crate::config::Config::validate_channel_name(channel)?;

        let mut attempt: u32 = 0;
        loop {
            let Some(path) = self.endpoint_manager.choose_path(to).await else {
                return Err(Error::PeerUnreachable);
            };

            match self.transport.send_via(to, &path, channel, payload).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    crate::log_trace!(self.log, "channel", "send attempt {attempt} on {path:?} failed: {e}");
                }
            }

            attempt += 1;
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::PeerUnreachable);
            }
            let wait = self.backoff.delay_for(attempt).min(deadline.saturating_duration_since(now));
            if wait.is_zero() {
                return Err(Error::PeerUnreachable);
            }
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gossip;
    use crate::peer_store;
    use omerta_crypto::Identity;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn log() -> Arc<Log> {
        Log::stderr(crate::log::Level::Error)
    }

    struct AlwaysFails;
    #[async_trait]
    impl Transport for AlwaysFails {
        async fn send_via(&self, _to: PeerId, _path: &Path, _channel: &str, _payload: &[u8]) -> Result<()> {
            Err(Error::SendFailed)
        }
    }

    struct SucceedsOnAttempt {
        succeed_at: usize,
        calls: AtomicUsize,
    }
    #[async_trait]
    impl Transport for SucceedsOnAttempt {
        async fn send_via(&self, _to: PeerId, _path: &Path, _channel: &str, _payload: &[u8]) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n + 1 >= self.succeed_at {
                Ok(())
            } else {
                Err(Error::SendFailed)
            }
        }
    }

    async fn endpoint_manager_with_relay() -> Arc<EndpointManager> {
        let peer_store = peer_store::spawn(100, Duration::from_secs(60), log());
        let directory = gossip::spawn_directory(log());
        let relay = Identity::generate().peer_id();
        directory.announce_relay_capacity(relay, Duration::from_millis(5)).await;
        Arc::new(EndpointManager { peer_store, directory, force_relay_only: false, recent_contact_max_age: Duration::from_secs(60) })
    }

    #[tokio::test]
    async fn rejects_invalid_channel_name_before_attempting_send() {
        let mgr = endpoint_manager_with_relay().await;
        let svc = ChannelService::new(mgr, Arc::new(AlwaysFails), log());
        let target = Identity::generate().peer_id();
        let res = svc.send(b"x", target, "bad channel", Instant::now() + Duration::from_millis(50)).await;
        assert!(matches!(res, Err(Error::InvalidChannelName(_))));
    }

    #[tokio::test]
    async fn surfaces_peer_unreachable_after_deadline_exhausted() {
        let mgr = endpoint_manager_with_relay().await;
        let svc = ChannelService::new(mgr, Arc::new(AlwaysFails), log());
        let target = Identity::generate().peer_id();
        let res = svc.send(b"x", target, "app", Instant::now() + Duration::from_millis(50)).await;
        assert!(matches!(res, Err(Error::PeerUnreachable)));
    }

    #[tokio::test]
    async fn succeeds_after_escalating_through_retries() {
        let mgr = endpoint_manager_with_relay().await;
        let transport = Arc::new(SucceedsOnAttempt { succeed_at: 3, calls: AtomicUsize::new(0) });
        let svc = ChannelService::new(mgr, transport, log());
        let target = Identity::generate().peer_id();
        let res = svc.send(b"x", target, "app", Instant::now() + Duration::from_secs(5)).await;
        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn inbound_dispatch_invokes_registered_handler() {
        let mgr = endpoint_manager_with_relay().await;
        let svc = ChannelService::new(mgr, Arc::new(AlwaysFails), log());
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = std::sync::Mutex::new(Some(tx));
        svc.on_channel("app", move |_from, payload| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(payload);
            }
        })
        .unwrap();
        let from = Identity::generate().peer_id();
        svc.dispatch_inbound(from, "app", vec![1, 2, 3]);
        let received = tokio::time::timeout(Duration::from_secs(1), rx).await.unwrap().unwrap();
        assert_eq!(received, vec![1, 2, 3]);
    }
}
