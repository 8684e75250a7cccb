use axum::extract::ws::Utf8Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::subscribers::types::{BatchFrames, PayloadView, SlowConsumerPolicy, SubscriberId};

/// Default maximum subscribers to prevent DoS
const DEFAULT_MAX_SUBSCRIBERS: usize = 10_000;

/// Registration result
#[derive(Debug, Clone, PartialEq)]
pub enum RegistrationResult {
    /// Successfully registered
    Ok,
    /// Registry at capacity, registration rejected
    AtCapacity,
}

/// Registry settings
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub max_subscribers: usize,
    pub slow_consumer_policy: SlowConsumerPolicy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_subscribers: DEFAULT_MAX_SUBSCRIBERS,
            slow_consumer_policy: SlowConsumerPolicy::Evict,
        }
    }
}

/// Registry-side handle for a live subscriber connection
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub id: SubscriberId,
    pub remote_addr: Option<SocketAddr>,
    pub connected_at: DateTime<Utc>,
    pub view: PayloadView,
    sender: mpsc::Sender<Utf8Bytes>,
    liveness: CancellationToken,
}

/// Connection-side half of a subscriber, held by the serving task
pub struct SubscriberInbox {
    pub id: SubscriberId,
    pub frames: mpsc::Receiver<Utf8Bytes>,
    /// Cancelled when the registry drops the subscriber
    pub liveness: CancellationToken,
}

impl Subscriber {
    /// Create a subscriber with a bounded outgoing buffer
    pub fn new(
        remote_addr: Option<SocketAddr>,
        view: PayloadView,
        buffer: usize,
    ) -> (Self, SubscriberInbox) {
        let id = Uuid::new_v4();
        let (sender, frames) = mpsc::channel(buffer.max(1));
        let liveness = CancellationToken::new();

        let subscriber = Self {
            id,
            remote_addr,
            connected_at: Utc::now(),
            view,
            sender,
            liveness: liveness.clone(),
        };
        let inbox = SubscriberInbox {
            id,
            frames,
            liveness,
        };

        (subscriber, inbox)
    }
}

/// Outcome of one broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub skipped: usize,
    pub evicted: usize,
}

/// In-memory registry of live subscribers
///
/// Broadcast works on a snapshot of the map and only ever `try_send`s, so
/// it never waits on a subscriber and never holds the lock while sending.
#[derive(Clone)]
pub struct ConnectionRegistry {
    subscribers: Arc<RwLock<HashMap<SubscriberId, Subscriber>>>,
    config: RegistryConfig,
}

impl ConnectionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    /// Register a new subscriber
    pub fn register(&self, subscriber: Subscriber) -> RegistrationResult {
        let mut subscribers = self.subscribers.write();

        if subscribers.len() >= self.config.max_subscribers {
            return RegistrationResult::AtCapacity;
        }

        debug!("Registering subscriber {}", subscriber.id);
        subscribers.insert(subscriber.id, subscriber);
        RegistrationResult::Ok
    }

    /// Remove a subscriber; safe to call for unknown or already-removed ids
    pub fn unregister(&self, id: &SubscriberId) -> bool {
        let removed = self.subscribers.write().remove(id);
        match removed {
            Some(subscriber) => {
                subscriber.liveness.cancel();
                true
            }
            None => false,
        }
    }

    /// Change the payload view for a subscriber
    pub fn set_view(&self, id: &SubscriberId, view: PayloadView) -> bool {
        if let Some(subscriber) = self.subscribers.write().get_mut(id) {
            subscriber.view = view;
            true
        } else {
            false
        }
    }

    pub fn is_registered(&self, id: &SubscriberId) -> bool {
        self.subscribers.read().contains_key(id)
    }

    /// Get the count of live subscribers
    pub fn connection_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Deliver a batch to every subscriber registered at call time
    pub fn broadcast(&self, frames: &BatchFrames) -> BroadcastReport {
        let snapshot: Vec<Subscriber> = self.subscribers.read().values().cloned().collect();
        let mut report = BroadcastReport::default();

        for subscriber in snapshot {
            match subscriber.sender.try_send(frames.for_view(subscriber.view)) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => match self.config.slow_consumer_policy {
                    SlowConsumerPolicy::Evict => {
                        if self.unregister(&subscriber.id) {
                            warn!("Evicted slow subscriber {}", subscriber.id);
                            report.evicted += 1;
                        }
                    }
                    SlowConsumerPolicy::Skip => {
                        debug!("Skipped batch for slow subscriber {}", subscriber.id);
                        report.skipped += 1;
                    }
                },
                Err(TrySendError::Closed(_)) => {
                    if self.unregister(&subscriber.id) {
                        info!("Removed disconnected subscriber {}", subscriber.id);
                        report.evicted += 1;
                    }
                }
            }
        }

        report
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn frames(label: &str) -> BatchFrames {
        BatchFrames::new(format!("full-{}", label), format!("summary-{}", label))
    }

    fn subscriber(registry: &ConnectionRegistry, buffer: usize) -> SubscriberInbox {
        let (subscriber, inbox) = Subscriber::new(None, PayloadView::Full, buffer);
        assert_eq!(registry.register(subscriber), RegistrationResult::Ok);
        inbox
    }

    #[test]
    fn test_register_and_unregister() {
        let registry = ConnectionRegistry::default();
        let inbox = subscriber(&registry, 4);

        assert!(registry.is_registered(&inbox.id));
        assert_eq!(registry.connection_count(), 1);

        assert!(registry.unregister(&inbox.id));
        assert!(!registry.is_registered(&inbox.id));
        assert!(inbox.liveness.is_cancelled());

        // Idempotent
        assert!(!registry.unregister(&inbox.id));
        assert!(!registry.unregister(&Uuid::new_v4()));
    }

    #[test]
    fn test_capacity_limit() {
        let registry = ConnectionRegistry::new(RegistryConfig {
            max_subscribers: 1,
            ..Default::default()
        });
        let _first = subscriber(&registry, 4);

        let (second, _inbox) = Subscriber::new(None, PayloadView::Full, 4);
        assert_eq!(registry.register(second), RegistrationResult::AtCapacity);
        assert_eq!(registry.connection_count(), 1);
    }

    #[test]
    fn test_broadcast_delivers_one_copy_each() {
        let registry = ConnectionRegistry::default();
        let mut inboxes: Vec<_> = (0..5).map(|_| subscriber(&registry, 4)).collect();

        let report = registry.broadcast(&frames("a"));
        assert_eq!(
            report,
            BroadcastReport {
                delivered: 5,
                skipped: 0,
                evicted: 0
            }
        );

        for inbox in inboxes.iter_mut() {
            assert_eq!(inbox.frames.try_recv().unwrap().as_str(), "full-a");
            assert!(inbox.frames.try_recv().is_err());
        }
    }

    #[test]
    fn test_broadcast_respects_view() {
        let registry = ConnectionRegistry::default();
        let mut inbox = subscriber(&registry, 4);

        assert!(registry.set_view(&inbox.id, PayloadView::Summary));
        registry.broadcast(&frames("b"));

        assert_eq!(inbox.frames.try_recv().unwrap().as_str(), "summary-b");
    }

    #[test]
    fn test_slow_subscriber_is_evicted_without_blocking() {
        let registry = ConnectionRegistry::default();
        let slow = subscriber(&registry, 1);
        let mut fast = subscriber(&registry, 8);

        registry.broadcast(&frames("1"));

        let started = Instant::now();
        let report = registry.broadcast(&frames("2"));
        assert!(started.elapsed() < Duration::from_millis(100));

        assert_eq!(report.delivered, 1);
        assert_eq!(report.evicted, 1);
        assert!(!registry.is_registered(&slow.id));
        assert!(slow.liveness.is_cancelled());

        assert_eq!(fast.frames.try_recv().unwrap().as_str(), "full-1");
        assert_eq!(fast.frames.try_recv().unwrap().as_str(), "full-2");
    }

    #[test]
    fn test_skip_policy_keeps_slow_subscriber() {
        let registry = ConnectionRegistry::new(RegistryConfig {
            slow_consumer_policy: SlowConsumerPolicy::Skip,
            ..Default::default()
        });
        let mut slow = subscriber(&registry, 1);

        registry.broadcast(&frames("1"));
        let report = registry.broadcast(&frames("2"));

        assert_eq!(report.skipped, 1);
        assert!(registry.is_registered(&slow.id));
        assert_eq!(slow.frames.try_recv().unwrap().as_str(), "full-1");
        assert!(slow.frames.try_recv().is_err());
    }

    #[test]
    fn test_disconnected_subscriber_is_removed() {
        let registry = ConnectionRegistry::default();
        let inbox = subscriber(&registry, 4);
        let id = inbox.id;
        drop(inbox);

        let report = registry.broadcast(&frames("c"));
        assert_eq!(report.delivered, 0);
        assert_eq!(report.evicted, 1);
        assert!(!registry.is_registered(&id));
    }

    #[test]
    fn test_batches_arrive_in_order() {
        let registry = ConnectionRegistry::default();
        let mut inbox = subscriber(&registry, 16);

        for n in 0..10 {
            registry.broadcast(&frames(&n.to_string()));
        }

        for n in 0..10 {
            assert_eq!(
                inbox.frames.try_recv().unwrap().as_str(),
                format!("full-{}", n)
            );
        }
    }

    fn sequences(inbox: &mut SubscriberInbox) -> Vec<u64> {
        let mut received = Vec::new();
        while let Ok(frame) = inbox.frames.try_recv() {
            let n = frame.as_str().strip_prefix("full-").unwrap();
            received.push(n.parse().unwrap());
        }
        received
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_registration_churn_during_broadcast() {
        const BATCHES: u64 = 500;

        let registry = ConnectionRegistry::default();
        let mut stable: Vec<_> = (0..4).map(|_| subscriber(&registry, 1024)).collect();

        let broadcaster = {
            let registry = registry.clone();
            tokio::spawn(async move {
                for n in 0..BATCHES {
                    let report = registry.broadcast(&frames(&n.to_string()));
                    assert_eq!(report.evicted, 0);
                    tokio::task::yield_now().await;
                }
            })
        };

        let churn = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let mut inboxes = Vec::new();
                for round in 0..300 {
                    inboxes.push(subscriber(&registry, 1024));
                    if round % 3 == 0 {
                        registry.unregister(&inboxes[round / 2].id);
                    }
                    tokio::task::yield_now().await;
                }
                inboxes
            })
        };

        broadcaster.await.unwrap();
        let mut churned = churn.await.unwrap();

        for inbox in stable.iter_mut() {
            assert_eq!(sequences(inbox), (0..BATCHES).collect::<Vec<_>>());
        }

        // Joined late or left early, but never a gap, repeat or reorder
        for inbox in churned.iter_mut() {
            let received = sequences(inbox);
            assert!(
                received.windows(2).all(|w| w[1] == w[0] + 1),
                "out of order or duplicated: {:?}",
                received
            );
        }
    }
}
