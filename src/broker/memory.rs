// In-process broker used by tests and dry runs.
//
// Fanout is one tokio broadcast channel per topic. Fault injection
// hooks (failed connects, failed publishes, severed channels) let tests
// drive the reconnect and retry paths deterministically.
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::broker::{Broker, BrokerError, Delivery, Publication, Result, SubscribeOptions, Subscription};
use crate::config::KeepaliveConfig;

// Deep enough that throttled readers in short tests never lag.
const TOPIC_CAPACITY: usize = 1024;

/// Handle teardown recorded in the order it happened, so tests can
/// assert shutdown sequencing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseEvent {
    Publication,
    Subscription,
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    topics: Mutex<HashMap<String, broadcast::Sender<Bytes>>>,
    connect_failures: AtomicU32,
    publish_failures: AtomicU32,
    unreachable: AtomicBool,
    last_keepalive: Mutex<Option<KeepaliveConfig>>,
    closes: Mutex<Vec<CloseEvent>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` subscribe attempts fail with a connect error.
    pub fn fail_next_connects(&self, n: u32) {
        self.inner.connect_failures.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` publish attempts fail.
    pub fn fail_next_publishes(&self, n: u32) {
        self.inner.publish_failures.store(n, Ordering::SeqCst);
    }

    /// While set, subscribe and ping both fail.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Drops the topic, closing every live subscription on it. New
    /// subscribers and publishes land on a fresh topic.
    pub fn sever(&self, channel: &str) {
        self.inner.topics.lock().remove(channel);
    }

    /// Keepalive options seen on the most recent subscribe.
    pub fn last_keepalive(&self) -> Option<KeepaliveConfig> {
        self.inner.last_keepalive.lock().clone()
    }

    /// Every handle close so far, oldest first.
    pub fn close_events(&self) -> Vec<CloseEvent> {
        self.inner.closes.lock().clone()
    }

    fn topic_sender(&self, channel: &str) -> broadcast::Sender<Bytes> {
        self.inner
            .topics
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }

    fn take_injected_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    type Subscription = MemorySubscription;
    type Publication = MemoryPublication;

    async fn subscribe(&self, opts: &SubscribeOptions) -> Result<MemorySubscription> {
        if self.inner.unreachable.load(Ordering::SeqCst) {
            return Err(BrokerError::Connect("broker unreachable".to_string()));
        }
        if Self::take_injected_failure(&self.inner.connect_failures) {
            return Err(BrokerError::Connect("injected connect failure".to_string()));
        }
        *self.inner.last_keepalive.lock() = Some(opts.keepalive.clone());
        let rx = self.topic_sender(&opts.channel).subscribe();
        Ok(MemorySubscription {
            broker: self.clone(),
            rx,
            // Subscribe confirmation, delivered first like a real broker's
            // control-plane ack. The read loop must not count it.
            pending: Some(Delivery::control()),
        })
    }

    async fn publication(&self) -> Result<MemoryPublication> {
        if self.inner.unreachable.load(Ordering::SeqCst) {
            return Err(BrokerError::Connect("broker unreachable".to_string()));
        }
        Ok(MemoryPublication {
            broker: self.clone(),
        })
    }

    async fn ping(&self) -> Result<()> {
        if self.inner.unreachable.load(Ordering::SeqCst) {
            return Err(BrokerError::Connect("broker unreachable".to_string()));
        }
        Ok(())
    }
}

pub struct MemorySubscription {
    broker: MemoryBroker,
    rx: broadcast::Receiver<Bytes>,
    pending: Option<Delivery>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_delivery(&mut self, wait: Duration) -> Result<Option<Delivery>> {
        if let Some(delivery) = self.pending.take() {
            return Ok(Some(delivery));
        }
        match tokio::time::timeout(wait, self.rx.recv()).await {
            Err(_) => Ok(None),
            Ok(Ok(payload)) => Ok(Some(Delivery::data(payload))),
            Ok(Err(broadcast::error::RecvError::Lagged(n))) => {
                Err(BrokerError::Transient(format!("lagged by {n} messages")))
            }
            Ok(Err(broadcast::error::RecvError::Closed)) => Err(BrokerError::ConnectionLost(
                "channel closed by broker".to_string(),
            )),
        }
    }

    async fn close(&mut self) {
        self.broker.inner.closes.lock().push(CloseEvent::Subscription);
    }
}

pub struct MemoryPublication {
    broker: MemoryBroker,
}

#[async_trait]
impl Publication for MemoryPublication {
    async fn publish(&mut self, channel: &str, payload: Bytes) -> Result<()> {
        if MemoryBroker::take_injected_failure(&self.broker.inner.publish_failures) {
            return Err(BrokerError::Publish("injected publish failure".to_string()));
        }
        // Fire-and-forget: no subscribers is not a failure.
        let _ = self.broker.topic_sender(channel).send(payload);
        Ok(())
    }

    async fn close(&mut self) {
        self.broker.inner.closes.lock().push(CloseEvent::Publication);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::DeliveryKind;

    fn opts(channel: &str) -> SubscribeOptions {
        SubscribeOptions {
            channel: channel.to_string(),
            keepalive: KeepaliveConfig::default(),
        }
    }

    #[tokio::test]
    async fn subscribe_ack_comes_before_data() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe(&opts("chan")).await.expect("subscribe");
        let mut publication = broker.publication().await.expect("publication");
        publication
            .publish("chan", Bytes::from_static(b"payload"))
            .await
            .expect("publish");

        let first = sub
            .next_delivery(Duration::from_secs(1))
            .await
            .expect("recv")
            .expect("ack");
        assert_eq!(first.kind, DeliveryKind::Control);

        let second = sub
            .next_delivery(Duration::from_secs(1))
            .await
            .expect("recv")
            .expect("data");
        assert!(second.is_data());
        assert_eq!(second.payload, Bytes::from_static(b"payload"));
    }

    #[tokio::test]
    async fn quiet_wait_is_a_timeout_not_an_error() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe(&opts("chan")).await.expect("subscribe");
        // Drain the subscribe ack first.
        let _ = sub.next_delivery(Duration::from_millis(10)).await;
        let outcome = sub
            .next_delivery(Duration::from_millis(10))
            .await
            .expect("quiet");
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn severing_a_channel_closes_live_subscriptions() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe(&opts("chan")).await.expect("subscribe");
        let _ = sub.next_delivery(Duration::from_millis(10)).await;
        broker.sever("chan");
        let err = sub
            .next_delivery(Duration::from_secs(1))
            .await
            .expect_err("severed");
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn injected_connect_failures_are_consumed_in_order() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(2);
        assert!(broker.subscribe(&opts("chan")).await.is_err());
        assert!(broker.subscribe(&opts("chan")).await.is_err());
        assert!(broker.subscribe(&opts("chan")).await.is_ok());
    }

    #[tokio::test]
    async fn keepalive_options_reach_the_broker() {
        let broker = MemoryBroker::new();
        let keepalive = KeepaliveConfig {
            idle: Duration::from_secs(10),
            probe_interval: Duration::from_secs(2),
            probe_count: 5,
        };
        let opts = SubscribeOptions {
            channel: "chan".to_string(),
            keepalive: keepalive.clone(),
        };
        broker.subscribe(&opts).await.expect("subscribe");
        assert_eq!(broker.last_keepalive(), Some(keepalive));
    }

    #[tokio::test]
    async fn handle_closes_are_recorded_in_order() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe(&opts("chan")).await.expect("subscribe");
        let mut publication = broker.publication().await.expect("publication");
        assert!(broker.close_events().is_empty());
        publication.close().await;
        sub.close().await;
        assert_eq!(
            broker.close_events(),
            vec![CloseEvent::Publication, CloseEvent::Subscription]
        );
    }

    #[tokio::test]
    async fn unreachable_broker_fails_ping_and_subscribe() {
        let broker = MemoryBroker::new();
        broker.set_unreachable(true);
        assert!(broker.ping().await.is_err());
        assert!(broker.subscribe(&opts("chan")).await.is_err());
        broker.set_unreachable(false);
        assert!(broker.ping().await.is_ok());
    }
}
