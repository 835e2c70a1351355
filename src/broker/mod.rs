// Broker-client collaborator contract consumed by the harness.
//
// The harness never speaks the broker's wire protocol itself; it drives
// these traits, with a `redis`-backed connector for real runs and an
// in-process broker for tests.
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

use crate::config::KeepaliveConfig;

pub mod memory;
pub mod redis;

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("transient receive error: {0}")]
    Transient(String),
    #[error("publish failed: {0}")]
    Publish(String),
}

impl BrokerError {
    /// Errors that require replacing the connection handle wholesale.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, BrokerError::ConnectionLost(_))
    }
}

/// What a subscription hands back: a payload plus a type tag. Only data
/// deliveries count toward statistics; control-plane confirmations
/// (e.g. subscribe acks) are ignored by the read loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub kind: DeliveryKind,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryKind {
    Data,
    Control,
}

impl Delivery {
    pub fn data(payload: Bytes) -> Self {
        Self {
            kind: DeliveryKind::Data,
            payload,
        }
    }

    pub fn control() -> Self {
        Self {
            kind: DeliveryKind::Control,
            payload: Bytes::new(),
        }
    }

    pub fn is_data(&self) -> bool {
        self.kind == DeliveryKind::Data
    }
}

#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub channel: String,
    pub keepalive: KeepaliveConfig,
}

#[async_trait]
pub trait Broker: Clone + Send + Sync + 'static {
    type Subscription: Subscription;
    type Publication: Publication;

    /// Single connect-and-subscribe attempt; retry is the caller's job.
    async fn subscribe(&self, opts: &SubscribeOptions) -> Result<Self::Subscription>;

    /// Open a publishing connection.
    async fn publication(&self) -> Result<Self::Publication>;

    /// Pre-flight reachability check.
    async fn ping(&self) -> Result<()>;
}

#[async_trait]
pub trait Subscription: Send + 'static {
    /// Bounded wait for one delivery. `Ok(None)` means the wait elapsed
    /// quietly, which is not an error.
    async fn next_delivery(&mut self, wait: Duration) -> Result<Option<Delivery>>;

    /// Best-effort teardown; never surfaces an error.
    async fn close(&mut self);
}

#[async_trait]
pub trait Publication: Send + 'static {
    /// Fire-and-forget publish; an error only reports immediate failure.
    async fn publish(&mut self, channel: &str, payload: Bytes) -> Result<()>;

    /// Best-effort teardown; never surfaces an error.
    async fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connection_lost_forces_a_new_handle() {
        assert!(BrokerError::ConnectionLost("reset".into()).is_disconnect());
        assert!(!BrokerError::Connect("refused".into()).is_disconnect());
        assert!(!BrokerError::Transient("hiccup".into()).is_disconnect());
        assert!(!BrokerError::Publish("refused".into()).is_disconnect());
    }

    #[test]
    fn control_deliveries_carry_no_data() {
        let control = Delivery::control();
        assert!(!control.is_data());
        assert!(control.payload.is_empty());
        assert!(Delivery::data(Bytes::from_static(b"xx")).is_data());
    }
}
