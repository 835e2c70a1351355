// Redis connector: async pub/sub subscriptions plus a multiplexed
// publishing connection. The `redis` crate owns the wire protocol.
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use std::time::Duration;
use tracing::debug;

use crate::broker::{Broker, BrokerError, Delivery, Publication, Result, SubscribeOptions, Subscription};

/// Connector bound to one broker address. Cheap to clone; every
/// subscribe/publication call opens its own connection so handles are
/// never shared across units.
#[derive(Debug, Clone)]
pub struct RedisBroker {
    url: String,
}

impl RedisBroker {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            url: format!("redis://{host}:{port}"),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn client(&self) -> Result<::redis::Client> {
        ::redis::Client::open(self.url.as_str())
            .map_err(|err| BrokerError::Connect(err.to_string()))
    }
}

#[async_trait]
impl Broker for RedisBroker {
    type Subscription = RedisSubscription;
    type Publication = RedisPublication;

    async fn subscribe(&self, opts: &SubscribeOptions) -> Result<RedisSubscription> {
        // redis-rs manages its own sockets and exposes no TCP keepalive
        // knobs; dead peers surface through the bounded receive timeout
        // and the reconnect loop instead.
        let _ = &opts.keepalive;
        let client = self.client()?;
        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|err| BrokerError::Connect(err.to_string()))?;
        pubsub
            .subscribe(&opts.channel)
            .await
            .map_err(|err| BrokerError::Connect(err.to_string()))?;
        debug!(channel = %opts.channel, url = %self.url, "subscribed");
        Ok(RedisSubscription {
            pubsub,
            channel: opts.channel.clone(),
        })
    }

    async fn publication(&self) -> Result<RedisPublication> {
        let client = self.client()?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| BrokerError::Connect(err.to_string()))?;
        debug!(url = %self.url, "publishing connection open");
        Ok(RedisPublication { conn })
    }

    async fn ping(&self) -> Result<()> {
        let client = self.client()?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| BrokerError::Connect(err.to_string()))?;
        let reply: String = ::redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|err| BrokerError::Connect(err.to_string()))?;
        if reply != "PONG" {
            return Err(BrokerError::Connect(format!("unexpected PING reply: {reply}")));
        }
        Ok(())
    }
}

pub struct RedisSubscription {
    pubsub: ::redis::aio::PubSub,
    channel: String,
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn next_delivery(&mut self, wait: Duration) -> Result<Option<Delivery>> {
        // `on_message` already filters subscribe confirmations, so
        // everything yielded here is a data message.
        let mut stream = self.pubsub.on_message();
        match tokio::time::timeout(wait, stream.next()).await {
            Err(_) => Ok(None),
            Ok(Some(msg)) => Ok(Some(Delivery::data(Bytes::copy_from_slice(
                msg.get_payload_bytes(),
            )))),
            Ok(None) => Err(BrokerError::ConnectionLost(
                "pub/sub stream ended".to_string(),
            )),
        }
    }

    async fn close(&mut self) {
        // The handle is being discarded either way.
        let _ = self.pubsub.unsubscribe(&self.channel).await;
    }
}

pub struct RedisPublication {
    conn: ::redis::aio::MultiplexedConnection,
}

#[async_trait]
impl Publication for RedisPublication {
    async fn publish(&mut self, channel: &str, payload: Bytes) -> Result<()> {
        // PUBLISH replies with the receiver count; it is only read to
        // detect immediate failure, never awaited for delivery.
        let _receivers: i64 = ::redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload.as_ref())
            .query_async(&mut self.conn)
            .await
            .map_err(|err| BrokerError::Publish(err.to_string()))?;
        Ok(())
    }

    async fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connector_builds_a_redis_url() {
        let broker = RedisBroker::new("localhost", 6379);
        assert_eq!(broker.url(), "redis://localhost:6379");
    }
}
