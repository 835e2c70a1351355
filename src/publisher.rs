// Fixed-cadence load publisher.
//
// Publishes filler payloads of uniformly random size every 100ms. A
// publish error never terminates the loop; it is logged, followed by a
// pause, and the publishing handle is replaced. Only an explicit stop
// request ends the loop.
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::time::Duration;
use tracing::{error, info};

use crate::broker::{Broker, Publication};
use crate::config::PublisherConfig;
use crate::stop::{self, StopReceiver};

// Pause between publishes to bound the rate.
const PUBLISH_INTERVAL: Duration = Duration::from_millis(100);
// Pause after a publish or connect error before retrying.
const ERROR_PAUSE: Duration = Duration::from_secs(1);

/// Counters owned exclusively by the publish loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublisherStats {
    pub messages_sent: u64,
    pub total_bytes_sent: u64,
}

impl PublisherStats {
    /// Average payload size; defined as 0 when nothing was sent.
    pub fn average_message_size(&self) -> f64 {
        if self.messages_sent == 0 {
            0.0
        } else {
            self.total_bytes_sent as f64 / self.messages_sent as f64
        }
    }
}

pub struct LoadPublisher<B: Broker> {
    broker: B,
    config: PublisherConfig,
    stats: PublisherStats,
    rng: StdRng,
    stop: StopReceiver,
}

impl<B: Broker> LoadPublisher<B> {
    pub fn new(broker: B, config: PublisherConfig, stop: StopReceiver) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            broker,
            config,
            stats: PublisherStats::default(),
            rng,
            stop,
        }
    }

    /// Runs until a stop request; returns the final statistics.
    pub async fn run(mut self) -> PublisherStats {
        info!(channel = %self.config.channel, "publisher started");
        let Some(mut publication) = self.acquire().await else {
            info!("publisher stopped before connecting");
            return self.stats;
        };
        while !stop::is_stopped(&self.stop) {
            let size = self.config.message_size.sample(&mut self.rng) as usize;
            // Filler content; only the size matters to the test.
            let payload = Bytes::from(vec![b'x'; size]);
            match publication.publish(&self.config.channel, payload).await {
                Ok(()) => {
                    self.stats.messages_sent += 1;
                    self.stats.total_bytes_sent += size as u64;
                    if stop::sleep_or_stop(&mut self.stop, PUBLISH_INTERVAL).await {
                        break;
                    }
                }
                Err(err) => {
                    error!(error = %err, "publish failed");
                    if stop::sleep_or_stop(&mut self.stop, ERROR_PAUSE).await {
                        break;
                    }
                    // The old handle may be dead; replace it wholesale.
                    if let Ok(fresh) = self.broker.publication().await {
                        publication = fresh;
                    }
                }
            }
        }
        publication.close().await;
        info!(
            messages = self.stats.messages_sent,
            bytes = self.stats.total_bytes_sent,
            "publisher stopped"
        );
        self.stats
    }

    async fn acquire(&mut self) -> Option<B::Publication> {
        loop {
            if stop::is_stopped(&self.stop) {
                return None;
            }
            match self.broker.publication().await {
                Ok(publication) => return Some(publication),
                Err(err) => {
                    error!(error = %err, "opening publishing connection failed");
                    if stop::sleep_or_stop(&mut self.stop, ERROR_PAUSE).await {
                        return None;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::config::ByteRange;
    use crate::stop;

    fn test_config() -> PublisherConfig {
        PublisherConfig {
            channel: "test_channel".to_string(),
            message_size: ByteRange::new(100, 1000),
            rng_seed: Some(7),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_at_a_bounded_cadence() {
        let broker = MemoryBroker::new();
        let (stop_tx, stop_rx) = stop::channel();
        let publisher = LoadPublisher::new(broker, test_config(), stop_rx);
        let handle = tokio::spawn(publisher.run());

        tokio::time::sleep(Duration::from_secs(2)).await;
        stop_tx.send(true).expect("stop");
        let stats = handle.await.expect("join");

        // One publish per 100ms over 2s.
        assert!(stats.messages_sent >= 15);
        assert!(stats.messages_sent <= 21);
        assert!(stats.total_bytes_sent >= stats.messages_sent * 100);
        assert!(stats.total_bytes_sent <= stats.messages_sent * 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn a_failed_publish_pauses_then_retries() {
        let broker = MemoryBroker::new();
        broker.fail_next_publishes(1);
        let (stop_tx, stop_rx) = stop::channel();
        let publisher = LoadPublisher::new(broker, test_config(), stop_rx);
        let handle = tokio::spawn(publisher.run());

        tokio::time::sleep(Duration::from_secs(3)).await;
        stop_tx.send(true).expect("stop");
        let stats = handle.await.expect("join");

        // The failed attempt is not counted, and the loop kept going.
        assert!(stats.messages_sent > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_the_cadence_sleep_is_prompt() {
        let broker = MemoryBroker::new();
        let (stop_tx, stop_rx) = stop::channel();
        let publisher = LoadPublisher::new(broker, test_config(), stop_rx);
        let handle = tokio::spawn(publisher.run());

        tokio::time::sleep(Duration::from_millis(150)).await;
        stop_tx.send(true).expect("stop");
        stop_tx.send(true).expect("second stop is a no-op");
        let stats = handle.await.expect("join");
        assert!(stats.messages_sent >= 1);
    }

    #[test]
    fn average_size_is_zero_when_nothing_was_sent() {
        let stats = PublisherStats::default();
        assert_eq!(stats.average_message_size(), 0.0);
        let stats = PublisherStats {
            messages_sent: 4,
            total_bytes_sent: 1000,
        };
        assert_eq!(stats.average_message_size(), 250.0);
    }
}
