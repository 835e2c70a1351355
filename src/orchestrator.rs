// Test orchestration: spawns the subscriber pool and the publisher,
// runs them for the configured duration, then shuts down in order and
// collects the final report.
//
// The publisher is stopped and joined before the subscribers so no new
// load is generated while readers drain. Each unit owns its statistics
// and hands them back by value when its task is joined; nothing here is
// shared or locked.
use anyhow::Context;
use std::fmt;
use std::future::Future;
use tracing::info;

use crate::broker::Broker;
use crate::config::{ConfigError, HarnessConfig};
use crate::publisher::{LoadPublisher, PublisherStats};
use crate::stop;
use crate::subscriber::{ConnectionStats, SlowSubscriber};

pub struct Orchestrator<B: Broker> {
    broker: B,
    config: HarnessConfig,
}

impl<B: Broker> fmt::Debug for Orchestrator<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<B: Broker> Orchestrator<B> {
    /// Validates the configuration before anything connects.
    pub fn new(broker: B, config: HarnessConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { broker, config })
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Runs the full test. Ends after the configured duration or as soon
    /// as `shutdown` resolves, whichever comes first.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> anyhow::Result<TestReport> {
        let (sub_stop_tx, sub_stop_rx) = stop::channel();
        let (pub_stop_tx, pub_stop_rx) = stop::channel();

        info!(
            connections = self.config.connections,
            channel = %self.config.channel,
            duration_secs = self.config.duration.as_secs(),
            "starting test"
        );

        let mut subscriber_handles = Vec::with_capacity(self.config.connections);
        for id in 1..=self.config.connections {
            let subscriber = SlowSubscriber::new(
                id,
                self.broker.clone(),
                self.config.subscriber_config(id),
                sub_stop_rx.clone(),
            );
            subscriber_handles.push(tokio::spawn(subscriber.run()));
        }

        let publisher =
            LoadPublisher::new(self.broker.clone(), self.config.publisher_config(), pub_stop_rx);
        let publisher_handle = tokio::spawn(publisher.run());

        tokio::pin!(shutdown);
        tokio::select! {
            _ = tokio::time::sleep(self.config.duration) => {
                info!("test duration elapsed, shutting down");
            }
            _ = &mut shutdown => {
                info!("shutdown requested, stopping test early");
            }
        }

        // Stop the load source first so subscribers wind down quietly.
        let _ = pub_stop_tx.send(true);
        let publisher_stats = publisher_handle
            .await
            .context("publisher task panicked")?;

        let _ = sub_stop_tx.send(true);
        let mut subscriber_stats = Vec::with_capacity(subscriber_handles.len());
        for (idx, handle) in subscriber_handles.into_iter().enumerate() {
            let stats = handle
                .await
                .with_context(|| format!("subscriber {} task panicked", idx + 1))?;
            subscriber_stats.push(stats);
        }

        info!("test complete");
        Ok(TestReport {
            publisher: publisher_stats,
            subscribers: subscriber_stats,
        })
    }
}

/// Final statistics for one run, one entry per subscriber plus the
/// publisher totals.
#[derive(Debug, Clone)]
pub struct TestReport {
    pub publisher: PublisherStats,
    pub subscribers: Vec<ConnectionStats>,
}

impl TestReport {
    pub fn total_bytes_read(&self) -> u64 {
        self.subscribers.iter().map(|s| s.bytes_read).sum()
    }

    pub fn total_messages_received(&self) -> u64 {
        self.subscribers.iter().map(|s| s.messages_received).sum()
    }

    pub fn total_reconnection_attempts(&self) -> u64 {
        self.subscribers.iter().map(|s| s.reconnection_attempts).sum()
    }
}

impl fmt::Display for TestReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Test Statistics:")?;
        writeln!(f, "Messages sent: {}", self.publisher.messages_sent)?;
        writeln!(f, "Total bytes sent: {}", self.publisher.total_bytes_sent)?;
        writeln!(f, "Messages received: {}", self.total_messages_received())?;
        writeln!(f, "Total bytes read: {}", self.total_bytes_read())?;
        writeln!(
            f,
            "Reconnection attempts: {}",
            self.total_reconnection_attempts()
        )?;
        writeln!(
            f,
            "Average message size: {:.2} bytes",
            self.publisher.average_message_size()
        )?;
        writeln!(f)?;
        writeln!(f, "Per Connection Statistics:")?;
        for (idx, stats) in self.subscribers.iter().enumerate() {
            writeln!(f)?;
            writeln!(f, "Connection {}:", idx + 1)?;
            writeln!(f, "  Bytes read: {}", stats.bytes_read)?;
            writeln!(f, "  Messages received: {}", stats.messages_received)?;
            writeln!(f, "  Reconnection attempts: {}", stats.reconnection_attempts)?;
        }
        Ok(())
    }
}
