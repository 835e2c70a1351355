// Resilient rate-limited subscriber: the core of the harness.
//
// One subscriber owns one broker subscription, throttles its own reads
// to a per-second byte budget, and replaces the handle wholesale on
// every connection loss. Statistics are owned exclusively by the run
// loop and handed back by value when the task is joined.
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::broker::{Broker, SubscribeOptions, Subscription};
use crate::config::SubscriberConfig;
use crate::stop::{self, StopReceiver};

// Pause after a recoverable receive error.
const TRANSIENT_PAUSE: Duration = Duration::from_secs(1);
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const WINDOW_LENGTH: Duration = Duration::from_secs(1);

/// Counters owned by one subscriber's read loop. All three are
/// non-decreasing for the life of the subscriber.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub bytes_read: u64,
    pub messages_received: u64,
    pub reconnection_attempts: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Disconnected,
    Connected,
    Reconnecting,
    Stopped,
}

pub struct SlowSubscriber<B: Broker> {
    id: usize,
    broker: B,
    config: SubscriberConfig,
    stats: ConnectionStats,
    // Lifecycle state published for observers; the run loop only writes.
    state_tx: watch::Sender<SubscriberState>,
    backoff: Backoff,
    rng: StdRng,
    stop: StopReceiver,
    conn: Option<B::Subscription>,
}

impl<B: Broker> SlowSubscriber<B> {
    pub fn new(id: usize, broker: B, config: SubscriberConfig, stop: StopReceiver) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let (state_tx, _) = watch::channel(SubscriberState::Disconnected);
        Self {
            id,
            broker,
            config,
            stats: ConnectionStats::default(),
            state_tx,
            backoff: Backoff::new(BACKOFF_INITIAL, BACKOFF_CAP),
            rng,
            stop,
            conn: None,
        }
    }

    /// Watch handle over the subscriber's lifecycle state. Grab it
    /// before spawning `run`; the channel closes when the run ends.
    pub fn state_watch(&self) -> watch::Receiver<SubscriberState> {
        self.state_tx.subscribe()
    }

    fn subscribe_options(&self) -> SubscribeOptions {
        SubscribeOptions {
            channel: self.config.channel.clone(),
            keepalive: self.config.keepalive.clone(),
        }
    }

    /// Runs until a stop request; returns the final statistics.
    pub async fn run(mut self) -> ConnectionStats {
        // Initial connect. Failure enters the same backoff path as a
        // mid-run loss.
        match self.broker.subscribe(&self.subscribe_options()).await {
            Ok(conn) => {
                self.conn = Some(conn);
                self.state_tx.send_replace(SubscriberState::Connected);
                info!(id = self.id, channel = %self.config.channel, "subscribed");
            }
            Err(err) => {
                error!(id = self.id, error = %err, "initial connect failed");
                if !self.reconnect().await {
                    return self.shutdown().await;
                }
            }
        }

        let mut window = self.fresh_window();
        while !stop::is_stopped(&self.stop) {
            let now = Instant::now();
            if window.has_elapsed(now) {
                let budget = self.config.byte_budget.sample(&mut self.rng);
                window.roll(now, budget);
                debug!(id = self.id, budget, "new byte budget for this window");
            }
            if window.exhausted() {
                // Voluntarily withhold reads so the broker must buffer.
                let pause = self.config.read_sleep.sample(&mut self.rng);
                trace!(id = self.id, pause_ms = pause.as_millis() as u64, "budget exhausted");
                if stop::sleep_or_stop(&mut self.stop, pause).await {
                    break;
                }
                continue;
            }
            let wait = self.config.recv_timeout;
            let Some(conn) = self.conn.as_mut() else {
                // Every path out of connect/reconnect either installs a
                // handle or exits the loop.
                error!(id = self.id, "subscription handle missing");
                break;
            };
            let received = tokio::select! {
                _ = stop::stopped(&mut self.stop) => break,
                outcome = conn.next_delivery(wait) => outcome,
            };
            match received {
                Ok(Some(delivery)) if delivery.is_data() => {
                    let len = delivery.payload.len() as u64;
                    window.charge(len);
                    self.stats.bytes_read += len;
                    self.stats.messages_received += 1;
                    trace!(id = self.id, len, "received message");
                }
                // Control-plane confirmations are not counted.
                Ok(Some(_)) => {}
                // Quiet timeout: nothing arrived within the bounded wait.
                Ok(None) => {}
                Err(err) if err.is_disconnect() => {
                    error!(id = self.id, error = %err, "connection lost");
                    if !self.reconnect().await {
                        break;
                    }
                    // A reconnect starts a new observation window.
                    window = self.fresh_window();
                }
                Err(err) => {
                    warn!(id = self.id, error = %err, "transient receive error");
                    if stop::sleep_or_stop(&mut self.stop, TRANSIENT_PAUSE).await {
                        break;
                    }
                }
            }
        }
        self.shutdown().await
    }

    fn fresh_window(&mut self) -> BudgetWindow {
        let budget = self.config.byte_budget.sample(&mut self.rng);
        BudgetWindow::open(Instant::now(), budget)
    }

    /// One loss episode: bumps the counter exactly once, then retries
    /// under exponential backoff until connected or stopped.
    async fn reconnect(&mut self) -> bool {
        self.state_tx.send_replace(SubscriberState::Reconnecting);
        self.stats.reconnection_attempts += 1;
        warn!(
            id = self.id,
            attempt = self.stats.reconnection_attempts,
            "reconnecting"
        );
        if let Some(mut stale) = self.conn.take() {
            stale.close().await;
        }
        let mut round = 0u32;
        while !stop::is_stopped(&self.stop) {
            round += 1;
            match self.broker.subscribe(&self.subscribe_options()).await {
                Ok(conn) => {
                    self.conn = Some(conn);
                    self.state_tx.send_replace(SubscriberState::Connected);
                    self.backoff.reset();
                    info!(id = self.id, round, "reconnected");
                    return true;
                }
                Err(err) => {
                    error!(id = self.id, round, error = %err, "reconnect round failed");
                }
            }
            let delay = self.backoff.next_delay();
            info!(
                id = self.id,
                round,
                delay_ms = delay.as_millis() as u64,
                "waiting before next reconnect round"
            );
            if stop::sleep_or_stop(&mut self.stop, delay).await {
                break;
            }
        }
        false
    }

    async fn shutdown(mut self) -> ConnectionStats {
        if let Some(mut conn) = self.conn.take() {
            conn.close().await;
        }
        self.state_tx.send_replace(SubscriberState::Stopped);
        info!(
            id = self.id,
            messages = self.stats.messages_received,
            bytes = self.stats.bytes_read,
            reconnects = self.stats.reconnection_attempts,
            "subscriber stopped"
        );
        self.stats
    }
}

/// Rolling one-second budget window. A message that overruns the
/// remaining headroom charges the excess to the next window, so a fully
/// elapsed window is never charged more than the budget it committed to.
#[derive(Debug)]
struct BudgetWindow {
    opened_at: Instant,
    budget: u64,
    charged: u64,
    carry: u64,
}

impl BudgetWindow {
    fn open(now: Instant, budget: u64) -> Self {
        Self {
            opened_at: now,
            budget,
            charged: 0,
            carry: 0,
        }
    }

    fn has_elapsed(&self, now: Instant) -> bool {
        now.duration_since(self.opened_at) >= WINDOW_LENGTH
    }

    fn roll(&mut self, now: Instant, budget: u64) {
        self.opened_at = now;
        self.budget = budget;
        self.charged = 0;
        let carry = std::mem::take(&mut self.carry);
        if carry > 0 {
            self.charge(carry);
        }
    }

    fn exhausted(&self) -> bool {
        self.charged >= self.budget
    }

    fn charge(&mut self, len: u64) {
        let room = self.budget.saturating_sub(self.charged);
        if len <= room {
            self.charged += len;
        } else {
            self.charged = self.budget;
            self.carry += len - room;
        }
    }

    #[cfg(test)]
    fn charged(&self) -> u64 {
        self.charged
    }
}

/// Exponential reconnect backoff: 1s doubling to a 30s cap, reset to
/// the initial delay after any successful reconnect.
#[derive(Debug)]
struct Backoff {
    next: Duration,
    initial: Duration,
    cap: Duration,
}

impl Backoff {
    fn new(initial: Duration, cap: Duration) -> Self {
        Self {
            next: initial,
            initial,
            cap,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (delay * 2).min(self.cap);
        delay
    }

    fn reset(&mut self) {
        self.next = self.initial;
    }
}
