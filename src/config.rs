// Harness configuration: per-range bounds with up-front validation.
use rand::Rng;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {name} range: min {min} exceeds max {max}")]
    InvalidRange {
        name: &'static str,
        min: String,
        max: String,
    },
}

/// Inclusive byte-count range sampled uniformly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub min: u64,
    pub max: u64,
}

impl ByteRange {
    pub fn new(min: u64, max: u64) -> Self {
        Self { min, max }
    }

    /// A degenerate range reproduces the fixed-rate behavior.
    pub fn fixed(value: u64) -> Self {
        Self {
            min: value,
            max: value,
        }
    }

    pub fn validate(&self, name: &'static str) -> Result<()> {
        if self.min > self.max {
            return Err(ConfigError::InvalidRange {
                name,
                min: self.min.to_string(),
                max: self.max.to_string(),
            });
        }
        Ok(())
    }

    pub fn sample(&self, rng: &mut impl Rng) -> u64 {
        rng.gen_range(self.min..=self.max)
    }
}

/// Inclusive sleep-duration range sampled uniformly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SleepRange {
    pub min: Duration,
    pub max: Duration,
}

impl SleepRange {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    pub fn validate(&self, name: &'static str) -> Result<()> {
        if self.min > self.max {
            return Err(ConfigError::InvalidRange {
                name,
                min: format!("{:?}", self.min),
                max: format!("{:?}", self.max),
            });
        }
        Ok(())
    }

    pub fn sample(&self, rng: &mut impl Rng) -> Duration {
        rng.gen_range(self.min..=self.max)
    }
}

/// TCP keepalive tuning passed to the broker connector so dead peers are
/// noticed faster than default OS timeouts. Transports that cannot set
/// socket options fall back to the bounded receive timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepaliveConfig {
    pub idle: Duration,
    pub probe_interval: Duration,
    pub probe_count: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(30),
            probe_interval: Duration::from_secs(5),
            probe_count: 3,
        }
    }
}

/// Immutable per-subscriber configuration.
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    pub channel: String,
    pub byte_budget: ByteRange,
    pub read_sleep: SleepRange,
    /// Bounded wait per receive; also the stop-latency bound while
    /// reading.
    pub recv_timeout: Duration,
    pub keepalive: KeepaliveConfig,
    // Seed for the subscriber's own RNG; None draws from entropy.
    pub rng_seed: Option<u64>,
}

impl SubscriberConfig {
    pub fn validate(&self) -> Result<()> {
        self.byte_budget.validate("bytes-recv")?;
        self.read_sleep.validate("recv-sleep-time")?;
        Ok(())
    }
}

/// Immutable publisher configuration.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub channel: String,
    pub message_size: ByteRange,
    pub rng_seed: Option<u64>,
}

impl PublisherConfig {
    pub fn validate(&self) -> Result<()> {
        self.message_size.validate("message-size")
    }
}

/// Top-level test configuration shared by the orchestrator.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub channel: String,
    pub connections: usize,
    pub byte_budget: ByteRange,
    pub read_sleep: SleepRange,
    pub message_size: ByteRange,
    pub duration: Duration,
    pub recv_timeout: Duration,
    pub keepalive: KeepaliveConfig,
    pub rng_seed: Option<u64>,
}

impl HarnessConfig {
    /// Rejects any inverted range before anything connects.
    pub fn validate(&self) -> Result<()> {
        self.byte_budget.validate("bytes-recv")?;
        self.read_sleep.validate("recv-sleep-time")?;
        self.message_size.validate("message-size")?;
        Ok(())
    }

    pub fn subscriber_config(&self, id: usize) -> SubscriberConfig {
        SubscriberConfig {
            channel: self.channel.clone(),
            byte_budget: self.byte_budget,
            read_sleep: self.read_sleep,
            recv_timeout: self.recv_timeout,
            keepalive: self.keepalive.clone(),
            rng_seed: self.rng_seed.map(|seed| seed.wrapping_add(id as u64)),
        }
    }

    pub fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig {
            channel: self.channel.clone(),
            message_size: self.message_size,
            // Offset so the publisher never shares a subscriber's stream.
            rng_seed: self.rng_seed.map(|seed| seed.wrapping_add(0x1000)),
        }
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        // Defaults mirror the harness CLI.
        Self {
            channel: "test_channel".to_string(),
            connections: 5,
            byte_budget: ByteRange::new(500, 1500),
            read_sleep: SleepRange::new(Duration::from_millis(100), Duration::from_millis(500)),
            message_size: ByteRange::new(100, 1000),
            duration: Duration::from_secs(60),
            recv_timeout: Duration::from_secs(1),
            keepalive: KeepaliveConfig::default(),
            rng_seed: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        HarnessConfig::default().validate().expect("valid");
    }

    #[test]
    fn inverted_byte_budget_is_rejected() {
        let config = HarnessConfig {
            byte_budget: ByteRange::new(1500, 500),
            ..HarnessConfig::default()
        };
        let err = config.validate().expect_err("inverted range");
        assert!(matches!(err, ConfigError::InvalidRange { name, .. } if name == "bytes-recv"));
    }

    #[test]
    fn inverted_sleep_range_is_rejected() {
        let config = HarnessConfig {
            read_sleep: SleepRange::new(Duration::from_millis(500), Duration::from_millis(100)),
            ..HarnessConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn inverted_message_size_is_rejected() {
        let config = HarnessConfig {
            message_size: ByteRange::new(1000, 100),
            ..HarnessConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn degenerate_range_is_valid_and_samples_itself() {
        let range = ByteRange::fixed(800);
        range.validate("bytes-recv").expect("valid");
        let mut rng = rand::thread_rng();
        for _ in 0..16 {
            assert_eq!(range.sample(&mut rng), 800);
        }
    }

    #[test]
    fn samples_stay_within_bounds() {
        let range = ByteRange::new(500, 1500);
        let mut rng = rand::thread_rng();
        for _ in 0..64 {
            let value = range.sample(&mut rng);
            assert!((500..=1500).contains(&value));
        }
    }

    #[test]
    fn per_subscriber_seeds_differ() {
        let config = HarnessConfig {
            rng_seed: Some(7),
            ..HarnessConfig::default()
        };
        assert_ne!(
            config.subscriber_config(1).rng_seed,
            config.subscriber_config(2).rng_seed
        );
    }
}
