//! Stress harness for pub/sub brokers built around deliberately slow
//! consumers.
//!
//! The harness runs a pool of subscribers that throttle their own reads
//! to a per-second byte budget, alongside one publisher producing load
//! at a fixed cadence. Because the subscribers read slower than the
//! publisher writes, broker-side buffers grow and the broker's
//! backlog/disconnect policy is exercised. Subscribers treat every
//! disconnect as routine and reconnect under exponential backoff, so a
//! run reports how often the broker shed them rather than falling over.
//!
//! [`orchestrator::Orchestrator`] wires the units together against any
//! [`broker::Broker`] implementation. [`broker::RedisBroker`] targets a
//! real Redis; [`broker::MemoryBroker`] is an in-process stand-in with
//! fault injection for tests.

pub mod broker;
pub mod config;
pub mod orchestrator;
pub mod publisher;
pub mod stop;
pub mod subscriber;

pub use broker::memory::{CloseEvent, MemoryBroker};
pub use broker::redis::RedisBroker;
pub use broker::{Broker, BrokerError, Delivery, DeliveryKind, Publication, SubscribeOptions, Subscription};
pub use config::{
    ByteRange, ConfigError, HarnessConfig, KeepaliveConfig, PublisherConfig, SleepRange,
    SubscriberConfig,
};
pub use orchestrator::{Orchestrator, TestReport};
pub use publisher::{LoadPublisher, PublisherStats};
pub use subscriber::{ConnectionStats, SlowSubscriber, SubscriberState};
