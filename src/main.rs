// CLI entry point: parses the test parameters, checks the broker is
// reachable, runs the test, and prints the final report.
use anyhow::{bail, Context, Result};
use clap::Parser;
use std::time::Duration;
use tracing::info;

use slowsub::{
    Broker, ByteRange, HarnessConfig, KeepaliveConfig, Orchestrator, RedisBroker, SleepRange,
};

#[derive(Parser, Debug)]
#[command(name = "slowsub")]
#[command(about = "Slow-subscriber stress test for Redis pub/sub")]
struct Args {
    /// Redis host
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Redis port
    #[arg(long, default_value = "6379")]
    port: u16,

    /// Number of slow subscriber connections
    #[arg(long, default_value = "5")]
    connections: usize,

    /// Minimum bytes each subscriber reads per second
    #[arg(long, default_value = "500")]
    min_bytes_recv: u64,

    /// Maximum bytes each subscriber reads per second
    #[arg(long, default_value = "1500")]
    max_bytes_recv: u64,

    /// Fixed bytes-per-second read rate; overrides the min/max pair
    #[arg(long)]
    bytes_recv: Option<u64>,

    /// Minimum pause in seconds after a budget is exhausted
    #[arg(long, default_value = "0.1")]
    min_recv_sleep_time: f64,

    /// Maximum pause in seconds after a budget is exhausted
    #[arg(long, default_value = "0.5")]
    max_recv_sleep_time: f64,

    /// Minimum published message size in bytes
    #[arg(long, default_value = "100")]
    min_message_size: u64,

    /// Maximum published message size in bytes
    #[arg(long, default_value = "1000")]
    max_message_size: u64,

    /// Test duration in seconds
    #[arg(long, default_value = "60")]
    duration: u64,

    /// Pub/sub channel name
    #[arg(long, default_value = "test_channel")]
    channel: String,

    /// Seed for all random draws; omit for a different run each time
    #[arg(long)]
    seed: Option<u64>,
}

fn sleep_range(args: &Args) -> Result<SleepRange> {
    if args.min_recv_sleep_time < 0.0 || args.max_recv_sleep_time < 0.0 {
        bail!("recv sleep times must be non-negative");
    }
    let min = Duration::try_from_secs_f64(args.min_recv_sleep_time)
        .context("invalid min-recv-sleep-time")?;
    let max = Duration::try_from_secs_f64(args.max_recv_sleep_time)
        .context("invalid max-recv-sleep-time")?;
    Ok(SleepRange::new(min, max))
}

fn harness_config(args: &Args) -> Result<HarnessConfig> {
    let byte_budget = match args.bytes_recv {
        Some(rate) => ByteRange::fixed(rate),
        None => ByteRange::new(args.min_bytes_recv, args.max_bytes_recv),
    };
    Ok(HarnessConfig {
        channel: args.channel.clone(),
        connections: args.connections,
        byte_budget,
        read_sleep: sleep_range(args)?,
        message_size: ByteRange::new(args.min_message_size, args.max_message_size),
        duration: Duration::from_secs(args.duration),
        recv_timeout: Duration::from_secs(1),
        keepalive: KeepaliveConfig::default(),
        rng_seed: args.seed,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = harness_config(&args)?;

    let broker = RedisBroker::new(&args.host, args.port);
    let orchestrator = Orchestrator::new(broker.clone(), config).context("invalid configuration")?;

    // Preflight: fail fast when the broker is unreachable rather than
    // letting every subscriber spin in backoff.
    broker
        .ping()
        .await
        .with_context(|| format!("cannot reach Redis at {}", broker.url()))?;

    info!(
        url = %broker.url(),
        connections = args.connections,
        channel = %args.channel,
        duration_secs = args.duration,
        "Starting slow-subscriber test"
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let report = orchestrator.run(shutdown).await?;
    println!("{report}");
    Ok(())
}
