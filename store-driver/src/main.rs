use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tierstore::config::StoreConfig;
use tierstore::pool::{BoundedPool, PoolRegion};
use tierstore::tier::MemoryTier;
use tierstore::{FactoryId, StoreParts, TierFactory, TieredStore};
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

mod report;
mod workload;

/// Tiered store workload driver CLI
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of worker threads
    #[arg(short, long, default_value = "4")]
    threads: usize,

    /// Operations per worker thread
    #[arg(short, long, default_value = "100000")]
    operations: usize,

    /// Size of the key space
    #[arg(short, long, default_value = "100000")]
    keys: u64,

    /// Number of store segments (default: based on available parallelism)
    #[arg(long)]
    segments: Option<usize>,

    /// Initial slot capacity across all segments
    #[arg(long, default_value = "1024")]
    initial_capacity: usize,

    /// Maximum element count; 0 disables eviction
    #[arg(long, default_value = "0")]
    max_size: usize,

    /// Heap pool limit in bytes; 0 means unbounded
    #[arg(long, default_value = "0")]
    heap_bytes: u64,

    /// Tier pool limit in bytes; 0 means unbounded
    #[arg(long, default_value = "0")]
    tier_bytes: u64,

    /// Write new elements as tier placeholders instead of resident values
    #[arg(long)]
    tier_primary: bool,

    /// Percentage of traffic going to hot keys
    #[arg(long, default_value = "80")]
    hot_traffic: u8,

    /// Percentage of keys that are hot
    #[arg(long, default_value = "20")]
    hot_keys: u8,

    /// Percentage of operations that write
    #[arg(long, default_value = "20")]
    write_percent: u8,

    /// Percentage of operations that remove
    #[arg(long, default_value = "5")]
    remove_percent: u8,

    /// Minimum value size in bytes
    #[arg(long, default_value = "64")]
    min_value_size: usize,

    /// Maximum value size in bytes
    #[arg(long, default_value = "4096")]
    max_value_size: usize,

    /// Time-to-live for written elements in milliseconds; 0 keeps them forever
    #[arg(long, default_value = "0")]
    ttl_ms: u64,

    /// Spill a sampled element to the tier every N operations (0 disables)
    #[arg(long, default_value = "0")]
    spill_every: usize,

    /// Flush pending placeholders every N operations (0 disables)
    #[arg(long, default_value = "1000")]
    flush_every: usize,

    /// Remove expired elements every N operations (0 disables)
    #[arg(long, default_value = "0")]
    expire_every: usize,

    /// Base random seed
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_logging(level: &str) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(level)
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
}

fn pool(region: PoolRegion, limit: u64) -> Arc<BoundedPool> {
    Arc::new(if limit == 0 {
        BoundedPool::unbounded(region)
    } else {
        BoundedPool::new(region, limit)
    })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let mut config = StoreConfig::new()
        .with_initial_capacity(args.initial_capacity)
        .with_max_size(args.max_size)
        .with_tier_primary(args.tier_primary);
    if let Some(segments) = args.segments {
        config = config.with_segments(segments);
    }

    let tier = TierFactory::new(
        FactoryId::new(1),
        Arc::new(MemoryTier::<u64, Vec<u8>>::new()),
        pool(PoolRegion::OnDisk, args.tier_bytes),
    )?;
    let parts = StoreParts::new()
        .with_heap_pool(pool(PoolRegion::OnHeap, args.heap_bytes))
        .with_tier(Arc::new(tier));
    let store = Arc::new(TieredStore::init_with_parts(config, parts, None)?);

    let workload = workload::WorkloadConfig {
        threads: args.threads.max(1),
        operations: args.operations,
        keys: args.keys,
        hot_traffic_percent: args.hot_traffic,
        hot_keys_percent: args.hot_keys,
        write_percent: args.write_percent,
        remove_percent: args.remove_percent,
        min_value_size: args.min_value_size,
        max_value_size: args.max_value_size,
        ttl: (args.ttl_ms > 0).then(|| Duration::from_millis(args.ttl_ms)),
        spill_every: args.spill_every,
        flush_every: if args.tier_primary { args.flush_every } else { 0 },
        expire_every: args.expire_every,
        seed: args.seed,
    };

    info!(
        threads = workload.threads,
        operations = workload.operations,
        segments = store.segment_count(),
        tier_primary = args.tier_primary,
        "starting workload"
    );
    let outcome = workload::run(&store, &workload);
    info!(elapsed_ms = outcome.elapsed.as_millis() as u64, "workload finished");

    report::print(&store, &outcome);
    Ok(())
}
