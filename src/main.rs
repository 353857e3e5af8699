//! mdcache: drive the metadata cache with a synthetic record workload over a
//! file-backed store and print the resulting statistics as JSON.

use clap::Parser;
use tracing::info;

use metadata_cache::cache::Cache;
use metadata_cache::config::{Cli, Config};
use metadata_cache::store::{BackingStore, FileStore};
use metadata_cache::workload;
use metadata_cache::FlushFlags;

fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "metadata_cache=debug"
    } else {
        "metadata_cache=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("mdcache v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let config = Config::load(&cli.config)?;
    info!(
        max_size = config.cache.max_size,
        min_clean_size = config.cache.min_clean_size,
        resize_incr = config.resize.incr_enabled,
        resize_decr = config.resize.decr_enabled,
        collective = config.collective.is_some(),
        "Configuration loaded"
    );

    let store = FileStore::create(&cli.store, workload::store_len(cli.entries))?;
    info!(path = %cli.store.display(), entries = cli.entries, rounds = cli.rounds, "Store created");

    let mut cache = Cache::new(config, store)?;
    let report = workload::run(&mut cache, cli.entries, cli.rounds)?;

    cache.check_invariants()?;
    let stats = cache.stats();
    cache.flush(FlushFlags::invalidate())?;
    cache.store().sync()?;

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "workload": report,
            "stats": stats,
            "hit_rate": stats.hit_rate(),
            "io": {
                "reads": cache.store().stats().total_reads,
                "writes": cache.store().stats().total_writes,
                "bytes_written": cache.store().stats().total_bytes_written,
            },
        }))?
    );

    Ok(())
}
