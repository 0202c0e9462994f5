//! TapeIO offer daemon
//!
//! Opens the metadata store and the disk directories, recovers whatever a
//! previous run left behind, then keeps the aggregation workers, the cache
//! eviction worker and the access request maintenance running until
//! interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tapeio_cache::ArchiveCache;
use tapeio_common::{OfferConfig, OrderQueue, StaticTopology, TopologyResolver};
use tapeio_meta_store::MetaStore;
use tapeio_offer::{
    AccessRequestManager, Aggregator, ArchiveStaging, ArchiverContext, Bootstrap, EvictionController,
    FsLooseObjectStore, LooseObjectStore, RetryPolicy, TapeObjectStorage,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "tapeio-offerd")]
#[command(about = "TapeIO tape-backed object storage offer")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "TAPEIO_CONFIG", default_value = "/etc/tapeio/offer.toml")]
    config: PathBuf,

    /// Log level, used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

fn load_config(path: &Path) -> Result<OfferConfig> {
    let config: OfferConfig = if path.exists() {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
    } else {
        OfferConfig::default()
    };
    config.validate()?;
    Ok(config)
}

fn init_tracing(log_level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args.config)?;
    init_tracing(&args.log_level, args.json_logs);

    info!("Starting TapeIO offer");
    if args.config.exists() {
        info!("Config file: {}", args.config.display());
    } else {
        warn!("Config file {} not found, using defaults", args.config.display());
    }

    let storage_dirs = &config.storage;
    let store = Arc::new(MetaStore::open_with_batch_size(
        &storage_dirs.meta_db_path,
        config.store.bulk_batch_size,
    )?);
    let topology: Arc<dyn TopologyResolver> = Arc::new(StaticTopology::from_config(&config.topology));
    let queue: Arc<dyn OrderQueue> = store.clone();
    let loose: Arc<dyn LooseObjectStore> = Arc::new(FsLooseObjectStore::new(&storage_dirs.input_files_dir)?);

    let eviction = Arc::new(EvictionController::new(Arc::clone(&store), Arc::clone(&topology)));
    let cache = Arc::new(ArchiveCache::open(
        &storage_dirs.cache_dir,
        topology.partitions(),
        &config.cache,
        eviction.clone(),
    )?);
    info!(
        "Disk cache at {}: {} archives, {} bytes",
        storage_dirs.cache_dir.display(),
        cache.cached_archives().len(),
        cache.current_usage()
    );

    let access = Arc::new(AccessRequestManager::new(
        Arc::clone(&store),
        Arc::clone(&cache),
        Arc::clone(&queue),
        Arc::clone(&topology),
        config.access_request.clone(),
        config.store.cleanup_batch_size,
    ));
    let ctx = Arc::new(ArchiverContext {
        store: Arc::clone(&store),
        loose,
        queue,
        topology: Arc::clone(&topology),
        input_tars_dir: storage_dirs.input_tars_dir.clone(),
        archive: config.archive.clone(),
        retry: RetryPolicy::from_config(&config.access_request),
    });

    let bootstrap = Bootstrap::new(&ctx, &cache, config.store.verify_batch_size);
    bootstrap.recover_archives()?;

    let eviction_worker = cache.start_eviction_worker();
    let cleanup = access.start_cleanup();
    let aggregator = Aggregator::start(Arc::clone(&ctx));
    let client = aggregator.client();
    bootstrap.recover_input_files(|msg| client.submit(msg))?;

    // in-process entry points of the surrounding offer service
    let _storage = TapeObjectStorage::new(
        Arc::clone(&ctx),
        Arc::clone(&cache),
        Arc::clone(&eviction),
        Arc::clone(&access),
        client,
    );
    let _staging = ArchiveStaging::new(
        Arc::clone(&store),
        Arc::clone(&cache),
        Arc::clone(&access),
        storage_dirs.input_tars_dir.clone(),
    );
    info!("TapeIO offer ready");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    aggregator.shutdown().await;
    cleanup.shutdown().await;
    eviction_worker.shutdown().await;

    info!("TapeIO offer shut down gracefully");
    Ok(())
}
