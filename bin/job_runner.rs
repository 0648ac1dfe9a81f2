//! # Job Runner
//!
//! Long-running process hosting every job queue.
//!
//! ## Overview
//!
//! This service:
//! - Builds the cache store (memory or Redis), cache layer and invalidation manager
//! - Serves positions/prices/TVL from a JSON fixture file
//! - Starts one queue and worker pool per job kind
//! - Registers the recurring refresh, warmup and cleanup jobs from `[schedules]`
//! - Handles graceful shutdown on Ctrl+C
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin job_runner -- --config Config.toml --fixtures demos/fixtures.json
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use lp_scan_engine::adapters::fixture::{FixtureData, FixtureSource};
use lp_scan_engine::cache_layer::{CacheLayer, StrategyTable};
use lp_scan_engine::cache_store::{CacheStore, MemoryStore};
use lp_scan_engine::invalidation::InvalidationManager;
use lp_scan_engine::jobs::payloads::{
    CacheWarmupPayload, PriceRefreshPayload, ProtocolTvlRefreshPayload, StaleDataCleanupPayload, WalletScanPayload,
};
use lp_scan_engine::jobs::{JobOptions, JobPayload};
use lp_scan_engine::processors::{default_registry, ProcessorDeps};
use lp_scan_engine::queue::{QueueManager, QueueRefreshHook};
use lp_scan_engine::settings::{Settings, StoreBackend};
use lp_scan_engine::metrics;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "job_runner", about = "Runs the LP scan job queues")]
struct Cli {
    /// Settings file (TOML); missing file means defaults plus LPSCAN__* env
    #[arg(long, default_value = "Config.toml")]
    config: String,

    /// JSON fixture file serving positions, prices and TVL
    #[arg(long)]
    fixtures: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Wallets to scan once at startup
    #[arg(long = "wallet")]
    wallets: Vec<String>,

    /// Chain for the startup wallet scans
    #[arg(long, default_value = "ethereum")]
    chain: String,

    /// Prometheus exporter listen address
    #[cfg(feature = "observability")]
    #[arg(long, default_value = "0.0.0.0:9000")]
    metrics_addr: std::net::SocketAddr,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn build_store(settings: &Settings) -> Result<Arc<dyn CacheStore>> {
    match settings.store.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        #[cfg(feature = "redis")]
        StoreBackend::Redis => {
            use lp_scan_engine::cache_store::redis::RedisStoreConfig;
            use lp_scan_engine::cache_store::RedisStore;
            let store = RedisStore::connect(RedisStoreConfig {
                url: settings.store.redis_url.clone(),
                connect_retries: settings.store.connect_retries,
                connect_backoff_ms: settings.store.connect_backoff_ms,
            })
            .await
            .context("connecting to redis")?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis"))]
        StoreBackend::Redis => anyhow::bail!("store.backend = \"redis\" requires the `redis` feature"),
    }
}

/// Recurring jobs from `[schedules]`; a missing interval disables the schedule.
async fn register_schedules(manager: &QueueManager, settings: &Settings) -> Result<()> {
    let s = &settings.schedules;
    let w = &settings.warmup;
    let mut schedules: Vec<(JobPayload, Option<u64>)> = Vec::new();

    if !w.trending_tokens.is_empty() {
        schedules.push((
            JobPayload::PriceRefresh(PriceRefreshPayload {
                tokens: w.trending_tokens.clone(),
                chains: w.chains.clone(),
            }),
            s.price_refresh_every_secs,
        ));
    }
    if !w.top_protocols.is_empty() {
        schedules.push((
            JobPayload::ProtocolTvlRefresh(ProtocolTvlRefreshPayload {
                protocols: w.top_protocols.clone(),
                chains: w.chains.clone(),
            }),
            s.tvl_refresh_every_secs,
        ));
    }
    schedules.push((JobPayload::CacheWarmup(CacheWarmupPayload::default()), s.warmup_every_secs));
    schedules.push((
        JobPayload::StaleDataCleanup(StaleDataCleanupPayload {
            max_age_hours: s.cleanup_max_age_hours,
            patterns: None,
            dry_run: false,
        }),
        s.cleanup_every_secs,
    ));

    for (payload, every) in schedules {
        let Some(every) = every else {
            continue;
        };
        let queue = payload.kind().default_queue();
        let handle = manager
            .add_job(queue, payload, JobOptions::new().repeat_every(Duration::from_secs(every)))
            .await
            .with_context(|| format!("registering schedule for {}", queue))?;
        println!("   {} {} every {}s", "⏱".cyan(), handle.queue, every);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    #[cfg(feature = "observability")]
    {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(cli.metrics_addr)
            .install()
            .context("installing prometheus exporter")?;
        info!(addr = %cli.metrics_addr, "prometheus exporter listening");
    }
    metrics::describe_metrics();

    println!("{}", "🚀 Starting LP scan job runner".bold());

    // 1. Settings
    let settings = Settings::load(&cli.config).with_context(|| format!("loading settings from {}", cli.config))?;
    println!("✅ Settings loaded");

    // 2. Store, cache, invalidation
    let store = build_store(&settings).await?;
    let cache = Arc::new(CacheLayer::new(store.clone(), StrategyTable::from(&settings.cache)));
    let invalidation = Arc::new(InvalidationManager::new(cache.clone()));
    println!("✅ Cache store ready ({})", store.backend());

    // 3. Sources
    let fixtures = match &cli.fixtures {
        Some(path) => FixtureSource::load(path)?,
        None => {
            warn!("no fixture file given, every protocol lookup will come back empty");
            FixtureSource::from_data(FixtureData::default())
        }
    };
    let sources = fixtures.into_registry();
    println!("✅ {} protocol source(s) registered", sources.len());

    // 4. Handlers and queues
    let deps = Arc::new(ProcessorDeps {
        cache: cache.clone(),
        invalidation,
        sources,
        settings: settings.processors.clone(),
        warmup: settings.warmup.clone(),
    });
    let manager = Arc::new(QueueManager::from_settings(&settings, default_registry(deps), store.clone())?);
    cache.set_refresh_hook(Arc::new(QueueRefreshHook::new(Arc::downgrade(&manager))));
    println!("✅ {} queues started", manager.queue_names().len());

    // 5. Schedules and startup scans
    register_schedules(&manager, &settings).await?;
    for wallet in &cli.wallets {
        let payload = JobPayload::WalletScan(WalletScanPayload {
            wallet: wallet.clone(),
            chain: cli.chain.clone(),
            protocols: None,
            refresh: false,
        });
        let handle = manager
            .add_job(payload.kind().default_queue(), payload, JobOptions::new())
            .await?;
        info!(job_id = %handle.id, wallet = %wallet, chain = %cli.chain, "startup scan enqueued");
    }

    println!("\nPress Ctrl+C to stop gracefully...\n");
    signal::ctrl_c().await?;
    println!("\n🛑 Shutdown signal received, stopping queues...");

    let stats = manager.all_stats();
    let health = manager.get_health().await;
    manager.graceful_shutdown().await?;

    println!("\n{}", "📊 Final queue stats".bold());
    for (name, s) in stats {
        if s.waiting + s.active + s.completed + s.failed + s.delayed == 0 {
            continue;
        }
        println!(
            "   {:<24} completed={} failed={} waiting={} delayed={} active={}",
            name,
            s.completed.to_string().green(),
            s.failed.to_string().red(),
            s.waiting,
            s.delayed,
            s.active
        );
    }
    let c = cache.stats();
    println!(
        "   cache: hits={} misses={} stale_served={} refreshes={} invalidated={}",
        c.hits, c.misses, c.stale_served, c.refreshes_triggered, c.invalidated
    );
    if !health.healthy {
        println!("   {}", "⚠️ shutdown started with unhealthy queues".yellow());
    }
    println!("✅ Shutdown complete");
    Ok(())
}
