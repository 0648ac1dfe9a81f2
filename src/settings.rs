use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;

use crate::jobs::options::{BackoffPolicy, RateLimit};

// ==================== CACHE ====================

#[derive(Debug, Deserialize, Clone)]
pub struct CacheSettings {
    /// FAST_ACCESS TTL (prices, positions)
    #[serde(default = "default_fast_access_ttl_secs")]
    pub fast_access_ttl_secs: u64,
    /// READ_HEAVY TTL (wallet scan aggregates)
    #[serde(default = "default_read_heavy_ttl_secs")]
    pub read_heavy_ttl_secs: u64,
    /// Fraction of the READ_HEAVY TTL after which reads trigger a background refresh
    #[serde(default = "default_refresh_threshold")]
    pub read_heavy_refresh_threshold: f64,
    /// PERSISTENT TTL; None keeps entries until invalidated or cleaned up
    #[serde(default)]
    pub persistent_ttl_secs: Option<u64>,
}

fn default_fast_access_ttl_secs() -> u64 {
    60
}
fn default_read_heavy_ttl_secs() -> u64 {
    600
}
fn default_refresh_threshold() -> f64 {
    0.7
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            fast_access_ttl_secs: default_fast_access_ttl_secs(),
            read_heavy_ttl_secs: default_read_heavy_ttl_secs(),
            read_heavy_refresh_threshold: default_refresh_threshold(),
            persistent_ttl_secs: None,
        }
    }
}

// ==================== STORE ====================

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreSettings {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default = "default_connect_retries")]
    pub connect_retries: usize,
    #[serde(default = "default_connect_backoff_ms")]
    pub connect_backoff_ms: u64,
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}
fn default_connect_retries() -> usize {
    5
}
fn default_connect_backoff_ms() -> u64 {
    200
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            redis_url: default_redis_url(),
            connect_retries: default_connect_retries(),
            connect_backoff_ms: default_connect_backoff_ms(),
        }
    }
}

// ==================== QUEUES ====================

/// Worker-pool defaults applied to every queue.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct QueueDefaults {
    pub concurrency: usize,
    /// Execution budget for every queue; each kind's preset applies when unset
    pub job_timeout_ms: Option<u64>,
    pub poll_interval_ms: u64,
    /// Heartbeat renewal period for active jobs
    pub lock_renew_ms: u64,
    /// Active jobs without a heartbeat for this long are marked stalled
    pub stalled_interval_ms: u64,
    pub max_stalled_count: u32,
    pub remove_on_complete: Option<usize>,
    pub remove_on_fail: Option<usize>,
}

impl Default for QueueDefaults {
    fn default() -> Self {
        Self {
            concurrency: 2,
            job_timeout_ms: None,
            poll_interval_ms: 250,
            lock_renew_ms: 5_000,
            stalled_interval_ms: 30_000,
            max_stalled_count: 1,
            remove_on_complete: Some(100),
            remove_on_fail: Some(500),
        }
    }
}

/// Per-queue overrides, keyed by queue name in `[queues.overrides.<name>]`.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct QueueOverride {
    pub concurrency: Option<usize>,
    pub rate_limit: Option<RateLimit>,
    pub attempts: Option<u32>,
    pub backoff: Option<BackoffPolicy>,
    pub job_timeout_ms: Option<u64>,
    pub remove_on_complete: Option<usize>,
    pub remove_on_fail: Option<usize>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct QueueSettings {
    pub defaults: QueueDefaults,
    pub overrides: HashMap<String, QueueOverride>,
}

// ==================== PROCESSORS ====================

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProcessorSettings {
    /// Deadline for every external fetch call
    pub fetch_timeout_ms: u64,
    /// Max protocols fetched in parallel for one wallet scan
    pub scan_concurrency: usize,
    pub quick_scan_top_k: usize,
    pub quick_scan_timeout_ms: u64,
    pub bulk_batch_size: usize,
    pub bulk_concurrency: usize,
    /// Materiality thresholds for position refresh diffs
    pub value_change_pct: f64,
    pub fee_change_usd: f64,
    pub apr_change_pp: f64,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            fetch_timeout_ms: 10_000,
            scan_concurrency: 5,
            quick_scan_top_k: 5,
            quick_scan_timeout_ms: 3_000,
            bulk_batch_size: 10,
            bulk_concurrency: 3,
            value_change_pct: 1.0,
            fee_change_usd: 0.10,
            apr_change_pp: 1.0,
        }
    }
}

// ==================== WARMUP & SCHEDULES ====================

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WarmupSettings {
    pub popular_wallets: Vec<String>,
    pub top_protocols: Vec<String>,
    pub trending_tokens: Vec<String>,
    pub chains: Vec<String>,
}

impl Default for WarmupSettings {
    fn default() -> Self {
        Self {
            popular_wallets: Vec::new(),
            top_protocols: Vec::new(),
            trending_tokens: Vec::new(),
            chains: vec!["ethereum".to_string()],
        }
    }
}

/// Recurring jobs registered by the runner. A `None` interval disables the schedule.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ScheduleSettings {
    pub price_refresh_every_secs: Option<u64>,
    pub tvl_refresh_every_secs: Option<u64>,
    pub warmup_every_secs: Option<u64>,
    pub cleanup_every_secs: Option<u64>,
    pub cleanup_max_age_hours: u64,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            price_refresh_every_secs: Some(60),
            tvl_refresh_every_secs: Some(300),
            warmup_every_secs: Some(900),
            cleanup_every_secs: Some(3_600),
            cleanup_max_age_hours: 24,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ShutdownSettings {
    #[serde(default = "default_grace_timeout_ms")]
    pub grace_timeout_ms: u64,
}

fn default_grace_timeout_ms() -> u64 {
    30_000
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            grace_timeout_ms: default_grace_timeout_ms(),
        }
    }
}

// ==================== ROOT ====================

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub queues: QueueSettings,
    #[serde(default)]
    pub processors: ProcessorSettings,
    #[serde(default)]
    pub warmup: WarmupSettings,
    #[serde(default)]
    pub schedules: ScheduleSettings,
    #[serde(default)]
    pub shutdown: ShutdownSettings,
}

impl Settings {
    /// Loads `Config.toml` (optional) plus `LPSCAN__*` environment overrides.
    pub fn new() -> Result<Self, ConfigError> {
        Self::load("Config.toml")
    }

    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix("LPSCAN")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut settings: Self = s.try_deserialize()?;

        // Flat overrides for the values operators change most often
        if let Ok(url) = env::var("LPSCAN_REDIS_URL") {
            let trimmed = url.trim();
            if !trimmed.is_empty() {
                settings.store.redis_url = trimmed.to_string();
            }
        }
        if let Ok(raw) = env::var("LPSCAN_WARMUP_WALLETS") {
            let wallets = parse_string_list(&raw);
            if !wallets.is_empty() {
                settings.warmup.popular_wallets = wallets;
            }
        }

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = self.cache.read_heavy_refresh_threshold;
        if !(t > 0.0 && t < 1.0) {
            return Err(ConfigError::Message(format!(
                "cache.read_heavy_refresh_threshold must be in (0, 1), got {}",
                t
            )));
        }
        if self.queues.defaults.concurrency == 0 {
            return Err(ConfigError::Message("queues.defaults.concurrency must be > 0".into()));
        }
        for (name, o) in &self.queues.overrides {
            if o.concurrency == Some(0) {
                return Err(ConfigError::Message(format!(
                    "queues.overrides.{}.concurrency must be > 0",
                    name
                )));
            }
            if let Some(rl) = &o.rate_limit {
                if rl.max == 0 || rl.duration_ms == 0 {
                    return Err(ConfigError::Message(format!(
                        "queues.overrides.{}.rate_limit needs max > 0 and duration_ms > 0",
                        name
                    )));
                }
            }
        }
        let d = &self.queues.defaults;
        if d.poll_interval_ms == 0 || d.lock_renew_ms == 0 || d.stalled_interval_ms == 0 {
            return Err(ConfigError::Message("queue intervals must be > 0".into()));
        }
        let schedules = [
            self.schedules.price_refresh_every_secs,
            self.schedules.tvl_refresh_every_secs,
            self.schedules.warmup_every_secs,
            self.schedules.cleanup_every_secs,
        ];
        if schedules.iter().any(|s| *s == Some(0)) {
            return Err(ConfigError::Message("schedule intervals must be > 0".into()));
        }
        if self.processors.bulk_batch_size == 0 || self.processors.scan_concurrency == 0 {
            return Err(ConfigError::Message("processor batch sizes must be > 0".into()));
        }
        Ok(())
    }
}

fn parse_string_list(input: &str) -> Vec<String> {
    let trimmed = input.trim();
    if trimmed.starts_with('[') {
        if let Ok(v) = serde_json::from_str::<Vec<String>>(trimmed) {
            return v;
        }
    }
    trimmed
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split(',')
        .map(|s| s.trim().trim_matches('"').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
