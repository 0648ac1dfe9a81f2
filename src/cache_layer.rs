//! # Cache Layer
//!
//! Typed get/set/invalidate over a [`CacheStore`] with named strategies:
//!
//! - `FAST_ACCESS`: short TTL for volatile data (prices, per-protocol positions)
//! - `READ_HEAVY`: longer TTL with a refresh-ahead threshold. Once an entry is older
//!   than `threshold × ttl` reads still return it, and one background refresh is
//!   triggered through the registered [`RefreshHook`] (stale-while-revalidate)
//! - `PERSISTENT`: expensive analytics results, removed by invalidation rather than time
//!
//! Entries are written as a JSON envelope ([`CacheEntry`]) so age and strategy can be
//! recovered by any reader, including the stale-data cleanup job.

use crate::cache_keys;
use crate::cache_store::{CacheStore, StoreError};
use crate::clock::{Clock, SystemClock};
use crate::metrics;
use crate::settings::CacheSettings;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, info, warn};
use once_cell::sync::OnceCell;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to encode cache entry {key}: {source}")]
    Codec {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheStrategy {
    FastAccess,
    ReadHeavy,
    Persistent,
}

impl CacheStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStrategy::FastAccess => "FAST_ACCESS",
            CacheStrategy::ReadHeavy => "READ_HEAVY",
            CacheStrategy::Persistent => "PERSISTENT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrategyConfig {
    pub ttl: Option<Duration>,
    /// Fraction of `ttl` after which a read triggers a background refresh
    pub refresh_threshold: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrategyTable {
    pub fast_access: StrategyConfig,
    pub read_heavy: StrategyConfig,
    pub persistent: StrategyConfig,
}

impl StrategyTable {
    pub fn get(&self, strategy: CacheStrategy) -> StrategyConfig {
        match strategy {
            CacheStrategy::FastAccess => self.fast_access,
            CacheStrategy::ReadHeavy => self.read_heavy,
            CacheStrategy::Persistent => self.persistent,
        }
    }
}

impl From<&CacheSettings> for StrategyTable {
    fn from(s: &CacheSettings) -> Self {
        Self {
            fast_access: StrategyConfig {
                ttl: Some(Duration::from_secs(s.fast_access_ttl_secs)),
                refresh_threshold: None,
            },
            read_heavy: StrategyConfig {
                ttl: Some(Duration::from_secs(s.read_heavy_ttl_secs)),
                refresh_threshold: Some(s.read_heavy_refresh_threshold),
            },
            persistent: StrategyConfig {
                ttl: s.persistent_ttl_secs.map(Duration::from_secs),
                refresh_threshold: None,
            },
        }
    }
}

impl Default for StrategyTable {
    fn default() -> Self {
        StrategyTable::from(&CacheSettings::default())
    }
}

/// Stored envelope. `stored_at` is unix milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub key: String,
    pub value: T,
    pub strategy: CacheStrategy,
    pub stored_at: i64,
    pub ttl_ms: Option<u64>,
    pub refresh_threshold: Option<f64>,
}

impl<T> CacheEntry<T> {
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        (now_ms - self.stored_at).max(0)
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        matches!(self.ttl_ms, Some(ttl) if self.age_ms(now_ms) >= ttl as i64)
    }

    /// Past the refresh-ahead point but not yet expired.
    pub fn needs_refresh(&self, now_ms: i64) -> bool {
        match (self.ttl_ms, self.refresh_threshold) {
            (Some(ttl), Some(threshold)) => {
                let age = self.age_ms(now_ms) as f64;
                age >= threshold * ttl as f64 && !self.is_expired(now_ms)
            }
            _ => false,
        }
    }
}

/// Envelope metadata without the value, as listed by [`CacheLayer::scan_entries`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMeta {
    pub key: String,
    pub strategy: CacheStrategy,
    pub stored_at: i64,
    pub ttl_ms: Option<u64>,
    #[serde(skip)]
    pub size_bytes: usize,
}

/// Recomputes the value behind a stale key. Implementations usually enqueue a job.
#[async_trait]
pub trait RefreshHook: Send + Sync {
    async fn refresh(&self, key: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    stale_served: AtomicU64,
    refreshes_triggered: AtomicU64,
    invalidated: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stale_served: u64,
    pub refreshes_triggered: u64,
    pub invalidated: u64,
}

pub struct CacheLayer {
    store: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
    strategies: StrategyTable,
    /// Keys with a background refresh in flight, with the time it was claimed
    refreshing: Arc<DashMap<String, i64>>,
    hook: OnceCell<Arc<dyn RefreshHook>>,
    counters: Counters,
}

impl CacheLayer {
    pub fn new(store: Arc<dyn CacheStore>, strategies: StrategyTable) -> Self {
        Self::with_clock(store, strategies, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn CacheStore>, strategies: StrategyTable, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            strategies,
            refreshing: Arc::new(DashMap::new()),
            hook: OnceCell::new(),
            counters: Counters::default(),
        }
    }

    /// Installs the stale-while-revalidate hook. Returns false if one was already set.
    pub fn set_refresh_hook(&self, hook: Arc<dyn RefreshHook>) -> bool {
        self.hook.set(hook).is_ok()
    }

    pub fn strategies(&self) -> &StrategyTable {
        &self.strategies
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str, strategy: CacheStrategy) -> Result<Option<T>, CacheError> {
        self.get_validated(key, strategy, |_: &T| true).await
    }

    /// Like [`get`](Self::get); a value rejected by `validator` counts as a miss.
    pub async fn get_validated<T, F>(&self, key: &str, strategy: CacheStrategy, validator: F) -> Result<Option<T>, CacheError>
    where
        T: DeserializeOwned,
        F: Fn(&T) -> bool,
    {
        let namespace = cache_keys::namespace_of(key);
        let now = self.clock.now_ms();

        let entry = match self.read_entry::<T>(key).await? {
            Some(e) if !e.is_expired(now) && validator(&e.value) => e,
            _ => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                metrics::increment_cache_miss(namespace);
                return Ok(None);
            }
        };

        let threshold = entry
            .refresh_threshold
            .or(self.strategies.get(strategy).refresh_threshold);
        let stale = match (entry.ttl_ms, threshold) {
            (Some(ttl), Some(t)) => entry.age_ms(now) as f64 >= t * ttl as f64,
            _ => false,
        };
        if stale {
            self.counters.stale_served.fetch_add(1, Ordering::Relaxed);
            metrics::increment_cache_stale_served(namespace);
            self.trigger_refresh(key, now, entry.ttl_ms.unwrap_or(0));
        }

        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        metrics::increment_cache_hit(namespace);
        Ok(Some(entry.value))
    }

    /// Reads the full envelope with no stats or refresh side effects.
    pub async fn peek<T: DeserializeOwned>(&self, key: &str) -> Result<Option<CacheEntry<T>>, CacheError> {
        let now = self.clock.now_ms();
        Ok(self.read_entry::<T>(key).await?.filter(|e| !e.is_expired(now)))
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T, strategy: CacheStrategy) -> Result<(), CacheError> {
        let config = self.strategies.get(strategy);
        let entry = CacheEntry {
            key: key.to_string(),
            value,
            strategy,
            stored_at: self.clock.now_ms(),
            ttl_ms: config.ttl.map(|t| t.as_millis() as u64),
            refresh_threshold: config.refresh_threshold,
        };
        let bytes = serde_json::to_vec(&entry).map_err(|source| CacheError::Codec {
            key: key.to_string(),
            source,
        })?;
        self.store.set(key, bytes, config.ttl).await?;
        self.refreshing.remove(key);
        debug!("cache set {} ({})", key, strategy.as_str());
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        self.refreshing.remove(key);
        Ok(self.store.delete(&[key.to_string()]).await? > 0)
    }

    /// Evicts every key matching `pattern` and records why.
    pub async fn invalidate(&self, pattern: &str, reason: &str) -> Result<usize, CacheError> {
        let keys = self.store.keys(pattern).await?;
        if keys.is_empty() {
            debug!("invalidate {} ({}): nothing cached", pattern, reason);
            return Ok(0);
        }
        let removed = self.store.delete(&keys).await?;
        for k in &keys {
            self.refreshing.remove(k);
        }
        self.counters.invalidated.fetch_add(removed as u64, Ordering::Relaxed);
        metrics::increment_cache_invalidated(reason, removed as u64);
        info!("invalidated {} key(s) matching {} (reason: {})", removed, pattern, reason);
        Ok(removed)
    }

    pub async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        Ok(self.store.keys(pattern).await?)
    }

    /// Lists envelope metadata for keys matching `pattern`. Keys that are not cache
    /// envelopes are skipped.
    pub async fn scan_entries(&self, pattern: &str) -> Result<Vec<EntryMeta>, CacheError> {
        let mut out = Vec::new();
        for key in self.store.keys(pattern).await? {
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            match serde_json::from_slice::<EntryMeta>(&raw) {
                Ok(mut meta) => {
                    meta.size_bytes = raw.len();
                    out.push(meta);
                }
                Err(e) => debug!("skipping non-envelope key {}: {}", key, e),
            }
        }
        Ok(out)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            stale_served: self.counters.stale_served.load(Ordering::Relaxed),
            refreshes_triggered: self.counters.refreshes_triggered.load(Ordering::Relaxed),
            invalidated: self.counters.invalidated.load(Ordering::Relaxed),
        }
    }

    pub async fn ping(&self) -> Result<(), CacheError> {
        Ok(self.store.ping().await?)
    }

    async fn read_entry<T: DeserializeOwned>(&self, key: &str) -> Result<Option<CacheEntry<T>>, CacheError> {
        let Some(raw) = self.store.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_slice::<CacheEntry<T>>(&raw) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                warn!("undecodable cache entry {}: {} (treated as miss)", key, e);
                Ok(None)
            }
        }
    }

    /// Claims the in-flight marker for `key` and spawns one refresh. A marker older
    /// than the entry TTL is considered abandoned and can be re-claimed.
    fn trigger_refresh(&self, key: &str, now: i64, ttl_ms: u64) {
        let Some(hook) = self.hook.get().cloned() else {
            return;
        };
        let claimed = match self.refreshing.entry(key.to_string()) {
            Entry::Vacant(v) => {
                v.insert(now);
                true
            }
            Entry::Occupied(mut o) => {
                if now - *o.get() >= ttl_ms as i64 {
                    o.insert(now);
                    true
                } else {
                    false
                }
            }
        };
        if !claimed {
            return;
        }

        self.counters.refreshes_triggered.fetch_add(1, Ordering::Relaxed);
        metrics::increment_cache_refresh_triggered(cache_keys::namespace_of(key));
        debug!("stale entry {}, scheduling background refresh", key);

        let refreshing = self.refreshing.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            if let Err(e) = hook.refresh(&key).await {
                warn!("background refresh of {} failed: {:#}", key, e);
                refreshing.remove(&key);
            }
        });
    }
}
