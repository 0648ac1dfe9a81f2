// Memory Store - in-process CacheStore backed by DashMap
// Expiry is evaluated lazily on read and on key listing.

use super::{glob_match, CacheStore, StoreError};
use crate::clock::{Clock, SystemClock};
use async_trait::async_trait;
use dashmap::DashMap;
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
struct StoredValue {
    bytes: Vec<u8>,
    expires_at_ms: Option<i64>,
}

impl StoredValue {
    fn is_expired(&self, now_ms: i64) -> bool {
        matches!(self.expires_at_ms, Some(at) if now_ms >= at)
    }
}

/// Lock-free in-memory store.
pub struct MemoryStore {
    entries: DashMap<String, StoredValue>,
    clock: Arc<dyn Clock>,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            closed: AtomicBool::new(false),
        }
    }

    /// Number of stored keys, expired or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every expired key; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let before = self.entries.len();
        self.entries.retain(|_, v| !v.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!("Purged {} expired keys from memory store", removed);
        }
        removed
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.ensure_open()?;
        let now = self.clock.now_ms();
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.bytes.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.ensure_open()?;
        let expires_at_ms = ttl.map(|t| self.clock.now_ms() + t.as_millis() as i64);
        self.entries.insert(
            key.to_string(),
            StoredValue {
                bytes: value,
                expires_at_ms,
            },
        );
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<usize, StoreError> {
        self.ensure_open()?;
        Ok(keys
            .iter()
            .filter(|k| self.entries.remove(k.as_str()).is_some())
            .count())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        self.ensure_open()?;
        let now = self.clock.now_ms();
        Ok(self
            .entries
            .iter()
            .filter(|e| !e.value().is_expired(now) && glob_match(pattern, e.key()))
            .map(|e| e.key().clone())
            .collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.ensure_open()
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
