//! # Cache Store
//!
//! Shared key-value store with expiry. It backs both the cache layer (cached scan,
//! price and analytics entries) and the queue broker (job snapshots).
//!
//! Two backends are provided:
//!
//! - [`MemoryStore`]: in-process `DashMap` store, default for single-node runs and tests
//! - [`RedisStore`]: Redis backend (optional, feature-gated behind `redis`)
//!
//! Components never talk to a concrete backend; they receive an `Arc<dyn CacheStore>`
//! at construction time so several isolated instances can coexist in one process.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use async_trait::async_trait;
use std::time::Duration;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

/// Errors raised by a cache store backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("cache store unavailable: {0}")]
    Unavailable(String),
    #[error("cache store is closed")]
    Closed,
}

/// Async key-value store with per-key expiry and glob key listing.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Short backend name used in logs and health reports.
    fn backend(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Stores `value` under `key`; `ttl = None` keeps the key until deleted.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Deletes the given keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> Result<usize, StoreError>;

    /// Lists live keys matching a glob pattern (`*` and `?`).
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;

    async fn close(&self) -> Result<(), StoreError>;
}

/// Glob match supporting `*` (any run) and `?` (any single char).
pub fn glob_match(pattern: &str, candidate: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let c: Vec<char> = candidate.chars().collect();
    let (mut pi, mut ci) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;

    while ci < c.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == c[ci]) {
            pi += 1;
            ci += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = ci;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ci = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
