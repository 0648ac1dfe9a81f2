// Redis Store - CacheStore backed by a Redis ConnectionManager
// Keys are written with SET EX; listing uses SCAN MATCH instead of KEYS.

use super::{CacheStore, StoreError};
use async_trait::async_trait;
use log::{debug, info, warn};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;

/// Configuration for the Redis connection.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    pub url: String,
    pub connect_retries: usize,
    pub connect_backoff_ms: u64,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connect_retries: 5,
            connect_backoff_ms: 200,
        }
    }
}

pub struct RedisStore {
    conn: ConnectionManager,
    url: String,
    closed: AtomicBool,
}

impl RedisStore {
    /// Connects with bounded exponential retry.
    pub async fn connect(config: RedisStoreConfig) -> Result<Self, StoreError> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| StoreError::Unavailable(format!("invalid redis url: {}", e)))?;

        let strategy = ExponentialBackoff::from_millis(config.connect_backoff_ms.max(1))
            .max_delay(Duration::from_secs(10))
            .take(config.connect_retries);

        let conn = Retry::spawn(strategy, || {
            let client = client.clone();
            async move {
                ConnectionManager::new(client).await.map_err(|e| {
                    warn!("⚠️ Redis connect attempt failed: {}", e);
                    e
                })
            }
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("failed to connect to redis: {}", e)))?;

        info!("✅ Redis store connected to {}", config.url);
        Ok(Self {
            conn,
            url: config.url,
            closed: AtomicBool::new(false),
        })
    }

    fn conn(&self) -> Result<ConnectionManager, StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(self.conn.clone())
    }
}

fn unavailable(op: &str, e: redis::RedisError) -> StoreError {
    StoreError::Unavailable(format!("redis {} failed: {}", op, e))
}

#[async_trait]
impl CacheStore for RedisStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.conn()?;
        conn.get(key).await.map_err(|e| unavailable("GET", e))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        match ttl {
            Some(ttl) => {
                let secs = ttl.as_secs().max(1);
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("EX")
                    .arg(secs)
                    .query_async::<_, ()>(&mut conn)
                    .await
                    .map_err(|e| unavailable("SET EX", e))
            }
            None => conn
                .set::<_, _, ()>(key, value)
                .await
                .map_err(|e| unavailable("SET", e)),
        }
    }

    async fn delete(&self, keys: &[String]) -> Result<usize, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn()?;
        conn.del::<_, usize>(keys).await.map_err(|e| unavailable("DEL", e))
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn()?;
        let mut iter: redis::AsyncIter<String> = conn
            .scan_match(pattern)
            .await
            .map_err(|e| unavailable("SCAN", e))?;
        let mut out = Vec::new();
        while let Some(key) = iter.next_item().await {
            out.push(key);
        }
        debug!("🔑 SCAN {} matched {} keys", pattern, out.len());
        Ok(out)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| unavailable("PING", e))?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(StoreError::Unavailable(format!("unexpected PING reply: {}", pong)))
        }
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::Release);
        info!("🔌 Redis store {} closed", self.url);
        Ok(())
    }
}
