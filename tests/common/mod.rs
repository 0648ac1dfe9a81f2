//! Shared fakes for integration tests: deterministic position/market sources with
//! failure and latency injection, and a store whose writes can be switched off.

#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use lp_scan_engine::cache_layer::{CacheLayer, StrategyTable};
use lp_scan_engine::cache_store::{CacheStore, MemoryStore, StoreError};
use lp_scan_engine::clock::Clock;
use lp_scan_engine::invalidation::InvalidationManager;
use lp_scan_engine::position_source::{MarketDataSource, PositionSource, SourceRegistry};
use lp_scan_engine::processors::ProcessorDeps;
use lp_scan_engine::settings::{ProcessorSettings, WarmupSettings};
use lp_scan_engine::types::{LpPosition, TokenAmount};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const WALLET: &str = "0xw";
pub const CHAIN: &str = "ethereum";

pub fn position(id: &str, protocol: &str, token0: &str, token1: &str, value: f64, apr: f64) -> LpPosition {
    LpPosition {
        id: id.to_string(),
        protocol: protocol.to_string(),
        chain: CHAIN.to_string(),
        pool: format!("{}/{}", token0, token1),
        token0: TokenAmount {
            symbol: token0.to_string(),
            address: None,
            amount: 1.0,
            value_usd: value / 2.0,
        },
        token1: TokenAmount {
            symbol: token1.to_string(),
            address: None,
            amount: 1.0,
            value_usd: value / 2.0,
        },
        value_usd: value,
        fees_earned_usd: value / 100.0,
        apr,
        in_range: Some(true),
        deposited_value_usd: Some(value),
        opened_at: None,
    }
}

/// Protocol source serving a fixed position list per wallet.
pub struct FakeProtocol {
    name: String,
    positions: Mutex<HashMap<String, Vec<LpPosition>>>,
    fail: AtomicBool,
    delay: Mutex<Duration>,
    pub calls: AtomicUsize,
}

impl FakeProtocol {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            positions: Mutex::new(HashMap::new()),
            fail: AtomicBool::new(false),
            delay: Mutex::new(Duration::ZERO),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn with_positions(name: &str, wallet: &str, positions: Vec<LpPosition>) -> Arc<Self> {
        let p = Self::new(name);
        p.set_positions(wallet, positions);
        p
    }

    pub fn failing(name: &str) -> Arc<Self> {
        let p = Self::new(name);
        p.set_failing(true);
        p
    }

    pub fn set_positions(&self, wallet: &str, positions: Vec<LpPosition>) {
        self.positions.lock().unwrap().insert(wallet.to_string(), positions);
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PositionSource for FakeProtocol {
    fn protocol(&self) -> &str {
        &self.name
    }

    fn supports_chain(&self, chain: &str) -> bool {
        chain == CHAIN
    }

    async fn fetch_positions(&self, wallet: &str, _chain: &str) -> Result<Vec<LpPosition>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("{} upstream returned 503", self.name));
        }
        Ok(self.positions.lock().unwrap().get(wallet).cloned().unwrap_or_default())
    }
}

/// Market source backed by mutable maps; unknown items fail.
#[derive(Default)]
pub struct FakeMarket {
    prices: Mutex<HashMap<String, f64>>,
    tvl: Mutex<HashMap<String, f64>>,
}

impl FakeMarket {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_price(&self, token: &str, price: f64) {
        self.prices.lock().unwrap().insert(token.to_string(), price);
    }

    pub fn set_tvl(&self, protocol: &str, tvl: f64) {
        self.tvl.lock().unwrap().insert(protocol.to_string(), tvl);
    }
}

#[async_trait]
impl MarketDataSource for FakeMarket {
    async fn token_price(&self, token: &str, _chain: &str) -> Result<f64> {
        self.prices
            .lock()
            .unwrap()
            .get(token)
            .copied()
            .ok_or_else(|| anyhow!("no price for {}", token))
    }

    async fn protocol_tvl(&self, protocol: &str, _chain: &str) -> Result<f64> {
        self.tvl
            .lock()
            .unwrap()
            .get(protocol)
            .copied()
            .ok_or_else(|| anyhow!("no tvl for {}", protocol))
    }
}

/// Memory store whose operations fail while `down` is set.
pub struct FlakyStore {
    inner: MemoryStore,
    down: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStore::new(),
            down: AtomicBool::new(false),
        })
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStore for FlakyStore {
    fn backend(&self) -> &'static str {
        "flaky"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.check()?;
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, keys: &[String]) -> Result<usize, StoreError> {
        self.check()?;
        self.inner.delete(keys).await
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        self.check()?;
        self.inner.keys(pattern).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check()
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.inner.close().await
    }
}

/// Processor dependencies over a fresh store.
pub struct Harness {
    pub store: Arc<dyn CacheStore>,
    pub cache: Arc<CacheLayer>,
    pub invalidation: Arc<InvalidationManager>,
    pub deps: Arc<ProcessorDeps>,
}

impl Harness {
    pub fn new(protocols: Vec<Arc<FakeProtocol>>, market: Arc<FakeMarket>) -> Self {
        Self::with_store(Arc::new(MemoryStore::new()), None, protocols, market)
    }

    pub fn with_store(
        store: Arc<dyn CacheStore>,
        clock: Option<Arc<dyn Clock>>,
        protocols: Vec<Arc<FakeProtocol>>,
        market: Arc<FakeMarket>,
    ) -> Self {
        let cache = Arc::new(match clock {
            Some(clock) => CacheLayer::with_clock(store.clone(), StrategyTable::default(), clock),
            None => CacheLayer::new(store.clone(), StrategyTable::default()),
        });
        let invalidation = Arc::new(InvalidationManager::new(cache.clone()));
        let mut sources = SourceRegistry::new(market);
        for p in protocols {
            sources.register(p);
        }
        let settings = ProcessorSettings {
            fetch_timeout_ms: 2_000,
            ..Default::default()
        };
        let deps = Arc::new(ProcessorDeps {
            cache: cache.clone(),
            invalidation: invalidation.clone(),
            sources,
            settings,
            warmup: WarmupSettings::default(),
        });
        Self {
            store,
            cache,
            invalidation,
            deps,
        }
    }
}
