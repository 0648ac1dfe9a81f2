//! # Position Source Traits
//!
//! Capabilities the processors call to reach the outside world. Protocol-specific
//! scraping lives behind [`PositionSource`] (one implementation per protocol);
//! prices and TVL come from a [`MarketDataSource`].
//!
//! ## Adding a New Protocol
//!
//! 1. Implement [`PositionSource`] for the protocol
//! 2. Register it in the [`SourceRegistry`]; registration order is the ranking
//!    quick scans use to pick their top-K protocols
//!
//! ## Example
//!
//! ```rust,no_run
//! use lp_scan_engine::position_source::PositionSource;
//! use lp_scan_engine::types::LpPosition;
//! use async_trait::async_trait;
//! use anyhow::Result;
//!
//! struct MyProtocol;
//!
//! #[async_trait]
//! impl PositionSource for MyProtocol {
//!     fn protocol(&self) -> &str {
//!         "my-protocol"
//!     }
//!
//!     fn supports_chain(&self, chain: &str) -> bool {
//!         chain == "ethereum"
//!     }
//!
//!     async fn fetch_positions(&self, wallet: &str, chain: &str) -> Result<Vec<LpPosition>> {
//!         // query the protocol's subgraph / contracts
//!         Ok(vec![])
//!     }
//! }
//! ```

use crate::types::LpPosition;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Fetches a wallet's LP positions on one protocol.
#[async_trait]
pub trait PositionSource: Send + Sync {
    /// Protocol name as used in cache keys (`uniswap-v3`, `curve`, ...)
    fn protocol(&self) -> &str;

    fn supports_chain(&self, chain: &str) -> bool;

    async fn fetch_positions(&self, wallet: &str, chain: &str) -> Result<Vec<LpPosition>>;
}

/// Token prices and protocol TVL.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn token_price(&self, token: &str, chain: &str) -> Result<f64>;

    async fn protocol_tvl(&self, protocol: &str, chain: &str) -> Result<f64>;
}

/// Ordered set of protocol sources plus the market data source.
#[derive(Clone)]
pub struct SourceRegistry {
    sources: Vec<Arc<dyn PositionSource>>,
    market: Arc<dyn MarketDataSource>,
}

impl SourceRegistry {
    pub fn new(market: Arc<dyn MarketDataSource>) -> Self {
        Self {
            sources: Vec::new(),
            market,
        }
    }

    /// Appends a source. A source for an already registered protocol replaces it in place.
    pub fn register(&mut self, source: Arc<dyn PositionSource>) -> &mut Self {
        match self.sources.iter().position(|s| s.protocol() == source.protocol()) {
            Some(i) => self.sources[i] = source,
            None => self.sources.push(source),
        }
        self
    }

    pub fn with_source(mut self, source: Arc<dyn PositionSource>) -> Self {
        self.register(source);
        self
    }

    pub fn get(&self, protocol: &str) -> Option<Arc<dyn PositionSource>> {
        self.sources.iter().find(|s| s.protocol() == protocol).cloned()
    }

    /// Sources supporting `chain`, in registration order.
    pub fn for_chain(&self, chain: &str) -> Vec<Arc<dyn PositionSource>> {
        self.sources
            .iter()
            .filter(|s| s.supports_chain(chain))
            .cloned()
            .collect()
    }

    /// Resolves an explicit protocol list for `chain`. Unknown or unsupported names are
    /// returned separately so callers can report them.
    pub fn resolve(&self, chain: &str, protocols: Option<&[String]>) -> (Vec<Arc<dyn PositionSource>>, Vec<String>) {
        let Some(names) = protocols else {
            return (self.for_chain(chain), Vec::new());
        };
        let mut found = Vec::new();
        let mut missing = Vec::new();
        for name in names {
            match self.get(name) {
                Some(s) if s.supports_chain(chain) => found.push(s),
                _ => missing.push(name.clone()),
            }
        }
        (found, missing)
    }

    pub fn protocols(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.protocol().to_string()).collect()
    }

    pub fn market(&self) -> Arc<dyn MarketDataSource> {
        self.market.clone()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    struct Named(&'static str, &'static [&'static str]);

    #[async_trait]
    impl PositionSource for Named {
        fn protocol(&self) -> &str {
            self.0
        }
        fn supports_chain(&self, chain: &str) -> bool {
            self.1.contains(&chain)
        }
        async fn fetch_positions(&self, _wallet: &str, _chain: &str) -> Result<Vec<LpPosition>> {
            Ok(vec![])
        }
    }

    struct NoMarket;

    #[async_trait]
    impl MarketDataSource for NoMarket {
        async fn token_price(&self, token: &str, _chain: &str) -> Result<f64> {
            bail!("no price for {}", token)
        }
        async fn protocol_tvl(&self, protocol: &str, _chain: &str) -> Result<f64> {
            bail!("no tvl for {}", protocol)
        }
    }

    #[test]
    fn test_registry_keeps_order_and_filters_chain() {
        let registry = SourceRegistry::new(Arc::new(NoMarket))
            .with_source(Arc::new(Named("uniswap-v3", &["ethereum", "base"])))
            .with_source(Arc::new(Named("curve", &["ethereum"])))
            .with_source(Arc::new(Named("aerodrome", &["base"])));

        let base: Vec<String> = registry.for_chain("base").iter().map(|s| s.protocol().to_string()).collect();
        assert_eq!(base, vec!["uniswap-v3", "aerodrome"]);

        let (found, missing) = registry.resolve("ethereum", Some(&["curve".to_string(), "aerodrome".to_string()]));
        assert_eq!(found.len(), 1);
        assert_eq!(missing, vec!["aerodrome".to_string()]);
    }

    #[test]
    fn test_register_replaces_same_protocol() {
        let mut registry = SourceRegistry::new(Arc::new(NoMarket));
        registry.register(Arc::new(Named("curve", &["ethereum"])));
        registry.register(Arc::new(Named("curve", &["base"])));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("curve").is_some_and(|s| s.supports_chain("base")));
    }
}
