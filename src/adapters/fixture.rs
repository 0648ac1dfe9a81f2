//! JSON fixture adapter
//!
//! Serves positions, prices and TVL from a static file so the runner can be exercised
//! locally without reaching any protocol. File shape:
//!
//! ```json
//! {
//!   "protocols": [{ "name": "uniswap-v3", "chains": ["ethereum", "base"] }],
//!   "positions": { "0xabc": [ { "id": "1", "protocol": "uniswap-v3", "chain": "ethereum", ... } ] },
//!   "prices": { "ethereum": { "WETH": 3150.0 } },
//!   "tvl": { "ethereum": { "uniswap-v3": 4200000000.0 } }
//! }
//! ```

use crate::position_source::{MarketDataSource, PositionSource, SourceRegistry};
use crate::types::LpPosition;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize)]
pub struct FixtureProtocolSpec {
    pub name: String,
    pub chains: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FixtureData {
    pub protocols: Vec<FixtureProtocolSpec>,
    /// Wallet address (any case) -> positions across protocols and chains
    pub positions: HashMap<String, Vec<LpPosition>>,
    /// chain -> token -> USD price
    pub prices: HashMap<String, HashMap<String, f64>>,
    /// chain -> protocol -> TVL in USD
    pub tvl: HashMap<String, HashMap<String, f64>>,
}

/// Market data half of a fixture file; also hands out the per-protocol sources.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    data: Arc<FixtureData>,
}

impl FixtureSource {
    pub fn from_data(mut data: FixtureData) -> Self {
        data.positions = data
            .positions
            .into_iter()
            .map(|(wallet, positions)| (wallet.to_lowercase(), positions))
            .collect();
        Self { data: Arc::new(data) }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading fixture file {}", path.display()))?;
        let data: FixtureData = serde_json::from_str(&raw)
            .with_context(|| format!("parsing fixture file {}", path.display()))?;
        Ok(Self::from_data(data))
    }

    pub fn protocols(&self) -> Vec<FixtureProtocol> {
        self.data
            .protocols
            .iter()
            .map(|p| FixtureProtocol {
                name: p.name.clone(),
                chains: p.chains.clone(),
                data: self.data.clone(),
            })
            .collect()
    }

    /// Registry with one source per fixture protocol, in file order.
    pub fn into_registry(self) -> SourceRegistry {
        let protocols = self.protocols();
        let mut registry = SourceRegistry::new(Arc::new(self));
        for p in protocols {
            registry.register(Arc::new(p));
        }
        registry
    }
}

#[async_trait]
impl MarketDataSource for FixtureSource {
    async fn token_price(&self, token: &str, chain: &str) -> Result<f64> {
        self.data
            .prices
            .get(chain)
            .and_then(|m| m.get(token))
            .copied()
            .ok_or_else(|| anyhow!("no fixture price for {} on {}", token, chain))
    }

    async fn protocol_tvl(&self, protocol: &str, chain: &str) -> Result<f64> {
        self.data
            .tvl
            .get(chain)
            .and_then(|m| m.get(protocol))
            .copied()
            .ok_or_else(|| anyhow!("no fixture tvl for {} on {}", protocol, chain))
    }
}

#[derive(Debug, Clone)]
pub struct FixtureProtocol {
    name: String,
    chains: Vec<String>,
    data: Arc<FixtureData>,
}

#[async_trait]
impl PositionSource for FixtureProtocol {
    fn protocol(&self) -> &str {
        &self.name
    }

    fn supports_chain(&self, chain: &str) -> bool {
        self.chains.iter().any(|c| c == chain)
    }

    async fn fetch_positions(&self, wallet: &str, chain: &str) -> Result<Vec<LpPosition>> {
        Ok(self
            .data
            .positions
            .get(&wallet.to_lowercase())
            .map(|all| {
                all.iter()
                    .filter(|p| p.protocol == self.name && p.chain == chain)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const FIXTURE: &str = r#"{
        "protocols": [
            {"name": "uniswap-v3", "chains": ["ethereum"]},
            {"name": "curve", "chains": ["ethereum", "arbitrum"]}
        ],
        "positions": {
            "0xABC": [
                {"id": "1", "protocol": "uniswap-v3", "chain": "ethereum", "pool": "WETH/USDC",
                 "token0": {"symbol": "WETH", "amount": 1.0, "value_usd": 3000.0},
                 "token1": {"symbol": "USDC", "amount": 3000.0, "value_usd": 3000.0},
                 "value_usd": 6000.0, "fees_earned_usd": 12.5, "apr": 18.0, "in_range": true},
                {"id": "2", "protocol": "curve", "chain": "arbitrum", "pool": "3pool",
                 "token0": {"symbol": "USDC", "amount": 500.0, "value_usd": 500.0},
                 "token1": {"symbol": "USDT", "amount": 500.0, "value_usd": 500.0},
                 "value_usd": 1000.0, "fees_earned_usd": 0.4, "apr": 3.2}
            ]
        },
        "prices": {"ethereum": {"WETH": 3000.0}},
        "tvl": {"ethereum": {"curve": 1500000000.0}}
    }"#;

    #[tokio::test]
    async fn test_load_fixture_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(FIXTURE.as_bytes()).unwrap();

        let source = FixtureSource::load(file.path()).unwrap();
        assert_eq!(source.token_price("WETH", "ethereum").await.unwrap(), 3000.0);
        assert!(source.token_price("WETH", "base").await.is_err());
        assert_eq!(source.protocol_tvl("curve", "ethereum").await.unwrap(), 1.5e9);

        let registry = source.into_registry();
        assert_eq!(registry.protocols(), vec!["uniswap-v3", "curve"]);

        let curve = registry.get("curve").unwrap();
        let on_arb = curve.fetch_positions("0xabc", "arbitrum").await.unwrap();
        assert_eq!(on_arb.len(), 1);
        assert_eq!(on_arb[0].in_range, None);
        assert!(curve.fetch_positions("0xabc", "ethereum").await.unwrap().is_empty());
    }

    #[test]
    fn test_missing_file_has_context() {
        let err = FixtureSource::load("/nonexistent/fixtures.json").unwrap_err();
        assert!(format!("{:#}", err).contains("reading fixture file"));
    }
}
