use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One side of a liquidity position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenAmount {
    pub symbol: String,
    #[serde(default)]
    pub address: Option<String>,
    pub amount: f64,
    pub value_usd: f64,
}

impl TokenAmount {
    fn matches(&self, token: &str) -> bool {
        self.symbol.eq_ignore_ascii_case(token)
            || self
                .address
                .as_deref()
                .is_some_and(|a| a.eq_ignore_ascii_case(token))
    }
}

/// A liquidity-provider position as reported by a protocol source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LpPosition {
    pub id: String,
    pub protocol: String,
    pub chain: String,
    pub pool: String,
    pub token0: TokenAmount,
    pub token1: TokenAmount,
    pub value_usd: f64,
    pub fees_earned_usd: f64,
    /// Annualized yield in percent (12.5 = 12.5%)
    pub apr: f64,
    #[serde(default)]
    pub in_range: Option<bool>,
    #[serde(default)]
    pub deposited_value_usd: Option<f64>,
    #[serde(default)]
    pub opened_at: Option<DateTime<Utc>>,
}

impl LpPosition {
    /// True when either side of the pair is `token` (symbol or address, case-insensitive).
    pub fn references_token(&self, token: &str) -> bool {
        self.token0.matches(token) || self.token1.matches(token)
    }
}

/// Value-weighted APR; falls back to the plain mean when every position is worth zero.
pub(crate) fn weighted_apr<'a>(positions: impl Iterator<Item = &'a LpPosition> + Clone) -> f64 {
    let total_value: f64 = positions.clone().map(|p| p.value_usd).sum();
    if total_value > 0.0 {
        return positions.map(|p| p.apr * p.value_usd).sum::<f64>() / total_value;
    }
    let (sum, n) = positions.fold((0.0, 0usize), |(s, n), p| (s + p.apr, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

/// Positions found on one protocol for one wallet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolScanSummary {
    pub protocol: String,
    pub chain: String,
    pub positions: Vec<LpPosition>,
    pub total_value: f64,
    pub total_positions: usize,
    pub total_fees_earned: f64,
    pub avg_apr: f64,
}

impl ProtocolScanSummary {
    pub fn from_positions(protocol: &str, chain: &str, positions: Vec<LpPosition>) -> Self {
        Self {
            protocol: protocol.to_string(),
            chain: chain.to_string(),
            total_value: positions.iter().map(|p| p.value_usd).sum(),
            total_positions: positions.len(),
            total_fees_earned: positions.iter().map(|p| p.fees_earned_usd).sum(),
            avg_apr: weighted_apr(positions.iter()),
            positions,
        }
    }
}

/// Cached aggregate of a wallet scan (`scan:<wallet>:<chain>`).
///
/// Totals are always derived from the per-protocol summaries, so
/// `total_positions == Σ protocol.total_positions` and
/// `total_value == Σ protocol.total_value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletScanAggregate {
    pub wallet: String,
    pub chain: String,
    pub protocols: Vec<ProtocolScanSummary>,
    pub total_value: f64,
    pub total_positions: usize,
    pub total_fees_earned: f64,
    pub avg_apr: f64,
    pub scanned_at: DateTime<Utc>,
    /// Protocols that failed during the scan, as `<protocol>: <error>`. Served with
    /// cached reads so a partial scan stays visibly partial.
    #[serde(default)]
    pub errors: Vec<String>,
}

impl WalletScanAggregate {
    pub fn aggregate(wallet: &str, chain: &str, mut protocols: Vec<ProtocolScanSummary>) -> Self {
        // Children finish in any order; keep the cached shape stable.
        protocols.sort_by(|a, b| a.protocol.cmp(&b.protocol));
        Self {
            wallet: wallet.to_string(),
            chain: chain.to_string(),
            total_value: protocols.iter().map(|p| p.total_value).sum(),
            total_positions: protocols.iter().map(|p| p.total_positions).sum(),
            total_fees_earned: protocols.iter().map(|p| p.total_fees_earned).sum(),
            avg_apr: weighted_apr(protocols.iter().flat_map(|p| p.positions.iter())),
            protocols,
            scanned_at: Utc::now(),
            errors: Vec::new(),
        }
    }

    pub fn with_errors(mut self, errors: Vec<String>) -> Self {
        self.errors = errors;
        self
    }

    pub fn is_partial(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn positions(&self) -> impl Iterator<Item = &LpPosition> + Clone {
        self.protocols.iter().flat_map(|p| p.positions.iter())
    }

    pub fn protocol_names(&self) -> Vec<String> {
        self.protocols.iter().map(|p| p.protocol.clone()).collect()
    }

    pub fn holds_token(&self, token: &str) -> bool {
        self.positions().any(|p| p.references_token(token))
    }

    pub fn holds_protocol(&self, protocol: &str) -> bool {
        self.protocols
            .iter()
            .any(|p| p.protocol == protocol && p.total_positions > 0)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn position(id: &str, protocol: &str, value: f64, fees: f64, apr: f64) -> LpPosition {
        LpPosition {
            id: id.to_string(),
            protocol: protocol.to_string(),
            chain: "ethereum".to_string(),
            pool: format!("{}-WETH-USDC", protocol),
            token0: TokenAmount {
                symbol: "WETH".to_string(),
                address: None,
                amount: 1.0,
                value_usd: value / 2.0,
            },
            token1: TokenAmount {
                symbol: "USDC".to_string(),
                address: None,
                amount: value / 2.0,
                value_usd: value / 2.0,
            },
            value_usd: value,
            fees_earned_usd: fees,
            apr,
            in_range: Some(true),
            deposited_value_usd: None,
            opened_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::position;
    use super::*;

    #[test]
    fn test_aggregate_totals_match_protocol_sums() {
        let a = ProtocolScanSummary::from_positions(
            "uniswap-v3",
            "ethereum",
            vec![position("1", "uniswap-v3", 1000.0, 5.0, 10.0), position("2", "uniswap-v3", 3000.0, 1.0, 20.0)],
        );
        let b = ProtocolScanSummary::from_positions("curve", "ethereum", vec![position("3", "curve", 500.0, 2.5, 4.0)]);
        let agg = WalletScanAggregate::aggregate("0xabc", "ethereum", vec![a.clone(), b.clone()]);

        assert_eq!(agg.total_positions, a.total_positions + b.total_positions);
        assert!((agg.total_value - (a.total_value + b.total_value)).abs() < 1e-9);
        assert!((agg.total_fees_earned - 8.5).abs() < 1e-9);
        // (1000*10 + 3000*20 + 500*4) / 4500
        assert!((agg.avg_apr - 72_000.0 / 4_500.0).abs() < 1e-9);
        assert_eq!(agg.protocols[0].protocol, "curve");
    }

    #[test]
    fn test_aggregate_without_errors_field_still_decodes() {
        let agg = WalletScanAggregate::aggregate("0xabc", "base", vec![]).with_errors(vec!["curve: 503".to_string()]);
        assert!(agg.is_partial());

        let mut json = serde_json::to_value(&agg).unwrap();
        json.as_object_mut().unwrap().remove("errors");
        let older: WalletScanAggregate = serde_json::from_value(json).unwrap();
        assert!(older.errors.is_empty());
        assert!(!older.is_partial());
    }

    #[test]
    fn test_references_token() {
        let mut p = position("1", "uniswap-v3", 10.0, 0.0, 0.0);
        p.token1.address = Some("0xA0b8".to_string());
        assert!(p.references_token("weth"));
        assert!(p.references_token("0xa0b8"));
        assert!(!p.references_token("DAI"));
    }

    #[test]
    fn test_empty_summary_has_zero_apr() {
        let s = ProtocolScanSummary::from_positions("curve", "base", vec![]);
        assert_eq!(s.avg_apr, 0.0);
        assert_eq!(s.total_positions, 0);
    }
}
