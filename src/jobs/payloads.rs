//! Per-kind job payloads.
//!
//! Fields added later must be optional (`#[serde(default)]`) so older producers
//! keep working.

use super::JobKind;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletScanPayload {
    pub wallet: String,
    pub chain: String,
    /// Restrict the scan to these protocols; all registered protocols otherwise
    #[serde(default)]
    pub protocols: Option<Vec<String>>,
    /// Bypass the cached aggregate
    #[serde(default)]
    pub refresh: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolScanPayload {
    pub wallet: String,
    pub chain: String,
    pub protocol: String,
    #[serde(default)]
    pub refresh: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuickScanPayload {
    pub wallet: String,
    pub chain: String,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkScanPayload {
    pub wallets: Vec<String>,
    pub chain: String,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub refresh: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRefreshPayload {
    pub tokens: Vec<String>,
    pub chains: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRefreshPayload {
    pub wallet: String,
    pub chain: String,
    #[serde(default)]
    pub protocols: Option<Vec<String>>,
    #[serde(default)]
    pub position_ids: Option<Vec<String>>,
    /// Re-fetch every registered protocol for the chain
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolTvlRefreshPayload {
    pub protocols: Vec<String>,
    pub chains: Vec<String>,
}

/// Empty lists fall back to the `[warmup]` settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheWarmupPayload {
    pub wallets: Vec<String>,
    pub protocols: Vec<String>,
    pub tokens: Vec<String>,
    pub chains: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaleDataCleanupPayload {
    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: u64,
    /// Key patterns to scan; every data namespace when absent
    #[serde(default)]
    pub patterns: Option<Vec<String>>,
    #[serde(default)]
    pub dry_run: bool,
}

fn default_max_age_hours() -> u64 {
    24
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioAnalyticsPayload {
    pub wallet: String,
    pub chain: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolAnalyticsPayload {
    pub protocol: String,
    pub chain: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTolerance {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YieldOptimizationPayload {
    pub wallet: String,
    pub chain: String,
    #[serde(default)]
    pub risk_tolerance: RiskTolerance,
    /// Minimum APR improvement (percentage points) worth suggesting
    #[serde(default)]
    pub min_apr_gain: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAnalysisPayload {
    pub wallet: String,
    pub chain: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalPerformancePayload {
    pub wallet: String,
    pub chain: String,
    /// Unix seconds
    pub start: i64,
    pub end: i64,
}

/// Typed payload; the variant selects the job kind and processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "kebab-case")]
pub enum JobPayload {
    WalletScan(WalletScanPayload),
    ProtocolScan(ProtocolScanPayload),
    QuickScan(QuickScanPayload),
    BulkScan(BulkScanPayload),
    PriceRefresh(PriceRefreshPayload),
    PositionRefresh(PositionRefreshPayload),
    ProtocolTvlRefresh(ProtocolTvlRefreshPayload),
    CacheWarmup(CacheWarmupPayload),
    StaleDataCleanup(StaleDataCleanupPayload),
    PortfolioAnalytics(PortfolioAnalyticsPayload),
    ProtocolAnalytics(ProtocolAnalyticsPayload),
    YieldOptimization(YieldOptimizationPayload),
    RiskAnalysis(RiskAnalysisPayload),
    HistoricalPerformance(HistoricalPerformancePayload),
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::WalletScan(_) => JobKind::WalletScan,
            JobPayload::ProtocolScan(_) => JobKind::ProtocolScan,
            JobPayload::QuickScan(_) => JobKind::QuickScan,
            JobPayload::BulkScan(_) => JobKind::BulkScan,
            JobPayload::PriceRefresh(_) => JobKind::PriceRefresh,
            JobPayload::PositionRefresh(_) => JobKind::PositionRefresh,
            JobPayload::ProtocolTvlRefresh(_) => JobKind::ProtocolTvlRefresh,
            JobPayload::CacheWarmup(_) => JobKind::CacheWarmup,
            JobPayload::StaleDataCleanup(_) => JobKind::StaleDataCleanup,
            JobPayload::PortfolioAnalytics(_) => JobKind::PortfolioAnalytics,
            JobPayload::ProtocolAnalytics(_) => JobKind::ProtocolAnalytics,
            JobPayload::YieldOptimization(_) => JobKind::YieldOptimization,
            JobPayload::RiskAnalysis(_) => JobKind::RiskAnalysis,
            JobPayload::HistoricalPerformance(_) => JobKind::HistoricalPerformance,
        }
    }

    /// Decodes an untyped payload (API boundary) for the given kind.
    pub fn from_json(kind: JobKind, value: serde_json::Value) -> Result<Self, serde_json::Error> {
        use serde_json::from_value as v;
        Ok(match kind {
            JobKind::WalletScan => JobPayload::WalletScan(v(value)?),
            JobKind::ProtocolScan => JobPayload::ProtocolScan(v(value)?),
            JobKind::QuickScan => JobPayload::QuickScan(v(value)?),
            JobKind::BulkScan => JobPayload::BulkScan(v(value)?),
            JobKind::PriceRefresh => JobPayload::PriceRefresh(v(value)?),
            JobKind::PositionRefresh => JobPayload::PositionRefresh(v(value)?),
            JobKind::ProtocolTvlRefresh => JobPayload::ProtocolTvlRefresh(v(value)?),
            JobKind::CacheWarmup => JobPayload::CacheWarmup(v(value)?),
            JobKind::StaleDataCleanup => JobPayload::StaleDataCleanup(v(value)?),
            JobKind::PortfolioAnalytics => JobPayload::PortfolioAnalytics(v(value)?),
            JobKind::ProtocolAnalytics => JobPayload::ProtocolAnalytics(v(value)?),
            JobKind::YieldOptimization => JobPayload::YieldOptimization(v(value)?),
            JobKind::RiskAnalysis => JobPayload::RiskAnalysis(v(value)?),
            JobKind::HistoricalPerformance => JobPayload::HistoricalPerformance(v(value)?),
        })
    }

    /// The payload body without the kind tag, as logged and mirrored.
    pub fn body(&self) -> serde_json::Value {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(mut map)) => map.remove("data").unwrap_or_default(),
            _ => serde_json::Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_applies_defaults() {
        let payload = JobPayload::from_json(
            JobKind::WalletScan,
            json!({"wallet": "0xabc", "chain": "ethereum"}),
        )
        .unwrap();
        assert_eq!(payload.kind(), JobKind::WalletScan);
        match payload {
            JobPayload::WalletScan(p) => {
                assert!(!p.refresh);
                assert!(p.protocols.is_none());
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_from_json_rejects_wrong_shape() {
        assert!(JobPayload::from_json(JobKind::PriceRefresh, json!({"wallet": "x"})).is_err());
    }

    #[test]
    fn test_cleanup_defaults_to_24h() {
        let payload = JobPayload::from_json(JobKind::StaleDataCleanup, json!({})).unwrap();
        let JobPayload::StaleDataCleanup(p) = payload else {
            panic!("wrong variant");
        };
        assert_eq!(p.max_age_hours, 24);
        assert!(!p.dry_run);
    }

    #[test]
    fn test_body_strips_tag() {
        let payload = JobPayload::RiskAnalysis(RiskAnalysisPayload {
            wallet: "0xabc".into(),
            chain: "base".into(),
        });
        assert_eq!(payload.body(), json!({"wallet": "0xabc", "chain": "base"}));
    }
}
