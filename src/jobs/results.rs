//! Per-kind job results. Every result carries `errors` and `duration_ms` so
//! partial failures are visible without failing the job.

use super::JobKind;
use crate::analytics::{
    HistoricalPerformance, PortfolioAnalytics, ProtocolAnalytics, RiskAssessment, YieldOptimization,
};
use crate::types::{LpPosition, WalletScanAggregate};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletScanResult {
    pub scan_results: WalletScanAggregate,
    /// Served from the cached aggregate
    pub cached: bool,
    pub positions_found: usize,
    pub protocols_scanned: usize,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolScanResult {
    pub protocol: String,
    pub chain: String,
    pub success: bool,
    pub positions: Vec<LpPosition>,
    #[serde(default)]
    pub error: Option<String>,
    pub cached: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuickScanResult {
    pub scan_results: WalletScanAggregate,
    pub positions_found: usize,
    pub protocols_scanned: usize,
    /// Protocols skipped or timed out under the quick-scan budget
    pub protocols_absent: Vec<String>,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkScanResult {
    pub wallets_requested: usize,
    pub wallets_scanned: usize,
    pub wallets_failed: usize,
    pub total_positions: usize,
    pub total_value: f64,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRefreshResult {
    pub prices_updated: usize,
    /// Prices whose value differed from the cached one
    pub prices_changed: usize,
    pub invalidated_keys: usize,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRefreshResult {
    pub positions_checked: usize,
    pub positions_updated: usize,
    pub protocols_refreshed: usize,
    pub invalidated_keys: usize,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolTvlRefreshResult {
    pub tvls_updated: usize,
    pub invalidated_keys: usize,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheWarmupResult {
    /// Entries already present and fresh
    pub cache_hits: usize,
    pub entries_warmed: usize,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaleDataCleanupResult {
    pub items_checked: usize,
    pub items_eligible: usize,
    pub items_removed: usize,
    /// Approximate bytes released
    pub space_freed: u64,
    pub dry_run: bool,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

/// Result wrapper shared by the analytics kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsResult<T> {
    pub analytics: T,
    pub cache_key: String,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "kebab-case")]
pub enum JobOutput {
    WalletScan(WalletScanResult),
    ProtocolScan(ProtocolScanResult),
    QuickScan(QuickScanResult),
    BulkScan(BulkScanResult),
    PriceRefresh(PriceRefreshResult),
    PositionRefresh(PositionRefreshResult),
    ProtocolTvlRefresh(ProtocolTvlRefreshResult),
    CacheWarmup(CacheWarmupResult),
    StaleDataCleanup(StaleDataCleanupResult),
    PortfolioAnalytics(AnalyticsResult<PortfolioAnalytics>),
    ProtocolAnalytics(AnalyticsResult<ProtocolAnalytics>),
    YieldOptimization(AnalyticsResult<YieldOptimization>),
    RiskAnalysis(AnalyticsResult<RiskAssessment>),
    HistoricalPerformance(AnalyticsResult<HistoricalPerformance>),
}

impl JobOutput {
    pub fn kind(&self) -> JobKind {
        match self {
            JobOutput::WalletScan(_) => JobKind::WalletScan,
            JobOutput::ProtocolScan(_) => JobKind::ProtocolScan,
            JobOutput::QuickScan(_) => JobKind::QuickScan,
            JobOutput::BulkScan(_) => JobKind::BulkScan,
            JobOutput::PriceRefresh(_) => JobKind::PriceRefresh,
            JobOutput::PositionRefresh(_) => JobKind::PositionRefresh,
            JobOutput::ProtocolTvlRefresh(_) => JobKind::ProtocolTvlRefresh,
            JobOutput::CacheWarmup(_) => JobKind::CacheWarmup,
            JobOutput::StaleDataCleanup(_) => JobKind::StaleDataCleanup,
            JobOutput::PortfolioAnalytics(_) => JobKind::PortfolioAnalytics,
            JobOutput::ProtocolAnalytics(_) => JobKind::ProtocolAnalytics,
            JobOutput::YieldOptimization(_) => JobKind::YieldOptimization,
            JobOutput::RiskAnalysis(_) => JobKind::RiskAnalysis,
            JobOutput::HistoricalPerformance(_) => JobKind::HistoricalPerformance,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        match self {
            JobOutput::WalletScan(r) => r.duration_ms,
            JobOutput::ProtocolScan(r) => r.duration_ms,
            JobOutput::QuickScan(r) => r.duration_ms,
            JobOutput::BulkScan(r) => r.duration_ms,
            JobOutput::PriceRefresh(r) => r.duration_ms,
            JobOutput::PositionRefresh(r) => r.duration_ms,
            JobOutput::ProtocolTvlRefresh(r) => r.duration_ms,
            JobOutput::CacheWarmup(r) => r.duration_ms,
            JobOutput::StaleDataCleanup(r) => r.duration_ms,
            JobOutput::PortfolioAnalytics(r) => r.duration_ms,
            JobOutput::ProtocolAnalytics(r) => r.duration_ms,
            JobOutput::YieldOptimization(r) => r.duration_ms,
            JobOutput::RiskAnalysis(r) => r.duration_ms,
            JobOutput::HistoricalPerformance(r) => r.duration_ms,
        }
    }

    pub fn errors(&self) -> &[String] {
        match self {
            JobOutput::WalletScan(r) => &r.errors,
            JobOutput::ProtocolScan(r) => r.error.as_slice(),
            JobOutput::QuickScan(r) => &r.errors,
            JobOutput::BulkScan(r) => &r.errors,
            JobOutput::PriceRefresh(r) => &r.errors,
            JobOutput::PositionRefresh(r) => &r.errors,
            JobOutput::ProtocolTvlRefresh(r) => &r.errors,
            JobOutput::CacheWarmup(r) => &r.errors,
            JobOutput::StaleDataCleanup(r) => &r.errors,
            JobOutput::PortfolioAnalytics(r) => &r.errors,
            JobOutput::ProtocolAnalytics(r) => &r.errors,
            JobOutput::YieldOptimization(r) => &r.errors,
            JobOutput::RiskAnalysis(r) => &r.errors,
            JobOutput::HistoricalPerformance(r) => &r.errors,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_scan_error_surfaces_in_errors() {
        let out = JobOutput::ProtocolScan(ProtocolScanResult {
            protocol: "curve".into(),
            chain: "ethereum".into(),
            success: false,
            positions: vec![],
            error: Some("rpc timeout".into()),
            cached: false,
            duration_ms: 12,
        });
        assert_eq!(out.kind(), JobKind::ProtocolScan);
        assert_eq!(out.errors(), &["rpc timeout".to_string()]);
        assert_eq!(out.duration_ms(), 12);
        assert_eq!(out.to_json()["kind"], "protocol-scan");
    }
}
