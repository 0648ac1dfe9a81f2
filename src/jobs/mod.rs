//! # Job Definitions
//!
//! Typed payload/result contracts, retry presets and the job record shared by the
//! queue manager and the processors. Pure data: nothing here performs I/O.
//!
//! Every kind runs on its own queue by default, named after the kind
//! (`wallet-scan`, `price-refresh`, ...), so each kind is an independent
//! failure domain.

pub mod error;
pub mod job;
pub mod options;
pub mod payloads;
pub mod results;

pub use error::JobError;
pub use job::{Job, JobHandle, JobState};
pub use options::{BackoffPolicy, DefaultJobOptions, JobOptions, RateLimit, RepeatOptions, RetryPreset};
pub use payloads::JobPayload;
pub use results::JobOutput;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Processor family a kind belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobFamily {
    Scan,
    Refresh,
    Analytics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    WalletScan,
    ProtocolScan,
    QuickScan,
    BulkScan,
    PriceRefresh,
    PositionRefresh,
    ProtocolTvlRefresh,
    CacheWarmup,
    StaleDataCleanup,
    PortfolioAnalytics,
    ProtocolAnalytics,
    YieldOptimization,
    RiskAnalysis,
    HistoricalPerformance,
}

impl JobKind {
    pub const ALL: [JobKind; 14] = [
        JobKind::WalletScan,
        JobKind::ProtocolScan,
        JobKind::QuickScan,
        JobKind::BulkScan,
        JobKind::PriceRefresh,
        JobKind::PositionRefresh,
        JobKind::ProtocolTvlRefresh,
        JobKind::CacheWarmup,
        JobKind::StaleDataCleanup,
        JobKind::PortfolioAnalytics,
        JobKind::ProtocolAnalytics,
        JobKind::YieldOptimization,
        JobKind::RiskAnalysis,
        JobKind::HistoricalPerformance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::WalletScan => "wallet-scan",
            JobKind::ProtocolScan => "protocol-scan",
            JobKind::QuickScan => "quick-scan",
            JobKind::BulkScan => "bulk-scan",
            JobKind::PriceRefresh => "price-refresh",
            JobKind::PositionRefresh => "position-refresh",
            JobKind::ProtocolTvlRefresh => "protocol-tvl-refresh",
            JobKind::CacheWarmup => "cache-warmup",
            JobKind::StaleDataCleanup => "stale-data-cleanup",
            JobKind::PortfolioAnalytics => "portfolio-analytics",
            JobKind::ProtocolAnalytics => "protocol-analytics",
            JobKind::YieldOptimization => "yield-optimization",
            JobKind::RiskAnalysis => "risk-analysis",
            JobKind::HistoricalPerformance => "historical-performance",
        }
    }

    /// Queue that serves this kind unless configured otherwise.
    pub fn default_queue(&self) -> &'static str {
        self.as_str()
    }

    pub fn family(&self) -> JobFamily {
        match self {
            JobKind::WalletScan | JobKind::ProtocolScan | JobKind::QuickScan | JobKind::BulkScan => {
                JobFamily::Scan
            }
            JobKind::PriceRefresh
            | JobKind::PositionRefresh
            | JobKind::ProtocolTvlRefresh
            | JobKind::CacheWarmup
            | JobKind::StaleDataCleanup => JobFamily::Refresh,
            JobKind::PortfolioAnalytics
            | JobKind::ProtocolAnalytics
            | JobKind::YieldOptimization
            | JobKind::RiskAnalysis
            | JobKind::HistoricalPerformance => JobFamily::Analytics,
        }
    }

    /// Retry and timeout preset applied when neither the caller nor the queue overrides it.
    pub fn retry_preset(&self) -> RetryPreset {
        match self {
            JobKind::WalletScan | JobKind::ProtocolScan => RetryPreset {
                attempts: 3,
                backoff: BackoffPolicy::Exponential { delay_ms: 2_000 },
                timeout_ms: 60_000,
                priority: 5,
            },
            JobKind::QuickScan => RetryPreset {
                attempts: 2,
                backoff: BackoffPolicy::Fixed { delay_ms: 1_000 },
                timeout_ms: 15_000,
                priority: 10,
            },
            JobKind::BulkScan => RetryPreset {
                attempts: 2,
                backoff: BackoffPolicy::Exponential { delay_ms: 5_000 },
                timeout_ms: 600_000,
                priority: 0,
            },
            JobKind::PriceRefresh | JobKind::ProtocolTvlRefresh | JobKind::PositionRefresh => {
                RetryPreset {
                    attempts: 5,
                    backoff: BackoffPolicy::Exponential { delay_ms: 1_000 },
                    timeout_ms: 60_000,
                    priority: 5,
                }
            }
            JobKind::CacheWarmup => RetryPreset {
                attempts: 2,
                backoff: BackoffPolicy::Fixed { delay_ms: 10_000 },
                timeout_ms: 300_000,
                priority: 0,
            },
            JobKind::StaleDataCleanup => RetryPreset {
                attempts: 1,
                backoff: BackoffPolicy::Fixed { delay_ms: 60_000 },
                timeout_ms: 300_000,
                priority: 0,
            },
            _ => RetryPreset {
                attempts: 2,
                backoff: BackoffPolicy::Fixed { delay_ms: 5_000 },
                timeout_ms: 120_000,
                priority: 1,
            },
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown job kind: {0}")]
pub struct UnknownJobKind(pub String);

impl FromStr for JobKind {
    type Err = UnknownJobKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| UnknownJobKind(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_round_trip() {
        for kind in JobKind::ALL {
            assert_eq!(kind.as_str().parse::<JobKind>().unwrap(), kind);
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
        assert!("nope".parse::<JobKind>().is_err());
    }

    #[test]
    fn test_every_preset_allows_at_least_one_attempt() {
        for kind in JobKind::ALL {
            assert!(kind.retry_preset().attempts >= 1, "{}", kind);
        }
        assert_eq!(JobKind::RiskAnalysis.family(), JobFamily::Analytics);
        assert_eq!(JobKind::StaleDataCleanup.family(), JobFamily::Refresh);
    }
}
