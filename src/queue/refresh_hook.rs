use super::manager::QueueManager;
use super::QueueError;
use crate::cache_keys::{self, ParsedKey};
use crate::cache_layer::RefreshHook;
use crate::jobs::payloads::{
    HistoricalPerformancePayload, PortfolioAnalyticsPayload, PriceRefreshPayload, ProtocolAnalyticsPayload,
    ProtocolScanPayload, ProtocolTvlRefreshPayload, RiskAnalysisPayload, WalletScanPayload, YieldOptimizationPayload,
};
use crate::jobs::{JobOptions, JobPayload};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::Weak;
use tracing::debug;

/// Job that recomputes the entry stored under a parsed key.
pub fn refresh_payload(key: ParsedKey) -> JobPayload {
    match key {
        ParsedKey::Scan { wallet, chain } => JobPayload::WalletScan(WalletScanPayload {
            wallet,
            chain,
            protocols: None,
            refresh: true,
        }),
        ParsedKey::Positions { wallet, protocol, chain } => JobPayload::ProtocolScan(ProtocolScanPayload {
            wallet,
            chain,
            protocol,
            refresh: true,
        }),
        ParsedKey::Price { token, chain } => JobPayload::PriceRefresh(PriceRefreshPayload {
            tokens: vec![token],
            chains: vec![chain],
        }),
        ParsedKey::Tvl { protocol, chain } => JobPayload::ProtocolTvlRefresh(ProtocolTvlRefreshPayload {
            protocols: vec![protocol],
            chains: vec![chain],
        }),
        ParsedKey::Analytics { wallet, chain } => {
            JobPayload::PortfolioAnalytics(PortfolioAnalyticsPayload { wallet, chain })
        }
        ParsedKey::ProtocolAnalytics { protocol, chain } => {
            JobPayload::ProtocolAnalytics(ProtocolAnalyticsPayload { protocol, chain })
        }
        ParsedKey::Optimization { wallet, chain } => JobPayload::YieldOptimization(YieldOptimizationPayload {
            wallet,
            chain,
            risk_tolerance: Default::default(),
            min_apr_gain: None,
        }),
        ParsedKey::Risk { wallet, chain } => JobPayload::RiskAnalysis(RiskAnalysisPayload { wallet, chain }),
        ParsedKey::History {
            wallet,
            chain,
            start,
            end,
        } => JobPayload::HistoricalPerformance(HistoricalPerformancePayload {
            wallet,
            chain,
            start,
            end,
        }),
    }
}

/// Turns stale-while-revalidate triggers into deduplicated refresh jobs.
///
/// Holds the manager weakly: the manager owns the processors, which own the cache
/// layer this hook is installed on.
pub struct QueueRefreshHook {
    manager: Weak<QueueManager>,
}

impl QueueRefreshHook {
    pub fn new(manager: Weak<QueueManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl RefreshHook for QueueRefreshHook {
    async fn refresh(&self, key: &str) -> Result<()> {
        let manager = self
            .manager
            .upgrade()
            .ok_or_else(|| anyhow!("queue manager dropped"))?;
        let parsed = cache_keys::parse(key).ok_or_else(|| anyhow!("no refresh job for key {}", key))?;
        let payload = refresh_payload(parsed);
        let queue = payload.kind().default_queue();
        let options = JobOptions::new().with_job_id(format!("refresh:{}", key));

        match manager.add_job(queue, payload, options).await {
            Ok(handle) => {
                debug!(key = %key, job_id = %handle.id, queue = %queue, "refresh job enqueued");
                Ok(())
            }
            Err(QueueError::DuplicateJob { .. }) => {
                debug!(key = %key, "refresh already pending");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
