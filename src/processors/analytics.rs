//! Analytics family. Every job reads a required upstream cache entry and fails fast
//! with [`JobError::MissingDependency`] when it is absent, and stores its result under
//! the PERSISTENT strategy.
//!
//! Progress milestones follow the pipeline stages:
//!
//! | pct | reached after |
//! |-----|---------------|
//! | 20  | upstream entry loaded |
//! | 40  | upstream inspected (partial scans noted) or secondary inputs gathered |
//! | 60  | analytics computed |
//! | 80  | result serialized |
//! | 100 | result written to cache |

use super::{elapsed_ms, unexpected, JobContext, JobHandler, ProcessorDeps};
use crate::analytics;
use crate::cache_keys;
use crate::cache_layer::CacheStrategy;
use crate::jobs::payloads::{
    HistoricalPerformancePayload, PortfolioAnalyticsPayload, ProtocolAnalyticsPayload, RiskAnalysisPayload,
    YieldOptimizationPayload,
};
use crate::jobs::results::AnalyticsResult;
use crate::jobs::{JobError, JobKind, JobOutput, JobPayload};
use crate::types::{ProtocolTvl, WalletScanAggregate};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

const DEFAULT_MIN_APR_GAIN: f64 = 1.0;

pub struct AnalyticsProcessor {
    deps: Arc<ProcessorDeps>,
}

impl AnalyticsProcessor {
    pub fn new(deps: Arc<ProcessorDeps>) -> Self {
        Self { deps }
    }

    async fn wallet_scan(&self, wallet: &str, chain: &str) -> Result<WalletScanAggregate, JobError> {
        let key = cache_keys::scan(wallet, chain);
        self.deps
            .cache
            .get::<WalletScanAggregate>(&key, CacheStrategy::ReadHeavy)
            .await?
            .ok_or_else(|| JobError::missing(key, format!("run wallet-scan for {} on {} first", wallet, chain)))
    }

    /// Upstream scan errors carried into the analytics result. A partial scan still
    /// yields analytics, flagged as such.
    fn inspect(&self, ctx: &JobContext, scan: &WalletScanAggregate) -> Vec<String> {
        if scan.is_partial() {
            warn!(
                job_id = %ctx.job_id,
                wallet = %scan.wallet,
                chain = %scan.chain,
                missing = scan.errors.len(),
                "analytics computed from a partial wallet scan"
            );
        }
        let errors = scan.errors.iter().map(|e| format!("wallet scan: {}", e)).collect();
        ctx.progress(40);
        errors
    }

    async fn store<T: Serialize>(
        &self,
        ctx: &JobContext,
        key: String,
        analytics: T,
        errors: Vec<String>,
        started: Instant,
    ) -> Result<AnalyticsResult<T>, JobError> {
        let body = serde_json::to_value(&analytics)?;
        ctx.progress(80);
        self.deps.cache.set(&key, &body, CacheStrategy::Persistent).await?;
        ctx.progress(100);
        debug!(job_id = %ctx.job_id, key = %key, "analytics stored");
        Ok(AnalyticsResult {
            analytics,
            cache_key: key,
            errors,
            duration_ms: elapsed_ms(started),
        })
    }

    pub async fn portfolio(
        &self,
        ctx: &JobContext,
        p: &PortfolioAnalyticsPayload,
    ) -> Result<AnalyticsResult<analytics::PortfolioAnalytics>, JobError> {
        let started = Instant::now();
        ctx.progress(0);
        let scan = self.wallet_scan(&p.wallet, &p.chain).await?;
        ctx.progress(20);
        let errors = self.inspect(ctx, &scan);
        let summary = analytics::portfolio_summary(&scan);
        ctx.progress(60);
        self.store(ctx, cache_keys::analytics(&p.wallet, &p.chain), summary, errors, started)
            .await
    }

    pub async fn protocol(
        &self,
        ctx: &JobContext,
        p: &ProtocolAnalyticsPayload,
    ) -> Result<AnalyticsResult<analytics::ProtocolAnalytics>, JobError> {
        let started = Instant::now();
        ctx.progress(0);
        let tvl_key = cache_keys::tvl(&p.protocol, &p.chain);
        let tvl = self
            .deps
            .cache
            .get::<ProtocolTvl>(&tvl_key, CacheStrategy::FastAccess)
            .await?
            .ok_or_else(|| {
                JobError::missing(
                    tvl_key.clone(),
                    format!("run protocol-tvl-refresh for {} on {} first", p.protocol, p.chain),
                )
            })?;
        ctx.progress(20);

        let mut scans = Vec::new();
        let mut errors = Vec::new();
        for key in self.deps.cache.keys(&format!("{}:*:{}", cache_keys::SCAN, p.chain)).await? {
            match self.deps.cache.peek::<WalletScanAggregate>(&key).await {
                Ok(Some(entry)) => scans.push(entry.value),
                Ok(None) => {}
                Err(e) => {
                    warn!(key = %key, error = %e, "skipping unreadable wallet scan");
                    errors.push(format!("{}: {}", key, e));
                }
            }
        }
        ctx.progress(40);
        let stats = analytics::protocol_stats(&tvl, &scans);
        ctx.progress(60);

        self.store(ctx, cache_keys::protocol_analytics(&p.protocol, &p.chain), stats, errors, started)
            .await
    }

    pub async fn yield_optimization(
        &self,
        ctx: &JobContext,
        p: &YieldOptimizationPayload,
    ) -> Result<AnalyticsResult<analytics::YieldOptimization>, JobError> {
        let started = Instant::now();
        ctx.progress(0);
        let scan = self.wallet_scan(&p.wallet, &p.chain).await?;
        ctx.progress(20);
        let errors = self.inspect(ctx, &scan);
        let min_gain = p.min_apr_gain.unwrap_or(DEFAULT_MIN_APR_GAIN);
        let optimization = analytics::optimize_yield(&scan, p.risk_tolerance, min_gain);
        ctx.progress(60);
        self.store(ctx, cache_keys::optimization(&p.wallet, &p.chain), optimization, errors, started)
            .await
    }

    pub async fn risk(
        &self,
        ctx: &JobContext,
        p: &RiskAnalysisPayload,
    ) -> Result<AnalyticsResult<analytics::RiskAssessment>, JobError> {
        let started = Instant::now();
        ctx.progress(0);
        let scan = self.wallet_scan(&p.wallet, &p.chain).await?;
        ctx.progress(20);
        let errors = self.inspect(ctx, &scan);
        let assessment = analytics::assess_risk(&scan);
        ctx.progress(60);
        self.store(ctx, cache_keys::risk(&p.wallet, &p.chain), assessment, errors, started)
            .await
    }

    pub async fn historical(
        &self,
        ctx: &JobContext,
        p: &HistoricalPerformancePayload,
    ) -> Result<AnalyticsResult<analytics::HistoricalPerformance>, JobError> {
        let started = Instant::now();
        if p.end <= p.start {
            return Err(JobError::InvalidPayload(format!(
                "history range end ({}) must be after start ({})",
                p.end, p.start
            )));
        }
        ctx.progress(0);
        let scan = self.wallet_scan(&p.wallet, &p.chain).await?;
        ctx.progress(20);
        let errors = self.inspect(ctx, &scan);
        let performance = analytics::historical_performance(&scan, p.start, p.end);
        ctx.progress(60);
        let key = cache_keys::history(&p.wallet, &p.chain, p.start, p.end);
        self.store(ctx, key, performance, errors, started).await
    }
}

#[async_trait]
impl JobHandler for AnalyticsProcessor {
    fn kinds(&self) -> &'static [JobKind] {
        &[
            JobKind::PortfolioAnalytics,
            JobKind::ProtocolAnalytics,
            JobKind::YieldOptimization,
            JobKind::RiskAnalysis,
            JobKind::HistoricalPerformance,
        ]
    }

    async fn handle(&self, ctx: &JobContext, payload: JobPayload) -> Result<JobOutput, JobError> {
        match payload {
            JobPayload::PortfolioAnalytics(p) => Ok(JobOutput::PortfolioAnalytics(self.portfolio(ctx, &p).await?)),
            JobPayload::ProtocolAnalytics(p) => Ok(JobOutput::ProtocolAnalytics(self.protocol(ctx, &p).await?)),
            JobPayload::YieldOptimization(p) => {
                Ok(JobOutput::YieldOptimization(self.yield_optimization(ctx, &p).await?))
            }
            JobPayload::RiskAnalysis(p) => Ok(JobOutput::RiskAnalysis(self.risk(ctx, &p).await?)),
            JobPayload::HistoricalPerformance(p) => {
                Ok(JobOutput::HistoricalPerformance(self.historical(ctx, &p).await?))
            }
            other => Err(unexpected(other.kind(), "analytics")),
        }
    }
}
