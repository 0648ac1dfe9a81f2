//! Scan family: wallet scan (fan-out over protocols), protocol scan, quick scan and
//! bulk scan.
//!
//! A protocol scan never fails: errors are captured in its result so the wallet scan
//! that fanned out to it can report partial success.

use super::{elapsed_ms, unexpected, with_timeout, JobContext, JobHandler, ProcessorDeps};
use crate::cache_keys;
use crate::cache_layer::CacheStrategy;
use crate::jobs::payloads::{BulkScanPayload, ProtocolScanPayload, QuickScanPayload, WalletScanPayload};
use crate::jobs::results::{BulkScanResult, ProtocolScanResult, QuickScanResult, WalletScanResult};
use crate::jobs::{JobError, JobKind, JobOutput, JobPayload};
use crate::metrics;
use crate::position_source::PositionSource;
use crate::types::{LpPosition, ProtocolScanSummary, WalletScanAggregate};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub struct ScanProcessor {
    deps: Arc<ProcessorDeps>,
}

impl ScanProcessor {
    pub fn new(deps: Arc<ProcessorDeps>) -> Self {
        Self { deps }
    }

    /// Positions of one wallet on one protocol, from cache or the protocol source.
    pub async fn protocol_scan(&self, payload: &ProtocolScanPayload) -> ProtocolScanResult {
        let started = Instant::now();
        let ProtocolScanPayload {
            wallet,
            chain,
            protocol,
            refresh,
        } = payload;
        let key = cache_keys::positions(wallet, protocol, chain);

        let result = |success: bool, positions: Vec<LpPosition>, error: Option<String>, cached: bool| ProtocolScanResult {
            protocol: protocol.clone(),
            chain: chain.clone(),
            success,
            positions,
            error,
            cached,
            duration_ms: elapsed_ms(started),
        };

        if !refresh {
            match self.deps.cache.get::<Vec<LpPosition>>(&key, CacheStrategy::FastAccess).await {
                Ok(Some(positions)) => return result(true, positions, None, true),
                Ok(None) => {}
                Err(e) => warn!(key = %key, error = %e, "positions cache read failed, fetching"),
            }
        }

        let source = match self.deps.sources.get(protocol) {
            Some(s) if s.supports_chain(chain) => s,
            _ => {
                let msg = format!("{} is not available on {}", protocol, chain);
                return result(false, Vec::new(), Some(msg), false);
            }
        };

        match self.fetch(source.as_ref(), wallet, chain).await {
            Ok(positions) => {
                if let Err(e) = self.deps.cache.set(&key, &positions, CacheStrategy::FastAccess).await {
                    warn!(key = %key, error = %e, "failed to cache protocol positions");
                }
                result(true, positions, None, false)
            }
            Err(e) => {
                metrics::increment_source_failure(protocol);
                warn!(wallet = %wallet, protocol = %protocol, chain = %chain, error = %format!("{:#}", e), "protocol fetch failed");
                result(false, Vec::new(), Some(format!("{:#}", e)), false)
            }
        }
    }

    async fn fetch(&self, source: &dyn PositionSource, wallet: &str, chain: &str) -> anyhow::Result<Vec<LpPosition>> {
        with_timeout(self.deps.fetch_timeout(), source.fetch_positions(wallet, chain)).await
    }

    /// Cached aggregate unless `refresh`; otherwise fans out to every requested protocol.
    pub async fn scan_wallet(
        &self,
        ctx: Option<&JobContext>,
        payload: &WalletScanPayload,
    ) -> Result<WalletScanResult, JobError> {
        let started = Instant::now();
        let key = cache_keys::scan(&payload.wallet, &payload.chain);

        if !payload.refresh {
            if let Some(scan) = self
                .deps
                .cache
                .get::<WalletScanAggregate>(&key, CacheStrategy::ReadHeavy)
                .await?
            {
                debug!(key = %key, "wallet scan served from cache");
                return Ok(WalletScanResult {
                    positions_found: scan.total_positions,
                    protocols_scanned: scan.protocols.len(),
                    errors: scan.errors.clone(),
                    scan_results: scan,
                    cached: true,
                    duration_ms: elapsed_ms(started),
                });
            }
        }

        let (sources, unavailable) = self
            .deps
            .sources
            .resolve(&payload.chain, payload.protocols.as_deref());
        let mut errors: Vec<String> = unavailable
            .iter()
            .map(|p| format!("{}: not available on {}", p, payload.chain))
            .collect();
        report(ctx, 10);

        let total = sources.len().max(1);
        let mut done = 0usize;
        let mut summaries = Vec::with_capacity(sources.len());
        let fetches: Vec<_> = sources
            .into_iter()
            .map(|source| {
                let child = ProtocolScanPayload {
                    wallet: payload.wallet.clone(),
                    chain: payload.chain.clone(),
                    protocol: source.protocol().to_string(),
                    refresh: payload.refresh,
                };
                async move { self.protocol_scan(&child).await }
            })
            .collect();
        let mut children = stream::iter(fetches).buffer_unordered(self.deps.settings.scan_concurrency.max(1));

        while let Some(child) = children.next().await {
            done += 1;
            report(ctx, (10 + done * 80 / total) as u8);
            if child.success {
                summaries.push(ProtocolScanSummary::from_positions(&child.protocol, &child.chain, child.positions));
            } else {
                errors.push(format!(
                    "{}: {}",
                    child.protocol,
                    child.error.unwrap_or_else(|| "unknown error".to_string())
                ));
            }
        }
        drop(children);

        let protocols_scanned = summaries.len();
        let aggregate =
            WalletScanAggregate::aggregate(&payload.wallet, &payload.chain, summaries).with_errors(errors.clone());

        if protocols_scanned > 0 {
            self.deps.cache.set(&key, &aggregate, CacheStrategy::ReadHeavy).await?;
            self.deps
                .invalidation
                .invalidate_wallet_dependents(&payload.wallet, &payload.chain)
                .await?;
        } else {
            warn!(wallet = %payload.wallet, chain = %payload.chain, "no protocol scanned successfully, aggregate not cached");
        }
        report(ctx, 100);

        info!(
            wallet = %payload.wallet,
            chain = %payload.chain,
            positions = aggregate.total_positions,
            protocols_scanned,
            failed = errors.len(),
            "wallet scan finished"
        );
        Ok(WalletScanResult {
            positions_found: aggregate.total_positions,
            scan_results: aggregate,
            cached: false,
            protocols_scanned,
            errors,
            duration_ms: elapsed_ms(started),
        })
    }

    /// Top-K protocols raced against a per-protocol deadline. Late protocols are
    /// recorded as absent; the partial aggregate is not cached.
    pub async fn quick_scan(&self, ctx: Option<&JobContext>, payload: &QuickScanPayload) -> QuickScanResult {
        let started = Instant::now();
        let top_k = payload.top_k.unwrap_or(self.deps.settings.quick_scan_top_k);
        let deadline = Duration::from_millis(payload.timeout_ms.unwrap_or(self.deps.settings.quick_scan_timeout_ms));
        let sources: Vec<_> = self.deps.sources.for_chain(&payload.chain).into_iter().take(top_k).collect();
        report(ctx, 10);

        let races = sources.iter().map(|source| {
            let child = ProtocolScanPayload {
                wallet: payload.wallet.clone(),
                chain: payload.chain.clone(),
                protocol: source.protocol().to_string(),
                refresh: false,
            };
            async move {
                let outcome = tokio::time::timeout(deadline, self.protocol_scan(&child)).await;
                (child.protocol, outcome)
            }
        });
        let outcomes = futures::future::join_all(races).await;

        let mut summaries = Vec::new();
        let mut errors = Vec::new();
        let mut protocols_absent = Vec::new();
        for (protocol, outcome) in outcomes {
            match outcome {
                Ok(r) if r.success => summaries.push(ProtocolScanSummary::from_positions(&r.protocol, &r.chain, r.positions)),
                Ok(r) => errors.push(format!("{}: {}", protocol, r.error.unwrap_or_default())),
                Err(_) => protocols_absent.push(protocol),
            }
        }
        report(ctx, 100);

        let protocols_scanned = summaries.len();
        let aggregate =
            WalletScanAggregate::aggregate(&payload.wallet, &payload.chain, summaries).with_errors(errors.clone());
        QuickScanResult {
            positions_found: aggregate.total_positions,
            scan_results: aggregate,
            protocols_scanned,
            protocols_absent,
            errors,
            duration_ms: elapsed_ms(started),
        }
    }

    /// Scans wallets in fixed-size batches; one wallet failing never aborts its batch.
    pub async fn bulk_scan(&self, ctx: Option<&JobContext>, payload: &BulkScanPayload) -> BulkScanResult {
        let started = Instant::now();
        let batch_size = payload.batch_size.unwrap_or(self.deps.settings.bulk_batch_size).max(1);
        let concurrency = payload.concurrency.unwrap_or(self.deps.settings.bulk_concurrency).max(1);
        let batches: Vec<&[String]> = payload.wallets.chunks(batch_size).collect();

        let mut result = BulkScanResult {
            wallets_requested: payload.wallets.len(),
            wallets_scanned: 0,
            wallets_failed: 0,
            total_positions: 0,
            total_value: 0.0,
            errors: Vec::new(),
            duration_ms: 0,
        };

        for (i, batch) in batches.iter().enumerate() {
            let scans: Vec<_> = batch
                .iter()
                .map(|wallet| {
                    let scan = WalletScanPayload {
                        wallet: wallet.clone(),
                        chain: payload.chain.clone(),
                        protocols: None,
                        refresh: payload.refresh,
                    };
                    async move { (scan.wallet.clone(), self.scan_wallet(None, &scan).await) }
                })
                .collect();
            let settled: Vec<(String, Result<WalletScanResult, JobError>)> =
                stream::iter(scans).buffer_unordered(concurrency).collect().await;

            for (wallet, outcome) in settled {
                match outcome {
                    Ok(r) => {
                        result.wallets_scanned += 1;
                        result.total_positions += r.positions_found;
                        result.total_value += r.scan_results.total_value;
                        result.errors.extend(r.errors.into_iter().map(|e| format!("{}: {}", wallet, e)));
                    }
                    Err(e) => {
                        result.wallets_failed += 1;
                        result.errors.push(format!("{}: {}", wallet, e));
                    }
                }
            }
            report(ctx, ((i + 1) * 100 / batches.len()) as u8);
        }

        result.duration_ms = elapsed_ms(started);
        info!(
            requested = result.wallets_requested,
            scanned = result.wallets_scanned,
            failed = result.wallets_failed,
            "bulk scan finished"
        );
        result
    }
}

fn report(ctx: Option<&JobContext>, pct: u8) {
    if let Some(ctx) = ctx {
        ctx.progress(pct);
    }
}

#[async_trait]
impl JobHandler for ScanProcessor {
    fn kinds(&self) -> &'static [JobKind] {
        &[JobKind::WalletScan, JobKind::ProtocolScan, JobKind::QuickScan, JobKind::BulkScan]
    }

    async fn handle(&self, ctx: &JobContext, payload: JobPayload) -> Result<JobOutput, JobError> {
        match payload {
            JobPayload::WalletScan(p) => Ok(JobOutput::WalletScan(self.scan_wallet(Some(ctx), &p).await?)),
            JobPayload::ProtocolScan(p) => {
                ctx.progress(0);
                let r = self.protocol_scan(&p).await;
                ctx.progress(100);
                Ok(JobOutput::ProtocolScan(r))
            }
            JobPayload::QuickScan(p) => Ok(JobOutput::QuickScan(self.quick_scan(Some(ctx), &p).await)),
            JobPayload::BulkScan(p) => Ok(JobOutput::BulkScan(self.bulk_scan(Some(ctx), &p).await)),
            other => Err(unexpected(other.kind(), "scan")),
        }
    }
}
