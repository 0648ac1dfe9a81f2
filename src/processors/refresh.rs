//! Refresh family: price, protocol TVL and position refresh, cache warmup and stale
//! data cleanup.
//!
//! Batch refreshes collect per-item errors instead of failing; a refresh fails (and
//! is retried) only when every item failed.

use super::scan::ScanProcessor;
use super::{elapsed_ms, unexpected, with_timeout, JobContext, JobHandler, ProcessorDeps};
use crate::cache_keys;
use crate::cache_layer::CacheStrategy;
use crate::jobs::payloads::{
    CacheWarmupPayload, PositionRefreshPayload, PriceRefreshPayload, ProtocolTvlRefreshPayload,
    StaleDataCleanupPayload, WalletScanPayload,
};
use crate::jobs::results::{
    CacheWarmupResult, PositionRefreshResult, PriceRefreshResult, ProtocolTvlRefreshResult,
    StaleDataCleanupResult,
};
use crate::jobs::{JobError, JobKind, JobOutput, JobPayload};
use crate::metrics;
use crate::settings::ProcessorSettings;
use crate::types::{LpPosition, ProtocolScanSummary, ProtocolTvl, TokenPrice, WalletScanAggregate};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

pub struct RefreshProcessor {
    deps: Arc<ProcessorDeps>,
    scans: Arc<ScanProcessor>,
}

/// True when `new` differs from `old` beyond the configured materiality thresholds.
pub fn position_changed(old: &LpPosition, new: &LpPosition, t: &ProcessorSettings) -> bool {
    let value_delta = (new.value_usd - old.value_usd).abs();
    let value_changed = if old.value_usd.abs() > f64::EPSILON {
        value_delta / old.value_usd.abs() * 100.0 > t.value_change_pct
    } else {
        value_delta > f64::EPSILON
    };
    value_changed
        || (new.fees_earned_usd - old.fees_earned_usd).abs() > t.fee_change_usd
        || (new.apr - old.apr).abs() > t.apr_change_pp
        || new.in_range != old.in_range
}

fn all_failed(updated: usize, errors: &[String]) -> bool {
    updated == 0 && !errors.is_empty()
}

impl RefreshProcessor {
    pub fn new(deps: Arc<ProcessorDeps>, scans: Arc<ScanProcessor>) -> Self {
        Self { deps, scans }
    }

    pub async fn price_refresh(&self, ctx: &JobContext, payload: &PriceRefreshPayload) -> Result<PriceRefreshResult, JobError> {
        let started = Instant::now();
        let market = self.deps.sources.market();
        let total = (payload.tokens.len() * payload.chains.len()).max(1);
        let mut result = PriceRefreshResult {
            prices_updated: 0,
            prices_changed: 0,
            invalidated_keys: 0,
            errors: Vec::new(),
            duration_ms: 0,
        };

        let mut done = 0usize;
        for chain in &payload.chains {
            for token in &payload.tokens {
                done += 1;
                let fetched = with_timeout(self.deps.fetch_timeout(), market.token_price(token, chain)).await;
                let price_usd = match fetched {
                    Ok(p) => p,
                    Err(e) => {
                        metrics::increment_source_failure("market");
                        result.errors.push(format!("{}@{}: {:#}", token, chain, e));
                        continue;
                    }
                };

                let key = cache_keys::price(token, chain);
                let previous = self.deps.cache.peek::<TokenPrice>(&key).await?;
                // Without a cached baseline there is nothing derived from an older price to evict.
                let changed = previous.map_or(false, |p| (p.value.price_usd - price_usd).abs() > f64::EPSILON);
                if changed {
                    let report = self.deps.invalidation.invalidate_price_data(token, chain).await?;
                    result.invalidated_keys += report.keys_removed;
                    result.prices_changed += 1;
                }
                let price = TokenPrice {
                    token: token.clone(),
                    chain: chain.clone(),
                    price_usd,
                    updated_at: Utc::now(),
                };
                self.deps.cache.set(&key, &price, CacheStrategy::FastAccess).await?;
                result.prices_updated += 1;
                ctx.progress((done * 100 / total) as u8);
            }
        }

        if all_failed(result.prices_updated, &result.errors) {
            return Err(JobError::Transient(format!(
                "every price fetch failed ({} errors), first: {}",
                result.errors.len(),
                result.errors[0]
            )));
        }
        result.duration_ms = elapsed_ms(started);
        Ok(result)
    }

    pub async fn tvl_refresh(
        &self,
        ctx: &JobContext,
        payload: &ProtocolTvlRefreshPayload,
    ) -> Result<ProtocolTvlRefreshResult, JobError> {
        let started = Instant::now();
        let market = self.deps.sources.market();
        let total = (payload.protocols.len() * payload.chains.len()).max(1);
        let mut result = ProtocolTvlRefreshResult {
            tvls_updated: 0,
            invalidated_keys: 0,
            errors: Vec::new(),
            duration_ms: 0,
        };

        let mut done = 0usize;
        for chain in &payload.chains {
            for protocol in &payload.protocols {
                done += 1;
                let tvl_usd = match with_timeout(self.deps.fetch_timeout(), market.protocol_tvl(protocol, chain)).await {
                    Ok(v) => v,
                    Err(e) => {
                        metrics::increment_source_failure("market");
                        result.errors.push(format!("{}@{}: {:#}", protocol, chain, e));
                        continue;
                    }
                };

                let key = cache_keys::tvl(protocol, chain);
                let previous = self.deps.cache.peek::<ProtocolTvl>(&key).await?;
                if previous.map_or(false, |p| (p.value.tvl_usd - tvl_usd).abs() > f64::EPSILON) {
                    let report = self.deps.invalidation.invalidate_protocol_data(protocol, chain).await?;
                    result.invalidated_keys += report.keys_removed;
                }
                let tvl = ProtocolTvl {
                    protocol: protocol.clone(),
                    chain: chain.clone(),
                    tvl_usd,
                    updated_at: Utc::now(),
                };
                self.deps.cache.set(&key, &tvl, CacheStrategy::FastAccess).await?;
                result.tvls_updated += 1;
                ctx.progress((done * 100 / total) as u8);
            }
        }

        if all_failed(result.tvls_updated, &result.errors) {
            return Err(JobError::Transient(format!(
                "every tvl fetch failed ({} errors), first: {}",
                result.errors.len(),
                result.errors[0]
            )));
        }
        result.duration_ms = elapsed_ms(started);
        Ok(result)
    }

    /// Re-fetches the requested protocols of a cached scan and rewrites it only when a
    /// position changed materially.
    pub async fn position_refresh(
        &self,
        ctx: &JobContext,
        payload: &PositionRefreshPayload,
    ) -> Result<PositionRefreshResult, JobError> {
        let started = Instant::now();
        let key = cache_keys::scan(&payload.wallet, &payload.chain);
        let cached = self
            .deps
            .cache
            .peek::<WalletScanAggregate>(&key)
            .await?
            .ok_or_else(|| {
                JobError::missing(
                    key.clone(),
                    format!("run wallet-scan for {} on {} first", payload.wallet, payload.chain),
                )
            })?
            .value;
        ctx.progress(10);

        let id_filter: Option<BTreeSet<&str>> = payload
            .position_ids
            .as_ref()
            .map(|ids| ids.iter().map(String::as_str).collect());

        let targets: Vec<String> = if payload.force {
            self.deps.sources.for_chain(&payload.chain).iter().map(|s| s.protocol().to_string()).collect()
        } else if let Some(protocols) = &payload.protocols {
            protocols.clone()
        } else if let Some(ids) = &id_filter {
            cached
                .protocols
                .iter()
                .filter(|p| p.positions.iter().any(|pos| ids.contains(pos.id.as_str())))
                .map(|p| p.protocol.clone())
                .collect()
        } else {
            cached.protocol_names()
        };

        let mut summaries: HashMap<String, ProtocolScanSummary> = cached
            .protocols
            .iter()
            .map(|p| (p.protocol.clone(), p.clone()))
            .collect();
        let mut result = PositionRefreshResult {
            positions_checked: 0,
            positions_updated: 0,
            protocols_refreshed: 0,
            invalidated_keys: 0,
            errors: Vec::new(),
            duration_ms: 0,
        };
        let mut rewritten: Vec<(String, Vec<LpPosition>)> = Vec::new();
        let mut refreshed: Vec<&str> = Vec::new();

        let total = targets.len().max(1);
        for (i, protocol) in targets.iter().enumerate() {
            let Some(source) = self.deps.sources.get(protocol).filter(|s| s.supports_chain(&payload.chain)) else {
                result.errors.push(format!("{}: not available on {}", protocol, payload.chain));
                continue;
            };
            let fetched =
                match with_timeout(self.deps.fetch_timeout(), source.fetch_positions(&payload.wallet, &payload.chain)).await {
                    Ok(p) => p,
                    Err(e) => {
                        metrics::increment_source_failure(protocol);
                        result.errors.push(format!("{}: {:#}", protocol, e));
                        continue;
                    }
                };
            result.protocols_refreshed += 1;
            refreshed.push(protocol);

            let old: Vec<LpPosition> = summaries.get(protocol).map(|s| s.positions.clone()).unwrap_or_default();
            let in_scope = |p: &LpPosition| id_filter.as_ref().map_or(true, |ids| ids.contains(p.id.as_str()));

            // Positions outside the id filter keep their cached version.
            let mut next: Vec<LpPosition> = old.iter().filter(|p| !in_scope(*p)).cloned().collect();
            let mut changed = 0usize;
            let mut checked = 0usize;
            for new in fetched.iter().filter(|p| in_scope(*p)) {
                checked += 1;
                match old.iter().find(|o| o.id == new.id) {
                    Some(o) if !position_changed(o, new, &self.deps.settings) => next.push(o.clone()),
                    _ => {
                        changed += 1;
                        next.push(new.clone());
                    }
                }
            }
            let removed = old
                .iter()
                .filter(|o| in_scope(*o) && !fetched.iter().any(|n| n.id == o.id))
                .count();
            checked += removed;
            changed += removed;

            result.positions_checked += checked;
            result.positions_updated += changed;
            if changed > 0 {
                next.sort_by(|a, b| a.id.cmp(&b.id));
                summaries.insert(
                    protocol.clone(),
                    ProtocolScanSummary::from_positions(protocol, &payload.chain, next.clone()),
                );
                rewritten.push((protocol.clone(), next));
            }
            ctx.progress((10 + (i + 1) * 80 / total) as u8);
        }

        if result.positions_updated > 0 {
            // A protocol that answered this time is no longer missing from the scan.
            let still_failing = cached
                .errors
                .iter()
                .filter(|e| !refreshed.iter().any(|p| e.starts_with(&format!("{}:", p))))
                .cloned()
                .collect();
            let updated = WalletScanAggregate::aggregate(&payload.wallet, &payload.chain, summaries.into_values().collect())
                .with_errors(still_failing);
            self.deps.cache.set(&key, &updated, CacheStrategy::ReadHeavy).await?;
            for (protocol, positions) in &rewritten {
                let pkey = cache_keys::positions(&payload.wallet, protocol, &payload.chain);
                self.deps.cache.set(&pkey, positions, CacheStrategy::FastAccess).await?;
            }
            let report = self
                .deps
                .invalidation
                .invalidate_wallet_dependents(&payload.wallet, &payload.chain)
                .await?;
            result.invalidated_keys = report.keys_removed;
            info!(
                wallet = %payload.wallet,
                chain = %payload.chain,
                updated = result.positions_updated,
                "positions changed, scan rewritten"
            );
        } else if all_failed(result.protocols_refreshed, &result.errors) {
            return Err(JobError::Transient(result.errors.join("; ")));
        }
        ctx.progress(100);

        result.duration_ms = elapsed_ms(started);
        Ok(result)
    }

    /// Populates scans, TVL and prices ahead of demand; fresh entries count as hits.
    pub async fn cache_warmup(&self, ctx: &JobContext, payload: &CacheWarmupPayload) -> Result<CacheWarmupResult, JobError> {
        let started = Instant::now();
        let defaults = &self.deps.warmup;
        let pick = |given: &Vec<String>, fallback: &Vec<String>| if given.is_empty() { fallback.clone() } else { given.clone() };
        let wallets = pick(&payload.wallets, &defaults.popular_wallets);
        let protocols = pick(&payload.protocols, &defaults.top_protocols);
        let tokens = pick(&payload.tokens, &defaults.trending_tokens);
        let chains = pick(&payload.chains, &defaults.chains);
        let market = self.deps.sources.market();

        let mut result = CacheWarmupResult {
            cache_hits: 0,
            entries_warmed: 0,
            errors: Vec::new(),
            duration_ms: 0,
        };

        for (ci, chain) in chains.iter().enumerate() {
            for wallet in &wallets {
                if self.deps.cache.peek::<WalletScanAggregate>(&cache_keys::scan(wallet, chain)).await?.is_some() {
                    result.cache_hits += 1;
                    continue;
                }
                let scan = WalletScanPayload {
                    wallet: wallet.clone(),
                    chain: chain.clone(),
                    protocols: None,
                    refresh: false,
                };
                match self.scans.scan_wallet(None, &scan).await {
                    Ok(r) if r.protocols_scanned > 0 => result.entries_warmed += 1,
                    Ok(r) => result.errors.push(format!("{}@{}: {}", wallet, chain, r.errors.join("; "))),
                    Err(e) => result.errors.push(format!("{}@{}: {}", wallet, chain, e)),
                }
            }

            for protocol in &protocols {
                let key = cache_keys::tvl(protocol, chain);
                if self.deps.cache.peek::<ProtocolTvl>(&key).await?.is_some() {
                    result.cache_hits += 1;
                    continue;
                }
                match with_timeout(self.deps.fetch_timeout(), market.protocol_tvl(protocol, chain)).await {
                    Ok(tvl_usd) => {
                        let tvl = ProtocolTvl {
                            protocol: protocol.clone(),
                            chain: chain.clone(),
                            tvl_usd,
                            updated_at: Utc::now(),
                        };
                        self.deps.cache.set(&key, &tvl, CacheStrategy::FastAccess).await?;
                        result.entries_warmed += 1;
                    }
                    Err(e) => result.errors.push(format!("{}@{}: {:#}", protocol, chain, e)),
                }
            }

            for token in &tokens {
                let key = cache_keys::price(token, chain);
                if self.deps.cache.peek::<TokenPrice>(&key).await?.is_some() {
                    result.cache_hits += 1;
                    continue;
                }
                match with_timeout(self.deps.fetch_timeout(), market.token_price(token, chain)).await {
                    Ok(price_usd) => {
                        let price = TokenPrice {
                            token: token.clone(),
                            chain: chain.clone(),
                            price_usd,
                            updated_at: Utc::now(),
                        };
                        self.deps.cache.set(&key, &price, CacheStrategy::FastAccess).await?;
                        result.entries_warmed += 1;
                    }
                    Err(e) => result.errors.push(format!("{}@{}: {:#}", token, chain, e)),
                }
            }
            ctx.progress(((ci + 1) * 100 / chains.len()) as u8);
        }

        info!(hits = result.cache_hits, warmed = result.entries_warmed, failed = result.errors.len(), "cache warmup finished");
        result.duration_ms = elapsed_ms(started);
        Ok(result)
    }

    /// Removes entries stored longer ago than the cutoff. `dry_run` only reports.
    pub async fn stale_data_cleanup(
        &self,
        ctx: &JobContext,
        payload: &StaleDataCleanupPayload,
    ) -> Result<StaleDataCleanupResult, JobError> {
        let started = Instant::now();
        let cutoff = self.deps.cache.now_ms() - (payload.max_age_hours as i64) * 3_600_000;
        let patterns: Vec<String> = match &payload.patterns {
            Some(p) => p.clone(),
            None => cache_keys::DATA_NAMESPACES
                .iter()
                .map(|ns| cache_keys::namespace_pattern(ns))
                .collect(),
        };

        let mut result = StaleDataCleanupResult {
            items_checked: 0,
            items_eligible: 0,
            items_removed: 0,
            space_freed: 0,
            dry_run: payload.dry_run,
            errors: Vec::new(),
            duration_ms: 0,
        };

        for (i, pattern) in patterns.iter().enumerate() {
            let entries = match self.deps.cache.scan_entries(pattern).await {
                Ok(e) => e,
                Err(e) => {
                    warn!(pattern = %pattern, error = %e, "cleanup scan failed");
                    result.errors.push(format!("{}: {}", pattern, e));
                    continue;
                }
            };
            result.items_checked += entries.len();
            for entry in entries.into_iter().filter(|e| e.stored_at < cutoff) {
                result.items_eligible += 1;
                if payload.dry_run {
                    continue;
                }
                match self.deps.cache.delete(&entry.key).await {
                    Ok(true) => {
                        result.items_removed += 1;
                        result.space_freed += entry.size_bytes as u64;
                    }
                    Ok(false) => {}
                    Err(e) => result.errors.push(format!("{}: {}", entry.key, e)),
                }
            }
            ctx.progress(((i + 1) * 100 / patterns.len()) as u8);
        }

        info!(
            checked = result.items_checked,
            eligible = result.items_eligible,
            removed = result.items_removed,
            dry_run = result.dry_run,
            "stale data cleanup finished"
        );
        result.duration_ms = elapsed_ms(started);
        Ok(result)
    }
}

#[async_trait]
impl JobHandler for RefreshProcessor {
    fn kinds(&self) -> &'static [JobKind] {
        &[
            JobKind::PriceRefresh,
            JobKind::PositionRefresh,
            JobKind::ProtocolTvlRefresh,
            JobKind::CacheWarmup,
            JobKind::StaleDataCleanup,
        ]
    }

    async fn handle(&self, ctx: &JobContext, payload: JobPayload) -> Result<JobOutput, JobError> {
        match payload {
            JobPayload::PriceRefresh(p) => Ok(JobOutput::PriceRefresh(self.price_refresh(ctx, &p).await?)),
            JobPayload::PositionRefresh(p) => Ok(JobOutput::PositionRefresh(self.position_refresh(ctx, &p).await?)),
            JobPayload::ProtocolTvlRefresh(p) => Ok(JobOutput::ProtocolTvlRefresh(self.tvl_refresh(ctx, &p).await?)),
            JobPayload::CacheWarmup(p) => Ok(JobOutput::CacheWarmup(self.cache_warmup(ctx, &p).await?)),
            JobPayload::StaleDataCleanup(p) => Ok(JobOutput::StaleDataCleanup(self.stale_data_cleanup(ctx, &p).await?)),
            other => Err(unexpected(other.kind(), "refresh")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::positions::fixtures::position;

    #[test]
    fn test_materiality_thresholds() {
        let t = ProcessorSettings::default();
        let old = position("1", "curve", 1_000.0, 10.0, 5.0);

        let mut small = old.clone();
        small.value_usd = 1_009.0;
        small.fees_earned_usd = 10.05;
        small.apr = 5.9;
        assert!(!position_changed(&old, &small, &t));

        let mut value = old.clone();
        value.value_usd = 1_011.0;
        assert!(position_changed(&old, &value, &t));

        let mut fees = old.clone();
        fees.fees_earned_usd = 10.2;
        assert!(position_changed(&old, &fees, &t));

        let mut apr = old.clone();
        apr.apr = 6.5;
        assert!(position_changed(&old, &apr, &t));
    }
}
