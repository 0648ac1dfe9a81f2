//! # Analytics
//!
//! Pure functions over a cached wallet scan. Analytics jobs call these after
//! loading their upstream cache entries; nothing here touches the cache or the network.

use crate::jobs::payloads::RiskTolerance;
use crate::types::{LpPosition, ProtocolTvl, WalletScanAggregate};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const TOP_POSITIONS: usize = 5;
const SECS_PER_YEAR: f64 = 365.0 * 24.0 * 3600.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolShare {
    pub protocol: String,
    pub value_usd: f64,
    pub share: f64,
    pub positions: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub id: String,
    pub protocol: String,
    pub pool: String,
    pub value_usd: f64,
    pub apr: f64,
}

impl From<&LpPosition> for PositionSnapshot {
    fn from(p: &LpPosition) -> Self {
        Self {
            id: p.id.clone(),
            protocol: p.protocol.clone(),
            pool: p.pool.clone(),
            value_usd: p.value_usd,
            apr: p.apr,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioAnalytics {
    pub wallet: String,
    pub chain: String,
    pub total_value: f64,
    pub total_fees_earned: f64,
    pub weighted_apr: f64,
    pub estimated_annual_yield_usd: f64,
    pub position_count: usize,
    pub protocol_count: usize,
    pub in_range_ratio: f64,
    /// 1 - HHI of protocol value shares (0 = single protocol)
    pub diversification_score: f64,
    pub protocol_breakdown: Vec<ProtocolShare>,
    pub top_positions: Vec<PositionSnapshot>,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolAnalytics {
    pub protocol: String,
    pub chain: String,
    pub tvl_usd: f64,
    pub tracked_wallets: usize,
    pub tracked_positions: usize,
    pub tracked_value_usd: f64,
    pub avg_apr: f64,
    pub share_of_tvl: f64,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YieldSuggestion {
    pub position_id: String,
    pub pool: String,
    pub from_protocol: String,
    pub to_protocol: String,
    pub current_apr: f64,
    pub target_apr: f64,
    pub estimated_annual_gain_usd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YieldOptimization {
    pub wallet: String,
    pub chain: String,
    pub risk_tolerance: RiskTolerance,
    pub current_apr: f64,
    pub potential_apr: f64,
    pub estimated_annual_gain_usd: f64,
    pub suggestions: Vec<YieldSuggestion>,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub wallet: String,
    pub chain: String,
    /// 0 (no risk) ..= 100
    pub risk_score: f64,
    pub level: RiskLevel,
    pub concentration_hhi: f64,
    pub largest_position_share: f64,
    pub out_of_range_ratio: f64,
    pub protocol_count: usize,
    pub factors: Vec<String>,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalPerformance {
    pub wallet: String,
    pub chain: String,
    pub start: i64,
    pub end: i64,
    pub positions_in_period: usize,
    pub deposited_value: f64,
    pub current_value: f64,
    pub fees_earned: f64,
    pub net_pnl: f64,
    pub roi_pct: f64,
    pub annualized_return_pct: f64,
    pub computed_at: DateTime<Utc>,
}

fn ratio(part: f64, whole: f64) -> f64 {
    if whole > 0.0 {
        part / whole
    } else {
        0.0
    }
}

/// Value and position count per protocol, sorted by value descending.
pub fn protocol_breakdown(scan: &WalletScanAggregate) -> Vec<ProtocolShare> {
    let mut out: Vec<ProtocolShare> = scan
        .protocols
        .iter()
        .filter(|p| p.total_positions > 0)
        .map(|p| ProtocolShare {
            protocol: p.protocol.clone(),
            value_usd: p.total_value,
            share: ratio(p.total_value, scan.total_value),
            positions: p.total_positions,
        })
        .collect();
    out.sort_by(|a, b| b.value_usd.total_cmp(&a.value_usd));
    out
}

/// Herfindahl index over shares (0..=1).
pub fn hhi(shares: impl Iterator<Item = f64>) -> f64 {
    shares.map(|s| s * s).sum()
}

pub fn portfolio_summary(scan: &WalletScanAggregate) -> PortfolioAnalytics {
    let breakdown = protocol_breakdown(scan);
    let positions: Vec<&LpPosition> = scan.positions().collect();

    let with_range: Vec<bool> = positions.iter().filter_map(|p| p.in_range).collect();
    let in_range_ratio = ratio(
        with_range.iter().filter(|r| **r).count() as f64,
        with_range.len() as f64,
    );

    let mut top: Vec<&LpPosition> = positions.clone();
    top.sort_by(|a, b| b.value_usd.total_cmp(&a.value_usd));

    let diversification_score = if breakdown.is_empty() {
        0.0
    } else {
        1.0 - hhi(breakdown.iter().map(|p| p.share))
    };

    PortfolioAnalytics {
        wallet: scan.wallet.clone(),
        chain: scan.chain.clone(),
        total_value: scan.total_value,
        total_fees_earned: scan.total_fees_earned,
        weighted_apr: scan.avg_apr,
        estimated_annual_yield_usd: scan.total_value * scan.avg_apr / 100.0,
        position_count: scan.total_positions,
        protocol_count: breakdown.len(),
        in_range_ratio,
        diversification_score,
        protocol_breakdown: breakdown,
        top_positions: top.into_iter().take(TOP_POSITIONS).map(PositionSnapshot::from).collect(),
        computed_at: Utc::now(),
    }
}

/// Aggregates one protocol's footprint across every cached wallet scan on a chain.
pub fn protocol_stats(tvl: &ProtocolTvl, scans: &[WalletScanAggregate]) -> ProtocolAnalytics {
    let positions: Vec<&LpPosition> = scans
        .iter()
        .flat_map(|s| s.protocols.iter())
        .filter(|p| p.protocol == tvl.protocol)
        .flat_map(|p| p.positions.iter())
        .collect();
    let tracked_wallets = scans.iter().filter(|s| s.holds_protocol(&tvl.protocol)).count();
    let tracked_value_usd: f64 = positions.iter().map(|p| p.value_usd).sum();

    ProtocolAnalytics {
        protocol: tvl.protocol.clone(),
        chain: tvl.chain.clone(),
        tvl_usd: tvl.tvl_usd,
        tracked_wallets,
        tracked_positions: positions.len(),
        tracked_value_usd,
        avg_apr: crate::types::positions::weighted_apr(positions.iter().copied()),
        share_of_tvl: ratio(tracked_value_usd, tvl.tvl_usd),
        computed_at: Utc::now(),
    }
}

fn max_target_apr(tolerance: RiskTolerance) -> f64 {
    match tolerance {
        RiskTolerance::Low => 50.0,
        RiskTolerance::Medium => 150.0,
        RiskTolerance::High => f64::INFINITY,
    }
}

/// Suggests moving under-performing positions to the best protocol the wallet already uses,
/// ignoring targets whose APR exceeds what the risk tolerance accepts.
pub fn optimize_yield(
    scan: &WalletScanAggregate,
    tolerance: RiskTolerance,
    min_apr_gain: f64,
) -> YieldOptimization {
    let cap = max_target_apr(tolerance);
    let best = scan
        .protocols
        .iter()
        .filter(|p| p.total_positions > 0 && p.avg_apr <= cap)
        .max_by(|a, b| a.avg_apr.total_cmp(&b.avg_apr));

    let mut suggestions = Vec::new();
    if let Some(best) = best {
        for p in scan.positions() {
            if p.protocol != best.protocol && best.avg_apr - p.apr >= min_apr_gain {
                suggestions.push(YieldSuggestion {
                    position_id: p.id.clone(),
                    pool: p.pool.clone(),
                    from_protocol: p.protocol.clone(),
                    to_protocol: best.protocol.clone(),
                    current_apr: p.apr,
                    target_apr: best.avg_apr,
                    estimated_annual_gain_usd: p.value_usd * (best.avg_apr - p.apr) / 100.0,
                });
            }
        }
    }
    suggestions.sort_by(|a, b| b.estimated_annual_gain_usd.total_cmp(&a.estimated_annual_gain_usd));

    let gain: f64 = suggestions.iter().map(|s| s.estimated_annual_gain_usd).sum();
    let potential_apr = if scan.total_value > 0.0 {
        scan.avg_apr + gain / scan.total_value * 100.0
    } else {
        scan.avg_apr
    };

    YieldOptimization {
        wallet: scan.wallet.clone(),
        chain: scan.chain.clone(),
        risk_tolerance: tolerance,
        current_apr: scan.avg_apr,
        potential_apr,
        estimated_annual_gain_usd: gain,
        suggestions,
        computed_at: Utc::now(),
    }
}

pub fn assess_risk(scan: &WalletScanAggregate) -> RiskAssessment {
    let breakdown = protocol_breakdown(scan);
    let concentration_hhi = hhi(breakdown.iter().map(|p| p.share));
    let largest_position_share = ratio(
        scan.positions().map(|p| p.value_usd).fold(0.0, f64::max),
        scan.total_value,
    );
    let ranged: Vec<bool> = scan.positions().filter_map(|p| p.in_range).collect();
    let out_of_range_ratio = ratio(
        ranged.iter().filter(|r| !**r).count() as f64,
        ranged.len() as f64,
    );

    let risk_score =
        (40.0 * concentration_hhi + 30.0 * largest_position_share + 30.0 * out_of_range_ratio)
            .clamp(0.0, 100.0);
    let level = if risk_score < 33.0 {
        RiskLevel::Low
    } else if risk_score < 66.0 {
        RiskLevel::Medium
    } else {
        RiskLevel::High
    };

    let mut factors = Vec::new();
    if concentration_hhi > 0.5 {
        factors.push(format!("protocol concentration (HHI {:.2})", concentration_hhi));
    }
    if largest_position_share > 0.5 {
        factors.push(format!(
            "single position holds {:.0}% of value",
            largest_position_share * 100.0
        ));
    }
    if out_of_range_ratio > 0.0 {
        factors.push(format!(
            "{:.0}% of ranged positions out of range",
            out_of_range_ratio * 100.0
        ));
    }

    RiskAssessment {
        wallet: scan.wallet.clone(),
        chain: scan.chain.clone(),
        risk_score,
        level,
        concentration_hhi,
        largest_position_share,
        out_of_range_ratio,
        protocol_count: breakdown.len(),
        factors,
        computed_at: Utc::now(),
    }
}

/// Performance of positions open at `end`. Positions without a deposit value are
/// assumed to be worth what they were deposited at.
pub fn historical_performance(scan: &WalletScanAggregate, start: i64, end: i64) -> HistoricalPerformance {
    let in_period: Vec<&LpPosition> = scan
        .positions()
        .filter(|p| p.opened_at.map_or(true, |t| t.timestamp() <= end))
        .collect();

    let deposited_value: f64 = in_period
        .iter()
        .map(|p| p.deposited_value_usd.unwrap_or(p.value_usd))
        .sum();
    let current_value: f64 = in_period.iter().map(|p| p.value_usd).sum();
    let fees_earned: f64 = in_period.iter().map(|p| p.fees_earned_usd).sum();
    let net_pnl = current_value + fees_earned - deposited_value;
    let roi_pct = ratio(net_pnl, deposited_value) * 100.0;
    let period_secs = (end - start).max(1) as f64;

    HistoricalPerformance {
        wallet: scan.wallet.clone(),
        chain: scan.chain.clone(),
        start,
        end,
        positions_in_period: in_period.len(),
        deposited_value,
        current_value,
        fees_earned,
        net_pnl,
        roi_pct,
        annualized_return_pct: roi_pct * SECS_PER_YEAR / period_secs,
        computed_at: Utc::now(),
    }
}

/// Groups positions by protocol name.
pub fn positions_by_protocol(scan: &WalletScanAggregate) -> BTreeMap<String, Vec<&LpPosition>> {
    let mut out: BTreeMap<String, Vec<&LpPosition>> = BTreeMap::new();
    for p in scan.positions() {
        out.entry(p.protocol.clone()).or_default().push(p);
    }
    out
}
