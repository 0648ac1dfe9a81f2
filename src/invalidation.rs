//! # Invalidation Manager
//!
//! Maps domain events to the cache keys they make stale. Rules are data: each trigger
//! lists key templates (`{wallet}`, `{chain}`, `{token}`, `{protocol}` placeholders)
//! that are rendered and evicted through the [`CacheLayer`] public API.
//!
//! Price and TVL changes cascade: every cached wallet scan on the chain that holds the
//! token (or protocol) is treated as a `WalletRefreshed` event, which evicts the scan and
//! everything derived from it.

use crate::cache_keys;
use crate::cache_layer::{CacheError, CacheLayer};
use crate::types::WalletScanAggregate;
use log::{debug, info};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InvalidationTrigger {
    PriceChanged { token: String, chain: String },
    WalletRefreshed { wallet: String, chain: String },
    ProtocolTvlChanged { protocol: String, chain: String },
    /// A wallet's positions were rewritten in place; the scan itself stays
    PositionsChanged { wallet: String, chain: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    PriceChanged,
    WalletRefreshed,
    ProtocolTvlChanged,
    PositionsChanged,
}

impl InvalidationTrigger {
    pub fn kind(&self) -> TriggerKind {
        match self {
            InvalidationTrigger::PriceChanged { .. } => TriggerKind::PriceChanged,
            InvalidationTrigger::WalletRefreshed { .. } => TriggerKind::WalletRefreshed,
            InvalidationTrigger::ProtocolTvlChanged { .. } => TriggerKind::ProtocolTvlChanged,
            InvalidationTrigger::PositionsChanged { .. } => TriggerKind::PositionsChanged,
        }
    }

    fn render(&self, template: &str) -> String {
        match self {
            InvalidationTrigger::PriceChanged { token, chain } => {
                template.replace("{token}", token).replace("{chain}", chain)
            }
            InvalidationTrigger::WalletRefreshed { wallet, chain }
            | InvalidationTrigger::PositionsChanged { wallet, chain } => {
                template.replace("{wallet}", wallet).replace("{chain}", chain)
            }
            InvalidationTrigger::ProtocolTvlChanged { protocol, chain } => {
                template.replace("{protocol}", protocol).replace("{chain}", chain)
            }
        }
    }
}

impl fmt::Display for InvalidationTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidationTrigger::PriceChanged { token, chain } => write!(f, "price-changed:{}:{}", token, chain),
            InvalidationTrigger::WalletRefreshed { wallet, chain } => {
                write!(f, "wallet-refreshed:{}:{}", wallet, chain)
            }
            InvalidationTrigger::ProtocolTvlChanged { protocol, chain } => {
                write!(f, "protocol-tvl-changed:{}:{}", protocol, chain)
            }
            InvalidationTrigger::PositionsChanged { wallet, chain } => {
                write!(f, "positions-changed:{}:{}", wallet, chain)
            }
        }
    }
}

/// `{trigger, affected_key_patterns}`
#[derive(Debug, Clone, Copy)]
pub struct InvalidationRule {
    pub trigger: TriggerKind,
    pub affected_key_patterns: &'static [&'static str],
    /// Whether wallets holding the token/protocol are refreshed too
    pub cascades_to_wallets: bool,
}

const WALLET_DEPENDENTS: &[&str] = &[
    "analytics:{wallet}:{chain}",
    "optimization:{wallet}:{chain}",
    "risk:{wallet}:{chain}",
    "history:{wallet}:{chain}:*",
];

pub const RULES: &[InvalidationRule] = &[
    InvalidationRule {
        trigger: TriggerKind::PriceChanged,
        affected_key_patterns: &["price:{token}:{chain}"],
        cascades_to_wallets: true,
    },
    InvalidationRule {
        trigger: TriggerKind::WalletRefreshed,
        affected_key_patterns: &[
            "scan:{wallet}:{chain}",
            "positions:{wallet}:*:{chain}",
            "analytics:{wallet}:{chain}",
            "optimization:{wallet}:{chain}",
            "risk:{wallet}:{chain}",
            "history:{wallet}:{chain}:*",
        ],
        cascades_to_wallets: false,
    },
    InvalidationRule {
        trigger: TriggerKind::ProtocolTvlChanged,
        affected_key_patterns: &["tvl:{protocol}:{chain}", "protocol-analytics:{protocol}:{chain}"],
        cascades_to_wallets: true,
    },
    InvalidationRule {
        trigger: TriggerKind::PositionsChanged,
        affected_key_patterns: WALLET_DEPENDENTS,
        cascades_to_wallets: false,
    },
];

fn rule_for(kind: TriggerKind) -> &'static InvalidationRule {
    match kind {
        TriggerKind::PriceChanged => &RULES[0],
        TriggerKind::WalletRefreshed => &RULES[1],
        TriggerKind::ProtocolTvlChanged => &RULES[2],
        TriggerKind::PositionsChanged => &RULES[3],
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InvalidationReport {
    pub trigger: String,
    pub keys_removed: usize,
    pub wallets_cascaded: Vec<String>,
}

pub struct InvalidationManager {
    cache: Arc<CacheLayer>,
}

impl InvalidationManager {
    pub fn new(cache: Arc<CacheLayer>) -> Self {
        Self { cache }
    }

    pub fn rules(&self) -> &'static [InvalidationRule] {
        RULES
    }

    /// Renders the patterns a trigger evicts directly (cascades excluded).
    pub fn patterns_for(&self, trigger: &InvalidationTrigger) -> Vec<String> {
        rule_for(trigger.kind())
            .affected_key_patterns
            .iter()
            .map(|t| trigger.render(t))
            .collect()
    }

    pub async fn apply(&self, trigger: InvalidationTrigger) -> Result<InvalidationReport, CacheError> {
        let reason = trigger.to_string();
        let mut report = InvalidationReport {
            trigger: reason.clone(),
            ..Default::default()
        };

        for pattern in self.patterns_for(&trigger) {
            report.keys_removed += self.cache.invalidate(&pattern, &reason).await?;
        }

        if rule_for(trigger.kind()).cascades_to_wallets {
            let (chain, wallets) = match &trigger {
                InvalidationTrigger::PriceChanged { token, chain } => {
                    (chain, self.wallets_matching(chain, |s| s.holds_token(token)).await?)
                }
                InvalidationTrigger::ProtocolTvlChanged { protocol, chain } => {
                    (chain, self.wallets_matching(chain, |s| s.holds_protocol(protocol)).await?)
                }
                _ => return Ok(report),
            };

            for wallet in wallets {
                let nested = InvalidationTrigger::WalletRefreshed {
                    wallet: wallet.clone(),
                    chain: chain.clone(),
                };
                for pattern in self.patterns_for(&nested) {
                    report.keys_removed += self.cache.invalidate(&pattern, &reason).await?;
                }
                report.wallets_cascaded.push(wallet);
            }
        }

        if report.keys_removed > 0 {
            info!(
                "invalidation {} removed {} key(s), cascaded to {} wallet(s)",
                report.trigger,
                report.keys_removed,
                report.wallets_cascaded.len()
            );
        } else {
            debug!("invalidation {} removed nothing", report.trigger);
        }
        Ok(report)
    }

    pub async fn invalidate_price_data(&self, token: &str, chain: &str) -> Result<InvalidationReport, CacheError> {
        self.apply(InvalidationTrigger::PriceChanged {
            token: token.to_string(),
            chain: chain.to_string(),
        })
        .await
    }

    pub async fn invalidate_wallet_data(&self, wallet: &str, chain: &str) -> Result<InvalidationReport, CacheError> {
        self.apply(InvalidationTrigger::WalletRefreshed {
            wallet: wallet.to_string(),
            chain: chain.to_string(),
        })
        .await
    }

    pub async fn invalidate_protocol_data(&self, protocol: &str, chain: &str) -> Result<InvalidationReport, CacheError> {
        self.apply(InvalidationTrigger::ProtocolTvlChanged {
            protocol: protocol.to_string(),
            chain: chain.to_string(),
        })
        .await
    }

    /// Evicts analytics derived from a wallet while keeping its scan.
    pub async fn invalidate_wallet_dependents(&self, wallet: &str, chain: &str) -> Result<InvalidationReport, CacheError> {
        self.apply(InvalidationTrigger::PositionsChanged {
            wallet: wallet.to_string(),
            chain: chain.to_string(),
        })
        .await
    }

    async fn wallets_matching<F>(&self, chain: &str, holds: F) -> Result<Vec<String>, CacheError>
    where
        F: Fn(&WalletScanAggregate) -> bool,
    {
        let pattern = format!("{}:*:{}", cache_keys::SCAN, chain);
        let mut wallets = Vec::new();
        for key in self.cache.keys(&pattern).await? {
            if let Some(entry) = self.cache.peek::<WalletScanAggregate>(&key).await? {
                if holds(&entry.value) {
                    wallets.push(entry.value.wallet);
                }
            }
        }
        wallets.sort();
        Ok(wallets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_layer::{CacheStrategy, StrategyTable};
    use crate::cache_store::MemoryStore;
    use crate::types::positions::fixtures::position;
    use crate::types::ProtocolScanSummary;

    fn scan(wallet: &str, protocol: &str) -> WalletScanAggregate {
        WalletScanAggregate::aggregate(
            wallet,
            "ethereum",
            vec![ProtocolScanSummary::from_positions(
                protocol,
                "ethereum",
                vec![position("1", protocol, 100.0, 1.0, 5.0)],
            )],
        )
    }

    async fn seeded() -> (Arc<CacheLayer>, InvalidationManager) {
        let cache = Arc::new(CacheLayer::new(Arc::new(MemoryStore::new()), StrategyTable::default()));
        for (wallet, protocol) in [("0xa", "uniswap-v3"), ("0xb", "curve")] {
            cache
                .set(&cache_keys::scan(wallet, "ethereum"), &scan(wallet, protocol), CacheStrategy::ReadHeavy)
                .await
                .unwrap();
            cache
                .set(&cache_keys::analytics(wallet, "ethereum"), &1u8, CacheStrategy::Persistent)
                .await
                .unwrap();
        }
        cache.set(&cache_keys::price("WETH", "ethereum"), &3000.0f64, CacheStrategy::FastAccess).await.unwrap();
        cache.set(&cache_keys::tvl("curve", "ethereum"), &1.0f64, CacheStrategy::FastAccess).await.unwrap();
        let manager = InvalidationManager::new(cache.clone());
        (cache, manager)
    }

    #[test]
    fn test_every_trigger_has_a_rule() {
        for kind in [
            TriggerKind::PriceChanged,
            TriggerKind::WalletRefreshed,
            TriggerKind::ProtocolTvlChanged,
            TriggerKind::PositionsChanged,
        ] {
            assert!(RULES.iter().any(|r| r.trigger == kind));
        }
    }

    #[tokio::test]
    async fn test_price_change_cascades_to_holding_wallets() {
        let (cache, manager) = seeded().await;
        let report = manager.invalidate_price_data("WETH", "ethereum").await.unwrap();
        // both fixture wallets hold WETH
        assert_eq!(report.wallets_cascaded, vec!["0xa".to_string(), "0xb".to_string()]);
        assert_eq!(report.keys_removed, 5);
        assert!(cache.keys("scan:*").await.unwrap().is_empty());
        assert_eq!(cache.keys("tvl:*").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_tvl_change_cascades_only_to_protocol_holders() {
        let (cache, manager) = seeded().await;
        let report = manager.invalidate_protocol_data("curve", "ethereum").await.unwrap();
        assert_eq!(report.wallets_cascaded, vec!["0xb".to_string()]);
        assert_eq!(cache.keys("scan:*").await.unwrap(), vec!["scan:0xa:ethereum".to_string()]);
    }

    #[tokio::test]
    async fn test_positions_changed_keeps_scan() {
        let (cache, manager) = seeded().await;
        let report = manager.invalidate_wallet_dependents("0xa", "ethereum").await.unwrap();
        assert_eq!(report.keys_removed, 1);
        assert!(report.wallets_cascaded.is_empty());
        assert_eq!(cache.keys("scan:0xa:*").await.unwrap().len(), 1);
        assert!(cache.keys("analytics:0xa:*").await.unwrap().is_empty());
    }
}
