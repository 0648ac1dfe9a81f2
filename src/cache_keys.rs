//! Cache key namespaces
//!
//! Stable prefixes consumed by the API boundary and the dashboard. Every component
//! builds keys through these helpers so the schema lives in one place.

pub const SCAN: &str = "scan";
pub const POSITIONS: &str = "positions";
pub const PRICE: &str = "price";
pub const TVL: &str = "tvl";
pub const ANALYTICS: &str = "analytics";
pub const PROTOCOL_ANALYTICS: &str = "protocol-analytics";
pub const OPTIMIZATION: &str = "optimization";
pub const RISK: &str = "risk";
pub const HISTORY: &str = "history";
pub const QUEUE: &str = "queue";

/// Namespaces holding cached data (broker snapshots excluded).
pub const DATA_NAMESPACES: &[&str] = &[
    SCAN,
    POSITIONS,
    PRICE,
    TVL,
    ANALYTICS,
    PROTOCOL_ANALYTICS,
    OPTIMIZATION,
    RISK,
    HISTORY,
];

pub fn scan(wallet: &str, chain: &str) -> String {
    format!("{}:{}:{}", SCAN, wallet, chain)
}

pub fn positions(wallet: &str, protocol: &str, chain: &str) -> String {
    format!("{}:{}:{}:{}", POSITIONS, wallet, protocol, chain)
}

pub fn price(token: &str, chain: &str) -> String {
    format!("{}:{}:{}", PRICE, token, chain)
}

pub fn tvl(protocol: &str, chain: &str) -> String {
    format!("{}:{}:{}", TVL, protocol, chain)
}

pub fn analytics(wallet: &str, chain: &str) -> String {
    format!("{}:{}:{}", ANALYTICS, wallet, chain)
}

pub fn protocol_analytics(protocol: &str, chain: &str) -> String {
    format!("{}:{}:{}", PROTOCOL_ANALYTICS, protocol, chain)
}

pub fn optimization(wallet: &str, chain: &str) -> String {
    format!("{}:{}:{}", OPTIMIZATION, wallet, chain)
}

pub fn risk(wallet: &str, chain: &str) -> String {
    format!("{}:{}:{}", RISK, wallet, chain)
}

pub fn history(wallet: &str, chain: &str, start: i64, end: i64) -> String {
    format!("{}:{}:{}:{}:{}", HISTORY, wallet, chain, start, end)
}

pub fn queue_job(queue: &str, job_id: &str) -> String {
    format!("{}:{}:job:{}", QUEUE, queue, job_id)
}

/// Pattern covering every key of a namespace.
pub fn namespace_pattern(namespace: &str) -> String {
    format!("{}:*", namespace)
}

/// A cache key split back into its namespace and components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedKey {
    Scan { wallet: String, chain: String },
    Positions { wallet: String, protocol: String, chain: String },
    Price { token: String, chain: String },
    Tvl { protocol: String, chain: String },
    Analytics { wallet: String, chain: String },
    ProtocolAnalytics { protocol: String, chain: String },
    Optimization { wallet: String, chain: String },
    Risk { wallet: String, chain: String },
    History { wallet: String, chain: String, start: i64, end: i64 },
}

pub fn parse(key: &str) -> Option<ParsedKey> {
    let parts: Vec<&str> = key.split(':').collect();
    let s = |i: usize| parts[i].to_string();
    match (parts.first().copied(), parts.len()) {
        (Some(SCAN), 3) => Some(ParsedKey::Scan { wallet: s(1), chain: s(2) }),
        (Some(POSITIONS), 4) => Some(ParsedKey::Positions {
            wallet: s(1),
            protocol: s(2),
            chain: s(3),
        }),
        (Some(PRICE), 3) => Some(ParsedKey::Price { token: s(1), chain: s(2) }),
        (Some(TVL), 3) => Some(ParsedKey::Tvl { protocol: s(1), chain: s(2) }),
        (Some(ANALYTICS), 3) => Some(ParsedKey::Analytics { wallet: s(1), chain: s(2) }),
        (Some(PROTOCOL_ANALYTICS), 3) => Some(ParsedKey::ProtocolAnalytics {
            protocol: s(1),
            chain: s(2),
        }),
        (Some(OPTIMIZATION), 3) => Some(ParsedKey::Optimization { wallet: s(1), chain: s(2) }),
        (Some(RISK), 3) => Some(ParsedKey::Risk { wallet: s(1), chain: s(2) }),
        (Some(HISTORY), 5) => Some(ParsedKey::History {
            wallet: s(1),
            chain: s(2),
            start: parts[3].parse().ok()?,
            end: parts[4].parse().ok()?,
        }),
        _ => None,
    }
}

/// Namespace prefix of a key (`scan`, `price`, ...).
pub fn namespace_of(key: &str) -> &str {
    key.split(':').next().unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(scan("0xabc", "ethereum"), "scan:0xabc:ethereum");
        assert_eq!(positions("0xabc", "uniswap-v3", "base"), "positions:0xabc:uniswap-v3:base");
        assert_eq!(history("0xabc", "base", 10, 20), "history:0xabc:base:10:20");
        assert_eq!(queue_job("wallet-scan", "42"), "queue:wallet-scan:job:42");
    }

    #[test]
    fn test_parse_round_trips_known_namespaces() {
        assert_eq!(
            parse("positions:0xabc:curve:arbitrum"),
            Some(ParsedKey::Positions {
                wallet: "0xabc".into(),
                protocol: "curve".into(),
                chain: "arbitrum".into()
            })
        );
        assert_eq!(
            parse("history:0xabc:base:1:2"),
            Some(ParsedKey::History {
                wallet: "0xabc".into(),
                chain: "base".into(),
                start: 1,
                end: 2
            })
        );
        assert_eq!(parse("history:0xabc:base:x:2"), None);
        assert_eq!(parse("queue:wallet-scan:job:1"), None);
        assert_eq!(namespace_of("price:eth:base"), "price");
    }
}
