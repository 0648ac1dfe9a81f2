use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cached token price (`price:<token>:<chain>`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenPrice {
    pub token: String,
    pub chain: String,
    pub price_usd: f64,
    pub updated_at: DateTime<Utc>,
}

/// Cached protocol TVL (`tvl:<protocol>:<chain>`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolTvl {
    pub protocol: String,
    pub chain: String,
    pub tvl_usd: f64,
    pub updated_at: DateTime<Utc>,
}
