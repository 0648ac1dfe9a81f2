//! Domain types shared by sources, processors and the cache.

pub mod market;
pub mod positions;

pub use market::{ProtocolTvl, TokenPrice};
pub use positions::{LpPosition, ProtocolScanSummary, TokenAmount, WalletScanAggregate};
