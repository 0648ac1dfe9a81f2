// Source Adapters
// Implementations of the position/market source capabilities

pub mod fixture;

pub use crate::position_source::{MarketDataSource, PositionSource};
pub use fixture::{FixtureProtocol, FixtureSource};
