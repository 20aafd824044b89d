//! Inbound market-data boundary.
//!
//! The core never fetches data itself; a [`SnapshotSource`] hands it one
//! assembled [`MarketSnapshot`] per tick.

mod feed;
mod snapshot;

pub use feed::{JsonlFeed, SnapshotSource, VecFeed};
pub use snapshot::{
    ExpiryChain, MarketSnapshot, OiDelta, OpenInterestChanges, PortfolioSnapshot, SessionRange,
    StrikeRow, VolatilitySummary,
};
