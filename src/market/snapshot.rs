//! Market and portfolio snapshot consumed once per decision tick.
//!
//! Every analytics block is optional; a missing block is substituted by the
//! State Builder and flagged as degraded rather than failing the tick.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Everything the allocator needs from the data provider for one tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarketSnapshot {
    /// Wall-clock time the snapshot was assembled
    pub timestamp: DateTime<Utc>,
    /// Underlying closes, oldest first; the last entry is the current spot
    #[serde(default)]
    pub spot_history: Vec<f64>,
    /// Session open price of the underlying
    #[serde(default)]
    pub session_open: Option<f64>,
    /// Session high and low of the underlying
    #[serde(default)]
    pub session_range: Option<SessionRange>,
    #[serde(default)]
    pub volatility: Option<VolatilitySummary>,
    /// Nearest expiry chain
    #[serde(default)]
    pub near_chain: Option<ExpiryChain>,
    /// Following expiry chain
    #[serde(default)]
    pub next_chain: Option<ExpiryChain>,
    #[serde(default)]
    pub oi_changes: Option<OpenInterestChanges>,
    pub portfolio: PortfolioSnapshot,
}

impl MarketSnapshot {
    /// Current spot price, if any history was supplied.
    pub fn spot(&self) -> Option<f64> {
        self.spot_history.last().copied().filter(|s| s.is_finite() && *s > 0.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRange {
    pub high: f64,
    pub low: f64,
}

/// Implied-volatility surface summary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VolatilitySummary {
    /// At-the-money IV of the near expiry (annualized, e.g. 0.14)
    pub atm_iv: f64,
    /// Percentile of current IV against its trailing year (0.0-1.0)
    pub iv_percentile: f64,
}

/// Per-strike open interest, volume and Greeks for one expiry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExpiryChain {
    pub expiry: DateTime<Utc>,
    /// Contract multiplier used for gamma exposure
    #[serde(default = "default_lot_size")]
    pub lot_size: f64,
    pub strikes: Vec<StrikeRow>,
}

fn default_lot_size() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StrikeRow {
    pub strike: f64,
    pub call_oi: f64,
    pub put_oi: f64,
    #[serde(default)]
    pub call_volume: f64,
    #[serde(default)]
    pub put_volume: f64,
    #[serde(default)]
    pub call_gamma: f64,
    #[serde(default)]
    pub put_gamma: f64,
    #[serde(default)]
    pub call_iv: Option<f64>,
    #[serde(default)]
    pub put_iv: Option<f64>,
}

/// Fractional open-interest changes over the two lookback windows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OpenInterestChanges {
    pub short_window: OiDelta,
    pub long_window: OiDelta,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OiDelta {
    /// Relative change in total call OI (0.1 = +10%)
    pub calls: f64,
    /// Relative change in total put OI
    pub puts: f64,
}

/// Current portfolio exposures as reported by position bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortfolioSnapshot {
    /// Portfolio value (equity)
    pub value: Decimal,
    /// PnL realized since the previous decision
    #[serde(default)]
    pub realized_pnl: Decimal,
    /// Cumulative PnL today as a fraction of start-of-day value (negative = loss)
    #[serde(default)]
    pub daily_pnl_fraction: Decimal,
    /// Gross exposure divided by equity
    #[serde(default)]
    pub leverage: Decimal,
    /// Net delta normalized by portfolio value
    #[serde(default)]
    pub normalized_delta: Option<f64>,
    /// Net gamma normalized by portfolio value
    #[serde(default)]
    pub normalized_gamma: Option<f64>,
    /// Net vega normalized by portfolio value
    #[serde(default)]
    pub normalized_vega: Option<f64>,
}

impl PortfolioSnapshot {
    /// A flat portfolio with the given value.
    pub fn flat(value: Decimal) -> Self {
        Self {
            value,
            realized_pnl: Decimal::ZERO,
            daily_pnl_fraction: Decimal::ZERO,
            leverage: Decimal::ZERO,
            normalized_delta: Some(0.0),
            normalized_gamma: Some(0.0),
            normalized_vega: Some(0.0),
        }
    }
}
