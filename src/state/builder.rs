//! Snapshot -> feature vector mapping.

use chrono::{Datelike, Duration, FixedOffset, Offset, Timelike, Utc};
use serde::{Deserialize, Serialize};

use super::chain::{self, GammaProfile};
use super::indicators;
use crate::config::ScheduleConfig;
use crate::market::MarketSnapshot;

/// Feature layout version. Bump on any change to length, order or scaling;
/// stored transitions and checkpoints from another version are rejected.
pub const FEATURE_VERSION: u32 = 1;

/// Number of features in the state vector.
pub const STATE_DIM: usize = 34;

/// Ordered feature names; index `i` names `FeatureVector::values[i]`.
pub const FEATURE_NAMES: [&str; STATE_DIM] = [
    // price / returns
    "ret_1",
    "ret_6",
    "ret_session",
    "realized_vol",
    "range_position",
    "spot_vs_sma20",
    // implied volatility
    "iv_percentile",
    "atm_iv",
    // put/call ratios
    "pcr_oi_near",
    "pcr_volume_near",
    "pcr_oi_next",
    "pcr_volume_next",
    // max pain
    "max_pain_distance",
    // dealer gamma exposure
    "gex_net",
    "gex_call",
    "gex_put",
    // gamma profile shape
    "gamma_flip_distance",
    "gamma_concentration",
    // skew / term structure
    "skew",
    "term_slope",
    // open interest deltas
    "call_oi_delta_short",
    "put_oi_delta_short",
    "call_oi_delta_long",
    "put_oi_delta_long",
    // price deviation
    "price_zscore",
    // technicals
    "rsi",
    "macd_histogram",
    "bollinger_pct_b",
    // time context
    "time_to_expiry",
    "day_of_week",
    "session_progress",
    // portfolio greeks
    "portfolio_delta",
    "portfolio_gamma",
    "portfolio_vega",
];

/// Notional per 1% move at which gamma features saturate.
const GEX_SCALE: f64 = 1.0e10;

/// Source data that was missing or unusable on this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DegradedField {
    SpotHistory,
    ShortHistory,
    SessionOpen,
    SessionRange,
    Volatility,
    NearChain,
    NextChain,
    OpenInterestChanges,
    PortfolioGreeks,
    NonFiniteFeature(usize),
}

/// Fixed-length normalized state for one decision tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub version: u32,
    pub values: Vec<f64>,
    pub degraded: Vec<DegradedField>,
    /// Raw net dealer gamma exposure, for the supervisor
    pub net_gamma_exposure: Option<f64>,
    /// Raw IV percentile, for the supervisor
    pub iv_percentile: Option<f64>,
}

impl FeatureVector {
    pub fn is_degraded(&self) -> bool {
        !self.degraded.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        FEATURE_NAMES
            .iter()
            .position(|n| *n == name)
            .map(|i| self.values[i])
    }
}

/// Pure mapping from a snapshot to a [`FeatureVector`].
///
/// Neutral defaults used when a source block is missing:
///
/// | features                         | default |
/// |----------------------------------|---------|
/// | returns, z-score, distances, OI  | 0.0     |
/// | realized vol                     | 0.0     |
/// | range position, %B, IV pct, RSI  | 0.5     |
/// | ATM IV                           | 0.3 (15% IV) |
/// | put/call ratios                  | 0.0 (ratio 1) |
/// | gamma concentration              | 0.0     |
/// | time to expiry                   | 0.5     |
/// | portfolio greeks                 | 0.0     |
#[derive(Debug, Clone)]
pub struct StateBuilder {
    offset: FixedOffset,
    session_open_minutes: u32,
    session_minutes: u32,
}

impl StateBuilder {
    pub fn new(schedule: &ScheduleConfig) -> Self {
        let offset = FixedOffset::east_opt(schedule.session_utc_offset_minutes * 60)
            .unwrap_or_else(|| Utc.fix());
        Self {
            offset,
            session_open_minutes: schedule.session_open_hour * 60 + schedule.session_open_minute,
            session_minutes: schedule.session_minutes,
        }
    }

    /// Build the feature vector. Never fails: missing inputs degrade.
    pub fn build(&self, snapshot: &MarketSnapshot) -> FeatureVector {
        let mut values = Vec::with_capacity(STATE_DIM);
        let mut degraded = Vec::new();
        let closes = &snapshot.spot_history;
        let spot = snapshot.spot();

        if spot.is_none() {
            degraded.push(DegradedField::SpotHistory);
        } else if closes.len() < 35 {
            degraded.push(DegradedField::ShortHistory);
        }

        // price / returns
        values.push(scaled(indicators::log_return(closes, 1), 0.01, 5.0, 0.0));
        values.push(scaled(indicators::log_return(closes, 6), 0.02, 5.0, 0.0));
        let session_ret = match (spot, snapshot.session_open) {
            (Some(s), Some(open)) if open > 0.0 => Some((s / open).ln()),
            _ => {
                degraded.push(DegradedField::SessionOpen);
                None
            }
        };
        values.push(scaled(session_ret, 0.02, 5.0, 0.0));
        values.push(
            indicators::realized_vol(closes, 20)
                .map(|v| (v / 0.01).clamp(0.0, 5.0))
                .unwrap_or(0.0),
        );
        let range_pos = match (spot, &snapshot.session_range) {
            (Some(s), Some(r)) if r.high > r.low => {
                Some(((s - r.low) / (r.high - r.low)).clamp(0.0, 1.0))
            }
            (Some(_), Some(_)) => Some(0.5),
            _ => {
                degraded.push(DegradedField::SessionRange);
                None
            }
        };
        values.push(range_pos.unwrap_or(0.5));
        let vs_sma = match (spot, indicators::sma(closes, 20)) {
            (Some(s), Some(m)) if m > 0.0 => Some(s / m - 1.0),
            _ => None,
        };
        values.push(scaled(vs_sma, 0.01, 5.0, 0.0));

        // implied volatility
        let iv_percentile = snapshot
            .volatility
            .as_ref()
            .map(|v| v.iv_percentile.clamp(0.0, 1.0));
        if snapshot.volatility.is_none() {
            degraded.push(DegradedField::Volatility);
        }
        values.push(iv_percentile.unwrap_or(0.5));
        values.push(
            snapshot
                .volatility
                .as_ref()
                .map(|v| (v.atm_iv / 0.5).clamp(0.0, 2.0))
                .unwrap_or(0.3),
        );

        // put/call ratios
        let near = snapshot.near_chain.as_ref().filter(|c| !c.strikes.is_empty());
        let next = snapshot.next_chain.as_ref().filter(|c| !c.strikes.is_empty());
        if near.is_none() {
            degraded.push(DegradedField::NearChain);
        }
        if next.is_none() {
            degraded.push(DegradedField::NextChain);
        }
        for expiry_chain in [near, next] {
            let pcr = expiry_chain.map(chain::put_call_ratios);
            values.push(pcr_feature(pcr.and_then(|p| p.open_interest)));
            values.push(pcr_feature(pcr.and_then(|p| p.volume)));
        }

        // max pain
        let max_pain_dist = match (spot, near.and_then(chain::max_pain)) {
            (Some(s), Some(mp)) => Some((s - mp) / s),
            _ => None,
        };
        values.push(scaled(max_pain_dist, 0.02, 5.0, 0.0));

        // dealer gamma exposure and profile shape
        let chains: Vec<_> = [near, next].into_iter().flatten().collect();
        let profile = spot.and_then(|s| GammaProfile::compute(&chains, s));
        let net_gamma_exposure = profile.as_ref().map(|p| p.net());
        values.push(profile.as_ref().map(|p| (p.net() / GEX_SCALE).tanh()).unwrap_or(0.0));
        values.push(profile.as_ref().map(|p| (p.call_gex / GEX_SCALE).tanh()).unwrap_or(0.0));
        values.push(profile.as_ref().map(|p| (p.put_gex / GEX_SCALE).tanh()).unwrap_or(0.0));
        let flip_dist = match (spot, profile.as_ref().and_then(|p| p.flip_level())) {
            (Some(s), Some(flip)) => Some((s - flip) / s),
            _ => None,
        };
        values.push(scaled(flip_dist, 0.02, 5.0, 0.0));
        values.push(profile.as_ref().map(|p| p.concentration()).unwrap_or(0.0));

        // skew / term structure
        let skew = match (spot, near) {
            (Some(s), Some(c)) => chain::skew(c, s, 0.05),
            _ => None,
        };
        values.push(scaled(skew, 0.05, 5.0, 0.0));
        let term = match (spot, near, next) {
            (Some(s), Some(n), Some(x)) => match (chain::atm_iv(n, s), chain::atm_iv(x, s)) {
                (Some(a), Some(b)) => Some(b - a),
                _ => None,
            },
            _ => None,
        };
        values.push(scaled(term, 0.05, 5.0, 0.0));

        // open interest deltas
        match &snapshot.oi_changes {
            Some(oi) => {
                for x in [
                    oi.short_window.calls,
                    oi.short_window.puts,
                    oi.long_window.calls,
                    oi.long_window.puts,
                ] {
                    values.push(scaled(Some(x), 0.1, 5.0, 0.0));
                }
            }
            None => {
                degraded.push(DegradedField::OpenInterestChanges);
                values.extend([0.0; 4]);
            }
        }

        // price deviation
        values.push(scaled(indicators::zscore(closes, 20), 1.0, 5.0, 0.0));

        // technicals
        values.push(indicators::rsi(closes, 14).map(|r| r / 100.0).unwrap_or(0.5));
        let macd = match (spot, indicators::macd_histogram(closes, 12, 26, 9)) {
            (Some(s), Some(h)) => Some(h / s),
            _ => None,
        };
        values.push(scaled(macd, 0.001, 5.0, 0.0));
        values.push(
            indicators::bollinger_pct_b(closes, 20, 2.0)
                .map(|b| b.clamp(-0.5, 1.5))
                .unwrap_or(0.5),
        );

        // time context
        let local = snapshot.timestamp.with_timezone(&self.offset);
        let tte = near.map(|c| {
            let remaining = c.expiry - snapshot.timestamp;
            (remaining.num_minutes().max(0) as f64 / Duration::days(7).num_minutes() as f64)
                .clamp(0.0, 2.0)
        });
        values.push(tte.unwrap_or(0.5));
        values.push(local.weekday().num_days_from_monday() as f64 / 6.0);
        let minutes_of_day = local.hour() * 60 + local.minute();
        let since_open = minutes_of_day as f64 - self.session_open_minutes as f64;
        values.push((since_open / self.session_minutes as f64).clamp(0.0, 1.0));

        // portfolio greeks
        let portfolio = &snapshot.portfolio;
        let greeks = [
            portfolio.normalized_delta,
            portfolio.normalized_gamma,
            portfolio.normalized_vega,
        ];
        if greeks.iter().any(Option::is_none) {
            degraded.push(DegradedField::PortfolioGreeks);
        }
        for g in greeks {
            values.push(scaled(g, 1.0, 5.0, 0.0));
        }

        debug_assert_eq!(values.len(), STATE_DIM);

        for (i, v) in values.iter_mut().enumerate() {
            if !v.is_finite() {
                *v = 0.0;
                degraded.push(DegradedField::NonFiniteFeature(i));
            }
        }

        FeatureVector {
            version: FEATURE_VERSION,
            values,
            degraded,
            net_gamma_exposure,
            iv_percentile,
        }
    }
}

/// `x / scale` clipped to `[-limit, limit]`, or the default when missing.
fn scaled(x: Option<f64>, scale: f64, limit: f64, default: f64) -> f64 {
    match x {
        Some(v) if v.is_finite() => (v / scale).clamp(-limit, limit),
        _ => default,
    }
}

/// tanh(ln(pcr)): 0 at parity, bounded in (-1, 1).
fn pcr_feature(pcr: Option<f64>) -> f64 {
    match pcr {
        Some(r) if r > 0.0 && r.is_finite() => r.ln().tanh(),
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::fixtures;

    fn builder() -> StateBuilder {
        StateBuilder::new(&ScheduleConfig::default())
    }

    #[test]
    fn test_complete_snapshot_is_not_degraded() {
        let snapshot = fixtures::complete_snapshot(fixtures::monday_midday());
        let features = builder().build(&snapshot);

        assert_eq!(features.values.len(), STATE_DIM);
        assert_eq!(features.version, FEATURE_VERSION);
        assert!(!features.is_degraded(), "degraded: {:?}", features.degraded);
        assert!(features.net_gamma_exposure.is_some());
        assert!(features.values.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_bounded_features_in_range() {
        let snapshot = fixtures::complete_snapshot(fixtures::monday_midday());
        let features = builder().build(&snapshot);

        for name in ["iv_percentile", "range_position", "rsi", "gamma_concentration"] {
            let v = features.get(name).unwrap();
            assert!((0.0..=1.0).contains(&v), "{} = {}", name, v);
        }
        for v in &features.values {
            assert!(v.abs() <= 5.0);
        }
        // 11:45 IST on a Monday, 150 minutes into a 375 minute session.
        assert_eq!(features.get("day_of_week"), Some(0.0));
        assert!((features.get("session_progress").unwrap() - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_identical_snapshot_identical_vector() {
        let snapshot = fixtures::complete_snapshot(fixtures::monday_midday());
        let b = builder();
        let first = b.build(&snapshot);
        let second = b.build(&snapshot.clone());
        assert_eq!(first, second);
        assert_eq!(
            first.values.iter().map(|v| v.to_bits()).collect::<Vec<_>>(),
            second.values.iter().map(|v| v.to_bits()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_missing_open_interest_substitutes_defaults() {
        let mut snapshot = fixtures::complete_snapshot(fixtures::monday_midday());
        snapshot.oi_changes = None;
        snapshot.near_chain = None;
        snapshot.next_chain = None;

        let features = builder().build(&snapshot);
        assert!(features.is_degraded());
        assert!(features.degraded.contains(&DegradedField::OpenInterestChanges));
        assert!(features.degraded.contains(&DegradedField::NearChain));
        assert_eq!(features.get("call_oi_delta_short"), Some(0.0));
        assert_eq!(features.get("pcr_oi_near"), Some(0.0));
        assert_eq!(features.get("max_pain_distance"), Some(0.0));
        assert_eq!(features.get("time_to_expiry"), Some(0.5));
        assert!(features.net_gamma_exposure.is_none());
        assert_eq!(features.values.len(), STATE_DIM);
    }

    #[test]
    fn test_empty_snapshot_still_full_length() {
        let mut snapshot = fixtures::complete_snapshot(fixtures::monday_midday());
        snapshot.spot_history.clear();
        snapshot.volatility = None;
        snapshot.portfolio.normalized_delta = None;

        let features = builder().build(&snapshot);
        assert_eq!(features.values.len(), STATE_DIM);
        assert!(features.degraded.contains(&DegradedField::SpotHistory));
        assert!(features.degraded.contains(&DegradedField::PortfolioGreeks));
        assert_eq!(features.get("rsi"), Some(0.5));
    }

    #[test]
    fn test_feature_names_unique() {
        let mut names = FEATURE_NAMES.to_vec();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), STATE_DIM);
    }
}
