//! Option-chain aggregates: put/call ratios, max pain, dealer gamma exposure.

use crate::market::ExpiryChain;

/// Put/call ratios for one expiry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PutCallRatios {
    pub open_interest: Option<f64>,
    pub volume: Option<f64>,
}

pub fn put_call_ratios(chain: &ExpiryChain) -> PutCallRatios {
    let (mut call_oi, mut put_oi, mut call_vol, mut put_vol) = (0.0, 0.0, 0.0, 0.0);
    for row in &chain.strikes {
        call_oi += row.call_oi;
        put_oi += row.put_oi;
        call_vol += row.call_volume;
        put_vol += row.put_volume;
    }

    let ratio = |puts: f64, calls: f64| (calls > 0.0 && puts > 0.0).then(|| puts / calls);
    PutCallRatios {
        open_interest: ratio(put_oi, call_oi),
        volume: ratio(put_vol, call_vol),
    }
}

/// Strike at which total option-holder payout at expiry is minimal.
pub fn max_pain(chain: &ExpiryChain) -> Option<f64> {
    chain
        .strikes
        .iter()
        .map(|settle| {
            let payout: f64 = chain
                .strikes
                .iter()
                .map(|row| {
                    let call = (settle.strike - row.strike).max(0.0) * row.call_oi;
                    let put = (row.strike - settle.strike).max(0.0) * row.put_oi;
                    call + put
                })
                .sum();
            (settle.strike, payout)
        })
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(strike, _)| strike)
}

/// Dealer gamma exposure aggregated over a chain.
///
/// Dealers are assumed long customer-sold calls and short customer-bought
/// puts, so call gamma counts positive and put gamma negative. Units are
/// notional per 1% move: `gamma * OI * lot * spot^2 * 0.01`.
#[derive(Debug, Clone, PartialEq)]
pub struct GammaProfile {
    pub call_gex: f64,
    pub put_gex: f64,
    /// Net exposure per strike, sorted by strike
    pub by_strike: Vec<(f64, f64)>,
}

impl GammaProfile {
    pub fn compute(chains: &[&ExpiryChain], spot: f64) -> Option<Self> {
        let mut by_strike: Vec<(f64, f64)> = Vec::new();
        let mut call_gex = 0.0;
        let mut put_gex = 0.0;
        let notional = spot * spot * 0.01;

        for chain in chains {
            for row in &chain.strikes {
                let call = row.call_gamma * row.call_oi * chain.lot_size * notional;
                let put = row.put_gamma * row.put_oi * chain.lot_size * notional;
                call_gex += call;
                put_gex += put;
                match by_strike.iter_mut().find(|(k, _)| (*k - row.strike).abs() < 1e-9) {
                    Some(entry) => entry.1 += call - put,
                    None => by_strike.push((row.strike, call - put)),
                }
            }
        }

        if by_strike.is_empty() {
            return None;
        }
        by_strike.sort_by(|a, b| a.0.total_cmp(&b.0));

        Some(Self {
            call_gex,
            put_gex,
            by_strike,
        })
    }

    pub fn net(&self) -> f64 {
        self.call_gex - self.put_gex
    }

    /// Strike where cumulative net exposure (walking up in strike) changes sign.
    pub fn flip_level(&self) -> Option<f64> {
        let mut cumulative = 0.0;
        let mut prev: Option<(f64, f64)> = None;
        for &(strike, gex) in &self.by_strike {
            let next = cumulative + gex;
            if let Some((prev_strike, prev_cum)) = prev {
                if prev_cum != 0.0 && prev_cum.signum() != next.signum() {
                    // Linear interpolation between the two strikes.
                    let t = prev_cum.abs() / (prev_cum.abs() + next.abs());
                    return Some(prev_strike + t * (strike - prev_strike));
                }
            }
            cumulative = next;
            prev = Some((strike, cumulative));
        }
        None
    }

    /// Share of absolute exposure held by the three largest strikes.
    pub fn concentration(&self) -> f64 {
        let mut magnitudes: Vec<f64> = self.by_strike.iter().map(|(_, g)| g.abs()).collect();
        let total: f64 = magnitudes.iter().sum();
        if total <= 0.0 {
            return 0.0;
        }
        magnitudes.sort_by(|a, b| b.total_cmp(a));
        magnitudes.iter().take(3).sum::<f64>() / total
    }
}

/// ATM implied volatility: mean of call and put IV at the strike nearest spot.
pub fn atm_iv(chain: &ExpiryChain, spot: f64) -> Option<f64> {
    let row = chain
        .strikes
        .iter()
        .min_by(|a, b| (a.strike - spot).abs().total_cmp(&(b.strike - spot).abs()))?;
    match (row.call_iv, row.put_iv) {
        (Some(c), Some(p)) => Some((c + p) / 2.0),
        (Some(v), None) | (None, Some(v)) => Some(v),
        (None, None) => None,
    }
}

/// OTM put IV minus OTM call IV within `band` (fraction of spot) of spot.
pub fn skew(chain: &ExpiryChain, spot: f64, band: f64) -> Option<f64> {
    let lower = spot * (1.0 - band);
    let upper = spot * (1.0 + band);

    let puts: Vec<f64> = chain
        .strikes
        .iter()
        .filter(|r| r.strike >= lower && r.strike < spot)
        .filter_map(|r| r.put_iv)
        .collect();
    let calls: Vec<f64> = chain
        .strikes
        .iter()
        .filter(|r| r.strike > spot && r.strike <= upper)
        .filter_map(|r| r.call_iv)
        .collect();

    if puts.is_empty() || calls.is_empty() {
        return None;
    }
    let mean = |v: &[f64]| v.iter().sum::<f64>() / v.len() as f64;
    Some(mean(&puts) - mean(&calls))
}
