//! Reward Calculator.
//!
//! `reward = pnl / value - k1 * trailing_max_drawdown - k2 * |exposure|`.
//! A pure function of realized outcomes; the action that produced them never
//! enters the computation.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::VecDeque;
use tracing::debug;

use crate::config::RewardConfig;
use crate::market::PortfolioSnapshot;

/// Maximum drawdown over the last `window` sub-intervals.
///
/// Keeps `window + 1` portfolio values so the window spans `window` moves.
#[derive(Debug, Clone)]
pub struct TrailingDrawdown {
    window: usize,
    values: VecDeque<Decimal>,
}

impl TrailingDrawdown {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            values: VecDeque::with_capacity(window + 1),
        }
    }

    /// Record a portfolio value and return the drawdown inside the window.
    pub fn update(&mut self, value: Decimal) -> f64 {
        self.values.push_back(value);
        while self.values.len() > self.window + 1 {
            self.values.pop_front();
        }
        self.max_drawdown()
    }

    /// Largest peak-to-trough fall, as a fraction of the peak (0.0-1.0).
    pub fn max_drawdown(&self) -> f64 {
        let mut peak = Decimal::ZERO;
        let mut worst = Decimal::ZERO;

        for &value in &self.values {
            if value > peak {
                peak = value;
            } else if peak > Decimal::ZERO {
                let drawdown = (peak - value) / peak;
                if drawdown > worst {
                    worst = drawdown;
                }
            }
        }

        worst.to_f64().unwrap_or(0.0)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Forget the window (new session or restart).
    pub fn reset(&mut self) {
        self.values.clear();
    }
}

/// Realized outcomes attributable to one decision window.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    /// PnL realized since the previous decision
    pub realized_pnl: Decimal,
    pub portfolio_value: Decimal,
    /// Trailing maximum drawdown (0.0-1.0)
    pub max_drawdown: f64,
    /// Normalized net directional exposure
    pub normalized_exposure: f64,
}

#[derive(Debug, Clone)]
pub struct RewardCalculator {
    drawdown_penalty: f64,
    exposure_penalty: f64,
    drawdown: TrailingDrawdown,
}

impl RewardCalculator {
    pub fn new(config: &RewardConfig) -> Self {
        Self {
            drawdown_penalty: config.drawdown_penalty,
            exposure_penalty: config.exposure_penalty,
            drawdown: TrailingDrawdown::new(config.drawdown_window),
        }
    }

    /// Reward for an already assembled outcome.
    pub fn compute(&self, outcome: &Outcome) -> f64 {
        let pnl_term = if outcome.portfolio_value > Decimal::ZERO {
            (outcome.realized_pnl / outcome.portfolio_value)
                .to_f64()
                .unwrap_or(0.0)
        } else {
            0.0
        };

        pnl_term
            - self.drawdown_penalty * outcome.max_drawdown.max(0.0)
            - self.exposure_penalty * outcome.normalized_exposure.abs()
    }

    /// Advance the trailing drawdown with the latest portfolio and score the window.
    ///
    /// `realized_pnl` comes from the dispatcher report for the previous
    /// directive.
    pub fn observe(&mut self, portfolio: &PortfolioSnapshot, realized_pnl: Decimal) -> (Outcome, f64) {
        let max_drawdown = self.drawdown.update(portfolio.value);
        let outcome = Outcome {
            realized_pnl,
            portfolio_value: portfolio.value,
            max_drawdown,
            normalized_exposure: portfolio.normalized_delta.unwrap_or(0.0),
        };
        let reward = self.compute(&outcome);

        debug!(
            pnl = %outcome.realized_pnl,
            value = %outcome.portfolio_value,
            drawdown = outcome.max_drawdown,
            exposure = outcome.normalized_exposure,
            reward,
            "Reward computed"
        );

        (outcome, reward)
    }

    pub fn reset_window(&mut self) {
        self.drawdown.reset();
    }
}
