//! Outbound boundary to the Strategy Zoo.

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::allocation::GroupTable;
use crate::market::MarketSnapshot;
use crate::risk::Directive;

/// Execution results the allocator consumes from the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchReport {
    pub orders_submitted: u32,
    /// PnL realized since the previous directive was dispatched
    pub realized_pnl: Decimal,
}

/// Turns per-group weights into concrete orders.
///
/// The allocator never interprets the report beyond `realized_pnl`.
#[async_trait]
pub trait StrategyDispatcher: Send {
    async fn dispatch(
        &mut self,
        directive: &Directive,
        snapshot: &MarketSnapshot,
    ) -> Result<DispatchReport>;
}

/// Paper dispatcher: logs the directive and echoes the broker-reported PnL.
pub struct PaperDispatcher {
    group_ids: Vec<String>,
    dispatched: u64,
    last_weights: Vec<f64>,
}

impl PaperDispatcher {
    pub fn new(groups: &GroupTable) -> Self {
        Self {
            group_ids: groups.ids().into_iter().map(String::from).collect(),
            dispatched: 0,
            last_weights: Vec::new(),
        }
    }

    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    pub fn last_weights(&self) -> &[f64] {
        &self.last_weights
    }
}

#[async_trait]
impl StrategyDispatcher for PaperDispatcher {
    async fn dispatch(
        &mut self,
        directive: &Directive,
        snapshot: &MarketSnapshot,
    ) -> Result<DispatchReport> {
        let weights = directive.weights();
        let summary: Vec<String> = self
            .group_ids
            .iter()
            .zip(weights)
            .filter(|(_, w)| **w > 0.0)
            .map(|(id, w)| format!("{}={:.3}", id, w))
            .collect();

        if directive.is_override() {
            info!(
                "🛡️  [DISPATCH] Override at {}: {}",
                snapshot.timestamp,
                if summary.is_empty() {
                    "all weight withdrawn".to_string()
                } else {
                    summary.join(" ")
                }
            );
        } else {
            info!("📤 [DISPATCH] Allocation at {}: {}", snapshot.timestamp, summary.join(" "));
        }

        let report = DispatchReport {
            orders_submitted: weights.iter().filter(|w| **w > 0.0).count() as u32,
            realized_pnl: snapshot.portfolio.realized_pnl,
        };
        debug!(
            orders = report.orders_submitted,
            pnl = %report.realized_pnl,
            "Paper dispatch complete"
        );

        self.dispatched += 1;
        self.last_weights = weights.to_vec();
        Ok(report)
    }
}
