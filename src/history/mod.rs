//! Offline pretraining from historical decisions.
//!
//! Each JSON line holds one historical tick: the snapshot, the allocation
//! that was actually executed, and the PnL realized since the previous tick.
//! Consecutive ticks are replayed through the live State Builder and Reward
//! Calculator so pretraining sees exactly the transitions the live loop
//! would have produced.

use anyhow::{Context, Result};
use chrono::{FixedOffset, NaiveDate, Offset, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::allocation::{GroupTable, ALLOCATION_TOLERANCE};
use crate::config::Config;
use crate::error::AllocatorError;
use crate::market::MarketSnapshot;
use crate::policy::SacTrainer;
use crate::replay::{SharedReplay, Transition};
use crate::reward::RewardCalculator;
use crate::state::StateBuilder;

/// Smallest weight mapped back to a logit; keeps `ln w` finite.
pub const ACTION_LOG_FLOOR: f64 = 1e-4;

/// One historical decision tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoricalRecord {
    pub snapshot: MarketSnapshot,
    /// Executed allocation; all zeros when the system was paused
    pub weights: Vec<f64>,
    /// PnL realized since the previous record; falls back to the snapshot's
    /// broker-reported figure
    #[serde(default)]
    pub realized_pnl: Option<Decimal>,
}

impl HistoricalRecord {
    fn pnl(&self) -> Decimal {
        self.realized_pnl
            .unwrap_or(self.snapshot.portfolio.realized_pnl)
    }

    fn is_withdrawn(&self) -> bool {
        self.weights.iter().sum::<f64>() <= ALLOCATION_TOLERANCE
    }
}

/// Load a JSON-lines history file, sorted by snapshot time.
pub fn load_history<P: AsRef<Path>>(path: P) -> Result<Vec<HistoricalRecord>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read history file: {}", path.display()))?;
    let records = parse_history(&content)?;
    info!("📂 [HISTORY] Loaded {} records from {}", records.len(), path.display());
    Ok(records)
}

pub fn parse_history(content: &str) -> Result<Vec<HistoricalRecord>> {
    let mut records = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: HistoricalRecord = serde_json::from_str(line)
            .with_context(|| format!("Malformed history record at line {}", idx + 1))?;
        records.push(record);
    }
    records.sort_by_key(|r| r.snapshot.timestamp);
    Ok(records)
}

/// Map an executed allocation back to centred raw logits.
///
/// `softmax(weights_to_logits(w)) == w` whenever every `w >= ACTION_LOG_FLOOR`.
pub fn weights_to_logits(weights: &[f64]) -> Vec<f64> {
    let logs: Vec<f64> = weights
        .iter()
        .map(|w| w.max(ACTION_LOG_FLOOR).ln())
        .collect();
    let mean = logs.iter().sum::<f64>() / logs.len().max(1) as f64;
    logs.into_iter().map(|l| l - mean).collect()
}

/// Rebuild completed transitions from consecutive historical ticks.
///
/// Ticks whose executed allocation was withdrawn start no transition, the
/// same way supervisor overrides are excluded live.
pub fn reconstruct_transitions(
    records: &[HistoricalRecord],
    config: &Config,
    groups: &GroupTable,
) -> Result<Vec<Transition>> {
    let builder = StateBuilder::new(&config.schedule);
    let mut reward = RewardCalculator::new(&config.reward);
    let offset = FixedOffset::east_opt(config.schedule.session_utc_offset_minutes * 60)
        .unwrap_or_else(|| Utc.fix());

    let mut transitions = Vec::with_capacity(records.len().saturating_sub(1));
    let mut pending: Option<(Vec<f64>, Vec<f64>, NaiveDate)> = None;
    let mut current_session: Option<NaiveDate> = None;

    for (idx, record) in records.iter().enumerate() {
        if record.weights.len() != groups.len() {
            let err = AllocatorError::ConstraintViolation(format!(
                "history record {} has {} weights for {} groups",
                idx,
                record.weights.len(),
                groups.len()
            ));
            return Err(anyhow::Error::new(err)
                .context("History does not match the configured group table"));
        }

        let features = builder.build(&record.snapshot);
        let session = record.snapshot.timestamp.with_timezone(&offset).date_naive();
        if current_session != Some(session) {
            reward.reset_window();
            current_session = Some(session);
        }
        let (_, r) = reward.observe(&record.snapshot.portfolio, record.pnl());

        if let Some((state, action, decided_session)) = pending.take() {
            if r.is_finite() {
                let transition = Transition::new(
                    state,
                    action,
                    r,
                    features.values.clone(),
                    decided_session != session,
                    record.snapshot.timestamp,
                )
                .with_groups_version(groups.version());
                transitions.push(transition);
            } else {
                warn!(ts = %record.snapshot.timestamp, "Non-finite reward, transition skipped");
            }
        }

        if record.is_withdrawn() {
            debug!(ts = %record.snapshot.timestamp, "Withdrawn tick, no decision recorded");
        } else {
            pending = Some((features.values, weights_to_logits(&record.weights), session));
        }
    }

    info!(
        "🔁 [HISTORY] Reconstructed {} transitions from {} records",
        transitions.len(),
        records.len()
    );
    Ok(transitions)
}

/// Outcome of an offline pretraining run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PretrainReport {
    pub committed: u64,
    pub discarded: u64,
    pub halted: bool,
}

/// Run up to `steps` offline learning steps over `replay`.
///
/// Publishes one new parameter version at the end if anything committed.
pub fn pretrain(trainer: &mut SacTrainer, replay: &SharedReplay, steps: usize) -> PretrainReport {
    let mut report = PretrainReport::default();

    for step in 0..steps {
        match trainer.train_on(replay) {
            Ok(Some(learn)) => {
                report.committed += 1;
                if (step + 1) % 100 == 0 {
                    info!(
                        "🧠 [PRETRAIN] step {}/{} critic_loss={:.6} alpha={:.4}",
                        step + 1,
                        steps,
                        learn.critic_loss,
                        learn.alpha
                    );
                }
            }
            Ok(None) => {
                warn!("Replay store is empty, nothing to pretrain on");
                break;
            }
            Err(AllocatorError::LearningDivergence { .. }) => {
                report.discarded += 1;
                if trainer.is_halted() {
                    report.halted = true;
                    warn!("🚨 [PRETRAIN] Halted after repeated divergence");
                    break;
                }
            }
            Err(e) => {
                warn!("Pretraining step failed: {}", e);
                break;
            }
        }
    }

    if report.committed > 0 {
        trainer.publish_snapshot();
    }
    report
}
