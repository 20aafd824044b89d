//! Configuration management for the allocator.
//!
//! Loads settings from an optional `allocator.toml` and `ALLOC__*` environment
//! variables. Everything here is immutable for the lifetime of the process;
//! changing the group table requires a restart with a new `groups_version`.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::AllocatorError;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Strategy group table
    #[serde(default)]
    pub groups: GroupsConfig,
    /// Risk limits and supervisor tuning
    #[serde(default)]
    pub risk: RiskLimitsConfig,
    /// Reward weighting
    #[serde(default)]
    pub reward: RewardConfig,
    /// Tick cadence and session calendar
    #[serde(default)]
    pub schedule: ScheduleConfig,
    /// Actor-critic hyperparameters
    #[serde(default)]
    pub learning: LearningConfig,
    /// Prioritized replay settings
    #[serde(default)]
    pub replay: ReplayConfig,
    /// Checkpoint and archive storage
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupsConfig {
    /// Bumped whenever membership or caps change; stored with checkpoints
    #[serde(default = "default_groups_version")]
    pub groups_version: u32,
    #[serde(default = "default_groups")]
    pub groups: Vec<StrategyGroupConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyGroupConfig {
    /// Stable identifier (e.g., "vol_selling")
    pub id: String,
    /// Human label for logs and reports
    pub label: String,
    /// Member strategies dispatched by the Strategy Zoo
    #[serde(default)]
    pub strategies: Vec<String>,
    /// Maximum allocation fraction (0.0-1.0)
    #[serde(default = "default_group_cap")]
    pub max_allocation: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimitsConfig {
    /// Volatility regime ceiling as an IV percentile (0.0-1.0)
    #[serde(default = "default_max_volatility_percentile")]
    pub max_volatility_percentile: f64,
    /// Ceiling on absolute net dealer gamma exposure (same units as the snapshot)
    #[serde(default = "default_max_abs_gamma_exposure")]
    pub max_abs_gamma_exposure: f64,
    /// Ceiling on absolute normalized portfolio delta
    #[serde(default = "default_max_abs_normalized_delta")]
    pub max_abs_normalized_delta: f64,
    /// Maximum cumulative daily loss as a fraction of portfolio value
    #[serde(default = "default_max_daily_loss")]
    pub max_daily_loss: Decimal,
    /// Maximum effective leverage multiple
    #[serde(default = "default_max_leverage")]
    pub max_leverage: Decimal,
    /// Consecutive degraded ticks tolerated before pausing
    #[serde(default = "default_max_consecutive_degraded_ticks")]
    pub max_consecutive_degraded_ticks: u32,
    /// Pause as soon as a tick is skipped for missing data
    #[serde(default = "default_pause_on_data_gap")]
    pub pause_on_data_gap: bool,
    /// Weights dispatched while paused; empty means all weight withdrawn
    #[serde(default)]
    pub safe_allocation: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardConfig {
    /// Penalty on trailing max drawdown (k1)
    #[serde(default = "default_drawdown_penalty")]
    pub drawdown_penalty: f64,
    /// Penalty on absolute normalized directional exposure (k2)
    #[serde(default = "default_exposure_penalty")]
    pub exposure_penalty: f64,
    /// Number of sub-intervals in the trailing drawdown window
    #[serde(default = "default_drawdown_window")]
    pub drawdown_window: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Decision tick interval in seconds
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Upper bound on snapshot acquisition per tick
    #[serde(default = "default_snapshot_timeout_secs")]
    pub snapshot_timeout_secs: u64,
    /// Session open, local exchange time
    #[serde(default = "default_session_open_hour")]
    pub session_open_hour: u32,
    #[serde(default = "default_session_open_minute")]
    pub session_open_minute: u32,
    /// Session length in minutes
    #[serde(default = "default_session_minutes")]
    pub session_minutes: u32,
    /// Exchange-local offset from UTC in minutes
    #[serde(default = "default_session_utc_offset_minutes")]
    pub session_utc_offset_minutes: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningConfig {
    /// Hidden layer widths shared by actor and critics
    #[serde(default = "default_hidden_sizes")]
    pub hidden_sizes: Vec<usize>,
    /// Discount factor
    #[serde(default = "default_gamma")]
    pub gamma: f64,
    /// Target network EMA fraction
    #[serde(default = "default_tau")]
    pub tau: f64,
    #[serde(default = "default_learning_rate")]
    pub actor_lr: f64,
    #[serde(default = "default_learning_rate")]
    pub critic_lr: f64,
    #[serde(default = "default_learning_rate")]
    pub alpha_lr: f64,
    /// Initial entropy temperature
    #[serde(default = "default_initial_alpha")]
    pub initial_alpha: f64,
    /// Target entropy; defaults to -num_groups
    #[serde(default)]
    pub target_entropy: Option<f64>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Trigger a learning step after this many new transitions
    #[serde(default = "default_update_every")]
    pub update_every: usize,
    /// Gradient steps per trigger
    #[serde(default = "default_updates_per_trigger")]
    pub updates_per_trigger: usize,
    /// Minimum replay size before learning starts
    #[serde(default = "default_warmup_transitions")]
    pub warmup_transitions: usize,
    /// Critic loss above this discards the update
    #[serde(default = "default_max_critic_loss")]
    pub max_critic_loss: f64,
    /// Parameter L2 norm above this discards the update
    #[serde(default = "default_max_param_norm")]
    pub max_param_norm: f64,
    /// Consecutive discarded updates before training halts
    #[serde(default = "default_max_consecutive_divergences")]
    pub max_consecutive_divergences: u32,
    /// Sample from the policy during live inference
    #[serde(default)]
    pub explore_live: bool,
    /// RNG seed; None draws from entropy
    #[serde(default)]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    #[serde(default = "default_replay_capacity")]
    pub capacity: usize,
    /// Priority exponent
    #[serde(default = "default_priority_alpha")]
    pub alpha: f64,
    /// Importance-sampling exponent at step 0
    #[serde(default = "default_beta_start")]
    pub beta_start: f64,
    /// Learning steps over which beta anneals to 1
    #[serde(default = "default_beta_horizon_steps")]
    pub beta_horizon_steps: u64,
    #[serde(default = "default_priority_epsilon")]
    pub priority_epsilon: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Checkpoint after this many committed learning updates
    #[serde(default = "default_checkpoint_every_updates")]
    pub checkpoint_every_updates: u64,
    /// Archive completed transitions to SQLite
    #[serde(default = "default_archive_transitions")]
    pub archive_transitions: bool,
}

// Default value functions
fn default_groups_version() -> u32 {
    1
}

fn default_group_cap() -> f64 {
    0.35
}

fn default_groups() -> Vec<StrategyGroupConfig> {
    let table: [(&str, &str, &[&str]); 9] = [
        ("trend", "Directional trend", &["ema_breakout", "oi_momentum"]),
        ("mean_reversion", "Mean reversion", &["zscore_fade", "max_pain_pin"]),
        ("vol_selling", "Volatility selling", &["short_strangle", "iron_condor"]),
        ("vol_buying", "Volatility buying", &["long_straddle", "iv_crush_reversal"]),
        ("gamma_scalp", "Gamma scalping", &["gamma_scalper"]),
        ("skew", "Skew and term structure", &["risk_reversal", "calendar_spread"]),
        ("flow", "Positioning flow", &["pcr_contrarian", "oi_buildup"]),
        ("expiry", "Expiry theta", &["expiry_day_theta"]),
        ("hedge", "Tail hedge", &["put_ladder", "vix_proxy"]),
    ];

    table
        .iter()
        .map(|(id, label, strategies)| StrategyGroupConfig {
            id: id.to_string(),
            label: label.to_string(),
            strategies: strategies.iter().map(|s| s.to_string()).collect(),
            max_allocation: default_group_cap(),
        })
        .collect()
}

fn default_max_volatility_percentile() -> f64 {
    0.95
}

fn default_max_abs_gamma_exposure() -> f64 {
    2.5e10
}

fn default_max_abs_normalized_delta() -> f64 {
    0.5
}

fn default_max_daily_loss() -> Decimal {
    Decimal::new(2, 2) // 0.02
}

fn default_max_leverage() -> Decimal {
    Decimal::new(3, 0) // 3.0x
}

fn default_max_consecutive_degraded_ticks() -> u32 {
    3
}

fn default_pause_on_data_gap() -> bool {
    true
}

fn default_drawdown_penalty() -> f64 {
    3.0
}

fn default_exposure_penalty() -> f64 {
    0.5
}

fn default_drawdown_window() -> usize {
    6
}

fn default_tick_interval_secs() -> u64 {
    300
}

fn default_snapshot_timeout_secs() -> u64 {
    20
}

fn default_session_open_hour() -> u32 {
    9
}

fn default_session_open_minute() -> u32 {
    15
}

fn default_session_minutes() -> u32 {
    375 // 09:15-15:30
}

fn default_session_utc_offset_minutes() -> i32 {
    330 // UTC+05:30
}

fn default_hidden_sizes() -> Vec<usize> {
    vec![256, 256, 256]
}

fn default_gamma() -> f64 {
    0.99
}

fn default_tau() -> f64 {
    0.005
}

fn default_learning_rate() -> f64 {
    3e-4
}

fn default_initial_alpha() -> f64 {
    0.2
}

fn default_batch_size() -> usize {
    256
}

fn default_update_every() -> usize {
    16
}

fn default_updates_per_trigger() -> usize {
    1
}

fn default_warmup_transitions() -> usize {
    512
}

fn default_max_critic_loss() -> f64 {
    1.0e6
}

fn default_max_param_norm() -> f64 {
    1.0e4
}

fn default_max_consecutive_divergences() -> u32 {
    3
}

fn default_replay_capacity() -> usize {
    100_000
}

fn default_priority_alpha() -> f64 {
    0.6
}

fn default_beta_start() -> f64 {
    0.4
}

fn default_beta_horizon_steps() -> u64 {
    100_000
}

fn default_priority_epsilon() -> f64 {
    1e-6
}

fn default_db_path() -> String {
    "data/allocator.db".to_string()
}

fn default_checkpoint_every_updates() -> u64 {
    100
}

fn default_archive_transitions() -> bool {
    true
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("allocator").required(false))
            .add_source(config::Environment::default().separator("__").prefix("ALLOC"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values. Any failure here must prevent startup.
    pub fn validate(&self) -> Result<()> {
        let groups = &self.groups.groups;
        anyhow::ensure!(!groups.is_empty(), "at least one strategy group is required");

        let mut seen = HashSet::new();
        for group in groups {
            anyhow::ensure!(
                seen.insert(group.id.as_str()),
                "duplicate strategy group id '{}'",
                group.id
            );
            anyhow::ensure!(
                group.max_allocation > 0.0 && group.max_allocation <= 1.0,
                "group '{}' max_allocation must be in (0, 1]",
                group.id
            );
        }

        let cap_sum: f64 = groups.iter().map(|g| g.max_allocation).sum();
        if cap_sum < 1.0 {
            return Err(AllocatorError::ConstraintViolation(format!(
                "sum of group caps is {:.4}, must be at least 1",
                cap_sum
            ))
            .into());
        }

        anyhow::ensure!(
            (0.0..=1.0).contains(&self.risk.max_volatility_percentile),
            "max_volatility_percentile must be between 0 and 1"
        );
        anyhow::ensure!(
            self.risk.max_daily_loss > Decimal::ZERO && self.risk.max_daily_loss <= Decimal::ONE,
            "max_daily_loss must be between 0 and 1"
        );
        anyhow::ensure!(
            self.risk.max_leverage >= Decimal::ONE,
            "max_leverage must be at least 1"
        );

        anyhow::ensure!(
            self.reward.drawdown_penalty >= 0.0 && self.reward.exposure_penalty >= 0.0,
            "reward penalties must be non-negative"
        );
        anyhow::ensure!(self.reward.drawdown_window >= 1, "drawdown_window must be >= 1");

        anyhow::ensure!(self.schedule.tick_interval_secs > 0, "tick_interval_secs must be > 0");
        anyhow::ensure!(self.schedule.session_minutes > 0, "session_minutes must be > 0");
        anyhow::ensure!(
            self.schedule.session_utc_offset_minutes.abs() < 24 * 60,
            "session_utc_offset_minutes must be within +/-24h"
        );
        anyhow::ensure!(self.schedule.session_open_hour < 24, "session_open_hour must be < 24");
        anyhow::ensure!(self.schedule.session_open_minute < 60, "session_open_minute must be < 60");

        anyhow::ensure!(
            !self.learning.hidden_sizes.is_empty()
                && self.learning.hidden_sizes.iter().all(|&w| w > 0),
            "hidden_sizes must list at least one positive width"
        );
        anyhow::ensure!(
            self.learning.gamma > 0.0 && self.learning.gamma < 1.0,
            "gamma must be in (0, 1)"
        );
        anyhow::ensure!(
            self.learning.tau > 0.0 && self.learning.tau <= 1.0,
            "tau must be in (0, 1]"
        );
        anyhow::ensure!(self.learning.initial_alpha > 0.0, "initial_alpha must be > 0");
        anyhow::ensure!(self.learning.batch_size > 0, "batch_size must be > 0");
        anyhow::ensure!(self.learning.update_every > 0, "update_every must be > 0");

        anyhow::ensure!(self.replay.capacity > 0, "replay capacity must be > 0");
        anyhow::ensure!(
            self.replay.beta_start > 0.0 && self.replay.beta_start <= 1.0,
            "beta_start must be in (0, 1]"
        );

        // Safe allocation shape/caps are checked against the group table.
        crate::allocation::SafeAllocation::from_config(&self.risk.safe_allocation, groups)
            .context("invalid safe_allocation")?;

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            groups: GroupsConfig::default(),
            risk: RiskLimitsConfig::default(),
            reward: RewardConfig::default(),
            schedule: ScheduleConfig::default(),
            learning: LearningConfig::default(),
            replay: ReplayConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

impl Default for GroupsConfig {
    fn default() -> Self {
        Self {
            groups_version: default_groups_version(),
            groups: default_groups(),
        }
    }
}

impl Default for RiskLimitsConfig {
    fn default() -> Self {
        Self {
            max_volatility_percentile: default_max_volatility_percentile(),
            max_abs_gamma_exposure: default_max_abs_gamma_exposure(),
            max_abs_normalized_delta: default_max_abs_normalized_delta(),
            max_daily_loss: default_max_daily_loss(),
            max_leverage: default_max_leverage(),
            max_consecutive_degraded_ticks: default_max_consecutive_degraded_ticks(),
            pause_on_data_gap: default_pause_on_data_gap(),
            safe_allocation: Vec::new(),
        }
    }
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            drawdown_penalty: default_drawdown_penalty(),
            exposure_penalty: default_exposure_penalty(),
            drawdown_window: default_drawdown_window(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            snapshot_timeout_secs: default_snapshot_timeout_secs(),
            session_open_hour: default_session_open_hour(),
            session_open_minute: default_session_open_minute(),
            session_minutes: default_session_minutes(),
            session_utc_offset_minutes: default_session_utc_offset_minutes(),
        }
    }
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            hidden_sizes: default_hidden_sizes(),
            gamma: default_gamma(),
            tau: default_tau(),
            actor_lr: default_learning_rate(),
            critic_lr: default_learning_rate(),
            alpha_lr: default_learning_rate(),
            initial_alpha: default_initial_alpha(),
            target_entropy: None,
            batch_size: default_batch_size(),
            update_every: default_update_every(),
            updates_per_trigger: default_updates_per_trigger(),
            warmup_transitions: default_warmup_transitions(),
            max_critic_loss: default_max_critic_loss(),
            max_param_norm: default_max_param_norm(),
            max_consecutive_divergences: default_max_consecutive_divergences(),
            explore_live: false,
            seed: None,
        }
    }
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            capacity: default_replay_capacity(),
            alpha: default_priority_alpha(),
            beta_start: default_beta_start(),
            beta_horizon_steps: default_beta_horizon_steps(),
            priority_epsilon: default_priority_epsilon(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            checkpoint_every_updates: default_checkpoint_every_updates(),
            archive_transitions: default_archive_transitions(),
        }
    }
}
