//! Learner task: replay ingestion, gradient steps and checkpoints.
//!
//! Receives completed transitions from the decision loop over a channel and
//! runs gradient steps on the blocking pool, so a slow step never delays a
//! tick. Each committed batch of updates is published as a new immutable
//! policy snapshot.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::allocation::GroupTable;
use crate::config::{Config, LearningConfig, PersistenceConfig};
use crate::error::AllocatorError;
use crate::persistence::PersistenceManager;
use crate::policy::{LearnReport, ParameterStore, SacTrainer};
use crate::replay::{SharedReplay, Transition};
use crate::risk::{AlertSeverity, RiskEvent, RiskEventKind};
use crate::state::STATE_DIM;

/// Totals reported when the learner stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LearnerSummary {
    pub received: u64,
    pub rejected: u64,
    pub committed_updates: u64,
    pub discarded_updates: u64,
    pub published_versions: u64,
    pub checkpoints: u64,
    pub archived: u64,
    pub halted: bool,
}

pub struct Learner {
    trainer: Option<SacTrainer>,
    replay: SharedReplay,
    params: Arc<ParameterStore>,
    persistence: Option<Arc<PersistenceManager>>,
    learning: LearningConfig,
    storage: PersistenceConfig,
    groups_version: u32,
    since_trigger: usize,
    updates_since_checkpoint: u64,
    archive_buffer: Vec<Transition>,
    summary: LearnerSummary,
}

impl Learner {
    pub fn new(
        trainer: SacTrainer,
        replay: SharedReplay,
        params: Arc<ParameterStore>,
        config: &Config,
        groups_version: u32,
    ) -> Self {
        Self {
            trainer: Some(trainer),
            replay,
            params,
            persistence: None,
            learning: config.learning.clone(),
            storage: config.persistence.clone(),
            groups_version,
            since_trigger: 0,
            updates_since_checkpoint: 0,
            archive_buffer: Vec::new(),
            summary: LearnerSummary::default(),
        }
    }

    pub fn with_persistence(mut self, persistence: Arc<PersistenceManager>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn trainer(&self) -> Option<&SacTrainer> {
        self.trainer.as_ref()
    }

    pub fn summary(&self) -> &LearnerSummary {
        &self.summary
    }

    /// Drain the channel until every sender is dropped.
    pub async fn run(mut self, mut transitions: mpsc::Receiver<Transition>) -> Result<LearnerSummary> {
        info!(
            "🧠 Learner started (update every {} transitions, warmup {})",
            self.learning.update_every, self.learning.warmup_transitions
        );

        while let Some(transition) = transitions.recv().await {
            self.ingest(transition).await?;
        }

        self.flush_archive();
        if self.updates_since_checkpoint > 0 {
            self.save_checkpoint();
        }

        info!(
            "🧠 Learner stopped: {} transitions, {} updates committed, {} discarded",
            self.summary.received, self.summary.committed_updates, self.summary.discarded_updates
        );
        Ok(self.summary)
    }

    /// Add one transition and train if a trigger is due.
    pub async fn ingest(&mut self, transition: Transition) -> Result<()> {
        self.summary.received += 1;

        if transition.groups_version != self.groups_version {
            warn!(
                "Rejected transition for group table v{} (serving v{})",
                transition.groups_version, self.groups_version
            );
            self.summary.rejected += 1;
            return Ok(());
        }
        let archived = (self.storage.archive_transitions && self.persistence.is_some())
            .then(|| transition.clone());

        if let Err(e) = self.replay.push(transition) {
            warn!("Rejected transition: {}", e);
            self.summary.rejected += 1;
            return Ok(());
        }
        self.archive_buffer.extend(archived);

        if self.archive_buffer.len() >= self.learning.update_every.max(1) {
            self.flush_archive();
        }

        self.since_trigger += 1;
        if self.since_trigger < self.learning.update_every.max(1) {
            return Ok(());
        }
        self.since_trigger = 0;

        if self.summary.halted {
            debug!("Learning halted, transition stored without training");
            return Ok(());
        }
        if self.replay.len() < self.learning.warmup_transitions {
            debug!(
                stored = self.replay.len(),
                warmup = self.learning.warmup_transitions,
                "Replay still warming up"
            );
            return Ok(());
        }

        self.train().await
    }

    async fn train(&mut self) -> Result<()> {
        let Some(mut trainer) = self.trainer.take() else {
            return Ok(());
        };
        let replay = self.replay.clone();
        let steps = self.learning.updates_per_trigger.max(1);

        let (mut trainer, outcomes) = tokio::task::spawn_blocking(move || {
            let mut outcomes = Vec::with_capacity(steps);
            for _ in 0..steps {
                let outcome = trainer.train_on(&replay);
                let stop = trainer.is_halted();
                outcomes.push(outcome);
                if stop {
                    break;
                }
            }
            (trainer, outcomes)
        })
        .await
        .context("Learning step panicked")?;

        let mut committed = 0u64;
        for outcome in outcomes {
            match outcome {
                Ok(Some(report)) => {
                    log_report(&report);
                    committed += 1;
                }
                Ok(None) => {}
                Err(AllocatorError::LearningDivergence { consecutive, reason }) => {
                    self.summary.discarded_updates += 1;
                    self.report_divergence(consecutive, reason, trainer.is_halted());
                }
                Err(e) => {
                    self.summary.discarded_updates += 1;
                    self.report_divergence(
                        trainer.consecutive_divergences(),
                        e.to_string(),
                        trainer.is_halted(),
                    );
                }
            }
        }

        if committed > 0 {
            self.summary.committed_updates += committed;
            self.updates_since_checkpoint += committed;
            let snapshot = trainer.publish_snapshot();
            if self.params.publish(snapshot) {
                self.summary.published_versions += 1;
            }
        }

        if trainer.is_halted() && !self.summary.halted {
            error!(
                "🚨 [LEARN] Training halted after {} consecutive discarded updates, serving policy v{}",
                trainer.consecutive_divergences(),
                self.params.version()
            );
            self.summary.halted = true;
        }

        self.trainer = Some(trainer);

        if self.updates_since_checkpoint >= self.storage.checkpoint_every_updates.max(1) {
            self.save_checkpoint();
        }
        Ok(())
    }

    fn report_divergence(&self, consecutive: u32, reason: String, halted: bool) {
        let event = RiskEvent::new(
            chrono::Utc::now(),
            RiskEventKind::LearningDiverged {
                consecutive,
                reason: reason.clone(),
            },
            if halted {
                AlertSeverity::Critical
            } else {
                AlertSeverity::Error
            },
            None,
            format!("Learning update discarded ({consecutive} consecutive): {reason}"),
        );
        event.emit();
        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.record_risk_event(&event) {
                warn!("Failed to persist learning event: {:#}", e);
            }
        }
    }

    fn save_checkpoint(&mut self) {
        let (Some(persistence), Some(trainer)) = (&self.persistence, &self.trainer) else {
            return;
        };
        let checkpoint = trainer.checkpoint(self.groups_version);
        match persistence.save_checkpoint(&checkpoint) {
            Ok(()) => {
                info!(
                    "💾 [CHECKPOINT] Saved v{} at step {}",
                    checkpoint.version, checkpoint.training_step
                );
                self.summary.checkpoints += 1;
                self.updates_since_checkpoint = 0;
            }
            Err(e) => error!("❌ [CHECKPOINT] Save failed: {:#}", e),
        }
    }

    fn flush_archive(&mut self) {
        if self.archive_buffer.is_empty() {
            return;
        }
        let Some(persistence) = &self.persistence else {
            self.archive_buffer.clear();
            return;
        };
        match persistence.archive_transitions(&self.archive_buffer) {
            Ok(n) => {
                debug!(archived = n, "Archived transitions");
                self.summary.archived += n as u64;
                self.archive_buffer.clear();
            }
            Err(e) => warn!("Transition archive failed, will retry: {:#}", e),
        }
    }
}

fn log_report(report: &LearnReport) {
    debug!(
        step = report.training_step,
        critic_loss = report.critic_loss,
        actor_loss = report.actor_loss,
        alpha_loss = report.alpha_loss,
        alpha = report.alpha,
        entropy = report.entropy,
        "Learning update"
    );
}

/// Resume from the latest compatible checkpoint, or start fresh.
pub fn restore_trainer(
    config: &Config,
    groups: &GroupTable,
    persistence: Option<&PersistenceManager>,
) -> SacTrainer {
    let latest = persistence.map(|p| p.load_latest_checkpoint()).transpose();

    match latest {
        Ok(Some(Some(checkpoint))) => match checkpoint.check_compatible(groups.version(), groups.len()) {
            Ok(()) => {
                info!(
                    "📂 [CHECKPOINT] Restored v{} (step {})",
                    checkpoint.version, checkpoint.training_step
                );
                SacTrainer::from_checkpoint(checkpoint, &config.learning)
            }
            Err(e) => {
                warn!("⚠️  [CHECKPOINT] Ignoring incompatible checkpoint: {}", e);
                SacTrainer::new(&config.learning, STATE_DIM, groups.len())
            }
        },
        Ok(_) => {
            info!("📂 [CHECKPOINT] No checkpoint found, initializing fresh policy");
            SacTrainer::new(&config.learning, STATE_DIM, groups.len())
        }
        Err(e) => {
            warn!("⚠️  [CHECKPOINT] Could not read checkpoints: {:#}", e);
            SacTrainer::new(&config.learning, STATE_DIM, groups.len())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GroupsConfig;
    use chrono::Utc;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.learning.hidden_sizes = vec![16, 16];
        config.learning.seed = Some(5);
        config.learning.batch_size = 16;
        config.learning.update_every = 8;
        config.learning.warmup_transitions = 16;
        config.replay.capacity = 256;
        config.persistence.checkpoint_every_updates = 2;
        config
    }

    fn random_transition(rng: &mut ChaCha8Rng) -> Transition {
        let state: Vec<f64> = (0..STATE_DIM).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let next_state: Vec<f64> = (0..STATE_DIM).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let action: Vec<f64> = (0..9).map(|_| rng.gen_range(-0.5..0.5)).collect();
        Transition::new(state, action, rng.gen_range(-0.01..0.01), next_state, false, Utc::now())
            .with_groups_version(1)
    }

    fn learner_for(config: &Config) -> (Learner, Arc<ParameterStore>) {
        let trainer = SacTrainer::new(&config.learning, STATE_DIM, 9);
        let params = Arc::new(ParameterStore::new(trainer.current_snapshot()));
        let learner = Learner::new(
            trainer,
            SharedReplay::new(config.replay.clone()).with_dimensions(STATE_DIM, 9),
            params.clone(),
            config,
            1,
        );
        (learner, params)
    }

    #[tokio::test]
    async fn test_no_training_before_warmup() {
        let config = test_config();
        let (mut learner, params) = learner_for(&config);
        let mut rng = ChaCha8Rng::seed_from_u64(1);

        for _ in 0..8 {
            learner.ingest(random_transition(&mut rng)).await.unwrap();
        }
        assert_eq!(learner.summary().committed_updates, 0);
        assert_eq!(params.version(), 0);
    }

    #[tokio::test]
    async fn test_training_publishes_and_checkpoints() {
        let config = test_config();
        let persistence = Arc::new(PersistenceManager::in_memory().unwrap());
        let (learner, params) = learner_for(&config);
        let mut learner = learner.with_persistence(persistence.clone());
        let mut rng = ChaCha8Rng::seed_from_u64(2);

        for _ in 0..32 {
            learner.ingest(random_transition(&mut rng)).await.unwrap();
        }

        // Triggers at 16, 24 and 32 transitions.
        assert_eq!(learner.summary().committed_updates, 3);
        assert_eq!(params.version(), 3);
        assert_eq!(learner.summary().checkpoints, 1);

        let checkpoint = persistence.load_latest_checkpoint().unwrap().unwrap();
        assert_eq!(checkpoint.training_step, 2);
        assert_eq!(persistence.transition_count().unwrap(), 32);
    }

    #[tokio::test]
    async fn test_divergence_halts_and_keeps_last_snapshot() {
        let mut config = test_config();
        config.learning.max_param_norm = 1e-9;
        let persistence = Arc::new(PersistenceManager::in_memory().unwrap());
        let (learner, params) = learner_for(&config);
        let mut learner = learner.with_persistence(persistence.clone());
        let mut rng = ChaCha8Rng::seed_from_u64(3);

        for _ in 0..64 {
            learner.ingest(random_transition(&mut rng)).await.unwrap();
        }

        let summary = learner.summary();
        assert!(summary.halted);
        assert_eq!(summary.discarded_updates, 3);
        assert_eq!(summary.committed_updates, 0);
        assert_eq!(params.version(), 0);

        let events = persistence.recent_risk_events(10).unwrap();
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.kind_label() == "learning_diverged"));
        assert!(events.iter().any(|e| e.severity == AlertSeverity::Critical));
    }

    #[tokio::test]
    async fn test_group_table_redeploy_ignores_old_archive() {
        let mut config = test_config();
        let persistence = Arc::new(PersistenceManager::in_memory().unwrap());
        let mut rng = ChaCha8Rng::seed_from_u64(6);

        // Archive written under the original nine-group table.
        let old: Vec<Transition> = (0..64).map(|_| random_transition(&mut rng)).collect();
        persistence.archive_transitions(&old).unwrap();

        // Redeployed with seven groups under a new table version.
        config.groups.groups.truncate(7);
        for group in &mut config.groups.groups {
            group.max_allocation = 1.0;
        }
        config.groups.groups_version = 2;
        let groups = GroupTable::from_config(&config.groups).unwrap();

        let restored = persistence
            .load_transitions(config.replay.capacity, groups.version())
            .unwrap();
        assert!(restored.is_empty());

        let trainer = restore_trainer(&config, &groups, Some(persistence.as_ref()));
        let params = Arc::new(ParameterStore::new(trainer.current_snapshot()));
        let replay = SharedReplay::new(config.replay.clone()).with_dimensions(STATE_DIM, groups.len());
        // Stale rows are refused even if they reach the store.
        assert!(replay.extend(old.clone()).is_err());
        assert!(replay.is_empty());

        let mut learner = Learner::new(trainer, replay, params.clone(), &config, groups.version())
            .with_persistence(persistence.clone());

        // A leftover transition from the old table is rejected outright.
        learner.ingest(old[0].clone()).await.unwrap();
        assert_eq!(learner.summary().rejected, 1);

        for _ in 0..32 {
            let mut t = random_transition(&mut rng).with_groups_version(2);
            t.action.truncate(7);
            learner.ingest(t).await.unwrap();
        }

        assert_eq!(learner.summary().committed_updates, 3);
        assert!(!learner.summary().halted);
        assert_eq!(params.version(), 3);
        assert_eq!(
            persistence.load_transitions(1_000, 2).unwrap().len(),
            32
        );
    }

    #[tokio::test]
    async fn test_run_drains_channel() {
        let config = test_config();
        let (learner, _params) = learner_for(&config);
        let (tx, rx) = mpsc::channel(64);
        let handle = tokio::spawn(learner.run(rx));

        let mut rng = ChaCha8Rng::seed_from_u64(4);
        for _ in 0..20 {
            tx.send(random_transition(&mut rng)).await.unwrap();
        }
        drop(tx);

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.received, 20);
        assert_eq!(summary.committed_updates, 1);
    }

    #[test]
    fn test_restore_prefers_compatible_checkpoint() {
        let config = test_config();
        let groups = GroupTable::from_config(&GroupsConfig::default()).unwrap();
        let persistence = PersistenceManager::in_memory().unwrap();

        let mut trainer = SacTrainer::new(&config.learning, STATE_DIM, 9);
        trainer.publish_snapshot();
        persistence.save_checkpoint(&trainer.checkpoint(groups.version())).unwrap();

        let restored = restore_trainer(&config, &groups, Some(&persistence));
        assert_eq!(restored.version(), 1);

        // Another group table version falls back to a fresh policy.
        let mut other = GroupsConfig::default();
        other.groups_version = 2;
        let other_groups = GroupTable::from_config(&other).unwrap();
        let fresh = restore_trainer(&config, &other_groups, Some(&persistence));
        assert_eq!(fresh.version(), 0);

        let no_store = restore_trainer(&config, &groups, None);
        assert_eq!(no_store.training_step(), 0);
    }
}
