//! Soft actor-critic update step.

use chrono::Utc;
use ndarray::{Array1, Array2, Zip};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, warn};

use super::critic::Critic;
use super::network::{Adam, ScalarAdam};
use super::params::{Checkpoint, PolicySnapshot, SacNetworks};
use crate::config::LearningConfig;
use crate::error::{AllocatorError, AllocatorResult};
use crate::replay::{SampledBatch, SharedReplay};
use crate::state::FEATURE_VERSION;

/// Global gradient norm ceiling applied to every network update.
const MAX_GRAD_NORM: f64 = 10.0;

#[derive(Debug, Clone)]
struct Optimizers {
    actor: Adam,
    q1: Adam,
    q2: Adam,
    alpha: ScalarAdam,
}

impl Optimizers {
    fn new(nets: &SacNetworks, config: &LearningConfig) -> Self {
        Self {
            actor: Adam::new(nets.actor.network(), config.actor_lr),
            q1: Adam::new(nets.q1.network(), config.critic_lr),
            q2: Adam::new(nets.q2.network(), config.critic_lr),
            alpha: ScalarAdam::new(config.alpha_lr),
        }
    }
}

/// Losses and diagnostics of one committed update.
#[derive(Debug, Clone)]
pub struct LearnReport {
    pub critic_loss: f64,
    pub actor_loss: f64,
    pub alpha_loss: f64,
    pub alpha: f64,
    /// Mean policy entropy over the batch
    pub entropy: f64,
    /// Per-sample |TD error|, averaged over both critics
    pub td_errors: Vec<f64>,
    pub training_step: u64,
}

struct BatchArrays {
    states: Array2<f64>,
    actions: Array2<f64>,
    rewards: Array1<f64>,
    next_states: Array2<f64>,
    not_done: Array1<f64>,
    weights: Array1<f64>,
}

impl BatchArrays {
    fn from_batch(batch: &SampledBatch, state_dim: usize, action_dim: usize) -> AllocatorResult<Self> {
        let n = batch.len();
        let mut states = Array2::zeros((n, state_dim));
        let mut actions = Array2::zeros((n, action_dim));
        let mut next_states = Array2::zeros((n, state_dim));
        let mut rewards = Array1::zeros(n);
        let mut not_done = Array1::zeros(n);

        for (i, t) in batch.transitions.iter().enumerate() {
            if t.state.len() != state_dim || t.next_state.len() != state_dim || t.action.len() != action_dim {
                return Err(AllocatorError::InferenceFailure(format!(
                    "transition {} has shape ({}, {}, {}), expected ({}, {}, {})",
                    t.sequence,
                    t.state.len(),
                    t.action.len(),
                    t.next_state.len(),
                    state_dim,
                    action_dim,
                    state_dim
                )));
            }
            states.row_mut(i).assign(&Array1::from(t.state.clone()));
            actions.row_mut(i).assign(&Array1::from(t.action.clone()));
            next_states.row_mut(i).assign(&Array1::from(t.next_state.clone()));
            rewards[i] = t.reward;
            not_done[i] = if t.terminal { 0.0 } else { 1.0 };
        }

        Ok(Self {
            states,
            actions,
            rewards,
            next_states,
            not_done,
            weights: Array1::from(batch.weights.clone()),
        })
    }
}

/// Owns the learned parameters and applies gradient updates.
///
/// Each update runs on a working copy; it replaces the live parameters only
/// when every loss is finite and within the configured bounds.
pub struct SacTrainer {
    nets: SacNetworks,
    optim: Optimizers,
    config: LearningConfig,
    target_entropy: f64,
    training_step: u64,
    version: u64,
    consecutive_divergences: u32,
    rng: ChaCha8Rng,
}

impl SacTrainer {
    pub fn new(config: &LearningConfig, state_dim: usize, action_dim: usize) -> Self {
        let mut rng = match config.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        let nets = SacNetworks::new(
            state_dim,
            action_dim,
            &config.hidden_sizes,
            config.initial_alpha,
            &mut rng,
        );
        Self::assemble(nets, config, 0, 0, rng)
    }

    /// Resume from a checkpoint. Optimizer moments restart from zero.
    pub fn from_checkpoint(checkpoint: Checkpoint, config: &LearningConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed ^ checkpoint.training_step),
            None => ChaCha8Rng::from_entropy(),
        };
        Self::assemble(
            checkpoint.networks,
            config,
            checkpoint.training_step,
            checkpoint.version,
            rng,
        )
    }

    fn assemble(
        nets: SacNetworks,
        config: &LearningConfig,
        training_step: u64,
        version: u64,
        rng: ChaCha8Rng,
    ) -> Self {
        let target_entropy = config
            .target_entropy
            .unwrap_or(-(nets.actor.action_dim() as f64));
        Self {
            optim: Optimizers::new(&nets, config),
            nets,
            config: config.clone(),
            target_entropy,
            training_step,
            version,
            consecutive_divergences: 0,
            rng,
        }
    }

    pub fn training_step(&self) -> u64 {
        self.training_step
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn alpha(&self) -> f64 {
        self.nets.alpha()
    }

    pub fn consecutive_divergences(&self) -> u32 {
        self.consecutive_divergences
    }

    /// Training stops once too many consecutive updates were discarded.
    pub fn is_halted(&self) -> bool {
        self.consecutive_divergences >= self.config.max_consecutive_divergences
    }

    pub fn networks(&self) -> &SacNetworks {
        &self.nets
    }

    /// Snapshot under the current version (initial publish or restore).
    pub fn current_snapshot(&self) -> PolicySnapshot {
        PolicySnapshot {
            version: self.version,
            training_step: self.training_step,
            actor: self.nets.actor.clone(),
            alpha: self.nets.alpha(),
            published_at: Utc::now(),
        }
    }

    /// Bump the version and snapshot the actor for inference.
    pub fn publish_snapshot(&mut self) -> PolicySnapshot {
        self.version += 1;
        self.current_snapshot()
    }

    pub fn checkpoint(&self, groups_version: u32) -> Checkpoint {
        Checkpoint {
            version: self.version,
            training_step: self.training_step,
            feature_version: FEATURE_VERSION,
            groups_version,
            created_at: Utc::now(),
            networks: self.nets.clone(),
        }
    }

    /// Sample from `replay`, update, and refresh the sampled priorities.
    ///
    /// `Ok(None)` when the store is empty.
    pub fn train_on(&mut self, replay: &SharedReplay) -> AllocatorResult<Option<LearnReport>> {
        let Some(batch) = replay.sample(self.config.batch_size, &mut self.rng, self.training_step) else {
            return Ok(None);
        };
        let report = self.learn(&batch)?;
        replay.update_priorities(&batch.keys, &report.td_errors);
        Ok(Some(report))
    }

    /// One actor-critic update on `batch`.
    pub fn learn(&mut self, batch: &SampledBatch) -> AllocatorResult<LearnReport> {
        if batch.is_empty() {
            return Err(AllocatorError::InferenceFailure("empty training batch".to_string()));
        }
        // A batch the networks cannot consume counts toward the halt like
        // any other discarded update.
        let arrays = match BatchArrays::from_batch(
            batch,
            self.nets.actor.state_dim(),
            self.nets.actor.action_dim(),
        ) {
            Ok(arrays) => arrays,
            Err(e) => return Err(self.discard(e.to_string())),
        };

        let mut working = self.nets.clone();
        let mut optim = self.optim.clone();
        let result = update(
            &mut working,
            &mut optim,
            &arrays,
            &self.config,
            self.target_entropy,
            &mut self.rng,
        )
        .and_then(|report| {
            check_bounds(&working, &report, &self.config)?;
            Ok(report)
        });

        match result {
            Ok(mut report) => {
                self.nets = working;
                self.optim = optim;
                self.training_step += 1;
                self.consecutive_divergences = 0;
                report.training_step = self.training_step;

                debug!(
                    step = self.training_step,
                    critic_loss = report.critic_loss,
                    actor_loss = report.actor_loss,
                    alpha_loss = report.alpha_loss,
                    alpha = report.alpha,
                    entropy = report.entropy,
                    "Learning step committed"
                );
                Ok(report)
            }
            Err(reason) => Err(self.discard(reason)),
        }
    }

    fn discard(&mut self, reason: String) -> AllocatorError {
        self.consecutive_divergences += 1;
        warn!(
            step = self.training_step,
            consecutive = self.consecutive_divergences,
            %reason,
            "Discarded diverging update"
        );
        AllocatorError::LearningDivergence {
            consecutive: self.consecutive_divergences,
            reason,
        }
    }
}

fn critic_step(
    critic: &mut Critic,
    optimizer: &mut Adam,
    arrays: &BatchArrays,
    targets: &Array1<f64>,
) -> (f64, Array1<f64>) {
    let n = targets.len() as f64;
    let pass = critic.q_cached(&arrays.states, &arrays.actions);
    let td = &pass.q - targets;
    let loss = (&arrays.weights * &td.mapv(|d| d * d)).sum() / n;
    let grad_q = &arrays.weights * &td * (2.0 / n);

    let (mut grads, _) = critic.backward(&pass, &grad_q);
    grads.clip_global_norm(MAX_GRAD_NORM);
    optimizer.step(critic.network_mut(), &grads);
    (loss, td)
}

fn update(
    nets: &mut SacNetworks,
    optim: &mut Optimizers,
    arrays: &BatchArrays,
    config: &LearningConfig,
    target_entropy: f64,
    rng: &mut ChaCha8Rng,
) -> Result<LearnReport, String> {
    let n = arrays.rewards.len() as f64;
    let alpha = nets.alpha();

    // Bootstrapped soft targets from the target critics.
    let next = nets.actor.sample(&arrays.next_states, rng);
    let q1_next = nets.q1_target.q(&arrays.next_states, &next.actions);
    let q2_next = nets.q2_target.q(&arrays.next_states, &next.actions);
    let mut targets = Array1::zeros(arrays.rewards.len());
    Zip::from(&mut targets)
        .and(&arrays.rewards)
        .and(&arrays.not_done)
        .and(&q1_next)
        .and(&q2_next)
        .and(&next.log_probs)
        .for_each(|y, &r, &nd, &a, &b, &lp| {
            *y = r + config.gamma * nd * (a.min(b) - alpha * lp);
        });
    if targets.iter().any(|y| !y.is_finite()) {
        return Err("non-finite bootstrap target".to_string());
    }

    let (loss1, td1) = critic_step(&mut nets.q1, &mut optim.q1, arrays, &targets);
    let (loss2, td2) = critic_step(&mut nets.q2, &mut optim.q2, arrays, &targets);

    // Actor: minimize E[alpha * logp - min(Q1, Q2)].
    let sample = nets.actor.sample(&arrays.states, rng);
    let pass1 = nets.q1.q_cached(&arrays.states, &sample.actions);
    let pass2 = nets.q2.q_cached(&arrays.states, &sample.actions);
    let mut grad_q1 = Array1::zeros(pass1.q.len());
    let mut grad_q2 = Array1::zeros(pass2.q.len());
    let mut actor_loss = 0.0;
    for i in 0..pass1.q.len() {
        let q_min = if pass1.q[i] <= pass2.q[i] {
            grad_q1[i] = -1.0 / n;
            pass1.q[i]
        } else {
            grad_q2[i] = -1.0 / n;
            pass2.q[i]
        };
        actor_loss += (alpha * sample.log_probs[i] - q_min) / n;
    }
    let (_, grad_a1) = nets.q1.backward(&pass1, &grad_q1);
    let (_, grad_a2) = nets.q2.backward(&pass2, &grad_q2);
    let grad_actions = grad_a1 + grad_a2;
    let grad_log_probs = Array1::from_elem(sample.log_probs.len(), alpha / n);

    let mut actor_grads = nets.actor.backward(&sample, &grad_actions, &grad_log_probs);
    actor_grads.clip_global_norm(MAX_GRAD_NORM);
    optim.actor.step(nets.actor.network_mut(), &actor_grads);

    // Temperature: loss = -log_alpha * E[logp + target_entropy].
    let mean_log_prob = sample.log_probs.mean().unwrap_or(0.0);
    let entropy_gap = mean_log_prob + target_entropy;
    let alpha_loss = -nets.log_alpha * entropy_gap;
    optim.alpha.step(&mut nets.log_alpha, -entropy_gap);

    nets.q1_target.soft_update_from(&nets.q1, config.tau);
    nets.q2_target.soft_update_from(&nets.q2, config.tau);

    let td_errors = td1
        .iter()
        .zip(td2.iter())
        .map(|(a, b)| 0.5 * (a.abs() + b.abs()))
        .collect();

    Ok(LearnReport {
        critic_loss: loss1.max(loss2),
        actor_loss,
        alpha_loss,
        alpha: nets.alpha(),
        entropy: -mean_log_prob,
        td_errors,
        training_step: 0,
    })
}

fn check_bounds(nets: &SacNetworks, report: &LearnReport, config: &LearningConfig) -> Result<(), String> {
    if !report.critic_loss.is_finite() || report.critic_loss > config.max_critic_loss {
        return Err(format!(
            "critic loss {:.4e} exceeds bound {:.4e}",
            report.critic_loss, config.max_critic_loss
        ));
    }
    if !report.actor_loss.is_finite() || !report.alpha_loss.is_finite() {
        return Err("non-finite actor or temperature loss".to_string());
    }
    if !nets.is_finite() {
        return Err("non-finite parameters".to_string());
    }
    let norm = nets.max_param_norm();
    if norm > config.max_param_norm {
        return Err(format!(
            "parameter norm {:.4e} exceeds bound {:.4e}",
            norm, config.max_param_norm
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::{SampleKey, Transition};

    const STATE: usize = 4;
    const ACTIONS: usize = 3;

    fn config() -> LearningConfig {
        LearningConfig {
            hidden_sizes: vec![32, 32],
            critic_lr: 1e-3,
            actor_lr: 1e-3,
            alpha_lr: 1e-3,
            batch_size: 16,
            seed: Some(17),
            ..LearningConfig::default()
        }
    }

    fn batch(terminal: bool) -> SampledBatch {
        let transitions: Vec<Transition> = (0..16)
            .map(|i| {
                let x = i as f64 / 16.0;
                Transition::new(
                    vec![x, -x, 0.5, 1.0 - x],
                    vec![x - 0.5, 0.1, -0.2],
                    1.0,
                    vec![x + 0.1, -x, 0.5, 0.9 - x],
                    terminal,
                    Utc::now(),
                )
            })
            .collect();
        let keys = (0..16)
            .map(|i| SampleKey {
                slot: i,
                sequence: i as u64,
            })
            .collect();
        SampledBatch {
            transitions,
            keys,
            weights: vec![1.0; 16],
            beta: 1.0,
        }
    }

    #[test]
    fn test_learn_reports_per_sample_td_errors() {
        let mut trainer = SacTrainer::new(&config(), STATE, ACTIONS);
        let report = trainer.learn(&batch(false)).unwrap();

        assert_eq!(report.td_errors.len(), 16);
        assert!(report.td_errors.iter().all(|td| td.is_finite() && *td >= 0.0));
        assert_eq!(report.training_step, 1);
        assert_eq!(trainer.training_step(), 1);
    }

    #[test]
    fn test_critics_fit_terminal_rewards() {
        let mut trainer = SacTrainer::new(&config(), STATE, ACTIONS);
        let data = batch(true);
        let first = trainer.learn(&data).unwrap().critic_loss;
        let mut last = first;
        for _ in 0..300 {
            last = trainer.learn(&data).unwrap().critic_loss;
        }
        assert!(last < 0.05, "critic loss {first} -> {last}");
    }

    #[test]
    fn test_temperature_falls_when_entropy_above_target() {
        let mut trainer = SacTrainer::new(&config(), STATE, ACTIONS);
        let before = trainer.alpha();
        // Fresh actor has unit std: entropy ~4.26 nats against a target of -3.
        trainer.learn(&batch(false)).unwrap();
        assert!(trainer.alpha() < before);
    }

    #[test]
    fn test_diverging_update_is_discarded() {
        let mut cfg = config();
        cfg.max_critic_loss = 0.0;
        let mut trainer = SacTrainer::new(&cfg, STATE, ACTIONS);
        let before = trainer.networks().clone();

        for expected in 1..=3 {
            match trainer.learn(&batch(false)) {
                Err(AllocatorError::LearningDivergence { consecutive, .. }) => {
                    assert_eq!(consecutive, expected)
                }
                other => panic!("expected divergence, got {other:?}"),
            }
        }

        assert_eq!(trainer.networks(), &before);
        assert_eq!(trainer.training_step(), 0);
        assert!(trainer.is_halted());
    }

    #[test]
    fn test_mismatched_batch_counts_toward_halt() {
        let mut trainer = SacTrainer::new(&config(), STATE, ACTIONS);
        let mut stale = batch(false);
        for t in &mut stale.transitions {
            t.action = vec![0.0; ACTIONS + 2];
        }

        for _ in 0..3 {
            assert!(matches!(
                trainer.learn(&stale),
                Err(AllocatorError::LearningDivergence { .. })
            ));
        }
        assert!(trainer.is_halted());
        assert_eq!(trainer.training_step(), 0);
    }

    #[test]
    fn test_checkpoint_restores_parameters() {
        let mut trainer = SacTrainer::new(&config(), STATE, ACTIONS);
        trainer.learn(&batch(false)).unwrap();
        let snapshot = trainer.publish_snapshot();
        assert_eq!(snapshot.version, 1);

        let checkpoint = trainer.checkpoint(4);
        let restored = SacTrainer::from_checkpoint(checkpoint.clone(), &config());
        assert_eq!(restored.networks(), trainer.networks());
        assert_eq!(restored.version(), 1);
        assert_eq!(restored.training_step(), 1);
        assert_eq!(checkpoint.groups_version, 4);
    }

    #[test]
    fn test_train_on_empty_replay_is_noop() {
        let mut trainer = SacTrainer::new(&config(), STATE, ACTIONS);
        let replay = SharedReplay::new(crate::config::ReplayConfig::default());
        assert!(trainer.train_on(&replay).unwrap().is_none());
    }
}
