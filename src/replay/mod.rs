//! Replay Store: bounded prioritized experience buffer.
//!
//! Slots form a ring; when full the oldest transition is overwritten. Sampling
//! is proportional to `(|td| + eps)^alpha` with importance weights
//! `(N * P(i))^-beta`, normalized by the batch maximum.

mod sum_tree;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::config::ReplayConfig;
use crate::error::{AllocatorError, AllocatorResult};
use crate::state::FEATURE_VERSION;

pub use sum_tree::SumTree;

/// One completed decision: state, raw action, reward, next state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub feature_version: u32,
    /// Group table the action vector was produced for
    #[serde(default)]
    pub groups_version: u32,
    pub state: Vec<f64>,
    /// Raw actor output (pre-projection logits)
    pub action: Vec<f64>,
    pub reward: f64,
    pub next_state: Vec<f64>,
    pub terminal: bool,
    /// Sampling priority; assigned by the store on insert
    #[serde(default)]
    pub priority: f64,
    /// Insertion sequence; assigned by the store on insert
    #[serde(default)]
    pub sequence: u64,
    pub recorded_at: DateTime<Utc>,
}

impl Transition {
    pub fn new(
        state: Vec<f64>,
        action: Vec<f64>,
        reward: f64,
        next_state: Vec<f64>,
        terminal: bool,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            feature_version: FEATURE_VERSION,
            groups_version: 0,
            state,
            action,
            reward,
            next_state,
            terminal,
            priority: 0.0,
            sequence: 0,
            recorded_at,
        }
    }

    pub fn with_groups_version(mut self, groups_version: u32) -> Self {
        self.groups_version = groups_version;
        self
    }
}

/// Identifies a sampled slot; stale keys (slot since overwritten) are ignored
/// on priority update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleKey {
    pub slot: usize,
    pub sequence: u64,
}

/// A prioritized sample with importance-sampling corrections.
#[derive(Debug, Clone)]
pub struct SampledBatch {
    pub transitions: Vec<Transition>,
    pub keys: Vec<SampleKey>,
    pub weights: Vec<f64>,
    pub beta: f64,
}

impl SampledBatch {
    pub fn len(&self) -> usize {
        self.transitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ReplayBuffer {
    config: ReplayConfig,
    slots: Vec<Transition>,
    tree: SumTree,
    /// Next slot to write once the ring is full
    cursor: usize,
    max_priority: f64,
    inserted: u64,
    /// Expected (state, action) lengths; unchecked when unset
    dims: Option<(usize, usize)>,
}

impl ReplayBuffer {
    pub fn new(config: ReplayConfig) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            tree: SumTree::new(capacity),
            slots: Vec::with_capacity(capacity.min(1 << 16)),
            cursor: 0,
            max_priority: 1.0,
            inserted: 0,
            dims: None,
            config,
        }
    }

    /// Reject transitions whose vectors do not match the live networks.
    pub fn with_dimensions(mut self, state_dim: usize, action_dim: usize) -> Self {
        self.dims = Some((state_dim, action_dim));
        self
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.tree.capacity()
    }

    /// Insert one transition at the current maximum priority.
    pub fn push(&mut self, mut transition: Transition) -> AllocatorResult<u64> {
        if transition.feature_version != FEATURE_VERSION {
            return Err(AllocatorError::FeatureVersionMismatch {
                expected: FEATURE_VERSION,
                found: transition.feature_version,
            });
        }
        if let Some((state_dim, action_dim)) = self.dims {
            if transition.state.len() != state_dim
                || transition.next_state.len() != state_dim
                || transition.action.len() != action_dim
            {
                return Err(AllocatorError::ConstraintViolation(format!(
                    "transition shape ({}, {}, {}) does not match ({}, {}, {})",
                    transition.state.len(),
                    transition.action.len(),
                    transition.next_state.len(),
                    state_dim,
                    action_dim,
                    state_dim
                )));
            }
        }

        self.inserted += 1;
        transition.sequence = self.inserted;
        transition.priority = self.max_priority;

        let slot = if self.slots.len() < self.capacity() {
            self.slots.push(transition);
            self.slots.len() - 1
        } else {
            let slot = self.cursor;
            self.slots[slot] = transition;
            self.cursor = (self.cursor + 1) % self.capacity();
            slot
        };
        self.tree.set(slot, self.max_priority);

        Ok(self.inserted)
    }

    /// Bulk insertion (historical reconstruction, archive reload).
    pub fn extend<I>(&mut self, transitions: I) -> AllocatorResult<usize>
    where
        I: IntoIterator<Item = Transition>,
    {
        let mut count = 0;
        for transition in transitions {
            self.push(transition)?;
            count += 1;
        }
        debug!(count, len = self.len(), "Bulk replay insert");
        Ok(count)
    }

    /// Importance-sampling exponent after `learning_step` updates.
    pub fn beta(&self, learning_step: u64) -> f64 {
        let horizon = self.config.beta_horizon_steps.max(1) as f64;
        let progress = (learning_step as f64 / horizon).min(1.0);
        self.config.beta_start + (1.0 - self.config.beta_start) * progress
    }

    /// Stratified prioritized sample of `batch_size` transitions.
    ///
    /// Returns `None` when the store is empty.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        batch_size: usize,
        rng: &mut R,
        learning_step: u64,
    ) -> Option<SampledBatch> {
        let total = self.tree.total();
        if self.is_empty() || batch_size == 0 || total <= 0.0 {
            return None;
        }

        let beta = self.beta(learning_step);
        let n = self.len() as f64;
        let segment = total / batch_size as f64;

        let mut transitions = Vec::with_capacity(batch_size);
        let mut keys = Vec::with_capacity(batch_size);
        let mut weights = Vec::with_capacity(batch_size);

        for i in 0..batch_size {
            let low = segment * i as f64;
            let mass = low + rng.gen::<f64>() * segment;
            let slot = self.tree.find(mass).min(self.len() - 1);
            let probability = self.tree.get(slot) / total;
            let transition = &self.slots[slot];

            weights.push((n * probability).powf(-beta));
            keys.push(SampleKey {
                slot,
                sequence: transition.sequence,
            });
            transitions.push(transition.clone());
        }

        let max_weight = weights.iter().cloned().fold(f64::MIN, f64::max);
        if max_weight > 0.0 && max_weight.is_finite() {
            weights.iter_mut().for_each(|w| *w /= max_weight);
        }

        Some(SampledBatch {
            transitions,
            keys,
            weights,
            beta,
        })
    }

    /// Refresh priorities from the latest TD errors.
    pub fn update_priorities(&mut self, keys: &[SampleKey], td_errors: &[f64]) {
        for (key, td) in keys.iter().zip(td_errors) {
            let Some(transition) = self.slots.get_mut(key.slot) else {
                continue;
            };
            if transition.sequence != key.sequence {
                continue;
            }
            let td = if td.is_finite() { td.abs() } else { self.max_priority };
            let priority = (td + self.config.priority_epsilon).powf(self.config.alpha);
            transition.priority = priority;
            self.tree.set(key.slot, priority);
            if priority > self.max_priority {
                self.max_priority = priority;
            }
        }
    }

    /// Stored transitions, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Transition> + '_ {
        let (newer, older) = if self.slots.len() < self.capacity() {
            (&self.slots[..], &self.slots[..0])
        } else {
            (&self.slots[..self.cursor], &self.slots[self.cursor..])
        };
        older.iter().chain(newer.iter())
    }
}

/// Replay buffer shared between the decision path and the learner.
///
/// Every operation holds the lock for its full duration, so append and
/// sample never observe a partially written transition.
#[derive(Debug, Clone)]
pub struct SharedReplay {
    inner: Arc<Mutex<ReplayBuffer>>,
}

impl SharedReplay {
    pub fn new(config: ReplayConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ReplayBuffer::new(config))),
        }
    }

    pub fn with_dimensions(self, state_dim: usize, action_dim: usize) -> Self {
        {
            let mut buffer = self.inner.lock();
            buffer.dims = Some((state_dim, action_dim));
        }
        self
    }

    pub fn push(&self, transition: Transition) -> AllocatorResult<u64> {
        self.inner.lock().push(transition)
    }

    pub fn extend(&self, transitions: Vec<Transition>) -> AllocatorResult<usize> {
        self.inner.lock().extend(transitions)
    }

    pub fn sample<R: Rng + ?Sized>(
        &self,
        batch_size: usize,
        rng: &mut R,
        learning_step: u64,
    ) -> Option<SampledBatch> {
        self.inner.lock().sample(batch_size, rng, learning_step)
    }

    pub fn update_priorities(&self, keys: &[SampleKey], td_errors: &[f64]) {
        self.inner.lock().update_priorities(keys, td_errors)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn config(capacity: usize) -> ReplayConfig {
        ReplayConfig {
            capacity,
            ..ReplayConfig::default()
        }
    }

    fn transition(reward: f64) -> Transition {
        Transition::new(vec![reward; 3], vec![0.0; 2], reward, vec![reward; 3], false, Utc::now())
    }

    #[test]
    fn test_fifo_eviction_keeps_most_recent() {
        let mut buffer = ReplayBuffer::new(config(5_000));
        for i in 0..10_000 {
            buffer.push(transition(i as f64)).unwrap();
        }

        assert_eq!(buffer.len(), 5_000);
        let rewards: Vec<f64> = buffer.iter().map(|t| t.reward).collect();
        let expected: Vec<f64> = (5_000..10_000).map(|i| i as f64).collect();
        assert_eq!(rewards, expected);
    }

    #[test]
    fn test_equal_priorities_sample_uniformly() {
        let mut buffer = ReplayBuffer::new(config(10));
        for i in 0..10 {
            buffer.push(transition(i as f64)).unwrap();
        }

        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let mut counts = [0usize; 10];
        for _ in 0..7_000 {
            let batch = buffer.sample(7, &mut rng, 0).unwrap();
            for key in &batch.keys {
                counts[key.slot] += 1;
            }
            assert!(batch.weights.iter().all(|w| (w - 1.0).abs() < 1e-12));
        }

        let total: usize = counts.iter().sum();
        let expected = total as f64 / 10.0;
        let chi_squared: f64 = counts
            .iter()
            .map(|&c| (c as f64 - expected).powi(2) / expected)
            .sum();
        // 9 degrees of freedom, p = 0.001
        assert!(chi_squared < 27.88, "chi^2 = {chi_squared}");
    }

    #[test]
    fn test_high_td_error_sampled_more_often() {
        let mut buffer = ReplayBuffer::new(config(4));
        for i in 0..4 {
            buffer.push(transition(i as f64)).unwrap();
        }

        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let batch = buffer.sample(4, &mut rng, 0).unwrap();
        let td: Vec<f64> = batch
            .transitions
            .iter()
            .map(|t| if t.reward == 3.0 { 10.0 } else { 0.01 })
            .collect();
        buffer.update_priorities(&batch.keys, &td);

        let mut hot = 0;
        let mut draws = 0;
        for _ in 0..500 {
            let batch = buffer.sample(4, &mut rng, 0).unwrap();
            hot += batch.transitions.iter().filter(|t| t.reward == 3.0).count();
            draws += batch.len();
            // Rarely drawn slots carry the largest correction.
            let weight_of = |hot: bool| {
                batch
                    .transitions
                    .iter()
                    .zip(&batch.weights)
                    .find(|(t, _)| (t.reward == 3.0) == hot)
                    .map(|(_, w)| *w)
            };
            if let (Some(hot_w), Some(cold_w)) = (weight_of(true), weight_of(false)) {
                assert!(hot_w < cold_w);
            }
        }
        assert!(hot as f64 / draws as f64 > 0.5);
    }

    #[test]
    fn test_stale_keys_ignored_after_overwrite() {
        let mut buffer = ReplayBuffer::new(config(2));
        buffer.push(transition(0.0)).unwrap();
        buffer.push(transition(1.0)).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let batch = buffer.sample(2, &mut rng, 0).unwrap();

        // Both slots overwritten before the learner reports back.
        buffer.push(transition(2.0)).unwrap();
        buffer.push(transition(3.0)).unwrap();
        buffer.update_priorities(&batch.keys, &[100.0, 100.0]);
        assert!(buffer.iter().all(|t| t.priority == 1.0));
    }

    #[test]
    fn test_beta_anneals_to_one() {
        let buffer = ReplayBuffer::new(ReplayConfig {
            beta_start: 0.4,
            beta_horizon_steps: 100,
            ..ReplayConfig::default()
        });
        assert!((buffer.beta(0) - 0.4).abs() < 1e-12);
        assert!((buffer.beta(50) - 0.7).abs() < 1e-12);
        assert_eq!(buffer.beta(100), 1.0);
        assert_eq!(buffer.beta(10_000), 1.0);
    }

    #[test]
    fn test_rejects_other_feature_version() {
        let mut buffer = ReplayBuffer::new(config(4));
        let mut t = transition(0.0);
        t.feature_version = FEATURE_VERSION + 1;
        assert!(matches!(
            buffer.push(t),
            Err(AllocatorError::FeatureVersionMismatch { .. })
        ));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_rejects_action_of_another_group_table() {
        let mut buffer = ReplayBuffer::new(config(4)).with_dimensions(3, 2);
        buffer.push(transition(0.0)).unwrap();

        let wide = Transition::new(vec![0.0; 3], vec![0.0; 9], 0.0, vec![0.0; 3], false, Utc::now());
        assert!(matches!(
            buffer.push(wide),
            Err(AllocatorError::ConstraintViolation(_))
        ));
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_shared_replay_concurrent_append_and_sample() {
        let shared = SharedReplay::new(config(256));
        let writer = {
            let shared = shared.clone();
            std::thread::spawn(move || {
                for i in 0..1_000 {
                    shared.push(transition(i as f64)).unwrap();
                }
            })
        };

        let mut rng = ChaCha8Rng::seed_from_u64(5);
        for _ in 0..200 {
            if let Some(batch) = shared.sample(8, &mut rng, 0) {
                for t in &batch.transitions {
                    assert_eq!(t.state, vec![t.reward; 3]);
                }
            }
        }
        writer.join().unwrap();
        assert_eq!(shared.len(), 256);
    }
}
