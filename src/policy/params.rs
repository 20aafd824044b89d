//! Versioned parameter sets, inference snapshots and checkpoints.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use super::actor::GaussianActor;
use super::critic::Critic;
use crate::error::{AllocatorError, AllocatorResult};
use crate::state::FEATURE_VERSION;

/// Every learned parameter: actor, twin critics, targets and temperature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SacNetworks {
    pub actor: GaussianActor,
    pub q1: Critic,
    pub q2: Critic,
    pub q1_target: Critic,
    pub q2_target: Critic,
    pub log_alpha: f64,
}

impl SacNetworks {
    /// Fresh parameters; targets start as exact copies of the live critics.
    pub fn new<R: Rng + ?Sized>(
        state_dim: usize,
        action_dim: usize,
        hidden: &[usize],
        initial_alpha: f64,
        rng: &mut R,
    ) -> Self {
        let actor = GaussianActor::new(state_dim, action_dim, hidden, rng);
        let q1 = Critic::new(state_dim, action_dim, hidden, rng);
        let q2 = Critic::new(state_dim, action_dim, hidden, rng);
        Self {
            actor,
            q1_target: q1.clone(),
            q2_target: q2.clone(),
            q1,
            q2,
            log_alpha: initial_alpha.max(f64::MIN_POSITIVE).ln(),
        }
    }

    pub fn alpha(&self) -> f64 {
        self.log_alpha.exp()
    }

    /// Largest L2 norm across the live networks.
    pub fn max_param_norm(&self) -> f64 {
        [
            self.actor.network().l2_norm(),
            self.q1.network().l2_norm(),
            self.q2.network().l2_norm(),
        ]
        .into_iter()
        .fold(0.0, f64::max)
    }

    pub fn is_finite(&self) -> bool {
        self.log_alpha.is_finite()
            && self.actor.network().is_finite()
            && self.q1.network().is_finite()
            && self.q2.network().is_finite()
            && self.q1_target.network().is_finite()
            && self.q2_target.network().is_finite()
    }
}

/// Immutable parameters read by inference.
#[derive(Debug, Clone)]
pub struct PolicySnapshot {
    pub version: u64,
    pub training_step: u64,
    pub actor: GaussianActor,
    pub alpha: f64,
    pub published_at: DateTime<Utc>,
}

/// Single-writer, many-reader holder of the live policy snapshot.
///
/// Readers clone the `Arc` and never observe a half-applied update.
#[derive(Debug)]
pub struct ParameterStore {
    current: RwLock<Arc<PolicySnapshot>>,
}

impl ParameterStore {
    pub fn new(initial: PolicySnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        Arc::clone(&self.current.read())
    }

    pub fn version(&self) -> u64 {
        self.current.read().version
    }

    /// Swap in a newer snapshot. Versions must strictly increase.
    pub fn publish(&self, snapshot: PolicySnapshot) -> bool {
        let mut current = self.current.write();
        if snapshot.version <= current.version {
            warn!(
                current = current.version,
                offered = snapshot.version,
                "Ignoring stale policy snapshot"
            );
            return false;
        }
        info!(
            version = snapshot.version,
            step = snapshot.training_step,
            alpha = snapshot.alpha,
            "Published policy snapshot"
        );
        *current = Arc::new(snapshot);
        true
    }
}

/// Immutable persisted parameter set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u64,
    pub training_step: u64,
    pub feature_version: u32,
    pub groups_version: u32,
    pub created_at: DateTime<Utc>,
    pub networks: SacNetworks,
}

impl Checkpoint {
    /// Reject checkpoints trained for another feature layout or group table.
    pub fn check_compatible(&self, groups_version: u32, num_groups: usize) -> AllocatorResult<()> {
        if self.feature_version != FEATURE_VERSION {
            return Err(AllocatorError::FeatureVersionMismatch {
                expected: FEATURE_VERSION,
                found: self.feature_version,
            });
        }
        if self.groups_version != groups_version || self.networks.actor.action_dim() != num_groups {
            return Err(AllocatorError::ConstraintViolation(format!(
                "checkpoint v{} built for groups version {} ({} groups), running {} ({} groups)",
                self.version,
                self.groups_version,
                self.networks.actor.action_dim(),
                groups_version,
                num_groups
            )));
        }
        Ok(())
    }

    pub fn policy_snapshot(&self) -> PolicySnapshot {
        PolicySnapshot {
            version: self.version,
            training_step: self.training_step,
            actor: self.networks.actor.clone(),
            alpha: self.networks.alpha(),
            published_at: self.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn snapshot(version: u64) -> PolicySnapshot {
        let mut rng = ChaCha8Rng::seed_from_u64(version);
        PolicySnapshot {
            version,
            training_step: version * 10,
            actor: GaussianActor::new(4, 2, &[8], &mut rng),
            alpha: 0.2,
            published_at: Utc::now(),
        }
    }

    #[test]
    fn test_publish_requires_increasing_version() {
        let store = ParameterStore::new(snapshot(1));
        let held = store.snapshot();

        assert!(store.publish(snapshot(2)));
        assert!(!store.publish(snapshot(2)));
        assert!(!store.publish(snapshot(1)));
        assert_eq!(store.version(), 2);

        // A reader's snapshot is unaffected by later publishes.
        assert_eq!(held.version, 1);
    }

    #[test]
    fn test_checkpoint_json_round_trip_and_compatibility() {
        let mut rng = ChaCha8Rng::seed_from_u64(12);
        let checkpoint = Checkpoint {
            version: 7,
            training_step: 700,
            feature_version: FEATURE_VERSION,
            groups_version: 1,
            created_at: Utc::now(),
            networks: SacNetworks::new(4, 3, &[8, 8], 0.2, &mut rng),
        };

        let json = serde_json::to_string(&checkpoint).unwrap();
        let restored: Checkpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, checkpoint);
        assert!(restored.check_compatible(1, 3).is_ok());
        assert!(matches!(
            restored.check_compatible(2, 3),
            Err(AllocatorError::ConstraintViolation(_))
        ));

        let mut stale = restored;
        stale.feature_version = FEATURE_VERSION + 1;
        assert!(matches!(
            stale.check_compatible(1, 3),
            Err(AllocatorError::FeatureVersionMismatch { .. })
        ));
    }
}
