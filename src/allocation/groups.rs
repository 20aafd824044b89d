//! Strategy group table and allocation vector types.

use serde::{Deserialize, Serialize};

use crate::config::{GroupsConfig, StrategyGroupConfig};
use crate::error::{AllocatorError, AllocatorResult};

/// Tolerance for the sum-to-one and cap invariants.
pub const ALLOCATION_TOLERANCE: f64 = 1e-6;

/// A statically configured strategy group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyGroup {
    pub id: String,
    pub label: String,
    pub strategies: Vec<String>,
    pub max_allocation: f64,
}

/// Closed, versioned group table. Built once at startup and shared by
/// reference; there is no API to add or remove groups at runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupTable {
    version: u32,
    groups: Vec<StrategyGroup>,
}

impl GroupTable {
    /// Build the table, failing if the caps cannot hold a full allocation.
    pub fn from_config(config: &GroupsConfig) -> AllocatorResult<Self> {
        if config.groups.is_empty() {
            return Err(AllocatorError::ConstraintViolation(
                "group table is empty".to_string(),
            ));
        }

        let groups: Vec<StrategyGroup> = config
            .groups
            .iter()
            .map(|g| StrategyGroup {
                id: g.id.clone(),
                label: g.label.clone(),
                strategies: g.strategies.clone(),
                max_allocation: g.max_allocation,
            })
            .collect();

        let cap_sum: f64 = groups.iter().map(|g| g.max_allocation).sum();
        if cap_sum < 1.0 {
            return Err(AllocatorError::ConstraintViolation(format!(
                "sum of group caps is {:.4}, must be at least 1",
                cap_sum
            )));
        }

        Ok(Self {
            version: config.groups_version,
            groups,
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn groups(&self) -> &[StrategyGroup] {
        &self.groups
    }

    pub fn caps(&self) -> Vec<f64> {
        self.groups.iter().map(|g| g.max_allocation).collect()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.groups.iter().map(|g| g.id.as_str()).collect()
    }

    /// Equal weights clipped to caps; the fallback when inference fails.
    pub fn equal_weight(&self) -> Allocation {
        let n = self.groups.len() as f64;
        // Caps sum to >= 1, so equal weights only need projecting when a cap
        // sits below 1/n.
        let raw = vec![0.0; self.groups.len()];
        match super::ConstraintProjector::new(self).project(&raw) {
            Ok(allocation) => allocation,
            Err(_) => Allocation {
                weights: vec![1.0 / n; self.groups.len()],
            },
        }
    }
}

/// A valid allocation: non-negative, sums to 1, each entry within its cap.
///
/// Only constructible through [`Allocation::new`] or the projector, so a
/// value of this type always satisfies the invariants.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Allocation {
    weights: Vec<f64>,
}

impl Allocation {
    /// Validate weights against the group table.
    pub fn new(weights: Vec<f64>, table: &GroupTable) -> AllocatorResult<Self> {
        validate_weights(&weights, table, true)?;
        Ok(Self { weights })
    }

    /// Internal constructor for values the projector has already checked.
    pub(crate) fn from_projected(weights: Vec<f64>) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

/// Allocation dispatched while the supervisor holds the system paused.
///
/// Either all weight withdrawn (every entry zero) or a fully invested vector
/// that respects the caps.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SafeAllocation {
    weights: Vec<f64>,
}

impl SafeAllocation {
    /// Build from configured weights; an empty list means withdrawn.
    pub fn from_config(
        weights: &[f64],
        groups: &[StrategyGroupConfig],
    ) -> AllocatorResult<Self> {
        if weights.is_empty() {
            return Ok(Self {
                weights: vec![0.0; groups.len()],
            });
        }

        if weights.len() != groups.len() {
            return Err(AllocatorError::ConstraintViolation(format!(
                "safe allocation has {} entries for {} groups",
                weights.len(),
                groups.len()
            )));
        }

        for (w, g) in weights.iter().zip(groups) {
            if !w.is_finite() || *w < 0.0 || *w > g.max_allocation + ALLOCATION_TOLERANCE {
                return Err(AllocatorError::ConstraintViolation(format!(
                    "safe allocation weight {} for '{}' outside [0, {}]",
                    w, g.id, g.max_allocation
                )));
            }
        }

        let sum: f64 = weights.iter().sum();
        if sum > ALLOCATION_TOLERANCE && (sum - 1.0).abs() > ALLOCATION_TOLERANCE {
            return Err(AllocatorError::ConstraintViolation(format!(
                "safe allocation must sum to 0 or 1, got {:.6}",
                sum
            )));
        }

        Ok(Self {
            weights: weights.to_vec(),
        })
    }

    /// All weight withdrawn from every group.
    pub fn withdrawn(num_groups: usize) -> Self {
        Self {
            weights: vec![0.0; num_groups],
        }
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn is_withdrawn(&self) -> bool {
        self.weights.iter().all(|w| *w == 0.0)
    }
}

/// Check the allocation invariants. `require_full` demands sum = 1.
pub fn validate_weights(
    weights: &[f64],
    table: &GroupTable,
    require_full: bool,
) -> AllocatorResult<()> {
    if weights.len() != table.len() {
        return Err(AllocatorError::ConstraintViolation(format!(
            "allocation has {} entries for {} groups",
            weights.len(),
            table.len()
        )));
    }

    for (w, g) in weights.iter().zip(table.groups()) {
        if !w.is_finite() || *w < -ALLOCATION_TOLERANCE {
            return Err(AllocatorError::ConstraintViolation(format!(
                "weight {} for '{}' is negative or non-finite",
                w, g.id
            )));
        }
        if *w > g.max_allocation + ALLOCATION_TOLERANCE {
            return Err(AllocatorError::ConstraintViolation(format!(
                "weight {:.6} for '{}' exceeds cap {}",
                w, g.id, g.max_allocation
            )));
        }
    }

    let sum: f64 = weights.iter().sum();
    if require_full && (sum - 1.0).abs() > ALLOCATION_TOLERANCE {
        return Err(AllocatorError::ConstraintViolation(format!(
            "allocation sums to {:.8}, expected 1",
            sum
        )));
    }

    Ok(())
}
