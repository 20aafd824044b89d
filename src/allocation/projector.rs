//! Constraint projection from raw actor output to a valid allocation.

use tracing::trace;

use super::groups::{validate_weights, Allocation, GroupTable, ALLOCATION_TOLERANCE};
use crate::error::{AllocatorError, AllocatorResult};

/// Maps arbitrary real vectors onto the capped simplex.
///
/// Softmax, then repeatedly clip entries above their cap and hand the excess
/// to the still-uncapped entries in proportion to their weight. Each pass
/// pins at least one more group at its cap, so the loop runs at most
/// `num_groups` times.
#[derive(Debug, Clone)]
pub struct ConstraintProjector {
    caps: Vec<f64>,
    table: GroupTable,
}

/// Outcome of a projection including how much redistribution it needed.
#[derive(Debug, Clone)]
pub struct Projection {
    pub allocation: Allocation,
    pub iterations: usize,
    pub capped_groups: Vec<usize>,
}

impl ConstraintProjector {
    pub fn new(table: &GroupTable) -> Self {
        Self {
            caps: table.caps(),
            table: table.clone(),
        }
    }

    /// Project raw logits into a valid allocation.
    pub fn project(&self, raw: &[f64]) -> AllocatorResult<Allocation> {
        self.project_detailed(raw).map(|p| p.allocation)
    }

    /// Project and report redistribution details.
    pub fn project_detailed(&self, raw: &[f64]) -> AllocatorResult<Projection> {
        if raw.len() != self.caps.len() {
            return Err(AllocatorError::InferenceFailure(format!(
                "actor produced {} logits for {} groups",
                raw.len(),
                self.caps.len()
            )));
        }
        if raw.iter().any(|x| !x.is_finite()) {
            return Err(AllocatorError::InferenceFailure(
                "actor produced non-finite logits".to_string(),
            ));
        }

        let mut weights = softmax(raw);
        let n = weights.len();
        let mut pinned = vec![false; n];
        let mut iterations = 0;

        while iterations < n {
            let mut excess = 0.0;
            let mut newly_pinned = false;
            for i in 0..n {
                if !pinned[i] && weights[i] > self.caps[i] {
                    excess += weights[i] - self.caps[i];
                    weights[i] = self.caps[i];
                    pinned[i] = true;
                    newly_pinned = true;
                }
            }
            if !newly_pinned {
                break;
            }
            iterations += 1;

            let free_mass: f64 = (0..n).filter(|&i| !pinned[i]).map(|i| weights[i]).sum();
            if free_mass > f64::MIN_POSITIVE {
                for i in (0..n).filter(|&i| !pinned[i]) {
                    weights[i] += excess * weights[i] / free_mass;
                }
            } else {
                // Underflowed softmax leaves nothing to scale; spread by headroom.
                let headroom: f64 = (0..n)
                    .filter(|&i| !pinned[i])
                    .map(|i| self.caps[i] - weights[i])
                    .sum();
                if headroom <= 0.0 {
                    return Err(AllocatorError::ConstraintViolation(
                        "no headroom left to absorb capped excess".to_string(),
                    ));
                }
                for i in (0..n).filter(|&i| !pinned[i]) {
                    weights[i] += excess * (self.caps[i] - weights[i]) / headroom;
                }
            }

            trace!(iteration = iterations, excess, "Redistributed capped excess");
        }

        // Clean float noise so the result sits exactly inside the bounds.
        for (w, cap) in weights.iter_mut().zip(&self.caps) {
            *w = w.clamp(0.0, *cap);
        }
        let sum: f64 = weights.iter().sum();
        if (sum - 1.0).abs() > ALLOCATION_TOLERANCE / 10.0 {
            let slack: Vec<usize> = (0..n).filter(|&i| weights[i] < self.caps[i]).collect();
            let room: f64 = slack.iter().map(|&i| self.caps[i] - weights[i]).sum();
            if room > 0.0 && sum < 1.0 {
                let missing = 1.0 - sum;
                for &i in &slack {
                    weights[i] += missing * (self.caps[i] - weights[i]) / room;
                }
            }
        }

        validate_weights(&weights, &self.table, true)?;

        let capped_groups = (0..n).filter(|&i| pinned[i]).collect();
        Ok(Projection {
            allocation: Allocation::from_projected(weights),
            iterations,
            capped_groups,
        })
    }
}

/// Numerically stable softmax.
pub fn softmax(raw: &[f64]) -> Vec<f64> {
    let max = raw.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = raw.iter().map(|x| (x - max).exp()).collect();
    let total: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / total).collect()
}
