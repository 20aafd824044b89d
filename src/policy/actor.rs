//! Gaussian allocation policy.

use ndarray::{s, Array1, Array2, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::network::{standard_normal, ForwardCache, Gradients, Mlp};
use crate::error::{AllocatorError, AllocatorResult};

pub const LOG_STD_MIN: f64 = -20.0;
pub const LOG_STD_MAX: f64 = 2.0;

/// Output layer scale for a fresh actor; near-zero logits project to
/// near-equal weights.
const INITIAL_OUTPUT_SCALE: f64 = 1e-3;

const HALF_LN_2PI: f64 = 0.918_938_533_204_672_8;

/// State to per-dimension Gaussian over raw allocation logits.
///
/// The network emits `[mean | log_std]`, each `action_dim` wide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaussianActor {
    net: Mlp,
    action_dim: usize,
}

/// Reparameterized batch sample kept for the actor gradient.
#[derive(Debug, Clone)]
pub struct ActorSample {
    pub actions: Array2<f64>,
    pub log_probs: Array1<f64>,
    noise: Array2<f64>,
    log_std: Array2<f64>,
    /// Unclamped network log-std output
    raw_log_std: Array2<f64>,
    cache: ForwardCache,
}

impl GaussianActor {
    pub fn new<R: Rng + ?Sized>(
        state_dim: usize,
        action_dim: usize,
        hidden: &[usize],
        rng: &mut R,
    ) -> Self {
        let mut sizes = Vec::with_capacity(hidden.len() + 2);
        sizes.push(state_dim);
        sizes.extend_from_slice(hidden);
        sizes.push(2 * action_dim);

        let mut net = Mlp::new(&sizes, rng);
        net.scale_output_layer(INITIAL_OUTPUT_SCALE);
        Self { net, action_dim }
    }

    pub fn action_dim(&self) -> usize {
        self.action_dim
    }

    pub fn state_dim(&self) -> usize {
        self.net.input_dim()
    }

    pub fn network(&self) -> &Mlp {
        &self.net
    }

    pub(crate) fn network_mut(&mut self) -> &mut Mlp {
        &mut self.net
    }

    fn split(&self, output: &Array2<f64>) -> (Array2<f64>, Array2<f64>) {
        let mean = output.slice(s![.., ..self.action_dim]).to_owned();
        let raw_log_std = output.slice(s![.., self.action_dim..]).to_owned();
        (mean, raw_log_std)
    }

    /// Raw action for one state: the mean, or a sample when exploring.
    pub fn act<R: Rng + ?Sized>(
        &self,
        state: &[f64],
        explore: bool,
        rng: &mut R,
    ) -> AllocatorResult<Vec<f64>> {
        if state.len() != self.state_dim() {
            return Err(AllocatorError::InferenceFailure(format!(
                "state has {} features, actor expects {}",
                state.len(),
                self.state_dim()
            )));
        }

        let input = Array2::from_shape_vec((1, state.len()), state.to_vec())
            .map_err(|e| AllocatorError::InferenceFailure(e.to_string()))?;
        let (mean, raw_log_std) = self.split(&self.net.forward(&input));

        let action: Vec<f64> = if explore {
            mean.iter()
                .zip(raw_log_std.iter())
                .map(|(m, ls)| m + ls.clamp(LOG_STD_MIN, LOG_STD_MAX).exp() * standard_normal(rng))
                .collect()
        } else {
            mean.iter().copied().collect()
        };

        if action.iter().any(|a| !a.is_finite()) {
            return Err(AllocatorError::InferenceFailure(
                "actor produced non-finite output".to_string(),
            ));
        }
        Ok(action)
    }

    /// Reparameterized sample `a = mu + sigma * eps` for a batch of states.
    pub fn sample<R: Rng + ?Sized>(&self, states: &Array2<f64>, rng: &mut R) -> ActorSample {
        let (output, cache) = self.net.forward_cached(states);
        let (mean, raw_log_std) = self.split(&output);
        let log_std = raw_log_std.mapv(|v| v.clamp(LOG_STD_MIN, LOG_STD_MAX));
        let noise = Array2::from_shape_fn(mean.raw_dim(), |_| standard_normal(rng));

        let actions = &mean + &(log_std.mapv(f64::exp) * &noise);
        let log_probs = (noise.mapv(|e| -0.5 * e * e - HALF_LN_2PI) - &log_std).sum_axis(Axis(1));

        ActorSample {
            actions,
            log_probs,
            noise,
            log_std,
            raw_log_std,
            cache,
        }
    }

    /// Gradients of a loss given dL/d action and dL/d log-prob per sample.
    ///
    /// With `eps` held fixed, `d logp / d mu = 0` and
    /// `d logp / d log_std = -1`; entries whose log-std was clamped get no
    /// log-std gradient.
    pub fn backward(
        &self,
        sample: &ActorSample,
        grad_actions: &Array2<f64>,
        grad_log_probs: &Array1<f64>,
    ) -> Gradients {
        let batch = grad_actions.nrows();
        let mut grad_output = Array2::zeros((batch, 2 * self.action_dim));

        for i in 0..batch {
            for j in 0..self.action_dim {
                let ga = grad_actions[[i, j]];
                let sigma = sample.log_std[[i, j]].exp();
                grad_output[[i, j]] = ga;

                let raw = sample.raw_log_std[[i, j]];
                if (LOG_STD_MIN..=LOG_STD_MAX).contains(&raw) {
                    grad_output[[i, self.action_dim + j]] =
                        ga * sigma * sample.noise[[i, j]] - grad_log_probs[i];
                }
            }
        }

        let (grads, _) = self.net.backward(&sample.cache, &grad_output);
        grads
    }
}
