//! Action-value critics.

use ndarray::{s, Array1, Array2, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::network::{ForwardCache, Gradients, Mlp};

/// Q(s, a) over the concatenated `[state | action]` input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Critic {
    net: Mlp,
    state_dim: usize,
}

pub struct CriticPass {
    pub q: Array1<f64>,
    cache: ForwardCache,
}

impl Critic {
    pub fn new<R: Rng + ?Sized>(
        state_dim: usize,
        action_dim: usize,
        hidden: &[usize],
        rng: &mut R,
    ) -> Self {
        let mut sizes = Vec::with_capacity(hidden.len() + 2);
        sizes.push(state_dim + action_dim);
        sizes.extend_from_slice(hidden);
        sizes.push(1);
        Self {
            net: Mlp::new(&sizes, rng),
            state_dim,
        }
    }

    pub fn network(&self) -> &Mlp {
        &self.net
    }

    pub(crate) fn network_mut(&mut self) -> &mut Mlp {
        &mut self.net
    }

    fn join(&self, states: &Array2<f64>, actions: &Array2<f64>) -> Array2<f64> {
        let mut input = Array2::zeros((states.nrows(), states.ncols() + actions.ncols()));
        input.slice_mut(s![.., ..states.ncols()]).assign(states);
        input.slice_mut(s![.., states.ncols()..]).assign(actions);
        input
    }

    pub fn q(&self, states: &Array2<f64>, actions: &Array2<f64>) -> Array1<f64> {
        self.net
            .forward(&self.join(states, actions))
            .index_axis_move(Axis(1), 0)
    }

    pub fn q_cached(&self, states: &Array2<f64>, actions: &Array2<f64>) -> CriticPass {
        let (out, cache) = self.net.forward_cached(&self.join(states, actions));
        CriticPass {
            q: out.index_axis_move(Axis(1), 0),
            cache,
        }
    }

    /// Parameter gradients and dL/d action for a given dL/dQ per sample.
    pub fn backward(&self, pass: &CriticPass, grad_q: &Array1<f64>) -> (Gradients, Array2<f64>) {
        let grad_out = grad_q.clone().insert_axis(Axis(1));
        let (grads, grad_input) = self.net.backward(&pass.cache, &grad_out);
        let grad_actions = grad_input.slice(s![.., self.state_dim..]).to_owned();
        (grads, grad_actions)
    }

    pub fn soft_update_from(&mut self, live: &Critic, tau: f64) {
        self.net.soft_update_from(&live.net, tau);
    }
}
