//! Dense feed-forward networks with manual back-propagation and Adam.

use ndarray::{Array1, Array2, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// One fully connected layer, `y = x W + b`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dense {
    /// Shape (inputs, outputs)
    pub weights: Array2<f64>,
    pub bias: Array1<f64>,
}

impl Dense {
    fn xavier<R: Rng + ?Sized>(inputs: usize, outputs: usize, rng: &mut R) -> Self {
        let limit = (6.0 / (inputs + outputs) as f64).sqrt();
        Self {
            weights: Array2::from_shape_fn((inputs, outputs), |_| rng.gen_range(-limit..limit)),
            bias: Array1::zeros(outputs),
        }
    }
}

/// Multi-layer perceptron: ReLU on hidden layers, linear output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mlp {
    layers: Vec<Dense>,
}

/// Activations kept from a forward pass for back-propagation.
#[derive(Debug, Clone)]
pub struct ForwardCache {
    /// Input fed to each layer
    inputs: Vec<Array2<f64>>,
    /// Pre-activation output of each layer
    pre_activations: Vec<Array2<f64>>,
}

/// Per-layer parameter gradients, same layout as [`Mlp`].
#[derive(Debug, Clone)]
pub struct Gradients {
    layers: Vec<(Array2<f64>, Array1<f64>)>,
}

impl Gradients {
    pub fn global_norm(&self) -> f64 {
        self.layers
            .iter()
            .map(|(w, b)| w.iter().map(|x| x * x).sum::<f64>() + b.iter().map(|x| x * x).sum::<f64>())
            .sum::<f64>()
            .sqrt()
    }

    /// Rescale so the global norm does not exceed `max_norm`.
    pub fn clip_global_norm(&mut self, max_norm: f64) {
        let norm = self.global_norm();
        if norm > max_norm && norm.is_finite() {
            let scale = max_norm / norm;
            for (w, b) in &mut self.layers {
                w.mapv_inplace(|x| x * scale);
                b.mapv_inplace(|x| x * scale);
            }
        }
    }
}

impl Mlp {
    /// Build with layer sizes `[input, hidden..., output]`.
    pub fn new<R: Rng + ?Sized>(sizes: &[usize], rng: &mut R) -> Self {
        let layers = sizes
            .windows(2)
            .map(|pair| Dense::xavier(pair[0], pair[1], rng))
            .collect();
        Self { layers }
    }

    pub fn input_dim(&self) -> usize {
        self.layers.first().map(|l| l.weights.nrows()).unwrap_or(0)
    }

    /// Shrink the output layer so initial outputs sit near zero.
    pub fn scale_output_layer(&mut self, factor: f64) {
        if let Some(last) = self.layers.last_mut() {
            last.weights.mapv_inplace(|w| w * factor);
            last.bias.mapv_inplace(|b| b * factor);
        }
    }

    pub fn forward(&self, input: &Array2<f64>) -> Array2<f64> {
        let mut x = input.clone();
        let last = self.layers.len().saturating_sub(1);
        for (i, layer) in self.layers.iter().enumerate() {
            x = x.dot(&layer.weights) + &layer.bias;
            if i < last {
                x.mapv_inplace(|v| v.max(0.0));
            }
        }
        x
    }

    pub fn forward_cached(&self, input: &Array2<f64>) -> (Array2<f64>, ForwardCache) {
        let mut inputs = Vec::with_capacity(self.layers.len());
        let mut pre_activations = Vec::with_capacity(self.layers.len());
        let mut x = input.clone();
        let last = self.layers.len().saturating_sub(1);

        for (i, layer) in self.layers.iter().enumerate() {
            let z = x.dot(&layer.weights) + &layer.bias;
            inputs.push(x);
            x = if i < last { z.mapv(|v| v.max(0.0)) } else { z.clone() };
            pre_activations.push(z);
        }

        (
            x,
            ForwardCache {
                inputs,
                pre_activations,
            },
        )
    }

    /// Back-propagate `grad_output` (dL/d output) through the cached pass.
    ///
    /// Returns parameter gradients and dL/d input.
    pub fn backward(&self, cache: &ForwardCache, grad_output: &Array2<f64>) -> (Gradients, Array2<f64>) {
        let mut grads = Vec::with_capacity(self.layers.len());
        let mut grad = grad_output.clone();
        let last = self.layers.len().saturating_sub(1);

        for i in (0..self.layers.len()).rev() {
            if i < last {
                let z = &cache.pre_activations[i];
                grad.zip_mut_with(z, |g, &zv| {
                    if zv <= 0.0 {
                        *g = 0.0;
                    }
                });
            }
            let grad_w = cache.inputs[i].t().dot(&grad);
            let grad_b = grad.sum_axis(Axis(0));
            let grad_in = grad.dot(&self.layers[i].weights.t());
            grads.push((grad_w, grad_b));
            grad = grad_in;
        }

        grads.reverse();
        (Gradients { layers: grads }, grad)
    }

    /// Polyak averaging: `self = (1 - tau) * self + tau * source`.
    pub fn soft_update_from(&mut self, source: &Mlp, tau: f64) {
        for (target, live) in self.layers.iter_mut().zip(&source.layers) {
            target
                .weights
                .zip_mut_with(&live.weights, |t, &s| *t = (1.0 - tau) * *t + tau * s);
            target
                .bias
                .zip_mut_with(&live.bias, |t, &s| *t = (1.0 - tau) * *t + tau * s);
        }
    }

    pub fn l2_norm(&self) -> f64 {
        self.layers
            .iter()
            .map(|l| {
                l.weights.iter().map(|x| x * x).sum::<f64>() + l.bias.iter().map(|x| x * x).sum::<f64>()
            })
            .sum::<f64>()
            .sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.layers
            .iter()
            .all(|l| l.weights.iter().all(|x| x.is_finite()) && l.bias.iter().all(|x| x.is_finite()))
    }
}

/// Adam optimizer state for one [`Mlp`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Adam {
    lr: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    beta1_t: f64,
    beta2_t: f64,
    m: Vec<(Array2<f64>, Array1<f64>)>,
    v: Vec<(Array2<f64>, Array1<f64>)>,
}

impl Adam {
    pub fn new(net: &Mlp, lr: f64) -> Self {
        let zeros: Vec<(Array2<f64>, Array1<f64>)> = net
            .layers
            .iter()
            .map(|l| (Array2::zeros(l.weights.raw_dim()), Array1::zeros(l.bias.len())))
            .collect();
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            beta1_t: 1.0,
            beta2_t: 1.0,
            m: zeros.clone(),
            v: zeros,
        }
    }

    pub fn step(&mut self, net: &mut Mlp, grads: &Gradients) {
        self.beta1_t *= self.beta1;
        self.beta2_t *= self.beta2;
        let (b1, b2, eps, lr) = (self.beta1, self.beta2, self.epsilon, self.lr);
        let bias1 = 1.0 - self.beta1_t;
        let bias2 = 1.0 - self.beta2_t;

        for (i, layer) in net.layers.iter_mut().enumerate() {
            let (gw, gb) = &grads.layers[i];
            let (mw, mb) = &mut self.m[i];
            let (vw, vb) = &mut self.v[i];

            mw.zip_mut_with(gw, |m, &g| *m = b1 * *m + (1.0 - b1) * g);
            vw.zip_mut_with(gw, |v, &g| *v = b2 * *v + (1.0 - b2) * g * g);
            mb.zip_mut_with(gb, |m, &g| *m = b1 * *m + (1.0 - b1) * g);
            vb.zip_mut_with(gb, |v, &g| *v = b2 * *v + (1.0 - b2) * g * g);

            ndarray::Zip::from(&mut layer.weights)
                .and(&*mw)
                .and(&*vw)
                .for_each(|p, &m, &v| *p -= lr * (m / bias1) / ((v / bias2).sqrt() + eps));
            ndarray::Zip::from(&mut layer.bias)
                .and(&*mb)
                .and(&*vb)
                .for_each(|p, &m, &v| *p -= lr * (m / bias1) / ((v / bias2).sqrt() + eps));
        }
    }
}

/// Adam for a single scalar parameter (the log temperature).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalarAdam {
    lr: f64,
    m: f64,
    v: f64,
    t: i32,
}

impl ScalarAdam {
    pub fn new(lr: f64) -> Self {
        Self { lr, m: 0.0, v: 0.0, t: 0 }
    }

    pub fn step(&mut self, param: &mut f64, grad: f64) {
        self.t = self.t.saturating_add(1);
        self.m = 0.9 * self.m + 0.1 * grad;
        self.v = 0.999 * self.v + 0.001 * grad * grad;
        let m_hat = self.m / (1.0 - 0.9f64.powi(self.t));
        let v_hat = self.v / (1.0 - 0.999f64.powi(self.t));
        *param -= self.lr * m_hat / (v_hat.sqrt() + 1e-8);
    }
}

/// Standard normal draw (Box-Muller).
pub fn standard_normal<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    let u1: f64 = rng.gen_range(f64::MIN_POSITIVE..1.0);
    let u2: f64 = rng.gen::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_backward_matches_finite_difference() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let net = Mlp::new(&[3, 5, 2], &mut rng);
        let x = array![[0.3, -0.2, 0.9], [1.1, 0.4, -0.7]];

        // L = sum(outputs)
        let (out, cache) = net.forward_cached(&x);
        let (_, grad_in) = net.backward(&cache, &Array2::ones(out.raw_dim()));

        let h = 1e-6;
        for r in 0..2 {
            for c in 0..3 {
                let mut xp = x.clone();
                xp[[r, c]] += h;
                let mut xm = x.clone();
                xm[[r, c]] -= h;
                let numeric = (net.forward(&xp).sum() - net.forward(&xm).sum()) / (2.0 * h);
                assert!((numeric - grad_in[[r, c]]).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_adam_reduces_regression_loss() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let mut net = Mlp::new(&[2, 16, 1], &mut rng);
        let mut adam = Adam::new(&net, 1e-2);
        let x = array![[0.0, 1.0], [1.0, 0.0], [1.0, 1.0], [0.0, 0.0]];
        let y = array![[1.0], [1.0], [2.0], [0.0]];

        let loss = |net: &Mlp| (&net.forward(&x) - &y).mapv(|d| d * d).mean().unwrap();
        let before = loss(&net);
        for _ in 0..300 {
            let (out, cache) = net.forward_cached(&x);
            let grad = (&out - &y) * (2.0 / 4.0);
            let (grads, _) = net.backward(&cache, &grad);
            adam.step(&mut net, &grads);
        }
        assert!(loss(&net) < before * 0.1);
    }

    #[test]
    fn test_soft_update_moves_toward_source() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let source = Mlp::new(&[2, 3, 1], &mut rng);
        let mut target = Mlp::new(&[2, 3, 1], &mut rng);
        let x = array![[0.5, -0.5]];

        let gap_before = (source.forward(&x) - target.forward(&x)).mapv(f64::abs).sum();
        target.soft_update_from(&source, 1.0);
        assert_eq!(target, source);
        assert!(gap_before > 0.0);
    }

    #[test]
    fn test_gradient_clipping() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let net = Mlp::new(&[2, 4, 1], &mut rng);
        let (out, cache) = net.forward_cached(&array![[10.0, -10.0]]);
        let (mut grads, _) = net.backward(&cache, &(out * 1000.0));
        grads.clip_global_norm(1.0);
        assert!(grads.global_norm() <= 1.0 + 1e-9);
    }
}
