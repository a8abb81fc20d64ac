//! Layer Normalization
//!
//! Layer normalization rescales one activation vector to zero mean and unit
//! variance, then applies a learnable scale (gamma) and shift (beta).
//!
//! ## Forward Pass
//!
//! ```text
//! 1. mean = Σx / N
//! 2. var  = Σ(x - mean)² / N
//! 3. norm = (x - mean) / √(var + ε)
//! 4. y    = γ · norm + β
//! ```
//!
//! ## Backward Pass
//!
//! Mean and variance depend on every element, so each input receives a share
//! of the gradient through both statistics:
//!
//! ```text
//! grad_γ    = grad_y · norm
//! grad_β    = grad_y
//! grad_norm = grad_y · γ
//! grad_var  = Σ grad_norm · (x - mean) · (-½)(var + ε)^(-3/2)
//! grad_mean = -Σ grad_norm / √(var + ε) + grad_var · Σ(-2(x - mean)) / N
//! grad_x[i] = grad_norm[i] / √(var + ε) + grad_var · 2(x[i] - mean) / N + grad_mean / N
//! ```
//!
//! A non-finite term in any of these sums is skipped instead of propagated, so
//! one bad element does not poison the whole gradient.

use tracing::warn;

use crate::cache::LayerNormCache;
use crate::math::finite_or_zero;
use crate::params::ParameterSet;

/// Small constant for numerical stability.
pub const LAYER_NORM_EPS: f32 = 1e-5;

/// Borrowed view of a layer norm's scale and shift.
pub struct LayerNorm<'a> {
    pub gamma: &'a [f32],
    pub beta: &'a [f32],
    pub eps: f32,
}

impl<'a> LayerNorm<'a> {
    pub fn new(params: &'a ParameterSet) -> Self {
        Self {
            gamma: &params.gamma,
            beta: &params.beta,
            eps: LAYER_NORM_EPS,
        }
    }

    /// Forward pass
    ///
    /// Normalizes `x` over its features and applies scale and shift.
    pub fn forward(&self, x: &[f32]) -> (Vec<f32>, LayerNormCache) {
        let n = x.len() as f32;
        let mean = x.iter().sum::<f32>() / n;
        let variance = x.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
        let stddev = (variance + self.eps).sqrt();

        let normalized: Vec<f32> = x.iter().map(|v| (v - mean) / stddev).collect();
        let y = normalized
            .iter()
            .zip(self.gamma.iter().zip(self.beta))
            .map(|(nv, (g, b))| g * nv + b)
            .collect();

        let cache = LayerNormCache {
            mean,
            variance,
            stddev,
            normalized,
            input: x.to_vec(),
            gamma: self.gamma.to_vec(),
        };

        (y, cache)
    }

    /// Backward pass
    ///
    /// Accumulates gamma and beta gradients into `grads` and returns the
    /// gradient with respect to the input.
    pub fn backward(
        &self,
        grad_out: &[f32],
        cache: &LayerNormCache,
        grads: &mut ParameterSet,
    ) -> Vec<f32> {
        let n = cache.input.len();
        let n_f = n as f32;
        let var_eps = cache.variance + self.eps;
        let inv_std = 1.0 / var_eps.sqrt();
        let mut anomalies = 0usize;
        let mut finite = |value: f32| {
            let (v, bad) = finite_or_zero(value);
            anomalies += bad as usize;
            v
        };

        for i in 0..n {
            grads.gamma[i] += finite(grad_out[i] * cache.normalized[i]);
            grads.beta[i] += finite(grad_out[i]);
        }

        // Backprop through scale
        let grad_norm: Vec<f32> = grad_out
            .iter()
            .zip(&cache.gamma)
            .map(|(g, gamma)| g * gamma)
            .collect();

        let centered: Vec<f32> = cache.input.iter().map(|x| x - cache.mean).collect();

        // Variance dependency
        let var_factor = -0.5 * var_eps.powf(-1.5);
        let mut grad_var = 0.0;
        for i in 0..n {
            grad_var += finite(grad_norm[i] * centered[i] * var_factor);
        }

        // Mean dependency
        let mut grad_mean = 0.0;
        let mut centered_sum = 0.0;
        for i in 0..n {
            grad_mean += finite(-grad_norm[i] * inv_std);
            centered_sum += finite(-2.0 * centered[i]);
        }
        grad_mean += finite(grad_var * centered_sum / n_f);

        let grad_x = (0..n)
            .map(|i| {
                finite(grad_norm[i] * inv_std)
                    + finite(grad_var * 2.0 * centered[i] / n_f)
                    + finite(grad_mean / n_f)
            })
            .collect();

        if anomalies > 0 {
            warn!(count = anomalies, "non-finite layer norm gradient terms skipped");
        }

        grad_x
    }
}
