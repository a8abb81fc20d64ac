//! Dense Layer (Fully Connected)
//!
//! The dense layer performs an affine transformation followed by an
//! element-wise activation:
//!
//! ```text
//! raw[j] = b[j] + Σ_k W[j,k] · x[k]
//! y[j]   = act(raw[j])
//! ```
//!
//! `W` is stored row-major as `[output_size, input_size]`, so each output
//! unit's weights are contiguous.
//!
//! ## Backward Pass
//!
//! ```text
//! delta[j]  = grad_y[j] · act'(raw[j])
//! grad_W   += delta ⊗ x
//! grad_b   += delta
//! grad_x[k] = Σ_j delta[j] · W[j,k]
//! ```
//!
//! A `softmax` activation is applied across the whole output vector and
//! backpropagates as a pass-through, the same as a standalone softmax layer.

use tracing::warn;

use super::activation::Activation;
use super::LayerConfig;
use crate::cache::DenseCache;
use crate::math::{dot, finite_or_zero, softmax};
use crate::params::ParameterSet;

/// Borrowed view of a dense layer's parameters.
pub struct Dense<'a> {
    pub weights: &'a [f32],
    /// Empty when the layer has no bias.
    pub bias: &'a [f32],
    pub input_size: usize,
    pub output_size: usize,
    pub activation: Activation,
}

impl<'a> Dense<'a> {
    pub fn new(config: &LayerConfig, params: &'a ParameterSet, activation: Activation) -> Self {
        Self {
            weights: &params.weights,
            bias: &params.bias,
            input_size: config.input_size,
            output_size: config.output_size,
            activation,
        }
    }

    /// Forward pass
    ///
    /// Returns the activated outputs and the raw sums needed to evaluate the
    /// activation derivative in the backward pass.
    pub fn forward(&self, x: &[f32]) -> (Vec<f32>, DenseCache) {
        let raw: Vec<f32> = (0..self.output_size)
            .map(|j| {
                let row = &self.weights[j * self.input_size..(j + 1) * self.input_size];
                let bias = self.bias.get(j).copied().unwrap_or(0.0);
                bias + dot(row, x)
            })
            .collect();

        let output = match self.activation {
            Activation::Softmax => softmax(&raw),
            activation => raw.iter().map(|&r| activation.apply(r)).collect(),
        };

        (output, DenseCache { raw })
    }

    /// Backward pass
    ///
    /// Accumulates weight and bias gradients into `grads` and returns the
    /// gradient with respect to `x`, the input seen during the forward pass.
    pub fn backward(
        &self,
        grad_out: &[f32],
        x: &[f32],
        cache: &DenseCache,
        grads: &mut ParameterSet,
    ) -> Vec<f32> {
        let mut anomalies = 0usize;
        let delta: Vec<f32> = grad_out
            .iter()
            .zip(&cache.raw)
            .map(|(&g, &raw)| {
                let (d, bad) = finite_or_zero(self.activation.derivative(raw));
                anomalies += bad as usize;
                g * d
            })
            .collect();

        if anomalies > 0 {
            warn!(
                activation = self.activation.name(),
                count = anomalies,
                "non-finite activation derivative treated as zero"
            );
        }

        let mut grad_x = vec![0.0; self.input_size];
        for (j, &d) in delta.iter().enumerate() {
            let row_start = j * self.input_size;
            let row = &self.weights[row_start..row_start + self.input_size];
            let grad_row = &mut grads.weights[row_start..row_start + self.input_size];

            for k in 0..self.input_size {
                grad_row[k] += d * x[k];
                grad_x[k] += d * row[k];
            }
            if let Some(b) = grads.bias.get_mut(j) {
                *b += d;
            }
        }

        grad_x
    }
}
