//! Self-Attention Mechanism
//!
//! Multi-head self-attention over the elements of one activation vector. The
//! input of size `N` is cut into `num_heads` contiguous slices of
//! `head_size = N / num_heads`, and every element of a slice is one token.
//!
//! There are no learned projections: each token is its own query, key and
//! value.
//!
//! ## Scaled Dot-Product Attention
//!
//! ```text
//! scores[i][j] = q[i] · k[j] / √head_size
//! attn[i]      = softmax(scores[i])
//! out[i]       = Σ_j attn[i][j] · v[j]
//! ```
//!
//! The row softmax subtracts the row maximum and adds `1e-9` to the
//! denominator.
//!
//! ## Backward Pass
//!
//! ```text
//! grad_v[j]     += Σ_i attn[i][j] · grad_out[i]
//! grad_attn[i][j] = grad_out[i] · v[j]
//! row_sum[i]      = Σ_k grad_attn[i][k] · attn[i][k]
//! grad_score[i][j] = attn[i][j] · (grad_attn[i][j] - row_sum[i]) / √head_size
//! grad_q[i]     += Σ_j grad_score[i][j] · k[j]
//! grad_k[j]     += Σ_i grad_score[i][j] · q[i]
//! ```
//!
//! Query, key and value all alias the same input slice, so the input gradient
//! is `grad_q + grad_k + grad_v`. Non-finite terms contribute zero.

use tracing::warn;

use crate::cache::AttentionCache;
use crate::math::{finite_or_zero, SOFTMAX_EPS};

/// Parameter-free multi-head self-attention.
#[derive(Clone, Copy, Debug)]
pub struct Attention {
    pub num_heads: usize,
}

impl Attention {
    pub fn new(num_heads: usize) -> Self {
        Self { num_heads }
    }

    /// Forward pass
    ///
    /// `x.len()` must be a multiple of `num_heads`; layer validation
    /// guarantees this.
    pub fn forward(&self, x: &[f32]) -> (Vec<f32>, AttentionCache) {
        let head_size = x.len() / self.num_heads;
        let scale = (head_size as f32).sqrt();
        let mut output = vec![0.0; x.len()];
        let mut weights = Vec::with_capacity(self.num_heads);

        for h in 0..self.num_heads {
            let start = h * head_size;
            let slice = &x[start..start + head_size];
            let mut attn = vec![0.0; head_size * head_size];

            for i in 0..head_size {
                let row = &mut attn[i * head_size..(i + 1) * head_size];
                for (j, score) in row.iter_mut().enumerate() {
                    *score = slice[i] * slice[j] / scale;
                }

                // Row softmax with max subtraction
                let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let mut sum = 0.0;
                for score in row.iter_mut() {
                    *score = (*score - max).exp();
                    sum += *score;
                }
                let denom = sum + SOFTMAX_EPS;
                for score in row.iter_mut() {
                    *score /= denom;
                }

                output[start + i] = row.iter().zip(slice).map(|(a, v)| a * v).sum();
            }

            weights.push(attn);
        }

        let cache = AttentionCache {
            input: x.to_vec(),
            num_heads: self.num_heads,
            head_size,
            weights,
        };

        (output, cache)
    }

    /// Backward pass
    ///
    /// Returns the gradient with respect to the input. Attention owns no
    /// parameters, so nothing is accumulated.
    pub fn backward(&self, grad_out: &[f32], cache: &AttentionCache) -> Vec<f32> {
        let head_size = cache.head_size;
        let scale = (head_size as f32).sqrt();
        let mut grad_x = vec![0.0; cache.input.len()];
        let mut anomalies = 0usize;
        let mut finite = |value: f32| {
            let (v, bad) = finite_or_zero(value);
            anomalies += bad as usize;
            v
        };

        for (h, attn) in cache.weights.iter().enumerate() {
            let start = h * head_size;
            let x = &cache.input[start..start + head_size];
            let dy = &grad_out[start..start + head_size];
            let mut grad_q = vec![0.0; head_size];
            let mut grad_k = vec![0.0; head_size];
            let mut grad_v = vec![0.0; head_size];

            for i in 0..head_size {
                let row = &attn[i * head_size..(i + 1) * head_size];

                // Backprop through the weighted sum of values
                for j in 0..head_size {
                    grad_v[j] += finite(row[j] * dy[i]);
                }

                // Backprop through the row softmax
                let row_sum: f32 = (0..head_size)
                    .map(|k| finite(dy[i] * x[k] * row[k]))
                    .sum();

                for j in 0..head_size {
                    let grad_attn = dy[i] * x[j];
                    let grad_score = finite(row[j] * (grad_attn - row_sum) / scale);
                    grad_q[i] += finite(grad_score * x[j]);
                    grad_k[j] += finite(grad_score * x[i]);
                }
            }

            for i in 0..head_size {
                grad_x[start + i] = grad_q[i] + grad_k[i] + grad_v[i];
            }
        }

        if anomalies > 0 {
            warn!(count = anomalies, "non-finite attention gradient terms treated as zero");
        }

        grad_x
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn loss(attention: &Attention, x: &[f32], w: &[f32]) -> f32 {
        let (y, _) = attention.forward(x);
        y.iter().zip(w).map(|(a, b)| a * b).sum()
    }

    #[test]
    fn test_single_token_heads_are_identity() {
        let attention = Attention::new(3);
        let (y, cache) = attention.forward(&[0.5, -1.0, 2.0]);
        for (a, b) in y.iter().zip([0.5, -1.0, 2.0]) {
            assert!((a - b).abs() < 1e-6);
        }
        assert_eq!(cache.head_size, 1);
        assert_eq!(cache.weights.len(), 3);
    }

    #[test]
    fn test_uniform_input_averages() {
        let attention = Attention::new(1);
        let (y, cache) = attention.forward(&[1.0, 1.0, 1.0, 1.0]);
        assert!(y.iter().all(|v| (v - 1.0).abs() < 1e-6));
        assert!(cache.weights[0].iter().all(|a| (a - 0.25).abs() < 1e-6));
    }

    #[test]
    fn test_gradients_match_finite_differences() {
        let attention = Attention::new(2);
        let x = [0.6f32, -0.4, 1.1, 0.2, -0.9, 0.3];
        let w = [0.5f32, -0.3, 0.8, -0.6, 0.2, 0.9];

        let (_, cache) = attention.forward(&x);
        let grad_x = attention.backward(&w, &cache);

        let eps = 1e-2;
        for k in 0..x.len() {
            let mut plus = x;
            plus[k] += eps;
            let mut minus = x;
            minus[k] -= eps;
            let numeric = (loss(&attention, &plus, &w) - loss(&attention, &minus, &w)) / (2.0 * eps);
            assert!(
                (numeric - grad_x[k]).abs() < 1e-3,
                "input {}: numeric {} vs analytic {}",
                k,
                numeric,
                grad_x[k]
            );
        }
    }

    #[test]
    fn test_heads_are_independent() {
        let attention = Attention::new(2);
        let (_, cache) = attention.forward(&[0.3, 0.7, -0.2, 0.4]);
        // Gradient only on the first head leaves the second head untouched.
        let grad_x = attention.backward(&[1.0, 1.0, 0.0, 0.0], &cache);
        assert_eq!(grad_x[2], 0.0);
        assert_eq!(grad_x[3], 0.0);
    }

    #[test]
    fn test_non_finite_upstream_is_contained() {
        let attention = Attention::new(1);
        let (_, cache) = attention.forward(&[0.1, 0.2]);
        let grad_x = attention.backward(&[f32::INFINITY, 1.0], &cache);
        assert!(grad_x.iter().all(|g| g.is_finite()));
    }

    proptest! {
        #[test]
        fn prop_attention_rows_sum_to_one(
            heads in 1usize..4,
            head_size in 1usize..6,
            seed in prop::collection::vec(-10.0f32..10.0, 24)
        ) {
            let x = &seed[..heads * head_size];
            let (_, cache) = Attention::new(heads).forward(x);
            for attn in &cache.weights {
                for row in attn.chunks(head_size) {
                    let sum: f32 = row.iter().sum();
                    prop_assert!((sum - 1.0).abs() < 1e-5);
                }
            }
        }
    }
}
