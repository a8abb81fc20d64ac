//! Softmax Layer
//!
//! Turns a score vector into a probability distribution:
//!
//! ```text
//! y[i] = exp(x[i] - max) / (Σ exp(x[j] - max) + 1e-9)
//! ```
//!
//! The backward pass is a pass-through. Softmax followed by categorical
//! cross-entropy has the combined gradient `prediction - target`, which the
//! loss already computes, so this layer must not apply its own Jacobian.
//! Anywhere else (mid-network, or with squared error) the resulting gradient
//! is not the true one; the training loop warns about such topologies.

use crate::cache::SoftmaxCache;
use crate::math::softmax;

#[derive(Clone, Copy, Debug, Default)]
pub struct Softmax;

impl Softmax {
    pub fn forward(&self, x: &[f32]) -> (Vec<f32>, SoftmaxCache) {
        let output = softmax(x);
        let cache = SoftmaxCache {
            output: output.clone(),
        };
        (output, cache)
    }

    pub fn backward(&self, grad_out: &[f32]) -> Vec<f32> {
        grad_out.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_is_distribution() {
        let (y, cache) = Softmax.forward(&[1.0, 2.0, 3.0]);
        assert!((y.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(y[2] > y[1] && y[1] > y[0]);
        assert_eq!(cache.output, y);
    }

    #[test]
    fn test_large_scores_stay_finite() {
        let (y, _) = Softmax.forward(&[1000.0, 999.0, -1000.0]);
        assert!(y.iter().all(|v| v.is_finite()));
        assert!(y[2] < 1e-6);
    }

    #[test]
    fn test_backward_passes_gradient_through() {
        assert_eq!(Softmax.backward(&[0.2, -0.1, -0.1]), vec![0.2, -0.1, -0.1]);
    }
}
