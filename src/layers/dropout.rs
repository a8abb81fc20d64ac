//! Dropout Layer
//!
//! Dropout is a regularization technique that randomly zeros out activations
//! during training to prevent overfitting. During inference, it passes values
//! through unchanged.
//!
//! This is inverted dropout: survivors are scaled by `1/(1-rate)` at training
//! time, so the expected output equals the input and inference needs no
//! rescaling.

use rand::Rng;
use rand_distr::{Bernoulli, Distribution};
use tracing::warn;

use crate::cache::DropoutCache;

#[derive(Clone, Copy, Debug)]
pub struct Dropout {
    pub rate: f32,
}

impl Dropout {
    pub fn new(rate: f32) -> Self {
        Self { rate }
    }

    /// Training forward pass
    ///
    /// Keeps each element with probability `1 - rate` and stores the realized
    /// scale-or-zero mask. A zero rate is inactive and stores no mask.
    pub fn forward_train<R: Rng + ?Sized>(&self, x: &[f32], rng: &mut R) -> (Vec<f32>, DropoutCache) {
        if self.rate == 0.0 {
            return self.forward_inference(x);
        }

        let keep = match Bernoulli::new(1.0 - self.rate as f64) {
            Ok(keep) => keep,
            Err(err) => {
                warn!(rate = self.rate, error = %err, "invalid dropout rate, passing input through");
                return self.forward_inference(x);
            }
        };

        let scale = 1.0 / (1.0 - self.rate);
        let mask: Vec<f32> = (0..x.len())
            .map(|_| if keep.sample(rng) { scale } else { 0.0 })
            .collect();
        let output = x.iter().zip(&mask).map(|(v, m)| v * m).collect();

        (output, DropoutCache { mask: Some(mask) })
    }

    /// Inference forward pass: identity, no mask.
    pub fn forward_inference(&self, x: &[f32]) -> (Vec<f32>, DropoutCache) {
        (x.to_vec(), DropoutCache { mask: None })
    }

    /// Backward pass
    ///
    /// Applies the stored mask to the upstream gradient, or passes it through
    /// when dropout was inactive.
    pub fn backward(&self, grad_out: &[f32], cache: &DropoutCache) -> Vec<f32> {
        match &cache.mask {
            Some(mask) => grad_out.iter().zip(mask).map(|(g, m)| g * m).collect(),
            None => grad_out.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_inference_is_identity() {
        let (y, cache) = Dropout::new(0.5).forward_inference(&[1.0, 2.0, 3.0]);
        assert_eq!(y, vec![1.0, 2.0, 3.0]);
        assert!(cache.mask.is_none());
    }

    #[test]
    fn test_zero_rate_is_inactive() {
        let mut rng = StdRng::seed_from_u64(1);
        let (y, cache) = Dropout::new(0.0).forward_train(&[1.0, -2.0], &mut rng);
        assert_eq!(y, vec![1.0, -2.0]);
        assert!(cache.mask.is_none());
    }

    #[test]
    fn test_mask_values_are_scale_or_zero() {
        let mut rng = StdRng::seed_from_u64(7);
        let dropout = Dropout::new(0.5);
        let (y, cache) = dropout.forward_train(&[1.0; 64], &mut rng);
        let mask = cache.mask.as_ref().unwrap();
        assert!(mask.iter().all(|&m| m == 0.0 || m == 2.0));
        assert_eq!(&y, mask);

        let grad = dropout.backward(&[3.0; 64], &cache);
        for (g, m) in grad.iter().zip(mask) {
            assert_eq!(*g, 3.0 * m);
        }
    }

    #[test]
    fn test_backward_without_mask_passes_through() {
        let grad = Dropout::new(0.3).backward(&[0.5, -0.5], &DropoutCache { mask: None });
        assert_eq!(grad, vec![0.5, -0.5]);
    }

    #[test]
    fn test_inverted_dropout_is_unbiased() {
        let mut rng = StdRng::seed_from_u64(42);
        let dropout = Dropout::new(0.3);
        let x = [2.0f32; 4];
        let trials = 10_000;

        let mut sums = [0.0f64; 4];
        for _ in 0..trials {
            let (y, _) = dropout.forward_train(&x, &mut rng);
            for (s, v) in sums.iter_mut().zip(&y) {
                *s += *v as f64;
            }
        }

        // Standard error per element is about 2·√(0.3/0.7)/√10000 ≈ 0.013.
        for s in sums {
            let mean = s / trials as f64;
            assert!((mean - 2.0).abs() < 0.06, "mean {}", mean);
        }
    }
}
