//! Gradient Utilities
//!
//! Batch gradients live in a [`ParameterStore`] with the same layout as the
//! model parameters. The backward pass accumulates per-sample gradients into
//! it; before the optimizer runs, the accumulator is turned into a mean and
//! optionally clamped.
//!
//! ## Algorithm
//!
//! ```text
//! grad = accumulated / batch_len           // mean over the samples in the batch
//! grad = clamp(grad, -clip, clip)          // only when clip > 0
//! norm = √(Σ grad²)                        // monitoring
//! ```
//!
//! Clamping is per element, so unlike norm clipping it can change the
//! direction of the update. The norm is reported with every epoch and is not
//! used to rescale anything.

use rayon::prelude::*;

use crate::params::{ParamGroup, ParameterStore};

/// Buffers above this size are processed with rayon.
pub(crate) const PARALLEL_THRESHOLD: usize = 1000;

fn for_each_value(grads: &mut ParameterStore, f: impl Fn(&mut f32) + Sync + Send) {
    for set in &mut grads.sets {
        for group in ParamGroup::ALL {
            let data = set.group_mut(group);
            if data.len() > PARALLEL_THRESHOLD {
                data.par_iter_mut().for_each(&f);
            } else {
                data.iter_mut().for_each(&f);
            }
        }
    }
}

/// Turn a batch accumulator into the mean gradient and clamp it.
///
/// `batch_len` is the number of samples actually accumulated, which is
/// smaller than the configured batch size for the last batch of an epoch.
/// A `clip_value` of zero disables clamping.
pub fn average_and_clamp(grads: &mut ParameterStore, batch_len: usize, clip_value: f32) {
    if batch_len == 0 {
        return;
    }
    let scale = 1.0 / batch_len as f32;

    if clip_value > 0.0 {
        for_each_value(grads, |g| *g = (*g * scale).clamp(-clip_value, clip_value));
    } else {
        for_each_value(grads, |g| *g *= scale);
    }
}

/// Compute the L2 norm of all gradients
///
/// √(Σ g²) over every buffer of every layer. Non-finite values are skipped.
///
/// # Arguments
///
/// * `grads` - Mean batch gradient, one set per layer
///
/// # Returns
///
/// The L2 norm, reported per epoch in [`EpochStats`](crate::EpochStats).
pub fn compute_grad_norm(grads: &ParameterStore) -> f32 {
    let sum_sq = |data: &[f32]| -> f32 {
        let square = |&v: &f32| if v.is_finite() { v * v } else { 0.0 };
        if data.len() > PARALLEL_THRESHOLD {
            data.par_iter().map(square).sum()
        } else {
            data.iter().map(square).sum()
        }
    };

    grads
        .sets
        .iter()
        .flat_map(|set| ParamGroup::ALL.into_iter().map(move |g| sum_sq(set.group(g))))
        .sum::<f32>()
        .sqrt()
}
