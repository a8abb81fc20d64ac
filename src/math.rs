//! Small numeric helpers shared by the layer kernels.
//!
//! Vectors are plain `&[f32]` slices. Matrices are flat row-major buffers; a
//! dense weight matrix of shape `[outputs, inputs]` stores unit `j`'s weights at
//! `j * inputs .. (j + 1) * inputs`.

/// Added to every softmax denominator.
pub const SOFTMAX_EPS: f32 = 1e-9;

/// Numerically stabilised softmax: `exp(x - max) / (Σ exp(x - max) + 1e-9)`.
pub fn softmax(x: &[f32]) -> Vec<f32> {
    if x.is_empty() {
        return Vec::new();
    }
    let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = x.iter().map(|&v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum::<f32>() + SOFTMAX_EPS;
    exps.into_iter().map(|e| e / sum).collect()
}

/// Dot product of two slices
///
/// # Arguments
///
/// * `a`, `b` - Vectors of equal length; extra elements of the longer one
///   are ignored
///
/// # Returns
///
/// Σ aᵢ·bᵢ
///
/// # Example
///
/// ```
/// # use layerwise::math::dot;
/// assert_eq!(dot(&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]), 32.0);
/// ```
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Index of the largest element. Ties resolve to the first index; an empty
/// slice yields 0.
pub fn argmax(x: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in x.iter().enumerate() {
        if v > x[best] {
            best = i;
        }
    }
    best
}

/// Replace a non-finite term by zero.
///
/// Returns the value and whether it had to be replaced, so callers can count
/// anomalies and warn once per kernel call instead of once per element.
#[inline]
pub fn finite_or_zero(value: f32) -> (f32, bool) {
    if value.is_finite() {
        (value, false)
    } else {
        (0.0, true)
    }
}

/// Sinusoidal encoding for feature position `i` of an `n`-wide input.
pub fn positional_encoding(i: usize, n: usize) -> f32 {
    let pair = (2 * (i / 2)) as f32;
    let angle = i as f32 / 10000f32.powf(pair / n.max(1) as f32);
    if i % 2 == 0 {
        angle.sin()
    } else {
        angle.cos()
    }
}
