//! Loss Functions and Metrics
//!
//! The training loop asks for two things at the output of the network: the
//! scalar loss of one sample and the gradient that seeds the backward pass.
//!
//! ```text
//! squared error:        loss = ½ Σ (p - t)²                          d = p - t
//! categorical CE:       loss = -Σ t · ln(p + 1e-9)                   d = p - t
//! binary CE:            loss = -(t ln(p + 1e-9) + (1-t) ln(1-p + 1e-9))   d = p - t
//! ```
//!
//! Both cross-entropy gradients are the combined gradient of the loss and the
//! squashing function in front of it, which is why the softmax layer
//! back-propagates as a pass-through.
//!
//! The configured [`LossKind`] is resolved against the network's output head
//! once per training call. Cross-entropy without a softmax or single sigmoid
//! output falls back to squared error.

use serde::{Deserialize, Serialize};

use crate::layers::{Activation, LayerConfig, LayerKind};
use crate::math::argmax;

const LOG_EPS: f32 = 1e-9;

/// Loss requested by the caller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LossKind {
    #[default]
    Mse,
    CrossEntropy,
}

impl LossKind {
    pub fn name(self) -> &'static str {
        match self {
            LossKind::Mse => "mse",
            LossKind::CrossEntropy => "crossentropy",
        }
    }

    /// Validation metric reported for this loss.
    pub fn metric(self) -> MetricKind {
        match self {
            LossKind::Mse => MetricKind::RSquared,
            LossKind::CrossEntropy => MetricKind::Accuracy,
        }
    }
}

/// What the last layer does to its outputs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputHead {
    /// Softmax layer, or a dense layer with softmax activation.
    Softmax,
    /// Dense layer with a single sigmoid output.
    Sigmoid,
    Other,
}

impl OutputHead {
    pub fn classify(layers: &[LayerConfig]) -> Self {
        match layers.last() {
            Some(last) if last.is_softmax() => OutputHead::Softmax,
            Some(LayerConfig {
                kind:
                    LayerKind::Dense {
                        activation: Activation::Sigmoid,
                        ..
                    },
                output_size: 1,
                ..
            }) => OutputHead::Sigmoid,
            _ => OutputHead::Other,
        }
    }
}

/// Loss actually evaluated after resolving the head.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LossFunction {
    SquaredError,
    CategoricalCrossEntropy,
    BinaryCrossEntropy,
}

impl LossFunction {
    /// Pick the loss for `kind` given the output head.
    ///
    /// The flag is true when cross-entropy was requested but the head cannot
    /// support it, and squared error is used instead.
    pub fn resolve(kind: LossKind, head: OutputHead) -> (Self, bool) {
        match (kind, head) {
            (LossKind::Mse, _) => (LossFunction::SquaredError, false),
            (LossKind::CrossEntropy, OutputHead::Softmax) => {
                (LossFunction::CategoricalCrossEntropy, false)
            }
            (LossKind::CrossEntropy, OutputHead::Sigmoid) => {
                (LossFunction::BinaryCrossEntropy, false)
            }
            (LossKind::CrossEntropy, OutputHead::Other) => (LossFunction::SquaredError, true),
        }
    }

    pub fn loss(self, prediction: &[f32], target: &[f32]) -> f32 {
        let pairs = prediction.iter().zip(target);
        match self {
            LossFunction::SquaredError => pairs.map(|(p, t)| 0.5 * (p - t) * (p - t)).sum(),
            LossFunction::CategoricalCrossEntropy => {
                -pairs.map(|(p, t)| t * (p + LOG_EPS).ln()).sum::<f32>()
            }
            LossFunction::BinaryCrossEntropy => -pairs
                .map(|(p, t)| t * (p + LOG_EPS).ln() + (1.0 - t) * (1.0 - p + LOG_EPS).ln())
                .sum::<f32>(),
        }
    }

    /// Gradient of the loss at the network output.
    ///
    /// All three losses seed the backward pass with `prediction - target`.
    pub fn gradient(self, prediction: &[f32], target: &[f32]) -> Vec<f32> {
        prediction.iter().zip(target).map(|(p, t)| p - t).collect()
    }

    /// Loss and output gradient of one sample.
    pub fn evaluate(self, prediction: &[f32], target: &[f32]) -> (f32, Vec<f32>) {
        (self.loss(prediction, target), self.gradient(prediction, target))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Accuracy,
    #[serde(rename = "r2")]
    RSquared,
}

impl MetricKind {
    pub fn name(self) -> &'static str {
        match self {
            MetricKind::Accuracy => "accuracy",
            MetricKind::RSquared => "r2",
        }
    }

    pub fn compute(self, predictions: &[Vec<f32>], targets: &[Vec<f32>]) -> f32 {
        match self {
            MetricKind::Accuracy => accuracy(predictions, targets),
            MetricKind::RSquared => r_squared(predictions, targets),
        }
    }
}

/// Fraction of samples whose predicted class matches the target class.
///
/// Single-output models are thresholded at 0.5; wider outputs compare the
/// arg-max index.
pub fn accuracy(predictions: &[Vec<f32>], targets: &[Vec<f32>]) -> f32 {
    if predictions.is_empty() {
        return 0.0;
    }

    let correct = predictions
        .iter()
        .zip(targets)
        .filter(|(p, t)| {
            if p.len() == 1 {
                (p[0] >= 0.5) == (t[0] >= 0.5)
            } else {
                argmax(p) == argmax(t)
            }
        })
        .count();

    correct as f32 / predictions.len() as f32
}

/// Coefficient of determination over all output dimensions.
///
/// `1 - SS_res / SS_tot`, where `SS_tot` is taken around the per-dimension
/// target mean. Constant targets give 1 for a perfect fit and 0 otherwise.
pub fn r_squared(predictions: &[Vec<f32>], targets: &[Vec<f32>]) -> f32 {
    let Some(width) = targets.first().map(Vec::len) else {
        return 0.0;
    };
    let n = targets.len() as f32;

    let mut means = vec![0.0f32; width];
    for t in targets {
        for (m, v) in means.iter_mut().zip(t) {
            *m += v / n;
        }
    }

    let mut ss_res = 0.0f32;
    let mut ss_tot = 0.0f32;
    for (p, t) in predictions.iter().zip(targets) {
        for ((pv, tv), m) in p.iter().zip(t).zip(&means) {
            ss_res += (tv - pv) * (tv - pv);
            ss_tot += (tv - m) * (tv - m);
        }
    }

    if ss_tot == 0.0 {
        return if ss_res == 0.0 { 1.0 } else { 0.0 };
    }
    1.0 - ss_res / ss_tot
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_squared_error() {
        let (loss, grad) = LossFunction::SquaredError.evaluate(&[1.0, 2.0], &[0.0, 4.0]);
        assert!((loss - 2.5).abs() < 1e-6);
        assert_eq!(grad, vec![1.0, -2.0]);
    }

    #[test]
    fn test_categorical_cross_entropy() {
        let (loss, grad) =
            LossFunction::CategoricalCrossEntropy.evaluate(&[0.7, 0.2, 0.1], &[1.0, 0.0, 0.0]);
        assert!((loss + 0.7f32.ln()).abs() < 1e-5);
        assert!((grad[0] + 0.3).abs() < 1e-6);
        assert!((grad[1] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_binary_cross_entropy() {
        let loss = LossFunction::BinaryCrossEntropy.loss(&[0.8], &[0.0]);
        assert!((loss + 0.2f32.ln()).abs() < 1e-4);
        let zero_prob = LossFunction::BinaryCrossEntropy.loss(&[1.0], &[0.0]);
        assert!(zero_prob.is_finite());
    }

    #[test]
    fn test_head_classification() {
        let softmax = vec![LayerConfig::dense(2, 3, Activation::None), LayerConfig::softmax(3)];
        assert_eq!(OutputHead::classify(&softmax), OutputHead::Softmax);

        let dense_softmax = vec![LayerConfig::dense(2, 3, Activation::Softmax)];
        assert_eq!(OutputHead::classify(&dense_softmax), OutputHead::Softmax);

        let sigmoid = vec![LayerConfig::dense(2, 1, Activation::Sigmoid)];
        assert_eq!(OutputHead::classify(&sigmoid), OutputHead::Sigmoid);

        let wide_sigmoid = vec![LayerConfig::dense(2, 2, Activation::Sigmoid)];
        assert_eq!(OutputHead::classify(&wide_sigmoid), OutputHead::Other);
        assert_eq!(OutputHead::classify(&[]), OutputHead::Other);
    }

    #[test]
    fn test_cross_entropy_fallback() {
        assert_eq!(
            LossFunction::resolve(LossKind::CrossEntropy, OutputHead::Other),
            (LossFunction::SquaredError, true)
        );
        assert_eq!(
            LossFunction::resolve(LossKind::CrossEntropy, OutputHead::Sigmoid),
            (LossFunction::BinaryCrossEntropy, false)
        );
        assert_eq!(
            LossFunction::resolve(LossKind::Mse, OutputHead::Softmax),
            (LossFunction::SquaredError, false)
        );
    }

    #[test]
    fn test_accuracy() {
        let preds = vec![vec![0.1, 0.9], vec![0.8, 0.2], vec![0.4, 0.6]];
        let targets = vec![vec![0.0, 1.0], vec![0.0, 1.0], vec![0.0, 1.0]];
        assert!((accuracy(&preds, &targets) - 2.0 / 3.0).abs() < 1e-6);

        let binary = vec![vec![0.7], vec![0.2]];
        let binary_targets = vec![vec![1.0], vec![1.0]];
        assert!((accuracy(&binary, &binary_targets) - 0.5).abs() < 1e-6);
        assert_eq!(accuracy(&[], &[]), 0.0);
    }

    #[test]
    fn test_r_squared() {
        let targets = vec![vec![1.0], vec![2.0], vec![3.0]];
        assert!((r_squared(&targets, &targets) - 1.0).abs() < 1e-6);

        let mean_prediction = vec![vec![2.0], vec![2.0], vec![2.0]];
        assert!(r_squared(&mean_prediction, &targets).abs() < 1e-6);

        let constant = vec![vec![5.0], vec![5.0]];
        assert_eq!(r_squared(&constant, &constant), 1.0);
        assert_eq!(r_squared(&[vec![4.0], vec![5.0]], &constant), 0.0);
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(serde_json::to_string(&LossKind::CrossEntropy).unwrap(), "\"crossentropy\"");
        assert_eq!(serde_json::to_string(&MetricKind::RSquared).unwrap(), "\"r2\"");
    }
}
