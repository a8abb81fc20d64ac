//! Training Data
//!
//! A sample is one input vector with its target vector. A [`Dataset`] holds
//! the samples used for gradient updates and an optional validation set that
//! is only ever run forward.
//!
//! ## Splitting
//!
//! [`Dataset::split`] takes the validation set from the end of the samples:
//!
//! ```text
//! samples: [s0 s1 s2 s3 s4 s5 s6 s7 s8 s9]
//! val_fraction: 0.2
//!
//! train:      [s0 .. s7]
//! validation: [s8 s9]
//! ```
//!
//! The training loop shuffles its own copy of the training set every epoch,
//! so the order here only matters for which samples end up in validation.

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub input: Vec<f32>,
    pub output: Vec<f32>,
}

impl Sample {
    pub fn new(input: Vec<f32>, output: Vec<f32>) -> Self {
        Self { input, output }
    }

    /// True when the sample fits a model with the given input and output sizes.
    pub fn fits(&self, input_size: usize, output_size: usize) -> bool {
        self.input.len() == input_size && self.output.len() == output_size
    }
}

impl From<(Vec<f32>, Vec<f32>)> for Sample {
    fn from((input, output): (Vec<f32>, Vec<f32>)) -> Self {
        Self { input, output }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub train: Vec<Sample>,
    #[serde(default)]
    pub validation: Vec<Sample>,
}

impl Dataset {
    /// Training samples only, no validation.
    pub fn new(train: Vec<Sample>) -> Self {
        Self {
            train,
            validation: Vec::new(),
        }
    }

    pub fn with_validation(train: Vec<Sample>, validation: Vec<Sample>) -> Self {
        Self { train, validation }
    }

    /// Split samples into training and validation sets
    ///
    /// The last `val_fraction` of the samples (rounded down) become the
    /// validation set. The fraction is clamped to `[0, 1]`.
    pub fn split(mut samples: Vec<Sample>, val_fraction: f32) -> Self {
        let fraction = if val_fraction.is_finite() {
            val_fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        // f32 fractions such as 0.7 sit just below their decimal value.
        let val_len = ((samples.len() as f64) * fraction as f64 + 1e-6).floor() as usize;
        let split_idx = samples.len() - val_len.min(samples.len());
        let validation = samples.split_off(split_idx);
        Self {
            train: samples,
            validation,
        }
    }

    pub fn has_validation(&self) -> bool {
        !self.validation.is_empty()
    }
}

/// Keep the samples that fit the model, warning about the rest.
pub(crate) fn compatible_samples(
    samples: &[Sample],
    input_size: usize,
    output_size: usize,
    set: &str,
) -> Vec<Sample> {
    let kept: Vec<Sample> = samples
        .iter()
        .filter(|s| s.fits(input_size, output_size))
        .cloned()
        .collect();

    let skipped = samples.len() - kept.len();
    if skipped > 0 {
        warn!(
            set,
            skipped,
            input_size,
            output_size,
            "samples with mismatched input/output length skipped"
        );
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(n: usize) -> Vec<Sample> {
        (0..n)
            .map(|i| Sample::new(vec![i as f32], vec![0.0]))
            .collect()
    }

    #[test]
    fn test_split_takes_validation_from_end() {
        let dataset = Dataset::split(samples(10), 0.2);
        assert_eq!(dataset.train.len(), 8);
        assert_eq!(dataset.validation.len(), 2);
        assert_eq!(dataset.validation[0].input, vec![8.0]);
    }

    #[test]
    fn test_split_edge_fractions() {
        assert!(!Dataset::split(samples(5), 0.0).has_validation());
        assert!(Dataset::split(samples(5), 1.0).train.is_empty());
        assert_eq!(Dataset::split(samples(5), f32::NAN).train.len(), 5);
        assert_eq!(Dataset::split(samples(5), 7.0).validation.len(), 5);
    }

    #[test]
    fn test_compatible_samples_filters_mismatches() {
        let mixed = vec![
            Sample::new(vec![1.0, 2.0], vec![1.0]),
            Sample::new(vec![1.0], vec![1.0]),
            Sample::new(vec![1.0, 2.0], vec![1.0, 0.0]),
        ];
        let kept = compatible_samples(&mixed, 2, 1, "train");
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].input, vec![1.0, 2.0]);
    }

    #[test]
    fn test_dataset_json_without_validation() {
        let json = r#"{"train": [{"input": [0.0, 1.0], "output": [1.0]}]}"#;
        let dataset: Dataset = serde_json::from_str(json).unwrap();
        assert_eq!(dataset.train.len(), 1);
        assert!(!dataset.has_validation());
    }
}
