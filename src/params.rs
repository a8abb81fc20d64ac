//! Parameter Storage
//!
//! Every layer owns one [`ParameterSet`]. Dense layers fill `weights` (and
//! `bias` when enabled); layer normalization fills `gamma` and `beta`; the
//! remaining kinds leave all four buffers empty.
//!
//! The same structure doubles as a gradient accumulator: [`ParameterStore::zeros_like`]
//! produces a store with identical buffer lengths filled with zeros, so the
//! backward pass can write `grads.sets[i].weights[k] += ...` without any
//! shape bookkeeping.
//!
//! ## Initialization
//!
//! Weights come from a small seeded LCG so that a model seed fully determines
//! the initial parameters:
//!
//! ```text
//! Glorot: uniform(-√(6/(in+out)), √(6/(in+out)))
//! He:     uniform(-√(6/in), √(6/in))
//! ```
//!
//! Layer `i` is seeded with `seed + 10000 * (i + 1)`. Biases and beta start at
//! zero, gamma at one.

use serde::{Deserialize, Serialize};

use crate::layers::{LayerConfig, LayerKind, WeightInit};

/// Uniform values in `[-scale, scale)` from a linear congruential generator.
///
/// Reproducible across platforms, which matters more here than statistical
/// quality: a model rebuilt from the same seed gets the same weights.
pub fn random_init(size: usize, seed: u64, scale: f32) -> Vec<f32> {
    let mut rng = seed;
    (0..size)
        .map(|_| {
            rng = rng.wrapping_mul(1103515245).wrapping_add(12345);
            let val = ((rng / 65536) % 32768) as f32 / 32768.0;
            (val - 0.5) * 2.0 * scale
        })
        .collect()
}

/// Which buffer of a [`ParameterSet`] a value belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ParamGroup {
    Weights,
    Bias,
    Gamma,
    Beta,
}

impl ParamGroup {
    pub const ALL: [ParamGroup; 4] = [
        ParamGroup::Weights,
        ParamGroup::Bias,
        ParamGroup::Gamma,
        ParamGroup::Beta,
    ];
}

/// Learnable buffers of one layer.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    /// Dense weights, row-major `[output_size, input_size]`.
    pub weights: Vec<f32>,
    pub bias: Vec<f32>,
    pub gamma: Vec<f32>,
    pub beta: Vec<f32>,
}

impl ParameterSet {
    /// Allocate and initialize the parameters for `config`, the `index`-th layer.
    pub fn for_layer(config: &LayerConfig, index: usize, seed: u64) -> Self {
        match &config.kind {
            LayerKind::Dense {
                use_bias,
                weight_init,
                ..
            } => {
                let fan_in = config.input_size as f32;
                let fan_out = config.output_size as f32;
                let limit = match weight_init {
                    WeightInit::Glorot => (6.0 / (fan_in + fan_out)).sqrt(),
                    WeightInit::He => (6.0 / fan_in).sqrt(),
                };
                let layer_seed = seed.wrapping_add(10000 * (index as u64 + 1));
                Self {
                    weights: random_init(config.input_size * config.output_size, layer_seed, limit),
                    bias: if *use_bias {
                        vec![0.0; config.output_size]
                    } else {
                        Vec::new()
                    },
                    ..Self::default()
                }
            }
            LayerKind::LayerNorm => Self {
                gamma: vec![1.0; config.input_size],
                beta: vec![0.0; config.input_size],
                ..Self::default()
            },
            LayerKind::Attention { .. } | LayerKind::Dropout { .. } | LayerKind::Softmax => {
                Self::default()
            }
        }
    }

    /// Gradient accumulator for this layer
    ///
    /// # Returns
    ///
    /// A set with every buffer the same length as `self` and filled with
    /// zeros. Empty groups stay empty.
    pub fn zeros_like(&self) -> Self {
        Self {
            weights: vec![0.0; self.weights.len()],
            bias: vec![0.0; self.bias.len()],
            gamma: vec![0.0; self.gamma.len()],
            beta: vec![0.0; self.beta.len()],
        }
    }

    pub fn group(&self, group: ParamGroup) -> &[f32] {
        match group {
            ParamGroup::Weights => &self.weights,
            ParamGroup::Bias => &self.bias,
            ParamGroup::Gamma => &self.gamma,
            ParamGroup::Beta => &self.beta,
        }
    }

    pub fn group_mut(&mut self, group: ParamGroup) -> &mut Vec<f32> {
        match group {
            ParamGroup::Weights => &mut self.weights,
            ParamGroup::Bias => &mut self.bias,
            ParamGroup::Gamma => &mut self.gamma,
            ParamGroup::Beta => &mut self.beta,
        }
    }

    pub fn len(&self) -> usize {
        self.weights.len() + self.bias.len() + self.gamma.len() + self.beta.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Set every buffer to zero, keeping lengths.
    pub fn fill_zero(&mut self) {
        for group in ParamGroup::ALL {
            self.group_mut(group).iter_mut().for_each(|v| *v = 0.0);
        }
    }
}

/// Parameters of a whole model, one [`ParameterSet`] per layer in order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterStore {
    pub sets: Vec<ParameterSet>,
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initialize fresh parameters for every layer of `layers`.
    pub fn initialize(layers: &[LayerConfig], seed: u64) -> Self {
        Self {
            sets: layers
                .iter()
                .enumerate()
                .map(|(i, config)| ParameterSet::for_layer(config, i, seed))
                .collect(),
        }
    }

    pub fn push(&mut self, set: ParameterSet) {
        self.sets.push(set);
    }

    /// Zeroed copy of the whole store, one accumulator per layer.
    pub fn zeros_like(&self) -> Self {
        Self {
            sets: self.sets.iter().map(ParameterSet::zeros_like).collect(),
        }
    }

    pub fn fill_zero(&mut self) {
        self.sets.iter_mut().for_each(ParameterSet::fill_zero);
    }

    /// Total number of learnable scalars.
    pub fn total_count(&self) -> usize {
        self.sets.iter().map(ParameterSet::len).sum()
    }

    /// Buffer lengths per layer and group, used to detect topology changes.
    pub fn signature(&self) -> Vec<[usize; 4]> {
        self.sets
            .iter()
            .map(|s| [s.weights.len(), s.bias.len(), s.gamma.len(), s.beta.len()])
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{Activation, LayerConfig};

    #[test]
    fn test_random_init_is_reproducible_and_bounded() {
        let a = random_init(64, 7, 0.5);
        let b = random_init(64, 7, 0.5);
        assert_eq!(a, b);
        assert!(a.iter().all(|v| (-0.5..0.5).contains(v)));
        assert_ne!(a, random_init(64, 8, 0.5));
    }

    #[test]
    fn test_dense_allocation() {
        let config = LayerConfig::dense(3, 2, Activation::Tanh);
        let set = ParameterSet::for_layer(&config, 0, 1);
        assert_eq!(set.weights.len(), 6);
        assert_eq!(set.bias, vec![0.0, 0.0]);
        assert!(set.gamma.is_empty() && set.beta.is_empty());

        let limit = (6.0f32 / 5.0).sqrt();
        assert!(set.weights.iter().all(|w| w.abs() <= limit));
    }

    #[test]
    fn test_dense_without_bias() {
        let config = LayerConfig::dense(3, 2, Activation::Relu).without_bias();
        let set = ParameterSet::for_layer(&config, 0, 1);
        assert!(set.bias.is_empty());
        assert_eq!(set.len(), 6);
    }

    #[test]
    fn test_layer_norm_allocation() {
        let set = ParameterSet::for_layer(&LayerConfig::layer_norm(4), 2, 1);
        assert_eq!(set.gamma, vec![1.0; 4]);
        assert_eq!(set.beta, vec![0.0; 4]);
        assert!(set.weights.is_empty());
    }

    #[test]
    fn test_parameterless_layers() {
        for config in [
            LayerConfig::attention(4, 2),
            LayerConfig::dropout(4, 0.2),
            LayerConfig::softmax(4),
        ] {
            assert!(ParameterSet::for_layer(&config, 0, 1).is_empty());
        }
    }

    #[test]
    fn test_store_counts_and_zeros() {
        let layers = vec![
            LayerConfig::dense(2, 4, Activation::Relu),
            LayerConfig::layer_norm(4),
            LayerConfig::dense(4, 1, Activation::None),
        ];
        let store = ParameterStore::initialize(&layers, 3);
        assert_eq!(store.total_count(), (8 + 4) + (4 + 4) + (4 + 1));

        let zeros = store.zeros_like();
        assert_eq!(zeros.signature(), store.signature());
        assert!(zeros.sets.iter().all(|s| s.weights.iter().all(|&w| w == 0.0)));
    }
}
