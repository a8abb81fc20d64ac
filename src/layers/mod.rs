//! Neural Network Layers
//!
//! This module contains the layer configurations and the forward/backward
//! kernels for every layer kind the engine supports.
//!
//! ## Layers
//!
//! - **activation**: Scalar activation functions and their derivatives
//! - **dense**: Fully connected layer with a per-unit activation
//! - **layer_norm**: Layer normalization with learnable scale and shift
//! - **attention**: Multi-head self-attention without learned projections
//! - **dropout**: Inverted dropout
//! - **softmax**: Output softmax (paired with cross-entropy loss)
//!
//! ## Design Pattern
//!
//! Each kernel borrows its parameters and follows the same shape:
//!
//! ```rust,ignore
//! impl Kernel<'_> {
//!     pub fn forward(&self, x: &[f32]) -> (Vec<f32>, Cache) { }
//!     pub fn backward(&self, grad_out: &[f32], cache: &Cache, grads: &mut ParameterSet) -> Vec<f32> { }
//! }
//! ```
//!
//! `backward` accumulates parameter gradients into `grads` (a batch
//! accumulator) and returns the gradient with respect to the layer input.
//!
//! [`forward_layer`] and [`backward_layer`] dispatch on [`LayerKind`] with a
//! single exhaustive `match`, so adding a kind without kernels fails to compile.

pub mod activation;
pub mod attention;
pub mod dense;
pub mod dropout;
pub mod layer_norm;
pub mod softmax;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::LayerCache;
use crate::error::{EngineError, Result};
use crate::params::ParameterSet;

pub use activation::Activation;
pub use attention::Attention;
pub use dense::Dense;
pub use dropout::Dropout;
pub use layer_norm::{LayerNorm, LAYER_NORM_EPS};
pub use softmax::Softmax;

/// Weight initialization scheme for dense layers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightInit {
    Glorot,
    He,
}

impl WeightInit {
    /// He for the rectifier family, Glorot for everything else.
    pub fn default_for(activation: Activation) -> Self {
        match activation {
            Activation::Relu | Activation::LeakyRelu => WeightInit::He,
            _ => WeightInit::Glorot,
        }
    }
}

/// Kind-specific part of a [`LayerConfig`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LayerKind {
    Dense {
        activation: Activation,
        use_bias: bool,
        weight_init: WeightInit,
    },
    LayerNorm,
    Attention {
        num_heads: usize,
    },
    Dropout {
        rate: f32,
    },
    Softmax,
}

impl LayerKind {
    pub fn name(&self) -> &'static str {
        match self {
            LayerKind::Dense { .. } => "dense",
            LayerKind::LayerNorm => "layernorm",
            LayerKind::Attention { .. } => "attention",
            LayerKind::Dropout { .. } => "dropout",
            LayerKind::Softmax => "softmax",
        }
    }
}

/// One layer of a model. Immutable once added.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerConfig {
    #[serde(flatten)]
    pub kind: LayerKind,
    pub input_size: usize,
    pub output_size: usize,
}

impl LayerConfig {
    /// Dense layer with bias and the default initialization for `activation`.
    pub fn dense(input_size: usize, output_size: usize, activation: Activation) -> Self {
        Self {
            kind: LayerKind::Dense {
                activation,
                use_bias: true,
                weight_init: WeightInit::default_for(activation),
            },
            input_size,
            output_size,
        }
    }

    pub fn layer_norm(size: usize) -> Self {
        Self {
            kind: LayerKind::LayerNorm,
            input_size: size,
            output_size: size,
        }
    }

    pub fn attention(size: usize, num_heads: usize) -> Self {
        Self {
            kind: LayerKind::Attention { num_heads },
            input_size: size,
            output_size: size,
        }
    }

    pub fn dropout(size: usize, rate: f32) -> Self {
        Self {
            kind: LayerKind::Dropout { rate },
            input_size: size,
            output_size: size,
        }
    }

    pub fn softmax(size: usize) -> Self {
        Self {
            kind: LayerKind::Softmax,
            input_size: size,
            output_size: size,
        }
    }

    /// Disable the bias of a dense layer. No effect on other kinds.
    pub fn without_bias(mut self) -> Self {
        if let LayerKind::Dense { use_bias, .. } = &mut self.kind {
            *use_bias = false;
        }
        self
    }

    /// Override the weight initialization of a dense layer.
    pub fn with_init(mut self, init: WeightInit) -> Self {
        if let LayerKind::Dense { weight_init, .. } = &mut self.kind {
            *weight_init = init;
        }
        self
    }

    /// Check the layer on its own and against the size feeding into it.
    ///
    /// Non-dense kinds have their output size forced to their input size, so
    /// a config built by hand with a stale `output_size` is corrected rather
    /// than rejected.
    pub fn validate(&mut self, expected_input: usize) -> Result<()> {
        if self.input_size != expected_input {
            return Err(EngineError::config(format!(
                "{} layer expects input size {} but the previous layer produces {}",
                self.kind.name(),
                self.input_size,
                expected_input
            )));
        }
        if self.input_size == 0 {
            return Err(EngineError::config(format!(
                "{} layer has zero input size",
                self.kind.name()
            )));
        }

        match &self.kind {
            LayerKind::Dense { .. } => {
                if self.output_size == 0 {
                    return Err(EngineError::config(
                        "dense layer requires an output size greater than zero",
                    ));
                }
            }
            LayerKind::Attention { num_heads } => {
                if *num_heads == 0 || self.input_size % num_heads != 0 {
                    return Err(EngineError::config(format!(
                        "attention input size {} is not divisible by {} heads",
                        self.input_size, num_heads
                    )));
                }
            }
            LayerKind::Dropout { rate } => {
                if !rate.is_finite() || !(0.0..1.0).contains(rate) {
                    return Err(EngineError::config(format!(
                        "dropout rate must be in [0, 1), got {}",
                        rate
                    )));
                }
            }
            LayerKind::LayerNorm | LayerKind::Softmax => {}
        }

        if !matches!(self.kind, LayerKind::Dense { .. }) {
            self.output_size = self.input_size;
        }
        Ok(())
    }

    /// True when this layer turns its outputs into a probability distribution.
    pub fn is_softmax(&self) -> bool {
        match &self.kind {
            LayerKind::Softmax => true,
            LayerKind::Dense { activation, .. } => *activation == Activation::Softmax,
            _ => false,
        }
    }
}

/// Run layer `index` forward.
///
/// `rng` is `Some` only while training; it drives dropout masks.
pub fn forward_layer<R: Rng>(
    index: usize,
    config: &LayerConfig,
    params: &ParameterSet,
    input: &[f32],
    rng: Option<&mut R>,
) -> Result<(Vec<f32>, LayerCache)> {
    if input.len() != config.input_size {
        return Err(EngineError::Shape {
            layer: index,
            expected: config.input_size,
            actual: input.len(),
        });
    }

    let (output, cache) = match &config.kind {
        LayerKind::Dense { activation, .. } => {
            let (out, cache) = Dense::new(config, params, *activation).forward(input);
            (out, LayerCache::Dense(cache))
        }
        LayerKind::LayerNorm => {
            let (out, cache) = LayerNorm::new(params).forward(input);
            (out, LayerCache::LayerNorm(cache))
        }
        LayerKind::Attention { num_heads } => {
            let (out, cache) = Attention::new(*num_heads).forward(input);
            (out, LayerCache::Attention(cache))
        }
        LayerKind::Dropout { rate } => {
            let dropout = Dropout::new(*rate);
            let (out, cache) = match rng {
                Some(rng) => dropout.forward_train(input, rng),
                None => dropout.forward_inference(input),
            };
            (out, LayerCache::Dropout(cache))
        }
        LayerKind::Softmax => {
            let (out, cache) = Softmax.forward(input);
            (out, LayerCache::Softmax(cache))
        }
    };

    if output.len() != config.output_size {
        return Err(EngineError::Shape {
            layer: index,
            expected: config.output_size,
            actual: output.len(),
        });
    }
    Ok((output, cache))
}

/// Run layer `index` backward, accumulating into `grads`.
///
/// `input` is the activation that entered the layer during the forward pass.
pub fn backward_layer(
    index: usize,
    config: &LayerConfig,
    params: &ParameterSet,
    input: &[f32],
    cache: &LayerCache,
    grad_out: &[f32],
    grads: &mut ParameterSet,
) -> Result<Vec<f32>> {
    if grad_out.len() != config.output_size {
        return Err(EngineError::Shape {
            layer: index,
            expected: config.output_size,
            actual: grad_out.len(),
        });
    }
    if input.len() != config.input_size {
        return Err(EngineError::Shape {
            layer: index,
            expected: config.input_size,
            actual: input.len(),
        });
    }

    let grad_in = match (&config.kind, cache) {
        (LayerKind::Dense { activation, .. }, LayerCache::Dense(cache)) => {
            Dense::new(config, params, *activation).backward(grad_out, input, cache, grads)
        }
        (LayerKind::LayerNorm, LayerCache::LayerNorm(cache)) => {
            LayerNorm::new(params).backward(grad_out, cache, grads)
        }
        (LayerKind::Attention { num_heads }, LayerCache::Attention(cache)) => {
            Attention::new(*num_heads).backward(grad_out, cache)
        }
        (LayerKind::Dropout { rate }, LayerCache::Dropout(cache)) => {
            Dropout::new(*rate).backward(grad_out, cache)
        }
        (LayerKind::Softmax, LayerCache::Softmax(_)) => Softmax.backward(grad_out),
        (kind, cache) => {
            debug!(
                layer = index,
                kind = kind.name(),
                cache = cache.kind_name(),
                "forward cache entry recorded by a different layer kind"
            );
            // Nothing in the entry is usable, so it counts as zero values.
            return Err(EngineError::Shape {
                layer: index,
                expected: config.output_size,
                actual: 0,
            });
        }
    };
    Ok(grad_in)
}
