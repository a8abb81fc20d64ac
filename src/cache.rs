//! Forward Cache
//!
//! Everything the backward pass needs from one sample's forward pass. A cache
//! is created at the start of a sample, filled layer by layer, consumed by the
//! backward pass of that same sample and then dropped. It is never shared
//! between samples.
//!
//! `activations[0]` is the network input (after positional encoding, if
//! enabled) and `activations[i + 1]` is the output of layer `i`.

use serde::{Deserialize, Serialize};

/// Pre-activation sums of a dense layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DenseCache {
    pub raw: Vec<f32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerNormCache {
    pub mean: f32,
    pub variance: f32,
    pub stddev: f32,
    pub normalized: Vec<f32>,
    pub input: Vec<f32>,
    pub gamma: Vec<f32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttentionCache {
    pub input: Vec<f32>,
    pub num_heads: usize,
    pub head_size: usize,
    /// One row-major `[head_size, head_size]` attention matrix per head.
    pub weights: Vec<Vec<f32>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DropoutCache {
    /// Realized `1/(1-rate)` or `0` per element. `None` when dropout was inactive.
    pub mask: Option<Vec<f32>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SoftmaxCache {
    pub output: Vec<f32>,
}

/// Per-layer entry of a [`ForwardCache`], one variant per layer kind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LayerCache {
    Dense(DenseCache),
    LayerNorm(LayerNormCache),
    Attention(AttentionCache),
    Dropout(DropoutCache),
    Softmax(SoftmaxCache),
}

impl LayerCache {
    /// Name of the layer kind that recorded this entry.
    pub fn kind_name(&self) -> &'static str {
        match self {
            LayerCache::Dense(_) => "dense",
            LayerCache::LayerNorm(_) => "layernorm",
            LayerCache::Attention(_) => "attention",
            LayerCache::Dropout(_) => "dropout",
            LayerCache::Softmax(_) => "softmax",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ForwardCache {
    pub activations: Vec<Vec<f32>>,
    pub layers: Vec<LayerCache>,
}

impl ForwardCache {
    pub fn new(input: Vec<f32>) -> Self {
        Self {
            activations: vec![input],
            layers: Vec::new(),
        }
    }

    pub(crate) fn record(&mut self, output: Vec<f32>, cache: LayerCache) {
        self.activations.push(output);
        self.layers.push(cache);
    }

    /// Network output, or the input if no layer ran.
    pub fn output(&self) -> &[f32] {
        self.activations.last().map(Vec::as_slice).unwrap_or(&[])
    }

    /// Input that reached layer `index`.
    pub fn layer_input(&self, index: usize) -> Option<&[f32]> {
        self.activations.get(index).map(Vec::as_slice)
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}
