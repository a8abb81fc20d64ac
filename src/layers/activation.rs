//! Activation Functions
//!
//! Scalar activation functions and their derivatives. Every derivative is
//! evaluated at the **pre-activation** value `x`, which is what the dense
//! layer caches during the forward pass.
//!
//! ## GELU
//!
//! We use the tanh approximation:
//!
//! ```text
//! GELU(x) ≈ 0.5 × x × (1 + tanh(√(2/π) × (x + 0.044715 × x³)))
//! ```
//!
//! and differentiate that same approximation, so forward and backward agree.
//!
//! ## Softmax and None
//!
//! Both are the identity here with derivative 1. Softmax couples all outputs of
//! a layer, so it is applied at layer level (see [`super::softmax`]) and its
//! gradient is folded into the cross-entropy loss.

use serde::{Deserialize, Serialize};

const SELU_SCALE: f32 = 1.0507;
const SELU_ALPHA: f32 = 1.67326;
const LEAKY_SLOPE: f32 = 0.01;

/// Activation applied by a dense layer to each of its outputs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Tanh,
    Sigmoid,
    Relu,
    LeakyRelu,
    Gelu,
    Selu,
    Swish,
    Mish,
    Softmax,
    #[default]
    None,
}

impl Activation {
    pub fn apply(self, x: f32) -> f32 {
        apply(x, self)
    }

    pub fn derivative(self, x: f32) -> f32 {
        derivative(x, self)
    }

    pub fn name(self) -> &'static str {
        match self {
            Activation::Tanh => "tanh",
            Activation::Sigmoid => "sigmoid",
            Activation::Relu => "relu",
            Activation::LeakyRelu => "leakyrelu",
            Activation::Gelu => "gelu",
            Activation::Selu => "selu",
            Activation::Swish => "swish",
            Activation::Mish => "mish",
            Activation::Softmax => "softmax",
            Activation::None => "none",
        }
    }
}

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// ln(1 + eˣ), switching to the asymptote for large |x| so it never overflows.
fn softplus(x: f32) -> f32 {
    if x > 20.0 {
        x
    } else if x < -20.0 {
        x.exp()
    } else {
        x.exp().ln_1p()
    }
}

fn gelu(x: f32) -> f32 {
    let sqrt_2_pi = (2.0 / std::f32::consts::PI).sqrt();
    0.5 * x * (1.0 + (sqrt_2_pi * (x + 0.044715 * x.powi(3))).tanh())
}

fn gelu_prime(x: f32) -> f32 {
    let sqrt_2_pi = (2.0 / std::f32::consts::PI).sqrt();
    let inner = sqrt_2_pi * (x + 0.044715 * x.powi(3));
    let tanh_inner = inner.tanh();
    let sech_sq = 1.0 - tanh_inner * tanh_inner;

    0.5 * (1.0 + tanh_inner) + 0.5 * x * sech_sq * sqrt_2_pi * (1.0 + 3.0 * 0.044715 * x.powi(2))
}

/// Apply `kind` to a single pre-activation value.
pub fn apply(x: f32, kind: Activation) -> f32 {
    match kind {
        Activation::Tanh => x.tanh(),
        Activation::Sigmoid => sigmoid(x),
        Activation::Relu => x.max(0.0),
        Activation::LeakyRelu => {
            if x > 0.0 {
                x
            } else {
                LEAKY_SLOPE * x
            }
        }
        Activation::Gelu => gelu(x),
        Activation::Selu => {
            if x > 0.0 {
                SELU_SCALE * x
            } else {
                SELU_SCALE * SELU_ALPHA * (x.exp() - 1.0)
            }
        }
        Activation::Swish => x * sigmoid(x),
        Activation::Mish => x * softplus(x).tanh(),
        Activation::Softmax | Activation::None => x,
    }
}

/// Derivative of `kind` at the pre-activation value `x`.
pub fn derivative(x: f32, kind: Activation) -> f32 {
    match kind {
        Activation::Tanh => {
            let t = x.tanh();
            1.0 - t * t
        }
        Activation::Sigmoid => {
            let s = sigmoid(x);
            s * (1.0 - s)
        }
        Activation::Relu => {
            if x > 0.0 {
                1.0
            } else {
                0.0
            }
        }
        Activation::LeakyRelu => {
            if x > 0.0 {
                1.0
            } else {
                LEAKY_SLOPE
            }
        }
        Activation::Gelu => gelu_prime(x),
        Activation::Selu => {
            if x > 0.0 {
                SELU_SCALE
            } else {
                SELU_SCALE * SELU_ALPHA * x.exp()
            }
        }
        Activation::Swish => {
            let s = sigmoid(x);
            s + x * s * (1.0 - s)
        }
        Activation::Mish => {
            let t = softplus(x).tanh();
            t + x * (1.0 - t * t) * sigmoid(x)
        }
        Activation::Softmax | Activation::None => 1.0,
    }
}
