//! Optimizers
//!
//! Four update rules share one state object: SGD, RMSProp, Adam and AdamW.
//! The optimizer runs once per mini-batch on the averaged (and optionally
//! clamped) batch gradient produced by [`crate::gradients`].
//!
//! ## Algorithm
//!
//! For each parameter θ with gradient g, at step t (incremented once per
//! update, before the update):
//!
//! ```text
//! sgd:      θ -= lr·g + lr·λ·θ
//! rmsprop:  s = 0.9·s + 0.1·g²
//!           θ -= lr·g / (√s + ε) + lr·λ·θ
//! adam:     m = β₁·m + (1 - β₁)·g
//!           v = β₂·v + (1 - β₂)·g²
//!           α = lr·√(1 - β₂^t) / (1 - β₁^t)
//!           θ -= α·m / (√v + ε) + lr·λ·θ
//! adamw:    same moments and α
//!           θ -= α·m / (√v + ε)
//!           θ -= lr·λ·θ                     (weights only)
//! ```
//!
//! where β₁ = 0.9, β₂ = 0.999, ε = 1e-8 and λ is the L2 coefficient.
//! Folding the bias correction into α keeps the effective learning rate equal
//! to the caller's current (possibly scheduled) rate.
//!
//! ## Coupled vs Decoupled Weight Decay
//!
//! SGD, RMSProp and Adam add `lr·λ·θ` to the update of every parameter
//! group. AdamW subtracts the decay separately, after the gradient step, and
//! only from dense weight matrices. Biases and LayerNorm scale/shift are
//! never decayed by AdamW.
//!
//! ## Divergence
//!
//! An update whose result is not finite is discarded: the parameter keeps its
//! previous value and a warning is logged.
//!
//! ## State Lifecycle
//!
//! Moment buffers are allocated lazily, per layer and per parameter group,
//! the first time a rule needs them. [`OptimizerState::prepare`] wipes all
//! moments and the step counter when the optimizer kind or the parameter
//! layout differs from what the state was built for.
//!
//! Buffers with more than 1000 elements are updated in parallel with Rayon.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::gradients::PARALLEL_THRESHOLD;
use crate::params::{ParamGroup, ParameterStore};

pub const BETA1: f32 = 0.9;
pub const BETA2: f32 = 0.999;
pub const EPSILON: f32 = 1e-8;
/// Decay of the RMSProp squared-gradient average.
pub const RMSPROP_DECAY: f32 = 0.9;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Sgd,
    RmsProp,
    #[default]
    Adam,
    AdamW,
}

impl OptimizerKind {
    pub fn name(self) -> &'static str {
        match self {
            OptimizerKind::Sgd => "sgd",
            OptimizerKind::RmsProp => "rmsprop",
            OptimizerKind::Adam => "adam",
            OptimizerKind::AdamW => "adamw",
        }
    }
}

/// Moment buffers of one parameter group. Empty until first needed.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupMoments {
    /// First moment (Adam, AdamW).
    pub m: Vec<f32>,
    /// Second moment (Adam, AdamW).
    pub v: Vec<f32>,
    /// Squared-gradient average (RMSProp).
    pub s: Vec<f32>,
}

/// Moment buffers of one layer, one [`GroupMoments`] per parameter group.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerMoments {
    pub weights: GroupMoments,
    pub bias: GroupMoments,
    pub gamma: GroupMoments,
    pub beta: GroupMoments,
}

impl LayerMoments {
    pub fn group(&self, group: ParamGroup) -> &GroupMoments {
        match group {
            ParamGroup::Weights => &self.weights,
            ParamGroup::Bias => &self.bias,
            ParamGroup::Gamma => &self.gamma,
            ParamGroup::Beta => &self.beta,
        }
    }

    pub fn group_mut(&mut self, group: ParamGroup) -> &mut GroupMoments {
        match group {
            ParamGroup::Weights => &mut self.weights,
            ParamGroup::Bias => &mut self.bias,
            ParamGroup::Gamma => &mut self.gamma,
            ParamGroup::Beta => &mut self.beta,
        }
    }
}

/// Optimizer state
///
/// Owned by the model, persisted with it, and reused across epochs and
/// across calls to train.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub kind: OptimizerKind,
    /// Number of updates applied since the last reset.
    pub t: u64,
    pub layers: Vec<LayerMoments>,
    /// Parameter layout the moments were built for.
    pub signature: Vec<[usize; 4]>,
}

/// Allocate a zeroed buffer of `len` if it does not already have that length.
fn ensure(buf: &mut Vec<f32>, len: usize) {
    if buf.len() != len {
        *buf = vec![0.0; len];
    }
}

/// Store `new` into `param` if finite. Returns true when the update was discarded.
#[inline]
fn commit(param: &mut f32, new: f32) -> bool {
    if new.is_finite() {
        *param = new;
        false
    } else {
        true
    }
}

impl OptimizerState {
    pub fn new(kind: OptimizerKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    /// Drop all moments and the step counter and switch to `kind`.
    pub fn reset(&mut self, kind: OptimizerKind) {
        self.kind = kind;
        self.t = 0;
        self.layers.clear();
        self.signature.clear();
    }

    /// Make the state ready to update `params` with `kind`.
    ///
    /// Resets when the kind changed or the parameter layout no longer matches.
    /// Returns true if a reset happened.
    pub fn prepare(&mut self, kind: OptimizerKind, params: &ParameterStore) -> bool {
        let signature = params.signature();
        let mut reset = false;

        if kind != self.kind {
            debug!(from = self.kind.name(), to = kind.name(), "optimizer changed, resetting moments");
            self.reset(kind);
            reset = true;
        } else if !self.signature.is_empty() && self.signature != signature {
            debug!("parameter layout changed, resetting moments");
            self.reset(kind);
            reset = true;
        }

        self.signature = signature;
        self.layers.resize_with(params.sets.len(), LayerMoments::default);
        reset
    }

    /// Total number of allocated moment values.
    pub fn moment_count(&self) -> usize {
        self.layers
            .iter()
            .flat_map(|l| ParamGroup::ALL.into_iter().map(move |g| l.group(g)))
            .map(|g| g.m.len() + g.v.len() + g.s.len())
            .sum()
    }

    /// Apply one update to `params` from the mean batch gradient `grads`.
    ///
    /// Returns the number of discarded (non-finite) parameter updates.
    pub fn step(
        &mut self,
        params: &mut ParameterStore,
        grads: &ParameterStore,
        learning_rate: f32,
        l2: f32,
    ) -> usize {
        if self.layers.len() != params.sets.len() {
            self.prepare(self.kind, params);
        }
        self.t += 1;

        let t = self.t as f32;
        let alpha = learning_rate * (1.0 - BETA2.powf(t)).sqrt() / (1.0 - BETA1.powf(t));
        let kind = self.kind;

        let mut discarded = 0;
        for (layer, (set, grad_set)) in params.sets.iter_mut().zip(&grads.sets).enumerate() {
            let moments = &mut self.layers[layer];
            for group in ParamGroup::ALL {
                let values = set.group_mut(group);
                if values.is_empty() {
                    continue;
                }
                let grad = grad_set.group(group);
                let slot = moments.group_mut(group);
                let rule = Rule {
                    learning_rate,
                    alpha,
                    l2,
                    decoupled_decay: group == ParamGroup::Weights,
                };

                discarded += match kind {
                    OptimizerKind::Sgd => rule.sgd(values, grad),
                    OptimizerKind::RmsProp => {
                        ensure(&mut slot.s, values.len());
                        rule.rmsprop(values, grad, &mut slot.s)
                    }
                    OptimizerKind::Adam | OptimizerKind::AdamW => {
                        ensure(&mut slot.m, values.len());
                        ensure(&mut slot.v, values.len());
                        rule.adam(values, grad, &mut slot.m, &mut slot.v, kind == OptimizerKind::AdamW)
                    }
                };
            }
        }

        if discarded > 0 {
            warn!(
                optimizer = kind.name(),
                step = self.t,
                count = discarded,
                "non-finite parameter updates discarded"
            );
        }
        discarded
    }
}

/// Per-group coefficients of one update.
#[derive(Clone, Copy)]
struct Rule {
    learning_rate: f32,
    /// Bias-corrected Adam step size.
    alpha: f32,
    l2: f32,
    /// True for weight matrices, the only group AdamW decays.
    decoupled_decay: bool,
}

impl Rule {
    fn sgd(self, params: &mut [f32], grads: &[f32]) -> usize {
        let update = |p: &mut f32, g: f32| {
            let delta = self.learning_rate * g + self.learning_rate * self.l2 * *p;
            commit(p, *p - delta)
        };

        if params.len() > PARALLEL_THRESHOLD {
            params
                .par_iter_mut()
                .zip(grads.par_iter())
                .map(|(p, &g)| update(p, g))
                .filter(|&discarded| discarded)
                .count()
        } else {
            params
                .iter_mut()
                .zip(grads)
                .map(|(p, &g)| update(p, g))
                .filter(|&discarded| discarded)
                .count()
        }
    }

    fn rmsprop(self, params: &mut [f32], grads: &[f32], s: &mut [f32]) -> usize {
        // The running average moves only together with the parameter.
        let update = |p: &mut f32, g: f32, s: &mut f32| {
            let next_s = RMSPROP_DECAY * *s + (1.0 - RMSPROP_DECAY) * g * g;
            let delta = self.learning_rate * g / (next_s.sqrt() + EPSILON)
                + self.learning_rate * self.l2 * *p;
            let discarded = commit(p, *p - delta);
            if !discarded {
                *s = next_s;
            }
            discarded
        };

        if params.len() > PARALLEL_THRESHOLD {
            params
                .par_iter_mut()
                .zip(grads.par_iter())
                .zip(s.par_iter_mut())
                .map(|((p, &g), s)| update(p, g, s))
                .filter(|&discarded| discarded)
                .count()
        } else {
            params
                .iter_mut()
                .zip(grads)
                .zip(s.iter_mut())
                .map(|((p, &g), s)| update(p, g, s))
                .filter(|&discarded| discarded)
                .count()
        }
    }

    fn adam(self, params: &mut [f32], grads: &[f32], m: &mut [f32], v: &mut [f32], decoupled: bool) -> usize {
        let decay_after = decoupled && self.decoupled_decay;
        let update = |p: &mut f32, g: f32, m: &mut f32, v: &mut f32| {
            // Biased first and second moment estimates, kept only if the step lands
            let next_m = BETA1 * *m + (1.0 - BETA1) * g;
            let next_v = BETA2 * *v + (1.0 - BETA2) * g * g;

            let mut new = *p - self.alpha * next_m / (next_v.sqrt() + EPSILON);
            if !decoupled {
                new -= self.learning_rate * self.l2 * *p;
            } else if decay_after {
                new -= self.learning_rate * self.l2 * new;
            }
            let discarded = commit(p, new);
            if !discarded {
                *m = next_m;
                *v = next_v;
            }
            discarded
        };

        if params.len() > PARALLEL_THRESHOLD {
            params
                .par_iter_mut()
                .zip(grads.par_iter())
                .zip(m.par_iter_mut().zip(v.par_iter_mut()))
                .map(|((p, &g), (m, v))| update(p, g, m, v))
                .filter(|&discarded| discarded)
                .count()
        } else {
            params
                .iter_mut()
                .zip(grads)
                .zip(m.iter_mut().zip(v.iter_mut()))
                .map(|((p, &g), (m, v))| update(p, g, m, v))
                .filter(|&discarded| discarded)
                .count()
        }
    }
}
