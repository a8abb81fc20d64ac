//! Training Loop
//!
//! Epoch/batch/sample orchestration on top of the layer kernels.
//!
//! ## One Epoch
//!
//! ```text
//! lr = schedule(lr0, epoch)
//! shuffle(train)
//! for batch in train.chunks(batch_size):        // last batch may be short
//!     zero gradient accumulators
//!     for sample in batch:
//!         cache = forward(sample.input)          // fresh cache per sample
//!         loss, d = loss_fn(cache.output, sample.output)
//!         backward(cache, d) → accumulate
//!     grads = clamp(accumulated / batch.len())
//!     optimizer.step(grads, lr)
//! validation: forward only, loss + metric
//! callback(report)
//! ```
//!
//! ## Learning Rate Schedules
//!
//! ```text
//! none:        lr0
//! step:        lr0 · factor^⌊epoch / step_size⌋
//! exponential: lr0 · rate^epoch
//! ```
//!
//! ## Suspension Points
//!
//! The loop checks its [`TrainingControl`] at every epoch, batch and sample
//! boundary. Pausing blocks at the next boundary; stopping ends training at
//! the next epoch boundary.
//!
//! Everything that can be rejected up front is checked by [`plan`] before the
//! model is touched.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info, warn};

use crate::cache::ForwardCache;
use crate::control::TrainingControl;
use crate::data::{compatible_samples, Dataset, Sample};
use crate::error::{EngineError, Result};
use crate::gradients::{average_and_clamp, compute_grad_norm};
use crate::layers::LayerConfig;
use crate::loss::{LossFunction, LossKind, MetricKind, OutputHead};
use crate::model::{backward_pass, forward_pass};
use crate::optimizer::{OptimizerKind, OptimizerState};
use crate::params::ParameterStore;

/// Learning rate schedule, evaluated once per epoch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LrSchedule {
    #[default]
    None,
    Step {
        factor: f32,
        step_size: usize,
    },
    Exponential {
        rate: f32,
    },
}

impl LrSchedule {
    pub fn learning_rate(&self, base: f32, epoch: usize) -> f32 {
        match *self {
            LrSchedule::None => base,
            LrSchedule::Step { factor, step_size } => {
                base * factor.powi((epoch / step_size.max(1)) as i32)
            }
            LrSchedule::Exponential { rate } => base * rate.powi(epoch as i32),
        }
    }

    fn validate(&self) -> Result<()> {
        match *self {
            LrSchedule::None => Ok(()),
            LrSchedule::Step { factor, step_size } => {
                if !(factor.is_finite() && factor > 0.0) || step_size == 0 {
                    return Err(EngineError::config(format!(
                        "step schedule needs factor > 0 and step_size > 0, got factor {} and step_size {}",
                        factor, step_size
                    )));
                }
                Ok(())
            }
            LrSchedule::Exponential { rate } => {
                if !(rate.is_finite() && rate > 0.0) {
                    return Err(EngineError::config(format!(
                        "exponential schedule needs rate > 0, got {}",
                        rate
                    )));
                }
                Ok(())
            }
        }
    }
}

/// Training configuration
///
/// A snapshot of everything one call to train needs apart from the data and
/// the epoch callback. Missing JSON fields take their default.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingOptions {
    /// Number of passes through the training set
    pub epochs: usize,
    /// Learning rate before scheduling
    pub learning_rate: f32,
    /// Samples per optimizer step
    pub batch_size: usize,
    pub optimizer: OptimizerKind,
    pub loss: LossKind,
    /// L2 coefficient (coupled for sgd/rmsprop/adam, decoupled for adamw)
    pub l2: f32,
    /// Per-element gradient clamp, 0 disables
    pub clip_value: f32,
    pub schedule: LrSchedule,
    /// Add sinusoidal position values to the input before layer 0
    pub positional_encoding: bool,
    /// Stop once the epoch train loss drops below this value
    pub early_stop_threshold: Option<f32>,
}

impl Default for TrainingOptions {
    fn default() -> Self {
        Self {
            epochs: 100,
            learning_rate: 0.01,
            batch_size: 32,
            optimizer: OptimizerKind::Adam,
            loss: LossKind::Mse,
            l2: 0.0,
            clip_value: 0.0,
            schedule: LrSchedule::None,
            positional_encoding: false,
            early_stop_threshold: None,
        }
    }
}

impl TrainingOptions {
    /// Small datasets and quick experiments
    ///
    /// Higher learning rate and small batches so toy problems converge in a
    /// few hundred epochs.
    pub fn quick() -> Self {
        Self {
            epochs: 200,
            learning_rate: 0.05,
            batch_size: 4,
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(EngineError::config("epochs must be greater than zero"));
        }
        if self.batch_size == 0 {
            return Err(EngineError::config("batch size must be greater than zero"));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(EngineError::config(format!(
                "learning rate must be a positive number, got {}",
                self.learning_rate
            )));
        }
        if !(self.l2.is_finite() && self.l2 >= 0.0) {
            return Err(EngineError::config(format!(
                "l2 must be zero or positive, got {}",
                self.l2
            )));
        }
        if !(self.clip_value.is_finite() && self.clip_value >= 0.0) {
            return Err(EngineError::config(format!(
                "clip value must be zero or positive, got {}",
                self.clip_value
            )));
        }
        if let Some(threshold) = self.early_stop_threshold {
            if !threshold.is_finite() {
                return Err(EngineError::config("early stop threshold must be finite"));
            }
        }
        self.schedule.validate()
    }
}

/// JSON writes non-finite floats as `null`; read them back as NaN.
fn nan_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<f32, D::Error> {
    Ok(Option::<f32>::deserialize(deserializer)?.unwrap_or(f32::NAN))
}

/// Validation metric of one epoch.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub kind: MetricKind,
    #[serde(deserialize_with = "nan_or_number")]
    pub value: f32,
}

impl Metric {
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}

/// Numbers recorded for one epoch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpochStats {
    /// Zero-based epoch index
    pub epoch: usize,
    #[serde(deserialize_with = "nan_or_number")]
    pub learning_rate: f32,
    /// Mean per-sample training loss
    #[serde(deserialize_with = "nan_or_number")]
    pub train_loss: f32,
    pub val_loss: Option<f32>,
    pub metric: Option<Metric>,
    /// Mean L2 norm of the batch gradients
    #[serde(deserialize_with = "nan_or_number")]
    pub grad_norm: f32,
}

/// What the epoch callback receives.
pub struct EpochReport<'a> {
    pub stats: &'a EpochStats,
    /// Forward cache of the last training sample of the epoch.
    pub last_cache: Option<&'a ForwardCache>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    Completed,
    EarlyStopped,
    StopRequested,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub epochs_run: usize,
    /// NaN when no epoch ran
    #[serde(deserialize_with = "nan_or_number")]
    pub final_loss: f32,
    pub final_val_loss: Option<f32>,
    pub final_metric: Option<Metric>,
    pub stop_reason: StopReason,
    pub history: Vec<EpochStats>,
}

/// Everything resolved from the options and data before training starts.
#[derive(Debug)]
pub(crate) struct TrainingPlan {
    pub train: Vec<Sample>,
    pub validation: Vec<Sample>,
    pub loss: LossFunction,
    pub metric: MetricKind,
}

/// Check options, topology and data, and resolve the loss.
///
/// Fails with [`EngineError::Configuration`] before anything is mutated.
/// Indices of softmax layers, standalone or dense, that are not the last layer.
fn inner_softmax_layers(layers: &[LayerConfig]) -> Vec<usize> {
    let last = layers.len().saturating_sub(1);
    layers
        .iter()
        .enumerate()
        .filter(|(i, layer)| layer.is_softmax() && *i != last)
        .map(|(i, _)| i)
        .collect()
}

pub(crate) fn plan(
    layers: &[LayerConfig],
    dataset: &Dataset,
    options: &TrainingOptions,
) -> Result<TrainingPlan> {
    options.validate()?;

    let (Some(first), Some(last)) = (layers.first(), layers.last()) else {
        return Err(EngineError::config("model has no layers"));
    };
    let input_size = first.input_size;
    let output_size = last.output_size;

    let train = compatible_samples(&dataset.train, input_size, output_size, "train");
    if train.is_empty() {
        return Err(EngineError::config(format!(
            "no training samples with input size {} and output size {}",
            input_size, output_size
        )));
    }
    let validation = compatible_samples(&dataset.validation, input_size, output_size, "validation");

    let head = OutputHead::classify(layers);
    let (loss, fell_back) = LossFunction::resolve(options.loss, head);
    if fell_back {
        warn!("crossentropy needs a softmax or single sigmoid output, using squared error");
    }

    for i in inner_softmax_layers(layers) {
        warn!(layer = i, "softmax layer is not final, its gradient is a pass-through");
    }
    if head == OutputHead::Softmax && options.loss == LossKind::Mse {
        warn!("softmax output trained with mse, its gradient is a pass-through");
    }

    Ok(TrainingPlan {
        train,
        validation,
        loss,
        metric: options.loss.metric(),
    })
}

/// Mutable model state the loop works on.
pub(crate) struct TrainContext<'a> {
    pub layers: &'a [LayerConfig],
    pub params: &'a mut ParameterStore,
    pub optimizer: &'a mut OptimizerState,
    pub control: &'a TrainingControl,
    pub rng: &'a mut StdRng,
    pub positional_encoding: bool,
}

/// Run the planned training to completion, early stop, or a stop request.
pub(crate) fn execute<F>(
    ctx: TrainContext<'_>,
    plan: TrainingPlan,
    options: &TrainingOptions,
    mut on_epoch: F,
) -> Result<TrainingSummary>
where
    F: FnMut(&EpochReport<'_>),
{
    let TrainContext {
        layers,
        params,
        optimizer,
        control,
        rng,
        positional_encoding,
    } = ctx;
    let TrainingPlan {
        mut train,
        validation,
        loss,
        metric,
    } = plan;

    if optimizer.prepare(options.optimizer, params) {
        debug!(optimizer = options.optimizer.name(), "optimizer state reset");
    }

    info!(
        epochs = options.epochs,
        train_samples = train.len(),
        validation_samples = validation.len(),
        batch_size = options.batch_size,
        optimizer = options.optimizer.name(),
        loss = options.loss.name(),
        "training started"
    );

    let _guard = control.begin();
    let mut grads = params.zeros_like();
    let mut history = Vec::with_capacity(options.epochs);
    let mut stop_reason = StopReason::Completed;

    for epoch in 0..options.epochs {
        control.checkpoint("epoch");
        if control.is_stop_requested() {
            stop_reason = StopReason::StopRequested;
            break;
        }

        let lr = options.schedule.learning_rate(options.learning_rate, epoch);
        train.shuffle(&mut *rng);

        let mut loss_sum = 0.0f32;
        let mut norm_sum = 0.0f32;
        let mut batches = 0usize;
        let mut last_cache = None;

        for batch in train.chunks(options.batch_size) {
            control.checkpoint("batch");
            grads.fill_zero();

            for sample in batch {
                control.checkpoint("sample");
                let cache = forward_pass(
                    layers,
                    params,
                    &sample.input,
                    positional_encoding,
                    Some(&mut *rng),
                )?;
                let (sample_loss, grad_output) = loss.evaluate(cache.output(), &sample.output);
                loss_sum += sample_loss;
                backward_pass(layers, params, &cache, grad_output, &mut grads)?;
                last_cache = Some(cache);
            }

            average_and_clamp(&mut grads, batch.len(), options.clip_value);
            norm_sum += compute_grad_norm(&grads);
            batches += 1;
            optimizer.step(params, &grads, lr, options.l2);
        }

        let train_loss = loss_sum / train.len() as f32;
        let (val_loss, val_metric) = if validation.is_empty() {
            (None, None)
        } else {
            let (val_loss, value) = evaluate(layers, params, &validation, positional_encoding, loss, metric)?;
            (Some(val_loss), Some(Metric { kind: metric, value }))
        };

        let stats = EpochStats {
            epoch,
            learning_rate: lr,
            train_loss,
            val_loss,
            metric: val_metric,
            grad_norm: norm_sum / batches.max(1) as f32,
        };

        info!(
            epoch,
            lr,
            train_loss,
            val_loss = val_loss.unwrap_or(f32::NAN),
            metric = val_metric.map(|m| m.value).unwrap_or(f32::NAN),
            grad_norm = stats.grad_norm,
            "epoch finished"
        );

        on_epoch(&EpochReport {
            stats: &stats,
            last_cache: last_cache.as_ref(),
        });
        history.push(stats);

        if let Some(threshold) = options.early_stop_threshold {
            if train_loss < threshold {
                info!(epoch, train_loss, threshold, "early stop");
                stop_reason = StopReason::EarlyStopped;
                break;
            }
        }
    }

    let last = history.last();
    let summary = TrainingSummary {
        epochs_run: history.len(),
        final_loss: last.map(|s| s.train_loss).unwrap_or(f32::NAN),
        final_val_loss: last.and_then(|s| s.val_loss),
        final_metric: last.and_then(|s| s.metric),
        stop_reason,
        history,
    };

    info!(
        epochs_run = summary.epochs_run,
        final_loss = summary.final_loss,
        stop_reason = ?summary.stop_reason,
        "training finished"
    );
    Ok(summary)
}

/// Mean loss and metric over `samples`, forward only.
fn evaluate(
    layers: &[LayerConfig],
    params: &ParameterStore,
    samples: &[Sample],
    positional_encoding: bool,
    loss: LossFunction,
    metric: MetricKind,
) -> Result<(f32, f32)> {
    let mut predictions = Vec::with_capacity(samples.len());
    let mut total = 0.0f32;
    for sample in samples {
        let cache = forward_pass::<StdRng>(layers, params, &sample.input, positional_encoding, None)?;
        total += loss.loss(cache.output(), &sample.output);
        predictions.push(cache.output().to_vec());
    }

    let targets: Vec<Vec<f32>> = samples.iter().map(|s| s.output.clone()).collect();
    Ok((total / samples.len() as f32, metric.compute(&predictions, &targets)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::Activation;
    use rand::SeedableRng;

    fn regression_data() -> Dataset {
        // y = 2x - 1
        let samples = (0..20)
            .map(|i| {
                let x = i as f32 / 10.0 - 1.0;
                Sample::new(vec![x], vec![2.0 * x - 1.0])
            })
            .collect();
        Dataset::split(samples, 0.25)
    }

    fn linear_layers() -> Vec<LayerConfig> {
        vec![LayerConfig::dense(1, 1, Activation::None)]
    }

    #[test]
    fn test_inner_softmax_layers() {
        let layers = vec![
            LayerConfig::dense(2, 3, Activation::Softmax),
            LayerConfig::softmax(3),
            LayerConfig::dense(3, 3, Activation::Tanh),
            LayerConfig::softmax(3),
        ];
        assert_eq!(inner_softmax_layers(&layers), vec![0, 1]);

        let head_only = vec![
            LayerConfig::dense(2, 3, Activation::None),
            LayerConfig::dense(3, 3, Activation::Softmax),
        ];
        assert!(inner_softmax_layers(&head_only).is_empty());
        assert!(inner_softmax_layers(&[]).is_empty());
    }

    #[test]
    fn test_schedules() {
        assert_eq!(LrSchedule::None.learning_rate(0.1, 7), 0.1);

        let step = LrSchedule::Step {
            factor: 0.5,
            step_size: 10,
        };
        assert_eq!(step.learning_rate(0.1, 9), 0.1);
        assert!((step.learning_rate(0.1, 10) - 0.05).abs() < 1e-7);
        assert!((step.learning_rate(0.1, 25) - 0.025).abs() < 1e-7);

        let exp = LrSchedule::Exponential { rate: 0.9 };
        assert_eq!(exp.learning_rate(1.0, 0), 1.0);
        assert!((exp.learning_rate(1.0, 2) - 0.81).abs() < 1e-6);
    }

    #[test]
    fn test_options_validation() {
        assert!(TrainingOptions::default().validate().is_ok());
        assert!(TrainingOptions::quick().validate().is_ok());

        let bad = [
            TrainingOptions { epochs: 0, ..Default::default() },
            TrainingOptions { batch_size: 0, ..Default::default() },
            TrainingOptions { learning_rate: 0.0, ..Default::default() },
            TrainingOptions { learning_rate: f32::NAN, ..Default::default() },
            TrainingOptions { l2: -0.1, ..Default::default() },
            TrainingOptions { clip_value: -1.0, ..Default::default() },
            TrainingOptions {
                schedule: LrSchedule::Step { factor: 0.5, step_size: 0 },
                ..Default::default()
            },
            TrainingOptions {
                schedule: LrSchedule::Exponential { rate: 0.0 },
                ..Default::default()
            },
        ];
        for options in bad {
            assert!(
                matches!(options.validate(), Err(EngineError::Configuration(_))),
                "{:?} should be rejected",
                options
            );
        }
    }

    #[test]
    fn test_options_from_json() {
        let options = TrainingOptions::from_json(
            r#"{
                "epochs": 5,
                "optimizer": "rmsprop",
                "loss": "crossentropy",
                "schedule": {"type": "step", "factor": 0.5, "step_size": 2}
            }"#,
        )
        .unwrap();
        assert_eq!(options.epochs, 5);
        assert_eq!(options.optimizer, OptimizerKind::RmsProp);
        assert_eq!(options.loss, LossKind::CrossEntropy);
        assert_eq!(options.batch_size, 32);
        assert_eq!(
            options.schedule,
            LrSchedule::Step { factor: 0.5, step_size: 2 }
        );

        assert!(matches!(
            TrainingOptions::from_json(r#"{"epochs": 0}"#),
            Err(EngineError::Configuration(_))
        ));
        assert!(matches!(
            TrainingOptions::from_json("not json"),
            Err(EngineError::Json(_))
        ));
    }

    #[test]
    fn test_summary_json_keeps_nan_loss() {
        let summary = TrainingSummary {
            epochs_run: 0,
            final_loss: f32::NAN,
            final_val_loss: None,
            final_metric: None,
            stop_reason: StopReason::StopRequested,
            history: Vec::new(),
        };
        let json = serde_json::to_string(&summary).unwrap();
        let back: TrainingSummary = serde_json::from_str(&json).unwrap();
        assert!(back.final_loss.is_nan());
        assert_eq!(back.stop_reason, StopReason::StopRequested);
    }

    #[test]
    fn test_plan_rejects_empty_inputs() {
        let options = TrainingOptions::default();
        assert!(plan(&[], &regression_data(), &options).is_err());

        let wrong_width = Dataset::new(vec![Sample::new(vec![1.0, 2.0], vec![1.0])]);
        assert!(matches!(
            plan(&linear_layers(), &wrong_width, &options),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn test_plan_resolves_metric_and_fallback() {
        let options = TrainingOptions {
            loss: LossKind::CrossEntropy,
            ..Default::default()
        };
        let plan = plan(&linear_layers(), &regression_data(), &options).unwrap();
        assert_eq!(plan.loss, LossFunction::SquaredError);
        assert_eq!(plan.metric, MetricKind::Accuracy);
        assert_eq!(plan.train.len(), 15);
        assert_eq!(plan.validation.len(), 5);
    }

    #[test]
    fn test_execute_fits_linear_function() {
        let layers = linear_layers();
        let mut params = ParameterStore::initialize(&layers, 1);
        let mut optimizer = OptimizerState::default();
        let control = TrainingControl::new();
        let mut rng = StdRng::seed_from_u64(3);
        let options = TrainingOptions {
            epochs: 300,
            learning_rate: 0.05,
            batch_size: 5,
            optimizer: OptimizerKind::Sgd,
            ..Default::default()
        };
        let dataset = regression_data();
        let plan = plan(&layers, &dataset, &options).unwrap();

        let mut epochs_seen = Vec::new();
        let summary = execute(
            TrainContext {
                layers: &layers,
                params: &mut params,
                optimizer: &mut optimizer,
                control: &control,
                rng: &mut rng,
                positional_encoding: false,
            },
            plan,
            &options,
            |report| {
                assert!(report.last_cache.is_some());
                epochs_seen.push(report.stats.epoch);
            },
        )
        .unwrap();

        assert_eq!(summary.stop_reason, StopReason::Completed);
        assert_eq!(summary.epochs_run, 300);
        assert_eq!(epochs_seen, (0..300).collect::<Vec<_>>());
        assert!(summary.final_loss < 1e-3, "loss {}", summary.final_loss);

        let r2 = summary.final_metric.unwrap();
        assert_eq!(r2.kind, MetricKind::RSquared);
        assert!(r2.value > 0.99);

        assert!((params.sets[0].weights[0] - 2.0).abs() < 0.05);
        assert!((params.sets[0].bias[0] + 1.0).abs() < 0.05);
        assert_eq!(control.state(), crate::control::TrainingState::Idle);
    }

    #[test]
    fn test_execute_early_stop_and_stop_request() {
        let layers = linear_layers();
        let dataset = regression_data();
        let control = TrainingControl::new();
        let mut rng = StdRng::seed_from_u64(3);

        let options = TrainingOptions {
            epochs: 1000,
            learning_rate: 0.05,
            batch_size: 5,
            optimizer: OptimizerKind::Sgd,
            early_stop_threshold: Some(0.01),
            ..Default::default()
        };
        let mut params = ParameterStore::initialize(&layers, 1);
        let mut optimizer = OptimizerState::default();
        let summary = execute(
            TrainContext {
                layers: &layers,
                params: &mut params,
                optimizer: &mut optimizer,
                control: &control,
                rng: &mut rng,
                positional_encoding: false,
            },
            plan(&layers, &dataset, &options).unwrap(),
            &options,
            |_| {},
        )
        .unwrap();
        assert_eq!(summary.stop_reason, StopReason::EarlyStopped);
        assert!(summary.epochs_run < 1000);
        assert!(summary.final_loss < 0.01);

        // A stop issued from the callback ends training before the next epoch.
        let mut params = ParameterStore::initialize(&layers, 1);
        let stopper = control.clone();
        let summary = execute(
            TrainContext {
                layers: &layers,
                params: &mut params,
                optimizer: &mut optimizer,
                control: &control,
                rng: &mut rng,
                positional_encoding: false,
            },
            plan(&layers, &dataset, &options).unwrap(),
            &options,
            |report| {
                if report.stats.epoch == 2 {
                    stopper.stop();
                }
            },
        )
        .unwrap();
        assert_eq!(summary.stop_reason, StopReason::StopRequested);
        assert_eq!(summary.epochs_run, 3);
        assert!(!control.is_stop_requested());
    }
}
