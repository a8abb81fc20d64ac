//! Model Facade
//!
//! A [`Model`] owns everything one network needs: the ordered layer configs,
//! their parameters, the optimizer moments, the pause/stop control and the
//! RNG that drives shuffling and dropout. Two models never share state.
//!
//! ## Lifecycle
//!
//! ```text
//! Model::with_seed(2, 42)
//!     .add_layer(dense 2→4 relu)      validated against the previous output
//!     .add_layer(dense 4→1)
//! model.train(&dataset, &options)     Idle → Training → Idle
//! model.predict(&[1.0, 0.0])          forward only, no dropout
//! model.save("xor.lwck")
//! ```
//!
//! ## Forward and Backward Passes
//!
//! [`forward_pass`] and [`backward_pass`] walk the layer list with the kernels
//! from [`crate::layers`]. The forward pass records every activation into a
//! fresh [`ForwardCache`]; the backward pass walks the same cache in reverse
//! and accumulates parameter gradients into a store shaped like the model's.
//!
//! ## Example
//!
//! ```rust,no_run
//! use layerwise::{Activation, Dataset, LayerConfig, Model, Sample, TrainingOptions};
//!
//! let mut model = Model::with_seed(2, 1);
//! model.add_layer(LayerConfig::dense(2, 4, Activation::Relu))?;
//! model.add_layer(LayerConfig::dense(4, 1, Activation::None))?;
//!
//! let xor = Dataset::new(vec![
//!     Sample::new(vec![0.0, 0.0], vec![0.0]),
//!     Sample::new(vec![0.0, 1.0], vec![1.0]),
//!     Sample::new(vec![1.0, 0.0], vec![1.0]),
//!     Sample::new(vec![1.0, 1.0], vec![0.0]),
//! ]);
//! let summary = model.train(&xor, &TrainingOptions::quick())?;
//! println!("final loss {}", summary.final_loss);
//! # Ok::<(), layerwise::EngineError>(())
//! ```

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::cache::ForwardCache;
use crate::control::{TrainingControl, TrainingState};
use crate::data::Dataset;
use crate::error::{EngineError, Result};
use crate::layers::{backward_layer, forward_layer, LayerConfig, LayerKind};
use crate::math::positional_encoding;
use crate::optimizer::OptimizerState;
use crate::params::{ParameterSet, ParameterStore};
use crate::train::{self, EpochReport, TrainContext, TrainingOptions, TrainingSummary};

/// Seed used by [`Model::new`].
pub const DEFAULT_SEED: u64 = 42;

#[derive(Debug)]
pub struct Model {
    input_size: usize,
    seed: u64,
    layers: Vec<LayerConfig>,
    params: ParameterStore,
    optimizer: OptimizerState,
    positional_encoding: bool,
    last_summary: Option<TrainingSummary>,
    control: TrainingControl,
    rng: StdRng,
}

impl Model {
    /// Empty model taking `input_size` values, seeded with [`DEFAULT_SEED`].
    pub fn new(input_size: usize) -> Self {
        Self::with_seed(input_size, DEFAULT_SEED)
    }

    /// Empty model whose parameter initialization, shuffling and dropout
    /// masks are all derived from `seed`.
    pub fn with_seed(input_size: usize, seed: u64) -> Self {
        Self {
            input_size,
            seed,
            layers: Vec::new(),
            params: ParameterStore::new(),
            optimizer: OptimizerState::default(),
            positional_encoding: false,
            last_summary: None,
            control: TrainingControl::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Rebuild a model from its parts, checking that they agree.
    pub(crate) fn from_parts(
        input_size: usize,
        seed: u64,
        layers: Vec<LayerConfig>,
        params: ParameterStore,
        optimizer: OptimizerState,
        positional_encoding: bool,
        last_summary: Option<TrainingSummary>,
    ) -> Result<Self> {
        let mut model = Self::with_seed(input_size, seed);
        for layer in layers {
            model.add_layer(layer)?;
        }
        if params.signature() != model.params.signature() {
            return Err(EngineError::Checkpoint(
                "parameter buffers do not match the layer configuration".to_string(),
            ));
        }
        model.params = params;
        model.optimizer = optimizer;
        model.positional_encoding = positional_encoding;
        model.last_summary = last_summary;
        Ok(model)
    }

    /// Append a layer
    ///
    /// The config is validated against the output size of the current last
    /// layer (or the model input size). On error the model is unchanged.
    ///
    /// # Arguments
    ///
    /// * `config` - Layer kind and sizes; its input size must equal the
    ///   current output size
    ///
    /// # Returns
    ///
    /// The model itself, so calls can be chained with `?`.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use layerwise::{Activation, LayerConfig, Model};
    /// let mut model = Model::new(4);
    /// model
    ///     .add_layer(LayerConfig::dense(4, 8, Activation::Gelu))?
    ///     .add_layer(LayerConfig::layer_norm(8))?
    ///     .add_layer(LayerConfig::dense(8, 3, Activation::None))?
    ///     .add_layer(LayerConfig::softmax(3))?;
    /// # Ok::<(), layerwise::EngineError>(())
    /// ```
    pub fn add_layer(&mut self, mut config: LayerConfig) -> Result<&mut Self> {
        config.validate(self.output_size())?;

        let index = self.layers.len();
        let set = ParameterSet::for_layer(&config, index, self.seed);
        debug!(
            layer = index,
            kind = config.kind.name(),
            input_size = config.input_size,
            output_size = config.output_size,
            parameters = set.len(),
            "layer added"
        );
        self.params.push(set);
        self.layers.push(config);
        Ok(self)
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    /// Width of the last layer, or the input size of an empty model.
    pub fn output_size(&self) -> usize {
        self.layers
            .last()
            .map(|l| l.output_size)
            .unwrap_or(self.input_size)
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn layers(&self) -> &[LayerConfig] {
        &self.layers
    }

    pub fn params(&self) -> &ParameterStore {
        &self.params
    }

    pub fn optimizer(&self) -> &OptimizerState {
        &self.optimizer
    }

    pub fn positional_encoding(&self) -> bool {
        self.positional_encoding
    }

    /// Summary of the most recent successful train call.
    pub fn last_summary(&self) -> Option<&TrainingSummary> {
        self.last_summary.as_ref()
    }

    pub fn total_parameter_count(&self) -> usize {
        self.params.total_count()
    }

    /// Copy of the current parameters, safe to hand to another thread.
    pub fn snapshot(&self) -> ParameterStore {
        self.params.clone()
    }

    /// Weight buffers of the dense layers, by layer index.
    pub fn dense_weights(&self) -> Vec<(usize, &[f32])> {
        self.layers
            .iter()
            .zip(&self.params.sets)
            .enumerate()
            .filter(|(_, (config, _))| matches!(config.kind, LayerKind::Dense { .. }))
            .map(|(i, (_, set))| (i, set.weights.as_slice()))
            .collect()
    }

    /// Run the network forward without dropout.
    ///
    /// Positional encoding is applied when the last training run enabled it.
    ///
    /// # Arguments
    ///
    /// * `input` - One sample, `input_size` values long
    ///
    /// # Returns
    ///
    /// The output of the last layer, or [`EngineError::Shape`] if `input`
    /// has the wrong length.
    pub fn predict(&self, input: &[f32]) -> Result<Vec<f32>> {
        let cache = self.trace(input)?;
        Ok(cache.output().to_vec())
    }

    /// Like [`Model::predict`], returning every intermediate activation.
    pub fn trace(&self, input: &[f32]) -> Result<ForwardCache> {
        if self.layers.is_empty() {
            return Err(EngineError::config("model has no layers"));
        }
        forward_pass::<StdRng>(
            &self.layers,
            &self.params,
            input,
            self.positional_encoding,
            None,
        )
    }

    /// Train on `dataset` for up to `options.epochs` epochs
    ///
    /// Runs on the calling thread. Parameters and optimizer moments carry over
    /// from earlier calls unless the optimizer kind changed.
    ///
    /// # Arguments
    ///
    /// * `dataset` - Training samples and an optional validation split
    /// * `options` - Epochs, learning rate, batch size, optimizer, loss and
    ///   the other training knobs
    ///
    /// # Returns
    ///
    /// A [`TrainingSummary`] with the per-epoch history and why training
    /// ended. A pause, resume or stop from [`Model::control`] is not an error.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use layerwise::{Dataset, Model, OptimizerKind, TrainingOptions};
    /// # let mut model: Model = todo!();
    /// # let dataset: Dataset = todo!();
    /// let options = TrainingOptions {
    ///     epochs: 200,
    ///     optimizer: OptimizerKind::AdamW,
    ///     l2: 1e-3,
    ///     ..TrainingOptions::default()
    /// };
    /// let summary = model.train(&dataset, &options)?;
    /// println!("{:?} after {} epochs", summary.stop_reason, summary.epochs_run);
    /// # Ok::<(), layerwise::EngineError>(())
    /// ```
    pub fn train(&mut self, dataset: &Dataset, options: &TrainingOptions) -> Result<TrainingSummary> {
        self.train_with(dataset, options, |_| {})
    }

    /// Train, calling `on_epoch` synchronously after every epoch.
    ///
    /// Configuration problems are reported before anything changes. A shape
    /// error part way through keeps the batches that were already applied.
    ///
    /// # Arguments
    ///
    /// * `dataset` - Training samples and an optional validation split
    /// * `options` - Training settings, see [`Model::train`]
    /// * `on_epoch` - Receives each epoch's stats and the last sample's
    ///   forward cache
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use layerwise::{Dataset, Model, TrainingLogger, TrainingOptions};
    /// # let mut model: Model = todo!();
    /// # let dataset: Dataset = todo!();
    /// let mut logger = TrainingLogger::new("run.csv")?;
    /// model.train_with(&dataset, &TrainingOptions::default(), |report| {
    ///     let _ = logger.log(report.stats);
    /// })?;
    /// # Ok::<(), layerwise::EngineError>(())
    /// ```
    pub fn train_with<F>(
        &mut self,
        dataset: &Dataset,
        options: &TrainingOptions,
        on_epoch: F,
    ) -> Result<TrainingSummary>
    where
        F: FnMut(&EpochReport<'_>),
    {
        let plan = train::plan(&self.layers, dataset, options)?;
        self.positional_encoding = options.positional_encoding;

        let summary = train::execute(
            TrainContext {
                layers: &self.layers,
                params: &mut self.params,
                optimizer: &mut self.optimizer,
                control: &self.control,
                rng: &mut self.rng,
                positional_encoding: self.positional_encoding,
            },
            plan,
            options,
            on_epoch,
        )?;

        self.last_summary = Some(summary.clone());
        Ok(summary)
    }

    /// Handle for steering training from another thread.
    pub fn control(&self) -> TrainingControl {
        self.control.clone()
    }

    pub fn state(&self) -> TrainingState {
        self.control.state()
    }

    pub fn pause(&self) {
        self.control.pause();
    }

    pub fn resume(&self) {
        self.control.resume();
    }

    pub fn stop(&self) {
        self.control.stop();
    }

    /// Re-initialize parameters from the seed and forget all training.
    ///
    /// The layers stay; optimizer moments, the last summary and any pending
    /// pause or stop requests are cleared.
    pub fn reset(&mut self) {
        self.params = ParameterStore::initialize(&self.layers, self.seed);
        let kind = self.optimizer.kind;
        self.optimizer.reset(kind);
        self.rng = StdRng::seed_from_u64(self.seed);
        self.last_summary = None;
        self.positional_encoding = false;
        self.control.clear();
        info!(layers = self.layers.len(), seed = self.seed, "model reset");
    }
}

/// Run `input` through every layer, recording activations.
///
/// `rng` is `Some` only while training.
pub(crate) fn forward_pass<R: Rng>(
    layers: &[LayerConfig],
    params: &ParameterStore,
    input: &[f32],
    positional: bool,
    mut rng: Option<&mut R>,
) -> Result<ForwardCache> {
    let mut x = input.to_vec();
    if positional {
        let n = x.len();
        for (i, v) in x.iter_mut().enumerate() {
            *v += positional_encoding(i, n);
        }
    }

    let mut cache = ForwardCache::new(x);
    for (i, (config, set)) in layers.iter().zip(&params.sets).enumerate() {
        let (output, layer_cache) =
            forward_layer(i, config, set, cache.output(), rng.as_deref_mut())?;
        cache.record(output, layer_cache);
    }
    Ok(cache)
}

/// Back-propagate `grad_output` through the layers recorded in `cache`,
/// accumulating into `grads`.
pub(crate) fn backward_pass(
    layers: &[LayerConfig],
    params: &ParameterStore,
    cache: &ForwardCache,
    grad_output: Vec<f32>,
    grads: &mut ParameterStore,
) -> Result<()> {
    if cache.num_layers() != layers.len() {
        return Err(EngineError::config(format!(
            "forward cache holds {} layers but the model has {}",
            cache.num_layers(),
            layers.len()
        )));
    }

    let mut grad = grad_output;
    for i in (0..layers.len()).rev() {
        let input = cache.layer_input(i).ok_or(EngineError::Shape {
            layer: i,
            expected: layers[i].input_size,
            actual: 0,
        })?;
        grad = backward_layer(
            i,
            &layers[i],
            &params.sets[i],
            input,
            &cache.layers[i],
            &grad,
            &mut grads.sets[i],
        )?;
    }
    Ok(())
}
