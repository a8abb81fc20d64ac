//! Layerwise: A Small Neural-Network Training Engine
//!
//! Stack layers, train them with hand-derived backpropagation, and run them
//! forward. Every gradient in the crate is written out by hand next to the
//! forward computation it belongs to; there is no autodiff graph.
//!
//! # Modules
//!
//! - [`layers`] - Dense, layer norm, attention, dropout and softmax kernels
//! - [`params`] - Per-layer parameter buffers and seeded initialization
//! - [`cache`] - Per-sample forward cache consumed by the backward pass
//! - [`optimizer`] - SGD, RMSProp, Adam and AdamW
//! - [`gradients`] - Batch averaging, clamping and gradient norms
//! - [`loss`] - Loss functions and validation metrics
//! - [`data`] - Samples and train/validation splits
//! - [`train`] - Training options, schedules and the epoch loop
//! - [`control`] - Pause, resume and stop from another thread
//! - [`model`] - The [`Model`] facade tying it all together
//! - [`checkpoint`] - Binary save and load
//! - [`training_logger`] - CSV epoch log
//!
//! # Example
//!
//! ```rust,no_run
//! use layerwise::{Activation, Dataset, LayerConfig, LossKind, Model, Sample, TrainingOptions};
//!
//! let mut model = Model::with_seed(2, 1);
//! model.add_layer(LayerConfig::dense(2, 8, Activation::Tanh))?;
//! model.add_layer(LayerConfig::dense(8, 2, Activation::None))?;
//! model.add_layer(LayerConfig::softmax(2))?;
//!
//! let data = Dataset::split(
//!     vec![
//!         Sample::new(vec![0.0, 0.0], vec![1.0, 0.0]),
//!         Sample::new(vec![1.0, 1.0], vec![0.0, 1.0]),
//!     ],
//!     0.0,
//! );
//! let options = TrainingOptions {
//!     loss: LossKind::CrossEntropy,
//!     ..TrainingOptions::quick()
//! };
//! model.train(&data, &options)?;
//! let probabilities = model.predict(&[1.0, 1.0])?;
//! # Ok::<(), layerwise::EngineError>(())
//! ```

pub mod cache;
pub mod checkpoint;
pub mod control;
pub mod data;
pub mod error;
pub mod gradients;
pub mod layers;
pub mod loss;
pub mod math;
pub mod model;
pub mod optimizer;
pub mod params;
pub mod train;
pub mod training_logger;

// Re-export main types for convenience
pub use cache::ForwardCache;
pub use checkpoint::Checkpoint;
pub use control::{TrainingControl, TrainingState};
pub use data::{Dataset, Sample};
pub use error::{EngineError, Result};
pub use layers::{Activation, LayerConfig, LayerKind, WeightInit};
pub use loss::{LossKind, MetricKind};
pub use model::Model;
pub use optimizer::{OptimizerKind, OptimizerState};
pub use params::{ParameterSet, ParameterStore};
pub use train::{
    EpochReport, EpochStats, LrSchedule, Metric, StopReason, TrainingOptions, TrainingSummary,
};
pub use training_logger::TrainingLogger;
