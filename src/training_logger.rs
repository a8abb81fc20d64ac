//! Training Logger
//!
//! Writes one CSV row per epoch so runs can be plotted and compared after the
//! fact, and mirrors each row as a `tracing` event.
//!
//! ## Example
//!
//! ```rust,no_run
//! use layerwise::{Model, TrainingLogger, TrainingOptions, Dataset};
//! # fn run(model: &mut Model, data: &Dataset) -> layerwise::Result<()> {
//! let mut logger = TrainingLogger::new("training_log.csv")?;
//! model.train_with(data, &TrainingOptions::default(), |report| {
//!     if let Err(e) = logger.log(report.stats) {
//!         tracing::warn!(error = %e, "could not write epoch log");
//!     }
//! })?;
//! # Ok(())
//! # }
//! ```
//!
//! ## CSV Format
//!
//! - `epoch`: Zero-based epoch index
//! - `elapsed_seconds`: Time since the logger was created
//! - `learning_rate`: Scheduled learning rate of the epoch
//! - `train_loss`: Mean per-sample training loss
//! - `val_loss`: Validation loss, empty without a validation set
//! - `metric_name`: `accuracy` or `r2`, empty without a validation set
//! - `metric_value`: Value of that metric
//!
//! Every row is flushed as soon as it is written, so a crashed run still
//! leaves a complete log up to its last epoch.

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::time::Instant;

use tracing::info;

use crate::error::Result;
use crate::train::EpochStats;

pub const CSV_HEADER: &str =
    "epoch,elapsed_seconds,learning_rate,train_loss,val_loss,metric_name,metric_value";

pub struct TrainingLogger {
    log_file: File,
    start_time: Instant,
    last_log_time: Instant,
}

impl TrainingLogger {
    /// Create the CSV file and write its header.
    pub fn new(log_path: impl AsRef<Path>) -> Result<Self> {
        let mut log_file = File::create(log_path)?;
        writeln!(log_file, "{}", CSV_HEADER)?;

        let now = Instant::now();
        Ok(Self {
            log_file,
            start_time: now,
            last_log_time: now,
        })
    }

    pub fn log(&mut self, stats: &EpochStats) -> Result<()> {
        let elapsed = self.start_time.elapsed().as_secs_f32();

        let val_loss = stats
            .val_loss
            .map(|v| format!("{:.6}", v))
            .unwrap_or_default();
        let (metric_name, metric_value) = match stats.metric {
            Some(metric) => (metric.name(), format!("{:.6}", metric.value)),
            None => ("", String::new()),
        };

        writeln!(
            self.log_file,
            "{},{:.3},{:.6},{:.6},{},{},{}",
            stats.epoch,
            elapsed,
            stats.learning_rate,
            stats.train_loss,
            val_loss,
            metric_name,
            metric_value
        )?;
        self.log_file.flush()?;

        let epoch_time = self.last_log_time.elapsed().as_secs_f32();
        info!(
            epoch = stats.epoch,
            elapsed,
            epoch_time,
            lr = stats.learning_rate,
            train_loss = stats.train_loss,
            val_loss = %val_loss,
            metric = metric_name,
            value = %metric_value,
            "epoch logged"
        );

        self.last_log_time = Instant::now();
        Ok(())
    }
}
