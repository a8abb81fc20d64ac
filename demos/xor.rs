//! Train a Small Network on XOR
//!
//! The classic non-linearly-separable toy problem: two inputs, one output,
//! a hidden relu layer in between.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --release --example xor
//!
//! # Different optimizer and schedule via CLI flags
//! cargo run --release --example xor -- --optimizer rmsprop --lr 0.01 --epochs 2000
//!
//! # Full options from JSON, epoch log to CSV, model saved at the end
//! cargo run --release --example xor -- --config xor.json --log xor.csv --save xor.lwck
//! ```
//!
//! Set `RUST_LOG=layerwise=debug` to see layer and optimizer events.

use clap::{Parser, ValueEnum};
use layerwise::{
    Activation, Dataset, LayerConfig, Model, OptimizerKind, Sample, TrainingLogger,
    TrainingOptions,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "xor", about = "Train a two-layer network on XOR")]
struct Args {
    /// Number of epochs
    #[arg(long, default_value = "500")]
    epochs: usize,

    /// Learning rate
    #[arg(long, default_value = "0.05")]
    lr: f32,

    /// Optimizer
    #[arg(long, value_enum, ignore_case = true, default_value_t = OptimizerArg::Adam)]
    optimizer: OptimizerArg,

    /// Seed for weight initialization, shuffling and dropout
    #[arg(long, default_value = "1")]
    seed: u64,

    /// Hidden layer width
    #[arg(long, default_value = "4")]
    hidden: usize,

    /// Training options as JSON (overrides --epochs, --lr and --optimizer)
    #[arg(long)]
    config: Option<String>,

    /// Write a CSV row per epoch to this path
    #[arg(long)]
    log: Option<String>,

    /// Save the trained model to this path
    #[arg(long)]
    save: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OptimizerArg {
    Sgd,
    Rmsprop,
    Adam,
    Adamw,
}

impl From<OptimizerArg> for OptimizerKind {
    fn from(arg: OptimizerArg) -> Self {
        match arg {
            OptimizerArg::Sgd => OptimizerKind::Sgd,
            OptimizerArg::Rmsprop => OptimizerKind::RmsProp,
            OptimizerArg::Adam => OptimizerKind::Adam,
            OptimizerArg::Adamw => OptimizerKind::AdamW,
        }
    }
}

fn main() -> layerwise::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let options = match &args.config {
        Some(path) => TrainingOptions::from_json(&std::fs::read_to_string(path)?)?,
        None => TrainingOptions {
            epochs: args.epochs,
            learning_rate: args.lr,
            batch_size: 4,
            optimizer: args.optimizer.into(),
            ..TrainingOptions::default()
        },
    };

    let mut model = Model::with_seed(2, args.seed);
    model
        .add_layer(LayerConfig::dense(2, args.hidden, Activation::Relu))?
        .add_layer(LayerConfig::dense(args.hidden, 1, Activation::None))?;
    info!(
        parameters = model.total_parameter_count(),
        optimizer = options.optimizer.name(),
        "model built"
    );

    let dataset = Dataset::new(vec![
        Sample::new(vec![0.0, 0.0], vec![0.0]),
        Sample::new(vec![0.0, 1.0], vec![1.0]),
        Sample::new(vec![1.0, 0.0], vec![1.0]),
        Sample::new(vec![1.0, 1.0], vec![0.0]),
    ]);

    let mut logger = args.log.as_deref().map(TrainingLogger::new).transpose()?;
    let summary = model.train_with(&dataset, &options, |report| {
        if let Some(logger) = logger.as_mut() {
            if let Err(e) = logger.log(report.stats) {
                warn!(error = %e, "could not write epoch log");
            }
        }
    })?;

    println!(
        "\nfinished after {} epochs ({:?}), final loss {:.6}",
        summary.epochs_run, summary.stop_reason, summary.final_loss
    );
    for sample in &dataset.train {
        let output = model.predict(&sample.input)?;
        println!(
            "  {:?} -> {:.4} (target {})",
            sample.input, output[0], sample.output[0]
        );
    }

    if let Some(path) = &args.save {
        model.save(path)?;
        println!("model saved to {}", path);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optimizer_flag() {
        let args = Args::try_parse_from(["xor"]).unwrap();
        assert_eq!(OptimizerKind::from(args.optimizer), OptimizerKind::Adam);

        let args = Args::try_parse_from(["xor", "--optimizer", "AdamW"]).unwrap();
        assert_eq!(OptimizerKind::from(args.optimizer), OptimizerKind::AdamW);

        let args = Args::try_parse_from(["xor", "--optimizer", "rmsprop"]).unwrap();
        assert_eq!(OptimizerKind::from(args.optimizer), OptimizerKind::RmsProp);

        assert!(Args::try_parse_from(["xor", "--optimizer", "lbfgs"]).is_err());
    }
}
