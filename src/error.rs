//! Error types for the training engine.
//!
//! Only failures that abort a call are errors. Numeric anomalies inside a kernel
//! and optimizer updates that would diverge are contained where they happen and
//! reported through `tracing` warnings instead.

use thiserror::Error;

/// Errors produced while building, training, running or persisting a model.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid layer configuration, training options or dataset. Raised before
    /// any computation starts, so the model is left untouched.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An activation reached a layer with the wrong length, or the backward
    /// pass found a forward-cache entry the layer cannot use.
    #[error("shape mismatch at layer {layer}: expected {expected} values, got {actual}")]
    Shape {
        layer: usize,
        expected: usize,
        actual: usize,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A checkpoint file is truncated, has the wrong magic or disagrees with
    /// its own metadata.
    #[error("invalid checkpoint: {0}")]
    Checkpoint(String),
}

impl EngineError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        EngineError::Configuration(msg.into())
    }
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, EngineError>;
