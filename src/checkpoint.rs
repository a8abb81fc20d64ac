//! Model Checkpointing
//!
//! A checkpoint captures everything needed to resume a model exactly where it
//! left off: layer configs, parameters, optimizer moments and step counter,
//! the positional-encoding flag, the seed and the last training summary.
//!
//! ## File Format
//!
//! ```text
//! "LWCK"                      4 bytes magic
//! version                     1 byte
//! metadata length             u32 LE
//! metadata                    JSON (layers, seed, optimizer kind, step, ...)
//! per layer, per group:       weights, bias, gamma, beta
//!     length                  u32 LE
//!     values                  f32 LE
//! per moment layer, per group, per buffer:   m, v, s
//!     length                  u32 LE
//!     values                  f32 LE
//! ```
//!
//! Floats are stored as raw little-endian bits, so a round trip reproduces
//! every buffer bit for bit and predictions are identical after loading.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{EngineError, Result};
use crate::layers::LayerConfig;
use crate::model::Model;
use crate::optimizer::{GroupMoments, LayerMoments, OptimizerKind, OptimizerState};
use crate::params::{ParamGroup, ParameterSet, ParameterStore};
use crate::train::TrainingSummary;

pub const MAGIC: &[u8; 4] = b"LWCK";
pub const FORMAT_VERSION: u8 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointMetadata {
    input_size: usize,
    seed: u64,
    positional_encoding: bool,
    layers: Vec<LayerConfig>,
    optimizer: OptimizerKind,
    step: u64,
    moment_layers: usize,
    moment_signature: Vec<[usize; 4]>,
    summary: Option<TrainingSummary>,
}

/// Complete saved state of a [`Model`].
#[derive(Clone, Debug, PartialEq)]
pub struct Checkpoint {
    pub input_size: usize,
    pub seed: u64,
    pub positional_encoding: bool,
    pub layers: Vec<LayerConfig>,
    pub params: ParameterStore,
    pub optimizer: OptimizerState,
    pub summary: Option<TrainingSummary>,
}

impl Checkpoint {
    pub fn from_model(model: &Model) -> Self {
        Self {
            input_size: model.input_size(),
            seed: model.seed(),
            positional_encoding: model.positional_encoding(),
            layers: model.layers().to_vec(),
            params: model.snapshot(),
            optimizer: model.optimizer().clone(),
            summary: model.last_summary().cloned(),
        }
    }

    /// Rebuild the model, re-validating the layer chain.
    pub fn into_model(self) -> Result<Model> {
        Model::from_parts(
            self.input_size,
            self.seed,
            self.layers,
            self.params,
            self.optimizer,
            self.positional_encoding,
            self.summary,
        )
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let metadata = CheckpointMetadata {
            input_size: self.input_size,
            seed: self.seed,
            positional_encoding: self.positional_encoding,
            layers: self.layers.clone(),
            optimizer: self.optimizer.kind,
            step: self.optimizer.t,
            moment_layers: self.optimizer.layers.len(),
            moment_signature: self.optimizer.signature.clone(),
            summary: self.summary.clone(),
        };
        let metadata_json = serde_json::to_vec(&metadata)?;

        let mut out = Vec::new();
        out.write_all(MAGIC)?;
        out.write_all(&[FORMAT_VERSION])?;
        write_len(&mut out, metadata_json.len())?;
        out.write_all(&metadata_json)?;

        for set in &self.params.sets {
            for group in ParamGroup::ALL {
                write_buffer(&mut out, set.group(group))?;
            }
        }
        for layer in &self.optimizer.layers {
            for group in ParamGroup::ALL {
                let moments = layer.group(group);
                write_buffer(&mut out, &moments.m)?;
                write_buffer(&mut out, &moments.v)?;
                write_buffer(&mut out, &moments.s)?;
            }
        }
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(bytes);

        if reader.take(MAGIC.len())? != MAGIC {
            return Err(EngineError::Checkpoint(
                "invalid header, expected LWCK".to_string(),
            ));
        }
        let version = reader.take(1)?[0];
        if version != FORMAT_VERSION {
            return Err(EngineError::Checkpoint(format!(
                "unsupported format version {}",
                version
            )));
        }

        let metadata_len = reader.read_len()?;
        let metadata: CheckpointMetadata = serde_json::from_slice(reader.take(metadata_len)?)?;

        let mut params = ParameterStore::new();
        for _ in &metadata.layers {
            let mut set = ParameterSet::default();
            for group in ParamGroup::ALL {
                *set.group_mut(group) = reader.buffer()?;
            }
            params.push(set);
        }

        check_moment_layout(&metadata, &params)?;

        let mut moment_layers = Vec::new();
        for sizes in &metadata.moment_signature {
            let mut layer = LayerMoments::default();
            for (group, &size) in ParamGroup::ALL.into_iter().zip(sizes) {
                let moments = GroupMoments {
                    m: reader.buffer()?,
                    v: reader.buffer()?,
                    s: reader.buffer()?,
                };
                if [&moments.m, &moments.v, &moments.s]
                    .iter()
                    .any(|buf| !buf.is_empty() && buf.len() != size)
                {
                    return Err(EngineError::Checkpoint(format!(
                        "moment buffer for {:?} of layer {} does not hold {} values",
                        group,
                        moment_layers.len(),
                        size
                    )));
                }
                *layer.group_mut(group) = moments;
            }
            moment_layers.push(layer);
        }

        if !reader.is_empty() {
            return Err(EngineError::Checkpoint(format!(
                "{} unexpected trailing bytes",
                reader.remaining()
            )));
        }

        Ok(Self {
            input_size: metadata.input_size,
            seed: metadata.seed,
            positional_encoding: metadata.positional_encoding,
            layers: metadata.layers,
            params,
            optimizer: OptimizerState {
                kind: metadata.optimizer,
                t: metadata.step,
                layers: moment_layers,
                signature: metadata.moment_signature,
            },
            summary: metadata.summary,
        })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let bytes = self.to_bytes()?;
        let mut file = File::create(path.as_ref())?;
        file.write_all(&bytes)?;
        info!(
            path = %path.as_ref().display(),
            bytes = bytes.len(),
            layers = self.layers.len(),
            step = self.optimizer.t,
            "checkpoint saved"
        );
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let mut bytes = Vec::new();
        File::open(path.as_ref())?.read_to_end(&mut bytes)?;
        let checkpoint = Self::from_bytes(&bytes)?;
        info!(
            path = %path.as_ref().display(),
            layers = checkpoint.layers.len(),
            step = checkpoint.optimizer.t,
            "checkpoint loaded"
        );
        Ok(checkpoint)
    }
}

impl Model {
    /// Write the model, optimizer state included, to `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        Checkpoint::from_model(self).save(path)
    }

    /// Load a model written by [`Model::save`]
    ///
    /// # Arguments
    ///
    /// * `path` - Checkpoint file
    ///
    /// # Returns
    ///
    /// The model with its parameters, optimizer moments and step counter
    /// restored bit for bit. Training can continue where it left off.
    /// Truncated or inconsistent files give [`EngineError::Checkpoint`].
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use layerwise::Model;
    /// let model = Model::load("xor.lwck")?;
    /// let output = model.predict(&[1.0, 0.0])?;
    /// # Ok::<(), layerwise::EngineError>(())
    /// ```
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Checkpoint::load(path)?.into_model()
    }
}

fn write_len(out: &mut Vec<u8>, len: usize) -> Result<()> {
    let len = u32::try_from(len)
        .map_err(|_| EngineError::Checkpoint(format!("buffer of {} values is too large", len)))?;
    out.write_all(&len.to_le_bytes())?;
    Ok(())
}

fn write_buffer(out: &mut Vec<u8>, values: &[f32]) -> Result<()> {
    write_len(out, values.len())?;
    for v in values {
        out.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

/// Moments cover a prefix of the layers, one signature entry per moment
/// layer, each matching the parameters it was built for.
fn check_moment_layout(metadata: &CheckpointMetadata, params: &ParameterStore) -> Result<()> {
    if metadata.moment_layers != metadata.moment_signature.len() {
        return Err(EngineError::Checkpoint(format!(
            "{} moment layers but a signature for {}",
            metadata.moment_layers,
            metadata.moment_signature.len()
        )));
    }
    if metadata.moment_layers > metadata.layers.len() {
        return Err(EngineError::Checkpoint(format!(
            "{} moment layers for a {}-layer model",
            metadata.moment_layers,
            metadata.layers.len()
        )));
    }
    let actual = params.signature();
    if let Some(layer) = metadata
        .moment_signature
        .iter()
        .zip(&actual)
        .position(|(saved, found)| saved != found)
    {
        return Err(EngineError::Checkpoint(format!(
            "moment layout of layer {} does not match its parameters",
            layer
        )));
    }
    Ok(())
}

struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(EngineError::Checkpoint(format!(
                "truncated at byte {}, needed {} more",
                self.pos, n
            )));
        }
        let bytes = self.bytes;
        let slice = &bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_len(&mut self) -> Result<usize> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(raw) as usize)
    }

    fn buffer(&mut self) -> Result<Vec<f32>> {
        let len = self.read_len()?;
        let byte_len = len
            .checked_mul(4)
            .ok_or_else(|| EngineError::Checkpoint(format!("buffer length {} overflows", len)))?;
        Ok(self
            .take(byte_len)?
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Dataset, Sample};
    use crate::layers::Activation;
    use crate::train::TrainingOptions;

    fn trained_model() -> Model {
        let mut model = Model::with_seed(2, 5);
        model
            .add_layer(LayerConfig::dense(2, 3, Activation::Gelu))
            .unwrap()
            .add_layer(LayerConfig::layer_norm(3))
            .unwrap()
            .add_layer(LayerConfig::dense(3, 1, Activation::Sigmoid))
            .unwrap();
        let data = Dataset::new(vec![
            Sample::new(vec![0.0, 1.0], vec![1.0]),
            Sample::new(vec![1.0, 0.0], vec![0.0]),
        ]);
        let options = TrainingOptions {
            epochs: 4,
            batch_size: 2,
            positional_encoding: true,
            ..TrainingOptions::default()
        };
        model.train(&data, &options).unwrap();
        model
    }

    #[test]
    fn test_bytes_round_trip() {
        let model = trained_model();
        let checkpoint = Checkpoint::from_model(&model);
        let bytes = checkpoint.to_bytes().unwrap();
        assert_eq!(&bytes[..4], MAGIC);

        let restored = Checkpoint::from_bytes(&bytes).unwrap();
        assert_eq!(restored, checkpoint);
        assert_eq!(restored.optimizer.t, 4);
        assert!(restored.optimizer.moment_count() > 0);

        let reloaded = restored.into_model().unwrap();
        assert!(reloaded.positional_encoding());
        assert_eq!(
            reloaded.predict(&[0.3, 0.7]).unwrap(),
            model.predict(&[0.3, 0.7]).unwrap()
        );
    }

    #[test]
    fn test_rejects_bad_header_and_version() {
        let bytes = Checkpoint::from_model(&trained_model()).to_bytes().unwrap();

        let mut bad_magic = bytes.clone();
        bad_magic[0] = b'X';
        assert!(matches!(
            Checkpoint::from_bytes(&bad_magic),
            Err(EngineError::Checkpoint(_))
        ));

        let mut bad_version = bytes;
        bad_version[4] = 9;
        assert!(matches!(
            Checkpoint::from_bytes(&bad_version),
            Err(EngineError::Checkpoint(_))
        ));
    }

    #[test]
    fn test_rejects_truncated_and_trailing_bytes() {
        let bytes = Checkpoint::from_model(&trained_model()).to_bytes().unwrap();
        assert!(Checkpoint::from_bytes(&bytes[..bytes.len() - 3]).is_err());

        let mut longer = bytes;
        longer.push(0);
        assert!(Checkpoint::from_bytes(&longer).is_err());
    }

    /// Re-encode `bytes` with its JSON metadata changed by `edit`.
    fn edit_metadata(bytes: &[u8], edit: impl FnOnce(&mut serde_json::Value)) -> Vec<u8> {
        let header = MAGIC.len() + 1;
        let len = u32::from_le_bytes(bytes[header..header + 4].try_into().unwrap()) as usize;
        let start = header + 4;
        let mut metadata: serde_json::Value =
            serde_json::from_slice(&bytes[start..start + len]).unwrap();
        edit(&mut metadata);

        let json = serde_json::to_vec(&metadata).unwrap();
        let mut out = bytes[..header].to_vec();
        out.extend_from_slice(&(json.len() as u32).to_le_bytes());
        out.extend_from_slice(&json);
        out.extend_from_slice(&bytes[start + len..]);
        out
    }

    #[test]
    fn test_edited_metadata_still_loads() {
        let bytes = Checkpoint::from_model(&trained_model()).to_bytes().unwrap();
        let same = edit_metadata(&bytes, |_| {});
        assert!(Checkpoint::from_bytes(&same).is_ok());
    }

    #[test]
    fn test_rejects_inflated_moment_count() {
        let bytes = Checkpoint::from_model(&trained_model()).to_bytes().unwrap();
        for count in [usize::MAX / 2, 4, 0] {
            let hostile = edit_metadata(&bytes, |m| m["moment_layers"] = count.into());
            assert!(matches!(
                Checkpoint::from_bytes(&hostile),
                Err(EngineError::Checkpoint(_))
            ));
        }

        // A signature longer than the model is rejected even when it agrees
        // with the moment count.
        let hostile = edit_metadata(&bytes, |m| {
            m["moment_layers"] = 4.into();
            m["moment_signature"]
                .as_array_mut()
                .unwrap()
                .push(serde_json::json!([0, 0, 0, 0]));
        });
        assert!(matches!(
            Checkpoint::from_bytes(&hostile),
            Err(EngineError::Checkpoint(_))
        ));
    }

    #[test]
    fn test_rejects_moment_signature_mismatch() {
        let bytes = Checkpoint::from_model(&trained_model()).to_bytes().unwrap();
        let hostile = edit_metadata(&bytes, |m| m["moment_signature"][0][0] = 7.into());
        assert!(matches!(
            Checkpoint::from_bytes(&hostile),
            Err(EngineError::Checkpoint(_))
        ));
    }

    #[test]
    fn test_mismatched_buffers_rejected() {
        let mut checkpoint = Checkpoint::from_model(&trained_model());
        checkpoint.params.sets[0].weights.pop();
        assert!(matches!(
            checkpoint.into_model(),
            Err(EngineError::Checkpoint(_))
        ));
    }
}
