//! Network sizing record and parameter-file persistence.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cnn::layer::LayerData;
use crate::error::{Result, SrcnnError};

/// Magic prefix of the persisted parameter file.
const PARAM_MAGIC: &[u8; 8] = b"SRCNN\x00v1";

/// Per-layer parameter initialization: a fixed seed and the normal
/// distributions the weights and bias are drawn from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LayerInit {
    pub seed: u64,
    pub weight_mean: f32,
    pub weight_stddev: f32,
    pub bias_mean: f32,
    pub bias_stddev: f32,
}

/// Network sizing and training hyperparameters. Constructed once (parsed
/// from JSON or defaulted), immutable for the pipeline's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Filter count of the first layer.
    pub n1: usize,
    /// Filter count of the second layer.
    pub n2: usize,
    /// Spatial filter sizes per layer; each must be odd.
    pub f1: usize,
    pub f2: usize,
    pub f3: usize,
    pub momentum: f32,
    pub weight_decay: f32,
    /// One learning rate per layer.
    pub learning_rate: [f32; 3],
    pub layer_init: [LayerInit; 3],
    /// Persisted-parameter file; used by the load/dump operations.
    pub parameters_file: Option<PathBuf>,
    /// Subtract the input's mean luma before the forward pass.
    pub subtract_input_mean: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            n1: 32,
            n2: 16,
            f1: 9,
            f2: 1,
            f3: 5,
            momentum: 0.9,
            weight_decay: 1e-6,
            learning_rate: [1e-4, 1e-4, 1e-5],
            layer_init: [
                LayerInit {
                    seed: 1,
                    weight_mean: 0.0,
                    weight_stddev: 0.001,
                    bias_mean: 0.0,
                    bias_stddev: 0.0,
                },
                LayerInit {
                    seed: 2,
                    weight_mean: 0.0,
                    weight_stddev: 0.001,
                    bias_mean: 0.0,
                    bias_stddev: 0.0,
                },
                LayerInit {
                    seed: 3,
                    weight_mean: 0.0,
                    weight_stddev: 0.001,
                    bias_mean: 0.0,
                    bias_stddev: 0.0,
                },
            ],
            parameters_file: None,
            subtract_input_mean: false,
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&text)
            .map_err(|e| SrcnnError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, f) in [("f1", self.f1), ("f2", self.f2), ("f3", self.f3)] {
            if f == 0 || f % 2 == 0 {
                return Err(SrcnnError::Config(format!(
                    "{name} = {f}; spatial filter sizes must be odd"
                )));
            }
        }
        if self.n1 == 0 || self.n2 == 0 {
            return Err(SrcnnError::Config(format!(
                "filter counts must be positive (n1 = {}, n2 = {})",
                self.n1, self.n2
            )));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(SrcnnError::Config(format!(
                "momentum {} outside [0, 1)",
                self.momentum
            )));
        }
        if self.learning_rate.iter().any(|lr| *lr < 0.0) || self.weight_decay < 0.0 {
            return Err(SrcnnError::Config(
                "learning rates and weight decay must be non-negative".to_string(),
            ));
        }
        Ok(())
    }

    /// Pixels lost to valid convolution across all three layers. Half of it
    /// on each side aligns the padded ground truth with the network output.
    pub fn total_padding(&self) -> usize {
        self.f1 + self.f2 + self.f3 - 3
    }

    /// The three layer descriptors this sizing record describes, with
    /// seeded random parameters.
    pub fn build_layers(&self) -> Result<[LayerData; 3]> {
        let shapes = [(1, self.n1, self.f1), (self.n1, self.n2, self.f2), (self.n2, 1, self.f3)];
        let mut layers = Vec::with_capacity(3);
        for (i, (n_prev, n_curr, f)) in shapes.into_iter().enumerate() {
            let init = &self.layer_init[i];
            layers.push(LayerData::with_random_parameters(
                n_prev,
                n_curr,
                f,
                init.seed,
                init.weight_mean,
                init.weight_stddev,
                init.bias_mean,
                init.bias_stddev,
            )?);
        }
        Ok(layers
            .try_into()
            .unwrap_or_else(|_| unreachable!("exactly three layers are built")))
    }
}

/// Writes all three layers' parameters: magic, then per layer the weight
/// tensor followed by the bias vector, f32 little-endian, in the layer's
/// filter-major layout.
pub fn dump_parameters(path: &Path, layers: &[LayerData; 3]) -> Result<()> {
    let total: usize = layers
        .iter()
        .map(|l| l.weight_size() + l.bias_size())
        .sum();
    let mut bytes = Vec::with_capacity(PARAM_MAGIC.len() + total * 4);
    bytes.extend_from_slice(PARAM_MAGIC);
    for layer in layers {
        layer.validate()?;
        for w in &layer.weights[..layer.weight_size()] {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        for b in &layer.bias[..layer.bias_size()] {
            bytes.extend_from_slice(&b.to_le_bytes());
        }
    }
    fs::write(path, bytes)?;
    info!(path = %path.display(), "dumped network parameters");
    Ok(())
}

/// Loads a parameter file into already-shaped layers. The file must carry
/// exactly the sizes the layers declare.
pub fn load_parameters(path: &Path, layers: &mut [LayerData; 3]) -> Result<()> {
    let bytes = fs::read(path)?;
    if bytes.len() < PARAM_MAGIC.len() || &bytes[..PARAM_MAGIC.len()] != PARAM_MAGIC {
        return Err(SrcnnError::Config(format!(
            "{} is not a parameter file (bad magic)",
            path.display()
        )));
    }
    let expected: usize = layers
        .iter()
        .map(|l| (l.weight_size() + l.bias_size()) * 4)
        .sum();
    if bytes.len() != PARAM_MAGIC.len() + expected {
        return Err(SrcnnError::Config(format!(
            "{} holds {} parameter bytes, network needs {}",
            path.display(),
            bytes.len() - PARAM_MAGIC.len(),
            expected
        )));
    }
    let mut cursor = PARAM_MAGIC.len();
    let mut next = |out: &mut [f32]| {
        for v in out.iter_mut() {
            let raw: [u8; 4] = bytes[cursor..cursor + 4]
                .try_into()
                .unwrap_or_else(|_| unreachable!("length checked above"));
            *v = f32::from_le_bytes(raw);
            cursor += 4;
        }
    };
    for layer in layers.iter_mut() {
        let (w, b) = (layer.weight_size(), layer.bias_size());
        next(&mut layer.weights[..w]);
        next(&mut layer.bias[..b]);
    }
    info!(path = %path.display(), "loaded network parameters");
    Ok(())
}
