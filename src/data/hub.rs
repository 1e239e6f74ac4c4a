//! Resolve pretrained checkpoints by name, either from the Hugging Face Hub (cached by
//! hf-hub) or from a local directory laid out the same way.

use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

use crate::error::{EncoderError, Result};

const CONFIG_FILE: &str = "config.json";
const SAFETENSORS_FILE: &str = "model.safetensors";
const PICKLE_FILE: &str = "pytorch_model.bin";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightsFormat {
    Safetensors,
    Pickle,
}

/// Local paths of a resolved pretrained model.
#[derive(Debug, Clone)]
pub struct PretrainedFiles {
    pub name: String,
    pub config: PathBuf,
    pub weights: PathBuf,
    pub format: WeightsFormat,
}

impl PretrainedFiles {
    pub fn read_config<T: DeserializeOwned>(&self) -> Result<T> {
        let text = std::fs::read_to_string(&self.config).map_err(|e| {
            EncoderError::unavailable(&self.name, format!("{}: {e}", self.config.display()))
        })?;
        serde_json::from_str(&text).map_err(|e| {
            EncoderError::unavailable(&self.name, format!("bad {CONFIG_FILE}: {e}"))
        })
    }

    /// Read-only view over the checkpoint tensors.
    pub fn checkpoint(&self, dtype: DType, device: &Device) -> Result<VarBuilder<'static>> {
        let vb = match self.format {
            // SAFETY: the checkpoint file is not modified while the encoder is being built.
            WeightsFormat::Safetensors => unsafe {
                VarBuilder::from_mmaped_safetensors(&[&self.weights], dtype, device)
            },
            WeightsFormat::Pickle => VarBuilder::from_pth(&self.weights, dtype, device),
        };
        vb.map_err(|e| {
            EncoderError::unavailable(&self.name, format!("{}: {e}", self.weights.display()))
        })
    }
}

/// Source of pretrained configurations and weights, addressed by a model identifier.
pub trait PretrainedProvider {
    fn resolve(&self, name: &str) -> Result<PretrainedFiles>;
}

/// Treats the model name as a directory containing `config.json` and the weights file.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalProvider;

impl PretrainedProvider for LocalProvider {
    fn resolve(&self, name: &str) -> Result<PretrainedFiles> {
        let dir = Path::new(name);
        if !dir.is_dir() {
            return Err(EncoderError::unavailable(name, "not a directory"));
        }
        let config = dir.join(CONFIG_FILE);
        if !config.is_file() {
            return Err(EncoderError::unavailable(
                name,
                format!("missing {CONFIG_FILE}"),
            ));
        }
        let (weights, format) = if dir.join(SAFETENSORS_FILE).is_file() {
            (dir.join(SAFETENSORS_FILE), WeightsFormat::Safetensors)
        } else if dir.join(PICKLE_FILE).is_file() {
            (dir.join(PICKLE_FILE), WeightsFormat::Pickle)
        } else {
            return Err(EncoderError::unavailable(
                name,
                format!("neither {SAFETENSORS_FILE} nor {PICKLE_FILE} found"),
            ));
        };
        Ok(PretrainedFiles {
            name: name.to_string(),
            config,
            weights,
            format,
        })
    }
}

/// Downloads once via hf-hub; later resolutions hit the hf-hub cache.
#[derive(Debug, Default, Clone, Copy)]
pub struct HubProvider;

impl PretrainedProvider for HubProvider {
    fn resolve(&self, name: &str) -> Result<PretrainedFiles> {
        use hf_hub::{Repo, RepoType};

        let api = hf_hub::api::sync::Api::new()
            .map_err(|e| EncoderError::unavailable(name, format!("hf-hub API: {e}")))?;
        let repo = api.repo(Repo::new(name.to_string(), RepoType::Model));

        tracing::info!(model = name, "fetching pretrained config");
        let config = repo
            .get(CONFIG_FILE)
            .map_err(|e| EncoderError::unavailable(name, format!("hub get {CONFIG_FILE}: {e}")))?;

        let (weights, format) = match repo.get(SAFETENSORS_FILE) {
            Ok(path) => (path, WeightsFormat::Safetensors),
            Err(e) => {
                tracing::debug!(model = name, error = %e, "no safetensors weights, trying pickle");
                let path = repo.get(PICKLE_FILE).map_err(|e| {
                    EncoderError::unavailable(name, format!("hub get weights: {e}"))
                })?;
                (path, WeightsFormat::Pickle)
            }
        };
        tracing::info!(model = name, weights = %weights.display(), "pretrained weights ready");

        Ok(PretrainedFiles {
            name: name.to_string(),
            config,
            weights,
            format,
        })
    }
}

/// Local directory when the name points at one, otherwise the Hub.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoProvider;

impl PretrainedProvider for AutoProvider {
    fn resolve(&self, name: &str) -> Result<PretrainedFiles> {
        if Path::new(name).is_dir() {
            LocalProvider.resolve(name)
        } else {
            HubProvider.resolve(name)
        }
    }
}
