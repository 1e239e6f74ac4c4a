//! Pretrained encoder stacks built in candle with checkpoint-compatible parameter names.

pub mod bert;
pub mod mbart;

use candle_core::{DType, Tensor};
use candle_nn::VarBuilder;
use serde::Deserialize;

use super::params::{CheckpointWeights, ParamStore};
use crate::data::PretrainedFiles;
use crate::error::{EncoderError, Result};

pub use bert::{BertConfig, BertEncoderStack};
pub use mbart::{MBartConfig, MBartEncoderStack};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HiddenAct {
    #[default]
    Gelu,
    #[serde(alias = "gelu_pytorch_tanh")]
    GeluNew,
    Relu,
}

impl HiddenAct {
    pub fn apply(&self, xs: &Tensor) -> Result<Tensor> {
        let ys = match self {
            Self::Gelu => xs.gelu_erf()?,
            Self::GeluNew => xs.gelu()?,
            Self::Relu => xs.relu()?,
        };
        Ok(ys)
    }
}

/// A `ParamStore` that initializes every tensor it creates from the checkpoint.
///
/// `prefixes` are the locations the stack may live at inside a full-model checkpoint.
pub(crate) fn checkpoint_store(
    files: &PretrainedFiles,
    vb: &VarBuilder<'_>,
    prefixes: &'static [&'static str],
) -> Result<ParamStore> {
    let source = files.checkpoint(DType::F32, vb.device())?;
    Ok(ParamStore::with_checkpoint(CheckpointWeights::new(
        &files.name,
        vb.prefix(),
        prefixes,
        source,
    )))
}

/// Requested depth must exist in the checkpoint.
pub(crate) fn check_depth(requested: usize, available: usize) -> Result<()> {
    if requested > available {
        return Err(EncoderError::ConfigMismatch {
            field: "num_layers",
            expected: requested.to_string(),
            found: available.to_string(),
        });
    }
    Ok(())
}

pub(crate) fn check_hidden_size(requested: usize, pretrained: usize) -> Result<()> {
    if requested != pretrained {
        return Err(EncoderError::ConfigMismatch {
            field: "hidden_size",
            expected: requested.to_string(),
            found: pretrained.to_string(),
        });
    }
    Ok(())
}
