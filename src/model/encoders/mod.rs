pub mod bert;
pub mod mbart;
pub mod recurrent;
mod shared;
pub mod transformer;

use candle_core::{Tensor, Var};
use candle_nn::VarBuilder;
use std::fmt;

use super::params::Parameter;
use crate::config::{EncoderConfig, EncoderType};
use crate::data::PretrainedProvider;
use crate::error::Result;

pub use bert::BertEncoder;
pub use mbart::MBartEncoder;
pub use recurrent::RecurrentEncoder;
pub use transformer::TransformerEncoder;

/// Output of every encoder.
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    /// `(batch, max_len, output_size)`.
    pub sequence: Tensor,
    /// `(batch, output_size)` for the recurrent encoder, `None` otherwise.
    pub summary: Option<Tensor>,
}

/// Shared contract of the sequence encoders.
///
/// `embed_src` is `(batch, max_len, emb)`, `src_length` the rank-1 count of valid steps,
/// `mask` a `(batch, 1, max_len)` indicator that is nonzero at valid positions.
pub trait Encoder: fmt::Display {
    fn output_size(&self) -> usize;

    fn forward_t(
        &self,
        embed_src: &Tensor,
        src_length: &Tensor,
        mask: &Tensor,
        train: bool,
    ) -> Result<EncoderOutput>;

    /// Inference pass: dropout disabled.
    fn forward(
        &self,
        embed_src: &Tensor,
        src_length: &Tensor,
        mask: &Tensor,
    ) -> Result<EncoderOutput> {
        self.forward_t(embed_src, src_length, mask, false)
    }

    fn parameters(&self) -> &[Parameter];

    fn trainable_vars(&self) -> Vec<Var>;
}

/// Instantiate the encoder variant selected by `config.encoder_type`.
pub fn build_encoder(
    config: &EncoderConfig,
    vb: VarBuilder<'_>,
    provider: &dyn PretrainedProvider,
) -> Result<Box<dyn Encoder>> {
    config.validate()?;
    let encoder: Box<dyn Encoder> = match config.encoder_type {
        EncoderType::Recurrent => Box::new(RecurrentEncoder::new(config, vb)?),
        EncoderType::Transformer => Box::new(TransformerEncoder::new(config, vb)?),
        EncoderType::Bert => Box::new(BertEncoder::new(config, vb, provider)?),
        EncoderType::Mbart => Box::new(MBartEncoder::new(config, vb, provider)?),
    };
    tracing::info!(encoder = %encoder, output_size = encoder.output_size(), "encoder built");
    Ok(encoder)
}
