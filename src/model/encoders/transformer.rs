use candle_core::{Module, Tensor, Var};
use candle_nn::{Dropout, LayerNorm, VarBuilder};
use std::fmt;

use super::shared::squeeze_mask;
use super::{Encoder, EncoderOutput};
use crate::config::EncoderConfig;
use crate::error::Result;
use crate::model::attention::{additive_attention_bias, PositionalEncoding, TransformerEncoderLayer};
use crate::model::params::{FreezePolicy, ParamStore, Parameter};

/// Stack of pre-norm self-attention layers over sinusoidally position-encoded embeddings.
pub struct TransformerEncoder {
    layers: Vec<TransformerEncoderLayer>,
    layer_norm: LayerNorm,
    pe: PositionalEncoding,
    emb_dropout: Dropout,
    hidden_size: usize,
    params: ParamStore,
}

impl TransformerEncoder {
    pub fn new(config: &EncoderConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let mut params = ParamStore::new();
        let dim = config.hidden_size;

        let layers_vb = vb.pp("layers");
        let mut layers = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            layers.push(TransformerEncoderLayer::new(
                layers_vb.pp(i),
                &mut params,
                dim,
                config.ff_size,
                config.num_heads,
                config.dropout,
            )?);
        }
        let layer_norm = params.layer_norm(dim, 1e-6, vb.pp("layer_norm"))?;
        let pe = PositionalEncoding::new(dim, vb.device())?;

        if config.freeze {
            params.apply(&FreezePolicy::frozen());
        }
        tracing::info!(
            num_layers = config.num_layers,
            num_heads = config.num_heads,
            hidden_size = dim,
            freeze = config.freeze,
            "transformer encoder"
        );

        Ok(Self {
            layers,
            layer_norm,
            pe,
            emb_dropout: Dropout::new(config.embedding_dropout),
            hidden_size: dim,
            params,
        })
    }
}

impl Encoder for TransformerEncoder {
    fn output_size(&self) -> usize {
        self.hidden_size
    }

    fn forward_t(
        &self,
        embed_src: &Tensor,
        _src_length: &Tensor,
        mask: &Tensor,
        train: bool,
    ) -> Result<EncoderOutput> {
        let bias = additive_attention_bias(&squeeze_mask(mask, embed_src)?)?;

        let x = self.pe.forward(embed_src)?;
        let mut x = self.emb_dropout.forward(&x, train)?;
        for layer in &self.layers {
            x = layer.forward(&x, &bias, train)?;
        }

        Ok(EncoderOutput {
            sequence: self.layer_norm.forward(&x)?,
            summary: None,
        })
    }

    fn parameters(&self) -> &[Parameter] {
        self.params.parameters()
    }

    fn trainable_vars(&self) -> Vec<Var> {
        self.params.trainable_vars()
    }
}

impl fmt::Display for TransformerEncoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let num_heads = self.layers.first().map_or(0, |l| l.num_heads());
        write!(
            f,
            "TransformerEncoder(num_layers={}, num_heads={num_heads})",
            self.layers.len()
        )
    }
}
