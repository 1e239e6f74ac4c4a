use candle_core::{DType, Module, Tensor, Var};
use candle_nn::{LayerNorm, Linear, VarBuilder};
use std::fmt;

use super::shared::squeeze_mask;
use super::{Encoder, EncoderOutput};
use crate::config::EncoderConfig;
use crate::data::PretrainedProvider;
use crate::error::{EncoderError, Result};
use crate::model::init::input_projection;
use crate::model::params::{FreezePolicy, ParamStore, Parameter};
use crate::model::pretrained::{
    check_depth, check_hidden_size, checkpoint_store, mbart, MBartConfig, MBartEncoderStack,
};

/// Truncated pretrained mBART encoder fed with projected embeddings.
///
/// Positions come from the stack's own learned embeddings; the wrapper adds none.
pub struct MBartEncoder {
    encoder: MBartEncoderStack,
    input_layer: Linear,
    layer_norm: LayerNorm,
    hidden_size: usize,
    params: ParamStore,
}

impl MBartEncoder {
    pub fn new(
        config: &EncoderConfig,
        vb: VarBuilder<'_>,
        provider: &dyn PretrainedProvider,
    ) -> Result<Self> {
        let name = config.pretrained_name();
        let files = provider.resolve(name)?;
        let pretrained: MBartConfig = files.read_config()?;
        check_hidden_size(config.hidden_size, pretrained.d_model)?;
        check_depth(config.num_layers, pretrained.encoder_layers)?;

        let encoder_vb = vb.pp("encoder");
        let mut stack_store =
            checkpoint_store(&files, &encoder_vb, mbart::CHECKPOINT_PREFIXES)?;
        let encoder =
            MBartEncoderStack::load(encoder_vb, &mut stack_store, &pretrained, config.num_layers)?;
        stack_store.apply(&FreezePolicy::mbart(config.freeze_pretrained_mode));
        tracing::info!(
            model = name,
            mode = ?config.freeze_pretrained_mode,
            active_layers = encoder.active_layers(),
            depth = encoder.depth(),
            "loaded pretrained mBART encoder"
        );

        let mut params = ParamStore::new();
        let hidden = config.hidden_size;
        let input_layer =
            input_projection(hidden, config.input_layer_init, vb.pp("input_layer"), &mut params)?;
        let layer_norm = params.layer_norm(hidden, 1e-6, vb.pp("layer_norm"))?;
        params.absorb(stack_store);

        if config.freeze {
            tracing::info!("freezing all encoder parameters");
            params.apply(&FreezePolicy::frozen());
        }

        Ok(Self {
            encoder,
            input_layer,
            layer_norm,
            hidden_size: hidden,
            params,
        })
    }

    pub fn stack(&self) -> &MBartEncoderStack {
        &self.encoder
    }
}

impl Encoder for MBartEncoder {
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
        let (_, _, dim) = embed_src.dims3()?;
        if dim != self.hidden_size {
            return Err(EncoderError::shape("embedding size", self.hidden_size, dim));
        }
        let attention_mask = squeeze_mask(mask, embed_src)?.to_dtype(DType::F32)?;

        let x = self.input_layer.forward(embed_src)?;
        let x = self.layer_norm.forward(&x)?;

        Ok(EncoderOutput {
            sequence: self.encoder.forward_t(&x, &attention_mask, train)?,
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

impl fmt::Display for MBartEncoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MBartEncoder(num_layers={}, num_heads={})",
            self.encoder.active_layers(),
            self.encoder.config().encoder_attention_heads
        )
    }
}
