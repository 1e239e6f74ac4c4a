use candle_core::{DType, Module, Tensor};
use candle_nn::{Dropout, Embedding, LayerNorm, Linear, VarBuilder};
use serde::Deserialize;

use super::HiddenAct;
use crate::error::{EncoderError, Result};
use crate::model::attention::{additive_attention_bias, attend, merge_heads, split_heads};
use crate::model::params::{ParamGroup, ParamStore};
use crate::model::stack::{run_stack, truncated, StackLayer, StackableLayer};

/// Where an mBART encoder lives inside full-model checkpoints.
pub const CHECKPOINT_PREFIXES: &[&str] = &["encoder.", "model.encoder."];

/// mBART learned positions are stored shifted by two slots.
const POSITION_OFFSET: usize = 2;
const LAYER_NORM_EPS: f64 = 1e-5;

fn default_max_positions() -> usize {
    1024
}

fn default_dropout() -> f32 {
    0.1
}

/// Subset of an mBART `config.json` the encoder needs.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MBartConfig {
    #[serde(alias = "hidden_size")]
    pub d_model: usize,
    pub encoder_layers: usize,
    pub encoder_attention_heads: usize,
    pub encoder_ffn_dim: usize,
    #[serde(default = "default_max_positions")]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub activation_function: HiddenAct,
    #[serde(default = "default_dropout")]
    pub dropout: f32,
    #[serde(default)]
    pub attention_dropout: f32,
    #[serde(default)]
    pub activation_dropout: f32,
}

struct MBartAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    dropout: Dropout,
}

impl MBartAttention {
    fn load(vb: VarBuilder<'_>, store: &mut ParamStore, config: &MBartConfig) -> Result<Self> {
        let d = config.d_model;
        if d % config.encoder_attention_heads != 0 {
            return Err(EncoderError::Config(format!(
                "d_model {d} is not divisible by encoder_attention_heads {}",
                config.encoder_attention_heads
            )));
        }
        let g = ParamGroup::Attention;
        Ok(Self {
            q_proj: store.linear(d, d, vb.pp("q_proj"), g)?,
            k_proj: store.linear(d, d, vb.pp("k_proj"), g)?,
            v_proj: store.linear(d, d, vb.pp("v_proj"), g)?,
            out_proj: store.linear(d, d, vb.pp("out_proj"), g)?,
            num_heads: config.encoder_attention_heads,
            head_dim: d / config.encoder_attention_heads,
            dropout: Dropout::new(config.attention_dropout),
        })
    }

    fn forward(&self, x: &Tensor, bias: &Tensor, train: bool) -> Result<Tensor> {
        let scaling = (self.head_dim as f64).powf(-0.5);
        let q = (self.q_proj.forward(x)? * scaling)?;
        let q = split_heads(&q, self.num_heads, self.head_dim)?;
        let k = split_heads(&self.k_proj.forward(x)?, self.num_heads, self.head_dim)?;
        let v = split_heads(&self.v_proj.forward(x)?, self.num_heads, self.head_dim)?;
        let context = merge_heads(&attend(&q, &k, &v, Some(bias), &self.dropout, train)?)?;
        Ok(self.out_proj.forward(&context)?)
    }
}

/// Pre-norm encoder layer.
pub struct MBartEncoderLayer {
    self_attn: MBartAttention,
    self_attn_layer_norm: LayerNorm,
    fc1: Linear,
    fc2: Linear,
    final_layer_norm: LayerNorm,
    act: HiddenAct,
    dropout: Dropout,
    activation_dropout: Dropout,
}

impl MBartEncoderLayer {
    pub fn load(vb: VarBuilder<'_>, store: &mut ParamStore, config: &MBartConfig) -> Result<Self> {
        let d = config.d_model;
        let ff = ParamGroup::FeedForward;
        Ok(Self {
            self_attn: MBartAttention::load(vb.pp("self_attn"), store, config)?,
            self_attn_layer_norm: store.layer_norm(
                d,
                LAYER_NORM_EPS,
                vb.pp("self_attn_layer_norm"),
            )?,
            fc1: store.linear(d, config.encoder_ffn_dim, vb.pp("fc1"), ff)?,
            fc2: store.linear(config.encoder_ffn_dim, d, vb.pp("fc2"), ff)?,
            final_layer_norm: store.layer_norm(d, LAYER_NORM_EPS, vb.pp("final_layer_norm"))?,
            act: config.activation_function,
            dropout: Dropout::new(config.dropout),
            activation_dropout: Dropout::new(config.activation_dropout),
        })
    }
}

impl StackableLayer for MBartEncoderLayer {
    fn forward_t(&self, x: &Tensor, bias: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.self_attn_layer_norm.forward(x)?;
        let h = self.self_attn.forward(&h, bias, train)?;
        let x = (self.dropout.forward(&h, train)? + x)?;

        let h = self.final_layer_norm.forward(&x)?;
        let h = self.act.apply(&self.fc1.forward(&h)?)?;
        let h = self.activation_dropout.forward(&h, train)?;
        let h = self.fc2.forward(&h)?;
        Ok((self.dropout.forward(&h, train)? + x)?)
    }
}

/// mBART encoder fed with embeddings instead of token ids, truncated to `keep` layers.
pub struct MBartEncoderStack {
    embed_positions: Embedding,
    layernorm_embedding: LayerNorm,
    layers: Vec<StackLayer<MBartEncoderLayer>>,
    layer_norm: LayerNorm,
    dropout: Dropout,
    config: MBartConfig,
}

impl MBartEncoderStack {
    pub fn load(
        vb: VarBuilder<'_>,
        store: &mut ParamStore,
        config: &MBartConfig,
        keep: usize,
    ) -> Result<Self> {
        let d = config.d_model;
        let embed_positions = store.embedding(
            config.max_position_embeddings + POSITION_OFFSET,
            d,
            vb.pp("embed_positions"),
            ParamGroup::PositionalEmbedding,
        )?;
        let layernorm_embedding =
            store.layer_norm(d, LAYER_NORM_EPS, vb.pp("layernorm_embedding"))?;
        let layers_vb = vb.pp("layers");
        let layers = truncated(config.encoder_layers, keep, |i| {
            MBartEncoderLayer::load(layers_vb.pp(i), store, config)
        })?;
        let layer_norm = store.layer_norm(d, LAYER_NORM_EPS, vb.pp("layer_norm"))?;

        Ok(Self {
            embed_positions,
            layernorm_embedding,
            layers,
            layer_norm,
            dropout: Dropout::new(config.dropout),
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &MBartConfig {
        &self.config
    }

    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    pub fn active_layers(&self) -> usize {
        self.layers.iter().filter(|l| l.is_active()).count()
    }

    fn embed(&self, inputs_embeds: &Tensor, train: bool) -> Result<Tensor> {
        let (_, t, _) = inputs_embeds.dims3()?;
        if t > self.config.max_position_embeddings {
            return Err(EncoderError::shape(
                "sequence length",
                format!("<= {}", self.config.max_position_embeddings),
                t,
            ));
        }
        let positions = Tensor::arange(
            POSITION_OFFSET as u32,
            (t + POSITION_OFFSET) as u32,
            inputs_embeds.device(),
        )?;
        let pos = self.embed_positions.forward(&positions)?;
        let h = inputs_embeds.broadcast_add(&pos.to_dtype(inputs_embeds.dtype())?)?;
        let h = self.layernorm_embedding.forward(&h)?;
        Ok(self.dropout.forward(&h, train)?)
    }

    /// `attention_mask` is the float `(batch, len)` mask, 1 at valid positions.
    pub fn forward_t(
        &self,
        inputs_embeds: &Tensor,
        attention_mask: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let bias = additive_attention_bias(&attention_mask.to_dtype(DType::F32)?)?;
        let h = self.embed(inputs_embeds, train)?;
        let h = run_stack(&self.layers, &h, &bias, train)?;
        Ok(self.layer_norm.forward(&h)?)
    }

    /// Embedding stage, the first `n` slots, then the final layer norm.
    pub fn forward_prefix(
        &self,
        inputs_embeds: &Tensor,
        attention_mask: &Tensor,
        n: usize,
    ) -> Result<Tensor> {
        let bias = additive_attention_bias(&attention_mask.to_dtype(DType::F32)?)?;
        let h = self.embed(inputs_embeds, false)?;
        let h = run_stack(&self.layers[..n.min(self.layers.len())], &h, &bias, false)?;
        Ok(self.layer_norm.forward(&h)?)
    }
}
