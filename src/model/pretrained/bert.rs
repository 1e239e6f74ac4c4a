use candle_core::{Module, Tensor};
use candle_nn::{Dropout, LayerNorm, Linear, VarBuilder};
use serde::Deserialize;

use super::HiddenAct;
use crate::error::{EncoderError, Result};
use crate::model::attention::{attend, merge_heads, split_heads};
use crate::model::params::{ParamGroup, ParamStore};
use crate::model::stack::{run_stack, truncated, StackLayer, StackableLayer};

/// Where a BERT encoder stack lives inside full-model checkpoints.
pub const CHECKPOINT_PREFIXES: &[&str] = &["encoder.", "bert.encoder."];

fn default_layer_norm_eps() -> f64 {
    1e-12
}

fn default_dropout() -> f32 {
    0.1
}

/// Subset of a BERT `config.json` the encoder stack needs.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BertConfig {
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    #[serde(default)]
    pub hidden_act: HiddenAct,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default = "default_dropout")]
    pub hidden_dropout_prob: f32,
    #[serde(default = "default_dropout")]
    pub attention_probs_dropout_prob: f32,
}

struct BertSelfAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    num_heads: usize,
    head_dim: usize,
    dropout: Dropout,
}

impl BertSelfAttention {
    fn load(vb: VarBuilder<'_>, store: &mut ParamStore, config: &BertConfig) -> Result<Self> {
        let h = config.hidden_size;
        if h % config.num_attention_heads != 0 {
            return Err(EncoderError::Config(format!(
                "hidden_size {h} is not divisible by num_attention_heads {}",
                config.num_attention_heads
            )));
        }
        let g = ParamGroup::Attention;
        Ok(Self {
            query: store.linear(h, h, vb.pp("query"), g)?,
            key: store.linear(h, h, vb.pp("key"), g)?,
            value: store.linear(h, h, vb.pp("value"), g)?,
            num_heads: config.num_attention_heads,
            head_dim: h / config.num_attention_heads,
            dropout: Dropout::new(config.attention_probs_dropout_prob),
        })
    }

    fn forward(&self, x: &Tensor, bias: &Tensor, train: bool) -> Result<Tensor> {
        let q = split_heads(&self.query.forward(x)?, self.num_heads, self.head_dim)?;
        let k = split_heads(&self.key.forward(x)?, self.num_heads, self.head_dim)?;
        let v = split_heads(&self.value.forward(x)?, self.num_heads, self.head_dim)?;
        let q = (q / (self.head_dim as f64).sqrt())?;
        merge_heads(&attend(&q, &k, &v, Some(bias), &self.dropout, train)?)
    }
}

/// Dense projection + dropout + residual + post layer norm.
struct BertSelfOutput {
    dense: Linear,
    layer_norm: LayerNorm,
    dropout: Dropout,
}

impl BertSelfOutput {
    fn load(
        vb: VarBuilder<'_>,
        store: &mut ParamStore,
        config: &BertConfig,
        in_dim: usize,
        group: ParamGroup,
    ) -> Result<Self> {
        Ok(Self {
            dense: store.linear(in_dim, config.hidden_size, vb.pp("dense"), group)?,
            layer_norm: store.layer_norm(
                config.hidden_size,
                config.layer_norm_eps,
                vb.pp("LayerNorm"),
            )?,
            dropout: Dropout::new(config.hidden_dropout_prob),
        })
    }

    fn forward(&self, x: &Tensor, residual: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.dense.forward(x)?;
        let h = self.dropout.forward(&h, train)?;
        Ok(self.layer_norm.forward(&(h + residual)?)?)
    }
}

pub struct BertLayer {
    attention: BertSelfAttention,
    attention_output: BertSelfOutput,
    intermediate: Linear,
    act: HiddenAct,
    output: BertSelfOutput,
}

impl BertLayer {
    pub fn load(vb: VarBuilder<'_>, store: &mut ParamStore, config: &BertConfig) -> Result<Self> {
        let attention_vb = vb.pp("attention");
        let attention = BertSelfAttention::load(attention_vb.pp("self"), store, config)?;
        let attention_output = BertSelfOutput::load(
            attention_vb.pp("output"),
            store,
            config,
            config.hidden_size,
            ParamGroup::Attention,
        )?;
        let intermediate = store.linear(
            config.hidden_size,
            config.intermediate_size,
            vb.pp("intermediate").pp("dense"),
            ParamGroup::Intermediate,
        )?;
        let output = BertSelfOutput::load(
            vb.pp("output"),
            store,
            config,
            config.intermediate_size,
            ParamGroup::Output,
        )?;
        Ok(Self {
            attention,
            attention_output,
            intermediate,
            act: config.hidden_act,
            output,
        })
    }
}

impl StackableLayer for BertLayer {
    fn forward_t(&self, x: &Tensor, bias: &Tensor, train: bool) -> Result<Tensor> {
        let context = self.attention.forward(x, bias, train)?;
        let attended = self.attention_output.forward(&context, x, train)?;
        let h = self.act.apply(&self.intermediate.forward(&attended)?)?;
        self.output.forward(&h, &attended, train)
    }
}

/// The `encoder` part of a BERT model, truncated to its first `keep` layers.
pub struct BertEncoderStack {
    layers: Vec<StackLayer<BertLayer>>,
    config: BertConfig,
}

impl BertEncoderStack {
    pub fn load(
        vb: VarBuilder<'_>,
        store: &mut ParamStore,
        config: &BertConfig,
        keep: usize,
    ) -> Result<Self> {
        let layer_vb = vb.pp("layer");
        let layers = truncated(config.num_hidden_layers, keep, |i| {
            BertLayer::load(layer_vb.pp(i), store, config)
        })?;
        Ok(Self {
            layers,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &BertConfig {
        &self.config
    }

    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    pub fn active_layers(&self) -> usize {
        self.layers.iter().filter(|l| l.is_active()).count()
    }

    /// `bias` is the extended `(batch, 1, 1, len)` additive attention mask.
    pub fn forward_t(&self, x: &Tensor, bias: &Tensor, train: bool) -> Result<Tensor> {
        run_stack(&self.layers, x, bias, train)
    }

    /// Run only the first `n` slots.
    pub fn forward_prefix(&self, x: &Tensor, bias: &Tensor, n: usize) -> Result<Tensor> {
        run_stack(&self.layers[..n.min(self.layers.len())], x, bias, false)
    }
}
