//! Parameter bookkeeping: every tensor an encoder creates is recorded together with the
//! structural group of the sublayer that owns it, so freezing can be decided per group
//! once at construction.

use candle_core::{Shape, Tensor, Var};
use candle_nn::{init, Embedding, Init, LayerNorm, Linear, VarBuilder};
use std::collections::BTreeMap;
use std::fmt;

use crate::config::FreezeMode;
use crate::error::{EncoderError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ParamGroup {
    /// Query/key/value and attention output projections.
    Attention,
    /// BERT intermediate (expanding) feed-forward projection.
    Intermediate,
    /// BERT output (contracting) feed-forward projection.
    Output,
    /// Position-wise feed-forward projections of non-BERT stacks.
    FeedForward,
    LayerNorm,
    PositionalEmbedding,
    InputProjection,
    Recurrent,
}

impl fmt::Display for ParamGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Attention => "attention",
            Self::Intermediate => "intermediate",
            Self::Output => "output",
            Self::FeedForward => "feed_forward",
            Self::LayerNorm => "layer_norm",
            Self::PositionalEmbedding => "positional_embedding",
            Self::InputProjection => "input_projection",
            Self::Recurrent => "recurrent",
        };
        f.pad(name)
    }
}

/// Which groups stay trainable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreezePolicy {
    trainable: Vec<ParamGroup>,
}

impl FreezePolicy {
    pub fn frozen() -> Self {
        Self { trainable: vec![] }
    }

    /// Layer norms always train; the feed-forward output projection joins for `freeze_ff`
    /// and `finetune_ff`, the intermediate projection only for `finetune_ff`.
    pub fn bert(mode: FreezeMode) -> Self {
        let mut trainable = vec![ParamGroup::LayerNorm];
        if matches!(mode, FreezeMode::FreezeFf | FreezeMode::FinetuneFf) {
            trainable.push(ParamGroup::Output);
        }
        if mode == FreezeMode::FinetuneFf {
            trainable.push(ParamGroup::Intermediate);
        }
        Self { trainable }
    }

    /// Layer norms and learned positions always train; `finetune_ff` adds fc1/fc2.
    pub fn mbart(mode: FreezeMode) -> Self {
        let mut trainable = vec![ParamGroup::LayerNorm, ParamGroup::PositionalEmbedding];
        if mode == FreezeMode::FinetuneFf {
            trainable.push(ParamGroup::FeedForward);
        }
        Self { trainable }
    }

    pub fn allows(&self, group: ParamGroup) -> bool {
        self.trainable.contains(&group)
    }
}

/// One named parameter tensor of an encoder.
#[derive(Debug, Clone)]
pub struct Parameter {
    name: String,
    group: ParamGroup,
    trainable: bool,
    tensor: Tensor,
}

impl Parameter {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group(&self) -> ParamGroup {
        self.group
    }

    pub fn is_trainable(&self) -> bool {
        self.trainable
    }

    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    pub fn elem_count(&self) -> usize {
        self.tensor.elem_count()
    }
}

/// Pretrained tensors addressed relative to the root of the stack being built.
pub struct CheckpointWeights {
    model: String,
    root: String,
    prefixes: &'static [&'static str],
    source: VarBuilder<'static>,
}

impl CheckpointWeights {
    /// `root` is the `VarBuilder` prefix the stack is built under; `prefixes` are tried in
    /// order in front of the root-relative name when looking a tensor up in the checkpoint.
    pub fn new(
        model: &str,
        root: String,
        prefixes: &'static [&'static str],
        source: VarBuilder<'static>,
    ) -> Self {
        Self {
            model: model.to_string(),
            root,
            prefixes,
            source,
        }
    }

    fn lookup(&self, full_name: &str, shape: &Shape, group: ParamGroup) -> Result<Tensor> {
        let relative = match full_name.strip_prefix(self.root.as_str()) {
            Some(rest) if !self.root.is_empty() => rest.trim_start_matches('.'),
            _ => full_name,
        };
        let mut candidates = vec![relative.to_string()];
        // Checkpoints converted from TensorFlow name layer-norm parameters gamma/beta.
        if group == ParamGroup::LayerNorm {
            if let Some(stem) = relative.strip_suffix(".weight") {
                candidates.push(format!("{stem}.gamma"));
            } else if let Some(stem) = relative.strip_suffix(".bias") {
                candidates.push(format!("{stem}.beta"));
            }
        }
        for prefix in self.prefixes {
            for candidate in &candidates {
                let key = format!("{prefix}{candidate}");
                if self.source.contains_tensor(&key) {
                    return self.source.get(shape.clone(), &key).map_err(|e| {
                        EncoderError::unavailable(&self.model, format!("tensor `{key}`: {e}"))
                    });
                }
            }
        }
        Err(EncoderError::unavailable(
            &self.model,
            format!("checkpoint has no tensor for `{relative}`"),
        ))
    }
}

/// Builds layers through a `VarBuilder` while recording every created tensor.
///
/// With checkpoint weights attached, fresh variables are overwritten with the pretrained
/// values, so the caller's `VarMap` ends up holding trainable copies of the checkpoint.
#[derive(Default)]
pub struct ParamStore {
    params: Vec<Parameter>,
    checkpoint: Option<CheckpointWeights>,
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

impl ParamStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_checkpoint(checkpoint: CheckpointWeights) -> Self {
        Self {
            params: Vec::new(),
            checkpoint: Some(checkpoint),
        }
    }

    pub fn get<S: Into<Shape>>(
        &mut self,
        vb: &VarBuilder<'_>,
        shape: S,
        name: &str,
        init: Init,
        group: ParamGroup,
    ) -> Result<Tensor> {
        let shape = shape.into();
        let full_name = join(&vb.prefix(), name);
        let tensor = match &self.checkpoint {
            Some(checkpoint) => {
                let tensor = vb.get_with_hints(shape.clone(), name, Init::Const(0.))?;
                // A file-backed builder already holds this encoder's own (possibly trained)
                // weights; only fresh variables take the checkpoint values.
                if tensor.is_variable() {
                    let pretrained = checkpoint
                        .lookup(&full_name, &shape, group)?
                        .to_dtype(tensor.dtype())?
                        .to_device(tensor.device())?;
                    Var::from_tensor(&tensor)?.set(&pretrained)?;
                }
                tensor
            }
            None => vb.get_with_hints(shape, name, init)?,
        };
        self.push(full_name, group, tensor.clone());
        Ok(tensor)
    }

    /// Record a tensor some other builder (e.g. a candle recurrent layer) already created
    /// under the same name.
    pub fn register<S: Into<Shape>>(
        &mut self,
        vb: &VarBuilder<'_>,
        shape: S,
        name: &str,
        group: ParamGroup,
    ) -> Result<Tensor> {
        let tensor = vb.get(shape, name)?;
        self.push(join(&vb.prefix(), name), group, tensor.clone());
        Ok(tensor)
    }

    fn push(&mut self, name: String, group: ParamGroup, tensor: Tensor) {
        self.params.push(Parameter {
            name,
            group,
            trainable: true,
            tensor,
        });
    }

    /// Same initialization as `candle_nn::linear`.
    pub fn linear(
        &mut self,
        in_dim: usize,
        out_dim: usize,
        vb: VarBuilder<'_>,
        group: ParamGroup,
    ) -> Result<Linear> {
        let weight = self.get(
            &vb,
            (out_dim, in_dim),
            "weight",
            init::DEFAULT_KAIMING_NORMAL,
            group,
        )?;
        let bound = 1. / (in_dim as f64).sqrt();
        let bias = self.get(
            &vb,
            out_dim,
            "bias",
            Init::Uniform {
                lo: -bound,
                up: bound,
            },
            group,
        )?;
        Ok(Linear::new(weight, Some(bias)))
    }

    pub fn layer_norm(&mut self, dim: usize, eps: f64, vb: VarBuilder<'_>) -> Result<LayerNorm> {
        let weight = self.get(&vb, dim, "weight", Init::Const(1.), ParamGroup::LayerNorm)?;
        let bias = self.get(&vb, dim, "bias", Init::Const(0.), ParamGroup::LayerNorm)?;
        Ok(LayerNorm::new(weight, bias, eps))
    }

    pub fn embedding(
        &mut self,
        num_embeddings: usize,
        dim: usize,
        vb: VarBuilder<'_>,
        group: ParamGroup,
    ) -> Result<Embedding> {
        let embeddings = self.get(
            &vb,
            (num_embeddings, dim),
            "weight",
            Init::Randn {
                mean: 0.,
                stdev: 1.,
            },
            group,
        )?;
        Ok(Embedding::new(embeddings, dim))
    }

    /// Set every trainable flag from the policy. Called once, at construction.
    pub fn apply(&mut self, policy: &FreezePolicy) {
        for param in &mut self.params {
            param.trainable = policy.allows(param.group);
        }
    }

    /// Move another store's parameters (and their flags) into this one.
    pub fn absorb(&mut self, other: ParamStore) {
        self.params.extend(other.params);
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.params
    }

    /// Variables an optimizer should update. Tensors not backed by a `VarMap` are skipped.
    pub fn trainable_vars(&self) -> Vec<Var> {
        self.params
            .iter()
            .filter(|p| p.trainable && p.tensor.is_variable())
            .filter_map(|p| Var::from_tensor(&p.tensor).ok())
            .collect()
    }
}

/// (total, trainable) element counts per group.
pub fn group_summary(params: &[Parameter]) -> BTreeMap<ParamGroup, (usize, usize)> {
    let mut out = BTreeMap::new();
    for p in params {
        let entry = out.entry(p.group).or_insert((0, 0));
        entry.0 += p.elem_count();
        if p.trainable {
            entry.1 += p.elem_count();
        }
    }
    out
}
