//! Shared helpers for the integration tests.
//!
//! Tiny pretrained checkpoints are generated on the fly into a temporary directory laid
//! out like a downloaded model (`config.json` + `model.safetensors`).

#![allow(dead_code)]

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use std::path::Path;
use tempfile::TempDir;

use sign_encoders::model::params::ParamStore;
use sign_encoders::model::pretrained::{
    BertConfig, BertEncoderStack, MBartConfig, MBartEncoderStack,
};
use sign_encoders::{EncoderConfig, EncoderType};

pub const HIDDEN: usize = 8;
pub const PRETRAINED_DEPTH: usize = 3;

pub fn device() -> Device {
    Device::Cpu
}

pub fn fresh_varmap() -> VarMap {
    VarMap::new()
}

pub fn var_builder(varmap: &VarMap) -> VarBuilder<'_> {
    VarBuilder::from_varmap(varmap, DType::F32, &device())
}

/// `(batch, 1, max_len)` mask with ones at valid positions.
pub fn mask_from_lengths(lengths: &[u32], max_len: usize) -> Tensor {
    let data: Vec<u8> = lengths
        .iter()
        .flat_map(|&l| (0..max_len as u32).map(move |t| u8::from(t < l)))
        .collect();
    Tensor::from_vec(data, (lengths.len(), 1, max_len), &device()).unwrap()
}

pub fn lengths(lengths: &[u32]) -> Tensor {
    Tensor::new(lengths, &device()).unwrap()
}

pub fn random_embeddings(batch: usize, max_len: usize, dim: usize) -> Tensor {
    Tensor::randn(0f32, 1f32, (batch, max_len, dim), &device()).unwrap()
}

/// Largest absolute elementwise difference between two tensors of equal shape.
pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    assert_eq!(a.dims(), b.dims());
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .max(0)
        .unwrap()
        .to_scalar::<f32>()
        .unwrap()
}

pub fn has_nan(t: &Tensor) -> bool {
    t.flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap()
        .iter()
        .any(|v| v.is_nan())
}

pub fn tiny_bert_config() -> BertConfig {
    serde_json::from_value(serde_json::json!({
        "hidden_size": HIDDEN,
        "num_hidden_layers": PRETRAINED_DEPTH,
        "num_attention_heads": 2,
        "intermediate_size": 16,
        "hidden_act": "gelu",
        "layer_norm_eps": 1e-12,
        "hidden_dropout_prob": 0.1,
        "attention_probs_dropout_prob": 0.1
    }))
    .unwrap()
}

pub fn tiny_mbart_config() -> MBartConfig {
    serde_json::from_value(serde_json::json!({
        "d_model": HIDDEN,
        "encoder_layers": PRETRAINED_DEPTH,
        "encoder_attention_heads": 2,
        "encoder_ffn_dim": 16,
        "max_position_embeddings": 32,
        "activation_function": "gelu",
        "dropout": 0.1
    }))
    .unwrap()
}

fn write_config(dir: &Path, value: serde_json::Value) {
    std::fs::write(dir.join("config.json"), value.to_string()).unwrap();
}

/// Random BERT checkpoint stored the way full `BertModel` exports name it (`bert.encoder.`).
pub fn write_bert_checkpoint() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    let config = tiny_bert_config();
    let varmap = VarMap::new();
    let vb = var_builder(&varmap);
    let mut store = ParamStore::new();
    BertEncoderStack::load(
        vb.pp("bert").pp("encoder"),
        &mut store,
        &config,
        PRETRAINED_DEPTH,
    )
    .unwrap();
    varmap.save(dir.path().join("model.safetensors")).unwrap();
    write_config(
        dir.path(),
        serde_json::json!({
            "model_type": "bert",
            "hidden_size": config.hidden_size,
            "num_hidden_layers": config.num_hidden_layers,
            "num_attention_heads": config.num_attention_heads,
            "intermediate_size": config.intermediate_size,
            "hidden_act": "gelu"
        }),
    );
    dir
}

/// Random mBART checkpoint stored under `model.encoder.`.
pub fn write_mbart_checkpoint() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    let config = tiny_mbart_config();
    let varmap = VarMap::new();
    let vb = var_builder(&varmap);
    let mut store = ParamStore::new();
    MBartEncoderStack::load(
        vb.pp("model").pp("encoder"),
        &mut store,
        &config,
        PRETRAINED_DEPTH,
    )
    .unwrap();
    varmap.save(dir.path().join("model.safetensors")).unwrap();
    write_config(
        dir.path(),
        serde_json::json!({
            "model_type": "mbart",
            "d_model": config.d_model,
            "encoder_layers": config.encoder_layers,
            "encoder_attention_heads": config.encoder_attention_heads,
            "encoder_ffn_dim": config.encoder_ffn_dim,
            "max_position_embeddings": config.max_position_embeddings,
            "activation_function": "gelu"
        }),
    );
    dir
}

pub fn pretrained_config(
    encoder_type: EncoderType,
    dir: &TempDir,
    num_layers: usize,
) -> EncoderConfig {
    EncoderConfig {
        encoder_type,
        hidden_size: HIDDEN,
        num_layers,
        num_heads: 2,
        dropout: 0.0,
        embedding_dropout: 0.0,
        pretrained_name: Some(dir.path().to_string_lossy().to_string()),
        ..Default::default()
    }
}
