use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{EncoderError, Result};

pub const DEFAULT_BERT_MODEL: &str = "bert-base-uncased";
pub const DEFAULT_MBART_MODEL: &str = "facebook/mbart-large-cc25";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderType {
    #[default]
    #[serde(alias = "rnn")]
    Recurrent,
    Transformer,
    Bert,
    Mbart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RnnType {
    #[default]
    Gru,
    Lstm,
}

/// How much of a pretrained stack is fine-tuned. Layer norms are always trainable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreezeMode {
    #[default]
    #[serde(alias = "layer_norm_only")]
    None,
    FreezeFf,
    FinetuneFf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputLayerInit {
    #[default]
    None,
    Orthogonal,
    Normal,
}

/// Options recognized by every encoder constructor. Fields a variant does not use are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    #[serde(alias = "type")]
    pub encoder_type: EncoderType,
    pub rnn_type: RnnType,
    pub hidden_size: usize,
    pub ff_size: usize,
    #[serde(alias = "emb_size", alias = "embedding_dim")]
    pub embedding_size: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    pub dropout: f32,
    #[serde(alias = "emb_dropout")]
    pub embedding_dropout: f32,
    pub bidirectional: bool,
    pub freeze: bool,
    #[serde(alias = "freeze_pt")]
    pub freeze_pretrained_mode: FreezeMode,
    pub pretrained_name: Option<String>,
    pub input_layer_init: InputLayerInit,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            encoder_type: EncoderType::Recurrent,
            rnn_type: RnnType::Gru,
            hidden_size: 512,
            ff_size: 2048,
            embedding_size: 512,
            num_layers: 1,
            num_heads: 8,
            dropout: 0.1,
            embedding_dropout: 0.1,
            bidirectional: true,
            freeze: false,
            freeze_pretrained_mode: FreezeMode::None,
            pretrained_name: None,
            input_layer_init: InputLayerInit::None,
        }
    }
}

impl EncoderConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Model identifier handed to the pretrained provider, falling back to the family default.
    pub fn pretrained_name(&self) -> &str {
        match (&self.pretrained_name, self.encoder_type) {
            (Some(name), _) => name,
            (None, EncoderType::Mbart) => DEFAULT_MBART_MODEL,
            (None, _) => DEFAULT_BERT_MODEL,
        }
    }

    /// Feature width of the sequence output.
    pub fn output_size(&self) -> usize {
        match self.encoder_type {
            EncoderType::Recurrent if self.bidirectional => 2 * self.hidden_size,
            _ => self.hidden_size,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.hidden_size == 0 {
            return Err(EncoderError::Config("hidden_size must be positive".into()));
        }
        for (name, p) in [
            ("dropout", self.dropout),
            ("embedding_dropout", self.embedding_dropout),
        ] {
            if !(0.0..1.0).contains(&p) {
                return Err(EncoderError::Config(format!(
                    "{name} must be in [0, 1), got {p}"
                )));
            }
        }

        match self.encoder_type {
            EncoderType::Recurrent => {
                if self.num_layers == 0 || self.embedding_size == 0 {
                    return Err(EncoderError::Config(
                        "recurrent encoder needs num_layers >= 1 and embedding_size >= 1".into(),
                    ));
                }
            }
            EncoderType::Transformer => {
                if self.num_layers == 0 || self.num_heads == 0 || self.ff_size == 0 {
                    return Err(EncoderError::Config(
                        "transformer encoder needs num_layers, num_heads and ff_size >= 1".into(),
                    ));
                }
                if self.hidden_size % self.num_heads != 0 {
                    return Err(EncoderError::Config(format!(
                        "hidden_size {} is not divisible by num_heads {}",
                        self.hidden_size, self.num_heads
                    )));
                }
                if self.hidden_size % 2 != 0 {
                    return Err(EncoderError::Config(format!(
                        "sinusoidal position encoding needs an even hidden_size, got {}",
                        self.hidden_size
                    )));
                }
            }
            EncoderType::Bert => {
                if self.hidden_size % 2 != 0 {
                    return Err(EncoderError::Config(format!(
                        "sinusoidal position encoding needs an even hidden_size, got {}",
                        self.hidden_size
                    )));
                }
            }
            EncoderType::Mbart => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn historical_keys_are_accepted() {
        let config = EncoderConfig::from_json_str(
            r#"{
                "type": "bert",
                "hidden_size": 768,
                "num_layers": 3,
                "emb_dropout": 0.2,
                "freeze_pt": "finetune_ff",
                "input_layer_init": "orthogonal"
            }"#,
        )
        .unwrap();
        assert_eq!(config.encoder_type, EncoderType::Bert);
        assert_eq!(config.freeze_pretrained_mode, FreezeMode::FinetuneFf);
        assert_eq!(config.input_layer_init, InputLayerInit::Orthogonal);
        assert!((config.embedding_dropout - 0.2).abs() < 1e-6);
        assert_eq!(config.pretrained_name(), DEFAULT_BERT_MODEL);
    }

    #[test]
    fn layer_norm_only_means_default_freezing() {
        let config =
            EncoderConfig::from_json_str(r#"{"type": "mbart", "freeze_pt": "layer_norm_only"}"#)
                .unwrap();
        assert_eq!(config.freeze_pretrained_mode, FreezeMode::None);
        assert_eq!(config.pretrained_name(), DEFAULT_MBART_MODEL);
    }

    #[test]
    fn transformer_heads_must_divide_hidden() {
        let err = EncoderConfig::from_json_str(
            r#"{"type": "transformer", "hidden_size": 10, "num_heads": 4}"#,
        )
        .unwrap_err();
        assert!(matches!(err, EncoderError::Config(_)));
    }

    #[test]
    fn output_size_doubles_for_bidirectional_rnn() {
        let config = EncoderConfig {
            hidden_size: 4,
            ..Default::default()
        };
        assert_eq!(config.output_size(), 8);
        let config = EncoderConfig {
            bidirectional: false,
            ..config
        };
        assert_eq!(config.output_size(), 4);
    }
}
