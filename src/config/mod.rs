mod config;

pub use config::{
    EncoderConfig, EncoderType, FreezeMode, InputLayerInit, RnnType, DEFAULT_BERT_MODEL,
    DEFAULT_MBART_MODEL,
};
