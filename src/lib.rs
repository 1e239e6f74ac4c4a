//! Sequence encoders for the front end of a sign language translation model.
//!
//! Every encoder takes padded embeddings `(batch, max_len, emb)`, the valid length of each
//! sequence and a `(batch, 1, max_len)` padding mask, and returns per-step representations
//! plus, for the recurrent variant, a summary vector.

pub mod config;
pub mod data;
pub mod error;
pub mod model;

pub use config::{EncoderConfig, EncoderType, FreezeMode, InputLayerInit, RnnType};
pub use data::{AutoProvider, HubProvider, LocalProvider, PretrainedProvider};
pub use error::{EncoderError, Result};
pub use model::{build_encoder, Encoder, EncoderOutput, ParamGroup, Parameter};
