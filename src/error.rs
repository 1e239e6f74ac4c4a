use thiserror::Error;

#[derive(Error, Debug)]
pub enum EncoderError {
    // --- Configuration ---
    #[error("Configuration mismatch on `{field}`: expected {expected}, pretrained model has {found}")]
    ConfigMismatch {
        field: &'static str,
        expected: String,
        found: String,
    },

    #[error("Invalid encoder configuration: {0}")]
    Config(String),

    // --- Forward preconditions ---
    #[error("Shape mismatch for {what}: expected {expected}, got {found}")]
    ShapeMismatch {
        what: &'static str,
        expected: String,
        found: String,
    },

    // --- Pretrained resources ---
    #[error("Pretrained model `{name}` unavailable: {reason}")]
    PretrainedUnavailable { name: String, reason: String },

    // --- Wrapped ---
    #[error("Tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EncoderError>;

impl EncoderError {
    /// Requested configuration or input shapes disagree with what the model expects.
    pub fn is_config_mismatch(&self) -> bool {
        matches!(self, Self::ConfigMismatch { .. } | Self::ShapeMismatch { .. })
    }

    pub(crate) fn shape(what: &'static str, expected: impl ToString, found: impl ToString) -> Self {
        Self::ShapeMismatch {
            what,
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }

    pub(crate) fn unavailable(name: &str, reason: impl ToString) -> Self {
        Self::PretrainedUnavailable {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }
}
