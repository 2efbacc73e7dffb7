use thiserror::Error;

pub type Result<T> = std::result::Result<T, ShellError>;

#[derive(Debug, Error)]
pub enum ShellError {
    /// Shard count does not divide heads or projection widths, or the config is inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    /// Quantization scheme, device or dtype this core cannot serve.
    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("missing weight: {0}")]
    MissingWeight(String),

    #[error("weight shape mismatch for {name}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("collective communication failed: {0}")]
    Communication(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),
}

impl ShellError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        ShellError::Config(msg.into())
    }

    pub(crate) fn unsupported(msg: impl Into<String>) -> Self {
        ShellError::Unsupported(msg.into())
    }
}
