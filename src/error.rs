//! Error types for pose-vae.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Candle tensor/model error (shape and dimension mismatches land here).
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// Invalid configuration.
    #[error("config: {0}")]
    Config(String),

    /// A batch field required by the forward pass was not set.
    #[error("batch is missing `{0}`")]
    MissingField(&'static str),

    /// Tensor layout does not fit the requested rearrangement.
    #[error("shape: {0}")]
    Shape(String),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}
