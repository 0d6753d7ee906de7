//! Error types for twisted SMC.

use thiserror::Error;

/// Result type alias for twisted SMC operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for twisted SMC.
#[derive(Error, Debug)]
pub enum Error {
    /// Scorer output or batch layout disagrees with the configured contract.
    #[error("shape mismatch for {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Every continuation of a particle has zero proposal mass.
    #[error("degenerate proposal: all continuations of particle {particle} are -inf")]
    DegenerateProposal { particle: usize },

    /// Every particle weight is zero (or not a number).
    #[error("degenerate weights: all particle log-weights are -inf")]
    DegenerateWeights,

    /// Requested method cannot run at this vocabulary/horizon size.
    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    /// Argument outside the accepted domain.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
