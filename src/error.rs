//! Thrifty error types

use std::time::Duration;

/// Thrifty error types
///
/// Errors are `Clone` because a single in-flight execution may have many
/// waiters, and each one receives its own copy of the terminal outcome.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ThriftyError {
    // Upstream errors
    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// An in-flight request exceeded its staleness bound, or a caller's
    /// wait bound elapsed.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The deduplicator was dropped before the execution published a result.
    #[error("in-flight request abandoned before completion")]
    Abandoned,

    // Data errors
    #[error("JSON error: {0}")]
    Json(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    // Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Lets executors decode upstream payloads with `?`.
impl From<serde_json::Error> for ThriftyError {
    fn from(err: serde_json::Error) -> Self {
        ThriftyError::Json(err.to_string())
    }
}

impl ThriftyError {
    /// Whether this error was synthesised by a timeout rather than
    /// reported by the upstream.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ThriftyError::Timeout(_))
    }
}

/// Result type alias for Thrifty operations
pub type Result<T> = std::result::Result<T, ThriftyError>;
