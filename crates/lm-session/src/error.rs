use thiserror::Error;

use lm_core::budget::BudgetError;
use lm_core::config::ConfigError;

/// Errors surfaced by session operations.
///
/// Validation failures (`InvalidConfiguration`, `Unsupported`) are returned
/// synchronously before any state transition or side effect. Runtime
/// failures reject the one operation that hit them without corrupting
/// history invariants; none of these is fatal to anything beyond its
/// session or request.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The requested configuration can never be satisfied by the backing
    /// model (unsupported expected inputs or languages, model unavailable).
    #[error("requested configuration cannot be satisfied: {0}")]
    Unsupported(String),

    /// Model download failed. Retryable: a later create attempt may
    /// download again.
    #[error("model download failed: {0}")]
    NetworkFailure(String),

    /// A prompt cannot fit even after maximal eviction. Not retryable
    /// without shrinking the input or starting a new session.
    #[error("prompt needs {needed} tokens but at most {available} can be made available")]
    QuotaExceeded { needed: u32, available: u32 },

    /// Caller-initiated cancellation of a create, prompt, or clone.
    #[error("operation was aborted")]
    Aborted,

    /// Structurally invalid input (misplaced system turns, partial
    /// sampling overrides, out-of-range sampling values).
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Operation attempted after the session was destroyed.
    #[error("session has been destroyed")]
    Destroyed,

    /// Input content could not be tokenized.
    #[error("input cannot be tokenized: {0}")]
    InvalidInput(String),

    /// The inference engine failed for a reason other than cancellation.
    #[error("inference backend error: {0}")]
    Backend(String),
}

impl From<ConfigError> for SessionError {
    fn from(err: ConfigError) -> Self {
        Self::InvalidConfiguration(err.to_string())
    }
}

impl From<BudgetError> for SessionError {
    fn from(err: BudgetError) -> Self {
        match err {
            BudgetError::QuotaExceeded { needed, available } => {
                Self::QuotaExceeded { needed, available }
            }
            BudgetError::UntokenizableContent { .. } => Self::InvalidInput(err.to_string()),
        }
    }
}
