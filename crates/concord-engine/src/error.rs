//! Engine error types.
//!
//! Every public operation surfaces failures through [`EngineError`].  Only the
//! structured-output repair loop recovers locally; every other layer fails
//! fast and leaves retry/backoff decisions to the caller.

use serde_json::Value;

/// Unified error type for the completion engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // -- Provider errors -----------------------------------------------------
    /// The provider returned a non-success status or the network failed.
    #[error("transport error: {reason}")]
    Transport { reason: String },

    /// A single provider request exceeded the configured per-call timeout.
    #[error("provider request timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// The adapter could not interpret a response body or stream frame.
    #[error("provider response parse error: {reason}")]
    ProviderParse { reason: String },

    // -- Round loop errors ---------------------------------------------------
    /// The function-calling loop hit its round limit without a final answer.
    #[error("function-calling loop exceeded {max_rounds} rounds")]
    RoundsExceeded {
        /// The configured bound.
        max_rounds: u32,
        /// Any assistant text seen before the bound was hit.
        partial_text: String,
    },

    /// The provider returned a function call that cannot be routed back.
    #[error("malformed function call `{name}`: {reason}")]
    MalformedFunctionCall { name: String, reason: String },

    // -- Structured output ---------------------------------------------------
    /// The model never produced output conforming to the requested shape.
    #[error("{0}")]
    StructuredOutputFailure(Box<StructuredOutputDiagnostics>),

    // -- Caller errors -------------------------------------------------------
    /// The API was used in a way that is not allowed.
    #[error("usage error: {reason}")]
    Usage { reason: String },

    /// An external cancellation signal stopped the run.
    #[error("run cancelled")]
    Cancelled,

    /// Configuration loading or validation failed.
    #[error("config error: {reason}")]
    Config { reason: String },

    // -- Serialization -------------------------------------------------------
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Catch-all for unexpected internal errors.
    #[error("internal engine error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Returns `true` for failures that happened below the model level
    /// (network, non-success status, timeout).
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Timeout { .. })
    }

    /// Returns `true` if the run was stopped by a cancellation signal.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub(crate) fn usage(reason: impl Into<String>) -> Self {
        Self::Usage {
            reason: reason.into(),
        }
    }
}

/// Convenience alias used throughout the engine crate.
pub type Result<T> = std::result::Result<T, EngineError>;

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport {
            reason: err.to_string(),
        }
    }
}

/// Everything known about a structured-output run that never validated.
#[derive(Debug, Clone, thiserror::Error)]
#[error(
    "structured output for `{shape_name}` failed after {attempts} attempt(s): {last_error}"
)]
pub struct StructuredOutputDiagnostics {
    /// Name of the requested target shape.
    pub shape_name: String,
    /// JSON schema the output was validated against.
    pub schema: Value,
    /// Raw model output from the first attempt.
    pub first_raw: String,
    /// Raw model output from the final attempt.
    pub last_raw: String,
    /// The parse error from the final attempt.
    pub last_error: String,
    /// Total attempts made (initial output plus repair rounds).
    pub attempts: u32,
}
