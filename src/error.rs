//! Error types shared across the pipeline.
//!
//! Errors fall into three groups:
//!
//! - **Validation** -- a structurally unusable input (too few messages, too few
//!   trajectories for a group, an out-of-range dropout rate). The orchestrator
//!   logs and skips the offending unit; these are never retried.
//! - **Dependency** -- an external collaborator (inference server, coordination
//!   service) failed or answered with a non-2xx status. Retried within a bounded
//!   budget, then fatal for the run.
//! - **Infrastructure** -- I/O, serialization, tensor and tokenizer failures.

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("trajectory {trajectory_id} has only {count} messages (need 3+)")]
    InsufficientMessages { trajectory_id: String, count: usize },

    #[error("need 2+ trajectories for GRPO {stage}, got {count}")]
    InsufficientGroup { stage: &'static str, count: usize },

    #[error("dropout_rate must be within 0.0-0.5, got {0}")]
    InvalidDropoutRate(f64),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("{service} request failed: {message}")]
    Dependency { service: &'static str, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),
}

impl Error {
    /// Whether this error marks a structurally unusable input that should be
    /// skipped rather than retried.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InsufficientMessages { .. }
                | Error::InsufficientGroup { .. }
                | Error::InvalidDropoutRate(_)
                | Error::Validation(_)
        )
    }

    /// Whether a failed external call may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Dependency { .. } => true,
            Error::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }
}
