//! Error kinds shared across the recommender
//!
//! Errors are classified by how the loop reacts to them: configuration
//! problems are skipped per VPA, upstream failures leave the model stale
//! until the next iteration, transient failures are retried with backoff.

use thiserror::Error;

/// Errors produced by the recommender core.
#[derive(Debug, Error)]
pub enum RecommenderError {
    /// Malformed flags or annotations. Skipped per VPA; fatal only when the
    /// global configuration is unusable.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// A caller violated a precondition (negative sample, zero weight).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Orchestrator or metrics provider unreachable. The loop continues
    /// with stale data and retries next iteration.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The referenced object vanished mid-iteration.
    #[error("not found: {0}")]
    NotFound(String),

    /// Throttling or timeout; eligible for backoff within the iteration.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Invariant violation (cyclic ratio graph, inconsistent histogram).
    #[error("internal error: {0}")]
    Internal(String),
}

impl RecommenderError {
    /// Whether retrying within the same iteration can help.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RecommenderError::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, RecommenderError>;
