//! Error types for the indexer.

use thiserror::Error;
use vpn_state::StateError;

/// Result type alias for indexer operations.
pub type IndexerResult<T> = Result<T, IndexerError>;

#[derive(Debug, Error)]
pub enum IndexerError {
    /// Bad settings detected at startup; the daemon cannot run.
    #[error("invalid indexer config: {0}")]
    Config(String),

    /// The chain feed failed; the process should exit and resume from the
    /// stored cursor on restart.
    #[error("pipeline failed: {0}")]
    Pipeline(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}
