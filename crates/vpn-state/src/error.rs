//! Error types for the state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("IP pool exhausted: no available addresses in region {0}")]
    PoolExhausted(String),

    #[error("pubkey {pubkey} is already registered to another client")]
    PubkeyConflict { pubkey: String },
}

impl StateError {
    /// Whether the caller supplied bad input, as opposed to a storage failure.
    pub fn is_bad_input(&self) -> bool {
        matches!(
            self,
            StateError::InvalidInput(_) | StateError::PubkeyConflict { .. }
        )
    }
}
