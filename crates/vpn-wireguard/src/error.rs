//! Error types for the WireGuard peer layer.

use std::time::Duration;

use thiserror::Error;
use vpn_state::StateError;

use crate::retry::Retryable;

pub type LedgerResult<T> = Result<T, LedgerError>;
pub type EndpointResult<T> = Result<T, EndpointError>;
pub type PeerResult<T> = Result<T, PeerError>;

/// Failures talking to the remote peer ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// A conditional write lost against a concurrent writer.
    #[error("conditional write rejected for {key}")]
    Conflict { key: String },

    #[error("gave up on {key} after {attempts} concurrent modifications")]
    RetriesExhausted { key: String, attempts: u32 },

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("ledger operation cancelled")]
    Cancelled,

    #[error("invalid ledger key: {0}")]
    InvalidKey(String),

    #[error("object store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("decode peer record {key}: {source}")]
    Decode {
        key: String,
        source: serde_json::Error,
    },

    #[error("encode peer record: {0}")]
    Encode(serde_json::Error),
}

impl Retryable for LedgerError {
    fn is_conflict(&self) -> bool {
        matches!(self, LedgerError::Conflict { .. })
    }
}

/// Failures talking to the peer-management endpoint.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("invalid endpoint URL: {0}")]
    InvalidUrl(String),

    #[error("connect to {address}: {reason}")]
    Connect { address: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("{path} answered {status}")]
    Status { path: String, status: u16 },

    #[error("decode response: {0}")]
    Decode(String),

    #[error("endpoint rejected the request: {0}")]
    Rejected(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("sign peer token: {0}")]
    Token(#[from] TokenError),
}

/// Failures loading the signing key or issuing a token.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("read signing key {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid Ed25519 PKCS#8 key: {0}")]
    Key(String),

    #[error("sign token: {0}")]
    Sign(#[from] jsonwebtoken::errors::Error),
}

/// Outcome of a peer registry operation that did not complete.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("invalid request: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("subscription has expired")]
    Expired,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("device limit reached ({limit})")]
    DeviceLimit { limit: usize },

    #[error("IP pool exhausted in region {0}")]
    PoolExhausted(String),

    #[error("server configuration incomplete: {0}")]
    Misconfigured(String),

    #[error("remote ledger: {0}")]
    Ledger(#[from] LedgerError),

    #[error("state store: {0}")]
    State(StateError),
}

impl From<StateError> for PeerError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::PoolExhausted(region) => PeerError::PoolExhausted(region),
            other => PeerError::State(other),
        }
    }
}

impl PeerError {
    /// True when the caller sent something unusable, as opposed to an
    /// internal failure.
    pub fn is_bad_input(&self) -> bool {
        match self {
            PeerError::InvalidInput(_) => true,
            PeerError::State(e) => e.is_bad_input(),
            _ => false,
        }
    }
}

/// The startup push to the peer endpoint failed for most peers.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("state store: {0}")]
    State(#[from] StateError),

    #[error("peer sync had high failure rate: {}/{} failed", .0.failed, .0.attempted)]
    HighFailureRate(crate::sync::SyncReport),
}
