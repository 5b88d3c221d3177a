//! Error taxonomy for the listener.
//!
//! Per-event and per-iteration errors ([TransportError], [MalformedLogError], [SinkError]) are
//! contained inside the scan loop. Only [PersistenceError] and [ConfigurationError] are fatal,
//! surfacing from the coordinator as [ScanError].

use std::time::Duration;
use thiserror::Error;

/// Ledger unreachable or returned something unusable.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("RPC error: {0}")]
    Rpc(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("ledger call timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid block range: from {from} > to {to}")]
    InvalidRange { from: u64, to: u64 },
}

/// A raw log is missing a required field or a field does not parse.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed log: {reason}")]
pub struct MalformedLogError {
    pub reason: String,
}

impl MalformedLogError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Sink delivery outcome errors.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Timeouts, connection failures, 5xx-class answers. Retried.
    #[error("transient delivery failure: {0}")]
    Delivery(String),
    /// 4xx-class answers. Never retried; the event is marked processed.
    #[error("sink rejected event (status {status}): {body}")]
    Rejected { status: u16, body: String },
}

impl SinkError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SinkError::Delivery(_))
    }
}

/// Checkpoint could not be read or written.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to read state file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write state file '{path}': {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to rename '{from}' to '{to}': {source}")]
    Rename {
        from: String,
        to: String,
        #[source]
        source: std::io::Error,
    },
    #[error("state file is corrupt: {0}")]
    Corrupt(String),
    #[error("failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Bad or missing settings, or a state file from an unknown schema version.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("missing required setting: {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("unsupported state file version {found} (expected {expected})")]
    UnsupportedStateVersion { found: u64, expected: u64 },
}

/// Errors that end a single iteration without advancing the cursor.
#[derive(Debug, Error)]
pub enum IterationError {
    #[error("ledger unavailable after {attempts} attempts: {source}")]
    Transport {
        attempts: u32,
        #[source]
        source: TransportError,
    },
    #[error("delivery of tx {tx_hash} failed after {attempts} attempts: {source}")]
    Delivery {
        tx_hash: String,
        attempts: u32,
        #[source]
        source: SinkError,
    },
}

/// Fatal errors: the process must stop and wait for an operator.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}
