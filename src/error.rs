//! Error types for the log shipper.

use thiserror::Error;

/// Local persistence failures.
///
/// A failed `enqueue` means the record was not logged; the caller decides
/// whether to retry or drop it.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Invalid queue format: {0}")]
    InvalidFormat(String),

    #[error("Queue is locked by another process")]
    Locked,

    #[error("A lease over {0} records is already outstanding")]
    LeaseOutstanding(usize),

    #[error("Queue is closed")]
    Closed,
}

impl From<rmp_serde::encode::Error> for StorageError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StorageError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StorageError::Deserialization(e.to_string())
    }
}

/// A failed delivery attempt. Recoverable: the batch stays queued.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("collector responded with {status}: {body}")]
    Status { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("failed to encode batch: {0}")]
    Encode(#[from] serde_json::Error),
}

impl DeliveryError {
    /// HTTP status of the failed attempt, if the collector answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            DeliveryError::Status { status, .. } => Some(*status),
            DeliveryError::Transport(e) => e.status().map(|s| s.as_u16()),
            DeliveryError::Encode(_) => None,
        }
    }
}

/// Invalid configuration, reported before any record is accepted.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("extra field {0:?} collides with a reserved record key")]
    ReservedField(String),
}

/// Main error type for shipper operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Storage(StorageError::Io(e))
    }
}

/// Result type for shipper operations.
pub type Result<T> = std::result::Result<T, Error>;
