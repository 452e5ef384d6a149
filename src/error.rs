//! Error types for the sync store and its streaming clients.

use crate::connection::ConnectionState;
use crate::types::RecordId;
use thiserror::Error;

/// Main error type for store and client operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Record not found: {collection}/{id}")]
    NotFound { collection: String, id: RecordId },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Connection failed after {attempts} reconnect attempts")]
    ConnectionFailed { attempts: u32 },

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Cannot {action} while {from:?}")]
    InvalidTransition {
        from: ConnectionState,
        action: &'static str,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

impl SyncError {
    /// Shorthand for a missing record.
    pub fn not_found(collection: impl Into<String>, id: &RecordId) -> Self {
        SyncError::NotFound {
            collection: collection.into(),
            id: id.clone(),
        }
    }

    /// Whether the caller can recover without manual intervention.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            SyncError::ConnectionFailed { .. } | SyncError::InvalidTransition { .. }
        )
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for SyncError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for SyncError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        SyncError::Deserialization(e.to_string())
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
