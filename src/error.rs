//! Error types for the sync engine
//!
//! One taxonomy for the whole pipeline, with classification helpers that
//! drive the retry loops: transient connectivity is absorbed by reconnect,
//! recognized non-errors are logged and swallowed, and everything in the
//! data-integrity class is fatal and must stop the engine without the
//! resume position advancing.

use mongodb::error::{ErrorKind, WriteFailure};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Server error code for duplicate key violations.
const DUPLICATE_KEY: i32 = 11000;
/// Legacy duplicate key code still emitted by some topologies.
const DUPLICATE_KEY_UPDATE: i32 = 11001;
/// Server error code for updates touching an immutable (shard key) field.
const IMMUTABLE_FIELD: i32 = 66;

/// Error categories for logging and operator triage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Connection, server selection, transport
    Connection,
    /// Oplog record decoding / namespace parsing
    Decode,
    /// Destination write failures
    Write,
    /// Invalid settings
    Configuration,
    /// Replica-set status probing
    Introspection,
    /// Data-integrity violations that require operator intervention
    Integrity,
    /// Other/unknown errors
    Other,
}

/// Errors produced by the sync engine.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Driver error (connection, command, write)
    #[error("MongoDB error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    /// Raw oplog document did not decode into a record
    #[error("Decode error: {0}")]
    Decode(#[from] mongodb::bson::de::Error),

    /// Malformed namespace string
    #[error("Invalid namespace: {0}")]
    InvalidNamespace(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Replica-set introspection error (e.g. no primary)
    #[error("Introspection error: {0}")]
    Introspection(String),

    /// Operation attempted on a handle with no live connection
    #[error("Not connected")]
    NotConnected,

    /// Position persistence I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Position (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Unrecoverable condition: the engine stops rather than guess
    #[error("Fatal: {0}")]
    Fatal(String),
}

impl SyncError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an introspection error.
    pub fn introspection(msg: impl Into<String>) -> Self {
        Self::Introspection(msg.into())
    }

    /// Create a fatal error.
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Check if this error is a transient connectivity failure.
    ///
    /// Transient errors are never surfaced to the caller: every retry loop
    /// in the engine resolves them through [`crate::conn::MongoConn::reconnect`].
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Mongo(e) => is_connection_error(e),
            Self::NotConnected => true,
            _ => false,
        }
    }

    /// Check if this error must stop the engine.
    ///
    /// Fatal conditions abort the whole run without the resume position
    /// advancing, so the next run re-attempts from the same record.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    /// Check if this error is a duplicate key violation on the destination.
    pub fn is_duplicate_key(&self) -> bool {
        match self {
            Self::Mongo(e) => matches!(
                write_error_code(e),
                Some(DUPLICATE_KEY) | Some(DUPLICATE_KEY_UPDATE)
            ),
            _ => false,
        }
    }

    /// Check if this error is the destination rejecting a mutation of an
    /// immutable (shard key) field.
    pub fn is_immutable_field(&self) -> bool {
        match self {
            Self::Mongo(e) => {
                write_error_code(e) == Some(IMMUTABLE_FIELD)
                    || e.to_string().contains("immutable")
            }
            _ => false,
        }
    }

    /// Get the error category for logging.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Mongo(e) if is_connection_error(e) => ErrorCategory::Connection,
            Self::Mongo(_) => ErrorCategory::Write,
            Self::NotConnected => ErrorCategory::Connection,
            Self::Decode(_) | Self::InvalidNamespace(_) => ErrorCategory::Decode,
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Introspection(_) => ErrorCategory::Introspection,
            Self::Io(_) | Self::Json(_) => ErrorCategory::Other,
            Self::Fatal(_) => ErrorCategory::Integrity,
        }
    }
}

/// Check if a driver error is in the lost-connection class.
///
/// Covers transport failures, server selection timeouts, and pool teardown,
/// all of which resolve the same way: reconnect and retry.
pub(crate) fn is_connection_error(e: &mongodb::error::Error) -> bool {
    match &*e.kind {
        ErrorKind::Io(_) => true,
        ErrorKind::ServerSelection { .. } => true,
        ErrorKind::ConnectionPoolCleared { .. } => true,
        ErrorKind::DnsResolve { .. } => true,
        ErrorKind::Shutdown => true,
        _ => {
            // The driver labels retryable network failures on command errors.
            e.contains_label("TransientTransactionError")
                || e.to_string().contains("connection closed")
        }
    }
}

/// Extract the server error code from a single-write or command failure.
fn write_error_code(e: &mongodb::error::Error) -> Option<i32> {
    match &*e.kind {
        ErrorKind::Write(WriteFailure::WriteError(we)) => Some(we.code),
        ErrorKind::Command(ce) => Some(ce.code),
        ErrorKind::BulkWrite(fail) => fail.write_errors.values().next().map(|we| we.code),
        _ => None,
    }
}

/// Result type for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::introspection("no primary in replica set");
        assert!(err.to_string().contains("Introspection error"));
        assert!(err.to_string().contains("no primary"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(SyncError::fatal("unexpected duplicate key").is_fatal());
        assert!(!SyncError::config("bad endpoint").is_fatal());
        assert!(!SyncError::NotConnected.is_fatal());
    }

    #[test]
    fn test_transient_classification() {
        assert!(SyncError::NotConnected.is_transient());
        assert!(!SyncError::fatal("x").is_transient());
        assert!(!SyncError::config("x").is_transient());
        assert!(!SyncError::InvalidNamespace("nodot".into()).is_transient());
    }

    #[test]
    fn test_category() {
        assert_eq!(
            SyncError::NotConnected.category(),
            ErrorCategory::Connection
        );
        assert_eq!(
            SyncError::config("x").category(),
            ErrorCategory::Configuration
        );
        assert_eq!(SyncError::fatal("x").category(), ErrorCategory::Integrity);
        assert_eq!(
            SyncError::InvalidNamespace("x".into()).category(),
            ErrorCategory::Decode
        );
        assert_eq!(
            SyncError::introspection("x").category(),
            ErrorCategory::Introspection
        );
    }

    #[test]
    fn test_non_mongo_errors_are_not_write_violations() {
        assert!(!SyncError::config("x").is_duplicate_key());
        assert!(!SyncError::fatal("x").is_immutable_field());
        assert!(!SyncError::NotConnected.is_duplicate_key());
    }
}
