//! Error types for epochlog
//!
//! This module defines the common error types used throughout the system.
//! Variants map onto the status codes the protocol reports to callers
//! (`PREEMPTED`, `AGAIN`, `NOTFOUND`, ...) via [`Error::status_name`].

use crate::types::{Epoch, LogId, NodeIndex, ShardId};
use thiserror::Error;

/// Common result type for epochlog operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for epochlog
#[derive(Debug, Error)]
pub enum Error {
    // Epoch store errors
    #[error("log {0} not found")]
    NotFound(LogId),

    #[error("conditional update conflict: {0}")]
    Conflict(String),

    #[error("last clean epoch is already {current}")]
    Stale { current: Epoch },

    #[error("already up to date")]
    UpToDate,

    #[error("epoch space exhausted for log {0}")]
    TooManyEpochs(LogId),

    #[error("malformed record: {0}")]
    MalformedRecord(String),

    // Sequencer errors
    #[error("preempted by {by} in epoch {epoch}")]
    Preempted { by: NodeIndex, epoch: Epoch },

    #[error("sealed up to epoch {epoch} by {by}")]
    Sealed { epoch: Epoch, by: NodeIndex },

    #[error("deferred: {0}")]
    Deferred(String),

    #[error("failed: {0}")]
    Failed(String),

    #[error("log {0} is disabled")]
    Disabled(LogId),

    #[error("no sequencer for log {0}")]
    NoSequencer(LogId),

    #[error("sequencing is disabled on {0} by a maintenance")]
    SequencingDisabled(NodeIndex),

    #[error("quorum unavailable: {responded} of {total} shards responded")]
    QuorumUnavailable { responded: usize, total: usize },

    // Storage errors
    #[error("permanent error for log {log} on {shard}")]
    PermanentError { log: LogId, shard: ShardId },

    #[error("shard {0} is failing")]
    ShardFailing(ShardId),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Replicated state machine errors
    #[error("node not ready")]
    NodeNotReady,

    #[error("stale version: server at {server_version}, requested {requested}")]
    StaleVersion { server_version: u64, requested: u64 },

    #[error("not supported: {0}")]
    NotSupported(String),

    // Generic errors
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("request timeout")]
    Timeout,

    #[error("shutting down")]
    Shutdown,

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid parameter error
    pub fn invalid_param(msg: impl Into<String>) -> Self {
        Self::InvalidParam(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a malformed record error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedRecord(msg.into())
    }

    /// Check if the caller may retry the same operation later
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::ServiceUnavailable(_)
                | Self::Deferred(_)
                | Self::QuorumUnavailable { .. }
                | Self::NodeNotReady
                | Self::Io(_)
        )
    }

    /// Check if this error redirects the caller to another sequencer
    #[must_use]
    pub const fn is_preempted(&self) -> bool {
        matches!(self, Self::Preempted { .. } | Self::Sealed { .. })
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Protocol status name reported to clients and in logs
    #[must_use]
    pub const fn status_name(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOTFOUND",
            Self::Conflict(_) => "VERSION_MISMATCH",
            Self::Stale { .. } => "STALE",
            Self::UpToDate => "UPTODATE",
            Self::TooManyEpochs(_) => "TOOMANY",
            Self::MalformedRecord(_) => "MALFORMED_RECORD",
            Self::Preempted { .. } => "PREEMPTED",
            Self::Sealed { .. } => "SEALED",
            Self::Deferred(_) | Self::Timeout | Self::ServiceUnavailable(_) => "AGAIN",
            Self::Failed(_) => "FAILED",
            Self::Disabled(_) | Self::SequencingDisabled(_) => "DISABLED",
            Self::NoSequencer(_) => "NOSEQUENCER",
            Self::QuorumUnavailable { .. } => "NOTREADY",
            Self::PermanentError { .. } | Self::ShardFailing(_) => "LOCAL_LOG_STORE_READ",
            Self::Storage(_) | Self::Io(_) => "LOCAL_LOG_STORE_WRITE",
            Self::NodeNotReady => "NODE_NOT_READY",
            Self::StaleVersion { .. } => "STALE_VERSION",
            Self::NotSupported(_) => "NOTSUPPORTED",
            Self::InvalidParam(_) => "INVALID_PARAM",
            Self::Shutdown => "SHUTDOWN",
            Self::Internal(_)
            | Self::Configuration(_)
            | Self::Serialization(_)
            | Self::Deserialization(_) => "INTERNAL",
        }
    }

    /// Get HTTP status code for the admin API
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            // 400 Bad Request
            Self::InvalidParam(_) => 400,

            // 404 Not Found
            Self::NotFound(_) | Self::NoSequencer(_) => 404,

            // 409 Conflict
            Self::Conflict(_)
            | Self::Stale { .. }
            | Self::Preempted { .. }
            | Self::Sealed { .. }
            | Self::StaleVersion { .. } => 409,

            // 501 Not Implemented
            Self::NotSupported(_) => 501,

            // 503 Service Unavailable
            Self::Deferred(_)
            | Self::Timeout
            | Self::ServiceUnavailable(_)
            | Self::QuorumUnavailable { .. }
            | Self::NodeNotReady
            | Self::Shutdown
            | Self::Disabled(_)
            | Self::SequencingDisabled(_) => 503,

            // 500 Internal Server Error
            Self::UpToDate
            | Self::TooManyEpochs(_)
            | Self::MalformedRecord(_)
            | Self::Failed(_)
            | Self::PermanentError { .. }
            | Self::ShardFailing(_)
            | Self::Storage(_)
            | Self::Io(_)
            | Self::Internal(_)
            | Self::Configuration(_)
            | Self::Serialization(_)
            | Self::Deserialization(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(Error::Timeout.is_retryable());
        assert!(Error::Deferred("buffer full".into()).is_retryable());
        assert!(Error::NodeNotReady.is_retryable());
        assert!(!Error::conflict("version").is_retryable());
        assert!(
            !Error::Preempted {
                by: NodeIndex::new(2),
                epoch: Epoch::new(5)
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_error_preempted() {
        assert!(
            Error::Sealed {
                epoch: Epoch::new(4),
                by: NodeIndex::new(1)
            }
            .is_preempted()
        );
        assert!(!Error::Timeout.is_preempted());
    }

    #[test]
    fn test_status_names() {
        assert_eq!(Error::NotFound(LogId::new(1)).status_name(), "NOTFOUND");
        assert_eq!(Error::Deferred("x".into()).status_name(), "AGAIN");
        assert_eq!(
            Error::SequencingDisabled(NodeIndex::new(1)).status_name(),
            "DISABLED"
        );
        assert_eq!(
            Error::StaleVersion {
                server_version: 1,
                requested: 2
            }
            .status_name(),
            "STALE_VERSION"
        );
    }

    #[test]
    fn test_error_http_status() {
        assert_eq!(Error::invalid_param("x").http_status_code(), 400);
        assert_eq!(Error::NotFound(LogId::new(1)).http_status_code(), 404);
        assert_eq!(Error::NodeNotReady.http_status_code(), 503);
        assert_eq!(Error::internal("x").http_status_code(), 500);
    }
}
