//! Error types for the tutoring node.
//!
//! Every component boundary translates its failures into one of the
//! subsystem enums below; the wire-visible classification is the stable
//! [`ErrorKind`] so transports never see raw error strings.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable, wire-visible error classification.
///
/// Clients and telemetry see these kinds, never the underlying error
/// messages. Variants are append-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed input: empty question, unknown subject or user.
    BadRequest,
    /// Admission refused, worker pool and queue both full.
    OverCapacity,
    /// Deadline exceeded in the queue or mid-stream.
    Timeout,
    /// Client-triggered cancellation.
    Cancelled,
    /// A port (embedder, vector store, LLM, relational store) failed
    /// after the permitted retry.
    DependencyUnavailable,
    /// Curriculum package embedding dimension does not match the active
    /// embedding backend.
    IncompatibleEmbedding,
    /// Curriculum package integrity check failed.
    ChecksumMismatch,
    /// Curriculum package or manifest is malformed.
    ParseError,
    /// Rollback requested with an empty version history.
    NoRollbackTarget,
    /// Node is draining; new admissions are refused.
    Unhealthy,
    /// Unexpected invariant violation.
    Internal,
}

impl ErrorKind {
    /// Stable string form used in telemetry histograms and wire payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::OverCapacity => "over_capacity",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::DependencyUnavailable => "dependency_unavailable",
            ErrorKind::IncompatibleEmbedding => "incompatible_embedding",
            ErrorKind::ChecksumMismatch => "checksum_mismatch",
            ErrorKind::ParseError => "parse_error",
            ErrorKind::NoRollbackTarget => "no_rollback_target",
            ErrorKind::Unhealthy => "unhealthy",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error type for the node.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Port error: {0}")]
    Port(#[from] PortError),

    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    #[error("Package error: {0}")]
    Vkp(#[from] VkpError),

    #[error("Backup error: {0}")]
    Backup(#[from] BackupError),
}

impl Error {
    /// Wire-visible classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Internal,
            Error::Port(e) => e.kind(),
            Error::Query(e) => e.kind(),
            Error::Vkp(e) => e.kind(),
            Error::Backup(_) => ErrorKind::Internal,
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures surfaced by port implementations.
///
/// Ports translate their backend-specific errors into this small set so
/// core components never depend on driver error types.
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    /// Backend is temporarily saturated; the request may be retried.
    #[error("{port} overloaded{}", retry_hint(.retry_after))]
    Overloaded {
        port: &'static str,
        retry_after: Option<Duration>,
    },

    /// Backend is unreachable or returned a non-retryable failure.
    #[error("{port} unavailable: {reason}")]
    Unavailable { port: &'static str, reason: String },

    /// The request itself was rejected as malformed.
    #[error("malformed input for {port}: {reason}")]
    MalformedInput { port: &'static str, reason: String },

    /// Storage-layer failure (corrupt tree, failed write, missing key).
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(", retry after {}ms", d.as_millis()),
        None => String::new(),
    }
}

impl PortError {
    /// Whether a single retry is permitted for this failure class.
    pub fn is_transient(&self) -> bool {
        matches!(self, PortError::Overloaded { .. })
    }

    /// Wire-visible classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PortError::MalformedInput { .. } => ErrorKind::BadRequest,
            _ => ErrorKind::DependencyUnavailable,
        }
    }
}

impl From<sled::Error> for PortError {
    fn from(e: sled::Error) -> Self {
        PortError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for PortError {
    fn from(e: serde_json::Error) -> Self {
        PortError::Serialization(e.to_string())
    }
}

/// Request-path errors surfaced to callers of `submit_query` / `cancel_query`.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("bad request: {reason}")]
    BadRequest { reason: String },

    #[error("over capacity: {queued} queued requests")]
    OverCapacity { queued: usize },

    #[error("deadline exceeded")]
    Timeout,

    #[error("cancelled by client")]
    Cancelled,

    #[error("unknown query {0}")]
    UnknownQuery(Uuid),

    #[error("{port} unavailable after retry")]
    DependencyUnavailable { port: &'static str },

    #[error("node is draining, admissions refused")]
    Unhealthy,

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl QueryError {
    /// Wire-visible classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueryError::BadRequest { .. } | QueryError::UnknownQuery(_) => ErrorKind::BadRequest,
            QueryError::OverCapacity { .. } => ErrorKind::OverCapacity,
            QueryError::Timeout => ErrorKind::Timeout,
            QueryError::Cancelled => ErrorKind::Cancelled,
            QueryError::DependencyUnavailable { .. } => ErrorKind::DependencyUnavailable,
            QueryError::Unhealthy => ErrorKind::Unhealthy,
            QueryError::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Translate a port failure on the request path.
    pub fn from_port(port: &'static str, err: PortError) -> Self {
        match err {
            PortError::MalformedInput { reason, .. } => QueryError::BadRequest { reason },
            _ => QueryError::DependencyUnavailable { port },
        }
    }
}

/// Curriculum package install/rollback errors.
#[derive(Debug, thiserror::Error)]
pub enum VkpError {
    #[error("package parse failed: {0}")]
    Parse(String),

    #[error("checksum mismatch: declared {declared}, computed {computed}")]
    ChecksumMismatch { declared: String, computed: String },

    #[error("embedding dimension {found} incompatible with active backend dimension {expected}")]
    IncompatibleEmbedding { expected: usize, found: usize },

    #[error("no rollback target for {subject} grade {grade}")]
    NoRollbackTarget { subject: String, grade: String },

    #[error("store error: {0}")]
    Store(#[from] PortError),
}

impl VkpError {
    /// Wire-visible classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            VkpError::Parse(_) => ErrorKind::ParseError,
            VkpError::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            VkpError::IncompatibleEmbedding { .. } => ErrorKind::IncompatibleEmbedding,
            VkpError::NoRollbackTarget { .. } => ErrorKind::NoRollbackTarget,
            VkpError::Store(e) => e.kind(),
        }
    }
}

/// Backup subsystem errors.
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("invalid schedule {expr:?}: {message}")]
    Schedule { expr: String, message: String },

    #[error("store error: {0}")]
    Store(#[from] PortError),

    #[error("serialization error: {0}")]
    Serialization(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable_strings() {
        assert_eq!(ErrorKind::OverCapacity.as_str(), "over_capacity");
        assert_eq!(
            ErrorKind::DependencyUnavailable.as_str(),
            "dependency_unavailable"
        );
        assert_eq!(ErrorKind::ChecksumMismatch.as_str(), "checksum_mismatch");
    }

    #[test]
    fn query_error_maps_to_kind() {
        let e = QueryError::OverCapacity { queued: 1000 };
        assert_eq!(e.kind(), ErrorKind::OverCapacity);
        assert_eq!(QueryError::Timeout.kind(), ErrorKind::Timeout);
        assert_eq!(
            QueryError::UnknownQuery(Uuid::nil()).kind(),
            ErrorKind::BadRequest
        );
    }

    #[test]
    fn transient_classes_permit_retry() {
        let overloaded = PortError::Overloaded {
            port: "embedder",
            retry_after: None,
        };
        assert!(overloaded.is_transient());
        let gone = PortError::Unavailable {
            port: "llm",
            reason: "connection refused".into(),
        };
        assert!(!gone.is_transient());
    }
}
