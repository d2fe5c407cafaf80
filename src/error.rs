//! Error types for feeds and document sources.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Main error type for feed operations.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Feed is closed")]
    Closed,
}

impl From<serde_json::Error> for FeedError {
    fn from(e: serde_json::Error) -> Self {
        FeedError::Deserialization(e.to_string())
    }
}

/// Classification of a document source failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceErrorKind {
    /// Security rules rejected the query.
    PermissionDenied,
    /// The request carried no valid credentials.
    Unauthenticated,
    /// The backend is temporarily unreachable.
    Unavailable,
    /// The query needs an index or is otherwise malformed.
    InvalidQuery,
    /// Anything else.
    Internal,
}

impl fmt::Display for SourceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourceErrorKind::PermissionDenied => "permission denied",
            SourceErrorKind::Unauthenticated => "unauthenticated",
            SourceErrorKind::Unavailable => "unavailable",
            SourceErrorKind::InvalidQuery => "invalid query",
            SourceErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Error delivered by a document source listener.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct SourceError {
    pub kind: SourceErrorKind,
    pub message: String,
}

impl SourceError {
    pub fn new(kind: SourceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::PermissionDenied, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::Unavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::Internal, message)
    }

    /// True when the error means the caller lost access rather than that
    /// the query itself failed.
    pub fn is_authorization_loss(&self) -> bool {
        matches!(
            self.kind,
            SourceErrorKind::PermissionDenied | SourceErrorKind::Unauthenticated
        )
    }
}

/// Result type for feed operations.
pub type Result<T> = std::result::Result<T, FeedError>;
