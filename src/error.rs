//! Error types for the Ceph reconciler
//!
//! Provides structured error types for the reconcilers, the connection
//! registry and the backend adapters.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the reconciler
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Identifier Errors
    // =========================================================================
    #[error("Invalid identifier '{input}', expected {expected}")]
    Format {
        input: String,
        expected: &'static str,
    },

    // =========================================================================
    // Cluster Errors
    // =========================================================================
    #[error("Connection to cluster '{cluster}' failed: {reason}")]
    Connection { cluster: String, reason: String },

    // =========================================================================
    // Resource Errors
    // =========================================================================
    #[error("{kind} '{id}' does not exist")]
    NotFound { kind: String, id: String },

    #[error("Validation failed for '{id}': {reason}")]
    Validation { id: String, reason: String },

    /// The resource was created (or matched) but a later step failed. The
    /// identifier must still be recorded by the caller.
    #[error("Resource '{id}' recorded but not fully reconciled: {source}")]
    Incomplete {
        id: String,
        #[source]
        source: Box<Error>,
    },

    // =========================================================================
    // Backend Errors
    // =========================================================================
    #[error("Backend operation failed: {operation} '{target}': {reason}")]
    Backend {
        operation: String,
        target: String,
        reason: String,
    },

    #[error("Permission denied: {operation} '{target}'")]
    PermissionDenied { operation: String, target: String },

    #[error("{operation} did not succeed within {timeout:?}: {source}")]
    Timeout {
        operation: String,
        timeout: Duration,
        #[source]
        source: Box<Error>,
    },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    pub fn validation(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Validation {
            id: id.into(),
            reason: reason.into(),
        }
    }

    pub fn backend(
        operation: impl Into<String>,
        target: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Error::Backend {
            operation: operation.into(),
            target: target.into(),
            reason: reason.into(),
        }
    }

    /// Wrap an error raised after `id` was produced
    pub fn incomplete(id: impl Into<String>, source: Error) -> Self {
        Error::Incomplete {
            id: id.into(),
            source: Box::new(source),
        }
    }

    /// Identifier the caller should record despite the failure
    pub fn recorded_id(&self) -> Option<&str> {
        match self {
            Error::Incomplete { id, .. } => Some(id),
            _ => None,
        }
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Connection { .. } | Error::Backend { .. } | Error::Io(_) => {
                ErrorAction::RequeueWithBackoff
            }

            // Timeout - longer retry
            Error::Timeout { .. } => ErrorAction::RequeueAfter(Duration::from_secs(300)),

            // Referenced resource may still be on its way
            Error::NotFound { .. } => ErrorAction::RequeueAfter(Duration::from_secs(30)),

            Error::Incomplete { source, .. } => source.action(),

            // Configuration/validation errors - don't retry automatically
            Error::Configuration(_)
            | Error::Format { .. }
            | Error::Validation { .. }
            | Error::PermissionDenied { .. }
            | Error::JsonParse(_)
            | Error::YamlParse(_) => ErrorAction::NoRequeue,

            Error::Internal(_) => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Connection { .. } | Error::Backend { .. } | Error::Io(_) => true,
            Error::Incomplete { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

/// Result type alias for the reconciler
pub type Result<T> = std::result::Result<T, Error>;
