//! Error types for the Storage Reconciler
//!
//! Every failure of a collaborator (gateway, resolver, poller) is translated
//! into exactly one variant of [`Error`]. The variant decides how the caller
//! should react, see [`Error::action`].

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the reconciler
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Resolution Errors
    // =========================================================================
    #[error("{kind} '{name}' not found")]
    NotFound { kind: String, name: String },

    #[error("{kind} name '{name}' is ambiguous: {count} records match")]
    Ambiguous {
        kind: String,
        name: String,
        count: usize,
    },

    // =========================================================================
    // Policy Errors
    // =========================================================================
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Validation failed for {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("{operation} not supported for {kind}")]
    UnsupportedOperation { kind: String, operation: String },

    // =========================================================================
    // Backend Errors
    // =========================================================================
    #[error("Backend error on {operation} {path}: {message}, statusCode {status}")]
    Backend {
        operation: String,
        path: String,
        status: u16,
        message: String,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("{kind} {id} was created but a later step failed: {source}")]
    PartialCreate {
        kind: String,
        id: String,
        #[source]
        source: Box<Error>,
    },

    // =========================================================================
    // Configuration / IO Errors
    // =========================================================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action the caller's scheduler should take on error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Retry the whole operation later
    RetryAfter(Duration),
    /// Surface to the user; retrying will not help
    Abort,
}

impl Error {
    /// Build a backend error from a failed call
    pub fn backend(
        operation: impl Into<String>,
        path: impl Into<String>,
        status: u16,
        message: impl Into<String>,
    ) -> Self {
        Error::Backend {
            operation: operation.into(),
            path: path.into(),
            status,
            message: message.into(),
        }
    }

    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn unsupported(kind: impl Into<String>, operation: impl Into<String>) -> Self {
        Error::UnsupportedOperation {
            kind: kind.into(),
            operation: operation.into(),
        }
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            Error::Transport(_) | Error::Cancelled(_) => {
                ErrorAction::RetryAfter(Duration::from_secs(30))
            }
            Error::Backend { status, .. } if *status >= 500 || *status == 0 => {
                ErrorAction::RetryAfter(Duration::from_secs(30))
            }
            Error::PartialCreate { source, .. } => source.action(),
            _ => ErrorAction::Abort,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::Abort)
    }

    /// Numeric error code reported by the storage controller, if any.
    ///
    /// Controller messages carry the code as `(code 6619337)`.
    pub fn backend_code(&self) -> Option<u64> {
        match self {
            Error::Backend { message, .. } => {
                let (_, rest) = message.rsplit_once("(code ")?;
                let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
                digits.parse().ok()
            }
            Error::PartialCreate { source, .. } => source.backend_code(),
            _ => None,
        }
    }

    /// Identity of an object left behind by a failed multi-step create
    pub fn created_id(&self) -> Option<&str> {
        match self {
            Error::PartialCreate { id, .. } => Some(id),
            _ => None,
        }
    }

    /// Short user-facing summary, used as the diagnostic headline
    pub fn summary(&self) -> &'static str {
        match self {
            Error::NotFound { .. } => "resource not found",
            Error::Ambiguous { .. } => "ambiguous name reference",
            Error::InvalidState(_) => "invalid state",
            Error::Validation { .. } => "invalid field change",
            Error::UnsupportedOperation { .. } => "operation not supported",
            Error::Backend { .. } => "backend request failed",
            Error::Transport(_) => "could not reach storage controller",
            Error::Cancelled(_) => "operation cancelled",
            Error::PartialCreate { .. } => "resource partially created",
            Error::Configuration(_) => "configuration error",
            Error::Json(_) | Error::Yaml(_) => "decode error",
            Error::Io(_) => "io error",
        }
    }
}

/// Result type alias for the reconciler
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::backend("GET", "svm/svms", 503, "busy");
        assert_eq!(err.action(), ErrorAction::RetryAfter(Duration::from_secs(30)));

        let err = Error::validation("comment", "cannot be empty");
        assert_eq!(err.action(), ErrorAction::Abort);

        let err = Error::unsupported("snapmirror", "update");
        assert!(!err.is_retryable());

        let err = Error::Cancelled("deadline exceeded".into());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_backend_code() {
        let err = Error::backend(
            "POST",
            "snapmirror/relationships",
            400,
            "entry doesn't exist (code 6619337)",
        );
        assert_eq!(err.backend_code(), Some(6619337));
        assert!(err.to_string().contains("6619337"));

        let wrapped = Error::PartialCreate {
            kind: "snapmirror".into(),
            id: "abc".into(),
            source: Box::new(err),
        };
        assert_eq!(wrapped.backend_code(), Some(6619337));
        assert_eq!(wrapped.created_id(), Some("abc"));

        let err = Error::backend("GET", "svm/svms", 404, "not found");
        assert_eq!(err.backend_code(), None);
    }
}
