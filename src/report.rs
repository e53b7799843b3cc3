//! Diagnostics
//!
//! Collects what went wrong (and what merits a warning) while reconciling a
//! manifest. Each resource address gets at most one error: the first one
//! recorded wins, so a failure is never reported twice.

use crate::error::Error;
use serde::Serialize;
use std::fmt;
use tracing::{debug, error, warn};

/// Severity of a diagnostic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// One reported problem
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub summary: String,
    pub detail: String,
    /// Manifest address of the resource, if the problem is tied to one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Controller error code, when the backend reported one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<u64>,
    /// Whether rerunning the operation later may succeed
    pub retryable: bool,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.severity {
            Severity::Error => "Error",
            Severity::Warning => "Warning",
        };
        match &self.address {
            Some(address) => write!(f, "{}: {} ({}): {}", label, self.summary, address, self.detail),
            None => write!(f, "{}: {}: {}", label, self.summary, self.detail),
        }
    }
}

/// Diagnostics of one reconciliation run
#[derive(Debug, Default, Serialize)]
pub struct Diagnostics {
    items: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `err` for `address` and hand it back.
    ///
    /// Only the first error per address is kept.
    pub fn record(&mut self, address: &str, err: Error) -> Error {
        if self.has_error_for(address) {
            debug!("Ignoring further error for {}: {}", address, err);
            return err;
        }

        error!(address = %address, code = ?err.backend_code(), "{}: {}", err.summary(), err);
        self.items.push(Diagnostic {
            severity: Severity::Error,
            summary: err.summary().to_string(),
            detail: err.to_string(),
            address: Some(address.to_string()),
            code: err.backend_code(),
            retryable: err.is_retryable(),
        });
        err
    }

    pub fn warn(&mut self, address: &str, summary: impl Into<String>, detail: impl Into<String>) {
        let diagnostic = Diagnostic {
            severity: Severity::Warning,
            summary: summary.into(),
            detail: detail.into(),
            address: Some(address.to_string()),
            code: None,
            retryable: false,
        };
        warn!(address = %address, "{}: {}", diagnostic.summary, diagnostic.detail);
        self.items.push(diagnostic);
    }

    pub fn has_error_for(&self, address: &str) -> bool {
        self.errors()
            .any(|d| d.address.as_deref() == Some(address))
    }

    pub fn has_errors(&self) -> bool {
        self.errors().next().is_some()
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.items.iter().filter(|d| d.severity == Severity::Error)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether there are errors and every one of them may go away on a rerun
    pub fn all_retryable(&self) -> bool {
        self.has_errors() && self.errors().all(|d| d.retryable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_error_per_address_wins() {
        let mut diagnostics = Diagnostics::new();
        diagnostics.record(
            "snapmirror.dr",
            Error::backend("POST", "snapmirror/relationships", 400, "missing (code 6619337)"),
        );
        diagnostics.record("snapmirror.dr", Error::validation("state", "ignored"));
        diagnostics.record("svm.main", Error::unsupported("snapmirror", "update"));

        let errors: Vec<_> = diagnostics.errors().collect();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].code, Some(6619337));
        assert_eq!(errors[0].summary, "backend request failed");
        assert!(errors[0].detail.contains("6619337"));
        assert!(!diagnostics.all_retryable());
    }

    #[test]
    fn test_warnings_are_not_errors() {
        let mut diagnostics = Diagnostics::new();
        diagnostics.warn("snapmirror.dr", "initialization pending", "still uninitialized");
        assert!(!diagnostics.has_errors());
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(
            diagnostics.iter().next().unwrap().to_string(),
            "Warning: initialization pending (snapmirror.dr): still uninitialized"
        );
    }
}
