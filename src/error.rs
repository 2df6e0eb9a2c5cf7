//! Error taxonomy for the capability boundary.
//!
//! Capabilities never panic or bubble raw I/O errors upward: every fault is
//! one of these variants, and orchestrators fold them back into the
//! reasoning context as data.

use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CapabilityError {
    /// Path escapes the test-source root.
    #[error("path is outside the test root: {path}")]
    OutOfScope { path: String },

    #[error("file not found: {path}")]
    NotFound { path: String },

    /// Test run exceeded its wall-clock bound.
    #[error("test run timed out after {secs}s: {selector}")]
    Timeout { selector: String, secs: u64 },

    /// Target API or reasoning engine unreachable or errored.
    #[error("external call failed: {message}")]
    ExternalCallFailure { message: String },

    #[error("candidate is not valid source: {message}")]
    SyntaxInvalid { message: String },

    /// Rollback requested for a path that was never snapshotted.
    #[error("no snapshot recorded for {}", path.display())]
    NoSnapshot { path: PathBuf },

    #[error("i/o error on {path}: {message}")]
    Io { path: String, message: String },
}

impl CapabilityError {
    pub fn out_of_scope(path: impl Into<String>) -> Self {
        Self::OutOfScope { path: path.into() }
    }

    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }

    pub fn external(message: impl Into<String>) -> Self {
        Self::ExternalCallFailure {
            message: message.into(),
        }
    }

    pub fn io(path: impl AsRef<std::path::Path>, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            return Self::not_found(path.as_ref().display().to_string());
        }
        Self::Io {
            path: path.as_ref().display().to_string(),
            message: err.to_string(),
        }
    }

    /// Short machine-friendly label, used in attempt traces and reports.
    pub fn kind(&self) -> &'static str {
        match self {
            CapabilityError::OutOfScope { .. } => "OutOfScope",
            CapabilityError::NotFound { .. } => "NotFound",
            CapabilityError::Timeout { .. } => "Timeout",
            CapabilityError::ExternalCallFailure { .. } => "ExternalCallFailure",
            CapabilityError::SyntaxInvalid { .. } => "SyntaxInvalid",
            CapabilityError::NoSnapshot { .. } => "NoSnapshot",
            CapabilityError::Io { .. } => "Io",
        }
    }
}
