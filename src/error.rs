//! Error handling for slipstream
//!
//! This module defines the crate-wide error type and a Result alias. Errors
//! are `Clone` because a node's exit reason is broadcast to its peers and to
//! the supervising executor.

use crate::pipeline::diagnostic::Diagnostic;
use crate::pipeline::id::NodeId;
use thiserror::Error;

/// Main error type for pipeline operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// Contract violations: double pull, buffer overflow, double start
    #[error("logic error: {0}")]
    Logic(String),

    /// Adjacent operators disagree on the element type between them
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// A fatal diagnostic raised by an operator
    #[error("{0}")]
    Diagnostic(Diagnostic),

    /// The previous execution node terminated irregularly
    #[error("upstream failed: {0}")]
    UpstreamFailed(Diagnostic),

    /// IO errors
    #[error("IO error: {0}")]
    Io(String),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Errors reported by the cache subsystem
    #[error("cache error: {0}")]
    Cache(String),

    /// A node of a running pipeline terminated with an error
    #[error("{node} `{operator}` failed: {reason}")]
    NodeFailed {
        node: NodeId,
        operator: String,
        reason: Diagnostic,
    },

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<PipelineError>,
    },
}

impl PipelineError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        PipelineError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    pub fn logic(message: impl Into<String>) -> Self {
        PipelineError::Logic(message.into())
    }

    /// Whether this error is a contract violation.
    pub fn is_logic(&self) -> bool {
        match self {
            PipelineError::Logic(_) => true,
            PipelineError::WithContext { source, .. } => source.is_logic(),
            _ => false,
        }
    }

    /// Whether this error is a type mismatch, seen through any context.
    pub fn is_type_mismatch(&self) -> bool {
        match self {
            PipelineError::TypeMismatch(_) => true,
            PipelineError::WithContext { source, .. } => source.is_type_mismatch(),
            _ => false,
        }
    }

    /// Convert into the diagnostic a node reports when it terminates.
    pub fn to_diagnostic(&self) -> Diagnostic {
        match self {
            PipelineError::Diagnostic(diag) | PipelineError::UpstreamFailed(diag) => diag.clone(),
            PipelineError::NodeFailed { reason, .. } => reason.clone(),
            other => Diagnostic::error(other.to_string()),
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Io(err.to_string())
    }
}

impl From<Diagnostic> for PipelineError {
    fn from(diag: Diagnostic) -> Self {
        PipelineError::Diagnostic(diag)
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Serialization(err.to_string())
    }
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, std::io::Error> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| PipelineError::from(e).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| PipelineError::from(e).with_context(f()))
    }
}
