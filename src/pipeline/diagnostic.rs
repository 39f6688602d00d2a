//! Diagnostics reported by operators and execution nodes.
//!
//! Every component reports problems through a shared [`DiagnosticHandler`]
//! instead of failing silently. Errors are fatal to the node that raised
//! them; warnings and notes are informational.

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity of a diagnostic, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Note,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Note => write!(f, "note"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// A single diagnostic message with optional notes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub notes: Vec<String>,
}

impl Diagnostic {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            notes: Vec::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Severity::Error, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, message)
    }

    pub fn note(message: impl Into<String>) -> Self {
        Self::new(Severity::Note, message)
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.severity, self.message)?;
        for note in &self.notes {
            write!(f, " (note: {})", note)?;
        }
        Ok(())
    }
}

/// Sink for diagnostics shared by all nodes of a pipeline.
pub trait DiagnosticHandler: Send + Sync {
    fn emit(&self, diag: Diagnostic);
}

/// Handler that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

impl DiagnosticHandler for LoggingHandler {
    fn emit(&self, diag: Diagnostic) {
        log_diagnostic(&diag);
    }
}

/// Handler that logs and forwards every diagnostic over a channel.
#[derive(Debug, Clone)]
pub struct ChannelHandler {
    tx: Sender<Diagnostic>,
}

impl ChannelHandler {
    /// Create a handler and the receiving end of its channel.
    pub fn new() -> (Self, Receiver<Diagnostic>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }
}

impl DiagnosticHandler for ChannelHandler {
    fn emit(&self, diag: Diagnostic) {
        log_diagnostic(&diag);
        // A dropped receiver only means nobody is listening anymore.
        let _ = self.tx.send(diag);
    }
}

pub(crate) fn log_diagnostic(diag: &Diagnostic) {
    match diag.severity {
        Severity::Error => tracing::error!("{}", diag),
        Severity::Warning => tracing::warn!("{}", diag),
        Severity::Note => tracing::info!("{}", diag),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Error > Severity::Warning);
        assert!(Severity::Warning > Severity::Note);
    }

    #[test]
    fn test_display_with_notes() {
        let diag = Diagnostic::warning("cache exceeded capacity")
            .with_note("cache `a`")
            .with_note("truncated");
        assert_eq!(
            diag.to_string(),
            "warning: cache exceeded capacity (note: cache `a`) (note: truncated)"
        );
    }

    #[test]
    fn test_channel_handler_forwards() {
        let (handler, rx) = ChannelHandler::new();
        handler.emit(Diagnostic::note("hello"));
        let received = rx.try_recv().unwrap();
        assert_eq!(received.message, "hello");
        assert_eq!(received.severity, Severity::Note);
    }

    #[test]
    fn test_diagnostic_serde() {
        let diag = Diagnostic::error("boom").with_note("here");
        let json = serde_json::to_string(&diag).unwrap();
        assert!(json.contains("\"error\""));
        let back: Diagnostic = serde_json::from_str(&json).unwrap();
        assert_eq!(back, diag);
    }
}
