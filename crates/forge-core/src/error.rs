//! Structured error taxonomy for the build core.
//!
//! Every fallible operation in this crate returns [`BuildResult<T>`]. There is
//! exactly one error type, [`BuildError`]; nothing in this crate panics on a
//! recoverable condition or uses exceptions for control flow.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::graph::TargetId;

/// Convenience alias used throughout the crate.
pub type BuildResult<T> = std::result::Result<T, BuildError>;

/// Whether an error is worth retrying automatically.
///
/// Only [`RecoveryClass::Transient`] errors are handed to the retry layer
/// (see `retry.rs`); `Fatal` and `User` both terminate the owning node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryClass {
    /// Will not succeed on retry without a configuration or code change.
    Fatal,
    /// May succeed if retried (timeouts, lock contention, transient I/O).
    Transient,
    /// Caused by a mistake in user-supplied configuration or sources.
    User,
}

/// High-level category of a [`BuildError`], matching the taxonomy table in
/// the design document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Build,
    Parse,
    Analysis,
    Cache,
    Io,
    Graph,
    Language,
    System,
    Internal,
}

impl ErrorKind {
    fn default_recoverability(self) -> RecoveryClass {
        match self {
            ErrorKind::Build | ErrorKind::Graph | ErrorKind::Internal => RecoveryClass::Fatal,
            ErrorKind::Parse => RecoveryClass::User,
            ErrorKind::Analysis => RecoveryClass::Fatal,
            ErrorKind::Cache => RecoveryClass::Transient,
            ErrorKind::Io => RecoveryClass::User,
            ErrorKind::Language => RecoveryClass::Fatal,
            ErrorKind::System => RecoveryClass::Transient,
        }
    }
}

/// Tag for a structured, machine-readable remediation hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuggestionTag {
    Command,
    Documentation,
    FileCheck,
    Configuration,
    General,
}

/// A single structured suggestion attached to an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suggestion {
    pub tag: SuggestionTag,
    pub text: String,
}

impl Suggestion {
    pub fn new(tag: SuggestionTag, text: impl Into<String>) -> Self {
        Self {
            tag,
            text: text.into(),
        }
    }
}

/// Where an error occurred, when known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorContext {
    Target(TargetId),
    File(PathBuf),
    None,
}

/// The single error type returned by every fallible operation in this crate.
///
/// Carries a [`ErrorKind`], a machine-checkable `code`, optional
/// [`ErrorContext`], a chain of operation-context strings pushed by each
/// layer the error propagates through (outermost last), and zero or more
/// [`Suggestion`]s. Formatting for end users is deliberately out of scope
/// here (see spec §1) -- this type is meant to be serialized or wrapped by
/// an external presentation layer.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct BuildError {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
    pub context: ErrorContext,
    pub operation_chain: Vec<String>,
    pub suggestions: Vec<Suggestion>,
    recoverability: Option<RecoveryClass>,
}

impl BuildError {
    pub fn new(kind: ErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            context: ErrorContext::None,
            operation_chain: Vec::new(),
            suggestions: Vec::new(),
            recoverability: None,
        }
    }

    pub fn with_target(mut self, target: TargetId) -> Self {
        self.context = ErrorContext::Target(target);
        self
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.context = ErrorContext::File(path.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: Suggestion) -> Self {
        self.suggestions.push(suggestion);
        self
    }

    pub fn with_recoverability(mut self, class: RecoveryClass) -> Self {
        self.recoverability = Some(class);
        self
    }

    /// Push an operation-context frame as the error propagates upward.
    ///
    /// Call this at component boundaries (e.g. `scheduler -> executor`) so
    /// the final error reads as a trail of "while doing X, while doing Y".
    pub fn wrap(mut self, operation: impl Into<String>) -> Self {
        self.operation_chain.push(operation.into());
        self
    }

    /// The effective recoverability class: the explicit override if set,
    /// otherwise the kind's default.
    pub fn recoverability(&self) -> RecoveryClass {
        self.recoverability
            .unwrap_or_else(|| self.kind.default_recoverability())
    }

    pub fn is_transient(&self) -> bool {
        self.recoverability() == RecoveryClass::Transient
    }

    pub fn io(code: impl Into<String>, err: &std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::new(ErrorKind::Io, code, err.to_string()).with_file(path)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, "INTERNAL_INVARIANT", message)
            .with_recoverability(RecoveryClass::Fatal)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Build => "Build",
            ErrorKind::Parse => "Parse",
            ErrorKind::Analysis => "Analysis",
            ErrorKind::Cache => "Cache",
            ErrorKind::Io => "IO",
            ErrorKind::Graph => "Graph",
            ErrorKind::Language => "Language",
            ErrorKind::System => "System",
            ErrorKind::Internal => "Internal",
        };
        write!(f, "{s}")
    }
}
