// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Categorized error type shared by every engine crate.
//!
//! Every public operation in this workspace returns `Result<T, BuildError>`
//! rather than `Result<T, String>`: callers that need to decide whether to
//! retry, fail the build, or surface a message to a human can do so from
//! `BuildError::recoverability()` without re-deriving it from a message
//! string.

use std::fmt;
use std::io;

mod kind;
#[cfg(test)]
mod kind_tests;
#[cfg(test)]
mod lib_tests;

pub use kind::{ErrorCategory, ErrorKind};

/// How a caller should react to a [`BuildError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Recoverability {
    /// Retry with back-off; the same input may succeed on a later attempt.
    Transient,
    /// User/configuration mistake. Stop and surface clearly; do not retry.
    User,
    /// Not recoverable. Abort the affected action (or the whole build).
    Fatal,
}

impl fmt::Display for Recoverability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Transient => "transient",
            Self::User => "user",
            Self::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// A single breadcrumb in an error's context trail, cheapest-first: the
/// innermost call site pushes first, outer call sites append as the error
/// propagates up.
pub type ContextTrail = Vec<String>;

/// The engine's unified error type.
///
/// Construct with [`BuildError::new`], then chain `.context(..)` and
/// `.suggest(..)` as the error is returned up the call stack.
pub struct BuildError {
    kind: ErrorKind,
    message: String,
    context: ContextTrail,
    suggestions: Vec<String>,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl BuildError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        BuildError {
            kind,
            message: message.into(),
            context: Vec::new(),
            suggestions: Vec::new(),
            source: None,
        }
    }

    /// Append a breadcrumb describing where this error was observed or
    /// rethrown. Call sites closer to the failure should call this before
    /// the error is returned further up.
    pub fn context(mut self, breadcrumb: impl Into<String>) -> Self {
        self.context.push(breadcrumb.into());
        self
    }

    /// Attach a human-readable suggestion for resolving the error.
    pub fn suggest(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    pub fn recoverability(&self) -> Recoverability {
        self.kind.recoverability()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context_trail(&self) -> &[String] {
        &self.context
    }

    pub fn suggestions(&self) -> &[String] {
        &self.suggestions
    }

    pub fn is_transient(&self) -> bool {
        self.recoverability() == Recoverability::Transient
    }
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind.as_str(), self.message)?;
        for crumb in &self.context {
            write!(f, "\n  while {crumb}")?;
        }
        for suggestion in &self.suggestions {
            write!(f, "\n  suggestion: {suggestion}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("BuildError");
        d.field("kind", &self.kind);
        d.field("message", &self.message);
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        if !self.suggestions.is_empty() {
            d.field("suggestions", &self.suggestions);
        }
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        d.finish()
    }
}

impl std::error::Error for BuildError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<io::Error> for BuildError {
    fn from(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::NotFound => ErrorKind::CacheIoFailed,
            io::ErrorKind::TimedOut => ErrorKind::ActionTimeout,
            _ => ErrorKind::CacheIoFailed,
        };
        BuildError::new(kind, err.to_string()).with_source(err)
    }
}

/// Extension trait for quickly turning a `Result<T, String>` (the idiom used
/// at the edges of libraries this core embeds, e.g. LMDB bindings) into a
/// `Result<T, BuildError>` of a given kind.
pub trait ResultExt<T> {
    fn map_err_kind(self, kind: ErrorKind) -> Result<T, BuildError>;
}

impl<T> ResultExt<T> for Result<T, String> {
    fn map_err_kind(self, kind: ErrorKind) -> Result<T, BuildError> {
        self.map_err(|message| BuildError::new(kind, message))
    }
}

pub type Result<T> = std::result::Result<T, BuildError>;
