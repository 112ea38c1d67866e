//! Diagnostics as presented to the host editor.
//!
//! Fields are private; construction goes through [`Diagnostic::new`] and
//! mutation after construction is not possible. The [`DiagnosticKey`] is a
//! structural identity derived from content, not object identity, so the
//! host can re-associate a previously displayed message with its
//! counterpart in a newer batch.

use std::path::PathBuf;

use crate::geometry::Span;

/// Severity level for a diagnostic, matching the wire protocol's numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Error = 1,
    Warning = 2,
    Information = 3,
    Hint = 4,
}

impl Severity {
    /// Convert from the protocol's numeric severity (1=Error .. 4=Hint).
    ///
    /// Returns `None` for values outside the defined range. Callers at the
    /// wire boundary decide the fallback policy.
    #[must_use]
    pub fn from_wire(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::Error),
            2 => Some(Self::Warning),
            3 => Some(Self::Information),
            4 => Some(Self::Hint),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_error(self) -> bool {
        self == Self::Error
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Information => "info",
            Self::Hint => "hint",
        }
    }
}

/// Structural identity of a diagnostic: equal content yields an equal key
/// across separate pushes, regardless of object instances.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DiagnosticKey(String);

impl DiagnosticKey {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DiagnosticKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A reference to a related location in another (or the same) document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelatedLocation {
    pub path: PathBuf,
    pub span: Span,
    pub message: String,
}

/// A single diagnostic from a language server, in host shape.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    severity: Severity,
    message: String,
    span: Span,
    /// Server-assigned code (e.g. "E0308"), empty when absent.
    code: String,
    /// Source of the diagnostic (e.g. "rustc", "eslint").
    source: String,
    related: Vec<RelatedLocation>,
}

impl Diagnostic {
    /// Single construction path; fields cannot be mutated afterwards.
    #[must_use]
    pub fn new(
        severity: Severity,
        message: String,
        span: Span,
        code: String,
        source: String,
    ) -> Self {
        Self {
            severity,
            message,
            span,
            code,
            source,
            related: Vec::new(),
        }
    }

    /// Attach related locations (builder-style, used at the wire boundary).
    #[must_use]
    pub fn with_related(mut self, related: Vec<RelatedLocation>) -> Self {
        self.related = related;
        self
    }

    #[must_use]
    pub fn severity(&self) -> Severity {
        self.severity
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn span(&self) -> Span {
        self.span
    }

    /// Server-assigned code, empty when the server sent none.
    #[must_use]
    pub fn code(&self) -> &str {
        &self.code
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    #[must_use]
    pub fn related(&self) -> &[RelatedLocation] {
        &self.related
    }

    /// Structural identity key: `message:severity:code:span`.
    ///
    /// Derived from content so that re-submitting an identical batch
    /// produces equal keys even though the instances differ.
    #[must_use]
    pub fn key(&self) -> DiagnosticKey {
        DiagnosticKey(format!(
            "{}:{:?}:{}:{}",
            self.message, self.severity, self.code, self.span
        ))
    }

    /// Format as `path:line:col: severity: message` (1-indexed for display).
    #[must_use]
    pub fn display_with_path(&self, path: &std::path::Path) -> String {
        format!(
            "{}:{}:{}: {}: [{}] {}",
            path.display(),
            self.span.start.line + 1,
            self.span.start.column + 1,
            self.severity.label(),
            self.source,
            self.message,
        )
    }
}

/// One asynchronously pushed batch: a document path plus its full, ordered
/// diagnostic list. A later batch for the same path supersedes this one.
#[derive(Debug, Clone)]
pub struct DiagnosticBatch {
    pub path: PathBuf,
    pub diagnostics: Vec<Diagnostic>,
}
