//! Host-editor collaborator traits.
//!
//! The runtime consumes the host's buffer, notification, and scheduling
//! primitives through these narrow interfaces; it never reimplements
//! them. Implementations live in the host application (and in test
//! doubles inside `liaison-client`).

use std::path::Path;

use crate::diagnostic::Severity;
use crate::geometry::{Point, Span};
use crate::suggestion::SatelliteEdit;

/// An open document in the host editor.
pub trait TextDocument: Send + Sync {
    /// Stable absolute path identifying the document.
    fn path(&self) -> &Path;

    /// Text covered by `span`.
    fn text_in_span(&self, span: Span) -> String;

    /// Text of the given line, without the trailing newline.
    fn line_text(&self, line: u32) -> String;

    /// Replace `span` with `new_text`, bundling the edit and all
    /// `satellites` into one undo step.
    fn replace_in_span(&self, span: Span, new_text: &str, satellites: &[SatelliteEdit]);

    /// Current cursor position.
    fn cursor(&self) -> Point;
}

/// Dismissable user-visible notifications.
///
/// Implementations must dedup: a notification with the same severity,
/// message, and detail as one currently displayed is suppressed.
pub trait Notifier: Send + Sync {
    fn notify(&self, severity: Severity, message: &str, detail: &str);
}

/// Scope guard returned by [`BusySignal::begin`]; ends the reported
/// operation when dropped.
pub struct BusyToken {
    end: Option<Box<dyn FnOnce() + Send>>,
}

impl BusyToken {
    #[must_use]
    pub fn new(end: impl FnOnce() + Send + 'static) -> Self {
        Self {
            end: Some(Box::new(end)),
        }
    }

    /// A token that does nothing on drop.
    #[must_use]
    pub fn noop() -> Self {
        Self { end: None }
    }
}

impl Drop for BusyToken {
    fn drop(&mut self) {
        if let Some(end) = self.end.take() {
            end();
        }
    }
}

/// Optional scoped "operation in progress" surface.
///
/// When the host provides none, the runtime falls back to bare
/// start/finish log lines.
pub trait BusySignal: Send + Sync {
    /// Report that `title` started; the returned token ends the scope
    /// when dropped.
    fn begin(&self, title: &str) -> BusyToken;
}

/// Explicit deferred-work queue.
///
/// Work queued here runs after the current handler returns, never
/// inline; it is how the runtime avoids reentering host handlers (e.g.
/// save-triggered diagnostic reprocessing).
pub trait WorkQueue: Send + Sync {
    fn defer(&self, work: Box<dyn FnOnce() + Send>);
}
