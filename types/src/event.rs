//! Events emitted by the runtime to the host.

use std::path::PathBuf;

use crate::diagnostic::Diagnostic;

/// Why a session stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStopReason {
    /// Explicit deactivation or host shutdown.
    Requested,
    /// Process exited on its own.
    Exited,
    /// Transport or protocol failure.
    Failed(String),
}

/// An event emitted by the runtime.
#[derive(Debug)]
pub enum RuntimeEvent {
    /// A session finished initialization and is active.
    SessionStarted { root: PathBuf },
    /// A session left the active set.
    SessionStopped {
        root: PathBuf,
        reason: SessionStopReason,
    },
    /// Diagnostics updated for a document.
    Diagnostics {
        path: PathBuf,
        items: Vec<Diagnostic>,
    },
}
