//! Language server client runtime: session lifecycle, diagnostics, and
//! suggestion plumbing for a host editor.
//!
//! The host constructs a [`Strategy`] (usually from [`RuntimeConfig`]),
//! wraps it in an [`Orchestrator`], and routes document events and
//! feature queries through it. Everything below that seam — transports,
//! framing, request correlation, per-root sessions with crash-restart,
//! the diagnostics pipeline, and the suggestion cache — is internal.
//!
//! [`RuntimeConfig`]: liaison_types::RuntimeConfig

pub mod adapters;
pub mod codec;
pub mod protocol;
pub mod suggestions;
pub mod transport;

mod connection;
mod diagnostics;
mod fuzzy;
mod manager;
mod orchestrator;
mod session;

pub use connection::{Connection, DispatchTable, PendingRequestRegistry, RequestError, RequestGuard};
pub use diagnostics::{DiagnosticsPipeline, Intention};
pub use manager::{SessionEvent, SessionFactory, SessionManager};
pub use orchestrator::{Orchestrator, Strategy, accept_suggestion};
pub use session::{Session, SessionError, SessionState};
pub use suggestions::SuggestionContext;
