//! Core domain types for Liaison.
//!
//! This crate defines the interface between the host editor and the
//! `liaison-client` runtime: buffer geometry, diagnostics, suggestion
//! candidates, runtime configuration, and the collaborator traits the
//! host implements. No IO, no async.

pub mod config;
pub mod diagnostic;
pub mod event;
pub mod geometry;
pub mod host;
pub mod suggestion;

pub use config::{RestartPolicy, RuntimeConfig, ServerSpec, TransportKind};
pub use diagnostic::{Diagnostic, DiagnosticBatch, DiagnosticKey, RelatedLocation, Severity};
pub use event::{RuntimeEvent, SessionStopReason};
pub use geometry::{Point, Span};
pub use host::{BusySignal, BusyToken, Notifier, TextDocument, WorkQueue};
pub use suggestion::{SatelliteEdit, Suggestion};
