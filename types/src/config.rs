//! Runtime configuration, deserialized at the host boundary.

use serde::Deserialize;

/// How the runtime talks to a spawned server process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Piped standard streams (the common case).
    #[default]
    Stdio,
    /// A localhost TCP socket the runtime pre-opens; the port is passed
    /// to the child.
    Socket,
    /// An in-process duplex channel, for child runtimes that can be
    /// driven without a separate process.
    Ipc,
}

/// Restart policy for unexpected server terminations.
#[derive(Debug, Clone, Deserialize)]
pub struct RestartPolicy {
    /// Consecutive unexpected terminations tolerated within the window
    /// before auto-restart is disabled.
    #[serde(default = "RestartPolicy::default_budget")]
    pub budget: u32,
    /// Sliding window in seconds; crashes older than this do not count
    /// against the budget.
    #[serde(default = "RestartPolicy::default_window_secs")]
    pub window_secs: u64,
}

impl RestartPolicy {
    fn default_budget() -> u32 {
        3
    }

    fn default_window_secs() -> u64 {
        180
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            budget: Self::default_budget(),
            window_secs: Self::default_window_secs(),
        }
    }
}

/// Configuration for one language server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSpec {
    /// Executable command (e.g. "rust-analyzer").
    pub command: String,
    /// Arguments to pass to the command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Protocol language identifier (e.g. "rust", "typescript").
    pub language_id: String,
    /// Glob patterns selecting the documents this server handles
    /// (e.g. `["**/*.rs"]`).
    #[serde(default)]
    pub document_selector: Vec<String>,
    /// Files marking a project root (e.g. `["Cargo.toml"]`).
    #[serde(default)]
    pub root_markers: Vec<String>,
    /// Transport binding for the spawned process.
    #[serde(default)]
    pub transport: TransportKind,
    /// Trigger strings that proactively open a suggestion request.
    #[serde(default)]
    pub trigger_strings: Vec<String>,
}

/// Top-level configuration for the runtime.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuntimeConfig {
    /// Whether the runtime is enabled. Default: false.
    #[serde(default)]
    pub enabled: bool,
    /// Minimum typed-prefix length before automatic suggestion requests
    /// fire. Manual invocation and trigger characters bypass this.
    #[serde(default = "RuntimeConfig::default_min_prefix_len")]
    pub min_prefix_len: usize,
    /// Opt-in: one bulk contextual-action request per diagnostic batch.
    /// Off by default; depends on servers returning related-diagnostics
    /// metadata consistently.
    #[serde(default)]
    pub prefetch_code_actions: bool,
    #[serde(default)]
    pub restart: RestartPolicy,
    pub server: Option<ServerSpec>,
}

impl RuntimeConfig {
    fn default_min_prefix_len() -> usize {
        2
    }
}
