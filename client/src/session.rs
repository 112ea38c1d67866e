//! One server session per project root.
//!
//! A session owns the spawned process, its connection, the negotiated
//! capability set, and the per-document sync state. It moves through
//! three states: `Starting` during the initialize handshake, `Active`
//! once the server has acknowledged, and `Terminated` after teardown.
//! Requests outside `Active` are rejected, not queued.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;

use liaison_types::ServerSpec;

use crate::adapters::AdapterSet;
use crate::connection::{Connection, DispatchTable, PendingRequestRegistry, RequestError};
use crate::protocol::{self, ServerCapabilities};
use crate::transport::ServerProcess;

const INIT_TIMEOUT: Duration = Duration::from_secs(30);

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Out-of-root directories a session may claim, bounded FIFO.
const ADDITIONAL_PATHS_CAP: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Active,
    Terminated,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session for {} is not active", root.display())]
    NotActive { root: PathBuf },
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Uri(#[from] protocol::PathToUriError),
}

/// A running server bound to one project root.
pub struct Session {
    root: PathBuf,
    language_id: String,
    process: ServerProcess,
    connection: Arc<Connection>,
    capabilities: ServerCapabilities,
    adapters: AdapterSet,
    state: SessionState,
    registry: PendingRequestRegistry,
    additional_paths: VecDeque<PathBuf>,
    doc_versions: HashMap<PathBuf, i32>,
    disposal: Vec<Box<dyn FnOnce() + Send>>,
}

impl Session {
    /// Spawn `spec.command` for `root` and run the initialize handshake.
    pub async fn start(
        spec: &ServerSpec,
        root: &Path,
        initialization_options: Option<serde_json::Value>,
        handlers: DispatchTable,
        on_close: impl FnOnce(Option<String>) + Send + 'static,
    ) -> anyhow::Result<Self> {
        let process = ServerProcess::spawn(spec, root)
            .await
            .with_context(|| format!("starting {} for {}", spec.command, root.display()))?;
        Self::establish(
            process,
            root,
            &spec.language_id,
            initialization_options,
            handlers,
            on_close,
        )
        .await
    }

    /// Run the initialize handshake over an already-connected process.
    ///
    /// This is the entry point for in-process channels; [`Session::start`]
    /// delegates here after spawning.
    pub async fn establish(
        mut process: ServerProcess,
        root: &Path,
        language_id: &str,
        initialization_options: Option<serde_json::Value>,
        handlers: DispatchTable,
        on_close: impl FnOnce(Option<String>) + Send + 'static,
    ) -> anyhow::Result<Self> {
        let root = normalize_root(root);
        let channel = process
            .take_channel()
            .context("server process has no channel")?;
        let connection = Arc::new(Connection::new(channel, handlers, on_close));

        let mut session = Self {
            root: root.clone(),
            language_id: language_id.to_string(),
            process,
            connection,
            capabilities: ServerCapabilities::default(),
            adapters: AdapterSet::default(),
            state: SessionState::Starting,
            registry: PendingRequestRegistry::new(),
            additional_paths: VecDeque::new(),
            doc_versions: HashMap::new(),
            disposal: Vec::new(),
        };

        let root_uri = protocol::path_to_uri(&root)?;
        let params = protocol::initialize_params(root_uri.as_str(), initialization_options);
        let handshake = session.connection.request("initialize", Some(params));
        let result = match tokio::time::timeout(INIT_TIMEOUT, handshake).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                session.abort().await;
                return Err(anyhow::Error::new(e)).with_context(|| {
                    initialize_failure(session.process.command(), &root, &session.process)
                });
            }
            Err(_) => {
                session.abort().await;
                anyhow::bail!(
                    "{}",
                    initialize_failure(session.process.command(), &root, &session.process)
                );
            }
        };

        session.capabilities = result
            .get("capabilities")
            .cloned()
            .and_then(|caps| match serde_json::from_value(caps) {
                Ok(parsed) => Some(parsed),
                Err(e) => {
                    tracing::warn!(root = %root.display(), "unparseable capabilities: {e}");
                    None
                }
            })
            .unwrap_or_default();
        // Adapter wiring happens exactly once, here.
        session.adapters = AdapterSet::wire(&session.capabilities);

        session
            .connection
            .notify("initialized", Some(serde_json::json!({})))
            .await
            .context("sending initialized notification")?;

        session.state = SessionState::Active;
        tracing::info!(
            root = %root.display(),
            server = session.process.command(),
            "session active"
        );
        Ok(session)
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn language_id(&self) -> &str {
        &self.language_id
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub fn capabilities(&self) -> &ServerCapabilities {
        &self.capabilities
    }

    #[must_use]
    pub fn registry(&self) -> &PendingRequestRegistry {
        &self.registry
    }

    #[must_use]
    pub fn adapters(&self) -> &AdapterSet {
        &self.adapters
    }

    pub fn adapters_mut(&mut self) -> &mut AdapterSet {
        &mut self.adapters
    }

    /// The connection, for adapters issuing requests. Callers must check
    /// [`Session::state`] via the higher-level request helpers.
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Stderr tail of the underlying process, for crash reports.
    #[must_use]
    pub fn stderr_report(&self) -> String {
        self.process.stderr_tail().report()
    }

    fn ensure_active(&self) -> Result<(), SessionError> {
        if self.state == SessionState::Active {
            Ok(())
        } else {
            Err(SessionError::NotActive {
                root: self.root.clone(),
            })
        }
    }

    /// Whether `path` lives under this session's root or one of its
    /// claimed additional directories.
    #[must_use]
    pub fn services_path(&self, path: &Path) -> bool {
        path.starts_with(&self.root)
            || self.additional_paths.iter().any(|dir| path.starts_with(dir))
    }

    /// Claim an out-of-root directory (e.g. a dependency source dir
    /// reached through a definition jump) so later requests for files
    /// under it route here. The claim set is bounded; the oldest claim
    /// is evicted first.
    pub fn claim_additional_path(&mut self, dir: PathBuf) {
        if self.services_path(&dir) {
            return;
        }
        if self.additional_paths.len() == ADDITIONAL_PATHS_CAP {
            self.additional_paths.pop_front();
        }
        tracing::debug!(root = %self.root.display(), dir = %dir.display(), "claiming path");
        self.additional_paths.push_back(dir);
    }

    /// Register teardown work to run exactly once when the session ends.
    pub fn on_dispose(&mut self, work: impl FnOnce() + Send + 'static) {
        self.disposal.push(Box::new(work));
    }

    // ── Document sync ──────────────────────────────────────────────────

    pub async fn open_document(&mut self, path: &Path, text: &str) -> Result<(), SessionError> {
        self.ensure_active()?;
        let uri = protocol::path_to_uri(path)?;
        self.doc_versions.insert(path.to_path_buf(), 1);
        self.connection
            .notify(
                "textDocument/didOpen",
                Some(protocol::did_open_params(
                    uri.as_str(),
                    &self.language_id,
                    1,
                    text,
                )),
            )
            .await?;
        Ok(())
    }

    pub async fn update_document(&mut self, path: &Path, text: &str) -> Result<(), SessionError> {
        self.ensure_active()?;
        let uri = protocol::path_to_uri(path)?;
        let version = self
            .doc_versions
            .entry(path.to_path_buf())
            .and_modify(|v| *v += 1)
            .or_insert(1);
        self.connection
            .notify(
                "textDocument/didChange",
                Some(protocol::did_change_params(uri.as_str(), *version, text)),
            )
            .await?;
        Ok(())
    }

    pub async fn save_document(&mut self, path: &Path) -> Result<(), SessionError> {
        self.ensure_active()?;
        let uri = protocol::path_to_uri(path)?;
        self.connection
            .notify(
                "textDocument/didSave",
                Some(protocol::did_save_params(uri.as_str())),
            )
            .await?;
        Ok(())
    }

    pub async fn close_document(&mut self, path: &Path) -> Result<(), SessionError> {
        self.ensure_active()?;
        let uri = protocol::path_to_uri(path)?;
        self.doc_versions.remove(path);
        self.connection
            .notify(
                "textDocument/didClose",
                Some(protocol::did_close_params(uri.as_str())),
            )
            .await?;
        Ok(())
    }

    #[must_use]
    pub fn is_document_open(&self, path: &Path) -> bool {
        self.doc_versions.contains_key(path)
    }

    #[must_use]
    pub fn open_documents(&self) -> Vec<PathBuf> {
        self.doc_versions.keys().cloned().collect()
    }

    // ── Teardown ───────────────────────────────────────────────────────

    /// Graceful teardown: cancel in-flight work, ask the server to shut
    /// down, then reap or kill the process. Disposal callbacks run last,
    /// exactly once.
    pub async fn shutdown(&mut self) {
        if self.state == SessionState::Terminated {
            return;
        }
        self.state = SessionState::Terminated;
        self.registry.cancel_all();

        let shutdown = self.connection.request("shutdown", None);
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, shutdown).await.is_err() {
            tracing::debug!(root = %self.root.display(), "shutdown request timed out");
        }
        let _ = self.connection.notify("exit", None).await;
        self.connection.shutdown_writer().await;

        if !self.process.wait_with_timeout(SHUTDOWN_TIMEOUT).await {
            tracing::warn!(
                root = %self.root.display(),
                server = self.process.command(),
                "server did not exit, killing"
            );
            self.process.kill().await;
        }
        self.run_disposal();
    }

    /// Teardown for a session whose process already exited: no protocol
    /// farewell, just local cleanup.
    pub async fn abort(&mut self) {
        if self.state == SessionState::Terminated {
            return;
        }
        self.state = SessionState::Terminated;
        self.registry.cancel_all();
        self.connection.shutdown_writer().await;
        self.process.kill().await;
        self.run_disposal();
    }

    fn run_disposal(&mut self) {
        for work in self.disposal.drain(..) {
            work();
        }
    }
}

fn normalize_root(root: &Path) -> PathBuf {
    root.canonicalize().unwrap_or_else(|_| root.to_path_buf())
}

fn initialize_failure(command: &str, root: &Path, process: &ServerProcess) -> String {
    let tail = process.stderr_tail().report();
    if tail.is_empty() {
        format!("{command} failed to initialize for {}", root.display())
    } else {
        format!(
            "{command} failed to initialize for {}\nserver output:\n{tail}",
            root.display()
        )
    }
}
