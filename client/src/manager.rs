//! Session registry keyed by project root.
//!
//! The manager enforces one session per normalized root, resolves which
//! session services a document, and applies the crash-restart policy: a
//! session that dies unexpectedly is restarted until the budget of
//! crashes inside the sliding window is spent, after which the root is
//! parked until an explicit restart.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use liaison_types::{
    Diagnostic, Notifier, RestartPolicy, RuntimeEvent, SessionStopReason, Severity,
};

use crate::session::Session;

/// Internal event stream from running sessions to the manager.
#[derive(Debug)]
pub enum SessionEvent {
    /// A session's read side ended. `reason` is `None` for a clean EOF.
    Exited {
        root: PathBuf,
        /// The generation the manager assigned when it started the
        /// session. Exits carrying a superseded generation are stale
        /// and must be dropped, not counted against the budget.
        generation: u64,
        reason: Option<String>,
    },
    /// A diagnostics push, already converted to host shape.
    Diagnostics {
        path: PathBuf,
        items: Vec<Diagnostic>,
    },
}

/// Builds sessions on demand; the orchestrator supplies the wiring
/// (dispatch handlers, process spawning) behind this seam.
///
/// Implementations must tag the `Exited` events they emit with the
/// `generation` passed here, so the manager can tell a live session's
/// exit apart from one it already replaced.
pub trait SessionFactory: Send + Sync {
    fn start(
        &self,
        root: &Path,
        generation: u64,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Session>> + Send + '_>>;
}

pub struct SessionManager {
    factory: Arc<dyn SessionFactory>,
    policy: RestartPolicy,
    root_markers: Vec<String>,
    notifier: Arc<dyn Notifier>,
    sessions: HashMap<PathBuf, Session>,
    generations: HashMap<PathBuf, u64>,
    next_generation: u64,
    crash_times: HashMap<PathBuf, VecDeque<Instant>>,
    exhausted: HashSet<PathBuf>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl SessionManager {
    #[must_use]
    pub fn new(
        factory: Arc<dyn SessionFactory>,
        policy: RestartPolicy,
        root_markers: Vec<String>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            factory,
            policy,
            root_markers,
            notifier,
            sessions: HashMap::new(),
            generations: HashMap::new(),
            next_generation: 0,
            crash_times: HashMap::new(),
            exhausted: HashSet::new(),
            events_tx,
            events_rx,
        }
    }

    /// Sender for session-sourced events, handed to factories and tests.
    #[must_use]
    pub fn events_sender(&self) -> mpsc::UnboundedSender<SessionEvent> {
        self.events_tx.clone()
    }

    /// Walk up from `path` looking for a directory containing one of the
    /// configured root markers. Falls back to the file's parent.
    #[must_use]
    pub fn determine_root(&self, path: &Path) -> PathBuf {
        let start = if path.is_dir() {
            path
        } else {
            path.parent().unwrap_or(path)
        };
        if !self.root_markers.is_empty() {
            for dir in start.ancestors() {
                if self
                    .root_markers
                    .iter()
                    .any(|marker| dir.join(marker).exists())
                {
                    return dir.to_path_buf();
                }
            }
        }
        start.to_path_buf()
    }

    /// The session servicing `path`: the longest root prefix wins, then
    /// claimed additional paths.
    pub fn session_for(&mut self, path: &Path) -> Option<&mut Session> {
        let by_root = self
            .sessions
            .keys()
            .filter(|root| path.starts_with(root))
            .max_by_key(|root| root.components().count())
            .cloned();
        if let Some(root) = by_root {
            return self.sessions.get_mut(&root);
        }
        self.sessions
            .values_mut()
            .find(|session| session.services_path(path))
    }

    /// The active session for `path`, starting one when none exists.
    ///
    /// Returns `Ok(None)` when the root's restart budget is exhausted;
    /// such roots stay parked until [`SessionManager::restart_root`].
    pub async fn ensure_session(
        &mut self,
        path: &Path,
    ) -> anyhow::Result<Option<&mut Session>> {
        if self.session_for(path).is_some() {
            // Reborrow: NLL cannot prove the early return above releases
            // the map borrow.
            return Ok(self.session_for(path));
        }

        let root = self.determine_root(path);
        if self.exhausted.contains(&root) {
            return Ok(None);
        }

        let root = self.spawn_session(&root).await?;
        tracing::info!(root = %root.display(), "session started");
        Ok(self.sessions.get_mut(&root))
    }

    /// Start a session under a fresh generation and register it under
    /// the root the session itself reports.
    async fn spawn_session(&mut self, root: &Path) -> anyhow::Result<PathBuf> {
        let generation = self.next_generation;
        self.next_generation += 1;
        let session = self
            .factory
            .start(root, generation, self.events_tx.clone())
            .await?;
        let root = session.root().to_path_buf();
        self.sessions.insert(root.clone(), session);
        self.generations.insert(root.clone(), generation);
        Ok(root)
    }

    #[must_use]
    pub fn active_roots(&self) -> Vec<PathBuf> {
        self.sessions.keys().cloned().collect()
    }

    #[must_use]
    pub fn is_exhausted(&self, root: &Path) -> bool {
        self.exhausted.contains(root)
    }

    /// Gracefully stop the session for `root`, if any.
    pub async fn stop_session(&mut self, root: &Path) {
        self.generations.remove(root);
        if let Some(mut session) = self.sessions.remove(root) {
            session.shutdown().await;
        }
    }

    /// Gracefully stop everything, e.g. on host shutdown.
    pub async fn stop_all(&mut self) {
        let roots: Vec<PathBuf> = self.sessions.keys().cloned().collect();
        for root in roots {
            self.stop_session(&root).await;
        }
    }

    /// Explicit restart: clears the crash history and exhaustion mark,
    /// stops any live session, and starts fresh.
    pub async fn restart_root(&mut self, root: &Path) -> anyhow::Result<()> {
        self.stop_session(root).await;
        self.crash_times.remove(root);
        self.exhausted.remove(root);
        self.spawn_session(root).await?;
        Ok(())
    }

    /// Drain up to `budget` pending session events, applying the restart
    /// policy to exits and forwarding the rest as host events.
    pub async fn poll_events(&mut self, budget: usize) -> Vec<RuntimeEvent> {
        let mut out = Vec::new();
        for _ in 0..budget {
            let Ok(event) = self.events_rx.try_recv() else {
                break;
            };
            match event {
                SessionEvent::Diagnostics { path, items } => {
                    out.push(RuntimeEvent::Diagnostics { path, items });
                }
                SessionEvent::Exited {
                    root,
                    generation,
                    reason,
                } => {
                    self.handle_exit(&root, generation, reason, &mut out).await;
                }
            }
        }
        out
    }

    async fn handle_exit(
        &mut self,
        root: &Path,
        generation: u64,
        reason: Option<String>,
        out: &mut Vec<RuntimeEvent>,
    ) {
        // An exit from a generation we already stopped or replaced is
        // stale; acting on it would kill the fresh session and burn the
        // crash budget on a session that is long gone.
        if self.generations.get(root) != Some(&generation) {
            tracing::debug!(root = %root.display(), generation, "dropping stale exit event");
            return;
        }
        let Some(mut session) = self.sessions.remove(root) else {
            return;
        };
        self.generations.remove(root);
        let stderr = session.stderr_report();
        session.abort().await;

        let stop_reason = match &reason {
            Some(e) => SessionStopReason::Failed(e.clone()),
            None => SessionStopReason::Exited,
        };
        tracing::warn!(root = %root.display(), ?stop_reason, "session exited unexpectedly");
        out.push(RuntimeEvent::SessionStopped {
            root: root.to_path_buf(),
            reason: stop_reason,
        });

        if self.record_crash(root) {
            let detail = if stderr.is_empty() {
                String::from("The server kept crashing and will not be restarted.")
            } else {
                format!("The server kept crashing and will not be restarted.\n{stderr}")
            };
            self.notifier.notify(
                Severity::Error,
                &format!("Language server for {} stopped", root.display()),
                &detail,
            );
            return;
        }

        match self.spawn_session(root).await {
            Ok(root) => {
                tracing::info!(root = %root.display(), "session restarted");
                out.push(RuntimeEvent::SessionStarted { root });
            }
            Err(e) => {
                self.exhausted.insert(root.to_path_buf());
                self.notifier.notify(
                    Severity::Error,
                    &format!("Language server for {} failed to restart", root.display()),
                    &format!("{e:#}"),
                );
            }
        }
    }

    /// Record a crash for `root`; returns `true` when the budget inside
    /// the sliding window is now spent and the root must be parked.
    fn record_crash(&mut self, root: &Path) -> bool {
        let window = Duration::from_secs(self.policy.window_secs);
        let now = Instant::now();
        let times = self.crash_times.entry(root.to_path_buf()).or_default();
        while times.front().is_some_and(|t| now.duration_since(*t) > window) {
            times.pop_front();
        }
        times.push_back(now);
        if times.len() > self.policy.budget as usize {
            self.exhausted.insert(root.to_path_buf());
            true
        } else {
            false
        }
    }
}
