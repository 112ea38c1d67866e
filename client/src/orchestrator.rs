//! Orchestrator: routes host document events to sessions and adapters.
//!
//! Configuration comes in as an explicit [`Strategy`] struct, one field
//! per host-supplied hook, constructed once. The orchestrator owns the
//! session manager and the diagnostics pipeline; per-session adapter
//! state lives inside each session.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use globset::{Glob, GlobSet, GlobSetBuilder};
use tokio::sync::mpsc;

use liaison_types::{
    BusySignal, Diagnostic, Notifier, Point, RestartPolicy, RuntimeConfig, RuntimeEvent,
    ServerSpec, Severity, Span, Suggestion, TextDocument, WorkQueue,
};

use crate::connection::DispatchTable;
use crate::diagnostics::DiagnosticsPipeline;
use crate::manager::{SessionEvent, SessionFactory, SessionManager};
use crate::protocol::{self, CompletionResponse, TriggerKind, WireDiagnostic};
use crate::session::Session;
use crate::suggestions::{self, SuggestionContext};

type SuppressFn = Box<dyn Fn(&Diagnostic) -> bool + Send + Sync>;

/// Everything the host supplies to stand up a runtime, one explicit
/// field per hook.
pub struct Strategy {
    pub server: ServerSpec,
    /// Server-specific options forwarded in the initialize request.
    pub initialization_options: Option<serde_json::Value>,
    /// Host editor policy: diagnostics this returns `true` for are
    /// dropped before they reach anything.
    pub suppress_diagnostic: Option<SuppressFn>,
    /// Optional progress surface; without it, session startup is only
    /// visible in the logs.
    pub busy_signal: Option<Arc<dyn BusySignal>>,
    pub restart: RestartPolicy,
    pub min_prefix_len: usize,
    pub prefetch_code_actions: bool,
}

impl Strategy {
    /// Build from deserialized configuration. Fails when no server is
    /// configured; a disabled runtime should not be constructed at all.
    pub fn from_config(config: RuntimeConfig) -> anyhow::Result<Self> {
        let server = config
            .server
            .context("runtime configuration has no server")?;
        Ok(Self {
            server,
            initialization_options: None,
            suppress_diagnostic: None,
            busy_signal: None,
            restart: config.restart,
            min_prefix_len: config.min_prefix_len,
            prefetch_code_actions: config.prefetch_code_actions,
        })
    }
}

/// The dispatch table every session gets: diagnostics pushes and exits
/// flow into the manager's event stream; log/show messages go to
/// tracing and the notifier.
pub(crate) fn dispatch_table(
    events: &mpsc::UnboundedSender<SessionEvent>,
    notifier: &Arc<dyn Notifier>,
) -> DispatchTable {
    let mut table = DispatchTable::new();

    let diag_events = events.clone();
    table.on_notification("textDocument/publishDiagnostics", move |params| {
        let Some(params) = params else { return };
        match serde_json::from_value::<protocol::PublishDiagnosticsParams>(params) {
            Ok(push) => {
                if let Some(path) = protocol::uri_to_path(&push.uri) {
                    let items = push
                        .diagnostics
                        .iter()
                        .map(WireDiagnostic::to_diagnostic)
                        .collect();
                    let _ = diag_events.send(SessionEvent::Diagnostics { path, items });
                }
            }
            Err(e) => tracing::warn!("malformed diagnostics push: {e}"),
        }
    });

    table.on_notification("window/logMessage", |params| {
        let message = params
            .as_ref()
            .and_then(|p| p.get("message"))
            .and_then(|m| m.as_str())
            .unwrap_or_default()
            .to_string();
        tracing::debug!(server_log = %message);
    });

    let show_notifier = notifier.clone();
    table.on_notification("window/showMessage", move |params| {
        let Some(params) = params else { return };
        let severity = match params.get("type").and_then(serde_json::Value::as_u64) {
            Some(1) => Severity::Error,
            Some(2) => Severity::Warning,
            _ => Severity::Information,
        };
        let message = params
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or_default();
        show_notifier.notify(severity, message, "");
    });

    // Servers block on configuration pulls; answer with nulls so they
    // fall back to their defaults.
    table.on_request("workspace/configuration", |params| {
        let count = params
            .and_then(|p| p.get("items").and_then(|i| i.as_array().map(Vec::len)))
            .unwrap_or(0);
        Ok(serde_json::Value::Array(vec![serde_json::Value::Null; count]))
    });

    table
}

/// Default factory: spawns the configured command per root.
struct SpawningFactory {
    spec: ServerSpec,
    initialization_options: Option<serde_json::Value>,
    notifier: Arc<dyn Notifier>,
}

impl SessionFactory for SpawningFactory {
    fn start(
        &self,
        root: &Path,
        generation: u64,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> std::pin::Pin<Box<dyn Future<Output = anyhow::Result<Session>> + Send + '_>> {
        let root = root.to_path_buf();
        Box::pin(async move {
            let handlers = dispatch_table(&events, &self.notifier);
            let close_root = root.clone();
            Session::start(
                &self.spec,
                &root,
                self.initialization_options.clone(),
                handlers,
                move |reason| {
                    let _ = events.send(SessionEvent::Exited {
                        root: close_root,
                        generation,
                        reason,
                    });
                },
            )
            .await
        })
    }
}

pub struct Orchestrator {
    scope: GlobSet,
    scope_is_empty: bool,
    trigger_strings: Vec<String>,
    min_prefix_len: usize,
    prefetch_code_actions: bool,
    busy_signal: Option<Arc<dyn BusySignal>>,
    manager: SessionManager,
    diagnostics: DiagnosticsPipeline,
}

impl Orchestrator {
    pub fn new(strategy: Strategy, notifier: Arc<dyn Notifier>) -> anyhow::Result<Self> {
        let factory = Arc::new(SpawningFactory {
            spec: strategy.server.clone(),
            initialization_options: strategy.initialization_options.clone(),
            notifier: notifier.clone(),
        });
        Self::with_factory(strategy, notifier, factory)
    }

    /// Construct with a custom session factory, for embedded runtimes
    /// reached over [`crate::transport::Channel::in_process`].
    pub fn with_factory(
        strategy: Strategy,
        notifier: Arc<dyn Notifier>,
        factory: Arc<dyn SessionFactory>,
    ) -> anyhow::Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &strategy.server.document_selector {
            builder.add(
                Glob::new(pattern)
                    .with_context(|| format!("invalid document selector {pattern:?}"))?,
            );
        }
        let scope = builder.build().context("building document selector")?;

        let diagnostics = DiagnosticsPipeline::new();
        if let Some(suppress) = strategy.suppress_diagnostic {
            diagnostics.set_suppression(move |d| suppress(d));
        }

        let manager = SessionManager::new(
            factory,
            strategy.restart,
            strategy.server.root_markers.clone(),
            notifier,
        );

        Ok(Self {
            scope,
            scope_is_empty: strategy.server.document_selector.is_empty(),
            trigger_strings: strategy.server.trigger_strings.clone(),
            min_prefix_len: strategy.min_prefix_len,
            prefetch_code_actions: strategy.prefetch_code_actions,
            busy_signal: strategy.busy_signal,
            manager,
            diagnostics,
        })
    }

    /// The capability-scope predicate: an empty selector handles
    /// everything.
    #[must_use]
    pub fn should_handle(&self, path: &Path) -> bool {
        self.scope_is_empty || self.scope.is_match(path)
    }

    #[must_use]
    pub fn diagnostics(&self) -> &DiagnosticsPipeline {
        &self.diagnostics
    }

    #[must_use]
    pub fn active_roots(&self) -> Vec<PathBuf> {
        self.manager.active_roots()
    }

    pub async fn restart_root(&mut self, root: &Path) -> anyhow::Result<()> {
        self.manager.restart_root(root).await
    }

    pub async fn shutdown(&mut self) {
        self.manager.stop_all().await;
    }

    // ── Document lifecycle ─────────────────────────────────────────────

    pub async fn document_opened(&mut self, path: &Path, text: &str) -> anyhow::Result<()> {
        if !self.should_handle(path) {
            return Ok(());
        }
        self.diagnostics.view_opened(path);
        let _busy = if self.manager.session_for(path).is_none() {
            self.busy_signal
                .as_ref()
                .map(|signal| signal.begin("Starting language server"))
        } else {
            None
        };
        if let Some(session) = self.manager.ensure_session(path).await? {
            session.open_document(path, text).await?;
        }
        Ok(())
    }

    pub async fn document_changed(&mut self, path: &Path, text: &str) -> anyhow::Result<()> {
        if let Some(session) = self.manager.session_for(path) {
            session.update_document(path, text).await?;
        }
        Ok(())
    }

    /// Forward the save and schedule diagnostic reprocessing on the
    /// host's work queue.
    pub async fn document_saved(&mut self, path: &Path, queue: &dyn WorkQueue) -> anyhow::Result<()> {
        if let Some(session) = self.manager.session_for(path) {
            session.save_document(path).await?;
        }
        self.diagnostics.on_document_saved(path, queue);
        Ok(())
    }

    pub async fn document_closed(&mut self, path: &Path) -> anyhow::Result<()> {
        if let Some(session) = self.manager.session_for(path) {
            session.close_document(path).await?;
        }
        self.diagnostics.view_closed(path);
        Ok(())
    }

    // ── Suggestions ────────────────────────────────────────────────────

    /// Completion flow: gate, cache reuse test, fresh request under the
    /// per-document cancellation key on a miss, then fuzzy narrowing.
    /// Request-level failures produce an empty set, never an error.
    pub async fn suggestions(&mut self, path: &Path, ctx: &SuggestionContext) -> Vec<Suggestion> {
        let min_prefix_len = self.min_prefix_len;
        let extra_triggers = self.trigger_strings.clone();
        let Some(session) = self.manager.session_for(path) else {
            return Vec::new();
        };
        let Some(completion) = session.adapters().completion() else {
            return Vec::new();
        };

        let mut triggers = completion.trigger_characters.clone();
        triggers.extend(extra_triggers);
        let trigger = suggestions::detect_trigger(&triggers, ctx);
        if !suggestions::passes_gate(ctx, trigger.as_ref(), min_prefix_len) {
            return Vec::new();
        }

        let trigger_point = ctx.trigger_point();
        let trigger_char = trigger.as_ref().map(|t| t.text.clone());
        let cache_hit = completion
            .cache
            .lookup(trigger_point, trigger_char.as_deref(), ctx.position)
            .is_some();

        if !cache_hit {
            let Ok(uri) = protocol::path_to_uri(path) else {
                return Vec::new();
            };
            let (kind, character) = match &trigger {
                Some(t) if t.in_prefix => (TriggerKind::TriggerCharacter, Some(t.text.as_str())),
                _ => (TriggerKind::Invoked, None),
            };
            let params = protocol::completion_params(uri.as_str(), ctx.position, kind, character);

            // At most one in-flight completion per document; a newer
            // keystroke supersedes this one.
            let key = format!("completion:{}", path.display());
            let guard = session.registry().cancel_and_refresh(&key);
            let response = session
                .connection()
                .request_cancellable("textDocument/completion", Some(params), guard.token())
                .await;
            drop(guard);

            match response {
                Ok(value) => {
                    let (incomplete, items) = split_completion_response(value);
                    if let Some(completion) = session.adapters_mut().completion_mut() {
                        completion.cache.replace(
                            trigger_point,
                            ctx.position,
                            trigger_char,
                            incomplete,
                            items,
                        );
                    }
                }
                Err(e) => {
                    // Superseded and protocol errors both mean "no
                    // result"; the cache is left as it was.
                    tracing::debug!(path = %path.display(), "completion request yielded nothing: {e}");
                    return Vec::new();
                }
            }
        }

        session
            .adapters()
            .completion()
            .map(|completion| suggestions::narrow(completion.cache.items(), ctx, trigger.as_ref()))
            .unwrap_or_default()
    }

    /// Resolve a presented candidate lazily. Only detail and
    /// documentation are merged; repeat selection never re-requests.
    pub async fn resolve_suggestion(&mut self, path: &Path, index: usize) -> Option<Suggestion> {
        let session = self.manager.session_for(path)?;
        let completion = session.adapters().completion()?;

        let cached = completion.cache.items().get(index)?.suggestion().clone();
        if !completion.resolve_provider {
            return Some(cached);
        }
        let Some(raw) = completion.cache.needs_resolve(index).cloned() else {
            return Some(cached);
        };

        match session
            .connection()
            .request("completionItem/resolve", Some(raw))
            .await
        {
            Ok(value) => {
                let detail = value
                    .get("detail")
                    .and_then(|d| d.as_str())
                    .map(ToString::to_string);
                let documentation = value.get("documentation").and_then(|doc| {
                    doc.as_str()
                        .map(ToString::to_string)
                        .or_else(|| doc.get("value").and_then(|v| v.as_str()).map(ToString::to_string))
                });
                session
                    .adapters_mut()
                    .completion_mut()?
                    .cache
                    .apply_resolution(index, detail, documentation)
                    .cloned()
            }
            Err(e) => {
                tracing::debug!("resolve failed, presenting unresolved candidate: {e}");
                Some(cached)
            }
        }
    }

    // ── Code actions ───────────────────────────────────────────────────

    /// Contextual actions for `span`, with the overlapping retained
    /// diagnostics as context.
    pub async fn code_actions(&mut self, path: &Path, span: Span) -> Vec<serde_json::Value> {
        let context: Vec<serde_json::Value> = self
            .diagnostics
            .diagnostics_for(path)
            .iter()
            .filter(|d| d.span().intersects(span))
            .map(protocol::diagnostic_to_wire)
            .collect();
        let Some(session) = self.manager.session_for(path) else {
            return Vec::new();
        };
        if !session.adapters().can_code_actions() {
            return Vec::new();
        }
        let Ok(uri) = protocol::path_to_uri(path) else {
            return Vec::new();
        };
        let params = protocol::code_action_params(uri.as_str(), span, &context);
        match session
            .connection()
            .request("textDocument/codeAction", Some(params))
            .await
        {
            Ok(serde_json::Value::Array(actions)) => actions,
            Ok(_) => Vec::new(),
            Err(e) => {
                tracing::debug!(path = %path.display(), "code action request yielded nothing: {e}");
                Vec::new()
            }
        }
    }

    // ── Definitions ────────────────────────────────────────────────────

    /// Definition targets for the symbol at `position`. Out-of-root
    /// targets get their containing directory claimed by the session so
    /// follow-up requests on those files route here.
    pub async fn definitions(&mut self, path: &Path, position: Point) -> Vec<(PathBuf, Span)> {
        let Some(session) = self.manager.session_for(path) else {
            return Vec::new();
        };
        if !session.adapters().can_definitions() {
            return Vec::new();
        }
        let Ok(uri) = protocol::path_to_uri(path) else {
            return Vec::new();
        };
        let params = protocol::definition_params(uri.as_str(), position);
        let targets = match session
            .connection()
            .request("textDocument/definition", Some(params))
            .await
        {
            Ok(value) => protocol::parse_locations(&value),
            Err(e) => {
                tracing::debug!(path = %path.display(), "definition request yielded nothing: {e}");
                Vec::new()
            }
        };

        for (target, _) in &targets {
            if !session.services_path(target)
                && let Some(dir) = target.parent()
            {
                session.claim_additional_path(dir.to_path_buf());
            }
        }
        targets
    }

    // ── Event pump ─────────────────────────────────────────────────────

    /// Drain up to `budget` session events: diagnostics flow through the
    /// pipeline (suppression applied, consumers fanned out, optional
    /// bulk action prefetch) before the host sees them.
    pub async fn poll_events(&mut self, budget: usize) -> Vec<RuntimeEvent> {
        let events = self.manager.poll_events(budget).await;
        let mut out = Vec::with_capacity(events.len());
        for event in events {
            match event {
                RuntimeEvent::Diagnostics { path, items } => {
                    self.diagnostics.capture(&path, items);
                    if self.prefetch_code_actions {
                        self.prefetch_actions(&path).await;
                    }
                    let retained = self.diagnostics.diagnostics_for(&path);
                    out.push(RuntimeEvent::Diagnostics {
                        path,
                        items: retained,
                    });
                }
                other => out.push(other),
            }
        }
        out
    }

    /// One bulk contextual-action request per captured batch, for the
    /// union of retained spans; results are distributed back to
    /// individual diagnostics by identity key.
    async fn prefetch_actions(&mut self, path: &Path) {
        let Some(span) = self.diagnostics.interesting_span(path) else {
            return;
        };
        let context: Vec<serde_json::Value> = self
            .diagnostics
            .diagnostics_for(path)
            .iter()
            .map(protocol::diagnostic_to_wire)
            .collect();
        let Some(session) = self.manager.session_for(path) else {
            return;
        };
        if !session.adapters().can_code_actions() {
            return;
        }
        let Ok(uri) = protocol::path_to_uri(path) else {
            return;
        };
        let params = protocol::code_action_params(uri.as_str(), span, &context);
        if let Ok(serde_json::Value::Array(actions)) = session
            .connection()
            .request("textDocument/codeAction", Some(params))
            .await
        {
            self.diagnostics.attach_actions(path, &actions);
        }
    }
}

/// Apply an accepted candidate to the host document.
///
/// The primary edit and every satellite edit land as one undo step.
/// Without an explicit span from the server, the typed prefix is
/// replaced. Snippet bodies take precedence over plain insertion text.
pub fn accept_suggestion(
    document: &dyn TextDocument,
    suggestion: &Suggestion,
    ctx: &SuggestionContext,
    replace_on_accept: bool,
) {
    let span = suggestion
        .accept_span(replace_on_accept)
        .unwrap_or_else(|| Span::new(ctx.trigger_point(), ctx.position));
    let text = suggestion.snippet.as_deref().unwrap_or(&suggestion.text);
    document.replace_in_span(span, text, &suggestion.satellite_edits);
}

/// Split a completion response into its incomplete flag and raw/host
/// item pairs. The raw wire item is kept for the resolve echo.
fn split_completion_response(
    value: serde_json::Value,
) -> (bool, Vec<(serde_json::Value, Suggestion)>) {
    let raw_items: Vec<serde_json::Value> = match &value {
        serde_json::Value::Array(items) => items.clone(),
        serde_json::Value::Object(obj) => obj
            .get("items")
            .and_then(|i| i.as_array())
            .cloned()
            .unwrap_or_default(),
        _ => Vec::new(),
    };
    let Ok(response) = serde_json::from_value::<CompletionResponse>(value) else {
        return (false, Vec::new());
    };
    let list = response.into_list();
    let pairs = raw_items
        .into_iter()
        .zip(list.items.iter())
        .map(|(raw, item)| (raw, item.to_suggestion()))
        .collect();
    (list.is_incomplete, pairs)
}
