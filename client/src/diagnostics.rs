//! Diagnostics pipeline: capture, suppression, fan-out, and the
//! intentions index.
//!
//! Batches arrive asynchronously from sessions; a later batch for a path
//! fully supersedes the earlier one. Each retained diagnostic is
//! addressed by its structural identity key so host-side references
//! survive re-pushes. The pipeline is shared (orchestrator, save hooks,
//! intention lookups) and mutated only through its own methods.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use liaison_types::{Diagnostic, DiagnosticKey, Point, Span, WorkQueue};

type Consumer = dyn Fn(&Path, &[Diagnostic]) + Send + Sync;

type SuppressionPredicate = Box<dyn Fn(&Diagnostic) -> bool + Send + Sync>;

/// One intentions-index entry: a diagnostic's span, its identity key,
/// and any contextual actions attached after a bulk prefetch.
#[derive(Debug, Clone)]
pub struct Intention {
    pub span: Span,
    pub key: DiagnosticKey,
    pub actions: Vec<serde_json::Value>,
}

#[derive(Default)]
struct PipelineInner {
    suppress: Option<SuppressionPredicate>,
    /// Last raw (pre-suppression) batch per path, kept for save-triggered
    /// reprocessing.
    raw: HashMap<PathBuf, Vec<Diagnostic>>,
    /// Retained diagnostics per path, in server-send order.
    current: HashMap<PathBuf, Vec<Diagnostic>>,
    intentions: HashMap<PathBuf, Vec<Intention>>,
    consumers: Vec<Arc<Consumer>>,
    /// Open view count per path.
    views: HashMap<PathBuf, usize>,
}

#[derive(Clone, Default)]
pub struct DiagnosticsPipeline {
    inner: Arc<Mutex<PipelineInner>>,
}

impl DiagnosticsPipeline {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the host's suppression predicate; diagnostics it returns
    /// `true` for are dropped entirely and appear nowhere downstream.
    pub fn set_suppression(&self, predicate: impl Fn(&Diagnostic) -> bool + Send + Sync + 'static) {
        self.lock().suppress = Some(Box::new(predicate));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PipelineInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Capture a batch for `path`, superseding any earlier batch: apply
    /// suppression, rebuild the intentions index wholesale, and fan the
    /// full retained batch out to every consumer.
    pub fn capture(&self, path: &Path, batch: Vec<Diagnostic>) {
        let retained = {
            let mut inner = self.lock();
            inner.raw.insert(path.to_path_buf(), batch.clone());
            let retained: Vec<Diagnostic> = match &inner.suppress {
                Some(predicate) => batch.into_iter().filter(|d| !predicate(d)).collect(),
                None => batch,
            };
            let intentions = retained
                .iter()
                .map(|d| Intention {
                    span: d.span(),
                    key: d.key(),
                    actions: Vec::new(),
                })
                .collect();
            inner.intentions.insert(path.to_path_buf(), intentions);
            inner.current.insert(path.to_path_buf(), retained.clone());
            retained
        };
        tracing::debug!(path = %path.display(), count = retained.len(), "diagnostics captured");
        self.fan_out(path, &retained);
    }

    fn fan_out(&self, path: &Path, batch: &[Diagnostic]) {
        // Snapshot outside the lock so a consumer can query the pipeline.
        let consumers: Vec<Arc<Consumer>> = self.lock().consumers.clone();
        for consumer in consumers {
            consumer(path, batch);
        }
    }

    /// Attach a consumer; it is immediately replayed the last known batch
    /// for every path, then receives every future capture in full.
    pub fn attach_consumer(&self, consumer: impl Fn(&Path, &[Diagnostic]) + Send + Sync + 'static) {
        let replay: Vec<(PathBuf, Vec<Diagnostic>)> = {
            let inner = self.lock();
            inner
                .current
                .iter()
                .map(|(p, batch)| (p.clone(), batch.clone()))
                .collect()
        };
        for (path, batch) in &replay {
            consumer(path, batch);
        }
        self.lock().consumers.push(Arc::new(consumer));
    }

    /// Retained diagnostics for `path`, in server order.
    #[must_use]
    pub fn diagnostics_for(&self, path: &Path) -> Vec<Diagnostic> {
        self.lock().current.get(path).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn paths_with_diagnostics(&self) -> Vec<PathBuf> {
        self.lock().current.keys().cloned().collect()
    }

    // ── Views and save reprocessing ────────────────────────────────────

    pub fn view_opened(&self, path: &Path) {
        *self.lock().views.entry(path.to_path_buf()).or_insert(0) += 1;
    }

    pub fn view_closed(&self, path: &Path) {
        let mut inner = self.lock();
        if let Some(count) = inner.views.get_mut(path) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                inner.views.remove(path);
            }
        }
    }

    #[must_use]
    pub fn has_open_view(&self, path: &Path) -> bool {
        self.lock().views.contains_key(path)
    }

    /// Schedule save-triggered reprocessing of the last raw batch.
    ///
    /// Runs on the work queue, never inline, so the save handler that
    /// called this has returned before diagnostics churn again. A path
    /// with no open view or no stored batch is left alone.
    pub fn on_document_saved(&self, path: &Path, queue: &dyn WorkQueue) {
        if !self.has_open_view(path) {
            return;
        }
        let pipeline = self.clone();
        let path = path.to_path_buf();
        queue.defer(Box::new(move || {
            let raw = pipeline.lock().raw.get(&path).cloned();
            if let Some(raw) = raw {
                tracing::debug!(path = %path.display(), "reprocessing diagnostics after save");
                pipeline.capture(&path, raw);
            }
        }));
    }

    /// Drop all state for a path (document closed, session stopped) and
    /// tell consumers the path is now clean.
    pub fn remove_path(&self, path: &Path) {
        {
            let mut inner = self.lock();
            inner.raw.remove(path);
            inner.current.remove(path);
            inner.intentions.remove(path);
        }
        self.fan_out(path, &[]);
    }

    // ── Intentions index ───────────────────────────────────────────────

    /// Intentions whose span contains `point`.
    #[must_use]
    pub fn intentions_at(&self, path: &Path, point: Point) -> Vec<Intention> {
        self.lock()
            .intentions
            .get(path)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|i| i.span.contains(point))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    #[must_use]
    pub fn intentions_for(&self, path: &Path) -> Vec<Intention> {
        self.lock().intentions.get(path).cloned().unwrap_or_default()
    }

    /// Union of all retained diagnostic spans for `path`, the range used
    /// for a bulk contextual-action prefetch.
    #[must_use]
    pub fn interesting_span(&self, path: &Path) -> Option<Span> {
        let inner = self.lock();
        let diags = inner.current.get(path)?;
        let mut spans = diags.iter().map(Diagnostic::span);
        let first = spans.next()?;
        Some(spans.fold(first, |acc, s| acc.union(s)))
    }

    /// Distribute bulk contextual-action results to individual intentions
    /// by matching each action's declared related diagnostics against the
    /// identity-key map. Actions naming no known diagnostic are dropped.
    pub fn attach_actions(&self, path: &Path, actions: &[serde_json::Value]) {
        let mut inner = self.lock();
        let Some(entries) = inner.intentions.get_mut(path) else {
            return;
        };
        for action in actions {
            let related_keys = action_related_keys(action);
            for entry in entries.iter_mut() {
                if related_keys.contains(&entry.key) {
                    entry.actions.push(action.clone());
                }
            }
        }
    }
}

/// Identity keys of the diagnostics an action declares itself related to.
fn action_related_keys(action: &serde_json::Value) -> Vec<DiagnosticKey> {
    action
        .get("diagnostics")
        .and_then(|d| d.as_array())
        .map(|wire| {
            wire.iter()
                .filter_map(|value| {
                    serde_json::from_value::<crate::protocol::WireDiagnostic>(value.clone()).ok()
                })
                .map(|wire| wire.to_diagnostic().key())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    use liaison_types::Severity;

    struct ImmediateQueue {
        deferred: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    }

    impl ImmediateQueue {
        fn new() -> Self {
            Self {
                deferred: Mutex::new(Vec::new()),
            }
        }

        /// Run everything deferred so far, like the host's next tick.
        fn drain(&self) {
            let work: Vec<_> = self.deferred.lock().unwrap().drain(..).collect();
            for w in work {
                w();
            }
        }

        fn pending(&self) -> usize {
            self.deferred.lock().unwrap().len()
        }
    }

    impl WorkQueue for ImmediateQueue {
        fn defer(&self, work: Box<dyn FnOnce() + Send>) {
            self.deferred.lock().unwrap().push(work);
        }
    }

    fn warn(msg: &str, start: (u32, u32), end: (u32, u32)) -> Diagnostic {
        Diagnostic::new(
            Severity::Warning,
            msg.to_string(),
            Span::new(Point::new(start.0, start.1), Point::new(end.0, end.1)),
            "W1".to_string(),
            "lint".to_string(),
        )
    }

    #[test]
    fn test_identity_keys_stable_across_resubmission() {
        let pipeline = DiagnosticsPipeline::new();
        let path = Path::new("/proj/src/a.rs");

        pipeline.capture(path, vec![warn("unused var", (1, 0), (1, 5))]);
        let first: Vec<DiagnosticKey> = pipeline
            .diagnostics_for(path)
            .iter()
            .map(Diagnostic::key)
            .collect();

        // New instances, identical content.
        pipeline.capture(path, vec![warn("unused var", (1, 0), (1, 5))]);
        let second: Vec<DiagnosticKey> = pipeline
            .diagnostics_for(path)
            .iter()
            .map(Diagnostic::key)
            .collect();

        assert_eq!(first, second);
    }

    #[test]
    fn test_later_batch_supersedes_earlier() {
        let pipeline = DiagnosticsPipeline::new();
        let path = Path::new("/proj/src/a.rs");
        pipeline.capture(path, vec![warn("one", (0, 0), (0, 1)), warn("two", (1, 0), (1, 1))]);
        pipeline.capture(path, vec![warn("three", (2, 0), (2, 1))]);

        let current = pipeline.diagnostics_for(path);
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].message(), "three");
        assert_eq!(pipeline.intentions_for(path).len(), 1);
    }

    #[test]
    fn test_suppressed_diagnostics_appear_nowhere() {
        let pipeline = DiagnosticsPipeline::new();
        pipeline.set_suppression(|d| d.message().starts_with("noisy"));

        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let seen_clone = seen.clone();
        pipeline.attach_consumer(move |_, batch| {
            let mut seen = seen_clone.lock().unwrap();
            seen.extend(batch.iter().map(|d| d.message().to_string()));
        });

        let path = Path::new("/proj/src/a.rs");
        pipeline.capture(
            path,
            vec![warn("noisy style nit", (0, 0), (0, 1)), warn("real problem", (1, 0), (1, 1))],
        );

        assert_eq!(pipeline.diagnostics_for(path).len(), 1);
        assert_eq!(pipeline.intentions_for(path).len(), 1);
        assert_eq!(*seen.lock().unwrap(), vec!["real problem"]);
    }

    #[test]
    fn test_consumer_attached_late_gets_full_replay() {
        let pipeline = DiagnosticsPipeline::new();
        pipeline.capture(Path::new("/proj/a.rs"), vec![warn("a", (0, 0), (0, 1))]);
        pipeline.capture(Path::new("/proj/b.rs"), vec![warn("b", (0, 0), (0, 1))]);

        let seen = Arc::new(Mutex::new(Vec::<PathBuf>::new()));
        let seen_clone = seen.clone();
        pipeline.attach_consumer(move |path, _| {
            seen_clone.lock().unwrap().push(path.to_path_buf());
        });

        let mut replayed = seen.lock().unwrap().clone();
        replayed.sort();
        assert_eq!(
            replayed,
            vec![PathBuf::from("/proj/a.rs"), PathBuf::from("/proj/b.rs")]
        );
    }

    #[test]
    fn test_save_reprocessing_is_deferred_and_does_not_duplicate() {
        let pipeline = DiagnosticsPipeline::new();
        let path = Path::new("/proj/src/a.rs");
        let queue = ImmediateQueue::new();

        pipeline.view_opened(path);
        pipeline.capture(path, vec![warn("unused var", (1, 0), (1, 5))]);
        let key_before = pipeline.intentions_for(path)[0].key.clone();

        pipeline.on_document_saved(path, &queue);
        // Nothing happens inside the save handler itself.
        assert_eq!(queue.pending(), 1);
        assert_eq!(pipeline.intentions_for(path).len(), 1);

        queue.drain();
        let intentions = pipeline.intentions_for(path);
        assert_eq!(intentions.len(), 1, "reprocessing must not duplicate");
        assert_eq!(intentions[0].key, key_before);
        assert_eq!(key_before.as_str(), "unused var:Warning:W1:(1,0)-(1,5)");
    }

    #[test]
    fn test_save_without_open_view_is_a_noop() {
        let pipeline = DiagnosticsPipeline::new();
        let path = Path::new("/proj/src/a.rs");
        let queue = ImmediateQueue::new();
        pipeline.capture(path, vec![warn("x", (0, 0), (0, 1))]);

        pipeline.on_document_saved(path, &queue);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn test_view_tracking_counts() {
        let pipeline = DiagnosticsPipeline::new();
        let path = Path::new("/proj/a.rs");
        pipeline.view_opened(path);
        pipeline.view_opened(path);
        pipeline.view_closed(path);
        assert!(pipeline.has_open_view(path));
        pipeline.view_closed(path);
        assert!(!pipeline.has_open_view(path));
    }

    #[test]
    fn test_remove_path_clears_and_notifies_empty() {
        let pipeline = DiagnosticsPipeline::new();
        let path = Path::new("/proj/a.rs");
        pipeline.capture(path, vec![warn("x", (0, 0), (0, 1))]);

        let last_len = Arc::new(Mutex::new(usize::MAX));
        let last_len_clone = last_len.clone();
        pipeline.attach_consumer(move |_, batch| {
            *last_len_clone.lock().unwrap() = batch.len();
        });

        pipeline.remove_path(path);
        assert!(pipeline.diagnostics_for(path).is_empty());
        assert!(pipeline.intentions_for(path).is_empty());
        assert_eq!(*last_len.lock().unwrap(), 0);
    }

    #[test]
    fn test_intentions_lookup_by_point() {
        let pipeline = DiagnosticsPipeline::new();
        let path = Path::new("/proj/a.rs");
        pipeline.capture(
            path,
            vec![warn("on line 1", (1, 0), (1, 5)), warn("on line 3", (3, 2), (3, 8))],
        );

        let hits = pipeline.intentions_at(path, Point::new(1, 3));
        assert_eq!(hits.len(), 1);
        assert!(hits[0].key.as_str().starts_with("on line 1"));
        assert!(pipeline.intentions_at(path, Point::new(2, 0)).is_empty());
    }

    #[test]
    fn test_interesting_span_is_union() {
        let pipeline = DiagnosticsPipeline::new();
        let path = Path::new("/proj/a.rs");
        pipeline.capture(
            path,
            vec![warn("a", (1, 4), (1, 9)), warn("b", (5, 0), (5, 3))],
        );
        let span = pipeline.interesting_span(path).unwrap();
        assert_eq!(span, Span::new(Point::new(1, 4), Point::new(5, 3)));
        assert!(pipeline.interesting_span(Path::new("/none")).is_none());
    }

    #[test]
    fn test_attach_actions_distributes_by_identity_key() {
        let pipeline = DiagnosticsPipeline::new();
        let path = Path::new("/proj/a.rs");
        pipeline.capture(
            path,
            vec![warn("unused var", (1, 0), (1, 5)), warn("other", (2, 0), (2, 3))],
        );

        // Action declaring the same diagnostic in wire shape.
        let fix = serde_json::json!({
            "title": "Remove unused variable",
            "kind": "quickfix",
            "diagnostics": [{
                "range": { "start": { "line": 1, "character": 0 }, "end": { "line": 1, "character": 5 } },
                "severity": 2,
                "code": "W1",
                "source": "lint",
                "message": "unused var"
            }]
        });
        let unrelated = serde_json::json!({
            "title": "Organize imports",
            "kind": "source.organizeImports"
        });
        pipeline.attach_actions(path, &[fix, unrelated]);

        let intentions = pipeline.intentions_for(path);
        let unused = intentions
            .iter()
            .find(|i| i.key.as_str().starts_with("unused var"))
            .unwrap();
        assert_eq!(unused.actions.len(), 1);
        assert_eq!(unused.actions[0]["title"], "Remove unused variable");
        let other = intentions
            .iter()
            .find(|i| i.key.as_str().starts_with("other"))
            .unwrap();
        assert!(other.actions.is_empty());
    }

    #[test]
    fn test_suppressed_diagnostics_get_no_actions() {
        let pipeline = DiagnosticsPipeline::new();
        pipeline.set_suppression(|d| d.message() == "suppressed");
        let path = Path::new("/proj/a.rs");
        pipeline.capture(path, vec![warn("suppressed", (0, 0), (0, 1))]);

        let action = serde_json::json!({
            "title": "fix",
            "diagnostics": [{
                "range": { "start": { "line": 0, "character": 0 }, "end": { "line": 0, "character": 1 } },
                "severity": 2,
                "code": "W1",
                "source": "lint",
                "message": "suppressed"
            }]
        });
        pipeline.attach_actions(path, &[action]);
        assert!(pipeline.intentions_for(path).is_empty());
    }
}
