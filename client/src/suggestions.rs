//! Suggestion cache and narrowing.
//!
//! One cache per session. A cache entry is reusable for a follow-up
//! keystroke only when the last fetch was complete, the trigger
//! character and trigger point are unchanged, and the cursor has not
//! moved before the original request's position. Everything here is
//! IO-free; the orchestrator issues the actual requests.

use liaison_types::{Point, Suggestion};

use crate::fuzzy;

/// What the user has typed around the cursor, supplied by the host.
#[derive(Debug, Clone)]
pub struct SuggestionContext {
    pub position: Point,
    /// The word prefix being typed, ending at the cursor.
    pub typed_prefix: String,
    /// Full line text before the cursor (includes the prefix).
    pub line_prefix: String,
    /// Explicit invocation bypasses the minimum-prefix gate.
    pub manual: bool,
}

impl SuggestionContext {
    /// Where the typed prefix starts; the anchor the cache entry is
    /// keyed on.
    #[must_use]
    pub fn trigger_point(&self) -> Point {
        let prefix_len = u32::try_from(self.typed_prefix.chars().count()).unwrap_or(0);
        Point::new(
            self.position.line,
            self.position.column.saturating_sub(prefix_len),
        )
    }
}

/// An effective trigger string for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    pub text: String,
    /// Whether the trigger is carried inside the typed prefix — either
    /// just typed ("foo.") or being typed past (".al") — rather than
    /// preceding it.
    pub in_prefix: bool,
}

/// Scan backward from the cursor for the longest configured trigger
/// string. A trigger consumed into the typed prefix wins over one
/// merely preceding it.
#[must_use]
pub fn detect_trigger(triggers: &[String], ctx: &SuggestionContext) -> Option<Trigger> {
    let mut ordered: Vec<&String> = triggers.iter().collect();
    ordered.sort_by_key(|t| std::cmp::Reverse(t.len()));

    for trigger in &ordered {
        if !trigger.is_empty()
            && (ctx.typed_prefix.ends_with(trigger.as_str())
                || ctx.typed_prefix.starts_with(trigger.as_str()))
        {
            return Some(Trigger {
                text: (*trigger).clone(),
                in_prefix: true,
            });
        }
    }

    let preceding = ctx
        .line_prefix
        .strip_suffix(&ctx.typed_prefix)
        .unwrap_or(&ctx.line_prefix);
    for trigger in &ordered {
        if !trigger.is_empty() && preceding.ends_with(trigger.as_str()) {
            return Some(Trigger {
                text: (*trigger).clone(),
                in_prefix: false,
            });
        }
    }
    None
}

/// The minimum-length gate: automatic requests need a prefix of at
/// least `min_prefix_len`; manual invocation and any trigger bypass it.
#[must_use]
pub fn passes_gate(ctx: &SuggestionContext, trigger: Option<&Trigger>, min_prefix_len: usize) -> bool {
    ctx.manual || trigger.is_some() || ctx.typed_prefix.chars().count() >= min_prefix_len
}

/// One cached candidate: the raw wire item (echoed back on resolve)
/// alongside its host shape.
#[derive(Debug, Clone)]
pub struct CachedItem {
    raw: serde_json::Value,
    suggestion: Suggestion,
    resolved: bool,
}

impl CachedItem {
    #[must_use]
    pub fn suggestion(&self) -> &Suggestion {
        &self.suggestion
    }

    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.resolved
    }
}

#[derive(Debug)]
struct CacheEntry {
    incomplete: bool,
    trigger_point: Point,
    request_point: Point,
    trigger_char: Option<String>,
    items: Vec<CachedItem>,
}

/// Per-session completion cache.
#[derive(Debug, Default)]
pub struct SuggestionCache {
    entry: Option<CacheEntry>,
}

impl SuggestionCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The reuse test: returns the cached candidate set as-is on a hit.
    ///
    /// Misses when there is no entry, the entry is flagged incomplete,
    /// the trigger character or trigger point changed, or the cursor
    /// moved before the original request's position.
    #[must_use]
    pub fn lookup(
        &self,
        trigger_point: Point,
        trigger_char: Option<&str>,
        position: Point,
    ) -> Option<&[CachedItem]> {
        let entry = self.entry.as_ref()?;
        if entry.incomplete
            || entry.trigger_char.as_deref() != trigger_char
            || entry.trigger_point != trigger_point
            || position < entry.request_point
        {
            return None;
        }
        Some(&entry.items)
    }

    /// Replace the cache with a fresh response.
    pub fn replace(
        &mut self,
        trigger_point: Point,
        request_point: Point,
        trigger_char: Option<String>,
        incomplete: bool,
        items: Vec<(serde_json::Value, Suggestion)>,
    ) {
        self.entry = Some(CacheEntry {
            incomplete,
            trigger_point,
            request_point,
            trigger_char,
            items: items
                .into_iter()
                .map(|(raw, suggestion)| CachedItem {
                    raw,
                    suggestion,
                    resolved: false,
                })
                .collect(),
        });
    }

    pub fn clear(&mut self) {
        self.entry = None;
    }

    #[must_use]
    pub fn items(&self) -> &[CachedItem] {
        self.entry.as_ref().map_or(&[], |e| e.items.as_slice())
    }

    /// The raw wire item to send in a resolve request, if the candidate
    /// is still unresolved. Resolved candidates never re-request.
    #[must_use]
    pub fn needs_resolve(&self, index: usize) -> Option<&serde_json::Value> {
        let item = self.entry.as_ref()?.items.get(index)?;
        (!item.resolved).then_some(&item.raw)
    }

    /// Merge a resolve response into the candidate. Only detail and
    /// documentation are taken; insertion text and ranges are untouched.
    pub fn apply_resolution(
        &mut self,
        index: usize,
        detail: Option<String>,
        documentation: Option<String>,
    ) -> Option<&Suggestion> {
        let item = self.entry.as_mut()?.items.get_mut(index)?;
        if let Some(detail) = detail {
            item.suggestion.detail = Some(detail);
        }
        if let Some(documentation) = documentation {
            item.suggestion.documentation = Some(documentation);
        }
        item.resolved = true;
        Some(&item.suggestion)
    }
}

/// Narrow candidates against the typed prefix with the fuzzy ranker.
///
/// A bare trigger invocation (the prefix is just the trigger string)
/// skips narrowing: the server's full set is what the user asked for.
/// Candidates without filter text are excluded.
#[must_use]
pub fn narrow(items: &[CachedItem], ctx: &SuggestionContext, trigger: Option<&Trigger>) -> Vec<Suggestion> {
    let bare_trigger = trigger.is_some_and(|t| {
        if t.in_prefix {
            ctx.typed_prefix == t.text
        } else {
            ctx.typed_prefix.is_empty()
        }
    });
    // Narrow on whatever follows the last trigger occurrence: "foo."
    // leaves nothing, ".al" leaves "al".
    let effective_prefix = match trigger {
        Some(t) if t.in_prefix => ctx
            .typed_prefix
            .rsplit(t.text.as_str())
            .next()
            .unwrap_or(ctx.typed_prefix.as_str()),
        _ => ctx.typed_prefix.as_str(),
    };
    if bare_trigger || effective_prefix.is_empty() {
        return items.iter().map(|i| i.suggestion.clone()).collect();
    }

    let mut ranked: Vec<(i32, &Suggestion)> = items
        .iter()
        .filter_map(|item| {
            let key = item.suggestion.filter_key()?;
            fuzzy::score(effective_prefix, key).map(|m| (m.score, &item.suggestion))
        })
        .collect();
    ranked.sort_by_key(|(score, _)| std::cmp::Reverse(*score));
    ranked.into_iter().map(|(_, s)| s.clone()).collect()
}
