//! Capability-gated adapter state, one set per session.
//!
//! Each flag is computed exactly once from the capabilities negotiated
//! at initialize; they are never re-evaluated per request. The session
//! owns this struct outright, so adapter state (like the completion
//! cache) lives and dies with its session.

use crate::protocol::ServerCapabilities;
use crate::suggestions::SuggestionCache;

/// Completion adapter state: the server's declared trigger characters,
/// whether it supports lazy resolve, and the per-session cache.
#[derive(Debug, Default)]
pub struct CompletionAdapter {
    pub trigger_characters: Vec<String>,
    pub resolve_provider: bool,
    pub cache: SuggestionCache,
}

/// The per-session adapter set; absent fields mean the server never
/// declared the capability and the feature is never invoked.
#[derive(Debug, Default)]
pub struct AdapterSet {
    completion: Option<CompletionAdapter>,
    code_actions: bool,
    definitions: bool,
}

impl AdapterSet {
    /// Evaluate every adapter's capability predicate once.
    #[must_use]
    pub fn wire(capabilities: &ServerCapabilities) -> Self {
        Self {
            completion: capabilities
                .completion_provider
                .as_ref()
                .map(|options| CompletionAdapter {
                    trigger_characters: options.trigger_characters.clone(),
                    resolve_provider: options.resolve_provider,
                    cache: SuggestionCache::new(),
                }),
            code_actions: ServerCapabilities::provider_enabled(&capabilities.code_action_provider),
            definitions: ServerCapabilities::provider_enabled(&capabilities.definition_provider),
        }
    }

    #[must_use]
    pub fn completion(&self) -> Option<&CompletionAdapter> {
        self.completion.as_ref()
    }

    pub fn completion_mut(&mut self) -> Option<&mut CompletionAdapter> {
        self.completion.as_mut()
    }

    #[must_use]
    pub fn can_code_actions(&self) -> bool {
        self.code_actions
    }

    #[must_use]
    pub fn can_definitions(&self) -> bool {
        self.definitions
    }
}
