//! Protocol message types and param builders.
//!
//! Only the method surface the runtime actually routes is modeled here:
//! lifecycle (initialize/initialized, shutdown/exit), document sync,
//! diagnostics push, completion and resolve, code actions, definition,
//! and request cancellation. Wire shapes are deserialized into the host
//! types from `liaison-types` at this boundary.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use liaison_types::{Diagnostic, Point, RelatedLocation, Severity, Span, Suggestion};

#[derive(Debug, thiserror::Error)]
#[error("cannot convert path to file URI: {}", path.display())]
pub struct PathToUriError {
    path: PathBuf,
}

/// A protocol-level error returned by the server for a request.
#[derive(Debug, Clone, Deserialize, thiserror::Error)]
#[error("server error {code}: {message}")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

/// Error code for "method not found", replied to unhandled server requests.
pub const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, Serialize)]
pub(crate) struct Request {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl Request {
    pub fn new(id: u64, method: &'static str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Notification {
    pub jsonrpc: &'static str,
    pub method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl Notification {
    pub fn new(method: &'static str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
        }
    }
}

/// A frame received from the server, classified.
///
/// Server-initiated request ids are echoed verbatim (number or string),
/// so they stay as raw JSON values.
#[derive(Debug)]
pub(crate) enum Incoming {
    Response {
        id: u64,
        result: Option<serde_json::Value>,
        error: Option<RpcError>,
    },
    ServerRequest {
        id: serde_json::Value,
        method: String,
        params: Option<serde_json::Value>,
    },
    Notification {
        method: String,
        params: Option<serde_json::Value>,
    },
}

pub(crate) fn classify(frame: &serde_json::Value) -> Option<Incoming> {
    let id = frame.get("id");
    let method = frame
        .get("method")
        .and_then(|m| m.as_str())
        .map(String::from);
    let has_result_or_error = frame.get("result").is_some() || frame.get("error").is_some();

    match (id, method, has_result_or_error) {
        (Some(id_val), None, true) => Some(Incoming::Response {
            id: id_val.as_u64()?,
            result: frame.get("result").cloned(),
            error: frame
                .get("error")
                .and_then(|e| serde_json::from_value(e.clone()).ok()),
        }),
        (Some(id_val), Some(method), _) => Some(Incoming::ServerRequest {
            id: id_val.clone(),
            method,
            params: frame.get("params").cloned(),
        }),
        (None, Some(method), _) => Some(Incoming::Notification {
            method,
            params: frame.get("params").cloned(),
        }),
        _ => None,
    }
}

/// Build a success response to a server-initiated request.
pub(crate) fn response_frame(id: &serde_json::Value, result: serde_json::Value) -> serde_json::Value {
    serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

/// Build an error response to a server-initiated request.
pub(crate) fn error_response_frame(
    id: &serde_json::Value,
    code: i64,
    message: &str,
) -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message }
    })
}

// ── Param builders ─────────────────────────────────────────────────────

/// The full declared client capability object, sent once per session and
/// never renegotiated.
pub(crate) fn initialize_params(
    root_uri: &str,
    initialization_options: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut params = serde_json::json!({
        "processId": std::process::id(),
        "rootUri": root_uri,
        "capabilities": {
            "workspace": {
                "applyEdit": true,
                "workspaceEdit": {
                    "documentChanges": true,
                    "resourceOperations": ["create", "rename", "delete"],
                    "failureHandling": "textOnlyTransactional"
                },
                "configuration": true,
                "workspaceFolders": true,
                "didChangeWatchedFiles": { "dynamicRegistration": false },
                "symbol": { "dynamicRegistration": false }
            },
            "textDocument": {
                "synchronization": {
                    "dynamicRegistration": false,
                    "willSave": false,
                    "willSaveWaitUntil": false,
                    "didSave": true
                },
                "completion": {
                    "completionItem": {
                        "snippetSupport": true,
                        "insertReplaceSupport": true,
                        "resolveSupport": {
                            "properties": ["documentation", "detail", "additionalTextEdits"]
                        }
                    },
                    "contextSupport": true
                },
                "publishDiagnostics": {
                    "relatedInformation": true
                },
                "codeAction": {
                    "codeActionLiteralSupport": {
                        "codeActionKind": {
                            "valueSet": [
                                "", "quickfix", "refactor", "refactor.extract",
                                "refactor.inline", "refactor.rewrite",
                                "source", "source.organizeImports", "source.fixAll"
                            ]
                        }
                    }
                },
                "hover": { "contentFormat": ["markdown", "plaintext"] },
                "signatureHelp": {},
                "definition": {},
                "references": {},
                "documentSymbol": { "hierarchicalDocumentSymbolSupport": true },
                "rename": { "prepareSupport": true },
                "formatting": {},
                "rangeFormatting": {}
            },
            "window": {
                "workDoneProgress": true
            }
        },
        "workspaceFolders": [{
            "uri": root_uri,
            "name": "workspace"
        }]
    });
    if let Some(options) = initialization_options {
        params["initializationOptions"] = options;
    }
    params
}

pub(crate) fn did_open_params(
    uri: &str,
    language_id: &str,
    version: i32,
    text: &str,
) -> serde_json::Value {
    serde_json::json!({
        "textDocument": {
            "uri": uri,
            "languageId": language_id,
            "version": version,
            "text": text
        }
    })
}

pub(crate) fn did_change_params(uri: &str, version: i32, text: &str) -> serde_json::Value {
    serde_json::json!({
        "textDocument": { "uri": uri, "version": version },
        "contentChanges": [{ "text": text }]
    })
}

pub(crate) fn did_save_params(uri: &str) -> serde_json::Value {
    serde_json::json!({ "textDocument": { "uri": uri } })
}

pub(crate) fn did_close_params(uri: &str) -> serde_json::Value {
    serde_json::json!({ "textDocument": { "uri": uri } })
}

/// Completion trigger kinds, per the wire protocol's numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    Invoked = 1,
    TriggerCharacter = 2,
    IncompleteResults = 3,
}

pub(crate) fn completion_params(
    uri: &str,
    position: Point,
    trigger_kind: TriggerKind,
    trigger_character: Option<&str>,
) -> serde_json::Value {
    let mut context = serde_json::json!({ "triggerKind": trigger_kind as u8 });
    if let Some(ch) = trigger_character {
        context["triggerCharacter"] = serde_json::json!(ch);
    }
    serde_json::json!({
        "textDocument": { "uri": uri },
        "position": position,
        "context": context
    })
}

pub(crate) fn code_action_params(
    uri: &str,
    span: Span,
    diagnostics: &[serde_json::Value],
) -> serde_json::Value {
    serde_json::json!({
        "textDocument": { "uri": uri },
        "range": span,
        "context": { "diagnostics": diagnostics }
    })
}

pub(crate) fn definition_params(uri: &str, position: Point) -> serde_json::Value {
    serde_json::json!({
        "textDocument": { "uri": uri },
        "position": position
    })
}

pub(crate) fn cancel_params(id: u64) -> serde_json::Value {
    serde_json::json!({ "id": id })
}

// ── Negotiated capabilities ────────────────────────────────────────────

/// Completion provider options declared by the server.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompletionOptions {
    pub trigger_characters: Vec<String>,
    pub resolve_provider: bool,
}

/// The subset of the server's declared capability object the runtime
/// gates adapters on. Static per session; never renegotiated.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerCapabilities {
    pub completion_provider: Option<CompletionOptions>,
    pub code_action_provider: Option<serde_json::Value>,
    pub hover_provider: Option<serde_json::Value>,
    pub definition_provider: Option<serde_json::Value>,
    pub references_provider: Option<serde_json::Value>,
    pub document_symbol_provider: Option<serde_json::Value>,
    pub rename_provider: Option<serde_json::Value>,
    pub document_formatting_provider: Option<serde_json::Value>,
    pub document_range_formatting_provider: Option<serde_json::Value>,
    pub signature_help_provider: Option<serde_json::Value>,
    pub text_document_sync: Option<serde_json::Value>,
}

impl ServerCapabilities {
    /// Servers declare boolean-or-structured provider flags; `false` and
    /// absent both mean "not provided".
    #[must_use]
    pub fn provider_enabled(value: &Option<serde_json::Value>) -> bool {
        match value {
            None => false,
            Some(serde_json::Value::Bool(b)) => *b,
            Some(serde_json::Value::Null) => false,
            Some(_) => true,
        }
    }
}

// ── Wire diagnostics ───────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct PublishDiagnosticsParams {
    pub uri: String,
    pub diagnostics: Vec<WireDiagnostic>,
}

/// Diagnostic codes arrive as numbers or strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum WireCode {
    Number(i64),
    String(String),
}

impl WireCode {
    fn into_string(self) -> String {
        match self {
            Self::Number(n) => n.to_string(),
            Self::String(s) => s,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireRelatedInformation {
    pub location: WireLocation,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct WireLocation {
    pub uri: String,
    pub range: Span,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireDiagnostic {
    pub range: Span,
    pub severity: Option<u64>,
    pub code: Option<WireCode>,
    pub source: Option<String>,
    pub message: String,
    #[serde(default)]
    pub related_information: Vec<WireRelatedInformation>,
}

impl WireDiagnostic {
    /// Convert into host shape. Missing severity falls back to Warning;
    /// missing source to "unknown", resolved here at the boundary.
    pub fn to_diagnostic(&self) -> Diagnostic {
        let related = self
            .related_information
            .iter()
            .filter_map(|info| {
                uri_to_path(&info.location.uri).map(|path| RelatedLocation {
                    path,
                    span: info.location.range,
                    message: info.message.clone(),
                })
            })
            .collect();
        Diagnostic::new(
            self.severity
                .and_then(Severity::from_wire)
                .unwrap_or(Severity::Warning),
            self.message.clone(),
            self.range,
            self.code
                .clone()
                .map(WireCode::into_string)
                .unwrap_or_default(),
            self.source
                .clone()
                .unwrap_or_else(|| String::from("unknown")),
        )
        .with_related(related)
    }
}

/// Serialize a host diagnostic back to wire shape, for code-action
/// context. Keys derived from the round trip stay equal.
pub(crate) fn diagnostic_to_wire(diagnostic: &Diagnostic) -> serde_json::Value {
    serde_json::json!({
        "range": diagnostic.span(),
        "severity": diagnostic.severity() as u8,
        "code": diagnostic.code(),
        "source": diagnostic.source(),
        "message": diagnostic.message()
    })
}

/// Parse a definition/references response: a single location, a location
/// array, or a location-link array. Non-file URIs are dropped.
pub(crate) fn parse_locations(value: &serde_json::Value) -> Vec<(PathBuf, Span)> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum WireTarget {
        Location {
            uri: String,
            range: Span,
        },
        Link {
            #[serde(rename = "targetUri")]
            target_uri: String,
            #[serde(rename = "targetSelectionRange")]
            target_selection_range: Span,
        },
    }

    let targets: Vec<WireTarget> = match value {
        serde_json::Value::Array(_) => serde_json::from_value(value.clone()).unwrap_or_default(),
        serde_json::Value::Null => Vec::new(),
        single => serde_json::from_value(single.clone())
            .map(|t| vec![t])
            .unwrap_or_default(),
    };
    targets
        .into_iter()
        .filter_map(|target| match target {
            WireTarget::Location { uri, range } => uri_to_path(&uri).map(|p| (p, range)),
            WireTarget::Link {
                target_uri,
                target_selection_range,
            } => uri_to_path(&target_uri).map(|p| (p, target_selection_range)),
        })
        .collect()
}

// ── Wire completion ────────────────────────────────────────────────────

/// Completion responses are either a bare item array or a list object
/// with an `isIncomplete` flag.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum CompletionResponse {
    List(CompletionList),
    Items(Vec<WireCompletionItem>),
}

impl CompletionResponse {
    pub fn into_list(self) -> CompletionList {
        match self {
            Self::List(list) => list,
            Self::Items(items) => CompletionList {
                is_incomplete: false,
                items,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CompletionList {
    #[serde(default)]
    pub is_incomplete: bool,
    pub items: Vec<WireCompletionItem>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum WireDocumentation {
    Plain(String),
    Markup { value: String },
}

impl WireDocumentation {
    fn into_string(self) -> String {
        match self {
            Self::Plain(s) => s,
            Self::Markup { value } => value,
        }
    }
}

/// A text edit is either a plain range edit or an insert/replace pair.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum WireTextEdit {
    InsertReplace {
        #[serde(rename = "newText")]
        new_text: String,
        insert: Span,
        replace: Span,
    },
    Plain {
        range: Span,
        #[serde(rename = "newText")]
        new_text: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireAdditionalEdit {
    pub range: Span,
    pub new_text: String,
}

const INSERT_FORMAT_SNIPPET: u8 = 2;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireCompletionItem {
    pub label: String,
    pub kind: Option<u8>,
    pub detail: Option<String>,
    pub documentation: Option<WireDocumentation>,
    pub filter_text: Option<String>,
    pub insert_text: Option<String>,
    pub insert_text_format: Option<u8>,
    pub text_edit: Option<WireTextEdit>,
    #[serde(default)]
    pub additional_text_edits: Vec<WireAdditionalEdit>,
}

fn completion_kind_label(kind: u8) -> &'static str {
    match kind {
        1 => "text",
        2 => "method",
        3 => "function",
        4 => "constructor",
        5 => "field",
        6 => "variable",
        7 => "class",
        8 => "interface",
        9 => "module",
        10 => "property",
        13 => "enum",
        14 => "keyword",
        15 => "snippet",
        21 => "constant",
        22 => "struct",
        _ => "",
    }
}

impl WireCompletionItem {
    /// Convert to the host candidate shape, preserving insertion text or
    /// snippet body, label, insert-vs-replace spans, and satellite edits.
    pub fn to_suggestion(&self) -> Suggestion {
        let primary = self
            .insert_text
            .clone()
            .or_else(|| match &self.text_edit {
                Some(WireTextEdit::Plain { new_text, .. })
                | Some(WireTextEdit::InsertReplace { new_text, .. }) => Some(new_text.clone()),
                None => None,
            })
            .unwrap_or_else(|| self.label.clone());

        let is_snippet = self.insert_text_format == Some(INSERT_FORMAT_SNIPPET);

        let (insert_span, replace_span) = match &self.text_edit {
            Some(WireTextEdit::Plain { range, .. }) => (Some(*range), None),
            Some(WireTextEdit::InsertReplace {
                insert, replace, ..
            }) => (Some(*insert), Some(*replace)),
            None => (None, None),
        };

        let filter_text = self
            .filter_text
            .clone()
            .or_else(|| (!self.label.is_empty()).then(|| self.label.clone()));

        Suggestion {
            label: self.label.clone(),
            text: if is_snippet { String::new() } else { primary.clone() },
            snippet: is_snippet.then_some(primary),
            filter_text,
            kind: self
                .kind
                .map(completion_kind_label)
                .unwrap_or_default()
                .to_string(),
            detail: self.detail.clone(),
            documentation: self.documentation.clone().map(WireDocumentation::into_string),
            insert_span,
            replace_span,
            satellite_edits: self
                .additional_text_edits
                .iter()
                .map(|edit| liaison_types::SatelliteEdit {
                    span: edit.range,
                    new_text: edit.new_text.clone(),
                })
                .collect(),
        }
    }
}

// ── URI conversion ─────────────────────────────────────────────────────

pub(crate) fn path_to_uri(path: &Path) -> Result<url::Url, PathToUriError> {
    url::Url::from_file_path(path).map_err(|()| PathToUriError {
        path: path.to_path_buf(),
    })
}

pub(crate) fn uri_to_path(uri: &str) -> Option<PathBuf> {
    url::Url::parse(uri).ok().and_then(|u| u.to_file_path().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_params_has_required_fields() {
        let params = initialize_params("file:///workspace", None);
        assert!(params["processId"].is_number());
        assert_eq!(params["rootUri"], "file:///workspace");
        assert!(params["capabilities"]["textDocument"]["completion"].is_object());
        assert!(params.get("initializationOptions").is_none());
    }

    #[test]
    fn test_initialize_params_with_options() {
        let params = initialize_params(
            "file:///workspace",
            Some(serde_json::json!({ "checkOnSave": false })),
        );
        assert_eq!(params["initializationOptions"]["checkOnSave"], false);
    }

    #[test]
    fn test_classify_response() {
        let frame = serde_json::json!({ "jsonrpc": "2.0", "id": 3, "result": {} });
        match classify(&frame) {
            Some(Incoming::Response { id, result, error }) => {
                assert_eq!(id, 3);
                assert!(result.is_some());
                assert!(error.is_none());
            }
            other => panic!("expected Response, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_error_response() {
        let frame = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 4,
            "error": { "code": -32600, "message": "invalid request" }
        });
        match classify(&frame) {
            Some(Incoming::Response { error: Some(e), .. }) => {
                assert_eq!(e.code, -32600);
            }
            other => panic!("expected error Response, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_server_request_keeps_raw_id() {
        let frame = serde_json::json!({
            "jsonrpc": "2.0",
            "id": "cfg-1",
            "method": "workspace/configuration",
            "params": { "items": [] }
        });
        match classify(&frame) {
            Some(Incoming::ServerRequest { id, method, .. }) => {
                assert_eq!(id, serde_json::json!("cfg-1"));
                assert_eq!(method, "workspace/configuration");
            }
            other => panic!("expected ServerRequest, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_notification() {
        let frame = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "textDocument/publishDiagnostics",
            "params": {}
        });
        assert!(matches!(
            classify(&frame),
            Some(Incoming::Notification { .. })
        ));
    }

    #[test]
    fn test_classify_garbage_is_none() {
        assert!(classify(&serde_json::json!({ "jsonrpc": "2.0" })).is_none());
    }

    #[test]
    fn test_request_params_omitted_not_null() {
        let req = Request::new(1, "shutdown", None);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["method"], "shutdown");
        assert!(json.get("params").is_none(), "params must be omitted");
    }

    #[test]
    fn test_completion_params_with_trigger() {
        let params = completion_params(
            "file:///a.rs",
            Point::new(3, 10),
            TriggerKind::TriggerCharacter,
            Some("."),
        );
        assert_eq!(params["context"]["triggerKind"], 2);
        assert_eq!(params["context"]["triggerCharacter"], ".");
        assert_eq!(params["position"]["line"], 3);
        assert_eq!(params["position"]["character"], 10);
    }

    #[test]
    fn test_completion_params_invoked_has_no_trigger_char() {
        let params = completion_params("file:///a.rs", Point::new(0, 0), TriggerKind::Invoked, None);
        assert_eq!(params["context"]["triggerKind"], 1);
        assert!(params["context"].get("triggerCharacter").is_none());
    }

    #[test]
    fn test_server_capabilities_subset() {
        let caps: ServerCapabilities = serde_json::from_value(serde_json::json!({
            "completionProvider": {
                "triggerCharacters": [".", "::"],
                "resolveProvider": true
            },
            "codeActionProvider": true,
            "hoverProvider": false,
            "renameProvider": { "prepareProvider": true },
            "textDocumentSync": 1
        }))
        .unwrap();
        let completion = caps.completion_provider.as_ref().unwrap();
        assert_eq!(completion.trigger_characters, vec![".", "::"]);
        assert!(completion.resolve_provider);
        assert!(ServerCapabilities::provider_enabled(&caps.code_action_provider));
        assert!(!ServerCapabilities::provider_enabled(&caps.hover_provider));
        assert!(ServerCapabilities::provider_enabled(&caps.rename_provider));
        assert!(!ServerCapabilities::provider_enabled(&caps.definition_provider));
    }

    #[test]
    fn test_wire_diagnostic_conversion() {
        let wire: WireDiagnostic = serde_json::from_value(serde_json::json!({
            "range": { "start": { "line": 1, "character": 0 }, "end": { "line": 1, "character": 5 } },
            "severity": 2,
            "code": "W1",
            "source": "lint",
            "message": "unused var"
        }))
        .unwrap();
        let diag = wire.to_diagnostic();
        assert_eq!(diag.severity(), Severity::Warning);
        assert_eq!(diag.code(), "W1");
        assert_eq!(diag.source(), "lint");
        assert_eq!(diag.key().as_str(), "unused var:Warning:W1:(1,0)-(1,5)");
    }

    #[test]
    fn test_wire_diagnostic_numeric_code() {
        let wire: WireDiagnostic = serde_json::from_value(serde_json::json!({
            "range": { "start": { "line": 0, "character": 0 }, "end": { "line": 0, "character": 1 } },
            "code": 6133,
            "message": "declared but never used"
        }))
        .unwrap();
        assert_eq!(wire.to_diagnostic().code(), "6133");
    }

    #[test]
    fn test_wire_diagnostic_missing_severity_defaults_to_warning() {
        let wire: WireDiagnostic = serde_json::from_value(serde_json::json!({
            "range": { "start": { "line": 0, "character": 0 }, "end": { "line": 0, "character": 1 } },
            "message": "some finding"
        }))
        .unwrap();
        assert_eq!(wire.to_diagnostic().severity(), Severity::Warning);
        assert_eq!(wire.to_diagnostic().source(), "unknown");
    }

    #[test]
    fn test_completion_response_bare_array() {
        let response: CompletionResponse =
            serde_json::from_value(serde_json::json!([{ "label": "foo" }])).unwrap();
        let list = response.into_list();
        assert!(!list.is_incomplete);
        assert_eq!(list.items.len(), 1);
    }

    #[test]
    fn test_completion_response_list_form() {
        let response: CompletionResponse = serde_json::from_value(serde_json::json!({
            "isIncomplete": true,
            "items": [{ "label": "foo" }, { "label": "bar" }]
        }))
        .unwrap();
        let list = response.into_list();
        assert!(list.is_incomplete);
        assert_eq!(list.items.len(), 2);
    }

    #[test]
    fn test_completion_item_snippet_conversion() {
        let item: WireCompletionItem = serde_json::from_value(serde_json::json!({
            "label": "println!",
            "kind": 15,
            "insertText": "println!(\"$1\")",
            "insertTextFormat": 2
        }))
        .unwrap();
        let suggestion = item.to_suggestion();
        assert_eq!(suggestion.snippet.as_deref(), Some("println!(\"$1\")"));
        assert!(suggestion.text.is_empty());
        assert_eq!(suggestion.kind, "snippet");
    }

    #[test]
    fn test_completion_item_insert_replace_edit() {
        let item: WireCompletionItem = serde_json::from_value(serde_json::json!({
            "label": "foobar",
            "textEdit": {
                "newText": "foobar",
                "insert": { "start": { "line": 0, "character": 0 }, "end": { "line": 0, "character": 3 } },
                "replace": { "start": { "line": 0, "character": 0 }, "end": { "line": 0, "character": 6 } }
            }
        }))
        .unwrap();
        let suggestion = item.to_suggestion();
        assert!(suggestion.insert_span.is_some());
        assert!(suggestion.replace_span.is_some());
        assert_eq!(suggestion.text, "foobar");
    }

    #[test]
    fn test_completion_item_filter_text_falls_back_to_label() {
        let item: WireCompletionItem =
            serde_json::from_value(serde_json::json!({ "label": "foo" })).unwrap();
        assert_eq!(item.to_suggestion().filter_key(), Some("foo"));
    }

    #[test]
    fn test_completion_item_additional_edits_become_satellites() {
        let item: WireCompletionItem = serde_json::from_value(serde_json::json!({
            "label": "HashMap",
            "additionalTextEdits": [{
                "range": { "start": { "line": 0, "character": 0 }, "end": { "line": 0, "character": 0 } },
                "newText": "use std::collections::HashMap;\n"
            }]
        }))
        .unwrap();
        let suggestion = item.to_suggestion();
        assert_eq!(suggestion.satellite_edits.len(), 1);
        assert!(suggestion.satellite_edits[0].new_text.starts_with("use "));
    }

    #[test]
    fn test_documentation_markup_form() {
        let item: WireCompletionItem = serde_json::from_value(serde_json::json!({
            "label": "foo",
            "documentation": { "kind": "markdown", "value": "Does foo." }
        }))
        .unwrap();
        assert_eq!(item.to_suggestion().documentation.as_deref(), Some("Does foo."));
    }

    #[test]
    fn test_diagnostic_wire_roundtrip_preserves_key() {
        let diag = Diagnostic::new(
            Severity::Warning,
            String::from("unused var"),
            Span::new(Point::new(1, 0), Point::new(1, 5)),
            String::from("W1"),
            String::from("lint"),
        );
        let wire_json = diagnostic_to_wire(&diag);
        let parsed: WireDiagnostic = serde_json::from_value(wire_json).unwrap();
        assert_eq!(parsed.to_diagnostic().key(), diag.key());
    }

    #[test]
    fn test_parse_locations_single_and_array() {
        let single = serde_json::json!({
            "uri": "file:///proj/src/lib.rs",
            "range": { "start": { "line": 2, "character": 0 }, "end": { "line": 2, "character": 4 } }
        });
        let parsed = parse_locations(&single);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].0, PathBuf::from("/proj/src/lib.rs"));

        let array = serde_json::json!([single, {
            "uri": "file:///dep/src/lib.rs",
            "range": { "start": { "line": 0, "character": 0 }, "end": { "line": 0, "character": 1 } }
        }]);
        assert_eq!(parse_locations(&array).len(), 2);
    }

    #[test]
    fn test_parse_locations_links_and_null() {
        let links = serde_json::json!([{
            "targetUri": "file:///dep/lib.rs",
            "targetRange": { "start": { "line": 0, "character": 0 }, "end": { "line": 9, "character": 0 } },
            "targetSelectionRange": { "start": { "line": 1, "character": 4 }, "end": { "line": 1, "character": 8 } }
        }]);
        let parsed = parse_locations(&links);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].1, Span::new(Point::new(1, 4), Point::new(1, 8)));

        assert!(parse_locations(&serde_json::Value::Null).is_empty());
    }

    #[test]
    fn test_path_to_uri_and_back() {
        let path = PathBuf::from("/home/test/src/main.rs");
        let uri = path_to_uri(&path).expect("should create URI");
        let roundtrip = uri_to_path(uri.as_str()).expect("should parse back");
        assert_eq!(roundtrip, path);
    }

    #[test]
    fn test_uri_to_path_rejects_non_file_scheme() {
        assert!(uri_to_path("https://example.com/test.rs").is_none());
        assert!(uri_to_path("not-a-uri").is_none());
    }
}
