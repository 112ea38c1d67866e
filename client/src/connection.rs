//! Connection layer: typed request/response correlation over a framed
//! channel, a dispatch table for server-initiated traffic, and the
//! per-key cancellation registry.
//!
//! A connection owns two tasks: a writer fed by an mpsc channel and a
//! reader that classifies every incoming frame. Responses are routed to
//! the pending map; server requests go through the dispatch table (or get
//! a MethodNotFound reply — servers block waiting otherwise);
//! notifications go to their registered handler or a trace log.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::codec::{FrameReader, FrameWriter};
use crate::protocol::{
    self, Incoming, METHOD_NOT_FOUND, Notification, Request, RpcError,
};
use crate::transport::Channel;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const WRITER_CHANNEL_CAPACITY: usize = 64;

/// Errors surfaced to adapters for a single request.
///
/// `Rpc` and `Superseded` are recovered locally — the calling adapter
/// treats them as "no result". They are never user-surfaced individually.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("connection closed")]
    ChannelClosed,
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("request superseded by a newer request for the same key")]
    Superseded,
}

pub(crate) enum WriterCommand {
    Send(serde_json::Value),
    Shutdown,
}

type NotificationHandler = Box<dyn Fn(Option<serde_json::Value>) + Send + Sync>;
type RequestHandler =
    Box<dyn Fn(Option<serde_json::Value>) -> Result<serde_json::Value, RpcError> + Send + Sync>;

/// Handlers for server-initiated requests and notifications, registered
/// before the connection starts reading.
#[derive(Default)]
pub struct DispatchTable {
    notifications: HashMap<String, NotificationHandler>,
    requests: HashMap<String, RequestHandler>,
}

impl DispatchTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_notification(
        &mut self,
        method: impl Into<String>,
        handler: impl Fn(Option<serde_json::Value>) + Send + Sync + 'static,
    ) -> &mut Self {
        self.notifications.insert(method.into(), Box::new(handler));
        self
    }

    pub fn on_request(
        &mut self,
        method: impl Into<String>,
        handler: impl Fn(Option<serde_json::Value>) -> Result<serde_json::Value, RpcError>
        + Send
        + Sync
        + 'static,
    ) -> &mut Self {
        self.requests.insert(method.into(), Box::new(handler));
        self
    }
}

type PendingMap = HashMap<u64, oneshot::Sender<Result<serde_json::Value, RpcError>>>;

/// One RPC channel to a server process.
pub struct Connection {
    writer_tx: mpsc::Sender<WriterCommand>,
    next_id: AtomicU64,
    pending: Arc<tokio::sync::Mutex<PendingMap>>,
    #[allow(dead_code)]
    reader_handle: tokio::task::JoinHandle<()>,
    #[allow(dead_code)]
    writer_handle: tokio::task::JoinHandle<()>,
}

impl Connection {
    /// Start the writer and reader tasks over `channel`.
    ///
    /// `on_close` fires once when the read side ends: `None` for a clean
    /// EOF, `Some(error)` for a transport failure.
    pub fn new(
        channel: Channel,
        handlers: DispatchTable,
        on_close: impl FnOnce(Option<String>) + Send + 'static,
    ) -> Self {
        let (writer_tx, mut writer_rx) = mpsc::channel::<WriterCommand>(WRITER_CHANNEL_CAPACITY);

        let mut frame_writer = FrameWriter::new(channel.writer);
        let writer_handle = tokio::spawn(async move {
            while let Some(cmd) = writer_rx.recv().await {
                match cmd {
                    WriterCommand::Send(frame) => {
                        if let Err(e) = frame_writer.write_frame(&frame).await {
                            tracing::warn!("write error: {e}");
                            break;
                        }
                    }
                    WriterCommand::Shutdown => break,
                }
            }
        });

        let pending: Arc<tokio::sync::Mutex<PendingMap>> =
            Arc::new(tokio::sync::Mutex::new(HashMap::new()));
        let reader_pending = pending.clone();
        let reader_writer_tx = writer_tx.clone();
        let mut frame_reader = FrameReader::new(channel.reader);
        let reader_handle = tokio::spawn(async move {
            let close_reason = loop {
                match frame_reader.read_frame().await {
                    Ok(Some(frame)) => {
                        Self::dispatch(&frame, &reader_pending, &handlers, &reader_writer_tx)
                            .await;
                    }
                    Ok(None) => break None,
                    Err(e) => break Some(e.to_string()),
                }
            };
            // Wake every caller still waiting on a response.
            reader_pending.lock().await.clear();
            on_close(close_reason);
        });

        Self {
            writer_tx,
            next_id: AtomicU64::new(1),
            pending,
            reader_handle,
            writer_handle,
        }
    }

    async fn dispatch(
        frame: &serde_json::Value,
        pending: &tokio::sync::Mutex<PendingMap>,
        handlers: &DispatchTable,
        writer_tx: &mpsc::Sender<WriterCommand>,
    ) {
        let Some(incoming) = protocol::classify(frame) else {
            tracing::trace!("ignoring malformed JSON-RPC frame");
            return;
        };

        match incoming {
            Incoming::Response { id, result, error } => {
                // A missing entry means the request was superseded or timed
                // out; the late response is discarded here.
                let sender = pending.lock().await.remove(&id);
                if let Some(tx) = sender {
                    let outcome = match error {
                        Some(e) => Err(e),
                        None => Ok(result.unwrap_or(serde_json::Value::Null)),
                    };
                    let _ = tx.send(outcome);
                }
            }
            Incoming::ServerRequest { id, method, params } => {
                let reply = match handlers.requests.get(&method) {
                    Some(handler) => match handler(params) {
                        Ok(result) => protocol::response_frame(&id, result),
                        Err(e) => protocol::error_response_frame(&id, e.code, &e.message),
                    },
                    None => {
                        tracing::debug!(
                            "server request {method} has no handler, replying method not found"
                        );
                        protocol::error_response_frame(
                            &id,
                            METHOD_NOT_FOUND,
                            &format!("Method not found: {method}"),
                        )
                    }
                };
                let _ = writer_tx.send(WriterCommand::Send(reply)).await;
            }
            Incoming::Notification { method, params } => {
                match handlers.notifications.get(&method) {
                    Some(handler) => handler(params),
                    None => tracing::trace!("ignoring notification: {method}"),
                }
            }
        }
    }

    /// Issue a request and await its response, bounded by the default
    /// timeout.
    pub async fn request(
        &self,
        method: &'static str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, RequestError> {
        self.request_inner(method, params, REQUEST_TIMEOUT, None)
            .await
    }

    /// Issue a request tied to a cancellation token.
    ///
    /// When the token fires, the pending entry is removed immediately —
    /// a late response is discarded, not merely ignored — and an advisory
    /// `$/cancelRequest` is sent to the server. The client-side effect is
    /// immediate regardless of whether the server honors it.
    pub async fn request_cancellable(
        &self,
        method: &'static str,
        params: Option<serde_json::Value>,
        token: &CancellationToken,
    ) -> Result<serde_json::Value, RequestError> {
        self.request_inner(method, params, REQUEST_TIMEOUT, Some(token))
            .await
    }

    async fn request_inner(
        &self,
        method: &'static str,
        params: Option<serde_json::Value>,
        timeout: Duration,
        token: Option<&CancellationToken>,
    ) -> Result<serde_json::Value, RequestError> {
        if let Some(token) = token
            && token.is_cancelled()
        {
            return Err(RequestError::Superseded);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let request = Request::new(id, method, params);
        let frame = serde_json::to_value(&request)
            .map_err(|_| RequestError::ChannelClosed)?;
        if self
            .writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .is_err()
        {
            self.pending.lock().await.remove(&id);
            return Err(RequestError::ChannelClosed);
        }

        let response = async {
            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(outcome)) => outcome.map_err(RequestError::Rpc),
                Ok(Err(_)) => Err(RequestError::ChannelClosed),
                Err(_) => Err(RequestError::Timeout(timeout)),
            }
        };

        match token {
            None => {
                let outcome = response.await;
                if outcome.is_err() {
                    self.pending.lock().await.remove(&id);
                }
                outcome
            }
            Some(token) => {
                tokio::select! {
                    outcome = response => {
                        if outcome.is_err() {
                            self.pending.lock().await.remove(&id);
                        }
                        outcome
                    }
                    () = token.cancelled() => {
                        self.pending.lock().await.remove(&id);
                        let _ = self
                            .notify("$/cancelRequest", Some(protocol::cancel_params(id)))
                            .await;
                        Err(RequestError::Superseded)
                    }
                }
            }
        }
    }

    /// Fire-and-forget notification.
    pub async fn notify(
        &self,
        method: &'static str,
        params: Option<serde_json::Value>,
    ) -> Result<(), RequestError> {
        let notification = Notification::new(method, params);
        let frame =
            serde_json::to_value(&notification).map_err(|_| RequestError::ChannelClosed)?;
        self.writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .map_err(|_| RequestError::ChannelClosed)
    }

    /// Stop the writer task. The reader ends when the channel closes.
    pub async fn shutdown_writer(&self) {
        let _ = self.writer_tx.send(WriterCommand::Shutdown).await;
    }
}

// ── Per-key cancellation registry ──────────────────────────────────────

type RegistryEntries = HashMap<String, (u64, CancellationToken)>;

/// Registry enforcing at most one in-flight logical request per key.
///
/// Registering a key cancels and evicts any prior token for the same key
/// before the new request is sent. Entries are removed when the returned
/// guard drops (request settled, success or failure), so a fast sequence
/// of keystrokes never accumulates entries.
#[derive(Clone, Default)]
pub struct PendingRequestRegistry {
    entries: Arc<std::sync::Mutex<RegistryEntries>>,
    next_generation: Arc<AtomicU64>,
}

impl PendingRequestRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomic replace-and-return: cancel any existing token for `key`
    /// (idempotent if already cancelled), then install a fresh one.
    #[must_use]
    pub fn cancel_and_refresh(&self, key: &str) -> RequestGuard {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some((_, old)) = entries.insert(key.to_string(), (generation, token.clone())) {
            old.cancel();
        }
        RequestGuard {
            registry: self.clone(),
            key: key.to_string(),
            generation,
            token,
        }
    }

    /// Cancel everything, e.g. on session teardown.
    pub fn cancel_all(&self) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for (_, (_, token)) in entries.drain() {
            token.cancel();
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, key: &str, generation: u64) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        // Only remove our own entry; a newer registration for the key
        // must survive an older request's cleanup.
        if entries.get(key).is_some_and(|(g, _)| *g == generation) {
            entries.remove(key);
        }
    }
}

/// Owns one registry slot; the slot is released when this drops.
pub struct RequestGuard {
    registry: PendingRequestRegistry,
    key: String,
    generation: u64,
    token: CancellationToken,
}

impl RequestGuard {
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.registry.release(&self.key, self.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Registry ───────────────────────────────────────────────────────

    #[test]
    fn test_refresh_cancels_prior_token_for_same_key() {
        let registry = PendingRequestRegistry::new();
        let first = registry.cancel_and_refresh("completion:/a.rs");
        let first_token = first.token().clone();
        assert!(!first_token.is_cancelled());

        let second = registry.cancel_and_refresh("completion:/a.rs");
        assert!(first_token.is_cancelled());
        assert!(!second.token().is_cancelled());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_distinct_keys_do_not_interfere() {
        let registry = PendingRequestRegistry::new();
        let a = registry.cancel_and_refresh("completion:/a.rs");
        let b = registry.cancel_and_refresh("symbols:/a.rs");
        assert!(!a.token().is_cancelled());
        assert!(!b.token().is_cancelled());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_old_guard_drop_does_not_evict_newer_entry() {
        let registry = PendingRequestRegistry::new();
        let first = registry.cancel_and_refresh("k");
        let second = registry.cancel_and_refresh("k");
        drop(first);
        // The newer registration must survive the older cleanup.
        assert_eq!(registry.len(), 1);
        assert!(!second.token().is_cancelled());
        drop(second);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_cancel_all() {
        let registry = PendingRequestRegistry::new();
        let a = registry.cancel_and_refresh("a");
        let b = registry.cancel_and_refresh("b");
        registry.cancel_all();
        assert!(a.token().is_cancelled());
        assert!(b.token().is_cancelled());
        assert!(registry.is_empty());
    }

    // ── Connection over an in-process channel ──────────────────────────

    use crate::codec::{FrameReader, FrameWriter};
    use crate::transport::Channel;

    /// Spawn a scripted server task over the far end of an in-process
    /// channel; it applies `script` to every request frame it reads.
    fn scripted_server(
        channel: Channel,
        script: impl Fn(serde_json::Value) -> Option<serde_json::Value> + Send + 'static,
    ) -> tokio::task::JoinHandle<Vec<serde_json::Value>> {
        tokio::spawn(async move {
            let mut reader = FrameReader::new(channel.reader);
            let mut writer = FrameWriter::new(channel.writer);
            let mut seen = Vec::new();
            while let Ok(Some(frame)) = reader.read_frame().await {
                seen.push(frame.clone());
                if let Some(reply) = script(frame) {
                    writer.write_frame(&reply).await.unwrap();
                }
            }
            seen
        })
    }

    #[tokio::test]
    async fn test_request_response_correlation() {
        let (client_channel, server_channel) = Channel::in_process();
        scripted_server(server_channel, |frame| {
            Some(serde_json::json!({
                "jsonrpc": "2.0",
                "id": frame["id"],
                "result": { "echo": frame["method"] }
            }))
        });

        let connection = Connection::new(client_channel, DispatchTable::new(), |_| {});
        let result = connection.request("initialize", None).await.unwrap();
        assert_eq!(result["echo"], "initialize");
    }

    #[tokio::test]
    async fn test_rpc_error_response_is_typed() {
        let (client_channel, server_channel) = Channel::in_process();
        scripted_server(server_channel, |frame| {
            Some(serde_json::json!({
                "jsonrpc": "2.0",
                "id": frame["id"],
                "error": { "code": -32600, "message": "invalid request" }
            }))
        });

        let connection = Connection::new(client_channel, DispatchTable::new(), |_| {});
        let result = connection.request("shutdown", None).await;
        match result {
            Err(RequestError::Rpc(e)) => assert_eq!(e.code, -32600),
            other => panic!("expected Rpc error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unhandled_server_request_gets_method_not_found() {
        let (client_channel, server_channel) = Channel::in_process();
        let mut server_reader = FrameReader::new(server_channel.reader);
        let mut server_writer = FrameWriter::new(server_channel.writer);

        let _connection = Connection::new(client_channel, DispatchTable::new(), |_| {});

        server_writer
            .write_frame(&serde_json::json!({
                "jsonrpc": "2.0",
                "id": 9,
                "method": "client/registerCapability",
                "params": {}
            }))
            .await
            .unwrap();

        let reply = server_reader.read_frame().await.unwrap().unwrap();
        assert_eq!(reply["id"], 9);
        assert_eq!(reply["error"]["code"], METHOD_NOT_FOUND);
        let msg = reply["error"]["message"].as_str().unwrap();
        assert!(msg.contains("client/registerCapability"));
    }

    #[tokio::test]
    async fn test_registered_request_handler_replies() {
        let (client_channel, server_channel) = Channel::in_process();
        let mut server_reader = FrameReader::new(server_channel.reader);
        let mut server_writer = FrameWriter::new(server_channel.writer);

        let mut handlers = DispatchTable::new();
        handlers.on_request("workspace/configuration", |params| {
            let count = params
                .and_then(|p| p["items"].as_array().map(Vec::len))
                .unwrap_or(0);
            Ok(serde_json::Value::Array(vec![serde_json::Value::Null; count]))
        });

        let _connection = Connection::new(client_channel, handlers, |_| {});

        server_writer
            .write_frame(&serde_json::json!({
                "jsonrpc": "2.0",
                "id": "cfg-1",
                "method": "workspace/configuration",
                "params": { "items": [{}, {}] }
            }))
            .await
            .unwrap();

        let reply = server_reader.read_frame().await.unwrap().unwrap();
        assert_eq!(reply["id"], "cfg-1");
        assert_eq!(reply["result"], serde_json::json!([null, null]));
    }

    #[tokio::test]
    async fn test_notification_dispatch() {
        let (client_channel, server_channel) = Channel::in_process();
        let mut server_writer = FrameWriter::new(server_channel.writer);

        let (seen_tx, mut seen_rx) = mpsc::channel::<serde_json::Value>(4);
        let mut handlers = DispatchTable::new();
        handlers.on_notification("textDocument/publishDiagnostics", move |params| {
            let _ = seen_tx.try_send(params.unwrap_or_default());
        });

        let _connection = Connection::new(client_channel, handlers, |_| {});

        server_writer
            .write_frame(&serde_json::json!({
                "jsonrpc": "2.0",
                "method": "textDocument/publishDiagnostics",
                "params": { "uri": "file:///a.rs", "diagnostics": [] }
            }))
            .await
            .unwrap();

        let params = seen_rx.recv().await.unwrap();
        assert_eq!(params["uri"], "file:///a.rs");
    }

    #[tokio::test]
    async fn test_cancelled_request_is_superseded_and_late_response_discarded() {
        let (client_channel, server_channel) = Channel::in_process();
        // Server that never answers; we inspect what it saw afterwards.
        let server = scripted_server(server_channel, |_| None);

        let connection = Arc::new(Connection::new(client_channel, DispatchTable::new(), |_| {}));
        let token = CancellationToken::new();

        let conn = connection.clone();
        let tok = token.clone();
        let request = tokio::spawn(async move {
            conn.request_cancellable("textDocument/completion", Some(serde_json::json!({})), &tok)
                .await
        });

        // Give the request a chance to be written, then supersede it.
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();

        let outcome = request.await.unwrap();
        assert!(matches!(outcome, Err(RequestError::Superseded)));
        assert!(connection.pending.lock().await.is_empty());

        // The server should have seen the request and the advisory cancel.
        connection.shutdown_writer().await;
        drop(connection);
        let seen = server.await.unwrap();
        assert_eq!(seen[0]["method"], "textDocument/completion");
        assert_eq!(seen[1]["method"], "$/cancelRequest");
        assert_eq!(seen[1]["params"]["id"], seen[0]["id"]);
    }

    #[tokio::test]
    async fn test_already_cancelled_token_short_circuits() {
        let (client_channel, server_channel) = Channel::in_process();
        let server = scripted_server(server_channel, |_| None);

        let connection = Connection::new(client_channel, DispatchTable::new(), |_| {});
        let token = CancellationToken::new();
        token.cancel();

        let outcome = connection
            .request_cancellable("textDocument/completion", None, &token)
            .await;
        assert!(matches!(outcome, Err(RequestError::Superseded)));

        connection.shutdown_writer().await;
        drop(connection);
        // Nothing was ever sent.
        assert!(server.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_on_close_fires_on_clean_eof() {
        let (client_channel, server_channel) = Channel::in_process();
        let (closed_tx, closed_rx) = oneshot::channel::<Option<String>>();

        let _connection = Connection::new(client_channel, DispatchTable::new(), move |reason| {
            let _ = closed_tx.send(reason);
        });

        drop(server_channel);
        let reason = closed_rx.await.unwrap();
        assert!(reason.is_none(), "clean EOF should report no error");
    }
}
