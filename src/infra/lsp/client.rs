//! Per-process LSP protocol client
//!
//! Owns one server process's stdio streams, the request-id counter and the
//! pending-request table. A single reader task drains framed messages and is
//! the only place a response completes a pending request; responses may
//! arrive in any order, the id table is the only ordering authority.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, Notify, RwLock, oneshot};
use tokio::time::timeout;

use super::protocol::{
    ClientInfo, InitializeParams, InitializeResult, LspDiagnostic, Message, Notification, Request,
    RequestId, Response, ResponseError, error_codes,
};
use super::transport::{Transport, write_notification, write_request, write_response};
use crate::config::{Limits, ServerConfig};
use crate::error::{BridgeError, BridgeResult};
use crate::models::lsp::path_to_uri;

type PendingRequest = oneshot::Sender<Response>;
type NotificationHandler = Box<dyn Fn(Value) + Send + Sync>;

/// Seam between the services layer and a live protocol client.
///
/// Services issue LSP requests through this trait; tests substitute a
/// scripted session instead of a spawned process.
#[async_trait]
pub trait Session: Send + Sync {
    /// Short server description for logs and errors
    fn name(&self) -> &str;

    async fn request_value(&self, method: &str, params: Option<Value>) -> BridgeResult<Value>;

    async fn notify(&self, method: &str, params: Option<Value>) -> BridgeResult<()>;

    /// Make sure the server has seen this document content
    async fn sync_document(&self, uri: &str, content: &str) -> BridgeResult<()>;

    /// Diagnostics the server pushed via publishDiagnostics, if any
    async fn published_diagnostics(&self, uri: &str) -> Vec<LspDiagnostic>;
}

#[derive(Debug)]
struct DocumentState {
    version: u32,
    content_hash: u64,
}

impl DocumentState {
    fn new(content: &str) -> Self {
        Self {
            version: 1,
            content_hash: crate::infra::hash_content(content),
        }
    }

    fn needs_update(&self, new_content: &str) -> bool {
        crate::infra::hash_content(new_content) != self.content_hash
    }

    fn update(&mut self, new_content: &str) {
        self.version += 1;
        self.content_hash = crate::infra::hash_content(new_content);
    }
}

pub struct LspClient {
    server_name: String,
    root: PathBuf,
    process: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    next_id: AtomicU64,
    pending: RwLock<HashMap<RequestId, PendingRequest>>,
    documents: RwLock<HashMap<String, DocumentState>>,
    push_diagnostics: RwLock<HashMap<String, Vec<LspDiagnostic>>>,
    notification_handlers: RwLock<HashMap<String, NotificationHandler>>,
    capabilities: RwLock<Option<InitializeResult>>,
    shutting_down: AtomicBool,
    terminated: AtomicBool,
    exit_notify: Notify,
    request_timeout: Duration,
}

impl std::fmt::Debug for LspClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LspClient")
            .field("server_name", &self.server_name)
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl LspClient {
    /// Spawn the configured server process and complete the initialize
    /// handshake. Called exactly once per process; nothing else is sent
    /// before the handshake finishes.
    pub async fn spawn(config: &ServerConfig, limits: &Limits) -> Result<Arc<Self>, BridgeError> {
        tracing::info!(
            command = %config.command,
            args = ?config.args,
            "Starting language server"
        );

        let mut child = Command::new(&config.command)
            .args(&config.args)
            .current_dir(&config.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BridgeError::SpawnFailure {
                command: format!("{} {}", config.command, config.args.join(" "))
                    .trim_end()
                    .to_string(),
                message: e.to_string(),
            })?;

        let stdin = child.stdin.take().ok_or_else(|| BridgeError::SpawnFailure {
            command: config.command.clone(),
            message: "failed to capture stdin".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| BridgeError::SpawnFailure {
            command: config.command.clone(),
            message: "failed to capture stdout".to_string(),
        })?;

        let client = Arc::new(Self {
            server_name: config.command.clone(),
            root: config.working_dir.clone(),
            process: Mutex::new(Some(child)),
            stdin: Mutex::new(Some(stdin)),
            next_id: AtomicU64::new(1),
            pending: RwLock::new(HashMap::new()),
            documents: RwLock::new(HashMap::new()),
            push_diagnostics: RwLock::new(HashMap::new()),
            notification_handlers: RwLock::new(HashMap::new()),
            capabilities: RwLock::new(None),
            shutting_down: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            exit_notify: Notify::new(),
            request_timeout: limits.request_timeout(),
        });

        let reader = Arc::clone(&client);
        tokio::spawn(async move {
            reader.read_messages(Transport::new(stdout)).await;
        });

        // Any failure here, disconnect, timeout, error response or a write
        // hitting a closed pipe, means the handshake did not complete.
        client
            .initialize(config, limits.initialize_timeout())
            .await
            .map_err(|e| BridgeError::HandshakeFailure {
                server: config.command.clone(),
                message: e.to_string(),
            })?;

        tracing::info!(command = %config.command, "Language server started");
        Ok(client)
    }

    async fn initialize(
        &self,
        config: &ServerConfig,
        deadline: Duration,
    ) -> Result<(), BridgeError> {
        let params = InitializeParams {
            process_id: Some(std::process::id()),
            root_uri: Some(path_to_uri(&self.root)),
            capabilities: Self::client_capabilities(),
            client_info: Some(ClientInfo {
                name: "symbridge".to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
            initialization_options: config.initialization_options_json(),
        };

        let result: InitializeResult = self
            .request_with_timeout("initialize", Some(serde_json::to_value(params)?), deadline)
            .await?;

        *self.capabilities.write().await = Some(result);

        self.notify("initialized", Some(serde_json::json!({})))
            .await?;

        Ok(())
    }

    /// Capabilities for the features the bridge actually exercises
    fn client_capabilities() -> Value {
        serde_json::json!({
            "general": {
                "positionEncodings": ["utf-16"]
            },
            "textDocument": {
                "synchronization": { "didSave": false },
                "definition": { "linkSupport": true },
                "references": {},
                "documentSymbol": {
                    "symbolKind": { "valueSet": (1..=26).collect::<Vec<u32>>() },
                    "hierarchicalDocumentSymbolSupport": true
                },
                "rename": { "prepareSupport": false },
                "publishDiagnostics": { "relatedInformation": false },
                "diagnostic": { "relatedDocumentSupport": false }
            },
            "workspace": {
                "workspaceEdit": { "documentChanges": true }
            }
        })
    }

    /// Send a request and wait for the matching response
    pub async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<T, BridgeError> {
        let value = self
            .request_with_deadline(method, params, self.request_timeout)
            .await?;
        serde_json::from_value(value).map_err(|e| BridgeError::Protocol(e.to_string()))
    }

    pub async fn request_with_timeout<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Duration,
    ) -> Result<T, BridgeError> {
        let value = self.request_with_deadline(method, params, deadline).await?;
        serde_json::from_value(value).map_err(|e| BridgeError::Protocol(e.to_string()))
    }

    async fn request_with_deadline(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Duration,
    ) -> Result<Value, BridgeError> {
        if self.terminated.load(Ordering::Acquire) {
            return Err(self.disconnected());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.pending.write().await;
            pending.insert(RequestId::Number(id), tx);
        }

        let request = Request::new(id, method, params);

        tracing::trace!(server = %self.server_name, id, method, "LSP request");

        {
            let mut stdin_guard = self.stdin.lock().await;
            let stdin = match stdin_guard.as_mut() {
                Some(s) => s,
                None => {
                    self.pending.write().await.remove(&RequestId::Number(id));
                    return Err(self.disconnected());
                }
            };
            if let Err(e) = write_request(stdin, &request).await {
                self.pending.write().await.remove(&RequestId::Number(id));
                return Err(write_failure_error(
                    &self.server_name,
                    self.terminated.load(Ordering::Acquire),
                    e,
                ));
            }
        }

        match timeout(deadline, rx).await {
            Ok(Ok(response)) => response.into_result().map_err(|err| BridgeError::ServerError {
                code: err.code,
                message: err.message,
            }),
            // Sender dropped without a response: the reader task drained the
            // table because the process exited or the stream broke.
            Ok(Err(_)) => Err(self.disconnected()),
            Err(_) => {
                // Deadline expired. Remove our entry; a late response for an
                // id no longer in the table is discarded, not an error.
                self.pending.write().await.remove(&RequestId::Number(id));
                let _ = self
                    .send_notification("$/cancelRequest", Some(serde_json::json!({ "id": id })))
                    .await;
                Err(BridgeError::Timeout {
                    server: self.server_name.clone(),
                    method: method.to_string(),
                    timeout_secs: deadline.as_secs(),
                })
            }
        }
    }

    /// Send a notification (no id, no pending entry, no response)
    async fn send_notification(&self, method: &str, params: Option<Value>) -> BridgeResult<()> {
        let notification = Notification::new(method, params);

        let mut stdin_guard = self.stdin.lock().await;
        let stdin = stdin_guard.as_mut().ok_or_else(|| self.disconnected())?;
        write_notification(stdin, &notification).await.map_err(|e| {
            write_failure_error(
                &self.server_name,
                self.terminated.load(Ordering::Acquire),
                e,
            )
        })?;

        Ok(())
    }

    fn disconnected(&self) -> BridgeError {
        BridgeError::ServerDisconnected {
            server: self.server_name.clone(),
        }
    }

    /// Background task draining and dispatching inbound messages
    async fn read_messages(self: Arc<Self>, mut transport: Transport<ChildStdout>) {
        loop {
            if self.shutting_down.load(Ordering::Acquire) {
                break;
            }

            match transport.read_message().await {
                Ok(message) => {
                    self.handle_message(message).await;
                }
                Err(e) => {
                    if !self.shutting_down.load(Ordering::Acquire) {
                        if e.kind() == io::ErrorKind::InvalidData {
                            // Malformed framing: the stream can no longer be
                            // trusted, equivalent to a disconnect.
                            tracing::error!(server = %self.server_name, error = %e,
                                "Framing error on server stream");
                        } else {
                            tracing::warn!(server = %self.server_name, error = %e,
                                "Server stream closed");
                        }
                    }
                    self.mark_terminated().await;
                    break;
                }
            }
        }
    }

    /// Fail every pending request with ServerDisconnected and wake waiters.
    async fn mark_terminated(&self) {
        self.terminated.store(true, Ordering::Release);
        let drained = {
            let mut pending = self.pending.write().await;
            pending.drain().count()
        };
        if drained > 0 {
            tracing::debug!(
                server = %self.server_name,
                count = drained,
                "Failing pending requests: server terminated"
            );
        }
        self.exit_notify.notify_waiters();
    }

    /// Handle one inbound message
    async fn handle_message(&self, message: Message) {
        match message {
            Message::Response(response) => {
                if let Some(id) = response.id.clone() {
                    let mut pending = self.pending.write().await;
                    // Direct match first, then string->number coercion for
                    // servers that echo numeric ids back as strings.
                    let sender = pending.remove(&id).or_else(|| {
                        if let RequestId::String(s) = &id {
                            s.parse::<u64>()
                                .ok()
                                .and_then(|n| pending.remove(&RequestId::Number(n)))
                        } else {
                            None
                        }
                    });
                    match sender {
                        Some(tx) => {
                            let _ = tx.send(response);
                        }
                        None => {
                            tracing::debug!(
                                server = %self.server_name,
                                id = ?id,
                                "Response for unknown request id (may have timed out)"
                            );
                        }
                    }
                }
            }
            Message::Request(request) => {
                self.handle_server_request(request).await;
            }
            Message::Notification(notification) => {
                self.handle_server_notification(notification).await;
            }
        }
    }

    async fn handle_server_notification(&self, notification: Notification) {
        let method = notification.method.as_str();
        let params = notification.params.unwrap_or(Value::Null);

        {
            let handlers = self.notification_handlers.read().await;
            if let Some(handler) = handlers.get(method) {
                handler(params.clone());
            }
        }

        match method {
            "textDocument/publishDiagnostics" => {
                let uri = params.get("uri").and_then(|u| u.as_str());
                let diags = params.get("diagnostics").cloned();
                if let (Some(uri), Some(diags)) = (uri, diags)
                    && let Ok(diagnostics) = serde_json::from_value::<Vec<LspDiagnostic>>(diags)
                {
                    tracing::debug!(uri, count = diagnostics.len(), "Cached pushed diagnostics");
                    self.push_diagnostics
                        .write()
                        .await
                        .insert(uri.to_string(), diagnostics);
                }
            }
            "window/logMessage" | "window/showMessage" => {
                if let Some(msg) = params.get("message").and_then(|m| m.as_str()) {
                    // LSP MessageType: 1=Error, 2=Warning, 3=Info, 4=Log
                    match params.get("type").and_then(|t| t.as_u64()) {
                        Some(1) => tracing::warn!(server = %self.server_name, "{}", msg),
                        Some(2) => tracing::debug!(server = %self.server_name, "{}", msg),
                        _ => tracing::trace!(server = %self.server_name, "{}", msg),
                    }
                }
            }
            _ => {
                tracing::trace!(server = %self.server_name, method, "Unhandled notification");
            }
        }
    }

    /// Answer server-initiated requests with a capability-appropriate
    /// response, or method-not-found.
    async fn handle_server_request(&self, request: Request) {
        let response_result = match request.method.as_str() {
            "workspace/configuration" => {
                let items = request
                    .params
                    .as_ref()
                    .and_then(|p| p.get("items"))
                    .and_then(|i| i.as_array())
                    .map(|arr| arr.len())
                    .unwrap_or(0);
                Ok(Value::Array(vec![
                    Value::Object(serde_json::Map::new());
                    items
                ]))
            }
            "client/registerCapability" => Ok(Value::Null),
            "client/unregisterCapability" => Ok(Value::Null),
            "window/workDoneProgress/create" => Ok(Value::Null),
            _ => {
                tracing::debug!(server = %self.server_name, method = %request.method,
                    "Refusing server request");
                Err(ResponseError {
                    code: error_codes::METHOD_NOT_FOUND,
                    message: format!("Method not found: {}", request.method),
                    data: None,
                })
            }
        };

        let response = match response_result {
            Ok(result) => Response::success(request.id, result),
            Err(error) => Response::failure(Some(request.id), error),
        };

        // Wait for the writer rather than dropping the reply; servers block
        // on answers to workspace/configuration. No caller holds the stdin
        // lock while waiting on the reader task, so this cannot deadlock.
        let mut stdin_guard = self.stdin.lock().await;
        if let Some(stdin) = stdin_guard.as_mut() {
            let _ = write_response(stdin, &response).await;
        }
    }

    /// Register a notification handler for a specific method
    pub async fn on_notification<F>(&self, method: &str, handler: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.notification_handlers
            .write()
            .await
            .insert(method.to_string(), Box::new(handler));
    }

    pub async fn is_running(&self) -> bool {
        if self.terminated.load(Ordering::Acquire) {
            return false;
        }
        let mut process = self.process.lock().await;
        if let Some(ref mut child) = *process {
            matches!(child.try_wait(), Ok(None))
        } else {
            false
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Resolves when the reader task observes process exit or stream failure
    pub async fn wait_terminated(&self) {
        loop {
            let notified = self.exit_notify.notified();
            if self.terminated.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }

    pub async fn capabilities(&self) -> Option<InitializeResult> {
        self.capabilities.read().await.clone()
    }

    /// In-flight requests awaiting a response
    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }

    /// Graceful three-stage termination: shutdown request, stdin close and
    /// wait, then kill.
    pub async fn shutdown(&self) -> Result<(), BridgeError> {
        self.shutting_down.store(true, Ordering::Release);

        let shutdown_result = timeout(Duration::from_secs(2), async {
            if self
                .request_with_deadline("shutdown", None, Duration::from_secs(2))
                .await
                .is_ok()
            {
                let _ = self.send_notification("exit", None).await;
            }
        })
        .await;

        if shutdown_result.is_err() {
            tracing::debug!(server = %self.server_name, "Shutdown request timed out");
        }

        // Close stdin to signal EOF
        self.stdin.lock().await.take();

        if let Some(mut child) = self.process.lock().await.take() {
            match timeout(Duration::from_secs(5), child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(server = %self.server_name, ?status, "Server exited");
                }
                Ok(Err(e)) => {
                    tracing::warn!(server = %self.server_name, error = %e, "Wait error");
                }
                Err(_) => {
                    tracing::warn!(server = %self.server_name, "Termination timed out, killing");
                    let _ = child.kill().await;
                }
            }
        }

        self.mark_terminated().await;
        tracing::info!(server = %self.server_name, "Language server stopped");
        Ok(())
    }
}

#[async_trait]
impl Session for LspClient {
    fn name(&self) -> &str {
        &self.server_name
    }

    async fn request_value(&self, method: &str, params: Option<Value>) -> BridgeResult<Value> {
        self.request_with_deadline(method, params, self.request_timeout)
            .await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> BridgeResult<()> {
        self.send_notification(method, params).await
    }

    async fn sync_document(&self, uri: &str, content: &str) -> BridgeResult<()> {
        let notification = {
            let mut documents = self.documents.write().await;
            match documents.get_mut(uri) {
                Some(state) if !state.needs_update(content) => None,
                Some(state) => {
                    state.update(content);
                    Some((
                        "textDocument/didChange",
                        serde_json::json!({
                            "textDocument": { "uri": uri, "version": state.version },
                            "contentChanges": [{ "text": content }]
                        }),
                    ))
                }
                None => {
                    let state = DocumentState::new(content);
                    let version = state.version;
                    documents.insert(uri.to_string(), state);
                    Some((
                        "textDocument/didOpen",
                        serde_json::json!({
                            "textDocument": {
                                "uri": uri,
                                "languageId": language_id_from_uri(uri),
                                "version": version,
                                "text": content
                            }
                        }),
                    ))
                }
            }
        };

        if let Some((method, params)) = notification {
            self.send_notification(method, Some(params)).await?;
        }
        Ok(())
    }

    async fn published_diagnostics(&self, uri: &str) -> Vec<LspDiagnostic> {
        self.push_diagnostics
            .read()
            .await
            .get(uri)
            .cloned()
            .unwrap_or_default()
    }
}

impl Drop for LspClient {
    fn drop(&mut self) {
        if let Ok(mut process_guard) = self.process.try_lock()
            && let Some(ref mut child) = *process_guard
        {
            let _ = child.start_kill();
            tracing::debug!(server = %self.server_name, "Client dropped, process killed");
        }
    }
}

/// A write failing because the pipe closed means the process is gone, even
/// when the reader task has not observed EOF yet.
fn write_failure_error(server: &str, terminated: bool, e: io::Error) -> BridgeError {
    if terminated || e.kind() == io::ErrorKind::BrokenPipe {
        BridgeError::ServerDisconnected {
            server: server.to_string(),
        }
    } else {
        BridgeError::Io(e)
    }
}

/// languageId for didOpen, derived from the file extension
fn language_id_from_uri(uri: &str) -> &'static str {
    let ext = uri.rsplit('.').next().unwrap_or_default();
    match ext {
        "py" | "pyi" => "python",
        "rs" => "rust",
        "ts" => "typescript",
        "tsx" => "typescriptreact",
        "js" | "mjs" | "cjs" => "javascript",
        "go" => "go",
        "java" => "java",
        "kt" | "kts" => "kotlin",
        "c" | "h" => "c",
        "cpp" | "cc" | "hpp" => "cpp",
        "rb" => "ruby",
        _ => "plaintext",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_generation() {
        let counter = AtomicU64::new(1);
        assert_eq!(counter.fetch_add(1, Ordering::Relaxed), 1);
        assert_eq!(counter.fetch_add(1, Ordering::Relaxed), 2);
        assert_eq!(counter.fetch_add(1, Ordering::Relaxed), 3);
    }

    #[test]
    fn test_language_id_from_uri() {
        assert_eq!(language_id_from_uri("file:///a/b.py"), "python");
        assert_eq!(language_id_from_uri("file:///a/b.rs"), "rust");
        assert_eq!(language_id_from_uri("file:///a/b.weird"), "plaintext");
    }

    #[test]
    fn test_closed_pipe_write_is_a_disconnect() {
        let broken = io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed");
        assert!(matches!(
            write_failure_error("pyright", false, broken),
            BridgeError::ServerDisconnected { .. }
        ));

        let after_exit = io::Error::other("write after exit");
        assert!(matches!(
            write_failure_error("pyright", true, after_exit),
            BridgeError::ServerDisconnected { .. }
        ));

        let unrelated = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert!(matches!(
            write_failure_error("pyright", false, unrelated),
            BridgeError::Io(_)
        ));
    }

    #[test]
    fn test_document_state_change_detection() {
        let mut state = DocumentState::new("x = 1\n");
        assert!(!state.needs_update("x = 1\n"));
        assert!(state.needs_update("x = 2\n"));
        state.update("x = 2\n");
        assert_eq!(state.version, 2);
        assert!(!state.needs_update("x = 2\n"));
    }

    #[tokio::test]
    async fn test_spawn_failure_names_missing_command() {
        let config = ServerConfig {
            extensions: vec!["py".into()],
            command: "/definitely/not/a/real/langserver".into(),
            args: vec!["--stdio".into()],
            working_dir: std::env::temp_dir(),
            restart_interval_minutes: None,
            initialization_options: None,
        };

        let err = LspClient::spawn(&config, &Limits::default())
            .await
            .err()
            .expect("spawn must fail");
        match err {
            BridgeError::SpawnFailure { command, .. } => {
                assert!(command.contains("/definitely/not/a/real/langserver"));
                assert!(command.contains("--stdio"));
            }
            other => panic!("expected SpawnFailure, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_exiting_during_handshake_is_handshake_failure() {
        // `true` exits immediately: initialize never gets a response and the
        // reader task sees EOF, which must surface as a handshake failure.
        let config = ServerConfig {
            extensions: vec!["py".into()],
            command: "true".into(),
            args: vec![],
            working_dir: std::env::temp_dir(),
            restart_interval_minutes: None,
            initialization_options: None,
        };

        let err = LspClient::spawn(&config, &Limits::default())
            .await
            .err()
            .expect("handshake must fail");
        assert!(matches!(err, BridgeError::HandshakeFailure { .. }), "{err:?}");
    }
}
