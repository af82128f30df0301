//! In-memory language server for session tests.
//!
//! [`FakeServer`] plays the server side of a `tokio::io::duplex` pipe. Every
//! message the client sends is recorded; requests get canned answers. A
//! fresh pipe is created on each connection start, so restarts and crashes
//! can be exercised without spawning processes.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use kadabra_lsp::config::{TimeoutKind, Timeouts};
use kadabra_lsp::lsp::transport::{read_message, write_message};
use kadabra_lsp::error::LspError;
use kadabra_lsp::lsp::{
    ConnectionProvider, ConnectionStreams, LspResult, ServerDefinition, SessionContext,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::io::{BufReader, duplex};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;

/// Canned server behavior.
#[derive(Debug, Clone)]
pub struct FakeConfig {
    /// `capabilities` returned from `initialize`.
    pub capabilities: Value,
    /// Delay before answering `initialize`.
    pub initialize_delay: Duration,
    /// Answer `initialize` with an error.
    pub fail_initialize: bool,
    /// Refuse the connection altogether.
    pub refuse_connection: bool,
    /// Requests that are never answered.
    pub unanswered: HashSet<String>,
    /// Result of `textDocument/willSaveWaitUntil`.
    pub will_save_edits: Value,
}

impl Default for FakeConfig {
    fn default() -> Self {
        Self {
            capabilities: json!({
                "textDocumentSync": {
                    "openClose": true,
                    "change": 2,
                    "save": { "includeText": false }
                },
                "hoverProvider": true,
                "definitionProvider": true
            }),
            initialize_delay: Duration::ZERO,
            fail_initialize: false,
            refuse_connection: false,
            unanswered: HashSet::new(),
            will_save_edits: Value::Null,
        }
    }
}

struct Incarnation {
    outbound: mpsc::UnboundedSender<Value>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Incarnation {
    fn kill(self) {
        self.reader.abort();
        self.writer.abort();
    }

    /// Lets the server read what the client already wrote, then kills it.
    async fn finish(mut self) {
        let _ = tokio::time::timeout(Duration::from_millis(200), &mut self.reader).await;
        self.kill();
    }
}

/// Shared state of the fake server across connections.
pub struct FakeServer {
    config: Mutex<FakeConfig>,
    received: Mutex<Vec<Value>>,
    changed: Notify,
    current: Mutex<Option<Incarnation>>,
    starts: AtomicUsize,
}

impl std::fmt::Debug for FakeServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeServer")
            .field("starts", &self.starts())
            .finish_non_exhaustive()
    }
}

impl FakeServer {
    pub fn new(config: FakeConfig) -> Arc<Self> {
        Arc::new(Self {
            config: Mutex::new(config),
            received: Mutex::new(Vec::new()),
            changed: Notify::new(),
            current: Mutex::new(None),
            starts: AtomicUsize::new(0),
        })
    }

    /// Changes behavior for the next messages and connections.
    pub fn configure(&self, update: impl FnOnce(&mut FakeConfig)) {
        update(&mut self.config.lock());
    }

    /// How many connections were opened.
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Every message received so far.
    pub fn received(&self) -> Vec<Value> {
        self.received.lock().clone()
    }

    /// Methods of every message received so far, in order.
    pub fn methods(&self) -> Vec<String> {
        self.received
            .lock()
            .iter()
            .filter_map(|m| m["method"].as_str().map(str::to_string))
            .collect()
    }

    /// Messages with `method`.
    pub fn messages(&self, method: &str) -> Vec<Value> {
        self.received
            .lock()
            .iter()
            .filter(|m| m["method"] == method)
            .cloned()
            .collect()
    }

    /// Waits until a received message satisfies `predicate`.
    ///
    /// # Panics
    ///
    /// Panics after two seconds.
    pub async fn wait_for(&self, predicate: impl Fn(&Value) -> bool) -> Value {
        let wait = async {
            loop {
                let notified = self.changed.notified();
                if let Some(found) = self.received.lock().iter().find(|m| predicate(m)) {
                    return found.clone();
                }
                notified.await;
            }
        };
        tokio::time::timeout(Duration::from_secs(2), wait)
            .await
            .expect("expected message never arrived")
    }

    /// Waits for the `n`th message with `method` (1-based).
    pub async fn wait_for_nth(&self, method: &str, n: usize) -> Value {
        let wait = async {
            loop {
                let notified = self.changed.notified();
                if let Some(found) = self.messages(method).into_iter().nth(n - 1) {
                    return found;
                }
                notified.await;
            }
        };
        tokio::time::timeout(Duration::from_secs(2), wait)
            .await
            .unwrap_or_else(|_| panic!("{method} #{n} never arrived"))
    }

    /// Waits for the first message with `method`.
    pub async fn wait_for_method(&self, method: &str) -> Value {
        self.wait_for_nth(method, 1).await
    }

    /// Sends a message from the server to the client.
    pub fn send(&self, message: Value) {
        let current = self.current.lock();
        let incarnation = current.as_ref().expect("server is not connected");
        incarnation
            .outbound
            .send(message)
            .expect("server writer is gone");
    }

    /// Sends a notification from the server.
    pub fn notify(&self, method: &str, params: Value) {
        self.send(json!({ "jsonrpc": "2.0", "method": method, "params": params }));
    }

    /// Sends a request from the server.
    pub fn request(&self, id: &str, method: &str, params: Value) {
        self.send(json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params }));
    }

    /// Drops the connection as if the process died.
    pub fn crash(&self) {
        if let Some(incarnation) = self.current.lock().take() {
            incarnation.kill();
        }
    }

    async fn stop(&self) {
        let current = self.current.lock().take();
        if let Some(incarnation) = current {
            incarnation.finish().await;
        }
    }

    fn record(&self, message: Value) {
        self.received.lock().push(message);
        self.changed.notify_waiters();
    }

    fn connect(self: &Arc<Self>) -> LspResult<ConnectionStreams> {
        if self.config.lock().refuse_connection {
            return Err(LspError::ConnectionFailed("connection refused".to_string()));
        }
        self.crash();
        self.starts.fetch_add(1, Ordering::SeqCst);

        let (client, server) = duplex(1 << 20);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, mut server_write) = tokio::io::split(server);
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Value>();

        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if write_message(&mut server_write, &message).await.is_err() {
                    break;
                }
            }
        });

        let this = Arc::clone(self);
        let replies = outbound.clone();
        let reader = tokio::spawn(async move {
            let mut server_read = BufReader::new(server_read);
            while let Ok(Some(body)) = read_message(&mut server_read).await {
                let Ok(message) = serde_json::from_slice::<Value>(&body) else {
                    continue;
                };
                this.record(message.clone());
                if message["method"] == "exit" {
                    break;
                }
                this.answer(&message, &replies);
            }
        });

        *self.current.lock() = Some(Incarnation {
            outbound,
            reader,
            writer,
        });

        Ok(ConnectionStreams {
            reader: Box::new(client_read),
            writer: Box::new(client_write),
            stderr: None,
        })
    }

    fn answer(&self, message: &Value, replies: &mpsc::UnboundedSender<Value>) {
        let (Some(id), Some(method)) = (message.get("id"), message["method"].as_str()) else {
            return;
        };
        let config = self.config.lock().clone();
        if config.unanswered.contains(method) {
            return;
        }

        let reply = |result: Value| json!({ "jsonrpc": "2.0", "id": id, "result": result });
        match method {
            "initialize" if config.fail_initialize => {
                let _ = replies.send(json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": { "code": -32603, "message": "cannot initialize" }
                }));
            }
            "initialize" => {
                let response = reply(json!({
                    "capabilities": config.capabilities,
                    "serverInfo": { "name": "fake", "version": "1.0" }
                }));
                let delay = config.initialize_delay;
                let replies = replies.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = replies.send(response);
                });
            }
            "textDocument/hover" => {
                let _ = replies.send(reply(json!({ "contents": "fake hover" })));
            }
            "textDocument/willSaveWaitUntil" => {
                let _ = replies.send(reply(config.will_save_edits));
            }
            _ => {
                let _ = replies.send(reply(Value::Null));
            }
        }
    }
}

/// Provider connecting to a [`FakeServer`].
#[derive(Debug, Clone)]
pub struct FakeConnection {
    server: Arc<FakeServer>,
}

#[async_trait]
impl ConnectionProvider for FakeConnection {
    async fn start(&mut self) -> LspResult<ConnectionStreams> {
        self.server.connect()
    }

    async fn stop(&mut self) {
        self.server.stop().await;
    }
}

/// Session context whose connections all go to `server`, with short
/// request timeouts.
pub fn context(server: &Arc<FakeServer>) -> SessionContext {
    let server = Arc::clone(server);
    let timeouts = Timeouts::default()
        .with(TimeoutKind::Init, Duration::from_millis(500))
        .with(TimeoutKind::Hover, Duration::from_millis(200))
        .with(TimeoutKind::WillSave, Duration::from_millis(200))
        .with(TimeoutKind::Shutdown, Duration::from_millis(200))
        .shared();

    SessionContext::default()
        .with_timeouts(timeouts)
        .with_provider_factory(Arc::new(move |_: &ServerDefinition, _: &Path| {
            Box::new(FakeConnection {
                server: Arc::clone(&server),
            }) as Box<dyn ConnectionProvider>
        }))
}
