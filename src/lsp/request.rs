//! Outbound request management.
//!
//! [`RequestManager`] is the single path every outbound message takes. A
//! request is tagged with a [`TimeoutKind`], registered in the
//! [`PendingRegistry`] under a fresh id, queued on the connection, and
//! resolved through a [`RequestHandle`] with the response, a timeout, a
//! cancellation, or a connection failure. Whichever of response and
//! timeout removes the registry entry first wins; the other is discarded.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use lsp_types::ServerCapabilities;
use lsp_types::notification::Notification;
use lsp_types::request::Request;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::LspResult;
use super::capabilities;
use super::transport::{ErrorCode, Message, OutboundSender, RequestId, ResponseError};
use crate::config::{SharedTimeouts, TimeoutKind};
use crate::error::LspError;

/// How a pending request was settled by someone other than its caller.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// The server answered.
    Response(Result<Value, ResponseError>),
    /// `cancel_request` won the race.
    Cancelled,
    /// The connection went away.
    Closed,
}

/// In-flight requests keyed by id.
///
/// Insert and remove are atomic under one lock, so a response and a
/// timeout for the same id can never both complete it.
#[derive(Debug, Default)]
pub struct PendingRegistry {
    slots: Mutex<HashMap<RequestId, oneshot::Sender<Outcome>>>,
}

impl PendingRegistry {
    /// Registers `id` and returns the slot its outcome arrives on.
    pub fn register(&self, id: RequestId) -> oneshot::Receiver<Outcome> {
        let (tx, rx) = oneshot::channel();
        if self.slots.lock().insert(id.clone(), tx).is_some() {
            warn!(?id, "request id registered twice; previous caller dropped");
        }
        rx
    }

    /// Delivers a response. Returns `false` if nobody waits for `id`.
    pub fn complete(&self, id: &RequestId, result: Result<Value, ResponseError>) -> bool {
        self.settle(id, Outcome::Response(result))
    }

    /// Cancels `id`. Returns `false` if it was already settled.
    pub fn cancel(&self, id: &RequestId) -> bool {
        self.settle(id, Outcome::Cancelled)
    }

    /// Forgets `id` without notifying the waiter. Returns `true` if the
    /// entry was still present.
    pub fn remove(&self, id: &RequestId) -> bool {
        self.slots.lock().remove(id).is_some()
    }

    /// Fails every pending request with [`Outcome::Closed`].
    pub fn fail_all(&self) {
        let drained: Vec<_> = self.slots.lock().drain().collect();
        for (_, tx) in drained {
            let _ = tx.send(Outcome::Closed);
        }
    }

    /// Number of requests in flight.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Whether nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn settle(&self, id: &RequestId, outcome: Outcome) -> bool {
        let Some(tx) = self.slots.lock().remove(id) else {
            return false;
        };
        // The receiver may already be gone if the caller dropped its handle.
        let _ = tx.send(outcome);
        true
    }
}

/// Success and timeout counts for one bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RequestStats {
    /// Requests answered before their deadline.
    pub succeeded: u64,
    /// Requests whose deadline elapsed first.
    pub timed_out: u64,
}

/// Per-bucket outcome counters.
#[derive(Debug, Default)]
pub struct TimeoutStats {
    table: Mutex<BTreeMap<TimeoutKind, RequestStats>>,
}

impl TimeoutStats {
    fn record(&self, kind: TimeoutKind, succeeded: bool) {
        let mut table = self.table.lock();
        let entry = table.entry(kind).or_default();
        if succeeded {
            entry.succeeded += 1;
        } else {
            entry.timed_out += 1;
        }
    }

    /// Copy of the counters.
    pub fn snapshot(&self) -> BTreeMap<TimeoutKind, RequestStats> {
        self.table.lock().clone()
    }
}

/// Which methods the connection accepts right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolPhase {
    /// No connection.
    Closed,
    /// Connected, `initialize` not yet acknowledged; only `initialize`
    /// and `initialized`.
    Handshake,
    /// Initialized; everything but `initialize`.
    Open,
    /// Shutting down; only `shutdown` and `exit`.
    Draining,
}

impl ProtocolPhase {
    /// Whether `method` may be sent in this phase.
    pub fn allows(self, method: &str) -> bool {
        match self {
            ProtocolPhase::Closed => false,
            ProtocolPhase::Handshake => matches!(method, "initialize" | "initialized"),
            ProtocolPhase::Open => method != "initialize",
            ProtocolPhase::Draining => matches!(method, "shutdown" | "exit"),
        }
    }

    /// Lower-case name for messages.
    pub const fn name(self) -> &'static str {
        match self {
            ProtocolPhase::Closed => "closed",
            ProtocolPhase::Handshake => "initializing",
            ProtocolPhase::Open => "open",
            ProtocolPhase::Draining => "shutting down",
        }
    }
}

#[derive(Debug)]
struct Link {
    outbound: Option<OutboundSender>,
    phase: ProtocolPhase,
}

/// Funnels every outbound call of one session.
#[derive(Debug)]
pub struct RequestManager {
    label: String,
    next_id: AtomicI32,
    pending: Arc<PendingRegistry>,
    link: Mutex<Link>,
    capabilities: RwLock<Option<ServerCapabilities>>,
    /// Dynamic registrations: registration id to method.
    registered: RwLock<HashMap<String, String>>,
    timeouts: SharedTimeouts,
    stats: Arc<TimeoutStats>,
}

impl RequestManager {
    /// Creates a manager reading deadlines from `timeouts`.
    pub fn new(label: impl Into<String>, timeouts: SharedTimeouts) -> Self {
        Self {
            label: label.into(),
            next_id: AtomicI32::new(1),
            pending: Arc::new(PendingRegistry::default()),
            link: Mutex::new(Link {
                outbound: None,
                phase: ProtocolPhase::Closed,
            }),
            capabilities: RwLock::new(None),
            registered: RwLock::new(HashMap::new()),
            timeouts,
            stats: Arc::new(TimeoutStats::default()),
        }
    }

    /// Registry the connection's reader completes responses through.
    pub fn pending(&self) -> Arc<PendingRegistry> {
        self.pending.clone()
    }

    /// Routes outbound traffic into a new connection in the handshake phase.
    pub fn attach(&self, outbound: OutboundSender) {
        let mut link = self.link.lock();
        link.outbound = Some(outbound);
        link.phase = ProtocolPhase::Handshake;
    }

    /// Disconnects, forgets the server's capabilities and fails everything
    /// still in flight.
    pub fn detach(&self) {
        {
            let mut link = self.link.lock();
            link.outbound = None;
            link.phase = ProtocolPhase::Closed;
        }
        *self.capabilities.write() = None;
        self.registered.write().clear();
        self.pending.fail_all();
    }

    /// Current protocol phase.
    pub fn phase(&self) -> ProtocolPhase {
        self.link.lock().phase
    }

    /// Moves to `phase`.
    pub fn set_phase(&self, phase: ProtocolPhase) {
        self.link.lock().phase = phase;
    }

    /// Records what the server advertised in `initialize`.
    pub fn set_capabilities(&self, capabilities: ServerCapabilities) {
        *self.capabilities.write() = Some(capabilities);
    }

    /// What the server advertised, if initialized.
    pub fn capabilities(&self) -> Option<ServerCapabilities> {
        self.capabilities.read().clone()
    }

    /// Allows `method` regardless of the static capabilities, after the
    /// server registered it under `id` through `client/registerCapability`.
    pub fn register_dynamic(&self, id: &str, method: &str) {
        self.registered
            .write()
            .insert(id.to_string(), method.to_string());
    }

    /// Drops registration `id`. The method stays allowed while another
    /// registration still covers it.
    pub fn unregister_dynamic(&self, id: &str) -> Option<String> {
        self.registered.write().remove(id)
    }

    fn is_registered(&self, method: &str) -> bool {
        self.registered.read().values().any(|m| m == method)
    }

    /// Timeouts table the manager reads.
    pub fn timeouts(&self) -> &SharedTimeouts {
        &self.timeouts
    }

    /// Per-bucket success/timeout counters.
    pub fn stats(&self) -> BTreeMap<TimeoutKind, RequestStats> {
        self.stats.snapshot()
    }

    /// Number of requests awaiting a response.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Sends a request and returns the handle its outcome is awaited on.
    ///
    /// The deadline is `now + timeouts[kind]`, read at call time.
    ///
    /// # Errors
    ///
    /// Fails without sending if the phase does not allow `method`, the
    /// server lacks the capability for it, or the connection is gone.
    pub fn call(&self, method: &str, kind: TimeoutKind, params: Value) -> LspResult<RequestHandle> {
        if let Some(caps) = self.capabilities.read().as_ref()
            && !capabilities::supports(caps, method)
            && !self.is_registered(method)
        {
            return Err(LspError::CapabilityNotSupported(method.to_string()));
        }

        let timeout = self.timeouts.read().get(kind);
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));

        // Registration happens under the link lock so the response cannot
        // arrive before the slot exists.
        let link = self.link.lock();
        let outbound = Self::outbound_for(&link, method)?;
        let rx = self.pending.register(id.clone());
        let message = match Message::request(id.clone(), method, params) {
            Ok(message) => message,
            Err(e) => {
                self.pending.remove(&id);
                return Err(e.into());
            }
        };
        let sent = outbound.send(message);
        drop(link);

        if sent.is_err() {
            self.pending.remove(&id);
            return Err(LspError::ServerCrashed(format!(
                "connection closed before {method} was sent"
            )));
        }

        debug!(server = %self.label, ?id, %method, ?timeout, "request sent");
        Ok(RequestHandle {
            id,
            method: method.to_string(),
            kind,
            timeout,
            deadline: Instant::now() + timeout,
            rx,
            pending: self.pending.clone(),
            stats: self.stats.clone(),
        })
    }

    /// Sends a notification. Notifications keep program order.
    ///
    /// # Errors
    ///
    /// Fails if the phase does not allow `method` or the connection is gone.
    pub fn notify_raw(&self, method: &str, params: Value) -> LspResult<()> {
        let message = Message::notification(method, params)?;
        let link = self.link.lock();
        let outbound = Self::outbound_for(&link, method)?;
        outbound.send(message).map_err(|_| {
                LspError::ServerCrashed(format!("connection closed before {method} was sent"))
            })
    }

    /// Sends a typed request, bucketed by its method.
    ///
    /// # Errors
    ///
    /// See [`RequestManager::call`].
    pub fn send_request<R>(&self, params: R::Params) -> LspResult<RequestHandle>
    where
        R: Request,
    {
        let params = to_value(R::METHOD, &params)?;
        self.call(R::METHOD, TimeoutKind::for_method(R::METHOD), params)
    }

    /// Sends a typed request and waits for its decoded result.
    ///
    /// # Errors
    ///
    /// Returns the send error, the outcome error, or a parse error if the
    /// result does not decode.
    pub async fn request<R>(&self, params: R::Params) -> LspResult<R::Result>
    where
        R: Request,
        R::Result: DeserializeOwned,
    {
        let value = self.send_request::<R>(params)?.response().await?;
        serde_json::from_value(value)
            .map_err(|e| LspError::ParseError(format!("{}: {e}", R::METHOD)))
    }

    /// Sends a typed notification.
    ///
    /// # Errors
    ///
    /// See [`RequestManager::notify_raw`].
    pub fn notify<N>(&self, params: N::Params) -> LspResult<()>
    where
        N: Notification,
    {
        let params = to_value(N::METHOD, &params)?;
        self.notify_raw(N::METHOD, params)
    }

    /// Cancels a pending request and tells the server with
    /// `$/cancelRequest`. Returns `false` if the request had already
    /// settled; its late response, if any, is discarded.
    pub fn cancel_request(&self, id: &RequestId) -> bool {
        if !self.pending.cancel(id) {
            return false;
        }
        let params = json!({ "id": id });
        if let Err(e) = self.notify_raw("$/cancelRequest", params) {
            debug!(server = %self.label, ?id, error = %e, "cancel notification not sent");
        }
        true
    }

    fn outbound_for<'a>(link: &'a Link, method: &str) -> LspResult<&'a OutboundSender> {
        if !link.phase.allows(method) {
            return Err(LspError::NotReady {
                method: method.to_string(),
                phase: link.phase.name(),
            });
        }
        link.outbound.as_ref().ok_or_else(|| LspError::NotReady {
            method: method.to_string(),
            phase: ProtocolPhase::Closed.name(),
        })
    }
}

fn to_value<T: Serialize>(method: &str, params: &T) -> LspResult<Value> {
    serde_json::to_value(params).map_err(|e| LspError::ParseError(format!("{method}: {e}")))
}

/// An in-flight request.
///
/// Dropping the handle stops tracking the request; a later response is
/// discarded.
#[derive(Debug)]
pub struct RequestHandle {
    id: RequestId,
    method: String,
    kind: TimeoutKind,
    timeout: Duration,
    deadline: Instant,
    rx: oneshot::Receiver<Outcome>,
    pending: Arc<PendingRegistry>,
    stats: Arc<TimeoutStats>,
}

impl RequestHandle {
    /// Id the request was sent with.
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Method of the request.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Bucket the request belongs to.
    pub fn kind(&self) -> TimeoutKind {
        self.kind
    }

    /// Waits for the outcome.
    ///
    /// # Errors
    ///
    /// - [`LspError::Timeout`] if the deadline elapses first.
    /// - [`LspError::Cancelled`] if the request was cancelled, locally or
    ///   by the server.
    /// - [`LspError::ServerError`] for an error response.
    /// - [`LspError::ServerCrashed`] if the connection closed.
    pub async fn response(mut self) -> LspResult<Value> {
        let outcome = match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(outcome) => outcome,
            Err(_) => {
                if self.pending.remove(&self.id) {
                    self.stats.record(self.kind, false);
                    warn!(id = ?self.id, method = %self.method, timeout = ?self.timeout, "request timed out");
                    return Err(LspError::Timeout {
                        method: self.method.clone(),
                        timeout: self.timeout,
                    });
                }
                // Settled at the deadline; the outcome is already in the slot.
                (&mut self.rx).await
            }
        };

        match outcome {
            Ok(Outcome::Response(Ok(value))) => {
                self.stats.record(self.kind, true);
                Ok(value)
            }
            Ok(Outcome::Response(Err(err))) if err.code == ErrorCode::REQUEST_CANCELLED => {
                Err(LspError::Cancelled(self.method.clone()))
            }
            Ok(Outcome::Response(Err(err))) => Err(LspError::ServerError {
                code: err.code.0,
                message: err.message,
            }),
            Ok(Outcome::Cancelled) => Err(LspError::Cancelled(self.method.clone())),
            Ok(Outcome::Closed) | Err(_) => Err(LspError::ServerCrashed(format!(
                "connection closed while waiting for {}",
                self.method
            ))),
        }
    }
}

impl Drop for RequestHandle {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timeouts;
    use lsp_types::request::HoverRequest;
    use tokio::sync::mpsc;

    fn manager(timeout_ms: u64) -> (RequestManager, mpsc::UnboundedReceiver<Message>) {
        let timeouts = Timeouts::default()
            .with(TimeoutKind::Hover, Duration::from_millis(timeout_ms))
            .with(TimeoutKind::Other, Duration::from_millis(timeout_ms))
            .shared();
        let manager = RequestManager::new("test", timeouts);
        let (tx, rx) = mpsc::unbounded_channel();
        manager.attach(tx);
        manager.set_phase(ProtocolPhase::Open);
        (manager, rx)
    }

    fn sent_id(message: &Message) -> RequestId {
        match message {
            Message::Request(request) => request.id.clone(),
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn test_phase_gate() {
        assert!(!ProtocolPhase::Closed.allows("initialize"));
        assert!(ProtocolPhase::Handshake.allows("initialize"));
        assert!(ProtocolPhase::Handshake.allows("initialized"));
        assert!(!ProtocolPhase::Handshake.allows("exit"));
        assert!(!ProtocolPhase::Handshake.allows("shutdown"));
        assert!(!ProtocolPhase::Handshake.allows("textDocument/didOpen"));
        assert!(ProtocolPhase::Open.allows("textDocument/didOpen"));
        assert!(!ProtocolPhase::Open.allows("initialize"));
        assert!(ProtocolPhase::Draining.allows("exit"));
        assert!(!ProtocolPhase::Draining.allows("textDocument/didChange"));
    }

    #[tokio::test]
    async fn test_response_completes_request() {
        let (manager, mut rx) = manager(1000);
        let handle = manager
            .call("textDocument/hover", TimeoutKind::Hover, json!({}))
            .unwrap();
        let id = sent_id(&rx.recv().await.unwrap());
        assert_eq!(&id, handle.id());

        assert!(manager.pending().complete(&id, Ok(json!({"contents": "x"}))));
        assert_eq!(handle.response().await.unwrap()["contents"], "x");
        assert_eq!(manager.stats()[&TimeoutKind::Hover].succeeded, 1);
        assert_eq!(manager.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_timeout_then_late_response_discarded() {
        let (manager, mut rx) = manager(50);
        let handle = manager
            .call("textDocument/hover", TimeoutKind::Hover, json!({}))
            .unwrap();
        let id = sent_id(&rx.recv().await.unwrap());

        let err = handle.response().await.unwrap_err();
        assert!(matches!(err, LspError::Timeout { .. }));

        // late response finds no slot
        assert!(!manager.pending().complete(&id, Ok(Value::Null)));
        let stats = manager.stats()[&TimeoutKind::Hover];
        assert_eq!(stats.timed_out, 1);
        assert_eq!(stats.succeeded, 0);
    }

    #[tokio::test]
    async fn test_cancel_request() {
        let (manager, mut rx) = manager(1000);
        let handle = manager
            .call("textDocument/hover", TimeoutKind::Hover, json!({}))
            .unwrap();
        let id = sent_id(&rx.recv().await.unwrap());

        assert!(manager.cancel_request(&id));
        assert!(!manager.cancel_request(&id));
        match rx.recv().await.unwrap() {
            Message::Notification(notification) => {
                assert_eq!(notification.method, "$/cancelRequest");
                assert_eq!(notification.params["id"], json!(1));
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(matches!(
            handle.response().await,
            Err(LspError::Cancelled(_))
        ));
        assert!(!manager.pending().complete(&id, Ok(Value::Null)));
    }

    #[tokio::test]
    async fn test_server_error_and_cancelled_codes() {
        let (manager, mut rx) = manager(1000);
        let first = manager.call("a", TimeoutKind::Other, Value::Null).unwrap();
        let second = manager.call("b", TimeoutKind::Other, Value::Null).unwrap();
        let first_id = sent_id(&rx.recv().await.unwrap());
        let second_id = sent_id(&rx.recv().await.unwrap());

        manager
            .pending()
            .complete(&first_id, Err(ResponseError::new(ErrorCode::UNKNOWN_ERROR_CODE, "boom")));
        manager.pending().complete(
            &second_id,
            Err(ResponseError::new(ErrorCode::REQUEST_CANCELLED, "cancelled")),
        );

        assert!(matches!(
            first.response().await,
            Err(LspError::ServerError { code: -32001, .. })
        ));
        assert!(matches!(second.response().await, Err(LspError::Cancelled(_))));
    }

    #[tokio::test]
    async fn test_gate_rejects_before_send() {
        let timeouts = Timeouts::default().shared();
        let manager = RequestManager::new("test", timeouts);
        let err = manager
            .notify_raw("textDocument/didOpen", Value::Null)
            .unwrap_err();
        assert!(matches!(err, LspError::NotReady { phase: "closed", .. }));

        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.attach(tx);
        let err = manager
            .call("textDocument/hover", TimeoutKind::Hover, Value::Null)
            .unwrap_err();
        assert!(matches!(err, LspError::NotReady { .. }));
        assert!(rx.try_recv().is_err());
        assert!(manager.call("initialize", TimeoutKind::Init, Value::Null).is_ok());
    }

    #[tokio::test]
    async fn test_capability_gate() {
        let (manager, mut rx) = manager(1000);
        manager.set_capabilities(ServerCapabilities::default());

        let err = manager
            .send_request::<HoverRequest>(lsp_types::HoverParams {
                text_document_position_params: lsp_types::TextDocumentPositionParams {
                    text_document: lsp_types::TextDocumentIdentifier {
                        uri: lsp_types::Url::parse("file:///a.rs").unwrap(),
                    },
                    position: lsp_types::Position::new(0, 0),
                },
                work_done_progress_params: lsp_types::WorkDoneProgressParams::default(),
            })
            .unwrap_err();
        assert!(matches!(err, LspError::CapabilityNotSupported(_)));
        assert!(rx.try_recv().is_err());

        manager.register_dynamic("hover-1", "textDocument/hover");
        manager.register_dynamic("hover-2", "textDocument/hover");
        assert!(
            manager
                .call("textDocument/hover", TimeoutKind::Hover, Value::Null)
                .is_ok()
        );

        // One of two registrations for the same method goes away.
        assert_eq!(
            manager.unregister_dynamic("hover-1").as_deref(),
            Some("textDocument/hover")
        );
        assert!(
            manager
                .call("textDocument/hover", TimeoutKind::Hover, Value::Null)
                .is_ok()
        );

        assert!(manager.unregister_dynamic("hover-1").is_none());
        manager.unregister_dynamic("hover-2");
        assert!(
            manager
                .call("textDocument/hover", TimeoutKind::Hover, Value::Null)
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_detach_fails_in_flight() {
        let (manager, _rx) = manager(1000);
        let handle = manager
            .call("textDocument/hover", TimeoutKind::Hover, Value::Null)
            .unwrap();
        manager.detach();
        assert!(matches!(
            handle.response().await,
            Err(LspError::ServerCrashed(_))
        ));
        assert_eq!(manager.phase(), ProtocolPhase::Closed);
    }

    #[tokio::test]
    async fn test_dropped_handle_stops_tracking() {
        let (manager, _rx) = manager(1000);
        let handle = manager.call("x", TimeoutKind::Other, Value::Null).unwrap();
        assert_eq!(manager.in_flight(), 1);
        drop(handle);
        assert_eq!(manager.in_flight(), 0);
    }
}
