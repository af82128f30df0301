//! JSON-RPC framing and the per-connection reader/writer tasks.
//!
//! Messages travel as `Content-Length` framed JSON bodies. [`RpcChannel`]
//! owns one connection: a writer task drains a single ordered outbound
//! queue, and a reader task classifies inbound messages into responses
//! (completed through the [`PendingRegistry`]), server requests and
//! notifications (both handed to an [`InboundHandler`]).

use std::sync::Arc;
use std::time::Duration;

pub use async_lsp::{AnyNotification, AnyRequest, ErrorCode, RequestId, ResponseError};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::connection::ConnectionStreams;
use super::request::PendingRegistry;
use crate::error::TransportError;

/// Consecutive malformed messages tolerated before the connection is dropped.
pub const MAX_CONSECUTIVE_PROTOCOL_ERRORS: usize = 8;

/// Largest body a `Content-Length` header may announce.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// `MethodNotFound` for `method`.
pub fn method_not_found(method: &str) -> ResponseError {
    ResponseError::new(ErrorCode::METHOD_NOT_FOUND, format!("unhandled method {method}"))
}

/// One framed JSON-RPC message.
#[derive(Debug, Clone)]
pub enum Message {
    /// A call expecting a response.
    Request(AnyRequest),
    /// The answer to a request.
    Response {
        /// Id of the request; `None` when the peer could not parse it.
        id: Option<RequestId>,
        /// Result or error.
        result: Result<Value, ResponseError>,
    },
    /// A one-way message.
    Notification(AnyNotification),
}

impl Message {
    /// Builds a request.
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope does not decode, which only happens
    /// for ids the JSON-RPC grammar rejects.
    pub fn request(id: RequestId, method: &str, params: Value) -> Result<Self, TransportError> {
        envelope(json!({ "id": id, "method": method, "params": params })).map(Message::Request)
    }

    /// Builds a notification.
    ///
    /// # Errors
    ///
    /// See [`Message::request`].
    pub fn notification(method: &str, params: Value) -> Result<Self, TransportError> {
        envelope(json!({ "method": method, "params": params })).map(Message::Notification)
    }

    /// Method of a request or notification.
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(request) => Some(&request.method),
            Message::Notification(notification) => Some(&notification.method),
            Message::Response { .. } => None,
        }
    }

    /// Params of a request or notification.
    pub fn params(&self) -> Option<&Value> {
        match self {
            Message::Request(request) => Some(&request.params),
            Message::Notification(notification) => Some(&notification.params),
            Message::Response { .. } => None,
        }
    }

    /// Encodes the message as a JSON-RPC 2.0 object.
    pub fn to_json(&self) -> Value {
        match self {
            Message::Request(request) => json!({
                "jsonrpc": "2.0",
                "id": request.id,
                "method": request.method,
                "params": request.params,
            }),
            Message::Notification(notification) => json!({
                "jsonrpc": "2.0",
                "method": notification.method,
                "params": notification.params,
            }),
            Message::Response { id, result: Ok(result) } => {
                json!({ "jsonrpc": "2.0", "id": id, "result": result })
            }
            Message::Response { id, result: Err(err) } => {
                json!({ "jsonrpc": "2.0", "id": id, "error": err })
            }
        }
    }

    /// Classifies a decoded JSON-RPC object by the presence of `id` and
    /// `method`.
    ///
    /// # Errors
    ///
    /// Returns an error for anything that is not a request, response or
    /// notification.
    pub fn from_json(value: Value) -> Result<Self, TransportError> {
        let Value::Object(mut object) = value else {
            return Err(TransportError::InvalidFormat(
                "message is not a JSON object".to_string(),
            ));
        };

        let id = object.remove("id");
        let method = match object.remove("method") {
            None => None,
            Some(Value::String(method)) => Some(method),
            Some(other) => {
                return Err(TransportError::InvalidFormat(format!(
                    "method is not a string: {other}"
                )));
            }
        };
        let params = object.remove("params").unwrap_or(Value::Null);

        match (id, method) {
            (Some(Value::Null), Some(method)) => Err(TransportError::InvalidFormat(format!(
                "request {method} has a null id"
            ))),
            (Some(id), Some(method)) => {
                envelope(json!({ "id": id, "method": method, "params": params }))
                    .map(Message::Request)
            }
            (None, Some(method)) => {
                envelope(json!({ "method": method, "params": params })).map(Message::Notification)
            }
            (Some(id), None) => {
                let id = match id {
                    Value::Null => None,
                    raw => Some(decode::<RequestId>("id", raw)?),
                };
                let result = match object.remove("error") {
                    Some(err) => Err(decode::<ResponseError>("error object", err)?),
                    None => Ok(object.remove("result").unwrap_or(Value::Null)),
                };
                Ok(Message::Response { id, result })
            }
            (None, None) => Err(TransportError::InvalidFormat(
                "message has neither id nor method".to_string(),
            )),
        }
    }
}

fn envelope<T: DeserializeOwned>(value: Value) -> Result<T, TransportError> {
    decode("envelope", value)
}

fn decode<T: DeserializeOwned>(what: &str, value: Value) -> Result<T, TransportError> {
    serde_json::from_value(value)
        .map_err(|e| TransportError::DeserializationError(format!("invalid {what}: {e}")))
}

/// Reads one framed message body. Returns `Ok(None)` on a clean EOF
/// between messages.
///
/// # Errors
///
/// Returns [`TransportError::InvalidFormat`] for a malformed header block,
/// [`TransportError::MessageTooLarge`] when the announced body exceeds
/// [`MAX_MESSAGE_SIZE`], and [`TransportError::ConnectionClosed`] if the
/// stream ends mid-message.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Vec<u8>>, TransportError>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: Option<usize> = None;
    let mut in_headers = false;
    let mut line = String::new();

    loop {
        line.clear();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            return if in_headers {
                Err(TransportError::ConnectionClosed)
            } else {
                Ok(None)
            };
        }

        let header = line.trim_end_matches(['\r', '\n']);
        if header.is_empty() {
            if in_headers {
                break;
            }
            continue;
        }
        in_headers = true;

        let Some((name, value)) = header.split_once(':') else {
            return Err(TransportError::InvalidFormat(format!(
                "malformed header line: {header}"
            )));
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            let length = value.trim().parse::<usize>().map_err(|_| {
                TransportError::InvalidFormat(format!("invalid Content-Length: {}", value.trim()))
            })?;
            content_length = Some(length);
        }
    }

    let length = content_length
        .ok_or_else(|| TransportError::InvalidFormat("missing Content-Length".to_string()))?;
    if length > MAX_MESSAGE_SIZE {
        return Err(TransportError::MessageTooLarge {
            length,
            limit: MAX_MESSAGE_SIZE,
        });
    }

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            TransportError::ConnectionClosed
        } else {
            TransportError::IoError(e)
        }
    })?;
    Ok(Some(body))
}

/// Frames and writes one message, then flushes.
///
/// # Errors
///
/// Returns an error if serialization or the write fails.
pub async fn write_message<W>(writer: &mut W, message: &Value) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_string(message)
        .map_err(|e| TransportError::SerializationError(e.to_string()))?;
    let frame = format!("Content-Length: {}\r\n\r\n{}", body.len(), body);
    writer.write_all(frame.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Receives server-initiated traffic. Called on the reader task, so
/// implementations must not block.
pub trait InboundHandler: Send + Sync {
    /// Answers a server request.
    ///
    /// # Errors
    ///
    /// The returned error is sent back to the server as the response.
    fn handle_request(&self, request: AnyRequest) -> Result<Value, ResponseError>;

    /// Consumes a server notification.
    fn handle_notification(&self, notification: AnyNotification);
}

/// Sending half of a channel's ordered outbound queue.
pub type OutboundSender = mpsc::UnboundedSender<Message>;

/// The live reader and writer tasks of one connection.
#[derive(Debug)]
pub struct RpcChannel {
    label: Arc<str>,
    outbound: OutboundSender,
    closed: watch::Receiver<bool>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
    stderr: Option<JoinHandle<()>>,
}

impl RpcChannel {
    /// Spawns the reader, writer and stderr tasks for `streams`.
    ///
    /// When the reader sees EOF or a fatal error, every request still in
    /// `pending` fails and [`RpcChannel::closed`] flips to `true`.
    pub fn spawn(
        label: impl Into<String>,
        streams: ConnectionStreams,
        pending: Arc<PendingRegistry>,
        handler: Arc<dyn InboundHandler>,
    ) -> Self {
        let label: Arc<str> = Arc::from(label.into());
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed) = watch::channel(false);
        let closed_tx = Arc::new(closed_tx);

        let ConnectionStreams {
            reader,
            writer,
            stderr,
        } = streams;

        let writer = tokio::spawn(run_writer(
            label.clone(),
            writer,
            outbound_rx,
            closed_tx.clone(),
        ));
        let reader = tokio::spawn(run_reader(
            label.clone(),
            BufReader::new(reader),
            outbound.clone(),
            pending,
            handler,
            closed_tx,
        ));
        let stderr = stderr.map(|stderr| tokio::spawn(forward_stderr(label.clone(), stderr)));

        Self {
            label,
            outbound,
            closed,
            writer,
            reader,
            stderr,
        }
    }

    /// Handle for enqueueing outbound messages.
    pub fn sender(&self) -> OutboundSender {
        self.outbound.clone()
    }

    /// Watch that becomes `true` once the connection is gone.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed.clone()
    }

    /// Whether the connection is gone.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Stops the reader, then gives the writer up to `grace` to drain what
    /// is already queued before aborting it.
    ///
    /// The writer only finishes once every [`OutboundSender`] is dropped, so
    /// callers detach their own senders first.
    pub async fn close(self, grace: Duration) {
        self.reader.abort();
        if let Some(stderr) = self.stderr {
            stderr.abort();
        }
        drop(self.outbound);

        let mut writer = self.writer;
        if tokio::time::timeout(grace, &mut writer).await.is_err() {
            debug!(server = %self.label, "outbound queue did not drain; aborting writer");
            writer.abort();
        }
    }
}

async fn run_writer(
    label: Arc<str>,
    mut writer: Box<dyn AsyncWrite + Send + Unpin>,
    mut outbound_rx: mpsc::UnboundedReceiver<Message>,
    closed_tx: Arc<watch::Sender<bool>>,
) {
    while let Some(message) = outbound_rx.recv().await {
        trace!(server = %label, message = ?message, "sending");
        if let Err(e) = write_message(&mut writer, &message.to_json()).await {
            error!(server = %label, error = %e, "outbound write failed; closing connection");
            closed_tx.send_replace(true);
            return;
        }
    }
    debug!(server = %label, "outbound queue closed");
}

async fn run_reader<R>(
    label: Arc<str>,
    mut reader: R,
    outbound: OutboundSender,
    pending: Arc<PendingRegistry>,
    handler: Arc<dyn InboundHandler>,
    closed_tx: Arc<watch::Sender<bool>>,
) where
    R: AsyncBufRead + Unpin,
{
    let mut protocol_errors = 0usize;

    loop {
        let decoded = match read_message(&mut reader).await {
            Ok(Some(body)) => serde_json::from_slice::<Value>(&body)
                .map_err(|e| TransportError::DeserializationError(e.to_string()))
                .and_then(Message::from_json),
            Ok(None) => {
                info!(server = %label, "language server closed the connection");
                break;
            }
            Err(e @ TransportError::InvalidFormat(_)) => Err(e),
            Err(e @ TransportError::MessageTooLarge { .. }) => {
                error!(server = %label, error = %e, "oversized message; closing connection");
                break;
            }
            Err(e) => {
                error!(server = %label, error = %e, "error reading from language server");
                break;
            }
        };

        match decoded {
            Ok(message) => {
                protocol_errors = 0;
                dispatch(&label, message, &outbound, &pending, handler.as_ref());
            }
            Err(e) => {
                protocol_errors += 1;
                warn!(server = %label, error = %e, count = protocol_errors, "dropping malformed message");
                if protocol_errors >= MAX_CONSECUTIVE_PROTOCOL_ERRORS {
                    error!(server = %label, "too many malformed messages; closing connection");
                    break;
                }
            }
        }
    }

    pending.fail_all();
    closed_tx.send_replace(true);
}

fn dispatch(
    label: &str,
    message: Message,
    outbound: &OutboundSender,
    pending: &PendingRegistry,
    handler: &dyn InboundHandler,
) {
    match message {
        Message::Response { id: Some(id), result } => {
            if !pending.complete(&id, result) {
                debug!(server = %label, ?id, "discarding response for unknown or expired request");
            }
        }
        Message::Response { id: None, result } => {
            warn!(server = %label, result = ?result, "response without id");
        }
        Message::Request(request) => {
            let id = request.id.clone();
            let method = request.method.clone();
            trace!(server = %label, ?id, %method, "server request");
            let result = handler.handle_request(request);
            if outbound.send(Message::Response { id: Some(id), result }).is_err() {
                debug!(server = %label, %method, "reply dropped; connection closing");
            }
        }
        Message::Notification(notification) => {
            trace!(server = %label, method = %notification.method, "server notification");
            handler.handle_notification(notification);
        }
    }
}

async fn forward_stderr(label: Arc<str>, stderr: Box<dyn tokio::io::AsyncRead + Send + Unpin>) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(server = %label, "stderr: {line}"),
            Ok(None) => break,
            Err(e) => {
                debug!(server = %label, error = %e, "stderr closed");
                break;
            }
        }
    }
}
