//! Error types for kadabra-lsp.
//!
//! Errors are organized by layer: the session and request layer
//! ([`LspError`]), the JSON-RPC framing layer ([`TransportError`]) and
//! configuration loading ([`ConfigError`]). [`Error`] unifies them for
//! callers that do not care which layer failed.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by sessions, the request manager and document sync.
#[derive(Debug, Error)]
pub enum LspError {
    /// The server connection could not be established: the process failed
    /// to spawn, exited right away, or never connected back to the socket.
    #[error("failed to connect to language server: {0}")]
    ConnectionFailed(String),

    /// No response arrived before the deadline of the request's bucket.
    #[error("{method} timed out after {timeout:?}")]
    Timeout {
        /// Method of the request that timed out.
        method: String,
        /// Deadline that elapsed.
        timeout: Duration,
    },

    /// The request was cancelled before a response arrived.
    #[error("{0} was cancelled")]
    Cancelled(String),

    /// The connection closed (process exit or EOF) while the request was
    /// in flight, or the session is in the failed state.
    #[error("language server crashed: {0}")]
    ServerCrashed(String),

    /// The method is not allowed in the current protocol phase.
    #[error("cannot send {method} while the connection is {phase}")]
    NotReady {
        /// Method that was rejected.
        method: String,
        /// Protocol phase at the time of the call.
        phase: &'static str,
    },

    /// The session is in the failed state and refuses new work.
    #[error("language server {0} is in the failed state; restart it first")]
    ServerFailed(String),

    /// The server did not advertise the capability a request needs.
    #[error("capability not supported: {0}")]
    CapabilityNotSupported(String),

    /// The server answered with a JSON-RPC error.
    #[error("language server error: {message} (code: {code})")]
    ServerError {
        /// The JSON-RPC error code.
        code: i32,
        /// The error message from the server.
        message: String,
    },

    /// `initialize` failed or returned an unusable result.
    #[error("language server initialization failed: {0}")]
    InitializationFailed(String),

    /// An edit range lies outside the document.
    #[error("invalid range {start}..{end} for a document of {len} chars")]
    InvalidRange {
        /// First char.
        start: usize,
        /// One past the last char.
        end: usize,
        /// Document length in chars.
        len: usize,
    },

    /// The document is not connected to this session.
    #[error("document not found: {0}")]
    DocumentNotFound(String),

    /// The document was closed and can no longer be edited or synced.
    #[error("document already closed: {0}")]
    DocumentClosed(String),

    /// A response could not be decoded into the expected type.
    #[error("failed to parse language server response: {0}")]
    ParseError(String),

    /// The underlying channel failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Errors from the JSON-RPC framing layer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer closed the stream.
    #[error("connection closed")]
    ConnectionClosed,

    /// A header block or body did not follow the wire format.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),

    /// A header announced a body larger than the reader accepts. The stream
    /// cannot be resynchronized afterwards.
    #[error("message of {length} bytes exceeds the {limit} byte limit")]
    MessageTooLarge {
        /// Announced `Content-Length`.
        length: usize,
        /// Largest accepted body.
        limit: usize,
    },

    /// Failed to serialize an outbound message.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Failed to deserialize an inbound message.
    #[error("deserialization error: {0}")]
    DeserializationError(String),

    /// IO error on the byte stream.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Errors from loading or saving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A server definition is malformed.
    #[error("invalid server definition: {0}")]
    InvalidDefinition(String),

    /// A configuration file could not be parsed.
    #[error("failed to parse {path}: {message}")]
    ParseError {
        /// File that failed to parse.
        path: String,
        /// Parser message.
        message: String,
    },

    /// IO error while reading or writing configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A unified error type for the entire crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Session or request error.
    #[error("LSP error: {0}")]
    Lsp(#[from] LspError),

    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Generic IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized Result type for kadabra-lsp operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display() {
        let err = LspError::Timeout {
            method: "textDocument/hover".to_string(),
            timeout: Duration::from_millis(2000),
        };
        assert_eq!(err.to_string(), "textDocument/hover timed out after 2s");
    }

    #[test]
    fn test_not_ready_display() {
        let err = LspError::NotReady {
            method: "textDocument/didOpen".to_string(),
            phase: "closed",
        };
        assert_eq!(
            err.to_string(),
            "cannot send textDocument/didOpen while the connection is closed"
        );
    }

    #[test]
    fn test_error_conversion() {
        let err: Error = LspError::ServerFailed("rust-analyzer".to_string()).into();
        assert!(matches!(err, Error::Lsp(LspError::ServerFailed(_))));

        let err: LspError = TransportError::ConnectionClosed.into();
        assert!(matches!(
            err,
            LspError::Transport(TransportError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_config_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = ConfigError::from(io).into();
        assert!(err.to_string().contains("missing"));
    }
}
