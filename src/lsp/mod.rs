//! Language server sessions.
//!
//! # Architecture
//!
//! - `connection`: launching a server and obtaining its byte streams
//! - `transport`: JSON-RPC framing and the reader/writer tasks
//! - `request`: outbound requests, timeouts, cancellation, protocol phase
//! - `capabilities`: what the client offers and what the server supports
//! - `document`: per-document version tracking and change batching
//! - `handler`: server-initiated requests and notifications
//! - `wrapper`: the lifecycle of one server for one project
//! - `registry`: every session of a project, routed by file extension
//!
//! # Usage
//!
//! ```ignore
//! use kadabra_lsp::lsp::{ServerDefinition, SessionContext, SessionRegistry};
//!
//! let registry = SessionRegistry::new("/path/to/project", SessionContext::default());
//! registry.add_definition(ServerDefinition::exe("rs", "rust-analyzer", vec![]));
//! let doc = registry.open_document(uri, &text).await?;
//! doc.edit(LocalEdit::insert(0, "// hello\n"))?;
//! doc.schedule_flush();
//! ```

pub mod capabilities;
pub mod connection;
pub mod definition;
pub mod document;
pub mod handler;
pub mod observer;
pub mod position;
pub mod registry;
pub mod request;
pub mod transport;
pub mod types;
pub mod wrapper;

use crate::error::LspError;

/// Result type for LSP operations.
pub type LspResult<T> = std::result::Result<T, LspError>;

pub use connection::{ConnectionProvider, ConnectionStreams, ProcessConnection, SocketConnection};
pub use definition::{LaunchSpec, ServerDefinition, TransportKind};
pub use document::{
    DiagnosticSpan, DocumentEdits, DocumentSyncManager, EditRejection, LocalEdit,
    apply_workspace_edits,
};
pub use observer::{LoggingObserver, ObserverSet, SessionObserver};
pub use position::OffsetEncoding;
pub use registry::SessionRegistry;
pub use request::{RequestHandle, RequestManager, RequestStats};
pub use wrapper::{ProviderFactory, ServerStatus, ServerWrapper, SessionContext};

// Re-export commonly used types from lsp-types
pub use lsp_types::{Diagnostic, FileChangeType, Position, Range, Url};
