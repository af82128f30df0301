//! Hooks for the host application.
//!
//! Sessions report status changes and server-pushed events to every
//! subscribed [`SessionObserver`]. Observers run outside the session's locks
//! and may call back into it.

use std::fmt;
use std::sync::Arc;

use lsp_types::{
    Diagnostic, MessageActionItem, MessageType, ShowMessageParams, ShowMessageRequestParams, Url,
};
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use super::document::LocalEdit;
use super::wrapper::ServerStatus;

/// Receives session events. Every method defaults to doing nothing.
pub trait SessionObserver: Send + Sync {
    /// A server changed status.
    fn status_changed(&self, _server: &str, _old: ServerStatus, _new: ServerStatus) {}

    /// The server published diagnostics that were accepted.
    fn diagnostics_published(&self, _uri: &Url, _diagnostics: &[Diagnostic]) {}

    /// The connection of an open document was lost.
    fn document_degraded(&self, _server: &str, _uri: &Url) {}

    /// The server changed a connected document through `workspace/applyEdit`.
    fn edits_applied(&self, _uri: &Url, _edits: &[LocalEdit]) {}

    /// `window/showMessage`.
    fn show_message(&self, _server: &str, _params: &ShowMessageParams) {}

    /// `window/showMessageRequest`. The first observer returning an action
    /// answers the server.
    fn show_message_request(
        &self,
        _server: &str,
        _params: &ShowMessageRequestParams,
    ) -> Option<MessageActionItem> {
        None
    }
}

/// Shared list of observers.
#[derive(Clone, Default)]
pub struct ObserverSet {
    observers: Arc<RwLock<Vec<Arc<dyn SessionObserver>>>>,
}

impl fmt::Debug for ObserverSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverSet")
            .field("len", &self.len())
            .finish()
    }
}

impl ObserverSet {
    /// Adds an observer.
    pub fn subscribe(&self, observer: Arc<dyn SessionObserver>) {
        self.observers.write().push(observer);
    }

    /// Number of observers.
    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    /// Whether nobody is subscribed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Observers are called on a snapshot so they may subscribe more.
    fn snapshot(&self) -> Vec<Arc<dyn SessionObserver>> {
        self.observers.read().clone()
    }

    pub(crate) fn status_changed(&self, server: &str, old: ServerStatus, new: ServerStatus) {
        for observer in self.snapshot() {
            observer.status_changed(server, old, new);
        }
    }

    pub(crate) fn diagnostics_published(&self, uri: &Url, diagnostics: &[Diagnostic]) {
        for observer in self.snapshot() {
            observer.diagnostics_published(uri, diagnostics);
        }
    }

    pub(crate) fn document_degraded(&self, server: &str, uri: &Url) {
        for observer in self.snapshot() {
            observer.document_degraded(server, uri);
        }
    }

    pub(crate) fn edits_applied(&self, uri: &Url, edits: &[LocalEdit]) {
        for observer in self.snapshot() {
            observer.edits_applied(uri, edits);
        }
    }

    pub(crate) fn show_message(&self, server: &str, params: &ShowMessageParams) {
        for observer in self.snapshot() {
            observer.show_message(server, params);
        }
    }

    pub(crate) fn show_message_request(
        &self,
        server: &str,
        params: &ShowMessageRequestParams,
    ) -> Option<MessageActionItem> {
        self.snapshot()
            .into_iter()
            .find_map(|observer| observer.show_message_request(server, params))
    }
}

/// Writes every event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl SessionObserver for LoggingObserver {
    fn status_changed(&self, server: &str, old: ServerStatus, new: ServerStatus) {
        info!(server, %old, %new, "server status changed");
    }

    fn diagnostics_published(&self, uri: &Url, diagnostics: &[Diagnostic]) {
        debug!(%uri, count = diagnostics.len(), "diagnostics published");
    }

    fn document_degraded(&self, server: &str, uri: &Url) {
        warn!(server, %uri, "document lost its language server");
    }

    fn edits_applied(&self, uri: &Url, edits: &[LocalEdit]) {
        debug!(%uri, count = edits.len(), "server edits applied");
    }

    fn show_message(&self, server: &str, params: &ShowMessageParams) {
        match params.typ {
            MessageType::ERROR => error!(server, "{}", params.message),
            MessageType::WARNING => warn!(server, "{}", params.message),
            _ => info!(server, "{}", params.message),
        }
    }
}
