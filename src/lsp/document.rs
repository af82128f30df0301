//! Per-document synchronization with one server.
//!
//! A [`DocumentSyncManager`] holds the editor's text for one URI and the
//! version the server knows. Local edits are buffered according to the
//! negotiated [`SyncKind`] and flushed as a single `didChange` per batch,
//! each batch bumping the version by one. Diagnostics and server edits are
//! mapped onto the current text; anything computed against an older
//! version is dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use lsp_types::notification::{
    DidChangeTextDocument, DidCloseTextDocument, DidOpenTextDocument, DidSaveTextDocument,
    WillSaveTextDocument,
};
use lsp_types::request::WillSaveWaitUntil;
use lsp_types::{
    Diagnostic, DidChangeTextDocumentParams, DidCloseTextDocumentParams,
    DidOpenTextDocumentParams, DidSaveTextDocumentParams, TextDocumentContentChangeEvent,
    TextDocumentIdentifier, TextDocumentItem, TextDocumentSaveReason, TextEdit, Url,
    VersionedTextDocumentIdentifier, WillSaveTextDocumentParams,
};
use parking_lot::Mutex;
use ropey::Rope;
use thiserror::Error;
use tracing::{debug, trace, warn};

use super::LspResult;
use super::capabilities::{SyncKind, SyncSettings};
use super::position::{OffsetEncoding, chars_to_range, range_to_chars};
use super::request::RequestManager;
use crate::error::LspError;

/// A local replacement of the chars `start..end` by `text`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEdit {
    /// First replaced char.
    pub start: usize,
    /// One past the last replaced char.
    pub end: usize,
    /// Inserted text.
    pub text: String,
}

impl LocalEdit {
    /// Inserts `text` at `offset`.
    pub fn insert(offset: usize, text: impl Into<String>) -> Self {
        Self {
            start: offset,
            end: offset,
            text: text.into(),
        }
    }

    /// Deletes `start..end`.
    pub fn delete(start: usize, end: usize) -> Self {
        Self {
            start,
            end,
            text: String::new(),
        }
    }

    /// Replaces `start..end` with `text`.
    pub fn replace(start: usize, end: usize, text: impl Into<String>) -> Self {
        Self {
            start,
            end,
            text: text.into(),
        }
    }
}

/// A diagnostic located in the current text.
#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosticSpan {
    /// First char covered.
    pub start: usize,
    /// One past the last char covered.
    pub end: usize,
    /// The diagnostic as the server sent it.
    pub diagnostic: Diagnostic,
}

/// Why server edits were refused. A refused batch changes no document.
#[derive(Debug, Error)]
pub enum EditRejection {
    /// The document was closed.
    #[error("{0} is closed")]
    Closed(Url),

    /// The edits were computed against an older version.
    #[error("{uri} changed since version {version} (now {current})")]
    Stale {
        /// Target document.
        uri: Url,
        /// Version the edits were computed against.
        version: i32,
        /// Server-known version.
        current: i32,
    },

    /// An edit range does not exist in the document.
    #[error("{0} has an edit outside the document")]
    InvalidRange(Url),

    /// Two edits replace overlapping text.
    #[error("{0} has overlapping edits")]
    Overlapping(Url),

    /// The same document appears twice in one batch.
    #[error("{0} appears twice in one edit")]
    Duplicate(Url),

    /// Buffered local edits could not be sent first.
    #[error("{uri} could not be synced: {reason}")]
    Unsynced {
        /// Target document.
        uri: Url,
        /// Flush failure.
        reason: String,
    },
}

/// Server edits for one document, computed against `version` when given.
#[derive(Debug)]
pub struct DocumentEdits {
    /// Target document.
    pub document: Arc<DocumentSyncManager>,
    /// Version the edits refer to; `None` applies them to the current text.
    pub version: Option<i32>,
    /// Edits, all relative to the same text.
    pub edits: Vec<TextEdit>,
}

/// Applies server edits to several documents as one unit.
///
/// Every document is flushed, then all are locked in URI order and every
/// edit is resolved and checked before any text changes. Returns the local
/// edits applied to each document, last-first.
///
/// # Errors
///
/// Returns the first [`EditRejection`]; no document is modified then.
pub fn apply_workspace_edits(
    mut batch: Vec<DocumentEdits>,
) -> Result<Vec<(Url, Vec<LocalEdit>)>, EditRejection> {
    batch.sort_by(|a, b| a.document.uri.cmp(&b.document.uri));
    if let Some(pair) = batch
        .windows(2)
        .find(|pair| pair[0].document.uri == pair[1].document.uri)
    {
        return Err(EditRejection::Duplicate(pair[0].document.uri.clone()));
    }
    for target in &batch {
        target.document.flush_for_edit()?;
    }

    let mut states: Vec<_> = batch.iter().map(|target| target.document.state.lock()).collect();
    let plans = batch
        .iter()
        .zip(&states)
        .map(|(target, state)| {
            target
                .document
                .resolve_edits(state, target.version, &target.edits)
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut applied = Vec::with_capacity(batch.len());
    for ((target, state), plan) in batch.iter().zip(states.iter_mut()).zip(plans) {
        for edit in &plan {
            target.document.apply_resolved(state, edit);
        }
        debug!(uri = %target.document.uri, edits = plan.len(), "applied server edits");
        applied.push((target.document.uri.clone(), plan));
    }
    Ok(applied)
}

#[derive(Debug, Clone, Copy)]
struct Shift {
    start: usize,
    end: usize,
    inserted: usize,
}

impl Shift {
    /// Moves a span through this edit; `None` if the edit touched it.
    fn map(self, start: usize, end: usize) -> Option<(usize, usize)> {
        if end <= self.start {
            Some((start, end))
        } else if start >= self.end {
            let removed = self.end - self.start;
            Some((start - removed + self.inserted, end - removed + self.inserted))
        } else {
            None
        }
    }
}

#[derive(Debug)]
enum PendingChanges {
    Clean,
    Full,
    Incremental(Vec<TextDocumentContentChangeEvent>),
}

#[derive(Debug)]
struct DocState {
    text: Rope,
    server_text: Rope,
    version: i32,
    opened: bool,
    closed: bool,
    degraded: bool,
    sync: SyncSettings,
    encoding: OffsetEncoding,
    pending: PendingChanges,
    unsent: Vec<Shift>,
    diagnostics: Vec<DiagnosticSpan>,
    diagnostics_version: Option<i32>,
}

/// Keeps one document in sync with one server.
#[derive(Debug)]
pub struct DocumentSyncManager {
    uri: Url,
    language_id: String,
    requests: Arc<RequestManager>,
    state: Mutex<DocState>,
    flush_scheduled: AtomicBool,
}

impl DocumentSyncManager {
    /// Creates an unopened manager for `uri` with initial `text`.
    pub fn new(
        uri: Url,
        language_id: impl Into<String>,
        text: &str,
        requests: Arc<RequestManager>,
    ) -> Self {
        let text = Rope::from_str(text);
        Self {
            uri,
            language_id: language_id.into(),
            requests,
            state: Mutex::new(DocState {
                server_text: text.clone(),
                text,
                version: 0,
                opened: false,
                closed: false,
                degraded: false,
                sync: SyncSettings::default(),
                encoding: OffsetEncoding::default(),
                pending: PendingChanges::Clean,
                unsent: Vec::new(),
                diagnostics: Vec::new(),
                diagnostics_version: None,
            }),
            flush_scheduled: AtomicBool::new(false),
        }
    }

    /// URI of the document.
    pub fn uri(&self) -> &Url {
        &self.uri
    }

    /// Language id sent in `didOpen`.
    pub fn language_id(&self) -> &str {
        &self.language_id
    }

    /// Version the server knows.
    pub fn version(&self) -> i32 {
        self.state.lock().version
    }

    /// Current editor text.
    pub fn text(&self) -> String {
        self.state.lock().text.to_string()
    }

    /// Whether `didOpen` has been sent on the current connection.
    pub fn is_open(&self) -> bool {
        self.state.lock().opened
    }

    /// Whether the document was closed.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Whether the server connection was lost while the document was open.
    pub fn is_degraded(&self) -> bool {
        self.state.lock().degraded
    }

    /// Whether edits are waiting to be flushed.
    pub fn has_pending_changes(&self) -> bool {
        !matches!(self.state.lock().pending, PendingChanges::Clean)
    }

    /// Diagnostics currently held.
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.state
            .lock()
            .diagnostics
            .iter()
            .map(|span| span.diagnostic.clone())
            .collect()
    }

    /// Diagnostics with their position in the current text. Diagnostics
    /// whose range was edited since the server computed them are gone.
    pub fn diagnostic_spans(&self) -> Vec<DiagnosticSpan> {
        self.state.lock().diagnostics.clone()
    }

    /// Version the held diagnostics were computed for, if the server said.
    pub fn diagnostics_version(&self) -> Option<i32> {
        self.state.lock().diagnostics_version
    }

    /// Applies the sync behavior and encoding of a started server.
    pub(crate) fn configure(&self, sync: SyncSettings, encoding: OffsetEncoding) {
        let mut state = self.state.lock();
        state.sync = sync;
        state.encoding = encoding;
    }

    /// Sends `didOpen` with the current text and version. Idempotent.
    ///
    /// # Errors
    ///
    /// Fails if the document was closed or the notification cannot be sent.
    pub fn open(&self) -> LspResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(LspError::DocumentClosed(self.uri.to_string()));
        }
        if state.opened {
            return Ok(());
        }

        if state.sync.open_close {
            self.requests
                .notify::<DidOpenTextDocument>(DidOpenTextDocumentParams {
                    text_document: TextDocumentItem {
                        uri: self.uri.clone(),
                        language_id: self.language_id.clone(),
                        version: state.version,
                        text: state.text.to_string(),
                    },
                })?;
        }

        debug!(uri = %self.uri, version = state.version, "document opened");
        state.opened = true;
        state.degraded = false;
        state.server_text = state.text.clone();
        state.pending = PendingChanges::Clean;
        state.unsent.clear();
        Ok(())
    }

    /// Applies a local edit and buffers it for the server.
    ///
    /// # Errors
    ///
    /// Fails if the document is closed or the range is outside the text.
    pub fn edit(&self, edit: LocalEdit) -> LspResult<()> {
        let mut state = self.state.lock();
        self.apply_local(&mut state, edit)
    }

    /// Replaces the whole text.
    ///
    /// # Errors
    ///
    /// Fails if the document is closed.
    pub fn replace_all(&self, text: &str) -> LspResult<()> {
        let mut state = self.state.lock();
        let len = state.text.len_chars();
        self.apply_local(&mut state, LocalEdit::replace(0, len, text))
    }

    fn apply_local(&self, state: &mut DocState, edit: LocalEdit) -> LspResult<()> {
        if state.closed {
            return Err(LspError::DocumentClosed(self.uri.to_string()));
        }
        let len = state.text.len_chars();
        if edit.start > edit.end || edit.end > len {
            return Err(LspError::InvalidRange {
                start: edit.start,
                end: edit.end,
                len,
            });
        }
        self.apply_resolved(state, &edit);
        Ok(())
    }

    /// Applies an edit already checked against the open text.
    fn apply_resolved(&self, state: &mut DocState, edit: &LocalEdit) {
        if state.opened {
            match state.sync.kind {
                SyncKind::None => {}
                SyncKind::Full => state.pending = PendingChanges::Full,
                SyncKind::Incremental => {
                    match chars_to_range(&state.text, edit.start, edit.end, state.encoding) {
                        Some(range) => {
                            let event = TextDocumentContentChangeEvent {
                                range: Some(range),
                                range_length: None,
                                text: edit.text.clone(),
                            };
                            match &mut state.pending {
                                PendingChanges::Incremental(events) => events.push(event),
                                pending @ PendingChanges::Clean => {
                                    *pending = PendingChanges::Incremental(vec![event]);
                                }
                                // A full resend already covers this edit.
                                PendingChanges::Full => {}
                            }
                        }
                        None => state.pending = PendingChanges::Full,
                    }
                }
            }
        }

        state.text.remove(edit.start..edit.end);
        state.text.insert(edit.start, &edit.text);

        let shift = Shift {
            start: edit.start,
            end: edit.end,
            inserted: edit.text.chars().count(),
        };
        state.unsent.push(shift);
        state
            .diagnostics
            .retain_mut(|span| match shift.map(span.start, span.end) {
                Some((start, end)) => {
                    span.start = start;
                    span.end = end;
                    true
                }
                None => false,
            });

        trace!(uri = %self.uri, start = edit.start, end = edit.end, "buffered edit");
    }

    /// Sends buffered edits as one `didChange` with the next version.
    /// Returns whether a notification was sent.
    ///
    /// # Errors
    ///
    /// Fails if the document is closed or the notification cannot be sent;
    /// the edits stay buffered and the version is unchanged.
    pub fn flush(&self) -> LspResult<bool> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(LspError::DocumentClosed(self.uri.to_string()));
        }
        if !state.opened {
            return Ok(false);
        }

        let changes = match &state.pending {
            PendingChanges::Clean => return Ok(false),
            PendingChanges::Full => vec![TextDocumentContentChangeEvent {
                range: None,
                range_length: None,
                text: state.text.to_string(),
            }],
            PendingChanges::Incremental(events) => events.clone(),
        };
        if state.sync.kind == SyncKind::None {
            state.pending = PendingChanges::Clean;
            return Ok(false);
        }

        let version = state.version + 1;
        self.requests
            .notify::<DidChangeTextDocument>(DidChangeTextDocumentParams {
                text_document: VersionedTextDocumentIdentifier {
                    uri: self.uri.clone(),
                    version,
                },
                content_changes: changes,
            })?;

        debug!(uri = %self.uri, version, "flushed changes");
        state.version = version;
        state.pending = PendingChanges::Clean;
        state.server_text = state.text.clone();
        state.unsent.clear();
        Ok(true)
    }

    /// Flushes on the next turn of the runtime, coalescing every edit made
    /// before then into the same `didChange`. Without a runtime the flush
    /// happens immediately.
    pub fn schedule_flush(self: &Arc<Self>) {
        if self.flush_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            self.flush_scheduled.store(false, Ordering::Release);
            self.log_flush(self.flush());
            return;
        };

        let this = Arc::clone(self);
        handle.spawn(async move {
            tokio::task::yield_now().await;
            this.flush_scheduled.store(false, Ordering::Release);
            let result = this.flush();
            this.log_flush(result);
        });
    }

    fn log_flush(&self, result: LspResult<bool>) {
        if let Err(e) = result {
            debug!(uri = %self.uri, error = %e, "scheduled flush failed");
        }
    }

    /// Runs the pre-save protocol and returns edits to apply before saving.
    ///
    /// With `willSaveWaitUntil` this waits for the server's edits, bounded by
    /// the will-save timeout; on timeout or error the save proceeds without
    /// edits. Otherwise a plain `willSave` is sent if the server wants it.
    ///
    /// # Errors
    ///
    /// Fails only if the document is closed.
    pub async fn will_save(&self, reason: TextDocumentSaveReason) -> LspResult<Vec<LocalEdit>> {
        let (opened, sync) = {
            let state = self.state.lock();
            if state.closed {
                return Err(LspError::DocumentClosed(self.uri.to_string()));
            }
            (state.opened, state.sync)
        };
        if !opened {
            return Ok(Vec::new());
        }
        self.log_flush(self.flush());

        let params = WillSaveTextDocumentParams {
            text_document: TextDocumentIdentifier::new(self.uri.clone()),
            reason,
        };

        if sync.will_save_wait_until {
            let version = self.version();
            let response = match self.requests.send_request::<WillSaveWaitUntil>(params) {
                Ok(handle) => handle.response().await,
                Err(e) => Err(e),
            };
            let value = match response {
                Ok(value) => value,
                Err(e) => {
                    warn!(uri = %self.uri, error = %e, "willSaveWaitUntil failed; saving without edits");
                    return Ok(Vec::new());
                }
            };
            let edits: Option<Vec<TextEdit>> = match serde_json::from_value(value) {
                Ok(edits) => edits,
                Err(e) => {
                    warn!(uri = %self.uri, error = %e, "malformed willSaveWaitUntil result");
                    return Ok(Vec::new());
                }
            };
            return self
                .apply_server_edits(Some(version), edits.unwrap_or_default())
                .map(Option::unwrap_or_default);
        }

        if sync.will_save
            && let Err(e) = self.requests.notify::<WillSaveTextDocument>(params)
        {
            debug!(uri = %self.uri, error = %e, "willSave not sent");
        }
        Ok(Vec::new())
    }

    /// Flushes and sends `didSave`, with the text if the server asked.
    ///
    /// # Errors
    ///
    /// Fails if the document is closed or a notification cannot be sent.
    pub fn did_save(&self) -> LspResult<()> {
        self.flush()?;
        let state = self.state.lock();
        if !state.opened || !state.sync.save {
            return Ok(());
        }
        self.requests
            .notify::<DidSaveTextDocument>(DidSaveTextDocumentParams {
                text_document: TextDocumentIdentifier::new(self.uri.clone()),
                text: state.sync.include_text.then(|| state.text.to_string()),
            })
    }

    /// `will_save` with a manual reason, then `did_save`. Returns the
    /// edits applied before saving.
    ///
    /// # Errors
    ///
    /// See [`DocumentSyncManager::did_save`].
    pub async fn save(&self) -> LspResult<Vec<LocalEdit>> {
        let edits = self.will_save(TextDocumentSaveReason::MANUAL).await?;
        self.did_save()?;
        Ok(edits)
    }

    /// Flushes and sends `didClose`. The manager cannot be used afterwards.
    /// Closing twice is a no-op.
    pub fn close(&self) {
        if self.is_closed() {
            return;
        }
        self.log_flush(self.flush());

        let mut state = self.state.lock();
        if state.opened && state.sync.open_close {
            let params = DidCloseTextDocumentParams {
                text_document: TextDocumentIdentifier::new(self.uri.clone()),
            };
            if let Err(e) = self.requests.notify::<DidCloseTextDocument>(params) {
                debug!(uri = %self.uri, error = %e, "didClose not sent");
            }
        }
        state.closed = true;
        state.opened = false;
        state.pending = PendingChanges::Clean;
        debug!(uri = %self.uri, "document closed");
    }

    /// Marks the document as cut off from its server. Buffered changes and
    /// diagnostics are dropped; the next `open` resends the full text.
    pub(crate) fn mark_degraded(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.degraded = true;
        state.opened = false;
        state.pending = PendingChanges::Clean;
        state.unsent.clear();
        state.diagnostics.clear();
        state.diagnostics_version = None;
    }

    /// Forgets the `didOpen` without sending anything, for a connection
    /// that is being torn down.
    pub(crate) fn reset_connection(&self) {
        let mut state = self.state.lock();
        state.opened = false;
        state.pending = PendingChanges::Clean;
        state.unsent.clear();
    }

    /// Replaces the diagnostic set. Returns `false` if `version` is older
    /// than the server-known version and the set was discarded.
    pub fn publish_diagnostics(&self, version: Option<i32>, diagnostics: Vec<Diagnostic>) -> bool {
        let mut state = self.state.lock();
        if let Some(version) = version
            && version < state.version
        {
            debug!(uri = %self.uri, version, current = state.version, "discarding stale diagnostics");
            return false;
        }

        let encoding = state.encoding;
        let spans = diagnostics
            .into_iter()
            .filter_map(|diagnostic| {
                let (mut start, mut end) =
                    range_to_chars(&state.server_text, diagnostic.range, encoding)?;
                for shift in &state.unsent {
                    (start, end) = shift.map(start, end)?;
                }
                Some(DiagnosticSpan {
                    start,
                    end,
                    diagnostic,
                })
            })
            .collect();

        state.diagnostics = spans;
        state.diagnostics_version = version;
        true
    }

    /// Applies server edits computed against `version` and returns them
    /// as local edits, last-first. Returns `None` if the edits are stale,
    /// overlap or fall outside the text; nothing is applied then.
    ///
    /// # Errors
    ///
    /// Fails if the document is closed or buffered edits cannot be sent.
    pub fn apply_server_edits(
        &self,
        version: Option<i32>,
        edits: Vec<TextEdit>,
    ) -> LspResult<Option<Vec<LocalEdit>>> {
        self.flush()?;

        let mut state = self.state.lock();
        let resolved = match self.resolve_edits(&state, version, &edits) {
            Ok(resolved) => resolved,
            Err(EditRejection::Closed(_)) => {
                return Err(LspError::DocumentClosed(self.uri.to_string()));
            }
            Err(rejection) => {
                debug!(uri = %self.uri, %rejection, "discarding server edits");
                return Ok(None);
            }
        };
        for edit in &resolved {
            self.apply_resolved(&mut state, edit);
        }
        Ok(Some(resolved))
    }

    fn flush_for_edit(&self) -> Result<(), EditRejection> {
        match self.flush() {
            Ok(_) => Ok(()),
            Err(LspError::DocumentClosed(_)) => Err(EditRejection::Closed(self.uri.clone())),
            Err(e) => Err(EditRejection::Unsynced {
                uri: self.uri.clone(),
                reason: e.to_string(),
            }),
        }
    }

    /// Maps protocol edits onto the current text, ordered last-first so
    /// each can be applied without shifting the rest. Inserts at the same
    /// position keep their original order in the result text.
    fn resolve_edits(
        &self,
        state: &DocState,
        version: Option<i32>,
        edits: &[TextEdit],
    ) -> Result<Vec<LocalEdit>, EditRejection> {
        if state.closed {
            return Err(EditRejection::Closed(self.uri.clone()));
        }
        if let Some(version) = version
            && version < state.version
        {
            return Err(EditRejection::Stale {
                uri: self.uri.clone(),
                version,
                current: state.version,
            });
        }

        let mut resolved = edits
            .iter()
            .enumerate()
            .map(|(index, edit)| {
                let (start, end) = range_to_chars(&state.text, edit.range, state.encoding)
                    .ok_or_else(|| EditRejection::InvalidRange(self.uri.clone()))?;
                Ok((index, LocalEdit::replace(start, end, edit.new_text.clone())))
            })
            .collect::<Result<Vec<_>, EditRejection>>()?;
        resolved.sort_by(|(ia, a), (ib, b)| {
            b.start
                .cmp(&a.start)
                .then(b.end.cmp(&a.end))
                .then(ib.cmp(ia))
        });

        if resolved
            .windows(2)
            .any(|pair| pair[1].1.end > pair[0].1.start)
        {
            return Err(EditRejection::Overlapping(self.uri.clone()));
        }
        Ok(resolved.into_iter().map(|(_, edit)| edit).collect())
    }
}
