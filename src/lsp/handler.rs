//! Server-initiated traffic.
//!
//! [`SessionHandler`] answers server requests and consumes server
//! notifications for one session. It runs on the connection's reader task,
//! so nothing here blocks or awaits.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Weak;

use globset::{GlobBuilder, GlobMatcher};
use lsp_types::{
    ApplyWorkspaceEditParams, ApplyWorkspaceEditResponse, ConfigurationParams, DocumentChangeOperation,
    DocumentChanges, FileChangeType, LogMessageParams, MessageType, OneOf, PublishDiagnosticsParams,
    Registration, RegistrationParams, ShowMessageParams, ShowMessageRequestParams, TextDocumentEdit,
    TextEdit, UnregistrationParams, Url, WorkspaceEdit,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error, info, trace, warn};

use super::document::{DocumentEdits, apply_workspace_edits};
use super::transport::{
    AnyNotification, AnyRequest, ErrorCode, InboundHandler, ResponseError, method_not_found,
};
use super::types::workspace_folder;
use super::wrapper::ServerWrapper;
use crate::settings::{GLOBAL_SCOPE, unflatten};

const DID_CHANGE_WATCHED_FILES: &str = "workspace/didChangeWatchedFiles";

// WatchKind bits.
const WATCH_CREATE: u32 = 1;
const WATCH_CHANGE: u32 = 2;
const WATCH_DELETE: u32 = 4;

/// A request the server sent to the client.
#[derive(Debug)]
pub enum ServerRequest {
    /// `workspace/configuration`
    Configuration(ConfigurationParams),
    /// `workspace/workspaceFolders`
    WorkspaceFolders,
    /// `client/registerCapability`
    RegisterCapability(RegistrationParams),
    /// `client/unregisterCapability`
    UnregisterCapability(UnregistrationParams),
    /// `workspace/applyEdit`
    ApplyEdit(ApplyWorkspaceEditParams),
    /// `window/showMessageRequest`
    ShowMessageRequest(ShowMessageRequestParams),
    /// `window/workDoneProgress/create`
    WorkDoneProgressCreate,
    /// One of the `workspace/*/refresh` requests.
    Refresh(String),
    /// Anything else.
    Unknown(String),
}

impl ServerRequest {
    /// Decodes a request by method.
    ///
    /// # Errors
    ///
    /// Returns an `InvalidParams` error if the parameters do not decode.
    pub fn parse(method: &str, params: Value) -> Result<Self, ResponseError> {
        Ok(match method {
            "workspace/configuration" => Self::Configuration(decode(method, params)?),
            "workspace/workspaceFolders" => Self::WorkspaceFolders,
            "client/registerCapability" => Self::RegisterCapability(decode(method, params)?),
            "client/unregisterCapability" => Self::UnregisterCapability(decode(method, params)?),
            "workspace/applyEdit" => Self::ApplyEdit(decode(method, params)?),
            "window/showMessageRequest" => Self::ShowMessageRequest(decode(method, params)?),
            "window/workDoneProgress/create" => Self::WorkDoneProgressCreate,
            "workspace/semanticTokens/refresh"
            | "workspace/inlayHint/refresh"
            | "workspace/codeLens/refresh"
            | "workspace/diagnostic/refresh" => Self::Refresh(method.to_string()),
            other => Self::Unknown(other.to_string()),
        })
    }
}

/// A notification the server sent to the client.
#[derive(Debug)]
pub enum ServerNotification {
    /// `textDocument/publishDiagnostics`
    PublishDiagnostics(PublishDiagnosticsParams),
    /// `window/logMessage`
    LogMessage(LogMessageParams),
    /// `window/showMessage`
    ShowMessage(ShowMessageParams),
    /// `$/progress`
    Progress(Value),
    /// `telemetry/event`
    Telemetry(Value),
    /// Anything else.
    Unknown(String),
}

impl ServerNotification {
    /// Decodes a notification by method.
    ///
    /// # Errors
    ///
    /// Returns an `InvalidParams` error if the parameters do not decode.
    pub fn parse(method: &str, params: Value) -> Result<Self, ResponseError> {
        Ok(match method {
            "textDocument/publishDiagnostics" => Self::PublishDiagnostics(decode(method, params)?),
            "window/logMessage" => Self::LogMessage(decode(method, params)?),
            "window/showMessage" => Self::ShowMessage(decode(method, params)?),
            "$/progress" => Self::Progress(params),
            "telemetry/event" => Self::Telemetry(params),
            other => Self::Unknown(other.to_string()),
        })
    }
}

fn decode<T: DeserializeOwned>(method: &str, params: Value) -> Result<T, ResponseError> {
    serde_json::from_value(params).map_err(|e| {
        ResponseError::new(ErrorCode::INVALID_PARAMS, format!("invalid {method} params: {e}"))
    })
}

/// Inbound handler of one session.
pub(crate) struct SessionHandler {
    session: Weak<ServerWrapper>,
}

impl SessionHandler {
    pub(crate) fn new(session: Weak<ServerWrapper>) -> Self {
        Self { session }
    }
}

impl InboundHandler for SessionHandler {
    fn handle_request(&self, request: AnyRequest) -> Result<Value, ResponseError> {
        let Some(session) = self.session.upgrade() else {
            return Err(ResponseError::new(
                ErrorCode::INTERNAL_ERROR,
                "session is shutting down",
            ));
        };

        match ServerRequest::parse(&request.method, request.params)? {
            ServerRequest::Configuration(params) => Ok(configuration(&session, &params)),
            ServerRequest::WorkspaceFolders => {
                to_json(vec![workspace_folder(session.root_uri())])
            }
            ServerRequest::RegisterCapability(params) => {
                register(&session, params.registrations);
                Ok(Value::Null)
            }
            ServerRequest::UnregisterCapability(params) => {
                for unregistration in params.unregisterations {
                    let id = &unregistration.id;
                    session.registrations().unregister(id);
                    if let Some(method) = session.requests().unregister_dynamic(id) {
                        debug!(server = %session.id(), %method, %id, "capability unregistered");
                    }
                }
                Ok(Value::Null)
            }
            ServerRequest::ApplyEdit(params) => to_json(apply_edit(&session, params.edit)),
            ServerRequest::ShowMessageRequest(params) => {
                let action = session
                    .observers()
                    .show_message_request(&session.id(), &params);
                to_json(action)
            }
            ServerRequest::WorkDoneProgressCreate | ServerRequest::Refresh(_) => Ok(Value::Null),
            ServerRequest::Unknown(method) => {
                debug!(server = %session.id(), %method, "unhandled server request");
                Err(method_not_found(&method))
            }
        }
    }

    fn handle_notification(&self, notification: AnyNotification) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        let server = session.id();

        let method = notification.method;
        let notification = match ServerNotification::parse(&method, notification.params) {
            Ok(notification) => notification,
            Err(e) => {
                warn!(%server, %method, error = %e.message, "dropping notification");
                return;
            }
        };

        match notification {
            ServerNotification::PublishDiagnostics(params) => {
                let accepted = session.document(&params.uri).is_none_or(|doc| {
                    doc.publish_diagnostics(params.version, params.diagnostics.clone())
                });
                if accepted {
                    session
                        .observers()
                        .diagnostics_published(&params.uri, &params.diagnostics);
                }
            }
            ServerNotification::LogMessage(params) => match params.typ {
                MessageType::ERROR => error!(%server, "{}", params.message),
                MessageType::WARNING => warn!(%server, "{}", params.message),
                MessageType::INFO => info!(%server, "{}", params.message),
                _ => debug!(%server, "{}", params.message),
            },
            ServerNotification::ShowMessage(params) => {
                session.observers().show_message(&server, &params);
            }
            ServerNotification::Progress(params) => trace!(%server, %params, "progress"),
            ServerNotification::Telemetry(params) => trace!(%server, %params, "telemetry"),
            ServerNotification::Unknown(method) => {
                debug!(%server, %method, "unhandled server notification");
            }
        }
    }
}

fn to_json<T: serde::Serialize>(value: T) -> Result<Value, ResponseError> {
    serde_json::to_value(value)
        .map_err(|e| ResponseError::new(ErrorCode::INTERNAL_ERROR, e.to_string()))
}

fn configuration(session: &ServerWrapper, params: &ConfigurationParams) -> Value {
    let config = session.config();
    let items = params
        .items
        .iter()
        .map(|item| {
            let scope = item
                .scope_uri
                .as_ref()
                .map_or_else(|| GLOBAL_SCOPE.to_string(), |uri| config.scope_for_uri(uri));
            let attrs = config.attributes(item.section.as_deref().unwrap_or(""), &scope);
            if attrs.is_empty() {
                Value::Null
            } else {
                unflatten(&attrs)
            }
        })
        .collect();
    Value::Array(items)
}

fn register(session: &ServerWrapper, registrations: Vec<Registration>) {
    for registration in registrations {
        let method = registration.method.clone();
        match session.registrations().register(&registration) {
            Ok(()) => {
                session
                    .requests()
                    .register_dynamic(&registration.id, &method);
                debug!(server = %session.id(), %method, id = %registration.id, "capability registered");
            }
            Err(e) => {
                warn!(server = %session.id(), %method, error = %e, "ignoring registration");
            }
        }
    }
}

/// Applies a workspace edit to connected documents as a whole. Edits are
/// merged per document; `documentChanges` wins over `changes` when both are
/// present. Every target must be connected, current and free of overlapping
/// edits, or nothing changes.
fn apply_edit(session: &ServerWrapper, edit: WorkspaceEdit) -> ApplyWorkspaceEditResponse {
    let targets = match edit_targets(edit) {
        Ok(targets) => targets,
        Err(response) => return response,
    };

    let mut batch = Vec::with_capacity(targets.len());
    for (uri, (version, edits)) in targets {
        let Some(document) = session.document(&uri) else {
            return rejected(&format!("{uri} is not open"));
        };
        batch.push(DocumentEdits {
            document,
            version,
            edits,
        });
    }

    match apply_workspace_edits(batch) {
        Ok(applied) => {
            for (uri, edits) in &applied {
                session.observers().edits_applied(uri, edits);
            }
            ApplyWorkspaceEditResponse {
                applied: true,
                failure_reason: None,
                failed_change: None,
            }
        }
        Err(rejection) => rejected(&rejection.to_string()),
    }
}

type EditTargets = BTreeMap<Url, (Option<i32>, Vec<TextEdit>)>;

fn edit_targets(edit: WorkspaceEdit) -> Result<EditTargets, ApplyWorkspaceEditResponse> {
    let mut targets = EditTargets::new();
    match edit.document_changes {
        Some(DocumentChanges::Edits(edits)) => {
            for edit in edits {
                merge_document_edit(&mut targets, edit);
            }
        }
        Some(DocumentChanges::Operations(operations)) => {
            for operation in operations {
                match operation {
                    DocumentChangeOperation::Edit(edit) => merge_document_edit(&mut targets, edit),
                    DocumentChangeOperation::Op(_) => {
                        return Err(rejected("resource operations are not supported"));
                    }
                }
            }
        }
        None => {
            for (uri, edits) in edit.changes.into_iter().flatten() {
                merge_edits(&mut targets, uri, None, edits);
            }
        }
    }
    Ok(targets)
}

fn merge_document_edit(targets: &mut EditTargets, edit: TextDocumentEdit) {
    let edits = edit.edits.into_iter().map(text_edit).collect();
    merge_edits(
        targets,
        edit.text_document.uri,
        edit.text_document.version,
        edits,
    );
}

/// Groups for one URI share the lowest version any of them names.
fn merge_edits(targets: &mut EditTargets, uri: Url, version: Option<i32>, edits: Vec<TextEdit>) {
    let (known, merged) = targets.entry(uri).or_insert((version, Vec::new()));
    *known = match (*known, version) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };
    merged.extend(edits);
}

fn text_edit(edit: OneOf<TextEdit, lsp_types::AnnotatedTextEdit>) -> TextEdit {
    match edit {
        OneOf::Left(edit) => edit,
        OneOf::Right(annotated) => annotated.text_edit,
    }
}

fn rejected(reason: &str) -> ApplyWorkspaceEditResponse {
    debug!(reason, "workspace edit rejected");
    ApplyWorkspaceEditResponse {
        applied: false,
        failure_reason: Some(reason.to_string()),
        failed_change: None,
    }
}

#[derive(Debug)]
struct FileWatcher {
    matcher: GlobMatcher,
    kind: u32,
}

#[derive(Debug)]
struct DynamicRegistration {
    method: String,
    watchers: Vec<FileWatcher>,
}

/// Capabilities the server registered at runtime, keyed by registration id.
#[derive(Debug, Default)]
pub(crate) struct Registrations {
    entries: Mutex<HashMap<String, DynamicRegistration>>,
}

impl Registrations {
    /// Records a registration, compiling file watchers if it has any.
    pub(crate) fn register(&self, registration: &Registration) -> Result<(), String> {
        let watchers = if registration.method == DID_CHANGE_WATCHED_FILES {
            let options = registration
                .register_options
                .as_ref()
                .ok_or_else(|| "missing registerOptions".to_string())?;
            parse_watchers(options)?
        } else {
            Vec::new()
        };

        self.entries.lock().insert(
            registration.id.clone(),
            DynamicRegistration {
                method: registration.method.clone(),
                watchers,
            },
        );
        Ok(())
    }

    /// Drops a registration and returns its method.
    pub(crate) fn unregister(&self, id: &str) -> Option<String> {
        self.entries.lock().remove(id).map(|entry| entry.method)
    }

    /// Forgets every registration.
    pub(crate) fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Whether some watcher asked for `change` events on `path`.
    pub(crate) fn watches(&self, path: &Path, change: FileChangeType) -> bool {
        let bit = if change == FileChangeType::CREATED {
            WATCH_CREATE
        } else if change == FileChangeType::DELETED {
            WATCH_DELETE
        } else {
            WATCH_CHANGE
        };

        self.entries
            .lock()
            .values()
            .flat_map(|entry| entry.watchers.iter())
            .any(|watcher| watcher.kind & bit != 0 && watcher.matcher.is_match(path))
    }
}

fn parse_watchers(options: &Value) -> Result<Vec<FileWatcher>, String> {
    let watchers = options
        .get("watchers")
        .and_then(Value::as_array)
        .ok_or_else(|| "registerOptions has no watchers".to_string())?;

    watchers
        .iter()
        .map(|watcher| {
            let pattern = match watcher.get("globPattern") {
                Some(Value::String(pattern)) => pattern.clone(),
                Some(Value::Object(relative)) => relative_pattern(relative)?,
                _ => return Err(format!("invalid globPattern in {watcher}")),
            };
            let kind = watcher
                .get("kind")
                .and_then(Value::as_u64)
                .and_then(|kind| u32::try_from(kind).ok())
                .unwrap_or(WATCH_CREATE | WATCH_CHANGE | WATCH_DELETE);
            let glob = GlobBuilder::new(&pattern)
                .literal_separator(true)
                .build()
                .map_err(|e| format!("invalid glob {pattern}: {e}"))?;
            Ok(FileWatcher {
                matcher: glob.compile_matcher(),
                kind,
            })
        })
        .collect()
}

fn relative_pattern(relative: &serde_json::Map<String, Value>) -> Result<String, String> {
    let base = match relative.get("baseUri") {
        Some(Value::String(uri)) => uri.as_str(),
        Some(Value::Object(folder)) => folder
            .get("uri")
            .and_then(Value::as_str)
            .ok_or_else(|| "workspace folder without uri".to_string())?,
        _ => return Err("relative pattern without baseUri".to_string()),
    };
    let base: PathBuf = Url::parse(base)
        .ok()
        .and_then(|url| url.to_file_path().ok())
        .ok_or_else(|| format!("baseUri {base} is not a file URI"))?;
    let pattern = relative
        .get("pattern")
        .and_then(Value::as_str)
        .ok_or_else(|| "relative pattern without pattern".to_string())?;
    Ok(format!(
        "{}/{pattern}",
        base.display().to_string().trim_end_matches('/')
    ))
}
