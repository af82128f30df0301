//! The lifecycle of one language server session.
//!
//! A [`ServerWrapper`] owns the connection to one server for one project:
//! it starts the process, runs the `initialize` handshake, tracks which
//! documents are connected, notices crashes, and shuts the server down.
//!
//! ```text
//! STOPPED  -> STARTING   start, or connecting the first document
//! STARTING -> STARTED    initialize answered and initialized sent
//! STARTING -> FAILED     launch or handshake failed
//! STARTED  -> FAILED     the connection was lost
//! STARTED  -> STOPPED    shutdown or restart
//! FAILED   -> STOPPED    shutdown
//! FAILED   -> STARTING   restart
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use lsp_types::notification::{DidChangeConfiguration, DidChangeWatchedFiles, Exit, Initialized};
use lsp_types::request::{
    Completion, DocumentSymbolRequest, Formatting, GotoDefinition, HoverRequest, Initialize,
    References, Rename, Request, Shutdown,
};
use lsp_types::{
    ClientInfo, CompletionParams, CompletionResponse, DidChangeConfigurationParams,
    DidChangeWatchedFilesParams, DocumentFormattingParams, DocumentSymbolParams,
    DocumentSymbolResponse, FileChangeType, FileEvent, FormattingOptions, GotoDefinitionParams,
    GotoDefinitionResponse, Hover, HoverParams, InitializeParams, InitializeResult,
    InitializedParams, Location, PartialResultParams, Position, ReferenceContext,
    ReferenceParams, RenameParams, ServerCapabilities, TextDocumentIdentifier,
    TextDocumentPositionParams, TextEdit, Url, WorkDoneProgressParams, WorkspaceEdit,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::LspResult;
use super::capabilities::{SyncSettings, client_capabilities, negotiated_encoding};
use super::connection::ConnectionProvider;
use super::definition::ServerDefinition;
use super::document::DocumentSyncManager;
use super::handler::{Registrations, SessionHandler};
use super::observer::ObserverSet;
use super::position::OffsetEncoding;
use super::request::{ProtocolPhase, RequestManager, RequestStats};
use super::transport::RpcChannel;
use super::types::{language_id_for_extension, url_extension, workspace_folder};
use crate::config::{SharedTimeouts, TimeoutKind, Timeouts};
use crate::error::LspError;
use crate::settings::{ConfigurationSource, EmptyConfiguration, GLOBAL_SCOPE, unflatten};

/// How long queued messages may take to drain when a connection closes.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    /// No server running.
    Stopped,
    /// Launching and initializing.
    Starting,
    /// Initialized and serving requests.
    Started,
    /// Launch or handshake failed, or the server crashed.
    Failed,
}

impl ServerStatus {
    /// Lower-case name.
    pub const fn name(self) -> &'static str {
        match self {
            ServerStatus::Stopped => "stopped",
            ServerStatus::Starting => "starting",
            ServerStatus::Started => "started",
            ServerStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Builds the connection provider for a definition and project root.
pub type ProviderFactory =
    Arc<dyn Fn(&ServerDefinition, &Path) -> Box<dyn ConnectionProvider> + Send + Sync>;

/// What every session of a registry shares.
#[derive(Clone)]
pub struct SessionContext {
    /// Per-bucket request timeouts.
    pub timeouts: SharedTimeouts,
    /// Settings served to the servers.
    pub config: Arc<dyn ConfigurationSource>,
    /// Event subscribers.
    pub observers: ObserverSet,
    /// Connection providers, by default from the definition.
    pub provider_factory: ProviderFactory,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self {
            timeouts: Timeouts::default().shared(),
            config: Arc::new(EmptyConfiguration),
            observers: ObserverSet::default(),
            provider_factory: Arc::new(|definition: &ServerDefinition, root: &Path| {
                definition.connection_provider(root)
            }),
        }
    }
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("timeouts", &*self.timeouts.read())
            .field("observers", &self.observers)
            .finish_non_exhaustive()
    }
}

impl SessionContext {
    /// Uses `timeouts`.
    #[must_use]
    pub fn with_timeouts(mut self, timeouts: SharedTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Serves settings from `config`.
    #[must_use]
    pub fn with_config(mut self, config: Arc<dyn ConfigurationSource>) -> Self {
        self.config = config;
        self
    }

    /// Reports to `observers`.
    #[must_use]
    pub fn with_observers(mut self, observers: ObserverSet) -> Self {
        self.observers = observers;
        self
    }

    /// Connects through providers built by `factory`.
    #[must_use]
    pub fn with_provider_factory(mut self, factory: ProviderFactory) -> Self {
        self.provider_factory = factory;
        self
    }
}

#[derive(Default)]
struct Lifecycle {
    provider: Option<Box<dyn ConnectionProvider>>,
    channel: Option<RpcChannel>,
    monitor: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct WrapperState {
    status: ServerStatus,
    generation: u64,
    documents: HashMap<Url, Arc<DocumentSyncManager>>,
    sync: SyncSettings,
    encoding: OffsetEncoding,
    last_error: Option<String>,
}

/// One server for one project.
pub struct ServerWrapper {
    definition: ServerDefinition,
    root: PathBuf,
    root_uri: Url,
    requests: Arc<RequestManager>,
    registrations: Registrations,
    context: SessionContext,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
    state: parking_lot::Mutex<WrapperState>,
}

impl fmt::Debug for ServerWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerWrapper")
            .field("definition", &self.definition)
            .field("root", &self.root)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl ServerWrapper {
    /// Creates a stopped session for `definition` rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`LspError::InitializationFailed`] if `root` is not an
    /// absolute path.
    pub fn new(
        definition: ServerDefinition,
        root: impl Into<PathBuf>,
        context: SessionContext,
    ) -> LspResult<Arc<Self>> {
        let root = root.into();
        let root_uri = Url::from_directory_path(&root).map_err(|()| {
            LspError::InitializationFailed(format!(
                "project root {} is not an absolute path",
                root.display()
            ))
        })?;

        Ok(Arc::new(Self {
            requests: Arc::new(RequestManager::new(definition.id(), context.timeouts.clone())),
            definition,
            root,
            root_uri,
            registrations: Registrations::default(),
            context,
            lifecycle: tokio::sync::Mutex::new(Lifecycle::default()),
            state: parking_lot::Mutex::new(WrapperState {
                status: ServerStatus::Stopped,
                generation: 0,
                documents: HashMap::new(),
                sync: SyncSettings::default(),
                encoding: OffsetEncoding::default(),
                last_error: None,
            }),
        }))
    }

    /// Name of the server.
    pub fn id(&self) -> String {
        self.definition.id()
    }

    /// The definition this session runs.
    pub fn definition(&self) -> &ServerDefinition {
        &self.definition
    }

    /// Project root the server was started for.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Current status.
    pub fn status(&self) -> ServerStatus {
        self.state.lock().status
    }

    /// Why the session last failed.
    pub fn last_error(&self) -> Option<String> {
        self.state.lock().last_error.clone()
    }

    /// Capabilities of the running server.
    pub fn capabilities(&self) -> Option<ServerCapabilities> {
        self.requests.capabilities()
    }

    /// Per-bucket request counters.
    pub fn stats(&self) -> BTreeMap<TimeoutKind, RequestStats> {
        self.requests.stats()
    }

    /// URIs of connected documents, sorted.
    pub fn connected_files(&self) -> Vec<Url> {
        let mut files: Vec<Url> = self.state.lock().documents.keys().cloned().collect();
        files.sort();
        files
    }

    /// The connected document for `uri`.
    pub fn document(&self, uri: &Url) -> Option<Arc<DocumentSyncManager>> {
        self.state.lock().documents.get(uri).cloned()
    }

    pub(crate) fn root_uri(&self) -> &Url {
        &self.root_uri
    }

    pub(crate) fn requests(&self) -> &RequestManager {
        &self.requests
    }

    pub(crate) fn registrations(&self) -> &Registrations {
        &self.registrations
    }

    pub(crate) fn observers(&self) -> &ObserverSet {
        &self.context.observers
    }

    pub(crate) fn config(&self) -> &dyn ConfigurationSource {
        self.context.config.as_ref()
    }

    fn documents(&self) -> Vec<Arc<DocumentSyncManager>> {
        self.state.lock().documents.values().cloned().collect()
    }

    fn set_status(&self, new: ServerStatus) {
        let old = std::mem::replace(&mut self.state.lock().status, new);
        if old != new {
            info!(server = %self.id(), %old, %new, "server status changed");
            self.context.observers.status_changed(&self.id(), old, new);
        }
    }

    /// Starts the server. A no-op while starting or started.
    ///
    /// # Errors
    ///
    /// Returns the launch or handshake error; the session is then `FAILED`.
    /// A failed session only starts again through [`ServerWrapper::restart`].
    pub async fn start(self: &Arc<Self>) -> LspResult<()> {
        if matches!(self.status(), ServerStatus::Starting | ServerStatus::Started) {
            return Ok(());
        }
        let mut lifecycle = self.lifecycle.lock().await;
        if self.status() == ServerStatus::Failed {
            return Err(LspError::ServerFailed(self.id()));
        }
        self.start_locked(&mut lifecycle).await
    }

    async fn start_locked(self: &Arc<Self>, lifecycle: &mut Lifecycle) -> LspResult<()> {
        // Another caller may have started while we waited for the lock.
        if matches!(self.status(), ServerStatus::Starting | ServerStatus::Started) {
            return Ok(());
        }
        self.set_status(ServerStatus::Starting);

        match self.connect_and_initialize(lifecycle).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(server = %self.id(), error = %e, "failed to start language server");
                self.teardown(lifecycle).await;

                // Documents waiting for this start are dropped.
                let deferred: Vec<_> = {
                    let mut state = self.state.lock();
                    state.last_error = Some(e.to_string());
                    state.documents.drain().map(|(_, doc)| doc).collect()
                };
                for doc in deferred {
                    doc.close();
                }
                self.set_status(ServerStatus::Failed);
                Err(e)
            }
        }
    }

    async fn connect_and_initialize(self: &Arc<Self>, lifecycle: &mut Lifecycle) -> LspResult<()> {
        let provider = lifecycle
            .provider
            .insert((self.context.provider_factory)(&self.definition, &self.root));
        let streams = provider.start().await?;

        let handler = Arc::new(SessionHandler::new(Arc::downgrade(self)));
        let channel = RpcChannel::spawn(self.id(), streams, self.requests.pending(), handler);
        self.requests.attach(channel.sender());
        let closed = channel.closed();
        lifecycle.channel = Some(channel);

        #[allow(deprecated)]
        let params = InitializeParams {
            process_id: Some(std::process::id()),
            root_uri: Some(self.root_uri.clone()),
            initialization_options: self.context.config.initialization_options(&self.root_uri),
            capabilities: client_capabilities(),
            workspace_folders: Some(vec![workspace_folder(&self.root_uri)]),
            client_info: Some(ClientInfo {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
            ..Default::default()
        };

        let result: InitializeResult = self
            .requests
            .request::<Initialize>(params)
            .await
            .map_err(|e| match e {
                timeout @ LspError::Timeout { .. } => timeout,
                other => LspError::InitializationFailed(other.to_string()),
            })?;

        let sync = SyncSettings::from_server(&result.capabilities);
        let encoding = negotiated_encoding(&result.capabilities);
        if let Some(info) = &result.server_info {
            info!(server = %self.id(), name = %info.name, version = ?info.version, "server initialized");
        }
        self.requests.set_capabilities(result.capabilities);
        self.requests.notify::<Initialized>(InitializedParams {})?;
        self.requests.set_phase(ProtocolPhase::Open);

        let generation = {
            let mut state = self.state.lock();
            state.sync = sync;
            state.encoding = encoding;
            state.last_error = None;
            state.generation += 1;
            state.generation
        };
        self.set_status(ServerStatus::Started);

        let settings = unflatten(&self.context.config.attributes("", GLOBAL_SCOPE));
        if let Err(e) = self
            .requests
            .notify::<DidChangeConfiguration>(DidChangeConfigurationParams { settings })
        {
            debug!(server = %self.id(), error = %e, "configuration not pushed");
        }

        lifecycle.monitor = Some(tokio::spawn(watch_connection(
            Arc::downgrade(self),
            closed,
            generation,
        )));

        // Open everything connected while the server was starting.
        for doc in self.documents() {
            doc.configure(sync, encoding);
            if let Err(e) = doc.open() {
                warn!(server = %self.id(), uri = %doc.uri(), error = %e, "failed to open document");
            }
        }
        Ok(())
    }

    async fn teardown(&self, lifecycle: &mut Lifecycle) {
        self.state.lock().generation += 1;
        if let Some(monitor) = lifecycle.monitor.take() {
            monitor.abort();
        }
        self.requests.detach();
        self.registrations.clear();
        if let Some(channel) = lifecycle.channel.take() {
            channel.close(DRAIN_GRACE).await;
        }
        if let Some(mut provider) = lifecycle.provider.take() {
            provider.stop().await;
        }
        for doc in self.documents() {
            doc.reset_connection();
        }
    }

    fn connection_lost(&self, generation: u64) {
        let documents = {
            let state = self.state.lock();
            if state.generation != generation || state.status != ServerStatus::Started {
                return;
            }
            state.documents.values().cloned().collect::<Vec<_>>()
        };

        error!(server = %self.id(), "language server connection lost");
        {
            let mut state = self.state.lock();
            state.generation += 1;
            state.last_error = Some("connection lost".to_string());
        }
        self.requests.detach();
        self.registrations.clear();
        self.set_status(ServerStatus::Failed);

        let server = self.id();
        for doc in documents {
            doc.mark_degraded();
            self.context.observers.document_degraded(&server, doc.uri());
        }
    }

    /// Connects a document, starting the server if needed. Connecting an
    /// already connected URI returns its existing manager unless the
    /// session has failed.
    ///
    /// While the server is starting the document is opened once startup
    /// completes.
    ///
    /// # Errors
    ///
    /// Fails if the session is `FAILED`, the server cannot start, or the
    /// `didOpen` cannot be sent.
    pub async fn connect(self: &Arc<Self>, uri: Url, text: &str) -> LspResult<Arc<DocumentSyncManager>> {
        let (doc, status) = {
            let mut state = self.state.lock();
            if state.status == ServerStatus::Failed {
                return Err(LspError::ServerFailed(self.id()));
            }
            if let Some(doc) = state.documents.get(&uri) {
                return Ok(doc.clone());
            }

            let language_id = url_extension(&uri)
                .map_or("plaintext", |ext| language_id_for_extension(&ext))
                .to_string();
            let doc = Arc::new(DocumentSyncManager::new(
                uri.clone(),
                language_id,
                text,
                self.requests.clone(),
            ));
            if state.status == ServerStatus::Started {
                doc.configure(state.sync, state.encoding);
            }
            state.documents.insert(uri.clone(), doc.clone());
            (doc, state.status)
        };

        match status {
            ServerStatus::Started => {
                if let Err(e) = doc.open() {
                    self.state.lock().documents.remove(&uri);
                    return Err(e);
                }
            }
            ServerStatus::Starting => debug!(server = %self.id(), %uri, "document deferred until started"),
            ServerStatus::Stopped | ServerStatus::Failed => self.start().await?,
        }
        Ok(doc)
    }

    /// Disconnects a document, sending `didClose`. Returns whether it was
    /// connected.
    pub fn disconnect(&self, uri: &Url) -> bool {
        let Some(doc) = self.state.lock().documents.remove(uri) else {
            return false;
        };
        doc.close();
        true
    }

    /// Stops the server if it runs, then starts it again. Connected
    /// documents are opened again with their current text and version.
    ///
    /// # Errors
    ///
    /// See [`ServerWrapper::start`].
    pub async fn restart(self: &Arc<Self>) -> LspResult<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        info!(server = %self.id(), "restarting language server");
        self.teardown(&mut lifecycle).await;
        if self.status() == ServerStatus::Started {
            self.set_status(ServerStatus::Stopped);
        }
        self.start_locked(&mut lifecycle).await
    }

    /// Shuts the server down: closes every document, sends `shutdown` and
    /// `exit`, and stops the process. A no-op unless `STARTED` or `FAILED`.
    pub async fn shutdown(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let status = self.status();
        if !matches!(status, ServerStatus::Started | ServerStatus::Failed) {
            return;
        }
        info!(server = %self.id(), "shutting down language server");

        // A connection closing from here on is expected.
        self.state.lock().generation += 1;

        let documents: Vec<_> = self
            .state
            .lock()
            .documents
            .drain()
            .map(|(_, doc)| doc)
            .collect();
        for doc in documents {
            doc.close();
        }

        if status == ServerStatus::Started {
            self.requests.set_phase(ProtocolPhase::Draining);
            match self.requests.send_request::<Shutdown>(()) {
                Ok(handle) => {
                    if let Err(e) = handle.response().await {
                        warn!(server = %self.id(), error = %e, "shutdown request failed");
                    }
                }
                Err(e) => debug!(server = %self.id(), error = %e, "shutdown not sent"),
            }
            if let Err(e) = self.requests.notify::<Exit>(()) {
                debug!(server = %self.id(), error = %e, "exit not sent");
            }
        }

        self.teardown(&mut lifecycle).await;
        self.set_status(ServerStatus::Stopped);
    }

    /// Forwards a file system change if the server registered a watcher
    /// for it. Returns whether a notification was sent.
    ///
    /// # Errors
    ///
    /// Fails if the notification cannot be sent.
    pub fn notify_file_changed(&self, path: &Path, change: FileChangeType) -> LspResult<bool> {
        if self.status() != ServerStatus::Started || !self.registrations.watches(path, change) {
            return Ok(false);
        }
        let uri = Url::from_file_path(path).map_err(|()| {
            LspError::DocumentNotFound(format!("invalid path: {}", path.display()))
        })?;
        self.requests
            .notify::<DidChangeWatchedFiles>(DidChangeWatchedFilesParams {
                changes: vec![FileEvent::new(uri, change)],
            })?;
        Ok(true)
    }

    /// Sends a typed request to the running server. Pending edits of the
    /// document named by `uri` are flushed first.
    ///
    /// # Errors
    ///
    /// Fails if the server is not started, or with the request's error.
    pub async fn request<R>(&self, uri: Option<&Url>, params: R::Params) -> LspResult<R::Result>
    where
        R: Request,
        R::Params: Serialize,
        R::Result: DeserializeOwned,
    {
        match self.status() {
            ServerStatus::Started => {}
            ServerStatus::Failed => return Err(LspError::ServerFailed(self.id())),
            status => {
                return Err(LspError::NotReady {
                    method: R::METHOD.to_string(),
                    phase: status.name(),
                });
            }
        }
        if let Some(doc) = uri.and_then(|uri| self.document(uri)) {
            doc.flush()?;
        }
        self.requests.request::<R>(params).await
    }

    /// `textDocument/hover`.
    ///
    /// # Errors
    ///
    /// See [`ServerWrapper::request`].
    pub async fn hover(&self, uri: &Url, position: Position) -> LspResult<Option<Hover>> {
        let params = HoverParams {
            text_document_position_params: position_params(uri, position),
            work_done_progress_params: WorkDoneProgressParams::default(),
        };
        self.request::<HoverRequest>(Some(uri), params).await
    }

    /// `textDocument/definition`.
    ///
    /// # Errors
    ///
    /// See [`ServerWrapper::request`].
    pub async fn goto_definition(
        &self,
        uri: &Url,
        position: Position,
    ) -> LspResult<Option<GotoDefinitionResponse>> {
        let params = GotoDefinitionParams {
            text_document_position_params: position_params(uri, position),
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
        };
        self.request::<GotoDefinition>(Some(uri), params).await
    }

    /// `textDocument/references`.
    ///
    /// # Errors
    ///
    /// See [`ServerWrapper::request`].
    pub async fn references(
        &self,
        uri: &Url,
        position: Position,
        include_declaration: bool,
    ) -> LspResult<Option<Vec<Location>>> {
        let params = ReferenceParams {
            text_document_position: position_params(uri, position),
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
            context: ReferenceContext {
                include_declaration,
            },
        };
        self.request::<References>(Some(uri), params).await
    }

    /// `textDocument/completion`.
    ///
    /// # Errors
    ///
    /// See [`ServerWrapper::request`].
    pub async fn completion(
        &self,
        uri: &Url,
        position: Position,
    ) -> LspResult<Option<CompletionResponse>> {
        let params = CompletionParams {
            text_document_position: position_params(uri, position),
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
            context: None,
        };
        self.request::<Completion>(Some(uri), params).await
    }

    /// `textDocument/documentSymbol`.
    ///
    /// # Errors
    ///
    /// See [`ServerWrapper::request`].
    pub async fn document_symbols(&self, uri: &Url) -> LspResult<Option<DocumentSymbolResponse>> {
        let params = DocumentSymbolParams {
            text_document: TextDocumentIdentifier::new(uri.clone()),
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
        };
        self.request::<DocumentSymbolRequest>(Some(uri), params).await
    }

    /// `textDocument/formatting`.
    ///
    /// # Errors
    ///
    /// See [`ServerWrapper::request`].
    pub async fn formatting(
        &self,
        uri: &Url,
        options: FormattingOptions,
    ) -> LspResult<Option<Vec<TextEdit>>> {
        let params = DocumentFormattingParams {
            text_document: TextDocumentIdentifier::new(uri.clone()),
            options,
            work_done_progress_params: WorkDoneProgressParams::default(),
        };
        self.request::<Formatting>(Some(uri), params).await
    }

    /// `textDocument/rename`.
    ///
    /// # Errors
    ///
    /// See [`ServerWrapper::request`].
    pub async fn rename(
        &self,
        uri: &Url,
        position: Position,
        new_name: impl Into<String>,
    ) -> LspResult<Option<WorkspaceEdit>> {
        let params = RenameParams {
            text_document_position: position_params(uri, position),
            new_name: new_name.into(),
            work_done_progress_params: WorkDoneProgressParams::default(),
        };
        self.request::<Rename>(Some(uri), params).await
    }
}

fn position_params(uri: &Url, position: Position) -> TextDocumentPositionParams {
    TextDocumentPositionParams {
        text_document: TextDocumentIdentifier::new(uri.clone()),
        position,
    }
}

async fn watch_connection(wrapper: Weak<ServerWrapper>, mut closed: watch::Receiver<bool>, generation: u64) {
    // An error means the channel was torn down on purpose.
    if closed.wait_for(|closed| *closed).await.is_err() {
        return;
    }
    if let Some(wrapper) = wrapper.upgrade() {
        wrapper.connection_lost(generation);
    }
}
