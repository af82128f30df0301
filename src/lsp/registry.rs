//! Sessions of one project.
//!
//! The registry maps definitions to their single [`ServerWrapper`] and
//! routes documents to the server whose definition handles their extension.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;
use lsp_types::{FileChangeType, Url};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use super::LspResult;
use super::definition::ServerDefinition;
use super::document::DocumentSyncManager;
use super::request::RequestStats;
use super::types::url_extension;
use super::wrapper::{ServerStatus, ServerWrapper, SessionContext};
use crate::config::TimeoutKind;
use crate::error::LspError;

/// Every session of one project root.
#[derive(Debug)]
pub struct SessionRegistry {
    root: PathBuf,
    context: SessionContext,
    definitions: RwLock<Vec<ServerDefinition>>,
    sessions: Mutex<HashMap<ServerDefinition, Arc<ServerWrapper>>>,
}

impl SessionRegistry {
    /// Creates an empty registry for the project at `root`.
    pub fn new(root: impl Into<PathBuf>, context: SessionContext) -> Self {
        Self {
            root: root.into(),
            context,
            definitions: RwLock::new(Vec::new()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Project root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Shared session context.
    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    /// Adds a definition. Earlier definitions win for shared extensions.
    pub fn add_definition(&self, definition: ServerDefinition) {
        let mut definitions = self.definitions.write();
        if !definitions.contains(&definition) {
            definitions.push(definition);
        }
    }

    /// Registered definitions, in order.
    pub fn definitions(&self) -> Vec<ServerDefinition> {
        self.definitions.read().clone()
    }

    /// The definition handling `uri`, by extension.
    pub fn definition_for_uri(&self, uri: &Url) -> Option<ServerDefinition> {
        let ext = url_extension(uri)?;
        self.definitions
            .read()
            .iter()
            .find(|definition| definition.handles(&ext))
            .cloned()
    }

    /// The session for `definition`, created stopped on first use. Equal
    /// definitions always yield the same session.
    ///
    /// # Errors
    ///
    /// Fails if the project root is not absolute.
    pub fn get_wrapper(&self, definition: &ServerDefinition) -> LspResult<Arc<ServerWrapper>> {
        let mut sessions = self.sessions.lock();
        if let Some(wrapper) = sessions.get(definition) {
            return Ok(wrapper.clone());
        }
        let wrapper = ServerWrapper::new(definition.clone(), &self.root, self.context.clone())?;
        debug!(server = %definition.id(), root = %self.root.display(), "session created");
        sessions.insert(definition.clone(), wrapper.clone());
        Ok(wrapper)
    }

    /// The existing session serving `uri`, if any.
    pub fn wrapper_for_uri(&self, uri: &Url) -> Option<Arc<ServerWrapper>> {
        let definition = self.definition_for_uri(uri)?;
        self.sessions.lock().get(&definition).cloned()
    }

    fn sessions(&self) -> Vec<Arc<ServerWrapper>> {
        self.sessions.lock().values().cloned().collect()
    }

    /// Connects `uri` to the server for its extension, starting it if
    /// needed.
    ///
    /// # Errors
    ///
    /// Returns [`LspError::DocumentNotFound`] if no definition handles the
    /// file, or the session's connect error.
    pub async fn open_document(&self, uri: Url, text: &str) -> LspResult<Arc<DocumentSyncManager>> {
        let definition = self.definition_for_uri(&uri).ok_or_else(|| {
            LspError::DocumentNotFound(format!("no language server handles {uri}"))
        })?;
        let wrapper = self.get_wrapper(&definition)?;
        wrapper.connect(uri, text).await
    }

    /// Disconnects `uri`. Returns whether it was connected.
    pub fn close_document(&self, uri: &Url) -> bool {
        self.wrapper_for_uri(uri)
            .is_some_and(|wrapper| wrapper.disconnect(uri))
    }

    /// Restarts the session for `definition`.
    ///
    /// # Errors
    ///
    /// See [`ServerWrapper::restart`].
    pub async fn restart(&self, definition: &ServerDefinition) -> LspResult<()> {
        self.get_wrapper(definition)?.restart().await
    }

    /// Shuts every session down concurrently.
    pub async fn shutdown_all(&self) {
        let sessions = self.sessions();
        join_all(sessions.iter().map(|wrapper| wrapper.shutdown())).await;
    }

    /// Forwards a file change to every started session watching it.
    pub fn notify_file_changed(&self, path: &Path, change: FileChangeType) {
        for wrapper in self.sessions() {
            if let Err(e) = wrapper.notify_file_changed(path, change) {
                warn!(server = %wrapper.id(), path = %path.display(), error = %e, "file change not sent");
            }
        }
    }

    /// Status of every session, by server id.
    pub fn statuses(&self) -> BTreeMap<String, ServerStatus> {
        self.sessions()
            .into_iter()
            .map(|wrapper| (wrapper.id(), wrapper.status()))
            .collect()
    }

    /// Request counters of every session, by server id.
    pub fn stats(&self) -> BTreeMap<String, BTreeMap<TimeoutKind, RequestStats>> {
        self.sessions()
            .into_iter()
            .map(|wrapper| (wrapper.id(), wrapper.stats()))
            .collect()
    }

    /// Connected documents of every session, by server id.
    pub fn connected_files(&self) -> BTreeMap<String, Vec<Url>> {
        self.sessions()
            .into_iter()
            .map(|wrapper| (wrapper.id(), wrapper.connected_files()))
            .collect()
    }
}
