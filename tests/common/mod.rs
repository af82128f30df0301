//! Common test helpers and utilities.

#![allow(dead_code)]

pub mod fake_server;
pub mod temp_workspace;

use kadabra_lsp::lsp::{
    Diagnostic, LocalEdit, ObserverSet, ServerDefinition, ServerStatus, ServerWrapper,
    SessionContext, SessionObserver, Url,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

// Re-export for convenience
pub use fake_server::{FakeConfig, FakeServer, context};
pub use temp_workspace::TestWorkspace;

/// A small Rust project used by most tests.
pub const SAMPLE_PROJECT: &str = r#"
//- Cargo.toml
[package]
name = "sample"
version = "0.1.0"
//- src/main.rs
fn main() {
    let total = sample::add(1, 2);
    println!("{}", $0total);
}
//- src/lib.rs
pub fn add(a: i32, b: i32) -> i32 {
    a + b
}
"#;

/// Definition handling `.rs` files.
pub fn rust_definition() -> ServerDefinition {
    ServerDefinition::exe("rs", "fake-analyzer", vec![])
}

/// Everything observers saw, in order.
#[derive(Debug, Default)]
pub struct Recorder {
    pub statuses: Mutex<Vec<(String, ServerStatus, ServerStatus)>>,
    pub diagnostics: Mutex<Vec<(Url, Vec<Diagnostic>)>>,
    pub degraded: Mutex<Vec<Url>>,
    pub edits: Mutex<Vec<(Url, Vec<LocalEdit>)>>,
}

impl Recorder {
    /// Statuses entered, in order.
    pub fn transitions(&self) -> Vec<ServerStatus> {
        self.statuses.lock().iter().map(|(_, _, new)| *new).collect()
    }
}

impl SessionObserver for Recorder {
    fn status_changed(&self, server: &str, old: ServerStatus, new: ServerStatus) {
        self.statuses.lock().push((server.to_string(), old, new));
    }

    fn diagnostics_published(&self, uri: &Url, diagnostics: &[Diagnostic]) {
        self.diagnostics
            .lock()
            .push((uri.clone(), diagnostics.to_vec()));
    }

    fn document_degraded(&self, _server: &str, uri: &Url) {
        self.degraded.lock().push(uri.clone());
    }

    fn edits_applied(&self, uri: &Url, edits: &[LocalEdit]) {
        self.edits.lock().push((uri.clone(), edits.to_vec()));
    }
}

/// A fake server, a recording observer and a context wired to both.
pub fn setup_context(config: FakeConfig) -> (Arc<FakeServer>, Arc<Recorder>, SessionContext) {
    let server = FakeServer::new(config);
    let recorder = Arc::new(Recorder::default());
    let observers = ObserverSet::default();
    observers.subscribe(recorder.clone());
    let context = context(&server).with_observers(observers);
    (server, recorder, context)
}

/// A stopped session for [`SAMPLE_PROJECT`] backed by a fake server.
pub fn setup_session(
    config: FakeConfig,
) -> (TestWorkspace, Arc<FakeServer>, Arc<Recorder>, Arc<ServerWrapper>) {
    let workspace = TestWorkspace::new(SAMPLE_PROJECT);
    let (server, recorder, context) = setup_context(config);
    let wrapper = ServerWrapper::new(rust_definition(), workspace.path(), context)
        .expect("workspace root is absolute");
    (workspace, server, recorder, wrapper)
}

/// Polls `condition` until it holds.
/// ## Panics
/// after two seconds
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let poll = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(2), poll)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting until {what}"));
}
