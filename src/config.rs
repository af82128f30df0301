//! Request timeout configuration.
//!
//! Every outbound request belongs to a [`TimeoutKind`] bucket. The
//! [`Timeouts`] table maps each bucket to a deadline, is read by the request
//! manager before every call, and can be persisted as a JSON object of
//! bucket name to milliseconds:
//!
//! ```json
//! { "HOVER": 1500, "INIT": 30000 }
//! ```
//!
//! Buckets missing from the file keep their defaults.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Environment variable naming the timeouts file used by [`Timeouts::default_path`].
pub const TIMEOUTS_ENV: &str = "KADABRA_LSP_TIMEOUTS";

/// A named class of request sharing one deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TimeoutKind {
    /// `textDocument/codeAction`.
    #[serde(rename = "CODEACTION")]
    CodeAction,
    /// `textDocument/codeLens`.
    #[serde(rename = "CODELENS")]
    CodeLens,
    /// `textDocument/completion`.
    #[serde(rename = "COMPLETION")]
    Completion,
    /// Definition, declaration, type definition and implementation.
    #[serde(rename = "DEFINITION")]
    Definition,
    /// `textDocument/documentHighlight`.
    #[serde(rename = "DOC_HIGHLIGHT")]
    DocHighlight,
    /// `workspace/executeCommand`.
    #[serde(rename = "EXECUTE_COMMAND")]
    ExecuteCommand,
    /// Whole-document, range and on-type formatting.
    #[serde(rename = "FORMATTING")]
    Formatting,
    /// `textDocument/hover`.
    #[serde(rename = "HOVER")]
    Hover,
    /// `initialize`.
    #[serde(rename = "INIT")]
    Init,
    /// `textDocument/prepareRename`.
    #[serde(rename = "PREPARE_RENAME")]
    PrepareRename,
    /// `textDocument/references`.
    #[serde(rename = "REFERENCES")]
    References,
    /// `textDocument/rename`.
    #[serde(rename = "RENAME")]
    Rename,
    /// `textDocument/signatureHelp`.
    #[serde(rename = "SIGNATURE")]
    Signature,
    /// `shutdown`.
    #[serde(rename = "SHUTDOWN")]
    Shutdown,
    /// Document and workspace symbols.
    #[serde(rename = "SYMBOLS")]
    Symbols,
    /// `textDocument/willSaveWaitUntil`.
    #[serde(rename = "WILLSAVE")]
    WillSave,
    /// Anything else.
    #[serde(rename = "OTHER")]
    Other,
}

impl TimeoutKind {
    /// Every bucket, in table order.
    pub const ALL: [TimeoutKind; 17] = [
        TimeoutKind::CodeAction,
        TimeoutKind::CodeLens,
        TimeoutKind::Completion,
        TimeoutKind::Definition,
        TimeoutKind::DocHighlight,
        TimeoutKind::ExecuteCommand,
        TimeoutKind::Formatting,
        TimeoutKind::Hover,
        TimeoutKind::Init,
        TimeoutKind::PrepareRename,
        TimeoutKind::References,
        TimeoutKind::Rename,
        TimeoutKind::Signature,
        TimeoutKind::Shutdown,
        TimeoutKind::Symbols,
        TimeoutKind::WillSave,
        TimeoutKind::Other,
    ];

    /// Default deadline in milliseconds.
    pub const fn default_millis(self) -> u64 {
        match self {
            TimeoutKind::Completion | TimeoutKind::DocHighlight | TimeoutKind::Signature => 1000,
            TimeoutKind::Shutdown => 5000,
            TimeoutKind::Init => 10_000,
            _ => 2000,
        }
    }

    /// Bucket for an LSP method. Unknown methods fall into [`TimeoutKind::Other`].
    pub fn for_method(method: &str) -> Self {
        match method {
            "initialize" => TimeoutKind::Init,
            "shutdown" => TimeoutKind::Shutdown,
            "textDocument/completion" | "completionItem/resolve" => TimeoutKind::Completion,
            "textDocument/hover" => TimeoutKind::Hover,
            "textDocument/signatureHelp" => TimeoutKind::Signature,
            "textDocument/definition"
            | "textDocument/declaration"
            | "textDocument/typeDefinition"
            | "textDocument/implementation" => TimeoutKind::Definition,
            "textDocument/references" => TimeoutKind::References,
            "textDocument/documentHighlight" => TimeoutKind::DocHighlight,
            "textDocument/documentSymbol" | "workspace/symbol" => TimeoutKind::Symbols,
            "textDocument/formatting"
            | "textDocument/rangeFormatting"
            | "textDocument/onTypeFormatting" => TimeoutKind::Formatting,
            "textDocument/codeAction" | "codeAction/resolve" => TimeoutKind::CodeAction,
            "textDocument/codeLens" | "codeLens/resolve" => TimeoutKind::CodeLens,
            "workspace/executeCommand" => TimeoutKind::ExecuteCommand,
            "textDocument/prepareRename" => TimeoutKind::PrepareRename,
            "textDocument/rename" => TimeoutKind::Rename,
            "textDocument/willSaveWaitUntil" => TimeoutKind::WillSave,
            _ => TimeoutKind::Other,
        }
    }

    /// Name used in the persisted table.
    pub const fn name(self) -> &'static str {
        match self {
            TimeoutKind::CodeAction => "CODEACTION",
            TimeoutKind::CodeLens => "CODELENS",
            TimeoutKind::Completion => "COMPLETION",
            TimeoutKind::Definition => "DEFINITION",
            TimeoutKind::DocHighlight => "DOC_HIGHLIGHT",
            TimeoutKind::ExecuteCommand => "EXECUTE_COMMAND",
            TimeoutKind::Formatting => "FORMATTING",
            TimeoutKind::Hover => "HOVER",
            TimeoutKind::Init => "INIT",
            TimeoutKind::PrepareRename => "PREPARE_RENAME",
            TimeoutKind::References => "REFERENCES",
            TimeoutKind::Rename => "RENAME",
            TimeoutKind::Signature => "SIGNATURE",
            TimeoutKind::Shutdown => "SHUTDOWN",
            TimeoutKind::Symbols => "SYMBOLS",
            TimeoutKind::WillSave => "WILLSAVE",
            TimeoutKind::Other => "OTHER",
        }
    }
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Deadline per request bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeouts {
    millis: BTreeMap<TimeoutKind, u64>,
}

/// Timeouts table shared between sessions and the code that edits it.
pub type SharedTimeouts = Arc<RwLock<Timeouts>>;

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            millis: TimeoutKind::ALL
                .iter()
                .map(|kind| (*kind, kind.default_millis()))
                .collect(),
        }
    }
}

impl Timeouts {
    /// Deadline for `kind`.
    pub fn get(&self, kind: TimeoutKind) -> Duration {
        Duration::from_millis(
            self.millis
                .get(&kind)
                .copied()
                .unwrap_or_else(|| kind.default_millis()),
        )
    }

    /// Overrides the deadline for `kind`.
    pub fn set(&mut self, kind: TimeoutKind, timeout: Duration) {
        let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.millis.insert(kind, millis);
    }

    /// Same table with `kind` overridden, for builder-style setup.
    #[must_use]
    pub fn with(mut self, kind: TimeoutKind, timeout: Duration) -> Self {
        self.set(kind, timeout);
        self
    }

    /// Wraps the table for sharing.
    pub fn shared(self) -> SharedTimeouts {
        Arc::new(RwLock::new(self))
    }

    /// Loads a table from `path`, filling missing buckets with defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a JSON object
    /// of known bucket names to milliseconds.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let overrides: BTreeMap<TimeoutKind, u64> =
            serde_json::from_str(&content).map_err(|e| ConfigError::ParseError {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;

        let mut table = Self::default();
        table.millis.extend(overrides);
        Ok(table)
    }

    /// Loads `path` if it exists, otherwise returns the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be parsed.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Writes the table atomically (temp file + rename).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let temp_file = path.with_extension("tmp");
        let json_str =
            serde_json::to_string_pretty(&self.millis).map_err(|e| ConfigError::ParseError {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;

        fs::write(&temp_file, json_str)?;
        fs::rename(&temp_file, path)?;
        Ok(())
    }

    /// Path named by [`TIMEOUTS_ENV`], if set.
    pub fn default_path() -> Option<PathBuf> {
        std::env::var_os(TIMEOUTS_ENV).map(PathBuf::from)
    }
}
