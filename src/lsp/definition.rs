//! Server definitions: which server handles which files, and how to launch it.
//!
//! A definition is a plain value. Two definitions with the same fields
//! describe the same server and share one session.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::connection::{ConnectionProvider, ProcessConnection, SocketConnection};
use super::types::language_id_for_extension;
use crate::error::ConfigError;

/// Separator between extensions in the flat field format.
pub const EXTENSION_SEPARATOR: char = ';';

/// How the server process is launched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum LaunchSpec {
    /// An executable and its arguments.
    Exe {
        /// Path to the executable.
        path: String,
        /// Arguments.
        #[serde(default)]
        args: Vec<String>,
    },
    /// A JVM server run from a resolved classpath.
    #[serde(rename_all = "camelCase")]
    Artifact {
        /// Classpath handed to `java -cp`.
        classpath: String,
        /// Fully qualified main class.
        main_class: String,
        /// Program arguments.
        #[serde(default)]
        args: Vec<String>,
    },
    /// A complete command line.
    RawCommand {
        /// Program and arguments.
        command: Vec<String>,
    },
}

/// How bytes reach the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TransportKind {
    /// The server's stdin and stdout.
    #[default]
    Stdio,
    /// A local TCP socket the server connects back to.
    Socket {
        /// Port to listen on; 0 picks one.
        #[serde(default)]
        port: u16,
    },
}

/// One language server and the files it handles.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDefinition {
    /// Lower-case extensions without the dot.
    pub extensions: Vec<String>,
    /// Launch command.
    pub launch: LaunchSpec,
    /// Stdio or socket.
    #[serde(default)]
    pub transport: TransportKind,
}

impl ServerDefinition {
    /// A server launched as `path args...`.
    pub fn exe(extensions: &str, path: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            extensions: split_extensions(extensions),
            launch: LaunchSpec::Exe {
                path: path.into(),
                args,
            },
            transport: TransportKind::Stdio,
        }
    }

    /// A server launched with an explicit command line.
    pub fn raw_command(extensions: &str, command: Vec<String>) -> Self {
        Self {
            extensions: split_extensions(extensions),
            launch: LaunchSpec::RawCommand { command },
            transport: TransportKind::Stdio,
        }
    }

    /// Switches to a socket connection on `port`.
    #[must_use]
    pub fn with_socket(mut self, port: u16) -> Self {
        self.transport = TransportKind::Socket { port };
        self
    }

    /// Parses the flat field format used by settings files:
    ///
    /// - `exe, <exts>, <path>, <args...>`
    /// - `artifact, <exts>, <classpath>, <mainClass>, <args...>`
    /// - `rawCommand, <exts>, <command line...>`
    ///
    /// Blank fields are ignored. Extensions are separated by `;`. Command
    /// fields are split on whitespace, honoring quotes.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidDefinition`] for an unknown kind or
    /// missing fields.
    pub fn from_fields<S: AsRef<str>>(fields: &[S]) -> Result<Self, ConfigError> {
        let fields: Vec<&str> = fields
            .iter()
            .map(|f| f.as_ref().trim())
            .filter(|f| !f.is_empty())
            .collect();

        let invalid = |reason: &str| ConfigError::InvalidDefinition(format!("{reason}: {fields:?}"));

        let [kind, extensions, rest @ ..] = fields.as_slice() else {
            return Err(invalid("expected a kind and extensions"));
        };
        let extensions = split_extensions(extensions);
        if extensions.is_empty() {
            return Err(invalid("no extensions"));
        }

        let launch = match *kind {
            "exe" => {
                let [path, args @ ..] = rest else {
                    return Err(invalid("exe needs a path"));
                };
                LaunchSpec::Exe {
                    path: (*path).to_string(),
                    args: split_command_line(args),
                }
            }
            "artifact" => {
                let [classpath, main_class, args @ ..] = rest else {
                    return Err(invalid("artifact needs a classpath and a main class"));
                };
                LaunchSpec::Artifact {
                    classpath: (*classpath).to_string(),
                    main_class: (*main_class).to_string(),
                    args: split_command_line(args),
                }
            }
            "rawCommand" => {
                let command = split_command_line(rest);
                if command.is_empty() {
                    return Err(invalid("rawCommand needs a command"));
                }
                LaunchSpec::RawCommand { command }
            }
            other => return Err(invalid(&format!("unknown definition kind {other}"))),
        };

        Ok(Self {
            extensions,
            launch,
            transport: TransportKind::Stdio,
        })
    }

    /// Inverse of [`ServerDefinition::from_fields`].
    pub fn to_fields(&self) -> Vec<String> {
        let extensions = self.extensions.join(&EXTENSION_SEPARATOR.to_string());
        match &self.launch {
            LaunchSpec::Exe { path, args } => {
                let mut fields = vec!["exe".to_string(), extensions, path.clone()];
                fields.extend(args.iter().cloned());
                fields
            }
            LaunchSpec::Artifact {
                classpath,
                main_class,
                args,
            } => {
                let mut fields = vec![
                    "artifact".to_string(),
                    extensions,
                    classpath.clone(),
                    main_class.clone(),
                ];
                fields.extend(args.iter().cloned());
                fields
            }
            LaunchSpec::RawCommand { command } => {
                let mut fields = vec!["rawCommand".to_string(), extensions];
                fields.extend(command.iter().cloned());
                fields
            }
        }
    }

    /// Name used in logs and status reports: the language of the first
    /// known extension, or the extensions themselves.
    pub fn id(&self) -> String {
        self.extensions
            .iter()
            .map(|ext| language_id_for_extension(ext))
            .find(|lang| *lang != "plaintext")
            .map_or_else(
                || self.extensions.join(&EXTENSION_SEPARATOR.to_string()),
                str::to_string,
            )
    }

    /// Whether files with `extension` belong to this server.
    pub fn handles(&self, extension: &str) -> bool {
        self.extensions
            .iter()
            .any(|ext| ext.eq_ignore_ascii_case(extension))
    }

    /// The command line that launches the server.
    pub fn commands(&self) -> Vec<String> {
        match &self.launch {
            LaunchSpec::Exe { path, args } => {
                std::iter::once(path.clone()).chain(args.iter().cloned()).collect()
            }
            LaunchSpec::Artifact {
                classpath,
                main_class,
                args,
            } => ["java", "-cp", classpath.as_str(), main_class.as_str()]
                .into_iter()
                .map(str::to_string)
                .chain(args.iter().cloned())
                .collect(),
            LaunchSpec::RawCommand { command } => command.clone(),
        }
    }

    /// A fresh provider for a session rooted at `working_dir`.
    pub fn connection_provider(&self, working_dir: &Path) -> Box<dyn ConnectionProvider> {
        match self.transport {
            TransportKind::Stdio => Box::new(ProcessConnection::new(self.commands(), working_dir)),
            TransportKind::Socket { port } => {
                Box::new(SocketConnection::new(self.commands(), working_dir, port))
            }
        }
    }
}

/// Loads definitions from a JSON file holding an array of definitions.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_definitions(path: &Path) -> Result<Vec<ServerDefinition>, ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    serde_json::from_str(&raw).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

fn split_extensions(raw: &str) -> Vec<String> {
    raw.split(EXTENSION_SEPARATOR)
        .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
        .collect()
}

/// Splits command fields into words. Quotes group words and are kept;
/// a backslash keeps the next quote from toggling.
fn split_command_line<S: AsRef<str>>(fields: &[S]) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let (mut single, mut double, mut escaped) = (false, false, false);

    for field in fields {
        for ch in field.as_ref().chars() {
            match ch {
                '\'' if !escaped && !double => {
                    single = !single;
                    current.push(ch);
                }
                '"' if !escaped && !single => {
                    double = !double;
                    current.push(ch);
                }
                '\\' if !escaped => {
                    escaped = true;
                    current.push(ch);
                    continue;
                }
                c if c.is_whitespace() && !single && !double => {
                    if !current.is_empty() {
                        words.push(std::mem::take(&mut current));
                    }
                }
                c => current.push(c),
            }
            escaped = false;
        }
        if !single && !double && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        } else if single || double {
            current.push(' ');
        }
    }
    if !current.trim_end().is_empty() {
        words.push(current.trim_end().to_string());
    }
    words
}
