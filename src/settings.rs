//! Server settings: flattened configuration with named scopes.
//!
//! A settings document is a JSON object. Nested objects are flattened into
//! dotted keys, arrays and scalars are leaf values, and a top-level key of
//! the form `<name>` opens the scope `name`. Everything else lives in the
//! `global` scope:
//!
//! ```json
//! {
//!   "rust-analyzer": { "cargo": { "features": ["full"] } },
//!   "<tests>": { "rust-analyzer.checkOnSave": false }
//! }
//! ```
//!
//! flattens to `global: { "rust-analyzer.cargo.features": ["full"] }` and
//! `tests: { "rust-analyzer.checkOnSave": false }`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use lsp_types::Url;
use serde_json::{Map, Value};

use crate::error::ConfigError;

/// Scope every key belongs to unless a `<scope>` key says otherwise.
pub const GLOBAL_SCOPE: &str = "global";

/// Section whose keys seed `initializationOptions`.
pub const INITIALIZATION_OPTIONS_SECTION: &str = "initializationOptions";

/// Flat key to value map for one scope.
pub type Attributes = BTreeMap<String, Value>;

/// Settings lookups a session needs from its embedder.
pub trait ConfigurationSource: Send + Sync {
    /// Options sent in `initialize` for a workspace rooted at `root`.
    fn initialization_options(&self, root: &Url) -> Option<Value>;

    /// Keys under `section` in `scope`, with the section prefix stripped.
    /// An empty section selects every key of the scope.
    fn attributes(&self, section: &str, scope: &str) -> Attributes;

    /// Scope that applies to a document.
    fn scope_for_uri(&self, _uri: &Url) -> String {
        GLOBAL_SCOPE.to_string()
    }
}

/// Source with no settings at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyConfiguration;

impl ConfigurationSource for EmptyConfiguration {
    fn initialization_options(&self, _root: &Url) -> Option<Value> {
        None
    }

    fn attributes(&self, _section: &str, _scope: &str) -> Attributes {
        Attributes::new()
    }
}

/// Settings parsed from a JSON document, partitioned by scope.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerConfiguration {
    scopes: BTreeMap<String, Attributes>,
}

impl ServerConfiguration {
    /// Flattens a JSON document. An empty document yields empty settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not a JSON object or a `<scope>`
    /// key does not hold an object.
    pub fn parse(document: &str) -> Result<Self, ConfigError> {
        if document.trim().is_empty() {
            return Ok(Self::default());
        }

        let parse_error = |message: String| ConfigError::ParseError {
            path: "<settings>".to_string(),
            message,
        };

        let root: Value = serde_json::from_str(document).map_err(|e| parse_error(e.to_string()))?;
        let Value::Object(root) = root else {
            return Err(parse_error("settings must be a JSON object".to_string()));
        };

        let mut config = Self::default();
        config.scopes.entry(GLOBAL_SCOPE.to_string()).or_default();

        for (key, value) in root {
            if let Some(scope) = scope_name(&key) {
                let Value::Object(inner) = value else {
                    return Err(parse_error(format!("scope {key} must hold an object")));
                };
                let attrs = config.scopes.entry(scope.to_string()).or_default();
                flatten_object("", inner, attrs);
            } else {
                let attrs = config.scopes.entry(GLOBAL_SCOPE.to_string()).or_default();
                flatten_value(key, value, attrs);
            }
        }

        Ok(config)
    }

    /// Reads and flattens a settings file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content).map_err(|err| match err {
            ConfigError::ParseError { message, .. } => ConfigError::ParseError {
                path: path.display().to_string(),
                message,
            },
            other => other,
        })
    }

    /// Names of every scope present.
    pub fn scopes(&self) -> impl Iterator<Item = &str> {
        self.scopes.keys().map(String::as_str)
    }
}

impl ConfigurationSource for ServerConfiguration {
    fn initialization_options(&self, _root: &Url) -> Option<Value> {
        let attrs = self.attributes(INITIALIZATION_OPTIONS_SECTION, GLOBAL_SCOPE);
        if attrs.is_empty() {
            None
        } else {
            Some(unflatten(&attrs))
        }
    }

    fn attributes(&self, section: &str, scope: &str) -> Attributes {
        let Some(attrs) = self.scopes.get(scope) else {
            return Attributes::new();
        };

        attrs
            .iter()
            .filter_map(|(key, value)| {
                let stripped = if section.is_empty() {
                    key.as_str()
                } else if key == section {
                    ""
                } else {
                    key.strip_prefix(section)?.strip_prefix('.')?
                };
                Some((stripped.to_string(), value.clone()))
            })
            .collect()
    }
}

fn scope_name(key: &str) -> Option<&str> {
    key.strip_prefix('<')?.strip_suffix('>')
}

fn flatten_object(prefix: &str, object: Map<String, Value>, out: &mut Attributes) {
    for (key, value) in object {
        let key = if prefix.is_empty() {
            key
        } else {
            format!("{prefix}.{key}")
        };
        flatten_value(key, value, out);
    }
}

fn flatten_value(key: String, value: Value, out: &mut Attributes) {
    match value {
        Value::Object(object) => flatten_object(&key, object, out),
        leaf => {
            out.insert(key, leaf);
        }
    }
}

/// Rebuilds a nested JSON object from dotted keys. An empty key maps to the
/// value itself.
pub fn unflatten(attrs: &Attributes) -> Value {
    if let Some(value) = attrs.get("")
        && attrs.len() == 1
    {
        return value.clone();
    }

    let mut root = Map::new();
    for (key, value) in attrs {
        if key.is_empty() {
            continue;
        }
        let mut parts = key.split('.').peekable();
        let mut node = &mut root;
        while let Some(part) = parts.next() {
            if parts.peek().is_none() {
                node.insert(part.to_string(), value.clone());
                break;
            }
            let child = node
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !child.is_object() {
                *child = Value::Object(Map::new());
            }
            let Value::Object(child) = child else {
                break;
            };
            node = child;
        }
    }
    Value::Object(root)
}
