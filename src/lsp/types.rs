//! Path and URI helpers shared by sessions and the CLI.

use std::path::Path;

use lsp_types::{Url, WorkspaceFolder};

use super::LspResult;
use crate::error::LspError;

/// Converts a path to an absolute, canonical `file://` URI.
///
/// # Errors
///
/// Returns [`LspError::DocumentNotFound`] if the path does not exist.
pub fn path_to_url(path: &Path) -> LspResult<Url> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| {
                LspError::DocumentNotFound(format!("failed to get current directory: {e}"))
            })?
            .join(path)
    };

    let canonical = absolute.canonicalize().map_err(|e| {
        LspError::DocumentNotFound(format!(
            "failed to canonicalize path '{}': {}",
            path.display(),
            e
        ))
    })?;

    Url::from_file_path(&canonical)
        .map_err(|()| LspError::DocumentNotFound(format!("invalid path: {}", canonical.display())))
}

/// Lower-cased file extension of a URI's last path segment.
pub fn url_extension(uri: &Url) -> Option<String> {
    let name = uri.path_segments()?.next_back()?;
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Language id for `didOpen`, derived from the file extension.
pub fn language_id_for_extension(ext: &str) -> &'static str {
    match ext {
        "rs" => "rust",
        "py" | "pyi" => "python",
        "js" | "mjs" | "cjs" => "javascript",
        "jsx" => "javascriptreact",
        "ts" | "mts" | "cts" => "typescript",
        "tsx" => "typescriptreact",
        "go" => "go",
        "c" | "h" => "c",
        "cpp" | "cc" | "cxx" | "hpp" | "hh" => "cpp",
        "java" => "java",
        "kt" | "kts" => "kotlin",
        "scala" | "sc" => "scala",
        "rb" => "ruby",
        "hs" => "haskell",
        "json" => "json",
        "toml" => "toml",
        "yaml" | "yml" => "yaml",
        "md" => "markdown",
        "sh" | "bash" => "shellscript",
        _ => "plaintext",
    }
}

/// Workspace folder for a root URI, named after its last path segment.
pub fn workspace_folder(root: &Url) -> WorkspaceFolder {
    let name = root
        .path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).next_back())
        .unwrap_or("workspace")
        .to_string();
    WorkspaceFolder {
        uri: root.clone(),
        name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_to_url() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("main.rs");
        std::fs::write(&file, "fn main() {}").unwrap();

        let url = path_to_url(&file).unwrap();
        assert_eq!(url.scheme(), "file");
        assert!(url.path().ends_with("/main.rs"));
    }

    #[test]
    fn test_path_to_url_missing() {
        let err = path_to_url(Path::new("/definitely/not/here.rs")).unwrap_err();
        assert!(matches!(err, LspError::DocumentNotFound(_)));
    }

    #[test]
    fn test_url_extension() {
        let url = Url::parse("file:///ws/src/Lib.RS").unwrap();
        assert_eq!(url_extension(&url).as_deref(), Some("rs"));
        assert_eq!(url_extension(&Url::parse("file:///ws/Makefile").unwrap()), None);
        assert_eq!(url_extension(&Url::parse("file:///ws/.bashrc").unwrap()), None);
    }

    #[test]
    fn test_language_id() {
        assert_eq!(language_id_for_extension("rs"), "rust");
        assert_eq!(language_id_for_extension("cc"), "cpp");
        assert_eq!(language_id_for_extension("xyz"), "plaintext");
    }

    #[test]
    fn test_workspace_folder() {
        let root = Url::parse("file:///home/dev/project/").unwrap();
        assert_eq!(workspace_folder(&root).name, "project");
    }
}
