use kadabra_lsp::lsp::Url;
use kadabra_lsp::lsp::types::path_to_url;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Files of a fixture and an optional cursor.
#[derive(Debug)]
pub struct Fixture {
    /// files in fixture
    pub files: Vec<(PathBuf, String)>,
    /// File, zero-based line and character of the `$0` marker
    pub cursor: Option<(PathBuf, u32, u32)>,
}

/// Splits a fixture into files.
///
/// Each file starts with a `//- path` line. A `$0` marks the cursor and is
/// removed from the text.
/// ## Panics
/// if a line comes before the first `//-` header
pub fn parse_fixture(input: &str) -> Fixture {
    let mut files = Vec::new();
    let mut current_path: Option<PathBuf> = None;
    let mut current_content = String::new();
    let mut cursor = None;

    for line in input.lines() {
        if let Some(path) = line.strip_prefix("//- ") {
            if let Some(p) = current_path.take() {
                files.push((p, std::mem::take(&mut current_content)));
            }
            current_path = Some(PathBuf::from(path.trim().trim_start_matches('/')));
        } else if current_path.is_none() && line.trim().is_empty() {
            continue;
        } else {
            let path = current_path.clone().expect("fixture text before any //- header");
            let mut l = line.to_string();
            if let Some(idx) = l.find("$0") {
                let line_no = u32::try_from(current_content.lines().count())
                    .expect("line count out of range");
                let col = u32::try_from(idx).expect("line index out of range");
                cursor = Some((path, line_no, col));
                l = l.replace("$0", "");
            }
            current_content.push_str(&l);
            current_content.push('\n');
        }
    }

    if let Some(p) = current_path {
        files.push((p, current_content));
    }

    Fixture { files, cursor }
}

/// Fixture files written to a temporary project root.
pub struct TestWorkspace {
    /// Temporary folder for the workspace
    pub root: TempDir,
    /// fixture for the workspace
    pub fixture: Fixture,
    /// Canonicalized root path (resolves symlinks like /var -> /private/var on macOS)
    canonical_root: PathBuf,
}

impl TestWorkspace {
    /// Writes `fixture` into a fresh temporary directory.
    /// ## Panics
    /// if the files cannot be written
    pub fn new(fixture: &str) -> Self {
        let root = TempDir::new().expect("failed to create temp dir");
        let fixture = parse_fixture(fixture);

        for (path, content) in &fixture.files {
            let full = root.path().join(path);
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent).expect("mkdir failed");
            }
            std::fs::write(&full, content).expect("write failed");
        }

        let canonical_root = root
            .path()
            .canonicalize()
            .expect("failed to canonicalize temp dir");

        Self {
            root,
            fixture,
            canonical_root,
        }
    }

    /// Canonical project root.
    pub fn path(&self) -> &Path {
        &self.canonical_root
    }

    /// Absolute path of a fixture file.
    pub fn file(&self, relative: &str) -> PathBuf {
        self.canonical_root.join(relative)
    }

    /// `file://` URI of a fixture file.
    pub fn uri(&self, relative: &str) -> Url {
        path_to_url(&self.file(relative)).expect("fixture path is absolute")
    }

    /// Text of a fixture file as written.
    /// ## Panics
    /// if the file is not part of the fixture
    pub fn text(&self, relative: &str) -> &str {
        self.fixture
            .files
            .iter()
            .find(|(path, _)| path == Path::new(relative))
            .map(|(_, content)| content.as_str())
            .unwrap_or_else(|| panic!("{relative} is not in the fixture"))
    }
}
