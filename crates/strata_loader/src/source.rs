//! Resource source: the network abstraction the pipeline fetches through
//!
//! Path-to-URI resolution with optional session query parameters. The
//! pipeline treats this as an opaque collaborator; decode workers hold a
//! shared handle and fetch on their own threads.

use std::fs;
use std::path::PathBuf;

use crate::error::WireError;

/// Resolves package-relative paths and fetches their bytes
pub trait ResourceSource: Send + Sync {
    /// Resolve a package-relative path to a fetchable URI
    fn resolve(&self, path: &str) -> String;

    /// Fetch the bytes behind a resolved URI
    fn fetch(&self, uri: &str) -> Result<Vec<u8>, WireError>;
}

/// Filesystem-backed source rooted at a directory
pub struct FileSource {
    root: PathBuf,
    query: Option<String>,
}

impl FileSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            query: None,
        }
    }

    /// Append a session query string to every resolved URI
    pub fn with_query(root: impl Into<PathBuf>, query: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            query: Some(query.into()),
        }
    }
}

impl ResourceSource for FileSource {
    fn resolve(&self, path: &str) -> String {
        let joined = self.root.join(path);
        match &self.query {
            Some(query) => format!("{}?{}", joined.display(), query),
            None => joined.display().to_string(),
        }
    }

    fn fetch(&self, uri: &str) -> Result<Vec<u8>, WireError> {
        // The query suffix carries session parameters that a file
        // backend has no use for.
        let path = uri.split('?').next().unwrap_or(uri);
        log::debug!("fetching {path}");
        fs::read(path).map_err(|e| WireError::fetch(format!("{path}: {e}")))
    }
}

/// In-memory source for embedded packages and tests
#[derive(Default)]
pub struct MemorySource {
    entries: std::collections::HashMap<String, Vec<u8>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, bytes: Vec<u8>) {
        self.entries.insert(path.into(), bytes);
    }
}

impl ResourceSource for MemorySource {
    fn resolve(&self, path: &str) -> String {
        path.to_string()
    }

    fn fetch(&self, uri: &str) -> Result<Vec<u8>, WireError> {
        self.entries
            .get(uri)
            .cloned()
            .ok_or_else(|| WireError::fetch(format!("{uri}: not found")))
    }
}
