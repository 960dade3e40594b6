//! In-memory document store: filename → ordered lines.
//!
//! All operations run under one mutex covering the whole store. Documents are
//! small and edits are line-granular, so coarse locking keeps every snapshot
//! consistent with the write that produced it.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;

use thiserror::Error;
use tokio::sync::Mutex;

/// Document content, one entry per line (0-based internally).
pub type Lines = Vec<String>;

/// Document-level errors surfaced to the requesting client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocumentError {
    #[error("Invalid filename {0:?}: names must be non-empty, without whitespace or path separators, and must not start with '.'")]
    InvalidName(String),
    #[error("File '{0}' already exists")]
    AlreadyExists(String),
    #[error("File '{0}' not found")]
    NotFound(String),
}

/// Check that a filename is safe to use as a key and as a file under the
/// storage directory.
pub fn validate_filename(name: &str) -> Result<(), DocumentError> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && !name.chars().any(|c| c == '/' || c == '\\' || c.is_whitespace() || c.is_control());
    if valid {
        Ok(())
    } else {
        Err(DocumentError::InvalidName(name.to_string()))
    }
}

/// Result of [`DocumentStore::upsert_line`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upserted {
    /// Post-write snapshot taken under the same lock as the write.
    pub lines: Lines,
    /// The document did not exist before this write.
    pub created: bool,
}

/// Shared document store.
#[derive(Debug, Default)]
pub struct DocumentStore {
    documents: Mutex<BTreeMap<String, Lines>>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store, e.g. with documents restored from disk.
    pub fn with_documents(documents: BTreeMap<String, Lines>) -> Self {
        Self {
            documents: Mutex::new(documents),
        }
    }

    /// Merge `documents` into the store, replacing same-named entries.
    pub async fn load(&self, documents: BTreeMap<String, Lines>) -> usize {
        let count = documents.len();
        self.documents.lock().await.extend(documents);
        count
    }

    /// Insert an empty document. Returns `true` only if it was newly created.
    pub async fn create(&self, filename: &str) -> bool {
        let mut documents = self.documents.lock().await;
        if documents.contains_key(filename) {
            return false;
        }
        documents.insert(filename.to_string(), Lines::new());
        true
    }

    /// Copy of the current lines, or `None` if the document does not exist.
    pub async fn snapshot(&self, filename: &str) -> Option<Lines> {
        self.documents.lock().await.get(filename).cloned()
    }

    /// Set line `line` (1-based) to `text`, creating the document and padding
    /// with empty lines as needed.
    pub async fn upsert_line(&self, filename: &str, line: NonZeroUsize, text: &str) -> Upserted {
        let mut documents = self.documents.lock().await;
        let created = !documents.contains_key(filename);
        let lines = documents.entry(filename.to_string()).or_default();
        let index = line.get() - 1;
        if lines.len() <= index {
            lines.resize(index + 1, String::new());
        }
        lines[index] = text.to_string();
        Upserted {
            lines: lines.clone(),
            created,
        }
    }

    /// Copy of every document. The lock is held only for the copy.
    pub async fn all_snapshots(&self) -> BTreeMap<String, Lines> {
        self.documents.lock().await.clone()
    }

    /// Known filenames in sorted order.
    pub async fn list_filenames(&self) -> Vec<String> {
        self.documents.lock().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.documents.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.lock().await.is_empty()
    }
}
