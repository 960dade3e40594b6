//! Periodic best-effort persistence of all documents.
//!
//! ```text
//! every `interval`:
//!   SnapshotSource::all_snapshots()  ──►  <dir>/.<name>.tmp  ──rename──►  <dir>/<name>
//! ```
//!
//! A failed write is logged and skipped; the loop never stops. Nothing here
//! is reported to clients.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::documents::{validate_filename, DocumentStore, Lines};

/// Read access to the current set of documents.
pub trait SnapshotSource: Send + Sync {
    fn all_snapshots(&self) -> impl Future<Output = BTreeMap<String, Lines>> + Send;
}

impl SnapshotSource for DocumentStore {
    fn all_snapshots(&self) -> impl Future<Output = BTreeMap<String, Lines>> + Send {
        DocumentStore::all_snapshots(self)
    }
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Refusing to persist unsafe filename {0:?}")]
    UnsafeName(String),
}

impl PersistenceError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        PersistenceError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Outcome of one save cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveReport {
    pub saved: usize,
    pub failed: usize,
}

/// Writes every document from `source` into `dir` on a fixed interval.
pub struct AutoSaver<S> {
    source: Arc<S>,
    dir: PathBuf,
    interval: Duration,
}

impl<S: SnapshotSource + 'static> AutoSaver<S> {
    pub fn new(source: Arc<S>, dir: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            source,
            dir: dir.into(),
            interval,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run one save cycle.
    ///
    /// Fails only when the storage directory cannot be created; per-document
    /// failures are logged and counted in the report.
    pub async fn save_all(&self) -> Result<SaveReport, PersistenceError> {
        let documents = self.source.all_snapshots().await;
        if documents.is_empty() {
            return Ok(SaveReport::default());
        }

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| PersistenceError::io(&self.dir, e))?;

        let mut report = SaveReport::default();
        for (filename, lines) in &documents {
            match save_document(&self.dir, filename, lines).await {
                Ok(_) => report.saved += 1,
                Err(e) => {
                    log::error!("Failed to save {filename}: {e}");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Start the save loop. The first cycle runs one full interval from now.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            log::info!(
                "Autosave every {:?} into {}",
                self.interval,
                self.dir.display()
            );

            loop {
                ticker.tick().await;
                match self.save_all().await {
                    Ok(SaveReport { saved: 0, failed: 0 }) => {
                        log::debug!("Autosave: nothing to write");
                    }
                    Ok(SaveReport { saved, failed: 0 }) => {
                        log::info!("Autosave: {saved} document(s) written");
                    }
                    Ok(SaveReport { saved, failed }) => {
                        log::warn!("Autosave: {saved} written, {failed} failed");
                    }
                    Err(e) => log::error!("Autosave cycle failed: {e}"),
                }
            }
        })
    }
}

/// Write one document as newline-joined text to `<dir>/<filename>`.
pub async fn save_document(
    dir: &Path,
    filename: &str,
    lines: &[String],
) -> Result<PathBuf, PersistenceError> {
    validate_filename(filename).map_err(|_| PersistenceError::UnsafeName(filename.to_string()))?;

    let path = dir.join(filename);
    let tmp = dir.join(format!(".{filename}.tmp"));
    tokio::fs::write(&tmp, lines.join("\n"))
        .await
        .map_err(|e| PersistenceError::io(&tmp, e))?;
    tokio::fs::rename(&tmp, &path)
        .await
        .map_err(|e| PersistenceError::io(&path, e))?;
    Ok(path)
}

/// Load documents previously written by [`AutoSaver`].
///
/// A missing directory yields no documents. Hidden files, non-UTF-8 content
/// and names that would not be accepted from a client are skipped. An empty
/// file restores as an empty document (see [`split_lines`](crate::protocol::split_lines)).
pub async fn restore_documents(dir: &Path) -> Result<BTreeMap<String, Lines>, PersistenceError> {
    let mut documents = BTreeMap::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(documents),
        Err(e) => return Err(PersistenceError::io(dir, e)),
    };

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| PersistenceError::io(dir, e))?
    {
        let path = entry.path();
        let Some(filename) = entry.file_name().to_str().map(str::to_string) else {
            log::warn!("Skipping non-UTF-8 filename {}", path.display());
            continue;
        };
        if validate_filename(&filename).is_err() {
            log::debug!("Skipping {}", path.display());
            continue;
        }
        match entry.file_type().await {
            Ok(kind) if kind.is_file() => {}
            _ => continue,
        }
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                documents.insert(filename, crate::protocol::split_lines(&content));
            }
            Err(e) => log::warn!("Skipping {}: {e}", path.display()),
        }
    }

    Ok(documents)
}
