//! Document storage.
//!
//! ```text
//! ┌──────────────┐  upsert / snapshot   ┌───────────────┐
//! │   Handlers   │ ───────────────────► │ DocumentStore │
//! └──────────────┘                      │  (in-memory)  │
//!                                       └───────┬───────┘
//!                                               │ all_snapshots() every N s
//!                                               ▼
//!                                       ┌───────────────┐
//!                                       │   AutoSaver   │ ──► <storage_dir>/<filename>
//!                                       └───────────────┘
//! ```
//!
//! The in-memory store is authoritative; files on disk are a best-effort copy.

pub mod autosave;
pub mod documents;

pub use autosave::{
    restore_documents, save_document, AutoSaver, PersistenceError, SaveReport, SnapshotSource,
};
pub use documents::{validate_filename, DocumentError, DocumentStore, Lines, Upserted};
