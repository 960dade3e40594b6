//! Shared server state handed to every connection handler.
//!
//! The document store and the session registry each have their own lock and
//! are never held together. Two ordering gates sit above them:
//!
//! - `update_order`: line updates and join snapshots. For any document,
//!   `FILE_SYNC` frames are queued in the same order as the writes that
//!   produced them.
//! - `file_list_order`: every `FILE_LIST` is read and queued under it, so the
//!   last one a peer receives is never older than an earlier one.
//!
//! Replies queued under a gate never wait for outbox space. A peer whose
//! outbox is full at that point is evicted instead.

use std::num::NonZeroUsize;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::broadcast::{Broadcaster, FanoutReport};
use crate::presence::{ConnectionId, Delivery, Peer, SessionError, SessionRegistry};
use crate::protocol::Frame;
use crate::storage::{DocumentStore, Lines, Upserted};

pub struct Hub {
    documents: Arc<DocumentStore>,
    sessions: Arc<SessionRegistry>,
    broadcaster: Broadcaster,
    update_order: Mutex<()>,
    file_list_order: Mutex<()>,
}

impl Hub {
    pub fn new(documents: Arc<DocumentStore>, sessions: Arc<SessionRegistry>) -> Self {
        Self {
            broadcaster: Broadcaster::new(sessions.clone()),
            documents,
            sessions,
            update_order: Mutex::new(()),
            file_list_order: Mutex::new(()),
        }
    }

    /// Empty in-memory stores.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(DocumentStore::new()), Arc::new(SessionRegistry::new()))
    }

    pub fn documents(&self) -> &Arc<DocumentStore> {
        &self.documents
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    /// `USER_LIST` to every logged-in connection.
    pub async fn publish_presence(&self) -> FanoutReport {
        self.broadcaster.broadcast_presence().await
    }

    /// `FILE_LIST` to every logged-in connection.
    pub async fn publish_file_list(&self) -> FanoutReport {
        let _order = self.file_list_order.lock().await;
        let filenames = self.documents.list_filenames().await;
        self.broadcaster.broadcast(Frame::file_list(filenames), None).await
    }

    /// `FILE_LIST` to `peer` only. With `when_empty` false nothing is sent
    /// while there are no documents.
    pub async fn send_file_list(&self, peer: &Peer, when_empty: bool) -> Result<(), SessionError> {
        let _order = self.file_list_order.lock().await;
        let filenames = self.documents.list_filenames().await;
        if filenames.is_empty() && !when_empty {
            return Ok(());
        }
        reply(peer, Frame::file_list(filenames))
    }

    /// Queue the current content of `filename` for `peer`.
    ///
    /// Returns `Ok(None)` if the document does not exist.
    pub async fn join(&self, filename: &str, peer: &Peer) -> Result<Option<Lines>, SessionError> {
        let _order = self.update_order.lock().await;
        let Some(lines) = self.documents.snapshot(filename).await else {
            return Ok(None);
        };
        reply(peer, Frame::file_sync(filename, &lines))?;
        Ok(Some(lines))
    }

    /// Upsert one line and push the resulting content to everyone but `origin`.
    pub async fn apply_update(
        &self,
        origin: ConnectionId,
        filename: &str,
        line: NonZeroUsize,
        text: &str,
    ) -> (Upserted, FanoutReport) {
        let _order = self.update_order.lock().await;
        let upserted = self.documents.upsert_line(filename, line, text).await;
        let report = self
            .broadcaster
            .broadcast(Frame::file_sync(filename, &upserted.lines), Some(origin))
            .await;
        (upserted, report)
    }
}

fn reply(peer: &Peer, frame: Frame) -> Result<(), SessionError> {
    match peer.try_deliver(Arc::new(frame)) {
        Delivery::Delivered => Ok(()),
        Delivery::Lagged => {
            log::warn!("Peer {} outbox full on reply, evicting", peer.id());
            peer.evict();
            Err(SessionError::Disconnected)
        }
        Delivery::Closed => Err(SessionError::Disconnected),
    }
}
