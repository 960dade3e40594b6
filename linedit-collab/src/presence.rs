//! Session registry: which live connection holds which username.
//!
//! ```text
//! ConnectionId ──► Session { username, Peer (outbox) }
//!                          │
//!                          ▼
//!               active_usernames()  ──►  USER_LIST (presence)
//!               peers()             ──►  broadcast fan-out
//! ```
//!
//! Usernames are unique across live sessions. A connection claims exactly one
//! name at login and keeps it until it is released.

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{Notify, RwLock};
use uuid::Uuid;

use crate::protocol::{Frame, WireFormat};

/// Identity of one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to tell connections apart in logs.
        write!(f, "{}", &self.0.simple().to_string()[..8])
    }
}

/// Result of a non-blocking delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The outbox is full. The frame was not queued.
    Lagged,
    /// The peer's writer is gone.
    Closed,
}

impl Delivery {
    pub fn is_delivered(self) -> bool {
        self == Delivery::Delivered
    }
}

/// A queued frame together with the encoding it must be written in.
///
/// The format is fixed when the frame is queued, so a peer switching
/// encodings only affects frames queued after the switch.
#[derive(Debug, Clone)]
pub struct Outgoing {
    pub frame: Arc<Frame>,
    pub format: WireFormat,
}

impl Deref for Outgoing {
    type Target = Frame;

    fn deref(&self) -> &Frame {
        &self.frame
    }
}

/// Sending half of a connection: frames queued here are written to the
/// socket by that connection's writer task.
#[derive(Debug, Clone)]
pub struct Peer {
    id: ConnectionId,
    outbox: mpsc::Sender<Outgoing>,
    format: Arc<AtomicU8>,
    eviction: Arc<Notify>,
}

impl Peer {
    pub fn new(id: ConnectionId, outbox: mpsc::Sender<Outgoing>) -> Self {
        Self {
            id,
            outbox,
            format: Arc::new(AtomicU8::new(WireFormat::default() as u8)),
            eviction: Arc::new(Notify::new()),
        }
    }

    /// A new peer plus the receiver its writer task drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Outgoing>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(ConnectionId::new(), tx), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Encoding used for frames queued from now on.
    pub fn format(&self) -> WireFormat {
        WireFormat::from_u8(self.format.load(Ordering::Relaxed))
    }

    pub fn set_format(&self, format: WireFormat) {
        self.format.store(format as u8, Ordering::Relaxed);
    }

    /// Queue without waiting. Used by fan-out so one slow peer never stalls
    /// the others.
    pub fn try_deliver(&self, frame: Arc<Frame>) -> Delivery {
        let outgoing = Outgoing {
            frame,
            format: self.format(),
        };
        match self.outbox.try_send(outgoing) {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Full(_)) => Delivery::Lagged,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Queue a reply, waiting for outbox capacity.
    pub async fn send(&self, frame: Frame) -> Result<(), SessionError> {
        self.send_as(frame, self.format()).await
    }

    /// Queue a reply in an explicit encoding without changing the peer's.
    pub async fn send_as(&self, frame: Frame, format: WireFormat) -> Result<(), SessionError> {
        let outgoing = Outgoing {
            frame: Arc::new(frame),
            format,
        };
        self.outbox
            .send(outgoing)
            .await
            .map_err(|_| SessionError::Disconnected)
    }

    pub fn is_closed(&self) -> bool {
        self.outbox.is_closed()
    }

    /// Ask the connection owning this peer to shut down.
    pub fn evict(&self) {
        self.eviction.notify_one();
    }

    /// Resolves once [`evict`](Self::evict) has been called, even if that
    /// happened before this was awaited.
    pub async fn evicted(&self) {
        self.eviction.notified().await;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Username '{0}' is already in use, please choose another")]
    NameTaken(String),
    #[error("Already logged in as '{0}'")]
    AlreadyLoggedIn(String),
    #[error("Username must not be empty")]
    EmptyName,
    #[error("Connection closed")]
    Disconnected,
}

#[derive(Debug)]
struct Session {
    username: String,
    peer: Peer,
}

/// Registry of logged-in connections.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<ConnectionId, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically bind `username` to `peer`.
    ///
    /// On failure the registry is left untouched.
    pub async fn claim(&self, peer: &Peer, username: &str) -> Result<(), SessionError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(SessionError::EmptyName);
        }

        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(&peer.id()) {
            return Err(SessionError::AlreadyLoggedIn(existing.username.clone()));
        }
        if sessions.values().any(|s| s.username == username) {
            return Err(SessionError::NameTaken(username.to_string()));
        }
        sessions.insert(
            peer.id(),
            Session {
                username: username.to_string(),
                peer: peer.clone(),
            },
        );
        Ok(())
    }

    /// Remove the connection's session, freeing its username. Idempotent.
    pub async fn release(&self, id: ConnectionId) -> Option<String> {
        self.sessions
            .write()
            .await
            .remove(&id)
            .map(|session| session.username)
    }

    /// Presence snapshot, sorted for stable output.
    pub async fn active_usernames(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .sessions
            .read()
            .await
            .values()
            .map(|s| s.username.clone())
            .collect();
        names.sort();
        names
    }

    /// Snapshot of every logged-in peer.
    pub async fn peers(&self) -> Vec<Peer> {
        self.sessions
            .read()
            .await
            .values()
            .map(|s| s.peer.clone())
            .collect()
    }

    pub async fn username_of(&self, id: ConnectionId) -> Option<String> {
        self.sessions.read().await.get(&id).map(|s| s.username.clone())
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_claim_and_release() {
        let registry = SessionRegistry::new();
        let (alice, _rx) = Peer::channel(4);

        registry.claim(&alice, "alice").await.unwrap();
        assert_eq!(registry.username_of(alice.id()).await.as_deref(), Some("alice"));
        assert_eq!(registry.session_count().await, 1);

        assert_eq!(registry.release(alice.id()).await.as_deref(), Some("alice"));
        assert_eq!(registry.release(alice.id()).await, None);
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_taken_name_does_not_displace_holder() {
        let registry = SessionRegistry::new();
        let (a, _rx_a) = Peer::channel(4);
        let (b, _rx_b) = Peer::channel(4);

        registry.claim(&a, "alice").await.unwrap();
        assert_eq!(
            registry.claim(&b, "alice").await,
            Err(SessionError::NameTaken("alice".into()))
        );
        assert_eq!(registry.username_of(a.id()).await.as_deref(), Some("alice"));
        assert_eq!(registry.username_of(b.id()).await, None);
        assert_eq!(registry.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_released_name_is_immediately_claimable() {
        let registry = SessionRegistry::new();
        let (a, _rx_a) = Peer::channel(4);
        let (b, _rx_b) = Peer::channel(4);

        registry.claim(&a, "alice").await.unwrap();
        registry.release(a.id()).await;
        registry.claim(&b, "alice").await.unwrap();
        assert_eq!(registry.username_of(b.id()).await.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_one_name_per_connection() {
        let registry = SessionRegistry::new();
        let (a, _rx) = Peer::channel(4);

        registry.claim(&a, "alice").await.unwrap();
        assert_eq!(
            registry.claim(&a, "alias").await,
            Err(SessionError::AlreadyLoggedIn("alice".into()))
        );
        assert_eq!(registry.active_usernames().await, vec!["alice"]);
    }

    #[tokio::test]
    async fn test_empty_name_rejected() {
        let registry = SessionRegistry::new();
        let (a, _rx) = Peer::channel(4);
        assert_eq!(registry.claim(&a, "   ").await, Err(SessionError::EmptyName));
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_active_usernames_sorted() {
        let registry = SessionRegistry::new();
        let mut receivers = Vec::new();
        for name in ["carol", "alice", "bob"] {
            let (peer, rx) = Peer::channel(4);
            registry.claim(&peer, name).await.unwrap();
            receivers.push(rx);
        }
        assert_eq!(registry.active_usernames().await, vec!["alice", "bob", "carol"]);
        assert_eq!(registry.peers().await.len(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_claims_single_winner() {
        let registry = Arc::new(SessionRegistry::new());
        let mut tasks = Vec::new();
        for _ in 0..20 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let (peer, _rx) = Peer::channel(1);
                registry.claim(&peer, "same").await.is_ok()
            }));
        }
        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_peer_delivery_outcomes() {
        let (peer, mut rx) = Peer::channel(1);
        let frame = Arc::new(Frame::error("x"));

        assert_eq!(peer.try_deliver(frame.clone()), Delivery::Delivered);
        assert_eq!(peer.try_deliver(frame.clone()), Delivery::Lagged);
        assert!(!Delivery::Lagged.is_delivered());
        assert_eq!(rx.recv().await.unwrap().body.as_deref(), Some("x"));

        drop(rx);
        assert!(peer.is_closed());
        assert_eq!(peer.try_deliver(frame), Delivery::Closed);
        assert_eq!(peer.send(Frame::error("y")).await, Err(SessionError::Disconnected));
    }

    #[tokio::test]
    async fn test_format_is_fixed_when_queued() {
        let (peer, mut rx) = Peer::channel(4);
        let frame = Arc::new(Frame::error("x"));

        peer.try_deliver(frame.clone());
        peer.set_format(WireFormat::Legacy);
        peer.try_deliver(frame);
        peer.send_as(Frame::error("y"), WireFormat::Binary).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().format, WireFormat::Json);
        assert_eq!(rx.recv().await.unwrap().format, WireFormat::Legacy);
        assert_eq!(rx.recv().await.unwrap().format, WireFormat::Binary);
        assert_eq!(peer.format(), WireFormat::Legacy);
    }

    #[tokio::test]
    async fn test_eviction_signal_is_remembered() {
        let (peer, _rx) = Peer::channel(1);
        let owner = peer.clone();

        peer.evict();
        tokio::time::timeout(std::time::Duration::from_secs(1), owner.evicted())
            .await
            .expect("eviction was not observed");
    }

    #[test]
    fn test_connection_id_display_is_short() {
        let id = ConnectionId::new();
        assert_eq!(id.to_string().len(), 8);
        assert_ne!(id, ConnectionId::new());
    }
}
