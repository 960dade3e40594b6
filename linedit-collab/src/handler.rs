//! Per-connection protocol state machine.
//!
//! ```text
//!                LOGIN ok
//! Unauthenticated ───────► Active { username }
//!        │                      │
//!        │ close / error        │ QUIT / close / error
//!        ▼                      ▼
//!      Closed ◄─────────────────┘
//! ```
//!
//! The handler never touches the socket. Replies are queued on the
//! connection's own outbox, the same one broadcasts use, so the writer task
//! sees replies and broadcasts in the order they were produced.

use std::sync::Arc;

use thiserror::Error;

use crate::hub::Hub;
use crate::presence::{Peer, SessionError};
use crate::protocol::{Command, Frame, ProtocolError, Request, WireFormat};
use crate::storage::{validate_filename, DocumentError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerState {
    Unauthenticated,
    Active { username: String },
    Closed,
}

/// What the connection loop should do after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Request failures. Each one becomes an `ERROR` frame for the caller.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error("Please log in first")]
    NotLoggedIn,
}

pub struct Handler {
    hub: Arc<Hub>,
    peer: Peer,
    state: HandlerState,
}

impl Handler {
    pub fn new(hub: Arc<Hub>, peer: Peer) -> Self {
        Self {
            hub,
            peer,
            state: HandlerState::Unauthenticated,
        }
    }

    pub fn state(&self) -> &HandlerState {
        &self.state
    }

    pub fn username(&self) -> Option<&str> {
        match &self.state {
            HandlerState::Active { username } => Some(username),
            _ => None,
        }
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Process one decoded frame.
    pub async fn handle(&mut self, frame: Frame) -> Flow {
        if self.state == HandlerState::Closed {
            return Flow::Close;
        }
        if frame.command == Command::Error {
            log::debug!(
                "Ignoring ERROR from {}: {}",
                self.peer.id(),
                frame.body.as_deref().unwrap_or_default()
            );
            return Flow::Continue;
        }

        let outcome = match Request::try_from(frame) {
            Ok(request) => self.dispatch(request).await,
            Err(e) => Err(e.into()),
        };
        match outcome {
            Ok(flow) => flow,
            // The writer is gone; nothing left to reply to.
            Err(HandlerError::Session(SessionError::Disconnected)) => Flow::Close,
            Err(e) => self.reject(e).await,
        }
    }

    /// Send `ERROR` to this connection only.
    pub async fn reject(&mut self, error: impl Into<HandlerError>) -> Flow {
        let format = self.peer.format();
        self.reject_as(error, format).await
    }

    /// Like [`reject`](Self::reject), encoding the reply in `format` without
    /// changing the encoding the connection receives everything else in.
    pub async fn reject_as(&mut self, error: impl Into<HandlerError>, format: WireFormat) -> Flow {
        let error = error.into();
        log::warn!("Rejected request from {}: {error}", self.peer.id());
        match self.peer.send_as(Frame::error(error.to_string()), format).await {
            Ok(()) => Flow::Continue,
            Err(_) => Flow::Close,
        }
    }

    async fn dispatch(&mut self, request: Request) -> Result<Flow, HandlerError> {
        let username = match &self.state {
            HandlerState::Active { username } => username.clone(),
            _ => {
                return match request {
                    Request::Login { username } => {
                        self.login(&username).await.map(|()| Flow::Continue)
                    }
                    _ => Err(HandlerError::NotLoggedIn),
                };
            }
        };

        match request {
            Request::Login { .. } => {
                return Err(SessionError::AlreadyLoggedIn(username).into());
            }
            Request::FileCreate { filename } => {
                validate_filename(&filename)?;
                if !self.hub.documents().create(&filename).await {
                    return Err(DocumentError::AlreadyExists(filename).into());
                }
                log::info!("{username} created {filename}");
                self.hub.publish_file_list().await;
            }
            Request::FileJoin { filename } => {
                if self.hub.join(&filename, &self.peer).await?.is_none() {
                    return Err(DocumentError::NotFound(filename).into());
                }
                log::info!("{username} joined {filename}");
            }
            Request::FileUpdate {
                filename,
                line,
                text,
            } => {
                validate_filename(&filename)?;
                let (upserted, report) = self
                    .hub
                    .apply_update(self.peer.id(), &filename, line, &text)
                    .await;
                log::debug!(
                    "{username} set {filename}:{line} ({} lines, {} peers)",
                    upserted.lines.len(),
                    report.delivered
                );
                if upserted.created {
                    self.hub.publish_file_list().await;
                }
            }
            Request::FileList => {
                self.hub.send_file_list(&self.peer, true).await?;
            }
            Request::Quit => {
                log::info!("{username} quit");
                return Ok(Flow::Close);
            }
        }
        Ok(Flow::Continue)
    }

    async fn login(&mut self, username: &str) -> Result<(), HandlerError> {
        self.hub.sessions().claim(&self.peer, username).await?;
        let username = username.trim().to_string();
        log::info!("{username} logged in on {}", self.peer.id());
        self.state = HandlerState::Active { username };

        self.hub.publish_presence().await;
        self.hub.send_file_list(&self.peer, false).await?;
        Ok(())
    }

    /// Release the session and announce the new presence. Runs once.
    pub async fn close(&mut self) {
        let previous = std::mem::replace(&mut self.state, HandlerState::Closed);
        let HandlerState::Active { username } = previous else {
            return;
        };
        // Fan-out may already have pruned us and announced it.
        if self.hub.sessions().release(self.peer.id()).await.is_some() {
            log::info!("{username} disconnected");
            self.hub.publish_presence().await;
        }
    }
}
