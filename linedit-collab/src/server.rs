//! WebSocket server for the line editor.
//!
//! Architecture:
//! ```text
//! Client A ──┐                    ┌── DocumentStore ──► AutoSaver ──► saved_files/
//!             ├── Handler (each) ── Hub
//! Client B ──┘        │           └── SessionRegistry ──► Broadcaster
//!                     │                                       │
//!                     └──────── outbox (mpsc) ◄───────────────┘
//!                                   │
//!                              writer task ──► socket
//! ```
//!
//! Each connection gets a reader loop that decodes frames and drives its
//! [`Handler`], and a writer task that drains the connection's outbox. Frames
//! are encoded in the format the peer had last used successfully when the
//! frame was queued. A connection evicted by fan-out is closed by its reader
//! loop.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::broadcast::BroadcastStats;
use crate::handler::{Flow, Handler};
use crate::hub::Hub;
use crate::presence::Peer;
use crate::protocol::{Encoded, Frame, WireFormat};
use crate::storage::{restore_documents, AutoSaver, PersistenceError};

/// How long a closing connection may spend flushing its outbox.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames queued per connection; a peer that falls this far behind is
    /// disconnected
    pub outbox_capacity: usize,
    /// Autosave period
    pub save_interval: Duration,
    /// Autosave directory (None = in-memory only)
    pub storage_dir: Option<PathBuf>,
    /// Load documents from `storage_dir` before accepting connections
    pub restore_on_start: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:5000".to_string(),
            outbox_capacity: 256,
            save_interval: Duration::from_secs(10),
            storage_dir: Some(PathBuf::from("saved_files")),
            restore_on_start: false,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `LINEDIT_*` environment variables.
    ///
    /// | Variable                     | Field              |
    /// |------------------------------|--------------------|
    /// | `LINEDIT_BIND_ADDR`          | `bind_addr`        |
    /// | `LINEDIT_STORAGE_DIR`        | `storage_dir` (empty disables) |
    /// | `LINEDIT_SAVE_INTERVAL_SECS` | `save_interval`    |
    /// | `LINEDIT_OUTBOX_CAPACITY`    | `outbox_capacity`  |
    /// | `LINEDIT_RESTORE`            | `restore_on_start` |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    /// Invalid values are logged and the default is kept.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("LINEDIT_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(dir) = lookup("LINEDIT_STORAGE_DIR") {
            config.storage_dir = (!dir.trim().is_empty()).then(|| PathBuf::from(dir));
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "LINEDIT_SAVE_INTERVAL_SECS") {
            if secs == 0 {
                log::warn!("Ignoring LINEDIT_SAVE_INTERVAL_SECS=0");
            } else {
                config.save_interval = Duration::from_secs(secs);
            }
        }
        if let Some(capacity) = parse_var::<usize>(&lookup, "LINEDIT_OUTBOX_CAPACITY") {
            config.outbox_capacity = capacity.max(1);
        }
        if let Some(raw) = lookup("LINEDIT_RESTORE") {
            match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => config.restore_on_start = true,
                "0" | "false" | "no" | "off" => config.restore_on_start = false,
                other => log::warn!("Ignoring invalid LINEDIT_RESTORE={other:?}"),
            }
        }

        config
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring invalid {key}={raw:?}");
            None
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub malformed_frames: u64,
    pub active_sessions: usize,
    pub documents: usize,
    pub broadcast: BroadcastStats,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// The collaboration server.
pub struct CollabServer {
    config: ServerConfig,
    hub: Arc<Hub>,
    stats: Arc<RwLock<ServerStats>>,
}

impl CollabServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            hub: Arc::new(Hub::in_memory()),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Load previously saved documents from the storage directory.
    pub async fn restore(&self) -> Result<usize, ServerError> {
        let Some(dir) = &self.config.storage_dir else {
            return Ok(0);
        };
        let documents = restore_documents(dir).await?;
        let restored = self.hub.documents().load(documents).await;
        log::info!("Restored {restored} document(s) from {}", dir.display());
        Ok(restored)
    }

    /// Bind the configured address.
    pub async fn listen(&self) -> Result<TcpListener, ServerError> {
        TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: self.config.bind_addr.clone(),
                source,
            })
    }

    /// Start the autosave loop, if a storage directory is configured.
    pub fn spawn_autosave(&self) -> Option<JoinHandle<()>> {
        let dir = self.config.storage_dir.clone()?;
        let saver = AutoSaver::new(self.hub.documents().clone(), dir, self.config.save_interval);
        Some(saver.spawn())
    }

    /// Restore (if enabled), bind, start autosave and serve until the
    /// listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        if self.config.restore_on_start {
            self.restore().await?;
        }
        let listener = self.listen().await?;
        let autosave = self.spawn_autosave();

        let result = self.serve(listener).await;
        if let Some(handle) = autosave {
            handle.abort();
        }
        result
    }

    /// Accept connections on `listener` forever.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        log::info!("Line editor server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    // Usually fd exhaustion; back off instead of spinning.
                    log::error!("Accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            let stats = self.stats.clone();
            let outbox_capacity = self.config.outbox_capacity;

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, hub, stats, outbox_capacity).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: Arc<Hub>,
        stats: Arc<RwLock<ServerStats>>,
        outbox_capacity: usize,
    ) -> Result<(), ServerError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (peer, mut outbox) = Peer::channel(outbox_capacity);
        let id = peer.id();
        log::info!("WebSocket connection {id} established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Writer task: outbox -> socket. Exiting drops the receiver, which
        // is how fan-out learns this peer is gone.
        let mut writer = tokio::spawn(async move {
            while let Some(outgoing) = outbox.recv().await {
                let message = match outgoing.frame.encode(outgoing.format) {
                    Ok(Encoded::Text(text)) => Message::text(text),
                    Ok(Encoded::Binary(bytes)) => Message::binary(bytes),
                    Err(e) => {
                        log::error!("Failed to encode {} for {id}: {e}", outgoing.command);
                        continue;
                    }
                };
                if let Err(e) = ws_sender.send(message).await {
                    log::debug!("Write to {id} failed: {e}");
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });
        let mut writer_done = false;
        let mut evicted = false;

        let watch = peer.clone();
        let mut handler = Handler::new(hub, peer);

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    let (decoded, wire) = match msg {
                        Some(Ok(Message::Text(text))) => match Frame::decode_text(text.as_str()) {
                            Ok((frame, wire)) => (Ok(frame), wire),
                            Err(e) => (Err(e), WireFormat::sniff_text(text.as_str())),
                        },
                        Some(Ok(Message::Binary(data))) => {
                            (Frame::decode_binary(&data), WireFormat::Binary)
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }
                        // Pings are answered by tungstenite itself.
                        Some(Ok(_)) => continue,
                    };

                    let flow = match decoded {
                        Ok(frame) => {
                            stats.write().await.total_frames += 1;
                            log::debug!("{id} -> {} {:?}", frame.command, frame.args);
                            handler.peer().set_format(wire);
                            handler.handle(frame).await
                        }
                        Err(e) => {
                            {
                                let mut s = stats.write().await;
                                s.total_frames += 1;
                                s.malformed_frames += 1;
                            }
                            handler.reject_as(e, wire).await
                        }
                    };
                    if flow == Flow::Close {
                        break;
                    }
                }

                _ = &mut writer, if !writer_done => {
                    writer_done = true;
                    log::info!("Connection to {addr} lost");
                    break;
                }

                _ = watch.evicted() => {
                    evicted = true;
                    log::warn!("Disconnecting {addr}: outbox full");
                    break;
                }
            }
        }

        // Cleanup: release the session and let the writer flush what is left.
        handler.close().await;
        drop(handler);
        drop(watch);
        if evicted {
            writer.abort();
        } else if !writer_done
            && tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err()
        {
            log::warn!("Writer for {id} did not drain in time");
            writer.abort();
        }

        stats.write().await.active_connections -= 1;
        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_sessions = self.hub.sessions().session_count().await;
        stats.documents = self.hub.documents().len().await;
        stats.broadcast = self.hub.broadcaster().stats();
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}
