//! WebSocket client for the line editor server.
//!
//! Provides:
//! - Connection lifecycle (connect, quit)
//! - Typed requests for every client command
//! - An event channel carrying presence, file lists, syncs and errors
//!
//! The client holds no document state besides the name of the file the user
//! is currently editing; the server is authoritative.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::{self, Message};

use crate::protocol::{Command, Encoded, Frame, ProtocolError, WireFormat};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Presence snapshot
    Users(Vec<String>),
    /// Known documents
    Files(Vec<String>),
    /// Full content of a document
    Synced { filename: String, lines: Vec<String> },
    /// Server rejected a request
    Error(String),
    /// Connection lost or closed
    Disconnected,
}

impl ClientEvent {
    fn from_frame(frame: Frame) -> Option<Self> {
        match frame.command {
            Command::UserList => Some(ClientEvent::Users(frame.args)),
            Command::FileList => Some(ClientEvent::Files(frame.args)),
            Command::FileSync => {
                let lines = frame.body_lines();
                let filename = frame.args.into_iter().next().unwrap_or_default();
                Some(ClientEvent::Synced { filename, lines })
            }
            Command::Error => Some(ClientEvent::Error(frame.body.unwrap_or_default())),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Connection failed: {0}")]
    Connect(#[from] tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Not connected")]
    NotConnected,
    #[error("No file joined")]
    NoFileJoined,
}

/// The editor client.
pub struct EditorClient {
    server_url: String,
    format: WireFormat,
    state: Arc<RwLock<ConnectionState>>,
    username: Option<String>,
    current_file: Option<String>,
    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Frame>>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    event_tx: mpsc::Sender<ClientEvent>,
}

impl EditorClient {
    pub fn new(server_url: impl Into<String>, format: WireFormat) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            format,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            username: None,
            current_file: None,
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server and spawn the reader and writer tasks.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(self.server_url.as_str()).await
        {
            Ok(connected) => connected,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing frames to the socket
        let (out_tx, mut out_rx) = mpsc::channel::<Frame>(256);
        let format = self.format;
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let message = match frame.encode(format) {
                    Ok(Encoded::Text(text)) => Message::text(text),
                    Ok(Encoded::Binary(bytes)) => Message::binary(bytes),
                    Err(e) => {
                        log::error!("Failed to encode {}: {e}", frame.command);
                        continue;
                    }
                };
                if ws_writer.send(message).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });
        self.outgoing_tx = Some(out_tx);

        // Reader task: socket -> events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let decoded = match msg {
                    Ok(Message::Text(text)) => Frame::decode_text(text.as_str()).map(|(f, _)| f),
                    Ok(Message::Binary(data)) => Frame::decode_binary(&data),
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                match decoded {
                    Ok(frame) => {
                        if let Some(event) = ClientEvent::from_frame(frame) {
                            if event_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(e) => log::warn!("Undecodable frame from server: {e}"),
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        *self.state.write().await = ConnectionState::Connected;
        Ok(())
    }

    /// Queue a raw frame for the server.
    pub async fn send(&self, frame: Frame) -> Result<(), ClientError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ClientError::NotConnected)?;
        tx.send(frame).await.map_err(|_| ClientError::NotConnected)
    }

    /// Ask for `username`. Success shows up as a `Users` event that includes it.
    pub async fn login(&mut self, username: &str) -> Result<(), ClientError> {
        self.send(Frame::login(username)).await?;
        self.username = Some(username.to_string());
        Ok(())
    }

    pub async fn create_file(&self, filename: &str) -> Result<(), ClientError> {
        self.send(Frame::file_create(filename)).await
    }

    /// Request the file's content and make it the current file.
    pub async fn join_file(&mut self, filename: &str) -> Result<(), ClientError> {
        self.send(Frame::file_join(filename)).await?;
        self.current_file = Some(filename.to_string());
        Ok(())
    }

    /// Set line `line` (1-based) of `filename`.
    pub async fn update_line(
        &self,
        filename: &str,
        line: usize,
        text: &str,
    ) -> Result<(), ClientError> {
        self.send(Frame::file_update(filename, line, text)).await
    }

    /// Set a line of the current file.
    pub async fn edit_current(&self, line: usize, text: &str) -> Result<(), ClientError> {
        let filename = self.current_file.as_deref().ok_or(ClientError::NoFileJoined)?;
        self.update_line(filename, line, text).await
    }

    pub async fn request_file_list(&self) -> Result<(), ClientError> {
        self.send(Frame::new(Command::FileList, Vec::new(), None)).await
    }

    /// Say goodbye and close the connection once the goodbye is written.
    pub async fn quit(&mut self) -> Result<(), ClientError> {
        let username = self.username.clone().unwrap_or_default();
        let sent = self.send(Frame::quit(username)).await;
        self.outgoing_tx = None;
        self.current_file = None;
        sent
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn current_file(&self) -> Option<&str> {
        self.current_file.as_deref()
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}
