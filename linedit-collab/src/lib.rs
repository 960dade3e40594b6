//! # linedit-collab: multi-user line editor over WebSocket
//!
//! Clients log in under a unique username, create and join plain-text
//! documents, and overwrite single lines. The server keeps every document in
//! memory, pushes full content to the other editors after each change, and
//! writes everything to disk on a timer.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ EditorClient │ ◄────────────────► │ CollabServer │
//! │ (per user)   │  JSON / legacy /   │  (central)   │
//! └──────────────┘      bincode       └──────┬───────┘
//!                                            │ one Handler per connection
//!                                            ▼
//!                                     ┌──────────────┐
//!                                     │     Hub      │
//!                                     └──┬───────┬───┘
//!                                        │       │
//!                              DocumentStore   SessionRegistry
//!                                        │       │
//!                                  AutoSaver   Broadcaster
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Frames, commands and the three wire encodings
//! - [`storage`]: In-memory documents and periodic persistence
//! - [`presence`]: Username ownership per connection
//! - [`broadcast`]: Fan-out with dead-peer pruning
//! - [`hub`]: Shared state handed to connection handlers
//! - [`handler`]: Per-connection state machine
//! - [`server`]: WebSocket server and configuration
//! - [`client`]: WebSocket client

pub mod protocol;
pub mod storage;
pub mod presence;
pub mod broadcast;
pub mod hub;
pub mod handler;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{Command, Encoded, Frame, ProtocolError, Request, WireFormat};
pub use storage::{
    AutoSaver, DocumentError, DocumentStore, Lines, PersistenceError, SaveReport, SnapshotSource,
    Upserted,
};
pub use presence::{ConnectionId, Delivery, Outgoing, Peer, SessionError, SessionRegistry};
pub use broadcast::{BroadcastStats, Broadcaster, FanoutReport};
pub use hub::Hub;
pub use handler::{Flow, Handler, HandlerError, HandlerState};
pub use server::{CollabServer, ServerConfig, ServerError, ServerStats};
pub use client::{ClientError, ClientEvent, ConnectionState, EditorClient};
