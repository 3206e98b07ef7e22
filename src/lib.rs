//! Rust library for controlling Snapcast multi-room audio servers
//!
//! This library provides an async client for the snapserver JSON-RPC control
//! interface (TCP port 1705). It supports:
//!
//! - A persistent connection that reconnects with exponential backoff
//! - An observable, immutable snapshot of groups, clients and streams
//! - Client volume, mute, latency and name control
//! - Group mute, volume, stream selection, naming and membership
//! - Optimistic updates reconciled against the server's answers
//! - Server-measured client timing statistics (where supported)
//!
//! # Quick Start
//!
//! ```no_run
//! use snapcast_control::{ClientConfig, SnapcastClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = SnapcastClient::connect("192.168.1.20", 1705, ClientConfig::default())?;
//!
//!     // Wait for the first full status
//!     let mut updates = client.subscribe();
//!     let snapshot = loop {
//!         let snapshot = updates.recv().await?;
//!         if snapshot.connected {
//!             break snapshot;
//!         }
//!     };
//!
//!     for group in snapshot.groups.values() {
//!         println!("{} ({} clients)", group.name, group.client_count());
//!         client.commands().set_group_mute(&group.id, false).await?;
//!     }
//!
//!     client.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! The library is organized into several layers:
//!
//! - **Client**: Session facade wiring everything below together
//! - **Commands**: Typed control methods with local validation
//! - **Store**: Versioned snapshots, optimistic patches, subscriptions
//! - **Supervisor**: Connect, initial sync, reconnect with backoff
//! - **Connection**: Request/response matching and notification routing
//! - **Codec**: Newline-delimited JSON-RPC framing
//! - **Protocol**: JSON-RPC message structures
//! - **Types**: Domain types and data structures

mod client;
mod codec;
mod commands;
mod config;
mod connection;
mod error;
mod events;
mod patch;
mod protocol;
mod status;
mod store;
mod subscription;
mod supervisor;
mod types;

// Public exports
pub use client::SnapcastClient;
pub use codec::{encode_request, JsonRpcCodec, MAX_FRAME_LEN};
pub use commands::CommandClient;
pub use config::{ClientConfig, ReconnectConfig, ServerProfile};
pub use connection::{CloseReason, Connection, NotificationHandler, ResponseHook};
pub use error::{Result, SnapError, METHOD_NOT_FOUND};
pub use events::ServerEvent;
pub use patch::{Patch, PatchKey};
pub use protocol::{Incoming, Method, Notification, Request, Response, RpcErrorObject};
pub use status::{parse_server_status, ServerStatus};
pub use store::{PatchTicket, StateStore};
pub use subscription::SnapshotReceiver;
pub use supervisor::{Backoff, Link, LinkState, Supervisor};
pub use types::{
    Client, ClientId, Group, GroupId, LastSeen, RpcVersion, ServerIdentity, ServerSnapshot,
    Source, SourceId, SourceMetadata, SourceStatus, TimeStats, DEFAULT_CONTROL_PORT, MAX_VOLUME,
};
