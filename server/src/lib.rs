//! # Session Server Library
//!
//! This library provides the authoritative server for a real-time multiplayer
//! session. It owns the canonical state of every connected player, accepts
//! their pose updates, and keeps all clients synchronised.
//!
//! ## Core Responsibilities
//!
//! ### Player Lifecycle
//! Every WebSocket connection is bound to exactly one player:
//! - A fresh opaque player id is assigned when the handshake completes
//! - The newcomer receives a `welcome` with everyone already present
//! - Everyone else is told about the newcomer immediately
//! - On close, timeout or protocol violation the player is removed and a
//!   departure is broadcast
//!
//! ### Authoritative State
//! Clients never name themselves. Identity is resolved from the connection the
//! message arrived on, and every transform is validated before it reaches the
//! store. Out-of-order updates are rejected rather than rolling state back.
//!
//! ### State Broadcasting
//! A fixed-rate tick sends either the players that changed since the last tick
//! or a full snapshot. Join and leave events bypass the tick.
//!
//! ## Module Organization
//!
//! ### Store Module (`store`)
//! The player registry and its operations: insert, upsert with stale-update
//! rejection, remove, point-in-time snapshots and per-tick deltas.
//!
//! ### Connection Manager Module (`connection_manager`)
//! Connection registry, per-connection state machine, inbound dispatch and
//! the malformed-event policy.
//!
//! ### Sync Module (`sync`)
//! The tick loop and its fan-out to bounded per-connection queues.
//!
//! ### Network Module (`network`)
//! TCP accept loop, WebSocket handshake (any origin allowed), and the reader
//! and writer task of each connection.
//!
//! ## Concurrency
//!
//! Each connection has one reader task and one writer task; the tick has its
//! own task. The connection registry lock is always acquired before the store
//! lock. Outbound delivery never blocks: a full queue drops the message for
//! that client only.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig {
//!         bind_address: "0.0.0.0:8080".to_string(),
//!         ..Default::default()
//!     };
//!
//!     let server = Server::new(config).await?;
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection_manager;
pub mod error;
pub mod network;
pub mod store;
pub mod sync;

pub use config::{ServerConfig, SyncMode};
pub use error::SessionError;
pub use network::Server;
