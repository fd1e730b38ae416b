//! Parley Daemon - Room registry and message fan-out server
//!
//! This crate provides the core infrastructure for the chat relay:
//! - `rooms` - Room store: membership and history per room
//! - `connections` - Connection registry: identity and current room
//! - `engine` - Broadcast engine: connect, send, change room, disconnect
//! - `server` - TCP server speaking newline-delimited JSON
//! - `config` - Layered configuration (defaults, TOML, environment)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       parleyd daemon                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐    │
//! │  │   RelayServer   │────▶│      BroadcastEngine        │    │
//! │  │  (TcpListener)  │     │  (stateless event handlers) │    │
//! │  └────────┬────────┘     └───────┬──────────────┬──────┘    │
//! │           │                      │              │           │
//! │           │ connections          ▼              ▼           │
//! │           ▼              ┌──────────────┐ ┌──────────────┐  │
//! │  ┌─────────────────┐     │  RoomStore   │ │ Connection   │  │
//! │  │ConnectionHandler│     │ (per-room    │ │ Registry     │  │
//! │  │  + Outbox       │     │  locks)      │ │              │  │
//! │  └─────────────────┘     └──────────────┘ └──────────────┘  │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod config;
pub mod connections;
pub mod engine;
pub mod rooms;
pub mod server;

pub use config::{ConfigError, ServerConfig};
pub use connections::{Client, ClientState, ConnectionRegistry, RegistryError};
pub use engine::{BroadcastEngine, EngineError, EngineStats, FanoutPolicy, Transport};
pub use rooms::{RetentionPolicy, RoomStore, StoreError};
pub use server::{RelayServer, ServerError};
