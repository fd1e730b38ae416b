//! TCP server for the relay.
//!
//! The server:
//! - Listens on a TCP socket for client connections
//! - Assigns each connection a fresh [`ConnectionId`]
//! - Spawns a [`ConnectionHandler`] per client
//! - Supports graceful shutdown via `CancellationToken`
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   RelayServer   │
//! │   TcpListener   │
//! └───────┬─────────┘
//!         │ accept()
//!         ▼
//! ┌─────────────────┐  handle()   ┌──────────────────┐
//! │ConnectionHandler│────────────▶│ BroadcastEngine  │
//! │  (per client)   │             └────────┬─────────┘
//! └───────▲─────────┘                      │ emit / emit_to_set
//!         │ writer task                    ▼
//!         │                       ┌──────────────────┐
//!         └───────────────────────│     Outboxes     │
//!                                 └──────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Accept errors are logged and the server keeps accepting

mod connection;
mod outbox;

pub use connection::{ConnectionError, ConnectionHandler, ConnectionLimits};
pub use outbox::{Line, Outboxes};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use parley_core::ConnectionId;
use parley_protocol::{encode_line, ServerMessage};

use crate::config::ServerConfig;
use crate::connections::ConnectionRegistry;
use crate::engine::{BroadcastEngine, Transport};
use crate::rooms::RoomStore;

/// The relay's TCP front end.
///
/// Owns the engine and everything it is wired to.
pub struct RelayServer {
    config: ServerConfig,
    engine: Arc<BroadcastEngine>,
    outboxes: Arc<Outboxes>,
    cancel_token: CancellationToken,
    /// Last assigned connection id
    connection_counter: AtomicU64,
    active: Arc<AtomicUsize>,
}

impl RelayServer {
    /// Builds the room store, registry, outboxes and engine from `config`.
    pub fn new(config: ServerConfig, cancel_token: CancellationToken) -> Self {
        let rooms = Arc::new(RoomStore::new(config.retention()));
        let connections = Arc::new(ConnectionRegistry::new());
        let outboxes = Arc::new(Outboxes::new(config.outbox_capacity));
        let engine = Arc::new(BroadcastEngine::new(
            rooms,
            connections,
            Arc::clone(&outboxes) as Arc<dyn Transport>,
            config.fanout_policy(),
        ));

        Self {
            config,
            engine,
            outboxes,
            cancel_token,
            connection_counter: AtomicU64::new(0),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The engine behind this server.
    pub fn engine(&self) -> &Arc<BroadcastEngine> {
        &self.engine
    }

    /// Number of open TCP connections.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Binds the configured address.
    ///
    /// # Errors
    ///
    /// `ServerError::Bind` if the address is invalid or in use.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let addr = self.config.bind_addr();
        TcpListener::bind(&addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr,
                error: e.to_string(),
            })
    }

    /// Binds and serves until cancelled.
    ///
    /// # Errors
    ///
    /// `ServerError::Bind` if the listener cannot be created.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accepts connections on `listener` until the cancellation token
    /// fires.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        match listener.local_addr() {
            Ok(addr) => info!(addr = %addr, "Relay listening"),
            Err(e) => warn!(error = %e, "Relay listening on unknown address"),
        }

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Server shutdown requested");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => self.handle_connection(stream, peer),
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }

        let stats = self.engine.stats();
        info!(
            connections = stats.connections,
            rooms = stats.rooms,
            messages = stats.messages_published,
            "Server stopped"
        );
        Ok(())
    }

    fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let write_timeout = self.config.connection_limits().write_timeout;

        if self.active.load(Ordering::Relaxed) >= self.config.max_connections {
            warn!(
                peer = %peer,
                max = self.config.max_connections,
                "Connection limit reached, refusing client"
            );
            tokio::spawn(refuse(stream, write_timeout));
            return;
        }

        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }

        let id = ConnectionId::new(self.connection_counter.fetch_add(1, Ordering::Relaxed) + 1);
        let slot = ActiveSlot::claim(Arc::clone(&self.active));
        let (reader, writer) = stream.into_split();
        let handler = ConnectionHandler::new(
            id,
            peer,
            reader,
            Arc::clone(&self.engine),
            Arc::clone(&self.outboxes),
            self.cancel_token.child_token(),
            self.config.connection_limits(),
        );

        tokio::spawn(async move {
            handler.run(writer).await;
            drop(slot);
        });
    }
}

/// Tells an over-limit client why it is being dropped.
async fn refuse(mut stream: TcpStream, write_timeout: Duration) {
    let Ok(line) = encode_line(&ServerMessage::rejected("server is at its connection limit"))
    else {
        return;
    };
    let _ = timeout(write_timeout, async {
        stream.write_all(line.as_bytes()).await?;
        stream.shutdown().await
    })
    .await;
}

/// Counts one open connection for as long as it lives.
struct ActiveSlot(Arc<AtomicUsize>);

impl ActiveSlot {
    fn claim(active: Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::Relaxed);
        Self(active)
    }
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {error}")]
    Bind { addr: String, error: String },
}
