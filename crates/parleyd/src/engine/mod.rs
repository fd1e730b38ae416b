//! Broadcast engine: turns connection events into store updates and emits.
//!
//! The engine itself holds no per-connection state. Every handler runs
//! against the shared [`RoomStore`] and [`ConnectionRegistry`], so handlers
//! for different connections execute truly in parallel.
//!
//! # Per-connection lifecycle
//!
//! ```text
//!   connect ok            disconnect
//! ┌────────────┐ ───▶ ┌────────┐ ───▶ ┌──────────────┐
//! │ Connecting │      │ Joined │      │ Disconnected │
//! └────────────┘ ◀─── └────────┘      └──────────────┘
//!            change-room
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()` in production code
//! - A failing event is logged and dropped (or rejected); it never tears
//!   down the connection that sent it

mod error;
mod transport;

pub use error::EngineError;
pub use transport::Transport;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use parley_core::{ChatMessage, ConnectionId, DisplayName, RoomId};
use parley_protocol::{ClientEvent, ServerMessage};

use crate::connections::ConnectionRegistry;
use crate::rooms::{RoomStore, StoreError};

/// Who receives a room's new messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanoutPolicy {
    /// Deliver `receive-message` back to the sender as well.
    pub echo_to_sender: bool,
}

impl Default for FanoutPolicy {
    fn default() -> Self {
        Self {
            echo_to_sender: true,
        }
    }
}

/// Counters exposed for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Registered connections
    pub connections: usize,
    /// Allocated rooms
    pub rooms: usize,
    /// Messages appended to any room
    pub messages_published: u64,
    /// `receive-message` emits queued
    pub deliveries: u64,
    /// Events dropped without a client-visible reply
    pub dropped_events: u64,
    /// Store/registry disagreements detected
    pub invariant_violations: u64,
}

#[derive(Debug, Default)]
struct Counters {
    messages_published: AtomicU64,
    deliveries: AtomicU64,
    dropped_events: AtomicU64,
    invariant_violations: AtomicU64,
}

/// Orchestrates connect, send, room change and disconnect.
pub struct BroadcastEngine {
    rooms: Arc<RoomStore>,
    connections: Arc<ConnectionRegistry>,
    transport: Arc<dyn Transport>,
    fanout: FanoutPolicy,
    counters: Counters,
}

impl BroadcastEngine {
    /// Creates an engine over the given store, registry and transport.
    pub fn new(
        rooms: Arc<RoomStore>,
        connections: Arc<ConnectionRegistry>,
        transport: Arc<dyn Transport>,
        fanout: FanoutPolicy,
    ) -> Self {
        Self {
            rooms,
            connections,
            transport,
            fanout,
            counters: Counters::default(),
        }
    }

    /// The room store this engine writes to.
    pub fn rooms(&self) -> &Arc<RoomStore> {
        &self.rooms
    }

    /// The connection registry this engine writes to.
    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    // ========================================================================
    // Event Handlers
    // ========================================================================

    /// Handshake: register, join the room and send its history.
    ///
    /// The history goes to this connection alone, before any broadcast
    /// published after the join.
    ///
    /// # Errors
    ///
    /// - `EngineError::InvalidInput` for a blank or malformed name or room;
    ///   nothing is created
    /// - `EngineError::DuplicateConnection` if the id is already registered
    /// - `EngineError::UnknownConnection` if the connection disconnected
    ///   while joining (membership is rolled back)
    pub async fn connect(
        &self,
        conn: ConnectionId,
        username: &str,
        room: &str,
    ) -> Result<(), EngineError> {
        let display_name = DisplayName::parse(username)?;
        let room = RoomId::parse(room)?;

        self.connections
            .register(conn, display_name.clone(), room.clone())?;
        let history_len = self.enter_room(conn, &room).await?;

        info!(
            connection = %conn,
            username = %display_name,
            room = %room,
            history = history_len,
            "Client joined"
        );
        Ok(())
    }

    /// Appends a message to the sender's room and fans it out.
    ///
    /// The sender is always the name registered at connect; `claimed` is
    /// only compared against it for logging. Returns the message's
    /// position in the room history.
    ///
    /// # Errors
    ///
    /// - `EngineError::UnknownConnection` if not registered or not joined
    /// - `EngineError::BlankMessage` for a body with no visible content
    /// - `EngineError::RoomNotFound` if the registry and store disagree;
    ///   a sender that disconnected mid-send gets `UnknownConnection`
    pub async fn send_message(
        &self,
        conn: ConnectionId,
        claimed: Option<&str>,
        body: &str,
    ) -> Result<u64, EngineError> {
        let (sender, room) = self.connections.identity(conn)?;

        if let Some(claimed) = claimed.filter(|claimed| *claimed != sender.as_str()) {
            debug!(
                connection = %conn,
                claimed,
                registered = %sender,
                "Ignoring client-asserted username"
            );
        }

        let message = ChatMessage::new(&sender, body);
        if message.is_blank() {
            return Err(EngineError::BlankMessage);
        }

        let (published, turn) = match self.rooms.publish(&room, message).await {
            Ok(ordered) => ordered.into_parts(),
            // The sender left, evicting its room, after its identity was read.
            Err(StoreError::RoomNotFound(_)) if self.connections.get(conn).is_none() => {
                return Err(EngineError::UnknownConnection(conn));
            }
            Err(e) => return Err(e.into()),
        };

        let recipients: Vec<ConnectionId> = if self.fanout.echo_to_sender {
            published.members
        } else {
            published
                .members
                .into_iter()
                .filter(|member| *member != conn)
                .collect()
        };
        let queued = self
            .transport
            .emit_to_set(&recipients, ServerMessage::receive_message(published.message));
        drop(turn);

        self.counters.messages_published.fetch_add(1, Ordering::Relaxed);
        self.counters
            .deliveries
            .fetch_add(queued as u64, Ordering::Relaxed);

        debug!(
            connection = %conn,
            room = %room,
            seq = published.seq,
            recipients = recipients.len(),
            queued,
            "Message published"
        );
        Ok(published.seq)
    }

    /// Moves a joined connection to another room and sends that room's
    /// history. Returns false if it was already there.
    ///
    /// # Errors
    ///
    /// - `EngineError::InvalidInput` for a blank or malformed room
    /// - `EngineError::UnknownConnection` if not joined, or if the
    ///   connection disconnected during the move
    pub async fn change_room(&self, conn: ConnectionId, room: &str) -> Result<bool, EngineError> {
        let target = RoomId::parse(room)?;
        if self.connections.current_room(conn)? == target {
            return Ok(false);
        }

        let previous = self.connections.begin_room_change(conn, target.clone())?;
        self.rooms.remove_member(&previous, conn).await;
        let history_len = self.enter_room(conn, &target).await?;

        info!(
            connection = %conn,
            from = %previous,
            to = %target,
            history = history_len,
            "Client changed room"
        );
        Ok(true)
    }

    /// Forgets a connection and its room membership.
    ///
    /// Idempotent: returns false if there was nothing to remove.
    pub async fn disconnect(&self, conn: ConnectionId) -> bool {
        let Some(client) = self.connections.unregister(conn) else {
            return false;
        };
        self.rooms.remove_member(&client.room, conn).await;

        info!(
            connection = %conn,
            username = %client.display_name,
            room = %client.room,
            "Client left"
        );
        true
    }

    /// Dispatches one inbound event.
    ///
    /// Errors are handled here: dropped, logged, or answered with
    /// `rejected`, depending on the kind.
    pub async fn handle(&self, conn: ConnectionId, event: ClientEvent) {
        let name = event.name();
        let result = match event {
            ClientEvent::Connect { username, room } => {
                self.connect(conn, &username, &room).await
            }
            ClientEvent::SendMessage { username, message } => self
                .send_message(conn, username.as_deref(), &message)
                .await
                .map(|_| ()),
            ClientEvent::ChangeRoom { room } => {
                self.change_room(conn, &room).await.map(|_| ())
            }
            ClientEvent::Ping { seq } => {
                self.transport.emit(conn, ServerMessage::pong(seq));
                Ok(())
            }
            ClientEvent::Disconnect => {
                self.disconnect(conn).await;
                Ok(())
            }
        };

        if let Err(err) = result {
            self.report(conn, name, &err);
        }
    }

    /// Snapshot of the engine's counters.
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            connections: self.connections.len(),
            rooms: self.rooms.room_count(),
            messages_published: self.counters.messages_published.load(Ordering::Relaxed),
            deliveries: self.counters.deliveries.load(Ordering::Relaxed),
            dropped_events: self.counters.dropped_events.load(Ordering::Relaxed),
            invariant_violations: self.counters.invariant_violations.load(Ordering::Relaxed),
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Joins `room`, emits its history, then marks the connection joined.
    ///
    /// If the connection was unregistered meanwhile, the membership just
    /// added is removed again.
    async fn enter_room(&self, conn: ConnectionId, room: &RoomId) -> Result<usize, EngineError> {
        let (history, turn) = self.rooms.join(room, conn).await.into_parts();
        let history_len = history.len();
        self.transport
            .emit(conn, ServerMessage::current_messages(room.clone(), history));
        drop(turn);

        if let Err(err) = self.connections.mark_joined(conn) {
            self.rooms.remove_member(room, conn).await;
            return Err(err.into());
        }
        Ok(history_len)
    }

    fn report(&self, conn: ConnectionId, event: &'static str, err: &EngineError) {
        match err {
            EngineError::UnknownConnection(_) | EngineError::BlankMessage => {
                self.counters.dropped_events.fetch_add(1, Ordering::Relaxed);
                debug!(connection = %conn, event, error = %err, "Event dropped");
            }
            EngineError::InvalidInput(_) | EngineError::DuplicateConnection(_) => {
                warn!(connection = %conn, event, error = %err, "Event rejected");
                self.transport.emit(conn, ServerMessage::rejected(err.to_string()));
            }
            EngineError::RoomNotFound(room) => {
                self.counters
                    .invariant_violations
                    .fetch_add(1, Ordering::Relaxed);
                error!(
                    connection = %conn,
                    room = %room,
                    event,
                    "Joined connection points at a missing room; event dropped"
                );
            }
        }
    }
}

impl std::fmt::Debug for BroadcastEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastEngine")
            .field("rooms", &self.rooms.room_count())
            .field("connections", &self.connections.len())
            .field("fanout", &self.fanout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(ConnectionId, ServerMessage)>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<(ConnectionId, ServerMessage)> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }
    }

    impl Transport for Recorder {
        fn emit(&self, to: ConnectionId, message: ServerMessage) -> bool {
            self.sent.lock().unwrap().push((to, message));
            true
        }
    }

    fn engine(fanout: FanoutPolicy) -> (BroadcastEngine, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let engine = BroadcastEngine::new(
            Arc::new(RoomStore::default()),
            Arc::new(ConnectionRegistry::new()),
            Arc::clone(&recorder) as Arc<dyn Transport>,
            fanout,
        );
        (engine, recorder)
    }

    const C1: ConnectionId = ConnectionId::new(1);
    const C2: ConnectionId = ConnectionId::new(2);

    #[tokio::test]
    async fn test_connect_sends_history_to_joiner_only() {
        let (engine, recorder) = engine(FanoutPolicy::default());
        engine.connect(C1, "alice", "general").await.unwrap();

        let sent = recorder.take();
        assert_eq!(
            sent,
            vec![(
                C1,
                ServerMessage::current_messages(RoomId::new("general"), vec![])
            )]
        );
        assert_eq!(engine.connections().current_room(C1), Ok(RoomId::new("general")));
    }

    #[tokio::test]
    async fn test_connect_rejects_blank_params_before_creating_anything() {
        let (engine, _recorder) = engine(FanoutPolicy::default());

        let err = engine.connect(C1, "alice", "   ").await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
        let err = engine.connect(C1, "", "general").await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));

        assert_eq!(engine.rooms().room_count(), 0);
        assert!(engine.connections().is_empty());
    }

    #[tokio::test]
    async fn test_handle_rejects_duplicate_connect() {
        let (engine, recorder) = engine(FanoutPolicy::default());
        engine.connect(C1, "alice", "general").await.unwrap();
        recorder.take();

        engine
            .handle(
                C1,
                ClientEvent::Connect {
                    username: "mallory".into(),
                    room: "other".into(),
                },
            )
            .await;

        let sent = recorder.take();
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0].1, ServerMessage::Rejected { .. }));
        assert!(!engine.rooms().contains(&RoomId::new("other")));
    }

    #[tokio::test]
    async fn test_send_uses_registered_name() {
        let (engine, recorder) = engine(FanoutPolicy::default());
        engine.connect(C1, "alice", "general").await.unwrap();
        recorder.take();

        let seq = engine.send_message(C1, Some("bob"), "hi").await.unwrap();
        assert_eq!(seq, 0);

        let expected = ChatMessage::new(&DisplayName::new("alice"), "hi");
        assert_eq!(
            recorder.take(),
            vec![(C1, ServerMessage::receive_message(expected))]
        );
    }

    #[tokio::test]
    async fn test_send_without_echo_skips_sender() {
        let (engine, recorder) = engine(FanoutPolicy {
            echo_to_sender: false,
        });
        engine.connect(C1, "alice", "general").await.unwrap();
        engine.connect(C2, "bob", "general").await.unwrap();
        recorder.take();

        engine.send_message(C1, None, "hi").await.unwrap();

        let recipients: Vec<ConnectionId> = recorder.take().into_iter().map(|(to, _)| to).collect();
        assert_eq!(recipients, vec![C2]);
    }

    #[tokio::test]
    async fn test_send_from_unknown_connection_is_dropped_silently() {
        let (engine, recorder) = engine(FanoutPolicy::default());

        engine
            .handle(
                C1,
                ClientEvent::SendMessage {
                    username: None,
                    message: "hi".into(),
                },
            )
            .await;

        assert!(recorder.take().is_empty());
        assert_eq!(engine.stats().dropped_events, 1);
    }

    #[tokio::test]
    async fn test_blank_message_is_dropped() {
        let (engine, recorder) = engine(FanoutPolicy::default());
        engine.connect(C1, "alice", "general").await.unwrap();
        recorder.take();

        let err = engine.send_message(C1, None, "  \t").await.unwrap_err();
        assert_eq!(err, EngineError::BlankMessage);
        assert!(recorder.take().is_empty());
        assert!(engine.rooms().history(&RoomId::new("general")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_change_room_moves_membership() {
        let (engine, recorder) = engine(FanoutPolicy::default());
        engine.connect(C1, "alice", "general").await.unwrap();
        engine.connect(C2, "bob", "random").await.unwrap();
        engine.send_message(C2, None, "welcome").await.unwrap();
        recorder.take();

        assert!(engine.change_room(C1, "random").await.unwrap());
        assert!(!engine.change_room(C1, "random").await.unwrap());

        let history = vec![ChatMessage::new(&DisplayName::new("bob"), "welcome")];
        assert_eq!(
            recorder.take(),
            vec![(C1, ServerMessage::current_messages(RoomId::new("random"), history))]
        );
        assert_eq!(engine.rooms().member_count(&RoomId::new("general")).await, 0);
        assert_eq!(engine.rooms().member_count(&RoomId::new("random")).await, 2);
    }

    #[tokio::test]
    async fn test_ping_gets_pong() {
        let (engine, recorder) = engine(FanoutPolicy::default());
        engine.handle(C1, ClientEvent::Ping { seq: 9 }).await;
        assert_eq!(recorder.take(), vec![(C1, ServerMessage::pong(9))]);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (engine, _recorder) = engine(FanoutPolicy::default());
        engine.connect(C1, "alice", "general").await.unwrap();

        assert!(engine.disconnect(C1).await);
        assert!(!engine.disconnect(C1).await);
        assert_eq!(engine.rooms().member_count(&RoomId::new("general")).await, 0);
        assert!(engine.connections().is_empty());
    }

    #[tokio::test]
    async fn test_missing_room_counts_as_invariant_violation() {
        let (engine, recorder) = engine(FanoutPolicy::default());
        // Registered and joined, but never added to the store.
        engine
            .connections()
            .register(C1, DisplayName::new("alice"), RoomId::new("ghost"))
            .unwrap();
        engine.connections().mark_joined(C1).unwrap();

        engine
            .handle(
                C1,
                ClientEvent::SendMessage {
                    username: None,
                    message: "hi".into(),
                },
            )
            .await;

        assert!(recorder.take().is_empty());
        assert_eq!(engine.stats().invariant_violations, 1);
    }
}
