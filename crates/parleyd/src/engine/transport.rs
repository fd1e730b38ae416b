//! Outbound side of the transport, as seen by the engine.

use parley_core::ConnectionId;
use parley_protocol::ServerMessage;

/// Delivers server messages to connections.
///
/// Implementations must not block: the engine calls these while holding a
/// room's delivery turn. Returns report how many messages were queued;
/// a message for a connection that is gone is silently discarded.
pub trait Transport: Send + Sync {
    /// Queues `message` for one connection.
    fn emit(&self, to: ConnectionId, message: ServerMessage) -> bool;

    /// Queues `message` for every connection in `to`.
    fn emit_to_set(&self, to: &[ConnectionId], message: ServerMessage) -> usize {
        to.iter()
            .filter(|conn| self.emit(**conn, message.clone()))
            .count()
    }
}
