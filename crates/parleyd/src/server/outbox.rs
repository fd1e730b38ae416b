//! Per-connection outbound queues; the TCP side of [`Transport`].
//!
//! Emits never touch a socket. They serialize the message and push the line
//! into the recipient's bounded channel; the connection's writer task does
//! the actual write. A recipient whose queue is full is treated as a slow
//! consumer and its connection is cancelled.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use parley_core::ConnectionId;
use parley_protocol::{encode_line, ServerMessage};

use crate::engine::Transport;

/// One encoded line, shared between all recipients of a broadcast.
pub type Line = Arc<str>;

struct Outbox {
    sender: mpsc::Sender<Line>,
    cancel: CancellationToken,
}

/// Registry of open outboxes, keyed by connection.
pub struct Outboxes {
    outboxes: DashMap<ConnectionId, Outbox>,
    capacity: usize,
}

impl Outboxes {
    /// Creates an empty set; each outbox will hold up to `capacity` lines.
    pub fn new(capacity: usize) -> Self {
        Self {
            outboxes: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Opens the outbox for `id` and returns the receiving end.
    ///
    /// `cancel` is triggered if the connection falls too far behind.
    pub fn open(&self, id: ConnectionId, cancel: CancellationToken) -> mpsc::Receiver<Line> {
        let (sender, receiver) = mpsc::channel(self.capacity);
        self.outboxes.insert(id, Outbox { sender, cancel });
        receiver
    }

    /// Closes the outbox; the writer drains what is queued, then stops.
    pub fn close(&self, id: ConnectionId) -> bool {
        self.outboxes.remove(&id).is_some()
    }

    /// Number of open outboxes.
    pub fn len(&self) -> usize {
        self.outboxes.len()
    }

    /// Returns true if no outbox is open.
    pub fn is_empty(&self) -> bool {
        self.outboxes.is_empty()
    }

    fn push(&self, id: ConnectionId, line: Line) -> bool {
        let Some(outbox) = self.outboxes.get(&id) else {
            return false;
        };

        match outbox.sender.try_send(line) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    connection = %id,
                    capacity = self.capacity,
                    "Outbox full, disconnecting slow consumer"
                );
                outbox.cancel.cancel();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

fn encode(message: &ServerMessage) -> Option<Line> {
    match encode_line(message) {
        Ok(line) => Some(Arc::from(line)),
        Err(e) => {
            error!(kind = message.name(), error = %e, "Failed to serialize message");
            None
        }
    }
}

impl Transport for Outboxes {
    fn emit(&self, to: ConnectionId, message: ServerMessage) -> bool {
        encode(&message).is_some_and(|line| self.push(to, line))
    }

    fn emit_to_set(&self, to: &[ConnectionId], message: ServerMessage) -> usize {
        let Some(line) = encode(&message) else {
            return 0;
        };
        to.iter()
            .filter(|conn| self.push(**conn, Arc::clone(&line)))
            .count()
    }
}

impl std::fmt::Debug for Outboxes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outboxes")
            .field("open", &self.outboxes.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
