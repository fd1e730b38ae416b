//! Per-room state: membership, history and the delivery turn.

use std::collections::{HashSet, VecDeque};
use std::ops::Deref;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use parley_core::{ChatMessage, ConnectionId, RoomId};

/// A chat room.
///
/// Membership and history sit behind one lock so that "append then
/// snapshot" and "add member then read history" are each atomic. The
/// delivery lock is separate: it orders fan-out across callers without
/// blocking joins, leaves or appends while messages are being handed to
/// the transport.
pub struct Room {
    id: RoomId,
    pub(super) state: Mutex<RoomState>,
    pub(super) delivery: Arc<Mutex<()>>,
}

impl Room {
    pub(super) fn new(id: RoomId) -> Self {
        Self {
            id,
            state: Mutex::new(RoomState::default()),
            delivery: Arc::new(Mutex::new(())),
        }
    }

    /// Returns the room identifier.
    pub fn id(&self) -> &RoomId {
        &self.id
    }

    /// Number of current members.
    pub async fn member_count(&self) -> usize {
        self.state.lock().await.members.len()
    }

    /// Sequence position the next appended message will get.
    pub async fn next_sequence(&self) -> u64 {
        self.state.lock().await.next_seq
    }

    /// Takes this room's delivery turn while the state lock is still held.
    ///
    /// Lock order is always state then delivery; holders of the delivery
    /// turn never wait on the state lock.
    pub(super) async fn take_turn(&self) -> DeliveryTurn {
        DeliveryTurn {
            _guard: Arc::clone(&self.delivery).lock_owned().await,
        }
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Mutable state of a room, guarded by `Room::state`.
#[derive(Debug, Default)]
pub(super) struct RoomState {
    pub(super) members: HashSet<ConnectionId>,
    history: VecDeque<ChatMessage>,
    next_seq: u64,
    /// Set once the room has been dropped from the store; nothing may join
    /// or append afterwards.
    pub(super) evicted: bool,
}

impl RoomState {
    /// Appends a message and returns its sequence position.
    ///
    /// With a `limit`, the oldest entries are trimmed; positions keep
    /// counting from where they were.
    pub(super) fn append(&mut self, message: ChatMessage, limit: Option<usize>) -> u64 {
        let seq = self.next_seq;
        self.history.push_back(message);
        self.next_seq = self.next_seq.saturating_add(1);

        if let Some(limit) = limit {
            while self.history.len() > limit {
                self.history.pop_front();
            }
        }

        seq
    }

    pub(super) fn history(&self) -> Vec<ChatMessage> {
        self.history.iter().cloned().collect()
    }
}

/// Exclusive right to deliver for one room.
///
/// Released on drop. While held, no other caller can fan out for the same
/// room, so deliveries reach each outbox in append order.
#[must_use = "dropping the turn immediately gives up delivery ordering"]
pub struct DeliveryTurn {
    _guard: OwnedMutexGuard<()>,
}

impl std::fmt::Debug for DeliveryTurn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DeliveryTurn")
    }
}

/// A value read from a room together with that room's delivery turn.
#[derive(Debug)]
pub struct Ordered<T> {
    value: T,
    turn: DeliveryTurn,
}

impl<T> Ordered<T> {
    pub(super) fn new(value: T, turn: DeliveryTurn) -> Self {
        Self { value, turn }
    }

    /// Splits into the value and the turn; emit, then drop the turn.
    pub fn into_parts(self) -> (T, DeliveryTurn) {
        (self.value, self.turn)
    }
}

impl<T> Deref for Ordered<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

/// Result of appending a message: its position and who should get it.
#[derive(Debug, Clone)]
pub struct Published {
    /// Sequence position in the room's history
    pub seq: u64,
    /// The message as appended
    pub message: ChatMessage,
    /// Membership at the moment of the append
    pub members: Vec<ConnectionId>,
}
