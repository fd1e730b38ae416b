//! Room store: the single source of truth for membership and history.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                  RoomStore                   │
//! │   DashMap<RoomId, Arc<Room>>  (sharded map)  │
//! └───────────────┬──────────────────────────────┘
//!                 │ one entry per room
//!                 ▼
//! ┌──────────────────────────────────────────────┐
//! │ Room                                         │
//! │   state:    Mutex<members + history>         │
//! │   delivery: Mutex<()>  (fan-out ordering)    │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Unrelated rooms never contend: each room has its own locks, and the map
//! is only touched to look a room up or create it.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()` in production code
//! - Absent rooms surface as `StoreError::RoomNotFound`
//! - No map guard is ever held across an `.await`

mod room;

pub use room::{DeliveryTurn, Ordered, Published, Room};

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tracing::debug;

use parley_core::{ChatMessage, ConnectionId, RoomId};

/// Errors returned by the room store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The room was never created (or has been evicted).
    #[error("room not found: {0}")]
    RoomNotFound(RoomId),
}

/// What happens to rooms and their history over time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Drop a room (and its history) when its last member leaves.
    pub evict_empty: bool,

    /// Keep at most this many messages per room; `None` keeps everything.
    pub history_limit: Option<usize>,
}

/// Owner of every room's membership and history.
///
/// Constructed once at startup and shared behind an `Arc`.
#[derive(Debug, Default)]
pub struct RoomStore {
    rooms: DashMap<RoomId, Arc<Room>>,
    retention: RetentionPolicy,
}

impl RoomStore {
    /// Creates an empty store with the given retention policy.
    pub fn new(retention: RetentionPolicy) -> Self {
        Self {
            rooms: DashMap::new(),
            retention,
        }
    }

    /// Returns the retention policy in effect.
    pub fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    /// Returns the room, creating it empty if absent.
    ///
    /// Concurrent first joins to the same id resolve to the same room: the
    /// insert happens under the map's entry lock.
    pub fn get_or_create_room(&self, room_id: &RoomId) -> Arc<Room> {
        if let Some(room) = self.lookup(room_id) {
            return room;
        }

        let entry = self.rooms.entry(room_id.clone()).or_insert_with(|| {
            debug!(room = %room_id, "Room created");
            Arc::new(Room::new(room_id.clone()))
        });
        Arc::clone(&*entry)
    }

    /// Adds a member; returns false if it was already present.
    ///
    /// # Errors
    ///
    /// `StoreError::RoomNotFound` if the room does not exist.
    pub async fn add_member(
        &self,
        room_id: &RoomId,
        connection: ConnectionId,
    ) -> Result<bool, StoreError> {
        let room = self.require(room_id)?;
        let mut state = room.state.lock().await;
        if state.evicted {
            return Err(StoreError::RoomNotFound(room_id.clone()));
        }
        Ok(state.members.insert(connection))
    }

    /// Removes a member; returns false if it was not present.
    ///
    /// Removing from an absent room is a no-op. The room itself stays
    /// unless the policy evicts empty rooms.
    pub async fn remove_member(&self, room_id: &RoomId, connection: ConnectionId) -> bool {
        let Some(room) = self.lookup(room_id) else {
            return false;
        };

        let (removed, evict) = {
            let mut state = room.state.lock().await;
            let removed = state.members.remove(&connection);
            let evict = removed && self.retention.evict_empty && state.members.is_empty();
            if evict {
                state.evicted = true;
            }
            (removed, evict)
        };

        if evict {
            self.discard(&room);
        }
        removed
    }

    /// Appends a message to the room's history and returns its position.
    ///
    /// # Errors
    ///
    /// `StoreError::RoomNotFound` if the room does not exist.
    pub async fn append_message(
        &self,
        room_id: &RoomId,
        message: ChatMessage,
    ) -> Result<u64, StoreError> {
        let room = self.require(room_id)?;
        let mut state = room.state.lock().await;
        if state.evicted {
            return Err(StoreError::RoomNotFound(room_id.clone()));
        }
        Ok(state.append(message, self.retention.history_limit))
    }

    /// Point-in-time copy of the member set.
    ///
    /// # Errors
    ///
    /// `StoreError::RoomNotFound` if the room does not exist.
    pub async fn snapshot_members(
        &self,
        room_id: &RoomId,
    ) -> Result<HashSet<ConnectionId>, StoreError> {
        let room = self.require(room_id)?;
        let state = room.state.lock().await;
        Ok(state.members.clone())
    }

    /// Retained messages, oldest first.
    ///
    /// # Errors
    ///
    /// `StoreError::RoomNotFound` if the room does not exist.
    pub async fn history(&self, room_id: &RoomId) -> Result<Vec<ChatMessage>, StoreError> {
        let room = self.require(room_id)?;
        let state = room.state.lock().await;
        Ok(state.history())
    }

    /// Joins a room: create if needed, add the member and read the history,
    /// all under the room lock.
    ///
    /// Every message appended before this call is in the returned history;
    /// every message appended after it is delivered to the new member by
    /// the publisher. The delivery turn makes sure the history is handed to
    /// the transport before any of those later messages.
    pub async fn join(
        &self,
        room_id: &RoomId,
        connection: ConnectionId,
    ) -> Ordered<Vec<ChatMessage>> {
        loop {
            let room = self.get_or_create_room(room_id);
            let mut state = room.state.lock().await;

            if state.evicted {
                // Lost a race with eviction; retry against a fresh room.
                drop(state);
                self.discard(&room);
                continue;
            }

            state.members.insert(connection);
            let history = state.history();
            let turn = room.take_turn().await;
            drop(state);

            return Ordered::new(history, turn);
        }
    }

    /// Appends a message and snapshots the membership under one room lock.
    ///
    /// # Errors
    ///
    /// `StoreError::RoomNotFound` if the room does not exist.
    pub async fn publish(
        &self,
        room_id: &RoomId,
        message: ChatMessage,
    ) -> Result<Ordered<Published>, StoreError> {
        let room = self.require(room_id)?;
        let mut state = room.state.lock().await;
        if state.evicted {
            return Err(StoreError::RoomNotFound(room_id.clone()));
        }

        let seq = state.append(message.clone(), self.retention.history_limit);
        let members = state.members.iter().copied().collect();
        let turn = room.take_turn().await;
        drop(state);

        Ok(Ordered::new(
            Published {
                seq,
                message,
                members,
            },
            turn,
        ))
    }

    /// Returns true if the room currently exists.
    pub fn contains(&self, room_id: &RoomId) -> bool {
        self.rooms.contains_key(room_id)
    }

    /// Number of rooms currently allocated.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Number of members in a room (0 if absent).
    pub async fn member_count(&self, room_id: &RoomId) -> usize {
        match self.lookup(room_id) {
            Some(room) => room.member_count().await,
            None => 0,
        }
    }

    fn lookup(&self, room_id: &RoomId) -> Option<Arc<Room>> {
        self.rooms.get(room_id).map(|entry| Arc::clone(entry.value()))
    }

    fn require(&self, room_id: &RoomId) -> Result<Arc<Room>, StoreError> {
        self.lookup(room_id)
            .ok_or_else(|| StoreError::RoomNotFound(room_id.clone()))
    }

    /// Drops an evicted room from the map, unless it was already replaced.
    fn discard(&self, room: &Arc<Room>) {
        if self
            .rooms
            .remove_if(room.id(), |_, current| Arc::ptr_eq(current, room))
            .is_some()
        {
            debug!(room = %room.id(), "Empty room evicted");
        }
    }
}
