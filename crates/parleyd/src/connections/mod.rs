//! Connection registry: who is connected, under which name, in which room.
//!
//! Entries are created when a connection completes its handshake and
//! removed on disconnect. Membership itself lives in the room store; the
//! engine keeps the two in step.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()` in production code
//! - Unknown ids surface as `RegistryError::UnknownConnection`
//! - Map guards are never held across an `.await`

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;

use parley_core::{ConnectionId, DisplayName, RoomId};

// ============================================================================
// Client Record
// ============================================================================

/// Lifecycle state of a registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Registered, room join in progress; events are not accepted yet
    Connecting,
    /// Member of its current room
    Joined,
}

/// A registered connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
    /// Transport-assigned id
    pub id: ConnectionId,
    /// Name shown on this client's messages
    pub display_name: DisplayName,
    /// Room the client is in (or joining)
    pub room: RoomId,
    /// Lifecycle state
    pub state: ClientState,
}

impl Client {
    /// Returns true once the client may send messages.
    pub fn is_joined(&self) -> bool {
        self.state == ClientState::Joined
    }
}

/// Errors returned by the connection registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The id is not registered, or has not finished joining.
    #[error("unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// The id is already registered.
    #[error("connection already registered: {0}")]
    DuplicateConnection(ConnectionId),
}

// ============================================================================
// Registry
// ============================================================================

/// Map from connection id to client record.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    clients: DashMap<ConnectionId, Client>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection in the `Connecting` state.
    ///
    /// # Errors
    ///
    /// `RegistryError::DuplicateConnection` if the id is already present;
    /// the existing record is left untouched.
    pub fn register(
        &self,
        id: ConnectionId,
        display_name: DisplayName,
        room: RoomId,
    ) -> Result<(), RegistryError> {
        match self.clients.entry(id) {
            Entry::Occupied(_) => Err(RegistryError::DuplicateConnection(id)),
            Entry::Vacant(slot) => {
                slot.insert(Client {
                    id,
                    display_name,
                    room,
                    state: ClientState::Connecting,
                });
                Ok(())
            }
        }
    }

    /// Room of a joined connection.
    ///
    /// # Errors
    ///
    /// `RegistryError::UnknownConnection` if absent or still connecting.
    pub fn current_room(&self, id: ConnectionId) -> Result<RoomId, RegistryError> {
        self.joined(id, |client| client.room.clone())
    }

    /// Display name and room of a joined connection.
    ///
    /// # Errors
    ///
    /// `RegistryError::UnknownConnection` if absent or still connecting.
    pub fn identity(&self, id: ConnectionId) -> Result<(DisplayName, RoomId), RegistryError> {
        self.joined(id, |client| (client.display_name.clone(), client.room.clone()))
    }

    /// Moves a connection to `Joined`.
    ///
    /// # Errors
    ///
    /// `RegistryError::UnknownConnection` if it disconnected meanwhile.
    pub fn mark_joined(&self, id: ConnectionId) -> Result<(), RegistryError> {
        let mut client = self
            .clients
            .get_mut(&id)
            .ok_or(RegistryError::UnknownConnection(id))?;
        client.state = ClientState::Joined;
        Ok(())
    }

    /// Points a joined connection at `new_room` and returns the room it
    /// was in. The connection is `Connecting` until marked joined again.
    ///
    /// # Errors
    ///
    /// `RegistryError::UnknownConnection` if absent or not joined.
    pub fn begin_room_change(
        &self,
        id: ConnectionId,
        new_room: RoomId,
    ) -> Result<RoomId, RegistryError> {
        let mut client = self
            .clients
            .get_mut(&id)
            .filter(|client| client.is_joined())
            .ok_or(RegistryError::UnknownConnection(id))?;
        client.state = ClientState::Connecting;
        Ok(std::mem::replace(&mut client.room, new_room))
    }

    /// Removes a connection and returns its last record.
    ///
    /// Returns `None` if it was not registered.
    pub fn unregister(&self, id: ConnectionId) -> Option<Client> {
        self.clients.remove(&id).map(|(_, client)| client)
    }

    /// Copy of a connection's record, in any state.
    pub fn get(&self, id: ConnectionId) -> Option<Client> {
        self.clients.get(&id).map(|entry| entry.value().clone())
    }

    /// Joined connections whose current room is `room`.
    pub fn connections_in(&self, room: &RoomId) -> Vec<ConnectionId> {
        self.clients
            .iter()
            .filter(|entry| entry.is_joined() && &entry.room == room)
            .map(|entry| *entry.key())
            .collect()
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    fn joined<T>(&self, id: ConnectionId, read: impl FnOnce(&Client) -> T) -> Result<T, RegistryError> {
        self.clients
            .get(&id)
            .filter(|entry| entry.is_joined())
            .map(|entry| read(entry.value()))
            .ok_or(RegistryError::UnknownConnection(id))
    }
}
