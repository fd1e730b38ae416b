use thiserror::Error;

use parley_core::{ConnectionId, DomainError, RoomId};

use crate::connections::RegistryError;
use crate::rooms::StoreError;

/// Why the engine refused or dropped an event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Handshake or room-change parameters failed validation.
    #[error("invalid input: {0}")]
    InvalidInput(#[from] DomainError),

    /// Event from a connection that is not (or not yet) in a room.
    #[error("unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// Second handshake on the same connection.
    #[error("already connected: {0}")]
    DuplicateConnection(ConnectionId),

    /// A joined connection points at a room the store does not have.
    #[error("room not found: {0}")]
    RoomNotFound(RoomId),

    /// Message body with no visible content.
    #[error("blank message")]
    BlankMessage,
}

impl From<RegistryError> for EngineError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownConnection(id) => Self::UnknownConnection(id),
            RegistryError::DuplicateConnection(id) => Self::DuplicateConnection(id),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::RoomNotFound(room) => Self::RoomNotFound(room),
        }
    }
}
