//! Parley Core - Shared types for the chat relay
//!
//! This crate provides the domain types shared between
//! the relay daemon (parleyd) and its clients (parley).
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod error;
pub mod ids;
pub mod message;

// Re-exports for convenience
pub use error::{DomainError, DomainResult};
pub use ids::{ConnectionId, DisplayName, RoomId, MAX_ROOM_ID_LEN};
pub use message::ChatMessage;
