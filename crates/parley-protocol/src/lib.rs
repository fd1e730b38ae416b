//! Parley Protocol - Wire protocol for relay communication
//!
//! This crate provides the message types exchanged between chat clients
//! and the relay daemon. Messages are JSON objects, one per line, tagged
//! by a `type` field carrying the event name (`send-message`,
//! `receive-message`, `current-messages`, ...).

pub mod codec;
pub mod message;
pub mod version;

pub use codec::{decode_line, encode_line, CodecError, MAX_LINE_SIZE};
pub use message::{ClientEvent, ClientMessage, ServerMessage};
pub use version::{ProtocolVersion, VersionError};
