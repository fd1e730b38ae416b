//! Chat message value object.

use serde::{Deserialize, Serialize};

use crate::ids::DisplayName;

/// A message as retained in room history and exchanged with clients.
///
/// Wire shape: `{"username": string, "message": string}`. The position of a
/// message in its room's history is implicit and never carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Display name of the sender
    pub username: String,

    /// Message body
    pub message: String,
}

impl ChatMessage {
    /// Creates a message sent by `sender`.
    pub fn new(sender: &DisplayName, body: impl Into<String>) -> Self {
        Self {
            username: sender.as_str().to_string(),
            message: body.into(),
        }
    }

    /// Returns true if the body has no visible content.
    pub fn is_blank(&self) -> bool {
        self.message.trim().is_empty()
    }
}
