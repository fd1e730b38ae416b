//! The message list a client shows for its current room.

use parley_core::{ChatMessage, RoomId};

use crate::client::Update;

/// Effective message list: history replaces it, broadcasts append to it.
///
/// Messages with a blank body are never shown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript {
    room: Option<RoomId>,
    messages: Vec<ChatMessage>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Room the list belongs to, once history has arrived.
    pub fn room(&self) -> Option<&RoomId> {
        self.room.as_ref()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Folds one update in. Returns true if the list changed.
    pub fn apply(&mut self, update: &Update) -> bool {
        match update {
            Update::History { room, messages } => {
                self.room = Some(room.clone());
                self.messages = messages.iter().filter(|m| !m.is_blank()).cloned().collect();
                true
            }
            Update::Message(message) if !message.is_blank() => {
                self.messages.push(message.clone());
                true
            }
            _ => false,
        }
    }
}
