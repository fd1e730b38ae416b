//! Protocol message types for relay communication.

use crate::version::ProtocolVersion;
use parley_core::{ChatMessage, ConnectionId, RoomId};
use serde::{Deserialize, Serialize};

/// Events a client can send to the relay.
///
/// The set is closed: the relay dispatches on the variant, never on a
/// free-form event name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Handshake: join `room` as `username`
    Connect {
        /// Display name to use in the room
        username: String,
        /// Room to join
        room: String,
    },

    /// Post a message to the current room
    SendMessage {
        /// Sender name as claimed by the client.
        ///
        /// Ignored by the relay, which uses the name registered at connect.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        /// Message body
        message: String,
    },

    /// Leave the current room and join another one
    ChangeRoom {
        /// Room to switch to
        room: String,
    },

    /// Ping to check connection
    Ping {
        /// Sequence number for matching pong response
        seq: u64,
    },

    /// Client disconnecting gracefully
    Disconnect,
}

impl ClientEvent {
    /// Returns the wire name of the event, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::SendMessage { .. } => "send-message",
            Self::ChangeRoom { .. } => "change-room",
            Self::Ping { .. } => "ping",
            Self::Disconnect => "disconnect",
        }
    }
}

/// Messages sent from client to relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMessage {
    /// Protocol version (clients that omit it are assumed current)
    #[serde(default)]
    pub protocol_version: ProtocolVersion,

    /// Event payload
    #[serde(flatten)]
    pub event: ClientEvent,
}

impl ClientMessage {
    /// Creates a new client message with current protocol version.
    pub fn new(event: ClientEvent) -> Self {
        Self {
            protocol_version: ProtocolVersion::CURRENT,
            event,
        }
    }

    /// Creates a connect (handshake) message.
    pub fn connect(username: impl Into<String>, room: impl Into<String>) -> Self {
        Self::new(ClientEvent::Connect {
            username: username.into(),
            room: room.into(),
        })
    }

    /// Creates a send-message event without a claimed sender name.
    pub fn send_message(message: impl Into<String>) -> Self {
        Self::new(ClientEvent::SendMessage {
            username: None,
            message: message.into(),
        })
    }

    /// Creates a change-room event.
    pub fn change_room(room: impl Into<String>) -> Self {
        Self::new(ClientEvent::ChangeRoom { room: room.into() })
    }

    /// Creates a ping message.
    pub fn ping(seq: u64) -> Self {
        Self::new(ClientEvent::Ping { seq })
    }

    /// Creates a disconnect message.
    pub fn disconnect() -> Self {
        Self::new(ClientEvent::Disconnect)
    }
}

/// Messages sent from the relay to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Transport connection accepted; sent before any client event is read
    Connected {
        /// Relay's protocol version
        protocol_version: ProtocolVersion,
        /// Id the transport assigned to this connection
        connection_id: ConnectionId,
    },

    /// A connect or change-room attempt was refused
    Rejected {
        /// Reason for rejection
        reason: String,
        /// Relay's protocol version (for client to upgrade)
        protocol_version: ProtocolVersion,
    },

    /// History of the room just joined, oldest first
    CurrentMessages {
        /// Room the history belongs to
        room: RoomId,
        /// Retained messages in append order
        messages: Vec<ChatMessage>,
    },

    /// A new message posted to the current room
    ReceiveMessage(ChatMessage),

    /// Pong response to ping
    Pong {
        /// Sequence number from ping
        seq: u64,
    },

    /// Protocol-level error (unparseable line, version mismatch, ...)
    Error {
        /// Error message
        message: String,
        /// Error code (optional)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl ServerMessage {
    /// Creates a connected response.
    pub fn connected(connection_id: ConnectionId) -> Self {
        Self::Connected {
            protocol_version: ProtocolVersion::CURRENT,
            connection_id,
        }
    }

    /// Creates a rejected response.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
            protocol_version: ProtocolVersion::CURRENT,
        }
    }

    /// Creates a history delivery.
    pub fn current_messages(room: RoomId, messages: Vec<ChatMessage>) -> Self {
        Self::CurrentMessages { room, messages }
    }

    /// Creates a broadcast of one new message.
    pub fn receive_message(message: ChatMessage) -> Self {
        Self::ReceiveMessage(message)
    }

    /// Creates a pong response.
    pub fn pong(seq: u64) -> Self {
        Self::Pong { seq }
    }

    /// Creates an error response.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            code: None,
        }
    }

    /// Creates an error response with code.
    pub fn error_with_code(message: impl Into<String>, code: &str) -> Self {
        Self::Error {
            message: message.into(),
            code: Some(code.to_string()),
        }
    }

    /// Returns the wire name of the message, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Rejected { .. } => "rejected",
            Self::CurrentMessages { .. } => "current-messages",
            Self::ReceiveMessage(_) => "receive-message",
            Self::Pong { .. } => "pong",
            Self::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::DisplayName;
    use serde_json::json;

    #[test]
    fn test_send_message_event_name() {
        let msg = ClientMessage::send_message("hi");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "send-message");
        assert_eq!(json["message"], "hi");
        assert!(json.get("username").is_none());
    }

    #[test]
    fn test_send_message_accepts_claimed_username() {
        let line = r#"{"type":"send-message","username":"alice","message":"hi"}"#;
        let parsed: ClientMessage = serde_json::from_str(line).unwrap();

        assert_eq!(parsed.protocol_version, ProtocolVersion::CURRENT);
        assert_eq!(
            parsed.event,
            ClientEvent::SendMessage {
                username: Some("alice".to_string()),
                message: "hi".to_string(),
            }
        );
    }

    #[test]
    fn test_connect_carries_handshake_params() {
        let line = r#"{"protocol_version":{"major":1,"minor":2},"type":"connect","username":"bob","room":"general"}"#;
        let parsed: ClientMessage = serde_json::from_str(line).unwrap();

        assert_eq!(parsed.protocol_version, ProtocolVersion::new(1, 2));
        assert_eq!(parsed.event.name(), "connect");
    }

    #[test]
    fn test_unknown_event_type_is_rejected() {
        let line = r#"{"type":"shout","message":"hi"}"#;
        assert!(serde_json::from_str::<ClientMessage>(line).is_err());
    }

    #[test]
    fn test_receive_message_wire_shape() {
        let msg = ServerMessage::receive_message(ChatMessage::new(&DisplayName::new("alice"), "hi"));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            json!({"type": "receive-message", "username": "alice", "message": "hi"})
        );
    }

    #[test]
    fn test_current_messages_wire_shape() {
        let msg = ServerMessage::current_messages(
            RoomId::new("general"),
            vec![ChatMessage::new(&DisplayName::new("alice"), "hi")],
        );
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            json!({
                "type": "current-messages",
                "room": "general",
                "messages": [{"username": "alice", "message": "hi"}]
            })
        );
    }

    #[test]
    fn test_server_message_roundtrip() {
        let original = ServerMessage::connected(ConnectionId::new(12));
        let json = serde_json::to_string(&original).unwrap();
        let parsed: ServerMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, original);
        assert_eq!(parsed.name(), "connected");
    }
}
