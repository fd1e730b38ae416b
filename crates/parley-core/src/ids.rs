//! Type-safe identifiers for connections, rooms and participants.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{DomainError, DomainResult};

/// Maximum length of a room identifier, in bytes.
pub const MAX_ROOM_ID_LEN: usize = 128;

// ============================================================================
// Connection Identifier
// ============================================================================

/// Opaque identifier of a transport connection.
///
/// Assigned by the transport layer when a connection is accepted. Two
/// connections never share an id within one process lifetime, even when the
/// same user reconnects under the same display name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Creates a connection id from a raw counter value.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw counter value.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

impl From<u64> for ConnectionId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

// ============================================================================
// Room Identifier
// ============================================================================

/// Identifier of a chat room.
///
/// Supplied by clients, compared case-sensitively. Any non-blank string
/// without control characters is accepted; there is no allow-list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Creates a RoomId without validation.
    ///
    /// Use [`RoomId::parse`] for client-supplied input.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Validates client-supplied input and builds a RoomId.
    ///
    /// # Errors
    ///
    /// Returns a `DomainError` if the input is blank, too long or contains
    /// control characters.
    pub fn parse(input: &str) -> DomainResult<Self> {
        validate("room", input, MAX_ROOM_ID_LEN)?;
        Ok(Self(input.to_string()))
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for RoomId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Display Name
// ============================================================================

/// Name a participant chose at connect time.
///
/// Not unique and not authenticated: two connections may use the same name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DisplayName(String);

impl DisplayName {
    /// Creates a DisplayName without validation.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Validates client-supplied input and builds a DisplayName.
    ///
    /// Only emptiness is checked; names are otherwise taken as given.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Blank` if the input is empty or whitespace only.
    pub fn parse(input: &str) -> DomainResult<Self> {
        if input.trim().is_empty() {
            return Err(DomainError::Blank { field: "username" });
        }
        Ok(Self(input.to_string()))
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DisplayName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DisplayName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

fn validate(field: &'static str, input: &str, max: usize) -> DomainResult<()> {
    if input.trim().is_empty() {
        return Err(DomainError::Blank { field });
    }
    if input.len() > max {
        return Err(DomainError::TooLong {
            field,
            len: input.len(),
            max,
        });
    }
    if input.chars().any(char::is_control) {
        return Err(DomainError::ControlCharacters { field });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId::new(7).to_string(), "conn-7");
        assert_eq!(ConnectionId::from(7).get(), 7);
    }

    #[test]
    fn test_room_id_parse_accepts_case_sensitive_names() {
        let lower = RoomId::parse("general").unwrap();
        let upper = RoomId::parse("General").unwrap();
        assert_ne!(lower, upper);
        assert_eq!(lower.as_str(), "general");
    }

    #[test]
    fn test_room_id_parse_rejects_blank() {
        assert_eq!(
            RoomId::parse(""),
            Err(DomainError::Blank { field: "room" })
        );
        assert_eq!(
            RoomId::parse("   \t"),
            Err(DomainError::Blank { field: "room" })
        );
    }

    #[test]
    fn test_room_id_parse_rejects_control_characters() {
        assert!(matches!(
            RoomId::parse("gen\neral"),
            Err(DomainError::ControlCharacters { .. })
        ));
    }

    #[test]
    fn test_room_id_parse_rejects_long_input() {
        let long = "r".repeat(MAX_ROOM_ID_LEN + 1);
        assert!(matches!(
            RoomId::parse(&long),
            Err(DomainError::TooLong { max: MAX_ROOM_ID_LEN, .. })
        ));
        assert!(RoomId::parse(&"r".repeat(MAX_ROOM_ID_LEN)).is_ok());
    }

    #[test]
    fn test_display_name_parse() {
        assert_eq!(DisplayName::parse("alice").unwrap().as_str(), "alice");
        assert_eq!(
            DisplayName::parse(" "),
            Err(DomainError::Blank { field: "username" })
        );
    }

    #[test]
    fn test_display_name_content_is_not_restricted() {
        let long = "n".repeat(500);
        assert_eq!(DisplayName::parse(&long).unwrap().as_str(), long);
        assert!(DisplayName::parse("tab\there").is_ok());
        assert!(DisplayName::parse("émoji 🎉").is_ok());
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let json = serde_json::to_string(&RoomId::new("general")).unwrap();
        assert_eq!(json, "\"general\"");

        let json = serde_json::to_string(&ConnectionId::new(3)).unwrap();
        assert_eq!(json, "3");
    }
}
