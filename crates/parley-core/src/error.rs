//! Domain-specific error types following panic-free policy.

use thiserror::Error;

/// Errors that can occur when validating domain values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A required field was empty or whitespace only
    #[error("{field} must not be blank")]
    Blank { field: &'static str },

    /// A field exceeded its maximum length
    #[error("{field} is too long ({len} bytes, max {max})")]
    TooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    /// A field contained control characters (newlines, NUL, ...)
    #[error("{field} contains control characters")]
    ControlCharacters { field: &'static str },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_error_display() {
        let err = DomainError::Blank { field: "room" };
        assert_eq!(err.to_string(), "room must not be blank");

        let err = DomainError::TooLong {
            field: "room",
            len: 200,
            max: 128,
        };
        assert_eq!(err.to_string(), "room is too long (200 bytes, max 128)");
    }
}
