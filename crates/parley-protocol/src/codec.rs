//! Line framing: one JSON document per `\n`-terminated line.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Default maximum size of one line, in bytes.
pub const MAX_LINE_SIZE: usize = 65_536;

/// Errors raised while framing or parsing a line.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("line too large: {size} bytes (max: {max})")]
    TooLarge { size: usize, max: usize },

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serializes `value` as a single line, newline included.
///
/// # Errors
///
/// Returns `CodecError::Json` if the value cannot be serialized.
pub fn encode_line<T: Serialize>(value: &T) -> Result<String, CodecError> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    Ok(line)
}

/// Parses one line, enforcing `max` bytes.
///
/// Trailing `\r\n` or `\n` is ignored.
///
/// # Errors
///
/// Returns `CodecError::TooLarge` before attempting to parse an oversized
/// line, or `CodecError::Json` if it is not a valid message.
pub fn decode_line<T: DeserializeOwned>(line: &str, max: usize) -> Result<T, CodecError> {
    if line.len() > max {
        return Err(CodecError::TooLarge {
            size: line.len(),
            max,
        });
    }
    let trimmed = line.trim_end_matches(['\n', '\r']);
    Ok(serde_json::from_str(trimmed)?)
}
