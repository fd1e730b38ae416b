//! Parley Client - Library for talking to the chat relay
//!
//! # Architecture
//!
//! The client runs as a task next to the caller's UI loop:
//!
//! 1. **Caller** sends [`Command`]s (say something, change room, quit)
//! 2. **`ChatClient`** keeps a connection to the relay, reconnecting with
//!    exponential backoff, and forwards [`Update`]s back
//! 3. **[`Transcript`]** folds updates into the list of messages to show
//!
//! All tasks respect a shared `CancellationToken` for graceful shutdown.

pub mod client;
pub mod error;
pub mod transcript;

// Re-export commonly used types
pub use client::{ChatClient, ClientConfig, Command, Update};
pub use error::{ClientError, Result};
pub use transcript::Transcript;
