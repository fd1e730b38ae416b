//! Connection handler for individual TCP clients.
//!
//! Each accepted socket gets:
//! - a reader loop (this handler) that parses one JSON event per line and
//!   hands it to the engine
//! - a writer task that drains the connection's outbox onto the socket
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Connection errors are logged and result in graceful disconnect

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use parley_core::ConnectionId;
use parley_protocol::{
    decode_line, ClientEvent, ClientMessage, CodecError, ProtocolVersion, ServerMessage,
};

use super::outbox::{Line, Outboxes};
use crate::engine::{BroadcastEngine, Transport};

/// Per-connection limits, taken from the server configuration.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    /// Longest accepted line, newline included
    pub max_message_size: usize,
    /// Close the connection after this long without a line
    pub idle_timeout: Duration,
    /// Give up on a single socket write after this long
    pub write_timeout: Duration,
}

/// What the reader loop does after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// Reader side of one client connection.
pub struct ConnectionHandler {
    id: ConnectionId,
    peer: SocketAddr,
    reader: BufReader<OwnedReadHalf>,
    engine: Arc<BroadcastEngine>,
    outboxes: Arc<Outboxes>,
    cancel: CancellationToken,
    limits: ConnectionLimits,
}

impl ConnectionHandler {
    /// Creates a handler for an accepted socket.
    ///
    /// `cancel` stops this connection only; pass a child of the server's
    /// shutdown token.
    pub fn new(
        id: ConnectionId,
        peer: SocketAddr,
        reader: OwnedReadHalf,
        engine: Arc<BroadcastEngine>,
        outboxes: Arc<Outboxes>,
        cancel: CancellationToken,
        limits: ConnectionLimits,
    ) -> Self {
        Self {
            id,
            peer,
            reader: BufReader::new(reader),
            engine,
            outboxes,
            cancel,
            limits,
        }
    }

    /// Runs the connection until the peer leaves, misbehaves, falls behind,
    /// or the server shuts down. Always leaves the engine's state clean.
    pub async fn run(mut self, writer: OwnedWriteHalf) {
        debug!(connection = %self.id, peer = %self.peer, "New client connected");

        let outbox = self.outboxes.open(self.id, self.cancel.clone());
        let writer_task = tokio::spawn(write_loop(
            self.id,
            writer,
            outbox,
            self.limits.write_timeout,
            self.cancel.clone(),
        ));

        self.outboxes
            .emit(self.id, ServerMessage::connected(self.id));

        match self.process_messages().await {
            Ok(()) => debug!(connection = %self.id, "Client closed connection"),
            Err(e) => debug!(connection = %self.id, error = %e, "Connection closed"),
        }

        self.engine.disconnect(self.id).await;
        self.outboxes.close(self.id);
        if let Err(e) = writer_task.await {
            warn!(connection = %self.id, error = %e, "Writer task failed");
        }

        info!(connection = %self.id, peer = %self.peer, "Client disconnected");
    }

    /// Main read loop.
    async fn process_messages(&mut self) -> Result<(), ConnectionError> {
        let limits = self.limits;
        let mut raw = Vec::new();

        loop {
            raw.clear();

            let read = tokio::select! {
                _ = self.cancel.cancelled() => return Err(ConnectionError::Cancelled),
                read = timeout(
                    limits.idle_timeout,
                    read_bounded_line(&mut self.reader, &mut raw, limits.max_message_size),
                ) => read,
            };

            match read {
                Ok(Ok(0)) => return Ok(()),
                Ok(Ok(_)) => {}
                Ok(Err(ConnectionError::MessageTooLarge { size, max })) => {
                    self.outboxes.emit(
                        self.id,
                        ServerMessage::error_with_code(
                            format!("message too large (max {max} bytes)"),
                            "message_too_large",
                        ),
                    );
                    return Err(ConnectionError::MessageTooLarge { size, max });
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(ConnectionError::Timeout),
            }

            let line = match std::str::from_utf8(&raw) {
                Ok(line) => line,
                Err(e) => {
                    warn!(connection = %self.id, error = %e, "Line is not valid UTF-8");
                    self.outboxes.emit(
                        self.id,
                        ServerMessage::error_with_code(format!("invalid UTF-8: {e}"), "parse_error"),
                    );
                    continue;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            match decode_line::<ClientMessage>(line, limits.max_message_size) {
                Ok(msg) => {
                    if self.dispatch(msg).await? == Flow::Close {
                        return Ok(());
                    }
                }
                Err(CodecError::TooLarge { size, max }) => {
                    return Err(ConnectionError::MessageTooLarge { size, max });
                }
                Err(CodecError::Json(e)) => {
                    warn!(connection = %self.id, error = %e, "Unparseable line");
                    self.outboxes.emit(
                        self.id,
                        ServerMessage::error_with_code(e.to_string(), "parse_error"),
                    );
                }
            }
        }
    }

    /// Checks the protocol version and hands the event to the engine.
    async fn dispatch(&mut self, msg: ClientMessage) -> Result<Flow, ConnectionError> {
        let client = msg.protocol_version;
        if !client.is_compatible_with(&ProtocolVersion::CURRENT) {
            warn!(
                connection = %self.id,
                client_version = %client,
                server_version = %ProtocolVersion::CURRENT,
                "Protocol version mismatch"
            );
            self.outboxes.emit(
                self.id,
                ServerMessage::rejected(format!(
                    "Protocol version {} not compatible with server version {}",
                    client,
                    ProtocolVersion::CURRENT
                )),
            );
            return Err(ConnectionError::VersionMismatch {
                client,
                server: ProtocolVersion::CURRENT,
            });
        }

        let flow = match msg.event {
            ClientEvent::Disconnect => Flow::Close,
            _ => Flow::Continue,
        };
        self.engine.handle(self.id, msg.event).await;
        Ok(flow)
    }
}

/// Reads one line of at most `max` bytes into `buf`, as raw bytes.
///
/// Returns the number of bytes read; 0 means end of stream. Text decoding
/// is left to the caller so a bad line can be answered instead of closing.
async fn read_bounded_line<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max: usize,
) -> Result<usize, ConnectionError>
where
    R: AsyncBufRead + Unpin,
{
    let limit = u64::try_from(max).unwrap_or(u64::MAX).saturating_add(1);
    let read = (&mut *reader)
        .take(limit)
        .read_until(b'\n', buf)
        .await
        .map_err(|e| ConnectionError::Io(e.to_string()))?;

    if read > max {
        return Err(ConnectionError::MessageTooLarge { size: read, max });
    }
    Ok(read)
}

/// Drains the outbox onto the socket until it is closed or cancelled.
async fn write_loop(
    id: ConnectionId,
    mut writer: OwnedWriteHalf,
    mut outbox: mpsc::Receiver<Line>,
    write_timeout: Duration,
    cancel: CancellationToken,
) {
    loop {
        let line = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            line = outbox.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = timeout(write_timeout, async {
                writer.write_all(line.as_bytes()).await?;
                writer.flush().await
            }) => result,
        };

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(connection = %id, error = %e, "Write failed");
                cancel.cancel();
                break;
            }
            Err(_) => {
                warn!(connection = %id, "Write timed out");
                cancel.cancel();
                break;
            }
        }
    }

    let _ = writer.shutdown().await;
}

/// Errors that end a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Protocol version mismatch: client {client}, server {server}")]
    VersionMismatch {
        client: ProtocolVersion,
        server: ProtocolVersion,
    },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Read timeout")]
    Timeout,

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Connection cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_display() {
        let err = ConnectionError::VersionMismatch {
            client: ProtocolVersion::new(2, 0),
            server: ProtocolVersion::new(1, 0),
        };
        assert_eq!(
            err.to_string(),
            "Protocol version mismatch: client 2.0, server 1.0"
        );
    }

    #[tokio::test]
    async fn test_read_bounded_line_accepts_line_at_limit() {
        let input: &[u8] = b"abcd\nrest";
        let mut reader = BufReader::new(input);
        let mut line = Vec::new();

        let read = read_bounded_line(&mut reader, &mut line, 5).await.unwrap();
        assert_eq!(read, 5);
        assert_eq!(line, b"abcd\n");
    }

    #[tokio::test]
    async fn test_read_bounded_line_rejects_longer_line() {
        let input: &[u8] = b"abcdefgh\n";
        let mut reader = BufReader::new(input);
        let mut line = Vec::new();

        let err = read_bounded_line(&mut reader, &mut line, 4).await.unwrap_err();
        assert!(matches!(err, ConnectionError::MessageTooLarge { size: 5, max: 4 }));
    }

    #[tokio::test]
    async fn test_read_bounded_line_eof() {
        let input: &[u8] = b"";
        let mut reader = BufReader::new(input);
        let mut line = Vec::new();

        assert_eq!(read_bounded_line(&mut reader, &mut line, 16).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_read_bounded_line_keeps_invalid_utf8() {
        let input: &[u8] = b"\xff\xfe{}\n";
        let mut reader = BufReader::new(input);
        let mut line = Vec::new();

        assert_eq!(read_bounded_line(&mut reader, &mut line, 16).await.unwrap(), 5);
        assert!(std::str::from_utf8(&line).is_err());
    }
}
