//! Relay connection client.
//!
//! This module provides the `ChatClient` which handles:
//! - Connection to the relay over TCP
//! - Automatic reconnection with exponential backoff
//! - The `connected` / `connect` / `current-messages` handshake
//! - Forwarding relay messages to the caller as [`Update`]s
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ClientError, Result};
use parley_core::{ChatMessage, ConnectionId, RoomId};
use parley_protocol::{
    decode_line, encode_line, ClientMessage, ProtocolVersion, ServerMessage,
};

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the chat client.
///
/// # Example
///
/// ```rust
/// use parley_client::ClientConfig;
/// use std::time::Duration;
///
/// let config = ClientConfig {
///     username: "alice".to_string(),
///     room: "general".to_string(),
///     retry_initial_delay: Duration::from_millis(500),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay address, `host:port`.
    pub addr: String,

    /// Display name sent with `connect`.
    pub username: String,

    /// Room joined on every (re)connect until a room change succeeds.
    pub room: String,

    /// Initial delay before first retry after connection failure.
    pub retry_initial_delay: Duration,

    /// Maximum delay between retry attempts.
    pub retry_max_delay: Duration,

    /// Multiplier for exponential backoff (e.g., 2.0 doubles delay each retry).
    pub retry_multiplier: f64,

    /// Largest line accepted from the relay, in bytes.
    ///
    /// History for a busy room arrives as one line, so this is generous.
    pub max_line_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8081".to_string(),
            username: String::new(),
            room: "general".to_string(),
            retry_initial_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
            retry_multiplier: 2.0,
            max_line_size: 64 * 1024 * 1024,
        }
    }
}

// ============================================================================
// Channel Types
// ============================================================================

/// Requests from the caller to the client task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Post a message to the current room.
    Say(String),
    /// Leave the current room and join another.
    ChangeRoom(String),
    /// Send `disconnect` and stop.
    Quit,
}

/// Notifications from the client task to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    /// Transport accepted by the relay.
    Connected { connection_id: ConnectionId },
    /// Full history of the room just joined. Replaces anything shown before.
    History {
        room: RoomId,
        messages: Vec<ChatMessage>,
    },
    /// New message in the current room.
    Message(ChatMessage),
    /// A room change was refused; the client stays where it was.
    Rejected(String),
    /// Protocol-level error reported by the relay.
    ServerError {
        message: String,
        code: Option<String>,
    },
    /// Connection lost; a reconnect follows unless the client is stopping.
    Disconnected,
}

/// How a connection ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    /// Socket closed or caller went away; reconnect.
    Lost,
    /// Quit requested or cancelled; stop.
    Stop,
}

// ============================================================================
// Chat Client
// ============================================================================

/// Client for talking to the relay.
///
/// # Connection Lifecycle
///
/// 1. Client opens a TCP connection, retrying with exponential backoff
/// 2. Reads the `connected` greeting and checks the protocol version
/// 3. Sends `connect` with the configured name and current room
/// 4. Waits for `current-messages` (or `rejected`, which is fatal)
/// 5. Forwards messages and sends commands until the socket closes
/// 6. On disconnect, notifies the caller and starts over at step 1
///
/// # Example
///
/// ```rust,ignore
/// use parley_client::{ChatClient, ClientConfig};
/// use tokio::sync::mpsc;
/// use tokio_util::sync::CancellationToken;
///
/// let (update_tx, update_rx) = mpsc::unbounded_channel();
/// let (command_tx, command_rx) = mpsc::unbounded_channel();
/// let client = ChatClient::new(config, update_tx, command_rx, CancellationToken::new());
///
/// tokio::spawn(async move { client.run().await });
/// ```
pub struct ChatClient {
    /// Configuration for connection behavior.
    config: ClientConfig,

    /// Channel to send updates to the caller.
    update_tx: mpsc::UnboundedSender<Update>,

    /// Channel to receive commands from the caller.
    command_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Command>>,

    /// Cancellation token for graceful shutdown.
    cancel_token: CancellationToken,
}

impl ChatClient {
    /// Creates a new chat client.
    #[must_use]
    pub fn new(
        config: ClientConfig,
        update_tx: mpsc::UnboundedSender<Update>,
        command_rx: mpsc::UnboundedReceiver<Command>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            config,
            update_tx,
            command_rx: tokio::sync::Mutex::new(command_rx),
            cancel_token,
        }
    }

    /// Main loop that keeps the client connected.
    ///
    /// Runs until the caller quits, the token is cancelled, or the relay
    /// refuses the handshake.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Rejected` or `ClientError::VersionMismatch` when
    /// reconnecting cannot succeed. Transient failures are retried.
    pub async fn run(&self) -> Result<()> {
        info!(
            addr = %self.config.addr,
            username = %self.config.username,
            "Chat client starting"
        );

        // Follows successful room changes so a reconnect lands in the same room.
        let mut room = self.config.room.clone();

        loop {
            if self.cancel_token.is_cancelled() {
                info!("Chat client shutting down (cancelled)");
                return Ok(());
            }

            let stream = match self.connect_with_retry().await {
                Ok(stream) => stream,
                Err(e) => {
                    if !self.cancel_token.is_cancelled() {
                        error!(error = %e, "Failed to connect to relay");
                    }
                    continue;
                }
            };
            info!(addr = %self.config.addr, "Connected to relay");

            let outcome = self.handle_connection(stream, &mut room).await;

            // Ignore send errors; the caller may be shutting down.
            let _ = self.update_tx.send(Update::Disconnected);

            match outcome {
                Ok(Exit::Stop) => {
                    info!("Chat client stopped");
                    return Ok(());
                }
                Ok(Exit::Lost) => {
                    info!("Connection to relay lost, reconnecting");
                }
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "Relay refused the handshake");
                    return Err(e);
                }
                Err(e) => {
                    warn!(error = %e, "Connection ended with error");
                }
            }
        }
    }

    /// Attempts to connect with exponential backoff.
    ///
    /// Retries indefinitely until successful or cancelled.
    async fn connect_with_retry(&self) -> Result<TcpStream> {
        let mut delay = self.config.retry_initial_delay;
        let mut attempt = 0u32;

        loop {
            attempt = attempt.saturating_add(1);
            debug!(attempt, addr = %self.config.addr, "Attempting to connect to relay");

            match TcpStream::connect(&self.config.addr).await {
                Ok(stream) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(error = %e, "Failed to set TCP_NODELAY");
                    }
                    debug!(attempt, "Connection successful");
                    return Ok(stream);
                }
                Err(e) => {
                    if attempt == 1 {
                        warn!(addr = %self.config.addr, error = %e, "Relay not reachable, will retry");
                    } else {
                        debug!(attempt, error = %e, "Connection attempt failed");
                    }
                }
            }

            tokio::select! {
                _ = sleep(delay) => {
                    let next_delay_ms = (delay.as_millis() as f64 * self.config.retry_multiplier) as u64;
                    delay = Duration::from_millis(next_delay_ms).min(self.config.retry_max_delay);
                }
                _ = self.cancel_token.cancelled() => {
                    info!("Connection retry cancelled");
                    return Err(ClientError::Connection("cancelled".to_string()));
                }
            }
        }
    }

    /// Runs the handshake, then the message loop, on one connection.
    async fn handle_connection(&self, stream: TcpStream, room: &mut String) -> Result<Exit> {
        let (reader, mut writer) = stream.into_split();
        let (mut inbound, reader_task) =
            spawn_reader(BufReader::new(reader), self.config.max_line_size);

        let outcome = self.converse(&mut inbound, &mut writer, room).await;
        reader_task.abort();
        outcome
    }

    async fn converse<W>(&self, inbound: &mut Inbound, writer: &mut W, room: &mut String) -> Result<Exit>
    where
        W: AsyncWriteExt + Unpin,
    {
        let joined = tokio::select! {
            result = self.handshake(inbound, writer, room.as_str()) => result?,
            _ = self.cancel_token.cancelled() => return Ok(Exit::Stop),
        };
        if !joined {
            return Ok(Exit::Lost);
        }

        self.message_loop(inbound, writer, room).await
    }

    /// Greeting, version check and join.
    ///
    /// Returns `Ok(false)` if the relay hung up part way through.
    async fn handshake<W>(&self, inbound: &mut Inbound, writer: &mut W, room: &str) -> Result<bool>
    where
        W: AsyncWriteExt + Unpin,
    {
        let Some(greeting) = inbound.recv().await.transpose()? else {
            return Ok(false);
        };
        match greeting {
            ServerMessage::Connected {
                protocol_version,
                connection_id,
            } => {
                if !ProtocolVersion::CURRENT.is_compatible_with(&protocol_version) {
                    return Err(ClientError::VersionMismatch {
                        client_version: ProtocolVersion::CURRENT.to_string(),
                        server_version: protocol_version.to_string(),
                    });
                }
                info!(
                    connection_id = %connection_id,
                    protocol_version = %protocol_version,
                    "Greeting received"
                );
                let _ = self.update_tx.send(Update::Connected { connection_id });
            }
            ServerMessage::Rejected { reason, .. } => {
                // Turned away before joining, e.g. the relay is full.
                return Err(ClientError::Connection(reason));
            }
            other => {
                return Err(ClientError::ProtocolError(format!(
                    "Unexpected greeting: {}",
                    other.name()
                )));
            }
        }

        let hello = ClientMessage::connect(self.config.username.as_str(), room);
        self.send_message(writer, &hello).await?;

        loop {
            let Some(message) = inbound.recv().await.transpose()? else {
                return Ok(false);
            };
            match message {
                ServerMessage::CurrentMessages { room, messages } => {
                    info!(room = %room, history = messages.len(), "Joined room");
                    let _ = self.update_tx.send(Update::History { room, messages });
                    return Ok(true);
                }
                ServerMessage::Rejected {
                    reason,
                    protocol_version,
                } => {
                    if !ProtocolVersion::CURRENT.is_compatible_with(&protocol_version) {
                        return Err(ClientError::VersionMismatch {
                            client_version: ProtocolVersion::CURRENT.to_string(),
                            server_version: protocol_version.to_string(),
                        });
                    }
                    return Err(ClientError::Rejected(reason));
                }
                other => self.handle_message(other),
            }
        }
    }

    /// Sends a message to the relay as one line.
    async fn send_message<W: AsyncWriteExt + Unpin>(
        &self,
        writer: &mut W,
        message: &ClientMessage,
    ) -> Result<()> {
        let line = encode_line(message)?;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        debug!(event = message.event.name(), "Sent message to relay");
        Ok(())
    }

    /// Main message loop that handles both relay messages and caller commands.
    async fn message_loop<W>(&self, inbound: &mut Inbound, writer: &mut W, room: &mut String) -> Result<Exit>
    where
        W: AsyncWriteExt + Unpin,
    {
        loop {
            if self.cancel_token.is_cancelled() {
                debug!("Message loop cancelled");
                return Ok(Exit::Stop);
            }

            let mut command_rx = self.command_rx.lock().await;

            tokio::select! {
                received = inbound.recv() => {
                    drop(command_rx);
                    match received {
                        None => {
                            info!("Relay closed connection");
                            return Ok(Exit::Lost);
                        }
                        Some(Ok(ServerMessage::CurrentMessages { room: joined, messages })) => {
                            info!(room = %joined, history = messages.len(), "Changed room");
                            *room = joined.as_str().to_string();
                            let _ = self.update_tx.send(Update::History { room: joined, messages });
                        }
                        Some(Ok(message)) => self.handle_message(message),
                        Some(Err(ClientError::Codec(e))) => {
                            // Don't disconnect on a single bad line.
                            warn!(error = %e, "Failed to handle message");
                        }
                        Some(Err(e)) => return Err(e),
                    }
                }

                command = command_rx.recv() => {
                    drop(command_rx);
                    let message = match command {
                        Some(Command::Say(body)) => ClientMessage::send_message(body),
                        Some(Command::ChangeRoom(target)) => {
                            debug!(room = %target, "Requesting room change");
                            ClientMessage::change_room(target)
                        }
                        Some(Command::Quit) | None => {
                            debug!("Quit requested");
                            if let Err(e) = self.send_message(writer, &ClientMessage::disconnect()).await {
                                debug!(error = %e, "Failed to send disconnect");
                            }
                            return Ok(Exit::Stop);
                        }
                    };
                    self.send_message(writer, &message).await?;
                }

                _ = self.cancel_token.cancelled() => {
                    drop(command_rx);
                    debug!("Message loop cancelled during select");
                    return Ok(Exit::Stop);
                }
            }
        }
    }

    /// Forwards a message that needs no connection-level handling.
    fn handle_message(&self, message: ServerMessage) {
        let update = match message {
            ServerMessage::ReceiveMessage(chat) => Update::Message(chat),
            ServerMessage::CurrentMessages { room, messages } => Update::History { room, messages },
            ServerMessage::Rejected { reason, .. } => {
                warn!(reason = %reason, "Request rejected by relay");
                Update::Rejected(reason)
            }
            ServerMessage::Error { message, code } => {
                warn!(
                    error_message = %message,
                    error_code = ?code,
                    "Received error from relay"
                );
                Update::ServerError { message, code }
            }
            ServerMessage::Pong { seq } => {
                debug!(seq, "Received pong");
                return;
            }
            ServerMessage::Connected { .. } => {
                warn!("Received unexpected greeting after handshake");
                return;
            }
        };
        let _ = self.update_tx.send(update);
    }
}

// ============================================================================
// Socket Reader
// ============================================================================

/// Relay messages in arrival order; closed at end of stream.
type Inbound = mpsc::Receiver<Result<ServerMessage>>;

/// Lines buffered between the socket reader and the client loop.
const INBOUND_CAPACITY: usize = 64;

/// Reads relay lines on a task of its own.
///
/// Lines are only ever read here, never inside a `select!`, so a line that
/// arrives in pieces is not lost when the client loop wakes up for a
/// command. The channel closes at end of stream or after an I/O error.
fn spawn_reader<R>(mut reader: R, max_line_size: usize) -> (Inbound, JoinHandle<()>)
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
    let handle = tokio::spawn(async move {
        let mut line = String::new();
        loop {
            line.clear();
            let item = match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) if line.trim().is_empty() => continue,
                Ok(_) => decode_line::<ServerMessage>(line.as_str(), max_line_size)
                    .map_err(ClientError::from),
                Err(e) => {
                    let _ = tx.send(Err(ClientError::Io(e))).await;
                    break;
                }
            };
            if tx.send(item).await.is_err() {
                break;
            }
        }
        debug!("Relay reader finished");
    });
    (rx, handle)
}

impl std::fmt::Debug for ChatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatClient")
            .field("config", &self.config)
            .field("cancelled", &self.cancel_token.is_cancelled())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use parley_protocol::MAX_LINE_SIZE;

    #[test]
    fn test_config_default() {
        let config = ClientConfig::default();
        assert_eq!(config.addr, "127.0.0.1:8081");
        assert_eq!(config.room, "general");
        assert_eq!(config.retry_initial_delay, Duration::from_secs(1));
        assert_eq!(config.retry_max_delay, Duration::from_secs(30));
        assert!((config.retry_multiplier - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_config_custom() {
        let config = ClientConfig {
            username: "alice".to_string(),
            retry_initial_delay: Duration::from_millis(500),
            ..Default::default()
        };
        assert_eq!(config.username, "alice");
        assert_eq!(config.retry_initial_delay, Duration::from_millis(500));
        assert_eq!(config.retry_max_delay, Duration::from_secs(30));
    }

    fn client() -> (
        ChatClient,
        mpsc::UnboundedReceiver<Update>,
        mpsc::UnboundedSender<Command>,
    ) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let config = ClientConfig {
            username: "alice".to_string(),
            ..Default::default()
        };
        let client = ChatClient::new(config, update_tx, command_rx, CancellationToken::new());
        (client, update_rx, command_tx)
    }

    #[test]
    fn test_client_debug() {
        let (client, _updates, _commands) = client();
        let debug = format!("{client:?}");
        assert!(debug.contains("ChatClient"));
        assert!(debug.contains("alice"));
    }

    #[test]
    fn test_handle_message_forwards_chat() {
        let (client, mut updates, _commands) = client();
        let chat = ChatMessage::new(&parley_core::DisplayName::new("bob"), "hi");

        client.handle_message(ServerMessage::receive_message(chat.clone()));
        client.handle_message(ServerMessage::pong(1));
        client.handle_message(ServerMessage::error_with_code("bad", "parse_error"));

        assert_eq!(updates.try_recv().unwrap(), Update::Message(chat));
        assert_eq!(
            updates.try_recv().unwrap(),
            Update::ServerError {
                message: "bad".to_string(),
                code: Some("parse_error".to_string()),
            }
        );
        assert!(updates.try_recv().is_err(), "pong is not forwarded");
    }

    fn scripted(script: String) -> (Inbound, JoinHandle<()>) {
        let reader = BufReader::new(std::io::Cursor::new(script.into_bytes()));
        spawn_reader(reader, MAX_LINE_SIZE)
    }

    #[tokio::test]
    async fn test_handshake_rejected_is_fatal() {
        let (client, mut updates, _commands) = client();
        let script = [
            encode_line(&ServerMessage::connected(ConnectionId::new(3))).unwrap(),
            encode_line(&ServerMessage::rejected("room must not be blank")).unwrap(),
        ]
        .concat();
        let (mut inbound, _reader) = scripted(script);
        let mut sent = Vec::new();

        let err = client
            .handshake(&mut inbound, &mut sent, " ")
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Rejected(_)));
        assert!(err.is_fatal());

        assert_eq!(
            updates.try_recv().unwrap(),
            Update::Connected {
                connection_id: ConnectionId::new(3)
            }
        );
        let sent = String::from_utf8(sent).unwrap();
        assert!(sent.contains("\"type\":\"connect\""));
    }

    #[tokio::test]
    async fn test_handshake_incompatible_version() {
        let (client, _updates, _commands) = client();
        let greeting = ServerMessage::Connected {
            protocol_version: ProtocolVersion::new(9, 0),
            connection_id: ConnectionId::new(1),
        };
        let script = encode_line(&greeting).unwrap();
        let (mut inbound, _reader) = scripted(script);
        let mut sent = Vec::new();

        let err = client
            .handshake(&mut inbound, &mut sent, "general")
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::VersionMismatch { .. }));
        assert!(sent.is_empty(), "nothing is sent to an incompatible relay");
    }

    #[tokio::test]
    async fn test_handshake_eof_is_not_an_error() {
        let (client, _updates, _commands) = client();
        let (mut inbound, _reader) = scripted(String::new());
        let mut sent = Vec::new();

        let joined = client
            .handshake(&mut inbound, &mut sent, "general")
            .await
            .unwrap();
        assert!(!joined);
    }

    #[tokio::test]
    async fn test_line_split_around_command_is_not_lost() {
        let (client, mut updates, commands) = client();
        let (local, mut relay) = tokio::io::duplex(4096);
        let (read_half, mut write_half) = tokio::io::split(local);
        let (mut inbound, _reader) = spawn_reader(BufReader::new(read_half), MAX_LINE_SIZE);
        let mut room = "general".to_string();

        let bob = parley_core::DisplayName::new("bob");
        let first = encode_line(&ServerMessage::receive_message(ChatMessage::new(&bob, "first"))).unwrap();
        let second = encode_line(&ServerMessage::receive_message(ChatMessage::new(&bob, "second"))).unwrap();
        let (head, tail) = first.as_bytes().split_at(10);

        let relay_side = async {
            relay.write_all(head).await.unwrap();
            sleep(Duration::from_millis(20)).await;
            commands.send(Command::Say("hey".to_string())).unwrap();
            sleep(Duration::from_millis(20)).await;
            relay.write_all(tail).await.unwrap();
            relay.write_all(second.as_bytes()).await.unwrap();
            sleep(Duration::from_millis(20)).await;
            commands.send(Command::Quit).unwrap();
            relay
        };

        let (exit, relay) = tokio::join!(
            client.message_loop(&mut inbound, &mut write_half, &mut room),
            relay_side
        );
        assert_eq!(exit.unwrap(), Exit::Stop);

        assert_eq!(updates.try_recv().unwrap(), Update::Message(ChatMessage::new(&bob, "first")));
        assert_eq!(updates.try_recv().unwrap(), Update::Message(ChatMessage::new(&bob, "second")));
        assert!(updates.try_recv().is_err());

        let mut sent = String::new();
        BufReader::new(relay).read_line(&mut sent).await.unwrap();
        assert!(sent.contains("\"type\":\"send-message\""));
        assert!(sent.contains("hey"));
    }

    #[tokio::test]
    async fn test_retry_cancelled() {
        let (update_tx, _updates) = mpsc::unbounded_channel();
        let (_commands, command_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let config = ClientConfig {
            // Reserved port on loopback; nothing listens there.
            addr: "127.0.0.1:1".to_string(),
            username: "alice".to_string(),
            retry_initial_delay: Duration::from_millis(10),
            ..Default::default()
        };
        let client = ChatClient::new(config, update_tx, command_rx, cancel.clone());

        let handle = tokio::spawn(async move { client.run().await });
        sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
