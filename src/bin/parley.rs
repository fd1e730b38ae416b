//! Parley - line-oriented chat client
//!
//! Connects to a relay, joins a room and prints the conversation.
//! Each line typed on stdin is sent as a message.
//!
//! # Usage
//!
//! ```text
//! parley --username alice                  # join "general" on localhost
//! parley -u bob -r rust -a chat.local:8081
//! ```
//!
//! While running:
//!
//! ```text
//! /room <name>   switch rooms
//! /quit          leave
//! ```

use std::io::BufRead;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use parley_client::{ChatClient, ClientConfig, Command, Transcript, Update};
use parley_core::ChatMessage;

// ============================================================================
// CLI Arguments
// ============================================================================

/// Parley - chat from the terminal
#[derive(Parser, Debug)]
#[command(name = "parley", version, about)]
struct Args {
    /// Relay address
    #[arg(short, long, env = "PARLEY_ADDR", default_value = "127.0.0.1:8081")]
    addr: String,

    /// Display name
    #[arg(short, long, env = "PARLEY_USERNAME")]
    username: String,

    /// Room to join
    #[arg(short, long, default_value = "general")]
    room: String,

    /// Log filter used when RUST_LOG is unset; logs go to stderr
    #[arg(long, default_value = "warn")]
    log_level: String,
}

// ============================================================================
// Input
// ============================================================================

/// Maps one stdin line to a command. Blank lines map to nothing.
fn parse_input(line: &str) -> Option<Command> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return None;
    }
    if let Some(room) = line.strip_prefix("/room ") {
        return Some(Command::ChangeRoom(room.trim().to_string()));
    }
    if line.trim() == "/quit" {
        return Some(Command::Quit);
    }
    Some(Command::Say(line.to_string()))
}

/// Reads stdin on a plain thread so a pending read never holds up shutdown.
fn spawn_input_thread(command_tx: mpsc::UnboundedSender<Command>) {
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let command = match line {
                Ok(line) => match parse_input(&line) {
                    Some(command) => command,
                    None => continue,
                },
                Err(_) => break,
            };
            let quit = command == Command::Quit;
            if command_tx.send(command).is_err() || quit {
                return;
            }
        }
        // EOF or unreadable stdin ends the session.
        let _ = command_tx.send(Command::Quit);
        debug!("Input thread finished");
    });
}

// ============================================================================
// Output
// ============================================================================

fn print_message(message: &ChatMessage) {
    println!("{}: {}", message.username, message.message);
}

fn render(transcript: &mut Transcript, update: &Update) {
    match update {
        Update::Connected { connection_id } => {
            eprintln!("-- connected ({connection_id})");
        }
        Update::History { room, .. } => {
            transcript.apply(update);
            eprintln!("-- joined {room}");
            for message in transcript.messages() {
                print_message(message);
            }
        }
        Update::Message(message) => {
            if transcript.apply(update) {
                print_message(message);
            }
        }
        Update::Rejected(reason) => eprintln!("-- rejected: {reason}"),
        Update::ServerError { message, .. } => eprintln!("-- error: {message}"),
        Update::Disconnected => eprintln!("-- disconnected"),
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .context("Invalid log level")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = ClientConfig {
        addr: args.addr,
        username: args.username,
        room: args.room,
        ..Default::default()
    };

    let (update_tx, mut update_rx) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let cancel_token = CancellationToken::new();

    let client = ChatClient::new(config, update_tx, command_rx, cancel_token.clone());
    let client_handle = tokio::spawn(async move { client.run().await });
    spawn_input_thread(command_tx);

    let mut transcript = Transcript::new();
    loop {
        tokio::select! {
            update = update_rx.recv() => match update {
                Some(update) => render(&mut transcript, &update),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                cancel_token.cancel();
            }
        }
    }

    client_handle
        .await
        .context("Client task failed")?
        .context("Disconnected from relay")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_input() {
        assert_eq!(parse_input("hello"), Some(Command::Say("hello".to_string())));
        assert_eq!(
            parse_input("/room rust\n"),
            Some(Command::ChangeRoom("rust".to_string()))
        );
        assert_eq!(parse_input("/quit"), Some(Command::Quit));
        assert_eq!(parse_input("   "), None);
    }
}
