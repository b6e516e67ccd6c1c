//! CLI commands for the P2P node
//!
//! Parses the interactive command lines and maps them onto the network.

use crate::network::{Network, Peer, Transport};
use std::fmt::Write as _;
use std::io::Write as _;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Result type for CLI operations
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// One-line help shown on startup and after unknown input
pub const USAGE: &str =
    "Commands: 'send <address> <type> <data>', 'broadcast <type> <data>', 'list', 'quit'";

/// Command parse errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("Usage: send <address> <type> <data>")]
    SendUsage,
    #[error("Usage: broadcast <type> <data>")]
    BroadcastUsage,
    #[error("Unknown command. Try 'send <address> <type> <data>', 'broadcast <type> <data>', 'list', or 'quit'")]
    Unknown,
}

/// A parsed command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send {
        address: String,
        msg_type: String,
        data: String,
    },
    Broadcast {
        msg_type: String,
        data: String,
    },
    List,
    Quit,
}

impl Command {
    /// Parse one input line. The data argument is the rest of the line.
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let line = line.trim_end_matches(['\r', '\n']);

        match line {
            "quit" => return Ok(Command::Quit),
            "list" => return Ok(Command::List),
            _ => {}
        }

        if let Some(args) = line.strip_prefix("send ") {
            let (address, rest) = next_token(args).ok_or(CommandError::SendUsage)?;
            let (msg_type, data) = next_token(rest).ok_or(CommandError::SendUsage)?;
            if data.is_empty() {
                return Err(CommandError::SendUsage);
            }
            return Ok(Command::Send {
                address: address.to_string(),
                msg_type: msg_type.to_string(),
                data: data.to_string(),
            });
        }

        if let Some(args) = line.strip_prefix("broadcast ") {
            let (msg_type, data) = next_token(args).ok_or(CommandError::BroadcastUsage)?;
            if data.is_empty() {
                return Err(CommandError::BroadcastUsage);
            }
            return Ok(Command::Broadcast {
                msg_type: msg_type.to_string(),
                data: data.to_string(),
            });
        }

        Err(CommandError::Unknown)
    }
}

/// Split off the first space-delimited token, skipping leading spaces
fn next_token(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start_matches(' ');
    if s.is_empty() {
        return None;
    }
    match s.split_once(' ') {
        Some((token, rest)) => Some((token, rest)),
        None => Some((s, "")),
    }
}

/// Render the directory the way `list` prints it
pub fn format_peer_list(peers: &[Peer]) -> String {
    let mut out = format!("Known peers ({}):\n", peers.len());
    for (index, peer) in peers.iter().enumerate() {
        let _ = writeln!(out, "  {}: {}", index, peer.address);
    }
    out
}

/// Run one command. Returns `false` when the loop should stop.
pub async fn cmd_execute<T: Transport>(network: &Network<T>, command: Command) -> bool {
    match command {
        Command::Quit => return false,
        Command::List => {
            print!("{}", format_peer_list(&network.peers().await));
        }
        Command::Send {
            address,
            msg_type,
            data,
        } => {
            if let Err(e) = network.send(&address, &msg_type, &data).await {
                println!("❌ Failed to send {} to {}: {}", msg_type, address, e);
            }
        }
        Command::Broadcast { msg_type, data } => {
            let sent = network.broadcast(&msg_type, &data).await;
            println!("📡 Broadcast {} to {} peers", msg_type, sent);
        }
    }
    true
}

/// Read commands from stdin until `quit` or end of input
pub async fn run_command_loop<T: Transport>(network: &Network<T>) -> CliResult<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        match Command::parse(&line) {
            Ok(command) => {
                if !cmd_execute(network, command).await {
                    break;
                }
            }
            Err(e) => println!("{}", e),
        }
    }

    Ok(())
}
