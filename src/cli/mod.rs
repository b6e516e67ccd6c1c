//! Interactive command line for a running node

pub mod commands;

pub use commands::{
    cmd_execute, format_peer_list, run_command_loop, CliResult, Command, CommandError, USAGE,
};
