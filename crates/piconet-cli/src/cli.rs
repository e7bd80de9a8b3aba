//! Clap CLI definitions for PicoNet.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  piconet chat                          Chat with every peer on the LAN
  piconet --app-id my-game chat         Only talk to peers of `my-game`
  piconet listen --event SCORE          Print every SCORE event
  piconet send --event SCORE --payload 42

Peers find each other by UDP broadcast; all of them must share the same
application id and port.";

/// PicoNet: serverless LAN discovery and messaging.
#[derive(Parser)]
#[command(name = "piconet", version, about, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Application id (overrides the config file).
    #[arg(long, global = true)]
    pub app_id: Option<String>,

    /// Network port (overrides the config file).
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Also discover peers over IPv6.
    #[arg(long, global = true)]
    pub ipv6: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Interactive chat: stdin lines go to every peer.
    Chat,
    /// Print every payload received for an event.
    Listen {
        /// Event name to subscribe to.
        #[arg(long)]
        event: String,
    },
    /// Send one event to every peer, then exit.
    Send {
        /// Event name.
        #[arg(long)]
        event: String,
        /// Event payload.
        #[arg(long, default_value = "")]
        payload: String,
        /// How long to wait for the first peer.
        #[arg(long, default_value_t = 10)]
        wait_secs: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_send() {
        let cli = Cli::parse_from([
            "piconet", "--app-id", "X", "--port", "9000", "send", "--event", "E", "--payload",
            "hi",
        ]);
        assert_eq!(cli.app_id.as_deref(), Some("X"));
        assert_eq!(cli.port, Some(9000));
        match cli.command {
            Commands::Send {
                event,
                payload,
                wait_secs,
            } => {
                assert_eq!(event, "E");
                assert_eq!(payload, "hi");
                assert_eq!(wait_secs, 10);
            }
            _ => panic!("Expected send"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["piconet", "chat", "--ipv6"]);
        assert!(cli.ipv6);
        assert!(matches!(cli.command, Commands::Chat));
    }

    #[test]
    fn test_listen_requires_event() {
        assert!(Cli::try_parse_from(["piconet", "listen"]).is_err());
    }
}
