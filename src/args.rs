use clap::{Parser, Subcommand};
use std::path::PathBuf;

use roomlink::config;

#[derive(Parser, Debug)]
#[command(name = "roomlink")]
#[command(author = "Roomlink Team")]
#[command(version)]
#[command(about = "Room membership and peer-to-peer audio mesh over a WebSocket relay", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/roomlink.toml")]
    pub config: PathBuf,

    /// Verbose logging
    #[arg(short, long, action, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the signaling relay
    Serve {
        /// Bind address
        #[arg(long)]
        host: Option<String>,

        /// Listen port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Create a new room and join it
    Start {
        /// Relay WebSocket URL
        #[arg(short, long)]
        url: Option<String>,
    },
    /// Join an existing room
    Join {
        /// Room to join
        room: String,

        /// Relay WebSocket URL
        #[arg(short, long)]
        url: Option<String>,
    },
    /// List active rooms
    Rooms {
        /// Relay WebSocket URL
        #[arg(short, long)]
        url: Option<String>,
    },
}

impl Args {
    pub fn load_config(&self) -> Result<config::Config, Box<dyn std::error::Error>> {
        config::Config::load(&self.config)
    }

    /// Apply command line overrides on top of the file configuration
    pub fn apply_overrides(&self, config: &mut config::Config) {
        match &self.command {
            Command::Serve { host, port } => {
                if let Some(host) = host {
                    config.server.host = host.clone();
                }
                if let Some(port) = port {
                    config.server.port = *port;
                }
            }
            Command::Start { url } | Command::Join { url, .. } | Command::Rooms { url } => {
                if let Some(url) = url {
                    config.client.signaling_url = url.clone();
                }
            }
        }
        if self.verbose {
            config.logging.level = "debug".to_string();
        }
    }
}
