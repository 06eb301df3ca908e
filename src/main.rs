//! roomlink - Main entry point

mod args;

use args::{Args, Command};
use clap::Parser;
use log::{error, info, warn};
use roomlink::config::Config;
use roomlink::transport::run_signaling_server;
use roomlink::{ClientCommand, ClientRuntime, RoomId};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = Args::parse();

    // Load configuration
    let (mut config, load_error) = match args.load_config() {
        Ok(cfg) => (cfg, None),
        Err(e) => (Config::default(), Some(e)),
    };
    args.apply_overrides(&mut config);

    // Initialize logging with noise filtering for third-party WebRTC crates
    env_logger::Builder::new()
        .parse_filters(&std::env::var("ROOMLINK_LOG").unwrap_or_else(|_| config.logging.level.clone()))
        .filter_module("webrtc_ice", log::LevelFilter::Error)
        .filter_module("webrtc_dtls", log::LevelFilter::Error)
        .filter_module("webrtc_mdns", log::LevelFilter::Error)
        .init();

    info!("roomlink v{}", env!("CARGO_PKG_VERSION"));
    match load_error {
        Some(e) => warn!("Failed to load config from {:?}: {}, using defaults", args.config, e),
        None => info!("Configuration from {:?}", args.config),
    }

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e);
    }

    let command = match args.command {
        Command::Serve { .. } => {
            return run_signaling_server(&config.server).await;
        }
        Command::Start { .. } => ClientCommand::Start,
        Command::Join { room, .. } => ClientCommand::Join(RoomId::from(room)),
        Command::Rooms { .. } => ClientCommand::ListRooms,
    };

    ClientRuntime::new(config).run(command).await
}
