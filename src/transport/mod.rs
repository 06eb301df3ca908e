//! Transport layer for roomlink
//!
//! The named-event channel used by clients, its WebSocket implementation and the
//! relay server that clients connect to.

pub mod channel;
pub mod websocket;
pub mod signaling_server;

pub use channel::{Channel, HandlerRegistry, LoopbackChannel, MessageHandler};
pub use websocket::WsChannel;
pub use signaling_server::{run_signaling_server, Relay};

use std::error::Error;
use std::fmt;

/// Channel-related errors
#[derive(Debug)]
pub enum ChannelError {
    /// Could not reach the relay
    ConnectFailed(String),
    /// Frame could not be encoded or decoded
    Codec(String),
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::ConnectFailed(msg) => write!(f, "Connect failed: {}", msg),
            ChannelError::Codec(msg) => write!(f, "Codec error: {}", msg),
        }
    }
}

impl Error for ChannelError {}
