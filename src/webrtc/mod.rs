//! WebRTC mesh coordination
//!
//! This module provides:
//! - Signaling message types for rooms and peer negotiation
//! - Peer connection backends (webrtc-rs)
//! - Per-peer link lifecycle with ICE candidate buffering
//! - The session coordinator that keeps links in step with the room roster

pub mod peer_connection;
pub mod peer_link;
pub mod session;
pub mod signaling;

#[cfg(test)]
pub(crate) mod testing;

pub use peer_connection::{LinkEvent, PeerConnection, PeerConnector, RtcConnector};
pub use peer_link::{NegotiationState, PeerLink, PeerLinks};
pub use session::{SessionCoordinator, SessionState};
pub use signaling::{ClientMessage, ServerMessage};

use std::error::Error;
use std::fmt;

/// WebRTC-related errors
#[derive(Debug)]
pub enum WebRTCError {
    /// Peer connection creation failed
    ConnectionFailed(String),
    /// SDP processing failed
    SdpError(String),
    /// ICE candidate processing failed
    IceError(String),
    /// Media track setup failed
    MediaError(String),
}

impl fmt::Display for WebRTCError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebRTCError::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
            WebRTCError::SdpError(msg) => write!(f, "SDP error: {}", msg),
            WebRTCError::IceError(msg) => write!(f, "ICE error: {}", msg),
            WebRTCError::MediaError(msg) => write!(f, "Media error: {}", msg),
        }
    }
}

impl Error for WebRTCError {}
