//! roomlink - WebRTC room membership and peer topology
//!
//! Participants meet in named rooms on a WebSocket relay and build a full mesh of
//! direct audio links, one per other room member.

pub mod client;
pub mod config;
pub mod rooms;
pub mod transport;
pub mod webrtc;

// Re-exports
pub use client::{ClientCommand, ClientRuntime};
pub use config::{Config, WebRTCConfig};
pub use rooms::{ParticipantId, RoomDirectory, RoomId, RoomRegistry};
pub use transport::{Channel, LoopbackChannel, Relay, WsChannel};
pub use webrtc::{NegotiationState, SessionCoordinator, SessionState};
