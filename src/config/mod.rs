//! Configuration management for roomlink

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Relay server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Client configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// WebRTC configuration
    #[serde(default)]
    pub webrtc: WebRTCConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Relay bind address
    pub host: String,

    /// Relay port
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// WebSocket URL of the signaling relay
    #[serde(default = "default_signaling_url")]
    pub signaling_url: String,

    /// Seconds a link may spend negotiating before it is failed (0 disables)
    #[serde(default = "default_negotiation_timeout_secs")]
    pub negotiation_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signaling_url: default_signaling_url(),
            negotiation_timeout_secs: default_negotiation_timeout_secs(),
        }
    }
}

/// One ICE server entry as handed to the peer connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// ICE server configuration for peer links
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRTCConfig {
    /// STUN server host (empty disables STUN)
    #[serde(default = "default_stun_host")]
    pub stun_host: String,

    /// STUN server port
    #[serde(default = "default_stun_port")]
    pub stun_port: u16,

    /// TURN server host (empty disables TURN)
    #[serde(default)]
    pub turn_host: String,

    /// TURN server port
    #[serde(default = "default_turn_port")]
    pub turn_port: u16,

    /// TURN transport ("udp" or "tcp")
    #[serde(default = "default_turn_protocol")]
    pub turn_protocol: String,

    /// Use turns:// instead of turn://
    #[serde(default)]
    pub turn_tls: bool,

    /// Static TURN username
    #[serde(default)]
    pub turn_username: String,

    /// Static TURN password
    #[serde(default)]
    pub turn_password: String,

    /// Shared secret for time-limited TURN credentials
    #[serde(default)]
    pub turn_shared_secret: String,

    /// Used when neither STUN nor TURN is configured
    #[serde(default)]
    pub ice_servers: Vec<IceServerConfig>,
}

impl Default for WebRTCConfig {
    fn default() -> Self {
        Self {
            stun_host: default_stun_host(),
            stun_port: default_stun_port(),
            turn_host: String::new(),
            turn_port: default_turn_port(),
            turn_protocol: default_turn_protocol(),
            turn_tls: false,
            turn_username: String::new(),
            turn_password: String::new(),
            turn_shared_secret: String::new(),
            ice_servers: Vec::new(),
        }
    }
}

impl WebRTCConfig {
    /// TURN transport as used in the server URL: lowercased, "udp" when unset
    pub fn turn_transport(&self) -> String {
        let protocol = self.turn_protocol.trim().to_ascii_lowercase();
        if protocol.is_empty() {
            "udp".to_string()
        } else {
            protocol
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.server.port == 0 {
            return Err("Server port must be non-zero".into());
        }

        let url = self.client.signaling_url.as_str();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err("Client signaling_url must start with ws:// or wss://".into());
        }

        if !self.webrtc.turn_host.is_empty() {
            if self.webrtc.turn_port == 0 {
                return Err("WebRTC turn_port must be non-zero when turn_host is set".into());
            }
            let has_static = !self.webrtc.turn_username.is_empty() && !self.webrtc.turn_password.is_empty();
            if !has_static && self.webrtc.turn_shared_secret.is_empty() {
                return Err(
                    "WebRTC TURN needs turn_shared_secret or turn_username and turn_password".into(),
                );
            }
            let protocol = self.webrtc.turn_transport();
            if protocol != "udp" && protocol != "tcp" {
                return Err("WebRTC turn_protocol must be \"udp\" or \"tcp\"".into());
            }
        }

        for server in &self.webrtc.ice_servers {
            if server.urls.is_empty() {
                return Err("WebRTC ice_servers entries need at least one url".into());
            }
        }

        Ok(())
    }
}

fn default_signaling_url() -> String {
    "ws://127.0.0.1:3000/ws".to_string()
}
fn default_negotiation_timeout_secs() -> u64 { 30 }
fn default_stun_host() -> String {
    "stun.l.google.com".to_string()
}
fn default_stun_port() -> u16 { 19302 }
fn default_turn_port() -> u16 { 3478 }
fn default_turn_protocol() -> String {
    "udp".to_string()
}
