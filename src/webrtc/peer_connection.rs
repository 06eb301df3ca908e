//! WebRTC PeerConnection backends
//!
//! `PeerConnector` creates one connection per remote participant; `RtcConnector` is the
//! webrtc-rs implementation. Connections report local ICE candidates and state changes
//! as `LinkEvent`s instead of touching session state directly.

use super::signaling::IceCandidate;
use super::WebRTCError;
use crate::config::{IceServerConfig, WebRTCConfig};
use crate::rooms::ParticipantId;
use base64::Engine;
use hmac::{Hmac, Mac};
use log::{debug, info, warn};
use sha1::Sha1;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;

/// Notifications a connection raises outside of the negotiation calls.
///
/// `generation` is the value passed to `PeerConnector::connect` for the connection
/// that raised the event, so events from a replaced connection can be told apart
/// from those of the current link to the same participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A local ICE candidate to forward to the remote participant
    LocalCandidate {
        remote: ParticipantId,
        generation: u64,
        candidate: IceCandidate,
    },
    /// Media path to the remote participant is up
    Connected { remote: ParticipantId, generation: u64 },
    /// Connection failed and will not recover
    Failed { remote: ParticipantId, generation: u64 },
}

impl LinkEvent {
    pub fn remote(&self) -> &ParticipantId {
        match self {
            LinkEvent::LocalCandidate { remote, .. }
            | LinkEvent::Connected { remote, .. }
            | LinkEvent::Failed { remote, .. } => remote,
        }
    }

    pub fn generation(&self) -> u64 {
        match self {
            LinkEvent::LocalCandidate { generation, .. }
            | LinkEvent::Connected { generation, .. }
            | LinkEvent::Failed { generation, .. } => *generation,
        }
    }
}

/// One direct connection to a remote participant
pub trait PeerConnection: Send + Sync + 'static {
    /// Create an offer and apply it as the local description
    fn create_offer(&self) -> impl Future<Output = Result<String, WebRTCError>> + Send;

    /// Apply a remote offer and return the answer, already applied locally
    fn accept_offer(&self, sdp: &str) -> impl Future<Output = Result<String, WebRTCError>> + Send;

    /// Apply a remote answer
    fn accept_answer(&self, sdp: &str) -> impl Future<Output = Result<(), WebRTCError>> + Send;

    /// Add a remote ICE candidate. Only valid once the remote description is set.
    fn add_ice_candidate(
        &self,
        candidate: &IceCandidate,
    ) -> impl Future<Output = Result<(), WebRTCError>> + Send;

    /// Release the connection
    fn close(&self) -> impl Future<Output = Result<(), WebRTCError>> + Send;
}

/// Factory for peer connections
pub trait PeerConnector: Send + Sync + 'static {
    type Connection: PeerConnection;

    /// Open a connection to `remote`. Every event it raises carries `generation`.
    fn connect(
        &self,
        remote: &ParticipantId,
        generation: u64,
    ) -> impl Future<Output = Result<Self::Connection, WebRTCError>> + Send;
}

/// webrtc-rs connector: one audio (sendrecv) transceiver per link
pub struct RtcConnector {
    config: WebRTCConfig,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl RtcConnector {
    pub fn new(config: WebRTCConfig, events: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self { config, events }
    }

    fn setup_callbacks(
        &self,
        peer_connection: &Arc<RTCPeerConnection>,
        remote: &ParticipantId,
        generation: u64,
    ) {
        let events = self.events.clone();
        let remote_id = remote.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = events.clone();
            let remote = remote_id.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!("ICE gathering complete for link to {}", remote);
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(LinkEvent::LocalCandidate {
                            remote,
                            generation,
                            candidate: IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                            },
                        });
                    }
                    Err(e) => warn!("Failed to encode local ICE candidate: {}", e),
                }
            })
        }));

        let events = self.events.clone();
        let remote_id = remote.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let events = events.clone();
                let remote = remote_id.clone();
                Box::pin(async move {
                    info!("Link to {} connection state: {:?}", remote, state);
                    let event = match state {
                        RTCPeerConnectionState::Connected => {
                            LinkEvent::Connected { remote, generation }
                        }
                        RTCPeerConnectionState::Failed => LinkEvent::Failed { remote, generation },
                        _ => return,
                    };
                    let _ = events.send(event);
                })
            },
        ));
    }
}

impl PeerConnector for RtcConnector {
    type Connection = RtcLink;

    async fn connect(&self, remote: &ParticipantId, generation: u64) -> Result<RtcLink, WebRTCError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| WebRTCError::MediaError(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            WebRTCError::ConnectionFailed(format!("Failed to register interceptors: {}", e))
        })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = build_ice_servers(&self.config)
            .into_iter()
            .map(|server| RTCIceServer {
                urls: server.urls,
                username: server.username.unwrap_or_default(),
                credential: server.credential.unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let peer_connection = Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
            WebRTCError::ConnectionFailed(format!("Failed to create peer connection: {}", e))
        })?);

        let transceiver_init = RTCRtpTransceiverInit {
            direction: RTCRtpTransceiverDirection::Sendrecv,
            send_encodings: Vec::new(),
        };
        peer_connection
            .add_transceiver_from_kind(RTPCodecType::Audio, Some(transceiver_init))
            .await
            .map_err(|e| WebRTCError::MediaError(format!("Failed to add audio transceiver: {}", e)))?;

        self.setup_callbacks(&peer_connection, remote, generation);

        debug!("Created peer connection #{} for {}", generation, remote);
        Ok(RtcLink { peer_connection })
    }
}

/// webrtc-rs peer connection behind a link
pub struct RtcLink {
    peer_connection: Arc<RTCPeerConnection>,
}

impl PeerConnection for RtcLink {
    async fn create_offer(&self) -> Result<String, WebRTCError> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to create offer: {}", e)))?;

        self.peer_connection
            .set_local_description(offer.clone())
            .await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to set local description: {}", e)))?;

        Ok(offer.sdp)
    }

    async fn accept_offer(&self, sdp: &str) -> Result<String, WebRTCError> {
        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| WebRTCError::SdpError(format!("Invalid SDP offer: {}", e)))?;

        self.peer_connection
            .set_remote_description(offer)
            .await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to set remote description: {}", e)))?;

        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to create answer: {}", e)))?;

        self.peer_connection
            .set_local_description(answer.clone())
            .await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to set local description: {}", e)))?;

        Ok(answer.sdp)
    }

    async fn accept_answer(&self, sdp: &str) -> Result<(), WebRTCError> {
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| WebRTCError::SdpError(format!("Invalid SDP answer: {}", e)))?;

        self.peer_connection
            .set_remote_description(answer)
            .await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to set remote description: {}", e)))?;

        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), WebRTCError> {
        let candidate_init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };

        self.peer_connection
            .add_ice_candidate(candidate_init)
            .await
            .map_err(|e| WebRTCError::IceError(format!("Failed to add ICE candidate: {}", e)))?;

        Ok(())
    }

    async fn close(&self) -> Result<(), WebRTCError> {
        self.peer_connection
            .close()
            .await
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to close connection: {}", e)))?;
        Ok(())
    }
}

/// Resolve the ICE server list: explicit STUN/TURN settings win over `ice_servers`
pub fn build_ice_servers(config: &WebRTCConfig) -> Vec<IceServerConfig> {
    let mut servers = Vec::new();

    if !config.stun_host.is_empty() && config.stun_port != 0 {
        servers.push(IceServerConfig {
            urls: vec![format!("stun:{}:{}", config.stun_host, config.stun_port)],
            username: None,
            credential: None,
        });
    }

    if !config.turn_host.is_empty() {
        let scheme = if config.turn_tls { "turns" } else { "turn" };
        let url = format!(
            "{}:{}:{}?transport={}",
            scheme,
            config.turn_host,
            config.turn_port,
            config.turn_transport()
        );

        let (username, credential) = if !config.turn_shared_secret.is_empty() {
            let ttl_secs: u64 = 24 * 60 * 60;
            let expiry = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs() + ttl_secs)
                .unwrap_or(ttl_secs);
            let user = format!("{}:roomlink", expiry);
            let password = hmac_sha1_base64(&config.turn_shared_secret, &user);
            (Some(user), Some(password))
        } else if !config.turn_username.is_empty() && !config.turn_password.is_empty() {
            (Some(config.turn_username.clone()), Some(config.turn_password.clone()))
        } else {
            (None, None)
        };

        servers.push(IceServerConfig {
            urls: vec![url],
            username,
            credential,
        });
    }

    if servers.is_empty() {
        return config.ice_servers.clone();
    }

    servers
}

fn hmac_sha1_base64(secret: &str, message: &str) -> String {
    // HMAC accepts keys of any length
    let Ok(mut mac) = Hmac::<Sha1>::new_from_slice(secret.as_bytes()) else {
        return String::new();
    };
    mac.update(message.as_bytes());
    let result = mac.finalize().into_bytes();
    base64::engine::general_purpose::STANDARD.encode(result)
}
