//! Room and WebRTC signaling protocol
//!
//! Every frame on the channel is a JSON object `{"event": "<name>", "data": <payload>}`.
//! Client-to-server and server-to-client traffic use separate closed unions because
//! `get-rooms` and `join-room` carry different payloads in each direction.

use crate::rooms::{ParticipantId, RoomId};
use crate::transport::ChannelError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Event names used on the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    GetRooms,
    JoinRoom,
    LeaveRoom,
    MemberLeft,
    Offer,
    Answer,
    IceCandidate,
}

impl EventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::GetRooms => "get-rooms",
            EventName::JoinRoom => "join-room",
            EventName::LeaveRoom => "leave-room",
            EventName::MemberLeft => "member-left",
            EventName::Offer => "offer",
            EventName::Answer => "answer",
            EventName::IceCandidate => "ice-candidate",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `join-room` request sent by a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub room_id: RoomId,
    pub user_id: ParticipantId,
}

/// `leave-room` request. The room is null when the client was not in one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveRequest {
    pub room_id: Option<RoomId>,
    pub user_id: ParticipantId,
}

/// `join-room` broadcast: `room_members` is the roster before `new_member` joined
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomUpdate {
    pub room_id: RoomId,
    pub new_member: ParticipantId,
    #[serde(default)]
    pub room_members: Vec<ParticipantId>,
}

/// `member-left` notification sent to the members that remain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberLeft {
    pub room_id: RoomId,
    pub user_id: ParticipantId,
}

/// SDP offer or answer addressed to one peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescription {
    pub room_id: RoomId,
    pub from: ParticipantId,
    pub to: ParticipantId,
    pub sdp: String,
}

/// ICE candidate as produced by a peer connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

/// ICE candidate addressed to one peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateSignal {
    pub room_id: RoomId,
    pub from: ParticipantId,
    pub to: ParticipantId,
    #[serde(flatten)]
    pub candidate: IceCandidate,
}

/// Messages a client sends to the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Ask for the current room list
    GetRooms,
    /// Join (or create) a room
    JoinRoom(JoinRequest),
    /// Leave the current room
    LeaveRoom(LeaveRequest),
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(CandidateSignal),
}

impl ClientMessage {
    pub fn event(&self) -> EventName {
        match self {
            ClientMessage::GetRooms => EventName::GetRooms,
            ClientMessage::JoinRoom(_) => EventName::JoinRoom,
            ClientMessage::LeaveRoom(_) => EventName::LeaveRoom,
            ClientMessage::Offer(_) => EventName::Offer,
            ClientMessage::Answer(_) => EventName::Answer,
            ClientMessage::IceCandidate(_) => EventName::IceCandidate,
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ChannelError> {
        serde_json::from_str(json)
            .map_err(|e| ChannelError::Codec(format!("Invalid client message: {}", e)))
    }

    pub fn to_json(&self) -> Result<String, ChannelError> {
        serde_json::to_string(self)
            .map_err(|e| ChannelError::Codec(format!("Failed to serialize message: {}", e)))
    }
}

/// Messages the relay pushes to a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Current list of active rooms
    GetRooms(Vec<RoomId>),
    /// Membership change in a room
    JoinRoom(RoomUpdate),
    /// A member left a room
    MemberLeft(MemberLeft),
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(CandidateSignal),
}

impl ServerMessage {
    pub fn event(&self) -> EventName {
        match self {
            ServerMessage::GetRooms(_) => EventName::GetRooms,
            ServerMessage::JoinRoom(_) => EventName::JoinRoom,
            ServerMessage::MemberLeft(_) => EventName::MemberLeft,
            ServerMessage::Offer(_) => EventName::Offer,
            ServerMessage::Answer(_) => EventName::Answer,
            ServerMessage::IceCandidate(_) => EventName::IceCandidate,
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ChannelError> {
        serde_json::from_str(json)
            .map_err(|e| ChannelError::Codec(format!("Invalid server message: {}", e)))
    }

    pub fn to_json(&self) -> Result<String, ChannelError> {
        serde_json::to_string(self)
            .map_err(|e| ChannelError::Codec(format!("Failed to serialize message: {}", e)))
    }
}
