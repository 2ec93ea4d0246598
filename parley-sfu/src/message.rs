//! Signaling wire protocol
//!
//! Every frame exchanged with a client, over WebSocket or over the
//! signaling data channel, is a JSON envelope carrying a message tag,
//! a tag-specific payload, and a server-assigned timestamp.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{MeetingId, StreamId};

/// Tags of the signaling protocol.
///
/// The wire representation is the kebab-case tag string, e.g.
/// `ice-candidate` or `local-track`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    /// SDP offer from the negotiation initiator
    Offer,
    /// SDP answer responding to an offer
    Answer,
    /// Trickle ICE candidate
    IceCandidate,
    /// Client asks the server to start a renegotiation
    Negotiate,
    /// Roster change notification (join / left)
    Info,
    /// Fatal error; the sender closes after emitting this
    Error,
    /// Join or create succeeded; carries the meeting id
    Joined,
    /// Client signals its peer connection reached connected state
    Connected,
    /// Client requests a roster re-sync
    Sync,
    /// Client announces the stream id it is about to publish
    LocalTrack,
    /// Orderly teardown request
    Close,
    /// Server announces a forwarded track
    Track,
    /// Username exchange
    Username,
}

impl MessageType {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice-candidate",
            Self::Negotiate => "negotiate",
            Self::Info => "info",
            Self::Error => "error",
            Self::Joined => "joined",
            Self::Connected => "connected",
            Self::Sync => "sync",
            Self::LocalTrack => "local-track",
            Self::Close => "close",
            Self::Track => "track",
            Self::Username => "username",
        }
    }
}

/// One signaling frame.
///
/// `payload` is tag-specific JSON; `timestamp` is assigned at
/// construction (epoch milliseconds) and carries no protocol meaning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub payload: Value,
    #[serde(default)]
    pub timestamp: i64,
}

impl WireMessage {
    pub fn new(kind: MessageType, payload: Value) -> Self {
        Self {
            kind,
            payload,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Build an `error` frame with a plain string payload
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(MessageType::Error, Value::String(message.into()))
    }

    /// Build the `joined` frame sent as the first reply after a handshake
    pub fn joined(meeting_id: &MeetingId) -> Self {
        Self::new(
            MessageType::Joined,
            serde_json::json!(JoinedPayload {
                meeting_id: meeting_id.clone(),
            }),
        )
    }

    /// Build an `info` frame announcing joined participants.
    ///
    /// `members` maps each participant's stream id to its username;
    /// participants without a published stream are not listed.
    pub fn info_join(members: HashMap<String, String>) -> Self {
        Self::new(
            MessageType::Info,
            serde_json::json!(InfoPayload {
                action: InfoAction::Join,
                info: serde_json::json!(members),
            }),
        )
    }

    /// Build an `info` frame announcing a departed participant.
    ///
    /// `stream_id` is `None` when the participant never published media,
    /// which serializes as a JSON `null`.
    pub fn info_left(stream_id: Option<StreamId>, username: impl Into<String>) -> Self {
        Self::new(
            MessageType::Info,
            serde_json::json!(InfoPayload {
                action: InfoAction::Left,
                info: serde_json::json!(LeftInfo {
                    stream_id,
                    username: username.into(),
                }),
            }),
        )
    }

    /// Build an `offer` frame from a local session description
    pub fn offer(description: &SessionDescription) -> Self {
        Self::new(MessageType::Offer, serde_json::json!(description))
    }

    /// Build an `answer` frame from a local session description
    pub fn answer(description: &SessionDescription) -> Self {
        Self::new(MessageType::Answer, serde_json::json!(description))
    }

    /// Build an `ice-candidate` frame from a locally gathered candidate
    pub fn ice_candidate(candidate: &IceCandidate) -> Self {
        Self::new(MessageType::IceCandidate, serde_json::json!(candidate))
    }

    /// Serialize to the JSON text sent on the wire
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a frame received from a client
    pub fn from_json(raw: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// SDP type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

impl SdpKind {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Pranswer => "pranswer",
            Self::Rollback => "rollback",
        }
    }
}

/// Session description (SDP) as exchanged with browser clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Session description type (offer, answer, pranswer, rollback)
    #[serde(rename = "type")]
    pub kind: SdpKind,
    /// SDP content
    pub sdp: String,
}

/// Trickle ICE candidate as exchanged with browser clients.
///
/// An empty `candidate` string marks end-of-candidates and is dropped
/// rather than handed to the peer connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    #[serde(default)]
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Whether this candidate only marks the end of trickle gathering
    #[must_use]
    pub fn is_end_of_candidates(&self) -> bool {
        self.candidate.is_empty()
    }
}

/// Payload of the `joined` frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinedPayload {
    #[serde(rename = "meetingId")]
    pub meeting_id: MeetingId,
}

/// Payload of `info` frames
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoPayload {
    pub action: InfoAction,
    pub info: Value,
}

/// Which roster change an `info` frame reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InfoAction {
    Join,
    Left,
}

/// `info` payload detail for a departed participant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeftInfo {
    #[serde(rename = "streamId")]
    pub stream_id: Option<StreamId>,
    pub username: String,
}
