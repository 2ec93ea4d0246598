//! WebRTC engine capability interface
//!
//! The signaling layer never touches the WebRTC implementation directly.
//! It consumes one peer connection per participant through [`RtcPeer`] and
//! observes it through [`EngineEvent`]s, so the engine can be swapped for
//! a fake in tests.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_remote::TrackRemote;

use crate::message::{IceCandidate, SessionDescription};
use crate::transport::TransportPair;
use crate::types::StreamId;
use crate::Result;

/// Media track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl From<RTPCodecType> for TrackKind {
    fn from(codec_type: RTPCodecType) -> Self {
        match codec_type {
            RTPCodecType::Audio => Self::Audio,
            _ => Self::Video,
        }
    }
}

/// One media track a participant publishes.
///
/// `remote` is the engine's read side for forwarding; it is absent only on
/// test stubs that never carry RTP.
#[derive(Clone)]
pub struct MediaTrack {
    pub id: String,
    pub stream_id: Option<StreamId>,
    pub kind: TrackKind,
    pub ssrc: u32,
    pub remote: Option<Arc<TrackRemote>>,
}

impl MediaTrack {
    #[must_use]
    pub fn is_video(&self) -> bool {
        self.kind == TrackKind::Video
    }

    /// Track without an RTP source, for exercising signaling paths
    #[cfg(test)]
    pub fn stub(id: impl Into<String>, stream_id: Option<StreamId>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            stream_id,
            kind,
            ssrc: 0,
            remote: None,
        }
    }
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .field("ssrc", &self.ssrc)
            .finish_non_exhaustive()
    }
}

/// ICE connection states, mirrored so consumers stay engine-agnostic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
    Unspecified,
}

impl IceState {
    /// Whether ICE reached a usable connection
    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::Completed)
    }
}

/// Peer connection states, mirrored so consumers stay engine-agnostic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
    Unspecified,
}

/// What a peer connection reports upward, replacing engine callbacks
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Media topology changed; a fresh offer is needed
    NegotiationNeeded,
    /// Locally gathered candidate; `None` marks gathering complete
    IceCandidate(Option<IceCandidate>),
    IceConnectionState(IceState),
    ConnectionState(PeerState),
    SignalingState(String),
    /// A remote track started arriving
    Track(MediaTrack),
}

/// One peer connection, owned by one participant session
#[async_trait]
pub trait RtcPeer: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Attach another participant's track to this connection and start
    /// pumping its RTP. Adding the same track id twice is a no-op.
    async fn forward_track(&self, track: MediaTrack) -> Result<()>;

    /// Ask the publisher of `track` for a keyframe (RTCP PLI), so a newly
    /// subscribed viewer does not wait for the next scheduled one
    async fn request_keyframe(&self, track: &MediaTrack) -> Result<()>;

    /// Open a server-created data channel for signaling, labeled by the
    /// caller, and hand back its transport handle plus event stream
    async fn create_signaling_channel(&self, label: &str) -> Result<TransportPair>;

    fn ice_connection_state(&self) -> IceState;

    fn connection_state(&self) -> PeerState;

    async fn close(&self);
}

/// Factory for peer connections
#[async_trait]
pub trait RtcEngine: Send + Sync {
    /// Build one peer connection and the stream of events it will report
    async fn connect(&self) -> Result<(Arc<dyn RtcPeer>, mpsc::UnboundedReceiver<EngineEvent>)>;
}
