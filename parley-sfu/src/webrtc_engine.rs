//! Production engine binding over the `webrtc` crate
//!
//! One `RTCPeerConnection` per participant. Engine callbacks are converted
//! into [`EngineEvent`]s on an unbounded channel; RTP forwarding attaches a
//! `TrackLocalStaticRTP` per forwarded track and pumps packets verbatim,
//! no transcoding and no buffering beyond one packet.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;

use crate::config::RtcConfig;
use crate::engine::{EngineEvent, IceState, MediaTrack, PeerState, RtcEngine, RtcPeer};
use crate::message::{IceCandidate, SdpKind, SessionDescription};
use crate::transport::{
    MessageTransport, TransportEvent, TransportKind, TransportPair, TransportStatus,
    TRANSPORT_EVENT_BUFFER,
};
use crate::types::StreamId;
use crate::{Error, Result};

/// Engine backed by the `webrtc` crate
pub struct WebRtcEngine {
    config: RtcConfig,
}

impl WebRtcEngine {
    #[must_use]
    pub fn new(config: RtcConfig) -> Self {
        Self { config }
    }

    async fn build_peer_connection(&self) -> Result<Arc<RTCPeerConnection>> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = webrtc::interceptor::registry::Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = self
            .config
            .ice_servers
            .iter()
            .map(|s| RTCIceServer {
                urls: s.urls.clone(),
                username: s.username.clone().unwrap_or_default(),
                credential: s.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = api.new_peer_connection(config).await?;
        Ok(Arc::new(pc))
    }
}

#[async_trait]
impl RtcEngine for WebRtcEngine {
    async fn connect(&self) -> Result<(Arc<dyn RtcPeer>, mpsc::UnboundedReceiver<EngineEvent>)> {
        let pc = self.build_peer_connection().await?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let peer = Arc::new(WebRtcPeer {
            pc,
            cancel: CancellationToken::new(),
            forwarded: parking_lot::Mutex::new(HashSet::new()),
        });
        peer.install_callbacks(events_tx);

        Ok((peer, events_rx))
    }
}

/// One live `RTCPeerConnection` behind the [`RtcPeer`] interface
pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    /// Cancelled on close; silences callbacks and stops RTP pumps
    cancel: CancellationToken,
    /// Track ids already attached for forwarding
    forwarded: parking_lot::Mutex<HashSet<String>>,
}

impl WebRtcPeer {
    fn install_callbacks(&self, events: mpsc::UnboundedSender<EngineEvent>) {
        let tx = events.clone();
        let cancel = self.cancel.clone();
        self.pc.on_negotiation_needed(Box::new(move || {
            let tx = tx.clone();
            let cancel = cancel.clone();
            Box::pin(async move {
                if !cancel.is_cancelled() {
                    let _ = tx.send(EngineEvent::NegotiationNeeded);
                }
            })
        }));

        let tx = events.clone();
        let cancel = self.cancel.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let tx = tx.clone();
                let cancel = cancel.clone();
                Box::pin(async move {
                    if cancel.is_cancelled() {
                        return;
                    }
                    let wire = match candidate {
                        Some(c) => match c.to_json() {
                            Ok(init) => Some(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            }),
                            Err(e) => {
                                warn!(error = %e, "Failed to serialize ICE candidate");
                                return;
                            }
                        },
                        None => None,
                    };
                    let _ = tx.send(EngineEvent::IceCandidate(wire));
                })
            }));

        let tx = events.clone();
        let cancel = self.cancel.clone();
        self.pc.on_ice_connection_state_change(Box::new(
            move |state: RTCIceConnectionState| {
                let tx = tx.clone();
                let cancel = cancel.clone();
                Box::pin(async move {
                    if !cancel.is_cancelled() {
                        let _ = tx.send(EngineEvent::IceConnectionState(map_ice_state(state)));
                    }
                })
            },
        ));

        let tx = events.clone();
        let cancel = self.cancel.clone();
        self.pc.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let tx = tx.clone();
                let cancel = cancel.clone();
                Box::pin(async move {
                    if !cancel.is_cancelled() {
                        let _ = tx.send(EngineEvent::ConnectionState(map_peer_state(state)));
                    }
                })
            },
        ));

        let tx = events.clone();
        let cancel = self.cancel.clone();
        self.pc.on_signaling_state_change(Box::new(move |state| {
            let tx = tx.clone();
            let cancel = cancel.clone();
            Box::pin(async move {
                if !cancel.is_cancelled() {
                    let _ = tx.send(EngineEvent::SignalingState(state.to_string()));
                }
            })
        }));

        let tx = events;
        let cancel = self.cancel.clone();
        self.pc
            .on_track(Box::new(move |track, _receiver, _transceiver| {
                let tx = tx.clone();
                let cancel = cancel.clone();
                Box::pin(async move {
                    if cancel.is_cancelled() {
                        return;
                    }
                    let stream_id = track.stream_id();
                    let media = MediaTrack {
                        id: track.id(),
                        stream_id: (!stream_id.is_empty()).then(|| StreamId::new(stream_id)),
                        kind: track.kind().into(),
                        ssrc: track.ssrc(),
                        remote: Some(track),
                    };
                    let _ = tx.send(EngineEvent::Track(media));
                })
            }));
    }
}

#[async_trait]
impl RtcPeer for WebRtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        Ok(to_wire(&offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        Ok(to_wire(&answer))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.pc
            .set_local_description(to_engine(&description)?)
            .await?;
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(to_engine(&description)?)
            .await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn forward_track(&self, track: MediaTrack) -> Result<()> {
        let remote = track
            .remote
            .clone()
            .ok_or_else(|| Error::InvalidTrack(format!("track {} has no RTP source", track.id)))?;

        // Duplicate-sender guard: the same track may be offered on every
        // renegotiation, attach it once.
        if !self.forwarded.lock().insert(track.id.clone()) {
            return Ok(());
        }

        let stream_label = track
            .stream_id
            .as_ref()
            .map_or(track.id.as_str(), StreamId::as_str)
            .to_string();
        let local = Arc::new(TrackLocalStaticRTP::new(
            remote.codec().capability,
            track.id.clone(),
            stream_label,
        ));

        self.pc
            .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        spawn_rtp_pump(remote, local, self.cancel.clone(), track.id);
        Ok(())
    }

    async fn request_keyframe(&self, track: &MediaTrack) -> Result<()> {
        let pli = PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc: track.ssrc,
        };
        self.pc.write_rtcp(&[Box::new(pli)]).await?;
        Ok(())
    }

    async fn create_signaling_channel(&self, label: &str) -> Result<TransportPair> {
        let dc = self.pc.create_data_channel(label, None).await?;
        let (events_tx, events_rx) = mpsc::channel(TRANSPORT_EVENT_BUFFER);

        let transport = Arc::new(DataChannelTransport { dc });
        transport.install_callbacks(events_tx);

        Ok(TransportPair::new(transport, events_rx))
    }

    fn ice_connection_state(&self) -> IceState {
        map_ice_state(self.pc.ice_connection_state())
    }

    fn connection_state(&self) -> PeerState {
        map_peer_state(self.pc.connection_state())
    }

    async fn close(&self) {
        self.cancel.cancel();
        if let Err(e) = self.pc.close().await {
            debug!(error = %e, "Peer connection close reported an error");
        }
    }
}

/// Read RTP from the remote track and write it verbatim to the local one
fn spawn_rtp_pump(
    remote: Arc<TrackRemote>,
    local: Arc<TrackLocalStaticRTP>,
    cancel: CancellationToken,
    track_id: String,
) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500]; // MTU size

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!(track_id = %track_id, "RTP pump cancelled");
                    break;
                }
                result = remote.read(&mut buf) => {
                    match result {
                        Ok((rtp_packet, _attributes)) => {
                            if let Err(e) = local.write_rtp(&rtp_packet).await {
                                debug!(track_id = %track_id, error = %e, "RTP write failed, stopping pump");
                                break;
                            }
                        }
                        Err(e) => {
                            debug!(track_id = %track_id, error = %e, "RTP read failed, stopping pump");
                            break;
                        }
                    }
                }
            }
        }
    });
}

/// Server-created data channel behind the transport interface
struct DataChannelTransport {
    dc: Arc<RTCDataChannel>,
}

impl DataChannelTransport {
    fn install_callbacks(&self, events: mpsc::Sender<TransportEvent>) {
        let tx = events.clone();
        self.dc.on_open(Box::new(move || {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(TransportEvent::Open).await;
            })
        }));

        let tx = events.clone();
        self.dc
            .on_message(Box::new(move |msg: DataChannelMessage| {
                let tx = tx.clone();
                Box::pin(async move {
                    if !msg.is_string {
                        debug!("Ignoring binary frame on signaling channel");
                        return;
                    }
                    match String::from_utf8(msg.data.to_vec()) {
                        Ok(text) => {
                            let _ = tx.send(TransportEvent::Message(text)).await;
                        }
                        Err(e) => debug!(error = %e, "Dropping non-UTF-8 signaling frame"),
                    }
                })
            }));

        let tx = events.clone();
        self.dc.on_error(Box::new(move |err| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(TransportEvent::Error(err.to_string())).await;
            })
        }));

        let tx = events;
        self.dc.on_close(Box::new(move || {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(TransportEvent::Closed).await;
            })
        }));
    }
}

#[async_trait]
impl MessageTransport for DataChannelTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::PeerChannel
    }

    fn status(&self) -> TransportStatus {
        match self.dc.ready_state() {
            RTCDataChannelState::Connecting => TransportStatus::Connecting,
            RTCDataChannelState::Open => TransportStatus::Open,
            RTCDataChannelState::Closing => TransportStatus::Closing,
            _ => TransportStatus::Closed,
        }
    }

    async fn send(&self, text: &str) -> Result<()> {
        self.dc
            .send_text(text.to_string())
            .await
            .map_err(|_| Error::TransportClosed)?;
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.dc.close().await {
            debug!(error = %e, "Data channel close reported an error");
        }
    }
}

fn to_wire(desc: &RTCSessionDescription) -> SessionDescription {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        _ => SdpKind::Answer,
    };
    SessionDescription {
        kind,
        sdp: desc.sdp.clone(),
    }
}

fn to_engine(desc: &SessionDescription) -> Result<RTCSessionDescription> {
    let converted = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp.clone())?,
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp.clone())?,
        SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp.clone())?,
        SdpKind::Rollback => {
            return Err(Error::Engine("rollback descriptions are not supported".into()))
        }
    };
    Ok(converted)
}

fn map_ice_state(state: RTCIceConnectionState) -> IceState {
    match state {
        RTCIceConnectionState::New => IceState::New,
        RTCIceConnectionState::Checking => IceState::Checking,
        RTCIceConnectionState::Connected => IceState::Connected,
        RTCIceConnectionState::Completed => IceState::Completed,
        RTCIceConnectionState::Disconnected => IceState::Disconnected,
        RTCIceConnectionState::Failed => IceState::Failed,
        RTCIceConnectionState::Closed => IceState::Closed,
        RTCIceConnectionState::Unspecified => IceState::Unspecified,
    }
}

fn map_peer_state(state: RTCPeerConnectionState) -> PeerState {
    match state {
        RTCPeerConnectionState::New => PeerState::New,
        RTCPeerConnectionState::Connecting => PeerState::Connecting,
        RTCPeerConnectionState::Connected => PeerState::Connected,
        RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
        RTCPeerConnectionState::Failed => PeerState::Failed,
        RTCPeerConnectionState::Closed => PeerState::Closed,
        RTCPeerConnectionState::Unspecified => PeerState::Unspecified,
    }
}
