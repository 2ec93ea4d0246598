//! One participant inside a meeting
//!
//! Couples a [`PeerSession`] with a [`SignalingLink`] and shuttles between
//! them: inbound signaling frames drive the session, session events go back
//! out as signaling or up to the meeting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::config::RtcConfig;
use crate::engine::{MediaTrack, RtcEngine};
use crate::link::{LinkEvent, SignalingLink};
use crate::meeting::MeetingEvent;
use crate::message::{IceCandidate, MessageType, SdpKind, SessionDescription, WireMessage};
use crate::session::{PeerSession, SessionEvent};
use crate::transport::TransportPair;
use crate::types::{ConnectionId, StreamId};

/// A connected participant: engine session plus signaling link
pub struct ParticipantConnection {
    id: ConnectionId,
    username: String,
    session: Arc<PeerSession>,
    link: Arc<SignalingLink>,
    meeting_events: mpsc::UnboundedSender<MeetingEvent>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl ParticipantConnection {
    /// Bring up the engine peer, the server-created signaling channel
    /// (labeled with the connection id), the link, and the session, then
    /// start the dispatch task.
    pub async fn connect(
        id: ConnectionId,
        username: String,
        control: TransportPair,
        engine: &dyn RtcEngine,
        config: &RtcConfig,
        meeting_events: mpsc::UnboundedSender<MeetingEvent>,
    ) -> crate::Result<Arc<Self>> {
        let (peer, engine_events) = engine.connect().await?;
        let channel = peer.create_signaling_channel(id.as_str()).await?;

        let (session, session_events) = PeerSession::spawn(peer, engine_events, config);
        let (link, link_events) = SignalingLink::spawn(control, channel);

        let connection = Arc::new(Self {
            id,
            username,
            session,
            link,
            meeting_events,
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });

        let task = Arc::clone(&connection);
        tokio::spawn(task.dispatch(link_events, session_events));

        Ok(connection)
    }

    async fn dispatch(
        self: Arc<Self>,
        mut link_events: mpsc::UnboundedReceiver<LinkEvent>,
        mut session_events: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                event = link_events.recv() => match event {
                    Some(LinkEvent::Message(message)) => self.handle_signaling(message).await,
                    Some(LinkEvent::Closed) | None => {
                        self.close();
                        break;
                    }
                },
                event = session_events.recv() => match event {
                    Some(SessionEvent::Closed) | None => {
                        self.close();
                        break;
                    }
                    Some(event) => self.handle_session_event(event).await,
                },
            }
        }
    }

    #[instrument(skip_all, fields(connection_id = %self.id, kind = message.kind.as_str()))]
    async fn handle_signaling(&self, message: WireMessage) {
        match message.kind {
            MessageType::Offer => match serde_json::from_value::<SessionDescription>(message.payload) {
                Ok(description) => self.session.set_remote_description(description, true).await,
                Err(e) => debug!(error = %e, "Malformed offer payload"),
            },
            MessageType::Answer => match serde_json::from_value::<SessionDescription>(message.payload) {
                Ok(description) => self.session.set_remote_description(description, false).await,
                Err(e) => debug!(error = %e, "Malformed answer payload"),
            },
            MessageType::IceCandidate => {
                // The payload may be null: end-of-candidates.
                match serde_json::from_value::<Option<IceCandidate>>(message.payload) {
                    Ok(candidate) => self.session.add_ice_candidate(candidate).await,
                    Err(e) => debug!(error = %e, "Malformed ICE candidate payload"),
                }
            }
            _ => debug!("Ignoring unhandled signaling message"),
        }
    }

    async fn handle_session_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::LocalDescription(description) => {
                let message = match description.kind {
                    SdpKind::Offer => WireMessage::offer(&description),
                    _ => WireMessage::answer(&description),
                };
                if let Err(e) = self.link.send(&message).await {
                    debug!(connection_id = %self.id, error = %e, "Failed to send local description");
                }
            }
            SessionEvent::IceCandidate(candidate) => {
                let message = WireMessage::ice_candidate(&candidate);
                if let Err(e) = self.link.send(&message).await {
                    debug!(connection_id = %self.id, error = %e, "Failed to send ICE candidate");
                }
            }
            SessionEvent::TrackPublished(track) => {
                let _ = self.meeting_events.send(MeetingEvent::TrackSync {
                    origin: self.id.clone(),
                    track,
                });
            }
            SessionEvent::StreamLabeled(stream_id) => {
                let _ = self.meeting_events.send(MeetingEvent::UsernameSync {
                    origin: self.id.clone(),
                    username: self.username.clone(),
                    stream_id,
                });
            }
            // Closed is routed in the dispatch loop.
            SessionEvent::Closed => {}
        }
    }

    /// Send a signaling envelope to this participant
    pub async fn send_message(&self, message: &WireMessage) -> crate::Result<()> {
        self.link.send(message).await
    }

    /// Attach another participant's track to this connection
    pub async fn forward_track(&self, track: MediaTrack) {
        self.session.forward_track(track).await;
    }

    /// Ask this participant's publisher for a keyframe
    pub async fn request_keyframe(&self, track: &MediaTrack) {
        self.session.request_keyframe(track).await;
    }

    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// The stream this participant publishes, if known yet
    #[must_use]
    pub fn stream_id(&self) -> Option<StreamId> {
        self.session.stream_id()
    }

    /// Snapshot of the tracks this participant has published
    #[must_use]
    pub fn local_tracks(&self) -> Vec<MediaTrack> {
        self.session.local_tracks()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Tear the participant down and notify the meeting exactly once.
    ///
    /// Every failure path funnels here: engine errors, link closure, timer
    /// expiry, meeting shutdown. Safe to call repeatedly.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        debug!(connection_id = %self.id, "Closing participant connection");
        self.cancel.cancel();
        self.session.close();

        let link = Arc::clone(&self.link);
        tokio::spawn(async move {
            link.close().await;
        });

        let _ = self.meeting_events.send(MeetingEvent::ConnectionClosed {
            id: self.id.clone(),
            username: self.username.clone(),
            stream_id: self.session.stream_id(),
        });
    }
}
