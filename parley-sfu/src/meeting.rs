//! Meeting membership and media fan-out
//!
//! A meeting owns its participant connections, replays existing media to
//! newcomers, fans published tracks out to everyone else, and retires
//! itself the moment the last participant leaves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

use crate::config::{Config, MeetingConfig, RtcConfig};
use crate::connection::ParticipantConnection;
use crate::engine::{MediaTrack, RtcEngine};
use crate::message::WireMessage;
use crate::transport::TransportPair;
use crate::types::{ConnectionId, MeetingId, StreamId};

/// Why a participant could not be admitted
#[derive(Debug, thiserror::Error)]
pub enum AdmitError {
    /// The meeting is at capacity
    #[error("meeting is full")]
    Full,
    /// The meeting emptied out and no longer admits anyone
    #[error("meeting not found")]
    Retired,
    /// The engine could not bring the participant up
    #[error(transparent)]
    Connect(#[from] crate::Error),
}

/// What connections report up to their meeting's event task
#[derive(Debug)]
pub enum MeetingEvent {
    /// A participant published a track; fan it out
    TrackSync {
        origin: ConnectionId,
        track: MediaTrack,
    },
    /// A participant's stream is now labeled; announce it
    UsernameSync {
        origin: ConnectionId,
        username: String,
        stream_id: StreamId,
    },
    /// A participant is gone; remove it from the meeting
    ConnectionClosed {
        id: ConnectionId,
        username: String,
        stream_id: Option<StreamId>,
    },
}

/// Outcome of removing a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// The id was not a member
    NotFound,
    /// Removed; other participants remain
    Removed,
    /// Removed the last participant; the meeting retired itself
    NowEmpty,
}

/// One meeting: membership, join replay, fan-out, retirement
pub struct Meeting {
    id: MeetingId,
    name: Option<String>,
    meeting_config: MeetingConfig,
    rtc_config: RtcConfig,
    engine: Arc<dyn RtcEngine>,
    connections: RwLock<HashMap<ConnectionId, Arc<ParticipantConnection>>>,
    /// Flipped when the last participant leaves; never cleared
    retired: AtomicBool,
    events_tx: mpsc::UnboundedSender<MeetingEvent>,
}

impl Meeting {
    pub fn new(
        id: MeetingId,
        name: Option<String>,
        config: &Config,
        engine: Arc<dyn RtcEngine>,
        events_tx: mpsc::UnboundedSender<MeetingEvent>,
    ) -> Self {
        Self {
            id,
            name,
            meeting_config: config.meeting.clone(),
            rtc_config: config.rtc.clone(),
            engine,
            connections: RwLock::new(HashMap::new()),
            retired: AtomicBool::new(false),
            events_tx,
        }
    }

    /// Admit a participant, bring up its connection, and replay the
    /// meeting's current media to it.
    ///
    /// Admission, id allocation, and insertion happen under the write
    /// lock; a rejected or failed join mutates nothing.
    pub async fn add_connection(
        &self,
        username: String,
        control: TransportPair,
    ) -> Result<ConnectionId, AdmitError> {
        let (connection, existing) = {
            let mut connections = self.connections.write().await;

            if self.retired.load(Ordering::SeqCst) {
                return Err(AdmitError::Retired);
            }
            if connections.len() >= self.meeting_config.max_connections {
                return Err(AdmitError::Full);
            }

            let mut id = ConnectionId::generate();
            while connections.contains_key(&id) {
                id = ConnectionId::generate();
            }

            let connection = ParticipantConnection::connect(
                id.clone(),
                username.clone(),
                control,
                self.engine.as_ref(),
                &self.rtc_config,
                self.events_tx.clone(),
            )
            .await?;

            let existing: Vec<Arc<ParticipantConnection>> = connections.values().cloned().collect();
            connections.insert(id, connection.clone());

            (connection, existing)
        };

        self.sync_new_connection(&connection, &existing).await;

        info!(
            meeting_id = %self.id,
            connection_id = %connection.id(),
            username = %username,
            "Participant joined meeting"
        );

        Ok(connection.id().clone())
    }

    /// Join replay: give the newcomer everything the meeting already has
    async fn sync_new_connection(
        &self,
        newcomer: &Arc<ParticipantConnection>,
        existing: &[Arc<ParticipantConnection>],
    ) {
        let mut members = HashMap::new();

        for peer in existing {
            for track in peer.local_tracks() {
                let want_keyframe = track.is_video();
                newcomer.forward_track(track.clone()).await;
                if want_keyframe {
                    // A fresh subscriber needs a fresh keyframe from the
                    // publisher to start decoding.
                    peer.request_keyframe(&track).await;
                }
            }
            if let Some(stream_id) = peer.stream_id() {
                members.insert(stream_id.to_string(), peer.username().to_string());
            }
        }

        // Members without a published stream are announced by their own
        // username-sync once they have one.
        if !members.is_empty() {
            let message = WireMessage::info_join(members);
            if let Err(e) = newcomer.send_message(&message).await {
                debug!(connection_id = %newcomer.id(), error = %e, "Failed to send join roster");
            }
        }
    }

    /// Remove a participant; retires the meeting when it empties out.
    ///
    /// The caller that sees [`Removal::NowEmpty`] is responsible for
    /// dropping the meeting from the pool.
    pub async fn remove_connection(&self, id: &ConnectionId, username: &str) -> Removal {
        let (connection, removal) = {
            let mut connections = self.connections.write().await;

            let Some(connection) = connections.remove(id) else {
                return Removal::NotFound;
            };

            let removal = if connections.is_empty() {
                self.retired.store(true, Ordering::SeqCst);
                Removal::NowEmpty
            } else {
                Removal::Removed
            };

            (connection, removal)
        };

        connection.close();

        match removal {
            Removal::NowEmpty => {
                info!(meeting_id = %self.id, "Last participant left, meeting retired");
            }
            Removal::Removed => {
                let message = WireMessage::info_left(connection.stream_id(), username);
                self.broadcast(&message, None).await;
                info!(
                    meeting_id = %self.id,
                    connection_id = %id,
                    username = %username,
                    "Participant left meeting"
                );
            }
            Removal::NotFound => {}
        }

        removal
    }

    /// Apply a track or username sync coming off the event stream
    pub async fn apply_sync(&self, event: MeetingEvent) {
        match event {
            MeetingEvent::TrackSync { origin, track } => {
                self.sync_track(&origin, track).await;
            }
            MeetingEvent::UsernameSync {
                origin,
                username,
                stream_id,
            } => {
                let message =
                    WireMessage::info_join(HashMap::from([(stream_id.to_string(), username)]));
                self.broadcast(&message, Some(&origin)).await;
            }
            // Removal belongs to the owner of the event stream.
            MeetingEvent::ConnectionClosed { .. } => {}
        }
    }

    async fn sync_track(&self, origin: &ConnectionId, track: MediaTrack) {
        let (originator, others) = {
            let connections = self.connections.read().await;
            (
                connections.get(origin).cloned(),
                connections
                    .values()
                    .filter(|c| c.id() != origin)
                    .cloned()
                    .collect::<Vec<_>>(),
            )
        };

        debug!(
            meeting_id = %self.id,
            origin = %origin,
            track_id = %track.id,
            subscribers = others.len(),
            "Fanning out published track"
        );

        for connection in &others {
            connection.forward_track(track.clone()).await;
        }

        // New subscribers need a keyframe to start decoding; with nobody
        // subscribed there is nothing to refresh.
        if track.is_video() && !others.is_empty() {
            if let Some(originator) = originator {
                originator.request_keyframe(&track).await;
            }
        }
    }

    /// Send an envelope to every member except `exclude`.
    ///
    /// Delivery to all current members completes before this returns.
    pub async fn broadcast(&self, message: &WireMessage, exclude: Option<&ConnectionId>) {
        let targets: Vec<Arc<ParticipantConnection>> = {
            let connections = self.connections.read().await;
            connections
                .values()
                .filter(|c| Some(c.id()) != exclude)
                .cloned()
                .collect()
        };

        for connection in targets {
            if let Err(e) = connection.send_message(message).await {
                debug!(
                    meeting_id = %self.id,
                    connection_id = %connection.id(),
                    error = %e,
                    "Broadcast delivery failed"
                );
            }
        }
    }

    /// Close every connection; their close paths empty and retire the
    /// meeting through the normal removal flow
    pub async fn close(&self) {
        let connections: Vec<Arc<ParticipantConnection>> =
            self.connections.read().await.values().cloned().collect();

        info!(meeting_id = %self.id, connections = connections.len(), "Closing meeting");
        for connection in connections {
            connection.close();
        }
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    #[must_use]
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn id(&self) -> &MeetingId {
        &self.id
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}
