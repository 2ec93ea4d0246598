//! Process-wide meeting pool
//!
//! Owns every live meeting and hands out wire-level replies for create and
//! join. Each meeting gets an event task that drains its sync events and
//! drops the meeting from the pool the moment it empties; there is no
//! periodic sweep.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::engine::RtcEngine;
use crate::meeting::{AdmitError, Meeting, MeetingEvent, Removal};
use crate::message::WireMessage;
use crate::transport::TransportPair;
use crate::types::MeetingId;

type MeetingMap = Arc<DashMap<MeetingId, Arc<Meeting>>>;

/// All live meetings; constructed once and shared by the accept layer
pub struct MeetingPool {
    config: Config,
    engine: Arc<dyn RtcEngine>,
    meetings: MeetingMap,
}

impl MeetingPool {
    pub fn new(config: Config, engine: Arc<dyn RtcEngine>) -> Self {
        Self {
            config,
            engine,
            meetings: Arc::new(DashMap::new()),
        }
    }

    /// Create a fresh meeting and join the caller to it.
    ///
    /// The reply is the caller's first signaling frame: `joined` on
    /// success, `error` otherwise.
    pub async fn create(&self, username: String, control: TransportPair) -> WireMessage {
        let mut id = MeetingId::generate();
        while self.meetings.contains_key(&id) {
            id = MeetingId::generate();
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let meeting = Arc::new(Meeting::new(
            id.clone(),
            None,
            &self.config,
            Arc::clone(&self.engine),
            events_tx,
        ));
        self.meetings.insert(id.clone(), Arc::clone(&meeting));

        info!(
            meeting_id = %id,
            total_meetings = self.meetings.len(),
            "Created meeting"
        );

        spawn_event_task(Arc::clone(&self.meetings), meeting, events_rx);

        self.join(username, &id, control).await
    }

    /// Join an existing meeting; the reply is the caller's first frame
    pub async fn join(
        &self,
        username: String,
        meeting_id: &MeetingId,
        control: TransportPair,
    ) -> WireMessage {
        let Some(meeting) = self.meetings.get(meeting_id).map(|m| Arc::clone(m.value())) else {
            debug!(meeting_id = %meeting_id, "Join rejected, unknown meeting");
            return WireMessage::error(crate::Error::MeetingNotFound.to_string());
        };

        match meeting.add_connection(username, control).await {
            Ok(connection_id) => {
                debug!(
                    meeting_id = %meeting_id,
                    connection_id = %connection_id,
                    "Participant admitted"
                );
                WireMessage::joined(meeting_id)
            }
            Err(e @ (AdmitError::Full | AdmitError::Retired)) => {
                debug!(meeting_id = %meeting_id, error = %e, "Join rejected");
                WireMessage::error(e.to_string())
            }
            Err(AdmitError::Connect(e)) => {
                warn!(meeting_id = %meeting_id, error = %e, "Failed to connect participant");
                WireMessage::error(e.to_string())
            }
        }
    }

    /// Close every meeting; used on graceful shutdown
    pub async fn shutdown(&self) {
        let meetings: Vec<Arc<Meeting>> = self
            .meetings
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        info!(meetings = meetings.len(), "Shutting down meeting pool");
        for meeting in meetings {
            meeting.close().await;
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.meetings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.meetings.is_empty()
    }

    #[must_use]
    pub fn get(&self, meeting_id: &MeetingId) -> Option<Arc<Meeting>> {
        self.meetings
            .get(meeting_id)
            .map(|entry| Arc::clone(entry.value()))
    }
}

/// Drain one meeting's events until a removal empties it, then drop the
/// meeting from the map and stop
fn spawn_event_task(
    meetings: MeetingMap,
    meeting: Arc<Meeting>,
    mut events: mpsc::UnboundedReceiver<MeetingEvent>,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                MeetingEvent::ConnectionClosed { id, username, .. } => {
                    if meeting.remove_connection(&id, &username).await == Removal::NowEmpty {
                        meetings.remove(meeting.id());
                        info!(
                            meeting_id = %meeting.id(),
                            total_meetings = meetings.len(),
                            "Meeting emptied, removed from pool"
                        );
                        break;
                    }
                }
                event => meeting.apply_sync(event).await,
            }
        }
    });
}
