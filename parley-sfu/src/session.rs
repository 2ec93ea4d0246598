//! Per-participant peer connection session
//!
//! Owns one engine peer connection and turns its event stream into
//! signaling-level [`SessionEvent`]s. The session also enforces the two
//! liveness deadlines: a fresh connection must reach ICE connected within
//! the connect timeout, and a disconnected one must recover within the
//! reconnect timeout.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RtcConfig;
use crate::engine::{EngineEvent, IceState, MediaTrack, PeerState, RtcPeer};
use crate::message::{IceCandidate, SessionDescription};
use crate::types::StreamId;

/// What a session reports to its participant connection
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A local description was applied and must go to the client
    LocalDescription(SessionDescription),
    /// A locally gathered candidate must go to the client
    IceCandidate(IceCandidate),
    /// A remote track arrived and is ready to fan out
    TrackPublished(MediaTrack),
    /// The session learned which stream this participant publishes
    StreamLabeled(StreamId),
    /// The session is gone; terminal, reported once
    Closed,
}

/// Delayed action that is cancelled when its handle is dropped
struct ScopedTimer {
    handle: JoinHandle<()>,
}

impl ScopedTimer {
    fn spawn<F>(delay: Duration, action: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            action.await;
        });
        Self { handle }
    }
}

impl Drop for ScopedTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// One participant's peer connection lifecycle
pub struct PeerSession {
    peer: Arc<dyn RtcPeer>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    /// Stops the engine event task
    cancel: CancellationToken,
    closed: AtomicBool,
    connect_timer: parking_lot::Mutex<Option<ScopedTimer>>,
    reconnect_timer: parking_lot::Mutex<Option<ScopedTimer>>,
    /// Canonical stream: the one carried by the first labeled track
    stream_id: parking_lot::Mutex<Option<StreamId>>,
    local_tracks: parking_lot::Mutex<Vec<MediaTrack>>,
    reconnect_timeout: Duration,
}

impl PeerSession {
    /// Wrap an engine peer and start observing it.
    ///
    /// The connect deadline starts immediately; the returned receiver
    /// carries everything the session reports until `Closed`.
    pub fn spawn(
        peer: Arc<dyn RtcPeer>,
        engine_events: mpsc::UnboundedReceiver<EngineEvent>,
        config: &RtcConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let session = Arc::new(Self {
            peer,
            events_tx,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            connect_timer: parking_lot::Mutex::new(None),
            reconnect_timer: parking_lot::Mutex::new(None),
            stream_id: parking_lot::Mutex::new(None),
            local_tracks: parking_lot::Mutex::new(Vec::new()),
            reconnect_timeout: config.reconnect_timeout(),
        });

        session.arm_connect_timer(config.connect_timeout());

        let task = Arc::clone(&session);
        tokio::spawn(task.run(engine_events));

        (session, events_rx)
    }

    async fn run(self: Arc<Self>, mut engine_events: mpsc::UnboundedReceiver<EngineEvent>) {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                event = engine_events.recv() => {
                    match event {
                        Some(event) => self.handle_engine_event(event).await,
                        None => {
                            // Engine dropped its sender; nothing more will come.
                            self.close();
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn handle_engine_event(self: &Arc<Self>, event: EngineEvent) {
        match event {
            EngineEvent::NegotiationNeeded => {
                debug!("Negotiation needed, creating offer");
                self.set_local_description(None).await;
            }
            EngineEvent::IceCandidate(Some(candidate)) => {
                let _ = self.events_tx.send(SessionEvent::IceCandidate(candidate));
            }
            EngineEvent::IceCandidate(None) => {
                debug!("ICE candidate gathering complete");
            }
            EngineEvent::IceConnectionState(state) => {
                debug!(state = ?state, "ICE connection state changed");
                if state.is_connected() {
                    self.clear_timers();
                } else if matches!(state, IceState::Failed | IceState::Disconnected) {
                    self.arm_reconnect_timer();
                }
            }
            EngineEvent::ConnectionState(state) => {
                debug!(state = ?state, "Peer connection state changed");
                if matches!(state, PeerState::Closed | PeerState::Disconnected) {
                    self.close();
                }
            }
            EngineEvent::SignalingState(state) => {
                debug!(state = %state, "Signaling state changed");
            }
            EngineEvent::Track(track) => self.ingest_track(track),
        }
    }

    /// Apply a local description and report it.
    ///
    /// With `None`, a fresh offer is created first; with a supplied answer,
    /// that answer is applied. Engine failure closes the session.
    pub async fn set_local_description(&self, answer: Option<SessionDescription>) {
        let applied = async {
            let description = match answer {
                Some(answer) => answer,
                None => self.peer.create_offer().await?,
            };
            self.peer.set_local_description(description.clone()).await?;
            Ok::<_, crate::Error>(description)
        }
        .await;

        match applied {
            Ok(description) => {
                let _ = self
                    .events_tx
                    .send(SessionEvent::LocalDescription(description));
            }
            Err(e) => {
                warn!(error = %e, "Failed to apply local description, closing session");
                self.close();
            }
        }
    }

    /// Apply the client's description; a remote offer triggers the answer
    /// continuation through [`Self::set_local_description`]
    pub async fn set_remote_description(&self, description: SessionDescription, is_offer: bool) {
        if let Err(e) = self.peer.set_remote_description(description).await {
            warn!(error = %e, "Failed to apply remote description, closing session");
            self.close();
            return;
        }

        if is_offer {
            match self.peer.create_answer().await {
                Ok(answer) => self.set_local_description(Some(answer)).await,
                Err(e) => {
                    warn!(error = %e, "Failed to create answer, closing session");
                    self.close();
                }
            }
        }
    }

    /// Add a trickle candidate from the client.
    ///
    /// A missing payload or an empty candidate string only marks the end
    /// of gathering and is dropped.
    pub async fn add_ice_candidate(&self, candidate: Option<IceCandidate>) {
        let Some(candidate) = candidate else {
            debug!("Remote ICE gathering complete");
            return;
        };
        if candidate.is_end_of_candidates() {
            debug!("Remote ICE gathering complete");
            return;
        }

        if let Err(e) = self.peer.add_ice_candidate(candidate).await {
            warn!(error = %e, "Failed to add ICE candidate, closing session");
            self.close();
        }
    }

    /// Attach another participant's track to this peer connection
    pub async fn forward_track(&self, track: MediaTrack) {
        if let Err(e) = self.peer.forward_track(track).await {
            warn!(error = %e, "Failed to forward track, closing session");
            self.close();
        }
    }

    /// Ask this participant's publisher for a keyframe
    pub async fn request_keyframe(&self, track: &MediaTrack) {
        if let Err(e) = self.peer.request_keyframe(track).await {
            debug!(error = %e, "Keyframe request failed");
        }
    }

    /// Open the server-created signaling data channel on this connection
    pub async fn create_signaling_channel(&self, label: &str) -> crate::Result<crate::transport::TransportPair> {
        self.peer.create_signaling_channel(label).await
    }

    fn ingest_track(&self, track: MediaTrack) {
        if let Some(sid) = track.stream_id.clone() {
            let newly_labeled = {
                let mut canonical = self.stream_id.lock();
                match canonical.as_ref() {
                    None => {
                        *canonical = Some(sid.clone());
                        true
                    }
                    Some(_) => false,
                }
            };
            if newly_labeled {
                let _ = self.events_tx.send(SessionEvent::StreamLabeled(sid.clone()));
            }

            let is_canonical = self.stream_id.lock().as_ref() == Some(&sid);
            if is_canonical {
                self.local_tracks.lock().push(track.clone());
            }
        }

        let _ = self.events_tx.send(SessionEvent::TrackPublished(track));
    }

    fn arm_connect_timer(self: &Arc<Self>, delay: Duration) {
        let weak = Arc::downgrade(self);
        *self.connect_timer.lock() = Some(ScopedTimer::spawn(delay, async move {
            if let Some(session) = weak.upgrade() {
                session.on_connect_deadline();
            }
        }));
    }

    fn on_connect_deadline(&self) {
        drop(self.connect_timer.lock().take());
        if self.peer.ice_connection_state().is_connected() {
            debug!("Connect deadline passed with ICE already connected");
        } else {
            warn!("Peer connection did not connect in time, closing session");
            self.close();
        }
    }

    /// Give a disconnected connection one recovery window, unless a
    /// deadline is already pending
    fn arm_reconnect_timer(self: &Arc<Self>) {
        if self.connect_timer.lock().is_some() || self.reconnect_timer.lock().is_some() {
            return;
        }

        debug!(timeout = ?self.reconnect_timeout, "ICE lost, starting reconnect deadline");
        let weak = Arc::downgrade(self);
        *self.reconnect_timer.lock() = Some(ScopedTimer::spawn(self.reconnect_timeout, async move {
            if let Some(session) = weak.upgrade() {
                drop(session.reconnect_timer.lock().take());
                warn!("Peer connection did not recover in time, closing session");
                session.close();
            }
        }));
    }

    fn clear_timers(&self) {
        *self.connect_timer.lock() = None;
        *self.reconnect_timer.lock() = None;
    }

    /// The stream this participant publishes, once the first labeled track
    /// has arrived
    #[must_use]
    pub fn stream_id(&self) -> Option<StreamId> {
        self.stream_id.lock().clone()
    }

    /// Snapshot of the tracks received on the canonical stream
    #[must_use]
    pub fn local_tracks(&self) -> Vec<MediaTrack> {
        self.local_tracks.lock().clone()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Tear the session down: stop timers and the event task, report
    /// `Closed` once, and detach into the engine teardown.
    ///
    /// Safe to call from any path, any number of times.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.clear_timers();
        self.cancel.cancel();
        let _ = self.events_tx.send(SessionEvent::Closed);

        let peer = Arc::clone(&self.peer);
        tokio::spawn(async move {
            peer.close().await;
        });
    }
}
