//! Test fakes and fixtures for parley-sfu tests
//!
//! Provides in-memory stand-ins for the RTC engine and for signaling
//! transports so that session, meeting, and pool logic can be tested
//! without bringing up real peer connections.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::engine::{EngineEvent, IceState, MediaTrack, PeerState, RtcEngine, RtcPeer};
use crate::error::Error;
use crate::message::{IceCandidate, SdpKind, SessionDescription};
use crate::transport::{
    MessageTransport, TransportEvent, TransportKind, TransportPair, TransportStatus,
    TRANSPORT_EVENT_BUFFER,
};

/// Engine operations a [`FakePeer`] records
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCall {
    CreateOffer,
    CreateAnswer,
    SetLocalDescription,
    SetRemoteDescription,
    AddIceCandidate,
    ForwardTrack,
    RequestKeyframe,
    CreateSignalingChannel,
    Close,
}

/// In-memory [`RtcPeer`] that records calls and answers with canned SDPs
pub struct FakePeer {
    calls: parking_lot::Mutex<Vec<PeerCall>>,
    offers: AtomicUsize,
    ice_state: parking_lot::Mutex<IceState>,
    peer_state: parking_lot::Mutex<PeerState>,
    forwarded: parking_lot::Mutex<Vec<String>>,
    keyframes: parking_lot::Mutex<Vec<String>>,
    channels: parking_lot::Mutex<Vec<Arc<FakeTransport>>>,
    fail_next: AtomicBool,
    closed: AtomicBool,
}

impl FakePeer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            calls: parking_lot::Mutex::new(Vec::new()),
            offers: AtomicUsize::new(0),
            ice_state: parking_lot::Mutex::new(IceState::New),
            peer_state: parking_lot::Mutex::new(PeerState::New),
            forwarded: parking_lot::Mutex::new(Vec::new()),
            keyframes: parking_lot::Mutex::new(Vec::new()),
            channels: parking_lot::Mutex::new(Vec::new()),
            fail_next: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Make the next engine operation fail with an injected error
    pub fn fail_next_call(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn set_ice_state(&self, state: IceState) {
        *self.ice_state.lock() = state;
    }

    pub fn set_peer_state(&self, state: PeerState) {
        *self.peer_state.lock() = state;
    }

    #[must_use]
    pub fn saw_call(&self, call: &PeerCall) -> bool {
        self.calls.lock().contains(call)
    }

    #[must_use]
    pub fn calls(&self) -> Vec<PeerCall> {
        self.calls.lock().clone()
    }

    /// Track ids passed to `forward_track`, in order
    #[must_use]
    pub fn forwarded_track_ids(&self) -> Vec<String> {
        self.forwarded.lock().clone()
    }

    /// Track ids passed to `request_keyframe`, in order
    #[must_use]
    pub fn keyframe_track_ids(&self) -> Vec<String> {
        self.keyframes.lock().clone()
    }

    /// Fake transports created through `create_signaling_channel`
    #[must_use]
    pub fn channels(&self) -> Vec<Arc<FakeTransport>> {
        self.channels.lock().clone()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn record(&self, call: PeerCall) -> crate::Result<()> {
        self.calls.lock().push(call);
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(Error::Engine("injected failure".to_string()));
        }
        Ok(())
    }
}

impl Default for FakePeer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RtcPeer for FakePeer {
    async fn create_offer(&self) -> crate::Result<SessionDescription> {
        self.record(PeerCall::CreateOffer)?;
        let n = self.offers.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: format!("v=0\r\no=fake-offer-{n}\r\n"),
        })
    }

    async fn create_answer(&self) -> crate::Result<SessionDescription> {
        self.record(PeerCall::CreateAnswer)?;
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: "v=0\r\no=fake-answer\r\n".to_string(),
        })
    }

    async fn set_local_description(&self, _description: SessionDescription) -> crate::Result<()> {
        self.record(PeerCall::SetLocalDescription)
    }

    async fn set_remote_description(&self, _description: SessionDescription) -> crate::Result<()> {
        self.record(PeerCall::SetRemoteDescription)
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> crate::Result<()> {
        self.record(PeerCall::AddIceCandidate)
    }

    async fn forward_track(&self, track: MediaTrack) -> crate::Result<()> {
        self.record(PeerCall::ForwardTrack)?;
        self.forwarded.lock().push(track.id);
        Ok(())
    }

    async fn request_keyframe(&self, track: &MediaTrack) -> crate::Result<()> {
        self.record(PeerCall::RequestKeyframe)?;
        self.keyframes.lock().push(track.id.clone());
        Ok(())
    }

    async fn create_signaling_channel(&self, _label: &str) -> crate::Result<TransportPair> {
        self.record(PeerCall::CreateSignalingChannel)?;
        let (fake, pair) = FakeTransport::pair(TransportKind::PeerChannel);
        self.channels.lock().push(fake);
        Ok(pair)
    }

    fn ice_connection_state(&self) -> IceState {
        *self.ice_state.lock()
    }

    fn connection_state(&self) -> PeerState {
        *self.peer_state.lock()
    }

    async fn close(&self) {
        let _ = self.record(PeerCall::Close);
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// In-memory [`MessageTransport`] whose incoming events are driven by the
/// test through the retained handle
pub struct FakeTransport {
    kind: TransportKind,
    status: parking_lot::Mutex<TransportStatus>,
    sent: parking_lot::Mutex<Vec<String>>,
    events_tx: mpsc::Sender<TransportEvent>,
    closed: AtomicBool,
}

impl FakeTransport {
    /// Build a transport plus the [`TransportPair`] handed to the code
    /// under test; the returned `Arc` drives and inspects it.
    #[must_use]
    pub fn pair(kind: TransportKind) -> (Arc<Self>, TransportPair) {
        let (events_tx, events_rx) = mpsc::channel(TRANSPORT_EVENT_BUFFER);
        let fake = Arc::new(Self {
            kind,
            status: parking_lot::Mutex::new(TransportStatus::Connecting),
            sent: parking_lot::Mutex::new(Vec::new()),
            events_tx,
            closed: AtomicBool::new(false),
        });
        let pair = TransportPair::new(fake.clone(), events_rx);
        (fake, pair)
    }

    /// Mark the transport open and deliver the `Open` event
    pub async fn open(&self) {
        *self.status.lock() = TransportStatus::Open;
        let _ = self.events_tx.send(TransportEvent::Open).await;
    }

    pub async fn emit_message(&self, text: impl Into<String>) {
        let _ = self
            .events_tx
            .send(TransportEvent::Message(text.into()))
            .await;
    }

    pub async fn emit_error(&self, reason: impl Into<String>) {
        let _ = self
            .events_tx
            .send(TransportEvent::Error(reason.into()))
            .await;
    }

    /// Remote-initiated close: status flips and `Closed` is delivered
    pub async fn emit_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        *self.status.lock() = TransportStatus::Closed;
        let _ = self.events_tx.send(TransportEvent::Closed).await;
    }

    /// Everything sent through the transport, in order
    #[must_use]
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageTransport for FakeTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn status(&self) -> TransportStatus {
        *self.status.lock()
    }

    async fn send(&self, text: &str) -> crate::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::TransportClosed);
        }
        self.sent.lock().push(text.to_string());
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            *self.status.lock() = TransportStatus::Closed;
            let _ = self.events_tx.send(TransportEvent::Closed).await;
        }
    }
}

/// Handle to one peer a [`FakeEngine`] has handed out
#[derive(Clone)]
pub struct FakeEngineHandle {
    pub peer: Arc<FakePeer>,
    /// Injects engine events into the session built on this peer
    pub events: mpsc::UnboundedSender<EngineEvent>,
}

/// In-memory [`RtcEngine`] that hands out [`FakePeer`]s and retains a
/// handle to each for inspection
pub struct FakeEngine {
    handles: parking_lot::Mutex<Vec<FakeEngineHandle>>,
}

impl FakeEngine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            handles: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Handles for every peer connected so far, in connect order
    #[must_use]
    pub fn handles(&self) -> Vec<FakeEngineHandle> {
        self.handles.lock().clone()
    }

    /// Handle for the `n`th connected peer
    ///
    /// # Panics
    /// Panics when fewer than `n + 1` peers have connected.
    #[must_use]
    pub fn handle(&self, n: usize) -> FakeEngineHandle {
        self.handles.lock()[n].clone()
    }
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RtcEngine for FakeEngine {
    async fn connect(
        &self,
    ) -> crate::Result<(Arc<dyn RtcPeer>, mpsc::UnboundedReceiver<EngineEvent>)> {
        let peer = Arc::new(FakePeer::new());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.handles.lock().push(FakeEngineHandle {
            peer: peer.clone(),
            events: events_tx,
        });
        Ok((peer, events_rx))
    }
}
