//! Integration tests for the meeting lifecycle
//!
//! These tests drive the public pool API end to end with an in-memory
//! engine and in-memory signaling transports: create, join replay, track
//! fan-out, leave announcements, and destroy-on-empty.
//!
//! Run with: cargo test --test meeting_flow

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use parley_sfu::config::Config;
use parley_sfu::engine::{EngineEvent, IceState, MediaTrack, PeerState, RtcEngine, RtcPeer, TrackKind};
use parley_sfu::message::{IceCandidate, MessageType, SdpKind, SessionDescription, WireMessage};
use parley_sfu::pool::MeetingPool;
use parley_sfu::transport::{
    MessageTransport, TransportEvent, TransportKind, TransportPair, TransportStatus,
    TRANSPORT_EVENT_BUFFER,
};
use parley_sfu::types::{MeetingId, StreamId};

/// Control-socket stand-in: records outbound frames, test injects inbound
/// events through the retained handle
struct FlowTransport {
    kind: TransportKind,
    status: parking_lot::Mutex<TransportStatus>,
    sent: parking_lot::Mutex<Vec<String>>,
    closed: AtomicBool,
    events_tx: mpsc::Sender<TransportEvent>,
}

impl FlowTransport {
    fn pair(kind: TransportKind) -> (Arc<Self>, TransportPair) {
        let (events_tx, events_rx) = mpsc::channel(TRANSPORT_EVENT_BUFFER);
        let transport = Arc::new(Self {
            kind,
            status: parking_lot::Mutex::new(TransportStatus::Connecting),
            sent: parking_lot::Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            events_tx,
        });
        let pair = TransportPair::new(transport.clone(), events_rx);
        (transport, pair)
    }

    async fn open(&self) {
        *self.status.lock() = TransportStatus::Open;
        let _ = self.events_tx.send(TransportEvent::Open).await;
    }

    async fn emit_message(&self, text: String) {
        let _ = self.events_tx.send(TransportEvent::Message(text)).await;
    }

    async fn emit_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        *self.status.lock() = TransportStatus::Closed;
        let _ = self.events_tx.send(TransportEvent::Closed).await;
    }

    fn frames(&self) -> Vec<WireMessage> {
        self.sent
            .lock()
            .iter()
            .map(|raw| WireMessage::from_json(raw).unwrap())
            .collect()
    }
}

#[async_trait]
impl MessageTransport for FlowTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn status(&self) -> TransportStatus {
        *self.status.lock()
    }

    async fn send(&self, text: &str) -> parley_sfu::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(parley_sfu::Error::TransportClosed);
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

/// Engine stand-in: hands out inert peers and keeps the event senders so
/// tests can publish tracks
struct FlowPeer {
    forwarded: parking_lot::Mutex<Vec<String>>,
    closed: AtomicBool,
}

#[async_trait]
impl RtcPeer for FlowPeer {
    async fn create_offer(&self) -> parley_sfu::Result<SessionDescription> {
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: "v=0\r\n".to_string(),
        })
    }

    async fn create_answer(&self) -> parley_sfu::Result<SessionDescription> {
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: "v=0\r\n".to_string(),
        })
    }

    async fn set_local_description(&self, _description: SessionDescription) -> parley_sfu::Result<()> {
        Ok(())
    }

    async fn set_remote_description(&self, _description: SessionDescription) -> parley_sfu::Result<()> {
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> parley_sfu::Result<()> {
        Ok(())
    }

    async fn forward_track(&self, track: MediaTrack) -> parley_sfu::Result<()> {
        self.forwarded.lock().push(track.id);
        Ok(())
    }

    async fn request_keyframe(&self, _track: &MediaTrack) -> parley_sfu::Result<()> {
        Ok(())
    }

    async fn create_signaling_channel(&self, _label: &str) -> parley_sfu::Result<TransportPair> {
        let (_transport, pair) = FlowTransport::pair(TransportKind::PeerChannel);
        Ok(pair)
    }

    fn ice_connection_state(&self) -> IceState {
        IceState::New
    }

    fn connection_state(&self) -> PeerState {
        PeerState::New
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct FlowEngine {
    handles: parking_lot::Mutex<Vec<(Arc<FlowPeer>, mpsc::UnboundedSender<EngineEvent>)>>,
}

impl FlowEngine {
    fn new() -> Self {
        Self {
            handles: parking_lot::Mutex::new(Vec::new()),
        }
    }

    fn peer(&self, n: usize) -> Arc<FlowPeer> {
        self.handles.lock()[n].0.clone()
    }

    fn events(&self, n: usize) -> mpsc::UnboundedSender<EngineEvent> {
        self.handles.lock()[n].1.clone()
    }
}

#[async_trait]
impl RtcEngine for FlowEngine {
    async fn connect(
        &self,
    ) -> parley_sfu::Result<(Arc<dyn RtcPeer>, mpsc::UnboundedReceiver<EngineEvent>)> {
        let peer = Arc::new(FlowPeer {
            forwarded: parking_lot::Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.handles.lock().push((peer.clone(), events_tx));
        Ok((peer, events_rx))
    }
}

async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

fn video_track(id: &str, stream: &str) -> MediaTrack {
    MediaTrack {
        id: id.to_string(),
        stream_id: Some(StreamId::from(stream)),
        kind: TrackKind::Video,
        ssrc: 0,
        remote: None,
    }
}

fn meeting_id_of(reply: &WireMessage) -> MeetingId {
    assert_eq!(reply.kind, MessageType::Joined, "expected joined: {reply:?}");
    MeetingId::from(reply.payload["meetingId"].as_str().unwrap())
}

#[tokio::test]
async fn test_full_meeting_lifecycle() {
    let engine = Arc::new(FlowEngine::new());
    let pool = MeetingPool::new(Config::default(), engine.clone());

    // Alice creates a meeting.
    let (alice, alice_pair) = FlowTransport::pair(TransportKind::ControlSocket);
    let reply = pool.create("alice".to_string(), alice_pair).await;
    let id = meeting_id_of(&reply);
    alice.open().await;
    settle().await;
    assert_eq!(pool.len(), 1);

    // Alice publishes a video track.
    engine
        .events(0)
        .send(EngineEvent::Track(video_track("video-1", "stream-a")))
        .unwrap();
    settle().await;

    // Bob joins and gets alice's media replayed plus the roster.
    let (bob, bob_pair) = FlowTransport::pair(TransportKind::ControlSocket);
    let reply = pool.join("bob".to_string(), &id, bob_pair).await;
    assert_eq!(reply.kind, MessageType::Joined);
    bob.open().await;
    settle().await;

    assert_eq!(engine.peer(1).forwarded.lock().clone(), vec!["video-1".to_string()]);
    let bob_frames = bob.frames();
    assert_eq!(bob_frames.len(), 1);
    assert_eq!(bob_frames[0].kind, MessageType::Info);
    assert_eq!(bob_frames[0].payload["action"], "join");
    assert_eq!(bob_frames[0].payload["info"]["stream-a"], "alice");

    // Bob publishes; alice's peer carries his track and she is told.
    engine
        .events(1)
        .send(EngineEvent::Track(video_track("video-2", "stream-b")))
        .unwrap();
    settle().await;

    assert_eq!(engine.peer(0).forwarded.lock().clone(), vec!["video-2".to_string()]);
    let alice_frames = alice.frames();
    let announce = alice_frames
        .iter()
        .find(|f| f.kind == MessageType::Info && f.payload["action"] == "join")
        .expect("alice should see bob's stream announcement");
    assert_eq!(announce.payload["info"]["stream-b"], "bob");

    // Bob's socket drops; alice is told he left.
    bob.emit_closed().await;
    settle().await;

    let alice_frames = alice.frames();
    let left = alice_frames
        .iter()
        .find(|f| f.kind == MessageType::Info && f.payload["action"] == "left")
        .expect("alice should see bob leave");
    assert_eq!(left.payload["info"]["username"], "bob");
    assert_eq!(pool.len(), 1);

    // Alice leaves too; the meeting dissolves.
    alice.emit_closed().await;
    settle().await;
    assert_eq!(pool.len(), 0);
    assert!(engine.peer(0).closed.load(Ordering::SeqCst));
    assert!(engine.peer(1).closed.load(Ordering::SeqCst));

    // The old id is gone.
    let (_carol, carol_pair) = FlowTransport::pair(TransportKind::ControlSocket);
    let reply = pool.join("carol".to_string(), &id, carol_pair).await;
    assert_eq!(reply.kind, MessageType::Error);
    assert_eq!(reply.payload, "meeting not found");
}

#[tokio::test]
async fn test_admission_errors() {
    let engine = Arc::new(FlowEngine::new());
    let mut config = Config::default();
    config.meeting.max_connections = 1;
    let pool = MeetingPool::new(config, engine);

    let (_alice, alice_pair) = FlowTransport::pair(TransportKind::ControlSocket);
    let id = meeting_id_of(&pool.create("alice".to_string(), alice_pair).await);

    let (_bob, bob_pair) = FlowTransport::pair(TransportKind::ControlSocket);
    let reply = pool.join("bob".to_string(), &id, bob_pair).await;
    assert_eq!(reply.kind, MessageType::Error);
    assert_eq!(reply.payload, "meeting is full");

    let (_carol, carol_pair) = FlowTransport::pair(TransportKind::ControlSocket);
    let reply = pool
        .join("carol".to_string(), &MeetingId::from("missing"), carol_pair)
        .await;
    assert_eq!(reply.kind, MessageType::Error);
    assert_eq!(reply.payload, "meeting not found");
}

#[tokio::test]
async fn test_signaling_round_trip() {
    let engine = Arc::new(FlowEngine::new());
    let pool = MeetingPool::new(Config::default(), engine);

    let (alice, alice_pair) = FlowTransport::pair(TransportKind::ControlSocket);
    pool.create("alice".to_string(), alice_pair).await;
    alice.open().await;
    settle().await;

    // A client offer over the control socket comes back as an answer.
    let offer = WireMessage::offer(&SessionDescription {
        kind: SdpKind::Offer,
        sdp: "v=0\r\n".to_string(),
    });
    alice.emit_message(offer.to_json().unwrap()).await;
    settle().await;

    let frames = alice.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].kind, MessageType::Answer);
    let answer: SessionDescription = serde_json::from_value(frames[0].payload.clone()).unwrap();
    assert_eq!(answer.kind, SdpKind::Answer);
}
