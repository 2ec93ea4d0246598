//! Signaling WebSocket endpoint
//!
//! Accepts one socket per participant, performs the `payload` query-param
//! handshake, and bridges the socket into the meeting pool as the control
//! transport. The pool's reply is written directly as the first frame,
//! ahead of anything the join queued on the transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use parley_sfu::message::{MessageType, WireMessage};
use parley_sfu::transport::{
    MessageTransport, TransportEvent, TransportKind, TransportPair, TransportStatus,
    TRANSPORT_EVENT_BUFFER,
};
use parley_sfu::types::MeetingId;

use crate::AppState;

/// Outbound frames a socket will buffer before the sender starts dropping
const OUTBOUND_BUFFER: usize = 64;

/// Query parameters for the signaling WebSocket
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// JSON handshake: `{"username": ..., "meetingId": ...}`
    pub payload: Option<String>,
}

/// Parsed handshake payload
#[derive(Debug, Deserialize)]
pub struct Handshake {
    pub username: String,
    #[serde(rename = "meetingId")]
    pub meeting_id: Option<String>,
}

/// Signaling WebSocket handler
///
/// Clients connect with the handshake in the query string:
/// <ws://host/ws?payload={"username":"alice","meetingId":"..."}>
pub async fn websocket_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    // Limit max message size to 64KB (signaling frames are tiny)
    ws.max_message_size(64 * 1024)
        .on_upgrade(move |socket| handle_socket(socket, state, query.payload))
}

fn parse_handshake(payload: Option<&str>) -> Result<Handshake, WireMessage> {
    let Some(raw) = payload else {
        return Err(WireMessage::error("missing required param payload"));
    };
    match serde_json::from_str::<Option<Handshake>>(raw) {
        Ok(Some(handshake)) => Ok(handshake),
        Ok(None) | Err(_) => Err(WireMessage::error("payload cannot be empty")),
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, payload: Option<String>) {
    let (mut sink, stream) = socket.split();

    let handshake = match parse_handshake(payload.as_deref()) {
        Ok(handshake) => handshake,
        Err(reply) => {
            // Reply, then drop; the socket never becomes a member.
            if let Ok(text) = reply.to_json() {
                let _ = sink.send(Message::Text(text.into())).await;
            }
            let _ = sink.close().await;
            return;
        }
    };

    info!(
        username = %handshake.username,
        meeting_id = ?handshake.meeting_id,
        "Signaling socket connected"
    );

    let (transport, pair, outbound_rx) = WsTransport::new();

    let reply = match &handshake.meeting_id {
        Some(id) => {
            state
                .pool
                .join(
                    handshake.username.clone(),
                    &MeetingId::from(id.as_str()),
                    pair,
                )
                .await
        }
        None => state.pool.create(handshake.username.clone(), pair).await,
    };
    let admitted = reply.kind == MessageType::Joined;

    // The reply is the first frame on the wire, ahead of any join replay
    // the pool queued on the transport.
    match reply.to_json() {
        Ok(text) => {
            if sink.send(Message::Text(text.into())).await.is_err() {
                transport.surface_closed().await;
                return;
            }
        }
        Err(e) => {
            warn!(error = %e, "Failed to encode handshake reply");
            transport.surface_closed().await;
            return;
        }
    }

    if !admitted {
        let _ = sink.close().await;
        return;
    }

    let writer_transport = Arc::clone(&transport);
    tokio::spawn(run_writer(sink, outbound_rx, writer_transport));
    run_reader(stream, transport).await;

    info!(username = %handshake.username, "Signaling socket closed");
}

async fn run_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<String>,
    transport: Arc<WsTransport>,
) {
    loop {
        tokio::select! {
            () = transport.shutdown.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(text) => {
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        debug!(error = %e, "WebSocket write failed");
                        transport.surface_closed().await;
                        break;
                    }
                }
                None => break,
            },
        }
    }
    let _ = sink.close().await;
}

async fn run_reader(mut stream: SplitStream<WebSocket>, transport: Arc<WsTransport>) {
    let _ = transport.events_tx.send(TransportEvent::Open).await;

    loop {
        tokio::select! {
            () = transport.shutdown.cancelled() => break,
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if transport
                        .events_tx
                        .send(TransportEvent::Message(text.to_string()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    transport.surface_closed().await;
                    break;
                }
                Some(Err(e)) => {
                    debug!(error = %e, "WebSocket read failed");
                    transport.surface_closed().await;
                    break;
                }
                // Ignore binary, ping, and pong frames.
                Some(Ok(_)) => {}
            },
        }
    }
}

/// Control transport backed by one WebSocket
///
/// Outbound frames go through a bounded queue drained by the writer task;
/// a full queue drops the frame rather than stalling the meeting.
pub struct WsTransport {
    outbound_tx: mpsc::Sender<String>,
    events_tx: mpsc::Sender<TransportEvent>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl WsTransport {
    fn new() -> (Arc<Self>, TransportPair, mpsc::Receiver<String>) {
        let (events_tx, events_rx) = mpsc::channel(TRANSPORT_EVENT_BUFFER);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);

        let transport = Arc::new(Self {
            outbound_tx,
            events_tx,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });
        let pair = TransportPair::new(transport.clone(), events_rx);

        (transport, pair, outbound_rx)
    }

    /// Flip to closed, stop both socket tasks, and deliver the one
    /// `Closed` event. Every teardown path funnels here.
    async fn surface_closed(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        let _ = self.events_tx.send(TransportEvent::Closed).await;
    }
}

#[async_trait]
impl MessageTransport for WsTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::ControlSocket
    }

    fn status(&self) -> TransportStatus {
        if self.closed.load(Ordering::SeqCst) {
            TransportStatus::Closed
        } else {
            TransportStatus::Open
        }
    }

    async fn send(&self, text: &str) -> parley_sfu::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(parley_sfu::Error::TransportClosed);
        }
        match self.outbound_tx.try_send(text.to_string()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Client too slow to drain its socket; dropping beats
                // stalling the whole meeting.
                warn!("Outbound signaling queue full, dropping frame");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(parley_sfu::Error::TransportClosed),
        }
    }

    async fn close(&self) {
        self.surface_closed().await;
    }
}
