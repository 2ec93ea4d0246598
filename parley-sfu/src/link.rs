//! Dual-transport signaling link
//!
//! Signaling starts on the control socket and upgrades to the peer data
//! channel the moment that channel opens. The upgrade is one-way and never
//! commanded by either side; afterwards the control socket may drop without
//! taking the session down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::message::WireMessage;
use crate::transport::{MessageTransport, TransportEvent, TransportKind, TransportPair, TransportStatus};

/// What a link reports to its participant connection
#[derive(Debug)]
pub enum LinkEvent {
    /// A parsed signaling frame from whichever transport carried it
    Message(WireMessage),
    /// The link is no longer usable; terminal, reported once
    Closed,
}

/// Control-socket signaling with a silent upgrade to the peer data channel
pub struct SignalingLink {
    control: Arc<dyn MessageTransport>,
    peer: Arc<dyn MessageTransport>,
    upgraded: AtomicBool,
    closed_emitted: AtomicBool,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    cancel: CancellationToken,
}

impl SignalingLink {
    /// Take ownership of both transports and start the dispatch task
    pub fn spawn(
        control: TransportPair,
        peer: TransportPair,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<LinkEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let link = Arc::new(Self {
            control: control.transport,
            peer: peer.transport,
            upgraded: AtomicBool::new(false),
            closed_emitted: AtomicBool::new(false),
            events_tx,
            cancel: CancellationToken::new(),
        });

        let task = Arc::clone(&link);
        tokio::spawn(task.run(control.events, peer.events));

        (link, events_rx)
    }

    async fn run(
        self: Arc<Self>,
        mut control_events: mpsc::Receiver<TransportEvent>,
        mut peer_events: mpsc::Receiver<TransportEvent>,
    ) {
        // Which streams are still worth polling; a stopped stream cannot
        // come back.
        let mut control_live = true;
        let mut peer_live = true;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                event = control_events.recv(), if control_live => {
                    match event {
                        Some(TransportEvent::Closed) | None => {
                            if self.is_upgraded() {
                                // Expected churn: clients drop the socket
                                // once the data channel carries signaling.
                                debug!("Control socket closed after upgrade");
                                control_live = false;
                            } else {
                                self.emit_closed();
                                break;
                            }
                        }
                        Some(event) => {
                            self.handle_event(TransportKind::ControlSocket, event).await;
                        }
                    }
                }
                event = peer_events.recv(), if peer_live => {
                    match event {
                        Some(TransportEvent::Open) => {
                            if !self.upgraded.swap(true, Ordering::SeqCst) {
                                debug!("Signaling upgraded to peer data channel");
                            }
                        }
                        Some(TransportEvent::Closed) | None => {
                            if self.is_upgraded() {
                                self.emit_closed();
                                break;
                            }
                            // The channel never came up; the control socket
                            // keeps carrying signaling.
                            debug!("Peer channel closed before upgrade, ignoring");
                            peer_live = false;
                        }
                        Some(_) if !self.is_upgraded() => {
                            debug!("Ignoring peer channel event before upgrade");
                        }
                        Some(event) => {
                            self.handle_event(TransportKind::PeerChannel, event).await;
                        }
                    }
                }
            }
        }
    }

    async fn handle_event(&self, source: TransportKind, event: TransportEvent) {
        match event {
            TransportEvent::Message(text) => match WireMessage::from_json(&text) {
                Ok(message) => {
                    let _ = self.events_tx.send(LinkEvent::Message(message));
                }
                Err(e) => {
                    debug!(error = %e, transport = ?source, "Dropping unparseable signaling frame");
                }
            },
            TransportEvent::Error(reason) => {
                if source == self.active_kind() {
                    warn!(%reason, transport = ?source, "Error on active signaling transport, closing it");
                    self.transport_for(source).close().await;
                } else {
                    debug!(%reason, transport = ?source, "Error on inactive signaling transport");
                }
            }
            // Open and Closed are routed in the dispatch loop.
            TransportEvent::Open | TransportEvent::Closed => {}
        }
    }

    fn emit_closed(&self) {
        if !self.closed_emitted.swap(true, Ordering::SeqCst) {
            let _ = self.events_tx.send(LinkEvent::Closed);
        }
    }

    fn active_kind(&self) -> TransportKind {
        if self.is_upgraded() {
            TransportKind::PeerChannel
        } else {
            TransportKind::ControlSocket
        }
    }

    fn transport_for(&self, kind: TransportKind) -> &Arc<dyn MessageTransport> {
        match kind {
            TransportKind::ControlSocket => &self.control,
            TransportKind::PeerChannel => &self.peer,
        }
    }

    fn active_transport(&self) -> &Arc<dyn MessageTransport> {
        self.transport_for(self.active_kind())
    }

    /// Serialize once and send through whichever transport is active
    pub async fn send(&self, message: &WireMessage) -> crate::Result<()> {
        let text = message.to_json()?;
        self.active_transport().send(&text).await
    }

    #[must_use]
    pub fn is_upgraded(&self) -> bool {
        self.upgraded.load(Ordering::SeqCst)
    }

    /// Status of the active transport
    #[must_use]
    pub fn status(&self) -> TransportStatus {
        self.active_transport().status()
    }

    /// Close both transports and stop dispatching
    pub async fn close(&self) {
        self.cancel.cancel();
        self.control.close().await;
        self.peer.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;
    use crate::test_helpers::FakeTransport;

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    fn spawn_link() -> (
        Arc<FakeTransport>,
        Arc<FakeTransport>,
        Arc<SignalingLink>,
        mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        let (control, control_pair) = FakeTransport::pair(TransportKind::ControlSocket);
        let (peer, peer_pair) = FakeTransport::pair(TransportKind::PeerChannel);
        let (link, events) = SignalingLink::spawn(control_pair, peer_pair);
        (control, peer, link, events)
    }

    #[tokio::test]
    async fn test_send_routes_through_active_transport() {
        let (control, peer, link, _events) = spawn_link();
        control.open().await;
        settle().await;

        link.send(&WireMessage::joined(&"m-1".into())).await.unwrap();
        assert_eq!(control.sent().len(), 1);
        assert!(peer.sent().is_empty());

        peer.open().await;
        settle().await;
        assert!(link.is_upgraded());

        link.send(&WireMessage::joined(&"m-1".into())).await.unwrap();
        assert_eq!(control.sent().len(), 1);
        assert_eq!(peer.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_frames_parse_into_messages() {
        let (control, _peer, _link, mut events) = spawn_link();
        control.open().await;

        let frame = WireMessage::joined(&"m-1".into()).to_json().unwrap();
        control.emit_message(frame).await;

        match events.recv().await.unwrap() {
            LinkEvent::Message(message) => assert_eq!(message.kind, MessageType::Joined),
            LinkEvent::Closed => panic!("unexpected close"),
        }
    }

    #[tokio::test]
    async fn test_unparseable_frame_is_dropped() {
        let (control, _peer, _link, mut events) = spawn_link();
        control.open().await;

        control.emit_message("{not json").await;
        settle().await;

        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_control_close_before_upgrade_ends_link() {
        let (control, _peer, _link, mut events) = spawn_link();
        control.open().await;

        control.emit_closed().await;

        match events.recv().await.unwrap() {
            LinkEvent::Closed => {}
            LinkEvent::Message(m) => panic!("unexpected message {m:?}"),
        }
    }

    #[tokio::test]
    async fn test_control_close_after_upgrade_is_churn() {
        let (control, peer, link, mut events) = spawn_link();
        control.open().await;
        peer.open().await;
        settle().await;

        control.emit_closed().await;
        settle().await;

        // The link survives and signaling keeps flowing on the channel.
        assert!(events.try_recv().is_err());
        let frame = WireMessage::joined(&"m-1".into()).to_json().unwrap();
        peer.emit_message(frame).await;
        match events.recv().await.unwrap() {
            LinkEvent::Message(message) => assert_eq!(message.kind, MessageType::Joined),
            LinkEvent::Closed => panic!("unexpected close"),
        }
        assert!(link.is_upgraded());
    }

    #[tokio::test]
    async fn test_peer_close_before_upgrade_is_ignored() {
        let (control, peer, _link, mut events) = spawn_link();
        control.open().await;

        peer.emit_closed().await;
        settle().await;
        assert!(events.try_recv().is_err());

        // The control socket still carries signaling afterwards.
        let frame = WireMessage::joined(&"m-1".into()).to_json().unwrap();
        control.emit_message(frame).await;
        match events.recv().await.unwrap() {
            LinkEvent::Message(message) => assert_eq!(message.kind, MessageType::Joined),
            LinkEvent::Closed => panic!("unexpected close"),
        }
    }

    #[tokio::test]
    async fn test_peer_close_after_upgrade_ends_link() {
        let (control, peer, _link, mut events) = spawn_link();
        control.open().await;
        peer.open().await;
        settle().await;

        peer.emit_closed().await;

        match events.recv().await.unwrap() {
            LinkEvent::Closed => {}
            LinkEvent::Message(m) => panic!("unexpected message {m:?}"),
        }
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_error_on_active_transport_closes_it() {
        let (control, _peer, _link, mut events) = spawn_link();
        control.open().await;

        control.emit_error("boom").await;
        settle().await;

        // Closing the active pre-upgrade transport tears the link down.
        assert!(control.is_closed());
        match events.recv().await.unwrap() {
            LinkEvent::Closed => {}
            LinkEvent::Message(m) => panic!("unexpected message {m:?}"),
        }
    }

    #[tokio::test]
    async fn test_error_on_inactive_transport_is_logged_only() {
        let (control, peer, _link, mut events) = spawn_link();
        control.open().await;
        peer.open().await;
        settle().await;

        control.emit_error("boom").await;
        settle().await;

        assert!(!control.is_closed());
        assert!(events.try_recv().is_err());
    }
}
