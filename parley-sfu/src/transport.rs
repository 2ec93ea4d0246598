//! Transport abstraction for signaling frames
//!
//! A participant talks to the server over two interchangeable transports:
//! the WebSocket it connected with (control socket) and the data channel
//! opened on its peer connection. Both expose the same send/close/status
//! surface and report what happens to them as [`TransportEvent`]s.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::Result;

/// Event channel depth for a single transport
pub const TRANSPORT_EVENT_BUFFER: usize = 64;

/// Which physical transport a handle wraps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// The WebSocket the client connected with
    ControlSocket,
    /// The data channel riding on the peer connection
    PeerChannel,
}

/// Lifecycle state of a transport, modeled on the browser `readyState`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// What a transport reports upward
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The transport finished connecting
    Open,
    /// A text frame arrived
    Message(String),
    /// The transport failed; a `Closed` follows once it is torn down
    Error(String),
    /// The transport is gone; terminal, reported once
    Closed,
}

/// Uniform send/close/status surface over both transports
#[async_trait]
pub trait MessageTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn status(&self) -> TransportStatus;

    /// Queue one text frame for delivery
    async fn send(&self, text: &str) -> Result<()>;

    /// Tear the transport down; emits a final `Closed` event
    async fn close(&self);
}

/// A transport handle together with the event stream it reports on.
///
/// The receiver's identity is what ties events back to their transport;
/// consumers hold one pair per transport and poll both.
pub struct TransportPair {
    pub transport: Arc<dyn MessageTransport>,
    pub events: mpsc::Receiver<TransportEvent>,
}

impl TransportPair {
    pub fn new(
        transport: Arc<dyn MessageTransport>,
        events: mpsc::Receiver<TransportEvent>,
    ) -> Self {
        Self { transport, events }
    }
}
