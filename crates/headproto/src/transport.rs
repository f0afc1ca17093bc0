//! Transport contract between a session and a headset link.
//!
//! A [`Connector`] opens a [`Link`] for a device identifier. The link is two
//! halves: a [`Transport`] for outbound frames, whose `send` returns an
//! immediate local result, and a receiver of inbound [`TransportEvent`]s.
//! Dropping the event sender is equivalent to `LinkLost`.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Errors raised by a transport or connector
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("link closed")]
    Closed,
    #[error("device not found: {0}")]
    NotFound(String),
    #[error("connection refused by {0}")]
    Refused(String),
    #[error("adapter unavailable: {0}")]
    AdapterUnavailable(String),
    #[error("transport i/o error: {0}")]
    Io(String),
}

/// Inbound event from the link
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Frame(Bytes),
    LinkLost,
}

/// Outbound half of a link
pub trait Transport: Send {
    /// Queue one frame. Returns once the frame is handed to the link, not
    /// when the device has seen it.
    fn send(&mut self, frame: Bytes) -> Result<(), TransportError>;
}

/// An open link to one device
pub struct Link {
    pub transport: Box<dyn Transport>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").finish_non_exhaustive()
    }
}

/// Opens links to devices by identifier
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, device: &str) -> Result<Link, TransportError>;
}

/// [`Transport`] backed by an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl ChannelTransport {
    pub fn new(tx: mpsc::UnboundedSender<Bytes>) -> Self {
        Self { tx }
    }
}

impl Transport for ChannelTransport {
    fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        self.tx.send(frame).map_err(|_| TransportError::Closed)
    }
}
