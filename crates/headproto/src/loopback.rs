//! In-process links for tests and the simulator.
//!
//! [`loopback`] returns a [`LoopbackConnector`] for the session side and an
//! [`Acceptor`] that yields the [`DeviceEnd`] of every link opened through it,
//! so a test can play the headset by hand.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::frame::{DeviceMessage, HostCommand};
use crate::transport::{ChannelTransport, Connector, Link, TransportError, TransportEvent};

/// Create a connected host/device pair for `device`.
pub fn pair(device: &str) -> (Link, DeviceEnd) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    let link = Link {
        transport: Box::new(ChannelTransport::new(cmd_tx)),
        events: event_rx,
    };
    let end = DeviceEnd {
        device: device.to_string(),
        commands: cmd_rx,
        events: event_tx,
    };
    (link, end)
}

/// Create a connector and the acceptor receiving its device ends.
pub fn loopback() -> (LoopbackConnector, Acceptor) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        LoopbackConnector {
            accept_tx: tx,
            refusing: Arc::new(AtomicBool::new(false)),
        },
        Acceptor { rx },
    )
}

/// Session-side connector for loopback links
#[derive(Clone)]
pub struct LoopbackConnector {
    accept_tx: mpsc::UnboundedSender<DeviceEnd>,
    refusing: Arc<AtomicBool>,
}

impl LoopbackConnector {
    /// While set, `open` fails with [`TransportError::Refused`].
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::Relaxed);
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn open(&self, device: &str) -> Result<Link, TransportError> {
        if self.refusing.load(Ordering::Relaxed) {
            return Err(TransportError::Refused(device.to_string()));
        }

        let (link, end) = pair(device);
        self.accept_tx
            .send(end)
            .map_err(|_| TransportError::NotFound(device.to_string()))?;
        debug!("loopback link opened for {}", device);
        Ok(link)
    }
}

/// Receives the device end of each link opened by the paired connector
pub struct Acceptor {
    rx: mpsc::UnboundedReceiver<DeviceEnd>,
}

impl Acceptor {
    pub async fn accept(&mut self) -> Option<DeviceEnd> {
        self.rx.recv().await
    }
}

/// Device side of a loopback link
pub struct DeviceEnd {
    device: String,
    commands: mpsc::UnboundedReceiver<Bytes>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl DeviceEnd {
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Next decodable command from the host. `None` once the host dropped
    /// its transport. Undecodable frames are logged and skipped.
    pub async fn recv_command(&mut self) -> Option<HostCommand> {
        loop {
            let frame = self.commands.recv().await?;
            match HostCommand::decode(&frame) {
                Ok(command) => return Some(command),
                Err(e) => warn!("{}: dropping undecodable host frame: {}", self.device, e),
            }
        }
    }

    pub fn send(&self, message: &DeviceMessage) -> Result<(), TransportError> {
        self.send_raw(message.encode())
    }

    /// Push arbitrary bytes, for malformed-frame cases.
    pub fn send_raw(&self, frame: Bytes) -> Result<(), TransportError> {
        self.events
            .send(TransportEvent::Frame(frame))
            .map_err(|_| TransportError::Closed)
    }

    pub fn is_host_attached(&self) -> bool {
        !self.events.is_closed()
    }

    /// Signal link loss and close the device end.
    pub fn drop_link(self) {
        debug!("{}: dropping link", self.device);
        let _ = self.events.send(TransportEvent::LinkLost);
    }
}
