//! Connection reactor.
//!
//! One task per connection owns the inbound event stream:
//! - it opens the link and sends the handshake
//! - every event is handled under the session mutex, the single
//!   serialization point shared with the caller
//! - callbacks collected while handling run after the mutex is released
//!
//! Each connection gets a generation number. Tearing a link down bumps the
//! generation, so a reactor that wakes up for a stale link exits without
//! touching the session.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use headconf::{HeadsetConfig, OverlapPolicy};
use headproto::{
    AckStatus, BatteryInfo, Connector, DataFrame, DeviceInfo, DeviceMessage, HostCommand, Link,
    Opcode, StreamSetup, Transport, TransportEvent, PROTOCOL_VERSION,
};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::assembler::{Chunk, StreamAssembler, StreamStats};
use crate::caches::{AnnotationLog, BatteryCache};
use crate::config::{CommittedConfig, StagedConfig};
use crate::correlator::{Correlator, OperationKind};
use crate::error::SessionError;
use crate::session::SessionState;

pub type ChunkCallback = Arc<dyn Fn(&Chunk) + Send + Sync>;
pub type BatteryCallback = Arc<dyn Fn(BatteryInfo) + Send + Sync>;
pub type DisconnectCallback = Arc<dyn Fn() + Send + Sync>;
pub type ProgressCallback = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Knobs copied from [`HeadsetConfig`] at session creation
#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub chunk_size: usize,
    pub block_size: usize,
    pub firmware_path: PathBuf,
    pub overlap: OverlapPolicy,
}

impl From<&HeadsetConfig> for Settings {
    fn from(config: &HeadsetConfig) -> Self {
        Self {
            chunk_size: config.stream.chunk_size.max(1),
            block_size: config.update.block_size.clamp(1, u16::MAX as usize),
            firmware_path: config.update.firmware_path.clone(),
            overlap: config.session.overlap,
        }
    }
}

#[derive(Default)]
pub(crate) struct Callbacks {
    pub chunk: Option<ChunkCallback>,
    pub battery: Option<BatteryCallback>,
    pub disconnect: Option<DisconnectCallback>,
}

/// Start command sent, waiting for the device to acknowledge it
pub(crate) struct PendingStart {
    pub committed: CommittedConfig,
    pub staged: StagedConfig,
}

/// Firmware image being pushed block by block
pub(crate) struct UpdateTransfer {
    pub image: Bytes,
    pub sent: usize,
    pub in_flight: usize,
    pub progress: ProgressCallback,
}

/// Callback work collected under the lock, delivered after it is released
pub(crate) enum Notification {
    Chunk(ChunkCallback, Chunk),
    Battery(BatteryCallback, BatteryInfo),
    Progress(ProgressCallback, usize, usize),
    Disconnected(DisconnectCallback),
}

impl Notification {
    pub(crate) fn deliver(self) {
        match self {
            Notification::Chunk(cb, chunk) => cb(&chunk),
            Notification::Battery(cb, info) => cb(info),
            Notification::Progress(cb, sent, total) => cb(sent, total),
            Notification::Disconnected(cb) => cb(),
        }
    }
}

/// Session state behind the mutex
pub(crate) struct Inner {
    pub state: SessionState,
    pub generation: u64,
    pub settings: Settings,
    pub staged: StagedConfig,
    pub committed: Option<CommittedConfig>,
    pub pending_start: Option<PendingStart>,
    pub identity: Option<DeviceInfo>,
    pub ever_connected: bool,
    pub calibrating: bool,
    pub battery: BatteryCache,
    pub annotations: AnnotationLog,
    pub correlator: Correlator,
    pub assembler: Option<StreamAssembler>,
    pub last_stats: StreamStats,
    pub update: Option<UpdateTransfer>,
    pub callbacks: Callbacks,
    transport: Option<Box<dyn Transport>>,
    cancel: Option<CancellationToken>,
}

pub(crate) type Shared = Arc<Mutex<Inner>>;

pub(crate) fn lock(shared: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    // A panicking user callback never runs under the lock, so the state is consistent.
    shared.lock().unwrap_or_else(|e| e.into_inner())
}

impl Inner {
    pub(crate) fn new(settings: Settings, runtime: Handle) -> Self {
        Self {
            state: SessionState::Disconnected,
            generation: 0,
            settings,
            staged: StagedConfig::default(),
            committed: None,
            pending_start: None,
            identity: None,
            ever_connected: false,
            calibrating: false,
            battery: BatteryCache::default(),
            annotations: AnnotationLog::default(),
            correlator: Correlator::new(runtime),
            assembler: None,
            last_stats: StreamStats::default(),
            update: None,
            callbacks: Callbacks::default(),
            transport: None,
            cancel: None,
        }
    }

    pub(crate) fn require(&self, state: SessionState, operation: &'static str) -> Result<(), SessionError> {
        if self.state != state {
            return Err(SessionError::InvalidState {
                operation,
                state: self.state,
            });
        }
        Ok(())
    }

    /// Reject `kind` if one is already pending or the overlap policy forbids it.
    pub(crate) fn check_overlap(&self, kind: OperationKind) -> Result<(), SessionError> {
        if self.correlator.is_pending(kind) {
            return Err(SessionError::AlreadyPending(kind));
        }

        let conflict = match self.settings.overlap {
            OverlapPolicy::Serialized => self.correlator.pending().next(),
            OverlapPolicy::Permissive if kind.is_state_changing() => self
                .correlator
                .pending()
                .find(|pending| pending.is_state_changing()),
            OverlapPolicy::Permissive => None,
        };

        match conflict {
            Some(pending) => Err(SessionError::Busy {
                operation: kind,
                pending,
            }),
            None => Ok(()),
        }
    }

    pub(crate) fn send(&mut self, command: HostCommand) -> Result<(), SessionError> {
        let transport = self.transport.as_mut().ok_or(SessionError::Disconnected)?;
        trace!("sending {:?}", command.opcode());
        transport.send(command.encode())?;
        Ok(())
    }

    /// Begin a new connection attempt. Returns its generation and cancel token.
    pub(crate) fn begin_connect(&mut self) -> (u64, CancellationToken) {
        self.generation += 1;
        self.state = SessionState::Connecting;
        let cancel = CancellationToken::new();
        self.cancel = Some(cancel.clone());
        (self.generation, cancel)
    }

    /// Drop the link and every per-connection value.
    pub(crate) fn teardown_link(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        self.transport = None;
        self.generation += 1;
        self.state = SessionState::Disconnected;
        self.identity = None;
        self.committed = None;
        self.calibrating = false;
        self.update = None;
        if let Some(pending) = self.pending_start.take() {
            self.restore_staged(pending.staged);
        }
        if let Some(assembler) = self.assembler.take() {
            self.last_stats = assembler.stats();
        }
    }

    /// Fail every pending completion with the error for a lost link.
    pub(crate) fn fail_pending(&mut self) -> usize {
        self.correlator.fail_all(|kind| match kind {
            OperationKind::Update => SessionError::UpdateFailedDeviceDisconnected,
            _ => SessionError::Disconnected,
        })
    }

    /// Put back a consumed staged config unless the caller has staged anew.
    pub(crate) fn restore_staged(&mut self, staged: StagedConfig) {
        if self.staged.is_empty() {
            self.staged = staged;
        }
    }

    pub(crate) fn stream_stats(&self) -> StreamStats {
        self.assembler
            .as_ref()
            .map(StreamAssembler::stats)
            .unwrap_or(self.last_stats)
    }

    fn fail_connect(&mut self, error: SessionError) {
        warn!("connect failed: {}", error);
        self.teardown_link();
        self.correlator.resolve(OperationKind::Connect, Err(error));
    }

    /// Handle one inbound frame, returning the callbacks it triggers.
    pub(crate) fn handle_frame(&mut self, bytes: &[u8]) -> Vec<Notification> {
        let mut out = Vec::new();
        let message = match DeviceMessage::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!("dropping undecodable frame: {}", e);
                if let Some(assembler) = self.assembler.as_mut() {
                    assembler.record_malformed();
                }
                return out;
            }
        };

        match message {
            DeviceMessage::Identity(info) => self.on_identity(info),
            DeviceMessage::Ack { op, status } => self.on_ack(op, status, &mut out),
            DeviceMessage::Data(frame) => self.on_data(&frame, &mut out),
            DeviceMessage::Battery(info) => {
                if !self.battery.has_report() {
                    info!("battery at {}%", info.level);
                }
                self.battery.update(info);
                if let Some(cb) = &self.callbacks.battery {
                    out.push(Notification::Battery(cb.clone(), info));
                }
            }
            DeviceMessage::ConfigReport(setup) => self.on_config_report(setup),
            DeviceMessage::Calibration { active } => {
                if self.calibrating != active {
                    info!("device calibration {}", if active { "started" } else { "finished" });
                }
                self.calibrating = active;
            }
        }
        out
    }

    /// Unsolicited link loss
    pub(crate) fn link_lost(&mut self) -> Vec<Notification> {
        warn!("link lost while {}", self.state);
        self.teardown_link();
        let failed = self.fail_pending();
        if failed > 0 {
            debug!("failed {} pending operation(s) after link loss", failed);
        }
        self.annotations.clear();

        self.callbacks
            .disconnect
            .iter()
            .map(|cb| Notification::Disconnected(cb.clone()))
            .collect()
    }

    fn on_identity(&mut self, info: DeviceInfo) {
        if self.state != SessionState::Connecting || !self.correlator.is_pending(OperationKind::Connect) {
            warn!("unmatched identity reply while {}", self.state);
            return;
        }

        if !info.model.is_supported() {
            self.fail_connect(SessionError::UnsupportedDevice(format!(
                "unknown model {:?}",
                info.model
            )));
            return;
        }
        if info.electrode_count == 0 {
            self.fail_connect(SessionError::UnsupportedDevice(
                "device reports no electrodes".to_string(),
            ));
            return;
        }

        info!(
            "connected to {:?} serial {} firmware {} ({} electrodes @ {} Hz)",
            info.model, info.serial_number, info.firmware_version, info.electrode_count, info.sample_frequency
        );
        self.identity = Some(info);
        self.ever_connected = true;
        self.state = SessionState::Connected;
        self.correlator.resolve(OperationKind::Connect, Ok(()));
    }

    fn on_ack(&mut self, op: Opcode, status: AckStatus, out: &mut Vec<Notification>) {
        match op {
            Opcode::Handshake => {
                if status.is_ok() {
                    // Identity follows and completes the connect
                    debug!("handshake acknowledged");
                } else if self.correlator.is_pending(OperationKind::Connect) {
                    self.fail_connect(SessionError::UnsupportedDevice(format!(
                        "handshake refused: {:?}",
                        status
                    )));
                } else {
                    warn!("unmatched handshake ack: {:?}", status);
                }
            }
            Opcode::StartStream => self.on_start_ack(status),
            Opcode::StopStream => self.on_stop_ack(status),
            Opcode::RequestConfig => {
                if !self.correlator.resolve(
                    OperationKind::LoadConfig,
                    Err(SessionError::Rejected {
                        operation: OperationKind::LoadConfig,
                        status,
                    }),
                ) {
                    warn!("unmatched config ack: {:?}", status);
                }
            }
            Opcode::UpdateBegin | Opcode::UpdateBlock | Opcode::UpdateFinish => {
                self.on_update_ack(op, status, out)
            }
        }
    }

    fn on_start_ack(&mut self, status: AckStatus) {
        let Some(pending) = self.pending_start.take() else {
            warn!("unmatched start_stream ack: {:?}", status);
            return;
        };

        if status.is_ok() {
            info!("streaming {} channel(s)", pending.committed.len());
            self.assembler = Some(StreamAssembler::new(
                pending.committed.len(),
                self.settings.chunk_size,
            ));
            self.committed = Some(pending.committed);
            self.state = SessionState::Streaming;
            self.correlator.resolve(OperationKind::StartStream, Ok(()));
        } else {
            warn!("device rejected start_stream: {:?}", status);
            self.restore_staged(pending.staged);
            self.correlator.resolve(
                OperationKind::StartStream,
                Err(SessionError::Rejected {
                    operation: OperationKind::StartStream,
                    status,
                }),
            );
        }
    }

    fn on_stop_ack(&mut self, status: AckStatus) {
        if !self.correlator.is_pending(OperationKind::StopStream) {
            warn!("unmatched stop_stream ack: {:?}", status);
            return;
        }

        let result = if status.is_ok() {
            if let Some(assembler) = self.assembler.take() {
                self.last_stats = assembler.stats();
            }
            self.committed = None;
            self.calibrating = false;
            self.state = SessionState::Connected;
            info!("stream stopped");
            Ok(())
        } else {
            Err(SessionError::Rejected {
                operation: OperationKind::StopStream,
                status,
            })
        };
        self.correlator.resolve(OperationKind::StopStream, result);
    }

    fn on_data(&mut self, frame: &DataFrame, out: &mut Vec<Notification>) {
        let Some(assembler) = self.assembler.as_mut() else {
            trace!("data frame {} outside a stream", frame.sequence);
            return;
        };

        let chunks = assembler.push(frame);
        if let Some(cb) = &self.callbacks.chunk {
            out.extend(chunks.into_iter().map(|chunk| Notification::Chunk(cb.clone(), chunk)));
        }
    }

    fn on_config_report(&mut self, setup: StreamSetup) {
        if !self.correlator.is_pending(OperationKind::LoadConfig) {
            warn!("unmatched config report");
            return;
        }
        debug!("device reported {} channel setting(s)", setup.channels.len());
        self.staged = StagedConfig::from_setup(&setup);
        self.correlator.resolve(OperationKind::LoadConfig, Ok(()));
    }

    /// End the update, return to `Connected` and resolve its completion.
    fn finish_update(&mut self, result: Result<(), SessionError>) {
        self.update = None;
        self.state = SessionState::Connected;
        self.correlator.resolve(OperationKind::Update, result);
    }

    /// Send the next block, or the finish command once the image is out.
    fn send_next_block(&mut self) -> Result<(), SessionError> {
        let block_size = self.settings.block_size;
        let Some(transfer) = self.update.as_mut() else {
            return Ok(());
        };

        let command = if transfer.sent < transfer.image.len() {
            let end = (transfer.sent + block_size).min(transfer.image.len());
            transfer.in_flight = end - transfer.sent;
            HostCommand::UpdateBlock {
                offset: transfer.sent as u32,
                data: transfer.image.slice(transfer.sent..end),
            }
        } else {
            transfer.in_flight = 0;
            HostCommand::UpdateFinish
        };
        self.send(command)
    }

    fn on_update_ack(&mut self, op: Opcode, status: AckStatus, out: &mut Vec<Notification>) {
        if self.update.is_none() {
            warn!("unmatched {:?} ack: {:?}", op, status);
            return;
        }

        if !status.is_ok() {
            warn!("device rejected {:?}: {:?}", op, status);
            let error = match op {
                Opcode::UpdateBegin => SessionError::UpdateInitiatedUnsuccessfully,
                _ => SessionError::Rejected {
                    operation: OperationKind::Update,
                    status,
                },
            };
            self.finish_update(Err(error));
            return;
        }

        match op {
            Opcode::UpdateFinish => {
                info!("firmware update complete");
                self.finish_update(Ok(()));
                return;
            }
            Opcode::UpdateBlock => {
                if let Some(transfer) = self.update.as_mut() {
                    transfer.sent += transfer.in_flight;
                    out.push(Notification::Progress(
                        transfer.progress.clone(),
                        transfer.sent,
                        transfer.image.len(),
                    ));
                }
            }
            _ => debug!("device accepted firmware update"),
        }

        if let Err(e) = self.send_next_block() {
            warn!("firmware transfer interrupted: {}", e);
            out.extend(self.link_lost());
        }
    }
}

/// Open the link, send the handshake, then run the reactor for this connection.
pub(crate) async fn connect_task(
    shared: Shared,
    connector: Arc<dyn Connector>,
    device: String,
    generation: u64,
    cancel: CancellationToken,
) {
    let opened = tokio::select! {
        _ = cancel.cancelled() => {
            debug!("connect to {} cancelled", device);
            return;
        }
        opened = connector.open(&device) => opened,
    };

    let events = {
        let mut inner = lock(&shared);
        if inner.generation != generation {
            debug!("discarding link to {} from a stale connect", device);
            return;
        }

        let Link { transport, events } = match opened {
            Ok(link) => link,
            Err(e) => {
                inner.fail_connect(SessionError::Transport(e));
                return;
            }
        };

        inner.transport = Some(transport);
        if let Err(e) = inner.send(HostCommand::Handshake {
            protocol_version: PROTOCOL_VERSION,
        }) {
            inner.fail_connect(SessionError::ConnectionFailed(e.to_string()));
            return;
        }
        debug!("handshake sent to {}", device);
        events
    };

    run(shared, events, generation, cancel).await;
}

/// Deliver inbound events until the link is lost or torn down.
async fn run(
    shared: Shared,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    generation: u64,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("reactor for generation {} cancelled", generation);
                return;
            }
            event = events.recv() => event.unwrap_or(TransportEvent::LinkLost),
        };

        let link_lost = matches!(event, TransportEvent::LinkLost);
        let notifications = {
            let mut inner = lock(&shared);
            if inner.generation != generation {
                return;
            }
            match event {
                TransportEvent::Frame(bytes) => inner.handle_frame(&bytes),
                TransportEvent::LinkLost => inner.link_lost(),
            }
        };

        for notification in notifications {
            notification.deliver();
        }

        if link_lost {
            return;
        }
    }
}
