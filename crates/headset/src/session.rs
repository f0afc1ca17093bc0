//! The device session: public operations and the state machine they drive.

use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use headconf::HeadsetConfig;
use headproto::{
    BatteryInfo, ChannelId, Connector, DeviceInfo, GainMode, HostCommand, ImpedanceMode, Polarity,
};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::assembler::{Chunk, StreamStats};
use crate::caches::Annotation;
use crate::config::StagedConfig;
use crate::correlator::{Completion, OperationKind};
use crate::error::SessionError;
use crate::reactor::{self, Inner, PendingStart, Settings, Shared, UpdateTransfer};

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Streaming,
    /// Firmware transfer in progress; entered only from `Connected`
    Updating,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Streaming => "streaming",
            SessionState::Updating => "updating",
        }
    }

    /// States with a live (or opening) link
    pub fn is_linked(&self) -> bool {
        !matches!(self, SessionState::Disconnected)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session with one headset.
///
/// A session is move-only. Operations that wait on the device return a
/// [`Completion`]; everything else answers immediately. Inbound events are
/// handled by a reactor task on the runtime the session was created on, and
/// the callbacks registered here run on that task after the session lock is
/// released, so they may call the getters.
///
/// ```rust,no_run
/// # use std::sync::Arc;
/// # use headset::Session;
/// # use headconf::HeadsetConfig;
/// # use headproto::{ChannelId, sim::SimulatedHeadset};
/// # async fn demo() -> Result<(), headset::SessionError> {
/// let mut session = Session::new(Arc::new(SimulatedHeadset::default()), &HeadsetConfig::default())?;
/// session.connect("HALO-1")?.await?;
/// session.set_channel_enabled(ChannelId::Electrode(0), true)?;
/// session.set_chunk_callback(|chunk| println!("{} samples", chunk.sample_count()));
/// session.start_stream()?.await?;
/// session.close();
/// # Ok(())
/// # }
/// ```
pub struct Session {
    id: Uuid,
    shared: Shared,
    connector: Arc<dyn Connector>,
    runtime: Handle,
}

impl Session {
    /// Create a session on the current tokio runtime.
    pub fn new(connector: Arc<dyn Connector>, config: &HeadsetConfig) -> Result<Self, SessionError> {
        let runtime = Handle::try_current().map_err(|_| SessionError::NoRuntime)?;
        Ok(Self::with_runtime(connector, config, runtime))
    }

    /// Create a session whose reactor runs on `runtime`.
    pub fn with_runtime(connector: Arc<dyn Connector>, config: &HeadsetConfig, runtime: Handle) -> Self {
        let id = Uuid::new_v4();
        debug!("session {} created", id);
        Self {
            id,
            shared: Arc::new(Mutex::new(Inner::new(Settings::from(config), runtime.clone()))),
            connector,
            runtime,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        reactor::lock(&self.shared)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    // --- lifecycle ---

    /// Open a link to `device` and identify it. Valid only while disconnected.
    pub fn connect(&mut self, device: &str) -> Result<Completion, SessionError> {
        let mut inner = self.lock();
        inner.require(SessionState::Disconnected, "connect")?;
        inner.check_overlap(OperationKind::Connect)?;

        let (generation, cancel) = inner.begin_connect();
        let completion = inner.correlator.register(OperationKind::Connect);
        drop(inner);

        info!("session {} connecting to {}", self.id, device);
        self.runtime.spawn(reactor::connect_task(
            self.shared.clone(),
            self.connector.clone(),
            device.to_string(),
            generation,
            cancel,
        ));
        Ok(completion)
    }

    /// Tear the link down now. Pending completions fail with a disconnection
    /// error; identity and annotations are cleared. The disconnect callback
    /// is not invoked for a local disconnect. No-op when already disconnected.
    pub fn disconnect(&mut self) {
        let mut inner = self.lock();
        if inner.state == SessionState::Disconnected {
            return;
        }

        info!("session {} disconnecting from {}", self.id, inner.state);
        inner.teardown_link();
        let failed = inner.fail_pending();
        if failed > 0 {
            debug!("failed {} pending operation(s) on disconnect", failed);
        }
        inner.annotations.clear();
    }

    /// Disconnect and consume the session.
    pub fn close(mut self) {
        self.disconnect();
    }

    // --- streaming ---

    /// Commit the staged configuration and start streaming. Valid only while
    /// connected; the staged configuration is consumed.
    pub fn start_stream(&mut self) -> Result<Completion, SessionError> {
        let mut inner = self.lock();
        inner.require(SessionState::Connected, "start_stream")?;
        inner.check_overlap(OperationKind::StartStream)?;

        let identity = inner.identity.clone().ok_or(SessionError::Unavailable)?;
        let staged = std::mem::take(&mut inner.staged);
        let committed = staged.clone().commit(&identity);

        if let Err(e) = inner.send(HostCommand::StartStream(committed.setup().clone())) {
            inner.staged = staged;
            return Err(e);
        }

        debug!("start_stream sent with {} channel(s)", committed.len());
        inner.pending_start = Some(PendingStart { committed, staged });
        Ok(inner.correlator.register(OperationKind::StartStream))
    }

    /// Stop streaming and discard the committed configuration.
    pub fn stop_stream(&mut self) -> Result<Completion, SessionError> {
        let mut inner = self.lock();
        inner.require(SessionState::Streaming, "stop_stream")?;
        inner.check_overlap(OperationKind::StopStream)?;

        inner.send(HostCommand::StopStream)?;
        Ok(inner.correlator.register(OperationKind::StopStream))
    }

    /// Replace the staged configuration with the one persisted on the device.
    pub fn load_config(&mut self) -> Result<Completion, SessionError> {
        let mut inner = self.lock();
        inner.require(SessionState::Connected, "load_config")?;
        inner.check_overlap(OperationKind::LoadConfig)?;

        inner.send(HostCommand::RequestConfig)?;
        Ok(inner.correlator.register(OperationKind::LoadConfig))
    }

    // --- firmware update ---

    /// Push the configured firmware image to the device.
    pub fn start_update<F>(&mut self, progress: F) -> Result<Completion, SessionError>
    where
        F: Fn(usize, usize) + Send + Sync + 'static,
    {
        let path = self.lock().settings.firmware_path.clone();
        self.start_update_from(path, progress)
    }

    /// Push the firmware image at `path` to the device.
    ///
    /// `progress` receives `(bytes_acknowledged, total_bytes)` after every
    /// block the device accepts. A file that cannot be read resolves the
    /// completion with [`SessionError::UpdateFileNotFound`] and leaves the
    /// session state unchanged.
    pub fn start_update_from<F>(&mut self, path: impl AsRef<Path>, progress: F) -> Result<Completion, SessionError>
    where
        F: Fn(usize, usize) + Send + Sync + 'static,
    {
        let path = path.as_ref();
        {
            let inner = self.lock();
            inner.require(SessionState::Connected, "start_update")?;
            inner.check_overlap(OperationKind::Update)?;
        }

        let image = match std::fs::read(path) {
            Ok(image) => Bytes::from(image),
            Err(e) => {
                warn!("firmware image {} unreadable: {}", path.display(), e);
                return Ok(Completion::ready(
                    Err(SessionError::UpdateFileNotFound {
                        path: path.to_path_buf(),
                        message: e.to_string(),
                    }),
                    self.runtime.clone(),
                ));
            }
        };

        let Ok(size) = u32::try_from(image.len()) else {
            warn!("firmware image {} is too large ({} bytes)", path.display(), image.len());
            return Ok(Completion::ready(
                Err(SessionError::UpdateInitiatedUnsuccessfully),
                self.runtime.clone(),
            ));
        };
        let digest = *blake3::hash(&image).as_bytes();

        // The link may have changed while the file was read.
        let mut inner = self.lock();
        inner.require(SessionState::Connected, "start_update")?;
        inner.check_overlap(OperationKind::Update)?;

        inner.send(HostCommand::UpdateBegin { size, digest })?;
        info!(
            "session {} updating firmware from {} ({} bytes, blake3 {})",
            self.id,
            path.display(),
            size,
            blake3::Hash::from(digest).to_hex()
        );
        inner.state = SessionState::Updating;
        inner.update = Some(UpdateTransfer {
            image,
            sent: 0,
            in_flight: 0,
            progress: Arc::new(progress),
        });
        Ok(inner.correlator.register(OperationKind::Update))
    }

    // --- channel configuration (staged, effective at next start) ---

    fn stage(&mut self, channel: ChannelId, edit: impl FnOnce(&mut StagedConfig)) -> Result<(), SessionError> {
        if !channel.is_representable() {
            return Err(SessionError::InvalidChannel(channel));
        }
        edit(&mut self.lock().staged);
        Ok(())
    }

    pub fn set_channel_enabled(&mut self, channel: ChannelId, enabled: bool) -> Result<(), SessionError> {
        self.stage(channel, |staged| staged.set_enabled(channel, enabled))
    }

    /// No-op for channels without an analog front end.
    pub fn set_channel_gain(&mut self, channel: ChannelId, gain: GainMode) -> Result<(), SessionError> {
        self.stage(channel, |staged| staged.set_gain(channel, gain))
    }

    /// No-op for channels without an analog front end.
    pub fn set_channel_bias(&mut self, channel: ChannelId, bias: Polarity) -> Result<(), SessionError> {
        self.stage(channel, |staged| staged.set_bias(channel, bias))
    }

    pub fn set_impedance_mode(&mut self, mode: ImpedanceMode) {
        self.lock().staged.set_impedance(mode);
    }

    /// Copy of the configuration the next `start_stream` will commit.
    pub fn staged_config(&self) -> StagedConfig {
        self.lock().staged.clone()
    }

    // --- queries ---

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            SessionState::Connected | SessionState::Streaming | SessionState::Updating
        )
    }

    pub fn is_streaming(&self) -> bool {
        self.state() == SessionState::Streaming
    }

    /// Identity of the connected device.
    pub fn device_info(&self) -> Result<DeviceInfo, SessionError> {
        self.lock().identity.clone().ok_or(SessionError::Unavailable)
    }

    pub fn sample_frequency(&self) -> Result<u16, SessionError> {
        self.lock()
            .identity
            .as_ref()
            .map(|info| info.sample_frequency)
            .ok_or(SessionError::Unavailable)
    }

    /// Index of `channel` in delivered chunks. Valid only while streaming;
    /// `None` when the channel is not part of the stream.
    pub fn channel_index(&self, channel: ChannelId) -> Result<Option<usize>, SessionError> {
        let inner = self.lock();
        inner.require(SessionState::Streaming, "channel_index")?;
        Ok(inner
            .committed
            .as_ref()
            .and_then(|committed| committed.channel_index(channel)))
    }

    /// Streamed channels in index order. Valid only while streaming.
    pub fn streamed_channels(&self) -> Result<Vec<ChannelId>, SessionError> {
        let inner = self.lock();
        inner.require(SessionState::Streaming, "streamed_channels")?;
        Ok(inner
            .committed
            .as_ref()
            .map(|committed| committed.channels().to_vec())
            .unwrap_or_default())
    }

    /// Last battery status pushed by the device; default before the first push.
    pub fn battery_info(&self) -> BatteryInfo {
        self.lock().battery.latest()
    }

    /// Counters of the current stream, or of the last one once stopped.
    pub fn stream_stats(&self) -> StreamStats {
        self.lock().stream_stats()
    }

    // --- annotations ---

    /// Record a timestamped annotation. Valid while streaming; refused with
    /// a retryable error while the device calibrates.
    pub fn annotate(&mut self, text: impl Into<String>) -> Result<(), SessionError> {
        let mut inner = self.lock();
        if !inner.ever_connected {
            return Err(SessionError::NotConnected);
        }
        inner.require(SessionState::Streaming, "annotate")?;
        if inner.calibrating {
            return Err(SessionError::AnnotationUnavailableCalibrating);
        }

        inner.annotations.push(text.into());
        debug!("annotation #{} recorded", inner.annotations.len());
        Ok(())
    }

    pub fn annotations(&self) -> Vec<Annotation> {
        self.lock().annotations.snapshot()
    }

    pub fn clear_annotations(&mut self) {
        self.lock().annotations.clear();
    }

    // --- callbacks ---

    /// Called with every assembled chunk while streaming. The chunk is only
    /// borrowed for the duration of the call.
    pub fn set_chunk_callback<F>(&mut self, callback: F)
    where
        F: Fn(&Chunk) + Send + Sync + 'static,
    {
        self.lock().callbacks.chunk = Some(Arc::new(callback));
    }

    pub fn clear_chunk_callback(&mut self) {
        self.lock().callbacks.chunk = None;
    }

    /// Called with every battery status push.
    pub fn set_battery_callback<F>(&mut self, callback: F)
    where
        F: Fn(BatteryInfo) + Send + Sync + 'static,
    {
        self.lock().callbacks.battery = Some(Arc::new(callback));
    }

    pub fn clear_battery_callback(&mut self) {
        self.lock().callbacks.battery = None;
    }

    /// Called once per unsolicited link loss.
    pub fn set_disconnect_callback<F>(&mut self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.lock().callbacks.disconnect = Some(Arc::new(callback));
    }

    pub fn clear_disconnect_callback(&mut self) {
        self.lock().callbacks.disconnect = None;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
