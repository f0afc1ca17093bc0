//! Simulated headset.
//!
//! [`SimulatedHeadset`] is a [`Connector`] whose links are served by an
//! in-process device task. The device answers the handshake, acknowledges
//! stream and update commands, pushes data at its sample rate and battery
//! status periodically, and keeps the last started setup across
//! reconnects the way real firmware persists it.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::frame::{AckStatus, DeviceMessage, HostCommand, Opcode, DIGEST_LEN, PROTOCOL_VERSION};
use crate::loopback::{pair, DeviceEnd};
use crate::transport::{Connector, Link, TransportError};
use crate::types::{
    Axis, BatteryInfo, ChannelId, DataFrame, DeviceInfo, DeviceModel, StreamSetup, Version,
};

/// Upper bound on the buffer reserved up front for an announced image.
const MAX_RESERVED: u32 = 1 << 20;

/// Behaviour knobs for the simulated device
#[derive(Debug, Clone)]
pub struct SimOptions {
    pub identity: DeviceInfo,
    /// Timesteps carried by each data frame
    pub timesteps_per_frame: u8,
    pub battery: BatteryInfo,
    pub battery_interval: Duration,
    /// Report calibration for this long after each stream start
    pub calibration: Option<Duration>,
    pub reject_stream: bool,
    pub reject_update: bool,
    /// Drop the link instead of acknowledging the Nth update block
    pub drop_on_update_block: Option<usize>,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            identity: DeviceInfo {
                model: DeviceModel::Halo,
                serial_number: 0x00C0_FFEE,
                hardware_version: Version::new(1, 2, 0),
                firmware_version: Version::new(1, 4, 2),
                electrode_count: 8,
                has_accelerometer: true,
                sample_frequency: 250,
            },
            timesteps_per_frame: 5,
            battery: BatteryInfo {
                level: 87,
                is_charging: false,
                is_charger_connected: false,
            },
            battery_interval: Duration::from_secs(1),
            calibration: None,
            reject_stream: false,
            reject_update: false,
            drop_on_update_block: None,
        }
    }
}

#[derive(Debug, Default)]
struct Persisted {
    setup: StreamSetup,
    firmware: Option<[u8; DIGEST_LEN]>,
    connections: usize,
}

/// A simulated headset reachable under any device identifier
#[derive(Clone)]
pub struct SimulatedHeadset {
    options: SimOptions,
    persisted: Arc<Mutex<Persisted>>,
}

impl SimulatedHeadset {
    pub fn new(options: SimOptions) -> Self {
        Self {
            options,
            persisted: Arc::new(Mutex::new(Persisted::default())),
        }
    }

    fn persisted(&self) -> MutexGuard<'_, Persisted> {
        self.persisted.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Setup the device would report for `RequestConfig`
    pub fn persisted_setup(&self) -> StreamSetup {
        self.persisted().setup.clone()
    }

    /// Digest of the last firmware image accepted by the device
    pub fn installed_firmware(&self) -> Option<[u8; DIGEST_LEN]> {
        self.persisted().firmware
    }

    /// Number of links opened so far
    pub fn connections(&self) -> usize {
        self.persisted().connections
    }
}

impl Default for SimulatedHeadset {
    fn default() -> Self {
        Self::new(SimOptions::default())
    }
}

#[async_trait]
impl Connector for SimulatedHeadset {
    async fn open(&self, device: &str) -> Result<Link, TransportError> {
        let (link, end) = pair(device);
        self.persisted().connections += 1;
        info!("simulated headset {} accepting link", device);
        tokio::spawn(run_device(end, self.options.clone(), self.persisted.clone()));
        Ok(link)
    }
}

struct ActiveStream {
    channels: Vec<ChannelId>,
    sequence: u16,
    sample: u32,
}

struct Transfer {
    size: u32,
    digest: [u8; DIGEST_LEN],
    received: Vec<u8>,
    blocks: usize,
}

enum Flow {
    Continue,
    DropLink,
}

struct Device {
    options: SimOptions,
    persisted: Arc<Mutex<Persisted>>,
    identified: bool,
    battery: BatteryInfo,
    stream: Option<ActiveStream>,
    calibration_until: Option<Instant>,
    transfer: Option<Transfer>,
}

async fn run_device(mut end: DeviceEnd, options: SimOptions, persisted: Arc<Mutex<Persisted>>) {
    let frequency = options.identity.sample_frequency.max(1) as f64;
    let frame_period = Duration::from_secs_f64(options.timesteps_per_frame.max(1) as f64 / frequency);
    let mut data_tick = tokio::time::interval(frame_period);
    data_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut battery_tick = tokio::time::interval(options.battery_interval);
    battery_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut device = Device {
        battery: options.battery,
        options,
        persisted,
        identified: false,
        stream: None,
        calibration_until: None,
        transfer: None,
    };

    loop {
        let mut drop_link = false;
        let sent = tokio::select! {
            command = end.recv_command() => {
                let Some(command) = command else {
                    debug!("{}: host closed the link", end.device());
                    return;
                };
                if let Flow::DropLink = device.handle(&end, command) {
                    drop_link = true;
                }
                Ok(())
            }
            _ = data_tick.tick(), if device.stream.is_some() => {
                match device.next_frame() {
                    Some(frame) => end.send(&DeviceMessage::Data(frame)),
                    None => Ok(()),
                }
            }
            _ = battery_tick.tick(), if device.identified => {
                device.drain_battery();
                end.send(&DeviceMessage::Battery(device.battery))
            }
            _ = tokio::time::sleep_until(device.calibration_until.unwrap_or_else(Instant::now)),
                if device.calibration_until.is_some() => {
                device.calibration_until = None;
                end.send(&DeviceMessage::Calibration { active: false })
            }
        };

        if drop_link {
            end.drop_link();
            return;
        }
        if sent.is_err() {
            debug!("{}: host gone, stopping device task", end.device());
            return;
        }
    }
}

impl Device {
    fn persisted(&self) -> MutexGuard<'_, Persisted> {
        self.persisted.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ack(end: &DeviceEnd, op: Opcode, status: AckStatus) -> Result<(), TransportError> {
        end.send(&DeviceMessage::Ack { op, status })
    }

    fn handle(&mut self, end: &DeviceEnd, command: HostCommand) -> Flow {
        trace!("{}: received {:?}", end.device(), command.opcode());
        let op = command.opcode();

        // A closed host is noticed by the next recv_command.
        let _ = match command {
            HostCommand::Handshake { protocol_version } => {
                if protocol_version != PROTOCOL_VERSION {
                    warn!("{}: unsupported protocol version {}", end.device(), protocol_version);
                    Self::ack(end, op, AckStatus::Unsupported)
                } else {
                    self.identified = true;
                    end.send(&DeviceMessage::Identity(self.options.identity.clone()))
                }
            }
            HostCommand::StartStream(setup) => self.start_stream(end, setup),
            HostCommand::StopStream => {
                if self.stream.take().is_some() {
                    self.calibration_until = None;
                    Self::ack(end, op, AckStatus::Ok)
                } else {
                    Self::ack(end, op, AckStatus::Rejected)
                }
            }
            HostCommand::RequestConfig => {
                let setup = self.persisted().setup.clone();
                end.send(&DeviceMessage::ConfigReport(setup))
            }
            HostCommand::UpdateBegin { size, digest } => {
                if self.options.reject_update {
                    Self::ack(end, op, AckStatus::Rejected)
                } else if self.stream.is_some() {
                    Self::ack(end, op, AckStatus::Busy)
                } else {
                    self.transfer = Some(Transfer {
                        size,
                        digest,
                        received: Vec::with_capacity(size.min(MAX_RESERVED) as usize),
                        blocks: 0,
                    });
                    Self::ack(end, op, AckStatus::Ok)
                }
            }
            HostCommand::UpdateBlock { offset, data } => {
                let Some(transfer) = self.transfer.as_mut() else {
                    let _ = Self::ack(end, op, AckStatus::Rejected);
                    return Flow::Continue;
                };
                if offset as usize != transfer.received.len() {
                    warn!(
                        "{}: update block at {} but expected {}",
                        end.device(),
                        offset,
                        transfer.received.len()
                    );
                    Self::ack(end, op, AckStatus::Rejected)
                } else {
                    transfer.received.extend_from_slice(&data);
                    transfer.blocks += 1;
                    if self.options.drop_on_update_block == Some(transfer.blocks) {
                        return Flow::DropLink;
                    }
                    Self::ack(end, op, AckStatus::Ok)
                }
            }
            HostCommand::UpdateFinish => match self.transfer.take() {
                Some(transfer) => {
                    let digest = blake3::hash(&transfer.received);
                    if transfer.received.len() == transfer.size as usize
                        && digest.as_bytes() == &transfer.digest
                    {
                        info!("{}: firmware image accepted ({} bytes)", end.device(), transfer.size);
                        self.persisted().firmware = Some(transfer.digest);
                        Self::ack(end, op, AckStatus::Ok)
                    } else {
                        warn!("{}: firmware image failed verification", end.device());
                        Self::ack(end, op, AckStatus::Rejected)
                    }
                }
                None => Self::ack(end, op, AckStatus::Rejected),
            },
        };

        Flow::Continue
    }

    fn start_stream(&mut self, end: &DeviceEnd, setup: StreamSetup) -> Result<(), TransportError> {
        let op = Opcode::StartStream;
        if self.options.reject_stream {
            return Self::ack(end, op, AckStatus::Rejected);
        }
        if self.stream.is_some() || self.transfer.is_some() {
            return Self::ack(end, op, AckStatus::Busy);
        }

        let channels: Vec<ChannelId> = setup.enabled().collect();
        debug!("{}: streaming {} channels", end.device(), channels.len());
        self.persisted().setup = setup;
        self.stream = Some(ActiveStream {
            channels,
            sequence: 0,
            sample: 0,
        });
        Self::ack(end, op, AckStatus::Ok)?;

        if let Some(window) = self.options.calibration {
            self.calibration_until = Some(Instant::now() + window);
            end.send(&DeviceMessage::Calibration { active: true })?;
        }
        Ok(())
    }

    fn next_frame(&mut self) -> Option<DataFrame> {
        let timesteps = self.options.timesteps_per_frame;
        let frequency = self.options.identity.sample_frequency.max(1) as f32;
        let stream = self.stream.as_mut()?;

        let mut values = Vec::with_capacity(stream.channels.len() * timesteps as usize);
        for step in 0..timesteps as u32 {
            let sample = stream.sample.wrapping_add(step);
            let t = sample as f32 / frequency;
            for channel in &stream.channels {
                values.push(match channel {
                    ChannelId::Electrode(n) => {
                        20.0 * (2.0 * std::f32::consts::PI * 10.0 * t + *n as f32).sin()
                    }
                    ChannelId::SampleNumber => sample as f32,
                    ChannelId::DigitalInput => 0.0,
                    ChannelId::Accelerometer(Axis::Z) => 1.0,
                    ChannelId::Accelerometer(_) => 0.0,
                });
            }
        }

        let frame = DataFrame {
            sequence: stream.sequence,
            channels: stream.channels.len() as u8,
            timesteps,
            values,
        };
        stream.sequence = stream.sequence.wrapping_add(1);
        stream.sample = stream.sample.wrapping_add(timesteps as u32);
        Some(frame)
    }

    fn drain_battery(&mut self) {
        if !self.battery.is_charging && self.battery.level > 20 {
            self.battery.level -= 1;
        }
    }
}
