//! Domain types shared by the codec, the session and the simulator.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::frame::FrameError;

/// Accelerometer axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];
}

/// A logical acquisition channel on the headset.
///
/// Wire codes:
/// - `0x00..=0x7F` electrode N
/// - `0x80` sample counter
/// - `0x81` digital input
/// - `0x90..=0x92` accelerometer X/Y/Z
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChannelId {
    Electrode(u8),
    SampleNumber,
    DigitalInput,
    Accelerometer(Axis),
}

impl ChannelId {
    /// Highest electrode index representable on the wire.
    pub const MAX_ELECTRODE: u8 = 0x7F;

    /// Parse a wire code into a ChannelId
    pub fn from_code(code: u8) -> Result<Self, FrameError> {
        match code {
            0x00..=0x7F => Ok(ChannelId::Electrode(code)),
            0x80 => Ok(ChannelId::SampleNumber),
            0x81 => Ok(ChannelId::DigitalInput),
            0x90 => Ok(ChannelId::Accelerometer(Axis::X)),
            0x91 => Ok(ChannelId::Accelerometer(Axis::Y)),
            0x92 => Ok(ChannelId::Accelerometer(Axis::Z)),
            other => Err(FrameError::InvalidChannel(other)),
        }
    }

    /// Wire code. Electrode indices above [`Self::MAX_ELECTRODE`] are not
    /// representable; callers validate with [`Self::is_representable`].
    pub fn code(self) -> u8 {
        match self {
            ChannelId::Electrode(n) => n & Self::MAX_ELECTRODE,
            ChannelId::SampleNumber => 0x80,
            ChannelId::DigitalInput => 0x81,
            ChannelId::Accelerometer(Axis::X) => 0x90,
            ChannelId::Accelerometer(Axis::Y) => 0x91,
            ChannelId::Accelerometer(Axis::Z) => 0x92,
        }
    }

    pub fn is_representable(self) -> bool {
        !matches!(self, ChannelId::Electrode(n) if n > Self::MAX_ELECTRODE)
    }

    /// Only electrodes carry an analog front end, so only they accept gain and bias.
    pub fn has_analog_capability(self) -> bool {
        matches!(self, ChannelId::Electrode(_))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelId::Electrode(n) => write!(f, "E{n}"),
            ChannelId::SampleNumber => write!(f, "sample"),
            ChannelId::DigitalInput => write!(f, "digital"),
            ChannelId::Accelerometer(axis) => write!(f, "acc-{axis:?}"),
        }
    }
}

/// Programmable amplifier gain for electrode channels
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum GainMode {
    #[default]
    X1 = 1,
    X2 = 2,
    X4 = 4,
    X6 = 6,
    X8 = 8,
    X12 = 12,
    X24 = 24,
}

impl GainMode {
    pub fn from_u8(value: u8) -> Result<Self, FrameError> {
        match value {
            1 => Ok(GainMode::X1),
            2 => Ok(GainMode::X2),
            4 => Ok(GainMode::X4),
            6 => Ok(GainMode::X6),
            8 => Ok(GainMode::X8),
            12 => Ok(GainMode::X12),
            24 => Ok(GainMode::X24),
            other => Err(FrameError::InvalidGain(other)),
        }
    }

    pub fn multiplier(self) -> u8 {
        self as u8
    }
}

/// Role of an electrode in the bias feedback loop
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Polarity {
    #[default]
    None = 0,
    Positive = 1,
    Negative = 2,
    Both = 3,
}

impl Polarity {
    pub fn from_u8(value: u8) -> Result<Self, FrameError> {
        match value {
            0 => Ok(Polarity::None),
            1 => Ok(Polarity::Positive),
            2 => Ok(Polarity::Negative),
            3 => Ok(Polarity::Both),
            other => Err(FrameError::InvalidPolarity(other)),
        }
    }
}

/// Electrode impedance measurement mode
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ImpedanceMode {
    #[default]
    Off = 0,
    /// Inject an AC test current through the bias electrodes
    Ac = 1,
    /// Inject a DC lead-off current
    Dc = 2,
}

impl ImpedanceMode {
    pub fn from_u8(value: u8) -> Result<Self, FrameError> {
        match value {
            0 => Ok(ImpedanceMode::Off),
            1 => Ok(ImpedanceMode::Ac),
            2 => Ok(ImpedanceMode::Dc),
            other => Err(FrameError::InvalidImpedance(other)),
        }
    }
}

/// Per-channel acquisition settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChannelSettings {
    pub enabled: bool,
    pub gain: GainMode,
    pub bias: Polarity,
}

/// Complete acquisition setup as exchanged with the device.
///
/// Channel order is significant: it is the index order of the stream.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StreamSetup {
    pub impedance: ImpedanceMode,
    pub channels: Vec<(ChannelId, ChannelSettings)>,
}

impl StreamSetup {
    /// Channels that will produce samples, in stream order
    pub fn enabled(&self) -> impl Iterator<Item = ChannelId> + '_ {
        self.channels
            .iter()
            .filter(|(_, settings)| settings.enabled)
            .map(|(id, _)| *id)
    }
}

/// Hardware model reported in the identity reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceModel {
    Halo,
    Unknown(u8),
}

impl DeviceModel {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x01 => DeviceModel::Halo,
            other => DeviceModel::Unknown(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            DeviceModel::Halo => 0x01,
            DeviceModel::Unknown(code) => code,
        }
    }

    pub fn is_supported(self) -> bool {
        !matches!(self, DeviceModel::Unknown(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl Version {
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Identity of a connected headset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub model: DeviceModel,
    pub serial_number: u64,
    pub hardware_version: Version,
    pub firmware_version: Version,
    pub electrode_count: u8,
    pub has_accelerometer: bool,
    /// Samples per second per channel
    pub sample_frequency: u16,
}

impl DeviceInfo {
    /// Every channel this device can stream.
    pub fn channels(&self) -> Vec<ChannelId> {
        let mut channels: Vec<ChannelId> = (0..self.electrode_count).map(ChannelId::Electrode).collect();
        channels.push(ChannelId::SampleNumber);
        channels.push(ChannelId::DigitalInput);
        if self.has_accelerometer {
            channels.extend(Axis::ALL.into_iter().map(ChannelId::Accelerometer));
        }
        channels
    }

    pub fn supports(&self, channel: ChannelId) -> bool {
        match channel {
            ChannelId::Electrode(n) => n < self.electrode_count,
            ChannelId::SampleNumber | ChannelId::DigitalInput => true,
            ChannelId::Accelerometer(_) => self.has_accelerometer,
        }
    }
}

/// Battery status pushed by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BatteryInfo {
    /// Charge level in percent
    pub level: u8,
    pub is_charging: bool,
    pub is_charger_connected: bool,
}

/// One block of samples from the device.
///
/// `values` is timestep-major: all channels of timestep 0, then timestep 1, ...
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataFrame {
    pub sequence: u16,
    pub channels: u8,
    pub timesteps: u8,
    pub values: Vec<f32>,
}
