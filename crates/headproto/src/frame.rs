//! Headset frame codec
//!
//! Every message on the link is a single frame:
//!
//! ```text
//! Byte 0      Marker        0xBA
//! Byte 1      Message type  host commands 0x01..=0x07, device messages 0x81..=0x86
//! Byte 2..    Body          fixed big-endian fields per type
//! ```
//!
//! Host commands use their [`Opcode`] as the message type so acknowledgements
//! can name the command they answer in a single byte.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::types::{
    BatteryInfo, ChannelId, ChannelSettings, DataFrame, DeviceInfo, DeviceModel, GainMode,
    ImpedanceMode, Polarity, StreamSetup, Version,
};

/// Leading byte of every frame
pub const MARKER: u8 = 0xBA;

/// Version sent in the handshake. Bump on breaking changes.
pub const PROTOCOL_VERSION: u16 = 1;

/// Size of the BLAKE3 digest announced in `UpdateBegin`
pub const DIGEST_LEN: usize = 32;

const MSG_IDENTITY: u8 = 0x81;
const MSG_ACK: u8 = 0x82;
const MSG_DATA: u8 = 0x83;
const MSG_BATTERY: u8 = 0x84;
const MSG_CONFIG_REPORT: u8 = 0x85;
const MSG_CALIBRATION: u8 = 0x86;

/// Host command opcodes (1 byte)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Handshake = 0x01,
    StartStream = 0x02,
    StopStream = 0x03,
    RequestConfig = 0x04,
    UpdateBegin = 0x05,
    UpdateBlock = 0x06,
    UpdateFinish = 0x07,
}

impl Opcode {
    /// Parse a u8 into an Opcode
    pub fn from_u8(value: u8) -> Result<Self, FrameError> {
        match value {
            0x01 => Ok(Opcode::Handshake),
            0x02 => Ok(Opcode::StartStream),
            0x03 => Ok(Opcode::StopStream),
            0x04 => Ok(Opcode::RequestConfig),
            0x05 => Ok(Opcode::UpdateBegin),
            0x06 => Ok(Opcode::UpdateBlock),
            0x07 => Ok(Opcode::UpdateFinish),
            other => Err(FrameError::InvalidOpcode(other)),
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Result carried by an acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    Ok,
    Rejected,
    Busy,
    Unsupported,
    Other(u8),
}

impl AckStatus {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => AckStatus::Ok,
            0x01 => AckStatus::Rejected,
            0x02 => AckStatus::Busy,
            0x03 => AckStatus::Unsupported,
            other => AckStatus::Other(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            AckStatus::Ok => 0x00,
            AckStatus::Rejected => 0x01,
            AckStatus::Busy => 0x02,
            AckStatus::Unsupported => 0x03,
            AckStatus::Other(code) => code,
        }
    }

    pub fn is_ok(self) -> bool {
        self == AckStatus::Ok
    }
}

/// Commands sent from host to headset
#[derive(Debug, Clone, PartialEq)]
pub enum HostCommand {
    Handshake { protocol_version: u16 },
    StartStream(StreamSetup),
    StopStream,
    RequestConfig,
    UpdateBegin { size: u32, digest: [u8; DIGEST_LEN] },
    UpdateBlock { offset: u32, data: Bytes },
    UpdateFinish,
}

/// Messages sent from headset to host
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceMessage {
    /// Reply to `Handshake`
    Identity(DeviceInfo),
    Ack { op: Opcode, status: AckStatus },
    Data(DataFrame),
    Battery(BatteryInfo),
    /// Reply to `RequestConfig` with the persisted setup
    ConfigReport(StreamSetup),
    Calibration { active: bool },
}

/// Errors during frame encoding and parsing
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("Empty frame")]
    Empty,
    #[error("Invalid marker: {0:#04x}")]
    InvalidMarker(u8),
    #[error("Unknown message type: {0:#04x}")]
    UnknownType(u8),
    #[error("Invalid opcode: {0:#04x}")]
    InvalidOpcode(u8),
    #[error("Invalid channel code: {0:#04x}")]
    InvalidChannel(u8),
    #[error("Invalid gain: {0}")]
    InvalidGain(u8),
    #[error("Invalid polarity: {0}")]
    InvalidPolarity(u8),
    #[error("Invalid impedance mode: {0}")]
    InvalidImpedance(u8),
    #[error("Frame too short for {what}: expected {expected} bytes, got {actual}")]
    FrameTooShort {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("Trailing bytes after frame body: {0}")]
    TrailingBytes(usize),
}

fn need(buf: &[u8], expected: usize, what: &'static str) -> Result<(), FrameError> {
    if buf.len() < expected {
        return Err(FrameError::FrameTooShort {
            what,
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

fn finish(buf: &[u8]) -> Result<(), FrameError> {
    match buf.len() {
        0 => Ok(()),
        extra => Err(FrameError::TrailingBytes(extra)),
    }
}

/// Split the marker and type byte off a frame.
fn header(frame: &[u8]) -> Result<(u8, &[u8]), FrameError> {
    match frame {
        [] => Err(FrameError::Empty),
        [MARKER, kind, body @ ..] => Ok((*kind, body)),
        [MARKER] => Err(FrameError::FrameTooShort {
            what: "header",
            expected: 2,
            actual: 1,
        }),
        [other, ..] => Err(FrameError::InvalidMarker(*other)),
    }
}

fn put_setup(buf: &mut BytesMut, setup: &StreamSetup) {
    buf.put_u8(setup.impedance as u8);
    buf.put_u8(setup.channels.len() as u8);
    for (id, settings) in &setup.channels {
        buf.put_u8(id.code());
        buf.put_u8(settings.enabled as u8);
        buf.put_u8(settings.gain as u8);
        buf.put_u8(settings.bias as u8);
    }
}

fn get_setup(buf: &mut &[u8]) -> Result<StreamSetup, FrameError> {
    need(buf, 2, "stream setup")?;
    let impedance = ImpedanceMode::from_u8(buf.get_u8())?;
    let count = buf.get_u8() as usize;
    need(buf, count * 4, "channel settings")?;

    let mut channels = Vec::with_capacity(count);
    for _ in 0..count {
        let id = ChannelId::from_code(buf.get_u8())?;
        let enabled = buf.get_u8() != 0;
        let gain = GainMode::from_u8(buf.get_u8())?;
        let bias = Polarity::from_u8(buf.get_u8())?;
        channels.push((id, ChannelSettings { enabled, gain, bias }));
    }

    Ok(StreamSetup { impedance, channels })
}

fn put_version(buf: &mut BytesMut, v: Version) {
    buf.put_u8(v.major);
    buf.put_u8(v.minor);
    buf.put_u8(v.patch);
}

fn get_version(buf: &mut &[u8]) -> Version {
    Version::new(buf.get_u8(), buf.get_u8(), buf.get_u8())
}

impl HostCommand {
    pub fn opcode(&self) -> Opcode {
        match self {
            HostCommand::Handshake { .. } => Opcode::Handshake,
            HostCommand::StartStream(_) => Opcode::StartStream,
            HostCommand::StopStream => Opcode::StopStream,
            HostCommand::RequestConfig => Opcode::RequestConfig,
            HostCommand::UpdateBegin { .. } => Opcode::UpdateBegin,
            HostCommand::UpdateBlock { .. } => Opcode::UpdateBlock,
            HostCommand::UpdateFinish => Opcode::UpdateFinish,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_u8(MARKER);
        buf.put_u8(self.opcode().to_u8());

        match self {
            HostCommand::Handshake { protocol_version } => buf.put_u16(*protocol_version),
            HostCommand::StartStream(setup) => put_setup(&mut buf, setup),
            HostCommand::UpdateBegin { size, digest } => {
                buf.put_u32(*size);
                buf.put_slice(digest);
            }
            HostCommand::UpdateBlock { offset, data } => {
                buf.put_u32(*offset);
                buf.put_u16(data.len() as u16);
                buf.put_slice(data);
            }
            HostCommand::StopStream | HostCommand::RequestConfig | HostCommand::UpdateFinish => {}
        }

        buf.freeze()
    }

    pub fn decode(frame: &[u8]) -> Result<Self, FrameError> {
        let (kind, mut body) = header(frame)?;
        let buf = &mut body;

        let command = match Opcode::from_u8(kind).map_err(|_| FrameError::UnknownType(kind))? {
            Opcode::Handshake => {
                need(buf, 2, "handshake")?;
                HostCommand::Handshake {
                    protocol_version: buf.get_u16(),
                }
            }
            Opcode::StartStream => HostCommand::StartStream(get_setup(buf)?),
            Opcode::StopStream => HostCommand::StopStream,
            Opcode::RequestConfig => HostCommand::RequestConfig,
            Opcode::UpdateBegin => {
                need(buf, 4 + DIGEST_LEN, "update begin")?;
                let size = buf.get_u32();
                let mut digest = [0u8; DIGEST_LEN];
                buf.copy_to_slice(&mut digest);
                HostCommand::UpdateBegin { size, digest }
            }
            Opcode::UpdateBlock => {
                need(buf, 6, "update block header")?;
                let offset = buf.get_u32();
                let len = buf.get_u16() as usize;
                need(buf, len, "update block data")?;
                let data = Bytes::copy_from_slice(&buf[..len]);
                buf.advance(len);
                HostCommand::UpdateBlock { offset, data }
            }
            Opcode::UpdateFinish => HostCommand::UpdateFinish,
        };

        finish(buf)?;
        Ok(command)
    }
}

impl DeviceMessage {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(32);
        buf.put_u8(MARKER);

        match self {
            DeviceMessage::Identity(info) => {
                buf.put_u8(MSG_IDENTITY);
                buf.put_u8(info.model.to_u8());
                buf.put_u64(info.serial_number);
                put_version(&mut buf, info.hardware_version);
                put_version(&mut buf, info.firmware_version);
                buf.put_u8(info.electrode_count);
                buf.put_u8(info.has_accelerometer as u8);
                buf.put_u16(info.sample_frequency);
            }
            DeviceMessage::Ack { op, status } => {
                buf.put_u8(MSG_ACK);
                buf.put_u8(op.to_u8());
                buf.put_u8(status.to_u8());
            }
            DeviceMessage::Data(frame) => {
                buf.put_u8(MSG_DATA);
                buf.put_u16(frame.sequence);
                buf.put_u8(frame.channels);
                buf.put_u8(frame.timesteps);
                for value in &frame.values {
                    buf.put_f32(*value);
                }
            }
            DeviceMessage::Battery(info) => {
                buf.put_u8(MSG_BATTERY);
                buf.put_u8(info.level);
                buf.put_u8((info.is_charging as u8) | ((info.is_charger_connected as u8) << 1));
            }
            DeviceMessage::ConfigReport(setup) => {
                buf.put_u8(MSG_CONFIG_REPORT);
                put_setup(&mut buf, setup);
            }
            DeviceMessage::Calibration { active } => {
                buf.put_u8(MSG_CALIBRATION);
                buf.put_u8(*active as u8);
            }
        }

        buf.freeze()
    }

    pub fn decode(frame: &[u8]) -> Result<Self, FrameError> {
        let (kind, mut body) = header(frame)?;
        let buf = &mut body;

        let message = match kind {
            MSG_IDENTITY => {
                need(buf, 1 + 8 + 3 + 3 + 1 + 1 + 2, "identity")?;
                DeviceMessage::Identity(DeviceInfo {
                    model: DeviceModel::from_u8(buf.get_u8()),
                    serial_number: buf.get_u64(),
                    hardware_version: get_version(buf),
                    firmware_version: get_version(buf),
                    electrode_count: buf.get_u8(),
                    has_accelerometer: buf.get_u8() != 0,
                    sample_frequency: buf.get_u16(),
                })
            }
            MSG_ACK => {
                need(buf, 2, "ack")?;
                DeviceMessage::Ack {
                    op: Opcode::from_u8(buf.get_u8())?,
                    status: AckStatus::from_u8(buf.get_u8()),
                }
            }
            MSG_DATA => {
                need(buf, 4, "data header")?;
                let sequence = buf.get_u16();
                let channels = buf.get_u8();
                let timesteps = buf.get_u8();
                let count = channels as usize * timesteps as usize;
                need(buf, count * 4, "data samples")?;
                let values = (0..count).map(|_| buf.get_f32()).collect();
                DeviceMessage::Data(DataFrame {
                    sequence,
                    channels,
                    timesteps,
                    values,
                })
            }
            MSG_BATTERY => {
                need(buf, 2, "battery")?;
                let level = buf.get_u8();
                let flags = buf.get_u8();
                DeviceMessage::Battery(BatteryInfo {
                    level,
                    is_charging: flags & 0x01 != 0,
                    is_charger_connected: flags & 0x02 != 0,
                })
            }
            MSG_CONFIG_REPORT => DeviceMessage::ConfigReport(get_setup(buf)?),
            MSG_CALIBRATION => {
                need(buf, 1, "calibration")?;
                DeviceMessage::Calibration {
                    active: buf.get_u8() != 0,
                }
            }
            other => return Err(FrameError::UnknownType(other)),
        };

        finish(buf)?;
        Ok(message)
    }
}
