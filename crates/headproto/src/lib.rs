//! headproto - Wire codec and transport contract for the headset session manager
//!
//! ## Frames
//!
//! The `frame` module encodes host commands and decodes device messages. Every
//! frame is a marker byte, a type byte and fixed big-endian fields, small enough
//! to drive and test the session without a radio.
//!
//! ## Peers
//!
//! With the default `peer` feature the crate also provides:
//! - `transport` - the `Transport`/`Connector` seam the session talks through
//! - `loopback` - in-process links whose device end a test can script
//! - `sim` - an autonomous simulated headset behind a `Connector`

pub mod frame;
pub mod types;

#[cfg(feature = "peer")]
pub mod loopback;
#[cfg(feature = "peer")]
pub mod sim;
#[cfg(feature = "peer")]
pub mod transport;

pub use frame::{AckStatus, DeviceMessage, FrameError, HostCommand, Opcode, PROTOCOL_VERSION};
pub use types::{
    Axis, BatteryInfo, ChannelId, ChannelSettings, DataFrame, DeviceInfo, DeviceModel, GainMode,
    ImpedanceMode, Polarity, StreamSetup, Version,
};

#[cfg(feature = "peer")]
pub use transport::{ChannelTransport, Connector, Link, Transport, TransportError, TransportEvent};
