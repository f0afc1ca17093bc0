//! headset - Session manager for a wireless EEG headset
//!
//! A [`Session`] owns one link to one headset. It walks the connection
//! lifecycle (`Disconnected → Connecting → Connected ⇄ Streaming`, plus
//! `Updating` for firmware transfers), stages channel configuration until the
//! next stream start, reassembles device data frames into fixed-size chunks
//! and caches battery status and annotations.
//!
//! ## Asynchronous operations
//!
//! `connect`, `start_stream`, `stop_stream`, `load_config` and the firmware
//! update return a [`Completion`], a future that resolves once the device
//! answers. Precondition violations are returned synchronously and nothing is
//! sent.
//!
//! ## Transports
//!
//! The session never touches a radio. It opens links through a
//! [`headproto::Connector`]; `headproto::loopback` and `headproto::sim` provide
//! in-process ones.

mod assembler;
mod caches;
mod config;
mod correlator;
mod error;
mod reactor;
mod session;

pub use assembler::{Chunk, StreamAssembler, StreamStats};
pub use caches::Annotation;
pub use config::{CommittedConfig, StagedConfig};
pub use correlator::{Completion, OperationKind};
pub use error::{ErrorCode, SessionError};
pub use reactor::{BatteryCallback, ChunkCallback, DisconnectCallback, ProgressCallback};
pub use session::{Session, SessionState};
