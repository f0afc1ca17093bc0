//! Session error taxonomy and the stable numeric codes it maps to.

use std::fmt;
use std::path::PathBuf;

use headproto::{AckStatus, ChannelId, TransportError};

use crate::correlator::OperationKind;
use crate::session::SessionState;

/// Stable numeric error codes exposed to foreign callers and logs
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Ok = 0,
    Connection = 1,
    UnsupportedDevice = 2,
    WrongValue = 3,
    BluetoothDisabled = 4,
    AdapterNotFound = 5,
    AdapterOutOfIndex = 6,
    UpdateFileNotFound = 7,
    UpdateInitiatedUnsuccessfully = 8,
    UpdateFailedDeviceDisconnected = 9,
    AnnotationUnavailableCalibrating = 10,
    NoDevicesFound = 11,
    Unknown = 0xFF,
}

impl ErrorCode {
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.to_u8())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    // Precondition violations, returned synchronously
    #[error("{operation} is not valid while {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
    #[error("{0} is already pending")]
    AlreadyPending(OperationKind),
    #[error("{operation} cannot start while {pending} is pending")]
    Busy {
        operation: OperationKind,
        pending: OperationKind,
    },
    #[error("device information is unavailable before a successful connect")]
    Unavailable,
    #[error("no device has been connected")]
    NotConnected,
    #[error("channel {0} is not addressable")]
    InvalidChannel(ChannelId),

    // Transient device refusals
    #[error("annotation unavailable while the device is calibrating, retry in a few seconds")]
    AnnotationUnavailableCalibrating,

    // Link failures
    #[error("device disconnected")]
    Disconnected,
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("unsupported device: {0}")]
    UnsupportedDevice(String),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("device rejected {operation}: {status:?}")]
    Rejected {
        operation: OperationKind,
        status: AckStatus,
    },

    // Firmware update failures
    #[error("firmware file {} could not be read: {message}", .path.display())]
    UpdateFileNotFound { path: PathBuf, message: String },
    #[error("firmware update was not accepted by the device")]
    UpdateInitiatedUnsuccessfully,
    #[error("firmware update failed: device disconnected")]
    UpdateFailedDeviceDisconnected,

    #[error("session requires a tokio runtime")]
    NoRuntime,
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl SessionError {
    /// Caller broke an ordering or argument rule; nothing was sent.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            SessionError::InvalidState { .. }
                | SessionError::AlreadyPending(_)
                | SessionError::Busy { .. }
                | SessionError::Unavailable
                | SessionError::NotConnected
                | SessionError::InvalidChannel(_)
        )
    }

    /// Retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SessionError::AnnotationUnavailableCalibrating | SessionError::Busy { .. }
        )
    }

    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            SessionError::Disconnected
                | SessionError::ConnectionFailed(_)
                | SessionError::Transport(_)
                | SessionError::UpdateFailedDeviceDisconnected
        )
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::InvalidState { .. }
            | SessionError::AlreadyPending(_)
            | SessionError::Busy { .. }
            | SessionError::InvalidChannel(_) => ErrorCode::WrongValue,
            SessionError::Unavailable | SessionError::NotConnected => ErrorCode::Connection,
            SessionError::AnnotationUnavailableCalibrating => {
                ErrorCode::AnnotationUnavailableCalibrating
            }
            SessionError::Disconnected | SessionError::ConnectionFailed(_) => ErrorCode::Connection,
            SessionError::UnsupportedDevice(_) => ErrorCode::UnsupportedDevice,
            SessionError::Transport(e) => match e {
                TransportError::NotFound(_) => ErrorCode::NoDevicesFound,
                TransportError::AdapterUnavailable(_) => ErrorCode::AdapterNotFound,
                TransportError::Closed | TransportError::Refused(_) | TransportError::Io(_) => {
                    ErrorCode::Connection
                }
            },
            SessionError::Rejected { .. } => ErrorCode::Unknown,
            SessionError::UpdateFileNotFound { .. } => ErrorCode::UpdateFileNotFound,
            SessionError::UpdateInitiatedUnsuccessfully => ErrorCode::UpdateInitiatedUnsuccessfully,
            SessionError::UpdateFailedDeviceDisconnected => {
                ErrorCode::UpdateFailedDeviceDisconnected
            }
            SessionError::NoRuntime | SessionError::Unknown(_) => ErrorCode::Unknown,
        }
    }
}
