//! Driver errors.
//!
//! Actions map these onto per-device error codes; see
//! `dal_state::actions`. Only [`HardwareError::Disconnected`] takes a device
//! out of rotation.

use std::time::Duration;

use dal_protocol::VipaStatus;

use crate::types::ResponseKind;

pub type Result<T> = std::result::Result<T, HardwareError>;

/// Failure of a driver call.
#[derive(Debug, thiserror::Error)]
pub enum HardwareError {
    /// The link to the terminal is gone; the reader task has stopped.
    #[error("Terminal {device} is not connected")]
    Disconnected { device: String },

    /// No reply arrived for a command within `after`.
    #[error("No reply within {after:?}")]
    Timeout { after: Duration },

    /// The device has no command for this capability.
    #[error("{operation} is not supported by this terminal")]
    Unsupported { operation: String },

    /// A command of this response kind is still awaiting its reply.
    #[error("Response slot busy: {kind}")]
    SlotBusy { kind: ResponseKind },

    /// Non-success SW1SW2 from the terminal.
    #[error("Device returned {status}")]
    DeviceStatus { status: VipaStatus, status_word: u16 },

    /// The call's cancellation token fired before the reply.
    #[error("Operation cancelled")]
    Cancelled,

    /// Writing to or reading from the link failed.
    #[error("Serial link failure: {message}")]
    CommunicationError { message: String },

    /// Reply decoded but a required tag is missing or malformed.
    #[error("Malformed reply: {message}")]
    InvalidData { message: String },

    /// Probe failed: port missing, identity unreadable or model not supported.
    #[error("Terminal rejected during probe: {message}")]
    InitializationFailed { message: String },

    /// The terminal answered but no usable card data came back.
    #[error("Card not read: {message}")]
    CardReadError { message: String },

    /// Frame or TLV decoding failed.
    #[error(transparent)]
    Protocol(#[from] dal_core::Error),

    /// I/O error from the port or the codec.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The task running a device call panicked or was aborted.
    #[error("Device call aborted: {0}")]
    Aborted(String),
}

impl HardwareError {
    pub fn disconnected(device: impl Into<String>) -> Self {
        Self::Disconnected {
            device: device.into(),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::Timeout { after }
    }

    pub fn unsupported(operation: impl Into<String>) -> Self {
        Self::Unsupported {
            operation: operation.into(),
        }
    }

    /// Classify a raw status word.
    pub fn device_status(status_word: u16) -> Self {
        Self::DeviceStatus {
            status: VipaStatus::from(status_word),
            status_word,
        }
    }

    pub fn communication(message: impl Into<String>) -> Self {
        Self::CommunicationError {
            message: message.into(),
        }
    }

    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }

    pub fn initialization_failed(message: impl Into<String>) -> Self {
        Self::InitializationFailed {
            message: message.into(),
        }
    }

    pub fn card_read(message: impl Into<String>) -> Self {
        Self::CardReadError {
            message: message.into(),
        }
    }

    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::Aborted(reason.into())
    }

    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Disconnected { .. })
    }
}
