//! 16-bit status words returned in SW1SW2.
//!
//! Exactly one value means success. Every other value maps to a closed set
//! of conditions; values the terminal documents but this layer does not
//! distinguish fold into [`VipaStatus::Failure`]. The raw word is always kept
//! alongside the classified status.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Classified status of a terminal reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VipaStatus {
    Success,
    DeviceTimeout,
    /// Cardholder pressed cancel during an entry prompt.
    UserEntryCancelled,
    /// The running command was aborted.
    CommandCancelled,
    DeviceNotSupported,
    FileNotFound,
    DataMissing,
    BadLength,
    Failure,
}

impl VipaStatus {
    pub const SUCCESS: u16 = 0x9000;
    pub const DEVICE_TIMEOUT: u16 = 0x9F41;
    pub const COMMAND_CANCELLED: u16 = 0x9F42;
    pub const USER_ENTRY_CANCELLED: u16 = 0x9F43;
    pub const FILE_NOT_FOUND: u16 = 0x9F13;
    pub const DATA_MISSING: u16 = 0x9F22;
    pub const BAD_LENGTH: u16 = 0x6700;
    pub const DEVICE_NOT_SUPPORTED: u16 = 0x6D00;
    pub const FAILURE: u16 = 0xFFFF;

    /// Canonical status word of this condition.
    pub fn code(&self) -> u16 {
        match self {
            Self::Success => Self::SUCCESS,
            Self::DeviceTimeout => Self::DEVICE_TIMEOUT,
            Self::UserEntryCancelled => Self::USER_ENTRY_CANCELLED,
            Self::CommandCancelled => Self::COMMAND_CANCELLED,
            Self::DeviceNotSupported => Self::DEVICE_NOT_SUPPORTED,
            Self::FileNotFound => Self::FILE_NOT_FOUND,
            Self::DataMissing => Self::DATA_MISSING,
            Self::BadLength => Self::BAD_LENGTH,
            Self::Failure => Self::FAILURE,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Either kind of cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::UserEntryCancelled | Self::CommandCancelled)
    }
}

impl From<u16> for VipaStatus {
    fn from(code: u16) -> Self {
        match code {
            Self::SUCCESS => Self::Success,
            Self::DEVICE_TIMEOUT => Self::DeviceTimeout,
            Self::USER_ENTRY_CANCELLED => Self::UserEntryCancelled,
            Self::COMMAND_CANCELLED => Self::CommandCancelled,
            Self::DEVICE_NOT_SUPPORTED => Self::DeviceNotSupported,
            Self::FILE_NOT_FOUND => Self::FileNotFound,
            Self::DATA_MISSING => Self::DataMissing,
            Self::BAD_LENGTH => Self::BadLength,
            _ => Self::Failure,
        }
    }
}

impl fmt::Display for VipaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({:#06X})", self, self.code())
    }
}
