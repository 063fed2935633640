//! Common types for device drivers.

use std::fmt;

use serde::{Deserialize, Serialize};

use dal_core::DeviceAction;

/// Driver family of a connected terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    Verifone,
    Simulator,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Verifone => write!(f, "Verifone"),
            Self::Simulator => write!(f, "Simulator"),
        }
    }
}

/// Response slot a command subscribes before it is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseKind {
    /// Reply data is a TLV tree.
    Tagged,
    /// Reply data is passed through unparsed.
    Raw,
    /// TLV reply from the contactless reader node.
    Contactless,
}

impl ResponseKind {
    pub const ALL: [ResponseKind; 3] = [Self::Tagged, Self::Raw, Self::Contactless];
}

impl fmt::Display for ResponseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tagged => write!(f, "tagged"),
            Self::Raw => write!(f, "raw"),
            Self::Contactless => write!(f, "contactless"),
        }
    }
}

/// Capability operations, used for logging and simulator scripting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceOperation {
    Probe,
    GetStatus,
    AbortCommand,
    ManualCardEntry,
    PresentCard,
    GetCardData,
    GetManualPanData,
    GetVerifyAmount,
    GetCreditOrDebit,
    GetPin,
    GetZip,
    RemoveCard,
    DeviceUi,
    DeviceRecovery,
    DeviceSetIdle,
    StartPreSwipeMode,
    EndPreSwipeMode,
    PurgeHeldCardData,
}

impl From<DeviceAction> for DeviceOperation {
    fn from(action: DeviceAction) -> Self {
        match action {
            DeviceAction::GetStatus => Self::GetStatus,
            DeviceAction::AbortCommand => Self::AbortCommand,
            DeviceAction::ManualCardEntry => Self::ManualCardEntry,
            DeviceAction::PresentCard => Self::PresentCard,
            DeviceAction::GetCardData => Self::GetCardData,
            DeviceAction::GetManualPanData => Self::GetManualPanData,
            DeviceAction::GetVerifyAmount => Self::GetVerifyAmount,
            DeviceAction::GetCreditOrDebit => Self::GetCreditOrDebit,
            DeviceAction::GetPin => Self::GetPin,
            DeviceAction::GetZip => Self::GetZip,
            DeviceAction::RemoveCard => Self::RemoveCard,
            DeviceAction::DeviceUi => Self::DeviceUi,
            DeviceAction::StartPreSwipeMode => Self::StartPreSwipeMode,
            DeviceAction::EndPreSwipeMode => Self::EndPreSwipeMode,
            DeviceAction::PurgeHeldCardData => Self::PurgeHeldCardData,
        }
    }
}

impl fmt::Display for DeviceOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Card presence reported by the terminal's card status command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CardPresence {
    Absent,
    /// Chip card seated in the reader.
    Inserted,
    /// Magnetic stripe data captured.
    Swiped,
}

impl CardPresence {
    /// Decode the two status bytes (ICC, MSR).
    pub fn from_status_bytes(bytes: &[u8]) -> Self {
        match bytes {
            [icc, ..] if *icc == 0x01 => Self::Inserted,
            [_, msr, ..] if *msr == 0x01 => Self::Swiped,
            _ => Self::Absent,
        }
    }
}

/// Mask a PAN to its first six and last four digits.
pub fn mask_pan(pan: &str) -> String {
    let digits: Vec<char> = pan.chars().filter(char::is_ascii_digit).collect();
    if digits.len() <= 10 {
        return "*".repeat(digits.len());
    }
    let head: String = digits[..6].iter().collect();
    let tail: String = digits[digits.len() - 4..].iter().collect();
    format!("{head}{}{tail}", "*".repeat(digits.len() - 10))
}
