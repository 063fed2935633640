//! Terminal command op-codes and parameter values.
//!
//! An op-code is the APDU class and instruction pair (`CLA INS`). Parameter
//! bytes `P1`/`P2` select variants of a command; the enums and flag sets in
//! this module name the values this layer sends.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Commands sent to the terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VipaCommandType {
    /// `D0 00` reset device, returns identification.
    ResetDevice,
    /// `D0 FF` abort the running command.
    Abort,
    /// `D0 60` card status (ICC presence).
    CardStatus,
    /// `D0 61` keyboard status reporting on/off.
    KeyboardStatus,
    /// `D2 01` display a predefined or custom message.
    DisplayMessage,
    /// `D2 14` keyed PAN entry.
    ManualPanEntry,
    /// `D2 E0` display an HTML prompt and return the selection.
    DisplayHtml,
    /// `C0 00` contactless reader status.
    GetContactlessStatus,
    /// `C0 02` close the contactless reader.
    CloseContactlessReader,
    /// `C0 0A` hold swiped card data for a later transaction.
    StartPreSwipe,
    /// `C0 0B` leave pre-swipe mode.
    EndPreSwipe,
    /// `C0 0C` discard held card data.
    PurgeHeldCardData,
    /// `C4 11` security configuration.
    GetSecurityConfiguration,
    /// `DE 01` EMV configuration hash values.
    GetEmvHashValues,
}

impl VipaCommandType {
    pub const ALL: [VipaCommandType; 14] = [
        Self::ResetDevice,
        Self::Abort,
        Self::CardStatus,
        Self::KeyboardStatus,
        Self::DisplayMessage,
        Self::ManualPanEntry,
        Self::DisplayHtml,
        Self::GetContactlessStatus,
        Self::CloseContactlessReader,
        Self::StartPreSwipe,
        Self::EndPreSwipe,
        Self::PurgeHeldCardData,
        Self::GetSecurityConfiguration,
        Self::GetEmvHashValues,
    ];

    /// `(CLA, INS)` pair.
    pub fn class_and_instruction(&self) -> (u8, u8) {
        match self {
            Self::ResetDevice => (0xD0, 0x00),
            Self::Abort => (0xD0, 0xFF),
            Self::CardStatus => (0xD0, 0x60),
            Self::KeyboardStatus => (0xD0, 0x61),
            Self::DisplayMessage => (0xD2, 0x01),
            Self::ManualPanEntry => (0xD2, 0x14),
            Self::DisplayHtml => (0xD2, 0xE0),
            Self::GetContactlessStatus => (0xC0, 0x00),
            Self::CloseContactlessReader => (0xC0, 0x02),
            Self::StartPreSwipe => (0xC0, 0x0A),
            Self::EndPreSwipe => (0xC0, 0x0B),
            Self::PurgeHeldCardData => (0xC0, 0x0C),
            Self::GetSecurityConfiguration => (0xC4, 0x11),
            Self::GetEmvHashValues => (0xDE, 0x01),
        }
    }

    /// Op-code as a big-endian `u16` (`CLA << 8 | INS`).
    pub fn opcode(&self) -> u16 {
        let (cla, ins) = self.class_and_instruction();
        u16::from_be_bytes([cla, ins])
    }

    pub fn from_opcode(opcode: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.opcode() == opcode)
    }
}

impl fmt::Display for VipaCommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} [{:04X}]", self, self.opcode())
    }
}

/// Predefined messages for `DisplayMessage` (sent in P1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DisplayMessage {
    Custom = 0x00,
    Idle = 0x01,
    ProcessingTransaction = 0x02,
    Authorising = 0x03,
    RequestRejected = 0x04,
    InsertCardWithBeeps = 0x0D,
    RemoveCardWithBeeps = 0x0E,
    Processing = 0x0F,
}

impl DisplayMessage {
    pub fn as_byte(&self) -> u8 {
        *self as u8
    }
}

/// Backlight control for `DisplayMessage` (sent in P2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Backlight {
    Unchanged = 0x00,
    On = 0x01,
    Off = 0x02,
}

/// Bit flags for `ResetDevice` P1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResetFlags(u8);

impl ResetFlags {
    pub const NONE: Self = Self(0x00);
    pub const RETURN_SERIAL_NUMBER: Self = Self(0x01);
    pub const LEAVE_SCREEN_UNCHANGED: Self = Self(0x02);
    pub const SLIDE_SHOW_NORMAL_TIMING: Self = Self(0x04);
    pub const NO_BEEP: Self = Self(0x08);
    pub const RESET_IMMEDIATELY: Self = Self(0x10);
    pub const RETURN_PINPAD_CONFIGURATION: Self = Self(0x20);
    pub const ADD_COMPONENT_INFORMATION: Self = Self(0x40);

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for ResetFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Fields requested from a keyed PAN entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ManualEntryFlags(u8);

impl ManualEntryFlags {
    pub const PAN: Self = Self(0x01);
    pub const EXPIRY: Self = Self(0x02);
    pub const APPLICATION_EXPIRY: Self = Self(0x04);
    pub const CVV2: Self = Self(0x08);

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for ManualEntryFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}
