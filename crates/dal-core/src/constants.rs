//! Protocol, timeout and scheduling constants.
//!
//! This module centralizes the values shared by the protocol engine, the
//! device drivers and the workflow layer. Timeouts are expressed in
//! milliseconds and serve as defaults for [`TimeoutConfig`]; a configuration
//! file or a per-action override may replace them at runtime.
//!
//! # Packet Structure
//!
//! Every exchange with a terminal travels in packets of the form:
//!
//! ```text
//! NAD | PCB | LEN | INF ... | LRC
//! ```
//!
//! Where:
//! - `NAD` - Node address (terminal or contactless reader)
//! - `PCB` - Protocol control byte, bit 0 set on chained packets
//! - `LEN` - Length of INF (one byte, or `0xFF` plus a big-endian `u16`)
//! - `INF` - Command APDU or response data followed by the status word
//! - `LRC` - XOR of every preceding byte of the packet
//!
//! # Usage
//!
//! ```
//! use dal_core::constants::*;
//! use std::time::Duration;
//!
//! assert_eq!(PACKET_SIZE, 1024);
//! let timeout = Duration::from_millis(DEFAULT_DEVICE_RESULT_TIMEOUT_MS);
//! assert_eq!(timeout.as_secs(), 15);
//! ```
//!
//! [`TimeoutConfig`]: crate::config::TimeoutConfig

// ============================================================================
// Packet Framing
// ============================================================================

/// Largest command payload carried by a single packet.
///
/// Payloads above this size are split into chained packets that share the
/// same command header. The terminal reassembles them into one command.
pub const PACKET_SIZE: usize = 1024;

/// Node address of the terminal's main application.
pub const DEFAULT_NODE_ADDRESS: u8 = 0x01;

/// Node address used by the contactless reader for its replies.
pub const CONTACTLESS_NODE_ADDRESS: u8 = 0x02;

/// Protocol control byte for a standalone (or final) packet.
pub const DEFAULT_PCB: u8 = 0x00;

/// PCB bit marking a packet as chained, with more packets to follow.
pub const PCB_CHAINED: u8 = 0x01;

/// Largest INF length that fits the single-byte LEN form.
pub const MAX_SHORT_INF_LENGTH: usize = 0xFE;

/// LEN marker announcing a two-byte big-endian length.
pub const EXTENDED_LENGTH_MARKER: u8 = 0xFF;

/// Largest INF length the extended LEN form can express.
pub const MAX_INF_LENGTH: usize = u16::MAX as usize;

/// Bytes of packet overhead around INF in the short form (NAD, PCB, LEN, LRC).
pub const PACKET_OVERHEAD: usize = 4;

/// Size of the status word trailing every response INF.
pub const STATUS_WORD_LENGTH: usize = 2;

// ============================================================================
// Device Timeouts (milliseconds)
// ============================================================================

/// Default time to wait for a device result when no narrower timeout applies.
pub const DEFAULT_DEVICE_RESULT_TIMEOUT_MS: u64 = 15_000;

/// Status request against one device.
pub const GET_STATUS_TIMEOUT_MS: u64 = 10_000;

/// Abort of the command currently running on the device.
pub const ABORT_COMMAND_TIMEOUT_MS: u64 = 5_000;

/// Keyed manual card entry, including the cardholder's typing time.
pub const MANUAL_CARD_ENTRY_TIMEOUT_MS: u64 = 120_000;

/// Prompt the cardholder to present a card.
pub const PRESENT_CARD_TIMEOUT_MS: u64 = 60_000;

/// Read card data after presentation.
pub const GET_CARD_DATA_TIMEOUT_MS: u64 = 30_000;

/// Keyed PAN capture.
pub const GET_MANUAL_PAN_TIMEOUT_MS: u64 = 120_000;

/// Amount confirmation prompt.
pub const GET_VERIFY_AMOUNT_TIMEOUT_MS: u64 = 60_000;

/// Credit or debit selection prompt.
pub const GET_CREDIT_OR_DEBIT_TIMEOUT_MS: u64 = 60_000;

/// PIN entry prompt.
pub const GET_PIN_TIMEOUT_MS: u64 = 60_000;

/// ZIP code entry prompt.
pub const GET_ZIP_TIMEOUT_MS: u64 = 60_000;

/// Wait for the cardholder to remove the card.
pub const REMOVE_CARD_TIMEOUT_MS: u64 = 30_000;

/// Generic device UI screen.
pub const DEVICE_UI_TIMEOUT_MS: u64 = 30_000;

/// Device recovery issued by the sanity check.
pub const DEVICE_RECOVERY_TIMEOUT_MS: u64 = 10_000;

/// Return the device to its idle screen.
pub const DEVICE_SET_IDLE_TIMEOUT_MS: u64 = 5_000;

/// Enter or leave pre-swipe mode, or purge held card data.
pub const PRE_SWIPE_MODE_TIMEOUT_MS: u64 = 10_000;

// ============================================================================
// Scheduling
// ============================================================================

/// Interval between device health checks while the manager is idle.
pub const HEALTH_CHECK_INTERVAL_MS: u64 = 5_000;

/// Time a cancelled operation is given to wind down (set the device idle)
/// before its task is aborted.
pub const BROKER_DRAIN_GRACE_MS: u64 = 2_000;

/// Interval between card status polls while waiting for a card to be
/// presented or removed.
pub const CARD_POLL_INTERVAL_MS: u64 = 250;

/// Backoff between attempts to force-resolve stale response handlers.
pub const CANCEL_HANDLER_BACKOFF_MS: u64 = 1;

/// Default retry budget of `cancel_handlers`.
pub const DEFAULT_CANCEL_RETRIES: u32 = 1;

/// Capacity of the device event channel.
pub const DEVICE_EVENT_CHANNEL_CAPACITY: usize = 32;

/// Capacity of the workflow manager request queue.
pub const REQUEST_QUEUE_CAPACITY: usize = 16;

// ============================================================================
// Simulator Identity
// ============================================================================

/// Manufacturer reported by the simulated terminal.
pub const SIMULATOR_MANUFACTURER: &str = "Simulator";

/// Model reported by the simulated terminal.
pub const SIMULATOR_MODEL: &str = "SimCity";

/// Serial number reported by the simulated terminal.
pub const SIMULATOR_SERIAL_NUMBER: &str = "CEEEDEADBEEF";

/// Port label reported by the simulated terminal.
pub const SIMULATOR_PORT: &str = "COM3";

/// Firmware version reported by the simulated terminal.
pub const SIMULATOR_FIRMWARE: &str = "1.0.0";
