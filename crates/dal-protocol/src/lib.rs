//! Binary protocol engine for payment terminals.
//!
//! - [`tlv`]: nested tag-length-value codec
//! - [`frame`]: command framer with chaining, reply reassembly
//! - [`codec`]: tokio-util codec for the packet layer
//! - [`commands`], [`status`], [`tags`]: protocol vocabulary

pub mod codec;
pub mod commands;
pub mod frame;
pub mod status;
pub mod tags;
pub mod tlv;

pub use codec::VipaCodec;
pub use commands::{Backlight, DisplayMessage, ManualEntryFlags, ResetFlags, VipaCommandType};
pub use frame::{Packet, ResponseAssembler, VipaCommand, VipaResponse};
pub use status::VipaStatus;
pub use tlv::{Tlv, TlvCodec, TlvValue};
