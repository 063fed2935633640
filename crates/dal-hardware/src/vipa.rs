//! VIPA command layer.
//!
//! [`Vipa`] turns terminal operations into framed commands on a
//! [`VipaConnection`] and interprets the replies. Every operation first
//! reclaims the channel with `cancel_handlers`, so a call abandoned by a
//! timeout or cancellation never blocks the next one.
//!
//! Quick commands (reset, abort, display, status) are bounded by the device
//! result timeout. Commands that wait on the cardholder (manual PAN entry,
//! HTML prompts) have no timeout of their own; the caller bounds them.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tracing::{debug, info, warn};

use dal_core::constants::{CONTACTLESS_NODE_ADDRESS, DEFAULT_CANCEL_RETRIES, DEFAULT_NODE_ADDRESS};
use dal_core::{CapturedCardData, CardEntryMode, DeviceInformation};
use dal_protocol::{
    Backlight, DisplayMessage, ManualEntryFlags, ResetFlags, Tlv, TlvCodec, VipaCommand,
    VipaCommandType, VipaStatus, tags, tlv,
};

use crate::connection::{Completion, DeviceReply, VipaConnection};
use crate::error::{HardwareError, Result};
use crate::types::{CardPresence, ResponseKind, mask_pan};

/// Manufacturer reported for every VIPA terminal.
pub const MANUFACTURER: &str = "Verifone";

const HTML_ENTRY_RESOURCE: &str = "mapp/alphanumeric_entry.html";

/// Result of a manual PAN entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManualEntryReply {
    pub status: VipaStatus,
    /// Masked card data, present only on success.
    pub card: Option<CapturedCardData>,
}

/// Result of an HTML prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptReply {
    pub status: VipaStatus,
    /// Value of the selection tag, if the cardholder chose one.
    pub selection: Option<String>,
}

/// Command layer bound to one terminal connection.
#[derive(Debug)]
pub struct Vipa {
    connection: RwLock<Arc<VipaConnection>>,
    device_result_timeout: Duration,
    cancel_retries: u32,
    node_address: u8,
    codec: TlvCodec,
}

impl Vipa {
    pub fn new(connection: VipaConnection, device_result_timeout: Duration) -> Self {
        Self {
            connection: RwLock::new(Arc::new(connection)),
            device_result_timeout,
            cancel_retries: DEFAULT_CANCEL_RETRIES,
            node_address: DEFAULT_NODE_ADDRESS,
            codec: TlvCodec::new(),
        }
    }

    /// Node address for commands not aimed at the contactless reader.
    pub fn with_node_address(mut self, nad: u8) -> Self {
        self.node_address = nad;
        self
    }

    /// Attempts at reclaiming stale response handlers before each command.
    pub fn with_cancel_retries(mut self, retries: u32) -> Self {
        self.cancel_retries = retries;
        self
    }

    pub fn connection(&self) -> Arc<VipaConnection> {
        Arc::clone(&self.connection.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Swap in a freshly opened connection and close the old one.
    ///
    /// A call still running on the old connection fails with a disconnect.
    pub fn replace_connection(&self, connection: VipaConnection) {
        let old = std::mem::replace(
            &mut *self.connection.write().unwrap_or_else(PoisonError::into_inner),
            Arc::new(connection),
        );
        old.close();
    }

    pub fn is_connected(&self) -> bool {
        self.connection().is_connected()
    }

    /// Reclaim the channel, then run one exchange.
    async fn execute(
        &self,
        command: VipaCommand,
        kind: ResponseKind,
        timeout: Option<Duration>,
    ) -> Result<Completion> {
        let command = if command.nad() == DEFAULT_NODE_ADDRESS {
            command.with_nad(self.node_address)
        } else {
            command
        };
        let connection = self.connection();
        let reclaimed = connection.cancel_handlers(self.cancel_retries).await;
        if reclaimed > 0 {
            debug!(
                device = %connection.name(),
                reclaimed,
                "Reclaimed stale response handlers"
            );
        }
        connection.exchange(&command, kind, timeout).await
    }

    async fn execute_quick(&self, command: VipaCommand, kind: ResponseKind) -> Result<DeviceReply> {
        match self
            .execute(command, kind, Some(self.device_result_timeout))
            .await?
        {
            Completion::Reply(reply) => Ok(reply),
            Completion::Cancelled => Err(HardwareError::Cancelled),
        }
    }

    /// Reset the terminal and read its identification.
    ///
    /// # Errors
    ///
    /// Returns `HardwareError::DeviceStatus` for a non-success reply and
    /// `HardwareError::InvalidData` when no serial number is reported.
    pub async fn reset_device(&self, flags: ResetFlags) -> Result<DeviceInformation> {
        let command = VipaCommand::new(VipaCommandType::ResetDevice, flags.bits(), 0x00);
        let reply = self
            .execute_quick(command, ResponseKind::Tagged)
            .await?
            .ensure_success()?;

        let nodes = reply.tags();
        let serial = Tlv::find_str(nodes, tags::SERIAL_NUMBER)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| HardwareError::invalid_data("reset reply carries no serial number"))?;
        let model = Tlv::find_str(nodes, tags::DEVICE_NAME)
            .map(str::trim)
            .unwrap_or_default();

        let mut info = DeviceInformation::new(MANUFACTURER, model).with_serial_number(serial);
        if let Some(firmware) = Tlv::find_str(nodes, tags::FIRMWARE_REVISION) {
            info = info.with_firmware_version(firmware.trim());
        }
        Ok(info)
    }

    /// Abort whatever the terminal is doing.
    pub async fn abort(&self) -> Result<VipaStatus> {
        let command = VipaCommand::new(VipaCommandType::Abort, 0x00, 0x00);
        Ok(self.execute_quick(command, ResponseKind::Raw).await?.status)
    }

    /// Show a predefined message, or `custom` text with [`DisplayMessage::Custom`].
    pub async fn display_message(
        &self,
        message: DisplayMessage,
        backlight: Backlight,
        custom: Option<&str>,
    ) -> Result<VipaStatus> {
        let mut command =
            VipaCommand::new(VipaCommandType::DisplayMessage, message.as_byte(), backlight as u8);
        if let Some(text) = custom {
            command = command.with_data(
                self.codec
                    .encode(&[Tlv::leaf(tags::DISPLAY_TEXT, text.as_bytes().to_vec())]),
            );
        }
        Ok(self.execute_quick(command, ResponseKind::Tagged).await?.status)
    }

    /// Close the contactless reader; `force` closes it even mid-transaction.
    pub async fn close_contactless_reader(&self, force: bool) -> Result<VipaStatus> {
        let command = VipaCommand::new(VipaCommandType::CloseContactlessReader, u8::from(force), 0x00)
            .with_nad(CONTACTLESS_NODE_ADDRESS);
        Ok(self
            .execute_quick(command, ResponseKind::Contactless)
            .await?
            .status)
    }

    pub async fn contactless_status(&self) -> Result<DeviceReply> {
        let command = VipaCommand::new(VipaCommandType::GetContactlessStatus, 0x00, 0x00)
            .with_nad(CONTACTLESS_NODE_ADDRESS);
        self.execute_quick(command, ResponseKind::Contactless).await
    }

    /// Current card presence. A reply without a card status tag reads as absent.
    pub async fn card_status(&self) -> Result<CardPresence> {
        let command = VipaCommand::new(VipaCommandType::CardStatus, 0x00, 0x00);
        let reply = self
            .execute_quick(command, ResponseKind::Tagged)
            .await?
            .ensure_success()?;
        Ok(Tlv::find(reply.tags(), tags::CARD_STATUS)
            .and_then(Tlv::data)
            .map(|data| CardPresence::from_status_bytes(data))
            .unwrap_or(CardPresence::Absent))
    }

    /// Turn keypad event reporting on or off.
    pub async fn keyboard_status(&self, enabled: bool) -> Result<VipaStatus> {
        let command = VipaCommand::new(VipaCommandType::KeyboardStatus, u8::from(enabled), 0x00);
        Ok(self.execute_quick(command, ResponseKind::Raw).await?.status)
    }

    pub async fn start_pre_swipe(&self) -> Result<VipaStatus> {
        let command = VipaCommand::new(VipaCommandType::StartPreSwipe, 0x00, 0x00);
        Ok(self.execute_quick(command, ResponseKind::Tagged).await?.status)
    }

    pub async fn end_pre_swipe(&self) -> Result<VipaStatus> {
        let command = VipaCommand::new(VipaCommandType::EndPreSwipe, 0x00, 0x00);
        Ok(self.execute_quick(command, ResponseKind::Tagged).await?.status)
    }

    pub async fn purge_held_card_data(&self) -> Result<VipaStatus> {
        let command = VipaCommand::new(VipaCommandType::PurgeHeldCardData, 0x00, 0x00);
        Ok(self.execute_quick(command, ResponseKind::Tagged).await?.status)
    }

    /// Keyed card entry on the terminal.
    ///
    /// The PAN never leaves this function unmasked. A completion resolved by
    /// `cancel_handlers` is reported as [`VipaStatus::UserEntryCancelled`].
    pub async fn manual_pan_entry(&self, flags: ManualEntryFlags) -> Result<ManualEntryReply> {
        let mut payload = vec![
            html_pair("TEMPLATE_INPUT_TYPE", "text"),
            html_pair("allowed_chars", "0123456789"),
            html_pair("entry_mode_visibility", "hidden"),
            vec![Tlv::leaf(tags::HTML_RESOURCE, HTML_ENTRY_RESOURCE.as_bytes().to_vec())],
            html_pair("title_text", "Enter Card Number"),
        ];
        if flags.contains(ManualEntryFlags::EXPIRY) {
            payload.push(vec![Tlv::leaf(
                tags::HTML_RESOURCE,
                HTML_ENTRY_RESOURCE.as_bytes().to_vec(),
            )]);
            payload.push(html_pair("title_text", "Enter Card Expiry"));
        }
        if flags.contains(ManualEntryFlags::CVV2) {
            payload.push(vec![Tlv::leaf(
                tags::HTML_RESOURCE,
                HTML_ENTRY_RESOURCE.as_bytes().to_vec(),
            )]);
            payload.push(html_pair("title_text", "Enter Card CVV2"));
        }
        let payload: Vec<Tlv> = payload.into_iter().flatten().collect();

        let command = VipaCommand::new(VipaCommandType::ManualPanEntry, flags.bits(), 0x01)
            .with_data(self.codec.encode(&payload));

        let reply = match self.execute(command, ResponseKind::Tagged, None).await? {
            Completion::Reply(reply) => reply,
            Completion::Cancelled => {
                info!(device = %self.connection().name(), "Manual entry resolved as cancelled");
                return Ok(ManualEntryReply {
                    status: VipaStatus::UserEntryCancelled,
                    card: None,
                });
            }
        };

        if !reply.status.is_success() {
            debug!(status = %reply.status, "Manual entry ended without card data");
            return Ok(ManualEntryReply {
                status: reply.status,
                card: None,
            });
        }

        let nodes = reply.tags();
        let Some(pan) = Tlv::find(nodes, tags::PAN).and_then(Tlv::data).map(|d| digits(d)) else {
            warn!(device = %self.connection().name(), "Manual entry reply has no PAN");
            return Ok(ManualEntryReply {
                status: VipaStatus::DataMissing,
                card: None,
            });
        };
        let expiry = Tlv::find(nodes, tags::EXPIRY_DATE)
            .and_then(Tlv::data)
            .map(|d| digits(d));
        let cvv_captured = Tlv::find(nodes, tags::CVV2_PRESENT)
            .and_then(Tlv::data)
            .is_some_and(|d| d.iter().any(|b| *b != 0));

        Ok(ManualEntryReply {
            status: reply.status,
            card: Some(CapturedCardData {
                entry_mode: CardEntryMode::Manual,
                masked_pan: Some(mask_pan(&pan)),
                expiry,
                cvv_captured,
            }),
        })
    }

    /// Display an HTML page with key/value substitutions and wait for the
    /// cardholder's selection.
    pub async fn display_html(&self, resource: &str, pairs: &[(&str, &str)]) -> Result<PromptReply> {
        let mut payload = vec![Tlv::leaf(tags::HTML_RESOURCE, resource.as_bytes().to_vec())];
        for (key, value) in pairs {
            payload.extend(html_pair(key, value));
        }
        let command = VipaCommand::new(VipaCommandType::DisplayHtml, 0x00, 0x01)
            .with_data(self.codec.encode(&[Tlv::container(tags::E0_TEMPLATE, payload)]));

        match self.execute(command, ResponseKind::Tagged, None).await? {
            Completion::Reply(reply) => Ok(PromptReply {
                status: reply.status,
                selection: Tlv::find_str(reply.tags(), tags::SELECTION_RESULT).map(str::to_string),
            }),
            Completion::Cancelled => Ok(PromptReply {
                status: VipaStatus::CommandCancelled,
                selection: None,
            }),
        }
    }
}

fn html_pair(key: &str, value: &str) -> Vec<Tlv> {
    vec![
        Tlv::leaf(tags::HTML_KEY, key.as_bytes().to_vec()),
        Tlv::leaf(tags::HTML_VALUE, value.as_bytes().to_vec()),
    ]
}

/// Card digits from either ASCII or packed BCD data.
fn digits(data: &[u8]) -> String {
    match std::str::from_utf8(data) {
        Ok(text) if !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit()) => text.to_string(),
        _ => tlv::hex(data)
            .trim_end_matches(['F', 'f'])
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digits_from_ascii() {
        assert_eq!(digits(b"4111111111111111"), "4111111111111111");
    }

    #[test]
    fn test_digits_from_bcd_with_padding() {
        assert_eq!(digits(&[0x41, 0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x1F]), "411111111111111");
    }

    #[test]
    fn test_html_pair_order() {
        let pair = html_pair("amount", "10.00");
        assert_eq!(pair[0].tag(), tags::HTML_KEY);
        assert_eq!(pair[1].as_str(), Some("10.00"));
    }
}
