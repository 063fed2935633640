//! Request/response data model carried through a sub-workflow.
//!
//! The layer treats an inbound request as an opaque payload naming one or
//! more device actions. It only reads the action identifier, the optional
//! target device and timeout override, and writes back device responses,
//! captured data and structured errors. Business fields travel untouched in
//! [`ActionRequest::payload`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::Error;

/// Device action named by an inbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceAction {
    /// Report identity and connection state of every matching device.
    GetStatus,
    /// Abort whatever the terminal is doing and return it to idle.
    AbortCommand,
    /// Key-entered card number, expiry and CVV.
    ManualCardEntry,
    /// Wait for a card to be inserted, swiped or tapped.
    PresentCard,
    /// Read the data of a card already presented.
    GetCardData,
    /// Key-entered card number only.
    GetManualPanData,
    /// Ask the cardholder to confirm the amount.
    GetVerifyAmount,
    /// Ask the cardholder to choose credit or debit.
    GetCreditOrDebit,
    /// Online PIN entry.
    GetPin,
    /// Postal code entry.
    GetZip,
    /// Prompt until the inserted card is removed.
    RemoveCard,
    /// Show a screen on the terminal.
    DeviceUi,
    /// Let the cardholder present a card before the amount is known.
    StartPreSwipeMode,
    EndPreSwipeMode,
    /// Discard card data held from pre-swipe.
    PurgeHeldCardData,
}

impl DeviceAction {
    /// All actions in declaration order.
    pub const ALL: [DeviceAction; 15] = [
        Self::GetStatus,
        Self::AbortCommand,
        Self::ManualCardEntry,
        Self::PresentCard,
        Self::GetCardData,
        Self::GetManualPanData,
        Self::GetVerifyAmount,
        Self::GetCreditOrDebit,
        Self::GetPin,
        Self::GetZip,
        Self::RemoveCard,
        Self::DeviceUi,
        Self::StartPreSwipeMode,
        Self::EndPreSwipeMode,
        Self::PurgeHeldCardData,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GetStatus => "GetStatus",
            Self::AbortCommand => "AbortCommand",
            Self::ManualCardEntry => "ManualCardEntry",
            Self::PresentCard => "PresentCard",
            Self::GetCardData => "GetCardData",
            Self::GetManualPanData => "GetManualPanData",
            Self::GetVerifyAmount => "GetVerifyAmount",
            Self::GetCreditOrDebit => "GetCreditOrDebit",
            Self::GetPin => "GetPin",
            Self::GetZip => "GetZip",
            Self::RemoveCard => "RemoveCard",
            Self::DeviceUi => "DeviceUi",
            Self::StartPreSwipeMode => "StartPreSwipeMode",
            Self::EndPreSwipeMode => "EndPreSwipeMode",
            Self::PurgeHeldCardData => "PurgeHeldCardData",
        }
    }
}

impl fmt::Display for DeviceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeviceAction {
    type Err = Error;

    /// Parse an action name, ignoring ASCII case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|action| action.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::UnsupportedAction(s.to_string()))
    }
}

/// Event raised by a device outside the command/response flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeviceEvent {
    /// Nothing happened.
    #[default]
    None,
    /// Cardholder pressed cancel on the terminal keypad.
    CancelKeyPressed,
    /// The caller cancelled the request while the device was busy.
    RequestCancelled,
    /// A card went into the chip slot.
    CardInserted,
    /// The chip card left the slot.
    CardRemoved,
    /// A card was tapped on the contactless reader.
    ContactlessCardPresented,
    /// The link to the device dropped.
    DeviceDisconnected,
}

impl DeviceEvent {
    /// Whether the event should trigger device recovery.
    pub fn is_significant(&self) -> bool {
        !matches!(self, Self::None)
    }
}

/// An event published by a driver, tagged with the device it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEventNotice {
    pub event: DeviceEvent,
    /// Device that raised the event, when the driver knows it.
    pub serial_number: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl DeviceEventNotice {
    pub fn new(event: DeviceEvent, serial_number: Option<String>) -> Self {
        Self {
            event,
            serial_number,
            timestamp: Utc::now(),
        }
    }
}

/// Identity of a connected terminal, filled during probe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInformation {
    pub manufacturer: String,
    pub model: String,
    pub serial_number: String,
    pub firmware_version: Option<String>,
    /// Serial port the device answered on.
    pub port: Option<String>,
    /// USB vendor id, when known.
    pub vendor_identifier: Option<String>,
    /// USB product id.
    pub product_identification: Option<String>,
}

impl DeviceInformation {
    pub fn new(manufacturer: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            manufacturer: manufacturer.into(),
            model: model.into(),
            ..Self::default()
        }
    }

    pub fn with_serial_number(mut self, serial: impl Into<String>) -> Self {
        self.serial_number = serial.into();
        self
    }

    pub fn with_firmware_version(mut self, version: impl Into<String>) -> Self {
        self.firmware_version = Some(version.into());
        self
    }

    pub fn with_port(mut self, port: impl Into<String>) -> Self {
        self.port = Some(port.into());
        self
    }

    pub fn with_vendor(
        mut self,
        vendor_identifier: impl Into<String>,
        product_identification: impl Into<String>,
    ) -> Self {
        self.vendor_identifier = Some(vendor_identifier.into());
        self.product_identification = Some(product_identification.into());
        self
    }

    /// Whether this device satisfies the identifier. Empty identifier fields
    /// match anything; serial numbers compare exactly, the rest ignore case.
    pub fn matches(&self, identifier: &DeviceIdentifier) -> bool {
        let matches_text = |want: &Option<String>, have: &str| {
            want.as_deref()
                .is_none_or(|w| w.is_empty() || w.eq_ignore_ascii_case(have))
        };
        identifier
            .serial_number
            .as_deref()
            .is_none_or(|s| s.is_empty() || s == self.serial_number)
            && matches_text(&identifier.manufacturer, &self.manufacturer)
            && matches_text(&identifier.model, &self.model)
    }

    /// Response entry describing this device.
    pub fn to_response(&self) -> DeviceResponse {
        DeviceResponse {
            manufacturer: Some(self.manufacturer.clone()),
            model: Some(self.model.clone()),
            serial_number: Some(self.serial_number.clone()),
            firmware_version: self.firmware_version.clone(),
            port: self.port.clone(),
            errors: Vec::new(),
        }
    }
}

/// Selects a target device. All fields are optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentifier {
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub serial_number: Option<String>,
}

impl DeviceIdentifier {
    pub fn by_serial(serial: impl Into<String>) -> Self {
        Self {
            serial_number: Some(serial.into()),
            ..Self::default()
        }
    }
}

/// Error codes written into responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceErrorCode {
    /// No connected device matches the request.
    DeviceNotFound,
    /// The device is still serving another command.
    DeviceBusy,
    /// The device call did not finish within its timeout.
    Timeout,
    /// The caller or the cardholder cancelled the call.
    CancelRequested,
    /// The card could not be read.
    CardNotRead,
    /// No held card data to act on. Serialized with spaces.
    PaymentNotFound,
    /// The device or the layer does not implement the action.
    UnsupportedAction,
    /// Any other device or link fault.
    DeviceFailure,
    /// Recovery after a failed step did not bring the device back.
    RecoveryFailed,
}

impl DeviceErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeviceNotFound => "DeviceNotFound",
            Self::DeviceBusy => "DeviceBusy",
            Self::Timeout => "Timeout",
            Self::CancelRequested => "CancelRequested",
            Self::CardNotRead => "CardNotRead",
            Self::PaymentNotFound => "Payment Not Found",
            Self::UnsupportedAction => "UnsupportedAction",
            Self::DeviceFailure => "DeviceFailure",
            Self::RecoveryFailed => "RecoveryFailed",
        }
    }
}

impl fmt::Display for DeviceErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error attached to a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceErrorValue {
    pub code: DeviceErrorCode,
    pub description: String,
    /// Serial number of the device the error belongs to, when known.
    pub serial_number: Option<String>,
}

impl DeviceErrorValue {
    pub fn new(code: DeviceErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            serial_number: None,
        }
    }

    pub fn for_device(mut self, serial: impl Into<String>) -> Self {
        self.serial_number = Some(serial.into());
        self
    }
}

/// Per-device section of an action response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceResponse {
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub serial_number: Option<String>,
    pub firmware_version: Option<String>,
    pub port: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<DeviceErrorValue>,
}

/// How the card data was captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CardEntryMode {
    /// Keyed on the terminal keypad.
    Manual,
    /// Read from the EMV chip.
    Chip,
    /// Read from the magnetic stripe.
    Swipe,
    /// Read over NFC.
    Contactless,
}

/// Card data captured by the device. Only the masked PAN leaves the layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedCardData {
    pub entry_mode: CardEntryMode,
    /// First six and last four digits, the rest masked.
    pub masked_pan: Option<String>,
    /// YYMM, as stored on the card.
    pub expiry: Option<String>,
    /// A CVV was keyed; its value is never kept.
    pub cvv_captured: bool,
}

/// Free-form result of a UI prompt (amount confirmation, selection, entry).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptResult {
    pub status: Option<String>,
    pub value: Option<String>,
}

impl PromptResult {
    pub fn new(status: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            status: Some(status.into()),
            value: Some(value.into()),
        }
    }
}

/// One action named by an inbound request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub action: Option<DeviceAction>,
    #[serde(default)]
    pub device_identifier: Option<DeviceIdentifier>,
    /// Overrides the configured timeout for this action.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// Business payload, carried without interpretation.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl ActionRequest {
    pub fn new(action: DeviceAction) -> Self {
        Self {
            action: Some(action),
            ..Self::default()
        }
    }

    pub fn with_device(mut self, identifier: DeviceIdentifier) -> Self {
        self.device_identifier = Some(identifier);
        self
    }

    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }
}

/// Result of one action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResponse {
    pub action: Option<DeviceAction>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<DeviceResponse>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<DeviceErrorValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card_data: Option<CapturedCardData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<PromptResult>,
}

/// Inbound request plus the responses produced for it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DalRequest {
    /// Set during preprocessing when the caller left it empty.
    pub message_id: Option<String>,
    pub actions: Vec<ActionRequest>,
    #[serde(default)]
    pub responses: Vec<ActionResponse>,
}

impl DalRequest {
    /// Request naming a single action.
    pub fn for_action(action: DeviceAction) -> Self {
        Self {
            message_id: None,
            actions: vec![ActionRequest::new(action)],
            responses: Vec::new(),
        }
    }

    pub fn first_action(&self) -> Option<&ActionRequest> {
        self.actions.first()
    }

    pub fn device_identifier(&self) -> Option<&DeviceIdentifier> {
        self.first_action()
            .and_then(|a| a.device_identifier.as_ref())
    }

    /// Response of the first action, created on demand.
    pub fn primary_response_mut(&mut self) -> &mut ActionResponse {
        if self.responses.is_empty() {
            let action = self.first_action().and_then(|a| a.action);
            self.responses.push(ActionResponse {
                action,
                ..ActionResponse::default()
            });
        }
        &mut self.responses[0]
    }

    pub fn primary_response(&self) -> Option<&ActionResponse> {
        self.responses.first()
    }

    /// Attach an error to the primary response and to the matching device
    /// entry, creating the entry if the device has none yet.
    pub fn attach_device_error(&mut self, serial: &str, error: DeviceErrorValue) {
        let error = error.for_device(serial);
        let response = self.primary_response_mut();
        match response
            .devices
            .iter_mut()
            .find(|d| d.serial_number.as_deref() == Some(serial))
        {
            Some(device) => device.errors.push(error.clone()),
            None => response.devices.push(DeviceResponse {
                serial_number: Some(serial.to_string()),
                errors: vec![error.clone()],
                ..DeviceResponse::default()
            }),
        }
        response.errors.push(error);
    }

    /// Attach an error that is not tied to a particular device.
    pub fn attach_error(&mut self, error: DeviceErrorValue) {
        self.primary_response_mut().errors.push(error);
    }

    pub fn has_errors(&self) -> bool {
        self.responses.iter().any(|r| !r.errors.is_empty())
    }

    pub fn errors(&self) -> impl Iterator<Item = &DeviceErrorValue> {
        self.responses.iter().flat_map(|r| r.errors.iter())
    }
}

/// Header of a state envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeHeader {
    pub correlation_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl Default for EnvelopeHeader {
    fn default() -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            created_at: Utc::now(),
        }
    }
}

/// Header plus request, carried across every action of one sub-workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateEnvelope {
    pub header: EnvelopeHeader,
    pub request: DalRequest,
}

impl StateEnvelope {
    pub fn new(request: DalRequest) -> Self {
        Self {
            header: EnvelopeHeader::default(),
            request,
        }
    }
}
