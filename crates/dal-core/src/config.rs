//! Configuration tree for the device abstraction layer.
//!
//! Every section has a `Default` built from [`constants`](crate::constants),
//! so a configuration file only needs to name the values it changes.
//!
//! # Examples
//!
//! ```
//! use dal_core::DalConfig;
//!
//! let config = DalConfig::from_json_str(r#"{ "timeouts": { "get_status_ms": 2500 } }"#)?;
//! assert_eq!(config.timeouts.get_status_ms, 2500);
//! assert_eq!(config.manager.health_check_interval_ms, 5_000);
//! # Ok::<(), dal_core::Error>(())
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::{Error, Result};
use crate::types::DeviceAction;

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DalConfig {
    pub timeouts: TimeoutConfig,
    pub manager: ManagerConfig,
    pub serial: SerialConfig,
    pub verifone: VerifoneConfig,
    pub simulator: SimulatorConfig,
}

impl DalConfig {
    /// Parse and validate a JSON document.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` for malformed JSON and `Error::Config`
    /// when a value fails validation.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the file cannot be read, otherwise the errors
    /// of [`DalConfig::from_json_str`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Check invariants that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.manager.health_check_interval_ms == 0 {
            return Err(Error::Config(
                "manager.health_check_interval_ms must be greater than zero".into(),
            ));
        }
        if self.serial.baud_rate == 0 {
            return Err(Error::Config("serial.baud_rate must be greater than zero".into()));
        }
        self.timeouts.validate()
    }
}

/// Broker timeouts per action, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub default_device_result_ms: u64,
    pub get_status_ms: u64,
    pub abort_command_ms: u64,
    pub manual_card_entry_ms: u64,
    pub present_card_ms: u64,
    pub get_card_data_ms: u64,
    pub get_manual_pan_ms: u64,
    pub get_verify_amount_ms: u64,
    pub get_credit_or_debit_ms: u64,
    pub get_pin_ms: u64,
    pub get_zip_ms: u64,
    pub remove_card_ms: u64,
    pub device_ui_ms: u64,
    pub device_recovery_ms: u64,
    pub device_set_idle_ms: u64,
    pub pre_swipe_mode_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default_device_result_ms: DEFAULT_DEVICE_RESULT_TIMEOUT_MS,
            get_status_ms: GET_STATUS_TIMEOUT_MS,
            abort_command_ms: ABORT_COMMAND_TIMEOUT_MS,
            manual_card_entry_ms: MANUAL_CARD_ENTRY_TIMEOUT_MS,
            present_card_ms: PRESENT_CARD_TIMEOUT_MS,
            get_card_data_ms: GET_CARD_DATA_TIMEOUT_MS,
            get_manual_pan_ms: GET_MANUAL_PAN_TIMEOUT_MS,
            get_verify_amount_ms: GET_VERIFY_AMOUNT_TIMEOUT_MS,
            get_credit_or_debit_ms: GET_CREDIT_OR_DEBIT_TIMEOUT_MS,
            get_pin_ms: GET_PIN_TIMEOUT_MS,
            get_zip_ms: GET_ZIP_TIMEOUT_MS,
            remove_card_ms: REMOVE_CARD_TIMEOUT_MS,
            device_ui_ms: DEVICE_UI_TIMEOUT_MS,
            device_recovery_ms: DEVICE_RECOVERY_TIMEOUT_MS,
            device_set_idle_ms: DEVICE_SET_IDLE_TIMEOUT_MS,
            pre_swipe_mode_ms: PRE_SWIPE_MODE_TIMEOUT_MS,
        }
    }
}

impl TimeoutConfig {
    /// Timeout the broker applies to the device call behind `action`.
    pub fn for_action(&self, action: DeviceAction) -> Duration {
        let ms = match action {
            DeviceAction::GetStatus => self.get_status_ms,
            DeviceAction::AbortCommand => self.abort_command_ms,
            DeviceAction::ManualCardEntry => self.manual_card_entry_ms,
            DeviceAction::PresentCard => self.present_card_ms,
            DeviceAction::GetCardData => self.get_card_data_ms,
            DeviceAction::GetManualPanData => self.get_manual_pan_ms,
            DeviceAction::GetVerifyAmount => self.get_verify_amount_ms,
            DeviceAction::GetCreditOrDebit => self.get_credit_or_debit_ms,
            DeviceAction::GetPin => self.get_pin_ms,
            DeviceAction::GetZip => self.get_zip_ms,
            DeviceAction::RemoveCard => self.remove_card_ms,
            DeviceAction::DeviceUi => self.device_ui_ms,
            DeviceAction::StartPreSwipeMode
            | DeviceAction::EndPreSwipeMode
            | DeviceAction::PurgeHeldCardData => self.pre_swipe_mode_ms,
        };
        Duration::from_millis(ms)
    }

    /// Configured timeout, replaced by a non-zero per-request override.
    pub fn resolve(&self, action: DeviceAction, override_seconds: Option<u64>) -> Duration {
        match override_seconds {
            Some(seconds) if seconds > 0 => Duration::from_secs(seconds),
            _ => self.for_action(action),
        }
    }

    pub fn recovery(&self) -> Duration {
        Duration::from_millis(self.device_recovery_ms)
    }

    pub fn set_idle(&self) -> Duration {
        Duration::from_millis(self.device_set_idle_ms)
    }

    pub fn device_result(&self) -> Duration {
        Duration::from_millis(self.default_device_result_ms)
    }

    fn validate(&self) -> Result<()> {
        let fields = [
            ("default_device_result_ms", self.default_device_result_ms),
            ("get_status_ms", self.get_status_ms),
            ("abort_command_ms", self.abort_command_ms),
            ("manual_card_entry_ms", self.manual_card_entry_ms),
            ("present_card_ms", self.present_card_ms),
            ("get_card_data_ms", self.get_card_data_ms),
            ("get_manual_pan_ms", self.get_manual_pan_ms),
            ("get_verify_amount_ms", self.get_verify_amount_ms),
            ("get_credit_or_debit_ms", self.get_credit_or_debit_ms),
            ("get_pin_ms", self.get_pin_ms),
            ("get_zip_ms", self.get_zip_ms),
            ("remove_card_ms", self.remove_card_ms),
            ("device_ui_ms", self.device_ui_ms),
            ("device_recovery_ms", self.device_recovery_ms),
            ("device_set_idle_ms", self.device_set_idle_ms),
            ("pre_swipe_mode_ms", self.pre_swipe_mode_ms),
        ];
        match fields.iter().find(|(_, value)| *value == 0) {
            Some((name, _)) => Err(Error::Config(format!(
                "timeouts.{name} must be greater than zero"
            ))),
            None => Ok(()),
        }
    }
}

/// Workflow manager scheduling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub health_check_interval_ms: u64,
    pub drain_grace_ms: u64,
    pub cancel_retries: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            health_check_interval_ms: HEALTH_CHECK_INTERVAL_MS,
            drain_grace_ms: BROKER_DRAIN_GRACE_MS,
            cancel_retries: DEFAULT_CANCEL_RETRIES,
        }
    }
}

impl ManagerConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }
}

/// Serial transport settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub port_name: Option<String>,
    pub baud_rate: u32,
    pub node_address: u8,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: None,
            baud_rate: 115_200,
            node_address: DEFAULT_NODE_ADDRESS,
        }
    }
}

/// Verifone terminal settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifoneConfig {
    /// Position of Verifone devices when several kinds are discovered.
    pub sort_order: i32,
    /// Models accepted at probe, compared case-insensitively.
    pub supported_devices: Vec<String>,
}

impl Default for VerifoneConfig {
    fn default() -> Self {
        Self {
            sort_order: 0,
            supported_devices: vec!["P200".into(), "P400".into(), "M400".into(), "UX300".into()],
        }
    }
}

impl VerifoneConfig {
    pub fn supports_model(&self, model: &str) -> bool {
        self.supported_devices
            .iter()
            .any(|m| m.eq_ignore_ascii_case(model))
    }
}

/// Simulated terminal identity and behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    pub sort_order: i32,
    pub model: String,
    pub serial_number: String,
    pub port: String,
    pub firmware_version: String,
    pub response_delay_ms: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            sort_order: 99,
            model: SIMULATOR_MODEL.into(),
            serial_number: SIMULATOR_SERIAL_NUMBER.into(),
            port: SIMULATOR_PORT.into(),
            firmware_version: SIMULATOR_FIRMWARE.into(),
            response_delay_ms: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_empty_document_yields_defaults() {
        let config = DalConfig::from_json_str("{}").unwrap();
        assert_eq!(config, DalConfig::default());
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config =
            DalConfig::from_json_str(r#"{ "verifone": { "sort_order": 3 } }"#).unwrap();
        assert_eq!(config.verifone.sort_order, 3);
        assert!(config.verifone.supports_model("p400"));
        assert_eq!(config.simulator.serial_number, SIMULATOR_SERIAL_NUMBER);
    }

    #[test]
    fn test_verifone_section_carries_only_driver_settings() {
        let json = serde_json::to_value(VerifoneConfig::default()).unwrap();
        let mut keys: Vec<_> = json.as_object().unwrap().keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, vec!["sort_order", "supported_devices"]);
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        let err = DalConfig::from_json_str(r#"{ "timeouts": { "get_pin_ms": 0 } }"#).unwrap_err();
        assert!(err.to_string().contains("timeouts.get_pin_ms"));
    }

    #[test]
    fn test_zero_health_interval_is_rejected() {
        let err =
            DalConfig::from_json_str(r#"{ "manager": { "health_check_interval_ms": 0 } }"#)
                .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_malformed_json_is_serialization_error() {
        let err = DalConfig::from_json_str("{ timeouts").unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[rstest]
    #[case(None, 10_000)]
    #[case(Some(0), 10_000)]
    #[case(Some(3), 3_000)]
    fn test_timeout_override(#[case] override_seconds: Option<u64>, #[case] expected_ms: u64) {
        let timeouts = TimeoutConfig::default();
        assert_eq!(
            timeouts.resolve(DeviceAction::GetStatus, override_seconds),
            Duration::from_millis(expected_ms)
        );
    }

    #[test]
    fn test_pre_swipe_actions_share_timeout() {
        let timeouts = TimeoutConfig::default();
        assert_eq!(
            timeouts.for_action(DeviceAction::PurgeHeldCardData),
            timeouts.for_action(DeviceAction::StartPreSwipeMode)
        );
    }

    #[test]
    fn test_load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dal.json");
        std::fs::write(&path, r#"{ "serial": { "port_name": "/dev/ttyACM0" } }"#).unwrap();

        let config = DalConfig::load(&path).unwrap();
        assert_eq!(config.serial.port_name.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(config.serial.baud_rate, 115_200);
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = DalConfig::load(dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
