use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    // Protocol errors
    #[error("Malformed TLV at offset {offset}: {reason}")]
    MalformedTlv { offset: usize, reason: String },

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Frame too large: {size} bytes exceeds maximum of {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    #[error("Missing required field: {0}")]
    MissingField(String),

    // Device errors
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device connection failed: {0}")]
    ConnectionFailed(String),

    // Workflow errors
    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("No transition declared for state {state}")]
    UndeclaredTransition { state: String },

    #[error("Workflow state envelope is missing")]
    MissingStateEnvelope,

    #[error("Unsupported action: {0}")]
    UnsupportedAction(String),

    #[error("Workflow manager is not running")]
    ManagerStopped,

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a malformed TLV error at the given byte offset.
    pub fn malformed_tlv(offset: usize, reason: impl Into<String>) -> Self {
        Self::MalformedTlv {
            offset,
            reason: reason.into(),
        }
    }

    /// Whether this error is a local decode fault that callers may treat as
    /// "no data" instead of propagating.
    pub fn is_decode_fault(&self) -> bool {
        matches!(
            self,
            Self::MalformedTlv { .. } | Self::InvalidFrame(_) | Self::ChecksumMismatch { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_tlv_display() {
        let error = Error::malformed_tlv(7, "length runs past buffer");
        assert_eq!(
            error.to_string(),
            "Malformed TLV at offset 7: length runs past buffer"
        );
        assert!(error.is_decode_fault());
    }

    #[test]
    fn test_checksum_display_uses_hex() {
        let error = Error::ChecksumMismatch {
            expected: 0x1a,
            actual: 0x02,
        };
        assert_eq!(error.to_string(), "Checksum mismatch: expected 0x1a, got 0x02");
    }

    #[test]
    fn test_workflow_errors_are_not_decode_faults() {
        assert!(!Error::MissingStateEnvelope.is_decode_fault());
        assert!(
            !Error::UndeclaredTransition {
                state: "Undefined".into()
            }
            .is_decode_fault()
        );
    }
}
