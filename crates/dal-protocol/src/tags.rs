//! Tags exchanged with the terminal.
//!
//! Template tags are containers decoded recursively by the default
//! [`TlvCodec`](crate::tlv::TlvCodec). Everything else is an opaque leaf.

// ============================================================================
// Templates
// ============================================================================

/// Command/response data template.
pub const E0_TEMPLATE: &[u8] = &[0xE0];

/// Device identification template returned by reset and contactless status.
pub const E1_TEMPLATE: &[u8] = &[0xE1];

pub const E2_TEMPLATE: &[u8] = &[0xE2];

/// Card status template.
pub const E4_TEMPLATE: &[u8] = &[0xE4];

pub const E6_TEMPLATE: &[u8] = &[0xE6];

/// Terminal configuration template.
pub const EE_TEMPLATE: &[u8] = &[0xEE];

/// Reset information template.
pub const EF_TEMPLATE: &[u8] = &[0xEF];

/// All templates registered by default.
pub const TEMPLATES: &[&[u8]] = &[
    E0_TEMPLATE,
    E1_TEMPLATE,
    E2_TEMPLATE,
    E4_TEMPLATE,
    E6_TEMPLATE,
    EE_TEMPLATE,
    EF_TEMPLATE,
];

// ============================================================================
// Device Identification
// ============================================================================

pub const DEVICE_NAME: &[u8] = &[0xDF, 0x0D];
pub const SERIAL_NUMBER: &[u8] = &[0x9F, 0x1E];
pub const FIRMWARE_REVISION: &[u8] = &[0xDF, 0x7F];
pub const INITIALIZATION_STATUS: &[u8] = &[0xDF, 0xA2, 0x0E];
pub const KERNEL_INFORMATION: &[u8] = &[0xDF, 0xA2, 0x10];

// ============================================================================
// Card Data
// ============================================================================

/// Card presence/ICC status byte.
pub const CARD_STATUS: &[u8] = &[0x48];
pub const PAN: &[u8] = &[0x5A];
pub const EXPIRY_DATE: &[u8] = &[0x5F, 0x24];
pub const CVV2_PRESENT: &[u8] = &[0xDF, 0xDB, 0x05];
pub const MANUAL_ENTRY_FLAGS: &[u8] = &[0xDF, 0xA2, 0x0F];

// ============================================================================
// Display and Prompts
// ============================================================================

pub const DISPLAY_TEXT: &[u8] = &[0xDF, 0x81, 0x04];
pub const HTML_RESOURCE: &[u8] = &[0xDF, 0xAA, 0x01];
pub const HTML_KEY: &[u8] = &[0xDF, 0xAA, 0x02];
pub const HTML_VALUE: &[u8] = &[0xDF, 0xAA, 0x03];
/// Button or entry value returned by an HTML prompt.
pub const SELECTION_RESULT: &[u8] = &[0xDF, 0xA2, 0x02];

/// Whether a byte at a tag position is padding.
pub fn is_padding(byte: u8) -> bool {
    byte == 0x00 || byte == 0xFF
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_templates_are_not_padding() {
        for template in TEMPLATES {
            assert!(!is_padding(template[0]));
        }
    }

    #[test]
    fn test_leaf_tags_are_not_templates() {
        for tag in [SERIAL_NUMBER, PAN, CARD_STATUS, SELECTION_RESULT] {
            assert!(!TEMPLATES.contains(&tag));
        }
    }
}
