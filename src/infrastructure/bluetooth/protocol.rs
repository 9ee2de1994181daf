//! GATT Protocol Constants
//!
//! Well-known UUIDs, descriptor payloads and identifier parsing.

use crate::domain::error::{GattError, Result};
use uuid::Uuid;

/// Default target service (ESP32 sample firmware)
pub const DEFAULT_SERVICE_UUID: &str = "4fafc201-1fb5-459e-8fcc-c5c9c331914b";

/// Default target characteristic inside [`DEFAULT_SERVICE_UUID`]
pub const DEFAULT_CHARACTERISTIC_UUID: &str = "beb5483e-36e1-4688-b7f5-ea07361b26a8";

pub const DEFAULT_SERVICE: Uuid = Uuid::from_u128(0x4fafc201_1fb5_459e_8fcc_c5c9c331914b);
pub const DEFAULT_CHARACTERISTIC: Uuid = Uuid::from_u128(0xbeb5483e_36e1_4688_b7f5_ea07361b26a8);

/// Client Characteristic Configuration Descriptor
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// CCCD payloads (little-endian 16-bit flags)
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];
pub const ENABLE_BOTH_VALUE: [u8; 2] = [0x03, 0x00];

/// Characteristic property bits as defined by the Core specification
pub mod properties {
    pub const READ: u8 = 0x02;
    pub const WRITE: u8 = 0x08;
    pub const NOTIFY: u8 = 0x10;
    pub const INDICATE: u8 = 0x20;
}

/// Parse a UUID in canonical `xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx` form.
///
/// Hex digits are accepted in either case; braced, URN and un-hyphenated
/// forms are rejected.
pub fn parse_uuid(uuid_str: &str) -> Result<Uuid> {
    let trimmed = uuid_str.trim();
    let canonical = trimmed.len() == 36
        && trimmed
            .char_indices()
            .all(|(i, c)| match i {
                8 | 13 | 18 | 23 => c == '-',
                _ => c.is_ascii_hexdigit(),
            });

    if !canonical {
        return Err(GattError::InvalidUuid(uuid_str.to_string()));
    }

    Uuid::try_parse(trimmed).map_err(|_| GattError::InvalidUuid(uuid_str.to_string()))
}

/// Normalise a `AA:BB:CC:DD:EE:FF` peripheral address to upper case.
pub fn parse_address(address: &str) -> Result<String> {
    let trimmed = address.trim();
    let parts: Vec<&str> = trimmed.split(':').collect();
    let valid = parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()));

    if !valid {
        return Err(GattError::InvalidAddress(address.to_string()));
    }
    Ok(trimmed.to_ascii_uppercase())
}

/// Pack a textual address into the 48-bit integer form some stacks use
pub fn address_to_u64(address: &str) -> Result<u64> {
    let normalized = parse_address(address)?;
    let hex: String = normalized.split(':').collect();
    u64::from_str_radix(&hex, 16).map_err(|_| GattError::InvalidAddress(address.to_string()))
}

/// Format a 48-bit integer address as `AA:BB:CC:DD:EE:FF`
pub fn format_address(address: u64) -> String {
    let bytes = address.to_be_bytes();
    bytes[2..]
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uuid_is_case_insensitive() {
        let lower = parse_uuid(DEFAULT_SERVICE_UUID).unwrap();
        let upper = parse_uuid(&DEFAULT_SERVICE_UUID.to_uppercase()).unwrap();
        assert_eq!(lower, upper);
    }

    #[test]
    fn test_parse_uuid_rejects_non_canonical() {
        assert!(parse_uuid("4fafc2011fb5459e8fccc5c9c331914b").is_err());
        assert!(parse_uuid("{4fafc201-1fb5-459e-8fcc-c5c9c331914b}").is_err());
        assert!(parse_uuid("4fafc201-1fb5-459e-8fcc-c5c9c331914g").is_err());
    }

    #[test]
    fn test_default_target_constants_match_text() {
        assert_eq!(parse_uuid(DEFAULT_SERVICE_UUID).unwrap(), DEFAULT_SERVICE);
        assert_eq!(
            parse_uuid(DEFAULT_CHARACTERISTIC_UUID).unwrap(),
            DEFAULT_CHARACTERISTIC
        );
    }

    #[test]
    fn test_cccd_uuid() {
        assert_eq!(
            CCCD_UUID,
            parse_uuid("00002902-0000-1000-8000-00805F9B34FB").unwrap()
        );
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(
            parse_address("aa:bb:cc:dd:ee:ff").unwrap(),
            "AA:BB:CC:DD:EE:FF"
        );
        assert!(parse_address("AA:BB:CC:DD:EE").is_err());
        assert!(parse_address("AA-BB-CC-DD-EE-FF").is_err());
    }

    #[test]
    fn test_address_u64_conversion() {
        let raw = address_to_u64("94:A9:90:48:02:FA").unwrap();
        assert_eq!(raw, 0x94A9_9048_02FA);
        assert_eq!(format_address(raw), "94:A9:90:48:02:FA");
    }
}
