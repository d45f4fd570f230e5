//! The Nordic UART GATT service contract: fixed UUIDs and the
//! characteristic-property requirements a peripheral must satisfy to be
//! bridgeable.

use uuid::Uuid;

/// Service UUID `6e400001-…`.
pub const SERVICE: Uuid = Uuid::from_bytes([
    0x6e, 0x40, 0x00, 0x01, 0xb5, 0xa3, 0xf3, 0x93, 0xe0, 0xa9, 0xe5, 0x0e, 0x24, 0xdc, 0xca, 0x9e,
]);

/// RX characteristic (host→device) `6e400002-…`. Must advertise write or
/// write-without-response.
pub const RX_CHARACTERISTIC: Uuid = Uuid::from_bytes([
    0x6e, 0x40, 0x00, 0x02, 0xb5, 0xa3, 0xf3, 0x93, 0xe0, 0xa9, 0xe5, 0x0e, 0x24, 0xdc, 0xca, 0x9e,
]);

/// TX characteristic (device→host) `6e400003-…`. Must advertise notify or
/// read.
pub const TX_CHARACTERISTIC: Uuid = Uuid::from_bytes([
    0x6e, 0x40, 0x00, 0x03, 0xb5, 0xa3, 0xf3, 0x93, 0xe0, 0xa9, 0xe5, 0x0e, 0x24, 0xdc, 0xca, 0x9e,
]);

/// Name substrings that mark a peripheral as a plausible RNode candidate
/// during Discovery, matched case-insensitively.
pub const NAME_PATTERNS: &[&str] = &["rnode", "reticulum", "lora"];

/// The fallback display name for a device that advertises none.
pub const UNKNOWN_DEVICE_NAME: &str = "Unknown RNode";

/// Whether `name`, case-folded, contains any of [`NAME_PATTERNS`].
pub fn name_matches(name: &str) -> bool {
    let lower = name.to_lowercase();
    NAME_PATTERNS.iter().any(|pattern| lower.contains(pattern))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuids_are_well_formed() {
        assert_eq!(SERVICE.to_string(), "6e400001-b5a3-f393-e0a9-e50e24dcca9e");
        assert_eq!(RX_CHARACTERISTIC.to_string(), "6e400002-b5a3-f393-e0a9-e50e24dcca9e");
        assert_eq!(TX_CHARACTERISTIC.to_string(), "6e400003-b5a3-f393-e0a9-e50e24dcca9e");
    }

    #[test]
    fn name_matching_is_case_insensitive_and_substring_based() {
        assert!(name_matches("RNode A"));
        assert!(name_matches("my-LoRa-radio"));
        assert!(name_matches("Reticulum Node"));
        assert!(!name_matches("Generic BLE Speaker"));
    }
}
