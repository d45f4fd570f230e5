//! Device identity: a Bluetooth hardware address, canonicalized to a
//! colon-separated hex string and compared case-insensitively.

use std::fmt;

/// A Bluetooth device address, compared and hashed case-insensitively.
///
/// Always displays and stores its canonical upper-case colon-separated
/// form (`AA:BB:CC:DD:EE:FF`), matching the literal addresses used
/// throughout end-to-end scenarios.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Address(String);

impl Address {
    /// Builds an `Address` from any colon-separated hex string, regardless
    /// of case.
    pub fn new(raw: impl AsRef<str>) -> Self {
        Address(raw.as_ref().to_ascii_uppercase())
    }

    /// The canonical colon-separated hex representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The address with colons removed, as used for the friendly symlink
    /// name (`RNode-<address with colons removed>`).
    pub fn compact(&self) -> String {
        self.0.chars().filter(|c| *c != ':').collect()
    }
}

impl From<bluer::Address> for Address {
    fn from(addr: bluer::Address) -> Self {
        Address::new(addr.to_string())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for Address {}

impl std::hash::Hash for Address {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl PartialOrd for Address {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Address {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_compare_case_insensitively() {
        assert_eq!(Address::new("aa:bb:cc:dd:ee:01"), Address::new("AA:BB:CC:DD:EE:01"));
    }

    #[test]
    fn compact_strips_colons() {
        assert_eq!(Address::new("AA:BB:CC:DD:EE:01").compact(), "AABBCCDDEE01");
    }

    #[test]
    fn display_uses_canonical_upper_case_form() {
        assert_eq!(Address::new("aa:bb:cc:dd:ee:01").to_string(), "AA:BB:CC:DD:EE:01");
    }
}
