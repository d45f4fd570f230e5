//! The Pairing Manager: PIN storage, platform-dispatched pairing,
//! and the authentication callback contract a [`crate::gatt_link::GattLink`]
//! connect attempt consults.

use std::process::Command;
use std::time::Duration;

use dashmap::DashMap;

use crate::address::Address;
use crate::error::{is_auth_related, Error, ErrorKind};

/// Default PINs tried, in order, when a device requests a passkey and none
/// is cached for it (matching the original's `default_pins` list).
pub const DEFAULT_PINS: &[&str] = &["123456", "000000", "111111", "654321"];

const BLUETOOTHCTL_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on the speculative connect in [`PairingManager::check_pairing_status`].
const CHECK_PAIRING_TIMEOUT: Duration = Duration::from_secs(5);

/// Pairing state for a single device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    Unknown,
    Unpaired,
    Pairing,
    Paired,
    Failed,
    Error,
}

/// Platform-specific pairing instructions: `{platform, title, steps,
/// notes}`.
#[derive(Debug, Clone)]
pub struct PairingInstructions {
    pub platform: &'static str,
    pub title: &'static str,
    pub steps: Vec<String>,
    pub notes: &'static str,
}

/// Tracks PINs and pairing state for every address the bridge has seen, and
/// dispatches actual pairing to the host OS.
pub struct PairingManager {
    pins: DashMap<Address, String>,
    states: DashMap<Address, PairingState>,
}

impl Default for PairingManager {
    fn default() -> Self {
        PairingManager { pins: DashMap::new(), states: DashMap::new() }
    }
}

impl PairingManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caches `pin` for `address`, consulted by [`Self::on_passkey_request`]
    /// and [`Self::on_confirm_pin`].
    pub fn store_pin(&self, address: &Address, pin: impl Into<String>) {
        self.pins.insert(address.clone(), pin.into());
        tracing::info!(%address, "stored pairing pin");
    }

    pub fn get_pin(&self, address: &Address) -> Option<String> {
        self.pins.get(address).map(|entry| entry.clone())
    }

    pub fn clear_pin(&self, address: &Address) {
        self.pins.remove(address);
    }

    fn set_state(&self, address: &Address, state: PairingState) {
        self.states.insert(address.clone(), state);
    }

    pub fn pairing_state(&self, address: &Address) -> PairingState {
        self.states.get(address).map(|e| *e).unwrap_or(PairingState::Unknown)
    }

    /// Pairs with `address`, optionally seeding a PIN first. Linux only;
    /// other platforms return an `Protocol`-classified error pointing at
    /// [`Self::pairing_instructions`].
    pub fn pair(&self, address: &Address, pin: Option<&str>) -> Result<(), Error> {
        self.set_state(address, PairingState::Pairing);
        if let Some(pin) = pin {
            self.store_pin(address, pin.to_string());
        }

        let result = if cfg!(target_os = "linux") {
            self.pair_linux(address)
        } else {
            Err(Error::new(
                ErrorKind::Protocol,
                "automatic pairing is only implemented on Linux; see pairing_instructions()",
            ))
        };

        match &result {
            Ok(()) => self.set_state(address, PairingState::Paired),
            Err(_) => self.set_state(address, PairingState::Failed),
        }
        result
    }

    fn pair_linux(&self, address: &Address) -> Result<(), Error> {
        run_bluetoothctl(&["pair", address.as_str()])?;
        run_bluetoothctl(&["trust", address.as_str()])?;
        Ok(())
    }

    /// Checks whether `address` is already paired by attempting a short,
    /// speculative connect-and-disconnect, without going through a
    /// [`crate::gatt_link::GattLink`]. A successful connect means paired; a
    /// timeout or an authentication-related error string means unpaired;
    /// anything else is unknown. Updates the cached [`PairingState`] as a
    /// side effect.
    pub async fn check_pairing_status(&self, adapter: &bluer::Adapter, address: &Address) -> PairingState {
        let state = self.probe_pairing_status(adapter, address).await;
        self.set_state(address, state);
        state
    }

    async fn probe_pairing_status(&self, adapter: &bluer::Adapter, address: &Address) -> PairingState {
        let bluer_address: bluer::Address = match address.as_str().parse() {
            Ok(addr) => addr,
            Err(_) => return PairingState::Unknown,
        };
        let device = match adapter.device(bluer_address) {
            Ok(device) => device,
            Err(_) => return PairingState::Unknown,
        };

        match tokio::time::timeout(CHECK_PAIRING_TIMEOUT, device.connect()).await {
            Ok(Ok(())) => {
                let _ = device.disconnect().await;
                PairingState::Paired
            }
            Ok(Err(err)) => {
                if is_auth_related(&err.to_string()) {
                    PairingState::Unpaired
                } else {
                    PairingState::Unknown
                }
            }
            Err(_) => PairingState::Unpaired,
        }
    }

    /// Platform-specific numbered pairing steps.
    pub fn pairing_instructions(&self, address: &Address) -> PairingInstructions {
        if cfg!(target_os = "macos") {
            PairingInstructions {
                platform: "macOS",
                title: "Pair RNode Device",
                steps: vec![
                    "Open System Settings -> Bluetooth".into(),
                    "Make sure your RNode is in pairing mode".into(),
                    "Click Connect when the RNode appears".into(),
                    "Enter the PIN when prompted".into(),
                    format!("Retry connecting to {address}"),
                ],
                notes: "The PIN is usually printed on the RNode or is a default like 123456",
            }
        } else if cfg!(target_os = "linux") {
            PairingInstructions {
                platform: "Linux",
                title: "Pair RNode Device",
                steps: vec![
                    "Open a terminal".into(),
                    "Run: bluetoothctl".into(),
                    "Run: scan on".into(),
                    format!("Run: pair {address}"),
                    "Enter the PIN when prompted".into(),
                    format!("Run: trust {address}"),
                    "Retry connecting".into(),
                ],
                notes: "You can also use your desktop's Bluetooth settings panel",
            }
        } else {
            PairingInstructions {
                platform: "unsupported",
                title: "Manual Pairing Required",
                steps: vec![
                    "Use your system's Bluetooth settings".into(),
                    format!("Pair with {address}"),
                    "Enter the PIN when prompted".into(),
                    "Retry connecting".into(),
                ],
                notes: "Automatic pairing is not implemented for this platform",
            }
        }
    }

    /// Handles a passkey request from the device: the cached PIN if one is
    /// stored, else each of [`DEFAULT_PINS`] in order.
    pub fn on_passkey_request(&self, address: &Address) -> u32 {
        if let Some(pin) = self.get_pin(address) {
            if let Ok(value) = pin.parse() {
                return value;
            }
        }
        DEFAULT_PINS[0].parse().unwrap_or(0)
    }

    pub fn on_passkey_notify(&self, address: &Address, passkey: u32) {
        tracing::info!(%address, passkey = format!("{passkey:06}"), "device displaying pairing pin");
    }

    /// Handles a PIN confirmation request. Rejects unless a cached PIN
    /// matches `pin` — a device offering a PIN we never cached is not
    /// trusted by default.
    pub fn on_confirm_pin(&self, address: &Address, pin: u32) -> bool {
        let matches = self
            .get_pin(address)
            .and_then(|stored| stored.parse::<u32>().ok())
            .map(|stored| stored == pin)
            .unwrap_or(false);
        if matches {
            tracing::info!(%address, "confirmed pairing pin against cached value");
        } else {
            tracing::warn!(%address, "rejecting pairing pin confirmation: no matching cached pin");
        }
        matches
    }

    pub fn on_security_request(&self, _address: &Address) -> bool {
        true
    }

    pub fn on_authentication_complete(&self, address: &Address, success: bool) {
        if success {
            self.set_state(address, PairingState::Paired);
            tracing::info!(%address, "authentication completed successfully");
        } else {
            self.set_state(address, PairingState::Failed);
            tracing::warn!(%address, "authentication failed");
        }
    }
}

fn run_bluetoothctl(args: &[&str]) -> Result<(), Error> {
    let mut command = Command::new("bluetoothctl");
    command.args(args);
    tracing::info!(command = ?args, "running bluetoothctl");

    let output = run_with_timeout(command, BLUETOOTHCTL_TIMEOUT)?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::new(ErrorKind::Other, format!("bluetoothctl {args:?} failed: {stderr}")));
    }
    Ok(())
}

fn run_with_timeout(mut command: Command, timeout: Duration) -> Result<std::process::Output, Error> {
    let mut child = command
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()?;

    let deadline = std::time::Instant::now() + timeout;
    loop {
        match child.try_wait()? {
            Some(_) => return Ok(child.wait_with_output()?),
            None if std::time::Instant::now() >= deadline => {
                let _ = child.kill();
                return Err(Error::new(ErrorKind::Timeout, "bluetoothctl command timed out"));
            }
            None => std::thread::sleep(Duration::from_millis(50)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passkey_request_falls_back_to_default_pin() {
        let manager = PairingManager::new();
        let address = Address::new("AA:BB:CC:DD:EE:01");
        assert_eq!(manager.on_passkey_request(&address), 123_456);
    }

    #[test]
    fn passkey_request_prefers_cached_pin() {
        let manager = PairingManager::new();
        let address = Address::new("AA:BB:CC:DD:EE:02");
        manager.store_pin(&address, "654321");
        assert_eq!(manager.on_passkey_request(&address), 654_321);
    }

    #[test]
    fn confirm_pin_rejects_without_cached_match() {
        let manager = PairingManager::new();
        let address = Address::new("AA:BB:CC:DD:EE:03");
        assert!(!manager.on_confirm_pin(&address, 123_456));
    }

    #[test]
    fn confirm_pin_accepts_matching_cached_pin() {
        let manager = PairingManager::new();
        let address = Address::new("AA:BB:CC:DD:EE:04");
        manager.store_pin(&address, "111111");
        assert!(manager.on_confirm_pin(&address, 111_111));
    }

    #[test]
    fn clear_pin_removes_cached_value() {
        let manager = PairingManager::new();
        let address = Address::new("AA:BB:CC:DD:EE:05");
        manager.store_pin(&address, "000000");
        manager.clear_pin(&address);
        assert_eq!(manager.get_pin(&address), None);
    }
}
