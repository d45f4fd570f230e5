#![warn(missing_docs)]

//! Bridges RNode LoRa devices that expose a Nordic UART BLE profile to
//! local pseudo-terminal serial ports, so that any application speaking a
//! serial protocol over a `/dev/pts/*` device can talk to an RNode over
//! Bluetooth LE as though it were plugged in over USB.
//!
//! # Usage
//!
//! ```rust,no_run
//!# use rnode_ble_bridge::{BridgeService, BridgeServiceConfig};
//!# #[tokio::main]
//!# async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let session = bluer::Session::new().await?;
//! let adapter = session.default_adapter().await?;
//! adapter.set_powered(true).await?;
//!
//! let service = BridgeService::new(adapter, BridgeServiceConfig::default());
//! service.start().await;
//!
//! let devices = service.scan(std::time::Duration::from_secs(5)).await?;
//! if let Some(device) = devices.first() {
//!     service.connect(&device.address).await?;
//! }
//!#
//!#    Ok(())
//!# }
//! ```
//!
//! # Overview
//!
//! The crate is organized around six components, each owning one concern:
//!
//! - [`pty`]: a kernel pseudo-terminal pair presented to local serial
//!   clients, pumped on blocking OS threads.
//! - [`gatt_link`]: drives one peripheral's Nordic UART service over
//!   `bluer`, chunking writes to the BLE MTU.
//! - [`pairing`]: PIN storage and the authentication callback contract
//!   consulted during a GATT connect attempt.
//! - [`discovery`]: active BLE scanning, filtering, and compatibility
//!   verification.
//! - [`bridge`]: pairs one GATT link with one PTY endpoint and supervises
//!   its reconnection.
//! - [`bridge_service`]: owns discovery and every bridge, and runs the
//!   periodic discovery and reconnect loops.
//!
//! # Platform specifics
//!
//! This crate targets Linux only: it depends directly on `bluer` (the
//! BlueZ D-Bus binding) and on POSIX pseudo-terminals and `bluetoothctl`
//! for pairing. There is no cross-platform abstraction layer to generalize
//! away, unlike libraries that also support Windows/macOS BLE stacks.
//!
//! # Feature flags
//!
//! The `serde` feature enables serializing/deserializing device addresses
//! and discovery results.
//!
//! # Non-goals
//!
//! This crate does not interpret KISS/LoRa framing carried over the
//! serial link, does not persist bridge state across process restarts,
//! and does not proxy BLE traffic over a network. See each module's docs
//! for module-specific non-goals.

pub mod address;
pub mod bridge;
pub mod bridge_service;
pub mod discovery;
pub mod error;
pub mod gatt_link;
pub mod nordic_uart;
pub mod pairing;
pub mod pty;

pub use address::Address;
pub use bridge::{BridgeInfo, BridgeState, DeviceBridge, DeviceBridgeGeneric, ReconnectPolicy};
pub use bridge_service::{BridgeService, BridgeServiceConfig, EventKind, ServiceInfo, TimestampedEvent};
pub use discovery::{DeviceInfo, DiscoveredDevice, Discovery};
pub use error::Error;
pub use gatt_link::{GattLink, GattLinkConfig, GattTransport};
pub use pairing::{PairingInstructions, PairingManager, PairingState};
pub use pty::{PtyEndpoint, PtyInfo};

/// Convenience alias for a result with [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;
