//! Discovery: active scanning over `bluer`'s adapter discovery
//! stream, filtering candidates by Nordic UART service UUID or name
//! substring and de-duplicating by address with latest-RSSI-wins.

use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use smallvec::SmallVec;

use crate::address::Address;
use crate::error::Error;
use crate::nordic_uart;

/// Advertised service UUIDs, most devices carry one or two.
pub type ServiceUuids = SmallVec<[uuid::Uuid; 2]>;

/// A discovered candidate device.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiscoveredDevice {
    pub address: Address,
    pub name: String,
    pub rssi: Option<i16>,
    pub service_uuids: ServiceUuids,
}

/// Detail about a single GATT characteristic, for [`Discovery::device_info`].
#[derive(Debug, Clone)]
pub struct CharacteristicInfo {
    pub uuid: uuid::Uuid,
    pub readable: bool,
    pub writable: bool,
    pub notifiable: bool,
}

/// A diagnostic snapshot of a device's advertised services, with Nordic
/// UART characteristics broken out specifically.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub address: Address,
    pub rssi: Option<i16>,
    pub service_uuids: ServiceUuids,
    pub nordic_uart_characteristics: Vec<CharacteristicInfo>,
}

/// Discovers Nordic-UART-compatible peripherals on one Bluetooth adapter.
pub struct Discovery {
    adapter: bluer::Adapter,
    devices: DashMap<Address, DiscoveredDevice>,
}

impl Discovery {
    pub fn new(adapter: bluer::Adapter) -> Self {
        Discovery { adapter, devices: DashMap::new() }
    }

    /// Scans for `window`, returning every device that matches the Nordic
    /// UART service UUID or one of [`nordic_uart::NAME_PATTERNS`].
    /// Clears and repopulates the discovered-device cache.
    pub async fn scan(&self, window: Duration) -> Result<Vec<DiscoveredDevice>, Error> {
        tracing::info!(?window, "starting scan for rnode devices");
        self.devices.clear();

        let mut events = self.adapter.discover_devices().await?;
        let deadline = tokio::time::sleep(window);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => break,
                event = events.next() => {
                    match event {
                        Some(bluer::AdapterEvent::DeviceAdded(addr)) => {
                            if let Err(err) = self.consider_device(addr).await {
                                tracing::debug!(%err, %addr, "error inspecting discovered device");
                            }
                        }
                        Some(_) => continue,
                        None => break,
                    }
                }
            }
        }

        let found: Vec<_> = self.devices.iter().map(|e| e.value().clone()).collect();
        tracing::info!(count = found.len(), "scan complete");
        Ok(found)
    }

    async fn consider_device(&self, bluer_address: bluer::Address) -> Result<(), Error> {
        let device = self.adapter.device(bluer_address)?;
        let name = device.alias().await.unwrap_or_default();
        let service_uuids: ServiceUuids = device.uuids().await?.unwrap_or_default().into_iter().collect();
        let rssi = device.rssi().await?;

        let matches_service = service_uuids.contains(&nordic_uart::SERVICE);
        let matches_name = !name.is_empty() && nordic_uart::name_matches(&name);
        if !matches_service && !matches_name {
            return Ok(());
        }

        let address = Address::from(bluer_address);
        let display_name = if name.is_empty() { nordic_uart::UNKNOWN_DEVICE_NAME.to_string() } else { name };
        let discovered = DiscoveredDevice {
            address: address.clone(),
            name: display_name,
            rssi,
            service_uuids,
        };
        tracing::info!(address = %discovered.address, name = %discovered.name, "discovered rnode candidate");
        self.devices.insert(address, discovered);
        Ok(())
    }

    pub fn discovered_devices(&self) -> Vec<DiscoveredDevice> {
        self.devices.iter().map(|e| e.value().clone()).collect()
    }

    pub fn device_by_address(&self, address: &Address) -> Option<DiscoveredDevice> {
        self.devices.get(address).map(|e| e.value().clone())
    }

    /// Connects briefly to confirm the peripheral implements the Nordic
    /// UART contract with correctly-propertied characteristics.
    pub async fn verify_compatibility(&self, address: &Address) -> Result<bool, Error> {
        let info = self.device_info(address).await?;
        let rx_ok = info
            .nordic_uart_characteristics
            .iter()
            .any(|c| c.uuid == nordic_uart::RX_CHARACTERISTIC && c.writable);
        let tx_ok = info
            .nordic_uart_characteristics
            .iter()
            .any(|c| c.uuid == nordic_uart::TX_CHARACTERISTIC && (c.readable || c.notifiable));
        Ok(rx_ok && tx_ok)
    }

    /// Connects briefly and returns a structured summary of advertised
    /// services and, for the Nordic UART service, its characteristics.
    pub async fn device_info(&self, address: &Address) -> Result<DeviceInfo, Error> {
        let bluer_address: bluer::Address = address
            .as_str()
            .parse()
            .map_err(|_| Error::new(crate::error::ErrorKind::Other, format!("invalid address {address}")))?;
        let device = self.adapter.device(bluer_address)?;

        let name = device.alias().await.unwrap_or_default();
        let rssi = device.rssi().await?;
        let service_uuids: ServiceUuids = device.uuids().await?.unwrap_or_default().into_iter().collect();

        device.connect().await?;
        let mut nordic_uart_characteristics = Vec::new();
        let disconnect_result = async {
            for service in device.services().await? {
                if service.uuid().await? != nordic_uart::SERVICE {
                    continue;
                }
                for characteristic in service.characteristics().await? {
                    let uuid = characteristic.uuid().await?;
                    let flags = characteristic.flags().await?;
                    nordic_uart_characteristics.push(CharacteristicInfo {
                        uuid,
                        readable: flags.read,
                        writable: flags.write || flags.write_without_response,
                        notifiable: flags.notify,
                    });
                }
            }
            Ok::<(), Error>(())
        }
        .await;
        let _ = device.disconnect().await;
        disconnect_result?;

        Ok(DeviceInfo {
            name: if name.is_empty() { nordic_uart::UNKNOWN_DEVICE_NAME.to_string() } else { name },
            address: address.clone(),
            rssi,
            service_uuids,
            nordic_uart_characteristics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovered_device_name_falls_back_when_empty() {
        let address = Address::new("AA:BB:CC:DD:EE:01");
        let device = DiscoveredDevice {
            address: address.clone(),
            name: nordic_uart::UNKNOWN_DEVICE_NAME.to_string(),
            rssi: None,
            service_uuids: smallvec::smallvec![nordic_uart::SERVICE],
        };
        assert_eq!(device.name, "Unknown RNode");
        assert_eq!(device.address, address);
    }
}
