//! The Bridge Service: owns Discovery and every [`DeviceBridge`],
//! runs the periodic discovery and reconnect-supervision loops, and
//! publishes a timestamped event stream for embedding applications.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};

use crate::address::Address;
use crate::bridge::{BridgeInfo, BridgeState, DeviceBridge};
use crate::discovery::{DiscoveredDevice, Discovery};
use crate::error::Error;
use crate::gatt_link::GattLinkConfig;
use crate::pairing::PairingManager;

/// Tunables for the Bridge Service's background loops.
#[derive(Debug, Clone)]
pub struct BridgeServiceConfig {
    pub auto_discover: bool,
    pub discovery_interval: Duration,
    pub discovery_scan_window: Duration,
    pub monitor_interval: Duration,
    pub gatt_link: GattLinkConfig,
}

impl Default for BridgeServiceConfig {
    fn default() -> Self {
        BridgeServiceConfig {
            auto_discover: true,
            discovery_interval: Duration::from_secs(30),
            discovery_scan_window: Duration::from_secs(5),
            monitor_interval: Duration::from_secs(10),
            gatt_link: GattLinkConfig::default(),
        }
    }
}

/// An event on the Bridge Service's publish surface, timestamped with the
/// elapsed duration since the service started.
#[derive(Debug, Clone)]
pub struct TimestampedEvent {
    pub elapsed: Duration,
    pub kind: EventKind,
}

#[derive(Debug, Clone)]
pub enum EventKind {
    ManagerStarted,
    ManagerStopped,
    DeviceDiscovered(DiscoveredDevice),
    BridgeStateChanged { address: Address, state: BridgeState },
    VirtualSerialCreated { address: Address, serial_port: Option<std::path::PathBuf>, symlink: std::path::PathBuf },
}

/// Comprehensive status snapshot.
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    pub is_running: bool,
    pub discovered_devices: usize,
    pub connected_bridges: usize,
    pub total_bridges: usize,
    pub bridges: Vec<BridgeInfo>,
}

/// Owns Discovery, the Pairing Manager, and every active [`DeviceBridge`];
/// the top-level entry point an embedding application drives.
pub struct BridgeService {
    discovery: Arc<Discovery>,
    pairing: Arc<PairingManager>,
    bridges: Arc<DashMap<Address, Arc<DeviceBridge>>>,
    adapter: bluer::Adapter,
    config: BridgeServiceConfig,
    running: Arc<AtomicBool>,
    events: broadcast::Sender<TimestampedEvent>,
    start_time: Arc<std::sync::Mutex<Option<Instant>>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl BridgeService {
    pub fn new(adapter: bluer::Adapter, config: BridgeServiceConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        BridgeService {
            discovery: Arc::new(Discovery::new(adapter.clone())),
            pairing: Arc::new(PairingManager::new()),
            bridges: Arc::new(DashMap::new()),
            adapter,
            config,
            running: Arc::new(AtomicBool::new(false)),
            events,
            start_time: Arc::new(std::sync::Mutex::new(None)),
            tasks: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TimestampedEvent> {
        self.events.subscribe()
    }

    /// Same event stream as [`Self::subscribe`], wrapped as a [`futures::Stream`]
    /// for embedding applications already built around `Stream` combinators.
    pub fn subscribe_stream(&self) -> impl futures::Stream<Item = Result<TimestampedEvent, BroadcastStreamRecvError>> {
        BroadcastStream::new(self.subscribe())
    }

    fn emit(&self, kind: EventKind) {
        let elapsed = self
            .start_time
            .lock()
            .unwrap()
            .map(|start| start.elapsed())
            .unwrap_or_default();
        let _ = self.events.send(TimestampedEvent { elapsed, kind });
    }

    /// Starts the service: optionally the periodic discovery loop, and
    /// always the reconnect-supervision loop.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("bridge service already running");
            return;
        }
        *self.start_time.lock().unwrap() = Some(Instant::now());
        tracing::info!("starting bridge service");
        self.emit(EventKind::ManagerStarted);

        let mut tasks = self.tasks.lock().unwrap();
        if self.config.auto_discover {
            tasks.push(self.spawn_discovery_loop());
        }
        tasks.push(self.spawn_monitor_loop());
        tracing::info!("bridge service started");
    }

    /// Stops background loops and disconnects every bridge.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("stopping bridge service");
        self.emit(EventKind::ManagerStopped);

        let handles: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for handle in handles {
            handle.abort();
        }

        let addresses: Vec<_> = self.bridges.iter().map(|e| e.key().clone()).collect();
        for address in addresses {
            if let Some((_, bridge)) = self.bridges.remove(&address) {
                bridge.disconnect().await;
            }
        }
        tracing::info!("bridge service stopped");
    }

    fn spawn_discovery_loop(&self) -> JoinHandle<()> {
        let discovery = Arc::clone(&self.discovery);
        let running = Arc::clone(&self.running);
        let interval = self.config.discovery_interval;
        let window = self.config.discovery_scan_window;
        let events = self.events.clone();
        let start_time = Arc::clone(&self.start_time);

        tokio::spawn(async move {
            tracing::debug!("discovery loop started");
            while running.load(Ordering::SeqCst) {
                match discovery.scan(window).await {
                    Ok(devices) => {
                        for device in devices {
                            let elapsed = start_time.lock().unwrap().map(|s| s.elapsed()).unwrap_or_default();
                            let _ = events.send(TimestampedEvent {
                                elapsed,
                                kind: EventKind::DeviceDiscovered(device),
                            });
                        }
                    }
                    Err(err) => tracing::warn!(%err, "discovery scan failed"),
                }
                tokio::time::sleep(interval).await;
            }
            tracing::debug!("discovery loop stopped");
        })
    }

    fn spawn_monitor_loop(&self) -> JoinHandle<()> {
        let bridges = Arc::clone(&self.bridges);
        let running = Arc::clone(&self.running);
        let interval = self.config.monitor_interval;

        tokio::spawn(async move {
            tracing::debug!("monitor loop started");
            while running.load(Ordering::SeqCst) {
                let to_reconnect: Vec<_> = bridges
                    .iter()
                    .filter(|e| e.value().state() == BridgeState::Error)
                    .map(|e| Arc::clone(e.value()))
                    .collect();
                for bridge in to_reconnect {
                    tracing::info!(address = %bridge.address(), "attempting scheduled reconnect");
                    if let Err(err) = bridge.reconnect().await {
                        tracing::debug!(%err, address = %bridge.address(), "scheduled reconnect did not proceed");
                    }
                }
                tokio::time::sleep(interval).await;
            }
            tracing::debug!("monitor loop stopped");
        })
    }

    /// Manually scans for devices, independent of the periodic loop.
    pub async fn scan(&self, window: Duration) -> Result<Vec<DiscoveredDevice>, Error> {
        let devices = self.discovery.scan(window).await?;
        for device in &devices {
            self.emit(EventKind::DeviceDiscovered(device.clone()));
        }
        Ok(devices)
    }

    /// Builds a bridge state-transition callback that republishes every
    /// transition as a [`EventKind::BridgeStateChanged`] on the event
    /// stream, timestamped against this service's start time.
    fn state_changed_callback(&self, address: Address) -> crate::bridge::BridgeStateCallback {
        let events = self.events.clone();
        let start_time = Arc::clone(&self.start_time);
        Box::new(move |state| {
            let elapsed = start_time.lock().unwrap().map(|start| start.elapsed()).unwrap_or_default();
            let _ = events.send(TimestampedEvent {
                elapsed,
                kind: EventKind::BridgeStateChanged { address: address.clone(), state },
            });
        })
    }

    /// Connects to a previously discovered device, creating its bridge if
    /// necessary.
    pub async fn connect(&self, address: &Address) -> Result<(), Error> {
        if self.discovery.device_by_address(address).is_none() {
            return Err(Error::new(crate::error::ErrorKind::NotFound, format!("{address} not in discovery cache")));
        }

        let bridge = match self.bridges.entry(address.clone()) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let new_bridge = Arc::new(DeviceBridge::new_bluer(
                    self.adapter.clone(),
                    address.clone(),
                    self.config.gatt_link.clone(),
                )?);
                new_bridge.set_state_callback(self.state_changed_callback(address.clone()));
                entry.insert(Arc::clone(&new_bridge));
                new_bridge
            }
        };

        let result = bridge.connect().await;
        if bridge.state() == BridgeState::Connected {
            let info = bridge.info();
            self.emit(EventKind::VirtualSerialCreated {
                address: address.clone(),
                serial_port: info.pty.slave_path,
                symlink: info.pty.symlink_path,
            });
        }
        result
    }

    /// Disconnects and forgets a device's bridge.
    pub async fn disconnect(&self, address: &Address) {
        if let Some((_, bridge)) = self.bridges.remove(address) {
            bridge.disconnect().await;
        }
    }

    pub fn list_connected(&self) -> Vec<BridgeInfo> {
        self.bridges
            .iter()
            .map(|e| e.value().info())
            .filter(|info| info.state == BridgeState::Connected)
            .collect()
    }

    pub fn pairing(&self) -> &PairingManager {
        &self.pairing
    }

    pub fn discovery(&self) -> &Discovery {
        &self.discovery
    }

    pub fn info(&self) -> ServiceInfo {
        let bridges: Vec<_> = self.bridges.iter().map(|e| e.value().info()).collect();
        ServiceInfo {
            is_running: self.running.load(Ordering::SeqCst),
            discovered_devices: self.discovery.discovered_devices().len(),
            connected_bridges: bridges.iter().filter(|b| b.state == BridgeState::Connected).count(),
            total_bridges: bridges.len(),
            bridges,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_intervals() {
        let config = BridgeServiceConfig::default();
        assert!(config.auto_discover);
        assert_eq!(config.discovery_interval, Duration::from_secs(30));
        assert_eq!(config.discovery_scan_window, Duration::from_secs(5));
        assert_eq!(config.monitor_interval, Duration::from_secs(10));
    }
}
