//! The GATT Link: drives the Nordic UART service over `bluer`,
//! chunking outbound writes to the configured MTU and forwarding inbound
//! notifications to a callback. Tests exercise the [`GattTransport`] seam
//! instead of real BlueZ hardware.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::address::Address;
use crate::error::{is_auth_related, Error, ErrorKind};
use crate::nordic_uart;

/// Invoked with bytes notified by the device's TX characteristic.
pub type DataCallback = Box<dyn Fn(Vec<u8>) + Send + Sync>;
/// Invoked on connection-established or connection-lost transitions.
pub type StateCallback = Box<dyn Fn() + Send + Sync>;
/// Invoked with `(reason, detail)` when a connect attempt fails for
/// pairing-related reasons.
pub type PairingCallback = Box<dyn Fn(String, String) + Send + Sync>;

/// Tunables for [`GattLink`].
#[derive(Debug, Clone)]
pub struct GattLinkConfig {
    pub connect_timeout: Duration,
    pub mtu_chunk_size: usize,
    pub inter_chunk_delay: Duration,
}

impl Default for GattLinkConfig {
    fn default() -> Self {
        GattLinkConfig {
            connect_timeout: Duration::from_secs(30),
            mtu_chunk_size: 20,
            inter_chunk_delay: Duration::from_millis(10),
        }
    }
}

/// GATT Link connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
}

/// How often liveness is polled once connected, independent of the Bridge
/// Service's own reconnect-supervision interval.
const LIVENESS_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Backoff between re-sends of a frame whose GATT write failed.
const TX_WRITE_BACKOFF: Duration = Duration::from_millis(100);
/// Re-sends attempted before a persistently failing write declares the link
/// lost.
const TX_WRITE_MAX_ATTEMPTS: u32 = 5;

/// The narrow async surface a [`crate::bridge::DeviceBridgeGeneric`] drives;
/// satisfied by [`GattLink`] in production and by an in-memory fake in
/// tests.
#[async_trait]
pub trait GattTransport: Send + Sync + 'static {
    async fn connect(&self) -> Result<(), Error>;
    async fn disconnect(&self);
    fn send(&self, data: Vec<u8>) -> bool;
    fn set_data_callback(&self, callback: DataCallback);
    fn set_connection_callbacks(
        &self,
        established: StateCallback,
        lost: StateCallback,
        pairing: PairingCallback,
    );
    fn state(&self) -> LinkState;
}

struct Callbacks {
    data: Option<DataCallback>,
    established: Option<StateCallback>,
    lost: Option<StateCallback>,
    pairing: Option<PairingCallback>,
}

impl Default for Callbacks {
    fn default() -> Self {
        Callbacks { data: None, established: None, lost: None, pairing: None }
    }
}

/// A GATT Link bound to one peripheral address, backed by `bluer`.
pub struct GattLink {
    address: Address,
    bluer_address: bluer::Address,
    adapter: bluer::Adapter,
    config: GattLinkConfig,
    state: Arc<Mutex<LinkState>>,
    callbacks: Arc<Mutex<Callbacks>>,
    connected: Arc<AtomicBool>,
    tx_sender: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl GattLink {
    pub fn new(adapter: bluer::Adapter, address: Address, config: GattLinkConfig) -> Result<Self, Error> {
        let bluer_address: bluer::Address = address
            .as_str()
            .parse()
            .map_err(|_| Error::new(ErrorKind::Other, format!("invalid bluetooth address {address}")))?;
        Ok(GattLink {
            address,
            bluer_address,
            adapter,
            config,
            state: Arc::new(Mutex::new(LinkState::Idle)),
            callbacks: Arc::new(Mutex::new(Callbacks::default())),
            connected: Arc::new(AtomicBool::new(false)),
            tx_sender: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    async fn setup_characteristics(
        &self,
        device: &bluer::Device,
    ) -> Result<(bluer::gatt::remote::Characteristic, bluer::gatt::remote::Characteristic), Error> {
        let services = device.services().await?;
        let mut rx = None;
        let mut tx = None;
        for service in services {
            if service.uuid().await? != nordic_uart::SERVICE {
                continue;
            }
            for characteristic in service.characteristics().await? {
                let uuid = characteristic.uuid().await?;
                if uuid == nordic_uart::RX_CHARACTERISTIC {
                    rx = Some(characteristic);
                } else if uuid == nordic_uart::TX_CHARACTERISTIC {
                    tx = Some(characteristic);
                }
            }
        }
        let rx = rx.ok_or_else(|| Error::new(ErrorKind::Protocol, "RX characteristic not found"))?;
        let tx = tx.ok_or_else(|| Error::new(ErrorKind::Protocol, "TX characteristic not found"))?;
        Ok((rx, tx))
    }

    async fn spawn_notify_task(&self, tx_char: bluer::gatt::remote::Characteristic) -> Result<(), Error> {
        let mut stream = tx_char.notify().await?;
        let callbacks = Arc::clone(&self.callbacks);
        let handle = tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(data) => {
                        if let Some(cb) = callbacks.lock().await.data.as_ref() {
                            cb(data);
                        }
                    }
                    Err(err) => {
                        tracing::debug!(%err, "gatt notify stream error");
                        break;
                    }
                }
            }
        });
        self.tasks.lock().await.push(handle);
        Ok(())
    }

    async fn spawn_tx_task(&self, rx_char: bluer::gatt::remote::Characteristic) -> mpsc::UnboundedSender<Vec<u8>> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Vec<u8>>();
        let chunk_size = self.config.mtu_chunk_size.max(1);
        let delay = self.config.inter_chunk_delay;
        let connected = Arc::clone(&self.connected);
        let state = Arc::clone(&self.state);
        let callbacks = Arc::clone(&self.callbacks);
        let handle = tokio::spawn(async move {
            'frames: while let Some(data) = receiver.recv().await {
                let mut attempt = 0u32;
                loop {
                    let mut failed = false;
                    for chunk in data.chunks(chunk_size) {
                        if let Err(err) = rx_char.write(chunk).await {
                            tracing::warn!(%err, attempt, "gatt write failed, re-enqueuing frame");
                            failed = true;
                            break;
                        }
                        tokio::time::sleep(delay).await;
                    }
                    if !failed {
                        break;
                    }

                    attempt += 1;
                    if attempt >= TX_WRITE_MAX_ATTEMPTS {
                        tracing::warn!(attempt, "gatt write repeatedly failed, treating link as lost");
                        connected.store(false, Ordering::SeqCst);
                        *state.lock().await = LinkState::Idle;
                        if let Some(cb) = callbacks.lock().await.lost.as_ref() {
                            cb();
                        }
                        break 'frames;
                    }
                    tokio::time::sleep(TX_WRITE_BACKOFF).await;
                }
            }
        });
        self.tasks.lock().await.push(handle);
        sender
    }

    async fn spawn_liveness_task(&self, device: bluer::Device) {
        let connected = Arc::clone(&self.connected);
        let state = Arc::clone(&self.state);
        let callbacks = Arc::clone(&self.callbacks);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(LIVENESS_POLL_INTERVAL).await;
                if !connected.load(Ordering::SeqCst) {
                    break;
                }
                match device.is_connected().await {
                    Ok(true) => continue,
                    _ => {
                        connected.store(false, Ordering::SeqCst);
                        *state.lock().await = LinkState::Idle;
                        if let Some(cb) = callbacks.lock().await.lost.as_ref() {
                            cb();
                        }
                        break;
                    }
                }
            }
        });
        self.tasks.lock().await.push(handle);
    }

    async fn abort_tasks(&self) {
        for handle in self.tasks.lock().await.drain(..) {
            handle.abort();
        }
    }
}

#[async_trait]
impl GattTransport for GattLink {
    async fn connect(&self) -> Result<(), Error> {
        {
            let mut state = self.state.lock().await;
            if *state == LinkState::Connecting || *state == LinkState::Connected {
                return Ok(());
            }
            *state = LinkState::Connecting;
        }

        let device = self
            .adapter
            .device(self.bluer_address)
            .map_err(Error::from)?;

        let connect_result = tokio::time::timeout(self.config.connect_timeout, device.connect()).await;
        let connect_result = match connect_result {
            Ok(inner) => inner,
            Err(_) => {
                *self.state.lock().await = LinkState::Idle;
                return Err(Error::new(ErrorKind::Timeout, format!("connecting to {} timed out", self.address)));
            }
        };

        if let Err(err) = connect_result {
            *self.state.lock().await = LinkState::Idle;
            let message = err.to_string();
            let error: Error = err.into();
            if is_auth_related(&message) {
                if let Some(cb) = self.callbacks.lock().await.pairing.as_ref() {
                    cb("pairing_required".to_string(), message.clone());
                }
                return Err(Error::new(ErrorKind::AuthRequired, message));
            }
            return Err(error);
        }

        let (rx_char, tx_char) = match self.setup_characteristics(&device).await {
            Ok(pair) => pair,
            Err(err) => {
                let _ = device.disconnect().await;
                *self.state.lock().await = LinkState::Idle;
                return Err(err);
            }
        };

        if let Err(err) = self.spawn_notify_task(tx_char).await {
            let _ = device.disconnect().await;
            *self.state.lock().await = LinkState::Idle;
            return Err(err);
        }

        let sender = self.spawn_tx_task(rx_char).await;
        *self.tx_sender.lock().await = Some(sender);

        self.connected.store(true, Ordering::SeqCst);
        *self.state.lock().await = LinkState::Connected;
        self.spawn_liveness_task(device).await;

        if let Some(cb) = self.callbacks.lock().await.established.as_ref() {
            cb();
        }
        tracing::info!(address = %self.address, "gatt link connected");
        Ok(())
    }

    async fn disconnect(&self) {
        {
            let mut state = self.state.lock().await;
            if *state == LinkState::Idle {
                return;
            }
            *state = LinkState::Disconnecting;
        }
        self.connected.store(false, Ordering::SeqCst);
        self.abort_tasks().await;
        *self.tx_sender.lock().await = None;

        if let Ok(device) = self.adapter.device(self.bluer_address) {
            let _ = device.disconnect().await;
        }
        *self.state.lock().await = LinkState::Idle;
        tracing::info!(address = %self.address, "gatt link disconnected");
    }

    fn send(&self, data: Vec<u8>) -> bool {
        match self.tx_sender.try_lock() {
            Ok(guard) => match guard.as_ref() {
                Some(sender) => sender.send(data).is_ok(),
                None => false,
            },
            Err(_) => false,
        }
    }

    fn set_data_callback(&self, callback: DataCallback) {
        if let Ok(mut callbacks) = self.callbacks.try_lock() {
            callbacks.data = Some(callback);
        }
    }

    fn set_connection_callbacks(
        &self,
        established: StateCallback,
        lost: StateCallback,
        pairing: PairingCallback,
    ) {
        if let Ok(mut callbacks) = self.callbacks.try_lock() {
            callbacks.established = Some(established);
            callbacks.lost = Some(lost);
            callbacks.pairing = Some(pairing);
        }
    }

    fn state(&self) -> LinkState {
        self.state.try_lock().map(|s| *s).unwrap_or(LinkState::Idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_chunking_and_timeout() {
        let config = GattLinkConfig::default();
        assert_eq!(config.mtu_chunk_size, 20);
        assert_eq!(config.inter_chunk_delay, Duration::from_millis(10));
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
    }

    #[test]
    fn chunking_respects_configured_size() {
        let data = vec![0u8; 45];
        let chunks: Vec<_> = data.chunks(20).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 20);
        assert_eq!(chunks[2].len(), 5);
    }
}
