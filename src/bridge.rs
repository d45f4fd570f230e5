//! The Device Bridge: pairs one [`crate::gatt_link::GattTransport`]
//! with one [`crate::pty::PtyEndpoint`] and wires data between them, with
//! cooldown-and-cap-bounded reconnection.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::address::Address;
use crate::error::Error;
use crate::gatt_link::{GattLink, GattLinkConfig, GattTransport, LinkState};
use crate::pty::{PtyEndpoint, PtyInfo};

/// Bridge connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Disconnected,
    Discovering,
    Connecting,
    Connected,
    Error,
}

/// Bounds reconnection attempts.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub cooldown: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy { cooldown: Duration::from_secs(10), max_attempts: 5 }
    }
}

/// A diagnostic snapshot of one bridge.
#[derive(Debug, Clone)]
pub struct BridgeInfo {
    pub address: Address,
    pub state: BridgeState,
    pub reconnect_attempts: u32,
    pub pty: PtyInfo,
}

/// Invoked exactly once on every bridge state transition, with the new
/// state.
pub type BridgeStateCallback = Box<dyn Fn(BridgeState) + Send + Sync>;

/// One device's bridge between its GATT link and its PTY endpoint, generic
/// over the GATT transport so tests can substitute a fake.
pub struct DeviceBridgeGeneric<T: GattTransport> {
    address: Address,
    transport: Arc<T>,
    pty: Arc<Mutex<PtyEndpoint>>,
    state: Arc<Mutex<BridgeState>>,
    state_callback: Arc<Mutex<Option<BridgeStateCallback>>>,
    reconnect_policy: ReconnectPolicy,
    reconnect_attempts: AtomicU32,
    last_attempt: Mutex<Option<Instant>>,
}

/// Production alias: a [`DeviceBridgeGeneric`] backed by the real `bluer`
/// GATT transport.
pub type DeviceBridge = DeviceBridgeGeneric<GattLink>;

impl DeviceBridge {
    pub fn new_bluer(adapter: bluer::Adapter, address: Address, config: GattLinkConfig) -> Result<Self, Error> {
        let link = GattLink::new(adapter, address.clone(), config)?;
        Ok(DeviceBridgeGeneric::new(address, link, ReconnectPolicy::default()))
    }
}

impl<T: GattTransport> DeviceBridgeGeneric<T> {
    pub fn new(address: Address, transport: T, reconnect_policy: ReconnectPolicy) -> Self {
        let symlink_name = format!("RNode-{}", address.compact());
        let bridge = DeviceBridgeGeneric {
            address,
            transport: Arc::new(transport),
            pty: Arc::new(Mutex::new(PtyEndpoint::new(symlink_name))),
            state: Arc::new(Mutex::new(BridgeState::Disconnected)),
            state_callback: Arc::new(Mutex::new(None)),
            reconnect_policy,
            reconnect_attempts: AtomicU32::new(0),
            last_attempt: Mutex::new(None),
        };
        bridge.wire_callbacks();
        bridge
    }

    fn wire_callbacks(&self) {
        let pty_for_data = Arc::clone(&self.pty);
        self.transport.set_data_callback(Box::new(move |data| {
            if let Ok(pty) = pty_for_data.lock() {
                pty.send(data);
            }
        }));

        let address_for_established = self.address.clone();
        let transport_for_lost = Arc::clone(&self.transport);
        let state_for_lost = Arc::clone(&self.state);
        let state_callback_for_lost = Arc::clone(&self.state_callback);
        let pty_for_lost = Arc::clone(&self.pty);
        let address_for_lost = self.address.clone();
        let address_for_pairing = self.address.clone();

        self.transport.set_connection_callbacks(
            Box::new(move || {
                tracing::info!(address = %address_for_established, "bridge gatt link established");
            }),
            Box::new(move || {
                tracing::warn!(address = %address_for_lost, "bridge gatt link lost");
                *state_for_lost.lock().unwrap() = BridgeState::Error;
                if let Some(cb) = state_callback_for_lost.lock().unwrap().as_ref() {
                    cb(BridgeState::Error);
                }
                if let Ok(mut pty) = pty_for_lost.lock() {
                    pty.close();
                }
                let _ = &transport_for_lost;
            }),
            Box::new(move |reason, detail| {
                tracing::warn!(address = %address_for_pairing, %reason, %detail, "bridge pairing required");
            }),
        );
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    #[cfg(test)]
    pub(crate) fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn state(&self) -> BridgeState {
        *self.state.lock().unwrap()
    }

    /// Registers a callback invoked exactly once on every state transition,
    /// with the new state. Replaces any previously registered callback.
    pub fn set_state_callback(&self, callback: BridgeStateCallback) {
        *self.state_callback.lock().unwrap() = Some(callback);
    }

    fn set_state(&self, new_state: BridgeState) {
        *self.state.lock().unwrap() = new_state;
        if let Some(cb) = self.state_callback.lock().unwrap().as_ref() {
            cb(new_state);
        }
    }

    /// Opens the PTY endpoint and connects the GATT link, wiring the data
    /// path both directions.
    pub async fn connect(&self) -> Result<(), Error> {
        self.set_state(BridgeState::Connecting);

        {
            let mut pty = self.pty.lock().unwrap();
            if let Err(err) = pty.open() {
                self.set_state(BridgeState::Error);
                return Err(err);
            }
            let transport = Arc::clone(&self.transport);
            pty.set_data_callback(Box::new(move |data| {
                transport.send(data);
            }));
        }

        if let Err(err) = self.transport.connect().await {
            self.set_state(BridgeState::Error);
            self.pty.lock().unwrap().close();
            return Err(err);
        }

        self.set_state(BridgeState::Connected);
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        tracing::info!(address = %self.address, "bridge connected");
        Ok(())
    }

    /// Disconnects both halves of the bridge. Idempotent.
    pub async fn disconnect(&self) {
        tracing::info!(address = %self.address, "disconnecting bridge");
        self.set_state(BridgeState::Disconnected);
        self.transport.disconnect().await;
        self.pty.lock().unwrap().close();
    }

    /// Attempts a reconnect if the cooldown has elapsed and the attempt cap
    /// has not been reached.
    pub async fn reconnect(&self) -> Result<(), Error> {
        if self.state() != BridgeState::Error {
            return Err(Error::new(
                crate::error::ErrorKind::Cancelled,
                "reconnect is only admitted while the bridge is in the Error state",
            ));
        }

        let attempts = self.reconnect_attempts.load(Ordering::SeqCst);
        if attempts >= self.reconnect_policy.max_attempts {
            tracing::warn!(address = %self.address, attempts, "max reconnect attempts reached");
            return Err(Error::new(
                crate::error::ErrorKind::Cancelled,
                "max reconnect attempts reached",
            ));
        }

        {
            let mut last_attempt = self.last_attempt.lock().unwrap();
            if let Some(last) = *last_attempt {
                if last.elapsed() < self.reconnect_policy.cooldown {
                    return Err(Error::new(
                        crate::error::ErrorKind::Cancelled,
                        "reconnect cooldown has not elapsed",
                    ));
                }
            }
            *last_attempt = Some(Instant::now());
        }

        self.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
        tracing::info!(address = %self.address, attempt = attempts + 1, "attempting bridge reconnect");
        self.disconnect().await;
        self.connect().await
    }

    pub fn info(&self) -> BridgeInfo {
        BridgeInfo {
            address: self.address.clone(),
            state: self.state(),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::SeqCst),
            pty: self.pty.lock().unwrap().info(),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex as StdMutex;

    pub struct FakeGattTransport {
        pub fail_connect: StdMutex<bool>,
        pub sent: StdMutex<Vec<Vec<u8>>>,
        pub data_callback: StdMutex<Option<crate::gatt_link::DataCallback>>,
        pub state: StdMutex<LinkState>,
    }

    impl Default for FakeGattTransport {
        fn default() -> Self {
            FakeGattTransport {
                fail_connect: StdMutex::new(false),
                sent: StdMutex::new(Vec::new()),
                data_callback: StdMutex::new(None),
                state: StdMutex::new(LinkState::Idle),
            }
        }
    }

    impl FakeGattTransport {
        pub fn emit(&self, data: Vec<u8>) {
            if let Some(cb) = self.data_callback.lock().unwrap().as_ref() {
                cb(data);
            }
        }
    }

    #[async_trait::async_trait]
    impl GattTransport for FakeGattTransport {
        async fn connect(&self) -> Result<(), Error> {
            if *self.fail_connect.lock().unwrap() {
                return Err(Error::new(crate::error::ErrorKind::Transport, "boom"));
            }
            *self.state.lock().unwrap() = LinkState::Connected;
            Ok(())
        }

        async fn disconnect(&self) {
            *self.state.lock().unwrap() = LinkState::Idle;
        }

        fn send(&self, data: Vec<u8>) -> bool {
            self.sent.lock().unwrap().push(data);
            true
        }

        fn set_data_callback(&self, callback: crate::gatt_link::DataCallback) {
            *self.data_callback.lock().unwrap() = Some(callback);
        }

        fn set_connection_callbacks(
            &self,
            _established: crate::gatt_link::StateCallback,
            _lost: crate::gatt_link::StateCallback,
            _pairing: crate::gatt_link::PairingCallback,
        ) {
        }

        fn state(&self) -> LinkState {
            *self.state.lock().unwrap()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeGattTransport;
    use super::*;

    #[tokio::test]
    async fn connect_transitions_to_connected_on_success() {
        let address = Address::new("AA:BB:CC:DD:EE:10");
        let bridge = DeviceBridgeGeneric::new(address, FakeGattTransport::default(), ReconnectPolicy::default());
        bridge.connect().await.expect("fake transport always connects");
        assert_eq!(bridge.state(), BridgeState::Connected);
        bridge.disconnect().await;
        assert_eq!(bridge.state(), BridgeState::Disconnected);
    }

    #[tokio::test]
    async fn reconnect_rejected_outside_error_state() {
        let address = Address::new("AA:BB:CC:DD:EE:14");
        let bridge = DeviceBridgeGeneric::new(address, FakeGattTransport::default(), ReconnectPolicy::default());
        bridge.connect().await.expect("fake transport always connects");
        assert_eq!(bridge.state(), BridgeState::Connected);

        let result = bridge.reconnect().await;
        assert!(result.is_err());
        assert_eq!(bridge.reconnect_attempts.load(Ordering::SeqCst), 0);

        bridge.disconnect().await;
    }

    #[tokio::test]
    async fn state_callback_fires_on_every_transition() {
        let address = Address::new("AA:BB:CC:DD:EE:15");
        let bridge = DeviceBridgeGeneric::new(address, FakeGattTransport::default(), ReconnectPolicy::default());

        let seen: Arc<Mutex<Vec<BridgeState>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_for_callback = Arc::clone(&seen);
        bridge.set_state_callback(Box::new(move |state| {
            seen_for_callback.lock().unwrap().push(state);
        }));

        bridge.connect().await.expect("fake transport always connects");
        bridge.disconnect().await;

        assert_eq!(*seen.lock().unwrap(), vec![BridgeState::Connecting, BridgeState::Connected, BridgeState::Disconnected]);
    }

    #[tokio::test]
    async fn reconnect_respects_max_attempts() {
        let address = Address::new("AA:BB:CC:DD:EE:11");
        let transport = FakeGattTransport::default();
        *transport.fail_connect.lock().unwrap() = true;
        let policy = ReconnectPolicy { cooldown: Duration::from_millis(0), max_attempts: 2 };
        let bridge = DeviceBridgeGeneric::new(address, transport, policy);

        let _ = bridge.connect().await;
        assert_eq!(bridge.state(), BridgeState::Error);

        let _ = bridge.reconnect().await;
        let _ = bridge.reconnect().await;
        let third = bridge.reconnect().await;
        assert!(third.is_err());
        assert_eq!(bridge.reconnect_attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn data_written_by_serial_client_reaches_transport() {
        use std::io::Write;

        let address = Address::new("AA:BB:CC:DD:EE:12");
        let bridge = DeviceBridgeGeneric::new(address, FakeGattTransport::default(), ReconnectPolicy::default());
        bridge.connect().await.expect("fake transport always connects");

        let slave_path = bridge.info().pty.slave_path.expect("pty should be open");
        let mut client = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&slave_path)
            .expect("slave should be openable");
        client.write_all(b"AT").unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(bridge.transport().sent.lock().unwrap().as_slice(), &[b"AT".to_vec()]);

        bridge.disconnect().await;
    }

    #[tokio::test]
    async fn data_emitted_by_transport_reaches_serial_client() {
        use std::io::Read;

        let address = Address::new("AA:BB:CC:DD:EE:13");
        let bridge = DeviceBridgeGeneric::new(address, FakeGattTransport::default(), ReconnectPolicy::default());
        bridge.connect().await.expect("fake transport always connects");

        let slave_path = bridge.info().pty.slave_path.expect("pty should be open");
        let mut client = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&slave_path)
            .expect("slave should be openable");

        bridge.transport().emit(b"hello from device".to_vec());

        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).expect("client should receive notified data");
        assert_eq!(&buf[..n], b"hello from device");

        bridge.disconnect().await;
    }
}
