//! The PTY Endpoint: a kernel pseudo-terminal pair presented to local
//! serial clients, pumped on blocking OS threads and bridged to the rest of
//! the crate through plain callbacks.

use std::ffi::CStr;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use nix::pty::openpty;
use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg};

use crate::error::{Error, ErrorKind};

/// Called from the read pump thread with bytes received from the serial
/// client, to be forwarded to the GATT Link.
pub type DataCallback = Box<dyn Fn(Vec<u8>) + Send + Sync>;

/// Called when the endpoint transitions open (`true`) or closed (`false`).
pub type ConnectionCallback = Box<dyn Fn(bool) + Send + Sync>;

const READ_POLL_INTERVAL: Duration = Duration::from_millis(100);
const READ_CHUNK_SIZE: usize = 1024;
const THREAD_JOIN_TIMEOUT: Duration = Duration::from_secs(1);
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A diagnostic snapshot of a [`PtyEndpoint`], mirroring the shape used by
/// `BridgeService::info()`/`DeviceBridge::info()`.
#[derive(Debug, Clone)]
pub struct PtyInfo {
    pub device_name: String,
    pub slave_path: Option<PathBuf>,
    pub symlink_path: PathBuf,
    pub is_open: bool,
}

struct Inner {
    master: OwnedFd,
    slave_path: PathBuf,
}

/// A pseudo-terminal endpoint: `open()` allocates the PTY pair and starts the
/// read/write pump threads; `close()` tears both down and removes the
/// symlink. Not reusable across an open/close cycle — construct a new
/// `PtyEndpoint` per connection, matching per-bridge lifetime.
pub struct PtyEndpoint {
    device_name: String,
    symlink_path: PathBuf,
    inner: Option<Inner>,
    write_tx: Option<Sender<Vec<u8>>>,
    running: Arc<AtomicBool>,
    read_handle: Option<JoinHandle<()>>,
    write_handle: Option<JoinHandle<()>>,
    data_callback: Arc<Mutex<Option<DataCallback>>>,
    connection_callback: Arc<Mutex<Option<ConnectionCallback>>>,
}

impl PtyEndpoint {
    /// Creates an unopened endpoint. `device_name` feeds the friendly
    /// symlink name `/tmp/cu.<device_name>`.
    pub fn new(device_name: impl Into<String>) -> Self {
        let device_name = device_name.into();
        let symlink_path = PathBuf::from(format!("/tmp/cu.{device_name}"));
        PtyEndpoint {
            device_name,
            symlink_path,
            inner: None,
            write_tx: None,
            running: Arc::new(AtomicBool::new(false)),
            read_handle: None,
            write_handle: None,
            data_callback: Arc::new(Mutex::new(None)),
            connection_callback: Arc::new(Mutex::new(None)),
        }
    }

    /// Registers the callback invoked with data read from the serial
    /// client. Must be called before [`open`](Self::open) to see early
    /// traffic, though it is safe to call at any time.
    pub fn set_data_callback(&self, callback: DataCallback) {
        *self.data_callback.lock().unwrap() = Some(callback);
    }

    /// Registers the callback invoked when the endpoint opens or closes.
    pub fn set_connection_callback(&self, callback: ConnectionCallback) {
        *self.connection_callback.lock().unwrap() = Some(callback);
    }

    /// Allocates the PTY pair, configures the slave for raw mode, creates
    /// the friendly symlink, and starts the read/write pump threads.
    pub fn open(&mut self) -> Result<(), Error> {
        if self.inner.is_some() {
            return Ok(());
        }

        let pty = openpty(None, None).map_err(Error::from)?;
        let slave_path = slave_path_of(&pty.master)?;

        let mut termios = tcgetattr(&pty.slave).map_err(Error::from)?;
        cfmakeraw(&mut termios);
        tcsetattr(&pty.slave, SetArg::TCSANOW, &termios).map_err(Error::from)?;
        drop(pty.slave);

        create_symlink(&slave_path, &self.symlink_path);

        let (write_tx, write_rx) = std::sync::mpsc::channel::<Vec<u8>>();
        self.running.store(true, Ordering::SeqCst);

        let read_master = unsafe { File::from_raw_fd(nix::libc::dup(pty.master.as_raw_fd())) };
        let write_master = unsafe { File::from_raw_fd(nix::libc::dup(pty.master.as_raw_fd())) };

        let running = Arc::clone(&self.running);
        let data_callback = Arc::clone(&self.data_callback);
        let read_handle = std::thread::spawn(move || read_pump(read_master, running, data_callback));

        let running = Arc::clone(&self.running);
        let write_tx_for_requeue = write_tx.clone();
        let write_handle =
            std::thread::spawn(move || write_pump(write_master, write_rx, write_tx_for_requeue, running));

        self.inner = Some(Inner { master: pty.master, slave_path });
        self.write_tx = Some(write_tx);
        self.read_handle = Some(read_handle);
        self.write_handle = Some(write_handle);

        if let Some(cb) = self.connection_callback.lock().unwrap().as_ref() {
            cb(true);
        }
        tracing::info!(device = %self.device_name, path = ?self.inner.as_ref().unwrap().slave_path, "pty endpoint opened");
        Ok(())
    }

    /// Stops the pump threads, closes the PTY, and removes the symlink.
    /// Idempotent.
    pub fn close(&mut self) {
        if self.inner.is_none() {
            return;
        }

        self.running.store(false, Ordering::SeqCst);
        self.write_tx = None;

        if let Some(handle) = self.read_handle.take() {
            let _ = join_with_timeout(handle, THREAD_JOIN_TIMEOUT);
        }
        if let Some(handle) = self.write_handle.take() {
            let _ = join_with_timeout(handle, THREAD_JOIN_TIMEOUT);
        }

        self.inner = None;
        remove_symlink(&self.symlink_path);

        if let Some(cb) = self.connection_callback.lock().unwrap().as_ref() {
            cb(false);
        }
        tracing::info!(device = %self.device_name, "pty endpoint closed");
    }

    /// Queues `data` to be written to the serial client. Returns `false` if
    /// the endpoint is not open.
    pub fn send(&self, data: Vec<u8>) -> bool {
        match &self.write_tx {
            Some(tx) => tx.send(data).is_ok(),
            None => false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    pub fn info(&self) -> PtyInfo {
        PtyInfo {
            device_name: self.device_name.clone(),
            slave_path: self.inner.as_ref().map(|i| i.slave_path.clone()),
            symlink_path: self.symlink_path.clone(),
            is_open: self.is_open(),
        }
    }
}

impl Drop for PtyEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}

fn slave_path_of(master: &OwnedFd) -> Result<PathBuf, Error> {
    let name = unsafe {
        let ptr = nix::libc::ptsname(master.as_raw_fd());
        if ptr.is_null() {
            return Err(Error::new(ErrorKind::Resource, "ptsname returned null"));
        }
        CStr::from_ptr(ptr).to_string_lossy().into_owned()
    };
    Ok(PathBuf::from(name))
}

fn create_symlink(target: &Path, link: &Path) {
    remove_symlink(link);
    if let Err(err) = std::os::unix::fs::symlink(target, link) {
        tracing::warn!(%err, target = ?target, link = ?link, "could not create pty symlink");
    } else {
        tracing::info!(target = ?target, link = ?link, "created pty symlink");
    }
}

fn remove_symlink(link: &Path) {
    if link.symlink_metadata().is_ok() {
        let _ = std::fs::remove_file(link);
    }
}

fn read_pump(mut master: File, running: Arc<AtomicBool>, data_callback: Arc<Mutex<Option<DataCallback>>>) {
    tracing::debug!("pty read pump started");
    let mut buf = [0u8; READ_CHUNK_SIZE];
    set_nonblocking(&master);
    while running.load(Ordering::SeqCst) {
        match master.read(&mut buf) {
            Ok(0) => std::thread::sleep(READ_POLL_INTERVAL),
            Ok(n) => {
                if let Some(cb) = data_callback.lock().unwrap().as_ref() {
                    cb(buf[..n].to_vec());
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(READ_POLL_INTERVAL);
            }
            Err(err) if err.raw_os_error() == Some(nix::libc::EIO) => {
                tracing::debug!("pty read pump: client side closed, stopping");
                break;
            }
            Err(err) => {
                tracing::debug!(%err, "pty read pump stopping");
                break;
            }
        }
    }
    tracing::debug!("pty read pump stopped");
}

fn write_pump(mut master: File, rx: std::sync::mpsc::Receiver<Vec<u8>>, tx: Sender<Vec<u8>>, running: Arc<AtomicBool>) {
    tracing::debug!("pty write pump started");
    while running.load(Ordering::SeqCst) {
        match rx.recv_timeout(READ_POLL_INTERVAL) {
            Ok(data) => match master.write_all(&data) {
                Ok(()) => {}
                Err(err) if err.raw_os_error() == Some(nix::libc::EIO) => {
                    tracing::debug!("pty write pump: no client attached, re-queuing chunk");
                    std::thread::sleep(READ_POLL_INTERVAL);
                    let _ = tx.send(data);
                }
                Err(err) => {
                    tracing::warn!(%err, "pty write pump error");
                }
            },
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    tracing::debug!("pty write pump stopped");
}

fn set_nonblocking(file: &File) {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    if let Ok(flags) = fcntl(file.as_raw_fd(), FcntlArg::F_GETFL) {
        let _ = fcntl(
            file.as_raw_fd(),
            FcntlArg::F_SETFL(OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK),
        );
    }
}

/// Waits up to `timeout` for `handle` to finish, polling
/// [`JoinHandle::is_finished`]. If the deadline passes first the thread is
/// left to finish on its own in the background (it was already told to stop
/// via the `running` flag before this is called).
fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration) -> std::thread::Result<()> {
    let deadline = std::time::Instant::now() + timeout;
    while !handle.is_finished() {
        if std::time::Instant::now() >= deadline {
            tracing::warn!("pty pump thread did not stop within timeout, detaching");
            return Ok(());
        }
        std::thread::sleep(JOIN_POLL_INTERVAL);
    }
    handle.join()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    #[test]
    fn open_creates_slave_path_and_symlink() {
        let mut endpoint = PtyEndpoint::new("RNode-TEST01");
        endpoint.open().expect("open should succeed under test");
        let info = endpoint.info();
        assert!(info.is_open);
        assert!(info.slave_path.is_some());
        assert!(info.symlink_path.symlink_metadata().is_ok());
        endpoint.close();
        assert!(!endpoint.info().is_open);
        assert!(info.symlink_path.symlink_metadata().is_err());
    }

    #[test]
    fn data_written_by_client_reaches_callback() {
        let mut endpoint = PtyEndpoint::new("RNode-TEST02");
        let (tx, rx) = channel::<Vec<u8>>();
        endpoint.set_data_callback(Box::new(move |data| {
            let _ = tx.send(data);
        }));
        endpoint.open().expect("open should succeed under test");

        let slave_path = endpoint.info().slave_path.unwrap();
        let mut client = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(slave_path)
            .expect("slave should be openable");
        client.write_all(b"hello").unwrap();

        let received = rx.recv_timeout(Duration::from_secs(2)).expect("callback should fire");
        assert_eq!(received, b"hello");
        endpoint.close();
    }

    #[test]
    fn send_before_open_returns_false() {
        let endpoint = PtyEndpoint::new("RNode-TEST03");
        assert!(!endpoint.send(vec![1, 2, 3]));
    }
}
