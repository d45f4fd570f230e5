//! Black-box tests against the public PTY Endpoint API: data flow over a
//! real pseudo-terminal pair and cleanup on shutdown, exercised the way an
//! embedding application would (no access to crate-internal fakes).

use std::io::{Read, Write};

use rnode_ble_bridge::PtyEndpoint;

#[test]
fn two_endpoints_stay_isolated_and_clean_up_on_drop() {
    let mut first = PtyEndpoint::new("RNode-ITEST01");
    let mut second = PtyEndpoint::new("RNode-ITEST02");
    first.open().expect("first endpoint should open");
    second.open().expect("second endpoint should open");

    let first_symlink = first.info().symlink_path;
    let second_symlink = second.info().symlink_path;
    assert!(first_symlink.symlink_metadata().is_ok());
    assert!(second_symlink.symlink_metadata().is_ok());
    assert_ne!(first.info().slave_path, second.info().slave_path);

    let first_slave = first.info().slave_path.unwrap();
    let mut first_client =
        std::fs::OpenOptions::new().read(true).write(true).open(&first_slave).expect("slave should open");

    first.send(b"only for first".to_vec());
    let mut buf = [0u8; 64];
    let n = first_client.read(&mut buf).expect("first client should receive its own data");
    assert_eq!(&buf[..n], b"only for first");

    drop(first);
    drop(second);
    assert!(first_symlink.symlink_metadata().is_err());
    assert!(second_symlink.symlink_metadata().is_err());
}

#[test]
fn reopening_after_close_creates_a_fresh_slave() {
    let mut endpoint = PtyEndpoint::new("RNode-ITEST03");
    endpoint.open().expect("should open");
    let first_slave = endpoint.info().slave_path.unwrap();
    endpoint.close();
    assert!(!endpoint.info().is_open);

    endpoint.open().expect("should reopen");
    let second_slave = endpoint.info().slave_path.unwrap();
    assert!(endpoint.info().is_open);

    let mut client = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&second_slave)
        .expect("reopened slave should be usable");
    client.write_all(b"AT\r\n").unwrap();

    let _ = first_slave;
    endpoint.close();
}

#[test]
fn send_after_close_returns_false_without_panicking() {
    let mut endpoint = PtyEndpoint::new("RNode-ITEST04");
    endpoint.open().expect("should open");
    endpoint.close();
    assert!(!endpoint.send(b"late data".to_vec()));
}
