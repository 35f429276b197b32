use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use nocturne::Server;

fn connect(port: u16) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", port)).expect("connect to test server");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

/// Poll a condition instead of relying on a single fixed sleep.
fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

#[test]
fn ping_pong_three_clients() {
    let mut server = Server::init("127.0.0.1", "0", true, Duration::from_secs(30)).unwrap();
    server
        .start(
            |conn, data| {
                if data == b"ping" {
                    conn.send_data(b"pong").ok();
                }
                true
            },
            2,
        )
        .unwrap();
    let port = server.local_port().unwrap();

    let mut clients: Vec<TcpStream> = (0..3).map(|_| connect(port)).collect();
    for client in &mut clients {
        client.write_all(b"ping").unwrap();
    }
    for client in &mut clients {
        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"pong");
    }

    assert!(wait_until(Duration::from_secs(2), || {
        server.connection_count() == 3
    }));
    server.stop();
}

#[test]
fn callback_false_closes_connection() {
    let mut server = Server::init("127.0.0.1", "0", true, Duration::from_secs(30)).unwrap();
    server.start(|_conn, data| data != b"quit", 2).unwrap();
    let port = server.local_port().unwrap();

    let mut keep1 = connect(port);
    let mut keep2 = connect(port);
    let mut quitter = connect(port);

    keep1.write_all(b"hello").unwrap();
    keep2.write_all(b"hello").unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        server.connection_count() == 3
    }));

    quitter.write_all(b"quit").unwrap();

    // the server closes only the quitter's socket
    let mut buf = [0u8; 8];
    let n = quitter.read(&mut buf).unwrap();
    assert_eq!(n, 0, "expected EOF from a server-closed connection");

    assert!(wait_until(Duration::from_secs(2), || {
        server.connection_count() == 2
    }));
    server.stop();
}

#[test]
fn idle_connection_is_evicted() {
    let callbacks = Arc::new(AtomicUsize::new(0));
    let hit = callbacks.clone();

    let mut server = Server::init("127.0.0.1", "0", true, Duration::from_secs(1)).unwrap();
    server
        .start(
            move |_conn, _data| {
                hit.fetch_add(1, Ordering::SeqCst);
                true
            },
            1,
        )
        .unwrap();
    let port = server.local_port().unwrap();

    let mut client = connect(port);
    assert!(wait_until(Duration::from_secs(2), || {
        server.connection_count() == 1
    }));

    // stay silent past the idle timeout; the server must hang up on us
    let mut buf = [0u8; 8];
    let n = client.read(&mut buf).unwrap();
    assert_eq!(n, 0, "expected EOF after idle eviction");
    assert_eq!(callbacks.load(Ordering::SeqCst), 0);
    assert!(wait_until(Duration::from_secs(2), || {
        server.connection_count() == 0
    }));
    server.stop();
}

#[test]
fn large_send_round_trips() {
    const SIZE: usize = 1 << 20;

    let mut server = Server::init("127.0.0.1", "0", true, Duration::from_secs(30)).unwrap();
    server
        .start(
            |conn, _data| {
                let payload: Vec<u8> = (0..SIZE).map(|i| (i % 251) as u8).collect();
                conn.send_data(&payload).ok();
                true
            },
            1,
        )
        .unwrap();
    let port = server.local_port().unwrap();

    let mut client = connect(port);
    client.write_all(b"big").unwrap();

    // read slowly enough that the server hits partial writes
    let mut received = Vec::with_capacity(SIZE);
    let mut buf = [0u8; 8192];
    while received.len() < SIZE {
        let n = client.read(&mut buf).unwrap();
        assert!(n > 0, "connection closed mid-transfer");
        received.extend_from_slice(&buf[..n]);
    }

    assert_eq!(received.len(), SIZE);
    assert!(
        received
            .iter()
            .enumerate()
            .all(|(i, &b)| b == (i % 251) as u8)
    );
    server.stop();
}

#[test]
fn send_file_round_trips() {
    const SIZE: usize = 64 * 1024;

    let path = std::env::temp_dir().join(format!("nocturne-sendfile-{}", std::process::id()));
    let payload: Vec<u8> = (0..SIZE).map(|i| (i % 239) as u8).collect();
    std::fs::write(&path, &payload).unwrap();

    let mut server = Server::init("127.0.0.1", "0", true, Duration::from_secs(30)).unwrap();
    let file_path = path.clone();
    server
        .start(
            move |conn, _data| {
                conn.send_file(&file_path).ok();
                true
            },
            1,
        )
        .unwrap();
    let port = server.local_port().unwrap();

    let mut client = connect(port);
    client.write_all(b"get").unwrap();

    let mut received = Vec::with_capacity(SIZE);
    let mut buf = [0u8; 8192];
    while received.len() < SIZE {
        let n = client.read(&mut buf).unwrap();
        assert!(n > 0, "connection closed mid-transfer");
        received.extend_from_slice(&buf[..n]);
    }

    assert_eq!(received, payload);
    server.stop();
    std::fs::remove_file(&path).ok();
}

#[test]
fn start_twice_is_rejected() {
    let mut server = Server::init("127.0.0.1", "0", true, Duration::from_secs(30)).unwrap();
    server.start(|_conn, _data| true, 1).unwrap();
    assert!(server.start(|_conn, _data| true, 1).is_err());
    server.stop();
}

#[test]
fn connection_ids_increase() {
    let mut server = Server::init("127.0.0.1", "0", true, Duration::from_secs(30)).unwrap();
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let ids = seen.clone();
    server
        .start(
            move |conn, _data| {
                ids.lock().unwrap().push(conn.id());
                true
            },
            1,
        )
        .unwrap();
    let port = server.local_port().unwrap();

    // strictly sequential sessions so the observed order is deterministic
    for round in 0..3 {
        let mut client = connect(port);
        client.write_all(b"hi").unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            seen.lock().unwrap().len() > round
        }));
        drop(client);
    }

    let ids = seen.lock().unwrap();
    assert_eq!(ids.len(), 3);
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
    server.stop();
}
