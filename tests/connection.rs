use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use evtcp::{ConnStatus, EventLoop, LoopHandle, TcpConnection, TcpConnectionPtr};

/// Opt-in engine logs for a test run: `RUST_LOG=evtcp=trace cargo test`.
fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .ok();
}

fn start_loop() -> LoopHandle {
    let mut event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();
    thread::spawn(move || event_loop.run());
    handle
}

/// Build a server-side connection and a plain blocking client peer over
/// loopback. The caller installs callbacks, then calls
/// `connect_established`.
fn establish(handle: &LoopHandle) -> (TcpConnectionPtr, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).unwrap();
    let (server_stream, _) = listener.accept().unwrap();
    let conn = TcpConnection::new(handle.clone(), server_stream).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    (conn, client)
}

fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

/// Read until `expected` bytes arrive, treating a reset as end of stream.
fn read_exactly(client: &mut TcpStream, expected: usize) -> Vec<u8> {
    let mut received = Vec::with_capacity(expected);
    let mut chunk = vec![0u8; 64 * 1024];
    while received.len() < expected {
        match client.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => received.extend_from_slice(&chunk[..n]),
            Err(err) if err.kind() == ErrorKind::ConnectionReset => break,
            Err(err) => panic!("client read failed: {err}"),
        }
    }
    received
}

fn temp_file(tag: &str, contents: &[u8]) -> PathBuf {
    let path = std::env::temp_dir().join(format!("evtcp-{}-{}", tag, std::process::id()));
    std::fs::write(&path, contents).unwrap();
    path
}

#[test]
fn echo_round_trip() {
    let handle = start_loop();
    let (conn, mut client) = establish(&handle);
    let messages = Arc::new(AtomicUsize::new(0));
    let seen = messages.clone();
    conn.set_message_callback(move |conn, buf| {
        seen.fetch_add(1, Ordering::SeqCst);
        let text = String::from_utf8(buf.read_all()).unwrap();
        conn.send(text.to_uppercase());
    });
    conn.connect_established();

    client.write_all(b"hello").unwrap();
    let mut reply = [0u8; 5];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"HELLO");
    assert_eq!(messages.load(Ordering::SeqCst), 1);
    handle.quit();
}

#[test]
fn sends_before_establishing_are_dropped() {
    let handle = start_loop();
    let (conn, mut client) = establish(&handle);
    conn.send("early");
    conn.connect_established();
    conn.send("X");

    let mut reply = [0u8; 1];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"X");
    // nothing else may arrive
    client
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    let mut extra = [0u8; 1];
    match client.read(&mut extra) {
        Ok(0) => {}
        Ok(n) => panic!("unexpected {} extra bytes", n),
        Err(err) => assert!(matches!(
            err.kind(),
            ErrorKind::WouldBlock | ErrorKind::TimedOut
        )),
    }
    handle.quit();
}

#[test]
fn interleaved_sends_keep_wire_order() {
    let handle = start_loop();
    let (conn, mut client) = establish(&handle);
    conn.connect_established();

    let body: Vec<u8> = (0..128 * 1024).map(|i| (i % 251) as u8).collect();
    let path = temp_file("order", &body);

    conn.send("A");
    conn.send_file(&path, 0, 0);
    conn.send("B");

    let expected_len = 1 + body.len() + 1;
    let received = read_exactly(&mut client, expected_len);
    assert_eq!(received.len(), expected_len);
    assert_eq!(received[0], b'A');
    assert_eq!(&received[1..1 + body.len()], body.as_slice());
    assert_eq!(received[expected_len - 1], b'B');

    std::fs::remove_file(&path).ok();
    handle.quit();
}

#[test]
fn file_send_respects_offset_and_length() {
    let handle = start_loop();
    let (conn, mut client) = establish(&handle);
    conn.connect_established();

    let body: Vec<u8> = (0..4096).map(|i| (i % 239) as u8).collect();
    let path = temp_file("range", &body);

    conn.send_file(&path, 1024, 512);
    let received = read_exactly(&mut client, 512);
    assert_eq!(received, &body[1024..1536]);

    std::fs::remove_file(&path).ok();
    handle.quit();
}

#[test]
fn high_water_mark_fires_and_queue_drains() {
    init_logging();
    let handle = start_loop();
    let (conn, mut client) = establish(&handle);

    const MARK: u64 = 64 * 1024;
    const TOTAL: usize = 32 * 1024 * 1024;

    let hwm_hits = Arc::new(AtomicUsize::new(0));
    let hits = hwm_hits.clone();
    conn.set_high_water_mark_callback(
        move |_conn, pending| {
            assert!(pending > MARK);
            hits.fetch_add(1, Ordering::SeqCst);
        },
        MARK,
    );
    let drained = Arc::new(AtomicUsize::new(0));
    let drained_flag = drained.clone();
    conn.set_write_complete_callback(move |_conn| {
        drained_flag.fetch_add(1, Ordering::SeqCst);
    });
    conn.connect_established();

    let payload = vec![0xabu8; TOTAL];
    conn.send(&payload);

    // slow reader: the kernel cannot take 32 MiB, so the mark must trip
    assert!(wait_until(Duration::from_secs(5), || {
        hwm_hits.load(Ordering::SeqCst) > 0
    }));

    let received = read_exactly(&mut client, TOTAL);
    assert_eq!(received.len(), TOTAL);
    assert!(received.iter().all(|&b| b == 0xab));
    assert!(wait_until(Duration::from_secs(5), || {
        drained.load(Ordering::SeqCst) > 0
    }));
    assert_eq!(conn.buffered_bytes(), 0);
    handle.quit();
}

#[test]
fn graceful_shutdown_drains_then_half_closes() {
    init_logging();
    let handle = start_loop();
    let (conn, mut client) = establish(&handle);
    let closes = Arc::new(AtomicUsize::new(0));
    let close_count = closes.clone();
    conn.set_close_callback(move |_conn| {
        close_count.fetch_add(1, Ordering::SeqCst);
    });
    conn.connect_established();

    const TOTAL: usize = 10 * 1024 * 1024;
    conn.send(vec![0x5au8; TOTAL]);
    conn.shutdown();

    // the peer receives every byte, then the FIN
    let mut received = Vec::with_capacity(TOTAL);
    let mut chunk = vec![0u8; 64 * 1024];
    loop {
        match client.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => received.extend_from_slice(&chunk[..n]),
            Err(err) => panic!("client read failed: {err}"),
        }
    }
    assert_eq!(received.len(), TOTAL);

    // closing our side completes the teardown
    drop(client);
    assert!(wait_until(Duration::from_secs(3), || {
        closes.load(Ordering::SeqCst) == 1
    }));
    assert_eq!(conn.status(), ConnStatus::Disconnected);
    handle.quit();
}

#[test]
fn force_close_is_prompt_and_idempotent() {
    let handle = start_loop();
    let (conn, mut client) = establish(&handle);
    let closes = Arc::new(AtomicUsize::new(0));
    let close_count = closes.clone();
    conn.set_close_callback(move |_conn| {
        close_count.fetch_add(1, Ordering::SeqCst);
    });
    conn.connect_established();

    conn.send(vec![0x77u8; 10 * 1024 * 1024]);
    conn.force_close();
    conn.force_close();

    assert!(wait_until(Duration::from_secs(2), || {
        closes.load(Ordering::SeqCst) > 0
    }));
    // dropping the last strong reference releases the socket; partial data
    // on the wire is permitted
    drop(conn);
    let mut chunk = vec![0u8; 64 * 1024];
    loop {
        match client.read(&mut chunk) {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::ConnectionReset => break,
            Err(err) => panic!("client read failed: {err}"),
        }
    }
    // the close fires exactly once
    thread::sleep(Duration::from_millis(200));
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    handle.quit();
}

#[test]
fn bad_file_range_is_dropped_silently() {
    let handle = start_loop();
    let (conn, mut client) = establish(&handle);
    conn.connect_established();

    let body = vec![9u8; 100];
    let path = temp_file("badrange", &body);

    // offset beyond the end: dropped, connection unaffected
    conn.send_file(&path, body.len() as u64 + 1, 0);
    assert!(wait_until(Duration::from_secs(1), || conn.connected()));
    conn.send("X");

    let mut reply = [0u8; 1];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"X");

    std::fs::remove_file(&path).ok();
    handle.quit();
}

#[test]
fn pull_stream_stops_at_producer_eof() {
    let handle = start_loop();
    let (conn, mut client) = establish(&handle);
    conn.connect_established();

    let mut calls = 0;
    conn.send_stream(move |dst| {
        calls += 1;
        if calls <= 2 {
            dst[..16].fill(b'x');
            16
        } else {
            0
        }
    });
    conn.send("after");

    let received = read_exactly(&mut client, 32 + 5);
    assert_eq!(&received[..32], &[b'x'; 32]);
    assert_eq!(&received[32..], b"after");
    handle.quit();
}

#[test]
fn async_stream_orders_ahead_of_later_sends() {
    let handle = start_loop();
    let (conn, mut client) = establish(&handle);
    conn.connect_established();
    assert!(wait_until(Duration::from_secs(1), || conn.connected()));

    let mut stream = conn.send_async_stream();
    stream.send("one");
    // queued behind the open stream, so it must arrive after "two"
    conn.send("tail");
    stream.send("two");
    stream.close();

    let received = read_exactly(&mut client, 10);
    assert_eq!(received, b"onetwotail");

    // a closed stream drops further sends
    stream.send("late");
    client
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    let mut extra = [0u8; 1];
    match client.read(&mut extra) {
        Ok(0) => {}
        Ok(n) => panic!("unexpected {} extra bytes", n),
        Err(err) => assert!(matches!(
            err.kind(),
            ErrorKind::WouldBlock | ErrorKind::TimedOut
        )),
    }
    handle.quit();
}

#[test]
fn peer_close_reports_received_bytes() {
    let handle = start_loop();
    let (conn, mut client) = establish(&handle);
    let closes = Arc::new(AtomicUsize::new(0));
    let close_count = closes.clone();
    conn.set_close_callback(move |_conn| {
        close_count.fetch_add(1, Ordering::SeqCst);
    });
    conn.connect_established();

    client.write_all(b"goodbye").unwrap();
    client.flush().unwrap();
    drop(client);

    assert!(wait_until(Duration::from_secs(2), || {
        closes.load(Ordering::SeqCst) == 1
    }));
    assert_eq!(conn.bytes_received(), 7);
    assert_eq!(conn.status(), ConnStatus::Disconnected);
    handle.quit();
}
