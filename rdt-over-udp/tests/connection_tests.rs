//! Integration tests for the connection protocol.
//!
//! Each test binds real UDP sockets on loopback, runs the server half in a
//! background task, and drives the client from the test body.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rdt_over_udp::{
    config::{ConnConfig, RtoConfig},
    connection::{ConnError, Connection, Endpoint},
    segment::{flags, Segment, HEADER_LEN},
    simulator::{Channel, Fate, Perfect},
    socket::Socket,
    state::ConnectionState,
    stats::Metrics,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// Short timers so lossy tests finish quickly.
fn fast_config() -> ConnConfig {
    ConnConfig {
        rto: RtoConfig {
            initial: Duration::from_millis(200),
            min: Duration::from_millis(50),
            max: Duration::from_secs(2),
        },
        time_wait: Duration::from_millis(100),
        recv_timeout: Duration::from_secs(2),
        ..ConnConfig::default()
    }
}

/// Channel that drops every `n`th datagram carrying payload bytes.
fn drop_every_nth_data_segment(n: usize) -> Arc<dyn Channel> {
    let seen = AtomicUsize::new(0);
    Arc::new(move |datagram: Vec<u8>| -> Fate {
        if datagram.len() > HEADER_LEN && (seen.fetch_add(1, Ordering::Relaxed) + 1) % n == 0 {
            return Fate::Drop;
        }
        Fate::deliver(datagram)
    })
}

/// Channel that drops the first bare ACK sent after this side's FIN, i.e.
/// the acknowledgement of the peer's FIN.  The flag records the drop.
fn drop_ack_of_peer_fin() -> (Arc<dyn Channel>, Arc<AtomicBool>) {
    let fin_sent = AtomicBool::new(false);
    let dropped = Arc::new(AtomicBool::new(false));
    let seen = Arc::clone(&dropped);
    let channel: Arc<dyn Channel> = Arc::new(move |datagram: Vec<u8>| -> Fate {
        if let Ok(seg) = Segment::decode(&datagram) {
            if seg.header.has(flags::FIN) {
                fin_sent.store(true, Ordering::Relaxed);
            } else if fin_sent.load(Ordering::Relaxed)
                && seg.header.flags == flags::ACK
                && seg.payload.is_empty()
                && !seen.swap(true, Ordering::Relaxed)
            {
                return Fate::Drop;
            }
        }
        Fate::deliver(datagram)
    });
    (channel, dropped)
}

/// Establish a connection pair; returns `(client, server)`.
async fn pair(
    client_config: ConnConfig,
    client_channel: Arc<dyn Channel>,
    server_config: ConnConfig,
) -> (Connection, Connection) {
    let server = Endpoint::bind(loopback(), server_config)
        .await
        .unwrap()
        .with_metrics(Metrics::new("server"));
    let addr = server.local_addr();
    let accepting = tokio::spawn(server.listen().accept());

    let client = tokio::time::timeout(
        Duration::from_secs(5),
        Endpoint::bind_with(loopback(), client_config, client_channel)
            .await
            .unwrap()
            .with_metrics(Metrics::new("client"))
            .connect(addr),
    )
    .await
    .expect("client connect timed out")
    .expect("client connect failed");

    let server = tokio::time::timeout(Duration::from_secs(5), accepting)
        .await
        .expect("server accept timed out")
        .expect("server task panicked")
        .expect("server accept failed");
    (client, server)
}

/// Read until the peer's FIN, `chunk` bytes at a time.
async fn read_all(conn: &Connection, chunk: usize, pause: Duration) -> Vec<u8> {
    let mut data = Vec::new();
    while !conn.at_eof() {
        data.extend(conn.recv(chunk).await.expect("recv"));
        if !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
    }
    data
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn handshake_both_sides_reach_established() {
    let (client, server) = pair(fast_config(), Arc::new(Perfect), fast_config()).await;

    assert_eq!(client.state(), ConnectionState::Established);
    assert_eq!(server.state(), ConnectionState::Established);
    assert_eq!(server.peer_addr(), Some(client.local_addr()));
    assert_eq!(client.peer_addr(), Some(server.local_addr()));
}

#[tokio::test]
async fn ten_kilobytes_survive_lost_data_segments() {
    let data = pattern(10 * 1024);
    let (client, server) = pair(fast_config(), drop_every_nth_data_segment(5), fast_config()).await;

    let reading = tokio::spawn(async move {
        let received = read_all(&server, 4096, Duration::ZERO).await;
        server.close().await.expect("server close");
        (received, server)
    });

    assert_eq!(client.send(&data).await.unwrap(), data.len());
    tokio::time::timeout(Duration::from_secs(30), client.close())
        .await
        .expect("client close hung")
        .expect("client close");

    let (received, server) = reading.await.unwrap();
    assert_eq!(received, data);

    let stats = client.stats();
    assert!(stats.retransmissions > 0);
    assert_eq!(stats.bytes_sent, data.len() as u64);
    assert_eq!(server.stats().bytes_received, data.len() as u64);
    assert!(stats.rtt.is_some());
}

#[tokio::test]
async fn connect_to_silent_peer_times_out() {
    // Bound but never answering: the SYN goes nowhere.
    let silent = Socket::bind(loopback()).await.unwrap();
    let config = ConnConfig {
        handshake_timeout: Duration::from_millis(500),
        ..fast_config()
    };

    let started = tokio::time::Instant::now();
    let result = Endpoint::bind(loopback(), config)
        .await
        .unwrap()
        .connect(silent.local_addr)
        .await;

    assert!(matches!(result, Err(ConnError::HandshakeTimeout)));
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn orderly_teardown_closes_both_sides() {
    let (client, server) = pair(fast_config(), Arc::new(Perfect), fast_config()).await;

    client.send(b"last words").await.unwrap();
    let closing = tokio::spawn(async move {
        client.close().await.expect("client close");
        client
    });

    assert_eq!(read_all(&server, 64, Duration::ZERO).await, b"last words");
    server.close().await.expect("server close");

    let client = closing.await.unwrap();
    assert!(matches!(
        client.state(),
        ConnectionState::TimeWait | ConnectionState::Closed
    ));
    assert_eq!(server.state(), ConnectionState::Closed);
    assert!(matches!(client.send(b"more").await, Err(ConnError::Closed)));
}

#[tokio::test]
async fn lost_final_ack_is_repeated_from_time_wait() {
    let (channel, dropped) = drop_ack_of_peer_fin();
    let (client, server) = pair(fast_config(), channel, fast_config()).await;

    client.send(b"done").await.unwrap();
    let closing = tokio::spawn(async move {
        client.close().await.expect("client close");
        client
    });

    assert_eq!(read_all(&server, 64, Duration::ZERO).await, b"done");
    tokio::time::timeout(Duration::from_secs(5), server.close())
        .await
        .expect("server close hung")
        .expect("server close");

    assert!(dropped.load(Ordering::Relaxed));
    assert_eq!(server.state(), ConnectionState::Closed);
    assert!(server.stats().retransmissions > 0);
    drop(closing.await.unwrap());
}

#[tokio::test]
async fn small_receive_buffer_with_slow_reader() {
    let data = pattern(8 * 1024);
    let server_config = ConnConfig {
        mss: 128,
        recv_buffer: 512,
        ..fast_config()
    };
    let client_config = ConnConfig {
        mss: 128,
        ..fast_config()
    };
    let (client, server) = pair(client_config, Arc::new(Perfect), server_config).await;

    let reading = tokio::spawn(async move {
        let received = read_all(&server, 100, Duration::from_millis(2)).await;
        server.close().await.expect("server close");
        received
    });

    client.send(&data).await.unwrap();
    tokio::time::timeout(Duration::from_secs(30), client.close())
        .await
        .expect("client close hung")
        .expect("client close");

    assert_eq!(reading.await.unwrap(), data);
}

#[tokio::test]
async fn bidirectional_exchange() {
    let (client, server) = pair(fast_config(), Arc::new(Perfect), fast_config()).await;

    client.send(b"ping").await.unwrap();
    assert_eq!(server.recv(16).await.unwrap(), b"ping");
    server.send(b"pong").await.unwrap();
    assert_eq!(client.recv(16).await.unwrap(), b"pong");

    let stats = server.stats();
    assert_eq!(stats.delivered, 1);
    assert_eq!(stats.bytes_received, 4);
}
