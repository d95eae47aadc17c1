//! Socket-like connection API.
//!
//! # Architecture
//!
//! ```text
//!  Application
//!      │  send / recv / close / state / stats
//!      ▼
//!  Connection ── Command (mpsc) ──▶ driver task
//!      │                              ├── Tcb     (all protocol state)
//!      │                              ├── Timers  (expiries via mpsc)
//!      │                              └── Socket  (segments in and out)
//!      │
//!      └── RecvBuffer (shared; Mutex + Notify) ◀── in-order bytes
//! ```
//!
//! One [`Endpoint`] carries one connection.  An active open is
//! [`Endpoint::connect`]; a passive one is [`Endpoint::listen`] followed by
//! [`Listener::accept`], which pins the connection to the first peer whose
//! SYN arrives.
//!
//! The driver owns the [`Tcb`] exclusively.  The application never touches
//! protocol state directly; it sends commands and reads from the shared
//! receive buffer.  Dropping a [`Connection`] without closing it aborts the
//! connection.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

use crate::config::{ConfigError, ConnConfig};
use crate::segment::{flags, Segment, SegmentError};
use crate::simulator::{Channel, Perfect};
use crate::socket::{Socket, SocketError};
use crate::state::ConnectionState;
use crate::stats::{Metrics, StatsSnapshot};
use crate::tcb::{RecvBuffer, Tcb, TimerKey};
use crate::timer::Expired;

#[derive(Debug, Error)]
pub enum ConnError {
    #[error("handshake did not complete in time")]
    HandshakeTimeout,
    #[error("no peer connected in time")]
    AcceptTimeout,
    #[error("teardown did not complete in time; connection forced closed")]
    CloseTimeout,
    #[error("peer stopped acknowledging; connection aborted")]
    PeerUnresponsive,
    #[error("operation not allowed in state {0}")]
    NotConnected(ConnectionState),
    #[error("connection is closed")]
    Closed,
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error(transparent)]
    Segment(#[from] SegmentError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug)]
enum Command {
    Send {
        data: Vec<u8>,
        reply: oneshot::Sender<Result<usize, ConnError>>,
    },
    Close,
    Drained,
    Abort,
}

/// State shared between the handle and its driver.
#[derive(Debug)]
struct Shared {
    recv: Arc<RecvBuffer>,
    metrics: Arc<Metrics>,
    peer: OnceLock<SocketAddr>,
    /// Why the driver gave up, reported once to the application.
    failure: Mutex<Option<ConnError>>,
}

impl Shared {
    fn fail(&self, err: ConnError) {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert(err);
    }

    fn take_failure(&self) -> Option<ConnError> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

// ---------------------------------------------------------------------------
// Endpoint / Listener
// ---------------------------------------------------------------------------

/// A bound socket that has not yet become a connection.
#[derive(Debug)]
pub struct Endpoint {
    socket: Socket,
    config: ConnConfig,
    metrics: Arc<Metrics>,
}

impl Endpoint {
    /// Bind `addr` over a transparent channel.
    pub async fn bind(addr: SocketAddr, config: ConnConfig) -> Result<Self, ConnError> {
        Self::bind_with(addr, config, Arc::new(Perfect)).await
    }

    /// Bind `addr`; every outgoing segment passes through `channel`.
    pub async fn bind_with(
        addr: SocketAddr,
        config: ConnConfig,
        channel: Arc<dyn Channel>,
    ) -> Result<Self, ConnError> {
        config.validate()?;
        let socket = Socket::bind_with(addr, channel).await?;
        let metrics = Metrics::new(format!("conn {}", socket.local_addr));
        Ok(Self {
            socket,
            config,
            metrics,
        })
    }

    /// Record statistics (and prefix log lines) under `metrics` instead.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr
    }

    /// Active open.  Resolves once the handshake completes.
    pub async fn connect(self, peer: SocketAddr) -> Result<Connection, ConnError> {
        let wait = self.config.handshake_timeout;
        let conn = Connection::spawn(self, Some(peer));
        match conn.wait_until(wait, |s| s.is_synchronized() || *s == ConnectionState::Closed).await {
            Some(state) if state.is_synchronized() => Ok(conn),
            _ => {
                log::warn!("[{}] handshake with {peer} timed out", conn.shared.metrics.name());
                Err(ConnError::HandshakeTimeout)
            }
        }
    }

    /// Passive open.
    pub fn listen(self) -> Listener {
        let wait = self.config.accept_timeout;
        Listener {
            conn: Connection::spawn(self, None),
            wait,
        }
    }
}

/// A passive endpoint waiting for its peer.
#[derive(Debug)]
pub struct Listener {
    conn: Connection,
    wait: Duration,
}

impl Listener {
    pub fn local_addr(&self) -> SocketAddr {
        self.conn.local_addr
    }

    /// Wait up to `accept_timeout` for a peer to complete the handshake.
    pub async fn accept(self) -> Result<Connection, ConnError> {
        let conn = self.conn;
        match conn
            .wait_until(self.wait, |s| s.is_synchronized() || *s == ConnectionState::Closed)
            .await
        {
            Some(state) if state.is_synchronized() => Ok(conn),
            _ => Err(ConnError::AcceptTimeout),
        }
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// Handle to a connection whose protocol runs in a driver task.
#[derive(Debug)]
pub struct Connection {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    recv_timeout: Duration,
    close_timeout: Duration,
}

impl Connection {
    fn spawn(endpoint: Endpoint, peer: Option<SocketAddr>) -> Self {
        let Endpoint {
            socket,
            config,
            metrics,
        } = endpoint;
        let local_addr = socket.local_addr;
        let recv = Arc::new(RecvBuffer::new(config.recv_buffer));
        let shared = Arc::new(Shared {
            recv: Arc::clone(&recv),
            metrics: Arc::clone(&metrics),
            peer: OnceLock::new(),
            failure: Mutex::new(None),
        });

        let (timer_tx, expiries) = mpsc::unbounded_channel();
        let iss: u32 = rand::rng().random();
        let mut tcb = Tcb::new(&config, iss, local_addr.port(), recv, timer_tx, metrics);
        match peer {
            Some(peer) => {
                let _ = shared.peer.set(peer);
                tcb.set_peer_port(peer.port());
                tcb.open();
            }
            None => tcb.listen(),
        }

        let (state_tx, state) = watch::channel(tcb.state());
        let (commands, command_rx) = mpsc::unbounded_channel();
        let driver = Driver {
            name: shared.metrics.name().to_owned(),
            socket,
            tcb,
            shared: Arc::clone(&shared),
            commands: command_rx,
            expiries,
            state: state_tx,
            detached: false,
        };
        tokio::spawn(driver.run());

        Self {
            commands,
            state,
            shared,
            local_addr,
            recv_timeout: config.recv_timeout,
            close_timeout: config.close_timeout,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.metrics.snapshot()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The peer, once known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer.get().copied()
    }

    /// `true` once the peer closed its side and every byte was read.
    pub fn at_eof(&self) -> bool {
        self.shared.recv.is_finished()
    }

    /// Queue `data` for reliable delivery; returns the bytes accepted.
    pub async fn send(&self, data: &[u8]) -> Result<usize, ConnError> {
        if matches!(self.state(), ConnectionState::TimeWait | ConnectionState::Closed) {
            return Err(self.gone());
        }
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Send {
                data: data.to_vec(),
                reply,
            })
            .map_err(|_| self.gone())?;
        rx.await.map_err(|_| self.gone())?
    }

    /// Read up to `max` bytes, waiting at most `recv_timeout`.
    ///
    /// An empty result means the wait elapsed or the stream ended; tell
    /// them apart with [`at_eof`](Self::at_eof).
    pub async fn recv(&self, max: usize) -> Result<Vec<u8>, ConnError> {
        let data = self.shared.recv.read(max, self.recv_timeout).await;
        if data.is_empty() {
            if let Some(err) = self.shared.take_failure() {
                return Err(err);
            }
            return Ok(data);
        }
        self.shared.metrics.record_delivered(data.len());
        let _ = self.commands.send(Command::Drained);
        Ok(data)
    }

    /// Orderly close, bounded by `close_timeout`.
    ///
    /// Returns once this side is done: `Closed`, or `TimeWait` when it
    /// closed first.  TIME_WAIT then runs out in the background, even if
    /// the `Connection` is dropped.  On expiry the connection is forced
    /// closed and [`ConnError::CloseTimeout`] is returned.
    pub async fn close(&self) -> Result<(), ConnError> {
        let _ = self.commands.send(Command::Close);
        let closed = self
            .wait_until(self.close_timeout, |s| {
                matches!(s, ConnectionState::TimeWait | ConnectionState::Closed)
            })
            .await;
        if let Some(err) = self.shared.take_failure() {
            return Err(err);
        }
        match closed {
            Some(_) => Ok(()),
            None => {
                log::warn!("[{}] close timed out in {}", self.shared.metrics.name(), self.state());
                let _ = self.commands.send(Command::Abort);
                Err(ConnError::CloseTimeout)
            }
        }
    }

    /// Tear the connection down without a FIN exchange.
    pub fn abort(&self) {
        let _ = self.commands.send(Command::Abort);
    }

    async fn wait_until(
        &self,
        wait: Duration,
        done: impl FnMut(&ConnectionState) -> bool,
    ) -> Option<ConnectionState> {
        let mut state = self.state.clone();
        let reached = match tokio::time::timeout(wait, state.wait_for(done)).await {
            Ok(Ok(reached)) => Some(*reached),
            _ => None,
        };
        reached
    }

    fn gone(&self) -> ConnError {
        self.shared.take_failure().unwrap_or(ConnError::Closed)
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

struct Driver {
    name: String,
    socket: Socket,
    tcb: Tcb,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    expiries: mpsc::UnboundedReceiver<Expired<TimerKey>>,
    state: watch::Sender<ConnectionState>,
    /// The owning `Connection` is gone while TIME_WAIT runs out.
    detached: bool,
}

impl Driver {
    async fn run(mut self) {
        loop {
            if let Err(e) = self.transmit().await {
                log::error!("[{}] transmit failed: {e}", self.name);
                self.tcb.abort();
                self.shared.fail(e);
            }
            let current = self.tcb.state();
            self.state.send_if_modified(|published| {
                let changed = *published != current;
                *published = current;
                changed
            });
            if current == ConnectionState::Closed {
                break;
            }

            tokio::select! {
                command = self.commands.recv(), if !self.detached => self.on_command(command),

                received = self.socket.recv_from() => match received {
                    Ok((bytes, from)) => self.on_datagram(&bytes, from),
                    // ICMP port-unreachable surfaces as a read error on some
                    // platforms; the protocol's timers handle the peer.
                    Err(SocketError::Io(e)) if matches!(
                        e.kind(),
                        std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionRefused
                    ) => {
                        log::debug!("[{}] ignoring socket error: {e}", self.name);
                    }
                    Err(e) => {
                        log::error!("[{}] socket failed: {e}", self.name);
                        self.tcb.abort();
                        self.shared.fail(e.into());
                    }
                },

                Some(event) = self.expiries.recv() => {
                    if let Err(e) = self.tcb.on_timer(event) {
                        self.shared.fail(e);
                    }
                }
            }
        }
        log::debug!("[{}] driver stopped", self.name);
    }

    fn on_command(&mut self, command: Option<Command>) {
        match command {
            Some(Command::Send { data, reply }) => {
                let _ = reply.send(self.tcb.queue(&data));
            }
            Some(Command::Close) => self.tcb.close(),
            Some(Command::Drained) => self.tcb.on_drained(),
            None if self.tcb.state() == ConnectionState::TimeWait => {
                log::debug!("[{}] handle dropped; lingering in TIME_WAIT", self.name);
                self.detached = true;
            }
            Some(Command::Abort) | None => self.tcb.abort(),
        }
    }

    fn on_datagram(&mut self, bytes: &[u8], from: SocketAddr) {
        let seg = match Segment::decode(bytes) {
            Ok(seg) => seg,
            Err(e) => {
                self.shared.metrics.record_corrupted();
                log::debug!("[{}] ← discarding datagram from {from}: {e}", self.name);
                return;
            }
        };

        match self.shared.peer.get() {
            Some(peer) if *peer == from => self.tcb.on_segment(seg),
            Some(_) => log::debug!("[{}] ← ignoring segment from stranger {from}", self.name),
            None if seg.header.has(flags::SYN) && !seg.header.has(flags::ACK) => {
                log::info!("[{}] ← SYN from {from}", self.name);
                let _ = self.shared.peer.set(from);
                self.tcb.set_peer_port(seg.header.src_port);
                self.tcb.on_segment(seg);
            }
            None => log::debug!("[{}] ← no peer yet; ignoring non-SYN from {from}", self.name),
        }
    }

    async fn transmit(&mut self) -> Result<(), ConnError> {
        let outbox = self.tcb.take_outbox();
        let Some(&peer) = self.shared.peer.get() else {
            return Ok(());
        };
        for seg in outbox {
            log::debug!(
                "[{}] → seq={} ack={} flags={:#05b} win={} len={}",
                self.name,
                seg.header.seq,
                seg.header.ack,
                seg.header.flags,
                seg.header.window,
                seg.payload.len()
            );
            self.socket.send_to(seg.encode()?, peer).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn handshake_then_echo() {
        let server = Endpoint::bind(loopback(), ConnConfig::default()).await.unwrap();
        let addr = server.local_addr();
        let listener = server.listen();
        let accept = tokio::spawn(listener.accept());

        let client = Endpoint::bind(loopback(), ConnConfig::default())
            .await
            .unwrap()
            .connect(addr)
            .await
            .unwrap();
        let server = accept.await.unwrap().unwrap();
        assert_eq!(client.state(), ConnectionState::Established);
        assert_eq!(server.peer_addr(), Some(client.local_addr()));

        assert_eq!(client.send(b"ping").await.unwrap(), 4);
        assert_eq!(server.recv(16).await.unwrap(), b"ping");
        server.send(b"pong").await.unwrap();
        assert_eq!(client.recv(16).await.unwrap(), b"pong");
    }

    #[tokio::test]
    async fn send_after_close_is_refused() {
        let server = Endpoint::bind(loopback(), ConnConfig::default()).await.unwrap();
        let addr = server.local_addr();
        let accept = tokio::spawn(server.listen().accept());
        let client = Endpoint::bind(loopback(), ConnConfig::default())
            .await
            .unwrap()
            .connect(addr)
            .await
            .unwrap();
        let server = accept.await.unwrap().unwrap();

        let closing = tokio::spawn(async move {
            client.close().await.unwrap();
            client
        });
        // Passive side sees EOF, then closes too.
        while !server.at_eof() {
            server.recv(16).await.unwrap();
        }
        server.close().await.unwrap();
        let client = closing.await.unwrap();

        assert!(matches!(
            client.state(),
            ConnectionState::TimeWait | ConnectionState::Closed
        ));
        assert!(matches!(client.send(b"x").await, Err(ConnError::Closed)));
    }

    #[tokio::test]
    async fn accept_gives_up_without_a_peer() {
        let config = ConnConfig {
            accept_timeout: Duration::from_millis(100),
            ..ConnConfig::default()
        };
        let listener = Endpoint::bind(loopback(), config).await.unwrap().listen();
        assert!(matches!(listener.accept().await, Err(ConnError::AcceptTimeout)));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_at_bind() {
        let config = ConnConfig {
            mss: 0,
            ..ConnConfig::default()
        };
        let err = Endpoint::bind(loopback(), config).await.unwrap_err();
        assert!(matches!(err, ConnError::Config(ConfigError::Zero("mss"))));
    }
}
