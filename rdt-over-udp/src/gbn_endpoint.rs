//! Async Go-Back-N endpoints.
//!
//! # Architecture
//!
//! ```text
//!  Application
//!      │  send(data) / flush(wait) / close()
//!      ▼
//!  GbnSession ── Command (mpsc) ──▶ driver task
//!                                    ├── GbnSender  (window, buffered frames)
//!                                    ├── Timer      (one, for the oldest frame)
//!                                    └── Socket     (DATA out, ACKs in)
//! ```
//!
//! The driver task is the only owner of the window, so an ACK advancing
//! `base` can never race a timeout retransmission.  It multiplexes API
//! commands, inbound ACKs and timer expiries with `tokio::select!`.
//!
//! [`GbnSink`] is the receiving side; it is driven directly by its caller.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{ConfigError, GbnConfig};
use crate::frame::Rejection;
use crate::gbn_receiver::{GbnArrival, GbnReceiver};
use crate::gbn_sender::{AckOutcome, GbnSender};
use crate::socket::{Socket, SocketError};
use crate::stats::{Metrics, StatsSnapshot};
use crate::timer::Timer;

#[derive(Debug, Error)]
pub enum GbnError {
    #[error("GBN driver has stopped")]
    Closed,
    #[error("GBN driver task failed: {0}")]
    Driver(#[from] tokio::task::JoinError),
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Snapshot of the sender's window pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowBounds {
    pub base: u64,
    pub next: u64,
    pub size: usize,
}

#[derive(Debug)]
enum Command {
    Send {
        payload: Vec<u8>,
        reply: oneshot::Sender<bool>,
    },
    Flush {
        reply: oneshot::Sender<()>,
    },
    Window {
        reply: oneshot::Sender<WindowBounds>,
    },
}

/// Handle to a running Go-Back-N sender.
#[derive(Debug)]
pub struct GbnSession {
    commands: mpsc::Sender<Command>,
    driver: JoinHandle<Result<(), GbnError>>,
    metrics: Arc<Metrics>,
    local_addr: SocketAddr,
}

impl GbnSession {
    /// Spawn the driver task for a sender bound to `socket`.
    pub fn start(
        socket: Socket,
        peer: SocketAddr,
        config: GbnConfig,
        metrics: Arc<Metrics>,
    ) -> Result<Self, GbnError> {
        config.validate()?;
        let local_addr = socket.local_addr;
        let (commands, command_rx) = mpsc::channel(64);
        let driver = tokio::spawn(drive(
            socket,
            peer,
            GbnSender::new(config.window_size),
            config.timeout,
            Arc::clone(&metrics),
            command_rx,
        ));
        Ok(Self {
            commands,
            driver,
            metrics,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Offer one payload to the window.
    ///
    /// Returns `Ok(false)` without blocking when the window is full; the
    /// caller decides when to retry.
    pub async fn send(&self, payload: &[u8]) -> Result<bool, GbnError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Send {
                payload: payload.to_vec(),
                reply,
            })
            .await
            .map_err(|_| GbnError::Closed)?;
        rx.await.map_err(|_| GbnError::Closed)
    }

    /// [`send`](Self::send), retrying every `poll` until the window has room.
    pub async fn send_retrying(&self, payload: &[u8], poll: Duration) -> Result<(), GbnError> {
        while !self.send(payload).await? {
            tokio::time::sleep(poll).await;
        }
        Ok(())
    }

    /// Wait until every frame is acknowledged or `wait` elapses.
    ///
    /// Returns `true` when the window drained in time.
    pub async fn flush(&self, wait: Duration) -> Result<bool, GbnError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Flush { reply })
            .await
            .map_err(|_| GbnError::Closed)?;
        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(())) => Ok(true),
            Ok(Err(_)) => Err(GbnError::Closed),
            Err(_elapsed) => Ok(false),
        }
    }

    pub async fn window(&self) -> Result<WindowBounds, GbnError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Window { reply })
            .await
            .map_err(|_| GbnError::Closed)?;
        rx.await.map_err(|_| GbnError::Closed)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.metrics.snapshot()
    }

    /// Stop the driver.  Unacknowledged frames are abandoned; call
    /// [`flush`](Self::flush) first to avoid that.
    pub async fn close(self) -> Result<StatsSnapshot, GbnError> {
        drop(self.commands);
        self.driver.await??;
        Ok(self.metrics.snapshot())
    }
}

async fn drive(
    socket: Socket,
    peer: SocketAddr,
    mut window: GbnSender,
    timeout: Duration,
    metrics: Arc<Metrics>,
    mut commands: mpsc::Receiver<Command>,
) -> Result<(), GbnError> {
    let name = metrics.name().to_owned();
    let (expiry_tx, mut expiries) = mpsc::unbounded_channel();
    let mut timer = Timer::new((), expiry_tx);
    let mut flush_waiters: Vec<oneshot::Sender<()>> = Vec::new();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                None => break,
                Some(Command::Send { payload, reply }) => {
                    let len = payload.len();
                    let accepted = match window.send(payload) {
                        Some(out) => {
                            socket.send_to(out.frame, peer).await?;
                            metrics.record_bytes_sent(len);
                            metrics.record_frame_sent();
                            if out.start_timer {
                                timer.start(timeout);
                            }
                            log::debug!(
                                "[{name}] → DATA seq={} base={} next={}",
                                out.seq,
                                window.base(),
                                window.next()
                            );
                            true
                        }
                        None => false,
                    };
                    let _ = reply.send(accepted);
                }
                Some(Command::Flush { reply }) => {
                    if window.in_flight() == 0 {
                        let _ = reply.send(());
                    } else {
                        flush_waiters.push(reply);
                    }
                }
                Some(Command::Window { reply }) => {
                    let _ = reply.send(WindowBounds {
                        base: window.base(),
                        next: window.next(),
                        size: window.window_size(),
                    });
                }
            },

            received = socket.recv_from() => {
                let (bytes, from) = received?;
                if from != peer {
                    continue;
                }
                match window.on_ack(&bytes) {
                    AckOutcome::Corrupt => {
                        metrics.record_corrupted();
                        log::debug!("[{name}] ← corrupt ACK discarded");
                    }
                    AckOutcome::Stale => {
                        log::debug!("[{name}] ← stale ACK base={}", window.base());
                    }
                    AckOutcome::Advanced { acked, drained } => {
                        log::debug!("[{name}] ← ACK slid={acked} base={}", window.base());
                        if drained {
                            timer.cancel();
                            for waiter in flush_waiters.drain(..) {
                                let _ = waiter.send(());
                            }
                        } else {
                            timer.start(timeout);
                        }
                    }
                }
            }

            Some(event) = expiries.recv() => {
                if !timer.claim(&event) {
                    continue;
                }
                // Go-Back-N: resend every frame in [base, next).
                let frames: Vec<Vec<u8>> = window
                    .outstanding()
                    .map(|(_, frame)| frame.to_vec())
                    .collect();
                log::warn!(
                    "[{name}] timeout; retransmitting {} frame(s) from seq={}",
                    frames.len(),
                    window.base()
                );
                for frame in frames {
                    socket.send_to(frame, peer).await?;
                    metrics.record_retransmission();
                }
                timer.start(timeout);
            }
        }
    }

    timer.cancel();
    log::debug!("[{name}] driver stopped with {} frame(s) in flight", window.in_flight());
    Ok(())
}

/// Receiving side of a Go-Back-N pair.
///
/// ACKs go to whichever address the arriving frame came from.
#[derive(Debug)]
pub struct GbnSink {
    socket: Socket,
    receiver: GbnReceiver,
    metrics: Arc<Metrics>,
}

impl GbnSink {
    pub fn new(socket: Socket, metrics: Arc<Metrics>) -> Self {
        Self {
            socket,
            receiver: GbnReceiver::new(),
            metrics,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr
    }

    /// Next sequence number the sink will deliver.
    pub fn expected(&self) -> u64 {
        self.receiver.expected()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.metrics.snapshot()
    }

    /// Process arriving frames until one payload is delivered or `wait`
    /// elapses (`Ok(None)`).
    pub async fn recv(&mut self, wait: Duration) -> Result<Option<Vec<u8>>, GbnError> {
        let name = self.metrics.name().to_owned();
        let deadline = Instant::now() + wait;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let Some((bytes, from)) = self.socket.recv_timeout(remaining).await? else {
                return Ok(None);
            };

            match self.receiver.on_frame(&bytes) {
                GbnArrival::Delivered { payload, ack } => {
                    self.socket.send_to(ack, from).await?;
                    self.metrics.record_delivered(payload.len());
                    log::debug!(
                        "[{name}] ← DATA delivered; expecting seq={}",
                        self.receiver.expected()
                    );
                    return Ok(Some(payload));
                }
                GbnArrival::Rejected { reason, ack } => {
                    match reason {
                        Rejection::Corrupt => self.metrics.record_corrupted(),
                        Rejection::Duplicate => self.metrics.record_out_of_order(),
                    }
                    log::debug!("[{name}] ← {reason:?} frame; repeating last ACK");
                    self.socket.send_to(ack, from).await?;
                }
            }
        }
    }
}
