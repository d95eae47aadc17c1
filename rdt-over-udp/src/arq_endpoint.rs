//! Async stop-and-wait endpoints.
//!
//! [`ArqSender`] and [`ArqReceiver`] own a [`Socket`] and drive the
//! [`StopAndWaitSender`] / [`StopAndWaitReceiver`] state machines with it.
//! Transient channel faults never surface as errors here; only local
//! transport failures do.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::arq_receiver::{Arrival, StopAndWaitReceiver};
use crate::arq_sender::{ArqError, ReplyAction, StopAndWaitSender};
use crate::config::ArqConfig;
use crate::frame::Rejection;
use crate::socket::Socket;
use crate::stats::{Metrics, StatsSnapshot};
use crate::timer::Timer;

/// Sending half of a stop-and-wait pair.
#[derive(Debug)]
pub struct ArqSender {
    socket: Socket,
    peer: SocketAddr,
    fsm: StopAndWaitSender,
    config: ArqConfig,
    metrics: Arc<Metrics>,
}

impl ArqSender {
    pub fn new(
        socket: Socket,
        peer: SocketAddr,
        config: ArqConfig,
        metrics: Arc<Metrics>,
    ) -> Result<Self, ArqError> {
        config.validate()?;
        Ok(Self {
            socket,
            peer,
            fsm: StopAndWaitSender::new(config.variant),
            config,
            metrics,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr
    }

    pub fn fsm(&self) -> &StopAndWaitSender {
        &self.fsm
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.metrics.snapshot()
    }

    /// Send `payload` and wait until the peer acknowledges it.
    ///
    /// The timed variant retransmits when its timer fires.  The other two
    /// re-emit the frame when no reply at all arrives within
    /// `reply_timeout`, so a lost frame cannot stall them forever.
    ///
    /// If an earlier call was cancelled or failed before its frame was
    /// acknowledged, that frame is re-sent and acknowledged first.
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), ArqError> {
        if let Some(frame) = self.fsm.outstanding().map(<[u8]>::to_vec) {
            log::warn!(
                "[{}] resuming unacknowledged frame in {:?}",
                self.metrics.name(),
                self.fsm.state()
            );
            self.retransmit(frame).await?;
            self.await_ack().await?;
        }

        let frame = self.fsm.send(payload.to_vec())?;
        self.socket.send_to(frame, self.peer).await?;
        self.metrics.record_bytes_sent(payload.len());
        self.metrics.record_frame_sent();
        log::debug!(
            "[{}] → DATA len={} state={:?}",
            self.metrics.name(),
            payload.len(),
            self.fsm.state()
        );
        self.await_ack().await
    }

    /// Drive the outstanding frame until it is acknowledged.
    async fn await_ack(&mut self) -> Result<(), ArqError> {
        let name = self.metrics.name().to_owned();
        let timed = self.config.variant.uses_timer();
        let (expiry_tx, mut expiries) = mpsc::unbounded_channel();
        let mut timer = Timer::new((), expiry_tx);
        if timed {
            timer.start(self.config.retransmit_timeout);
        }

        loop {
            tokio::select! {
                received = self.socket.recv_from() => {
                    let (bytes, from) = received?;
                    if from != self.peer {
                        continue;
                    }
                    match self.fsm.on_reply(&bytes) {
                        ReplyAction::Acknowledged => {
                            timer.cancel();
                            log::debug!("[{name}] ← ACK state={:?}", self.fsm.state());
                            return Ok(());
                        }
                        ReplyAction::Retransmit(frame) => {
                            log::warn!("[{name}] NAK, damaged or stale reply; retransmitting");
                            self.retransmit(frame).await?;
                        }
                        ReplyAction::Discard => {
                            log::debug!("[{name}] reply discarded");
                        }
                    }
                }
                Some(event) = expiries.recv() => {
                    if !timer.claim(&event) {
                        continue;
                    }
                    if let Some(frame) = self.fsm.on_timeout() {
                        log::warn!("[{name}] timeout; retransmitting");
                        self.retransmit(frame).await?;
                        timer.start(self.config.retransmit_timeout);
                    }
                }
                _ = tokio::time::sleep(self.config.reply_timeout), if !timed => {
                    if let Some(frame) = self.fsm.on_timeout() {
                        log::warn!("[{name}] no reply within {:?}; retransmitting", self.config.reply_timeout);
                        self.retransmit(frame).await?;
                    }
                }
            }
        }
    }

    async fn retransmit(&self, frame: Vec<u8>) -> Result<(), ArqError> {
        self.socket.send_to(frame, self.peer).await?;
        self.metrics.record_retransmission();
        Ok(())
    }
}

/// Receiving half of a stop-and-wait pair.
///
/// Replies go to whichever address the arriving frame came from.
#[derive(Debug)]
pub struct ArqReceiver {
    socket: Socket,
    fsm: StopAndWaitReceiver,
    metrics: Arc<Metrics>,
}

impl ArqReceiver {
    pub fn new(socket: Socket, config: &ArqConfig, metrics: Arc<Metrics>) -> Result<Self, ArqError> {
        config.validate()?;
        Ok(Self {
            socket,
            fsm: StopAndWaitReceiver::new(config.variant),
            metrics,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr
    }

    pub fn fsm(&self) -> &StopAndWaitReceiver {
        &self.fsm
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.metrics.snapshot()
    }

    /// Process arriving frames until one payload is delivered or `wait`
    /// elapses (`Ok(None)`).
    pub async fn recv(&mut self, wait: Duration) -> Result<Option<Vec<u8>>, ArqError> {
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

            match self.fsm.on_frame(&bytes) {
                Arrival::Delivered { payload, reply } => {
                    self.socket.send_to(reply, from).await?;
                    self.metrics.record_delivered(payload.len());
                    log::debug!("[{name}] ← DATA len={} delivered; → ACK", payload.len());
                    return Ok(Some(payload));
                }
                Arrival::Rejected { reason, reply } => {
                    match reason {
                        Rejection::Corrupt => self.metrics.record_corrupted(),
                        Rejection::Duplicate => self.metrics.record_out_of_order(),
                    }
                    log::debug!("[{name}] ← {reason:?} frame; replying");
                    self.socket.send_to(reply, from).await?;
                }
                Arrival::Ignored => {}
            }
        }
    }
}
