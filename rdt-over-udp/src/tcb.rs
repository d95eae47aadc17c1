//! Transmission control block for one connection.
//!
//! [`Tcb`] owns everything the connection protocol needs to know: sequence
//! bookkeeping, the send buffer, the table of outstanding segments (each
//! with its own retransmission timer), the RTT estimator and the peer's
//! advertised window.  It never touches the socket: every method that wants
//! to transmit pushes onto an outbox that the connection driver drains with
//! [`Tcb::take_outbox`].
//!
//! # Sequence-number layout
//!
//! ```text
//!   snd_una               snd_nxt
//!      │                     │
//!  ────┼─────────────────────┼──────────────────▶ send seq space
//!      │ <─ outstanding ───▶ │ <─ send_buf ───▶
//! ```
//!
//! Payload bytes consume one sequence number each; SYN and FIN consume one
//! each.  All comparisons wrap (see [`seq_le`]).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

use crate::config::ConnConfig;
use crate::connection::ConnError;
use crate::rtt::RttEstimator;
use crate::segment::{flags, seq_le, seq_lt, seq_space, Header, Segment};
use crate::state::ConnectionState;
use crate::stats::Metrics;
use crate::timer::{Expired, Timer};
use crate::window::SlotRing;

/// Identifies a connection timer to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKey {
    /// Retransmission timer of the outstanding segment with this ordinal.
    Retransmit(u64),
    /// Zero-window probe.
    Persist,
    /// End of TIME_WAIT.
    TimeWait,
}

// ---------------------------------------------------------------------------
// RecvBuffer
// ---------------------------------------------------------------------------

/// In-order bytes waiting for the application.
///
/// Shared between the driver (which appends) and the
/// [`crate::connection::Connection`] handle (which drains).  Its free space
/// is the window advertised to the peer.
#[derive(Debug)]
pub struct RecvBuffer {
    capacity: usize,
    inner: Mutex<RecvInner>,
    readable: Notify,
}

#[derive(Debug, Default)]
struct RecvInner {
    bytes: VecDeque<u8>,
    eof: bool,
}

impl RecvBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(RecvInner::default()),
            readable: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RecvInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn free(&self) -> usize {
        self.capacity.saturating_sub(self.len())
    }

    /// Append `data` if all of it fits.
    pub fn push(&self, data: &[u8]) -> bool {
        {
            let mut inner = self.lock();
            if inner.eof || self.capacity.saturating_sub(inner.bytes.len()) < data.len() {
                return false;
            }
            inner.bytes.extend(data);
        }
        self.readable.notify_one();
        true
    }

    /// Mark end of stream.  Buffered bytes remain readable.
    pub fn close(&self) {
        self.lock().eof = true;
        self.readable.notify_one();
    }

    /// `true` once the stream ended and every byte was read.
    pub fn is_finished(&self) -> bool {
        let inner = self.lock();
        inner.eof && inner.bytes.is_empty()
    }

    /// Remove up to `max` bytes without waiting.
    pub fn take(&self, max: usize) -> Vec<u8> {
        let mut inner = self.lock();
        let n = max.min(inner.bytes.len());
        inner.bytes.drain(..n).collect()
    }

    /// Remove up to `max` bytes, waiting at most `wait` for some to arrive.
    ///
    /// Returns an empty vector on timeout or at end of stream.
    pub async fn read(&self, max: usize, wait: Duration) -> Vec<u8> {
        let deadline = Instant::now() + wait;
        loop {
            // No push follows eof, so an empty take after it is final.
            let eof = self.lock().eof;
            let chunk = self.take(max);
            if !chunk.is_empty() || eof {
                return chunk;
            }
            if tokio::time::timeout_at(deadline, self.readable.notified())
                .await
                .is_err()
            {
                return Vec::new();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// InFlight
// ---------------------------------------------------------------------------

/// A segment that has been sent but not yet cumulatively acknowledged.
#[derive(Debug)]
struct InFlight {
    seq: u32,
    flags: u8,
    payload: Vec<u8>,
    /// Time of the most recent transmission.
    sent_at: Instant,
    /// Set once the segment has been sent more than once (Karn).
    retransmitted: bool,
    /// Retransmission timeouts of this segment so far.
    retries: u32,
    timer: Timer<TimerKey>,
}

impl InFlight {
    fn seq_len(&self) -> u32 {
        seq_space(self.flags, self.payload.len())
    }

    /// First sequence number after this segment.
    fn end(&self) -> u32 {
        self.seq.wrapping_add(self.seq_len())
    }
}

// ---------------------------------------------------------------------------
// Tcb
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Tcb {
    name: String,
    state: ConnectionState,

    local_port: u16,
    peer_port: u16,

    /// Initial send sequence number.
    iss: u32,
    /// Initial receive sequence number (peer's ISN).
    irs: u32,
    /// Oldest unacknowledged sequence number.
    snd_una: u32,
    /// Next sequence number to send.
    snd_nxt: u32,
    /// Next sequence number expected from the peer.
    rcv_nxt: u32,

    /// Window most recently advertised by the peer.
    peer_window: u16,
    /// Window most recently advertised to the peer.
    last_advertised: u16,

    send_buf: VecDeque<u8>,
    /// The application asked to close; FIN follows the last queued byte.
    fin_queued: bool,
    fin_sent: bool,

    outstanding: SlotRing<InFlight>,
    rtt: RttEstimator,
    persist: Timer<TimerKey>,
    time_wait: Timer<TimerKey>,
    timers: mpsc::UnboundedSender<Expired<TimerKey>>,

    recv: Arc<RecvBuffer>,
    metrics: Arc<Metrics>,
    outbox: Vec<Segment>,

    mss: usize,
    max_window: u16,
    max_retries: u32,
    time_wait_for: Duration,
}

impl Tcb {
    /// Create a control block in [`ConnectionState::Closed`].
    ///
    /// `iss` is the initial send sequence number; `timers` is where every
    /// timer of this connection posts its expiries.
    pub fn new(
        config: &ConnConfig,
        iss: u32,
        local_port: u16,
        recv: Arc<RecvBuffer>,
        timers: mpsc::UnboundedSender<Expired<TimerKey>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            name: metrics.name().to_owned(),
            state: ConnectionState::Closed,
            local_port,
            peer_port: 0,
            iss,
            irs: 0,
            snd_una: iss,
            snd_nxt: iss,
            rcv_nxt: 0,
            peer_window: 0,
            last_advertised: 0,
            send_buf: VecDeque::new(),
            fin_queued: false,
            fin_sent: false,
            outstanding: SlotRing::new(config.max_in_flight, 0),
            rtt: RttEstimator::new(config.rto),
            persist: Timer::new(TimerKey::Persist, timers.clone()),
            time_wait: Timer::new(TimerKey::TimeWait, timers.clone()),
            timers,
            recv,
            metrics,
            outbox: Vec::new(),
            mss: config.mss,
            max_window: config.max_window(),
            max_retries: config.max_retries,
            time_wait_for: config.time_wait,
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn snd_una(&self) -> u32 {
        self.snd_una
    }

    pub fn snd_nxt(&self) -> u32 {
        self.snd_nxt
    }

    pub fn rcv_nxt(&self) -> u32 {
        self.rcv_nxt
    }

    pub fn peer_window(&self) -> u16 {
        self.peer_window
    }

    /// Sequence numbers sent but not yet acknowledged.
    pub fn bytes_in_flight(&self) -> u32 {
        self.snd_nxt.wrapping_sub(self.snd_una)
    }

    pub fn outstanding_segments(&self) -> usize {
        self.outstanding.len()
    }

    /// Bytes queued by the application but not yet sent.
    pub fn unsent(&self) -> usize {
        self.send_buf.len()
    }

    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    pub fn set_peer_port(&mut self, port: u16) {
        self.peer_port = port;
    }

    /// Segments produced since the last call, in transmission order.
    pub fn take_outbox(&mut self) -> Vec<Segment> {
        std::mem::take(&mut self.outbox)
    }

    // -----------------------------------------------------------------------
    // Application events
    // -----------------------------------------------------------------------

    /// Active open: send SYN.
    pub fn open(&mut self) {
        if self.state != ConnectionState::Closed {
            return;
        }
        self.transmit_new(flags::SYN, Vec::new());
        self.transition(ConnectionState::SynSent);
    }

    /// Passive open.
    pub fn listen(&mut self) {
        if self.state == ConnectionState::Closed {
            self.transition(ConnectionState::Listen);
        }
    }

    /// Queue application bytes; returns how many were accepted.
    pub fn queue(&mut self, data: &[u8]) -> Result<usize, ConnError> {
        if !self.state.can_send() || self.fin_queued {
            return Err(ConnError::NotConnected(self.state));
        }
        self.send_buf.extend(data);
        self.flush();
        Ok(data.len())
    }

    /// Begin an orderly close.  FIN goes out once the send buffer drains.
    pub fn close(&mut self) {
        match self.state {
            ConnectionState::Established | ConnectionState::CloseWait => {
                if !self.fin_queued {
                    self.fin_queued = true;
                    self.flush();
                }
            }
            ConnectionState::Listen | ConnectionState::SynSent | ConnectionState::SynReceived => {
                self.finish();
            }
            _ => {}
        }
    }

    /// Tear everything down immediately.
    pub fn abort(&mut self) {
        if self.state != ConnectionState::Closed {
            log::warn!("[{}] aborting in {}", self.name, self.state);
        }
        self.send_buf.clear();
        self.finish();
    }

    /// The application drained the receive buffer; reopen the window if
    /// the peer last saw it (nearly) closed.
    pub fn on_drained(&mut self) {
        if !self.state.is_synchronized() || self.state == ConnectionState::TimeWait {
            return;
        }
        let free = self.advertised_window() as usize;
        let last = self.last_advertised as usize;
        let threshold = self.mss.min(self.recv.capacity() / 2).max(1);
        if free >= last + threshold || (last == 0 && free > 0) {
            log::debug!("[{}] → window update {last} → {free}", self.name);
            self.send_ack();
        }
    }

    // -----------------------------------------------------------------------
    // Network events
    // -----------------------------------------------------------------------

    /// Process one valid segment from the peer.
    pub fn on_segment(&mut self, seg: Segment) {
        let h = &seg.header;
        log::debug!(
            "[{}] ← seq={} ack={} flags={:#05b} win={} len={} in {}",
            self.name,
            h.seq,
            h.ack,
            h.flags,
            h.window,
            seg.payload.len(),
            self.state
        );

        match self.state {
            ConnectionState::Closed => {}
            ConnectionState::Listen => {
                if h.has(flags::SYN) && !h.has(flags::ACK) {
                    self.irs = h.seq;
                    self.rcv_nxt = h.seq.wrapping_add(1);
                    self.peer_window = h.window;
                    self.transmit_new(flags::SYN | flags::ACK, Vec::new());
                    self.transition(ConnectionState::SynReceived);
                }
            }
            ConnectionState::SynSent => {
                if h.has(flags::SYN) && h.has(flags::ACK) && h.ack == self.snd_nxt {
                    self.irs = h.seq;
                    self.rcv_nxt = h.seq.wrapping_add(1);
                    self.handle_ack(h.ack, h.window);
                    self.transition(ConnectionState::Established);
                    self.send_ack();
                    self.flush();
                }
            }
            ConnectionState::SynReceived => {
                if h.has(flags::SYN) && !h.has(flags::ACK) {
                    // Our SYN+ACK was lost; answer the retransmitted SYN now.
                    if h.seq == self.irs {
                        self.resend_front();
                    }
                } else if h.has(flags::ACK) && h.ack == self.snd_nxt {
                    self.handle_ack(h.ack, h.window);
                    self.transition(ConnectionState::Established);
                    self.on_synchronized(seg);
                }
            }
            _ => self.on_synchronized(seg),
        }
    }

    fn on_synchronized(&mut self, seg: Segment) {
        let Segment { header: h, payload } = seg;

        if h.has(flags::SYN) {
            // Retransmitted SYN+ACK: the peer never saw our final ACK.
            self.send_ack();
            return;
        }
        if h.has(flags::ACK) {
            self.handle_ack(h.ack, h.window);
        }
        if self.state == ConnectionState::Closed {
            return;
        }

        let mut ack_needed = false;
        if !payload.is_empty() {
            self.accept_data(h.seq, &payload);
            ack_needed = true;
        } else if !h.has(flags::FIN) && h.seq == self.rcv_nxt.wrapping_sub(1) {
            // Zero-window probe.
            ack_needed = true;
        }
        if h.has(flags::FIN) {
            self.accept_fin(h.seq.wrapping_add(payload.len() as u32));
            ack_needed = true;
        }
        if ack_needed {
            self.send_ack();
        }
        self.flush();
    }

    fn accept_data(&mut self, seq: u32, payload: &[u8]) {
        if seq == self.rcv_nxt && self.recv.push(payload) {
            self.rcv_nxt = self.rcv_nxt.wrapping_add(payload.len() as u32);
        } else {
            self.metrics.record_out_of_order();
            log::debug!(
                "[{}] discarding seq={seq} len={} (expected {}, free {})",
                self.name,
                payload.len(),
                self.rcv_nxt,
                self.recv.free()
            );
        }
    }

    fn accept_fin(&mut self, fin_seq: u32) {
        if fin_seq == self.rcv_nxt {
            self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
            self.recv.close();
            match self.state {
                ConnectionState::Established => self.transition(ConnectionState::CloseWait),
                ConnectionState::FinWait1 => self.transition(ConnectionState::Closing),
                ConnectionState::FinWait2 => self.enter_time_wait(),
                _ => {}
            }
        } else if fin_seq.wrapping_add(1) == self.rcv_nxt && self.state == ConnectionState::TimeWait {
            // The peer missed our ACK of its FIN; linger a little longer.
            self.time_wait.start(self.linger());
        }
    }

    /// Cumulative acknowledgement processing.
    ///
    /// Only ACKs within `snd_una..=snd_nxt` count.  One equal to `snd_una`
    /// just refreshes the peer window; anything older or beyond `snd_nxt`
    /// is ignored entirely.
    fn handle_ack(&mut self, ack: u32, window: u16) {
        if !seq_le(ack, self.snd_nxt) || !seq_le(self.snd_una, ack) {
            return;
        }
        self.peer_window = window;

        if seq_lt(self.snd_una, ack) {
            let mut sampled = false;
            while let Some(front) = self.outstanding.front() {
                if !seq_le(front.end(), ack) {
                    break;
                }
                let Some((_, entry)) = self.outstanding.pop_front() else {
                    break;
                };
                // Karn: only the earliest covered segment is a candidate,
                // and only if it was never retransmitted.
                if !sampled {
                    sampled = true;
                    if !entry.retransmitted {
                        self.rtt.update(entry.sent_at.elapsed());
                        self.metrics.record_rtt(self.rtt.estimated(), self.rtt.timeout());
                    }
                }
                // Dropping `entry` aborts its timer.
            }
            self.snd_una = ack;

            if self.fin_sent && self.snd_una == self.snd_nxt {
                match self.state {
                    ConnectionState::FinWait1 => self.transition(ConnectionState::FinWait2),
                    ConnectionState::Closing => self.enter_time_wait(),
                    ConnectionState::LastAck => self.finish(),
                    _ => {}
                }
            }
        }
        self.update_persist();
    }

    // -----------------------------------------------------------------------
    // Timer events
    // -----------------------------------------------------------------------

    /// Handle an expiry posted by one of this connection's timers.
    ///
    /// Stale expiries are ignored.  Fails when a segment exhausted its
    /// retries; the connection is closed by then.
    pub fn on_timer(&mut self, event: Expired<TimerKey>) -> Result<(), ConnError> {
        match event.key {
            TimerKey::Retransmit(ordinal) => self.on_retransmit_timeout(ordinal, &event),
            TimerKey::Persist => {
                if self.persist.claim(&event) {
                    self.send_probe();
                }
                Ok(())
            }
            TimerKey::TimeWait => {
                if self.time_wait.claim(&event) {
                    self.finish();
                }
                Ok(())
            }
        }
    }

    fn on_retransmit_timeout(
        &mut self,
        ordinal: u64,
        event: &Expired<TimerKey>,
    ) -> Result<(), ConnError> {
        let Some(entry) = self.outstanding.get_mut(ordinal) else {
            return Ok(());
        };
        if !entry.timer.claim(event) {
            return Ok(());
        }
        entry.retries += 1;
        let retries = entry.retries;
        if retries > self.max_retries {
            log::warn!("[{}] segment retransmitted {} times; giving up", self.name, self.max_retries);
            self.abort();
            return Err(ConnError::PeerUnresponsive);
        }

        self.rtt.back_off();
        self.metrics.record_rtt(self.rtt.estimated(), self.rtt.timeout());
        let rto = self.rtt.timeout();
        let window = self.advertised_window();
        self.last_advertised = window;

        let (src_port, dst_port, rcv_nxt) = (self.local_port, self.peer_port, self.rcv_nxt);
        let now = Instant::now();
        let tail = self.outstanding.tail();
        let mut resent = 0usize;

        // Go-back-N: everything from the fired segment onwards.
        for ord in ordinal..tail {
            let Some(entry) = self.outstanding.get_mut(ord) else {
                continue;
            };
            entry.retransmitted = true;
            entry.sent_at = now;
            entry.timer.start(rto);
            let ack = if entry.flags & flags::ACK != 0 { rcv_nxt } else { 0 };
            self.outbox.push(Segment {
                header: Header {
                    src_port,
                    dst_port,
                    seq: entry.seq,
                    ack,
                    flags: entry.flags,
                    window,
                },
                payload: entry.payload.clone(),
            });
            self.metrics.record_retransmission();
            resent += 1;
        }
        log::warn!(
            "[{}] timeout; retransmitted {resent} segment(s), rto now {rto:?}",
            self.name
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Transmission helpers
    // -----------------------------------------------------------------------

    /// Move as much of the send buffer onto the wire as MSS, peer window and
    /// table capacity allow, then the FIN if one is due.
    fn flush(&mut self) {
        if !self.state.can_send() {
            return;
        }
        while !self.send_buf.is_empty() && !self.outstanding.is_full() {
            let usable = (self.peer_window as usize).saturating_sub(self.bytes_in_flight() as usize);
            let len = self.mss.min(usable).min(self.send_buf.len());
            if len == 0 {
                break;
            }
            let payload: Vec<u8> = self.send_buf.drain(..len).collect();
            self.transmit_new(flags::ACK, payload);
        }

        if self.fin_queued
            && !self.fin_sent
            && self.send_buf.is_empty()
            && !self.outstanding.is_full()
        {
            self.transmit_new(flags::FIN | flags::ACK, Vec::new());
            self.fin_sent = true;
            match self.state {
                ConnectionState::Established => self.transition(ConnectionState::FinWait1),
                ConnectionState::CloseWait => self.transition(ConnectionState::LastAck),
                _ => {}
            }
        }
        self.update_persist();
    }

    /// Send a new segment at `snd_nxt`, record it as outstanding and start
    /// its timer.
    fn transmit_new(&mut self, seg_flags: u8, payload: Vec<u8>) {
        let ordinal = self.outstanding.tail();
        let mut timer = Timer::new(TimerKey::Retransmit(ordinal), self.timers.clone());
        timer.start(self.rtt.timeout());

        let seg = self.segment(self.snd_nxt, seg_flags, payload.clone());
        let entry = InFlight {
            seq: self.snd_nxt,
            flags: seg_flags,
            payload,
            sent_at: Instant::now(),
            retransmitted: false,
            retries: 0,
            timer,
        };
        let len = entry.seq_len();
        let bytes = entry.payload.len();
        if self.outstanding.push_back(entry).is_err() {
            return;
        }
        self.snd_nxt = self.snd_nxt.wrapping_add(len);
        self.outbox.push(seg);
        self.metrics.record_bytes_sent(bytes);
        self.metrics.record_frame_sent();
    }

    /// Retransmit the oldest outstanding segment without touching timers.
    fn resend_front(&mut self) {
        let Some((seq, seg_flags, payload)) = self
            .outstanding
            .front()
            .map(|e| (e.seq, e.flags, e.payload.clone()))
        else {
            return;
        };
        if let Some(entry) = self.outstanding.get_mut(self.outstanding.head()) {
            entry.retransmitted = true;
        }
        let seg = self.segment(seq, seg_flags, payload);
        self.outbox.push(seg);
        self.metrics.record_retransmission();
    }

    fn send_ack(&mut self) {
        let seg = self.segment(self.snd_nxt, flags::ACK, Vec::new());
        self.outbox.push(seg);
        self.metrics.record_frame_sent();
    }

    fn send_probe(&mut self) {
        if !(self.state.can_send() && self.peer_window == 0 && !self.send_buf.is_empty()) {
            return;
        }
        log::debug!("[{}] → zero-window probe", self.name);
        let seg = self.segment(self.snd_nxt.wrapping_sub(1), flags::ACK, Vec::new());
        self.outbox.push(seg);
        self.metrics.record_frame_sent();
        self.persist.start(self.rtt.timeout());
    }

    /// Arm the persist timer while the peer's window is shut and data waits.
    fn update_persist(&mut self) {
        let stalled = self.state.can_send()
            && self.peer_window == 0
            && !self.send_buf.is_empty()
            && self.outstanding.is_empty();
        if !stalled {
            self.persist.cancel();
        } else if !self.persist.is_running() {
            self.persist.start(self.rtt.timeout());
        }
    }

    fn segment(&mut self, seq: u32, seg_flags: u8, payload: Vec<u8>) -> Segment {
        let window = self.advertised_window();
        self.last_advertised = window;
        let ack = if seg_flags & flags::ACK != 0 { self.rcv_nxt } else { 0 };
        Segment {
            header: Header {
                src_port: self.local_port,
                dst_port: self.peer_port,
                seq,
                ack,
                flags: seg_flags,
                window,
            },
            payload,
        }
    }

    fn advertised_window(&self) -> u16 {
        u16::try_from(self.recv.free()).map_or(self.max_window, |free| free.min(self.max_window))
    }

    // -----------------------------------------------------------------------
    // State transitions
    // -----------------------------------------------------------------------

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            log::info!("[{}] {} → {}", self.name, self.state, next);
            self.state = next;
        }
    }

    fn enter_time_wait(&mut self) {
        self.outstanding.clear();
        self.persist.cancel();
        self.time_wait.start(self.linger());
        self.transition(ConnectionState::TimeWait);
    }

    /// TIME_WAIT must outlast one retransmission of the peer's FIN.
    fn linger(&self) -> Duration {
        self.time_wait_for.max(self.rtt.timeout() * 2)
    }

    /// Release every timer and mark the stream finished.
    fn finish(&mut self) {
        self.outstanding.clear();
        self.persist.cancel();
        self.time_wait.cancel();
        self.recv.close();
        self.transition(ConnectionState::Closed);
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
