//! Per-endpoint metrics sink.
//!
//! Each endpoint is handed an `Arc<Metrics>` at construction.  The sink
//! carries the endpoint's name, which doubles as the prefix of its log
//! lines, and a set of lock-free counters.  [`Metrics::snapshot`] produces a
//! read-only [`StatsSnapshot`] at any time, including while the endpoint is
//! running.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct Metrics {
    name: String,
    started: Instant,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    frames_sent: AtomicU64,
    retransmissions: AtomicU64,
    corrupted: AtomicU64,
    out_of_order: AtomicU64,
    delivered: AtomicU64,
    rtt: Mutex<Option<RttReading>>,
}

/// Latest output of an RTT estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RttReading {
    pub estimated: Duration,
    pub timeout: Duration,
}

impl Metrics {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            started: Instant::now(),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            retransmissions: AtomicU64::new(0),
            corrupted: AtomicU64::new(0),
            out_of_order: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            rtt: Mutex::new(None),
        })
    }

    /// Name used as the log-line prefix.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Application payload bytes accepted for sending.
    pub fn record_bytes_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// One frame or segment handed to the channel (first transmission).
    pub fn record_frame_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// One frame or segment handed to the channel again.
    pub fn record_retransmission(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.retransmissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_corrupted(&self) {
        self.corrupted.fetch_add(1, Ordering::Relaxed);
    }

    /// A duplicate or out-of-sequence arrival was discarded.
    pub fn record_out_of_order(&self) {
        self.out_of_order.fetch_add(1, Ordering::Relaxed);
    }

    /// One payload of `bytes` bytes handed up to the application.
    pub fn record_delivered(&self, bytes: usize) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_rtt(&self, estimated: Duration, timeout: Duration) {
        let mut slot = match self.rtt.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(RttReading { estimated, timeout });
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let rtt = match self.rtt.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        };
        StatsSnapshot {
            name: self.name.clone(),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            retransmissions: self.retransmissions.load(Ordering::Relaxed),
            corrupted: self.corrupted.load(Ordering::Relaxed),
            out_of_order: self.out_of_order.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            elapsed: self.started.elapsed(),
            rtt,
        }
    }
}

/// Point-in-time copy of an endpoint's counters.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    pub name: String,
    /// Application bytes accepted by `send`.
    pub bytes_sent: u64,
    /// Application bytes delivered upward.
    pub bytes_received: u64,
    /// Frames or segments transmitted, retransmissions included.
    pub frames_sent: u64,
    pub retransmissions: u64,
    /// Arrivals that failed checksum or parse.
    pub corrupted: u64,
    /// Duplicate or out-of-sequence arrivals.
    pub out_of_order: u64,
    /// Payloads delivered upward.
    pub delivered: u64,
    pub elapsed: Duration,
    pub rtt: Option<RttReading>,
}

impl StatsSnapshot {
    /// Bits per second over the endpoint's lifetime, counting whichever
    /// direction carried more bytes.
    pub fn throughput_bps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        (self.bytes_sent.max(self.bytes_received) * 8) as f64 / secs
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[{}]", self.name)?;
        writeln!(f, "  elapsed         {:.3} s", self.elapsed.as_secs_f64())?;
        writeln!(f, "  bytes sent      {}", self.bytes_sent)?;
        writeln!(f, "  bytes received  {}", self.bytes_received)?;
        writeln!(f, "  frames sent     {}", self.frames_sent)?;
        writeln!(f, "  retransmissions {}", self.retransmissions)?;
        writeln!(f, "  corrupted       {}", self.corrupted)?;
        writeln!(f, "  out of order    {}", self.out_of_order)?;
        writeln!(f, "  delivered       {}", self.delivered)?;
        write!(f, "  throughput      {:.1} kbit/s", self.throughput_bps() / 1000.0)?;
        if let Some(rtt) = self.rtt {
            write!(
                f,
                "\n  estimated RTT   {:.1} ms\n  timeout         {:.1} ms",
                rtt.estimated.as_secs_f64() * 1e3,
                rtt.timeout.as_secs_f64() * 1e3
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = Metrics::new("test");
        m.record_bytes_sent(10);
        m.record_frame_sent();
        m.record_retransmission();
        m.record_corrupted();
        m.record_out_of_order();
        m.record_delivered(4);
        m.record_delivered(6);

        let s = m.snapshot();
        assert_eq!(s.name, "test");
        assert_eq!(s.bytes_sent, 10);
        assert_eq!(s.frames_sent, 2);
        assert_eq!(s.retransmissions, 1);
        assert_eq!(s.corrupted, 1);
        assert_eq!(s.out_of_order, 1);
        assert_eq!(s.delivered, 2);
        assert_eq!(s.bytes_received, 10);
        assert!(s.rtt.is_none());
    }

    #[test]
    fn rtt_reading_is_latest() {
        let m = Metrics::new("rtt");
        m.record_rtt(Duration::from_millis(5), Duration::from_millis(50));
        m.record_rtt(Duration::from_millis(7), Duration::from_millis(60));
        assert_eq!(
            m.snapshot().rtt,
            Some(RttReading {
                estimated: Duration::from_millis(7),
                timeout: Duration::from_millis(60),
            })
        );
    }

    #[test]
    fn throughput_is_bits_per_second() {
        let snap = StatsSnapshot {
            name: String::new(),
            bytes_sent: 1000,
            bytes_received: 0,
            frames_sent: 0,
            retransmissions: 0,
            corrupted: 0,
            out_of_order: 0,
            delivered: 0,
            elapsed: Duration::from_secs(2),
            rtt: None,
        };
        assert_eq!(snap.throughput_bps(), 4000.0);
        assert!(snap.to_string().contains("retransmissions 0"));
    }
}
