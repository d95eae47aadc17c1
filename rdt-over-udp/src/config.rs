//! Tunable parameters for every protocol endpoint.
//!
//! Each endpoint takes its own config struct; all of them have sensible
//! [`Default`]s and a `validate` method.  The binary maps command-line flags
//! onto these (see `main.rs`); the channel's own knobs live in
//! [`crate::simulator::ChannelConfig`].

use std::time::Duration;

use thiserror::Error;

use crate::arq_sender::Variant;

/// Rejected configuration values.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{name} must be within [0, 1], got {value}")]
    Probability { name: &'static str, value: f64 },
    #[error("channel delay range is inverted")]
    DelayRange,
    #[error("GBN window size must be within 1..=255, got {0}")]
    WindowSize(usize),
    #[error("{0} must be non-zero")]
    Zero(&'static str),
    #[error("mss {0} does not fit in one datagram")]
    Mss(usize),
    #[error("RTO bounds are inconsistent (min {min:?}, initial {initial:?}, max {max:?})")]
    RtoBounds {
        min: Duration,
        initial: Duration,
        max: Duration,
    },
}

/// Stop-and-wait endpoint parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ArqConfig {
    pub variant: Variant,
    /// Retransmission timer interval (variant C).
    pub retransmit_timeout: Duration,
    /// Read deadline after which variants A/B re-emit an unanswered frame.
    pub reply_timeout: Duration,
}

impl Default for ArqConfig {
    fn default() -> Self {
        Self {
            variant: Variant::Timed,
            retransmit_timeout: Duration::from_millis(2000),
            reply_timeout: Duration::from_secs(5),
        }
    }
}

impl ArqConfig {
    pub fn with_variant(variant: Variant) -> Self {
        Self {
            variant,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retransmit_timeout.is_zero() {
            return Err(ConfigError::Zero("retransmit_timeout"));
        }
        if self.reply_timeout.is_zero() {
            return Err(ConfigError::Zero("reply_timeout"));
        }
        Ok(())
    }
}

/// Go-Back-N endpoint parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct GbnConfig {
    /// Window size N.  The wire carries `seq mod 256`, so N ≤ 255.
    pub window_size: usize,
    /// Retransmission timer interval.
    pub timeout: Duration,
}

impl Default for GbnConfig {
    fn default() -> Self {
        Self {
            window_size: 5,
            timeout: Duration::from_millis(2000),
        }
    }
}

impl GbnConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=255).contains(&self.window_size) {
            return Err(ConfigError::WindowSize(self.window_size));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::Zero("timeout"));
        }
        Ok(())
    }
}

/// Bounds for the adaptive retransmission timeout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RtoConfig {
    /// RTO before any RTT sample is available.
    pub initial: Duration,
    /// Floor applied to every computed RTO.
    pub min: Duration,
    /// Ceiling applied to every computed RTO, including back-off.
    pub max: Duration,
}

impl Default for RtoConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(2000),
            min: Duration::from_millis(50),
            max: Duration::from_secs(60),
        }
    }
}

impl RtoConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min.is_zero() || self.min > self.initial || self.initial > self.max {
            return Err(ConfigError::RtoBounds {
                min: self.min,
                initial: self.initial,
                max: self.max,
            });
        }
        Ok(())
    }
}

/// Largest payload a segment can carry inside one UDP datagram.
pub const MAX_MSS: usize = 65_507 - crate::segment::HEADER_LEN;

/// Connection (simplified TCP) parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnConfig {
    /// Maximum payload bytes per segment.
    pub mss: usize,
    /// Receive-buffer capacity; the advertised window is what is left of it.
    pub recv_buffer: usize,
    /// Capacity of the outstanding-segment table.
    pub max_in_flight: usize,
    pub rto: RtoConfig,
    /// Retransmissions of one segment before the peer is declared dead.
    pub max_retries: u32,
    /// Bound on `connect` completing the three-way handshake.
    pub handshake_timeout: Duration,
    /// Bound on `accept` seeing an established connection.
    pub accept_timeout: Duration,
    /// Bound on a single `recv` call.
    pub recv_timeout: Duration,
    /// Bound on `close` completing the teardown.
    pub close_timeout: Duration,
    /// Time spent in TIME_WAIT before the endpoint is released.
    pub time_wait: Duration,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            mss: 1024,
            recv_buffer: 4096,
            max_in_flight: 64,
            rto: RtoConfig::default(),
            max_retries: 12,
            handshake_timeout: Duration::from_secs(10),
            accept_timeout: Duration::from_secs(30),
            recv_timeout: Duration::from_secs(5),
            close_timeout: Duration::from_secs(10),
            time_wait: Duration::from_millis(500),
        }
    }
}

impl ConnConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mss == 0 {
            return Err(ConfigError::Zero("mss"));
        }
        if self.mss > MAX_MSS {
            return Err(ConfigError::Mss(self.mss));
        }
        if self.recv_buffer == 0 {
            return Err(ConfigError::Zero("recv_buffer"));
        }
        if self.max_in_flight == 0 {
            return Err(ConfigError::Zero("max_in_flight"));
        }
        self.rto.validate()
    }

    /// Largest window this endpoint can advertise.
    pub fn max_window(&self) -> u16 {
        u16::try_from(self.recv_buffer).unwrap_or(u16::MAX)
    }
}
