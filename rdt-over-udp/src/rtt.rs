//! Adaptive retransmission timeout.
//!
//! [`RttEstimator`] keeps an exponentially weighted moving average of the
//! round-trip time and of its deviation (Jacobson's algorithm):
//!
//! ```text
//! EstimatedRTT = 7/8 · EstimatedRTT + 1/8 · SampleRTT
//! DevRTT       = 3/4 · DevRTT       + 1/4 · |SampleRTT − EstimatedRTT|
//! Timeout      = EstimatedRTT + 4 · DevRTT        (clamped to [min, max])
//! ```
//!
//! The timeout doubles on each retransmission timeout (exponential
//! back-off) up to the configured maximum, and the next sample recomputes
//! it from the estimates.

use std::time::Duration;

use crate::config::RtoConfig;

/// Starting point for the smoothed RTT before any sample.
const INITIAL_ESTIMATE: Duration = Duration::from_secs(1);
/// Starting point for the RTT deviation before any sample.
const INITIAL_DEVIATION: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct RttEstimator {
    estimated: Duration,
    deviation: Duration,
    timeout: Duration,
    bounds: RtoConfig,
    samples: u64,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new(RtoConfig::default())
    }
}

impl RttEstimator {
    pub fn new(bounds: RtoConfig) -> Self {
        Self {
            estimated: INITIAL_ESTIMATE,
            deviation: INITIAL_DEVIATION,
            timeout: bounds.initial,
            bounds,
            samples: 0,
        }
    }

    /// Fold one RTT measurement into the estimate.
    ///
    /// The deviation is computed against the *updated* estimate.
    pub fn update(&mut self, sample: Duration) {
        self.estimated = self.estimated * 7 / 8 + sample / 8;
        let diff = sample.abs_diff(self.estimated);
        self.deviation = self.deviation * 3 / 4 + diff / 4;
        self.timeout = self.clamp(self.estimated + self.deviation * 4);
        self.samples += 1;
    }

    /// Double the timeout after a retransmission timeout.
    pub fn back_off(&mut self) {
        self.timeout = self.clamp(self.timeout.saturating_mul(2));
    }

    pub fn estimated(&self) -> Duration {
        self.estimated
    }

    pub fn deviation(&self) -> Duration {
        self.deviation
    }

    /// Current retransmission timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of samples folded in so far.
    pub fn samples(&self) -> u64 {
        self.samples
    }

    fn clamp(&self, rto: Duration) -> Duration {
        rto.clamp(self.bounds.min, self.bounds.max)
    }
}
