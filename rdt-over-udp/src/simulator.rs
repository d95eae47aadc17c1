//! Unreliable channel model.
//!
//! Every outbound datagram passes through a [`Channel`] before it reaches the
//! real UDP socket.  The channel decides the datagram's [`Fate`]: dropped, or
//! delivered (possibly corrupted) after some delay.  Protocol code never
//! fakes loss or corruption itself; it only reacts to what arrives.
//!
//! | Fault       | Description                                           |
//! |-------------|-------------------------------------------------------|
//! | Loss        | Drop a datagram with probability `loss_rate`.         |
//! | Corruption  | Invert 1 to 5 random bytes with `corrupt_rate`.       |
//! | Delay       | Deliver after a uniform delay from `delay_range`.     |
//!
//! Besides [`Simulator`] and the transparent [`Perfect`] channel, any
//! `Fn(Vec<u8>) -> Fate` closure is a channel, which lets tests intercept
//! specific datagrams deterministically.

use std::sync::Mutex;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::ConfigError;

/// What happens to one datagram handed to the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fate {
    /// Silently lost.
    Drop,
    /// Handed to the socket after `delay` (possibly with altered bytes).
    Deliver { datagram: Vec<u8>, delay: Duration },
}

impl Fate {
    /// Immediate, unaltered delivery.
    pub fn deliver(datagram: Vec<u8>) -> Self {
        Fate::Deliver {
            datagram,
            delay: Duration::ZERO,
        }
    }
}

/// Decides the fate of every datagram sent through a [`crate::socket::Socket`].
pub trait Channel: Send + Sync {
    fn shape(&self, datagram: Vec<u8>) -> Fate;
}

impl<F> Channel for F
where
    F: Fn(Vec<u8>) -> Fate + Send + Sync,
{
    fn shape(&self, datagram: Vec<u8>) -> Fate {
        self(datagram)
    }
}

/// Pass-through channel: no loss, no corruption, no delay.
#[derive(Debug, Default, Clone, Copy)]
pub struct Perfect;

impl Channel for Perfect {
    fn shape(&self, datagram: Vec<u8>) -> Fate {
        Fate::deliver(datagram)
    }
}

/// Configuration for the fault-injection model.
///
/// Probabilities are in the range `[0.0, 1.0]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    /// Probability that any given datagram is silently dropped.
    pub loss_rate: f64,
    /// Probability that a surviving datagram has bytes inverted.
    pub corrupt_rate: f64,
    /// Inclusive range of the random delivery delay.
    pub delay_range: (Duration, Duration),
    /// Seed for reproducible runs; `None` seeds from the OS.
    pub seed: Option<u64>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        // No faults by default: the simulator is a transparent pass-through.
        Self {
            loss_rate: 0.0,
            corrupt_rate: 0.0,
            delay_range: (Duration::ZERO, Duration::ZERO),
            seed: None,
        }
    }
}

impl ChannelConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, p) in [("loss_rate", self.loss_rate), ("corrupt_rate", self.corrupt_rate)] {
            if !(0.0..=1.0).contains(&p) {
                return Err(ConfigError::Probability { name, value: p });
            }
        }
        if self.delay_range.0 > self.delay_range.1 {
            return Err(ConfigError::DelayRange);
        }
        Ok(())
    }
}

/// A fault-injecting channel.
#[derive(Debug)]
pub struct Simulator {
    config: ChannelConfig,
    rng: Mutex<StdRng>,
}

impl Simulator {
    pub fn new(config: ChannelConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Ok(Self {
            config,
            rng: Mutex::new(rng),
        })
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }
}

impl Channel for Simulator {
    fn shape(&self, mut datagram: Vec<u8>) -> Fate {
        let mut rng = match self.rng.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if rng.random_bool(self.config.loss_rate) {
            log::debug!("[channel] datagram of {} bytes lost", datagram.len());
            return Fate::Drop;
        }

        if !datagram.is_empty() && rng.random_bool(self.config.corrupt_rate) {
            let flips = rng.random_range(1..=5);
            for _ in 0..flips {
                let idx = rng.random_range(0..datagram.len());
                datagram[idx] ^= 0xff;
            }
            log::debug!("[channel] datagram corrupted ({flips} byte inversions)");
        }

        let (lo, hi) = self.config.delay_range;
        let delay = if hi.is_zero() {
            Duration::ZERO
        } else {
            rng.random_range(lo..=hi)
        };

        Fate::Deliver { datagram, delay }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(loss_rate: f64, corrupt_rate: f64) -> Simulator {
        Simulator::new(ChannelConfig {
            loss_rate,
            corrupt_rate,
            seed: Some(7),
            ..ChannelConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn default_simulator_is_transparent() {
        let sim = seeded(0.0, 0.0);
        for i in 0..100u8 {
            assert_eq!(sim.shape(vec![i; 8]), Fate::deliver(vec![i; 8]));
        }
    }

    #[test]
    fn full_loss_drops_everything() {
        let sim = seeded(1.0, 0.0);
        assert!((0..50).all(|_| sim.shape(vec![1, 2, 3]) == Fate::Drop));
    }

    #[test]
    fn full_corruption_alters_every_datagram() {
        let sim = seeded(0.0, 1.0);
        for _ in 0..50 {
            match sim.shape(vec![0u8; 16]) {
                Fate::Deliver { datagram, .. } => assert!(datagram.iter().any(|&b| b != 0)),
                Fate::Drop => panic!("nothing should be lost"),
            }
        }
    }

    #[test]
    fn delay_stays_inside_range() {
        let sim = Simulator::new(ChannelConfig {
            delay_range: (Duration::from_millis(5), Duration::from_millis(10)),
            seed: Some(1),
            ..ChannelConfig::default()
        })
        .unwrap();
        for _ in 0..50 {
            match sim.shape(vec![0]) {
                Fate::Deliver { delay, .. } => {
                    assert!(delay >= Duration::from_millis(5) && delay <= Duration::from_millis(10))
                }
                Fate::Drop => panic!("nothing should be lost"),
            }
        }
    }

    #[test]
    fn same_seed_same_decisions() {
        let a = seeded(0.5, 0.5);
        let b = seeded(0.5, 0.5);
        for i in 0..64u8 {
            assert_eq!(a.shape(vec![i; 4]), b.shape(vec![i; 4]));
        }
    }

    #[test]
    fn invalid_probability_is_rejected() {
        let err = Simulator::new(ChannelConfig {
            loss_rate: 1.5,
            ..ChannelConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::Probability { name: "loss_rate", .. }));
    }

    #[test]
    fn closures_are_channels() {
        let drop_all = |_: Vec<u8>| Fate::Drop;
        assert_eq!(drop_all.shape(vec![1]), Fate::Drop);
    }
}
