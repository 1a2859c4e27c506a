//! Idle strategies for the three suspension points: a producer waiting for a
//! free slot, a blocking caller waiting for its result, and a consumer waiting
//! for newly published sequences.

use std::thread;
use std::time::Duration;

use crossbeam::utils::Backoff;
use serde::{Deserialize, Serialize};

/// How a thread waits when it cannot make progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WaitStrategy {
    /// Spin on the CPU; lowest latency, burns a core per waiting thread
    BusySpin,
    /// Spin briefly, then yield to the scheduler
    #[default]
    Yielding,
    /// Spin briefly, then park for the configured interval (or until unparked)
    TimedPark,
}

impl WaitStrategy {
    /// Parse a wait strategy name (case-insensitive)
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "busy-spin" | "busy_spin" | "busyspin" | "spin" => Some(Self::BusySpin),
            "yielding" | "yield" => Some(Self::Yielding),
            "timed-park" | "timed_park" | "park" => Some(Self::TimedPark),
            _ => None,
        }
    }

    /// Canonical name, as accepted by [`WaitStrategy::from_str`]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BusySpin => "busy-spin",
            Self::Yielding => "yielding",
            Self::TimedPark => "timed-park",
        }
    }
}

/// Per-wait state for a [`WaitStrategy`]. Create one per wait loop.
pub(crate) struct Idler {
    strategy: WaitStrategy,
    park_interval: Duration,
    backoff: Backoff,
}

impl Idler {
    pub(crate) fn new(strategy: WaitStrategy, park_interval: Duration) -> Self {
        Self {
            strategy,
            park_interval,
            backoff: Backoff::new(),
        }
    }

    /// Whether the next [`idle`](Self::idle) call will park the thread
    pub(crate) fn will_park(&self) -> bool {
        self.strategy == WaitStrategy::TimedPark && self.backoff.is_completed()
    }

    /// Wait once. Callers re-check their condition afterwards; parking may
    /// return early or spuriously.
    pub(crate) fn idle(&self) {
        match self.strategy {
            WaitStrategy::BusySpin => std::hint::spin_loop(),
            WaitStrategy::Yielding => self.backoff.snooze(),
            WaitStrategy::TimedPark => {
                if self.backoff.is_completed() {
                    thread::park_timeout(self.park_interval);
                } else {
                    self.backoff.snooze();
                }
            }
        }
    }

    /// Progress was made; start the next wait from the cheap end again
    pub(crate) fn reset(&self) {
        self.backoff.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_strategy_parse() {
        assert_eq!(WaitStrategy::from_str("busy-spin"), Some(WaitStrategy::BusySpin));
        assert_eq!(WaitStrategy::from_str("SPIN"), Some(WaitStrategy::BusySpin));
        assert_eq!(WaitStrategy::from_str("Yielding"), Some(WaitStrategy::Yielding));
        assert_eq!(WaitStrategy::from_str("yield"), Some(WaitStrategy::Yielding));
        assert_eq!(WaitStrategy::from_str("timed-park"), Some(WaitStrategy::TimedPark));
        assert_eq!(WaitStrategy::from_str(" park "), Some(WaitStrategy::TimedPark));
        assert_eq!(WaitStrategy::from_str("sleep"), None);
    }

    #[test]
    fn test_wait_strategy_names_round_trip() {
        for strategy in [
            WaitStrategy::BusySpin,
            WaitStrategy::Yielding,
            WaitStrategy::TimedPark,
        ] {
            assert_eq!(WaitStrategy::from_str(strategy.as_str()), Some(strategy));
        }
    }

    #[test]
    fn test_timed_park_escalates_to_parking() {
        let idler = Idler::new(WaitStrategy::TimedPark, Duration::from_micros(10));
        assert!(!idler.will_park());
        // Backoff completes after a bounded number of snoozes.
        for _ in 0..64 {
            idler.idle();
        }
        assert!(idler.will_park());
        idler.reset();
        assert!(!idler.will_park());
    }

    #[test]
    fn test_busy_spin_never_parks() {
        let idler = Idler::new(WaitStrategy::BusySpin, Duration::from_micros(10));
        for _ in 0..64 {
            idler.idle();
        }
        assert!(!idler.will_park());
    }
}
