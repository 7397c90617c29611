// Issuance clock
//
// Hybrid logical clock used to stamp policies and directives:
// - next() = max(wall clock in microseconds, last + 1)
// - witness(order) pulls the clock forward past anything observed
//
// Orders stay monotonic per issuer across restarts without any persisted
// counter, and a write issued after observing an update always sorts after it.
// Observed orders further than MAX_WITNESS_SKEW ahead of the local wall clock
// are refused, so a single bogus order cannot pin the clock at u64::MAX.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// How far ahead of local wall-clock time an observed order may be
pub const MAX_WITNESS_SKEW: Duration = Duration::from_secs(300);

#[derive(Debug, Default)]
pub struct IssuanceClock {
    last: AtomicU64,
}

impl IssuanceClock {
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    /// Next issuance order for this issuer
    pub fn next(&self) -> u64 {
        let now = wall_clock_micros();
        let previous = self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(now.max(last.saturating_add(1)))
            })
            .unwrap_or_else(|last| last);
        now.max(previous.saturating_add(1))
    }

    /// Record an order observed from another issuer
    ///
    /// Returns `false`, leaving the clock untouched, when the order is
    /// implausibly far ahead of the local wall clock.
    pub fn witness(&self, observed: u64) -> bool {
        if !Self::is_plausible(observed) {
            return false;
        }
        self.last.fetch_max(observed, Ordering::AcqRel);
        true
    }

    /// Whether `order` lies within [`MAX_WITNESS_SKEW`] of the wall clock
    pub fn is_plausible(order: u64) -> bool {
        let horizon = wall_clock_micros().saturating_add(MAX_WITNESS_SKEW.as_micros() as u64);
        order <= horizon
    }

    /// Last order handed out or witnessed
    pub fn current(&self) -> u64 {
        self.last.load(Ordering::Acquire)
    }
}

fn wall_clock_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
