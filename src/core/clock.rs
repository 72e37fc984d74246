//! Process-wide Lamport clock for file version stamping.

use std::sync::atomic::{AtomicU64, Ordering};

/// 64-bit Lamport timestamp source shared by every component that
/// assigns or observes file versions.
///
/// `tick(seen) = max(counter, seen) + 1`, as a compare-exchange loop so
/// concurrent callers each obtain a value strictly greater than both the
/// counter and any version they have observed.
#[derive(Debug, Default)]
pub struct LamportClock {
    counter: AtomicU64,
}

impl LamportClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance past `seen` and return the new timestamp.
    pub fn tick(&self, seen: u64) -> u64 {
        let mut current = self.counter.load(Ordering::Relaxed);
        loop {
            let next = current.max(seen) + 1;
            match self.counter.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(observed) => current = observed,
            }
        }
    }

    /// The highest timestamp handed out so far.
    pub fn current(&self) -> u64 {
        self.counter.load(Ordering::Acquire)
    }
}
