//! Change-rate suppression for churning files.
//!
//! A file rewritten faster than the configured rate is temporarily
//! marked invalid by the scanner so its churn is not broadcast to the
//! whole cluster. The measure is bytes changed per second over a short
//! bounded history.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

/// Changes remembered per file.
const MAX_CHANGE_HISTORY: usize = 4;

#[derive(Clone, Copy, Debug)]
struct Change {
    size: u64,
    at_ms: u64,
}

#[derive(Default)]
struct History {
    changes: VecDeque<Change>,
}

impl History {
    fn append(&mut self, size: u64, at_ms: u64) {
        if self.changes.len() == MAX_CHANGE_HISTORY {
            self.changes.pop_front();
        }
        self.changes.push_back(Change { size, at_ms });
    }

    /// Observed change rate in bytes per second, zero until there are at
    /// least two data points.
    fn rate_bps(&self) -> f64 {
        let (Some(first), Some(last)) = (self.changes.front(), self.changes.back()) else {
            return 0.0;
        };
        if self.changes.len() < 2 {
            return 0.0;
        }
        let total: u64 = self.changes.iter().map(|c| c.size).sum();
        let span_ms = last.at_ms.saturating_sub(first.at_ms);
        if span_ms == 0 {
            return f64::INFINITY;
        }
        total as f64 * 1000.0 / span_ms as f64
    }
}

/// Per-repository change-rate tracker.
pub struct Suppressor {
    /// kB/s; zero disables suppression.
    threshold_kbps: u64,
    state: Mutex<BTreeMap<String, History>>,
}

impl Suppressor {
    pub fn new(threshold_kbps: u64) -> Self {
        Self {
            threshold_kbps,
            state: Mutex::new(BTreeMap::new()),
        }
    }

    /// Record a change of `size` bytes to `name` at `now_ms` and report
    /// whether the file should be suppressed, along with the observed
    /// rate in bytes per second.
    pub fn suppress(&self, name: &str, size: u64, now_ms: u64) -> (bool, f64) {
        if self.threshold_kbps == 0 {
            return (false, 0.0);
        }
        let mut state = self.state.lock().expect("suppressor lock poisoned");
        let history = state.entry(name.to_string()).or_default();
        history.append(size, now_ms);
        let rate = history.rate_bps();
        (rate > (self.threshold_kbps * 1000) as f64, rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_change_is_never_suppressed() {
        let sup = Suppressor::new(1);
        let (suppressed, rate) = sup.suppress("f", 1_000_000, 1_000);
        assert!(!suppressed);
        assert_eq!(rate, 0.0);
    }

    #[test]
    fn rapid_rewrites_suppress_on_the_second_change() {
        // 1 kB/s threshold; 1 MB rewritten twice within a second.
        let sup = Suppressor::new(1);
        let (first, _) = sup.suppress("f", 1_000_000, 1_000);
        let (second, rate) = sup.suppress("f", 1_000_000, 1_500);
        assert!(!first);
        assert!(second);
        assert!(rate > 1_000.0);
    }

    #[test]
    fn slow_changes_pass() {
        let sup = Suppressor::new(100);
        sup.suppress("f", 10, 0);
        let (suppressed, rate) = sup.suppress("f", 10, 10_000);
        assert!(!suppressed);
        assert!(rate < 100_000.0);
    }

    #[test]
    fn rate_recovers_as_the_window_slides() {
        let sup = Suppressor::new(1);
        for i in 0..4 {
            sup.suppress("f", 1_000_000, i * 100);
        }
        let (hot, _) = sup.suppress("f", 1_000_000, 400);
        assert!(hot);

        // Hours later the same file changes once more; the remembered
        // window now spans the quiet period.
        let (cooled, rate) = sup.suppress("f", 1_000_000, 8_000_000);
        assert!(!cooled);
        assert!(rate < 1_000.0);
    }

    #[test]
    fn zero_threshold_disables_suppression() {
        let sup = Suppressor::new(0);
        for i in 0..10 {
            let (suppressed, _) = sup.suppress("f", u64::MAX / 16, i);
            assert!(!suppressed);
        }
    }

    #[test]
    fn files_are_tracked_independently() {
        let sup = Suppressor::new(1);
        sup.suppress("hot", 1_000_000, 0);
        let (hot, _) = sup.suppress("hot", 1_000_000, 100);
        let (cold, _) = sup.suppress("cold", 10, 100);
        assert!(hot);
        assert!(!cold);
    }
}
