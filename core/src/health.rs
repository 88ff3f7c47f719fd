//! Host-level health accounting.
//!
//! Every execution records exactly one outcome. `RollingHealth` keeps
//! lifetime totals plus the last `window` outcomes, which is what a backoff
//! or circuit-breaking layer would read; no such layer lives here.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::error::ErrorClass;

/// Receiver of per-request outcomes for one host.
pub trait HostHealth: Send + Sync {
    fn record_success(&self);

    fn record_failure(&self, class: ErrorClass);
}

/// Point-in-time view of a `RollingHealth`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HealthSnapshot {
    pub successes: u64,
    pub failures: u64,
    /// Failures among the outcomes currently in the window.
    pub recent_failures: usize,
    /// Outcomes currently in the window.
    pub recent_total: usize,
    pub last_error: Option<ErrorClass>,
}

impl HealthSnapshot {
    /// Share of failures in the window, 0.0 when nothing was recorded.
    pub fn error_rate(&self) -> f64 {
        if self.recent_total == 0 {
            return 0.0;
        }
        self.recent_failures as f64 / self.recent_total as f64
    }
}

#[derive(Debug, Default)]
struct Counters {
    successes: u64,
    failures: u64,
    // true = failure
    recent: VecDeque<bool>,
    recent_failures: usize,
    last_error: Option<ErrorClass>,
}

/// Success/failure counters over a rolling window of recent outcomes.
#[derive(Debug)]
pub struct RollingHealth {
    window: usize,
    counters: Mutex<Counters>,
}

impl RollingHealth {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let c = self.counters.lock();
        HealthSnapshot {
            successes: c.successes,
            failures: c.failures,
            recent_failures: c.recent_failures,
            recent_total: c.recent.len(),
            last_error: c.last_error,
        }
    }

    fn push(&self, failed: bool) {
        let mut c = self.counters.lock();
        if c.recent.len() == self.window && c.recent.pop_front() == Some(true) {
            c.recent_failures -= 1;
        }
        c.recent.push_back(failed);
        if failed {
            c.recent_failures += 1;
        }
    }
}

impl Default for RollingHealth {
    fn default() -> Self {
        Self::new(100)
    }
}

impl HostHealth for RollingHealth {
    fn record_success(&self) {
        self.counters.lock().successes += 1;
        self.push(false);
    }

    fn record_failure(&self, class: ErrorClass) {
        {
            let mut c = self.counters.lock();
            c.failures += 1;
            c.last_error = Some(class);
        }
        self.push(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_outcomes() {
        let health = RollingHealth::new(10);
        health.record_success();
        health.record_success();
        health.record_failure(ErrorClass::Timeout);

        let snap = health.snapshot();
        assert_eq!(snap.successes, 2);
        assert_eq!(snap.failures, 1);
        assert_eq!(snap.last_error, Some(ErrorClass::Timeout));
        assert!((snap.error_rate() - 1.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn window_forgets_old_outcomes() {
        let health = RollingHealth::new(2);
        health.record_failure(ErrorClass::Status(500));
        health.record_success();
        health.record_success();

        let snap = health.snapshot();
        assert_eq!(snap.recent_total, 2);
        assert_eq!(snap.recent_failures, 0);
        assert_eq!(snap.failures, 1);
        assert_eq!(snap.error_rate(), 0.0);
    }

    #[test]
    fn empty_window_has_zero_error_rate() {
        assert_eq!(RollingHealth::default().snapshot().error_rate(), 0.0);
    }
}
