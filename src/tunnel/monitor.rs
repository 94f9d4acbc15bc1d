//! Rolling-window throughput monitor.
//!
//! Drives the decision to upgrade the downlink to the boost carrier. The
//! trigger requires the rolling total to sit above the threshold on two
//! consecutive admissions, so a single large burst does not flip a
//! connection that is otherwise idle.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Default upgrade threshold: sustained bytes within the window.
pub const DEFAULT_BOOST_THRESHOLD: u64 = 12 * 1024 * 1024;

/// Default rolling window length.
pub const DEFAULT_BOOST_WINDOW: Duration = Duration::from_secs(5);

/// Tracks delivered payload sizes and signals the upgrade exactly once.
pub struct BandwidthMonitor {
    window: VecDeque<(Instant, usize)>,
    total: u64,
    threshold: u64,
    window_dur: Duration,
    triggered: bool,
    pending_tick: bool,
}

impl BandwidthMonitor {
    /// Monitor with explicit threshold and window.
    pub fn new(threshold: u64, window: Duration) -> Self {
        Self {
            window: VecDeque::with_capacity(16),
            total: 0,
            threshold,
            window_dur: window,
            triggered: false,
            pending_tick: false,
        }
    }

    /// Record `n` delivered bytes. Returns `true` when the upgrade should
    /// fire; this happens at most once per monitor.
    pub fn add(&mut self, n: usize) -> bool {
        if n == 0 {
            return false;
        }
        let now = Instant::now();
        self.window.push_back((now, n));
        self.total += n as u64;

        while let Some(&(t, len)) = self.window.front() {
            if now.duration_since(t) <= self.window_dur {
                break;
            }
            self.total -= len as u64;
            self.window.pop_front();
        }

        if self.triggered {
            return false;
        }

        if self.total >= self.threshold {
            if self.pending_tick {
                self.triggered = true;
                return true;
            }
            self.pending_tick = true;
        } else {
            self.pending_tick = false;
        }

        false
    }

    /// Whether the upgrade has already fired.
    pub fn triggered(&self) -> bool {
        self.triggered
    }
}

impl Default for BandwidthMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_BOOST_THRESHOLD, DEFAULT_BOOST_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_needs_two_admissions_above_threshold() {
        let mut monitor = BandwidthMonitor::new(12 * 1024 * 1024, Duration::from_secs(5));

        assert!(!monitor.add(6 * 1024 * 1024), "below threshold");
        assert!(
            !monitor.add(7 * 1024 * 1024),
            "first admission above threshold arms but does not fire"
        );
        assert!(monitor.add(1), "second admission fires");
        assert!(!monitor.add(1), "fires only once");
        assert!(monitor.triggered());
    }

    #[test]
    fn dropping_below_threshold_disarms() {
        let mut monitor = BandwidthMonitor::new(100, Duration::from_millis(10));

        assert!(!monitor.add(150), "first admission arms");
        std::thread::sleep(Duration::from_millis(25));
        // The armed sample has aged out: this admission sees a total
        // below the threshold and disarms.
        assert!(!monitor.add(10));
        // Climbing back above the threshold needs a fresh pair.
        assert!(!monitor.add(150));
        assert!(monitor.add(1));
    }

    #[test]
    fn zero_length_samples_are_ignored() {
        let mut monitor = BandwidthMonitor::new(10, Duration::from_secs(5));
        assert!(!monitor.add(0));
        assert!(!monitor.add(20));
        assert!(!monitor.add(0), "zero admission must not complete the pair");
        assert!(monitor.add(5));
    }
}
