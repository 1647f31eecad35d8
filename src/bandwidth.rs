use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Rolling-window byte-rate estimator.
///
/// `add` is a lock-free counter increment so it can sit on hot sample paths;
/// a periodic driver calls `sample` once per `sample_period` to roll the
/// window forward.
#[derive(Debug)]
pub struct BandwidthTracker {
    window_size: usize,
    sample_period: Duration,
    total_bytes: AtomicU64,
    delta_bytes: AtomicU64,
    history: Mutex<VecDeque<u64>>,
}

impl BandwidthTracker {
    pub const DEFAULT_WINDOW_SIZE: usize = 10;
    pub const DEFAULT_SAMPLE_PERIOD: Duration = Duration::from_secs(1);

    pub fn new(window_size: usize, sample_period: Duration) -> Self {
        assert!(window_size > 0, "window_size must be non-zero");
        Self {
            window_size,
            sample_period,
            total_bytes: AtomicU64::new(0),
            delta_bytes: AtomicU64::new(0),
            history: Mutex::new(VecDeque::with_capacity(window_size)),
        }
    }

    pub fn add(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        self.total_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.delta_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Roll the window: snapshot the bytes seen since the last sample and
    /// push them as one slot. Empty slots stay zero.
    pub fn sample(&self) {
        let delta = self.delta_bytes.swap(0, Ordering::Relaxed);
        let mut history = self.history.lock().unwrap();
        if history.len() == self.window_size {
            history.pop_front();
        }
        history.push_back(delta);
    }

    /// Mean of the window divided by the sample period.
    pub fn current_bps(&self) -> f64 {
        let history = self.history.lock().unwrap();
        if history.is_empty() {
            return 0.0;
        }
        let sum: u64 = history.iter().sum();
        let mean = sum as f64 / self.window_size as f64;
        mean / self.sample_period.as_secs_f64()
    }

    pub fn history(&self) -> Vec<u64> {
        self.history.lock().unwrap().iter().copied().collect()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    pub fn sample_period(&self) -> Duration {
        self.sample_period
    }

    pub fn reset(&self) {
        self.total_bytes.store(0, Ordering::Relaxed);
        self.delta_bytes.store(0, Ordering::Relaxed);
        self.history.lock().unwrap().clear();
    }
}

impl Default for BandwidthTracker {
    fn default() -> Self {
        Self::new(Self::DEFAULT_WINDOW_SIZE, Self::DEFAULT_SAMPLE_PERIOD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_zero_add_leaves_state_unchanged() {
        let t = BandwidthTracker::default();
        t.add(0);
        assert_eq!(t.total_bytes(), 0);
        t.sample();
        assert_eq!(t.history(), vec![0]);
        assert_eq!(t.current_bps(), 0.0);
    }

    #[test]
    fn test_total_bytes_conservation_under_concurrency() {
        let t = Arc::new(BandwidthTracker::default());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let t = t.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..10_000 {
                    t.add(3);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(t.total_bytes(), 8 * 10_000 * 3);
    }

    #[test]
    fn test_current_bps_mean_over_window() {
        let t = BandwidthTracker::new(4, Duration::from_secs(1));
        t.add(1000);
        t.sample();
        t.add(3000);
        t.sample();
        // two filled slots, two empty; mean = (1000 + 3000) / 4
        assert_eq!(t.current_bps(), 1000.0);
    }

    #[test]
    fn test_window_rolls_oldest_out() {
        let t = BandwidthTracker::new(2, Duration::from_secs(1));
        t.add(100);
        t.sample();
        t.add(200);
        t.sample();
        t.add(300);
        t.sample();
        assert_eq!(t.history(), vec![200, 300]);
    }

    #[test]
    fn test_reset() {
        let t = BandwidthTracker::default();
        t.add(500);
        t.sample();
        t.reset();
        assert_eq!(t.total_bytes(), 0);
        assert!(t.history().is_empty());
    }
}
