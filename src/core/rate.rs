//! Exponentially-weighted moving-average request rate.
//!
//! Updates are lock-free increments of an uncounted total; a periodic
//! [`RateCounter::tick`] (every [`TICK_INTERVAL`]) folds them into the moving
//! average. The one-minute window matches the usual load-average style rate.
use std::{
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::Duration,
};

/// Interval between two calls to [`RateCounter::tick`].
pub const TICK_INTERVAL: Duration = Duration::from_secs(5);

const ONE_MINUTE_SECS: f64 = 60.0;

#[derive(Debug)]
pub struct RateCounter {
    alpha: f64,
    uncounted: AtomicU64,
    total: AtomicU64,
    // f64 bits, events per second
    rate: AtomicU64,
    initialized: AtomicBool,
}

impl Default for RateCounter {
    fn default() -> Self {
        Self::one_minute()
    }
}

impl RateCounter {
    /// Moving average over a one-minute window.
    pub fn one_minute() -> Self {
        Self::with_window(ONE_MINUTE_SECS)
    }

    /// Moving average over a window of `window_secs` seconds.
    pub fn with_window(window_secs: f64) -> Self {
        let alpha = 1.0 - (-TICK_INTERVAL.as_secs_f64() / window_secs).exp();
        Self {
            alpha,
            uncounted: AtomicU64::new(0),
            total: AtomicU64::new(0),
            rate: AtomicU64::new(0f64.to_bits()),
            initialized: AtomicBool::new(false),
        }
    }

    /// Record `n` events.
    pub fn update(&self, n: u64) {
        self.uncounted.fetch_add(n, Ordering::Relaxed);
        self.total.fetch_add(n, Ordering::Relaxed);
    }

    /// Fold the events recorded since the last tick into the average.
    pub fn tick(&self) {
        let count = self.uncounted.swap(0, Ordering::AcqRel);
        let instant_rate = count as f64 / TICK_INTERVAL.as_secs_f64();

        if self.initialized.swap(true, Ordering::AcqRel) {
            let alpha = self.alpha;
            // Only the ticker task writes the rate, the loop is for safety.
            let _ = self
                .rate
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                    let current = f64::from_bits(bits);
                    Some((current + alpha * (instant_rate - current)).to_bits())
                });
        } else {
            self.rate.store(instant_rate.to_bits(), Ordering::Release);
        }
    }

    /// Current moving average, in events per second.
    pub fn rate(&self) -> f64 {
        f64::from_bits(self.rate.load(Ordering::Acquire))
    }

    /// Total number of events ever recorded.
    pub fn count(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_tick_sets_instant_rate() {
        let counter = RateCounter::one_minute();
        counter.update(10);
        assert_eq!(counter.rate(), 0.0);
        counter.tick();
        assert!((counter.rate() - 2.0).abs() < f64::EPSILON);
        assert_eq!(counter.count(), 10);
    }

    #[test]
    fn test_rate_decays_without_traffic() {
        let counter = RateCounter::one_minute();
        counter.update(50);
        counter.tick();
        let initial = counter.rate();

        for _ in 0..12 {
            counter.tick();
        }
        let decayed = counter.rate();
        assert!(decayed < initial);
        // after one window the average keeps roughly 1/e of its value
        assert!((decayed / initial - (-1.0f64).exp()).abs() < 0.01);
    }

    #[test]
    fn test_concurrent_updates_are_counted() {
        let counter = std::sync::Arc::new(RateCounter::one_minute());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        counter.update(1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.count(), 8000);
    }
}
