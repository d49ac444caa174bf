//! Interval-based progress logging.

use std::sync::atomic::{AtomicU64, Ordering};

use log::info;

/// Thread-safe counter that logs progress whenever the count crosses a
/// multiple of the configured interval.
///
/// # Example
/// ```
/// use chunkflow::progress::ProgressLogger;
///
/// let progress = ProgressLogger::new("chunks emitted").with_interval(1_000);
/// for _ in 0..2_500 {
///     progress.record(1); // logs at 1,000 and 2,000
/// }
/// progress.log_complete(); // logs "chunks emitted 2500 (done)"
/// assert_eq!(progress.count(), 2_500);
/// ```
pub struct ProgressLogger {
    /// Message prefix for log lines.
    label: String,
    /// Log whenever the count crosses a multiple of this.
    interval: u64,
    count: AtomicU64,
}

impl ProgressLogger {
    /// Default logging interval.
    pub const DEFAULT_INTERVAL: u64 = 100_000;

    /// Create a logger with the default interval.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self { label: label.into(), interval: Self::DEFAULT_INTERVAL, count: AtomicU64::new(0) }
    }

    /// Set the logging interval. An interval of 0 is clamped to 1.
    #[must_use]
    pub fn with_interval(mut self, interval: u64) -> Self {
        self.interval = interval.max(1);
        self
    }

    /// Add `n` to the count, logging if an interval boundary was crossed.
    ///
    /// When several boundaries are crossed at once only the highest is
    /// logged.
    pub fn record(&self, n: u64) {
        if n == 0 {
            return;
        }
        let prev = self.count.fetch_add(n, Ordering::Relaxed);
        let total = prev + n;
        if prev / self.interval != total / self.interval {
            info!("{} {}", self.label, (total / self.interval) * self.interval);
        }
    }

    /// Log the final count unless it landed exactly on an interval boundary
    /// (in which case `record` already logged it).
    pub fn log_complete(&self) {
        let total = self.count.load(Ordering::Relaxed);
        if total > 0 && total % self.interval != 0 {
            info!("{} {} (done)", self.label, total);
        }
    }

    /// The current count.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}
