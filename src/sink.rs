//! Pooled accumulators for collecting statistics across worker threads.
//!
//! Many workers checking out, updating, and returning accumulator objects is
//! far cheaper than contending on one shared accumulator. The pool hands out
//! unused accumulators (constructing fresh ones on demand), takes them back,
//! and folds everything into a single result once the workers have quiesced.

use parking_lot::Mutex;

/// Combine two accumulators into one.
///
/// The reduction order is unspecified, so `merge` must be associative and
/// commutative for the final result to be deterministic.
pub trait Merge {
    /// Fold `other` into `self`.
    fn merge(&mut self, other: Self);
}

impl Merge for u64 {
    fn merge(&mut self, other: Self) {
        *self += other;
    }
}

impl Merge for usize {
    fn merge(&mut self, other: Self) {
        *self += other;
    }
}

/// A pool of reusable accumulators of type `T` with a final reduction.
///
/// Workers call [`acquire`](Self::acquire) to check out an accumulator,
/// update it without any locking, and hand it back via
/// [`release`](Self::release). A checkout is typically scoped to one
/// `process` call, but longer checkouts are fine as long as the accumulator
/// is released before [`reduce`](Self::reduce) runs.
///
/// `reduce` takes `&mut self`, so the borrow checker rejects any attempt to
/// reduce while the pool is still shared with running workers: drop the
/// worker-side handles (or join the threads holding them) first.
pub struct StatisticsSink<T> {
    /// Unused accumulators. Grows on demand, drained by `reduce`.
    pool: Mutex<Vec<T>>,
    /// Builds a zero-valued accumulator.
    factory: Box<dyn Fn() -> T + Send + Sync>,
}

impl<T: Merge> StatisticsSink<T> {
    /// Create a pool whose accumulators are built by `factory`.
    #[must_use]
    pub fn new(factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self { pool: Mutex::new(Vec::new()), factory: Box::new(factory) }
    }

    /// Check out an unused accumulator, constructing one if the pool is empty.
    #[must_use]
    pub fn acquire(&self) -> T {
        self.pool.lock().pop().unwrap_or_else(|| (self.factory)())
    }

    /// Return an accumulator after use.
    pub fn release(&self, accumulator: T) {
        self.pool.lock().push(accumulator);
    }

    /// Fold every pooled accumulator into one and return it.
    ///
    /// The pool is empty afterwards. An untouched pool yields a fresh
    /// zero-valued accumulator.
    pub fn reduce(&mut self) -> T {
        let pool = self.pool.get_mut();
        let Some(mut merged) = pool.pop() else {
            return (self.factory)();
        };
        while let Some(next) = pool.pop() {
            merged.merge(next);
        }
        merged
    }

    /// Number of accumulators currently sitting unused in the pool.
    #[must_use]
    pub fn pooled(&self) -> usize {
        self.pool.lock().len()
    }
}

impl<T: Merge + Default + 'static> Default for StatisticsSink<T> {
    fn default() -> Self {
        Self::new(T::default)
    }
}
