//! Monotone block-number watermark with blocking waits

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Highest block number reached so far
///
/// Stored as a count (`max + 1`) so that "nothing yet" needs no sentinel.
/// Readers go through the atomic; waiters park on the condvar and re-check
/// after each wake.
#[derive(Debug, Default)]
pub struct Watermark {
    next: AtomicU64,
    lock: Mutex<()>,
    cond: Condvar,
}

impl Watermark {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest number reached, `None` before the first advance
    pub fn get(&self) -> Option<u64> {
        self.next.load(Ordering::Acquire).checked_sub(1)
    }

    /// Whether `number` has been reached
    pub fn reaches(&self, number: u64) -> bool {
        self.next.load(Ordering::Acquire) > number
    }

    /// Raise the watermark to `number` and wake every waiter
    ///
    /// Lower values are ignored. Returns whether the watermark moved.
    pub fn advance(&self, number: u64) -> bool {
        let _guard = self.lock.lock();
        let previous = self.next.fetch_max(number.saturating_add(1), Ordering::AcqRel);
        if previous > number {
            return false;
        }
        self.cond.notify_all();
        true
    }

    /// Block until `number` is reached
    ///
    /// `None` waits forever, `Some(Duration::ZERO)` only checks. Returns
    /// whether the watermark reached `number`.
    pub fn wait_for(&self, number: u64, timeout: Option<Duration>) -> bool {
        if self.reaches(number) {
            return true;
        }
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        if timeout.is_some() && deadline.is_none() {
            // Timeout too large to represent, treat as unbounded
            return self.wait_for(number, None);
        }

        let mut guard = self.lock.lock();
        loop {
            if self.reaches(number) {
                return true;
            }
            match deadline {
                None => self.cond.wait(&mut guard),
                Some(deadline) => {
                    if self.cond.wait_until(&mut guard, deadline).timed_out() {
                        return self.reaches(number);
                    }
                }
            }
        }
    }
}
