//! Counting semaphore for codec pools

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Counting semaphore whose waiters take several permits at once
///
/// A multi-permit acquire is all-or-nothing, so two callers each holding
/// part of what they need can never deadlock each other.
#[derive(Debug)]
pub struct Semaphore {
    permits: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            cond: Condvar::new(),
        }
    }

    pub fn available(&self) -> usize {
        *self.permits.lock()
    }

    /// Take `n` permits, blocking until they are free
    pub fn acquire(&self, n: usize) {
        let mut permits = self.permits.lock();
        while *permits < n {
            self.cond.wait(&mut permits);
        }
        *permits -= n;
    }

    /// Take `n` permits, giving up after `timeout`
    pub fn acquire_timeout(&self, n: usize, timeout: Duration) -> bool {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.acquire(n);
            return true;
        };
        let mut permits = self.permits.lock();
        while *permits < n {
            if self.cond.wait_until(&mut permits, deadline).timed_out() {
                if *permits < n {
                    return false;
                }
                break;
            }
        }
        *permits -= n;
        true
    }

    pub fn release(&self, n: usize) {
        *self.permits.lock() += n;
        self.cond.notify_all();
    }
}
