use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// A small, blocking counting semaphore.
///
/// Bounds how many jobs run at once on the worker pool.
#[derive(Debug)]
pub struct Semaphore {
    permits: Mutex<usize>,
    cv: Condvar,
}

impl Semaphore {
    /// At least one permit is always available.
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits.max(1)),
            cv: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, usize> {
        self.permits.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Acquire one permit, blocking until available.
    ///
    /// Returns the guard and the time spent waiting (zero if no wait was required).
    pub fn acquire(&self) -> (Permit<'_>, Duration) {
        let start = Instant::now();
        let mut waited = false;
        let mut g = self.lock();
        while *g == 0 {
            waited = true;
            g = self
                .cv
                .wait(g)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        *g -= 1;
        let wait = if waited { start.elapsed() } else { Duration::ZERO };
        (Permit { owner: self }, wait)
    }

    fn release(&self) {
        *self.lock() += 1;
        self.cv.notify_one();
    }
}

/// One acquired permit; released on drop, including while unwinding.
#[derive(Debug)]
pub struct Permit<'a> {
    owner: &'a Semaphore,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.owner.release();
    }
}
