use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Below this limit the clock is read on every tick.
const FINE_GRAINED_BELOW: Duration = Duration::from_millis(50);
const COARSE_INTERVAL: u32 = 1000;

/// Cooperative execution deadline.
///
/// Scans call [`Deadline::tick`] once per row; the clock is only consulted every
/// `COARSE_INTERVAL` ticks (every tick for very short limits).
#[derive(Debug, Clone)]
pub struct Deadline {
    start: Instant,
    limit: Duration,
    interval: u32,
    ticks: u32,
}

impl Deadline {
    pub fn new(limit: Duration) -> Self {
        Self {
            start: Instant::now(),
            limit,
            interval: if limit < FINE_GRAINED_BELOW { 1 } else { COARSE_INTERVAL },
            ticks: 0,
        }
    }

    /// Time since the deadline was created.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Count one unit of work; fails with [`Error::Interrupted`] once the limit has passed.
    pub fn tick(&mut self) -> Result<()> {
        self.ticks += 1;
        if self.ticks < self.interval {
            return Ok(());
        }
        self.ticks = 0;
        let elapsed = self.start.elapsed();
        if elapsed >= self.limit {
            return Err(Error::Interrupted {
                elapsed_ms: elapsed.as_millis() as u64,
            });
        }
        Ok(())
    }
}
