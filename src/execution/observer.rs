use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Events emitted by the [`super::WorkerPool`].
#[derive(Debug, Clone)]
pub enum PoolEvent {
    ThrottleWaited { duration: Duration },
    JobStarted { active: usize },
    JobFinished { elapsed: Duration, ok: bool },
}

/// Observer hook for pool events.
pub trait PoolObserver: Send + Sync {
    fn on_event(&self, event: &PoolEvent);
}

/// Logs pool events at debug level under the `pool` target.
#[derive(Debug, Default)]
pub struct TracingPoolObserver;

impl PoolObserver for TracingPoolObserver {
    fn on_event(&self, event: &PoolEvent) {
        match event {
            PoolEvent::ThrottleWaited { duration } => {
                tracing::debug!(target: "pool", waited_ms = duration.as_millis() as u64, "job throttled")
            }
            PoolEvent::JobStarted { active } => {
                tracing::debug!(target: "pool", active, "job started")
            }
            PoolEvent::JobFinished { elapsed, ok } => tracing::debug!(
                target: "pool",
                elapsed_ms = elapsed.as_millis() as u64,
                ok,
                "job finished"
            ),
        }
    }
}

/// Live counters of a [`super::WorkerPool`].
#[derive(Debug, Default)]
pub struct PoolMetrics {
    jobs_started: AtomicU64,
    jobs_finished: AtomicU64,
    jobs_failed: AtomicU64,
    throttle_wait_ns: AtomicU64,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl PoolMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of jobs now running.
    pub(crate) fn on_job_start(&self) -> usize {
        self.jobs_started.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        now
    }

    pub(crate) fn on_job_end(&self, ok: bool) {
        self.jobs_finished.fetch_add(1, Ordering::SeqCst);
        if !ok {
            self.jobs_failed.fetch_add(1, Ordering::SeqCst);
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn on_throttle_wait(&self, d: Duration) {
        let add = d.as_nanos().min(u64::MAX as u128) as u64;
        self.throttle_wait_ns.fetch_add(add, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> PoolMetricsSnapshot {
        PoolMetricsSnapshot {
            jobs_started: self.jobs_started.load(Ordering::SeqCst),
            jobs_finished: self.jobs_finished.load(Ordering::SeqCst),
            jobs_failed: self.jobs_failed.load(Ordering::SeqCst),
            throttle_wait: Duration::from_nanos(self.throttle_wait_ns.load(Ordering::SeqCst)),
            active: self.active.load(Ordering::SeqCst),
            max_active: self.max_active.load(Ordering::SeqCst),
        }
    }
}

/// Immutable snapshot of [`PoolMetrics`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolMetricsSnapshot {
    pub jobs_started: u64,
    pub jobs_finished: u64,
    /// Jobs that returned an error or panicked.
    pub jobs_failed: u64,
    pub throttle_wait: Duration,
    pub active: usize,
    pub max_active: usize,
}

impl fmt::Display for PoolMetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "jobs={}/{} failed={} active={} max_active={} throttle_wait={:?}",
            self.jobs_finished,
            self.jobs_started,
            self.jobs_failed,
            self.active,
            self.max_active,
            self.throttle_wait
        )
    }
}
