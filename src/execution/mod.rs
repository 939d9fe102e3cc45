//! Bounded worker pool for blocking work (downloads, parsing, storage writes, queries).
//!
//! Jobs run on plain threads: [`WorkerPool::run`] on the caller, [`WorkerPool::spawn`] on one of
//! the pool's named worker threads. A counting semaphore caps how many run at once, so callers
//! queue instead of oversubscribing the machine. Jobs may fan out with rayon; the rayon workers
//! only ever see that CPU work and never block on a permit or a cache lock. Counters are kept in
//! [`PoolMetrics`] and every job is reported to an optional [`PoolObserver`].

mod observer;
mod semaphore;

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::{Error, Result, panic_message};

pub use observer::{PoolEvent, PoolMetrics, PoolMetricsSnapshot, PoolObserver, TracingPoolObserver};

use semaphore::Semaphore;

/// Default number of worker threads.
pub const DEFAULT_MAX_WORKERS: usize = 3;

/// Configuration for the [`WorkerPool`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolOptions {
    /// Number of threads serving [`WorkerPool::spawn`].
    pub max_workers: usize,
    /// Upper bound on concurrently running jobs; defaults to `max_workers`.
    pub max_in_flight: Option<usize>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            max_in_flight: None,
        }
    }
}

type Task = Box<dyn FnOnce() + Send + 'static>;

struct Shared {
    permits: Semaphore,
    metrics: Arc<PoolMetrics>,
    observer: Option<Arc<dyn PoolObserver>>,
}

impl Shared {
    fn emit(&self, event: PoolEvent) {
        if let Some(obs) = &self.observer {
            obs.on_event(&event);
        }
    }

    /// Run `job` under a permit. Panics become [`Error::Internal`].
    fn execute<T>(&self, job: impl FnOnce() -> Result<T>) -> Result<T> {
        let (_permit, waited) = self.permits.acquire();
        if waited > Duration::ZERO {
            self.metrics.on_throttle_wait(waited);
            self.emit(PoolEvent::ThrottleWaited { duration: waited });
        }

        let start = Instant::now();
        let active = self.metrics.on_job_start();
        self.emit(PoolEvent::JobStarted { active });

        let result = match panic::catch_unwind(AssertUnwindSafe(job)) {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(target: "pool", panic = %message, "job panicked");
                Err(Error::internal(message))
            }
        };

        let ok = result.is_ok();
        self.metrics.on_job_end(ok);
        self.emit(PoolEvent::JobFinished {
            elapsed: start.elapsed(),
            ok,
        });
        result
    }
}

/// Worker threads plus in-flight throttle.
pub struct WorkerPool {
    sender: Option<mpsc::Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
    shared: Arc<Shared>,
    opts: PoolOptions,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("opts", &self.opts)
            .field("metrics", &self.shared.metrics.snapshot())
            .finish()
    }
}

impl WorkerPool {
    pub fn new(opts: PoolOptions) -> Result<Self> {
        Self::build(opts, None)
    }

    /// Create a pool reporting every job to `observer`.
    pub fn with_observer(opts: PoolOptions, observer: Arc<dyn PoolObserver>) -> Result<Self> {
        Self::build(opts, Some(observer))
    }

    fn build(opts: PoolOptions, observer: Option<Arc<dyn PoolObserver>>) -> Result<Self> {
        let workers = opts.max_workers.max(1);
        let (sender, receiver) = mpsc::channel::<Task>();
        let receiver = Arc::new(Mutex::new(receiver));

        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let receiver = Arc::clone(&receiver);
            let handle = thread::Builder::new()
                .name(format!("tabular-worker-{i}"))
                .spawn(move || {
                    loop {
                        // The guard is released before the task runs.
                        let next = receiver
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner())
                            .recv();
                        match next {
                            Ok(task) => task(),
                            Err(_) => break,
                        }
                    }
                })
                .map_err(|e| Error::Config {
                    message: format!("cannot start worker pool: {e}"),
                })?;
            handles.push(handle);
        }

        let shared = Arc::new(Shared {
            permits: Semaphore::new(opts.max_in_flight.unwrap_or(workers)),
            metrics: Arc::new(PoolMetrics::new()),
            observer,
        });
        Ok(Self {
            sender: Some(sender),
            workers: handles,
            shared,
            opts,
        })
    }

    pub fn options(&self) -> &PoolOptions {
        &self.opts
    }

    /// Get a handle to live pool metrics.
    pub fn metrics(&self) -> Arc<PoolMetrics> {
        Arc::clone(&self.shared.metrics)
    }

    /// Run `job` on the calling thread once a permit is free, and return its result.
    ///
    /// Jobs must not call back into the same pool: permits are not reentrant.
    pub fn run<T, F>(&self, job: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        self.shared.execute(job)
    }

    /// Queue `job` on a worker thread and return immediately.
    pub fn spawn<T, F>(&self, job: F) -> JobHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        let shared = Arc::clone(&self.shared);
        let task: Task = Box::new(move || {
            let result = shared.execute(job);
            // The handle may have been dropped; nobody is waiting then.
            let _ = tx.send(result);
        });
        if let Some(sender) = &self.sender {
            // A send only fails once every worker is gone; the handle then reports it.
            let _ = sender.send(task);
        }
        JobHandle { rx }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the channel lets workers drain queued tasks and exit.
        drop(self.sender.take());
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::warn!(target: "pool", "worker thread panicked");
            }
        }
    }
}

/// Result of a [`WorkerPool::spawn`]ed job.
#[derive(Debug)]
pub struct JobHandle<T> {
    rx: mpsc::Receiver<Result<T>>,
}

impl<T> JobHandle<T> {
    /// Block until the job has finished.
    pub fn join(self) -> Result<T> {
        self.rx
            .recv()
            .map_err(|_| Error::internal("worker exited without reporting a result"))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn run_returns_job_result() {
        let pool = WorkerPool::new(PoolOptions::default()).unwrap();
        assert_eq!(pool.run(|| Ok(21 * 2)).unwrap(), 42);
        let snap = pool.metrics().snapshot();
        assert_eq!(snap.jobs_started, 1);
        assert_eq!(snap.jobs_finished, 1);
        assert_eq!(snap.active, 0);
    }

    #[test]
    fn panics_become_internal_errors() {
        let pool = WorkerPool::new(PoolOptions::default()).unwrap();
        let err = pool.run(|| -> Result<()> { panic!("boom") }).unwrap_err();
        assert!(matches!(err, Error::Internal { ref message } if message == "boom"));
        assert_eq!(pool.metrics().snapshot().jobs_failed, 1);
        // The pool keeps working.
        assert_eq!(pool.run(|| Ok(1)).unwrap(), 1);
    }

    #[test]
    fn max_in_flight_throttles_jobs() {
        let pool = WorkerPool::new(PoolOptions {
            max_workers: 4,
            max_in_flight: Some(1),
        })
        .unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<JobHandle<()>> = (0..8)
            .map(|_| {
                let active = Arc::clone(&active);
                let max_seen = Arc::clone(&max_seen);
                pool.spawn(move || {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(2));
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        let snap = pool.metrics().snapshot();
        assert_eq!(snap.jobs_finished, 8);
        assert_eq!(snap.max_active, 1);
        assert!(snap.throttle_wait > Duration::ZERO);
    }

    #[test]
    fn rayon_fan_out_inside_a_job_does_not_block_queued_callers() {
        let pool = Arc::new(
            WorkerPool::new(PoolOptions {
                max_workers: 2,
                max_in_flight: Some(1),
            })
            .unwrap(),
        );
        let (done_tx, done_rx) = mpsc::channel();

        let first = {
            let pool = Arc::clone(&pool);
            let done_tx = done_tx.clone();
            std::thread::spawn(move || {
                let result = pool.run(|| {
                    rayon::join(
                        || std::thread::sleep(Duration::from_millis(10)),
                        || std::thread::sleep(Duration::from_millis(400)),
                    );
                    Ok(1)
                });
                done_tx.send(result.unwrap()).unwrap();
            })
        };
        let second = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(100));
                done_tx.send(pool.run(|| Ok(2)).unwrap()).unwrap();
            })
        };

        let mut finished = Vec::new();
        for _ in 0..2 {
            finished.push(done_rx.recv_timeout(Duration::from_secs(5)).unwrap());
        }
        finished.sort_unstable();
        assert_eq!(finished, vec![1, 2]);
        first.join().unwrap();
        second.join().unwrap();
    }

    #[test]
    fn spawned_jobs_may_use_rayon() {
        use rayon::prelude::*;

        let pool = WorkerPool::new(PoolOptions {
            max_workers: 2,
            max_in_flight: Some(1),
        })
        .unwrap();
        let handles: Vec<JobHandle<u64>> = (0..4u64)
            .map(|n| pool.spawn(move || Ok((0..1_000u64).into_par_iter().map(|x| x * n).sum())))
            .collect();
        let sums: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(sums, vec![0, 499_500, 999_000, 1_498_500]);
    }

    #[test]
    fn dropping_the_pool_finishes_queued_jobs() {
        let pool = WorkerPool::new(PoolOptions {
            max_workers: 1,
            max_in_flight: None,
        })
        .unwrap();
        let handles: Vec<JobHandle<usize>> = (0..3).map(|i| pool.spawn(move || Ok(i))).collect();
        drop(pool);
        let got: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(got, vec![0, 1, 2]);
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl PoolObserver for Recorder {
        fn on_event(&self, event: &PoolEvent) {
            let name = match event {
                PoolEvent::ThrottleWaited { .. } => "wait",
                PoolEvent::JobStarted { .. } => "start",
                PoolEvent::JobFinished { ok: true, .. } => "ok",
                PoolEvent::JobFinished { ok: false, .. } => "failed",
            };
            self.0.lock().unwrap().push(name.to_string());
        }
    }

    #[test]
    fn observer_sees_job_lifecycle() {
        let recorder = Arc::new(Recorder::default());
        let pool = WorkerPool::with_observer(PoolOptions::default(), recorder.clone()).unwrap();
        pool.run(|| Ok(())).unwrap();
        let _ = pool.run(|| -> Result<()> { Err(Error::NotFound("x".into())) });
        assert_eq!(*recorder.0.lock().unwrap(), vec!["start", "ok", "start", "failed"]);
    }
}
