//! Bounded-concurrency job pool with a drain-and-stop lifecycle.
//!
//! [`BoundedTaskPool`] starts queued [`Job`]s in FIFO order, never running
//! more than `capacity` of them at once. Scheduling is event driven: every
//! [`enqueue`](BoundedTaskPool::enqueue) and every job completion starts as
//! many queued jobs as there are free slots. [`flush`](BoundedTaskPool::flush)
//! switches the pool to draining and waits until nothing is queued or running.
//! Jobs enqueued while draining are still run and awaited by that flush; once
//! the pool is done it rejects further work.

use std::collections::VecDeque;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use drainpool_core::PoolConfig;

use crate::error::{JobError, PoolError};
use crate::job::{self, Callback, Job, JobId, JobOutcome, Task};
use crate::stats::PoolStats;

const DEFAULT_POOL_NAME: &str = "default";

// ── Shared state ─────────────────────────────────────────────────────

#[derive(Default)]
struct PoolState {
    pending: VecDeque<Job>,
    in_flight: usize,
    draining: bool,
    done: bool,
    /// Set once a job task is dropped unfinished, i.e. the runtime stopped.
    runtime_lost: bool,
    started: u64,
    succeeded: u64,
    failed: u64,
}

struct Inner {
    name: String,
    capacity: usize,
    runtime: Handle,
    state: Mutex<PoolState>,
    /// Flips to `true` exactly once, when the pool reaches done.
    drained: watch::Sender<bool>,
}

/// Jobs taken off the queue under the lock, to be launched after it is released.
struct Ready {
    jobs: Vec<(Slot, Task)>,
    runtime_lost: bool,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // Callbacks, jobs and job drops never run under the lock, so a
        // poisoned guard still holds consistent counters.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim a slot for each queued job that fits, in FIFO order, then check
    /// for drain completion.
    ///
    /// Start order is fixed here, under the lock. Once the runtime is lost
    /// nothing can run, so every pending job is taken out to be failed.
    fn take_ready(self: &Arc<Self>, state: &mut PoolState) -> Ready {
        let mut jobs = Vec::new();
        while state.runtime_lost || state.in_flight < self.capacity {
            let Some(job) = state.pending.pop_front() else {
                break;
            };
            let holds_capacity = !state.runtime_lost;
            if holds_capacity {
                state.in_flight += 1;
                state.started += 1;
            }
            let (job_id, job_name, task, on_complete) = job.into_parts();
            jobs.push((
                Slot {
                    inner: Arc::clone(self),
                    job_id,
                    job_name,
                    on_complete,
                    holds_capacity,
                    outcome: None,
                },
                task,
            ));
        }
        self.mark_done_if_drained(state);
        Ready {
            jobs,
            runtime_lost: state.runtime_lost,
        }
    }

    /// Spawn claimed jobs. Must be called without the lock held: a runtime
    /// that has shut down drops the task on the spot, and the slot's drop
    /// takes the lock.
    fn launch(&self, ready: Ready) {
        for (slot, task) in ready.jobs {
            if ready.runtime_lost {
                drop((slot, task));
            } else {
                self.runtime.spawn(run_job(slot, task));
            }
        }
    }

    fn mark_done_if_drained(&self, state: &mut PoolState) {
        if state.draining && !state.done && state.in_flight == 0 && state.pending.is_empty() {
            state.done = true;
            info!(
                pool = %self.name,
                succeeded = state.succeeded,
                failed = state.failed,
                "Pool drained"
            );
            self.drained.send_replace(true);
        }
    }

    fn snapshot(&self, state: &PoolState) -> PoolStats {
        PoolStats {
            name: self.name.clone(),
            capacity: self.capacity,
            pending: state.pending.len(),
            in_flight: state.in_flight,
            started: state.started,
            succeeded: state.succeeded,
            failed: state.failed,
            draining: state.draining,
            done: state.done,
        }
    }
}

// ── Slots ────────────────────────────────────────────────────────────

/// One claimed unit of capacity, held by a job from dequeue until it settles.
///
/// Dropping the slot runs the completion callback and releases the capacity.
/// A slot dropped without an outcome belongs to a task the runtime discarded
/// (shut down before or while the job ran); the job is recorded as
/// [`JobError::Dropped`] and the pool stops spawning on that runtime.
struct Slot {
    inner: Arc<Inner>,
    job_id: JobId,
    job_name: String,
    on_complete: Option<Callback>,
    /// False for jobs failed without running after the runtime was lost.
    holds_capacity: bool,
    outcome: Option<JobOutcome>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        let (outcome, abandoned) = match self.outcome.take() {
            Some(outcome) => (outcome, false),
            None => {
                warn!(
                    pool = %self.inner.name,
                    job_id = %self.job_id,
                    job = %self.job_name,
                    "Job dropped before completion"
                );
                (JobOutcome::Failed(JobError::Dropped), true)
            }
        };

        if let Some(callback) = self.on_complete.take() {
            if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(|| callback(&outcome))) {
                warn!(
                    pool = %self.inner.name,
                    job_id = %self.job_id,
                    job = %self.job_name,
                    error = %JobError::from_panic(payload.as_ref()),
                    "Completion callback panicked"
                );
            }
        }

        let ready = {
            let mut state = self.inner.lock();
            if self.holds_capacity {
                state.in_flight -= 1;
            }
            state.runtime_lost |= abandoned;
            if outcome.is_success() {
                state.succeeded += 1;
            } else {
                state.failed += 1;
            }
            self.inner.take_ready(&mut state)
        };
        self.inner.launch(ready);
    }
}

/// Run one job on its own task and record the outcome in its slot.
///
/// The slot is moved into the task before its first poll, so a task dropped
/// unpolled still releases it.
async fn run_job(mut slot: Slot, task: Task) {
    debug!(pool = %slot.inner.name, job_id = %slot.job_id, job = %slot.job_name, "Job started");

    let outcome = job::execute(task).await;
    match &outcome {
        JobOutcome::Succeeded => {
            debug!(pool = %slot.inner.name, job_id = %slot.job_id, job = %slot.job_name, "Job finished");
        }
        JobOutcome::Failed(e) => {
            warn!(
                pool = %slot.inner.name,
                job_id = %slot.job_id,
                job = %slot.job_name,
                error = %e,
                "Job failed"
            );
        }
    }
    slot.outcome = Some(outcome);
}

// ── BoundedTaskPool ──────────────────────────────────────────────────

/// Runs at most `capacity` [`Job`]s concurrently on a Tokio runtime.
///
/// Cloning gives another handle to the same pool, so several producer tasks
/// can enqueue into one pool and any of them can flush it.
///
/// A job's failure (an `Err` or a panic) is logged, passed to its callback,
/// and otherwise treated like success: the slot is released and the pool
/// keeps going. There are no retries, priorities, or cancellation; a job that
/// needs a deadline wraps its own future in `tokio::time::timeout`.
#[derive(Clone)]
pub struct BoundedTaskPool {
    inner: Arc<Inner>,
}

impl BoundedTaskPool {
    /// Create a pool on the current Tokio runtime.
    pub fn new(capacity: usize) -> Result<Self, PoolError> {
        Self::named(DEFAULT_POOL_NAME, capacity)
    }

    /// Create a pool on the current Tokio runtime with a log label.
    pub fn named(name: impl Into<String>, capacity: usize) -> Result<Self, PoolError> {
        validate_capacity(capacity)?;
        let runtime = Handle::try_current().map_err(|e| PoolError::NoRuntime(e.to_string()))?;
        Self::with_handle(name, capacity, runtime)
    }

    /// Create a pool that spawns its jobs on `runtime`.
    ///
    /// If that runtime shuts down, unfinished and queued jobs settle as
    /// [`JobError::Dropped`] and `flush` still resolves.
    pub fn with_handle(
        name: impl Into<String>,
        capacity: usize,
        runtime: Handle,
    ) -> Result<Self, PoolError> {
        validate_capacity(capacity)?;
        let (drained, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(Inner {
                name: name.into(),
                capacity,
                runtime,
                state: Mutex::new(PoolState::default()),
                drained,
            }),
        })
    }

    /// Create a pool from loaded configuration.
    pub fn from_config(config: &PoolConfig) -> Result<Self, PoolError> {
        Self::named(config.name.clone(), config.capacity)
    }

    /// Queue a job and start it right away if a slot is free.
    ///
    /// Never waits for the job. Fails with [`PoolError::Completed`] once the
    /// pool is done; the pool is left untouched in that case.
    pub fn enqueue(&self, job: Job) -> Result<(), PoolError> {
        let ready = {
            let mut state = self.inner.lock();
            if state.done {
                drop(state);
                return Err(PoolError::Completed);
            }
            debug!(
                pool = %self.inner.name,
                job_id = %job.id(),
                job = %job.name(),
                pending = state.pending.len() + 1,
                "Job enqueued"
            );
            state.pending.push_back(job);
            self.inner.take_ready(&mut state)
        };
        self.inner.launch(ready);
        Ok(())
    }

    /// Stop the pool once all work has finished, and wait for that.
    ///
    /// Resolves when every job enqueued before or during the drain has
    /// settled and its callback has run. Calling it again after the pool is
    /// done returns immediately.
    pub async fn flush(&self) {
        let mut drained = self.inner.drained.subscribe();
        {
            let mut state = self.inner.lock();
            if !state.draining {
                state.draining = true;
                info!(
                    pool = %self.inner.name,
                    pending = state.pending.len(),
                    in_flight = state.in_flight,
                    "Pool draining"
                );
            }
            self.inner.mark_done_if_drained(&mut state);
        }
        // The sender lives in `inner`, which we hold, so this only ends on `true`.
        let _ = drained.wait_for(|done| *done).await;
    }

    /// Whether the pool has drained and will reject new jobs.
    pub fn is_done(&self) -> bool {
        self.inner.lock().done
    }

    pub fn is_draining(&self) -> bool {
        self.inner.lock().draining
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock();
        self.inner.snapshot(&state)
    }
}

impl fmt::Debug for BoundedTaskPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedTaskPool")
            .field("stats", &self.stats())
            .finish()
    }
}

fn validate_capacity(capacity: usize) -> Result<(), PoolError> {
    if capacity == 0 {
        return Err(PoolError::InvalidCapacity(capacity));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(
            BoundedTaskPool::new(0),
            Err(PoolError::InvalidCapacity(0))
        ));
    }

    #[test]
    fn test_requires_runtime() {
        assert!(matches!(
            BoundedTaskPool::new(2),
            Err(PoolError::NoRuntime(_))
        ));
    }

    #[test]
    fn test_with_handle_outside_runtime_context() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let pool = BoundedTaskPool::with_handle("outside", 2, rt.handle().clone()).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        pool.enqueue(Job::new("one", move || async move {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .unwrap();
        rt.block_on(pool.flush());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(pool.is_done());
    }

    fn collect_outcomes(outcomes: &Arc<Mutex<Vec<JobOutcome>>>) -> impl FnOnce(&JobOutcome) + Send {
        let outcomes = outcomes.clone();
        move |outcome| outcomes.lock().unwrap().push(outcome.clone())
    }

    #[test]
    fn test_runtime_shutdown_releases_running_and_queued_jobs() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let pool = BoundedTaskPool::with_handle("stopping", 1, rt.handle().clone()).unwrap();
        let outcomes = Arc::new(Mutex::new(Vec::new()));

        for name in ["long", "queued"] {
            pool.enqueue(
                Job::new(name, || async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                })
                .on_complete(collect_outcomes(&outcomes)),
            )
            .unwrap();
        }
        rt.shutdown_timeout(Duration::from_millis(10));

        let other = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        other
            .block_on(async { tokio::time::timeout(Duration::from_millis(500), pool.flush()).await })
            .expect("flush should resolve once the runtime has stopped");

        let stats = pool.stats();
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.failed, 2);
        assert!(stats.done);
        assert_eq!(
            *outcomes.lock().unwrap(),
            vec![JobOutcome::Failed(JobError::Dropped); 2]
        );
    }

    /// Reads pool stats from its destructor, which must not run under the pool lock.
    struct ReadsStatsOnDrop {
        pool: BoundedTaskPool,
        dropped: Arc<AtomicUsize>,
    }

    impl Drop for ReadsStatsOnDrop {
        fn drop(&mut self) {
            let _ = self.pool.stats();
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_enqueue_on_stopped_runtime_fails_job_without_deadlock() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let handle = rt.handle().clone();
        drop(rt);

        let pool = BoundedTaskPool::with_handle("stopped", 1, handle).unwrap();
        let dropped = Arc::new(AtomicUsize::new(0));
        let outcomes = Arc::new(Mutex::new(Vec::new()));

        let (tx, rx) = std::sync::mpsc::channel();
        let producer = pool.clone();
        let guard = ReadsStatsOnDrop {
            pool: pool.clone(),
            dropped: dropped.clone(),
        };
        let on_complete = collect_outcomes(&outcomes);
        std::thread::spawn(move || {
            let job = Job::new("doomed", move || async move {
                let _guard = guard;
                Ok(())
            })
            .on_complete(on_complete);
            let _ = tx.send(producer.enqueue(job).is_ok());
        });

        let enqueued = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("enqueue should not deadlock");
        assert!(enqueued);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        assert_eq!(
            *outcomes.lock().unwrap(),
            vec![JobOutcome::Failed(JobError::Dropped)]
        );

        let stats = pool.stats();
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.failed, 1);

        let other = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        other
            .block_on(async { tokio::time::timeout(Duration::from_secs(1), pool.flush()).await })
            .expect("flush should resolve");
        assert!(pool.is_done());
    }

    #[tokio::test]
    async fn test_empty_flush_resolves_immediately() {
        let pool = BoundedTaskPool::new(1).unwrap();
        assert!(!pool.is_done());
        pool.flush().await;
        assert!(pool.is_done());
        assert!(pool.is_draining());
    }

    #[tokio::test]
    async fn test_second_flush_is_noop() {
        let pool = BoundedTaskPool::new(2).unwrap();
        pool.enqueue(Job::new("a", || async { Ok(()) })).unwrap();
        pool.flush().await;
        let before = pool.stats();
        tokio::time::timeout(Duration::from_secs(1), pool.flush())
            .await
            .expect("second flush should resolve at once");
        assert_eq!(pool.stats(), before);
    }

    #[tokio::test]
    async fn test_enqueue_after_done_rejected() {
        let pool = BoundedTaskPool::new(2).unwrap();
        pool.enqueue(Job::new("a", || async { Ok(()) })).unwrap();
        pool.flush().await;
        let before = pool.stats();

        let err = pool.enqueue(Job::new("late", || async { Ok(()) })).unwrap_err();
        assert!(matches!(err, PoolError::Completed));
        assert_eq!(pool.stats(), before);
    }

    #[tokio::test]
    async fn test_from_config_uses_name_and_capacity() {
        let config = PoolConfig {
            name: "uploads".to_string(),
            capacity: 4,
        };
        let pool = BoundedTaskPool::from_config(&config).unwrap();
        assert_eq!(pool.name(), "uploads");
        assert_eq!(pool.capacity(), 4);
        assert_eq!(pool.stats().name, "uploads");
    }

    #[tokio::test]
    async fn test_stats_counts_outcomes() {
        let pool = BoundedTaskPool::new(2).unwrap();
        pool.enqueue(Job::new("ok", || async { Ok(()) })).unwrap();
        pool.enqueue(Job::new("bad", || async { anyhow::bail!("nope") }))
            .unwrap();
        pool.flush().await;

        let stats = pool.stats();
        assert_eq!(stats.started, 2);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.pending, 0);
        assert!(stats.done);
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let pool = BoundedTaskPool::new(1).unwrap();
        let other = pool.clone();
        other.enqueue(Job::new("a", || async { Ok(()) })).unwrap();
        pool.flush().await;
        assert!(other.is_done());
        assert_eq!(other.stats().succeeded, 1);
    }
}
