//! Shared background workers for housekeeping and prototyping.
//!
//! A fixed number of tokio tasks serve every registered pool. Jobs sit in a
//! min-heap keyed by due time; a worker takes the earliest due job, runs it
//! on the blocking pool, and goes back to waiting. Housekeeping jobs
//! reschedule themselves from the pool's current definition, so a hot-swapped
//! interval takes effect on the next cycle.
//!
//! Jobs hold a `Weak` reference to their pool. A dropped or shut-down pool
//! makes its jobs no-ops and they are not rescheduled.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::pool::ConnectionPool;

/// Upper bound on an idle worker's wait when the queue is empty.
const IDLE_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobKind {
    HouseKeep,
    Prototype,
}

struct Job {
    due: Instant,
    seq: u64,
    kind: JobKind,
    pool: Weak<ConnectionPool>,
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Job {}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Job {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.due
            .cmp(&other.due)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

#[derive(Default)]
struct JobQueue {
    heap: Mutex<BinaryHeap<Reverse<Job>>>,
    notify: Notify,
    seq: AtomicU64,
}

enum Next {
    Ready(Job),
    Wait(Option<Instant>),
}

impl JobQueue {
    fn push(&self, kind: JobKind, pool: Weak<ConnectionPool>, due: Instant) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.heap.lock().push(Reverse(Job {
            due,
            seq,
            kind,
            pool,
        }));
        self.notify.notify_one();
    }

    fn next(&self) -> Next {
        let mut heap = self.heap.lock();
        match heap.peek() {
            Some(Reverse(job)) if job.due <= Instant::now() => match heap.pop() {
                Some(Reverse(job)) => Next::Ready(job),
                None => Next::Wait(None),
            },
            Some(Reverse(job)) => Next::Wait(Some(job.due)),
            None => Next::Wait(None),
        }
    }

    fn len(&self) -> usize {
        self.heap.lock().len()
    }
}

/// The queue side of the scheduler, held by each attached pool.
#[derive(Clone)]
pub struct SchedulerHandle {
    queue: Arc<JobQueue>,
}

impl SchedulerHandle {
    pub(crate) fn schedule_prototype(&self, pool: Weak<ConnectionPool>) {
        self.queue.push(JobKind::Prototype, pool, Instant::now());
    }

    fn schedule_housekeeping(&self, pool: Weak<ConnectionPool>, after: Duration) {
        self.queue
            .push(JobKind::HouseKeep, pool, Instant::now() + after);
    }

    /// A queue with no workers behind it.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self {
            queue: Arc::new(JobQueue::default()),
        }
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.queue.len()
    }
}

impl std::fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("pending", &self.queue.len())
            .finish()
    }
}

/// Fixed set of worker tasks shared by all pools.
pub struct SweepScheduler {
    handle: SchedulerHandle,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl SweepScheduler {
    /// Spawn `workers` worker tasks (at least one). Must be called from
    /// within a tokio runtime.
    pub fn start(workers: usize) -> Self {
        let workers = workers.max(1);
        let queue = Arc::new(JobQueue::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handles = (0..workers)
            .map(|index| {
                let queue = queue.clone();
                let shutdown = shutdown_rx.clone();
                tokio::spawn(async move {
                    run_worker(index, queue, shutdown).await;
                })
            })
            .collect();

        info!(workers, "sweep scheduler started");

        Self {
            handle: SchedulerHandle { queue },
            shutdown_tx,
            workers: Mutex::new(handles),
            stopped: AtomicBool::new(false),
        }
    }

    /// Attach a pool: queue an immediate prototype pass and the first sweep.
    /// Returns `false` if the pool is already attached to a scheduler.
    pub fn register(&self, pool: &Arc<ConnectionPool>) -> bool {
        if !pool.attach(self.handle.clone()) {
            return false;
        }
        let interval = pool.definition().house_keeping_sleep_time();
        self.handle
            .schedule_housekeeping(Arc::downgrade(pool), interval);
        pool.wake_prototyper();
        debug!(alias = %pool.alias(), interval_ms = interval.as_millis() as u64, "pool attached to sweep scheduler");
        true
    }

    /// Jobs waiting in the queue.
    pub fn pending_jobs(&self) -> usize {
        self.handle.queue.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stop the workers and wait for them to exit. A job already running on
    /// the blocking pool finishes first. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            debug!("sweep scheduler already stopped");
            return;
        }
        let _ = self.shutdown_tx.send(true);
        let workers: Vec<_> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "sweep worker ended abnormally");
            }
        }
        info!("sweep scheduler stopped");
    }
}

impl Drop for SweepScheduler {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn run_worker(index: usize, queue: Arc<JobQueue>, mut shutdown: watch::Receiver<bool>) {
    debug!(worker = index, "sweep worker starting");
    loop {
        if *shutdown.borrow() {
            break;
        }
        match queue.next() {
            Next::Ready(job) => run_job(&queue, job).await,
            Next::Wait(due) => {
                let deadline = due.unwrap_or_else(|| Instant::now() + IDLE_WAIT);
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = queue.notify.notified() => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
    }
    debug!(worker = index, "sweep worker stopped");
}

async fn run_job(queue: &Arc<JobQueue>, job: Job) {
    let Some(pool) = job.pool.upgrade() else {
        return;
    };
    if pool.is_shutting_down() {
        return;
    }

    match job.kind {
        JobKind::HouseKeep => {
            let sweeper = pool.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || sweeper.sweep()).await {
                error!(alias = %pool.alias(), error = %e, "housekeeping sweep failed");
            }
            if !pool.is_shutting_down() {
                let interval = pool.definition().house_keeping_sleep_time();
                queue.push(
                    JobKind::HouseKeep,
                    Arc::downgrade(&pool),
                    Instant::now() + interval,
                );
            }
        }
        JobKind::Prototype => {
            pool.clear_prototype_pending();
            let builder = pool.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || builder.prototype()).await {
                error!(alias = %pool.alias(), error = %e, "prototyping failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::test_support::*;

    async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    #[test]
    fn jobs_order_by_due_then_seq() {
        let queue = JobQueue::default();
        let now = Instant::now();
        queue.push(JobKind::HouseKeep, Weak::new(), now + Duration::from_secs(10));
        queue.push(JobKind::Prototype, Weak::new(), now);
        queue.push(JobKind::HouseKeep, Weak::new(), now);

        let Next::Ready(first) = queue.next() else {
            panic!("expected a ready job");
        };
        assert_eq!(first.kind, JobKind::Prototype);
        let Next::Ready(second) = queue.next() else {
            panic!("expected a ready job");
        };
        assert_eq!(second.kind, JobKind::HouseKeep);
        assert!(matches!(queue.next(), Next::Wait(Some(_))));
    }

    #[test]
    fn prototype_wakes_coalesce() {
        let factory = MockFactory::new();
        let pool = ConnectionPool::builder("main", definition(1, 3), factory)
            .build()
            .unwrap();
        let handle = SchedulerHandle::detached();
        assert!(pool.attach(handle.clone()));
        assert!(!pool.attach(handle.clone()));

        for _ in 0..50 {
            pool.wake_prototyper();
        }
        assert_eq!(handle.pending(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn registered_pool_is_prototyped() {
        let scheduler = SweepScheduler::start(2);
        let factory = MockFactory::new();
        let pool = ConnectionPool::builder("main", definition(2, 5), factory.clone())
            .build()
            .unwrap();

        assert!(scheduler.register(&pool));
        assert!(!scheduler.register(&pool));
        assert!(wait_for(|| pool.available_count() == 2).await);
        assert_eq!(factory.builds(), 2);

        scheduler.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn housekeeping_repeats_on_interval() {
        let scheduler = SweepScheduler::start(1);
        let factory = MockFactory::new();
        let mut def = definition(1, 3);
        def.house_keeping_sleep_time_ms = 20;
        def.maximum_connection_lifetime_ms = 50;
        let pool = ConnectionPool::builder("main", def, factory.clone())
            .build()
            .unwrap();
        scheduler.register(&pool);

        // Aged connections are expired by sweeps and replaced by prototyping.
        assert!(wait_for(|| factory.builds() >= 3).await);
        assert!(pool.live_count() <= 3);

        scheduler.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dropped_pool_jobs_are_discarded() {
        let scheduler = SweepScheduler::start(1);
        let factory = MockFactory::new();
        let mut def = definition(0, 3);
        def.house_keeping_sleep_time_ms = 10;
        let pool = ConnectionPool::builder("main", def, factory)
            .build()
            .unwrap();
        scheduler.register(&pool);
        drop(pool);

        assert!(wait_for(|| scheduler.pending_jobs() == 0).await);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let scheduler = SweepScheduler::start(3);
        scheduler.shutdown().await;
        assert!(scheduler.is_stopped());
        scheduler.shutdown().await;
    }
}
