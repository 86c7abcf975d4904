//! Fixed-capacity job scheduler.
//!
//! Jobs live in an index arena owned by the [`JobScheduler`]. Callers hold
//! [`JobHandle`]s (`index` + `version`), wire them together with
//! [`JobScheduler::add_dependency`], then [`enqueue`](JobScheduler::enqueue) the root
//! of the graph and [`wait`](JobScheduler::wait) for it.
//!
//! ## Rules
//!
//! - A job runs at most once, and only after every job it depends on has completed.
//! - Jobs without a callback are barriers: they complete as soon as they become ready.
//! - Slots return to the free-list only once every allocated job has completed, so
//!   handles stay valid for the whole lifetime of a graph. A handle whose slot has been
//!   recycled is detected through its version and always reports as complete.
//! - `wait` called from a worker of the same scheduler keeps running ready jobs while it
//!   blocks, so jobs may wait on other jobs without starving the pool.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::cell::Cell;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{debug, error, trace};

/// Default number of job slots in the arena.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Work attached to a job.
pub type JobFn = Box<dyn FnOnce() + Send + 'static>;

static NEXT_SCHEDULER_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    // (scheduler id, worker index) for pool threads.
    static WORKER: Cell<Option<(usize, usize)>> = const { Cell::new(None) };
}

/// Non-owning reference to a job slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobHandle {
    index: u32,
    version: u32,
}

impl JobHandle {
    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub fn version(&self) -> u32 {
        self.version
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("job arena exhausted: all {capacity} slots are in use")]
    CapacityExhausted { capacity: usize },
    #[error("stale job handle (slot {}, version {})", .0.index, .0.version)]
    StaleHandle(JobHandle),
    #[error("job in slot {} is already enqueued; dependencies must be added first", .0.index)]
    AlreadyEnqueued(JobHandle),
    #[error("job in slot {} was never enqueued", .0.index)]
    NotEnqueued(JobHandle),
    #[error("job in slot {} cannot depend on itself", .0.index)]
    SelfDependency(JobHandle),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Default)]
struct Slot {
    version: u32,
    allocated: bool,
    callback: Option<JobFn>,
    pending: usize,
    dependencies: Vec<u32>,
    dependents: Vec<u32>,
    enqueued: bool,
    completed: bool,
}

struct State {
    slots: Vec<Slot>,
    free: Vec<u32>,
    ready: VecDeque<u32>,
    /// Allocated jobs that have not completed yet.
    outstanding: usize,
    shutdown: bool,
}

impl State {
    fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, Slot::default);
        Self {
            slots,
            free: (0..capacity as u32).rev().collect(),
            ready: VecDeque::new(),
            outstanding: 0,
            shutdown: false,
        }
    }

    fn is_current(&self, handle: JobHandle) -> bool {
        self.slots
            .get(handle.index())
            .is_some_and(|slot| slot.allocated && slot.version == handle.version)
    }

    fn check(&self, handle: JobHandle) -> Result<(), JobError> {
        if self.is_current(handle) {
            Ok(())
        } else {
            Err(JobError::StaleHandle(handle))
        }
    }

    /// Hands every slot back to the free-list. Only valid once nothing is outstanding.
    fn recycle(&mut self) {
        debug_assert_eq!(self.outstanding, 0);
        self.free.clear();
        for (index, slot) in self.slots.iter_mut().enumerate().rev() {
            if slot.allocated {
                slot.allocated = false;
                slot.version = slot.version.wrapping_add(1);
                slot.callback = None;
                slot.dependencies.clear();
                slot.dependents.clear();
            }
            self.free.push(index as u32);
        }
    }
}

struct Shared {
    id: usize,
    state: Mutex<State>,
    /// Signalled when a job is pushed to the ready queue.
    work: Condvar,
    /// Signalled whenever a job completes or becomes ready.
    progress: Condvar,
}

impl Shared {
    fn run(&self, index: u32) {
        let callback = self.state.lock().slots[index as usize].callback.take();
        if let Some(callback) = callback
            && let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback))
        {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(slot = index, %reason, "job callback panicked");
        }
        self.complete(index);
    }

    fn complete(&self, index: u32) {
        let mut state = self.state.lock();
        let slot = &mut state.slots[index as usize];
        slot.completed = true;
        let dependents = std::mem::take(&mut slot.dependents);

        let mut woken = 0;
        for dependent in dependents {
            let slot = &mut state.slots[dependent as usize];
            slot.pending -= 1;
            if slot.pending == 0 && slot.enqueued && !slot.completed {
                state.ready.push_back(dependent);
                woken += 1;
            }
        }

        state.outstanding -= 1;
        trace!(slot = index, outstanding = state.outstanding, "job completed");
        if state.outstanding == 0 {
            state.recycle();
        }
        drop(state);

        for _ in 0..woken {
            self.work.notify_one();
        }
        self.progress.notify_all();
    }
}

/// Runs jobs on a fixed pool of worker threads.
pub struct JobScheduler {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl JobScheduler {
    /// Creates a scheduler with `threads` workers and [`DEFAULT_CAPACITY`] slots.
    pub fn new(threads: usize) -> Result<Self, JobError> {
        Self::with_capacity(threads, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(threads: usize, capacity: usize) -> Result<Self, JobError> {
        let shared = Arc::new(Shared {
            id: NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(State::new(capacity)),
            work: Condvar::new(),
            progress: Condvar::new(),
        });

        let threads = threads.max(1);
        let mut scheduler = Self {
            shared,
            workers: Vec::with_capacity(threads),
        };
        for worker in 0..threads {
            let shared = Arc::clone(&scheduler.shared);
            let handle = thread::Builder::new()
                .name(format!("kiln-worker-{worker}"))
                .spawn(move || worker_loop(shared, worker))?;
            scheduler.workers.push(handle);
        }
        debug!(threads, capacity, "job scheduler started");
        Ok(scheduler)
    }

    /// Number of worker threads matching the host's available parallelism.
    pub fn default_threads() -> usize {
        thread::available_parallelism().map_or(1, |n| n.get())
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Allocates a job slot. `None` creates a barrier job.
    pub fn create_job(&self, callback: Option<JobFn>) -> Result<JobHandle, JobError> {
        let mut state = self.shared.state.lock();
        let Some(index) = state.free.pop() else {
            return Err(JobError::CapacityExhausted {
                capacity: state.slots.len(),
            });
        };
        state.outstanding += 1;

        let slot = &mut state.slots[index as usize];
        slot.allocated = true;
        slot.callback = callback;
        slot.pending = 0;
        slot.enqueued = false;
        slot.completed = false;
        Ok(JobHandle {
            index,
            version: slot.version,
        })
    }

    /// Shorthand for [`create_job`](Self::create_job) with a closure.
    pub fn create<F>(&self, callback: F) -> Result<JobHandle, JobError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.create_job(Some(Box::new(callback)))
    }

    pub fn create_barrier(&self) -> Result<JobHandle, JobError> {
        self.create_job(None)
    }

    /// Declares that `job` may not start before `depends_on` has completed.
    ///
    /// # Errors
    ///
    /// * [`JobError::AlreadyEnqueued`] if `job` has already been enqueued.
    /// * [`JobError::StaleHandle`] if either handle no longer refers to a live job.
    pub fn add_dependency(&self, job: JobHandle, depends_on: JobHandle) -> Result<(), JobError> {
        if job == depends_on {
            return Err(JobError::SelfDependency(job));
        }

        let mut state = self.shared.state.lock();
        state.check(job)?;
        state.check(depends_on)?;
        if state.slots[job.index()].enqueued {
            return Err(JobError::AlreadyEnqueued(job));
        }
        if state.slots[depends_on.index()].completed {
            return Ok(());
        }

        state.slots[depends_on.index()].dependents.push(job.index);
        let slot = &mut state.slots[job.index()];
        slot.dependencies.push(depends_on.index);
        slot.pending += 1;
        Ok(())
    }

    /// Makes `job` and everything it depends on eligible to run. Calling it again on
    /// an already enqueued job does nothing.
    pub fn enqueue(&self, job: JobHandle) -> Result<(), JobError> {
        let mut state = self.shared.state.lock();
        state.check(job)?;

        let mut pushed = 0;
        let mut stack = vec![job.index];
        while let Some(index) = stack.pop() {
            let slot = &mut state.slots[index as usize];
            if slot.enqueued {
                continue;
            }
            slot.enqueued = true;
            let ready = slot.pending == 0;
            stack.extend_from_slice(&state.slots[index as usize].dependencies);
            if ready {
                state.ready.push_back(index);
                pushed += 1;
            }
        }
        drop(state);

        for _ in 0..pushed {
            self.shared.work.notify_one();
        }
        if pushed > 0 {
            self.shared.progress.notify_all();
        }
        Ok(())
    }

    /// Blocks until `job` has completed.
    ///
    /// On a worker thread of this scheduler the caller keeps executing ready jobs
    /// while it waits.
    ///
    /// # Errors
    ///
    /// * [`JobError::NotEnqueued`] if the job can never run because it was not enqueued.
    pub fn wait(&self, job: JobHandle) -> Result<(), JobError> {
        let on_worker = self.thread_id().is_some();
        let mut state = self.shared.state.lock();
        loop {
            if !state.is_current(job) {
                // Recycled slots always belonged to completed jobs.
                return Ok(());
            }
            let slot = &state.slots[job.index()];
            if slot.completed {
                return Ok(());
            }
            if !slot.enqueued {
                return Err(JobError::NotEnqueued(job));
            }

            if on_worker && let Some(index) = state.ready.pop_front() {
                MutexGuard::unlocked(&mut state, || self.shared.run(index));
                continue;
            }
            self.shared.progress.wait(&mut state);
        }
    }

    /// True once the job has run. Recycled handles report `true`.
    pub fn is_complete(&self, job: JobHandle) -> bool {
        let state = self.shared.state.lock();
        !state.is_current(job) || state.slots[job.index()].completed
    }

    /// True while the handle still refers to the job it was created for.
    pub fn is_valid(&self, job: JobHandle) -> bool {
        self.shared.state.lock().is_current(job)
    }

    /// Index of the calling worker thread, `None` when called off the pool.
    pub fn thread_id(&self) -> Option<usize> {
        WORKER
            .with(Cell::get)
            .filter(|(scheduler, _)| *scheduler == self.shared.id)
            .map(|(_, worker)| worker)
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.work.notify_all();
        self.shared.progress.notify_all();

        let current = thread::current().id();
        for worker in self.workers.drain(..) {
            if worker.thread().id() != current {
                let _ = worker.join();
            }
        }
    }
}

fn worker_loop(shared: Arc<Shared>, worker: usize) {
    WORKER.with(|w| w.set(Some((shared.id, worker))));
    loop {
        let index = {
            let mut state = shared.state.lock();
            loop {
                if state.shutdown {
                    return;
                }
                if let Some(index) = state.ready.pop_front() {
                    break index;
                }
                shared.work.wait(&mut state);
            }
        };
        shared.run(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use std::sync::atomic::AtomicUsize;

    fn counter_job(scheduler: &JobScheduler, counter: &Arc<AtomicUsize>) -> JobHandle {
        let counter = Arc::clone(counter);
        scheduler
            .create(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
    }

    #[test]
    fn test_chain_runs_in_dependency_order() {
        let scheduler = JobScheduler::new(4).unwrap();
        let order = Arc::new(PlMutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..5 {
            let order = Arc::clone(&order);
            handles.push(scheduler.create(move || order.lock().push(i)).unwrap());
        }
        for pair in handles.windows(2) {
            scheduler.add_dependency(pair[1], pair[0]).unwrap();
        }

        let last = *handles.last().unwrap();
        scheduler.enqueue(last).unwrap();
        scheduler.wait(last).unwrap();

        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_barrier_aggregates_dependencies() {
        let scheduler = JobScheduler::new(3).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let barrier = scheduler.create_barrier().unwrap();
        for _ in 0..10 {
            let job = counter_job(&scheduler, &counter);
            scheduler.add_dependency(barrier, job).unwrap();
        }

        scheduler.enqueue(barrier).unwrap();
        scheduler.wait(barrier).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_enqueue_is_idempotent() {
        let scheduler = JobScheduler::new(2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let gate = scheduler.create_barrier().unwrap();
        let job = counter_job(&scheduler, &counter);
        scheduler.add_dependency(job, gate).unwrap();

        scheduler.enqueue(job).unwrap();
        scheduler.enqueue(job).unwrap();
        scheduler.enqueue(gate).unwrap();
        scheduler.wait(job).unwrap();
        scheduler.wait(job).unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_capacity_exhausted() {
        let scheduler = JobScheduler::with_capacity(1, 2).unwrap();
        scheduler.create_barrier().unwrap();
        scheduler.create_barrier().unwrap();

        let err = scheduler.create_barrier().unwrap_err();
        assert!(matches!(err, JobError::CapacityExhausted { capacity: 2 }));
    }

    #[test]
    fn test_dependency_after_enqueue_rejected() {
        let scheduler = JobScheduler::new(1).unwrap();
        let gate = scheduler.create_barrier().unwrap();
        let job = scheduler.create_barrier().unwrap();
        let other = scheduler.create_barrier().unwrap();
        scheduler.add_dependency(job, gate).unwrap();
        scheduler.enqueue(job).unwrap();

        let err = scheduler.add_dependency(job, other).unwrap_err();
        assert!(matches!(err, JobError::AlreadyEnqueued(_)));

        scheduler.enqueue(other).unwrap();
        scheduler.wait(job).unwrap();
        scheduler.wait(other).unwrap();
    }

    #[test]
    fn test_self_dependency_rejected() {
        let scheduler = JobScheduler::new(1).unwrap();
        let job = scheduler.create_barrier().unwrap();
        assert!(matches!(
            scheduler.add_dependency(job, job),
            Err(JobError::SelfDependency(_))
        ));
    }

    #[test]
    fn test_slot_reuse_marks_handle_stale() {
        let scheduler = JobScheduler::new(1).unwrap();
        let first = scheduler.create_barrier().unwrap();
        scheduler.enqueue(first).unwrap();
        scheduler.wait(first).unwrap();

        let second = scheduler.create_barrier().unwrap();
        assert_eq!(first.index(), second.index());
        assert_ne!(first.version(), second.version());
        assert!(!scheduler.is_valid(first));
        assert!(scheduler.is_valid(second));
        assert!(scheduler.is_complete(first));
        assert!(!scheduler.is_complete(second));
        assert!(matches!(
            scheduler.enqueue(first),
            Err(JobError::StaleHandle(_))
        ));
    }

    #[test]
    fn test_wait_without_enqueue_errors() {
        let scheduler = JobScheduler::new(1).unwrap();
        let job = scheduler.create_barrier().unwrap();
        assert!(matches!(
            scheduler.wait(job),
            Err(JobError::NotEnqueued(_))
        ));
    }

    #[test]
    fn test_wait_from_worker_does_not_deadlock() {
        // One worker: the outer job must run the inner job itself while waiting.
        let scheduler = Arc::new(JobScheduler::new(1).unwrap());
        let counter = Arc::new(AtomicUsize::new(0));

        let inner = counter_job(&scheduler, &counter);
        let pool = Arc::clone(&scheduler);
        let total = Arc::clone(&counter);
        let outer = scheduler
            .create(move || {
                pool.enqueue(inner).unwrap();
                pool.wait(inner).unwrap();
                total.fetch_add(10, Ordering::SeqCst);
            })
            .unwrap();

        scheduler.enqueue(outer).unwrap();
        scheduler.wait(outer).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_thread_id_only_on_pool() {
        let scheduler = Arc::new(JobScheduler::new(2).unwrap());
        assert_eq!(scheduler.thread_id(), None);

        let seen = Arc::new(PlMutex::new(None));
        let pool = Arc::clone(&scheduler);
        let slot = Arc::clone(&seen);
        let job = scheduler
            .create(move || *slot.lock() = pool.thread_id())
            .unwrap();
        scheduler.enqueue(job).unwrap();
        scheduler.wait(job).unwrap();

        let id = seen.lock().expect("job ran on a worker");
        assert!(id < scheduler.worker_count());
    }

    #[test]
    fn test_panicking_job_still_completes() {
        let scheduler = JobScheduler::new(2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let bad = scheduler.create(|| panic!("boom")).unwrap();
        let after = counter_job(&scheduler, &counter);
        scheduler.add_dependency(after, bad).unwrap();

        scheduler.enqueue(after).unwrap();
        scheduler.wait(after).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dependency_on_completed_job_is_satisfied() {
        let scheduler = JobScheduler::new(1).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let done = scheduler.create_barrier().unwrap();
        // Keep the graph alive so `done` is not recycled.
        let keep_alive = scheduler.create_barrier().unwrap();
        scheduler.enqueue(done).unwrap();
        scheduler.wait(done).unwrap();

        let job = counter_job(&scheduler, &counter);
        scheduler.add_dependency(job, done).unwrap();
        scheduler.enqueue(job).unwrap();
        scheduler.wait(job).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        scheduler.enqueue(keep_alive).unwrap();
        scheduler.wait(keep_alive).unwrap();
    }
}
