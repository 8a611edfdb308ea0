//! Shared worker pool for deferred and periodic jobs.
//!
//! ```text
//!  schedule(kind, f) ──▶ job table (≤ 32)
//!                           │
//!              scheduler thread, every 10 ms:
//!              due jobs ──try_send──▶ ┌──────────────────────────┐
//!                                     │ Channel<PoolMessage, 16> │
//!                                     └────────────┬─────────────┘
//!                                                  ▼
//!                                    worker 0 .. worker N-1 (block on receive)
//! ```
//!
//! A periodic job is first due one interval after it is scheduled and is
//! re-armed every time it comes due, even when the queue was full and the
//! run had to be skipped.  A one-shot job is due immediately and leaves
//! the table once it has run or been skipped.
//!
//! Cancelling waits for a run of that job already in progress on another
//! worker.  Once `cancel` returns the job body never runs again.

use std::cell::Cell;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel, TrySendError};
use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::module::{ModuleName, module_name};

/// Jobs that may be scheduled at once.
pub const MAX_JOBS: usize = 32;

/// Depth of the run queue between the scheduler and the workers.
pub const TASK_QUEUE_DEPTH: usize = 16;

/// How often the scheduler looks for due jobs.
pub const SCHEDULER_TICK: Duration = Duration::from_millis(10);

/// Handle returned by [`TaskPool::schedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(u32);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Run once, as soon as a worker is free.
    Once,
    /// Run every interval until cancelled.
    Every(Duration),
}

type JobFn = Box<dyn FnMut() + Send>;

struct JobBody {
    live: AtomicBool,
    run: Mutex<JobFn>,
}

struct Job {
    id: JobId,
    owner: ModuleName,
    kind: JobKind,
    /// `None` once a one-shot job has been handed to a worker.
    next_due: Option<Instant>,
    body: Arc<JobBody>,
}

enum PoolMessage {
    Run(JobId, Arc<JobBody>),
    Stop,
}

thread_local! {
    static CURRENT_JOB: Cell<Option<JobId>> = const { Cell::new(None) };
}

struct PoolInner {
    queue: Channel<CriticalSectionRawMutex, PoolMessage, TASK_QUEUE_DEPTH>,
    jobs: Mutex<Vec<Job>>,
    next_id: AtomicU32,
    running: AtomicBool,
    stopped: AtomicBool,
    skipped: AtomicU32,
}

struct Threads {
    scheduler: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

/// Worker threads plus a scheduler, started on the first `schedule`.
pub struct TaskPool {
    inner: Arc<PoolInner>,
    threads: Mutex<Threads>,
    workers: usize,
    stack_size: usize,
}

impl TaskPool {
    pub fn new(workers: usize, stack_size: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                queue: Channel::new(),
                jobs: Mutex::new(Vec::new()),
                next_id: AtomicU32::new(1),
                running: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                skipped: AtomicU32::new(0),
            }),
            threads: Mutex::new(Threads {
                scheduler: None,
                workers: Vec::new(),
            }),
            workers: workers.max(1),
            stack_size,
        }
    }

    /// Add a job owned by `owner`.
    pub fn schedule<F>(&self, owner: &str, kind: JobKind, f: F) -> Result<JobId>
    where
        F: FnMut() + Send + 'static,
    {
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(Error::Allocation("task pool stopped"));
        }
        if matches!(kind, JobKind::Every(period) if period.is_zero()) {
            return Err(Error::InvalidArgument("job interval must be non-zero"));
        }
        let owner = module_name(owner)?;
        self.ensure_started()?;

        let id = JobId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let now = Instant::now();
        let next_due = match kind {
            JobKind::Once => now,
            JobKind::Every(period) => now + period,
        };
        let mut jobs = self.inner.jobs.lock();
        if jobs.len() >= MAX_JOBS {
            warn!("TaskPool: job table full, '{}' refused", owner);
            return Err(Error::Allocation("task pool jobs"));
        }
        debug!("TaskPool: {} scheduled for '{}' ({:?})", id, owner, kind);
        jobs.push(Job {
            id,
            owner,
            kind,
            next_due: Some(next_due),
            body: Arc::new(JobBody {
                live: AtomicBool::new(true),
                run: Mutex::new(Box::new(f)),
            }),
        });
        Ok(id)
    }

    /// Remove a job.  Waits for a run in progress on another thread.
    pub fn cancel(&self, id: JobId) -> Result<()> {
        let removed = {
            let mut jobs = self.inner.jobs.lock();
            let pos = jobs
                .iter()
                .position(|j| j.id == id)
                .ok_or_else(|| Error::NotFound(id.to_string()))?;
            let job = jobs.remove(pos);
            job.body.live.store(false, Ordering::Release);
            job
        };
        quiesce(&removed);
        debug!("TaskPool: {} cancelled", id);
        Ok(())
    }

    /// Cancel every job `owner` scheduled.  Returns how many.
    pub fn cancel_owned_by(&self, owner: &str) -> usize {
        let removed: Vec<Job> = {
            let mut jobs = self.inner.jobs.lock();
            let (theirs, rest): (Vec<Job>, Vec<Job>) =
                jobs.drain(..).partition(|j| j.owner.as_str() == owner);
            *jobs = rest;
            for job in &theirs {
                job.body.live.store(false, Ordering::Release);
            }
            theirs
        };
        for job in &removed {
            quiesce(job);
        }
        if !removed.is_empty() {
            info!("TaskPool: cancelled {} job(s) of '{}'", removed.len(), owner);
        }
        removed.len()
    }

    pub fn is_scheduled(&self, id: JobId) -> bool {
        self.inner.jobs.lock().iter().any(|j| j.id == id)
    }

    pub fn job_count(&self) -> usize {
        self.inner.jobs.lock().len()
    }

    /// Runs skipped because the queue was full.
    pub fn skipped(&self) -> u32 {
        self.inner.skipped.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Cancel everything and stop the threads.  Later `schedule` calls fail.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        let removed: Vec<Job> = self.inner.jobs.lock().drain(..).collect();
        for job in &removed {
            job.body.live.store(false, Ordering::Release);
        }
        for job in &removed {
            quiesce(job);
        }

        let mut threads = self.threads.lock();
        let Some(scheduler) = threads.scheduler.take() else {
            return;
        };
        self.inner.running.store(false, Ordering::Release);
        join(scheduler, "scheduler");
        for _ in 0..threads.workers.len() {
            futures_lite::future::block_on(self.inner.queue.send(PoolMessage::Stop));
        }
        for worker in threads.workers.drain(..) {
            join(worker, "worker");
        }
        while self.inner.queue.try_receive().is_ok() {}
        info!("TaskPool: stopped");
    }

    fn ensure_started(&self) -> Result<()> {
        let mut threads = self.threads.lock();
        if threads.scheduler.is_some() {
            return Ok(());
        }
        self.inner.running.store(true, Ordering::Release);
        let started = self.spawn_threads(&mut threads);
        if started.is_err() {
            self.inner.running.store(false, Ordering::Release);
            for _ in 0..threads.workers.len() {
                futures_lite::future::block_on(self.inner.queue.send(PoolMessage::Stop));
            }
            threads.workers.clear();
        }
        started
    }

    fn spawn_threads(&self, threads: &mut Threads) -> Result<()> {
        for i in 0..self.workers {
            let inner = self.inner.clone();
            let handle = spawn(format!("task-pool-{i}"), self.stack_size, move || inner.work())?;
            threads.workers.push(handle);
        }
        let inner = self.inner.clone();
        let handle = spawn("task-sched".into(), self.stack_size, move || inner.schedule_loop())?;
        threads.scheduler = Some(handle);
        info!("TaskPool: started {} worker(s)", self.workers);
        Ok(())
    }
}

impl Default for TaskPool {
    fn default() -> Self {
        Self::new(2, 4 * 1024)
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.stop();
    }
}

impl PoolInner {
    fn schedule_loop(&self) {
        while self.running.load(Ordering::Acquire) {
            self.tick(Instant::now());
            std::thread::sleep(SCHEDULER_TICK);
        }
    }

    /// Queue every job due at `now`.
    fn tick(&self, now: Instant) {
        let mut jobs = self.jobs.lock();
        jobs.retain_mut(|job| {
            let Some(due) = job.next_due else {
                return true;
            };
            if due > now {
                return true;
            }
            let queued = match self.queue.try_send(PoolMessage::Run(job.id, job.body.clone())) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    self.skipped.fetch_add(1, Ordering::Relaxed);
                    warn!("TaskPool: run queue full, {} of '{}' skipped", job.id, job.owner);
                    false
                }
            };
            match job.kind {
                JobKind::Every(period) => {
                    job.next_due = Some(now + period);
                    true
                }
                JobKind::Once => {
                    job.next_due = None;
                    queued
                }
            }
        });
    }

    fn work(&self) {
        loop {
            match futures_lite::future::block_on(self.queue.receive()) {
                PoolMessage::Run(id, body) => self.execute(id, &body),
                PoolMessage::Stop => break,
            }
        }
    }

    fn execute(&self, id: JobId, body: &JobBody) {
        if body.live.load(Ordering::Acquire) {
            let mut run = body.run.lock();
            // Re-check under the lock: cancel may have won the race.
            if body.live.load(Ordering::Acquire) {
                CURRENT_JOB.with(|c| c.set(Some(id)));
                run();
                CURRENT_JOB.with(|c| c.set(None));
            }
        }
        let mut jobs = self.jobs.lock();
        if let Some(pos) = jobs
            .iter()
            .position(|j| j.id == id && j.kind == JobKind::Once)
        {
            jobs.remove(pos);
        }
    }
}

/// Wait out an in-flight run of `job`, unless we are that run.
fn quiesce(job: &Job) {
    if CURRENT_JOB.with(Cell::get) == Some(job.id) {
        return;
    }
    drop(job.body.run.lock());
}

fn spawn<F>(name: String, stack_size: usize, f: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(name)
        .stack_size(stack_size)
        .spawn(f)
        .map_err(|e| {
            error!("TaskPool: thread spawn failed: {}", e);
            Error::Allocation("task pool thread")
        })
}

fn join(handle: JoinHandle<()>, what: &str) {
    if handle.thread().id() == std::thread::current().id() {
        return;
    }
    if handle.join().is_err() {
        error!("TaskPool: {} thread panicked", what);
    }
}
