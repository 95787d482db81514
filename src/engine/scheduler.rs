// Bounded worker pool — runs task units with at most K in flight and a per-batch completion barrier.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::task::{Completion, TaskHandle, TaskState, TaskUnit};
use crate::config::DEFAULT_BATCH_CONCURRENCY;

type BatchCallback = Box<dyn FnOnce() + Send + 'static>;

struct Job {
    unit: TaskUnit,
    batch: Option<Arc<JobBatch>>,
}

/// A job waiting for a worker slot.
struct Queued {
    job: Job,
    watcher: JoinHandle<()>,
}

impl Queued {
    fn new(job: Job, wake: Arc<Notify>) -> Self {
        let token = job.unit.status.token.clone();
        let watcher = tokio::spawn(async move {
            token.cancelled().await;
            wake.notify_one();
        });
        Self { job, watcher }
    }

    fn cancel(self) {
        self.watcher.abort();
        Scheduler::finish_cancelled(self.job);
    }
}

/// Pending-count barrier shared by the units of one batch.
struct JobBatch {
    remaining: AtomicUsize,
    on_complete: Mutex<Option<BatchCallback>>,
    done: watch::Sender<bool>,
}

impl JobBatch {
    fn new(size: usize, on_complete: BatchCallback) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            remaining: AtomicUsize::new(size),
            on_complete: Mutex::new(Some(on_complete)),
            done,
        }
    }

    fn unit_finished(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.fire();
        }
    }

    fn fire(&self) {
        let callback = self.on_complete.lock().take();
        if let Some(callback) = callback {
            callback();
        }
        self.done.send_replace(true);
    }
}

/// Handle to a submitted batch.
pub struct BatchHandle {
    units: Vec<TaskHandle>,
    done: watch::Receiver<bool>,
}

impl BatchHandle {
    /// Cancel every unit that has not started yet. Running units see the
    /// token at their next poll point.
    pub fn cancel(&self) {
        for unit in &self.units {
            unit.cancel();
        }
    }

    pub fn units(&self) -> &[TaskHandle] {
        &self.units
    }

    pub fn is_finished(&self) -> bool {
        *self.done.borrow()
    }

    /// Resolve once the batch's completion callback has fired.
    pub async fn finished(&self) {
        let mut rx = self.done.clone();
        let _ = rx.wait_for(|done| *done).await;
    }
}

pub struct Scheduler {
    queue: mpsc::UnboundedSender<Job>,
    shutdown: CancellationToken,
    concurrency: usize,
    running: Arc<AtomicUsize>,
}

impl Scheduler {
    /// Start a pool with `concurrency` worker slots. Must be called from
    /// within a tokio runtime.
    pub fn new(concurrency: usize) -> Result<Self> {
        if concurrency == 0 {
            return Err(anyhow!("concurrency must be >= 1"));
        }
        let runtime = Handle::try_current()
            .map_err(|e| anyhow!("scheduler requires a tokio runtime: {}", e))?;

        let (queue, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let running = Arc::new(AtomicUsize::new(0));

        runtime.spawn(Self::drive(
            rx,
            Arc::new(Semaphore::new(concurrency)),
            shutdown.clone(),
            running.clone(),
        ));

        Ok(Self {
            queue,
            shutdown,
            concurrency,
            running,
        })
    }

    /// Run `units` with at most `concurrency` in flight and call
    /// `on_complete` once after every unit has signaled.
    pub fn run<F>(units: Vec<TaskUnit>, concurrency: usize, on_complete: F) -> Result<BatchHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        let pool = Self::new(concurrency)?;
        // The pool's driver drains the queue after the handle is dropped.
        Ok(pool.submit_batch(units, on_complete))
    }

    /// `run` with one slot: strictly sequential, in submission order.
    pub fn run_serial<F>(units: Vec<TaskUnit>, on_complete: F) -> Result<BatchHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::run(units, 1, on_complete)
    }

    /// `run` with the default batch parallelism.
    pub fn run_default<F>(units: Vec<TaskUnit>, on_complete: F) -> Result<BatchHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::run(units, DEFAULT_BATCH_CONCURRENCY, on_complete)
    }

    pub fn submit(&self, unit: TaskUnit) -> TaskHandle {
        let handle = unit.handle();
        self.enqueue(Job { unit, batch: None });
        handle
    }

    pub fn submit_batch<F>(&self, units: Vec<TaskUnit>, on_complete: F) -> BatchHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let batch = Arc::new(JobBatch::new(units.len(), Box::new(on_complete)));
        let handles: Vec<TaskHandle> = units.iter().map(TaskUnit::handle).collect();
        let done = batch.done.subscribe();

        if units.is_empty() {
            batch.fire();
        }
        for unit in units {
            self.enqueue(Job {
                unit,
                batch: Some(batch.clone()),
            });
        }

        BatchHandle {
            units: handles,
            done,
        }
    }

    /// Stop admitting work. Queued and later-submitted units are cancelled
    /// and still signal; running units see their token cancelled.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Units started but not yet signaled.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    fn enqueue(&self, job: Job) {
        if let Err(mpsc::error::SendError(job)) = self.queue.send(job) {
            warn!("scheduler queue closed, cancelling task {}", job.unit.id());
            Self::finish_cancelled(job);
        }
    }

    async fn drive(
        mut rx: mpsc::UnboundedReceiver<Job>,
        semaphore: Arc<Semaphore>,
        shutdown: CancellationToken,
        running: Arc<AtomicUsize>,
    ) {
        // Jobs received but not yet admitted, in submission order. Each one
        // carries a watcher that wakes the driver when its token is cancelled,
        // so a unit cancelled behind the head signals without waiting for a slot.
        let mut pending: VecDeque<Queued> = VecDeque::new();
        let wake = Arc::new(Notify::new());
        let mut open = true;

        while open || !pending.is_empty() {
            if shutdown.is_cancelled() {
                for queued in pending.drain(..) {
                    queued.cancel();
                }
            } else {
                Self::reap_cancelled(&mut pending);
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled(), if !pending.is_empty() => continue,
                _ = wake.notified() => continue,
                permit = semaphore.clone().acquire_owned(), if !pending.is_empty() => {
                    let Ok(permit) = permit else {
                        break;
                    };
                    if let Some(queued) = pending.pop_front() {
                        queued.watcher.abort();
                        tokio::spawn(Self::execute(
                            queued.job,
                            permit,
                            shutdown.clone(),
                            running.clone(),
                        ));
                    }
                }
                job = rx.recv(), if open => match job {
                    Some(job) if shutdown.is_cancelled() || job.unit.status.token.is_cancelled() => {
                        Self::finish_cancelled(job);
                    }
                    Some(job) => pending.push_back(Queued::new(job, wake.clone())),
                    None => open = false,
                },
            }
        }

        for queued in pending.drain(..) {
            queued.cancel();
        }
        debug!("scheduler queue drained");
    }

    fn reap_cancelled(pending: &mut VecDeque<Queued>) {
        if pending.iter().all(|q| !q.job.unit.status.token.is_cancelled()) {
            return;
        }
        let (cancelled, live): (Vec<Queued>, Vec<Queued>) = pending
            .drain(..)
            .partition(|q| q.job.unit.status.token.is_cancelled());
        pending.extend(live);
        for queued in cancelled {
            queued.cancel();
        }
    }

    async fn execute(
        job: Job,
        permit: OwnedSemaphorePermit,
        shutdown: CancellationToken,
        running: Arc<AtomicUsize>,
    ) {
        let Job { unit, batch } = job;
        let TaskUnit { action, status } = unit;

        if status.token.is_cancelled() {
            drop(permit);
            debug!("task {} cancelled before start", status.id);
            status.finish_cancelled();
            if let Some(batch) = batch {
                batch.unit_finished();
            }
            return;
        }

        status.transition(TaskState::Running);
        running.fetch_add(1, Ordering::AcqRel);

        let (completion, signaled) = Completion::new(status.id);
        let token = status.token.clone();
        // Cascade pool shutdown into the running unit.
        let unit_token = token.clone();
        let watcher = tokio::spawn(async move {
            shutdown.cancelled().await;
            unit_token.cancel();
        });
        tokio::spawn(async move { action(token, completion).await });

        // The slot is held until the unit signals, not until its body returns.
        let _ = signaled.await;

        watcher.abort();
        running.fetch_sub(1, Ordering::AcqRel);
        drop(permit);

        status.transition(TaskState::Finished);
        debug!("task {} finished", status.id);
        if let Some(batch) = batch {
            batch.unit_finished();
        }
    }

    fn finish_cancelled(job: Job) {
        let Job { unit, batch } = job;
        if unit.status.state() == TaskState::Pending {
            debug!("task {} skipped: cancelled", unit.status.id);
        }
        unit.status.finish_cancelled();
        if let Some(batch) = batch {
            batch.unit_finished();
        }
    }
}
