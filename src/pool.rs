//! A worker pool that executes a fixed list of jobs in repeating cycles.
//!
//! Each cycle schedules every currently-inactive job onto a fresh set of
//! worker threads. A cycle may end early: once the caller's overrun condition
//! holds and the number of still-active jobs is within the overrun budget,
//! [`CyclingPool::cycle_results`] stops yielding and the stragglers carry over
//! ("overrun") into later cycles. This is what lets the engine begin its next
//! full sweep without waiting for one slow repository to finish fetching.
//!
//! Jobs travel to workers over a job channel and come back over a result
//! channel; a job is owned by exactly one side at a time, so no job can run
//! twice concurrently.

use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::warn;

/// A job owned by the pool. Jobs are re-run every cycle, so they are `FnMut`.
pub type BoxJob<T> = Box<dyn FnMut() -> T + Send + 'static>;

/// How often the result loop wakes up to re-check the overrun condition.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

struct Dispatch<T> {
    index: usize,
    job: BoxJob<T>,
}

struct Completion<T> {
    index: usize,
    job: BoxJob<T>,
    /// `None` when the job panicked; the job slot is still recovered.
    result: Option<T>,
}

/// See the module docs.
pub struct CyclingPool<T> {
    /// `None` marks a job that is currently active on a worker.
    jobs: Vec<Option<BoxJob<T>>>,
    max_workers: usize,
    max_overrunnable: usize,
    active: BTreeSet<usize>,
    results_tx: Sender<Completion<T>>,
    results_rx: Receiver<Completion<T>>,
    workers: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> CyclingPool<T> {
    /// Create a pool with the default overrun budget of `max_workers / 2`.
    pub fn new(jobs: Vec<BoxJob<T>>, max_workers: usize) -> Self {
        Self::with_max_overrunnable(jobs, max_workers, max_workers / 2)
    }

    /// Create a pool with an explicit overrun budget.
    ///
    /// The budget must be strictly below `max_workers`: a cycle only ends
    /// early when the active count is within the budget, which guarantees
    /// every new cycle has at least one worker slot free.
    pub fn with_max_overrunnable(
        jobs: Vec<BoxJob<T>>,
        max_workers: usize,
        max_overrunnable: usize,
    ) -> Self {
        assert!(max_workers > 0, "pool requires at least one worker");
        assert!(
            max_overrunnable < max_workers,
            "overrun budget must leave at least one worker free"
        );
        let (results_tx, results_rx) = unbounded();
        Self {
            jobs: jobs.into_iter().map(Some).collect(),
            max_workers,
            max_overrunnable,
            active: BTreeSet::new(),
            results_tx,
            results_rx,
            workers: Vec::new(),
        }
    }

    /// The number of jobs currently active on workers. Between cycles this is
    /// exactly the overrun count.
    pub fn num_active_jobs(&self) -> usize {
        self.active.len()
    }

    /// The indexes of currently-active jobs.
    pub fn active_job_indexes(&self) -> Vec<usize> {
        self.active.iter().copied().collect()
    }

    /// Schedule all inactive jobs and iterate `(job_index, result)` pairs as
    /// they complete, including completions of jobs overrun from earlier
    /// cycles. The iterator ends when every active job has completed, or as
    /// soon as `overrun_condition` holds and no more than the overrun budget
    /// of jobs is still running.
    pub fn cycle_results<F>(&mut self, overrun_condition: F) -> CycleResults<'_, T, F>
    where
        F: FnMut() -> bool,
    {
        self.start_cycle();
        CycleResults {
            pool: self,
            overrun_condition,
        }
    }

    /// Drain every active job to completion without scheduling new work.
    pub fn finish_results(&mut self) -> FinishResults<'_, T> {
        FinishResults { pool: self }
    }

    fn start_cycle(&mut self) {
        self.reap_workers();

        let overrun_workers = self.active.len();
        let (job_tx, job_rx) = unbounded::<Dispatch<T>>();

        let mut dispatched = 0;
        for index in 0..self.jobs.len() {
            if let Some(job) = self.jobs[index].take() {
                self.active.insert(index);
                // The receiver outlives every send below, so this cannot fail.
                if job_tx.send(Dispatch { index, job }).is_err() {
                    break;
                }
                dispatched += 1;
            }
        }
        // All dispatches for this cycle are enqueued; closing the channel is
        // what tells idle workers to exit once the queue drains.
        drop(job_tx);

        let worker_count = self
            .max_workers
            .saturating_sub(overrun_workers)
            .min(dispatched);
        for n in 0..worker_count {
            let rx = job_rx.clone();
            let tx = self.results_tx.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("arcyd-worker-{n}"))
                .spawn(move || worker_loop(rx, tx));
            match spawned {
                Ok(handle) => self.workers.push(handle),
                Err(err) => warn!("failed to spawn pool worker: {err}"),
            }
        }
    }

    /// Block until one active job completes, returning its index and result.
    /// `None` result means the job panicked.
    fn recv_completion(&mut self, timeout: Duration) -> Option<(usize, Option<T>)> {
        match self.results_rx.recv_timeout(timeout) {
            Ok(completion) => {
                self.jobs[completion.index] = Some(completion.job);
                self.active.remove(&completion.index);
                if completion.result.is_none() {
                    warn!(index = completion.index, "pool job panicked");
                }
                Some((completion.index, completion.result))
            }
            Err(RecvTimeoutError::Timeout) => None,
            // The pool holds its own sender clone, so disconnection is
            // unreachable; treat it as a timeout if it somehow occurs.
            Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    fn reap_workers(&mut self) {
        let (done, running): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.workers)
                .into_iter()
                .partition(|handle| handle.is_finished());
        for handle in done {
            let _ = handle.join();
        }
        self.workers = running;
    }
}

fn worker_loop<T: Send + 'static>(rx: Receiver<Dispatch<T>>, tx: Sender<Completion<T>>) {
    while let Ok(Dispatch { index, mut job }) = rx.recv() {
        let result = catch_unwind(AssertUnwindSafe(|| job())).ok();
        if tx.send(Completion { index, job, result }).is_err() {
            // The pool is gone; nothing left to report to.
            break;
        }
    }
}

/// Lazy sequence of `(job_index, result)` pairs for one cycle.
pub struct CycleResults<'a, T, F> {
    pool: &'a mut CyclingPool<T>,
    overrun_condition: F,
}

impl<T: Send + 'static, F: FnMut() -> bool> Iterator for CycleResults<'_, T, F> {
    type Item = (usize, T);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.pool.active.is_empty() {
                self.pool.reap_workers();
                return None;
            }
            if (self.overrun_condition)()
                && self.pool.active.len() <= self.pool.max_overrunnable
            {
                return None;
            }
            match self.pool.recv_completion(POLL_INTERVAL) {
                Some((index, Some(result))) => return Some((index, result)),
                // Panicked job: the slot is recovered, nothing to yield.
                Some((_, None)) => continue,
                None => continue,
            }
        }
    }
}

/// Lazy sequence draining every active job to completion.
pub struct FinishResults<'a, T> {
    pool: &'a mut CyclingPool<T>,
}

impl<T: Send + 'static> Iterator for FinishResults<'_, T> {
    type Item = (usize, T);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.pool.active.is_empty() {
                self.pool.reap_workers();
                return None;
            }
            match self.pool.recv_completion(POLL_INTERVAL) {
                Some((index, Some(result))) => return Some((index, result)),
                Some((_, None)) => continue,
                None => continue,
            }
        }
    }
}
