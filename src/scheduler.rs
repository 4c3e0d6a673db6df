//! The engine: composes per-repository operations with signal, sleep and
//! cache-refresh operations and drives them through the cycling pool.
//!
//! Control conditions (kill file, reset file) are plain values returned by
//! the signals operation and inspected here each cycle; nothing unwinds
//! through the stack to deliver them.

use std::cell::Cell;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tap::TapFallible;
use tracing::{info, warn};

use crate::config::{Config, DataRoot, RepoDescriptor};
use crate::mailer::Mailer;
use crate::pool::{BoxJob, CyclingPool};
use crate::processor::RepoProcessor;
use crate::reporter::{RepoStatus, Status};
use crate::retry;
use crate::services::Services;

/// How often the pause loop re-notifies the administrators.
const PAUSE_NOTIFY_INTERVAL: Duration = Duration::from_secs(300);

/// Granularity of interruptible sleeps.
const SLEEP_SLICE: Duration = Duration::from_millis(500);

/// What the signals operation observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    /// Nothing to do.
    Continue,

    /// The kill file appeared: shut down gracefully.
    Shutdown,

    /// The reset file appeared: tear down this iteration and rebuild.
    Reset,
}

/// The result of one operation in the cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpResult {
    /// A repository pass finished.
    Repo {
        /// The repository's machine name.
        name: String,

        /// Whether the pass (including its retries) succeeded.
        ok: bool,
    },

    /// The signals operation ran.
    Signal(SignalOutcome),

    /// The inter-cycle sleep finished.
    Slept,

    /// The cache-refresh operation ran.
    Refreshed {
        /// Whether the refresh succeeded.
        ok: bool,
    },
}

/// How the engine run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineExit {
    /// Every operation in every cycle succeeded.
    Clean,

    /// At least one operation failed at some point.
    HadFailures,
}

/// See the module docs.
pub struct Scheduler {
    root: DataRoot,
    repos: Vec<RepoDescriptor>,
    services: Services,
    mailer: Arc<dyn Mailer>,
    sleep_interval: Duration,
    max_workers: usize,
    max_overrunnable: usize,
    max_diff_bytes: u64,
}

impl Scheduler {
    /// Build a scheduler from validated configuration.
    pub fn new(
        root: DataRoot,
        config: &Config,
        services: Services,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        Self {
            repos: config.repositories().iter().cloned().collect(),
            sleep_interval: config.engine().sleep_interval(),
            max_workers: config.engine().max_workers(),
            max_overrunnable: config.engine().max_overrunnable(),
            max_diff_bytes: config.engine().max_diff_size().as_u64(),
            root,
            services,
            mailer,
        }
    }

    /// Run the engine until shut down. With `no_loop`, run exactly one full
    /// cycle with no overrun and return.
    pub fn run(&mut self, no_loop: bool) -> EngineExit {
        let reporter = self.services.reporter.clone();
        let mut pool = self.build_pool();
        let mut had_failures = false;

        loop {
            reporter.start_cycle();
            reporter.set_status(Status::Updating);

            let slept = Cell::new(false);
            let mut control = SignalOutcome::Continue;
            for (_, result) in pool.cycle_results(|| !no_loop && slept.get()) {
                match result {
                    OpResult::Slept => slept.set(true),
                    OpResult::Signal(SignalOutcome::Continue) => {}
                    OpResult::Signal(signal) => {
                        control = signal;
                        break;
                    }
                    OpResult::Repo { name, ok } => {
                        if !ok {
                            warn!("repository '{name}' failed this cycle");
                            had_failures = true;
                        }
                    }
                    OpResult::Refreshed { ok } => {
                        if !ok {
                            had_failures = true;
                        }
                    }
                }
            }
            reporter.finish_cycle();

            match control {
                SignalOutcome::Continue => {}
                SignalOutcome::Shutdown => {
                    info!("kill file seen; shutting down after in-flight work");
                    had_failures |= Self::drain(&mut pool);
                    break;
                }
                SignalOutcome::Reset => {
                    info!("reset file seen; rebuilding the operation list");
                    had_failures |= Self::drain(&mut pool);
                    pool = self.build_pool();
                    continue;
                }
            }

            if no_loop {
                had_failures |= Self::drain(&mut pool);
                break;
            }
        }

        reporter.set_status(Status::Stopped);
        self.flush_watcher();
        if had_failures {
            EngineExit::HadFailures
        } else {
            EngineExit::Clean
        }
    }

    /// Drain all in-flight work, reporting whether anything failed.
    fn drain(pool: &mut CyclingPool<OpResult>) -> bool {
        let mut had_failures = false;
        for (_, result) in pool.finish_results() {
            match result {
                OpResult::Repo { ok: false, .. } | OpResult::Refreshed { ok: false } => {
                    had_failures = true;
                }
                _ => {}
            }
        }
        had_failures
    }

    /// The ordered operation list: signals first, one op per repository,
    /// then cache refresh and the inter-cycle sleep.
    fn build_pool(&self) -> CyclingPool<OpResult> {
        let mut jobs: Vec<BoxJob<OpResult>> = Vec::new();
        jobs.push(self.signals_job());
        for repo in &self.repos {
            jobs.push(self.repo_job(repo));
        }
        jobs.push(self.refresh_job());
        jobs.push(self.sleep_job());
        CyclingPool::with_max_overrunnable(jobs, self.max_workers, self.max_overrunnable)
    }

    fn signals_job(&self) -> BoxJob<OpResult> {
        let kill = self.root.kill_file();
        let reset = self.root.reset_file();
        let pause = self.root.pause_file();
        let reporter = self.services.reporter.clone();
        let mailer = Arc::clone(&self.mailer);
        let admins = self.all_admins();
        let mut last_pause_notice: Option<Instant> = None;

        Box::new(move || {
            while pause.exists() {
                let due = last_pause_notice
                    .map(|at| at.elapsed() >= PAUSE_NOTIFY_INTERVAL)
                    .unwrap_or(true);
                if due {
                    reporter.set_status_described(
                        Status::Idle,
                        Some("paused by pause file".to_owned()),
                    );
                    mailer.send(
                        &admins,
                        "arcyd is paused",
                        "the pause file exists; remove it to resume processing",
                    );
                    last_pause_notice = Some(Instant::now());
                }
                std::thread::sleep(SLEEP_SLICE);
            }
            last_pause_notice = None;

            if kill.exists() {
                let _ = std::fs::remove_file(&kill)
                    .tap_err(|err| warn!("failed to remove kill file: {err}"));
                return OpResult::Signal(SignalOutcome::Shutdown);
            }
            if reset.exists() {
                let _ = std::fs::remove_file(&reset)
                    .tap_err(|err| warn!("failed to remove reset file: {err}"));
                return OpResult::Signal(SignalOutcome::Reset);
            }
            OpResult::Signal(SignalOutcome::Continue)
        })
    }

    fn repo_job(&self, repo: &RepoDescriptor) -> BoxJob<OpResult> {
        let mut processor = RepoProcessor::new(
            repo.clone(),
            self.services.clone(),
            self.max_diff_bytes,
            self.root.url_watcher_file(),
        );
        let reporter = self.services.reporter.clone();
        let mailer = Arc::clone(&self.mailer);
        let admins = repo.admin_emails().clone();
        let name = repo.name().clone();
        let human_name = repo.human_name().clone();

        Box::new(move || {
            reporter.start_repo(&name, &human_name);
            let result = retry::retry(
                repo_retry_schedule(),
                |err, next_delay| {
                    reporter.set_status_described(
                        Status::TryloopException,
                        Some(format!("repository '{name}': {err}")),
                    );
                    let next = match next_delay {
                        Some(delay) => format!("next attempt in {}", humantime::format_duration(delay)),
                        None => "giving up until the next cycle".to_owned(),
                    };
                    mailer.send(
                        &admins,
                        &format!("arcyd: processing '{name}' failed"),
                        &format!("{err:?}\n{next}"),
                    );
                },
                || processor.process(false),
            );
            match result {
                Ok(_) => {
                    reporter.finish_repo(&name, RepoStatus::Ok);
                    OpResult::Repo {
                        name: name.clone(),
                        ok: true,
                    }
                }
                Err(err) => {
                    warn!("repository '{name}' failed after retries: {err:?}");
                    reporter.finish_repo(&name, RepoStatus::Failed);
                    OpResult::Repo {
                        name: name.clone(),
                        ok: false,
                    }
                }
            }
        })
    }

    fn refresh_job(&self) -> BoxJob<OpResult> {
        let services = self.services.clone();
        Box::new(move || {
            services.reporter.set_status(Status::RefreshingCache);
            let refreshed = services
                .review_states()
                .refresh_active()
                .tap_err(|err| warn!("failed to refresh review-state cache: {err:?}"));
            services.watcher().prune_unvisited();
            OpResult::Refreshed {
                ok: refreshed.is_ok(),
            }
        })
    }

    fn sleep_job(&self) -> BoxJob<OpResult> {
        let interval = self.sleep_interval;
        let kill = self.root.kill_file();
        let reset = self.root.reset_file();
        let reporter = self.services.reporter.clone();

        Box::new(move || {
            reporter.set_status(Status::Sleeping);
            let started = Instant::now();
            while started.elapsed() < interval {
                // Wake early for control files so shutdown is snappy.
                if kill.exists() || reset.exists() {
                    break;
                }
                let remaining = interval.saturating_sub(started.elapsed());
                std::thread::sleep(remaining.min(SLEEP_SLICE));
            }
            OpResult::Slept
        })
    }

    fn all_admins(&self) -> Vec<String> {
        let mut admins: Vec<String> = self
            .repos
            .iter()
            .flat_map(|repo| repo.admin_emails().iter().cloned())
            .collect();
        admins.sort();
        admins.dedup();
        admins
    }

    /// Flush the url watcher on clean shutdown.
    fn flush_watcher(&self) {
        let mut buffer = Vec::new();
        if self.services.watcher().dump(&mut buffer).is_ok() {
            if let Err(err) = crate::fsutil::atomic_write(&self.root.url_watcher_file(), &buffer) {
                warn!("failed to flush url-watcher state: {err:?}");
            }
        }
    }
}

/// The per-repository retry schedule: patient, because a failing repository
/// usually means a degraded remote.
fn repo_retry_schedule() -> impl Iterator<Item = Duration> {
    [Duration::from_secs(600), Duration::from_secs(3600)].into_iter()
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("repos", &self.repos.len())
            .field("sleep_interval", &self.sleep_interval)
            .finish_non_exhaustive()
    }
}
