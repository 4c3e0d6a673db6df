//! Engine status collection and the external JSON snapshot.
//!
//! The reporter owns all status state; everything else pushes immutable
//! records into it. After every transition it rewrites a self-consistent JSON
//! snapshot so external observers (dashboards, the test harness) can watch the
//! engine without attaching to it.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use strum::Display;
use tracing::warn;

use crate::fsutil;

/// What the engine is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    /// The engine is initializing.
    Starting,

    /// A repository pass is in progress.
    Updating,

    /// Between cycles.
    Sleeping,

    /// Refreshing the shared caches.
    RefreshingCache,

    /// The engine has shut down.
    Stopped,

    /// Nothing to do.
    Idle,

    /// An operation is inside its retry schedule after a failure.
    TryloopException,
}

/// The last known state of one repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RepoStatus {
    /// A pass is running now.
    Updating,

    /// The last pass failed.
    Failed,

    /// The last pass completed.
    Ok,
}

/// Immutable per-repo record as it appears in the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepoRecord {
    /// Machine name of the repository.
    pub name: String,

    /// Human-facing name of the repository.
    #[serde(rename = "human-name")]
    pub human_name: String,

    /// Last known state.
    #[serde(rename = "repo-status")]
    pub status: RepoStatus,
}

/// Kind of I/O a timed event performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    /// The event only observed state.
    Read,

    /// The event mutated state somewhere.
    Write,
}

/// Receives timed spans from instrumented collaborators (the git driver).
pub trait IoEventSink: Send + Sync {
    /// Record that a named operation of the given kind took `elapsed`.
    fn io_event(&self, kind: IoKind, label: &str, elapsed: Duration);
}

#[derive(Debug, Serialize)]
struct Snapshot {
    status: Status,
    #[serde(rename = "status-description")]
    status_description: Option<String>,
    #[serde(rename = "current-repo")]
    current_repo: Option<RepoRecord>,
    repos: Vec<RepoRecord>,
    statistics: Statistics,
}

#[derive(Debug, Serialize)]
struct Statistics {
    #[serde(rename = "current-cycle-time")]
    current_cycle_time: Option<f64>,
    #[serde(rename = "last-cycle-time")]
    last_cycle_time: Option<f64>,
    #[serde(rename = "tag-times")]
    tag_times: BTreeMap<String, f64>,
}

#[derive(Debug)]
struct Inner {
    output: Option<PathBuf>,
    status: Status,
    status_description: Option<String>,
    current_repo: Option<RepoRecord>,
    repos: BTreeMap<String, RepoRecord>,
    tag_times: BTreeMap<String, f64>,
    cycle_started: Option<Instant>,
    last_cycle: Option<Duration>,
}

/// See the module docs. Cheap to clone; all clones share state.
#[derive(Debug, Clone)]
pub struct Reporter {
    inner: Arc<Mutex<Inner>>,
}

impl Reporter {
    /// Create a reporter writing snapshots to `output`, or nowhere if `None`.
    pub fn new(output: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                output,
                status: Status::Starting,
                status_description: None,
                current_repo: None,
                repos: BTreeMap::new(),
                tag_times: BTreeMap::new(),
                cycle_started: None,
                last_cycle: None,
            })),
        }
    }

    /// Transition the engine-wide status.
    pub fn set_status(&self, status: Status) {
        self.set_status_described(status, None);
    }

    /// Transition the engine-wide status with a human-readable description.
    pub fn set_status_described(&self, status: Status, description: Option<String>) {
        self.with_inner(|inner| {
            inner.status = status;
            inner.status_description = description;
        });
    }

    /// Record that a repository pass is starting.
    pub fn start_repo(&self, name: &str, human_name: &str) {
        let record = RepoRecord {
            name: name.to_owned(),
            human_name: human_name.to_owned(),
            status: RepoStatus::Updating,
        };
        self.with_inner(|inner| {
            inner.repos.insert(name.to_owned(), record.clone());
            inner.current_repo = Some(record);
        });
    }

    /// Record the result of a repository pass.
    pub fn finish_repo(&self, name: &str, status: RepoStatus) {
        self.with_inner(|inner| {
            if let Some(record) = inner.repos.get_mut(name) {
                record.status = status;
            }
            if inner
                .current_repo
                .as_ref()
                .map(|record| record.name == name)
                .unwrap_or(false)
            {
                inner.current_repo = None;
            }
        });
    }

    /// Mark the beginning of an engine cycle.
    pub fn start_cycle(&self) {
        self.with_inner(|inner| inner.cycle_started = Some(Instant::now()));
    }

    /// Mark the end of an engine cycle.
    pub fn finish_cycle(&self) {
        self.with_inner(|inner| {
            inner.last_cycle = inner.cycle_started.take().map(|started| started.elapsed());
        });
    }

    /// Run `f`, attributing its wall-clock duration to `tag`.
    pub fn time_tag<T>(&self, tag: &str, f: impl FnOnce() -> T) -> T {
        let started = Instant::now();
        let value = f();
        let elapsed = started.elapsed();
        self.with_inner(|inner| {
            *inner.tag_times.entry(tag.to_owned()).or_insert(0.0) += elapsed.as_secs_f64();
        });
        value
    }

    /// Cumulative seconds attributed to `tag` so far.
    pub fn tag_seconds(&self, tag: &str) -> f64 {
        let inner = self.lock();
        inner.tag_times.get(tag).copied().unwrap_or(0.0)
    }

    /// Render the snapshot JSON without writing it anywhere.
    pub fn snapshot_json(&self) -> String {
        let inner = self.lock();
        let snapshot = Self::snapshot_of(&inner);
        serde_json::to_string_pretty(&snapshot).unwrap_or_else(|err| {
            warn!("failed to serialize status snapshot: {err}");
            String::from("{}")
        })
    }

    fn snapshot_of(inner: &Inner) -> Snapshot {
        Snapshot {
            status: inner.status,
            status_description: inner.status_description.clone(),
            current_repo: inner.current_repo.clone(),
            repos: inner.repos.values().cloned().collect(),
            statistics: Statistics {
                current_cycle_time: inner
                    .cycle_started
                    .map(|started| started.elapsed().as_secs_f64()),
                last_cycle_time: inner.last_cycle.map(|d| d.as_secs_f64()),
                tag_times: inner.tag_times.clone(),
            },
        }
    }

    fn with_inner(&self, f: impl FnOnce(&mut Inner)) {
        let output;
        let rendered;
        {
            let mut inner = self.lock();
            f(&mut inner);
            output = inner.output.clone();
            rendered = serde_json::to_vec_pretty(&Self::snapshot_of(&inner));
        }
        // Snapshot writing is observability, not correctness; failures are
        // logged and the engine moves on.
        if let Some(path) = output {
            match rendered {
                Ok(bytes) => {
                    if let Err(err) = fsutil::atomic_write(&path, &bytes) {
                        warn!("failed to write status snapshot: {err:?}");
                    }
                }
                Err(err) => warn!("failed to serialize status snapshot: {err}"),
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl IoEventSink for Reporter {
    fn io_event(&self, kind: IoKind, label: &str, elapsed: Duration) {
        let tag = match kind {
            IoKind::Read => format!("git-read.{label}"),
            IoKind::Write => format!("git-write.{label}"),
        };
        self.with_inner(|inner| {
            *inner.tag_times.entry(tag).or_insert(0.0) += elapsed.as_secs_f64();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn parse(reporter: &Reporter) -> Value {
        serde_json::from_str(&reporter.snapshot_json()).expect("snapshot must be valid json")
    }

    #[test]
    fn snapshot_schema() {
        let reporter = Reporter::new(None);
        reporter.set_status(Status::Updating);
        reporter.start_repo("widgets", "The Widgets Repo");

        let snapshot = parse(&reporter);
        assert_eq!(snapshot["status"], "updating");
        assert_eq!(snapshot["current-repo"]["name"], "widgets");
        assert_eq!(snapshot["current-repo"]["human-name"], "The Widgets Repo");
        assert_eq!(snapshot["current-repo"]["repo-status"], "updating");
        assert_eq!(snapshot["repos"][0]["name"], "widgets");
        assert!(snapshot["statistics"]["last-cycle-time"].is_null());
    }

    #[test]
    fn status_enum_wire_values() {
        let reporter = Reporter::new(None);
        for (status, expected) in [
            (Status::Starting, "starting"),
            (Status::Updating, "updating"),
            (Status::Sleeping, "sleeping"),
            (Status::RefreshingCache, "refreshing-cache"),
            (Status::Stopped, "stopped"),
            (Status::Idle, "idle"),
            (Status::TryloopException, "tryloop-exception"),
        ] {
            reporter.set_status(status);
            assert_eq!(parse(&reporter)["status"], expected);
        }
    }

    #[test]
    fn finishing_a_repo_clears_current_and_keeps_history() {
        let reporter = Reporter::new(None);
        reporter.start_repo("widgets", "Widgets");
        reporter.finish_repo("widgets", RepoStatus::Ok);

        let snapshot = parse(&reporter);
        assert!(snapshot["current-repo"].is_null());
        assert_eq!(snapshot["repos"][0]["repo-status"], "ok");
    }

    #[test]
    fn tag_times_accumulate() {
        let reporter = Reporter::new(None);
        reporter.time_tag("fetch", || {});
        reporter.time_tag("fetch", || {});
        assert!(reporter.tag_seconds("fetch") >= 0.0);
        let snapshot = parse(&reporter);
        assert!(snapshot["statistics"]["tag-times"]["fetch"].is_number());
    }

    #[test]
    fn cycle_times_roll_over() {
        let reporter = Reporter::new(None);
        reporter.start_cycle();
        assert!(parse(&reporter)["statistics"]["current-cycle-time"].is_number());
        reporter.finish_cycle();
        let snapshot = parse(&reporter);
        assert!(snapshot["statistics"]["current-cycle-time"].is_null());
        assert!(snapshot["statistics"]["last-cycle-time"].is_number());
    }

    #[test]
    fn io_events_land_in_tag_times() {
        let reporter = Reporter::new(None);
        reporter.io_event(IoKind::Read, "list-refs", Duration::from_millis(5));
        reporter.io_event(IoKind::Write, "push", Duration::from_millis(5));
        let snapshot = parse(&reporter);
        assert!(snapshot["statistics"]["tag-times"]["git-read.list-refs"].is_number());
        assert!(snapshot["statistics"]["tag-times"]["git-write.push"].is_number());
    }

    #[test]
    fn snapshot_written_to_disk_atomically() {
        let tmp = tempfile::tempdir().expect("must create temporary directory");
        let path = tmp.path().join("status.json");
        let reporter = Reporter::new(Some(path.clone()));
        reporter.set_status(Status::Idle);

        let content = std::fs::read_to_string(&path).expect("snapshot file must exist");
        let snapshot: Value = serde_json::from_str(&content).expect("must parse");
        assert_eq!(snapshot["status"], "idle");
    }
}
