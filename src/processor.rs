//! One pass over one repository.
//!
//! A pass is: consult the snoop URL (maybe skip everything), fetch with
//! pruning, snapshot the refs, pair review branches with their trackers, and
//! advance each pair's state machine. Branch failures are accumulated rather
//! than aborting the pass, so one broken branch cannot starve its siblings.

use error_stack::{Report, Result, ResultExt};
use itertools::Itertools;
use tracing::{debug, info, warn};

use crate::branch::machine::{BranchMachine, BranchOutcome};
use crate::branch::name::{self, ManagedBranch};
use crate::config::RepoDescriptor;
use crate::ext::error_stack::DescribeContext;
use crate::fsutil;
use crate::git::GitDriver;
use crate::services::Services;

/// Errors surfaced from a repository pass.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The working copy could not be prepared (checkout, ident guard, fetch).
    #[error("prepare working copy")]
    Prepare,

    /// One or more branches failed to advance.
    #[error("{0} branch(es) failed to advance")]
    Branches(usize),
}

/// What one pass over a repository did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoSummary {
    /// The snoop URL says nothing changed; the fetch was skipped.
    Skipped,

    /// The pass ran; one entry per managed branch that changed.
    Processed(Vec<(String, BranchOutcome)>),
}

/// See the module docs.
pub struct RepoProcessor {
    repo: RepoDescriptor,
    git: GitDriver,
    services: Services,
    max_diff_bytes: u64,
    watcher_path: std::path::PathBuf,
}

impl RepoProcessor {
    /// Build a processor for one repository.
    pub fn new(
        repo: RepoDescriptor,
        services: Services,
        max_diff_bytes: u64,
        watcher_path: std::path::PathBuf,
    ) -> Self {
        let git = GitDriver::new(
            repo.working_copy().clone(),
            std::sync::Arc::new(services.reporter.clone()),
        );
        Self {
            repo,
            git,
            services,
            max_diff_bytes,
            watcher_path,
        }
    }

    /// The repository this processor manages.
    pub fn repo(&self) -> &RepoDescriptor {
        &self.repo
    }

    /// Run one pass. `force` bypasses the snoop fast path.
    #[tracing::instrument(skip_all, fields(repo = %self.repo.name()))]
    pub fn process(&mut self, force: bool) -> Result<RepoSummary, Error> {
        if !force && self.snoop_says_unchanged() {
            debug!("snoop url unchanged; skipping fetch");
            self.persist_watcher();
            return Ok(RepoSummary::Skipped);
        }

        let reporter = self.services.reporter.clone();

        self.git
            .ensure_ident_ignored()
            .change_context(Error::Prepare)?;

        reporter.time_tag("fetch", || self.fetch())?;

        let branches = reporter.time_tag("parse", || self.managed_branches())?;
        info!("found {} managed branch(es)", branches.len());

        let machine = BranchMachine::new(
            &self.git,
            self.repo.remote(),
            &self.services,
            self.max_diff_bytes,
        );

        let mut outcomes = Vec::new();
        let mut failures: Vec<(String, Report<crate::branch::machine::Error>)> = Vec::new();
        for branch in &branches {
            let (base, description) = branch.key();
            let label = format!("{base}/{description}");
            match reporter.time_tag("branch", || machine.advance(branch)) {
                Ok(BranchOutcome::NoChange) => {}
                Ok(outcome) => outcomes.push((label, outcome)),
                Err(err) => {
                    warn!("branch '{label}' failed to advance: {err:?}");
                    failures.push((label, err));
                }
            }
        }

        self.persist_watcher();

        if !failures.is_empty() {
            let mut report = Report::new(Error::Branches(failures.len()));
            for (label, err) in failures {
                report = report.attach_printable(format!("branch '{label}': {err:?}"));
            }
            return Err(report);
        }
        Ok(RepoSummary::Processed(outcomes))
    }

    /// True when the snoop URL exists and reports no change.
    fn snoop_says_unchanged(&self) -> bool {
        let Some(url) = self.repo.snoop_url() else {
            return false;
        };
        let mut watcher = self.services.watcher();
        let changed = watcher.peek_has_url_recently_changed(url.as_str());
        watcher.mark_visited(url.as_str());
        !changed
    }

    fn fetch(&self) -> Result<(), Error> {
        // Fetching into local `__private_arcyd/*` branches requires that none
        // of them is checked out.
        self.git.checkout("master").change_context(Error::Prepare)?;
        let heads = format!("+refs/heads/*:refs/remotes/{}/*", self.repo.remote());
        let archives = "+refs/arcyd/*:refs/heads/__private_arcyd/*";
        self.git
            .fetch_prune(self.repo.remote(), &[&heads, archives])
            .change_context(Error::Prepare)
            .describe_lazy(|| format!("fetch '{}'", self.repo.name()))
    }

    /// Snapshot the remote branches and pair them into managed branches.
    fn managed_branches(&self) -> Result<Vec<ManagedBranch>, Error> {
        let prefix = format!("refs/remotes/{}/", self.repo.remote());
        let refs = self.git.list_refs().change_context(Error::Prepare)?;
        let branches: Vec<(String, String)> = refs
            .into_iter()
            .filter_map(|(hash, refname)| {
                refname
                    .strip_prefix(&prefix)
                    .filter(|branch| *branch != "HEAD")
                    .map(|branch| (branch.to_owned(), hash))
            })
            .sorted()
            .collect();
        Ok(name::managed_branches(
            branches
                .iter()
                .map(|(branch, hash)| (branch.as_str(), hash.as_str())),
        ))
    }

    /// Flush the shared url-watcher observations to disk. Failures are logged
    /// and tolerated: the cache is reconstructible.
    fn persist_watcher(&self) {
        let mut buffer = Vec::new();
        let dumped = self.services.watcher().dump(&mut buffer);
        if let Err(err) = dumped {
            warn!("failed to serialize url-watcher state: {err:?}");
            return;
        }
        if let Err(err) = fsutil::atomic_write(&self.watcher_path, &buffer) {
            warn!("failed to persist url-watcher state: {err:?}");
        }
    }
}

impl std::fmt::Debug for RepoProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepoProcessor")
            .field("repo", &self.repo.name())
            .finish_non_exhaustive()
    }
}
