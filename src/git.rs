//! Narrow driver over a Git working copy.
//!
//! Everything the engine does to a repository goes through this type: listing
//! refs, fetching, diffing, squash-merging and pushing. Each operation runs
//! the `git` binary in the working copy and reports a timed read/write event
//! through the injected sink, so the reporter sees every byte of repository
//! I/O without the driver knowing who is watching.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Instant;

use error_stack::{report, Result, ResultExt};
use tracing::debug;

use crate::ext::error_stack::{DescribeContext, ErrorHelper, IntoContext};
use crate::ext::result::{WrapErr, WrapOk};
use crate::reporter::{IoEventSink, IoKind};
use crate::text;

/// The identity used for commits the daemon itself creates.
const COMMITTER_NAME: &str = "arcyd";
const COMMITTER_EMAIL: &str = "arcyd@localhost";

/// Required content of the repo-global attributes override.
const ATTRIBUTES_PATH: &str = ".git/info/attributes";
const ATTRIBUTES_CONTENT: &str = "* -ident\n";

/// Errors surfaced by git operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The `git` binary could not be invoked at all.
    #[error("invoke git")]
    Invoke,

    /// A git command exited nonzero.
    #[error("git {0} failed")]
    Failed(&'static str),

    /// A squash merge could not be completed cleanly.
    #[error("squash merge conflict")]
    MergeConflict,

    /// The remote rejected a push.
    #[error("push rejected by remote")]
    PushRejected,

    /// `.git/info/attributes` exists with unexpected content.
    #[error("unexpected content in {ATTRIBUTES_PATH}")]
    IdentAttributes,
}

/// One commit as reported by `revisions_between`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    /// Full object hash.
    pub hash: String,

    /// Author name.
    pub author_name: String,

    /// Author email.
    pub author_email: String,

    /// First line of the message.
    pub subject: String,

    /// Message body after the subject, possibly empty.
    pub body: String,
}

impl Commit {
    /// The author in `Name <email>` form, as `--author` wants it.
    pub fn author(&self) -> String {
        format!("{} <{}>", self.author_name, self.author_email)
    }

    /// Subject and body rejoined into the full message.
    pub fn message(&self) -> String {
        if self.body.is_empty() {
            self.subject.clone()
        } else {
            format!("{}\n\n{}", self.subject, self.body)
        }
    }
}

/// See the module docs.
pub struct GitDriver {
    work_dir: PathBuf,
    sink: Arc<dyn IoEventSink>,
}

impl std::fmt::Debug for GitDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitDriver")
            .field("work_dir", &self.work_dir)
            .finish_non_exhaustive()
    }
}

impl GitDriver {
    /// Create a driver for the working copy at `work_dir`.
    pub fn new(work_dir: impl Into<PathBuf>, sink: Arc<dyn IoEventSink>) -> Self {
        Self {
            work_dir: work_dir.into(),
            sink,
        }
    }

    /// The working copy this driver operates on.
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Clone `url` into `target`, returning a driver over the new copy.
    pub fn clone_into(
        url: &str,
        target: &Path,
        sink: Arc<dyn IoEventSink>,
    ) -> Result<Self, Error> {
        let parent = target.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)
            .context(Error::Invoke)
            .describe_lazy(|| format!("create '{}'", parent.display()))?;

        let started = Instant::now();
        let output = Command::new("git")
            .args(["clone", "--quiet", url])
            .arg(target)
            .current_dir(parent)
            .output();
        sink.io_event(IoKind::Read, "clone", started.elapsed());

        let output = output
            .context(Error::Invoke)
            .describe_lazy(|| format!("clone '{url}'"))?;
        if !output.status.success() {
            let stderr = text::to_unicode(&output.stderr);
            return report!(Error::Failed("clone"))
                .wrap_err()
                .describe_lazy(|| format!("clone of '{url}' exited {}", output.status))
                .describe_lazy(|| format!("stderr: {}", stderr.trim_end()));
        }
        Ok(Self::new(target, sink))
    }

    fn run(&self, kind: IoKind, label: &'static str, args: &[&str]) -> Result<Vec<u8>, Error> {
        let started = Instant::now();
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.work_dir)
            .env("GIT_COMMITTER_NAME", COMMITTER_NAME)
            .env("GIT_COMMITTER_EMAIL", COMMITTER_EMAIL)
            .env("GIT_AUTHOR_NAME", COMMITTER_NAME)
            .env("GIT_AUTHOR_EMAIL", COMMITTER_EMAIL)
            .output();
        self.sink.io_event(kind, label, started.elapsed());

        let output = output
            .context(Error::Invoke)
            .describe_lazy(|| format!("run git in '{}'", self.work_dir.display()))?;
        if !output.status.success() {
            let stderr = text::to_unicode(&output.stderr);
            debug!("git {label} failed: {stderr}");
            return report!(Error::Failed(label))
                .wrap_err()
                .describe_lazy(|| format!("git {} exited {}", args.join(" "), output.status))
                .describe_lazy(|| format!("stderr: {}", stderr.trim_end()));
        }
        Ok(output.stdout)
    }

    fn run_text(
        &self,
        kind: IoKind,
        label: &'static str,
        args: &[&str],
    ) -> Result<String, Error> {
        self.run(kind, label, args).map(|out| text::to_unicode(&out))
    }

    /// All refs in the working copy as `(hash, fully-qualified ref)` pairs.
    pub fn list_refs(&self) -> Result<Vec<(String, String)>, Error> {
        let output = self.run_text(
            IoKind::Read,
            "list-refs",
            &["for-each-ref", "--format=%(objectname) %(refname)"],
        )?;
        output
            .lines()
            .filter_map(|line| {
                line.split_once(' ')
                    .map(|(hash, name)| (hash.to_owned(), name.to_owned()))
            })
            .collect::<Vec<_>>()
            .wrap_ok()
    }

    /// Fetch from `remote` with pruning, mapping the provided refspecs.
    pub fn fetch_prune(&self, remote: &str, refspecs: &[&str]) -> Result<(), Error> {
        let mut args = vec!["fetch", "--prune", "--quiet", remote];
        args.extend_from_slice(refspecs);
        self.run(IoKind::Read, "fetch", &args).map(|_| ())
    }

    /// Check out an existing branch.
    pub fn checkout(&self, branch: &str) -> Result<(), Error> {
        self.run(IoKind::Write, "checkout", &["checkout", "--quiet", branch])
            .map(|_| ())
    }

    /// Create or reset `branch` at `start` and check it out.
    pub fn checkout_forced_new_branch(&self, branch: &str, start: &str) -> Result<(), Error> {
        self.run(
            IoKind::Write,
            "checkout-new-branch",
            &["checkout", "--quiet", "-B", branch, start],
        )
        .map(|_| ())
    }

    /// Create `new` at `base` without checking it out.
    pub fn new_branch_from(&self, new: &str, base: &str, force: bool) -> Result<(), Error> {
        let args: Vec<&str> = if force {
            vec!["branch", "--force", new, base]
        } else {
            vec!["branch", new, base]
        };
        self.run(IoKind::Write, "new-branch", &args).map(|_| ())
    }

    /// Check out a new orphan branch with an empty index and worktree.
    pub fn orphan_clean(&self, name: &str) -> Result<(), Error> {
        self.run(
            IoKind::Write,
            "checkout-orphan",
            &["checkout", "--quiet", "--orphan", name],
        )?;
        self.run(
            IoKind::Write,
            "orphan-clean",
            &["rm", "-rf", "--quiet", "--ignore-unmatch", "."],
        )
        .map(|_| ())
    }

    /// Commit the current index, allowing an empty commit.
    pub fn commit_allow_empty(&self, message: &str) -> Result<(), Error> {
        self.run(
            IoKind::Write,
            "commit",
            &["commit", "--quiet", "--allow-empty", "-m", message],
        )
        .map(|_| ())
    }

    /// Unified diff between the merge base of `base`/`tip` and `tip`, with
    /// the given number of context lines.
    pub fn diff_range(&self, base: &str, tip: &str, context: usize) -> Result<Vec<u8>, Error> {
        let context_arg = format!("-U{context}");
        let range = format!("{base}...{tip}");
        self.run(
            IoKind::Read,
            "diff",
            &["diff", "--no-color", &context_arg, &range],
        )
    }

    /// Names of files changed between the merge base of `base`/`tip` and `tip`.
    pub fn diff_range_names_only(&self, base: &str, tip: &str) -> Result<Vec<u8>, Error> {
        let range = format!("{base}...{tip}");
        self.run(
            IoKind::Read,
            "diff-names",
            &["diff", "--no-color", "--name-only", &range],
        )
    }

    /// Commits reachable from `tip` but not `base`, oldest first.
    pub fn revisions_between(&self, base: &str, tip: &str) -> Result<Vec<Commit>, Error> {
        let range = format!("{base}..{tip}");
        let output = self.run_text(
            IoKind::Read,
            "log",
            &[
                "log",
                "--reverse",
                "--format=%H%x1f%an%x1f%ae%x1f%s%x1f%b%x1e",
                &range,
            ],
        )?;
        output
            .split('\x1e')
            .map(str::trim_start)
            .filter(|record| !record.is_empty())
            .map(|record| {
                let mut fields = record.split('\x1f');
                let mut next = || fields.next().unwrap_or("").to_owned();
                Commit {
                    hash: next(),
                    author_name: next(),
                    author_email: next(),
                    subject: next(),
                    body: next().trim_end().to_owned(),
                }
            })
            .collect::<Vec<_>>()
            .wrap_ok()
    }

    /// The hash at `refname`, when it exists.
    pub fn rev_parse(&self, refname: &str) -> Result<String, Error> {
        self.run_text(
            IoKind::Read,
            "rev-parse",
            &["rev-parse", "--verify", "--quiet", refname],
        )
        .map(|out| out.trim().to_owned())
    }

    /// Squash-merge `source` into the checked-out branch with the given
    /// message and author. On conflict the working copy is restored and
    /// [`Error::MergeConflict`] is surfaced.
    pub fn squash_merge_into_head(
        &self,
        source: &str,
        message: &str,
        author: &str,
    ) -> Result<(), Error> {
        let merged = self.run(
            IoKind::Write,
            "squash-merge",
            &["merge", "--squash", "--quiet", source],
        );
        if let Err(err) = merged {
            let _ = self.run(IoKind::Write, "reset", &["reset", "--hard", "--quiet", "HEAD"]);
            return Err(err)
                .change_context(Error::MergeConflict)
                .describe_lazy(|| format!("squash merge of '{source}'"));
        }
        self.run(
            IoKind::Write,
            "commit",
            &[
                "commit",
                "--quiet",
                "-m",
                message,
                "--author",
                author,
            ],
        )
        .map(|_| ())
    }

    /// Record `commit` into the history of the checked-out branch while
    /// keeping the branch's own content ("ours" merge).
    pub fn merge_ours(&self, commit: &str, message: &str) -> Result<(), Error> {
        self.run(
            IoKind::Write,
            "merge-ours",
            &[
                "merge",
                "--quiet",
                "--no-ff",
                "--strategy",
                "ours",
                "--allow-unrelated-histories",
                "-m",
                message,
                commit,
            ],
        )
        .map(|_| ())
    }

    /// Discard all local changes, resetting to `target`.
    pub fn reset_hard(&self, target: &str) -> Result<(), Error> {
        self.run(
            IoKind::Write,
            "reset",
            &["reset", "--hard", "--quiet", target],
        )
        .map(|_| ())
    }

    /// Push `branch` to the same name on `remote`.
    pub fn push(&self, branch: &str, remote: &str) -> Result<(), Error> {
        let refspec = format!("{branch}:{branch}");
        self.push_refspec(remote, &refspec)
    }

    /// Push local ref `local` to `remote_ref` on `remote`, forcing.
    pub fn push_asymmetric(
        &self,
        local: &str,
        remote_ref: &str,
        remote: &str,
    ) -> Result<(), Error> {
        let refspec = format!("+{local}:{remote_ref}");
        self.push_refspec(remote, &refspec)
    }

    /// Delete `branch` on `remote`.
    pub fn push_delete(&self, branch: &str, remote: &str) -> Result<(), Error> {
        let refspec = format!(":refs/heads/{branch}");
        self.push_refspec(remote, &refspec)
    }

    fn push_refspec(&self, remote: &str, refspec: &str) -> Result<(), Error> {
        let pushed = self.run(
            IoKind::Write,
            "push",
            &["push", "--quiet", remote, refspec],
        );
        match pushed {
            Ok(_) => Ok(()),
            Err(err) => {
                // Non-fast-forward rejections deserve their own kind so the
                // landing protocol can abort instead of retrying forever.
                let rendered = format!("{err:?}");
                if rendered.contains("[rejected]")
                    || rendered.contains("failed to push")
                    || rendered.contains("non-fast-forward")
                {
                    Err(err).change_context(Error::PushRejected)
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Ensure the repo-global attributes override disables ident expansion.
    ///
    /// The file is created when absent. When it exists with any other content
    /// this fails: merging attribute files automatically is not safe, and a
    /// human needs to decide.
    pub fn ensure_ident_ignored(&self) -> Result<(), Error> {
        let path = self.work_dir.join(ATTRIBUTES_PATH);
        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .context(Error::IdentAttributes)
                .describe_lazy(|| format!("read '{}'", path.display()))?;
            if content == ATTRIBUTES_CONTENT {
                return Ok(());
            }
            return report!(Error::IdentAttributes)
                .wrap_err()
                .describe_lazy(|| format!("found content: {content:?}"))
                .help(
                    "arcyd requires '* -ident' in the repo attributes override and \
                     will not rewrite a file a human may have customized",
                );
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .context(Error::IdentAttributes)
                .describe_lazy(|| format!("create '{}'", parent.display()))?;
        }
        std::fs::write(&path, ATTRIBUTES_CONTENT)
            .context(Error::IdentAttributes)
            .describe_lazy(|| format!("write '{}'", path.display()))
    }
}

/// A sink that discards all events, for contexts with no reporter.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl IoEventSink for NullSink {
    fn io_event(&self, _kind: IoKind, _label: &str, _elapsed: std::time::Duration) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn driver_in(dir: &TempDir) -> GitDriver {
        GitDriver::new(dir.path(), Arc::new(NullSink))
    }

    fn git(dir: &TempDir, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(dir.path())
            .env("GIT_COMMITTER_NAME", "test")
            .env("GIT_COMMITTER_EMAIL", "test@example.com")
            .env("GIT_AUTHOR_NAME", "test")
            .env("GIT_AUTHOR_EMAIL", "test@example.com")
            .status()
            .expect("git must be runnable");
        assert!(status.success(), "git {args:?} must succeed");
    }

    fn repo_with_commit() -> TempDir {
        let dir = TempDir::new().expect("must create temporary directory");
        git(&dir, &["init", "--quiet", "-b", "master"]);
        fs::write(dir.path().join("README"), "hello\n").expect("must write");
        git(&dir, &["add", "README"]);
        git(&dir, &["commit", "--quiet", "-m", "initial commit"]);
        dir
    }

    #[test]
    fn list_refs_sees_branches() {
        let dir = repo_with_commit();
        let driver = driver_in(&dir);
        let refs = driver.list_refs().expect("must list refs");
        assert!(refs
            .iter()
            .any(|(_, name)| name == "refs/heads/master"));
    }

    #[test]
    fn revisions_between_parses_messages() {
        let dir = repo_with_commit();
        git(&dir, &["checkout", "--quiet", "-b", "topic"]);
        fs::write(dir.path().join("f"), "x\n").expect("must write");
        git(&dir, &["add", "f"]);
        git(
            &dir,
            &["commit", "--quiet", "-m", "add feature\n\nTest Plan: run it\nReviewers: alice"],
        );

        let driver = driver_in(&dir);
        let commits = driver
            .revisions_between("master", "topic")
            .expect("must log");
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].subject, "add feature");
        assert!(commits[0].body.contains("Test Plan: run it"));
        assert_eq!(commits[0].author_name, "test");
    }

    #[test]
    fn diff_range_respects_context() {
        let dir = repo_with_commit();
        git(&dir, &["checkout", "--quiet", "-b", "topic"]);
        fs::write(dir.path().join("README"), "hello\nworld\n").expect("must write");
        git(&dir, &["add", "README"]);
        git(&dir, &["commit", "--quiet", "-m", "expand readme"]);

        let driver = driver_in(&dir);
        let diff = driver.diff_range("master", "topic", 0).expect("must diff");
        assert!(text::to_unicode(&diff).contains("+world"));

        let names = driver
            .diff_range_names_only("master", "topic")
            .expect("must diff");
        assert_eq!(text::to_unicode(&names).trim(), "README");
    }

    #[test]
    fn squash_merge_conflict_is_distinguished_and_cleaned_up() {
        let dir = repo_with_commit();
        git(&dir, &["checkout", "--quiet", "-b", "topic"]);
        fs::write(dir.path().join("README"), "topic version\n").expect("must write");
        git(&dir, &["add", "README"]);
        git(&dir, &["commit", "--quiet", "-m", "topic change"]);
        git(&dir, &["checkout", "--quiet", "master"]);
        fs::write(dir.path().join("README"), "master version\n").expect("must write");
        git(&dir, &["add", "README"]);
        git(&dir, &["commit", "--quiet", "-m", "master change"]);

        let driver = driver_in(&dir);
        let err = driver
            .squash_merge_into_head("topic", "land topic", "test <test@example.com>")
            .expect_err("conflicting merge must fail");
        assert!(matches!(err.current_context(), Error::MergeConflict));

        // The working copy must be clean again.
        let status = driver
            .run_text(IoKind::Read, "status", &["status", "--porcelain"])
            .expect("must get status");
        assert_eq!(status.trim(), "");
    }

    #[test]
    fn squash_merge_applies_with_author() {
        let dir = repo_with_commit();
        git(&dir, &["checkout", "--quiet", "-b", "topic"]);
        fs::write(dir.path().join("feature"), "content\n").expect("must write");
        git(&dir, &["add", "feature"]);
        git(&dir, &["commit", "--quiet", "-m", "add feature"]);
        git(&dir, &["checkout", "--quiet", "master"]);

        let driver = driver_in(&dir);
        driver
            .squash_merge_into_head("topic", "land: add feature", "alice <alice@example.com>")
            .expect("merge must apply");

        let commits = driver
            .revisions_between("master~1", "master")
            .expect("must log");
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].subject, "land: add feature");
        assert_eq!(commits[0].author_name, "alice");
    }

    #[test]
    fn orphan_clean_starts_empty_history() {
        let dir = repo_with_commit();
        let driver = driver_in(&dir);
        driver.orphan_clean("archive").expect("must orphan");
        driver
            .commit_allow_empty("archive initial commit")
            .expect("must commit");

        let refs = driver.list_refs().expect("must list refs");
        assert!(refs.iter().any(|(_, name)| name == "refs/heads/archive"));
        // The orphan commit has no parents: listing everything reachable from
        // it yields exactly one commit.
        let output = driver
            .run_text(IoKind::Read, "log", &["log", "--format=%H", "archive"])
            .expect("must log");
        assert_eq!(output.lines().count(), 1);
    }

    #[test]
    fn ours_merge_keeps_content_and_links_history() {
        let dir = repo_with_commit();
        let driver = driver_in(&dir);

        // Create a topic commit to archive, then an orphan archive branch.
        git(&dir, &["checkout", "--quiet", "-b", "topic"]);
        fs::write(dir.path().join("topic-file"), "content\n").expect("must write");
        git(&dir, &["add", "topic-file"]);
        git(&dir, &["commit", "--quiet", "-m", "topic work"]);
        let topic_hash = driver.rev_parse("topic").expect("must resolve");

        driver.orphan_clean("archive").expect("must orphan");
        driver.commit_allow_empty("archive start").expect("must commit");
        driver
            .merge_ours(&topic_hash, "recorded topic")
            .expect("must merge");

        // Content of the archive branch is untouched by the merge.
        assert!(!dir.path().join("topic-file").exists());
        // First-parent history: merge commit then the orphan initial commit.
        let output = driver
            .run_text(
                IoKind::Read,
                "log",
                &["log", "--first-parent", "--format=%s", "archive"],
            )
            .expect("must log");
        let subjects: Vec<&str> = output.lines().collect();
        assert_eq!(subjects, vec!["recorded topic", "archive start"]);
    }

    #[test]
    fn ident_guard_creates_and_refuses() {
        let dir = repo_with_commit();
        let driver = driver_in(&dir);

        driver.ensure_ident_ignored().expect("must create");
        let path = dir.path().join(ATTRIBUTES_PATH);
        assert_eq!(
            fs::read_to_string(&path).expect("must read"),
            ATTRIBUTES_CONTENT
        );

        // Idempotent when the content is exactly right.
        driver.ensure_ident_ignored().expect("must accept");

        // Refuses to clobber anything else.
        fs::write(&path, "* ident\n").expect("must write");
        let err = driver.ensure_ident_ignored().expect_err("must refuse");
        assert!(matches!(err.current_context(), Error::IdentAttributes));
    }
}
