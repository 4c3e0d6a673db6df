//! Fixtures shared by the integration tests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use error_stack::{report, Result};
use tempfile::TempDir;

use arcyd::api::review::{
    self, CreateReview, ReviewClient, ReviewId, ReviewInfo, ReviewStatus, UserDirectory, UserId,
    UserRecord,
};
use arcyd::cache::identity::UserCache;
use arcyd::cache::review_state::ReviewStateCache;
use arcyd::config::RepoDescriptor;
use arcyd::reporter::Reporter;
use arcyd::services::Services;
use arcyd::watcher::{Observation, UrlProbe, UrlWatcher};

/// Run git in `dir`, asserting success.
pub fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_COMMITTER_NAME", "author")
        .env("GIT_COMMITTER_EMAIL", "author@example.com")
        .env("GIT_AUTHOR_NAME", "author")
        .env("GIT_AUTHOR_EMAIL", "author@example.com")
        .status()
        .expect("git must be runnable");
    assert!(status.success(), "git {args:?} must succeed in {dir:?}");
}

/// Run git in `dir` and capture stdout.
pub fn git_output(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git must be runnable");
    assert!(
        output.status.success(),
        "git {args:?} must succeed in {dir:?}: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).to_string()
}

/// A throwaway hosting setup: a bare origin, a "human" seed clone for pushing
/// review branches, and the daemon's working copy.
pub struct Fixture {
    pub tmp: TempDir,
    pub origin: PathBuf,
    pub seed: PathBuf,
    pub work: PathBuf,
}

impl Fixture {
    /// Create the fixture with one commit on `master`.
    pub fn new() -> Self {
        let tmp = TempDir::new().expect("must create temporary directory");
        let origin = tmp.path().join("origin.git");
        let seed = tmp.path().join("seed");
        let work = tmp.path().join("work");

        std::fs::create_dir(&origin).expect("must create");
        git(&origin, &["init", "--bare", "--quiet", "-b", "master"]);

        git(tmp.path(), &[
            "clone",
            "--quiet",
            origin.to_str().expect("path"),
            "seed",
        ]);
        std::fs::write(seed.join("data.txt"), "base\n").expect("must write");
        git(&seed, &["add", "data.txt"]);
        git(&seed, &["commit", "--quiet", "-m", "initial commit"]);
        git(&seed, &["push", "--quiet", "origin", "master"]);

        git(tmp.path(), &[
            "clone",
            "--quiet",
            origin.to_str().expect("path"),
            "work",
        ]);

        Self {
            tmp,
            origin,
            seed,
            work,
        }
    }

    /// Push a review branch carrying one commit touching `file`.
    pub fn push_review_branch(&self, branch: &str, file: &str, content: &str, message: &str) {
        git(&self.seed, &["checkout", "--quiet", "master"]);
        git(&self.seed, &["checkout", "--quiet", "-b", branch]);
        std::fs::write(self.seed.join(file), content).expect("must write");
        git(&self.seed, &["add", file]);
        git(&self.seed, &["commit", "--quiet", "-m", message]);
        git(&self.seed, &["push", "--quiet", "origin", branch]);
    }

    /// Branch names (short) currently on the origin.
    pub fn origin_branches(&self) -> Vec<String> {
        git_output(
            &self.origin,
            &["for-each-ref", "--format=%(refname:short)", "refs/heads"],
        )
        .lines()
        .map(str::to_owned)
        .collect()
    }

    /// Whether the origin carries the given fully-qualified ref.
    pub fn origin_has_ref(&self, refname: &str) -> bool {
        git_output(&self.origin, &["for-each-ref", "--format=%(refname)"])
            .lines()
            .any(|line| line == refname)
    }

    /// Full messages of the first-parent history of a ref on the origin,
    /// newest first.
    pub fn origin_first_parent_messages(&self, refname: &str) -> Vec<String> {
        git_output(
            &self.origin,
            &["log", "--first-parent", "--format=%B%x1e", refname],
        )
        .split('\x1e')
        .map(str::trim)
        .filter(|message| !message.is_empty())
        .map(str::to_owned)
        .collect()
    }

    /// The descriptor for the daemon's working copy, no snoop URL.
    pub fn descriptor(&self) -> RepoDescriptor {
        RepoDescriptor::new(
            "widgets".to_owned(),
            "The Widgets Repo".to_owned(),
            self.work.clone(),
            self.origin.to_str().expect("path").to_owned(),
            "origin".to_owned(),
            "phab".to_owned(),
            vec!["admin@example.com".to_owned()],
            None,
        )
    }

    /// Path for the persisted url-watcher state.
    pub fn watcher_path(&self) -> PathBuf {
        self.tmp.path().join("url-watcher.json")
    }
}

/// One review as the fake service stores it.
#[derive(Debug, Clone)]
pub struct FakeReview {
    pub status: ReviewStatus,
    pub title: String,
    pub summary: String,
    pub test_plan: String,
    pub reviewers: Vec<String>,
    pub comments: Vec<String>,
    pub diff_updates: usize,
}

#[derive(Debug, Default)]
struct FakeState {
    reviews: BTreeMap<ReviewId, FakeReview>,
    next_id: ReviewId,
}

/// An in-memory review service with a few known users.
#[derive(Debug)]
pub struct FakePhabricator {
    state: Mutex<FakeState>,
    known_users: Vec<&'static str>,
}

impl FakePhabricator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState {
                reviews: BTreeMap::new(),
                next_id: 1,
            }),
            known_users: vec!["alice", "bob"],
        })
    }

    pub fn review(&self, id: ReviewId) -> FakeReview {
        self.state
            .lock()
            .expect("fake lock")
            .reviews
            .get(&id)
            .expect("review must exist")
            .clone()
    }

    pub fn set_status(&self, id: ReviewId, status: ReviewStatus) {
        self.state
            .lock()
            .expect("fake lock")
            .reviews
            .get_mut(&id)
            .expect("review must exist")
            .status = status;
    }

    pub fn review_count(&self) -> usize {
        self.state.lock().expect("fake lock").reviews.len()
    }

    fn record(name: &str) -> UserRecord {
        UserRecord {
            username: name.to_owned(),
            id: UserId(format!("PHID-USER-{name}")),
            email: Some(format!("{name}@example.com")),
        }
    }
}

impl ReviewClient for FakePhabricator {
    fn create_review(&self, fields: &CreateReview) -> Result<ReviewId, review::Error> {
        let mut state = self.state.lock().expect("fake lock");
        let id = state.next_id;
        state.next_id += 1;
        state.reviews.insert(
            id,
            FakeReview {
                status: ReviewStatus::NeedsReview,
                title: fields.title.clone(),
                summary: fields.summary.clone(),
                test_plan: fields.test_plan.clone(),
                reviewers: fields
                    .reviewers
                    .iter()
                    .map(|id| id.0.trim_start_matches("PHID-USER-").to_owned())
                    .collect(),
                comments: Vec::new(),
                diff_updates: 0,
            },
        );
        Ok(id)
    }

    fn update_diff(&self, id: ReviewId, _diff: &str, _message: &str) -> Result<(), review::Error> {
        let mut state = self.state.lock().expect("fake lock");
        let review = state
            .reviews
            .get_mut(&id)
            .ok_or_else(|| report!(review::Error::NoSuchReview(id)))?;
        review.diff_updates += 1;
        Ok(())
    }

    fn comment(&self, id: ReviewId, body: &str) -> Result<(), review::Error> {
        let mut state = self.state.lock().expect("fake lock");
        let review = state
            .reviews
            .get_mut(&id)
            .ok_or_else(|| report!(review::Error::NoSuchReview(id)))?;
        review.comments.push(body.to_owned());
        Ok(())
    }

    fn close(&self, id: ReviewId) -> Result<(), review::Error> {
        self.set_status(id, ReviewStatus::Closed);
        Ok(())
    }

    fn abandon(&self, id: ReviewId) -> Result<(), review::Error> {
        self.set_status(id, ReviewStatus::Abandoned);
        Ok(())
    }

    fn query(&self, id: ReviewId) -> Result<ReviewInfo, review::Error> {
        let state = self.state.lock().expect("fake lock");
        let review = state
            .reviews
            .get(&id)
            .ok_or_else(|| report!(review::Error::NoSuchReview(id)))?;
        Ok(ReviewInfo {
            id,
            status: review.status,
            title: review.title.clone(),
            summary: review.summary.clone(),
            reviewers: review.reviewers.clone(),
            uri: None,
        })
    }

    fn query_statuses(
        &self,
        ids: &[ReviewId],
    ) -> Result<Vec<(ReviewId, ReviewStatus)>, review::Error> {
        let state = self.state.lock().expect("fake lock");
        Ok(ids
            .iter()
            .filter_map(|id| state.reviews.get(id).map(|review| (*id, review.status)))
            .collect())
    }
}

impl UserDirectory for FakePhabricator {
    fn query_users_by_name(&self, usernames: &[String]) -> Result<Vec<UserRecord>, review::Error> {
        let unknown: Vec<String> = usernames
            .iter()
            .filter(|name| !self.known_users.contains(&name.as_str()))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return Err(report!(review::Error::UnknownUsernames(unknown)));
        }
        Ok(usernames.iter().map(|name| Self::record(name)).collect())
    }

    fn query_users_by_id(&self, ids: &[UserId]) -> Result<Vec<UserRecord>, review::Error> {
        Ok(ids
            .iter()
            .filter_map(|id| {
                id.0.strip_prefix("PHID-USER-")
                    .filter(|name| self.known_users.contains(name))
                    .map(Self::record)
            })
            .collect())
    }

    fn query_users_by_email(&self, emails: &[String]) -> Result<Vec<UserRecord>, review::Error> {
        Ok(emails
            .iter()
            .filter_map(|email| {
                email
                    .strip_suffix("@example.com")
                    .filter(|name| self.known_users.contains(name))
                    .map(Self::record)
            })
            .collect())
    }
}

struct DirectoryHandle(Arc<FakePhabricator>);

impl UserDirectory for DirectoryHandle {
    fn query_users_by_name(&self, usernames: &[String]) -> Result<Vec<UserRecord>, review::Error> {
        self.0.query_users_by_name(usernames)
    }

    fn query_users_by_id(&self, ids: &[UserId]) -> Result<Vec<UserRecord>, review::Error> {
        self.0.query_users_by_id(ids)
    }

    fn query_users_by_email(&self, emails: &[String]) -> Result<Vec<UserRecord>, review::Error> {
        self.0.query_users_by_email(emails)
    }
}

/// A probe answering with a fixed sequence of digests, then repeating the
/// last one forever.
pub struct SequenceProbe {
    digests: Mutex<Vec<&'static str>>,
}

impl SequenceProbe {
    pub fn new(digests: Vec<&'static str>) -> Self {
        Self {
            digests: Mutex::new(digests),
        }
    }
}

impl UrlProbe for SequenceProbe {
    fn probe(&self, _url: &str) -> Result<Observation, arcyd::watcher::Error> {
        let mut digests = self.digests.lock().expect("probe lock");
        let digest = if digests.len() > 1 {
            digests.remove(0)
        } else {
            digests[0]
        };
        Ok(Observation {
            status: 200,
            digest: digest.to_owned(),
        })
    }
}

/// Wire the shared services around the fake review service.
pub fn services_around(fake: &Arc<FakePhabricator>, probe: Box<dyn UrlProbe>) -> Services {
    let review: Arc<dyn ReviewClient> = fake.clone();
    let mut review_states = ReviewStateCache::new();
    review_states.set_lister(Box::new(review.clone()));

    Services {
        review,
        review_states: Arc::new(Mutex::new(review_states)),
        users: Arc::new(Mutex::new(UserCache::new(Box::new(DirectoryHandle(
            fake.clone(),
        ))))),
        watcher: Arc::new(Mutex::new(UrlWatcher::new(probe))),
        reporter: Reporter::new(None),
    }
}
