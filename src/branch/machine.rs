//! The per-branch state machine.
//!
//! Each managed branch is advanced once per repository pass: fresh review
//! branches become review objects, moved tips become updated diffs, accepted
//! reviews get squash-landed, and branches that vanish are abandoned. All
//! state lives in the tracker branch name and on the review service; the
//! machine itself is stateless and recovers everything from the ref snapshot
//! it is handed.

use error_stack::{report, Result, ResultExt};
use indoc::indoc;
use tracing::{info, warn};

use crate::api::review::{CreateReview, ReviewId, ReviewStatus, UserId};
use crate::branch::message;
use crate::branch::name::{
    ManagedBranch, ReviewBranchName, TrackerBranchName, TrackerStatus, ABANDONED_ARCHIVE_BRANCH,
    ABANDONED_ARCHIVE_REF, LANDED_ARCHIVE_BRANCH, LANDED_ARCHIVE_REF,
};
use crate::cache::identity;
use crate::ext::error_stack::DescribeContext;
use crate::ext::result::WrapErr;
use crate::git::{self, Commit, GitDriver};
use crate::services::Services;
use crate::text;

/// Initial commit message of the landed-review archive branch. Stored
/// verbatim in every managed repository; do not reword.
pub const LANDED_ARCHIVE_MESSAGE: &str = indoc! {"
    Create an archive branch for landed branches

    Landed branches will be automatically merged here by Arcyd for your reference.

    This branch is useful for:
    - finding the original commits of branches landed by Arcyd
    - retrieving the full history of a review branch after it has landed

    Read it with 'git log --first-parent'.
"};

/// Initial commit message of the abandoned-review archive branch. Stored
/// verbatim in every managed repository; do not reword.
pub const ABANDONED_ARCHIVE_MESSAGE: &str = indoc! {"
    Create an archive branch for abandoned branches

    Abandoned branches will be automatically merged here by Arcyd for your reference.

    This branch is useful for:
    - finding the original commits of branches abandoned by Arcyd
    - retrieving the content of a review branch after it was deleted

    Read it with 'git log --first-parent'.
"};

/// Context lines requested for the full-fidelity review diff.
const FULL_DIFF_CONTEXT: usize = 1000;

/// Errors surfaced while advancing a branch.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A git operation failed.
    #[error("operate on the working copy")]
    Git,

    /// A review-service call failed.
    #[error("call the review service")]
    Review,

    /// Reviewer resolution failed for infrastructure reasons.
    #[error("resolve reviewers")]
    Identity,

    /// The review-status cache failed.
    #[error("query review status")]
    StatusCache,

    /// The branch's base does not exist on the remote.
    #[error("base branch missing: {0}")]
    MissingBase(String),
}

/// What advancing one branch did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchOutcome {
    /// Nothing needed doing.
    NoChange,

    /// A review object was created.
    Created(ReviewId),

    /// The review's diff was updated to a new tip.
    Updated(ReviewId),

    /// The branch was squash-landed and archived.
    Landed(ReviewId),

    /// The review was abandoned and the tracker retired.
    Abandoned(Option<ReviewId>),

    /// The branch was marked bad.
    MarkedBad {
        /// The review commented on, when one exists.
        review_id: Option<ReviewId>,

        /// The bad status recorded in the tracker name.
        status: TrackerStatus,
    },
}

/// See the module docs.
pub struct BranchMachine<'a> {
    git: &'a GitDriver,
    remote: &'a str,
    services: &'a Services,
    max_diff_bytes: u64,
}

impl<'a> BranchMachine<'a> {
    /// Build a machine operating on one repository's working copy.
    pub fn new(
        git: &'a GitDriver,
        remote: &'a str,
        services: &'a Services,
        max_diff_bytes: u64,
    ) -> Self {
        Self {
            git,
            remote,
            services,
            max_diff_bytes,
        }
    }

    /// Advance one managed branch a single step.
    pub fn advance(&self, branch: &ManagedBranch) -> Result<BranchOutcome, Error> {
        match (&branch.review, &branch.tracker) {
            (None, None) => Ok(BranchOutcome::NoChange),
            (Some((review, tip)), None) => self.create(review, tip, None),
            (None, Some((tracker, hash))) => self.abandon(tracker, hash),
            (Some((review, tip)), Some((tracker, hash))) => {
                self.update(review, tip, tracker, hash)
            }
        }
    }

    fn remote_ref(&self, branch: &str) -> String {
        format!("refs/remotes/{}/{}", self.remote, branch)
    }

    /// Fresh review branch (or a branch previously marked bad before a review
    /// object existed): try to create the review object.
    fn create(
        &self,
        review: &ReviewBranchName,
        tip: &str,
        replacing: Option<&TrackerBranchName>,
    ) -> Result<BranchOutcome, Error> {
        let base_ref = self.remote_ref(&review.base);
        if self.git.rev_parse(&base_ref).is_err() {
            return report!(Error::MissingBase(review.base.clone()))
                .wrap_err()
                .describe_lazy(|| format!("while creating a review for '{review}'"));
        }

        let commits = self
            .git
            .revisions_between(&base_ref, tip)
            .change_context(Error::Git)?;
        let fields = match message::parse_fields(&commits) {
            Ok(fields) => fields,
            Err(reason) => {
                return self.mark_bad_inreview(review, tip, replacing, None, &reason.to_string())
            }
        };

        let reviewers = match self.resolve_reviewers(&fields.reviewers)? {
            Ok(ids) => ids,
            Err(unknown) => {
                let reason = format!("unknown reviewer: {unknown}");
                return self.mark_bad_inreview(review, tip, replacing, None, &reason);
            }
        };

        let diff = match self.diff_within_budget(&base_ref, tip)? {
            Some(diff) => diff,
            None => {
                let reason = format!(
                    "the diff is larger than the configured limit of {} bytes",
                    self.max_diff_bytes
                );
                return self.mark_bad_inreview(review, tip, replacing, None, &reason);
            }
        };

        let id = self
            .services
            .review
            .create_review(&CreateReview {
                title: fields.title.clone(),
                summary: fields.summary.clone(),
                test_plan: fields.test_plan.clone(),
                reviewers,
                diff,
            })
            .change_context(Error::Review)
            .describe_lazy(|| format!("create review for '{review}'"))?;

        let tracker = TrackerBranchName {
            status: TrackerStatus::OkNew,
            description: review.description.clone(),
            base: review.base.clone(),
            review_id: Some(id),
        };
        self.publish_tracker(&tracker, tip, replacing)?;
        info!("created review {id} for '{review}'");
        Ok(BranchOutcome::Created(id))
    }

    /// Both sides present: keep the review in sync, or land it.
    fn update(
        &self,
        review: &ReviewBranchName,
        tip: &str,
        tracker: &TrackerBranchName,
        tracker_hash: &str,
    ) -> Result<BranchOutcome, Error> {
        // Landed is terminal: never touch the review, branch or tracker again.
        if tracker.status.is_terminal() {
            return Ok(BranchOutcome::NoChange);
        }

        let id = match tracker.review_id {
            Some(id) => id,
            // Marked bad before a review object existed. A new tip is a new
            // chance; an unchanged tip stays bad.
            None => {
                if tip == tracker_hash {
                    return Ok(BranchOutcome::NoChange);
                }
                return self.create(review, tip, Some(tracker));
            }
        };

        // A failed landing is retried only once the author moves the branch.
        // The base may already contain the squashed content, so blindly
        // re-running the landing protocol against the same tip could land
        // the same review twice.
        if tracker.status == TrackerStatus::BadLand && tip == tracker_hash {
            return Ok(BranchOutcome::NoChange);
        }

        let status = self
            .services
            .review_states()
            .get(id)
            .change_context(Error::StatusCache)?;

        if status == ReviewStatus::Accepted {
            return self.land(review, tip, tracker, id);
        }
        if !status.is_open() {
            // Closed or abandoned on the service side while the branch still
            // exists; a human is doing something deliberate. Stay out.
            return Ok(BranchOutcome::NoChange);
        }
        if tip == tracker_hash {
            return Ok(BranchOutcome::NoChange);
        }

        // The tip moved: re-validate and refresh the diff.
        let base_ref = self.remote_ref(&review.base);
        let commits = self
            .git
            .revisions_between(&base_ref, tip)
            .change_context(Error::Git)?;
        let fields = match message::parse_fields(&commits) {
            Ok(fields) => fields,
            Err(reason) => {
                return self.mark_bad_inreview(
                    review,
                    tip,
                    Some(tracker),
                    Some(id),
                    &reason.to_string(),
                )
            }
        };
        let diff = match self.diff_within_budget(&base_ref, tip)? {
            Some(diff) => diff,
            None => {
                let reason = format!(
                    "the diff is larger than the configured limit of {} bytes",
                    self.max_diff_bytes
                );
                return self.mark_bad_inreview(review, tip, Some(tracker), Some(id), &reason);
            }
        };

        let update_message = format!("update with new commits\n\n{}", fields.title);
        self.services
            .review
            .update_diff(id, &diff, &update_message)
            .change_context(Error::Review)
            .describe_lazy(|| format!("update review {id} for '{review}'"))?;

        let moved = tracker.with_status(TrackerStatus::Ok);
        self.publish_tracker(&moved, tip, Some(tracker))?;
        info!("updated review {id} for '{review}'");
        Ok(BranchOutcome::Updated(id))
    }

    /// The review is accepted: squash-land in the mandated order.
    fn land(
        &self,
        review: &ReviewBranchName,
        tip: &str,
        tracker: &TrackerBranchName,
        id: ReviewId,
    ) -> Result<BranchOutcome, Error> {
        let base_ref = self.remote_ref(&review.base);
        if self.git.rev_parse(&base_ref).is_err() {
            return report!(Error::MissingBase(review.base.clone()))
                .wrap_err()
                .describe_lazy(|| format!("while landing '{review}'"));
        }

        let info = self
            .services
            .review
            .query(id)
            .change_context(Error::Review)
            .describe_lazy(|| format!("query review {id} before landing '{review}'"))?;
        let commits = self
            .git
            .revisions_between(&base_ref, tip)
            .change_context(Error::Git)?;
        let author = commits
            .first()
            .map(Commit::author)
            .unwrap_or_else(|| "arcyd <arcyd@localhost>".to_owned());
        let message = landing_message(&info);

        // Local base mirrors the remote base exactly; fast-forward is then a
        // property of the push.
        self.git
            .checkout_forced_new_branch(&review.base, &base_ref)
            .change_context(Error::Git)?;

        if let Err(err) = self.git.squash_merge_into_head(tip, &message, &author) {
            if matches!(err.current_context(), git::Error::MergeConflict) {
                warn!("landing '{review}' hit merge conflicts");
                return self.land_failed(
                    review,
                    tip,
                    tracker,
                    id,
                    "the squash merge onto the base hit conflicts",
                );
            }
            return Err(err).change_context(Error::Git);
        }
        let land_hash = self
            .git
            .rev_parse("HEAD")
            .change_context(Error::Git)
            .describe("resolve the landing commit")?;

        if let Err(err) = self.git.push(&review.base, self.remote) {
            if matches!(err.current_context(), git::Error::PushRejected) {
                // Undo the local merge so the working copy mirrors the remote
                // again; nothing has been archived yet.
                let _ = self.git.reset_hard(&base_ref);
                warn!("push of landed '{review}' was rejected");
                return self.land_failed(
                    review,
                    tip,
                    tracker,
                    id,
                    "the push of the landed base branch was rejected",
                );
            }
            return Err(err).change_context(Error::Git);
        }

        // The base push is done: from here on, every failure must still end
        // in `bad_land`. Surfacing a plain error instead would leave the
        // tracker claiming an unlanded review, and the next cycle would
        // squash-merge the same review onto the base a second time.
        if let Err(err) = self.git.push_delete(&review.render(), self.remote) {
            warn!("deleting landed review branch '{review}' failed: {err:?}");
            return self.land_failed(
                review,
                tip,
                tracker,
                id,
                "the review branch could not be deleted after its content \
                 was pushed to the base; administrator attention is required",
            );
        }

        let landed = TrackerBranchName {
            status: TrackerStatus::Landed,
            description: review.description.clone(),
            base: review.base.clone(),
            review_id: Some(id),
        };
        if let Err(err) = self.publish_tracker(&landed, &land_hash, Some(tracker)) {
            warn!("publishing landed tracker for '{review}' failed: {err:?}");
            return self.land_failed(
                review,
                tip,
                tracker,
                id,
                "the tracker branch could not be moved to its landed name \
                 after the base was pushed; administrator attention is required",
            );
        }

        if let Err(err) = self.append_archive(
            LANDED_ARCHIVE_BRANCH,
            LANDED_ARCHIVE_REF,
            LANDED_ARCHIVE_MESSAGE,
            tip,
            &landed_archive_entry(review, &land_hash, &message),
        ) {
            warn!("archiving landed '{review}' failed: {err:?}");
            return self.land_failed(
                review,
                tip,
                tracker,
                id,
                "the landing could not be recorded on the archive branch \
                 after the base was pushed; administrator attention is required",
            );
        }

        // The service usually notices the land on its own; closing here just
        // makes it prompt. Failure is not worth failing the landing over.
        if let Err(err) = self.services.review.close(id) {
            warn!("failed to close landed review {id}: {err:?}");
        }

        info!("landed review {id} for '{review}' as {land_hash}");
        Ok(BranchOutcome::Landed(id))
    }

    /// A landing step failed: record `bad_land` and tell the review.
    fn land_failed(
        &self,
        review: &ReviewBranchName,
        tip: &str,
        tracker: &TrackerBranchName,
        id: ReviewId,
        reason: &str,
    ) -> Result<BranchOutcome, Error> {
        self.services
            .review
            .comment(id, &format!("arcyd could not land this review: {reason}"))
            .change_context(Error::Review)?;
        let bad = tracker.with_status(TrackerStatus::BadLand);
        self.publish_tracker(&bad, tip, Some(tracker))?;
        Ok(BranchOutcome::MarkedBad {
            review_id: Some(id),
            status: TrackerStatus::BadLand,
        })
    }

    /// The review branch is gone but its tracker remains.
    fn abandon(
        &self,
        tracker: &TrackerBranchName,
        tracker_hash: &str,
    ) -> Result<BranchOutcome, Error> {
        match tracker.status {
            // The branch was deleted by the landing protocol; the tracker is
            // the durable record of where it went.
            TrackerStatus::Landed => Ok(BranchOutcome::NoChange),

            // A crash between archiving and tracker deletion leaves this;
            // finish the cleanup.
            TrackerStatus::Abandoned => {
                self.git
                    .push_delete(&tracker.render(), self.remote)
                    .change_context(Error::Git)?;
                Ok(BranchOutcome::Abandoned(tracker.review_id))
            }

            _ => {
                if let Some(id) = tracker.review_id {
                    let status = self
                        .services
                        .review_states()
                        .get(id)
                        .change_context(Error::StatusCache)?;
                    if status.is_open() {
                        self.services
                            .review
                            .comment(
                                id,
                                "the review branch behind this review was deleted; \
                                 abandoning the review",
                            )
                            .change_context(Error::Review)?;
                        self.services
                            .review
                            .abandon(id)
                            .change_context(Error::Review)?;
                    }
                }

                let review = ReviewBranchName {
                    base: tracker.base.clone(),
                    description: tracker.description.clone(),
                };
                self.append_archive(
                    ABANDONED_ARCHIVE_BRANCH,
                    ABANDONED_ARCHIVE_REF,
                    ABANDONED_ARCHIVE_MESSAGE,
                    tracker_hash,
                    &abandoned_archive_entry(&review, tracker_hash),
                )?;
                self.git
                    .push_delete(&tracker.render(), self.remote)
                    .change_context(Error::Git)?;
                info!("abandoned '{review}'");
                Ok(BranchOutcome::Abandoned(tracker.review_id))
            }
        }
    }

    /// Record a branch as bad: comment on the review when one exists, and
    /// move the tracker to `bad_inreview` at the branch tip.
    fn mark_bad_inreview(
        &self,
        review: &ReviewBranchName,
        tip: &str,
        replacing: Option<&TrackerBranchName>,
        review_id: Option<ReviewId>,
        reason: &str,
    ) -> Result<BranchOutcome, Error> {
        warn!("marking '{review}' bad: {reason}");
        if let Some(id) = review_id {
            self.services
                .review
                .comment(id, &format!("arcyd cannot process this branch: {reason}"))
                .change_context(Error::Review)?;
        }
        let tracker = TrackerBranchName {
            status: TrackerStatus::BadInReview,
            description: review.description.clone(),
            base: review.base.clone(),
            review_id,
        };
        self.publish_tracker(&tracker, tip, replacing)?;
        Ok(BranchOutcome::MarkedBad {
            review_id,
            status: TrackerStatus::BadInReview,
        })
    }

    /// Push the tracker at `at`, retiring the name it replaces.
    ///
    /// A failed retirement is logged but tolerated: the new name is already
    /// live, and the stale name may legitimately be gone (a half-finished
    /// rename being completed). The next pass sees both names pair to the
    /// same branch and the later-sorting one wins.
    fn publish_tracker(
        &self,
        tracker: &TrackerBranchName,
        at: &str,
        replacing: Option<&TrackerBranchName>,
    ) -> Result<(), Error> {
        let remote_ref = format!("refs/heads/{}", tracker.render());
        self.git
            .push_asymmetric(at, &remote_ref, self.remote)
            .change_context(Error::Git)
            .describe_lazy(|| format!("publish tracker '{tracker}'"))?;
        if let Some(old) = replacing {
            if old.render() != tracker.render() {
                if let Err(err) = self.git.push_delete(&old.render(), self.remote) {
                    warn!("failed to retire tracker '{old}': {err:?}");
                }
            }
        }
        Ok(())
    }

    /// Fast-forward the local archive branch (orphan-create if missing) with
    /// an "ours" merge of `commit`, then publish it.
    fn append_archive(
        &self,
        local_branch: &str,
        remote_ref: &str,
        initial_message: &str,
        commit: &str,
        entry_message: &str,
    ) -> Result<(), Error> {
        if self.git.rev_parse(local_branch).is_err() {
            self.git.orphan_clean(local_branch).change_context(Error::Git)?;
            self.git
                .commit_allow_empty(initial_message)
                .change_context(Error::Git)?;
        } else {
            self.git.checkout(local_branch).change_context(Error::Git)?;
        }
        self.git
            .merge_ours(commit, entry_message)
            .change_context(Error::Git)
            .describe_lazy(|| format!("archive to '{local_branch}'"))?;
        self.git
            .push_asymmetric(local_branch, remote_ref, self.remote)
            .change_context(Error::Git)
            .describe_lazy(|| format!("publish archive '{remote_ref}'"))
    }

    /// Full diff if it fits the byte budget; reduced context, then
    /// filenames-only as fallbacks; `None` when even that is too large.
    fn diff_within_budget(&self, base_ref: &str, tip: &str) -> Result<Option<String>, Error> {
        for context in [FULL_DIFF_CONTEXT, 0] {
            let diff = self
                .git
                .diff_range(base_ref, tip, context)
                .change_context(Error::Git)?;
            let diff = text::to_unicode(&diff);
            if diff.len() as u64 <= self.max_diff_bytes {
                return Ok(Some(diff));
            }
        }
        let names = self
            .git
            .diff_range_names_only(base_ref, tip)
            .change_context(Error::Git)?;
        let names = text::to_unicode(&names);
        if names.len() as u64 <= self.max_diff_bytes {
            return Ok(Some(names));
        }
        Ok(None)
    }

    /// Resolve reviewer names through the identity cache.
    ///
    /// The outer error is infrastructure failure; the inner `Err` carries the
    /// first unknown username, which is the author's problem, not ours.
    fn resolve_reviewers(
        &self,
        names: &[String],
    ) -> Result<std::result::Result<Vec<UserId>, String>, Error> {
        let mut users = self.services.users();
        for name in names {
            users.hint(name);
        }
        let mut ids = Vec::with_capacity(names.len());
        for name in names {
            match users.id_for_username(name) {
                Ok(id) => ids.push(id),
                Err(err) => {
                    if matches!(err.current_context(), identity::Error::UnknownUsername(_)) {
                        return Ok(Err(name.clone()));
                    }
                    return Err(err).change_context(Error::Identity);
                }
            }
        }
        Ok(Ok(ids))
    }
}

/// The squash-commit message for a landing, derived from the review object.
fn landing_message(info: &crate::api::review::ReviewInfo) -> String {
    let mut message = info.title.clone();
    if !info.summary.is_empty() {
        message.push_str("\n\n");
        message.push_str(&info.summary);
    }
    if !info.reviewers.is_empty() {
        message.push_str("\n\nReviewed-by: ");
        message.push_str(&info.reviewers.join(", "));
    }
    if let Some(uri) = &info.uri {
        message.push_str("\nDifferential Revision: ");
        message.push_str(uri);
    }
    text::lossy_unicode_to_ascii(&message)
}

/// The "ours" merge message recording one landing in the archive.
fn landed_archive_entry(review: &ReviewBranchName, land_hash: &str, message: &str) -> String {
    format!(
        "landed {} on {} as {}\n\nwith message:\n{}",
        review.render(),
        review.base,
        land_hash,
        message,
    )
}

/// The "ours" merge message recording one abandonment in the archive.
fn abandoned_archive_entry(review: &ReviewBranchName, last_hash: &str) -> String {
    format!(
        "abandoned {} on {} as {}",
        review.render(),
        review.base,
        last_hash,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::review::ReviewInfo;

    #[test]
    fn landed_archive_message_is_stable() {
        assert!(LANDED_ARCHIVE_MESSAGE.starts_with(
            "Create an archive branch for landed branches\n\nLanded branches will be \
             automatically merged here by Arcyd for your reference.\n\nThis branch is useful for:"
        ));
    }

    #[test]
    fn abandoned_archive_message_is_stable() {
        assert!(ABANDONED_ARCHIVE_MESSAGE.starts_with(
            "Create an archive branch for abandoned branches\n\nAbandoned branches will be \
             automatically merged here by Arcyd for your reference.\n\nThis branch is useful for:"
        ));
    }

    #[test]
    fn landed_entry_format() {
        let review = ReviewBranchName {
            base: "master".to_owned(),
            description: "feature-1".to_owned(),
        };
        let entry = landed_archive_entry(&review, "abc123", "Title\n\nbody");
        assert!(entry.starts_with("landed r/master/feature-1 on master as abc123\n\nwith message:\nTitle"));
    }

    #[test]
    fn landing_message_composition() {
        let info = ReviewInfo {
            id: 4,
            status: crate::api::review::ReviewStatus::Accepted,
            title: "Title".to_owned(),
            summary: "A summary.".to_owned(),
            reviewers: vec!["alice".to_owned(), "bob".to_owned()],
            uri: Some("http://phab.example.com/D4".to_owned()),
        };
        let message = landing_message(&info);
        assert_eq!(
            message,
            "Title\n\nA summary.\n\nReviewed-by: alice, bob\nDifferential Revision: http://phab.example.com/D4"
        );
    }

    #[test]
    fn landing_message_without_extras() {
        let info = ReviewInfo {
            id: 4,
            status: crate::api::review::ReviewStatus::Accepted,
            title: "Title".to_owned(),
            summary: String::new(),
            reviewers: Vec::new(),
            uri: None,
        };
        assert_eq!(landing_message(&info), "Title");
    }
}
