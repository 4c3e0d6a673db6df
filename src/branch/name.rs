//! The branch naming scheme that carries review state through the remote.
//!
//! Review branches are pushed by humans as `r/<base>/<description>`. For each
//! one the daemon maintains a tracker branch
//! `dev/arcyd/<status>/<description>/<base>/<review-id-or-none>` whose name
//! alone encodes where the review stands, so a fresh daemon can recover all
//! state from `ls-remote` output.
//!
//! Bases are single path segments; descriptions may contain `/`. Tracker
//! names are therefore parsed from both ends: status from the front, base and
//! review id from the back, description as whatever remains.

use strum::{Display, EnumIter, EnumString};

use crate::api::review::ReviewId;

/// Prefix humans use to propose a review.
pub const REVIEW_BRANCH_PREFIX: &str = "r/";

/// Prefix of daemon-managed tracker branches.
pub const TRACKER_BRANCH_PREFIX: &str = "dev/arcyd/";

/// Local name of the landed-review archive branch.
pub const LANDED_ARCHIVE_BRANCH: &str = "__private_arcyd/landed";

/// Local name of the abandoned-review archive branch.
pub const ABANDONED_ARCHIVE_BRANCH: &str = "__private_arcyd/abandoned";

/// Remote ref of the landed-review archive.
pub const LANDED_ARCHIVE_REF: &str = "refs/arcyd/landed";

/// Remote ref of the abandoned-review archive.
pub const ABANDONED_ARCHIVE_REF: &str = "refs/arcyd/abandoned";

/// Placeholder for a tracker with no review object yet.
const NO_REVIEW_ID: &str = "none";

/// Review progress as encoded in a tracker branch name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, EnumIter)]
pub enum TrackerStatus {
    /// Review object freshly created at this tip.
    #[strum(serialize = "ok_new")]
    OkNew,

    /// Review object in sync with the branch tip.
    #[strum(serialize = "ok")]
    Ok,

    /// The branch content is known invalid (bad message, oversize diff).
    #[strum(serialize = "bad_inreview")]
    BadInReview,

    /// An attempt to land the review failed.
    #[strum(serialize = "bad_land")]
    BadLand,

    /// The review branch disappeared while the review was open.
    #[strum(serialize = "abandoned")]
    Abandoned,

    /// Landed and archived. Terminal.
    #[strum(serialize = "landed")]
    Landed,
}

impl TrackerStatus {
    /// Whether the daemon must never touch this review again.
    pub fn is_terminal(self) -> bool {
        matches!(self, TrackerStatus::Landed)
    }

    /// Whether the branch content is currently considered bad.
    pub fn is_bad(self) -> bool {
        matches!(self, TrackerStatus::BadInReview | TrackerStatus::BadLand)
    }
}

/// A parsed `r/<base>/<description>` branch name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReviewBranchName {
    /// The branch this proposal wants to land on. Single path segment.
    pub base: String,

    /// Human-chosen description. May contain `/`.
    pub description: String,
}

impl ReviewBranchName {
    /// Parse a short branch name, returning `None` when it does not follow
    /// the review naming scheme.
    pub fn parse(branch: &str) -> Option<Self> {
        let rest = branch.strip_prefix(REVIEW_BRANCH_PREFIX)?;
        let (base, description) = rest.split_once('/')?;
        if base.is_empty() || description.is_empty() {
            return None;
        }
        Some(Self {
            base: base.to_owned(),
            description: description.to_owned(),
        })
    }

    /// Render back to the branch name.
    pub fn render(&self) -> String {
        format!("{REVIEW_BRANCH_PREFIX}{}/{}", self.base, self.description)
    }
}

impl std::fmt::Display for ReviewBranchName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

/// A parsed `dev/arcyd/<status>/<description>/<base>/<review-id-or-none>`
/// tracker branch name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerBranchName {
    /// Encoded review progress.
    pub status: TrackerStatus,

    /// Description, matching the review branch. May contain `/`.
    pub description: String,

    /// Base branch, matching the review branch. Single path segment.
    pub base: String,

    /// The review object id, absent when creation has not succeeded yet.
    pub review_id: Option<ReviewId>,
}

impl TrackerBranchName {
    /// Parse a short branch name, returning `None` when it does not follow
    /// the tracker naming scheme.
    pub fn parse(branch: &str) -> Option<Self> {
        let rest = branch.strip_prefix(TRACKER_BRANCH_PREFIX)?;
        let (status, rest) = rest.split_once('/')?;
        let status: TrackerStatus = status.parse().ok()?;

        let (rest, review_id) = rest.rsplit_once('/')?;
        let review_id = if review_id == NO_REVIEW_ID {
            None
        } else {
            Some(review_id.parse::<ReviewId>().ok()?)
        };

        let (description, base) = rest.rsplit_once('/')?;
        if description.is_empty() || base.is_empty() || base.contains('/') {
            return None;
        }
        Some(Self {
            status,
            description: description.to_owned(),
            base: base.to_owned(),
            review_id,
        })
    }

    /// Render back to the branch name.
    pub fn render(&self) -> String {
        let review_id = match self.review_id {
            Some(id) => id.to_string(),
            None => NO_REVIEW_ID.to_owned(),
        };
        format!(
            "{TRACKER_BRANCH_PREFIX}{}/{}/{}/{review_id}",
            self.status, self.description, self.base,
        )
    }

    /// This tracker renamed to a different status.
    pub fn with_status(&self, status: TrackerStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }

    /// This tracker renamed to carry a review id.
    pub fn with_review_id(&self, review_id: ReviewId) -> Self {
        Self {
            review_id: Some(review_id),
            ..self.clone()
        }
    }
}

impl std::fmt::Display for TrackerBranchName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

/// A review branch and its tracker, paired by (base, description).
///
/// Either side may be absent: review-only is a fresh proposal, tracker-only
/// is a zombie left behind by a deleted review branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedBranch {
    /// The review branch and its tip hash, when present on the remote.
    pub review: Option<(ReviewBranchName, String)>,

    /// The tracker branch and its tip hash, when present on the remote.
    pub tracker: Option<(TrackerBranchName, String)>,
}

impl ManagedBranch {
    /// The (base, description) key both sides share.
    pub fn key(&self) -> (String, String) {
        if let Some((review, _)) = &self.review {
            (review.base.clone(), review.description.clone())
        } else if let Some((tracker, _)) = &self.tracker {
            (tracker.base.clone(), tracker.description.clone())
        } else {
            (String::new(), String::new())
        }
    }
}

/// Pair up review and tracker branches from a branch→hash map.
///
/// `branches` holds short branch names as they exist on the remote.
pub fn managed_branches<'a>(
    branches: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> Vec<ManagedBranch> {
    let mut paired: std::collections::BTreeMap<(String, String), ManagedBranch> =
        std::collections::BTreeMap::new();

    for (branch, hash) in branches {
        if let Some(review) = ReviewBranchName::parse(branch) {
            let key = (review.base.clone(), review.description.clone());
            paired
                .entry(key)
                .or_insert_with(|| ManagedBranch {
                    review: None,
                    tracker: None,
                })
                .review = Some((review, hash.to_owned()));
        } else if let Some(tracker) = TrackerBranchName::parse(branch) {
            let key = (tracker.base.clone(), tracker.description.clone());
            paired
                .entry(key)
                .or_insert_with(|| ManagedBranch {
                    review: None,
                    tracker: None,
                })
                .tracker = Some((tracker, hash.to_owned()));
        }
    }

    paired.into_values().collect()
}
