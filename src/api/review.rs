//! The interface the engine consumes from the external code-review service.
//!
//! Everything above this trait treats a review as an opaque object addressed
//! by an integer id. The concrete transport lives in [`crate::api::conduit`];
//! tests substitute in-memory fakes.

use error_stack::Result;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// A review object's identifier on the external service.
pub type ReviewId = u64;

/// A user's opaque identifier on the external service.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    derive_more::Display,
)]
pub struct UserId(pub String);

/// Lifecycle status of a review object.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    /// Waiting on reviewers.
    NeedsReview,

    /// Reviewers asked for changes.
    NeedsRevision,

    /// Approved; the branch may land.
    Accepted,

    /// Closed after landing.
    Closed,

    /// Explicitly given up on.
    Abandoned,
}

impl ReviewStatus {
    /// Whether the review still has a live branch behind it.
    pub fn is_open(self) -> bool {
        !matches!(self, ReviewStatus::Closed | ReviewStatus::Abandoned)
    }
}

/// A directory entry for a user of the review service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    /// Login name.
    pub username: String,

    /// Service identifier.
    pub id: UserId,

    /// Primary email, when the service exposes it.
    pub email: Option<String>,
}

/// Fields for creating a review object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateReview {
    /// One-line title.
    pub title: String,

    /// Longer prose description; may be empty.
    pub summary: String,

    /// The author's stated test plan.
    pub test_plan: String,

    /// Resolved reviewer identifiers.
    pub reviewers: Vec<UserId>,

    /// Unified diff content.
    pub diff: String,
}

/// A snapshot of a review object as the service reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewInfo {
    /// The review's identifier.
    pub id: ReviewId,

    /// Current lifecycle status.
    pub status: ReviewStatus,

    /// Current title.
    pub title: String,

    /// Current summary.
    pub summary: String,

    /// Reviewer login names.
    pub reviewers: Vec<String>,

    /// Browse URL, when the service reports one.
    pub uri: Option<String>,
}

/// Errors surfaced by review-service calls.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The transport failed (connection refused, timeout, 5xx).
    #[error("review service transport")]
    Transport,

    /// The service rejected the call.
    #[error("review service rejected call: {0}")]
    Api(String),

    /// A queried review does not exist.
    #[error("no such review: {0}")]
    NoSuchReview(ReviewId),

    /// One or more usernames are unknown to the service.
    #[error("unknown usernames: {}", .0.join(", "))]
    UnknownUsernames(Vec<String>),

    /// An email address is unknown to the service.
    #[error("unknown email: {0}")]
    UnknownEmail(String),

    /// A user identifier is unknown to the service.
    #[error("unknown user id: {0}")]
    UnknownUserId(UserId),
}

/// Operations the engine performs against review objects.
pub trait ReviewClient: Send + Sync {
    /// Create a review and return its id.
    fn create_review(&self, fields: &CreateReview) -> Result<ReviewId, Error>;

    /// Replace the review's diff, annotated with an update message.
    fn update_diff(&self, id: ReviewId, diff: &str, message: &str) -> Result<(), Error>;

    /// Post a comment.
    fn comment(&self, id: ReviewId, body: &str) -> Result<(), Error>;

    /// Close an accepted review after its branch landed.
    fn close(&self, id: ReviewId) -> Result<(), Error>;

    /// Abandon a review whose branch disappeared.
    fn abandon(&self, id: ReviewId) -> Result<(), Error>;

    /// Fetch the full current state of one review.
    fn query(&self, id: ReviewId) -> Result<ReviewInfo, Error>;

    /// Fetch the statuses of many reviews in one round trip.
    fn query_statuses(&self, ids: &[ReviewId]) -> Result<Vec<(ReviewId, ReviewStatus)>, Error>;
}

/// User lookup operations, kept separate from review manipulation so the
/// identity cache can depend on exactly what it needs.
pub trait UserDirectory: Send + Sync {
    /// Resolve login names to directory records.
    ///
    /// When any requested name is unknown the service rejects the whole
    /// batch; that surfaces as [`Error::UnknownUsernames`].
    fn query_users_by_name(&self, usernames: &[String]) -> Result<Vec<UserRecord>, Error>;

    /// Resolve service identifiers to directory records.
    fn query_users_by_id(&self, ids: &[UserId]) -> Result<Vec<UserRecord>, Error>;

    /// Resolve email addresses to directory records.
    fn query_users_by_email(&self, emails: &[String]) -> Result<Vec<UserRecord>, Error>;
}
