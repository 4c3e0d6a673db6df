//! Batched cache of review statuses.
//!
//! Branch processing asks for review statuses one at a time, but the review
//! service answers much more cheaply in batches. The cache records which
//! reviews were touched this cycle (the "active set") and refreshes all of
//! them in a single round trip between cycles.

use std::collections::{BTreeMap, BTreeSet};

use error_stack::{report, Result, ResultExt};

use crate::api::review::{self, ReviewId, ReviewStatus};
use crate::ext::result::WrapErr;

/// Errors surfaced by the cache.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The cache was queried before a status lister was installed.
    #[error("no status lister installed")]
    NoLister,

    /// The underlying batch query failed.
    #[error("query review statuses")]
    Query,
}

/// Answers batched status queries; installed into the cache by the engine.
pub trait StatusLister: Send {
    /// Fetch the statuses of the given reviews in one round trip.
    fn list_statuses(
        &self,
        ids: &[ReviewId],
    ) -> Result<Vec<(ReviewId, ReviewStatus)>, review::Error>;
}

impl StatusLister for std::sync::Arc<dyn crate::api::review::ReviewClient> {
    fn list_statuses(
        &self,
        ids: &[ReviewId],
    ) -> Result<Vec<(ReviewId, ReviewStatus)>, review::Error> {
        self.query_statuses(ids)
    }
}

/// See the module docs.
pub struct ReviewStateCache {
    lister: Option<Box<dyn StatusLister>>,
    statuses: BTreeMap<ReviewId, ReviewStatus>,
    active: BTreeSet<ReviewId>,
}

impl Default for ReviewStateCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ReviewStateCache {
    /// Create an empty cache with no lister installed.
    pub fn new() -> Self {
        Self {
            lister: None,
            statuses: BTreeMap::new(),
            active: BTreeSet::new(),
        }
    }

    /// Install the status lister the cache queries through.
    pub fn set_lister(&mut self, lister: Box<dyn StatusLister>) {
        self.lister = Some(lister);
    }

    /// The status of one review, fetching on miss. Records the review in the
    /// active set either way.
    pub fn get(&mut self, id: ReviewId) -> Result<ReviewStatus, Error> {
        self.active.insert(id);
        if let Some(&status) = self.statuses.get(&id) {
            return Ok(status);
        }

        let lister = match &self.lister {
            Some(lister) => lister,
            None => return report!(Error::NoLister).wrap_err(),
        };
        let fetched = lister
            .list_statuses(&[id])
            .change_context(Error::Query)?;
        for (id, status) in fetched {
            self.statuses.insert(id, status);
        }
        self.statuses
            .get(&id)
            .copied()
            .ok_or_else(|| report!(Error::Query))
    }

    /// Re-query every active review in one batch, replace the stored map with
    /// the fresh snapshot, and clear the active set.
    ///
    /// With an empty active set this is a no-op and makes no service call.
    pub fn refresh_active(&mut self) -> Result<(), Error> {
        if self.active.is_empty() {
            return Ok(());
        }
        let lister = match &self.lister {
            Some(lister) => lister,
            None => return report!(Error::NoLister).wrap_err(),
        };

        let ids: Vec<ReviewId> = self.active.iter().copied().collect();
        let fetched = lister
            .list_statuses(&ids)
            .change_context(Error::Query)?;

        // Replace rather than merge: entries absent from the snapshot belong
        // to reviews nothing looked at, and stale entries must not survive.
        self.statuses = fetched.into_iter().collect();
        self.active.clear();
        Ok(())
    }

    /// The reviews looked at since the last refresh.
    pub fn active_reviews(&self) -> Vec<ReviewId> {
        self.active.iter().copied().collect()
    }
}

impl std::fmt::Debug for ReviewStateCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReviewStateCache")
            .field("statuses", &self.statuses)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    struct RecordingLister {
        calls: Arc<AtomicUsize>,
        queried: Arc<Mutex<Vec<Vec<ReviewId>>>>,
        status: ReviewStatus,
    }

    impl StatusLister for RecordingLister {
        fn list_statuses(
            &self,
            ids: &[ReviewId],
        ) -> Result<Vec<(ReviewId, ReviewStatus)>, review::Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.queried.lock().expect("lock").push(ids.to_vec());
            Ok(ids.iter().map(|&id| (id, self.status)).collect())
        }
    }

    fn cache_with_lister(
        status: ReviewStatus,
    ) -> (ReviewStateCache, Arc<AtomicUsize>, Arc<Mutex<Vec<Vec<ReviewId>>>>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let queried = Arc::new(Mutex::new(Vec::new()));
        let mut cache = ReviewStateCache::new();
        cache.set_lister(Box::new(RecordingLister {
            calls: Arc::clone(&calls),
            queried: Arc::clone(&queried),
            status,
        }));
        (cache, calls, queried)
    }

    #[test]
    fn query_without_lister_is_an_error() {
        let mut cache = ReviewStateCache::new();
        assert!(cache.get(1).is_err());
    }

    #[test]
    fn get_fetches_on_miss_and_caches() {
        let (mut cache, calls, _) = cache_with_lister(ReviewStatus::NeedsReview);
        assert_eq!(cache.get(7).expect("status"), ReviewStatus::NeedsReview);
        assert_eq!(cache.get(7).expect("status"), ReviewStatus::NeedsReview);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn refresh_batches_the_active_set() {
        let (mut cache, calls, queried) = cache_with_lister(ReviewStatus::Accepted);
        let _ = cache.get(1);
        let _ = cache.get(2);
        let _ = cache.get(3);
        calls.store(0, Ordering::SeqCst);

        cache.refresh_active().expect("refresh");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let batches = queried.lock().expect("lock");
        assert_eq!(batches.last().expect("batch"), &vec![1, 2, 3]);
    }

    #[test]
    fn refresh_with_empty_active_set_makes_no_call() {
        let (mut cache, calls, _) = cache_with_lister(ReviewStatus::Accepted);
        cache.refresh_active().expect("refresh");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn refresh_clears_the_active_set() {
        let (mut cache, _, _) = cache_with_lister(ReviewStatus::Accepted);
        let _ = cache.get(5);
        cache.refresh_active().expect("refresh");
        assert!(cache.active_reviews().is_empty());
    }
}
