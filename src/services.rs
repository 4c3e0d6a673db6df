//! The aggregate of shared resources threaded through the engine.
//!
//! There is deliberately no global state: the scheduler owns one `Services`
//! value and hands clones to each per-repo worker. The caches are shared and
//! locked; per-repo serialization in the pool keeps contention trivial.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::api::review::ReviewClient;
use crate::cache::identity::UserCache;
use crate::cache::review_state::ReviewStateCache;
use crate::reporter::Reporter;
use crate::watcher::UrlWatcher;

/// Shared engine resources. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Services {
    /// The review service client.
    pub review: Arc<dyn ReviewClient>,

    /// Batched review-status cache.
    pub review_states: Arc<Mutex<ReviewStateCache>>,

    /// Username ↔ identifier cache.
    pub users: Arc<Mutex<UserCache>>,

    /// Snoop-URL change detector.
    pub watcher: Arc<Mutex<UrlWatcher>>,

    /// Status collection and the JSON snapshot.
    pub reporter: Reporter,
}

impl Services {
    /// Lock the review-state cache, recovering from poisoning.
    pub fn review_states(&self) -> MutexGuard<'_, ReviewStateCache> {
        lock(&self.review_states)
    }

    /// Lock the identity cache, recovering from poisoning.
    pub fn users(&self) -> MutexGuard<'_, UserCache> {
        lock(&self.users)
    }

    /// Lock the url watcher, recovering from poisoning.
    pub fn watcher(&self) -> MutexGuard<'_, UrlWatcher> {
        lock(&self.watcher)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services").finish_non_exhaustive()
    }
}
