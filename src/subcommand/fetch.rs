//! Implementation for the `fetch` subcommand.

use std::sync::Arc;

use error_stack::{report, Result, ResultExt};
use tracing::{info, warn};

use crate::config::Config;
use crate::ext::result::WrapErr;
use crate::git::{GitDriver, NullSink};

/// Errors encountered while fetching.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Some repositories failed to fetch.
    #[error("{0} repositories failed to fetch")]
    FetchFailures(usize),
}

/// One-shot fetch of every configured repository, outside the engine loop.
pub fn main(config: &Config) -> Result<(), Error> {
    let mut failures = 0usize;
    for repo in config.repositories().iter() {
        info!("fetching '{}'", repo.name());
        let git = GitDriver::new(repo.working_copy().clone(), Arc::new(NullSink));
        let heads = format!("+refs/heads/*:refs/remotes/{}/*", repo.remote());
        let archives = "+refs/arcyd/*:refs/heads/__private_arcyd/*";
        let fetched = git
            .checkout("master")
            .and_then(|_| git.fetch_prune(repo.remote(), &[&heads, archives]));
        if let Err(err) = fetched {
            warn!("fetch of '{}' failed: {err:?}", repo.name());
            failures += 1;
        }
    }
    if failures > 0 {
        return report!(Error::FetchFailures(failures)).wrap_err();
    }
    Ok(())
}
