//! Implementation for the `fsck` subcommand.

use std::sync::Arc;

use error_stack::{report, Result, ResultExt};
use tracing::{info, warn};

use crate::config::{self, DataRoot};
use crate::ext::result::WrapErr;
use crate::fsutil;
use crate::git::{GitDriver, NullSink};

/// Errors encountered while checking the data root.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The configuration did not load.
    #[error("load configuration")]
    LoadConfig,

    /// Problems were found and not (or could not be) fixed.
    #[error("{0} problem(s) found")]
    ProblemsFound(usize),

    /// Repairing a problem failed.
    #[error("repair problem")]
    Repair,
}

/// Verify the data root: layout, configs, working copies. With `fix`,
/// re-clone missing working copies.
pub fn main(root: &DataRoot, fix: bool) -> Result<(), Error> {
    // Parsing every config file is most of the check.
    let config = config::load(root).change_context(Error::LoadConfig)?;

    let mut problems = 0usize;
    fsutil::with_config_lock(root.path(), || {
        for repo in config.repositories().iter() {
            let working_copy = repo.working_copy();
            let looks_like_git = working_copy.join(".git").exists();
            if looks_like_git {
                continue;
            }
            if !fix {
                warn!(
                    "working copy for '{}' is missing or not a git repository: '{}'",
                    repo.name(),
                    working_copy.display()
                );
                problems += 1;
                continue;
            }
            info!("re-cloning working copy for '{}'", repo.name());
            if working_copy.exists() {
                if let Err(err) = std::fs::remove_dir_all(working_copy) {
                    warn!("failed to remove broken working copy: {err}");
                    problems += 1;
                    continue;
                }
            }
            if let Err(err) =
                GitDriver::clone_into(repo.clone_url(), working_copy, Arc::new(NullSink))
            {
                warn!("failed to re-clone '{}': {err:?}", repo.name());
                problems += 1;
            }
        }
        Ok(())
    })
    .change_context(Error::Repair)?;

    if problems > 0 {
        return report!(Error::ProblemsFound(problems)).wrap_err();
    }
    info!("fsck found no problems");
    Ok(())
}
