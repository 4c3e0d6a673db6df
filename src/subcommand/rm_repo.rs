//! Implementation for the `rm-repo` subcommand.

use error_stack::{report, Result, ResultExt};
use tracing::info;

use crate::config::DataRoot;
use crate::ext::error_stack::{DescribeContext, IntoContext};
use crate::ext::result::WrapErr;
use crate::fsutil;

/// Errors encountered while removing a repository.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The repository is not configured.
    #[error("no such repository: {0}")]
    NoSuchRepo(String),

    /// Removing the config or working copy failed.
    #[error("remove repository state")]
    Remove,
}

/// Remove a repository's config and working copy.
pub fn main(root: &DataRoot, name: &str) -> Result<(), Error> {
    let config_path = root.repositories_dir().join(format!("{name}.yaml"));
    if !config_path.exists() {
        return report!(Error::NoSuchRepo(name.to_owned())).wrap_err();
    }

    fsutil::with_config_lock(root.path(), || {
        std::fs::remove_file(&config_path).map_err(|err| {
            error_stack::Report::new(fsutil::Error::IO)
                .attach_printable(format!("remove '{}': {err}", config_path.display()))
        })
    })
    .change_context(Error::Remove)?;

    let working_copy = root.working_copy(name);
    if working_copy.exists() {
        std::fs::remove_dir_all(&working_copy)
            .context(Error::Remove)
            .describe_lazy(|| format!("remove working copy '{}'", working_copy.display()))?;
    }

    info!("removed repository '{name}'");
    Ok(())
}
