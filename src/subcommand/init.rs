//! Implementation for the `init` subcommand.

use error_stack::{Result, ResultExt};
use tracing::info;

use crate::config::DataRoot;
use crate::ext::error_stack::{DescribeContext, IntoContext};
use crate::fsutil;

/// Errors encountered while initializing a data root.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Creating the directory layout failed.
    #[error("create data root layout")]
    CreateLayout,
}

/// Create the data-root layout and a default engine config.
pub fn main(root: &DataRoot) -> Result<(), Error> {
    for dir in [
        root.phabricators_dir(),
        root.repohosts_dir(),
        root.repositories_dir(),
        root.working_copies_dir(),
        root.log_dir(),
    ] {
        std::fs::create_dir_all(&dir)
            .context(Error::CreateLayout)
            .describe_lazy(|| format!("create '{}'", dir.display()))?;
    }

    if !root.config_file().exists() {
        let default_config = "# arcyd engine tuning; all fields optional.\n\
                              # sleep_interval: 60s\n\
                              # max_workers: 8\n\
                              # max_diff_size: 1mib\n";
        fsutil::atomic_write(&root.config_file(), default_config.as_bytes())
            .change_context(Error::CreateLayout)?;
    }

    info!("initialized data root at '{}'", root.path().display());
    Ok(())
}
