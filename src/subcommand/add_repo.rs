//! Implementation for the `add-repo` subcommand.

use std::sync::Arc;

use error_stack::{report, Result, ResultExt};
use tracing::info;

use crate::config::{self, DataRoot};
use crate::ext::error_stack::{DescribeContext, ErrorHelper};
use crate::ext::result::WrapErr;
use crate::fsutil;
use crate::git::{GitDriver, NullSink};

/// Errors encountered while adding a repository.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Writing the repository config failed.
    #[error("write repository config")]
    Write,

    /// The resulting configuration did not validate.
    #[error("validate updated configuration")]
    Validate,

    /// Cloning the working copy failed.
    #[error("clone working copy")]
    Clone,
}

/// Record a repository under `repositories/<name>.yaml` and clone its
/// working copy.
#[allow(clippy::too_many_arguments)]
pub fn main(
    root: &DataRoot,
    name: &str,
    phabricator: &str,
    repohost: &str,
    human_name: Option<&str>,
    snoop_url: Option<&str>,
    remote: Option<&str>,
    admin_emails: &[String],
) -> Result<(), Error> {
    let path = root.repositories_dir().join(format!("{name}.yaml"));
    if path.exists() {
        return report!(Error::Write)
            .wrap_err()
            .describe_lazy(|| format!("repository '{name}' already exists"))
            .help("remove it first with 'arcyd rm-repo'");
    }

    let mut content = format!("phabricator: {phabricator:?}\nrepohost: {repohost:?}\n");
    if let Some(human_name) = human_name {
        content.push_str(&format!("human_name: {human_name:?}\n"));
    }
    if let Some(snoop_url) = snoop_url {
        content.push_str(&format!("snoop_url: {snoop_url:?}\n"));
    }
    if let Some(remote) = remote {
        content.push_str(&format!("remote: {remote:?}\n"));
    }
    if !admin_emails.is_empty() {
        content.push_str("admin_emails:\n");
        for email in admin_emails {
            content.push_str(&format!("  - {email:?}\n"));
        }
    }

    fsutil::with_config_lock(root.path(), || fsutil::atomic_write(&path, content.as_bytes()))
        .change_context(Error::Write)?;

    // Re-validate the whole config so a bad reference is caught now, and so
    // we learn the computed clone URL.
    let validated = match config::load(root) {
        Ok(validated) => validated,
        Err(err) => {
            let _ = std::fs::remove_file(&path);
            return Err(err).change_context(Error::Validate);
        }
    };
    let repo = validated
        .repositories()
        .iter()
        .find(|repo| repo.name() == name)
        .ok_or_else(|| report!(Error::Validate))?;

    if !repo.working_copy().exists() {
        info!("cloning '{}' into '{}'", repo.clone_url(), repo.working_copy().display());
        GitDriver::clone_into(repo.clone_url(), repo.working_copy(), Arc::new(NullSink))
            .change_context(Error::Clone)?;
    }

    info!("added repository '{name}'");
    Ok(())
}
