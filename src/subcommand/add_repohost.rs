//! Implementation for the `add-repohost` subcommand.

use error_stack::{Result, ResultExt};
use tracing::info;

use crate::config::DataRoot;
use crate::fsutil;

/// Errors encountered while adding a repository host.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Writing the host config failed.
    #[error("write repohost config")]
    Write,
}

/// Record a repository host under `repohosts/<name>.yaml`.
pub fn main(
    root: &DataRoot,
    name: &str,
    clone_url_format: &str,
    snoop_url_format: Option<&str>,
    admin_emails: &[String],
) -> Result<(), Error> {
    let mut content = format!("clone_url_format: {clone_url_format:?}\n");
    if let Some(format) = snoop_url_format {
        content.push_str(&format!("snoop_url_format: {format:?}\n"));
    }
    if !admin_emails.is_empty() {
        content.push_str("admin_emails:\n");
        for email in admin_emails {
            content.push_str(&format!("  - {email:?}\n"));
        }
    }

    let path = root.repohosts_dir().join(format!("{name}.yaml"));
    fsutil::with_config_lock(root.path(), || fsutil::atomic_write(&path, content.as_bytes()))
        .change_context(Error::Write)?;
    info!("added repohost '{name}'");
    Ok(())
}
