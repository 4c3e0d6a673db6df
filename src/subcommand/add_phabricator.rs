//! Implementation for the `add-phabricator` subcommand.

use error_stack::{Result, ResultExt};
use tracing::info;

use crate::config::DataRoot;
use crate::fsutil;

/// Errors encountered while adding a review-service instance.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Writing the instance config failed.
    #[error("write phabricator config")]
    Write,
}

/// Record a review-service instance under `phabricators/<name>.yaml`.
pub fn main(
    root: &DataRoot,
    name: &str,
    instance_uri: &str,
    api_token: &str,
    review_url_format: Option<&str>,
) -> Result<(), Error> {
    let mut content = format!(
        "instance_uri: {instance_uri:?}\napi_token: {api_token:?}\n"
    );
    if let Some(format) = review_url_format {
        content.push_str(&format!("review_url_format: {format:?}\n"));
    }

    let path = root.phabricators_dir().join(format!("{name}.yaml"));
    fsutil::with_config_lock(root.path(), || fsutil::atomic_write(&path, content.as_bytes()))
        .change_context(Error::Write)?;
    info!("added phabricator '{name}'");
    Ok(())
}
