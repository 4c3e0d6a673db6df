//! Interactions and data types for the arcyd config live here.

use error_stack::{Result, ResultExt};

// Keep `config` opaque externally, only export what is required for callers.
mod args;
mod file;

pub use args::{DataRoot, RawDataRootArgs};
pub use file::{
    Config, EngineConfig, LeaderElectionConfig, PhabricatorConfig, RepoDescriptor, Repositories,
};

/// Errors that are possibly surfaced during validation of config values.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The data-root argument did not validate.
    #[error("validate command line arguments")]
    ValidateArgs,

    /// The on-disk configuration did not load.
    #[error("load configuration from the data root")]
    LoadConfig,
}

/// Validate the args provided by the user, requiring an initialized data root.
pub fn validate_args(provided: RawDataRootArgs) -> Result<DataRoot, Error> {
    provided.validate().change_context(Error::ValidateArgs)
}

/// Validate the args for `init`, which creates the data root itself.
pub fn validate_init_args(provided: RawDataRootArgs) -> Result<DataRoot, Error> {
    provided.validate_init().change_context(Error::ValidateArgs)
}

/// Load the full configuration for the application.
pub fn load(root: &DataRoot) -> Result<Config, Error> {
    Config::load(root).change_context(Error::LoadConfig)
}
