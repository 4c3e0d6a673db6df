//! Implementation for the `start` subcommand.

use std::sync::{Arc, Mutex};

use error_stack::{Result, ResultExt};
use secrecy::ExposeSecret;
use secrecy::Secret;
use tracing::{debug, info};

use crate::api::conduit::ConduitClient;
use crate::api::review::ReviewClient;
use crate::cache::identity::UserCache;
use crate::cache::review_state::ReviewStateCache;
use crate::config::{Config, DataRoot};
use crate::ext::error_stack::{DescribeContext, ErrorHelper};
use crate::guard::InstanceGuard;
use crate::leader;
use crate::mailer::LoggingMailer;
use crate::reporter::Reporter;
use crate::scheduler::{EngineExit, Scheduler};
use crate::services::Services;
use crate::watcher::{HttpProbe, UrlWatcher};

/// Errors encountered while starting the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Another instance holds the data root.
    #[error("another instance is already running")]
    InstanceLock,

    /// Building service clients failed.
    #[error("construct service clients")]
    BuildServices,

    /// Leader election failed.
    #[error("contend for leadership")]
    LeaderElection,

    /// Recording this instance failed.
    #[error("record running instance")]
    RecordInstance,
}

/// Start the engine. Returns the engine's exit disposition.
pub fn main(root: &DataRoot, config: Config, foreground: bool, no_loop: bool) -> Result<EngineExit, Error> {
    let guard = InstanceGuard::new(root);
    guard
        .check_not_running()
        .change_context(Error::InstanceLock)?;

    if !foreground {
        // Process supervision is expected from the surrounding environment
        // (systemd, docker); arcyd itself always runs attached.
        debug!("running attached; use a process supervisor to detach");
    }

    // Hold the lock from before leadership contention until shutdown.
    guard.write_pid().change_context(Error::RecordInstance)?;

    if let Some(leader_config) = config.engine().leader_election() {
        info!("leader election enabled; contending");
        let contended = leader::contend(leader_config);
        if contended.is_err() {
            guard.clear_pid();
        }
        contended.change_context(Error::LeaderElection)?;
    }

    let services = build_services(root, &config).map_err(|err| {
        guard.clear_pid();
        err
    })?;

    let mut scheduler = Scheduler::new(
        root.clone(),
        &config,
        services,
        Arc::new(LoggingMailer),
    );
    let exit = scheduler.run(no_loop);
    guard.clear_pid();
    Ok(exit)
}

/// Wire up the shared services from configuration.
fn build_services(root: &DataRoot, config: &Config) -> Result<Services, Error> {
    // The engine currently reports every repository to one review service
    // instance; multiple instances would need one client per repository.
    let phabricator = config
        .phabricators()
        .values()
        .next()
        .ok_or_else(|| error_stack::Report::new(Error::BuildServices))
        .describe("no phabricator instance is configured")
        .help("add one with 'arcyd add-phabricator' before starting")?;

    let review: Arc<dyn ReviewClient> = Arc::new(
        ConduitClient::new(
            phabricator.instance_uri().clone(),
            Secret::new(phabricator.api_token().expose_secret().clone()),
        )
        .change_context(Error::BuildServices)?,
    );

    let mut review_states = ReviewStateCache::new();
    review_states.set_lister(Box::new(review.clone()));

    let directory_client = ConduitClient::new(
        phabricator.instance_uri().clone(),
        Secret::new(phabricator.api_token().expose_secret().clone()),
    )
    .change_context(Error::BuildServices)?;
    let users = UserCache::new(Box::new(directory_client));

    let probe = HttpProbe::new().change_context(Error::BuildServices)?;
    let mut watcher = UrlWatcher::new(Box::new(probe));
    let watcher_file = root.url_watcher_file();
    if watcher_file.exists() {
        match std::fs::File::open(&watcher_file) {
            Ok(file) => {
                if let Err(err) = watcher.load(file) {
                    debug!("discarding unreadable url-watcher state: {err:?}");
                }
            }
            Err(err) => debug!("failed to open url-watcher state: {err}"),
        }
    }

    let reporter = Reporter::new(Some(config.engine().status_path().clone()));

    Ok(Services {
        review,
        review_states: Arc::new(Mutex::new(review_states)),
        users: Arc::new(Mutex::new(users)),
        watcher: Arc::new(Mutex::new(watcher)),
        reporter,
    })
}
