//! The `arcyd` binary.

#![deny(clippy::unwrap_used)]
#![deny(unsafe_code)]
#![deny(missing_docs)]
#![warn(rust_2018_idioms)]

use std::process::ExitCode;

use arcyd::config;
use arcyd::ext::error_stack::{ErrorHelper, FatalErrorReport};
use arcyd::guard;
use arcyd::logging;
use arcyd::scheduler::EngineExit;
use arcyd::subcommand;
use atty::Stream;
use clap::{Args, Parser, Subcommand};
use error_stack::{fmt::ColorMode, Report, Result, ResultExt};

/// Exit code when the data root is held by another instance.
const EXIT_LOCKED: u8 = 2;

#[derive(Debug, thiserror::Error)]
enum Error {
    #[error("determine effective configuration")]
    DetermineEffectiveConfig,

    #[error("a fatal error occurred during internal configuration")]
    InternalSetup,

    #[error("a fatal error occurred at runtime")]
    Runtime,
}

#[derive(Debug, Parser)]
#[clap(version, about)]
struct Opts {
    /// Arcyd is controlled through a number of subcommands.
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct StartArgs {
    #[clap(flatten)]
    root: config::RawDataRootArgs,

    /// Stay attached to the terminal instead of relying on a supervisor.
    #[arg(long)]
    foreground: bool,

    /// Run exactly one engine cycle, then exit.
    #[arg(long)]
    no_loop: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Initialize an arcyd data root.
    Init {
        #[clap(flatten)]
        root: config::RawDataRootArgs,
    },

    /// Run the engine with the current configuration.
    Start(StartArgs),

    /// Stop the running engine.
    Stop {
        #[clap(flatten)]
        root: config::RawDataRootArgs,

        /// Terminate the instance if it ignores the kill file.
        #[arg(long)]
        force: bool,
    },

    /// Stop the running engine, then start a fresh one.
    Restart {
        #[clap(flatten)]
        args: StartArgs,

        /// Terminate the old instance if it ignores the kill file.
        #[arg(long)]
        force: bool,
    },

    /// Register a review-service instance.
    AddPhabricator {
        #[clap(flatten)]
        root: config::RawDataRootArgs,

        /// Name for the instance, used by repository configs.
        #[arg(long)]
        name: String,

        /// Base URL of the instance.
        #[arg(long)]
        instance_uri: String,

        /// Conduit API token.
        #[arg(long, env = "ARCYD_API_TOKEN")]
        api_token: String,

        /// Format for review browse URLs; '{id}' is substituted.
        #[arg(long)]
        review_url_format: Option<String>,
    },

    /// Register a repository host.
    AddRepohost {
        #[clap(flatten)]
        root: config::RawDataRootArgs,

        /// Name for the host, used by repository configs.
        #[arg(long)]
        name: String,

        /// Format for clone URLs; '{repo}' is substituted.
        #[arg(long)]
        clone_url_format: String,

        /// Format for snoop URLs; '{repo}' is substituted.
        #[arg(long)]
        snoop_url_format: Option<String>,

        /// Administrators notified about repositories on this host.
        #[arg(long = "admin-email")]
        admin_emails: Vec<String>,
    },

    /// Start managing a repository.
    AddRepo {
        #[clap(flatten)]
        root: config::RawDataRootArgs,

        /// The review-service instance to report to.
        phabricator: String,

        /// The host to clone from.
        repohost: String,

        /// Machine name of the repository.
        name: String,

        /// Human-facing name for status reports.
        #[arg(long)]
        human_name: Option<String>,

        /// Explicit snoop URL, overriding the host's format.
        #[arg(long)]
        snoop_url: Option<String>,

        /// Git remote name in the working copy.
        #[arg(long)]
        remote: Option<String>,

        /// Administrators notified about this repository.
        #[arg(long = "admin-email")]
        admin_emails: Vec<String>,
    },

    /// Stop managing a repository.
    RmRepo {
        #[clap(flatten)]
        root: config::RawDataRootArgs,

        /// Machine name of the repository.
        name: String,
    },

    /// Check the data root for problems.
    Fsck {
        #[clap(flatten)]
        root: config::RawDataRootArgs,

        /// Repair problems where possible.
        #[arg(long)]
        fix: bool,
    },

    /// Fetch every managed repository once.
    Fetch {
        #[clap(flatten)]
        root: config::RawDataRootArgs,
    },
}

fn main() -> ExitCode {
    if atty::is(Stream::Stdout) {
        Report::set_color_mode(ColorMode::Color);
    } else {
        Report::set_color_mode(ColorMode::None);
    }

    let Opts { command } = Opts::parse();
    match run(command) {
        Ok(exit) => exit,
        Err(report) => {
            // Starting against a held data root has a dedicated exit code so
            // wrappers can tell "already running" from real failures.
            eprintln!("{report:?}");
            if is_lock_conflict(&report) {
                ExitCode::from(EXIT_LOCKED)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn is_lock_conflict(report: &Report<Error>) -> bool {
    report
        .frames()
        .any(|frame| match frame.downcast_ref::<guard::Error>() {
            Some(guard::Error::AlreadyRunning(_)) => true,
            _ => matches!(frame.downcast_ref::<arcyd::fsutil::Error>(), Some(arcyd::fsutil::Error::Locked)),
        })
}

fn run(command: Commands) -> Result<ExitCode, Error> {
    match command {
        Commands::Init { root } => {
            let root = config::validate_init_args(root)
                .change_context(Error::DetermineEffectiveConfig)?;
            subcommand::init::main(&root).change_context(Error::Runtime)?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Start(args) => main_start(args),

        Commands::Stop { root, force } => {
            let root = validated(root)?;
            subcommand::stop::main(&root, force).change_context(Error::Runtime)?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Restart { args, force } => {
            let root = validated(args.root)?;
            let config = load_config(&root)?;
            let exit =
                subcommand::restart::main(&root, config, force, args.foreground, args.no_loop)
                    .change_context(Error::Runtime)?;
            Ok(engine_exit_code(exit))
        }

        Commands::AddPhabricator {
            root,
            name,
            instance_uri,
            api_token,
            review_url_format,
        } => {
            let root = validated(root)?;
            subcommand::add_phabricator::main(
                &root,
                &name,
                &instance_uri,
                &api_token,
                review_url_format.as_deref(),
            )
            .change_context(Error::Runtime)?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::AddRepohost {
            root,
            name,
            clone_url_format,
            snoop_url_format,
            admin_emails,
        } => {
            let root = validated(root)?;
            subcommand::add_repohost::main(
                &root,
                &name,
                &clone_url_format,
                snoop_url_format.as_deref(),
                &admin_emails,
            )
            .change_context(Error::Runtime)?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::AddRepo {
            root,
            phabricator,
            repohost,
            name,
            human_name,
            snoop_url,
            remote,
            admin_emails,
        } => {
            let root = validated(root)?;
            subcommand::add_repo::main(
                &root,
                &name,
                &phabricator,
                &repohost,
                human_name.as_deref(),
                snoop_url.as_deref(),
                remote.as_deref(),
                &admin_emails,
            )
            .change_context(Error::Runtime)?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::RmRepo { root, name } => {
            let root = validated(root)?;
            subcommand::rm_repo::main(&root, &name).change_context(Error::Runtime)?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Fsck { root, fix } => {
            let root = validated(root)?;
            subcommand::fsck::main(&root, fix).change_context(Error::Runtime)?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Fetch { root } => {
            let root = validated(root)?;
            let config = load_config(&root)?;
            subcommand::fetch::main(&config).change_context(Error::Runtime)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn main_start(args: StartArgs) -> Result<ExitCode, Error> {
    let root = validated(args.root)?;
    let config = load_config(&root)?;

    let _tracing_guard = logging::run_tracing_sink(&root).change_context(Error::InternalSetup)?;

    let exit = subcommand::start::main(&root, config, args.foreground, args.no_loop)
        .change_context(Error::Runtime)
        .request_support()?;
    Ok(engine_exit_code(exit))
}

fn validated(root: config::RawDataRootArgs) -> Result<config::DataRoot, Error> {
    config::validate_args(root)
        .change_context(Error::DetermineEffectiveConfig)
        .help("try running arcyd with the '--help' argument to see available options")
}

fn load_config(root: &config::DataRoot) -> Result<config::Config, Error> {
    config::load(root).change_context(Error::DetermineEffectiveConfig)
}

fn engine_exit_code(exit: EngineExit) -> ExitCode {
    match exit {
        EngineExit::Clean => ExitCode::SUCCESS,
        EngineExit::HadFailures => ExitCode::FAILURE,
    }
}
