// ftl-cli: clap surface, command implementations, and the interactive
// shell. The binary crate calls `run()` and nothing else.

mod commands;
mod display;
mod setup;
mod shell;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "ftl",
    version,
    about = "Zero-trust control plane for AI development"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize ftl in the current project. Creates .ftlconfig with defaults.
    Init,
    /// Save an ftl credential to ~/.ftl/credentials.
    ///
    /// Examples:
    ///   ftl auth ANTHROPIC_API_KEY sk-ant-...
    ///   ftl auth AWS_BEARER_TOKEN_BEDROCK ABSK...
    Auth { key: String, value: String },
    /// Run a coding task in an isolated sandbox.
    ///
    /// Example: ftl code "create login component"
    Code { task: String },
    /// One-command setup: choose agent and tester, pull the sandbox image,
    /// save the API key.
    Setup,
    /// Configure ftl settings.
    Config {
        /// Provision AWS resources for snapshots, tracing, and guardrails.
        #[arg(long)]
        aws: bool,
    },
    /// List and manage project snapshots.
    Snapshots {
        /// Show snapshots for all projects.
        #[arg(long)]
        all: bool,
        #[command(subcommand)]
        action: Option<SnapshotsCmd>,
    },
    /// Show the session audit log.
    Logs {
        /// Number of log entries to show.
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
        /// Show logs for all projects.
        #[arg(long)]
        all: bool,
    },
}

#[derive(Subcommand)]
enum SnapshotsCmd {
    /// Delete snapshots. Use --last N or --all.
    Clean {
        /// Delete the N most recent snapshots.
        #[arg(long)]
        last: Option<usize>,
        /// Delete all snapshots.
        #[arg(long)]
        all: bool,
        /// Limit to snapshots from the current project.
        #[arg(long)]
        project_only: bool,
        /// Skip the confirmation prompt.
        #[arg(short = 'y', long)]
        yes: bool,
    },
}

/// Binary entrypoint. Loads global credentials into the environment,
/// installs the interrupt handler, then dispatches.
pub fn run() -> Result<()> {
    ftl_core::credentials::load_credentials();
    ftl_core::logging::init();
    ftl_sandbox::install_interrupt_handler();

    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Init) => commands::init(),
        Some(Commands::Auth { key, value }) => commands::auth(&key, &value),
        Some(Commands::Code { task }) => commands::code(&task),
        Some(Commands::Setup) => setup::setup(),
        Some(Commands::Config { aws }) => commands::config(aws),
        Some(Commands::Snapshots { all, action }) => match action {
            None => commands::snapshots_list(all),
            Some(SnapshotsCmd::Clean {
                last,
                all,
                project_only,
                yes,
            }) => commands::snapshots_clean(last, all, project_only, yes),
        },
        Some(Commands::Logs { limit, all }) => commands::logs(limit, all),
        None => shell::shell(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_snapshots_clean_flags() {
        let cli = Cli::parse_from(["ftl", "snapshots", "clean", "--last", "3", "-y"]);
        match cli.command {
            Some(Commands::Snapshots {
                action: Some(SnapshotsCmd::Clean { last, yes, all, .. }),
                ..
            }) => {
                assert_eq!(last, Some(3));
                assert!(yes);
                assert!(!all);
            }
            _ => panic!("unexpected parse"),
        }
    }

    #[test]
    fn test_logs_defaults() {
        let cli = Cli::parse_from(["ftl", "logs"]);
        match cli.command {
            Some(Commands::Logs { limit, all }) => {
                assert_eq!(limit, 20);
                assert!(!all);
            }
            _ => panic!("unexpected parse"),
        }
    }
}
