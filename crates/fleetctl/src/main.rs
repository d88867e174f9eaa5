use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use service_orchestration::FleetCommand;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;

mod commands;
mod logging;
mod output;

use commands::Invocation;

#[derive(Parser)]
#[command(name = "fleetctl")]
#[command(about = "Fleetctl - Service lifecycle orchestration across processes, containers and cloud")]
#[command(version)]
struct Cli {
    /// Configuration file path (default: fleet.yaml, fleet.yml or .fleet/config.yaml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Environment to operate on
    #[arg(short, long, global = true, default_value = "development")]
    environment: String,

    /// Report what would happen without doing it
    #[arg(long, global = true)]
    dry_run: bool,

    /// Debug logging, raw upstream errors and recommendations
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Output format
    #[arg(long, global = true, value_enum, default_value_t = Format::Table)]
    format: Format,

    #[command(subcommand)]
    command: Commands,
}

/// How results are printed
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// Compact table
    Table,
    /// CommandResults as JSON
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Start services
    Start {
        /// Services to start (empty means all)
        services: Vec<String>,
    },

    /// Stop services
    Stop {
        /// Services to stop (empty means all)
        services: Vec<String>,
    },

    /// Check status, state drift and health
    Check {
        /// Services to check (empty means all)
        services: Vec<String>,
    },

    /// Stop, wait, then start services
    Restart {
        /// Services to restart (empty means all)
        services: Vec<String>,

        /// Start even when the stop failed
        #[arg(short, long)]
        force: bool,
    },

    /// Roll out a new version
    Update {
        /// Services to update (empty means all)
        services: Vec<String>,

        /// Version to deploy (default: the configured version)
        #[arg(long = "version", value_name = "VERSION")]
        target_version: Option<String>,
    },

    /// Create the resources services need
    Provision {
        /// Services to provision (empty means all)
        services: Vec<String>,
    },

    /// Upload static assets
    Publish {
        /// Services to publish (empty means all)
        services: Vec<String>,
    },

    /// Back up service data
    Backup {
        /// Services to back up (empty means all)
        services: Vec<String>,
    },

    /// Restore service data, least critical service first
    Restore {
        /// Services to restore (empty means all)
        services: Vec<String>,

        /// Keep going after a failed restore
        #[arg(short, long)]
        force: bool,

        /// Backup path or snapshot id (default: the latest backup)
        #[arg(long = "from", value_name = "ARTIFACT")]
        from: Option<String>,
    },

    /// Run a command inside a service
    Exec {
        /// Service to run in
        service: String,

        /// Command and arguments
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Run the configured test command of each service
    Test {
        /// Services to test (empty means all)
        services: Vec<String>,
    },

    /// Remove services and their resources
    Destroy {
        /// Services to destroy (empty means all)
        services: Vec<String>,
    },

    /// Validate configuration file
    Validate,
}

impl Commands {
    /// Fleet command, target services and force flag; `None` for validate
    fn into_fleet(self) -> Option<(FleetCommand, Vec<String>, bool)> {
        let fleet = match self {
            Commands::Start { services } => (FleetCommand::Start, services, false),
            Commands::Stop { services } => (FleetCommand::Stop, services, false),
            Commands::Check { services } => (FleetCommand::Check, services, false),
            Commands::Restart { services, force } => (FleetCommand::Restart, services, force),
            Commands::Update {
                services,
                target_version,
            } => (
                FleetCommand::Update {
                    version: target_version,
                },
                services,
                false,
            ),
            Commands::Provision { services } => (FleetCommand::Provision, services, false),
            Commands::Publish { services } => (FleetCommand::Publish, services, false),
            Commands::Backup { services } => (FleetCommand::Backup, services, false),
            Commands::Restore {
                services,
                force,
                from,
            } => (FleetCommand::Restore { artifact: from }, services, force),
            Commands::Exec { service, command } => {
                (FleetCommand::Exec { command }, vec![service], false)
            }
            Commands::Test { services } => (FleetCommand::Test, services, false),
            Commands::Destroy { services } => (FleetCommand::Destroy, services, false),
            Commands::Validate => return None,
        };
        Some(fleet)
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let env: BTreeMap<String, String> = std::env::vars().collect();
    let cwd = std::env::current_dir().context("Failed to read the working directory")?;
    let config_path = fleet_config::discovery::find_config_file(cli.config.as_deref(), &cwd, &env)?;

    let invocation = Invocation {
        config_path,
        environment: cli.environment,
        env,
        working_directory: cwd,
        dry_run: cli.dry_run,
        verbose: cli.verbose,
        quiet: cli.quiet,
        format: cli.format,
    };

    match cli.command.into_fleet() {
        Some((command, services, force)) => {
            commands::fleet::run(&invocation, command, &services, force).await
        }
        None => commands::validate::run(&invocation),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.quiet);

    match smol::block_on(run(cli)) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::from(2)
        }
    }
}
