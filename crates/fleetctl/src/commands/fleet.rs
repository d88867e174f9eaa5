use super::Invocation;
use crate::output;
use anyhow::{Context, Result};
use service_orchestration::{FileStateStore, FleetAggregator, FleetCommand, RunConfig};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::debug;

pub async fn run(
    invocation: &Invocation,
    command: FleetCommand,
    services: &[String],
    force: bool,
) -> Result<ExitCode> {
    let resolved = fleet_config::load(
        &invocation.config_path,
        &invocation.environment,
        &invocation.env,
    )
    .with_context(|| format!("Failed to load {}", invocation.config_path.display()))?;
    let definitions = resolved.select(services)?;

    let mut config =
        RunConfig::from_env_snapshot(&invocation.environment, invocation.env.clone());
    config.working_directory = invocation.working_directory.clone();
    resolved.apply(&mut config);
    config.dry_run = invocation.dry_run;
    config.verbose = invocation.verbose;
    config.quiet = invocation.quiet;
    config.force = force;
    debug!("State directory: {}", config.state_dir.display());

    let config = Arc::new(config);
    let store = Arc::new(FileStateStore::new(&config.state_dir));
    let fleet = FleetAggregator::with_defaults(config, store);

    let results = fleet.run(&command, &definitions).await;
    output::print(&results, invocation.format, invocation.verbose)?;

    Ok(if results.has_failures() {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    })
}
