//! Fleet aggregator: one command across many services.
//!
//! Services run one after another in the order given. `restore` is the
//! exception: it runs least critical first and stops at the first failure
//! unless forced. Caches that only make sense within one invocation (log
//! summaries, last-seen-running times) live here and die with the
//! aggregator.

use crate::config::{RunConfig, ServiceDefinition};
use crate::context::{OperationRequest, ServiceContext};
use crate::logs::LogCache;
use crate::platforms::PlatformRegistry;
use crate::result::{
    CommandResults, ExecutionContext, Operation, OperationDetails, OperationResult,
    RestartDetails, ResultStatus, Summary,
};
use crate::state::StateStore;
use crate::{Error, Result};
use chrono::Utc;
use smol::Timer;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// A command run across the fleet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetCommand {
    /// Start
    Start,
    /// Stop
    Stop,
    /// Check
    Check,
    /// Stop, wait, start
    Restart,
    /// Update
    Update {
        /// Target version
        version: Option<String>,
    },
    /// Provision
    Provision,
    /// Publish
    Publish,
    /// Backup
    Backup,
    /// Restore, least critical service first
    Restore {
        /// Backup path or snapshot id
        artifact: Option<String>,
    },
    /// Run a command inside each service
    Exec {
        /// Command and arguments
        command: Vec<String>,
    },
    /// Test
    Test,
    /// Destroy
    Destroy,
}

impl FleetCommand {
    /// Operation each service undergoes
    pub fn operation(&self) -> Operation {
        match self {
            FleetCommand::Restart => Operation::Restart,
            other => other
                .request()
                .map(|request| request.operation())
                .unwrap_or(Operation::Restart),
        }
    }

    /// Command name as shown to users
    pub fn name(&self) -> &'static str {
        self.operation().as_str()
    }

    /// Per-service request; restart is composed here instead
    fn request(&self) -> Option<OperationRequest> {
        let request = match self {
            FleetCommand::Start => OperationRequest::Start,
            FleetCommand::Stop => OperationRequest::Stop,
            FleetCommand::Check => OperationRequest::Check,
            FleetCommand::Restart => return None,
            FleetCommand::Update { version } => OperationRequest::Update {
                version: version.clone(),
            },
            FleetCommand::Provision => OperationRequest::Provision,
            FleetCommand::Publish => OperationRequest::Publish,
            FleetCommand::Backup => OperationRequest::Backup,
            FleetCommand::Restore { artifact } => OperationRequest::Restore {
                artifact: artifact.clone(),
            },
            FleetCommand::Exec { command } => OperationRequest::Exec {
                command: command.clone(),
            },
            FleetCommand::Test => OperationRequest::Test,
            FleetCommand::Destroy => OperationRequest::Destroy,
        };
        Some(request)
    }
}

/// Services in restore order: least critical first, the database last
///
/// The sort is stable, so services of equal criticality keep their
/// requested order.
pub fn restore_order(services: &[ServiceDefinition]) -> Vec<ServiceDefinition> {
    let mut ordered = services.to_vec();
    ordered.sort_by_key(|definition| definition.kind.criticality());
    ordered
}

/// Runs fleet commands for one invocation
pub struct FleetAggregator {
    config: Arc<RunConfig>,
    registry: PlatformRegistry,
    store: Arc<dyn StateStore>,
    cache: Arc<LogCache>,
}

impl FleetAggregator {
    /// Aggregator over the given strategies and store
    pub fn new(config: Arc<RunConfig>, registry: PlatformRegistry, store: Arc<dyn StateStore>) -> Self {
        Self {
            config,
            registry,
            store,
            cache: Arc::new(LogCache::new()),
        }
    }

    /// Aggregator with every built-in strategy driving real commands
    pub fn with_defaults(config: Arc<RunConfig>, store: Arc<dyn StateStore>) -> Self {
        let registry = PlatformRegistry::with_defaults(&config);
        Self::new(config, registry, store)
    }

    /// Run configuration
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Cache shared by every service of this invocation
    pub fn cache(&self) -> &Arc<LogCache> {
        &self.cache
    }

    /// Bind a definition to its strategy
    pub fn context(&self, definition: &ServiceDefinition) -> Result<ServiceContext> {
        let strategy = self.registry.get(definition.deployment)?;
        Ok(ServiceContext::new(
            definition.clone(),
            self.config.clone(),
            strategy,
            self.store.clone(),
        )
        .with_cache(self.cache.clone()))
    }

    /// Run `command` across `services` and aggregate the results
    pub async fn run(&self, command: &FleetCommand, services: &[ServiceDefinition]) -> CommandResults {
        let started = Instant::now();
        let timestamp = Utc::now();
        info!(
            "{} {} service(s) in {}{}",
            command.name(),
            services.len(),
            self.config.environment,
            if self.config.dry_run { " [dry-run]" } else { "" }
        );

        let results = match command {
            FleetCommand::Restore { .. } => self.run_restore(command, services).await,
            _ => {
                let mut results = Vec::with_capacity(services.len());
                for definition in services {
                    results.push(self.run_one(command, definition).await);
                }
                results
            }
        };

        let summary = Summary::from_results(&results);
        info!(
            "{}: {} succeeded, {} failed, {} warnings",
            command.name(),
            summary.succeeded,
            summary.failed,
            summary.warnings
        );

        CommandResults {
            command: command.name().to_string(),
            environment: self.config.environment.clone(),
            timestamp,
            duration_ms: started.elapsed().as_millis() as u64,
            results,
            summary,
            context: ExecutionContext {
                user: self.config.user.clone(),
                working_directory: self.config.working_directory.display().to_string(),
                dry_run: self.config.dry_run,
            },
        }
    }

    async fn run_one(&self, command: &FleetCommand, definition: &ServiceDefinition) -> OperationResult {
        let ctx = match self.context(definition) {
            Ok(ctx) => ctx,
            Err(err) => {
                return OperationResult::new(
                    command.operation(),
                    definition.name(),
                    definition.deployment,
                    &self.config.environment,
                )
                .fail(err.to_string());
            }
        };
        match command.request() {
            Some(request) => ctx.execute(&request).await,
            None => self.restart(&ctx).await,
        }
    }

    async fn run_restore(&self, command: &FleetCommand, services: &[ServiceDefinition]) -> Vec<OperationResult> {
        let ordered = restore_order(services);
        let mut results = Vec::with_capacity(ordered.len());

        for (index, definition) in ordered.iter().enumerate() {
            let result = self.run_one(command, definition).await;
            let failed = !result.success;
            results.push(result);

            if failed && !self.config.force {
                warn!(
                    "Restore of {} failed; not attempting the remaining {} service(s)",
                    definition.name(),
                    ordered.len() - index - 1
                );
                for rest in &ordered[index + 1..] {
                    results.push(OperationResult::skipped(
                        Operation::Restore,
                        rest.name(),
                        rest.deployment,
                        &self.config.environment,
                        format!("not attempted: restore of {} failed", definition.name()),
                    ));
                }
                break;
            }
        }
        results
    }

    /// Stop, wait for the grace period, start
    pub async fn restart(&self, ctx: &ServiceContext) -> OperationResult {
        let started = Instant::now();
        let mut result = OperationResult::new(
            Operation::Restart,
            ctx.service(),
            ctx.deployment(),
            ctx.environment(),
        );

        if ctx.dry_run() {
            info!("[dry-run] Would restart {} ({})", ctx.service(), ctx.deployment());
            result.dry_run = true;
            result.status = ResultStatus::DryRun;
            return result;
        }

        if !ctx.strategy().controllable() {
            let err = Error::unsupported(
                Operation::Restart,
                ctx.deployment(),
                "not controllable remotely",
            )
            .with_recommendations([format!(
                "Ask the owners of {} to restart it",
                ctx.service()
            )]);
            result.recommendations = err.recommendations().to_vec();
            result = result.fail(err.to_string());
            result.duration_ms = started.elapsed().as_millis() as u64;
            return result;
        }

        let stop = ctx.stop().await;
        let stop_error = stop.error.clone().unwrap_or_default();

        if !stop.success && !ctx.force() {
            result.recommendations = stop.recommendations.clone();
            result.details = OperationDetails::Restart(RestartDetails {
                stop: Box::new(stop),
                start: None,
                grace_ms: 0,
            });
            result = result.fail(format!("stop failed: {}", stop_error));
            result.duration_ms = started.elapsed().as_millis() as u64;
            return result;
        }

        let forced = !stop.success;
        if forced {
            warn!(
                "Stop of {} failed ({}); starting anyway because of --force",
                ctx.service(),
                stop_error
            );
            result
                .warnings
                .push(format!("stop failed, continued because of --force: {}", stop_error));
        }

        let grace = self.config.restart_grace;
        Timer::after(grace).await;

        let start = ctx.start().await;
        let start_error = start.error.clone();
        result.recommendations = start.recommendations.clone();
        result.details = OperationDetails::Restart(RestartDetails {
            stop: Box::new(stop),
            start: Some(Box::new(start)),
            grace_ms: grace.as_millis() as u64,
        });

        match start_error {
            Some(error) => result = result.fail(format!("start failed: {}", error)),
            None if forced => result.status = ResultStatus::ForceContinued,
            None => result.status = ResultStatus::Restarted,
        }
        result.duration_ms = started.elapsed().as_millis() as u64;
        result
    }
}
