//! Platform strategies.
//!
//! Every deployment target implements [`PlatformStrategy`]. The
//! orchestration core depends only on the trait; [`PlatformRegistry`] maps
//! each [`DeploymentTarget`] to the strategy that drives it.

pub mod cloud;
pub mod container;
pub mod external;
pub mod mock;
pub mod process;

pub use cloud::CloudStrategy;
pub use container::ContainerStrategy;
pub use external::ExternalStrategy;
pub use mock::MockStrategy;
pub use process::ProcessStrategy;

use crate::config::{DeploymentTarget, RunConfig};
use crate::context::ServiceContext;
use crate::drift::LiveStatus;
use crate::result::{
    BackupDetails, DestroyDetails, ExecDetails, HealthCheckEntry, Operation, ProvisionDetails,
    PublishDetails, RestoreDetails, StartDetails, StopDetails, UpdateDetails,
};
use crate::state::ResourceId;
use crate::{Error, Result};
use async_trait::async_trait;
use command_executor::{Command, CommandOutput, LocalRunner, Runner};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// What a strategy sees when it looks at a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    /// Live status
    pub status: LiveStatus,
    /// Live handle, when the platform can name the instance
    pub resource: Option<ResourceId>,
    /// Checks performed while observing
    pub checks: Vec<HealthCheckEntry>,
    /// Where the service can be reached
    pub endpoint: Option<String>,
    /// Raw platform facts, such as provider status words
    pub attributes: BTreeMap<String, String>,
}

impl Observation {
    fn with_status(status: LiveStatus) -> Self {
        Self {
            status,
            resource: None,
            checks: Vec::new(),
            endpoint: None,
            attributes: BTreeMap::new(),
        }
    }

    /// Running instance with the given handle
    pub fn running(resource: ResourceId) -> Self {
        Self {
            resource: Some(resource),
            ..Self::with_status(LiveStatus::Running)
        }
    }

    /// Nothing running
    pub fn stopped() -> Self {
        Self::with_status(LiveStatus::Stopped)
    }

    /// The platform could not tell
    pub fn unknown() -> Self {
        Self::with_status(LiveStatus::Unknown)
    }

    /// Add a check
    pub fn with_check(mut self, check: HealthCheckEntry) -> Self {
        self.checks.push(check);
        self
    }

    /// Set the endpoint
    pub fn with_endpoint(mut self, endpoint: Option<String>) -> Self {
        self.endpoint = endpoint;
        self
    }

    /// Record a raw platform fact
    pub fn with_attribute(mut self, key: &str, value: impl Into<String>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }
}

/// Checks produced by a health probe
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    /// Individual checks
    pub checks: Vec<HealthCheckEntry>,
}

impl HealthReport {
    /// Report with one check
    pub fn single(check: HealthCheckEntry) -> Self {
        Self {
            checks: vec![check],
        }
    }
}

/// Lifecycle operations for one deployment target
///
/// Methods return operation details or an error; the orchestration core
/// turns errors into failed results, so no error escapes a per-service
/// operation. Operations a target has no notion of keep the default body,
/// which refuses with [`Error::Unsupported`].
#[async_trait]
pub trait PlatformStrategy: Send + Sync {
    /// Target this strategy drives
    fn target(&self) -> DeploymentTarget;

    /// Whether stop, restart and destroy can be performed at all
    fn controllable(&self) -> bool {
        true
    }

    /// Start the service, or adopt an instance that is already running
    async fn start(&self, ctx: &ServiceContext) -> Result<StartDetails>;

    /// Stop the service
    async fn stop(&self, ctx: &ServiceContext) -> Result<StopDetails>;

    /// Report live status and the live handle
    async fn observe(&self, ctx: &ServiceContext) -> Result<Observation>;

    /// Probe a running service
    async fn health(&self, ctx: &ServiceContext, observation: &Observation)
    -> Result<HealthReport>;

    /// Last `lines` lines of the service's logs
    async fn logs(&self, ctx: &ServiceContext, lines: usize) -> Result<Vec<String>>;

    /// Roll out `version`, or the configured one
    async fn update(&self, ctx: &ServiceContext, version: Option<&str>) -> Result<UpdateDetails> {
        let _ = version;
        Err(Error::unsupported(
            Operation::Update,
            ctx.deployment(),
            "no automated update for this target",
        ))
    }

    /// Create what the service needs before it can start
    async fn provision(&self, ctx: &ServiceContext) -> Result<ProvisionDetails> {
        Err(Error::unsupported(
            Operation::Provision,
            ctx.deployment(),
            "nothing to provision for this target",
        ))
    }

    /// Upload static assets
    async fn publish(&self, ctx: &ServiceContext) -> Result<PublishDetails> {
        Err(Error::unsupported(
            Operation::Publish,
            ctx.deployment(),
            "assets are only published to cloud storage",
        ))
    }

    /// Back up the service data
    async fn backup(&self, ctx: &ServiceContext) -> Result<BackupDetails> {
        Err(Error::unsupported(
            Operation::Backup,
            ctx.deployment(),
            "no backup mechanism for this target",
        ))
    }

    /// Restore the service data from `artifact`, or the latest backup
    async fn restore(&self, ctx: &ServiceContext, artifact: Option<&str>) -> Result<RestoreDetails> {
        let _ = artifact;
        Err(Error::unsupported(
            Operation::Restore,
            ctx.deployment(),
            "no restore mechanism for this target",
        ))
    }

    /// Run a command inside the service
    async fn exec(&self, ctx: &ServiceContext, command: &[String]) -> Result<ExecDetails> {
        let _ = command;
        Err(Error::unsupported(
            Operation::Exec,
            ctx.deployment(),
            "commands cannot be run inside this target",
        ))
    }

    /// Run the configured test command
    async fn test(&self, ctx: &ServiceContext) -> Result<ExecDetails> {
        Err(Error::unsupported(
            Operation::Test,
            ctx.deployment(),
            "no test command for this target",
        ))
    }

    /// Remove the service and its resources
    async fn destroy(&self, ctx: &ServiceContext) -> Result<DestroyDetails> {
        Err(Error::unsupported(
            Operation::Destroy,
            ctx.deployment(),
            "nothing to destroy for this target",
        ))
    }
}

/// Run `argv` on this machine with the service environment applied
pub(crate) async fn run_local(
    runner: &dyn Runner,
    ctx: &ServiceContext,
    argv: &[String],
    extra_env: &[(&str, String)],
) -> Result<CommandOutput> {
    let Some((program, args)) = argv.split_first() else {
        return Err(Error::Config("empty command".to_string()));
    };
    let mut cmd = Command::new(program);
    cmd.args(args).envs(ctx.env_vars());
    for (key, value) in extra_env {
        cmd.env(key, value);
    }
    if let Some(dir) = &ctx.settings().working_dir {
        cmd.current_dir(dir);
    }
    Ok(runner.output(&cmd).await?)
}

/// Exec details from a finished command
pub(crate) fn exec_details(argv: &[String], output: CommandOutput) -> ExecDetails {
    ExecDetails {
        command: argv.to_vec(),
        exit_code: output.status.code,
        stdout: output.stdout,
        stderr: output.stderr,
    }
}

/// Build the strategy for a target
pub fn strategy_for(
    target: DeploymentTarget,
    config: &RunConfig,
    runner: Arc<dyn Runner>,
) -> Arc<dyn PlatformStrategy> {
    match target {
        DeploymentTarget::Process => Arc::new(ProcessStrategy::new(runner, config)),
        DeploymentTarget::Container => Arc::new(ContainerStrategy::new(runner, config)),
        DeploymentTarget::Cloud => Arc::new(CloudStrategy::from_config(runner, config)),
        DeploymentTarget::External => Arc::new(ExternalStrategy::new(runner, config)),
        DeploymentTarget::Mock => Arc::new(MockStrategy::new()),
    }
}

/// Registry that maps deployment targets to strategies
pub struct PlatformRegistry {
    strategies: HashMap<DeploymentTarget, Arc<dyn PlatformStrategy>>,
}

impl PlatformRegistry {
    /// Registry without strategies
    pub fn new() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    /// Every target, driving real processes with the configured timeout
    pub fn with_defaults(config: &RunConfig) -> Self {
        let runner: Arc<dyn Runner> = Arc::new(LocalRunner::with_timeout(config.command_timeout));
        Self::with_runner(config, runner)
    }

    /// Every target, driving commands through `runner`
    pub fn with_runner(config: &RunConfig, runner: Arc<dyn Runner>) -> Self {
        let mut registry = Self::new();
        for target in DeploymentTarget::ALL {
            registry.register(strategy_for(target, config, runner.clone()));
        }
        registry
    }

    /// Register a strategy under its own target, replacing any previous one
    pub fn register(&mut self, strategy: Arc<dyn PlatformStrategy>) {
        self.strategies.insert(strategy.target(), strategy);
    }

    /// Strategy for a target
    pub fn get(&self, target: DeploymentTarget) -> Result<Arc<dyn PlatformStrategy>> {
        self.strategies
            .get(&target)
            .cloned()
            .ok_or(Error::NoStrategy(target))
    }

    /// Registered targets, in declaration order
    pub fn targets(&self) -> Vec<DeploymentTarget> {
        DeploymentTarget::ALL
            .into_iter()
            .filter(|t| self.strategies.contains_key(t))
            .collect()
    }
}

impl Default for PlatformRegistry {
    fn default() -> Self {
        Self::new()
    }
}
