//! Service context: one service bound to its strategy for one invocation.
//!
//! Every operation goes through [`ServiceContext::execute`], which applies
//! the same template regardless of target:
//!
//! 1. dry-run returns a successful, marked result without side effects
//! 2. the pre-hook of the service kind runs
//! 3. the strategy performs the operation
//! 4. the post-hook runs
//! 5. state is saved after `start`, deleted after `stop`, and `check`
//!    reconciles drift before probing health and summarizing logs
//! 6. any error becomes a failed result; nothing is returned as `Err`

use crate::config::{
    DeploymentTarget, Requirements, RunConfig, ServiceDefinition, ServiceKind, ServiceSettings,
};
use crate::drift::{DriftDetector, LiveStatus};
use crate::hooks::{ServiceHooks, hooks_for};
use crate::logs::LogCache;
use crate::platforms::{Observation, PlatformStrategy, container::container_name};
use crate::result::{
    CheckDetails, ExecDetails, HealthCheckEntry, HealthState, Operation, OperationDetails,
    OperationResult, ResultStatus,
};
use crate::state::{PersistedServiceState, StateStore};
use crate::{Error, Result};
use chrono::Utc;
use smol::stream::StreamExt;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// An operation with its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationRequest {
    /// Start
    Start,
    /// Stop
    Stop,
    /// Check
    Check,
    /// Update to a version, or the configured one
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
    /// Restore from an artifact, or the latest backup
    Restore {
        /// Backup path or snapshot id
        artifact: Option<String>,
    },
    /// Run a command inside the service
    Exec {
        /// Command and arguments
        command: Vec<String>,
    },
    /// Run the test command
    Test,
    /// Destroy
    Destroy,
}

impl OperationRequest {
    /// Operation this request performs
    pub fn operation(&self) -> Operation {
        match self {
            OperationRequest::Start => Operation::Start,
            OperationRequest::Stop => Operation::Stop,
            OperationRequest::Check => Operation::Check,
            OperationRequest::Update { .. } => Operation::Update,
            OperationRequest::Provision => Operation::Provision,
            OperationRequest::Publish => Operation::Publish,
            OperationRequest::Backup => Operation::Backup,
            OperationRequest::Restore { .. } => Operation::Restore,
            OperationRequest::Exec { .. } => Operation::Exec,
            OperationRequest::Test => Operation::Test,
            OperationRequest::Destroy => Operation::Destroy,
        }
    }
}

struct Outcome {
    details: OperationDetails,
    status: ResultStatus,
    warnings: Vec<String>,
    failure: Option<String>,
}

impl Outcome {
    fn completed(details: OperationDetails) -> Self {
        let failure = match &details {
            OperationDetails::Exec(exec) | OperationDetails::Test(exec) => exit_failure(exec),
            _ => None,
        };
        Self {
            details,
            status: ResultStatus::Completed,
            warnings: Vec::new(),
            failure,
        }
    }
}

fn exit_failure(exec: &ExecDetails) -> Option<String> {
    if exec.succeeded() {
        return None;
    }
    Some(match exec.exit_code {
        Some(code) => format!("'{}' exited with code {}", exec.command.join(" "), code),
        None => format!("'{}' was terminated by a signal", exec.command.join(" ")),
    })
}

enum Delegated {
    Details(OperationDetails),
    Observed(Observation),
}

/// One service bound to its strategy, state store and hooks
#[derive(Clone)]
pub struct ServiceContext {
    definition: Arc<ServiceDefinition>,
    config: Arc<RunConfig>,
    strategy: Arc<dyn PlatformStrategy>,
    store: Arc<dyn StateStore>,
    hooks: Arc<dyn ServiceHooks>,
    cache: Arc<LogCache>,
}

impl ServiceContext {
    /// Bind a definition to a strategy, with the hooks of its kind and a fresh cache
    pub fn new(
        definition: ServiceDefinition,
        config: Arc<RunConfig>,
        strategy: Arc<dyn PlatformStrategy>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        let hooks = hooks_for(definition.kind);
        Self {
            definition: Arc::new(definition),
            config,
            strategy,
            store,
            hooks,
            cache: Arc::new(LogCache::new()),
        }
    }

    /// Replace the hooks
    pub fn with_hooks(mut self, hooks: Arc<dyn ServiceHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Share a cache with other contexts of the same invocation
    pub fn with_cache(mut self, cache: Arc<LogCache>) -> Self {
        self.cache = cache;
        self
    }

    // Accessors

    /// Service name
    pub fn service(&self) -> &'static str {
        self.definition.name()
    }

    /// Service kind
    pub fn kind(&self) -> ServiceKind {
        self.definition.kind
    }

    /// Deployment target
    pub fn deployment(&self) -> DeploymentTarget {
        self.definition.deployment
    }

    /// Environment name
    pub fn environment(&self) -> &str {
        &self.config.environment
    }

    /// Run configuration
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Service definition
    pub fn definition(&self) -> &ServiceDefinition {
        &self.definition
    }

    /// Service settings
    pub fn settings(&self) -> &ServiceSettings {
        &self.definition.settings
    }

    /// Declared requirements
    pub fn requirements(&self) -> &Requirements {
        &self.definition.requirements
    }

    /// Bound strategy
    pub fn strategy(&self) -> &Arc<dyn PlatformStrategy> {
        &self.strategy
    }

    /// Dry-run flag
    pub fn dry_run(&self) -> bool {
        self.config.dry_run
    }

    /// Verbose flag
    pub fn verbose(&self) -> bool {
        self.config.verbose
    }

    /// Quiet flag
    pub fn quiet(&self) -> bool {
        self.config.quiet
    }

    /// Force flag
    pub fn force(&self) -> bool {
        self.config.force
    }

    /// Listening port, from settings or the first declared port
    pub fn port(&self) -> Option<u16> {
        self.settings()
            .port
            .or_else(|| self.requirements().ports.first().copied())
    }

    fn missing(&self, what: &str) -> Error {
        Error::Config(format!(
            "{} requires '{}' for {} deployments",
            self.service(),
            what,
            self.deployment()
        ))
    }

    /// Port, or a configuration error
    pub fn require_port(&self) -> Result<u16> {
        self.port().ok_or_else(|| self.missing("port"))
    }

    /// Image, or a configuration error
    pub fn require_image(&self) -> Result<&str> {
        self.settings()
            .image
            .as_deref()
            .ok_or_else(|| self.missing("image"))
    }

    /// Command, or a configuration error
    pub fn require_command(&self) -> Result<&[String]> {
        match self.settings().command.as_slice() {
            [] => Err(self.missing("command")),
            command => Ok(command),
        }
    }

    /// Test command, or a configuration error
    pub fn require_test_command(&self) -> Result<&[String]> {
        match self.settings().test_command.as_slice() {
            [] => Err(self.missing("test_command")),
            command => Ok(command),
        }
    }

    /// External endpoint, or a configuration error
    pub fn require_endpoint(&self) -> Result<&str> {
        self.settings()
            .endpoint
            .as_deref()
            .ok_or_else(|| self.missing("endpoint"))
    }

    /// Cloud region, or a configuration error
    pub fn require_region(&self) -> Result<&str> {
        self.config
            .cloud
            .region
            .as_deref()
            .ok_or_else(|| self.missing("cloud.region"))
    }

    /// Data path, from settings or the first storage volume
    pub fn require_storage_path(&self) -> Result<PathBuf> {
        self.settings()
            .storage_path
            .clone()
            .or_else(|| {
                self.requirements()
                    .storage
                    .first()
                    .map(|volume| PathBuf::from(&volume.path))
            })
            .ok_or_else(|| self.missing("storage_path"))
    }

    /// Environment passed to the service: settings plus required secrets
    pub fn env_vars(&self) -> BTreeMap<String, String> {
        let mut vars = self.settings().env.clone();
        for secret in &self.requirements().secrets {
            if let Some(value) = self.config.env_var(secret) {
                vars.entry(secret.clone()).or_insert_with(|| value.to_string());
            }
        }
        vars
    }

    /// Log file of a process started by this tool
    pub fn log_file(&self) -> PathBuf {
        self.config
            .log_dir
            .join(self.environment())
            .join(format!("{}.log", self.service()))
    }

    /// Container name under the naming convention, or the override
    pub fn container_name(&self) -> String {
        container_name(
            &self.config.container_prefix,
            self.kind(),
            self.environment(),
            self.settings().container_name.as_deref(),
        )
    }

    /// Directory holding this service's local backups
    pub fn backup_root(&self) -> PathBuf {
        self.config
            .backup_dir
            .join(self.environment())
            .join(self.service())
    }

    /// Path for a new backup taken now
    pub fn new_backup_path(&self) -> PathBuf {
        self.backup_root()
            .join(Utc::now().format("%Y%m%dT%H%M%SZ").to_string())
    }

    /// Most recent local backup, if any
    pub async fn latest_backup(&self) -> Result<Option<PathBuf>> {
        let root = self.backup_root();
        let mut entries = match smol::fs::read_dir(&root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut latest: Option<PathBuf> = None;
        while let Some(entry) = entries.next().await {
            let path = entry?.path();
            if latest.as_ref().is_none_or(|current| path.file_name() > current.file_name()) {
                latest = Some(path);
            }
        }
        Ok(latest)
    }

    /// Persisted record of this service
    pub async fn load_state(&self) -> Result<Option<PersistedServiceState>> {
        self.store.load(self.environment(), self.service()).await
    }

    fn cache_key(&self) -> String {
        format!("{}/{}", self.environment(), self.service())
    }

    // Operations

    /// Start the service
    pub async fn start(&self) -> OperationResult {
        self.execute(&OperationRequest::Start).await
    }

    /// Stop the service
    pub async fn stop(&self) -> OperationResult {
        self.execute(&OperationRequest::Stop).await
    }

    /// Check status, drift and health
    pub async fn check(&self) -> OperationResult {
        self.execute(&OperationRequest::Check).await
    }

    /// Run an operation through the template
    pub async fn execute(&self, request: &OperationRequest) -> OperationResult {
        let operation = request.operation();
        let started = Instant::now();
        let mut result = OperationResult::new(
            operation,
            self.service(),
            self.deployment(),
            self.environment(),
        );

        if self.dry_run() {
            info!(
                "[dry-run] Would {} {} ({})",
                operation,
                self.service(),
                self.deployment()
            );
            result.dry_run = true;
            result.status = ResultStatus::DryRun;
            return result;
        }

        debug!("{} {} ({})", operation, self.service(), self.deployment());
        match self.run(request).await {
            Ok(outcome) => {
                result.details = outcome.details;
                result.status = outcome.status;
                result.warnings = outcome.warnings;
                if let Some(failure) = outcome.failure {
                    result = result.fail(failure);
                }
            }
            Err(err) => {
                warn!("Failed to {} {}: {}", operation, self.service(), err);
                result.recommendations = err.recommendations().to_vec();
                result = result.fail(err.to_string());
            }
        }

        result.duration_ms = started.elapsed().as_millis() as u64;
        result
    }

    async fn run(&self, request: &OperationRequest) -> Result<Outcome> {
        self.hooks.before(request, self).await?;
        let delegated = self.delegate(request).await?;
        self.hooks.after(request, self).await?;

        match delegated {
            Delegated::Observed(observation) => self.reconcile(observation).await,
            Delegated::Details(details) => {
                self.persist(&details).await?;
                Ok(Outcome::completed(details))
            }
        }
    }

    async fn delegate(&self, request: &OperationRequest) -> Result<Delegated> {
        let strategy = self.strategy.as_ref();
        let details = match request {
            OperationRequest::Check => return Ok(Delegated::Observed(strategy.observe(self).await?)),
            OperationRequest::Start => OperationDetails::Start(strategy.start(self).await?),
            OperationRequest::Stop => OperationDetails::Stop(strategy.stop(self).await?),
            OperationRequest::Update { version } => {
                OperationDetails::Update(strategy.update(self, version.as_deref()).await?)
            }
            OperationRequest::Provision => {
                OperationDetails::Provision(strategy.provision(self).await?)
            }
            OperationRequest::Publish => OperationDetails::Publish(strategy.publish(self).await?),
            OperationRequest::Backup => OperationDetails::Backup(strategy.backup(self).await?),
            OperationRequest::Restore { artifact } => {
                OperationDetails::Restore(strategy.restore(self, artifact.as_deref()).await?)
            }
            OperationRequest::Exec { command } => {
                if command.is_empty() {
                    return Err(Error::Config("exec requires a command".to_string()));
                }
                OperationDetails::Exec(strategy.exec(self, command).await?)
            }
            OperationRequest::Test => OperationDetails::Test(strategy.test(self).await?),
            OperationRequest::Destroy => OperationDetails::Destroy(strategy.destroy(self).await?),
        };
        Ok(Delegated::Details(details))
    }

    async fn persist(&self, details: &OperationDetails) -> Result<()> {
        let key = self.cache_key();
        match details {
            OperationDetails::Start(start) => {
                let mut state = PersistedServiceState::new(
                    self.service(),
                    self.deployment(),
                    self.environment(),
                    start.resource.clone(),
                );
                if let Some(version) = &self.settings().version {
                    state.metadata.insert("version".to_string(), version.clone());
                }
                if start.adopted {
                    state.metadata.insert("adopted".to_string(), "true".to_string());
                }
                self.store.save(&state).await?;
                self.cache.invalidate(&key).await;
            }
            OperationDetails::Stop(_) | OperationDetails::Destroy(_) => {
                self.store.delete(self.environment(), self.service()).await?;
                self.cache.invalidate(&key).await;
            }
            OperationDetails::Update(update) => {
                let Some(mut state) = self.load_state().await? else {
                    return Ok(());
                };
                if let Some(resource) = &update.resource {
                    state.resource_id = resource.clone();
                    state.start_time = Utc::now();
                }
                if let Some(version) = &update.version {
                    state.metadata.insert("version".to_string(), version.clone());
                }
                self.store.save(&state).await?;
                self.cache.invalidate(&key).await;
            }
            _ => {}
        }
        Ok(())
    }

    async fn reconcile(&self, observation: Observation) -> Result<Outcome> {
        let record = self.load_state().await?;
        let drift = DriftDetector::new(self.store.as_ref())
            .reconcile(
                self.environment(),
                self.service(),
                record.as_ref(),
                observation.status,
                observation.resource.as_ref(),
            )
            .await?;

        let key = self.cache_key();
        let mut warnings = Vec::new();
        let mut checks = observation.checks.clone();
        let mut logs = None;

        let health = match observation.status {
            LiveStatus::Running => {
                self.cache.mark_seen(&key, Utc::now()).await;

                match self.strategy.health(self, &observation).await {
                    Ok(report) => checks.extend(report.checks),
                    Err(err) => checks.push(HealthCheckEntry::fail("health-probe", err.to_string())),
                }

                let lines = self.config.log_lines;
                match self
                    .cache
                    .summary(&key, || self.strategy.logs(self, lines))
                    .await
                {
                    Ok(summary) => logs = Some(summary),
                    Err(err) => warnings.push(format!("log summary unavailable: {}", err)),
                }

                match HealthState::from_checks(&checks) {
                    HealthState::Unknown => HealthState::Healthy,
                    state => state,
                }
            }
            LiveStatus::Stopped => HealthState::Unhealthy,
            LiveStatus::Unknown => HealthState::from_checks(&checks),
        };

        if let Some(reason) = drift.reason {
            warnings.push(Error::StateDrift(reason.to_string()).to_string());
        }

        let status = match observation.status {
            LiveStatus::Running => ResultStatus::Running,
            LiveStatus::Stopped => ResultStatus::Stopped,
            LiveStatus::Unknown => ResultStatus::Unknown,
        };

        let details = CheckDetails {
            status: observation.status,
            health_status: health,
            checks,
            state_verified: drift.verified,
            drift: drift.reason,
            record_deleted: drift.record_deleted,
            resource: observation.resource,
            endpoint: observation.endpoint,
            logs,
            last_seen_running: self.cache.last_seen(&key).await,
        };

        Ok(Outcome {
            details: OperationDetails::Check(details),
            status,
            warnings,
            failure: None,
        })
    }
}
