//! Operation results and their fleet-level aggregation.
//!
//! Results are plain data: the CLI renders them as a table or JSON, and
//! downstream tooling reads the JSON (camelCase) form.

use crate::config::DeploymentTarget;
use crate::drift::{DriftReason, LiveStatus};
use crate::state::ResourceId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    /// Start the service
    Start,
    /// Stop the service
    Stop,
    /// Observe status, drift and health
    Check,
    /// Stop then start
    Restart,
    /// Roll out a new version
    Update,
    /// Create the resources the service needs
    Provision,
    /// Upload static assets
    Publish,
    /// Take a backup of the service data
    Backup,
    /// Restore the service data from a backup
    Restore,
    /// Run a command inside the service
    Exec,
    /// Run the service's test command
    Test,
    /// Remove the service and its resources
    Destroy,
}

impl Operation {
    /// Operation name
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Start => "start",
            Operation::Stop => "stop",
            Operation::Check => "check",
            Operation::Restart => "restart",
            Operation::Update => "update",
            Operation::Provision => "provision",
            Operation::Publish => "publish",
            Operation::Backup => "backup",
            Operation::Restore => "restore",
            Operation::Exec => "exec",
            Operation::Test => "test",
            Operation::Destroy => "destroy",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status word of a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResultStatus {
    /// The operation finished
    Completed,
    /// The operation failed
    Failed,
    /// Nothing was done because of dry-run
    DryRun,
    /// Not attempted because an earlier step aborted the fleet
    Skipped,
    /// Check found the service running
    Running,
    /// Check found the service stopped
    Stopped,
    /// Check could not tell
    Unknown,
    /// Restart stopped and started the service
    Restarted,
    /// Restart started the service after a failed stop, because of force
    ForceContinued,
}

impl ResultStatus {
    /// Status word
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Completed => "completed",
            ResultStatus::Failed => "failed",
            ResultStatus::DryRun => "dry-run",
            ResultStatus::Skipped => "skipped",
            ResultStatus::Running => "running",
            ResultStatus::Stopped => "stopped",
            ResultStatus::Unknown => "unknown",
            ResultStatus::Restarted => "restarted",
            ResultStatus::ForceContinued => "force-continued",
        }
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall health of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Everything passed
    Healthy,
    /// Up but impaired
    Degraded,
    /// Down or failing
    Unhealthy,
    /// No signal
    Unknown,
}

impl HealthState {
    fn severity(&self) -> u8 {
        match self {
            HealthState::Healthy => 0,
            HealthState::Unknown => 1,
            HealthState::Degraded => 2,
            HealthState::Unhealthy => 3,
        }
    }

    /// The more severe of two states
    pub fn worst(self, other: HealthState) -> HealthState {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    /// Fold check entries into one state; `Unknown` when nothing was checked
    pub fn from_checks(checks: &[HealthCheckEntry]) -> HealthState {
        let mut state = None;
        for check in checks {
            let this = match check.status {
                CheckStatus::Pass => HealthState::Healthy,
                CheckStatus::Warn => HealthState::Degraded,
                CheckStatus::Fail => HealthState::Unhealthy,
                CheckStatus::Skip => continue,
            };
            state = Some(state.map_or(this, |s: HealthState| s.worst(this)));
        }
        state.unwrap_or(HealthState::Unknown)
    }

    /// State word
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Unhealthy => "unhealthy",
            HealthState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one named check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    /// Check passed
    Pass,
    /// Check passed with a warning
    Warn,
    /// Check failed
    Fail,
    /// Check not applicable
    Skip,
}

/// One named check performed during `check`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckEntry {
    /// Check name, such as `container-running` or `http`
    pub name: String,
    /// Outcome
    pub status: CheckStatus,
    /// Human readable detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HealthCheckEntry {
    fn new(name: impl Into<String>, status: CheckStatus, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            name: name.into(),
            status,
            message: (!message.is_empty()).then_some(message),
        }
    }

    /// Passing check
    pub fn pass(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Pass, message)
    }

    /// Check with a warning
    pub fn warn(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Warn, message)
    }

    /// Failing check
    pub fn fail(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Fail, message)
    }

    /// Check that did not apply
    pub fn skip(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Skip, message)
    }
}

/// Condensed view of recent log lines
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogSummary {
    /// Lines examined
    pub lines: usize,
    /// Lines that look like errors
    pub errors: usize,
    /// Lines that look like warnings
    pub warnings: usize,
    /// Most recent error line
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Last few lines verbatim
    pub tail: Vec<String>,
}

/// Details of `start`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartDetails {
    /// Handle of the running instance
    pub resource: ResourceId,
    /// True when an already running instance was adopted
    pub adopted: bool,
    /// Where the service can be reached
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

/// Details of `stop`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopDetails {
    /// Handle of the instance that was stopped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceId>,
    /// True when nothing was running
    pub already_stopped: bool,
}

/// Details of `check`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckDetails {
    /// Live status reported by the platform
    pub status: LiveStatus,
    /// Aggregated health
    pub health_status: HealthState,
    /// Individual checks
    pub checks: Vec<HealthCheckEntry>,
    /// Whether the state record agrees with the platform
    pub state_verified: bool,
    /// Why it does not
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drift: Option<DriftReason>,
    /// True when a stale record was deleted
    pub record_deleted: bool,
    /// Live handle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceId>,
    /// Where the service can be reached
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Recent logs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<LogSummary>,
    /// Last time this invocation saw the service running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_running: Option<DateTime<Utc>>,
}

/// Details of `restart`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartDetails {
    /// Result of the stop step
    pub stop: Box<OperationResult>,
    /// Result of the start step, absent when the stop failure was terminal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<Box<OperationResult>>,
    /// Pause between the steps
    pub grace_ms: u64,
}

/// Details of `update`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDetails {
    /// Version before the update, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_version: Option<String>,
    /// Version after the update
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Time the service was unavailable
    pub downtime_ms: u64,
    /// New handle when the update replaced the instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceId>,
}

/// Details of `provision`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionDetails {
    /// Resources created or confirmed
    pub resources: Vec<String>,
}

/// Details of `publish`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishDetails {
    /// Where the assets went
    pub destination: String,
}

/// Details of `backup`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupDetails {
    /// Path or snapshot id of the backup
    pub artifact: String,
}

/// Details of `restore`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreDetails {
    /// Path or snapshot id that was restored
    pub artifact: String,
}

/// Details of `exec` and `test`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecDetails {
    /// Command that ran
    pub command: Vec<String>,
    /// Exit code, absent when killed by a signal
    pub exit_code: Option<i32>,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
}

impl ExecDetails {
    /// True when the command exited with code 0
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Details of `destroy`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestroyDetails {
    /// Resources removed
    pub resources: Vec<String>,
}

/// Operation-specific part of a result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum OperationDetails {
    /// Nothing specific: dry-run, failure or skip
    #[default]
    None,
    /// `start`
    Start(StartDetails),
    /// `stop`
    Stop(StopDetails),
    /// `check`
    Check(CheckDetails),
    /// `restart`
    Restart(RestartDetails),
    /// `update`
    Update(UpdateDetails),
    /// `provision`
    Provision(ProvisionDetails),
    /// `publish`
    Publish(PublishDetails),
    /// `backup`
    Backup(BackupDetails),
    /// `restore`
    Restore(RestoreDetails),
    /// `exec`
    Exec(ExecDetails),
    /// `test`
    Test(ExecDetails),
    /// `destroy`
    Destroy(DestroyDetails),
}

/// Result of one operation on one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    /// Operation performed
    pub operation: Operation,
    /// Service name
    pub service: String,
    /// Target the service is deployed to
    pub deployment: DeploymentTarget,
    /// Environment name
    pub environment: String,
    /// When the operation started
    pub timestamp: DateTime<Utc>,
    /// How long it took
    pub duration_ms: u64,
    /// Whether it succeeded
    pub success: bool,
    /// Status word
    pub status: ResultStatus,
    /// Captured error message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set when nothing was done because of dry-run
    pub dry_run: bool,
    /// Operation-specific fields
    #[serde(default)]
    pub details: OperationDetails,
    /// Non-fatal problems
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// Known ways forward after a refusal
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recommendations: Vec<String>,
}

impl OperationResult {
    /// Empty successful result for the given service
    pub fn new(
        operation: Operation,
        service: impl Into<String>,
        deployment: DeploymentTarget,
        environment: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            service: service.into(),
            deployment,
            environment: environment.into(),
            timestamp: Utc::now(),
            duration_ms: 0,
            success: true,
            status: ResultStatus::Completed,
            error: None,
            dry_run: false,
            details: OperationDetails::None,
            warnings: Vec::new(),
            recommendations: Vec::new(),
        }
    }

    /// Mark this result failed with the given message
    pub fn fail(mut self, message: impl Into<String>) -> Self {
        self.success = false;
        self.status = ResultStatus::Failed;
        self.error = Some(message.into());
        self
    }

    /// Result for a service that was never attempted
    pub fn skipped(
        operation: Operation,
        service: impl Into<String>,
        deployment: DeploymentTarget,
        environment: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        let mut result = Self::new(operation, service, deployment, environment).fail(reason);
        result.status = ResultStatus::Skipped;
        result
    }

    /// Health signal carried by this result, if any
    pub fn health(&self) -> Option<HealthState> {
        match &self.details {
            OperationDetails::Check(check) => Some(check.health_status),
            OperationDetails::Restart(restart) => {
                restart.start.as_ref().and_then(|start| start.health())
            }
            _ => None,
        }
    }
}

/// Summary counts of a fleet command
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    /// Services targeted
    pub total: usize,
    /// Succeeded and healthy (or no health signal)
    pub succeeded: usize,
    /// Failed, or unhealthy
    pub failed: usize,
    /// Succeeded but degraded
    pub warnings: usize,
}

impl Summary {
    /// Count results by the aggregation rule
    pub fn from_results(results: &[OperationResult]) -> Self {
        let mut summary = Summary {
            total: results.len(),
            ..Summary::default()
        };
        for result in results {
            let health = result.health();
            if !result.success || health == Some(HealthState::Unhealthy) {
                summary.failed += 1;
            } else if health == Some(HealthState::Degraded) {
                summary.warnings += 1;
            } else if health.is_none() || health == Some(HealthState::Healthy) {
                summary.succeeded += 1;
            }
        }
        summary
    }
}

/// Who ran a fleet command, and how
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    /// User name
    pub user: String,
    /// Working directory
    pub working_directory: String,
    /// Whether the command was a dry-run
    pub dry_run: bool,
}

/// Everything one fleet command produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResults {
    /// Command name
    pub command: String,
    /// Environment name
    pub environment: String,
    /// When the command started
    pub timestamp: DateTime<Utc>,
    /// How long it took
    pub duration_ms: u64,
    /// Per-service results, in execution order
    pub results: Vec<OperationResult>,
    /// Counts
    pub summary: Summary,
    /// Invocation context
    pub context: ExecutionContext,
}

impl CommandResults {
    /// Whether any service failed
    pub fn has_failures(&self) -> bool {
        self.summary.failed > 0
    }
}
