//! Read and data-plane calls against the cloud provider.
//!
//! [`AwsCli`] drives the provider CLI with `--output json` through the
//! command runner. The JSON parsers are free functions so they can be
//! tested on captured payloads.

use crate::result::HealthState;
use crate::{Error, Result};
use async_trait::async_trait;
use command_executor::{Command, Runner};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Provider view of one managed resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceStatus {
    /// Raw provider status word, such as `ACTIVE` or `available`
    pub status: String,
    /// Running tasks, for container services
    pub running: Option<u32>,
    /// Desired tasks, for container services
    pub desired: Option<u32>,
}

/// Progress of an infrastructure stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackProgress {
    /// Still changing
    InProgress,
    /// Settled successfully
    Complete,
    /// Settled in a failed or rolled back state
    Failed,
}

/// Classify a stack status word
pub fn stack_progress(status: &str) -> StackProgress {
    if status.ends_with("_IN_PROGRESS") {
        StackProgress::InProgress
    } else if status.ends_with("_FAILED") || status.contains("ROLLBACK") {
        StackProgress::Failed
    } else {
        StackProgress::Complete
    }
}

/// Health of a container service from its counts
pub fn service_health(status: &ResourceStatus) -> HealthState {
    match status.status.as_str() {
        "ACTIVE" => match (status.running, status.desired) {
            (Some(running), Some(desired)) if desired > 0 && running >= desired => {
                HealthState::Healthy
            }
            (Some(0), Some(_)) => HealthState::Unhealthy,
            (Some(_), Some(_)) => HealthState::Degraded,
            _ => HealthState::Unknown,
        },
        "DRAINING" => HealthState::Degraded,
        "INACTIVE" => HealthState::Unhealthy,
        _ => HealthState::Unknown,
    }
}

/// Health of a database instance or file system from its status word
pub fn instance_health(status: &str) -> HealthState {
    match status {
        "available" => HealthState::Healthy,
        "backing-up" | "modifying" | "maintenance" | "upgrading" | "rebooting"
        | "configuring-enhanced-monitoring" | "creating" | "starting" | "updating" => {
            HealthState::Degraded
        }
        "failed" | "stopped" | "stopping" | "deleting" | "deleted" | "storage-full"
        | "inaccessible-encryption-credentials" | "incompatible-parameters"
        | "incompatible-restore" | "error" => HealthState::Unhealthy,
        _ => HealthState::Unknown,
    }
}

/// Cluster name from a container service ARN
///
/// `arn:aws:ecs:<region>:<account>:service/<cluster>/<service>`
pub fn cluster_from_service_arn(arn: &str) -> Option<&str> {
    let resource = arn.rsplit_once(':')?.1;
    let mut parts = resource.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("service"), Some(cluster), Some(_)) => Some(cluster),
        _ => None,
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EcsServices {
    #[serde(default)]
    services: Vec<EcsService>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EcsService {
    status: String,
    running_count: u32,
    desired_count: u32,
}

/// Parse `ecs describe-services` output
pub fn parse_ecs_services(json: &str) -> Result<Option<ResourceStatus>> {
    let parsed: EcsServices = serde_json::from_str(json)?;
    Ok(parsed.services.into_iter().next().map(|s| ResourceStatus {
        status: s.status,
        running: Some(s.running_count),
        desired: Some(s.desired_count),
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DbInstances {
    #[serde(default, rename = "DBInstances")]
    db_instances: Vec<DbInstance>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DbInstance {
    #[serde(rename = "DBInstanceStatus")]
    db_instance_status: String,
}

/// Parse `rds describe-db-instances` output
pub fn parse_db_instances(json: &str) -> Result<Option<ResourceStatus>> {
    let parsed: DbInstances = serde_json::from_str(json)?;
    Ok(parsed.db_instances.into_iter().next().map(|db| ResourceStatus {
        status: db.db_instance_status,
        running: None,
        desired: None,
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct FileSystems {
    #[serde(default)]
    file_systems: Vec<FileSystem>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct FileSystem {
    life_cycle_state: String,
}

/// Parse `efs describe-file-systems` output
pub fn parse_file_systems(json: &str) -> Result<Option<ResourceStatus>> {
    let parsed: FileSystems = serde_json::from_str(json)?;
    Ok(parsed.file_systems.into_iter().next().map(|fs| ResourceStatus {
        status: fs.life_cycle_state,
        running: None,
        desired: None,
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Stacks {
    #[serde(default)]
    stacks: Vec<Stack>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Stack {
    stack_status: String,
}

/// Parse `cloudformation describe-stacks` output
pub fn parse_stack_status(json: &str) -> Result<Option<String>> {
    let parsed: Stacks = serde_json::from_str(json)?;
    Ok(parsed.stacks.into_iter().next().map(|s| s.stack_status))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogEvents {
    #[serde(default)]
    events: Vec<LogEvent>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogEvent {
    message: String,
}

/// Parse `logs filter-log-events` output, keeping the last `lines` messages
pub fn parse_log_events(json: &str, lines: usize) -> Result<Vec<String>> {
    let parsed: LogEvents = serde_json::from_str(json)?;
    let messages: Vec<String> = parsed
        .events
        .into_iter()
        .map(|e| e.message.trim_end().to_string())
        .collect();
    let skip = messages.len().saturating_sub(lines);
    Ok(messages.into_iter().skip(skip).collect())
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DbSnapshots {
    #[serde(default, rename = "DBSnapshots")]
    db_snapshots: Vec<DbSnapshot>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DbSnapshot {
    #[serde(rename = "DBSnapshotIdentifier")]
    db_snapshot_identifier: String,
    #[serde(default)]
    snapshot_create_time: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

/// Newest available snapshot in `rds describe-db-snapshots` output
pub fn parse_latest_snapshot(json: &str) -> Result<Option<String>> {
    let parsed: DbSnapshots = serde_json::from_str(json)?;
    Ok(parsed
        .db_snapshots
        .into_iter()
        .filter(|s| s.status.as_deref().is_none_or(|status| status == "available"))
        .max_by(|a, b| a.snapshot_create_time.cmp(&b.snapshot_create_time))
        .map(|s| s.db_snapshot_identifier))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskList {
    #[serde(default)]
    task_arns: Vec<String>,
}

/// First task in `ecs list-tasks` output
pub fn parse_first_task(json: &str) -> Result<Option<String>> {
    let parsed: TaskList = serde_json::from_str(json)?;
    Ok(parsed.task_arns.into_iter().next())
}

/// Cloud provider operations the strategy needs
#[async_trait]
pub trait CloudApi: Send + Sync {
    /// Status of a container service, `None` when it does not exist
    async fn describe_service(&self, region: &str, service_arn: &str)
    -> Result<Option<ResourceStatus>>;

    /// Status of a database instance
    async fn describe_database(&self, region: &str, instance: &str)
    -> Result<Option<ResourceStatus>>;

    /// Status of a file system
    async fn describe_file_system(&self, region: &str, id: &str) -> Result<Option<ResourceStatus>>;

    /// Stack status word, `None` when the stack does not exist
    async fn stack_status(&self, region: &str, stack: &str) -> Result<Option<String>>;

    /// Last `lines` messages of a log group
    async fn tail_logs(&self, region: &str, log_group: &str, lines: usize) -> Result<Vec<String>>;

    /// Start a database snapshot
    async fn create_snapshot(&self, region: &str, instance: &str, snapshot: &str) -> Result<()>;

    /// Newest available snapshot of a database instance
    async fn latest_snapshot(&self, region: &str, instance: &str) -> Result<Option<String>>;

    /// Restore a database instance from a snapshot
    async fn restore_snapshot(&self, region: &str, instance: &str, snapshot: &str) -> Result<()>;

    /// Upload a directory to a bucket, deleting stale objects
    async fn sync_assets(&self, region: &str, dir: &Path, bucket: &str) -> Result<()>;

    /// Run a command in a task of a container service
    async fn exec(
        &self,
        region: &str,
        service_arn: &str,
        command: &[String],
    ) -> Result<command_executor::CommandOutput>;
}

/// [`CloudApi`] backed by the provider CLI
pub struct AwsCli {
    runner: Arc<dyn Runner>,
    binary: String,
}

impl AwsCli {
    /// Client invoking `binary` through `runner`
    pub fn new(runner: Arc<dyn Runner>, binary: impl Into<String>) -> Self {
        Self {
            runner,
            binary: binary.into(),
        }
    }

    fn command(&self, region: &str, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args).args(["--region", region, "--output", "json"]);
        cmd
    }

    async fn json(&self, region: &str, args: &[&str]) -> Result<String> {
        let cmd = self.command(region, args);
        let output = self.runner.output(&cmd).await?;
        if !output.success() {
            return Err(Error::Transient(format!(
                "{} failed: {}",
                args.iter().take(2).copied().collect::<Vec<_>>().join(" "),
                output.failure_message()
            )));
        }
        Ok(output.stdout)
    }

    /// Like [`AwsCli::json`] but a not-found error means `None`
    async fn json_if_exists(&self, region: &str, args: &[&str]) -> Result<Option<String>> {
        let cmd = self.command(region, args);
        let output = self.runner.output(&cmd).await?;
        if output.success() {
            return Ok(Some(output.stdout));
        }
        let message = output.failure_message();
        if message.contains("NotFound") || message.contains("does not exist") {
            debug!("{}: {}", args.join(" "), message);
            return Ok(None);
        }
        Err(Error::Transient(format!(
            "{} failed: {}",
            args.iter().take(2).copied().collect::<Vec<_>>().join(" "),
            message
        )))
    }
}

#[async_trait]
impl CloudApi for AwsCli {
    async fn describe_service(
        &self,
        region: &str,
        service_arn: &str,
    ) -> Result<Option<ResourceStatus>> {
        let cluster = cluster_from_service_arn(service_arn).ok_or_else(|| {
            Error::Config(format!("'{}' is not a container service ARN", service_arn))
        })?;
        let json = self
            .json(
                region,
                &["ecs", "describe-services", "--cluster", cluster, "--services", service_arn],
            )
            .await?;
        parse_ecs_services(&json)
    }

    async fn describe_database(
        &self,
        region: &str,
        instance: &str,
    ) -> Result<Option<ResourceStatus>> {
        let args = ["rds", "describe-db-instances", "--db-instance-identifier", instance];
        match self.json_if_exists(region, &args).await? {
            Some(json) => parse_db_instances(&json),
            None => Ok(None),
        }
    }

    async fn describe_file_system(&self, region: &str, id: &str) -> Result<Option<ResourceStatus>> {
        let args = ["efs", "describe-file-systems", "--file-system-id", id];
        match self.json_if_exists(region, &args).await? {
            Some(json) => parse_file_systems(&json),
            None => Ok(None),
        }
    }

    async fn stack_status(&self, region: &str, stack: &str) -> Result<Option<String>> {
        let args = ["cloudformation", "describe-stacks", "--stack-name", stack];
        match self.json_if_exists(region, &args).await? {
            Some(json) => parse_stack_status(&json),
            None => Ok(None),
        }
    }

    async fn tail_logs(&self, region: &str, log_group: &str, lines: usize) -> Result<Vec<String>> {
        // filter-log-events returns the oldest events first; fetch a wider
        // window and keep the tail.
        let limit = (lines.max(1) * 4).min(10_000).to_string();
        let json = self
            .json(
                region,
                &["logs", "filter-log-events", "--log-group-name", log_group, "--limit", &limit],
            )
            .await?;
        parse_log_events(&json, lines)
    }

    async fn create_snapshot(&self, region: &str, instance: &str, snapshot: &str) -> Result<()> {
        self.json(
            region,
            &[
                "rds",
                "create-db-snapshot",
                "--db-instance-identifier",
                instance,
                "--db-snapshot-identifier",
                snapshot,
            ],
        )
        .await?;
        Ok(())
    }

    async fn latest_snapshot(&self, region: &str, instance: &str) -> Result<Option<String>> {
        let json = self
            .json(
                region,
                &["rds", "describe-db-snapshots", "--db-instance-identifier", instance],
            )
            .await?;
        parse_latest_snapshot(&json)
    }

    async fn restore_snapshot(&self, region: &str, instance: &str, snapshot: &str) -> Result<()> {
        self.json(
            region,
            &[
                "rds",
                "restore-db-instance-from-db-snapshot",
                "--db-instance-identifier",
                instance,
                "--db-snapshot-identifier",
                snapshot,
            ],
        )
        .await?;
        Ok(())
    }

    async fn sync_assets(&self, region: &str, dir: &Path, bucket: &str) -> Result<()> {
        let source = dir.display().to_string();
        let destination = format!("s3://{}", bucket);
        self.json(region, &["s3", "sync", &source, &destination, "--delete"])
            .await?;
        Ok(())
    }

    async fn exec(
        &self,
        region: &str,
        service_arn: &str,
        command: &[String],
    ) -> Result<command_executor::CommandOutput> {
        let cluster = cluster_from_service_arn(service_arn).ok_or_else(|| {
            Error::Config(format!("'{}' is not a container service ARN", service_arn))
        })?;
        let json = self
            .json(
                region,
                &["ecs", "list-tasks", "--cluster", cluster, "--service-name", service_arn],
            )
            .await?;
        let task = parse_first_task(&json)?
            .ok_or_else(|| Error::Transient(format!("no running tasks for {}", service_arn)))?;

        let joined = command.join(" ");
        let cmd = self.command(
            region,
            &[
                "ecs",
                "execute-command",
                "--cluster",
                cluster,
                "--task",
                &task,
                "--interactive",
                "--command",
                &joined,
            ],
        );
        Ok(self.runner.output(&cmd).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_progress() {
        assert_eq!(stack_progress("CREATE_IN_PROGRESS"), StackProgress::InProgress);
        assert_eq!(
            stack_progress("UPDATE_COMPLETE_CLEANUP_IN_PROGRESS"),
            StackProgress::InProgress
        );
        assert_eq!(stack_progress("UPDATE_COMPLETE"), StackProgress::Complete);
        assert_eq!(stack_progress("ROLLBACK_COMPLETE"), StackProgress::Failed);
        assert_eq!(stack_progress("UPDATE_ROLLBACK_COMPLETE"), StackProgress::Failed);
        assert_eq!(stack_progress("CREATE_FAILED"), StackProgress::Failed);
    }

    #[test]
    fn test_service_health_from_counts() {
        let status = |word: &str, running, desired| ResourceStatus {
            status: word.to_string(),
            running: Some(running),
            desired: Some(desired),
        };
        assert_eq!(service_health(&status("ACTIVE", 2, 2)), HealthState::Healthy);
        assert_eq!(service_health(&status("ACTIVE", 1, 2)), HealthState::Degraded);
        assert_eq!(service_health(&status("ACTIVE", 0, 2)), HealthState::Unhealthy);
        assert_eq!(service_health(&status("INACTIVE", 0, 0)), HealthState::Unhealthy);
        assert_eq!(service_health(&status("PENDING", 0, 1)), HealthState::Unknown);
    }

    #[test]
    fn test_instance_health() {
        assert_eq!(instance_health("available"), HealthState::Healthy);
        assert_eq!(instance_health("backing-up"), HealthState::Degraded);
        assert_eq!(instance_health("stopped"), HealthState::Unhealthy);
        assert_eq!(instance_health("something-new"), HealthState::Unknown);
    }

    #[test]
    fn test_cluster_from_service_arn() {
        assert_eq!(
            cluster_from_service_arn("arn:aws:ecs:eu-west-1:123456789012:service/fleet-prod/api"),
            Some("fleet-prod")
        );
        assert_eq!(
            cluster_from_service_arn("arn:aws:rds:eu-west-1:123456789012:db:fleet-db"),
            None
        );
    }

    #[test]
    fn test_parse_payloads() {
        let ecs = r#"{"services":[{"status":"ACTIVE","runningCount":1,"desiredCount":2}],"failures":[]}"#;
        let status = parse_ecs_services(ecs).unwrap().unwrap();
        assert_eq!((status.running, status.desired), (Some(1), Some(2)));

        let rds = r#"{"DBInstances":[{"DBInstanceStatus":"available"}]}"#;
        assert_eq!(parse_db_instances(rds).unwrap().unwrap().status, "available");

        let stacks = r#"{"Stacks":[{"StackName":"FleetApiBackend-prod","StackStatus":"UPDATE_COMPLETE"}]}"#;
        assert_eq!(parse_stack_status(stacks).unwrap().as_deref(), Some("UPDATE_COMPLETE"));

        let efs = r#"{"FileSystems":[{"LifeCycleState":"available"}]}"#;
        assert_eq!(parse_file_systems(efs).unwrap().unwrap().status, "available");
    }

    #[test]
    fn test_parse_log_events_keeps_tail() {
        let json = r#"{"events":[{"message":"one\n"},{"message":"two"},{"message":"three"}]}"#;
        assert_eq!(parse_log_events(json, 2).unwrap(), vec!["two", "three"]);
        assert_eq!(parse_log_events(r#"{"events":[]}"#, 5).unwrap().len(), 0);
    }

    #[test]
    fn test_latest_snapshot_skips_unavailable() {
        let json = r#"{"DBSnapshots":[
            {"DBSnapshotIdentifier":"db-1","SnapshotCreateTime":"2024-01-01T00:00:00Z","Status":"available"},
            {"DBSnapshotIdentifier":"db-3","SnapshotCreateTime":"2024-03-01T00:00:00Z","Status":"creating"},
            {"DBSnapshotIdentifier":"db-2","SnapshotCreateTime":"2024-02-01T00:00:00Z","Status":"available"}
        ]}"#;
        assert_eq!(parse_latest_snapshot(json).unwrap().as_deref(), Some("db-2"));
    }
}
