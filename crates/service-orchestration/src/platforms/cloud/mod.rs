//! Cloud strategy for services on managed infrastructure.
//!
//! Each service has its own stack, `<prefix><LogicalName>-<environment>`.
//! Writes (deploy, scale, update, destroy) go through the infrastructure
//! tool and then poll the stack until it settles. Reads go straight to the
//! provider through [`CloudApi`], using identifiers from the outputs file.

pub mod api;
pub mod iac;
pub mod outputs;

pub use api::{AwsCli, CloudApi, ResourceStatus, StackProgress};
pub use iac::{IacTool, StackAction, StackRequest};
pub use outputs::{OutputKind, StackOutputs};

use super::{HealthReport, Observation, PlatformStrategy, exec_details, run_local};
use crate::config::{CloudSettings, DeploymentTarget, RunConfig, ServiceKind};
use crate::context::ServiceContext;
use crate::health::{HealthChecker, parse_endpoint};
use crate::result::{
    BackupDetails, DestroyDetails, ExecDetails, HealthCheckEntry, HealthState, Operation,
    ProvisionDetails, PublishDetails, RestoreDetails, StartDetails, StopDetails, UpdateDetails,
};
use crate::state::ResourceId;
use crate::{Error, Result};
use api::{instance_health, service_health, stack_progress};
use async_trait::async_trait;
use chrono::Utc;
use command_executor::Runner;
use smol::Timer;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// How a service kind is hosted in the cloud
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    ContainerService,
    Database,
    FileSystem,
    StaticSite,
}

impl Family {
    fn of(kind: ServiceKind) -> Self {
        match kind {
            ServiceKind::Database => Family::Database,
            ServiceKind::Filesystem => Family::FileSystem,
            ServiceKind::WebFrontend => Family::StaticSite,
            ServiceKind::ApiBackend | ServiceKind::BackgroundAgent | ServiceKind::Gateway => {
                Family::ContainerService
            }
        }
    }
}

fn status_check(word: &str, health: HealthState) -> HealthCheckEntry {
    match health {
        HealthState::Healthy => HealthCheckEntry::pass("cloud-status", word),
        HealthState::Degraded => HealthCheckEntry::warn("cloud-status", word),
        HealthState::Unhealthy => HealthCheckEntry::fail("cloud-status", word),
        HealthState::Unknown => {
            HealthCheckEntry::warn("cloud-status", format!("unrecognized status {}", word))
        }
    }
}

/// Strategy for managed cloud infrastructure
pub struct CloudStrategy {
    runner: Arc<dyn Runner>,
    api: Arc<dyn CloudApi>,
    iac: IacTool,
    settings: CloudSettings,
    checker: HealthChecker,
}

impl CloudStrategy {
    /// Strategy using `api` for reads and the configured tool for writes
    pub fn new(runner: Arc<dyn Runner>, api: Arc<dyn CloudApi>, config: &RunConfig) -> Self {
        let settings = config.cloud.clone();
        let iac = IacTool::new(
            runner.clone(),
            settings.iac_binary.clone(),
            settings.outputs_file.clone(),
            settings.stack_timeout,
        );
        Self {
            runner,
            api,
            iac,
            settings,
            checker: HealthChecker::new(config.http_timeout),
        }
    }

    /// Strategy driving the provider CLI
    pub fn from_config(runner: Arc<dyn Runner>, config: &RunConfig) -> Self {
        let api = Arc::new(AwsCli::new(runner.clone(), config.cloud.cli_binary.clone()));
        Self::new(runner, api, config)
    }

    /// Stack holding a service's resources
    pub fn stack_name(&self, kind: ServiceKind, environment: &str) -> String {
        format!(
            "{}{}-{}",
            self.settings.stack_prefix,
            kind.pascal_case(),
            environment
        )
    }

    fn stack(&self, ctx: &ServiceContext) -> String {
        self.stack_name(ctx.kind(), ctx.environment())
    }

    async fn outputs(&self) -> Result<StackOutputs> {
        StackOutputs::load(self.iac.outputs_file()).await
    }

    fn resource(outputs: &StackOutputs, stack: &str, kind: ServiceKind) -> ResourceId {
        let arn = outputs
            .lookup(stack, kind, OutputKind::Arn)
            .or_else(|| outputs.lookup(stack, kind, OutputKind::Id));
        ResourceId {
            arn: arn.map(str::to_string),
            endpoint: outputs
                .lookup(stack, kind, OutputKind::Url)
                .map(str::to_string),
            ..ResourceId::default()
        }
    }

    fn output<'a>(
        outputs: &'a StackOutputs,
        stack: &str,
        kind: ServiceKind,
        output: OutputKind,
    ) -> Result<&'a str> {
        outputs.lookup(stack, kind, output).ok_or_else(|| {
            Error::Transient(format!(
                "no {}{} in the infrastructure outputs; provision the stack first",
                kind.pascal_case(),
                output.suffix()
            ))
        })
    }

    /// Deploy or destroy and poll the stack until it settles
    async fn apply(&self, region: &str, request: StackRequest<'_>) -> Result<()> {
        self.iac.run(&request).await?;

        let stack = request.stack;
        let deadline = Instant::now() + self.settings.stack_timeout;
        loop {
            let status = self.api.stack_status(region, stack).await?;
            match (request.action, status.as_deref()) {
                (StackAction::Destroy, None) | (StackAction::Destroy, Some("DELETE_COMPLETE")) => {
                    return Ok(());
                }
                (StackAction::Deploy, None) => {
                    return Err(Error::Transient(format!(
                        "stack {} does not exist after deploy",
                        stack
                    )));
                }
                (action, Some(status)) => match stack_progress(status) {
                    StackProgress::Complete if action == StackAction::Deploy => return Ok(()),
                    StackProgress::Failed => {
                        return Err(Error::Transient(format!(
                            "stack {} ended in {}",
                            stack, status
                        )));
                    }
                    _ => debug!("Stack {} is {}", stack, status),
                },
            }

            if Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "stack {} did not settle within {}s",
                    stack,
                    self.settings.stack_timeout.as_secs()
                )));
            }
            Timer::after(self.settings.poll_interval).await;
        }
    }

    fn unsupported(ctx: &ServiceContext, operation: Operation, reason: &str) -> Error {
        Error::unsupported(operation, ctx.deployment(), reason.to_string())
    }
}

#[async_trait]
impl PlatformStrategy for CloudStrategy {
    fn target(&self) -> DeploymentTarget {
        DeploymentTarget::Cloud
    }

    async fn start(&self, ctx: &ServiceContext) -> Result<StartDetails> {
        let region = ctx.require_region()?;
        let stack = self.stack(ctx);

        let mut request = StackRequest::deploy(&stack, ctx.environment(), ctx.service());
        if Family::of(ctx.kind()) == Family::ContainerService {
            request = request.with("desiredCount", "1");
        }
        if let Some(version) = &ctx.settings().version {
            request = request.with("imageTag", version.clone());
        }
        self.apply(region, request).await?;

        let outputs = self.outputs().await?;
        let resource = Self::resource(&outputs, &stack, ctx.kind());
        info!("Deployed {} as stack {}", ctx.service(), stack);
        Ok(StartDetails {
            endpoint: resource.endpoint.clone(),
            resource,
            adopted: false,
        })
    }

    async fn stop(&self, ctx: &ServiceContext) -> Result<StopDetails> {
        if Family::of(ctx.kind()) != Family::ContainerService {
            return Err(Self::unsupported(
                ctx,
                Operation::Stop,
                "only container services scale to zero; stopping this resource would take its data offline",
            )
            .with_recommendations([
                format!("Use 'fleetctl destroy {}' to tear down the stack", ctx.service()),
                "Stop the instance from the provider console".to_string(),
            ]));
        }

        let region = ctx.require_region()?;
        let stack = self.stack(ctx);
        let request = StackRequest::deploy(&stack, ctx.environment(), ctx.service())
            .with("desiredCount", "0");
        self.apply(region, request).await?;

        let outputs = self.outputs().await?;
        Ok(StopDetails {
            resource: Some(Self::resource(&outputs, &stack, ctx.kind())),
            already_stopped: false,
        })
    }

    async fn observe(&self, ctx: &ServiceContext) -> Result<Observation> {
        let region = ctx.require_region()?;
        let stack = self.stack(ctx);
        let kind = ctx.kind();

        let Some(stack_status) = self.api.stack_status(region, &stack).await? else {
            return Ok(Observation::stopped().with_check(HealthCheckEntry::fail(
                "cloud-stack",
                format!("stack {} does not exist", stack),
            )));
        };

        let outputs = self.outputs().await?;
        let resource = Self::resource(&outputs, &stack, kind);

        let (word, health, running) = match Family::of(kind) {
            Family::StaticSite => {
                let health = match stack_progress(&stack_status) {
                    StackProgress::Complete => HealthState::Healthy,
                    StackProgress::InProgress => HealthState::Degraded,
                    StackProgress::Failed => HealthState::Unhealthy,
                };
                (stack_status.clone(), health, true)
            }
            family => {
                let described = match family {
                    Family::ContainerService => match outputs.lookup(&stack, kind, OutputKind::Arn) {
                        Some(arn) => self.api.describe_service(region, arn).await?,
                        None => None,
                    },
                    Family::Database => match outputs.lookup(&stack, kind, OutputKind::Id) {
                        Some(id) => self.api.describe_database(region, id).await?,
                        None => None,
                    },
                    _ => match outputs.lookup(&stack, kind, OutputKind::Id) {
                        Some(id) => self.api.describe_file_system(region, id).await?,
                        None => None,
                    },
                };

                let Some(described) = described else {
                    return Ok(Observation::unknown()
                        .with_attribute("stackStatus", stack_status)
                        .with_check(HealthCheckEntry::warn(
                            "cloud-resource",
                            format!("no live resource for {} in stack {}", ctx.service(), stack),
                        )));
                };

                if family == Family::ContainerService {
                    let running = described.status != "INACTIVE" && described.desired != Some(0);
                    let health = service_health(&described);
                    let word = format!(
                        "{} ({}/{} tasks)",
                        described.status,
                        described.running.unwrap_or(0),
                        described.desired.unwrap_or(0)
                    );
                    (word, health, running)
                } else {
                    let running = !matches!(described.status.as_str(), "stopped" | "deleted");
                    (described.status.clone(), instance_health(&described.status), running)
                }
            }
        };

        let check = status_check(&word, health);
        let observation = if running {
            Observation::running(resource.clone()).with_endpoint(resource.endpoint)
        } else {
            Observation::stopped()
        };
        Ok(observation
            .with_attribute("stackStatus", stack_status)
            .with_attribute("providerStatus", word)
            .with_check(check))
    }

    async fn health(&self, ctx: &ServiceContext, observation: &Observation) -> Result<HealthReport> {
        let Some(url) = &observation.endpoint else {
            return Ok(HealthReport::single(HealthCheckEntry::skip(
                "http",
                "no endpoint in the infrastructure outputs",
            )));
        };
        let check = match parse_endpoint(url) {
            Some(endpoint) if endpoint.speaks_http() => {
                let path = ctx
                    .settings()
                    .health_path
                    .as_deref()
                    .unwrap_or(&endpoint.path);
                self.checker.get(&endpoint.url_for(path)).await.to_check("http")
            }
            Some(endpoint) => HealthCheckEntry::skip(
                "http",
                format!("{} endpoints are not probed", endpoint.scheme),
            ),
            None => HealthCheckEntry::skip("http", format!("cannot parse endpoint {}", url)),
        };
        Ok(HealthReport::single(check))
    }

    async fn logs(&self, ctx: &ServiceContext, lines: usize) -> Result<Vec<String>> {
        let region = ctx.require_region()?;
        let stack = self.stack(ctx);
        let outputs = self.outputs().await?;
        match outputs.lookup(&stack, ctx.kind(), OutputKind::LogGroup) {
            Some(group) => self.api.tail_logs(region, group, lines).await,
            None => Ok(Vec::new()),
        }
    }

    async fn update(&self, ctx: &ServiceContext, version: Option<&str>) -> Result<UpdateDetails> {
        let region = ctx.require_region()?;
        let version = version
            .map(str::to_string)
            .or_else(|| ctx.settings().version.clone())
            .ok_or_else(|| {
                Error::Config(format!(
                    "updating {} on cloud requires a version",
                    ctx.service()
                ))
            })?;
        let previous_version = ctx
            .load_state()
            .await?
            .and_then(|state| state.metadata.get("version").cloned());

        let stack = self.stack(ctx);
        let request = StackRequest::deploy(&stack, ctx.environment(), ctx.service())
            .with("imageTag", version.clone());
        self.apply(region, request).await?;

        let outputs = self.outputs().await?;
        Ok(UpdateDetails {
            previous_version,
            version: Some(version),
            // Rolling deployment: old tasks serve until new ones are healthy.
            downtime_ms: 0,
            resource: Some(Self::resource(&outputs, &stack, ctx.kind())),
        })
    }

    async fn provision(&self, ctx: &ServiceContext) -> Result<ProvisionDetails> {
        let region = ctx.require_region()?;
        let stack = self.stack(ctx);
        let mut request = StackRequest::deploy(&stack, ctx.environment(), ctx.service());
        if Family::of(ctx.kind()) == Family::ContainerService {
            request = request.with("desiredCount", "0");
        }
        self.apply(region, request).await?;

        let outputs = self.outputs().await?;
        let mut resources = vec![format!("stack {}", stack)];
        resources.extend(outputs.describe(&stack, ctx.kind()));
        Ok(ProvisionDetails { resources })
    }

    async fn publish(&self, ctx: &ServiceContext) -> Result<PublishDetails> {
        if Family::of(ctx.kind()) != Family::StaticSite {
            return Err(Self::unsupported(
                ctx,
                Operation::Publish,
                "only the web frontend publishes static assets",
            ));
        }
        let region = ctx.require_region()?;
        let dir = ctx.settings().publish_dir.clone().ok_or_else(|| {
            Error::Config(format!(
                "{} requires 'publish_dir' for cloud deployments",
                ctx.service()
            ))
        })?;

        let stack = self.stack(ctx);
        let outputs = self.outputs().await?;
        let bucket = Self::output(&outputs, &stack, ctx.kind(), OutputKind::Bucket)?;
        self.api.sync_assets(region, &dir, bucket).await?;

        info!("Published {} to s3://{}", dir.display(), bucket);
        Ok(PublishDetails {
            destination: format!("s3://{}", bucket),
        })
    }

    async fn backup(&self, ctx: &ServiceContext) -> Result<BackupDetails> {
        if Family::of(ctx.kind()) != Family::Database {
            return Err(Self::unsupported(
                ctx,
                Operation::Backup,
                "snapshots are only taken of databases",
            ));
        }
        let region = ctx.require_region()?;
        let stack = self.stack(ctx);
        let outputs = self.outputs().await?;
        let instance = Self::output(&outputs, &stack, ctx.kind(), OutputKind::Id)?;

        let snapshot = format!(
            "{}-{}-{}",
            ctx.service(),
            ctx.environment(),
            Utc::now().format("%Y%m%d%H%M%S")
        );
        self.api.create_snapshot(region, instance, &snapshot).await?;
        info!("Started snapshot {} of {}", snapshot, instance);
        Ok(BackupDetails { artifact: snapshot })
    }

    async fn restore(&self, ctx: &ServiceContext, artifact: Option<&str>) -> Result<RestoreDetails> {
        if Family::of(ctx.kind()) != Family::Database {
            return Err(Self::unsupported(
                ctx,
                Operation::Restore,
                "snapshots are only restored into databases",
            ));
        }
        let region = ctx.require_region()?;
        let stack = self.stack(ctx);
        let outputs = self.outputs().await?;
        let instance = Self::output(&outputs, &stack, ctx.kind(), OutputKind::Id)?;

        let snapshot = match artifact {
            Some(snapshot) => snapshot.to_string(),
            None => self
                .api
                .latest_snapshot(region, instance)
                .await?
                .ok_or_else(|| {
                    Error::Config(format!("no snapshots of {} to restore", instance))
                })?,
        };
        self.api.restore_snapshot(region, instance, &snapshot).await?;
        info!("Restoring {} from snapshot {}", instance, snapshot);
        Ok(RestoreDetails { artifact: snapshot })
    }

    async fn exec(&self, ctx: &ServiceContext, command: &[String]) -> Result<ExecDetails> {
        if Family::of(ctx.kind()) != Family::ContainerService {
            return Err(Self::unsupported(
                ctx,
                Operation::Exec,
                "commands only run inside container services",
            ));
        }
        let region = ctx.require_region()?;
        let stack = self.stack(ctx);
        let outputs = self.outputs().await?;
        let arn = Self::output(&outputs, &stack, ctx.kind(), OutputKind::Arn)?;
        let output = self.api.exec(region, arn, command).await?;
        Ok(exec_details(command, output))
    }

    async fn test(&self, ctx: &ServiceContext) -> Result<ExecDetails> {
        let command = ctx.require_test_command()?.to_vec();
        let stack = self.stack(ctx);
        let outputs = self.outputs().await?;
        let mut extra = Vec::new();
        if let Some(url) = outputs.lookup(&stack, ctx.kind(), OutputKind::Url) {
            extra.push(("SERVICE_URL", url.to_string()));
        }
        let output = run_local(self.runner.as_ref(), ctx, &command, &extra).await?;
        Ok(exec_details(&command, output))
    }

    async fn destroy(&self, ctx: &ServiceContext) -> Result<DestroyDetails> {
        let region = ctx.require_region()?;
        let stack = self.stack(ctx);
        self.apply(
            region,
            StackRequest::destroy(&stack, ctx.environment(), ctx.service()),
        )
        .await?;
        Ok(DestroyDetails {
            resources: vec![format!("stack {}", stack)],
        })
    }
}
