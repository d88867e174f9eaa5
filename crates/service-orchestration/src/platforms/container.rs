//! Container strategy for services run by a local container runtime.
//!
//! Containers are named `<prefix>-<alias>-<environment>` and matched by
//! exact name. A running container under that name is adopted on start; a
//! stopped one is removed and recreated.

use super::{HealthReport, Observation, PlatformStrategy, exec_details};
use crate::config::{DeploymentTarget, RunConfig, ServiceKind};
use crate::context::ServiceContext;
use crate::health::HealthChecker;
use crate::result::{
    BackupDetails, DestroyDetails, ExecDetails, HealthCheckEntry, ProvisionDetails,
    RestoreDetails, StartDetails, StopDetails, UpdateDetails,
};
use crate::state::ResourceId;
use crate::{Error, Result};
use async_trait::async_trait;
use command_executor::{Command, CommandOutput, Runner};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

const LOCALHOST: &str = "127.0.0.1";
const PS_FORMAT: &str = "{{.ID}}|{{.Names}}|{{.State}}|{{.Status}}|{{.Image}}";

/// Short name used for a service kind in container names
///
/// The database alias is kept from existing deployments whose containers
/// are already named after the engine.
pub fn container_alias(kind: ServiceKind) -> &'static str {
    match kind {
        ServiceKind::Database => "postgres",
        other => other.as_str(),
    }
}

/// Container name for a service in an environment
pub fn container_name(
    prefix: &str,
    kind: ServiceKind,
    environment: &str,
    override_name: Option<&str>,
) -> String {
    match override_name {
        Some(name) => name.to_string(),
        None => format!("{}-{}-{}", prefix, container_alias(kind), environment),
    }
}

/// One line of `ps` output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    /// Full container id
    pub id: String,
    /// Container name
    pub name: String,
    /// State word, such as `running` or `exited`
    pub state: String,
    /// Human readable status
    pub status: String,
    /// Image the container runs
    pub image: String,
}

impl ContainerInfo {
    /// Whether the container is running
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

/// Find the container named exactly `name` in `ps` output
pub fn parse_ps(output: &str, name: &str) -> Option<ContainerInfo> {
    output.lines().find_map(|line| {
        let parts: Vec<&str> = line.trim().split('|').collect();
        if parts.len() < 5 {
            return None;
        }
        let names = parts[1];
        if !names.split(',').any(|n| n.trim_start_matches('/') == name) {
            return None;
        }
        Some(ContainerInfo {
            id: parts[0].to_string(),
            name: name.to_string(),
            state: parts[2].to_string(),
            status: parts[3].to_string(),
            image: parts[4].to_string(),
        })
    })
}

/// Tag part of an image reference
fn image_tag(image: &str) -> Option<&str> {
    let last = image.rsplit('/').next().unwrap_or(image);
    last.split_once(':').map(|(_, tag)| tag)
}

/// Strategy driving a container runtime CLI
pub struct ContainerStrategy {
    runner: Arc<dyn Runner>,
    checker: HealthChecker,
    runtime: String,
}

impl ContainerStrategy {
    /// Strategy running `config.container_runtime` through `runner`
    pub fn new(runner: Arc<dyn Runner>, config: &RunConfig) -> Self {
        Self {
            runner,
            checker: HealthChecker::new(config.http_timeout),
            runtime: config.container_runtime.clone(),
        }
    }

    async fn runtime<I, S>(&self, args: I) -> Result<CommandOutput>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut cmd = Command::new(&self.runtime);
        cmd.args(args);
        Ok(self.runner.output(&cmd).await?)
    }

    /// Run and require success
    async fn checked<I, S>(&self, what: &str, args: I) -> Result<CommandOutput>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let output = self.runtime(args).await?;
        if !output.success() {
            return Err(Error::Transient(format!(
                "{} {} failed: {}",
                self.runtime,
                what,
                output.failure_message()
            )));
        }
        Ok(output)
    }

    async fn find(&self, name: &str) -> Result<Option<ContainerInfo>> {
        let filter = format!("name=^/?{}$", name);
        let output = self
            .checked(
                "ps",
                ["ps", "-a", "--no-trunc", "--filter", &filter, "--format", PS_FORMAT],
            )
            .await?;
        Ok(parse_ps(&output.stdout, name))
    }

    fn ports(ctx: &ServiceContext) -> BTreeSet<u16> {
        ctx.port()
            .into_iter()
            .chain(ctx.requirements().ports.iter().copied())
            .collect()
    }

    fn volume_name(ctx: &ServiceContext, volume: &str) -> String {
        format!("{}-{}", ctx.container_name(), volume)
    }

    fn resource(ctx: &ServiceContext, id: &str, name: &str) -> ResourceId {
        ResourceId {
            port: ctx.port(),
            ..ResourceId::container(id, name)
        }
    }

    async fn run_container(&self, ctx: &ServiceContext, name: &str, image: &str) -> Result<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            name.to_string(),
            "--label".to_string(),
            format!("fleetctl.service={}", ctx.service()),
            "--label".to_string(),
            format!("fleetctl.environment={}", ctx.environment()),
        ];
        for port in Self::ports(ctx) {
            args.extend(["-p".to_string(), format!("{}:{}", port, port)]);
        }
        for (key, value) in ctx.env_vars() {
            args.extend(["-e".to_string(), format!("{}={}", key, value)]);
        }
        for volume in &ctx.requirements().storage {
            args.extend([
                "-v".to_string(),
                format!("{}:{}", Self::volume_name(ctx, &volume.name), volume.path),
            ]);
        }
        args.push(image.to_string());
        args.extend(ctx.settings().command.iter().cloned());

        let output = self.checked("run", &args).await?;
        let id = output.stdout_trimmed().to_string();
        info!("Started container {} ({}) for {}", name, short(&id), ctx.service());
        Ok(id)
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.checked("rm", ["rm", "-f", name]).await?;
        Ok(())
    }

    async fn require_container(&self, ctx: &ServiceContext) -> Result<ContainerInfo> {
        let name = ctx.container_name();
        self.find(&name)
            .await?
            .ok_or_else(|| Error::Transient(format!("container {} does not exist", name)))
    }
}

fn short(id: &str) -> &str {
    match id.char_indices().nth(12) {
        Some((end, _)) => &id[..end],
        None => id,
    }
}

#[async_trait]
impl PlatformStrategy for ContainerStrategy {
    fn target(&self) -> DeploymentTarget {
        DeploymentTarget::Container
    }

    async fn start(&self, ctx: &ServiceContext) -> Result<StartDetails> {
        let image = ctx.require_image()?;
        let name = ctx.container_name();
        let endpoint = ctx.port().map(|port| format!("http://{}:{}", LOCALHOST, port));

        if let Some(existing) = self.find(&name).await? {
            if existing.is_running() {
                info!(
                    "Container '{}' is already running (status: {}). Adopting it.",
                    name, existing.status
                );
                return Ok(StartDetails {
                    resource: Self::resource(ctx, &existing.id, &name),
                    adopted: true,
                    endpoint,
                });
            }
            info!(
                "Container '{}' exists but is {} (status: {}). Removing it.",
                name, existing.state, existing.status
            );
            self.remove(&name).await?;
        }

        let id = self.run_container(ctx, &name, image).await?;
        Ok(StartDetails {
            resource: Self::resource(ctx, &id, &name),
            adopted: false,
            endpoint,
        })
    }

    async fn stop(&self, ctx: &ServiceContext) -> Result<StopDetails> {
        let name = ctx.container_name();
        let Some(existing) = self.find(&name).await? else {
            info!("Container {} not found, nothing to stop", name);
            return Ok(StopDetails {
                resource: None,
                already_stopped: true,
            });
        };

        let was_running = existing.is_running();
        if was_running {
            self.checked("stop", ["stop", name.as_str()]).await?;
        }
        self.checked("rm", ["rm", name.as_str()]).await?;
        info!("Stopped and removed container {}", name);

        Ok(StopDetails {
            resource: Some(Self::resource(ctx, &existing.id, &name)),
            already_stopped: !was_running,
        })
    }

    async fn observe(&self, ctx: &ServiceContext) -> Result<Observation> {
        let name = ctx.container_name();
        let observation = match self.find(&name).await? {
            None => Observation::stopped().with_check(HealthCheckEntry::fail(
                "container-running",
                format!("container {} not found", name),
            )),
            Some(info) if !info.is_running() => Observation::stopped().with_check(
                HealthCheckEntry::fail(
                    "container-running",
                    format!("container {} is {} ({})", name, info.state, info.status),
                ),
            ),
            Some(info) => Observation::running(Self::resource(ctx, &info.id, &name))
                .with_endpoint(ctx.port().map(|port| format!("http://{}:{}", LOCALHOST, port)))
                .with_attribute("image", &info.image)
                .with_check(HealthCheckEntry::pass("container-running", info.status)),
        };
        Ok(observation)
    }

    async fn health(&self, ctx: &ServiceContext, _observation: &Observation) -> Result<HealthReport> {
        let check = match ctx.port() {
            Some(port) => {
                let path = ctx.settings().health_path.as_deref().unwrap_or("/");
                self.checker
                    .http_probe(LOCALHOST, port, path)
                    .await
                    .to_check("http")
            }
            None => HealthCheckEntry::skip("http", "no published port"),
        };
        Ok(HealthReport::single(check))
    }

    async fn logs(&self, ctx: &ServiceContext, lines: usize) -> Result<Vec<String>> {
        let name = ctx.container_name();
        let tail = lines.to_string();
        let output = self
            .checked("logs", ["logs", "--tail", tail.as_str(), name.as_str()])
            .await?;
        Ok(output
            .stdout
            .lines()
            .chain(output.stderr.lines())
            .map(str::to_string)
            .collect())
    }

    async fn update(&self, ctx: &ServiceContext, version: Option<&str>) -> Result<UpdateDetails> {
        let configured = ctx.require_image()?;
        let image = match version {
            Some(version) => {
                let repository = match image_tag(configured) {
                    Some(tag) => &configured[..configured.len() - tag.len() - 1],
                    None => configured,
                };
                format!("{}:{}", repository, version)
            }
            None => configured.to_string(),
        };
        let name = ctx.container_name();

        self.checked("pull", ["pull", image.as_str()]).await?;

        let existing = self.find(&name).await?;
        let previous_version = existing
            .as_ref()
            .and_then(|info| image_tag(&info.image).map(str::to_string));

        let down = Instant::now();
        if let Some(existing) = &existing {
            if existing.is_running() {
                self.checked("stop", ["stop", name.as_str()]).await?;
            }
            self.remove(&name).await?;
        }
        let id = self.run_container(ctx, &name, &image).await?;
        let downtime_ms = down.elapsed().as_millis() as u64;

        Ok(UpdateDetails {
            previous_version,
            version: image_tag(&image).map(str::to_string),
            downtime_ms,
            resource: Some(Self::resource(ctx, &id, &name)),
        })
    }

    async fn provision(&self, ctx: &ServiceContext) -> Result<ProvisionDetails> {
        let mut resources = Vec::new();
        for volume in &ctx.requirements().storage {
            let volume_name = Self::volume_name(ctx, &volume.name);
            self.checked("volume create", ["volume", "create", volume_name.as_str()])
                .await?;
            resources.push(format!("volume {}", volume_name));
        }

        let image = ctx.require_image()?;
        self.checked("pull", ["pull", image]).await?;
        resources.push(format!("image {}", image));
        Ok(ProvisionDetails { resources })
    }

    async fn backup(&self, ctx: &ServiceContext) -> Result<BackupDetails> {
        let storage = ctx.require_storage_path()?;
        let container = self.require_container(ctx).await?;
        let target = ctx.new_backup_path();
        smol::fs::create_dir_all(ctx.backup_root()).await?;

        let source = format!("{}:{}", container.name, storage.display());
        let target_arg = target.display().to_string();
        self.checked("cp", ["cp", source.as_str(), target_arg.as_str()])
            .await?;

        info!("Backed up {} to {}", ctx.service(), target.display());
        Ok(BackupDetails { artifact: target_arg })
    }

    async fn restore(&self, ctx: &ServiceContext, artifact: Option<&str>) -> Result<RestoreDetails> {
        let storage = ctx.require_storage_path()?;
        let container = self.require_container(ctx).await?;
        let source = match artifact {
            Some(artifact) => std::path::PathBuf::from(artifact),
            None => ctx.latest_backup().await?.ok_or_else(|| {
                Error::Config(format!("no backups of {} to restore", ctx.service()))
            })?,
        };

        let from = source.join(".").display().to_string();
        let to = format!("{}:{}", container.name, storage.display());
        self.checked("cp", ["cp", from.as_str(), to.as_str()]).await?;
        if container.is_running() {
            self.checked("restart", ["restart", container.name.as_str()])
                .await?;
        }

        info!("Restored {} from {}", ctx.service(), source.display());
        Ok(RestoreDetails {
            artifact: source.display().to_string(),
        })
    }

    async fn exec(&self, ctx: &ServiceContext, command: &[String]) -> Result<ExecDetails> {
        let container = self.require_container(ctx).await?;
        if !container.is_running() {
            return Err(Error::Transient(format!(
                "container {} is not running",
                container.name
            )));
        }
        let mut args = vec!["exec".to_string(), container.name.clone()];
        args.extend(command.iter().cloned());
        let output = self.runtime(&args).await?;
        Ok(exec_details(command, output))
    }

    async fn test(&self, ctx: &ServiceContext) -> Result<ExecDetails> {
        let command = ctx.require_test_command()?.to_vec();
        self.exec(ctx, &command).await
    }

    async fn destroy(&self, ctx: &ServiceContext) -> Result<DestroyDetails> {
        let name = ctx.container_name();
        let mut resources = Vec::new();
        if self.find(&name).await?.is_some() {
            self.remove(&name).await?;
            resources.push(format!("container {}", name));
        }
        for volume in &ctx.requirements().storage {
            let volume_name = Self::volume_name(ctx, &volume.name);
            let output = self.runtime(["volume", "rm", volume_name.as_str()]).await?;
            if output.success() {
                resources.push(format!("volume {}", volume_name));
            } else {
                warn!("Could not remove volume {}: {}", volume_name, output.failure_message());
            }
        }
        Ok(DestroyDetails { resources })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServiceDefinition, StorageVolume};
    use crate::context::OperationRequest;
    use crate::result::{CheckStatus, HealthState, OperationDetails, ResultStatus};
    use crate::state::MemoryStateStore;
    use command_executor::{ScriptedResponse, ScriptedRunner};

    #[test]
    fn test_container_naming() {
        assert_eq!(
            container_name("acme", ServiceKind::Database, "prod", None),
            "acme-postgres-prod"
        );
        assert_eq!(
            container_name("acme", ServiceKind::ApiBackend, "staging", None),
            "acme-api-backend-staging"
        );
        assert_eq!(
            container_name("acme", ServiceKind::Database, "prod", Some("legacy-db")),
            "legacy-db"
        );
    }

    #[test]
    fn test_short_ids_cut_on_char_boundaries() {
        assert_eq!(short("cafebabe0123456789abcdef"), "cafebabe0123");
        assert_eq!(short("cafebabe"), "cafebabe");
        assert_eq!(short("ééééééééééééé"), "éééééééééééé");
    }

    #[test]
    fn test_parse_ps_matches_exact_name() {
        let output = "\
aaa111|acme-postgres-prod-replica|running|Up 2 hours|postgres:16
bbb222|acme-postgres-prod|exited|Exited (0) 5 minutes ago|postgres:15
";
        let info = parse_ps(output, "acme-postgres-prod").unwrap();
        assert_eq!(info.id, "bbb222");
        assert!(!info.is_running());
        assert_eq!(info.image, "postgres:15");

        assert!(parse_ps(output, "acme-postgres").is_none());
        assert!(parse_ps("", "acme-postgres-prod").is_none());
    }

    fn harness(runner: Arc<ScriptedRunner>) -> ServiceContext {
        let config = Arc::new(RunConfig::new("prod"));
        let strategy = Arc::new(ContainerStrategy::new(runner, &config));
        let definition = ServiceDefinition::new(ServiceKind::Database, DeploymentTarget::Container)
            .with_image("postgres:16")
            .with_port(5432);
        ServiceContext::new(
            definition,
            config,
            strategy,
            Arc::new(MemoryStateStore::new()),
        )
    }

    fn ps_line(state: &str) -> ScriptedResponse {
        ScriptedResponse::Output(CommandOutput::ok(format!(
            "0123456789abcdef|fleet-postgres-prod|{}|Up 3 minutes|postgres:16\n",
            state
        )))
    }

    #[test]
    fn test_absent_container_checks_as_stopped_and_unhealthy() {
        smol::block_on(async {
            let runner = Arc::new(ScriptedRunner::new());
            let ctx = harness(runner.clone());

            let result = ctx.check().await;
            assert!(result.success);
            assert_eq!(result.status, ResultStatus::Stopped);
            assert_eq!(result.health(), Some(HealthState::Unhealthy));

            let OperationDetails::Check(details) = &result.details else {
                panic!("expected check details");
            };
            let check = &details.checks[0];
            assert_eq!(check.name, "container-running");
            assert_eq!(check.status, CheckStatus::Fail);
            assert!(runner.called_with(&["ps", "-a"]));
        });
    }

    #[test]
    fn test_start_adopts_running_container() {
        smol::block_on(async {
            let runner = Arc::new(ScriptedRunner::new());
            runner.on(&["ps"], ps_line("running"));
            let ctx = harness(runner.clone());

            let result = ctx.start().await;
            assert!(result.success, "{:?}", result.error);
            let OperationDetails::Start(details) = &result.details else {
                panic!("expected start details");
            };
            assert!(details.adopted);
            assert_eq!(
                details.resource.container_name.as_deref(),
                Some("fleet-postgres-prod")
            );
            assert!(!runner.called_with(&["run"]));

            let record = ctx.load_state().await.unwrap().unwrap();
            assert_eq!(record.metadata.get("adopted").map(String::as_str), Some("true"));
        });
    }

    #[test]
    fn test_start_replaces_stopped_container() {
        smol::block_on(async {
            let runner = Arc::new(ScriptedRunner::new());
            runner.on(&["ps"], ps_line("exited"));
            runner.on(&["run"], ScriptedResponse::Output(CommandOutput::ok("feedface\n")));
            let ctx = harness(runner.clone());

            let result = ctx.start().await;
            assert!(result.success, "{:?}", result.error);
            assert!(runner.called_with(&["rm", "-f", "fleet-postgres-prod"]));
            assert!(runner.called_with(&["-p", "5432:5432"]));
            assert!(runner.called_with(&["--name", "fleet-postgres-prod"]));

            let record = ctx.load_state().await.unwrap().unwrap();
            assert_eq!(record.resource_id.container_id.as_deref(), Some("feedface"));
        });
    }

    #[test]
    fn test_stop_without_container_is_already_stopped() {
        smol::block_on(async {
            let runner = Arc::new(ScriptedRunner::new());
            let ctx = harness(runner.clone());

            let result = ctx.stop().await;
            assert!(result.success);
            let OperationDetails::Stop(details) = &result.details else {
                panic!("expected stop details");
            };
            assert!(details.already_stopped);
            assert!(!runner.called_with(&["stop"]));
        });
    }

    #[test]
    fn test_runtime_failure_becomes_failed_result() {
        smol::block_on(async {
            let runner = Arc::new(ScriptedRunner::new());
            runner.on(
                &["ps"],
                ScriptedResponse::Output(CommandOutput::failed(1, "Cannot connect to the daemon")),
            );
            let ctx = harness(runner);

            let result = ctx.start().await;
            assert!(!result.success);
            assert!(result.error.unwrap().contains("Cannot connect to the daemon"));
            assert!(ctx.load_state().await.unwrap().is_none());
        });
    }

    #[test]
    fn test_provision_creates_volumes_and_pulls_image() {
        smol::block_on(async {
            let runner = Arc::new(ScriptedRunner::new());
            let config = Arc::new(RunConfig::new("prod"));
            let mut definition =
                ServiceDefinition::new(ServiceKind::Database, DeploymentTarget::Container)
                    .with_image("postgres:16");
            definition.requirements.storage.push(StorageVolume {
                name: "pgdata".to_string(),
                path: "/var/lib/postgresql/data".to_string(),
            });
            let ctx = ServiceContext::new(
                definition,
                config.clone(),
                Arc::new(ContainerStrategy::new(runner.clone(), &config)),
                Arc::new(MemoryStateStore::new()),
            );

            let result = ctx.execute(&OperationRequest::Provision).await;
            assert!(result.success, "{:?}", result.error);
            assert!(runner.called_with(&["volume", "create", "fleet-postgres-prod-pgdata"]));
            assert!(runner.called_with(&["pull", "postgres:16"]));
            let OperationDetails::Provision(details) = &result.details else {
                panic!("expected provision details");
            };
            assert_eq!(
                details.resources,
                vec!["volume fleet-postgres-prod-pgdata", "image postgres:16"]
            );
        });
    }

    #[test]
    fn test_update_replaces_container_with_new_tag() {
        smol::block_on(async {
            let runner = Arc::new(ScriptedRunner::new());
            runner.on(&["ps"], ps_line("running"));
            runner.on(&["run"], ScriptedResponse::Output(CommandOutput::ok("cafebabe\n")));
            let ctx = harness(runner.clone());

            let result = ctx
                .execute(&OperationRequest::Update {
                    version: Some("17".to_string()),
                })
                .await;
            assert!(result.success, "{:?}", result.error);
            assert!(runner.called_with(&["pull", "postgres:17"]));
            assert!(runner.called_with(&["stop", "fleet-postgres-prod"]));
            assert!(runner.called_with(&["rm", "-f", "fleet-postgres-prod"]));

            let OperationDetails::Update(details) = &result.details else {
                panic!("expected update details");
            };
            assert_eq!(details.previous_version.as_deref(), Some("16"));
            assert_eq!(details.version.as_deref(), Some("17"));
            assert_eq!(
                details.resource.as_ref().and_then(|r| r.container_id.as_deref()),
                Some("cafebabe")
            );
        });
    }

    #[test]
    fn test_exec_requires_a_running_container() {
        smol::block_on(async {
            let runner = Arc::new(ScriptedRunner::new());
            runner.on(&["ps"], ps_line("exited"));
            let ctx = harness(runner.clone());

            let command = vec!["psql".to_string(), "-l".to_string()];
            let result = ctx.execute(&OperationRequest::Exec { command }).await;
            assert!(!result.success);
            assert_eq!(
                result.error.as_deref(),
                Some("container fleet-postgres-prod is not running")
            );
            assert!(!runner.called_with(&["exec"]));
        });
    }

    #[test]
    fn test_exec_runs_inside_the_container() {
        smol::block_on(async {
            let runner = Arc::new(ScriptedRunner::new());
            runner.on(&["ps"], ps_line("running"));
            runner.on(&["exec"], ScriptedResponse::Output(CommandOutput::ok("postgres\n")));
            let ctx = harness(runner.clone());

            let command = vec!["psql".to_string(), "-l".to_string()];
            let result = ctx.execute(&OperationRequest::Exec { command }).await;
            assert!(result.success, "{:?}", result.error);
            assert!(runner.called_with(&["exec", "fleet-postgres-prod", "psql", "-l"]));
            let OperationDetails::Exec(exec) = &result.details else {
                panic!("expected exec details");
            };
            assert_eq!(exec.exit_code, Some(0));
            assert_eq!(exec.stdout, "postgres\n");
        });
    }

    #[test]
    fn test_image_tag() {
        assert_eq!(image_tag("postgres:16"), Some("16"));
        assert_eq!(image_tag("registry.local:5000/acme/api:1.4.2"), Some("1.4.2"));
        assert_eq!(image_tag("registry.local:5000/acme/api"), None);
    }
}
