//! Process strategy: services that run as local OS processes.
//!
//! Processes are started detached with their output in
//! `<log_dir>/<environment>/<service>.log`, so they outlive the invocation
//! that started them. Liveness comes from the listening port when one is
//! configured, and from the recorded process id otherwise.

use super::{HealthReport, Observation, PlatformStrategy, exec_details, run_local};
use crate::config::{DeploymentTarget, RunConfig};
use crate::context::ServiceContext;
use crate::health::HealthChecker;
use crate::logs::tail_file;
use crate::result::{
    BackupDetails, DestroyDetails, ExecDetails, HealthCheckEntry, Operation, ProvisionDetails,
    RestoreDetails, StartDetails, StopDetails, UpdateDetails,
};
use crate::state::ResourceId;
use crate::{Error, Result};
use async_trait::async_trait;
use command_executor::{Command, Runner};
use smol::Timer;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const LOCALHOST: &str = "127.0.0.1";
const POLL: Duration = Duration::from_millis(250);
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Strategy for local OS processes
pub struct ProcessStrategy {
    runner: Arc<dyn Runner>,
    checker: HealthChecker,
    startup_timeout: Duration,
}

impl ProcessStrategy {
    /// Strategy running commands through `runner`
    pub fn new(runner: Arc<dyn Runner>, config: &RunConfig) -> Self {
        Self {
            runner,
            checker: HealthChecker::new(config.http_timeout),
            startup_timeout: config.startup_timeout,
        }
    }

    fn endpoint(port: Option<u16>) -> Option<String> {
        port.map(|port| format!("http://{}:{}", LOCALHOST, port))
    }

    /// `kill` target for `pid`: its whole process group when it leads one
    async fn signal_target(&self, pid: u32) -> String {
        match self.process_group(pid).await {
            Some(pgid) if pgid == pid => format!("-{}", pid),
            _ => pid.to_string(),
        }
    }

    /// Process group of `pid`, when `ps` can tell
    async fn process_group(&self, pid: u32) -> Option<u32> {
        let mut cmd = Command::new("ps");
        cmd.args(["-o", "pgid=", "-p"]).arg(pid.to_string());
        match self.runner.output(&cmd).await {
            Ok(output) if output.success() => output.stdout.trim().parse().ok(),
            _ => None,
        }
    }

    fn kill(signal: &str, target: &str) -> Command {
        let mut cmd = Command::new("kill");
        cmd.arg(format!("-{}", signal));
        if target.starts_with('-') {
            cmd.arg("--");
        }
        cmd.arg(target);
        cmd
    }

    async fn alive(&self, target: &str) -> bool {
        matches!(self.runner.output(&Self::kill("0", target)).await, Ok(output) if output.success())
    }

    async fn signal(&self, target: &str, signal: &str) -> Result<()> {
        let output = self.runner.output(&Self::kill(signal, target)).await?;
        if !output.success() && self.alive(target).await {
            return Err(Error::Transient(format!(
                "kill -{} {} failed: {}",
                signal,
                target,
                output.failure_message()
            )));
        }
        Ok(())
    }

    /// Wait for `port` to stop accepting connections after a stop
    async fn wait_for_release(&self, ctx: &ServiceContext, pid: u32, port: u16) -> Result<()> {
        let deadline = Instant::now() + self.startup_timeout;
        while self.checker.tcp_probe(LOCALHOST, port).await {
            if Instant::now() >= deadline {
                let holder = match self.listening_pid(port).await {
                    Some(holder) => format!("pid {}", holder),
                    None => "an unknown process".to_string(),
                };
                return Err(Error::Transient(format!(
                    "{} (pid {}) was signalled but port {} is still held by {}",
                    ctx.service(),
                    pid,
                    port,
                    holder
                )));
            }
            Timer::after(POLL).await;
        }
        Ok(())
    }

    /// Process id of whatever listens on `port`, when `lsof` can tell
    async fn listening_pid(&self, port: u16) -> Option<u32> {
        let mut cmd = Command::new("lsof");
        cmd.args(["-t", "-sTCP:LISTEN"]).arg(format!("-iTCP:{}", port));
        match self.runner.output(&cmd).await {
            Ok(output) if output.success() => output
                .stdout
                .lines()
                .find_map(|line| line.trim().parse().ok()),
            Ok(_) => None,
            Err(e) => {
                debug!("Cannot resolve listener of port {}: {}", port, e);
                None
            }
        }
    }

    async fn wait_for_port(&self, ctx: &ServiceContext, pid: u32, port: u16) -> Result<()> {
        let deadline = Instant::now() + self.startup_timeout;
        loop {
            if self.checker.tcp_probe(LOCALHOST, port).await {
                return Ok(());
            }
            if !self.alive(&pid.to_string()).await {
                return Err(Error::Transient(format!(
                    "{} (pid {}) exited before opening port {}; see {}",
                    ctx.service(),
                    pid,
                    port,
                    ctx.log_file().display()
                )));
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "{} did not open port {} within {}s",
                    ctx.service(),
                    port,
                    self.startup_timeout.as_secs()
                )));
            }
            Timer::after(POLL).await;
        }
    }

    async fn copy_tree(&self, from: &Path, to: &Path) -> Result<()> {
        smol::fs::create_dir_all(to).await?;
        let mut cmd = Command::new("cp");
        cmd.arg("-a").arg(from.join(".")).arg(to);
        let output = self.runner.output(&cmd).await?;
        if !output.success() {
            return Err(Error::Transient(format!(
                "copying {} to {} failed: {}",
                from.display(),
                to.display(),
                output.failure_message()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl PlatformStrategy for ProcessStrategy {
    fn target(&self) -> DeploymentTarget {
        DeploymentTarget::Process
    }

    async fn start(&self, ctx: &ServiceContext) -> Result<StartDetails> {
        let port = ctx.port();

        if let Some(port) = port {
            if self.checker.tcp_probe(LOCALHOST, port).await {
                let resource = match ctx.load_state().await? {
                    Some(record) => record.resource_id,
                    None => ResourceId {
                        pid: self.listening_pid(port).await,
                        port: Some(port),
                        ..ResourceId::default()
                    },
                };
                info!(
                    "Adopting {} already listening on port {}",
                    ctx.service(),
                    port
                );
                return Ok(StartDetails {
                    resource,
                    adopted: true,
                    endpoint: Self::endpoint(Some(port)),
                });
            }
        }

        let Ok(command) = ctx.require_command() else {
            let mut steps = vec![format!("Start {} by hand", ctx.service())];
            if let Some(port) = port {
                steps.push(format!("Make it listen on port {}", port));
            }
            steps.push(format!(
                "Set 'command' for {} so it can be started automatically",
                ctx.service()
            ));
            return Err(Error::unsupported(
                Operation::Start,
                DeploymentTarget::Process,
                "no command configured",
            )
            .with_recommendations(steps));
        };

        let (program, args) = command
            .split_first()
            .ok_or_else(|| Error::Config("empty command".to_string()))?;
        let mut cmd = Command::new(program);
        cmd.args(args).envs(ctx.env_vars()).log_file(ctx.log_file());
        if let Some(port) = port {
            cmd.env("PORT", port.to_string());
        }
        if let Some(dir) = &ctx.settings().working_dir {
            cmd.current_dir(dir);
        }

        let pid = self.runner.spawn_detached(&cmd).await?;
        info!("Started {} as pid {}", ctx.service(), pid);

        if let Some(port) = port {
            self.wait_for_port(ctx, pid, port).await?;
        }

        Ok(StartDetails {
            resource: ResourceId::process(pid, port),
            adopted: false,
            endpoint: Self::endpoint(port),
        })
    }

    async fn stop(&self, ctx: &ServiceContext) -> Result<StopDetails> {
        let port = ctx.port();
        let recorded = ctx.load_state().await?.and_then(|r| r.resource_id.pid);
        let pid = match (recorded, port) {
            (Some(pid), _) => Some(pid),
            (None, Some(port)) => self.listening_pid(port).await,
            (None, None) => None,
        };

        let Some(pid) = pid else {
            if let Some(port) = port {
                if self.checker.tcp_probe(LOCALHOST, port).await {
                    return Err(Error::unsupported(
                        Operation::Stop,
                        DeploymentTarget::Process,
                        format!("no process id known for the listener on port {}", port),
                    )
                    .with_recommendations([format!(
                        "Stop the process listening on port {} by hand",
                        port
                    )]));
                }
            }
            return Ok(StopDetails {
                resource: None,
                already_stopped: true,
            });
        };

        let resource = ResourceId::process(pid, port);
        let target = self.signal_target(pid).await;
        if !self.alive(&target).await {
            return Ok(StopDetails {
                resource: Some(resource),
                already_stopped: true,
            });
        }

        self.signal(&target, "TERM").await?;
        let deadline = Instant::now() + STOP_GRACE;
        while self.alive(&target).await {
            if Instant::now() >= deadline {
                warn!(
                    "{} (kill target {}) ignored SIGTERM for {}s, killing",
                    ctx.service(),
                    target,
                    STOP_GRACE.as_secs()
                );
                self.signal(&target, "KILL").await?;
                break;
            }
            Timer::after(POLL).await;
        }

        if let Some(port) = port {
            self.wait_for_release(ctx, pid, port).await?;
        }

        info!("Stopped {} (pid {})", ctx.service(), pid);
        Ok(StopDetails {
            resource: Some(resource),
            already_stopped: false,
        })
    }

    async fn observe(&self, ctx: &ServiceContext) -> Result<Observation> {
        let recorded = ctx.load_state().await?.and_then(|r| r.resource_id.pid);
        let recorded_alive = match recorded {
            Some(pid) => self.alive(&pid.to_string()).await,
            None => false,
        };

        let Some(port) = ctx.port() else {
            return Ok(match recorded {
                Some(pid) if recorded_alive => Observation::running(ResourceId::process(pid, None))
                    .with_check(HealthCheckEntry::pass("process-alive", format!("pid {}", pid))),
                Some(pid) => Observation::stopped().with_check(HealthCheckEntry::fail(
                    "process-alive",
                    format!("pid {} is not running", pid),
                )),
                None => Observation::stopped()
                    .with_check(HealthCheckEntry::fail("process-alive", "no process recorded")),
            });
        };

        if !self.checker.tcp_probe(LOCALHOST, port).await {
            return Ok(Observation::stopped().with_check(HealthCheckEntry::fail(
                "port-open",
                format!("nothing listening on port {}", port),
            )));
        }

        // A listener forked by the recorded process (wrapper scripts, npm)
        // shares its process group and counts as the same instance.
        let live_pid = match (self.listening_pid(port).await, recorded) {
            (Some(live), Some(pid)) if live != pid => {
                match self.process_group(live).await {
                    Some(pgid) if pgid == pid => Some(pid),
                    _ => Some(live),
                }
            }
            (Some(live), _) => Some(live),
            (None, _) => recorded.filter(|_| recorded_alive),
        };
        let mut observation = Observation::running(ResourceId {
            pid: live_pid,
            port: Some(port),
            ..ResourceId::default()
        })
        .with_endpoint(Self::endpoint(Some(port)))
        .with_check(HealthCheckEntry::pass(
            "port-open",
            format!("port {} accepting connections", port),
        ));

        if let Some(pid) = recorded {
            observation = observation.with_check(if recorded_alive {
                HealthCheckEntry::pass("process-alive", format!("pid {}", pid))
            } else {
                HealthCheckEntry::warn("process-alive", format!("recorded pid {} is gone", pid))
            });
        }
        Ok(observation)
    }

    async fn health(&self, ctx: &ServiceContext, _observation: &Observation) -> Result<HealthReport> {
        let check = match (ctx.port(), ctx.settings().health_path.as_deref()) {
            (Some(port), Some(path)) => {
                self.checker
                    .http_probe(LOCALHOST, port, path)
                    .await
                    .to_check("http")
            }
            (Some(_), None) => HealthCheckEntry::skip("http", "no health path configured"),
            (None, _) => HealthCheckEntry::skip("http", "no port configured"),
        };
        Ok(HealthReport::single(check))
    }

    async fn logs(&self, ctx: &ServiceContext, lines: usize) -> Result<Vec<String>> {
        let mut paths: Vec<PathBuf> = vec![ctx.log_file()];
        paths.extend(ctx.settings().log_paths.iter().cloned());

        let mut collected = Vec::new();
        for path in &paths {
            collected.extend(tail_file(path, lines).await?);
        }
        let skip = collected.len().saturating_sub(lines);
        Ok(collected.split_off(skip))
    }

    async fn update(&self, ctx: &ServiceContext, version: Option<&str>) -> Result<UpdateDetails> {
        let command = ctx.settings().update_command.clone();
        if command.is_empty() {
            return Err(Error::unsupported(
                Operation::Update,
                DeploymentTarget::Process,
                "no update command configured",
            )
            .with_recommendations([
                format!("Stop {} with 'fleetctl stop {}'", ctx.service(), ctx.service()),
                "Replace the binary or checkout".to_string(),
                format!("Start it again with 'fleetctl start {}'", ctx.service()),
            ]));
        }

        let version = version
            .map(str::to_string)
            .or_else(|| ctx.settings().version.clone());
        let mut extra = Vec::new();
        if let Some(version) = &version {
            extra.push(("VERSION", version.clone()));
        }

        let output = run_local(self.runner.as_ref(), ctx, &command, &extra).await?;
        if !output.success() {
            return Err(Error::Transient(format!(
                "update command failed: {}",
                output.failure_message()
            )));
        }

        let previous_version = ctx
            .load_state()
            .await?
            .and_then(|record| record.metadata.get("version").cloned());

        let mut details = UpdateDetails {
            previous_version,
            version,
            downtime_ms: 0,
            resource: None,
        };

        // A running process picks up the new code only after a restart
        if self.observe(ctx).await?.status == crate::drift::LiveStatus::Running {
            let down = Instant::now();
            self.stop(ctx).await?;
            let started = self.start(ctx).await?;
            details.downtime_ms = down.elapsed().as_millis() as u64;
            details.resource = Some(started.resource);
        }
        Ok(details)
    }

    async fn provision(&self, ctx: &ServiceContext) -> Result<ProvisionDetails> {
        let mut dirs: Vec<PathBuf> = Vec::new();
        if let Some(path) = &ctx.settings().storage_path {
            dirs.push(path.clone());
        }
        dirs.extend(
            ctx.requirements()
                .storage
                .iter()
                .map(|volume| PathBuf::from(&volume.path)),
        );
        if let Some(parent) = ctx.log_file().parent() {
            dirs.push(parent.to_path_buf());
        }

        let mut resources = Vec::new();
        for dir in dirs {
            smol::fs::create_dir_all(&dir).await?;
            resources.push(dir.display().to_string());
        }
        Ok(ProvisionDetails { resources })
    }

    async fn backup(&self, ctx: &ServiceContext) -> Result<BackupDetails> {
        let storage = ctx.require_storage_path()?;
        let target = ctx.new_backup_path();
        self.copy_tree(&storage, &target).await?;
        info!("Backed up {} to {}", ctx.service(), target.display());
        Ok(BackupDetails {
            artifact: target.display().to_string(),
        })
    }

    async fn restore(&self, ctx: &ServiceContext, artifact: Option<&str>) -> Result<RestoreDetails> {
        let storage = ctx.require_storage_path()?;
        let source = match artifact {
            Some(artifact) => PathBuf::from(artifact),
            None => ctx.latest_backup().await?.ok_or_else(|| {
                Error::Config(format!("no backups of {} to restore", ctx.service()))
            })?,
        };
        self.copy_tree(&source, &storage).await?;
        info!("Restored {} from {}", ctx.service(), source.display());
        Ok(RestoreDetails {
            artifact: source.display().to_string(),
        })
    }

    async fn exec(&self, ctx: &ServiceContext, command: &[String]) -> Result<ExecDetails> {
        let output = run_local(self.runner.as_ref(), ctx, command, &[]).await?;
        Ok(exec_details(command, output))
    }

    async fn test(&self, ctx: &ServiceContext) -> Result<ExecDetails> {
        let command = ctx.require_test_command()?.to_vec();
        let mut extra = Vec::new();
        if let Some(endpoint) = Self::endpoint(ctx.port()) {
            extra.push(("SERVICE_URL", endpoint));
        }
        let output = run_local(self.runner.as_ref(), ctx, &command, &extra).await?;
        Ok(exec_details(&command, output))
    }

    async fn destroy(&self, ctx: &ServiceContext) -> Result<DestroyDetails> {
        let stopped = self.stop(ctx).await?;
        let mut resources = Vec::new();
        if let Some(resource) = stopped.resource {
            resources.push(resource.describe());
        }

        let log = ctx.log_file();
        match smol::fs::remove_file(&log).await {
            Ok(()) => resources.push(log.display().to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(DestroyDetails { resources })
    }
}
