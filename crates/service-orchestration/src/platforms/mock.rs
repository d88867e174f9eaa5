//! Deterministic strategy for testing dependent tooling.
//!
//! Every operation succeeds unless a failure was injected for it. Live
//! status follows the persisted record unless a test overrides it, so a
//! `start` in one invocation is visible to a `check` in the next.

use super::{HealthReport, Observation, PlatformStrategy};
use crate::config::DeploymentTarget;
use crate::context::ServiceContext;
use crate::result::{
    BackupDetails, DestroyDetails, ExecDetails, HealthCheckEntry, Operation, ProvisionDetails,
    PublishDetails, RestoreDetails, StartDetails, StopDetails, UpdateDetails,
};
use crate::state::ResourceId;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

type Key = (String, String);

fn key(ctx: &ServiceContext) -> Key {
    (ctx.environment().to_string(), ctx.service().to_string())
}

/// Strategy with no side effects outside this process
#[derive(Debug, Default)]
pub struct MockStrategy {
    failures: Mutex<HashMap<Operation, String>>,
    service_failures: Mutex<HashMap<(Operation, String), String>>,
    running: Mutex<HashMap<Key, bool>>,
    calls: Mutex<Vec<(Operation, String)>>,
}

impl MockStrategy {
    /// Strategy where everything succeeds
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every future call of `operation` fail with `message`
    pub fn fail_on(&self, operation: Operation, message: impl Into<String>) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(operation, message.into());
        }
    }

    /// Make future calls of `operation` on `service` fail with `message`
    pub fn fail_for(&self, service: &str, operation: Operation, message: impl Into<String>) {
        if let Ok(mut failures) = self.service_failures.lock() {
            failures.insert((operation, service.to_string()), message.into());
        }
    }

    /// Remove all injected failures
    pub fn clear_failures(&self) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.clear();
        }
        if let Ok(mut failures) = self.service_failures.lock() {
            failures.clear();
        }
    }

    /// Force the live status of a service, regardless of its record
    pub fn set_running(&self, environment: &str, service: &str, running: bool) {
        if let Ok(mut map) = self.running.lock() {
            map.insert((environment.to_string(), service.to_string()), running);
        }
    }

    /// Every (operation, service) call so far, in order
    pub fn calls(&self) -> Vec<(Operation, String)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Services `operation` was called for, in order
    pub fn attempted(&self, operation: Operation) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|(op, _)| *op == operation)
            .map(|(_, service)| service)
            .collect()
    }

    fn enter(&self, operation: Operation, ctx: &ServiceContext) -> Result<()> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((operation, ctx.service().to_string()));
        }
        let injected = self
            .service_failures
            .lock()
            .ok()
            .and_then(|failures| {
                failures
                    .get(&(operation, ctx.service().to_string()))
                    .cloned()
            })
            .or_else(|| {
                self.failures
                    .lock()
                    .ok()
                    .and_then(|failures| failures.get(&operation).cloned())
            });
        match injected {
            Some(message) => Err(Error::Transient(message)),
            None => Ok(()),
        }
    }

    fn resource(ctx: &ServiceContext) -> ResourceId {
        ResourceId::endpoint(format!("mock://{}/{}", ctx.environment(), ctx.service()))
    }

    fn override_for(&self, ctx: &ServiceContext) -> Option<bool> {
        self.running
            .lock()
            .ok()
            .and_then(|map| map.get(&key(ctx)).copied())
    }

    fn ran(&self, operation: Operation, ctx: &ServiceContext) -> ExecDetails {
        ExecDetails {
            command: vec![format!("mock-{}", operation)],
            exit_code: Some(0),
            stdout: format!("{} ok\n", ctx.service()),
            stderr: String::new(),
        }
    }
}

#[async_trait]
impl PlatformStrategy for MockStrategy {
    fn target(&self) -> DeploymentTarget {
        DeploymentTarget::Mock
    }

    async fn start(&self, ctx: &ServiceContext) -> Result<StartDetails> {
        self.enter(Operation::Start, ctx)?;
        self.set_running(ctx.environment(), ctx.service(), true);
        let resource = Self::resource(ctx);
        Ok(StartDetails {
            endpoint: resource.endpoint.clone(),
            resource,
            adopted: false,
        })
    }

    async fn stop(&self, ctx: &ServiceContext) -> Result<StopDetails> {
        self.enter(Operation::Stop, ctx)?;
        self.set_running(ctx.environment(), ctx.service(), false);
        Ok(StopDetails {
            resource: Some(Self::resource(ctx)),
            already_stopped: false,
        })
    }

    async fn observe(&self, ctx: &ServiceContext) -> Result<Observation> {
        self.enter(Operation::Check, ctx)?;
        let running = match self.override_for(ctx) {
            Some(running) => running,
            None => ctx.load_state().await?.is_some(),
        };
        if running {
            let resource = Self::resource(ctx);
            Ok(Observation::running(resource.clone())
                .with_endpoint(resource.endpoint)
                .with_check(HealthCheckEntry::pass("mock-running", "")))
        } else {
            Ok(Observation::stopped()
                .with_check(HealthCheckEntry::fail("mock-running", "not started")))
        }
    }

    async fn health(&self, _ctx: &ServiceContext, _observation: &Observation) -> Result<HealthReport> {
        Ok(HealthReport::single(HealthCheckEntry::pass("mock-health", "")))
    }

    async fn logs(&self, ctx: &ServiceContext, _lines: usize) -> Result<Vec<String>> {
        Ok(vec![format!("[mock] {} ready", ctx.service())])
    }

    async fn update(&self, ctx: &ServiceContext, version: Option<&str>) -> Result<UpdateDetails> {
        self.enter(Operation::Update, ctx)?;
        Ok(UpdateDetails {
            previous_version: ctx.settings().version.clone(),
            version: Some(version.unwrap_or("mock").to_string()),
            downtime_ms: 0,
            resource: None,
        })
    }

    async fn provision(&self, ctx: &ServiceContext) -> Result<ProvisionDetails> {
        self.enter(Operation::Provision, ctx)?;
        Ok(ProvisionDetails {
            resources: vec![format!("mock-{}-{}", ctx.service(), ctx.environment())],
        })
    }

    async fn publish(&self, ctx: &ServiceContext) -> Result<PublishDetails> {
        self.enter(Operation::Publish, ctx)?;
        Ok(PublishDetails {
            destination: format!("mock://assets/{}", ctx.service()),
        })
    }

    async fn backup(&self, ctx: &ServiceContext) -> Result<BackupDetails> {
        self.enter(Operation::Backup, ctx)?;
        Ok(BackupDetails {
            artifact: format!("mock://backups/{}/{}", ctx.environment(), ctx.service()),
        })
    }

    async fn restore(&self, ctx: &ServiceContext, artifact: Option<&str>) -> Result<RestoreDetails> {
        self.enter(Operation::Restore, ctx)?;
        let artifact = artifact.map(str::to_string).unwrap_or_else(|| {
            format!("mock://backups/{}/{}", ctx.environment(), ctx.service())
        });
        Ok(RestoreDetails { artifact })
    }

    async fn exec(&self, ctx: &ServiceContext, command: &[String]) -> Result<ExecDetails> {
        self.enter(Operation::Exec, ctx)?;
        Ok(ExecDetails {
            command: command.to_vec(),
            ..self.ran(Operation::Exec, ctx)
        })
    }

    async fn test(&self, ctx: &ServiceContext) -> Result<ExecDetails> {
        self.enter(Operation::Test, ctx)?;
        Ok(self.ran(Operation::Test, ctx))
    }

    async fn destroy(&self, ctx: &ServiceContext) -> Result<DestroyDetails> {
        self.enter(Operation::Destroy, ctx)?;
        self.set_running(ctx.environment(), ctx.service(), false);
        Ok(DestroyDetails {
            resources: vec![format!("mock-{}-{}", ctx.service(), ctx.environment())],
        })
    }
}
