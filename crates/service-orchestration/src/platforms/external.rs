//! External strategy: services hosted somewhere this tool does not control.
//!
//! Only reachability is checked. Stop, restart and destroy are refused
//! outright; the service's owners have to act on it.

use super::{HealthReport, Observation, PlatformStrategy, exec_details, run_local};
use crate::config::{DeploymentTarget, RunConfig};
use crate::context::ServiceContext;
use crate::health::{Endpoint, HealthChecker, parse_endpoint};
use crate::result::{
    DestroyDetails, ExecDetails, HealthCheckEntry, Operation, StartDetails, StopDetails,
};
use crate::state::ResourceId;
use crate::{Error, Result};
use async_trait::async_trait;
use command_executor::Runner;
use std::sync::Arc;
use tracing::info;

const NOT_CONTROLLABLE: &str = "not controllable remotely";

/// Strategy for externally hosted services
pub struct ExternalStrategy {
    runner: Arc<dyn Runner>,
    checker: HealthChecker,
}

impl ExternalStrategy {
    /// Strategy probing with the configured HTTP timeout
    pub fn new(runner: Arc<dyn Runner>, config: &RunConfig) -> Self {
        Self {
            runner,
            checker: HealthChecker::new(config.http_timeout),
        }
    }

    fn endpoint(ctx: &ServiceContext) -> Result<(String, Endpoint)> {
        let raw = ctx.require_endpoint()?;
        let endpoint = parse_endpoint(raw).ok_or_else(|| {
            Error::Config(format!(
                "endpoint '{}' of {} has no host and port",
                raw,
                ctx.service()
            ))
        })?;
        Ok((raw.to_string(), endpoint))
    }

    fn refuse(ctx: &ServiceContext, operation: Operation) -> Error {
        Error::unsupported(operation, ctx.deployment(), NOT_CONTROLLABLE).with_recommendations([
            format!("Ask the owners of {} to {} it", ctx.service(), operation),
            format!(
                "Switch {} to a controllable deployment target for this environment",
                ctx.service()
            ),
        ])
    }
}

#[async_trait]
impl PlatformStrategy for ExternalStrategy {
    fn target(&self) -> DeploymentTarget {
        DeploymentTarget::External
    }

    fn controllable(&self) -> bool {
        false
    }

    async fn start(&self, ctx: &ServiceContext) -> Result<StartDetails> {
        let (raw, endpoint) = Self::endpoint(ctx)?;
        if !self.checker.tcp_probe(&endpoint.host, endpoint.port).await {
            return Err(Error::Transient(format!(
                "{} is not reachable at {}",
                ctx.service(),
                raw
            )));
        }
        info!("{} is reachable at {}", ctx.service(), raw);
        Ok(StartDetails {
            resource: ResourceId::endpoint(raw.clone()),
            adopted: true,
            endpoint: Some(raw),
        })
    }

    async fn stop(&self, ctx: &ServiceContext) -> Result<StopDetails> {
        Err(Self::refuse(ctx, Operation::Stop))
    }

    async fn observe(&self, ctx: &ServiceContext) -> Result<Observation> {
        let (raw, endpoint) = Self::endpoint(ctx)?;
        let target = format!("{}:{}", endpoint.host, endpoint.port);
        let observation = if self.checker.tcp_probe(&endpoint.host, endpoint.port).await {
            Observation::running(ResourceId::endpoint(raw.clone()))
                .with_check(HealthCheckEntry::pass("reachable", target))
        } else {
            Observation::stopped().with_check(HealthCheckEntry::fail(
                "reachable",
                format!("{} is not accepting connections", target),
            ))
        };
        Ok(observation.with_endpoint(Some(raw)))
    }

    async fn health(&self, ctx: &ServiceContext, _observation: &Observation) -> Result<HealthReport> {
        let (_, endpoint) = Self::endpoint(ctx)?;
        let check = if endpoint.speaks_http() {
            let path = ctx
                .settings()
                .health_path
                .as_deref()
                .unwrap_or(&endpoint.path);
            self.checker.get(&endpoint.url_for(path)).await.to_check("http")
        } else {
            HealthCheckEntry::skip(
                "http",
                format!("{} endpoints are only checked for reachability", endpoint.scheme),
            )
        };
        Ok(HealthReport::single(check))
    }

    async fn logs(&self, _ctx: &ServiceContext, _lines: usize) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn test(&self, ctx: &ServiceContext) -> Result<ExecDetails> {
        let command = ctx.require_test_command()?.to_vec();
        let (raw, _) = Self::endpoint(ctx)?;
        let output = run_local(self.runner.as_ref(), ctx, &command, &[("SERVICE_URL", raw)]).await?;
        Ok(exec_details(&command, output))
    }

    async fn destroy(&self, ctx: &ServiceContext) -> Result<DestroyDetails> {
        Err(Self::refuse(ctx, Operation::Destroy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServiceDefinition, ServiceKind};
    use crate::drift::LiveStatus;
    use crate::result::{CheckStatus, OperationDetails};
    use crate::state::MemoryStateStore;
    use async_net::TcpListener;
    use command_executor::ScriptedRunner;

    fn context(endpoint: &str) -> (ServiceContext, Arc<ScriptedRunner>) {
        let runner = Arc::new(ScriptedRunner::new());
        let config = Arc::new(RunConfig::new("prod"));
        let strategy = Arc::new(ExternalStrategy::new(runner.clone(), &config));
        let definition = ServiceDefinition::new(ServiceKind::Gateway, DeploymentTarget::External)
            .with_endpoint(endpoint);
        let ctx = ServiceContext::new(
            definition,
            config,
            strategy,
            Arc::new(MemoryStateStore::new()),
        );
        (ctx, runner)
    }

    #[test]
    fn test_stop_and_destroy_are_refused() {
        smol::block_on(async {
            let (ctx, _) = context("https://gateway.partner.example");
            for result in [
                ctx.stop().await,
                ctx.execute(&crate::context::OperationRequest::Destroy).await,
            ] {
                assert!(!result.success);
                assert!(result.error.as_deref().unwrap().contains(NOT_CONTROLLABLE));
                assert_eq!(result.recommendations.len(), 2);
            }
        });
    }

    #[test]
    fn test_reachable_endpoint_observes_running() {
        smol::block_on(async {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            let (ctx, _) = context(&format!("tcp://127.0.0.1:{}", port));

            let strategy = ExternalStrategy::new(Arc::new(ScriptedRunner::new()), ctx.config());
            let observation = strategy.observe(&ctx).await.unwrap();
            assert_eq!(observation.status, LiveStatus::Running);
            assert_eq!(observation.checks[0].status, CheckStatus::Pass);
        });
    }

    #[test]
    fn test_unreachable_endpoint_fails_start() {
        smol::block_on(async {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            drop(listener);
            let (ctx, _) = context(&format!("http://127.0.0.1:{}", port));

            let result = ctx.start().await;
            assert!(!result.success);
            assert!(result.error.unwrap().contains("not reachable"));
            assert!(ctx.load_state().await.unwrap().is_none());
        });
    }

    #[test]
    fn test_test_command_gets_service_url() {
        smol::block_on(async {
            let runner = Arc::new(ScriptedRunner::new());
            let mut config = RunConfig::new("prod");
            config.http_timeout = std::time::Duration::from_millis(100);
            let config = Arc::new(config);
            let strategy = Arc::new(ExternalStrategy::new(runner.clone(), &config));
            let mut definition =
                ServiceDefinition::new(ServiceKind::ApiBackend, DeploymentTarget::External)
                    .with_endpoint("https://api.partner.example");
            definition.settings.test_command = vec!["./smoke.sh".to_string()];
            let ctx = ServiceContext::new(
                definition,
                config,
                strategy,
                Arc::new(MemoryStateStore::new()),
            );

            let result = ctx.execute(&crate::context::OperationRequest::Test).await;
            assert!(result.success, "{:?}", result.error);
            assert!(matches!(result.details, OperationDetails::Test(_)));
            assert!(runner.called_with(&["./smoke.sh"]));
        });
    }

    #[test]
    fn test_https_endpoint_health_is_probed() {
        smol::block_on(async {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            drop(listener);
            let (ctx, _) = context(&format!("https://127.0.0.1:{}/status", port));

            let strategy = ExternalStrategy::new(Arc::new(ScriptedRunner::new()), ctx.config());
            let report = strategy.health(&ctx, &Observation::stopped()).await.unwrap();
            assert_eq!(report.checks[0].name, "http");
            assert_eq!(report.checks[0].status, CheckStatus::Fail);
        });
    }

    #[test]
    fn test_tcp_endpoint_health_is_reachability_only() {
        smol::block_on(async {
            let (ctx, _) = context("tcp://10.0.0.5:6379");
            let strategy = ExternalStrategy::new(Arc::new(ScriptedRunner::new()), ctx.config());
            let report = strategy.health(&ctx, &Observation::stopped()).await.unwrap();
            assert_eq!(report.checks[0].status, CheckStatus::Skip);
        });
    }
}
