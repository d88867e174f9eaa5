//! # Service orchestration
//!
//! Lifecycle operations (start, stop, check, restart, update, provision,
//! publish, backup, restore, exec, test, destroy) against named services
//! deployed to heterogeneous targets: local processes, a container runtime,
//! managed cloud infrastructure, externally hosted systems, and a
//! deterministic mock.
//!
//! The pieces, leaf to root:
//!
//! - [`StateStore`]: one persisted record per (environment, service)
//! - [`PlatformStrategy`]: the per-target operation contract
//! - [`ServiceDefinition`]: configuration and requirements of one service
//! - [`ServiceContext`]: binds a definition to its strategy and applies the
//!   dry-run, hook, state and health template to every operation
//! - [`DriftDetector`]: reconciles persisted records with live status
//! - [`FleetAggregator`]: runs one operation across many services
//!
//! ## Example
//!
//! ```rust
//! use service_orchestration::{
//!     DeploymentTarget, FleetAggregator, FleetCommand, MemoryStateStore, RunConfig,
//!     ServiceDefinition, ServiceKind,
//! };
//! use std::sync::Arc;
//!
//! # fn main() {
//! smol::block_on(async {
//!     let config = Arc::new(RunConfig::new("staging"));
//!     let fleet = FleetAggregator::with_defaults(config, Arc::new(MemoryStateStore::new()));
//!
//!     let services = vec![ServiceDefinition::new(ServiceKind::ApiBackend, DeploymentTarget::Mock)];
//!     let results = fleet.run(&FleetCommand::Start, &services).await;
//!     assert_eq!(results.summary.succeeded, 1);
//! });
//! # }
//! ```

#![warn(missing_docs)]
#![warn(unsafe_code)]

mod config;
mod context;
mod drift;
mod fleet;
mod health;
mod hooks;
mod logs;
pub mod platforms;
mod result;
mod state;

pub use config::{
    CloudSettings, DeploymentTarget, Requirements, RunConfig, ServiceDefinition, ServiceKind,
    ServiceSettings, StorageVolume,
};
pub use context::{OperationRequest, ServiceContext};
pub use drift::{DriftDetector, DriftReason, DriftReport, LiveStatus, classify};
pub use fleet::{FleetAggregator, FleetCommand, restore_order};
pub use health::{Endpoint, HealthChecker, HttpProbe, parse_endpoint};
pub use hooks::{DatabaseHooks, FilesystemHooks, NoopHooks, ServiceHooks, hooks_for};
pub use logs::{LogCache, summarize_lines, tail_file};
pub use platforms::{HealthReport, Observation, PlatformRegistry, PlatformStrategy};
pub use result::{
    BackupDetails, CheckDetails, CheckStatus, CommandResults, DestroyDetails, ExecDetails,
    ExecutionContext, HealthCheckEntry, HealthState, LogSummary, Operation, OperationDetails,
    OperationResult, ProvisionDetails, PublishDetails, RestartDetails, RestoreDetails,
    ResultStatus, StartDetails, StopDetails, Summary, UpdateDetails,
};
pub use state::{FileStateStore, MemoryStateStore, PersistedServiceState, ResourceId, StateStore};

/// Error types for orchestration operations
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Command executor errors
    #[error("Command execution error: {0}")]
    CommandExecutor(#[from] command_executor::Error),

    /// A required setting is missing or invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network, API or subprocess failure of a collaborator
    #[error("Infrastructure error: {0}")]
    Transient(String),

    /// The operation is refused for this deployment target by policy
    #[error("{operation} is not supported for {target} services: {reason}")]
    Unsupported {
        /// Operation that was requested
        operation: Operation,
        /// Target that refused it
        target: DeploymentTarget,
        /// Why it is refused
        reason: String,
        /// Known ways to achieve the same effect
        recommendations: Vec<String>,
    },

    /// Persisted state disagrees with the live platform
    #[error("State drift: {0}")]
    StateDrift(String),

    /// State store failure
    #[error("State store error: {0}")]
    State(String),

    /// An external call exceeded its time bound
    #[error("Timed out: {0}")]
    Timeout(String),

    /// No strategy registered for a deployment target
    #[error("No platform strategy registered for target: {0}")]
    NoStrategy(DeploymentTarget),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Build an unsupported-operation error without recommendations
    pub fn unsupported(
        operation: Operation,
        target: DeploymentTarget,
        reason: impl Into<String>,
    ) -> Self {
        Error::Unsupported {
            operation,
            target,
            reason: reason.into(),
            recommendations: Vec::new(),
        }
    }

    /// Attach recommendations to an unsupported-operation error
    pub fn with_recommendations<I, S>(mut self, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Error::Unsupported {
            recommendations, ..
        } = &mut self
        {
            recommendations.extend(items.into_iter().map(Into::into));
        }
        self
    }

    /// Recommendations carried by this error, if any
    pub fn recommendations(&self) -> &[String] {
        match self {
            Error::Unsupported {
                recommendations, ..
            } => recommendations,
            _ => &[],
        }
    }

    /// Whether this is a policy refusal rather than a failure
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Error::Unsupported { .. })
    }
}

/// Result type for orchestration operations
pub type Result<T> = std::result::Result<T, Error>;
