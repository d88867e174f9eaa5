//! Service definitions and the per-invocation run configuration.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// The closed set of service kinds a fleet is made of
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceKind {
    /// System-of-record database
    Database,
    /// Browser-facing frontend
    WebFrontend,
    /// HTTP API backend
    ApiBackend,
    /// Shared file storage
    Filesystem,
    /// Background worker / agent
    BackgroundAgent,
    /// Edge gateway
    Gateway,
}

impl ServiceKind {
    /// Every kind, in declaration order
    pub const ALL: [ServiceKind; 6] = [
        ServiceKind::Database,
        ServiceKind::WebFrontend,
        ServiceKind::ApiBackend,
        ServiceKind::Filesystem,
        ServiceKind::BackgroundAgent,
        ServiceKind::Gateway,
    ];

    /// Service name as written in configuration and state files
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Database => "database",
            ServiceKind::WebFrontend => "web-frontend",
            ServiceKind::ApiBackend => "api-backend",
            ServiceKind::Filesystem => "filesystem",
            ServiceKind::BackgroundAgent => "background-agent",
            ServiceKind::Gateway => "gateway",
        }
    }

    /// Logical name used for infrastructure outputs
    pub fn pascal_case(&self) -> &'static str {
        match self {
            ServiceKind::Database => "Database",
            ServiceKind::WebFrontend => "WebFrontend",
            ServiceKind::ApiBackend => "ApiBackend",
            ServiceKind::Filesystem => "Filesystem",
            ServiceKind::BackgroundAgent => "BackgroundAgent",
            ServiceKind::Gateway => "Gateway",
        }
    }

    /// Rank used to order restores; lower ranks go first
    pub fn criticality(&self) -> u8 {
        match self {
            ServiceKind::WebFrontend => 0,
            ServiceKind::BackgroundAgent => 1,
            ServiceKind::Gateway => 2,
            ServiceKind::ApiBackend => 3,
            ServiceKind::Filesystem => 4,
            ServiceKind::Database => 5,
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ServiceKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| {
                Error::Config(format!(
                    "unknown service '{}' (expected one of: {})",
                    s,
                    ServiceKind::ALL.map(|k| k.as_str()).join(", ")
                ))
            })
    }
}

/// Where a service runs, and therefore which strategy drives it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentTarget {
    /// Local OS process
    Process,
    /// Local container runtime
    Container,
    /// Managed cloud infrastructure
    Cloud,
    /// Hosted elsewhere, not under our control
    External,
    /// Deterministic test double
    Mock,
}

impl DeploymentTarget {
    /// Every target, in declaration order
    pub const ALL: [DeploymentTarget; 5] = [
        DeploymentTarget::Process,
        DeploymentTarget::Container,
        DeploymentTarget::Cloud,
        DeploymentTarget::External,
        DeploymentTarget::Mock,
    ];

    /// Target name as written in configuration
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentTarget::Process => "process",
            DeploymentTarget::Container => "container",
            DeploymentTarget::Cloud => "cloud",
            DeploymentTarget::External => "external",
            DeploymentTarget::Mock => "mock",
        }
    }
}

impl fmt::Display for DeploymentTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentTarget {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        DeploymentTarget::ALL
            .into_iter()
            .find(|target| target.as_str() == s)
            .ok_or_else(|| Error::Config(format!("unknown deployment target '{}'", s)))
    }
}

/// Named storage a service needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageVolume {
    /// Volume name, unique per service
    pub name: String,
    /// Mount path inside the service
    pub path: String,
}

/// What a service declares it needs from its environment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Requirements {
    /// Storage volumes
    pub storage: Vec<StorageVolume>,
    /// Network ports to publish
    pub ports: Vec<u16>,
    /// Services this one depends on
    pub dependencies: Vec<ServiceKind>,
    /// Environment variables that must be present as secrets
    pub secrets: Vec<String>,
}

/// Per-service configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    /// Listening port
    pub port: Option<u16>,
    /// Container image, including tag
    pub image: Option<String>,
    /// Command and arguments
    pub command: Vec<String>,
    /// Environment variables passed to the service
    pub env: BTreeMap<String, String>,
    /// Data directory (host path for processes, container path otherwise)
    pub storage_path: Option<PathBuf>,
    /// Working directory for process targets
    pub working_dir: Option<PathBuf>,
    /// HTTP path probed for health
    pub health_path: Option<String>,
    /// Extra log files to tail
    pub log_paths: Vec<PathBuf>,
    /// Network endpoint of an external service
    pub endpoint: Option<String>,
    /// Version to deploy
    pub version: Option<String>,
    /// Command run by `test`
    pub test_command: Vec<String>,
    /// Command run by `update` on process targets
    pub update_command: Vec<String>,
    /// Overrides the derived container name
    pub container_name: Option<String>,
    /// Directory of static assets uploaded by `publish`
    pub publish_dir: Option<PathBuf>,
}

/// One service, resolved from configuration for this invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    /// Which service this is
    pub kind: ServiceKind,
    /// Where it runs
    pub deployment: DeploymentTarget,
    /// How it is configured
    #[serde(default)]
    pub settings: ServiceSettings,
    /// What it needs
    #[serde(default)]
    pub requirements: Requirements,
}

impl ServiceDefinition {
    /// Definition with empty settings and requirements
    pub fn new(kind: ServiceKind, deployment: DeploymentTarget) -> Self {
        Self {
            kind,
            deployment,
            settings: ServiceSettings::default(),
            requirements: Requirements::default(),
        }
    }

    /// Service name
    pub fn name(&self) -> &'static str {
        self.kind.as_str()
    }

    /// Set the listening port
    pub fn with_port(mut self, port: u16) -> Self {
        self.settings.port = Some(port);
        self
    }

    /// Set the container image
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.settings.image = Some(image.into());
        self
    }

    /// Set the command line
    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.settings.command = command.into_iter().map(Into::into).collect();
        self
    }

    /// Add an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.env.insert(key.into(), value.into());
        self
    }

    /// Set the external endpoint
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.settings.endpoint = Some(endpoint.into());
        self
    }

    /// Set the storage path
    pub fn with_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings.storage_path = Some(path.into());
        self
    }

    /// Set the HTTP health path
    pub fn with_health_path(mut self, path: impl Into<String>) -> Self {
        self.settings.health_path = Some(path.into());
        self
    }

    /// Replace the settings wholesale
    pub fn with_settings(mut self, settings: ServiceSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Replace the requirements wholesale
    pub fn with_requirements(mut self, requirements: Requirements) -> Self {
        self.requirements = requirements;
        self
    }
}

/// Settings for the cloud strategy and its infrastructure tool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudSettings {
    /// Provider region; required by cloud targets
    pub region: Option<String>,
    /// Prefix of stack names
    pub stack_prefix: String,
    /// Infrastructure-as-code binary
    pub iac_binary: String,
    /// Provider CLI binary
    pub cli_binary: String,
    /// File the infrastructure tool writes stack outputs to
    pub outputs_file: PathBuf,
    /// Upper bound for a stack operation
    pub stack_timeout: Duration,
    /// Interval between stack status polls
    pub poll_interval: Duration,
}

impl Default for CloudSettings {
    fn default() -> Self {
        Self {
            region: None,
            stack_prefix: "Fleet".to_string(),
            iac_binary: "cdk".to_string(),
            cli_binary: "aws".to_string(),
            outputs_file: PathBuf::from("cdk-outputs.json"),
            stack_timeout: Duration::from_secs(30 * 60),
            poll_interval: Duration::from_secs(10),
        }
    }
}

/// Everything an invocation needs to know about its surroundings
///
/// Built once from CLI flags, the configuration file and a snapshot of the
/// process environment, then shared read-only by every operation.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Environment name, such as `staging` or `production`
    pub environment: String,
    /// Report what would happen without doing it
    pub dry_run: bool,
    /// Surface raw upstream errors and recommendations
    pub verbose: bool,
    /// Suppress informational output
    pub quiet: bool,
    /// Continue past non-fatal failures
    pub force: bool,
    /// Root of persisted state records
    pub state_dir: PathBuf,
    /// Root of process log files
    pub log_dir: PathBuf,
    /// Root of local backups
    pub backup_dir: PathBuf,
    /// Prefix of container names
    pub container_prefix: String,
    /// Container runtime binary
    pub container_runtime: String,
    /// Cloud strategy settings
    pub cloud: CloudSettings,
    /// Bound for HTTP and TCP probes
    pub http_timeout: Duration,
    /// Bound for every subprocess
    pub command_timeout: Duration,
    /// How long a started process has to open its port
    pub startup_timeout: Duration,
    /// Pause between stop and start on restart
    pub restart_grace: Duration,
    /// Lines of logs summarized by `check`
    pub log_lines: usize,
    /// Snapshot of the process environment
    pub env: BTreeMap<String, String>,
    /// User running the invocation
    pub user: String,
    /// Directory the invocation runs from
    pub working_directory: PathBuf,
}

impl RunConfig {
    /// Defaults for the given environment with an empty environment snapshot
    pub fn new(environment: impl Into<String>) -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("fleetctl");

        Self {
            environment: environment.into(),
            dry_run: false,
            verbose: false,
            quiet: false,
            force: false,
            state_dir: data_dir.join("state"),
            log_dir: data_dir.join("logs"),
            backup_dir: data_dir.join("backups"),
            container_prefix: "fleet".to_string(),
            container_runtime: "docker".to_string(),
            cloud: CloudSettings::default(),
            http_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(120),
            startup_timeout: Duration::from_secs(30),
            restart_grace: Duration::from_secs(2),
            log_lines: 50,
            env: BTreeMap::new(),
            user: "unknown".to_string(),
            working_directory: PathBuf::from("."),
        }
    }

    /// Defaults plus user and working directory taken from an environment snapshot
    pub fn from_env_snapshot(
        environment: impl Into<String>,
        env: BTreeMap<String, String>,
    ) -> Self {
        let mut config = Self::new(environment);
        if let Some(user) = env.get("USER").or_else(|| env.get("USERNAME")) {
            config.user = user.clone();
        }
        if let Some(pwd) = env.get("PWD") {
            config.working_directory = PathBuf::from(pwd);
        }
        config.env = env;
        config
    }

    /// Toggle dry-run
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Toggle force
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Put state, logs and backups under one root
    pub fn with_data_dir(mut self, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        self.state_dir = root.join("state");
        self.log_dir = root.join("logs");
        self.backup_dir = root.join("backups");
        self
    }

    /// Set the restart grace period
    pub fn with_restart_grace(mut self, grace: Duration) -> Self {
        self.restart_grace = grace;
        self
    }

    /// Value of a variable in the environment snapshot
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_round_trip() {
        for kind in ServiceKind::ALL {
            assert_eq!(kind.as_str().parse::<ServiceKind>().unwrap(), kind);
        }
        assert!("cache".parse::<ServiceKind>().is_err());
    }

    #[test]
    fn test_kind_serializes_kebab_case() {
        let json = serde_json::to_string(&ServiceKind::BackgroundAgent).unwrap();
        assert_eq!(json, "\"background-agent\"");
        let target: DeploymentTarget = serde_json::from_str("\"container\"").unwrap();
        assert_eq!(target, DeploymentTarget::Container);
    }

    #[test]
    fn test_database_is_most_critical() {
        let max = ServiceKind::ALL
            .into_iter()
            .max_by_key(|k| k.criticality())
            .unwrap();
        assert_eq!(max, ServiceKind::Database);
        assert!(ServiceKind::WebFrontend.criticality() < ServiceKind::ApiBackend.criticality());
    }

    #[test]
    fn test_run_config_from_snapshot() {
        let mut env = BTreeMap::new();
        env.insert("USER".to_string(), "ops".to_string());
        env.insert("PWD".to_string(), "/srv/acme".to_string());

        let config = RunConfig::from_env_snapshot("staging", env).with_data_dir("/tmp/fleet");
        assert_eq!(config.user, "ops");
        assert_eq!(config.working_directory, PathBuf::from("/srv/acme"));
        assert_eq!(config.state_dir, PathBuf::from("/tmp/fleet/state"));
        assert_eq!(config.env_var("USER"), Some("ops"));
        assert_eq!(config.http_timeout, Duration::from_secs(5));
        assert_eq!(config.cloud.stack_timeout, Duration::from_secs(1800));
    }
}
