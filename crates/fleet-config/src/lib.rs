//! # Fleet Configuration
//!
//! YAML configuration for fleetctl.
//!
//! A configuration file declares the services of a fleet, where each of them
//! runs by default, and per-environment overlays that move services between
//! deployment targets or add environment variables. Loading happens in two
//! steps:
//!
//! 1. [`parser`] reads the YAML and checks its shape: version, service names,
//!    dependencies and overlay references.
//! 2. [`resolved`] applies the overlay for one environment, substitutes
//!    `${VAR}` / `${VAR:-default}` references from an environment snapshot and
//!    produces [`ServiceDefinition`](service_orchestration::ServiceDefinition)s
//!    plus the knobs of a [`RunConfig`](service_orchestration::RunConfig).
//!
//! ```no_run
//! use fleet_config::{discovery, load};
//! use std::collections::BTreeMap;
//! use std::path::Path;
//!
//! # fn main() -> fleet_config::Result<()> {
//! let env: BTreeMap<String, String> = std::env::vars().collect();
//! let path = discovery::find_config_file(None, Path::new("."), &env)?;
//! let resolved = load(&path, "staging", &env)?;
//! for definition in resolved.select(&[])? {
//!     println!("{} -> {}", definition.name(), definition.deployment);
//! }
//! # Ok(())
//! # }
//! ```

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use service_orchestration::{DeploymentTarget, StorageVolume};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub mod discovery;
pub mod parser;
pub mod resolved;
pub mod resolver;

pub use resolved::{ResolvedConfig, resolve};

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file
    #[error("Failed to read config file {path}: {source}")]
    ReadError {
        /// File that could not be read
        path: PathBuf,
        /// Underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse YAML
    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    /// Several problems found while resolving one environment
    #[error("Invalid configuration:\n  - {}", .0.join("\n  - "))]
    Problems(Vec<String>),

    /// Environment variable not found
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    /// Service reference not found
    #[error("Service '{0}' not found")]
    ServiceNotFound(String),

    /// No configuration file could be located
    #[error("No configuration file found (looked in: {})", display_paths(.0))]
    NotFound(Vec<PathBuf>),
}

impl ConfigError {
    /// Every individual problem carried by this error
    pub fn problems(&self) -> Vec<String> {
        match self {
            ConfigError::Problems(problems) => problems.clone(),
            other => vec![other.to_string()],
        }
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Configuration version
    pub version: String,

    /// Optional fleet name, used as the default container prefix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Optional description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Global settings
    #[serde(default, skip_serializing_if = "Settings::is_default")]
    pub settings: Settings,

    /// Cloud settings, needed once any service targets the cloud
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud: Option<CloudConfig>,

    /// Service definitions, in file order
    pub services: IndexMap<String, Service>,

    /// Per-environment overlays
    #[serde(default)]
    pub environments: IndexMap<String, EnvironmentOverlay>,
}

/// Global settings
///
/// Every field is optional; unset fields keep the run configuration
/// defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Prefix of container names
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_prefix: Option<String>,

    /// Container runtime binary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_runtime: Option<String>,

    /// Root of persisted state records
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,

    /// Root of process log files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,

    /// Root of local backups
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_dir: Option<PathBuf>,

    /// Pause between stop and start on restart, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_grace_secs: Option<u64>,

    /// Bound for health probes, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_timeout_secs: Option<u64>,

    /// Bound for every subprocess, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_timeout_secs: Option<u64>,

    /// How long a started process has to open its port, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_timeout_secs: Option<u64>,

    /// Lines of logs summarized by `check`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_lines: Option<usize>,
}

impl Settings {
    /// Check if settings are default (all None)
    fn is_default(&self) -> bool {
        self == &Settings::default()
    }
}

/// Cloud settings
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CloudConfig {
    /// Provider region; may reference environment variables
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Prefix of stack names
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_prefix: Option<String>,

    /// Infrastructure-as-code binary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iac_binary: Option<String>,

    /// Provider CLI binary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli_binary: Option<String>,

    /// Where the infrastructure tool writes stack outputs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs_file: Option<PathBuf>,

    /// Upper bound for a stack operation, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_timeout_secs: Option<u64>,

    /// Interval between stack status polls, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_secs: Option<u64>,
}

/// Service definition as written in the file
///
/// The map key is the service name and must be one of the known service
/// kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Service {
    /// Default deployment target
    pub deployment: DeploymentTarget,

    /// Listening port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Container image, including tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Command and arguments
    #[serde(default)]
    pub command: Vec<String>,

    /// Environment variables
    #[serde(default)]
    pub env: IndexMap<String, String>,

    /// Service dependencies
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Data directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_path: Option<PathBuf>,

    /// Working directory for process targets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,

    /// HTTP path probed for health
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_path: Option<String>,

    /// Extra log files to tail
    #[serde(default)]
    pub log_paths: Vec<PathBuf>,

    /// Network endpoint of an external service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Version to deploy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Command run by `test`
    #[serde(default)]
    pub test_command: Vec<String>,

    /// Command run by `update` on process targets
    #[serde(default)]
    pub update_command: Vec<String>,

    /// Overrides the derived container name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,

    /// Directory of static assets uploaded by `publish`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish_dir: Option<PathBuf>,

    /// Declared needs
    #[serde(default)]
    pub requires: Requires,
}

/// What a service needs from its environment
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Requires {
    /// Named storage volumes
    #[serde(default)]
    pub storage: Vec<StorageVolume>,

    /// Ports to publish
    #[serde(default)]
    pub ports: Vec<u16>,

    /// Variables that must be present in the environment
    #[serde(default)]
    pub secrets: Vec<String>,
}

/// Changes applied when running against one environment
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentOverlay {
    /// Deployment target per service
    #[serde(default)]
    pub deployments: IndexMap<String, DeploymentTarget>,

    /// Extra environment variables per service
    #[serde(default)]
    pub env: IndexMap<String, IndexMap<String, String>>,

    /// Endpoint per service
    #[serde(default)]
    pub endpoints: IndexMap<String, String>,

    /// Version per service
    #[serde(default)]
    pub versions: IndexMap<String, String>,
}

impl EnvironmentOverlay {
    /// Every service name the overlay mentions
    pub fn referenced_services(&self) -> impl Iterator<Item = &str> {
        self.deployments
            .keys()
            .chain(self.env.keys())
            .chain(self.endpoints.keys())
            .chain(self.versions.keys())
            .map(String::as_str)
    }
}

/// Parse `path` and resolve it for `environment`
///
/// Relative paths in the file are taken relative to the file's directory.
pub fn load(
    path: impl AsRef<Path>,
    environment: &str,
    env: &BTreeMap<String, String>,
) -> Result<ResolvedConfig> {
    let path = path.as_ref();
    let config = parser::parse_file(path)?;
    let base_dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    resolve(&config, environment, env, base_dir)
}
