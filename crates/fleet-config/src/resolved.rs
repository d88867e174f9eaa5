//! Configuration resolved for one environment.
//!
//! Resolution applies the environment overlay, substitutes variables and
//! checks what each deployment target needs. Problems are collected across
//! every service so `validate` can report them all at once.

use crate::resolver::resolve_string;
use crate::{CloudConfig, Config, ConfigError, EnvironmentOverlay, Result, Service, Settings};
use service_orchestration::{
    CloudSettings, DeploymentTarget, Requirements, RunConfig, ServiceDefinition, ServiceKind,
    ServiceSettings,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// A configuration ready to drive one invocation
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Fleet name
    pub name: Option<String>,
    /// Environment the overlay was applied for
    pub environment: String,
    /// Services in file order
    pub services: Vec<ServiceDefinition>,
    /// Global settings with paths anchored at the configuration directory
    pub settings: Settings,
    /// Cloud settings with defaults filled in
    pub cloud: CloudSettings,
}

impl ResolvedConfig {
    /// Copy every configured knob onto a run configuration
    pub fn apply(&self, run: &mut RunConfig) {
        let settings = &self.settings;
        if let Some(prefix) = settings.container_prefix.as_ref().or(self.name.as_ref()) {
            run.container_prefix = prefix.clone();
        }
        if let Some(runtime) = &settings.container_runtime {
            run.container_runtime = runtime.clone();
        }
        if let Some(dir) = &settings.state_dir {
            run.state_dir = dir.clone();
        }
        if let Some(dir) = &settings.log_dir {
            run.log_dir = dir.clone();
        }
        if let Some(dir) = &settings.backup_dir {
            run.backup_dir = dir.clone();
        }
        if let Some(secs) = settings.restart_grace_secs {
            run.restart_grace = Duration::from_secs(secs);
        }
        if let Some(secs) = settings.http_timeout_secs {
            run.http_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = settings.command_timeout_secs {
            run.command_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = settings.startup_timeout_secs {
            run.startup_timeout = Duration::from_secs(secs);
        }
        if let Some(lines) = settings.log_lines {
            run.log_lines = lines;
        }
        run.cloud = self.cloud.clone();
    }

    /// Definition of one service, if declared
    pub fn get(&self, kind: ServiceKind) -> Option<&ServiceDefinition> {
        self.services.iter().find(|definition| definition.kind == kind)
    }

    /// Services named on the command line, or all of them
    pub fn select(&self, names: &[String]) -> Result<Vec<ServiceDefinition>> {
        crate::discovery::select(&self.services, names)
    }
}

/// Collects problems while resolving
struct Resolution<'a> {
    env: &'a BTreeMap<String, String>,
    problems: Vec<String>,
}

impl Resolution<'_> {
    fn problem(&mut self, service: &str, message: impl Into<String>) {
        self.problems
            .push(format!("service '{}': {}", service, message.into()));
    }

    fn string(&mut self, service: &str, field: &str, value: &str) -> String {
        match resolve_string(value, self.env) {
            Ok(resolved) => resolved,
            Err(ConfigError::EnvVarNotFound(names)) => {
                self.problem(service, format!("{} references unset variable(s) {}", field, names));
                value.to_string()
            }
            Err(err) => {
                self.problem(service, format!("{}: {}", field, err));
                value.to_string()
            }
        }
    }

    fn option(&mut self, service: &str, field: &str, value: Option<&str>) -> Option<String> {
        value.map(|value| self.string(service, field, value))
    }

    fn list(&mut self, service: &str, field: &str, values: &[String]) -> Vec<String> {
        values
            .iter()
            .map(|value| self.string(service, field, value))
            .collect()
    }
}

fn anchor(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_relative() {
        base_dir.join(path)
    } else {
        path.to_path_buf()
    }
}

/// Resolve `config` for `environment` against an environment snapshot
///
/// Relative paths are anchored at `base_dir`.
pub fn resolve(
    config: &Config,
    environment: &str,
    env: &BTreeMap<String, String>,
    base_dir: &Path,
) -> Result<ResolvedConfig> {
    let overlay = config.environments.get(environment);
    if overlay.is_none() && !config.environments.is_empty() {
        debug!("No overlay for environment '{}', using service defaults", environment);
    }

    let mut resolution = Resolution {
        env,
        problems: Vec::new(),
    };

    let cloud = resolve_cloud(config.cloud.as_ref(), &mut resolution, base_dir);

    let mut services = Vec::with_capacity(config.services.len());
    for (name, service) in &config.services {
        let Ok(kind) = name.parse::<ServiceKind>() else {
            resolution.problem(name, "not a known service");
            continue;
        };
        let definition = build_service(kind, service, overlay, &mut resolution, base_dir);
        check_target(&definition, &cloud, &mut resolution);
        services.push(definition);
    }

    if !resolution.problems.is_empty() {
        return Err(ConfigError::Problems(resolution.problems));
    }

    Ok(ResolvedConfig {
        name: config.name.clone(),
        environment: environment.to_string(),
        services,
        settings: anchor_settings(&config.settings, base_dir),
        cloud,
    })
}

fn anchor_settings(settings: &Settings, base_dir: &Path) -> Settings {
    let mut anchored = settings.clone();
    for dir in [
        &mut anchored.state_dir,
        &mut anchored.log_dir,
        &mut anchored.backup_dir,
    ] {
        if let Some(path) = dir {
            *path = anchor(base_dir, path);
        }
    }
    anchored
}

fn resolve_cloud(
    cloud: Option<&CloudConfig>,
    resolution: &mut Resolution<'_>,
    base_dir: &Path,
) -> CloudSettings {
    let mut settings = CloudSettings::default();
    let Some(cloud) = cloud else {
        return settings;
    };

    settings.region = resolution
        .option("cloud", "region", cloud.region.as_deref())
        .filter(|region| !region.is_empty());
    if let Some(prefix) = &cloud.stack_prefix {
        settings.stack_prefix = prefix.clone();
    }
    if let Some(binary) = &cloud.iac_binary {
        settings.iac_binary = binary.clone();
    }
    if let Some(binary) = &cloud.cli_binary {
        settings.cli_binary = binary.clone();
    }
    if let Some(path) = &cloud.outputs_file {
        settings.outputs_file = anchor(base_dir, path);
    } else {
        settings.outputs_file = anchor(base_dir, &settings.outputs_file);
    }
    if let Some(secs) = cloud.stack_timeout_secs {
        settings.stack_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = cloud.poll_interval_secs {
        settings.poll_interval = Duration::from_secs(secs);
    }
    settings
}

fn build_service(
    kind: ServiceKind,
    service: &Service,
    overlay: Option<&EnvironmentOverlay>,
    resolution: &mut Resolution<'_>,
    base_dir: &Path,
) -> ServiceDefinition {
    let name = kind.as_str();

    let deployment = overlay
        .and_then(|overlay| overlay.deployments.get(name))
        .copied()
        .unwrap_or(service.deployment);

    let mut env = BTreeMap::new();
    let overlay_env = overlay.and_then(|overlay| overlay.env.get(name));
    for (key, value) in service.env.iter().chain(overlay_env.into_iter().flatten()) {
        let resolved = resolution.string(name, &format!("env.{}", key), value);
        env.insert(key.clone(), resolved);
    }

    let endpoint = overlay
        .and_then(|overlay| overlay.endpoints.get(name))
        .or(service.endpoint.as_ref());
    let version = overlay
        .and_then(|overlay| overlay.versions.get(name))
        .or(service.version.as_ref());

    // Container storage paths live inside the container
    let storage_path = service.storage_path.as_ref().map(|path| match deployment {
        DeploymentTarget::Process => anchor(base_dir, path),
        _ => path.clone(),
    });

    let settings = ServiceSettings {
        port: service.port,
        image: resolution.option(name, "image", service.image.as_deref()),
        command: resolution.list(name, "command", &service.command),
        env,
        storage_path,
        working_dir: service
            .working_dir
            .as_ref()
            .map(|path| anchor(base_dir, path)),
        health_path: service.health_path.clone(),
        log_paths: service
            .log_paths
            .iter()
            .map(|path| anchor(base_dir, path))
            .collect(),
        endpoint: resolution.option(name, "endpoint", endpoint.map(String::as_str)),
        version: resolution.option(name, "version", version.map(String::as_str)),
        test_command: resolution.list(name, "test_command", &service.test_command),
        update_command: resolution.list(name, "update_command", &service.update_command),
        container_name: service.container_name.clone(),
        publish_dir: service
            .publish_dir
            .as_ref()
            .map(|path| anchor(base_dir, path)),
    };

    for secret in &service.requires.secrets {
        if !resolution.env.get(secret).is_some_and(|value| !value.is_empty()) {
            resolution.problem(name, format!("required secret {} is not set", secret));
        }
    }

    let requirements = Requirements {
        storage: service.requires.storage.clone(),
        ports: service.requires.ports.clone(),
        dependencies: service
            .dependencies
            .iter()
            .filter_map(|dep| dep.parse::<ServiceKind>().ok())
            .collect(),
        secrets: service.requires.secrets.clone(),
    };

    ServiceDefinition::new(kind, deployment)
        .with_settings(settings)
        .with_requirements(requirements)
}

fn check_target(
    definition: &ServiceDefinition,
    cloud: &CloudSettings,
    resolution: &mut Resolution<'_>,
) {
    let name = definition.name();
    let settings = &definition.settings;
    match definition.deployment {
        DeploymentTarget::Process if settings.command.is_empty() => {
            resolution.problem(name, "process targets need a command");
        }
        DeploymentTarget::Container if settings.image.is_none() => {
            resolution.problem(name, "container targets need an image");
        }
        DeploymentTarget::Cloud if cloud.region.is_none() => {
            resolution.problem(name, "cloud targets need cloud.region");
        }
        DeploymentTarget::External if settings.endpoint.is_none() => {
            resolution.problem(name, "external targets need an endpoint");
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_str;

    const YAML: &str = r#"
version: "1.0"
name: acme
settings:
  state_dir: .fleet/state
cloud:
  region: ${AWS_REGION:-eu-west-1}
services:
  database:
    deployment: container
    image: postgres:16
    port: 5432
    env:
      POSTGRES_PASSWORD: "${DB_PASSWORD}"
    requires:
      secrets: [DB_PASSWORD]
  api-backend:
    deployment: process
    command: ["./api", "--port", "${API_PORT:-8080}"]
    env:
      LOG_LEVEL: info
environments:
  production:
    deployments:
      database: cloud
    env:
      api-backend:
        LOG_LEVEL: warn
"#;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_without_overlay() {
        let config = parse_str(YAML).unwrap();
        let resolved = resolve(
            &config,
            "staging",
            &env(&[("DB_PASSWORD", "hunter2")]),
            Path::new("/srv/acme"),
        )
        .unwrap();

        let database = resolved.get(ServiceKind::Database).unwrap();
        assert_eq!(database.deployment, DeploymentTarget::Container);
        assert_eq!(database.settings.env["POSTGRES_PASSWORD"], "hunter2");

        let api = resolved.get(ServiceKind::ApiBackend).unwrap();
        assert_eq!(api.settings.command, vec!["./api", "--port", "8080"]);
        assert_eq!(api.settings.env["LOG_LEVEL"], "info");
        assert_eq!(
            resolved.settings.state_dir,
            Some(PathBuf::from("/srv/acme/.fleet/state"))
        );
    }

    #[test]
    fn test_overlay_moves_targets_and_adds_env() {
        let config = parse_str(YAML).unwrap();
        let resolved = resolve(
            &config,
            "production",
            &env(&[("DB_PASSWORD", "hunter2"), ("AWS_REGION", "us-east-2")]),
            Path::new("."),
        )
        .unwrap();

        let database = resolved.get(ServiceKind::Database).unwrap();
        assert_eq!(database.deployment, DeploymentTarget::Cloud);
        assert_eq!(resolved.cloud.region.as_deref(), Some("us-east-2"));

        let api = resolved.get(ServiceKind::ApiBackend).unwrap();
        assert_eq!(api.settings.env["LOG_LEVEL"], "warn");
    }

    #[test]
    fn test_problems_are_collected() {
        let yaml = r#"
version: "1.0"
services:
  database:
    deployment: container
    env:
      POSTGRES_PASSWORD: "${DB_PASSWORD}"
    requires:
      secrets: [DB_PASSWORD]
  gateway:
    deployment: external
  filesystem:
    deployment: cloud
"#;
        let config = parse_str(yaml).unwrap();
        let err = resolve(&config, "staging", &BTreeMap::new(), Path::new(".")).unwrap_err();
        let problems = err.problems();

        assert!(problems.contains(
            &"service 'database': env.POSTGRES_PASSWORD references unset variable(s) DB_PASSWORD"
                .to_string()
        ));
        assert!(problems.contains(&"service 'database': required secret DB_PASSWORD is not set".to_string()));
        assert!(problems.contains(&"service 'database': container targets need an image".to_string()));
        assert!(problems.contains(&"service 'gateway': external targets need an endpoint".to_string()));
        assert!(problems.contains(&"service 'filesystem': cloud targets need cloud.region".to_string()));
        assert_eq!(problems.len(), 5);
    }

    #[test]
    fn test_apply_sets_run_config() {
        let config = parse_str(YAML).unwrap();
        let resolved = resolve(
            &config,
            "staging",
            &env(&[("DB_PASSWORD", "x")]),
            Path::new("/srv/acme"),
        )
        .unwrap();

        let mut run = RunConfig::new("staging");
        resolved.apply(&mut run);
        assert_eq!(run.container_prefix, "acme");
        assert_eq!(run.state_dir, PathBuf::from("/srv/acme/.fleet/state"));
        assert_eq!(run.cloud.region.as_deref(), Some("eu-west-1"));
        assert_eq!(
            run.cloud.outputs_file,
            PathBuf::from("/srv/acme/cdk-outputs.json")
        );
    }
}
