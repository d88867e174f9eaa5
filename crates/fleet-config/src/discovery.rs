//! Locating the configuration file and the services a command targets.

use crate::{ConfigError, Result};
use service_orchestration::{ServiceDefinition, ServiceKind};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Variable naming a configuration file
pub const CONFIG_ENV: &str = "FLEETCTL_CONFIG";

/// File names looked for in the working directory, in order
pub const FILE_NAMES: [&str; 3] = ["fleet.yaml", "fleet.yml", ".fleet/config.yaml"];

/// Every place a configuration file is looked for, in order
pub fn candidates(cwd: &Path, env: &BTreeMap<String, String>) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(path) = env.get(CONFIG_ENV).filter(|path| !path.is_empty()) {
        paths.push(cwd.join(path));
    }
    paths.extend(FILE_NAMES.iter().map(|name| cwd.join(name)));
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("fleetctl").join("fleet.yaml"));
    }
    paths
}

/// The configuration file to use
///
/// An explicit path wins and must exist. Otherwise the first existing
/// candidate is used.
pub fn find_config_file(
    explicit: Option<&Path>,
    cwd: &Path,
    env: &BTreeMap<String, String>,
) -> Result<PathBuf> {
    if let Some(path) = explicit {
        let path = cwd.join(path);
        return if path.is_file() {
            Ok(path)
        } else {
            Err(ConfigError::NotFound(vec![path]))
        };
    }

    let candidates = candidates(cwd, env);
    match candidates.iter().find(|path| path.is_file()) {
        Some(path) => {
            debug!("Using configuration file {}", path.display());
            Ok(path.clone())
        }
        None => Err(ConfigError::NotFound(candidates)),
    }
}

/// Services named on the command line, or every service
///
/// Named services come back in the order requested, duplicates dropped.
/// Without names every service is returned in file order.
pub fn select(services: &[ServiceDefinition], names: &[String]) -> Result<Vec<ServiceDefinition>> {
    if names.is_empty() {
        return Ok(services.to_vec());
    }

    let mut selected: Vec<ServiceDefinition> = Vec::with_capacity(names.len());
    for name in names {
        let kind = name
            .parse::<ServiceKind>()
            .map_err(|_| ConfigError::ServiceNotFound(name.clone()))?;
        if selected.iter().any(|definition| definition.kind == kind) {
            continue;
        }
        let definition = services
            .iter()
            .find(|definition| definition.kind == kind)
            .ok_or_else(|| ConfigError::ServiceNotFound(name.clone()))?;
        selected.push(definition.clone());
    }
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use service_orchestration::DeploymentTarget;

    fn fleet() -> Vec<ServiceDefinition> {
        [
            ServiceKind::Database,
            ServiceKind::ApiBackend,
            ServiceKind::WebFrontend,
        ]
        .into_iter()
        .map(|kind| ServiceDefinition::new(kind, DeploymentTarget::Mock))
        .collect()
    }

    fn names(definitions: &[ServiceDefinition]) -> Vec<&'static str> {
        definitions.iter().map(|d| d.name()).collect()
    }

    #[test]
    fn test_select_all_in_file_order() {
        let selected = select(&fleet(), &[]).unwrap();
        assert_eq!(names(&selected), vec!["database", "api-backend", "web-frontend"]);
    }

    #[test]
    fn test_select_keeps_requested_order() {
        let requested = vec![
            "web-frontend".to_string(),
            "database".to_string(),
            "web-frontend".to_string(),
        ];
        let selected = select(&fleet(), &requested).unwrap();
        assert_eq!(names(&selected), vec!["web-frontend", "database"]);
    }

    #[test]
    fn test_select_unknown_names() {
        let err = select(&fleet(), &["cache".to_string()]).unwrap_err();
        assert!(matches!(err, ConfigError::ServiceNotFound(name) if name == "cache"));

        // A known kind that this fleet does not declare
        let err = select(&fleet(), &["gateway".to_string()]).unwrap_err();
        assert_eq!(err.to_string(), "Service 'gateway' not found");
    }

    #[test]
    fn test_find_config_file_order() {
        let dir = tempfile::tempdir().unwrap();
        let env = BTreeMap::new();
        assert!(matches!(
            find_config_file(None, dir.path(), &env),
            Err(ConfigError::NotFound(_))
        ));

        std::fs::create_dir_all(dir.path().join(".fleet")).unwrap();
        std::fs::write(dir.path().join(".fleet/config.yaml"), "").unwrap();
        assert_eq!(
            find_config_file(None, dir.path(), &env).unwrap(),
            dir.path().join(".fleet/config.yaml")
        );

        std::fs::write(dir.path().join("fleet.yml"), "").unwrap();
        assert_eq!(
            find_config_file(None, dir.path(), &env).unwrap(),
            dir.path().join("fleet.yml")
        );

        std::fs::write(dir.path().join("custom.yaml"), "").unwrap();
        let env = BTreeMap::from([(CONFIG_ENV.to_string(), "custom.yaml".to_string())]);
        assert_eq!(
            find_config_file(None, dir.path(), &env).unwrap(),
            dir.path().join("custom.yaml")
        );
    }

    #[test]
    fn test_explicit_path_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let err = find_config_file(Some(Path::new("missing.yaml")), dir.path(), &BTreeMap::new())
            .unwrap_err();
        assert!(err.to_string().contains("missing.yaml"));
    }
}
