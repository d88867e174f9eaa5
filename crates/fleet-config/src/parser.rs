//! Configuration parser and structural validation

use crate::{Config, ConfigError, Result};
use service_orchestration::ServiceKind;
use std::path::Path;

/// Supported configuration version
pub const VERSION: &str = "1.0";

/// Parse a YAML configuration file
pub fn parse_file(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
        path: path.to_path_buf(),
        source,
    })?;
    parse_str(&content)
}

/// Parse YAML configuration from a string
pub fn parse_str(content: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(content)?;
    validate_config(&config)?;
    Ok(config)
}

/// Validate the shape of a configuration, independent of any environment
fn validate_config(config: &Config) -> Result<()> {
    if config.version != VERSION {
        return Err(ConfigError::ValidationError(format!(
            "Unsupported version: {}, expected {}",
            config.version, VERSION
        )));
    }

    if config.services.is_empty() {
        return Err(ConfigError::ValidationError(
            "No services defined".to_string(),
        ));
    }

    for (name, service) in &config.services {
        name.parse::<ServiceKind>()
            .map_err(|err| ConfigError::ValidationError(err.to_string()))?;

        for dep in &service.dependencies {
            if !config.services.contains_key(dep) {
                return Err(ConfigError::ValidationError(format!(
                    "Service '{}' depends on unknown service '{}'",
                    name, dep
                )));
            }
            if dep == name {
                return Err(ConfigError::ValidationError(format!(
                    "Service '{}' depends on itself",
                    name
                )));
            }
        }
    }

    for (environment, overlay) in &config.environments {
        for service in overlay.referenced_services() {
            if !config.services.contains_key(service) {
                return Err(ConfigError::ValidationError(format!(
                    "Environment '{}' references unknown service '{}'",
                    environment, service
                )));
            }
        }
    }

    Ok(())
}
