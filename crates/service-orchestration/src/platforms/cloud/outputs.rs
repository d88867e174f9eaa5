//! Infrastructure outputs: the file the IaC tool writes after a deploy.
//!
//! ```json
//! { "FleetDatabase-prod": { "DatabaseId": "fleet-db-prod", "DatabaseLogGroup": "/fleet/db" } }
//! ```

use crate::Result;
use crate::config::ServiceKind;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// Suffix of an output key after the service's logical name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// Resource ARN
    Arn,
    /// Provider identifier
    Id,
    /// Public or console URL
    Url,
    /// Storage bucket name
    Bucket,
    /// Log group name
    LogGroup,
}

impl OutputKind {
    /// Key suffix
    pub fn suffix(&self) -> &'static str {
        match self {
            OutputKind::Arn => "Arn",
            OutputKind::Id => "Id",
            OutputKind::Url => "Url",
            OutputKind::Bucket => "Bucket",
            OutputKind::LogGroup => "LogGroup",
        }
    }
}

/// Parsed outputs, stack name to key/value pairs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackOutputs {
    stacks: BTreeMap<String, BTreeMap<String, String>>,
}

impl StackOutputs {
    /// Parse the outputs document
    pub fn parse(json: &str) -> Result<Self> {
        let stacks: BTreeMap<String, BTreeMap<String, serde_json::Value>> =
            serde_json::from_str(json)?;
        let stacks = stacks
            .into_iter()
            .map(|(stack, outputs)| {
                let outputs = outputs
                    .into_iter()
                    .filter_map(|(key, value)| match value {
                        serde_json::Value::String(s) => Some((key, s)),
                        serde_json::Value::Number(n) => Some((key, n.to_string())),
                        _ => None,
                    })
                    .collect();
                (stack, outputs)
            })
            .collect();
        Ok(Self { stacks })
    }

    /// Read the outputs file; a missing file has no outputs
    pub async fn load(path: &Path) -> Result<Self> {
        match smol::fs::read_to_string(path).await {
            Ok(json) => Self::parse(&json),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No infrastructure outputs at {}", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Output `<Logical><Kind>` of a service, preferring its own stack
    pub fn lookup(&self, stack: &str, kind: ServiceKind, output: OutputKind) -> Option<&str> {
        let key = format!("{}{}", kind.pascal_case(), output.suffix());
        if let Some(value) = self.stacks.get(stack).and_then(|o| o.get(&key)) {
            return Some(value);
        }
        self.stacks
            .values()
            .find_map(|outputs| outputs.get(&key))
            .map(String::as_str)
    }

    /// Every output of a service in its stack, as `key=value`
    pub fn describe(&self, stack: &str, kind: ServiceKind) -> Vec<String> {
        let prefix = kind.pascal_case();
        self.stacks
            .get(stack)
            .map(|outputs| {
                outputs
                    .iter()
                    .filter(|(key, _)| key.starts_with(prefix))
                    .map(|(key, value)| format!("{}={}", key, value))
                    .collect()
            })
            .unwrap_or_default()
    }
}
