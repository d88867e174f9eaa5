//! Persisted service state
//!
//! One JSON record per (environment, service) remembers what the last
//! successful `start` produced. `check` compares it with the live platform,
//! `stop` removes it. Two invocations racing on one service are last writer
//! wins.

use crate::config::DeploymentTarget;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smol::stream::StreamExt;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Target-specific handle of a running instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceId {
    /// Process id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Container id, short or full
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    /// Container name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    /// Listening port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Network endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Cloud resource ARN
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arn: Option<String>,
}

impl ResourceId {
    /// Handle naming a process
    pub fn process(pid: u32, port: Option<u16>) -> Self {
        Self {
            pid: Some(pid),
            port,
            ..Self::default()
        }
    }

    /// Handle naming a container
    pub fn container(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            container_id: Some(id.into()),
            container_name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Handle naming a network endpoint
    pub fn endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            ..Self::default()
        }
    }

    /// Handle naming a cloud resource
    pub fn arn(arn: impl Into<String>) -> Self {
        Self {
            arn: Some(arn.into()),
            ..Self::default()
        }
    }

    /// True when no field is set
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Whether two handles can name the same instance
    ///
    /// Only fields present on both sides are compared. Container ids match
    /// when one is a prefix of the other, so a short id matches its full id.
    pub fn matches(&self, other: &ResourceId) -> bool {
        fn same<T: PartialEq>(a: &Option<T>, b: &Option<T>) -> bool {
            match (a, b) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
        }

        let ids = match (&self.container_id, &other.container_id) {
            (Some(a), Some(b)) => a.starts_with(b.as_str()) || b.starts_with(a.as_str()),
            _ => true,
        };

        ids && same(&self.pid, &other.pid)
            && same(&self.container_name, &other.container_name)
            && same(&self.port, &other.port)
            && same(&self.endpoint, &other.endpoint)
            && same(&self.arn, &other.arn)
    }

    /// Short human readable form
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if let Some(pid) = self.pid {
            parts.push(format!("pid {}", pid));
        }
        if let Some(name) = &self.container_name {
            parts.push(format!("container {}", name));
        } else if let Some(id) = &self.container_id {
            parts.push(format!("container {}", id.chars().take(12).collect::<String>()));
        }
        if let Some(arn) = &self.arn {
            parts.push(arn.clone());
        }
        if let Some(endpoint) = &self.endpoint {
            parts.push(endpoint.clone());
        } else if let Some(port) = self.port {
            parts.push(format!("port {}", port));
        }
        parts.join(", ")
    }
}

/// What the last successful start left behind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedServiceState {
    /// Service name
    pub service: String,
    /// Target it was started on
    pub deployment: DeploymentTarget,
    /// Environment name
    pub environment: String,
    /// When it was started
    pub start_time: DateTime<Utc>,
    /// Handle of the started instance
    pub resource_id: ResourceId,
    /// Free-form extras, such as the deployed version
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl PersistedServiceState {
    /// Record started now
    pub fn new(
        service: impl Into<String>,
        deployment: DeploymentTarget,
        environment: impl Into<String>,
        resource_id: ResourceId,
    ) -> Self {
        Self {
            service: service.into(),
            deployment,
            environment: environment.into(),
            start_time: Utc::now(),
            resource_id,
            metadata: BTreeMap::new(),
        }
    }
}

/// Storage of one record per (environment, service)
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Record for a service, if any
    async fn load(&self, environment: &str, service: &str)
    -> Result<Option<PersistedServiceState>>;

    /// Create or replace the record for `state.environment` / `state.service`
    async fn save(&self, state: &PersistedServiceState) -> Result<()>;

    /// Remove a record; returns whether one existed
    async fn delete(&self, environment: &str, service: &str) -> Result<bool>;

    /// Every record of an environment, ordered by service name
    async fn list(&self, environment: &str) -> Result<Vec<PersistedServiceState>>;
}

fn check_component(kind: &str, value: &str) -> Result<()> {
    if value.is_empty()
        || value == "."
        || value == ".."
        || value.contains(['/', '\\'])
    {
        return Err(Error::State(format!("invalid {} name '{}'", kind, value)));
    }
    Ok(())
}

/// JSON files under `<root>/<environment>/<service>.json`
#[derive(Debug, Clone)]
pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    /// Store rooted at `root`; directories are created on first write
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the record for a service
    pub fn path_for(&self, environment: &str, service: &str) -> Result<PathBuf> {
        check_component("environment", environment)?;
        check_component("service", service)?;
        Ok(self.root.join(environment).join(format!("{}.json", service)))
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(
        &self,
        environment: &str,
        service: &str,
    ) -> Result<Option<PersistedServiceState>> {
        let path = self.path_for(environment, service)?;
        let content = match smol::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let state = serde_json::from_str(&content).map_err(|e| {
            Error::State(format!("corrupt state record {}: {}", path.display(), e))
        })?;
        Ok(Some(state))
    }

    async fn save(&self, state: &PersistedServiceState) -> Result<()> {
        let path = self.path_for(&state.environment, &state.service)?;
        if let Some(parent) = path.parent() {
            smol::fs::create_dir_all(parent).await?;
        }

        // Write next to the target and rename so readers never see a torn file
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(state)?;
        smol::fs::write(&tmp, content).await?;
        smol::fs::rename(&tmp, &path).await?;

        debug!("Saved state record {}", path.display());
        Ok(())
    }

    async fn delete(&self, environment: &str, service: &str) -> Result<bool> {
        let path = self.path_for(environment, service)?;
        match smol::fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Deleted state record {}", path.display());
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, environment: &str) -> Result<Vec<PersistedServiceState>> {
        check_component("environment", environment)?;
        let dir = self.root.join(environment);
        let mut entries = match smol::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut services = Vec::new();
        while let Some(entry) = entries.next().await {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                services.push(stem.to_string());
            }
        }
        services.sort();

        let mut states = Vec::with_capacity(services.len());
        for service in services {
            if let Some(state) = self.load(environment, &service).await? {
                states.push(state);
            }
        }
        Ok(states)
    }
}

/// In-memory store for tests and dry experiments
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    records: Mutex<BTreeMap<(String, String), PersistedServiceState>>,
    mutations: AtomicUsize,
}

impl MemoryStateStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of saves and successful deletes so far
    pub fn mutation_count(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    fn records(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, BTreeMap<(String, String), PersistedServiceState>>> {
        self.records
            .lock()
            .map_err(|_| Error::State("state store lock poisoned".to_string()))
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(
        &self,
        environment: &str,
        service: &str,
    ) -> Result<Option<PersistedServiceState>> {
        let key = (environment.to_string(), service.to_string());
        Ok(self.records()?.get(&key).cloned())
    }

    async fn save(&self, state: &PersistedServiceState) -> Result<()> {
        let key = (state.environment.clone(), state.service.clone());
        self.records()?.insert(key, state.clone());
        self.mutations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, environment: &str, service: &str) -> Result<bool> {
        let key = (environment.to_string(), service.to_string());
        let existed = self.records()?.remove(&key).is_some();
        if existed {
            self.mutations.fetch_add(1, Ordering::SeqCst);
        }
        Ok(existed)
    }

    async fn list(&self, environment: &str) -> Result<Vec<PersistedServiceState>> {
        Ok(self
            .records()?
            .iter()
            .filter(|((env, _), _)| env == environment)
            .map(|(_, state)| state.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(service: &str) -> PersistedServiceState {
        PersistedServiceState::new(
            service,
            DeploymentTarget::Process,
            "staging",
            ResourceId::process(4321, Some(8080)),
        )
    }

    #[test]
    fn test_file_store_round_trip() {
        smol::block_on(async {
            let dir = TempDir::new().unwrap();
            let store = FileStateStore::new(dir.path());

            assert!(store.load("staging", "api-backend").await.unwrap().is_none());

            let state = record("api-backend");
            store.save(&state).await.unwrap();

            let path = dir.path().join("staging").join("api-backend.json");
            assert!(path.exists());
            assert!(!path.with_extension("json.tmp").exists());

            let loaded = store.load("staging", "api-backend").await.unwrap().unwrap();
            assert_eq!(loaded, state);

            assert!(store.delete("staging", "api-backend").await.unwrap());
            assert!(!store.delete("staging", "api-backend").await.unwrap());
            assert!(store.load("staging", "api-backend").await.unwrap().is_none());
        });
    }

    #[test]
    fn test_file_format_is_camel_case() {
        smol::block_on(async {
            let dir = TempDir::new().unwrap();
            let store = FileStateStore::new(dir.path());
            store.save(&record("gateway")).await.unwrap();

            let raw =
                std::fs::read_to_string(dir.path().join("staging").join("gateway.json")).unwrap();
            let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
            assert_eq!(json["service"], "gateway");
            assert_eq!(json["deployment"], "process");
            assert!(json["startTime"].is_string());
            assert_eq!(json["resourceId"]["pid"], 4321);
            assert_eq!(json["resourceId"]["port"], 8080);
            assert!(json["resourceId"].get("containerId").is_none());
        });
    }

    #[test]
    fn test_list_is_per_environment() {
        smol::block_on(async {
            let dir = TempDir::new().unwrap();
            let store = FileStateStore::new(dir.path());
            store.save(&record("gateway")).await.unwrap();
            store.save(&record("api-backend")).await.unwrap();

            let mut other = record("database");
            other.environment = "production".to_string();
            store.save(&other).await.unwrap();

            let names: Vec<String> = store
                .list("staging")
                .await
                .unwrap()
                .into_iter()
                .map(|s| s.service)
                .collect();
            assert_eq!(names, vec!["api-backend", "gateway"]);
            assert!(store.list("nowhere").await.unwrap().is_empty());
        });
    }

    #[test]
    fn test_rejects_path_traversal() {
        let store = FileStateStore::new("/tmp/state");
        assert!(store.path_for("../etc", "database").is_err());
        assert!(store.path_for("staging", "a/b").is_err());
        assert!(store.path_for("staging", "").is_err());
    }

    #[test]
    fn test_corrupt_record_is_an_error() {
        smol::block_on(async {
            let dir = TempDir::new().unwrap();
            std::fs::create_dir_all(dir.path().join("staging")).unwrap();
            std::fs::write(dir.path().join("staging").join("database.json"), "{not json").unwrap();

            let store = FileStateStore::new(dir.path());
            let err = store.load("staging", "database").await.unwrap_err();
            assert!(matches!(err, Error::State(_)));
        });
    }

    #[test]
    fn test_memory_store_counts_mutations() {
        smol::block_on(async {
            let store = MemoryStateStore::new();
            store.save(&record("gateway")).await.unwrap();
            assert!(!store.delete("staging", "database").await.unwrap());
            assert!(store.delete("staging", "gateway").await.unwrap());
            assert_eq!(store.mutation_count(), 2);
        });
    }

    #[test]
    fn test_resource_matching_uses_common_fields() {
        let recorded = ResourceId {
            container_id: Some("3f2a9c1b7d4e5f60718293a4b5c6d7e8".to_string()),
            container_name: Some("acme-postgres-prod".to_string()),
            port: Some(5432),
            ..ResourceId::default()
        };

        let short = ResourceId::container("3f2a9c1b7d4e", "acme-postgres-prod");
        assert!(recorded.matches(&short));

        let replaced = ResourceId::container("99aa", "acme-postgres-prod");
        assert!(!recorded.matches(&replaced));

        assert!(ResourceId::process(1, None).matches(&ResourceId::process(1, Some(80))));
        assert!(!ResourceId::process(1, None).matches(&ResourceId::process(2, None)));
    }
}
