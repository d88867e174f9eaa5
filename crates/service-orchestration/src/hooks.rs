//! Per-kind hooks around strategy calls.

use crate::config::{DeploymentTarget, ServiceKind};
use crate::context::{OperationRequest, ServiceContext};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Override points around every operation
///
/// Both methods run after the dry-run short-circuit. An error from either
/// fails the operation like a strategy error would.
#[async_trait]
pub trait ServiceHooks: Send + Sync {
    /// Runs before the strategy
    async fn before(&self, _request: &OperationRequest, _ctx: &ServiceContext) -> Result<()> {
        Ok(())
    }

    /// Runs after the strategy succeeded
    async fn after(&self, _request: &OperationRequest, _ctx: &ServiceContext) -> Result<()> {
        Ok(())
    }
}

/// Hooks that do nothing
#[derive(Debug, Default)]
pub struct NoopHooks;

impl ServiceHooks for NoopHooks {}

/// Makes sure local storage exists before a filesystem process starts
#[derive(Debug, Default)]
pub struct FilesystemHooks;

#[async_trait]
impl ServiceHooks for FilesystemHooks {
    async fn before(&self, request: &OperationRequest, ctx: &ServiceContext) -> Result<()> {
        if *request != OperationRequest::Start || ctx.deployment() != DeploymentTarget::Process {
            return Ok(());
        }
        if let Some(path) = &ctx.settings().storage_path {
            smol::fs::create_dir_all(path).await?;
            info!("Ensured storage path {} for {}", path.display(), ctx.service());
        }
        Ok(())
    }
}

/// Refuses to restore a database from a backup that is not there
#[derive(Debug, Default)]
pub struct DatabaseHooks;

#[async_trait]
impl ServiceHooks for DatabaseHooks {
    async fn before(&self, request: &OperationRequest, ctx: &ServiceContext) -> Result<()> {
        let OperationRequest::Restore { artifact } = request else {
            return Ok(());
        };
        // Cloud artifacts are snapshot ids, checked by the provider
        if !matches!(
            ctx.deployment(),
            DeploymentTarget::Process | DeploymentTarget::Container
        ) {
            return Ok(());
        }

        match artifact {
            Some(artifact) => match smol::fs::metadata(artifact).await {
                Ok(_) => Ok(()),
                Err(_) => Err(Error::Config(format!(
                    "backup artifact {} does not exist",
                    artifact
                ))),
            },
            None => match ctx.latest_backup().await? {
                Some(_) => Ok(()),
                None => Err(Error::Config(format!(
                    "no backups of {} under {}",
                    ctx.service(),
                    ctx.backup_root().display()
                ))),
            },
        }
    }
}

/// Hooks for a service kind
pub fn hooks_for(kind: ServiceKind) -> Arc<dyn ServiceHooks> {
    match kind {
        ServiceKind::Filesystem => Arc::new(FilesystemHooks),
        ServiceKind::Database => Arc::new(DatabaseHooks),
        _ => Arc::new(NoopHooks),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RunConfig, ServiceDefinition};
    use crate::platforms::MockStrategy;
    use crate::state::MemoryStateStore;

    fn context(definition: ServiceDefinition, config: RunConfig) -> ServiceContext {
        ServiceContext::new(
            definition,
            Arc::new(config),
            Arc::new(MockStrategy::new()),
            Arc::new(MemoryStateStore::new()),
        )
    }

    #[test]
    fn test_filesystem_start_creates_storage_path() {
        smol::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let storage = dir.path().join("shared").join("files");
            let ctx = context(
                ServiceDefinition::new(ServiceKind::Filesystem, DeploymentTarget::Process)
                    .with_storage_path(&storage),
                RunConfig::new("test"),
            );

            FilesystemHooks.before(&OperationRequest::Check, &ctx).await.unwrap();
            assert!(!storage.exists());

            FilesystemHooks.before(&OperationRequest::Start, &ctx).await.unwrap();
            assert!(storage.is_dir());
        });
    }

    #[test]
    fn test_database_restore_requires_artifact() {
        smol::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let ctx = context(
                ServiceDefinition::new(ServiceKind::Database, DeploymentTarget::Container),
                RunConfig::new("test").with_data_dir(dir.path()),
            );

            let missing = OperationRequest::Restore {
                artifact: Some(dir.path().join("nope").display().to_string()),
            };
            let err = DatabaseHooks.before(&missing, &ctx).await.unwrap_err();
            assert!(err.to_string().contains("does not exist"));

            let dump = dir.path().join("db.sql");
            std::fs::write(&dump, "-- dump").unwrap();
            let explicit = OperationRequest::Restore {
                artifact: Some(dump.display().to_string()),
            };
            assert!(DatabaseHooks.before(&explicit, &ctx).await.is_ok());

            let latest = OperationRequest::Restore { artifact: None };
            assert!(DatabaseHooks.before(&latest, &ctx).await.is_err());

            std::fs::create_dir_all(ctx.backup_root().join("20240101T000000Z")).unwrap();
            assert!(DatabaseHooks.before(&latest, &ctx).await.is_ok());
        });
    }

    #[test]
    fn test_database_cloud_restore_is_not_checked_locally() {
        smol::block_on(async {
            let ctx = context(
                ServiceDefinition::new(ServiceKind::Database, DeploymentTarget::Cloud),
                RunConfig::new("test"),
            );
            let request = OperationRequest::Restore {
                artifact: Some("acme-db-snap-1".to_string()),
            };
            assert!(DatabaseHooks.before(&request, &ctx).await.is_ok());
        });
    }
}
