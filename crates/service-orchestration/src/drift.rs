//! Drift detection between persisted records and live platform status.

use crate::Result;
use crate::state::{PersistedServiceState, ResourceId, StateStore};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

/// What the platform says about a service right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LiveStatus {
    /// Up
    Running,
    /// Down or absent
    Stopped,
    /// The platform cannot tell
    Unknown,
}

/// Why a record and the platform disagree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DriftReason {
    /// Running, but not the instance that was recorded
    ResourceIdentifierChanged,
    /// Recorded, but nothing is running
    StaleStateRecord,
    /// Running, but never recorded
    UntrackedProcess,
    /// The platform could not report a status
    LiveStatusUnknown,
}

impl fmt::Display for DriftReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DriftReason::ResourceIdentifierChanged => "resource identifier changed",
            DriftReason::StaleStateRecord => "stale state record",
            DriftReason::UntrackedProcess => "untracked process",
            DriftReason::LiveStatusUnknown => "live status unknown",
        })
    }
}

/// Outcome of reconciling one service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriftReport {
    /// Record and platform agree
    pub verified: bool,
    /// Why they do not
    pub reason: Option<DriftReason>,
    /// A stale record was removed
    pub record_deleted: bool,
}

impl DriftReport {
    fn verified() -> Self {
        Self {
            verified: true,
            reason: None,
            record_deleted: false,
        }
    }

    fn drift(reason: DriftReason) -> Self {
        Self {
            verified: false,
            reason: Some(reason),
            record_deleted: false,
        }
    }
}

/// Classify a record against live status without side effects
///
/// A running service without a live identifier counts as matching: the
/// platform could not name the instance, so there is nothing to compare.
pub fn classify(
    record: Option<&PersistedServiceState>,
    status: LiveStatus,
    live: Option<&ResourceId>,
) -> DriftReport {
    match (record, status) {
        (_, LiveStatus::Unknown) => DriftReport::drift(DriftReason::LiveStatusUnknown),
        (Some(record), LiveStatus::Running) => match live {
            Some(live) if !record.resource_id.matches(live) => {
                DriftReport::drift(DriftReason::ResourceIdentifierChanged)
            }
            _ => DriftReport::verified(),
        },
        (Some(_), LiveStatus::Stopped) => DriftReport::drift(DriftReason::StaleStateRecord),
        (None, LiveStatus::Running) => DriftReport::drift(DriftReason::UntrackedProcess),
        (None, LiveStatus::Stopped) => DriftReport::verified(),
    }
}

/// Reconciles records with live status, healing stale records
pub struct DriftDetector<'a> {
    store: &'a dyn StateStore,
}

impl<'a> DriftDetector<'a> {
    /// Detector backed by the given store
    pub fn new(store: &'a dyn StateStore) -> Self {
        Self { store }
    }

    /// Classify, then delete the record when it is stale
    pub async fn reconcile(
        &self,
        environment: &str,
        service: &str,
        record: Option<&PersistedServiceState>,
        status: LiveStatus,
        live: Option<&ResourceId>,
    ) -> Result<DriftReport> {
        let mut report = classify(record, status, live);

        match report.reason {
            Some(DriftReason::StaleStateRecord) => {
                report.record_deleted = self.store.delete(environment, service).await?;
                info!(
                    "Removed stale state record for {} in {}",
                    service, environment
                );
            }
            Some(reason) => warn!("State drift for {}: {}", service, reason),
            None => {}
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeploymentTarget;
    use crate::state::MemoryStateStore;

    fn record(resource: ResourceId) -> PersistedServiceState {
        PersistedServiceState::new("api-backend", DeploymentTarget::Process, "test", resource)
    }

    #[test]
    fn test_classification_table() {
        let recorded = record(ResourceId::process(100, Some(8080)));
        let same = ResourceId::process(100, Some(8080));
        let other = ResourceId::process(200, Some(8080));

        let report = classify(Some(&recorded), LiveStatus::Running, Some(&same));
        assert!(report.verified);
        assert_eq!(report.reason, None);

        let report = classify(Some(&recorded), LiveStatus::Running, Some(&other));
        assert!(!report.verified);
        assert_eq!(report.reason, Some(DriftReason::ResourceIdentifierChanged));

        let report = classify(Some(&recorded), LiveStatus::Stopped, None);
        assert!(!report.verified);
        assert_eq!(report.reason, Some(DriftReason::StaleStateRecord));

        let report = classify(None, LiveStatus::Running, Some(&same));
        assert!(!report.verified);
        assert_eq!(report.reason, Some(DriftReason::UntrackedProcess));

        let report = classify(None, LiveStatus::Stopped, None);
        assert!(report.verified);
        assert_eq!(report.reason, None);
    }

    #[test]
    fn test_unknown_status_is_never_verified() {
        let recorded = record(ResourceId::arn("arn:aws:ecs:eu-west-1:1:service/c/api"));
        for record in [Some(&recorded), None] {
            let report = classify(record, LiveStatus::Unknown, None);
            assert!(!report.verified);
            assert_eq!(report.reason, Some(DriftReason::LiveStatusUnknown));
        }
    }

    #[test]
    fn test_running_without_live_identifier_matches() {
        let recorded = record(ResourceId::process(100, None));
        assert!(classify(Some(&recorded), LiveStatus::Running, None).verified);
    }

    #[test]
    fn test_reconcile_deletes_only_stale_records() {
        smol::block_on(async {
            let store = MemoryStateStore::new();
            let recorded = record(ResourceId::process(100, None));
            store.save(&recorded).await.unwrap();
            let detector = DriftDetector::new(&store);

            let report = detector
                .reconcile("test", "api-backend", Some(&recorded), LiveStatus::Unknown, None)
                .await
                .unwrap();
            assert!(!report.record_deleted);
            assert!(store.load("test", "api-backend").await.unwrap().is_some());

            let report = detector
                .reconcile("test", "api-backend", Some(&recorded), LiveStatus::Stopped, None)
                .await
                .unwrap();
            assert!(report.record_deleted);
            assert!(store.load("test", "api-backend").await.unwrap().is_none());

            let report = detector
                .reconcile("test", "api-backend", None, LiveStatus::Stopped, None)
                .await
                .unwrap();
            assert!(report.verified);
        });
    }
}
