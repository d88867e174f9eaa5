//! Shared fixtures for orchestration integration tests

#![allow(dead_code)]

use command_executor::ScriptedRunner;
use service_orchestration::platforms::{MockStrategy, PlatformRegistry};
use service_orchestration::{
    CheckDetails, DeploymentTarget, FleetAggregator, MemoryStateStore, OperationDetails,
    OperationResult, RunConfig, ServiceDefinition, ServiceKind,
};
use std::sync::Arc;
use std::time::Duration;

/// Aggregator over a single mock strategy the test can steer
pub struct MockFleet {
    pub mock: Arc<MockStrategy>,
    pub store: Arc<MemoryStateStore>,
    pub fleet: FleetAggregator,
}

pub fn test_config() -> RunConfig {
    RunConfig::new("test").with_restart_grace(Duration::ZERO)
}

pub fn mock_fleet(config: RunConfig) -> MockFleet {
    let mock = Arc::new(MockStrategy::new());
    let store = Arc::new(MemoryStateStore::new());
    let mut registry = PlatformRegistry::new();
    registry.register(mock.clone());
    let fleet = FleetAggregator::new(Arc::new(config), registry, store.clone());
    MockFleet { mock, store, fleet }
}

/// Aggregator with every built-in strategy driving a scripted runner
pub fn scripted_fleet(config: RunConfig) -> (Arc<ScriptedRunner>, Arc<MemoryStateStore>, FleetAggregator) {
    let runner = Arc::new(ScriptedRunner::new());
    let store = Arc::new(MemoryStateStore::new());
    let registry = PlatformRegistry::with_runner(&config, runner.clone());
    let fleet = FleetAggregator::new(Arc::new(config), registry, store.clone());
    (runner, store, fleet)
}

pub fn mock_services(kinds: &[ServiceKind]) -> Vec<ServiceDefinition> {
    kinds
        .iter()
        .map(|kind| ServiceDefinition::new(*kind, DeploymentTarget::Mock))
        .collect()
}

pub fn check_details(result: &OperationResult) -> &CheckDetails {
    match &result.details {
        OperationDetails::Check(details) => details,
        other => panic!("expected check details, got {:?}", other),
    }
}
