//! Application state management
//!
//! Contains shared state accessible across all handlers.

use crate::config::MonitoringConfig;
use crate::connection::ConnectionManager;
use crate::monitor::{
    CaptureStore, IncidentLedger, IncidentStore, InMemoryCaptureStore, InMemoryIncidentStore,
    MonitoringOrchestrator,
};
use std::sync::Arc;

/// Application state shared across all handlers
pub struct AppState {
    /// Check pipeline over the capture history and the ledger
    pub orchestrator: Arc<MonitoringOrchestrator>,

    /// Registered source databases
    pub connections: ConnectionManager,

    /// Label of the backing stores, reported by /health
    pub storage: &'static str,
}

impl AppState {
    /// Build state over the given stores
    pub fn new(
        captures: Arc<dyn CaptureStore>,
        incidents: Arc<dyn IncidentStore>,
        monitoring: &MonitoringConfig,
        storage: &'static str,
    ) -> Self {
        let ledger = Arc::new(IncidentLedger::new(incidents, monitoring.ledger_options()));
        let orchestrator = Arc::new(MonitoringOrchestrator::new(
            captures,
            ledger,
            monitoring.monitor_options(),
        ));

        Self {
            orchestrator,
            connections: ConnectionManager::new(),
            storage,
        }
    }

    /// State backed by process memory; nothing survives a restart
    pub fn in_memory(monitoring: &MonitoringConfig) -> Self {
        Self::new(
            Arc::new(InMemoryCaptureStore::new()),
            Arc::new(InMemoryIncidentStore::new()),
            monitoring,
            "memory",
        )
    }

    pub fn ledger(&self) -> &Arc<IncidentLedger> {
        self.orchestrator.ledger()
    }

    pub fn captures(&self) -> &Arc<dyn CaptureStore> {
        self.orchestrator.captures()
    }
}

/// Type alias for shared state
pub type SharedState = Arc<AppState>;
