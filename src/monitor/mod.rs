//! Dataset Monitoring Module
//!
//! Watches relational datasets for two kinds of quality problems:
//! - Schema drift (columns added, removed, or retyped between captures)
//! - Staleness (no capture within the freshness threshold)
//!
//! Findings flow into an incident ledger that keeps at most one open
//! incident per dataset and rule, and resolves it once the problem clears.

pub mod capture;
pub mod diff;
pub mod freshness;
pub mod history;
pub mod incident;
pub mod ledger;
pub mod orchestrator;
pub mod source;

pub use capture::{CaptureId, ColumnSpec, DatasetKey, NewCapture, SchemaCapture};
pub use diff::{DiffEngine, DriftPolicy, SchemaDiff};
pub use freshness::FreshnessPolicy;
pub use history::{CaptureStore, InMemoryCaptureStore};
pub use incident::{Incident, IncidentFilter, IncidentKey, IncidentStatus, RuleType};
pub use ledger::{IncidentLedger, IncidentStore, InMemoryIncidentStore, LedgerOptions, RepeatPolicy};
pub use orchestrator::{CheckReport, MonitorOptions, MonitoringOrchestrator, RunSummary};
pub use source::{CaptureSource, PostgresCaptureSource};
