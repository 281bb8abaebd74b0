//! Monitoring Orchestrator
//!
//! Runs one check per dataset: fetch the two latest captures, diff them,
//! test freshness of the newest, and hand both findings to the ledger.

use crate::error::AppError;
use crate::monitor::capture::{DatasetKey, NewCapture, SchemaCapture};
use crate::monitor::diff::{DiffEngine, DriftPolicy, SchemaDiff};
use crate::monitor::freshness::{age_hours, FreshnessPolicy};
use crate::monitor::history::{CaptureStore, LatestCaptures};
use crate::monitor::incident::{
    Finding, FreshnessDetails, IncidentDetails, LedgerAction, RuleType, Severity,
};
use crate::monitor::ledger::IncidentLedger;
use crate::monitor::source::CaptureSource;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

const DRIFT_SEVERITY: Severity = Severity::High;
const FRESHNESS_SEVERITY: Severity = Severity::Medium;

/// Orchestrator tuning
#[derive(Debug, Clone, Copy)]
pub struct MonitorOptions {
    pub drift: DriftPolicy,
    pub freshness: FreshnessPolicy,
    /// Upper bound on each capture retrieval and source call
    pub check_timeout: Duration,
    pub max_parallel_checks: usize,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            drift: DriftPolicy::default(),
            freshness: FreshnessPolicy::default(),
            check_timeout: Duration::from_secs(30),
            max_parallel_checks: 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// No capture exists for the dataset
    NoCaptures,
    /// Only one capture exists; nothing to diff against
    InsufficientHistory,
}

/// What happened to one rule during a check
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum RuleOutcome {
    Skipped {
        reason: SkipReason,
    },
    Evaluated {
        problem: bool,
        action: LedgerAction,
    },
}

impl RuleOutcome {
    pub fn action(&self) -> Option<&LedgerAction> {
        match self {
            RuleOutcome::Skipped { .. } => None,
            RuleOutcome::Evaluated { action, .. } => Some(action),
        }
    }
}

/// Result of one dataset check
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckReport {
    pub dataset_key: DatasetKey,
    pub checked_at: DateTime<Utc>,
    pub captures_considered: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<SchemaDiff>,
    pub drift: RuleOutcome,
    pub freshness: RuleOutcome,
    pub opened: usize,
    pub resolved: usize,
    pub refreshed: usize,
    pub unchanged: usize,
    pub skipped: usize,
}

impl CheckReport {
    fn new(
        dataset_key: DatasetKey,
        checked_at: DateTime<Utc>,
        captures_considered: usize,
        diff: Option<SchemaDiff>,
        drift: RuleOutcome,
        freshness: RuleOutcome,
    ) -> Self {
        let mut report = Self {
            dataset_key,
            checked_at,
            captures_considered,
            diff,
            drift,
            freshness,
            opened: 0,
            resolved: 0,
            refreshed: 0,
            unchanged: 0,
            skipped: 0,
        };
        for outcome in [report.drift.clone(), report.freshness.clone()] {
            match outcome.action() {
                None => report.skipped += 1,
                Some(LedgerAction::NoOp) => report.unchanged += 1,
                Some(LedgerAction::Opened(_)) => report.opened += 1,
                Some(LedgerAction::Resolved(_)) => report.resolved += 1,
                Some(LedgerAction::Refreshed(_)) => report.refreshed += 1,
            }
        }
        report
    }
}

/// A dataset whose check aborted during a batch run
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetFailure {
    pub dataset_key: DatasetKey,
    pub error: String,
}

/// Aggregate of a batch run over many datasets
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub datasets_checked: usize,
    pub opened: usize,
    pub resolved: usize,
    pub reports: Vec<CheckReport>,
    pub failures: Vec<DatasetFailure>,
}

/// Coordinates capture history, diffing, freshness and the ledger
pub struct MonitoringOrchestrator {
    captures: Arc<dyn CaptureStore>,
    ledger: Arc<IncidentLedger>,
    options: MonitorOptions,
}

impl MonitoringOrchestrator {
    pub fn new(
        captures: Arc<dyn CaptureStore>,
        ledger: Arc<IncidentLedger>,
        options: MonitorOptions,
    ) -> Self {
        Self {
            captures,
            ledger,
            options,
        }
    }

    pub fn captures(&self) -> &Arc<dyn CaptureStore> {
        &self.captures
    }

    pub fn ledger(&self) -> &Arc<IncidentLedger> {
        &self.ledger
    }

    pub fn options(&self) -> &MonitorOptions {
        &self.options
    }

    /// Check one dataset now
    pub async fn check_dataset(&self, dataset_key: &DatasetKey) -> Result<CheckReport, AppError> {
        self.check_dataset_at(dataset_key, Utc::now()).await
    }

    /// Check one dataset as of `now`. Errors carry the dataset key.
    pub async fn check_dataset_at(
        &self,
        dataset_key: &DatasetKey,
        now: DateTime<Utc>,
    ) -> Result<CheckReport, AppError> {
        self.run_check(dataset_key, now)
            .await
            .map_err(|e| e.for_dataset(dataset_key.as_str()))
    }

    async fn run_check(
        &self,
        dataset_key: &DatasetKey,
        now: DateTime<Utc>,
    ) -> Result<CheckReport, AppError> {
        // Fetched once; later appends do not affect this check
        let latest = match tokio::time::timeout(
            self.options.check_timeout,
            self.captures.latest_two(dataset_key),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(AppError::Storage(format!(
                    "Capture retrieval timed out after {:?}",
                    self.options.check_timeout
                )))
            }
        };

        let (drift, diff) = match &latest {
            LatestCaptures::Pair { newest, previous } => {
                let diff = DiffEngine::diff(previous, newest);
                let problem = diff.has_drift(&self.options.drift);
                let finding = if problem {
                    Finding::Problem {
                        severity: DRIFT_SEVERITY,
                        details: IncidentDetails::SchemaDrift(diff.clone()),
                    }
                } else {
                    Finding::Clear
                };
                let action = self
                    .ledger
                    .evaluate_at(dataset_key, RuleType::SchemaDrift, finding, now)
                    .await?;
                (RuleOutcome::Evaluated { problem, action }, Some(diff))
            }
            LatestCaptures::Single(_) => {
                warn!("Skipping drift for {}: only one capture", dataset_key);
                (
                    RuleOutcome::Skipped {
                        reason: SkipReason::InsufficientHistory,
                    },
                    None,
                )
            }
            LatestCaptures::Empty => (
                RuleOutcome::Skipped {
                    reason: SkipReason::NoCaptures,
                },
                None,
            ),
        };

        let freshness = match latest.newest() {
            Some(newest) => {
                let finding = self.freshness_finding(newest, now);
                let problem = finding.is_problem();
                let action = self
                    .ledger
                    .evaluate_at(dataset_key, RuleType::Freshness, finding, now)
                    .await?;
                RuleOutcome::Evaluated { problem, action }
            }
            None => {
                warn!("Skipping check for {}: no captures", dataset_key);
                RuleOutcome::Skipped {
                    reason: SkipReason::NoCaptures,
                }
            }
        };

        let report = CheckReport::new(
            dataset_key.clone(),
            now,
            latest.len(),
            diff,
            drift,
            freshness,
        );
        info!(
            "Checked {}: opened={} resolved={} unchanged={} skipped={}",
            dataset_key, report.opened, report.resolved, report.unchanged, report.skipped
        );
        Ok(report)
    }

    fn freshness_finding(&self, newest: &SchemaCapture, now: DateTime<Utc>) -> Finding {
        let policy = &self.options.freshness;
        if !policy.is_stale(newest.captured_at, now) {
            return Finding::Clear;
        }
        let age = age_hours(newest.captured_at, now);
        Finding::Problem {
            severity: FRESHNESS_SEVERITY,
            details: IncidentDetails::Freshness(FreshnessDetails {
                message: format!(
                    "Dataset has not been updated in {:.1} hours (threshold {} hours)",
                    age, policy.threshold_hours
                ),
                observed_at: newest.captured_at,
                threshold_hours: policy.threshold_hours,
                age_hours: age,
            }),
        }
    }

    /// Pull the current columns from `source` and append them as a new capture
    pub async fn capture(
        &self,
        source: &dyn CaptureSource,
        dataset_key: &DatasetKey,
    ) -> Result<SchemaCapture, AppError> {
        let columns = match tokio::time::timeout(
            self.options.check_timeout,
            source.fetch_columns(dataset_key),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(AppError::SourceUnavailable(format!(
                "{} did not answer within {:?}",
                source.name(),
                self.options.check_timeout
            ))),
        }
        .map_err(|e| e.for_dataset(dataset_key.as_str()))?;

        self.captures
            .append(NewCapture::new(dataset_key.clone(), columns))
            .await
            .map_err(|e| e.for_dataset(dataset_key.as_str()))
    }

    /// Capture from `source`, then check
    pub async fn capture_and_check(
        &self,
        source: &dyn CaptureSource,
        dataset_key: &DatasetKey,
    ) -> Result<CheckReport, AppError> {
        self.capture(source, dataset_key).await?;
        self.check_dataset(dataset_key).await
    }

    /// Check many datasets concurrently; failures stay per dataset
    pub async fn check_many(self: &Arc<Self>, keys: Vec<DatasetKey>) -> RunSummary {
        self.run_bounded(keys, |this, key| async move { this.check_dataset(&key).await })
            .await
    }

    /// Check every dataset that has at least one capture
    pub async fn check_all(self: &Arc<Self>) -> Result<RunSummary, AppError> {
        let keys = self.captures.datasets().await?;
        Ok(self.check_many(keys).await)
    }

    /// Captured datasets whose key carries the `source` prefix
    pub async fn source_datasets(&self, source: &str) -> Result<Vec<DatasetKey>, AppError> {
        let mut keys = self.captures.datasets().await?;
        keys.retain(|k| k.source() == Some(source));
        Ok(keys)
    }

    /// Check the captured datasets of one source without capturing again
    pub async fn check_source(self: &Arc<Self>, source: &str) -> Result<RunSummary, AppError> {
        let keys = self.source_datasets(source).await?;
        Ok(self.check_many(keys).await)
    }

    /// Discover every dataset of `source`, capture each, then check each
    pub async fn discover_and_check(
        self: &Arc<Self>,
        source: Arc<dyn CaptureSource>,
    ) -> Result<RunSummary, AppError> {
        let keys = match tokio::time::timeout(self.options.check_timeout, source.discover()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(AppError::SourceUnavailable(format!(
                    "{} discovery timed out",
                    source.name()
                )))
            }
        };
        info!("Discovered {} datasets on {}", keys.len(), source.name());

        Ok(self
            .run_bounded(keys, move |this, key| {
                let source = source.clone();
                async move { this.capture_and_check(source.as_ref(), &key).await }
            })
            .await)
    }

    async fn run_bounded<F, Fut>(self: &Arc<Self>, keys: Vec<DatasetKey>, job: F) -> RunSummary
    where
        F: Fn(Arc<Self>, DatasetKey) -> Fut,
        Fut: Future<Output = Result<CheckReport, AppError>> + Send + 'static,
    {
        let started_at = Utc::now();
        let semaphore = Arc::new(Semaphore::new(self.options.max_parallel_checks.max(1)));

        let handles: Vec<_> = keys
            .into_iter()
            .map(|key| {
                let fut = job(self.clone(), key.clone());
                let semaphore = semaphore.clone();
                let handle = tokio::spawn(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|e| AppError::Internal(format!("Check limiter closed: {}", e)))?;
                    fut.await
                });
                (key, handle)
            })
            .collect();

        let mut reports = Vec::new();
        let mut failures = Vec::new();
        for (key, handle) in handles {
            match handle.await {
                Ok(Ok(report)) => reports.push(report),
                Ok(Err(e)) => {
                    error!("Check failed for {}: {}", key, e);
                    failures.push(DatasetFailure {
                        dataset_key: key,
                        error: e.to_string(),
                    });
                }
                Err(join_error) => {
                    error!("Check task for {} aborted: {}", key, join_error);
                    failures.push(DatasetFailure {
                        dataset_key: key,
                        error: format!("check task aborted: {}", join_error),
                    });
                }
            }
        }

        RunSummary {
            started_at,
            finished_at: Utc::now(),
            datasets_checked: reports.len() + failures.len(),
            opened: reports.iter().map(|r| r.opened).sum(),
            resolved: reports.iter().map(|r| r.resolved).sum(),
            reports,
            failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::capture::{CaptureId, ColumnSpec};
    use crate::monitor::history::InMemoryCaptureStore;
    use crate::monitor::incident::{IncidentFilter, IncidentStatus};
    use crate::monitor::ledger::{InMemoryIncidentStore, LedgerOptions};
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use pretty_assertions::assert_eq;
    use std::collections::{BTreeSet, HashMap};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Mutex;

    struct Harness {
        captures: Arc<InMemoryCaptureStore>,
        orchestrator: Arc<MonitoringOrchestrator>,
    }

    fn harness_with(options: MonitorOptions) -> Harness {
        let captures = Arc::new(InMemoryCaptureStore::new());
        let ledger = Arc::new(IncidentLedger::new(
            Arc::new(InMemoryIncidentStore::new()),
            LedgerOptions::default(),
        ));
        let orchestrator = Arc::new(MonitoringOrchestrator::new(
            captures.clone(),
            ledger,
            options,
        ));
        Harness {
            captures,
            orchestrator,
        }
    }

    fn harness() -> Harness {
        harness_with(MonitorOptions::default())
    }

    fn key() -> DatasetKey {
        DatasetKey::new("warehouse:public.users").unwrap()
    }

    fn v1() -> Vec<ColumnSpec> {
        vec![
            ColumnSpec::new("id", "int", false),
            ColumnSpec::new("name", "text", true),
        ]
    }

    fn v2() -> Vec<ColumnSpec> {
        let mut cols = v1();
        cols.push(ColumnSpec::new("email", "text", true));
        cols
    }

    async fn open_incidents(h: &Harness, rule_type: RuleType) -> usize {
        h.orchestrator
            .ledger()
            .list(&IncidentFilter {
                dataset_key: Some(key()),
                rule_type: Some(rule_type),
                status: Some(IncidentStatus::Open),
                ..Default::default()
            })
            .await
            .unwrap()
            .len()
    }

    #[tokio::test]
    async fn test_no_captures_is_a_noop() {
        let h = harness();
        let report = h.orchestrator.check_dataset(&key()).await.unwrap();

        assert_eq!(report.captures_considered, 0);
        assert_eq!(
            report.drift,
            RuleOutcome::Skipped {
                reason: SkipReason::NoCaptures
            }
        );
        assert_eq!(report.skipped, 2);
        assert!(h
            .orchestrator
            .ledger()
            .list(&IncidentFilter::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_single_capture_skips_drift_but_checks_freshness() {
        let h = harness();
        let now = Utc::now();
        h.captures
            .append(NewCapture::new(key(), v1()).at(now - ChronoDuration::hours(30)))
            .await
            .unwrap();

        let report = h.orchestrator.check_dataset_at(&key(), now).await.unwrap();

        assert_eq!(
            report.drift,
            RuleOutcome::Skipped {
                reason: SkipReason::InsufficientHistory
            }
        );
        assert!(matches!(
            report.freshness.action(),
            Some(LedgerAction::Opened(_))
        ));
        assert_eq!(report.opened, 1);
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn test_added_column_opens_then_identical_capture_resolves() {
        let h = harness();
        let now = Utc::now();
        h.captures
            .append(NewCapture::new(key(), v1()).at(now - ChronoDuration::hours(2)))
            .await
            .unwrap();
        h.captures
            .append(NewCapture::new(key(), v2()).at(now - ChronoDuration::hours(1)))
            .await
            .unwrap();

        let first = h.orchestrator.check_dataset_at(&key(), now).await.unwrap();
        let diff = first.diff.clone().unwrap();
        assert_eq!(diff.added, BTreeSet::from(["email".to_string()]));
        assert!(diff.removed.is_empty());
        assert!(diff.type_changed.is_empty());
        assert!(matches!(
            first.drift,
            RuleOutcome::Evaluated {
                problem: true,
                action: LedgerAction::Opened(_)
            }
        ));
        assert_eq!(open_incidents(&h, RuleType::SchemaDrift).await, 1);

        // Re-running with the same history changes nothing
        let rerun = h.orchestrator.check_dataset_at(&key(), now).await.unwrap();
        assert_eq!(rerun.opened, 0);
        assert_eq!(rerun.unchanged, 2);
        assert_eq!(open_incidents(&h, RuleType::SchemaDrift).await, 1);

        h.captures
            .append(NewCapture::new(key(), v2()).at(now))
            .await
            .unwrap();
        let resolved = h.orchestrator.check_dataset_at(&key(), now).await.unwrap();
        assert!(!resolved.diff.unwrap().has_drift(&DriftPolicy::default()));
        assert!(matches!(
            resolved.drift.action(),
            Some(LedgerAction::Resolved(incident)) if incident.resolved_at.is_some()
        ));
        assert_eq!(open_incidents(&h, RuleType::SchemaDrift).await, 0);
    }

    #[tokio::test]
    async fn test_stale_capture_opens_freshness_and_fresh_one_resolves() {
        let h = harness();
        let now = Utc::now();
        h.captures
            .append(NewCapture::new(key(), v1()).at(now - ChronoDuration::hours(30)))
            .await
            .unwrap();

        let stale = h.orchestrator.check_dataset_at(&key(), now).await.unwrap();
        match stale.freshness.action() {
            Some(LedgerAction::Opened(incident)) => {
                assert_eq!(incident.severity, Severity::Medium);
                match &incident.details {
                    IncidentDetails::Freshness(details) => {
                        assert!((details.age_hours - 30.0).abs() < 0.01);
                        assert_eq!(details.threshold_hours, 24.0);
                    }
                    other => panic!("unexpected details {:?}", other),
                }
            }
            other => panic!("expected opened, got {:?}", other),
        }

        h.captures
            .append(NewCapture::new(key(), v1()).at(now - ChronoDuration::hours(1)))
            .await
            .unwrap();
        let fresh = h.orchestrator.check_dataset_at(&key(), now).await.unwrap();
        assert!(matches!(
            fresh.freshness.action(),
            Some(LedgerAction::Resolved(_))
        ));
        assert_eq!(fresh.resolved, 1);
        assert_eq!(open_incidents(&h, RuleType::Freshness).await, 0);
    }

    #[tokio::test]
    async fn test_nullability_policy_is_honored() {
        let h = harness_with(MonitorOptions {
            drift: DriftPolicy {
                nullability_is_drift: true,
            },
            ..Default::default()
        });
        let now = Utc::now();
        let mut flipped = v1();
        flipped[1].nullable = false;
        h.captures.append(NewCapture::new(key(), v1()).at(now)).await.unwrap();
        h.captures.append(NewCapture::new(key(), flipped).at(now)).await.unwrap();

        let report = h.orchestrator.check_dataset_at(&key(), now).await.unwrap();
        assert_eq!(report.opened, 1);
    }

    /// Appends a drifted capture right after the orchestrator reads history
    struct AppendingStore {
        inner: InMemoryCaptureStore,
        fired: AtomicBool,
    }

    #[async_trait]
    impl CaptureStore for AppendingStore {
        async fn append(&self, capture: NewCapture) -> Result<SchemaCapture, AppError> {
            self.inner.append(capture).await
        }

        async fn history(
            &self,
            dataset_key: &DatasetKey,
            limit: usize,
        ) -> Result<Vec<SchemaCapture>, AppError> {
            let result = self.inner.history(dataset_key, limit).await;
            if !self.fired.swap(true, Ordering::SeqCst) {
                let mut cols = v2();
                cols.push(ColumnSpec::new("late", "text", true));
                self.inner
                    .append(NewCapture::new(dataset_key.clone(), cols))
                    .await?;
            }
            result
        }

        async fn get(&self, id: CaptureId) -> Result<Option<SchemaCapture>, AppError> {
            self.inner.get(id).await
        }

        async fn datasets(&self) -> Result<Vec<DatasetKey>, AppError> {
            self.inner.datasets().await
        }
    }

    #[tokio::test]
    async fn test_check_uses_captures_fetched_at_start() {
        let store = Arc::new(AppendingStore {
            inner: InMemoryCaptureStore::new(),
            fired: AtomicBool::new(true),
        });
        let first = store.append(NewCapture::new(key(), v1())).await.unwrap();
        let second = store.append(NewCapture::new(key(), v1())).await.unwrap();
        store.fired.store(false, Ordering::SeqCst);

        let ledger = Arc::new(IncidentLedger::new(
            Arc::new(InMemoryIncidentStore::new()),
            LedgerOptions::default(),
        ));
        let orchestrator = MonitoringOrchestrator::new(store.clone(), ledger, MonitorOptions::default());

        let report = orchestrator.check_dataset(&key()).await.unwrap();
        let provenance = report.diff.unwrap().provenance.unwrap();
        assert_eq!(provenance.from_capture, first.id);
        assert_eq!(provenance.to_capture, second.id);
        assert_eq!(report.opened, 0);
        assert_eq!(store.history(&key(), 10).await.unwrap().len(), 3);
    }

    /// Store whose history reads never complete
    struct HangingStore;

    #[async_trait]
    impl CaptureStore for HangingStore {
        async fn append(&self, capture: NewCapture) -> Result<SchemaCapture, AppError> {
            Ok(capture.into_capture(CaptureId(1), Utc::now()))
        }

        async fn history(
            &self,
            _dataset_key: &DatasetKey,
            _limit: usize,
        ) -> Result<Vec<SchemaCapture>, AppError> {
            std::future::pending().await
        }

        async fn get(&self, _id: CaptureId) -> Result<Option<SchemaCapture>, AppError> {
            Ok(None)
        }

        async fn datasets(&self) -> Result<Vec<DatasetKey>, AppError> {
            Ok(vec![key()])
        }
    }

    #[tokio::test]
    async fn test_capture_retrieval_timeout_is_storage_error() {
        let ledger = Arc::new(IncidentLedger::new(
            Arc::new(InMemoryIncidentStore::new()),
            LedgerOptions::default(),
        ));
        let orchestrator = Arc::new(MonitoringOrchestrator::new(
            Arc::new(HangingStore),
            ledger.clone(),
            MonitorOptions {
                check_timeout: Duration::from_millis(20),
                ..Default::default()
            },
        ));

        let err = orchestrator.check_dataset(&key()).await.unwrap_err();
        match &err {
            AppError::DatasetCheck { dataset_key, source } => {
                assert_eq!(dataset_key, &key().to_string());
                assert!(matches!(**source, AppError::Storage(_)));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(err.to_string().contains("timed out"));

        let summary = orchestrator.check_all().await.unwrap();
        assert!(summary.reports.is_empty());
        assert_eq!(summary.failures.len(), 1);
        assert!(ledger.list(&IncidentFilter::default()).await.unwrap().is_empty());
    }

    /// Source backed by a map; missing keys fail, `slow` keys hang
    struct FakeSource {
        tables: Mutex<HashMap<DatasetKey, Vec<ColumnSpec>>>,
        slow: Option<DatasetKey>,
    }

    #[async_trait]
    impl CaptureSource for FakeSource {
        fn name(&self) -> &str {
            "fake"
        }

        async fn discover(&self) -> Result<Vec<DatasetKey>, AppError> {
            let mut keys: Vec<_> = self.tables.lock().await.keys().cloned().collect();
            if let Some(slow) = &self.slow {
                keys.push(slow.clone());
            }
            keys.push(DatasetKey::new("fake:public.broken").unwrap());
            keys.sort();
            Ok(keys)
        }

        async fn fetch_columns(&self, dataset_key: &DatasetKey) -> Result<Vec<ColumnSpec>, AppError> {
            if self.slow.as_ref() == Some(dataset_key) {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            self.tables
                .lock()
                .await
                .get(dataset_key)
                .cloned()
                .ok_or_else(|| AppError::SourceUnavailable(format!("{} unreachable", dataset_key)))
        }
    }

    #[tokio::test]
    async fn test_source_failure_is_tagged_with_dataset() {
        let h = harness();
        let source = FakeSource {
            tables: Mutex::new(HashMap::new()),
            slow: None,
        };
        let err = h.orchestrator.capture(&source, &key()).await.unwrap_err();
        match err {
            AppError::DatasetCheck { dataset_key, source } => {
                assert_eq!(dataset_key, key().to_string());
                assert!(matches!(*source, AppError::SourceUnavailable(_)));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_source_timeout_aborts_only_that_dataset() {
        let h = harness_with(MonitorOptions {
            check_timeout: Duration::from_millis(50),
            ..Default::default()
        });
        let good = DatasetKey::new("fake:public.good").unwrap();
        let slow = DatasetKey::new("fake:public.slow").unwrap();
        let source: Arc<dyn CaptureSource> = Arc::new(FakeSource {
            tables: Mutex::new(HashMap::from([(good.clone(), v1())])),
            slow: Some(slow.clone()),
        });

        let summary = h.orchestrator.discover_and_check(source).await.unwrap();

        assert_eq!(summary.datasets_checked, 3);
        assert_eq!(summary.reports.len(), 1);
        assert_eq!(summary.reports[0].dataset_key, good);
        let failed: Vec<_> = summary.failures.iter().map(|f| f.dataset_key.clone()).collect();
        assert!(failed.contains(&slow));
        assert!(failed.contains(&DatasetKey::new("fake:public.broken").unwrap()));
        assert_eq!(h.captures.datasets().await.unwrap(), vec![good]);
    }

    #[tokio::test]
    async fn test_check_source_only_touches_its_datasets() {
        let h = harness();
        let old = Utc::now() - ChronoDuration::hours(30);
        for raw in ["lake:public.a", "lake:public.b", "warehouse:public.a", "lakehouse:public.a"] {
            let k = DatasetKey::new(raw).unwrap();
            h.captures
                .append(NewCapture::new(k, v1()).at(old))
                .await
                .unwrap();
        }

        let keys = h.orchestrator.source_datasets("lake").await.unwrap();
        assert_eq!(
            keys,
            vec![
                DatasetKey::new("lake:public.a").unwrap(),
                DatasetKey::new("lake:public.b").unwrap(),
            ]
        );

        let summary = h.orchestrator.check_source("lake").await.unwrap();
        assert_eq!(summary.datasets_checked, 2);
        // Only freshness can fire on a single stale capture
        assert_eq!(summary.opened, 2);

        let lake_incidents = h
            .orchestrator
            .ledger()
            .list(&IncidentFilter::for_source("lake"))
            .await
            .unwrap();
        assert_eq!(lake_incidents.len(), 2);
        assert!(h
            .orchestrator
            .ledger()
            .list(&IncidentFilter::for_source("warehouse"))
            .await
            .unwrap()
            .is_empty());

        let empty = h.orchestrator.check_source("nowhere").await.unwrap();
        assert_eq!(empty.datasets_checked, 0);
    }

    #[tokio::test]
    async fn test_check_all_runs_every_dataset() {
        let h = harness_with(MonitorOptions {
            max_parallel_checks: 2,
            ..Default::default()
        });
        let now = Utc::now();
        for i in 0..5 {
            let k = DatasetKey::new(format!("warehouse:public.t{}", i)).unwrap();
            h.captures
                .append(NewCapture::new(k.clone(), v1()).at(now - ChronoDuration::hours(48)))
                .await
                .unwrap();
            h.captures
                .append(NewCapture::new(k, v2()).at(now - ChronoDuration::hours(47)))
                .await
                .unwrap();
        }

        let summary = h.orchestrator.check_all().await.unwrap();
        assert_eq!(summary.datasets_checked, 5);
        assert!(summary.failures.is_empty());
        // Each dataset drifted and is stale
        assert_eq!(summary.opened, 10);

        let again = h.orchestrator.check_all().await.unwrap();
        assert_eq!(again.opened, 0);
        assert_eq!(again.resolved, 0);
    }
}
