//! Incident Ledger
//!
//! Opens, deduplicates and resolves incidents. For every
//! `(dataset_key, rule_type)` at most one incident is open at any time.
//!
//! Two layers keep that true under concurrency:
//! - an in-process async mutex per key serializes evaluate-and-mutate,
//! - stores make `insert_open` and `resolve` conditional writes that fail
//!   with `ConcurrencyConflict` instead of breaking the invariant (this
//!   covers other processes sharing the same database).

use crate::error::{storage_error, validation_error, AppError};
use crate::monitor::capture::DatasetKey;
use crate::monitor::incident::{
    Finding, Incident, IncidentDetails, IncidentFilter, IncidentKey, IncidentStatus, LedgerAction,
    RuleType, Severity,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Persistence for incidents
#[async_trait]
pub trait IncidentStore: Send + Sync {
    /// The open incident for `key`, if any
    async fn find_open(&self, key: &IncidentKey) -> Result<Option<Incident>, AppError>;

    /// Insert an open incident. Fails with `ConcurrencyConflict` if one is already open for its key.
    async fn insert_open(&self, incident: Incident) -> Result<Incident, AppError>;

    /// Mark an open incident resolved. Fails with `ConcurrencyConflict` if it is no longer open.
    async fn resolve(&self, id: Uuid, resolved_at: DateTime<Utc>) -> Result<Incident, AppError>;

    /// Replace severity and details of an open incident. Same conflict rule as `resolve`.
    async fn refresh(
        &self,
        id: Uuid,
        severity: Severity,
        details: IncidentDetails,
    ) -> Result<Incident, AppError>;

    async fn get(&self, id: Uuid) -> Result<Option<Incident>, AppError>;

    /// Incidents matching `filter`, newest first
    async fn list(&self, filter: &IncidentFilter) -> Result<Vec<Incident>, AppError>;
}

/// In-memory incident store
pub struct InMemoryIncidentStore {
    incidents: Arc<RwLock<HashMap<Uuid, Incident>>>,
    /// Key -> id of its open incident
    open: Arc<RwLock<HashMap<IncidentKey, Uuid>>>,
}

impl InMemoryIncidentStore {
    pub fn new() -> Self {
        Self {
            incidents: Arc::new(RwLock::new(HashMap::new())),
            open: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryIncidentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IncidentStore for InMemoryIncidentStore {
    async fn find_open(&self, key: &IncidentKey) -> Result<Option<Incident>, AppError> {
        let open = self.open.read().await;
        let Some(id) = open.get(key) else {
            return Ok(None);
        };
        let incidents = self.incidents.read().await;
        Ok(incidents.get(id).filter(|i| i.is_open()).cloned())
    }

    async fn insert_open(&self, incident: Incident) -> Result<Incident, AppError> {
        if !incident.is_open() {
            return Err(validation_error("Only open incidents can be inserted"));
        }
        // Lock order: open, then incidents
        let mut open = self.open.write().await;
        let key = incident.key();
        if let Some(existing) = open.get(&key) {
            return Err(AppError::ConcurrencyConflict(format!(
                "Incident {} is already open for {}",
                existing, key
            )));
        }
        let mut incidents = self.incidents.write().await;
        open.insert(key, incident.id);
        incidents.insert(incident.id, incident.clone());
        Ok(incident)
    }

    async fn resolve(&self, id: Uuid, resolved_at: DateTime<Utc>) -> Result<Incident, AppError> {
        let mut open = self.open.write().await;
        let mut incidents = self.incidents.write().await;
        let incident = incidents
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("Incident {} not found", id)))?;
        if !incident.is_open() {
            return Err(AppError::ConcurrencyConflict(format!(
                "Incident {} is already resolved",
                id
            )));
        }
        incident.status = IncidentStatus::Resolved;
        incident.resolved_at = Some(resolved_at);
        open.remove(&incident.key());
        Ok(incident.clone())
    }

    async fn refresh(
        &self,
        id: Uuid,
        severity: Severity,
        details: IncidentDetails,
    ) -> Result<Incident, AppError> {
        let mut incidents = self.incidents.write().await;
        let incident = incidents
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("Incident {} not found", id)))?;
        if !incident.is_open() {
            return Err(AppError::ConcurrencyConflict(format!(
                "Incident {} is resolved and cannot change",
                id
            )));
        }
        incident.severity = severity;
        incident.details = details;
        Ok(incident.clone())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Incident>, AppError> {
        let incidents = self.incidents.read().await;
        Ok(incidents.get(&id).cloned())
    }

    async fn list(&self, filter: &IncidentFilter) -> Result<Vec<Incident>, AppError> {
        let incidents = self.incidents.read().await;
        let mut list: Vec<Incident> = incidents
            .values()
            .filter(|i| filter.matches(i))
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(list)
    }
}

/// Per-key async mutexes
#[derive(Default)]
pub struct KeyLocks {
    locks: Mutex<HashMap<IncidentKey, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `key`, giving up after `timeout`
    pub async fn acquire(
        &self,
        key: &IncidentKey,
        timeout: Duration,
    ) -> Result<OwnedMutexGuard<()>, AppError> {
        let lock = {
            let mut locks = self.locks.lock().await;
            // Drop entries nobody holds or waits on
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            locks.entry(key.clone()).or_default().clone()
        };

        tokio::time::timeout(timeout, lock.lock_owned())
            .await
            .map_err(|_| {
                AppError::ConcurrencyConflict(format!(
                    "Timed out after {:?} waiting for lock on {}",
                    timeout, key
                ))
            })
    }
}

/// What happens when a problem is detected while an incident is already open
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeatPolicy {
    /// Leave the open incident as it was first recorded
    #[default]
    KeepFirst,
    /// Replace the open incident's details with the latest finding
    RefreshDetails,
}

/// Ledger tuning
#[derive(Debug, Clone, Copy)]
pub struct LedgerOptions {
    pub repeat_policy: RepeatPolicy,
    pub lock_timeout: Duration,
}

impl Default for LedgerOptions {
    fn default() -> Self {
        Self {
            repeat_policy: RepeatPolicy::KeepFirst,
            lock_timeout: Duration::from_secs(5),
        }
    }
}

/// The incident state machine
pub struct IncidentLedger {
    store: Arc<dyn IncidentStore>,
    locks: KeyLocks,
    options: LedgerOptions,
}

impl IncidentLedger {
    pub fn new(store: Arc<dyn IncidentStore>, options: LedgerOptions) -> Self {
        Self {
            store,
            locks: KeyLocks::new(),
            options,
        }
    }

    /// Apply a finding for `(dataset_key, rule_type)` at the current time
    pub async fn evaluate(
        &self,
        dataset_key: &DatasetKey,
        rule_type: RuleType,
        finding: Finding,
    ) -> Result<LedgerAction, AppError> {
        self.evaluate_at(dataset_key, rule_type, finding, Utc::now())
            .await
    }

    /// Apply a finding as of `now`. A conflict is retried once with the
    /// lock re-acquired; a second conflict surfaces as a storage error.
    pub async fn evaluate_at(
        &self,
        dataset_key: &DatasetKey,
        rule_type: RuleType,
        finding: Finding,
        now: DateTime<Utc>,
    ) -> Result<LedgerAction, AppError> {
        if let Finding::Problem { details, .. } = &finding {
            if details.rule_type() != rule_type {
                return Err(validation_error(format!(
                    "{} details cannot be recorded as a {} incident",
                    details.rule_type(),
                    rule_type
                )));
            }
        }

        let key = IncidentKey::new(dataset_key.clone(), rule_type);
        match self.evaluate_locked(&key, &finding, now).await {
            Err(AppError::ConcurrencyConflict(first)) => {
                warn!("Conflict on {}: {}; retrying once", key, first);
                match self.evaluate_locked(&key, &finding, now).await {
                    Err(AppError::ConcurrencyConflict(second)) => Err(storage_error(format!(
                        "Giving up on {} after retry: {}",
                        key, second
                    ))),
                    other => other,
                }
            }
            other => other,
        }
    }

    async fn evaluate_locked(
        &self,
        key: &IncidentKey,
        finding: &Finding,
        now: DateTime<Utc>,
    ) -> Result<LedgerAction, AppError> {
        let _guard = self.locks.acquire(key, self.options.lock_timeout).await?;
        let existing = self.store.find_open(key).await?;

        match (finding, existing) {
            (Finding::Problem { severity, details }, None) => {
                let incident = Incident::open(key, *severity, details.clone(), now);
                let incident = self.store.insert_open(incident).await?;
                info!(
                    "Opened {} incident {} for dataset {} (severity {})",
                    incident.rule_type, incident.id, incident.dataset_key, incident.severity
                );
                Ok(LedgerAction::Opened(incident))
            }
            (Finding::Problem { severity, details }, Some(open)) => {
                match self.options.repeat_policy {
                    RepeatPolicy::KeepFirst => {
                        debug!("{} already has open incident {}", key, open.id);
                        Ok(LedgerAction::NoOp)
                    }
                    RepeatPolicy::RefreshDetails => {
                        if open.severity == *severity && open.details == *details {
                            return Ok(LedgerAction::NoOp);
                        }
                        let refreshed = self
                            .store
                            .refresh(open.id, *severity, details.clone())
                            .await?;
                        info!("Refreshed details of incident {} for {}", refreshed.id, key);
                        Ok(LedgerAction::Refreshed(refreshed))
                    }
                }
            }
            (Finding::Clear, Some(open)) => {
                let resolved = self.store.resolve(open.id, now).await?;
                info!(
                    "Resolved {} incident {} for dataset {}",
                    resolved.rule_type, resolved.id, resolved.dataset_key
                );
                Ok(LedgerAction::Resolved(resolved))
            }
            (Finding::Clear, None) => {
                debug!("{} is clear with nothing open", key);
                Ok(LedgerAction::NoOp)
            }
        }
    }

    pub async fn open_incident(
        &self,
        dataset_key: &DatasetKey,
        rule_type: RuleType,
    ) -> Result<Option<Incident>, AppError> {
        self.store
            .find_open(&IncidentKey::new(dataset_key.clone(), rule_type))
            .await
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Incident>, AppError> {
        self.store.get(id).await
    }

    pub async fn list(&self, filter: &IncidentFilter) -> Result<Vec<Incident>, AppError> {
        self.store.list(filter).await
    }
}
