//! PostgreSQL-backed incident store
//!
//! The partial unique index `ux_incidents_open_key` backs the
//! one-open-incident-per-key rule across processes.

use crate::db::{corrupt_row, queries};
use crate::error::AppError;
use crate::monitor::incident::{IncidentDetails, Severity};
use crate::monitor::{
    DatasetKey, Incident, IncidentFilter, IncidentKey, IncidentStatus, IncidentStore, RuleType,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use postgres_types::{Json, ToSql};
use tokio_postgres::error::SqlState;
use tokio_postgres::Row;
use tracing::debug;
use uuid::Uuid;

pub struct PgIncidentStore {
    pool: Pool,
}

impl PgIncidentStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

fn incident_from_row(row: &Row) -> Result<Incident, AppError> {
    let dataset_key = DatasetKey::new(row.get::<_, String>("dataset_key"))
        .map_err(|e| corrupt_row("incident", e))?;
    let rule_type: RuleType = row
        .get::<_, String>("rule_type")
        .parse()
        .map_err(|e| corrupt_row("incident", e))?;
    let severity: Severity = row
        .get::<_, String>("severity")
        .parse()
        .map_err(|e| corrupt_row("incident", e))?;
    let status: IncidentStatus = row
        .get::<_, String>("status")
        .parse()
        .map_err(|e| corrupt_row("incident", e))?;
    let Json(details): Json<IncidentDetails> = row
        .try_get("details")
        .map_err(|e| corrupt_row("incident", e))?;

    Ok(Incident {
        id: row.get("id"),
        dataset_key,
        rule_type,
        severity,
        details,
        status,
        created_at: row.get("created_at"),
        resolved_at: row.get("resolved_at"),
    })
}

fn no_longer_open(id: Uuid) -> AppError {
    AppError::ConcurrencyConflict(format!("Incident {} is no longer open", id))
}

#[async_trait]
impl IncidentStore for PgIncidentStore {
    async fn find_open(&self, key: &IncidentKey) -> Result<Option<Incident>, AppError> {
        let client = self.pool.get().await?;
        client
            .query_opt(
                queries::FIND_OPEN_INCIDENT,
                &[&key.dataset_key.as_str(), &key.rule_type.as_str()],
            )
            .await?
            .map(|row| incident_from_row(&row))
            .transpose()
    }

    async fn insert_open(&self, incident: Incident) -> Result<Incident, AppError> {
        let client = self.pool.get().await?;
        let result = client
            .execute(
                queries::INSERT_INCIDENT,
                &[
                    &incident.id,
                    &incident.dataset_key.as_str(),
                    &incident.rule_type.as_str(),
                    &incident.severity.as_str(),
                    &Json(&incident.details),
                    &incident.status.as_str(),
                    &incident.created_at,
                    &incident.resolved_at,
                ],
            )
            .await;

        match result {
            Ok(_) => {
                debug!("Stored open incident {} for {}", incident.id, incident.key());
                Ok(incident)
            }
            Err(e) if e.code() == Some(&SqlState::UNIQUE_VIOLATION) => {
                Err(AppError::ConcurrencyConflict(format!(
                    "An incident is already open for {}",
                    incident.key()
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn resolve(&self, id: Uuid, resolved_at: DateTime<Utc>) -> Result<Incident, AppError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(queries::RESOLVE_INCIDENT, &[&id, &resolved_at])
            .await?
            .ok_or_else(|| no_longer_open(id))?;
        let incident = incident_from_row(&row)?;
        debug!("Stored resolution of incident {} for {}", incident.id, incident.key());
        Ok(incident)
    }

    async fn refresh(
        &self,
        id: Uuid,
        severity: Severity,
        details: IncidentDetails,
    ) -> Result<Incident, AppError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                queries::REFRESH_INCIDENT,
                &[&id, &severity.as_str(), &Json(&details)],
            )
            .await?
            .ok_or_else(|| no_longer_open(id))?;
        debug!("Refreshed incident {}", id);
        incident_from_row(&row)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Incident>, AppError> {
        let client = self.pool.get().await?;
        client
            .query_opt(queries::GET_INCIDENT, &[&id])
            .await?
            .map(|row| incident_from_row(&row))
            .transpose()
    }

    async fn list(&self, filter: &IncidentFilter) -> Result<Vec<Incident>, AppError> {
        let dataset_key = filter.dataset_key.as_ref().map(|k| k.as_str().to_string());
        // Source names never contain ':', so the prefix selects exactly one source
        let source_prefix = filter.source.as_ref().map(|s| format!("{}:", s));
        let rule_type = filter.rule_type.map(|r| r.as_str());
        let status = filter.status.map(|s| s.as_str());

        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::new();
        if let Some(key) = &dataset_key {
            params.push(key);
        }
        if let Some(prefix) = &source_prefix {
            params.push(prefix);
        }
        if let Some(rule_type) = &rule_type {
            params.push(rule_type);
        }
        if let Some(status) = &status {
            params.push(status);
        }

        let sql = queries::list_incidents(
            dataset_key.is_some(),
            source_prefix.is_some(),
            rule_type.is_some(),
            status.is_some(),
        );
        let client = self.pool.get().await?;
        let rows = client.query(sql.as_str(), &params).await?;
        rows.iter().map(incident_from_row).collect()
    }
}
