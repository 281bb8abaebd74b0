//! Monitoring route handlers
//!
//! Captures, diffs, checks and incidents.

use crate::error::{not_found_error, ApiResult, AppError};
use crate::models::{validated, CaptureRequest, HistoryQuery, RunChecksRequest, SuccessResponse};
use crate::monitor::history::LatestCaptures;
use crate::monitor::{
    CaptureStore, CheckReport, ColumnSpec, DatasetKey, DiffEngine, Incident, IncidentFilter,
    NewCapture, RunSummary, SchemaCapture, SchemaDiff,
};
use crate::state::SharedState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

const DEFAULT_HISTORY_LIMIT: usize = 20;

// ==================== Response Types ====================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetListResponse {
    pub datasets: Vec<DatasetKey>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureResponse {
    pub capture: SchemaCapture,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureListResponse {
    pub captures: Vec<SchemaCapture>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffResponse {
    pub has_drift: bool,
    pub summary: String,
    pub diff: SchemaDiff,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResponse {
    pub report: CheckReport,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResponse {
    pub summary: RunSummary,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentListResponse {
    pub incidents: Vec<Incident>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentResponse {
    pub incident: Incident,
}

// ==================== Handlers ====================

/// List every dataset with at least one capture
pub async fn list_datasets(
    State(state): State<SharedState>,
) -> ApiResult<Json<SuccessResponse<DatasetListResponse>>> {
    let datasets = state.captures().datasets().await?;
    Ok(Json(SuccessResponse::with_data(
        format!("{} datasets", datasets.len()),
        DatasetListResponse { datasets },
    )))
}

/// Append a capture pushed by the caller
pub async fn submit_capture(
    State(state): State<SharedState>,
    Path(key): Path<String>,
    Json(payload): Json<CaptureRequest>,
) -> ApiResult<(StatusCode, Json<SuccessResponse<CaptureResponse>>)> {
    let dataset_key = DatasetKey::new(key)?;
    let payload = validated(payload)?;

    let columns: Vec<ColumnSpec> = payload.columns.into_iter().map(Into::into).collect();
    let mut capture = NewCapture::new(dataset_key, columns);
    if let Some(at) = payload.captured_at {
        capture = capture.at(at);
    }

    let capture = state.captures().append(capture).await?;
    Ok((
        StatusCode::CREATED,
        Json(SuccessResponse::with_data(
            format!("Capture {} saved", capture.id),
            CaptureResponse { capture },
        )),
    ))
}

/// Capture history of a dataset, newest first
pub async fn list_captures(
    State(state): State<SharedState>,
    Path(key): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<SuccessResponse<CaptureListResponse>>> {
    let dataset_key = DatasetKey::new(key)?;
    let query = validated(query)?;

    let captures = state
        .captures()
        .history(&dataset_key, query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT))
        .await?;
    Ok(Json(SuccessResponse::with_data(
        format!("{} captures", captures.len()),
        CaptureListResponse { captures },
    )))
}

/// Diff of the two latest captures, without touching the ledger
pub async fn latest_diff(
    State(state): State<SharedState>,
    Path(key): Path<String>,
) -> ApiResult<Json<SuccessResponse<DiffResponse>>> {
    let dataset_key = DatasetKey::new(key)?;

    let diff = match state.captures().latest_two(&dataset_key).await? {
        LatestCaptures::Pair { newest, previous } => DiffEngine::diff(&previous, &newest),
        _ => {
            return Err(not_found_error(format!(
                "Dataset {} needs at least two captures to diff",
                dataset_key
            )))
        }
    };

    let policy = state.orchestrator.options().drift;
    Ok(Json(SuccessResponse::with_data(
        diff.summary(),
        DiffResponse {
            has_drift: diff.has_drift(&policy),
            summary: diff.summary(),
            diff,
        },
    )))
}

/// Run the drift and freshness check for one dataset
pub async fn check_dataset(
    State(state): State<SharedState>,
    Path(key): Path<String>,
) -> ApiResult<Json<SuccessResponse<CheckResponse>>> {
    let dataset_key = DatasetKey::new(key)?;
    let report = state.orchestrator.check_dataset(&dataset_key).await?;

    Ok(Json(SuccessResponse::with_data(
        format!(
            "Checked {}: {} opened, {} resolved",
            dataset_key, report.opened, report.resolved
        ),
        CheckResponse { report },
    )))
}

/// Capture the dataset from its registered source, then check it
pub async fn refresh_dataset(
    State(state): State<SharedState>,
    Path(key): Path<String>,
) -> ApiResult<Json<SuccessResponse<CheckResponse>>> {
    let dataset_key = DatasetKey::new(key)?;
    let source = state.connections.source_for(&dataset_key).await.ok_or_else(|| {
        not_found_error(format!("No registered source for dataset {}", dataset_key))
    })?;

    let report = state
        .orchestrator
        .capture_and_check(source.as_ref(), &dataset_key)
        .await?;

    Ok(Json(SuccessResponse::with_data(
        format!("Captured and checked {}", dataset_key),
        CheckResponse { report },
    )))
}

/// Check the listed datasets, or every captured dataset
pub async fn run_checks(
    State(state): State<SharedState>,
    Json(payload): Json<RunChecksRequest>,
) -> ApiResult<Json<SuccessResponse<RunResponse>>> {
    let payload = validated(payload)?;

    let summary = match payload.keys()? {
        Some(keys) => state.orchestrator.check_many(keys).await,
        None => state.orchestrator.check_all().await?,
    };

    info!(
        "Check run finished: {} datasets, {} failed, {} opened, {} resolved",
        summary.datasets_checked,
        summary.failures.len(),
        summary.opened,
        summary.resolved
    );

    Ok(Json(SuccessResponse::with_data(
        format!("Checked {} datasets", summary.datasets_checked),
        RunResponse { summary },
    )))
}

/// List incidents; `source` matches the key prefix, other filters are exact
pub async fn list_incidents(
    State(state): State<SharedState>,
    Query(filter): Query<IncidentFilter>,
) -> ApiResult<Json<SuccessResponse<IncidentListResponse>>> {
    let incidents = state.ledger().list(&filter).await?;
    Ok(Json(SuccessResponse::with_data(
        format!("{} incidents", incidents.len()),
        IncidentListResponse { incidents },
    )))
}

pub async fn get_incident(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SuccessResponse<IncidentResponse>>> {
    let incident = state
        .ledger()
        .get(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Incident {} not found", id)))?;

    Ok(Json(SuccessResponse::with_data(
        format!("Incident {}", incident.id),
        IncidentResponse { incident },
    )))
}
