//! Connection management route handlers
//!
//! Registers source databases, runs discovery over them and scopes
//! datasets, checks and incidents to one source.

use crate::connection::ConnectionInfo;
use crate::error::ApiResult;
use crate::models::{validated, ConnectRequest, SuccessResponse};
use crate::monitor::{DatasetKey, Incident, IncidentFilter, RunSummary};
use crate::state::SharedState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResponse {
    pub connection: ConnectionInfo,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionListResponse {
    pub connections: Vec<ConnectionInfo>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverResponse {
    pub summary: RunSummary,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceDatasetsResponse {
    pub connection: ConnectionInfo,
    pub datasets: Vec<DatasetKey>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceIncidentsResponse {
    pub connection: ConnectionInfo,
    pub incidents: Vec<Incident>,
}

/// Register a source database using a connection string
pub async fn connect(
    State(state): State<SharedState>,
    Json(payload): Json<ConnectRequest>,
) -> ApiResult<(StatusCode, Json<SuccessResponse<ConnectResponse>>)> {
    let payload = validated(payload)?;
    debug!("Connecting to source database with connection string");

    let connection = state
        .connections
        .connect(&payload.connection_string, payload.name)
        .await?;

    info!("Connected source '{}' ({})", connection.name, connection.id);
    Ok((
        StatusCode::CREATED,
        Json(SuccessResponse::with_data(
            format!("Successfully connected '{}'.", connection.name),
            ConnectResponse { connection },
        )),
    ))
}

pub async fn list_connections(
    State(state): State<SharedState>,
) -> ApiResult<Json<SuccessResponse<ConnectionListResponse>>> {
    let connections = state.connections.list_connections().await;
    Ok(Json(SuccessResponse::with_data(
        format!("{} connections", connections.len()),
        ConnectionListResponse { connections },
    )))
}

pub async fn disconnect(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SuccessResponse<()>>> {
    state.connections.disconnect(id).await?;
    Ok(Json(SuccessResponse::message_only(format!(
        "Disconnected {}",
        id
    ))))
}

/// Capture every table of the source and check each one
pub async fn discover(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SuccessResponse<DiscoverResponse>>> {
    let source = state.connections.source(id).await?;
    let summary = state.orchestrator.discover_and_check(source).await?;
    state.connections.mark_discovered(id).await;

    info!(
        "Discovery on {} finished: {} datasets, {} failed",
        id,
        summary.datasets_checked,
        summary.failures.len()
    );

    Ok(Json(SuccessResponse::with_data(
        format!("Captured and checked {} datasets", summary.reports.len()),
        DiscoverResponse { summary },
    )))
}

/// Captured datasets of one source
pub async fn list_datasets(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SuccessResponse<SourceDatasetsResponse>>> {
    let connection = state.connections.get(id).await?;
    let datasets = state.orchestrator.source_datasets(&connection.name).await?;

    Ok(Json(SuccessResponse::with_data(
        format!("{} datasets on '{}'", datasets.len(), connection.name),
        SourceDatasetsResponse {
            connection,
            datasets,
        },
    )))
}

/// Check the captured datasets of one source without capturing again
pub async fn run_checks(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SuccessResponse<DiscoverResponse>>> {
    let connection = state.connections.get(id).await?;
    let summary = state.orchestrator.check_source(&connection.name).await?;

    info!(
        "Checks on '{}' finished: {} datasets, {} failed, {} opened, {} resolved",
        connection.name,
        summary.datasets_checked,
        summary.failures.len(),
        summary.opened,
        summary.resolved
    );

    Ok(Json(SuccessResponse::with_data(
        format!("Checked {} datasets", summary.datasets_checked),
        DiscoverResponse { summary },
    )))
}

/// Incidents raised on datasets of one source; `ruleType` and `status` narrow further
pub async fn list_incidents(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Query(query): Query<IncidentFilter>,
) -> ApiResult<Json<SuccessResponse<SourceIncidentsResponse>>> {
    let connection = state.connections.get(id).await?;
    let filter = IncidentFilter {
        rule_type: query.rule_type,
        status: query.status,
        ..IncidentFilter::for_source(connection.name.clone())
    };
    let incidents = state.ledger().list(&filter).await?;

    Ok(Json(SuccessResponse::with_data(
        format!("{} incidents on '{}'", incidents.len(), connection.name),
        SourceIncidentsResponse {
            connection,
            incidents,
        },
    )))
}
