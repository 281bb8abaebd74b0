//! Error handling module
//!
//! Provides the unified error type for the monitoring core and the HTTP layer.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Malformed capture (duplicate column names, empty key, out-of-order timestamp)
    #[error("Validation error: {0}")]
    Validation(String),

    /// The capture source could not be reached or timed out
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    /// Persistence failure on read/write of captures or incidents
    #[error("Storage error: {0}")]
    Storage(String),

    /// Lock or atomic-write contention on an incident key
    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// A dataset check aborted; carries the dataset key
    #[error("Check failed for dataset {dataset_key}: {source}")]
    DatasetCheck {
        dataset_key: String,
        #[source]
        source: Box<AppError>,
    },

    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl AppError {
    /// Attach the dataset key to an error raised while checking that dataset.
    pub fn for_dataset(self, dataset_key: impl Into<String>) -> Self {
        match self {
            already @ AppError::DatasetCheck { .. } => already,
            other => AppError::DatasetCheck {
                dataset_key: dataset_key.into(),
                source: Box::new(other),
            },
        }
    }

    /// The innermost error, looking through `DatasetCheck` wrappers
    pub fn root(&self) -> &AppError {
        match self {
            AppError::DatasetCheck { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(rename = "datasetKey", skip_serializing_if = "Option::is_none")]
    pub dataset_key: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let dataset_key = match &self {
            AppError::DatasetCheck { dataset_key, .. } => Some(dataset_key.clone()),
            _ => None,
        };

        let (status, error_code, message, details) = match self.root() {
            AppError::Validation(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "VALIDATION_ERROR",
                msg.clone(),
                None,
            ),
            AppError::SourceUnavailable(msg) => {
                error!("Capture source unavailable: {}", msg);
                (
                    StatusCode::BAD_GATEWAY,
                    "SOURCE_UNAVAILABLE",
                    "The capture source could not be reached".to_string(),
                    Some(msg.clone()),
                )
            }
            AppError::Storage(msg) => {
                error!("Storage error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "STORAGE_ERROR",
                    "A storage error occurred".to_string(),
                    Some(msg.clone()),
                )
            }
            AppError::ConcurrencyConflict(msg) => (
                StatusCode::CONFLICT,
                "CONCURRENCY_CONFLICT",
                msg.clone(),
                None,
            ),
            AppError::Database(e) => {
                error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DATABASE_ERROR",
                    "A database error occurred".to_string(),
                    Some(e.to_string()),
                )
            }
            AppError::Pool(e) => {
                error!("Pool error: {:?}", e);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "POOL_EXHAUSTED",
                    "Database connection pool exhausted".to_string(),
                    Some(e.to_string()),
                )
            }
            AppError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                msg.clone(),
                None,
            ),
            AppError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                "BAD_REQUEST",
                msg.clone(),
                None,
            ),
            AppError::Internal(msg) => {
                error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                    Some(msg.clone()),
                )
            }
            AppError::Config(msg) => {
                error!("Configuration error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "CONFIG_ERROR",
                    "A configuration error occurred".to_string(),
                    Some(msg.clone()),
                )
            }
            // root() never returns a wrapper
            AppError::DatasetCheck { .. } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
                None,
            ),
        };

        let body = Json(ErrorResponse {
            success: false,
            message,
            error: details,
            code: Some(error_code.to_string()),
            dataset_key,
        });

        (status, body).into_response()
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, AppError>;

/// Helper function to create a validation error
pub fn validation_error(msg: impl Into<String>) -> AppError {
    AppError::Validation(msg.into())
}

/// Helper function to create a not found error
pub fn not_found_error(msg: impl Into<String>) -> AppError {
    AppError::NotFound(msg.into())
}

/// Helper function to create a storage error
pub fn storage_error(msg: impl Into<String>) -> AppError {
    AppError::Storage(msg.into())
}
