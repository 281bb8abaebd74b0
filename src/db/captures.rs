//! PostgreSQL-backed capture history

use crate::db::{corrupt_row, queries};
use crate::error::AppError;
use crate::monitor::history::ensure_monotonic;
use crate::monitor::{CaptureId, CaptureStore, ColumnSpec, DatasetKey, NewCapture, SchemaCapture};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use postgres_types::Json;
use tokio_postgres::Row;
use tracing::info;

pub struct PgCaptureStore {
    pool: Pool,
}

impl PgCaptureStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

fn capture_from_row(row: &Row) -> Result<SchemaCapture, AppError> {
    let id: i64 = row.get("id");
    let dataset_key = DatasetKey::new(row.get::<_, String>("dataset_key"))
        .map_err(|e| corrupt_row("capture", e))?;
    let Json(columns): Json<Vec<ColumnSpec>> = row
        .try_get("columns")
        .map_err(|e| corrupt_row("capture", e))?;

    Ok(SchemaCapture {
        id: CaptureId(id as u64),
        dataset_key,
        columns,
        captured_at: row.get("captured_at"),
        checksum: row.get("checksum"),
    })
}

#[async_trait]
impl CaptureStore for PgCaptureStore {
    async fn append(&self, capture: NewCapture) -> Result<SchemaCapture, AppError> {
        capture.validate()?;

        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let key = capture.dataset_key.as_str().to_string();

        tx.execute(queries::LOCK_DATASET, &[&key]).await?;
        let latest = tx
            .query_opt(queries::CAPTURE_HISTORY, &[&key, &1i64])
            .await?
            .map(|row| capture_from_row(&row))
            .transpose()?;
        ensure_monotonic(&capture, latest.as_ref())?;

        let now = Utc::now();
        let captured_at: DateTime<Utc> = match (capture.captured_at, &latest) {
            (Some(at), _) => at,
            (None, Some(latest)) if latest.captured_at > now => latest.captured_at,
            (None, _) => now,
        };
        let checksum = SchemaCapture::compute_checksum(&capture.columns);

        let row = tx
            .query_one(
                queries::INSERT_CAPTURE,
                &[&key, &Json(&capture.columns), &checksum, &captured_at],
            )
            .await?;
        tx.commit().await?;

        let id: i64 = row.get("id");
        let stored = capture.into_capture(CaptureId(id as u64), captured_at);
        info!(
            "Saved capture {} for dataset {}: {} columns",
            stored.id,
            stored.dataset_key,
            stored.columns.len()
        );
        Ok(stored)
    }

    async fn history(
        &self,
        dataset_key: &DatasetKey,
        limit: usize,
    ) -> Result<Vec<SchemaCapture>, AppError> {
        let client = self.pool.get().await?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = client
            .query(queries::CAPTURE_HISTORY, &[&dataset_key.as_str(), &limit])
            .await?;
        rows.iter().map(capture_from_row).collect()
    }

    async fn get(&self, id: CaptureId) -> Result<Option<SchemaCapture>, AppError> {
        let client = self.pool.get().await?;
        let id = i64::try_from(id.0).map_err(|_| AppError::NotFound(format!("Capture {}", id)))?;
        client
            .query_opt(queries::GET_CAPTURE, &[&id])
            .await?
            .map(|row| capture_from_row(&row))
            .transpose()
    }

    async fn datasets(&self) -> Result<Vec<DatasetKey>, AppError> {
        let client = self.pool.get().await?;
        let rows = client.query(queries::LIST_DATASETS, &[]).await?;
        rows.iter()
            .map(|row| {
                DatasetKey::new(row.get::<_, String>("dataset_key"))
                    .map_err(|e| corrupt_row("capture", e))
            })
            .collect()
    }
}
