//! Capture Sources
//!
//! Where raw column layouts come from. The core only sees the trait;
//! `PostgresCaptureSource` introspects a live PostgreSQL database.

use crate::db::queries;
use crate::error::AppError;
use crate::monitor::capture::{ColumnSpec, DatasetKey};
use async_trait::async_trait;
use deadpool_postgres::Pool;
use tracing::debug;

/// A system that can report the current columns of its datasets
#[async_trait]
pub trait CaptureSource: Send + Sync {
    /// Name used as the prefix of dataset keys from this source
    fn name(&self) -> &str;

    /// Every dataset this source can capture
    async fn discover(&self) -> Result<Vec<DatasetKey>, AppError>;

    /// Current columns of one dataset, in ordinal order
    async fn fetch_columns(&self, dataset_key: &DatasetKey) -> Result<Vec<ColumnSpec>, AppError>;
}

/// Schema introspector for PostgreSQL
pub struct PostgresCaptureSource {
    name: String,
    pool: Pool,
}

impl PostgresCaptureSource {
    pub fn new(name: impl Into<String>, pool: Pool) -> Self {
        Self {
            name: name.into(),
            pool,
        }
    }

    async fn client(&self) -> Result<deadpool_postgres::Client, AppError> {
        self.pool
            .get()
            .await
            .map_err(|e| unavailable(&self.name, e))
    }
}

fn unavailable(source: &str, e: impl std::fmt::Display) -> AppError {
    AppError::SourceUnavailable(format!("{}: {}", source, e))
}

#[async_trait]
impl CaptureSource for PostgresCaptureSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn discover(&self) -> Result<Vec<DatasetKey>, AppError> {
        let client = self.client().await?;
        let rows = client
            .query(queries::DISCOVER_TABLES, &[])
            .await
            .map_err(|e| unavailable(&self.name, e))?;

        let keys = rows
            .iter()
            .map(|row| {
                let schema: String = row.get("table_schema");
                let table: String = row.get("table_name");
                DatasetKey::for_table(&self.name, &schema, &table)
            })
            .collect::<Result<Vec<_>, _>>()?;

        debug!("Discovered {} tables on {}", keys.len(), self.name);
        Ok(keys)
    }

    async fn fetch_columns(&self, dataset_key: &DatasetKey) -> Result<Vec<ColumnSpec>, AppError> {
        let (schema, table) = dataset_key.table_ref().ok_or_else(|| {
            AppError::BadRequest(format!(
                "Dataset key {} does not name a schema.table",
                dataset_key
            ))
        })?;

        let client = self.client().await?;
        let rows = client
            .query(queries::TABLE_COLUMNS, &[&schema, &table])
            .await
            .map_err(|e| unavailable(&self.name, e))?;

        let columns = rows
            .iter()
            .map(|row| ColumnSpec {
                name: row.get("column_name"),
                data_type: row.get("data_type"),
                nullable: row.get::<_, String>("is_nullable") == "YES",
            })
            .collect::<Vec<_>>();

        debug!("Fetched {} columns for {}", columns.len(), dataset_key);
        Ok(columns)
    }
}
