//! Capture History Store
//!
//! Append-only, per-dataset history of schema captures.
//! Think of this as the commit log of a dataset's shape.

use crate::error::{validation_error, AppError};
use crate::monitor::capture::{CaptureId, DatasetKey, NewCapture, SchemaCapture};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// The two most recent captures of a dataset
#[derive(Debug, Clone, PartialEq)]
pub enum LatestCaptures {
    Empty,
    Single(SchemaCapture),
    Pair {
        newest: SchemaCapture,
        previous: SchemaCapture,
    },
}

impl LatestCaptures {
    /// Build from captures already sorted newest first
    pub fn from_newest_first(mut captures: Vec<SchemaCapture>) -> Self {
        captures.truncate(2);
        let mut iter = captures.into_iter();
        match (iter.next(), iter.next()) {
            (None, _) => LatestCaptures::Empty,
            (Some(newest), None) => LatestCaptures::Single(newest),
            (Some(newest), Some(previous)) => LatestCaptures::Pair { newest, previous },
        }
    }

    pub fn newest(&self) -> Option<&SchemaCapture> {
        match self {
            LatestCaptures::Empty => None,
            LatestCaptures::Single(newest) | LatestCaptures::Pair { newest, .. } => Some(newest),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            LatestCaptures::Empty => 0,
            LatestCaptures::Single(_) => 1,
            LatestCaptures::Pair { .. } => 2,
        }
    }
}

/// Persistence for schema captures
#[async_trait]
pub trait CaptureStore: Send + Sync {
    /// Validate and append a capture; returns it with id and checksum assigned
    async fn append(&self, capture: NewCapture) -> Result<SchemaCapture, AppError>;

    /// Most recent `limit` captures, newest first
    async fn history(&self, dataset_key: &DatasetKey, limit: usize) -> Result<Vec<SchemaCapture>, AppError>;

    async fn get(&self, id: CaptureId) -> Result<Option<SchemaCapture>, AppError>;

    /// Every dataset key with at least one capture
    async fn datasets(&self) -> Result<Vec<DatasetKey>, AppError>;

    async fn latest_two(&self, dataset_key: &DatasetKey) -> Result<LatestCaptures, AppError> {
        let captures = self.history(dataset_key, 2).await?;
        Ok(LatestCaptures::from_newest_first(captures))
    }
}

/// Reject a capture whose timestamp would move history backwards
pub(crate) fn ensure_monotonic(
    capture: &NewCapture,
    latest: Option<&SchemaCapture>,
) -> Result<(), AppError> {
    if let (Some(at), Some(latest)) = (capture.captured_at, latest) {
        if at < latest.captured_at {
            return Err(validation_error(format!(
                "Capture for {} at {} precedes latest capture {} at {}",
                capture.dataset_key,
                at.to_rfc3339(),
                latest.id,
                latest.captured_at.to_rfc3339()
            )));
        }
    }
    Ok(())
}

#[derive(Default)]
struct HistoryInner {
    next_id: u64,
    /// Dataset key -> captures in append order (which is also history order)
    by_dataset: HashMap<DatasetKey, Vec<SchemaCapture>>,
    /// Capture id -> (dataset key, index)
    index: HashMap<CaptureId, (DatasetKey, usize)>,
}

/// In-memory capture store
pub struct InMemoryCaptureStore {
    inner: Arc<RwLock<HistoryInner>>,
}

impl InMemoryCaptureStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HistoryInner::default())),
        }
    }
}

impl Default for InMemoryCaptureStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CaptureStore for InMemoryCaptureStore {
    async fn append(&self, capture: NewCapture) -> Result<SchemaCapture, AppError> {
        capture.validate()?;

        let mut inner = self.inner.write().await;
        let latest = inner
            .by_dataset
            .get(&capture.dataset_key)
            .and_then(|list| list.last());
        ensure_monotonic(&capture, latest)?;

        // A defaulted timestamp must not fall behind an explicit one already stored
        let now = match latest {
            Some(latest) if latest.captured_at > Utc::now() => latest.captured_at,
            _ => Utc::now(),
        };

        inner.next_id += 1;
        let id = CaptureId(inner.next_id);
        let stored = capture.into_capture(id, now);

        let list = inner
            .by_dataset
            .entry(stored.dataset_key.clone())
            .or_default();
        list.push(stored.clone());
        let position = list.len() - 1;
        inner
            .index
            .insert(id, (stored.dataset_key.clone(), position));

        info!(
            "Saved capture {} for dataset {}: {} columns",
            stored.id,
            stored.dataset_key,
            stored.columns.len()
        );

        Ok(stored)
    }

    async fn history(&self, dataset_key: &DatasetKey, limit: usize) -> Result<Vec<SchemaCapture>, AppError> {
        let inner = self.inner.read().await;
        let mut list: Vec<SchemaCapture> = inner
            .by_dataset
            .get(dataset_key)
            .map(|list| list.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default();
        // Append order already matches; sort anyway so the ordering contract is explicit
        list.sort_by(|a, b| b.recency_key().cmp(&a.recency_key()));
        Ok(list)
    }

    async fn get(&self, id: CaptureId) -> Result<Option<SchemaCapture>, AppError> {
        let inner = self.inner.read().await;
        Ok(inner
            .index
            .get(&id)
            .and_then(|(key, pos)| inner.by_dataset.get(key)?.get(*pos))
            .cloned())
    }

    async fn datasets(&self) -> Result<Vec<DatasetKey>, AppError> {
        let inner = self.inner.read().await;
        let mut keys: Vec<DatasetKey> = inner.by_dataset.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}
