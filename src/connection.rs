//! Source Connection Manager
//!
//! Keeps the monitored databases registered at runtime. Each connection
//! becomes a named capture source; its name prefixes every dataset key
//! discovered on it.

use crate::db::{self, PgTarget};
use crate::error::AppError;
use crate::monitor::{CaptureSource, DatasetKey, PostgresCaptureSource};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

/// A registered source
pub struct ManagedConnection {
    pub id: Uuid,
    pub name: String,
    /// `user@host:port/database`, never the password
    pub display: String,
    pub source: Arc<dyn CaptureSource>,
    pub connected_at: DateTime<Utc>,
    pub last_discovered_at: Option<DateTime<Utc>>,
}

/// Public connection info (safe to expose to clients)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub id: Uuid,
    pub name: String,
    pub target: String,
    pub connected_at: DateTime<Utc>,
    pub last_discovered_at: Option<DateTime<Utc>>,
}

impl From<&ManagedConnection> for ConnectionInfo {
    fn from(conn: &ManagedConnection) -> Self {
        Self {
            id: conn.id,
            name: conn.name.clone(),
            target: conn.display.clone(),
            connected_at: conn.connected_at,
            last_discovered_at: conn.last_discovered_at,
        }
    }
}

fn display_target(target: &PgTarget) -> String {
    format!(
        "{}@{}:{}/{}",
        target.user, target.host, target.port, target.database
    )
}

/// Connection Manager - handles the monitored source databases
pub struct ConnectionManager {
    connections: RwLock<HashMap<Uuid, ManagedConnection>>,
    pool_size: usize,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::with_pool_size(5)
    }

    pub fn with_pool_size(pool_size: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            pool_size,
        }
    }

    /// Connect to a PostgreSQL database and register it as a source
    pub async fn connect(
        &self,
        connection_string: &str,
        name: Option<String>,
    ) -> Result<ConnectionInfo, AppError> {
        let target = PgTarget::parse(connection_string)
            .map_err(|e| AppError::BadRequest(e.to_string()))?;
        let name = name.unwrap_or_else(|| target.database.clone());
        let pool = db::connect(connection_string, self.pool_size)
            .await
            .map_err(|e| AppError::SourceUnavailable(format!("Failed to connect: {}", e)))?;

        let source = Arc::new(PostgresCaptureSource::new(name.clone(), pool));
        self.register(name, display_target(&target), source)
            .await
    }

    /// Register an already constructed source
    pub async fn register(
        &self,
        name: String,
        display: String,
        source: Arc<dyn CaptureSource>,
    ) -> Result<ConnectionInfo, AppError> {
        // Name must be usable as a dataset key prefix
        if name.trim().is_empty() || name.contains(':') || name.chars().any(char::is_whitespace) {
            return Err(AppError::BadRequest(format!(
                "Connection name '{}' must be non-empty without ':' or whitespace",
                name
            )));
        }

        let mut connections = self.connections.write().await;
        if connections.values().any(|c| c.name == name) {
            return Err(AppError::BadRequest(format!(
                "A connection named '{}' already exists",
                name
            )));
        }

        let conn = ManagedConnection {
            id: Uuid::new_v4(),
            name,
            display,
            source,
            connected_at: Utc::now(),
            last_discovered_at: None,
        };
        let info = ConnectionInfo::from(&conn);
        connections.insert(conn.id, conn);

        info!("Registered source {} ({})", info.name, info.id);
        Ok(info)
    }

    /// The capture source behind a connection
    pub async fn source(&self, id: Uuid) -> Result<Arc<dyn CaptureSource>, AppError> {
        let connections = self.connections.read().await;
        connections
            .get(&id)
            .map(|c| c.source.clone())
            .ok_or_else(|| AppError::NotFound(format!("Connection {} not found", id)))
    }

    /// The source whose name prefixes `dataset_key`
    pub async fn source_for(&self, dataset_key: &DatasetKey) -> Option<Arc<dyn CaptureSource>> {
        let prefix = dataset_key.source()?;
        let connections = self.connections.read().await;
        connections
            .values()
            .find(|c| c.name == prefix)
            .map(|c| c.source.clone())
    }

    pub async fn mark_discovered(&self, id: Uuid) {
        let mut connections = self.connections.write().await;
        if let Some(conn) = connections.get_mut(&id) {
            conn.last_discovered_at = Some(Utc::now());
        }
    }

    pub async fn get(&self, id: Uuid) -> Result<ConnectionInfo, AppError> {
        let connections = self.connections.read().await;
        connections
            .get(&id)
            .map(ConnectionInfo::from)
            .ok_or_else(|| AppError::NotFound(format!("Connection {} not found", id)))
    }

    /// List all connections, oldest first
    pub async fn list_connections(&self) -> Vec<ConnectionInfo> {
        let connections = self.connections.read().await;
        let mut list: Vec<_> = connections.values().map(ConnectionInfo::from).collect();
        list.sort_by_key(|c| c.connected_at);
        list
    }

    pub async fn disconnect(&self, id: Uuid) -> Result<(), AppError> {
        let mut connections = self.connections.write().await;
        if connections.remove(&id).is_none() {
            return Err(AppError::NotFound(format!("Connection {} not found", id)));
        }
        info!("Disconnected source {}", id);
        Ok(())
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::monitor::capture::ColumnSpec;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use tokio::sync::Mutex;

    /// In-memory source whose tables can be changed between captures
    pub(crate) struct StaticSource {
        pub name: String,
        pub tables: Mutex<BTreeMap<String, Vec<ColumnSpec>>>,
    }

    impl StaticSource {
        pub fn new(name: &str, tables: &[(&str, Vec<ColumnSpec>)]) -> Self {
            Self {
                name: name.to_string(),
                tables: Mutex::new(
                    tables
                        .iter()
                        .map(|(t, cols)| (t.to_string(), cols.clone()))
                        .collect(),
                ),
            }
        }
    }

    #[async_trait]
    impl CaptureSource for StaticSource {
        fn name(&self) -> &str {
            &self.name
        }

        async fn discover(&self) -> Result<Vec<DatasetKey>, AppError> {
            self.tables
                .lock()
                .await
                .keys()
                .map(|t| DatasetKey::for_table(&self.name, "public", t))
                .collect()
        }

        async fn fetch_columns(&self, dataset_key: &DatasetKey) -> Result<Vec<ColumnSpec>, AppError> {
            let (_, table) = dataset_key
                .table_ref()
                .ok_or_else(|| AppError::BadRequest(dataset_key.to_string()))?;
            self.tables
                .lock()
                .await
                .get(table)
                .cloned()
                .ok_or_else(|| AppError::SourceUnavailable(format!("{} is gone", table)))
        }
    }

    async fn register(manager: &ConnectionManager, name: &str) -> Result<ConnectionInfo, AppError> {
        manager
            .register(
                name.to_string(),
                "test".to_string(),
                Arc::new(StaticSource::new(name, &[])),
            )
            .await
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let manager = ConnectionManager::new();
        let info = register(&manager, "warehouse").await.unwrap();

        assert_eq!(manager.list_connections().await.len(), 1);
        assert_eq!(manager.source(info.id).await.unwrap().name(), "warehouse");

        let key = DatasetKey::new("warehouse:public.users").unwrap();
        assert!(manager.source_for(&key).await.is_some());
        let other = DatasetKey::new("lake:public.users").unwrap();
        assert!(manager.source_for(&other).await.is_none());
    }

    #[tokio::test]
    async fn test_names_are_unique_and_valid() {
        let manager = ConnectionManager::new();
        register(&manager, "warehouse").await.unwrap();

        assert!(matches!(
            register(&manager, "warehouse").await,
            Err(AppError::BadRequest(_))
        ));
        assert!(register(&manager, "bad:name").await.is_err());
        assert!(register(&manager, "").await.is_err());
    }

    #[tokio::test]
    async fn test_disconnect() {
        let manager = ConnectionManager::new();
        let info = register(&manager, "warehouse").await.unwrap();

        manager.mark_discovered(info.id).await;
        assert!(manager.get(info.id).await.unwrap().last_discovered_at.is_some());
        assert_eq!(manager.get(info.id).await.unwrap().name, "warehouse");

        manager.disconnect(info.id).await.unwrap();
        assert!(matches!(
            manager.source(info.id).await,
            Err(AppError::NotFound(_))
        ));
        assert!(manager.disconnect(info.id).await.is_err());
        assert!(matches!(manager.get(info.id).await, Err(AppError::NotFound(_))));
    }

    #[test]
    fn test_display_target_hides_password() {
        let target = PgTarget::parse("postgresql://monitor:hunter2@db:5432/warehouse").unwrap();
        let shown = display_target(&target);
        assert_eq!(shown, "monitor@db:5432/warehouse");
        assert!(!shown.contains("hunter2"));
    }
}
