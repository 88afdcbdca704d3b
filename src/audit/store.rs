// src/audit/store.rs
//! Audit event persistence using SQLite

use crate::audit::trail::AuditEvent;
use crate::utils::errors::{EngineError, Result};
use rusqlite::{params, Connection};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Audit storage configuration
#[derive(Debug, Clone)]
pub struct AuditStoreConfig {
    /// Base directory for storage
    pub base_dir: PathBuf,

    /// SQLite database file name
    pub db_name: String,
}

impl Default for AuditStoreConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("~/.warden/data"),
            db_name: "audit.db".to_string(),
        }
    }
}

/// A persisted audit row
#[derive(Debug, Clone)]
pub struct AuditRow {
    pub timestamp_ms: i64,
    pub kind: String,
    pub agent_id: Option<String>,
    pub detail: String,
}

/// Audit event storage
pub struct AuditStore {
    db: Arc<Mutex<Connection>>,
}

impl AuditStore {
    pub async fn new(config: AuditStoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.base_dir).await.map_err(|e| {
            EngineError::StorageFailed(format!("Failed to create directory: {}", e))
        })?;

        let db_path = config.base_dir.join(&config.db_name);
        let conn = Connection::open(&db_path).map_err(|e| {
            EngineError::StorageFailed(format!("Failed to open database: {}", e))
        })?;

        let store = Self {
            db: Arc::new(Mutex::new(conn)),
        };
        store.init_schema().await?;
        info!("Audit store initialized at {:?}", db_path);
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            r#"
            CREATE TABLE IF NOT EXISTS audit_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp_ms INTEGER NOT NULL,
                kind TEXT NOT NULL,
                agent_id TEXT,
                detail TEXT NOT NULL
            )
            "#,
            [],
        )
        .map_err(|e| EngineError::StorageFailed(format!("Schema creation failed: {}", e)))?;

        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_audit_agent ON audit_events(agent_id)",
            [],
        )
        .map_err(|e| EngineError::StorageFailed(format!("Index creation failed: {}", e)))?;

        Ok(())
    }

    /// Append a batch of drained events
    pub async fn write_batch(&self, events: &[AuditEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        let mut db = self.db.lock().await;
        let tx = db
            .transaction()
            .map_err(|e| EngineError::StorageFailed(format!("Transaction failed: {}", e)))?;
        for event in events {
            tx.execute(
                "INSERT INTO audit_events (timestamp_ms, kind, agent_id, detail) VALUES (?, ?, ?, ?)",
                params![
                    event.timestamp_ms,
                    event.kind.as_str(),
                    event.agent_id,
                    event.detail,
                ],
            )
            .map_err(|e| EngineError::StorageFailed(format!("Insert failed: {}", e)))?;
        }
        tx.commit()
            .map_err(|e| EngineError::StorageFailed(format!("Commit failed: {}", e)))?;

        debug!("Persisted {} audit events", events.len());
        Ok(())
    }

    /// Most recent rows, newest first
    pub async fn recent(&self, limit: usize) -> Result<Vec<AuditRow>> {
        let db = self.db.lock().await;
        let mut stmt = db
            .prepare(
                "SELECT timestamp_ms, kind, agent_id, detail FROM audit_events
                 ORDER BY id DESC LIMIT ?",
            )
            .map_err(|e| EngineError::StorageFailed(format!("Query preparation failed: {}", e)))?;

        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(AuditRow {
                    timestamp_ms: row.get(0)?,
                    kind: row.get(1)?,
                    agent_id: row.get(2)?,
                    detail: row.get(3)?,
                })
            })
            .map_err(|e| EngineError::StorageFailed(format!("Query execution failed: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| EngineError::StorageFailed(format!("Result collection failed: {}", e)))?;

        Ok(rows)
    }

    pub async fn count(&self) -> Result<u64> {
        let db = self.db.lock().await;
        let count: i64 = db
            .query_row("SELECT COUNT(*) FROM audit_events", [], |row| row.get(0))
            .unwrap_or(0);
        Ok(count as u64)
    }
}
