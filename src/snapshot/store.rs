// src/snapshot/store.rs
//! Snapshot persistence using SQLite + file system
//!
//! Metadata lives in SQLite; each record is serialized to JSON, compressed
//! with zstd, and written to its own file. Records are immutable after
//! capture and carry no cross-snapshot references.

use crate::snapshot::record::{
    SnapshotContents, SnapshotId, SnapshotRecord, SCHEMA_VERSION,
};
use crate::runtime::agent::AgentId;
use crate::utils::errors::{EngineError, Result};
use rusqlite::{params, Connection};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// zstd level for record compression (balanced)
const COMPRESSION_LEVEL: i32 = 3;

/// Storage configuration
#[derive(Debug, Clone)]
pub struct SnapshotStoreConfig {
    /// Base directory for storage
    pub base_dir: PathBuf,

    /// SQLite database file name
    pub db_name: String,

    /// Snapshot records directory name
    pub snapshots_dir: String,
}

impl Default for SnapshotStoreConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("~/.warden/data"),
            db_name: "snapshots.db".to_string(),
            snapshots_dir: "snapshots".to_string(),
        }
    }
}

/// Snapshot metadata row
#[derive(Debug, Clone)]
pub struct SnapshotMeta {
    pub snapshot_id: String,
    pub agent_id: String,
    pub schema_version: i64,
    pub raw_size: i64,
    pub compressed_size: i64,
    pub created_at: i64,
}

/// Snapshot storage
pub struct SnapshotStore {
    config: SnapshotStoreConfig,
    db: Arc<Mutex<Connection>>,
}

impl SnapshotStore {
    /// Create a new snapshot store
    pub async fn new(config: SnapshotStoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.base_dir).await.map_err(|e| {
            EngineError::StorageFailed(format!("Failed to create directory: {}", e))
        })?;

        let snapshots_dir = config.base_dir.join(&config.snapshots_dir);
        fs::create_dir_all(&snapshots_dir).await.map_err(|e| {
            EngineError::StorageFailed(format!("Failed to create snapshots directory: {}", e))
        })?;

        let db_path = config.base_dir.join(&config.db_name);
        let conn = Connection::open(&db_path).map_err(|e| {
            EngineError::StorageFailed(format!("Failed to open database: {}", e))
        })?;

        let store = Self {
            config,
            db: Arc::new(Mutex::new(conn)),
        };

        store.init_schema().await?;
        info!("Snapshot store initialized at {:?}", store.config.base_dir);

        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        let db = self.db.lock().await;

        db.execute(
            r#"
            CREATE TABLE IF NOT EXISTS snapshots (
                snapshot_id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                schema_version INTEGER NOT NULL,
                file_path TEXT NOT NULL,
                raw_size INTEGER NOT NULL,
                compressed_size INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
            [],
        )
        .map_err(|e| EngineError::StorageFailed(format!("Schema creation failed: {}", e)))?;

        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_snapshots_agent ON snapshots(agent_id)",
            [],
        )
        .map_err(|e| EngineError::StorageFailed(format!("Index creation failed: {}", e)))?;

        Ok(())
    }

    fn record_path(&self, snapshot_id: SnapshotId) -> PathBuf {
        self.config
            .base_dir
            .join(&self.config.snapshots_dir)
            .join(format!("{}.snap.zst", snapshot_id))
    }

    /// Persist a deep-copied capture; returns the new snapshot id
    pub async fn capture(&self, agent_id: AgentId, contents: SnapshotContents) -> Result<SnapshotId> {
        let record = SnapshotRecord {
            schema_version: SCHEMA_VERSION,
            snapshot_id: SnapshotId::new(),
            agent_id,
            taken_at: chrono::Utc::now(),
            contents,
        };

        let raw = serde_json::to_vec(&record).map_err(|e| {
            EngineError::StorageFailed(format!("Record serialization failed: {}", e))
        })?;
        let compressed = zstd::encode_all(&raw[..], COMPRESSION_LEVEL).map_err(|e| {
            EngineError::StorageFailed(format!("Record compression failed: {}", e))
        })?;

        let file_path = self.record_path(record.snapshot_id);
        fs::write(&file_path, &compressed).await.map_err(|e| {
            EngineError::StorageFailed(format!("Failed to write snapshot file: {}", e))
        })?;

        let db = self.db.lock().await;
        db.execute(
            r#"
            INSERT INTO snapshots (snapshot_id, agent_id, schema_version, file_path, raw_size, compressed_size, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                record.snapshot_id.to_string(),
                record.agent_id.to_string(),
                record.schema_version as i64,
                file_path.to_string_lossy(),
                raw.len() as i64,
                compressed.len() as i64,
                record.taken_at.timestamp(),
            ],
        )
        .map_err(|e| {
            EngineError::StorageFailed(format!("Failed to record snapshot metadata: {}", e))
        })?;

        debug!(
            "Captured snapshot {} for agent {} ({} -> {} bytes)",
            record.snapshot_id,
            record.agent_id,
            raw.len(),
            compressed.len()
        );

        Ok(record.snapshot_id)
    }

    /// Read a stored record, unmodified
    pub async fn restore(&self, snapshot_id: SnapshotId) -> Result<SnapshotRecord> {
        let file_path: String = {
            let db = self.db.lock().await;
            db.query_row(
                "SELECT file_path FROM snapshots WHERE snapshot_id = ?",
                params![snapshot_id.to_string()],
                |row| row.get(0),
            )
            .map_err(|_| EngineError::SnapshotNotFound(snapshot_id.to_string()))?
        };

        let compressed = fs::read(&file_path).await.map_err(|e| {
            EngineError::StorageFailed(format!("Failed to read snapshot file: {}", e))
        })?;
        let raw = zstd::decode_all(&compressed[..]).map_err(|e| {
            EngineError::StorageFailed(format!("Record decompression failed: {}", e))
        })?;

        serde_json::from_slice(&raw).map_err(|e| {
            EngineError::StorageFailed(format!("Record deserialization failed: {}", e))
        })
    }

    /// Explicitly delete a snapshot
    pub async fn delete(&self, snapshot_id: SnapshotId) -> Result<()> {
        let removed = {
            let db = self.db.lock().await;
            db.execute(
                "DELETE FROM snapshots WHERE snapshot_id = ?",
                params![snapshot_id.to_string()],
            )
            .map_err(|e| EngineError::StorageFailed(format!("Delete failed: {}", e)))?
        };
        if removed == 0 {
            return Err(EngineError::SnapshotNotFound(snapshot_id.to_string()));
        }

        let _ = fs::remove_file(self.record_path(snapshot_id)).await;
        debug!("Deleted snapshot {}", snapshot_id);
        Ok(())
    }

    /// List snapshot metadata for one agent, oldest first
    pub async fn list_for_agent(&self, agent_id: AgentId) -> Result<Vec<SnapshotMeta>> {
        let db = self.db.lock().await;

        let mut stmt = db
            .prepare(
                "SELECT snapshot_id, agent_id, schema_version, raw_size, compressed_size, created_at
                 FROM snapshots WHERE agent_id = ? ORDER BY created_at",
            )
            .map_err(|e| EngineError::StorageFailed(format!("Query preparation failed: {}", e)))?;

        let rows = stmt
            .query_map(params![agent_id.to_string()], |row| {
                Ok(SnapshotMeta {
                    snapshot_id: row.get(0)?,
                    agent_id: row.get(1)?,
                    schema_version: row.get(2)?,
                    raw_size: row.get(3)?,
                    compressed_size: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })
            .map_err(|e| EngineError::StorageFailed(format!("Query execution failed: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| EngineError::StorageFailed(format!("Result collection failed: {}", e)))?;

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ledger::Constraints;
    use serde_json::json;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn contents(counter: i64) -> SnapshotContents {
        let mut state = HashMap::new();
        state.insert("counter".to_string(), json!(counter));
        SnapshotContents {
            state,
            plugins: vec![],
            constraints: Constraints {
                cpu_fraction: 0.1,
                memory_bytes: 64 * 1024 * 1024,
            },
        }
    }

    async fn store() -> (SnapshotStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config = SnapshotStoreConfig {
            base_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        (SnapshotStore::new(config).await.unwrap(), dir)
    }

    #[tokio::test]
    async fn test_capture_restore_roundtrip() {
        let (store, _dir) = store().await;
        let agent = AgentId::new();

        let id = store.capture(agent, contents(7)).await.unwrap();
        let record = store.restore(id).await.unwrap();

        assert_eq!(record.snapshot_id, id);
        assert_eq!(record.agent_id, agent);
        assert_eq!(record.schema_version, SCHEMA_VERSION);
        assert_eq!(record.contents.state["counter"], json!(7));
    }

    #[tokio::test]
    async fn test_restore_missing_fails() {
        let (store, _dir) = store().await;
        let err = store.restore(SnapshotId::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::SnapshotNotFound(_)));
    }

    #[tokio::test]
    async fn test_snapshots_are_immutable_copies() {
        let (store, _dir) = store().await;
        let agent = AgentId::new();

        let mut live = contents(0);
        let id = store.capture(agent, live.clone()).await.unwrap();

        // Mutating the live copy after capture must not affect the record
        live.state.insert("counter".to_string(), json!(99));
        let record = store.restore(id).await.unwrap();
        assert_eq!(record.contents.state["counter"], json!(0));
    }

    #[tokio::test]
    async fn test_delete_and_list() {
        let (store, _dir) = store().await;
        let agent = AgentId::new();

        let first = store.capture(agent, contents(1)).await.unwrap();
        let second = store.capture(agent, contents(2)).await.unwrap();
        assert_eq!(store.list_for_agent(agent).await.unwrap().len(), 2);

        store.delete(first).await.unwrap();
        let remaining = store.list_for_agent(agent).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].snapshot_id, second.to_string());

        let err = store.delete(first).await.unwrap_err();
        assert!(matches!(err, EngineError::SnapshotNotFound(_)));
    }
}
