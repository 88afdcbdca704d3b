// src/snapshot/record.rs
//! Snapshot record layout
//!
//! A snapshot is a self-contained, versioned record of an agent's full
//! mutable state: state store contents, attached-plugin identifiers, and
//! constraints. Records are deep copies; they never reference live objects,
//! so later mutation of the agent cannot alter a taken snapshot.

use crate::resources::ledger::Constraints;
use crate::runtime::agent::AgentId;
use crate::sandbox::manifest::{PluginId, SubBudget};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use ulid::Ulid;

/// Record schema version, bumped on layout changes
pub const SCHEMA_VERSION: u32 = 1;

/// Unique identifier of a stored snapshot
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SnapshotId(Ulid);

impl SnapshotId {
    pub fn new() -> Self {
        SnapshotId(Ulid::new())
    }
}

impl Default for SnapshotId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Enough of an attached plugin to re-instantiate it on recovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginRecord {
    pub plugin_id: PluginId,
    pub module_id: String,
    pub version: String,
    pub capabilities: Vec<String>,
    pub sub_budget: SubBudget,
}

/// Deep copy of an agent's mutable state, as handed to `capture`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotContents {
    pub state: HashMap<String, Value>,
    pub plugins: Vec<PluginRecord>,
    pub constraints: Constraints,
}

/// The full persisted record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub schema_version: u32,
    pub snapshot_id: SnapshotId,
    pub agent_id: AgentId,
    pub taken_at: DateTime<Utc>,

    #[serde(flatten)]
    pub contents: SnapshotContents,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_roundtrip() {
        let mut state = HashMap::new();
        state.insert("counter".to_string(), json!(0));

        let record = SnapshotRecord {
            schema_version: SCHEMA_VERSION,
            snapshot_id: SnapshotId::new(),
            agent_id: AgentId::new(),
            taken_at: Utc::now(),
            contents: SnapshotContents {
                state,
                plugins: vec![PluginRecord {
                    plugin_id: PluginId::new(),
                    module_id: "kv.tools".to_string(),
                    version: "1.2.0".to_string(),
                    capabilities: vec!["state-read".to_string()],
                    sub_budget: SubBudget {
                        cpu_millis: 10,
                        memory_bytes: 4096,
                    },
                }],
                constraints: Constraints {
                    cpu_fraction: 0.1,
                    memory_bytes: 64 * 1024 * 1024,
                },
            },
        };

        let encoded = serde_json::to_vec(&record).unwrap();
        let decoded: SnapshotRecord = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded.snapshot_id, record.snapshot_id);
        assert_eq!(decoded.contents.state["counter"], json!(0));
        assert_eq!(decoded.contents.plugins, record.contents.plugins);
    }
}
