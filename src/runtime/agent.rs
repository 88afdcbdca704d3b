// src/runtime/agent.rs
//! Agent identity, constraints, and lifecycle state
//!
//! An agent is a managed execution context: identity, declared constraints,
//! attached plugins, a key/value state store, and a lifecycle status. All of
//! it is owned exclusively by the manager and mutated only through manager
//! operations.

use crate::resources::ledger::Constraints;
use crate::sandbox::instance::PluginInstance;
use crate::sandbox::manifest::PluginId;
use crate::utils::config::RuntimeConfig;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::Mutex;
use ulid::Ulid;

/// Unique identifier of a live agent
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct AgentId(Ulid);

impl AgentId {
    pub fn new() -> Self {
        AgentId(Ulid::new())
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Agent lifecycle status
///
/// ```text
/// Spawned ──► Active ◄──► Suspended
///                │            │
///                └─────┬──────┘
///                      ▼
///                 Terminated (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentStatus {
    Spawned,
    Active,
    Suspended,
    Terminated,
}

impl AgentStatus {
    /// Explicit state machine: which transitions are legal
    pub fn can_transition(self, to: AgentStatus) -> bool {
        use AgentStatus::*;
        matches!(
            (self, to),
            (Spawned, Active)
                | (Active, Suspended)
                | (Suspended, Active)
                | (Spawned, Terminated)
                | (Active, Terminated)
                | (Suspended, Terminated)
        )
    }
}

/// Spawn-time configuration
///
/// Recognized options are `cpu` and `memory`; unrecognized options are
/// collected and ignored. Missing options fall back to the configured
/// system-wide minimums.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpawnOptions {
    /// Fraction of one core, (0, 1]
    pub cpu: Option<f64>,

    /// Memory ceiling in bytes
    pub memory: Option<u64>,

    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl SpawnOptions {
    pub fn resolve(&self, defaults: &RuntimeConfig) -> Constraints {
        Constraints {
            cpu_fraction: self.cpu.unwrap_or(defaults.default_cpu_fraction),
            memory_bytes: self.memory.unwrap_or(defaults.default_memory_bytes),
        }
    }
}

/// Everything mutable about an agent, guarded by the cell's RwLock
pub(crate) struct AgentInner {
    pub status: AgentStatus,
    pub constraints: Constraints,
    pub state: HashMap<String, Value>,
    pub plugins: HashMap<PluginId, PluginInstance>,

    /// Operation routing table: exported name -> owning plugin
    pub ops: HashMap<String, PluginId>,
}

/// One live agent
///
/// The async `gate` is the per-agent exclusive section: at most one mutating
/// operation holds it at a time. Read-only queries take the inner read lock
/// and run concurrently with each other.
pub(crate) struct AgentCell {
    pub id: AgentId,
    pub created_at: DateTime<Utc>,
    pub gate: Mutex<()>,
    pub inner: RwLock<AgentInner>,
}

impl AgentCell {
    pub fn new(id: AgentId, constraints: Constraints) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            gate: Mutex::new(()),
            inner: RwLock::new(AgentInner {
                status: AgentStatus::Spawned,
                constraints,
                state: HashMap::new(),
                plugins: HashMap::new(),
                ops: HashMap::new(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        use AgentStatus::*;
        assert!(Spawned.can_transition(Active));
        assert!(Active.can_transition(Suspended));
        assert!(Suspended.can_transition(Active));
        assert!(Suspended.can_transition(Terminated));
        assert!(!Terminated.can_transition(Active));
        assert!(!Spawned.can_transition(Suspended));
    }

    #[test]
    fn test_spawn_options_defaults() {
        let defaults = RuntimeConfig::default();
        let resolved = SpawnOptions::default().resolve(&defaults);
        assert_eq!(resolved.cpu_fraction, defaults.default_cpu_fraction);
        assert_eq!(resolved.memory_bytes, defaults.default_memory_bytes);
    }

    #[test]
    fn test_spawn_options_ignore_unrecognized() {
        let raw = serde_json::json!({
            "cpu": 0.25,
            "memory": 1048576,
            "favorite_color": "teal"
        });
        let options: SpawnOptions = serde_json::from_value(raw).unwrap();
        assert!(options.extra.contains_key("favorite_color"));

        let resolved = options.resolve(&RuntimeConfig::default());
        assert_eq!(resolved.cpu_fraction, 0.25);
        assert_eq!(resolved.memory_bytes, 1048576);
    }
}
