// src/sandbox/manifest.rs
//! Module reference format
//!
//! A plugin module is distributed as three parts:
//!
//! - **Manifest**: id, version, declared capabilities, exported operations,
//!   sandbox sub-budget
//! - **Payload**: the module artifact, a serialized operation table binding
//!   each exported name to a host operation kind, its declared cost, and
//!   static configuration
//! - **Signature**: detached ed25519 signature over the payload bytes

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use ulid::Ulid;

/// Unique identifier of an attached plugin instance
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct PluginId(Ulid);

impl PluginId {
    pub fn new() -> Self {
        PluginId(Ulid::new())
    }
}

impl Default for PluginId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Sandbox resource sub-budget, a subset of the owning agent's budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubBudget {
    /// CPU share per accounting window (ms)
    pub cpu_millis: u64,

    /// Memory reserved for the instance (bytes)
    pub memory_bytes: u64,
}

/// Declared per-invocation cost of an exported operation
///
/// Used as the admission estimate; actual usage is reconciled post-execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub cpu_millis: u64,
    pub memory_bytes: u64,
}

/// Module metadata shipped alongside the payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleManifest {
    pub module_id: String,
    pub version: String,

    /// Declared capability names (see [`crate::sandbox::capability::Capability`])
    pub capabilities: Vec<String>,

    /// Exported operation names
    pub operations: Vec<String>,

    pub sub_budget: SubBudget,
}

/// One entry of the payload operation table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpSpec {
    /// Registered handler this operation binds to
    pub handler: String,

    /// Declared per-invocation cost
    #[serde(default)]
    pub cost: CostEstimate,

    /// Static handler configuration
    #[serde(default)]
    pub config: serde_json::Value,
}

/// Payload wire format: exported operation name -> spec
pub type OperationTable = HashMap<String, OpSpec>;

/// A module as handed to `load`: manifest + payload + detached signature
#[derive(Debug, Clone)]
pub struct ModuleRef {
    pub manifest: ModuleManifest,
    pub payload: Bytes,
    pub signature: Vec<u8>,
}

impl ModuleRef {
    /// Assemble a module reference from its three parts
    pub fn new(manifest: ModuleManifest, payload: impl Into<Bytes>, signature: Vec<u8>) -> Self {
        Self {
            manifest,
            payload: payload.into(),
            signature,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_table_decode() {
        let raw = r#"{
            "echo": {"handler": "echo", "cost": {"cpu_millis": 5, "memory_bytes": 4096}},
            "bump": {"handler": "state.put"}
        }"#;
        let table: OperationTable = serde_json::from_str(raw).unwrap();
        assert_eq!(table["echo"].handler, "echo");
        assert_eq!(table["echo"].cost.cpu_millis, 5);
        // Missing cost defaults to zero
        assert_eq!(table["bump"].cost, CostEstimate::default());
    }

    #[test]
    fn test_plugin_ids_unique() {
        assert_ne!(PluginId::new(), PluginId::new());
    }
}
