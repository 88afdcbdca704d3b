// src/sandbox/instance.rs
//! Plugin instances and the isolation context
//!
//! The only two ways an operation interacts with the host:
//!
//! - **State handle**: capability-gated access to the agent's key/value
//!   store. Reads come from a point-in-time view; writes are buffered into a
//!   delta that the manager applies at commit, inside the agent's exclusive
//!   section. A failed invocation therefore leaves agent state untouched.
//! - **Invocation meter**: resource usage reporting against the instance
//!   sub-budget, reconciled into the ledger after the call.

use crate::sandbox::capability::{Capability, CapabilitySet};
use crate::sandbox::manifest::{PluginId, SubBudget};
use crate::sandbox::VerifiedModule;
use crate::utils::errors::{EngineError, FaultReason, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// A buffered state mutation produced by an invocation
#[derive(Debug, Clone, PartialEq)]
pub enum StateOp {
    Put(String, Value),
    Delete(String),
}

/// Capability-gated handle to the agent's state store
#[derive(Clone)]
pub struct AgentStateHandle {
    view: Arc<HashMap<String, Value>>,
    delta: Arc<Mutex<Vec<StateOp>>>,
    caps: CapabilitySet,
}

impl AgentStateHandle {
    pub fn new(view: Arc<HashMap<String, Value>>, caps: CapabilitySet) -> Self {
        Self {
            view,
            delta: Arc::new(Mutex::new(Vec::new())),
            caps,
        }
    }

    /// Read a key, observing this invocation's own buffered writes first
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        self.caps.check(Capability::StateRead)?;
        let delta = self.delta.lock();
        for op in delta.iter().rev() {
            match op {
                StateOp::Put(k, v) if k == key => return Ok(Some(v.clone())),
                StateOp::Delete(k) if k == key => return Ok(None),
                _ => {}
            }
        }
        Ok(self.view.get(key).cloned())
    }

    pub fn put(&self, key: impl Into<String>, value: Value) -> Result<()> {
        self.caps.check(Capability::StateWrite)?;
        self.delta.lock().push(StateOp::Put(key.into(), value));
        Ok(())
    }

    pub fn delete(&self, key: impl Into<String>) -> Result<()> {
        self.caps.check(Capability::StateWrite)?;
        self.delta.lock().push(StateOp::Delete(key.into()));
        Ok(())
    }

    /// Drain the buffered delta (called by the sandbox after the task ends)
    pub(crate) fn take_delta(&self) -> Vec<StateOp> {
        std::mem::take(&mut *self.delta.lock())
    }
}

/// Per-invocation resource usage reporter
///
/// Memory reservations are refused once they would exceed the instance
/// sub-budget; CPU is measured as elapsed wall-clock time of the handler.
pub struct InvocationMeter {
    memory_limit: u64,
    memory_used: AtomicU64,
    memory_peak: AtomicU64,
    started: Instant,
}

impl InvocationMeter {
    pub fn new(memory_limit: u64) -> Self {
        Self {
            memory_limit,
            memory_used: AtomicU64::new(0),
            memory_peak: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    /// Reserve working memory; faults with `BudgetBreached` over the sub-budget
    pub fn reserve_memory(&self, bytes: u64) -> Result<()> {
        let limit = self.memory_limit;
        self.memory_used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                let next = used.saturating_add(bytes);
                (next <= limit).then_some(next)
            })
            .map_err(|used| {
                EngineError::fault(
                    FaultReason::BudgetBreached,
                    format!(
                        "memory reservation {} over sub-budget ({} of {} used)",
                        bytes, used, limit
                    ),
                )
            })?;
        self.memory_peak
            .fetch_max(self.memory_used.load(Ordering::SeqCst), Ordering::SeqCst);
        Ok(())
    }

    /// Return previously reserved memory
    pub fn release_memory(&self, bytes: u64) {
        let _ = self
            .memory_used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                Some(used.saturating_sub(bytes))
            });
    }

    /// Elapsed CPU time attributed to this invocation (wall-clock proxy, ms)
    pub fn cpu_elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Highest memory reservation observed during the invocation
    pub fn memory_peak(&self) -> u64 {
        self.memory_peak.load(Ordering::SeqCst)
    }
}

/// A verified module bound to one agent
#[derive(Clone)]
pub struct PluginInstance {
    pub id: PluginId,
    pub module: Arc<VerifiedModule>,
    pub granted: CapabilitySet,
    pub sub_budget: SubBudget,
    pub attached_at: DateTime<Utc>,
}

impl PluginInstance {
    pub fn new(module: Arc<VerifiedModule>, id: PluginId) -> Self {
        let granted = module.capabilities.clone();
        let sub_budget = module.manifest.sub_budget;
        Self {
            id,
            module,
            granted,
            sub_budget,
            attached_at: Utc::now(),
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn handle(caps: CapabilitySet) -> AgentStateHandle {
        let mut view = HashMap::new();
        view.insert("greeting".to_string(), json!("hello"));
        AgentStateHandle::new(Arc::new(view), caps)
    }

    #[test]
    fn test_state_reads_see_own_writes() {
        let caps = CapabilitySet::new([Capability::StateRead, Capability::StateWrite]);
        let handle = handle(caps);

        assert_eq!(handle.get("greeting").unwrap(), Some(json!("hello")));
        handle.put("greeting", json!("hi")).unwrap();
        assert_eq!(handle.get("greeting").unwrap(), Some(json!("hi")));
        handle.delete("greeting").unwrap();
        assert_eq!(handle.get("greeting").unwrap(), None);

        let delta = handle.take_delta();
        assert_eq!(delta.len(), 2);
    }

    #[test]
    fn test_state_gates_by_capability() {
        let read_only = handle(CapabilitySet::new([Capability::StateRead]));
        assert!(read_only.get("greeting").is_ok());

        let err = read_only.put("greeting", json!("nope")).unwrap_err();
        assert_eq!(err.fault_reason(), Some(FaultReason::CapabilityDenied));
    }

    #[test]
    fn test_meter_refuses_over_budget() {
        let meter = InvocationMeter::new(1024);
        meter.reserve_memory(512).unwrap();
        meter.reserve_memory(512).unwrap();

        let err = meter.reserve_memory(1).unwrap_err();
        assert_eq!(err.fault_reason(), Some(FaultReason::BudgetBreached));
        assert_eq!(meter.memory_peak(), 1024);

        meter.release_memory(1024);
        assert!(meter.reserve_memory(256).is_ok());
        // Peak is not lowered by releases
        assert_eq!(meter.memory_peak(), 1024);
    }
}
