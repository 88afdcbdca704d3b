// src/runtime/manager.rs
//! Agent lifecycle management
//!
//! The manager owns every agent and is the only mutator of agent state. It
//! composes the resource monitor, plugin sandbox, and snapshot store:
//!
//! ```text
//! spawn ──► register ceiling ──► Active
//! attach ─► verify module ───► reserve sub-budget ──► bind operations
//! execute ► status/policy ───► admit ──► sandbox ──► commit + apply delta
//! snapshot► exclusive section ► deep copy ──► store
//! recover ► restore record ──► rebuild plugins ──► swap state
//! ```
//!
//! # Locking discipline
//!
//! Each agent carries an async gate (the exclusive section) and a sync
//! RwLock over its data. Mutating phases hold the gate; the sandboxed body
//! of an execute runs without it, so long plugin calls never block unrelated
//! work on the same agent beyond admission and commit. Gate waits are
//! bounded; expiry surfaces as `Timeout` instead of hanging the caller.

use crate::audit::{AuditEvent, AuditKind, AuditTrail};
use crate::resources::ledger::LedgerView;
use crate::resources::monitor::ResourceMonitor;
use crate::runtime::agent::{AgentCell, AgentId, AgentStatus, SpawnOptions};
use crate::runtime::policy::{AllowAll, ExecutionPolicy};
use crate::sandbox::manifest::{CostEstimate, ModuleRef, PluginId};
use crate::sandbox::{PluginSandbox, StateOp};
use crate::snapshot::record::{PluginRecord, SnapshotContents, SnapshotId};
use crate::snapshot::store::SnapshotStore;
use crate::utils::config::EngineConfig;
use crate::utils::errors::{EngineError, Result};
use dashmap::DashMap;
use metrics::{counter, histogram};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::MutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Read-only summary of one agent
#[derive(Debug, Clone)]
pub struct AgentDescriptor {
    pub id: AgentId,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub status: AgentStatus,
    pub constraints: crate::resources::ledger::Constraints,
    pub plugins: Vec<PluginId>,
}

/// Owner of all agents and entry point for every operation on them
pub struct AgentManager {
    config: EngineConfig,
    agents: DashMap<AgentId, Arc<AgentCell>>,
    monitor: Arc<ResourceMonitor>,
    sandbox: Arc<PluginSandbox>,
    snapshots: Arc<SnapshotStore>,
    policy: Arc<dyn ExecutionPolicy>,
    audit: Arc<AuditTrail>,
}

impl AgentManager {
    pub fn new(
        config: EngineConfig,
        monitor: Arc<ResourceMonitor>,
        sandbox: Arc<PluginSandbox>,
        snapshots: Arc<SnapshotStore>,
        audit: Arc<AuditTrail>,
    ) -> Self {
        Self {
            config,
            agents: DashMap::new(),
            monitor,
            sandbox,
            snapshots,
            policy: Arc::new(AllowAll),
            audit,
        }
    }

    /// Replace the execution policy hook
    pub fn with_policy(mut self, policy: Arc<dyn ExecutionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    fn cell(&self, agent_id: AgentId) -> Result<Arc<AgentCell>> {
        self.agents
            .get(&agent_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::AgentNotFound(agent_id.to_string()))
    }

    fn attach_wait(&self) -> Duration {
        Duration::from_millis(self.config.runtime.attach_timeout_ms)
    }

    fn snapshot_wait(&self) -> Duration {
        Duration::from_millis(self.config.runtime.snapshot_timeout_ms)
    }

    fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.config.runtime.lock_wait_ms)
    }

    /// Acquire the agent's exclusive section with a bounded wait
    async fn lock_gate<'a>(
        &self,
        cell: &'a AgentCell,
        wait: Duration,
        what: &str,
    ) -> Result<MutexGuard<'a, ()>> {
        tokio::time::timeout(wait, cell.gate.lock())
            .await
            .map_err(|_| {
                EngineError::Timeout(format!(
                    "{} waited over {}ms for agent {}",
                    what,
                    wait.as_millis(),
                    cell.id
                ))
            })
    }

    fn record_audit(&self, kind: AuditKind, agent_id: Option<AgentId>, detail: impl Into<String>) {
        self.audit
            .record(AuditEvent::now(kind, agent_id.map(|a| a.to_string()), detail));
    }

    /// Apply suspend/resume hysteresis from the monitor's pressure signals
    fn refresh_pressure(&self, cell: &AgentCell) {
        let status = cell.inner.read().status;
        match status {
            AgentStatus::Active => {
                if self.monitor.should_suspend(cell.id) {
                    let mut inner = cell.inner.write();
                    if inner.status == AgentStatus::Active {
                        inner.status = AgentStatus::Suspended;
                        drop(inner);
                        warn!(agent = %cell.id, "Agent suspended under sustained resource pressure");
                        counter!("warden_suspensions_total").increment(1);
                        self.record_audit(AuditKind::AgentSuspended, Some(cell.id), "over budget");
                    }
                }
            }
            AgentStatus::Suspended => {
                if self.monitor.can_resume(cell.id) {
                    let mut inner = cell.inner.write();
                    if inner.status == AgentStatus::Suspended {
                        inner.status = AgentStatus::Active;
                        drop(inner);
                        info!(agent = %cell.id, "Agent resumed below hysteresis threshold");
                        self.record_audit(AuditKind::AgentResumed, Some(cell.id), "cooled down");
                    }
                }
            }
            _ => {}
        }
    }

    /// Create a new agent and register its resource ceiling
    pub fn spawn(&self, options: SpawnOptions) -> Result<AgentId> {
        let constraints = options.resolve(&self.config.runtime);
        constraints.validate()?;

        let agent_id = AgentId::new();
        self.monitor.register(agent_id, constraints)?;

        let cell = Arc::new(AgentCell::new(agent_id, constraints));
        cell.inner.write().status = AgentStatus::Active;
        self.agents.insert(agent_id, cell);

        counter!("warden_agents_spawned_total").increment(1);
        info!(
            agent = %agent_id,
            cpu = constraints.cpu_fraction,
            memory = constraints.memory_bytes,
            "Agent spawned"
        );
        self.record_audit(AuditKind::AgentSpawned, Some(agent_id), "spawned");

        Ok(agent_id)
    }

    /// Verify a module and bind it to an agent
    pub async fn attach_plugin(&self, agent_id: AgentId, module_ref: &ModuleRef) -> Result<PluginId> {
        let cell = self.cell(agent_id)?;
        let _gate = self.lock_gate(&cell, self.attach_wait(), "attach").await?;

        if cell.inner.read().status == AgentStatus::Terminated {
            return Err(EngineError::AgentTerminated(agent_id.to_string()));
        }

        let module = self.sandbox.load(module_ref)?;

        {
            let inner = cell.inner.read();
            for op in &module.manifest.operations {
                if inner.ops.contains_key(op) {
                    return Err(EngineError::OperationConflict(op.clone()));
                }
            }
        }

        let sub = module.manifest.sub_budget;
        self.monitor
            .reserve_plugin(agent_id, sub.cpu_millis, sub.memory_bytes)?;

        let plugin_id = PluginId::new();
        let instance = self.sandbox.instantiate(module.clone(), plugin_id);
        {
            let mut inner = cell.inner.write();
            for op in &module.manifest.operations {
                inner.ops.insert(op.clone(), plugin_id);
            }
            inner.plugins.insert(plugin_id, instance);
        }

        debug!(
            agent = %agent_id,
            plugin = %plugin_id,
            module = %module.manifest.module_id,
            "Plugin attached"
        );
        self.record_audit(
            AuditKind::PluginAttached,
            Some(agent_id),
            format!("{}@{}", module.manifest.module_id, module.manifest.version),
        );

        Ok(plugin_id)
    }

    /// Remove a plugin and release its reservations
    pub async fn detach_plugin(&self, agent_id: AgentId, plugin_id: PluginId) -> Result<()> {
        let cell = self.cell(agent_id)?;
        let _gate = self.lock_gate(&cell, self.attach_wait(), "detach").await?;

        let removed = {
            let mut inner = cell.inner.write();
            if inner.status == AgentStatus::Terminated {
                return Err(EngineError::AgentTerminated(agent_id.to_string()));
            }
            let instance = inner.plugins.remove(&plugin_id).ok_or_else(|| {
                EngineError::ModuleUnavailable(format!("plugin {} not attached", plugin_id))
            })?;
            inner.ops.retain(|_, owner| *owner != plugin_id);
            instance
        };

        self.monitor.release_plugin(
            agent_id,
            removed.sub_budget.cpu_millis,
            removed.sub_budget.memory_bytes,
        );
        self.record_audit(
            AuditKind::PluginDetached,
            Some(agent_id),
            plugin_id.to_string(),
        );
        Ok(())
    }

    /// Execute an exported operation on an agent
    pub async fn execute(&self, agent_id: AgentId, operation: &str, params: Value) -> Result<Value> {
        self.execute_with_cancel(agent_id, operation, params, CancellationToken::new())
            .await
    }

    /// Execute with a caller-held cancellation token
    ///
    /// Cancellation is best-effort: the sandbox aborts at the next safe
    /// checkpoint and partial consumption up to that point is committed.
    pub async fn execute_with_cancel(
        &self,
        agent_id: AgentId,
        operation: &str,
        params: Value,
        cancel: CancellationToken,
    ) -> Result<Value> {
        let cell = self.cell(agent_id)?;
        self.refresh_pressure(&cell);

        // Status gate, operation resolution, cost estimate, state view
        let (instance, estimate, state_view) = {
            let inner = cell.inner.read();
            match inner.status {
                AgentStatus::Terminated => {
                    return Err(EngineError::AgentTerminated(agent_id.to_string()))
                }
                AgentStatus::Suspended => {
                    return Err(EngineError::AgentSuspended(agent_id.to_string()))
                }
                _ => {}
            }
            let plugin_id = inner.ops.get(operation).copied().ok_or_else(|| {
                EngineError::OperationNotFound(operation.to_string())
            })?;
            let instance = inner.plugins.get(&plugin_id).cloned().ok_or_else(|| {
                EngineError::OperationNotFound(operation.to_string())
            })?;
            let estimate = instance
                .module
                .ops
                .get(operation)
                .map(|spec| spec.cost)
                .unwrap_or_default();
            (instance, estimate, Arc::new(inner.state.clone()))
        };

        // Policy veto happens before any side effect
        self.policy
            .evaluate(agent_id, operation, &params)
            .map_err(EngineError::PolicyDenied)?;

        // Admission: serialize per agent, reserve the estimate
        {
            let _gate = self
                .lock_gate(&cell, self.lock_wait(), "execute admission")
                .await?;
            if !self
                .monitor
                .admit(agent_id, estimate.cpu_millis, estimate.memory_bytes)
            {
                counter!("warden_admission_rejects_total").increment(1);
                return Err(EngineError::ResourceExhausted(format!(
                    "operation '{}' estimate (cpu {}ms, mem {}B) exceeds remaining headroom",
                    operation, estimate.cpu_millis, estimate.memory_bytes
                )));
            }
        }

        // Sandboxed body runs without the agent gate
        let report = self
            .sandbox
            .invoke(&instance, operation, params, state_view, cancel)
            .await;

        // Commit phase: settle the reservation and apply buffered writes
        let _gate = cell.gate.lock().await;
        self.monitor.commit(
            agent_id,
            report.cpu_millis,
            report.memory_peak_bytes,
            estimate.cpu_millis,
            estimate.memory_bytes,
        );
        histogram!("warden_operation_duration_ms").record(report.cpu_millis as f64);

        match report.outcome {
            Ok((value, delta)) => {
                {
                    let mut inner = cell.inner.write();
                    if inner.status == AgentStatus::Terminated {
                        return Err(EngineError::AgentTerminated(agent_id.to_string()));
                    }
                    for op in delta {
                        match op {
                            StateOp::Put(key, value) => {
                                inner.state.insert(key, value);
                            }
                            StateOp::Delete(key) => {
                                inner.state.remove(&key);
                            }
                        }
                    }
                }
                counter!("warden_operations_total", "outcome" => "ok").increment(1);
                self.record_audit(
                    AuditKind::OperationExecuted,
                    Some(agent_id),
                    format!("{} ({}ms)", operation, report.cpu_millis),
                );
                Ok(value)
            }
            Err(err) => {
                counter!("warden_operations_total", "outcome" => "fault").increment(1);
                self.record_audit(
                    AuditKind::OperationFailed,
                    Some(agent_id),
                    format!("{}: {}", operation, err),
                );
                Err(err)
            }
        }
    }

    /// Declared cost of an exported operation (agreement admission)
    pub fn estimated_cost(&self, agent_id: AgentId, operation: &str) -> Result<CostEstimate> {
        let cell = self.cell(agent_id)?;
        let inner = cell.inner.read();
        if inner.status == AgentStatus::Terminated {
            return Err(EngineError::AgentTerminated(agent_id.to_string()));
        }
        let plugin_id = inner
            .ops
            .get(operation)
            .ok_or_else(|| EngineError::OperationNotFound(operation.to_string()))?;
        let instance = inner
            .plugins
            .get(plugin_id)
            .ok_or_else(|| EngineError::OperationNotFound(operation.to_string()))?;
        Ok(instance
            .module
            .ops
            .get(operation)
            .map(|spec| spec.cost)
            .unwrap_or_default())
    }

    /// Write a key in the agent's state store
    pub async fn set_state(&self, agent_id: AgentId, key: impl Into<String>, value: Value) -> Result<()> {
        let cell = self.cell(agent_id)?;
        let _gate = self.lock_gate(&cell, self.lock_wait(), "set_state").await?;
        let mut inner = cell.inner.write();
        if inner.status == AgentStatus::Terminated {
            return Err(EngineError::AgentTerminated(agent_id.to_string()));
        }
        inner.state.insert(key.into(), value);
        Ok(())
    }

    /// Read a key from the agent's state store
    pub fn get_state(&self, agent_id: AgentId, key: &str) -> Result<Option<Value>> {
        let cell = self.cell(agent_id)?;
        let inner = cell.inner.read();
        if inner.status == AgentStatus::Terminated {
            return Err(EngineError::AgentTerminated(agent_id.to_string()));
        }
        Ok(inner.state.get(key).cloned())
    }

    /// Capture the agent's full state as an immutable snapshot
    pub async fn snapshot(&self, agent_id: AgentId) -> Result<SnapshotId> {
        let cell = self.cell(agent_id)?;
        let _gate = self.lock_gate(&cell, self.snapshot_wait(), "snapshot").await?;

        let contents = {
            let inner = cell.inner.read();
            if inner.status == AgentStatus::Terminated {
                return Err(EngineError::AgentTerminated(agent_id.to_string()));
            }
            SnapshotContents {
                state: inner.state.clone(),
                plugins: inner
                    .plugins
                    .values()
                    .map(|p| PluginRecord {
                        plugin_id: p.id,
                        module_id: p.module.manifest.module_id.clone(),
                        version: p.module.manifest.version.clone(),
                        capabilities: p.granted.names(),
                        sub_budget: p.sub_budget,
                    })
                    .collect(),
                constraints: inner.constraints,
            }
        };

        let snapshot_id = tokio::time::timeout(
            self.snapshot_wait(),
            self.snapshots.capture(agent_id, contents),
        )
        .await
        .map_err(|_| EngineError::Timeout("snapshot capture".to_string()))??;

        counter!("warden_snapshots_total").increment(1);
        self.record_audit(AuditKind::SnapshotTaken, Some(agent_id), snapshot_id.to_string());
        Ok(snapshot_id)
    }

    /// Replace the agent's state with a snapshot's contents
    ///
    /// Permitted while Suspended: recovery is an administrative repair path
    /// that consumes no plugin budget; it clears the over-budget flag so the
    /// next pressure check starts clean.
    pub async fn recover(&self, agent_id: AgentId, snapshot_id: SnapshotId) -> Result<()> {
        let cell = self.cell(agent_id)?;
        let _gate = self.lock_gate(&cell, self.snapshot_wait(), "recover").await?;

        let record = tokio::time::timeout(self.snapshot_wait(), self.snapshots.restore(snapshot_id))
            .await
            .map_err(|_| EngineError::Timeout("snapshot restore".to_string()))??;

        if record.agent_id != agent_id {
            return Err(EngineError::AgentMismatch {
                snapshot_id: snapshot_id.to_string(),
                owner: record.agent_id.to_string(),
                requested: agent_id.to_string(),
            });
        }
        if cell.inner.read().status == AgentStatus::Terminated {
            return Err(EngineError::AgentTerminated(agent_id.to_string()));
        }

        record.contents.constraints.validate()?;

        // Rebuild plugin instances from the sandbox module cache
        let mut plugins = HashMap::new();
        let mut ops = HashMap::new();
        let mut cpu_total = 0u64;
        let mut mem_total = 0u64;
        for p in &record.contents.plugins {
            let module = self.sandbox.cached(&p.module_id, &p.version).ok_or_else(|| {
                EngineError::ModuleUnavailable(format!("{}@{}", p.module_id, p.version))
            })?;
            let instance = self.sandbox.instantiate(module.clone(), p.plugin_id);
            for op in &module.manifest.operations {
                ops.insert(op.clone(), p.plugin_id);
            }
            cpu_total += p.sub_budget.cpu_millis;
            mem_total += p.sub_budget.memory_bytes;
            plugins.insert(p.plugin_id, instance);
        }

        self.monitor.set_ceiling(agent_id, record.contents.constraints);
        self.monitor.rebind_plugins(agent_id, cpu_total, mem_total)?;
        self.monitor.clear_pressure(agent_id);

        {
            let mut inner = cell.inner.write();
            inner.state = record.contents.state;
            inner.plugins = plugins;
            inner.ops = ops;
            inner.constraints = record.contents.constraints;
        }

        info!(agent = %agent_id, snapshot = %snapshot_id, "Agent recovered");
        self.record_audit(AuditKind::AgentRecovered, Some(agent_id), snapshot_id.to_string());
        Ok(())
    }

    /// Tear down an agent; idempotent on an already-terminated agent
    pub async fn terminate(&self, agent_id: AgentId) -> Result<()> {
        let cell = self.cell(agent_id)?;
        let _gate = self.lock_gate(&cell, self.attach_wait(), "terminate").await?;

        {
            let mut inner = cell.inner.write();
            if inner.status == AgentStatus::Terminated {
                return Ok(());
            }
            inner.plugins.clear();
            inner.ops.clear();
            inner.status = AgentStatus::Terminated;
        }

        self.monitor.release(agent_id);
        info!(agent = %agent_id, "Agent terminated");
        self.record_audit(AuditKind::AgentTerminated, Some(agent_id), "terminated");
        Ok(())
    }

    /// Terminate every live agent (daemon shutdown path)
    pub async fn terminate_all(&self) {
        let ids: Vec<AgentId> = self.agents.iter().map(|entry| *entry.key()).collect();
        let results = futures::future::join_all(ids.into_iter().map(|id| self.terminate(id))).await;
        for result in results {
            if let Err(e) = result {
                warn!("Terminate during shutdown failed: {}", e);
            }
        }
    }

    /// Current lifecycle status
    pub fn status(&self, agent_id: AgentId) -> Result<AgentStatus> {
        Ok(self.cell(agent_id)?.inner.read().status)
    }

    /// Identity, status, and constraints in one read
    pub fn describe(&self, agent_id: AgentId) -> Result<AgentDescriptor> {
        let cell = self.cell(agent_id)?;
        let inner = cell.inner.read();
        Ok(AgentDescriptor {
            id: cell.id,
            created_at: cell.created_at,
            status: inner.status,
            constraints: inner.constraints,
            plugins: inner.plugins.keys().copied().collect(),
        })
    }

    /// Current ledger totals
    pub fn ledger(&self, agent_id: AgentId) -> Result<LedgerView> {
        let cell = self.cell(agent_id)?;
        if cell.inner.read().status == AgentStatus::Terminated {
            return Err(EngineError::AgentTerminated(agent_id.to_string()));
        }
        self.monitor
            .view(agent_id)
            .ok_or_else(|| EngineError::AgentNotFound(agent_id.to_string()))
    }
}
