// src/resources/monitor.rs
//! Resource admission and reconciliation
//!
//! The monitor keeps one [`Ledger`] per agent plus an aggregate system
//! ledger. Admission is a conservative pre-check: estimated cost is reserved
//! against both ledgers before any work starts, and an operation that cannot
//! fit is rejected with no side effects. True usage is reconciled after
//! execution via [`ResourceMonitor::commit`]; an invocation that overshot its
//! estimate flags the agent for suspension on the next pressure check rather
//! than being retroactively penalized, since sandboxed code cannot guarantee exact
//! cost prediction in advance.

use crate::resources::ledger::{Constraints, Ledger, LedgerView};
use crate::runtime::agent::AgentId;
use crate::utils::config::EngineConfig;
use crate::utils::errors::{EngineError, Result};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Monitor tunables
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Rolling CPU accounting window (ms)
    pub window_ms: u64,

    /// System-wide CPU budget per window (ms)
    pub system_cpu_ms: u64,

    /// System-wide memory budget (bytes)
    pub system_memory_bytes: u64,

    /// Window spend percent at which a flagged agent suspends
    pub suspend_watermark_pct: u64,

    /// Window spend percent at which a suspended agent may resume
    pub resume_watermark_pct: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window_ms: 1_000,
            system_cpu_ms: 4_000,
            system_memory_bytes: 2 * 1024 * 1024 * 1024,
            suspend_watermark_pct: 100,
            resume_watermark_pct: 60,
        }
    }
}

impl MonitorConfig {
    pub fn from_engine(config: &EngineConfig) -> Self {
        let window_ms = config.runtime.cpu_window_ms;
        Self {
            window_ms,
            system_cpu_ms: (config.system.cpu_cores * window_ms as f64) as u64,
            system_memory_bytes: config.system.memory_bytes,
            suspend_watermark_pct: config.runtime.suspend_watermark_pct,
            resume_watermark_pct: config.runtime.resume_watermark_pct,
        }
    }
}

/// Per-agent and system-wide resource enforcement
pub struct ResourceMonitor {
    config: MonitorConfig,
    epoch: Instant,
    ledgers: DashMap<AgentId, Arc<Ledger>>,
    system: Ledger,
}

impl ResourceMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        let system = Ledger::new(
            config.system_cpu_ms,
            config.system_memory_bytes,
            config.window_ms,
            0,
        );
        Self {
            config,
            epoch: Instant::now(),
            ledgers: DashMap::new(),
            system,
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn ledger(&self, agent_id: AgentId) -> Option<Arc<Ledger>> {
        self.ledgers.get(&agent_id).map(|entry| entry.value().clone())
    }

    /// Register an agent's ceiling
    pub fn register(&self, agent_id: AgentId, constraints: Constraints) -> Result<()> {
        constraints.validate()?;
        let ledger = Ledger::new(
            constraints.cpu_window_budget_ms(self.config.window_ms),
            constraints.memory_bytes,
            self.config.window_ms,
            self.now_ms(),
        );
        self.ledgers.insert(agent_id, Arc::new(ledger));
        debug!(agent = %agent_id, "Resource ledger registered");
        Ok(())
    }

    /// Replace an agent's ceiling (recovery path)
    pub fn set_ceiling(&self, agent_id: AgentId, constraints: Constraints) {
        if let Some(ledger) = self.ledger(agent_id) {
            ledger.set_ceiling(
                constraints.cpu_window_budget_ms(self.config.window_ms),
                constraints.memory_bytes,
            );
        }
    }

    /// Conservative admission pre-check; reserves the estimate on success
    pub fn admit(&self, agent_id: AgentId, est_cpu_ms: u64, est_mem_bytes: u64) -> bool {
        let Some(ledger) = self.ledger(agent_id) else {
            return false;
        };
        let now = self.now_ms();
        ledger.roll_window(now);
        self.system.roll_window(now);

        if !ledger.try_reserve(est_cpu_ms, est_mem_bytes) {
            return false;
        }
        if !self.system.try_reserve(est_cpu_ms, est_mem_bytes) {
            ledger.unreserve(est_cpu_ms, est_mem_bytes);
            warn!(agent = %agent_id, "Admission refused by system ledger");
            return false;
        }
        true
    }

    /// Reconcile actual usage after an invocation completed or faulted
    pub fn commit(
        &self,
        agent_id: AgentId,
        actual_cpu_ms: u64,
        actual_mem_bytes: u64,
        est_cpu_ms: u64,
        est_mem_bytes: u64,
    ) {
        let Some(ledger) = self.ledger(agent_id) else {
            // Agent released mid-flight; its share of the system window is
            // returned via the estimate
            self.system.unreserve(est_cpu_ms, est_mem_bytes);
            return;
        };
        ledger.settle(actual_cpu_ms, actual_mem_bytes, est_cpu_ms, est_mem_bytes);
        self.system
            .settle(actual_cpu_ms, actual_mem_bytes, est_cpu_ms, est_mem_bytes);
    }

    /// Reserve a plugin sub-budget against the agent ceiling
    pub fn reserve_plugin(&self, agent_id: AgentId, cpu_ms: u64, mem_bytes: u64) -> Result<()> {
        let ledger = self
            .ledger(agent_id)
            .ok_or_else(|| EngineError::AgentNotFound(agent_id.to_string()))?;
        if !ledger.reserve_plugin(cpu_ms, mem_bytes) {
            return Err(EngineError::BudgetExceeded(format!(
                "sub-budget (cpu {}ms, mem {}B) does not fit agent headroom",
                cpu_ms, mem_bytes
            )));
        }
        if !self.system.reserve_plugin(cpu_ms, mem_bytes) {
            ledger.release_plugin(cpu_ms, mem_bytes);
            return Err(EngineError::BudgetExceeded(
                "sub-budget does not fit system headroom".to_string(),
            ));
        }
        Ok(())
    }

    pub fn release_plugin(&self, agent_id: AgentId, cpu_ms: u64, mem_bytes: u64) {
        if let Some(ledger) = self.ledger(agent_id) {
            ledger.release_plugin(cpu_ms, mem_bytes);
        }
        self.system.release_plugin(cpu_ms, mem_bytes);
    }

    /// Swap an agent's plugin reservations for a recovered set
    pub fn rebind_plugins(&self, agent_id: AgentId, cpu_ms: u64, mem_bytes: u64) -> Result<()> {
        let ledger = self
            .ledger(agent_id)
            .ok_or_else(|| EngineError::AgentNotFound(agent_id.to_string()))?;

        let (old_cpu, old_mem) = ledger.plugin_shares();
        ledger.release_plugin(old_cpu, old_mem);
        self.system.release_plugin(old_cpu, old_mem);

        if !ledger.reserve_plugin(cpu_ms, mem_bytes) || !self.system.reserve_plugin(cpu_ms, mem_bytes)
        {
            // Roll back to the previous shares; capture-time invariants make
            // this unreachable unless ceilings shrank concurrently
            let _ = ledger.reserve_plugin(old_cpu, old_mem);
            let _ = self.system.reserve_plugin(old_cpu, old_mem);
            return Err(EngineError::BudgetExceeded(
                "recovered sub-budgets do not fit".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether the agent should transition to Suspended
    pub fn should_suspend(&self, agent_id: AgentId) -> bool {
        let Some(ledger) = self.ledger(agent_id) else {
            return false;
        };
        ledger.roll_window(self.now_ms());
        ledger.over_budget() && ledger.spend_pct() >= self.config.suspend_watermark_pct
    }

    /// Whether a suspended agent has cooled below the resume watermark
    ///
    /// Clears the over-budget flag when resumption is granted.
    pub fn can_resume(&self, agent_id: AgentId) -> bool {
        let Some(ledger) = self.ledger(agent_id) else {
            return false;
        };
        ledger.roll_window(self.now_ms());
        if ledger.spend_pct() <= self.config.resume_watermark_pct {
            ledger.clear_over_budget();
            true
        } else {
            false
        }
    }

    pub fn clear_pressure(&self, agent_id: AgentId) {
        if let Some(ledger) = self.ledger(agent_id) {
            ledger.clear_over_budget();
        }
    }

    /// Zero and deregister the agent's ledger
    pub fn release(&self, agent_id: AgentId) {
        if let Some((_, ledger)) = self.ledgers.remove(&agent_id) {
            let (plugin_cpu, plugin_mem) = ledger.plugin_shares();
            self.system.release_plugin(plugin_cpu, plugin_mem);

            // Remaining reservations belong to in-flight invocations
            let inflight = ledger.memory_reserved().saturating_sub(plugin_mem);
            self.system.unreserve(0, inflight);
            debug!(agent = %agent_id, "Resource ledger released");
        }
    }

    pub fn view(&self, agent_id: AgentId) -> Option<LedgerView> {
        self.ledger(agent_id).map(|ledger| ledger.view())
    }

    pub fn system_view(&self) -> LedgerView {
        self.system.view()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constraints(cpu_fraction: f64, memory_bytes: u64) -> Constraints {
        Constraints {
            cpu_fraction,
            memory_bytes,
        }
    }

    fn monitor() -> ResourceMonitor {
        ResourceMonitor::new(MonitorConfig::default())
    }

    #[test]
    fn test_register_and_admit() {
        let monitor = monitor();
        let agent = AgentId::new();
        monitor.register(agent, constraints(0.1, 1_000)).unwrap();

        // Ceiling: 0.1 * 1000ms window = 100ms
        assert!(monitor.admit(agent, 100, 500));
        assert!(!monitor.admit(agent, 1, 0), "window ceiling reached");

        monitor.commit(agent, 80, 500, 100, 500);
        let view = monitor.view(agent).unwrap();
        assert_eq!(view.cpu_window_spent_ms, 80);
        assert_eq!(view.memory_reserved_bytes, 0);
    }

    #[test]
    fn test_admit_unknown_agent_fails() {
        let monitor = monitor();
        assert!(!monitor.admit(AgentId::new(), 0, 0));
    }

    #[test]
    fn test_rejected_admission_is_side_effect_free() {
        let monitor = monitor();
        let agent = AgentId::new();
        monitor.register(agent, constraints(0.1, 1_000)).unwrap();

        let before = monitor.view(agent).unwrap();
        assert!(!monitor.admit(agent, 10_000, 0));
        let after = monitor.view(agent).unwrap();
        assert_eq!(before.cpu_window_spent_ms, after.cpu_window_spent_ms);
        assert_eq!(before.memory_reserved_bytes, after.memory_reserved_bytes);
    }

    #[test]
    fn test_system_ledger_bounds_aggregate() {
        let config = MonitorConfig {
            system_memory_bytes: 1_000,
            ..Default::default()
        };
        let monitor = ResourceMonitor::new(config);

        let a = AgentId::new();
        let b = AgentId::new();
        monitor.register(a, constraints(1.0, 900)).unwrap();
        monitor.register(b, constraints(1.0, 900)).unwrap();

        assert!(monitor.admit(a, 0, 800));
        // Each agent has headroom, but the system does not
        assert!(!monitor.admit(b, 0, 800));
        assert_eq!(monitor.view(b).unwrap().memory_reserved_bytes, 0);
    }

    #[test]
    fn test_overshoot_drives_suspension_and_resume() {
        let monitor = monitor();
        let agent = AgentId::new();
        monitor.register(agent, constraints(0.05, 1_000)).unwrap();

        // Ceiling is 50ms; estimate 10, actual 60: flagged and over watermark
        assert!(monitor.admit(agent, 10, 0));
        monitor.commit(agent, 60, 0, 10, 0);

        assert!(monitor.should_suspend(agent));
        assert!(!monitor.can_resume(agent), "spend still above resume watermark");

        // A fresh window cools the agent down
        std::thread::sleep(std::time::Duration::from_millis(1_100));
        assert!(monitor.can_resume(agent));
        assert!(!monitor.should_suspend(agent), "flag cleared on resume");
    }

    #[test]
    fn test_plugin_reservation_lifecycle() {
        let monitor = monitor();
        let agent = AgentId::new();
        monitor.register(agent, constraints(0.1, 1_000)).unwrap();

        monitor.reserve_plugin(agent, 50, 600).unwrap();
        let err = monitor.reserve_plugin(agent, 60, 100).unwrap_err();
        assert!(matches!(err, EngineError::BudgetExceeded(_)));

        monitor.release_plugin(agent, 50, 600);
        assert_eq!(monitor.view(agent).unwrap().memory_reserved_bytes, 0);
    }

    #[test]
    fn test_release_returns_system_share() {
        let monitor = monitor();
        let agent = AgentId::new();
        monitor.register(agent, constraints(0.5, 10_000)).unwrap();
        monitor.reserve_plugin(agent, 100, 5_000).unwrap();

        let before = monitor.system_view().memory_reserved_bytes;
        assert!(before >= 5_000);

        monitor.release(agent);
        assert!(monitor.view(agent).is_none());
        assert_eq!(monitor.system_view().memory_reserved_bytes, before - 5_000);
    }
}
