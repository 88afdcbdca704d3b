// src/resources/ledger.rs
//! Per-agent resource accounting
//!
//! A ledger tracks CPU time spent within a rolling window and memory
//! currently reserved (plugin sub-budgets plus in-flight invocation
//! reservations) against a static ceiling. All counters are atomics;
//! reservation uses compare-and-swap so concurrent admissions can never
//! jointly overshoot the ceiling.

use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Declared resource constraints of an agent
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    /// Fraction of one core, (0, 1]
    pub cpu_fraction: f64,

    /// Memory ceiling in bytes, > 0
    pub memory_bytes: u64,
}

impl Constraints {
    pub fn validate(&self) -> Result<()> {
        if !(self.cpu_fraction > 0.0 && self.cpu_fraction <= 1.0) {
            return Err(EngineError::InvalidConstraint(format!(
                "cpu fraction must be in (0, 1], got {}",
                self.cpu_fraction
            )));
        }
        if self.memory_bytes == 0 {
            return Err(EngineError::InvalidConstraint(
                "memory ceiling must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// CPU budget for one accounting window (ms)
    pub fn cpu_window_budget_ms(&self, window_ms: u64) -> u64 {
        ((self.cpu_fraction * window_ms as f64) as u64).max(1)
    }
}

/// Read-only copy of a ledger's current totals
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LedgerView {
    pub cpu_window_spent_ms: u64,
    pub cpu_ceiling_ms: u64,
    pub memory_reserved_bytes: u64,
    pub memory_ceiling_bytes: u64,
    pub cpu_total_ms: u64,
    pub invocations: u64,
    pub over_budget: bool,
}

/// Atomic counter set for one agent (or for the whole system)
pub struct Ledger {
    ceiling_cpu_ms: AtomicU64,
    ceiling_mem_bytes: AtomicU64,

    window_len_ms: u64,
    window_start_ms: AtomicU64,
    cpu_window_spent_ms: AtomicU64,

    /// Sub-budget reservations + in-flight invocation reservations
    mem_reserved_bytes: AtomicU64,

    /// Portion of the ceiling committed to plugin sub-budgets
    plugin_cpu_ms: AtomicU64,
    plugin_mem_bytes: AtomicU64,

    cpu_total_ms: AtomicU64,
    invocations: AtomicU64,
    over_budget: AtomicBool,
}

/// Add `add` to `counter` only if the result stays within `limit`
fn try_add_bounded(counter: &AtomicU64, add: u64, limit: u64) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
            let next = cur.saturating_add(add);
            (next <= limit).then_some(next)
        })
        .is_ok()
}

fn sub_saturating(counter: &AtomicU64, sub: u64) {
    let _ = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
        Some(cur.saturating_sub(sub))
    });
}

impl Ledger {
    pub fn new(cpu_ceiling_ms: u64, mem_ceiling_bytes: u64, window_len_ms: u64, now_ms: u64) -> Self {
        Self {
            ceiling_cpu_ms: AtomicU64::new(cpu_ceiling_ms),
            ceiling_mem_bytes: AtomicU64::new(mem_ceiling_bytes),
            window_len_ms,
            window_start_ms: AtomicU64::new(now_ms),
            cpu_window_spent_ms: AtomicU64::new(0),
            mem_reserved_bytes: AtomicU64::new(0),
            plugin_cpu_ms: AtomicU64::new(0),
            plugin_mem_bytes: AtomicU64::new(0),
            cpu_total_ms: AtomicU64::new(0),
            invocations: AtomicU64::new(0),
            over_budget: AtomicBool::new(false),
        }
    }

    /// Reset window spend once the window has elapsed
    ///
    /// The winner of the start-swap clears spend; reservations made while the
    /// roll is in flight may be forgotten, which errs on the admissive side
    /// for at most one window.
    pub fn roll_window(&self, now_ms: u64) {
        let start = self.window_start_ms.load(Ordering::SeqCst);
        if now_ms.saturating_sub(start) >= self.window_len_ms
            && self
                .window_start_ms
                .compare_exchange(start, now_ms, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            self.cpu_window_spent_ms.store(0, Ordering::SeqCst);
        }
    }

    /// Reserve estimated cost; false leaves the ledger untouched
    pub fn try_reserve(&self, est_cpu_ms: u64, est_mem_bytes: u64) -> bool {
        let cpu_limit = self.ceiling_cpu_ms.load(Ordering::SeqCst);
        if !try_add_bounded(&self.cpu_window_spent_ms, est_cpu_ms, cpu_limit) {
            return false;
        }
        let mem_limit = self.ceiling_mem_bytes.load(Ordering::SeqCst);
        if !try_add_bounded(&self.mem_reserved_bytes, est_mem_bytes, mem_limit) {
            sub_saturating(&self.cpu_window_spent_ms, est_cpu_ms);
            return false;
        }
        true
    }

    /// Undo a reservation (peer ledger refused)
    pub fn unreserve(&self, est_cpu_ms: u64, est_mem_bytes: u64) {
        sub_saturating(&self.cpu_window_spent_ms, est_cpu_ms);
        sub_saturating(&self.mem_reserved_bytes, est_mem_bytes);
    }

    /// Settle an invocation: replace the CPU estimate with actuals, return the
    /// transient memory reservation, flag overshoot for the pressure check
    pub fn settle(&self, actual_cpu_ms: u64, actual_mem_bytes: u64, est_cpu_ms: u64, est_mem_bytes: u64) {
        self.cpu_window_spent_ms.fetch_add(actual_cpu_ms, Ordering::SeqCst);
        sub_saturating(&self.cpu_window_spent_ms, est_cpu_ms);
        sub_saturating(&self.mem_reserved_bytes, est_mem_bytes);

        self.cpu_total_ms.fetch_add(actual_cpu_ms, Ordering::SeqCst);
        self.invocations.fetch_add(1, Ordering::SeqCst);

        if actual_cpu_ms > est_cpu_ms || actual_mem_bytes > est_mem_bytes {
            self.over_budget.store(true, Ordering::SeqCst);
        }
    }

    /// Commit a plugin sub-budget against the ceiling
    pub fn reserve_plugin(&self, cpu_ms: u64, mem_bytes: u64) -> bool {
        let cpu_limit = self.ceiling_cpu_ms.load(Ordering::SeqCst);
        if !try_add_bounded(&self.plugin_cpu_ms, cpu_ms, cpu_limit) {
            return false;
        }
        let mem_limit = self.ceiling_mem_bytes.load(Ordering::SeqCst);
        if !try_add_bounded(&self.mem_reserved_bytes, mem_bytes, mem_limit) {
            sub_saturating(&self.plugin_cpu_ms, cpu_ms);
            return false;
        }
        self.plugin_mem_bytes.fetch_add(mem_bytes, Ordering::SeqCst);
        true
    }

    pub fn release_plugin(&self, cpu_ms: u64, mem_bytes: u64) {
        sub_saturating(&self.plugin_cpu_ms, cpu_ms);
        sub_saturating(&self.plugin_mem_bytes, mem_bytes);
        sub_saturating(&self.mem_reserved_bytes, mem_bytes);
    }

    pub fn set_ceiling(&self, cpu_ceiling_ms: u64, mem_ceiling_bytes: u64) {
        self.ceiling_cpu_ms.store(cpu_ceiling_ms, Ordering::SeqCst);
        self.ceiling_mem_bytes.store(mem_ceiling_bytes, Ordering::SeqCst);
    }

    pub fn spend_pct(&self) -> u64 {
        let ceiling = self.ceiling_cpu_ms.load(Ordering::SeqCst).max(1);
        self.cpu_window_spent_ms.load(Ordering::SeqCst) * 100 / ceiling
    }

    pub fn over_budget(&self) -> bool {
        self.over_budget.load(Ordering::SeqCst)
    }

    pub fn clear_over_budget(&self) {
        self.over_budget.store(false, Ordering::SeqCst);
    }

    pub fn memory_reserved(&self) -> u64 {
        self.mem_reserved_bytes.load(Ordering::SeqCst)
    }

    pub fn plugin_shares(&self) -> (u64, u64) {
        (
            self.plugin_cpu_ms.load(Ordering::SeqCst),
            self.plugin_mem_bytes.load(Ordering::SeqCst),
        )
    }

    pub fn view(&self) -> LedgerView {
        LedgerView {
            cpu_window_spent_ms: self.cpu_window_spent_ms.load(Ordering::SeqCst),
            cpu_ceiling_ms: self.ceiling_cpu_ms.load(Ordering::SeqCst),
            memory_reserved_bytes: self.mem_reserved_bytes.load(Ordering::SeqCst),
            memory_ceiling_bytes: self.ceiling_mem_bytes.load(Ordering::SeqCst),
            cpu_total_ms: self.cpu_total_ms.load(Ordering::SeqCst),
            invocations: self.invocations.load(Ordering::SeqCst),
            over_budget: self.over_budget.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_constraints_validation() {
        let valid = Constraints {
            cpu_fraction: 0.5,
            memory_bytes: 64 * 1024 * 1024,
        };
        assert!(valid.validate().is_ok());

        let zero_cpu = Constraints {
            cpu_fraction: 0.0,
            ..valid
        };
        assert!(zero_cpu.validate().is_err());

        let over_cpu = Constraints {
            cpu_fraction: 1.5,
            ..valid
        };
        assert!(over_cpu.validate().is_err());

        let zero_mem = Constraints {
            memory_bytes: 0,
            ..valid
        };
        assert!(zero_mem.validate().is_err());
    }

    #[test]
    fn test_window_budget() {
        let constraints = Constraints {
            cpu_fraction: 0.1,
            memory_bytes: 1,
        };
        assert_eq!(constraints.cpu_window_budget_ms(1_000), 100);
    }

    #[test]
    fn test_reserve_and_settle() {
        let ledger = Ledger::new(100, 1_000, 1_000, 0);
        assert!(ledger.try_reserve(50, 400));
        assert_eq!(ledger.view().cpu_window_spent_ms, 50);
        assert_eq!(ledger.view().memory_reserved_bytes, 400);

        // Settling replaces the estimate with actuals and frees the memory
        ledger.settle(30, 200, 50, 400);
        let view = ledger.view();
        assert_eq!(view.cpu_window_spent_ms, 30);
        assert_eq!(view.memory_reserved_bytes, 0);
        assert_eq!(view.cpu_total_ms, 30);
        assert_eq!(view.invocations, 1);
        assert!(!view.over_budget);
    }

    #[test]
    fn test_failed_reserve_is_side_effect_free() {
        let ledger = Ledger::new(100, 1_000, 1_000, 0);
        assert!(!ledger.try_reserve(200, 0));
        assert!(!ledger.try_reserve(50, 2_000));
        let view = ledger.view();
        assert_eq!(view.cpu_window_spent_ms, 0);
        assert_eq!(view.memory_reserved_bytes, 0);
    }

    #[test]
    fn test_overshoot_flags() {
        let ledger = Ledger::new(100, 1_000, 1_000, 0);
        assert!(ledger.try_reserve(10, 0));
        ledger.settle(40, 0, 10, 0);
        assert!(ledger.over_budget());
        ledger.clear_over_budget();
        assert!(!ledger.over_budget());
    }

    #[test]
    fn test_window_roll_resets_spend() {
        let ledger = Ledger::new(100, 1_000, 1_000, 0);
        assert!(ledger.try_reserve(100, 0));
        assert!(!ledger.try_reserve(1, 0));

        ledger.roll_window(500);
        assert!(!ledger.try_reserve(1, 0), "window not yet elapsed");

        ledger.roll_window(1_000);
        assert!(ledger.try_reserve(1, 0), "fresh window admits again");
    }

    #[test]
    fn test_concurrent_reserves_never_overshoot() {
        let ledger = Arc::new(Ledger::new(100, 1_000_000, 1_000, 0));
        let mut handles = vec![];
        for _ in 0..32 {
            let ledger = Arc::clone(&ledger);
            handles.push(std::thread::spawn(move || ledger.try_reserve(10, 0)));
        }

        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(successes, 10);
        assert_eq!(ledger.view().cpu_window_spent_ms, 100);
    }

    #[test]
    fn test_plugin_reservations() {
        let ledger = Ledger::new(100, 1_000, 1_000, 0);
        assert!(ledger.reserve_plugin(60, 600));
        assert!(!ledger.reserve_plugin(60, 100), "cpu shares over ceiling");
        assert!(!ledger.reserve_plugin(10, 600), "memory over ceiling");

        ledger.release_plugin(60, 600);
        assert_eq!(ledger.memory_reserved(), 0);
        assert!(ledger.reserve_plugin(100, 1_000));
    }
}
