// src/resources/mod.rs
//! Resource accounting and enforcement
//!
//! - **Ledger**: atomic per-agent running totals against a static ceiling
//! - **Monitor**: admission pre-checks, post-execution reconciliation,
//!   suspension pressure signals
//!
//! # Model
//!
//! ```text
//! execute() ──► admit(estimate) ──► sandbox runs ──► commit(actual)
//!                  │  reserve                          │  settle
//!                  ▼                                   ▼
//!          per-agent ledger ◄──────────────────► system ledger
//! ```
//!
//! Admission reserves the declared estimate with compare-and-swap, so two
//! concurrent calls can never jointly pass a check that their combined cost
//! would fail. Overshoot discovered at commit flags the agent for soft
//! suspension instead of failing work that already ran.

pub mod ledger;
pub mod monitor;

pub use ledger::{Constraints, Ledger, LedgerView};
pub use monitor::{MonitorConfig, ResourceMonitor};
