// src/agreement/mod.rs
//! Quota-bounded leases between agents
//!
//! - **Engine**: agreement lifecycle and lease-accounted delegation to the
//!   agent manager

pub mod engine;

pub use engine::{Agreement, AgreementEngine, AgreementId, AgreementUsage, ResourceQuota};
