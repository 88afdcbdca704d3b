// src/runtime/mod.rs
//! Agent lifecycle and execution
//!
//! This module is the heart of the engine:
//!
//! - **Agent**: identity, constraints, state machine, per-agent locking
//! - **Manager**: spawn, attach, execute, snapshot, recover, terminate
//! - **Policy**: injected pre-dispatch veto hook
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                    AgentManager                      │
//! │  ┌─────────┐   ┌─────────┐   ┌─────────┐             │
//! │  │ Agent A │   │ Agent B │   │ Agent C │  ...        │
//! │  │ gate+rw │   │ gate+rw │   │ gate+rw │             │
//! │  └────┬────┘   └────┬────┘   └────┬────┘             │
//! │       │             │             │                  │
//! │  ResourceMonitor  PluginSandbox  SnapshotStore       │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! Coordination is strictly per-agent; no cross-agent shared mutable data
//! exists, so contention is bounded to callers of the same agent.

pub mod agent;
pub mod manager;
pub mod policy;

// Re-export commonly used types
pub use agent::{AgentId, AgentStatus, SpawnOptions};
pub use manager::{AgentDescriptor, AgentManager};
pub use policy::{AllowAll, ExecutionPolicy, PatternPolicy};
