// src/lib.rs
//! Warden Engine Library
//!
//! This library provides the core components for hosting lightweight agents
//! with sandboxed capability modules under hard resource ceilings.
//!
//! # Architecture
//!
//! The engine is structured into several key modules:
//!
//! - **runtime**: agent lifecycle, execution, per-agent locking, policy hook
//! - **resources**: admission checks, ledgers, suspension pressure
//! - **sandbox**: signed module loading and isolated operation execution
//! - **snapshot**: atomic state capture and restoration
//! - **agreement**: quota-bounded leases between agents
//! - **audit**: lifecycle/execution event trail
//! - **observability**: tracing and metrics initialization
//! - **utils**: configuration and error taxonomy

// Public module exports
pub mod agreement;
pub mod audit;
pub mod observability;
pub mod resources;
pub mod runtime;
pub mod sandbox;
pub mod snapshot;
pub mod utils;

// Re-export commonly used types
pub use agreement::{AgreementEngine, AgreementId, ResourceQuota};
pub use resources::{Constraints, ResourceMonitor};
pub use runtime::{AgentId, AgentManager, AgentStatus, SpawnOptions};
pub use sandbox::{ModuleManifest, ModuleRef, PluginSandbox};
pub use snapshot::{SnapshotId, SnapshotStore};
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");

/// Engine build information
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_timestamp: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: VERSION,
            git_hash: GIT_HASH,
            build_timestamp: env!("BUILD_TIMESTAMP"),
            rustc_version: env!("RUSTC_VERSION"),
        }
    }
}
