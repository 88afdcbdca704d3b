// src/utils/config.rs
//! Engine configuration
//!
//! Layered loading: an optional `warden` config file (TOML/YAML/JSON, any
//! format the `config` crate recognizes) overlaid by `WARDEN__`-prefixed
//! environment variables. Every field has a documented default so a bare
//! `EngineConfig::default()` is a working development setup.

use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Agent runtime tunables
    pub runtime: RuntimeConfig,

    /// Whole-process resource ceilings
    pub system: SystemConfig,

    /// Module signature trust store
    pub trust: TrustConfig,

    /// On-disk storage layout
    pub storage: StorageConfig,

    /// Metrics exporter
    pub metrics: MetricsConfig,
}

/// Agent runtime tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// CPU fraction applied when a spawn request omits `cpu` (system-wide minimum)
    pub default_cpu_fraction: f64,

    /// Memory ceiling applied when a spawn request omits `memory` (system-wide minimum)
    pub default_memory_bytes: u64,

    /// Wall-clock deadline for a single sandboxed invocation (ms)
    pub execute_timeout_ms: u64,

    /// Deadline for attach/detach to win the agent's exclusive section (ms)
    pub attach_timeout_ms: u64,

    /// Deadline for snapshot capture and recovery (ms)
    pub snapshot_timeout_ms: u64,

    /// Deadline for any other wait on the agent's exclusive section (ms)
    pub lock_wait_ms: u64,

    /// Rolling CPU accounting window (ms)
    pub cpu_window_ms: u64,

    /// Window spend (percent of ceiling) at which a flagged agent suspends
    pub suspend_watermark_pct: u64,

    /// Window spend (percent of ceiling) at which a suspended agent resumes
    pub resume_watermark_pct: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_cpu_fraction: 0.05,
            default_memory_bytes: 64 * 1024 * 1024, // 64MB
            execute_timeout_ms: 30_000,
            attach_timeout_ms: 5_000,
            snapshot_timeout_ms: 10_000,
            lock_wait_ms: 5_000,
            cpu_window_ms: 1_000,
            suspend_watermark_pct: 100,
            resume_watermark_pct: 60,
        }
    }
}

/// Whole-process resource ceilings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Total CPU budget across all agents, in cores (4.0 = four full cores)
    pub cpu_cores: f64,

    /// Total memory budget across all agents
    pub memory_bytes: u64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            cpu_cores: 4.0,
            memory_bytes: 2 * 1024 * 1024 * 1024, // 2GB
        }
    }
}

/// Module signature trust store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    /// Hex-encoded ed25519 verifying keys accepted for module signatures
    pub keys: Vec<String>,
}

/// On-disk storage layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Base directory for snapshots and audit data
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("~/.warden/data"),
        }
    }
}

/// Metrics exporter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Prometheus scrape listener address
    pub listen: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:9600".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from file + environment
    pub fn load() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("warden").required(false))
            .add_source(config::Environment::with_prefix("WARDEN").separator("__"))
            .build()
            .map_err(|e| EngineError::ConfigFailed(format!("Failed to build config: {}", e)))?;

        settings
            .try_deserialize()
            .map_err(|e| EngineError::ConfigFailed(format!("Failed to parse config: {}", e)))
    }
}
