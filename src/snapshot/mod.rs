// src/snapshot/mod.rs
//! Atomic state capture and restoration
//!
//! - **Record**: versioned, self-contained snapshot layout
//! - **Store**: SQLite metadata + zstd-compressed record files
//!
//! Capture is copy-on-capture: the manager hands the store a deep copy taken
//! inside the agent's exclusive section, so a record always corresponds to a
//! state that was valid and consistent at capture time.

pub mod record;
pub mod store;

pub use record::{PluginRecord, SnapshotContents, SnapshotId, SnapshotRecord, SCHEMA_VERSION};
pub use store::{SnapshotMeta, SnapshotStore, SnapshotStoreConfig};
