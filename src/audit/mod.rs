// src/audit/mod.rs
//! Audit trail for lifecycle and execution events
//!
//! - **Trail**: bounded lock-free buffer fed by the hot path
//! - **Store**: SQLite persistence, written by a background drain task
//!
//! ```text
//! manager op ──► trail.record() ──► ArrayQueue ──► drain_loop ──► SQLite
//! ```

pub mod store;
pub mod trail;

pub use store::{AuditRow, AuditStore, AuditStoreConfig};
pub use trail::{AuditEvent, AuditKind, AuditTrail, TrailStats};

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Batch size per drain pass
const DRAIN_BATCH: usize = 512;

/// Periodically persist buffered events until cancelled, then flush
pub async fn drain_loop(
    trail: Arc<AuditTrail>,
    store: Arc<AuditStore>,
    period: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            _ = cancel.cancelled() => break,
        }
        persist(&trail, &store).await;
    }
    // Final flush on shutdown
    persist(&trail, &store).await;
}

async fn persist(trail: &AuditTrail, store: &AuditStore) {
    loop {
        let events = trail.try_drain(DRAIN_BATCH);
        if events.is_empty() {
            break;
        }
        if let Err(e) = store.write_batch(&events).await {
            warn!("Audit persistence failed, {} events lost: {}", events.len(), e);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_drain_loop_flushes_on_cancel() {
        let dir = tempdir().unwrap();
        let trail = Arc::new(AuditTrail::new(64));
        let store = Arc::new(
            AuditStore::new(AuditStoreConfig {
                base_dir: dir.path().to_path_buf(),
                ..Default::default()
            })
            .await
            .unwrap(),
        );

        trail.record(AuditEvent::now(AuditKind::AgentSpawned, None, "spawn"));
        trail.record(AuditEvent::now(AuditKind::SnapshotTaken, None, "snap"));

        let cancel = CancellationToken::new();
        let task = tokio::spawn(drain_loop(
            trail.clone(),
            store.clone(),
            Duration::from_secs(60),
            cancel.clone(),
        ));

        cancel.cancel();
        task.await.unwrap();

        assert_eq!(store.count().await.unwrap(), 2);
    }
}
