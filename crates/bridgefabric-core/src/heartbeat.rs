//! Heartbeat Loop: periodically refreshes this instance's registry record.
//!
//! A single cancellable `tokio` task, in the teacher's own idiom for
//! `instance_manager.rs`'s heartbeat task — an `interval` tick loop guarded
//! by a shutdown flag, with every I/O failure logged and swallowed rather
//! than propagated, since a heartbeat miss is never fatal to the owning
//! process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::identity::{now_ms, InstanceIdentity};
use crate::registry::RegistryStore;

/// Handle to a running heartbeat task. Dropping it does not stop the task;
/// call `cancel` and `join` explicitly during shutdown.
pub struct HeartbeatHandle {
    shutdown: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    pub fn cancel(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// Start the heartbeat loop for `identity` against `registry`, ticking
/// every `interval`.
pub fn spawn(
    identity: Arc<InstanceIdentity>,
    registry: Arc<RegistryStore>,
    interval: Duration,
) -> HeartbeatHandle {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_for_task = Arc::clone(&shutdown);

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; skip it so registration (which
        // already wrote the initial heartbeat) isn't duplicated back to back.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if shutdown_for_task.load(Ordering::Relaxed) {
                break;
            }

            // Use spawn_blocking to avoid blocking the async runtime: `tick`
            // does blocking filesystem I/O and may sleep between lock
            // acquisition retries.
            let identity = Arc::clone(&identity);
            let registry = Arc::clone(&registry);
            let result = tokio::task::spawn_blocking(move || tick(&identity, &registry)).await;

            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    log::warn!("[heartbeat] tick failed, will retry next interval: {e}");
                }
                Err(e) => {
                    log::warn!("[heartbeat] tick task panicked, will retry next interval: {e}");
                }
            }
        }
    });

    HeartbeatHandle { shutdown, task }
}

/// Synchronous heartbeat update; only ever called from inside `spawn_blocking`.
fn tick(identity: &InstanceIdentity, registry: &RegistryStore) -> Result<(), crate::error::FabricError> {
    let id = identity.id.clone();
    let refreshed = identity.to_record(now_ms());

    registry.modify(move |mut records| {
        match records.iter_mut().find(|r| r.id == id) {
            Some(existing) => {
                existing.last_heartbeat = refreshed.last_heartbeat;
                existing.port = refreshed.port;
            }
            None => {
                // Purged by another process while we were stalled; rejoin.
                records.push(refreshed.clone());
            }
        }
        records
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FabricConfig;
    use std::time::Duration as StdDuration;
    use tempfile::tempdir;

    #[tokio::test]
    async fn heartbeat_refreshes_timestamp_and_reinserts_if_purged() {
        let dir = tempdir().unwrap();
        let mut config = FabricConfig::default();
        config.registry_dir = Some(dir.path().to_path_buf());
        let registry = Arc::new(RegistryStore::new(&config).unwrap());
        let identity = Arc::new(InstanceIdentity::new("proj", "/tmp/proj"));
        identity.bind_port(41970).unwrap();

        tick(&identity, &registry).unwrap();
        let first = registry.snapshot().unwrap();
        assert_eq!(first.len(), 1);
        let first_beat = first[0].last_heartbeat;

        // Simulate another process purging us as apparently stale.
        registry.modify(|_| Vec::new()).unwrap();

        tokio::time::sleep(StdDuration::from_millis(5)).await;
        tick(&identity, &registry).unwrap();
        let second = registry.snapshot().unwrap();
        assert_eq!(second.len(), 1, "heartbeat must reinsert a purged record");
        assert!(second[0].last_heartbeat >= first_beat);
    }

    #[tokio::test]
    async fn spawn_can_be_cancelled() {
        let dir = tempdir().unwrap();
        let mut config = FabricConfig::default();
        config.registry_dir = Some(dir.path().to_path_buf());
        config.heartbeat_interval = StdDuration::from_millis(10);
        let registry = Arc::new(RegistryStore::new(&config).unwrap());
        let identity = Arc::new(InstanceIdentity::new("proj", "/tmp/proj"));
        identity.bind_port(41970).unwrap();

        let handle = spawn(Arc::clone(&identity), Arc::clone(&registry), config.heartbeat_interval);
        tokio::time::sleep(StdDuration::from_millis(35)).await;
        handle.cancel();
        handle.join().await;
    }
}
