//! Registry Store: serializable read-modify-write access to the shared
//! on-disk instance list.
//!
//! The locking protocol is deliberately primitive — filesystem
//! create-exclusive, stat, rename, unlink — so it works identically on
//! every POSIX-like target without assuming `flock`/`fcntl` semantics. The
//! actual data write additionally takes a short-lived `fs2` exclusive lock
//! on the temp file before the rename, the same belt-and-suspenders the
//! teacher's `shared_store.rs` uses around its own atomic writes.

use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::config::{FabricConfig, LOCK_FILE_NAME, REGISTRY_FILE_NAME};
use crate::error::FabricError;
use crate::identity::{now_ms, InstanceRecord};

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    instances: Vec<InstanceRecord>,
}

/// Serializes read-modify-write access to `registry.json` across every
/// cooperating process on the machine.
pub struct RegistryStore {
    registry_path: PathBuf,
    lock_path: PathBuf,
    stale_threshold: Duration,
    lock_stale_timeout: Duration,
    lock_retry_delay: Duration,
    lock_max_retries: u32,
}

impl RegistryStore {
    pub fn new(config: &FabricConfig) -> Result<Self, FabricError> {
        let dir = config.resolve_registry_dir()?;
        Ok(Self {
            registry_path: dir.join(REGISTRY_FILE_NAME),
            lock_path: dir.join(LOCK_FILE_NAME),
            stale_threshold: config.stale_threshold(),
            lock_stale_timeout: config.lock_stale_timeout,
            lock_retry_delay: config.lock_retry_delay,
            lock_max_retries: config.lock_max_retries,
        })
    }

    /// A non-locking read of the registry with stale records filtered out.
    /// May observe slightly stale data relative to an in-flight writer, but
    /// never a torn file — readers only ever see a prior or a complete
    /// atomic rename target.
    pub fn snapshot(&self) -> Result<Vec<InstanceRecord>, FabricError> {
        Ok(self.filter_stale(self.read_raw()))
    }

    /// Acquire the registry mutex, read, filter stale entries, apply `f`,
    /// atomically replace the file, release the mutex. Returns the records
    /// that were written.
    pub fn modify<F>(&self, f: F) -> Result<Vec<InstanceRecord>, FabricError>
    where
        F: FnOnce(Vec<InstanceRecord>) -> Vec<InstanceRecord>,
    {
        self.acquire_lock()?;
        let result = (|| {
            let current = self.filter_stale(self.read_raw());
            let next = f(current);
            self.write_atomic(&next)?;
            Ok(next)
        })();
        self.release_lock();
        result
    }

    fn filter_stale(&self, records: Vec<InstanceRecord>) -> Vec<InstanceRecord> {
        let now = now_ms();
        let threshold_ms = self.stale_threshold.as_millis() as i64;
        records
            .into_iter()
            .filter(|r| now - r.last_heartbeat < threshold_ms)
            .collect()
    }

    /// Corrupt or missing JSON self-heals to an empty registry; the next
    /// `modify` rewrites a valid file.
    fn read_raw(&self) -> Vec<InstanceRecord> {
        let Ok(contents) = fs::read_to_string(&self.registry_path) else {
            return Vec::new();
        };
        serde_json::from_str::<RegistryFile>(&contents)
            .map(|f| f.instances)
            .unwrap_or_default()
    }

    fn write_atomic(&self, records: &[InstanceRecord]) -> Result<(), FabricError> {
        let pid = std::process::id();
        let mut temp_name = self
            .registry_path
            .file_name()
            .expect("registry path must have a file name")
            .to_os_string();
        temp_name.push(format!(".{}.tmp", pid));
        let temp_path = self.registry_path.with_file_name(temp_name);

        let write_result = (|| -> std::io::Result<()> {
            let mut temp_file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)?;

            temp_file.lock_exclusive()?;
            let payload = RegistryFile {
                instances: records.to_vec(),
            };
            let json = serde_json::to_string_pretty(&payload)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            temp_file.write_all(json.as_bytes())?;
            temp_file.sync_all()?;
            let _ = temp_file.unlock();
            Ok(())
        })();

        if let Err(e) = write_result {
            let _ = fs::remove_file(&temp_path);
            return Err(FabricError::RegistryIo(e.to_string()));
        }

        fs::rename(&temp_path, &self.registry_path).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            FabricError::RegistryIo(e.to_string())
        })
    }

    fn acquire_lock(&self) -> Result<(), FabricError> {
        let mut attempts = 0u32;
        loop {
            match create_exclusive(&self.lock_path, std::process::id()) {
                Ok(()) => return Ok(()),
                Err(_) => {
                    if self.steal_if_stale() {
                        continue;
                    }

                    attempts += 1;
                    if attempts >= self.lock_max_retries {
                        return Err(FabricError::LockTimeout { attempts });
                    }
                    std::thread::sleep(self.lock_retry_delay);
                }
            }
        }
    }

    fn release_lock(&self) {
        // Tolerate "already gone": another process may have seized an
        // apparently-stale lock out from under us.
        let _ = fs::remove_file(&self.lock_path);
    }

    /// If the sentinel's mtime is older than the lock stale timeout, delete
    /// it so the next acquisition attempt can succeed. Returns whether a
    /// stale sentinel was removed.
    fn steal_if_stale(&self) -> bool {
        let Ok(metadata) = fs::metadata(&self.lock_path) else {
            // Sentinel vanished between our failed create and this stat;
            // the next loop iteration's create will likely succeed.
            return true;
        };
        let Ok(modified) = metadata.modified() else {
            return false;
        };
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or_default();
        if age > self.lock_stale_timeout {
            let _ = fs::remove_file(&self.lock_path);
            true
        } else {
            false
        }
    }
}

/// Create the lock sentinel with exclusive-create semantics, writing the
/// writer's pid inside for diagnostics only.
fn create_exclusive(path: &Path, pid: u32) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(pid.to_string().as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::InstanceRecord;
    use tempfile::tempdir;

    fn store_in(dir: &Path) -> RegistryStore {
        let mut config = FabricConfig::default();
        config.registry_dir = Some(dir.to_path_buf());
        config.lock_stale_timeout = Duration::from_millis(200);
        config.lock_retry_delay = Duration::from_millis(5);
        config.lock_max_retries = 50;
        RegistryStore::new(&config).expect("store")
    }

    fn record(id: &str, port: u16, last_heartbeat: i64) -> InstanceRecord {
        InstanceRecord {
            id: id.to_string(),
            name: "demo".to_string(),
            workspace_path: "/tmp/demo".to_string(),
            port,
            pid: std::process::id(),
            last_heartbeat,
        }
    }

    #[test]
    fn snapshot_on_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        assert!(store.snapshot().unwrap().is_empty());
    }

    #[test]
    fn modify_inserts_and_snapshot_sees_it() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let now = now_ms();
        store
            .modify(|mut records| {
                records.push(record("a-01", 41970, now));
                records
            })
            .unwrap();

        let snapshot = store.snapshot().unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, "a-01");
    }

    #[test]
    fn stale_records_are_filtered_on_read() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let ancient = now_ms() - Duration::from_secs(3600).as_millis() as i64;
        store
            .modify(|mut records| {
                records.push(record("stale", 41970, ancient));
                records
            })
            .unwrap();

        assert!(store.snapshot().unwrap().is_empty());
    }

    #[test]
    fn register_then_unregister_restores_empty_registry() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let now = now_ms();
        store
            .modify(|mut records| {
                records.push(record("solo", 41970, now));
                records
            })
            .unwrap();
        store
            .modify(|mut records| {
                records.retain(|r| r.id != "solo");
                records
            })
            .unwrap();

        assert!(store.snapshot().unwrap().is_empty());
        assert!(!dir.path().join(LOCK_FILE_NAME).exists());
    }

    #[test]
    fn corrupt_registry_self_heals() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        fs::write(dir.path().join(REGISTRY_FILE_NAME), b"{ not json").unwrap();

        assert!(store.snapshot().unwrap().is_empty());
        store
            .modify(|mut records| {
                records.push(record("fresh", 41970, now_ms()));
                records
            })
            .unwrap();

        let contents = fs::read_to_string(dir.path().join(REGISTRY_FILE_NAME)).unwrap();
        let parsed: RegistryFile = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed.instances.len(), 1);
    }

    #[test]
    fn stale_lock_sentinel_is_stolen() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());

        create_exclusive(&store.lock_path, 999999).unwrap();
        // Back-date the sentinel so it reads as older than the stale timeout.
        let old = SystemTime::now() - Duration::from_secs(10);
        let times = fs::FileTimes::new().set_modified(old);
        let file = OpenOptions::new().write(true).open(&store.lock_path).unwrap();
        file.set_times(times).unwrap();

        store
            .modify(|mut records| {
                records.push(record("after-steal", 41970, now_ms()));
                records
            })
            .expect("stale lock must be stolen, not block forever");
    }

    #[test]
    fn two_heartbeats_with_no_other_writer_change_only_timestamp() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let first = now_ms();
        store
            .modify(|mut records| {
                records.push(record("hb", 41970, first));
                records
            })
            .unwrap();

        let second = first + 1000;
        store
            .modify(|mut records| {
                for r in records.iter_mut() {
                    if r.id == "hb" {
                        r.last_heartbeat = second;
                    }
                }
                records
            })
            .unwrap();

        let snapshot = store.snapshot().unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].last_heartbeat, second);
        assert_eq!(snapshot[0].port, 41970);
    }
}
