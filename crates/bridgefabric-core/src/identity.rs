//! Instance identity and the registry's on-the-wire record shape.

use once_cell::sync::OnceCell;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// One entry in the shared registry, exactly as persisted to disk and
/// returned from `/instances`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: String,
    pub name: String,
    #[serde(rename = "workspacePath")]
    pub workspace_path: String,
    pub port: u16,
    pub pid: u32,
    #[serde(rename = "lastHeartbeat")]
    pub last_heartbeat: i64,
}

/// Current wall-clock time in milliseconds since the epoch.
///
/// Not truly monotonic, but "monotonic-enough" per the spec: heartbeats are
/// compared against thresholds measured in seconds, well above any clock
/// adjustment a developer machine is likely to see mid-session.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Build a process-unique instance id: `{pid}-{8 random hex bits}`.
///
/// Two hex digits cover 8 bits of randomness, enough to disambiguate a pid
/// reused after the registry's retention window has already evicted the
/// previous owner's record.
fn generate_instance_id(pid: u32) -> String {
    let suffix: u8 = rand::thread_rng().gen();
    format!("{:x}-{:02x}", pid, suffix)
}

/// The stable identity of one running process. Everything but `port` is
/// fixed at construction; `port` is late-bound once the Port Binder
/// succeeds, and is immutable thereafter — the owning process is the only
/// writer, matching the invariant in §3.
#[derive(Debug)]
pub struct InstanceIdentity {
    pub id: String,
    pub name: String,
    pub workspace_path: String,
    pub pid: u32,
    port: OnceCell<u16>,
}

impl InstanceIdentity {
    /// Build a new identity for the current process. `workspace_path` may
    /// be a synthetic placeholder for untitled workspaces.
    pub fn new(name: impl Into<String>, workspace_path: impl Into<String>) -> Self {
        let pid = std::process::id();
        Self {
            id: generate_instance_id(pid),
            name: name.into(),
            workspace_path: workspace_path.into(),
            pid,
            port: OnceCell::new(),
        }
    }

    /// Late-bind the port this instance's HTTP Surface is listening on.
    ///
    /// Returns an error if called more than once — the Port Binder only
    /// ever runs once per process.
    pub fn bind_port(&self, port: u16) -> Result<(), u16> {
        self.port.set(port).map_err(|_existing| *self.port.get().unwrap())
    }

    /// The bound port, if the Port Binder has run.
    pub fn port(&self) -> Option<u16> {
        self.port.get().copied()
    }

    /// Render this identity as a registry record at the given heartbeat
    /// timestamp. Panics if the port has not yet been bound — by design,
    /// nothing should construct a record before binding (see Lifecycle
    /// §4.G: port bind precedes registration).
    pub fn to_record(&self, last_heartbeat: i64) -> InstanceRecord {
        InstanceRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            workspace_path: self.workspace_path.clone(),
            port: self.port().expect("port must be bound before registering"),
            pid: self.pid,
            last_heartbeat,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_process_unique_and_have_a_hex_suffix() {
        let a = InstanceIdentity::new("a", "/tmp/a");
        let b = InstanceIdentity::new("b", "/tmp/b");
        assert_ne!(a.id, b.id, "two identities in the same process must differ");
        assert!(a.id.contains('-'));
    }

    #[test]
    fn port_binds_exactly_once() {
        let identity = InstanceIdentity::new("proj", "/tmp/proj");
        assert!(identity.port().is_none());
        identity.bind_port(41970).expect("first bind succeeds");
        assert_eq!(identity.port(), Some(41970));
        let err = identity.bind_port(41971).expect_err("second bind must fail");
        assert_eq!(err, 41970);
    }

    #[test]
    fn record_reflects_bound_port() {
        let identity = InstanceIdentity::new("proj", "/tmp/proj");
        identity.bind_port(41970).unwrap();
        let record = identity.to_record(now_ms());
        assert_eq!(record.port, 41970);
        assert_eq!(record.id, identity.id);
    }
}
