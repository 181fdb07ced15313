//! Tunables for every component in the fabric.
//!
//! Mirrors the teacher's `shared_store.rs` constants block: named,
//! documented thresholds rather than inline magic numbers, with a
//! `Default` impl a host can start from and override piecemeal.

use std::path::PathBuf;
use std::time::Duration;

/// Default base of the reserved loopback port range.
///
/// Matches the port used throughout the spec's own worked examples.
pub const DEFAULT_PORT_RANGE_BASE: u16 = 41970;

/// Default width of the reserved loopback port range.
pub const DEFAULT_PORT_RANGE_SIZE: u16 = 100;

/// Default heartbeat period.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// The stale threshold is fixed at this multiple of the heartbeat interval.
///
/// The spec requires at least 2x to tolerate one missed beat; 3x additionally
/// absorbs scheduling jitter on a loaded machine without meaningfully
/// delaying eviction of a genuinely dead instance. See DESIGN.md for the
/// Open Question this resolves.
pub const STALE_THRESHOLD_MULTIPLIER: u32 = 3;

/// Default age past which an uncontested lock sentinel is forcibly taken.
pub const DEFAULT_LOCK_STALE_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay between registry-lock acquisition attempts.
pub const DEFAULT_LOCK_RETRY_DELAY: Duration = Duration::from_millis(20);

/// Bound on registry-lock acquisition attempts before giving up with
/// `LockTimeout`. At the default retry delay (20ms * 400 = 8s) this is
/// comfortably longer than the default lock stale timeout (5s), so a
/// genuinely abandoned lock gets stolen well before the bound is hit.
pub const DEFAULT_LOCK_MAX_RETRIES: u32 = 400;

/// Default cap on an incoming `/instance/{id}/send` body, in bytes.
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

/// Directory name under the user's home that holds the registry file and
/// lock sentinel.
pub const REGISTRY_DIR_NAME: &str = ".bridgefabric";

/// Registry file name.
pub const REGISTRY_FILE_NAME: &str = "registry.json";

/// Lock sentinel file name.
pub const LOCK_FILE_NAME: &str = "registry.lock";

/// Origin schemes permitted to reach the HTTP surface, beyond an absent or
/// `null` Origin header.
pub fn default_allowed_origin_schemes() -> Vec<String> {
    vec![
        "chrome-extension://".to_string(),
        "moz-extension://".to_string(),
    ]
}

/// Configuration for one fabric instance.
#[derive(Debug, Clone)]
pub struct FabricConfig {
    /// Overrides the registry directory; `None` resolves to
    /// `~/.bridgefabric`. Tests set this to a temp directory.
    pub registry_dir: Option<PathBuf>,
    pub port_range_base: u16,
    pub port_range_size: u16,
    pub heartbeat_interval: Duration,
    pub stale_threshold_multiplier: u32,
    pub lock_stale_timeout: Duration,
    pub lock_retry_delay: Duration,
    pub lock_max_retries: u32,
    pub max_body_bytes: usize,
    pub allowed_origin_schemes: Vec<String>,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            registry_dir: None,
            port_range_base: DEFAULT_PORT_RANGE_BASE,
            port_range_size: DEFAULT_PORT_RANGE_SIZE,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            stale_threshold_multiplier: STALE_THRESHOLD_MULTIPLIER,
            lock_stale_timeout: DEFAULT_LOCK_STALE_TIMEOUT,
            lock_retry_delay: DEFAULT_LOCK_RETRY_DELAY,
            lock_max_retries: DEFAULT_LOCK_MAX_RETRIES,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            allowed_origin_schemes: default_allowed_origin_schemes(),
        }
    }
}

impl FabricConfig {
    /// The stale threshold derived from the heartbeat interval; always at
    /// least twice the interval per the spec's invariant, regardless of
    /// what `stale_threshold_multiplier` is set to.
    pub fn stale_threshold(&self) -> Duration {
        let multiplier = self.stale_threshold_multiplier.max(2);
        self.heartbeat_interval * multiplier
    }

    /// Resolve the directory that holds the registry file and lock
    /// sentinel, creating it (owner-only on Unix) if it does not exist.
    pub fn resolve_registry_dir(&self) -> Result<PathBuf, crate::error::FabricError> {
        let dir = match &self.registry_dir {
            Some(dir) => dir.clone(),
            None => dirs::home_dir()
                .ok_or_else(|| {
                    crate::error::FabricError::RegistryIo(
                        "could not determine the user's home directory".to_string(),
                    )
                })?
                .join(REGISTRY_DIR_NAME),
        };

        if !dir.exists() {
            std::fs::create_dir_all(&dir)
                .map_err(|e| crate::error::FabricError::RegistryIo(e.to_string()))?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let perms = std::fs::Permissions::from_mode(0o700);
                std::fs::set_permissions(&dir, perms)
                    .map_err(|e| crate::error::FabricError::RegistryIo(e.to_string()))?;
            }
        }

        Ok(dir)
    }
}
