//! Lifecycle: wires Identity, Port Binder, HTTP Surface, Registry Store and
//! Heartbeat Loop together into one orchestrated instance, per §4.G.

use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;

use crate::config::FabricConfig;
use crate::error::FabricError;
use crate::heartbeat::{self, HeartbeatHandle};
use crate::http::{router, DeliveryTarget, FabricState, SurfaceState};
use crate::identity::{now_ms, InstanceIdentity};
use crate::port_binder;
use crate::registry::RegistryStore;

/// One running instance of the dispatch fabric: a bound HTTP listener, its
/// registry membership, and its heartbeat task. Dropping this without
/// calling `shutdown` leaves the registry entry to expire on its own via
/// the stale threshold — safe, but untidy; callers should prefer an
/// orderly shutdown.
pub struct Fabric {
    pub identity: Arc<InstanceIdentity>,
    state: Arc<FabricState>,
    registry: Arc<RegistryStore>,
    heartbeat: Option<HeartbeatHandle>,
    server_task: Option<JoinHandle<()>>,
    heartbeat_interval: std::time::Duration,
}

/// The embedding surface's `status()` shape (§6): what a host checks to
/// render its own "fabric running" indicator.
#[derive(Debug, Clone)]
pub struct Status {
    pub listening: bool,
    pub port: u16,
    pub pid: u32,
    pub instance_id: String,
    pub uptime: std::time::Duration,
}

impl Fabric {
    /// Run the full startup sequence: bind a port, start serving, register,
    /// start the heartbeat. Returns once the HTTP Surface is accepting
    /// connections and the instance is visible in the registry.
    ///
    /// `preferred_port` is the embedding surface's `start(preferredPort)`
    /// argument (§6); pass `None` to start directly from the configured
    /// range base.
    pub async fn start(
        name: impl Into<String>,
        workspace_path: impl Into<String>,
        config: FabricConfig,
        delivery: Arc<dyn DeliveryTarget>,
        preferred_port: Option<u16>,
    ) -> Result<Self, FabricError> {
        let identity = Arc::new(InstanceIdentity::new(name, workspace_path));
        let registry = Arc::new(RegistryStore::new(&config)?);

        let (listener, port) = port_binder::bind(&config, preferred_port).await?;
        identity
            .bind_port(port)
            .map_err(|existing| FabricError::RegistryIo(format!(
                "port already bound to {existing}, cannot bind {port}"
            )))?;

        let state = Arc::new(FabricState {
            identity: Arc::clone(&identity),
            registry: Arc::clone(&registry),
            config: Arc::new(config.clone()),
            delivery,
            started_at: Instant::now(),
            paused: std::sync::atomic::AtomicBool::new(false),
            surface_state: std::sync::RwLock::new(SurfaceState::Starting),
        });

        let app = router(Arc::clone(&state));
        state.set_surface_state(SurfaceState::Listening);
        let server_task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                log::error!("[lifecycle] HTTP surface terminated unexpectedly: {e}");
            }
        });

        // Use spawn_blocking to avoid blocking the async runtime: registry
        // writes do blocking filesystem I/O and may sleep on lock contention.
        let registry_for_register = Arc::clone(&registry);
        let record = identity.to_record(now_ms());
        tokio::task::spawn_blocking(move || {
            registry_for_register.modify(move |mut records| {
                records.retain(|r| r.id != record.id);
                records.push(record.clone());
                records
            })
        })
        .await
        .map_err(|e| FabricError::RegistryIo(format!("registration task panicked: {e}")))??;

        let heartbeat = heartbeat::spawn(
            Arc::clone(&identity),
            Arc::clone(&registry),
            config.heartbeat_interval,
        );

        log::info!(
            "[lifecycle] instance {} listening on 127.0.0.1:{port}",
            identity.id
        );

        Ok(Self {
            identity,
            state,
            registry,
            heartbeat: Some(heartbeat),
            server_task: Some(server_task),
            heartbeat_interval: config.heartbeat_interval,
        })
    }

    /// Suspend only the downstream delivery target; the fabric stays
    /// discoverable and `send` requests return 503 while paused.
    pub fn pause(&self) {
        self.state.pause();
    }

    pub fn resume(&self) {
        self.state.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.state.is_paused()
    }

    pub fn surface_state(&self) -> SurfaceState {
        self.state.surface_state()
    }

    /// The embedding surface's `status()` control point (§6).
    pub fn status(&self) -> Status {
        Status {
            listening: self.surface_state() == SurfaceState::Listening,
            port: self.identity.port().unwrap_or_default(),
            pid: self.identity.pid,
            instance_id: self.identity.id.clone(),
            uptime: self.state.started_at.elapsed(),
        }
    }

    /// Orderly shutdown: cancel the heartbeat, remove this instance's
    /// registry record (logging, not propagating, a failure there — the
    /// stale threshold is the ultimate safety net), then drain the HTTP
    /// surface.
    pub async fn shutdown(mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.cancel();
            heartbeat.join().await;
        }

        // Use spawn_blocking to avoid blocking the async runtime, as above.
        let registry_for_unregister = Arc::clone(&self.registry);
        let id = self.identity.id.clone();
        let result = tokio::task::spawn_blocking(move || {
            registry_for_unregister.modify(move |mut records| {
                records.retain(|r| r.id != id);
                records
            })
        })
        .await;

        match result {
            Ok(Err(e)) => log::warn!(
                "[lifecycle] failed to remove instance {} from registry on shutdown: {e}",
                self.identity.id
            ),
            Err(e) => log::warn!(
                "[lifecycle] registry-removal task panicked during shutdown of instance {}: {e}",
                self.identity.id
            ),
            Ok(Ok(_)) => {}
        }

        self.state.set_surface_state(SurfaceState::Draining);
        if let Some(task) = self.server_task.take() {
            task.abort();
            let _ = task.await;
        }
        self.state.set_surface_state(SurfaceState::Stopped);

        log::info!("[lifecycle] instance {} shut down", self.identity.id);
    }

    /// Heartbeat period this instance was started with, surfaced for a host
    /// that wants to show "next beat in ~Ns" diagnostics.
    pub fn heartbeat_interval(&self) -> std::time::Duration {
        self.heartbeat_interval
    }
}
