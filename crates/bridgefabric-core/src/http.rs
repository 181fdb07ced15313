//! HTTP Surface: `/health`, `/instances`, `/instance/{id}/send`, under a
//! strict origin policy, in the teacher's `incoming_webhook.rs` idiom — an
//! `axum::Router` built against a small `Arc<State>`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use serde_json::{json, Value};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::config::FabricConfig;
use crate::error::FabricError;
use crate::identity::InstanceIdentity;
use crate::registry::RegistryStore;

/// Result of handing a payload to the host's downstream collaborator.
#[derive(Debug)]
pub enum DeliveryError {
    /// The downstream target is not currently reachable (e.g. paused).
    Unavailable(String),
    /// The downstream target accepted the call but it failed.
    Failed(String),
}

/// Host-supplied realization of `send`: the fabric calls this with the raw
/// content string and awaits success or failure. Kept as a trait object so
/// an embedding host (or a test) can supply any implementation.
#[async_trait::async_trait]
pub trait DeliveryTarget: Send + Sync {
    async fn deliver(&self, content: String) -> Result<(), DeliveryError>;
}

/// `Starting -> Listening -> Draining -> Stopped`, as in §4.E.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceState {
    Starting,
    Listening,
    Draining,
    Stopped,
}

pub struct FabricState {
    pub identity: Arc<InstanceIdentity>,
    pub registry: Arc<RegistryStore>,
    pub config: Arc<FabricConfig>,
    pub delivery: Arc<dyn DeliveryTarget>,
    pub started_at: Instant,
    pub paused: AtomicBool,
    pub surface_state: RwLock<SurfaceState>,
}

impl FabricState {
    pub fn set_surface_state(&self, state: SurfaceState) {
        *self.surface_state.write().expect("surface state lock poisoned") = state;
    }

    pub fn surface_state(&self) -> SurfaceState {
        *self.surface_state.read().expect("surface state lock poisoned")
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

/// Build the router for this fabric instance. The body-size cap is
/// enforced by axum's own `DefaultBodyLimit` layer; the origin policy is a
/// small custom middleware that runs *before* the CORS layer so a
/// disallowed origin never reaches it and never gets CORS headers echoed
/// back, satisfying the "no CORS echo on 403" requirement.
pub fn router(state: Arc<FabricState>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([axum::http::header::CONTENT_TYPE])
        .allow_origin(AllowOrigin::mirror_request());

    Router::new()
        .route("/health", get(health).options(preflight))
        .route("/instances", get(list_instances).options(preflight))
        .route("/instance/{id}/send", post(send).options(preflight))
        .layer(DefaultBodyLimit::max(state.config.max_body_bytes))
        .layer(cors)
        .layer(middleware::from_fn_with_state(Arc::clone(&state), origin_guard))
        .with_state(state)
}

async fn preflight() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// Reject any request whose `Origin` header is present, non-`null`, and
/// does not match one of the allowed browser-extension schemes. An absent
/// header or the literal `null` are always accepted: extension service
/// workers and curl-class clients omit the header, and the loopback bind
/// plus the per-instance id check on `send` are what actually keep this
/// fabric from being reachable by the wider web.
async fn origin_guard(
    State(state): State<Arc<FabricState>>,
    request: axum::extract::Request,
    next: Next,
) -> axum::response::Response {
    let origin = request
        .headers()
        .get(axum::http::header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    if origin_is_allowed(origin.as_deref(), &state.config.allowed_origin_schemes) {
        next.run(request).await
    } else {
        FabricError::ForbiddenOrigin.into_response()
    }
}

fn origin_is_allowed(origin: Option<&str>, allowed_schemes: &[String]) -> bool {
    match origin {
        None => true,
        Some("null") => true,
        Some(origin) => allowed_schemes.iter().any(|scheme| origin.starts_with(scheme.as_str())),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    healthy: bool,
    version: String,
    capability_available: bool,
    workspace_name: String,
    workspace_path: String,
    instance_id: String,
    port: u16,
    pid: u32,
    uptime: u64,
}

async fn health(State(state): State<Arc<FabricState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        healthy: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
        capability_available: !state.is_paused(),
        workspace_name: state.identity.name.clone(),
        workspace_path: state.identity.workspace_path.clone(),
        instance_id: state.identity.id.clone(),
        port: state.identity.port().unwrap_or_default(),
        pid: state.identity.pid,
        uptime: state.started_at.elapsed().as_secs(),
    })
}

async fn list_instances(State(state): State<Arc<FabricState>>) -> Result<impl IntoResponse, FabricError> {
    let instances = state.registry.snapshot()?;
    Ok(Json(json!({ "instances": instances })))
}

async fn send(
    State(state): State<Arc<FabricState>>,
    Path(id): Path<String>,
    body: Result<Bytes, BytesRejection>,
) -> Result<impl IntoResponse, FabricError> {
    // `DefaultBodyLimit` (layered on the router) aborts the body stream
    // before it is fully buffered once it exceeds the cap; surfacing that
    // here keeps the response in the `{success:false,error}` shape §6
    // promises instead of axum's own plain-text 413.
    let body = body.map_err(|_| FabricError::BodyTooLarge {
        max_bytes: state.config.max_body_bytes,
    })?;

    if id != state.identity.id {
        return Err(FabricError::WrongInstance);
    }

    let parsed: Value = serde_json::from_slice(&body)
        .map_err(|e| FabricError::BadRequest(format!("invalid JSON body: {e}")))?;

    let content = parsed
        .get("content")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| FabricError::BadRequest("missing or invalid content".to_string()))?
        .to_string();

    if state.is_paused() {
        return Err(FabricError::DownstreamUnavailable(
            "instance is paused".to_string(),
        ));
    }

    state
        .delivery
        .deliver(content)
        .await
        .map_err(|e| match e {
            DeliveryError::Unavailable(msg) => FabricError::DownstreamUnavailable(msg),
            DeliveryError::Failed(msg) => FabricError::DownstreamFailed(msg),
        })?;

    Ok(Json(json!({ "success": true })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_and_null_origin_are_allowed() {
        let schemes = vec!["chrome-extension://".to_string()];
        assert!(origin_is_allowed(None, &schemes));
        assert!(origin_is_allowed(Some("null"), &schemes));
    }

    #[test]
    fn matching_scheme_is_allowed() {
        let schemes = vec!["chrome-extension://".to_string(), "moz-extension://".to_string()];
        assert!(origin_is_allowed(
            Some("chrome-extension://abcdefghijklmnop"),
            &schemes
        ));
        assert!(origin_is_allowed(Some("moz-extension://some-uuid"), &schemes));
    }

    #[test]
    fn arbitrary_web_origin_is_rejected() {
        let schemes = vec!["chrome-extension://".to_string()];
        assert!(!origin_is_allowed(Some("https://evil.example"), &schemes));
    }
}
