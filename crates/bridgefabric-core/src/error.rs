//! Error taxonomy for the dispatch fabric.
//!
//! One variant per row of the error table: each carries whatever context it
//! needs to render the response body the HTTP surface promises, or to let a
//! host decide whether a startup failure is fatal.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use thiserror::Error;

/// Everything the fabric may produce or surface.
#[derive(Debug, Error)]
pub enum FabricError {
    /// Could not acquire the registry mutex within the retry budget.
    #[error("timed out waiting for the registry lock after {attempts} attempts")]
    LockTimeout { attempts: u32 },

    /// Read/write of the registry file failed.
    #[error("registry I/O failed: {0}")]
    RegistryIo(String),

    /// No free port in the reserved range.
    #[error("no free port in range {base}..{}", base + size)]
    PortExhausted { base: u16, size: u16 },

    /// Incoming request body exceeded the configured cap.
    #[error("request body exceeded the {max_bytes} byte cap")]
    BodyTooLarge { max_bytes: usize },

    /// JSON parse failure or schema violation on a request body.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Send target id does not match this instance's id.
    #[error("instance not found on this server")]
    WrongInstance,

    /// The host-provided delivery target reports itself unreachable.
    #[error("downstream unavailable: {0}")]
    DownstreamUnavailable(String),

    /// The host-provided delivery target failed while handling the payload.
    #[error("downstream delivery failed: {0}")]
    DownstreamFailed(String),

    /// Request origin is not on the allow-list.
    #[error("forbidden: invalid origin")]
    ForbiddenOrigin,
}

impl FabricError {
    /// Strip anything that looks like a filesystem path before an error
    /// crosses the HTTP surface, mirroring the teacher's
    /// `sanitize_error`/`safe_error` convention for externally visible
    /// messages.
    fn sanitized_message(&self) -> String {
        let raw = self.to_string();
        let home = dirs::home_dir()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default();
        let mut sanitized = raw;
        if !home.is_empty() {
            sanitized = sanitized.replace(&home, "~");
        }
        sanitized.replace("/Users/", "~/").replace("/home/", "~/")
    }
}

impl IntoResponse for FabricError {
    fn into_response(self) -> Response {
        match &self {
            FabricError::BadRequest(_) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "success": false, "error": "Missing or invalid content" })),
            )
                .into_response(),
            FabricError::WrongInstance => (
                StatusCode::NOT_FOUND,
                Json(json!({ "success": false, "error": "Instance not found on this server" })),
            )
                .into_response(),
            FabricError::DownstreamUnavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "success": false, "error": msg })),
            )
                .into_response(),
            FabricError::DownstreamFailed(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "error": self.sanitized_message() })),
            )
                .into_response(),
            FabricError::ForbiddenOrigin => (
                StatusCode::FORBIDDEN,
                Json(json!({ "error": "Forbidden: invalid origin" })),
            )
                .into_response(),
            FabricError::BodyTooLarge { .. } => (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(json!({ "success": false, "error": self.sanitized_message() })),
            )
                .into_response(),
            FabricError::LockTimeout { .. } | FabricError::RegistryIo(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "error": self.sanitized_message() })),
            )
                .into_response(),
            FabricError::PortExhausted { .. } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "error": self.sanitized_message() })),
            )
                .into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_home_directory_from_messages() {
        if let Some(home) = dirs::home_dir() {
            let err = FabricError::RegistryIo(format!(
                "failed to rename {}/.bridgefabric/registry.json",
                home.display()
            ));
            assert!(!err.sanitized_message().contains(&home.display().to_string()));
        }
    }

    #[test]
    fn wrong_instance_maps_to_404() {
        let resp = FabricError::WrongInstance.into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn forbidden_origin_maps_to_403() {
        let resp = FabricError::ForbiddenOrigin.into_response();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn body_too_large_maps_to_413() {
        let resp = FabricError::BodyTooLarge { max_bytes: 1024 }.into_response();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
