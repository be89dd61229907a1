//! Spec-source API handlers.
//!
//! The external reconciler delivers module specs through this API as
//! already-parsed JSON; volume and port isolation checks still run here
//! because they are domain logic, not Kubernetes syntax validation.
//!
//! # Authentication
//!
//! All endpoints require the `X-Admin-Token` header to match the
//! configured admin token. Comparison is constant-time.
//!
//! # Endpoints
//!
//! - `PUT /admin/modules` - Create or update a module from its spec
//! - `GET /admin/modules` - List all modules
//! - `GET /admin/modules/:namespace/:name` - Get one module's record
//! - `DELETE /admin/modules/:namespace/:name` - Delete a module

use axum::{
    Extension, Json, Router,
    extract::Path,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{delete, get, put},
};
use subtle::ConstantTimeEq;
use tracing::{info, instrument, warn};

use hive_common::{EngineError, ModuleKey, ModuleManifest};

use crate::state::AppState;

/// Admin API state containing app state and auth token.
#[derive(Clone)]
pub struct AdminState {
    /// Application state.
    pub app_state: AppState,
    /// Expected admin token for authentication.
    pub admin_token: String,
}

/// Build the admin API router.
///
/// Uses `Extension` for the admin state so it can be nested into routers
/// with a different state type.
pub fn build_admin_router(admin_state: AdminState) -> Router<AppState> {
    Router::new()
        .route("/modules", put(upsert_module))
        .route("/modules", get(list_modules))
        .route("/modules/:namespace/:name", get(get_module))
        .route("/modules/:namespace/:name", delete(delete_module))
        .layer(Extension(admin_state))
}

/// Verify the admin token from request headers.
fn verify_token(headers: &HeaderMap, expected: &str) -> Result<(), (StatusCode, &'static str)> {
    match headers.get("X-Admin-Token") {
        Some(token) => {
            let presented = token.as_bytes();
            if bool::from(presented.ct_eq(expected.as_bytes())) {
                Ok(())
            } else {
                Err((StatusCode::UNAUTHORIZED, "Invalid admin token"))
            }
        }
        None => Err((StatusCode::UNAUTHORIZED, "Missing X-Admin-Token header")),
    }
}

/// Create or update a module from its spec.
#[instrument(skip(admin_state, headers, manifest), fields(namespace = %manifest.namespace, name = %manifest.name))]
pub async fn upsert_module(
    Extension(admin_state): Extension<AdminState>,
    headers: HeaderMap,
    Json(manifest): Json<ModuleManifest>,
) -> impl IntoResponse {
    if let Err(e) = verify_token(&headers, &admin_state.admin_token) {
        return e.into_response();
    }

    let key = ModuleKey::new(manifest.namespace, manifest.name);
    match admin_state
        .app_state
        .apply_module(key.clone(), manifest.spec)
        .await
    {
        Ok(()) => {
            info!(module = %key, "Module applied");
            Json(serde_json::json!({
                "module": key.to_string(),
                "hostname": key.hostname(admin_state.app_state.domain()),
                "message": "Module applied successfully",
            }))
            .into_response()
        }
        Err(e) => {
            warn!(module = %key, error = %e, "Module apply failed");
            apply_error_response(&e)
        }
    }
}

/// List all modules.
pub async fn list_modules(
    Extension(admin_state): Extension<AdminState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(e) = verify_token(&headers, &admin_state.admin_token) {
        return e.into_response();
    }

    let modules: Vec<serde_json::Value> = admin_state
        .app_state
        .modules()
        .entries()
        .iter()
        .map(|entry| {
            entry.with(|record| {
                serde_json::json!({
                    "module": entry.key().to_string(),
                    "state": record.state.to_string(),
                    "tier": record.tiers.highest().map(|t| t.to_string()),
                    "runner": record.runner.as_ref().map(ToString::to_string),
                    "generation": record.generation,
                })
            })
        })
        .collect();

    Json(serde_json::json!({
        "modules": modules,
        "count": modules.len(),
    }))
    .into_response()
}

/// Get one module's record.
pub async fn get_module(
    Extension(admin_state): Extension<AdminState>,
    headers: HeaderMap,
    Path((namespace, name)): Path<(String, String)>,
) -> impl IntoResponse {
    if let Err(e) = verify_token(&headers, &admin_state.admin_token) {
        return e.into_response();
    }

    let key = ModuleKey::new(namespace, name);
    match admin_state.app_state.modules().get(&key) {
        Some(entry) => {
            let record = entry.snapshot();
            Json(serde_json::json!({
                "module": key.to_string(),
                "image": record.spec.image,
                "state": record.state.to_string(),
                "tier": record.tiers.highest().map(|t| t.to_string()),
                "runner": record.runner.as_ref().map(ToString::to_string),
                "generation": record.generation,
                "artifact_bytes": record.artifact_bytes,
                "error": record.error.as_ref().map(|e| {
                    serde_json::json!({ "reason": e.reason, "message": e.message })
                }),
            }))
            .into_response()
        }
        None => (
            StatusCode::NOT_FOUND,
            format!("Module '{key}' not found"),
        )
            .into_response(),
    }
}

/// Delete a module.
#[instrument(skip(admin_state, headers))]
pub async fn delete_module(
    Extension(admin_state): Extension<AdminState>,
    headers: HeaderMap,
    Path((namespace, name)): Path<(String, String)>,
) -> impl IntoResponse {
    if let Err(e) = verify_token(&headers, &admin_state.admin_token) {
        return e.into_response();
    }

    let key = ModuleKey::new(namespace, name);
    match admin_state.app_state.remove_module(&key).await {
        Ok(()) => {
            info!(module = %key, "Module deleted");
            Json(serde_json::json!({
                "module": key.to_string(),
                "message": "Module deleted successfully",
            }))
            .into_response()
        }
        Err(e) if e.is_not_found() => {
            (StatusCode::NOT_FOUND, format!("Module '{key}' not found")).into_response()
        }
        Err(e) => {
            warn!(module = %key, error = %e, "Module delete failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Map apply failures to admin API responses.
fn apply_error_response(error: &EngineError) -> axum::response::Response {
    let status = match error {
        EngineError::InvalidSpec { .. } => StatusCode::BAD_REQUEST,
        EngineError::Conflict(_) => StatusCode::CONFLICT,
        // Retryable for the spec source
        EngineError::Placement(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(serde_json::json!({
            "error": error.to_string(),
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_token() {
        let mut headers = HeaderMap::new();
        assert!(verify_token(&headers, "secret").is_err());

        headers.insert("X-Admin-Token", "wrong".parse().unwrap());
        assert!(verify_token(&headers, "secret").is_err());

        headers.insert("X-Admin-Token", "secret".parse().unwrap());
        assert!(verify_token(&headers, "secret").is_ok());
    }

    #[test]
    fn test_apply_error_status_mapping() {
        let resp = apply_error_response(&EngineError::invalid_spec("missing image"));
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = apply_error_response(&EngineError::Placement(
            hive_common::error::PlacementError::NoCapacity {
                module: "a/b".into(),
            },
        ));
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
