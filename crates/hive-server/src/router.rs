//! HTTP router configuration.
//!
//! Everything that is not a monitoring or admin route falls through to
//! the Host-header dispatcher.

use std::time::Duration;

use axum::Router;
use axum::routing::get;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::admin::{AdminState, build_admin_router};
use crate::dispatch::{
    dispatch_request, health_check, list_runners, readiness_check, telemetry_snapshot,
};
use crate::state::AppState;

/// Admin API configuration for the router.
pub struct AdminRouterConfig {
    /// Admin API prefix (e.g., "/admin").
    pub prefix: String,
    /// Admin authentication token.
    pub token: String,
}

/// Build the main application router.
///
/// Routes:
/// - `GET /health` - Health check
/// - `GET /ready` - Readiness check
/// - `GET /runners` - Runner pool inspection
/// - `GET /telemetry` - Per-module counters
/// - anything else - Host-header dispatch to the serving module
pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    build_router_with_admin(state, request_timeout, None)
}

/// Build the main application router with optional admin API.
pub fn build_router_with_admin(
    state: AppState,
    request_timeout: Duration,
    admin_config: Option<AdminRouterConfig>,
) -> Router {
    let monitoring_routes = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/runners", get(list_runners))
        .route("/telemetry", get(telemetry_snapshot));

    let mut router = Router::new().merge(monitoring_routes);

    if let Some(config) = admin_config {
        let admin_state = AdminState {
            app_state: state.clone(),
            admin_token: config.token,
        };
        router = router.nest(&config.prefix, build_admin_router(admin_state));
    }

    router
        .fallback(dispatch_request)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(request_timeout))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
