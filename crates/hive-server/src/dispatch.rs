//! Request dispatch and monitoring handlers.
//!
//! The dispatcher maps the Host header onto a module through the current
//! routing snapshot. A `Running` module is invoked directly; a colder
//! module is lazily driven to `Running` first, bounded by the load
//! timeout. A module in `Error` gets a fixed response and never triggers
//! a load.

use std::time::Instant;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use hive_common::{EngineError, InvokeError};
use hive_core::control::InvokeRequest;
use hive_core::registry::State as ModuleState;

use crate::routing::normalize_host;
use crate::state::AppState;

/// Largest request body the dispatcher accepts.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Dispatch a request to the module serving its Host header.
#[instrument(skip(state, request))]
pub async fn dispatch_request(State(state): State<AppState>, request: Request) -> Response {
    let request_id = Uuid::new_v4().to_string();

    let Some(hostname) = host_of(&request) else {
        return error_body(StatusCode::BAD_REQUEST, "MissingHost", "No Host header");
    };

    let snapshot = state.routing().snapshot();
    let Some(entry) = snapshot.lookup(&hostname) else {
        debug!(hostname, "No routing entry");
        return error_body(
            StatusCode::NOT_FOUND,
            "UnknownHost",
            &format!("No module serves '{hostname}'"),
        );
    };
    let key = entry.module.clone();

    info!(request_id = %request_id, hostname, module = %key, "Dispatching request");

    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes.to_vec(),
        Err(_) => {
            return error_body(
                StatusCode::PAYLOAD_TOO_LARGE,
                "BodyTooLarge",
                "Request body exceeds the dispatch limit",
            );
        }
    };

    // Module in Error gets a fixed response; no lazy load is attempted
    let module_state = state
        .modules()
        .get(&key)
        .map(|e| e.with(|record| record.state));
    match module_state {
        None => {
            return error_body(
                StatusCode::NOT_FOUND,
                "ModuleNotFound",
                &format!("Module '{key}' is gone"),
            );
        }
        Some(ModuleState::Error) => {
            warn!(module = %key, "Request for module in Error state");
            return error_body(
                StatusCode::SERVICE_UNAVAILABLE,
                "ModuleInError",
                &format!("Module '{key}' is in a terminal error state"),
            );
        }
        Some(ModuleState::Running) => {}
        Some(_) => {
            // Cold module: hold the request while the lifecycle drives it
            // to Running, bounded by the load timeout
            let load_timeout = state.config().lifecycle.load_timeout();
            let load_start = Instant::now();
            match tokio::time::timeout(load_timeout, state.lifecycle().ensure_running(&key)).await
            {
                Ok(Ok(())) => {
                    let latency = load_start.elapsed().as_millis() as u64;
                    state.telemetry().record_load(&key, latency);
                    debug!(module = %key, latency_ms = latency, "Lazy load completed");
                }
                Ok(Err(e)) => {
                    error!(module = %key, error = %e, "Lazy load failed");
                    return error_to_response(&key.to_string(), &e);
                }
                Err(_) => {
                    error!(module = %key, timeout_ms = load_timeout.as_millis() as u64, "Lazy load timed out");
                    return error_body(
                        StatusCode::GATEWAY_TIMEOUT,
                        "ModuleLoadTimeout",
                        &format!("Module '{key}' did not become ready in time"),
                    );
                }
            }
        }
    }

    let invoke = InvokeRequest {
        method: parts.method.to_string(),
        path: parts
            .uri
            .path_and_query()
            .map_or_else(|| "/".to_string(), ToString::to_string),
        body,
    };

    match invoke_with_reload(&state, &key, invoke).await {
        Ok(response) => {
            state.telemetry().record_request(&key, response.fuel_consumed);
            state.telemetry().record_success(&key);
            Response::builder()
                .status(StatusCode::from_u16(response.status).unwrap_or(StatusCode::OK))
                .body(Body::from(response.body))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(e) => {
            state.telemetry().record_request(&key, 0);
            error!(module = %key, error = %e, "Invocation failed");
            note_instance_fault(&state, &key, &e).await;
            error_to_response(&key.to_string(), &e)
        }
    }
}

/// Apply the trap policy: a single trap faults only the request, but a
/// streak past the configured threshold, or an instantiation failure,
/// faults the module itself.
async fn note_instance_fault(state: &AppState, key: &hive_common::ModuleKey, error: &EngineError) {
    let threshold = u64::from(state.config().lifecycle.max_consecutive_traps);
    if threshold == 0 {
        return;
    }

    match error {
        EngineError::Invoke(InvokeError::Trap { message }) => {
            let streak = state.telemetry().record_trap(key);
            if streak >= threshold {
                warn!(module = %key, streak, "Trap streak exceeded; faulting module");
                let _ = state
                    .lifecycle()
                    .fault_module(key, "InstanceCorrupted", message)
                    .await;
            }
        }
        EngineError::CompilationFailed { reason } => {
            let _ = state
                .lifecycle()
                .fault_module(key, "InstanceCorrupted", reason)
                .await;
        }
        _ => {}
    }
}

/// Invoke the module, re-driving the lifecycle once if an eviction raced
/// the dispatch between the readiness check and the call.
async fn invoke_with_reload(
    state: &AppState,
    key: &hive_common::ModuleKey,
    invoke: InvokeRequest,
) -> Result<hive_core::control::InvokeResponse, EngineError> {
    let runner = current_runner(state, key)?;
    match state.control().invoke(&runner, key, invoke.clone()).await {
        Err(e) if e.is_not_found() => {
            state.lifecycle().ensure_running(key).await?;
            let runner = current_runner(state, key)?;
            state.control().invoke(&runner, key, invoke).await
        }
        other => other,
    }
}

fn current_runner(
    state: &AppState,
    key: &hive_common::ModuleKey,
) -> Result<hive_core::registry::RunnerId, EngineError> {
    state
        .modules()
        .get(key)
        .and_then(|e| e.with(|record| record.runner.clone()))
        .ok_or_else(|| EngineError::module_not_found(key.to_string()))
}

/// The request's Host, from the header or the URI authority.
fn host_of(request: &Request) -> Option<String> {
    request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| request.uri().host())
        .map(|h| normalize_host(h).to_string())
}

/// Convert an engine error to an HTTP response.
fn error_to_response(module: &str, error: &EngineError) -> Response {
    match error {
        EngineError::ModuleNotFound { .. } => {
            error_body(StatusCode::NOT_FOUND, "ModuleNotFound", &error.to_string())
        }
        EngineError::ModuleInError { .. } => error_body(
            StatusCode::SERVICE_UNAVAILABLE,
            "ModuleInError",
            &error.to_string(),
        ),
        EngineError::LoadTimeout { .. } => error_body(
            StatusCode::GATEWAY_TIMEOUT,
            "ModuleLoadTimeout",
            &error.to_string(),
        ),
        EngineError::Fetch(_) => error_body(
            StatusCode::BAD_GATEWAY,
            "FetchFailed",
            &format!("Artifact fetch failed for module '{module}'"),
        ),
        EngineError::CompilationFailed { .. } => error_body(
            StatusCode::INTERNAL_SERVER_ERROR,
            "CompileError",
            &error.to_string(),
        ),
        EngineError::Placement(_) => error_body(
            StatusCode::SERVICE_UNAVAILABLE,
            "PlacementFailed",
            &error.to_string(),
        ),
        EngineError::Conflict(_) => {
            error_body(StatusCode::CONFLICT, "Conflict", &error.to_string())
        }
        EngineError::Invoke(InvokeError::FuelExhausted) => error_body(
            StatusCode::TOO_MANY_REQUESTS,
            "FuelExhausted",
            "Execution limit exceeded: fuel exhausted",
        ),
        EngineError::Invoke(InvokeError::MemoryLimitExceeded { .. }) => error_body(
            StatusCode::INSUFFICIENT_STORAGE,
            "MemoryLimitExceeded",
            &error.to_string(),
        ),
        EngineError::Invoke(InvokeError::Timeout { .. }) => error_body(
            StatusCode::GATEWAY_TIMEOUT,
            "ExecutionTimeout",
            &error.to_string(),
        ),
        EngineError::Invoke(InvokeError::Trap { .. }) => error_body(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Trap",
            &error.to_string(),
        ),
        _ => error_body(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal",
            "Internal server error",
        ),
    }
}

/// A JSON error response.
fn error_body(status: StatusCode, reason: &str, message: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "reason": reason,
            "message": message,
        }
    });
    (status, axum::Json(body)).into_response()
}

/// Health check handler.
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Readiness check handler.
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let body = serde_json::json!({
        "status": "ready",
        "modules": state.modules().len(),
        "runners": state.runners().len(),
        "routes": state.routing().snapshot().len(),
    });
    (StatusCode::OK, axum::Json(body))
}

/// Runner pool inspection handler.
pub async fn list_runners(State(state): State<AppState>) -> impl IntoResponse {
    let runners: Vec<serde_json::Value> = state
        .runners()
        .entries()
        .iter()
        .map(|entry| {
            entry.with(|record| {
                serde_json::json!({
                    "id": entry.id().to_string(),
                    "pool": match &record.pool {
                        hive_core::registry::RunnerPool::Default => "default".to_string(),
                        hive_core::registry::RunnerPool::Dedicated(name) => name.clone(),
                    },
                    "modules": record.modules.len(),
                    "memory_committed": record.memory_committed,
                    "memory_capacity": record.capacity.memory_bytes,
                    "load_fraction": record.load_fraction(),
                    "volumes": record.volumes.keys().collect::<Vec<_>>(),
                })
            })
        })
        .collect();

    axum::Json(serde_json::json!({
        "runners": runners,
        "count": runners.len(),
    }))
}

/// Telemetry snapshot handler.
pub async fn telemetry_snapshot(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(state.telemetry().snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_to_response_not_found() {
        let err = EngineError::module_not_found("default/missing");
        let resp = error_to_response("default/missing", &err);
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_error_to_response_fuel_exhausted() {
        let err = EngineError::Invoke(InvokeError::FuelExhausted);
        let resp = error_to_response("default/m", &err);
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn test_error_to_response_module_in_error() {
        let err = EngineError::ModuleInError {
            module: "default/m".into(),
            reason: "CompileError".into(),
        };
        let resp = error_to_response("default/m", &err);
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_error_to_response_fetch() {
        let err = EngineError::Fetch(hive_common::FetchError::NotFound {
            image: "ghcr.io/x/y".into(),
        });
        let resp = error_to_response("default/m", &err);
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }
}
