//! End-to-end dispatch tests.
//!
//! These wire the full stack: admin API, registries, scheduler,
//! lifecycle, and the real Wasmtime-backed fleet, with only the OCI
//! fetcher replaced by an in-memory map.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use parking_lot::Mutex;
use tower::util::ServiceExt;

use hive_common::{EngineConfig, FetchError, ModuleKey, RuntimeConfig, RunnerDefaults};
use hive_core::control::OciFetcher;
use hive_core::registry::State;
use hive_host::{LocalRunnerFleet, TracingStatusSink};
use hive_server::{AdminRouterConfig, AppState, build_router_with_admin};

// (module (func (export "_start")))
const START_WASM: &[u8] = &[
    0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00, // magic + version
    0x01, 0x04, 0x01, 0x60, 0x00, 0x00, // type: () -> ()
    0x03, 0x02, 0x01, 0x00, // one function of type 0
    0x07, 0x0a, 0x01, 0x06, 0x5f, 0x73, 0x74, 0x61, 0x72, 0x74, 0x00, 0x00, // export "_start"
    0x0a, 0x04, 0x01, 0x02, 0x00, 0x0b, // empty body
];

// (module (func (export "_start") unreachable))
const TRAP_WASM: &[u8] = &[
    0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00, //
    0x01, 0x04, 0x01, 0x60, 0x00, 0x00, //
    0x03, 0x02, 0x01, 0x00, //
    0x07, 0x0a, 0x01, 0x06, 0x5f, 0x73, 0x74, 0x61, 0x72, 0x74, 0x00, 0x00, //
    0x0a, 0x05, 0x01, 0x03, 0x00, 0x00, 0x0b, // body: unreachable
];

const ADMIN_TOKEN: &str = "test-admin-token";

#[derive(Default)]
struct MemoryFetcher {
    responses: Mutex<HashMap<String, Result<Vec<u8>, FetchError>>>,
    fetches: AtomicUsize,
}

impl MemoryFetcher {
    fn serve(&self, image: &str, bytes: &[u8]) {
        self.responses
            .lock()
            .insert(image.to_string(), Ok(bytes.to_vec()));
    }

    fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OciFetcher for MemoryFetcher {
    async fn fetch(&self, image: &str) -> Result<Vec<u8>, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.responses
            .lock()
            .get(image)
            .cloned()
            .unwrap_or_else(|| {
                Err(FetchError::NotFound {
                    image: image.to_string(),
                })
            })
    }
}

struct TestStack {
    state: AppState,
    fetcher: Arc<MemoryFetcher>,
    data_dir: std::path::PathBuf,
}

fn stack() -> TestStack {
    stack_with(|_| {})
}

fn stack_with(tune: impl FnOnce(&mut RuntimeConfig)) -> TestStack {
    let data_dir =
        std::env::temp_dir().join(format!("hive-e2e-{}", uuid::Uuid::new_v4()));
    let mut config = RuntimeConfig {
        engine: EngineConfig {
            pooling_allocator: false,
            epoch_interruption: false,
            ..Default::default()
        },
        runner: RunnerDefaults {
            data_dir: data_dir.display().to_string(),
            ..Default::default()
        },
        ..Default::default()
    };
    tune(&mut config);

    let fleet = Arc::new(
        LocalRunnerFleet::new(&config.engine, &data_dir, 5_000).unwrap(),
    );
    let engine = fleet.engine().clone();
    let fetcher = Arc::new(MemoryFetcher::default());

    let state = AppState::with_collaborators(
        &config,
        "wasm.local",
        fetcher.clone(),
        fleet,
        Arc::new(TracingStatusSink::new()),
        Some(engine),
    )
    .unwrap();

    TestStack {
        state,
        fetcher,
        data_dir,
    }
}

fn router(state: &AppState) -> axum::Router {
    build_router_with_admin(
        state.clone(),
        Duration::from_secs(30),
        Some(AdminRouterConfig {
            prefix: "/admin".into(),
            token: ADMIN_TOKEN.into(),
        }),
    )
}

fn put_module(namespace: &str, name: &str, image: &str) -> Request<Body> {
    let manifest = serde_json::json!({
        "namespace": namespace,
        "name": name,
        "spec": { "image": image },
    });
    Request::builder()
        .method("PUT")
        .uri("/admin/modules")
        .header("content-type", "application/json")
        .header("X-Admin-Token", ADMIN_TOKEN)
        .body(Body::from(manifest.to_string()))
        .unwrap()
}

fn dispatch(host: &str) -> Request<Body> {
    Request::builder()
        .uri("/")
        .header("host", host)
        .body(Body::empty())
        .unwrap()
}

fn cleanup(stack: &TestStack) {
    let _ = std::fs::remove_dir_all(&stack.data_dir);
}

#[tokio::test]
async fn cold_request_loads_and_serves() {
    let stack = stack();
    stack.fetcher.serve("ghcr.io/t/hello", START_WASM);
    let app = router(&stack.state);

    let response = app
        .clone()
        .oneshot(put_module("default", "hello", "ghcr.io/t/hello"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // First request triggers the full cold path
    let response = app
        .clone()
        .oneshot(dispatch("hello.default.wasm.local"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let key = ModuleKey::new("default", "hello");
    let record = stack.state.modules().get(&key).unwrap().snapshot();
    assert_eq!(record.state, State::Running);
    assert_eq!(stack.fetcher.fetch_count(), 1);

    // Second request takes the warm path without refetching
    let response = app
        .oneshot(dispatch("hello.default.wasm.local"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(stack.fetcher.fetch_count(), 1);

    let counters = stack.state.telemetry().counters(&key);
    assert_eq!(counters.requests_total.load(Ordering::Relaxed), 2);
    assert_eq!(counters.loads_total.load(Ordering::Relaxed), 1);

    cleanup(&stack);
}

#[tokio::test]
async fn unknown_host_is_not_found() {
    let stack = stack();
    let app = router(&stack.state);

    let response = app
        .oneshot(dispatch("stranger.nowhere.wasm.local"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    cleanup(&stack);
}

#[tokio::test]
async fn admin_rejects_bad_token() {
    let stack = stack();
    let app = router(&stack.state);

    let manifest = serde_json::json!({
        "namespace": "default",
        "name": "hello",
        "spec": { "image": "ghcr.io/t/hello" },
    });
    let request = Request::builder()
        .method("PUT")
        .uri("/admin/modules")
        .header("content-type", "application/json")
        .header("X-Admin-Token", "wrong")
        .body(Body::from(manifest.to_string()))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(stack.state.modules().is_empty());

    cleanup(&stack);
}

#[tokio::test]
async fn failing_fetch_turns_module_terminal() {
    let stack = stack();
    let app = router(&stack.state);

    // No bytes served for this image: every fetch is NotFound
    let response = app
        .clone()
        .oneshot(put_module("default", "ghost", "ghcr.io/t/ghost"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // The first request burns the fetch retries and fails
    let response = app
        .clone()
        .oneshot(dispatch("ghost.default.wasm.local"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    let key = ModuleKey::new("default", "ghost");
    assert_eq!(
        stack.state.modules().get(&key).unwrap().snapshot().state,
        State::Error
    );
    let fetches = stack.fetcher.fetch_count();

    // Error is terminal: the router answers with the fixed response and
    // never attempts another load
    let response = app
        .oneshot(dispatch("ghost.default.wasm.local"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(stack.fetcher.fetch_count(), fetches);

    cleanup(&stack);
}

#[tokio::test]
async fn trap_streak_faults_the_module() {
    let stack = stack_with(|config| {
        config.lifecycle.max_consecutive_traps = 2;
        config.lifecycle.invoke_timeout_ms = 5_000;
    });
    stack.fetcher.serve("ghcr.io/t/trapper", TRAP_WASM);
    let app = router(&stack.state);

    app.clone()
        .oneshot(put_module("default", "trapper", "ghcr.io/t/trapper"))
        .await
        .unwrap();

    // First trap faults only the request
    let response = app
        .clone()
        .oneshot(dispatch("trapper.default.wasm.local"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let key = ModuleKey::new("default", "trapper");
    assert_ne!(
        stack.state.modules().get(&key).unwrap().snapshot().state,
        State::Error
    );

    // The second consecutive trap crosses the threshold
    let response = app
        .clone()
        .oneshot(dispatch("trapper.default.wasm.local"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        stack.state.modules().get(&key).unwrap().snapshot().state,
        State::Error
    );

    // Further requests get the fixed error response
    let response = app
        .oneshot(dispatch("trapper.default.wasm.local"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    cleanup(&stack);
}

#[tokio::test]
async fn deleted_module_stops_routing() {
    let stack = stack();
    stack.fetcher.serve("ghcr.io/t/hello", START_WASM);
    let app = router(&stack.state);

    app.clone()
        .oneshot(put_module("default", "hello", "ghcr.io/t/hello"))
        .await
        .unwrap();
    let response = app
        .clone()
        .oneshot(dispatch("hello.default.wasm.local"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let request = Request::builder()
        .method("DELETE")
        .uri("/admin/modules/default/hello")
        .header("X-Admin-Token", ADMIN_TOKEN)
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(dispatch("hello.default.wasm.local"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(stack.state.modules().is_empty());

    cleanup(&stack);
}

#[tokio::test]
async fn served_over_a_real_listener() {
    let stack = stack();
    stack.fetcher.serve("ghcr.io/t/hello", START_WASM);

    let config = hive_server::ServerConfig::default().with_admin_token(ADMIN_TOKEN);
    let handle = hive_server::HiveServer::start_test(stack.state.clone(), config)
        .await
        .unwrap();

    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/health", handle.url()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let manifest = serde_json::json!({
        "namespace": "default",
        "name": "hello",
        "spec": { "image": "ghcr.io/t/hello" },
    });
    let response = client
        .put(format!("{}/admin/modules", handle.url()))
        .header("X-Admin-Token", ADMIN_TOKEN)
        .json(&manifest)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = client
        .get(format!("{}/anything", handle.url()))
        .header("Host", "hello.default.wasm.local")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    handle.shutdown().await;
    cleanup(&stack);
}

#[tokio::test]
async fn admin_lists_module_records() {
    let stack = stack();
    stack.fetcher.serve("ghcr.io/t/hello", START_WASM);
    let app = router(&stack.state);

    app.clone()
        .oneshot(put_module("default", "hello", "ghcr.io/t/hello"))
        .await
        .unwrap();

    let request = Request::builder()
        .uri("/admin/modules/default/hello")
        .header("X-Admin-Token", ADMIN_TOKEN)
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["module"], "default/hello");
    assert_eq!(json["state"], "Unloaded");
    assert_eq!(json["image"], "ghcr.io/t/hello");
    assert!(json["runner"].is_string());

    cleanup(&stack);
}
