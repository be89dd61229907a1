//! HTTP server implementation.
//!
//! [`HiveServer`] binds the edge listener and owns the background loops:
//! the eviction sweep (with rebalancing) and the engine epoch ticker.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::info;

use hive_common::{EngineError, RuntimeConfig, ServerConfigFile};

use crate::router::{AdminRouterConfig, build_router_with_admin};
use crate::state::AppState;

/// Configuration for the HTTP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server.
    pub bind_addr: SocketAddr,
    /// Request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Enable graceful shutdown on SIGTERM/SIGINT.
    pub graceful_shutdown: bool,
    /// Routing domain: modules serve under `{name}.{namespace}.{domain}`.
    pub domain: String,
    /// Admin API token; the admin routes are mounted when set.
    pub admin_token: Option<String>,
    /// Admin API prefix.
    pub admin_prefix: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".parse().expect("valid default bind address"),
            request_timeout_secs: 30,
            graceful_shutdown: true,
            domain: "wasm.local".to_string(),
            admin_token: None,
            admin_prefix: "/admin".to_string(),
        }
    }
}

impl ServerConfig {
    /// Build from the config-file section.
    ///
    /// # Errors
    ///
    /// Returns an error if the bind address does not parse.
    pub fn from_file(file: &ServerConfigFile) -> Result<Self, EngineError> {
        let bind_addr = file.bind_addr.parse().map_err(|_| {
            EngineError::invalid_config(format!("invalid bind address '{}'", file.bind_addr))
        })?;
        Ok(Self {
            bind_addr,
            request_timeout_secs: file.request_timeout_secs,
            graceful_shutdown: file.graceful_shutdown,
            domain: file.domain.clone(),
            ..Default::default()
        })
    }

    /// Set the bind address.
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the admin token, enabling the admin API.
    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        self.admin_token = Some(token.into());
        self
    }

    /// Get the request timeout as a `Duration`.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// The hive-runtime HTTP server.
pub struct HiveServer {
    state: AppState,
    config: ServerConfig,
}

impl HiveServer {
    /// Create a server backed by the in-process fleet.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot be initialized.
    pub fn new(
        runtime_config: &RuntimeConfig,
        server_config: ServerConfig,
    ) -> Result<Self, EngineError> {
        let state = AppState::new(runtime_config, &server_config.domain)?;
        Ok(Self {
            state,
            config: server_config,
        })
    }

    /// Create a server over pre-built state.
    pub fn with_state(state: AppState, config: ServerConfig) -> Self {
        Self { state, config }
    }

    /// Get a reference to the application state.
    ///
    /// Use this to declare modules before starting the server.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Run the server until shutdown.
    ///
    /// Spawns the eviction sweep loop and the epoch ticker, then serves
    /// until SIGTERM/SIGINT when graceful shutdown is enabled.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot bind to the address.
    pub async fn run(self) -> Result<(), EngineError> {
        spawn_background_loops(&self.state);

        let admin = admin_router_config(&self.config);
        let app = build_router_with_admin(self.state, self.config.request_timeout(), admin);

        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|e| EngineError::invalid_config(format!("Failed to bind: {e}")))?;

        info!(addr = %self.config.bind_addr, domain = %self.config.domain, "Starting HTTP server");

        if self.config.graceful_shutdown {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await
                .map_err(|e| EngineError::invalid_config(format!("Server error: {e}")))?;
        } else {
            axum::serve(listener, app)
                .await
                .map_err(|e| EngineError::invalid_config(format!("Server error: {e}")))?;
        }

        info!("Server shutdown complete");
        Ok(())
    }

    /// Start the server on an ephemeral port and return a test handle.
    pub async fn start_test(
        state: AppState,
        config: ServerConfig,
    ) -> Result<TestHandle, EngineError> {
        spawn_background_loops(&state);

        let admin = admin_router_config(&config);
        let app = build_router_with_admin(state.clone(), config.request_timeout(), admin);

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| EngineError::invalid_config(format!("Failed to bind: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| EngineError::invalid_config(format!("Failed to get addr: {e}")))?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        Ok(TestHandle {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
            handle,
        })
    }
}

fn admin_router_config(config: &ServerConfig) -> Option<AdminRouterConfig> {
    config.admin_token.as_ref().map(|token| AdminRouterConfig {
        prefix: config.admin_prefix.clone(),
        token: token.clone(),
    })
}

/// Spawn the eviction sweep loop and the engine epoch ticker.
fn spawn_background_loops(state: &AppState) {
    let sweep_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_state.config().cache.sweep_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let demoted = sweep_state
                .eviction()
                .sweep(sweep_state.lifecycle())
                .await;
            let moved = sweep_state
                .scheduler()
                .rebalance(sweep_state.lifecycle())
                .await;
            if demoted > 0 || moved > 0 {
                sweep_state.rebuild_routing();
            }
        }
    });

    if let Some(engine) = state.wasm_engine().cloned() {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(1));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                engine.increment_epoch();
            }
        });
    }
}

/// Handle for a test server instance.
pub struct TestHandle {
    addr: SocketAddr,
    state: AppState,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: tokio::task::JoinHandle<Result<(), std::io::Error>>,
}

impl TestHandle {
    /// Get the server address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the server URL.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Get the application state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Shutdown the server gracefully.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.handle.await;
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
