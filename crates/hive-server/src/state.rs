//! Shared application state.
//!
//! [`AppState`] wires the core (registries, scheduler, lifecycle,
//! eviction) to the collaborators (fleet, fetcher, status sink) and owns
//! the routing table and telemetry. It is cloned per request; everything
//! inside is shared through `Arc`.

use std::sync::Arc;

use hive_common::{EngineError, ModuleKey, ModuleSpec, RuntimeConfig};
use hive_core::control::{OciFetcher, RunnerControl, StatusSink};
use hive_core::registry::{ModuleRegistry, RunnerRegistry};
use hive_core::{LifecycleController, PlacementScheduler, TieredEvictionManager};
use hive_host::{LocalRunnerFleet, RegistryFetcher, TracingStatusSink, WasmEngine};

/// Shared state across all request handlers.
#[derive(Clone)]
pub struct AppState {
    modules: Arc<ModuleRegistry>,
    runners: Arc<RunnerRegistry>,
    scheduler: Arc<PlacementScheduler>,
    lifecycle: Arc<LifecycleController>,
    eviction: Arc<TieredEvictionManager>,
    control: Arc<dyn RunnerControl>,
    routing: Arc<crate::routing::RoutingPublisher>,
    telemetry: Arc<crate::telemetry::Telemetry>,
    config: Arc<RuntimeConfig>,
    domain: String,
    wasm_engine: Option<WasmEngine>,
}

impl AppState {
    /// Create state backed by the in-process Wasmtime fleet and the OCI
    /// registry fetcher.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot be initialized.
    pub fn new(config: &RuntimeConfig, domain: &str) -> Result<Self, EngineError> {
        let fleet = Arc::new(LocalRunnerFleet::new(
            &config.engine,
            &config.runner.data_dir,
            config.lifecycle.invoke_timeout_ms,
        )?);
        let engine = fleet.engine().clone();

        Self::with_collaborators(
            config,
            domain,
            Arc::new(RegistryFetcher::new()),
            fleet,
            Arc::new(TracingStatusSink::new()),
            Some(engine),
        )
    }

    /// Create state with explicit collaborators.
    ///
    /// Tests substitute in-memory fetchers and recording fleets here.
    pub fn with_collaborators(
        config: &RuntimeConfig,
        domain: &str,
        fetcher: Arc<dyn OciFetcher>,
        control: Arc<dyn RunnerControl>,
        status: Arc<dyn StatusSink>,
        wasm_engine: Option<WasmEngine>,
    ) -> Result<Self, EngineError> {
        let modules = Arc::new(ModuleRegistry::new());
        let runners = Arc::new(RunnerRegistry::new());
        let eviction = Arc::new(TieredEvictionManager::new(config.cache.clone()));

        let scheduler = Arc::new(PlacementScheduler::new(
            modules.clone(),
            runners.clone(),
            control.clone(),
            config.scheduler.clone(),
            config.runner.clone(),
            config.lifecycle.default_fuel,
        ));
        let lifecycle = Arc::new(LifecycleController::new(
            modules.clone(),
            runners.clone(),
            scheduler.clone(),
            fetcher,
            control.clone(),
            status,
            eviction.clone(),
            config.lifecycle.clone(),
            config.runner.clone(),
        ));

        Ok(Self {
            modules,
            runners,
            scheduler,
            lifecycle,
            eviction,
            control,
            routing: Arc::new(crate::routing::RoutingPublisher::new()),
            telemetry: Arc::new(crate::telemetry::Telemetry::new()),
            config: Arc::new(config.clone()),
            domain: domain.to_string(),
            wasm_engine,
        })
    }

    /// The module registry.
    pub fn modules(&self) -> &Arc<ModuleRegistry> {
        &self.modules
    }

    /// The runner registry.
    pub fn runners(&self) -> &Arc<RunnerRegistry> {
        &self.runners
    }

    /// The placement scheduler.
    pub fn scheduler(&self) -> &Arc<PlacementScheduler> {
        &self.scheduler
    }

    /// The lifecycle controller.
    pub fn lifecycle(&self) -> &Arc<LifecycleController> {
        &self.lifecycle
    }

    /// The eviction manager.
    pub fn eviction(&self) -> &Arc<TieredEvictionManager> {
        &self.eviction
    }

    /// The runner control channel.
    pub fn control(&self) -> &Arc<dyn RunnerControl> {
        &self.control
    }

    /// The routing publisher.
    pub fn routing(&self) -> &Arc<crate::routing::RoutingPublisher> {
        &self.routing
    }

    /// The telemetry registry.
    pub fn telemetry(&self) -> &Arc<crate::telemetry::Telemetry> {
        &self.telemetry
    }

    /// The runtime configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The routing domain.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// The Wasmtime engine, when backed by the local fleet.
    pub fn wasm_engine(&self) -> Option<&WasmEngine> {
        self.wasm_engine.as_ref()
    }

    /// Admit a module spec and republish routing.
    ///
    /// The routing entry is published even when placement fails, so the
    /// module can be placed lazily on first access once capacity frees
    /// up.
    pub async fn apply_module(&self, key: ModuleKey, spec: ModuleSpec) -> Result<(), EngineError> {
        let result = self.lifecycle.apply(key, spec).await;
        self.routing.rebuild(&self.modules, &self.domain);
        result
    }

    /// Remove a module and republish routing.
    pub async fn remove_module(&self, key: &ModuleKey) -> Result<(), EngineError> {
        let result = self.lifecycle.remove(key).await;
        self.telemetry.forget(key);
        self.routing.rebuild(&self.modules, &self.domain);
        result
    }

    /// Rebuild the routing table from the registry.
    pub fn rebuild_routing(&self) {
        self.routing.rebuild(&self.modules, &self.domain);
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("modules", &self.modules.len())
            .field("runners", &self.runners.len())
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}
