//! In-process runner fleet.
//!
//! [`LocalRunnerFleet`] implements the runner control channel against a
//! shared Wasmtime engine. Each hosted runner keeps the per-tier
//! artifacts its modules occupy:
//! - `Stored`: bytes in the artifact store on disk
//! - `Loaded`: bytes in memory
//! - `Compiled`: a [`CompiledArtifact`]
//! - `Running`: a pre-instantiated template bound to the module's WASI
//!   parameters
//!
//! The artifact store is fleet-wide (`{data_dir}/artifacts/...`), so
//! `Stored`-tier bytes survive individual runner teardown.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info, instrument, warn};
use wasmtime::{InstancePre, Linker, Trap};
use uuid::Uuid;

use hive_common::{EngineConfig, EngineError, InvokeError, ModuleKey};
use hive_core::control::{InvokeRequest, InvokeResponse, RunnerControl, WasiParams};
use hive_core::registry::{RunnerId, Tier};

use crate::artifact::CompiledArtifact;
use crate::context::{RequestContext, calculate_fuel_consumed, create_store, get_remaining_fuel};
use crate::engine::WasmEngine;

/// A prepared instance: pre-linked module plus its WASI parameters.
struct InstanceTemplate {
    pre: InstancePre<RequestContext>,
    params: WasiParams,
}

/// One hosted runner's tier residency.
#[derive(Default)]
struct HostedRunner {
    bytes: DashMap<ModuleKey, Arc<Vec<u8>>>,
    artifacts: DashMap<ModuleKey, Arc<CompiledArtifact>>,
    instances: DashMap<ModuleKey, Arc<InstanceTemplate>>,
}

/// Runner control channel backed by in-process Wasmtime runners.
pub struct LocalRunnerFleet {
    engine: WasmEngine,
    linker: Linker<RequestContext>,
    data_dir: PathBuf,
    invoke_timeout_ms: u64,
    runners: DashMap<RunnerId, Arc<HostedRunner>>,
}

impl LocalRunnerFleet {
    /// Create a fleet over a fresh engine.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot be created or WASI cannot be
    /// linked.
    pub fn new(
        engine_config: &EngineConfig,
        data_dir: impl Into<PathBuf>,
        invoke_timeout_ms: u64,
    ) -> Result<Self, EngineError> {
        let engine = WasmEngine::new(engine_config)?;

        let mut linker = Linker::new(engine.inner());
        wasmtime_wasi::preview1::add_to_linker_async(&mut linker, RequestContext::wasi)
            .map_err(|e| EngineError::invalid_config(format!("Failed to link WASI: {e}")))?;

        Ok(Self {
            engine,
            linker,
            data_dir: data_dir.into(),
            invoke_timeout_ms,
            runners: DashMap::new(),
        })
    }

    /// The fleet's shared engine.
    pub fn engine(&self) -> &WasmEngine {
        &self.engine
    }

    fn runner(&self, id: &RunnerId) -> Result<Arc<HostedRunner>, EngineError> {
        self.runners
            .get(id)
            .map(|r| r.clone())
            .ok_or_else(|| EngineError::runner_not_found(id.to_string()))
    }

    /// Path of a module's stored bytes in the fleet-wide artifact store.
    fn artifact_path(&self, module: &ModuleKey) -> PathBuf {
        self.data_dir
            .join("artifacts")
            .join(module.namespace())
            .join(format!("{}.wasm", module.name()))
    }
}

#[async_trait]
impl RunnerControl for LocalRunnerFleet {
    async fn provision(&self, runner: &RunnerId) -> Result<(), EngineError> {
        self.runners
            .entry(runner.clone())
            .or_insert_with(|| Arc::new(HostedRunner::default()));
        info!(runner = %runner, "Runner provisioned");
        Ok(())
    }

    async fn teardown(&self, runner: &RunnerId) -> Result<(), EngineError> {
        self.runners.remove(runner);
        info!(runner = %runner, "Runner torn down");
        Ok(())
    }

    #[instrument(skip(self, bytes), fields(runner = %runner, module = %module))]
    async fn store(
        &self,
        runner: &RunnerId,
        module: &ModuleKey,
        bytes: &[u8],
    ) -> Result<(), EngineError> {
        self.runner(runner)?;

        let path = self.artifact_path(module);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;

        debug!(path = %path.display(), bytes = bytes.len(), "Artifact stored");
        Ok(())
    }

    async fn load(&self, runner: &RunnerId, module: &ModuleKey) -> Result<(), EngineError> {
        let hosted = self.runner(runner)?;

        let bytes = tokio::fs::read(self.artifact_path(module)).await?;
        hosted.bytes.insert(module.clone(), Arc::new(bytes));
        Ok(())
    }

    async fn compile(&self, runner: &RunnerId, module: &ModuleKey) -> Result<(), EngineError> {
        let hosted = self.runner(runner)?;

        let bytes = hosted
            .bytes
            .get(module)
            .map(|b| b.clone())
            .ok_or_else(|| EngineError::module_not_found(module.to_string()))?;

        let artifact = CompiledArtifact::from_bytes(self.engine.inner(), &bytes)?;
        hosted.artifacts.insert(module.clone(), Arc::new(artifact));
        Ok(())
    }

    async fn instantiate(
        &self,
        runner: &RunnerId,
        module: &ModuleKey,
        params: WasiParams,
    ) -> Result<(), EngineError> {
        let hosted = self.runner(runner)?;

        let artifact = hosted
            .artifacts
            .get(module)
            .map(|a| a.clone())
            .ok_or_else(|| EngineError::module_not_found(module.to_string()))?;

        // Missing entry point is a terminal compile-class failure
        if artifact.module().get_export("_start").is_none() {
            return Err(EngineError::compilation_failed(
                "Required export '_start' not found",
            ));
        }

        let pre = self
            .linker
            .instantiate_pre(artifact.module())
            .map_err(|e| EngineError::compilation_failed(format!("Pre-instantiation failed: {e}")))?;

        hosted
            .instances
            .insert(module.clone(), Arc::new(InstanceTemplate { pre, params }));
        Ok(())
    }

    async fn evict(
        &self,
        runner: &RunnerId,
        module: &ModuleKey,
        target: Option<Tier>,
    ) -> Result<(), EngineError> {
        let hosted = self.runner(runner)?;

        // Each arm drops everything above the target tier
        match target {
            Some(Tier::Running) => {}
            Some(Tier::Compiled) => {
                hosted.instances.remove(module);
            }
            Some(Tier::Loaded) => {
                hosted.instances.remove(module);
                hosted.artifacts.remove(module);
            }
            Some(Tier::Stored) => {
                hosted.instances.remove(module);
                hosted.artifacts.remove(module);
                hosted.bytes.remove(module);
            }
            None => {
                hosted.instances.remove(module);
                hosted.artifacts.remove(module);
                hosted.bytes.remove(module);
                match tokio::fs::remove_file(self.artifact_path(module)).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        debug!(runner = %runner, module = %module, ?target, "Artifacts evicted");
        Ok(())
    }

    #[instrument(skip(self, request), fields(runner = %runner, module = %module))]
    async fn invoke(
        &self,
        runner: &RunnerId,
        module: &ModuleKey,
        request: InvokeRequest,
    ) -> Result<InvokeResponse, EngineError> {
        let hosted = self.runner(runner)?;
        let template = hosted
            .instances
            .get(module)
            .map(|t| t.clone())
            .ok_or_else(|| EngineError::module_not_found(module.to_string()))?;

        let request_id = Uuid::new_v4().to_string();
        let (mut store, stdout) = create_store(
            &self.engine,
            &template.params,
            &request,
            request_id,
            self.invoke_timeout_ms,
        )?;
        let initial_fuel = get_remaining_fuel(&store).unwrap_or(0);

        let instance = template
            .pre
            .instantiate_async(&mut store)
            .await
            .map_err(|e| EngineError::compilation_failed(format!("Instantiation failed: {e}")))?;

        let func = instance
            .get_typed_func::<(), ()>(&mut store, "_start")
            .map_err(|e| EngineError::compilation_failed(format!("Entry point lookup failed: {e}")))?;

        let result = tokio::time::timeout(
            Duration::from_millis(self.invoke_timeout_ms),
            func.call_async(&mut store, ()),
        )
        .await;

        let fuel_consumed = calculate_fuel_consumed(initial_fuel, &store);

        match result {
            Ok(Ok(())) => {
                let body = stdout.contents().to_vec();
                debug!(fuel_consumed, body_len = body.len(), "Execution completed");
                Ok(InvokeResponse {
                    status: 200,
                    body,
                    fuel_consumed,
                })
            }
            Ok(Err(trap)) => {
                if is_out_of_fuel(&trap) {
                    warn!(fuel_consumed, "Execution terminated: fuel exhausted");
                    return Err(InvokeError::FuelExhausted.into());
                }
                warn!(error = %trap, "Execution trapped");
                Err(InvokeError::Trap {
                    message: trap.to_string(),
                }
                .into())
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.invoke_timeout_ms,
                    "Execution exceeded the invoke timeout"
                );
                Err(InvokeError::Timeout {
                    duration_ms: self.invoke_timeout_ms,
                }
                .into())
            }
        }
    }
}

impl std::fmt::Debug for LocalRunnerFleet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRunnerFleet")
            .field("runners", &self.runners.len())
            .field("data_dir", &self.data_dir.display().to_string())
            .finish_non_exhaustive()
    }
}

/// Check if an error is due to fuel exhaustion.
fn is_out_of_fuel(error: &wasmtime::Error) -> bool {
    error
        .downcast_ref::<Trap>()
        .is_some_and(|trap| *trap == Trap::OutOfFuel)
}

/// Remove a fleet data directory; test helper.
pub fn cleanup_data_dir(path: &Path) {
    let _ = std::fs::remove_dir_all(path);
}

#[cfg(test)]
mod tests {
    use super::*;

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

    // (module (func (export "_start") (loop br 0)))
    const LOOP_WASM: &[u8] = &[
        0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00, //
        0x01, 0x04, 0x01, 0x60, 0x00, 0x00, //
        0x03, 0x02, 0x01, 0x00, //
        0x07, 0x0a, 0x01, 0x06, 0x5f, 0x73, 0x74, 0x61, 0x72, 0x74, 0x00, 0x00, //
        0x0a, 0x09, 0x01, 0x07, 0x00, 0x03, 0x40, 0x0c, 0x00, 0x0b, 0x0b, // body: loop br 0
    ];

    // Empty module: no `_start` export
    const EMPTY_WASM: &[u8] = &[0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00];

    fn test_fleet(invoke_timeout_ms: u64) -> (LocalRunnerFleet, PathBuf) {
        let dir = std::env::temp_dir().join(format!("hive-fleet-{}", Uuid::new_v4()));
        let fleet = LocalRunnerFleet::new(
            &EngineConfig {
                pooling_allocator: false,
                epoch_interruption: false,
                ..Default::default()
            },
            &dir,
            invoke_timeout_ms,
        )
        .unwrap();
        (fleet, dir)
    }

    async fn warm(
        fleet: &LocalRunnerFleet,
        runner: &RunnerId,
        module: &ModuleKey,
        bytes: &[u8],
        params: WasiParams,
    ) -> Result<(), EngineError> {
        fleet.provision(runner).await?;
        fleet.store(runner, module, bytes).await?;
        fleet.load(runner, module).await?;
        fleet.compile(runner, module).await?;
        fleet.instantiate(runner, module, params).await
    }

    fn params(fuel: u64) -> WasiParams {
        WasiParams {
            fuel: Some(fuel),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_full_warm_path_and_invoke() {
        let (fleet, dir) = test_fleet(5_000);
        let runner = RunnerId::new("runner-0");
        let module = ModuleKey::new("default", "hello");

        warm(&fleet, &runner, &module, START_WASM, params(1_000_000))
            .await
            .unwrap();

        let response = fleet
            .invoke(&runner, &module, InvokeRequest::default())
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert!(response.fuel_consumed > 0);

        cleanup_data_dir(&dir);
    }

    #[tokio::test]
    async fn test_trap_faults_the_request() {
        let (fleet, dir) = test_fleet(5_000);
        let runner = RunnerId::new("runner-0");
        let module = ModuleKey::new("default", "trapper");

        warm(&fleet, &runner, &module, TRAP_WASM, params(1_000_000))
            .await
            .unwrap();

        let err = fleet
            .invoke(&runner, &module, InvokeRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Invoke(InvokeError::Trap { .. })));

        // The instance template survives; the next request still runs
        assert!(
            fleet
                .runner(&runner)
                .unwrap()
                .instances
                .contains_key(&module)
        );

        cleanup_data_dir(&dir);
    }

    #[tokio::test]
    async fn test_fuel_exhaustion() {
        let (fleet, dir) = test_fleet(5_000);
        let runner = RunnerId::new("runner-0");
        let module = ModuleKey::new("default", "spinner");

        warm(&fleet, &runner, &module, LOOP_WASM, params(10_000))
            .await
            .unwrap();

        let err = fleet
            .invoke(&runner, &module, InvokeRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Invoke(InvokeError::FuelExhausted)
        ));

        cleanup_data_dir(&dir);
    }

    #[tokio::test]
    async fn test_missing_entry_point_is_terminal() {
        let (fleet, dir) = test_fleet(5_000);
        let runner = RunnerId::new("runner-0");
        let module = ModuleKey::new("default", "empty");

        fleet.provision(&runner).await.unwrap();
        fleet.store(&runner, &module, EMPTY_WASM).await.unwrap();
        fleet.load(&runner, &module).await.unwrap();
        fleet.compile(&runner, &module).await.unwrap();

        let err = fleet
            .instantiate(&runner, &module, params(1_000))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::CompilationFailed { .. }));

        cleanup_data_dir(&dir);
    }

    #[tokio::test]
    async fn test_invalid_bytes_fail_compile() {
        let (fleet, dir) = test_fleet(5_000);
        let runner = RunnerId::new("runner-0");
        let module = ModuleKey::new("default", "garbage");

        fleet.provision(&runner).await.unwrap();
        fleet
            .store(&runner, &module, b"this is not wasm")
            .await
            .unwrap();
        fleet.load(&runner, &module).await.unwrap();

        let err = fleet.compile(&runner, &module).await.unwrap_err();
        assert!(matches!(err, EngineError::CompilationFailed { .. }));

        cleanup_data_dir(&dir);
    }

    #[tokio::test]
    async fn test_evict_drops_tiers_stepwise() {
        let (fleet, dir) = test_fleet(5_000);
        let runner = RunnerId::new("runner-0");
        let module = ModuleKey::new("default", "hello");

        warm(&fleet, &runner, &module, START_WASM, params(1_000_000))
            .await
            .unwrap();

        fleet
            .evict(&runner, &module, Some(Tier::Compiled))
            .await
            .unwrap();
        let hosted = fleet.runner(&runner).unwrap();
        assert!(!hosted.instances.contains_key(&module));
        assert!(hosted.artifacts.contains_key(&module));

        fleet
            .evict(&runner, &module, Some(Tier::Stored))
            .await
            .unwrap();
        let hosted = fleet.runner(&runner).unwrap();
        assert!(!hosted.artifacts.contains_key(&module));
        assert!(!hosted.bytes.contains_key(&module));
        assert!(fleet.artifact_path(&module).exists());

        fleet.evict(&runner, &module, None).await.unwrap();
        assert!(!fleet.artifact_path(&module).exists());

        // An evicted module can no longer serve requests
        let err = fleet
            .invoke(&runner, &module, InvokeRequest::default())
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        cleanup_data_dir(&dir);
    }

    #[tokio::test]
    async fn test_unknown_runner_is_rejected() {
        let (fleet, dir) = test_fleet(5_000);
        let err = fleet
            .load(&RunnerId::new("ghost"), &ModuleKey::new("default", "m"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::RunnerNotFound { .. }));

        cleanup_data_dir(&dir);
    }
}
