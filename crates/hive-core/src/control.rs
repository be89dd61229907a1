//! Collaborator boundaries of the core.
//!
//! The core drives three external services, expressed here as traits:
//! - [`OciFetcher`]: pulls module artifacts from an OCI registry
//! - [`RunnerControl`]: the per-runner control channel (store, load,
//!   compile, instantiate, evict, invoke)
//! - [`StatusSink`]: receives per-module status records for the external
//!   reconciler
//!
//! Implementations live in `hive-host`; tests substitute in-memory fakes.

use std::collections::HashMap;

use async_trait::async_trait;

use hive_common::{EngineError, FetchError, ModuleKey, ModuleSpec};

use crate::registry::{RunnerId, State, Tier};

/// Pulls module artifacts from an OCI registry.
#[async_trait]
pub trait OciFetcher: Send + Sync {
    /// Fetch the WASM artifact for the given image reference.
    async fn fetch(&self, image: &str) -> Result<Vec<u8>, FetchError>;
}

/// A preopened directory granted to a module instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preopen {
    /// Host-side path backing the mount.
    pub host_path: String,
    /// Guest-visible path.
    pub guest_path: String,
    /// Mount read-only.
    pub read_only: bool,
}

/// Everything a runner needs to instantiate a module's WASI context.
#[derive(Debug, Clone, Default)]
pub struct WasiParams {
    /// Command line arguments.
    pub args: Vec<String>,
    /// Environment variables.
    pub env: Vec<(String, String)>,
    /// Preopened directories.
    pub preopens: Vec<Preopen>,
    /// Fuel budget per request.
    pub fuel: Option<u64>,
    /// Linear memory limit in bytes.
    pub memory_limit: Option<u64>,
    /// Inherit the host's full network stack.
    pub inherit_network: bool,
    /// Enable DNS resolution.
    pub allow_ip_name_lookup: bool,
}

impl WasiParams {
    /// Build instantiation parameters from a module spec and the hosting
    /// runner's volume profile.
    ///
    /// Modules with no declared CPU request fall back to `default_fuel`.
    ///
    /// # Errors
    ///
    /// Returns an error if the spec mounts a volume the profile does not
    /// carry; the scheduler guarantees this does not happen for placed
    /// modules.
    pub fn from_spec(
        spec: &ModuleSpec,
        volumes: &HashMap<String, String>,
        default_fuel: u64,
    ) -> Result<Self, EngineError> {
        let mut preopens = Vec::with_capacity(spec.volume_mounts.len());
        for mount in &spec.volume_mounts {
            let host_path = volumes.get(&mount.name).ok_or_else(|| {
                EngineError::invalid_spec(format!(
                    "volume '{}' is not in the runner's profile",
                    mount.name
                ))
            })?;
            preopens.push(Preopen {
                host_path: host_path.clone(),
                guest_path: mount.guest_path.clone(),
                read_only: mount.read_only,
            });
        }

        Ok(Self {
            args: spec.args.clone(),
            env: spec
                .env
                .iter()
                .map(|e| (e.name.clone(), e.value.clone()))
                .collect(),
            preopens,
            fuel: Some(spec.resources.fuel().unwrap_or(default_fuel)),
            memory_limit: spec.resources.memory_bytes(),
            inherit_network: spec.network.as_ref().is_some_and(|n| n.inherit),
            allow_ip_name_lookup: spec
                .network
                .as_ref()
                .is_some_and(|n| n.allow_ip_name_lookup),
        })
    }
}

/// An HTTP request handed to a module instance.
#[derive(Debug, Clone, Default)]
pub struct InvokeRequest {
    /// Request method.
    pub method: String,
    /// Request path and query.
    pub path: String,
    /// Request body.
    pub body: Vec<u8>,
}

/// A module instance's response.
#[derive(Debug, Clone)]
pub struct InvokeResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
    /// Fuel consumed serving the request.
    pub fuel_consumed: u64,
}

/// The per-runner control channel.
///
/// Each operation addresses one module on one runner and returns success
/// or a typed failure. Operations are driven exclusively by the lifecycle
/// controller (promotions) and the eviction manager (demotions), both of
/// which hold the module's transition lock.
#[async_trait]
pub trait RunnerControl: Send + Sync {
    /// Bring a runner process up.
    async fn provision(&self, runner: &RunnerId) -> Result<(), EngineError>;

    /// Tear a drained runner down.
    async fn teardown(&self, runner: &RunnerId) -> Result<(), EngineError>;

    /// Persist fetched bytes to the runner's disk cache (`Stored`).
    async fn store(
        &self,
        runner: &RunnerId,
        module: &ModuleKey,
        bytes: &[u8],
    ) -> Result<(), EngineError>;

    /// Read stored bytes into memory (`Loaded`).
    async fn load(&self, runner: &RunnerId, module: &ModuleKey) -> Result<(), EngineError>;

    /// Compile loaded bytes to machine code (`Compiled`).
    ///
    /// Invalid bytecode fails with `CompilationFailed`, which is terminal
    /// for the module.
    async fn compile(&self, runner: &RunnerId, module: &ModuleKey) -> Result<(), EngineError>;

    /// Prepare a live instance bound to the module's WASI context
    /// (`Running`).
    async fn instantiate(
        &self,
        runner: &RunnerId,
        module: &ModuleKey,
        params: WasiParams,
    ) -> Result<(), EngineError>;

    /// Drop artifacts above `target`, or everything when `target` is
    /// `None`.
    async fn evict(
        &self,
        runner: &RunnerId,
        module: &ModuleKey,
        target: Option<Tier>,
    ) -> Result<(), EngineError>;

    /// Dispatch a request to a `Running` module instance.
    async fn invoke(
        &self,
        runner: &RunnerId,
        module: &ModuleKey,
        request: InvokeRequest,
    ) -> Result<InvokeResponse, EngineError>;
}

/// Per-module status record for the external reconciler.
#[derive(Debug, Clone)]
pub struct ModuleStatus {
    /// Namespace-qualified module identity.
    pub module: ModuleKey,
    /// Current lifecycle state.
    pub state: State,
    /// Highest occupied tier.
    pub tier: Option<Tier>,
    /// The hosting runner, if placed.
    pub runner: Option<RunnerId>,
    /// Whether the module is serving requests.
    pub ready: bool,
    /// Last recorded error, as `reason: message`.
    pub last_error: Option<String>,
}

/// Receives per-module status records.
pub trait StatusSink: Send + Sync {
    /// Report a module's current status.
    fn report(&self, status: ModuleStatus);
}
