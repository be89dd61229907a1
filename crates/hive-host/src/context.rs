//! Per-request execution context and store management.
//!
//! Each request gets a fresh [`Store`] whose context carries the WASI
//! preview1 context built from the module's declared spec: arguments,
//! environment, preopened volume mounts, and the fuel and memory limits
//! derived from its resource requests.
//!
//! The request body is exposed to the guest on stdin; whatever the guest
//! writes to stdout becomes the response body.

use wasmtime::{Store, StoreLimits, StoreLimitsBuilder};
use wasmtime_wasi::pipe::{MemoryInputPipe, MemoryOutputPipe};
use wasmtime_wasi::preview1::WasiP1Ctx;
use wasmtime_wasi::{DirPerms, FilePerms, WasiCtxBuilder};

use hive_common::EngineError;
use hive_core::control::{InvokeRequest, WasiParams};

use crate::engine::WasmEngine;

/// Maximum bytes a guest may write to stdout per request.
const MAX_RESPONSE_BYTES: usize = 4 * 1024 * 1024;

/// Per-request execution context.
///
/// Created for each request and destroyed after execution completes.
pub struct RequestContext {
    /// WASI preview1 context.
    wasi: WasiP1Ctx,

    /// Store limits derived from the module's memory request.
    limits: StoreLimits,

    /// Unique request identifier for tracing.
    pub request_id: String,
}

impl RequestContext {
    /// Access the WASI context; used when linking preview1.
    pub fn wasi(&mut self) -> &mut WasiP1Ctx {
        &mut self.wasi
    }
}

/// Create a store for one request, returning the stdout pipe the
/// response body is read back from.
///
/// # Errors
///
/// Returns an error if a preopened directory cannot be prepared or fuel
/// cannot be set.
pub fn create_store(
    engine: &WasmEngine,
    params: &WasiParams,
    request: &InvokeRequest,
    request_id: String,
    invoke_timeout_ms: u64,
) -> Result<(Store<RequestContext>, MemoryOutputPipe), EngineError> {
    let stdout = MemoryOutputPipe::new(MAX_RESPONSE_BYTES);

    let mut builder = WasiCtxBuilder::new();
    builder
        .stdin(MemoryInputPipe::new(request.body.clone()))
        .stdout(stdout.clone())
        .inherit_stderr()
        .args(&params.args);

    for (name, value) in &params.env {
        builder.env(name, value);
    }
    // The request line travels through the environment
    builder.env("REQUEST_METHOD", &request.method);
    builder.env("REQUEST_PATH", &request.path);

    for preopen in &params.preopens {
        std::fs::create_dir_all(&preopen.host_path)?;
        let (dir_perms, file_perms) = if preopen.read_only {
            (DirPerms::READ, FilePerms::READ)
        } else {
            (DirPerms::all(), FilePerms::all())
        };
        builder
            .preopened_dir(&preopen.host_path, &preopen.guest_path, dir_perms, file_perms)
            .map_err(|e| {
                EngineError::invalid_config(format!(
                    "Failed to preopen '{}': {e}",
                    preopen.host_path
                ))
            })?;
    }

    if params.inherit_network {
        builder.inherit_network();
    }
    builder.allow_ip_name_lookup(params.allow_ip_name_lookup);

    let mut limits = StoreLimitsBuilder::new();
    if let Some(bytes) = params.memory_limit {
        limits = limits.memory_size(usize::try_from(bytes).unwrap_or(usize::MAX));
    }

    let context = RequestContext {
        wasi: builder.build_p1(),
        limits: limits.build(),
        request_id,
    };

    let mut store = Store::new(engine.inner(), context);
    store.limiter(|context| &mut context.limits);

    if let Some(fuel) = params.fuel {
        store
            .set_fuel(fuel)
            .map_err(|e| EngineError::invalid_config(format!("Failed to set fuel: {e}")))?;
    }

    // One epoch tick per millisecond from the background ticker
    if engine.config().epoch_interruption {
        store.set_epoch_deadline(invoke_timeout_ms);
    }

    Ok((store, stdout))
}

/// Get remaining fuel from a store.
pub fn get_remaining_fuel(store: &Store<RequestContext>) -> Option<u64> {
    store.get_fuel().ok()
}

/// Calculate fuel consumed since the store was created.
pub fn calculate_fuel_consumed(initial_fuel: u64, store: &Store<RequestContext>) -> u64 {
    let remaining = get_remaining_fuel(store).unwrap_or(0);
    initial_fuel.saturating_sub(remaining)
}
