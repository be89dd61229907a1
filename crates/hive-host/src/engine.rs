//! Wasmtime engine configuration and creation.
//!
//! The [`WasmEngine`] is shared by every runner in the in-process fleet.
//! It is:
//! - Thread-safe and shared across all requests
//! - Configured with pooling allocator for fast instantiation
//! - Set up with fuel metering and epoch interruption for resource
//!   limiting

use std::sync::Arc;

use tracing::info;
use wasmtime::{Config, Engine, InstanceAllocationStrategy, PoolingAllocationConfig};

use hive_common::{EngineConfig, EngineError};

/// Thread-safe WebAssembly engine wrapper.
///
/// Fuel metering is always enabled: every module's CPU budget derives
/// from its declared resources, so the engine must charge fuel
/// unconditionally.
#[derive(Clone)]
pub struct WasmEngine {
    engine: Arc<Engine>,
    config: EngineConfig,
}

impl WasmEngine {
    /// Create a new WebAssembly engine with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the Wasmtime configuration is invalid or the
    /// pooling allocator cannot be initialized.
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        let mut wasmtime_config = Config::new();

        // Non-blocking host calls and per-request async execution
        wasmtime_config.async_support(true);

        // Deterministic CPU limiting
        wasmtime_config.consume_fuel(true);

        // Time-based interruption as a backup for runaway executions
        if config.epoch_interruption {
            wasmtime_config.epoch_interruption(true);
        }

        wasmtime_config.cranelift_opt_level(wasmtime::OptLevel::Speed);

        if config.pooling_allocator {
            let pooling = Self::create_pooling_config(config);
            wasmtime_config.allocation_strategy(InstanceAllocationStrategy::Pooling(pooling));

            info!(
                max_instances = config.max_instances,
                instance_memory_mb = config.instance_memory_mb,
                "Pooling allocator enabled"
            );
        }

        let engine = Engine::new(&wasmtime_config).map_err(|e| {
            EngineError::invalid_config(format!("Failed to create Wasmtime engine: {e}"))
        })?;

        info!("Wasmtime engine initialized");

        Ok(Self {
            engine: Arc::new(engine),
            config: config.clone(),
        })
    }

    /// Create pooling allocation configuration.
    fn create_pooling_config(config: &EngineConfig) -> PoolingAllocationConfig {
        let mut pooling = PoolingAllocationConfig::default();

        pooling.total_core_instances(config.max_instances);
        pooling.total_memories(config.max_instances);
        pooling.total_tables(config.max_instances);

        let max_memory_bytes = (config.instance_memory_mb as usize) * 1024 * 1024;
        pooling.max_memory_size(max_memory_bytes);

        pooling
    }

    /// Get a reference to the inner Wasmtime engine.
    pub fn inner(&self) -> &Engine {
        &self.engine
    }

    /// Get the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Increment the epoch counter.
    ///
    /// Called periodically (e.g., every 1ms) so epoch deadlines interrupt
    /// long-running executions.
    pub fn increment_epoch(&self) {
        self.engine.increment_epoch();
    }

    /// Check if the pooling allocator is enabled.
    pub fn is_pooling_enabled(&self) -> bool {
        self.config.pooling_allocator
    }
}

impl std::fmt::Debug for WasmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmEngine")
            .field("pooling_allocator", &self.config.pooling_allocator)
            .field("max_instances", &self.config.max_instances)
            .field("instance_memory_mb", &self.config.instance_memory_mb)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_creation_default() {
        let config = EngineConfig::default();
        let engine = WasmEngine::new(&config);

        assert!(engine.is_ok());
        assert!(engine.unwrap().is_pooling_enabled());
    }

    #[test]
    fn test_engine_creation_no_pooling() {
        let config = EngineConfig {
            pooling_allocator: false,
            ..Default::default()
        };
        let engine = WasmEngine::new(&config).unwrap();
        assert!(!engine.is_pooling_enabled());
    }

    #[test]
    fn test_engine_epoch_increment() {
        let config = EngineConfig::default();
        let engine = WasmEngine::new(&config).unwrap();

        // Should not panic
        engine.increment_epoch();
        engine.increment_epoch();
    }
}
