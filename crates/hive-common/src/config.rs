//! Configuration structures for hive-runtime.
//!
//! This module defines configuration options for the core components:
//! - [`RuntimeConfig`]: Top-level configuration containing all settings
//! - [`EngineConfig`]: Wasmtime engine settings (pooling, epochs)
//! - [`LifecycleConfig`]: Fetch/load bounds and retry policy
//! - [`SchedulerConfig`]: Placement scoring weights
//! - [`CacheConfig`]: Per-tier eviction limits
//! - [`RunnerDefaults`]: Capacity profile for provisioned runners

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level runtime configuration.
///
/// This structure contains all configuration options for the hosting
/// engine. It can be loaded from files (TOML) or environment variables.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Wasmtime engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Lifecycle controller configuration.
    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    /// Placement scheduler configuration.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Tiered eviction configuration.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Capacity profile applied to newly provisioned runners.
    #[serde(default)]
    pub runner: RunnerDefaults,
}

/// Wasmtime engine configuration.
///
/// These settings affect the shared Wasmtime engine behavior, including
/// memory allocation strategy and interruption.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Enable pooling allocator for high-performance instance creation.
    #[serde(default = "defaults::pooling_allocator")]
    pub pooling_allocator: bool,

    /// Maximum concurrent instances in the pool.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::max_instances")]
    pub max_instances: u32,

    /// Memory per instance slot in megabytes.
    #[serde(default = "defaults::instance_memory_mb")]
    pub instance_memory_mb: u32,

    /// Enable epoch-based interruption.
    ///
    /// This allows interrupting long-running executions based on time
    /// rather than fuel consumption.
    #[serde(default = "defaults::epoch_interruption")]
    pub epoch_interruption: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pooling_allocator: defaults::pooling_allocator(),
            max_instances: defaults::max_instances(),
            instance_memory_mb: defaults::instance_memory_mb(),
            epoch_interruption: defaults::epoch_interruption(),
        }
    }
}

/// Lifecycle controller configuration.
///
/// Bounds for artifact fetches and lazy loads, plus the retry policy for
/// transient fetch failures.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LifecycleConfig {
    /// Timeout for a single OCI fetch attempt in milliseconds.
    #[serde(default = "defaults::fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,

    /// Number of fetch attempts before the module moves to `Error`.
    #[serde(default = "defaults::fetch_attempts")]
    pub fetch_attempts: u32,

    /// Base backoff between fetch attempts in milliseconds. The delay
    /// doubles with each retry.
    #[serde(default = "defaults::fetch_backoff_ms")]
    pub fetch_backoff_ms: u64,

    /// How long a request may wait for a lazy load to reach `Running`.
    #[serde(default = "defaults::load_timeout_ms")]
    pub load_timeout_ms: u64,

    /// Per-request execution timeout in milliseconds.
    #[serde(default = "defaults::invoke_timeout_ms")]
    pub invoke_timeout_ms: u64,

    /// Fuel granted to modules with no declared CPU request.
    #[serde(default = "defaults::default_fuel")]
    pub default_fuel: u64,

    /// Consecutive request traps before the module itself is faulted.
    ///
    /// A single trap faults only the request; this threshold catches a
    /// corrupted instance. Zero disables module faulting.
    #[serde(default = "defaults::max_consecutive_traps")]
    pub max_consecutive_traps: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_ms: defaults::fetch_timeout_ms(),
            fetch_attempts: defaults::fetch_attempts(),
            fetch_backoff_ms: defaults::fetch_backoff_ms(),
            load_timeout_ms: defaults::load_timeout_ms(),
            invoke_timeout_ms: defaults::invoke_timeout_ms(),
            default_fuel: defaults::default_fuel(),
            max_consecutive_traps: defaults::max_consecutive_traps(),
        }
    }
}

impl LifecycleConfig {
    /// Get the lazy-load timeout as a `Duration`.
    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    /// Get the per-attempt fetch timeout as a `Duration`.
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

/// Placement scheduler configuration.
///
/// The scoring weights are policy knobs; the defaults keep runners dense
/// with a mild preference for co-locating callers with callees.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    /// Weight of the bin-packing term (resulting load fraction).
    #[serde(default = "defaults::bin_packing_weight")]
    pub bin_packing_weight: f64,

    /// Bonus added when a candidate runner hosts a module this module
    /// declares it calls.
    #[serde(default = "defaults::affinity_bonus")]
    pub affinity_bonus: f64,

    /// Load fraction above which the rebalancer considers a runner
    /// over-committed.
    #[serde(default = "defaults::rebalance_threshold")]
    pub rebalance_threshold: f64,

    /// How many times a racing placement retries after losing a
    /// reservation before giving up.
    #[serde(default = "defaults::placement_retries")]
    pub placement_retries: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            bin_packing_weight: defaults::bin_packing_weight(),
            affinity_bonus: defaults::affinity_bonus(),
            rebalance_threshold: defaults::rebalance_threshold(),
            placement_retries: defaults::placement_retries(),
        }
    }
}

/// Per-tier residency limit.
///
/// `None` means unlimited along that axis.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
pub struct TierLimit {
    /// Maximum number of modules resident at this tier.
    #[serde(default)]
    pub max_count: Option<usize>,

    /// Maximum total artifact bytes resident at this tier.
    #[serde(default)]
    pub max_bytes: Option<u64>,
}

impl TierLimit {
    /// A limit on resident count only.
    pub fn count(max_count: usize) -> Self {
        Self {
            max_count: Some(max_count),
            max_bytes: None,
        }
    }
}

/// Tiered eviction configuration.
///
/// Each tier has an independent limit; the eviction sweep demotes the
/// least-recently-used resident of an over-limit tier one step at a time.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Limit for instantiated modules.
    #[serde(default = "defaults::running_limit")]
    pub running: TierLimit,

    /// Limit for compiled machine code.
    #[serde(default = "defaults::compiled_limit")]
    pub compiled: TierLimit,

    /// Limit for in-memory module bytes.
    #[serde(default = "defaults::loaded_limit")]
    pub loaded: TierLimit,

    /// Limit for on-disk module bytes.
    #[serde(default)]
    pub stored: TierLimit,

    /// Idle time after which a `Running` module is demoted to `Compiled`,
    /// in seconds. Zero disables idle demotion.
    #[serde(default = "defaults::running_idle_secs")]
    pub running_idle_secs: u64,

    /// Interval between eviction sweeps in seconds.
    #[serde(default = "defaults::sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            running: defaults::running_limit(),
            compiled: defaults::compiled_limit(),
            loaded: defaults::loaded_limit(),
            stored: TierLimit::default(),
            running_idle_secs: defaults::running_idle_secs(),
            sweep_interval_secs: defaults::sweep_interval_secs(),
        }
    }
}

impl CacheConfig {
    /// Get the sweep interval as a `Duration`.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Get the running-tier idle timeout, or `None` when disabled.
    pub fn running_idle(&self) -> Option<Duration> {
        (self.running_idle_secs > 0).then(|| Duration::from_secs(self.running_idle_secs))
    }
}

/// Capacity profile applied to newly provisioned runners.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunnerDefaults {
    /// Memory capacity per runner in bytes.
    #[serde(default = "defaults::runner_memory_bytes")]
    pub memory_bytes: u64,

    /// Fuel budget per runner.
    #[serde(default = "defaults::runner_fuel_budget")]
    pub fuel_budget: u64,

    /// Maximum modules hosted per runner.
    #[serde(default = "defaults::runner_max_modules")]
    pub max_modules: u32,

    /// Base directory for runner-local artifact caches.
    #[serde(default = "defaults::data_dir")]
    pub data_dir: String,

    /// Whether `Stored`-tier bytes live on storage that survives a
    /// runner crash. Crashed runners' modules resume from `Stored` when
    /// true, from `Unloaded` otherwise.
    #[serde(default)]
    pub shared_artifact_store: bool,
}

impl Default for RunnerDefaults {
    fn default() -> Self {
        Self {
            memory_bytes: defaults::runner_memory_bytes(),
            fuel_budget: defaults::runner_fuel_budget(),
            max_modules: defaults::runner_max_modules(),
            data_dir: defaults::data_dir(),
            shared_artifact_store: false,
        }
    }
}

/// Default value functions for serde.
mod defaults {
    use super::TierLimit;

    pub const fn pooling_allocator() -> bool {
        true
    }

    pub const fn max_instances() -> u32 {
        1000
    }

    pub const fn instance_memory_mb() -> u32 {
        64
    }

    pub const fn epoch_interruption() -> bool {
        true
    }

    pub const fn fetch_timeout_ms() -> u64 {
        30_000
    }

    pub const fn fetch_attempts() -> u32 {
        3
    }

    pub const fn fetch_backoff_ms() -> u64 {
        500
    }

    pub const fn load_timeout_ms() -> u64 {
        60_000
    }

    pub const fn invoke_timeout_ms() -> u64 {
        100
    }

    pub const fn default_fuel() -> u64 {
        10_000_000
    }

    pub const fn max_consecutive_traps() -> u32 {
        5
    }

    pub const fn bin_packing_weight() -> f64 {
        1.0
    }

    pub const fn affinity_bonus() -> f64 {
        0.25
    }

    pub const fn rebalance_threshold() -> f64 {
        0.9
    }

    pub const fn placement_retries() -> u32 {
        8
    }

    pub const fn running_limit() -> TierLimit {
        TierLimit {
            max_count: Some(256),
            max_bytes: None,
        }
    }

    pub const fn compiled_limit() -> TierLimit {
        TierLimit {
            max_count: Some(512),
            max_bytes: None,
        }
    }

    pub const fn loaded_limit() -> TierLimit {
        TierLimit {
            max_count: Some(1024),
            max_bytes: Some(1 << 30),
        }
    }

    pub const fn running_idle_secs() -> u64 {
        300
    }

    pub const fn sweep_interval_secs() -> u64 {
        10
    }

    pub const fn runner_memory_bytes() -> u64 {
        512 * 1024 * 1024
    }

    pub const fn runner_fuel_budget() -> u64 {
        10_000_000_000
    }

    pub const fn runner_max_modules() -> u32 {
        64
    }

    pub fn data_dir() -> String {
        "./data".to_string()
    }
}
