//! Common types, errors, and utilities for hive-runtime.
//!
//! This crate provides shared functionality used across the hive-runtime
//! workspace:
//! - Error taxonomy using `thiserror` for type-safe error handling
//! - Configuration structures for engine, lifecycle, scheduler, and cache
//! - Module specification value types (identity, mounts, network policy,
//!   resource requests)

pub mod config;
pub mod config_file;
pub mod error;
pub mod spec;

pub use config::{
    CacheConfig, EngineConfig, LifecycleConfig, RunnerDefaults, RuntimeConfig, SchedulerConfig,
    TierLimit,
};
pub use config_file::{AdminConfig, ConfigFile, ModuleManifest, ServerConfigFile};
pub use error::{ConflictError, EngineError, FetchError, InvokeError, PlacementError};
pub use spec::{
    EnvVar, ModuleKey, ModuleSpec, NetworkPolicy, ResourceRequest, TcpRules, UdpRules,
    VolumeDeclaration,
};
