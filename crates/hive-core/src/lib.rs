//! Core hosting engine for hive-runtime.
//!
//! This crate provides the algorithmic heart of the system:
//! - [`ModuleRegistry`] / [`RunnerRegistry`]: authoritative records with
//!   per-module transition locks and reserve-then-commit capacity
//! - [`LifecycleController`]: the module state machine driver
//! - [`PlacementScheduler`]: bin-packing placement with volume and
//!   co-location awareness
//! - [`TieredEvictionManager`]: independent per-tier LRU demotion
//! - [`isolation`]: pure volume/port conflict validation
//! - [`control`]: collaborator traits (OCI fetch, runner control, status)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                 LifecycleController                     │
//! │  (Unloaded → Fetching → Stored → Loaded →               │
//! │   Compiled → Running, per-module serialization)         │
//! └───────┬──────────────────┬──────────────────┬───────────┘
//!         │                  │                  │
//!         ▼                  ▼                  ▼
//! ┌───────────────┐ ┌─────────────────┐ ┌───────────────────┐
//! │ Placement     │ │ Tiered Eviction │ │ Collaborators     │
//! │ Scheduler     │ │ Manager         │ │ (OciFetcher,      │
//! │ (+ isolation  │ │ (per-tier LRU,  │ │  RunnerControl,   │
//! │  validation)  │ │  one-step demote│ │  StatusSink)      │
//! └───────┬───────┘ └────────┬────────┘ └───────────────────┘
//!         │                  │
//!         ▼                  ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │          ModuleRegistry / RunnerRegistry                │
//! │  (sharded, per-record locks, tier-prefix invariant)     │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod control;
pub mod eviction;
pub mod isolation;
pub mod lifecycle;
pub mod registry;
pub mod scheduler;

pub use control::{
    InvokeRequest, InvokeResponse, ModuleStatus, OciFetcher, Preopen, RunnerControl, StatusSink,
    WasiParams,
};
pub use eviction::TieredEvictionManager;
pub use lifecycle::LifecycleController;
pub use registry::{
    ModuleEntry, ModuleRecord, ModuleRegistry, ResourceDemand, RunnerCapacity, RunnerEntry,
    RunnerId, RunnerPool, RunnerRecord, RunnerRegistry, State, Tier, TierSet,
};
pub use scheduler::{Placement, PlacementScheduler};
