//! Collaborator implementations for hive-runtime.
//!
//! This crate provides the host-side implementations of the core's
//! collaborator traits:
//!
//! - [`LocalRunnerFleet`]: in-process Wasmtime-backed runner fleet
//!   implementing the runner control channel
//! - [`RegistryFetcher`]: OCI registry artifact fetcher
//! - [`TracingStatusSink`]: status sink emitting structured log events
//!
//! # Execution Model
//!
//! The fleet shares one Wasmtime engine across all runners. Each module
//! request gets a fresh store with the module's WASI context (args, env,
//! preopened volume mounts) and resource limits (fuel from CPU, linear
//! memory from the memory request).

pub mod artifact;
pub mod context;
pub mod engine;
pub mod fleet;
pub mod oci;
pub mod status;

pub use artifact::CompiledArtifact;
pub use context::RequestContext;
pub use engine::WasmEngine;
pub use fleet::LocalRunnerFleet;
pub use oci::RegistryFetcher;
pub use status::TracingStatusSink;
