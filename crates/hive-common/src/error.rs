//! Error types for hive-runtime.
//!
//! This module defines a hierarchy of error types using `thiserror`:
//! - [`EngineError`]: Top-level errors for the hosting engine
//! - [`FetchError`]: OCI artifact fetch failures (retryable)
//! - [`PlacementError`]: Scheduling failures (retryable condition)
//! - [`ConflictError`]: Volume/port isolation conflicts (admission rejects)
//! - [`InvokeError`]: Per-request execution failures

use std::io;

use thiserror::Error;

/// Top-level engine errors.
///
/// These errors represent failures across the module lifecycle, from
/// placement through fetch, compile, and request dispatch.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The requested module is not known to the registry.
    #[error("Module not found: {module}")]
    ModuleNotFound {
        /// Namespace-qualified module identity.
        module: String,
    },

    /// The requested runner is not known to the registry.
    #[error("Runner not found: {runner}")]
    RunnerNotFound {
        /// Runner identity.
        runner: String,
    },

    /// Fetching the module artifact failed.
    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    /// WebAssembly compilation failed. Always terminal for the module.
    #[error("Compilation failed: {reason}")]
    CompilationFailed {
        /// Description of the compilation failure.
        reason: String,
    },

    /// No runner could host the module.
    #[error("Placement failed: {0}")]
    Placement(#[from] PlacementError),

    /// Volume or port isolation conflict.
    #[error("Conflict: {0}")]
    Conflict(#[from] ConflictError),

    /// A request-scoped execution failure.
    #[error("Invocation failed: {0}")]
    Invoke(#[from] InvokeError),

    /// A lazy load did not reach `Running` within the bound.
    #[error("Module load timeout after {duration_ms}ms: {module}")]
    LoadTimeout {
        /// Namespace-qualified module identity.
        module: String,
        /// The timeout duration in milliseconds.
        duration_ms: u64,
    },

    /// The module is in the terminal `Error` state.
    ///
    /// Only a spec update moves a module out of this state; requests are
    /// answered with a fixed error response and never trigger a load.
    #[error("Module in error state: {module}: {reason}")]
    ModuleInError {
        /// Namespace-qualified module identity.
        module: String,
        /// The recorded error reason.
        reason: String,
    },

    /// The module spec failed admission validation.
    #[error("Invalid module spec: {reason}")]
    InvalidSpec {
        /// Description of the validation failure.
        reason: String,
    },

    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// OCI artifact fetch failures.
///
/// All variants are retried with backoff up to a bounded attempt count
/// before the module is moved to the terminal `Error` state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Registry authentication failed.
    #[error("Authentication failed for image: {image}")]
    AuthFailed {
        /// The image reference that was requested.
        image: String,
    },

    /// The image reference does not exist in the registry.
    #[error("Image not found: {image}")]
    NotFound {
        /// The image reference that was requested.
        image: String,
    },

    /// A network-level failure talking to the registry.
    #[error("Network error fetching {image}: {reason}")]
    Network {
        /// The image reference that was requested.
        image: String,
        /// Description of the network failure.
        reason: String,
    },

    /// The artifact layout is not a single-layer WASM artifact.
    #[error("Bad artifact for {image}: {reason}")]
    BadArtifact {
        /// The image reference that was requested.
        image: String,
        /// Description of the layout problem.
        reason: String,
    },
}

/// Scheduling failures.
///
/// These are surfaced to the spec source as a retryable condition, not as
/// a module-level `Error`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlacementError {
    /// No compatible runner has capacity and provisioning was not possible.
    #[error("No capacity for module {module}")]
    NoCapacity {
        /// Namespace-qualified module identity.
        module: String,
    },

    /// A named runner cannot satisfy the module's declared resources.
    ///
    /// Dedicated placement has no fallback.
    #[error("Dedicated runner '{runner}' cannot host module: {reason}")]
    DedicatedUnsatisfiable {
        /// The named runner.
        runner: String,
        /// Why the runner cannot host the module.
        reason: String,
    },
}

/// Volume or port isolation conflicts.
///
/// Conflicts are rejected before any lifecycle transition begins; the
/// module never leaves `Unloaded`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConflictError {
    /// Two co-located modules reference the same volume without both
    /// opting into sharing.
    #[error("Volume '{volume}' is not shared by both modules")]
    VolumeNotShared {
        /// The contested volume name.
        volume: String,
    },

    /// Two co-located modules bind the same port.
    #[error("Port {port} is already bound on the runner")]
    PortInUse {
        /// The contested port.
        port: u16,
    },
}

/// Per-request execution failures.
///
/// A single trap faults the request; only instance-level corruption
/// faults the module.
#[derive(Error, Debug)]
pub enum InvokeError {
    /// A WebAssembly trap occurred during execution.
    #[error("Wasm trap: {message}")]
    Trap {
        /// Description of the trap.
        message: String,
    },

    /// Execution exhausted the module's fuel budget.
    #[error("Fuel exhausted: CPU limit exceeded")]
    FuelExhausted,

    /// Linear memory allocation exceeded the declared limit.
    #[error("Memory limit exceeded: {limit_bytes} bytes")]
    MemoryLimitExceeded {
        /// The memory limit in bytes.
        limit_bytes: u64,
    },

    /// Execution exceeded the configured timeout.
    #[error("Execution timeout after {duration_ms}ms")]
    Timeout {
        /// The timeout duration in milliseconds.
        duration_ms: u64,
    },
}

impl EngineError {
    /// Create a new `ModuleNotFound` error.
    pub fn module_not_found(module: impl Into<String>) -> Self {
        Self::ModuleNotFound {
            module: module.into(),
        }
    }

    /// Create a new `RunnerNotFound` error.
    pub fn runner_not_found(runner: impl Into<String>) -> Self {
        Self::RunnerNotFound {
            runner: runner.into(),
        }
    }

    /// Create a new `CompilationFailed` error.
    pub fn compilation_failed(reason: impl Into<String>) -> Self {
        Self::CompilationFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `InvalidSpec` error.
    pub fn invalid_spec(reason: impl Into<String>) -> Self {
        Self::InvalidSpec {
            reason: reason.into(),
        }
    }

    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Returns `true` if this error indicates the module was not found.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ModuleNotFound { .. })
    }

    /// Returns `true` if this error is terminal for the module.
    ///
    /// Terminal errors move the module to `Error`; everything else is a
    /// retryable condition or a request-scoped failure.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::CompilationFailed { .. } | Self::ModuleInError { .. }
        )
    }

    /// Returns `true` if this error indicates a resource limit was exceeded.
    pub fn is_resource_limit(&self) -> bool {
        matches!(
            self,
            Self::Invoke(
                InvokeError::FuelExhausted
                    | InvokeError::MemoryLimitExceeded { .. }
                    | InvokeError::Timeout { .. }
            )
        )
    }
}

impl FetchError {
    /// The image reference the failed fetch was for.
    pub fn image(&self) -> &str {
        match self {
            Self::AuthFailed { image }
            | Self::NotFound { image }
            | Self::Network { image, .. }
            | Self::BadArtifact { image, .. } => image,
        }
    }

    /// A short machine-readable reason for status reporting.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::AuthFailed { .. } => "AuthFailed",
            Self::NotFound { .. } => "NotFound",
            Self::Network { .. } => "NetworkError",
            Self::BadArtifact { .. } => "BadArtifact",
        }
    }
}
