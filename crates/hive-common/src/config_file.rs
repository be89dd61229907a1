//! Configuration file structures for hive-runtime.
//!
//! This module defines structures for TOML configuration files:
//! - [`ConfigFile`]: Top-level configuration file structure
//! - [`ServerConfigFile`]: HTTP edge settings
//! - [`AdminConfig`]: Spec-source admin API settings
//! - [`ModuleManifest`]: Module declared at startup

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::RuntimeConfig;
use crate::spec::ModuleSpec;

/// Top-level configuration file structure.
///
/// # Example
///
/// ```toml
/// [runtime.engine]
/// pooling_allocator = true
///
/// [runtime.cache]
/// running_idle_secs = 120
///
/// [server]
/// bind_addr = "0.0.0.0:8080"
/// domain = "wasm.local"
///
/// [admin]
/// enabled = true
/// token = "your-secret-token"
///
/// [[modules]]
/// namespace = "default"
/// name = "hello"
/// spec = { image = "ghcr.io/example/hello:latest" }
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Runtime configuration (engine, lifecycle, scheduler, cache).
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// HTTP edge configuration.
    #[serde(default)]
    pub server: ServerConfigFile,

    /// Admin API configuration.
    #[serde(default)]
    pub admin: AdminConfig,

    /// Modules declared at startup.
    #[serde(default)]
    pub modules: Vec<ModuleManifest>,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigFileError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed as TOML.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })
    }
}

/// HTTP edge configuration from config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfigFile {
    /// Bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "defaults::bind_addr")]
    pub bind_addr: String,

    /// Request timeout in seconds.
    #[serde(default = "defaults::request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Enable graceful shutdown.
    #[serde(default = "defaults::graceful_shutdown")]
    pub graceful_shutdown: bool,

    /// Routing domain: modules serve under `{name}.{namespace}.{domain}`.
    #[serde(default = "defaults::domain")]
    pub domain: String,
}

impl Default for ServerConfigFile {
    fn default() -> Self {
        Self {
            bind_addr: defaults::bind_addr(),
            request_timeout_secs: defaults::request_timeout_secs(),
            graceful_shutdown: defaults::graceful_shutdown(),
            domain: defaults::domain(),
        }
    }
}

/// Admin (spec source) API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdminConfig {
    /// Enable the admin API.
    #[serde(default)]
    pub enabled: bool,

    /// Authentication token (required when enabled).
    ///
    /// Clients must include this token in the `X-Admin-Token` header.
    pub token: Option<String>,

    /// URL prefix for admin API endpoints.
    #[serde(default = "defaults::admin_prefix")]
    pub prefix: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            token: None,
            prefix: defaults::admin_prefix(),
        }
    }
}

impl AdminConfig {
    /// Check if the admin API is properly configured.
    ///
    /// Returns `true` if enabled and a token is set.
    pub fn is_configured(&self) -> bool {
        self.enabled && self.token.is_some()
    }
}

/// A module declared at startup.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModuleManifest {
    /// Module namespace.
    pub namespace: String,

    /// Module name.
    pub name: String,

    /// The module's declared spec.
    pub spec: ModuleSpec,
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },
}

/// Default value functions for serde.
mod defaults {
    pub fn bind_addr() -> String {
        "0.0.0.0:8080".to_string()
    }

    pub const fn request_timeout_secs() -> u64 {
        30
    }

    pub const fn graceful_shutdown() -> bool {
        true
    }

    pub fn domain() -> String {
        "wasm.local".to_string()
    }

    pub fn admin_prefix() -> String {
        "/admin".to_string()
    }
}
