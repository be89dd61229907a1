//! HTTP edge for hive-runtime.
//!
//! This crate provides the request-facing surface of the hosting engine:
//!
//! - Host-header dispatch with copy-on-write routing snapshots
//! - Lazy just-in-time loading of cold modules, bounded by a timeout
//! - The spec-source admin API the external reconciler drives
//! - Per-module telemetry counters
//! - Health and readiness checks
//!
//! # Quick Start
//!
//! ```ignore
//! use hive_common::RuntimeConfig;
//! use hive_server::{HiveServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime_config = RuntimeConfig::default();
//!     let server_config = ServerConfig::default().with_admin_token("secret");
//!
//!     let server = HiveServer::new(&runtime_config, server_config)?;
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod admin;
pub mod dispatch;
pub mod router;
pub mod routing;
pub mod server;
pub mod state;
pub mod telemetry;

pub use router::{AdminRouterConfig, build_router, build_router_with_admin};
pub use routing::{RoutingEntry, RoutingPublisher, RoutingTable};
pub use server::{HiveServer, ServerConfig, TestHandle};
pub use state::AppState;
pub use telemetry::Telemetry;
