//! hive-runtime CLI entry point.
//!
//! Boots the multi-tenant hosting engine: loads the TOML configuration,
//! declares any startup modules, and runs the HTTP edge.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hive_common::{ConfigFile, ModuleKey};
use hive_server::{HiveServer, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "hive", about = "Multi-tenant WASI-HTTP module hosting engine")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "HIVE_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address, overriding the configuration file.
    #[arg(short, long, env = "HIVE_BIND_ADDR")]
    bind: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,hive=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    info!("Starting hive-runtime");

    let config_file = match &args.config {
        Some(path) => ConfigFile::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ConfigFile::default(),
    };

    let mut server_config = ServerConfig::from_file(&config_file.server)?;
    if let Some(bind) = args.bind {
        server_config = server_config.with_bind_addr(bind);
    }
    if config_file.admin.is_configured() {
        if let Some(token) = &config_file.admin.token {
            server_config = server_config.with_admin_token(token.clone());
            server_config.admin_prefix.clone_from(&config_file.admin.prefix);
        }
    }

    info!(
        bind_addr = %server_config.bind_addr,
        domain = %server_config.domain,
        admin = config_file.admin.is_configured(),
        "Configuration loaded"
    );

    let server = HiveServer::new(&config_file.runtime, server_config)?;

    // Startup modules from the config file
    for manifest in &config_file.modules {
        let key = ModuleKey::new(manifest.namespace.clone(), manifest.name.clone());
        match server
            .state()
            .apply_module(key.clone(), manifest.spec.clone())
            .await
        {
            Ok(()) => info!(module = %key, "Startup module declared"),
            Err(e) => warn!(module = %key, error = %e, "Startup module rejected"),
        }
    }

    info!("Server initialized. Endpoints:");
    info!("  GET  /health      - Health check");
    info!("  GET  /ready       - Readiness check");
    info!("  GET  /runners     - Runner pool inspection");
    info!("  GET  /telemetry   - Per-module counters");
    info!("  ANY  *            - Host-header dispatch to modules");

    server.run().await?;

    Ok(())
}
