//! Host-header routing table.
//!
//! The dispatch table maps a request's Host header to the module serving
//! that hostname. Publication is copy-on-write: a placement change builds
//! a fresh immutable [`RoutingTable`] and swaps it in atomically, so
//! readers always observe a fully-formed prior or current snapshot and
//! never block on writers.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use hive_common::ModuleKey;
use hive_core::registry::{ModuleRegistry, RunnerId};

/// One dispatch entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingEntry {
    /// The module serving this hostname.
    pub module: ModuleKey,
    /// The module's runner at publication time; unplaced modules route
    /// with no runner and are placed on first access.
    pub runner: Option<RunnerId>,
}

/// An immutable dispatch snapshot.
#[derive(Debug, Default)]
pub struct RoutingTable {
    entries: HashMap<String, RoutingEntry>,
}

impl RoutingTable {
    /// Build a table from the current registry contents.
    pub fn from_registry(modules: &ModuleRegistry, domain: &str) -> Self {
        let mut entries = HashMap::new();
        for entry in modules.entries() {
            let hostname = entry.key().hostname(domain);
            let runner = entry.with(|record| record.runner.clone());
            entries.insert(
                hostname,
                RoutingEntry {
                    module: entry.key().clone(),
                    runner,
                },
            );
        }
        Self { entries }
    }

    /// Look up the entry for a normalized hostname.
    pub fn lookup(&self, hostname: &str) -> Option<&RoutingEntry> {
        self.entries.get(hostname)
    }

    /// Number of routable hostnames.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Publishes routing snapshots.
#[derive(Default)]
pub struct RoutingPublisher {
    current: RwLock<Arc<RoutingTable>>,
}

impl RoutingPublisher {
    /// Create a publisher with an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current snapshot. Requests hold this across their whole
    /// dispatch and are unaffected by concurrent republication.
    pub fn snapshot(&self) -> Arc<RoutingTable> {
        self.current.read().clone()
    }

    /// Atomically publish a new table.
    pub fn publish(&self, table: RoutingTable) {
        let table = Arc::new(table);
        debug!(entries = table.len(), "Routing table published");
        *self.current.write() = table;
    }

    /// Rebuild and publish from the registry.
    pub fn rebuild(&self, modules: &ModuleRegistry, domain: &str) {
        self.publish(RoutingTable::from_registry(modules, domain));
    }
}

/// Strip a port suffix from a Host header value.
pub fn normalize_host(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port)) if port.parse::<u16>().is_ok() => name,
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_common::ModuleSpec;

    fn spec() -> ModuleSpec {
        ModuleSpec {
            image: "ghcr.io/example/m:latest".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("api.prod.wasm.local"), "api.prod.wasm.local");
        assert_eq!(normalize_host("api.prod.wasm.local:8080"), "api.prod.wasm.local");
        assert_eq!(normalize_host("api.prod.wasm.local:bogus"), "api.prod.wasm.local:bogus");
    }

    #[test]
    fn test_table_from_registry() {
        let modules = ModuleRegistry::new();
        modules.insert(ModuleKey::new("prod", "api"), spec());
        modules.insert(ModuleKey::new("default", "hello"), spec());

        let table = RoutingTable::from_registry(&modules, "wasm.local");
        assert_eq!(table.len(), 2);

        let entry = table.lookup("api.prod.wasm.local").unwrap();
        assert_eq!(entry.module, ModuleKey::new("prod", "api"));
        assert!(entry.runner.is_none());

        assert!(table.lookup("missing.prod.wasm.local").is_none());
    }

    #[test]
    fn test_snapshot_survives_republication() {
        let modules = ModuleRegistry::new();
        modules.insert(ModuleKey::new("default", "hello"), spec());

        let publisher = RoutingPublisher::new();
        publisher.rebuild(&modules, "wasm.local");

        let old = publisher.snapshot();
        assert_eq!(old.len(), 1);

        // A republication after module removal does not disturb the held
        // snapshot
        modules.remove(&ModuleKey::new("default", "hello"));
        publisher.rebuild(&modules, "wasm.local");

        assert_eq!(old.len(), 1);
        assert!(old.lookup("hello.default.wasm.local").is_some());
        assert!(publisher.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_readers_see_whole_tables() {
        let modules = Arc::new(ModuleRegistry::new());
        for i in 0..16 {
            modules.insert(ModuleKey::new("default", format!("m{i}")), spec());
        }
        let publisher = Arc::new(RoutingPublisher::new());
        publisher.rebuild(&modules, "wasm.local");

        let writer = {
            let publisher = publisher.clone();
            let modules = modules.clone();
            tokio::spawn(async move {
                for _ in 0..100 {
                    publisher.rebuild(&modules, "wasm.local");
                    tokio::task::yield_now().await;
                }
            })
        };

        for _ in 0..100 {
            // Never a torn table: every snapshot is fully formed
            let snapshot = publisher.snapshot();
            assert_eq!(snapshot.len(), 16);
            tokio::task::yield_now().await;
        }

        writer.await.unwrap();
    }
}
