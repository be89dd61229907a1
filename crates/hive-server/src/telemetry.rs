//! Per-module telemetry counters.
//!
//! Counters are keyed by the namespace-qualified module identity, so two
//! modules co-located on one runner never collide.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use hive_common::ModuleKey;

/// Counters for one module.
#[derive(Debug, Default)]
pub struct ModuleCounters {
    /// Requests dispatched to the module.
    pub requests_total: AtomicU64,
    /// Fuel consumed across all requests.
    pub fuel_consumed: AtomicU64,
    /// Milliseconds spent in lazy loads.
    pub load_latency_ms_total: AtomicU64,
    /// Number of lazy loads.
    pub loads_total: AtomicU64,
    /// Traps since the last successful request.
    pub consecutive_traps: AtomicU64,
}

/// Telemetry registry for all modules.
#[derive(Debug, Default)]
pub struct Telemetry {
    counters: DashMap<ModuleKey, Arc<ModuleCounters>>,
}

impl Telemetry {
    /// Create an empty telemetry registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters for a module, created on first use.
    pub fn counters(&self, key: &ModuleKey) -> Arc<ModuleCounters> {
        self.counters
            .entry(key.clone())
            .or_insert_with(|| Arc::new(ModuleCounters::default()))
            .clone()
    }

    /// Record a dispatched request and its fuel cost.
    pub fn record_request(&self, key: &ModuleKey, fuel: u64) {
        let counters = self.counters(key);
        counters.requests_total.fetch_add(1, Ordering::Relaxed);
        counters.fuel_consumed.fetch_add(fuel, Ordering::Relaxed);
    }

    /// Record a successful request, resetting the trap streak.
    pub fn record_success(&self, key: &ModuleKey) {
        self.counters(key)
            .consecutive_traps
            .store(0, Ordering::Relaxed);
    }

    /// Record a trapped request, returning the current streak length.
    pub fn record_trap(&self, key: &ModuleKey) -> u64 {
        self.counters(key)
            .consecutive_traps
            .fetch_add(1, Ordering::Relaxed)
            + 1
    }

    /// Record a completed lazy load.
    pub fn record_load(&self, key: &ModuleKey, latency_ms: u64) {
        let counters = self.counters(key);
        counters.loads_total.fetch_add(1, Ordering::Relaxed);
        counters
            .load_latency_ms_total
            .fetch_add(latency_ms, Ordering::Relaxed);
    }

    /// Drop a removed module's counters.
    pub fn forget(&self, key: &ModuleKey) {
        self.counters.remove(key);
    }

    /// A JSON snapshot of every module's counters, labeled by namespace
    /// and name.
    pub fn snapshot(&self) -> serde_json::Value {
        let modules: Vec<serde_json::Value> = self
            .counters
            .iter()
            .map(|entry| {
                let key = entry.key();
                let counters = entry.value();
                serde_json::json!({
                    "namespace": key.namespace(),
                    "name": key.name(),
                    "requests_total": counters.requests_total.load(Ordering::Relaxed),
                    "fuel_consumed": counters.fuel_consumed.load(Ordering::Relaxed),
                    "loads_total": counters.loads_total.load(Ordering::Relaxed),
                    "load_latency_ms_total":
                        counters.load_latency_ms_total.load(Ordering::Relaxed),
                })
            })
            .collect();
        serde_json::json!({ "modules": modules })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let telemetry = Telemetry::new();
        let key = ModuleKey::new("default", "hello");

        telemetry.record_request(&key, 100);
        telemetry.record_request(&key, 50);
        telemetry.record_load(&key, 12);

        let counters = telemetry.counters(&key);
        assert_eq!(counters.requests_total.load(Ordering::Relaxed), 2);
        assert_eq!(counters.fuel_consumed.load(Ordering::Relaxed), 150);
        assert_eq!(counters.loads_total.load(Ordering::Relaxed), 1);
        assert_eq!(counters.load_latency_ms_total.load(Ordering::Relaxed), 12);
    }

    #[test]
    fn test_same_name_different_namespace_never_collides() {
        let telemetry = Telemetry::new();
        let a = ModuleKey::new("team-a", "api");
        let b = ModuleKey::new("team-b", "api");

        telemetry.record_request(&a, 10);

        assert_eq!(
            telemetry.counters(&a).requests_total.load(Ordering::Relaxed),
            1
        );
        assert_eq!(
            telemetry.counters(&b).requests_total.load(Ordering::Relaxed),
            0
        );
    }

    #[test]
    fn test_trap_streak_resets_on_success() {
        let telemetry = Telemetry::new();
        let key = ModuleKey::new("default", "hello");

        assert_eq!(telemetry.record_trap(&key), 1);
        assert_eq!(telemetry.record_trap(&key), 2);

        telemetry.record_success(&key);
        assert_eq!(telemetry.record_trap(&key), 1);
    }

    #[test]
    fn test_snapshot_shape() {
        let telemetry = Telemetry::new();
        telemetry.record_request(&ModuleKey::new("default", "hello"), 5);

        let snapshot = telemetry.snapshot();
        let modules = snapshot["modules"].as_array().unwrap();
        assert_eq!(modules.len(), 1);
        assert_eq!(modules[0]["namespace"], "default");
        assert_eq!(modules[0]["requests_total"], 1);
    }

    #[test]
    fn test_forget() {
        let telemetry = Telemetry::new();
        let key = ModuleKey::new("default", "hello");
        telemetry.record_request(&key, 5);
        telemetry.forget(&key);

        assert_eq!(
            telemetry.snapshot()["modules"].as_array().unwrap().len(),
            0
        );
    }
}
