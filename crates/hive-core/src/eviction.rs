//! Tiered eviction management.
//!
//! Each storage tier (`Stored`, `Loaded`, `Compiled`, `Running`) keeps an
//! independent LRU order and an independently configured limit. An access
//! refreshes the module's position in every tier it occupies. When a tier
//! exceeds its limit, the least-recently-used resident is demoted exactly
//! one step; the `Running` tier additionally demotes residents idle past
//! the configured timeout.
//!
//! All demotions flow through here. The sweep skips modules whose
//! transition lock is held, so eviction never blocks the request path.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, instrument};

use hive_common::{CacheConfig, ModuleKey, TierLimit};

use crate::lifecycle::LifecycleController;
use crate::registry::Tier;

/// A module's residency record within one tier.
#[derive(Debug, Clone)]
struct Residency {
    /// Monotonic access stamp; lower is older.
    stamp: u64,
    /// Wall-clock time of the last access, for idle demotion.
    touched: Instant,
    /// Artifact bytes attributed to this residency.
    bytes: u64,
}

/// One tier's LRU bookkeeping.
#[derive(Debug, Default)]
struct TierState {
    entries: HashMap<ModuleKey, Residency>,
    total_bytes: u64,
}

impl TierState {
    fn insert(&mut self, key: ModuleKey, residency: Residency) {
        self.total_bytes += residency.bytes;
        if let Some(old) = self.entries.insert(key, residency) {
            self.total_bytes = self.total_bytes.saturating_sub(old.bytes);
        }
    }

    fn remove(&mut self, key: &ModuleKey) {
        if let Some(old) = self.entries.remove(key) {
            self.total_bytes = self.total_bytes.saturating_sub(old.bytes);
        }
    }

    /// The least-recently-used resident not in `skip`.
    fn lru(&self, skip: &HashSet<ModuleKey>) -> Option<ModuleKey> {
        self.entries
            .iter()
            .filter(|(k, _)| !skip.contains(*k))
            .min_by_key(|(_, r)| r.stamp)
            .map(|(k, _)| k.clone())
    }

    fn over_limit(&self, limit: &TierLimit) -> bool {
        if let Some(max) = limit.max_count {
            if self.entries.len() > max {
                return true;
            }
        }
        if let Some(max) = limit.max_bytes {
            if self.total_bytes > max {
                return true;
            }
        }
        false
    }
}

/// Maintains per-tier LRU order and drives demotions under pressure.
pub struct TieredEvictionManager {
    tiers: [Mutex<TierState>; 4],
    clock: AtomicU64,
    config: CacheConfig,
}

impl TieredEvictionManager {
    /// Create an eviction manager with the given limits.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            tiers: [
                Mutex::new(TierState::default()),
                Mutex::new(TierState::default()),
                Mutex::new(TierState::default()),
                Mutex::new(TierState::default()),
            ],
            clock: AtomicU64::new(0),
            config,
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Record that a module became resident at a tier.
    pub fn note_resident(&self, key: &ModuleKey, tier: Tier, bytes: u64) {
        let stamp = self.tick();
        self.tiers[tier.index()].lock().insert(
            key.clone(),
            Residency {
                stamp,
                touched: Instant::now(),
                bytes,
            },
        );
    }

    /// Record that a module left a tier.
    pub fn note_departed(&self, key: &ModuleKey, tier: Tier) {
        self.tiers[tier.index()].lock().remove(key);
    }

    /// Drop a module from every tier.
    pub fn forget(&self, key: &ModuleKey) {
        for tier in Tier::ALL {
            self.tiers[tier.index()].lock().remove(key);
        }
    }

    /// Refresh a module's position in every tier it occupies.
    pub fn touch(&self, key: &ModuleKey) {
        let stamp = self.tick();
        let now = Instant::now();
        for tier in Tier::ALL {
            let mut state = self.tiers[tier.index()].lock();
            if let Some(residency) = state.entries.get_mut(key) {
                residency.stamp = stamp;
                residency.touched = now;
            }
        }
    }

    /// Number of residents at a tier.
    pub fn residents(&self, tier: Tier) -> usize {
        self.tiers[tier.index()].lock().entries.len()
    }

    /// Total bytes attributed to a tier.
    pub fn tier_bytes(&self, tier: Tier) -> u64 {
        self.tiers[tier.index()].lock().total_bytes
    }

    fn limit(&self, tier: Tier) -> &TierLimit {
        match tier {
            Tier::Stored => &self.config.stored,
            Tier::Loaded => &self.config.loaded,
            Tier::Compiled => &self.config.compiled,
            Tier::Running => &self.config.running,
        }
    }

    /// The next demotion victim at a tier, honoring the skip set.
    ///
    /// A victim exists while the tier is over its limit, or (for
    /// `Running`) while its LRU resident has been idle past the timeout.
    fn victim(&self, tier: Tier, skip: &HashSet<ModuleKey>) -> Option<ModuleKey> {
        let state = self.tiers[tier.index()].lock();

        if state.over_limit(self.limit(tier)) {
            return state.lru(skip);
        }

        if tier == Tier::Running {
            if let Some(idle) = self.config.running_idle() {
                return state
                    .entries
                    .iter()
                    .filter(|(k, _)| !skip.contains(*k))
                    .filter(|(_, r)| r.touched.elapsed() >= idle)
                    .min_by_key(|(_, r)| r.stamp)
                    .map(|(k, _)| k.clone());
            }
        }

        None
    }

    /// Run one eviction sweep, demoting over-limit residents one step at
    /// a time. Returns the number of demotions performed.
    ///
    /// Tiers are processed top down so a module demoted out of `Running`
    /// can be considered for `Compiled` pressure within the same sweep.
    /// Modules mid-transition are skipped, never waited on.
    #[instrument(skip_all)]
    pub async fn sweep(&self, lifecycle: &LifecycleController) -> usize {
        let mut demoted = 0;

        for tier in Tier::ALL.into_iter().rev() {
            let mut skip: HashSet<ModuleKey> = HashSet::new();

            while let Some(key) = self.victim(tier, &skip) {
                match lifecycle.demote_one(&key, tier).await {
                    Ok(true) => {
                        demoted += 1;
                        debug!(module = %key, tier = %tier, "Module demoted");
                    }
                    Ok(false) | Err(_) => {
                        // Mid-transition or already moved; leave it alone
                        // until the next sweep
                        skip.insert(key);
                    }
                }
            }
        }

        demoted
    }
}

impl std::fmt::Debug for TieredEvictionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("TieredEvictionManager");
        for tier in Tier::ALL {
            s.field(
                match tier {
                    Tier::Stored => "stored",
                    Tier::Loaded => "loaded",
                    Tier::Compiled => "compiled",
                    Tier::Running => "running",
                },
                &self.residents(tier),
            );
        }
        s.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> ModuleKey {
        ModuleKey::new("default", name)
    }

    fn manager(running_max: usize) -> TieredEvictionManager {
        TieredEvictionManager::new(CacheConfig {
            running: TierLimit::count(running_max),
            running_idle_secs: 0,
            ..Default::default()
        })
    }

    #[test]
    fn test_residency_bookkeeping() {
        let manager = manager(2);
        let a = key("a");

        manager.note_resident(&a, Tier::Stored, 100);
        manager.note_resident(&a, Tier::Loaded, 100);
        assert_eq!(manager.residents(Tier::Stored), 1);
        assert_eq!(manager.residents(Tier::Loaded), 1);
        assert_eq!(manager.tier_bytes(Tier::Stored), 100);

        manager.note_departed(&a, Tier::Loaded);
        assert_eq!(manager.residents(Tier::Loaded), 0);
        assert_eq!(manager.residents(Tier::Stored), 1);

        manager.forget(&a);
        assert_eq!(manager.residents(Tier::Stored), 0);
        assert_eq!(manager.tier_bytes(Tier::Stored), 0);
    }

    #[test]
    fn test_victim_is_lru() {
        let manager = manager(1);

        manager.note_resident(&key("old"), Tier::Running, 0);
        manager.note_resident(&key("new"), Tier::Running, 0);

        // Two residents against a limit of one: the older is the victim
        let victim = manager.victim(Tier::Running, &HashSet::new()).unwrap();
        assert_eq!(victim, key("old"));

        // Touching refreshes position: now "new" is the LRU
        manager.touch(&key("old"));
        let victim = manager.victim(Tier::Running, &HashSet::new()).unwrap();
        assert_eq!(victim, key("new"));
    }

    #[test]
    fn test_no_victim_under_limit() {
        let manager = manager(2);
        manager.note_resident(&key("a"), Tier::Running, 0);
        manager.note_resident(&key("b"), Tier::Running, 0);

        assert!(manager.victim(Tier::Running, &HashSet::new()).is_none());
    }

    #[test]
    fn test_victim_honors_skip_set() {
        let manager = manager(1);
        manager.note_resident(&key("a"), Tier::Running, 0);
        manager.note_resident(&key("b"), Tier::Running, 0);

        let skip = HashSet::from([key("a")]);
        let victim = manager.victim(Tier::Running, &skip).unwrap();
        assert_eq!(victim, key("b"));

        let skip = HashSet::from([key("a"), key("b")]);
        assert!(manager.victim(Tier::Running, &skip).is_none());
    }

    #[test]
    fn test_byte_limit_triggers_victim() {
        let manager = TieredEvictionManager::new(CacheConfig {
            loaded: TierLimit {
                max_count: None,
                max_bytes: Some(150),
            },
            ..Default::default()
        });

        manager.note_resident(&key("a"), Tier::Loaded, 100);
        assert!(manager.victim(Tier::Loaded, &HashSet::new()).is_none());

        manager.note_resident(&key("b"), Tier::Loaded, 100);
        let victim = manager.victim(Tier::Loaded, &HashSet::new()).unwrap();
        assert_eq!(victim, key("a"));
    }

    #[test]
    fn test_idle_running_victim() {
        let manager = TieredEvictionManager::new(CacheConfig {
            running: TierLimit::default(),
            running_idle_secs: 0,
            ..Default::default()
        });
        manager.note_resident(&key("a"), Tier::Running, 0);

        // Idle demotion disabled: no victim even though the entry is idle
        assert!(manager.victim(Tier::Running, &HashSet::new()).is_none());
    }

    #[test]
    fn test_rebecoming_resident_replaces_stamp() {
        let manager = manager(1);
        manager.note_resident(&key("a"), Tier::Running, 0);
        manager.note_resident(&key("b"), Tier::Running, 0);
        // Re-registering "a" makes it most recent
        manager.note_resident(&key("a"), Tier::Running, 0);

        let victim = manager.victim(Tier::Running, &HashSet::new()).unwrap();
        assert_eq!(victim, key("b"));
    }
}
