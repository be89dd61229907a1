//! Module and runner registries.
//!
//! This module provides the authoritative in-memory record of every module
//! and runner:
//! - [`State`] and [`TierSet`]: lifecycle state and storage-tier residency
//! - [`ModuleRegistry`]: sharded map of module records with per-module
//!   transition locks
//! - [`RunnerRegistry`]: sharded map of runner records with reserve-then-
//!   commit capacity accounting
//!
//! # Concurrency
//!
//! Different modules' records never block each other: the maps are sharded
//! (`DashMap`) and each record carries its own lock. State transitions are
//! serialized per module through an async transition lock; readers of a
//! record take a short `RwLock` read and never wait on a transition.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use hive_common::error::ConflictError;
use hive_common::{ModuleKey, ModuleSpec, RunnerDefaults};

/// Lifecycle state of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    /// No artifacts exist anywhere.
    Unloaded,
    /// An OCI pull is in flight.
    Fetching,
    /// Bytes persisted to the runner-local disk cache.
    Stored,
    /// Bytes read into memory.
    Loaded,
    /// Compiled to machine code.
    Compiled,
    /// Instantiated and serving requests.
    Running,
    /// Terminal failure. Only a spec update leaves this state.
    Error,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Unloaded => "Unloaded",
            State::Fetching => "Fetching",
            State::Stored => "Stored",
            State::Loaded => "Loaded",
            State::Compiled => "Compiled",
            State::Running => "Running",
            State::Error => "Error",
        };
        write!(f, "{s}")
    }
}

/// A storage tier a module can be resident at.
///
/// Tiers are ordered: a module resident at a tier is also resident at
/// every tier below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Tier {
    /// Bytes on disk.
    Stored,
    /// Bytes in memory.
    Loaded,
    /// Compiled machine code.
    Compiled,
    /// Live instance.
    Running,
}

impl Tier {
    /// All tiers, lowest first.
    pub const ALL: [Tier; 4] = [Tier::Stored, Tier::Loaded, Tier::Compiled, Tier::Running];

    /// Zero-based position of this tier in the warm path.
    pub fn index(self) -> usize {
        match self {
            Tier::Stored => 0,
            Tier::Loaded => 1,
            Tier::Compiled => 2,
            Tier::Running => 3,
        }
    }

    /// The tier one step below, or `None` for `Stored`.
    pub fn below(self) -> Option<Tier> {
        match self {
            Tier::Stored => None,
            Tier::Loaded => Some(Tier::Stored),
            Tier::Compiled => Some(Tier::Loaded),
            Tier::Running => Some(Tier::Compiled),
        }
    }

    /// The lifecycle state of a module whose highest residency is this tier.
    pub fn state(self) -> State {
        match self {
            Tier::Stored => State::Stored,
            Tier::Loaded => State::Loaded,
            Tier::Compiled => State::Compiled,
            Tier::Running => State::Running,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Tier::Stored => "Stored",
            Tier::Loaded => "Loaded",
            Tier::Compiled => "Compiled",
            Tier::Running => "Running",
        };
        write!(f, "{s}")
    }
}

/// The set of tiers a module is resident at.
///
/// Residency is always a prefix of the warm path (a module cannot be
/// `Running` without also being `Compiled`, and so on), so the only
/// mutations offered are promotion to the next tier and demotion of the
/// highest tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TierSet(u8);

impl TierSet {
    /// No residency anywhere.
    pub const EMPTY: TierSet = TierSet(0);

    /// Whether the module is resident at the given tier.
    pub fn contains(self, tier: Tier) -> bool {
        self.0 & (1 << tier.index()) != 0
    }

    /// The highest occupied tier, or `None` when empty.
    pub fn highest(self) -> Option<Tier> {
        Tier::ALL.iter().rev().copied().find(|t| self.contains(*t))
    }

    /// Number of occupied tiers.
    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Whether no tier is occupied.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Residency extended by one tier, returning the tier gained.
    ///
    /// Returns `None` when already at `Running`.
    pub fn promoted(self) -> Option<(TierSet, Tier)> {
        let next = match self.highest() {
            None => Tier::Stored,
            Some(Tier::Running) => return None,
            Some(t) => Tier::ALL[t.index() + 1],
        };
        Some((TierSet(self.0 | (1 << next.index())), next))
    }

    /// Residency reduced by one tier, returning the tier lost.
    ///
    /// Returns `None` when already empty.
    pub fn demoted(self) -> Option<(TierSet, Tier)> {
        let top = self.highest()?;
        Some((TierSet(self.0 & !(1 << top.index())), top))
    }

    /// Iterate over occupied tiers, lowest first.
    pub fn iter(self) -> impl Iterator<Item = Tier> {
        Tier::ALL.into_iter().filter(move |t| self.contains(*t))
    }

    /// Check the prefix property: every occupied tier's predecessor is
    /// occupied too.
    pub fn is_prefix(self) -> bool {
        self.iter()
            .all(|t| t.below().is_none_or(|below| self.contains(below)))
    }
}

/// Recorded detail of a terminal error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorDetail {
    /// Short machine-readable reason, e.g. "CompileError".
    pub reason: String,
    /// Human-readable message.
    pub message: String,
}

/// Identity of a runner process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunnerId(String);

impl RunnerId {
    /// Create a runner id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A module's registry record.
#[derive(Debug, Clone)]
pub struct ModuleRecord {
    /// The module's declared spec.
    pub spec: ModuleSpec,
    /// Incremented on every spec update. An update while in `Error`
    /// starts the new generation from `Unloaded`.
    pub generation: u64,
    /// Current lifecycle state.
    pub state: State,
    /// Current storage-tier residency.
    pub tiers: TierSet,
    /// The runner hosting this module, if placed.
    pub runner: Option<RunnerId>,
    /// Size of the fetched artifact in bytes, 0 until fetched.
    pub artifact_bytes: u64,
    /// Error detail, present only in `Error` state.
    pub error: Option<ErrorDetail>,
}

impl ModuleRecord {
    fn new(spec: ModuleSpec) -> Self {
        Self {
            spec,
            generation: 1,
            state: State::Unloaded,
            tiers: TierSet::EMPTY,
            runner: None,
            artifact_bytes: 0,
            error: None,
        }
    }
}

/// A module's registry entry: the record plus its transition lock.
pub struct ModuleEntry {
    key: ModuleKey,
    record: RwLock<ModuleRecord>,
    transition: tokio::sync::Mutex<()>,
}

impl ModuleEntry {
    /// The module's identity.
    pub fn key(&self) -> &ModuleKey {
        &self.key
    }

    /// Clone the current record.
    pub fn snapshot(&self) -> ModuleRecord {
        self.record.read().clone()
    }

    /// Read the record under the lock.
    pub fn with<R>(&self, f: impl FnOnce(&ModuleRecord) -> R) -> R {
        f(&self.record.read())
    }

    /// Mutate the record under the lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut ModuleRecord) -> R) -> R {
        let mut record = self.record.write();
        let out = f(&mut record);
        debug_assert!(record.tiers.is_prefix());
        out
    }

    /// Acquire the transition lock, waiting for any in-flight transition.
    ///
    /// At most one lifecycle transition runs per module at a time; all
    /// promote and demote paths hold this lock across their collaborator
    /// calls and record updates.
    pub async fn lock_transition(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.transition.lock().await
    }

    /// Acquire the transition lock without waiting.
    ///
    /// Eviction uses this: a module mid-transition is skipped rather than
    /// blocked on.
    pub fn try_lock_transition(&self) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        self.transition.try_lock().ok()
    }
}

impl fmt::Debug for ModuleEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleEntry")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// Authoritative registry of all modules.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: DashMap<ModuleKey, Arc<ModuleEntry>>,
}

impl ModuleRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fresh entry for a newly declared module.
    ///
    /// Replaces any existing entry with the same key.
    pub fn insert(&self, key: ModuleKey, spec: ModuleSpec) -> Arc<ModuleEntry> {
        let entry = Arc::new(ModuleEntry {
            key: key.clone(),
            record: RwLock::new(ModuleRecord::new(spec)),
            transition: tokio::sync::Mutex::new(()),
        });
        self.modules.insert(key, entry.clone());
        entry
    }

    /// Look up a module.
    pub fn get(&self, key: &ModuleKey) -> Option<Arc<ModuleEntry>> {
        self.modules.get(key).map(|e| e.clone())
    }

    /// Remove a module's entry.
    pub fn remove(&self, key: &ModuleKey) -> Option<Arc<ModuleEntry>> {
        self.modules.remove(key).map(|(_, e)| e)
    }

    /// All module keys.
    pub fn keys(&self) -> Vec<ModuleKey> {
        self.modules.iter().map(|e| e.key().clone()).collect()
    }

    /// All entries.
    pub fn entries(&self) -> Vec<Arc<ModuleEntry>> {
        self.modules.iter().map(|e| e.value().clone()).collect()
    }

    /// Number of registered modules.
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("len", &self.modules.len())
            .finish_non_exhaustive()
    }
}

/// Which pool a runner belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerPool {
    /// Shared pool, open to any module without a named runner.
    Default,
    /// Named runner, used only by modules that request it.
    Dedicated(String),
}

/// A runner's declared capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerCapacity {
    /// Memory capacity in bytes.
    pub memory_bytes: u64,
    /// Fuel budget.
    pub fuel_budget: u64,
    /// Maximum hosted modules.
    pub max_modules: u32,
}

impl From<&RunnerDefaults> for RunnerCapacity {
    fn from(defaults: &RunnerDefaults) -> Self {
        Self {
            memory_bytes: defaults.memory_bytes,
            fuel_budget: defaults.fuel_budget,
            max_modules: defaults.max_modules,
        }
    }
}

/// What a module demands from a runner when placed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResourceDemand {
    /// Requested memory in bytes.
    pub memory_bytes: u64,
    /// Requested fuel budget.
    pub fuel: u64,
    /// Ports the module binds.
    pub ports: Vec<u16>,
}

impl ResourceDemand {
    /// Derive the demand from a module spec.
    ///
    /// Modules with no declared CPU request fall back to `default_fuel`.
    pub fn for_spec(spec: &ModuleSpec, default_fuel: u64) -> Self {
        Self {
            memory_bytes: spec.resources.memory_bytes().unwrap_or(0),
            fuel: spec.resources.fuel().unwrap_or(default_fuel),
            ports: spec.bound_ports(),
        }
    }
}

/// A runner's registry record.
#[derive(Debug, Clone)]
pub struct RunnerRecord {
    /// Pool classification.
    pub pool: RunnerPool,
    /// Declared capacity.
    pub capacity: RunnerCapacity,
    /// Committed memory across hosted modules.
    pub memory_committed: u64,
    /// Committed fuel across hosted modules.
    pub fuel_committed: u64,
    /// Volume profile: volume name to host path.
    pub volumes: HashMap<String, String>,
    /// Hosted modules and their reserved demand.
    pub modules: HashMap<ModuleKey, ResourceDemand>,
    /// Ports bound across hosted modules.
    pub ports: HashSet<u16>,
}

impl RunnerRecord {
    /// Whether the runner's profile covers all of the given volume names.
    pub fn has_volumes<'a>(&self, mut names: impl Iterator<Item = &'a str>) -> bool {
        names.all(|n| self.volumes.contains_key(n))
    }

    /// Current load as a fraction of capacity.
    ///
    /// The binding axis is whichever of memory, fuel, or module count is
    /// fullest.
    pub fn load_fraction(&self) -> f64 {
        self.fraction_of(self.memory_committed, self.fuel_committed, self.modules.len())
    }

    /// Load fraction after admitting the given demand.
    pub fn fraction_with(&self, demand: &ResourceDemand) -> f64 {
        self.fraction_of(
            self.memory_committed + demand.memory_bytes,
            self.fuel_committed + demand.fuel,
            self.modules.len() + 1,
        )
    }

    #[allow(clippy::cast_precision_loss)]
    fn fraction_of(&self, memory: u64, fuel: u64, count: usize) -> f64 {
        let mem = if self.capacity.memory_bytes > 0 {
            memory as f64 / self.capacity.memory_bytes as f64
        } else {
            0.0
        };
        let fuel = if self.capacity.fuel_budget > 0 {
            fuel as f64 / self.capacity.fuel_budget as f64
        } else {
            0.0
        };
        let count = if self.capacity.max_modules > 0 {
            count as f64 / f64::from(self.capacity.max_modules)
        } else {
            0.0
        };
        mem.max(fuel).max(count)
    }

    /// Whether the demand fits within remaining capacity.
    pub fn fits(&self, demand: &ResourceDemand) -> bool {
        self.memory_committed + demand.memory_bytes <= self.capacity.memory_bytes
            && self.fuel_committed + demand.fuel <= self.capacity.fuel_budget
            && self.modules.len() < self.capacity.max_modules as usize
    }
}

/// Why a reservation attempt was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveError {
    /// The demand does not fit the runner's remaining capacity.
    Capacity,
    /// Co-location would violate an isolation rule.
    Conflict(ConflictError),
}

/// A runner's registry entry.
pub struct RunnerEntry {
    id: RunnerId,
    seq: u64,
    record: Mutex<RunnerRecord>,
}

impl RunnerEntry {
    /// The runner's identity.
    pub fn id(&self) -> &RunnerId {
        &self.id
    }

    /// Creation sequence number; placement tie-breaks prefer lower.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Read the record under the lock.
    pub fn with<R>(&self, f: impl FnOnce(&RunnerRecord) -> R) -> R {
        f(&self.record.lock())
    }

    /// Clone the current record.
    pub fn snapshot(&self) -> RunnerRecord {
        self.record.lock().clone()
    }

    /// Atomically reserve capacity for a module.
    ///
    /// The capacity check, port check, and the caller-supplied co-location
    /// check against every hosted module all run under the record lock, so
    /// racing reservations serialize here: the loser sees the winner's
    /// commit and retries elsewhere.
    ///
    /// Reserving a module that is already hosted is a no-op.
    pub fn try_reserve(
        &self,
        key: &ModuleKey,
        demand: &ResourceDemand,
        colocation_check: impl Fn(&ModuleKey) -> Result<(), ConflictError>,
    ) -> Result<(), ReserveError> {
        let mut record = self.record.lock();

        if record.modules.contains_key(key) {
            return Ok(());
        }
        if !record.fits(demand) {
            return Err(ReserveError::Capacity);
        }
        for port in &demand.ports {
            if record.ports.contains(port) {
                return Err(ReserveError::Conflict(ConflictError::PortInUse {
                    port: *port,
                }));
            }
        }
        for hosted in record.modules.keys() {
            colocation_check(hosted).map_err(ReserveError::Conflict)?;
        }

        record.memory_committed += demand.memory_bytes;
        record.fuel_committed += demand.fuel;
        record.ports.extend(demand.ports.iter().copied());
        record.modules.insert(key.clone(), demand.clone());
        Ok(())
    }

    /// Release a module's reservation.
    ///
    /// Releasing a module that is not hosted is a no-op.
    pub fn release(&self, key: &ModuleKey) {
        let mut record = self.record.lock();
        if let Some(demand) = record.modules.remove(key) {
            record.memory_committed = record.memory_committed.saturating_sub(demand.memory_bytes);
            record.fuel_committed = record.fuel_committed.saturating_sub(demand.fuel);
            for port in demand.ports {
                record.ports.remove(&port);
            }
        }
    }
}

impl fmt::Debug for RunnerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnerEntry")
            .field("id", &self.id)
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}

/// Authoritative registry of all runners.
#[derive(Default)]
pub struct RunnerRegistry {
    runners: DashMap<RunnerId, Arc<RunnerEntry>>,
    seq: AtomicU64,
}

impl RunnerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new runner.
    ///
    /// Default-pool runners get a generated `runner-{seq}` id; dedicated
    /// runners are identified by their name.
    pub fn create(
        &self,
        pool: RunnerPool,
        capacity: RunnerCapacity,
        volumes: HashMap<String, String>,
    ) -> Arc<RunnerEntry> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let id = match &pool {
            RunnerPool::Default => RunnerId::new(format!("runner-{seq}")),
            RunnerPool::Dedicated(name) => RunnerId::new(name.clone()),
        };
        let entry = Arc::new(RunnerEntry {
            id: id.clone(),
            seq,
            record: Mutex::new(RunnerRecord {
                pool,
                capacity,
                memory_committed: 0,
                fuel_committed: 0,
                volumes,
                modules: HashMap::new(),
                ports: HashSet::new(),
            }),
        });
        self.runners.insert(id, entry.clone());
        entry
    }

    /// Look up a runner.
    pub fn get(&self, id: &RunnerId) -> Option<Arc<RunnerEntry>> {
        self.runners.get(id).map(|e| e.clone())
    }

    /// Remove a runner's entry.
    pub fn remove(&self, id: &RunnerId) -> Option<Arc<RunnerEntry>> {
        self.runners.remove(id).map(|(_, e)| e)
    }

    /// Find a dedicated runner by name.
    pub fn find_dedicated(&self, name: &str) -> Option<Arc<RunnerEntry>> {
        self.runners.iter().find_map(|e| {
            e.with(|r| matches!(&r.pool, RunnerPool::Dedicated(n) if n == name))
                .then(|| e.value().clone())
        })
    }

    /// All entries, ordered by creation sequence.
    pub fn entries(&self) -> Vec<Arc<RunnerEntry>> {
        let mut entries: Vec<_> = self.runners.iter().map(|e| e.value().clone()).collect();
        entries.sort_by_key(|e| e.seq());
        entries
    }

    /// Number of registered runners.
    pub fn len(&self) -> usize {
        self.runners.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }
}

impl fmt::Debug for RunnerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnerRegistry")
            .field("len", &self.runners.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demand(memory: u64) -> ResourceDemand {
        ResourceDemand {
            memory_bytes: memory,
            fuel: 0,
            ports: Vec::new(),
        }
    }

    fn capacity(memory: u64, max_modules: u32) -> RunnerCapacity {
        RunnerCapacity {
            memory_bytes: memory,
            fuel_budget: u64::MAX,
            max_modules,
        }
    }

    #[test]
    fn test_tier_set_promotion_walks_the_warm_path() {
        let mut tiers = TierSet::EMPTY;
        let mut gained = Vec::new();

        while let Some((next, tier)) = tiers.promoted() {
            tiers = next;
            gained.push(tier);
            assert!(tiers.is_prefix());
        }

        assert_eq!(gained, Tier::ALL.to_vec());
        assert_eq!(tiers.highest(), Some(Tier::Running));
        assert!(tiers.promoted().is_none());
    }

    #[test]
    fn test_tier_set_demotion_is_one_step() {
        let mut tiers = TierSet::EMPTY;
        while let Some((next, _)) = tiers.promoted() {
            tiers = next;
        }

        let (tiers, lost) = tiers.demoted().unwrap();
        assert_eq!(lost, Tier::Running);
        assert_eq!(tiers.highest(), Some(Tier::Compiled));
        assert!(tiers.contains(Tier::Stored));
        assert!(tiers.is_prefix());
    }

    #[test]
    fn test_tier_set_empty() {
        assert!(TierSet::EMPTY.is_empty());
        assert!(TierSet::EMPTY.highest().is_none());
        assert!(TierSet::EMPTY.demoted().is_none());
        assert!(TierSet::EMPTY.is_prefix());
    }

    #[test]
    fn test_tier_state_mapping() {
        assert_eq!(Tier::Running.state(), State::Running);
        assert_eq!(Tier::Stored.state(), State::Stored);
        assert_eq!(Tier::Running.below(), Some(Tier::Compiled));
        assert_eq!(Tier::Stored.below(), None);
    }

    #[test]
    fn test_module_registry_insert_get_remove() {
        let registry = ModuleRegistry::new();
        let key = ModuleKey::new("default", "hello");

        let entry = registry.insert(key.clone(), ModuleSpec::default());
        assert_eq!(entry.key(), &key);
        assert_eq!(registry.len(), 1);

        let record = registry.get(&key).unwrap().snapshot();
        assert_eq!(record.state, State::Unloaded);
        assert_eq!(record.generation, 1);
        assert!(record.tiers.is_empty());

        registry.remove(&key);
        assert!(registry.get(&key).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_runner_reserve_and_release() {
        let registry = RunnerRegistry::new();
        let runner = registry.create(RunnerPool::Default, capacity(100, 10), HashMap::new());
        let key = ModuleKey::new("default", "a");

        runner
            .try_reserve(&key, &demand(60), |_| Ok(()))
            .unwrap();
        assert_eq!(runner.with(|r| r.memory_committed), 60);

        // Idempotent for an already-hosted module
        runner
            .try_reserve(&key, &demand(60), |_| Ok(()))
            .unwrap();
        assert_eq!(runner.with(|r| r.memory_committed), 60);

        // A second module that would exceed capacity is refused
        let key_b = ModuleKey::new("default", "b");
        let result = runner.try_reserve(&key_b, &demand(50), |_| Ok(()));
        assert_eq!(result, Err(ReserveError::Capacity));

        runner.release(&key);
        assert_eq!(runner.with(|r| r.memory_committed), 0);
        assert!(runner.with(|r| r.modules.is_empty()));
    }

    #[test]
    fn test_runner_reserve_port_conflict() {
        let registry = RunnerRegistry::new();
        let runner = registry.create(RunnerPool::Default, capacity(100, 10), HashMap::new());

        let with_port = ResourceDemand {
            ports: vec![8080],
            ..Default::default()
        };
        runner
            .try_reserve(&ModuleKey::new("default", "a"), &with_port, |_| Ok(()))
            .unwrap();

        let result = runner.try_reserve(&ModuleKey::new("default", "b"), &with_port, |_| Ok(()));
        assert_eq!(
            result,
            Err(ReserveError::Conflict(ConflictError::PortInUse {
                port: 8080
            }))
        );
    }

    #[test]
    fn test_runner_reserve_colocation_check() {
        let registry = RunnerRegistry::new();
        let runner = registry.create(RunnerPool::Default, capacity(100, 10), HashMap::new());

        runner
            .try_reserve(&ModuleKey::new("default", "a"), &demand(1), |_| Ok(()))
            .unwrap();

        let conflict = ConflictError::VolumeNotShared {
            volume: "pvc-a".into(),
        };
        let result = runner.try_reserve(&ModuleKey::new("default", "b"), &demand(1), |_| {
            Err(conflict.clone())
        });
        assert_eq!(result, Err(ReserveError::Conflict(conflict)));
    }

    #[test]
    fn test_load_fraction_uses_fullest_axis() {
        let registry = RunnerRegistry::new();
        let runner = registry.create(RunnerPool::Default, capacity(100, 4), HashMap::new());

        runner
            .try_reserve(&ModuleKey::new("default", "a"), &demand(10), |_| Ok(()))
            .unwrap();

        // Memory is 10%, but module count is 1/4 = 25%
        let fraction = runner.with(RunnerRecord::load_fraction);
        assert!((fraction - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_dedicated_runner_lookup() {
        let registry = RunnerRegistry::new();
        registry.create(RunnerPool::Default, capacity(100, 4), HashMap::new());
        let dedicated = registry.create(
            RunnerPool::Dedicated("gpu-runner".into()),
            capacity(100, 4),
            HashMap::new(),
        );

        assert_eq!(dedicated.id().as_str(), "gpu-runner");
        assert!(registry.find_dedicated("gpu-runner").is_some());
        assert!(registry.find_dedicated("absent").is_none());
    }

    #[test]
    fn test_runner_entries_ordered_by_seq() {
        let registry = RunnerRegistry::new();
        let first = registry.create(RunnerPool::Default, capacity(1, 1), HashMap::new());
        let second = registry.create(RunnerPool::Default, capacity(1, 1), HashMap::new());

        let entries = registry.entries();
        assert_eq!(entries[0].id(), first.id());
        assert_eq!(entries[1].id(), second.id());
        assert!(entries[0].seq() < entries[1].seq());
    }
}
