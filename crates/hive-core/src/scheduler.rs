//! Placement scheduling.
//!
//! The [`PlacementScheduler`] chooses a runner for a module given its
//! resource demand, required volumes, and network policy:
//!
//! 1. A module naming a dedicated runner binds to it, with no fallback.
//! 2. Otherwise default-pool runners are filtered by volume-profile
//!    compatibility and remaining capacity.
//! 3. Candidates are scored: denser runners win (bin packing keeps whole
//!    runners idle for scale-to-zero), with a bonus for co-locating a
//!    module next to one it calls.
//! 4. Ties break deterministically by runner creation order.
//! 5. With no compatible runner, a new one is provisioned with the
//!    smallest volume profile covering the requirement.
//!
//! Reservations are reserve-then-commit under the runner record's lock; a
//! placement that loses a capacity race re-filters and retries.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, instrument};

use hive_common::error::PlacementError;
use hive_common::{EngineError, ModuleKey, ModuleSpec, RunnerDefaults, SchedulerConfig};

use crate::control::RunnerControl;
use crate::isolation;
use crate::registry::{
    ModuleRegistry, ReserveError, ResourceDemand, RunnerEntry, RunnerId, RunnerPool,
    RunnerRegistry,
};

/// The outcome of a successful placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    /// The runner now holding a reservation for the module.
    pub runner: RunnerId,
    /// Whether a new runner was provisioned to host it.
    pub provisioned: bool,
}

/// Chooses a target runner for each module.
pub struct PlacementScheduler {
    modules: Arc<ModuleRegistry>,
    runners: Arc<RunnerRegistry>,
    control: Arc<dyn RunnerControl>,
    config: SchedulerConfig,
    defaults: RunnerDefaults,
    default_fuel: u64,
}

impl PlacementScheduler {
    /// Create a scheduler over the given registries.
    pub fn new(
        modules: Arc<ModuleRegistry>,
        runners: Arc<RunnerRegistry>,
        control: Arc<dyn RunnerControl>,
        config: SchedulerConfig,
        defaults: RunnerDefaults,
        default_fuel: u64,
    ) -> Self {
        Self {
            modules,
            runners,
            control,
            config,
            defaults,
            default_fuel,
        }
    }

    /// Place a module, reserving capacity on the chosen runner.
    #[instrument(skip(self, spec), fields(module = %key))]
    pub async fn place(
        &self,
        key: &ModuleKey,
        spec: &ModuleSpec,
    ) -> Result<Placement, EngineError> {
        self.place_excluding(key, spec, None).await
    }

    /// Place a module anywhere except the given runner.
    ///
    /// Used by the rebalancer: the module is reserved on its new runner
    /// before being evicted from the old one.
    pub async fn place_excluding(
        &self,
        key: &ModuleKey,
        spec: &ModuleSpec,
        exclude: Option<&RunnerId>,
    ) -> Result<Placement, EngineError> {
        let demand = ResourceDemand::for_spec(spec, self.default_fuel);

        if let Some(name) = &spec.runner {
            return self.place_dedicated(key, spec, name, &demand).await;
        }

        self.place_default_pool(key, spec, &demand, exclude).await
    }

    /// Bind a module to its named runner. Hard failure, no fallback.
    async fn place_dedicated(
        &self,
        key: &ModuleKey,
        spec: &ModuleSpec,
        name: &str,
        demand: &ResourceDemand,
    ) -> Result<Placement, EngineError> {
        let (entry, provisioned) = match self.runners.find_dedicated(name) {
            Some(entry) => (entry, false),
            None => {
                let entry = self
                    .provision(RunnerPool::Dedicated(name.to_string()), spec)
                    .await?;
                (entry, true)
            }
        };

        if !entry.with(|r| r.has_volumes(spec.volume_names())) {
            return Err(PlacementError::DedicatedUnsatisfiable {
                runner: name.to_string(),
                reason: "volume profile does not cover the module's mounts".into(),
            }
            .into());
        }

        entry
            .try_reserve(key, demand, self.colocation_check(spec))
            .map_err(|e| PlacementError::DedicatedUnsatisfiable {
                runner: name.to_string(),
                reason: describe_reserve_error(&e),
            })?;

        info!(module = %key, runner = %entry.id(), "Module placed on dedicated runner");
        Ok(Placement {
            runner: entry.id().clone(),
            provisioned,
        })
    }

    /// Filter, score, and reserve within the default pool, provisioning a
    /// new runner when nothing compatible remains.
    async fn place_default_pool(
        &self,
        key: &ModuleKey,
        spec: &ModuleSpec,
        demand: &ResourceDemand,
        exclude: Option<&RunnerId>,
    ) -> Result<Placement, EngineError> {
        for _ in 0..=self.config.placement_retries {
            let candidates = self.candidates(key, spec, demand, exclude);
            let mut lost_race = false;

            for entry in &candidates {
                match entry.try_reserve(key, demand, self.colocation_check(spec)) {
                    Ok(()) => {
                        debug!(module = %key, runner = %entry.id(), "Module placed");
                        return Ok(Placement {
                            runner: entry.id().clone(),
                            provisioned: false,
                        });
                    }
                    Err(ReserveError::Capacity) => lost_race = true,
                    Err(ReserveError::Conflict(_)) => {}
                }
            }

            if lost_race {
                // A racing placement consumed the capacity we filtered on;
                // re-read the pool before provisioning.
                continue;
            }

            let entry = self.provision(RunnerPool::Default, spec).await?;
            return match entry.try_reserve(key, demand, self.colocation_check(spec)) {
                Ok(()) => {
                    info!(module = %key, runner = %entry.id(), "Module placed on new runner");
                    Ok(Placement {
                        runner: entry.id().clone(),
                        provisioned: true,
                    })
                }
                // The demand exceeds even a fresh runner's capacity.
                Err(_) => Err(PlacementError::NoCapacity {
                    module: key.to_string(),
                }
                .into()),
            };
        }

        Err(PlacementError::NoCapacity {
            module: key.to_string(),
        }
        .into())
    }

    /// Compatible default-pool runners, best candidate first.
    fn candidates(
        &self,
        key: &ModuleKey,
        spec: &ModuleSpec,
        demand: &ResourceDemand,
        exclude: Option<&RunnerId>,
    ) -> Vec<Arc<RunnerEntry>> {
        let mut scored: Vec<(Arc<RunnerEntry>, f64)> = self
            .runners
            .entries()
            .into_iter()
            .filter(|entry| Some(entry.id()) != exclude)
            .filter_map(|entry| {
                let score = entry.with(|record| {
                    if !matches!(record.pool, RunnerPool::Default) {
                        return None;
                    }
                    if !record.has_volumes(spec.volume_names()) || !record.fits(demand) {
                        return None;
                    }
                    let mut score = self.config.bin_packing_weight * record.fraction_with(demand);
                    // Affinity targets are named in the module's own namespace
                    if record.modules.keys().any(|hosted| {
                        hosted.namespace() == key.namespace()
                            && spec.colocate_with.iter().any(|n| n == hosted.name())
                    }) {
                        score += self.config.affinity_bonus;
                    }
                    Some(score)
                })?;
                Some((entry, score))
            })
            .collect();

        scored.sort_by(|(a, score_a), (b, score_b)| {
            score_b
                .partial_cmp(score_a)
                .unwrap_or(Ordering::Equal)
                .then(a.seq().cmp(&b.seq()))
        });
        scored.into_iter().map(|(entry, _)| entry).collect()
    }

    /// Provision a runner whose volume profile is the smallest covering
    /// the module's mounts. Volumeless modules get volumeless runners.
    async fn provision(
        &self,
        pool: RunnerPool,
        spec: &ModuleSpec,
    ) -> Result<Arc<RunnerEntry>, EngineError> {
        let volumes: HashMap<String, String> = spec
            .volume_names()
            .map(|name| {
                (
                    name.to_string(),
                    format!("{}/volumes/{name}", self.defaults.data_dir),
                )
            })
            .collect();

        let entry = self
            .runners
            .create(pool, (&self.defaults).into(), volumes);

        if let Err(e) = self.control.provision(entry.id()).await {
            self.runners.remove(entry.id());
            return Err(e);
        }

        info!(runner = %entry.id(), "Runner provisioned");
        Ok(entry)
    }

    /// Co-location check against a hosted module's current spec.
    fn colocation_check<'a>(
        &'a self,
        spec: &'a ModuleSpec,
    ) -> impl Fn(&ModuleKey) -> Result<(), hive_common::ConflictError> + 'a {
        move |hosted| match self.modules.get(hosted) {
            Some(entry) => entry.with(|record| isolation::check_colocation(spec, &record.spec)),
            None => Ok(()),
        }
    }

    /// Release a module's reservation on its runner.
    pub fn release(&self, runner: &RunnerId, key: &ModuleKey) {
        if let Some(entry) = self.runners.get(runner) {
            entry.release(key);
        }
    }

    /// The scheduler's configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Move low-traffic modules off over-committed default-pool runners.
    ///
    /// Each move is place-on-new-runner-then-evict-from-old, so a routing
    /// entry exists at every point in time. Modules mid-transition are
    /// skipped. Returns the number of modules moved.
    #[instrument(skip_all)]
    pub async fn rebalance(&self, lifecycle: &crate::lifecycle::LifecycleController) -> usize {
        let mut moved = 0;

        for entry in self.runners.entries() {
            let over = entry.with(|record| {
                matches!(record.pool, RunnerPool::Default)
                    && record.load_fraction() > self.config.rebalance_threshold
            });
            if !over {
                continue;
            }

            // Smallest reservation first: cheapest to re-place
            let Some(key) = entry.with(|record| {
                record
                    .modules
                    .iter()
                    .min_by_key(|(_, d)| (d.memory_bytes, d.fuel))
                    .map(|(k, _)| k.clone())
            }) else {
                continue;
            };

            let Some(module) = self.modules.get(&key) else {
                continue;
            };
            let spec = module.with(|record| record.spec.clone());

            match self.place_excluding(&key, &spec, Some(entry.id())).await {
                Ok(placement) => {
                    if lifecycle
                        .migrate(&key, entry.id(), &placement.runner)
                        .await
                        .unwrap_or(false)
                    {
                        moved += 1;
                    } else {
                        // Migration was skipped; give back the reservation
                        self.release(&placement.runner, &key);
                    }
                }
                Err(e) => {
                    debug!(module = %key, error = %e, "Rebalance placement failed");
                }
            }
        }

        moved
    }
}

fn describe_reserve_error(e: &ReserveError) -> String {
    match e {
        ReserveError::Capacity => "insufficient capacity".to_string(),
        ReserveError::Conflict(c) => c.to_string(),
    }
}
