//! Module lifecycle control.
//!
//! The [`LifecycleController`] drives each module through
//! `Unloaded → Fetching → Stored → Loaded → Compiled → Running`,
//! consulting the scheduler for placement and the collaborators for every
//! side effect. Forward transitions are idempotent; demotions are driven
//! exclusively by the eviction manager through [`demote_one`].
//!
//! Per-module transitions are serialized by the entry's transition lock:
//! concurrent requests for the same cold module coalesce onto the single
//! in-flight load, and a deleted spec waits for the in-flight operation
//! to finish before teardown.
//!
//! [`demote_one`]: LifecycleController::demote_one

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};

use hive_common::{
    EngineError, FetchError, LifecycleConfig, ModuleKey, ModuleSpec, RunnerDefaults,
};

use crate::control::{ModuleStatus, OciFetcher, RunnerControl, StatusSink, WasiParams};
use crate::eviction::TieredEvictionManager;
use crate::isolation;
use crate::registry::{
    ErrorDetail, ModuleEntry, ModuleRecord, ModuleRegistry, RunnerId, RunnerRegistry, State, Tier,
    TierSet,
};
use crate::scheduler::PlacementScheduler;

/// Drives module state machines.
pub struct LifecycleController {
    modules: Arc<ModuleRegistry>,
    runners: Arc<RunnerRegistry>,
    scheduler: Arc<PlacementScheduler>,
    fetcher: Arc<dyn OciFetcher>,
    control: Arc<dyn RunnerControl>,
    status: Arc<dyn StatusSink>,
    eviction: Arc<TieredEvictionManager>,
    config: LifecycleConfig,
    defaults: RunnerDefaults,
}

impl LifecycleController {
    /// Create a controller over the given registries and collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        modules: Arc<ModuleRegistry>,
        runners: Arc<RunnerRegistry>,
        scheduler: Arc<PlacementScheduler>,
        fetcher: Arc<dyn OciFetcher>,
        control: Arc<dyn RunnerControl>,
        status: Arc<dyn StatusSink>,
        eviction: Arc<TieredEvictionManager>,
        config: LifecycleConfig,
        defaults: RunnerDefaults,
    ) -> Self {
        Self {
            modules,
            runners,
            scheduler,
            fetcher,
            control,
            status,
            eviction,
            config,
            defaults,
        }
    }

    /// The controller's configuration.
    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Admit a created or updated module spec and place it.
    ///
    /// An update tears down any existing placement and starts a fresh
    /// generation from `Unloaded`; this is also the only way out of the
    /// terminal `Error` state. Placement failures leave the module
    /// registered but unplaced, surfaced to the spec source as a
    /// retryable condition.
    #[instrument(skip(self, spec), fields(module = %key))]
    pub async fn apply(&self, key: ModuleKey, spec: ModuleSpec) -> Result<(), EngineError> {
        isolation::check_admission(&spec)?;

        let entry = if let Some(existing) = self.modules.get(&key) {
            {
                let _guard = existing.lock_transition().await;
                let old = existing.snapshot();
                if let Some(runner) = &old.runner {
                    let _ = self.control.evict(runner, &key, None).await;
                    if let Some(entry) = self.runners.get(runner) {
                        entry.release(&key);
                    }
                }
                self.eviction.forget(&key);
                existing.update(|record| {
                    record.spec = spec.clone();
                    record.generation += 1;
                    record.state = State::Unloaded;
                    record.tiers = TierSet::EMPTY;
                    record.runner = None;
                    record.artifact_bytes = 0;
                    record.error = None;
                });
            }
            info!(module = %key, generation = existing.with(|r| r.generation), "Module spec updated");
            existing
        } else {
            info!(module = %key, image = %spec.image, "Module spec created");
            self.modules.insert(key.clone(), spec.clone())
        };

        match self.scheduler.place(&key, &spec).await {
            Ok(placement) => {
                entry.update(|record| record.runner = Some(placement.runner.clone()));
                self.report(&entry);
                Ok(())
            }
            Err(e) => {
                warn!(module = %key, error = %e, "Placement failed; module left unplaced");
                self.report_with_error(&entry, &e);
                Err(e)
            }
        }
    }

    /// Drive a module to `Running`, performing whatever forward
    /// transitions are needed.
    ///
    /// A module already `Running` is touched and returned immediately. A
    /// module in `Error` is never loaded; the caller gets the recorded
    /// error back. Callers bound the wait with their own timeout.
    #[instrument(skip(self), fields(module = %key))]
    pub async fn ensure_running(&self, key: &ModuleKey) -> Result<(), EngineError> {
        let entry = self
            .modules
            .get(key)
            .ok_or_else(|| EngineError::module_not_found(key.to_string()))?;

        // Fast path outside the transition lock
        match entry.with(|record| (record.state, record.error.clone())) {
            (State::Running, _) => {
                self.eviction.touch(key);
                return Ok(());
            }
            (State::Error, detail) => return Err(module_in_error(key, detail)),
            _ => {}
        }

        // Concurrent requests for the same cold module coalesce here: the
        // first locker drives the transitions, the rest observe `Running`.
        let _guard = entry.lock_transition().await;

        loop {
            let record = entry.snapshot();
            match record.state {
                State::Running => {
                    self.eviction.touch(key);
                    return Ok(());
                }
                State::Error => return Err(module_in_error(key, record.error)),
                State::Unloaded | State::Fetching => {
                    self.fetch_and_store(&entry, &record).await?;
                }
                State::Stored => self.load(&entry, &record).await?,
                State::Loaded => self.compile(&entry, &record).await?,
                State::Compiled => self.instantiate(&entry, &record).await?,
            }
        }
    }

    /// `Unloaded → Fetching → Stored`: pull the artifact and persist it
    /// to the runner's disk cache.
    async fn fetch_and_store(
        &self,
        entry: &Arc<ModuleEntry>,
        record: &ModuleRecord,
    ) -> Result<(), EngineError> {
        let key = entry.key().clone();

        // A module that lost its placement (failed apply, runner crash)
        // is placed on first access.
        let runner = match &record.runner {
            Some(runner) => runner.clone(),
            None => {
                let placement = self.scheduler.place(&key, &record.spec).await?;
                entry.update(|r| r.runner = Some(placement.runner.clone()));
                placement.runner
            }
        };

        entry.update(|r| r.state = State::Fetching);
        self.report(entry);

        let bytes = match self.fetch_with_retry(&record.spec.image).await {
            Ok(bytes) => bytes,
            Err(fetch_err) => {
                entry.update(|r| {
                    r.state = State::Error;
                    r.error = Some(ErrorDetail {
                        reason: fetch_err.reason().to_string(),
                        message: fetch_err.to_string(),
                    });
                });
                self.report(entry);
                return Err(fetch_err.into());
            }
        };

        if let Err(e) = self.control.store(&runner, &key, &bytes).await {
            // Transient: a later access restarts the fetch cleanly
            entry.update(|r| r.state = State::Unloaded);
            return Err(e);
        }

        let size = bytes.len() as u64;
        entry.update(|r| {
            if let Some((tiers, _)) = r.tiers.promoted() {
                r.tiers = tiers;
            }
            r.state = State::Stored;
            r.artifact_bytes = size;
        });
        self.eviction.note_resident(&key, Tier::Stored, size);
        self.report(entry);
        Ok(())
    }

    /// `Stored → Loaded`: read bytes into memory on the runner.
    async fn load(
        &self,
        entry: &Arc<ModuleEntry>,
        record: &ModuleRecord,
    ) -> Result<(), EngineError> {
        let runner = placed_runner(entry.key(), record)?;
        self.control.load(&runner, entry.key()).await?;

        entry.update(|r| {
            if let Some((tiers, _)) = r.tiers.promoted() {
                r.tiers = tiers;
            }
            r.state = State::Loaded;
        });
        self.eviction
            .note_resident(entry.key(), Tier::Loaded, record.artifact_bytes);
        self.report(entry);
        Ok(())
    }

    /// `Loaded → Compiled`: compile to machine code. Invalid bytecode is
    /// terminal.
    async fn compile(
        &self,
        entry: &Arc<ModuleEntry>,
        record: &ModuleRecord,
    ) -> Result<(), EngineError> {
        let runner = placed_runner(entry.key(), record)?;

        match self.control.compile(&runner, entry.key()).await {
            Ok(()) => {
                entry.update(|r| {
                    if let Some((tiers, _)) = r.tiers.promoted() {
                        r.tiers = tiers;
                    }
                    r.state = State::Compiled;
                });
                self.eviction
                    .note_resident(entry.key(), Tier::Compiled, record.artifact_bytes);
                self.report(entry);
                Ok(())
            }
            Err(e @ EngineError::CompilationFailed { .. }) => {
                entry.update(|r| {
                    r.state = State::Error;
                    r.error = Some(ErrorDetail {
                        reason: "CompileError".to_string(),
                        message: e.to_string(),
                    });
                });
                self.report(entry);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// `Compiled → Running`: bind the WASI context and prepare a live
    /// instance.
    async fn instantiate(
        &self,
        entry: &Arc<ModuleEntry>,
        record: &ModuleRecord,
    ) -> Result<(), EngineError> {
        let runner = placed_runner(entry.key(), record)?;
        let volumes = self
            .runners
            .get(&runner)
            .map(|r| r.with(|record| record.volumes.clone()))
            .unwrap_or_default();

        let params = WasiParams::from_spec(&record.spec, &volumes, self.config.default_fuel)?;
        self.control.instantiate(&runner, entry.key(), params).await?;

        entry.update(|r| {
            if let Some((tiers, _)) = r.tiers.promoted() {
                r.tiers = tiers;
            }
            r.state = State::Running;
        });
        self.eviction.note_resident(entry.key(), Tier::Running, 0);
        self.report(entry);

        info!(module = %entry.key(), runner = %runner, "Module running");
        Ok(())
    }

    /// Demote a module one tier step.
    ///
    /// Called only by the eviction manager. Returns `Ok(false)` without
    /// touching the module when it is mid-transition or no longer
    /// resident at `from` (the sweep's candidate was stale).
    pub async fn demote_one(&self, key: &ModuleKey, from: Tier) -> Result<bool, EngineError> {
        let Some(entry) = self.modules.get(key) else {
            self.eviction.forget(key);
            return Ok(false);
        };
        let Some(_guard) = entry.try_lock_transition() else {
            return Ok(false);
        };

        let record = entry.snapshot();
        if record.state == State::Error {
            return Ok(false);
        }
        if record.tiers.highest() != Some(from) {
            if !record.tiers.contains(from) {
                // Residency moved since the sweep looked; fix the index
                self.eviction.note_departed(key, from);
            }
            return Ok(false);
        }

        if let Some(runner) = &record.runner {
            self.control.evict(runner, key, from.below()).await?;
        }

        entry.update(|r| {
            if let Some((tiers, _)) = r.tiers.demoted() {
                r.tiers = tiers;
            }
            r.state = r.tiers.highest().map_or(State::Unloaded, Tier::state);
        });
        self.eviction.note_departed(key, from);
        self.report(&entry);
        Ok(true)
    }

    /// Move a module to the terminal `Error` state.
    ///
    /// Used for instance-level faults: a single trap only fails its
    /// request, but a corrupted instance (repeated traps, instantiation
    /// failures) faults the module itself.
    pub async fn fault_module(
        &self,
        key: &ModuleKey,
        reason: &str,
        message: &str,
    ) -> Result<(), EngineError> {
        let entry = self
            .modules
            .get(key)
            .ok_or_else(|| EngineError::module_not_found(key.to_string()))?;

        let _guard = entry.lock_transition().await;
        if let Some(runner) = entry.with(|record| record.runner.clone()) {
            let _ = self.control.evict(&runner, key, None).await;
        }
        self.eviction.forget(key);
        entry.update(|record| {
            record.state = State::Error;
            record.tiers = TierSet::EMPTY;
            record.error = Some(ErrorDetail {
                reason: reason.to_string(),
                message: message.to_string(),
            });
        });
        self.report(&entry);

        warn!(module = %key, reason, "Module faulted");
        Ok(())
    }

    /// Tear a module down after its spec was deleted.
    ///
    /// Waits for any in-flight transition to finish; the operation is
    /// never interrupted mid-write.
    #[instrument(skip(self), fields(module = %key))]
    pub async fn remove(&self, key: &ModuleKey) -> Result<(), EngineError> {
        let entry = self
            .modules
            .remove(key)
            .ok_or_else(|| EngineError::module_not_found(key.to_string()))?;

        let _guard = entry.lock_transition().await;
        let record = entry.snapshot();
        if let Some(runner) = &record.runner {
            let _ = self.control.evict(runner, key, None).await;
            if let Some(runner_entry) = self.runners.get(runner) {
                runner_entry.release(key);
            }
        }
        self.eviction.forget(key);

        info!(module = %key, "Module removed");
        Ok(())
    }

    /// Move a module to a different runner.
    ///
    /// The reservation on `to` must already exist (place-then-evict); the
    /// module restarts cold on its new runner at the next access. Returns
    /// `Ok(false)` without moving when the module is mid-transition.
    pub async fn migrate(
        &self,
        key: &ModuleKey,
        from: &RunnerId,
        to: &RunnerId,
    ) -> Result<bool, EngineError> {
        let Some(entry) = self.modules.get(key) else {
            return Ok(false);
        };
        let Some(_guard) = entry.try_lock_transition() else {
            return Ok(false);
        };

        let _ = self.control.evict(from, key, None).await;
        if let Some(old) = self.runners.get(from) {
            old.release(key);
        }
        self.eviction.forget(key);
        entry.update(|record| {
            record.runner = Some(to.clone());
            record.state = State::Unloaded;
            record.tiers = TierSet::EMPTY;
        });
        self.report(&entry);

        info!(module = %key, from = %from, to = %to, "Module migrated");
        Ok(true)
    }

    /// React to a crashed runner by re-placing everything it hosted.
    ///
    /// Modules whose stored bytes live on shared durable storage resume
    /// from `Stored`; purely in-memory residents resume from `Unloaded`.
    /// A runner crash is not a module-level error.
    #[instrument(skip(self), fields(runner = %runner))]
    pub async fn handle_runner_crash(&self, runner: &RunnerId) -> Result<(), EngineError> {
        let entry = self
            .runners
            .remove(runner)
            .ok_or_else(|| EngineError::runner_not_found(runner.to_string()))?;
        let hosted: Vec<ModuleKey> = entry.with(|r| r.modules.keys().cloned().collect());

        warn!(runner = %runner, modules = hosted.len(), "Runner crashed; re-placing modules");

        for key in hosted {
            let Some(module) = self.modules.get(&key) else {
                continue;
            };
            let _guard = module.lock_transition().await;

            let resume_stored = self.defaults.shared_artifact_store
                && module.with(|r| r.tiers.contains(Tier::Stored));
            let artifact_bytes = module.with(|r| r.artifact_bytes);

            self.eviction.forget(&key);
            module.update(|record| {
                record.runner = None;
                if resume_stored {
                    record.tiers = TierSet::EMPTY
                        .promoted()
                        .map_or(TierSet::EMPTY, |(tiers, _)| tiers);
                    record.state = State::Stored;
                } else {
                    record.tiers = TierSet::EMPTY;
                    record.state = State::Unloaded;
                }
            });

            let spec = module.with(|r| r.spec.clone());
            match self.scheduler.place(&key, &spec).await {
                Ok(placement) => {
                    module.update(|r| r.runner = Some(placement.runner.clone()));
                    if resume_stored {
                        self.eviction
                            .note_resident(&key, Tier::Stored, artifact_bytes);
                    }
                    self.report(&module);
                }
                Err(e) => {
                    warn!(module = %key, error = %e, "Re-placement failed after runner crash");
                    self.report_with_error(&module, &e);
                }
            }
        }

        Ok(())
    }

    /// Fetch with bounded retries and doubling backoff.
    async fn fetch_with_retry(&self, image: &str) -> Result<Vec<u8>, FetchError> {
        let attempts = self.config.fetch_attempts.max(1);
        let mut backoff = Duration::from_millis(self.config.fetch_backoff_ms);
        let mut last = FetchError::Network {
            image: image.to_string(),
            reason: "no fetch attempt made".to_string(),
        };

        for attempt in 1..=attempts {
            match tokio::time::timeout(self.config.fetch_timeout(), self.fetcher.fetch(image))
                .await
            {
                Ok(Ok(bytes)) => return Ok(bytes),
                Ok(Err(e)) => {
                    warn!(image, attempt, error = %e, "Fetch attempt failed");
                    last = e;
                }
                Err(_) => {
                    last = FetchError::Network {
                        image: image.to_string(),
                        reason: format!("timed out after {}ms", self.config.fetch_timeout_ms),
                    };
                    warn!(image, attempt, "Fetch attempt timed out");
                }
            }

            if attempt < attempts {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }

        Err(last)
    }

    /// Report a module's current status to the sink.
    fn report(&self, entry: &Arc<ModuleEntry>) {
        let record = entry.snapshot();
        self.status.report(ModuleStatus {
            module: entry.key().clone(),
            state: record.state,
            tier: record.tiers.highest(),
            runner: record.runner.clone(),
            ready: record.state == State::Running,
            last_error: record
                .error
                .as_ref()
                .map(|e| format!("{}: {}", e.reason, e.message)),
        });
    }

    /// Report a retryable condition without moving the module to `Error`.
    fn report_with_error(&self, entry: &Arc<ModuleEntry>, error: &EngineError) {
        let record = entry.snapshot();
        self.status.report(ModuleStatus {
            module: entry.key().clone(),
            state: record.state,
            tier: record.tiers.highest(),
            runner: record.runner.clone(),
            ready: false,
            last_error: Some(error.to_string()),
        });
    }
}

impl std::fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleController")
            .field("modules", &self.modules.len())
            .field("runners", &self.runners.len())
            .finish_non_exhaustive()
    }
}

fn placed_runner(key: &ModuleKey, record: &ModuleRecord) -> Result<RunnerId, EngineError> {
    record
        .runner
        .clone()
        .ok_or_else(|| EngineError::invalid_spec(format!("module '{key}' is not placed")))
}

fn module_in_error(key: &ModuleKey, detail: Option<ErrorDetail>) -> EngineError {
    EngineError::ModuleInError {
        module: key.to_string(),
        reason: detail.map_or_else(|| "unknown".to_string(), |d| d.reason),
    }
}
