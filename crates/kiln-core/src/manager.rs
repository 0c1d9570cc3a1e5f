//! Model repository manager: discovery-driven lifecycle of backend handles.
//!
//! One state machine per (name, version):
//!
//! ```text
//! UNKNOWN ──load──> LOADING ──ok──> READY
//!   ▲                 │ fail           │
//!   │                 └──> UNAVAILABLE │
//!   │                                  │
//!   └──── UNLOADING <── unload ────────┘
//! ```
//!
//! The manager exclusively owns the handle table; callers receive shared
//! [`ModelHandle`]s and the manager never frees one while references are
//! outstanding. A reload installs a new generation atomically and retires the
//! old handle by draining its references. Scans are serialized; within one
//! scan, models load, reload, and unload concurrently.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{BackendFactory, BatchItem};
use crate::error::Error;
use crate::model::{ModelConfig, TensorConfig, VersionPolicy};
use crate::repository::{ModificationKey, RepositoryStore};
use crate::request::InferenceRequest;
use crate::response::ResponseAllocator;
use crate::scheduler::{ResponseReceiver, Scheduler};
use crate::server::InflightGuard;

// ─── States ───────────────────────────────────────────────────────────────────

/// Lifecycle state of one (name, version).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "state", content = "reason")]
pub enum ModelState {
    Unknown,
    Loading,
    Ready,
    Unloading,
    /// Not servable; carries the reason (load failure, unloaded, ...).
    Unavailable(String),
}

impl ModelState {
    pub fn name(&self) -> &'static str {
        match self {
            ModelState::Unknown => "UNKNOWN",
            ModelState::Loading => "LOADING",
            ModelState::Ready => "READY",
            ModelState::Unloading => "UNLOADING",
            ModelState::Unavailable(_) => "UNAVAILABLE",
        }
    }
}

impl std::fmt::Display for ModelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelState::Unavailable(reason) => write!(f, "UNAVAILABLE ({reason})"),
            other => f.write_str(other.name()),
        }
    }
}

/// One row of the repository index.
#[derive(Debug, Clone, Serialize)]
pub struct ModelIndexEntry {
    pub name: String,
    pub version: i64,
    #[serde(flatten)]
    pub state: ModelState,
}

// ─── Handles ──────────────────────────────────────────────────────────────────

/// Shared handle to one loaded (model, version).
///
/// Obtained from [`RepositoryManager::get_backend`] while the version is
/// `READY`. Holding a handle keeps the loaded backend alive across an
/// unload or reload; requests enqueued through it complete against the
/// generation it was acquired from.
pub struct ModelHandle {
    name: String,
    version: i64,
    generation: u64,
    config: Arc<ModelConfig>,
    scheduler: Scheduler,
    /// Cloned into every enqueued request so a drain can tell queued work
    /// from idle handles.
    live: Arc<()>,
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("generation", &self.generation)
            .finish()
    }
}

impl ModelHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    /// Generation counter distinguishing reloads of the same version.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn max_priority_level(&self) -> u32 {
        self.config.max_priority_level()
    }

    pub fn default_priority_level(&self) -> u32 {
        self.config.default_priority_level()
    }

    pub fn input(&self, name: &str) -> Result<&TensorConfig, Error> {
        self.config
            .input(name)
            .ok_or_else(|| Error::NotFound(format!("input '{name}' of model '{}'", self.name)))
    }

    pub fn output(&self, name: &str) -> Result<&TensorConfig, Error> {
        self.config
            .output(name)
            .ok_or_else(|| Error::NotFound(format!("output '{name}' of model '{}'", self.name)))
    }

    /// Normalize (if needed) and enqueue a request on this version's
    /// scheduler. The returned receiver resolves on completion.
    pub fn enqueue(
        &self,
        request: InferenceRequest,
        allocator: Arc<dyn ResponseAllocator>,
    ) -> Result<ResponseReceiver, Error> {
        self.enqueue_tracked(request, allocator, None)
    }

    pub(crate) fn enqueue_tracked(
        &self,
        mut request: InferenceRequest,
        allocator: Arc<dyn ResponseAllocator>,
        guard: Option<InflightGuard>,
    ) -> Result<ResponseReceiver, Error> {
        request.prepare(&self.config)?;
        let item =
            BatchItem::new(request, allocator, self.version).with_live(Arc::clone(&self.live));
        self.scheduler.enqueue(item, guard)
    }

    /// `true` while no enqueued request of this handle is queued or running.
    fn idle(self: &Arc<Self>) -> bool {
        Arc::strong_count(&self.live) == 1
    }
}

// ─── Slots ────────────────────────────────────────────────────────────────────

struct VersionSlot {
    state: ModelState,
    generation: u64,
    handle: Option<Arc<ModelHandle>>,
    mod_key: Option<ModificationKey>,
}

impl VersionSlot {
    fn empty() -> Self {
        Self {
            state: ModelState::Unknown,
            generation: 0,
            handle: None,
            mod_key: None,
        }
    }
}

struct ModelRecord {
    config: Arc<ModelConfig>,
    versions: BTreeMap<i64, VersionSlot>,
}

type ModelTable = Arc<RwLock<HashMap<String, ModelRecord>>>;

// ─── Manager ──────────────────────────────────────────────────────────────────

pub struct RepositoryManager {
    store: RepositoryStore,
    factory: Arc<dyn BackendFactory>,
    models: ModelTable,
    /// Serializes poll cycles; per-model work inside a cycle runs
    /// concurrently.
    scan_lock: Mutex<()>,
    generation: AtomicU64,
    drains: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl RepositoryManager {
    pub fn new(store: RepositoryStore, factory: Arc<dyn BackendFactory>) -> Self {
        Self {
            store,
            factory,
            models: Arc::new(RwLock::new(HashMap::new())),
            scan_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            drains: std::sync::Mutex::new(Vec::new()),
        }
    }

    // ── loading ──────────────────────────────────────────────────────────────

    /// Load (or reload) every eligible version of `name` per its version
    /// policy. Versions that fall out of the policy are unloaded.
    ///
    /// Returns `Ok` when at least one eligible version is ready afterwards.
    pub async fn load_model(&self, name: &str) -> Result<(), Error> {
        let entry_versions = {
            let scan = self.store.scan()?;
            match scan.get(name) {
                Some(entry) => entry.versions.clone(),
                None => return Err(Error::NotFound(format!("model '{name}'"))),
            }
        };

        let (config, model_dir) = match self.store.read_config(name) {
            Ok(read) => read,
            Err(e) => {
                self.mark_unservable_versions(name, &e).await;
                return Err(e);
            }
        };
        let config = Arc::new(config);
        let eligible = eligible_versions(&config.version_policy, &entry_versions);
        if eligible.is_empty() {
            let e = Error::unavailable(format!(
                "model '{name}' has no version eligible under its policy"
            ));
            self.mark_unservable_versions(name, &e).await;
            return Err(e);
        }

        // Install or refresh the record before the concurrent loads so
        // version-policy resolution sees the new config.
        let stale: Vec<i64> = {
            let mut models = self.models.write().await;
            let record = models.entry(name.to_owned()).or_insert_with(|| ModelRecord {
                config: Arc::clone(&config),
                versions: BTreeMap::new(),
            });
            record.config = Arc::clone(&config);
            record
                .versions
                .keys()
                .copied()
                .filter(|v| !eligible.contains(v))
                .collect()
        };

        for version in stale {
            self.unload_version(name, version).await;
        }

        let loads = eligible.iter().map(|&version| {
            let mod_key = entry_versions[&version];
            self.load_version(name, version, Arc::clone(&config), &model_dir, mod_key)
        });
        let results: Vec<Result<(), Error>> = futures::future::join_all(loads).await;

        if self.ready_versions(name).await.is_empty() {
            return Err(results
                .into_iter()
                .find_map(Result::err)
                .unwrap_or_else(|| Error::unavailable(format!("model '{name}' failed to load"))));
        }
        Ok(())
    }

    /// Load one version; reloads atomically swap the serving handle.
    async fn load_version(
        &self,
        name: &str,
        version: i64,
        config: Arc<ModelConfig>,
        model_dir: &std::path::Path,
        mod_key: ModificationKey,
    ) -> Result<(), Error> {
        {
            let mut models = self.models.write().await;
            let record = models
                .get_mut(name)
                .ok_or_else(|| Error::NotFound(format!("model '{name}'")))?;
            let slot = record
                .versions
                .entry(version)
                .or_insert_with(VersionSlot::empty);
            match &slot.state {
                ModelState::Loading => return Ok(()), // a load is already running
                ModelState::Ready
                    if slot.mod_key == Some(mod_key)
                        && slot.handle.as_ref().is_some_and(|h| *h.config == *config) =>
                {
                    return Ok(()); // unchanged since last load
                }
                ModelState::Ready => {} // reload: old handle keeps serving
                _ => slot.state = ModelState::Loading,
            }
        }

        let version_dir = model_dir.join(version.to_string());
        debug!(model = name, version, "loading model version");
        let created = self
            .factory
            .create(name, version, &config, &version_dir)
            .await;

        match created {
            Ok(backend) => {
                let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                let scheduler = Scheduler::spawn(
                    name.to_owned(),
                    version,
                    Arc::from(backend),
                    &config,
                );
                let handle = Arc::new(ModelHandle {
                    name: name.to_owned(),
                    version,
                    generation,
                    config: Arc::clone(&config),
                    scheduler,
                    live: Arc::new(()),
                });

                let mut models = self.models.write().await;
                let Some(slot) = models
                    .get_mut(name)
                    .and_then(|r| r.versions.get_mut(&version))
                else {
                    // Unloaded while loading; discard the fresh handle.
                    handle.scheduler.shutdown();
                    return Ok(());
                };
                match slot.state {
                    ModelState::Loading | ModelState::Ready => {
                        let old = slot.handle.replace(Arc::clone(&handle));
                        slot.state = ModelState::Ready;
                        slot.generation = generation;
                        slot.mod_key = Some(mod_key);
                        info!(model = name, version, generation, "model version ready");
                        drop(models);
                        if let Some(old) = old {
                            info!(
                                model = name,
                                version,
                                old_generation = old.generation,
                                "retiring replaced handle"
                            );
                            self.retire(name, version, old, None);
                        }
                    }
                    _ => {
                        // An unload won the race; never expose the handle.
                        handle.scheduler.shutdown();
                    }
                }
                Ok(())
            }
            Err(e) => {
                let mut models = self.models.write().await;
                if let Some(slot) = models
                    .get_mut(name)
                    .and_then(|r| r.versions.get_mut(&version))
                {
                    if slot.handle.is_some() {
                        // Failed reload: the old generation keeps serving.
                        warn!(model = name, version, error = %e, "reload failed; keeping serving handle");
                    } else {
                        warn!(model = name, version, error = %e, "model version failed to load");
                        slot.state = ModelState::Unavailable(e.to_string());
                    }
                }
                Err(e)
            }
        }
    }

    /// Record a model-wide failure against every version that is not
    /// currently serving.
    async fn mark_unservable_versions(&self, name: &str, error: &Error) {
        let mut models = self.models.write().await;
        if let Some(record) = models.get_mut(name) {
            for slot in record.versions.values_mut() {
                if slot.handle.is_none() && slot.state != ModelState::Unloading {
                    slot.state = ModelState::Unavailable(error.to_string());
                }
            }
        }
    }

    // ── unloading ────────────────────────────────────────────────────────────

    /// Begin unloading every version of `name`. Unloading a model that is
    /// not loaded is a no-op. Never fails visibly; a stuck drain surfaces
    /// through the server shutdown deadline.
    pub async fn unload_model(&self, name: &str) {
        let versions: Vec<i64> = {
            let models = self.models.read().await;
            match models.get(name) {
                Some(record) => record.versions.keys().copied().collect(),
                None => return,
            }
        };
        for version in versions {
            self.unload_version(name, version).await;
        }
    }

    async fn unload_version(&self, name: &str, version: i64) {
        let handle = {
            let mut models = self.models.write().await;
            let Some(slot) = models
                .get_mut(name)
                .and_then(|r| r.versions.get_mut(&version))
            else {
                return;
            };
            match slot.state {
                ModelState::Ready => {
                    slot.state = ModelState::Unloading;
                    slot.handle.take()
                }
                ModelState::Loading => {
                    // The pending load observes this state and discards its
                    // handle instead of installing it.
                    slot.state = ModelState::Unavailable("unloaded".into());
                    None
                }
                _ => None,
            }
        };
        if let Some(handle) = handle {
            info!(model = name, version, "unloading model version");
            let generation = handle.generation;
            self.retire(name, version, handle, Some(generation));
        }
    }

    /// Drain a retired handle: wait for outside references and queued work
    /// to finish, stop its scheduler, then (for unloads) finalize the slot
    /// to `UNAVAILABLE` if it still belongs to this generation.
    fn retire(
        &self,
        name: &str,
        version: i64,
        handle: Arc<ModelHandle>,
        finalize_generation: Option<u64>,
    ) {
        let models = Arc::clone(&self.models);
        let name = name.to_owned();
        let task = tokio::spawn(async move {
            loop {
                if Arc::strong_count(&handle) == 1 && handle.idle() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            handle.scheduler.shutdown();
            debug!(model = name, version, generation = handle.generation, "handle drained");

            if let Some(generation) = finalize_generation {
                let mut models = models.write().await;
                if let Some(slot) = models
                    .get_mut(&name)
                    .and_then(|r| r.versions.get_mut(&version))
                {
                    if slot.generation == generation
                        && slot.state == ModelState::Unloading
                    {
                        slot.state = ModelState::Unavailable("unloaded".into());
                        info!(model = name, version, "model version unloaded");
                    }
                }
            }
        });
        self.drains.lock().expect("drain registry poisoned").push(task);
    }

    // ── polling ──────────────────────────────────────────────────────────────

    /// Rescan the repository and reconcile: new models load, vanished models
    /// unload, modified versions reload. Cycles are serialized; models
    /// within one cycle proceed concurrently.
    pub async fn poll(&self) -> Result<(), Error> {
        let _serial = self.scan_lock.lock().await;
        let scan = self.store.scan()?;

        let known: Vec<String> = self.models.read().await.keys().cloned().collect();
        let removed: Vec<String> = known
            .iter()
            .filter(|name| !scan.contains_key(*name))
            .cloned()
            .collect();

        let mut work: Vec<futures::future::BoxFuture<'_, ()>> = Vec::new();
        for name in scan.keys() {
            work.push(Box::pin(async move {
                if let Err(e) = self.load_model(name).await {
                    warn!(model = %name, error = %e, "poll: model failed to load");
                }
            }));
        }
        for name in &removed {
            work.push(Box::pin(async move {
                info!(model = %name, "poll: model removed from repository");
                self.unload_model(name).await;
            }));
        }
        futures::future::join_all(work).await;
        Ok(())
    }

    // ── resolution ───────────────────────────────────────────────────────────

    /// Resolve a caller-visible handle.
    ///
    /// `requested_version <= 0` resolves through the model's version policy
    /// (highest ready eligible version).
    pub async fn get_backend(
        &self,
        name: &str,
        requested_version: i64,
    ) -> Result<Arc<ModelHandle>, Error> {
        let models = self.models.read().await;
        let record = models
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("model '{name}'")))?;

        if requested_version > 0 {
            let slot = record.versions.get(&requested_version).ok_or_else(|| {
                Error::unavailable(format!(
                    "version {requested_version} of model '{name}' is not known"
                ))
            })?;
            return match (&slot.state, &slot.handle) {
                (ModelState::Ready, Some(handle)) => Ok(Arc::clone(handle)),
                (ModelState::Unavailable(reason), _) => Err(Error::unavailable(format!(
                    "version {requested_version} of model '{name}': {reason}"
                ))),
                (state, _) => Err(Error::unavailable(format!(
                    "version {requested_version} of model '{name}' is {state}"
                ))),
            };
        }

        let available: BTreeMap<i64, ()> =
            record.versions.keys().map(|&v| (v, ())).collect();
        let eligible = eligible_versions(&record.config.version_policy, &available);
        for version in eligible.iter().rev() {
            if let Some(slot) = record.versions.get(version) {
                if let (ModelState::Ready, Some(handle)) = (&slot.state, &slot.handle) {
                    return Ok(Arc::clone(handle));
                }
            }
        }

        // Surface the most recent failure reason when nothing is ready.
        let reason = eligible
            .iter()
            .rev()
            .filter_map(|v| record.versions.get(v))
            .find_map(|slot| match &slot.state {
                ModelState::Unavailable(reason) => Some(reason.clone()),
                _ => None,
            })
            .unwrap_or_else(|| "no ready version".to_owned());
        Err(Error::unavailable(format!("model '{name}': {reason}")))
    }

    /// Ready versions of one model, ascending.
    pub async fn ready_versions(&self, name: &str) -> Vec<i64> {
        let models = self.models.read().await;
        models
            .get(name)
            .map(|record| {
                record
                    .versions
                    .iter()
                    .filter(|(_, slot)| slot.state == ModelState::Ready)
                    .map(|(&v, _)| v)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `true` when the named model has a ready version (policy-resolved for
    /// `version <= 0`).
    pub async fn model_is_ready(&self, name: &str, version: i64) -> bool {
        self.get_backend(name, version).await.is_ok()
    }

    /// `true` when at least one known model has a ready version.
    pub async fn any_ready(&self) -> bool {
        let models = self.models.read().await;
        models.values().any(|record| {
            record
                .versions
                .values()
                .any(|slot| slot.state == ModelState::Ready)
        })
    }

    /// Index of every known (name, version) with its state.
    pub async fn index(&self) -> Vec<ModelIndexEntry> {
        let models = self.models.read().await;
        let mut entries: Vec<ModelIndexEntry> = models
            .iter()
            .flat_map(|(name, record)| {
                record.versions.iter().map(|(&version, slot)| ModelIndexEntry {
                    name: name.clone(),
                    version,
                    state: slot.state.clone(),
                })
            })
            .collect();
        entries.sort_by(|a, b| (&a.name, a.version).cmp(&(&b.name, b.version)));
        entries
    }

    /// Names of every known model.
    pub async fn model_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.models.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    // ── shutdown support ─────────────────────────────────────────────────────

    /// Begin unloading every model.
    pub async fn unload_all(&self) {
        let names = self.model_names().await;
        futures::future::join_all(names.iter().map(|name| self.unload_model(name))).await;
    }

    /// Wait until every outstanding drain finishes or `deadline` passes.
    pub async fn wait_for_drains(&self, deadline: tokio::time::Instant) -> bool {
        let tasks: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.drains.lock().expect("drain registry poisoned"),
        );
        for task in tasks {
            if tokio::time::timeout_at(deadline, task).await.is_err() {
                return false;
            }
        }
        true
    }

    /// Force every slot to `UNAVAILABLE`; used after the shutdown deadline.
    pub async fn force_unavailable(&self, reason: &str) {
        let mut models = self.models.write().await;
        for record in models.values_mut() {
            for slot in record.versions.values_mut() {
                if !matches!(slot.state, ModelState::Unavailable(_)) {
                    slot.state = ModelState::Unavailable(reason.to_owned());
                    slot.handle = None;
                }
            }
        }
    }
}

/// Versions eligible under `policy`, ascending.
fn eligible_versions<V>(policy: &VersionPolicy, available: &BTreeMap<i64, V>) -> Vec<i64> {
    match policy {
        VersionPolicy::Latest { num_versions } => available
            .keys()
            .rev()
            .take(*num_versions as usize)
            .copied()
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect(),
        VersionPolicy::All {} => available.keys().copied().collect(),
        VersionPolicy::Specific { versions } => available
            .keys()
            .copied()
            .filter(|v| versions.contains(v))
            .collect(),
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
