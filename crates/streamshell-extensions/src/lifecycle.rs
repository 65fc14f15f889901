//! Lifecycle controller. Owns every extension's state machine.
//!
//! The controller keeps two tables: the catalog of discovered bundles (in
//! discovery order) and the registry of loaded extensions. Operations on one
//! identifier are serialized by a per-identifier lock; different identifiers
//! proceed concurrently. No table lock is held while an extension callback
//! runs.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::ExtensionError;
use crate::events::{self, Event, EventBus};
use crate::host_functions::ExtensionHost;
use crate::loader::{Extension, ExtensionLoader};
use crate::manifest::{self, ExtensionManifest};
use crate::permissions::{self, PermissionPolicy};
use crate::resolver;
use crate::storage::StorageGateway;

// ─── State ──────────────────────────────────────────────────────────────

/// Where an extension is in its life.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "error", rename_all = "snake_case")]
pub enum ExtensionState {
    Discovered,
    Loading,
    Loaded,
    Initialized,
    Active,
    Deactivated,
    Unloaded,
    /// Unrecoverable error; only `reload` or `unload` leave this state.
    Failed(String),
}

impl ExtensionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Loading => "loading",
            Self::Loaded => "loaded",
            Self::Initialized => "initialized",
            Self::Active => "active",
            Self::Deactivated => "deactivated",
            Self::Unloaded => "unloaded",
            Self::Failed(_) => "failed",
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

impl fmt::Display for ExtensionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a registry entry.
#[derive(Debug, Clone, Serialize)]
pub struct ExtensionInfo {
    pub identifier: String,
    pub name: String,
    pub version: String,
    pub state: ExtensionState,
    pub loaded_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub bundle_path: PathBuf,
    pub instance_id: Uuid,
}

/// Outcome of scanning the extension root.
#[derive(Debug, Default, Clone, Serialize)]
pub struct DiscoveryReport {
    /// Identifiers recorded in the catalog, in discovery order.
    pub discovered: Vec<String>,
    pub failures: Vec<DiscoveryFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryFailure {
    pub bundle: PathBuf,
    pub error: String,
}

/// Outcome of a batch operation over many identifiers.
#[derive(Debug, Default, Clone, Serialize)]
pub struct BatchReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<BatchFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchFailure {
    pub identifier: String,
    pub error: String,
}

impl BatchReport {
    fn record(&mut self, id: &str, result: Result<(), ExtensionError>) {
        match result {
            Ok(()) => self.succeeded.push(id.to_string()),
            Err(e) => self.failed.push(BatchFailure {
                identifier: id.to_string(),
                error: e.to_string(),
            }),
        }
    }
}

// ─── Internal tables ────────────────────────────────────────────────────

type Instance = Arc<Mutex<Box<dyn Extension>>>;

#[derive(Debug, Clone)]
struct Bundle {
    manifest: ExtensionManifest,
    dir: PathBuf,
}

struct LoadedExtension {
    manifest: ExtensionManifest,
    bundle_dir: PathBuf,
    state: ExtensionState,
    loaded_at: DateTime<Utc>,
    instance_id: Uuid,
    last_error: Option<String>,
    instance: Instance,
    host: ExtensionHost,
}

impl LoadedExtension {
    fn info(&self) -> ExtensionInfo {
        ExtensionInfo {
            identifier: self.manifest.identifier.clone(),
            name: self.manifest.name.clone(),
            version: self.manifest.version.clone(),
            state: self.state.clone(),
            loaded_at: self.loaded_at,
            last_error: self.last_error.clone(),
            bundle_path: self.bundle_dir.clone(),
            instance_id: self.instance_id,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Callback {
    Initialize,
    Activate,
    Deactivate,
}

impl Callback {
    fn as_str(self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::Activate => "activate",
            Self::Deactivate => "deactivate",
        }
    }
}

/// Run one extension callback on its own task so a panic is contained.
async fn invoke(
    id: &str,
    instance: Instance,
    host: ExtensionHost,
    callback: Callback,
) -> Result<(), ExtensionError> {
    let task = tokio::spawn(async move {
        let mut ext = instance.lock_owned().await;
        match callback {
            Callback::Initialize => ext.initialize(&host).await,
            Callback::Activate => ext.activate(&host).await,
            Callback::Deactivate => ext.deactivate(&host).await,
        }
    });

    match task.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ExtensionError::CallbackFailure {
            id: id.to_string(),
            cause: e.to_string(),
        }),
        Err(e) => Err(ExtensionError::CallbackFailure {
            id: id.to_string(),
            cause: format!("{} panicked: {e}", callback.as_str()),
        }),
    }
}

fn live_dependents(registry: &HashMap<String, LoadedExtension>, id: &str) -> Vec<String> {
    let mut dependents: Vec<String> = registry
        .values()
        .filter(|e| !e.state.is_failed() && e.manifest.identifier != id)
        .filter(|e| e.manifest.dependencies.iter().any(|d| d == id))
        .map(|e| e.manifest.identifier.clone())
        .collect();
    dependents.sort();
    dependents
}

fn locked<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ─── Controller ─────────────────────────────────────────────────────────

pub struct LifecycleController {
    root: PathBuf,
    host_version: semver::Version,
    policy: PermissionPolicy,
    http_timeout_secs: u64,
    bus: Arc<EventBus>,
    storage: Arc<StorageGateway>,
    loader: Arc<ExtensionLoader>,
    catalog: RwLock<Vec<Bundle>>,
    registry: RwLock<HashMap<String, LoadedExtension>>,
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    loading: StdMutex<HashSet<String>>,
    /// Last load timestamp per identifier, kept across unloads.
    load_history: StdMutex<HashMap<String, DateTime<Utc>>>,
}

/// Removes an identifier from the in-flight set when a load attempt ends.
struct LoadingMark<'a> {
    set: &'a StdMutex<HashSet<String>>,
    id: String,
}

impl Drop for LoadingMark<'_> {
    fn drop(&mut self) {
        locked(self.set).remove(&self.id);
    }
}

impl LifecycleController {
    pub fn new(
        root: impl Into<PathBuf>,
        bus: Arc<EventBus>,
        storage: Arc<StorageGateway>,
        loader: Arc<ExtensionLoader>,
    ) -> Self {
        Self {
            root: root.into(),
            host_version: semver::Version::parse(env!("CARGO_PKG_VERSION"))
                .unwrap_or_else(|_| semver::Version::new(0, 1, 0)),
            policy: PermissionPolicy::default(),
            http_timeout_secs: 10,
            bus,
            storage,
            loader,
            catalog: RwLock::new(Vec::new()),
            registry: RwLock::new(HashMap::new()),
            locks: StdMutex::new(HashMap::new()),
            loading: StdMutex::new(HashSet::new()),
            load_history: StdMutex::new(HashMap::new()),
        }
    }

    pub fn with_policy(mut self, policy: PermissionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_host_version(mut self, version: semver::Version) -> Self {
        self.host_version = version;
        self
    }

    pub fn with_http_timeout(mut self, secs: u64) -> Self {
        self.http_timeout_secs = secs;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn host_version(&self) -> &semver::Version {
        &self.host_version
    }

    fn id_lock(&self, id: &str) -> Arc<Mutex<()>> {
        Arc::clone(locked(&self.locks).entry(id.to_string()).or_default())
    }

    /// Strictly increasing per identifier, even if the clock stalls.
    fn next_load_timestamp(&self, id: &str) -> DateTime<Utc> {
        let mut history = locked(&self.load_history);
        let now = Utc::now();
        let stamp = match history.get(id) {
            Some(prev) if *prev >= now => *prev + Duration::nanoseconds(1),
            _ => now,
        };
        history.insert(id.to_string(), stamp);
        stamp
    }

    async fn publish_state(&self, id: &str, state: &ExtensionState) {
        let mut payload = serde_json::json!({ "extension": id, "state": state.as_str() });
        if let ExtensionState::Failed(cause) = state {
            payload["error"] = serde_json::Value::String(cause.clone());
        }
        self.bus
            .publish(Event::from_value(events::EXTENSION_STATE_CHANGED, payload))
            .await;
    }

    async fn set_state(&self, id: &str, state: ExtensionState) {
        {
            let mut registry = self.registry.write().await;
            if let Some(entry) = registry.get_mut(id) {
                if let ExtensionState::Failed(cause) = &state {
                    entry.last_error = Some(cause.clone());
                }
                entry.state = state.clone();
            }
        }
        self.publish_state(id, &state).await;
    }

    async fn fail(&self, id: &str, err: &ExtensionError) {
        tracing::error!(extension = %id, "extension failed: {err}");
        self.set_state(id, ExtensionState::Failed(err.to_string()))
            .await;
    }

    async fn handles(&self, id: &str) -> Result<(ExtensionState, Instance, ExtensionHost), ExtensionError> {
        let registry = self.registry.read().await;
        let entry = registry
            .get(id)
            .ok_or_else(|| ExtensionError::NotLoaded(id.to_string()))?;
        Ok((
            entry.state.clone(),
            Arc::clone(&entry.instance),
            entry.host.clone(),
        ))
    }

    async fn catalog_manifests(&self) -> Vec<ExtensionManifest> {
        self.catalog
            .read()
            .await
            .iter()
            .map(|b| b.manifest.clone())
            .collect()
    }

    async fn catalog_bundle(&self, id: &str) -> Option<Bundle> {
        self.catalog
            .read()
            .await
            .iter()
            .find(|b| b.manifest.identifier == id)
            .cloned()
    }

    /// Identifiers of registry entries that are not Failed.
    async fn live_ids(&self) -> HashSet<String> {
        self.registry
            .read()
            .await
            .values()
            .filter(|e| !e.state.is_failed())
            .map(|e| e.manifest.identifier.clone())
            .collect()
    }

    // ── Discovery ────────────────────────────────────────────────────

    /// Scan the extension root and replace the catalog.
    ///
    /// Bundles are visited in directory-name order. A bundle that fails to
    /// parse, or repeats an identifier seen earlier in the scan, is reported
    /// and skipped; it never blocks the others.
    pub async fn discover(&self) -> Result<DiscoveryReport, ExtensionError> {
        let mut report = DiscoveryReport::default();

        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(root = %self.root.display(), "extension root does not exist");
                *self.catalog.write().await = Vec::new();
                return Ok(report);
            }
            Err(e) => return Err(e.into()),
        };

        let mut dirs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                dirs.push(entry.path());
            }
        }
        dirs.sort();

        let mut bundles: Vec<Bundle> = Vec::with_capacity(dirs.len());
        for dir in dirs {
            match manifest::parse_bundle(&dir).await {
                Ok(manifest) => {
                    if let Some(first) = bundles
                        .iter()
                        .find(|b| b.manifest.identifier == manifest.identifier)
                    {
                        report.failures.push(DiscoveryFailure {
                            error: format!(
                                "identifier '{}' already declared by {}",
                                manifest.identifier,
                                first.dir.display()
                            ),
                            bundle: dir,
                        });
                        continue;
                    }
                    report.discovered.push(manifest.identifier.clone());
                    bundles.push(Bundle { manifest, dir });
                }
                Err(e) => {
                    tracing::warn!(bundle = %dir.display(), "skipping bundle: {e}");
                    report.failures.push(DiscoveryFailure {
                        bundle: dir,
                        error: e.to_string(),
                    });
                }
            }
        }

        *self.catalog.write().await = bundles;
        tracing::info!(
            discovered = report.discovered.len(),
            failed = report.failures.len(),
            "extension discovery complete"
        );
        Ok(report)
    }

    /// Manifests in the catalog, in discovery order.
    pub async fn discovered(&self) -> Vec<ExtensionManifest> {
        self.catalog_manifests().await
    }

    // ── Load ─────────────────────────────────────────────────────────

    /// Load `id`, loading any dependency that is not yet live first.
    ///
    /// Leaves the extension Initialized. Failures before instantiation leave
    /// no registry entry; an initialize failure leaves a Failed entry.
    pub async fn load(&self, id: &str) -> Result<(), ExtensionError> {
        if self.registry.read().await.contains_key(id) {
            return Err(ExtensionError::AlreadyLoaded(id.to_string()));
        }

        let manifests = self.catalog_manifests().await;
        let live = self.live_ids().await;
        let order: Vec<String> = resolver::resolve_closure(id, &manifests, &live)?
            .into_iter()
            .map(|m| m.identifier.clone())
            .collect();

        for dep in order.iter().filter(|d| d.as_str() != id) {
            let lock = self.id_lock(dep);
            let _guard = lock.lock().await;
            match self.load_locked(dep).await {
                Ok(()) | Err(ExtensionError::AlreadyLoaded(_)) => {}
                Err(e) => {
                    tracing::warn!(extension = %id, dependency = %dep, "dependency failed to load: {e}");
                    return Err(e);
                }
            }
        }

        let lock = self.id_lock(id);
        let _guard = lock.lock().await;
        self.load_locked(id).await
    }

    fn check_dependencies_live(
        registry: &HashMap<String, LoadedExtension>,
        manifest: &ExtensionManifest,
    ) -> Result<(), ExtensionError> {
        for dep in &manifest.dependencies {
            match registry.get(dep) {
                Some(entry) if !entry.state.is_failed() => {}
                _ => {
                    return Err(ExtensionError::MissingDependency {
                        extension: manifest.identifier.clone(),
                        dependency: dep.clone(),
                    })
                }
            }
        }
        Ok(())
    }

    /// Caller holds the identifier lock.
    async fn load_locked(&self, id: &str) -> Result<(), ExtensionError> {
        if self.registry.read().await.contains_key(id) {
            return Err(ExtensionError::AlreadyLoaded(id.to_string()));
        }
        let bundle = self
            .catalog_bundle(id)
            .await
            .ok_or_else(|| ExtensionError::NotDiscovered(id.to_string()))?;
        let manifest = bundle.manifest;

        locked(&self.loading).insert(id.to_string());
        let _mark = LoadingMark {
            set: &self.loading,
            id: id.to_string(),
        };

        manifest.check_host_version(&self.host_version)?;
        Self::check_dependencies_live(&*self.registry.read().await, &manifest)?;
        permissions::validate(&manifest.permissions, &self.policy)?;

        let instance = self.loader.instantiate(&manifest, &bundle.dir).await?;
        let host = ExtensionHost::new(
            &manifest,
            Arc::clone(&self.bus),
            Arc::clone(&self.storage),
            self.http_timeout_secs,
        );
        let instance: Instance = Arc::new(Mutex::new(instance));
        let instance_id = Uuid::new_v4();

        {
            let mut registry = self.registry.write().await;
            if registry.contains_key(id) {
                return Err(ExtensionError::AlreadyLoaded(id.to_string()));
            }
            // Dependencies may have been unloaded while instantiating.
            Self::check_dependencies_live(&registry, &manifest)?;
            registry.insert(
                id.to_string(),
                LoadedExtension {
                    manifest: manifest.clone(),
                    bundle_dir: bundle.dir.clone(),
                    state: ExtensionState::Loaded,
                    loaded_at: self.next_load_timestamp(id),
                    instance_id,
                    last_error: None,
                    instance: Arc::clone(&instance),
                    host: host.clone(),
                },
            );
        }
        self.publish_state(id, &ExtensionState::Loaded).await;

        if let Err(e) = invoke(id, instance, host.clone(), Callback::Initialize).await {
            host.release().await;
            self.fail(id, &e).await;
            return Err(e);
        }
        self.set_state(id, ExtensionState::Initialized).await;

        tracing::info!(
            extension = %id,
            version = %manifest.version,
            instance = %instance_id,
            "extension loaded"
        );
        Ok(())
    }

    // ── Activate / deactivate ────────────────────────────────────────

    /// Move an Initialized or Deactivated extension to Active.
    pub async fn activate(&self, id: &str) -> Result<(), ExtensionError> {
        let lock = self.id_lock(id);
        let _guard = lock.lock().await;
        self.activate_locked(id).await
    }

    async fn activate_locked(&self, id: &str) -> Result<(), ExtensionError> {
        let (state, instance, host) = self.handles(id).await?;
        if !matches!(
            state,
            ExtensionState::Initialized | ExtensionState::Deactivated
        ) {
            return Err(ExtensionError::InvalidState {
                id: id.to_string(),
                operation: "activate",
                state: state.to_string(),
            });
        }

        host.rearm();
        if let Err(e) = invoke(id, instance, host.clone(), Callback::Activate).await {
            host.release().await;
            self.fail(id, &e).await;
            return Err(e);
        }
        self.set_state(id, ExtensionState::Active).await;
        tracing::info!(extension = %id, "extension activated");
        Ok(())
    }

    /// Move an Active extension to Deactivated.
    ///
    /// Subscriptions are released and the cancellation token fires even if
    /// the deactivate callback fails; the extension is then Failed and the
    /// `CallbackFailure` is returned.
    pub async fn deactivate(&self, id: &str) -> Result<(), ExtensionError> {
        let lock = self.id_lock(id);
        let _guard = lock.lock().await;
        self.deactivate_locked(id).await
    }

    async fn deactivate_locked(&self, id: &str) -> Result<(), ExtensionError> {
        let (state, instance, host) = self.handles(id).await?;
        if state != ExtensionState::Active {
            return Err(ExtensionError::InvalidState {
                id: id.to_string(),
                operation: "deactivate",
                state: state.to_string(),
            });
        }

        // Signal first so callbacks still running can wind down.
        host.cancellation_token().cancel();
        let result = invoke(id, instance, host.clone(), Callback::Deactivate).await;
        host.release().await;

        if let Err(e) = result {
            self.fail(id, &e).await;
            return Err(e);
        }
        self.set_state(id, ExtensionState::Deactivated).await;
        tracing::info!(extension = %id, "extension deactivated");
        Ok(())
    }

    // ── Unload ───────────────────────────────────────────────────────

    /// Remove `id` from the registry, deactivating it first if Active.
    pub async fn unload(&self, id: &str) -> Result<(), ExtensionError> {
        let lock = self.id_lock(id);
        let _guard = lock.lock().await;
        self.unload_locked(id).await
    }

    async fn ensure_no_dependents(&self, id: &str) -> Result<(), ExtensionError> {
        let dependents = live_dependents(&*self.registry.read().await, id);
        if dependents.is_empty() {
            Ok(())
        } else {
            Err(ExtensionError::HasDependents {
                id: id.to_string(),
                dependents,
            })
        }
    }

    async fn unload_locked(&self, id: &str) -> Result<(), ExtensionError> {
        let (state, _, host) = self.handles(id).await?;
        self.ensure_no_dependents(id).await?;

        if state == ExtensionState::Active {
            // Already released and marked Failed; removal goes ahead.
            if let Err(e) = self.deactivate_locked(id).await {
                tracing::warn!(extension = %id, "unloading after failed deactivate: {e}");
            }
        }
        host.release().await;

        {
            let mut registry = self.registry.write().await;
            let dependents = live_dependents(&registry, id);
            if !dependents.is_empty() {
                return Err(ExtensionError::HasDependents {
                    id: id.to_string(),
                    dependents,
                });
            }
            registry.remove(id);
        }
        self.publish_state(id, &ExtensionState::Unloaded).await;
        tracing::info!(extension = %id, "extension unloaded");
        Ok(())
    }

    // ── Reload ───────────────────────────────────────────────────────

    /// Unload then load `id` from its bundle, restoring Active if it was.
    ///
    /// The manifest is re-read and every pre-load check runs before the
    /// running instance is touched; if any fails, the instance keeps running.
    /// A Failed entry is retried.
    pub async fn reload(&self, id: &str) -> Result<(), ExtensionError> {
        let lock = self.id_lock(id);
        let _guard = lock.lock().await;

        let (bundle_dir, was_active) = {
            let registry = self.registry.read().await;
            let entry = registry
                .get(id)
                .ok_or_else(|| ExtensionError::NotLoaded(id.to_string()))?;
            (
                entry.bundle_dir.clone(),
                entry.state == ExtensionState::Active,
            )
        };

        let manifest = manifest::parse_bundle(&bundle_dir).await?;
        if manifest.identifier != id {
            return Err(ExtensionError::MalformedManifest(format!(
                "bundle {} now declares '{}' instead of '{id}'",
                bundle_dir.display(),
                manifest.identifier
            )));
        }
        manifest.check_host_version(&self.host_version)?;
        permissions::validate(&manifest.permissions, &self.policy)?;

        let mut manifests = self.catalog_manifests().await;
        match manifests.iter_mut().find(|m| m.identifier == id) {
            Some(slot) => *slot = manifest.clone(),
            None => manifests.push(manifest.clone()),
        }
        let mut live = self.live_ids().await;
        live.remove(id);
        let closure = resolver::resolve_closure(id, &manifests, &live)?;
        if let Some(unloaded) = closure.iter().find(|m| m.identifier != id) {
            return Err(ExtensionError::MissingDependency {
                extension: id.to_string(),
                dependency: unloaded.identifier.clone(),
            });
        }
        self.ensure_no_dependents(id).await?;

        {
            let mut catalog = self.catalog.write().await;
            let bundle = Bundle {
                manifest,
                dir: bundle_dir,
            };
            match catalog.iter_mut().find(|b| b.manifest.identifier == id) {
                Some(slot) => *slot = bundle,
                None => catalog.push(bundle),
            }
        }

        self.unload_locked(id).await?;
        self.load_locked(id).await?;
        if was_active {
            self.activate_locked(id).await?;
        }
        tracing::info!(extension = %id, "extension reloaded");
        Ok(())
    }

    // ── Batch operations ─────────────────────────────────────────────

    /// Load every cataloged extension that is not loaded yet.
    ///
    /// Dependencies load first; one extension's failure does not stop the rest.
    pub async fn load_all(&self) -> BatchReport {
        let mut report = BatchReport::default();
        for manifest in self.catalog_manifests().await {
            let id = manifest.identifier.as_str();
            if self.registry.read().await.contains_key(id) {
                continue;
            }
            let result = self.load(id).await;
            if let Err(e) = &result {
                tracing::error!(extension = %id, "failed to load extension: {e}");
            }
            report.record(id, result);
        }
        report
    }

    /// Registry identifiers with dependencies before dependents.
    async fn loaded_in_dependency_order(&self) -> Vec<String> {
        let manifests: Vec<ExtensionManifest> = {
            let catalog_order: Vec<String> = self
                .catalog
                .read()
                .await
                .iter()
                .map(|b| b.manifest.identifier.clone())
                .collect();
            let registry = self.registry.read().await;
            let mut loaded: Vec<&LoadedExtension> = registry.values().collect();
            loaded.sort_by_key(|e| {
                catalog_order
                    .iter()
                    .position(|id| *id == e.manifest.identifier)
                    .unwrap_or(usize::MAX)
            });
            loaded.into_iter().map(|e| e.manifest.clone()).collect()
        };

        let none = HashSet::new();
        match resolver::resolve(&manifests, &none) {
            Ok(order) => order.into_iter().map(|m| m.identifier.clone()).collect(),
            // A Failed dependency can leave the set open; fall back to catalog order.
            Err(_) => manifests.into_iter().map(|m| m.identifier).collect(),
        }
    }

    /// Activate every Initialized or Deactivated extension.
    pub async fn activate_all(&self) -> BatchReport {
        let mut report = BatchReport::default();
        for id in self.loaded_in_dependency_order().await {
            let ready = matches!(
                self.state(&id).await,
                Some(ExtensionState::Initialized | ExtensionState::Deactivated)
            );
            if !ready {
                continue;
            }
            let result = self.activate(&id).await;
            report.record(&id, result);
        }
        report
    }

    /// Deactivate and unload everything, dependents first.
    pub async fn shutdown(&self) -> BatchReport {
        let mut report = BatchReport::default();
        let mut order = self.loaded_in_dependency_order().await;
        order.reverse();
        for id in order {
            let result = self.unload(&id).await;
            if let Err(e) = &result {
                tracing::warn!(extension = %id, "failed to unload during shutdown: {e}");
            }
            report.record(&id, result);
        }
        tracing::info!(
            unloaded = report.succeeded.len(),
            failed = report.failed.len(),
            "extension runtime shut down"
        );
        report
    }

    // ── Uninstall ────────────────────────────────────────────────────

    /// Unload `id` if loaded, delete its storage and bundle, and forget it.
    pub async fn uninstall(&self, id: &str) -> Result<(), ExtensionError> {
        let lock = self.id_lock(id);
        let _guard = lock.lock().await;

        let loaded_dir = self
            .registry
            .read()
            .await
            .get(id)
            .map(|e| e.bundle_dir.clone());
        let bundle_dir = match loaded_dir {
            Some(dir) => {
                self.unload_locked(id).await?;
                dir
            }
            None => self
                .catalog_bundle(id)
                .await
                .map(|b| b.dir)
                .ok_or_else(|| ExtensionError::NotDiscovered(id.to_string()))?,
        };

        self.storage.delete_namespace(id).await?;

        if bundle_dir.starts_with(&self.root) && bundle_dir != self.root {
            match tokio::fs::remove_dir_all(&bundle_dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        } else {
            tracing::warn!(
                extension = %id,
                bundle = %bundle_dir.display(),
                "bundle outside extension root, not removed"
            );
        }

        self.catalog
            .write()
            .await
            .retain(|b| b.manifest.identifier != id);
        tracing::info!(extension = %id, "extension uninstalled");
        Ok(())
    }

    // ── Inspection ───────────────────────────────────────────────────

    /// Current state, or `None` for an identifier the controller never saw.
    pub async fn state(&self, id: &str) -> Option<ExtensionState> {
        if let Some(entry) = self.registry.read().await.get(id) {
            return Some(entry.state.clone());
        }
        if locked(&self.loading).contains(id) {
            return Some(ExtensionState::Loading);
        }
        if self.catalog_bundle(id).await.is_some() {
            return Some(ExtensionState::Discovered);
        }
        None
    }

    pub async fn info(&self, id: &str) -> Option<ExtensionInfo> {
        self.registry.read().await.get(id).map(LoadedExtension::info)
    }

    /// Every registry entry, sorted by identifier.
    pub async fn list(&self) -> Vec<ExtensionInfo> {
        let mut infos: Vec<ExtensionInfo> = self
            .registry
            .read()
            .await
            .values()
            .map(LoadedExtension::info)
            .collect();
        infos.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        infos
    }

    pub async fn is_loaded(&self, id: &str) -> bool {
        self.registry.read().await.contains_key(id)
    }

    /// The identifier whose bundle directory contains `path`.
    pub async fn bundle_for_path(&self, path: &Path) -> Option<String> {
        if let Some(entry) = self
            .registry
            .read()
            .await
            .values()
            .find(|e| path.starts_with(&e.bundle_dir))
        {
            return Some(entry.manifest.identifier.clone());
        }
        self.catalog
            .read()
            .await
            .iter()
            .find(|b| path.starts_with(&b.dir))
            .map(|b| b.manifest.identifier.clone())
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn storage(&self) -> &Arc<StorageGateway> {
        &self.storage
    }

    pub fn loader(&self) -> &Arc<ExtensionLoader> {
        &self.loader
    }
}
