//! Wiring of the runtime's shared services.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::commands;
use crate::config::RuntimeConfig;
use crate::error::ExtensionError;
use crate::events::{EventBus, SubscriptionId};
use crate::lifecycle::LifecycleController;
use crate::loader::ExtensionLoader;
use crate::permissions::PermissionPolicy;
use crate::sandbox::SandboxConfig;
use crate::storage::StorageGateway;
use crate::watcher::HotReloadWatcher;

/// One event bus, one storage gateway, one loader and the controller that
/// drives them, shared by everything embedding the runtime.
#[derive(Clone)]
pub struct ExtensionContext {
    bus: Arc<EventBus>,
    storage: Arc<StorageGateway>,
    loader: Arc<ExtensionLoader>,
    controller: Arc<LifecycleController>,
    reload_debounce: Duration,
    command_prefix: String,
}

impl ExtensionContext {
    /// Build a context backed by file storage, as configured.
    pub fn new(config: &RuntimeConfig) -> Self {
        let storage = Arc::new(StorageGateway::file(&config.storage_dir));
        Self::assemble(
            config.extension_dir.clone(),
            storage,
            config.sandbox.clone(),
            config.policy.clone(),
            config.http_timeout_secs,
            config.reload_debounce,
            config.command_prefix.clone(),
        )
    }

    /// Build a context with in-memory storage rooted at `extension_dir`.
    pub fn in_memory(extension_dir: impl Into<PathBuf>) -> Self {
        let defaults = RuntimeConfig::default();
        Self::assemble(
            extension_dir.into(),
            Arc::new(StorageGateway::memory()),
            defaults.sandbox,
            defaults.policy,
            defaults.http_timeout_secs,
            defaults.reload_debounce,
            defaults.command_prefix,
        )
    }

    fn assemble(
        extension_dir: PathBuf,
        storage: Arc<StorageGateway>,
        sandbox: SandboxConfig,
        policy: PermissionPolicy,
        http_timeout_secs: u64,
        reload_debounce: Duration,
        command_prefix: String,
    ) -> Self {
        let bus = Arc::new(EventBus::new());
        let loader = Arc::new(ExtensionLoader::new(sandbox));
        let controller = Arc::new(
            LifecycleController::new(
                extension_dir,
                Arc::clone(&bus),
                Arc::clone(&storage),
                Arc::clone(&loader),
            )
            .with_policy(policy)
            .with_http_timeout(http_timeout_secs),
        );

        Self {
            bus,
            storage,
            loader,
            controller,
            reload_debounce,
            command_prefix,
        }
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

    pub fn controller(&self) -> &Arc<LifecycleController> {
        &self.controller
    }

    /// Start hot reload on the extension root with the configured debounce.
    pub fn start_watcher(&self) -> Result<HotReloadWatcher, ExtensionError> {
        HotReloadWatcher::start(Arc::clone(&self.controller), self.reload_debounce)
    }

    /// Route prefixed chat messages to `chat.command.<name>` subscribers.
    pub async fn start_command_dispatch(&self) -> Result<SubscriptionId, ExtensionError> {
        commands::attach_dispatcher(&self.bus, &self.command_prefix).await
    }
}
