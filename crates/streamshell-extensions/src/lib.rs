//! StreamShell Extension Runtime
//!
//! Discovers extension bundles on disk, resolves their dependencies, and
//! drives each one through load, initialize, activate, deactivate and
//! unload. Extensions talk to the host through a capability-gated
//! [`ExtensionHost`]: a topic-based event bus, namespaced persistent
//! storage, chat commands (dispatched from prefixed chat messages), UI panels and allow-listed HTTP. Native
//! extensions are registered as factories; WASM bundles run in an Extism
//! sandbox with memory and fuel limits. A file watcher reloads changed
//! bundles in place.

pub mod commands;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod host_functions;
pub mod lifecycle;
pub mod loader;
pub mod manifest;
pub mod permissions;
pub mod resolver;
pub mod sandbox;
pub mod storage;
pub mod watcher;

pub use commands::{attach_dispatcher, parse_command, ParsedCommand};
pub use config::RuntimeConfig;
pub use context::ExtensionContext;
pub use error::ExtensionError;
pub use events::{handler, Event, EventBus, EventHandler, SubscriptionId, SubscriptionInfo};
pub use host_functions::ExtensionHost;
pub use lifecycle::{
    BatchFailure, BatchReport, DiscoveryFailure, DiscoveryReport, ExtensionInfo, ExtensionState,
    LifecycleController,
};
pub use loader::{Extension, ExtensionFactory, ExtensionLoader};
pub use manifest::{Capability, ExtensionManifest};
pub use permissions::PermissionPolicy;
pub use sandbox::{SandboxConfig, WasmExtension, WasmSandbox};
pub use storage::{FileStore, MemoryStore, StorageBackend, StorageError, StorageGateway};
pub use watcher::HotReloadWatcher;
