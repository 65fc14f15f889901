//! Extension runtime error types.

use thiserror::Error;
use uuid::Uuid;

use crate::manifest::Capability;
use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum ExtensionError {
    #[error("malformed manifest: {0}")]
    MalformedManifest(String),

    #[error("extension '{extension}' depends on missing extension '{dependency}'")]
    MissingDependency {
        extension: String,
        dependency: String,
    },

    #[error("cyclic dependency: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),

    #[error("permission denied: capability '{0}' not granted")]
    PermissionDenied(Capability),

    #[error("extension already loaded: {0}")]
    AlreadyLoaded(String),

    #[error("extension not loaded: {0}")]
    NotLoaded(String),

    #[error("extension not discovered: {0}")]
    NotDiscovered(String),

    #[error("invalid bundle for extension '{id}': {reason}")]
    InvalidBundle { id: String, reason: String },

    #[error("extension '{id}' requires host version {required}, host is {host}")]
    IncompatibleVersion {
        id: String,
        required: String,
        host: String,
    },

    #[error("extension '{id}' is required by: {}", .dependents.join(", "))]
    HasDependents { id: String, dependents: Vec<String> },

    #[error("extension '{id}' callback failed: {cause}")]
    CallbackFailure { id: String, cause: String },

    #[error("extension '{id}' cannot {operation} while {state}")]
    InvalidState {
        id: String,
        operation: &'static str,
        state: String,
    },

    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    #[error("topic '{0}' is reserved for the host")]
    ReservedTopic(String),

    #[error("subscription not found: {0}")]
    SubscriptionNotFound(Uuid),

    #[error("host '{0}' is not allowed for this extension")]
    HostNotAllowed(String),

    #[error("host function error: {0}")]
    HostFunction(String),

    #[error("event handler error: {0}")]
    Handler(String),

    #[error("sandbox error: {0}")]
    Sandbox(String),

    #[error("WASM validation error: {0}")]
    WasmValidation(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("watcher error: {0}")]
    Watcher(#[from] notify::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("semver error: {0}")]
    Semver(#[from] semver::Error),
}

impl ExtensionError {
    /// Shorthand for handler failures raised from extension code.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }
}
