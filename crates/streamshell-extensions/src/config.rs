//! Runtime configuration read from the environment.

use std::path::PathBuf;
use std::time::Duration;

use crate::permissions::PermissionPolicy;
use crate::sandbox::SandboxConfig;

/// Everything needed to build an [`ExtensionContext`](crate::ExtensionContext).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Root directory holding one subdirectory per extension bundle.
    pub extension_dir: PathBuf,
    /// Root of the per-extension key/value storage.
    pub storage_dir: PathBuf,
    pub hot_reload: bool,
    pub reload_debounce: Duration,
    /// Activate every loaded extension at boot.
    pub auto_activate: bool,
    pub policy: PermissionPolicy,
    pub http_timeout_secs: u64,
    /// Marks a received chat message as a command, e.g. `!` in `!roll 2d6`.
    pub command_prefix: String,
    pub sandbox: SandboxConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            extension_dir: PathBuf::from("./extensions"),
            storage_dir: PathBuf::from("./data/extension-storage"),
            hot_reload: true,
            reload_debounce: Duration::from_millis(300),
            auto_activate: true,
            policy: PermissionPolicy::allow_all(),
            http_timeout_secs: 10,
            command_prefix: "!".to_string(),
            sandbox: SandboxConfig::default(),
        }
    }
}

fn flag(value: Option<String>, default: bool) -> bool {
    match value.as_deref().map(str::trim) {
        Some(v) if v.eq_ignore_ascii_case("true") || v == "1" => true,
        Some(v) if v.eq_ignore_ascii_case("false") || v == "0" => false,
        _ => default,
    }
}

impl RuntimeConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from any key lookup, falling back to defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            extension_dir: get("EXTENSION_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.extension_dir),
            storage_dir: get("EXTENSION_STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.storage_dir),
            hot_reload: flag(get("EXTENSION_HOT_RELOAD"), defaults.hot_reload),
            reload_debounce: get("EXTENSION_RELOAD_DEBOUNCE_MS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.reload_debounce),
            auto_activate: flag(get("EXTENSION_AUTO_ACTIVATE"), defaults.auto_activate),
            policy: get("EXTENSION_DENIED_CAPABILITIES")
                .map(|denied| PermissionPolicy::from_denied_list(&denied))
                .unwrap_or(defaults.policy),
            http_timeout_secs: get("EXTENSION_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            command_prefix: get("EXTENSION_COMMAND_PREFIX")
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.command_prefix),
            sandbox: SandboxConfig::from_lookup(&get),
        }
    }
}
