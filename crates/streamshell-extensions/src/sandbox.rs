//! WASM extension sandbox using Extism (wasmtime).
//!
//! Each WASM extension runs in its own isolated sandbox with configurable
//! memory limits and fuel-based execution limits. Binaries are checked for
//! size, magic bytes and import namespaces before they are compiled.

use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::ExtensionError;
use crate::events::{self, Event};
use crate::host_functions::ExtensionHost;
use crate::loader::Extension;

/// WASM magic bytes: `\0asm`
const WASM_MAGIC: &[u8; 4] = b"\0asm";

/// Allowed WASM import namespaces. Imports outside these are rejected.
const ALLOWED_IMPORT_NAMESPACES: &[&str] = &[
    "env",                    // Extism host functions
    "extism:host/env",        // Extism host functions (component model)
    "wasi_snapshot_preview1", // WASI preview 1
    "wasi_unstable",          // Legacy WASI
];

const HOOK_INITIALIZE: &str = "on_initialize";
const HOOK_ACTIVATE: &str = "on_activate";
const HOOK_DEACTIVATE: &str = "on_deactivate";
const HOOK_EVENT: &str = "on_event";

// ─── Configuration ──────────────────────────────────────────────────────

/// Configuration for the WASM sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxConfig {
    /// Maximum memory in bytes (default: 32 MB).
    pub memory_limit: usize,
    /// Maximum fuel (instructions) per execution (default: 1_000_000).
    pub fuel_limit: u64,
    /// Maximum size of a WASM binary in bytes (default: 50 MB).
    pub max_wasm_size: u64,
    /// Whether to enable WASI (default: false).
    /// When false, extensions cannot access env vars, filesystem, or stdio.
    pub wasi_enabled: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_limit: 32 * 1024 * 1024,
            fuel_limit: 1_000_000,
            max_wasm_size: 50 * 1024 * 1024,
            wasi_enabled: false,
        }
    }
}

impl SandboxConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from any key lookup, falling back to defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            memory_limit: get("EXTENSION_WASM_MEMORY_LIMIT_MB")
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(32)
                * 1024
                * 1024,
            fuel_limit: get("EXTENSION_WASM_FUEL_LIMIT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(1_000_000),
            max_wasm_size: get("EXTENSION_WASM_MAX_SIZE_MB")
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(50)
                * 1024
                * 1024,
            wasi_enabled: get("EXTENSION_WASI_ENABLED")
                .unwrap_or_default()
                .eq_ignore_ascii_case("true"),
        }
    }
}

// ─── Validation ─────────────────────────────────────────────────────────

/// Read and validate a WASM binary, returning its bytes.
///
/// Checks:
/// 1. File size within limits
/// 2. Magic bytes (0x00 0x61 0x73 0x6D = "\0asm")
/// 3. Import analysis: only allowed namespaces
pub async fn validate_wasm(wasm_path: &Path, max_size: u64) -> Result<Vec<u8>, ExtensionError> {
    let metadata = tokio::fs::metadata(wasm_path).await.map_err(|e| {
        ExtensionError::WasmValidation(format!(
            "failed to read WASM metadata for {}: {e}",
            wasm_path.display()
        ))
    })?;

    let size = metadata.len();
    if size > max_size {
        return Err(ExtensionError::WasmValidation(format!(
            "WASM binary too large: {size} bytes (max: {max_size} bytes)"
        )));
    }

    let wasm_bytes = tokio::fs::read(wasm_path).await.map_err(|e| {
        ExtensionError::WasmValidation(format!("failed to read WASM binary: {e}"))
    })?;

    if wasm_bytes.len() < 4 || &wasm_bytes[..4] != WASM_MAGIC {
        return Err(ExtensionError::WasmValidation(
            "invalid WASM binary: magic bytes mismatch".into(),
        ));
    }

    validate_wasm_imports(&wasm_bytes)?;
    Ok(wasm_bytes)
}

/// Validate WASM imports against the allowed namespace list.
fn validate_wasm_imports(wasm_bytes: &[u8]) -> Result<(), ExtensionError> {
    use wasmparser::{Parser, Payload};

    for payload in Parser::new(0).parse_all(wasm_bytes) {
        let payload = payload
            .map_err(|e| ExtensionError::WasmValidation(format!("failed to parse WASM: {e}")))?;

        if let Payload::ImportSection(reader) = payload {
            for import in reader {
                let import = import.map_err(|e| {
                    ExtensionError::WasmValidation(format!("failed to read import: {e}"))
                })?;

                if !ALLOWED_IMPORT_NAMESPACES.contains(&import.module) {
                    return Err(ExtensionError::WasmValidation(format!(
                        "unauthorized import namespace: '{}' (function: '{}'); \
                         allowed namespaces: {:?}",
                        import.module, import.name, ALLOWED_IMPORT_NAMESPACES
                    )));
                }
            }
        }
    }
    Ok(())
}

// ─── Sandbox ────────────────────────────────────────────────────────────

/// A compiled WASM module with memory and fuel limits.
pub struct WasmSandbox {
    plugin: extism::Plugin,
    name: String,
}

impl std::fmt::Debug for WasmSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmSandbox")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl WasmSandbox {
    /// Compile `wasm_bytes` into a sandboxed instance.
    ///
    /// Memory is limited in 64 KB pages; fuel is reset for every call.
    pub fn load(wasm_bytes: Vec<u8>, config: &SandboxConfig, name: &str) -> Result<Self, ExtensionError> {
        let manifest = extism::Manifest::new([extism::Wasm::data(wasm_bytes)])
            .with_memory_max((config.memory_limit / 65536) as u32);

        if config.wasi_enabled {
            tracing::warn!(
                extension = %name,
                "WASI enabled for extension, it can read environment variables"
            );
        }

        let plugin = extism::PluginBuilder::new(manifest)
            .with_wasi(config.wasi_enabled)
            .with_fuel_limit(config.fuel_limit)
            .build()
            .map_err(|e| ExtensionError::Sandbox(e.to_string()))?;

        Ok(Self {
            plugin,
            name: name.to_string(),
        })
    }

    /// Call an exported function with raw byte input/output.
    pub fn call(&mut self, function_name: &str, input: &[u8]) -> Result<Vec<u8>, ExtensionError> {
        self.plugin
            .call::<&[u8], Vec<u8>>(function_name, input)
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("fuel") {
                    ExtensionError::Sandbox(format!("{}: fuel exhausted", self.name))
                } else if msg.contains("memory") {
                    ExtensionError::Sandbox(format!("{}: memory limit exceeded", self.name))
                } else {
                    ExtensionError::Sandbox(msg)
                }
            })
    }

    /// Call an exported function with JSON-serialized input and output.
    pub fn call_json<I: Serialize, O: DeserializeOwned>(
        &mut self,
        function_name: &str,
        input: &I,
    ) -> Result<O, ExtensionError> {
        let json_bytes = serde_json::to_vec(input)?;
        let output_bytes = self.call(function_name, &json_bytes)?;
        Ok(serde_json::from_slice(&output_bytes)?)
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.plugin.function_exists(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

// ─── Host requests ──────────────────────────────────────────────────────

/// A host function request returned by a WASM hook.
#[derive(Debug, Deserialize)]
struct HostRequest {
    function: String,
    #[serde(default)]
    args: serde_json::Value,
}

/// Response from a WASM hook, optionally containing host requests.
#[derive(Debug, Default, Deserialize)]
struct HookResponse {
    #[serde(default)]
    host_requests: Vec<HostRequest>,
}

fn parse_response(output: &[u8]) -> HookResponse {
    if output.is_empty() {
        return HookResponse::default();
    }
    serde_json::from_slice(output).unwrap_or_default()
}

/// Execute host requests through the extension's capability-scoped handle.
///
/// Failures are logged per request and never abort the remaining ones.
async fn process_host_requests(host: &ExtensionHost, requests: Vec<HostRequest>) {
    for req in requests {
        let str_arg = |name: &str| req.args[name].as_str().unwrap_or_default().to_string();
        let result = match req.function.as_str() {
            "publish" => {
                let topic = str_arg("topic");
                let payload = req.args["payload"].clone();
                host.publish(&topic, payload).await.map(|_| ())
            }
            "send_chat_message" => host.send_chat_message(&str_arg("text")).await.map(|_| ()),
            "storage_set" => {
                host.storage_set(&str_arg("key"), str_arg("value").as_bytes())
                    .await
            }
            "storage_delete" => host.storage_delete(&str_arg("key")).await.map(|_| ()),
            "log_info" => {
                host.log_info(&str_arg("message"));
                Ok(())
            }
            "log_warn" => {
                host.log_warn(&str_arg("message"));
                Ok(())
            }
            "log_error" => {
                host.log_error(&str_arg("message"));
                Ok(())
            }
            other => {
                tracing::warn!(
                    extension = %host.identifier(),
                    function = %other,
                    "unknown host function request, ignoring"
                );
                continue;
            }
        };

        if let Err(e) = result {
            tracing::error!(
                extension = %host.identifier(),
                function = %req.function,
                "host function request failed: {e}"
            );
        }
    }
}

// ─── WASM-backed extension ──────────────────────────────────────────────

/// Adapts a [`WasmSandbox`] to the [`Extension`] lifecycle.
///
/// Lifecycle hooks are optional exports. While active, events on the
/// manifest's `subscriptions` are passed to `on_event` as JSON.
pub struct WasmExtension {
    sandbox: Arc<StdMutex<WasmSandbox>>,
    subscriptions: Vec<String>,
}

impl WasmExtension {
    pub fn new(sandbox: WasmSandbox, subscriptions: Vec<String>) -> Self {
        Self {
            sandbox: Arc::new(StdMutex::new(sandbox)),
            subscriptions,
        }
    }

    async fn call_hook(
        sandbox: Arc<StdMutex<WasmSandbox>>,
        hook: &'static str,
        input: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, ExtensionError> {
        tokio::task::spawn_blocking(move || {
            let mut sandbox = sandbox
                .lock()
                .map_err(|_| ExtensionError::Sandbox("sandbox poisoned by earlier panic".into()))?;
            if !sandbox.has_function(hook) {
                return Ok(None);
            }
            sandbox.call(hook, &input).map(Some)
        })
        .await
        .map_err(|e| ExtensionError::Sandbox(format!("{hook} did not complete: {e}")))?
    }

    async fn run_hook(
        &self,
        hook: &'static str,
        host: &ExtensionHost,
    ) -> Result<(), ExtensionError> {
        let input = serde_json::to_vec(&serde_json::json!({ "extension": host.identifier() }))?;
        if let Some(output) = Self::call_hook(Arc::clone(&self.sandbox), hook, input).await? {
            process_host_requests(host, parse_response(&output).host_requests).await;
        }
        Ok(())
    }
}

#[async_trait]
impl Extension for WasmExtension {
    async fn initialize(&mut self, host: &ExtensionHost) -> Result<(), ExtensionError> {
        self.run_hook(HOOK_INITIALIZE, host).await
    }

    async fn activate(&mut self, host: &ExtensionHost) -> Result<(), ExtensionError> {
        for topic in &self.subscriptions {
            let sandbox = Arc::clone(&self.sandbox);
            let handler_host = host.clone();
            host.subscribe(
                topic,
                events::handler(move |event: Arc<Event>| {
                    let sandbox = Arc::clone(&sandbox);
                    let host = handler_host.clone();
                    async move {
                        let input = serde_json::to_vec(event.as_ref())?;
                        if let Some(output) =
                            WasmExtension::call_hook(sandbox, HOOK_EVENT, input).await?
                        {
                            process_host_requests(&host, parse_response(&output).host_requests)
                                .await;
                        }
                        Ok::<(), ExtensionError>(())
                    }
                }),
            )
            .await?;
        }
        self.run_hook(HOOK_ACTIVATE, host).await
    }

    async fn deactivate(&mut self, host: &ExtensionHost) -> Result<(), ExtensionError> {
        self.run_hook(HOOK_DEACTIVATE, host).await
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// Smallest valid module: header only.
    const EMPTY_MODULE: &[u8] = b"\0asm\x01\x00\x00\x00";

    /// Module with one type `() -> ()` and one function import from `module`.
    fn module_importing(module: &str) -> Vec<u8> {
        let mut bytes = EMPTY_MODULE.to_vec();
        // type section
        bytes.extend_from_slice(&[0x01, 0x04, 0x01, 0x60, 0x00, 0x00]);
        // import section
        let mut body = vec![0x01, module.len() as u8];
        body.extend_from_slice(module.as_bytes());
        body.extend_from_slice(&[0x01, b'f', 0x00, 0x00]);
        bytes.push(0x02);
        bytes.push(body.len() as u8);
        bytes.extend_from_slice(&body);
        bytes
    }

    async fn write_wasm(dir: &tempfile::TempDir, bytes: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join("ext.wasm");
        tokio::fs::write(&path, bytes).await.unwrap();
        path
    }

    #[test]
    fn test_sandbox_config_default() {
        let config = SandboxConfig::default();
        assert_eq!(config.memory_limit, 32 * 1024 * 1024);
        assert_eq!(config.fuel_limit, 1_000_000);
        assert_eq!(config.max_wasm_size, 50 * 1024 * 1024);
        assert!(!config.wasi_enabled);
    }

    #[test]
    fn test_allowed_namespaces() {
        assert!(ALLOWED_IMPORT_NAMESPACES.contains(&"env"));
        assert!(ALLOWED_IMPORT_NAMESPACES.contains(&"wasi_snapshot_preview1"));
        assert!(!ALLOWED_IMPORT_NAMESPACES.contains(&"forbidden_module"));
    }

    #[tokio::test]
    async fn test_validate_wasm_accepts_minimal_module() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wasm(&dir, EMPTY_MODULE).await;
        let bytes = validate_wasm(&path, 1024).await.unwrap();
        assert_eq!(bytes, EMPTY_MODULE);
    }

    #[tokio::test]
    async fn test_validate_wasm_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wasm(&dir, &[0x7F, 0x45, 0x4C, 0x46, 1, 0, 0, 0]).await;
        let err = validate_wasm(&path, 1024).await.unwrap_err();
        assert!(matches!(err, ExtensionError::WasmValidation(ref m) if m.contains("magic")));
    }

    #[tokio::test]
    async fn test_validate_wasm_too_large() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wasm(&dir, EMPTY_MODULE).await;
        let err = validate_wasm(&path, 4).await.unwrap_err();
        assert!(matches!(err, ExtensionError::WasmValidation(ref m) if m.contains("too large")));
    }

    #[tokio::test]
    async fn test_validate_wasm_missing_file() {
        let err = validate_wasm(Path::new("/nonexistent/ext.wasm"), 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, ExtensionError::WasmValidation(_)));
    }

    #[test]
    fn test_validate_wasm_imports() {
        assert!(validate_wasm_imports(&module_importing("env")).is_ok());
        let err = validate_wasm_imports(&module_importing("forbidden")).unwrap_err();
        assert!(err.to_string().contains("forbidden"));
    }

    #[test]
    fn test_load_invalid_wasm() {
        let result = WasmSandbox::load(
            b"this is not valid wasm at all".to_vec(),
            &SandboxConfig::default(),
            "bad-ext",
        );
        assert!(matches!(result, Err(ExtensionError::Sandbox(_))));
    }

    #[test]
    fn test_parse_response() {
        let resp = parse_response(
            br#"{"host_requests":[{"function":"log_info","args":{"message":"hi"}}]}"#,
        );
        assert_eq!(resp.host_requests.len(), 1);
        assert_eq!(resp.host_requests[0].function, "log_info");

        assert!(parse_response(b"").host_requests.is_empty());
        assert!(parse_response(b"not json").host_requests.is_empty());
        assert!(parse_response(b"{}").host_requests.is_empty());
    }

    #[tokio::test]
    async fn test_process_host_requests_respects_capabilities() {
        use crate::events::EventBus;
        use crate::manifest::{Capability, ExtensionManifest};
        use crate::storage::StorageGateway;

        let manifest = ExtensionManifest {
            identifier: "wasm-ext".into(),
            name: "Wasm".into(),
            version: "0.1.0".into(),
            author: "t".into(),
            description: None,
            min_host_version: None,
            dependencies: vec![],
            permissions: [Capability::Storage].into_iter().collect(),
            main: Some("ext.wasm".into()),
            subscriptions: vec![],
            http_hosts: vec![],
            license: None,
            homepage: None,
        };
        let storage = Arc::new(StorageGateway::memory());
        let host = ExtensionHost::new(
            &manifest,
            Arc::new(EventBus::new()),
            Arc::clone(&storage),
            5,
        );

        let resp = parse_response(
            br#"{"host_requests":[
                {"function":"storage_set","args":{"key":"greeting","value":"hello"}},
                {"function":"send_chat_message","args":{"text":"not allowed"}},
                {"function":"no_such_function"},
                {"function":"storage_set","args":{"key":"second","value":"2"}}
            ]}"#,
        );
        process_host_requests(&host, resp.host_requests).await;

        assert_eq!(
            storage.get("wasm-ext", "greeting").await.unwrap(),
            Some(b"hello".to_vec())
        );
        assert_eq!(
            storage.get("wasm-ext", "second").await.unwrap(),
            Some(b"2".to_vec())
        );
    }
}
