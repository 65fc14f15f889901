//! Extension loader: turns a bundle into a callable instance.
//!
//! Native extensions are produced by factories registered by name; WASM
//! bundles are validated and compiled into an Extism sandbox.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::error::ExtensionError;
use crate::host_functions::ExtensionHost;
use crate::manifest::{CodeUnit, ExtensionManifest};
use crate::sandbox::{self, SandboxConfig, WasmExtension, WasmSandbox};

/// Entry points the lifecycle controller drives on a loaded extension.
///
/// Callbacks are cooperative: long-running work should watch
/// [`ExtensionHost::cancellation_token`] and return promptly.
#[async_trait]
pub trait Extension: Send {
    async fn initialize(&mut self, _host: &ExtensionHost) -> Result<(), ExtensionError> {
        Ok(())
    }

    async fn activate(&mut self, host: &ExtensionHost) -> Result<(), ExtensionError>;

    async fn deactivate(&mut self, _host: &ExtensionHost) -> Result<(), ExtensionError> {
        Ok(())
    }
}

/// Builds a fresh instance for a manifest.
pub type ExtensionFactory =
    Arc<dyn Fn(&ExtensionManifest) -> Result<Box<dyn Extension>, ExtensionError> + Send + Sync>;

/// Instantiates code units named by manifests.
pub struct ExtensionLoader {
    factories: RwLock<HashMap<String, ExtensionFactory>>,
    sandbox_config: SandboxConfig,
}

impl Default for ExtensionLoader {
    fn default() -> Self {
        Self::new(SandboxConfig::default())
    }
}

impl ExtensionLoader {
    pub fn new(sandbox_config: SandboxConfig) -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
            sandbox_config,
        }
    }

    /// Register a native factory under `name`, replacing any previous one.
    pub fn register(&self, name: impl Into<String>, factory: ExtensionFactory) {
        let name = name.into();
        tracing::debug!(factory = %name, "registered native extension factory");
        self.factories
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name, factory);
    }

    /// Register a closure as a native factory.
    pub fn register_fn<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&ExtensionManifest) -> Result<Box<dyn Extension>, ExtensionError>
            + Send
            + Sync
            + 'static,
    {
        self.register(name, Arc::new(factory));
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.factories
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(name)
            .is_some()
    }

    pub fn has_factory(&self, name: &str) -> bool {
        self.factory(name).is_some()
    }

    fn factory(&self, name: &str) -> Option<ExtensionFactory> {
        self.factories
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }

    pub fn sandbox_config(&self) -> &SandboxConfig {
        &self.sandbox_config
    }

    /// Create a new instance of the bundle at `bundle_dir`.
    ///
    /// Every failure to produce an instance surfaces as `InvalidBundle`.
    pub async fn instantiate(
        &self,
        manifest: &ExtensionManifest,
        bundle_dir: &Path,
    ) -> Result<Box<dyn Extension>, ExtensionError> {
        let invalid = |reason: String| ExtensionError::InvalidBundle {
            id: manifest.identifier.clone(),
            reason,
        };

        match manifest.code_unit() {
            CodeUnit::Native(name) => {
                let factory = self
                    .factory(&name)
                    .ok_or_else(|| invalid(format!("no native factory registered as '{name}'")))?;
                factory(manifest).map_err(|e| invalid(e.to_string()))
            }
            CodeUnit::Wasm(relative) => {
                let wasm_path = bundle_dir.join(&relative);
                let bytes = sandbox::validate_wasm(&wasm_path, self.sandbox_config.max_wasm_size)
                    .await
                    .map_err(|e| invalid(e.to_string()))?;

                let config = self.sandbox_config.clone();
                let name = manifest.identifier.clone();
                let compiled =
                    tokio::task::spawn_blocking(move || WasmSandbox::load(bytes, &config, &name))
                        .await
                        .map_err(|e| invalid(format!("WASM compilation aborted: {e}")))?
                        .map_err(|e| invalid(e.to_string()))?;

                tracing::debug!(
                    extension = %manifest.identifier,
                    wasm = %wasm_path.display(),
                    "compiled WASM extension"
                );
                Ok(Box::new(WasmExtension::new(
                    compiled,
                    manifest.subscriptions.clone(),
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    struct Noop;

    #[async_trait]
    impl Extension for Noop {
        async fn activate(&mut self, _host: &ExtensionHost) -> Result<(), ExtensionError> {
            Ok(())
        }
    }

    fn manifest(id: &str, main: Option<&str>) -> ExtensionManifest {
        ExtensionManifest {
            identifier: id.into(),
            name: id.into(),
            version: "1.0.0".into(),
            author: "test".into(),
            description: None,
            min_host_version: None,
            dependencies: vec![],
            permissions: BTreeSet::new(),
            main: main.map(str::to_string),
            subscriptions: vec![],
            http_hosts: vec![],
            license: None,
            homepage: None,
        }
    }

    #[tokio::test]
    async fn test_native_factory_by_identifier() {
        let loader = ExtensionLoader::default();
        loader.register_fn("greeter", |_| Ok(Box::new(Noop) as Box<dyn Extension>));
        assert!(loader.has_factory("greeter"));

        let dir = tempfile::tempdir().unwrap();
        assert!(loader
            .instantiate(&manifest("greeter", None), dir.path())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_native_factory_by_main() {
        let loader = ExtensionLoader::default();
        loader.register_fn("shared-impl", |_| Ok(Box::new(Noop) as Box<dyn Extension>));

        let dir = tempfile::tempdir().unwrap();
        assert!(loader
            .instantiate(&manifest("some-ext", Some("shared-impl")), dir.path())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_missing_factory_is_invalid_bundle() {
        let loader = ExtensionLoader::default();
        let dir = tempfile::tempdir().unwrap();
        let err = loader
            .instantiate(&manifest("ghost", None), dir.path())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ExtensionError::InvalidBundle { ref id, .. } if id == "ghost"));
    }

    #[tokio::test]
    async fn test_factory_error_is_invalid_bundle() {
        let loader = ExtensionLoader::default();
        loader.register_fn("broken", |_| Err(ExtensionError::handler("cannot build")));
        let dir = tempfile::tempdir().unwrap();
        let err = loader
            .instantiate(&manifest("broken", None), dir.path())
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("cannot build"));
    }

    #[tokio::test]
    async fn test_missing_wasm_is_invalid_bundle() {
        let loader = ExtensionLoader::default();
        let dir = tempfile::tempdir().unwrap();
        let err = loader
            .instantiate(&manifest("wasm-ext", Some("missing.wasm")), dir.path())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ExtensionError::InvalidBundle { .. }));
    }

    #[test]
    fn test_unregister() {
        let loader = ExtensionLoader::default();
        loader.register_fn("tmp", |_| Ok(Box::new(Noop) as Box<dyn Extension>));
        assert!(loader.unregister("tmp"));
        assert!(!loader.unregister("tmp"));
        assert!(!loader.has_factory("tmp"));
    }
}
