// Shared test utilities for integration tests
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use streamshell_extensions::{
    handler, Extension, ExtensionContext, ExtensionError, ExtensionHost, ExtensionLoader,
};

/// Write `<root>/<dir>/extension.toml`.
pub fn write_bundle(root: &Path, dir: &str, manifest: &str) -> PathBuf {
    let bundle = root.join(dir);
    std::fs::create_dir_all(&bundle).unwrap();
    std::fs::write(bundle.join("extension.toml"), manifest).unwrap();
    bundle
}

/// Minimal manifest text for `id`.
pub fn manifest(id: &str, dependencies: &[&str], permissions: &[&str]) -> String {
    let quote = |items: &[&str]| {
        items
            .iter()
            .map(|s| format!("\"{s}\""))
            .collect::<Vec<_>>()
            .join(", ")
    };
    format!(
        "identifier = \"{id}\"\nname = \"{id}\"\nversion = \"1.0.0\"\nauthor = \"tests\"\n\
         dependencies = [{}]\npermissions = [{}]\n",
        quote(dependencies),
        quote(permissions)
    )
}

/// Ordered log of callbacks, shared by every recording extension in a test.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Initialize,
    Activate,
    Deactivate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    None,
    Error(Stage),
    Panic(Stage),
}

/// Journals each callback; on activate subscribes to `stream.started` and
/// counts deliveries.
pub struct Recording {
    id: String,
    journal: Journal,
    deliveries: Arc<AtomicUsize>,
    fault: Fault,
}

impl Recording {
    fn step(&self, stage: Stage, label: &str) -> Result<(), ExtensionError> {
        self.journal.push(format!("{label}:{}", self.id));
        match self.fault {
            Fault::Error(s) if s == stage => Err(ExtensionError::handler(format!("{label} refused"))),
            Fault::Panic(s) if s == stage => panic!("{label} exploded"),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Extension for Recording {
    async fn initialize(&mut self, _host: &ExtensionHost) -> Result<(), ExtensionError> {
        self.step(Stage::Initialize, "initialize")
    }

    async fn activate(&mut self, host: &ExtensionHost) -> Result<(), ExtensionError> {
        self.step(Stage::Activate, "activate")?;
        if host.has_capability(streamshell_extensions::Capability::StreamMetadata) {
            let deliveries = Arc::clone(&self.deliveries);
            host.subscribe(
                "stream.started",
                handler(move |_| {
                    let deliveries = Arc::clone(&deliveries);
                    async move {
                        deliveries.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .await?;
        }
        Ok(())
    }

    async fn deactivate(&mut self, _host: &ExtensionHost) -> Result<(), ExtensionError> {
        self.step(Stage::Deactivate, "deactivate")
    }
}

/// Register a recording factory under `id`. Returns its delivery counter.
pub fn register(loader: &ExtensionLoader, id: &str, journal: &Journal, fault: Fault) -> Arc<AtomicUsize> {
    let deliveries = Arc::new(AtomicUsize::new(0));
    let journal = journal.clone();
    let counter = Arc::clone(&deliveries);
    let name = id.to_string();
    loader.register_fn(id, move |_| {
        Ok(Box::new(Recording {
            id: name.clone(),
            journal: journal.clone(),
            deliveries: Arc::clone(&counter),
            fault,
        }) as Box<dyn Extension>)
    });
    deliveries
}

/// Context over a fresh temp root with in-memory storage.
pub fn context() -> (tempfile::TempDir, ExtensionContext) {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ExtensionContext::in_memory(dir.path());
    (dir, ctx)
}

/// Poll until `counter` reaches `expected` or a second passes.
pub async fn wait_for(counter: &AtomicUsize, expected: usize) {
    for _ in 0..50 {
        if counter.load(Ordering::SeqCst) >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
