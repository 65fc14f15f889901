//! Extension manifest parsing and validation.
//!
//! Every bundle carries an `extension.toml` (or `extension.json`) declaring
//! its identity, dependencies and requested capabilities. Parsing here is
//! purely structural: dependency existence and policy checks happen later in
//! the resolver and the permission validator.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ExtensionError;
use crate::events::validate_topic;

/// Preferred manifest file name inside a bundle.
pub const MANIFEST_TOML: &str = "extension.toml";

/// Fallback manifest file name inside a bundle.
pub const MANIFEST_JSON: &str = "extension.json";

// ─── Capabilities ───────────────────────────────────────────────────────

/// A named permission an extension must declare to use a gated host call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Capability {
    #[serde(rename = "network")]
    Network,
    #[serde(rename = "storage")]
    Storage,
    #[serde(rename = "chat:read")]
    ChatRead,
    #[serde(rename = "chat:write")]
    ChatWrite,
    #[serde(rename = "ui")]
    UiModification,
    #[serde(rename = "stream:metadata")]
    StreamMetadata,
}

impl Capability {
    /// Every capability, in declaration order.
    pub const ALL: [Capability; 6] = [
        Capability::Network,
        Capability::Storage,
        Capability::ChatRead,
        Capability::ChatWrite,
        Capability::UiModification,
        Capability::StreamMetadata,
    ];

    /// Manifest token for this capability.
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Network => "network",
            Capability::Storage => "storage",
            Capability::ChatRead => "chat:read",
            Capability::ChatWrite => "chat:write",
            Capability::UiModification => "ui",
            Capability::StreamMetadata => "stream:metadata",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = ExtensionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| {
                let known: Vec<&str> = Capability::ALL.iter().map(|c| c.as_str()).collect();
                ExtensionError::MalformedManifest(format!(
                    "unknown capability '{s}'; known capabilities: {}",
                    known.join(", ")
                ))
            })
    }
}

// ─── Manifest ───────────────────────────────────────────────────────────

/// Declared identity of an extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionManifest {
    pub identifier: String,
    pub name: String,
    pub version: String,
    pub author: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub min_host_version: Option<String>,
    /// Ordered list of identifiers this extension loads after.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, deserialize_with = "unique_capabilities")]
    pub permissions: BTreeSet<Capability>,
    /// Code unit: a relative `.wasm` path or a native factory name.
    #[serde(default)]
    pub main: Option<String>,
    /// Topics a WASM extension receives while active.
    #[serde(default)]
    pub subscriptions: Vec<String>,
    /// Allow-list for the `network` capability. Empty means any public host.
    #[serde(default)]
    pub http_hosts: Vec<String>,
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,
}

/// Reads the `permissions` list, refusing a token that appears twice.
fn unique_capabilities<'de, D>(deserializer: D) -> Result<BTreeSet<Capability>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let tokens = Vec::<Capability>::deserialize(deserializer)?;
    let mut set = BTreeSet::new();
    for capability in tokens {
        if !set.insert(capability) {
            return Err(serde::de::Error::custom(format!(
                "duplicate permission '{capability}'"
            )));
        }
    }
    Ok(set)
}

/// How a bundle's code unit is instantiated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeUnit {
    /// A WASM module, path relative to the bundle directory.
    Wasm(PathBuf),
    /// A factory registered on the loader under this name.
    Native(String),
}

// ─── Validation helpers ─────────────────────────────────────────────

/// Validate an extension identifier.
///
/// 2-64 characters; starts with a lowercase ASCII letter, followed by
/// lowercase letters, digits, `-`, `_` or `.`.
pub fn validate_identifier(id: &str) -> Result<(), ExtensionError> {
    let len = id.len();
    if !(2..=64).contains(&len) {
        return Err(ExtensionError::MalformedManifest(format!(
            "identifier must be 2-64 characters, got {len}: '{id}'"
        )));
    }

    let mut chars = id.chars();
    if let Some(first) = chars.next() {
        if !first.is_ascii_lowercase() {
            return Err(ExtensionError::MalformedManifest(format!(
                "identifier must start with a lowercase letter, got '{first}'"
            )));
        }
    }

    for ch in chars {
        if !ch.is_ascii_lowercase() && !ch.is_ascii_digit() && !matches!(ch, '-' | '_' | '.') {
            return Err(ExtensionError::MalformedManifest(format!(
                "identifier '{id}' contains invalid character '{ch}'"
            )));
        }
    }

    Ok(())
}

fn validate_semver(value: &str, field_name: &str) -> Result<semver::Version, ExtensionError> {
    semver::Version::parse(value).map_err(|_| {
        ExtensionError::MalformedManifest(format!("{field_name} is not valid semver: '{value}'"))
    })
}

fn validate_length(value: &str, field_name: &str, max: usize) -> Result<(), ExtensionError> {
    let len = value.trim().len();
    if len == 0 || len > max {
        return Err(ExtensionError::MalformedManifest(format!(
            "{field_name} must be 1-{max} characters, got {len}"
        )));
    }
    Ok(())
}

/// Validate that a path is safe (no `..` components, not absolute).
fn validate_path_safety(path: &str, field_name: &str) -> Result<(), ExtensionError> {
    let p = Path::new(path);
    if p.is_absolute() {
        return Err(ExtensionError::MalformedManifest(format!(
            "{field_name} must be a relative path, got absolute: '{path}'"
        )));
    }
    if p.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(ExtensionError::MalformedManifest(format!(
            "{field_name} must not contain '..': '{path}'"
        )));
    }
    Ok(())
}

/// Must be non-empty, contain no spaces, and either be `"*"`, `"localhost"`,
/// or contain at least one dot.
fn validate_http_host(host: &str) -> Result<(), ExtensionError> {
    if host.is_empty() || host.contains(' ') {
        return Err(ExtensionError::MalformedManifest(format!(
            "httpHosts entry is not a valid domain: '{host}'"
        )));
    }
    if host != "*" && host != "localhost" && !host.contains('.') {
        return Err(ExtensionError::MalformedManifest(format!(
            "httpHosts entry is not a valid domain: '{host}'"
        )));
    }
    Ok(())
}

impl ExtensionManifest {
    /// Parse a manifest from a TOML string.
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ExtensionError> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Parse a manifest from a JSON string.
    pub fn from_json_str(json_str: &str) -> Result<Self, ExtensionError> {
        Ok(serde_json::from_str(json_str)?)
    }

    /// Validate all fields of a parsed manifest.
    pub fn validate(&self) -> Result<(), ExtensionError> {
        validate_identifier(&self.identifier)?;
        validate_length(&self.name, "name", 100)?;
        validate_semver(&self.version, "version")?;
        validate_length(&self.author, "author", 255)?;

        if let Some(ref description) = self.description {
            if description.len() > 500 {
                return Err(ExtensionError::MalformedManifest(format!(
                    "description must be at most 500 characters, got {}",
                    description.len()
                )));
            }
        }

        if let Some(ref min) = self.min_host_version {
            validate_semver(min, "minHostVersion")?;
        }

        let mut seen = BTreeSet::new();
        for dep in &self.dependencies {
            validate_identifier(dep).map_err(|_| {
                ExtensionError::MalformedManifest(format!("invalid dependency identifier '{dep}'"))
            })?;
            if dep == &self.identifier {
                return Err(ExtensionError::MalformedManifest(format!(
                    "extension '{}' lists itself as a dependency",
                    self.identifier
                )));
            }
            if !seen.insert(dep.as_str()) {
                return Err(ExtensionError::MalformedManifest(format!(
                    "dependency '{dep}' listed more than once"
                )));
            }
        }

        if let Some(ref main) = self.main {
            if main.trim().is_empty() {
                return Err(ExtensionError::MalformedManifest(
                    "main must not be empty".into(),
                ));
            }
            if main.ends_with(".wasm") {
                validate_path_safety(main, "main")?;
            }
        }

        for topic in &self.subscriptions {
            validate_topic(topic).map_err(|_| {
                ExtensionError::MalformedManifest(format!("invalid subscription topic '{topic}'"))
            })?;
        }

        for host in &self.http_hosts {
            validate_http_host(host)?;
        }

        Ok(())
    }

    /// Parsed semantic version. Call after [`validate`](Self::validate).
    pub fn semver(&self) -> Result<semver::Version, ExtensionError> {
        validate_semver(&self.version, "version")
    }

    /// Fail with `IncompatibleVersion` when the host is older than required.
    pub fn check_host_version(&self, host: &semver::Version) -> Result<(), ExtensionError> {
        let Some(ref min) = self.min_host_version else {
            return Ok(());
        };
        let required = validate_semver(min, "minHostVersion")?;
        if *host < required {
            return Err(ExtensionError::IncompatibleVersion {
                id: self.identifier.clone(),
                required: required.to_string(),
                host: host.to_string(),
            });
        }
        Ok(())
    }

    pub fn requests(&self, capability: Capability) -> bool {
        self.permissions.contains(&capability)
    }

    /// The code unit this manifest points at.
    pub fn code_unit(&self) -> CodeUnit {
        match self.main.as_deref() {
            Some(main) if main.ends_with(".wasm") => CodeUnit::Wasm(PathBuf::from(main)),
            Some(main) => CodeUnit::Native(main.to_string()),
            None => CodeUnit::Native(self.identifier.clone()),
        }
    }
}

// ─── Bundle parsing ─────────────────────────────────────────────────────

/// Parse and validate the manifest of the bundle at `bundle_dir`.
///
/// Every parse or validation failure surfaces as `MalformedManifest` naming
/// the offending file.
pub async fn parse_bundle(bundle_dir: &Path) -> Result<ExtensionManifest, ExtensionError> {
    let toml_path = bundle_dir.join(MANIFEST_TOML);
    let json_path = bundle_dir.join(MANIFEST_JSON);

    let (path, parsed) = if tokio::fs::try_exists(&toml_path).await.unwrap_or(false) {
        let content = tokio::fs::read_to_string(&toml_path).await?;
        (toml_path, ExtensionManifest::from_toml_str(&content))
    } else if tokio::fs::try_exists(&json_path).await.unwrap_or(false) {
        let content = tokio::fs::read_to_string(&json_path).await?;
        (json_path, ExtensionManifest::from_json_str(&content))
    } else {
        return Err(ExtensionError::MalformedManifest(format!(
            "no {MANIFEST_TOML} or {MANIFEST_JSON} in {}",
            bundle_dir.display()
        )));
    };

    let manifest = parsed.map_err(|e| match e {
        ExtensionError::MalformedManifest(msg) => ExtensionError::MalformedManifest(msg),
        other => ExtensionError::MalformedManifest(format!("{}: {other}", path.display())),
    })?;
    manifest.validate()?;
    Ok(manifest)
}

// ─── Tests ──────────────────────────────────────────────────────────
