//! Host functions exposed to extensions.
//!
//! Every loaded extension gets its own [`ExtensionHost`], minted at load
//! time from its manifest. Each capability-gated call checks the declared
//! permissions before doing anything, so an extension can only reach what it
//! asked for and the host policy granted.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::{RwLock, RwLockReadGuard};
use tokio_util::sync::CancellationToken;

use crate::commands;
use crate::error::ExtensionError;
use crate::events::{self, Event, EventBus, EventHandler, SubscriptionId, WILDCARD};
use crate::manifest::{Capability, ExtensionManifest};
use crate::storage::StorageGateway;

/// Maximum HTTP response body size (10 MB).
const MAX_HTTP_RESPONSE_BYTES: usize = 10 * 1024 * 1024;

/// Maximum log message length from extensions.
const MAX_LOG_MESSAGE_LEN: usize = 2048;

/// Maximum chat message length an extension may send.
const MAX_CHAT_MESSAGE_LEN: usize = 500;

/// UI slots an extension may register a panel into.
pub const VALID_UI_SLOTS: &[&str] = &[
    "chat-header",
    "chat-footer",
    "chat-message-actions",
    "player-overlay",
    "sidebar",
    "settings",
];

/// Topic prefixes only the host may publish under.
const RESERVED_PREFIXES: &[&str] = &["extension.", "ui."];

/// Sanitize a log message from an extension.
///
/// Strips control characters (except newline/tab), truncates to max length.
fn sanitize_log_message(message: &str) -> String {
    let cleaned: String = message
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .take(MAX_LOG_MESSAGE_LEN)
        .collect();
    if message.chars().count() > MAX_LOG_MESSAGE_LEN {
        format!("{cleaned}… (truncated)")
    } else {
        cleaned
    }
}

/// Capability needed to subscribe to `topic`, if any.
fn subscribe_capabilities(topic: &str) -> &'static [Capability] {
    if topic == WILDCARD {
        &[Capability::ChatRead, Capability::StreamMetadata]
    } else if topic.starts_with("chat.") {
        &[Capability::ChatRead]
    } else if topic.starts_with("stream.") {
        &[Capability::StreamMetadata]
    } else {
        &[]
    }
}

// ─── Types shared with extensions ───────────────────────────────────────

/// HTTP response returned by http_get / http_post.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

// ─── Host handle ────────────────────────────────────────────────────────

/// Capability-scoped handle through which one extension reaches the host.
///
/// Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct ExtensionHost {
    inner: Arc<HostInner>,
}

struct HostInner {
    identifier: String,
    permissions: BTreeSet<Capability>,
    http_hosts: Vec<String>,
    bus: Arc<EventBus>,
    storage: Arc<StorageGateway>,
    /// Shared HTTP client for connection pooling.
    http_client: reqwest::Client,
    cancel: StdMutex<CancellationToken>,
    /// Read-held while attaching anything `release` tears down; write-held by `release`.
    activation: RwLock<()>,
    commands: StdMutex<HashSet<SubscriptionId>>,
    /// slot -> entry
    panels: StdMutex<BTreeMap<String, String>>,
}

fn locked<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ExtensionHost {
    /// Mint a host handle for the extension described by `manifest`.
    pub fn new(
        manifest: &ExtensionManifest,
        bus: Arc<EventBus>,
        storage: Arc<StorageGateway>,
        http_timeout_secs: u64,
    ) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(http_timeout_secs))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_default();
        Self {
            inner: Arc::new(HostInner {
                identifier: manifest.identifier.clone(),
                permissions: manifest.permissions.clone(),
                http_hosts: manifest.http_hosts.clone(),
                bus,
                storage,
                http_client,
                cancel: StdMutex::new(CancellationToken::new()),
                activation: RwLock::new(()),
                commands: StdMutex::new(HashSet::new()),
                panels: StdMutex::new(BTreeMap::new()),
            }),
        }
    }

    fn require(&self, capability: Capability) -> Result<(), ExtensionError> {
        if self.inner.permissions.contains(&capability) {
            Ok(())
        } else {
            tracing::debug!(
                extension = %self.inner.identifier,
                capability = %capability,
                "capability-gated call refused"
            );
            Err(ExtensionError::PermissionDenied(capability))
        }
    }

    /// Refuse new attachments once the current activation has ended.
    async fn attach_guard(
        &self,
        operation: &'static str,
    ) -> Result<RwLockReadGuard<'_, ()>, ExtensionError> {
        let guard = self.inner.activation.read().await;
        if self.is_cancelled() {
            return Err(ExtensionError::InvalidState {
                id: self.inner.identifier.clone(),
                operation,
                state: "released".into(),
            });
        }
        Ok(guard)
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.inner.permissions.contains(&capability)
    }

    // ── Events ───────────────────────────────────────────────────────

    /// Subscribe to `topic` on behalf of this extension.
    pub async fn subscribe(
        &self,
        topic: &str,
        handler: EventHandler,
    ) -> Result<SubscriptionId, ExtensionError> {
        events::validate_topic(topic)?;
        for cap in subscribe_capabilities(topic) {
            self.require(*cap)?;
        }
        let _attach = self.attach_guard("subscribe").await?;
        self.inner
            .bus
            .subscribe(topic, Some(&self.inner.identifier), handler)
            .await
    }

    /// Remove one of this extension's own subscriptions.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), ExtensionError> {
        self.inner
            .bus
            .unsubscribe_owned(&self.inner.identifier, id)
            .await?;
        locked(&self.inner.commands).remove(&id);
        Ok(())
    }

    /// Publish an event sourced from this extension.
    ///
    /// Returns the number of subscriptions it was queued for.
    pub async fn publish(
        &self,
        topic: &str,
        payload: serde_json::Value,
    ) -> Result<usize, ExtensionError> {
        if topic == WILDCARD {
            return Err(ExtensionError::InvalidTopic(
                "cannot publish to the wildcard".into(),
            ));
        }
        events::validate_topic(topic)?;
        if RESERVED_PREFIXES.iter().any(|p| topic.starts_with(p)) {
            return Err(ExtensionError::ReservedTopic(topic.to_string()));
        }
        if topic.starts_with("chat.") {
            self.require(Capability::ChatWrite)?;
        }

        let event = Event::from_value(topic, payload).with_source(&self.inner.identifier);
        Ok(self.inner.bus.publish(event).await)
    }

    // ── Chat ─────────────────────────────────────────────────────────

    /// Register a chat command. Invocations arrive as `chat.command.<name>`.
    pub async fn register_command(
        &self,
        name: &str,
        handler: EventHandler,
    ) -> Result<SubscriptionId, ExtensionError> {
        self.require(Capability::ChatRead)?;
        if !commands::is_valid_command_name(name) {
            return Err(ExtensionError::HostFunction(format!(
                "invalid command name: '{name}'"
            )));
        }

        let topic = commands::command_topic(name);
        let _attach = self.attach_guard("register a command").await?;
        let id = self
            .inner
            .bus
            .subscribe(&topic, Some(&self.inner.identifier), handler)
            .await?;
        locked(&self.inner.commands).insert(id);
        tracing::info!(extension = %self.inner.identifier, command = %name, "command registered");
        Ok(id)
    }

    pub async fn unregister_command(&self, id: SubscriptionId) -> Result<(), ExtensionError> {
        if !locked(&self.inner.commands).remove(&id) {
            return Err(ExtensionError::SubscriptionNotFound(id.as_uuid()));
        }
        self.inner
            .bus
            .unsubscribe_owned(&self.inner.identifier, id)
            .await
    }

    /// Send a chat message as this extension.
    pub async fn send_chat_message(&self, text: &str) -> Result<usize, ExtensionError> {
        self.require(Capability::ChatWrite)?;
        let text = text.trim();
        if text.is_empty() || text.chars().count() > MAX_CHAT_MESSAGE_LEN {
            return Err(ExtensionError::HostFunction(format!(
                "chat message must be 1-{MAX_CHAT_MESSAGE_LEN} characters"
            )));
        }
        let event = Event::from_value(
            events::CHAT_MESSAGE_SEND,
            serde_json::json!({ "text": text, "extension": self.inner.identifier }),
        )
        .with_source(&self.inner.identifier);
        Ok(self.inner.bus.publish(event).await)
    }

    // ── Storage (requires storage) ───────────────────────────────────

    pub async fn storage_get(&self, key: &str) -> Result<Option<Vec<u8>>, ExtensionError> {
        self.require(Capability::Storage)?;
        Ok(self.inner.storage.get(&self.inner.identifier, key).await?)
    }

    pub async fn storage_set(&self, key: &str, value: &[u8]) -> Result<(), ExtensionError> {
        self.require(Capability::Storage)?;
        Ok(self
            .inner
            .storage
            .set(&self.inner.identifier, key, value)
            .await?)
    }

    /// Returns whether a value existed.
    pub async fn storage_delete(&self, key: &str) -> Result<bool, ExtensionError> {
        self.require(Capability::Storage)?;
        Ok(self.inner.storage.delete(&self.inner.identifier, key).await?)
    }

    pub async fn storage_list_keys(&self) -> Result<BTreeSet<String>, ExtensionError> {
        self.require(Capability::Storage)?;
        Ok(self.inner.storage.list_keys(&self.inner.identifier).await?)
    }

    pub async fn storage_get_json<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, ExtensionError> {
        match self.storage_get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn storage_set_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<(), ExtensionError> {
        let bytes = serde_json::to_vec(value)?;
        self.storage_set(key, &bytes).await
    }

    // ── UI (requires ui) ─────────────────────────────────────────────

    /// Register a panel in `slot`. Replaces this extension's previous panel there.
    pub async fn register_ui_panel(&self, slot: &str, entry: &str) -> Result<(), ExtensionError> {
        self.require(Capability::UiModification)?;
        if !VALID_UI_SLOTS.contains(&slot) {
            return Err(ExtensionError::HostFunction(format!(
                "invalid UI slot '{slot}', expected one of: {}",
                VALID_UI_SLOTS.join(", ")
            )));
        }
        if entry.is_empty() || entry.contains("..") {
            return Err(ExtensionError::HostFunction(format!(
                "invalid UI entry point: '{entry}'"
            )));
        }

        let _attach = self.attach_guard("register a UI panel").await?;
        locked(&self.inner.panels).insert(slot.to_string(), entry.to_string());
        self.inner
            .bus
            .publish(Event::from_value(
                events::UI_PANEL_REGISTERED,
                serde_json::json!({
                    "extension": self.inner.identifier,
                    "slot": slot,
                    "entry": entry,
                }),
            ))
            .await;
        Ok(())
    }

    /// Returns whether a panel was registered in `slot`.
    pub async fn remove_ui_panel(&self, slot: &str) -> Result<bool, ExtensionError> {
        self.require(Capability::UiModification)?;
        let removed = locked(&self.inner.panels).remove(slot).is_some();
        if removed {
            self.publish_panel_removed(slot).await;
        }
        Ok(removed)
    }

    pub fn ui_panels(&self) -> BTreeMap<String, String> {
        locked(&self.inner.panels).clone()
    }

    async fn publish_panel_removed(&self, slot: &str) {
        self.inner
            .bus
            .publish(Event::from_value(
                events::UI_PANEL_REMOVED,
                serde_json::json!({ "extension": self.inner.identifier, "slot": slot }),
            ))
            .await;
    }

    // ── HTTP functions (requires network) ────────────────────────────

    /// Check if a URL's host is in the allowed list (supports glob patterns).
    ///
    /// An empty list allows any host; private addresses are refused separately.
    fn check_http_host(&self, url_str: &str) -> Result<(), ExtensionError> {
        self.require(Capability::Network)?;

        let url = url::Url::parse(url_str)
            .map_err(|_| ExtensionError::HostFunction(format!("invalid URL: {url_str}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ExtensionError::HostFunction(format!(
                "unsupported URL scheme: {}",
                url.scheme()
            )));
        }

        let host = url
            .host_str()
            .ok_or_else(|| ExtensionError::HostFunction(format!("URL has no host: {url_str}")))?;

        if self.inner.http_hosts.is_empty() || self.inner.http_hosts.iter().any(|h| h == "*") {
            return Ok(());
        }

        let matches = self.inner.http_hosts.iter().any(|pattern| {
            if let Some(suffix) = pattern.strip_prefix("*.") {
                // *.example.com matches sub.example.com, a.b.example.com
                host == suffix || host.ends_with(&format!(".{suffix}"))
            } else {
                host == pattern
            }
        });

        if !matches {
            return Err(ExtensionError::HostNotAllowed(host.to_string()));
        }
        Ok(())
    }

    /// SECURITY: Block requests to private/reserved IP addresses.
    fn check_private_ip(&self, url_str: &str) -> Result<(), ExtensionError> {
        let url = url::Url::parse(url_str)
            .map_err(|_| ExtensionError::HostFunction(format!("invalid URL: {url_str}")))?;

        let blocked_name = |name: &str| {
            matches!(
                name,
                "localhost" | "metadata.google.internal" | "metadata"
            ) || name.ends_with(".localhost")
        };

        let is_private = match url.host() {
            None => false,
            Some(url::Host::Domain(name)) => blocked_name(name),
            Some(url::Host::Ipv4(v4)) => {
                v4.is_private()
                    || v4.is_loopback()
                    || v4.is_link_local()
                    || v4.is_unspecified()
                    || v4.is_broadcast()
            }
            Some(url::Host::Ipv6(v6)) => {
                v6.is_loopback()
                    || v6.is_unspecified()
                    // fc00::/7 unique local, fe80::/10 link local
                    || (v6.segments()[0] & 0xfe00) == 0xfc00
                    || (v6.segments()[0] & 0xffc0) == 0xfe80
                    || v6.to_ipv4_mapped().is_some_and(|v4| {
                        v4.is_private() || v4.is_loopback() || v4.is_link_local()
                    })
            }
        };

        if is_private {
            return Err(ExtensionError::HostNotAllowed(format!(
                "{} (private/reserved address)",
                url.host_str().unwrap_or_default()
            )));
        }
        Ok(())
    }

    /// Perform an HTTP GET request. Requires `network`.
    pub async fn http_get(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<HttpResponse, ExtensionError> {
        self.check_http_host(url)?;
        self.check_private_ip(url)?;

        let mut req = self.inner.http_client.get(url);
        for (k, v) in headers {
            req = req.header(k.as_str(), v.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ExtensionError::Http(e.to_string()))?;
        read_response(resp).await
    }

    /// Perform an HTTP POST request. Requires `network`.
    pub async fn http_post(
        &self,
        url: &str,
        body: &str,
        headers: &HashMap<String, String>,
    ) -> Result<HttpResponse, ExtensionError> {
        self.check_http_host(url)?;
        self.check_private_ip(url)?;

        let mut req = self.inner.http_client.post(url).body(body.to_string());
        for (k, v) in headers {
            req = req.header(k.as_str(), v.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ExtensionError::Http(e.to_string()))?;
        read_response(resp).await
    }

    // ── Logging functions (no permission) ────────────────────────────

    pub fn log_info(&self, message: &str) {
        let msg = sanitize_log_message(message);
        tracing::info!(extension = %self.inner.identifier, "{msg}");
    }

    pub fn log_warn(&self, message: &str) {
        let msg = sanitize_log_message(message);
        tracing::warn!(extension = %self.inner.identifier, "{msg}");
    }

    pub fn log_error(&self, message: &str) {
        let msg = sanitize_log_message(message);
        tracing::error!(extension = %self.inner.identifier, "{msg}");
    }

    // ── Cancellation ─────────────────────────────────────────────────

    /// Token cancelled when the current activation ends.
    ///
    /// Long-running extension work should poll it or `select!` on
    /// `cancelled()` and return promptly.
    pub fn cancellation_token(&self) -> CancellationToken {
        locked(&self.inner.cancel).clone()
    }

    pub fn is_cancelled(&self) -> bool {
        locked(&self.inner.cancel).is_cancelled()
    }

    /// Install a fresh token before an activation.
    pub(crate) fn rearm(&self) {
        let mut token = locked(&self.inner.cancel);
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
    }

    /// End the current activation: signal cancellation, drop every
    /// subscription and command, and withdraw UI panels.
    pub(crate) async fn release(&self) {
        let _detach = self.inner.activation.write().await;
        locked(&self.inner.cancel).cancel();
        locked(&self.inner.commands).clear();

        let removed = self.inner.bus.unsubscribe_owner(&self.inner.identifier).await;
        let panels: Vec<String> = std::mem::take(&mut *locked(&self.inner.panels))
            .into_keys()
            .collect();
        for slot in &panels {
            self.publish_panel_removed(slot).await;
        }

        tracing::debug!(
            extension = %self.inner.identifier,
            subscriptions = removed,
            panels = panels.len(),
            "released extension host resources"
        );
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn identifier(&self) -> &str {
        &self.inner.identifier
    }

    pub fn permissions(&self) -> &BTreeSet<Capability> {
        &self.inner.permissions
    }
}

/// Read HTTP response with body size limit.
async fn read_response(resp: reqwest::Response) -> Result<HttpResponse, ExtensionError> {
    if resp
        .content_length()
        .is_some_and(|len| len > MAX_HTTP_RESPONSE_BYTES as u64)
    {
        return Err(ExtensionError::Http(format!(
            "response body too large (max: {MAX_HTTP_RESPONSE_BYTES} bytes)"
        )));
    }

    let status = resp.status().as_u16();
    let resp_headers: HashMap<String, String> = resp
        .headers()
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
        .collect();

    let body_bytes = resp
        .bytes()
        .await
        .map_err(|e| ExtensionError::Http(e.to_string()))?;

    if body_bytes.len() > MAX_HTTP_RESPONSE_BYTES {
        return Err(ExtensionError::Http(format!(
            "response body too large: {} bytes (max: {} bytes)",
            body_bytes.len(),
            MAX_HTTP_RESPONSE_BYTES
        )));
    }

    Ok(HttpResponse {
        status,
        headers: resp_headers,
        body: String::from_utf8_lossy(&body_bytes).to_string(),
    })
}

// ─── Tests ──────────────────────────────────────────────────────────
