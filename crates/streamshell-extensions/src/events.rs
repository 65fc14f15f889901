//! Topic-based publish/subscribe between host and extensions.
//!
//! Every subscription owns an unbounded queue drained by its own task, so
//! each subscriber sees events in publish order while a slow or failing
//! handler never holds up the publisher or other subscribers.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::error::ExtensionError;

/// Subscription pattern matching every topic.
pub const WILDCARD: &str = "*";

/// Source identifier for events published by the host itself.
pub const HOST_SOURCE: &str = "host";

pub const CHAT_MESSAGE_RECEIVED: &str = "chat.message.received";
pub const CHAT_MESSAGE_SEND: &str = "chat.message.send";
pub const CHAT_COMMAND_PREFIX: &str = "chat.command.";
pub const STREAM_STARTED: &str = "stream.started";
pub const STREAM_ENDED: &str = "stream.ended";
pub const STREAM_METADATA_UPDATED: &str = "stream.metadata.updated";
pub const UI_PANEL_REGISTERED: &str = "ui.panel.registered";
pub const UI_PANEL_REMOVED: &str = "ui.panel.removed";
pub const EXTENSION_STATE_CHANGED: &str = "extension.state_changed";

/// Topics the host itself publishes.
pub const KNOWN_TOPICS: &[&str] = &[
    CHAT_MESSAGE_RECEIVED,
    CHAT_MESSAGE_SEND,
    STREAM_STARTED,
    STREAM_ENDED,
    STREAM_METADATA_UPDATED,
    UI_PANEL_REGISTERED,
    UI_PANEL_REMOVED,
    EXTENSION_STATE_CHANGED,
];

const MAX_TOPIC_LEN: usize = 128;

/// Validate a topic name or the wildcard pattern.
///
/// Topics are dot-separated segments of ASCII letters, digits, `_`, `-`
/// and `:`.
pub fn validate_topic(topic: &str) -> Result<(), ExtensionError> {
    if topic == WILDCARD {
        return Ok(());
    }
    if topic.is_empty() || topic.len() > MAX_TOPIC_LEN {
        return Err(ExtensionError::InvalidTopic(format!(
            "topic must be 1-{MAX_TOPIC_LEN} characters: '{topic}'"
        )));
    }
    for segment in topic.split('.') {
        if segment.is_empty() {
            return Err(ExtensionError::InvalidTopic(format!(
                "empty segment in topic '{topic}'"
            )));
        }
        if let Some(ch) = segment
            .chars()
            .find(|c| !c.is_ascii_alphanumeric() && !matches!(c, '_' | '-' | ':'))
        {
            return Err(ExtensionError::InvalidTopic(format!(
                "topic '{topic}' contains invalid character '{ch}'"
            )));
        }
    }
    Ok(())
}

fn pattern_matches(pattern: &str, topic: &str) -> bool {
    pattern == WILDCARD || pattern == topic
}

// ─── Event ──────────────────────────────────────────────────────────────

/// A fact published on the bus. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    topic: String,
    payload: serde_json::Map<String, serde_json::Value>,
    source: String,
    timestamp: DateTime<Utc>,
}

impl Event {
    /// Create a host-sourced event.
    pub fn new(
        topic: impl Into<String>,
        payload: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            topic: topic.into(),
            payload,
            source: HOST_SOURCE.to_string(),
            timestamp: Utc::now(),
        }
    }

    /// Create an event from any JSON value.
    ///
    /// Objects become the payload as-is; other values are stored under `value`.
    pub fn from_value(topic: impl Into<String>, value: serde_json::Value) -> Self {
        let payload = match value {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".into(), other);
                map
            }
        };
        Self::new(topic, payload)
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.payload
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.payload.get(key)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

// ─── Handlers & subscriptions ───────────────────────────────────────────

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), ExtensionError>> + Send>>;

/// Callback invoked once per delivered event.
pub type EventHandler = Arc<dyn Fn(Arc<Event>) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure as an [`EventHandler`].
pub fn handler<F, Fut>(f: F) -> EventHandler
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ExtensionError>> + Send + 'static,
{
    Arc::new(move |event| Box::pin(f(event)) as HandlerFuture)
}

/// Opaque token identifying a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

struct Subscription {
    pattern: String,
    owner: Option<String>,
    queue: mpsc::UnboundedSender<Arc<Event>>,
    /// `true` while dispatch may begin. Closed under the write lock on removal.
    gate: Arc<RwLock<bool>>,
}

/// Introspection row for a live subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub pattern: String,
    pub owner: Option<String>,
}

// ─── Bus ────────────────────────────────────────────────────────────────

/// Topic-based publish/subscribe channel shared by host and extensions.
#[derive(Default)]
pub struct EventBus {
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `pattern` (an exact topic or `*`).
    ///
    /// `owner` is the extension identifier, or `None` for the host.
    pub async fn subscribe(
        &self,
        pattern: &str,
        owner: Option<&str>,
        handler: EventHandler,
    ) -> Result<SubscriptionId, ExtensionError> {
        validate_topic(pattern)?;

        let id = SubscriptionId::new();
        let (queue, rx) = mpsc::unbounded_channel();
        let gate = Arc::new(RwLock::new(true));

        tokio::spawn(run_subscriber(
            id,
            pattern.to_string(),
            rx,
            Arc::clone(&gate),
            handler,
        ));

        self.subscriptions.write().await.insert(
            id,
            Subscription {
                pattern: pattern.to_string(),
                owner: owner.map(str::to_string),
                queue,
                gate,
            },
        );

        tracing::debug!(
            subscription = %id,
            pattern = %pattern,
            owner = owner.unwrap_or(HOST_SOURCE),
            "subscribed"
        );
        Ok(id)
    }

    /// Remove a subscription. No dispatch to it begins after this returns.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), ExtensionError> {
        let removed = self
            .subscriptions
            .write()
            .await
            .remove(&id)
            .ok_or(ExtensionError::SubscriptionNotFound(id.as_uuid()))?;
        close(removed).await;
        tracing::debug!(subscription = %id, "unsubscribed");
        Ok(())
    }

    /// Remove a subscription only if `owner` created it.
    pub async fn unsubscribe_owned(
        &self,
        owner: &str,
        id: SubscriptionId,
    ) -> Result<(), ExtensionError> {
        let removed = {
            let mut subs = self.subscriptions.write().await;
            match subs.get(&id) {
                Some(sub) if sub.owner.as_deref() == Some(owner) => subs.remove(&id),
                _ => None,
            }
        };
        match removed {
            Some(sub) => {
                close(sub).await;
                Ok(())
            }
            None => Err(ExtensionError::SubscriptionNotFound(id.as_uuid())),
        }
    }

    /// Force-remove every subscription owned by `owner`. Returns how many.
    pub async fn unsubscribe_owner(&self, owner: &str) -> usize {
        let removed: Vec<Subscription> = {
            let mut subs = self.subscriptions.write().await;
            let ids: Vec<SubscriptionId> = subs
                .iter()
                .filter(|(_, s)| s.owner.as_deref() == Some(owner))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| subs.remove(&id)).collect()
        };

        let count = removed.len();
        for sub in removed {
            close(sub).await;
        }
        if count > 0 {
            tracing::debug!(owner = %owner, count, "removed owner subscriptions");
        }
        count
    }

    /// Publish an event to every matching subscription.
    ///
    /// Returns the number of subscriptions the event was queued for. Never
    /// waits on handlers.
    pub async fn publish(&self, event: Event) -> usize {
        let event = Arc::new(event);
        let subs = self.subscriptions.read().await;

        let mut queued = 0;
        for sub in subs.values() {
            if pattern_matches(&sub.pattern, event.topic())
                && sub.queue.send(Arc::clone(&event)).is_ok()
            {
                queued += 1;
            }
        }

        if queued == 0 {
            tracing::trace!(topic = %event.topic(), "no subscribers, event dropped");
        }
        queued
    }

    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    /// Live subscriptions owned by `owner`.
    pub async fn subscriptions_of(&self, owner: &str) -> Vec<SubscriptionInfo> {
        self.subscriptions
            .read()
            .await
            .iter()
            .filter(|(_, s)| s.owner.as_deref() == Some(owner))
            .map(|(id, s)| SubscriptionInfo {
                id: *id,
                pattern: s.pattern.clone(),
                owner: s.owner.clone(),
            })
            .collect()
    }
}

async fn close(sub: Subscription) {
    *sub.gate.write().await = false;
    // Dropping `sub.queue` ends the subscriber task once it drains.
}

/// Run `fut` only if `gate` is still open.
///
/// The first poll happens under the read guard, so once `close` has taken
/// the write lock no handler body can begin. Later polls run unguarded;
/// a handler that awaits its own unsubscribe does not deadlock.
async fn gated(gate: Arc<RwLock<bool>>, mut fut: HandlerFuture) -> Result<(), ExtensionError> {
    let first = {
        let open = gate.read().await;
        if !*open {
            return Ok(());
        }
        std::future::poll_fn(|cx| {
            Poll::Ready(match fut.as_mut().poll(cx) {
                Poll::Ready(result) => Some(result),
                Poll::Pending => None,
            })
        })
        .await
    };
    match first {
        Some(result) => result,
        None => fut.await,
    }
}

async fn run_subscriber(
    id: SubscriptionId,
    pattern: String,
    mut rx: mpsc::UnboundedReceiver<Arc<Event>>,
    gate: Arc<RwLock<bool>>,
    handler: EventHandler,
) {
    while let Some(event) = rx.recv().await {
        if !*gate.read().await {
            break;
        }
        let fut = gated(Arc::clone(&gate), handler(Arc::clone(&event)));

        match tokio::spawn(fut).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(
                    subscription = %id,
                    pattern = %pattern,
                    topic = %event.topic(),
                    "event handler failed: {e}"
                );
            }
            Err(e) => {
                tracing::error!(
                    subscription = %id,
                    pattern = %pattern,
                    topic = %event.topic(),
                    "event handler panicked: {e}"
                );
            }
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    fn recording(tx: mpsc::UnboundedSender<Arc<Event>>) -> EventHandler {
        handler(move |event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event);
                Ok(())
            }
        })
    }

    fn counting(counter: Arc<AtomicUsize>) -> EventHandler {
        handler(move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    fn chat_event(text: &str) -> Event {
        Event::from_value(CHAT_MESSAGE_RECEIVED, serde_json::json!({ "text": text }))
    }

    #[test]
    fn test_validate_topic() {
        assert!(validate_topic("*").is_ok());
        assert!(validate_topic("chat.message.received").is_ok());
        assert!(validate_topic("chat.command.so-cool_1").is_ok());
        assert!(validate_topic("x").is_ok());
        assert!(validate_topic("").is_err());
        assert!(validate_topic("chat..message").is_err());
        assert!(validate_topic(".chat").is_err());
        assert!(validate_topic("chat message").is_err());
        assert!(validate_topic("chat.*").is_err());
        assert!(validate_topic(&"a".repeat(129)).is_err());
    }

    #[test]
    fn test_event_from_value() {
        let event = Event::from_value("stream.started", serde_json::json!({"title": "hi"}));
        assert_eq!(event.topic(), "stream.started");
        assert_eq!(event.get("title").unwrap(), "hi");
        assert_eq!(event.source(), HOST_SOURCE);

        let scalar = Event::from_value("x.y", serde_json::json!(42)).with_source("ext");
        assert_eq!(scalar.get("value").unwrap(), 42);
        assert_eq!(scalar.source(), "ext");

        assert!(Event::from_value("x.y", serde_json::Value::Null)
            .payload()
            .is_empty());
    }

    #[tokio::test]
    async fn test_exact_and_wildcard_delivery() {
        let bus = EventBus::new();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let (c_tx, mut c_rx) = mpsc::unbounded_channel();

        bus.subscribe(CHAT_MESSAGE_RECEIVED, Some("a"), recording(a_tx))
            .await
            .unwrap();
        bus.subscribe(STREAM_STARTED, Some("b"), recording(b_tx))
            .await
            .unwrap();
        bus.subscribe(WILDCARD, Some("c"), recording(c_tx))
            .await
            .unwrap();

        let queued = bus.publish(chat_event("hi")).await;
        assert_eq!(queued, 2);

        let a = tokio::time::timeout(Duration::from_secs(1), a_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let c = tokio::time::timeout(Duration::from_secs(1), c_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(a.get("text").unwrap(), "hi");
        assert_eq!(c.topic(), CHAT_MESSAGE_RECEIVED);

        settle().await;
        assert!(b_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_dropped() {
        let bus = EventBus::new();
        assert_eq!(bus.publish(chat_event("nobody")).await, 0);
    }

    #[tokio::test]
    async fn test_per_subscriber_fifo() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let h = handler(move |event: Arc<Event>| {
            let tx = tx.clone();
            async move {
                // Interleave with other tasks to shake out reordering.
                tokio::task::yield_now().await;
                let _ = tx.send(event.get("n").and_then(|v| v.as_u64()).unwrap_or(0));
                Ok(())
            }
        });
        bus.subscribe("seq.test", None, h).await.unwrap();

        for n in 0..100u64 {
            bus.publish(Event::from_value("seq.test", serde_json::json!({ "n": n })))
                .await;
        }

        let mut seen = Vec::new();
        while seen.len() < 100 {
            let n = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            seen.push(n);
        }
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_slow_handler_does_not_block_others() {
        let bus = EventBus::new();
        let release = Arc::new(Notify::new());

        let blocker = {
            let release = Arc::clone(&release);
            handler(move |_| {
                let release = Arc::clone(&release);
                async move {
                    release.notified().await;
                    Ok(())
                }
            })
        };
        bus.subscribe(CHAT_MESSAGE_RECEIVED, Some("slow"), blocker)
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(CHAT_MESSAGE_RECEIVED, Some("fast"), recording(tx))
            .await
            .unwrap();

        for i in 0..3 {
            bus.publish(chat_event(&format!("m{i}"))).await;
        }
        for _ in 0..3 {
            tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
        }
        release.notify_waiters();
    }

    #[tokio::test]
    async fn test_failing_and_panicking_handlers_keep_running() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let h = {
            let calls = Arc::clone(&calls);
            handler(move |event: Arc<Event>| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    match event.get("text").and_then(|v| v.as_str()) {
                        Some("fail") => Err(ExtensionError::handler("nope")),
                        Some("panic") => panic!("handler blew up"),
                        _ => Ok(()),
                    }
                }
            })
        };
        bus.subscribe(CHAT_MESSAGE_RECEIVED, None, h).await.unwrap();

        bus.publish(chat_event("fail")).await;
        bus.publish(chat_event("panic")).await;
        bus.publish(chat_event("ok")).await;
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_event() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        bus.publish(chat_event("early")).await;
        bus.subscribe(CHAT_MESSAGE_RECEIVED, None, counting(Arc::clone(&counter)))
            .await
            .unwrap();
        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_no_dispatch_after_unsubscribe_returns() {
        let bus = EventBus::new();
        let release = Arc::new(Notify::new());
        let started = Arc::new(AtomicUsize::new(0));

        let h = {
            let release = Arc::clone(&release);
            let started = Arc::clone(&started);
            handler(move |_| {
                let release = Arc::clone(&release);
                let started = Arc::clone(&started);
                async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    release.notified().await;
                    Ok(())
                }
            })
        };
        let id = bus.subscribe(CHAT_MESSAGE_RECEIVED, None, h).await.unwrap();

        for i in 0..3 {
            bus.publish(chat_event(&format!("m{i}"))).await;
        }
        settle().await;
        assert_eq!(started.load(Ordering::SeqCst), 1);

        bus.unsubscribe(id).await.unwrap();
        // The in-flight handler may finish; queued events never start.
        release.notify_waiters();
        settle().await;
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(bus.publish(chat_event("after")).await, 0);
    }

    #[tokio::test]
    async fn test_gated_handler_skips_body_once_closed() {
        let ran = Arc::new(AtomicUsize::new(0));
        let h = {
            let ran = Arc::clone(&ran);
            handler(move |_| {
                let ran = Arc::clone(&ran);
                async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
        };
        let gate = Arc::new(RwLock::new(true));

        // Built while open, first polled after the gate closed.
        let late = gated(Arc::clone(&gate), h(Arc::new(chat_event("late"))));
        *gate.write().await = false;
        late.await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        let open = Arc::new(RwLock::new(true));
        gated(open, h(Arc::new(chat_event("ok")))).await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handler_can_unsubscribe_itself() {
        let bus = Arc::new(EventBus::new());
        let own_id = Arc::new(std::sync::Mutex::new(None::<SubscriptionId>));
        let done = Arc::new(Notify::new());
        let h = {
            let bus = Arc::clone(&bus);
            let own_id = Arc::clone(&own_id);
            let done = Arc::clone(&done);
            handler(move |_| {
                let bus = Arc::clone(&bus);
                let id = *own_id.lock().unwrap();
                let done = Arc::clone(&done);
                async move {
                    if let Some(id) = id {
                        bus.unsubscribe(id).await?;
                    }
                    done.notify_one();
                    Ok(())
                }
            })
        };
        let id = bus.subscribe(CHAT_MESSAGE_RECEIVED, None, h).await.unwrap();
        *own_id.lock().unwrap() = Some(id);

        bus.publish(chat_event("bye")).await;
        tokio::time::timeout(Duration::from_secs(2), done.notified())
            .await
            .unwrap();
        assert_eq!(bus.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_id() {
        let bus = EventBus::new();
        let err = bus.unsubscribe(SubscriptionId::new()).await.unwrap_err();
        assert!(matches!(err, ExtensionError::SubscriptionNotFound(_)));
    }

    #[tokio::test]
    async fn test_unsubscribe_owned_rejects_foreign_id() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let id = bus
            .subscribe("x.y", Some("alpha"), counting(Arc::clone(&counter)))
            .await
            .unwrap();

        assert!(bus.unsubscribe_owned("beta", id).await.is_err());
        assert_eq!(bus.subscription_count().await, 1);
        bus.unsubscribe_owned("alpha", id).await.unwrap();
        assert_eq!(bus.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_owner_removes_all_owned() {
        let bus = EventBus::new();
        let owned = Arc::new(AtomicUsize::new(0));
        let other = Arc::new(AtomicUsize::new(0));

        bus.subscribe("x", Some("x-ext"), counting(Arc::clone(&owned)))
            .await
            .unwrap();
        bus.subscribe(WILDCARD, Some("x-ext"), counting(Arc::clone(&owned)))
            .await
            .unwrap();
        bus.subscribe("x", Some("other"), counting(Arc::clone(&other)))
            .await
            .unwrap();

        assert_eq!(bus.subscriptions_of("x-ext").await.len(), 2);
        assert_eq!(bus.unsubscribe_owner("x-ext").await, 2);
        assert!(bus.subscriptions_of("x-ext").await.is_empty());

        assert_eq!(bus.publish(Event::new("x", Default::default())).await, 1);
        settle().await;
        assert_eq!(owned.load(Ordering::SeqCst), 0);
        assert_eq!(other.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_subscribe_invalid_topic() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let err = bus
            .subscribe("bad topic", None, counting(counter))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtensionError::InvalidTopic(_)));
    }
}
