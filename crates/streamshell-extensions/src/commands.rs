//! Chat command dispatch.
//!
//! Viewers type commands such as `!roll 2d6` into chat. The host hears them
//! as `chat.message.received`; the dispatcher turns each prefixed message
//! into a `chat.command.<name>` event carrying the argument text, which is
//! what [`ExtensionHost::register_command`](crate::ExtensionHost::register_command)
//! subscribes to.

use std::sync::{Arc, Weak};

use crate::error::ExtensionError;
use crate::events::{self, handler, Event, EventBus, SubscriptionId};

/// Longest accepted command name.
pub const MAX_COMMAND_NAME_LEN: usize = 32;

/// A chat message split into command name and argument text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedCommand<'a> {
    pub name: &'a str,
    pub args: &'a str,
}

/// Lowercase letters, digits, `-` and `_`, at most 32 characters.
pub fn is_valid_command_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_COMMAND_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

/// Topic a command named `name` is delivered on.
pub fn command_topic(name: &str) -> String {
    format!("{}{name}", events::CHAT_COMMAND_PREFIX)
}

/// Split `text` into a command when it starts with `prefix`.
///
/// Returns `None` for plain chat, an empty prefix, or a name that is not a
/// valid command name.
pub fn parse_command<'a>(text: &'a str, prefix: &str) -> Option<ParsedCommand<'a>> {
    if prefix.is_empty() {
        return None;
    }
    let rest = text.trim().strip_prefix(prefix)?;

    let mut parts = rest.splitn(2, char::is_whitespace);
    let name = parts.next().unwrap_or_default();
    let args = parts.next().map(str::trim).unwrap_or_default();
    if !is_valid_command_name(name) {
        return None;
    }
    Some(ParsedCommand { name, args })
}

/// Subscribe a host-owned dispatcher on `chat.message.received`.
///
/// Each message whose `text` parses as a command is republished from the
/// host as `chat.command.<name>` with `name`, `args`, `text` and, when the
/// message carried one, `user`.
pub async fn attach_dispatcher(
    bus: &Arc<EventBus>,
    prefix: &str,
) -> Result<SubscriptionId, ExtensionError> {
    if prefix.is_empty() || prefix.chars().any(char::is_whitespace) {
        return Err(ExtensionError::HostFunction(format!(
            "invalid command prefix: '{prefix}'"
        )));
    }

    // Weak: the bus owns this handler.
    let weak: Weak<EventBus> = Arc::downgrade(bus);
    let label = prefix.to_string();
    let prefix = prefix.to_string();
    let dispatch = handler(move |event: Arc<Event>| {
        let weak = weak.clone();
        let prefix = prefix.clone();
        async move {
            let Some(bus) = weak.upgrade() else {
                return Ok(());
            };
            let Some(text) = event.get("text").and_then(|v| v.as_str()) else {
                return Ok(());
            };
            let Some(command) = parse_command(text, &prefix) else {
                return Ok(());
            };

            let mut payload = serde_json::Map::new();
            payload.insert("name".into(), command.name.into());
            payload.insert("args".into(), command.args.into());
            payload.insert("text".into(), text.into());
            if let Some(user) = event.get("user") {
                payload.insert("user".into(), user.clone());
            }

            let delivered = bus
                .publish(Event::new(command_topic(command.name), payload))
                .await;
            tracing::debug!(command = %command.name, delivered, "chat command dispatched");
            Ok(())
        }
    });

    let id = bus
        .subscribe(events::CHAT_MESSAGE_RECEIVED, None, dispatch)
        .await?;
    tracing::info!(prefix = %label, "chat command dispatcher attached");
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn chat(text: &str) -> Event {
        Event::from_value(
            events::CHAT_MESSAGE_RECEIVED,
            serde_json::json!({ "text": text, "user": "viewer42" }),
        )
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(
            parse_command("!roll 2d6", "!"),
            Some(ParsedCommand { name: "roll", args: "2d6" })
        );
        assert_eq!(
            parse_command("  !so   streamer one  ", "!"),
            Some(ParsedCommand { name: "so", args: "streamer one" })
        );
        assert_eq!(
            parse_command("!uptime", "!"),
            Some(ParsedCommand { name: "uptime", args: "" })
        );
        assert_eq!(
            parse_command("::echo hi", "::"),
            Some(ParsedCommand { name: "echo", args: "hi" })
        );
    }

    #[test]
    fn test_parse_command_ignores_plain_chat() {
        assert_eq!(parse_command("hello !roll", "!"), None);
        assert_eq!(parse_command("!", "!"), None);
        assert_eq!(parse_command("! roll", "!"), None);
        assert_eq!(parse_command("!Roll", "!"), None);
        assert_eq!(parse_command("!roll", ""), None);
        assert_eq!(parse_command(&format!("!{}", "a".repeat(33)), "!"), None);
    }

    #[test]
    fn test_command_names() {
        assert!(is_valid_command_name("echo"));
        assert!(is_valid_command_name("so-cool_2"));
        assert!(!is_valid_command_name(""));
        assert!(!is_valid_command_name("has space"));
        assert!(!is_valid_command_name("dot.ted"));
        assert_eq!(command_topic("echo"), "chat.command.echo");
    }

    #[tokio::test]
    async fn test_dispatcher_republishes_commands() {
        let bus = Arc::new(EventBus::new());
        attach_dispatcher(&bus, "!").await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(
            "chat.command.roll",
            None,
            handler(move |event| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(event);
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();

        bus.publish(chat("good game")).await;
        bus.publish(chat("!roll 2d6")).await;

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.topic(), "chat.command.roll");
        assert_eq!(event.source(), events::HOST_SOURCE);
        assert_eq!(event.get("name").unwrap(), "roll");
        assert_eq!(event.get("args").unwrap(), "2d6");
        assert_eq!(event.get("text").unwrap(), "!roll 2d6");
        assert_eq!(event.get("user").unwrap(), "viewer42");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dispatcher_rejects_bad_prefix() {
        let bus = Arc::new(EventBus::new());
        assert!(attach_dispatcher(&bus, "").await.is_err());
        assert!(attach_dispatcher(&bus, "! ").await.is_err());
        assert_eq!(bus.subscription_count().await, 0);
    }
}
