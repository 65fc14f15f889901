//! Native extensions compiled into the host.
//!
//! A bundle selects one by naming it in `main`, e.g.
//!
//! ```toml
//! identifier = "echo"
//! name = "Echo"
//! version = "1.0.0"
//! author = "StreamShell"
//! main = "builtin-echo"
//! permissions = ["chat:read", "chat:write"]
//! ```

use async_trait::async_trait;
use streamshell_extensions::{
    handler, Extension, ExtensionError, ExtensionHost, ExtensionLoader, ExtensionManifest,
};

pub const ECHO: &str = "builtin-echo";

pub fn register(loader: &ExtensionLoader) {
    loader.register_fn(ECHO, |manifest: &ExtensionManifest| {
        tracing::debug!(extension = %manifest.identifier, "building echo extension");
        Ok(Box::new(Echo) as Box<dyn Extension>)
    });
}

/// Replies to `!echo <text>` with `<text>`.
struct Echo;

#[async_trait]
impl Extension for Echo {
    async fn activate(&mut self, host: &ExtensionHost) -> Result<(), ExtensionError> {
        let replier = host.clone();
        host.register_command(
            "echo",
            handler(move |event| {
                let replier = replier.clone();
                async move {
                    let text = event
                        .get("args")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    if text.trim().is_empty() {
                        return Ok(());
                    }
                    replier.send_chat_message(&text).await?;
                    Ok(())
                }
            }),
        )
        .await?;
        Ok(())
    }
}
