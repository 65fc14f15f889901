use std::process::ExitCode;

use streamshell_extensions::events::{self, Event};
use streamshell_extensions::{handler, ExtensionContext, RuntimeConfig};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod builtin;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = RuntimeConfig::from_env();
    tracing::info!(
        extensions = %config.extension_dir.display(),
        storage = %config.storage_dir.display(),
        hot_reload = config.hot_reload,
        "starting extension host"
    );

    let ctx = ExtensionContext::new(&config);
    builtin::register(ctx.loader());

    // Outbound chat has no transport here, print it.
    let chat_sink = ctx
        .bus()
        .subscribe(
            events::CHAT_MESSAGE_SEND,
            None,
            handler(|event| async move {
                tracing::info!(
                    source = %event.source(),
                    message = %serde_json::Value::Object(event.payload().clone()),
                    "chat message"
                );
                Ok(())
            }),
        )
        .await;
    if let Err(e) = chat_sink {
        tracing::error!(error = %e, "failed to attach chat sink");
        return ExitCode::FAILURE;
    }
    if let Err(e) = ctx.start_command_dispatch().await {
        tracing::error!(error = %e, prefix = %config.command_prefix, "failed to attach command dispatcher");
        return ExitCode::FAILURE;
    }

    let controller = ctx.controller();
    if let Err(e) = tokio::fs::create_dir_all(controller.root()).await {
        tracing::error!(error = %e, root = %controller.root().display(), "cannot create extension root");
        return ExitCode::FAILURE;
    }

    match controller.discover().await {
        Ok(report) => {
            for failure in &report.failures {
                tracing::warn!(
                    bundle = %failure.bundle.display(),
                    error = %failure.error,
                    "skipping bundle"
                );
            }
            tracing::info!(count = report.discovered.len(), "discovered extensions");
        }
        Err(e) => {
            tracing::error!(error = %e, "extension discovery failed");
            return ExitCode::FAILURE;
        }
    }

    let loaded = controller.load_all().await;
    log_failures("load", &loaded);
    if config.auto_activate {
        let activated = controller.activate_all().await;
        log_failures("activate", &activated);
    }

    let watcher = if config.hot_reload {
        match ctx.start_watcher() {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                tracing::warn!(error = %e, "hot reload unavailable");
                None
            }
        }
    } else {
        None
    };

    ctx.bus()
        .publish(Event::from_value(
            events::STREAM_STARTED,
            serde_json::json!({ "host": env!("CARGO_PKG_NAME") }),
        ))
        .await;

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
    tracing::info!("shutting down");

    if let Some(watcher) = watcher {
        watcher.stop().await;
    }
    ctx.bus()
        .publish(Event::new(events::STREAM_ENDED, Default::default()))
        .await;

    let report = controller.shutdown().await;
    log_failures("unload", &report);
    if report.failed.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn log_failures(stage: &str, report: &streamshell_extensions::BatchReport) {
    for failure in &report.failed {
        tracing::error!(
            extension = %failure.identifier,
            error = %failure.error,
            stage,
            "extension operation failed"
        );
    }
    tracing::info!(stage, succeeded = report.succeeded.len(), "batch complete");
}
