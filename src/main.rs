use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use session_worker::config::WorkerConfig;
use session_worker::coordinator::HttpRecordClient;
use session_worker::handlers::HandlerDeps;
use session_worker::transfer::HttpConnectorFactory;
use session_worker::worker::Worker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let config = WorkerConfig::from_env().context("invalid worker configuration")?;

    eprintln!("session-worker v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Worker: {}", config.worker_name);
    eprintln!("   Coordinator: {}", config.coordinator_url);

    let records = HttpRecordClient::from_config(&config)
        .context("failed to build coordinator client")?;
    let deps = HandlerDeps::new(Arc::new(records), Arc::new(HttpConnectorFactory), config);
    let worker = Worker::new(deps);

    let shutdown = worker.shutdown_handle();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            return;
        }
        tracing::info!("Ctrl-C received, stopping handlers");
        shutdown.stop();
    });

    let states = worker.run().await;
    tracing::info!(handlers = states.len(), "Worker stopped");
    Ok(())
}

/// Console logging, plus a daily rolling file under `WORKER_LOG_DIR` when set.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match std::env::var("WORKER_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir.trim(), "session-worker.log");
            let (file, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_writer(std::io::stderr.and(file)),
                )
                .init();
            Some(guard)
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
            None
        }
    }
}
